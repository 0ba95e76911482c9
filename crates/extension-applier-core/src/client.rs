//! The object-client capability (§6): list/apply/delete/status-write
//! operations over `Revision` documents, plus the error classification the
//! Applier's state machine branches on (`ImmutableFieldError`,
//! `NotFoundError`).
//!
//! Ships both the trait and, behind the `kube-client` feature, a default
//! implementation backed by `kube::Api` against a dynamic
//! `ClusterExtensionRevision` custom resource — mirroring the teacher's
//! habit of pairing a capability trait with a `kube`-backed implementation
//! in the same module (`stackable-operator`'s `ClusterResources`).


use std::collections::BTreeMap;

use snafu::Snafu;

use crate::revision::Revision;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// The error kinds a `RevisionClient` call can fail with. `ImmutableField`
/// and `NotFound` are recovered from on the paths the Applier and Migrator
/// anticipate; everything else is fatal.
#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("server rejected apply: immutable field changed: {message}"))]
    ImmutableField { message: String },

    #[snafu(display("revision not found"))]
    NotFound,

    #[snafu(display("revision client call failed: {message}"))]
    Other { message: String },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound)
    }

    pub fn is_immutable_field(&self) -> bool {
        matches!(self, ClientError::ImmutableField { .. })
    }
}

/// The capability the Applier and Migrator use to read and write
/// `Revision` objects. Every method is a suspension point (§5); no lock is
/// held across any of these calls.
#[async_trait::async_trait]
pub trait RevisionClient: Send + Sync {
    /// Revisions for `owner_name`, in no particular order — callers sort.
    async fn list_revisions(&self, owner_name: &str) -> Result<Vec<Revision>>;

    async fn get_revision(&self, name: &str) -> Result<Revision>;

    /// Server-side apply with `force` ownership under `field_owner`. On the
    /// in-place upsert path this is how the `ImmutableField` signal is
    /// surfaced; on the create path this both creates and is idempotent on
    /// retry.
    async fn apply_revision(&self, revision: &Revision, field_owner: &str) -> Result<()>;

    /// Tolerant of not-found: callers should treat `Err(NotFound)` here the
    /// same as success (retention's delete-is-idempotent contract).
    async fn delete_revision(&self, name: &str) -> Result<()>;

    /// Writes only `status`, through the status subresource.
    async fn update_revision_status(&self, revision: &Revision) -> Result<()>;
}

/// An in-memory `RevisionClient` for tests: no real cluster, just a map
/// keyed by revision name plus a toggle simulating the server's
/// phases-are-immutable rejection.
#[cfg(any(test, feature = "test-fixtures"))]
#[derive(Default)]
pub struct FakeRevisionClient {
    revisions: std::sync::Mutex<BTreeMap<String, Revision>>,
}

#[cfg(any(test, feature = "test-fixtures"))]
impl FakeRevisionClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(revisions: impl IntoIterator<Item = Revision>) -> Self {
        let client = Self::new();
        {
            let mut map = client.revisions.lock().expect("lock poisoned");
            for revision in revisions {
                map.insert(revision.name.clone(), revision);
            }
        }
        client
    }

    pub fn snapshot(&self) -> Vec<Revision> {
        self.revisions.lock().expect("lock poisoned").values().cloned().collect()
    }
}

#[cfg(any(test, feature = "test-fixtures"))]
#[async_trait::async_trait]
impl RevisionClient for FakeRevisionClient {
    async fn list_revisions(&self, owner_name: &str) -> Result<Vec<Revision>> {
        Ok(self
            .revisions
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|revision| revision.owner_name == owner_name)
            .cloned()
            .collect())
    }

    async fn get_revision(&self, name: &str) -> Result<Revision> {
        self.revisions
            .lock()
            .expect("lock poisoned")
            .get(name)
            .cloned()
            .ok_or(ClientError::NotFound)
    }

    async fn apply_revision(&self, revision: &Revision, _field_owner: &str) -> Result<()> {
        let mut map = self.revisions.lock().expect("lock poisoned");
        let mut next = revision.clone();
        match map.get(&revision.name) {
            Some(existing) => {
                if existing.phases != revision.phases {
                    return Err(ClientError::ImmutableField {
                        message: "phases field is immutable".to_string(),
                    });
                }
                // Mirrors k8s: `generation` only bumps on a spec change, not
                // on every write (status writes go through a separate method
                // entirely and never reach this branch).
                let spec_changed = existing.lifecycle_state != revision.lifecycle_state
                    || existing.annotations != revision.annotations
                    || existing.labels != revision.labels
                    || existing.progress_deadline_minutes != revision.progress_deadline_minutes;
                next.generation = if spec_changed {
                    Some(existing.generation.unwrap_or(0) + 1)
                } else {
                    existing.generation
                };
            }
            None => next.generation = Some(1),
        }
        map.insert(revision.name.clone(), next);
        Ok(())
    }

    async fn delete_revision(&self, name: &str) -> Result<()> {
        self.revisions.lock().expect("lock poisoned").remove(name);
        Ok(())
    }

    async fn update_revision_status(&self, revision: &Revision) -> Result<()> {
        let mut map = self.revisions.lock().expect("lock poisoned");
        match map.get_mut(&revision.name) {
            Some(existing) => {
                existing.status = revision.status.clone();
                Ok(())
            }
            None => Err(ClientError::NotFound),
        }
    }
}

#[cfg(feature = "kube-client")]
pub use kube_backed::KubeRevisionClient;

#[cfg(feature = "kube-client")]
mod kube_backed {
    use kube::api::{Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams};
    use kube::core::{GroupVersionKind, TypeMeta};
    use kube::{Client, ResourceExt};

    use super::{ClientError, Result, RevisionClient};
    use crate::constants::{CLUSTER_EXTENSION_API_GROUP, OWNER_NAME_LABEL};
    use crate::revision::Revision;

    const REVISION_KIND: &str = "ClusterExtensionRevision";
    const REVISION_VERSION: &str = "v1";

    /// `RevisionClient` backed by `kube::Api<DynamicObject>` against the
    /// cluster-scoped `ClusterExtensionRevision` custom resource. Dynamic
    /// rather than a generated `k8s_openapi`-style struct because the
    /// revision schema (§3) is owned by this crate, not by a CRD the
    /// cluster publishes into `k8s-openapi`.
    pub struct KubeRevisionClient {
        api: Api<DynamicObject>,
        gvk: GroupVersionKind,
    }

    impl KubeRevisionClient {
        pub fn new(client: Client) -> Self {
            let gvk = GroupVersionKind::gvk(CLUSTER_EXTENSION_API_GROUP, REVISION_VERSION, REVISION_KIND);
            let api_resource = ApiResource::from_gvk(&gvk);
            Self {
                api: Api::all_with(client, &api_resource),
                gvk,
            }
        }

        fn type_meta(&self) -> TypeMeta {
            TypeMeta {
                api_version: format!("{}/{}", self.gvk.group, self.gvk.version),
                kind: self.gvk.kind.clone(),
            }
        }

        fn to_dynamic(&self, revision: &Revision) -> Result<DynamicObject> {
            let data = serde_json::to_value(revision).map_err(|err| ClientError::Other {
                message: err.to_string(),
            })?;

            let mut object = DynamicObject::new(&revision.name, &ApiResource::from_gvk(&self.gvk));
            object.types = Some(self.type_meta());
            object.labels_mut().extend(revision.labels.clone());
            object.annotations_mut().extend(revision.annotations.clone());
            if let Some(owner) = &revision.owner_reference {
                object.owner_references_mut().push(owner.clone());
            }
            object.data = data;
            Ok(object)
        }

        fn from_dynamic(object: DynamicObject) -> Result<Revision> {
            let generation = object.metadata.generation;
            let mut revision: Revision =
                serde_json::from_value(object.data).map_err(|err| ClientError::Other {
                    message: err.to_string(),
                })?;
            revision.generation = generation;
            Ok(revision)
        }

        fn classify(error: kube::Error) -> ClientError {
            match &error {
                kube::Error::Api(response) if response.code == 404 => ClientError::NotFound,
                kube::Error::Api(response) if response.reason == "Invalid" => {
                    ClientError::ImmutableField {
                        message: response.message.clone(),
                    }
                }
                _ => ClientError::Other {
                    message: error.to_string(),
                },
            }
        }
    }

    #[async_trait::async_trait]
    impl RevisionClient for KubeRevisionClient {
        async fn list_revisions(&self, owner_name: &str) -> Result<Vec<Revision>> {
            let params =
                ListParams::default().labels(&format!("{OWNER_NAME_LABEL}={owner_name}"));
            let list = self.api.list(&params).await.map_err(Self::classify)?;
            list.items.into_iter().map(Self::from_dynamic).collect()
        }

        async fn get_revision(&self, name: &str) -> Result<Revision> {
            let object = self.api.get(name).await.map_err(Self::classify)?;
            Self::from_dynamic(object)
        }

        async fn apply_revision(&self, revision: &Revision, field_owner: &str) -> Result<()> {
            let object = self.to_dynamic(revision)?;
            let params = PatchParams::apply(field_owner).force();
            self.api
                .patch(&revision.name, &params, &Patch::Apply(&object))
                .await
                .map_err(Self::classify)?;
            Ok(())
        }

        async fn delete_revision(&self, name: &str) -> Result<()> {
            match self.api.delete(name, &Default::default()).await {
                Ok(_) => Ok(()),
                Err(error) => match Self::classify(error) {
                    ClientError::NotFound => Ok(()),
                    other => Err(other),
                },
            }
        }

        async fn update_revision_status(&self, revision: &Revision) -> Result<()> {
            let object = self.to_dynamic(revision)?;
            let params = PatchParams::apply("extension-applier-core").force();
            self.api
                .patch_status(&revision.name, &params, &Patch::Apply(&object))
                .await
                .map_err(Self::classify)?;
            Ok(())
        }
    }
}
