//! The `Extension` input type and the Revision Generator (§4.3): the two
//! entry points that turn a bundle (or a legacy release) into a candidate
//! [`Revision`] document.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::constants::{
    BUNDLE_NAME_ANNOTATION, BUNDLE_REFERENCE_ANNOTATION, BUNDLE_VERSION_ANNOTATION,
    CLUSTER_EXTENSION_API_GROUP, CLUSTER_EXTENSION_KIND, OLM_PROPERTIES_ANNOTATION,
    OWNER_KIND_LABEL, OWNER_NAME_LABEL, PACKAGE_NAME_ANNOTATION, SERVICE_ACCOUNT_NAME_ANNOTATION,
    SERVICE_ACCOUNT_NAMESPACE_ANNOTATION,
};
use crate::migrate::Release;
use crate::object::{CollisionProtection, Object, RevisionObject};
use crate::phase::{phase_sort, PhaseBody};
use crate::provider::{BundleFs, ManifestProvider, ProviderError};
use crate::sanitize::sanitize;

pub type Result<T, E = RevisionError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum RevisionError {
    #[snafu(display("manifest provider failed"))]
    Provider { source: ProviderError },

    #[snafu(display("legacy release document {index} is not valid JSON/YAML: {source}"))]
    LegacyDocument {
        source: serde_yaml::Error,
        index: usize,
    },
}

/// Coordinates of the service account the extension is installed as.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceAccountRef {
    pub name: String,
    pub namespace: String,
}

/// Whether a pluggable preflight is allowed to reject an install/upgrade.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum EnforcementLevel {
    #[default]
    Enforce,
    None,
}

/// Per-preflight enforcement overrides, keyed by preflight identity (see
/// [`crate::preflight::CRD_UPGRADE_SAFETY_PREFLIGHT_ID`]).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PreflightConfig {
    pub enforcement: BTreeMap<String, EnforcementLevel>,
}

impl PreflightConfig {
    pub fn enforcement_for(&self, preflight_id: &str) -> EnforcementLevel {
        self.enforcement
            .get(preflight_id)
            .copied()
            .unwrap_or_default()
    }
}

/// The user-declared intent this crate drives the cluster towards. Owned
/// and populated by the outer reconciler; the applier core only reads it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub service_account: ServiceAccountRef,
    pub progress_deadline_minutes: Option<u32>,
    pub preflight_config: Option<PreflightConfig>,
    pub config: Option<serde_json::Value>,
}

impl Extension {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, uid: impl Into<String>, service_account: ServiceAccountRef) -> Self {
        Extension {
            name: name.into(),
            namespace: namespace.into(),
            uid: uid.into(),
            service_account,
            progress_deadline_minutes: None,
            preflight_config: None,
            config: None,
        }
    }

    /// `0` means unset; normalized to `None` so downstream code only ever
    /// matches on `Option`.
    pub fn with_progress_deadline_minutes(mut self, minutes: u32) -> Self {
        self.progress_deadline_minutes = (minutes > 0).then_some(minutes);
        self
    }

    /// The recognized `watchNamespace` key of the inline JSON configuration.
    pub fn watch_namespace(&self) -> Option<&str> {
        self.config.as_ref()?.get("watchNamespace")?.as_str()
    }

    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: format!("{CLUSTER_EXTENSION_API_GROUP}/v1"),
            kind: CLUSTER_EXTENSION_KIND.to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// A fully-populated `Extension` for use in unit tests across the
    /// crate; kept here rather than duplicated per test module.
    #[cfg(any(test, feature = "test-fixtures"))]
    pub fn test_fixture() -> Self {
        Extension::new(
            "my-extension",
            "operator-namespace",
            "00000000-0000-0000-0000-000000000001",
            ServiceAccountRef {
                name: "my-extension-installer".to_string(),
                namespace: "operator-namespace".to_string(),
            },
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LifecycleState {
    Active,
    Archived,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub observed_generation: Option<i64>,
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<Time>,
}

pub const SUCCEEDED_CONDITION_TYPE: &str = "Succeeded";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevisionStatus {
    pub conditions: Vec<Condition>,
}

impl RevisionStatus {
    pub fn has_succeeded(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == SUCCEEDED_CONDITION_TYPE && c.status == ConditionStatus::True)
    }
}

/// An immutable snapshot of the manifest set an extension should be
/// rolling out or running, identified by `(owner_name, revision)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub owner_name: String,
    pub name: String,
    pub revision: u64,
    pub lifecycle_state: LifecycleState,
    pub phases: Vec<PhaseBody>,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub progress_deadline_minutes: Option<u32>,
    #[serde(default)]
    pub status: RevisionStatus,
    /// Not part of the CR's own spec/status: carried alongside so the
    /// client layer can set it on the object's `metadata.ownerReferences`
    /// when writing.
    #[serde(skip)]
    #[schemars(skip)]
    pub owner_reference: Option<OwnerReference>,
    /// The object's `metadata.generation` as last read from the cluster.
    /// Not writable by this crate: a `RevisionClient` populates it on
    /// `get_revision`/`list_revisions`, and it flows into the `Succeeded`
    /// condition's `observedGeneration` (§4.6 step 8).
    #[serde(skip)]
    #[schemars(skip)]
    pub generation: Option<i64>,
}

impl Revision {
    pub fn derived_name(owner_name: &str, revision: u64) -> String {
        format!("{owner_name}-{revision}")
    }

    pub fn set_owner(&mut self, ext: &Extension) {
        self.owner_reference = Some(ext.owner_reference());
    }

    pub fn object_count(&self) -> usize {
        self.phases.iter().map(|p| p.objects.len()).sum()
    }

    pub fn is_migrated_from_legacy(&self) -> bool {
        self.labels
            .get(crate::constants::MIGRATED_FROM_LEGACY_LABEL)
            .map(String::as_str)
            == Some("true")
    }
}

fn base_labels(ext: &Extension) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(OWNER_KIND_LABEL.to_string(), CLUSTER_EXTENSION_KIND.to_string());
    labels.insert(OWNER_NAME_LABEL.to_string(), ext.name.clone());
    labels
}

/// Wraps the Manifest Provider plus Sanitizer/Phase Sorter with
/// extension-level metadata to produce candidate [`Revision`] documents.
pub struct RevisionGenerator;

impl RevisionGenerator {
    /// `generateRevision` (§4.3): calls the Manifest Provider, sanitizes and
    /// phase-sorts the result, and stamps on extension-level annotations.
    pub fn generate_revision(
        provider: &dyn ManifestProvider,
        bundle_fs: &dyn BundleFs,
        ext: &Extension,
        object_labels: &BTreeMap<String, String>,
        revision_annotations: &BTreeMap<String, String>,
    ) -> Result<Revision> {
        let objects = provider.get(bundle_fs, ext).context(ProviderSnafu)?;

        let mut annotations = revision_annotations.clone();
        if let Some(properties) = bundle_fs.bundle_annotations().get(OLM_PROPERTIES_ANNOTATION) {
            annotations.insert(OLM_PROPERTIES_ANNOTATION.to_string(), properties.clone());
        }
        annotations.insert(
            SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
            ext.service_account.name.clone(),
        );
        annotations.insert(
            SERVICE_ACCOUNT_NAMESPACE_ANNOTATION.to_string(),
            ext.service_account.namespace.clone(),
        );

        let revision_objects: Vec<RevisionObject> = objects
            .into_iter()
            .map(|object| RevisionObject {
                object: sanitize(object, object_labels),
                collision_protection: CollisionProtection::Strict,
            })
            .collect();

        Ok(Revision {
            owner_name: ext.name.clone(),
            name: String::new(),
            revision: 0,
            lifecycle_state: LifecycleState::Active,
            phases: phase_sort(revision_objects),
            annotations,
            labels: base_labels(ext),
            progress_deadline_minutes: ext.progress_deadline_minutes,
            status: RevisionStatus::default(),
            owner_reference: None,
            generation: None,
        })
    }

    /// `generateRevisionFromLegacyRelease` (§4.3): splits a pre-rendered
    /// release manifest on line boundaries (every non-empty trimmed line is
    /// a self-contained document) and adopts the resulting objects rather
    /// than asserting ownership of them.
    pub fn generate_revision_from_legacy_release(
        release: &Release,
        ext: &Extension,
        object_labels: &BTreeMap<String, String>,
    ) -> Result<Revision> {
        let mut revision_objects = Vec::new();
        for (index, document) in split_legacy_manifest(&release.manifest).into_iter().enumerate() {
            let value: serde_json::Value =
                serde_yaml::from_str(&document).context(LegacyDocumentSnafu { index })?;
            revision_objects.push(RevisionObject {
                object: sanitize(Object::from_value(value), object_labels),
                collision_protection: CollisionProtection::None,
            });
        }

        let mut annotations = BTreeMap::new();
        for (release_label, annotation_key) in [
            ("bundleName", BUNDLE_NAME_ANNOTATION),
            ("packageName", PACKAGE_NAME_ANNOTATION),
            ("bundleVersion", BUNDLE_VERSION_ANNOTATION),
            ("bundleReference", BUNDLE_REFERENCE_ANNOTATION),
        ] {
            if let Some(value) = release.labels.get(release_label) {
                annotations.insert(annotation_key.to_string(), value.clone());
            }
        }

        Ok(Revision {
            owner_name: ext.name.clone(),
            name: Revision::derived_name(&ext.name, 1),
            revision: 1,
            lifecycle_state: LifecycleState::Active,
            phases: phase_sort(revision_objects),
            annotations,
            labels: base_labels(ext),
            progress_deadline_minutes: None,
            status: RevisionStatus::default(),
            owner_reference: None,
            generation: None,
        })
    }
}

/// Splits a legacy release manifest on line boundaries: every non-empty
/// trimmed line is already a self-contained JSON document (§4.3, §9 "Legacy
/// manifest splitting"). Deliberately loose — see the design note in the
/// crate root docs about why this isn't a real YAML document-stream
/// decoder.
fn split_legacy_manifest(manifest: &str) -> Vec<String> {
    manifest
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::ReleaseStatus;
    use crate::provider::{StaticBundleFs, StaticManifestProvider};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn generate_revision_carries_service_account_annotations() {
        let ext = Extension::test_fixture();
        let provider = StaticManifestProvider::new(vec![Object::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
        }))]);

        let revision = RevisionGenerator::generate_revision(
            &provider,
            &StaticBundleFs::default(),
            &ext,
            &BTreeMap::new(),
            &BTreeMap::new(),
        )
        .unwrap();

        assert_eq!(revision.revision, 0);
        assert_eq!(revision.name, "");
        assert_eq!(
            revision.annotations.get(SERVICE_ACCOUNT_NAME_ANNOTATION),
            Some(&ext.service_account.name)
        );
        assert_eq!(revision.object_count(), 1);
        assert_eq!(revision.labels.get(OWNER_NAME_LABEL), Some(&ext.name));
    }

    #[test]
    fn generate_revision_copies_allow_listed_bundle_annotation_only() {
        let ext = Extension::test_fixture();
        let provider = StaticManifestProvider::new(vec![]);
        let mut bundle_annotations = BTreeMap::new();
        bundle_annotations.insert(OLM_PROPERTIES_ANNOTATION.to_string(), "[]".to_string());
        bundle_annotations.insert("some.other/annotation".to_string(), "dropped".to_string());
        let bundle_fs = StaticBundleFs {
            annotations: bundle_annotations,
        };

        let revision = RevisionGenerator::generate_revision(
            &provider,
            &bundle_fs,
            &ext,
            &BTreeMap::new(),
            &BTreeMap::new(),
        )
        .unwrap();

        assert_eq!(
            revision.annotations.get(OLM_PROPERTIES_ANNOTATION),
            Some(&"[]".to_string())
        );
        assert!(!revision.annotations.contains_key("some.other/annotation"));
    }

    #[test]
    fn legacy_release_round_trips_one_object_per_non_empty_line() {
        let ext = Extension::test_fixture();
        let manifest = [
            r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a"}}"#,
            "",
            r#"{"apiVersion":"v1","kind":"Secret","metadata":{"name":"b"}}"#,
            "   ",
        ]
        .join("\n");

        let mut labels = BTreeMap::new();
        labels.insert("bundleName".to_string(), "my-bundle".to_string());
        labels.insert("packageName".to_string(), "my-package".to_string());

        let release = Release {
            manifest,
            labels,
            version: 2,
            status: ReleaseStatus::Deployed,
        };

        let revision =
            RevisionGenerator::generate_revision_from_legacy_release(&release, &ext, &BTreeMap::new())
                .unwrap();

        assert_eq!(revision.revision, 1);
        assert_eq!(revision.name, format!("{}-1", ext.name));
        assert_eq!(revision.object_count(), 2);
        assert_eq!(
            revision.annotations.get(BUNDLE_NAME_ANNOTATION),
            Some(&"my-bundle".to_string())
        );
        assert!(revision
            .phases
            .iter()
            .flat_map(|p| p.objects.iter())
            .all(|o| o.collision_protection == CollisionProtection::None));
    }

    #[test]
    fn progress_deadline_zero_normalizes_to_none() {
        let ext = Extension::test_fixture().with_progress_deadline_minutes(0);
        assert_eq!(ext.progress_deadline_minutes, None);

        let ext = Extension::test_fixture().with_progress_deadline_minutes(30);
        assert_eq!(ext.progress_deadline_minutes, Some(30));
    }
}
