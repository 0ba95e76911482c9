//! The Applier (§4.5): the core state machine. Lists existing revisions,
//! classifies the rollout state against the server's own signal for an
//! immutable-field rejection, runs pre-authorization and preflights, and
//! performs the server-side-apply writes plus retention.

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::PolicyRule;
use snafu::{ResultExt, Snafu};

use crate::client::{ClientError, RevisionClient};
use crate::constants::{
    CLUSTER_EXTENSION_API_GROUP, DEFAULT_RETENTION_LIMIT, FINALIZER_UPDATE_VERB,
    REVISION_FINALIZERS_RESOURCE,
};
use crate::preauth::{format_pre_authorization_error, service_account_user, PreAuthorizationError, PreAuthorizer};
use crate::preflight::{Preflight, PreflightError, CRD_UPGRADE_SAFETY_PREFLIGHT_ID};
use crate::provider::{BundleFs, ManifestProvider};
use crate::revision::{Extension, LifecycleState, Revision, RevisionError, RevisionGenerator};

pub type Result<T, E = ApplyError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum ApplyError {
    #[snafu(display("failed to list existing revisions: {source}"))]
    ListRevisions { source: ClientError },

    #[snafu(display("{message}"))]
    InvariantViolation { message: String },

    #[snafu(context(false))]
    Generate { source: RevisionError },

    #[snafu(context(false))]
    PreAuthorization { source: PreAuthorizationError },

    #[snafu(context(false))]
    Preflight { source: PreflightError },

    #[snafu(display("failed to write revision: {source}"))]
    Client { source: ClientError },

    #[snafu(display("failed to delete archived revision during retention: {source}"))]
    Retention { source: ClientError },
}

/// The second and third elements of the spec's `(rolloutComplete, status,
/// error)` triple — on the success path `status` is always empty, per the
/// "status-message convention" note in §4.5.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub rollout_complete: bool,
    pub status: String,
}

impl ApplyOutcome {
    fn done() -> Self {
        ApplyOutcome {
            rollout_complete: true,
            status: String::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RolloutState {
    NeedsInstall,
    NeedsUpgrade,
    Unchanged,
}

fn finalizer_update_rule(revision_name: &str) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![CLUSTER_EXTENSION_API_GROUP.to_string()]),
        resources: Some(vec![REVISION_FINALIZERS_RESOURCE.to_string()]),
        resource_names: Some(vec![revision_name.to_string()]),
        non_resource_urls: None,
        verbs: vec![FINALIZER_UPDATE_VERB.to_string()],
    }
}

/// Concatenates every object in `revision` as a `---`-delimited YAML
/// document stream, the form the Pre-Authorizer's manifest reader expects.
fn serialize_manifest_stream(revision: &Revision) -> String {
    revision
        .phases
        .iter()
        .flat_map(|phase| phase.objects.iter())
        .map(|revision_object| {
            serde_yaml::to_string(revision_object.object.as_value()).unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join("---\n")
}

fn revisions_to_delete(existing: &[Revision], retention_limit: usize) -> Vec<String> {
    let total = existing.len();
    existing
        .iter()
        .enumerate()
        .filter_map(|(index, revision)| {
            let position_from_end = total - index;
            let beyond_window = position_from_end > retention_limit;
            let archived = revision.lifecycle_state == LifecycleState::Archived;
            (beyond_window && archived).then(|| revision.name.clone())
        })
        .collect()
}

/// The full set of capabilities a single `apply` invocation needs. Grouped
/// into a struct (rather than five-plus positional parameters) matching
/// the teacher's habit of bundling long injected-capability argument lists
/// into a context struct (see `ClusterResources::new`'s builder-style
/// construction).
pub struct ApplyContext<'a> {
    pub client: &'a dyn RevisionClient,
    pub manifest_provider: &'a dyn ManifestProvider,
    pub pre_authorizer: Option<&'a dyn PreAuthorizer>,
    pub preflights: &'a [&'a dyn Preflight],
    pub field_owner: &'a str,
    pub retention_limit: usize,
}

impl<'a> ApplyContext<'a> {
    pub fn new(
        client: &'a dyn RevisionClient,
        manifest_provider: &'a dyn ManifestProvider,
        field_owner: &'a str,
    ) -> Self {
        ApplyContext {
            client,
            manifest_provider,
            pre_authorizer: None,
            preflights: &[],
            field_owner,
            retention_limit: DEFAULT_RETENTION_LIMIT,
        }
    }
}

/// `apply(ctx, bundleFS?, ext, objectLabels, revisionAnnotations)` (§4.5).
pub async fn apply(
    ctx: &ApplyContext<'_>,
    bundle_fs: Option<&dyn BundleFs>,
    ext: &Extension,
    object_labels: &BTreeMap<String, String>,
    revision_annotations: &BTreeMap<String, String>,
) -> Result<ApplyOutcome> {
    // Step 1.
    let mut existing = ctx
        .client
        .list_revisions(&ext.name)
        .await
        .context(ListRevisionsSnafu)?;
    existing.sort_by_key(|revision| revision.revision);

    // Step 2.
    let Some(bundle_fs) = bundle_fs else {
        return if existing.is_empty() {
            InvariantViolationSnafu {
                message: "catalog content unavailable and no revision installed".to_string(),
            }
            .fail()
        } else {
            Ok(ApplyOutcome::done())
        };
    };

    // Step 3.
    let mut desired = RevisionGenerator::generate_revision(
        ctx.manifest_provider,
        bundle_fs,
        ext,
        object_labels,
        revision_annotations,
    )?;

    // Step 4.
    desired.set_owner(ext);

    // Pre-authorization gates every further state transition, including
    // the in-place upsert attempt in step 5: the spec's "given a
    // revision's manifests" contract means this runs against the desired
    // revision generated above, before any write is attempted. The extra
    // finalizers rule is scoped to whichever revision name this reconcile
    // is currently managing: the existing latest revision if one exists,
    // or the prospective first revision name otherwise.
    if let Some(pre_authorizer) = ctx.pre_authorizer {
        let revision_name_for_authz = existing
            .last()
            .map(|revision| revision.name.clone())
            .unwrap_or_else(|| Revision::derived_name(&ext.name, 1));
        let user = service_account_user(&ext.service_account);
        let manifest_stream = serialize_manifest_stream(&desired);
        let extra_rule = finalizer_update_rule(&revision_name_for_authz);

        let outcome = pre_authorizer
            .pre_authorize(&user, &manifest_stream, std::slice::from_ref(&extra_rule))
            .await;
        if let Some(error) = format_pre_authorization_error(&outcome) {
            return Err(error.into());
        }
    }

    // Step 5.
    let state = match existing.last() {
        None => RolloutState::NeedsInstall,
        Some(latest) => {
            let mut upsert = desired.clone();
            upsert.revision = latest.revision;
            upsert.name = latest.name.clone();

            match ctx.client.apply_revision(&upsert, ctx.field_owner).await {
                Ok(()) => RolloutState::Unchanged,
                Err(ClientError::ImmutableField { .. }) => RolloutState::NeedsUpgrade,
                Err(source) => return Err(ApplyError::Client { source }),
            }
        }
    };

    // Step 6.
    if state != RolloutState::Unchanged {
        let objects: Vec<_> = desired
            .phases
            .iter()
            .flat_map(|phase| phase.objects.iter())
            .map(|revision_object| revision_object.object.clone())
            .collect();

        for preflight in ctx.preflights {
            let enforcement = ext
                .preflight_config
                .as_ref()
                .map(|config| config.enforcement_for(preflight.id()))
                .unwrap_or_default();
            if preflight.id() == CRD_UPGRADE_SAFETY_PREFLIGHT_ID
                && enforcement == crate::revision::EnforcementLevel::None
            {
                continue;
            }

            if state == RolloutState::NeedsInstall {
                preflight.install(&objects).await?;
            } else {
                preflight.upgrade(&objects).await?;
            }
        }
    }

    // Step 7.
    if state != RolloutState::Unchanged {
        let new_revision_number = existing.last().map(|r| r.revision).unwrap_or(0) + 1;
        desired.name = Revision::derived_name(&ext.name, new_revision_number);
        desired.revision = new_revision_number;

        for name in revisions_to_delete(&existing, ctx.retention_limit) {
            match ctx.client.delete_revision(&name).await {
                Ok(()) => {}
                Err(ClientError::NotFound) => {}
                Err(source) => return Err(ApplyError::Retention { source }),
            }
        }

        ctx.client
            .apply_revision(&desired, ctx.field_owner)
            .await
            .context(ClientSnafu)?;
    }

    // Step 8.
    Ok(ApplyOutcome::done())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FakeRevisionClient;
    use crate::object::Object;
    use crate::preauth::{PreAuthOutcome, ScopedPolicyRules};
    use crate::preflight::{AlwaysFailPreflight, AlwaysPassPreflight};
    use crate::provider::{StaticBundleFs, StaticManifestProvider};
    use crate::revision::{EnforcementLevel, PreflightConfig, ServiceAccountRef};
    use serde_json::json;

    fn ext() -> Extension {
        Extension::new(
            "my-ext",
            "ns",
            "00000000-0000-0000-0000-000000000001",
            ServiceAccountRef {
                name: "sa".to_string(),
                namespace: "ns".to_string(),
            },
        )
    }

    fn configmap_provider(name: &str) -> StaticManifestProvider {
        StaticManifestProvider::new(vec![Object::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name},
        }))])
    }

    #[tokio::test]
    async fn scenario_1_first_install() {
        let client = FakeRevisionClient::new();
        let provider = configmap_provider("test-cm");
        let ctx = ApplyContext::new(&client, &provider, "extension-applier-core");

        let outcome = apply(&ctx, Some(&StaticBundleFs::default()), &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();

        assert!(outcome.rollout_complete);
        let revisions = client.list_revisions("my-ext").await.unwrap();
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].name, "my-ext-1");
        assert_eq!(revisions[0].revision, 1);
        assert_eq!(revisions[0].phases.len(), 1);
        assert_eq!(revisions[0].phases[0].phase, crate::phase::Phase::Deploy);
        assert!(revisions[0].owner_reference.is_some());
    }

    #[tokio::test]
    async fn scenario_2_no_op_reconcile_keeps_revision_number() {
        let client = FakeRevisionClient::new();
        let provider = configmap_provider("test-cm");
        let ctx = ApplyContext::new(&client, &provider, "extension-applier-core");

        apply(&ctx, Some(&StaticBundleFs::default()), &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();
        apply(&ctx, Some(&StaticBundleFs::default()), &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();

        let revisions = client.list_revisions("my-ext").await.unwrap();
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].name, "my-ext-1");
    }

    #[tokio::test]
    async fn scenario_3_phase_change_upgrade_creates_second_revision() {
        let client = FakeRevisionClient::new();
        let first_provider = configmap_provider("test-cm");
        let ctx = ApplyContext::new(&client, &first_provider, "extension-applier-core");
        apply(&ctx, Some(&StaticBundleFs::default()), &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();

        let second_provider = StaticManifestProvider::new(vec![Object::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "new-secret"},
        }))]);
        let ctx = ApplyContext::new(&client, &second_provider, "extension-applier-core");
        apply(&ctx, Some(&StaticBundleFs::default()), &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();

        let mut revisions = client.list_revisions("my-ext").await.unwrap();
        revisions.sort_by_key(|r| r.revision);
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions[0].name, "my-ext-1");
        assert_eq!(revisions[1].name, "my-ext-2");
        assert_eq!(revisions[1].revision, 2);
    }

    fn archived_revision(owner: &str, revision: u64) -> Revision {
        Revision {
            owner_name: owner.to_string(),
            name: Revision::derived_name(owner, revision),
            revision,
            lifecycle_state: LifecycleState::Archived,
            phases: vec![],
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            progress_deadline_minutes: None,
            status: Default::default(),
            owner_reference: None,
            generation: None,
        }
    }

    #[tokio::test]
    async fn scenario_4_retention_enforcement_deletes_oldest_beyond_window() {
        let client = FakeRevisionClient::seeded((1..=6).map(|n| archived_revision("my-ext", n)));
        let provider = configmap_provider("test-cm");
        let ctx = ApplyContext::new(&client, &provider, "extension-applier-core");

        apply(&ctx, Some(&StaticBundleFs::default()), &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();

        let mut revisions = client.list_revisions("my-ext").await.unwrap();
        revisions.sort_by_key(|r| r.revision);
        let names: Vec<_> = revisions.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names.len(), 6);
        assert!(!names.contains(&"my-ext-1"));
        assert!(names.contains(&"my-ext-7"));
    }

    #[tokio::test]
    async fn scenario_5_active_revisions_survive_retention() {
        let mut seed: Vec<Revision> = (1..=7).map(|n| archived_revision("my-ext", n)).collect();
        seed[1].lifecycle_state = LifecycleState::Active; // rev-2
        seed[3].lifecycle_state = LifecycleState::Active; // rev-4
        let client = FakeRevisionClient::seeded(seed);
        let provider = configmap_provider("test-cm");
        let ctx = ApplyContext::new(&client, &provider, "extension-applier-core");

        apply(&ctx, Some(&StaticBundleFs::default()), &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();

        let revisions = client.list_revisions("my-ext").await.unwrap();
        let names: Vec<_> = revisions.iter().map(|r| r.name.as_str()).collect();
        assert!(!names.contains(&"my-ext-1"));
        assert!(names.contains(&"my-ext-2"));
        assert!(names.contains(&"my-ext-4"));
    }

    #[tokio::test]
    async fn nil_bundle_fs_with_no_revisions_is_an_invariant_violation() {
        let client = FakeRevisionClient::new();
        let provider = configmap_provider("test-cm");
        let ctx = ApplyContext::new(&client, &provider, "extension-applier-core");

        let error = apply(&ctx, None, &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(error, ApplyError::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn nil_bundle_fs_with_existing_revision_is_a_clean_no_op() {
        let client = FakeRevisionClient::new();
        let provider = configmap_provider("test-cm");
        let ctx = ApplyContext::new(&client, &provider, "extension-applier-core");
        apply(&ctx, Some(&StaticBundleFs::default()), &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();

        let outcome = apply(&ctx, None, &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();
        assert!(outcome.rollout_complete);
        assert_eq!(outcome.status, "");
    }

    #[tokio::test]
    async fn preflight_runs_only_on_install_and_upgrade_not_unchanged() {
        let client = FakeRevisionClient::new();
        let provider = configmap_provider("test-cm");
        let failing = AlwaysFailPreflight {
            id: "always-fails".to_string(),
            message: "nope".to_string(),
        };
        let preflights: Vec<&dyn Preflight> = vec![&failing];
        let mut ctx = ApplyContext::new(&client, &provider, "extension-applier-core");
        ctx.preflights = &preflights;

        let error = apply(&ctx, Some(&StaticBundleFs::default()), &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(error, ApplyError::Preflight { .. }));
        assert!(client.list_revisions("my-ext").await.unwrap().is_empty());

        // Reconciling again with a passing preflight installs; a third,
        // no-op reconcile with the same failing preflight must not re-run it.
        let passing = AlwaysPassPreflight {
            id: "always-fails".to_string(),
        };
        let preflights: Vec<&dyn Preflight> = vec![&passing];
        let mut ctx = ApplyContext::new(&client, &provider, "extension-applier-core");
        ctx.preflights = &preflights;
        apply(&ctx, Some(&StaticBundleFs::default()), &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();

        let preflights: Vec<&dyn Preflight> = vec![&failing];
        let mut ctx = ApplyContext::new(&client, &provider, "extension-applier-core");
        ctx.preflights = &preflights;
        apply(&ctx, Some(&StaticBundleFs::default()), &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn crd_upgrade_safety_preflight_is_skipped_when_enforcement_is_none() {
        let client = FakeRevisionClient::new();
        let provider = configmap_provider("test-cm");
        let failing = AlwaysFailPreflight {
            id: CRD_UPGRADE_SAFETY_PREFLIGHT_ID.to_string(),
            message: "would break compatibility".to_string(),
        };
        let preflights: Vec<&dyn Preflight> = vec![&failing];
        let mut ctx = ApplyContext::new(&client, &provider, "extension-applier-core");
        ctx.preflights = &preflights;

        let mut ext = ext();
        let mut config = PreflightConfig::default();
        config
            .enforcement
            .insert(CRD_UPGRADE_SAFETY_PREFLIGHT_ID.to_string(), EnforcementLevel::None);
        ext.preflight_config = Some(config);

        apply(&ctx, Some(&StaticBundleFs::default()), &ext, &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(client.list_revisions("my-ext").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scenario_8_pre_authorization_failure_surfaces_in_apply() {
        struct DenyAll;
        #[async_trait::async_trait]
        impl PreAuthorizer for DenyAll {
            async fn pre_authorize(
                &self,
                _user: &str,
                _manifest: &str,
                _extra_rules: &[PolicyRule],
            ) -> PreAuthOutcome {
                PreAuthOutcome {
                    missing_rules: vec![ScopedPolicyRules {
                        namespace: String::new(),
                        rules: vec![PolicyRule {
                            api_groups: Some(vec![String::new()]),
                            resources: Some(vec!["pods".to_string()]),
                            resource_names: None,
                            non_resource_urls: None,
                            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                        }],
                    }],
                    eval_error: None,
                }
            }
        }

        let client = FakeRevisionClient::new();
        let provider = configmap_provider("test-cm");
        let denier = DenyAll;
        let mut ctx = ApplyContext::new(&client, &provider, "extension-applier-core");
        ctx.pre_authorizer = Some(&denier);

        let error = apply(&ctx, Some(&StaticBundleFs::default()), &ext(), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap_err();

        let message = error.to_string();
        assert!(message.contains("pre-authorization failed"));
        assert!(message.contains("service account requires the following permissions"));
        assert!(message.contains("Resources:[pods]"));
        assert!(message.contains("Verbs:[get,list,watch]"));
        assert!(client.list_revisions("my-ext").await.unwrap().is_empty());
    }
}
