//! The Legacy Storage Migrator (§4.6): one-shot, crash-safe conversion of a
//! pre-existing release-based installation into revision #1.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::client::{ClientError, RevisionClient};
use crate::constants::MIGRATED_FROM_LEGACY_LABEL;
use crate::revision::{
    Condition, ConditionStatus, Extension, RevisionError, RevisionGenerator,
    SUCCEEDED_CONDITION_TYPE,
};

pub type Result<T, E = MigrateError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum MigrateError {
    #[snafu(display("failed to list existing revisions: {source}"))]
    ListRevisions { source: ClientError },

    #[snafu(display("failed to read legacy release: {source}"))]
    ReleaseStore { source: ReleaseStoreError },

    #[snafu(display("failed to generate revision from legacy release: {source}"))]
    Generate { source: RevisionError },

    #[snafu(display("failed to create migrated revision: {source}"))]
    CreateRevision { source: ClientError },

    #[snafu(display("failed to re-fetch migrated revision: {source}"))]
    GetRevision { source: ClientError },

    #[snafu(display("failed to write migrated revision status: {source}"))]
    WriteStatus { source: ClientError },
}

#[derive(Debug, Snafu)]
pub enum ReleaseStoreError {
    #[snafu(display("release {name} not found"))]
    NotFound { name: String },

    #[snafu(display("release store call failed: {message}"))]
    Other { message: String },
}

impl ReleaseStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReleaseStoreError::NotFound { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    Superseded,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Release {
    pub manifest: String,
    pub labels: BTreeMap<String, String>,
    pub version: u64,
    pub status: ReleaseStatus,
}

/// The legacy release-based installation store. `history` is ordered
/// ascending, descending, or unordered — the Migrator sorts by `version`
/// itself, so any order is acceptable.
#[async_trait::async_trait]
pub trait ReleaseStore: Send + Sync {
    async fn get(&self, name: &str) -> std::result::Result<Release, ReleaseStoreError>;

    async fn history(&self, name: &str) -> std::result::Result<Vec<Release>, ReleaseStoreError>;
}

/// An in-memory `ReleaseStore` test double.
#[cfg(any(test, feature = "test-fixtures"))]
#[derive(Clone, Debug, Default)]
pub struct FakeReleaseStore {
    pub current: BTreeMap<String, Release>,
    pub history: BTreeMap<String, Vec<Release>>,
}

#[cfg(any(test, feature = "test-fixtures"))]
#[async_trait::async_trait]
impl ReleaseStore for FakeReleaseStore {
    async fn get(&self, name: &str) -> std::result::Result<Release, ReleaseStoreError> {
        self.current
            .get(name)
            .cloned()
            .context(NotFoundSnafu { name })
    }

    async fn history(&self, name: &str) -> std::result::Result<Vec<Release>, ReleaseStoreError> {
        Ok(self.history.get(name).cloned().unwrap_or_default())
    }
}

fn migrated_status_condition(observed_generation: Option<i64>) -> Condition {
    Condition {
        type_: SUCCEEDED_CONDITION_TYPE.to_string(),
        status: ConditionStatus::True,
        reason: "Succeeded".to_string(),
        message: "Revision succeeded - migrated from legacy release".to_string(),
        observed_generation,
        last_transition_time: None::<Time>,
    }
}

/// `ensureRevisionStatus` (§4.6, step 8): re-fetches `name`, and if it
/// lacks a terminal `Succeeded=True` condition, writes one stamped with the
/// re-fetched revision's current `observedGeneration`.
async fn ensure_revision_status(client: &dyn RevisionClient, name: &str) -> Result<()> {
    let mut revision = client
        .get_revision(name)
        .await
        .context(GetRevisionSnafu)?;

    if revision.status.has_succeeded() {
        return Ok(());
    }

    let condition = migrated_status_condition(revision.generation);
    revision.status.conditions.push(condition);
    client
        .update_revision_status(&revision)
        .await
        .context(WriteStatusSnafu)
}

/// `ensureMigratedStatus` (§4.6 crash-recovery case): handles the
/// short-circuit at step 1, where revisions already exist but we don't yet
/// know whether revision #1 came from this Migrator or from the ordinary
/// Applier path. Only ever touches revision #1, and only when it carries
/// `migratedFromLegacy=true` — a revision #1 still mid-rollout through the
/// normal Applier must be left alone.
async fn ensure_migrated_status(client: &dyn RevisionClient, owner_name: &str) -> Result<()> {
    let revisions = client
        .list_revisions(owner_name)
        .await
        .context(ListRevisionsSnafu)?;

    let Some(revision_one) = revisions.into_iter().find(|r| r.revision == 1) else {
        return Ok(());
    };

    if !revision_one.is_migrated_from_legacy() {
        return Ok(());
    }

    ensure_revision_status(client, &revision_one.name).await
}

/// `migrate(ctx, ext, objectLabels)` (§4.6).
pub async fn migrate(
    client: &dyn RevisionClient,
    release_store: &dyn ReleaseStore,
    ext: &Extension,
    object_labels: &BTreeMap<String, String>,
) -> Result<()> {
    let existing = client
        .list_revisions(&ext.name)
        .await
        .context(ListRevisionsSnafu)?;

    if !existing.is_empty() {
        return ensure_migrated_status(client, &ext.name).await;
    }

    let release = match release_store.get(&ext.name).await {
        Ok(release) => release,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(source) => return Err(MigrateError::ReleaseStore { source }),
    };

    let release = if release.status == ReleaseStatus::Deployed {
        release
    } else {
        let mut history = release_store
            .history(&ext.name)
            .await
            .context(ReleaseStoreSnafu)?;
        history.sort_by_key(|r| r.version);
        match history
            .into_iter()
            .filter(|r| r.status == ReleaseStatus::Deployed)
            .max_by_key(|r| r.version)
        {
            Some(release) => release,
            None => return Ok(()),
        }
    };

    let mut revision = RevisionGenerator::generate_revision_from_legacy_release(
        &release,
        ext,
        object_labels,
    )
    .context(GenerateSnafu)?;

    revision
        .labels
        .insert(MIGRATED_FROM_LEGACY_LABEL.to_string(), "true".to_string());
    revision.set_owner(ext);

    client
        .apply_revision(&revision, "extension-applier-core")
        .await
        .context(CreateRevisionSnafu)?;

    ensure_revision_status(client, &revision.name).await
}
