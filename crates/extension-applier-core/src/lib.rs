//! Revision-based applier core for an operator lifecycle controller.
//!
//! Given a bundle of Kubernetes manifests and a user-declared extension
//! resource, this crate drives the cluster toward the declared state
//! through an immutable, append-only sequence of revisions. It does not
//! fetch bundles, resolve catalogs, run an outer reconcile loop, or manage
//! webhook certificates — those are the host application's job; this
//! crate is the state machine that turns "desired bundle + extension" into
//! "cluster has the right revision", called from inside that loop.
//!
//! See [`applier::apply`] for the main entry point and [`migrate::migrate`]
//! for the one-shot legacy-release conversion.

pub mod applier;
pub mod client;
pub mod constants;
pub mod kvp;
pub mod migrate;
pub mod object;
pub mod phase;
pub mod preauth;
pub mod preflight;
pub mod provider;
pub mod revision;
pub mod sanitize;

pub use applier::{apply, ApplyContext, ApplyError, ApplyOutcome};
pub use client::{ClientError, RevisionClient};
pub use migrate::{migrate, MigrateError, Release, ReleaseStatus, ReleaseStore, ReleaseStoreError};
pub use object::{CollisionProtection, MetadataView, Object, ObjectIdentity, RevisionObject};
pub use phase::{Phase, PhaseBody};
pub use preauth::{PreAuthOutcome, PreAuthorizationError, PreAuthorizer, ScopedPolicyRules};
pub use preflight::{Preflight, PreflightError, CRD_UPGRADE_SAFETY_PREFLIGHT_ID};
pub use provider::{BundleFs, ManifestProvider, ProviderError};
pub use revision::{
    Condition, ConditionStatus, EnforcementLevel, Extension, LifecycleState, PreflightConfig,
    Revision, RevisionError, RevisionGenerator, RevisionStatus, ServiceAccountRef,
};

#[cfg(feature = "kube-client")]
pub use client::KubeRevisionClient;
