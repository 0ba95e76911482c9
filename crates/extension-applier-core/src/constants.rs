//! Well-known label and annotation keys recognized by the applier core.
//!
//! These are part of the crate's public contract: external tooling (the
//! outer reconciler, status dashboards, CLI inspection tools) keys on the
//! exact strings below, so they must never be renamed casually.

use const_format::concatcp;

/// API group used for the `ClusterExtension`/`ClusterExtensionRevision`
/// custom resources this crate writes and reads.
pub const CLUSTER_EXTENSION_API_GROUP: &str = "olm.operatorframework.io";

const LABEL_PREFIX: &str = concatcp!(CLUSTER_EXTENSION_API_GROUP, "/");

/// Identifies the kind of the owning resource, e.g. `ClusterExtension`.
pub const OWNER_KIND_LABEL: &str = concatcp!(LABEL_PREFIX, "ownerKind");

/// Identifies the name of the owning resource.
pub const OWNER_NAME_LABEL: &str = concatcp!(LABEL_PREFIX, "ownerName");

/// Set to `"true"` on the single revision produced by the legacy storage
/// migrator.
pub const MIGRATED_FROM_LEGACY_LABEL: &str = concatcp!(LABEL_PREFIX, "migratedFromLegacy");

/// Carried over from a legacy release's labels.
pub const BUNDLE_NAME_ANNOTATION: &str = concatcp!(LABEL_PREFIX, "bundleName");
/// Carried over from a legacy release's labels.
pub const BUNDLE_VERSION_ANNOTATION: &str = concatcp!(LABEL_PREFIX, "bundleVersion");
/// Carried over from a legacy release's labels.
pub const BUNDLE_REFERENCE_ANNOTATION: &str = concatcp!(LABEL_PREFIX, "bundleReference");
/// Carried over from a legacy release's labels.
pub const PACKAGE_NAME_ANNOTATION: &str = concatcp!(LABEL_PREFIX, "packageName");

/// Records the identity of the service account the extension is installed as.
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = concatcp!(LABEL_PREFIX, "serviceAccountName");
/// Records the namespace of the service account the extension is installed as.
pub const SERVICE_ACCOUNT_NAMESPACE_ANNOTATION: &str =
    concatcp!(LABEL_PREFIX, "serviceAccountNamespace");

/// The only bundle annotation the Revision Generator carries forward into
/// the generated revision's annotations.
pub const OLM_PROPERTIES_ANNOTATION: &str = "olm.properties";

/// The identity string expected of a `ClusterExtension` owner kind label.
pub const CLUSTER_EXTENSION_KIND: &str = "ClusterExtension";

/// Number of most-recent revisions that retention preserves regardless of
/// lifecycle state.
pub const DEFAULT_RETENTION_LIMIT: usize = 5;

/// Annotation values longer than this are dropped by
/// [`crate::sanitize::sanitize`]'s strip-large-annotations pass.
pub const MAX_ANNOTATION_VALUE_BYTES: usize = 256 * 1024;

/// Default extra RBAC verb the Pre-Authorizer always checks for, on top of
/// whatever the revision's own manifests require.
pub const FINALIZER_UPDATE_VERB: &str = "update";

/// The resource the default extra RBAC rule is scoped to.
pub const REVISION_FINALIZERS_RESOURCE: &str = "clusterextensionrevisions/finalizers";
