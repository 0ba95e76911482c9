//! The Manifest Provider capability (§4.1): an opaque, injected renderer
//! that turns a bundle filesystem plus extension configuration into an
//! ordered sequence of objects. Validation and rendering of the bundle
//! itself are out of scope for the applier core; this module only defines
//! the narrow interface the core consumes and a couple of small test
//! doubles used throughout the rest of the crate's test suite.

use std::collections::BTreeMap;

use snafu::Snafu;

use crate::object::Object;
use crate::revision::Extension;

pub type Result<T, E = ProviderError> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum ProviderError {
    #[snafu(display("failed to render bundle manifests: {message}"))]
    Render { message: String },
}

/// A read-only capability over a bundle's filesystem. The real
/// implementation (bundle fetch + unpack) lives outside this crate; this
/// trait is the narrow interface the Manifest Provider is allowed to use.
pub trait BundleFs: Send + Sync {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;

    fn list(&self) -> Vec<String>;

    /// Bundle-level annotations (e.g. from a bundle's `metadata/annotations.yaml`).
    /// Defaults to empty: most `BundleFs` implementations used in tests
    /// don't carry bundle-level metadata at all.
    fn bundle_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Produces the canonical, unsanitized object set for a bundle plus
/// extension configuration.
pub trait ManifestProvider: Send + Sync {
    fn get(&self, bundle_fs: &dyn BundleFs, ext: &Extension) -> Result<Vec<Object>>;
}

/// An in-memory `BundleFs` used by tests: no real files, just a fixed set
/// of bundle-level annotations.
#[derive(Clone, Debug, Default)]
pub struct StaticBundleFs {
    pub annotations: BTreeMap<String, String>,
}

impl BundleFs for StaticBundleFs {
    fn read(&self, _path: &str) -> std::io::Result<Vec<u8>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "StaticBundleFs carries no files",
        ))
    }

    fn list(&self) -> Vec<String> {
        Vec::new()
    }

    fn bundle_annotations(&self) -> BTreeMap<String, String> {
        self.annotations.clone()
    }
}

/// A `ManifestProvider` test double that always returns the same object
/// set, regardless of bundle contents or extension configuration.
#[derive(Clone, Debug, Default)]
pub struct StaticManifestProvider {
    objects: Vec<Object>,
}

impl StaticManifestProvider {
    pub fn new(objects: Vec<Object>) -> Self {
        Self { objects }
    }
}

impl ManifestProvider for StaticManifestProvider {
    fn get(&self, _bundle_fs: &dyn BundleFs, _ext: &Extension) -> Result<Vec<Object>> {
        Ok(self.objects.clone())
    }
}
