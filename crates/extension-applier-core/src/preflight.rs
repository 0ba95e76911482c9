//! The preflight capability (§6, §9 "Pluggable preflights"): a named
//! capability-set `{install, upgrade}` the Applier invokes before writing a
//! new or changed revision.

use snafu::Snafu;

use crate::object::Object;

pub type Result<T, E = PreflightError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(display("preflight {preflight_id} rejected the rollout: {message}"))]
pub struct PreflightError {
    pub preflight_id: String,
    pub message: String,
}

/// The identity a preflight configures enforcement against via
/// [`crate::revision::PreflightConfig`]. The only preflight the distilled
/// spec names explicitly — CRD upgrade-safety analysis — is out of this
/// crate's scope (§1 non-goals) and is expected to be registered by the
/// host application under this identity.
pub const CRD_UPGRADE_SAFETY_PREFLIGHT_ID: &str = "crdUpgradeSafety";

/// A named check the Applier runs before an install or upgrade write.
#[async_trait::async_trait]
pub trait Preflight: Send + Sync {
    /// The identity checked against [`crate::revision::PreflightConfig`]'s
    /// per-preflight enforcement overrides.
    fn id(&self) -> &str;

    async fn install(&self, objects: &[Object]) -> Result<()>;

    async fn upgrade(&self, objects: &[Object]) -> Result<()>;
}

/// A preflight test double that always succeeds; useful for exercising the
/// Applier's state machine without asserting on preflight behavior itself.
#[cfg(any(test, feature = "test-fixtures"))]
pub struct AlwaysPassPreflight {
    pub id: String,
}

#[cfg(any(test, feature = "test-fixtures"))]
#[async_trait::async_trait]
impl Preflight for AlwaysPassPreflight {
    fn id(&self) -> &str {
        &self.id
    }

    async fn install(&self, _objects: &[Object]) -> Result<()> {
        Ok(())
    }

    async fn upgrade(&self, _objects: &[Object]) -> Result<()> {
        Ok(())
    }
}

/// A preflight test double that always rejects, carrying a fixed message.
#[cfg(any(test, feature = "test-fixtures"))]
pub struct AlwaysFailPreflight {
    pub id: String,
    pub message: String,
}

#[cfg(any(test, feature = "test-fixtures"))]
#[async_trait::async_trait]
impl Preflight for AlwaysFailPreflight {
    fn id(&self) -> &str {
        &self.id
    }

    async fn install(&self, _objects: &[Object]) -> Result<()> {
        PreflightSnafu {
            preflight_id: self.id.clone(),
            message: self.message.clone(),
        }
        .fail()
    }

    async fn upgrade(&self, _objects: &[Object]) -> Result<()> {
        self.install(_objects).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_pass_preflight_succeeds_on_both_paths() {
        let preflight = AlwaysPassPreflight {
            id: "noop".to_string(),
        };
        assert!(preflight.install(&[]).await.is_ok());
        assert!(preflight.upgrade(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn always_fail_preflight_rejects_with_its_id() {
        let preflight = AlwaysFailPreflight {
            id: CRD_UPGRADE_SAFETY_PREFLIGHT_ID.to_string(),
            message: "would remove a served version".to_string(),
        };
        let error = preflight.install(&[]).await.unwrap_err();
        assert_eq!(error.preflight_id, CRD_UPGRADE_SAFETY_PREFLIGHT_ID);
    }
}
