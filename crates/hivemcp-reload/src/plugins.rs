use hivemcp_core::CatalogDiff;

/// Hook for the governance-plugin subsystem step 2 of the reload
/// transaction drives. The plugin subsystem itself is an external
/// collaborator; this crate only defines the seam it plugs into.
#[async_trait::async_trait]
pub trait PluginHost: Send + Sync {
    async fn apply(&self, diff: &CatalogDiff) -> Result<(), String>;
    async fn rollback(&self, diff: &CatalogDiff) -> Result<(), String>;
}

/// Default host for deployments with no governance plugins configured.
pub struct NoopPluginHost;

#[async_trait::async_trait]
impl PluginHost for NoopPluginHost {
    async fn apply(&self, _diff: &CatalogDiff) -> Result<(), String> {
        Ok(())
    }

    async fn rollback(&self, _diff: &CatalogDiff) -> Result<(), String> {
        Ok(())
    }
}
