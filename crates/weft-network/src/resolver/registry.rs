use std::sync::Arc;

use crate::registry::Registry;
use crate::NetworkError;

/// Service name nodes register themselves under by default.
pub const DEFAULT_NETWORK_SERVICE: &str = "weft.network";

/// Finds peers by listing the overlay's own service in the registry.
#[derive(Clone)]
pub struct RegistryResolver {
    registry: Arc<dyn Registry>,
    service: String,
}

impl RegistryResolver {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            service: DEFAULT_NETWORK_SERVICE.to_string(),
        }
    }

    /// Look for a different service name.
    pub fn service(mut self, name: impl Into<String>) -> Self {
        self.service = name.into();
        self
    }

    pub(crate) fn service_name(&self) -> &str {
        &self.service
    }

    pub(crate) async fn resolve(&self) -> Result<Vec<String>, NetworkError> {
        Ok(self
            .registry
            .list_services()
            .await?
            .into_iter()
            .filter(|instance| instance.name == self.service)
            .map(|instance| instance.address)
            .collect())
    }
}
