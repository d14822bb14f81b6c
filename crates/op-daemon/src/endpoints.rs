use std::collections::BTreeMap;

use async_trait::async_trait;

/// Supplies the logical endpoint map (`push`, `reverse`, `websocket`, ...)
/// the transport connects to.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self) -> anyhow::Result<BTreeMap<String, String>>;
}

/// The endpoint map from configuration, unchanged for the agent's lifetime.
#[derive(Debug, Clone, Default)]
pub struct StaticEndpoints {
    endpoints: BTreeMap<String, String>,
}

impl StaticEndpoints {
    pub fn new(endpoints: BTreeMap<String, String>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl EndpointResolver for StaticEndpoints {
    async fn resolve(&self) -> anyhow::Result<BTreeMap<String, String>> {
        if self.endpoints.is_empty() {
            anyhow::bail!("no transport endpoints configured");
        }
        Ok(self.endpoints.clone())
    }
}
