use std::time::Duration;

use serde::Deserialize;

use crate::NetworkError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    nodes: Vec<NodeEntry>,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    address: String,
    #[serde(default)]
    priority: i64,
}

/// Finds peers by fetching `{"nodes":[{"address":"host:port","priority":N}]}`.
#[derive(Debug, Clone)]
pub struct HttpResolver {
    url: String,
    client: reqwest::Client,
}

impl HttpResolver {
    pub fn new(url: impl Into<String>) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| NetworkError::Config(format!("http resolver client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub(crate) async fn resolve(&self) -> Result<Vec<String>, NetworkError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| NetworkError::Resolve(format!("GET {}: {e}", self.url)))?;
        let list: NodeList = response
            .json()
            .await
            .map_err(|e| NetworkError::Resolve(format!("decoding {}: {e}", self.url)))?;
        Ok(ordered(list))
    }
}

/// Ascending priority; equal priorities keep their listed order.
fn ordered(list: NodeList) -> Vec<String> {
    let mut nodes = list.nodes;
    nodes.sort_by_key(|n| n.priority);
    nodes.into_iter().map(|n| n.address).collect()
}
