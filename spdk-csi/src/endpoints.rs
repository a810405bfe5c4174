//! Resolution of storage endpoint names to backends.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::{self, Backend};
use crate::config::{ControllerConfig, EndpointConfig, Secrets};
use crate::error::{CsiError, Result};

pub trait BackendProvider: Send + Sync {
    /// Endpoint names in configured order.
    fn endpoints(&self) -> Vec<String>;

    /// Backend for `endpoint`. Credentials from `secrets` take precedence
    /// over the ones the provider was started with.
    fn backend(&self, endpoint: &str, secrets: Option<&Secrets>) -> Result<Arc<dyn Backend>>;
}

/// Endpoints from the controller config file. Backends built from the
/// secrets file are created once and shared.
pub struct ConfiguredEndpoints {
    config: ControllerConfig,
    cached: HashMap<String, Arc<dyn Backend>>,
}

impl ConfiguredEndpoints {
    pub fn new(config: ControllerConfig, secrets: &Secrets) -> Result<Self> {
        config.validate()?;
        let mut cached = HashMap::new();
        for endpoint in &config.nodes {
            match secrets.token(&endpoint.name) {
                Some(token) => {
                    let backend = backend::connect(endpoint, token)?;
                    info!(
                        endpoint = %endpoint.name,
                        url = %endpoint.rpc_url,
                        target_type = %endpoint.target_type,
                        "Registered storage endpoint"
                    );
                    cached.insert(endpoint.name.clone(), backend);
                }
                None => warn!(
                    endpoint = %endpoint.name,
                    "No credentials for endpoint, requests must carry them"
                ),
            }
        }
        Ok(Self { config, cached })
    }

    fn endpoint(&self, name: &str) -> Result<&EndpointConfig> {
        self.config
            .nodes
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| CsiError::Internal(format!("unknown storage endpoint '{}'", name)))
    }
}

impl BackendProvider for ConfiguredEndpoints {
    fn endpoints(&self) -> Vec<String> {
        self.config.nodes.iter().map(|e| e.name.clone()).collect()
    }

    fn backend(&self, endpoint: &str, secrets: Option<&Secrets>) -> Result<Arc<dyn Backend>> {
        let config = self.endpoint(endpoint)?;
        if let Some(token) = secrets.and_then(|s| s.token(endpoint)) {
            return backend::connect(config, token);
        }
        self.cached.get(endpoint).cloned().ok_or_else(|| {
            CsiError::InvalidArgument(format!("no credentials for storage endpoint '{}'", endpoint))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, RpcToken};

    fn config() -> ControllerConfig {
        let endpoint = |name: &str| EndpointConfig {
            name: name.to_string(),
            rpc_url: format!("http://{}:9009", name),
            target_type: "nvme-tcp".into(),
            target_addr: "10.0.0.1".into(),
            backend: BackendKind::JsonRpc,
        };
        ControllerConfig {
            nodes: vec![endpoint("node-a"), endpoint("node-b")],
        }
    }

    fn secrets(names: &[&str]) -> Secrets {
        Secrets {
            rpc_tokens: names
                .iter()
                .map(|n| RpcToken {
                    name: n.to_string(),
                    username: "spdkcsiuser".into(),
                    password: "spdkcsipass".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_endpoints_keep_config_order() {
        let endpoints = ConfiguredEndpoints::new(config(), &secrets(&["node-a", "node-b"])).unwrap();
        assert_eq!(endpoints.endpoints(), vec!["node-a", "node-b"]);
        assert_eq!(
            endpoints.backend("node-b", None).unwrap().info(),
            "http://node-b:9009"
        );
    }

    #[test]
    fn test_unknown_endpoint_is_internal() {
        let endpoints = ConfiguredEndpoints::new(config(), &secrets(&["node-a"])).unwrap();
        assert!(matches!(
            endpoints.backend("node-z", None),
            Err(CsiError::Internal(_))
        ));
    }

    #[test]
    fn test_request_secrets_fill_missing_credentials() {
        let endpoints = ConfiguredEndpoints::new(config(), &secrets(&["node-a"])).unwrap();
        assert!(matches!(
            endpoints.backend("node-b", None),
            Err(CsiError::InvalidArgument(_))
        ));
        let request = secrets(&["node-b"]);
        assert!(endpoints.backend("node-b", Some(&request)).is_ok());
    }
}
