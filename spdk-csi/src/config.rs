//! Driver configuration files.
//!
//! The controller reads the storage endpoint list and the per-endpoint
//! credentials; the node reads the optional accelerator list. All files
//! are JSON.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CsiError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/spdkcsi-config/config.json";
pub const DEFAULT_SECRET_PATH: &str = "/etc/spdkcsi-secret/secret.json";
pub const DEFAULT_NODE_CONFIG_PATH: &str = "/etc/spdkcsi-nodeserver-config/nodeserver-config.json";

/// Key of the request secret carrying per-request credentials.
pub const REQUEST_SECRET_KEY: &str = "secret.json";

/// Management API flavour spoken by a storage endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Classic SPDK JSON-RPC 2.0
    #[default]
    JsonRpc,
    /// Cluster REST API
    Rest,
}

/// One storage endpoint from the controller config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub name: String,
    #[serde(rename = "rpcURL")]
    pub rpc_url: String,
    /// "nvme-tcp", "nvme-rdma", "tcp", "rdma" or "iscsi"
    pub target_type: String,
    pub target_addr: String,
    #[serde(default)]
    pub backend: BackendKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub nodes: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcToken {
    pub name: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Secrets {
    #[serde(rename = "rpcTokens", default)]
    pub rpc_tokens: Vec<RpcToken>,
}

/// PCI identity of an accelerator function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PciIds {
    #[serde(rename = "vendorID")]
    pub vendor_id: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "classID")]
    pub class_id: String,
}

/// One accelerator entry from the node config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XpuConfig {
    pub name: String,
    /// "xpu-{sma|opi}-{nvmftcp|nvme|virtioblk}"
    pub target_type: String,
    /// host:port of the accelerator gRPC service
    pub target_addr: String,
    #[serde(rename = "pciIDs", default, skip_serializing_if = "Option::is_none")]
    pub pci_ids: Option<PciIds>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default, alias = "smaList")]
    pub xpu_list: Vec<XpuConfig>,
    #[serde(default)]
    pub kvm_pci_bridges: u32,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, what: &str) -> Result<T> {
    let data = fs::read_to_string(path).map_err(|e| {
        CsiError::Config(format!("failed to read {} '{}': {}", what, path.display(), e))
    })?;
    serde_json::from_str(&data).map_err(|e| {
        CsiError::Config(format!("failed to parse {} '{}': {}", what, path.display(), e))
    })
}

impl ControllerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = read_json(path, "controller config")?;
        config.validate()?;
        Ok(config)
    }

    /// Endpoint names must be non-empty, unique and free of ':' since they
    /// prefix every volume ID.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(CsiError::Config("no storage endpoints configured".into()));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() || node.name.contains(':') {
                return Err(CsiError::Config(format!(
                    "invalid endpoint name '{}'",
                    node.name
                )));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(CsiError::Config(format!(
                    "duplicate endpoint name '{}'",
                    node.name
                )));
            }
            if !node.rpc_url.starts_with("http://") && !node.rpc_url.starts_with("https://") {
                return Err(CsiError::Config(format!(
                    "endpoint '{}' has invalid rpcURL '{}'",
                    node.name, node.rpc_url
                )));
            }
        }
        Ok(())
    }
}

impl Secrets {
    pub fn load(path: &Path) -> Result<Self> {
        read_json(path, "secret")
    }

    /// Credentials passed in the CSI request secrets, if any.
    pub fn from_request(secrets: &HashMap<String, String>) -> Result<Option<Self>> {
        match secrets.get(REQUEST_SECRET_KEY) {
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| CsiError::InvalidArgument(format!("malformed {}: {}", REQUEST_SECRET_KEY, e))),
            None => Ok(None),
        }
    }

    pub fn token(&self, endpoint: &str) -> Option<&RpcToken> {
        self.rpc_tokens.iter().find(|t| t.name == endpoint)
    }
}

impl NodeConfig {
    /// A missing file means no accelerator is configured.
    pub fn load_optional(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        read_json(path, "node config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_controller_config() {
        let raw = r#"{"nodes":[
            {"name":"localhost","rpcURL":"http://127.0.0.1:9009","targetType":"iscsi","targetAddr":"127.0.0.1"},
            {"name":"cluster","rpcURL":"https://10.0.0.5","targetType":"nvme-tcp","targetAddr":"10.0.0.5","backend":"rest"}
        ]}"#;
        let config: ControllerConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].rpc_url, "http://127.0.0.1:9009");
        assert_eq!(config.nodes[0].backend, BackendKind::JsonRpc);
        assert_eq!(config.nodes[1].backend, BackendKind::Rest);
        assert_eq!(config.nodes[1].target_type, "nvme-tcp");
    }

    #[test]
    fn test_validate_rejects_bad_endpoints() {
        let endpoint = |name: &str, url: &str| EndpointConfig {
            name: name.to_string(),
            rpc_url: url.to_string(),
            target_type: "tcp".to_string(),
            target_addr: "127.0.0.1".to_string(),
            backend: BackendKind::JsonRpc,
        };

        assert!(ControllerConfig::default().validate().is_err());

        let dup = ControllerConfig {
            nodes: vec![endpoint("a", "http://x"), endpoint("a", "http://y")],
        };
        assert!(dup.validate().is_err());

        let colon = ControllerConfig {
            nodes: vec![endpoint("a:b", "http://x")],
        };
        assert!(colon.validate().is_err());

        let url = ControllerConfig {
            nodes: vec![endpoint("a", "127.0.0.1:9009")],
        };
        assert!(url.validate().is_err());
    }

    #[test]
    fn test_secrets_lookup() {
        let raw = r#"{"rpcTokens":[{"name":"localhost","username":"spdkcsiuser","password":"spdkcsipass"}]}"#;
        let secrets: Secrets = serde_json::from_str(raw).unwrap();
        let token = secrets.token("localhost").unwrap();
        assert_eq!(token.username, "spdkcsiuser");
        assert_eq!(token.password, "spdkcsipass");
        assert!(secrets.token("other").is_none());
    }

    #[test]
    fn test_secrets_from_request() {
        let mut map = HashMap::new();
        assert!(Secrets::from_request(&map).unwrap().is_none());

        map.insert(
            REQUEST_SECRET_KEY.to_string(),
            r#"{"rpcTokens":[{"name":"n","username":"u","password":"p"}]}"#.to_string(),
        );
        let secrets = Secrets::from_request(&map).unwrap().unwrap();
        assert_eq!(secrets.token("n").unwrap().username, "u");

        map.insert(REQUEST_SECRET_KEY.to_string(), "{not json".to_string());
        assert!(matches!(
            Secrets::from_request(&map),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_node_config_sma_alias() {
        let raw = r#"{"smaList":[{"name":"xpu0","targetType":"xpu-sma-nvmftcp","targetAddr":"127.0.0.1:5114"}],"kvmPciBridges":2}"#;
        let config: NodeConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.xpu_list.len(), 1);
        assert_eq!(config.xpu_list[0].target_type, "xpu-sma-nvmftcp");
        assert_eq!(config.kvm_pci_bridges, 2);
        assert!(config.xpu_list[0].pci_ids.is_none());
    }

    #[test]
    fn test_node_config_pci_ids() {
        let raw = r#"{"xpuList":[{"name":"xpu0","targetType":"xpu-opi-nvme","targetAddr":"10.0.0.2:50051",
            "pciIDs":{"vendorID":"0x8086","deviceID":"0x1457","classID":"0x0108"}}]}"#;
        let config: NodeConfig = serde_json::from_str(raw).unwrap();
        let ids = config.xpu_list[0].pci_ids.as_ref().unwrap();
        assert_eq!(ids.vendor_id, "0x8086");
        assert_eq!(config.kvm_pci_bridges, 0);
    }

    #[test]
    fn test_load_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut f = fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"nodes":[{{"name":"n1","rpcURL":"http://127.0.0.1:9009","targetType":"tcp","targetAddr":"127.0.0.1"}}]}}"#
        )
        .unwrap();

        let config = ControllerConfig::load(&path).unwrap();
        assert_eq!(config.nodes[0].name, "n1");

        assert!(matches!(
            ControllerConfig::load(&dir.path().join("missing.json")),
            Err(CsiError::Config(_))
        ));
        let node = NodeConfig::load_optional(&dir.path().join("missing.json")).unwrap();
        assert!(node.xpu_list.is_empty());
    }
}
