//! Target publish engines.
//!
//! Exporting a volume over NVMe-oF or iSCSI is a sequence of SPDK target
//! calls. Engines read the current target state first so that a repeated
//! or resumed publish only performs the missing steps, and roll back the
//! steps they performed when a later one fails.

pub mod iscsi;
pub mod nvmf;

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::RpcCaller;
use crate::context::ContextMap;
use crate::error::{CsiError, Result};

pub use iscsi::IscsiTarget;
pub use nvmf::{NvmfTarget, NvmfTransport};
pub use crate::undo::UndoStack;

#[async_trait]
pub trait TargetEngine: Send + Sync {
    /// Export the lvol bdev. Idempotent.
    async fn publish(&self, lvol_id: &str) -> Result<()>;

    /// Withdraw the export. `Ok(false)` when nothing was exported.
    async fn unpublish(&self, lvol_id: &str) -> Result<bool>;

    /// Whether any export object of the volume exists, complete or not.
    async fn is_published(&self, lvol_id: &str) -> Result<bool>;

    /// Connection metadata an initiator needs for this lvol.
    fn connection(&self, lvol_id: &str) -> ContextMap;
}

/// Pick the engine for an endpoint's configured transport.
pub fn engine_for(
    target_type: &str,
    target_addr: &str,
    rpc: Arc<dyn RpcCaller>,
) -> Result<Box<dyn TargetEngine>> {
    match target_type.to_lowercase().as_str() {
        "nvme-tcp" | "tcp" => Ok(Box::new(NvmfTarget::new(rpc, NvmfTransport::Tcp, target_addr))),
        "nvme-rdma" | "rdma" => Ok(Box::new(NvmfTarget::new(rpc, NvmfTransport::Rdma, target_addr))),
        "iscsi" => Ok(Box::new(IscsiTarget::new(rpc, target_addr))),
        other => Err(CsiError::Config(format!("unknown transport: {}", other))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory SPDK target used by engine and backend tests.

    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::backend::RpcCaller;
    use crate::backend::client::classify;
    use crate::error::{CsiError, Result};

    #[derive(Default)]
    pub struct SubsystemState {
        pub namespaces: BTreeMap<u32, String>,
        pub listeners: Vec<(String, String)>,
    }

    #[derive(Default)]
    pub struct State {
        pub transports: HashSet<String>,
        pub subsystems: BTreeMap<String, SubsystemState>,
        pub portal_groups: HashSet<u64>,
        pub initiator_groups: HashSet<u64>,
        pub target_nodes: HashSet<String>,
        pub calls: Vec<String>,
        /// Method that fails once with a backend error
        pub fail_once: Option<String>,
    }

    #[derive(Default)]
    pub struct FakeSpdk {
        pub state: Mutex<State>,
    }

    impl FakeSpdk {
        pub fn failing_once(method: &str) -> Self {
            let fake = Self::default();
            fake.state.lock().unwrap().fail_once = Some(method.to_string());
            fake
        }

        pub fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        pub fn count(&self, method: &str) -> usize {
            self.calls().iter().filter(|m| *m == method).count()
        }

        /// True when no subsystem or target node remains.
        pub fn is_clean(&self) -> bool {
            let state = self.state.lock().unwrap();
            state.subsystems.is_empty() && state.target_nodes.is_empty()
        }
    }

    fn str_param<'a>(params: &'a Value, key: &str) -> &'a str {
        params.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    #[async_trait]
    impl RpcCaller for FakeSpdk {
        async fn call(&self, method: &str, params: Value) -> Result<Value> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(method.to_string());
            if state.fail_once.as_deref() == Some(method) {
                state.fail_once = None;
                return Err(CsiError::Backend(format!("{}: injected failure", method)));
            }

            match method {
                "nvmf_create_transport" => {
                    let trtype = str_param(&params, "trtype").to_string();
                    if !state.transports.insert(trtype.clone()) {
                        return Err(classify(&format!("Transport type '{}' already exists", trtype)));
                    }
                    Ok(Value::Bool(true))
                }
                "nvmf_get_subsystems" => {
                    let nqn = str_param(&params, "nqn");
                    match state.subsystems.get(nqn) {
                        Some(sub) => Ok(json!([{
                            "nqn": nqn,
                            "namespaces": sub.namespaces.iter()
                                .map(|(nsid, bdev)| json!({"nsid": nsid, "bdev_name": bdev}))
                                .collect::<Vec<_>>(),
                            "listen_addresses": sub.listeners.iter()
                                .map(|(addr, port)| json!({"trtype": "TCP", "adrfam": "IPv4", "traddr": addr, "trsvcid": port}))
                                .collect::<Vec<_>>(),
                        }])),
                        None => Err(CsiError::Backend("Invalid parameters".into())),
                    }
                }
                "nvmf_create_subsystem" => {
                    let nqn = str_param(&params, "nqn").to_string();
                    if state.subsystems.contains_key(&nqn) {
                        return Err(classify("Subsystem already exists"));
                    }
                    state.subsystems.insert(nqn, SubsystemState::default());
                    Ok(Value::Bool(true))
                }
                "nvmf_subsystem_add_ns" => {
                    let nqn = str_param(&params, "nqn").to_string();
                    let bdev = params["namespace"]["bdev_name"].as_str().unwrap_or_default().to_string();
                    let sub = state
                        .subsystems
                        .get_mut(&nqn)
                        .ok_or_else(|| CsiError::Backend("Invalid parameters".into()))?;
                    let nsid = sub.namespaces.keys().max().copied().unwrap_or(0) + 1;
                    sub.namespaces.insert(nsid, bdev);
                    Ok(json!(nsid))
                }
                "nvmf_subsystem_remove_ns" => {
                    let nqn = str_param(&params, "nqn").to_string();
                    let nsid = params["nsid"].as_u64().unwrap_or_default() as u32;
                    let sub = state
                        .subsystems
                        .get_mut(&nqn)
                        .ok_or_else(|| CsiError::Backend("Invalid parameters".into()))?;
                    sub.namespaces.remove(&nsid);
                    Ok(Value::Bool(true))
                }
                "nvmf_subsystem_add_listener" => {
                    let nqn = str_param(&params, "nqn").to_string();
                    let addr = &params["listen_address"];
                    let listener = (
                        addr["traddr"].as_str().unwrap_or_default().to_string(),
                        addr["trsvcid"].as_str().unwrap_or_default().to_string(),
                    );
                    let sub = state
                        .subsystems
                        .get_mut(&nqn)
                        .ok_or_else(|| CsiError::Backend("Invalid parameters".into()))?;
                    sub.listeners.push(listener);
                    Ok(Value::Bool(true))
                }
                "nvmf_delete_subsystem" => {
                    let nqn = str_param(&params, "nqn").to_string();
                    match state.subsystems.remove(&nqn) {
                        Some(_) => Ok(Value::Bool(true)),
                        None => Err(CsiError::Backend("Invalid parameters".into())),
                    }
                }
                "iscsi_get_portal_groups" => Ok(json!(
                    state.portal_groups.iter().map(|t| json!({"tag": t})).collect::<Vec<_>>()
                )),
                "iscsi_create_portal_group" => {
                    let tag = params["tag"].as_u64().unwrap_or_default();
                    state.portal_groups.insert(tag);
                    Ok(Value::Bool(true))
                }
                "iscsi_get_initiator_groups" => Ok(json!(
                    state.initiator_groups.iter().map(|t| json!({"tag": t})).collect::<Vec<_>>()
                )),
                "iscsi_create_initiator_group" => {
                    let tag = params["tag"].as_u64().unwrap_or_default();
                    state.initiator_groups.insert(tag);
                    Ok(Value::Bool(true))
                }
                "iscsi_get_target_nodes" => Ok(json!(
                    state.target_nodes.iter().map(|n| json!({"name": n})).collect::<Vec<_>>()
                )),
                "iscsi_create_target_node" => {
                    let name = format!("{}{}", super::iscsi::IQN_PREFIX, str_param(&params, "name"));
                    Ok(Value::Bool(state.target_nodes.insert(name)))
                }
                "iscsi_delete_target_node" => {
                    let name = str_param(&params, "name").to_string();
                    if state.target_nodes.remove(&name) {
                        Ok(Value::Bool(true))
                    } else {
                        Err(classify("Could not find target node: not found"))
                    }
                }
                other => Err(CsiError::Backend(format!("Method not found: {}", other))),
            }
        }
    }
}
