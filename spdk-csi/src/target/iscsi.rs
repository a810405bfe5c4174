//! iSCSI export of lvol bdevs.
//!
//! All volumes share portal group 1 and initiator group 1; each volume gets
//! its own target node `iqn.2016-06.io.spdk:{lvol}` with the bdev as LUN 0.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::TargetEngine;
use crate::backend::RpcCaller;
use crate::backend::client::call_typed;
use crate::context::ContextMap;
use crate::error::{CsiError, Result};

pub const IQN_PREFIX: &str = "iqn.2016-06.io.spdk:";
pub const ISCSI_PORT: &str = "3260";
const PORTAL_GROUP_TAG: u32 = 1;
const INITIATOR_GROUP_TAG: u32 = 1;
const QUEUE_DEPTH: u32 = 64;

#[derive(Debug, Deserialize)]
struct Tagged {
    tag: u32,
}

#[derive(Debug, Deserialize)]
struct TargetNode {
    name: String,
}

pub struct IscsiTarget {
    rpc: Arc<dyn RpcCaller>,
    target_addr: String,
}

pub fn iqn_for(lvol_id: &str) -> String {
    format!("{}{}", IQN_PREFIX, lvol_id)
}

impl IscsiTarget {
    pub fn new(rpc: Arc<dyn RpcCaller>, target_addr: &str) -> Self {
        Self {
            rpc,
            target_addr: target_addr.to_string(),
        }
    }

    async fn has_tag(&self, method: &str, tag: u32) -> Result<bool> {
        let groups: Vec<Tagged> = call_typed(self.rpc.as_ref(), method, json!(null)).await?;
        Ok(groups.iter().any(|g| g.tag == tag))
    }

    /// Create a shared group unless present. A failed create is accepted
    /// when a concurrent publish created the group in the meantime.
    async fn ensure_group(
        &self,
        list_method: &str,
        create_method: &str,
        tag: u32,
        params: serde_json::Value,
    ) -> Result<()> {
        if self.has_tag(list_method, tag).await? {
            return Ok(());
        }
        if let Err(e) = self.rpc.call(create_method, params).await {
            if self.has_tag(list_method, tag).await? {
                debug!(method = create_method, "Group created concurrently");
                return Ok(());
            }
            return Err(e);
        }
        Ok(())
    }

    async fn ensure_portal_group(&self) -> Result<()> {
        self.ensure_group(
            "iscsi_get_portal_groups",
            "iscsi_create_portal_group",
            PORTAL_GROUP_TAG,
            json!({
                "portals": [{ "host": self.target_addr, "port": ISCSI_PORT }],
                "tag": PORTAL_GROUP_TAG,
            }),
        )
        .await
    }

    async fn ensure_initiator_group(&self) -> Result<()> {
        self.ensure_group(
            "iscsi_get_initiator_groups",
            "iscsi_create_initiator_group",
            INITIATOR_GROUP_TAG,
            json!({
                "initiators": ["ANY"],
                "tag": INITIATOR_GROUP_TAG,
                "netmasks": ["ANY"],
            }),
        )
        .await
    }

    async fn target_exists(&self, iqn: &str) -> Result<bool> {
        let nodes: Vec<TargetNode> =
            call_typed(self.rpc.as_ref(), "iscsi_get_target_nodes", json!(null)).await?;
        Ok(nodes.iter().any(|n| n.name == iqn))
    }
}

#[async_trait]
impl TargetEngine for IscsiTarget {
    async fn publish(&self, lvol_id: &str) -> Result<()> {
        self.ensure_portal_group().await?;
        self.ensure_initiator_group().await?;

        let iqn = iqn_for(lvol_id);
        if self.target_exists(&iqn).await? {
            debug!(lvol_id, "iSCSI target already published");
            return Ok(());
        }

        let created: bool = call_typed(
            self.rpc.as_ref(),
            "iscsi_create_target_node",
            json!({
                "luns": [{ "lun_id": 0, "bdev_name": lvol_id }],
                "name": lvol_id,
                "alias_name": format!("iscsi-{}", lvol_id),
                "pg_ig_maps": [{ "ig_tag": INITIATOR_GROUP_TAG, "pg_tag": PORTAL_GROUP_TAG }],
                "disable_chap": true,
                "queue_depth": QUEUE_DEPTH,
            }),
        )
        .await?;
        if !created {
            return Err(CsiError::Backend(format!(
                "iscsi_create_target_node returned false for {}",
                lvol_id
            )));
        }
        info!(lvol_id, iqn = %iqn, "Published volume over iSCSI");
        Ok(())
    }

    async fn unpublish(&self, lvol_id: &str) -> Result<bool> {
        let iqn = iqn_for(lvol_id);
        if !self.target_exists(&iqn).await? {
            return Ok(false);
        }
        match self
            .rpc
            .call("iscsi_delete_target_node", json!({ "name": iqn }))
            .await
        {
            Ok(_) => {
                info!(lvol_id, iqn = %iqn, "Unpublished iSCSI volume");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                warn!(lvol_id, "iSCSI target vanished during unpublish");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn is_published(&self, lvol_id: &str) -> Result<bool> {
        self.target_exists(&iqn_for(lvol_id)).await
    }

    fn connection(&self, lvol_id: &str) -> ContextMap {
        let mut ctx = ContextMap::new();
        ctx.insert("targetType".to_string(), "iscsi".to_string());
        ctx.insert("targetAddr".to_string(), self.target_addr.clone());
        ctx.insert("targetPort".to_string(), ISCSI_PORT.to_string());
        ctx.insert("iqn".to_string(), iqn_for(lvol_id));
        ctx.insert("model".to_string(), lvol_id.to_string());
        ctx
    }
}
