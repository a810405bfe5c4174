//! First-fit volume placement across storage endpoints.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{CsiError, Result};
use crate::metrics;

/// Where a new volume goes.
#[derive(Clone)]
pub struct Placement {
    pub endpoint: String,
    pub lvs_name: String,
    pub backend: Arc<dyn Backend>,
}

/// Pick the first lvstore with more than `size_mib` free, walking
/// `candidates` in order with fresh capacity figures. Endpoints whose pools
/// cannot be listed are skipped; pools listed in `excluded` as
/// `(endpoint, lvs_name)` already refused this volume.
pub async fn schedule(
    candidates: &[(String, Arc<dyn Backend>)],
    size_mib: u64,
    excluded: &[(String, String)],
) -> Result<Placement> {
    for (endpoint, backend) in candidates {
        let lvstores = match backend.lvstores().await {
            Ok(lvstores) => lvstores,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Failed to list lvstores, skipping endpoint");
                continue;
            }
        };
        for lvs in lvstores {
            if excluded.iter().any(|(ep, name)| ep == endpoint && *name == lvs.name) {
                continue;
            }
            if lvs.free_size_mib > size_mib {
                debug!(
                    endpoint = %endpoint,
                    lvs_name = %lvs.name,
                    free_mib = lvs.free_size_mib,
                    size_mib,
                    "Placed volume"
                );
                metrics::record_schedule("placed");
                return Ok(Placement {
                    endpoint: endpoint.clone(),
                    lvs_name: lvs.name,
                    backend: backend.clone(),
                });
            }
        }
    }
    metrics::record_schedule("exhausted");
    Err(CsiError::ResourceExhausted(format!(
        "no lvstore has more than {} MiB free",
        size_mib
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LvStore, SnapshotInfo, VolumeInfo};
    use async_trait::async_trait;

    /// Backend that only answers capacity queries.
    struct Pools(Result<Vec<(&'static str, u64)>>);

    #[async_trait]
    impl Backend for Pools {
        fn info(&self) -> &str {
            "pools"
        }

        async fn lvstores(&self) -> Result<Vec<LvStore>> {
            match &self.0 {
                Ok(pools) => Ok(pools
                    .iter()
                    .map(|(name, free)| LvStore {
                        name: name.to_string(),
                        uuid: format!("{}-uuid", name),
                        total_size_mib: 10_000,
                        free_size_mib: *free,
                    })
                    .collect()),
                Err(_) => Err(CsiError::Transport("connection refused".into())),
            }
        }

        async fn find_volume(&self, _: &str, _: &str) -> Result<Option<String>> {
            unimplemented!()
        }
        async fn create_volume(&self, _: &str, _: &str, _: u64) -> Result<String> {
            unimplemented!()
        }
        async fn clone_snapshot(&self, _: &str, _: &str) -> Result<String> {
            unimplemented!()
        }
        async fn resize_volume(&self, _: &str, _: u64) -> Result<()> {
            unimplemented!()
        }
        async fn volume_info(&self, _: &str) -> Result<VolumeInfo> {
            unimplemented!()
        }
        async fn delete_volume(&self, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn publish_volume(&self, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn unpublish_volume(&self, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn is_published(&self, _: &str) -> Result<bool> {
            unimplemented!()
        }
        async fn create_snapshot(&self, _: &str, _: &str) -> Result<String> {
            unimplemented!()
        }
        async fn delete_snapshot(&self, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
            unimplemented!()
        }
    }

    fn candidate(name: &str, pools: Result<Vec<(&'static str, u64)>>) -> (String, Arc<dyn Backend>) {
        (name.to_string(), Arc::new(Pools(pools)))
    }

    #[tokio::test]
    async fn test_first_fit_in_config_order() {
        let candidates = vec![
            candidate("a", Ok(vec![("lvs0", 100), ("lvs1", 5000)])),
            candidate("b", Ok(vec![("lvs0", 9000)])),
        ];
        let placement = schedule(&candidates, 1024, &[]).await.unwrap();
        assert_eq!(placement.endpoint, "a");
        assert_eq!(placement.lvs_name, "lvs1");
    }

    #[tokio::test]
    async fn test_free_space_must_exceed_request() {
        let candidates = vec![
            candidate("a", Ok(vec![("lvs0", 1024)])),
            candidate("b", Ok(vec![("lvs0", 1025)])),
        ];
        let placement = schedule(&candidates, 1024, &[]).await.unwrap();
        assert_eq!(placement.endpoint, "b");
    }

    #[tokio::test]
    async fn test_failing_endpoint_is_skipped() {
        let candidates = vec![
            candidate("a", Err(CsiError::Transport("down".into()))),
            candidate("b", Ok(vec![("lvs0", 2048)])),
        ];
        let placement = schedule(&candidates, 1024, &[]).await.unwrap();
        assert_eq!(placement.endpoint, "b");
    }

    #[tokio::test]
    async fn test_excluded_pools_are_skipped() {
        let candidates = vec![candidate("a", Ok(vec![("lvs0", 4096), ("lvs1", 4096)]))];
        let excluded = vec![("a".to_string(), "lvs0".to_string())];
        let placement = schedule(&candidates, 1024, &excluded).await.unwrap();
        assert_eq!(placement.lvs_name, "lvs1");
    }

    #[tokio::test]
    async fn test_no_fit_is_resource_exhausted() {
        let candidates = vec![candidate("a", Ok(vec![("lvs0", 10)]))];
        assert!(matches!(
            schedule(&candidates, 1024, &[]).await,
            Err(CsiError::ResourceExhausted(_))
        ));
        assert!(matches!(
            schedule(&[], 1, &[]).await,
            Err(CsiError::ResourceExhausted(_))
        ));
    }
}
