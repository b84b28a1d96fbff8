//! Cache shared between nodes through the gossip mesh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{trace, warn};

use super::{expiry_after, Cache, CacheError};
use crate::clock::{Clock, SystemClock};
use crate::mesh::Cluster;

/// A single write as it travels through the mesh.
///
/// Encoded as `{value}|{written_at}|{expires_at}`, times in epoch
/// milliseconds, `0` for an entry that never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MeshEntry {
    value: i64,
    written_at: i64,
    expires_at: Option<i64>,
}

impl MeshEntry {
    fn to_payload(self) -> String {
        format!(
            "{}|{}|{}",
            self.value,
            self.written_at,
            self.expires_at.unwrap_or(0)
        )
    }

    fn from_payload(payload: &str) -> Option<Self> {
        let mut parts = payload.splitn(3, '|');
        let value = parts.next()?.parse().ok()?;
        let written_at = parts.next()?.parse().ok()?;
        let expires_at: i64 = parts.next()?.parse().ok()?;

        Some(Self {
            value,
            written_at,
            expires_at: (expires_at != 0).then_some(expires_at),
        })
    }

    fn is_live(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// A [`Cache`] whose entries are gossiped across a [`Cluster`].
///
/// Each node only writes its own state. Reads take the newest unexpired
/// write among live nodes, so the store is last-writer-wins and offers no
/// read-modify-write atomicity across nodes. A payload that does not decode
/// is skipped; the read reports [`CacheError::Corrupt`] only when no other
/// node holds a usable entry for the key.
#[derive(Debug, Clone)]
pub struct MeshCache {
    cluster: Arc<Cluster>,
    clock: Arc<dyn Clock>,
}

impl MeshCache {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self::with_clock(cluster, Arc::new(SystemClock))
    }

    pub fn with_clock(cluster: Arc<Cluster>, clock: Arc<dyn Clock>) -> Self {
        Self { cluster, clock }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }
}

#[async_trait]
impl Cache for MeshCache {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
        let now = self.clock.now_millis();
        let mut newest: Option<(i64, String, i64)> = None;
        let mut corrupt: Option<String> = None;
        let mut decoded = false;

        for (node_id, payload) in self.cluster.gather(key).await {
            let Some(entry) = MeshEntry::from_payload(&payload) else {
                warn!(
                    key = %key,
                    node_id = %node_id,
                    payload = %payload,
                    "Skipping undecodable mesh entry"
                );
                corrupt = Some(payload);
                continue;
            };
            decoded = true;
            if !entry.is_live(now) {
                trace!(key = %key, node_id = %node_id, "Skipping expired mesh entry");
                continue;
            }

            let candidate = (entry.written_at, node_id, entry.value);
            if newest.as_ref().map_or(true, |current| candidate > *current) {
                newest = Some(candidate);
            }
        }

        match corrupt {
            Some(value) if !decoded => Err(CacheError::Corrupt {
                key: key.to_string(),
                value,
            }),
            _ => Ok(newest.map(|(_, _, value)| value)),
        }
    }

    async fn set_with_expiration(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let now = self.clock.now_millis();
        let entry = MeshEntry {
            value,
            written_at: now,
            expires_at: expiry_after(now, ttl),
        };
        self.cluster
            .publish(key, entry.to_payload(), entry.expires_at, now)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mesh::test_config;

    #[test]
    fn test_mesh_entry_payload() {
        let entry = MeshEntry {
            value: -3,
            written_at: 1_704_067_200_000,
            expires_at: Some(1_704_067_210_000),
        };
        assert_eq!(entry.to_payload(), "-3|1704067200000|1704067210000");
        assert_eq!(MeshEntry::from_payload(&entry.to_payload()), Some(entry));

        let forever = MeshEntry::from_payload("5|10|0").unwrap();
        assert_eq!(forever.expires_at, None);
        assert!(forever.is_live(i64::MAX));
    }

    #[test]
    fn test_mesh_entry_payload_invalid() {
        assert!(MeshEntry::from_payload("invalid").is_none());
        assert!(MeshEntry::from_payload("1|2").is_none());
        assert!(MeshEntry::from_payload("a|2|3").is_none());
    }

    #[tokio::test]
    async fn test_mesh_cache_single_node() {
        let cluster = Arc::new(Cluster::start(test_config(18946)).await.unwrap());
        let clock = Arc::new(ManualClock::new(1_000_000));

        {
            let cache = MeshCache::with_clock(cluster.clone(), clock.clone());

            assert_eq!(cache.get("missing").await.unwrap(), None);

            cache.set("forever", 0).await.unwrap();
            cache
                .set_with_expiration("short", 42, Duration::from_millis(5))
                .await
                .unwrap();

            assert_eq!(cache.get("forever").await.unwrap(), Some(0));
            assert_eq!(cache.get("short").await.unwrap(), Some(42));

            clock.advance(Duration::from_millis(5));
            assert_eq!(cache.get("short").await.unwrap(), None);
            assert_eq!(cache.get("forever").await.unwrap(), Some(0));

            // The next write deletes the expired entry from node state
            assert_eq!(cluster.gather("short").await.len(), 1);
            cache.set("forever", 1).await.unwrap();
            assert!(cluster.gather("short").await.is_empty());
            assert_eq!(cluster.tracked_entry_count(), 0);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_cache_reports_corrupt_entries() {
        let cluster = Arc::new(Cluster::start(test_config(18947)).await.unwrap());

        {
            cluster
                .publish("bad", "not-a-number".to_string(), None, 0)
                .await;
            let cache = MeshCache::new(cluster.clone());

            let err = cache.get("bad").await.unwrap_err();
            assert!(matches!(err, CacheError::Corrupt { .. }));

            // A usable write replaces the bad payload
            cache.set("bad", 3).await.unwrap();
            assert_eq!(cache.get("bad").await.unwrap(), Some(3));
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_cache_shared_between_nodes() {
        let cluster1 = Arc::new(Cluster::start(test_config(18948)).await.unwrap());

        let mut config2 = test_config(18949);
        config2.seed_nodes = vec!["127.0.0.1:18948".to_string()];
        let cluster2 = Arc::new(Cluster::start(config2).await.unwrap());

        tokio::time::sleep(Duration::from_millis(500)).await;

        {
            let clock = Arc::new(ManualClock::new(1_000_000));
            let cache1 = MeshCache::with_clock(cluster1.clone(), clock.clone());
            let cache2 = MeshCache::with_clock(cluster2.clone(), clock.clone());

            cache1.set("shared", 5).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(cache2.get("shared").await.unwrap(), Some(5));

            // A later write from the other node wins
            clock.advance(Duration::from_millis(1));
            cache2.set("shared", 4).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(cache1.get("shared").await.unwrap(), Some(4));
            assert_eq!(cache2.get("shared").await.unwrap(), Some(4));

            // One node's undecodable payload does not hide the other's entry
            cache1.set("mixed", 7).await.unwrap();
            cluster2
                .publish("mixed", "garbage".to_string(), None, 0)
                .await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(cache1.get("mixed").await.unwrap(), Some(7));
            assert_eq!(cache2.get("mixed").await.unwrap(), Some(7));
        }

        Arc::try_unwrap(cluster1).unwrap().shutdown().await.unwrap();
        Arc::try_unwrap(cluster2).unwrap().shutdown().await.unwrap();
    }
}
