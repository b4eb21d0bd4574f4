//! Read-only monitoring of node caches and live transactions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheRegistry;
use crate::transaction::{TransactionManager, TransactionState};

/// Value of a monitoring metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    /// Counter value (u64)
    Counter(u64),
    /// Gauge value (f64)
    Gauge(f64),
}

/// One row of the cache-performance table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePerformanceRow {
    /// Index tree the cache belongs to.
    pub tree_id: String,
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that went to disk.
    pub misses: u64,
}

/// One row of the transaction table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRow {
    /// Host that began the transaction.
    pub host: String,
    /// Global transaction id.
    pub xid: String,
    /// Process-unique sequence number.
    pub simple_id: u64,
    /// Pipeline task the transaction belongs to.
    pub pipeline_task_id: Option<u64>,
    /// Set once the reaper aborted it.
    pub expired: bool,
    /// When the transaction began.
    pub start_time: SystemTime,
    /// Last operation on the transaction.
    pub last_active_time: SystemTime,
    /// Lifecycle state.
    pub state: TransactionState,
}

/// Monitoring view over a store's caches and transaction registry.
#[derive(Clone)]
pub struct StoreMonitor {
    registry: Arc<CacheRegistry>,
    txns: Arc<TransactionManager>,
}

impl StoreMonitor {
    /// Creates a view over `registry` and `txns`.
    pub fn new(registry: Arc<CacheRegistry>, txns: Arc<TransactionManager>) -> Self {
        Self { registry, txns }
    }

    /// Hit and miss counters of every live node cache.
    pub fn cache_performance(&self) -> Vec<CachePerformanceRow> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|(tree_id, stats)| CachePerformanceRow {
                tree_id,
                hits: stats.hits,
                misses: stats.misses,
            })
            .collect()
    }

    /// Zeroes the counters of every live node cache.
    pub fn reset_all_cache_counters(&self) {
        self.registry.reset_all();
        info!("cache counters reset");
    }

    /// Every known transaction, expired ones included, by simple id.
    pub fn transactions(&self) -> Vec<TransactionRow> {
        self.txns
            .snapshot()
            .into_iter()
            .map(|info| TransactionRow {
                host: info.host,
                xid: info.xid.to_string(),
                simple_id: info.xid.simple_id(),
                pipeline_task_id: info.pipeline_task_id,
                expired: info.expired,
                start_time: info.start_time,
                last_active_time: info.last_active_time,
                state: info.state,
            })
            .collect()
    }

    /// Flat metric map, keyed by dotted metric name.
    pub fn snapshot(&self) -> BTreeMap<String, MetricValue> {
        let mut metrics = BTreeMap::new();
        for (name, stats) in self.registry.snapshot() {
            metrics.insert(format!("cache.{}.hits", name), MetricValue::Counter(stats.hits));
            metrics.insert(format!("cache.{}.misses", name), MetricValue::Counter(stats.misses));
            metrics.insert(
                format!("cache.{}.evictions", name),
                MetricValue::Counter(stats.evictions),
            );
            metrics.insert(
                format!("cache.{}.hit_rate", name),
                MetricValue::Gauge(stats.hit_rate()),
            );
        }

        let rows = self.txns.snapshot();
        let expired = rows.iter().filter(|r| r.expired).count();
        metrics.insert(
            "transactions.active".to_string(),
            MetricValue::Gauge((rows.len() - expired) as f64),
        );
        metrics.insert(
            "transactions.expired".to_string(),
            MetricValue::Gauge(expired as f64),
        );
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::Node;
    use crate::cache::NodeCache;
    use crate::transaction::TransactionContext;
    use std::time::Duration;

    fn monitor() -> (StoreMonitor, Arc<NodeCache>, Arc<TransactionManager>) {
        let registry = Arc::new(CacheRegistry::new());
        let cache = Arc::new(NodeCache::new("stream", 4));
        registry.register(&cache);
        let txns = Arc::new(TransactionManager::new(
            Duration::from_secs(10),
            Duration::from_secs(60),
        ));
        (StoreMonitor::new(registry, Arc::clone(&txns)), cache, txns)
    }

    #[test]
    fn test_cache_table_and_reset() {
        let (monitor, cache, _txns) = monitor();
        cache.insert(0, Arc::new(Node::leaf(0)));
        cache.get(0);
        cache.get(1);
        let rows = monitor.cache_performance();
        assert_eq!(
            rows,
            vec![CachePerformanceRow {
                tree_id: "stream".to_string(),
                hits: 1,
                misses: 1,
            }]
        );
        assert_eq!(
            monitor.snapshot().get("cache.stream.hit_rate"),
            Some(&MetricValue::Gauge(0.5))
        );

        monitor.reset_all_cache_counters();
        assert_eq!(monitor.cache_performance()[0].hits, 0);
    }

    #[test]
    fn test_transaction_table() {
        let (monitor, _cache, txns) = monitor();
        let a = txns.begin(TransactionContext::new("node-a").with_task(42));
        txns.begin(TransactionContext::new("node-b"));
        let rows = monitor.transactions();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].xid, a.to_string());
        assert_eq!(rows[0].host, "node-a");
        assert_eq!(rows[0].pipeline_task_id, Some(42));
        assert_eq!(rows[0].state, TransactionState::Active);
        assert!(!rows[1].expired);
        assert_eq!(
            monitor.snapshot().get("transactions.active"),
            Some(&MetricValue::Gauge(2.0))
        );
    }
}
