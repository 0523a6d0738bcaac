//! Prometheus metrics for the DEFS storage node
//!
//! Counters are fed from the node's event bus; storage gauges are refreshed
//! from [`StorageStats`].

use defs_core::{EventBus, SliceUploaded};
use defs_network::{HandshakeAttempted, ShardStored, ShardsDeleted, UploadServed};
use defs_storage::StorageStats;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Metric names as constants
pub mod names {
    // Storage metrics
    pub const STORAGE_BYTES_USED: &str = "defs_storage_bytes_used";
    pub const STORAGE_BYTES_AVAILABLE: &str = "defs_storage_bytes_available";
    pub const STORAGE_SHARDS: &str = "defs_storage_shards";

    // Shard metrics
    pub const SHARDS_STORED: &str = "defs_shards_stored_total";
    pub const SHARDS_DELETED: &str = "defs_shards_deleted_total";
    pub const PIPELINE_SHARDS: &str = "defs_pipeline_shards_total";

    // Protocol metrics
    pub const UPLOAD_REQUESTS: &str = "defs_upload_requests_total";
    pub const HANDSHAKE_ATTEMPTS: &str = "defs_handshake_attempts_total";

    // Health metrics
    pub const NODE_UP: &str = "defs_node_up";
    pub const NODE_START_TIME: &str = "defs_node_start_time_seconds";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_gauge!(
        names::STORAGE_BYTES_USED,
        "Total bytes of shard objects on this node"
    );
    describe_gauge!(
        names::STORAGE_BYTES_AVAILABLE,
        "Available storage capacity in bytes"
    );
    describe_gauge!(names::STORAGE_SHARDS, "Shard objects on disk");

    describe_counter!(
        names::SHARDS_STORED,
        "Shards received from peers and persisted"
    );
    describe_counter!(
        names::SHARDS_DELETED,
        "Shards removed by owner-authorized deletes"
    );
    describe_counter!(
        names::PIPELINE_SHARDS,
        "Shards produced by the local upload pipeline, by kind"
    );

    describe_counter!(
        names::UPLOAD_REQUESTS,
        "Upload requests answered, by response code"
    );
    describe_counter!(
        names::HANDSHAKE_ATTEMPTS,
        "Outbound handshake attempts, by result"
    );

    describe_gauge!(names::NODE_UP, "Whether the node is up (1) or down (0)");
    describe_gauge!(
        names::NODE_START_TIME,
        "Unix timestamp when the node started"
    );
}

/// Install the global recorder and serve `/metrics` on `addr`
pub fn install_exporter(addr: SocketAddr) -> defs_core::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| defs_core::DefsError::Configuration(format!("metrics exporter: {}", e)))?;
    info!(addr = %addr, "Metrics endpoint listening");
    Ok(())
}

#[derive(Default)]
struct Counters {
    shards_stored: AtomicU64,
    shards_deleted: AtomicU64,
    data_shards: AtomicU64,
    parity_shards: AtomicU64,
    uploads_ok: AtomicU64,
    uploads_failed: AtomicU64,
    handshakes_ok: AtomicU64,
    handshakes_failed: AtomicU64,
}

/// Metrics recorder for tracking node statistics
#[derive(Clone)]
pub struct NodeMetrics {
    node_id: String,
    start_time: std::time::Instant,
    counters: Arc<Counters>,
}

impl NodeMetrics {
    /// Create a new metrics recorder
    pub fn new(node_id: impl Into<String>) -> Self {
        let metrics = Self {
            node_id: node_id.into(),
            start_time: std::time::Instant::now(),
            counters: Arc::new(Counters::default()),
        };

        gauge!(names::NODE_UP, "node_id" => metrics.node_id.clone()).set(1.0);
        gauge!(names::NODE_START_TIME, "node_id" => metrics.node_id.clone())
            .set(unix_now_secs());

        metrics
    }

    /// Feed the counters from `events`
    pub fn attach(&self, events: &EventBus) {
        let this = self.clone();
        events.subscribe(move |_: &ShardStored| this.record_shard_stored());

        let this = self.clone();
        events.subscribe(move |e: &ShardsDeleted| this.record_shards_deleted(e.deleted));

        let this = self.clone();
        events.subscribe(move |e: &UploadServed| this.record_upload_served(e.code));

        let this = self.clone();
        events.subscribe(move |e: &HandshakeAttempted| this.record_handshake(e.success));

        let this = self.clone();
        events.subscribe(move |e: &SliceUploaded| this.record_pipeline_shard(e.is_parity));
    }

    pub fn record_shard_stored(&self) {
        counter!(names::SHARDS_STORED, "node_id" => self.node_id.clone()).increment(1);
        self.counters.shards_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shards_deleted(&self, count: usize) {
        counter!(names::SHARDS_DELETED, "node_id" => self.node_id.clone()).increment(count as u64);
        self.counters
            .shards_deleted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_upload_served(&self, code: i32) {
        let labels = [
            ("node_id", self.node_id.clone()),
            ("code", code.to_string()),
        ];
        counter!(names::UPLOAD_REQUESTS, &labels).increment(1);
        if code == 200 {
            self.counters.uploads_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.uploads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_handshake(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        let labels = [
            ("node_id", self.node_id.clone()),
            ("result", result.to_string()),
        ];
        counter!(names::HANDSHAKE_ATTEMPTS, &labels).increment(1);
        if success {
            self.counters.handshakes_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.handshakes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_pipeline_shard(&self, is_parity: bool) {
        let kind = if is_parity { "parity" } else { "data" };
        let labels = [("node_id", self.node_id.clone()), ("kind", kind.to_string())];
        counter!(names::PIPELINE_SHARDS, &labels).increment(1);
        let slot = if is_parity {
            &self.counters.parity_shards
        } else {
            &self.counters.data_shards
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    /// Update storage gauges
    pub fn update_storage(&self, stats: &StorageStats) {
        let available = if stats.bytes_capacity == 0 {
            0
        } else {
            stats.bytes_available()
        };
        gauge!(names::STORAGE_BYTES_USED, "node_id" => self.node_id.clone())
            .set(stats.bytes_used as f64);
        gauge!(names::STORAGE_BYTES_AVAILABLE, "node_id" => self.node_id.clone())
            .set(available as f64);
        gauge!(names::STORAGE_SHARDS, "node_id" => self.node_id.clone())
            .set(stats.shard_count as f64);
    }

    /// Mark node as down
    pub fn mark_down(&self) {
        gauge!(names::NODE_UP, "node_id" => self.node_id.clone()).set(0.0);
    }

    pub fn shards_stored(&self) -> u64 {
        self.counters.shards_stored.load(Ordering::Relaxed)
    }

    pub fn shards_deleted(&self) -> u64 {
        self.counters.shards_deleted.load(Ordering::Relaxed)
    }

    /// (data, parity) shards produced locally
    pub fn pipeline_shards(&self) -> (u64, u64) {
        (
            self.counters.data_shards.load(Ordering::Relaxed),
            self.counters.parity_shards.load(Ordering::Relaxed),
        )
    }

    /// (answered 200, answered with an error)
    pub fn uploads_served(&self) -> (u64, u64) {
        (
            self.counters.uploads_ok.load(Ordering::Relaxed),
            self.counters.uploads_failed.load(Ordering::Relaxed),
        )
    }

    /// (successful, failed) handshake attempts
    pub fn handshakes(&self) -> (u64, u64) {
        (
            self.counters.handshakes_ok.load(Ordering::Relaxed),
            self.counters.handshakes_failed.load(Ordering::Relaxed),
        )
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

fn unix_now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_counters_follow_events() {
        let events = EventBus::new();
        let metrics = NodeMetrics::new("node-test");
        metrics.attach(&events);

        events.publish(ShardStored {
            file_id: "f".to_string(),
            shard_hash: "h".to_string(),
            index: 0,
            total_pieces: 2,
            from_peer: "node-a".to_string(),
            path: PathBuf::from("/tmp/h"),
        });
        events.publish(ShardsDeleted {
            file_id: "f".to_string(),
            deleted: 3,
            kept: 0,
            dir_removed: true,
        });
        events.publish(UploadServed {
            peer: "node-a".to_string(),
            code: 200,
        });
        events.publish(UploadServed {
            peer: "node-a".to_string(),
            code: 400,
        });
        events.publish(HandshakeAttempted {
            peer: "node-a".to_string(),
            attempt: 1,
            success: false,
        });
        for is_parity in [false, false, true] {
            events.publish(SliceUploaded {
                file_id: "f".to_string(),
                index: 0,
                shard_hash: "h".to_string(),
                is_parity,
                path: PathBuf::from("/tmp/h"),
            });
        }

        assert_eq!(metrics.shards_stored(), 1);
        assert_eq!(metrics.shards_deleted(), 3);
        assert_eq!(metrics.uploads_served(), (1, 1));
        assert_eq!(metrics.handshakes(), (0, 1));
        assert_eq!(metrics.pipeline_shards(), (2, 1));
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = NodeMetrics::new("node-test");
        let clone = metrics.clone();
        clone.record_handshake(true);
        clone.record_shard_stored();
        assert_eq!(metrics.handshakes(), (1, 0));
        assert_eq!(metrics.shards_stored(), 1);
    }

    #[test]
    fn test_update_storage_without_recorder() {
        let metrics = NodeMetrics::new("node-test");
        metrics.update_storage(&StorageStats {
            shard_count: 4,
            bytes_used: 1024,
            ..Default::default()
        });
        metrics.mark_down();
        assert_eq!(metrics.uptime_secs(), 0);
    }
}
