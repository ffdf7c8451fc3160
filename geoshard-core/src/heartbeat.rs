//! Liveness monitoring for shards and for the other routing nodes.

use crate::cluster_client::ProbeTarget;
use crate::{ClusterTransport, PeerDirectory, Result, ShardDirectory};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    /// `None` leaves the transport's default timeout in place.
    pub timeout: Option<Duration>,
    pub miss_threshold: u32,
}

impl HeartbeatSettings {
    pub fn shard_defaults() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Some(Duration::from_millis(8000)),
            miss_threshold: 2,
        }
    }

    pub fn peer_defaults() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: None,
            miss_threshold: 3,
        }
    }
}

/// Consecutive missed probes per address.
#[derive(Debug, Default)]
pub struct MissCounter {
    misses: HashMap<String, u32>,
}

impl MissCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, addr: &str) {
        self.misses.remove(addr);
    }

    /// Returns true exactly when this miss reaches `threshold`. The count is
    /// then dropped, so a returning address starts again from zero.
    pub fn record_failure(&mut self, addr: &str, threshold: u32) -> bool {
        let count = self.misses.entry(addr.to_string()).or_insert(0);
        *count += 1;
        if *count >= threshold {
            self.misses.remove(addr);
            return true;
        }
        false
    }

    pub fn misses(&self, addr: &str) -> u32 {
        self.misses.get(addr).copied().unwrap_or(0)
    }

    /// Forgets addresses no longer being monitored.
    pub fn retain(&mut self, monitored: &[String]) {
        self.misses.retain(|addr, _| monitored.contains(addr));
    }
}

/// Invoked once an address has missed enough probes in a row.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn on_failure(&self, addr: &str) -> Result<()>;
}

/// Probes shards. With several routing nodes each one only probes its own
/// section of the address-sorted shard list.
pub struct ShardHeartbeatMonitor {
    directory: Arc<dyn ShardDirectory>,
    peers: Arc<PeerDirectory>,
    transport: Arc<dyn ClusterTransport>,
    handler: Arc<dyn FailureHandler>,
    settings: HeartbeatSettings,
    misses: Mutex<MissCounter>,
}

impl ShardHeartbeatMonitor {
    pub fn new(
        directory: Arc<dyn ShardDirectory>,
        peers: Arc<PeerDirectory>,
        transport: Arc<dyn ClusterTransport>,
        handler: Arc<dyn FailureHandler>,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            directory,
            peers,
            transport,
            handler,
            settings,
            misses: Mutex::new(MissCounter::new()),
        }
    }

    pub fn settings(&self) -> &HeartbeatSettings {
        &self.settings
    }

    /// Runs one probe round and returns the shards reported as failed.
    pub async fn tick(&self) -> Result<Vec<String>> {
        let shards: Vec<String> = self
            .directory
            .find_all()
            .await?
            .into_iter()
            .map(|shard| shard.base_addr)
            .collect();

        let peers = self.peers.list().await;
        let index = peers
            .iter()
            .position(|addr| addr == self.peers.local_addr())
            .unwrap_or(0);
        let monitored = section(&shards, index, peers.len());

        let probes = monitored.iter().map(|addr| async move {
            let outcome = self
                .transport
                .probe(addr, ProbeTarget::Shard, self.settings.timeout)
                .await;
            (addr, outcome)
        });
        let outcomes = join_all(probes).await;

        let mut failed = Vec::new();
        {
            let mut misses = self.misses.lock().await;
            misses.retain(&monitored);
            for (addr, outcome) in outcomes {
                match outcome {
                    Ok(()) => misses.record_success(addr),
                    Err(error) => {
                        tracing::debug!("Shard {} missed heartbeat: {}", addr, error);
                        if misses.record_failure(addr, self.settings.miss_threshold) {
                            failed.push(addr.clone());
                        }
                    }
                }
            }
        }

        for addr in &failed {
            tracing::warn!("Shard {} stopped answering heartbeats", addr);
            if let Err(error) = self.handler.on_failure(addr).await {
                tracing::error!("Failed to handle loss of shard {}: {}", addr, error);
            }
        }

        Ok(failed)
    }
}

/// Shards probed by peer `index` of `peer_count`: indices
/// `ceil(index/P*(S-1)) ..= ceil((index+1)/P*(S-1))`. Neighbouring sections
/// share their boundary shard.
pub fn section(shards: &[String], index: usize, peer_count: usize) -> Vec<String> {
    if peer_count <= 1 || shards.len() <= 1 {
        return shards.to_vec();
    }

    let last = (shards.len() - 1) as f64;
    let peer_count = peer_count as f64;
    let start = ((index as f64 / peer_count) * last).ceil() as usize;
    let end = (((index + 1) as f64 / peer_count) * last).ceil() as usize;

    shards[start.min(shards.len() - 1)..=end.min(shards.len() - 1)].to_vec()
}

#[derive(Debug, Clone, PartialEq)]
pub enum SuspicionOutcome {
    /// Another peer confirmed the failure; removed locally too.
    Confirmed { by: String },
    /// Another peer still reaches the suspect; nothing removed.
    Refuted { by: String },
    /// No other peer could be asked; removed locally.
    RemovedUnilaterally,
}

/// Probes the next routing node in address order. A suspected failure is
/// corroborated by another peer before the node is dropped.
pub struct RingHeartbeatMonitor {
    peers: Arc<PeerDirectory>,
    transport: Arc<dyn ClusterTransport>,
    settings: HeartbeatSettings,
    misses: Mutex<MissCounter>,
}

impl RingHeartbeatMonitor {
    pub fn new(
        peers: Arc<PeerDirectory>,
        transport: Arc<dyn ClusterTransport>,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            peers,
            transport,
            settings,
            misses: Mutex::new(MissCounter::new()),
        }
    }

    pub fn settings(&self) -> &HeartbeatSettings {
        &self.settings
    }

    pub async fn tick(&self) -> Option<SuspicionOutcome> {
        let successor = self.peers.successor_of(self.peers.local_addr()).await?;

        let outcome = self
            .transport
            .probe(&successor, ProbeTarget::Peer, self.settings.timeout)
            .await;

        let crossed = {
            let mut misses = self.misses.lock().await;
            misses.retain(std::slice::from_ref(&successor));
            match outcome {
                Ok(()) => {
                    misses.record_success(&successor);
                    false
                }
                Err(error) => {
                    tracing::debug!("Peer {} missed heartbeat: {}", successor, error);
                    misses.record_failure(&successor, self.settings.miss_threshold)
                }
            }
        };

        if !crossed {
            return None;
        }

        tracing::warn!("Peer {} stopped answering heartbeats", successor);
        Some(self.handle_suspected(&successor).await)
    }

    /// Asks the peers after `suspect` in ring order, one at a time, to check
    /// it. The first one reached decides.
    pub async fn handle_suspected(&self, suspect: &str) -> SuspicionOutcome {
        let local = self.peers.local_addr();
        let witnesses: Vec<String> = self
            .peers
            .ring_after(suspect)
            .await
            .into_iter()
            .filter(|addr| addr != local)
            .collect();

        for witness in witnesses {
            match self
                .transport
                .report_suspected_failure(&witness, suspect)
                .await
            {
                Ok(true) => {
                    self.peers.remove(suspect).await;
                    tracing::info!("Removed peer {}, confirmed down by {}", suspect, witness);
                    return SuspicionOutcome::Confirmed { by: witness };
                }
                Ok(false) => {
                    tracing::info!(
                        "Peer {} still reachable from {}, keeping it",
                        suspect,
                        witness
                    );
                    return SuspicionOutcome::Refuted { by: witness };
                }
                Err(error) => {
                    tracing::debug!("Could not ask {} about {}: {}", witness, suspect, error);
                }
            }
        }

        self.peers.remove(suspect).await;
        tracing::warn!(
            "No peer reachable to corroborate failure of {}, removed locally",
            suspect
        );
        SuspicionOutcome::RemovedUnilaterally
    }

    /// Answers another node's suspicion: probes `suspect` from here and drops
    /// it when it is unreachable. Returns whether the failure is confirmed.
    pub async fn corroborate(&self, suspect: &str) -> bool {
        if suspect == self.peers.local_addr() {
            return false;
        }

        match self
            .transport
            .probe(suspect, ProbeTarget::Peer, self.settings.timeout)
            .await
        {
            Ok(()) => false,
            Err(error) => {
                tracing::info!("Confirmed peer {} is down: {}", suspect, error);
                self.peers.remove(suspect).await;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeTransport};
    use crate::{GeoRange, GeoShardError, MemoryDirectory, ShardRecord};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHandler {
        failures: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl FailureHandler for RecordingHandler {
        async fn on_failure(&self, addr: &str) -> Result<()> {
            self.failures.lock().unwrap().push(addr.to_string());
            Err(GeoShardError::Internal("handler errors are only logged".to_string()))
        }
    }

    fn addrs(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn test_threshold_fires_once_and_success_resets() {
        let mut misses = MissCounter::new();

        assert!(!misses.record_failure("a", 3));
        assert!(!misses.record_failure("a", 3));
        misses.record_success("a");
        assert_eq!(misses.misses("a"), 0);

        assert!(!misses.record_failure("a", 3));
        assert!(!misses.record_failure("a", 3));
        assert!(misses.record_failure("a", 3));
        assert_eq!(misses.misses("a"), 0);

        assert!(!misses.record_failure("a", 3));
    }

    #[test]
    fn test_sections_cover_all_shards_with_shared_boundaries() {
        let shards = addrs(&["a", "b", "c", "d", "e"]);
        assert_eq!(section(&shards, 0, 2), addrs(&["a", "b", "c"]));
        assert_eq!(section(&shards, 1, 2), addrs(&["c", "d", "e"]));
        assert_eq!(section(&shards, 0, 1), shards);
        assert_eq!(section(&shards, 2, 3), addrs(&["d", "e"]));
        assert!(section(&[], 0, 3).is_empty());
    }

    #[tokio::test]
    async fn test_shard_monitor_escalates_after_threshold() {
        let directory = Arc::new(MemoryDirectory::with_records([
            ShardRecord::new("a", "b", GeoRange::new(-90.0, 90.0, -180.0, 0.0)),
            ShardRecord::new("b", "a", GeoRange::new(-90.0, 90.0, 0.0, 180.0)),
        ]));
        let peers = Arc::new(PeerDirectory::new("local"));
        let transport = Arc::new(FakeTransport::new());
        let handler = Arc::new(RecordingHandler::default());
        transport.set_down("b");

        let monitor = ShardHeartbeatMonitor::new(
            directory,
            peers,
            transport.clone(),
            handler.clone(),
            HeartbeatSettings::shard_defaults(),
        );

        assert!(monitor.tick().await.unwrap().is_empty());
        assert_eq!(monitor.tick().await.unwrap(), addrs(&["b"]));
        assert_eq!(*handler.failures.lock().unwrap(), addrs(&["b"]));
        assert!(
            transport
                .calls()
                .contains(&Call::Probe("a".to_string(), ProbeTarget::Shard))
        );
    }

    async fn ring_of(local: &str, others: &[&str]) -> Arc<PeerDirectory> {
        let peers = Arc::new(PeerDirectory::new(local));
        for addr in others {
            peers.add(addr).await.unwrap();
        }
        peers
    }

    #[tokio::test]
    async fn test_ring_monitor_probes_only_successor() {
        let peers = ring_of("b", &["a", "c"]).await;
        let transport = Arc::new(FakeTransport::new());
        let monitor =
            RingHeartbeatMonitor::new(peers, transport.clone(), HeartbeatSettings::peer_defaults());

        assert!(monitor.tick().await.is_none());
        assert_eq!(
            transport.calls(),
            vec![Call::Probe("c".to_string(), ProbeTarget::Peer)]
        );
    }

    #[tokio::test]
    async fn test_corroborated_failure_removes_peer() {
        let peers = ring_of("a", &["b", "c"]).await;
        let transport = Arc::new(FakeTransport::new());
        transport.set_down("b");
        let monitor = RingHeartbeatMonitor::new(
            peers.clone(),
            transport.clone(),
            HeartbeatSettings::peer_defaults(),
        );

        assert!(monitor.tick().await.is_none());
        assert!(monitor.tick().await.is_none());
        let outcome = monitor.tick().await;

        assert_eq!(
            outcome,
            Some(SuspicionOutcome::Confirmed {
                by: "c".to_string()
            })
        );
        assert!(!peers.contains("b").await);
        assert!(
            transport
                .calls()
                .contains(&Call::Suspect("c".to_string(), "b".to_string()))
        );
    }

    #[tokio::test]
    async fn test_refuted_suspicion_keeps_peer() {
        let peers = ring_of("a", &["b", "c"]).await;
        let transport = Arc::new(FakeTransport::new());
        transport.set_confirmation("c", false);
        let monitor =
            RingHeartbeatMonitor::new(peers.clone(), transport, HeartbeatSettings::peer_defaults());

        let outcome = monitor.handle_suspected("b").await;
        assert_eq!(
            outcome,
            SuspicionOutcome::Refuted {
                by: "c".to_string()
            }
        );
        assert!(peers.contains("b").await);
    }

    #[tokio::test]
    async fn test_no_witness_falls_back_to_local_removal() {
        let peers = ring_of("a", &["b", "c"]).await;
        let transport = Arc::new(FakeTransport::new());
        transport.set_down("c");
        let monitor =
            RingHeartbeatMonitor::new(peers.clone(), transport, HeartbeatSettings::peer_defaults());

        assert_eq!(
            monitor.handle_suspected("b").await,
            SuspicionOutcome::RemovedUnilaterally
        );
        assert_eq!(peers.list().await, addrs(&["a", "c"]));
    }

    #[tokio::test]
    async fn test_corroborate_checks_suspect_itself() {
        let peers = ring_of("c", &["a", "b"]).await;
        let transport = Arc::new(FakeTransport::new());
        let monitor = RingHeartbeatMonitor::new(
            peers.clone(),
            transport.clone(),
            HeartbeatSettings::peer_defaults(),
        );

        assert!(!monitor.corroborate("b").await);
        transport.set_down("b");
        assert!(monitor.corroborate("b").await);
        assert!(!peers.contains("b").await);
        assert!(!monitor.corroborate("c").await);
    }
}
