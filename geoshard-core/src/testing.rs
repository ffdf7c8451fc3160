//! Scripted transport for tests. Calls to an address marked down fail;
//! forwards, post range fetches and redistributions wait out any delay set
//! for their address.

use crate::cluster_client::{
    ClusterTransport, PeerAnnouncement, ProbeTarget, RedistributionPlan, RoutedRequest,
};
use crate::{GeoRange, GeoShardError, Result, TopologyUpdate};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Probe(String, ProbeTarget),
    PostRange(String),
    Redistribute(String, RedistributionPlan),
    BackupChange(String, String),
    ClearBackups(String),
    FetchTable(String, String),
    Forward(String, String),
    Suspect(String, String),
    PushUpdate(String, TopologyUpdate),
    Announce(String, PeerAnnouncement),
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    down: HashSet<String>,
    post_ranges: HashMap<String, Option<GeoRange>>,
    tables: HashMap<String, Vec<Value>>,
    tables_by_path: HashMap<(String, String), Vec<Value>>,
    responses: HashMap<String, Value>,
    delays: HashMap<String, Duration>,
    confirmations: HashMap<String, bool>,
}

#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, addr: &str) {
        self.state.lock().unwrap().down.insert(addr.to_string());
    }

    pub fn set_up(&self, addr: &str) {
        self.state.lock().unwrap().down.remove(addr);
    }

    pub fn set_post_range(&self, addr: &str, range: Option<GeoRange>) {
        self.state
            .lock()
            .unwrap()
            .post_ranges
            .insert(addr.to_string(), range);
    }

    pub fn set_table(&self, addr: &str, rows: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .tables
            .insert(addr.to_string(), rows);
    }

    /// Like `set_table`, but only for fetches of `path`.
    pub fn set_table_at(&self, addr: &str, path: &str, rows: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .tables_by_path
            .insert((addr.to_string(), path.to_string()), rows);
    }

    pub fn set_response(&self, addr: &str, body: Value) {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert(addr.to_string(), body);
    }

    pub fn set_delay(&self, addr: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(addr.to_string(), delay);
    }

    pub fn set_confirmation(&self, via: &str, confirmed: bool) {
        self.state
            .lock()
            .unwrap()
            .confirmations
            .insert(via.to_string(), confirmed);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn record(&self, addr: &str, call: Call) -> Result<Option<Duration>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.down.contains(addr) {
            return Err(GeoShardError::peer_unreachable(addr, "scripted failure"));
        }
        Ok(state.delays.get(addr).copied())
    }
}

#[async_trait]
impl ClusterTransport for FakeTransport {
    async fn probe(
        &self,
        addr: &str,
        target: ProbeTarget,
        _timeout: Option<Duration>,
    ) -> Result<()> {
        self.record(addr, Call::Probe(addr.to_string(), target))?;
        Ok(())
    }

    async fn fetch_post_range(&self, addr: &str) -> Result<Option<GeoRange>> {
        let delay = self.record(addr, Call::PostRange(addr.to_string()))?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        Ok(state.post_ranges.get(addr).copied().flatten())
    }

    async fn send_redistribution(&self, addr: &str, plan: &RedistributionPlan) -> Result<()> {
        let delay = self.record(addr, Call::Redistribute(addr.to_string(), plan.clone()))?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn notify_backup_change(&self, addr: &str, new_backup_addr: &str) -> Result<()> {
        self.record(
            addr,
            Call::BackupChange(addr.to_string(), new_backup_addr.to_string()),
        )?;
        Ok(())
    }

    async fn clear_backups(&self, addr: &str) -> Result<()> {
        self.record(addr, Call::ClearBackups(addr.to_string()))?;
        Ok(())
    }

    async fn fetch_table(&self, addr: &str, path: &str) -> Result<Vec<Value>> {
        self.record(addr, Call::FetchTable(addr.to_string(), path.to_string()))?;
        let state = self.state.lock().unwrap();
        let rows = state
            .tables_by_path
            .get(&(addr.to_string(), path.to_string()))
            .or_else(|| state.tables.get(addr));
        Ok(rows.cloned().unwrap_or_default())
    }

    async fn forward(&self, addr: &str, request: &RoutedRequest) -> Result<Value> {
        let delay = self.record(
            addr,
            Call::Forward(addr.to_string(), request.path_and_query.clone()),
        )?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        Ok(state.responses.get(addr).cloned().unwrap_or(Value::Null))
    }

    async fn report_suspected_failure(&self, via: &str, suspect: &str) -> Result<bool> {
        self.record(via, Call::Suspect(via.to_string(), suspect.to_string()))?;
        let state = self.state.lock().unwrap();
        Ok(state.confirmations.get(via).copied().unwrap_or(true))
    }

    async fn push_topology_update(&self, addr: &str, update: &TopologyUpdate) -> Result<()> {
        self.record(addr, Call::PushUpdate(addr.to_string(), update.clone()))?;
        Ok(())
    }

    async fn announce_peer(&self, addr: &str, announcement: &PeerAnnouncement) -> Result<()> {
        self.record(addr, Call::Announce(addr.to_string(), announcement.clone()))?;
        Ok(())
    }
}
