/// Live metrics for the TUI monitor.
///
/// The shell writes a JSON snapshot of the cluster after every command and
/// every drift tick. The viz binary polls the file and re-renders the
/// dashboard. Writes are atomic (write to .tmp then rename) to avoid torn reads.
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterSummary, SlurmState};
use crate::error::Result;
use crate::gpu::HealthStatus;
use crate::store::ClusterStore;

pub const METRICS_PATH: &str = "/tmp/dgxsim_live.json";

/// Events carried in a snapshot, newest last.
const RECENT_EVENTS: usize = 8;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One heatmap cell.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GpuCell {
    pub id: u32,
    pub health: HealthStatus,
    pub utilization_pct: u32,
    pub temperature_c: u32,
    pub power_draw_w: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NodeRow {
    pub id: String,
    pub health: HealthStatus,
    pub slurm_state: SlurmState,
    pub gpus: Vec<GpuCell>,
    /// IB ports not Active or carrying errors
    pub degraded_ports: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventLine {
    pub timestamp_ms: u64,
    pub node: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// LiveMetrics
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct LiveMetrics {
    pub cluster_name: String,
    /// "running" while drift ticks, "paused" otherwise
    pub status: String,
    /// Store generation the snapshot was taken at
    pub generation: u64,
    pub summary: ClusterSummary,
    pub gpus_per_node: u32,
    /// NVLink peak bandwidth per GPU in GB/s
    pub nvlink_bw_gb_s: f64,
    /// InfiniBand per-port bandwidth in GB/s
    pub infiniband_bw_gb_s: f64,
    pub nodes: Vec<NodeRow>,
    #[serde(default)]
    pub recent_events: Vec<EventLine>,
    /// Last command typed at the shell, if any
    #[serde(default)]
    pub last_command: Option<String>,
    /// Unix timestamp in ms when this snapshot was written
    pub timestamp_ms: u64,
}

impl LiveMetrics {
    pub fn from_store(store: &ClusterStore, drift_running: bool, last_command: Option<&str>) -> Self {
        let cluster = store.cluster();
        let nodes = cluster
            .nodes
            .iter()
            .map(|n| NodeRow {
                id: n.id.clone(),
                health: n.health(),
                slurm_state: n.slurm_state,
                gpus: n
                    .gpus
                    .iter()
                    .map(|g| GpuCell {
                        id: g.id,
                        health: g.health(),
                        utilization_pct: g.utilization_pct,
                        temperature_c: g.temperature_c,
                        power_draw_w: g.power_draw_w,
                    })
                    .collect(),
                degraded_ports: n.ports().filter(|(_, p)| p.is_degraded()).count(),
            })
            .collect();
        let events = store.events();
        let recent_events = events[events.len().saturating_sub(RECENT_EVENTS)..]
            .iter()
            .map(|e| EventLine {
                timestamp_ms: e.timestamp.timestamp_millis().max(0) as u64,
                node: e.node.clone(),
                message: e.message.clone(),
            })
            .collect();
        LiveMetrics {
            cluster_name: cluster.name.clone(),
            status: if drift_running { "running" } else { "paused" }.to_string(),
            generation: store.generation(),
            summary: store.summary(),
            gpus_per_node: cluster.hardware.gpus_per_node,
            nvlink_bw_gb_s: cluster.hardware.nvlink.bandwidth_gb_s,
            infiniband_bw_gb_s: cluster.hardware.infiniband.bandwidth_gb_s,
            nodes,
            recent_events,
            last_command: last_command.map(str::to_string),
            timestamp_ms: now_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// I/O helpers
// ---------------------------------------------------------------------------

/// Atomically write metrics to `path`.
/// Uses a .tmp intermediate file + rename to avoid torn reads by the viz.
pub fn write_metrics(path: &Path, metrics: &LiveMetrics) -> Result<()> {
    let json = serde_json::to_string(metrics)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read the latest metrics snapshot. Returns None if the file doesn't exist
/// or can't be parsed (e.g. no shell has started yet).
pub fn read_metrics(path: &Path) -> Option<LiveMetrics> {
    let data = fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, inject_port_fault, FaultKind, PortFaultKind};

    #[test]
    fn snapshot_mirrors_the_store() {
        let mut store = ClusterStore::superpod("lab");
        inject_fault(&mut store, "dgx-02", 5, FaultKind::Ecc).unwrap();
        inject_port_fault(&mut store, "dgx-06", "mlx5_0", 1, PortFaultKind::LinkDown).unwrap();
        let m = LiveMetrics::from_store(&store, true, Some("nvidia-smi"));
        assert_eq!(m.status, "running");
        assert_eq!(m.summary.critical_gpus, 1);
        assert_eq!(m.nodes.len(), 8);
        assert_eq!(m.nodes[2].gpus[5].health, HealthStatus::Critical);
        assert_eq!(m.nodes[2].health, HealthStatus::Critical);
        assert_eq!(m.nodes[6].degraded_ports, 1);
        assert_eq!(m.nodes[6].health, HealthStatus::Warning);
        assert!(m.recent_events.len() <= RECENT_EVENTS);
    }

    #[test]
    fn write_then_read() {
        let path = std::env::temp_dir().join(format!("dgxsim_metrics_test_{}.json", std::process::id()));
        let store = ClusterStore::superpod("lab");
        let m = LiveMetrics::from_store(&store, false, None);
        write_metrics(&path, &m).unwrap();
        let back = read_metrics(&path).unwrap();
        assert_eq!(back.summary, m.summary);
        assert_eq!(back.nodes, m.nodes);
        assert_eq!(back.status, "paused");
        fs::remove_file(&path).unwrap();
        assert!(read_metrics(&path).is_none());
    }
}
