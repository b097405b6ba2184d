/// The single owner of cluster state.
///
/// Reads go through `cluster()`; writes go through the named actions below.
/// Every GPU write re-derives `health_status`, so no caller can leave a stored
/// verdict that disagrees with the derivation rule.
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cluster::{Cluster, ClusterSummary, DgxNode, HardwareSpec, SlurmState};
use crate::error::{Result, SimError};
use crate::gpu::{check_health, derive_health, EccErrors, Gpu, PcieStatus, XidError};
use crate::interconnect::{HcaPort, NvLink, PortCounters, PortState};

/// Shared handle used when a writer runs on another thread (metrics drift).
pub type SharedStore = Arc<RwLock<ClusterStore>>;

/// Partial GPU update: `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuUpdate {
    pub utilization_pct: Option<u32>,
    pub temperature_c: Option<u32>,
    pub power_draw_w: Option<f64>,
    pub sm_clock_mhz: Option<u32>,
    pub mem_clock_mhz: Option<u32>,
    pub memory_used_mib: Option<u64>,
    pub xid_errors: Option<Vec<XidError>>,
    pub ecc: Option<EccErrors>,
    pub nvlinks: Option<Vec<NvLink>>,
    pub pcie: Option<PcieStatus>,
}

impl GpuUpdate {
    /// An update that rewrites every mutable field to `gpu`'s values.
    pub fn replace_with(gpu: &Gpu) -> Self {
        GpuUpdate {
            utilization_pct: Some(gpu.utilization_pct),
            temperature_c: Some(gpu.temperature_c),
            power_draw_w: Some(gpu.power_draw_w),
            sm_clock_mhz: Some(gpu.sm_clock_mhz),
            mem_clock_mhz: Some(gpu.mem_clock_mhz),
            memory_used_mib: Some(gpu.memory_used_mib),
            xid_errors: Some(gpu.xid_errors.clone()),
            ecc: Some(gpu.ecc),
            nvlinks: Some(gpu.nvlinks.clone()),
            pcie: Some(gpu.pcie.clone()),
        }
    }

    fn apply(self, gpu: &mut Gpu) {
        if let Some(v) = self.utilization_pct {
            gpu.utilization_pct = v.min(100);
        }
        if let Some(v) = self.temperature_c {
            gpu.temperature_c = v;
        }
        if let Some(v) = self.power_draw_w {
            gpu.power_draw_w = v;
        }
        if let Some(v) = self.sm_clock_mhz {
            gpu.sm_clock_mhz = v;
        }
        if let Some(v) = self.mem_clock_mhz {
            gpu.mem_clock_mhz = v;
        }
        if let Some(v) = self.memory_used_mib {
            gpu.memory_used_mib = v.min(gpu.memory_total_mib);
        }
        if let Some(v) = self.xid_errors {
            gpu.xid_errors = v;
        }
        if let Some(v) = self.ecc {
            gpu.ecc = v;
        }
        if let Some(v) = self.nvlinks {
            gpu.nvlinks = v;
        }
        if let Some(v) = self.pcie {
            gpu.pcie = v;
        }
        gpu.health_status = derive_health(gpu);
    }
}

/// Partial IB port update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortUpdate {
    pub state: Option<PortState>,
    pub counters: Option<PortCounters>,
}

/// A fault or state change worth showing in timelines (viz, nvsm alerts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub node: String,
    pub message: String,
}

const EVENT_LOG_LIMIT: usize = 64;

pub struct ClusterStore {
    cluster: Cluster,
    nodes_at_reset: usize,
    events: Vec<EventRecord>,
    generation: u64,
}

impl ClusterStore {
    pub fn new(cluster: Cluster) -> Self {
        let nodes_at_reset = cluster.nodes.len();
        ClusterStore { cluster, nodes_at_reset, events: Vec::new(), generation: 0 }
    }

    pub fn superpod(name: &str) -> Self {
        Self::new(Cluster::superpod(name))
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn summary(&self) -> ClusterSummary {
        self.cluster.summary()
    }

    /// Incremented by every successful mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    pub fn record_event(&mut self, node: &str, message: String) {
        self.events.push(EventRecord { timestamp: Utc::now(), node: node.to_string(), message });
        if self.events.len() > EVENT_LOG_LIMIT {
            let excess = self.events.len() - EVENT_LOG_LIMIT;
            self.events.drain(..excess);
        }
    }

    // -----------------------------------------------------------------------
    // Mutation actions
    // -----------------------------------------------------------------------

    /// Apply a partial update to one GPU and return its new state.
    pub fn update_gpu(&mut self, node_id: &str, gpu_id: u32, update: GpuUpdate) -> Result<Gpu> {
        let gpu = self.gpu_mut(node_id, gpu_id)?;
        let before = gpu.health_status;
        update.apply(gpu);
        let after = gpu.clone();
        self.generation += 1;
        if before != after.health_status {
            info!(node = node_id, gpu = gpu_id, from = %before, to = %after.health_status, "GPU health changed");
        }
        Ok(after)
    }

    /// Set the Slurm-visible node state. The only path that changes it.
    pub fn set_slurm_state(
        &mut self,
        node_id: &str,
        state: SlurmState,
        reason: Option<String>,
    ) -> Result<()> {
        let node = self.node_mut(node_id)?;
        node.slurm_state = state;
        node.slurm_reason = match state {
            SlurmState::Drain | SlurmState::Down => reason,
            _ => None,
        };
        let msg = format!("slurm state set to {}", state);
        info!(node = node_id, state = %state, "slurm state updated");
        self.generation += 1;
        self.record_event(node_id, msg);
        Ok(())
    }

    pub fn update_port(
        &mut self,
        node_id: &str,
        hca_id: &str,
        port: u32,
        update: PortUpdate,
    ) -> Result<HcaPort> {
        let node = self.node_mut(node_id)?;
        let port_ref = node
            .hcas
            .iter_mut()
            .find(|h| h.id == hca_id)
            .and_then(|h| h.ports.iter_mut().find(|p| p.port == port))
            .ok_or_else(|| SimError::NotFound(format!("{} port {} not found on {}", hca_id, port, node_id)))?;
        if let Some(state) = update.state {
            port_ref.state = state;
        }
        if let Some(counters) = update.counters {
            port_ref.counters = counters;
        }
        let after = port_ref.clone();
        self.generation += 1;
        info!(node = node_id, hca = hca_id, port, state = %after.state, "IB port updated");
        Ok(after)
    }

    /// Rebuild every node from the hardware template.
    pub fn reset_cluster(&mut self) {
        let hardware = self.cluster.hardware.clone();
        let name = self.cluster.name.clone();
        self.cluster = Cluster::new(&name, self.nodes_at_reset, hardware);
        self.events.clear();
        self.generation += 1;
        info!(cluster = %name, nodes = self.nodes_at_reset, "cluster reset to baseline");
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn export_cluster(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.cluster)?)
    }

    /// Replace the cluster with a previously exported document. The current
    /// state is untouched if the document is rejected.
    pub fn import_cluster(&mut self, json: &str) -> Result<()> {
        let cluster: Cluster = serde_json::from_str(json)?;
        if let Err(e) = check_invariants(&cluster) {
            warn!(error = %e, "rejected cluster import");
            return Err(e);
        }
        info!(cluster = %cluster.name, nodes = cluster.nodes.len(), "cluster imported");
        self.nodes_at_reset = cluster.nodes.len();
        self.cluster = cluster;
        self.events.clear();
        self.generation += 1;
        Ok(())
    }

    pub fn check_invariants(&self) -> Result<()> {
        check_invariants(&self.cluster)
    }

    pub fn hardware(&self) -> &HardwareSpec {
        &self.cluster.hardware
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn node_mut(&mut self, node_id: &str) -> Result<&mut DgxNode> {
        self.cluster
            .nodes
            .iter_mut()
            .find(|n| n.id == node_id || n.hostname == node_id)
            .ok_or_else(|| SimError::NotFound(format!("node {} not found", node_id)))
    }

    fn gpu_mut(&mut self, node_id: &str, gpu_id: u32) -> Result<&mut Gpu> {
        self.node_mut(node_id)?
            .gpus
            .iter_mut()
            .find(|g| g.id == gpu_id)
            .ok_or_else(|| SimError::NotFound(format!("GPU {} not found on {}", gpu_id, node_id)))
    }
}

/// Structural and health invariants of a cluster document.
pub fn check_invariants(cluster: &Cluster) -> Result<()> {
    let mut node_ids = HashSet::new();
    for node in &cluster.nodes {
        if !node_ids.insert(node.id.as_str()) {
            return Err(SimError::Import(format!("duplicate node id {}", node.id)));
        }
        if node.index().is_none() {
            return Err(SimError::Import(format!("node id {} has no numeric suffix", node.id)));
        }
        let mut gpu_ids = HashSet::new();
        for gpu in &node.gpus {
            if gpu.id >= cluster.hardware.gpus_per_node {
                return Err(SimError::Import(format!(
                    "{} GPU id {} outside 0..{}",
                    node.id, gpu.id, cluster.hardware.gpus_per_node
                )));
            }
            if !gpu_ids.insert(gpu.id) {
                return Err(SimError::Import(format!("{} has duplicate GPU id {}", node.id, gpu.id)));
            }
            check_health(&node.id, gpu)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HealthStatus;

    #[test]
    fn update_rederives_health() {
        let mut store = ClusterStore::superpod("t");
        let gpu = store
            .update_gpu("dgx-01", 4, GpuUpdate { temperature_c: Some(90), ..Default::default() })
            .unwrap();
        assert_eq!(gpu.health_status, HealthStatus::Warning);
        assert_eq!(store.summary().warning_gpus, 1);
        let gpu = store
            .update_gpu("dgx-01", 4, GpuUpdate { temperature_c: Some(40), ..Default::default() })
            .unwrap();
        assert_eq!(gpu.health_status, HealthStatus::OK);
    }

    #[test]
    fn missing_targets_are_not_found() {
        let mut store = ClusterStore::superpod("t");
        assert!(matches!(store.update_gpu("dgx-42", 0, GpuUpdate::default()), Err(SimError::NotFound(_))));
        assert!(matches!(store.update_gpu("dgx-00", 8, GpuUpdate::default()), Err(SimError::NotFound(_))));
        assert!(matches!(
            store.set_slurm_state("nope", SlurmState::Drain, None),
            Err(SimError::NotFound(_))
        ));
    }

    #[test]
    fn reason_is_kept_only_for_drain_and_down() {
        let mut store = ClusterStore::superpod("t");
        store.set_slurm_state("dgx-02", SlurmState::Drain, Some("xid 79".into())).unwrap();
        assert_eq!(store.cluster().nodes[2].slurm_reason.as_deref(), Some("xid 79"));
        store.set_slurm_state("dgx-02", SlurmState::Idle, Some("ignored".into())).unwrap();
        assert_eq!(store.cluster().nodes[2].slurm_reason, None);
    }

    #[test]
    fn export_import_round_trip() {
        let mut store = ClusterStore::superpod("t");
        store.update_gpu("dgx-03", 2, GpuUpdate { power_draw_w: Some(412.37), ..Default::default() }).unwrap();
        let json = store.export_cluster().unwrap();
        let mut other = ClusterStore::superpod("other");
        other.import_cluster(&json).unwrap();
        assert_eq!(other.cluster(), store.cluster());
    }

    #[test]
    fn import_rejects_inconsistent_health() {
        let mut store = ClusterStore::superpod("t");
        let mut cluster = store.cluster().clone();
        cluster.nodes[0].gpus[0].temperature_c = 99;
        let json = serde_json::to_string(&cluster).unwrap();
        assert!(matches!(store.import_cluster(&json), Err(SimError::InvariantViolation(_))));
        assert_eq!(store.cluster().nodes[0].gpus[0].temperature_c, 34);
    }

    #[test]
    fn import_rejects_duplicate_nodes() {
        let mut store = ClusterStore::superpod("t");
        let mut cluster = store.cluster().clone();
        cluster.nodes[1].id = "dgx-00".into();
        let json = serde_json::to_string(&cluster).unwrap();
        assert!(matches!(store.import_cluster(&json), Err(SimError::Import(_))));
    }

    #[test]
    fn import_rejects_unnumbered_nodes() {
        let mut store = ClusterStore::superpod("t");
        let mut cluster = store.cluster().clone();
        cluster.nodes[2].id = "dgx-spare".into();
        let json = serde_json::to_string(&cluster).unwrap();
        assert!(matches!(store.import_cluster(&json), Err(SimError::Import(_))));
        assert_eq!(store.cluster().nodes[2].id, "dgx-02");
    }

    #[test]
    fn reset_restores_template() {
        let mut store = ClusterStore::superpod("t");
        store.update_gpu("dgx-00", 0, GpuUpdate { utilization_pct: Some(99), ..Default::default() }).unwrap();
        store.set_slurm_state("dgx-00", SlurmState::Down, None).unwrap();
        store.reset_cluster();
        assert_eq!(store.cluster(), &Cluster::superpod("t"));
    }
}
