/// Fault injection engine.
///
/// Translates a fault category into one coherent bundle of field mutations and
/// writes it through `ClusterStore::update_gpu` (or `update_port`), so a fault
/// is either fully visible to every simulator or not visible at all.
use chrono::Utc;
use tracing::info;

use crate::error::{Result, SimError};
use crate::gpu::{Gpu, XidError};
use crate::interconnect::{NvLinkStatus, PortCounters, PortState};
use crate::store::{ClusterStore, GpuUpdate, PortUpdate};

/// XID recorded by a plain `xid` fault: GPU has fallen off the bus.
pub const DEFAULT_XID: u32 = 79;
/// Temperature asserted by a thermal fault.
pub const THERMAL_FAULT_C: u32 = 88;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Xid,
    Ecc,
    Thermal,
    NvLink,
    Power,
    Pcie,
}

impl FaultKind {
    pub const ALL: [FaultKind; 6] = [
        FaultKind::Xid,
        FaultKind::Ecc,
        FaultKind::Thermal,
        FaultKind::NvLink,
        FaultKind::Power,
        FaultKind::Pcie,
    ];
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::Xid     => f.pad("xid"),
            FaultKind::Ecc     => f.pad("ecc"),
            FaultKind::Thermal => f.pad("thermal"),
            FaultKind::NvLink  => f.pad("nvlink"),
            FaultKind::Power   => f.pad("power"),
            FaultKind::Pcie    => f.pad("pcie"),
        }
    }
}

impl std::str::FromStr for FaultKind {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "xid" => Ok(FaultKind::Xid),
            "ecc" => Ok(FaultKind::Ecc),
            "thermal" => Ok(FaultKind::Thermal),
            "nvlink" => Ok(FaultKind::NvLink),
            "power" => Ok(FaultKind::Power),
            "pcie" => Ok(FaultKind::Pcie),
            other => Err(SimError::Usage(format!(
                "unknown fault kind '{}' (expected xid, ecc, thermal, nvlink, power, pcie)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFaultKind {
    LinkDown,
    SymbolErrors,
}

impl std::str::FromStr for PortFaultKind {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "link_down" | "down" => Ok(PortFaultKind::LinkDown),
            "symbol_errors" | "errors" => Ok(PortFaultKind::SymbolErrors),
            other => Err(SimError::Usage(format!(
                "unknown port fault '{}' (expected link_down, symbol_errors)",
                other
            ))),
        }
    }
}

/// Compute the mutation bundle for `kind` against the GPU's current state.
pub fn fault_update(gpu: &Gpu, kind: FaultKind, xid_code: u32) -> GpuUpdate {
    match kind {
        FaultKind::Xid => {
            let mut xids = gpu.xid_errors.clone();
            xids.push(XidError { code: xid_code, timestamp: Utc::now() });
            GpuUpdate { xid_errors: Some(xids), ..Default::default() }
        }
        FaultKind::Ecc => {
            let mut ecc = gpu.ecc;
            ecc.volatile.double_bit += 1;
            ecc.aggregate.double_bit += 1;
            ecc.volatile.single_bit += 4;
            ecc.aggregate.single_bit += 4;
            GpuUpdate { ecc: Some(ecc), ..Default::default() }
        }
        FaultKind::Thermal => GpuUpdate {
            temperature_c: Some(gpu.temperature_c.max(THERMAL_FAULT_C)),
            sm_clock_mhz: Some(gpu.sm_clock_mhz * 7 / 10),
            ..Default::default()
        },
        FaultKind::NvLink => {
            let mut links = gpu.nvlinks.clone();
            // lowest Active link goes down; if all are down, pile errors on link 0
            let target = links.iter().position(|l| l.is_active()).unwrap_or(0);
            if let Some(link) = links.get_mut(target) {
                link.status = NvLinkStatus::Down;
                link.tx_errors += 16;
                link.rx_errors += 24;
            }
            GpuUpdate { nvlinks: Some(links), ..Default::default() }
        }
        FaultKind::Power => GpuUpdate {
            power_draw_w: Some((gpu.power_limit_w * 1.12).round()),
            ..Default::default()
        },
        FaultKind::Pcie => {
            let mut pcie = gpu.pcie.clone();
            pcie.link_width = (pcie.max_link_width / 2).max(1);
            pcie.replay_errors += 128;
            pcie.correctable_errors += 32;
            GpuUpdate { pcie: Some(pcie), ..Default::default() }
        }
    }
}

/// Inject `kind` into one GPU and return its new state.
pub fn inject_fault(store: &mut ClusterStore, node_id: &str, gpu_id: u32, kind: FaultKind) -> Result<Gpu> {
    inject(store, node_id, gpu_id, kind, DEFAULT_XID)
}

/// Inject a specific XID code.
pub fn inject_xid(store: &mut ClusterStore, node_id: &str, gpu_id: u32, code: u32) -> Result<Gpu> {
    inject(store, node_id, gpu_id, FaultKind::Xid, code)
}

fn inject(store: &mut ClusterStore, node_id: &str, gpu_id: u32, kind: FaultKind, code: u32) -> Result<Gpu> {
    let current = store
        .cluster()
        .gpu(node_id, gpu_id)
        .ok_or_else(|| SimError::NotFound(format!("GPU {} not found on {}", gpu_id, node_id)))?;
    let update = fault_update(current, kind, code);
    let gpu = store.update_gpu(node_id, gpu_id, update)?;
    info!(node = node_id, gpu = gpu_id, kind = %kind, health = %gpu.health_status, "fault injected");
    let detail = if kind == FaultKind::Xid { format!("xid {}", code) } else { kind.to_string() };
    store.record_event(node_id, format!("GPU {} fault injected: {} -> {}", gpu_id, detail, gpu.health_status));
    Ok(gpu)
}

/// Restore one GPU to the canonical healthy baseline.
pub fn clear_faults(store: &mut ClusterStore, node_id: &str, gpu_id: u32) -> Result<Gpu> {
    let node = store
        .cluster()
        .node(node_id)
        .ok_or_else(|| SimError::NotFound(format!("node {} not found", node_id)))?;
    if node.gpu(gpu_id).is_none() {
        return Err(SimError::NotFound(format!("GPU {} not found on {}", gpu_id, node_id)));
    }
    let index = node
        .index()
        .ok_or_else(|| SimError::InvariantViolation(format!("node id {} has no numeric suffix", node_id)))?;
    let baseline = store.hardware().baseline_gpu(index, gpu_id);
    let gpu = store.update_gpu(node_id, gpu_id, GpuUpdate::replace_with(&baseline))?;
    info!(node = node_id, gpu = gpu_id, "faults cleared");
    store.record_event(node_id, format!("GPU {} faults cleared", gpu_id));
    Ok(gpu)
}

/// Clear every GPU and IB port on one node.
pub fn clear_node_faults(store: &mut ClusterStore, node_id: &str) -> Result<()> {
    let node = store
        .cluster()
        .node(node_id)
        .ok_or_else(|| SimError::NotFound(format!("node {} not found", node_id)))?;
    let gpus: Vec<u32> = node.gpus.iter().map(|g| g.id).collect();
    let ports: Vec<(String, u32)> = node.ports().map(|(h, p)| (h.id.clone(), p.port)).collect();
    for g in gpus {
        clear_faults(store, node_id, g)?;
    }
    for (hca, port) in ports {
        clear_port_faults(store, node_id, &hca, port)?;
    }
    Ok(())
}

/// Clear every fault in the cluster without touching Slurm state.
pub fn clear_all_faults(store: &mut ClusterStore) -> Result<()> {
    let ids: Vec<String> = store.cluster().nodes.iter().map(|n| n.id.clone()).collect();
    for id in ids {
        clear_node_faults(store, &id)?;
    }
    Ok(())
}

pub fn inject_port_fault(
    store: &mut ClusterStore,
    node_id: &str,
    hca_id: &str,
    port: u32,
    kind: PortFaultKind,
) -> Result<()> {
    let current = store
        .cluster()
        .node(node_id)
        .and_then(|n| n.hca(hca_id))
        .and_then(|h| h.port(port))
        .ok_or_else(|| SimError::NotFound(format!("{} port {} not found on {}", hca_id, port, node_id)))?;
    let mut counters = current.counters.clone();
    let update = match kind {
        PortFaultKind::LinkDown => {
            counters.link_downed += 1;
            PortUpdate { state: Some(PortState::Down), counters: Some(counters) }
        }
        PortFaultKind::SymbolErrors => {
            counters.symbol_errors += 1_204;
            counters.port_rcv_errors += 37;
            PortUpdate { state: None, counters: Some(counters) }
        }
    };
    store.update_port(node_id, hca_id, port, update)?;
    store.record_event(node_id, format!("{} port {} fault injected: {:?}", hca_id, port, kind));
    Ok(())
}

pub fn clear_port_faults(store: &mut ClusterStore, node_id: &str, hca_id: &str, port: u32) -> Result<()> {
    store.update_port(
        node_id,
        hca_id,
        port,
        PortUpdate { state: Some(PortState::Active), counters: Some(PortCounters::default()) },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SlurmState;
    use crate::gpu::HealthStatus;

    #[test]
    fn each_kind_reaches_documented_health() {
        for kind in FaultKind::ALL {
            let mut store = ClusterStore::superpod("t");
            let gpu = inject_fault(&mut store, "dgx-00", 1, kind).unwrap();
            let expected = match kind {
                FaultKind::Xid | FaultKind::Ecc => HealthStatus::Critical,
                _ => HealthStatus::Warning,
            };
            assert_eq!(gpu.health_status, expected, "{}", kind);
        }
    }

    #[test]
    fn thermal_fault_throttles_clock() {
        let mut store = ClusterStore::superpod("t");
        let gpu = inject_fault(&mut store, "dgx-02", 3, FaultKind::Thermal).unwrap();
        assert!(gpu.temperature_c >= 85);
        assert!(gpu.sm_clock_mhz < store.hardware().sm_clock_mhz);
    }

    #[test]
    fn repeated_nvlink_faults_take_down_more_links() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 0, FaultKind::NvLink).unwrap();
        let gpu = inject_fault(&mut store, "dgx-00", 0, FaultKind::NvLink).unwrap();
        assert_eq!(gpu.down_nvlinks(), 2);
        assert!(gpu.nvlinks[0].tx_errors > 0 && gpu.nvlinks[1].rx_errors > 0);
    }

    #[test]
    fn clear_is_exact_inverse() {
        for kind in FaultKind::ALL {
            let mut store = ClusterStore::superpod("t");
            let baseline = store.cluster().clone();
            inject_fault(&mut store, "dgx-05", 7, kind).unwrap();
            clear_faults(&mut store, "dgx-05", 7).unwrap();
            assert_eq!(store.cluster(), &baseline, "{}", kind);
        }
    }

    #[test]
    fn faults_never_touch_slurm_state() {
        let mut store = ClusterStore::superpod("t");
        for kind in FaultKind::ALL {
            inject_fault(&mut store, "dgx-01", 0, kind).unwrap();
        }
        assert_eq!(store.cluster().nodes[1].slurm_state, SlurmState::Idle);
    }

    #[test]
    fn port_fault_and_clear() {
        let mut store = ClusterStore::superpod("t");
        inject_port_fault(&mut store, "dgx-04", "mlx5_3", 1, PortFaultKind::LinkDown).unwrap();
        assert_eq!(store.cluster().nodes[4].health(), HealthStatus::Warning);
        clear_node_faults(&mut store, "dgx-04").unwrap();
        assert_eq!(store.cluster().nodes[4].health(), HealthStatus::OK);
        assert!(inject_port_fault(&mut store, "dgx-04", "mlx5_9", 1, PortFaultKind::LinkDown).is_err());
    }

    #[test]
    fn unknown_kind_is_usage_error() {
        assert!(matches!("meteor".parse::<FaultKind>(), Err(SimError::Usage(_))));
        assert_eq!("NVLINK".parse::<FaultKind>().unwrap(), FaultKind::NvLink);
    }
}
