/// Cluster state model for a DGX SuperPOD.
///
/// Topology:
///   Cluster
///   ├── dgx-00  (GPUs 0-7, 18 NVLinks each via 4 NVSwitches, mlx5_0..7)
///   ├── dgx-01
///   └── ...
///       connected by a rail-optimized NDR InfiniBand fabric (HCA i → leaf i)
///
/// Everything here is a plain serializable record so the whole cluster can be
/// exported and re-imported unchanged.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::gpu::{EccErrors, Gpu, HealthStatus, PcieStatus};
use crate::interconnect::{
    nvswitch_for_link, Hca, HcaPort, InfiniBandConfig, NVLinkConfig, NvLink, PortCounters,
    PortState,
};

const GPU_BUS: [&str; 8] = ["18", "2a", "3a", "5d", "9a", "ab", "ba", "db"];
const HCA_BUS: [&str; 8] = ["1a", "3c", "4d", "5e", "9c", "bc", "cc", "dc"];

// ---------------------------------------------------------------------------
// HardwareSpec
// ---------------------------------------------------------------------------

/// Template every node is built from, and the baseline fault clears restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSpec {
    pub system_model: String,
    pub gpu_name: String,
    pub gpus_per_node: u32,
    pub gpu_memory_mib: u64,
    pub power_limit_w: f64,
    pub idle_power_w: f64,
    pub idle_temperature_c: u32,
    pub sm_clock_mhz: u32,
    pub mem_clock_mhz: u32,
    pub nvlinks_per_gpu: u32,
    pub nvswitches: u32,
    pub hcas_per_node: u32,
    pub hca_type: String,
    pub hca_firmware: String,
    pub nvlink: NVLinkConfig,
    pub infiniband: InfiniBandConfig,
    pub driver_version: String,
    pub cuda_version: String,
    pub dcgm_version: String,
    pub fabric_manager_version: String,
    pub bmc_firmware: String,
    pub bios_version: String,
    pub cpu_model: String,
    pub sockets: u32,
    pub cores_per_socket: u32,
    pub threads_per_core: u32,
    pub memory_gib: u64,
    pub os_name: String,
    pub kernel: String,
    /// Seconds the nodes have been up when the cluster is created
    pub uptime_secs: u64,
}

impl HardwareSpec {
    /// A DGX H100 system: 8× H100 SXM 80GB, 8× ConnectX-7 NDR.
    pub fn dgx_h100() -> Self {
        HardwareSpec {
            system_model: "DGX H100".to_string(),
            gpu_name: "NVIDIA H100 80GB HBM3".to_string(),
            gpus_per_node: 8,
            gpu_memory_mib: 81559,
            power_limit_w: 700.0,
            idle_power_w: 72.0,
            idle_temperature_c: 34,
            sm_clock_mhz: 1980,
            mem_clock_mhz: 2619,
            nvlinks_per_gpu: 18,
            nvswitches: 4,
            hcas_per_node: 8,
            hca_type: "MT4129".to_string(),
            hca_firmware: "28.39.1002".to_string(),
            nvlink: NVLinkConfig::h100(),
            infiniband: InfiniBandConfig::ndr(),
            driver_version: "535.129.03".to_string(),
            cuda_version: "12.2".to_string(),
            dcgm_version: "3.3.5".to_string(),
            fabric_manager_version: "535.129.03".to_string(),
            bmc_firmware: "24.01.05".to_string(),
            bios_version: "1.5.0".to_string(),
            cpu_model: "Intel(R) Xeon(R) Platinum 8480C".to_string(),
            sockets: 2,
            cores_per_socket: 56,
            threads_per_core: 2,
            memory_gib: 2048,
            os_name: "Ubuntu 22.04.4 LTS".to_string(),
            kernel: "5.15.0-1042-nvidia".to_string(),
            uptime_secs: 12 * 86_400 + 4 * 3_600 + 17 * 60,
        }
    }

    /// The canonical healthy GPU `gpu_id` on node number `node_index`.
    pub fn baseline_gpu(&self, node_index: usize, gpu_id: u32) -> Gpu {
        let tag = splitmix((node_index as u64) << 8 | gpu_id as u64);
        let bus = GPU_BUS
            .get(gpu_id as usize)
            .map(|b| b.to_string())
            .unwrap_or_else(|| format!("{:02x}", 0xe0 + gpu_id));
        Gpu {
            id: gpu_id,
            name: self.gpu_name.clone(),
            uuid: format!(
                "GPU-{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
                (tag >> 32) as u32,
                (tag >> 16) as u16,
                tag as u16,
                (tag >> 48) as u16,
                splitmix(tag) & 0xffff_ffff_ffff
            ),
            serial: format!("16542{:02}{:02}{:04}", node_index, gpu_id, tag % 10_000),
            bus_id: format!("00000000:{}:00.0", bus.to_uppercase()),
            utilization_pct: 0,
            temperature_c: self.idle_temperature_c,
            power_draw_w: self.idle_power_w,
            power_limit_w: self.power_limit_w,
            sm_clock_mhz: self.sm_clock_mhz,
            mem_clock_mhz: self.mem_clock_mhz,
            memory_used_mib: 0,
            memory_total_mib: self.gpu_memory_mib,
            health_status: HealthStatus::OK,
            xid_errors: Vec::new(),
            ecc: EccErrors::default(),
            nvlinks: (0..self.nvlinks_per_gpu)
                .map(|l| NvLink::active(l, nvswitch_for_link(l, self.nvswitches)))
                .collect(),
            pcie: PcieStatus::gen5_x16(),
        }
    }

    /// The canonical healthy HCA `hca` on node number `node_index`.
    pub fn baseline_hca(&self, node_index: usize, hca: u32) -> Hca {
        let bus = HCA_BUS
            .get(hca as usize)
            .map(|b| b.to_string())
            .unwrap_or_else(|| format!("{:02x}", 0xe8 + hca));
        let guid = format!("0xa088c20300{:02x}{:02x}{:02x}", node_index, hca, 0x10 + hca);
        Hca {
            id: format!("mlx5_{}", hca),
            ca_type: self.hca_type.clone(),
            firmware: self.hca_firmware.clone(),
            node_guid: guid.clone(),
            bus_id: format!("0000:{}:00.0", bus),
            ports: vec![HcaPort {
                port: 1,
                state: PortState::Active,
                rate_gbps: self.infiniband.rate_gbps,
                lid: 100 + node_index as u32 * 16 + hca,
                port_guid: guid,
                counters: PortCounters::default(),
            }],
        }
    }

    pub fn logical_cpus(&self) -> u32 {
        self.sockets * self.cores_per_socket * self.threads_per_core
    }
}

fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

// ---------------------------------------------------------------------------
// Slurm state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlurmState {
    Idle,
    Alloc,
    Mix,
    Drain,
    Down,
}

impl std::fmt::Display for SlurmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlurmState::Idle  => f.pad("idle"),
            SlurmState::Alloc => f.pad("alloc"),
            SlurmState::Mix   => f.pad("mix"),
            SlurmState::Drain => f.pad("drain"),
            SlurmState::Down  => f.pad("down"),
        }
    }
}

impl std::str::FromStr for SlurmState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "idle" | "resume" => Ok(SlurmState::Idle),
            "alloc" | "allocated" => Ok(SlurmState::Alloc),
            "mix" | "mixed" => Ok(SlurmState::Mix),
            "drain" | "drained" => Ok(SlurmState::Drain),
            "down" => Ok(SlurmState::Down),
            other => Err(format!("Invalid node state specified: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DgxNode {
    pub id: String,
    pub hostname: String,
    pub mgmt_ip: String,
    pub bmc_ip: String,
    pub gpus: Vec<Gpu>,
    pub hcas: Vec<Hca>,
    pub slurm_state: SlurmState,
    pub slurm_reason: Option<String>,
}

impl DgxNode {
    pub fn from_spec(index: usize, spec: &HardwareSpec) -> Self {
        let id = format!("dgx-{:02}", index);
        DgxNode {
            hostname: id.clone(),
            id,
            mgmt_ip: format!("10.10.0.{}", 10 + index),
            bmc_ip: format!("10.10.1.{}", 10 + index),
            gpus: (0..spec.gpus_per_node).map(|g| spec.baseline_gpu(index, g)).collect(),
            hcas: (0..spec.hcas_per_node).map(|h| spec.baseline_hca(index, h)).collect(),
            slurm_state: SlurmState::Idle,
            slurm_reason: None,
        }
    }

    pub fn gpu(&self, id: u32) -> Option<&Gpu> {
        self.gpus.iter().find(|g| g.id == id)
    }

    pub fn hca(&self, id: &str) -> Option<&Hca> {
        self.hcas.iter().find(|h| h.id == id)
    }

    pub fn ports(&self) -> impl Iterator<Item = (&Hca, &HcaPort)> {
        self.hcas.iter().flat_map(|h| h.ports.iter().map(move |p| (h, p)))
    }

    /// Worst GPU verdict, raised to Warning by any degraded IB port.
    pub fn health(&self) -> HealthStatus {
        let gpus = self.gpus.iter().map(|g| g.health()).max().unwrap_or(HealthStatus::OK);
        if self.ports().any(|(_, p)| p.is_degraded()) {
            gpus.max(HealthStatus::Warning)
        } else {
            gpus
        }
    }

    /// Position of this node in the cluster's naming scheme ("dgx-03" → 3).
    /// None when the id carries no numeric suffix.
    pub fn index(&self) -> Option<usize> {
        self.id.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub hardware: HardwareSpec,
    pub nodes: Vec<DgxNode>,
}

impl Cluster {
    pub fn new(name: &str, num_nodes: usize, hardware: HardwareSpec) -> Self {
        let nodes = (0..num_nodes).map(|i| DgxNode::from_spec(i, &hardware)).collect();
        Cluster { name: name.to_string(), hardware, nodes }
    }

    /// The standard 8-node DGX H100 SuperPOD scalable unit.
    pub fn superpod(name: &str) -> Self {
        Self::new(name, 8, HardwareSpec::dgx_h100())
    }

    pub fn node(&self, id: &str) -> Option<&DgxNode> {
        self.nodes.iter().find(|n| n.id == id || n.hostname == id)
    }

    /// Resolve a node by id, hostname, management or BMC address.
    pub fn node_by_address(&self, addr: &str) -> Option<&DgxNode> {
        let host = addr.trim_end_matches("-bmc");
        self.nodes
            .iter()
            .find(|n| n.id == host || n.hostname == host || n.mgmt_ip == addr || n.bmc_ip == addr)
    }

    pub fn gpu(&self, node: &str, gpu: u32) -> Option<&Gpu> {
        self.node(node).and_then(|n| n.gpu(gpu))
    }

    pub fn total_gpus(&self) -> usize {
        self.nodes.iter().map(|n| n.gpus.len()).sum()
    }

    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary::of(self)
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Cluster-wide counts every dashboard-style tool reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub total_nodes: usize,
    pub total_gpus: usize,
    pub healthy_gpus: usize,
    pub warning_gpus: usize,
    pub critical_gpus: usize,
    pub active_nvlinks: usize,
    pub down_nvlinks: usize,
    pub active_ib_ports: usize,
    pub degraded_ib_ports: usize,
    pub avg_utilization_pct: f64,
    pub avg_temperature_c: f64,
    pub total_power_w: f64,
    pub nodes_by_slurm_state: BTreeMap<SlurmState, usize>,
}

impl ClusterSummary {
    pub fn of(cluster: &Cluster) -> Self {
        let mut s = ClusterSummary { total_nodes: cluster.nodes.len(), ..Default::default() };
        let mut util = 0u64;
        let mut temp = 0u64;
        for node in &cluster.nodes {
            *s.nodes_by_slurm_state.entry(node.slurm_state).or_default() += 1;
            for gpu in &node.gpus {
                s.total_gpus += 1;
                match gpu.health() {
                    HealthStatus::OK => s.healthy_gpus += 1,
                    HealthStatus::Warning => s.warning_gpus += 1,
                    HealthStatus::Critical => s.critical_gpus += 1,
                }
                s.active_nvlinks += gpu.active_nvlinks();
                s.down_nvlinks += gpu.down_nvlinks();
                util += gpu.utilization_pct as u64;
                temp += gpu.temperature_c as u64;
                s.total_power_w += gpu.power_draw_w;
            }
            for (_, port) in node.ports() {
                if port.is_degraded() {
                    s.degraded_ib_ports += 1;
                } else {
                    s.active_ib_ports += 1;
                }
            }
        }
        if s.total_gpus > 0 {
            s.avg_utilization_pct = util as f64 / s.total_gpus as f64;
            s.avg_temperature_c = temp as f64 / s.total_gpus as f64;
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superpod_has_64_healthy_gpus() {
        let c = Cluster::superpod("test");
        let s = c.summary();
        assert_eq!(s.total_nodes, 8);
        assert_eq!(s.total_gpus, 64);
        assert_eq!(s.healthy_gpus, 64);
        assert_eq!(s.active_nvlinks, 64 * 18);
        assert_eq!(s.active_ib_ports, 64);
        assert_eq!(s.nodes_by_slurm_state.get(&SlurmState::Idle), Some(&8));
    }

    #[test]
    fn ids_are_unique() {
        let c = Cluster::superpod("test");
        let mut ids: Vec<&str> = c.nodes.iter().map(|n| n.id.as_str()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        let uuids: std::collections::HashSet<&str> =
            c.nodes.iter().flat_map(|n| n.gpus.iter().map(|g| g.uuid.as_str())).collect();
        assert_eq!(uuids.len(), 64);
    }

    #[test]
    fn node_lookup_by_address() {
        let c = Cluster::superpod("test");
        assert_eq!(c.node_by_address("10.10.1.13").map(|n| n.id.as_str()), Some("dgx-03"));
        assert_eq!(c.node_by_address("dgx-05-bmc").map(|n| n.id.as_str()), Some("dgx-05"));
        assert!(c.node("dgx-99").is_none());
        assert_eq!(c.nodes[6].index(), Some(6));
        let mut spare = c.nodes[6].clone();
        spare.id = "dgx-spare".into();
        assert_eq!(spare.index(), None);
    }

    #[test]
    fn slurm_state_parses_operator_words() {
        assert_eq!("RESUME".parse::<SlurmState>(), Ok(SlurmState::Idle));
        assert_eq!("drain".parse::<SlurmState>(), Ok(SlurmState::Drain));
        assert!("sleepy".parse::<SlurmState>().is_err());
    }

    #[test]
    fn degraded_port_warns_node() {
        let mut c = Cluster::superpod("test");
        c.nodes[0].hcas[2].ports[0].state = PortState::Down;
        assert_eq!(c.nodes[0].health(), HealthStatus::Warning);
        assert_eq!(c.summary().degraded_ib_ports, 1);
    }
}
