/// Interconnect models for a DGX SuperPOD.
///
/// Two layers live here:
///   - the static bandwidth model (NVLink via NVSwitch inside a node,
///     InfiniBand NDR between nodes) used by the benchmark simulators, and
///   - the per-link state records (`NvLink`, `Hca`, `HcaPort`) that are part of
///     the serializable cluster state and that every fabric-facing tool reads.
///
/// Bandwidth reference:
///   H100 NVLink 4.0: 18 links × 26.562 GB/s ≈ 478 GB/s per direction
///   NDR InfiniBand : 400 Gb/s = 50 GB/s per port
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Bandwidth model
// ---------------------------------------------------------------------------

/// NVLink configuration: intra-node all-to-all via NVSwitch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NVLinkConfig {
    /// Peak unidirectional bandwidth per GPU in GB/s with every link up
    pub bandwidth_gb_s: f64,
    /// Point-to-point latency in microseconds
    pub latency_us: f64,
    /// Per-link bandwidth in GB/s
    pub link_speed_gb_s: f64,
}

impl NVLinkConfig {
    /// H100 SXM: NVLink 4.0, 18 links per GPU
    pub fn h100() -> Self {
        NVLinkConfig { bandwidth_gb_s: 450.0, latency_us: 1.0, link_speed_gb_s: 26.562 }
    }
}

/// InfiniBand fabric configuration: inter-node, rail-optimized fat tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfiniBandConfig {
    /// Per-port bandwidth in GB/s
    pub bandwidth_gb_s: f64,
    /// End-to-end latency in microseconds (including switch hops)
    pub latency_us: f64,
    /// Signalling rate reported by ibstat, in Gb/s
    pub rate_gbps: u32,
}

impl InfiniBandConfig {
    /// NDR InfiniBand 400 Gb/s
    pub fn ndr() -> Self {
        InfiniBandConfig { bandwidth_gb_s: 50.0, latency_us: 2.0, rate_gbps: 400 }
    }
}

/// Effective bandwidth in GB/s from bytes and transfer time.
fn effective_bandwidth_gb_s(bytes: u64, time_us: f64) -> f64 {
    if time_us == 0.0 {
        return 0.0;
    }
    bytes as f64 / time_us / 1_000.0
}

/// AllReduce algorithm selection, as exposed by NCCL_ALGO.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AllReduceAlgorithm {
    /// Time ≈ 2·(N-1)/N · B/bw  +  2·(N-1)·latency
    Ring,
    /// Time ≈ 2·⌈log₂(N)⌉ · (B/bw + latency)
    Tree,
}

impl std::fmt::Display for AllReduceAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllReduceAlgorithm::Ring => f.pad("Ring"),
            AllReduceAlgorithm::Tree => f.pad("Tree"),
        }
    }
}

impl std::str::FromStr for AllReduceAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ring" => Ok(AllReduceAlgorithm::Ring),
            "tree" => Ok(AllReduceAlgorithm::Tree),
            _ => Err(s.to_string()),
        }
    }
}

/// Result of a simulated collective, one row of an nccl-tests report.
#[derive(Debug, Clone)]
pub struct CollectiveStats {
    pub bytes: u64,
    pub num_ranks: usize,
    pub time_us: f64,
    /// bytes / time
    pub alg_bandwidth_gb_s: f64,
    /// NCCL bus bandwidth: 2·(N-1)/N · algbw
    pub bus_bandwidth_gb_s: f64,
}

/// Simulate one AllReduce of `bytes` across `n` ranks over a bottleneck link
/// of `bw_gb_s` / `latency_us`.
pub fn all_reduce(
    n: usize,
    bytes: u64,
    bw_gb_s: f64,
    latency_us: f64,
    algorithm: AllReduceAlgorithm,
) -> CollectiveStats {
    if n < 2 || bw_gb_s <= 0.0 {
        return CollectiveStats {
            bytes,
            num_ranks: n,
            time_us: 0.0,
            alg_bandwidth_gb_s: 0.0,
            bus_bandwidth_gb_s: 0.0,
        };
    }
    let bw_bytes_us = bw_gb_s * 1_000.0;
    let time_us = match algorithm {
        AllReduceAlgorithm::Ring => {
            2.0 * (n - 1) as f64 / n as f64 * bytes as f64 / bw_bytes_us
                + 2.0 * (n - 1) as f64 * latency_us
        }
        AllReduceAlgorithm::Tree => {
            let steps = (n as f64).log2().ceil();
            2.0 * steps * (bytes as f64 / bw_bytes_us + latency_us)
        }
    };
    let alg_bw = effective_bandwidth_gb_s(bytes, time_us);
    CollectiveStats {
        bytes,
        num_ranks: n,
        time_us,
        alg_bandwidth_gb_s: alg_bw,
        bus_bandwidth_gb_s: alg_bw * 2.0 * (n - 1) as f64 / n as f64,
    }
}

// ---------------------------------------------------------------------------
// NVLink state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NvLinkStatus {
    Active,
    Down,
}

impl std::fmt::Display for NvLinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NvLinkStatus::Active => f.pad("Active"),
            NvLinkStatus::Down   => f.pad("Down"),
        }
    }
}

/// One NVLink lane group from a GPU to an NVSwitch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NvLink {
    pub id: u32,
    pub status: NvLinkStatus,
    /// NVSwitch this link lands on
    pub switch_id: u32,
    /// Replay errors (nvidia-smi nvlink -e "Replay Errors")
    pub tx_errors: u64,
    /// CRC errors (nvidia-smi nvlink -e "CRC Errors")
    pub rx_errors: u64,
}

impl NvLink {
    pub fn active(id: u32, switch_id: u32) -> Self {
        NvLink { id, status: NvLinkStatus::Active, switch_id, tx_errors: 0, rx_errors: 0 }
    }

    pub fn is_active(&self) -> bool {
        self.status == NvLinkStatus::Active
    }
}

/// Link-to-switch distribution on an HGX H100 board (5/4/4/5 across four
/// NVSwitches). Extra links wrap around.
pub fn nvswitch_for_link(link: u32, switches: u32) -> u32 {
    const H100_MAP: [u32; 18] = [0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 3];
    if switches == 4 {
        H100_MAP[(link as usize) % H100_MAP.len()]
    } else {
        link % switches.max(1)
    }
}

// ---------------------------------------------------------------------------
// InfiniBand HCA state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    Active,
    Init,
    Down,
}

impl PortState {
    /// Physical state as printed by ibstat alongside the logical state.
    pub fn physical(&self) -> &'static str {
        match self {
            PortState::Active => "LinkUp",
            PortState::Init   => "LinkUp",
            PortState::Down   => "Polling",
        }
    }

    /// Numeric prefix ibstatus prints ("4: ACTIVE").
    pub fn code(&self) -> u8 {
        match self {
            PortState::Active => 4,
            PortState::Init   => 2,
            PortState::Down   => 1,
        }
    }
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Active => f.pad("Active"),
            PortState::Init   => f.pad("Initializing"),
            PortState::Down   => f.pad("Down"),
        }
    }
}

/// Performance-counter bundle returned by perfquery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortCounters {
    pub symbol_errors: u64,
    pub port_rcv_errors: u64,
    pub link_downed: u64,
    pub port_xmit_discards: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HcaPort {
    pub port: u32,
    pub state: PortState,
    pub rate_gbps: u32,
    pub lid: u32,
    pub port_guid: String,
    pub counters: PortCounters,
}

impl HcaPort {
    /// A port is degraded when it is not Active or carries error counts.
    pub fn is_degraded(&self) -> bool {
        self.state != PortState::Active
            || self.counters.symbol_errors > 0
            || self.counters.port_rcv_errors > 0
            || self.counters.link_downed > 0
    }
}

/// A ConnectX host channel adapter (mlx5_N).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hca {
    /// Device name, e.g. "mlx5_0"
    pub id: String,
    pub ca_type: String,
    pub firmware: String,
    pub node_guid: String,
    /// PCI bus id of the adapter
    pub bus_id: String,
    pub ports: Vec<HcaPort>,
}

impl Hca {
    pub fn port(&self, port: u32) -> Option<&HcaPort> {
        self.ports.iter().find(|p| p.port == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_bus_bandwidth_approaches_link_speed_for_large_messages() {
        let ib = InfiniBandConfig::ndr();
        let stats = all_reduce(64, 8 << 30, ib.bandwidth_gb_s, ib.latency_us, AllReduceAlgorithm::Ring);
        assert!(stats.bus_bandwidth_gb_s > 49.0 && stats.bus_bandwidth_gb_s <= 50.0);
    }

    #[test]
    fn single_rank_collective_is_free() {
        let stats = all_reduce(1, 1024, 50.0, 2.0, AllReduceAlgorithm::Ring);
        assert_eq!(stats.time_us, 0.0);
    }

    #[test]
    fn tree_pays_less_latency_on_small_messages() {
        let ring = all_reduce(8, 1024, 450.0, 1.0, AllReduceAlgorithm::Ring);
        let tree = all_reduce(8, 1024, 450.0, 1.0, AllReduceAlgorithm::Tree);
        assert!(tree.time_us < ring.time_us);
        let ring = all_reduce(8, 1 << 30, 450.0, 1.0, AllReduceAlgorithm::Ring);
        let tree = all_reduce(8, 1 << 30, 450.0, 1.0, AllReduceAlgorithm::Tree);
        assert!(tree.bus_bandwidth_gb_s < ring.bus_bandwidth_gb_s);
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!("Tree".parse::<AllReduceAlgorithm>(), Ok(AllReduceAlgorithm::Tree));
        assert_eq!("ring".parse::<AllReduceAlgorithm>(), Ok(AllReduceAlgorithm::Ring));
        assert_eq!("CollnetDirect".parse::<AllReduceAlgorithm>(), Err("CollnetDirect".to_string()));
    }

    #[test]
    fn h100_links_spread_over_four_switches() {
        let counts = (0..18).fold([0; 4], |mut acc, l| {
            acc[nvswitch_for_link(l, 4) as usize] += 1;
            acc
        });
        assert_eq!(counts, [5, 4, 4, 5]);
    }
}
