/// GPU state record and the canonical health derivation.
///
/// Every simulator that reports a health verdict calls [`derive_health`] (or
/// [`health_reasons`] for the wording); none of them re-derive it.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::interconnect::NvLink;
use crate::xid;

/// Temperature at or above which a GPU is thermally degraded.
pub const THERMAL_WARNING_C: u32 = 85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    OK,
    Warning,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::OK       => f.pad("OK"),
            HealthStatus::Warning  => f.pad("Warning"),
            HealthStatus::Critical => f.pad("Critical"),
        }
    }
}

/// One XID event logged by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XidError {
    pub code: u32,
    pub timestamp: DateTime<Utc>,
}

impl XidError {
    pub fn description(&self) -> &'static str {
        xid::description(self.code)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EccCounts {
    pub single_bit: u64,
    pub double_bit: u64,
}

/// ECC counters: volatile since last driver load, aggregate over lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EccErrors {
    pub volatile: EccCounts,
    pub aggregate: EccCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcieStatus {
    pub link_gen: u32,
    pub max_link_gen: u32,
    pub link_width: u32,
    pub max_link_width: u32,
    pub replay_errors: u64,
    pub correctable_errors: u64,
}

impl PcieStatus {
    pub fn gen5_x16() -> Self {
        PcieStatus {
            link_gen: 5,
            max_link_gen: 5,
            link_width: 16,
            max_link_width: 16,
            replay_errors: 0,
            correctable_errors: 0,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.link_gen < self.max_link_gen || self.link_width < self.max_link_width
    }
}

/// A single GPU as every tool sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpu {
    /// Index within the node (0..7)
    pub id: u32,
    pub name: String,
    pub uuid: String,
    pub serial: String,
    /// PCI bus id, e.g. "00000000:18:00.0"
    pub bus_id: String,
    pub utilization_pct: u32,
    pub temperature_c: u32,
    pub power_draw_w: f64,
    pub power_limit_w: f64,
    pub sm_clock_mhz: u32,
    pub mem_clock_mhz: u32,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
    /// Stored verdict; always equal to `derive_health(self)` after a store write
    pub health_status: HealthStatus,
    pub xid_errors: Vec<XidError>,
    pub ecc: EccErrors,
    pub nvlinks: Vec<NvLink>,
    pub pcie: PcieStatus,
}

impl Gpu {
    pub fn active_nvlinks(&self) -> usize {
        self.nvlinks.iter().filter(|l| l.is_active()).count()
    }

    pub fn down_nvlinks(&self) -> usize {
        self.nvlinks.len() - self.active_nvlinks()
    }

    pub fn is_thermal_throttled(&self) -> bool {
        self.temperature_c >= THERMAL_WARNING_C
    }

    pub fn is_power_capped(&self) -> bool {
        self.power_draw_w > self.power_limit_w
    }

    pub fn latest_xid(&self) -> Option<&XidError> {
        self.xid_errors.last()
    }

    /// Short PCI address ("18:00.0") used by lspci and dmesg.
    pub fn short_bus_id(&self) -> &str {
        self.bus_id.get(9..).unwrap_or(&self.bus_id)
    }

    /// Health as reported to the user. Debug builds assert that the stored
    /// verdict matches the derivation.
    pub fn health(&self) -> HealthStatus {
        let derived = derive_health(self);
        debug_assert_eq!(
            self.health_status, derived,
            "GPU {} stored health {} contradicts derived {}",
            self.id, self.health_status, derived
        );
        derived
    }
}

/// One reason contributing to a GPU's health verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthIncident {
    Xid { code: u32 },
    DoubleBitEcc { count: u64 },
    NvLinkDown { links: Vec<u32> },
    Thermal { temperature_c: u32 },
    PowerOverLimit { draw_w: f64, limit_w: f64 },
    Pcie { replay_errors: u64, degraded: bool },
}

impl HealthIncident {
    pub fn severity(&self) -> HealthStatus {
        match self {
            HealthIncident::Xid { .. } | HealthIncident::DoubleBitEcc { .. } => HealthStatus::Critical,
            _ => HealthStatus::Warning,
        }
    }

    /// Subsystem label shared by dcgmi health and nvsm.
    pub fn subsystem(&self) -> &'static str {
        match self {
            HealthIncident::Xid { code } => match xid::category(*code) {
                xid::XidCategory::Memory => "Memory",
                xid::XidCategory::Bus => "PCIe",
                xid::XidCategory::NvLink => "NVLink",
                _ => "SM",
            },
            HealthIncident::DoubleBitEcc { .. } => "Memory",
            HealthIncident::NvLinkDown { .. } => "NVLink",
            HealthIncident::Thermal { .. } => "Thermal",
            HealthIncident::PowerOverLimit { .. } => "Power",
            HealthIncident::Pcie { .. } => "PCIe",
        }
    }
}

impl std::fmt::Display for HealthIncident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthIncident::Xid { code } => {
                write!(f, "XID {} detected: {}", code, xid::description(*code))
            }
            HealthIncident::DoubleBitEcc { count } => {
                write!(f, "{} volatile double-bit ECC error(s)", count)
            }
            HealthIncident::NvLinkDown { links } => {
                let ids: Vec<String> = links.iter().map(|l| l.to_string()).collect();
                write!(f, "NVLink(s) {} down", ids.join(","))
            }
            HealthIncident::Thermal { temperature_c } => {
                write!(f, "temperature {} C at or above slowdown threshold {} C", temperature_c, THERMAL_WARNING_C)
            }
            HealthIncident::PowerOverLimit { draw_w, limit_w } => {
                write!(f, "power draw {:.0} W exceeds limit {:.0} W", draw_w, limit_w)
            }
            HealthIncident::Pcie { replay_errors, degraded } => {
                if *degraded {
                    write!(f, "PCIe link degraded, {} replay errors", replay_errors)
                } else {
                    write!(f, "{} PCIe replay errors", replay_errors)
                }
            }
        }
    }
}

/// All conditions currently degrading `gpu`, most severe first.
pub fn health_reasons(gpu: &Gpu) -> Vec<HealthIncident> {
    let mut out = Vec::new();
    for x in &gpu.xid_errors {
        out.push(HealthIncident::Xid { code: x.code });
    }
    if gpu.ecc.volatile.double_bit > 0 {
        out.push(HealthIncident::DoubleBitEcc { count: gpu.ecc.volatile.double_bit });
    }
    let down: Vec<u32> = gpu.nvlinks.iter().filter(|l| !l.is_active()).map(|l| l.id).collect();
    if !down.is_empty() {
        out.push(HealthIncident::NvLinkDown { links: down });
    }
    if gpu.is_thermal_throttled() {
        out.push(HealthIncident::Thermal { temperature_c: gpu.temperature_c });
    }
    if gpu.is_power_capped() {
        out.push(HealthIncident::PowerOverLimit { draw_w: gpu.power_draw_w, limit_w: gpu.power_limit_w });
    }
    if gpu.pcie.replay_errors > 0 || gpu.pcie.is_degraded() {
        out.push(HealthIncident::Pcie {
            replay_errors: gpu.pcie.replay_errors,
            degraded: gpu.pcie.is_degraded(),
        });
    }
    out
}

/// The single health derivation rule: worst of all active incidents.
pub fn derive_health(gpu: &Gpu) -> HealthStatus {
    health_reasons(gpu)
        .iter()
        .map(|i| i.severity())
        .max()
        .unwrap_or(HealthStatus::OK)
}

/// Fail if the stored verdict disagrees with the derivation.
pub fn check_health(node_id: &str, gpu: &Gpu) -> Result<()> {
    let derived = derive_health(gpu);
    if gpu.health_status != derived {
        return Err(SimError::InvariantViolation(format!(
            "{} GPU {}: stored health {} but conditions derive {}",
            node_id, gpu.id, gpu.health_status, derived
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::HardwareSpec;
    use crate::interconnect::NvLinkStatus;

    fn healthy() -> Gpu {
        HardwareSpec::dgx_h100().baseline_gpu(0, 0)
    }

    #[test]
    fn baseline_is_ok() {
        let gpu = healthy();
        assert!(health_reasons(&gpu).is_empty());
        assert_eq!(derive_health(&gpu), HealthStatus::OK);
        assert_eq!(gpu.health(), HealthStatus::OK);
    }

    #[test]
    fn critical_beats_warning() {
        let mut gpu = healthy();
        gpu.temperature_c = 90;
        assert_eq!(derive_health(&gpu), HealthStatus::Warning);
        gpu.ecc.volatile.double_bit = 1;
        assert_eq!(derive_health(&gpu), HealthStatus::Critical);
    }

    #[test]
    fn each_condition_maps_to_its_severity() {
        let mut gpu = healthy();
        gpu.xid_errors.push(XidError { code: 79, timestamp: Utc::now() });
        assert_eq!(derive_health(&gpu), HealthStatus::Critical);

        let mut gpu = healthy();
        gpu.nvlinks[3].status = NvLinkStatus::Down;
        assert_eq!(derive_health(&gpu), HealthStatus::Warning);
        assert_eq!(health_reasons(&gpu), vec![HealthIncident::NvLinkDown { links: vec![3] }]);

        let mut gpu = healthy();
        gpu.power_draw_w = gpu.power_limit_w + 1.0;
        assert_eq!(derive_health(&gpu), HealthStatus::Warning);

        let mut gpu = healthy();
        gpu.pcie.link_width = 8;
        assert_eq!(derive_health(&gpu), HealthStatus::Warning);
    }

    #[test]
    fn single_bit_ecc_alone_is_not_degrading() {
        let mut gpu = healthy();
        gpu.ecc.volatile.single_bit = 12;
        assert_eq!(derive_health(&gpu), HealthStatus::OK);
    }

    #[test]
    fn check_health_flags_stale_verdict() {
        let mut gpu = healthy();
        gpu.temperature_c = 95;
        assert!(matches!(check_health("dgx-00", &gpu), Err(SimError::InvariantViolation(_))));
    }
}
