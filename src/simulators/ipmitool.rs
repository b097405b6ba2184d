/// `ipmitool`: the node's BMC view. Sensor readings come from the same GPU
/// records nvidia-smi reads, and the SEL is derived from active faults.
use chrono::{DateTime, Utc};

use crate::cluster::{Cluster, DgxNode, SlurmState};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::gpu::{Gpu, THERMAL_WARNING_C};
use crate::parser::ParsedCommand;

use super::{current_node, node_index, CommandOutput, Simulator};

const GPU_CRITICAL_C: u32 = 92;
const FAN_RPM: u32 = 9_840;

#[derive(Debug, Default)]
pub struct Ipmitool;

impl Simulator for Ipmitool {
    type Verb = ();

    fn name(&self) -> &'static str {
        "ipmitool"
    }

    fn execute(&mut self, _: (), cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        if cmd.has_flag("h") {
            return Ok(CommandOutput::ok(USAGE));
        }
        let node = match cmd.flag_value(&["H"]) {
            Some(addr) => cluster.node_by_address(addr).ok_or_else(|| {
                SimError::NotFound(format!(
                    "Error: Unable to establish IPMI v2 / RMCP+ session\nUnable to get Chassis Power Status for {}",
                    addr
                ))
            })?,
            None => current_node(ctx, cluster)?,
        };
        let args: Vec<&str> = cmd.operands();
        match args.as_slice() {
            ["sensor"] | ["sensor", "list"] => Ok(CommandOutput::ok(sensor_list(cluster, node))),
            ["sdr"] | ["sdr", "list"] | ["sdr", "elist"] => Ok(CommandOutput::ok(sdr(cluster, node, None))),
            ["sdr", "type", kind] => {
                let kind = SensorType::parse(kind).ok_or_else(|| {
                    SimError::Usage(format!("Sensor type '{}' not found.\nSensor Types: Temperature, Fan, Power Supply", kind))
                })?;
                Ok(CommandOutput::ok(sdr(cluster, node, Some(kind))))
            }
            ["sel", "list"] | ["sel", "elist"] | ["sel"] => Ok(CommandOutput::ok(sel_list(node, ctx.now()))),
            ["sel", "info"] => Ok(CommandOutput::ok(sel_info(node, ctx.now()))),
            ["chassis", "status"] => Ok(CommandOutput::ok(chassis_status(node))),
            ["power", "status"] | ["chassis", "power", "status"] => Ok(CommandOutput::ok(format!(
                "Chassis Power is {}\n",
                power_word(node)
            ))),
            ["mc", "info"] => Ok(CommandOutput::ok(mc_info(cluster))),
            ["lan", "print"] | ["lan", "print", _] => Ok(CommandOutput::ok(lan_print(node)?)),
            ["fru"] | ["fru", "print"] => Ok(CommandOutput::ok(fru(cluster, node)?)),
            [] => Err(SimError::Usage(USAGE.to_string())),
            [other, ..] => Err(SimError::Usage(format!("Invalid command: {}\n{}", other, USAGE))),
        }
    }
}

const USAGE: &str = "usage: ipmitool [-I lanplus -H host -U user -P pass] <sensor|sdr|sel list|sel info|chassis status|power status|mc info|lan print|fru>\n";

fn power_word(node: &DgxNode) -> &'static str {
    if node.slurm_state == SlurmState::Down { "off" } else { "on" }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SensorType {
    Temperature,
    Fan,
    PowerSupply,
}

impl SensorType {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "temperature" | "temp" => Some(SensorType::Temperature),
            "fan" => Some(SensorType::Fan),
            "power" | "power supply" | "psu" => Some(SensorType::PowerSupply),
            _ => None,
        }
    }
}

/// One BMC sensor row.
struct Sensor {
    name: String,
    value: f64,
    unit: &'static str,
    upper_nc: Option<f64>,
    upper_cr: Option<f64>,
}

impl Sensor {
    fn kind(&self) -> SensorType {
        match self.unit {
            "degrees C" => SensorType::Temperature,
            "RPM" => SensorType::Fan,
            _ => SensorType::PowerSupply,
        }
    }

    fn status(&self) -> &'static str {
        match (self.upper_nc, self.upper_cr) {
            (_, Some(cr)) if self.value >= cr => "cr",
            (Some(nc), _) if self.value >= nc => "nc",
            _ => "ok",
        }
    }
}

fn sensors(cluster: &Cluster, node: &DgxNode) -> Vec<Sensor> {
    let hw = &cluster.hardware;
    let mut out = Vec::new();
    let avg_util = node.gpus.iter().map(|g| g.utilization_pct as f64).sum::<f64>() / node.gpus.len().max(1) as f64;
    for socket in 0..hw.sockets {
        out.push(Sensor {
            name: format!("CPU{}_Temp", socket),
            value: (38.0 + avg_util * 0.2).round(),
            unit: "degrees C",
            upper_nc: Some(90.0),
            upper_cr: Some(100.0),
        });
    }
    out.push(Sensor { name: "Inlet_Temp".into(), value: 24.0, unit: "degrees C", upper_nc: Some(35.0), upper_cr: Some(40.0) });
    for g in &node.gpus {
        out.push(Sensor {
            name: format!("GPU{}_Temp", g.id),
            value: g.temperature_c as f64,
            unit: "degrees C",
            upper_nc: Some(THERMAL_WARNING_C as f64),
            upper_cr: Some(GPU_CRITICAL_C as f64),
        });
    }
    for g in &node.gpus {
        out.push(Sensor {
            name: format!("GPU{}_Power", g.id),
            value: g.power_draw_w.round(),
            unit: "Watts",
            upper_nc: Some(g.power_limit_w),
            upper_cr: None,
        });
    }
    let fan = FAN_RPM as f64 * (0.6 + avg_util / 250.0);
    for i in 0..6 {
        out.push(Sensor { name: format!("FAN{}_F_Speed", i), value: fan.round(), unit: "RPM", upper_nc: None, upper_cr: None });
    }
    let gpu_power: f64 = node.gpus.iter().map(|g| g.power_draw_w).sum();
    let per_psu = ((gpu_power + 1_800.0) / 6.0).round();
    for i in 0..6 {
        out.push(Sensor { name: format!("PSU{}_Power", i), value: per_psu, unit: "Watts", upper_nc: Some(3_300.0), upper_cr: None });
    }
    out
}

fn threshold(v: Option<f64>) -> String {
    v.map(|t| format!("{:.3}", t)).unwrap_or_else(|| "na".to_string())
}

fn sensor_list(cluster: &Cluster, node: &DgxNode) -> String {
    sensors(cluster, node)
        .iter()
        .map(|s| {
            format!(
                "{:<16} | {:<10.3} | {:<10} | {:<5} | {:<10} | {:<10} | {:<10}\n",
                s.name,
                s.value,
                s.unit,
                s.status(),
                "na",
                threshold(s.upper_nc),
                threshold(s.upper_cr)
            )
        })
        .collect()
}

fn sdr(cluster: &Cluster, node: &DgxNode, kind: Option<SensorType>) -> String {
    sensors(cluster, node)
        .iter()
        .filter(|s| kind.is_none_or(|k| s.kind() == k))
        .map(|s| format!("{:<16} | {:.0} {:<10} | {}\n", s.name, s.value, s.unit, s.status()))
        .collect()
}

/// One System Event Log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SelEntry {
    pub at: DateTime<Utc>,
    pub sensor: String,
    pub event: String,
}

/// SEL entries implied by the node's current state, oldest first.
pub fn sel_entries(node: &DgxNode, now: DateTime<Utc>) -> Vec<SelEntry> {
    let mut out = Vec::new();
    for g in &node.gpus {
        out.extend(gpu_events(g, now));
    }
    for (hca, port) in node.ports() {
        if port.is_degraded() {
            out.push(SelEntry {
                at: now,
                sensor: format!("Network {}", hca.id),
                event: format!("Link state {} | Asserted", port.state),
            });
        }
    }
    out.sort_by_key(|e| e.at);
    out
}

fn gpu_events(g: &Gpu, now: DateTime<Utc>) -> Vec<SelEntry> {
    let mut out = Vec::new();
    for x in &g.xid_errors {
        out.push(SelEntry {
            at: x.timestamp,
            sensor: format!("GPU{}_Status", g.id),
            event: format!("Xid {} | Asserted", x.code),
        });
    }
    if g.ecc.volatile.double_bit > 0 {
        out.push(SelEntry {
            at: now,
            sensor: format!("GPU{}_Memory", g.id),
            event: "Uncorrectable ECC | Asserted".to_string(),
        });
    }
    if g.is_thermal_throttled() {
        out.push(SelEntry {
            at: now,
            sensor: format!("GPU{}_Temp", g.id),
            event: "Upper Non-critical going high | Asserted".to_string(),
        });
    }
    if g.is_power_capped() {
        out.push(SelEntry {
            at: now,
            sensor: format!("GPU{}_Power", g.id),
            event: "Upper Non-critical going high | Asserted".to_string(),
        });
    }
    out
}

fn sel_list(node: &DgxNode, now: DateTime<Utc>) -> String {
    let entries = sel_entries(node, now);
    if entries.is_empty() {
        return "SEL has no entries\n".to_string();
    }
    entries
        .iter()
        .enumerate()
        .map(|(i, e)| {
            format!(
                "{:>4x} | {} | {} | {} | {}\n",
                i + 1,
                e.at.format("%m/%d/%Y"),
                e.at.format("%H:%M:%S"),
                e.sensor,
                e.event
            )
        })
        .collect()
}

fn sel_info(node: &DgxNode, now: DateTime<Utc>) -> String {
    let n = sel_entries(node, now).len();
    format!(
        "SEL Information\nVersion          : 1.5 (v1.5, v2 compliant)\nEntries          : {}\nFree Space       : {} bytes\nPercent Used     : {}%\n",
        n,
        65_520 - n * 16,
        n * 16 * 100 / 65_536
    )
}

fn chassis_status(node: &DgxNode) -> String {
    let fault = node.gpus.iter().any(|g| g.is_thermal_throttled() || g.is_power_capped());
    format!(
        "System Power         : {}\nPower Overload       : {}\nPower Interlock      : inactive\nMain Power Fault     : false\nPower Control Fault  : false\nPower Restore Policy : always-on\nLast Power Event     : \nChassis Intrusion    : inactive\nFront-Panel Lockout  : inactive\nDrive Fault          : false\nCooling/Fan Fault    : {}\n",
        power_word(node),
        node.gpus.iter().any(|g| g.is_power_capped()),
        fault
    )
}

fn mc_info(cluster: &Cluster) -> String {
    format!(
        "Device ID                 : 32\nDevice Revision           : 1\nFirmware Revision         : {}\nIPMI Version              : 2.0\nManufacturer ID           : 5703\nManufacturer Name         : NVIDIA\nProduct ID                : 5383 (0x1507)\nProduct Name              : {} BMC\nDevice Available          : yes\n",
        cluster.hardware.bmc_firmware, cluster.hardware.system_model
    )
}

fn lan_print(node: &DgxNode) -> Result<String> {
    let gw = node.bmc_ip.rsplit_once('.').map(|(net, _)| format!("{}.1", net)).unwrap_or_default();
    Ok(format!(
        "Set in Progress         : Set Complete\nIP Address Source       : Static Address\nIP Address              : {}\nSubnet Mask             : 255.255.255.0\nMAC Address             : 5c:ff:35:0a:01:{:02x}\nDefault Gateway IP      : {}\n",
        node.bmc_ip,
        node_index(node)?,
        gw
    ))
}

fn fru(cluster: &Cluster, node: &DgxNode) -> Result<String> {
    Ok(format!(
        "FRU Device Description : Builtin FRU Device (ID 0)\n Chassis Type          : Rack Mount Chassis\n Board Mfg             : NVIDIA\n Board Product         : {}\n Board Serial          : 1654222{:06}\n Product Manufacturer  : NVIDIA\n Product Name          : {}\n Product Version       : BIOS {}\n",
        cluster.hardware.system_model,
        node_index(node)?,
        cluster.hardware.system_model,
        cluster.hardware.bios_version
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, FaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(store: &ClusterStore, line: &str) -> Result<CommandOutput> {
        let ctx = CommandContext::new("dgx-00");
        Ipmitool.execute((), &parse(line).unwrap(), &ctx, store.cluster())
    }

    #[test]
    fn gpu_temperature_sensor_tracks_gpu_state() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 2, FaultKind::Thermal).unwrap();
        let out = run(&store, "ipmitool sensor list").unwrap();
        let line = out.output.lines().find(|l| l.starts_with("GPU2_Temp")).unwrap();
        assert!(line.contains("88.000"));
        assert!(line.contains("| nc "));
        let ok = out.output.lines().find(|l| l.starts_with("GPU3_Temp")).unwrap();
        assert!(ok.contains("| ok "));
    }

    #[test]
    fn remote_bmc_by_address() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-04", 1, FaultKind::Xid).unwrap();
        let out = run(&store, "ipmitool -I lanplus -H 10.10.1.14 -U admin -P admin sel list").unwrap();
        assert!(out.output.contains("GPU1_Status | Xid 79 | Asserted"));
        assert_eq!(run(&store, "ipmitool sel list").unwrap().output, "SEL has no entries\n");
        assert!(matches!(run(&store, "ipmitool -H 10.9.9.9 sensor"), Err(SimError::NotFound(_))));
    }

    #[test]
    fn power_status_follows_down_state() {
        let mut store = ClusterStore::superpod("t");
        store.set_slurm_state("dgx-00", SlurmState::Down, Some("hw".into())).unwrap();
        assert_eq!(run(&store, "ipmitool power status").unwrap().output, "Chassis Power is off\n");
        assert!(run(&store, "ipmitool mc info").unwrap().output.contains("24.01.05"));
    }

    #[test]
    fn sdr_type_filter() {
        let store = ClusterStore::superpod("t");
        let out = run(&store, "ipmitool sdr type Fan").unwrap();
        assert_eq!(out.output.lines().count(), 6);
        assert!(out.output.lines().all(|l| l.starts_with("FAN")));
        assert!(matches!(run(&store, "ipmitool sdr type Voltage"), Err(SimError::Usage(_))));
    }
}
