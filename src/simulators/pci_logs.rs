/// PCI enumeration and kernel/system logs: `lspci`, `dmesg`, `journalctl`.
///
/// The log is synthesized from current state on every call. Boot messages
/// sit at fixed offsets after boot (`now - uptime`); every active fault adds
/// the line the driver would have printed for it, so dmesg never disagrees
/// with nvidia-smi or ibstat.
use chrono::{DateTime, Duration, Utc};

use crate::cluster::{Cluster, DgxNode};
use crate::context::CommandContext;
use crate::error::Result;
use crate::gpu::{Gpu, PcieStatus};
use crate::interconnect::PortState;
use crate::parser::ParsedCommand;

use super::{current_node, CommandOutput, Simulator};

const NVIDIA_VENDOR: &str = "10de";
const MELLANOX_VENDOR: &str = "15b3";
const NVSWITCH_BUS: [&str; 4] = ["05", "06", "07", "08"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciVerb {
    Lspci,
    Dmesg,
    Journalctl,
}

#[derive(Debug, Default)]
pub struct PciLogs;

impl Simulator for PciLogs {
    type Verb = PciVerb;

    fn name(&self) -> &'static str {
        "pci-logs"
    }

    fn execute(&mut self, verb: PciVerb, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        let node = current_node(ctx, cluster)?;
        match verb {
            PciVerb::Lspci => lspci(cmd, node),
            PciVerb::Dmesg => Ok(CommandOutput::ok(dmesg(cmd, node, cluster, ctx.now()))),
            PciVerb::Journalctl => Ok(CommandOutput::ok(journalctl(cmd, node, cluster, ctx.now()))),
        }
    }
}

// ---------------------------------------------------------------------------
// lspci
// ---------------------------------------------------------------------------

struct PciDevice {
    /// "18:00.0"
    slot: String,
    class: &'static str,
    class_code: &'static str,
    vendor_name: &'static str,
    vendor: &'static str,
    device_name: &'static str,
    device: &'static str,
    rev: &'static str,
    driver: &'static str,
    link: Option<PcieStatus>,
}

fn link_speed(generation: u32) -> &'static str {
    match generation {
        5 => "32GT/s",
        4 => "16GT/s",
        3 => "8GT/s",
        2 => "5GT/s",
        _ => "2.5GT/s",
    }
}

/// A GPU that logged XID 79 no longer answers config reads.
fn fell_off_bus(g: &Gpu) -> bool {
    g.xid_errors.iter().any(|x| x.code == 79)
}

fn devices(node: &DgxNode) -> Vec<PciDevice> {
    let mut out = Vec::new();
    for bus in NVSWITCH_BUS {
        out.push(PciDevice {
            slot: format!("{}:00.0", bus),
            class: "Bridge",
            class_code: "0680",
            vendor_name: "NVIDIA Corporation",
            vendor: NVIDIA_VENDOR,
            device_name: "Device 22a3",
            device: "22a3",
            rev: "a1",
            driver: "nvidia-nvswitch",
            link: None,
        });
    }
    for g in &node.gpus {
        out.push(PciDevice {
            slot: g.short_bus_id().to_lowercase(),
            class: "3D controller",
            class_code: "0302",
            vendor_name: "NVIDIA Corporation",
            vendor: NVIDIA_VENDOR,
            device_name: "GH100 [H100 SXM5 80GB]",
            device: "2330",
            rev: if fell_off_bus(g) { "ff" } else { "a1" },
            driver: "nvidia",
            link: Some(g.pcie.clone()),
        });
    }
    for h in &node.hcas {
        out.push(PciDevice {
            slot: h.bus_id.trim_start_matches("0000:").to_string(),
            class: "Infiniband controller",
            class_code: "0207",
            vendor_name: "Mellanox Technologies",
            vendor: MELLANOX_VENDOR,
            device_name: "MT2910 Family [ConnectX-7]",
            device: "1021",
            rev: "00",
            driver: "mlx5_core",
            link: None,
        });
    }
    out.sort_by(|a, b| a.slot.cmp(&b.slot));
    out
}

fn lspci(cmd: &ParsedCommand, node: &DgxNode) -> Result<CommandOutput> {
    let vendor_filter = cmd.flag_value(&["d"]).map(|d| {
        let mut parts = d.splitn(2, ':');
        (parts.next().unwrap_or("").to_lowercase(), parts.next().unwrap_or("").to_lowercase())
    });
    let slot_filter = cmd.flag_value(&["s"]).map(|s| s.trim_start_matches("0000:").to_lowercase());
    let numeric = cmd.has_flag("nn");
    let verbose = cmd.has_any(&["v", "vv", "vvv"]);
    let mut out = String::new();
    for d in devices(node) {
        if let Some((vendor, device)) = &vendor_filter {
            if (!vendor.is_empty() && vendor != d.vendor) || (!device.is_empty() && device != d.device) {
                continue;
            }
        }
        if slot_filter.as_ref().is_some_and(|s| !d.slot.starts_with(s.as_str())) {
            continue;
        }
        if numeric {
            out.push_str(&format!(
                "{} {} [{}]: {} {} [{}:{}] (rev {})\n",
                d.slot, d.class, d.class_code, d.vendor_name, d.device_name, d.vendor, d.device, d.rev
            ));
        } else {
            out.push_str(&format!("{} {}: {} {} (rev {})\n", d.slot, d.class, d.vendor_name, d.device_name, d.rev));
        }
        if verbose {
            verbose_block(&mut out, &d);
        }
    }
    Ok(CommandOutput::ok(out))
}

fn verbose_block(out: &mut String, d: &PciDevice) {
    if d.rev == "ff" {
        out.push_str("\t!!! Unknown header type 7f\n\tKernel driver in use: nvidia\n\n");
        return;
    }
    out.push_str(&format!("\tSubsystem: {} Device {}\n", d.vendor_name, d.device));
    out.push_str("\tFlags: bus master, fast devsel, latency 0\n");
    if let Some(l) = &d.link {
        out.push_str(&format!(
            "\t\tLnkCap:\tPort #0, Speed {}, Width x{}, ASPM not supported\n",
            link_speed(l.max_link_gen),
            l.max_link_width
        ));
        let downgraded = |cur: u32, max: u32| if cur < max { " (downgraded)" } else { "" };
        out.push_str(&format!(
            "\t\tLnkSta:\tSpeed {}{}, Width x{}{}\n",
            link_speed(l.link_gen),
            downgraded(l.link_gen, l.max_link_gen),
            l.link_width,
            downgraded(l.link_width, l.max_link_width)
        ));
        if l.correctable_errors > 0 {
            out.push_str(&format!(
                "\tCapabilities: [100] Advanced Error Reporting\n\t\tCESta:\tRxErr+ BadTLP- BadDLLP- Rollover- Timeout- AdvNonFatalErr- ({} logged)\n",
                l.correctable_errors
            ));
        }
    }
    out.push_str(&format!("\tKernel driver in use: {}\n\tKernel modules: {}\n\n", d.driver, d.driver));
}

// ---------------------------------------------------------------------------
// Kernel and unit log
// ---------------------------------------------------------------------------

/// One synthesized log record. `unit` is `"kernel"` for ring-buffer lines.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub unit: &'static str,
    pub text: String,
}

fn pci_tag(g: &Gpu) -> String {
    // NVRM prints the bus without the function number
    let short = g.short_bus_id().to_lowercase();
    format!("PCI:0000:{}", short.rsplit_once('.').map(|(b, _)| b).unwrap_or(&short))
}

/// Every log line for `node`, oldest first.
pub fn system_log(node: &DgxNode, cluster: &Cluster, now: DateTime<Utc>) -> Vec<LogLine> {
    let hw = &cluster.hardware;
    let boot = now - Duration::seconds(hw.uptime_secs as i64);
    let at = |ms: i64| boot + Duration::milliseconds(ms);
    let mut out = vec![
        LogLine { at: at(0), unit: "kernel", text: format!("Linux version {} (buildd@lcy02-amd64-079) #42-Ubuntu SMP", hw.kernel) },
        LogLine { at: at(0), unit: "kernel", text: format!("Command line: BOOT_IMAGE=/boot/vmlinuz-{} root=/dev/md0 ro", hw.kernel) },
        LogLine { at: at(4_112), unit: "kernel", text: "nvidia: module license 'NVIDIA' taints kernel.".to_string() },
        LogLine {
            at: at(4_388),
            unit: "kernel",
            text: format!("NVRM: loading NVIDIA UNIX x86_64 Kernel Module  {}  Tue Oct 10 19:03:56 UTC 2023", hw.driver_version),
        },
    ];
    for (i, h) in node.hcas.iter().enumerate() {
        out.push(LogLine {
            at: at(5_020 + i as i64 * 37),
            unit: "kernel",
            text: format!("mlx5_core {}: firmware version: {}", h.bus_id, h.firmware),
        });
    }
    out.push(LogLine { at: at(31_000), unit: "nvidia-fabricmanager", text: "Started NVIDIA fabric manager service.".to_string() });
    out.push(LogLine { at: at(31_500), unit: "nvidia-dcgm", text: "Started NVIDIA DCGM service.".to_string() });
    out.push(LogLine { at: at(33_000), unit: "slurmd", text: format!("slurmd version 23.02.7 started on {}", node.hostname) });

    for g in &node.gpus {
        let tag = pci_tag(g);
        for x in &g.xid_errors {
            out.push(LogLine {
                at: x.timestamp,
                unit: "kernel",
                text: format!("NVRM: Xid ({}): {}, pid='<unknown>', name=<unknown>, {}", tag, x.code, x.description()),
            });
        }
        if g.ecc.volatile.double_bit > 0 {
            out.push(LogLine {
                at: now,
                unit: "kernel",
                text: format!(
                    "NVRM: GPU at {}: uncorrectable ECC error detected ({} volatile DBE, {} SBE)",
                    tag, g.ecc.volatile.double_bit, g.ecc.volatile.single_bit
                ),
            });
        }
        if g.is_thermal_throttled() {
            out.push(LogLine {
                at: now,
                unit: "kernel",
                text: format!(
                    "NVRM: GPU at {}: temperature {} C above slowdown threshold, SM clock throttled to {} MHz",
                    tag, g.temperature_c, g.sm_clock_mhz
                ),
            });
        }
        if g.is_power_capped() {
            out.push(LogLine {
                at: now,
                unit: "kernel",
                text: format!(
                    "NVRM: GPU at {}: power draw {:.0} W exceeds enforced limit {:.0} W",
                    tag, g.power_draw_w, g.power_limit_w
                ),
            });
        }
        for l in g.nvlinks.iter().filter(|l| !l.is_active()) {
            out.push(LogLine {
                at: now,
                unit: "kernel",
                text: format!("NVRM: nvlink: GPU {} link {} is down (training failed)", g.bus_id.to_lowercase(), l.id),
            });
            out.push(LogLine {
                at: now,
                unit: "nvidia-fabricmanager",
                text: format!(
                    "NVLink {} of GPU {} to NVSwitch {} is down, fabric degraded",
                    l.id, g.id, l.switch_id
                ),
            });
        }
        if g.pcie.replay_errors > 0 || g.pcie.correctable_errors > 0 {
            out.push(LogLine {
                at: now,
                unit: "kernel",
                text: format!(
                    "pcieport 0000:{}: AER: Corrected error received: 0000:{} ({} replays)",
                    g.short_bus_id().to_lowercase(),
                    g.short_bus_id().to_lowercase(),
                    g.pcie.replay_errors
                ),
            });
        }
        if g.pcie.is_degraded() {
            out.push(LogLine {
                at: now,
                unit: "kernel",
                text: format!(
                    "pci 0000:{}: available PCIe bandwidth limited by {} x{} link (capable of {} x{})",
                    g.short_bus_id().to_lowercase(),
                    link_speed(g.pcie.link_gen),
                    g.pcie.link_width,
                    link_speed(g.pcie.max_link_gen),
                    g.pcie.max_link_width
                ),
            });
        }
    }
    for (hca, port) in node.ports() {
        if port.state != PortState::Active {
            out.push(LogLine {
                at: now,
                unit: "kernel",
                text: format!("mlx5_core {}: {}:{}: Link down", hca.bus_id, hca.id, port.port),
            });
        }
        if port.counters.symbol_errors > 0 {
            out.push(LogLine {
                at: now,
                unit: "kernel",
                text: format!(
                    "mlx5_core {}: {}:{}: high symbol error rate ({} errors)",
                    hca.bus_id, hca.id, port.port, port.counters.symbol_errors
                ),
            });
        }
    }
    out.sort_by_key(|l| l.at);
    out
}

fn dmesg(cmd: &ParsedCommand, node: &DgxNode, cluster: &Cluster, now: DateTime<Utc>) -> String {
    let boot = now - Duration::seconds(cluster.hardware.uptime_secs as i64);
    let human = cmd.has_any(&["T", "ctime"]);
    system_log(node, cluster, now)
        .into_iter()
        .filter(|l| l.unit == "kernel")
        .map(|l| {
            if human {
                format!("[{}] {}\n", l.at.format("%a %b %e %H:%M:%S %Y"), l.text)
            } else {
                let secs = (l.at - boot).num_microseconds().unwrap_or(0) as f64 / 1e6;
                format!("[{:>12.6}] {}\n", secs, l.text)
            }
        })
        .collect()
}

fn journalctl(cmd: &ParsedCommand, node: &DgxNode, cluster: &Cluster, now: DateTime<Utc>) -> String {
    let unit = cmd.flag_value(&["u", "unit"]).map(|u| u.trim_end_matches(".service").to_string());
    let kernel_only = cmd.has_any(&["k", "dmesg"]);
    let lines: Vec<String> = system_log(node, cluster, now)
        .into_iter()
        .filter(|l| match (&unit, kernel_only) {
            (_, true) => l.unit == "kernel",
            (Some(u), false) => l.unit == u,
            (None, false) => true,
        })
        .map(|l| {
            let source = if l.unit == "kernel" { "kernel".to_string() } else { format!("{}[1]", l.unit) };
            format!("{} {} {}: {}\n", l.at.format("%b %d %H:%M:%S"), node.hostname, source, l.text)
        })
        .collect();
    if lines.is_empty() {
        "-- No entries --\n".to_string()
    } else {
        lines.concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, inject_port_fault, FaultKind, PortFaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(store: &ClusterStore, verb: PciVerb, line: &str) -> Result<CommandOutput> {
        let ctx = CommandContext::new("dgx-00");
        PciLogs.execute(verb, &parse(line).unwrap(), &ctx, store.cluster())
    }

    #[test]
    fn lspci_filters_by_vendor_and_slot() {
        let store = ClusterStore::superpod("t");
        let gpus = run(&store, PciVerb::Lspci, "lspci -d 10de:2330").unwrap();
        assert_eq!(gpus.output.lines().count(), 8);
        let nics = run(&store, PciVerb::Lspci, "lspci -d 15b3:").unwrap();
        assert_eq!(nics.output.lines().count(), 8);
        let one = run(&store, PciVerb::Lspci, "lspci -s 18:00.0").unwrap();
        assert_eq!(one.output, "18:00.0 3D controller: NVIDIA Corporation GH100 [H100 SXM5 80GB] (rev a1)\n");
    }

    #[test]
    fn fallen_gpu_reads_rev_ff() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 0, FaultKind::Xid).unwrap();
        let out = run(&store, PciVerb::Lspci, "lspci -s 18:00.0 -v").unwrap();
        assert!(out.output.contains("(rev ff)"));
        assert!(out.output.contains("Unknown header type 7f"));
    }

    #[test]
    fn degraded_link_is_flagged() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 3, FaultKind::Pcie).unwrap();
        let out = run(&store, PciVerb::Lspci, "lspci -s 5d:00.0 -v").unwrap();
        assert!(out.output.contains("LnkSta:\tSpeed 32GT/s, Width x8 (downgraded)"));
        let log = run(&store, PciVerb::Dmesg, "dmesg").unwrap();
        assert!(log.output.contains("limited by 32GT/s x8 link"));
    }

    #[test]
    fn dmesg_carries_xid_line() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 0, FaultKind::Xid).unwrap();
        let out = run(&store, PciVerb::Dmesg, "dmesg -T").unwrap();
        assert!(out.output.contains("NVRM: Xid (PCI:0000:18:00): 79, pid='<unknown>', name=<unknown>, GPU has fallen off the bus"));
        let clean = ClusterStore::superpod("t");
        assert!(!run(&clean, PciVerb::Dmesg, "dmesg").unwrap().output.contains("Xid"));
    }

    #[test]
    fn journal_unit_filter() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 1, FaultKind::NvLink).unwrap();
        inject_port_fault(&mut store, "dgx-00", "mlx5_0", 1, PortFaultKind::LinkDown).unwrap();
        let fm = run(&store, PciVerb::Journalctl, "journalctl -u nvidia-fabricmanager").unwrap();
        assert_eq!(fm.output.lines().count(), 2);
        assert!(fm.output.contains("NVLink 0 of GPU 1 to NVSwitch 0 is down"));
        let k = run(&store, PciVerb::Journalctl, "journalctl -k").unwrap();
        assert!(k.output.contains("mlx5_0:1: Link down"));
        assert!(!k.output.contains("fabric degraded"));
        let none = run(&store, PciVerb::Journalctl, "journalctl -u docker").unwrap();
        assert_eq!(none.output, "-- No entries --\n");
    }
}
