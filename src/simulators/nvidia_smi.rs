/// `nvidia-smi`: device table, `-L`, `-q`, `--query-gpu`, `topo -m` and
/// `nvlink -s|-e` for the GPUs of the current node.
use crate::cluster::{Cluster, DgxNode};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::gpu::{health_reasons, Gpu, HealthStatus, THERMAL_WARNING_C};
use crate::parser::ParsedCommand;

use super::{current_node, numa_cpu_ranges, parse_gpu_list, CommandOutput, Simulator};

const SHUTDOWN_C: u32 = 92;
const DISPLAY_SECTIONS: [&str; 9] = [
    "MEMORY", "UTILIZATION", "ECC", "TEMPERATURE", "POWER", "CLOCK", "PERFORMANCE", "PCIE",
    "PAGE_RETIREMENT",
];
const KNOWN_FLAGS: [&str; 12] = [
    "q", "query", "L", "list-gpus", "i", "id", "d", "display", "query-gpu", "format", "h", "help",
];

fn usage_error() -> SimError {
    SimError::Usage(
        "Invalid combination of input arguments. Please run 'nvidia-smi -h' for help.".to_string(),
    )
}

fn no_devices() -> CommandOutput {
    CommandOutput::fail("No devices were found\n", 6)
}

#[derive(Debug, Default)]
pub struct NvidiaSmi;

impl Simulator for NvidiaSmi {
    type Verb = ();

    fn name(&self) -> &'static str {
        "nvidia-smi"
    }

    fn execute(&mut self, _: (), cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        let node = current_node(ctx, cluster)?;
        match cmd.subcommand.as_deref() {
            Some("topo") => return topo(cmd, node, cluster),
            Some("nvlink") => return nvlink(cmd, node, cluster),
            Some(other) => return Err(SimError::Usage(format!(
                "Invalid command line argument: {}\nPlease run 'nvidia-smi -h' for help.",
                other
            ))),
            None => {}
        }
        if !cmd.unknown_flags(&KNOWN_FLAGS).is_empty() {
            return Err(usage_error());
        }
        if cmd.has_any(&["h", "help"]) {
            return Ok(CommandOutput::ok(HELP));
        }
        if node.gpus.is_empty() {
            return Ok(no_devices());
        }
        let gpus = match select(cmd, node) {
            Some(g) => g,
            None => return Ok(no_devices()),
        };

        if cmd.has_any(&["L", "list-gpus"]) {
            let out: String = gpus
                .iter()
                .map(|g| format!("GPU {}: {} (UUID: {})\n", g.id, g.name, g.uuid))
                .collect();
            return Ok(CommandOutput::ok(out));
        }
        if let Some(fields) = cmd.flag_value(&["query-gpu"]) {
            return query_gpu(cmd, fields, &gpus, cluster);
        }
        if cmd.has_any(&["q", "query"]) {
            let sections = display_sections(cmd)?;
            return Ok(CommandOutput::ok(query(ctx, cluster, &gpus, sections.as_deref())));
        }
        if cmd.has_any(&["d", "display"]) {
            return Err(usage_error());
        }
        Ok(CommandOutput::ok(table(ctx, cluster, &gpus)))
    }
}

/// GPUs picked by `-i`, or all. `None` when the selector matches nothing.
fn select<'a>(cmd: &ParsedCommand, node: &'a DgxNode) -> Option<Vec<&'a Gpu>> {
    match cmd.flag_value(&["i", "id"]) {
        Some(sel) => {
            let ids = parse_gpu_list(sel, node).ok()?;
            Some(ids.iter().filter_map(|id| node.gpu(*id)).collect())
        }
        None => Some(node.gpus.iter().collect()),
    }
}

fn display_sections(cmd: &ParsedCommand) -> Result<Option<Vec<String>>> {
    let Some(flag) = cmd.flags.iter().find(|f| f.name == "d" || f.name == "display") else {
        return Ok(None);
    };
    let value = flag.value.as_deref().ok_or_else(usage_error)?;
    let mut out = Vec::new();
    for s in value.split(',') {
        let s = s.trim().to_ascii_uppercase();
        if !DISPLAY_SECTIONS.contains(&s.as_str()) {
            return Err(usage_error());
        }
        out.push(s);
    }
    Ok(Some(out))
}

// ---------------------------------------------------------------------------
// Default table
// ---------------------------------------------------------------------------

fn table(ctx: &CommandContext, cluster: &Cluster, gpus: &[&Gpu]) -> String {
    let hw = &cluster.hardware;
    let bar = "+-----------------------------------------+----------------------+----------------------+";
    let mut out = String::new();
    out.push_str(&format!("{}\n", ctx.now().format("%a %b %e %H:%M:%S %Y")));
    out.push_str("+---------------------------------------------------------------------------------------+\n");
    out.push_str(&format!(
        "| NVIDIA-SMI {:<22} Driver Version: {:<12} CUDA Version: {:<9}|\n",
        hw.driver_version, hw.driver_version, hw.cuda_version
    ));
    out.push_str("|-----------------------------------------+----------------------+----------------------+\n");
    out.push_str("| GPU  Name                 Persistence-M | Bus-Id        Disp.A | Volatile Uncorr. ECC |\n");
    out.push_str("| Fan  Temp   Perf          Pwr:Usage/Cap |         Memory-Usage | GPU-Util  Compute M. |\n");
    out.push_str("|                                         |                      |               MIG M. |\n");
    out.push_str("|=========================================+======================+======================|\n");
    for g in gpus {
        let critical = g.health() == HealthStatus::Critical;
        let ecc = if critical && g.ecc.volatile.double_bit == 0 {
            "ERR!".to_string()
        } else {
            g.ecc.volatile.double_bit.to_string()
        };
        out.push_str(&format!(
            "| {:>3}  {:<29} On  | {} Off | {:>20} |\n",
            g.id, truncate(&g.name, 29), g.bus_id, ecc
        ));
        let (temp, power, perf) = if critical {
            ("ERR!".to_string(), "ERR! / ERR!".to_string(), "ERR!")
        } else {
            (
                format!("{}C", g.temperature_c),
                format!("{:.0}W / {:.0}W", g.power_draw_w, g.power_limit_w),
                if g.is_thermal_throttled() { "P2" } else { "P0" },
            )
        };
        let util = if critical { "ERR!".to_string() } else { format!("{}%", g.utilization_pct) };
        out.push_str(&format!(
            "| N/A  {:>4}   {:<4} {:>22} | {:>20} | {:>8}      Default |\n",
            temp,
            perf,
            power,
            format!("{}MiB / {}MiB", g.memory_used_mib, g.memory_total_mib),
            util
        ));
        out.push_str("|                                         |                      |             Disabled |\n");
        out.push_str(bar);
        out.push('\n');
    }
    out.push('\n');
    out.push_str("+---------------------------------------------------------------------------------------+\n");
    out.push_str("| Processes:                                                                            |\n");
    out.push_str("|  GPU   GI   CI        PID   Type   Process name                            GPU Memory |\n");
    out.push_str("|        ID   ID                                                             Usage      |\n");
    out.push_str("|=======================================================================================|\n");
    out.push_str("|  No running processes found                                                           |\n");
    out.push_str("+---------------------------------------------------------------------------------------+\n");
    out
}

fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(n - 3).collect();
        t.push_str("...");
        t
    }
}

// ---------------------------------------------------------------------------
// -q
// ---------------------------------------------------------------------------

fn kv(out: &mut String, indent: usize, key: &str, value: impl std::fmt::Display) {
    let pad = 42usize.saturating_sub(indent);
    out.push_str(&format!("{}{:<pad$}: {}\n", " ".repeat(indent), key, value, pad = pad));
}

fn header(out: &mut String, indent: usize, title: &str) {
    out.push_str(&format!("{}{}\n", " ".repeat(indent), title));
}

fn query(ctx: &CommandContext, cluster: &Cluster, gpus: &[&Gpu], sections: Option<&[String]>) -> String {
    let hw = &cluster.hardware;
    let want = |s: &str| sections.is_none_or(|list| list.iter().any(|x| x == s));
    let mut out = String::new();
    out.push_str("\n==============NVSMI LOG==============\n\n");
    kv(&mut out, 0, "Timestamp", ctx.now().format("%a %b %e %H:%M:%S %Y"));
    kv(&mut out, 0, "Driver Version", &hw.driver_version);
    kv(&mut out, 0, "CUDA Version", &hw.cuda_version);
    out.push('\n');
    kv(&mut out, 0, "Attached GPUs", gpus.len());

    for g in gpus {
        out.push_str(&format!("GPU {}\n", g.bus_id));
        if sections.is_none() {
            kv(&mut out, 4, "Product Name", &g.name);
            kv(&mut out, 4, "Product Architecture", "Hopper");
            kv(&mut out, 4, "Persistence Mode", "Enabled");
            kv(&mut out, 4, "Serial Number", &g.serial);
            kv(&mut out, 4, "GPU UUID", &g.uuid);
            kv(&mut out, 4, "Minor Number", g.id);
            health_block(&mut out, g);
        }
        if want("PCIE") {
            header(&mut out, 4, "GPU Link Info");
            header(&mut out, 8, "PCIe Generation");
            kv(&mut out, 12, "Max", g.pcie.max_link_gen);
            kv(&mut out, 12, "Current", g.pcie.link_gen);
            header(&mut out, 8, "Link Width");
            kv(&mut out, 12, "Max", format!("{}x", g.pcie.max_link_width));
            kv(&mut out, 12, "Current", format!("{}x", g.pcie.link_width));
            kv(&mut out, 8, "Replays Since Reset", g.pcie.replay_errors);
            kv(&mut out, 8, "Replay Number Rollovers", 0);
            kv(&mut out, 8, "Correctable Errors", g.pcie.correctable_errors);
        }
        if want("PERFORMANCE") {
            kv(&mut out, 4, "Performance State", if g.is_thermal_throttled() { "P2" } else { "P0" });
            header(&mut out, 4, "Clocks Event Reasons");
            kv(&mut out, 8, "Idle", if g.utilization_pct == 0 { "Active" } else { "Not Active" });
            kv(&mut out, 8, "SW Power Cap", if g.is_power_capped() { "Active" } else { "Not Active" });
            kv(&mut out, 8, "HW Slowdown", if g.is_thermal_throttled() { "Active" } else { "Not Active" });
            kv(&mut out, 8, "HW Thermal Slowdown", if g.is_thermal_throttled() { "Active" } else { "Not Active" });
            kv(&mut out, 8, "HW Power Brake Slowdown", "Not Active");
            kv(&mut out, 8, "SW Thermal Slowdown", "Not Active");
        }
        if want("MEMORY") {
            header(&mut out, 4, "FB Memory Usage");
            kv(&mut out, 8, "Total", format!("{} MiB", g.memory_total_mib));
            kv(&mut out, 8, "Reserved", "506 MiB");
            kv(&mut out, 8, "Used", format!("{} MiB", g.memory_used_mib));
            kv(&mut out, 8, "Free", format!("{} MiB", g.memory_total_mib.saturating_sub(506 + g.memory_used_mib)));
        }
        if want("UTILIZATION") {
            header(&mut out, 4, "Utilization");
            kv(&mut out, 8, "Gpu", format!("{} %", g.utilization_pct));
            kv(&mut out, 8, "Memory", format!("{} %", g.utilization_pct * 3 / 4));
            kv(&mut out, 8, "Encoder", "0 %");
            kv(&mut out, 8, "Decoder", "0 %");
        }
        if want("ECC") {
            header(&mut out, 4, "ECC Mode");
            kv(&mut out, 8, "Current", "Enabled");
            kv(&mut out, 8, "Pending", "Enabled");
            header(&mut out, 4, "ECC Errors");
            header(&mut out, 8, "Volatile");
            kv(&mut out, 12, "SRAM Correctable", g.ecc.volatile.single_bit);
            kv(&mut out, 12, "SRAM Uncorrectable", g.ecc.volatile.double_bit);
            kv(&mut out, 12, "DRAM Correctable", 0);
            kv(&mut out, 12, "DRAM Uncorrectable", 0);
            header(&mut out, 8, "Aggregate");
            kv(&mut out, 12, "SRAM Correctable", g.ecc.aggregate.single_bit);
            kv(&mut out, 12, "SRAM Uncorrectable", g.ecc.aggregate.double_bit);
            kv(&mut out, 12, "DRAM Correctable", 0);
            kv(&mut out, 12, "DRAM Uncorrectable", 0);
        }
        if want("PAGE_RETIREMENT") || want("ECC") {
            header(&mut out, 4, "Remapped Rows");
            kv(&mut out, 8, "Correctable Error", g.ecc.aggregate.single_bit.min(1));
            kv(&mut out, 8, "Uncorrectable Error", g.ecc.aggregate.double_bit);
            kv(&mut out, 8, "Pending", if g.ecc.volatile.double_bit > 0 { "Yes" } else { "No" });
            kv(&mut out, 8, "Remapping Failure Occurred", "No");
        }
        if want("TEMPERATURE") {
            header(&mut out, 4, "Temperature");
            kv(&mut out, 8, "GPU Current Temp", format!("{} C", g.temperature_c));
            kv(&mut out, 8, "GPU Shutdown Temp", format!("{} C", SHUTDOWN_C));
            kv(&mut out, 8, "GPU Slowdown Temp", format!("{} C", THERMAL_WARNING_C));
            kv(&mut out, 8, "GPU Max Operating Temp", format!("{} C", THERMAL_WARNING_C - 2));
            kv(&mut out, 8, "Memory Current Temp", format!("{} C", g.temperature_c + 4));
        }
        if want("POWER") {
            header(&mut out, 4, "GPU Power Readings");
            kv(&mut out, 8, "Power Draw", format!("{:.2} W", g.power_draw_w));
            kv(&mut out, 8, "Current Power Limit", format!("{:.2} W", g.power_limit_w));
            kv(&mut out, 8, "Default Power Limit", format!("{:.2} W", hw.power_limit_w));
            kv(&mut out, 8, "Min Power Limit", "200.00 W");
            kv(&mut out, 8, "Max Power Limit", format!("{:.2} W", hw.power_limit_w));
        }
        if want("CLOCK") {
            header(&mut out, 4, "Clocks");
            kv(&mut out, 8, "Graphics", format!("{} MHz", g.sm_clock_mhz));
            kv(&mut out, 8, "SM", format!("{} MHz", g.sm_clock_mhz));
            kv(&mut out, 8, "Memory", format!("{} MHz", g.mem_clock_mhz));
            header(&mut out, 4, "Max Clocks");
            kv(&mut out, 8, "Graphics", format!("{} MHz", hw.sm_clock_mhz));
            kv(&mut out, 8, "SM", format!("{} MHz", hw.sm_clock_mhz));
            kv(&mut out, 8, "Memory", format!("{} MHz", hw.mem_clock_mhz));
        }
        out.push('\n');
    }
    out
}

fn health_block(out: &mut String, g: &Gpu) {
    let health = g.health();
    kv(out, 4, "GPU Health", health);
    if g.xid_errors.is_empty() {
        kv(out, 4, "Xid Errors", "None");
    } else {
        header(out, 4, "Xid Errors");
        for x in &g.xid_errors {
            kv(
                out,
                8,
                &format!("Xid {}", x.code),
                format!("{} ({})", x.description(), x.timestamp.format("%Y-%m-%d %H:%M:%S")),
            );
        }
    }
    if health != HealthStatus::OK {
        header(out, 4, "Health Incidents");
        for i in health_reasons(g) {
            out.push_str(&format!("        [{}] {}\n", i.severity(), i));
        }
    }
}

// ---------------------------------------------------------------------------
// --query-gpu
// ---------------------------------------------------------------------------

fn query_gpu(cmd: &ParsedCommand, fields: &str, gpus: &[&Gpu], cluster: &Cluster) -> Result<CommandOutput> {
    let format = cmd.flag_value(&["format"]).ok_or_else(|| {
        SimError::Usage("\"--format=\" switch is missing. Please run 'nvidia-smi -h' for help.".to_string())
    })?;
    let opts: Vec<&str> = format.split(',').map(str::trim).collect();
    if !opts.contains(&"csv") {
        return Err(SimError::Usage(format!("\"{}\" is not a valid format. Please run 'nvidia-smi -h' for help.", format)));
    }
    let noheader = opts.contains(&"noheader");
    let nounits = opts.contains(&"nounits");

    let fields: Vec<&str> = fields.split(',').map(str::trim).filter(|f| !f.is_empty()).collect();
    for f in &fields {
        if field_value(f, gpus[0], cluster).is_none() {
            return Err(SimError::Usage(format!(
                "Field \"{}\" is not a valid field to query.\n\n",
                f
            )));
        }
    }

    let mut out = String::new();
    if !noheader {
        let hdr: Vec<String> = fields
            .iter()
            .map(|f| match (field_unit(f), nounits) {
                (Some(u), false) => format!("{} [{}]", f, u),
                _ => f.to_string(),
            })
            .collect();
        out.push_str(&hdr.join(", "));
        out.push('\n');
    }
    for g in gpus {
        let row: Vec<String> = fields
            .iter()
            .map(|f| {
                let v = field_value(f, g, cluster).unwrap_or_default();
                match (field_unit(f), nounits) {
                    (Some(u), false) => format!("{} {}", v, u),
                    _ => v,
                }
            })
            .collect();
        out.push_str(&row.join(", "));
        out.push('\n');
    }
    Ok(CommandOutput::ok(out))
}

fn field_unit(field: &str) -> Option<&'static str> {
    match field {
        "temperature.gpu" => None,
        "utilization.gpu" | "utilization.memory" => Some("%"),
        "power.draw" | "power.limit" => Some("W"),
        "clocks.sm" | "clocks.gr" | "clocks.mem" | "clocks.current.sm" | "clocks.current.memory" => Some("MHz"),
        "memory.used" | "memory.total" | "memory.free" => Some("MiB"),
        _ => None,
    }
}

fn field_value(field: &str, g: &Gpu, cluster: &Cluster) -> Option<String> {
    let v = match field {
        "index" => g.id.to_string(),
        "name" | "gpu_name" => g.name.clone(),
        "uuid" | "gpu_uuid" => g.uuid.clone(),
        "serial" => g.serial.clone(),
        "pci.bus_id" | "gpu_bus_id" => g.bus_id.clone(),
        "driver_version" => cluster.hardware.driver_version.clone(),
        "temperature.gpu" => g.temperature_c.to_string(),
        "utilization.gpu" => g.utilization_pct.to_string(),
        "utilization.memory" => (g.utilization_pct * 3 / 4).to_string(),
        "power.draw" => format!("{:.2}", g.power_draw_w),
        "power.limit" => format!("{:.2}", g.power_limit_w),
        "clocks.sm" | "clocks.gr" | "clocks.current.sm" => g.sm_clock_mhz.to_string(),
        "clocks.mem" | "clocks.current.memory" => g.mem_clock_mhz.to_string(),
        "memory.used" => g.memory_used_mib.to_string(),
        "memory.total" => g.memory_total_mib.to_string(),
        "memory.free" => g.memory_total_mib.saturating_sub(g.memory_used_mib).to_string(),
        "ecc.errors.uncorrected.volatile.total" => g.ecc.volatile.double_bit.to_string(),
        "ecc.errors.corrected.volatile.total" => g.ecc.volatile.single_bit.to_string(),
        "ecc.errors.uncorrected.aggregate.total" => g.ecc.aggregate.double_bit.to_string(),
        "ecc.errors.corrected.aggregate.total" => g.ecc.aggregate.single_bit.to_string(),
        "pcie.link.gen.current" => g.pcie.link_gen.to_string(),
        "pcie.link.gen.max" => g.pcie.max_link_gen.to_string(),
        "pcie.link.width.current" => g.pcie.link_width.to_string(),
        "pcie.link.width.max" => g.pcie.max_link_width.to_string(),
        "pstate" => (if g.is_thermal_throttled() { "P2" } else { "P0" }).to_string(),
        "clocks_throttle_reasons.hw_thermal_slowdown" | "clocks_event_reasons.hw_thermal_slowdown" => {
            (if g.is_thermal_throttled() { "Active" } else { "Not Active" }).to_string()
        }
        "persistence_mode" => "Enabled".to_string(),
        _ => return None,
    };
    Some(v)
}

// ---------------------------------------------------------------------------
// topo / nvlink
// ---------------------------------------------------------------------------

fn topo(cmd: &ParsedCommand, node: &DgxNode, cluster: &Cluster) -> Result<CommandOutput> {
    if !cmd.has_flag("m") && !cmd.has_flag("matrix") {
        return Err(SimError::Usage(
            "Usage: nvidia-smi topo -m\n    -m, --matrix   Display the GPUDirect communication matrix for the system.".to_string(),
        ));
    }
    let n = node.gpus.len();
    let nics = node.hcas.len();
    let mut headers: Vec<String> = vec![String::new()];
    headers.extend((0..n).map(|i| format!("GPU{}", i)));
    headers.extend((0..nics).map(|i| format!("NIC{}", i)));
    headers.extend(["CPU Affinity", "NUMA Affinity", "GPU NUMA ID"].map(String::from));

    let cpus_half = numa_cpu_ranges(cluster);
    let mut rows: Vec<Vec<String>> = Vec::new();
    for (i, g) in node.gpus.iter().enumerate() {
        let mut row = vec![format!("GPU{}", i)];
        for (j, other) in node.gpus.iter().enumerate() {
            row.push(if i == j {
                " X".to_string()
            } else {
                format!("NV{}", g.active_nvlinks().min(other.active_nvlinks()))
            });
        }
        for j in 0..nics {
            row.push(pci_path(i, j, n, nics).to_string());
        }
        let numa = if i < n / 2 { 0 } else { 1 };
        row.push(cpus_half[numa].clone());
        row.push(numa.to_string());
        row.push("N/A".to_string());
        rows.push(row);
    }
    for (j, _) in node.hcas.iter().enumerate() {
        let mut row = vec![format!("NIC{}", j)];
        for i in 0..n {
            row.push(pci_path(i, j, n, nics).to_string());
        }
        for k in 0..nics {
            row.push((if j == k { " X" } else { pci_path(j, k, nics, nics) }).to_string());
        }
        rows.push(row);
    }
    let header_refs: Vec<&str> = headers.iter().map(|h| h.as_str()).collect();
    let mut out = format!("\t{}\n", header_refs[1..].join("\t"));
    for row in &rows {
        out.push_str(&row.join("\t"));
        out.push('\n');
    }
    out.push_str("\nLegend:\n\n");
    out.push_str("  X    = Self\n");
    out.push_str("  SYS  = Connection traversing PCIe as well as the SMP interconnect between NUMA nodes (e.g., QPI/UPI)\n");
    out.push_str("  NODE = Connection traversing PCIe as well as the interconnect between PCIe Host Bridges within a NUMA node\n");
    out.push_str("  PHB  = Connection traversing PCIe as well as a PCIe Host Bridge (typically the CPU)\n");
    out.push_str("  PXB  = Connection traversing multiple PCIe bridges (without traversing the PCIe Host Bridge)\n");
    out.push_str("  PIX  = Connection traversing at most a single PCIe bridge\n");
    out.push_str("  NV#  = Connection traversing a bonded set of # NVLinks\n\n");
    out.push_str("NIC Legend:\n\n");
    for (j, h) in node.hcas.iter().enumerate() {
        out.push_str(&format!("  NIC{}: {}\n", j, h.id));
    }
    Ok(CommandOutput::ok(out))
}

/// PCIe relationship between device `a` of `na` and device `b` of `nb`:
/// same switch, same NUMA node, or across sockets.
fn pci_path(a: usize, b: usize, na: usize, nb: usize) -> &'static str {
    if a == b {
        "PIX"
    } else if (a < na / 2) == (b < nb / 2) {
        "NODE"
    } else {
        "SYS"
    }
}

fn nvlink(cmd: &ParsedCommand, node: &DgxNode, cluster: &Cluster) -> Result<CommandOutput> {
    let gpus = match select(cmd, node) {
        Some(g) => g,
        None => return Ok(no_devices()),
    };
    let status = cmd.has_any(&["s", "status"]);
    let errors = cmd.has_any(&["e", "errorcounters"]);
    if !status && !errors {
        return Err(SimError::Usage(
            "nvlink -- Display NvLink information.\n\n    Usage: nvidia-smi nvlink [options]\n\n    -s, --status          Display link state (active/inactive).\n    -e, --errorcounters   Display error counters.\n    -i, --id=             Display information for a single GPU.".to_string(),
        ));
    }
    let speed = cluster.hardware.nvlink.link_speed_gb_s;
    let mut out = String::new();
    for g in gpus {
        out.push_str(&format!("GPU {}: {} (UUID: {})\n", g.id, g.name, g.uuid));
        for l in &g.nvlinks {
            if status {
                if l.is_active() {
                    out.push_str(&format!("\t Link {}: {:.3} GB/s\n", l.id, speed));
                } else {
                    out.push_str(&format!("\t Link {}: <inactive>\n", l.id));
                }
            } else {
                out.push_str(&format!("\t Link {}: Replay Errors: {}\n", l.id, l.tx_errors));
                out.push_str(&format!("\t Link {}: Recovery Errors: {}\n", l.id, if l.is_active() { 0 } else { 1 }));
                out.push_str(&format!("\t Link {}: CRC Errors: {}\n", l.id, l.rx_errors));
            }
        }
    }
    Ok(CommandOutput::ok(out))
}

const HELP: &str = "NVIDIA System Management Interface -- v535.129.03

NVSMI provides monitoring information for Tesla and select Quadro devices.

Usage: nvidia-smi [OPTION1 [ARG1]] [OPTION2 [ARG2]] ...

    -h,   --help                Print usage information and exit.

  LIST OPTIONS:

    -L,   --list-gpus           Display a list of GPUs connected to the system.

  SUMMARY OPTIONS:

    -i,   --id=                 Target a specific GPU.

  QUERY OPTIONS:

    -q,   --query               Display GPU or Unit info.
    -d,   --display=            Display only selected information: MEMORY,
                                    UTILIZATION, ECC, TEMPERATURE, POWER, CLOCK,
                                    PERFORMANCE, PAGE_RETIREMENT, PCIE
    --query-gpu=                Information about GPU.
    --format=                   Comma separated list of format options:
                                  csv - comma separated values (MANDATORY)
                                  noheader - skip the first line with column headers
                                  nounits - don't print units for numerical values

  SUBCOMMANDS:

    topo                        Displays device/system topology.
    nvlink                      Displays device nvlink information.
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, FaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(store: &ClusterStore, line: &str) -> Result<CommandOutput> {
        let ctx = CommandContext::new("dgx-00");
        NvidiaSmi.execute((), &parse(line).unwrap(), &ctx, store.cluster())
    }

    #[test]
    fn list_gpus() {
        let store = ClusterStore::superpod("t");
        let out = run(&store, "nvidia-smi -L").unwrap();
        assert_eq!(out.output.lines().count(), 8);
        assert!(out.output.starts_with("GPU 0: NVIDIA H100 80GB HBM3 (UUID: GPU-"));
    }

    #[test]
    fn xid_shows_critical_in_query_and_table() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 0, FaultKind::Xid).unwrap();
        let q = run(&store, "nvidia-smi -q -i 0").unwrap();
        assert!(q.output.lines().any(|l| l.trim_start().starts_with("GPU Health") && l.ends_with(": Critical")));
        assert!(q.output.contains("Xid 79"));
        assert!(q.output.contains("fallen off the bus"));
        let t = run(&store, "nvidia-smi").unwrap();
        assert!(t.output.contains("ERR!"));
    }

    #[test]
    fn near_miss_display_flag_is_rejected() {
        let store = ClusterStore::superpod("t");
        let err = run(&store, "nvidia-smi -q -dECC").unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(run(&store, "nvidia-smi -q -d ECC").unwrap().output.contains("ECC Errors"));
        assert!(run(&store, "nvidia-smi -q -d BOGUS").is_err());
    }

    #[test]
    fn missing_gpu_index() {
        let store = ClusterStore::superpod("t");
        let out = run(&store, "nvidia-smi -i 12").unwrap();
        assert_eq!(out.exit_code, 6);
        assert_eq!(out.output, "No devices were found\n");
    }

    #[test]
    fn query_gpu_csv() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 3, FaultKind::Thermal).unwrap();
        let out = run(&store, "nvidia-smi --query-gpu=index,temperature.gpu,clocks.sm --format=csv,noheader,nounits -i 3").unwrap();
        assert_eq!(out.output, "3, 88, 1386\n");
        let out = run(&store, "nvidia-smi --query-gpu=index,power.draw --format=csv -i 0").unwrap();
        assert_eq!(out.output, "index, power.draw [W]\n0, 72.00 W\n");
        assert!(run(&store, "nvidia-smi --query-gpu=bogus --format=csv").is_err());
    }

    #[test]
    fn nvlink_status_reflects_down_link() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 2, FaultKind::NvLink).unwrap();
        let out = run(&store, "nvidia-smi nvlink -s -i 2").unwrap();
        assert_eq!(out.output.matches("<inactive>").count(), 1);
        assert_eq!(out.output.matches("26.562 GB/s").count(), 17);
        let topo = run(&store, "nvidia-smi topo -m").unwrap();
        assert!(topo.output.contains("NV17"));
    }

    #[test]
    fn nvlink_speed_follows_hardware() {
        let mut cluster = ClusterStore::superpod("t").cluster().clone();
        cluster.hardware.nvlink.link_speed_gb_s = 25.0;
        let ctx = CommandContext::new("dgx-00");
        let out = NvidiaSmi.execute((), &parse("nvidia-smi nvlink -s -i 0").unwrap(), &ctx, &cluster).unwrap();
        assert_eq!(out.output.matches("25.000 GB/s").count(), 18);
        assert!(!out.output.contains("26.562"));
    }
}
