/// `dcgmi`: discovery, group listing, health watches, field monitoring and
/// the diagnostic suite.
///
/// Diagnostic verdicts are a pure function of a GPU's state: every test looks
/// at the same health incidents the rest of the tools report, so a GPU that
/// derives Critical can never pass at any level.
use crate::cluster::{Cluster, DgxNode};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::gpu::{health_reasons, Gpu, HealthIncident, HealthStatus};
use crate::parser::ParsedCommand;
use crate::xid::{self, XidCategory};

use super::{current_node, parse_gpu_list, CommandOutput, Simulator};

const H100_DEVICE_ID: &str = "2330";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagLevel {
    Quick = 1,
    Medium = 2,
    Long = 3,
}

impl std::str::FromStr for DiagLevel {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "quick" | "short" => Ok(DiagLevel::Quick),
            "2" | "medium" => Ok(DiagLevel::Medium),
            "3" | "long" => Ok(DiagLevel::Long),
            other => Err(SimError::Usage(format!(
                "Error: Invalid diagnostic level '{}'. Valid levels are 1, 2, 3 (quick, medium, long).",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagVerdict {
    Pass,
    Warn,
    Fail,
}

impl std::fmt::Display for DiagVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiagVerdict::Pass => f.pad("Pass"),
            DiagVerdict::Warn => f.pad("Warn"),
            DiagVerdict::Fail => f.pad("Fail"),
        }
    }
}

/// One diagnostic test and the level it first runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiagTest {
    Denylist,
    NvmlLibrary,
    CudaMainLibrary,
    Permissions,
    PersistenceMode,
    EnvironmentVariables,
    PageRetirement,
    GraphicsProcesses,
    Inforom,
    XidErrors,
    Pcie,
    NvLink,
    GpuMemory,
    Diagnostic,
    TargetedStress,
    TargetedPower,
    MemoryBandwidth,
}

impl DiagTest {
    const ALL: [DiagTest; 17] = [
        DiagTest::Denylist,
        DiagTest::NvmlLibrary,
        DiagTest::CudaMainLibrary,
        DiagTest::Permissions,
        DiagTest::PersistenceMode,
        DiagTest::EnvironmentVariables,
        DiagTest::PageRetirement,
        DiagTest::GraphicsProcesses,
        DiagTest::Inforom,
        DiagTest::XidErrors,
        DiagTest::Pcie,
        DiagTest::NvLink,
        DiagTest::GpuMemory,
        DiagTest::Diagnostic,
        DiagTest::TargetedStress,
        DiagTest::TargetedPower,
        DiagTest::MemoryBandwidth,
    ];

    fn label(&self) -> &'static str {
        match self {
            DiagTest::Denylist             => "Denylist",
            DiagTest::NvmlLibrary          => "NVML Library",
            DiagTest::CudaMainLibrary      => "CUDA Main Library",
            DiagTest::Permissions          => "Permissions and OS Blocks",
            DiagTest::PersistenceMode      => "Persistence Mode",
            DiagTest::EnvironmentVariables => "Environment Variables",
            DiagTest::PageRetirement       => "Page Retirement/Row Remap",
            DiagTest::GraphicsProcesses    => "Graphics Processes",
            DiagTest::Inforom              => "Inforom",
            DiagTest::XidErrors            => "Xid Errors",
            DiagTest::Pcie                 => "PCIe",
            DiagTest::NvLink               => "NVLink",
            DiagTest::GpuMemory            => "GPU Memory",
            DiagTest::Diagnostic           => "Diagnostic",
            DiagTest::TargetedStress       => "Targeted Stress",
            DiagTest::TargetedPower        => "Targeted Power",
            DiagTest::MemoryBandwidth      => "Memory Bandwidth",
        }
    }

    fn section(&self) -> &'static str {
        match self.level() {
            DiagLevel::Quick => "Deployment",
            DiagLevel::Medium => "Integration",
            DiagLevel::Long => match self {
                DiagTest::GpuMemory | DiagTest::Diagnostic => "Hardware",
                _ => "Stress",
            },
        }
    }

    fn level(&self) -> DiagLevel {
        match self {
            DiagTest::Pcie | DiagTest::NvLink => DiagLevel::Medium,
            DiagTest::GpuMemory
            | DiagTest::Diagnostic
            | DiagTest::TargetedStress
            | DiagTest::TargetedPower
            | DiagTest::MemoryBandwidth => DiagLevel::Long,
            _ => DiagLevel::Quick,
        }
    }

    /// Verdict of this test on one GPU.
    fn judge(&self, gpu: &Gpu, incidents: &[HealthIncident]) -> DiagVerdict {
        let any = |f: &dyn Fn(&HealthIncident) -> bool| incidents.iter().any(f);
        let xid_in = |cat: XidCategory| {
            any(&|i| matches!(i, HealthIncident::Xid { code } if xid::category(*code) == cat))
        };
        let dbe = any(&|i| matches!(i, HealthIncident::DoubleBitEcc { .. }));
        match self {
            DiagTest::PageRetirement => {
                if dbe || gpu.ecc.aggregate.double_bit > 0 {
                    DiagVerdict::Fail
                } else if gpu.ecc.volatile.single_bit > 0 {
                    DiagVerdict::Warn
                } else {
                    DiagVerdict::Pass
                }
            }
            DiagTest::XidErrors => {
                if gpu.xid_errors.is_empty() { DiagVerdict::Pass } else { DiagVerdict::Fail }
            }
            DiagTest::Pcie => {
                if xid_in(XidCategory::Bus) {
                    DiagVerdict::Fail
                } else if any(&|i| matches!(i, HealthIncident::Pcie { .. })) {
                    DiagVerdict::Warn
                } else {
                    DiagVerdict::Pass
                }
            }
            DiagTest::NvLink => {
                if xid_in(XidCategory::NvLink) {
                    DiagVerdict::Fail
                } else if any(&|i| matches!(i, HealthIncident::NvLinkDown { .. })) {
                    DiagVerdict::Warn
                } else {
                    DiagVerdict::Pass
                }
            }
            DiagTest::GpuMemory | DiagTest::MemoryBandwidth => {
                if dbe || xid_in(XidCategory::Memory) { DiagVerdict::Fail } else { DiagVerdict::Pass }
            }
            DiagTest::Diagnostic | DiagTest::TargetedStress => {
                if !gpu.xid_errors.is_empty() || dbe {
                    DiagVerdict::Fail
                } else if any(&|i| matches!(i, HealthIncident::Thermal { .. })) {
                    DiagVerdict::Warn
                } else {
                    DiagVerdict::Pass
                }
            }
            DiagTest::TargetedPower => {
                if gpu.health() == HealthStatus::Critical {
                    DiagVerdict::Fail
                } else if gpu.is_power_capped() || gpu.is_thermal_throttled() {
                    DiagVerdict::Warn
                } else {
                    DiagVerdict::Pass
                }
            }
            _ => DiagVerdict::Pass,
        }
    }
}

/// Result of one test across the selected GPUs.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub name: &'static str,
    pub section: &'static str,
    pub verdict: DiagVerdict,
    /// (gpu, verdict) for every GPU that did not pass
    pub failures: Vec<(u32, DiagVerdict)>,
}

#[derive(Debug, Clone)]
pub struct DiagReport {
    pub level: DiagLevel,
    pub gpus: Vec<u32>,
    pub tests: Vec<TestResult>,
    /// Incident lines for every GPU that did not pass
    pub details: Vec<(u32, String)>,
}

impl DiagReport {
    pub fn verdict(&self) -> DiagVerdict {
        self.tests.iter().map(|t| t.verdict).max().unwrap_or(DiagVerdict::Pass)
    }

    pub fn verdict_for(&self, gpu: u32) -> DiagVerdict {
        self.tests
            .iter()
            .flat_map(|t| t.failures.iter())
            .filter(|(g, _)| *g == gpu)
            .map(|(_, v)| *v)
            .max()
            .unwrap_or(DiagVerdict::Pass)
    }
}

/// Run every test up to `level` on `gpus`.
pub fn run_diag(gpus: &[&Gpu], level: DiagLevel) -> DiagReport {
    let incidents: Vec<Vec<HealthIncident>> = gpus.iter().map(|g| health_reasons(g)).collect();
    let tests = DiagTest::ALL
        .iter()
        .filter(|t| t.level() <= level)
        .map(|t| {
            let failures: Vec<(u32, DiagVerdict)> = gpus
                .iter()
                .zip(&incidents)
                .map(|(g, inc)| (g.id, t.judge(g, inc)))
                .filter(|(_, v)| *v != DiagVerdict::Pass)
                .collect();
            TestResult {
                name: t.label(),
                section: t.section(),
                verdict: failures.iter().map(|(_, v)| *v).max().unwrap_or(DiagVerdict::Pass),
                failures,
            }
        })
        .collect();
    let details = gpus
        .iter()
        .zip(&incidents)
        .flat_map(|(g, inc)| inc.iter().map(move |i| (g.id, i.to_string())))
        .collect();
    DiagReport { level, gpus: gpus.iter().map(|g| g.id).collect(), tests, details }
}

#[derive(Debug, Default)]
pub struct Dcgmi;

impl Simulator for Dcgmi {
    type Verb = ();

    fn name(&self) -> &'static str {
        "dcgmi"
    }

    fn execute(&mut self, _: (), cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        if cmd.has_any(&["version", "v"]) && cmd.subcommand.is_none() {
            return Ok(CommandOutput::ok(format!(
                "dcgmi  version: {}\n",
                cluster.hardware.dcgm_version
            )));
        }
        let node = current_node(ctx, cluster)?;
        match cmd.subcommand.as_deref() {
            Some("discovery") => discovery(cmd, node),
            Some("diag") => diag(cmd, node, cluster),
            Some("health") => health(cmd, node),
            Some("group") => group(cmd, node),
            Some("dmon") => dmon(cmd, node),
            Some(other) => Err(SimError::Usage(format!(
                "ERROR: Invalid subsystem '{}'.\n\n{}",
                other, USAGE
            ))),
            None => Err(SimError::Usage(USAGE.to_string())),
        }
    }
}

const USAGE: &str = "Usage: dcgmi <subsystem>
  subsystems: discovery, diag, health, group, dmon
  --version   Print the DCGM version";

const BAR: &str = "+--------+----------------------------------------------------------------------+";

fn discovery(cmd: &ParsedCommand, node: &DgxNode) -> Result<CommandOutput> {
    if !cmd.has_flag("l") {
        return Err(SimError::Usage("Usage: dcgmi discovery -l".to_string()));
    }
    let mut out = format!("{} GPUs found.\n{}\n", node.gpus.len(), BAR);
    out.push_str("| GPU ID | Device Information                                                   |\n");
    out.push_str(&format!("{}\n", BAR));
    for g in &node.gpus {
        out.push_str(&format!("| {:<6} | {:<68} |\n", g.id, format!("Name: {}", g.name)));
        out.push_str(&format!("| {:<6} | {:<68} |\n", "", format!("PCI Bus ID: {}", g.bus_id)));
        out.push_str(&format!("| {:<6} | {:<68} |\n", "", format!("Device UUID: {}", g.uuid)));
        out.push_str(&format!("{}\n", BAR));
    }
    out.push_str("4 NvSwitches found.\n");
    out.push_str("+-----------+\n| Switch ID |\n+-----------+\n");
    for s in 0..4 {
        out.push_str(&format!("| {:<9} |\n", s));
    }
    out.push_str("+-----------+\n");
    Ok(CommandOutput::ok(out))
}

fn selected_gpus<'a>(cmd: &ParsedCommand, node: &'a DgxNode, tool: &str) -> Result<Vec<&'a Gpu>> {
    match cmd.flag_value(&["i", "gpuList"]) {
        Some(list) => {
            let ids = parse_gpu_list(list, node).map_err(|bad| {
                SimError::NotFound(format!("Error: {}: GPU {} was not found on this system.", tool, bad))
            })?;
            Ok(ids.iter().filter_map(|id| node.gpu(*id)).collect())
        }
        None => Ok(node.gpus.iter().collect()),
    }
}

fn diag(cmd: &ParsedCommand, node: &DgxNode, cluster: &Cluster) -> Result<CommandOutput> {
    let level: DiagLevel = cmd
        .flag_value(&["r", "run"])
        .ok_or_else(|| SimError::Usage("Error: diag requires -r <level>. Valid levels are 1, 2, 3.".to_string()))?
        .parse()?;
    let gpus = selected_gpus(cmd, node, "diag")?;
    let report = run_diag(&gpus, level);

    let sep = "+---------------------------+------------------------------------------------+";
    let mut out = String::from("Successfully ran diagnostic for group.\n");
    out.push_str(&format!("{}\n", sep));
    out.push_str("| Diagnostic                | Result                                         |\n");
    out.push_str("+===========================+================================================+\n");
    out.push_str("|-----  Metadata  ----------+------------------------------------------------|\n");
    row(&mut out, "DCGM Version", &cluster.hardware.dcgm_version);
    row(&mut out, "Driver Version Detected", &cluster.hardware.driver_version);
    row(&mut out, "GPU Device IDs Detected", &vec![H100_DEVICE_ID; gpus.len()].join(","));
    let mut section = "";
    for t in &report.tests {
        if t.section != section {
            section = t.section;
            out.push_str(&format!("|-----  {:<10}--------+------------------------------------------------|\n", section));
        }
        let cell = match t.verdict {
            DiagVerdict::Pass => "Pass".to_string(),
            v => {
                let ids: Vec<String> = t
                    .failures
                    .iter()
                    .filter(|(_, fv)| *fv == v)
                    .map(|(g, _)| g.to_string())
                    .collect();
                format!("{} - GPU: {}", v, ids.join(", "))
            }
        };
        row(&mut out, t.name, &cell);
    }
    for (gpu, text) in &report.details {
        row(&mut out, &format!("Warning: GPU {}", gpu), text);
    }
    out.push_str(&format!("{}\n", sep));
    let verdict = report.verdict();
    out.push_str(&format!("Overall Result: {}\n", verdict));
    let code = if verdict == DiagVerdict::Fail { 1 } else { 0 };
    Ok(CommandOutput { output: out, exit_code: code, actions: Vec::new() })
}

fn row(out: &mut String, key: &str, value: &str) {
    out.push_str(&format!("| {:<25} | {:<46} |\n", key, value));
}

fn health(cmd: &ParsedCommand, node: &DgxNode) -> Result<CommandOutput> {
    if !cmd.has_flag("c") {
        return Err(SimError::Usage("Usage: dcgmi health -c [-g <groupId>]".to_string()));
    }
    let gpus = selected_gpus(cmd, node, "health")?;
    let overall = gpus.iter().map(|g| g.health()).max().unwrap_or(HealthStatus::OK);
    let word = |h: HealthStatus| match h {
        HealthStatus::OK => "Healthy",
        HealthStatus::Warning => "Warning",
        HealthStatus::Critical => "Failure",
    };
    let sep = "+----------------------------------------------------------------------------+";
    let mut out = String::from("Health Monitor Report\n");
    out.push_str(&format!("{}\n", sep));
    out.push_str(&format!("| {:<30} | {:<41} |\n", "Group 0", format!("Overall Health: {}", word(overall))));
    out.push_str("+================================+===========================================+\n");
    for g in gpus {
        let h = g.health();
        out.push_str(&format!("| {:<30} | {:<41} |\n", format!("GPU ID: {}", g.id), word(h)));
        for i in health_reasons(g) {
            let line = format!("{} system: {} - {}", i.subsystem(), word(i.severity()), i);
            out.push_str(&format!("| {:<30} | {:<41} |\n", "", line));
        }
    }
    out.push_str(&format!("{}\n", sep));
    Ok(CommandOutput::ok(out))
}

fn group(cmd: &ParsedCommand, node: &DgxNode) -> Result<CommandOutput> {
    if !cmd.has_flag("l") {
        return Err(SimError::Usage("Usage: dcgmi group -l".to_string()));
    }
    let ids: Vec<String> = node.gpus.iter().map(|g| format!("GPU {}", g.id)).collect();
    let sep = "+-------------------+----------------------------------------------------------+";
    let mut out = format!("{}\n| GROUPS{:<72}|\n", sep, "");
    out.push_str("| 2 groups found.                                                              |\n");
    out.push_str(&format!("{}\n", sep));
    out.push_str(&format!("| {:<17} | {:<56} |\n", "Groups", ""));
    out.push_str(&format!("| -> 0{:<14} |{:<58}|\n", "", ""));
    out.push_str(&format!("|    -> Group ID    | {:<56} |\n", "0"));
    out.push_str(&format!("|    -> Group Name  | {:<56} |\n", "DCGM_ALL_SUPPORTED_GPUS"));
    out.push_str(&format!("|    -> Entities    | {:<56} |\n", ids.join(", ")));
    out.push_str(&format!("| -> 1{:<14} |{:<58}|\n", "", ""));
    out.push_str(&format!("|    -> Group ID    | {:<56} |\n", "1"));
    out.push_str(&format!("|    -> Group Name  | {:<56} |\n", "DCGM_ALL_SUPPORTED_NVSWITCHES"));
    out.push_str(&format!("|    -> Entities    | {:<56} |\n", "NvSwitch 0, NvSwitch 1, NvSwitch 2, NvSwitch 3"));
    out.push_str(&format!("{}\n", sep));
    Ok(CommandOutput::ok(out))
}

/// DCGM field ids `dmon` understands: (id, column, unit).
const DMON_FIELDS: [(u32, &str, &str); 7] = [
    (100, "SMCLK", "MHz"),
    (101, "MMCLK", "MHz"),
    (150, "TMPTR", "C"),
    (155, "POWER", "W"),
    (203, "GPUTL", "%"),
    (252, "FBUSD", "MB"),
    (312, "DBE", ""),
];

fn dmon_value(field: u32, g: &Gpu) -> String {
    match field {
        100 => g.sm_clock_mhz.to_string(),
        101 => g.mem_clock_mhz.to_string(),
        150 => g.temperature_c.to_string(),
        155 => format!("{:.3}", g.power_draw_w),
        203 => g.utilization_pct.to_string(),
        252 => g.memory_used_mib.to_string(),
        312 => g.ecc.volatile.double_bit.to_string(),
        _ => "N/A".to_string(),
    }
}

fn dmon(cmd: &ParsedCommand, node: &DgxNode) -> Result<CommandOutput> {
    let fields: Vec<u32> = match cmd.flag_value(&["e"]) {
        Some(list) => {
            let mut out = Vec::new();
            for f in list.split(',') {
                let id: u32 = f.trim().parse().map_err(|_| SimError::Usage(format!("Error: invalid field id '{}'", f)))?;
                if !DMON_FIELDS.iter().any(|(fid, _, _)| *fid == id) {
                    return Err(SimError::Usage(format!("Error: field id {} is not supported", id)));
                }
                out.push(id);
            }
            out
        }
        None => vec![203, 150, 155],
    };
    // `-c` is boolean for `health`, so its value may land as an operand here
    let count_arg = cmd
        .flag_value(&["c", "count"])
        .or_else(|| cmd.has_flag("c").then(|| cmd.positionals.first().map(|s| s.as_str())).flatten());
    let count: usize = match count_arg {
        Some(c) => c.parse().map_err(|_| SimError::Usage(format!("Error: invalid count '{}'", c)))?,
        None => 1,
    };
    let gpus = selected_gpus(cmd, node, "dmon")?;
    let meta = |id: u32| DMON_FIELDS.iter().find(|(f, _, _)| *f == id).copied().unwrap_or((id, "?", ""));

    let mut out = String::from("#Entity   ");
    out.push_str(&fields.iter().map(|f| format!("{:>9}", meta(*f).1)).collect::<String>());
    out.push_str("\nID        ");
    out.push_str(&fields.iter().map(|f| format!("{:>9}", meta(*f).2)).collect::<String>());
    out.push('\n');
    for _ in 0..count.max(1) {
        for g in &gpus {
            out.push_str(&format!("{:<10}", format!("GPU {}", g.id)));
            out.push_str(&fields.iter().map(|f| format!("{:>9}", dmon_value(*f, g))).collect::<String>());
            out.push('\n');
        }
    }
    Ok(CommandOutput::ok(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, FaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(store: &ClusterStore, line: &str) -> Result<CommandOutput> {
        let ctx = CommandContext::new("dgx-00");
        Dcgmi.execute((), &parse(line).unwrap(), &ctx, store.cluster())
    }

    #[test]
    fn healthy_node_passes_every_level() {
        let store = ClusterStore::superpod("t");
        for level in ["1", "2", "3"] {
            let out = run(&store, &format!("dcgmi diag -r {}", level)).unwrap();
            assert!(out.output.ends_with("Overall Result: Pass\n"), "{}", out.output);
            assert_eq!(out.exit_code, 0);
        }
    }

    #[test]
    fn critical_gpu_never_passes() {
        for kind in [FaultKind::Xid, FaultKind::Ecc] {
            let mut store = ClusterStore::superpod("t");
            inject_fault(&mut store, "dgx-00", 0, kind).unwrap();
            let gpu = store.cluster().gpu("dgx-00", 0).unwrap();
            for level in [DiagLevel::Quick, DiagLevel::Medium, DiagLevel::Long] {
                let report = run_diag(&[gpu], level);
                assert_eq!(report.verdict(), DiagVerdict::Fail, "{:?} at {:?}", kind, level);
            }
            let out = run(&store, "dcgmi diag -r quick -i 0").unwrap();
            assert!(out.output.contains("Fail - GPU: 0"));
            assert_eq!(out.exit_code, 1);
        }
    }

    #[test]
    fn warning_faults_warn_at_higher_levels() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 4, FaultKind::NvLink).unwrap();
        let gpu = store.cluster().gpu("dgx-00", 4).unwrap();
        assert_eq!(run_diag(&[gpu], DiagLevel::Quick).verdict(), DiagVerdict::Pass);
        assert_eq!(run_diag(&[gpu], DiagLevel::Medium).verdict(), DiagVerdict::Warn);
        assert_eq!(run_diag(&[gpu], DiagLevel::Medium).verdict_for(4), DiagVerdict::Warn);
    }

    #[test]
    fn bad_level_and_missing_gpu() {
        let store = ClusterStore::superpod("t");
        assert!(matches!(run(&store, "dcgmi diag -r 9"), Err(SimError::Usage(_))));
        assert!(matches!(run(&store, "dcgmi diag -r 1 -i 8"), Err(SimError::NotFound(_))));
    }

    #[test]
    fn health_check_reports_failure() {
        let mut store = ClusterStore::superpod("t");
        let out = run(&store, "dcgmi health -c").unwrap();
        assert!(out.output.contains("Overall Health: Healthy"));
        inject_fault(&mut store, "dgx-00", 6, FaultKind::Ecc).unwrap();
        let out = run(&store, "dcgmi health -c").unwrap();
        assert!(out.output.contains("Overall Health: Failure"));
        assert!(out.output.contains("Memory system: Failure"));
    }

    #[test]
    fn dmon_columns() {
        let store = ClusterStore::superpod("t");
        let out = run(&store, "dcgmi dmon -e 150,155 -c 2 -i 1").unwrap();
        let lines: Vec<&str> = out.output.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("TMPTR") && lines[0].contains("POWER"));
        assert!(lines[2].starts_with("GPU 1") && lines[2].contains("72.000"));
    }

    #[test]
    fn discovery_lists_all_gpus() {
        let store = ClusterStore::superpod("t");
        let out = run(&store, "dcgmi discovery -l").unwrap();
        assert!(out.output.starts_with("8 GPUs found."));
        assert_eq!(out.output.matches("Device UUID").count(), 8);
    }
}
