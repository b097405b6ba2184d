/// `nvidia-bug-report.sh`: gathers a support bundle from the other tools.
///
/// The bundle is assembled from the same projections the individual
/// commands print, so what support sees matches what the operator saw.
/// `--safe-mode` skips the sections that would call into the driver.
use chrono::{DateTime, Utc};

use crate::cluster::{Cluster, DgxNode};
use crate::context::CommandContext;
use crate::error::Result;
use crate::parser::{parse, ParsedCommand};

use super::basic::read_virtual_file;
use super::nvidia_smi::NvidiaSmi;
use super::nvsm::node_checks;
use super::pci_logs::system_log;
use super::{current_node, CommandOutput, Simulator};

const RULE: &str = "____________________________________________";
const BUNDLE_NAME: &str = "nvidia-bug-report.log.gz";

/// One `*** <source>` block of the bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleSection {
    pub source: String,
    pub body: String,
}

/// Assemble the bundle for the node `ctx` is logged into.
pub fn collect(ctx: &CommandContext, cluster: &Cluster, safe_mode: bool) -> Result<Vec<BundleSection>> {
    let node = current_node(ctx, cluster)?;
    let now = ctx.now();
    let mut sections = Vec::new();

    for path in ["/etc/os-release", "/proc/version", "/proc/driver/nvidia/version", "/proc/meminfo"] {
        if let Some(body) = read_virtual_file(path, node, cluster) {
            sections.push(BundleSection { source: path.to_string(), body });
        }
    }
    if !safe_mode {
        let smi = NvidiaSmi.execute((), &parse("nvidia-smi -q")?, ctx, cluster)?;
        sections.push(BundleSection { source: "nvidia-smi -q".to_string(), body: smi.output });
    }
    sections.push(BundleSection { source: "dmesg".to_string(), body: kernel_log(node, cluster, now) });

    let checks: String = node_checks(node, cluster)
        .iter()
        .map(|c| format!("{}: {}\n", c.name, c.status))
        .collect();
    sections.push(BundleSection { source: "nvsm show health".to_string(), body: checks });

    let ports: String = node
        .ports()
        .map(|(h, p)| format!("{} port {}: {} ({}) lid {}\n", h.id, p.port, p.state, p.state.physical(), p.lid))
        .collect();
    sections.push(BundleSection { source: "ibstat".to_string(), body: ports });
    Ok(sections)
}

fn kernel_log(node: &DgxNode, cluster: &Cluster, now: DateTime<Utc>) -> String {
    system_log(node, cluster, now)
        .into_iter()
        .filter(|l| l.unit == "kernel")
        .map(|l| format!("{} {}: {}\n", l.at.format("%b %d %H:%M:%S"), node.hostname, l.text))
        .collect()
}

pub fn render_bundle(sections: &[BundleSection]) -> String {
    sections
        .iter()
        .map(|s| format!("{}\n\n*** {}\n\n{}\n", RULE, s.source, s.body))
        .collect()
}

#[derive(Debug, Default)]
pub struct BugReport;

impl Simulator for BugReport {
    type Verb = ();

    fn name(&self) -> &'static str {
        "nvidia-bug-report.sh"
    }

    fn execute(&mut self, _: (), cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        if cmd.has_flag("help") {
            return Ok(CommandOutput::ok(
                "nvidia-bug-report.sh [OPTION]...\n    --safe-mode          Disable some parts of the script that may hang the system.\n    --extra-system-data  Enable additional data collection that may aid in the analysis\n",
            ));
        }
        let safe_mode = cmd.has_flag("safe-mode");
        let sections = collect(ctx, cluster, safe_mode)?;
        let bytes = render_bundle(&sections).len();
        let node = current_node(ctx, cluster)?;
        let xids: usize = node.gpus.iter().map(|g| g.xid_errors.len()).sum();

        let mut out = format!(
            "\nnvidia-bug-report.sh will now collect information about your\nsystem and create the file '{BUNDLE_NAME}' in the current\ndirectory.  It may take several seconds to run.  In some\ncases, it may hang trying to capture data generated dynamically\nby the Linux kernel and/or the NVIDIA kernel module.  While\nthe bug report log file will be incomplete if this happens, it\nmay still contain enough data to diagnose your problem.\n\n"
        );
        if safe_mode {
            out.push_str("Running in safe mode: skipping nvidia-smi and nvidia-debugdump.\n\n");
        }
        out.push_str("Running nvidia-bug-report.sh... complete.\n\n");
        out.push_str(&format!(
            "The file {}/{} has been created; please send this\nreport, along with a description of your bug, to linux-bugs@nvidia.com.\n\n",
            ctx.cwd, BUNDLE_NAME
        ));
        out.push_str(&format!(
            "Collected {} sections ({} bytes uncompressed); {} Xid event(s) recorded.\n",
            sections.len(),
            bytes,
            xids
        ));
        Ok(CommandOutput::ok(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, FaultKind};
    use crate::store::ClusterStore;

    #[test]
    fn bundle_carries_xid_from_every_source() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 0, FaultKind::Xid).unwrap();
        let ctx = CommandContext::new("dgx-00");
        let bundle = render_bundle(&collect(&ctx, store.cluster(), false).unwrap());
        assert!(bundle.contains("*** nvidia-smi -q"));
        assert!(bundle.contains("Xid (PCI:0000:18:00): 79"));
        assert!(bundle.contains("Check GPU0 health: Critical"));
    }

    #[test]
    fn safe_mode_skips_driver_queries() {
        let store = ClusterStore::superpod("t");
        let ctx = CommandContext::new("dgx-03");
        let sections = collect(&ctx, store.cluster(), true).unwrap();
        assert!(sections.iter().all(|s| s.source != "nvidia-smi -q"));
        let out = BugReport.execute((), &parse("nvidia-bug-report.sh --safe-mode").unwrap(), &ctx, store.cluster()).unwrap();
        assert!(out.output.contains("Running in safe mode"));
        assert!(out.output.contains("/root/nvidia-bug-report.log.gz has been created"));
        assert!(out.output.contains("0 Xid event(s)"));
    }
}
