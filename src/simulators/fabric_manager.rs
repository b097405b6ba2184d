/// `nv-fabricmanager`: NVSwitch fabric state derived from every GPU's NVLink
/// array on the current node.
use crate::cluster::{Cluster, DgxNode};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::parser::ParsedCommand;

use super::{current_node, CommandOutput, Simulator};

/// Fabric-level view of one node, shared with `systemctl status
/// nvidia-fabricmanager` so both report the same counts.
#[derive(Debug, Clone, PartialEq)]
pub struct FabricState {
    pub gpus: usize,
    pub switches: u32,
    pub total_links: usize,
    pub active_links: usize,
    /// (gpu, link, switch) for every link that is down
    pub down: Vec<(u32, u32, u32)>,
}

impl FabricState {
    pub fn of(node: &DgxNode, switches: u32) -> Self {
        let mut s = FabricState { gpus: node.gpus.len(), switches, total_links: 0, active_links: 0, down: Vec::new() };
        for g in &node.gpus {
            for l in &g.nvlinks {
                s.total_links += 1;
                if l.is_active() {
                    s.active_links += 1;
                } else {
                    s.down.push((g.id, l.id, l.switch_id));
                }
            }
        }
        s
    }

    pub fn is_degraded(&self) -> bool {
        !self.down.is_empty()
    }

    pub fn state_word(&self) -> &'static str {
        if self.is_degraded() { "Degraded" } else { "Completed" }
    }
}

#[derive(Debug, Default)]
pub struct FabricManager;

impl Simulator for FabricManager {
    type Verb = ();

    fn name(&self) -> &'static str {
        "nv-fabricmanager"
    }

    fn execute(&mut self, _: (), cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        let hw = &cluster.hardware;
        if cmd.has_any(&["version", "v"]) {
            return Ok(CommandOutput::ok(format!(
                "Fabric Manager version is : {}\n",
                hw.fabric_manager_version
            )));
        }
        if cmd.has_any(&["h", "help"]) {
            return Ok(CommandOutput::ok(USAGE));
        }
        let node = current_node(ctx, cluster)?;
        let fabric = FabricState::of(node, hw.nvswitches);
        match cmd.subcommand.as_deref() {
            Some("status") => Ok(CommandOutput::ok(status(node, &fabric, hw.fabric_manager_version.as_str()))),
            Some("query") => query(cmd, node, &fabric),
            Some("diag") => Ok(diag(node, &fabric)),
            Some(other) => Err(SimError::Usage(format!("nv-fabricmanager: unrecognized command '{}'\n{}", other, USAGE))),
            None => Err(SimError::Usage(USAGE.to_string())),
        }
    }
}

const USAGE: &str = "usage: nv-fabricmanager [--version] <status|query [-i gpu]|diag>\n";

fn status(node: &DgxNode, fabric: &FabricState, version: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("Fabric Manager Version : {}\n", version));
    out.push_str(&format!("Node                   : {}\n", node.id));
    out.push_str("Fabric Mode            : Full Passthrough (Bare Metal)\n");
    out.push_str(&format!("Fabric State           : {}\n", fabric.state_word()));
    out.push_str(&format!("NVSwitches Detected    : {}\n", fabric.switches));
    out.push_str(&format!("GPUs Registered        : {}\n", fabric.gpus));
    out.push_str(&format!("NVLinks Active         : {}/{}\n", fabric.active_links, fabric.total_links));
    if fabric.is_degraded() {
        out.push_str(&format!("Degraded Links         : {}\n", fabric.down.len()));
    }
    out
}

fn query(cmd: &ParsedCommand, node: &DgxNode, fabric: &FabricState) -> Result<CommandOutput> {
    let gpus: Vec<_> = match cmd.flag_value(&["i"]) {
        Some(id) => {
            let gpu = id
                .parse::<u32>()
                .ok()
                .and_then(|i| node.gpu(i))
                .ok_or_else(|| SimError::NotFound(format!("nv-fabricmanager: GPU {} not found", id)))?;
            vec![gpu]
        }
        None => node.gpus.iter().collect(),
    };
    let mut out = format!("Fabric State: {}\n", fabric.state_word());
    for g in gpus {
        out.push_str(&format!(
            "GPU {} ({}): {}/{} NVLinks active\n",
            g.id,
            g.bus_id,
            g.active_nvlinks(),
            g.nvlinks.len()
        ));
        for sw in 0..fabric.switches {
            let links: Vec<_> = g.nvlinks.iter().filter(|l| l.switch_id == sw).collect();
            let active = links.iter().filter(|l| l.is_active()).count();
            out.push_str(&format!("    NVSwitch {}: {}/{} links active\n", sw, active, links.len()));
            for l in links.iter().filter(|l| !l.is_active()) {
                out.push_str(&format!(
                    "        Link {}: Down (tx errors {}, rx errors {})\n",
                    l.id, l.tx_errors, l.rx_errors
                ));
            }
        }
    }
    Ok(CommandOutput::ok(out))
}

fn diag(node: &DgxNode, fabric: &FabricState) -> CommandOutput {
    let mut out = format!("Running fabric diagnostics on {}...\n", node.id);
    out.push_str(&format!("  NVSwitch enumeration      : PASS ({} switches)\n", fabric.switches));
    out.push_str(&format!("  GPU registration          : PASS ({} GPUs)\n", fabric.gpus));
    if fabric.is_degraded() {
        out.push_str(&format!(
            "  NVLink training           : FAIL ({}/{} links active)\n",
            fabric.active_links, fabric.total_links
        ));
        for (gpu, link, sw) in &fabric.down {
            out.push_str(&format!("    GPU {} link {} -> NVSwitch {}: link down\n", gpu, link, sw));
        }
        out.push_str("Fabric diagnostics: FAILED\n");
        CommandOutput::fail(out, 1)
    } else {
        out.push_str(&format!(
            "  NVLink training           : PASS ({}/{} links active)\n",
            fabric.active_links, fabric.total_links
        ));
        out.push_str("Fabric diagnostics: PASSED\n");
        CommandOutput::ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, FaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(store: &ClusterStore, line: &str) -> Result<CommandOutput> {
        let ctx = CommandContext::new("dgx-00");
        FabricManager.execute((), &parse(line).unwrap(), &ctx, store.cluster())
    }

    #[test]
    fn healthy_fabric() {
        let store = ClusterStore::superpod("t");
        let out = run(&store, "nv-fabricmanager status").unwrap();
        assert!(out.output.contains("Fabric State           : Completed"));
        assert!(out.output.contains("NVLinks Active         : 144/144"));
        assert!(run(&store, "nv-fabricmanager diag").unwrap().success());
    }

    #[test]
    fn down_link_degrades_fabric() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 5, FaultKind::NvLink).unwrap();
        let out = run(&store, "nv-fabricmanager status").unwrap();
        assert!(out.output.contains("Degraded"));
        assert!(out.output.contains("143/144"));
        let q = run(&store, "nv-fabricmanager query -i 5").unwrap();
        assert!(q.output.contains("GPU 5 (00000000:AB:00.0): 17/18 NVLinks active"));
        assert!(q.output.contains("Link 0: Down (tx errors 16, rx errors 24)"));
        assert_eq!(run(&store, "nv-fabricmanager diag").unwrap().exit_code, 1);
    }

    #[test]
    fn version_and_errors() {
        let store = ClusterStore::superpod("t");
        assert_eq!(
            run(&store, "nv-fabricmanager --version").unwrap().output,
            "Fabric Manager version is : 535.129.03\n"
        );
        assert!(matches!(run(&store, "nv-fabricmanager query -i 11"), Err(SimError::NotFound(_))));
    }
}
