/// Cluster manager family: `bcm`, `bcm-node` and `crm` on the head node.
use crate::cluster::{Cluster, DgxNode, SlurmState};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::gpu::HealthStatus;
use crate::parser::ParsedCommand;

use super::{render_table, CommandOutput, Simulator};

const BCM_VERSION: &str = "10.0";
const BCM_BUILD: &str = "10.24.03";
const HEAD_NODES: [&str; 2] = ["bcm-head-01", "bcm-head-02"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcmVerb {
    Bcm,
    BcmNode,
    Crm,
}

/// Node status as the cluster manager reports it.
pub fn node_status(node: &DgxNode) -> &'static str {
    match node.slurm_state {
        SlurmState::Down => "DOWN",
        SlurmState::Drain => "CLOSED",
        _ => "UP",
    }
}

fn health_word(h: HealthStatus) -> &'static str {
    match h {
        HealthStatus::OK       => "PASS",
        HealthStatus::Warning  => "WARN",
        HealthStatus::Critical => "FAIL",
    }
}

#[derive(Debug, Default)]
pub struct ClusterManager;

impl Simulator for ClusterManager {
    type Verb = BcmVerb;

    fn name(&self) -> &'static str {
        "bcm"
    }

    fn execute(&mut self, verb: BcmVerb, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        match verb {
            BcmVerb::Bcm => match cmd.subcommand.as_deref() {
                Some("status") => Ok(CommandOutput::ok(status(cluster))),
                Some("version") => Ok(CommandOutput::ok(format!(
                    "Base Command Manager {} (build {})\n",
                    BCM_VERSION, BCM_BUILD
                ))),
                _ => Err(SimError::Usage("usage: bcm <status|version>".to_string())),
            },
            BcmVerb::BcmNode => match cmd.subcommand.as_deref() {
                Some("list") => Ok(CommandOutput::ok(list(cluster))),
                Some("show") => {
                    let name = cmd
                        .positionals
                        .first()
                        .ok_or_else(|| SimError::Usage("usage: bcm-node show <node>".to_string()))?;
                    let node = cluster
                        .node(name)
                        .ok_or_else(|| SimError::NotFound(format!("bcm-node: node '{}' not found", name)))?;
                    Ok(CommandOutput::ok(show(cluster, node)))
                }
                _ => Err(SimError::Usage("usage: bcm-node <list|show <node>>".to_string())),
            },
            BcmVerb::Crm => match cmd.subcommand.as_deref() {
                Some("status") => Ok(CommandOutput::ok(crm_status(ctx))),
                _ => Err(SimError::Usage("usage: crm status".to_string())),
            },
        }
    }
}

fn status(cluster: &Cluster) -> String {
    let total = cluster.nodes.len();
    let up = cluster.nodes.iter().filter(|n| node_status(n) == "UP").count();
    let closed = cluster.nodes.iter().filter(|n| node_status(n) == "CLOSED").count();
    let down = total - up - closed;
    let failing = cluster.nodes.iter().filter(|n| n.health() != HealthStatus::OK).count();
    let s = cluster.summary();
    let mut out = format!("Base Command Manager {}\n", BCM_VERSION);
    out.push_str(&format!("Cluster name     : {}\n", cluster.name));
    out.push_str(&format!("Head node        : {} (active), {} (passive)\n", HEAD_NODES[0], HEAD_NODES[1]));
    out.push_str(&format!("Nodes            : {} total, {} UP, {} CLOSED, {} DOWN\n", total, up, closed, down));
    out.push_str(&format!("Health checks    : {} node(s) failing\n", failing));
    out.push_str(&format!(
        "GPUs             : {} total, {} healthy, {} warning, {} critical\n",
        s.total_gpus, s.healthy_gpus, s.warning_gpus, s.critical_gpus
    ));
    out
}

fn list(cluster: &Cluster) -> String {
    let rows: Vec<Vec<String>> = cluster
        .nodes
        .iter()
        .map(|n| {
            vec![
                n.hostname.clone(),
                "dgx-h100".to_string(),
                n.mgmt_ip.clone(),
                node_status(n).to_string(),
                health_word(n.health()).to_string(),
            ]
        })
        .collect();
    render_table(&["Hostname", "Category", "IP", "Status", "Health"], &rows, 2)
}

fn show(cluster: &Cluster, node: &DgxNode) -> String {
    let hw = &cluster.hardware;
    let healthy = node.gpus.iter().filter(|g| g.health() == HealthStatus::OK).count();
    let active_ports = node.ports().filter(|(_, p)| !p.is_degraded()).count();
    let total_ports = node.ports().count();
    let nvl_active: usize = node.gpus.iter().map(|g| g.active_nvlinks()).sum();
    let nvl_total: usize = node.gpus.iter().map(|g| g.nvlinks.len()).sum();
    let mut out = String::new();
    let mut kv = |k: &str, v: String| out.push_str(&format!("{:<24}{}\n", k, v));
    kv("Hostname", node.hostname.clone());
    kv("Category", "dgx-h100".to_string());
    kv("Model", hw.system_model.clone());
    kv("Management IP", node.mgmt_ip.clone());
    kv("BMC IP", node.bmc_ip.clone());
    kv("Status", node_status(node).to_string());
    kv("Health", health_word(node.health()).to_string());
    kv("Slurm state", node.slurm_state.to_string());
    kv("Slurm reason", node.slurm_reason.clone().unwrap_or_else(|| "-".to_string()));
    kv("GPUs", format!("{} ({} healthy)", node.gpus.len(), healthy));
    kv("NVLinks", format!("{}/{} active", nvl_active, nvl_total));
    kv("InfiniBand ports", format!("{}/{} active", active_ports, total_ports));
    kv("Kernel", hw.kernel.clone());
    kv("Driver", hw.driver_version.clone());
    kv("BMC firmware", hw.bmc_firmware.clone());
    kv("BIOS", hw.bios_version.clone());
    out
}

fn crm_status(ctx: &CommandContext) -> String {
    let mut out = String::from("Cluster Summary:\n");
    out.push_str("  * Stack: corosync\n");
    out.push_str(&format!("  * Current DC: {} (version 2.1.2) - partition with quorum\n", HEAD_NODES[0]));
    out.push_str(&format!("  * Last updated: {}\n", ctx.now().format("%a %b %e %H:%M:%S %Y")));
    out.push_str("  * 2 nodes configured\n");
    out.push_str("  * 4 resource instances configured\n\n");
    out.push_str(&format!("Node List:\n  * Online: [ {} {} ]\n\n", HEAD_NODES[0], HEAD_NODES[1]));
    out.push_str("Full List of Resources:\n");
    out.push_str(&format!("  * cmd\t(systemd:cmd):\t Started {}\n", HEAD_NODES[0]));
    out.push_str(&format!("  * cmha-vip\t(ocf:heartbeat:IPaddr2):\t Started {}\n", HEAD_NODES[0]));
    out.push_str(&format!("  * slurmctld\t(systemd:slurmctld):\t Started {}\n", HEAD_NODES[0]));
    out.push_str(&format!("  * mysqld\t(systemd:mysql):\t Started {}\n", HEAD_NODES[0]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, FaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(store: &ClusterStore, verb: BcmVerb, line: &str) -> Result<CommandOutput> {
        let ctx = CommandContext::new("dgx-00");
        ClusterManager.execute(verb, &parse(line).unwrap(), &ctx, store.cluster())
    }

    #[test]
    fn list_reflects_health_and_drain() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-03", 0, FaultKind::Ecc).unwrap();
        store.set_slurm_state("dgx-05", SlurmState::Drain, Some("maint".into())).unwrap();
        let out = run(&store, BcmVerb::BcmNode, "bcm-node list").unwrap();
        assert!(out.output.lines().any(|l| l.starts_with("dgx-03") && l.ends_with("FAIL")));
        assert!(out.output.lines().any(|l| l.starts_with("dgx-05") && l.contains("CLOSED")));
        let status = run(&store, BcmVerb::Bcm, "bcm status").unwrap();
        assert!(status.output.contains("8 total, 7 UP, 1 CLOSED, 0 DOWN"));
        assert!(status.output.contains("63 healthy, 0 warning, 1 critical"));
    }

    #[test]
    fn show_node() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-01", 2, FaultKind::NvLink).unwrap();
        let out = run(&store, BcmVerb::BcmNode, "bcm-node show dgx-01").unwrap();
        assert!(out.output.contains("143/144 active"));
        assert!(out.output.contains("7 healthy"));
        assert!(matches!(run(&store, BcmVerb::BcmNode, "bcm-node show dgx-77"), Err(SimError::NotFound(_))));
    }

    #[test]
    fn crm() {
        let store = ClusterStore::superpod("t");
        assert!(run(&store, BcmVerb::Crm, "crm status").unwrap().output.contains("partition with quorum"));
    }
}
