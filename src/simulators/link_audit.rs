/// `nvlink-audit`: cluster-wide NVLink and InfiniBand link audit.
///
/// Totals are counted with the same rules as `ClusterSummary`, so the audit
/// and the dashboard always agree. Exits 1 when any finding is reported.
use serde::Serialize;

use crate::cluster::{Cluster, DgxNode};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::parser::ParsedCommand;

use super::{render_table, CommandOutput, Simulator};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkFinding {
    pub node: String,
    pub component: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeAudit {
    pub node: String,
    pub active_nvlinks: usize,
    pub down_nvlinks: usize,
    pub active_ib_ports: usize,
    pub degraded_ib_ports: usize,
    pub findings: Vec<LinkFinding>,
}

impl NodeAudit {
    pub fn of(node: &DgxNode) -> Self {
        let mut audit = NodeAudit { node: node.id.clone(), ..Default::default() };
        for g in &node.gpus {
            audit.active_nvlinks += g.active_nvlinks();
            audit.down_nvlinks += g.down_nvlinks();
            for l in g.nvlinks.iter().filter(|l| !l.is_active()) {
                audit.findings.push(LinkFinding {
                    node: node.id.clone(),
                    component: format!("GPU{} NVLink {}", g.id, l.id),
                    detail: format!("Down (NVSwitch {}, {} replay / {} CRC errors)", l.switch_id, l.tx_errors, l.rx_errors),
                });
            }
        }
        for (hca, port) in node.ports() {
            if !port.is_degraded() {
                audit.active_ib_ports += 1;
                continue;
            }
            audit.degraded_ib_ports += 1;
            audit.findings.push(LinkFinding {
                node: node.id.clone(),
                component: format!("{} port {}", hca.id, port.port),
                detail: format!(
                    "{} (symbol errors {}, rcv errors {}, link downed {})",
                    port.state, port.counters.symbol_errors, port.counters.port_rcv_errors, port.counters.link_downed
                ),
            });
        }
        audit
    }

    fn status(&self) -> &'static str {
        if self.findings.is_empty() { "OK" } else { "DEGRADED" }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditReport {
    pub nodes: Vec<NodeAudit>,
    pub active_nvlinks: usize,
    pub down_nvlinks: usize,
    pub active_ib_ports: usize,
    pub degraded_ib_ports: usize,
}

impl AuditReport {
    pub fn of<'a>(nodes: impl IntoIterator<Item = &'a DgxNode>) -> Self {
        let mut report = AuditReport::default();
        for n in nodes {
            let audit = NodeAudit::of(n);
            report.active_nvlinks += audit.active_nvlinks;
            report.down_nvlinks += audit.down_nvlinks;
            report.active_ib_ports += audit.active_ib_ports;
            report.degraded_ib_ports += audit.degraded_ib_ports;
            report.nodes.push(audit);
        }
        report
    }

    pub fn findings(&self) -> impl Iterator<Item = &LinkFinding> {
        self.nodes.iter().flat_map(|n| n.findings.iter())
    }
}

#[derive(Debug, Default)]
pub struct LinkAudit;

impl Simulator for LinkAudit {
    type Verb = ();

    fn name(&self) -> &'static str {
        "nvlink-audit"
    }

    fn execute(&mut self, _: (), cmd: &ParsedCommand, _ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        if cmd.has_any(&["h", "help"]) {
            return Ok(CommandOutput::ok("usage: nvlink-audit [--node <node>] [--verbose] [--json]\n"));
        }
        let report = match cmd.flag_value(&["node", "n"]) {
            Some(id) => {
                let node = cluster
                    .node(id)
                    .ok_or_else(|| SimError::NotFound(format!("nvlink-audit: unknown node '{}'", id)))?;
                AuditReport::of([node])
            }
            None => AuditReport::of(&cluster.nodes),
        };
        let exit_code = if report.findings().next().is_some() { 1 } else { 0 };

        if cmd.has_flag("json") {
            let mut json = serde_json::to_string_pretty(&report)?;
            json.push('\n');
            return Ok(CommandOutput::fail(json, exit_code));
        }

        let rows: Vec<Vec<String>> = report
            .nodes
            .iter()
            .map(|n| {
                vec![
                    n.node.clone(),
                    format!("{}/{}", n.active_nvlinks, n.active_nvlinks + n.down_nvlinks),
                    n.down_nvlinks.to_string(),
                    format!("{}/{}", n.active_ib_ports, n.active_ib_ports + n.degraded_ib_ports),
                    n.degraded_ib_ports.to_string(),
                    n.status().to_string(),
                ]
            })
            .collect();
        let mut out = render_table(&["NODE", "NVLINK", "DOWN", "IB PORTS", "DEGRADED", "STATUS"], &rows, 3);
        out.push_str(&format!(
            "\nNVLinks: {} active, {} down | IB ports: {} active, {} degraded\n",
            report.active_nvlinks, report.down_nvlinks, report.active_ib_ports, report.degraded_ib_ports
        ));
        if cmd.has_any(&["v", "verbose"]) {
            let findings: Vec<&LinkFinding> = report.findings().collect();
            if !findings.is_empty() {
                out.push_str("\nFindings:\n");
                for f in findings {
                    out.push_str(&format!("  {:<8} {:<20} {}\n", f.node, f.component, f.detail));
                }
            }
        }
        Ok(CommandOutput::fail(out, exit_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, inject_port_fault, FaultKind, PortFaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(store: &ClusterStore, line: &str) -> CommandOutput {
        let ctx = CommandContext::new("dgx-00");
        LinkAudit.execute((), &parse(line).unwrap(), &ctx, store.cluster()).unwrap()
    }

    #[test]
    fn clean_cluster_passes() {
        let store = ClusterStore::superpod("t");
        let out = run(&store, "nvlink-audit");
        assert!(out.success());
        assert!(out.output.contains("NVLinks: 1152 active, 0 down | IB ports: 64 active, 0 degraded"));
    }

    #[test]
    fn totals_match_cluster_summary() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-02", 4, FaultKind::NvLink).unwrap();
        inject_fault(&mut store, "dgx-07", 1, FaultKind::NvLink).unwrap();
        inject_port_fault(&mut store, "dgx-05", "mlx5_3", 1, PortFaultKind::SymbolErrors).unwrap();
        let report = AuditReport::of(&store.cluster().nodes);
        let summary = store.summary();
        assert_eq!(report.active_nvlinks, summary.active_nvlinks);
        assert_eq!(report.down_nvlinks, summary.down_nvlinks);
        assert_eq!(report.active_ib_ports, summary.active_ib_ports);
        assert_eq!(report.degraded_ib_ports, summary.degraded_ib_ports);
        assert_eq!(report.findings().count(), 3);
    }

    #[test]
    fn verbose_and_json_list_findings() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 2, FaultKind::NvLink).unwrap();
        let out = run(&store, "nvlink-audit --node dgx-00 --verbose");
        assert_eq!(out.exit_code, 1);
        assert!(out.output.contains("GPU2 NVLink 0"));
        assert_eq!(out.output.lines().filter(|l| l.starts_with("dgx-")).count(), 1);
        let json: serde_json::Value = serde_json::from_str(&run(&store, "nvlink-audit --json").output).unwrap();
        assert_eq!(json["down_nvlinks"], 1);
        assert_eq!(json["nodes"].as_array().unwrap().len(), 8);
    }
}
