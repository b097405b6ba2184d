/// `simctl`: the admin surface over the store's mutation actions.
///
/// This is how an instructor (or a lab script) breaks and repairs the
/// cluster from inside the shell. Every verb maps onto one fault-engine or
/// store action; nothing here writes cluster fields directly.
use std::fs;

use tracing::info;

use crate::cluster::{ClusterSummary, SlurmState};
use crate::error::{Result, SimError};
use crate::fault::{
    clear_all_faults, clear_faults, clear_node_faults, clear_port_faults, inject_fault, inject_port_fault, inject_xid,
    FaultKind, PortFaultKind,
};
use crate::gpu::health_reasons;
use crate::parser::ParsedCommand;
use crate::simulators::CommandOutput;
use crate::store::ClusterStore;
use crate::xid;

const USAGE: &str = "usage: simctl <command>
  fault <node> <gpu> <xid|ecc|thermal|nvlink|power|pcie> [xid-code]
  portfault <node> <hca> <port> <link_down|symbol_errors>
  clear <node> [gpu] | clear all
  clearport <node> <hca> <port>
  drain <node> [reason...] | down <node> [reason...] | resume <node>
  reset
  export [file] | import <file>
  summary | events | xids";

fn usage() -> SimError {
    SimError::Usage(USAGE.to_string())
}

fn gpu_id(text: &str) -> Result<u32> {
    text.parse().map_err(|_| SimError::Usage(format!("simctl: invalid GPU index '{}'", text)))
}

/// Cluster-wide aggregate block shared by `simctl summary` and the shell banner.
pub fn render_summary(name: &str, s: &ClusterSummary) -> String {
    let mut out = format!("Cluster {}: {} nodes, {} GPUs\n", name, s.total_nodes, s.total_gpus);
    out.push_str(&format!(
        "  GPUs      {} healthy, {} warning, {} critical\n",
        s.healthy_gpus, s.warning_gpus, s.critical_gpus
    ));
    out.push_str(&format!("  NVLinks   {} active, {} down\n", s.active_nvlinks, s.down_nvlinks));
    out.push_str(&format!("  IB ports  {} active, {} degraded\n", s.active_ib_ports, s.degraded_ib_ports));
    out.push_str(&format!(
        "  Load      {:.1}% avg util, {:.1} C avg temp, {:.0} W total\n",
        s.avg_utilization_pct, s.avg_temperature_c, s.total_power_w
    ));
    let states: Vec<String> = s.nodes_by_slurm_state.iter().map(|(k, v)| format!("{} {}", v, k)).collect();
    out.push_str(&format!("  Slurm     {}\n", states.join(", ")));
    out
}

/// Run one `simctl` command against the store.
pub fn execute(store: &mut ClusterStore, cmd: &ParsedCommand) -> Result<CommandOutput> {
    let ops = cmd.operands();
    match ops.as_slice() {
        ["fault", node, gpu, kind, rest @ ..] => {
            let gpu = gpu_id(gpu)?;
            let kind: FaultKind = kind.parse()?;
            let after = match (kind, rest) {
                (FaultKind::Xid, [code]) => {
                    let code: u32 = code
                        .parse()
                        .map_err(|_| SimError::Usage(format!("simctl: invalid XID code '{}'", code)))?;
                    inject_xid(store, node, gpu, code)?
                }
                (_, []) => inject_fault(store, node, gpu, kind)?,
                _ => return Err(usage()),
            };
            let reasons: Vec<String> = health_reasons(&after).iter().map(|r| r.to_string()).collect();
            Ok(CommandOutput::ok(format!(
                "{} GPU {}: {} fault injected, health {} ({})\n",
                node,
                gpu,
                kind,
                after.health_status,
                reasons.join("; ")
            )))
        }
        ["portfault", node, hca, port, kind] => {
            let port: u32 = port.parse().map_err(|_| SimError::Usage(format!("simctl: invalid port '{}'", port)))?;
            let kind: PortFaultKind = kind.parse()?;
            inject_port_fault(store, node, hca, port, kind)?;
            Ok(CommandOutput::ok(format!("{} {} port {}: {:?} injected\n", node, hca, port, kind)))
        }
        ["clear", "all"] => {
            clear_all_faults(store)?;
            Ok(CommandOutput::ok("all faults cleared\n"))
        }
        ["clear", node] => {
            clear_node_faults(store, node)?;
            Ok(CommandOutput::ok(format!("{}: all faults cleared\n", node)))
        }
        ["clear", node, gpu] => {
            let gpu = gpu_id(gpu)?;
            clear_faults(store, node, gpu)?;
            Ok(CommandOutput::ok(format!("{} GPU {}: faults cleared, health OK\n", node, gpu)))
        }
        ["clearport", node, hca, port] => {
            let port: u32 = port.parse().map_err(|_| SimError::Usage(format!("simctl: invalid port '{}'", port)))?;
            clear_port_faults(store, node, hca, port)?;
            Ok(CommandOutput::ok(format!("{} {} port {}: restored\n", node, hca, port)))
        }
        [verb @ ("drain" | "down"), node, reason @ ..] => {
            let state = if *verb == "drain" { SlurmState::Drain } else { SlurmState::Down };
            let reason = if reason.is_empty() { "simctl".to_string() } else { reason.join(" ") };
            store.set_slurm_state(node, state, Some(reason))?;
            Ok(CommandOutput::ok(format!("{}: slurm state {}\n", node, state)))
        }
        ["resume", node] => {
            store.set_slurm_state(node, SlurmState::Idle, None)?;
            Ok(CommandOutput::ok(format!("{}: slurm state idle\n", node)))
        }
        ["reset"] => {
            store.reset_cluster();
            Ok(CommandOutput::ok("cluster reset to baseline\n"))
        }
        ["export"] => {
            let mut json = store.export_cluster()?;
            json.push('\n');
            Ok(CommandOutput::ok(json))
        }
        ["export", path] => {
            let json = store.export_cluster()?;
            fs::write(path, &json)?;
            info!(path = *path, bytes = json.len(), "cluster exported");
            Ok(CommandOutput::ok(format!("exported {} bytes to {}\n", json.len(), path)))
        }
        ["import", path] => {
            let json = fs::read_to_string(path)?;
            store
                .import_cluster(&json)
                .map_err(|e| SimError::Import(format!("{}: {}", path, e)))?;
            let s = store.summary();
            Ok(CommandOutput::ok(format!(
                "imported {} nodes, {} GPUs from {}\n",
                s.total_nodes, s.total_gpus, path
            )))
        }
        ["summary"] => Ok(CommandOutput::ok(render_summary(&store.cluster().name, &store.summary()))),
        ["events"] => {
            let out: String = store
                .events()
                .iter()
                .map(|e| format!("{}  {:<8} {}\n", e.timestamp.format("%Y-%m-%d %H:%M:%S"), e.node, e.message))
                .collect();
            Ok(CommandOutput::ok(out))
        }
        ["xids"] => {
            let out: String = xid::all()
                .iter()
                .map(|x| format!("{:>4}  {:<8} {}\n", x.code, x.category, x.description))
                .collect();
            Ok(CommandOutput::ok(out))
        }
        _ => Err(usage()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HealthStatus;
    use crate::parser::parse;

    fn run(store: &mut ClusterStore, line: &str) -> Result<CommandOutput> {
        execute(store, &parse(line).unwrap())
    }

    #[test]
    fn fault_and_clear_round_trip() {
        let mut store = ClusterStore::superpod("t");
        let out = run(&mut store, "simctl fault dgx-00 0 xid").unwrap();
        assert!(out.output.contains("health Critical"));
        assert_eq!(store.summary().critical_gpus, 1);
        run(&mut store, "simctl clear dgx-00 0").unwrap();
        assert_eq!(store.summary().healthy_gpus, 64);
    }

    #[test]
    fn specific_xid_code() {
        let mut store = ClusterStore::superpod("t");
        run(&mut store, "simctl fault dgx-01 2 xid 48").unwrap();
        let gpu = store.cluster().gpu("dgx-01", 2).unwrap();
        assert_eq!(gpu.latest_xid().map(|x| x.code), Some(48));
        assert_eq!(gpu.health(), HealthStatus::Critical);
        assert!(run(&mut store, "simctl fault dgx-01 2 ecc 48").is_err());
    }

    #[test]
    fn drain_keeps_reason() {
        let mut store = ClusterStore::superpod("t");
        run(&mut store, "simctl drain dgx-04 bad GPU").unwrap();
        let node = store.cluster().node("dgx-04").unwrap();
        assert_eq!(node.slurm_state, SlurmState::Drain);
        assert_eq!(node.slurm_reason.as_deref(), Some("bad GPU"));
        run(&mut store, "simctl resume dgx-04").unwrap();
        assert_eq!(store.cluster().node("dgx-04").unwrap().slurm_state, SlurmState::Idle);
    }

    #[test]
    fn unknown_targets_and_verbs() {
        let mut store = ClusterStore::superpod("t");
        assert!(matches!(run(&mut store, "simctl fault dgx-42 0 xid"), Err(SimError::NotFound(_))));
        assert!(matches!(run(&mut store, "simctl fault dgx-00 0 meltdown"), Err(SimError::Usage(_))));
        assert!(matches!(run(&mut store, "simctl teleport"), Err(SimError::Usage(_))));
    }

    #[test]
    fn summary_lists_counts() {
        let mut store = ClusterStore::superpod("t");
        run(&mut store, "simctl portfault dgx-03 mlx5_1 1 link_down").unwrap();
        let out = run(&mut store, "simctl summary").unwrap().output;
        assert!(out.contains("64 healthy, 0 warning, 0 critical"));
        assert!(out.contains("63 active, 1 degraded"));
        assert!(out.contains("8 idle"));
    }
}
