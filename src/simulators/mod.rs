/// Tool simulators.
///
/// Each simulator is a projection of the shared cluster state through one
/// tool's vocabulary. They receive `&Cluster`, so they cannot mutate state;
/// the only influence a simulator has on the cluster is a declarative
/// [`StateAction`] that the engine applies through the store afterwards
/// (`scontrol update`). Simulators may keep private bookkeeping of their own
/// (the Slurm job queue).
use crate::cluster::{Cluster, DgxNode, SlurmState};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::parser::ParsedCommand;

pub mod basic;
pub mod benchmarks;
pub mod bug_report;
pub mod cluster_manager;
pub mod containers;
pub mod dcgmi;
pub mod fabric_manager;
pub mod infiniband;
pub mod ipmitool;
pub mod link_audit;
pub mod mellanox;
pub mod nvidia_smi;
pub mod nvsm;
pub mod pci_logs;
pub mod slurm;
pub mod storage;

/// Text plus exit status, and any state change the engine should apply.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: i32,
    pub actions: Vec<StateAction>,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        CommandOutput { output: output.into(), exit_code: 0, actions: Vec::new() }
    }

    pub fn fail(output: impl Into<String>, exit_code: i32) -> Self {
        CommandOutput { output: output.into(), exit_code, actions: Vec::new() }
    }

    pub fn with_action(mut self, action: StateAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A state change requested by a simulator, applied by the engine through a
/// named store action.
#[derive(Debug, Clone, PartialEq)]
pub enum StateAction {
    SetSlurmState { node: String, state: SlurmState, reason: Option<String> },
}

/// One tool family. `Verb` is the router's typed entry point into it; single
/// command tools use `()`.
pub trait Simulator {
    type Verb: Copy;

    fn name(&self) -> &'static str;

    fn execute(
        &mut self,
        verb: Self::Verb,
        cmd: &ParsedCommand,
        ctx: &CommandContext,
        cluster: &Cluster,
    ) -> Result<CommandOutput>;
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// The node the session is logged into.
pub fn current_node<'a>(ctx: &CommandContext, cluster: &'a Cluster) -> Result<&'a DgxNode> {
    cluster.node(&ctx.current_node).ok_or_else(|| {
        SimError::NotFound(format!("{}: host not reachable", ctx.current_node))
    })
}

/// Numeric suffix of a node id, which seeds per-node identifiers (MACs, pids,
/// serials).
pub fn node_index(node: &DgxNode) -> Result<usize> {
    node.index()
        .ok_or_else(|| SimError::InvariantViolation(format!("node id {} has no numeric suffix", node.id)))
}

/// Parse a GPU selector such as `0`, `0,3` or `0-3`, validated against `node`.
/// Returns the offending token on failure.
pub fn parse_gpu_list(spec: &str, node: &DgxNode) -> std::result::Result<Vec<u32>, String> {
    let mut out = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let ids: Vec<u32> = match part.split_once('-') {
            Some((a, b)) => {
                let a: u32 = a.parse().map_err(|_| part.to_string())?;
                let b: u32 = b.parse().map_err(|_| part.to_string())?;
                if a > b {
                    return Err(part.to_string());
                }
                let highest = node.gpus.iter().map(|g| g.id).max().unwrap_or(0);
                if b > highest {
                    return Err(b.to_string());
                }
                (a..=b).collect()
            }
            None => vec![part.parse().map_err(|_| part.to_string())?],
        };
        for id in ids {
            if node.gpu(id).is_none() {
                return Err(id.to_string());
            }
            if !out.contains(&id) {
                out.push(id);
            }
        }
    }
    if out.is_empty() {
        return Err(spec.to_string());
    }
    Ok(out)
}

/// Left-aligned column table with a configurable gap.
pub fn render_table(headers: &[&str], rows: &[Vec<String>], gap: usize) -> String {
    let cols = headers.len();
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(cols) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let pad = " ".repeat(gap);
    let line = |cells: Vec<&str>| -> String {
        let mut s = String::new();
        for (i, cell) in cells.iter().enumerate() {
            if i + 1 == cells.len() {
                s.push_str(cell);
            } else {
                s.push_str(&format!("{:<w$}", cell, w = widths[i]));
                s.push_str(&pad);
            }
        }
        s.trim_end().to_string()
    };
    let mut out = String::new();
    if !headers.is_empty() {
        out.push_str(&line(headers.to_vec()));
        out.push('\n');
    }
    for row in rows {
        out.push_str(&line(row.iter().map(|c| c.as_str()).collect()));
        out.push('\n');
    }
    out
}

/// Logical CPUs of each socket, physical cores first then their siblings.
pub fn numa_cpu_ranges(cluster: &Cluster) -> [String; 2] {
    let cores = cluster.hardware.cores_per_socket;
    let physical = cores * cluster.hardware.sockets;
    let range = |socket: u32| {
        let lo = socket * cores;
        format!("{}-{},{}-{}", lo, lo + cores - 1, physical + lo, physical + lo + cores - 1)
    };
    [range(0), range(1)]
}

/// Format seconds as `12 days,  4:17`.
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let mins = (secs % 3_600) / 60;
    match days {
        0 => format!("{:2}:{:02}", hours, mins),
        1 => format!("1 day, {:2}:{:02}", hours, mins),
        d => format!("{} days, {:2}:{:02}", d, hours, mins),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_list_forms() {
        let c = Cluster::superpod("t");
        let n = &c.nodes[0];
        assert_eq!(parse_gpu_list("0", n), Ok(vec![0]));
        assert_eq!(parse_gpu_list("0,3,3", n), Ok(vec![0, 3]));
        assert_eq!(parse_gpu_list("2-4", n), Ok(vec![2, 3, 4]));
        assert_eq!(parse_gpu_list("9", n), Err("9".into()));
        assert_eq!(parse_gpu_list("x", n), Err("x".into()));
        assert_eq!(parse_gpu_list("6-8", n), Err("8".into()));
        assert_eq!(parse_gpu_list("0-4294967295", n), Err("4294967295".into()));
    }

    #[test]
    fn table_aligns_columns() {
        let t = render_table(&["A", "LONGER"], &[vec!["wide-cell".into(), "x".into()]], 2);
        assert_eq!(t, "A          LONGER\nwide-cell  x\n");
    }

    #[test]
    fn uptime_format() {
        assert_eq!(format_uptime(3_660), " 1:01");
        assert_eq!(format_uptime(86_400 * 12 + 3_600 * 4 + 17 * 60), "12 days,  4:17");
    }
}
