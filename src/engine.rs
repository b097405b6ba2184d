/// Command engine: parse, route, run, render.
///
/// The engine owns one instance of every simulator and a handle to the shared
/// store. A simulator runs under a read guard held for the whole call, so the
/// text it renders comes from one consistent snapshot. State changes it asks
/// for come back as `StateAction`s and are applied afterwards under the write
/// guard. Nothing that happens inside a command can take the process down:
/// errors and panics both end up as text plus an exit status.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::cluster::{Cluster, SlurmState};
use crate::context::CommandContext;
use crate::control;
use crate::error::{Result, SimError};
use crate::parser::{parse, ParsedCommand};
use crate::router::{self, Builtin, Route, Tool};
use crate::simulators::basic::Basic;
use crate::simulators::benchmarks::Benchmarks;
use crate::simulators::bug_report::BugReport;
use crate::simulators::cluster_manager::ClusterManager;
use crate::simulators::containers::Containers;
use crate::simulators::dcgmi::Dcgmi;
use crate::simulators::fabric_manager::FabricManager;
use crate::simulators::infiniband::InfiniBand;
use crate::simulators::ipmitool::Ipmitool;
use crate::simulators::link_audit::LinkAudit;
use crate::simulators::mellanox::Mellanox;
use crate::simulators::nvidia_smi::NvidiaSmi;
use crate::simulators::nvsm::Nvsm;
use crate::simulators::pci_logs::PciLogs;
use crate::simulators::slurm::{Slurm, SlurmVerb};
use crate::simulators::storage::Storage;
use crate::simulators::{CommandOutput, Simulator, StateAction};
use crate::store::SharedStore;

/// Exit status for a simulator that panicked (EX_SOFTWARE).
const INTERNAL_ERROR_EXIT: i32 = 70;
/// Exit status ssh uses for connection failures.
const SSH_FAILURE_EXIT: i32 = 255;

/// One instance of every simulator family.
#[derive(Debug, Default)]
pub struct Simulators {
    nvidia_smi: NvidiaSmi,
    dcgmi: Dcgmi,
    fabric_manager: FabricManager,
    slurm: Slurm,
    cluster_manager: ClusterManager,
    ipmitool: Ipmitool,
    infiniband: InfiniBand,
    mellanox: Mellanox,
    basic: Basic,
    pci_logs: PciLogs,
    containers: Containers,
    storage: Storage,
    benchmarks: Benchmarks,
    nvsm: Nvsm,
    link_audit: LinkAudit,
    bug_report: BugReport,
}

impl Simulators {
    pub fn dispatch(
        &mut self,
        tool: Tool,
        cmd: &ParsedCommand,
        ctx: &CommandContext,
        cluster: &Cluster,
    ) -> Result<CommandOutput> {
        match tool {
            Tool::NvidiaSmi         => self.nvidia_smi.execute((), cmd, ctx, cluster),
            Tool::Dcgmi             => self.dcgmi.execute((), cmd, ctx, cluster),
            Tool::FabricManager     => self.fabric_manager.execute((), cmd, ctx, cluster),
            Tool::Slurm(v)          => self.slurm.execute(v, cmd, ctx, cluster),
            Tool::ClusterManager(v) => self.cluster_manager.execute(v, cmd, ctx, cluster),
            Tool::Ipmitool          => self.ipmitool.execute((), cmd, ctx, cluster),
            Tool::InfiniBand(v)     => self.infiniband.execute(v, cmd, ctx, cluster),
            Tool::Mellanox(v)       => self.mellanox.execute(v, cmd, ctx, cluster),
            Tool::Basic(v)          => self.basic.execute(v, cmd, ctx, cluster),
            Tool::PciLogs(v)        => self.pci_logs.execute(v, cmd, ctx, cluster),
            Tool::Containers(v)     => self.containers.execute(v, cmd, ctx, cluster),
            Tool::Storage(v)        => self.storage.execute(v, cmd, ctx, cluster),
            Tool::Benchmarks(v)     => self.benchmarks.execute(v, cmd, ctx, cluster),
            Tool::Nvsm              => self.nvsm.execute((), cmd, ctx, cluster),
            Tool::LinkAudit         => self.link_audit.execute((), cmd, ctx, cluster),
            Tool::BugReport         => self.bug_report.execute((), cmd, ctx, cluster),
        }
    }

    pub fn slurm(&self) -> &Slurm {
        &self.slurm
    }
}

pub struct Engine {
    store: SharedStore,
    sims: Simulators,
}

impl Engine {
    pub fn new(store: SharedStore) -> Self {
        Engine { store, sims: Simulators::default() }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn simulators(&self) -> &Simulators {
        &self.sims
    }

    /// Run one line typed at the prompt.
    pub fn execute(&mut self, raw: &str, ctx: &mut CommandContext) -> CommandOutput {
        let line = raw.trim();
        if line.is_empty() {
            return CommandOutput::ok("");
        }
        ctx.history.push(line.to_string());
        let expanded = ctx.expand(line);
        let out = self.run_line(&expanded, ctx);
        debug!(command = line, node = %ctx.current_node, exit_code = out.exit_code, "command finished");
        out
    }

    fn run_line(&mut self, line: &str, ctx: &mut CommandContext) -> CommandOutput {
        let cmd = match parse(line) {
            Ok(cmd) => cmd,
            Err(e) => return render_error(SimError::Parse(e)),
        };
        let route = match router::route(&cmd.base) {
            Ok(route) => route,
            Err(e) => return render_error(e),
        };
        match route {
            Route::Builtin(b) => self.builtin(b, &cmd, ctx),
            Route::Control => {
                let result = {
                    let mut store = self.store.write();
                    control::execute(&mut store, &cmd)
                };
                result.unwrap_or_else(render_error)
            }
            Route::Tool(Tool::Slurm(SlurmVerb::Srun)) => self.srun(&cmd, ctx),
            Route::Tool(tool) => self.run_tool(tool, &cmd, ctx),
        }
    }

    fn run_tool(&mut self, tool: Tool, cmd: &ParsedCommand, ctx: &CommandContext) -> CommandOutput {
        let store = Arc::clone(&self.store);
        let result = {
            let guard = store.read();
            catch_unwind(AssertUnwindSafe(|| self.sims.dispatch(tool, cmd, ctx, guard.cluster())))
        };
        let mut out = match result {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => render_error(e),
            Err(_) => {
                error!(command = %cmd.raw, "simulator panicked");
                return CommandOutput::fail(format!("{}: internal error\n", cmd.base), INTERNAL_ERROR_EXIT);
            }
        };
        let actions = std::mem::take(&mut out.actions);
        self.apply(actions);
        out
    }

    /// Apply simulator-requested changes through the store's named actions.
    fn apply(&self, actions: Vec<StateAction>) {
        if actions.is_empty() {
            return;
        }
        let mut store = self.store.write();
        for action in actions {
            match action {
                StateAction::SetSlurmState { node, state, reason } => {
                    if let Err(e) = store.set_slurm_state(&node, state, reason) {
                        warn!(node = %node, error = %e, "state action rejected");
                    }
                }
            }
        }
        if cfg!(debug_assertions) {
            if let Err(e) = store.check_invariants() {
                error!(error = %e, "cluster invariant broken after command");
            }
        }
    }

    /// `srun`: allocate, run the step on every node, then finish the step.
    fn srun(&mut self, cmd: &ParsedCommand, ctx: &CommandContext) -> CommandOutput {
        let plan = {
            let guard = self.store.read();
            self.sims.slurm.srun_plan(cmd, ctx, guard.cluster())
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => return render_error(e),
        };
        info!(job = plan.job_id, nodes = ?plan.nodes, command = %plan.command, "srun step");

        let mut output = String::new();
        let mut exit_code = 0;
        for (rank, node) in plan.nodes.iter().enumerate() {
            let mut step_ctx = ctx.clone();
            step_ctx.current_node = node.clone();
            step_ctx.env.insert("HOSTNAME".to_string(), node.clone());
            step_ctx.env.insert("SLURM_JOB_ID".to_string(), plan.job_id.to_string());
            step_ctx.env.insert("SLURM_PROCID".to_string(), rank.to_string());
            let step = self.run_line(&plan.command, &mut step_ctx);
            exit_code = exit_code.max(step.exit_code);
            for line in step.output.lines() {
                if plan.label {
                    output.push_str(&format!("{}: {}\n", rank, line));
                } else {
                    output.push_str(line);
                    output.push('\n');
                }
            }
        }
        self.sims.slurm.finish_step(plan.job_id, ctx.now());
        if exit_code != 0 {
            output.push_str(&format!(
                "srun: error: step {}.0 exited with exit code {}\n",
                plan.job_id, exit_code
            ));
        }
        CommandOutput::fail(output, exit_code)
    }

    // -----------------------------------------------------------------------
    // Session builtins
    // -----------------------------------------------------------------------

    fn builtin(&mut self, b: Builtin, cmd: &ParsedCommand, ctx: &mut CommandContext) -> CommandOutput {
        match b {
            Builtin::Ssh => self.ssh(cmd, ctx),
            Builtin::Exit => match ctx.leave() {
                Some(left) => CommandOutput::ok(format!("logout\nConnection to {} closed.\n", left)),
                None => {
                    ctx.exited = true;
                    CommandOutput::ok("logout\n")
                }
            },
            Builtin::Cd => cd(cmd, ctx),
            Builtin::Export => {
                let ops = cmd.operands();
                if ops.is_empty() {
                    let out: String =
                        ctx.env.iter().map(|(k, v)| format!("declare -x {}=\"{}\"\n", k, v)).collect();
                    return CommandOutput::ok(out);
                }
                for op in ops {
                    if let Some((k, v)) = op.split_once('=') {
                        ctx.env.insert(k.to_string(), v.to_string());
                    }
                }
                CommandOutput::ok("")
            }
            Builtin::History => {
                let out: String =
                    ctx.history.iter().enumerate().map(|(i, l)| format!("{:>5}  {}\n", i + 1, l)).collect();
                CommandOutput::ok(out)
            }
            Builtin::Help => CommandOutput::ok(router::help_text()),
            Builtin::Clear => CommandOutput::ok("\x1b[2J\x1b[H"),
        }
    }

    fn ssh(&mut self, cmd: &ParsedCommand, ctx: &mut CommandContext) -> CommandOutput {
        let Some(target) = cmd.subcommand.as_deref() else {
            return CommandOutput::fail("usage: ssh [user@]hostname [command]\n", SSH_FAILURE_EXIT);
        };
        let host = target.rsplit('@').next().unwrap_or(target);

        let from = ctx.current_node.clone();
        let now = ctx.now();
        let resolved = {
            let store = self.store.read();
            store.cluster().node_by_address(host).map(|n| {
                let banner = login_banner(store.cluster(), &n.id, &from, now);
                (n.id.clone(), n.slurm_state == SlurmState::Down, banner)
            })
        };
        let Some((node, down, banner)) = resolved else {
            return CommandOutput::fail(
                format!("ssh: Could not resolve hostname {}: Name or service not known\n", host),
                SSH_FAILURE_EXIT,
            );
        };
        if down {
            return CommandOutput::fail(
                format!("ssh: connect to host {} port 22: No route to host\n", host),
                SSH_FAILURE_EXIT,
            );
        }

        if !cmd.positionals.is_empty() {
            let mut remote = ctx.clone();
            remote.current_node = node.clone();
            remote.env.insert("HOSTNAME".to_string(), node);
            let line = shell_join(&cmd.positionals);
            return self.run_line(&line, &mut remote);
        }
        info!(from = %ctx.current_node, to = %node, "ssh");
        ctx.enter(&node);
        CommandOutput::ok(banner)
    }
}

/// MOTD printed on interactive login.
fn login_banner(cluster: &Cluster, node_id: &str, from: &str, now: DateTime<Utc>) -> String {
    let hw = &cluster.hardware;
    let health = cluster.node(node_id).map(|n| n.health().to_string()).unwrap_or_default();
    format!(
        "Welcome to {} (GNU/Linux {} x86_64)\n\n  System:  {}\n  GPUs:    {} x {}\n  Health:  {}\n\nLast login: {} from {}\n",
        hw.os_name,
        hw.kernel,
        hw.system_model,
        hw.gpus_per_node,
        hw.gpu_name,
        health,
        now.format("%a %b %e %H:%M:%S %Y"),
        from
    )
}

fn shell_join(words: &[String]) -> String {
    words
        .iter()
        .map(|w| if w.contains(char::is_whitespace) { format!("'{}'", w) } else { w.clone() })
        .collect::<Vec<_>>()
        .join(" ")
}

fn cd(cmd: &ParsedCommand, ctx: &mut CommandContext) -> CommandOutput {
    let home = ctx.env.get("HOME").cloned().unwrap_or_else(|| "/root".to_string());
    let target = match cmd.subcommand.as_deref() {
        None | Some("~") => home,
        Some("-") => ctx.env.get("OLDPWD").cloned().unwrap_or_else(|| ctx.cwd.clone()),
        Some(p) if p.starts_with("~/") => format!("{}/{}", home, &p[2..]),
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => format!("{}/{}", ctx.cwd, p),
    };
    let mut parts: Vec<&str> = Vec::new();
    for seg in target.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let cwd = format!("/{}", parts.join("/"));
    let old = std::mem::replace(&mut ctx.cwd, cwd);
    ctx.env.insert("OLDPWD".to_string(), old);
    ctx.env.insert("PWD".to_string(), ctx.cwd.clone());
    CommandOutput::ok("")
}

/// Turn an error that reached the engine into terminal text.
fn render_error(e: SimError) -> CommandOutput {
    let code = e.exit_code();
    let mut text = match &e {
        SimError::Parse(_) => format!("bash: {}", e),
        SimError::InvariantViolation(msg) => {
            error!(violation = %msg, "invariant violation");
            if cfg!(debug_assertions) {
                panic!("invariant violation: {}", msg);
            }
            e.to_string()
        }
        _ => e.to_string(),
    };
    if !text.ends_with('\n') {
        text.push('\n');
    }
    CommandOutput::fail(text, code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, FaultKind};
    use crate::store::ClusterStore;
    use chrono::TimeZone;

    fn engine() -> (Engine, CommandContext) {
        let store = ClusterStore::superpod("t").into_shared();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        (Engine::new(store), CommandContext::with_fixed_clock("dgx-00", at))
    }

    #[test]
    fn unknown_and_malformed_lines() {
        let (mut e, mut ctx) = engine();
        let out = e.execute("nvidia-smu", &mut ctx);
        assert_eq!(out.output, "nvidia-smu: command not found\n");
        assert_eq!(out.exit_code, 127);
        let out = e.execute("echo 'oops", &mut ctx);
        assert!(out.output.starts_with("bash: syntax error"));
        assert_eq!(out.exit_code, 2);
        assert_eq!(e.execute("   ", &mut ctx), CommandOutput::ok(""));
        assert_eq!(ctx.history.len(), 2);
    }

    #[test]
    fn ssh_and_exit_walk_hops() {
        let (mut e, mut ctx) = engine();
        let out = e.execute("ssh dgx-03", &mut ctx);
        assert!(out.success());
        assert!(out.output.contains("Welcome to Ubuntu"));
        assert_eq!(e.execute("hostname", &mut ctx).output, "dgx-03\n");
        let out = e.execute("exit", &mut ctx);
        assert_eq!(out.output, "logout\nConnection to dgx-03 closed.\n");
        assert_eq!(ctx.current_node, "dgx-00");
        assert!(!ctx.exited);
        e.execute("exit", &mut ctx);
        assert!(ctx.exited);
    }

    #[test]
    fn ssh_remote_command_leaves_session_alone() {
        let (mut e, mut ctx) = engine();
        let out = e.execute("ssh root@10.10.0.15 hostname", &mut ctx);
        assert_eq!(out.output, "dgx-05\n");
        assert_eq!(ctx.current_node, "dgx-00");
        let out = e.execute("ssh dgx-09", &mut ctx);
        assert_eq!(out.exit_code, 255);
    }

    #[test]
    fn ssh_to_down_node_fails() {
        let (mut e, mut ctx) = engine();
        e.execute("simctl down dgx-02 maintenance", &mut ctx);
        let out = e.execute("ssh dgx-02", &mut ctx);
        assert_eq!(out.exit_code, 255);
        assert!(out.output.contains("No route to host"));
        assert_eq!(ctx.current_node, "dgx-00");
    }

    #[test]
    fn scontrol_update_goes_through_the_store() {
        let (mut e, mut ctx) = engine();
        let out = e.execute("scontrol update nodename=dgx-06 state=drain reason=\"bad gpu\"", &mut ctx);
        assert!(out.success(), "{}", out.output);
        let store = e.store().read();
        let node = store.cluster().node("dgx-06").unwrap();
        assert_eq!(node.slurm_state, SlurmState::Drain);
        assert_eq!(node.slurm_reason.as_deref(), Some("bad gpu"));
    }

    #[test]
    fn srun_runs_on_each_allocated_node() {
        let (mut e, mut ctx) = engine();
        let out = e.execute("srun -N 2 -l hostname", &mut ctx);
        assert!(out.success(), "{}", out.output);
        assert_eq!(out.output, "0: dgx-00\n1: dgx-01\n");
        let sacct = e.execute("sacct", &mut ctx).output;
        assert!(sacct.contains("COMPLETED"));
        let out = e.execute("srun srun hostname", &mut ctx);
        assert_ne!(out.exit_code, 0);
    }

    #[test]
    fn srun_reports_worst_exit_code() {
        let (mut e, mut ctx) = engine();
        {
            let mut store = e.store().write();
            inject_fault(&mut store, "dgx-01", 3, FaultKind::Xid).unwrap();
        }
        let out = e.execute("srun -N 2 gpu_burn 10", &mut ctx);
        assert_eq!(out.exit_code, 1);
        assert!(out.output.contains("srun: error: step"));
    }

    #[test]
    fn cd_export_and_history() {
        let (mut e, mut ctx) = engine();
        e.execute("cd /var/log", &mut ctx);
        assert_eq!(e.execute("pwd", &mut ctx).output, "/var/log\n");
        e.execute("cd ../../etc", &mut ctx);
        assert_eq!(ctx.cwd, "/etc");
        e.execute("cd", &mut ctx);
        assert_eq!(ctx.cwd, "/root");
        e.execute("export LAB=gpu-triage", &mut ctx);
        assert_eq!(e.execute("echo $LAB", &mut ctx).output, "gpu-triage\n");
        let history = e.execute("history", &mut ctx).output;
        assert!(history.contains("    6  echo $LAB"));
    }
}
