/// Slurm scheduler family: `sinfo`, `squeue`, `scontrol`, `sbatch`,
/// `scancel`, `sacct` and `srun`, all served by one simulator instance.
///
/// Node admin state (idle/drain/down) lives in the cluster and only changes
/// through `scontrol update`, which this simulator turns into a
/// [`StateAction::SetSlurmState`]. GPU faults never touch it. The job queue
/// is private bookkeeping: an idle node with running jobs is shown as
/// `alloc` (all GPUs taken) or `mix`.
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::cluster::{Cluster, DgxNode, SlurmState};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::parser::ParsedCommand;

use super::{render_table, CommandOutput, Simulator, StateAction};

const PARTITION: &str = "batch";
const SLURM_VERSION: &str = "23.02.7";
const FIRST_JOB_ID: u32 = 1001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlurmVerb {
    Sinfo,
    Squeue,
    Scontrol,
    Sbatch,
    Scancel,
    Sacct,
    Srun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Cancelled,
    NodeFail,
}

impl JobState {
    fn code(&self) -> &'static str {
        match self {
            JobState::Pending   => "PD",
            JobState::Running   => "R",
            JobState::Completed => "CD",
            JobState::Cancelled => "CA",
            JobState::NodeFail  => "NF",
        }
    }

    fn is_active(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending   => f.pad("PENDING"),
            JobState::Running   => f.pad("RUNNING"),
            JobState::Completed => f.pad("COMPLETED"),
            JobState::Cancelled => f.pad("CANCELLED"),
            JobState::NodeFail  => f.pad("NODE_FAIL"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: u32,
    pub name: String,
    pub user: String,
    pub num_nodes: usize,
    pub gpus_per_node: u32,
    pub nodes: Vec<String>,
    pub state: JobState,
    pub submitted: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

/// An interactive `srun` step: the engine runs `command` on every node and
/// then calls [`Slurm::finish_step`].
#[derive(Debug, Clone, PartialEq)]
pub struct SrunPlan {
    pub job_id: u32,
    pub nodes: Vec<String>,
    pub command: String,
    pub label: bool,
}

#[derive(Debug)]
pub struct Slurm {
    jobs: Vec<Job>,
    next_id: u32,
}

impl Default for Slurm {
    fn default() -> Self {
        Slurm { jobs: Vec::new(), next_id: FIRST_JOB_ID }
    }
}

impl Simulator for Slurm {
    type Verb = SlurmVerb;

    fn name(&self) -> &'static str {
        "slurm"
    }

    fn execute(&mut self, verb: SlurmVerb, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        let now = ctx.now();
        self.schedule(cluster, now);
        match verb {
            SlurmVerb::Sinfo => self.sinfo(cmd, ctx, cluster),
            SlurmVerb::Squeue => self.squeue(cmd, now),
            SlurmVerb::Scontrol => self.scontrol(cmd, cluster, now),
            SlurmVerb::Sbatch => self.sbatch(cmd, ctx, cluster),
            SlurmVerb::Scancel => self.scancel(cmd, now),
            SlurmVerb::Sacct => Ok(self.sacct(cmd, cluster)),
            SlurmVerb::Srun => {
                let plan = self.srun_plan(cmd, ctx, cluster)?;
                self.finish_step(plan.job_id, now);
                Ok(CommandOutput::ok(format!(
                    "srun: job {} ran '{}' on {}\n",
                    plan.job_id,
                    plan.command,
                    compress_hostlist(&plan.nodes)
                )))
            }
        }
    }
}

impl Slurm {
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: u32) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    fn gpus_in_use(&self, node: &str) -> u32 {
        self.jobs
            .iter()
            .filter(|j| j.state == JobState::Running && j.nodes.iter().any(|n| n == node))
            .map(|j| j.gpus_per_node)
            .sum()
    }

    /// Pick `n` schedulable nodes with `k` free GPUs each.
    fn allocate(&self, cluster: &Cluster, n: usize, k: u32) -> Option<Vec<String>> {
        let picked: Vec<String> = cluster
            .nodes
            .iter()
            .filter(|node| !matches!(node.slurm_state, SlurmState::Drain | SlurmState::Down))
            .filter(|node| node.gpus.len() as u32 >= self.gpus_in_use(&node.id) + k)
            .take(n)
            .map(|node| node.id.clone())
            .collect();
        (picked.len() == n).then_some(picked)
    }

    /// Fail jobs on down nodes, then start pending jobs in submission order.
    fn schedule(&mut self, cluster: &Cluster, now: DateTime<Utc>) {
        for job in self.jobs.iter_mut().filter(|j| j.state == JobState::Running) {
            let lost = job.nodes.iter().any(|n| {
                cluster.node(n).is_none_or(|node| node.slurm_state == SlurmState::Down)
            });
            if lost {
                debug!(job = job.id, "job lost its node");
                job.state = JobState::NodeFail;
                job.ended = Some(now);
            }
        }
        for i in 0..self.jobs.len() {
            if self.jobs[i].state != JobState::Pending {
                continue;
            }
            let (n, k) = (self.jobs[i].num_nodes, self.jobs[i].gpus_per_node);
            if let Some(nodes) = self.allocate(cluster, n, k) {
                let job = &mut self.jobs[i];
                job.nodes = nodes;
                job.state = JobState::Running;
                job.started = Some(now);
                debug!(job = job.id, "job started");
            }
        }
    }

    fn submit(&mut self, cluster: &Cluster, name: String, user: &str, n: usize, k: u32, now: DateTime<Utc>) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        let nodes = self.allocate(cluster, n, k);
        let state = if nodes.is_some() { JobState::Running } else { JobState::Pending };
        self.jobs.push(Job {
            id,
            name,
            user: user.to_string(),
            num_nodes: n,
            gpus_per_node: k,
            nodes: nodes.unwrap_or_default(),
            state,
            submitted: now,
            started: (state == JobState::Running).then_some(now),
            ended: None,
        });
        id
    }

    /// Sinfo-style state of one node, accounting for running jobs.
    pub fn node_state(&self, node: &DgxNode) -> String {
        let used = self.gpus_in_use(&node.id);
        match node.slurm_state {
            SlurmState::Down => "down".to_string(),
            SlurmState::Drain if used > 0 => "drng".to_string(),
            SlurmState::Drain => "drain".to_string(),
            _ if used == 0 => node.slurm_state.to_string(),
            _ if used >= node.gpus.len() as u32 => "alloc".to_string(),
            _ => "mix".to_string(),
        }
    }

    fn node_state_long(&self, node: &DgxNode) -> String {
        let used = self.gpus_in_use(&node.id);
        let base = if used == 0 {
            "IDLE"
        } else if used >= node.gpus.len() as u32 {
            "ALLOCATED"
        } else {
            "MIXED"
        };
        match node.slurm_state {
            SlurmState::Down => "DOWN".to_string(),
            SlurmState::Drain => format!("{}+DRAIN", base),
            SlurmState::Alloc if used == 0 => "ALLOCATED".to_string(),
            SlurmState::Mix if used == 0 => "MIXED".to_string(),
            _ => base.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // sinfo
    // -----------------------------------------------------------------------

    fn sinfo(&self, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        if cmd.has_any(&["R", "list-reasons"]) {
            let rows: Vec<Vec<String>> = cluster
                .nodes
                .iter()
                .filter_map(|n| {
                    let reason = n.slurm_reason.as_ref()?;
                    Some(vec![
                        reason.clone(),
                        "root".to_string(),
                        ctx.now().format("%Y-%m-%dT%H:%M:%S").to_string(),
                        n.id.clone(),
                    ])
                })
                .collect();
            return Ok(CommandOutput::ok(render_table(&["REASON", "USER", "TIMESTAMP", "NODELIST"], &rows, 1)));
        }

        let long = cmd.has_any(&["l", "long"]);
        let mut out = String::new();
        if long {
            out.push_str(&format!("{}\n", ctx.now().format("%a %b %e %H:%M:%S %Y")));
        }

        if cmd.has_any(&["N", "Node"]) {
            let hw = &cluster.hardware;
            let rows: Vec<Vec<String>> = cluster
                .nodes
                .iter()
                .map(|n| {
                    let mut row = vec![n.id.clone(), "1".to_string(), format!("{}*", PARTITION), self.node_state(n)];
                    if long {
                        row.extend([
                            hw.logical_cpus().to_string(),
                            format!("{}:{}:{}", hw.sockets, hw.cores_per_socket, hw.threads_per_core),
                            (hw.memory_gib * 1024).to_string(),
                            "0".to_string(),
                            "1".to_string(),
                            "(null)".to_string(),
                            n.slurm_reason.clone().unwrap_or_else(|| "none".to_string()),
                        ]);
                    }
                    row
                })
                .collect();
            let mut headers = vec!["NODELIST", "NODES", "PARTITION", "STATE"];
            if long {
                headers.extend(["CPUS", "S:C:T", "MEMORY", "TMP_DISK", "WEIGHT", "AVAIL_FE", "REASON"]);
            }
            out.push_str(&render_table(&headers, &rows, 1));
            return Ok(CommandOutput::ok(out));
        }

        // partition view grouped by state, in node order of first appearance
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for n in &cluster.nodes {
            let state = self.node_state(n);
            match groups.iter_mut().find(|(s, _)| *s == state) {
                Some((_, nodes)) => nodes.push(n.id.clone()),
                None => groups.push((state, vec![n.id.clone()])),
            }
        }
        let rows: Vec<Vec<String>> = groups
            .iter()
            .map(|(state, nodes)| {
                let mut row = vec![format!("{}*", PARTITION), "up".to_string(), "infinite".to_string()];
                if long {
                    row.extend(["1-infinite", "no", "NO", "all"].map(String::from));
                }
                row.extend([nodes.len().to_string(), state.clone(), compress_hostlist(nodes)]);
                row
            })
            .collect();
        let mut headers = vec!["PARTITION", "AVAIL", "TIMELIMIT"];
        if long {
            headers.extend(["JOB_SIZE", "ROOT", "OVERSUBS", "GROUPS"]);
        }
        headers.extend(["NODES", "STATE", "NODELIST"]);
        out.push_str(&render_table(&headers, &rows, 1));
        Ok(CommandOutput::ok(out))
    }

    // -----------------------------------------------------------------------
    // squeue / sacct
    // -----------------------------------------------------------------------

    fn squeue(&self, cmd: &ParsedCommand, now: DateTime<Utc>) -> Result<CommandOutput> {
        let user = cmd.short_value('u').or_else(|| cmd.flag_value(&["user"]));
        let job_filter: Option<u32> = match cmd.short_value('j').or_else(|| cmd.flag_value(&["jobs"])) {
            Some(j) => Some(j.parse().map_err(|_| {
                SimError::Usage(format!("squeue: error: Invalid job id: {}", j))
            })?),
            None => None,
        };
        let mut out = format!(
            "{:>18} {:>9} {:>8} {:>8} {:>2} {:>10} {:>6} {}\n",
            "JOBID", "PARTITION", "NAME", "USER", "ST", "TIME", "NODES", "NODELIST(REASON)"
        );
        for j in self.jobs.iter().filter(|j| j.state.is_active()) {
            if user.is_some_and(|u| u != j.user) || job_filter.is_some_and(|id| id != j.id) {
                continue;
            }
            let (time, where_) = match j.state {
                JobState::Running => (
                    elapsed(j.started.map(|s| now - s).unwrap_or_else(chrono::Duration::zero)),
                    compress_hostlist(&j.nodes),
                ),
                _ => ("0:00".to_string(), "(Resources)".to_string()),
            };
            out.push_str(&format!(
                "{:>18} {:>9} {:>8} {:>8} {:>2} {:>10} {:>6} {}\n",
                j.id,
                PARTITION,
                truncate(&j.name, 8),
                truncate(&j.user, 8),
                j.state.code(),
                time,
                j.num_nodes,
                where_
            ));
        }
        Ok(CommandOutput::ok(out))
    }

    fn sacct(&self, cmd: &ParsedCommand, cluster: &Cluster) -> CommandOutput {
        let cpus = cluster.hardware.logical_cpus() as usize;
        let mut out = String::new();
        if !cmd.has_any(&["n", "noheader"]) {
            out.push_str(&format!(
                "{:<12} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8} \n",
                "JobID", "JobName", "Partition", "Account", "AllocCPUS", "State", "ExitCode"
            ));
            out.push_str("------------ ---------- ---------- ---------- ---------- ---------- -------- \n");
        }
        for j in &self.jobs {
            let alloc = if j.state == JobState::Pending { 0 } else { cpus * j.num_nodes };
            let exit = match j.state {
                JobState::NodeFail => "0:1",
                JobState::Cancelled => "0:15",
                _ => "0:0",
            };
            out.push_str(&format!(
                "{:<12} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8} \n",
                j.id,
                truncate(&j.name, 10),
                PARTITION,
                truncate(&j.user, 10),
                alloc,
                j.state,
                exit
            ));
        }
        CommandOutput::ok(out)
    }

    // -----------------------------------------------------------------------
    // scontrol
    // -----------------------------------------------------------------------

    fn scontrol(&self, cmd: &ParsedCommand, cluster: &Cluster, now: DateTime<Utc>) -> Result<CommandOutput> {
        match cmd.subcommand.as_deref() {
            Some("show") => {
                let what = cmd.positionals.first().map(|s| s.as_str());
                let target = cmd.positionals.get(1).map(|s| s.as_str());
                match what {
                    Some("node" | "nodes" | "NodeName") => self.show_nodes(cluster, target, now),
                    Some("job" | "jobs") => self.show_jobs(target, now),
                    Some("partition" | "partitions") => Ok(CommandOutput::ok(show_partition(cluster))),
                    Some(other) => Err(SimError::Usage(format!("invalid entity:{} for keyword:show", other))),
                    None => Err(SimError::Usage("too few arguments for keyword:show".to_string())),
                }
            }
            Some("update") => update(cmd, cluster),
            Some("ping") => Ok(CommandOutput::ok("Slurmctld(primary) at slurm-head is UP\n")),
            Some("version") => Ok(CommandOutput::ok(format!("slurm {}\n", SLURM_VERSION))),
            None if cmd.has_any(&["V", "version"]) => Ok(CommandOutput::ok(format!("slurm {}\n", SLURM_VERSION))),
            Some(other) => Err(SimError::Usage(format!("invalid keyword: {}", other))),
            None => Err(SimError::Usage("scontrol: no command specified".to_string())),
        }
    }

    fn show_nodes(&self, cluster: &Cluster, target: Option<&str>, now: DateTime<Utc>) -> Result<CommandOutput> {
        let nodes: Vec<&DgxNode> = match target {
            Some(t) => {
                let mut out = Vec::new();
                for name in expand_hostlist(t, cluster.nodes.len())? {
                    out.push(cluster.node(&name).ok_or_else(|| {
                        SimError::NotFound(format!("Node {} not found", name))
                    })?);
                }
                out
            }
            None => cluster.nodes.iter().collect(),
        };
        let hw = &cluster.hardware;
        let boot = now - chrono::Duration::seconds(hw.uptime_secs as i64);
        let mut out = String::new();
        for n in nodes {
            let used = self.gpus_in_use(&n.id);
            let cpus = hw.logical_cpus();
            let alloc_cpus = cpus * used / n.gpus.len().max(1) as u32;
            out.push_str(&format!("NodeName={} Arch=x86_64 CoresPerSocket={}\n", n.id, hw.cores_per_socket));
            out.push_str(&format!("   CPUAlloc={} CPUEfctv={} CPUTot={} CPULoad=0.00\n", alloc_cpus, cpus, cpus));
            out.push_str("   AvailableFeatures=(null)\n   ActiveFeatures=(null)\n");
            out.push_str(&format!("   Gres=gpu:h100:{}\n", n.gpus.len()));
            out.push_str(&format!("   NodeAddr={} NodeHostName={} Version={}\n", n.mgmt_ip, n.hostname, SLURM_VERSION));
            out.push_str(&format!("   OS=Linux {} #42-Ubuntu SMP\n", hw.kernel));
            out.push_str(&format!(
                "   RealMemory={} AllocMem=0 FreeMem={} Sockets={} Boards=1\n",
                hw.memory_gib * 1024,
                hw.memory_gib * 1000,
                hw.sockets
            ));
            out.push_str(&format!(
                "   State={} ThreadsPerCore={} TmpDisk=0 Weight=1 Owner=N/A MCS_label=N/A\n",
                self.node_state_long(n),
                hw.threads_per_core
            ));
            out.push_str(&format!("   Partitions={}\n", PARTITION));
            out.push_str(&format!(
                "   BootTime={} SlurmdStartTime={}\n",
                boot.format("%Y-%m-%dT%H:%M:%S"),
                boot.format("%Y-%m-%dT%H:%M:%S")
            ));
            out.push_str(&format!(
                "   CfgTRES=cpu={},mem={}M,billing={},gres/gpu={}\n",
                cpus,
                hw.memory_gib * 1024,
                cpus,
                n.gpus.len()
            ));
            out.push_str(&format!(
                "   AllocTRES={}\n",
                if used > 0 { format!("cpu={},gres/gpu={}", alloc_cpus, used) } else { String::new() }
            ));
            if let Some(reason) = &n.slurm_reason {
                out.push_str(&format!("   Reason={} [root@{}]\n", reason, now.format("%Y-%m-%dT%H:%M:%S")));
            }
            out.push('\n');
        }
        Ok(CommandOutput::ok(out))
    }

    fn show_jobs(&self, target: Option<&str>, now: DateTime<Utc>) -> Result<CommandOutput> {
        let jobs: Vec<&Job> = match target {
            Some(t) => {
                let job = t
                    .parse::<u32>()
                    .ok()
                    .and_then(|id| self.job(id))
                    .ok_or_else(|| SimError::NotFound("slurm_load_jobs error: Invalid job id specified".to_string()))?;
                vec![job]
            }
            None => self.jobs.iter().collect(),
        };
        if jobs.is_empty() {
            return Ok(CommandOutput::ok("No jobs in the system\n"));
        }
        let fmt = |t: Option<DateTime<Utc>>| {
            t.map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string()).unwrap_or_else(|| "Unknown".to_string())
        };
        let mut out = String::new();
        for j in jobs {
            let run = match (j.started, j.ended) {
                (Some(s), Some(e)) => elapsed(e - s),
                (Some(s), None) => elapsed(now - s),
                _ => "00:00:00".to_string(),
            };
            out.push_str(&format!("JobId={} JobName={}\n", j.id, j.name));
            out.push_str(&format!("   UserId={}(0) GroupId={}(0)\n", j.user, j.user));
            out.push_str(&format!(
                "   JobState={} Reason={} Dependency=(null)\n",
                j.state,
                if j.state == JobState::Pending { "Resources" } else { "None" }
            ));
            out.push_str(&format!("   RunTime={} TimeLimit=UNLIMITED\n", run));
            out.push_str(&format!(
                "   SubmitTime={} StartTime={} EndTime={}\n",
                fmt(Some(j.submitted)),
                fmt(j.started),
                fmt(j.ended)
            ));
            out.push_str(&format!("   Partition={} AllocNode:Sid=dgx-00:1\n", PARTITION));
            out.push_str(&format!(
                "   NodeList={}\n",
                if j.nodes.is_empty() { "(null)".to_string() } else { compress_hostlist(&j.nodes) }
            ));
            out.push_str(&format!("   NumNodes={} TRES=gres/gpu={}\n\n", j.num_nodes, j.gpus_per_node as usize * j.num_nodes));
        }
        Ok(CommandOutput::ok(out))
    }

    // -----------------------------------------------------------------------
    // sbatch / scancel / srun
    // -----------------------------------------------------------------------

    fn request(&self, cmd: &ParsedCommand, cluster: &Cluster, tool: &str) -> Result<(usize, u32)> {
        let n: usize = match cmd.short_value('N').or_else(|| cmd.flag_value(&["nodes"])) {
            Some(v) => v
                .parse()
                .map_err(|_| SimError::Usage(format!("{}: error: Invalid node count specification", tool)))?,
            None => 1,
        };
        let per_node = cluster.hardware.gpus_per_node;
        let k: u32 = match cmd.flag_value(&["gres", "gpus-per-node"]) {
            Some(g) => g
                .rsplit(':')
                .next()
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| SimError::Usage(format!("{}: error: Invalid generic resource (gres) specification", tool)))?,
            None => per_node,
        };
        if n == 0 || n > cluster.nodes.len() || k > per_node {
            return Err(SimError::Usage(format!(
                "{}: error: Batch job submission failed: Requested node configuration is not available",
                tool
            )));
        }
        Ok((n, k))
    }

    fn sbatch(&mut self, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        let script = cmd
            .subcommand
            .clone()
            .or_else(|| cmd.flag_value(&["wrap"]).map(|_| "wrap".to_string()))
            .ok_or_else(|| SimError::Usage("sbatch: error: Batch script is empty!".to_string()))?;
        let (n, k) = self.request(cmd, cluster, "sbatch")?;
        let name = cmd
            .short_value('J')
            .or_else(|| cmd.flag_value(&["job-name"]))
            .map(String::from)
            .unwrap_or_else(|| script.rsplit('/').next().unwrap_or(&script).to_string());
        let id = self.submit(cluster, name, &ctx.user, n, k, ctx.now());
        if cmd.has_flag("parsable") {
            return Ok(CommandOutput::ok(format!("{}\n", id)));
        }
        Ok(CommandOutput::ok(format!("Submitted batch job {}\n", id)))
    }

    fn scancel(&mut self, cmd: &ParsedCommand, now: DateTime<Utc>) -> Result<CommandOutput> {
        let ids = cmd.operands();
        if ids.is_empty() {
            return Err(SimError::Usage("scancel: error: No job identification provided".to_string()));
        }
        for raw in ids {
            let job = raw
                .parse::<u32>()
                .ok()
                .and_then(|id| self.jobs.iter_mut().find(|j| j.id == id && j.state.is_active()))
                .ok_or_else(|| {
                    SimError::NotFound(format!("scancel: error: Kill job error on job id {}: Invalid job id specified", raw))
                })?;
            job.state = JobState::Cancelled;
            job.ended = Some(now);
        }
        Ok(CommandOutput::ok(""))
    }

    /// Allocate nodes for an interactive step. The job stays Running until
    /// [`finish_step`](Self::finish_step).
    pub fn srun_plan(&mut self, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<SrunPlan> {
        let base = cmd
            .subcommand
            .clone()
            .ok_or_else(|| SimError::Usage("srun: fatal: No command given to execute.".to_string()))?;
        if base == "srun" {
            return Err(SimError::Usage("srun: fatal: nested srun is not supported".to_string()));
        }
        self.schedule(cluster, ctx.now());
        let (n, k) = self.request(cmd, cluster, "srun")?;
        let nodes = self.allocate(cluster, n, k).ok_or_else(|| {
            SimError::Usage(format!(
                "srun: error: Unable to allocate resources: Requested nodes are busy ({} idle node(s) needed)",
                n
            ))
        })?;
        let id = self.next_id;
        self.next_id += 1;
        self.jobs.push(Job {
            id,
            name: base.clone(),
            user: ctx.user.clone(),
            num_nodes: n,
            gpus_per_node: k,
            nodes: nodes.clone(),
            state: JobState::Running,
            submitted: ctx.now(),
            started: Some(ctx.now()),
            ended: None,
        });
        let mut command = vec![base];
        command.extend(cmd.positionals.iter().map(|a| {
            if a.contains(char::is_whitespace) { format!("'{}'", a) } else { a.clone() }
        }));
        Ok(SrunPlan { job_id: id, nodes, command: command.join(" "), label: cmd.has_any(&["l", "label"]) })
    }

    pub fn finish_step(&mut self, job_id: u32, now: DateTime<Utc>) {
        if let Some(j) = self.jobs.iter_mut().find(|j| j.id == job_id && j.state == JobState::Running) {
            j.state = JobState::Completed;
            j.ended = Some(now);
        }
    }
}

/// `scontrol update nodename=<list> state=<s> [reason=<r>]`
fn update(cmd: &ParsedCommand, cluster: &Cluster) -> Result<CommandOutput> {
    let mut nodes = None;
    let mut state = None;
    let mut reason = None;
    for arg in &cmd.positionals {
        let (k, v) = arg
            .split_once('=')
            .ok_or_else(|| SimError::Usage(format!("scontrol: error: Invalid input: {}", arg)))?;
        match k.to_ascii_lowercase().as_str() {
            "nodename" | "node" => nodes = Some(v.to_string()),
            "state" => state = Some(v.to_string()),
            "reason" => reason = Some(v.to_string()),
            _ => return Err(SimError::Usage(format!("scontrol: error: Update of this parameter is not supported: {}", arg))),
        }
    }
    let nodes = nodes.ok_or_else(|| SimError::Usage("scontrol: error: No valid entity in update command".to_string()))?;
    let state_word = state.ok_or_else(|| SimError::Usage("scontrol: error: No changes specified".to_string()))?;
    let state = match state_word.to_ascii_lowercase().as_str() {
        "undrain" => SlurmState::Idle,
        "idle" | "resume" | "drain" | "down" => state_word.parse::<SlurmState>().map_err(SimError::Usage)?,
        other => return Err(SimError::Usage(format!("Invalid node state specified: {}", other))),
    };
    if matches!(state, SlurmState::Drain | SlurmState::Down) && reason.is_none() {
        return Err(SimError::Usage(
            "You must specify a reason when DOWNING or DRAINING a node. Request denied".to_string(),
        ));
    }
    let mut out = CommandOutput::ok("");
    for name in expand_hostlist(&nodes, cluster.nodes.len())? {
        if cluster.node(&name).is_none() {
            return Err(SimError::NotFound(format!("scontrol: error: Invalid node name specified: {}", name)));
        }
        out = out.with_action(StateAction::SetSlurmState { node: name, state, reason: reason.clone() });
    }
    Ok(out)
}

fn show_partition(cluster: &Cluster) -> String {
    let names: Vec<String> = cluster.nodes.iter().map(|n| n.id.clone()).collect();
    let cpus = cluster.hardware.logical_cpus() as usize * cluster.nodes.len();
    let mut out = format!("PartitionName={}\n", PARTITION);
    out.push_str("   AllowGroups=ALL AllowAccounts=ALL AllowQos=ALL\n");
    out.push_str("   Default=YES QoS=N/A\n");
    out.push_str("   MaxNodes=UNLIMITED MaxTime=UNLIMITED MinNodes=0\n");
    out.push_str(&format!("   Nodes={}\n", compress_hostlist(&names)));
    out.push_str("   State=UP\n");
    out.push_str(&format!("   TotalCPUs={} TotalNodes={}\n", cpus, cluster.nodes.len()));
    out.push_str(&format!("   TRES=cpu={},gres/gpu={}\n\n", cpus, cluster.total_gpus()));
    out
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn truncate(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn elapsed(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    let (days, h, m, s) = (secs / 86_400, (secs % 86_400) / 3_600, (secs % 3_600) / 60, secs % 60);
    if days > 0 {
        format!("{}-{:02}:{:02}:{:02}", days, h, m, s)
    } else if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

/// `["dgx-00","dgx-01","dgx-02","dgx-05"]` → `dgx-[00-02,05]`.
pub fn compress_hostlist(names: &[String]) -> String {
    if names.is_empty() {
        return String::new();
    }
    if names.len() == 1 {
        return names[0].clone();
    }
    let mut prefix: Option<&str> = None;
    let mut nums: Vec<(u32, usize)> = Vec::new();
    for n in names {
        let Some((p, num)) = n.rsplit_once('-') else {
            return names.join(",");
        };
        let Ok(v) = num.parse::<u32>() else {
            return names.join(",");
        };
        if prefix.is_some_and(|q| q != p) {
            return names.join(",");
        }
        prefix = Some(p);
        nums.push((v, num.len()));
    }
    nums.sort_unstable();
    let width = nums[0].1;
    let mut ranges: Vec<String> = Vec::new();
    let mut i = 0;
    while i < nums.len() {
        let start = nums[i].0;
        let mut end = start;
        while i + 1 < nums.len() && nums[i + 1].0 == end + 1 {
            i += 1;
            end = nums[i].0;
        }
        ranges.push(if start == end {
            format!("{:0w$}", start, w = width)
        } else {
            format!("{:0w$}-{:0w$}", start, end, w = width)
        });
        i += 1;
    }
    format!("{}-[{}]", prefix.unwrap_or_default(), ranges.join(","))
}

/// `dgx-[00-02,05]` → individual names; plain comma lists pass through.
/// Lists naming more than `limit` hosts are rejected before expansion.
pub fn expand_hostlist(list: &str, limit: usize) -> Result<Vec<String>> {
    let too_long = || SimError::Usage(format!("Invalid hostlist: {} names more than {} nodes", list, limit));
    let Some((prefix, rest)) = list.split_once('[') else {
        let names: Vec<String> = list.split(',').filter(|s| !s.is_empty()).map(String::from).collect();
        return if names.len() > limit { Err(too_long()) } else { Ok(names) };
    };
    let body = rest.trim_end_matches(']');
    let mut out = Vec::new();
    for part in body.split(',') {
        match part.split_once('-') {
            Some((a, b)) => {
                let width = a.len();
                if let (Ok(a), Ok(b)) = (a.parse::<u32>(), b.parse::<u32>()) {
                    let count = (b as u64 + 1).saturating_sub(a as u64);
                    if out.len() as u64 + count > limit as u64 {
                        return Err(too_long());
                    }
                    out.extend((a..=b).map(|v| format!("{}{:0w$}", prefix, v, w = width)));
                }
            }
            None => {
                if out.len() >= limit {
                    return Err(too_long());
                }
                out.push(format!("{}{}", prefix, part));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, FaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;
    use chrono::TimeZone;

    fn ctx() -> CommandContext {
        CommandContext::with_fixed_clock("dgx-00", Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap())
    }

    fn run(slurm: &mut Slurm, store: &ClusterStore, verb: SlurmVerb, line: &str) -> Result<CommandOutput> {
        slurm.execute(verb, &parse(line).unwrap(), &ctx(), store.cluster())
    }

    fn apply(store: &mut ClusterStore, out: &CommandOutput) {
        for a in &out.actions {
            let StateAction::SetSlurmState { node, state, reason } = a;
            store.set_slurm_state(node, *state, reason.clone()).unwrap();
        }
    }

    #[test]
    fn hostlists() {
        let names: Vec<String> = ["dgx-00", "dgx-01", "dgx-02", "dgx-05"].iter().map(|s| s.to_string()).collect();
        assert_eq!(compress_hostlist(&names), "dgx-[00-02,05]");
        assert_eq!(expand_hostlist("dgx-[00-02,05]", 8).unwrap(), names);
        assert_eq!(expand_hostlist("dgx-03", 8).unwrap(), vec!["dgx-03"]);
        assert!(matches!(expand_hostlist("dgx-[0-4294967295]", 8), Err(SimError::Usage(_))));
        assert!(matches!(expand_hostlist("dgx-[00-07,00]", 8), Err(SimError::Usage(_))));
        assert!(matches!(expand_hostlist("a,b,c", 2), Err(SimError::Usage(_))));
    }

    #[test]
    fn sinfo_idle_cluster() {
        let store = ClusterStore::superpod("t");
        let mut slurm = Slurm::default();
        let out = run(&mut slurm, &store, SlurmVerb::Sinfo, "sinfo").unwrap();
        assert_eq!(
            out.output,
            "PARTITION AVAIL TIMELIMIT NODES STATE NODELIST\nbatch*    up    infinite  8     idle  dgx-[00-07]\n"
        );
    }

    #[test]
    fn drain_requires_reason_and_emits_action() {
        let mut store = ClusterStore::superpod("t");
        let mut slurm = Slurm::default();
        let err = run(&mut slurm, &store, SlurmVerb::Scontrol, "scontrol update nodename=dgx-01 state=drain").unwrap_err();
        assert!(err.to_string().contains("must specify a reason"));

        let out = run(&mut slurm, &store, SlurmVerb::Scontrol, r#"scontrol update nodename=dgx-01 state=drain reason="xid 79""#).unwrap();
        assert_eq!(
            out.actions,
            vec![StateAction::SetSlurmState { node: "dgx-01".into(), state: SlurmState::Drain, reason: Some("xid 79".into()) }]
        );
        apply(&mut store, &out);
        let sinfo = run(&mut slurm, &store, SlurmVerb::Sinfo, "sinfo -R").unwrap();
        assert!(sinfo.output.contains("xid 79") && sinfo.output.contains("dgx-01"));
        let show = run(&mut slurm, &store, SlurmVerb::Scontrol, "scontrol show node dgx-01").unwrap();
        assert!(show.output.contains("State=IDLE+DRAIN"));
        assert!(show.output.contains("Reason=xid 79"));
    }

    #[test]
    fn gpu_fault_does_not_drain() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-02", 1, FaultKind::Xid).unwrap();
        let mut slurm = Slurm::default();
        let out = run(&mut slurm, &store, SlurmVerb::Sinfo, "sinfo -N").unwrap();
        assert!(out.output.lines().any(|l| l.starts_with("dgx-02") && l.ends_with("idle")));
    }

    #[test]
    fn jobs_allocate_and_cancel() {
        let mut store = ClusterStore::superpod("t");
        let mut slurm = Slurm::default();
        let out = run(&mut slurm, &store, SlurmVerb::Sbatch, "sbatch -N2 -J train train.sh").unwrap();
        assert_eq!(out.output, "Submitted batch job 1001\n");
        let out = run(&mut slurm, &store, SlurmVerb::Sbatch, "sbatch --gres=gpu:4 burnin.sh").unwrap();
        assert_eq!(out.output, "Submitted batch job 1002\n");

        let sq = run(&mut slurm, &store, SlurmVerb::Squeue, "squeue").unwrap();
        assert!(sq.output.contains("dgx-[00-01]"));
        let sinfo = run(&mut slurm, &store, SlurmVerb::Sinfo, "sinfo -N").unwrap();
        assert!(sinfo.output.lines().any(|l| l.starts_with("dgx-00") && l.ends_with("alloc")));
        assert!(sinfo.output.lines().any(|l| l.starts_with("dgx-02") && l.ends_with("mix")));

        // draining a node with a job shows it as draining
        let out = run(&mut slurm, &store, SlurmVerb::Scontrol, "scontrol update nodename=dgx-02 state=drain reason=maint").unwrap();
        apply(&mut store, &out);
        let sinfo = run(&mut slurm, &store, SlurmVerb::Sinfo, "sinfo -N").unwrap();
        assert!(sinfo.output.lines().any(|l| l.starts_with("dgx-02") && l.ends_with("drng")));

        run(&mut slurm, &store, SlurmVerb::Scancel, "scancel 1002").unwrap();
        assert_eq!(slurm.job(1002).unwrap().state, JobState::Cancelled);
        assert!(run(&mut slurm, &store, SlurmVerb::Scancel, "scancel 1002").is_err());
        let acct = run(&mut slurm, &store, SlurmVerb::Sacct, "sacct").unwrap();
        assert!(acct.output.contains("CANCELLED"));
    }

    #[test]
    fn pending_job_starts_when_node_resumes() {
        let mut store = ClusterStore::superpod("t");
        for i in 0..8 {
            store.set_slurm_state(&format!("dgx-0{}", i), SlurmState::Drain, Some("maint".into())).unwrap();
        }
        let mut slurm = Slurm::default();
        run(&mut slurm, &store, SlurmVerb::Sbatch, "sbatch job.sh").unwrap();
        assert_eq!(slurm.job(1001).unwrap().state, JobState::Pending);
        store.set_slurm_state("dgx-04", SlurmState::Idle, None).unwrap();
        run(&mut slurm, &store, SlurmVerb::Squeue, "squeue").unwrap();
        let job = slurm.job(1001).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.nodes, vec!["dgx-04"]);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let store = ClusterStore::superpod("t");
        let mut slurm = Slurm::default();
        assert!(run(&mut slurm, &store, SlurmVerb::Sbatch, "sbatch -N 9 x.sh").is_err());
        assert!(matches!(
            run(&mut slurm, &store, SlurmVerb::Scontrol, "scontrol show node dgx-42"),
            Err(SimError::NotFound(_))
        ));
    }

    #[test]
    fn srun_plan_and_finish() {
        let store = ClusterStore::superpod("t");
        let mut slurm = Slurm::default();
        let plan = slurm.srun_plan(&parse("srun -N2 -l hostname").unwrap(), &ctx(), store.cluster()).unwrap();
        assert_eq!(plan.nodes, vec!["dgx-00", "dgx-01"]);
        assert_eq!(plan.command, "hostname");
        assert!(plan.label);
        slurm.finish_step(plan.job_id, ctx().now());
        assert_eq!(slurm.job(plan.job_id).unwrap().state, JobState::Completed);
    }
}
