/// Command routing: a static table from base command to handler.
///
/// Umbrella tools (the Slurm family, the cluster manager, the InfiniBand
/// utilities) route to one simulator with a typed verb, so the verb set of
/// each simulator is checked by the compiler instead of by string matching.
use tracing::{debug, warn};

use crate::error::{Result, SimError};
use crate::simulators::basic::BasicVerb;
use crate::simulators::benchmarks::BenchVerb;
use crate::simulators::cluster_manager::BcmVerb;
use crate::simulators::containers::ContainerVerb;
use crate::simulators::infiniband::IbVerb;
use crate::simulators::mellanox::MlxVerb;
use crate::simulators::pci_logs::PciVerb;
use crate::simulators::slurm::SlurmVerb;
use crate::simulators::storage::StorageVerb;

/// Session commands the engine handles itself. They only touch the
/// `CommandContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Ssh,
    Exit,
    Cd,
    Export,
    History,
    Help,
    Clear,
}

/// A simulator and the verb it is entered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    NvidiaSmi,
    Dcgmi,
    FabricManager,
    Slurm(SlurmVerb),
    ClusterManager(BcmVerb),
    Ipmitool,
    InfiniBand(IbVerb),
    Mellanox(MlxVerb),
    Basic(BasicVerb),
    PciLogs(PciVerb),
    Containers(ContainerVerb),
    Storage(StorageVerb),
    Benchmarks(BenchVerb),
    Nvsm,
    LinkAudit,
    BugReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Builtin(Builtin),
    /// `simctl`, the admin surface for fault injection and persistence
    Control,
    Tool(Tool),
}

#[derive(Debug, Clone, Copy)]
pub struct CommandEntry {
    pub name: &'static str,
    pub route: Route,
    pub summary: &'static str,
}

const fn entry(name: &'static str, route: Route, summary: &'static str) -> CommandEntry {
    CommandEntry { name, route, summary }
}

const fn tool(name: &'static str, tool: Tool, summary: &'static str) -> CommandEntry {
    entry(name, Route::Tool(tool), summary)
}

pub const COMMANDS: &[CommandEntry] = &[
    // GPU
    tool("nvidia-smi", Tool::NvidiaSmi, "GPU status, queries, topology and NVLink state"),
    tool("dcgmi", Tool::Dcgmi, "DCGM discovery, diagnostics, health and dmon"),
    tool("nv-fabricmanager", Tool::FabricManager, "NVSwitch fabric manager status and diagnostics"),
    tool("nvsm", Tool::Nvsm, "node health checks and alerts"),
    tool("nvlink-audit", Tool::LinkAudit, "cluster-wide NVLink and InfiniBand link audit"),
    tool("nvidia-bug-report.sh", Tool::BugReport, "collect a support bundle"),
    // Slurm
    tool("sinfo", Tool::Slurm(SlurmVerb::Sinfo), "partition and node state"),
    tool("squeue", Tool::Slurm(SlurmVerb::Squeue), "pending and running jobs"),
    tool("scontrol", Tool::Slurm(SlurmVerb::Scontrol), "show or update nodes, jobs and partitions"),
    tool("sbatch", Tool::Slurm(SlurmVerb::Sbatch), "submit a batch job"),
    tool("scancel", Tool::Slurm(SlurmVerb::Scancel), "cancel a job"),
    tool("sacct", Tool::Slurm(SlurmVerb::Sacct), "job accounting"),
    tool("srun", Tool::Slurm(SlurmVerb::Srun), "run a command on allocated nodes"),
    // Cluster manager
    tool("bcm", Tool::ClusterManager(BcmVerb::Bcm), "cluster manager status"),
    tool("bcm-node", Tool::ClusterManager(BcmVerb::BcmNode), "cluster manager node inventory"),
    tool("crm", Tool::ClusterManager(BcmVerb::Crm), "head node HA status"),
    // BMC
    tool("ipmitool", Tool::Ipmitool, "BMC sensors, event log, chassis and power"),
    // InfiniBand
    tool("ibstat", Tool::InfiniBand(IbVerb::Ibstat), "HCA and port state"),
    tool("ibstatus", Tool::InfiniBand(IbVerb::Ibstatus), "brief port state"),
    tool("iblinkinfo", Tool::InfiniBand(IbVerb::Iblinkinfo), "fabric link table"),
    tool("perfquery", Tool::InfiniBand(IbVerb::Perfquery), "port performance counters"),
    tool("ibdiagnet", Tool::InfiniBand(IbVerb::Ibdiagnet), "fabric diagnostics"),
    tool("ibnetdiscover", Tool::InfiniBand(IbVerb::Ibnetdiscover), "fabric topology"),
    tool("sminfo", Tool::InfiniBand(IbVerb::Sminfo), "subnet manager"),
    // NIC firmware
    tool("mst", Tool::Mellanox(MlxVerb::Mst), "Mellanox software tools devices"),
    tool("mlxconfig", Tool::Mellanox(MlxVerb::Mlxconfig), "HCA firmware configuration"),
    tool("mlxlink", Tool::Mellanox(MlxVerb::Mlxlink), "HCA link diagnostics"),
    tool("mlxfwmanager", Tool::Mellanox(MlxVerb::Mlxfwmanager), "HCA firmware inventory"),
    tool("flint", Tool::Mellanox(MlxVerb::Flint), "HCA firmware image query"),
    // OS
    tool("hostname", Tool::Basic(BasicVerb::Hostname), "print the host name"),
    tool("uname", Tool::Basic(BasicVerb::Uname), "kernel information"),
    tool("uptime", Tool::Basic(BasicVerb::Uptime), "time since boot and load"),
    tool("free", Tool::Basic(BasicVerb::Free), "memory usage"),
    tool("lscpu", Tool::Basic(BasicVerb::Lscpu), "CPU architecture"),
    tool("nproc", Tool::Basic(BasicVerb::Nproc), "number of processing units"),
    tool("whoami", Tool::Basic(BasicVerb::Whoami), "current user"),
    tool("pwd", Tool::Basic(BasicVerb::Pwd), "working directory"),
    tool("date", Tool::Basic(BasicVerb::Date), "current date and time"),
    tool("echo", Tool::Basic(BasicVerb::Echo), "print arguments"),
    tool("env", Tool::Basic(BasicVerb::Env), "environment variables"),
    tool("cat", Tool::Basic(BasicVerb::Cat), "print system files"),
    tool("systemctl", Tool::Basic(BasicVerb::Systemctl), "service status"),
    tool("lspci", Tool::PciLogs(PciVerb::Lspci), "PCI devices"),
    tool("dmesg", Tool::PciLogs(PciVerb::Dmesg), "kernel ring buffer"),
    tool("journalctl", Tool::PciLogs(PciVerb::Journalctl), "system journal"),
    // Containers
    tool("docker", Tool::Containers(ContainerVerb::Docker), "containers with GPU access"),
    tool("enroot", Tool::Containers(ContainerVerb::Enroot), "unprivileged container images"),
    tool("nvidia-container-cli", Tool::Containers(ContainerVerb::NvidiaContainerCli), "container toolkit device check"),
    // Storage
    tool("df", Tool::Storage(StorageVerb::Df), "filesystem usage"),
    tool("mount", Tool::Storage(StorageVerb::Mount), "mounted filesystems"),
    tool("lfs", Tool::Storage(StorageVerb::Lfs), "Lustre client"),
    // Benchmarks
    tool("all_reduce_perf", Tool::Benchmarks(BenchVerb::AllReducePerf), "NCCL all-reduce bandwidth"),
    tool("ib_write_bw", Tool::Benchmarks(BenchVerb::IbWriteBw), "RDMA write bandwidth"),
    tool("gpu_burn", Tool::Benchmarks(BenchVerb::GpuBurn), "GPU stress test"),
    // Session
    entry("ssh", Route::Builtin(Builtin::Ssh), "log into another node"),
    entry("exit", Route::Builtin(Builtin::Exit), "leave the current node"),
    entry("logout", Route::Builtin(Builtin::Exit), "leave the current node"),
    entry("cd", Route::Builtin(Builtin::Cd), "change directory"),
    entry("export", Route::Builtin(Builtin::Export), "set an environment variable"),
    entry("history", Route::Builtin(Builtin::History), "command history"),
    entry("help", Route::Builtin(Builtin::Help), "this list"),
    entry("clear", Route::Builtin(Builtin::Clear), "clear the screen"),
    entry("simctl", Route::Control, "inject and clear faults, drain, reset, export, import"),
];

/// Look up the handler for `base`.
pub fn route(base: &str) -> Result<Route> {
    match COMMANDS.iter().find(|c| c.name == base) {
        Some(c) => {
            debug!(command = base, route = ?c.route, "routed");
            Ok(c.route)
        }
        None => {
            warn!(command = base, "unknown command");
            Err(SimError::UnknownCommand(base.to_string()))
        }
    }
}

/// `help` output.
pub fn help_text() -> String {
    let width = COMMANDS.iter().map(|c| c.name.len()).max().unwrap_or(0);
    let mut out = String::from("Available commands:\n");
    for c in COMMANDS {
        out.push_str(&format!("  {:<w$}  {}\n", c.name, c.summary, w = width));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn umbrella_tools_share_a_simulator() {
        assert_eq!(route("sinfo").unwrap(), Route::Tool(Tool::Slurm(SlurmVerb::Sinfo)));
        assert_eq!(route("bcm-node").unwrap(), Route::Tool(Tool::ClusterManager(BcmVerb::BcmNode)));
        assert_eq!(route("perfquery").unwrap(), Route::Tool(Tool::InfiniBand(IbVerb::Perfquery)));
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(matches!(route("vim"), Err(SimError::UnknownCommand(c)) if c == "vim"));
    }

    #[test]
    fn table_has_no_duplicates() {
        let names: HashSet<&str> = COMMANDS.iter().map(|c| c.name).collect();
        assert_eq!(names.len(), COMMANDS.len());
        assert!(help_text().contains("nvidia-smi"));
    }
}
