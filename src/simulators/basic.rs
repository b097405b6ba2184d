/// Everyday OS commands on a DGX node: identity, resources, virtual files and
/// service status. Most of them are thin projections of `HardwareSpec`.
use chrono::{DateTime, Utc};

use crate::cluster::{Cluster, DgxNode, SlurmState};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::interconnect::PortState;
use crate::parser::ParsedCommand;

use super::fabric_manager::FabricState;
use super::slurm::compress_hostlist;
use super::{current_node, format_uptime, numa_cpu_ranges, CommandOutput, Simulator};

const KIB_PER_GIB: u64 = 1024 * 1024;
const BASE_USED_GIB: u64 = 24;
const CACHE_GIB: u64 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicVerb {
    Hostname,
    Uname,
    Uptime,
    Free,
    Lscpu,
    Nproc,
    Whoami,
    Pwd,
    Date,
    Echo,
    Env,
    Cat,
    Systemctl,
}

#[derive(Debug, Default)]
pub struct Basic;

impl Simulator for Basic {
    type Verb = BasicVerb;

    fn name(&self) -> &'static str {
        "basic"
    }

    fn execute(&mut self, verb: BasicVerb, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        let node = || current_node(ctx, cluster);
        let hw = &cluster.hardware;
        match verb {
            BasicVerb::Whoami => Ok(CommandOutput::ok(format!("{}\n", ctx.user))),
            BasicVerb::Pwd => Ok(CommandOutput::ok(format!("{}\n", ctx.cwd))),
            BasicVerb::Date => Ok(CommandOutput::ok(format!("{}\n", date(ctx.now())))),
            BasicVerb::Echo => Ok(CommandOutput::ok(echo(cmd))),
            BasicVerb::Env => Ok(CommandOutput::ok(
                ctx.env.iter().map(|(k, v)| format!("{}={}\n", k, v)).collect::<String>(),
            )),
            BasicVerb::Hostname => {
                let node = node()?;
                Ok(CommandOutput::ok(if cmd.has_flag("I") {
                    format!("{} \n", node.mgmt_ip)
                } else {
                    format!("{}\n", node.hostname)
                }))
            }
            BasicVerb::Uname => Ok(CommandOutput::ok(uname(cmd, node()?, cluster))),
            BasicVerb::Uptime => Ok(CommandOutput::ok(format!(
                " {} up {},  1 user,  load average: {}\n",
                ctx.now().format("%H:%M:%S"),
                format_uptime(hw.uptime_secs),
                load_average(node()?, cluster)
            ))),
            BasicVerb::Free => Ok(CommandOutput::ok(free(cmd, node()?, cluster))),
            BasicVerb::Lscpu => Ok(CommandOutput::ok(lscpu(cluster))),
            BasicVerb::Nproc => Ok(CommandOutput::ok(format!("{}\n", hw.logical_cpus()))),
            BasicVerb::Cat => Ok(cat(cmd, node()?, cluster)),
            BasicVerb::Systemctl => systemctl(cmd, node()?, cluster, ctx.now()),
        }
    }
}

fn date(now: DateTime<Utc>) -> String {
    now.format("%a %b %e %H:%M:%S UTC %Y").to_string()
}

fn echo(cmd: &ParsedCommand) -> String {
    let words = cmd.operands();
    match words.split_first() {
        Some((&"-n", rest)) => rest.join(" "),
        _ => format!("{}\n", words.join(" ")),
    }
}

fn uname(cmd: &ParsedCommand, node: &DgxNode, cluster: &Cluster) -> String {
    let hw = &cluster.hardware;
    let version = "#42-Ubuntu SMP Wed Oct 4 10:34:27 UTC 2023";
    if cmd.has_any(&["a", "all"]) {
        return format!(
            "Linux {} {} {} x86_64 x86_64 x86_64 GNU/Linux\n",
            node.hostname, hw.kernel, version
        );
    }
    let mut parts = Vec::new();
    if cmd.has_flag("s") {
        parts.push("Linux".to_string());
    }
    if cmd.has_flag("n") {
        parts.push(node.hostname.clone());
    }
    if cmd.has_flag("r") {
        parts.push(hw.kernel.clone());
    }
    if cmd.has_flag("m") {
        parts.push("x86_64".to_string());
    }
    if cmd.has_flag("o") {
        parts.push("GNU/Linux".to_string());
    }
    if parts.is_empty() {
        parts.push("Linux".to_string());
    }
    format!("{}\n", parts.join(" "))
}

fn avg_utilization(node: &DgxNode) -> f64 {
    node.gpus.iter().map(|g| g.utilization_pct as f64).sum::<f64>() / node.gpus.len().max(1) as f64
}

/// Host load follows GPU load: every busy GPU keeps a handful of feeder threads.
fn load_average(node: &DgxNode, cluster: &Cluster) -> String {
    let load = avg_utilization(node) / 100.0 * cluster.hardware.logical_cpus() as f64 * 0.25;
    format!("{:.2}, {:.2}, {:.2}", load, load * 0.97, load * 0.92)
}

fn memory_gib(node: &DgxNode, cluster: &Cluster) -> (u64, u64, u64) {
    let total = cluster.hardware.memory_gib;
    let used = (BASE_USED_GIB + (avg_utilization(node) * 3.2) as u64).min(total);
    let cache = CACHE_GIB.min(total - used);
    (total, used, cache)
}

fn human_gib(gib: u64) -> String {
    if gib >= 1024 {
        format!("{:.1}Ti", gib as f64 / 1024.0)
    } else {
        format!("{}Gi", gib)
    }
}

fn free(cmd: &ParsedCommand, node: &DgxNode, cluster: &Cluster) -> String {
    let (total, used, cache) = memory_gib(node, cluster);
    let free = total - used - cache;
    let available = total - used;
    let fmt = |gib: u64| -> String {
        if cmd.has_any(&["h", "human"]) {
            human_gib(gib)
        } else if cmd.has_any(&["g", "giga"]) {
            gib.to_string()
        } else {
            (gib * KIB_PER_GIB).to_string()
        }
    };
    let mut out = format!(
        "{:>15} {:>11} {:>11} {:>11} {:>11} {:>11}\n",
        "total", "used", "free", "shared", "buff/cache", "available"
    );
    out.push_str(&format!(
        "Mem: {:>14} {:>11} {:>11} {:>11} {:>11} {:>11}\n",
        fmt(total),
        fmt(used),
        fmt(free),
        fmt(0),
        fmt(cache),
        fmt(available)
    ));
    out.push_str(&format!("Swap: {:>13} {:>11} {:>11}\n", fmt(0), fmt(0), fmt(0)));
    out
}

fn lscpu(cluster: &Cluster) -> String {
    let hw = &cluster.hardware;
    let numa = numa_cpu_ranges(cluster);
    let rows: Vec<(&str, String)> = vec![
        ("Architecture", "x86_64".to_string()),
        ("CPU op-mode(s)", "32-bit, 64-bit".to_string()),
        ("Byte Order", "Little Endian".to_string()),
        ("CPU(s)", hw.logical_cpus().to_string()),
        ("On-line CPU(s) list", format!("0-{}", hw.logical_cpus().saturating_sub(1))),
        ("Vendor ID", "GenuineIntel".to_string()),
        ("Model name", hw.cpu_model.clone()),
        ("Thread(s) per core", hw.threads_per_core.to_string()),
        ("Core(s) per socket", hw.cores_per_socket.to_string()),
        ("Socket(s)", hw.sockets.to_string()),
        ("NUMA node(s)", hw.sockets.to_string()),
        ("NUMA node0 CPU(s)", numa[0].clone()),
        ("NUMA node1 CPU(s)", numa[1].clone()),
    ];
    rows.iter().map(|(k, v)| format!("{:<33}{}\n", format!("{}:", k), v)).collect()
}

// ---------------------------------------------------------------------------
// Virtual files
// ---------------------------------------------------------------------------

/// Contents of a file in the simulated filesystem, if it exists.
pub fn read_virtual_file(path: &str, node: &DgxNode, cluster: &Cluster) -> Option<String> {
    let hw = &cluster.hardware;
    match path {
        "/etc/hostname" => return Some(format!("{}\n", node.hostname)),
        "/etc/os-release" => {
            return Some(format!(
                "PRETTY_NAME=\"{}\"\nNAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nVERSION=\"22.04.4 LTS (Jammy Jellyfish)\"\nID=ubuntu\nID_LIKE=debian\nVERSION_CODENAME=jammy\n",
                hw.os_name
            ));
        }
        "/proc/version" => {
            return Some(format!(
                "Linux version {} (buildd@lcy02-amd64-079) (gcc (Ubuntu 11.4.0-1ubuntu1~22.04) 11.4.0) #42-Ubuntu SMP\n",
                hw.kernel
            ));
        }
        "/proc/meminfo" => {
            let (total, used, cache) = memory_gib(node, cluster);
            return Some(format!(
                "MemTotal:       {:>12} kB\nMemFree:        {:>12} kB\nMemAvailable:   {:>12} kB\nCached:         {:>12} kB\nSwapTotal:      {:>12} kB\n",
                total * KIB_PER_GIB,
                (total - used - cache) * KIB_PER_GIB,
                (total - used) * KIB_PER_GIB,
                cache * KIB_PER_GIB,
                0
            ));
        }
        "/proc/driver/nvidia/version" => {
            return Some(format!(
                "NVRM version: NVIDIA UNIX x86_64 Kernel Module  {}  Tue Oct 10 19:03:56 UTC 2023\nGCC version:  gcc version 11.4.0 (Ubuntu 11.4.0-1ubuntu1~22.04)\n",
                hw.driver_version
            ));
        }
        "/etc/slurm/slurm.conf" => {
            let hosts: Vec<String> = cluster.nodes.iter().map(|n| n.hostname.clone()).collect();
            let list = compress_hostlist(&hosts);
            return Some(format!(
                "ClusterName={}\nSlurmctldHost=bcm-head-01\nGresTypes=gpu\nSelectType=select/cons_tres\nNodeName={} CPUs={} Sockets={} CoresPerSocket={} ThreadsPerCore={} RealMemory={} Gres=gpu:{}\nPartitionName=batch Nodes={} Default=YES MaxTime=INFINITE State=UP\n",
                cluster.name,
                list,
                hw.logical_cpus(),
                hw.sockets,
                hw.cores_per_socket,
                hw.threads_per_core,
                hw.memory_gib * 1024,
                hw.gpus_per_node,
                list
            ));
        }
        _ => {}
    }
    if let Some(rest) = path.strip_prefix("/proc/driver/nvidia/gpus/") {
        let bus = rest.strip_suffix("/information")?;
        let gpu = node.gpus.iter().find(|g| {
            let short = g.short_bus_id().to_lowercase();
            bus == short || bus == format!("0000:{}", short)
        })?;
        return Some(format!(
            "Model: \t\t {}\nIRQ:   \t\t {}\nGPU UUID: \t {}\nVideo BIOS: \t 96.00.74.00.01\nBus Type: \t PCIe\nDMA Size: \t 52 bits\nDMA Mask: \t 0xfffffffffffff\nBus Location: \t {}\nDevice Minor: \t {}\nGPU Excluded:\t No\n",
            gpu.name,
            200 + gpu.id,
            gpu.uuid,
            format!("0000:{}", gpu.short_bus_id().to_lowercase()),
            gpu.id
        ));
    }
    if let Some(rest) = path.strip_prefix("/sys/class/infiniband/") {
        let mut parts = rest.split('/');
        let (hca, ports, port, attr) = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
        if ports != "ports" || parts.next().is_some() {
            return None;
        }
        let port = node.hca(hca)?.port(port.parse().ok()?)?;
        return match attr {
            "state" => Some(format!("{}: {}\n", port.state.code(), port.state.to_string().to_uppercase())),
            "phys_state" => Some(format!(
                "{}: {}\n",
                if port.state.physical() == "LinkUp" { 5 } else { 2 },
                port.state.physical()
            )),
            "rate" => Some(format!(
                "{} Gb/sec (4X NDR)\n",
                if port.state == PortState::Active { port.rate_gbps } else { 10 }
            )),
            "lid" => Some(format!("{:#x}\n", port.lid)),
            _ => None,
        };
    }
    None
}

fn cat(cmd: &ParsedCommand, node: &DgxNode, cluster: &Cluster) -> CommandOutput {
    let paths = cmd.operands();
    if paths.is_empty() {
        return CommandOutput::ok("");
    }
    let mut out = String::new();
    let mut failed = false;
    for p in paths {
        match read_virtual_file(p, node, cluster) {
            Some(text) => out.push_str(&text),
            None => {
                failed = true;
                out.push_str(&format!("cat: {}: No such file or directory\n", p));
            }
        }
    }
    if failed { CommandOutput::fail(out, 1) } else { CommandOutput::ok(out) }
}

// ---------------------------------------------------------------------------
// systemctl
// ---------------------------------------------------------------------------

/// Services `systemctl` knows on a DGX node.
const UNITS: &[(&str, &str)] = &[
    ("nvidia-fabricmanager", "NVIDIA fabric manager service"),
    ("nvidia-dcgm", "NVIDIA DCGM service"),
    ("nvidia-persistenced", "NVIDIA Persistence Daemon"),
    ("slurmd", "Slurm node daemon"),
    ("docker", "Docker Application Container Engine"),
    ("openibd", "openibd - configure Mellanox devices"),
    ("nvsm", "NVIDIA System Management"),
];

/// Whether `unit` is running, with an optional status line.
fn unit_state(unit: &str, node: &DgxNode, cluster: &Cluster) -> (bool, Option<String>) {
    match unit {
        "slurmd" if node.slurm_state == SlurmState::Down => {
            (false, Some("slurmd: error: Unable to register with slurm controller".to_string()))
        }
        "nvidia-fabricmanager" => {
            let fabric = FabricState::of(node, cluster.hardware.nvswitches);
            let line = format!(
                "nv-fabricmanager: fabric state {} ({}/{} NVLinks active)",
                fabric.state_word(),
                fabric.active_links,
                fabric.total_links
            );
            (true, Some(line))
        }
        _ => (true, None),
    }
}

fn systemctl(cmd: &ParsedCommand, node: &DgxNode, cluster: &Cluster, now: DateTime<Utc>) -> Result<CommandOutput> {
    let action = cmd
        .subcommand
        .as_deref()
        .ok_or_else(|| SimError::Usage("usage: systemctl <status|is-active> <unit>".to_string()))?;
    let raw = cmd
        .positionals
        .first()
        .ok_or_else(|| SimError::Usage(format!("systemctl {}: unit name required", action)))?;
    let unit = raw.trim_end_matches(".service");
    let Some((_, description)) = UNITS.iter().find(|(u, _)| *u == unit) else {
        return Ok(CommandOutput::fail(format!("Unit {}.service could not be found.\n", unit), 4));
    };
    let (running, line) = unit_state(unit, node, cluster);
    match action {
        "is-active" => Ok(if running {
            CommandOutput::ok("active\n")
        } else {
            CommandOutput::fail("failed\n", 3)
        }),
        "status" => {
            let boot = now - chrono::Duration::seconds(cluster.hardware.uptime_secs as i64);
            let mut out = format!(
                "{} {}.service - {}\n     Loaded: loaded (/lib/systemd/system/{}.service; enabled; vendor preset: enabled)\n",
                if running { "●" } else { "×" },
                unit,
                description,
                unit
            );
            if running {
                out.push_str(&format!(
                    "     Active: active (running) since {}; {} ago\n",
                    boot.format("%a %Y-%m-%d %H:%M:%S UTC"),
                    format_uptime(cluster.hardware.uptime_secs).trim()
                ));
            } else {
                out.push_str(&format!(
                    "     Active: failed (Result: exit-code) since {}\n",
                    now.format("%a %Y-%m-%d %H:%M:%S UTC")
                ));
            }
            if let Some(line) = line {
                out.push_str(&format!("\n{} {}: {}\n", now.format("%b %d %H:%M:%S"), node.hostname, line));
            }
            Ok(if running { CommandOutput::ok(out) } else { CommandOutput::fail(out, 3) })
        }
        other => Err(SimError::Usage(format!("systemctl: unsupported action '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, FaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(store: &ClusterStore, verb: BasicVerb, line: &str) -> Result<CommandOutput> {
        let ctx = CommandContext::new("dgx-03");
        Basic.execute(verb, &parse(line).unwrap(), &ctx, store.cluster())
    }

    #[test]
    fn identity_commands() {
        let store = ClusterStore::superpod("t");
        assert_eq!(run(&store, BasicVerb::Hostname, "hostname").unwrap().output, "dgx-03\n");
        assert_eq!(run(&store, BasicVerb::Hostname, "hostname -I").unwrap().output, "10.10.0.13 \n");
        assert_eq!(run(&store, BasicVerb::Uname, "uname -r").unwrap().output, "5.15.0-1042-nvidia\n");
        assert!(run(&store, BasicVerb::Uname, "uname -a").unwrap().output.starts_with("Linux dgx-03 5.15.0"));
        assert_eq!(run(&store, BasicVerb::Nproc, "nproc").unwrap().output, "224\n");
        assert_eq!(run(&store, BasicVerb::Echo, "echo -n hi there").unwrap().output, "hi there");
    }

    #[test]
    fn free_and_lscpu_agree_with_hardware() {
        let store = ClusterStore::superpod("t");
        let free = run(&store, BasicVerb::Free, "free -g").unwrap();
        assert!(free.output.lines().nth(1).unwrap().contains("2048"));
        let human = run(&store, BasicVerb::Free, "free -h").unwrap();
        assert!(human.output.contains("2.0Ti"));
        let cpu = run(&store, BasicVerb::Lscpu, "lscpu").unwrap();
        assert!(cpu.output.contains("Socket(s):                       2\n"));
        assert!(cpu.output.contains("NUMA node1 CPU(s):               56-111,168-223\n"));
    }

    #[test]
    fn virtual_files() {
        let mut store = ClusterStore::superpod("t");
        crate::fault::inject_port_fault(&mut store, "dgx-03", "mlx5_1", 1, crate::fault::PortFaultKind::LinkDown).unwrap();
        let st = run(&store, BasicVerb::Cat, "cat /sys/class/infiniband/mlx5_1/ports/1/state").unwrap();
        assert_eq!(st.output, "1: DOWN\n");
        let info = run(&store, BasicVerb::Cat, "cat /proc/driver/nvidia/gpus/0000:18:00.0/information").unwrap();
        assert!(info.output.contains("Bus Location: \t 0000:18:00.0\n"));
        let conf = run(&store, BasicVerb::Cat, "cat /etc/slurm/slurm.conf").unwrap();
        assert!(conf.output.contains("NodeName=dgx-[00-07]"));
        let missing = run(&store, BasicVerb::Cat, "cat /etc/hostname /nope").unwrap();
        assert_eq!(missing.exit_code, 1);
        assert_eq!(missing.output, "dgx-03\ncat: /nope: No such file or directory\n");
    }

    #[test]
    fn systemctl_fabricmanager_reports_fabric_state() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-03", 4, FaultKind::NvLink).unwrap();
        let out = run(&store, BasicVerb::Systemctl, "systemctl status nvidia-fabricmanager").unwrap();
        assert!(out.output.contains("active (running)"));
        assert!(out.output.contains("fabric state Degraded (143/144 NVLinks active)"));
        let missing = run(&store, BasicVerb::Systemctl, "systemctl status frobnicator").unwrap();
        assert_eq!(missing.exit_code, 4);
    }

    #[test]
    fn slurmd_fails_on_down_node() {
        let mut store = ClusterStore::superpod("t");
        store.set_slurm_state("dgx-03", SlurmState::Down, Some("psu".into())).unwrap();
        let out = run(&store, BasicVerb::Systemctl, "systemctl is-active slurmd.service").unwrap();
        assert_eq!((out.output.as_str(), out.exit_code), ("failed\n", 3));
    }
}
