/// Benchmarks: NCCL `all_reduce_perf`, perftest `ib_write_bw` and `gpu_burn`.
///
/// Results come from the interconnect bandwidth model scaled by the state of
/// the links involved, so a downed NVLink shows up as lower bus bandwidth and
/// a port with symbol errors as lower RDMA throughput.
use crate::cluster::{Cluster, DgxNode};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::gpu::{Gpu, HealthStatus};
use crate::interconnect::{all_reduce, AllReduceAlgorithm, HcaPort, PortState};
use crate::parser::ParsedCommand;

use super::{current_node, node_index, CommandOutput, Simulator};

/// Fraction of line rate perftest reaches on a clean NDR link.
const RDMA_EFFICIENCY: f64 = 0.976;
/// Throughput left once a link starts retransmitting.
const SYMBOL_ERROR_PENALTY: f64 = 0.6;
const FP32_GFLOPS: f64 = 51_200.0;
const FP64_GFLOPS: f64 = 25_600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchVerb {
    AllReducePerf,
    IbWriteBw,
    GpuBurn,
}

#[derive(Debug, Default)]
pub struct Benchmarks;

impl Simulator for Benchmarks {
    type Verb = BenchVerb;

    fn name(&self) -> &'static str {
        "benchmarks"
    }

    fn execute(&mut self, verb: BenchVerb, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        let node = current_node(ctx, cluster)?;
        match verb {
            BenchVerb::AllReducePerf => all_reduce_perf(cmd, ctx, node, cluster),
            BenchVerb::IbWriteBw => ib_write_bw(cmd, node, cluster),
            BenchVerb::GpuBurn => gpu_burn(cmd, node, cluster),
        }
    }
}

/// Parse `8`, `64K`, `128M` or `1G` into bytes.
pub fn parse_size(text: &str) -> Option<u64> {
    let (digits, shift) = match text.chars().last()? {
        'K' | 'k' => (&text[..text.len() - 1], 10),
        'M' | 'm' => (&text[..text.len() - 1], 20),
        'G' | 'g' => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    digits.parse::<u64>().ok().map(|n| n << shift)
}

// ---------------------------------------------------------------------------
// all_reduce_perf
// ---------------------------------------------------------------------------

/// Pid printed in the rank table; stable per node.
fn bench_pid(node: &DgxNode) -> Result<u32> {
    Ok(31_400 + node_index(node)? as u32 * 7)
}

fn all_reduce_perf(cmd: &ParsedCommand, ctx: &CommandContext, node: &DgxNode, cluster: &Cluster) -> Result<CommandOutput> {
    let size_flag = |names: &[&str], default: u64| -> Result<u64> {
        match cmd.flag_value(names) {
            Some(v) => parse_size(v).ok_or_else(|| SimError::Usage(format!("invalid size '{}'", v))),
            None => Ok(default),
        }
    };
    let min_bytes = size_flag(&["b", "minbytes"], 32 << 20)?;
    let max_bytes = size_flag(&["e", "maxbytes"], 32 << 20)?;
    let factor: u64 = match cmd.flag_value(&["f", "stepfactor"]) {
        Some(v) => v.parse().ok().filter(|f| *f >= 2).ok_or_else(|| SimError::Usage(format!("invalid step factor '{}'", v)))?,
        None => 2,
    };
    let ngpus: usize = match cmd.flag_value(&["g", "ngpus"]) {
        Some(v) => v.parse().map_err(|_| SimError::Usage(format!("invalid GPU count '{}'", v)))?,
        None => 1,
    };
    let algorithm: AllReduceAlgorithm = match ctx.env.get("NCCL_ALGO") {
        Some(v) => v.parse::<AllReduceAlgorithm>().map_err(|bad| SimError::Usage(format!("NCCL_ALGO={} is not a supported algorithm (Ring, Tree)", bad)))?,
        None => AllReduceAlgorithm::Ring,
    };
    if min_bytes == 0 || min_bytes > max_bytes {
        return Err(SimError::Usage(format!("invalid size range {} - {}", min_bytes, max_bytes)));
    }
    if ngpus == 0 || ngpus > node.gpus.len() {
        return Ok(CommandOutput::fail(
            format!(
                "{}: Test NCCL failure common.cu:958 'invalid usage (run with NCCL_DEBUG=WARN for details)'\n .. {} pid {}: Test failure common.cu:842\n",
                node.hostname,
                node.hostname,
                bench_pid(node)?
            ),
            1,
        ));
    }
    let gpus: Vec<&Gpu> = node.gpus.iter().take(ngpus).collect();
    let pid = bench_pid(node)?;

    let mut out = format!(
        "# nThread 1 nGpus {} minBytes {} maxBytes {} step: {}(factor) warmup iters: 5 iters: 20 agg iters: 1 validation: 1 graph: 0\n#\n# Algorithm {}\n# Using devices\n",
        ngpus, min_bytes, max_bytes, factor, algorithm
    );
    for (rank, g) in gpus.iter().enumerate() {
        let bus = g.short_bus_id();
        out.push_str(&format!(
            "#  Rank {:2} Group  0 Pid {:6} on {:>10} device {:2} [0x{}] {}\n",
            rank,
            pid,
            node.hostname,
            g.id,
            bus.get(..2).unwrap_or(bus).to_lowercase(),
            g.name
        ));
    }
    if let Some(bad) = gpus.iter().find(|g| g.health() == HealthStatus::Critical) {
        out.push_str(&format!(
            "{}: Test CUDA failure common.cu:892 'unknown error'\n .. {} pid {}: Test failure common.cu:842 (GPU {})\n",
            node.hostname, node.hostname, pid, bad.id
        ));
        return Ok(CommandOutput::fail(out, 1));
    }

    // Every algorithm runs at the pace of its slowest member.
    let hw = &cluster.hardware;
    let fraction = gpus
        .iter()
        .map(|g| g.active_nvlinks() as f64 / g.nvlinks.len().max(1) as f64)
        .fold(1.0_f64, f64::min);
    for g in gpus.iter().filter(|g| g.down_nvlinks() > 0) {
        out.push_str(&format!(
            "# Warning: GPU {} has {}/{} NVLinks active\n",
            g.id,
            g.active_nvlinks(),
            g.nvlinks.len()
        ));
    }
    let bandwidth = hw.nvlink.bandwidth_gb_s * fraction;

    out.push_str("#\n#                                                              out-of-place                       in-place\n");
    out.push_str("#       size         count      type   redop    root     time   algbw   busbw #wrong     time   algbw   busbw #wrong\n");
    out.push_str("#        (B)    (elements)                               (us)  (GB/s)  (GB/s)            (us)  (GB/s)  (GB/s)\n");

    let mut bus_total = 0.0;
    let mut rows = 0;
    let mut size = min_bytes;
    while size <= max_bytes {
        let stats = all_reduce(ngpus, size, bandwidth, hw.nvlink.latency_us, algorithm);
        out.push_str(&format!(
            "{:>12}  {:>12}     float     sum      -1  {:>7.2}  {:>6.2}  {:>6.2}      0  {:>7.2}  {:>6.2}  {:>6.2}      0\n",
            size,
            size / 4,
            stats.time_us,
            stats.alg_bandwidth_gb_s,
            stats.bus_bandwidth_gb_s,
            stats.time_us,
            stats.alg_bandwidth_gb_s,
            stats.bus_bandwidth_gb_s
        ));
        bus_total += stats.bus_bandwidth_gb_s;
        rows += 1;
        size = match size.checked_mul(factor) {
            Some(next) => next,
            None => break,
        };
    }
    out.push_str(&format!(
        "# Out of bounds values : 0 OK\n# Avg bus bandwidth    : {:.3}\n#\n",
        bus_total / rows.max(1) as f64
    ));
    Ok(CommandOutput::ok(out))
}

// ---------------------------------------------------------------------------
// ib_write_bw
// ---------------------------------------------------------------------------

fn port_factor(port: &HcaPort) -> f64 {
    if port.counters.symbol_errors > 0 || port.counters.port_rcv_errors > 0 {
        SYMBOL_ERROR_PENALTY
    } else {
        1.0
    }
}

fn ib_write_bw(cmd: &ParsedCommand, node: &DgxNode, cluster: &Cluster) -> Result<CommandOutput> {
    let device = cmd.flag_value(&["d", "ib-dev"]).unwrap_or("mlx5_0");
    let port_num: u32 = match cmd.flag_value(&["i", "ib-port"]) {
        Some(v) => v.parse().map_err(|_| SimError::Usage(format!("invalid port '{}'", v)))?,
        None => 1,
    };
    let msg_size = match cmd.flag_value(&["s", "size"]) {
        Some(v) => parse_size(v).ok_or_else(|| SimError::Usage(format!("invalid size '{}'", v)))?,
        None => 65_536,
    };
    let iterations: u64 = match cmd.flag_value(&["n", "iters"]) {
        Some(v) => v.parse().map_err(|_| SimError::Usage(format!("invalid iteration count '{}'", v)))?,
        None => 5_000,
    };

    let local = node
        .hca(device)
        .and_then(|h| h.port(port_num))
        .ok_or_else(|| SimError::NotFound(format!(" Unable to find the Infiniband/RoCE device: {}", device)))?;
    // Without a server argument the run loops back through the local port.
    let peer = match cmd.operands().first() {
        Some(host) => {
            let remote = cluster
                .node_by_address(host)
                .ok_or_else(|| SimError::NotFound(format!("Couldn't connect to {}:18515\nUnable to open file descriptor for socket connection", host)))?;
            remote
                .hca(device)
                .and_then(|h| h.port(port_num))
                .ok_or_else(|| SimError::NotFound(format!("Couldn't connect to {}:18515", host)))?
        }
        None => local,
    };
    for port in [local, peer] {
        if port.state != PortState::Active {
            return Ok(CommandOutput::fail(
                format!(
                    " Port number {} state is {}\n Couldn't set the link layer\n Couldn't get context for the device\n",
                    port_num, port.state
                ),
                1,
            ));
        }
    }

    let line_mb_s = cluster.hardware.infiniband.bandwidth_gb_s * 1_000.0;
    let avg_mb_s = line_mb_s * RDMA_EFFICIENCY * port_factor(local).min(port_factor(peer));
    let peak_mb_s = avg_mb_s * 1.0001;
    let msg_rate_mpps = avg_mb_s * 1_000_000.0 / msg_size.max(1) as f64 / 1_000_000.0;
    let gbits = cmd.has_flag("report_gbits");
    let (unit, peak, avg) = if gbits {
        ("Gb/sec", peak_mb_s * 8.0 / 1_000.0, avg_mb_s * 8.0 / 1_000.0)
    } else {
        ("MB/sec", peak_mb_s, avg_mb_s)
    };

    let rule = "-".repeat(87);
    let mut out = format!(
        "{rule}\n                    RDMA_Write BW Test\n Dual-port       : OFF\t\tDevice         : {device}\n Number of qps   : 1\t\tTransport type : IB\n Connection type : RC\t\tUsing SRQ      : OFF\n PCIe relax order: ON\n TX depth        : 128\n CQ Moderation   : 100\n Mtu             : 4096[B]\n Link type       : IB\n Max inline data : 0[B]\n rdma_cm QPs\t : OFF\n Data ex. method : Ethernet\n{rule}\n local address: LID {:#06x} QPN 0x0122 PSN 0x5a1c03 RKey 0x1fff00 VAddr 0x007f3c2a600000\n remote address: LID {:#06x} QPN 0x0123 PSN 0x9e1f47 RKey 0x1fff01 VAddr 0x007f52c8e00000\n{rule}\n",
        local.lid, peer.lid
    );
    out.push_str(&format!(
        " #bytes     #iterations    BW peak[{unit}]    BW average[{unit}]   MsgRate[Mpps]\n {:<10} {:<10}       {:.2}            {:.2}\t\t   {:.6}\n{rule}\n",
        msg_size, iterations, peak, avg, msg_rate_mpps
    ));
    Ok(CommandOutput::ok(out))
}

// ---------------------------------------------------------------------------
// gpu_burn
// ---------------------------------------------------------------------------

/// Why a GPU fails the burn, if it does.
fn burn_verdict(gpu: &Gpu) -> Option<&'static str> {
    if gpu.xid_errors.iter().any(|x| x.code == 79) {
        Some("Couldn't init a GPU test: unknown error")
    } else if gpu.ecc.volatile.double_bit > 0 || gpu.health() == HealthStatus::Critical {
        Some("compute errors detected")
    } else {
        None
    }
}

fn gpu_burn(cmd: &ParsedCommand, node: &DgxNode, cluster: &Cluster) -> Result<CommandOutput> {
    let seconds: u64 = match cmd.operands().first() {
        Some(s) => s.parse().map_err(|_| SimError::Usage(format!("Syntax error near '{}'", s)))?,
        None => 10,
    };
    let doubles = cmd.has_flag("d");
    let peak = if doubles { FP64_GFLOPS } else { FP32_GFLOPS };
    let hw = &cluster.hardware;

    let mut out = format!("Burning for {} seconds.\n", seconds);
    for g in &node.gpus {
        out.push_str(&format!("GPU {}: {} (UUID: {})\n", g.id, g.name, g.uuid));
    }
    for g in node.gpus.iter().filter(|g| burn_verdict(g).is_none()) {
        let use_mib = g.memory_total_mib * 9 / 10;
        out.push_str(&format!(
            "Initialized device {} with {} MB of memory ({} MB available, using {} MB of global memory)\n",
            g.id,
            g.memory_total_mib,
            g.memory_total_mib.saturating_sub(g.memory_used_mib),
            use_mib
        ));
    }

    let proc_rates: Vec<String> = node
        .gpus
        .iter()
        .map(|g| match burn_verdict(g) {
            Some(_) => "0 (0 Gflop/s)".to_string(),
            None => {
                let rate = peak * g.sm_clock_mhz as f64 / hw.sm_clock_mhz.max(1) as f64;
                let iters = (rate * seconds as f64 / 14.0) as u64;
                format!("{} ({:.0} Gflop/s)", iters, rate)
            }
        })
        .collect();
    let errors: Vec<String> = node
        .gpus
        .iter()
        .map(|g| {
            if g.ecc.volatile.double_bit > 0 {
                (g.ecc.volatile.double_bit * 1_712).to_string()
            } else {
                "0".to_string()
            }
        })
        .collect();
    let temps: Vec<String> = node
        .gpus
        .iter()
        .map(|g| format!("{} C", g.temperature_c.max(hw.idle_temperature_c + 38)))
        .collect();
    out.push_str(&format!(
        "100.0%  proc'd: {}   errors: {}   temps: {} \n",
        proc_rates.join(" - "),
        errors.join(" - "),
        temps.join(" - ")
    ));
    out.push_str("Killing processes.. done\n\n");
    out.push_str(&format!("Tested {} GPUs:\n", node.gpus.len()));
    let mut faulty = 0;
    for g in &node.gpus {
        match burn_verdict(g) {
            Some(why) => {
                faulty += 1;
                out.push_str(&format!("\tGPU {}: FAULTY ({})\n", g.id, why));
            }
            None => out.push_str(&format!("\tGPU {}: OK\n", g.id)),
        }
    }
    Ok(if faulty > 0 { CommandOutput::fail(out, 1) } else { CommandOutput::ok(out) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, inject_port_fault, FaultKind, PortFaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(store: &ClusterStore, verb: BenchVerb, line: &str) -> Result<CommandOutput> {
        let ctx = CommandContext::new("dgx-00");
        Benchmarks.execute(verb, &parse(line).unwrap(), &ctx, store.cluster())
    }

    fn avg_busbw(out: &str) -> f64 {
        out.lines()
            .find_map(|l| l.strip_prefix("# Avg bus bandwidth    : "))
            .and_then(|v| v.trim().parse().ok())
            .unwrap()
    }

    #[test]
    fn sizes_parse_with_suffixes() {
        assert_eq!(parse_size("8"), Some(8));
        assert_eq!(parse_size("128M"), Some(128 << 20));
        assert_eq!(parse_size("1G"), Some(1 << 30));
        assert_eq!(parse_size("x"), None);
    }

    #[test]
    fn all_reduce_sweeps_sizes() {
        let store = ClusterStore::superpod("t");
        let out = run(&store, BenchVerb::AllReducePerf, "all_reduce_perf -b 8 -e 128M -f 2 -g 8").unwrap();
        assert!(out.success());
        // 8 B .. 128 MiB doubling is 25 rows
        assert_eq!(out.output.lines().filter(|l| !l.starts_with('#')).count(), 25);
        assert_eq!(out.output.matches("Rank").count(), 8);
    }

    #[test]
    fn nvlink_fault_lowers_bus_bandwidth() {
        let mut store = ClusterStore::superpod("t");
        let healthy = avg_busbw(&run(&store, BenchVerb::AllReducePerf, "all_reduce_perf -b 1G -e 1G -g 8").unwrap().output);
        assert!(healthy > 440.0 && healthy <= 450.0);
        inject_fault(&mut store, "dgx-00", 3, FaultKind::NvLink).unwrap();
        let out = run(&store, BenchVerb::AllReducePerf, "all_reduce_perf -b 1G -e 1G -g 8").unwrap();
        assert!(out.output.contains("GPU 3 has 17/18 NVLinks active"));
        assert!(avg_busbw(&out.output) < healthy - 20.0);
    }

    #[test]
    fn fallen_gpu_fails_collective_and_burn() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 0, FaultKind::Xid).unwrap();
        let nccl = run(&store, BenchVerb::AllReducePerf, "all_reduce_perf -g 8").unwrap();
        assert_eq!(nccl.exit_code, 1);
        let burn = run(&store, BenchVerb::GpuBurn, "gpu_burn 30").unwrap();
        assert_eq!(burn.exit_code, 1);
        assert!(burn.output.contains("GPU 0: FAULTY"));
        assert!(burn.output.contains("\tGPU 1: OK"));
    }

    #[test]
    fn nccl_algo_picks_the_collective() {
        let store = ClusterStore::superpod("t");
        let line = parse("all_reduce_perf -b 1G -e 1G -g 8").unwrap();
        let ring = run(&store, BenchVerb::AllReducePerf, "all_reduce_perf -b 1G -e 1G -g 8").unwrap();
        assert!(ring.output.contains("# Algorithm Ring"));

        let mut ctx = CommandContext::new("dgx-00");
        ctx.env.insert("NCCL_ALGO".to_string(), "tree".to_string());
        let tree = Benchmarks.execute(BenchVerb::AllReducePerf, &line, &ctx, store.cluster()).unwrap();
        assert!(tree.output.contains("# Algorithm Tree"));
        assert!(avg_busbw(&tree.output) < avg_busbw(&ring.output));

        ctx.env.insert("NCCL_ALGO".to_string(), "CollnetDirect".to_string());
        let err = Benchmarks.execute(BenchVerb::AllReducePerf, &line, &ctx, store.cluster()).unwrap_err();
        assert!(matches!(err, SimError::Usage(_)));
    }

    #[test]
    fn odd_gpu_records_do_not_panic() {
        let store = ClusterStore::superpod("t");
        let mut cluster = store.cluster().clone();
        let gpu = &mut cluster.nodes[0].gpus[0];
        gpu.bus_id = "00000000:1".to_string();
        gpu.memory_used_mib = gpu.memory_total_mib + 1;
        let ctx = CommandContext::new("dgx-00");

        let nccl = Benchmarks.execute(BenchVerb::AllReducePerf, &parse("all_reduce_perf -g 8").unwrap(), &ctx, &cluster).unwrap();
        assert!(nccl.output.contains("device  0 [0x1]"), "{}", nccl.output);
        let burn = Benchmarks.execute(BenchVerb::GpuBurn, &parse("gpu_burn 30").unwrap(), &ctx, &cluster).unwrap();
        assert!(burn.output.contains("(0 MB available"), "{}", burn.output);
    }

    #[test]
    fn ib_write_bw_follows_port_state() {
        let mut store = ClusterStore::superpod("t");
        let clean = run(&store, BenchVerb::IbWriteBw, "ib_write_bw -d mlx5_0 dgx-01").unwrap();
        assert!(clean.output.contains("48800.00"));
        inject_port_fault(&mut store, "dgx-01", "mlx5_0", 1, PortFaultKind::SymbolErrors).unwrap();
        let slow = run(&store, BenchVerb::IbWriteBw, "ib_write_bw -d mlx5_0 dgx-01").unwrap();
        assert!(slow.output.contains("29280.00"));
        inject_port_fault(&mut store, "dgx-00", "mlx5_0", 1, PortFaultKind::LinkDown).unwrap();
        let down = run(&store, BenchVerb::IbWriteBw, "ib_write_bw -d mlx5_0").unwrap();
        assert_eq!(down.exit_code, 1);
        assert!(down.output.contains("state is Down"));
    }
}
