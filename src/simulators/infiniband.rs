/// InfiniBand diagnostics: `ibstat`, `ibstatus`, `iblinkinfo`, `perfquery`,
/// `ibdiagnet`, `ibnetdiscover` and `sminfo`.
///
/// The fabric is rail-optimized: HCA `mlx5_i` of every node plugs into leaf
/// switch `i`, port `node index + 1`. Fabric-wide tools walk every node's
/// HCA records, so a port fault on one node shows up in all of them.
use crate::cluster::{Cluster, DgxNode};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::interconnect::{Hca, HcaPort, PortState};
use crate::parser::ParsedCommand;

use super::{current_node, CommandOutput, Simulator};

const SM_LID: u32 = 1;
const SWITCH_GUID_BASE: u64 = 0xb8ce_f603_0070_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IbVerb {
    Ibstat,
    Ibstatus,
    Iblinkinfo,
    Perfquery,
    Ibdiagnet,
    Ibnetdiscover,
    Sminfo,
}

#[derive(Debug, Default)]
pub struct InfiniBand;

impl Simulator for InfiniBand {
    type Verb = IbVerb;

    fn name(&self) -> &'static str {
        "infiniband"
    }

    fn execute(&mut self, verb: IbVerb, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        match verb {
            IbVerb::Ibstat => ibstat(cmd, current_node(ctx, cluster)?),
            IbVerb::Ibstatus => ibstatus(cmd, current_node(ctx, cluster)?),
            IbVerb::Iblinkinfo => Ok(CommandOutput::ok(iblinkinfo(cluster))),
            IbVerb::Perfquery => perfquery(cmd, current_node(ctx, cluster)?, cluster),
            IbVerb::Ibdiagnet => Ok(ibdiagnet(cluster)),
            IbVerb::Ibnetdiscover => Ok(CommandOutput::ok(ibnetdiscover(cluster))),
            IbVerb::Sminfo => Ok(CommandOutput::ok(format!(
                "sminfo: sm lid {} sm guid {:#018x}, activity count 418235 priority 14 state 3 SMINFO_MASTER\n",
                SM_LID, SWITCH_GUID_BASE
            ))),
        }
    }
}

fn leaf_name(rail: u32) -> String {
    format!("leaf-{:02}", rail + 1)
}

fn leaf_guid(rail: u32) -> u64 {
    SWITCH_GUID_BASE + rail as u64
}

fn leaf_lid(rail: u32) -> u32 {
    SM_LID + rail
}

fn rail_of(hca: &Hca) -> u32 {
    hca.id.trim_start_matches("mlx5_").parse().unwrap_or(0)
}

/// Rate as the HCA reports it: a port that is not up trains at the floor.
fn reported_rate(port: &HcaPort) -> u32 {
    if port.state == PortState::Active { port.rate_gbps } else { 10 }
}

fn find_hca<'a>(node: &'a DgxNode, name: &str) -> Result<&'a Hca> {
    node.hca(name).ok_or_else(|| {
        SimError::NotFound(format!("ibpanic: main: stat of IB device '{}' failed: No such file or directory", name))
    })
}

// ---------------------------------------------------------------------------
// Local HCA views
// ---------------------------------------------------------------------------

fn ibstat(cmd: &ParsedCommand, node: &DgxNode) -> Result<CommandOutput> {
    if cmd.has_any(&["l", "list_of_cas"]) {
        return Ok(CommandOutput::ok(node.hcas.iter().map(|h| format!("{}\n", h.id)).collect::<String>()));
    }
    let hcas: Vec<&Hca> = match cmd.subcommand.as_deref() {
        Some(name) => vec![find_hca(node, name)?],
        None => node.hcas.iter().collect(),
    };
    let port_filter: Option<u32> = match cmd.positionals.first() {
        Some(p) => Some(p.parse().map_err(|_| SimError::Usage(format!("ibstat: invalid port '{}'", p)))?),
        None => None,
    };
    let mut out = String::new();
    for hca in hcas {
        if let Some(p) = port_filter {
            let port = hca
                .port(p)
                .ok_or_else(|| SimError::NotFound(format!("ibstat: {} has no port {}", hca.id, p)))?;
            port_block(&mut out, port, "");
            continue;
        }
        out.push_str(&format!("CA '{}'\n", hca.id));
        out.push_str(&format!("\tCA type: {}\n", hca.ca_type));
        out.push_str(&format!("\tNumber of ports: {}\n", hca.ports.len()));
        out.push_str(&format!("\tFirmware version: {}\n", hca.firmware));
        out.push_str("\tHardware version: 0\n");
        out.push_str(&format!("\tNode GUID: {}\n", hca.node_guid));
        out.push_str(&format!("\tSystem image GUID: {}\n", hca.node_guid));
        for port in &hca.ports {
            out.push_str(&format!("\tPort {}:\n", port.port));
            port_block(&mut out, port, "\t\t");
        }
    }
    Ok(CommandOutput::ok(out))
}

fn port_block(out: &mut String, port: &HcaPort, indent: &str) {
    out.push_str(&format!("{}State: {}\n", indent, port.state));
    out.push_str(&format!("{}Physical state: {}\n", indent, port.state.physical()));
    out.push_str(&format!("{}Rate: {}\n", indent, reported_rate(port)));
    out.push_str(&format!("{}Base lid: {}\n", indent, port.lid));
    out.push_str(&format!("{}LMC: 0\n", indent));
    out.push_str(&format!("{}SM lid: {}\n", indent, SM_LID));
    out.push_str(&format!("{}Capability mask: 0xa651e848\n", indent));
    out.push_str(&format!("{}Port GUID: {}\n", indent, port.port_guid));
    out.push_str(&format!("{}Link layer: InfiniBand\n", indent));
}

fn ibstatus(cmd: &ParsedCommand, node: &DgxNode) -> Result<CommandOutput> {
    let hcas: Vec<&Hca> = match cmd.subcommand.as_deref() {
        Some(name) => vec![find_hca(node, name)?],
        None => node.hcas.iter().collect(),
    };
    let mut out = String::new();
    for hca in hcas {
        for port in &hca.ports {
            let guid = port.port_guid.trim_start_matches("0x");
            let gid: Vec<&str> = (0..4).map(|i| guid.get(i * 4..i * 4 + 4).unwrap_or("0000")).collect();
            let phys_code = if port.state.physical() == "LinkUp" { 5 } else { 2 };
            out.push_str(&format!("Infiniband device '{}' port {} status:\n", hca.id, port.port));
            out.push_str(&format!("\tdefault gid:\t fe80:0000:0000:0000:{}\n", gid.join(":")));
            out.push_str(&format!("\tbase lid:\t {:#x}\n", port.lid));
            out.push_str(&format!("\tsm lid:\t\t {:#x}\n", SM_LID));
            out.push_str(&format!(
                "\tstate:\t\t {}: {}\n",
                port.state.code(),
                port.state.to_string().to_uppercase()
            ));
            out.push_str(&format!("\tphys state:\t {}: {}\n", phys_code, port.state.physical()));
            out.push_str(&format!("\trate:\t\t {} Gb/sec (4X NDR)\n", reported_rate(port)));
            out.push_str("\tlink_layer:\t InfiniBand\n\n");
        }
    }
    Ok(CommandOutput::ok(out))
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Find the port owning `lid` anywhere in the fabric.
fn port_by_lid(cluster: &Cluster, lid: u32) -> Option<(&DgxNode, &Hca, &HcaPort)> {
    cluster
        .nodes
        .iter()
        .flat_map(|n| n.ports().map(move |(h, p)| (n, h, p)))
        .find(|(_, _, p)| p.lid == lid)
}

/// Byte counters are derived from the node's GPU load so they move with drift.
fn data_counters(node: &DgxNode, port: &HcaPort) -> (u64, u64) {
    let util: u64 = node.gpus.iter().map(|g| g.utilization_pct as u64).sum();
    let base = port.lid as u64 * 1_048_573;
    let xmit = if port.state == PortState::Active { base + util * 9_876_543 } else { base / 7 };
    (xmit, xmit + util * 1_024)
}

fn perfquery(cmd: &ParsedCommand, local: &DgxNode, cluster: &Cluster) -> Result<CommandOutput> {
    let (node, port) = match cmd.subcommand.as_deref() {
        Some(lid) => {
            let lid: u32 = lid
                .parse()
                .map_err(|_| SimError::Usage(format!("perfquery: invalid lid '{}'", lid)))?;
            let (n, h, p) = port_by_lid(cluster, lid).ok_or_else(|| {
                SimError::NotFound(format!("ibwarn: perfquery: can't resolve destination lid {}", lid))
            })?;
            if let Some(want) = cmd.positionals.first() {
                let want: u32 = want.parse().map_err(|_| SimError::Usage(format!("perfquery: invalid port '{}'", want)))?;
                let p = h
                    .port(want)
                    .ok_or_else(|| SimError::NotFound(format!("perfquery: lid {} has no port {}", lid, want)))?;
                (n, p)
            } else {
                (n, p)
            }
        }
        None => {
            let hca = match cmd.flag_value(&["C"]) {
                Some(name) => find_hca(local, name)?,
                None => local
                    .hcas
                    .first()
                    .ok_or_else(|| SimError::NotFound("perfquery: no IB devices found".to_string()))?,
            };
            let port = hca
                .ports
                .first()
                .ok_or_else(|| SimError::NotFound(format!("perfquery: {} has no ports", hca.id)))?;
            (local, port)
        }
    };
    let extended = cmd.has_any(&["x", "extended"]);
    let c = &port.counters;
    let (xmit, rcv) = data_counters(node, port);
    let mut out = format!(
        "# Port {}counters: Lid {} port {} (CapMask: 0x5A00)\n",
        if extended { "extended " } else { "" },
        port.lid,
        port.port
    );
    let mut field = |name: &str, v: String| {
        let dots = 33usize.saturating_sub(name.len() + 1);
        out.push_str(&format!("{}:{}{}\n", name, ".".repeat(dots), v));
    };
    field("PortSelect", port.port.to_string());
    field("CounterSelect", "0x0000".to_string());
    if !extended {
        field("SymbolErrorCounter", c.symbol_errors.to_string());
        field("LinkErrorRecoveryCounter", "0".to_string());
        field("LinkDownedCounter", c.link_downed.to_string());
        field("PortRcvErrors", c.port_rcv_errors.to_string());
        field("PortRcvRemotePhysicalErrors", "0".to_string());
        field("PortRcvSwitchRelayErrors", "0".to_string());
        field("PortXmitDiscards", c.port_xmit_discards.to_string());
        field("PortXmitConstraintErrors", "0".to_string());
        field("PortRcvConstraintErrors", "0".to_string());
        field("LocalLinkIntegrityErrors", "0".to_string());
        field("ExcessiveBufferOverrunErrors", "0".to_string());
        field("VL15Dropped", "0".to_string());
    }
    field("PortXmitData", (xmit / 4).to_string());
    field("PortRcvData", (rcv / 4).to_string());
    field("PortXmitPkts", (xmit / 4_096).to_string());
    field("PortRcvPkts", (rcv / 4_096).to_string());
    if extended {
        field("PortUnicastXmitPkts", (xmit / 4_096).to_string());
        field("PortUnicastRcvPkts", (rcv / 4_096).to_string());
        field("PortMulticastXmitPkts", "0".to_string());
        field("PortMulticastRcvPkts", "0".to_string());
    }
    Ok(CommandOutput::ok(out))
}

// ---------------------------------------------------------------------------
// Fabric-wide views
// ---------------------------------------------------------------------------

fn iblinkinfo(cluster: &Cluster) -> String {
    let rails = cluster.hardware.hcas_per_node;
    let mut out = String::new();
    for rail in 0..rails {
        out.push_str(&format!(
            "Switch: {:#018x} {} (Quantum-2 QM9700):\n",
            leaf_guid(rail),
            leaf_name(rail)
        ));
        for (slot, node) in cluster.nodes.iter().enumerate() {
            let Some(hca) = node.hca(&format!("mlx5_{}", rail)) else { continue };
            for port in &hca.ports {
                let sw_port = slot + 1;
                if port.state == PortState::Active {
                    out.push_str(&format!(
                        "     {:>4} {:>4}[  ] ==( 4X 106.25 Gbps Active/  LinkUp)==> {:>6} {:>4}[  ] \"{} {}\" ( )\n",
                        leaf_lid(rail),
                        sw_port,
                        port.lid,
                        port.port,
                        node.hostname,
                        hca.id
                    ));
                } else {
                    out.push_str(&format!(
                        "     {:>4} {:>4}[  ] ==(                {}/ {})==>             [  ] \"\" ( )\n",
                        leaf_lid(rail),
                        sw_port,
                        port.state,
                        port.state.physical()
                    ));
                }
            }
        }
    }
    out
}

fn ibnetdiscover(cluster: &Cluster) -> String {
    let rails = cluster.hardware.hcas_per_node;
    let mut out = String::from("#\n# Topology file: generated by ibnetdiscover\n#\n");
    for rail in 0..rails {
        out.push_str(&format!(
            "\nvendid=0x2c9\ndevid=0xd2f2\nswitchguid={:#018x}\nSwitch\t{} \"S-{:016x}\"\t# \"{}\" enhanced port 0 lid {} lmc 0\n",
            leaf_guid(rail),
            cluster.nodes.len().max(1) * 2,
            leaf_guid(rail),
            leaf_name(rail),
            leaf_lid(rail)
        ));
        for (slot, node) in cluster.nodes.iter().enumerate() {
            let Some(hca) = node.hca(&format!("mlx5_{}", rail)) else { continue };
            for port in hca.ports.iter().filter(|p| p.state == PortState::Active) {
                out.push_str(&format!(
                    "[{}]\t\"H-{}\"[{}]({})\t\t# \"{} {}\" lid {} 4xNDR\n",
                    slot + 1,
                    hca.node_guid.trim_start_matches("0x"),
                    port.port,
                    port.port_guid.trim_start_matches("0x"),
                    node.hostname,
                    hca.id,
                    port.lid
                ));
            }
        }
    }
    for (slot, node) in cluster.nodes.iter().enumerate() {
        for hca in &node.hcas {
            let rail = rail_of(hca);
            out.push_str(&format!(
                "\nvendid=0x2c9\ndevid=0x1021\ncaguid={}\nCa\t{} \"H-{}\"\t# \"{} {}\"\n",
                hca.node_guid,
                hca.ports.len(),
                hca.node_guid.trim_start_matches("0x"),
                node.hostname,
                hca.id
            ));
            for port in hca.ports.iter().filter(|p| p.state == PortState::Active) {
                out.push_str(&format!(
                    "[{}]({})\t\"S-{:016x}\"[{}]\t\t# lid {} lmc 0 \"{}\" lid {} 4xNDR\n",
                    port.port,
                    port.port_guid.trim_start_matches("0x"),
                    leaf_guid(rail),
                    slot + 1,
                    port.lid,
                    leaf_name(rail),
                    leaf_lid(rail)
                ));
            }
        }
    }
    out
}

/// Findings a fabric scan reports, split into errors and warnings.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FabricScan {
    pub switches: u32,
    pub cas: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn scan_fabric(cluster: &Cluster) -> FabricScan {
    let mut scan = FabricScan { switches: cluster.hardware.hcas_per_node, ..Default::default() };
    for (slot, node) in cluster.nodes.iter().enumerate() {
        for (hca, port) in node.ports() {
            scan.cas += 1;
            let name = format!("{}/{}/P{}", node.hostname, hca.id, port.port);
            if port.state != PortState::Active {
                scan.errors.push(format!("Link is {}: {} <--> {}/P{}", port.state, name, leaf_name(rail_of(hca)), slot + 1));
            }
            let c = &port.counters;
            if c.symbol_errors > 0 {
                scan.warnings.push(format!("{}: symbol_error_counter={}", name, c.symbol_errors));
            }
            if c.port_rcv_errors > 0 {
                scan.warnings.push(format!("{}: port_rcv_errors={}", name, c.port_rcv_errors));
            }
            if c.link_downed > 0 {
                scan.warnings.push(format!("{}: link_down_counter={}", name, c.link_downed));
            }
        }
    }
    scan
}

fn ibdiagnet(cluster: &Cluster) -> CommandOutput {
    let scan = scan_fabric(cluster);
    let mut out = String::from("Loading IBDIAGNET from: /usr/lib/x86_64-linux-gnu/ibdiagnet1.5.7\n");
    out.push_str("-I- Using port 1 as the local port\n");
    out.push_str("-I- Discovering ... ");
    out.push_str(&format!(
        "{} nodes ({} Switches & {} CA-s) discovered.\n",
        scan.switches as usize + scan.cas,
        scan.switches,
        scan.cas
    ));
    out.push_str("-I- Fabric Discover finished\n\n");
    out.push_str("-I---------------------------------------------------\n-I- Links Check\n-I---------------------------------------------------\n");
    for e in &scan.errors {
        out.push_str(&format!("-E- {}\n", e));
    }
    out.push_str("-I---------------------------------------------------\n-I- PM Counters\n-I---------------------------------------------------\n");
    for w in &scan.warnings {
        out.push_str(&format!("-W- {}\n", w));
    }
    out.push_str("\nSummary\n");
    out.push_str(&format!("-I- {:<24}{:<11}{:<11}\n", "Stage", "Warnings", "Errors"));
    out.push_str(&format!("-I- {:<24}{:<11}{:<11}\n", "Discovery", 0, 0));
    out.push_str(&format!("-I- {:<24}{:<11}{:<11}\n", "Lids Check", 0, 0));
    out.push_str(&format!("-I- {:<24}{:<11}{:<11}\n", "Links Check", 0, scan.errors.len()));
    out.push_str(&format!("-I- {:<24}{:<11}{:<11}\n", "PM Counters", scan.warnings.len(), 0));
    out.push_str(&format!(
        "\n-I- Total {} errors and {} warnings\n",
        scan.errors.len(),
        scan.warnings.len()
    ));
    if scan.errors.is_empty() {
        CommandOutput::ok(out)
    } else {
        CommandOutput::fail(out, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_port_fault, PortFaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(store: &ClusterStore, verb: IbVerb, line: &str) -> Result<CommandOutput> {
        let ctx = CommandContext::new("dgx-02");
        InfiniBand.execute(verb, &parse(line).unwrap(), &ctx, store.cluster())
    }

    fn faulted() -> ClusterStore {
        let mut store = ClusterStore::superpod("t");
        inject_port_fault(&mut store, "dgx-02", "mlx5_3", 1, PortFaultKind::LinkDown).unwrap();
        inject_port_fault(&mut store, "dgx-05", "mlx5_1", 1, PortFaultKind::SymbolErrors).unwrap();
        store
    }

    #[test]
    fn ibstat_shows_port_state() {
        let store = faulted();
        let out = run(&store, IbVerb::Ibstat, "ibstat mlx5_3").unwrap();
        assert!(out.output.starts_with("CA 'mlx5_3'\n"));
        assert!(out.output.contains("\t\tState: Down\n"));
        assert!(out.output.contains("\t\tPhysical state: Polling\n"));
        let healthy = run(&store, IbVerb::Ibstat, "ibstat mlx5_0 1").unwrap();
        assert!(healthy.output.starts_with("State: Active\n"));
        assert!(healthy.output.contains("Rate: 400\n"));
        assert_eq!(run(&store, IbVerb::Ibstat, "ibstat -l").unwrap().output.lines().count(), 8);
        assert!(matches!(run(&store, IbVerb::Ibstat, "ibstat mlx5_9"), Err(SimError::NotFound(_))));
    }

    #[test]
    fn ibstatus_codes() {
        let store = faulted();
        let out = run(&store, IbVerb::Ibstatus, "ibstatus mlx5_3").unwrap();
        assert!(out.output.contains("state:\t\t 1: DOWN"));
        let ok = run(&store, IbVerb::Ibstatus, "ibstatus mlx5_0").unwrap();
        assert!(ok.output.contains("state:\t\t 4: ACTIVE"));
        assert!(ok.output.contains("phys state:\t 5: LinkUp"));
    }

    #[test]
    fn perfquery_remote_lid_reads_that_ports_counters() {
        let store = faulted();
        // dgx-05 mlx5_1: lid 100 + 5*16 + 1
        let out = run(&store, IbVerb::Perfquery, "perfquery 181 1").unwrap();
        assert!(out.output.contains("SymbolErrorCounter:..............1204\n"));
        assert!(out.output.contains("PortRcvErrors:...................37\n"));
        let local = run(&store, IbVerb::Perfquery, "perfquery").unwrap();
        assert!(local.output.contains("SymbolErrorCounter:..............0\n"));
        assert!(matches!(run(&store, IbVerb::Perfquery, "perfquery 9999"), Err(SimError::NotFound(_))));
    }

    #[test]
    fn ibdiagnet_reports_both_faults() {
        let store = faulted();
        let out = run(&store, IbVerb::Ibdiagnet, "ibdiagnet").unwrap();
        assert_eq!(out.exit_code, 1);
        assert!(out.output.contains("72 nodes (8 Switches & 64 CA-s)"));
        assert!(out.output.contains("-E- Link is Down: dgx-02/mlx5_3/P1"));
        assert!(out.output.contains("-W- dgx-05/mlx5_1/P1: symbol_error_counter=1204"));
        assert!(out.output.contains("Total 1 errors and 3 warnings"));
        let clean = ClusterStore::superpod("t");
        assert!(run(&clean, IbVerb::Ibdiagnet, "ibdiagnet").unwrap().success());
    }

    #[test]
    fn linkinfo_shows_down_port_on_its_rail() {
        let store = faulted();
        let out = run(&store, IbVerb::Iblinkinfo, "iblinkinfo").unwrap();
        assert_eq!(out.output.matches("Switch: ").count(), 8);
        assert_eq!(out.output.matches("Down/ Polling").count(), 1);
        assert!(out.output.contains("\"dgx-07 mlx5_7\""));
    }
}
