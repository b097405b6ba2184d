/// NVIDIA/Mellanox NIC firmware tools: `mst`, `mlxconfig`, `mlxlink`,
/// `mlxfwmanager` and `flint`.
///
/// Devices may be named as `mlx5_N`, `/dev/mst/mt4129_pciconfN` or by PCI
/// address; all three resolve to the same HCA record ibstat reads.
use crate::cluster::{Cluster, DgxNode};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::interconnect::{Hca, HcaPort, PortState};
use crate::parser::ParsedCommand;

use super::{current_node, render_table, CommandOutput, Simulator};

const PART_NUMBER: &str = "MCX75310AAS-NEAT_Ax";
const PSID: &str = "MT_0000000838";
const DESCRIPTION: &str = "NVIDIA ConnectX-7 HHHL Adapter card; 400GbE / NDR IB (default mode); Single-port OSFP; PCIe 5.0 x16";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlxVerb {
    Mst,
    Mlxconfig,
    Mlxlink,
    Mlxfwmanager,
    Flint,
}

#[derive(Debug, Default)]
pub struct Mellanox;

impl Simulator for Mellanox {
    type Verb = MlxVerb;

    fn name(&self) -> &'static str {
        "mellanox"
    }

    fn execute(&mut self, verb: MlxVerb, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        let node = current_node(ctx, cluster)?;
        match verb {
            MlxVerb::Mst => match cmd.subcommand.as_deref() {
                Some("status") => Ok(CommandOutput::ok(mst_status(node, cmd.has_flag("v")))),
                Some("start") => Ok(CommandOutput::ok(
                    "Starting MST (Mellanox Software Tools) driver set\nLoading MST PCI module - Success\nLoading MST PCI configuration module - Success\nCreate devices\n",
                )),
                _ => Err(SimError::Usage("usage: mst <start|status [-v]>".to_string())),
            },
            MlxVerb::Mlxconfig => {
                let hca = device(cmd, node, "mlxconfig")?;
                match cmd.subcommand.as_deref() {
                    Some("query") | Some("q") => Ok(CommandOutput::ok(mlxconfig_query(hca))),
                    Some("set") => Err(SimError::Usage(
                        "mlxconfig: configuration changes are disabled on this system".to_string(),
                    )),
                    _ => Err(SimError::Usage("usage: mlxconfig -d <device> query".to_string())),
                }
            }
            MlxVerb::Mlxlink => {
                let hca = device(cmd, node, "mlxlink")?;
                let port = hca
                    .ports
                    .first()
                    .ok_or_else(|| SimError::NotFound(format!("mlxlink: {} has no ports", hca.id)))?;
                Ok(CommandOutput::ok(mlxlink(port, cmd.has_any(&["c", "show_counters"]))))
            }
            MlxVerb::Mlxfwmanager => Ok(CommandOutput::ok(mlxfwmanager(node))),
            MlxVerb::Flint => {
                let hca = device(cmd, node, "flint")?;
                match cmd.subcommand.as_deref() {
                    Some("query") | Some("q") => Ok(CommandOutput::ok(flint_query(hca))),
                    _ => Err(SimError::Usage("usage: flint -d <device> query".to_string())),
                }
            }
        }
    }
}

fn mst_path(hca: &Hca) -> String {
    format!("/dev/mst/mt4129_pciconf{}", hca.id.trim_start_matches("mlx5_"))
}

/// Resolve `-d <dev>` in any of the accepted spellings.
pub fn resolve_device<'a>(node: &'a DgxNode, dev: &str) -> Option<&'a Hca> {
    node.hcas.iter().find(|h| {
        h.id == dev
            || mst_path(h) == dev
            || mst_path(h).trim_start_matches("/dev/mst/") == dev
            || h.bus_id == dev
            || h.bus_id.trim_start_matches("0000:") == dev
    })
}

fn device<'a>(cmd: &ParsedCommand, node: &'a DgxNode, tool: &str) -> Result<&'a Hca> {
    let dev = cmd
        .flag_value(&["d", "dev", "device"])
        .ok_or_else(|| SimError::Usage(format!("-E- {}: missing device, use -d <device>", tool)))?;
    resolve_device(node, dev).ok_or_else(|| {
        SimError::NotFound(format!("-E- Failed to open device: {}. No such file or directory (MTCR)", dev))
    })
}

fn mst_status(node: &DgxNode, verbose: bool) -> String {
    if verbose {
        let rows: Vec<Vec<String>> = node
            .hcas
            .iter()
            .map(|h| {
                vec![
                    "ConnectX7(rev:0)".to_string(),
                    mst_path(h),
                    h.bus_id.trim_start_matches("0000:").to_string(),
                    format!("{},{}", h.id, h.id.replace("mlx5_", "ib")),
                    if h.id.ends_with(['0', '1', '2', '3']) { "0" } else { "1" }.to_string(),
                ]
            })
            .collect();
        let mut out = String::from("MST modules:\n------------\n    MST PCI module is not loaded\n    MST PCI configuration module loaded\nPCI devices:\n------------\n");
        out.push_str(&render_table(&["DEVICE_TYPE", "MST", "PCI", "RDMA", "NUMA"], &rows, 4));
        return out;
    }
    let mut out = String::from(
        "MST modules:\n------------\n    MST PCI module is not loaded\n    MST PCI configuration module loaded\n\nMST devices:\n------------\n",
    );
    for h in &node.hcas {
        out.push_str(&format!("{:<33}- PCI configuration cycles access.\n", mst_path(h)));
        out.push_str(&format!(
            "{:33}domain:bus:dev.fn={} addr.reg=88 data.reg=92 cr_bar.gw_offset=-1\n",
            "", h.bus_id
        ));
        out.push_str(&format!("{:33}Chip revision is: 00\n", ""));
    }
    out
}

fn mlxconfig_query(hca: &Hca) -> String {
    let mut out = format!(
        "\nDevice #1:\n----------\n\nDevice type:    ConnectX7\nName:           {}\nDescription:    {}\nDevice:         {}\n\n",
        PART_NUMBER,
        DESCRIPTION,
        mst_path(hca)
    );
    out.push_str(&format!("{:<53}{}\n", "Configurations:", "Next Boot"));
    for (k, v) in [
        ("MEMIC_BAR_SIZE", "0"),
        ("LINK_TYPE_P1", "IB(1)"),
        ("SRIOV_EN", "False(0)"),
        ("NUM_OF_VFS", "0"),
        ("ADVANCED_PCI_SETTINGS", "False(0)"),
        ("PCI_WR_ORDERING", "per_mkey(0)"),
        ("ATS_ENABLED", "True(1)"),
        ("ROCE_ADAPTIVE_ROUTING_EN", "True(1)"),
    ] {
        out.push_str(&format!("         {:<44}{}\n", k, v));
    }
    out
}

/// Link troubleshooting verdict mlxlink prints for a port.
fn recommendation(port: &HcaPort) -> (u32, &'static str) {
    let c = &port.counters;
    if port.state != PortState::Active {
        (1024, "Signal not detected. Check the cable connection and the remote port")
    } else if c.symbol_errors > 0 || c.port_rcv_errors > 0 {
        (14, "Bad signal integrity. Clean the connectors or replace the cable")
    } else {
        (0, "No issue was observed")
    }
}

fn kv(out: &mut String, key: &str, value: impl std::fmt::Display) {
    out.push_str(&format!("{:<32}: {}\n", key, value));
}

fn section(out: &mut String, title: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&format!("{}\n{}\n", title, "-".repeat(title.len())));
}

fn mlxlink(port: &HcaPort, counters: bool) -> String {
    let active = port.state == PortState::Active;
    let up_or_na = |v: &'static str| if active { v } else { "N/A" };
    let mut out = String::new();
    section(&mut out, "Operational Info");
    kv(&mut out, "State", if active { "Active" } else { "Polling" });
    kv(&mut out, "Physical state", port.state.physical());
    kv(&mut out, "Speed", up_or_na("IB-NDR"));
    kv(&mut out, "Width", up_or_na("4x"));
    kv(&mut out, "FEC", up_or_na("Standard_RS-FEC - (544,514)"));
    kv(&mut out, "Loopback Mode", "No Loopback");
    kv(&mut out, "Auto Negotiation", "ON");
    section(&mut out, "Supported Info");
    kv(&mut out, "Enabled Link Speed", "0x00000080 (NDR)");
    kv(&mut out, "Supported Cable Speed", "0x000000c0 (NDR,HDR)");
    let (opcode, advice) = recommendation(port);
    section(&mut out, "Troubleshooting Info");
    kv(&mut out, "Status Opcode", opcode);
    kv(&mut out, "Group Opcode", if opcode == 0 { "N/A" } else { "PHY FW" });
    kv(&mut out, "Recommendation", advice);
    if counters {
        let c = &port.counters;
        let errors = c.symbol_errors + c.port_rcv_errors;
        section(&mut out, "Physical Counters and BER Info");
        kv(&mut out, "Time Since Last Clear [Min]", 17_537);
        kv(&mut out, "Effective Physical Errors", errors);
        if errors == 0 {
            kv(&mut out, "Effective Physical BER", "15E-255");
            kv(&mut out, "Raw Physical BER", "1E-12");
        } else {
            kv(&mut out, "Effective Physical BER", format!("{}E-12", errors.min(999)));
            kv(&mut out, "Raw Physical BER", "4E-8");
        }
        kv(&mut out, "Link Down Counter", c.link_downed);
        kv(&mut out, "Link Error Recovery Counter", 0);
    }
    out
}

fn mlxfwmanager(node: &DgxNode) -> String {
    let mut out = String::from("Querying Mellanox devices firmware ...\n");
    for (i, h) in node.hcas.iter().enumerate() {
        out.push_str(&format!("\nDevice #{}:\n----------\n\n", i + 1));
        out.push_str("  Device Type:      ConnectX7\n");
        out.push_str(&format!("  Part Number:      {}\n", PART_NUMBER));
        out.push_str(&format!("  Description:      {}\n", DESCRIPTION));
        out.push_str(&format!("  PSID:             {}\n", PSID));
        out.push_str(&format!("  PCI Device Name:  {}\n", mst_path(h)));
        out.push_str(&format!("  Base GUID:        {}\n", h.node_guid.trim_start_matches("0x")));
        out.push_str("  Versions:         Current        Available\n");
        out.push_str(&format!("     FW             {:<15}N/A\n", h.firmware));
        out.push_str("     PXE            3.7.0201       N/A\n");
        out.push_str("     UEFI           14.32.0012     N/A\n\n");
        out.push_str("  Status:           No matching image found\n");
    }
    out
}

fn flint_query(hca: &Hca) -> String {
    let guid = hca.node_guid.trim_start_matches("0x");
    format!(
        "Image type:            FS4\nFW Version:            {fw}\nFW Release Date:       1.11.2023\nProduct Version:       {fw}\nRom Info:              type=UEFI version=14.32.12 cpu=AMD64,AARCH64\n                       type=PXE version=3.7.201 cpu=AMD64\nDescription:           UID                GuidsNumber\nBase GUID:             {guid}     4\nImage VSD:             N/A\nDevice VSD:            N/A\nPSID:                  {psid}\nSecurity Attributes:   secure-fw\n",
        fw = hca.firmware,
        guid = guid,
        psid = PSID
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_port_fault, PortFaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(store: &ClusterStore, verb: MlxVerb, line: &str) -> Result<CommandOutput> {
        let ctx = CommandContext::new("dgx-01");
        Mellanox.execute(verb, &parse(line).unwrap(), &ctx, store.cluster())
    }

    #[test]
    fn device_spellings_resolve_to_same_hca() {
        let c = crate::cluster::Cluster::superpod("t");
        let node = &c.nodes[1];
        for dev in ["mlx5_4", "/dev/mst/mt4129_pciconf4", "mt4129_pciconf4", "0000:9c:00.0", "9c:00.0"] {
            assert_eq!(resolve_device(node, dev).map(|h| h.id.as_str()), Some("mlx5_4"), "{}", dev);
        }
        assert!(resolve_device(node, "mlx5_12").is_none());
    }

    #[test]
    fn mlxlink_reflects_port_faults() {
        let mut store = ClusterStore::superpod("t");
        inject_port_fault(&mut store, "dgx-01", "mlx5_2", 1, PortFaultKind::LinkDown).unwrap();
        inject_port_fault(&mut store, "dgx-01", "mlx5_5", 1, PortFaultKind::SymbolErrors).unwrap();
        let down = run(&store, MlxVerb::Mlxlink, "mlxlink -d mlx5_2").unwrap();
        assert!(down.output.contains("State                           : Polling"));
        assert!(down.output.contains("Status Opcode                   : 1024"));
        let noisy = run(&store, MlxVerb::Mlxlink, "mlxlink -d /dev/mst/mt4129_pciconf5 -c").unwrap();
        assert!(noisy.output.contains("Effective Physical Errors       : 1241"));
        assert!(noisy.output.contains("Bad signal integrity"));
        let ok = run(&store, MlxVerb::Mlxlink, "mlxlink -d mlx5_0").unwrap();
        assert!(ok.output.contains("No issue was observed"));
    }

    #[test]
    fn firmware_queries_agree_with_ibstat() {
        let store = ClusterStore::superpod("t");
        let fw = run(&store, MlxVerb::Mlxfwmanager, "mlxfwmanager --query").unwrap();
        assert_eq!(fw.output.matches("FW             28.39.1002").count(), 8);
        let flint = run(&store, MlxVerb::Flint, "flint -d mlx5_0 query").unwrap();
        assert!(flint.output.contains("FW Version:            28.39.1002"));
        assert!(matches!(run(&store, MlxVerb::Flint, "flint -d mlx5_42 query"), Err(SimError::NotFound(_))));
        assert!(matches!(run(&store, MlxVerb::Mlxconfig, "mlxconfig query"), Err(SimError::Usage(_))));
    }

    #[test]
    fn mst_lists_every_device() {
        let store = ClusterStore::superpod("t");
        let out = run(&store, MlxVerb::Mst, "mst status").unwrap();
        assert_eq!(out.output.matches("/dev/mst/mt4129_pciconf").count(), 8);
        assert!(run(&store, MlxVerb::Mlxconfig, "mlxconfig -d mlx5_1 query").unwrap().output.contains("LINK_TYPE_P1"));
    }
}
