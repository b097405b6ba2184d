/// NVIDIA System Management (`nvsm`): node health checks, GPU inventory and
/// alerts.
///
/// The check list is the node's incidents laid out the way nvsm groups
/// them. `node_checks` is shared with the bug-report bundler.
use chrono::{DateTime, Utc};

use crate::cluster::{Cluster, DgxNode};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::gpu::{health_reasons, HealthIncident, HealthStatus};
use crate::parser::ParsedCommand;

use super::fabric_manager::FabricState;
use super::{current_node, CommandOutput, Simulator};

const NVSM_VERSION: &str = "24.03.02";

/// One line of `nvsm show health`.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub detail: Option<String>,
}

impl HealthCheck {
    fn new(name: impl Into<String>, status: HealthStatus, detail: Option<String>) -> Self {
        HealthCheck { name: name.into(), status, detail }
    }

    fn healthy(name: impl Into<String>) -> Self {
        HealthCheck::new(name, HealthStatus::OK, None)
    }
}

fn status_word(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::OK       => "Healthy",
        HealthStatus::Warning  => "Warning",
        HealthStatus::Critical => "Critical",
    }
}

/// Every nvsm check for `node`, in report order.
pub fn node_checks(node: &DgxNode, cluster: &Cluster) -> Vec<HealthCheck> {
    let hw = &cluster.hardware;
    let mut checks = Vec::new();

    // a GPU that fell off the bus is still enumerated; its own check goes Critical
    let present = node.gpus.len();
    checks.push(if present == hw.gpus_per_node as usize {
        HealthCheck::healthy("Verify installed GPU count")
    } else {
        HealthCheck::new(
            "Verify installed GPU count",
            HealthStatus::Critical,
            Some(format!("Expected {} GPUs, found {}", hw.gpus_per_node, present)),
        )
    });
    for g in &node.gpus {
        let reasons = health_reasons(g);
        let detail = (!reasons.is_empty())
            .then(|| reasons.iter().map(|r| r.to_string()).collect::<Vec<_>>().join("; "));
        checks.push(HealthCheck::new(format!("Check GPU{} health", g.id), g.health(), detail));
    }

    let fabric = FabricState::of(node, hw.nvswitches);
    checks.push(if fabric.is_degraded() {
        HealthCheck::new(
            "Verify NVSwitch fabric",
            HealthStatus::Warning,
            Some(format!("{}/{} NVLinks active", fabric.active_links, fabric.total_links)),
        )
    } else {
        HealthCheck::healthy("Verify NVSwitch fabric")
    });

    for (hca, port) in node.ports() {
        let name = format!("Verify {} port {} link", hca.id, port.port);
        checks.push(if port.is_degraded() {
            HealthCheck::new(
                name,
                HealthStatus::Warning,
                Some(format!(
                    "state {}, {} symbol errors, {} link downed",
                    port.state, port.counters.symbol_errors, port.counters.link_downed
                )),
            )
        } else {
            HealthCheck::healthy(name)
        });
    }

    for fixed in [
        "Verify chassis fan presence",
        "Verify PSU presence",
        "Check system memory",
        "Verify DIMM count",
        "Check root filesystem utilization",
        "Check RAID array health",
    ] {
        checks.push(HealthCheck::healthy(fixed));
    }
    checks
}

/// An alert raised by nvsm, keyed by the component it concerns.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub path: String,
    pub alert_id: &'static str,
    pub component: String,
    pub description: String,
    pub severity: HealthStatus,
    pub at: DateTime<Utc>,
}

fn alert_id(incident: &HealthIncident) -> &'static str {
    match incident {
        HealthIncident::Xid { .. }            => "NV-GPU-04",
        HealthIncident::DoubleBitEcc { .. }   => "NV-GPU-02",
        HealthIncident::NvLinkDown { .. }     => "NV-NVLINK-01",
        HealthIncident::Thermal { .. }        => "NV-GPU-07",
        HealthIncident::PowerOverLimit { .. } => "NV-GPU-08",
        HealthIncident::Pcie { .. }           => "NV-PCIE-01",
    }
}

pub fn alerts(node: &DgxNode, now: DateTime<Utc>) -> Vec<Alert> {
    let mut out = Vec::new();
    for g in &node.gpus {
        for (i, incident) in health_reasons(g).into_iter().enumerate() {
            let at = match &incident {
                HealthIncident::Xid { code } => g
                    .xid_errors
                    .iter()
                    .find(|x| x.code == *code)
                    .map(|x| x.timestamp)
                    .unwrap_or(now),
                _ => now,
            };
            out.push(Alert {
                path: format!("/systems/localhost/gpus/GPU{}/alerts/alert{}", g.id, i),
                alert_id: alert_id(&incident),
                component: format!("GPU{}", g.id),
                description: incident.to_string(),
                severity: incident.severity(),
                at,
            });
        }
    }
    for (hca, port) in node.ports().filter(|(_, p)| p.is_degraded()) {
        out.push(Alert {
            path: format!("/systems/localhost/network_adapters/{}/alerts/alert0", hca.id),
            alert_id: "NV-NET-03",
            component: hca.id.clone(),
            description: format!("InfiniBand port {} is {} with {} symbol errors", port.port, port.state, port.counters.symbol_errors),
            severity: HealthStatus::Warning,
            at: now,
        });
    }
    out
}

#[derive(Debug, Default)]
pub struct Nvsm;

impl Simulator for Nvsm {
    type Verb = ();

    fn name(&self) -> &'static str {
        "nvsm"
    }

    fn execute(&mut self, _: (), cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        let node = current_node(ctx, cluster)?;
        match cmd.operands().as_slice() {
            ["show", "health"] => Ok(show_health(node, cluster, ctx.now())),
            ["show", "gpus"] => Ok(CommandOutput::ok(show_gpus(node))),
            ["show", "alerts"] => Ok(CommandOutput::ok(show_alerts(node, ctx.now()))),
            ["show", "version"] => Ok(CommandOutput::ok(format!("NVSM version: {}\n", NVSM_VERSION))),
            ["dump", "health"] => {
                let path = format!("/tmp/nvsm-health-{}-{}.tar.xz", node.hostname, ctx.now().format("%Y%m%d%H%M%S"));
                Ok(CommandOutput::ok(format!(
                    "NVSM is collecting health information for {} ({} checks)\nWriting output to {}\nDone.\n",
                    node.hostname,
                    node_checks(node, cluster).len(),
                    path
                )))
            }
            _ => Err(SimError::Usage(
                "Usage: nvsm show health | show gpus | show alerts | dump health".to_string(),
            )),
        }
    }
}

fn show_health(node: &DgxNode, cluster: &Cluster, now: DateTime<Utc>) -> CommandOutput {
    let checks = node_checks(node, cluster);
    let mut out = format!(
        "\nInfo\n----\nTimestamp                : {}\nVersion                  : {}\n\nChecks\n------\n",
        now.format("%a %b %e %H:%M:%S %Y"),
        NVSM_VERSION
    );
    for c in &checks {
        let dots = ".".repeat(62usize.saturating_sub(c.name.len() + 1));
        out.push_str(&format!("{} {} {}\n", c.name, dots, status_word(c.status)));
        if let Some(d) = &c.detail {
            out.push_str(&format!("    {}\n", d));
        }
    }
    let total = checks.len();
    let count = |s: HealthStatus| checks.iter().filter(|c| c.status == s).count();
    let overall = checks.iter().map(|c| c.status).max().unwrap_or(HealthStatus::OK);
    out.push_str(&format!(
        "\nHealth Summary\n--------------\n{} out of {} checks are healthy\n",
        count(HealthStatus::OK),
        total
    ));
    for s in [HealthStatus::Warning, HealthStatus::Critical] {
        if count(s) > 0 {
            out.push_str(&format!("{} out of {} checks are {}\n", count(s), total, status_word(s).to_lowercase()));
        }
    }
    out.push_str(&format!("Overall system status is {}\n", status_word(overall)));
    CommandOutput::ok(out)
}

fn show_gpus(node: &DgxNode) -> String {
    let mut out = String::new();
    for g in &node.gpus {
        let fallen = g.xid_errors.iter().any(|x| x.code == 79);
        out.push_str(&format!(
            "/systems/localhost/gpus/GPU{}\nProperties:\n    Inventory_ModelName = {}\n    Inventory_UUID = {}\n    Inventory_SerialNumber = {}\n    PCIDevice = {}\n    Specifications_MaxPCIeGen = {}\n    Specifications_MaxPCIeLinkWidth = x{}\n    Status_Health = {}\n    Status_State = {}\nTargets:\n    alerts\n    pcie\n    nvlinks\nVerbs:\n    cd\n    show\n\n",
            g.id,
            g.name,
            g.uuid,
            g.serial,
            g.bus_id,
            g.pcie.max_link_gen,
            g.pcie.max_link_width,
            g.health(),
            if fallen { "UnavailableOffline" } else { "Enabled" }
        ));
    }
    out
}

fn show_alerts(node: &DgxNode, now: DateTime<Utc>) -> String {
    let list = alerts(node, now);
    if list.is_empty() {
        return "/systems/localhost/alerts\nProperties:\n    No alerts found\n".to_string();
    }
    let mut out = String::new();
    for a in list {
        out.push_str(&format!(
            "{}\nProperties:\n    AlertId = {}\n    Component = {}\n    Description = {}\n    Event_Time = {}\n    Severity = {}\n    System_Name = {}\n\n",
            a.path,
            a.alert_id,
            a.component,
            a.description,
            a.at.format("%Y-%m-%dT%H:%M:%SZ"),
            a.severity,
            node.hostname
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, inject_port_fault, FaultKind, PortFaultKind};
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(store: &ClusterStore, line: &str) -> CommandOutput {
        let ctx = CommandContext::new("dgx-00");
        Nvsm.execute((), &parse(line).unwrap(), &ctx, store.cluster()).unwrap()
    }

    #[test]
    fn healthy_node_reports_healthy() {
        let store = ClusterStore::superpod("t");
        let out = run(&store, "nvsm show health").output;
        assert!(out.ends_with("Overall system status is Healthy\n"));
        assert!(!out.contains("checks are warning"));
        assert!(run(&store, "nvsm show alerts").output.contains("No alerts found"));
    }

    #[test]
    fn xid_marks_gpu_offline_and_critical() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 0, FaultKind::Xid).unwrap();
        let health = run(&store, "nvsm show health").output;
        assert!(!health.contains("Expected 8 GPUs"));
        assert!(health.contains("1 out of 24 checks are critical"));
        assert!(health.ends_with("Overall system status is Critical\n"));
        let gpus = run(&store, "nvsm show gpus").output;
        assert_eq!(gpus.matches("/systems/localhost/gpus/GPU").count(), 8);
        assert!(gpus.contains("Status_State = UnavailableOffline"));
        let alerts = run(&store, "nvsm show alerts").output;
        assert!(alerts.contains("AlertId = NV-GPU-04"));
        assert!(alerts.contains("Severity = Critical"));
    }

    #[test]
    fn port_and_thermal_faults_warn() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 5, FaultKind::Thermal).unwrap();
        inject_port_fault(&mut store, "dgx-00", "mlx5_2", 1, PortFaultKind::LinkDown).unwrap();
        let checks = node_checks(store.cluster().node("dgx-00").unwrap(), store.cluster());
        let warned: Vec<&str> = checks
            .iter()
            .filter(|c| c.status == HealthStatus::Warning)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(warned, vec!["Check GPU5 health", "Verify mlx5_2 port 1 link"]);
        assert!(run(&store, "nvsm show health").output.ends_with("Overall system status is Warning\n"));
    }

    #[test]
    fn dump_names_the_archive() {
        let store = ClusterStore::superpod("t");
        let out = run(&store, "nvsm dump health").output;
        assert!(out.contains("Writing output to /tmp/nvsm-health-dgx-00-"));
    }
}
