//! Cluster-wide properties: health derivation, cross-tool agreement,
//! fault/clear symmetry, aggregation, manual drain and export round-trip.

use chrono::{TimeZone, Utc};

use dgxsim::cluster::SlurmState;
use dgxsim::context::CommandContext;
use dgxsim::engine::Engine;
use dgxsim::fault::{
    clear_all_faults, clear_faults, inject_fault, inject_port_fault, inject_xid, FaultKind, PortFaultKind,
};
use dgxsim::gpu::{derive_health, HealthStatus};
use dgxsim::metrics::LiveMetrics;
use dgxsim::simulators::link_audit::AuditReport;
use dgxsim::store::ClusterStore;

fn ctx(node: &str) -> CommandContext {
    CommandContext::with_fixed_clock(node, Utc.with_ymd_and_hms(2024, 6, 3, 9, 30, 0).unwrap())
}

/// A cluster with one fault of every kind spread over several nodes.
fn faulted_store() -> ClusterStore {
    let mut store = ClusterStore::superpod("props");
    inject_fault(&mut store, "dgx-00", 0, FaultKind::Xid).unwrap();
    inject_fault(&mut store, "dgx-01", 3, FaultKind::Ecc).unwrap();
    inject_fault(&mut store, "dgx-02", 5, FaultKind::Thermal).unwrap();
    inject_fault(&mut store, "dgx-03", 2, FaultKind::NvLink).unwrap();
    inject_fault(&mut store, "dgx-03", 2, FaultKind::NvLink).unwrap();
    inject_fault(&mut store, "dgx-04", 7, FaultKind::Power).unwrap();
    inject_fault(&mut store, "dgx-05", 1, FaultKind::Pcie).unwrap();
    inject_xid(&mut store, "dgx-06", 4, 48).unwrap();
    inject_port_fault(&mut store, "dgx-07", "mlx5_2", 1, PortFaultKind::LinkDown).unwrap();
    inject_port_fault(&mut store, "dgx-01", "mlx5_6", 1, PortFaultKind::SymbolErrors).unwrap();
    store
}

#[test]
fn stored_health_always_matches_derivation() {
    let store = faulted_store();
    for node in &store.cluster().nodes {
        for gpu in &node.gpus {
            assert_eq!(gpu.health_status, derive_health(gpu), "{} GPU {}", node.id, gpu.id);
        }
    }
    store.check_invariants().unwrap();
}

#[test]
fn critical_beats_warning() {
    let mut store = ClusterStore::superpod("props");
    inject_fault(&mut store, "dgx-02", 2, FaultKind::Thermal).unwrap();
    inject_fault(&mut store, "dgx-02", 2, FaultKind::NvLink).unwrap();
    assert_eq!(store.cluster().gpu("dgx-02", 2).unwrap().health(), HealthStatus::Warning);
    let gpu = inject_fault(&mut store, "dgx-02", 2, FaultKind::Ecc).unwrap();
    assert_eq!(gpu.health_status, HealthStatus::Critical);
}

#[test]
fn tools_agree_on_health() {
    let store = faulted_store().into_shared();
    let summary = store.read().summary();
    let mut engine = Engine::new(store.clone());

    let mut smi_critical = 0;
    let mut smi_warning = 0;
    let mut dcgm_failures = 0;
    let mut gpus_listed = 0;
    for node in ["dgx-00", "dgx-01", "dgx-02", "dgx-03", "dgx-04", "dgx-05", "dgx-06", "dgx-07"] {
        let mut c = ctx(node);
        let q = engine.execute("nvidia-smi -q", &mut c).output;
        for line in q.lines().filter(|l| l.trim_start().starts_with("GPU Health")) {
            if line.ends_with(": Critical") {
                smi_critical += 1;
            } else if line.ends_with(": Warning") {
                smi_warning += 1;
            }
        }
        let health = engine.execute("dcgmi health -c", &mut c).output;
        dcgm_failures += health
            .lines()
            .filter(|l| l.starts_with("| GPU ID") && l.contains("| Failure"))
            .count();
        gpus_listed += engine.execute("dcgmi discovery -l", &mut c).output.matches("Device UUID").count();
    }
    assert_eq!(smi_critical, summary.critical_gpus);
    assert_eq!(smi_warning, summary.warning_gpus);
    assert_eq!(dcgm_failures, summary.critical_gpus);
    assert_eq!(gpus_listed, summary.total_gpus);

    let metrics = LiveMetrics::from_store(&store.read(), false, None);
    let cells_critical = metrics
        .nodes
        .iter()
        .flat_map(|n| &n.gpus)
        .filter(|g| g.health == HealthStatus::Critical)
        .count();
    assert_eq!(cells_critical, summary.critical_gpus);
}

#[test]
fn tools_agree_on_gpu_count() {
    let mut store = ClusterStore::superpod("props");
    inject_fault(&mut store, "dgx-00", 0, FaultKind::Xid).unwrap();
    inject_fault(&mut store, "dgx-00", 5, FaultKind::Ecc).unwrap();
    let mut engine = Engine::new(store.into_shared());
    let mut c = ctx("dgx-00");

    let smi = engine.execute("nvidia-smi -L", &mut c).output;
    assert_eq!(smi.lines().filter(|l| l.starts_with("GPU ")).count(), 8);
    let dcgm = engine.execute("dcgmi discovery -l", &mut c).output;
    assert!(dcgm.starts_with("8 GPUs found."), "{}", dcgm);
    let gpus = engine.execute("nvsm show gpus", &mut c).output;
    assert_eq!(gpus.matches("/systems/localhost/gpus/GPU").count(), 8);
    let health = engine.execute("nvsm show health", &mut c).output;
    assert!(!health.contains("Expected 8 GPUs"), "{}", health);
    assert!(health.contains("Overall system status is Critical"));
}

#[test]
fn tools_agree_on_link_counts() {
    let store = faulted_store().into_shared();
    let summary = store.read().summary();
    let report = AuditReport::of(&store.read().cluster().nodes);
    assert_eq!(report.active_nvlinks, summary.active_nvlinks);
    assert_eq!(report.down_nvlinks, summary.down_nvlinks);
    assert_eq!(report.degraded_ib_ports, summary.degraded_ib_ports);

    let mut engine = Engine::new(store.clone());
    let mut c = ctx("dgx-03");
    let fm = engine.execute("nv-fabricmanager status", &mut c).output;
    assert!(fm.contains("NVLinks Active         : 142/144"), "{}", fm);
    let smi = engine.execute("nvidia-smi nvlink -s -i 2", &mut c).output;
    assert_eq!(smi.matches("<inactive>").count(), 2);

    let audit = engine.execute("nvlink-audit", &mut c);
    assert_eq!(audit.exit_code, 1);
    assert!(audit.output.contains(&format!(
        "NVLinks: {} active, {} down | IB ports: {} active, {} degraded",
        summary.active_nvlinks, summary.down_nvlinks, summary.active_ib_ports, summary.degraded_ib_ports
    )));
    let simctl = engine.execute("simctl summary", &mut c).output;
    assert!(simctl.contains(&format!("{} active, {} down", summary.active_nvlinks, summary.down_nvlinks)));
}

#[test]
fn clearing_restores_exact_baseline() {
    for kind in FaultKind::ALL {
        let mut store = ClusterStore::superpod("props");
        let baseline = store.cluster().clone();
        inject_fault(&mut store, "dgx-06", 6, kind).unwrap();
        inject_fault(&mut store, "dgx-06", 6, kind).unwrap();
        let gpu = clear_faults(&mut store, "dgx-06", 6).unwrap();
        assert_eq!(gpu.health_status, HealthStatus::OK);
        assert!(gpu.xid_errors.is_empty());
        assert_eq!(gpu.ecc.volatile.double_bit, 0);
        assert_eq!(gpu.down_nvlinks(), 0);
        assert_eq!(store.cluster(), &baseline, "{}", kind);
    }

    let mut store = faulted_store();
    clear_all_faults(&mut store).unwrap();
    assert_eq!(store.cluster(), ClusterStore::superpod("props").cluster());
}

#[test]
fn critical_count_tracks_distinct_gpus() {
    let mut store = ClusterStore::superpod("props");
    let targets = [("dgx-00", 0), ("dgx-00", 1), ("dgx-03", 7), ("dgx-07", 4)];
    for (i, (node, gpu)) in targets.iter().enumerate() {
        let kind = if i % 2 == 0 { FaultKind::Xid } else { FaultKind::Ecc };
        inject_fault(&mut store, node, *gpu, kind).unwrap();
        assert_eq!(store.summary().critical_gpus, i + 1);
        assert_eq!(store.summary().healthy_gpus, 64 - (i + 1));
    }
    // a second critical fault on the same GPU is not a new critical GPU
    inject_fault(&mut store, "dgx-00", 0, FaultKind::Ecc).unwrap();
    assert_eq!(store.summary().critical_gpus, 4);
    // warnings do not count as critical
    inject_fault(&mut store, "dgx-05", 5, FaultKind::Thermal).unwrap();
    assert_eq!(store.summary().critical_gpus, 4);
    assert_eq!(store.summary().warning_gpus, 1);

    store.reset_cluster();
    let s = store.summary();
    assert_eq!(s.critical_gpus, 0);
    assert_eq!(s.warning_gpus, 0);
    assert_eq!(s.healthy_gpus, 64);
}

#[test]
fn faults_leave_slurm_state_alone() {
    let store = faulted_store();
    assert!(store.cluster().nodes.iter().all(|n| n.slurm_state == SlurmState::Idle));

    let shared = store.into_shared();
    let mut engine = Engine::new(shared.clone());
    let mut c = ctx("dgx-00");
    let sinfo = engine.execute("sinfo -N", &mut c).output;
    assert!(sinfo.lines().any(|l| l.starts_with("dgx-00") && l.contains("idle")));

    let out = engine.execute("scontrol update nodename=dgx-00 state=drain reason=xid79", &mut c);
    assert!(out.success(), "{}", out.output);
    assert_eq!(shared.read().cluster().node("dgx-00").unwrap().slurm_state, SlurmState::Drain);
    engine.execute("simctl clear dgx-00 0", &mut c);
    assert_eq!(shared.read().cluster().node("dgx-00").unwrap().slurm_state, SlurmState::Drain);
    engine.execute("scontrol update nodename=dgx-00 state=resume", &mut c);
    assert_eq!(shared.read().cluster().node("dgx-00").unwrap().slurm_state, SlurmState::Idle);
}

#[test]
fn export_import_round_trip() {
    let mut store = faulted_store();
    store.set_slurm_state("dgx-02", SlurmState::Drain, Some("thermal".to_string())).unwrap();
    let json = store.export_cluster().unwrap();

    let mut other = ClusterStore::superpod("elsewhere");
    other.import_cluster(&json).unwrap();
    assert_eq!(other.cluster(), store.cluster());
    assert_eq!(other.export_cluster().unwrap(), json);
    assert_eq!(other.summary(), store.summary());

    // identical state and clock give identical tool output
    let mut a = Engine::new(store.into_shared());
    let mut b = Engine::new(other.into_shared());
    for line in ["nvidia-smi", "nvidia-smi -q -i 0", "dcgmi diag -r 2", "ibstat", "sinfo -R", "nvsm show health"] {
        let out_a = a.execute(line, &mut ctx("dgx-00"));
        let out_b = b.execute(line, &mut ctx("dgx-00"));
        assert_eq!(out_a, out_b, "{}", line);
    }
}

#[test]
fn rejected_import_keeps_current_state() {
    let mut store = faulted_store();
    let before = store.cluster().clone();
    let mut doc: serde_json::Value = serde_json::from_str(&store.export_cluster().unwrap()).unwrap();
    doc["nodes"][1]["id"] = serde_json::Value::String("dgx-00".to_string());
    assert!(store.import_cluster(&doc.to_string()).is_err());
    assert!(store.import_cluster("{ not json").is_err());
    assert_eq!(store.cluster(), &before);
}
