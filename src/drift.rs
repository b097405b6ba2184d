/// Metrics drift: a bounded random walk over utilization, temperature and
/// power that makes an idle cluster look alive.
///
/// Drift writes through `ClusterStore::update_gpu` like any other writer.
/// A GPU with any active incident (XID, ECC, thermal, NVLink, power, PCIe)
/// is frozen: its readings stay exactly where the fault put them until the
/// fault is cleared. Healthy GPUs stay below every warning threshold.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::gpu::{health_reasons, Gpu};
use crate::store::{ClusterStore, GpuUpdate, SharedStore};

#[derive(Debug, Clone, PartialEq)]
pub struct DriftConfig {
    pub tick: Duration,
    /// Max utilization change per tick, in percentage points
    pub util_step: u32,
    /// Max temperature change per tick, in °C
    pub temp_step: u32,
    /// Max power change per tick, in W
    pub power_step: f64,
    /// Healthy temperature band
    pub temp_min_c: u32,
    pub temp_max_c: u32,
    /// Healthy power ceiling as a fraction of the limit
    pub power_ceiling_ratio: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        DriftConfig {
            tick: Duration::from_millis(1000),
            util_step: 5,
            temp_step: 1,
            power_step: 10.0,
            temp_min_c: 30,
            temp_max_c: 80,
            power_ceiling_ratio: 0.95,
        }
    }
}

/// Compute the next drifted values for one GPU, or `None` if the GPU carries
/// an active fault.
pub fn drift_gpu(gpu: &Gpu, idle_power_w: f64, cfg: &DriftConfig, rng: &mut impl Rng) -> Option<GpuUpdate> {
    if !health_reasons(gpu).is_empty() {
        return None;
    }
    let step = cfg.util_step as i64;
    let util = (gpu.utilization_pct as i64 + rng.gen_range(-step..=step)).clamp(0, 100) as u32;

    // pull toward a utilization-dependent target, then jitter
    let temp_step = cfg.temp_step as i64;
    let target = cfg.temp_min_c as f64 + 4.0 + util as f64 * 0.4;
    let pull = (target - gpu.temperature_c as f64).signum() as i64;
    let t = gpu.temperature_c as i64 + pull + rng.gen_range(-temp_step..=temp_step);
    let temperature_c = t.clamp(cfg.temp_min_c as i64, cfg.temp_max_c as i64) as u32;

    let ceiling = gpu.power_limit_w * cfg.power_ceiling_ratio;
    let target = idle_power_w + util as f64 * (gpu.power_limit_w - idle_power_w) / 100.0;
    let pull = ((target - gpu.power_draw_w) * 0.25).clamp(-cfg.power_step, cfg.power_step);
    let p = gpu.power_draw_w + pull + rng.gen_range(-cfg.power_step..=cfg.power_step) * 0.5;
    let power_draw_w = (p.clamp(idle_power_w, ceiling) * 10.0).round() / 10.0;

    Some(GpuUpdate {
        utilization_pct: Some(util),
        temperature_c: Some(temperature_c),
        power_draw_w: Some(power_draw_w),
        ..Default::default()
    })
}

/// One drift tick over every GPU in the cluster.
pub fn drift_tick(store: &mut ClusterStore, cfg: &DriftConfig, rng: &mut impl Rng) {
    let idle = store.hardware().idle_power_w;
    let updates: Vec<(String, u32, GpuUpdate)> = store
        .cluster()
        .nodes
        .iter()
        .flat_map(|n| n.gpus.iter().map(move |g| (n.id.clone(), g)))
        .filter_map(|(node, g)| drift_gpu(g, idle, cfg, rng).map(|u| (node, g.id, u)))
        .collect();
    let count = updates.len();
    for (node, gpu, update) in updates {
        if let Err(e) = store.update_gpu(&node, gpu, update) {
            warn!(node = %node, gpu, error = %e, "drift update failed");
        }
    }
    debug!(gpus = count, generation = store.generation(), "drift tick");
}

/// Handle to a running drift thread. Stopping is idempotent; dropping the
/// handle stops the thread.
pub struct DriftTask {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DriftTask {
    /// Start ticking `store` every `cfg.tick`. `on_tick` runs after each tick
    /// with the write lock released (used to publish live snapshots).
    pub fn start<F>(store: SharedStore, cfg: DriftConfig, seed: Option<u64>, on_tick: F) -> Self
    where
        F: Fn(&ClusterStore) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = std::thread::spawn(move || {
            let mut rng = match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            };
            while flag.load(Ordering::SeqCst) {
                std::thread::sleep(cfg.tick);
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                drift_tick(&mut store.write(), &cfg, &mut rng);
                on_tick(&store.read());
            }
            debug!("drift thread exited");
        });
        DriftTask { running, handle: Some(handle) }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                warn!("drift thread panicked");
            }
        }
    }
}

impl Drop for DriftTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, FaultKind};
    use crate::gpu::HealthStatus;

    fn run_ticks(store: &mut ClusterStore, n: usize) {
        let cfg = DriftConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..n {
            drift_tick(store, &cfg, &mut rng);
        }
    }

    #[test]
    fn healthy_cluster_stays_healthy() {
        let mut store = ClusterStore::superpod("t");
        run_ticks(&mut store, 300);
        let s = store.summary();
        assert_eq!(s.healthy_gpus, 64);
        for gpu in store.cluster().nodes.iter().flat_map(|n| &n.gpus) {
            assert!(gpu.utilization_pct <= 100);
            assert!((30..=80).contains(&gpu.temperature_c));
            assert!(gpu.power_draw_w <= gpu.power_limit_w * 0.95);
        }
    }

    #[test]
    fn faulted_gpus_keep_their_readings() {
        for kind in FaultKind::ALL {
            let mut store = ClusterStore::superpod("t");
            inject_fault(&mut store, "dgx-02", 4, kind).unwrap();
            let before = store.cluster().nodes[2].gpus[4].clone();
            run_ticks(&mut store, 200);
            let after = &store.cluster().nodes[2].gpus[4];
            assert_eq!(after, &before, "{}", kind);
            // the rest of the node keeps moving
            assert!(store.cluster().nodes[2].gpus.iter().any(|g| g.id != 4 && g.utilization_pct > 0));
        }
    }

    #[test]
    fn fallen_gpu_stays_idle() {
        let mut store = ClusterStore::superpod("t");
        let gpu = inject_fault(&mut store, "dgx-00", 0, FaultKind::Xid).unwrap();
        run_ticks(&mut store, 50);
        let after = &store.cluster().nodes[0].gpus[0];
        assert_eq!(after.utilization_pct, gpu.utilization_pct);
        assert_eq!(after.temperature_c, gpu.temperature_c);
        assert_eq!(after.power_draw_w, gpu.power_draw_w);
        assert_eq!(store.summary().critical_gpus, 1);
    }

    #[test]
    fn thermal_fault_holds_its_temperature() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-01", 3, FaultKind::Thermal).unwrap();
        run_ticks(&mut store, 200);
        assert_eq!(store.cluster().nodes[1].gpus[3].temperature_c, crate::fault::THERMAL_FAULT_C);
        assert_eq!(store.summary().warning_gpus, 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let store = ClusterStore::superpod("t").into_shared();
        let cfg = DriftConfig { tick: Duration::from_millis(5), ..Default::default() };
        let mut task = DriftTask::start(store.clone(), cfg, Some(1), |_| {});
        std::thread::sleep(Duration::from_millis(40));
        task.stop();
        task.stop();
        assert!(!task.is_running());
        let generation = store.read().generation();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.read().generation(), generation);
    }
}
