//! The pulse validation pipeline
//!
//! Pre-flight, per-device GEMM loop, P2P ring, post-pulse clock check, in
//! that order, synchronous and serial. Any failure quarantines the whole
//! node; the worst per-device mean is threaded through as evidence either
//! way.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::failure::{DeviceRef, FailureKind, PulseError, PulseFailure};
use crate::kernel::{PulseKernel, KERNEL_ERR_CUDA, KERNEL_ERR_OOM, KERNEL_ERR_P2P, KERNEL_OK};
use crate::metrics;
use crate::smi::GpuProbe;
use crate::stats::mean_and_cv;
use crate::thresholds::Thresholds;

/// Timed GEMM passes per device per validation cycle.
pub const PULSE_RUNS: usize = 5;

/// Anything that can execute one full validation pass. The reconciliation
/// controller takes this as a parameter so tests substitute deterministic
/// scenarios without the native library or a GPU.
pub trait PulseRunner: Send + Sync {
    /// Worst per-device mean duration plus the verdict.
    fn run_pulse(&self) -> (Duration, Result<(), PulseError>);
}

impl<F> PulseRunner for F
where
    F: Fn() -> (Duration, Result<(), PulseError>) + Send + Sync,
{
    fn run_pulse(&self) -> (Duration, Result<(), PulseError>) {
        self()
    }
}

/// The four-stage validation pipeline over a kernel and a probe.
pub struct Pipeline {
    kernel: Arc<dyn PulseKernel>,
    probe: Arc<dyn GpuProbe>,
    thresholds: Thresholds,
}

impl Pipeline {
    pub fn new(
        kernel: Arc<dyn PulseKernel>,
        probe: Arc<dyn GpuProbe>,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            kernel,
            probe,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Execute the full pipeline once.
    pub fn run(&self) -> (Duration, Result<(), PulseError>) {
        if let Err(e) = self.preflight() {
            return (Duration::ZERO, Err(e));
        }

        // Clamped to 1 on a count error so single-device validation always
        // proceeds.
        let count = self.kernel.device_count().max(1) as usize;
        debug!(devices = count, "starting device pulse loop");

        let mut worst_mean = Duration::ZERO;
        for dev in 0..count {
            let (mean, cv, verdict) = self.device_pulse(dev);

            // Record before evaluating so a failing device still shows up
            // in the series.
            let label = dev.to_string();
            metrics::observe_pulse_duration(&label, mean.as_secs_f64());
            metrics::set_pulse_cv(&label, cv);

            worst_mean = worst_mean.max(mean);
            if let Err(e) = verdict {
                return (worst_mean, Err(e));
            }
        }

        // Ring topology: 0->1, 1->2, ..., N-1->0. Catches any single broken
        // segment, including links that do not touch GPU 0, which a star
        // check rooted at GPU 0 would miss. Single-GPU nodes have no links.
        if count > 1 {
            for src in 0..count {
                let dst = (src + 1) % count;
                if let Err(e) = self.p2p_segment(src, dst) {
                    return (worst_mean, Err(e));
                }
            }
        }

        if let Err(e) = self.validate_clocks(worst_mean) {
            return (worst_mean, Err(e));
        }

        info!(worst_mean_ms = worst_mean.as_millis() as u64, "pulse passed");
        (worst_mean, Ok(()))
    }

    /// Hard disqualifiers before the workload runs: uncorrectable ECC
    /// errors (bad HBM, no pulse needed) and idle temperature above the
    /// ceiling (thermal recovery incomplete). Probe absence passes.
    fn preflight(&self) -> Result<(), PulseError> {
        let Some(stats) = self.probe.query_all() else {
            debug!("management utility unavailable, skipping pre-flight");
            return Ok(());
        };

        for (i, s) in stats.iter().enumerate() {
            if s.ecc_errors > 0 {
                return Err(PulseFailure {
                    kind: FailureKind::PreFlight,
                    measured: s.ecc_errors as f64,
                    threshold: 0.0,
                    unit: "count",
                    device: DeviceRef::Gpu(i),
                    cause: format!(
                        "pre-flight GPU {i}: {} uncorrectable ECC error(s) since last boot, quarantining without pulse",
                        s.ecc_errors
                    ),
                }
                .into());
            }
            if s.temp_c > self.thresholds.idle_temp_c {
                return Err(PulseFailure {
                    kind: FailureKind::PreFlight,
                    measured: s.temp_c as f64,
                    threshold: self.thresholds.idle_temp_c as f64,
                    unit: "c",
                    device: DeviceRef::Gpu(i),
                    cause: format!(
                        "pre-flight GPU {i}: idle temperature {}C exceeds {}C threshold (thermal recovery incomplete)",
                        s.temp_c, self.thresholds.idle_temp_c
                    ),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Five timed GEMM passes on one device. Returns the mean, the CV, and
    /// the verdict; on a kernel error the elapsed time of the failing run
    /// stands in for the mean so the evidence trail never goes blank.
    fn device_pulse(&self, dev: usize) -> (Duration, f64, Result<(), PulseError>) {
        let mut samples = [Duration::ZERO; PULSE_RUNS];

        for run in 0..PULSE_RUNS {
            let start = Instant::now();
            let rc = self.kernel.run_gpu_pulse(dev as i32);
            let elapsed = start.elapsed();

            match rc {
                KERNEL_OK => samples[run] = elapsed,
                KERNEL_ERR_CUDA | KERNEL_ERR_OOM => {
                    let what = if rc == KERNEL_ERR_CUDA {
                        "cuda error"
                    } else {
                        "out of device memory"
                    };
                    let failure = PulseFailure {
                        kind: FailureKind::LatencyExceeded,
                        measured: elapsed.as_secs_f64() * 1e3,
                        threshold: self.thresholds.threshold_ms() as f64,
                        unit: "ms",
                        device: DeviceRef::Gpu(dev),
                        cause: format!("{what} on GPU {dev} run {} (rc={rc})", run + 1),
                    };
                    return (elapsed, 0.0, Err(failure.into()));
                }
                code => {
                    return (
                        elapsed,
                        0.0,
                        Err(PulseError::Kernel {
                            code,
                            device: dev,
                            run: run + 1,
                        }),
                    )
                }
            }
        }

        let (mean, cv) = mean_and_cv(&samples);

        // Mean before variance: a visibly slow GPU is a stronger signal
        // than variance on an already-slow measurement.
        if mean > self.thresholds.mean_latency {
            let failure = PulseFailure {
                kind: FailureKind::LatencyExceeded,
                measured: mean.as_millis() as f64,
                threshold: self.thresholds.threshold_ms() as f64,
                unit: "ms",
                device: DeviceRef::Gpu(dev),
                cause: format!(
                    "GPU {dev}: mean pulse latency {}ms exceeds {}ms threshold",
                    mean.as_millis(),
                    self.thresholds.threshold_ms()
                ),
            };
            return (mean, cv, Err(failure.into()));
        }
        if cv > self.thresholds.cv_max {
            let failure = PulseFailure {
                kind: FailureKind::HighVariance,
                measured: cv,
                threshold: self.thresholds.cv_max,
                unit: "cv",
                device: DeviceRef::Gpu(dev),
                cause: format!(
                    "GPU {dev}: run-to-run variance cv={cv:.3} exceeds {:.2} (fail-slow pattern)",
                    self.thresholds.cv_max
                ),
            };
            return (mean, cv, Err(failure.into()));
        }
        (mean, cv, Ok(()))
    }

    /// Probe one directed ring segment with a 100 MiB unidirectional copy.
    fn p2p_segment(&self, src: usize, dst: usize) -> Result<(), PulseError> {
        let device = DeviceRef::Link { src, dst };
        let (rc, bandwidth_gbs) = self.kernel.run_p2p_check(src as i32, dst as i32);

        let cause = match rc {
            KERNEL_OK => {
                if bandwidth_gbs < self.thresholds.p2p_min_gbs {
                    format!(
                        "{device}: {bandwidth_gbs:.2} GB/s below {:.1} GB/s minimum",
                        self.thresholds.p2p_min_gbs
                    )
                } else {
                    return Ok(());
                }
            }
            KERNEL_ERR_P2P => format!("{device}: peer access unavailable"),
            code => format!("{device}: p2p check rc={code}"),
        };

        Err(PulseFailure {
            kind: FailureKind::InterconnectDegraded,
            measured: if rc == KERNEL_OK { bandwidth_gbs } else { 0.0 },
            threshold: self.thresholds.p2p_min_gbs,
            unit: "gbs",
            device,
            cause,
        }
        .into())
    }

    /// Confirm every device reached a sane clock under load. A device stuck
    /// power-derated manifests to users as latency, so the failure keeps the
    /// LatencyExceeded identity with the worst mean as the measured value.
    fn validate_clocks(&self, worst_mean: Duration) -> Result<(), PulseError> {
        let Some(stats) = self.probe.query_all() else {
            debug!("management utility unavailable, skipping clock validation");
            return Ok(());
        };

        for (i, s) in stats.iter().enumerate() {
            if s.max_sm_clock_mhz == 0 {
                continue; // driver did not report a max clock
            }
            let floor = (s.max_sm_clock_mhz as f64 * self.thresholds.clock_floor_fraction) as i64;
            if s.sm_clock_mhz < floor {
                return Err(PulseFailure {
                    kind: FailureKind::LatencyExceeded,
                    measured: worst_mean.as_millis() as f64,
                    threshold: self.thresholds.threshold_ms() as f64,
                    unit: "ms",
                    device: DeviceRef::Gpu(i),
                    cause: format!(
                        "post-pulse GPU {i}: SM clock {}MHz below {:.0}% of max {}MHz, stuck in power-derated state under load",
                        s.sm_clock_mhz,
                        self.thresholds.clock_floor_fraction * 100.0,
                        s.max_sm_clock_mhz
                    ),
                }
                .into());
            }
        }
        Ok(())
    }
}

impl PulseRunner for Pipeline {
    fn run_pulse(&self) -> (Duration, Result<(), PulseError>) {
        self.run()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::smi::GpuStats;

    /// Scripted kernel: per-device sleeps to fake GEMM latency, per-segment
    /// bandwidth, optional return codes, and a record of probed links.
    struct MockKernel {
        devices: i32,
        sleeps_ms: Vec<Vec<u64>>,
        pulse_rc: HashMap<usize, i32>,
        p2p: HashMap<(usize, usize), (i32, f64)>,
        pulse_calls: Mutex<HashMap<usize, usize>>,
        probed_links: Mutex<Vec<(usize, usize)>>,
    }

    impl MockKernel {
        fn healthy(devices: i32) -> Self {
            Self {
                devices,
                sleeps_ms: vec![vec![1; PULSE_RUNS]; devices.max(1) as usize],
                pulse_rc: HashMap::new(),
                p2p: HashMap::new(),
                pulse_calls: Mutex::new(HashMap::new()),
                probed_links: Mutex::new(Vec::new()),
            }
        }
    }

    impl PulseKernel for MockKernel {
        fn device_count(&self) -> i32 {
            self.devices
        }

        fn run_gpu_pulse(&self, device_id: i32) -> i32 {
            let dev = device_id as usize;
            if let Some(&rc) = self.pulse_rc.get(&dev) {
                return rc;
            }
            let run = {
                let mut calls = self.pulse_calls.lock().unwrap();
                let counter = calls.entry(dev).or_insert(0);
                let run = *counter;
                *counter += 1;
                run
            };
            let runs = &self.sleeps_ms[dev];
            std::thread::sleep(Duration::from_millis(runs[run % runs.len()]));
            KERNEL_OK
        }

        fn run_p2p_check(&self, src: i32, dst: i32) -> (i32, f64) {
            let key = (src as usize, dst as usize);
            self.probed_links.lock().unwrap().push(key);
            *self.p2p.get(&key).unwrap_or(&(KERNEL_OK, 50.0))
        }
    }

    /// Probe returning scripted readouts in call order, then `None`.
    struct MockProbe {
        readouts: Mutex<Vec<Option<Vec<GpuStats>>>>,
    }

    impl MockProbe {
        fn new(readouts: Vec<Option<Vec<GpuStats>>>) -> Self {
            Self {
                readouts: Mutex::new(readouts),
            }
        }

        fn absent() -> Self {
            Self::new(Vec::new())
        }
    }

    impl GpuProbe for MockProbe {
        fn product_name(&self) -> String {
            "Mock GPU".to_string()
        }

        fn query_all(&self) -> Option<Vec<GpuStats>> {
            let mut readouts = self.readouts.lock().unwrap();
            if readouts.is_empty() {
                None
            } else {
                readouts.remove(0)
            }
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds {
            mean_latency: Duration::from_millis(500),
            cv_max: 0.20,
            p2p_min_gbs: 5.0,
            idle_temp_c: 70,
            clock_floor_fraction: 0.5,
        }
    }

    fn cool_stats(n: usize) -> Vec<GpuStats> {
        vec![
            GpuStats {
                sm_clock_mhz: 1900,
                max_sm_clock_mhz: 1980,
                temp_c: 35,
                ecc_errors: 0,
            };
            n
        ]
    }

    #[test]
    fn healthy_two_device_node_passes() {
        let pipeline = Pipeline::new(
            Arc::new(MockKernel::healthy(2)),
            Arc::new(MockProbe::new(vec![Some(cool_stats(2)), Some(cool_stats(2))])),
            thresholds(),
        );
        let (worst, verdict) = pipeline.run();
        assert!(verdict.is_ok());
        assert!(worst > Duration::ZERO);
    }

    #[test]
    fn probe_absence_passes_preflight_and_clock_check() {
        let pipeline = Pipeline::new(
            Arc::new(MockKernel::healthy(1)),
            Arc::new(MockProbe::absent()),
            thresholds(),
        );
        let (_, verdict) = pipeline.run();
        assert!(verdict.is_ok());
    }

    #[test]
    fn ecc_errors_fail_preflight_without_pulse() {
        let mut stats = cool_stats(2);
        stats[1].ecc_errors = 3;
        let pipeline = Pipeline::new(
            Arc::new(MockKernel::healthy(2)),
            Arc::new(MockProbe::new(vec![Some(stats)])),
            thresholds(),
        );
        let (worst, verdict) = pipeline.run();
        let err = verdict.unwrap_err();
        let f = err.failure().unwrap();
        assert_eq!(f.kind, FailureKind::PreFlight);
        assert_eq!(f.device, DeviceRef::Gpu(1));
        assert_eq!(f.measured, 3.0);
        assert_eq!(worst, Duration::ZERO); // pulse never ran
    }

    #[test]
    fn hot_device_fails_preflight() {
        let mut stats = cool_stats(1);
        stats[0].temp_c = 84;
        let pipeline = Pipeline::new(
            Arc::new(MockKernel::healthy(1)),
            Arc::new(MockProbe::new(vec![Some(stats)])),
            thresholds(),
        );
        let (_, verdict) = pipeline.run();
        let err = verdict.unwrap_err();
        let f = err.failure().unwrap();
        assert_eq!(f.kind, FailureKind::PreFlight);
        assert_eq!(f.unit, "c");
        assert_eq!(f.measured, 84.0);
        assert_eq!(f.threshold, 70.0);
    }

    #[test]
    fn slow_device_fails_latency() {
        let mut kernel = MockKernel::healthy(1);
        kernel.sleeps_ms[0] = vec![20; PULSE_RUNS];
        let mut t = thresholds();
        t.mean_latency = Duration::from_millis(5);
        let pipeline = Pipeline::new(Arc::new(kernel), Arc::new(MockProbe::absent()), t);

        let (worst, verdict) = pipeline.run();
        let err = verdict.unwrap_err();
        let f = err.failure().unwrap();
        assert_eq!(f.kind, FailureKind::LatencyExceeded);
        assert_eq!(f.unit, "ms");
        assert_eq!(f.threshold, 5.0);
        assert!(f.measured >= 20.0);
        assert!(worst >= Duration::from_millis(20));
    }

    #[test]
    fn erratic_device_fails_variance() {
        // Mean well under 500ms, spread far over cv 0.20.
        let mut kernel = MockKernel::healthy(1);
        kernel.sleeps_ms[0] = vec![1, 1, 1, 1, 60];
        let pipeline = Pipeline::new(
            Arc::new(kernel),
            Arc::new(MockProbe::absent()),
            thresholds(),
        );

        let (_, verdict) = pipeline.run();
        let err = verdict.unwrap_err();
        let f = err.failure().unwrap();
        assert_eq!(f.kind, FailureKind::HighVariance);
        assert_eq!(f.unit, "cv");
        assert!(f.measured > 0.20);
        assert!(f.cause.contains("fail-slow"));
    }

    #[test]
    fn cuda_rc_wraps_latency_kind() {
        let mut kernel = MockKernel::healthy(2);
        kernel.pulse_rc.insert(1, KERNEL_ERR_CUDA);
        let pipeline = Pipeline::new(
            Arc::new(kernel),
            Arc::new(MockProbe::absent()),
            thresholds(),
        );

        let (_, verdict) = pipeline.run();
        let err = verdict.unwrap_err();
        let f = err.failure().unwrap();
        assert_eq!(f.kind, FailureKind::LatencyExceeded);
        assert!(f.cause.contains("cuda error"));
        assert!(f.cause.contains("rc=1"));
    }

    #[test]
    fn oom_rc_wraps_latency_kind() {
        let mut kernel = MockKernel::healthy(1);
        kernel.pulse_rc.insert(0, KERNEL_ERR_OOM);
        let pipeline = Pipeline::new(
            Arc::new(kernel),
            Arc::new(MockProbe::absent()),
            thresholds(),
        );

        let (_, verdict) = pipeline.run();
        let f = verdict.unwrap_err().failure().unwrap().clone();
        assert!(f.cause.contains("out of device memory"));
    }

    #[test]
    fn unknown_rc_is_opaque() {
        let mut kernel = MockKernel::healthy(1);
        kernel.pulse_rc.insert(0, 9);
        let pipeline = Pipeline::new(
            Arc::new(kernel),
            Arc::new(MockProbe::absent()),
            thresholds(),
        );

        let (_, verdict) = pipeline.run();
        let err = verdict.unwrap_err();
        assert!(matches!(err, PulseError::Kernel { code: 9, device: 0, run: 1 }));
        assert!(!err.is_quarantine_cause());
    }

    #[test]
    fn p2p_ring_covers_every_segment_once() {
        let kernel = Arc::new(MockKernel::healthy(4));
        let pipeline = Pipeline::new(
            kernel.clone(),
            Arc::new(MockProbe::absent()),
            thresholds(),
        );
        let (_, verdict) = pipeline.run();
        assert!(verdict.is_ok());

        let probed: Vec<(usize, usize)> = kernel.probed_links.lock().unwrap().clone();
        let n = 4;
        assert_eq!(probed.len(), n);
        for i in 0..n {
            assert!(probed.contains(&(i, (i + 1) % n)), "missing segment {i}");
        }
        // Each device appears exactly once as source and once as destination.
        for i in 0..n {
            assert_eq!(probed.iter().filter(|(s, _)| *s == i).count(), 1);
            assert_eq!(probed.iter().filter(|(_, d)| *d == i).count(), 1);
        }
    }

    #[test]
    fn p2p_ring_skipped_on_single_device() {
        let kernel = Arc::new(MockKernel::healthy(1));
        let pipeline = Pipeline::new(
            kernel.clone(),
            Arc::new(MockProbe::absent()),
            thresholds(),
        );
        let (_, verdict) = pipeline.run();
        assert!(verdict.is_ok());
        assert!(kernel.probed_links.lock().unwrap().is_empty());
    }

    #[test]
    fn degraded_segment_fails_interconnect() {
        let mut kernel = MockKernel::healthy(4);
        kernel.p2p.insert((2, 3), (KERNEL_OK, 1.2));
        let pipeline = Pipeline::new(
            Arc::new(kernel),
            Arc::new(MockProbe::absent()),
            thresholds(),
        );

        let (_, verdict) = pipeline.run();
        let err = verdict.unwrap_err();
        let f = err.failure().unwrap();
        assert_eq!(f.kind, FailureKind::InterconnectDegraded);
        assert_eq!(f.device, DeviceRef::Link { src: 2, dst: 3 });
        assert!((f.measured - 1.2).abs() < 1e-9);
        assert_eq!(f.threshold, 5.0);
        assert_eq!(f.unit, "gbs");
    }

    #[test]
    fn peer_access_unavailable_fails_interconnect() {
        let mut kernel = MockKernel::healthy(2);
        kernel.p2p.insert((1, 0), (KERNEL_ERR_P2P, 0.0));
        let pipeline = Pipeline::new(
            Arc::new(kernel),
            Arc::new(MockProbe::absent()),
            thresholds(),
        );

        let (_, verdict) = pipeline.run();
        let f = verdict.unwrap_err().failure().unwrap().clone();
        assert_eq!(f.kind, FailureKind::InterconnectDegraded);
        assert_eq!(f.measured, 0.0);
        assert!(f.cause.contains("peer access unavailable"));
    }

    #[test]
    fn derated_clock_fails_as_latency_with_worst_mean() {
        let mut post = cool_stats(2);
        post[1].sm_clock_mhz = 600; // below 50% of 1980
        let pipeline = Pipeline::new(
            Arc::new(MockKernel::healthy(2)),
            Arc::new(MockProbe::new(vec![Some(cool_stats(2)), Some(post)])),
            thresholds(),
        );

        let (worst, verdict) = pipeline.run();
        let err = verdict.unwrap_err();
        let f = err.failure().unwrap();
        assert_eq!(f.kind, FailureKind::LatencyExceeded);
        assert_eq!(f.unit, "ms");
        assert_eq!(f.measured, worst.as_millis() as f64);
        assert_eq!(f.threshold, 500.0);
        assert!(f.cause.contains("power-derated"));
    }

    #[test]
    fn unreported_max_clock_is_skipped() {
        let mut post = cool_stats(1);
        post[0].max_sm_clock_mhz = 0;
        post[0].sm_clock_mhz = 0;
        let pipeline = Pipeline::new(
            Arc::new(MockKernel::healthy(1)),
            Arc::new(MockProbe::new(vec![Some(cool_stats(1)), Some(post)])),
            thresholds(),
        );
        let (_, verdict) = pipeline.run();
        assert!(verdict.is_ok());
    }

    #[test]
    fn device_count_error_clamps_to_one() {
        let mut kernel = MockKernel::healthy(1);
        kernel.devices = -1;
        let pipeline = Pipeline::new(
            Arc::new(kernel),
            Arc::new(MockProbe::absent()),
            thresholds(),
        );
        let (worst, verdict) = pipeline.run();
        assert!(verdict.is_ok());
        assert!(worst > Duration::ZERO);
    }
}
