//! Prometheus collectors for the GPU validator

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec,
    HistogramVec, IntCounterVec,
};

/// Per-device histogram of mean GEMM latency across the five timed runs.
/// Buckets span 1ms to ~131s so both a healthy A100 (~25ms) and a worst-case
/// thermal stall land inside the range.
static PULSE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gpu_validator_pulse_duration_seconds",
        "Mean wall-clock duration of GPU GEMM pulse runs per device.",
        &["device"],
        prometheus::exponential_buckets(0.001, 2.0, 18).expect("static bucket spec")
    )
    .expect("register pulse_duration")
});

/// Per-device gauge of the coefficient of variation across the last pulse.
/// A healthy deterministic GEMM workload sits well below 0.05.
static PULSE_CV: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!(
            "gpu_validator_pulse_cv",
            "Coefficient of variation (sigma/mu) across GEMM pulse runs per device."
        ),
        &["device"]
    )
    .expect("register pulse_cv")
});

/// Quarantine events by failure reason. Observed values:
/// latency_threshold_exceeded, high_variance, interconnect_degraded,
/// pre_flight_failure.
static STRAGGLER_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "gpu_validator_straggler_detected_total",
            "Total number of nodes quarantined by the GPU validator, by failure reason."
        ),
        &["reason"]
    )
    .expect("register straggler_total")
});

/// Record one device's mean pulse duration. `device` is the 0-based GPU
/// index as a decimal string.
pub fn observe_pulse_duration(device: &str, seconds: f64) {
    PULSE_DURATION.with_label_values(&[device]).observe(seconds);
}

/// Record one device's run-to-run coefficient of variation.
pub fn set_pulse_cv(device: &str, cv: f64) {
    PULSE_CV.with_label_values(&[device]).set(cv);
}

/// Count one quarantine event under the given reason label.
pub fn inc_straggler(reason: &str) {
    STRAGGLER_TOTAL.with_label_values(&[reason]).inc();
}

/// Current value of the straggler counter for a reason label. Test support.
pub fn straggler_count(reason: &str) -> u64 {
    STRAGGLER_TOTAL.with_label_values(&[reason]).get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collectors_register_and_accept_samples() {
        observe_pulse_duration("0", 0.025);
        set_pulse_cv("0", 0.013);
        inc_straggler("interconnect_degraded");
        assert!(straggler_count("interconnect_degraded") >= 1);
    }

    #[test]
    fn exposition_contains_stable_names() {
        observe_pulse_duration("1", 0.040);
        let families = prometheus::gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"gpu_validator_pulse_duration_seconds"));
        assert!(names.contains(&"gpu_validator_pulse_cv"));
        assert!(names.contains(&"gpu_validator_straggler_detected_total"));
    }
}
