//! Threshold resolution
//!
//! Each limit resolves independently: operator override from the environment
//! wins, then the architecture-calibrated default, then a conservative
//! fallback. Invalid or non-positive overrides are silently ignored so a
//! typo in a DaemonSet manifest can never stop the agent from running.

use std::time::Duration;

/// Post-pulse SM clock floor as a fraction of the device maximum. Not
/// env-configurable; changing it requires a rebuild.
pub const CLOCK_FLOOR_FRACTION: f64 = 0.5;

/// The calibrated numeric limits for one validation pass. Resolved once at
/// process start and passed by value; immutable afterwards.
#[derive(Debug, Clone)]
pub struct Thresholds {
    /// Mean GEMM latency ceiling per device.
    pub mean_latency: Duration,
    /// Coefficient-of-variation ceiling across runs on a single device.
    pub cv_max: f64,
    /// Minimum acceptable NVLink/PCIe P2P bandwidth.
    pub p2p_min_gbs: f64,
    /// GPU temperature ceiling at pre-flight, Celsius.
    pub idle_temp_c: i64,
    /// SM clock floor fraction, fixed at [`CLOCK_FLOOR_FRACTION`].
    pub clock_floor_fraction: f64,
}

impl Thresholds {
    /// Resolve all limits from the environment and the given GPU product
    /// name (device 0, as reported by the management utility).
    pub fn from_env(product_name: &str) -> Self {
        let env = |key: &str| std::env::var(key).ok();
        Self::resolve(
            env("PULSE_THRESHOLD_MS").as_deref(),
            env("PULSE_CV_MAX").as_deref(),
            env("P2P_MIN_GBS").as_deref(),
            env("IDLE_TEMP_MAX").as_deref(),
            product_name,
        )
    }

    /// Pure resolution over raw override strings. Split out so tests can
    /// exercise every precedence rule without mutating process state.
    fn resolve(
        latency_ms: Option<&str>,
        cv_max: Option<&str>,
        p2p_min_gbs: Option<&str>,
        idle_temp_c: Option<&str>,
        product_name: &str,
    ) -> Self {
        let mean_latency = parse_positive_int(latency_ms)
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or_else(|| calibrated_latency(product_name));

        Self {
            mean_latency,
            cv_max: parse_positive_float(cv_max).unwrap_or(0.20),
            p2p_min_gbs: parse_positive_float(p2p_min_gbs).unwrap_or(5.0),
            idle_temp_c: parse_positive_int(idle_temp_c).unwrap_or(70),
            clock_floor_fraction: CLOCK_FLOOR_FRACTION,
        }
    }

    /// The active GEMM latency ceiling in milliseconds. Used by the
    /// benchmark harness and embedded in quarantine condition messages.
    pub fn threshold_ms(&self) -> i64 {
        self.mean_latency.as_millis() as i64
    }
}

/// Architecture-calibrated GEMM latency ceiling, derived from nominal FP32
/// GEMM performance at P0 clocks with roughly 4-5x headroom:
///
///   A100 SXM4:  ~25ms  -> 100ms
///   H100 SXM5:  ~8ms   -> 35ms (H200 shares it)
///   B200/GB200: ~3ms   -> 15ms
///
/// Falls back to 500ms for unrecognized or unavailable hardware.
fn calibrated_latency(product_name: &str) -> Duration {
    let name = product_name.to_uppercase();
    let ms = if name.contains("B200") || name.contains("GB200") {
        15
    } else if name.contains("H100") || name.contains("H200") {
        35
    } else if name.contains("A100") {
        100
    } else {
        500
    };
    Duration::from_millis(ms)
}

fn parse_positive_int(s: Option<&str>) -> Option<i64> {
    s?.trim().parse::<i64>().ok().filter(|v| *v > 0)
}

fn parse_positive_float(s: Option<&str>) -> Option<f64> {
    s?.trim().parse::<f64>().ok().filter(|v| *v > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_matches_known_architectures() {
        let cases = [
            ("NVIDIA B200", 15),
            ("NVIDIA GB200 NVL72", 15),
            ("NVIDIA H100 80GB HBM3", 35),
            ("NVIDIA H200", 35),
            ("NVIDIA A100-SXM4-80GB", 100),
            ("Tesla V100-SXM2-16GB", 500),
            ("unknown", 500),
        ];
        for (name, want_ms) in cases {
            assert_eq!(
                calibrated_latency(name),
                Duration::from_millis(want_ms),
                "product name {name:?}"
            );
        }
    }

    #[test]
    fn calibration_is_case_insensitive() {
        assert_eq!(calibrated_latency("nvidia h100"), Duration::from_millis(35));
        assert_eq!(calibrated_latency("a100-sxm4"), Duration::from_millis(100));
    }

    #[test]
    fn override_wins_when_valid() {
        let t = Thresholds::resolve(Some("250"), None, None, None, "NVIDIA A100");
        assert_eq!(t.mean_latency, Duration::from_millis(250));
    }

    #[test]
    fn invalid_overrides_fall_through() {
        for bad in [Some("abc"), Some(""), Some("-5"), Some("0"), None] {
            let t = Thresholds::resolve(bad, None, None, None, "NVIDIA A100");
            assert_eq!(t.mean_latency, Duration::from_millis(100), "override {bad:?}");
        }
    }

    #[test]
    fn float_overrides_parse_or_default() {
        let t = Thresholds::resolve(None, Some("0.35"), Some("12.5"), None, "x");
        assert!((t.cv_max - 0.35).abs() < 1e-9);
        assert!((t.p2p_min_gbs - 12.5).abs() < 1e-9);

        let t = Thresholds::resolve(None, Some("-1.0"), Some("nope"), None, "x");
        assert!((t.cv_max - 0.20).abs() < 1e-9);
        assert!((t.p2p_min_gbs - 5.0).abs() < 1e-9);
    }

    #[test]
    fn temperature_override_and_fallback() {
        let t = Thresholds::resolve(None, None, None, Some("85"), "x");
        assert_eq!(t.idle_temp_c, 85);

        let t = Thresholds::resolve(None, None, None, Some("0"), "x");
        assert_eq!(t.idle_temp_c, 70);
    }

    #[test]
    fn clock_floor_is_fixed() {
        let t = Thresholds::resolve(None, None, None, None, "x");
        assert_eq!(t.clock_floor_fraction, CLOCK_FLOOR_FRACTION);
    }

    #[test]
    fn threshold_ms_reflects_active_value() {
        let t = Thresholds::resolve(Some("42"), None, None, None, "x");
        assert_eq!(t.threshold_ms(), 42);
    }
}
