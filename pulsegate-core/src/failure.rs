//! Failure taxonomy for the pulse pipeline
//!
//! Four sentinel kinds plus a structured carrier. Controllers route on the
//! kind (quarantine reason, metrics label, log level) and extract the
//! measured/threshold pair for structured evidence logging.

use std::fmt;

use thiserror::Error;

/// Sentinel failure kinds with fixed identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Mean GEMM latency exceeded the threshold, or the post-pulse clock
    /// check confirmed a power-derated state under load.
    LatencyExceeded,
    /// Mean latency acceptable but run-to-run coefficient of variation
    /// exceeded the ceiling: the fail-slow signature. Erratic devices drag
    /// AllReduce barriers even when their mean looks fine.
    HighVariance,
    /// P2P bandwidth on a ring segment below the minimum, or peer access
    /// reported unavailable. An NVLink failure that lets GEMM pass but
    /// stalls AllReduce is the canonical zombie-node scenario.
    InterconnectDegraded,
    /// Hard disqualifier found before the pulse ran: uncorrectable ECC
    /// errors or incomplete thermal recovery.
    PreFlight,
}

impl FailureKind {
    /// True for the three straggler kinds. PreFlight failures also
    /// quarantine but take the hard-failure log path.
    pub fn is_quarantine_cause(self) -> bool {
        !matches!(self, FailureKind::PreFlight)
    }
}

/// Which device or link a failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRef {
    /// A single GPU by 0-based index.
    Gpu(usize),
    /// A directed interconnect segment.
    Link { src: usize, dst: usize },
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRef::Gpu(i) => write!(f, "GPU {i}"),
            DeviceRef::Link { src, dst } => write!(f, "GPU {src}\u{2192}{dst}"),
        }
    }
}

/// A failure with the measured value and threshold that triggered it.
///
/// The carrier preserves kind identity so predicate checks stay O(1), and
/// the numeric evidence so a single log record is self-contained proof of
/// why the node was caught.
#[derive(Debug, Clone, Error)]
#[error("{cause}")]
pub struct PulseFailure {
    pub kind: FailureKind,
    /// Latency ms, CV ratio, bandwidth GB/s, ECC count, or temperature C.
    pub measured: f64,
    pub threshold: f64,
    /// "ms", "cv", "gbs" for straggler kinds; "count" or "c" for pre-flight.
    pub unit: &'static str,
    pub device: DeviceRef,
    pub cause: String,
}

/// Verdict-level error from the pulse pipeline.
#[derive(Debug, Error)]
pub enum PulseError {
    /// A threshold violation with structured evidence attached.
    #[error(transparent)]
    Failure(#[from] PulseFailure),

    /// The native kernel returned a code outside the documented set.
    #[error("gpu_pulse returned code {code} on GPU {device} run {run}")]
    Kernel { code: i32, device: usize, run: usize },
}

impl PulseError {
    /// The structured carrier, when one is present.
    pub fn failure(&self) -> Option<&PulseFailure> {
        match self {
            PulseError::Failure(f) => Some(f),
            PulseError::Kernel { .. } => None,
        }
    }

    /// Whether this failure should be reported as a straggler (warning path)
    /// rather than a hard hardware failure (error path). Both quarantine.
    pub fn is_quarantine_cause(&self) -> bool {
        self.failure().is_some_and(|f| f.kind.is_quarantine_cause())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn carrier(kind: FailureKind) -> PulseError {
        PulseError::Failure(PulseFailure {
            kind,
            measured: 1.0,
            threshold: 2.0,
            unit: "ms",
            device: DeviceRef::Gpu(0),
            cause: "test".to_string(),
        })
    }

    #[test]
    fn straggler_kinds_are_quarantine_causes() {
        assert!(carrier(FailureKind::LatencyExceeded).is_quarantine_cause());
        assert!(carrier(FailureKind::HighVariance).is_quarantine_cause());
        assert!(carrier(FailureKind::InterconnectDegraded).is_quarantine_cause());
    }

    #[test]
    fn preflight_and_opaque_are_not() {
        assert!(!carrier(FailureKind::PreFlight).is_quarantine_cause());

        let opaque = PulseError::Kernel {
            code: 7,
            device: 1,
            run: 3,
        };
        assert!(!opaque.is_quarantine_cause());
        assert!(opaque.failure().is_none());
    }

    #[test]
    fn carrier_display_uses_cause() {
        let err = PulseError::Failure(PulseFailure {
            kind: FailureKind::InterconnectDegraded,
            measured: 1.2,
            threshold: 5.0,
            unit: "gbs",
            device: DeviceRef::Link { src: 2, dst: 3 },
            cause: format!("{}: bandwidth too low", DeviceRef::Link { src: 2, dst: 3 }),
        });
        assert!(err.to_string().contains("GPU 2\u{2192}3"));
    }

    #[test]
    fn opaque_display_names_code_and_run() {
        let err = PulseError::Kernel {
            code: 9,
            device: 0,
            run: 2,
        };
        assert_eq!(err.to_string(), "gpu_pulse returned code 9 on GPU 0 run 2");
    }
}
