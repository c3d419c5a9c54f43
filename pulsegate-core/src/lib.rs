//! Pulsegate core library
//!
//! The GPU validation pipeline and everything it stands on: threshold
//! resolution, hardware probes, duration statistics, the failure taxonomy,
//! and the Prometheus collectors. No Kubernetes dependency; the k8s crate
//! drives this one.

pub mod failure;
pub mod kernel;
pub mod metrics;
pub mod pipeline;
pub mod smi;
pub mod stats;
pub mod thresholds;

// Re-export the types that cross crate boundaries.
pub use failure::{DeviceRef, FailureKind, PulseError, PulseFailure};
pub use kernel::{CudaKernel, CudaUnavailable, PulseKernel};
pub use pipeline::{Pipeline, PulseRunner, PULSE_RUNS};
pub use smi::{GpuProbe, GpuStats, SmiProbe};
pub use thresholds::Thresholds;
