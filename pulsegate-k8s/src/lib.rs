//! Pulsegate Kubernetes integration
//!
//! Cluster client wrapper, the reconciliation controller that turns pulse
//! verdicts into taint and condition mutations, and the ready-edge watch
//! loop that drives it.

pub mod client;
pub mod reconciler;
pub mod watch;

pub use client::{K8sClient, NodeApi};
pub use reconciler::{Controller, QUARANTINE_TAINT_KEY, STRAGGLER_CONDITION};
pub use watch::{run_watch_loop, NodeLocks};
