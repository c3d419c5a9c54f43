//! Node reconciliation
//!
//! One end-to-end pass for one node: fetch, gate on ready recency, run the
//! pulse, then apply or clear the quarantine marker idempotently. The pulse
//! function and the cluster API are both injected so every scenario runs
//! against deterministic fakes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, NodeCondition, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::json;
use tracing::{error, info, warn};

use pulsegate_core::{metrics, FailureKind, PulseError, PulseRunner};

use crate::client::NodeApi;

/// Scheduling marker applied to quarantined nodes.
pub const QUARANTINE_TAINT_KEY: &str = "sunk.coreweave.com/zombie-quarantine";

/// Status condition recording why a node was quarantined or cleared.
pub const STRAGGLER_CONDITION: &str = "GPUStraggler";

const READY_CONDITION: &str = "Ready";
const DEFAULT_READY_WINDOW: Duration = Duration::from_secs(300);

/// How recently a Ready transition must have occurred for the node to count
/// as "just joined or rebooted". Override with READY_WINDOW_SECONDS;
/// invalid or non-positive values fall back to the default.
pub fn ready_window_from_env() -> Duration {
    parse_window(std::env::var("READY_WINDOW_SECONDS").ok().as_deref())
}

fn parse_window(raw: Option<&str>) -> Duration {
    raw.and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_READY_WINDOW)
}

/// Runs GPU pulse validation when the local node (re)joins the cluster.
pub struct Controller<C, P> {
    client: C,
    pulse: Arc<P>,
    /// Active calibrated latency ceiling, embedded in condition messages.
    threshold_ms: i64,
    ready_window: Duration,
}

impl<C, P> Controller<C, P>
where
    C: NodeApi,
    P: PulseRunner + 'static,
{
    pub fn new(client: C, pulse: Arc<P>, threshold_ms: i64) -> Self {
        Self {
            client,
            pulse,
            threshold_ms,
            ready_window: ready_window_from_env(),
        }
    }

    /// Swap the recency window. Used by tests to pin the gate.
    pub fn with_ready_window(mut self, window: Duration) -> Self {
        self.ready_window = window;
        self
    }

    /// The primary entry point, called on every ready edge. Fetches the
    /// node, gates on transition recency, runs the pulse, and propagates
    /// the verdict into cluster state.
    pub async fn reconcile_node(&self, node_name: &str) -> Result<()> {
        let node = self.client.get_node(node_name).await?;

        if !just_became_ready(&node, self.ready_window) {
            return Ok(()); // steady-state node, nothing to do
        }

        info!(node = node_name, "node ready after join/reboot, running GPU pulse");

        let pulse = Arc::clone(&self.pulse);
        let (elapsed, verdict) = tokio::task::spawn_blocking(move || pulse.run_pulse())
            .await
            .context("pulse task panicked")?;

        match verdict {
            Ok(()) => {
                info!(
                    node = node_name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "GPU pulse passed"
                );
                self.clear_quarantine(node_name, &node).await
            }
            Err(err) if err.is_quarantine_cause() => {
                let (log_reason, metric_reason) = quarantine_reason(&err);
                // The structured evidence record: a single log line carries
                // enough numeric detail to reconstruct the decision.
                if let Some(f) = err.failure() {
                    warn!(
                        node_name,
                        failure_reason = log_reason,
                        elapsed_ms = elapsed.as_millis() as u64,
                        measured_value = f.measured,
                        threshold_value = f.threshold,
                        unit = f.unit,
                        "zombie node quarantined"
                    );
                } else {
                    warn!(
                        node_name,
                        failure_reason = log_reason,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "zombie node quarantined"
                    );
                }
                metrics::inc_straggler(metric_reason);
                self.apply_quarantine(node_name, &node, elapsed).await
            }
            Err(err) => {
                // Hard failure: ECC, thermal, opaque driver codes. Same
                // mutation, louder log, separate counter label.
                error!(
                    node_name,
                    failure_reason = "pre_flight_failure",
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "GPU pulse hard failure, quarantining node"
                );
                metrics::inc_straggler("pre_flight_failure");
                self.apply_quarantine(node_name, &node, elapsed).await
            }
        }
    }

    /// Add the quarantine taint and record the straggler condition.
    /// Idempotent: a node that already carries the taint is left untouched.
    async fn apply_quarantine(&self, node_name: &str, node: &Node, elapsed: Duration) -> Result<()> {
        let mut taints = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default();

        if taints.iter().any(|t| t.key == QUARANTINE_TAINT_KEY) {
            return Ok(()); // already quarantined
        }

        taints.push(Taint {
            key: QUARANTINE_TAINT_KEY.to_string(),
            value: Some(humanize(elapsed)),
            effect: "NoSchedule".to_string(),
            time_added: None,
        });

        // Spec before status: a scheduler observing the taint before the
        // condition still reads a self-consistent node.
        self.client
            .patch_spec(node_name, json!({ "spec": { "taints": taints } }))
            .await?;

        let condition = self.straggler_condition(
            "True",
            "StragglerDetected",
            format!(
                "GPU pulse took {} (threshold {}ms)",
                humanize(elapsed),
                self.threshold_ms
            ),
        );
        let conditions = upsert_condition(node_conditions(node), condition);
        self.client
            .patch_status(node_name, json!({ "status": { "conditions": conditions } }))
            .await?;

        Ok(())
    }

    /// Strip the quarantine taint (when present) and set the straggler
    /// condition to False. The spec patch is skipped when the taint is
    /// absent so no empty mutation reaches the API server.
    async fn clear_quarantine(&self, node_name: &str, node: &Node) -> Result<()> {
        let taints = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default();

        let filtered: Vec<Taint> = taints
            .iter()
            .filter(|t| t.key != QUARANTINE_TAINT_KEY)
            .cloned()
            .collect();

        if filtered.len() != taints.len() {
            self.client
                .patch_spec(node_name, json!({ "spec": { "taints": filtered } }))
                .await?;
            info!(node_name, "zombie taint removed, node cleared for scheduling");
        }

        let condition = self.straggler_condition(
            "False",
            "PulsePassed",
            "GPU pulse passed; node cleared for scheduling".to_string(),
        );
        let conditions = upsert_condition(node_conditions(node), condition);
        self.client
            .patch_status(node_name, json!({ "status": { "conditions": conditions } }))
            .await?;

        Ok(())
    }

    fn straggler_condition(&self, status: &str, reason: &str, message: String) -> NodeCondition {
        NodeCondition {
            type_: STRAGGLER_CONDITION.to_string(),
            status: status.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message),
            last_transition_time: Some(Time(Utc::now())),
            last_heartbeat_time: None,
        }
    }
}

/// Log text and counter label for a quarantine-cause failure.
pub fn quarantine_reason(err: &PulseError) -> (&'static str, &'static str) {
    match err.failure().map(|f| f.kind) {
        Some(FailureKind::HighVariance) => (
            "fail-slow variance pattern (high CV across runs)",
            "high_variance",
        ),
        Some(FailureKind::InterconnectDegraded) => {
            ("NVLink/P2P interconnect degraded", "interconnect_degraded")
        }
        Some(FailureKind::LatencyExceeded) => {
            ("latency threshold exceeded", "latency_threshold_exceeded")
        }
        _ => ("hard hardware failure", "pre_flight_failure"),
    }
}

/// True when the node's Ready=True condition transitioned within `window`.
/// Nodes that have been stable for hours return false.
pub fn just_became_ready(node: &Node, window: Duration) -> bool {
    let Some(conditions) = node.status.as_ref().and_then(|s| s.conditions.as_ref()) else {
        return false;
    };
    for c in conditions {
        if c.type_ == READY_CONDITION && c.status == "True" {
            let Some(t) = &c.last_transition_time else {
                return false;
            };
            let age = Utc::now().signed_duration_since(t.0);
            return age < chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        }
    }
    false
}

/// Whether the node's Ready condition is True. `Unknown` counts as not
/// ready, so an Unknown-to-True flap re-arms the edge detector only via a
/// fresh watch connection.
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == READY_CONDITION))
        .is_some_and(|c| c.status == "True")
}

fn node_conditions(node: &Node) -> Vec<NodeCondition> {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default()
}

/// Replace the condition of the same type in place, or append. Never
/// duplicates.
fn upsert_condition(mut conditions: Vec<NodeCondition>, c: NodeCondition) -> Vec<NodeCondition> {
    if let Some(existing) = conditions.iter_mut().find(|e| e.type_ == c.type_) {
        *existing = c;
    } else {
        conditions.push(c);
    }
    conditions
}

/// Human-readable elapsed duration for taint values and condition messages,
/// truncated to milliseconds.
fn humanize(elapsed: Duration) -> String {
    humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)).to_string()
}
