//! Standalone pulse benchmark
//!
//! Validates and demonstrates the pulse pipeline without a running cluster.
//! Four simulated scenarios need no GPU; `real` invokes the full pipeline
//! and requires a cuda build. Output is a JSON report on stdout whose
//! measured_value/threshold_value fields are the literal numbers behind
//! each quarantine decision.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;

use pulsegate_core::{
    CudaKernel, DeviceRef, FailureKind, GpuProbe, Pipeline, PulseError, PulseFailure, PulseRunner,
    SmiProbe, Thresholds,
};

#[derive(Debug, Parser)]
#[command(name = "pulse-bench")]
#[command(version, about, long_about = None)]
struct Args {
    /// Pulse scenario to run
    #[arg(long, value_enum, default_value_t = Scenario::Real)]
    scenario: Scenario,

    /// Number of benchmark runs
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// The actual pulse against local GPUs; requires a cuda build.
    Real,
    /// A GPU passing all checks cleanly.
    Healthy,
    /// A GPU exceeding the mean-latency threshold.
    Straggler,
    /// A fail-slow GPU: acceptable mean, high CV.
    HighVariance,
    /// A broken interconnect ring segment.
    P2pDegraded,
}

impl Scenario {
    fn name(self) -> &'static str {
        match self {
            Scenario::Real => "real",
            Scenario::Healthy => "healthy",
            Scenario::Straggler => "straggler",
            Scenario::HighVariance => "high-variance",
            Scenario::P2pDegraded => "p2p-degraded",
        }
    }
}

#[derive(Debug, Serialize)]
struct RunResult {
    run: u32,
    elapsed_ms: i64,
    verdict: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    measured_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    threshold_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct Summary {
    total: u32,
    passed: u32,
    failed: u32,
    worst_elapsed_ms: i64,
    verdict: &'static str,
}

#[derive(Debug, Serialize)]
struct Report {
    timestamp: String,
    hostname: String,
    gpu_arch: String,
    calibrated_threshold_ms: i64,
    scenario: &'static str,
    runs: Vec<RunResult>,
    summary: Summary,
}

/// Build the pulse function for a scenario. Simulated scenarios are
/// threshold-aware so the numbers in the report stay plausible for the
/// detected hardware.
fn scenario_runner(scenario: Scenario, thresholds: &Thresholds) -> Result<Box<dyn PulseRunner>> {
    let threshold_ms = thresholds.threshold_ms();

    let runner: Box<dyn PulseRunner> = match scenario {
        Scenario::Real => {
            let kernel = CudaKernel::load()
                .context("--scenario=real needs a GPU and a cuda build")?;
            Box::new(Pipeline::new(
                Arc::new(kernel),
                Arc::new(SmiProbe),
                thresholds.clone(),
            ))
        }

        // Mean latency at 25% of threshold: clearly passing on any arch.
        Scenario::Healthy => Box::new(move || -> (Duration, Result<(), PulseError>) {
            let elapsed = Duration::from_millis((threshold_ms / 4).max(1) as u64);
            (elapsed, Ok(()))
        }),

        // 5x threshold: an unambiguous latency failure.
        Scenario::Straggler => Box::new(move || -> (Duration, Result<(), PulseError>) {
            let measured = threshold_ms * 5;
            let failure = PulseFailure {
                kind: FailureKind::LatencyExceeded,
                measured: measured as f64,
                threshold: threshold_ms as f64,
                unit: "ms",
                device: DeviceRef::Gpu(0),
                cause: format!(
                    "GPU 0: mean pulse latency {measured}ms exceeds {threshold_ms}ms threshold"
                ),
            };
            (Duration::from_millis(measured as u64), Err(failure.into()))
        }),

        // Mean at a third of threshold (passes the latency check) with
        // CV = 0.35: the textbook fail-slow pattern.
        Scenario::HighVariance => Box::new(move || -> (Duration, Result<(), PulseError>) {
            let elapsed = Duration::from_millis((threshold_ms / 3).max(1) as u64);
            let failure = PulseFailure {
                kind: FailureKind::HighVariance,
                measured: 0.350,
                threshold: 0.20,
                unit: "cv",
                device: DeviceRef::Gpu(0),
                cause: "GPU 0: run-to-run variance cv=0.350 exceeds 0.20 (fail-slow pattern)"
                    .to_string(),
            };
            (elapsed, Err(failure.into()))
        }),

        // Ring segment 2->3 at 1.2 GB/s against the 5 GB/s floor: a
        // partially failed switch fabric port.
        Scenario::P2pDegraded => Box::new(move || -> (Duration, Result<(), PulseError>) {
            let failure = PulseFailure {
                kind: FailureKind::InterconnectDegraded,
                measured: 1.20,
                threshold: 5.0,
                unit: "gbs",
                device: DeviceRef::Link { src: 2, dst: 3 },
                cause: format!(
                    "{}: 1.20 GB/s below 5.0 GB/s minimum",
                    DeviceRef::Link { src: 2, dst: 3 }
                ),
            };
            (Duration::ZERO, Err(failure.into()))
        }),
    };

    Ok(runner)
}

/// Run the pulse `count` times and record each outcome.
fn execute(runner: &dyn PulseRunner, count: u32) -> Vec<RunResult> {
    (1..=count)
        .map(|run| {
            let (elapsed, verdict) = runner.run_pulse();
            let mut result = RunResult {
                run,
                elapsed_ms: elapsed.as_millis() as i64,
                verdict: "pass",
                failure_reason: None,
                measured_value: None,
                threshold_value: None,
                unit: None,
            };
            if let Err(err) = verdict {
                result.verdict = "fail";
                result.failure_reason = Some(err.to_string());
                if let Some(f) = err.failure() {
                    result.measured_value = Some(f.measured);
                    result.threshold_value = Some(f.threshold);
                    result.unit = Some(f.unit);
                }
            }
            result
        })
        .collect()
}

/// Aggregate run results into the top-level verdict.
fn summarize(runs: &[RunResult]) -> Summary {
    let total = runs.len() as u32;
    let passed = runs.iter().filter(|r| r.verdict == "pass").count() as u32;
    let failed = total - passed;
    Summary {
        total,
        passed,
        failed,
        worst_elapsed_ms: runs.iter().map(|r| r.elapsed_ms).max().unwrap_or(0),
        verdict: if failed > 0 { "STRAGGLER" } else { "HEALTHY" },
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let probe = SmiProbe;
    let gpu_arch = probe.product_name();
    let thresholds = Thresholds::from_env(&gpu_arch);

    let runner = scenario_runner(args.scenario, &thresholds)?;
    let runs = execute(runner.as_ref(), args.count);

    let report = Report {
        timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default(),
        gpu_arch,
        calibrated_threshold_ms: thresholds.threshold_ms(),
        scenario: args.scenario.name(),
        summary: summarize(&runs),
        runs,
    };

    let out = serde_json::to_string_pretty(&report).context("encode report")?;
    println!("{out}");
    Ok(())
}
