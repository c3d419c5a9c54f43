//! Management-utility probes
//!
//! Thin wrappers over `nvidia-smi`. Absence of the utility is "no data",
//! never an error: pre-flight and clock validation both degrade to pass so
//! minimal container images without the utility can still run the pulse.

use std::process::Command;

use tracing::debug;

/// One device's management-utility readout, in ascending index order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuStats {
    pub sm_clock_mhz: i64,
    pub max_sm_clock_mhz: i64,
    pub temp_c: i64,
    /// Uncorrectable ECC errors since last boot, aggregate.
    pub ecc_errors: i64,
}

/// Read-only view of the management utility. The pipeline takes this as a
/// trait object so tests can script readouts without the utility installed.
pub trait GpuProbe: Send + Sync {
    /// Product name of device 0, or "unknown" on any failure.
    fn product_name(&self) -> String;

    /// Stats for every visible device, or `None` when the utility is absent
    /// or its output is unusable.
    fn query_all(&self) -> Option<Vec<GpuStats>>;
}

/// Probe backed by the real `nvidia-smi` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmiProbe;

impl GpuProbe for SmiProbe {
    fn product_name(&self) -> String {
        let out = Command::new("nvidia-smi")
            .args(["--query-gpu=name", "--format=csv,noheader", "--id=0"])
            .output();
        match out {
            Ok(out) if out.status.success() => {
                let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if name.is_empty() {
                    "unknown".to_string()
                } else {
                    name
                }
            }
            _ => "unknown".to_string(),
        }
    }

    fn query_all(&self) -> Option<Vec<GpuStats>> {
        // No --id: one CSV row per visible device in ascending index order.
        // Under a device plugin the container sees only its assigned GPUs,
        // so the rows always reflect the local topology.
        let out = Command::new("nvidia-smi")
            .args([
                "--query-gpu=clocks.sm,clocks.max.sm,temperature.gpu,ecc.errors.uncorrected.aggregate.total",
                "--format=csv,noheader,nounits",
            ])
            .output();
        let out = match out {
            Ok(out) if out.status.success() => out,
            Ok(out) => {
                debug!(code = ?out.status.code(), "nvidia-smi exited non-zero, treating as no data");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "nvidia-smi unavailable, treating as no data");
                return None;
            }
        };

        parse_query_output(&String::from_utf8_lossy(&out.stdout))
    }
}

/// Parse the four-column CSV readout. Tolerant by design: "N/A" and "[N/A]"
/// map to 0, as does any unparseable numeric token. A row with the wrong
/// column count invalidates the whole readout.
fn parse_query_output(raw: &str) -> Option<Vec<GpuStats>> {
    let mut stats = Vec::new();
    for line in raw.trim().lines() {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            debug!(line, "unexpected field count in nvidia-smi output");
            return None;
        }
        stats.push(GpuStats {
            sm_clock_mhz: parse_field(fields[0]),
            max_sm_clock_mhz: parse_field(fields[1]),
            temp_c: parse_field(fields[2]),
            ecc_errors: parse_field(fields[3]),
        });
    }
    Some(stats)
}

fn parse_field(s: &str) -> i64 {
    if s == "N/A" || s == "[N/A]" {
        return 0;
    }
    s.parse().unwrap_or(0)
}
