//! CLI argument parsing for the pulsegate agent

use clap::Parser;

/// Pulsegate: quarantines zombie GPU nodes before the scheduler can place
/// distributed-training jobs on them.
#[derive(Debug, Parser)]
#[command(name = "pulsegate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Node name (from the downward API in a DaemonSet)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "PULSEGATE_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "PULSEGATE_LOG_JSON")]
    pub log_json: bool,

    /// Run a single pulse against the local GPUs and exit; no cluster access
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["pulsegate"]).unwrap();
        assert_eq!(cli.log_level, "info");
        assert!(!cli.log_json);
        assert!(!cli.once);
    }

    #[test]
    fn once_flag() {
        let cli = Cli::try_parse_from(["pulsegate", "--once"]).unwrap();
        assert!(cli.once);
    }

    #[test]
    fn node_name_flag() {
        let cli = Cli::try_parse_from(["pulsegate", "--node-name", "gpu-node-7"]).unwrap();
        assert_eq!(cli.node_name.as_deref(), Some("gpu-node-7"));
    }
}
