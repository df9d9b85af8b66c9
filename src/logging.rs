//! Tracing subscriber setup for hosts that do not install their own

use crate::config::Configuration;
use tracing::Level;
use tracing_subscriber::EnvFilter;

const AWS_CRATES: [&str; 4] = [
    "aws_config",
    "aws_sdk_kinesis",
    "aws_sdk_dynamodb",
    "aws_smithy_runtime",
];

/// Filter for this crate at `info` (or `RUST_LOG`) with the AWS SDK crates
/// pinned to `aws_lib_log_level`
pub fn env_filter(config: &Configuration) -> EnvFilter {
    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kinesis_events=info"));
    aws_directives(config.aws_lib_log_level)
        .into_iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(base, |filter, directive| filter.add_directive(directive))
}

fn aws_directives(level: Level) -> Vec<String> {
    let level = level.to_string().to_ascii_lowercase();
    AWS_CRATES
        .iter()
        .map(|krate| format!("{}={}", krate, level))
        .collect()
}

/// Installs a global fmt subscriber; returns an error if one is already set
pub fn init_logging(config: &Configuration) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
