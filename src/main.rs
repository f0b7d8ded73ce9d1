use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trace_redactor::{ContextBuilder, TraceRedactor};

/// Removes other applications' data from a Perfetto trace, keeping only what
/// belongs to the given package uid.
#[derive(Debug, Parser)]
struct Command {
    /// Trace to redact.
    input: PathBuf,
    /// Where to write the redacted trace.
    output: PathBuf,
    /// Uid of the package whose data is allowed to remain.
    #[arg(long)]
    package_uid: u64,
    /// Package name recorded alongside the uid, if known.
    #[arg(long)]
    package_name: Option<String>,
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let opts = Command::parse();

    let default_filter = if opts.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let trace = std::fs::read(&opts.input)
        .with_context(|| format!("failed to read {}", opts.input.display()))?;

    let mut redactor = TraceRedactor::standard()?;
    let context = ContextBuilder::new().with_package(opts.package_uid, opts.package_name);
    let redacted = redactor.redact(&trace, context)?;

    std::fs::write(&opts.output, &redacted)
        .with_context(|| format!("failed to write {}", opts.output.display()))?;

    info!(
        input = %opts.input.display(),
        output = %opts.output.display(),
        bytes_in = trace.len(),
        bytes_out = redacted.len(),
        "trace redacted"
    );

    Ok(())
}
