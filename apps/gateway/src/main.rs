use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use sandbox::{RejectionKind, SandboxConfig, SandboxError, SandboxGateway, SeedManifest};
use serde_json::json;
use tracing::{dispatcher, info};

/// Operator entry point for a sandboxed file directory.
///
/// The base directory comes from `SANDBOX_BASE_DIR` and is created if missing.
#[derive(Debug, Parser)]
#[command(name = "gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write fixture files, from a JSON manifest or the built-in samples.
    Seed { manifest: Option<PathBuf> },
    /// Read a file by untrusted name and print its canonical path and content.
    Read { name: String },
    /// Show where a name resolves without reading it.
    Resolve { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let gateway = SandboxGateway::new(SandboxConfig::from_env()?)?;
    info!(base = %gateway.base_dir().display(), "sandbox gateway ready");

    let outcome = match cli.command {
        Command::Seed { manifest } => {
            let manifest = match manifest {
                Some(path) => SeedManifest::from_path(path)?,
                None => SeedManifest::samples(),
            };
            gateway
                .seed_files_async(manifest)
                .await
                .map(|report| json!({ "ok": true, "base": gateway.base_dir(), "report": report }))
        }
        Command::Read { name } => gateway
            .read_async(name)
            .await
            .map(|content| json!(content)),
        Command::Resolve { name } => gateway
            .resolve(&name)
            .map(|resolved| json!({ "path": resolved.as_path() })),
    };

    match outcome {
        Ok(body) => {
            println!("{body}");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => Ok(report_rejection(&err)),
    }
}

fn report_rejection(err: &SandboxError) -> ExitCode {
    let kind = err.kind();
    eprintln!(
        "{}",
        json!({ "error": kind, "message": err.to_string(), "retryable": kind.is_retryable() })
    );
    ExitCode::from(exit_status(kind))
}

// Client-side rejections stay distinct from each other and from server faults.
fn exit_status(kind: RejectionKind) -> u8 {
    match kind {
        RejectionKind::InvalidInput => 2,
        RejectionKind::Traversal => 3,
        RejectionKind::NotFound => 4,
        RejectionKind::DoubleEncoding => 5,
        RejectionKind::FileTooLarge => 6,
        RejectionKind::Io => 74,
        RejectionKind::InvalidConfig => 78,
    }
}

fn init_tracing() {
    if dispatcher::has_been_set() {
        return;
    }
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}
