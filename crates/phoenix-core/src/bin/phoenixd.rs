//! `phoenixd`: serves the verification platform as line-delimited JSON-RPC
//! over stdin/stdout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use phoenix_core::api::handle_request;
use phoenix_core::config::EngineConfig;
use phoenix_core::engine::Platform;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "phoenixd")]
#[command(about = "Firmware verification engine serving JSON-RPC over stdio")]
#[command(version)]
struct Cli {
    /// JSON configuration file.
    #[arg(long, env = "PHOENIX_CONFIG")]
    config: Option<PathBuf>,

    /// Persist the registry and session logs here (overrides the config).
    #[arg(long, env = "PHOENIX_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = match &cli.config {
        Some(path) => match EngineConfig::from_json_file(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "Cannot load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };
    if cli.data_dir.is_some() {
        config.data_dir = cli.data_dir;
    }

    let platform = match Platform::new(config) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            tracing::error!(error = %e, "Cannot start platform");
            return ExitCode::FAILURE;
        }
    };

    let stdin = BufReader::new(tokio::io::stdin());
    match serve(platform, stdin, tokio::io::stdout()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "stdio transport failed");
            ExitCode::FAILURE
        }
    }
}

fn error_response(id: Value, code: i64, message: String) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}

/// One request per line in, one response per line out. Requests run
/// concurrently and each response is written when its handler finishes, so
/// a long `run_workflow` does not hold up polls. Runs until stdin closes and
/// every in-flight request has been answered.
async fn serve<R, W>(platform: Arc<Platform>, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut in_flight: JoinSet<Value> = JoinSet::new();
    let mut reading = true;

    loop {
        let response = tokio::select! {
            line = lines.next_line(), if reading => {
                let Some(line) = line? else {
                    tracing::info!(in_flight = in_flight.len(), "stdin closed, draining requests");
                    reading = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(req) => {
                        let platform = Arc::clone(&platform);
                        in_flight.spawn(async move { handle_request(&req, &platform).await });
                        continue;
                    }
                    Err(e) => error_response(Value::Null, -32700, format!("Parse error: {e}")),
                }
            }
            Some(joined) = in_flight.join_next() => match joined {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, "Request handler failed");
                    error_response(Value::Null, -32603, "Internal error".into())
                }
            },
            else => break,
        };
        output.write_all(response.to_string().as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    tracing::info!("shutting down");
    Ok(())
}
