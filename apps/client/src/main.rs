//! `remote-exec-client`: call a remote `execute_command` tool.
//!
//!   remote-exec-client --config targets.json local list-tools
//!   remote-exec-client --config targets.json remote exec --require-approval make deploy
//!
//! Results are printed to stdout as JSON; logs go to stderr.

mod targets;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use remote_exec_executor::CommandRequest;
use remote_exec_session::{EXECUTE_COMMAND, Session};
use remote_exec_transport::connect;
use serde_json::Value;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::targets::resolve_target;

#[derive(Debug, Parser)]
#[command(name = "remote-exec-client", about = "Call a remote execute_command tool", version)]
struct Cli {
    /// JSON file mapping target names to `{command, args?, env?}` or `{url}`.
    #[arg(long)]
    config: PathBuf,

    /// Target name from the config file.
    target: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the tools the target offers.
    ListTools,
    /// Run a command on the target.
    Exec {
        /// Launch detached and return immediately.
        #[arg(long)]
        background: bool,
        /// Ask for manual approval before running.
        #[arg(long)]
        require_approval: bool,
        /// Why the command is needed.
        #[arg(long, default_value = "")]
        explanation: String,
        /// Command line, joined with spaces.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    let descriptor = resolve_target(&cli.config, &cli.target)?;
    let session = Session::new(connect(&descriptor).await?)?;
    session
        .perform_handshake(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        .await?;

    let output = run(&session, cli.command).await;
    if let Err(e) = session.close().await {
        tracing::debug!("Failed to close session: {e}");
    }

    println!("{}", serde_json::to_string_pretty(&output?)?);
    Ok(())
}

async fn run(session: &Session, command: Command) -> anyhow::Result<Value> {
    match command {
        Command::ListTools => Ok(serde_json::to_value(session.list_tools().await?)?),
        Command::Exec {
            background,
            require_approval,
            explanation,
            command,
        } => {
            let request = CommandRequest {
                command: command.join(" "),
                explanation,
                background,
                require_approval,
            };
            let result = session
                .call_tool(EXECUTE_COMMAND, serde_json::to_value(&request)?)
                .await?;
            match result.structured_content {
                Some(outcome) => Ok(outcome),
                None => Ok(serde_json::to_value(result)?),
            }
        }
    }
}
