use std::net::SocketAddr;
use std::panic;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use coderunner::config::Config;
use coderunner::core::domain::{ExecutionRequest, SessionId};
use coderunner::core::pipeline::coordinator::Coordinator;
use coderunner::core::registry::LanguageRegistry;
use coderunner::native::sandbox::NativeSandbox;

#[derive(Parser, Debug)]
#[command(name = "coderunner", version, about = "Sandboxed multi-language code execution engine")]
struct Cli {
    /// YAML configuration file; CODERUNNER_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one source file and print the result as JSON
    Run {
        /// Language id or alias, e.g. python, js, c++
        #[arg(short, long)]
        language: String,
        /// Source file to execute
        file: PathBuf,
        /// File whose content is passed as stdin
        #[arg(long)]
        stdin: Option<PathBuf>,
        #[arg(long)]
        wall_clock_ms: Option<u64>,
        #[arg(long)]
        memory_bytes: Option<u64>,
    },
    /// Start the HTTP server
    Serve {
        /// Overrides `listen_addr` from the configuration
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let sandbox = Arc::new(NativeSandbox::from_config(&config));
    let listen_addr = config.listen_addr.clone();
    let coordinator = Arc::new(Coordinator::new(
        config,
        LanguageRegistry::builtin(),
        sandbox,
    ));

    match cli.command {
        Command::Run {
            language,
            file,
            stdin,
            wall_clock_ms,
            memory_bytes,
        } => {
            let source = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let mut request = ExecutionRequest::new(language, source);
            if let Some(path) = stdin {
                let input = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;
                request = request.with_stdin(input);
            }
            request.limits.wall_clock_ms = wall_clock_ms;
            request.limits.memory_bytes = memory_bytes;

            let result = coordinator.submit(&SessionId::random(), request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Serve { listen } => {
            let addr = match listen {
                Some(addr) => addr,
                None => listen_addr
                    .parse::<SocketAddr>()
                    .with_context(|| format!("invalid listen address `{}`", listen_addr))?,
            };
            coderunner::http::serve(coordinator, addr).await?;
        }
    }

    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
