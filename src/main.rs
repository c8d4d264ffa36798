use mirage_term::config::{self, Config};
use mirage_term::context;
use mirage_term::models;
use mirage_term::server::{Server, Shared};
use mirage_term::session::SessionSettings;
use mirage_term::tools;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mirage", version, about = "LLM-imagined terminal over telnet")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the terminal server (default)
    Serve {
        /// Override the configured listen address
        #[arg(long)]
        listen: Option<String>,
    },
    /// Load and validate the configuration, then print a summary
    CheckConfig,
    /// Print the registered call schemas as JSON
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let cli = Cli::parse();
    match cli.command {
        Some(Command::CheckConfig) => check_config(cli.config.as_deref()).await,
        Some(Command::Tools) => print_tools(),
        Some(Command::Serve { listen }) => serve(cli.config.as_deref(), listen).await,
        None => serve(cli.config.as_deref(), None).await,
    }
}

async fn serve(config_path: Option<&std::path::Path>, listen: Option<String>) -> anyhow::Result<()> {
    let mut cfg = Config::resolve(config_path).await?;
    if let Some(listen) = listen {
        cfg.listen = listen;
        cfg.validate()?;
    }

    let system_prompt = context::build_system_prompt(&cfg).await?;
    let provider = models::build_provider(&cfg.model)?;
    info!(
        provider = cfg.model.provider.as_str(),
        model = %cfg.model.model,
        mode = ?cfg.session.mode,
        stateful = cfg.session.stateful,
        "model configured"
    );

    let shared = Shared {
        settings: Arc::new(SessionSettings::from_config(&cfg, system_prompt)),
        provider: Arc::from(provider),
        negotiate: cfg.telnet.negotiate,
    };
    let server = Server::bind(&cfg.listen, shared).await?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for Ctrl-C, shutting down"),
        }
        signal_cancel.cancel();
    });

    server.run(cancel).await?;
    info!("shutdown complete");
    Ok(())
}

async fn check_config(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);
    let cfg = Config::resolve(config_path).await?;
    let prompt = context::build_system_prompt(&cfg).await?;

    println!("config:    {}", path.display());
    println!("listen:    {}", cfg.listen);
    println!("provider:  {} ({})", cfg.model.provider.as_str(), cfg.model.model);
    println!("mode:      {:?}", cfg.session.mode);
    println!("stateful:  {}", cfg.session.stateful);
    println!("history:   {} turns", cfg.session.history_window);
    println!("telnet:    negotiate={}", cfg.telnet.negotiate);
    println!("prompt:    {} chars", prompt.chars().count());
    Ok(())
}

fn print_tools() -> anyhow::Result<()> {
    let mut all = tools::list_tools().to_vec();
    all.push(tools::terminal_output_tool("output"));
    let json = serde_json::to_string_pretty(&all).context("failed to serialise tool schemas")?;
    println!("{json}");
    Ok(())
}
