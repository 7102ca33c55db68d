use ai_gateway::config::config_search_paths;
use ai_gateway::providers::Provider;
use ai_gateway::{build_router, AppState, GatewayConfig, HttpProviderClient, SharedUsageLog};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "ai-gateway",
    about = "LLM gateway that translates between chat-completions, messages and generate-content",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Usage ledger path (overrides config)
    #[arg(long)]
    usage_log: Option<PathBuf>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ai_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(path) = cli.usage_log {
        config.usage_log = path;
    }

    info!(version = env!("CARGO_PKG_VERSION"), port = config.port, "starting ai-gateway");
    for provider in Provider::ALL {
        match config.resolve_api_key(provider) {
            Ok(_) => info!(%provider, base_url = %config.effective_base_url(provider), "provider ready"),
            Err(e) => warn!(%provider, "{e}; requests routed here will fail"),
        }
    }
    info!(
        aliases = config.models.len(),
        access_keys = config.access_keys.len(),
        usage_log = %config.usage_log.display(),
        "config loaded"
    );
    if !config.requires_access_key() {
        warn!("no access keys configured, the gateway is open");
    }

    let usage = SharedUsageLog::open(&config.usage_log)?;
    let client = HttpProviderClient::new(&config)?;
    let bind_addr = format!("0.0.0.0:{}", config.port);

    let state = Arc::new(AppState::new(config, client, usage));
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
