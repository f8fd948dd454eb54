use cidgate::cid::{CidResolver, MemoryStore};
use cidgate::config::Config;
use cidgate::executor::{HttpTargetExecutor, PoolConfig};
use cidgate::middleware::LoggingMiddleware;
use cidgate::render::HtmlRenderer;
use cidgate::server::GatewayServer;
use cidgate::service::GatewayService;
use cidgate::transform::{CidTemplateStore, TransformRegistry};
use cidgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cidgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("cidgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    for name in config.shadowed_gateways() {
        warn!(
            gateway = %name,
            "Gateway name is shadowed by a built-in route; reach it via /gateway/test/.../as/{}",
            name
        );
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;

    // Content-addressed sources: in-process store first, then the CID directory
    let store = Arc::new(MemoryStore::new());
    let resolver = CidResolver::new(store, config.server.cid_dir.clone());

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    };
    let executor = HttpTargetExecutor::new(
        tokio::runtime::Handle::current(),
        &config.server.internal_base_url(),
        pool_config,
    );

    let service = GatewayService::new(
        config.gateways.clone(),
        Arc::new(TransformRegistry::new(resolver.clone())),
        Arc::new(CidTemplateStore::new(resolver.clone())),
        Arc::new(executor),
        Arc::new(HtmlRenderer::new()),
    )
    .with_middleware(Arc::new(LoggingMiddleware::new()));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = GatewayServer::new(bind_addr, Arc::new(service), shutdown_rx).with_content(resolver);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        internal_base_url = %config.server.internal_base_url(),
        cid_dir = %config.server.cid_dir.display(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    for (name, gateway) in config.gateways.iter() {
        info!(
            gateway = %name,
            request_transform = gateway.request_transform.as_deref().unwrap_or("-"),
            response_transform = gateway.response_transform.as_deref().unwrap_or("-"),
            target = gateway.target.as_deref().unwrap_or("(internal)"),
            templates = gateway.templates.len(),
            "Gateway configured"
        );
    }
}
