use std::{path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use wiregate::{
    DetectingGateway, DiscoveryPoller, GatewayService, HttpClientAdapter, HttpProxyHandler,
    adapters::{admin_router, serve_admin},
    config::{ConfigValidator, GatewayConfig, load_config},
    metrics,
    ports::http_client::HttpClient,
    tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "wiregate.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "wiregate.toml")]
        config: String,
    },
    /// Write a commented default configuration file
    Init {
        #[clap(short, long, default_value = "wiregate.toml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        #[clap(short, long, default_value = "wiregate.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config: GatewayConfig = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    tracing_setup::init_tracing(&config.logging)?;
    metrics::init_metrics();

    ConfigValidator::validate(&config).context("Invalid configuration")?;
    tracing::info!(config = %config_path, "Configuration loaded");

    let gateway = Arc::new(GatewayService::new(&config).context("Failed to build routing state")?);
    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);
    let http_proxy = Arc::new(HttpProxyHandler::from_config(
        gateway.clone(),
        http_client,
        &config.http,
    )?);
    let poller = Arc::new(DiscoveryPoller::from_config(
        &config.discovery,
        gateway.clone(),
    )?);

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!(error = %e, "Signal handler error");
        }
    });

    let discovery_task = tokio::spawn(poller.clone().run(graceful_shutdown.shutdown_token()));

    let admin_task = match &config.admin {
        Some(admin) => {
            let listener = tokio::net::TcpListener::bind(&admin.listen_addr)
                .await
                .with_context(|| format!("Failed to bind admin listener on {}", admin.listen_addr))?;
            let router = admin_router(gateway.clone(), Some(poller.clone()));
            let token = graceful_shutdown.shutdown_token();
            Some(tokio::spawn(serve_admin(listener, router, token)))
        }
        None => None,
    };

    let listener = DetectingGateway::bind(&config.listen_addr).await?;
    let acceptor = Arc::new(DetectingGateway::new(gateway, http_proxy));
    let result = acceptor
        .run(listener, graceful_shutdown.shutdown_token())
        .await;

    // the accept loop only returns on shutdown or error; stop the rest either way
    graceful_shutdown.trigger_shutdown(wiregate::utils::ShutdownReason::Graceful);
    if let Err(e) = discovery_task.await {
        tracing::warn!(error = %e, "Discovery task ended abnormally");
    }
    if let Some(admin_task) = admin_task {
        match admin_task.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "Admin server error"),
            Err(e) => tracing::warn!(error = %e, "Admin task ended abnormally"),
            Ok(Ok(())) => {}
        }
    }

    tracing::info!("Graceful shutdown completed");
    result
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration is valid");
            println!("   - Listen address: {}", config.listen_addr);
            println!("   - Protocols: {}", config.protocols.join(", "));
            println!("   - HTTP mappings: {}", config.http.mappings.len());
            println!(
                "   - Admin endpoint: {}",
                config
                    .admin
                    .as_ref()
                    .map_or("disabled", |admin| admin.listen_addr.as_str())
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# wiregate configuration

# Single port every protocol is accepted on
listen_addr = "0.0.0.0:8080"

# How long a client may take to identify its protocol
connection_timeout = "5s"
backend_connect_timeout = "5s"

# Detection order; the first matching protocol wins
protocols = ["http", "mqtt", "stomp", "amqp", "openwire"]

# Version of this gateway; other versions stay hidden unless a template routes on {version}
# gateway_version = "1.0"

# Virtual host for clients that do not announce one
# default_virtual_host = "broker"

# random | round-robin | sticky
tcp_load_balancer = "round-robin"
retry_next_candidate = false

[http]
# external_url = "http://gateway-host:80"
show_mapping_index = true
request_timeout = "30s"

[[http.mappings]]
uri_template = "{contextPath}/"
load_balancer = "round-robin"
reverse_headers = true

[discovery]
poll_interval = "5s"

[discovery.source]
type = "static"

[[discovery.source.services]]
name = "crm"
labels = { version = "1.0" }
urls = ["http://127.0.0.1:8183/cxf/crm"]

# [admin]
# listen_addr = "127.0.0.1:9090"

[logging]
level = "info"
json = false
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("   Run 'wiregate serve --config {config_path}' to start the gateway");
    Ok(())
}
