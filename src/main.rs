use std::{path::Path, sync::Arc};

use clap::{Parser, ValueEnum};
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tollgate::{
    GatewayContext, GracefulShutdown, TcpRouter,
    config::{GatewayConfig, GatewayConfigValidator, ProtocolKind, load_config, load_service_file},
    proxy::{serve_http, serve_https},
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// What to run: the proxy servers, or a configuration check
    #[clap(long, value_enum)]
    endpoint: Endpoint,

    /// Gateway configuration file (YAML, TOML or JSON)
    #[clap(long)]
    config: String,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Endpoint {
    Server,
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let config = load_config(&args.config)
        .wrap_err_with(|| format!("Failed to load configuration from {}", args.config))?;
    GatewayConfigValidator::validate(&config)
        .map_err(|e| eyre!("Configuration validation failed:\n{e}"))?;

    match args.endpoint {
        Endpoint::Validate => validate_command(&args.config, &config),
        Endpoint::Server => run_server(config).await,
    }
}

fn validate_command(config_path: &str, config: &GatewayConfig) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");
    println!("✅ Configuration validation: OK");

    let file = load_service_file(Path::new(&config.services_path))?;
    if let Err(e) = GatewayConfigValidator::validate_services(&file.services) {
        eprintln!("❌ Service validation failed:");
        eprintln!("{e}");
        std::process::exit(1);
    }
    println!("✅ Service validation: OK");

    let count = |kind: ProtocolKind| file.services.iter().filter(|s| s.kind == kind).count();
    println!();
    println!("📋 Configuration Summary:");
    println!("   • HTTP Listener: {}", config.http.addr);
    println!(
        "   • HTTPS Listener: {}",
        config.https.as_ref().map_or("disabled", |https| https.addr.as_str())
    );
    println!(
        "   • Services: {} (http: {}, tcp: {}, grpc: {})",
        file.services.len(),
        count(ProtocolKind::Http),
        count(ProtocolKind::Tcp),
        count(ProtocolKind::Grpc)
    );
    println!("   • Tenants: {}", config.auth.tenants.len());
    println!(
        "   • Flow Store: {}",
        if config.store.redis_url.is_some() { "redis" } else { "memory" }
    );
    Ok(())
}

async fn run_server(config: GatewayConfig) -> Result<()> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}",
            e
        );
    }

    tracing_setup::init_tracing(&config.log)?;

    let drain_timeout = config.tcp.drain_timeout();
    let http_addr = config.http.addr.clone();
    let https = config.https.clone();

    let ctx = Arc::new(GatewayContext::from_config(config).await?);
    tracing::info!("Loaded {} services", ctx.registry().len());

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler = graceful_shutdown.clone();
    tokio::spawn(async move { signal_handler.run_signal_handler().await });

    let force_close = CancellationToken::new();
    let tcp_router = TcpRouter::start(ctx.clone(), force_close.clone()).await?;
    tracing::info!("Started {} TCP/gRPC listeners", tcp_router.servers().len());

    let listener = TcpListener::bind(&http_addr)
        .await
        .wrap_err_with(|| format!("Failed to bind HTTP listener on {http_addr}"))?;
    let http_server = tokio::spawn(serve_http(ctx.clone(), listener, graceful_shutdown.token()));

    let https_server = https.map(|https| {
        let ctx = ctx.clone();
        let token = graceful_shutdown.token();
        tokio::spawn(async move { serve_https(ctx, &https, token).await })
    });

    let reason = graceful_shutdown.wait_for_shutdown_signal().await;
    tracing::info!("Shutting down: {:?}", reason);

    if !tcp_router.shutdown(drain_timeout).await {
        tracing::warn!(
            "Some TCP connections were still open after {:?}, cancelling them",
            drain_timeout
        );
        force_close.cancel();
    }

    for (name, handle) in std::iter::once(("HTTP", Some(http_server)))
        .chain(std::iter::once(("HTTPS", https_server)))
    {
        let Some(handle) = handle else { continue };
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("{} proxy exited with error: {:?}", name, e),
            Err(e) => tracing::error!("{} proxy task failed: {}", name, e),
        }
    }

    ctx.shutdown();
    tracing::info!("Graceful shutdown completed");
    Ok(())
}
