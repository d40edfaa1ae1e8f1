use std::net::IpAddr;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use proxyhub::{PolicyFn, PolicyInput, PolicyResult, Server, ServerConfig};

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Multiplexing HTTP proxy front-end",
    long_about = "proxyhub accepts proxy clients and routes every request through a \
per-request policy: direct CONNECT tunnels, tunnels chained through an upstream \
HTTP or SOCKS5 proxy, and forwarded HTTP requests.\n\nFeatures:\n\
- Optional proxy Basic authentication\n\
- Optional upstream proxy (http:// or socks://, with credentials in the URL)\n\
- Per-connection traffic statistics and close events for embedders"
)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// IP address to bind the server
    #[arg(long, default_value = "0.0.0.0")]
    listen_ip: IpAddr,

    /// Authentication realm presented to clients
    #[arg(long, default_value = "ProxyChain")]
    realm: String,

    /// Require these proxy credentials, format "user:pass"
    #[arg(long)]
    basic_auth: Option<String>,

    /// Route every request through this upstream proxy (http:// or socks://)
    #[arg(long)]
    upstream_proxy_url: Option<String>,

    /// Log every request
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("proxyhub=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();

    let required_auth = match args.basic_auth.as_deref() {
        Some(raw) => {
            let (username, password) = raw
                .split_once(':')
                .ok_or_else(|| eyre!("Invalid --basic-auth, expected user:pass"))?;
            if username.is_empty() {
                return Err(eyre!("Invalid --basic-auth, expected user:pass"));
            }
            Some((username.to_string(), password.to_string()))
        }
        None => None,
    };

    let mut config = ServerConfig::new()
        .with_host(args.listen_ip)
        .with_port(args.port)
        .with_auth_realm(args.realm.clone())
        .with_verbose(args.verbose);

    if required_auth.is_some() || args.upstream_proxy_url.is_some() {
        let upstream = args.upstream_proxy_url.clone();
        let policy: PolicyFn = Arc::new(move |input: PolicyInput| {
            let required_auth = required_auth.clone();
            let upstream = upstream.clone();
            Box::pin(async move {
                let mut result = PolicyResult::default();
                if let Some((username, password)) = required_auth {
                    if input.username != username || input.password != password {
                        result.request_authentication = true;
                        return Ok(result);
                    }
                }
                result.upstream_proxy_url = upstream;
                Ok(result)
            })
        });
        config = config.with_policy(policy);
    }

    let server = Server::new(config);
    let local_addr = server.listen().await?;
    info!("proxying on http://{local_addr}");
    if let Some(upstream) = args.upstream_proxy_url.as_deref() {
        match url::Url::parse(upstream) {
            Ok(parsed) => info!("upstream proxy: {}", proxyhub::redact_url(&parsed)),
            Err(_) => info!("upstream proxy configured"),
        }
    }

    signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("shutdown signal received");

    let live = server.connection_ids().len();
    if live > 0 {
        info!("closing {live} live connections");
    }
    server.close(true).await;
    info!("server shutdown complete");

    Ok(())
}
