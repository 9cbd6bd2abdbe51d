use clap::Parser;
use server::hub::Hub;
use tracing_subscriber::EnvFilter;

/// Stateless relay hub: multiplexes envelopes between connected agents.
#[derive(Parser)]
#[command(name = "relay-hub", about = "Central relay for nodes without direct reachability")]
struct Cli {
    /// Listen address; the PORT environment variable overrides the port
    #[arg(long, default_value = "0.0.0.0:8000")]
    addr: String,

    /// Shared token; the RELAY_TOKEN environment variable overrides it
    #[arg(long, default_value = "RELAY_SECRET")]
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // Container platforms hand the listen port and secret through the
    // environment; those win over the flags.
    let addr = match std::env::var("PORT") {
        Ok(port) if !port.trim().is_empty() => format!("0.0.0.0:{}", port.trim()),
        _ => cli.addr,
    };
    let token = match std::env::var("RELAY_TOKEN") {
        Ok(token) if !token.is_empty() => token,
        _ => cli.token,
    };

    let hub = Hub::new(&token);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "relay hub listening");

    axum::serve(listener, Hub::router(hub)).await?;
    Ok(())
}
