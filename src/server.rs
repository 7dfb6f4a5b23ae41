use clap::Parser;
use douban_proxy::{start_proxy_server, InjectionVariant, ProxyConfig, ProxyState};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "douban-proxy-server", about = "Transforming reverse proxy for movie.douban.com")]
struct Args {
    /// Which UI gets injected into proxied pages
    #[arg(long, value_enum, default_value_t = InjectionVariant::Overlay)]
    variant: InjectionVariant,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("douban_proxy=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let config = ProxyConfig {
        injection: args.variant,
        ..ProxyConfig::default()
    };

    let state = match ProxyState::new(config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("Open http://{} to browse douban through the proxy", state.config.listen_addr);
    if let Err(e) = start_proxy_server(state).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
