//! Runtime router entry point — wires config, the infra handler, and the
//! router's axum server together (SPEC_FULL §4.5).

use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig};
use clap::Parser;
use futures::StreamExt;
use tabline_core::Config;
use tabline_infra::InfraHandler;
use tabline_router::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the background sweep checks for idle CDP attachments
/// (SPEC_FULL §4.1 "background auto-detach timer"). The idle window itself
/// (30s) lives in `tabline_infra::cdp`; this only has to be frequent enough
/// that no tab overstays it by much.
const SWEEP_IDLE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "tabline", about = "In-browser LLM agent runtime")]
struct Cli {
    /// Port to bind the WebSocket/health server on.
    #[arg(short, long, default_value = "8787")]
    port: u16,

    /// OpenAI-compatible API base URL for the LLM provider.
    #[arg(long, env = "TABLINE_LLM_API_BASE", default_value = "https://api.openai.com/v1")]
    llm_api_base: String,

    /// API key for the LLM provider.
    #[arg(long, env = "TABLINE_LLM_API_KEY", default_value = "")]
    llm_api_key: String,

    /// Path to a Chrome/Chromium executable. When unset, `chromiumoxide`
    /// searches the usual install locations for one.
    #[arg(long, env = "TABLINE_CHROME_EXECUTABLE")]
    chrome_executable: Option<String>,

    /// Launch Chrome without a visible window.
    #[arg(long, env = "TABLINE_HEADLESS", default_value_t = true)]
    headless: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tabline=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let infra = Arc::new(InfraHandler::new(Config::default()));

    let mut browser_config = BrowserConfig::builder();
    if !cli.headless {
        browser_config = browser_config.with_head();
    }
    if let Some(executable) = &cli.chrome_executable {
        browser_config = browser_config.chrome_executable(executable);
    }
    let browser_config = browser_config
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build chrome launch config: {e}"))?;

    let (browser, mut handler) = Browser::launch(browser_config).await?;
    // chromiumoxide only makes progress on CDP events while something polls
    // the handler stream; this task has no other purpose.
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                tracing::warn!(error = %e, "chrome devtools protocol handler error");
            }
        }
    });
    infra.set_browser(browser).await;

    let sweep_infra = infra.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_IDLE_INTERVAL);
        loop {
            ticker.tick().await;
            sweep_infra.sweep_idle().await;
        }
    });

    let state = Arc::new(AppState::new(infra, cli.llm_api_base, cli.llm_api_key));

    let router = tabline_router::build_router(state);
    let addr = format!("0.0.0.0:{}", cli.port);
    tracing::info!(%addr, "runtime router listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
