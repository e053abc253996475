//! # Supernova — Real-time Trading-value Surge Detector
//!
//! ```text
//!  ┌─────────────┐  NDJSON tick stream   ┌──────────────────────────────┐
//!  │   Bridge    │ ────────────────────▶ │ Engine (single worker)       │
//!  │  (broker    │  TR queries (HTTP)    │ ├─ CandleAggregator          │
//!  │   session)  │ ◀──────────────────── │ ├─ Fast / Slow filter chains │
//!  └─────────────┘                       │ ├─ ProgramFlowCache          │
//!                                        │ └─ Job queue  ───────────┐   │
//!  ┌─────────────┐   sendMessage         └──────────────────────────│───┘
//!  │  Telegram   │ ◀───────────────────────────────────────────────┘
//!  └─────────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod engine;
mod error;
mod flow;
mod models;
mod notifier;
mod provider;

use config::FilterConfig;
use engine::dispatcher::Dispatcher;
use engine::Engine;
use notifier::{LogNotifier, Notifier, TelegramNotifier};
use provider::{BridgeClient, MarketData};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ──────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ─────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("supernova=debug".parse()?)
                .add_directive("reqwest=warn".parse()?),
        )
        .init();

    info!(r#"

  ╔═══════════════════════════════════════════════════════╗
  ║       SUPERNOVA — Trading-value Surge Detector        ║
  ║   Aggregate · Filter · Throttle · Dispatch · Alert    ║
  ╚═══════════════════════════════════════════════════════╝"#);

    // ── 3. Config ─────────────────────────────────────────────────────────────
    let config = Arc::new(FilterConfig::from_env().context("Failed to load config")?);
    info!(
        min_amount = config.min_amount,
        lookback   = config.lookback_candles,
        multiplier = config.amount_multiplier,
        body_tail  = config.body_tail_ratio,
        throttle   = ?config.throttle,
        "filter configuration loaded"
    );

    let client = reqwest::Client::new();

    // ── 4. Notifier ───────────────────────────────────────────────────────────
    let notifier: Arc<dyn Notifier> = match TelegramNotifier::from_env(client.clone()) {
        Some(telegram) => {
            if let Err(e) = telegram.connect().await {
                warn!(error = %e, "Telegram connect failed — alerts will be log-only");
            }
            Arc::new(telegram)
        }
        None => {
            warn!("TELEBOT_TOKEN / TELEGRAM_CHAT_ID not set — log-only notifier");
            Arc::new(LogNotifier)
        }
    };

    // ── 5. Universe จาก Screener ──────────────────────────────────────────────
    let bridge = Arc::new(BridgeClient::new(client, config.bridge_base_url.clone()));
    let universe = bridge
        .screen_condition(&config.screen_condition)
        .await
        .context("universe screening failed")?;

    info!(
        condition = %config.screen_condition,
        universe  = universe.len(),
        "monitoring universe established"
    );

    notifier
        .send_start(&config.screen_condition, universe.len(), &config)
        .await;

    // ── 6. Wiring: channels + feed + stop signal ──────────────────────────────
    let (dispatcher, jobs) = Dispatcher::channel();
    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);

    let feed = tokio::spawn({
        let bridge = bridge.clone();
        async move {
            if let Err(e) = bridge.stream_ticks(tick_tx).await {
                error!(error = %e, "tick feed failed");
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(true);
        }
    });

    // ── 7. Engine loop (บล็อกจนกว่าจะ stop) ───────────────────────────────────
    let engine = Engine::new(
        config.clone(),
        bridge.clone(),
        notifier.clone(),
        &universe,
        dispatcher,
    );
    engine.run(tick_rx, jobs, stop_rx).await;

    feed.abort();
    info!("👋 shutdown complete");

    Ok(())
}
