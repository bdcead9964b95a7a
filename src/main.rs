use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use walletwatch::config::Config;
use walletwatch::db::{local, repository};
use walletwatch::delivery::chat::BotClient;
use walletwatch::delivery::{BotQueues, Delivery};
use walletwatch::ingest::BlockIngestor;
use walletwatch::names::NameStore;
use walletwatch::processor::TxProcessor;
use walletwatch::render::RenderConfig;
use walletwatch::rpc::multicall::Multicall;
use walletwatch::rpc::RpcClient;
use walletwatch::sig::SigResolver;
use walletwatch::tokens::TokenResolver;
use walletwatch::trace::TraceDecoder;
use walletwatch::watchlist::WatchlistStore;

const CHAT_API_BASE: &str = "https://api.telegram.org";
const EMISSION_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> ExitCode {
    color_eyre::install().expect("color-eyre install");

    // Initialize structured logging (set RUST_LOG=info for output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let mut args = std::env::args().skip(1);
    let config_name = match (args.next().as_deref(), args.next()) {
        (Some("run"), Some(name)) => name,
        _ => {
            eprintln!("Usage: walletwatch run <config-name>");
            return ExitCode::FAILURE;
        }
    };

    match run(&config_name).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config_name: &str) -> eyre::Result<()> {
    let config = Config::load_named(config_name)?;
    tracing::info!(
        chain = %config.chain_label,
        rpc_urls = config.rpc_urls.len(),
        bots = config.bots.len(),
        "Configuration loaded"
    );

    // Shared relational store
    let pg_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.sql.url())
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to shared store: {}", e))?;
    repository::ensure_schema(&pg_pool).await?;
    tracing::info!("Connected to shared store");

    // Embedded caches
    let local_pool = local::open(&config.local_db.path).await?;
    local::ensure_schema(&local_pool).await?;

    // Chain clients
    let rpc = Arc::new(RpcClient::new(
        &config.rpc_urls,
        Duration::from_millis(config.tuning.rpc_deadline_ms),
    )?);
    let multicall = Arc::new(Multicall::new(Arc::clone(&rpc), config.multicall()));
    let tokens = Arc::new(
        TokenResolver::load(multicall, local_pool.clone(), &config.base_tokens).await?,
    );
    let trace = Arc::new(TraceDecoder::new(
        Arc::clone(&rpc),
        Arc::clone(&tokens),
        Duration::from_secs(config.tuning.receipt_timeout_secs),
    ));

    let names = Arc::new(NameStore::load(&local_pool, &pg_pool).await?);
    let sig = Arc::new(SigResolver::new(local_pool.clone())?);

    let shutdown = CancellationToken::new();

    // Chat delivery: one queue pair per bot whose token checks out
    let (removal_tx, mut removal_rx) = mpsc::unbounded_channel();
    let mut queues = HashMap::new();
    for bot in &config.bots {
        let client = BotClient::new(CHAT_API_BASE, &bot.token)?;
        match client.get_me().await {
            Ok(username) => {
                tracing::info!(bot = %bot.id, username = %username, "Bot token verified");
                queues.insert(
                    bot.id.clone(),
                    BotQueues::spawn(
                        bot.id.clone(),
                        Arc::new(client),
                        Duration::from_millis(config.tuning.queue_spacing_ms),
                        removal_tx.clone(),
                        shutdown.clone(),
                    ),
                );
            }
            Err(e) => {
                tracing::warn!(bot = %bot.id, error = %e, "Bot token check failed, bot disabled");
            }
        }
    }
    drop(removal_tx);
    let delivery = Arc::new(Delivery::new(queues));
    if delivery.active_count() == 0 {
        return Err(eyre::eyre!("No bot passed the startup token check"));
    }

    // Tell the operator the monitor is up, through the first live bot
    if let Some(bot) = config.bots.iter().find(|b| delivery.is_active(&b.id)) {
        if let Some(queues) = delivery.queues_for(&bot.id) {
            let notice = format!("Wallet monitor online on {}", config.chain_label);
            let _ = queues.submit_send(config.owner_chat_id, notice, None);
        }
    }

    // Unreachable subscribers get flagged in the shared store out-of-band
    let removal_pool = pg_pool.clone();
    let removal_task = tokio::spawn(async move {
        while let Some(subscriber) = removal_rx.recv().await {
            match repository::mark_subscriber_blocked(
                &removal_pool,
                subscriber.chat_id,
                &subscriber.bot_id,
            )
            .await
            {
                Ok(rows) => {
                    tracing::info!(subscriber = %subscriber, rows, "Subscriber flagged as blocked")
                }
                Err(e) => {
                    tracing::warn!(subscriber = %subscriber, error = %e, "Failed to flag subscriber")
                }
            }
        }
    });

    // Watchlist snapshot + periodic refresh
    let watchlist = WatchlistStore::load(pg_pool.clone()).await?;
    let refresher = watchlist.spawn_refresher(
        Duration::from_millis(config.tuning.watchlist_refresh_ms),
        shutdown.clone(),
    );

    let render_config = Arc::new(RenderConfig {
        chain_label: config.chain_label.clone(),
        native_symbol: config.native_symbol.clone(),
        explorer_base_url: config.explorer_base_url.clone(),
        chart_base_url: config.chart_base_url.clone(),
        base_tokens: config.base_tokens.iter().cloned().collect(),
        button_rows: config.inline_buttons.clone(),
    });

    // Ingestion -> processing pipeline
    let (emit_tx, emit_rx) = mpsc::channel(EMISSION_CHANNEL_CAPACITY);
    let ingestor = BlockIngestor::start(
        Arc::clone(&rpc),
        local::HighWaterMark::new(config.high_water_mark.path.clone()),
        config.tuning.clone(),
    )
    .await?;
    let ingest_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { ingestor.run(emit_tx, shutdown).await })
    };

    let processor = TxProcessor::new(
        Arc::clone(&watchlist),
        trace,
        sig,
        names,
        Arc::clone(&delivery),
        render_config,
        config.tuning.dedup_window,
    );
    let processor_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { processor.run(emit_rx, shutdown).await })
    };

    tracing::info!("Wallet monitor running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    shutdown.cancel();

    match ingest_task.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "Ingestor exited with error"),
        Err(e) => tracing::warn!(error = %e, "Ingest task join failed"),
        Ok(Ok(())) => {}
    }
    let _ = processor_task.await;
    let _ = refresher.await;
    removal_task.abort();

    local_pool.close().await;
    pg_pool.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
