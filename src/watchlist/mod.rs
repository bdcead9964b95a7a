use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::db::repository::{self, WatchRow};
use crate::extract;
use crate::ingest::types::NormalizedTx;

// Direction flags every watchlist entry materializes with.
const DEFAULT_WANT_INCOMING: bool = false;
const DEFAULT_WANT_OUTGOING: bool = true;

/// One delivery target, the composite `{chat}@{bot}` key used throughout
/// the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    pub chat_id: i64,
    pub bot_id: String,
}

impl SubscriberKey {
    pub fn new(chat_id: i64, bot_id: impl Into<String>) -> Self {
        Self {
            chat_id,
            bot_id: bot_id.into(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (chat, bot) = raw.split_once('@')?;
        Some(Self {
            chat_id: chat.parse().ok()?,
            bot_id: bot.to_string(),
        })
    }
}

impl fmt::Display for SubscriberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.chat_id, self.bot_id)
    }
}

/// Per-subscriber view of one watched address.
#[derive(Debug, Clone)]
pub struct Watcher {
    pub display_name: String,
    pub want_incoming: bool,
    pub want_outgoing: bool,
}

/// An immutable view of the watchlist, swapped wholesale by the refresher.
#[derive(Debug, Default)]
pub struct WatchlistSnapshot {
    entries: HashMap<Address, HashMap<SubscriberKey, Watcher>>,
}

impl WatchlistSnapshot {
    pub fn from_rows(rows: Vec<WatchRow>) -> Self {
        let mut entries: HashMap<Address, HashMap<SubscriberKey, Watcher>> = HashMap::new();
        for row in rows {
            if row.blocked {
                continue;
            }
            let Ok(address) = row.address.parse::<Address>() else {
                tracing::warn!(address = %row.address, "Skipping unparseable watchlist address");
                continue;
            };
            let key = SubscriberKey::new(row.chat_id, row.bot_id.clone());
            let display_name = row
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| row.address.to_lowercase());
            entries.entry(address).or_default().insert(
                key,
                Watcher {
                    display_name,
                    want_incoming: DEFAULT_WANT_INCOMING,
                    want_outgoing: DEFAULT_WANT_OUTGOING,
                },
            );
        }
        Self { entries }
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entries.contains_key(address)
    }

    pub fn watchers(&self, address: &Address) -> Option<&HashMap<SubscriberKey, Watcher>> {
        self.entries.get(address)
    }

    pub fn address_count(&self) -> usize {
        self.entries.len()
    }

    /// All watched addresses this transaction touches, in match order:
    /// sender, recipient, ERC20 transfer recipient, then any address-shaped
    /// word in the calldata. The union keeps first-seen order.
    pub fn match_tx(&self, tx: &NormalizedTx) -> Vec<Address> {
        let mut matched = Vec::new();
        let mut consider = |address: Address, matched: &mut Vec<Address>| {
            if self.contains(&address) && !matched.contains(&address) {
                matched.push(address);
            }
        };

        consider(tx.from, &mut matched);
        if let Some(to) = tx.to {
            consider(to, &mut matched);
        }
        if let Some(recipient) = extract::transfer_recipient(&tx.input) {
            consider(recipient, &mut matched);
        }
        for address in extract::from_calldata(&tx.input) {
            consider(address, &mut matched);
        }
        matched
    }
}

/// Read-heavy watchlist cache over the shared store. A background task
/// reloads the full snapshot periodically; readers always see a consistent
/// whole-map view.
pub struct WatchlistStore {
    pool: PgPool,
    snapshot: RwLock<Arc<WatchlistSnapshot>>,
}

impl WatchlistStore {
    pub async fn load(pool: PgPool) -> eyre::Result<Arc<Self>> {
        let rows = repository::load_watchlist(&pool).await?;
        let snapshot = WatchlistSnapshot::from_rows(rows);
        tracing::info!(addresses = snapshot.address_count(), "Loaded watchlist");
        Ok(Arc::new(Self {
            pool,
            snapshot: RwLock::new(Arc::new(snapshot)),
        }))
    }

    pub async fn snapshot(&self) -> Arc<WatchlistSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn refresh(&self) -> eyre::Result<()> {
        let rows = repository::load_watchlist(&self.pool).await?;
        let next = Arc::new(WatchlistSnapshot::from_rows(rows));
        *self.snapshot.write().await = next;
        Ok(())
    }

    /// Reload the snapshot every `interval` until shutdown.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => break,
                }
                if let Err(e) = store.refresh().await {
                    tracing::warn!(error = %e, "Watchlist refresh failed");
                }
            }
        })
    }
}
