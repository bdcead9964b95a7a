use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::delivery::Delivery;
use crate::ingest::types::{EmittedTx, NormalizedTx};
use crate::names::NameStore;
use crate::render::{self, RenderConfig, NAME_PLACEHOLDER};
use crate::sig::SigResolver;
use crate::trace::TraceDecoder;
use crate::watchlist::{SubscriberKey, Watcher, WatchlistStore};

/// Insertion-ordered set with a hard cap; inserting over the cap evicts the
/// oldest entry. Guards against double-notifying a (watched, tx) pair.
pub struct DedupSet {
    order: VecDeque<String>,
    seen: HashSet<String>,
    cap: usize,
}

impl DedupSet {
    pub fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap),
            seen: HashSet::with_capacity(cap),
            cap,
        }
    }

    /// Returns false when the key was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn dedup_key(watched: &Address, hash: &B256) -> String {
    format!("{watched:#x}:{hash:#x}")
}

/// 0.01 native units: anything below with empty calldata is dust.
fn dust_threshold() -> U256 {
    U256::from(10u64).pow(U256::from(16))
}

fn direction_allowed(watcher: &Watcher, outgoing: bool) -> bool {
    if outgoing {
        watcher.want_outgoing
    } else {
        watcher.want_incoming
    }
}

/// Routes every ingested transaction to its watchers: match against the
/// watchlist, dedup, fast-decode and send, then edit each sent message in
/// place once the full decode lands.
pub struct TxProcessor {
    watchlist: Arc<WatchlistStore>,
    trace: Arc<TraceDecoder>,
    sig: Arc<SigResolver>,
    names: Arc<NameStore>,
    delivery: Arc<Delivery>,
    render_config: Arc<RenderConfig>,
    dedup: DedupSet,
}

impl TxProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        watchlist: Arc<WatchlistStore>,
        trace: Arc<TraceDecoder>,
        sig: Arc<SigResolver>,
        names: Arc<NameStore>,
        delivery: Arc<Delivery>,
        render_config: Arc<RenderConfig>,
        dedup_window: usize,
    ) -> Self {
        Self {
            watchlist,
            trace,
            sig,
            names,
            delivery,
            render_config,
            dedup: DedupSet::new(dedup_window),
        }
    }

    /// Consume the ingestor's channel until it closes or shutdown fires.
    /// Processing is synchronous per transaction; a saturated delivery
    /// queue back-pressures the whole pipeline here.
    pub async fn run(mut self, mut rx: mpsc::Receiver<EmittedTx>, shutdown: CancellationToken) {
        loop {
            let emitted = tokio::select! {
                emitted = rx.recv() => emitted,
                _ = shutdown.cancelled() => break,
            };
            let Some(emitted) = emitted else { break };
            let lag_secs = chrono::Utc::now()
                .timestamp()
                .saturating_sub(emitted.block_timestamp as i64);
            tracing::debug!(tx = %emitted.tx.hash, lag_secs, "Processing transaction");
            self.handle(emitted.tx).await;
        }
        tracing::info!("Transaction processor stopped");
    }

    async fn handle(&mut self, tx: NormalizedTx) {
        let snapshot = self.watchlist.snapshot().await;
        let matches = snapshot.match_tx(&tx);

        for watched in matches {
            if !self.dedup.insert(dedup_key(&watched, &tx.hash)) {
                continue;
            }

            // Snapshot watchers whose bot is currently running, in a stable
            // order so delivery sequence does not depend on map iteration
            let mut watchers: Vec<(SubscriberKey, Watcher)> = snapshot
                .watchers(&watched)
                .map(|map| {
                    map.iter()
                        .filter(|(key, _)| self.delivery.is_active(&key.bot_id))
                        .map(|(key, watcher)| (key.clone(), watcher.clone()))
                        .collect()
                })
                .unwrap_or_default();
            watchers.sort_by(|(a, _), (b, _)| (a.chat_id, &a.bot_id).cmp(&(b.chat_id, &b.bot_id)));
            if watchers.is_empty() {
                continue;
            }

            let selector = tx.selector();
            let signature = self.sig.resolve(&selector).await;

            // Plain native dust is not worth a notification
            if selector == "0x" && tx.value < dust_threshold() {
                continue;
            }

            if let Err(e) = self.notify(&tx, watched, &watchers, signature.as_deref()).await {
                tracing::warn!(tx = %tx.hash, watched = %watched, error = %e, "Notification failed");
            }
        }
    }

    /// The two-phase lifecycle for one (tx, watched) pair: fast decode,
    /// broadcast, then edit every delivered message with the full decode.
    async fn notify(
        &self,
        tx: &NormalizedTx,
        watched: Address,
        watchers: &[(SubscriberKey, Watcher)],
        signature: Option<&str>,
    ) -> eyre::Result<()> {
        let fast = self.trace.fast(tx, watched).await?;
        let rendered = render::render(
            watched,
            tx,
            &fast,
            signature,
            &self.names,
            &self.render_config,
        );

        // Full decode runs while the send batch drains
        let full_handle = {
            let trace = Arc::clone(&self.trace);
            let tx = tx.clone();
            tokio::spawn(async move { trace.full(&tx, watched).await })
        };

        let outgoing = watched == tx.from;
        let mut pending = Vec::new();
        for (subscriber, watcher) in watchers {
            if !direction_allowed(watcher, outgoing) {
                continue;
            }
            let Some(queues) = self.delivery.queues_for(&subscriber.bot_id) else {
                continue;
            };
            let text = rendered.text.replace(NAME_PLACEHOLDER, &watcher.display_name);
            let receiver = queues.submit_send(subscriber.chat_id, text, rendered.buttons.clone());
            pending.push((subscriber.clone(), receiver));
        }

        let mut message_ids: Vec<(SubscriberKey, i64)> = Vec::new();
        for (subscriber, receiver) in pending {
            match receiver.await {
                Ok(Ok(message_id)) => message_ids.push((subscriber, message_id)),
                Ok(Err(e)) => {
                    tracing::debug!(subscriber = %subscriber, error = %e, "Send rejected")
                }
                Err(_) => tracing::debug!(subscriber = %subscriber, "Send worker dropped"),
            }
        }

        let full = match full_handle.await {
            Ok(Ok(full)) => full,
            Ok(Err(e)) => {
                tracing::warn!(tx = %tx.hash, watched = %watched, error = %e, "Full decode failed");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(tx = %tx.hash, error = %e, "Full decode task panicked");
                return Ok(());
            }
        };
        if message_ids.is_empty() {
            return Ok(());
        }

        let rendered_full = render::render(
            watched,
            tx,
            &full,
            signature,
            &self.names,
            &self.render_config,
        );
        for (subscriber, message_id) in message_ids {
            let display_name = watchers
                .iter()
                .find(|(key, _)| *key == subscriber)
                .map(|(_, w)| w.display_name.as_str())
                .unwrap_or_default();
            let Some(queues) = self.delivery.queues_for(&subscriber.bot_id) else {
                continue;
            };
            let text = rendered_full.text.replace(NAME_PLACEHOLDER, display_name);
            let receiver = queues.submit_edit(
                subscriber.chat_id,
                message_id,
                text,
                rendered_full.buttons.clone(),
            );
            match receiver.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::debug!(subscriber = %subscriber, message_id, error = %e, "Edit rejected")
                }
                Err(_) => tracing::debug!(subscriber = %subscriber, "Edit worker dropped"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_set_rejects_repeats() {
        let mut set = DedupSet::new(10);
        assert!(set.insert("a:1".to_string()));
        assert!(!set.insert("a:1".to_string()));
        assert!(set.insert("b:1".to_string()));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_dedup_set_evicts_oldest_on_overflow() {
        let mut set = DedupSet::new(3);
        for key in ["a", "b", "c"] {
            assert!(set.insert(key.to_string()));
        }
        assert!(set.insert("d".to_string())); // evicts "a"
        assert_eq!(set.len(), 3);
        assert!(set.insert("a".to_string())); // "a" was evicted, accepted again
        assert!(!set.insert("c".to_string())); // still present
    }

    #[test]
    fn test_dedup_key_shape() {
        let watched = Address::repeat_byte(0x11);
        let hash = B256::repeat_byte(0xab);
        let key = dedup_key(&watched, &hash);
        assert!(key.starts_with("0x1111"));
        assert!(key.contains(":0xabab"));
    }

    #[test]
    fn test_dust_threshold_is_one_hundredth() {
        // 0.01 ether in wei
        assert_eq!(dust_threshold(), U256::from(10_000_000_000_000_000u64));
    }

    #[test]
    fn test_direction_gate() {
        let watcher = Watcher {
            display_name: "savings".to_string(),
            want_incoming: false,
            want_outgoing: true,
        };
        assert!(direction_allowed(&watcher, true));
        assert!(!direction_allowed(&watcher, false));
    }
}
