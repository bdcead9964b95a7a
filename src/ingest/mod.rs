pub mod types;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Tuning;
use crate::db::local::HighWaterMark;
use crate::rpc::RpcClient;
use types::{EmittedTx, NormalizedBlock};

/// The two sliding dedup windows the ingestor maintains: recently processed
/// block heights and recently emitted transaction hashes. Blocks evict one
/// at a time; the transaction set sheds its oldest half when it overflows,
/// trading window precision for fewer evictions.
pub struct DedupWindows {
    recent_blocks: VecDeque<u64>,
    block_set: HashSet<u64>,
    block_window: usize,
    recent_txs: VecDeque<B256>,
    tx_set: HashSet<B256>,
    tx_window: usize,
}

impl DedupWindows {
    pub fn new(block_window: usize, tx_window: usize) -> Self {
        Self {
            recent_blocks: VecDeque::with_capacity(block_window + 1),
            block_set: HashSet::with_capacity(block_window + 1),
            block_window,
            recent_txs: VecDeque::with_capacity(tx_window + 1),
            tx_set: HashSet::with_capacity(tx_window + 1),
            tx_window,
        }
    }

    /// Record a block height; false when it was already in the window.
    pub fn observe_block(&mut self, height: u64) -> bool {
        if self.block_set.contains(&height) {
            return false;
        }
        self.block_set.insert(height);
        self.recent_blocks.push_back(height);
        while self.recent_blocks.len() > self.block_window {
            if let Some(evicted) = self.recent_blocks.pop_front() {
                self.block_set.remove(&evicted);
            }
        }
        true
    }

    /// Record a transaction hash; false when it was already in the window.
    pub fn observe_tx(&mut self, hash: B256) -> bool {
        if self.tx_set.contains(&hash) {
            return false;
        }
        self.tx_set.insert(hash);
        self.recent_txs.push_back(hash);
        if self.recent_txs.len() > self.tx_window {
            for _ in 0..self.tx_window / 2 {
                if let Some(evicted) = self.recent_txs.pop_front() {
                    self.tx_set.remove(&evicted);
                }
            }
        }
        true
    }

    pub fn tx_count(&self) -> usize {
        self.recent_txs.len()
    }

    pub fn contains_tx(&self, hash: &B256) -> bool {
        self.tx_set.contains(hash)
    }
}

/// Where to start ingesting: resume right after the persisted mark when the
/// gap to the head is small, otherwise rewind a fixed distance below the
/// head rather than replaying a long backlog.
fn initial_expected(head: u64, persisted: Option<u64>, reread_threshold: u64) -> u64 {
    match persisted {
        Some(mark) if head.saturating_sub(mark) <= reread_threshold => mark + 1,
        _ => head.saturating_sub(reread_threshold),
    }
}

/// Tails the chain head and emits normalized transactions strictly in
/// height order through a bounded channel. Owns all ingestion state; block
/// fetches are the only parallel part.
pub struct BlockIngestor {
    rpc: Arc<RpcClient>,
    hwm: HighWaterMark,
    tuning: Tuning,
    windows: DedupWindows,
    expected: u64,
    since_save: u64,
}

impl BlockIngestor {
    pub async fn start(
        rpc: Arc<RpcClient>,
        hwm: HighWaterMark,
        tuning: Tuning,
    ) -> eyre::Result<Self> {
        let head = rpc.block_number().await?;
        let persisted = hwm.load().await?;
        let expected = initial_expected(head, persisted, tuning.reread_threshold);
        tracing::info!(head, ?persisted, expected, "Block ingestor starting");

        let windows = DedupWindows::new(tuning.block_window, tuning.tx_window);
        Ok(Self {
            rpc,
            hwm,
            tuning,
            windows,
            expected,
            since_save: 0,
        })
    }

    pub async fn run(
        mut self,
        emit: mpsc::Sender<EmittedTx>,
        shutdown: CancellationToken,
    ) -> eyre::Result<()> {
        let poll_interval = Duration::from_secs(self.tuning.poll_interval_secs);
        loop {
            if let Err(e) = self.tick(&emit).await {
                // A failed tick never advances `expected`; the next one retries
                tracing::error!(error = %e, expected = self.expected, "Ingest tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        if let Err(e) = self.hwm.store(self.expected).await {
            tracing::warn!(error = %e, "Failed to persist high-water mark at shutdown");
        }
        tracing::info!(expected = self.expected, "Block ingestor stopped");
        Ok(())
    }

    async fn tick(&mut self, emit: &mpsc::Sender<EmittedTx>) -> eyre::Result<()> {
        let head = self.rpc.block_number().await?;

        // A shortened chain pulls the cursor back with it
        if head < self.expected {
            tracing::warn!(head, expected = self.expected, "Head behind cursor, clamping");
            self.expected = head;
        }

        while self.expected <= head {
            let batch_end = (self.expected + self.tuning.fetch_parallelism as u64 - 1).min(head);
            let heights: Vec<u64> = (self.expected..=batch_end).collect();
            let fetches = heights.iter().map(|n| self.rpc.get_block_with_txs(*n));
            let results = join_all(fetches).await;

            let mut halted = false;
            for (height, result) in heights.iter().zip(results) {
                match result {
                    Ok(Some(block)) => {
                        self.process_block(NormalizedBlock::from_rpc(block), emit)
                            .await?;
                    }
                    Ok(None) => {
                        tracing::debug!(height, "Block not yet available");
                        halted = true;
                    }
                    Err(e) => {
                        tracing::warn!(height, error = %e, "Block fetch failed");
                        halted = true;
                    }
                }
                if halted {
                    break;
                }
                self.expected = height + 1;
                self.since_save += 1;
                if self.since_save >= self.tuning.save_interval {
                    self.since_save = 0;
                    if let Err(e) = self.hwm.store(self.expected).await {
                        tracing::warn!(error = %e, "Failed to persist high-water mark");
                    }
                }
            }
            if halted {
                break;
            }
        }
        Ok(())
    }

    async fn process_block(
        &mut self,
        block: NormalizedBlock,
        emit: &mpsc::Sender<EmittedTx>,
    ) -> eyre::Result<()> {
        if !self.windows.observe_block(block.number) {
            tracing::debug!(height = block.number, "Block already processed, skipping");
            return Ok(());
        }

        let tx_count = block.transactions.len();
        let mut emitted = 0usize;
        for tx in block.transactions {
            if !self.windows.observe_tx(tx.hash) {
                continue;
            }
            emit.send(EmittedTx {
                tx,
                block_timestamp: block.timestamp,
            })
            .await
            .map_err(|_| eyre::eyre!("Emission channel closed"))?;
            emitted += 1;
        }
        tracing::debug!(height = block.number, tx_count, emitted, "Block processed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_window_dedup_and_eviction() {
        let mut windows = DedupWindows::new(3, 100);
        assert!(windows.observe_block(1));
        assert!(!windows.observe_block(1));
        assert!(windows.observe_block(2));
        assert!(windows.observe_block(3));
        assert!(windows.observe_block(4)); // evicts 1
        assert!(windows.observe_block(1)); // accepted again after eviction
    }

    #[test]
    fn test_tx_window_rejects_duplicates() {
        let mut windows = DedupWindows::new(10, 100);
        let hash = B256::repeat_byte(0x01);
        assert!(windows.observe_tx(hash));
        assert!(!windows.observe_tx(hash));
    }

    #[test]
    fn test_tx_window_evicts_oldest_half() {
        let mut windows = DedupWindows::new(10, 10);
        let hashes: Vec<B256> = (0u8..11).map(B256::repeat_byte).collect();
        for hash in &hashes {
            assert!(windows.observe_tx(*hash));
        }
        // The 11th insert overflowed the window and shed the oldest five
        assert_eq!(windows.tx_count(), 6);
        for hash in &hashes[..5] {
            assert!(!windows.contains_tx(hash), "oldest half should be evicted");
        }
        for hash in &hashes[5..] {
            assert!(windows.contains_tx(hash), "recent half should be retained");
        }
    }

    #[test]
    fn test_initial_expected_resumes_after_mark() {
        assert_eq!(initial_expected(105, Some(100), 10), 101);
    }

    #[test]
    fn test_initial_expected_rewinds_on_large_gap() {
        assert_eq!(initial_expected(500, Some(100), 10), 490);
    }

    #[test]
    fn test_initial_expected_rewinds_without_mark() {
        assert_eq!(initial_expected(500, None, 10), 490);
        // A young chain never underflows
        assert_eq!(initial_expected(5, None, 10), 0);
    }
}
