use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alloy::network::ReceiptResponse;
use alloy::primitives::{Address, B256, I256, U256};
use alloy::rpc::types::TransactionReceipt;

use crate::extract;
use crate::ingest::types::NormalizedTx;
use crate::rpc::RpcClient;
use crate::tokens::{scale_amount, TokenResolver};

const NATIVE_DECIMALS: u8 = 18;
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where a trace anchors on the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    Mempool,
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockTag::Number(n) => write!(f, "{n}"),
            BlockTag::Mempool => write!(f, "mempool"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    Success,
    Failed,
    Unknown,
}

/// The decoded view of one (transaction, watched-address) pair.
#[derive(Debug, Clone)]
pub struct TraceResult {
    pub status: TraceStatus,
    /// Interacted tokens, insertion-ordered with base tokens last.
    pub tokens: Vec<(Address, String)>,
    pub log_count: Option<usize>,
    pub block: BlockTag,
    pub deployed_contract: Option<Address>,
    pub pnl: String,
    pub balance: String,
    pub change: char,
    pub transfer_amount: Option<String>,
}

/// Produces `TraceResult`s in two flavours: `fast` before the receipt is
/// available (calldata only) and `full` once the transaction confirmed
/// (receipt logs plus balance delta).
pub struct TraceDecoder {
    rpc: Arc<RpcClient>,
    tokens: Arc<TokenResolver>,
    receipt_timeout: Duration,
}

impl TraceDecoder {
    pub fn new(rpc: Arc<RpcClient>, tokens: Arc<TokenResolver>, receipt_timeout: Duration) -> Self {
        Self {
            rpc,
            tokens,
            receipt_timeout,
        }
    }

    /// Pre-receipt decode: candidate tokens from calldata, current balance,
    /// unknown status.
    pub async fn fast(&self, tx: &NormalizedTx, watched: Address) -> eyre::Result<TraceResult> {
        let mut candidates = extract::from_calldata(&tx.input);
        if let Some(to) = tx.to {
            push_unique(&mut candidates, to);
        }
        let underlyings = self.tokens.extract_pair_underlyings(&candidates).await?;
        for underlying in underlyings {
            push_unique(&mut candidates, underlying);
        }

        let (balance, resolved) = tokio::join!(
            self.rpc.get_balance(watched, None),
            self.tokens.lookup(&candidates),
        );
        let balance = balance?;
        let resolved = resolved?;

        let transfer_amount = self.single_transfer_amount(tx, &resolved);

        Ok(TraceResult {
            status: TraceStatus::Unknown,
            tokens: resolved,
            log_count: None,
            block: tx.block_number.map(BlockTag::Number).unwrap_or(BlockTag::Mempool),
            deployed_contract: None,
            pnl: "0.0".to_string(),
            balance: scale_amount(balance, NATIVE_DECIMALS, 2),
            change: ' ',
            transfer_amount,
        })
    }

    /// Post-receipt decode: log addresses join the candidate set and the
    /// balance delta across the inclusion block becomes the pnl. Falls back
    /// to `fast` against a re-fetched transaction when the receipt does not
    /// arrive within the timeout.
    pub async fn full(&self, tx: &NormalizedTx, watched: Address) -> eyre::Result<TraceResult> {
        let Some(receipt) = self.wait_for_receipt(tx.hash).await else {
            tracing::debug!(tx = %tx.hash, "Receipt timed out, downgrading to fast decode");
            let refetched = self
                .rpc
                .get_transaction_by_hash(tx.hash)
                .await?
                .map(|t| NormalizedTx::from_rpc(&t, tx.origin));
            let fresh = refetched.unwrap_or_else(|| tx.clone());
            return self.fast(&fresh, watched).await;
        };

        let logs = receipt.inner.logs();
        let block_number = receipt
            .block_number()
            .or(tx.block_number)
            .unwrap_or_default();

        let mut candidates = extract::from_calldata(&tx.input);
        for address in extract::from_logs(logs) {
            push_unique(&mut candidates, address);
        }
        if let Some(to) = tx.to {
            push_unique(&mut candidates, to);
        }
        let underlyings = self.tokens.extract_pair_underlyings(&candidates).await?;
        for underlying in underlyings {
            push_unique(&mut candidates, underlying);
        }

        let previous_block = block_number.saturating_sub(1);
        let (balance_now, balance_before, resolved) = tokio::join!(
            self.rpc.get_balance(watched, Some(block_number)),
            self.rpc.get_balance(watched, Some(previous_block)),
            self.tokens.lookup(&candidates),
        );
        let balance_now = balance_now?;
        let balance_before = balance_before?;
        let resolved = resolved?;

        let delta = balance_delta(balance_now, balance_before);
        let transfer_amount = self.single_transfer_amount(tx, &resolved);

        Ok(TraceResult {
            status: if receipt.status() {
                TraceStatus::Success
            } else {
                TraceStatus::Failed
            },
            tokens: resolved,
            log_count: Some(logs.len()),
            block: BlockTag::Number(block_number),
            deployed_contract: receipt.contract_address(),
            pnl: format_signed_units(delta, NATIVE_DECIMALS, 3),
            balance: scale_amount(balance_now, NATIVE_DECIMALS, 2),
            change: change_indicator(delta),
            transfer_amount,
        })
    }

    /// The transfer amount applies only when exactly one token resolved and
    /// the calldata is an ERC20 transfer.
    fn single_transfer_amount(
        &self,
        tx: &NormalizedTx,
        resolved: &[(Address, String)],
    ) -> Option<String> {
        if resolved.len() != 1 {
            return None;
        }
        self.tokens.decode_transfer_amount(&tx.input, &resolved[0].0)
    }

    /// Poll for the receipt until it is one block deep or the timeout
    /// elapses. RPC hiccups during the wait only consume time, never abort.
    async fn wait_for_receipt(&self, hash: B256) -> Option<TransactionReceipt> {
        let deadline = tokio::time::Instant::now() + self.receipt_timeout;
        loop {
            match self.rpc.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => {
                    if let Some(included_at) = receipt.block_number() {
                        match self.rpc.block_number().await {
                            Ok(head) if head >= included_at => return Some(receipt),
                            Ok(_) => {}
                            Err(e) => {
                                tracing::debug!(tx = %hash, error = %e, "Head query failed during receipt wait")
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(tx = %hash, error = %e, "Receipt query failed, retrying")
                }
            }
            if tokio::time::Instant::now() + RECEIPT_POLL_INTERVAL > deadline {
                return None;
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

fn push_unique(list: &mut Vec<Address>, address: Address) {
    if !list.contains(&address) {
        list.push(address);
    }
}

fn balance_delta(now: U256, before: U256) -> I256 {
    // Saturate rather than wrap on the (absurd) half-range overflow
    let now = I256::try_from(now).unwrap_or(I256::MAX);
    let before = I256::try_from(before).unwrap_or(I256::MAX);
    now.saturating_sub(before)
}

fn change_indicator(delta: I256) -> char {
    if delta.is_positive() {
        '▲'
    } else if delta.is_negative() {
        '▼'
    } else {
        '.'
    }
}

/// Format a signed wei amount to `places` fractional digits. A value that
/// rounds to zero loses its sign.
fn format_signed_units(delta: I256, decimals: u8, places: usize) -> String {
    let formatted = scale_amount(delta.unsigned_abs(), decimals, places);
    let rounded_to_zero = formatted.chars().all(|c| c == '0' || c == '.');
    if delta.is_negative() && !rounded_to_zero {
        format!("-{formatted}")
    } else {
        formatted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wei(eth: u64) -> U256 {
        U256::from(eth) * U256::from(10u64).pow(U256::from(18))
    }

    #[test]
    fn test_block_tag_display() {
        assert_eq!(BlockTag::Number(18_000_000).to_string(), "18000000");
        assert_eq!(BlockTag::Mempool.to_string(), "mempool");
    }

    #[test]
    fn test_change_indicator() {
        assert_eq!(change_indicator(balance_delta(wei(2), wei(1))), '▲');
        assert_eq!(change_indicator(balance_delta(wei(1), wei(2))), '▼');
        assert_eq!(change_indicator(balance_delta(wei(1), wei(1))), '.');
    }

    #[test]
    fn test_pnl_formatting() {
        assert_eq!(
            format_signed_units(balance_delta(wei(3), wei(1)), 18, 3),
            "2.000"
        );
        assert_eq!(
            format_signed_units(balance_delta(wei(1), wei(3)), 18, 3),
            "-2.000"
        );
        // Sub-precision loss rounds to unsigned zero
        let dust = U256::from(1u64); // 1 wei
        assert_eq!(
            format_signed_units(balance_delta(U256::ZERO, dust), 18, 3),
            "0.000"
        );
    }

    #[test]
    fn test_balance_formatting_carries_decimal_point() {
        assert_eq!(scale_amount(wei(5), 18, 2), "5.00");
    }
}
