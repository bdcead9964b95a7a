pub mod multicall;

use std::future::Future;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Block, BlockNumberOrTag, Filter, Log, Transaction, TransactionReceipt, TransactionRequest};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::time::timeout;

/// What one endpoint reported when a fan-out call could not be reduced.
#[derive(Debug, Clone)]
pub struct EndpointFailure {
    pub url: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("all endpoints failed for {method}: {}", format_failures(.failures))]
    AllEndpointsFailed {
        method: &'static str,
        failures: Vec<EndpointFailure>,
    },
    #[error("invalid RPC URL '{0}'")]
    InvalidUrl(String),
    #[error("abi decode failed: {0}")]
    Decode(String),
}

fn format_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.url, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type RpcResult<T> = Result<T, RpcError>;

struct Endpoint {
    url: String,
    provider: DynProvider,
}

/// A chain client that dispatches every call to all configured endpoints
/// concurrently and reduces the responses to one result.
///
/// Consensus per method: `eth_blockNumber` takes the highest reported
/// height, `eth_getLogs` the longest log array, everything else the first
/// non-error response. Endpoints are never banned; a transient failure
/// only costs that endpoint the current call.
pub struct RpcClient {
    endpoints: Vec<Endpoint>,
    deadline: Duration,
}

impl RpcClient {
    pub fn new(urls: &[String], deadline: Duration) -> RpcResult<Self> {
        let mut endpoints = Vec::with_capacity(urls.len());
        for url in urls {
            let parsed = url
                .parse()
                .map_err(|_| RpcError::InvalidUrl(url.clone()))?;
            let provider = ProviderBuilder::new().connect_http(parsed).erased();
            endpoints.push(Endpoint {
                url: url.clone(),
                provider,
            });
        }
        Ok(Self {
            endpoints,
            deadline,
        })
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Head height: highest value among all endpoints that answered.
    pub async fn block_number(&self) -> RpcResult<u64> {
        let results = self
            .collect_all("eth_blockNumber", |p| async move {
                p.get_block_number().await.map_err(|e| e.to_string())
            })
            .await;
        for (url, result) in &results {
            if let Ok(height) = result {
                tracing::debug!(endpoint = %url, height, "Endpoint head height");
            }
        }
        reduce_highest("eth_blockNumber", results)
    }

    /// Logs matching a filter: longest array among all endpoints that answered.
    pub async fn get_logs(&self, filter: &Filter) -> RpcResult<Vec<Log>> {
        let results = self
            .collect_all("eth_getLogs", |p| {
                let filter = filter.clone();
                async move { p.get_logs(&filter).await.map_err(|e| e.to_string()) }
            })
            .await;
        reduce_longest("eth_getLogs", results)
    }

    /// Fetch a block with full transaction bodies. First success wins.
    pub async fn get_block_with_txs(&self, number: u64) -> RpcResult<Option<Block<Transaction>>> {
        self.first_success("eth_getBlockByNumber", |p| async move {
            p.get_block_by_number(BlockNumberOrTag::Number(number))
                .full()
                .await
                .map_err(|e| e.to_string())
        })
        .await
    }

    pub async fn get_transaction_by_hash(&self, hash: B256) -> RpcResult<Option<Transaction>> {
        self.first_success("eth_getTransactionByHash", move |p| async move {
            p.get_transaction_by_hash(hash).await.map_err(|e| e.to_string())
        })
        .await
    }

    pub async fn get_transaction_receipt(
        &self,
        hash: B256,
    ) -> RpcResult<Option<TransactionReceipt>> {
        self.first_success("eth_getTransactionReceipt", move |p| async move {
            p.get_transaction_receipt(hash)
                .await
                .map_err(|e| e.to_string())
        })
        .await
    }

    /// Native balance, at a specific height or at the latest block.
    pub async fn get_balance(&self, address: Address, block: Option<u64>) -> RpcResult<U256> {
        self.first_success("eth_getBalance", move |p| async move {
            let call = p.get_balance(address);
            let result = match block {
                Some(number) => call.block_id(number.into()).await,
                None => call.await,
            };
            result.map_err(|e| e.to_string())
        })
        .await
    }

    /// Read-only contract call. First success wins.
    pub async fn call(&self, request: TransactionRequest) -> RpcResult<Bytes> {
        self.first_success("eth_call", |p| {
            let request = request.clone();
            async move { p.call(request).await.map_err(|e| e.to_string()) }
        })
        .await
    }

    /// Race all endpoints; the first non-error response wins and the
    /// remaining in-flight requests are dropped.
    async fn first_success<T, Fut>(
        &self,
        method: &'static str,
        call: impl Fn(DynProvider) -> Fut,
    ) -> RpcResult<T>
    where
        Fut: Future<Output = Result<T, String>>,
    {
        let mut in_flight: FuturesUnordered<_> = self
            .endpoints
            .iter()
            .map(|ep| {
                let fut = call(ep.provider.clone());
                let url = ep.url.clone();
                let deadline = self.deadline;
                async move {
                    let started = Instant::now();
                    let outcome = match timeout(deadline, fut).await {
                        Ok(result) => result,
                        Err(_) => Err("deadline exceeded".to_string()),
                    };
                    (url, started.elapsed(), outcome)
                }
            })
            .collect();

        let mut failures = Vec::new();
        while let Some((url, elapsed, outcome)) = in_flight.next().await {
            let latency_ms = elapsed.as_millis() as u64;
            match outcome {
                Ok(value) => {
                    tracing::debug!(endpoint = %url, latency_ms, method, "RPC success");
                    return Ok(value);
                }
                Err(message) => {
                    tracing::debug!(endpoint = %url, latency_ms, method, error = %message, "RPC failure");
                    failures.push(EndpointFailure { url, message });
                }
            }
        }
        Err(RpcError::AllEndpointsFailed { method, failures })
    }

    /// Wait for every endpoint (within the shared deadline) and return all
    /// outcomes in endpoint order, for policies that compare responses.
    async fn collect_all<T, Fut>(
        &self,
        method: &'static str,
        call: impl Fn(DynProvider) -> Fut,
    ) -> Vec<(String, Result<T, String>)>
    where
        Fut: Future<Output = Result<T, String>>,
    {
        let futures = self.endpoints.iter().map(|ep| {
            let fut = call(ep.provider.clone());
            let url = ep.url.clone();
            let deadline = self.deadline;
            async move {
                let started = Instant::now();
                let outcome = match timeout(deadline, fut).await {
                    Ok(result) => result,
                    Err(_) => Err("deadline exceeded".to_string()),
                };
                let latency_ms = started.elapsed().as_millis() as u64;
                match &outcome {
                    Ok(_) => tracing::debug!(endpoint = %url, latency_ms, method, "RPC success"),
                    Err(e) => {
                        tracing::debug!(endpoint = %url, latency_ms, method, error = %e, "RPC failure")
                    }
                }
                (url, outcome)
            }
        });
        join_all(futures).await
    }
}

/// Highest-block policy: numerically greatest non-error response.
fn reduce_highest(
    method: &'static str,
    results: Vec<(String, Result<u64, String>)>,
) -> RpcResult<u64> {
    let mut best: Option<u64> = None;
    let mut failures = Vec::new();
    for (url, result) in results {
        match result {
            Ok(value) => {
                if best.is_none_or(|b| value > b) {
                    best = Some(value);
                }
            }
            Err(message) => failures.push(EndpointFailure { url, message }),
        }
    }
    best.ok_or(RpcError::AllEndpointsFailed { method, failures })
}

/// Most-logs policy: longest non-error array response. Ties keep the
/// earliest endpoint's answer, so the reduction is deterministic.
fn reduce_longest<T>(
    method: &'static str,
    results: Vec<(String, Result<Vec<T>, String>)>,
) -> RpcResult<Vec<T>> {
    let mut best: Option<Vec<T>> = None;
    let mut failures = Vec::new();
    for (url, result) in results {
        match result {
            Ok(value) => {
                if best.as_ref().is_none_or(|b| value.len() > b.len()) {
                    best = Some(value);
                }
            }
            Err(message) => failures.push(EndpointFailure { url, message }),
        }
    }
    best.ok_or(RpcError::AllEndpointsFailed { method, failures })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(url: &str, v: u64) -> (String, Result<u64, String>) {
        (url.to_string(), Ok(v))
    }

    fn err(url: &str, msg: &str) -> (String, Result<u64, String>) {
        (url.to_string(), Err(msg.to_string()))
    }

    #[test]
    fn test_highest_block_wins() {
        // Endpoint A answered 100, endpoint B answered 102 (slower but higher).
        let result = reduce_highest("eth_blockNumber", vec![ok("a", 100), ok("b", 102)]);
        assert_eq!(result.unwrap(), 102);
    }

    #[test]
    fn test_highest_block_ignores_errors() {
        let result = reduce_highest(
            "eth_blockNumber",
            vec![err("a", "timeout"), ok("b", 7), err("c", "boom")],
        );
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_all_failed_carries_per_endpoint_errors() {
        let result = reduce_highest(
            "eth_blockNumber",
            vec![err("a", "connection refused"), err("b", "deadline exceeded")],
        );
        match result {
            Err(RpcError::AllEndpointsFailed { method, failures }) => {
                assert_eq!(method, "eth_blockNumber");
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].url, "a");
                assert_eq!(failures[1].message, "deadline exceeded");
            }
            other => panic!("expected AllEndpointsFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_most_logs_picks_longest() {
        let results: Vec<(String, Result<Vec<u8>, String>)> = vec![
            ("a".to_string(), Ok(vec![1, 2])),
            ("b".to_string(), Ok(vec![1, 2, 3])),
            ("c".to_string(), Err("late".to_string())),
        ];
        assert_eq!(reduce_longest("eth_getLogs", results).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_most_logs_tie_keeps_first() {
        let results: Vec<(String, Result<Vec<u8>, String>)> = vec![
            ("a".to_string(), Ok(vec![9, 9])),
            ("b".to_string(), Ok(vec![1, 1])),
        ];
        assert_eq!(reduce_longest("eth_getLogs", results).unwrap(), vec![9, 9]);
    }
}
