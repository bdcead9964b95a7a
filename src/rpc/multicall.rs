use std::sync::Arc;

use alloy::primitives::{Address, Bytes};
use alloy::rpc::types::{TransactionInput, TransactionRequest};
use alloy::sol_types::SolCall;

use super::{RpcClient, RpcError, RpcResult};

// tryAggregate against a Multicall3-style aggregator. Struct names differ
// from the deployed ABI but encode to the same tuple layout.
alloy::sol! {
    #[derive(Debug)]
    struct AggCall {
        address target;
        bytes callData;
    }

    #[derive(Debug)]
    struct AggResult {
        bool success;
        bytes returnData;
    }

    function tryAggregate(bool requireSuccess, AggCall[] calldata calls)
        external
        returns (AggResult[] memory returnData);
}

/// One sub-call result, in input order.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub success: bool,
    pub return_data: Bytes,
}

/// Bundles many read-only contract calls into a single `tryAggregate`
/// invocation against the configured aggregator contract.
pub struct Multicall {
    rpc: Arc<RpcClient>,
    address: Address,
}

impl Multicall {
    pub fn new(rpc: Arc<RpcClient>, address: Address) -> Self {
        Self { rpc, address }
    }

    /// Execute all `(target, calldata)` pairs in one batched call and return
    /// their outcomes in input order. Empty input returns empty output
    /// without touching the network. Errors propagate; there is no retry.
    pub async fn try_aggregate(&self, calls: &[(Address, Bytes)]) -> RpcResult<Vec<CallOutcome>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let calls: Vec<AggCall> = calls
            .iter()
            .map(|(target, calldata)| AggCall {
                target: *target,
                callData: calldata.clone(),
            })
            .collect();

        let data = tryAggregateCall {
            requireSuccess: false,
            calls,
        }
        .abi_encode();

        let request = TransactionRequest::default()
            .to(self.address)
            .input(TransactionInput::new(data.into()));

        let raw = self.rpc.call(request).await?;
        let outcomes = tryAggregateCall::abi_decode_returns(&raw)
            .map_err(|e| RpcError::Decode(e.to_string()))?;

        Ok(outcomes
            .into_iter()
            .map(|r| CallOutcome {
                success: r.success,
                return_data: r.returnData,
            })
            .collect())
    }
}
