use alloy::consensus::Transaction as _;
use alloy::network::TransactionResponse;
use alloy::primitives::{Address, Bytes, B256, U256};

/// Where a transaction was first observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOrigin {
    Block,
    Mempool,
}

impl TxOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxOrigin::Block => "block",
            TxOrigin::Mempool => "mempool",
        }
    }
}

/// A transaction normalized out of the RPC representation. Immutable after
/// construction; everything downstream works off this shape.
#[derive(Debug, Clone)]
pub struct NormalizedTx {
    pub hash: B256,
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub index: Option<u64>,
    pub from: Address,
    /// None means contract creation.
    pub to: Option<Address>,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub input: Bytes,
    pub value: U256,
    pub chain_id: Option<u64>,
    pub origin: TxOrigin,
}

impl NormalizedTx {
    pub fn from_rpc(tx: &alloy::rpc::types::Transaction, origin: TxOrigin) -> Self {
        let is_legacy = tx.inner.gas_price().is_some();
        Self {
            hash: tx.tx_hash(),
            block_number: tx.block_number,
            block_hash: tx.block_hash,
            index: tx.transaction_index,
            from: tx.inner.signer(),
            to: tx.inner.to(),
            nonce: tx.inner.nonce(),
            gas_limit: tx.inner.gas_limit(),
            gas_price: tx.inner.gas_price(),
            max_fee_per_gas: (!is_legacy).then(|| tx.inner.max_fee_per_gas()),
            max_priority_fee_per_gas: tx.inner.max_priority_fee_per_gas(),
            input: tx.inner.input().clone(),
            value: tx.inner.value(),
            chain_id: tx.inner.chain_id(),
            origin,
        }
    }

    /// First ten characters of the calldata (`0x` + four selector bytes),
    /// or `"0x"` when the calldata is too short to carry a selector.
    pub fn selector(&self) -> String {
        if self.input.len() >= 4 {
            format!("0x{}", alloy::primitives::hex::encode(&self.input[..4]))
        } else {
            "0x".to_string()
        }
    }
}

/// Minimal normalized block: header fields plus its transactions in order.
#[derive(Debug, Clone)]
pub struct NormalizedBlock {
    pub number: u64,
    pub hash: B256,
    pub timestamp: u64,
    pub transactions: Vec<NormalizedTx>,
}

impl NormalizedBlock {
    pub fn from_rpc(block: alloy::rpc::types::Block) -> Self {
        let number = block.header.number;
        let hash = block.header.hash;
        let timestamp = block.header.timestamp;
        let transactions = block
            .transactions
            .into_transactions()
            .map(|tx| NormalizedTx::from_rpc(&tx, TxOrigin::Block))
            .collect();
        Self {
            number,
            hash,
            timestamp,
            transactions,
        }
    }
}

/// One transaction emitted by the ingestor, paired with its block timestamp.
#[derive(Debug, Clone)]
pub struct EmittedTx {
    pub tx: NormalizedTx,
    pub block_timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_of_short_calldata() {
        let tx = NormalizedTx {
            hash: B256::ZERO,
            block_number: None,
            block_hash: None,
            index: None,
            from: Address::ZERO,
            to: None,
            nonce: 0,
            gas_limit: 21_000,
            gas_price: Some(1),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            input: Bytes::from(vec![0xa9, 0x05]),
            value: U256::ZERO,
            chain_id: Some(1),
            origin: TxOrigin::Block,
        };
        assert_eq!(tx.selector(), "0x");
    }

    #[test]
    fn test_selector_of_transfer_calldata() {
        let mut calldata = vec![0xa9, 0x05, 0x9c, 0xbb];
        calldata.extend_from_slice(&[0u8; 64]);
        let tx = NormalizedTx {
            hash: B256::ZERO,
            block_number: Some(1),
            block_hash: None,
            index: Some(0),
            from: Address::ZERO,
            to: Some(Address::ZERO),
            nonce: 0,
            gas_limit: 60_000,
            gas_price: None,
            max_fee_per_gas: Some(10),
            max_priority_fee_per_gas: Some(1),
            input: Bytes::from(calldata),
            value: U256::ZERO,
            chain_id: Some(1),
            origin: TxOrigin::Block,
        };
        assert_eq!(tx.selector(), "0xa9059cbb");
        assert_eq!(tx.origin.as_str(), "block");
    }
}
