use alloy::primitives::Address;
use alloy::rpc::types::Log;

/// ERC20 `transfer(address,uint256)` selector.
pub const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// Scan calldata for address-shaped 32-byte words.
///
/// The scan runs at two origins: the start of the byte string and right
/// after the 4-byte selector, so both raw words and ABI-encoded arguments
/// line up on a chunk boundary. A chunk counts as an address when its
/// first 12 bytes are zero and the trailing 20 bytes are non-zero. ABI-aware
/// decoding would need per-function schemas; false positives are filtered
/// downstream by the multicall probes.
pub fn from_calldata(input: &[u8]) -> Vec<Address> {
    let mut found = Vec::new();
    for origin in [0usize, 4] {
        if input.len() <= origin {
            continue;
        }
        for chunk in input[origin..].chunks_exact(32) {
            if chunk[..12].iter().all(|b| *b == 0) {
                let address = Address::from_slice(&chunk[12..]);
                if !address.is_zero() && !found.contains(&address) {
                    found.push(address);
                }
            }
        }
    }
    found
}

/// Emitting address of every receipt log, unique, in encounter order.
pub fn from_logs(logs: &[Log]) -> Vec<Address> {
    let mut found = Vec::new();
    for log in logs {
        let address = log.inner.address;
        if !found.contains(&address) {
            found.push(address);
        }
    }
    found
}

/// Recipient of an ERC20 `transfer` call, or None when the calldata is not
/// a transfer or carries fewer than 36 bytes after the selector.
pub fn transfer_recipient(input: &[u8]) -> Option<Address> {
    if !input.starts_with(&TRANSFER_SELECTOR) || input.len() < 40 {
        return None;
    }
    let word = &input[4..36];
    if word[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(Address::from_slice(&word[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, U256};

    fn transfer_calldata(to: Address, amount: U256) -> Vec<u8> {
        let mut data = TRANSFER_SELECTOR.to_vec();
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(to.as_slice());
        data.extend_from_slice(&amount.to_be_bytes::<32>());
        data
    }

    #[test]
    fn test_transfer_recipient() {
        let w = address!("00000000219ab540356cbb839cbe05303d7705fa");
        let data = transfer_calldata(w, U256::from(100u64) * U256::from(10u64).pow(U256::from(18)));
        assert_eq!(transfer_recipient(&data), Some(w));
    }

    #[test]
    fn test_transfer_recipient_rejects_short_calldata() {
        let mut data = TRANSFER_SELECTOR.to_vec();
        data.extend_from_slice(&[0u8; 20]);
        assert_eq!(transfer_recipient(&data), None);
    }

    #[test]
    fn test_transfer_recipient_length_boundary() {
        let w = address!("00000000219ab540356cbb839cbe05303d7705fa");
        let mut data = TRANSFER_SELECTOR.to_vec();
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(w.as_slice());
        // 36 total bytes: a full recipient word but under 36 bytes after
        // the selector
        assert_eq!(transfer_recipient(&data), None);
        data.extend_from_slice(&[0u8; 3]);
        assert_eq!(transfer_recipient(&data), None); // 39 total, still short
        data.push(0);
        assert_eq!(transfer_recipient(&data), Some(w)); // 40 total
    }

    #[test]
    fn test_transfer_recipient_rejects_other_selectors() {
        let w = address!("00000000219ab540356cbb839cbe05303d7705fa");
        let mut data = transfer_calldata(w, U256::from(1));
        data[0] = 0x23;
        assert_eq!(transfer_recipient(&data), None);
    }

    #[test]
    fn test_calldata_scan_finds_selector_aligned_word() {
        let w = address!("d8da6bf26964af9d7eed9e03e53415d37aa96045");
        let data = transfer_calldata(w, U256::from(5));
        let found = from_calldata(&data);
        assert_eq!(found, vec![w]);
    }

    #[test]
    fn test_calldata_scan_finds_unaligned_origin_word() {
        // No selector at all: a bare 32-byte word at offset zero.
        let w = address!("d8da6bf26964af9d7eed9e03e53415d37aa96045");
        let mut data = vec![0u8; 12];
        data.extend_from_slice(w.as_slice());
        let found = from_calldata(&data);
        assert_eq!(found, vec![w]);
    }

    #[test]
    fn test_calldata_scan_dedups_and_skips_zero() {
        let w = address!("d8da6bf26964af9d7eed9e03e53415d37aa96045");
        let mut data = vec![0u8; 4];
        for _ in 0..2 {
            data.extend_from_slice(&[0u8; 12]);
            data.extend_from_slice(w.as_slice());
        }
        data.extend_from_slice(&[0u8; 32]); // zero word, not an address
        let found = from_calldata(&data);
        assert_eq!(found, vec![w]);
    }

    #[test]
    fn test_log_addresses_unique_in_order() {
        let a = address!("d8da6bf26964af9d7eed9e03e53415d37aa96045");
        let b = address!("00000000219ab540356cbb839cbe05303d7705fa");
        let mk = |addr| Log {
            inner: alloy::primitives::Log::new_unchecked(addr, vec![], Default::default()),
            ..Default::default()
        };
        let logs = vec![mk(a), mk(b), mk(a)];
        assert_eq!(from_logs(&logs), vec![a, b]);
    }

    #[test]
    fn test_calldata_scan_ignores_non_address_words() {
        // High bytes set in the first 12 positions: not address-shaped.
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&[0xff; 32]);
        assert!(from_calldata(&data).is_empty());
    }
}
