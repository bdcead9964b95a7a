use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolCall;
use sqlx::SqlitePool;

use crate::db::local;
use crate::extract::TRANSFER_SELECTOR;
use crate::rpc::multicall::Multicall;

alloy::sol! {
    function symbol() external view returns (string);
    function decimals() external view returns (uint8);
    function token0() external view returns (address);
    function token1() external view returns (address);
}

/// Cached metadata for a resolved token contract.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub symbol: String,
    pub decimals: u8,
}

/// Resolves contract address -> (symbol, decimals) through batched multicall
/// probes, backed by a positive-only write-once cache.
///
/// Negatives are never cached so a token deployed between sightings resolves
/// on a later attempt.
pub struct TokenResolver {
    multicall: Arc<Multicall>,
    cache_db: SqlitePool,
    cache: RwLock<HashMap<Address, TokenRecord>>,
    base_tokens: HashSet<String>,
}

impl TokenResolver {
    /// Build the resolver and warm the in-memory cache from the embedded DB.
    pub async fn load(
        multicall: Arc<Multicall>,
        cache_db: SqlitePool,
        base_tokens: &[String],
    ) -> eyre::Result<Self> {
        let mut cache = HashMap::new();
        for (address, symbol, decimals) in local::load_tokens(&cache_db).await? {
            if let Ok(address) = address.parse::<Address>() {
                cache.insert(address, TokenRecord { symbol, decimals });
            }
        }
        tracing::info!(tokens = cache.len(), "Loaded token metadata cache");
        Ok(Self {
            multicall,
            cache_db,
            cache: RwLock::new(cache),
            base_tokens: base_tokens.iter().cloned().collect(),
        })
    }

    pub fn record(&self, address: &Address) -> Option<TokenRecord> {
        self.cache.read().expect("token cache poisoned").get(address).cloned()
    }

    /// Resolve symbols for a set of candidate addresses.
    ///
    /// Cache misses are probed with two parallel multicall batches
    /// (`symbol()` and `decimals()`); only pairs with a non-empty symbol and
    /// decimals > 0 are kept and persisted. Unresolvable addresses are
    /// silently dropped. The result keeps input order, except that
    /// base-token entries sort last.
    pub async fn lookup(&self, addresses: &[Address]) -> eyre::Result<Vec<(Address, String)>> {
        let mut unique = Vec::new();
        for address in addresses {
            if !unique.contains(address) {
                unique.push(*address);
            }
        }

        let misses: Vec<Address> = {
            let cache = self.cache.read().expect("token cache poisoned");
            unique.iter().copied().filter(|a| !cache.contains_key(a)).collect()
        };

        if !misses.is_empty() {
            let symbol_calls: Vec<(Address, Bytes)> = misses
                .iter()
                .map(|a| (*a, symbolCall {}.abi_encode().into()))
                .collect();
            let decimals_calls: Vec<(Address, Bytes)> = misses
                .iter()
                .map(|a| (*a, decimalsCall {}.abi_encode().into()))
                .collect();

            let (symbols, decimals) = tokio::join!(
                self.multicall.try_aggregate(&symbol_calls),
                self.multicall.try_aggregate(&decimals_calls),
            );
            let (symbols, decimals) = (symbols?, decimals?);

            for (i, address) in misses.iter().enumerate() {
                let symbol = symbols
                    .get(i)
                    .filter(|o| o.success)
                    .and_then(|o| symbolCall::abi_decode_returns(&o.return_data).ok());
                let decimals = decimals
                    .get(i)
                    .filter(|o| o.success)
                    .and_then(|o| decimalsCall::abi_decode_returns(&o.return_data).ok());

                let (Some(symbol), Some(decimals)) = (symbol, decimals) else {
                    continue;
                };
                let symbol = symbol.trim().to_string();
                if symbol.is_empty() || decimals == 0 {
                    continue;
                }

                self.store(*address, TokenRecord { symbol, decimals }).await;
            }
        }

        let resolved: Vec<(Address, String)> = {
            let cache = self.cache.read().expect("token cache poisoned");
            unique
                .iter()
                .filter_map(|a| cache.get(a).map(|r| (*a, r.symbol.clone())))
                .collect()
        };
        Ok(order_base_last(resolved, &self.base_tokens))
    }

    /// If the calldata is an ERC20 transfer of a token we have metadata for,
    /// return its human amount rounded to two fractional digits.
    pub fn decode_transfer_amount(&self, calldata: &[u8], token: &Address) -> Option<String> {
        let record = self.record(token)?;
        decode_transfer_amount_with(&record, calldata)
    }

    /// Probe every candidate with `token0()`/`token1()` in one batch and
    /// return the successfully decoded underlying addresses, unique, in
    /// encounter order. Non-pair contracts simply fail their sub-calls.
    pub async fn extract_pair_underlyings(
        &self,
        candidates: &[Address],
    ) -> eyre::Result<Vec<Address>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut calls: Vec<(Address, Bytes)> = Vec::with_capacity(candidates.len() * 2);
        for candidate in candidates {
            calls.push((*candidate, token0Call {}.abi_encode().into()));
            calls.push((*candidate, token1Call {}.abi_encode().into()));
        }

        let outcomes = self.multicall.try_aggregate(&calls).await?;
        let mut underlyings = Vec::new();
        for outcome in outcomes.iter().filter(|o| o.success) {
            // token0 and token1 share the return shape, one decoder covers both
            let Ok(address) = token0Call::abi_decode_returns(&outcome.return_data) else {
                continue;
            };
            if !address.is_zero() && !underlyings.contains(&address) {
                underlyings.push(address);
            }
        }
        Ok(underlyings)
    }

    /// Write-once insert into the in-memory map with write-through to the
    /// embedded DB. Persistence failures are logged and absorbed; the next
    /// successful write recovers.
    async fn store(&self, address: Address, record: TokenRecord) {
        {
            let mut cache = self.cache.write().expect("token cache poisoned");
            if cache.contains_key(&address) {
                return;
            }
            cache.insert(address, record.clone());
        }
        let key = format!("{address:#x}");
        if let Err(e) = local::insert_token(&self.cache_db, &key, &record.symbol, record.decimals).await
        {
            tracing::warn!(address = %key, error = %e, "Failed to persist token record");
        }
    }
}

/// Keep input order but move entries whose symbol is in the base set last.
fn order_base_last(
    resolved: Vec<(Address, String)>,
    base_tokens: &HashSet<String>,
) -> Vec<(Address, String)> {
    let (base, mut ordered): (Vec<_>, Vec<_>) = resolved
        .into_iter()
        .partition(|(_, symbol)| base_tokens.contains(symbol));
    ordered.extend(base);
    ordered
}

fn decode_transfer_amount_with(record: &TokenRecord, calldata: &[u8]) -> Option<String> {
    if !calldata.starts_with(&TRANSFER_SELECTOR) || calldata.len() < 68 {
        return None;
    }
    let amount = U256::from_be_slice(&calldata[36..68]);
    Some(scale_amount(amount, record.decimals, 2))
}

/// Scale a raw integer amount by 10^decimals and round to `places`
/// fractional digits (half-up). The result always carries a decimal point.
pub fn scale_amount(amount: U256, decimals: u8, places: usize) -> String {
    let full = alloy::primitives::utils::format_units(amount, decimals)
        .unwrap_or_else(|_| amount.to_string());
    round_decimal_str(&full, places)
}

/// Round a plain decimal string to a fixed number of fractional digits.
pub(crate) fn round_decimal_str(value: &str, places: usize) -> String {
    let (negative, rest) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (int_part, frac_part) = match rest.split_once('.') {
        Some((i, f)) => (i, f),
        None => (rest, ""),
    };

    let mut int_digits: Vec<u8> = int_part.bytes().map(|b| b.wrapping_sub(b'0')).collect();
    if int_digits.is_empty() {
        int_digits.push(0);
    }
    let mut frac_digits: Vec<u8> = frac_part.bytes().map(|b| b.wrapping_sub(b'0')).collect();

    let round_up = frac_digits.get(places).is_some_and(|d| *d >= 5);
    frac_digits.truncate(places);
    while frac_digits.len() < places {
        frac_digits.push(0);
    }

    if round_up {
        let mut carry = 1u8;
        for digit in frac_digits.iter_mut().rev() {
            *digit += carry;
            carry = *digit / 10;
            *digit %= 10;
            if carry == 0 {
                break;
            }
        }
        if carry > 0 {
            for digit in int_digits.iter_mut().rev() {
                *digit += carry;
                carry = *digit / 10;
                *digit %= 10;
                if carry == 0 {
                    break;
                }
            }
            if carry > 0 {
                int_digits.insert(0, carry);
            }
        }
    }

    let int_str: String = {
        let trimmed: Vec<u8> = int_digits
            .iter()
            .copied()
            .skip_while(|d| *d == 0)
            .collect();
        let digits = if trimmed.is_empty() { vec![0] } else { trimmed };
        digits.iter().map(|d| (d + b'0') as char).collect()
    };
    let frac_str: String = frac_digits.iter().map(|d| (d + b'0') as char).collect();

    let is_zero = int_str == "0" && frac_digits.iter().all(|d| *d == 0);
    let sign = if negative && !is_zero { "-" } else { "" };
    if places == 0 {
        format!("{sign}{int_str}.0")
    } else {
        format!("{sign}{int_str}.{frac_str}")
    }
}
