use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::db::local;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolves a 4-byte selector into a human-readable function signature by
/// racing two public signature databases. Results are decorative: every
/// failure path yields `None` and the pipeline continues.
///
/// Positive answers are memoized in memory and persisted to the embedded
/// `selectors` table; misses are retried on later sightings.
pub struct SigResolver {
    http: reqwest::Client,
    cache_db: SqlitePool,
    memo: RwLock<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct FourByteResponse {
    results: Vec<FourByteEntry>,
}

#[derive(Debug, Deserialize)]
struct FourByteEntry {
    id: i64,
    text_signature: String,
}

impl SigResolver {
    pub fn new(cache_db: SqlitePool) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            cache_db,
            memo: RwLock::new(HashMap::new()),
        })
    }

    pub async fn resolve(&self, selector: &str) -> Option<String> {
        if selector.len() != 10 || !selector.starts_with("0x") {
            return None;
        }

        if let Some(hit) = self.memo.read().expect("sig memo poisoned").get(selector) {
            return Some(hit.clone());
        }

        match local::get_signature(&self.cache_db, selector).await {
            Ok(Some(signature)) => {
                self.memoize(selector, &signature);
                return Some(signature);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(selector, error = %e, "Selector cache read failed"),
        }

        // Race both services; the first non-selector answer wins and the
        // slower request is dropped mid-flight
        let mut in_flight = FuturesUnordered::new();
        in_flight.push(self.query_fourbyte(selector).boxed());
        in_flight.push(self.query_openchain(selector).boxed());

        let mut resolved = None;
        while let Some(answer) = in_flight.next().await {
            match answer {
                Some(candidate) if !candidate.is_empty() && candidate != selector => {
                    resolved = Some(candidate);
                    break;
                }
                _ => {}
            }
        }
        drop(in_flight);
        let signature = resolved?;

        if let Err(e) = local::insert_signature(&self.cache_db, selector, &signature).await {
            tracing::warn!(selector, error = %e, "Failed to persist signature");
        }
        self.memoize(selector, &signature);
        Some(signature)
    }

    fn memoize(&self, selector: &str, signature: &str) {
        self.memo
            .write()
            .expect("sig memo poisoned")
            .insert(selector.to_string(), signature.to_string());
    }

    async fn query_fourbyte(&self, selector: &str) -> Option<String> {
        let url = format!(
            "https://www.4byte.directory/api/v1/signatures/?hex_signature={selector}"
        );
        let response: FourByteResponse = self
            .http
            .get(&url)
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        // Lowest id is the earliest registration, usually the canonical one
        response
            .results
            .into_iter()
            .min_by_key(|e| e.id)
            .map(|e| e.text_signature)
    }

    async fn query_openchain(&self, selector: &str) -> Option<String> {
        let url = format!(
            "https://api.openchain.xyz/signature-database/v1/lookup?function={selector}&filter=true"
        );
        let response: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        response
            .get("result")?
            .get("function")?
            .get(selector)?
            .get(0)?
            .get("name")?
            .as_str()
            .map(|s| s.to_string())
    }
}
