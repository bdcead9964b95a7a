use std::path::PathBuf;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Open (creating if missing) the embedded cache database.
pub async fn open(path: &str) -> eyre::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
        .map_err(|e| eyre::eyre!("Invalid local db path '{}': {}", path, e))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Create the cache tables when they do not exist yet (idempotent).
pub async fn ensure_schema(pool: &SqlitePool) -> eyre::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tokens (
            address TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            decimals INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS ens (
            address TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS selectors (
            selector TEXT PRIMARY KEY,
            signature TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_tokens(pool: &SqlitePool) -> eyre::Result<Vec<(String, String, u8)>> {
    let rows: Vec<(String, String, i64)> =
        sqlx::query_as("SELECT address, symbol, decimals FROM tokens")
            .fetch_all(pool)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(address, symbol, decimals)| (address, symbol, decimals as u8))
        .collect())
}

pub async fn insert_token(
    pool: &SqlitePool,
    address: &str,
    symbol: &str,
    decimals: u8,
) -> eyre::Result<()> {
    sqlx::query("INSERT OR IGNORE INTO tokens (address, symbol, decimals) VALUES (?, ?, ?)")
        .bind(address)
        .bind(symbol)
        .bind(decimals as i64)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn load_names(pool: &SqlitePool) -> eyre::Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT address, name FROM ens")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn get_signature(pool: &SqlitePool, selector: &str) -> eyre::Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT signature FROM selectors WHERE selector = ?")
            .bind(selector)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(s,)| s))
}

pub async fn insert_signature(
    pool: &SqlitePool,
    selector: &str,
    signature: &str,
) -> eyre::Result<()> {
    sqlx::query("INSERT OR IGNORE INTO selectors (selector, signature) VALUES (?, ?)")
        .bind(selector)
        .bind(signature)
        .execute(pool)
        .await?;
    Ok(())
}

/// The block-ingestion high-water mark, persisted as a single ASCII integer.
#[derive(Debug, Clone)]
pub struct HighWaterMark {
    path: PathBuf,
}

impl HighWaterMark {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the persisted block number. Missing file means a fresh start.
    pub async fn load(&self) -> eyre::Result<Option<u64>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let value = content
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| eyre::eyre!("Corrupt high-water mark file: {}", e))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn store(&self, value: u64) -> eyre::Result<()> {
        tokio::fs::write(&self.path, value.to_string()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_high_water_mark_round_trip() {
        let dir = std::env::temp_dir().join("walletwatch-hwm-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let hwm = HighWaterMark::new(dir.join("last_block.txt"));
        hwm.store(18_000_123).await.unwrap();
        assert_eq!(hwm.load().await.unwrap(), Some(18_000_123));
    }

    #[tokio::test]
    async fn test_high_water_mark_missing_file() {
        let hwm = HighWaterMark::new("/nonexistent-dir/never-written.txt");
        assert_eq!(hwm.load().await.unwrap(), None);
    }
}
