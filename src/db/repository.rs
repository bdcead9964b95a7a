use sqlx::PgPool;

/// One watchlist row from the shared store. Addresses are stored lower-case;
/// the subscriber is identified by `(chat_id, bot_id)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WatchRow {
    pub address: String,
    pub chat_id: i64,
    pub bot_id: String,
    pub name: Option<String>,
    pub blocked: bool,
}

/// Create the shared-store tables when they do not exist yet (idempotent).
/// The command-surface bots own the writes; the monitor only reads and
/// flags unreachable subscribers.
pub async fn ensure_schema(pool: &PgPool) -> eyre::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS access (
            chat_id BIGINT NOT NULL,
            bot_id TEXT NOT NULL,
            username TEXT,
            alltx BOOLEAN NOT NULL DEFAULT FALSE,
            swap BOOLEAN NOT NULL DEFAULT FALSE,
            deploy BOOLEAN NOT NULL DEFAULT FALSE,
            PRIMARY KEY (chat_id, bot_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS watchlist (
            address TEXT NOT NULL,
            chat_id BIGINT NOT NULL,
            bot_id TEXT NOT NULL,
            username TEXT,
            name TEXT,
            time BIGINT NOT NULL DEFAULT 0,
            blocked BOOLEAN NOT NULL DEFAULT FALSE,
            PRIMARY KEY (address, chat_id, bot_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS cex (
            address TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Load every non-blocked watchlist row.
pub async fn load_watchlist(pool: &PgPool) -> eyre::Result<Vec<WatchRow>> {
    let rows: Vec<WatchRow> = sqlx::query_as(
        "SELECT address, chat_id, bot_id, name, blocked
         FROM watchlist
         WHERE blocked = FALSE",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Flag every watchlist row of an unreachable subscriber so the refresher
/// drops it on the next snapshot.
pub async fn mark_subscriber_blocked(
    pool: &PgPool,
    chat_id: i64,
    bot_id: &str,
) -> eyre::Result<u64> {
    let result = sqlx::query(
        "UPDATE watchlist SET blocked = TRUE WHERE chat_id = $1 AND bot_id = $2",
    )
    .bind(chat_id)
    .bind(bot_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Exchange wallet labels, merged into the display-name store at startup.
pub async fn load_cex_names(pool: &PgPool) -> eyre::Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT address, name FROM cex")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}
