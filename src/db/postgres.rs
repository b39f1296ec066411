use crate::config::{AppConfig, RuntimeSnapshot};
use crate::models::{
    Command, CommandKind, PositionOrigin, PositionStatus, Side, Signal, SignalAction,
    TrackedPosition,
};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

/// Postgres-backed position ledger, runtime config store, command queue and
/// signal audit log.
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Connect to Postgres and run migrations
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    // ==================== POSITION LEDGER ====================

    /// Insert a newly opened position row
    pub async fn insert_position(&self, position: &TrackedPosition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, side, entry_price, quantity, extreme_price,
                status, origin, entry_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(position.id)
        .bind(&position.symbol)
        .bind(side_str(position.side))
        .bind(position.entry_price)
        .bind(position.quantity)
        .bind(position.extreme_price)
        .bind(status_str(position.status))
        .bind(origin_str(position.origin))
        .bind(position.entry_time)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Inserted {} position {} for {}",
            origin_str(position.origin),
            position.id,
            position.symbol
        );

        Ok(())
    }

    /// Persist a new favorable watermark
    pub async fn update_extreme_price(&self, id: Uuid, extreme_price: f64) -> Result<()> {
        sqlx::query(
            "UPDATE positions SET extreme_price = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(extreme_price)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Rewrite the entry price to the exchange average and reset the
    /// watermark to it. Only called when divergence resync is enabled.
    pub async fn resync_entry_price(&self, id: Uuid, entry_price: f64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions
            SET entry_price = $1, extreme_price = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(entry_price)
        .bind(id)
        .execute(&self.pool)
        .await?;

        tracing::info!("Resynced entry price of position {} to {}", id, entry_price);

        Ok(())
    }

    /// Terminal transition. Status, exit price, exit time and PnL are written
    /// in a single statement so a crash can never leave a half-closed row.
    pub async fn close_position(
        &self,
        id: Uuid,
        status: PositionStatus,
        exit_price: f64,
        realized_pnl: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions
            SET status = $1, exit_price = $2, realized_pnl = $3,
                exit_time = NOW(), updated_at = NOW()
            WHERE id = $4 AND status = 'Open'
            "#,
        )
        .bind(status_str(status))
        .bind(exit_price)
        .bind(realized_pnl)
        .bind(id)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Closed position {} as {} at {} (pnl {:.4})",
            id,
            status_str(status),
            exit_price,
            realized_pnl
        );

        Ok(())
    }

    /// All open rows, oldest entry first
    pub async fn open_positions(&self) -> Result<Vec<TrackedPosition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, side, entry_price, quantity, extreme_price,
                   status, origin, entry_time, exit_time, exit_price, realized_pnl
            FROM positions
            WHERE status = 'Open'
            ORDER BY entry_time ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_position).collect()
    }

    /// The open row for a symbol. When the one-open-row-per-symbol invariant
    /// has been violated operationally, the most recent row wins.
    pub async fn open_position_for(&self, symbol: &str) -> Result<Option<TrackedPosition>> {
        let row = sqlx::query(
            r#"
            SELECT id, symbol, side, entry_price, quantity, extreme_price,
                   status, origin, entry_time, exit_time, exit_price, realized_pnl
            FROM positions
            WHERE symbol = $1 AND status = 'Open'
            ORDER BY entry_time DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_position).transpose()
    }

    /// Exit time and status of the most recently closed trade for a symbol
    pub async fn last_exit(&self, symbol: &str) -> Result<Option<(DateTime<Utc>, String)>> {
        let row = sqlx::query(
            r#"
            SELECT exit_time, status FROM positions
            WHERE symbol = $1 AND status <> 'Open' AND exit_time IS NOT NULL
            ORDER BY exit_time DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| (r.get("exit_time"), r.get("status"))))
    }

    // ==================== RUNTIME CONFIG ====================

    /// Read one config value, falling back to the default on any failure.
    /// Config reads are best-effort; a broken store must not stop the loop.
    pub async fn config_value(&self, key: &str, default: &str) -> String {
        let result = sqlx::query("SELECT value FROM bot_configs WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await;

        match result {
            Ok(Some(row)) => row.get("value"),
            Ok(None) => default.to_string(),
            Err(e) => {
                tracing::warn!("Config read failed for {}: {}", key, e);
                default.to_string()
            }
        }
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_configs (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        tracing::info!("Config updated: {} = {}", key, value);

        Ok(())
    }

    /// Refresh the mutable runtime parameters for this tick
    pub async fn runtime_snapshot(&self, cfg: &AppConfig) -> RuntimeSnapshot {
        let paused = self.config_value("is_paused", "false").await == "true";
        let target_notional = self
            .config_value("position_size", &cfg.default_notional.to_string())
            .await
            .parse::<f64>()
            .unwrap_or(cfg.default_notional);

        RuntimeSnapshot {
            paused,
            target_notional,
        }
    }

    // ==================== COMMAND QUEUE ====================

    /// Pending remote commands, oldest first. Unknown command names are
    /// marked executed so they do not wedge the queue.
    pub async fn pending_commands(&self) -> Result<Vec<Command>> {
        let rows = sqlx::query(
            r#"
            SELECT id, command, params FROM command_queue
            WHERE status = 'PENDING'
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut commands = Vec::new();
        for row in rows {
            let id: i64 = row.get("id");
            let raw: String = row.get("command");
            let params: serde_json::Value = row.get("params");

            match CommandKind::parse(&raw) {
                Some(kind) => commands.push(Command { id, kind, params }),
                None => {
                    tracing::warn!("Unknown remote command '{}' (id {}), discarding", raw, id);
                    self.mark_command_executed(id).await?;
                }
            }
        }

        Ok(commands)
    }

    pub async fn mark_command_executed(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE command_queue SET status = 'EXECUTED', executed_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== SIGNALS ====================

    /// Pending signals awaiting consumption, oldest first
    pub async fn pending_signals(&self) -> Result<Vec<Signal>> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, action, confidence, entry_price, reasoning
            FROM signals
            WHERE status = 'PENDING'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut signals = Vec::new();
        for row in rows {
            let action_str: String = row.get("action");
            let action = match action_str.as_str() {
                "BUY" => SignalAction::Buy,
                "SELL" => SignalAction::Sell,
                _ => SignalAction::Hold,
            };
            let confidence: rust_decimal::Decimal = row.get("confidence");
            let entry_price: rust_decimal::Decimal = row.get("entry_price");

            signals.push(Signal {
                id: row.get("id"),
                symbol: row.get("symbol"),
                action,
                confidence: confidence.to_string().parse()?,
                entry_price: entry_price.to_string().parse()?,
                reasoning: row.get("reasoning"),
            });
        }

        Ok(signals)
    }

    /// Mark a signal consumed. `status` is the audit outcome
    /// (EXECUTED or SKIPPED).
    pub async fn mark_signal(&self, id: Uuid, status: &str) -> Result<()> {
        sqlx::query(
            "UPDATE signals SET status = $1, consumed_at = NOW() WHERE id = $2",
        )
        .bind(status)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Queue a signal for consumption (used by tooling and tests; the
    /// production writer is the external analyst process)
    pub async fn enqueue_signal(&self, signal: &Signal) -> Result<()> {
        let action = match signal.action {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Hold => "HOLD",
        };

        sqlx::query(
            r#"
            INSERT INTO signals (id, symbol, action, confidence, entry_price, reasoning)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(signal.id)
        .bind(&signal.symbol)
        .bind(action)
        .bind(signal.confidence)
        .bind(signal.entry_price)
        .bind(&signal.reasoning)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete all rows (testing only)
    #[cfg(test)]
    pub async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM positions").execute(&self.pool).await?;
        sqlx::query("DELETE FROM command_queue").execute(&self.pool).await?;
        sqlx::query("DELETE FROM signals").execute(&self.pool).await?;
        Ok(())
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Long => "Long",
        Side::Short => "Short",
    }
}

fn status_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Open => "Open",
        PositionStatus::ClosedTp => "ClosedTp",
        PositionStatus::ClosedSl => "ClosedSl",
        PositionStatus::ClosedManual => "ClosedManual",
        PositionStatus::ClosedAiStale => "ClosedAiStale",
    }
}

fn origin_str(origin: PositionOrigin) -> &'static str {
    match origin {
        PositionOrigin::Signal => "Signal",
        PositionOrigin::Orphan => "Orphan",
    }
}

fn row_to_position(row: &sqlx::postgres::PgRow) -> Result<TrackedPosition> {
    let side_raw: String = row.get("side");
    let side = match side_raw.as_str() {
        "Long" => Side::Long,
        "Short" => Side::Short,
        _ => return Err(format!("invalid position side '{}'", side_raw).into()),
    };

    let status_raw: String = row.get("status");
    let status = match status_raw.as_str() {
        "Open" => PositionStatus::Open,
        "ClosedTp" => PositionStatus::ClosedTp,
        "ClosedSl" => PositionStatus::ClosedSl,
        "ClosedManual" => PositionStatus::ClosedManual,
        "ClosedAiStale" => PositionStatus::ClosedAiStale,
        _ => return Err(format!("invalid position status '{}'", status_raw).into()),
    };

    let origin_raw: String = row.get("origin");
    let origin = match origin_raw.as_str() {
        "Orphan" => PositionOrigin::Orphan,
        _ => PositionOrigin::Signal,
    };

    let entry_price: rust_decimal::Decimal = row.get("entry_price");
    let quantity: rust_decimal::Decimal = row.get("quantity");
    let extreme_price: rust_decimal::Decimal = row.get("extreme_price");
    let exit_price: Option<rust_decimal::Decimal> = row.get("exit_price");
    let realized_pnl: Option<rust_decimal::Decimal> = row.get("realized_pnl");

    Ok(TrackedPosition {
        id: row.get("id"),
        symbol: row.get("symbol"),
        side,
        entry_price: entry_price.to_string().parse()?,
        quantity: quantity.to_string().parse()?,
        extreme_price: extreme_price.to_string().parse()?,
        status,
        origin,
        entry_time: row.get("entry_time"),
        exit_time: row.get("exit_time"),
        exit_price: exit_price.map(|v| v.to_string().parse()).transpose()?,
        realized_pnl: realized_pnl.map(|v| v.to_string().parse()).transpose()?,
    })
}
