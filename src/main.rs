use chrono::Utc;
use clap::Parser;
use perpbot::api::ExchangeClient;
use perpbot::config::{AppConfig, RuntimeSnapshot};
use perpbot::db::PostgresLedger;
use perpbot::execution::{self, Executor, PriceOracle};
use perpbot::llm::AiAnalyst;
use perpbot::models::{
    realized_pnl, Command, CommandKind, ExchangePosition, PositionOrigin, PositionStatus, Signal,
    TrackedPosition, Verdict,
};
use perpbot::notify::TelegramNotifier;
use perpbot::reconcile::{self, ReconcileAction};
use perpbot::risk;
use perpbot::Result;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(name = "perpbot", about = "Position-risk engine for a perp futures account")]
struct Args {
    /// Run a single tick and exit
    #[arg(long)]
    once: bool,

    /// Override the polling interval in seconds
    #[arg(long)]
    tick_secs: Option<u64>,
}

struct App {
    cfg: AppConfig,
    ledger: PostgresLedger,
    exchange: ExchangeClient,
    oracle: PriceOracle,
    executor: Executor,
    analyst: AiAnalyst,
    notifier: TelegramNotifier,
    last_review: Option<Instant>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut cfg = AppConfig::from_env();
    if let Some(tick_secs) = args.tick_secs {
        cfg.tick_secs = tick_secs;
    }

    tracing::info!("🤖 perpbot starting");
    tracing::info!("  Tick interval: {}s", cfg.tick_secs);
    tracing::info!("  Review interval: {}s", cfg.review_interval_secs);
    tracing::info!("  Exchange: {}", cfg.exchange_base_url);

    let ledger = PostgresLedger::connect(&cfg.database_url).await?;
    let exchange = ExchangeClient::new(cfg.exchange_base_url.clone(), cfg.exchange_api_key.clone());
    let oracle = PriceOracle::new(exchange.clone());
    let executor = Executor::new(exchange.clone());
    let analyst = AiAnalyst::new(cfg.ai_api_key.clone(), cfg.ai_base_url.clone());
    let notifier = TelegramNotifier::new(
        cfg.telegram_bot_token.clone(),
        cfg.telegram_chat_id.clone(),
    );

    notifier.send("🤖 *perpbot started*").await;

    let mut app = App {
        cfg,
        ledger,
        exchange,
        oracle,
        executor,
        analyst,
        notifier,
        last_review: None,
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        _ = run_loop(&mut app, args.once) => {}
    }

    tracing::info!("👋 perpbot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perpbot=info".into()),
        )
        .init();
}

async fn run_loop(app: &mut App, once: bool) {
    let mut ticker = interval(Duration::from_secs(app.cfg.tick_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        tracing::info!("⏰ Tick at {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));

        app.run_tick().await;

        if once {
            break;
        }
    }
}

impl App {
    /// One pass of the control loop. Ordering matters: reconciliation runs
    /// before the risk engine so a symbol cannot be risk-evaluated against
    /// stale ledger state in the same tick it was adopted or zombie-closed.
    async fn run_tick(&mut self) {
        let mut snapshot = self.ledger.runtime_snapshot(&self.cfg).await;

        self.process_commands(&mut snapshot).await;

        let positions = match self.exchange.get_open_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                tracing::warn!("Position fetch failed, skipping tick: {}", e);
                return;
            }
        };

        self.reconcile_tick(&positions).await;
        self.risk_tick(&positions).await;

        if snapshot.paused {
            tracing::info!("⏸️  Paused by remote command, skipping signals and review");
            return;
        }

        self.consume_signals(&snapshot).await;

        if self.review_due() {
            self.stale_review(&positions, false).await;
            self.last_review = Some(Instant::now());
        }
    }

    fn review_due(&self) -> bool {
        match self.last_review {
            None => true,
            Some(at) => at.elapsed() >= Duration::from_secs(self.cfg.review_interval_secs),
        }
    }

    // ==================== RECONCILIATION ====================

    async fn reconcile_tick(&self, positions: &[ExchangePosition]) {
        let open_rows = match self.ledger.open_positions().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Ledger read failed, skipping reconciliation: {}", e);
                return;
            }
        };

        let actions = reconcile::plan(
            &open_rows,
            positions,
            self.cfg.risk.entry_divergence_tolerance,
        );

        for action in actions {
            match action {
                ReconcileAction::Adopt {
                    symbol,
                    side,
                    entry_price,
                    quantity,
                } => {
                    let row = TrackedPosition::open(
                        symbol.clone(),
                        side,
                        entry_price,
                        quantity,
                        PositionOrigin::Orphan,
                    );
                    match self.ledger.insert_position(&row).await {
                        Ok(()) => {
                            tracing::info!("📦 Adopted orphan position {} @ {}", symbol, entry_price);
                            self.notifier
                                .send(&format!("📦 *Orphan adopted*: {} @ {}", symbol, entry_price))
                                .await;
                        }
                        Err(e) => tracing::warn!("Failed to adopt orphan {}: {}", symbol, e),
                    }
                }
                ReconcileAction::CloseZombie { position } => {
                    // Best available price; a zero-valued exit is recorded
                    // rather than fabricating one.
                    let price = self.oracle.resolve_price(&position.symbol).await;
                    let exit_price = price.unwrap_or(0.0);
                    let pnl = price.map(|p| position.pnl_at(p)).unwrap_or(0.0);

                    match self
                        .ledger
                        .close_position(position.id, PositionStatus::ClosedManual, exit_price, pnl)
                        .await
                    {
                        Ok(()) => {
                            tracing::info!(
                                "🧹 Zombie closed: {} @ {} (pnl {:.4})",
                                position.symbol,
                                exit_price,
                                pnl
                            );
                            self.notifier
                                .send(&format!(
                                    "🧹 *Zombie closed*: {} @ {}",
                                    position.symbol, exit_price
                                ))
                                .await;
                        }
                        Err(e) => {
                            tracing::warn!("Failed to close zombie {}: {}", position.symbol, e)
                        }
                    }
                }
                ReconcileAction::FlagDivergence {
                    position_id,
                    symbol,
                    ledger_entry,
                    exchange_entry,
                } => {
                    tracing::warn!(
                        "⚠️  Entry mismatch for {}: ledger={} exchange={}",
                        symbol,
                        ledger_entry,
                        exchange_entry
                    );
                    if self.cfg.risk.resync_on_divergence {
                        if let Err(e) = self
                            .ledger
                            .resync_entry_price(position_id, exchange_entry)
                            .await
                        {
                            tracing::warn!("Failed to resync entry for {}: {}", symbol, e);
                        }
                    }
                }
            }
        }
    }

    // ==================== RISK ENGINE ====================

    async fn risk_tick(&self, positions: &[ExchangePosition]) {
        for exchange_pos in positions {
            let row = match self.ledger.open_position_for(&exchange_pos.symbol).await {
                Ok(Some(row)) => row,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Ledger read failed for {}: {}", exchange_pos.symbol, e);
                    continue;
                }
            };

            if row.entry_price <= 0.0 {
                continue;
            }

            let Some(mark) = self.oracle.resolve_price(&row.symbol).await else {
                tracing::warn!(
                    "No price for {} after retries, skipping risk check",
                    row.symbol
                );
                continue;
            };

            let extreme = risk::advance_watermark(row.side, row.entry_price, row.extreme_price, mark);
            if extreme != row.extreme_price {
                if let Err(e) = self.ledger.update_extreme_price(row.id, extreme).await {
                    tracing::warn!("Failed to persist watermark for {}: {}", row.symbol, e);
                }
            }

            let peak_pct = risk::favorable_pct(row.side, row.entry_price, extreme);
            let (tier, stop) = risk::effective_stop(row.side, row.entry_price, extreme, &self.cfg.risk);
            let take_profit = risk::take_profit_price(row.side, row.entry_price, &self.cfg.risk);
            tracing::info!(
                "📊 {:?} {} | entry {:.4} | mark {:.4} | peak {:.2}% | tp {:.4} | {} stop {:.4}",
                row.side,
                row.symbol,
                row.entry_price,
                mark,
                peak_pct * 100.0,
                take_profit,
                tier.as_str(),
                stop
            );

            match risk::evaluate(row.side, row.entry_price, extreme, mark, &self.cfg.risk) {
                risk::RiskDecision::Hold => {}
                risk::RiskDecision::TakeProfit => {
                    tracing::info!("💰 Take profit hit for {} at {}", row.symbol, mark);
                    self.close_tracked(&row, exchange_pos.abs_qty(), mark, PositionStatus::ClosedTp)
                        .await;
                }
                risk::RiskDecision::StopOut(tier) => {
                    tracing::info!(
                        "🛑 Stop ({}) hit for {} at {}",
                        tier.as_str(),
                        row.symbol,
                        mark
                    );
                    self.close_tracked(&row, exchange_pos.abs_qty(), mark, PositionStatus::ClosedSl)
                        .await;
                }
            }
        }
    }

    /// Shared close path: opposing reduce-only order, resolved exit price,
    /// single terminal ledger write, notification.
    async fn close_tracked(
        &self,
        row: &TrackedPosition,
        quantity: f64,
        trigger_mark: f64,
        status: PositionStatus,
    ) {
        let exit_price = match self
            .executor
            .close_position(&row.symbol, quantity, row.side, trigger_mark)
            .await
        {
            Ok(price) => price,
            Err(e) => {
                // The order may still fill; reconciliation picks it up next tick
                tracing::error!("Close failed for {}: {}", row.symbol, e);
                return;
            }
        };

        let pnl = realized_pnl(row.side, row.entry_price, exit_price, quantity);
        if let Err(e) = self
            .ledger
            .close_position(row.id, status, exit_price, pnl)
            .await
        {
            tracing::warn!("Failed to persist close for {}: {}", row.symbol, e);
        }

        self.notifier
            .send(&format!(
                "✅ *Closed* {} @ {:.4} (pnl {:+.4})",
                row.symbol, exit_price, pnl
            ))
            .await;
    }

    // ==================== SIGNAL CONSUMPTION ====================

    async fn consume_signals(&self, snapshot: &RuntimeSnapshot) {
        let signals = match self.ledger.pending_signals().await {
            Ok(signals) => signals,
            Err(e) => {
                tracing::warn!("Signal read failed: {}", e);
                return;
            }
        };

        for signal in signals {
            let open_rows = self.ledger.open_positions().await.unwrap_or_default();
            let has_open = open_rows.iter().any(|r| r.symbol == signal.symbol);
            let open_count = open_rows.len();

            if let Err(reason) =
                execution::executor::validate_signal(&signal, has_open, open_count, &self.cfg.risk)
            {
                tracing::info!("⏸️  Signal for {} skipped: {}", signal.symbol, reason);
                self.mark_signal(&signal, "SKIPPED").await;
                continue;
            }

            if let Ok(Some((exit_time, _))) = self.ledger.last_exit(&signal.symbol).await {
                if execution::executor::in_cooldown(
                    exit_time,
                    Utc::now(),
                    self.cfg.risk.reentry_cooldown_candles,
                ) {
                    tracing::info!("🧊 Cooldown active for {}, skipping signal", signal.symbol);
                    self.mark_signal(&signal, "SKIPPED").await;
                    continue;
                }
            }

            // Transient failure before any order exists: leave the signal
            // pending and retry next tick.
            let rules = match self.exchange.get_symbol_rules(&signal.symbol).await {
                Ok(rules) => rules,
                Err(e) => {
                    tracing::warn!("Rules fetch failed for {}: {}", signal.symbol, e);
                    continue;
                }
            };

            let quantity = match execution::size_order(
                snapshot.target_notional,
                signal.entry_price,
                rules.base_tick,
                rules.min_notional,
            ) {
                Ok(quantity) => quantity,
                Err(e) => {
                    tracing::info!("⏸️  Signal for {} rejected by sizing: {}", signal.symbol, e);
                    self.mark_signal(&signal, "SKIPPED").await;
                    continue;
                }
            };

            // From here the order may reach the exchange: the signal is
            // consumed either way, never blindly re-submitted. A fill that
            // slips through an error is adopted by reconciliation.
            match self.executor.open_from_signal(&signal, quantity).await {
                Ok(position) => {
                    if let Err(e) = self.ledger.insert_position(&position).await {
                        tracing::warn!("Failed to persist entry for {}: {}", signal.symbol, e);
                    }
                    self.mark_signal(&signal, "EXECUTED").await;
                    self.notifier
                        .send(&format!(
                            "🚀 *Opened* {:?} {} @ {:.4} (qty {:.6})",
                            position.side, position.symbol, position.entry_price, position.quantity
                        ))
                        .await;
                }
                Err(e) => {
                    tracing::error!("Order failed for {}: {}", signal.symbol, e);
                    self.mark_signal(&signal, "SKIPPED").await;
                }
            }
        }
    }

    async fn mark_signal(&self, signal: &Signal, status: &str) {
        if let Err(e) = self.ledger.mark_signal(signal.id, status).await {
            tracing::warn!("Failed to mark signal {}: {}", signal.id, e);
        }
    }

    // ==================== STALE REVIEW ====================

    async fn stale_review(&self, positions: &[ExchangePosition], force: bool) {
        let open_rows = match self.ledger.open_positions().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Ledger read failed, skipping stale review: {}", e);
                return;
            }
        };

        let now = Utc::now();

        for row in open_rows {
            let hours = risk::hours_held(row.entry_time, now);
            if !force && !risk::held_too_long(hours, &self.cfg.risk) {
                continue;
            }

            let mark = match positions
                .iter()
                .find(|p| p.symbol == row.symbol)
                .and_then(|p| p.mark_price)
            {
                Some(mark) => mark,
                None => match self.oracle.resolve_price(&row.symbol).await {
                    Some(mark) => mark,
                    None => continue,
                },
            };

            // Current pnl, not the watermark: the reviewer judges where the
            // position is now.
            let pnl_pct = risk::favorable_pct(row.side, row.entry_price, mark);
            if risk::winner_exempt(pnl_pct, &self.cfg.risk) {
                continue;
            }

            let candles = match self.exchange.get_recent_candles(&row.symbol, "15m", 20).await {
                Ok(candles) if !candles.is_empty() => candles,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Candle fetch failed for {}: {}", row.symbol, e);
                    continue;
                }
            };

            tracing::info!(
                "🕰️  Stale check for {} (held {:.1}h, pnl {:.2}%), asking reviewer",
                row.symbol,
                hours,
                pnl_pct * 100.0
            );

            match self
                .analyst
                .evaluate_stale(&row.symbol, pnl_pct, hours, &candles)
                .await
            {
                Verdict::Close => {
                    tracing::info!("🛑 Reviewer says CLOSE for stale {}", row.symbol);
                    let quantity = positions
                        .iter()
                        .find(|p| p.symbol == row.symbol)
                        .map(|p| p.abs_qty())
                        .unwrap_or(row.quantity);
                    self.close_tracked(&row, quantity, mark, PositionStatus::ClosedAiStale)
                        .await;
                }
                Verdict::Hold => {
                    tracing::info!("🧘 Reviewer says HOLD for stale {}", row.symbol);
                }
            }
        }
    }

    // ==================== REMOTE COMMANDS ====================

    async fn process_commands(&self, snapshot: &mut RuntimeSnapshot) {
        let commands = match self.ledger.pending_commands().await {
            Ok(commands) => commands,
            Err(e) => {
                tracing::warn!("Command read failed: {}", e);
                return;
            }
        };

        for command in commands {
            tracing::info!("📥 Processing remote command: {:?}", command.kind);
            self.execute_command(&command, snapshot).await;

            if let Err(e) = self.ledger.mark_command_executed(command.id).await {
                tracing::warn!("Failed to mark command {}: {}", command.id, e);
            }
        }
    }

    async fn execute_command(&self, command: &Command, snapshot: &mut RuntimeSnapshot) {
        match command.kind {
            CommandKind::ClosePosition => {
                match command.params.get("symbol").and_then(|v| v.as_str()) {
                    Some(symbol) => self.remote_close(symbol).await,
                    None => tracing::warn!("CLOSE_POSITION command without symbol, ignoring"),
                }
            }
            CommandKind::CloseAll => {
                if let Err(e) = self.ledger.set_config("is_paused", "true").await {
                    tracing::warn!("Failed to persist pause flag: {}", e);
                }
                snapshot.paused = true;
                self.notifier.send("⏸️ *Paused by panic protocol*").await;

                match self.exchange.get_open_positions().await {
                    Ok(positions) => {
                        let count = positions.len();
                        for position in positions {
                            self.remote_close(&position.symbol).await;
                        }
                        self.notifier
                            .send(&format!("✅ *Panic complete*: closed {} positions", count))
                            .await;
                    }
                    Err(e) => tracing::error!("Panic close failed to list positions: {}", e),
                }
            }
            CommandKind::ForceReview => {
                let positions = self.exchange.get_open_positions().await.unwrap_or_default();
                self.stale_review(&positions, true).await;
            }
        }
    }

    async fn remote_close(&self, symbol: &str) {
        let exchange_pos = match self.exchange.get_position(symbol).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                tracing::info!("Remote close: no open position for {}", symbol);
                self.notifier
                    .send(&format!("⚠️ *Remote close failed*: no position for {}", symbol))
                    .await;
                return;
            }
            Err(e) => {
                tracing::warn!("Remote close failed to fetch {}: {}", symbol, e);
                return;
            }
        };

        let mark = match exchange_pos.mark_price {
            Some(mark) => mark,
            None => match self.oracle.resolve_price(symbol).await {
                Some(mark) => mark,
                None => exchange_pos.average_open_price,
            },
        };

        match self.ledger.open_position_for(symbol).await {
            Ok(Some(row)) => {
                self.close_tracked(&row, exchange_pos.abs_qty(), mark, PositionStatus::ClosedManual)
                    .await;
            }
            _ => {
                // Untracked position: close on the exchange only; the ledger
                // has nothing to terminate.
                match self
                    .executor
                    .close_position(symbol, exchange_pos.abs_qty(), exchange_pos.side(), mark)
                    .await
                {
                    Ok(exit_price) => {
                        self.notifier
                            .send(&format!("✅ *Remote close executed*: {} @ {:.4}", symbol, exit_price))
                            .await;
                    }
                    Err(e) => tracing::error!("Remote close failed for {}: {}", symbol, e),
                }
            }
        }
    }
}
