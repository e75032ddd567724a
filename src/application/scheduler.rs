//! Decision Loop Scheduler
//!
//! Single-writer periodic task driving the agent. Each tick snapshots the
//! account and positions (cache-tolerant), refreshes candles, runs the risk
//! engine's lifecycle pass, appends an account-history row, assembles the
//! decision context, invokes the decision collaborator, executes its tool
//! calls through the validating dispatcher, and persists the decision.
//! Overlapping ticks are dropped with a warning.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::application::agent::context::{
    DecisionContext, IntervalStats, PositionBrief, SymbolSnapshot,
};
use crate::application::agent::tools::ToolDispatcher;
use crate::application::agent::DecisionProvider;
use crate::application::notifier::{AlertLevel, Notifier};
use crate::application::risk_manager::RiskManager;
use crate::application::supervisor::{supervise, LoopPolicy};
use crate::domain::entities::account::AccountSummary;
use crate::domain::entities::candle::Interval;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::infrastructure::cache::MarketCache;
use crate::persistence::repository::Store;

/// Candle series refreshed for the context each tick.
const CONTEXT_INTERVALS: [Interval; 3] = [Interval::M5, Interval::M15, Interval::H1];
const CONTEXT_CANDLE_LIMIT: usize = 100;

pub struct Scheduler {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<Store>,
    cache: Arc<MarketCache>,
    risk: Arc<RiskManager>,
    provider: Arc<dyn DecisionProvider>,
    dispatcher: ToolDispatcher,
    notifier: Arc<Notifier>,
    symbols: Vec<String>,
    interval: Duration,
    iteration: AtomicU64,
    in_flight: Mutex<()>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<Store>,
        cache: Arc<MarketCache>,
        risk: Arc<RiskManager>,
        provider: Arc<dyn DecisionProvider>,
        dispatcher: ToolDispatcher,
        notifier: Arc<Notifier>,
        symbols: Vec<String>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Scheduler {
            exchange,
            store,
            cache,
            risk,
            provider,
            dispatcher,
            notifier,
            symbols,
            interval,
            iteration: AtomicU64::new(0),
            in_flight: Mutex::new(()),
        })
    }

    /// One decision-loop tick. Returns Err only for failures worth the task
    /// guard's attention; a blocked coordinator degrades to cached data.
    pub async fn tick(&self) -> Result<(), String> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("decision tick still in flight, dropping this one");
            return Ok(());
        };
        let iteration = self.iteration.fetch_add(1, Ordering::SeqCst) + 1;
        let started = std::time::Instant::now();

        // 1. account snapshot, cache-tolerant
        let account = match self.exchange.get_account().await {
            Ok(account) => account,
            Err(e) => {
                warn!("tick {}: no account data ({}), holding", iteration, e);
                return Ok(());
            }
        };

        // 2. lifecycle pass before the agent sees the book
        if let Err(e) = self.risk.manage_tick().await {
            error!("tick {}: lifecycle pass failed: {}", iteration, e);
        }

        // 3. position briefs with warning flags
        let now = Utc::now();
        let mut positions = Vec::new();
        match self.store.positions.all().await {
            Ok(records) => {
                for record in records {
                    let Ok(position) = record.to_domain() else {
                        continue;
                    };
                    let mark = self
                        .exchange
                        .get_ticker(&position.symbol, true)
                        .await
                        .map(|t| t.mark_or_last())
                        .unwrap_or(position.entry_price);
                    positions.push(PositionBrief::from_position(&position, mark, now));
                }
            }
            Err(e) => error!("tick {}: cannot read positions: {}", iteration, e),
        }

        // 4. market snapshots
        let market = self.market_snapshots().await;

        // 5. account history row
        self.append_history(&account).await;

        // 6. decide and dispatch
        let context = DecisionContext {
            timestamp: now,
            iteration,
            account: account.clone(),
            positions,
            market,
            degraded_data: self.cache.recently_degraded(Duration::from_secs(120)),
        };
        let positions_count = context.positions.len() as i64;

        let decision = match self.provider.decide(&context).await {
            Ok(decision) => decision,
            Err(e) => {
                error!("tick {}: decision provider failed: {}", iteration, e);
                self.notifier
                    .notify(AlertLevel::Warning, "decision provider failed", &e.to_string())
                    .await;
                return Err(e.to_string());
            }
        };
        info!(
            "tick {}: provider returned {} tool calls",
            iteration,
            decision.tool_calls.len()
        );
        let outcomes = self.dispatcher.dispatch(&decision.tool_calls).await;

        // 7. persist the decision
        let actions = serde_json::to_string(&outcomes).unwrap_or_else(|_| "[]".to_string());
        if let Err(e) = self
            .store
            .decisions
            .append(
                iteration as i64,
                &decision.rationale,
                &actions,
                account.equity(),
                positions_count,
            )
            .await
        {
            error!("tick {}: cannot persist decision: {}", iteration, e);
        }

        info!(
            "tick {} completed in {:?} ({} actions)",
            iteration,
            started.elapsed(),
            outcomes.len()
        );
        Ok(())
    }

    async fn market_snapshots(&self) -> Vec<SymbolSnapshot> {
        let mut snapshots = Vec::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            let ticker = match self.exchange.get_ticker(symbol, true).await {
                Ok(ticker) => ticker,
                Err(e) => {
                    warn!("no ticker for {}: {}", symbol, e);
                    continue;
                }
            };
            let funding_rate = self.exchange.get_funding_rate(symbol).await.ok();

            let mut intervals = Vec::new();
            for interval in CONTEXT_INTERVALS {
                match self
                    .exchange
                    .get_candles(symbol, interval, CONTEXT_CANDLE_LIMIT)
                    .await
                {
                    Ok(candles) => {
                        if let Some(stats) = IntervalStats::from_candles(interval, &candles) {
                            intervals.push(stats);
                        }
                    }
                    Err(e) => warn!("no {} candles for {}: {}", interval, symbol, e),
                }
            }

            snapshots.push(SymbolSnapshot {
                symbol: symbol.clone(),
                last_price: ticker.last,
                mark_price: ticker.mark_price,
                funding_rate,
                intervals,
            });
        }
        snapshots
    }

    async fn append_history(&self, account: &AccountSummary) {
        let initial = match self.store.history.initial_balance().await {
            Ok(initial) => initial,
            Err(e) => {
                error!("cannot read initial balance: {}", e);
                None
            }
        };
        let return_percent = match initial {
            Some(initial) if initial > 0.0 => (account.equity() - initial) / initial * 100.0,
            _ => 0.0,
        };
        if let Err(e) = self
            .store
            .history
            .append(account.total, account.unrealized_pnl, return_percent)
            .await
        {
            error!("cannot append account history: {}", e);
        }
    }

    pub async fn run(self: Arc<Self>) {
        let policy = LoopPolicy::every(self.interval);
        let notifier = Arc::clone(&self.notifier);
        let scheduler = Arc::clone(&self);
        supervise("decision", policy, notifier, move || {
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.tick().await }
        })
        .await;
    }
}
