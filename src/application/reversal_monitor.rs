//! Reversal Monitor
//!
//! Higher-frequency loop (default every 3 minutes) scanning open positions
//! for early-warning and reversal signals. It writes `warning_score` and
//! `reversal_warning` into position metadata for the scheduler's next
//! context, and at reversal score >= 70 posts an emergency close to the
//! close queue. It never opens positions.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::application::notifier::{AlertLevel, Notifier};
use crate::application::risk_manager::{CloseReason, CloseRequest};
use crate::domain::entities::candle::Interval;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::application::supervisor::{supervise, LoopPolicy};
use crate::domain::services::reversal::ReversalScorer;
use crate::persistence::repository::Store;

pub struct ReversalMonitor {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    scorer: ReversalScorer,
    close_tx: mpsc::Sender<CloseRequest>,
    interval: Duration,
}

impl ReversalMonitor {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<Store>,
        notifier: Arc<Notifier>,
        close_tx: mpsc::Sender<CloseRequest>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(ReversalMonitor {
            exchange,
            store,
            notifier,
            scorer: ReversalScorer::standard(),
            close_tx,
            interval,
        })
    }

    /// One scan over all open positions.
    pub async fn scan_once(&self) -> Result<(), String> {
        let records = self
            .store
            .positions
            .all()
            .await
            .map_err(|e| e.to_string())?;
        for record in records {
            let position = match record.to_domain() {
                Ok(position) => position,
                Err(e) => {
                    error!("skipping corrupt position row: {}", e);
                    continue;
                }
            };

            let fast = match self
                .exchange
                .get_candles(&position.symbol, Interval::M5, 60)
                .await
            {
                Ok(candles) => candles,
                Err(e) => {
                    warn!("no 5m candles for {}: {}", position.symbol, e);
                    continue;
                }
            };
            let slow = self
                .exchange
                .get_candles(&position.symbol, Interval::M15, 60)
                .await
                .unwrap_or_default();

            let assessment = self.scorer.assess(&fast, &slow, position.side);
            self.store
                .positions
                .update_warning(
                    &position.symbol,
                    position.side,
                    assessment.warning_score,
                    assessment.warning,
                )
                .await
                .map_err(|e| e.to_string())?;

            if assessment.emergency {
                info!(
                    "reversal score {:.0} on {} {}, requesting emergency close",
                    assessment.reversal_score, position.symbol, position.side
                );
                self.notifier
                    .notify(
                        AlertLevel::Warning,
                        &format!("trend reversal: {} {}", position.symbol, position.side),
                        &format!(
                            "reversal score {:.0}, warning score {:.0}",
                            assessment.reversal_score, assessment.warning_score
                        ),
                    )
                    .await;
                if let Err(e) = self
                    .close_tx
                    .send(CloseRequest {
                        symbol: position.symbol.clone(),
                        side: position.side,
                        reason: CloseReason::TrendReversal,
                    })
                    .await
                {
                    error!("close queue unavailable: {}", e);
                }
            }
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        let policy = LoopPolicy::every(self.interval);
        let notifier = Arc::clone(&self.notifier);
        let monitor = Arc::clone(&self);
        supervise("reversal_monitor", policy, notifier, move || {
            let monitor = Arc::clone(&monitor);
            async move { monitor.scan_once().await }
        })
        .await;
    }
}
