//! End-to-end tests for the position lifecycle: scientific open with both
//! protective triggers, the staged partial take-profit cascade, and the
//! emergency close path through the close queue.

mod common;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use helmsman::application::notifier::{LogSink, Notifier};
use helmsman::application::reversal_monitor::ReversalMonitor;
use helmsman::application::risk_manager::{CloseReason, CloseRequest, RiskManager};
use helmsman::domain::entities::candle::Candle;
use helmsman::domain::entities::position::PositionSide;
use helmsman::domain::services::stop_policy::StopPolicy;
use helmsman::infrastructure::cache::MarketCache;

use common::{flat_candles, memory_store, MockExchange};

fn downtrend_candles(start: f64, n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let base = start - i as f64 * start * 0.01;
            Candle {
                timestamp: Utc::now() - chrono::Duration::minutes((n - i) as i64 * 5),
                open: base,
                high: base * 1.002,
                low: base * 0.985,
                close: base * 0.99,
                volume: 1000.0 + i as f64 * 50.0,
            }
        })
        .collect()
}

async fn build_manager(
    exchange: Arc<MockExchange>,
) -> (
    Arc<RiskManager>,
    tokio::sync::mpsc::Receiver<CloseRequest>,
    Arc<helmsman::persistence::repository::Store>,
) {
    let store = memory_store().await;
    let cache = Arc::new(MarketCache::new());
    let notifier = Notifier::with_default_cooldown(Arc::new(LogSink));
    let (risk, close_rx) = RiskManager::new(
        exchange,
        Arc::clone(&store),
        cache,
        notifier,
        StopPolicy::default(),
        vec!["BTC".to_string(), "ETH".to_string()],
    );
    (risk, close_rx, store)
}

#[tokio::test]
async fn scientific_open_commits_position_triggers_and_trade() {
    let exchange = MockExchange::new();
    exchange.set_mark("BTC", 50000.0);
    exchange.set_candles("BTC", flat_candles(50000.0, 60));

    let (risk, _close_rx, store) = build_manager(Arc::clone(&exchange)).await;

    let order_id = risk
        .open_position("BTC", PositionSide::Long, 300.0, 3.0)
        .await
        .unwrap();

    // one market order at the venue, quantity floor(900 / (0.0001 * 50000))
    {
        let state = exchange.state.lock().unwrap();
        assert_eq!(state.placed_orders.len(), 1);
        assert!((state.placed_orders[0].size - 180.0).abs() < 1e-9);
        assert_eq!(state.placed_triggers.len(), 2);
    }

    // position row with stop on the loss side and extreme TP at 5R
    let record = store
        .positions
        .get("BTC", PositionSide::Long)
        .await
        .unwrap()
        .expect("position row");
    assert!((record.quantity - 180.0).abs() < 1e-9);
    let stop = record.stop_loss.unwrap();
    let take_profit = record.take_profit.unwrap();
    // flat candles clamp the distance to 0.5% of entry = 250
    assert!((stop - 49750.0).abs() < 1.0);
    assert!((take_profit - 51250.0).abs() < 1.0);

    // one open trade, two active trigger mirrors, all linked to the order
    let trades = store.trades.recent(10, None).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].trade_type, "open");
    assert_eq!(trades[0].order_id, order_id);

    let triggers = store.triggers.all_active().await.unwrap();
    assert_eq!(triggers.len(), 2);
    assert!(triggers.iter().all(|t| t.position_order_id == order_id));
    assert!(triggers.iter().any(|t| t.order_type == "stop_loss"));
    assert!(triggers
        .iter()
        .any(|t| t.order_type == "extreme_take_profit"));
}

#[tokio::test]
async fn duplicate_open_for_same_pair_is_refused() {
    let exchange = MockExchange::new();
    exchange.set_mark("BTC", 50000.0);
    exchange.set_candles("BTC", flat_candles(50000.0, 60));

    let (risk, _close_rx, _store) = build_manager(Arc::clone(&exchange)).await;

    risk.open_position("BTC", PositionSide::Long, 300.0, 3.0)
        .await
        .unwrap();
    let second = risk.open_position("BTC", PositionSide::Long, 300.0, 3.0).await;
    assert!(second.is_err());
    // the refused open never reached the venue
    assert_eq!(exchange.state.lock().unwrap().placed_orders.len(), 1);
}

#[tokio::test]
async fn partial_take_profit_cascade_advances_fraction_then_closes() {
    let exchange = MockExchange::new();
    exchange.set_mark("BTC", 100.0);
    exchange.set_candles("BTC", flat_candles(100.0, 60));

    let (risk, _close_rx, store) = build_manager(Arc::clone(&exchange)).await;
    risk.open_position("BTC", PositionSide::Long, 300.0, 3.0)
        .await
        .unwrap();
    // entry 100, distance clamps to 0.5 => tiers at 101 / 101.5 / 102
    exchange.set_mark("BTC", 102.6);

    // first tier: 33% off, stop to breakeven
    assert!(risk.execute_partial("BTC", PositionSide::Long).await.unwrap());
    let record = store
        .positions
        .get("BTC", PositionSide::Long)
        .await
        .unwrap()
        .unwrap();
    assert!((record.partial_close_fraction - 0.33).abs() < 1e-9);
    assert!((record.stop_loss.unwrap() - 100.0).abs() < 0.01);

    // second tier: cumulative 66%, stop locks one R
    assert!(risk.execute_partial("BTC", PositionSide::Long).await.unwrap());
    let record = store
        .positions
        .get("BTC", PositionSide::Long)
        .await
        .unwrap()
        .unwrap();
    assert!((record.partial_close_fraction - 0.66).abs() < 1e-9);
    assert!(record.stop_loss.unwrap() > 100.0);

    // final tier: full close, position gone
    assert!(risk.execute_partial("BTC", PositionSide::Long).await.unwrap());
    assert!(store
        .positions
        .get("BTC", PositionSide::Long)
        .await
        .unwrap()
        .is_none());
    assert_eq!(store.triggers.count_active().await.unwrap(), 0);

    // two partial events plus one final take-profit event
    let events = store.close_events.recent(10).await.unwrap();
    let partials = events
        .iter()
        .filter(|e| e.close_reason == "partial_close")
        .count();
    let finals = events
        .iter()
        .filter(|e| e.close_reason == "take_profit_triggered")
        .count();
    assert_eq!(partials, 2);
    assert_eq!(finals, 1);

    // nothing further to execute
    assert!(!risk.execute_partial("BTC", PositionSide::Long).await.unwrap());
}

#[tokio::test]
async fn emergency_close_via_queue_cancels_siblings() {
    let exchange = MockExchange::new();
    exchange.set_mark("ETH", 2000.0);
    exchange.set_candles("ETH", flat_candles(2000.0, 60));

    let (risk, close_rx, store) = build_manager(Arc::clone(&exchange)).await;
    risk.open_position("ETH", PositionSide::Long, 200.0, 2.0)
        .await
        .unwrap();

    let worker = tokio::spawn(Arc::clone(&risk).run_close_worker(close_rx));

    risk.close_sender()
        .send(CloseRequest {
            symbol: "ETH".to_string(),
            side: PositionSide::Long,
            reason: CloseReason::TrendReversal,
        })
        .await
        .unwrap();

    // let the worker drain the queue
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(store
        .positions
        .get("ETH", PositionSide::Long)
        .await
        .unwrap()
        .is_none());
    assert_eq!(store.triggers.count_active().await.unwrap(), 0);
    let events = store.close_events.recent(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].close_reason, "trend_reversal");
    assert!(exchange.state.lock().unwrap().cancel_trigger_calls >= 1);

    worker.abort();
}

#[tokio::test]
async fn reversal_monitor_flags_and_requests_emergency_close() {
    let exchange = MockExchange::new();
    exchange.set_mark("BTC", 50000.0);
    exchange.set_candles("BTC", flat_candles(50000.0, 60));

    let (risk, mut close_rx, store) = build_manager(Arc::clone(&exchange)).await;
    risk.open_position("BTC", PositionSide::Long, 300.0, 3.0)
        .await
        .unwrap();

    // the market rolls over hard against the long
    exchange.set_candles("BTC", downtrend_candles(50000.0, 50));
    exchange.set_mark("BTC", 42000.0);

    let notifier = Notifier::with_default_cooldown(Arc::new(LogSink));
    let monitor = ReversalMonitor::new(
        Arc::clone(&exchange) as Arc<dyn helmsman::domain::repositories::exchange_client::ExchangeClient>,
        Arc::clone(&store),
        notifier,
        risk.close_sender(),
        Duration::from_secs(180),
    );
    monitor.scan_once().await.unwrap();

    // warning metadata written for the scheduler's next context
    let record = store
        .positions
        .get("BTC", PositionSide::Long)
        .await
        .unwrap()
        .unwrap();
    assert!(record.warning_score > 0.0);
    assert!(record.reversal_warning);

    // an emergency close request landed on the queue
    let request = close_rx.try_recv().expect("close request queued");
    assert_eq!(request.symbol, "BTC");
    assert_eq!(request.side, PositionSide::Long);
    assert_eq!(request.reason, CloseReason::TrendReversal);
}

#[tokio::test]
async fn trailing_stop_never_moves_backwards() {
    let exchange = MockExchange::new();
    exchange.set_mark("BTC", 100.0);
    exchange.set_candles("BTC", flat_candles(100.0, 60));

    let (risk, _close_rx, store) = build_manager(Arc::clone(&exchange)).await;
    risk.open_position("BTC", PositionSide::Long, 300.0, 3.0)
        .await
        .unwrap();

    // below the first trailing tier: no move
    exchange.set_mark("BTC", 100.2);
    assert!(!risk.update_trailing("BTC", PositionSide::Long).await.unwrap());

    // past 1R: stop moves to breakeven
    exchange.set_mark("BTC", 100.6);
    assert!(risk.update_trailing("BTC", PositionSide::Long).await.unwrap());
    let stop_after_first = store
        .positions
        .get("BTC", PositionSide::Long)
        .await
        .unwrap()
        .unwrap()
        .stop_loss
        .unwrap();
    assert!((stop_after_first - 100.0).abs() < 0.01);

    // price retreats: the same tier would propose the same stop, no move
    exchange.set_mark("BTC", 100.55);
    assert!(!risk.update_trailing("BTC", PositionSide::Long).await.unwrap());
    let stop_unchanged = store
        .positions
        .get("BTC", PositionSide::Long)
        .await
        .unwrap()
        .unwrap()
        .stop_loss
        .unwrap();
    assert!((stop_unchanged - stop_after_first).abs() < 1e-9);
}
