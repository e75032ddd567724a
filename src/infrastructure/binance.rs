//! Binance USDT-margined futures adapter (linear venue).
//!
//! Normalizes `BTC <-> BTCUSDT`, signs requests with HMAC-SHA256 over the
//! query string, and reports 429/418 to the request coordinator. Sizes are
//! coin units; PnL is plain price-delta times quantity.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::domain::entities::account::AccountSummary;
use crate::domain::entities::candle::{Candle, Interval};
use crate::domain::entities::contract::{ContractSpec, ContractType};
use crate::domain::entities::position::PositionSide;
use crate::domain::errors::ExchangeError;
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangePosition, ExchangeResult, FeeSchedule, Fill, OrderAck, OrderRequest,
    Ticker, TriggerRequest, TriggerRule,
};
use crate::infrastructure::coordinator::RequestCoordinator;

const BINANCE_API_BASE: &str = "https://fapi.binance.com";
const BINANCE_TESTNET_BASE: &str = "https://testnet.binancefuture.com";

const PRICE_DEVIATION_LIMIT: f64 = 0.015;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub api_base: String,
    pub fee: FeeSchedule,
}

impl BinanceConfig {
    pub fn new(testnet: bool) -> Self {
        BinanceConfig {
            api_base: if testnet {
                BINANCE_TESTNET_BASE.to_string()
            } else {
                BINANCE_API_BASE.to_string()
            },
            fee: FeeSchedule {
                taker_rate: 0.0005,
                maker_rate: 0.0002,
            },
        }
    }
}

fn parse_num(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PriceTicker {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    mark_price: String,
    index_price: String,
    last_funding_rate: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesAccount {
    total_wallet_balance: String,
    available_balance: String,
    total_position_initial_margin: String,
    total_unrealized_profit: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
    leverage: String,
    liquidation_price: String,
    un_realized_profit: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserTrade {
    order_id: i64,
    symbol: String,
    side: String,
    price: String,
    qty: String,
    commission: String,
    time: i64,
}

#[derive(Debug, Deserialize)]
struct BinanceErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

pub struct BinanceClient {
    http: Client,
    config: BinanceConfig,
    api_key: Zeroizing<String>,
    api_secret: Zeroizing<String>,
    coordinator: Arc<RequestCoordinator>,
    contracts: DashMap<String, ContractSpec>,
    symbols: Vec<String>,
}

impl BinanceClient {
    pub fn new(
        api_key: &str,
        api_secret: &str,
        config: BinanceConfig,
        coordinator: Arc<RequestCoordinator>,
        symbols: Vec<String>,
    ) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ExchangeError::Network(e.to_string()))?;
        Ok(BinanceClient {
            http,
            config,
            api_key: Zeroizing::new(api_key.to_string()),
            api_secret: Zeroizing::new(api_secret.to_string()),
            coordinator,
            contracts: DashMap::new(),
            symbols,
        })
    }

    pub fn to_venue_symbol(symbol: &str) -> String {
        format!("{}USDT", symbol)
    }

    pub fn from_venue_symbol(venue: &str) -> String {
        venue.trim_end_matches("USDT").to_string()
    }

    fn interval_str(interval: Interval) -> &'static str {
        // Binance uses the same tokens the capability interface does
        interval.as_str()
    }

    fn sign_query(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        format!("{}&signature={}", query, hex::encode(mac.finalize().into_bytes()))
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &str,
        signed: bool,
    ) -> ExchangeResult<T> {
        self.coordinator.admit(path).await?;

        let final_query = if signed {
            let with_ts = if query.is_empty() {
                format!("timestamp={}", Utc::now().timestamp_millis())
            } else {
                format!("{}&timestamp={}", query, Utc::now().timestamp_millis())
            };
            self.sign_query(&with_ts)
        } else {
            query.to_string()
        };
        let url = if final_query.is_empty() {
            format!("{}{}", self.config.api_base, path)
        } else {
            format!("{}{}?{}", self.config.api_base, path, final_query)
        };

        let response = match self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", self.api_key.as_str())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.coordinator.record_failure().await;
                return Err(ExchangeError::Network(e.to_string()));
            }
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        if status.is_success() {
            self.coordinator.record_success().await;
            return serde_json::from_str(&text)
                .map_err(|e| ExchangeError::Decode(format!("{} ({})", e, path)));
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                self.coordinator.handle_429().await;
                Err(ExchangeError::RateLimited)
            }
            StatusCode::IM_A_TEAPOT => {
                let ban = retry_after.map(Duration::from_secs);
                self.coordinator.handle_418(ban).await;
                Err(ExchangeError::IpBanned {
                    duration: ban.unwrap_or(Duration::from_secs(300)),
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ExchangeError::PermissionDenied(text))
            }
            StatusCode::NOT_FOUND => Err(ExchangeError::Venue {
                status: 404,
                message: text,
            }),
            _ => {
                if status.is_server_error() {
                    self.coordinator.record_failure().await;
                }
                let parsed: BinanceErrorBody =
                    serde_json::from_str(&text).unwrap_or(BinanceErrorBody {
                        code: 0,
                        msg: text.clone(),
                    });
                // -2019: margin insufficient, -4164: notional too small
                if parsed.code == -2019 {
                    return Err(ExchangeError::InsufficientFunds(parsed.msg));
                }
                Err(ExchangeError::Venue {
                    status: status.as_u16(),
                    message: format!("{} {}", parsed.code, parsed.msg),
                })
            }
        }
    }

    fn filter_value(filters: &[serde_json::Value], filter_type: &str, key: &str) -> Option<f64> {
        filters
            .iter()
            .find(|f| f.get("filterType").and_then(|v| v.as_str()) == Some(filter_type))
            .and_then(|f| f.get(key))
            .and_then(|v| v.as_str())
            .map(parse_num)
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn name(&self) -> &str {
        "binance"
    }

    fn contract_type(&self) -> ContractType {
        ContractType::Linear
    }

    fn fee_schedule(&self) -> FeeSchedule {
        self.config.fee
    }

    async fn contract_spec(&self, symbol: &str) -> ExchangeResult<ContractSpec> {
        if let Some(spec) = self.contracts.get(symbol) {
            return Ok(spec.clone());
        }
        let venue = Self::to_venue_symbol(symbol);
        let info: ExchangeInfo = self
            .request(
                Method::GET,
                "/fapi/v1/exchangeInfo",
                &format!("symbol={}", venue),
                false,
            )
            .await?;
        let symbol_info = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == venue)
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))?;

        let spec = ContractSpec {
            symbol: symbol.to_string(),
            venue_symbol: symbol_info.symbol,
            contract_type: ContractType::Linear,
            quanto_multiplier: 1.0,
            order_size_min: Self::filter_value(&symbol_info.filters, "LOT_SIZE", "minQty")
                .unwrap_or(0.001),
            order_size_max: Self::filter_value(&symbol_info.filters, "LOT_SIZE", "maxQty")
                .unwrap_or(10_000.0),
            order_price_round: Self::filter_value(&symbol_info.filters, "PRICE_FILTER", "tickSize")
                .unwrap_or(0.01),
            mark_price_round: Self::filter_value(&symbol_info.filters, "PRICE_FILTER", "tickSize")
                .unwrap_or(0.01),
        };
        self.contracts.insert(symbol.to_string(), spec.clone());
        Ok(spec)
    }

    async fn get_ticker(&self, symbol: &str, include_mark: bool) -> ExchangeResult<Ticker> {
        let venue = Self::to_venue_symbol(symbol);
        let price: PriceTicker = self
            .request(
                Method::GET,
                "/fapi/v1/ticker/price",
                &format!("symbol={}", venue),
                false,
            )
            .await?;
        let mut ticker = Ticker {
            last: parse_num(&price.price),
            mark_price: None,
            index_price: None,
        };
        if include_mark {
            let premium: PremiumIndex = self
                .request(
                    Method::GET,
                    "/fapi/v1/premiumIndex",
                    &format!("symbol={}", venue),
                    false,
                )
                .await?;
            ticker.mark_price = Some(parse_num(&premium.mark_price));
            ticker.index_price = Some(parse_num(&premium.index_price));
        }
        Ok(ticker)
    }

    async fn get_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let venue = Self::to_venue_symbol(symbol);
        let query = format!(
            "symbol={}&interval={}&limit={}",
            venue,
            Self::interval_str(interval),
            limit.min(1000)
        );
        // klines come back as positional arrays
        let raw: Vec<Vec<serde_json::Value>> = self
            .request(Method::GET, "/fapi/v1/klines", &query, false)
            .await?;
        let mut candles = Vec::with_capacity(raw.len());
        for row in raw {
            if row.len() < 6 {
                continue;
            }
            let ts = row[0].as_i64().unwrap_or(0);
            let as_num = |v: &serde_json::Value| v.as_str().map(parse_num).unwrap_or(0.0);
            candles.push(Candle {
                timestamp: Utc
                    .timestamp_millis_opt(ts)
                    .single()
                    .unwrap_or_else(Utc::now),
                open: as_num(&row[1]),
                high: as_num(&row[2]),
                low: as_num(&row[3]),
                close: as_num(&row[4]),
                volume: as_num(&row[5]),
            });
        }
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn get_account(&self) -> ExchangeResult<AccountSummary> {
        let raw: FuturesAccount = self
            .request(Method::GET, "/fapi/v2/account", "", true)
            .await?;
        Ok(AccountSummary {
            total: parse_num(&raw.total_wallet_balance),
            available: parse_num(&raw.available_balance),
            position_margin: parse_num(&raw.total_position_initial_margin),
            unrealized_pnl: parse_num(&raw.total_unrealized_profit),
        })
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        let raw: Vec<PositionRisk> = self
            .request(Method::GET, "/fapi/v2/positionRisk", "", true)
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|p| {
                let amount = parse_num(&p.position_amt);
                if amount == 0.0 {
                    return None;
                }
                let symbol = Self::from_venue_symbol(&p.symbol);
                if !self.symbols.contains(&symbol) {
                    return None;
                }
                Some(ExchangePosition {
                    symbol,
                    side: if amount > 0.0 {
                        PositionSide::Long
                    } else {
                        PositionSide::Short
                    },
                    size: amount.abs(),
                    entry_price: parse_num(&p.entry_price),
                    leverage: parse_num(&p.leverage).max(1.0),
                    liquidation_price: Some(parse_num(&p.liquidation_price)),
                    unrealized_pnl: parse_num(&p.un_realized_profit),
                })
            })
            .collect())
    }

    async fn get_funding_rate(&self, symbol: &str) -> ExchangeResult<f64> {
        let venue = Self::to_venue_symbol(symbol);
        let premium: PremiumIndex = self
            .request(
                Method::GET,
                "/fapi/v1/premiumIndex",
                &format!("symbol={}", venue),
                false,
            )
            .await?;
        Ok(parse_num(&premium.last_funding_rate))
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        let spec = self.contract_spec(&request.symbol).await?;
        let size = spec.clamp_size(request.size);
        if size == 0.0 {
            return Err(ExchangeError::InvalidOrder("zero size".to_string()));
        }
        let side = if size > 0.0 { "BUY" } else { "SELL" };
        let venue = Self::to_venue_symbol(&request.symbol);

        let mut query = format!(
            "symbol={}&side={}&quantity={}",
            venue,
            side,
            size.abs()
        );
        match request.price {
            None => query.push_str("&type=MARKET"),
            Some(price) => {
                let mark = self.get_ticker(&request.symbol, true).await?.mark_or_last();
                let clamped = price.clamp(
                    mark * (1.0 - PRICE_DEVIATION_LIMIT),
                    mark * (1.0 + PRICE_DEVIATION_LIMIT),
                );
                if (clamped - price).abs() > f64::EPSILON {
                    warn!("limit price {} clamped to {} around mark {}", price, clamped, mark);
                }
                query.push_str(&format!(
                    "&type=LIMIT&timeInForce=IOC&price={}",
                    spec.round_price(clamped)
                ));
            }
        }
        if request.reduce_only {
            query.push_str("&reduceOnly=true");
        }

        let raw: OrderResponse = self
            .request(Method::POST, "/fapi/v1/order", &query, true)
            .await?;
        debug!("binance order {} placed for {}", raw.order_id, request.symbol);
        Ok(OrderAck {
            id: raw.order_id.to_string(),
            status: raw.status,
        })
    }

    async fn place_trigger_order(&self, request: &TriggerRequest) -> ExchangeResult<String> {
        let spec = self.contract_spec(&request.symbol).await?;
        let venue = Self::to_venue_symbol(&request.symbol);
        // the close order runs opposite the protected position; whether the
        // venue treats it as stop or take-profit depends on which side of
        // mark the rule fires on
        let (side, order_type) = match (request.position_side, request.rule) {
            (PositionSide::Long, TriggerRule::LessOrEqual) => ("SELL", "STOP_MARKET"),
            (PositionSide::Long, TriggerRule::GreaterOrEqual) => ("SELL", "TAKE_PROFIT_MARKET"),
            (PositionSide::Short, TriggerRule::GreaterOrEqual) => ("BUY", "STOP_MARKET"),
            (PositionSide::Short, TriggerRule::LessOrEqual) => ("BUY", "TAKE_PROFIT_MARKET"),
        };
        let query = format!(
            "symbol={}&side={}&type={}&stopPrice={}&quantity={}&reduceOnly=true&workingType=MARK_PRICE",
            venue,
            side,
            order_type,
            spec.round_price(request.trigger_price),
            request.close_size.abs()
        );
        let raw: OrderResponse = self
            .request(Method::POST, "/fapi/v1/order", &query, true)
            .await?;
        Ok(raw.order_id.to_string())
    }

    async fn cancel_trigger_orders(&self, symbol: Option<&str>) -> ExchangeResult<()> {
        let Some(symbol) = symbol else {
            for symbol in self.symbols.clone() {
                self.cancel_trigger_orders(Some(&symbol)).await?;
            }
            return Ok(());
        };
        let venue = Self::to_venue_symbol(symbol);
        match self
            .request::<serde_json::Value>(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                &format!("symbol={}", venue),
                true,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(ExchangeError::Venue { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_my_trades(
        &self,
        symbol: Option<&str>,
        limit: usize,
        start_time: Option<DateTime<Utc>>,
    ) -> ExchangeResult<Vec<Fill>> {
        let mut all = Vec::new();
        let symbols: Vec<String> = match symbol {
            Some(symbol) => vec![symbol.to_string()],
            None => self.symbols.clone(),
        };
        for symbol in symbols {
            let venue = Self::to_venue_symbol(&symbol);
            let mut query = format!("symbol={}&limit={}", venue, limit.min(1000));
            if let Some(start) = start_time {
                query.push_str(&format!("&startTime={}", start.timestamp_millis()));
            }
            let raw: Vec<UserTrade> = self
                .request(Method::GET, "/fapi/v1/userTrades", &query, true)
                .await?;
            all.extend(raw.into_iter().map(|t| Fill {
                order_id: t.order_id.to_string(),
                symbol: Self::from_venue_symbol(&t.symbol),
                side: if t.side == "BUY" {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                price: parse_num(&t.price),
                quantity: parse_num(&t.qty),
                fee: parse_num(&t.commission),
                timestamp: Utc
                    .timestamp_millis_opt(t.time)
                    .single()
                    .unwrap_or_else(Utc::now),
            }));
        }
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all.truncate(limit);
        Ok(all)
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> ExchangeResult<()> {
        let venue = Self::to_venue_symbol(symbol);
        self.request::<serde_json::Value>(
            Method::POST,
            "/fapi/v1/leverage",
            &format!("symbol={}&leverage={}", venue, leverage as i64),
            true,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_normalization_round_trip() {
        assert_eq!(BinanceClient::to_venue_symbol("BTC"), "BTCUSDT");
        assert_eq!(BinanceClient::from_venue_symbol("BTCUSDT"), "BTC");
    }

    #[test]
    fn test_filter_value_extraction() {
        let filters = vec![
            serde_json::json!({"filterType": "LOT_SIZE", "minQty": "0.001", "maxQty": "500"}),
            serde_json::json!({"filterType": "PRICE_FILTER", "tickSize": "0.10"}),
        ];
        assert_eq!(
            BinanceClient::filter_value(&filters, "LOT_SIZE", "minQty"),
            Some(0.001)
        );
        assert_eq!(
            BinanceClient::filter_value(&filters, "PRICE_FILTER", "tickSize"),
            Some(0.1)
        );
        assert_eq!(BinanceClient::filter_value(&filters, "MISSING", "x"), None);
    }

    #[test]
    fn test_interval_tokens_match_venue() {
        assert_eq!(BinanceClient::interval_str(Interval::M5), "5m");
        assert_eq!(BinanceClient::interval_str(Interval::H1), "1h");
        assert_eq!(BinanceClient::interval_str(Interval::D1), "1d");
    }
}
