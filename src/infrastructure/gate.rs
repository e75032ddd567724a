//! Gate futures adapter (contract-unit venue).
//!
//! Normalizes `BTC <-> BTC_USDT`, parses the venue's string-encoded
//! numbers, signs requests with HMAC-SHA512, and reports 429/418 to the
//! request coordinator. Sizes are integer contract units scaled by the
//! quanto multiplier, which is what the rest of the system calls the
//! inverse contract type.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha512};
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
    Ticker, TimeInForce, TriggerRequest, TriggerRule,
};
use crate::infrastructure::coordinator::RequestCoordinator;

const GATE_API_BASE: &str = "https://api.gateio.ws";
const GATE_TESTNET_BASE: &str = "https://api-testnet.gateapi.io";
const FUTURES_PREFIX: &str = "/api/v4/futures/usdt";

/// Maximum limit-price deviation from mark before the adapter clamps.
const PRICE_DEVIATION_LIMIT: f64 = 0.015;

type HmacSha512 = Hmac<Sha512>;

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub api_base: String,
    pub fee: FeeSchedule,
}

impl GateConfig {
    pub fn new(testnet: bool) -> Self {
        GateConfig {
            api_base: if testnet {
                GATE_TESTNET_BASE.to_string()
            } else {
                GATE_API_BASE.to_string()
            },
            // testnet quotes a flat taker schedule, mainnet is tiered
            fee: if testnet {
                FeeSchedule {
                    taker_rate: 0.00075,
                    maker_rate: 0.0002,
                }
            } else {
                FeeSchedule {
                    taker_rate: 0.0005,
                    maker_rate: 0.0002,
                }
            },
        }
    }
}

fn parse_num(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

#[derive(Debug, Deserialize)]
struct GateContract {
    name: String,
    quanto_multiplier: String,
    order_size_min: f64,
    order_size_max: f64,
    order_price_round: String,
    mark_price_round: String,
}

#[derive(Debug, Deserialize)]
struct GateTicker {
    last: String,
    #[serde(default)]
    mark_price: Option<String>,
    #[serde(default)]
    index_price: Option<String>,
    #[serde(default)]
    funding_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GateCandle {
    t: i64,
    #[serde(default)]
    v: f64,
    o: String,
    h: String,
    l: String,
    c: String,
}

#[derive(Debug, Deserialize)]
struct GateAccount {
    total: String,
    available: String,
    #[serde(default)]
    position_margin: Option<String>,
    #[serde(default)]
    unrealised_pnl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatePosition {
    contract: String,
    /// Signed contract units; negative is short.
    size: f64,
    entry_price: String,
    leverage: String,
    #[serde(default)]
    liq_price: Option<String>,
    #[serde(default)]
    unrealised_pnl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GateOrderResponse {
    id: i64,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GateTriggerResponse {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct GateFill {
    order_id: String,
    #[serde(rename = "contract")]
    contract: String,
    /// Signed contract units.
    size: f64,
    price: String,
    #[serde(default)]
    fee: Option<String>,
    create_time: f64,
}

#[derive(Debug, Deserialize)]
struct GateErrorBody {
    #[serde(default)]
    label: String,
    #[serde(default)]
    message: String,
}

pub struct GateClient {
    http: Client,
    config: GateConfig,
    api_key: Zeroizing<String>,
    api_secret: Zeroizing<String>,
    coordinator: Arc<RequestCoordinator>,
    contracts: DashMap<String, ContractSpec>,
    symbols: Vec<String>,
}

impl GateClient {
    pub fn new(
        api_key: &str,
        api_secret: &str,
        config: GateConfig,
        coordinator: Arc<RequestCoordinator>,
        symbols: Vec<String>,
    ) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ExchangeError::Network(e.to_string()))?;
        Ok(GateClient {
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
        format!("{}_USDT", symbol)
    }

    pub fn from_venue_symbol(contract: &str) -> String {
        contract.trim_end_matches("_USDT").to_string()
    }

    fn sign(&self, method: &str, path: &str, query: &str, body: &str, timestamp: &str) -> String {
        let body_hash = hex::encode(Sha512::digest(body.as_bytes()));
        let payload = format!(
            "{}\n{}\n{}\n{}\n{}",
            method, path, query, body_hash, timestamp
        );
        let mut mac = HmacSha512::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &str,
        body: Option<String>,
    ) -> ExchangeResult<T> {
        self.coordinator.admit(path).await?;

        let url = if query.is_empty() {
            format!("{}{}", self.config.api_base, path)
        } else {
            format!("{}{}?{}", self.config.api_base, path, query)
        };
        let body_text = body.unwrap_or_default();
        let timestamp = Utc::now().timestamp().to_string();
        let signature = self.sign(method.as_str(), path, query, &body_text, &timestamp);

        let mut builder = self
            .http
            .request(method, &url)
            .header("KEY", self.api_key.as_str())
            .header("Timestamp", &timestamp)
            .header("SIGN", signature)
            .header("Content-Type", "application/json");
        if !body_text.is_empty() {
            builder = builder.body(body_text);
        }

        let response = match builder.send().await {
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
                let parsed: GateErrorBody = serde_json::from_str(&text).unwrap_or(GateErrorBody {
                    label: String::new(),
                    message: text.clone(),
                });
                if parsed.label.contains("INSUFFICIENT") || parsed.label == "NO_ENOUGH_MARGIN" {
                    return Err(ExchangeError::InsufficientFunds(parsed.message));
                }
                Err(ExchangeError::Venue {
                    status: status.as_u16(),
                    message: format!("{} {}", parsed.label, parsed.message),
                })
            }
        }
    }
}

#[async_trait]
impl ExchangeClient for GateClient {
    fn name(&self) -> &str {
        "gate"
    }

    fn contract_type(&self) -> ContractType {
        ContractType::Inverse
    }

    fn fee_schedule(&self) -> FeeSchedule {
        self.config.fee
    }

    async fn contract_spec(&self, symbol: &str) -> ExchangeResult<ContractSpec> {
        if let Some(spec) = self.contracts.get(symbol) {
            return Ok(spec.clone());
        }
        let contract = Self::to_venue_symbol(symbol);
        let path = format!("{}/contracts/{}", FUTURES_PREFIX, contract);
        let raw: GateContract = self.request(Method::GET, &path, "", None).await?;
        let spec = ContractSpec {
            symbol: symbol.to_string(),
            venue_symbol: raw.name,
            contract_type: ContractType::Inverse,
            quanto_multiplier: parse_num(&raw.quanto_multiplier),
            order_size_min: raw.order_size_min,
            order_size_max: raw.order_size_max,
            order_price_round: parse_num(&raw.order_price_round),
            mark_price_round: parse_num(&raw.mark_price_round),
        };
        self.contracts.insert(symbol.to_string(), spec.clone());
        Ok(spec)
    }

    async fn get_ticker(&self, symbol: &str, include_mark: bool) -> ExchangeResult<Ticker> {
        let contract = Self::to_venue_symbol(symbol);
        let path = format!("{}/tickers", FUTURES_PREFIX);
        let query = format!("contract={}", contract);
        let tickers: Vec<GateTicker> = self.request(Method::GET, &path, &query, None).await?;
        let ticker = tickers
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))?;
        Ok(Ticker {
            last: parse_num(&ticker.last),
            mark_price: if include_mark {
                ticker.mark_price.as_deref().map(parse_num)
            } else {
                None
            },
            index_price: if include_mark {
                ticker.index_price.as_deref().map(parse_num)
            } else {
                None
            },
        })
    }

    async fn get_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let contract = Self::to_venue_symbol(symbol);
        let path = format!("{}/candlesticks", FUTURES_PREFIX);
        let query = format!(
            "contract={}&interval={}&limit={}",
            contract,
            interval,
            limit.min(1000)
        );
        let raw: Vec<GateCandle> = self.request(Method::GET, &path, &query, None).await?;
        let mut candles: Vec<Candle> = raw
            .into_iter()
            .map(|c| Candle {
                timestamp: Utc
                    .timestamp_opt(c.t, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                open: parse_num(&c.o),
                high: parse_num(&c.h),
                low: parse_num(&c.l),
                close: parse_num(&c.c),
                volume: c.v,
            })
            .collect();
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn get_account(&self) -> ExchangeResult<AccountSummary> {
        let path = format!("{}/accounts", FUTURES_PREFIX);
        let raw: GateAccount = self.request(Method::GET, &path, "", None).await?;
        Ok(AccountSummary {
            total: parse_num(&raw.total),
            available: parse_num(&raw.available),
            position_margin: raw.position_margin.as_deref().map(parse_num).unwrap_or(0.0),
            unrealized_pnl: raw.unrealised_pnl.as_deref().map(parse_num).unwrap_or(0.0),
        })
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        let path = format!("{}/positions", FUTURES_PREFIX);
        let raw: Vec<GatePosition> = self.request(Method::GET, &path, "", None).await?;
        Ok(raw
            .into_iter()
            .filter(|p| p.size != 0.0)
            .filter_map(|p| {
                let symbol = Self::from_venue_symbol(&p.contract);
                if !self.symbols.contains(&symbol) {
                    return None;
                }
                Some(ExchangePosition {
                    symbol,
                    side: if p.size > 0.0 {
                        PositionSide::Long
                    } else {
                        PositionSide::Short
                    },
                    size: p.size.abs(),
                    entry_price: parse_num(&p.entry_price),
                    leverage: parse_num(&p.leverage).max(1.0),
                    liquidation_price: p.liq_price.as_deref().map(parse_num),
                    unrealized_pnl: p.unrealised_pnl.as_deref().map(parse_num).unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn get_funding_rate(&self, symbol: &str) -> ExchangeResult<f64> {
        let contract = Self::to_venue_symbol(symbol);
        let path = format!("{}/tickers", FUTURES_PREFIX);
        let query = format!("contract={}", contract);
        let tickers: Vec<GateTicker> = self.request(Method::GET, &path, &query, None).await?;
        Ok(tickers
            .first()
            .and_then(|t| t.funding_rate.as_deref())
            .map(parse_num)
            .unwrap_or(0.0))
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        let spec = self.contract_spec(&request.symbol).await?;
        let size = spec.clamp_size(request.size);
        if size == 0.0 {
            return Err(ExchangeError::InvalidOrder("zero size".to_string()));
        }

        // market orders use price "0" with ioc; limit prices are clamped to
        // the deviation band around mark and rounded to tick
        let (price, tif) = match request.price {
            None => ("0".to_string(), TimeInForce::Ioc),
            Some(price) => {
                let mark = self.get_ticker(&request.symbol, true).await?.mark_or_last();
                let clamped = price.clamp(
                    mark * (1.0 - PRICE_DEVIATION_LIMIT),
                    mark * (1.0 + PRICE_DEVIATION_LIMIT),
                );
                if (clamped - price).abs() > f64::EPSILON {
                    warn!(
                        "limit price {} clamped to {} ({}% band around mark {})",
                        price,
                        clamped,
                        PRICE_DEVIATION_LIMIT * 100.0,
                        mark
                    );
                }
                (format!("{}", spec.round_price(clamped)), request.tif)
            }
        };

        let body = serde_json::json!({
            "contract": spec.venue_symbol,
            "size": size as i64,
            "price": price,
            "tif": match tif { TimeInForce::Ioc => "ioc", TimeInForce::Gtc => "gtc" },
            "reduce_only": request.reduce_only,
        })
        .to_string();

        let path = format!("{}/orders", FUTURES_PREFIX);
        let raw: GateOrderResponse = self
            .request(Method::POST, &path, "", Some(body))
            .await?;
        debug!("gate order {} placed for {}", raw.id, request.symbol);
        Ok(OrderAck {
            id: raw.id.to_string(),
            status: raw.status.unwrap_or_else(|| "finished".to_string()),
        })
    }

    async fn place_trigger_order(&self, request: &TriggerRequest) -> ExchangeResult<String> {
        let spec = self.contract_spec(&request.symbol).await?;
        let rule = match request.rule {
            TriggerRule::GreaterOrEqual => 1,
            TriggerRule::LessOrEqual => 2,
        };
        let body = serde_json::json!({
            "initial": {
                "contract": spec.venue_symbol,
                "size": 0,
                "price": "0",
                "reduce_only": true,
                "tif": "ioc",
                "auto_size": "close_long_or_short",
            },
            "trigger": {
                "strategy_type": 0,
                "price_type": 1,
                "price": format!("{}", spec.round_price(request.trigger_price)),
                "rule": rule,
            },
            "order_size": request.close_size.abs() as i64,
        })
        .to_string();

        let path = format!("{}/price_orders", FUTURES_PREFIX);
        let raw: GateTriggerResponse = self
            .request(Method::POST, &path, "", Some(body))
            .await?;
        Ok(raw.id.to_string())
    }

    async fn cancel_trigger_orders(&self, symbol: Option<&str>) -> ExchangeResult<()> {
        let path = format!("{}/price_orders", FUTURES_PREFIX);
        let query = match symbol {
            Some(symbol) => format!("contract={}", Self::to_venue_symbol(symbol)),
            None => String::new(),
        };
        match self
            .request::<serde_json::Value>(Method::DELETE, &path, &query, None)
            .await
        {
            Ok(_) => Ok(()),
            // cancelling nothing is success
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
        let path = format!("{}/my_trades", FUTURES_PREFIX);
        let mut query = format!("limit={}", limit.min(1000));
        if let Some(symbol) = symbol {
            query.push_str(&format!("&contract={}", Self::to_venue_symbol(symbol)));
        }
        if let Some(start) = start_time {
            query.push_str(&format!("&from={}", start.timestamp()));
        }
        let raw: Vec<GateFill> = self.request(Method::GET, &path, &query, None).await?;
        let mut fills: Vec<Fill> = raw
            .into_iter()
            .map(|f| Fill {
                order_id: f.order_id,
                symbol: Self::from_venue_symbol(&f.contract),
                side: if f.size >= 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                price: parse_num(&f.price),
                quantity: f.size.abs(),
                fee: f.fee.as_deref().map(parse_num).unwrap_or(0.0),
                timestamp: Utc
                    .timestamp_opt(f.create_time as i64, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            })
            .collect();
        fills.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(fills)
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> ExchangeResult<()> {
        let contract = Self::to_venue_symbol(symbol);
        let path = format!("{}/positions/{}/leverage", FUTURES_PREFIX, contract);
        let query = format!("leverage={}", leverage as i64);
        self.request::<serde_json::Value>(Method::POST, &path, &query, None)
            .await?;
        Ok(())
    }
}
