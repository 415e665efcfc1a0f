//! REST client for the prediction-market CLOB.

use super::traits::ExchangeClient;
use super::types::*;
use crate::config::ExchangeConfig;
use crate::model::Side;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Authenticated CLOB API client.
pub struct ClobClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    api_passphrase: String,
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    order_id: String,
    status: ExchangeOrderStatus,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: String,
    #[serde(default)]
    client_order_id: Option<String>,
    status: ExchangeOrderStatus,
    filled_size: Decimal,
}

impl From<OrderResponse> for OrderState {
    fn from(r: OrderResponse) -> Self {
        OrderState {
            exchange_order_id: r.order_id,
            client_order_id: r.client_order_id,
            status: r.status,
            filled_size: r.filled_size,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FillResponse {
    fill_id: String,
    order_id: String,
    side: Side,
    size: Decimal,
    price: Decimal,
    ts: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PositionResponse {
    market_id: String,
    outcome: u32,
    size: Decimal,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Option<Decimal>,
}

/// Map an HTTP status to the error taxonomy.
fn classify(status: StatusCode, body: &str) -> ExchangeError {
    let detail = format!("{} {}", status.as_u16(), body.trim());
    if status == StatusCode::NOT_FOUND {
        ExchangeError::NotFound(detail)
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ExchangeError::Transient(detail)
    } else {
        ExchangeError::Rejected(detail)
    }
}

fn transport(err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() {
        ExchangeError::Timeout
    } else {
        ExchangeError::Transient(err.to_string())
    }
}

impl ClobClient {
    pub fn new(config: &ExchangeConfig, call_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(call_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            api_passphrase: config.api_passphrase.clone(),
        })
    }

    /// HMAC-SHA256 over `timestamp + method + path + body`, hex encoded.
    fn sign(&self, timestamp: i64, method: &Method, path: &str, body: &str) -> Result<String, ExchangeError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Rejected(format!("bad api secret: {}", e)))?;
        mac.update(format!("{}{}{}{}", timestamp, method.as_str(), path, body).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Send a signed request. `Ok(None)` means 404.
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<Option<T>, ExchangeError> {
        let timestamp = Utc::now().timestamp();
        let payload = body.unwrap_or_default();
        let signature = self.sign(timestamp, &method, path, &payload)?;
        let url = format!("{}{}", self.base_url, path);

        let mut request = self
            .http
            .request(method.clone(), &url)
            .header("X-API-KEY", &self.api_key)
            .header("X-API-PASSPHRASE", &self.api_passphrase)
            .header("X-API-TIMESTAMP", timestamp.to_string())
            .header("X-API-SIGNATURE", signature);
        if !payload.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .body(payload);
        }

        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response.text().await.map_err(transport)?;
        if !status.is_success() {
            let err = classify(status, &text);
            warn!(%method, %path, error = %err, "Exchange request failed");
            return Err(err);
        }
        if text.trim().is_empty() {
            return serde_json::from_str("null")
                .map(Some)
                .map_err(|e| ExchangeError::Transient(format!("decode: {}", e)));
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| ExchangeError::Transient(format!("decode {}: {}", path, e)))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ExchangeError> {
        self.send(Method::GET, path, None).await
    }
}

#[async_trait]
impl ExchangeClient for ClobClient {
    fn name(&self) -> &'static str {
        "clob"
    }

    #[instrument(skip(self, request), fields(client_order_id = %request.client_order_id))]
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let body = serde_json::to_string(request)
            .map_err(|e| ExchangeError::Rejected(format!("encode: {}", e)))?;
        debug!(?request, "Submitting order");
        let ack: AckResponse = self
            .send(Method::POST, "/orders", Some(body))
            .await?
            .ok_or_else(|| ExchangeError::Rejected("order endpoint not found".to_string()))?;
        Ok(OrderAck {
            exchange_order_id: ack.order_id,
            status: ack.status,
        })
    }

    #[instrument(skip(self))]
    async fn find_order(&self, client_order_id: &str) -> Result<Option<OrderState>, ExchangeError> {
        let path = format!(
            "/orders?client_order_id={}",
            urlencoding::encode(client_order_id)
        );
        let found: Option<Vec<OrderResponse>> = self.get(&path).await?;
        Ok(found.and_then(|orders| orders.into_iter().next()).map(OrderState::from))
    }

    #[instrument(skip(self))]
    async fn order_state(&self, exchange_order_id: &str) -> Result<OrderState, ExchangeError> {
        let path = format!("/orders/{}", urlencoding::encode(exchange_order_id));
        let order: OrderResponse = self
            .get(&path)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(exchange_order_id.to_string()))?;
        Ok(order.into())
    }

    #[instrument(skip(self))]
    async fn fills(
        &self,
        exchange_order_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExchangeFill>, ExchangeError> {
        let mut path = format!("/orders/{}/fills", urlencoding::encode(exchange_order_id));
        if let Some(since) = since {
            let since = since.to_rfc3339_opts(SecondsFormat::Micros, true);
            path.push_str(&format!("?since={}", urlencoding::encode(&since)));
        }
        let fills: Vec<FillResponse> = self
            .get(&path)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(exchange_order_id.to_string()))?;
        Ok(fills
            .into_iter()
            .map(|f| ExchangeFill {
                fill_id: f.fill_id,
                exchange_order_id: f.order_id,
                side: f.side,
                size: f.size,
                price: f.price,
                ts: f.ts,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, exchange_order_id: &str) -> Result<(), ExchangeError> {
        let path = format!("/orders/{}", urlencoding::encode(exchange_order_id));
        let _: serde_json::Value = self
            .send(Method::DELETE, &path, None)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(exchange_order_id.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn positions(&self, account: &str) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        let path = format!("/positions?account={}", urlencoding::encode(account));
        let positions: Vec<PositionResponse> = self.get(&path).await?.unwrap_or_default();
        Ok(positions
            .into_iter()
            .map(|p| PositionSnapshot {
                market_id: p.market_id,
                outcome: p.outcome,
                quantity: p.size,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn mark_price(&self, token_id: &str) -> Result<Option<Decimal>, ExchangeError> {
        let path = format!("/price?token_id={}&side=sell", urlencoding::encode(token_id));
        let price: Option<PriceResponse> = self.get(&path).await?;
        Ok(price.and_then(|p| p.price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, timeout: Duration) -> ClobClient {
        let config = ExchangeConfig {
            base_url: server.uri(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            api_passphrase: "pass".to_string(),
            account: "0xabc".to_string(),
        };
        ClobClient::new(&config, timeout).unwrap()
    }

    fn request() -> OrderRequest {
        OrderRequest {
            client_order_id: "mr-7".to_string(),
            market_id: "m1".to_string(),
            outcome: 1,
            token_id: "yes".to_string(),
            side: Side::Buy,
            size: dec!(1333.33),
            limit_price: dec!(0.07575),
        }
    }

    #[tokio::test]
    async fn test_submit_order_signed_and_acked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header_exists("X-API-SIGNATURE"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"order_id": "ex-1", "status": "open"})),
            )
            .mount(&server)
            .await;

        let ack = client(&server, Duration::from_secs(5))
            .submit_order(&request())
            .await
            .unwrap();
        assert_eq!(ack.exchange_order_id, "ex-1");
        assert_eq!(ack.status, ExchangeOrderStatus::Open);
    }

    #[tokio::test]
    async fn test_status_codes_map_to_categories() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(400).set_body_string("insufficient balance"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orders/ex-1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orders/ex-2"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client(&server, Duration::from_secs(5));
        assert!(matches!(
            client.submit_order(&request()).await,
            Err(ExchangeError::Rejected(_))
        ));
        assert!(matches!(
            client.order_state("ex-1").await,
            Err(ExchangeError::Transient(_))
        ));
        assert!(matches!(
            client.order_state("ex-2").await,
            Err(ExchangeError::Transient(_))
        ));
        // Unmatched routes return 404
        assert!(matches!(
            client.order_state("ex-3").await,
            Err(ExchangeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_response_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"order_id": "ex-1", "status": "open"}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let result = client(&server, Duration::from_millis(50))
            .submit_order(&request())
            .await;
        assert_eq!(result, Err(ExchangeError::Timeout));
    }

    #[tokio::test]
    async fn test_find_order_and_fills() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders"))
            .and(query_param("client_order_id", "mr-7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"order_id": "ex-1", "client_order_id": "mr-7", "status": "filled", "filled_size": "1333.33"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orders/ex-1/fills"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"fill_id": "f1", "order_id": "ex-1", "side": "buy", "size": "1333.33",
                 "price": "0.075", "ts": "2026-01-01T00:00:00Z"}
            ])))
            .mount(&server)
            .await;

        let client = client(&server, Duration::from_secs(5));
        let found = client.find_order("mr-7").await.unwrap().unwrap();
        assert_eq!(found.status, ExchangeOrderStatus::Filled);
        assert_eq!(found.filled_size, dec!(1333.33));

        let fills = client.fills("ex-1", None).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].signed_quantity(), dec!(1333.33));
        assert_eq!(fills[0].price, dec!(0.075));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let config = ExchangeConfig {
            base_url: "http://localhost".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            api_passphrase: String::new(),
            account: String::new(),
        };
        let client = ClobClient::new(&config, Duration::from_secs(1)).unwrap();
        let a = client.sign(1, &Method::GET, "/orders", "").unwrap();
        let b = client.sign(1, &Method::GET, "/orders", "").unwrap();
        let c = client.sign(2, &Method::GET, "/orders", "").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
