use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use crate::error::AppError;

const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

#[derive(Deserialize, Debug)]
struct ErrorResponse {
    code: i64,
    msg: String,
}

/// 币安U本位合约的签名客户端
/// 签名方式：对query string做HMAC-SHA256，hex编码后追加signature参数，
/// API key放在 X-MBX-APIKEY 请求头
pub struct BinanceClient {
    client: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
}

impl BinanceClient {
    pub fn new(api_key: String, api_secret: String, base_url: Option<String>) -> Self {
        BinanceClient {
            client: Client::new(),
            api_key,
            api_secret,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn generate_signature(&self, query: &str) -> Result<String, AppError> {
        let mut hmac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| AppError::NetworkError(format!("invalid secret key: {}", e)))?;
        hmac.update(query.as_bytes());
        Ok(hex::encode(hmac.finalize().into_bytes()))
    }

    /// 发送签名请求，path形如 /fapi/v1/allOrders，query不含timestamp与signature
    pub async fn send_signed_request<T: for<'a> Deserialize<'a>>(
        &self,
        method: Method,
        path: &str,
        query: &str,
    ) -> Result<T, AppError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let full_query = if query.is_empty() {
            format!("timestamp={}&recvWindow=5000", timestamp)
        } else {
            format!("{}&timestamp={}&recvWindow=5000", query, timestamp)
        };
        let signature = self.generate_signature(&full_query)?;

        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, full_query, signature
        );
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status_code = response.status();
        let response_body = response.text().await?;
        debug!("path:{},binance_response: {}", path, response_body);

        if status_code == StatusCode::OK {
            let result: T = serde_json::from_str(&response_body)?;
            Ok(result)
        } else {
            match serde_json::from_str::<ErrorResponse>(&response_body) {
                Ok(error) => Err(AppError::NetworkError(format!(
                    "请求失败 code={}: {}",
                    error.code, error.msg
                ))),
                Err(_) => Err(AppError::NetworkError(format!(
                    "请求失败 http {}: {}",
                    status_code, response_body
                ))),
            }
        }
    }
}
