//! JSON-over-HTTP client used by the subcommands.

use color_eyre::{eyre::eyre, Result};
use querysync::CancelToken;
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// HTTP client wrapper
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("querysync/", env!("CARGO_PKG_VERSION")))
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// GET `url` and parse the body as JSON. Gives up early if `cancel` fires.
  pub async fn get_json(&self, url: &Url, cancel: &CancelToken) -> Result<Value> {
    let request = self.client.get(url.clone()).send();
    let response = tokio::select! {
      response = request => response.map_err(|e| eyre!("GET {} failed: {}", url, e))?,
      _ = cancel.cancelled() => return Err(eyre!("GET {} cancelled", url)),
    };
    read_json(response).await
  }

  /// POST `body` as JSON to `url`.
  pub async fn post_json(&self, url: &Url, body: &Value) -> Result<Value> {
    let response = self
      .client
      .post(url.clone())
      .json(body)
      .send()
      .await
      .map_err(|e| eyre!("POST {} failed: {}", url, e))?;
    read_json(response).await
  }
}

async fn read_json(response: reqwest::Response) -> Result<Value> {
  let url = response.url().clone();
  let response = response
    .error_for_status()
    .map_err(|e| eyre!("{} returned an error: {}", url, e))?;

  let body = response
    .text()
    .await
    .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;
  parse_body(&body).map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
}

/// An empty body is treated as `null`.
fn parse_body(body: &str) -> serde_json::Result<Value> {
  if body.trim().is_empty() {
    return Ok(Value::Null);
  }
  serde_json::from_str(body)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_body() {
    assert_eq!(parse_body("").unwrap(), Value::Null);
    assert_eq!(parse_body("  \n").unwrap(), Value::Null);
    assert_eq!(parse_body(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
    assert!(parse_body("{oops").is_err());
  }
}
