//! HTTP sender that posts mutations to a remote endpoint.

use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{MutationSender, SendOutcome};
use crate::error::{Result, SyncError};
use crate::queue::QueuedMutation;

/// Maximum length for response bodies carried in failure reasons
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Header the remote uses to drop duplicate deliveries
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Serialize)]
struct MutationBody<'a> {
  id: i64,
  op_type: &'a str,
  payload: &'a serde_json::Value,
}

/// Sends each mutation as `POST <endpoint>/mutations`.
///
/// Clone is cheap; reqwest's client shares its connection pool.
#[derive(Clone)]
pub struct HttpSender {
  client: Client,
  url: Url,
}

impl HttpSender {
  pub fn new(endpoint: &Url, request_timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(request_timeout)
      .build()
      .map_err(|e| SyncError::Network(format!("Failed to build HTTP client: {}", e)))?;
    // Url::join replaces the last path segment unless the base ends in '/'
    let mut base = endpoint.clone();
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }
    let url = base
      .join("mutations")
      .map_err(|e| SyncError::Config(format!("Invalid endpoint {}: {}", endpoint, e)))?;

    Ok(Self { client, url })
  }

  async fn post(&self, mutation: &QueuedMutation) -> SendOutcome {
    let body = MutationBody {
      id: mutation.id,
      op_type: &mutation.op_type,
      payload: &mutation.payload,
    };

    let response = self
      .client
      .post(self.url.clone())
      .header(IDEMPOTENCY_HEADER, &mutation.idempotency_key)
      .json(&body)
      .send()
      .await;

    match response {
      Ok(response) => {
        let status = response.status();
        if status.is_success() {
          return SendOutcome::Delivered;
        }
        let body = response.text().await.unwrap_or_default();
        debug!(id = mutation.id, %status, "Remote refused mutation");
        classify_status(status, &body)
      }
      // Connection refused, DNS failure, request timeout: nothing will get through.
      Err(e) => SendOutcome::channel_down(format!("Network error: {}", e)),
    }
  }
}

impl MutationSender for HttpSender {
  async fn send(&self, mutation: &QueuedMutation) -> SendOutcome {
    self.post(mutation).await
  }
}

/// Map a non-success response onto the retry policy.
pub fn classify_status(status: StatusCode, body: &str) -> SendOutcome {
  let reason = format!("Status {}: {}", status, truncate_body(body));
  match status.as_u16() {
    400 | 404 | 409 | 410 | 422 => SendOutcome::rejected(reason),
    401 | 403 | 502 | 503 | 504 => SendOutcome::channel_down(reason),
    408 | 429 => SendOutcome::retry_later(reason),
    500..=599 => SendOutcome::retry_later(reason),
    _ => SendOutcome::rejected(reason),
  }
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
  if body.len() <= MAX_ERROR_BODY_LENGTH {
    return body.to_string();
  }
  let mut end = MAX_ERROR_BODY_LENGTH;
  while !body.is_char_boundary(end) {
    end -= 1;
  }
  format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}
