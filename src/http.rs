//! Snapshot fetch and token issuance HTTP calls (§6 External Interfaces),
//! run on `reqwest`'s async client so they never block the event loop (§5).
//! Grounded on `original_source/main.py`'s `fetch_board_snapshot`/
//! `get_token`: same endpoints, same tolerance for a token nested under
//! `data`/`result`, same tolerance for hyphenated or bare-hex UUIDs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canvas::SNAPSHOT_BYTES;
use crate::error::{PainterError, Result};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PaintboardClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    uid: u32,
    access_key: &'a str,
}

impl PaintboardClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// `GET /api/paintboard/getboard` — exactly 1,800,000 bytes, row-major
    /// RGB triples (§6).
    pub async fn fetch_snapshot(&self) -> Result<Vec<u8>> {
        let url = format!("{}/api/paintboard/getboard", self.base_url);
        let body = self.http.get(url).send().await?.bytes().await?;
        if body.len() != SNAPSHOT_BYTES {
            return Err(PainterError::Config(format!(
                "snapshot body is {} bytes, expected {SNAPSHOT_BYTES}",
                body.len()
            )));
        }
        Ok(body.to_vec())
    }

    /// `POST /api/auth/gettoken` — returns the decoded 16-byte token.
    pub async fn issue_token(&self, uid: u32, access_key: &str) -> Result<[u8; 16]> {
        let url = format!("{}/api/auth/gettoken", self.base_url);
        let resp = self
            .http
            .post(url)
            .json(&TokenRequest { uid, access_key })
            .send()
            .await?;
        let status = resp.status();
        let body: Value = resp.json().await.map_err(|e| PainterError::TokenIssuance {
            uid,
            reason: format!("response body is not valid JSON: {e}"),
        })?;
        if !status.is_success() {
            return Err(PainterError::TokenIssuance {
                uid,
                reason: format!("http {status}: {body}"),
            });
        }
        let token_str = extract_token(&body).ok_or_else(|| PainterError::TokenIssuance {
            uid,
            reason: format!("no token field in response: {body}"),
        })?;
        parse_token(&token_str).ok_or_else(|| PainterError::TokenIssuance {
            uid,
            reason: format!("malformed token: {token_str}"),
        })
    }
}

/// Token may arrive at the top level or nested under `data`/`result`.
fn extract_token(body: &Value) -> Option<String> {
    for candidate in [Some(body), body.get("data"), body.get("result")].into_iter().flatten() {
        if let Some(token) = candidate.get("token").and_then(Value::as_str) {
            return Some(token.to_string());
        }
    }
    None
}

/// A token is a UUID string, with or without hyphens. Decode tolerates both.
fn parse_token(token: &str) -> Option<[u8; 16]> {
    let parsed = uuid::Uuid::parse_str(token)
        .or_else(|_| uuid::Uuid::parse_str(&insert_hyphens(token)))
        .ok()?;
    Some(*parsed.as_bytes())
}

fn insert_hyphens(hex: &str) -> String {
    if hex.len() != 32 {
        return hex.to_string();
    }
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
