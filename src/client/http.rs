//! Stage executed by a remote HTTP service.
//!
//! The request is POSTed as JSON; a 2xx body must be a `StatePatch`.

use super::{parse_patch, tail, StageRequest};
use crate::models::{
    expand_env_vars, ConfigError, ReelforgeError, Result, StageConfig, StageError, StageId,
    StatePatch,
};
use crate::stage::{reuse_existing, Stage, StageContext};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Wait applied to a 429 without a usable `retry-after` header, in seconds.
const DEFAULT_RETRY_AFTER_SECS: f64 = 1.0;

pub struct HttpStage {
    id: StageId,
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    timeout: Duration,
    optional: bool,
    skip_if_present: bool,
    output_root: PathBuf,
}

impl HttpStage {
    pub fn new(id: StageId, url: &str, cfg: &StageConfig, output_root: &Path) -> Result<Self> {
        let timeout = cfg.timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReelforgeError::Internal(format!("building HTTP client: {e}")))?;

        Ok(Self {
            id,
            client,
            url: expand_env_vars(url),
            headers: build_headers(id, &cfg.headers)?,
            timeout,
            optional: cfg.is_optional(id),
            skip_if_present: cfg.skip_if_present,
            output_root: output_root.to_path_buf(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Build request headers, expanding `${VAR}` references in values.
fn build_headers(id: StageId, raw: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (key, value) in raw {
        let invalid = |reason: String| ConfigError::InvalidStage {
            stage: id.to_string(),
            reason,
        };
        let name = HeaderName::try_from(key.as_str())
            .map_err(|e| invalid(format!("header name '{key}': {e}")))?;
        let value = HeaderValue::from_str(&expand_env_vars(value))
            .map_err(|e| invalid(format!("header '{key}' value: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Map a non-success response to a stage error. `None` means success.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<&str>,
    body: &str,
) -> Option<StageError> {
    if status.is_success() {
        return None;
    }

    let detail = format!("HTTP {}: {}", status.as_u16(), tail(body.as_bytes()));
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => StageError::RateLimited {
            retry_after_secs: retry_after
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        StatusCode::REQUEST_TIMEOUT => StageError::Provider(detail),
        s if s.is_server_error() => StageError::Provider(detail),
        _ => StageError::Validation(detail),
    })
}

#[async_trait]
impl Stage for HttpStage {
    fn id(&self) -> StageId {
        self.id
    }

    fn optional(&self) -> bool {
        self.optional
    }

    async fn run(&self, ctx: &StageContext<'_>) -> std::result::Result<StatePatch, StageError> {
        if self.skip_if_present {
            if let Some(patch) = reuse_existing(ctx) {
                debug!(stage = %self.id, "Output already present, skipping request");
                return Ok(patch);
            }
        }

        let payload = StageRequest::new(ctx, &self.output_root).to_json()?;
        let start = Instant::now();

        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StageError::Timeout(self.timeout)
                } else {
                    StageError::Provider(format!("request to {} failed: {e}", self.url))
                }
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                StageError::Timeout(self.timeout)
            } else {
                StageError::Provider(format!("reading response from {}: {e}", self.url))
            }
        })?;

        debug!(
            stage = %self.id,
            status = status.as_u16(),
            attempt = ctx.attempt,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Stage endpoint responded"
        );

        if let Some(err) = classify_status(
            status,
            retry_after.as_deref(),
            &String::from_utf8_lossy(&body),
        ) {
            return Err(err);
        }
        parse_patch(&body)
    }
}
