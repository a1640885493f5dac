//! HTTP client for streaming POST responses.
//!
//! The request itself is retried per [`RetryPolicy`]; once a successful
//! response starts streaming, its body is decoded frame by frame and each
//! frame is handed to the caller's callback in order. Failures after that
//! point end the stream and are reported in [`StreamOutcome`].

use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{Client, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::realtime::manager::TOKEN_QUERY_PARAM;
use crate::retry::{retry_async, with_timeout, RetryPolicy};
use crate::stream::decoder::{decode_with, FrameDecoder, Termination};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamingClientDefaults;

impl StreamingClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_ATTEMPTS: usize = 2;
    pub const BACKOFF: Duration = Duration::from_millis(250);
    pub const JITTER: Duration = Duration::from_millis(100);
}

#[derive(Clone, Debug)]
pub struct StreamingClientOptions {
    pub connect_timeout: Duration,
    /// Time allowed until response headers arrive. The body is not bounded.
    pub response_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Optional cap on the decoder's unterminated tail, in bytes.
    pub max_buffer: Option<usize>,
}

impl Default for StreamingClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: StreamingClientDefaults::CONNECT_TIMEOUT,
            response_timeout: StreamingClientDefaults::RESPONSE_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: StreamingClientDefaults::MAX_ATTEMPTS,
                initial_backoff: StreamingClientDefaults::BACKOFF,
                max_backoff: StreamingClientDefaults::BACKOFF,
                jitter: StreamingClientDefaults::JITTER,
            },
            max_buffer: None,
        }
    }
}

/// Summary of one decoded response body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Frames delivered to the callback.
    pub frames: usize,
    pub termination: Termination,
}

#[derive(Clone)]
pub struct StreamingClient {
    http: Client,
    base_url: String,
    token: Option<SecretString>,
    response_timeout: Duration,
    retry_policy: RetryPolicy,
    max_buffer: Option<usize>,
}

impl StreamingClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StreamRequestError> {
        Self::with_options(base_url, None, StreamingClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        token: Option<SecretString>,
        options: StreamingClientOptions,
    ) -> Result<Self, StreamRequestError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(StreamRequestError::Transport)?;

        let base_url = base_url.into();
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            response_timeout: options.response_timeout,
            retry_policy: options.retry_policy,
            max_buffer: options.max_buffer,
        })
    }

    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// POSTs `body` as JSON to `path` and decodes the streamed response.
    ///
    /// `on_frame` runs once per decoded frame, in stream order. The response
    /// is released on every exit path, including the `[DONE]` sentinel.
    pub async fn post_stream<T, F>(
        &self,
        path: &str,
        body: &T,
        on_frame: F,
    ) -> Result<StreamOutcome, StreamRequestError>
    where
        T: Serialize + ?Sized,
        F: FnMut(Value),
    {
        let endpoint = self.endpoint(path)?;
        let response = retry_async(
            &self.retry_policy,
            |_| self.send_attempt(&endpoint, body),
            StreamRequestError::is_retryable,
        )
        .await?;

        let decoder = match self.max_buffer {
            Some(limit) => FrameDecoder::with_max_buffer(limit),
            None => FrameDecoder::new(),
        };
        let (frames, termination) = decode_with(response.bytes_stream(), decoder, on_frame).await;
        debug!(
            event = "stream_finished",
            path,
            frames,
            termination = ?termination
        );

        Ok(StreamOutcome {
            frames,
            termination,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, StreamRequestError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|err| StreamRequestError::Url(err.to_string()))?;
        if let Some(token) = self.token.as_ref() {
            url.query_pairs_mut()
                .append_pair(TOKEN_QUERY_PARAM, token.expose_secret());
        }
        Ok(url)
    }

    async fn send_attempt<T: Serialize + ?Sized>(
        &self,
        endpoint: &Url,
        body: &T,
    ) -> Result<Response, StreamRequestError> {
        let request = self
            .http
            .post(endpoint.clone())
            .header(ACCEPT, "text/event-stream")
            .json(body)
            .send();

        let response = with_timeout(self.response_timeout, request)
            .await
            .map_err(|_| StreamRequestError::Timeout(self.response_timeout))?
            .map_err(StreamRequestError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamRequestError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        Ok(response)
    }
}

#[derive(Debug, Error)]
pub enum StreamRequestError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("invalid url: {0}")]
    Url(String),
}

impl StreamRequestError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Timeout(_) => true,
            Self::Url(_) => false,
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        detail: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.detail) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
