use crate::error::AttemptError;
use crate::io_struct::{DownstreamResult, ErrorBody, ForwardEnvelope};
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

/// One blocking request-response hop to a downstream service.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn send(
        &self,
        url: &str,
        envelope: &ForwardEnvelope,
        timeout: Duration,
    ) -> Result<DownstreamResult, AttemptError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Some(Duration::from_secs(50)))
            .build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        url: &str,
        envelope: &ForwardEnvelope,
        timeout: Duration,
    ) -> Result<DownstreamResult, AttemptError> {
        let resp = self
            .client
            .post(url)
            .timeout(timeout)
            .json(envelope)
            .send()
            .await
            .map_err(|e| AttemptError::from_reqwest(e, timeout))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| AttemptError::from_reqwest(e, timeout))?;

        if !status.is_success() {
            return Err(AttemptError::UpstreamHTTPError {
                status: status.as_u16(),
                detail: error_detail(&body),
            });
        }

        serde_json::from_slice::<DownstreamResult>(&body)
            .map_err(|e| AttemptError::MalformedBody(e.to_string()))
    }
}

/// Pulls `detail` out of a JSON error body, falling back to the raw text.
pub fn error_detail(body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(err) => err.detail,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}
