use crate::error::{Error, Result};
use reqwest::{Client, StatusCode, header};
use std::time::Duration;
use tracing::debug;

/// Thin reqwest wrapper shared by the LLM client and the backend transport.
///
/// Every call carries an explicit timeout. Retrying is not done here; callers
/// wrap calls in a [`crate::retry::RetryPolicy`] so both remote dependencies
/// follow the same rules.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::http(e.to_string()))?;

        Ok(Self { client })
    }

    pub async fn post_json_raw(
        &self,
        url: &str,
        body: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<String> {
        let mut req = self
            .client
            .post(url)
            .timeout(timeout)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.to_string());
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        debug!(url = %redact_query(url), timeout_secs = timeout.as_secs(), "POST");
        match req.send().await {
            Ok(resp) => self.handle_response(resp).await,
            Err(e) if e.is_timeout() => Err(Error::Timeout {
                target: extract_domain(url),
                secs: timeout.as_secs(),
            }),
            Err(e) => Err(Error::http(e.without_url().to_string())),
        }
    }

    async fn handle_response(&self, resp: reqwest::Response) -> Result<String> {
        let status = resp.status();
        let url = resp.url().to_string();

        match status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => resp
                .text()
                .await
                .map_err(|e| Error::http(e.without_url().to_string())),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = resp
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                Err(Error::RateLimit {
                    platform: extract_domain(&url),
                    retry_after_secs: retry_after,
                })
            }
            _ => {
                let body = resp.text().await.unwrap_or_default();
                Err(Error::api_with_status(
                    extract_domain(&url),
                    body,
                    status.as_u16(),
                ))
            }
        }
    }
}

fn extract_domain(url: &str) -> String {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("unknown")
        .to_string()
}

/// Drop the query string so API keys passed as `?key=` never reach the logs.
fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
