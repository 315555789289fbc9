//! Client for the order backend.
//!
//! Turns catalog operations into JSON-RPC calls and folds every answer into a
//! [`ToolInvocationResult`]. Three outcomes are kept apart:
//!
//! - bad arguments or unknown operations fail locally, with no network call;
//! - transport faults (refused, timeout, malformed body) come back as `Err`
//!   after the retry policy gives up;
//! - remote rejections (invalid PIN, out of stock) are ordinary results with
//!   `success = false`.

pub mod protocol;

use crate::catalog::{self, CATALOG_VERSION};
use crate::config::{BackendConfig, BackendProtocol};
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::retry::RetryPolicy;
use crate::session::{FailureKind, ToolInvocationRequest, ToolInvocationResult};
use async_trait::async_trait;
use protocol::{CallOutcome, RpcRequest, RpcResponse};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Moves one JSON-RPC message to the backend and back.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(&self, request: &RpcRequest, timeout: Duration) -> Result<RpcResponse>;

    /// Fire-and-forget message; transports without a notion of it ignore it.
    async fn notify(&self, _request: &RpcRequest, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// JSON-RPC over HTTP POST.
pub struct HttpTransport {
    http: HttpClient,
    url: String,
}

const ACCEPT: (&str, &str) = ("Accept", "application/json, text/event-stream");

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(concat!("orderdesk/", env!("CARGO_PKG_VERSION")))?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, request: &RpcRequest, timeout: Duration) -> Result<RpcResponse> {
        let body = serde_json::to_string(request)
            .map_err(|e| Error::parse(format!("serialize: {e}")))?;
        let text = self
            .http
            .post_json_raw(&self.url, &body, &[ACCEPT], timeout)
            .await?;
        protocol::decode_body(&text)
    }

    async fn notify(&self, request: &RpcRequest, timeout: Duration) -> Result<()> {
        let body = serde_json::to_string(request)
            .map_err(|e| Error::parse(format!("serialize: {e}")))?;
        self.http
            .post_json_raw(&self.url, &body, &[ACCEPT], timeout)
            .await
            .map(|_| ())
    }
}

/// Result of comparing the live backend with the local catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogCheck {
    /// Catalog operations the backend does not advertise.
    pub missing: Vec<String>,
    /// Backend operations the catalog does not offer.
    pub extra: Vec<String>,
}

impl CatalogCheck {
    pub fn is_superset(&self) -> bool {
        self.missing.is_empty()
    }
}

pub struct BackendClient<T = HttpTransport> {
    transport: T,
    protocol: BackendProtocol,
    timeout: Duration,
    retry: RetryPolicy,
    next_id: AtomicU64,
    /// Set once the MCP handshake succeeds; a failed attempt leaves it empty.
    session: OnceCell<()>,
}

impl BackendClient<HttpTransport> {
    pub fn from_config(config: &BackendConfig, retry: RetryPolicy) -> Result<Self> {
        let transport = HttpTransport::new(&config.url)?;
        Ok(Self::new(
            transport,
            config.protocol,
            Duration::from_secs(config.timeout_secs),
            retry,
        ))
    }
}

impl<T: RpcTransport> BackendClient<T> {
    pub fn new(transport: T, protocol: BackendProtocol, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            transport,
            protocol,
            timeout,
            retry,
            next_id: AtomicU64::new(1),
            session: OnceCell::new(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn protocol(&self) -> BackendProtocol {
        self.protocol
    }

    /// MCP session handshake. A no-op for plain JSON-RPC backends and once a
    /// handshake has succeeded.
    ///
    /// Every call that reaches the backend goes through here first, so a
    /// handshake that failed at startup is retried on first use.
    pub async fn initialize(&self) -> Result<()> {
        if self.protocol != BackendProtocol::Mcp {
            return Ok(());
        }
        self.session.get_or_try_init(|| self.handshake()).await?;
        Ok(())
    }

    async fn handshake(&self) -> Result<()> {
        let response = self
            .call("initialize", protocol::initialize_params(), self.timeout)
            .await?;
        if let Some(err) = response.error {
            return Err(Error::api("backend", format!("initialize rejected: {}", err.message)));
        }
        let server = response
            .result
            .as_ref()
            .and_then(|r| r["serverInfo"]["name"].as_str())
            .unwrap_or("unknown")
            .to_string();
        self.transport
            .notify(&RpcRequest::notification("notifications/initialized"), self.timeout)
            .await?;
        info!(server = %server, "backend session initialized");
        Ok(())
    }

    /// Invoke one catalog operation.
    ///
    /// Local validation failures and remote rejections are returned as
    /// `Ok` results with `success = false`; only transport faults are `Err`.
    pub async fn invoke(
        &self,
        request: &ToolInvocationRequest,
        timeout: Duration,
    ) -> Result<ToolInvocationResult> {
        let (spec, arguments) = match catalog::resolve(&request.operation_name, &request.arguments)
        {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!(operation = %request.operation_name, error = %e, "rejected locally");
                return Ok(ToolInvocationResult::failure(
                    request,
                    FailureKind::Validation,
                    None,
                    e.to_string(),
                ));
            }
        };

        self.initialize().await?;
        let (method, params) = protocol::frame_call(self.protocol, spec.name(), arguments);
        // A timed-out order may still have been placed; only a 429 proves it was not.
        let response = if spec.operation.is_idempotent() {
            self.call(&method, params, timeout).await?
        } else {
            let retry = RetryPolicy {
                transient_retries: 0,
                ..self.retry.clone()
            };
            self.call_with(&retry, &method, params, timeout).await?
        };

        if let Some(err) = response.error {
            debug!(operation = spec.name(), code = err.code, "backend rejected call");
            return Ok(ToolInvocationResult::failure(
                request,
                FailureKind::Application,
                Some(err.code),
                err.message,
            ));
        }
        let result = response
            .result
            .ok_or_else(|| Error::protocol("response has neither result nor error"))?;

        Ok(match protocol::interpret_result(self.protocol, result) {
            CallOutcome::Success(payload) => ToolInvocationResult::success(request, payload),
            CallOutcome::Rejected(message) => {
                ToolInvocationResult::failure(request, FailureKind::Application, None, message)
            }
        })
    }

    /// Ask the backend which operations it serves and compare with the catalog.
    ///
    /// A mismatch is only logged; operations the backend lacks fail one by one
    /// at call time.
    pub async fn discover_operations(&self) -> Result<CatalogCheck> {
        self.initialize().await?;
        let response = self
            .call(protocol::DISCOVERY_METHOD, Value::Object(Default::default()), self.timeout)
            .await?;
        if let Some(err) = response.error {
            return Err(Error::api("backend", format!("tools/list rejected: {}", err.message)));
        }
        let live = protocol::advertised_tools(&response.result.unwrap_or_default())?;

        let catalog_names: Vec<&str> = catalog::list_operations().iter().map(|s| s.name()).collect();
        let check = CatalogCheck {
            missing: catalog_names
                .iter()
                .filter(|name| !live.iter().any(|l| l == *name))
                .map(|name| name.to_string())
                .collect(),
            extra: live
                .iter()
                .filter(|l| !catalog_names.iter().any(|name| *name == l.as_str()))
                .cloned()
                .collect(),
        };

        if check.is_superset() {
            info!(
                catalog_version = CATALOG_VERSION,
                live = live.len(),
                "backend serves every catalog operation"
            );
        } else {
            warn!(
                catalog_version = CATALOG_VERSION,
                missing = ?check.missing,
                "backend does not advertise some catalog operations"
            );
        }
        Ok(check)
    }

    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<RpcResponse> {
        self.call_with(&self.retry, method, params, timeout).await
    }

    /// One request/response exchange under `retry`.
    async fn call_with(
        &self,
        retry: &RetryPolicy,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        retry
            .run(method, || {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let request = RpcRequest::new(id, method, params.clone());
                async move {
                    let response = self.transport.send(&request, timeout).await?;
                    if !response.answers(id) {
                        return Err(Error::protocol(format!(
                            "response id {} does not match request id {id}",
                            response.id
                        )));
                    }
                    Ok(response)
                }
            })
            .await
    }
}
