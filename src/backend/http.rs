//! HTTP backend adapter over the shared hyper client.
//!
//! [`HttpBackend`] joins the forwarded path onto the module's base URL,
//! rewrites `Host`, and hands the upstream body back as a stream without
//! buffering it. Connect failures are reported as
//! [`BackendError::Connect`] so the proxy core can retry them.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderValue, Method};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Full};

use super::{BackendAdapter, BackendError, BackendResponse, ForwardRequest};
use crate::config::model::ModuleConfig;
use crate::error::WatchtowerError;
use crate::module::ModuleId;
use crate::server::HttpClient;

pub struct HttpBackend {
    module: ModuleId,
    base: url::Url,
    host: Option<HeaderValue>,
    client: HttpClient,
    timeout_ms: u64,
    health_path: String,
}

impl HttpBackend {
    pub fn new(
        module: ModuleId,
        config: &ModuleConfig,
        client: HttpClient,
    ) -> Result<Self, WatchtowerError> {
        let base = url::Url::parse(&config.url).map_err(|e| WatchtowerError::ModuleStartup {
            module,
            reason: format!("invalid backend url '{}': {e}", config.url),
        })?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(WatchtowerError::ModuleStartup {
                module,
                reason: format!("unsupported scheme '{}'", base.scheme()),
            });
        }

        let host = base.host_str().and_then(|h| {
            let value = base
                .port()
                .map_or_else(|| h.to_string(), |port| format!("{h}:{port}"));
            HeaderValue::from_str(&value).ok()
        });

        Ok(Self {
            module,
            base,
            host,
            client,
            timeout_ms: config.timeout,
            health_path: config
                .health_path
                .clone()
                .unwrap_or_else(|| module.default_health_path().to_string()),
        })
    }

    fn target(&self, path_and_query: &str) -> String {
        format!(
            "{}{}",
            self.base.as_str().trim_end_matches('/'),
            path_and_query
        )
    }

    async fn send(
        &self,
        method: Method,
        uri: String,
        request: Option<ForwardRequest>,
    ) -> Result<BackendResponse, BackendError> {
        let mut builder = hyper::Request::builder().method(method).uri(uri);
        let body = match request {
            Some(request) => {
                for (key, value) in &request.headers {
                    builder = builder.header(key, value);
                }
                request.body
            }
            None => Bytes::new(),
        };
        if let Some(ref host) = self.host {
            builder = builder.header(hyper::header::HOST, host.clone());
        }

        let req = builder
            .body(Full::new(body))
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let response = tokio::time::timeout(
            Duration::from_millis(self.timeout_ms),
            self.client.request(req),
        )
        .await
        .map_err(|_| BackendError::Timeout(self.timeout_ms))?
        .map_err(|e| {
            if e.is_connect() {
                BackendError::Connect(e.to_string())
            } else {
                BackendError::Request(e.to_string())
            }
        })?;

        let (parts, incoming) = response.into_parts();
        let body = incoming
            .into_data_stream()
            .map_err(|e| BackendError::Body(e.to_string()))
            .boxed();

        Ok(BackendResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

#[async_trait]
impl BackendAdapter for HttpBackend {
    fn module(&self) -> ModuleId {
        self.module
    }

    async fn forward(&self, request: ForwardRequest) -> Result<BackendResponse, BackendError> {
        let uri = self.target(&request.path_and_query);
        let method = request.method.clone();
        self.send(method, uri, Some(request)).await
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let uri = self.target(&self.health_path);
        let response = self.send(Method::GET, uri, None).await?;
        if response.status.is_success() {
            Ok(())
        } else {
            Err(BackendError::Request(format!(
                "health check returned {}",
                response.status
            )))
        }
    }
}
