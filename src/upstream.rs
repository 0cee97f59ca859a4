//! Forwarding requests to the real network

use std::future::Future;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::cassette::{Headers, HttpRequest, HttpResponse};
use crate::{ReelError, Result};

/// The live network as seen by the mode controller
pub trait Upstream: Send + Sync + 'static {
    /// Send `request` to its destination and return the full response
    ///
    /// # Errors
    ///
    /// Returns `Network` if the request cannot be delivered
    fn forward(&self, request: &HttpRequest) -> impl Future<Output = Result<HttpResponse>> + Send;
}

/// Plain-HTTP upstream backed by a pooled hyper client
pub struct HttpUpstream {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpUpstream {
    /// Create a new HTTP upstream
    #[must_use]
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build_http();

        Self { client }
    }

    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let uri = request
            .url
            .parse::<Uri>()
            .map_err(|e| ReelError::Network(format!("Invalid URI '{}': {e}", request.url)))?;

        if uri.scheme_str() != Some("http") {
            return Err(ReelError::Network(format!(
                "Unsupported upstream scheme in '{}'",
                request.url
            )));
        }

        debug!("Forwarding {} to {}", request.method, uri);

        // Parse method
        let method = request.method.parse::<Method>().map_err(|e| {
            ReelError::Network(format!("Invalid HTTP method '{}': {e}", request.method))
        })?;

        // Build request
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        let body = request.body.clone().unwrap_or_default();
        let http_request = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ReelError::Network(format!("Failed to build request: {e}")))?;

        // Send request
        let response = self.client.request(http_request).await.map_err(|e| {
            warn!("Request failed: {e}");
            ReelError::Network(format!("Request failed: {e}"))
        })?;

        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        // Read body
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ReelError::Network(format!("Failed to read response body: {e}")))?
            .to_bytes();

        Ok(HttpResponse {
            status,
            headers,
            body: (!body.is_empty()).then(|| body.to_vec()),
        })
    }
}

impl Default for HttpUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl Upstream for HttpUpstream {
    fn forward(&self, request: &HttpRequest) -> impl Future<Output = Result<HttpResponse>> + Send {
        self.send(request)
    }
}
