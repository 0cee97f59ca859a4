//! Shared helpers for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reel::{EngineConfig, HttpRequest, HttpResponse, ModeController, Result, Upstream};

/// Upstream that answers every request locally and counts calls
#[derive(Default)]
pub struct MockUpstream {
    calls: AtomicUsize,
}

impl MockUpstream {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Upstream for MockUpstream {
    fn forward(&self, request: &HttpRequest) -> impl Future<Output = Result<HttpResponse>> + Send {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let response = HttpResponse::new(200)
            .with_header("Content-Type", "text/plain")
            .with_header("X-Call", n.to_string())
            .with_body(format!("{} {}", request.method, request.url).into_bytes());
        async move { Ok(response) }
    }
}

pub fn controller(dir: &Path) -> (ModeController<MockUpstream>, Arc<MockUpstream>) {
    let upstream = Arc::new(MockUpstream::default());
    let controller = ModeController::new(EngineConfig::new(dir), Arc::clone(&upstream)).unwrap();
    (controller, upstream)
}

pub fn get(url: &str) -> HttpRequest {
    HttpRequest::new("GET", url)
}

/// Record one request per URL into `name`
pub async fn record(dir: &Path, name: &str, urls: &[&str]) {
    let (controller, _) = controller(dir);
    controller.start_recording(name).await.unwrap();
    for url in urls {
        controller.handle_request(&get(url)).await.unwrap();
    }
    controller.stop().await.unwrap();
}
