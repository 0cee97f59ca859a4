//! Mode controller: the per-cassette state machine that routes every request

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cassette::{
    host_of, Cassette, Cookie, HttpRequest, HttpResponse, InteractionKind, WebSocketExchange,
};
use crate::config::{EngineConfig, LatencyMode, Mode};
use crate::filter::RecordingFilter;
use crate::fingerprint;
use crate::matcher::{Consumption, InteractionRef, MatchOutcome, MatchStats, Matcher};
use crate::storage::CassetteStore;
use crate::upstream::Upstream;
use crate::{ReelError, Result};

/// Observable controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    /// No cassette bound
    Idle,
    /// Forwarding live and appending
    Recording,
    /// Replaying with optional network fallback
    Replaying,
    /// Replaying, misses are errors
    ReplayingStrict,
    /// Replaying, each interaction answers once
    ReplayingOnce,
    /// Forwarding live, nothing recorded or matched
    Passthrough,
}

impl fmt::Display for ModeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Replaying => "replaying",
            Self::ReplayingStrict => "replaying (strict)",
            Self::ReplayingOnce => "replaying (once)",
            Self::Passthrough => "passthrough",
        };
        f.write_str(name)
    }
}

/// Snapshot of a controller for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Current state
    pub state: ModeState,
    /// Bound cassette name
    pub cassette: Option<String>,
    /// Interactions in the in-memory cassette
    pub interactions: usize,
    /// Interactions consumed under once semantics
    pub consumed: usize,
    /// Matcher hit/miss counters
    pub stats: MatchStats,
}

/// A cassette bound to a running session
struct Active {
    cassette: Cassette,
    matcher: Matcher,
    consumption: Consumption,
    /// A file for this cassette existed when the session started
    existed: bool,
}

impl Active {
    fn new(cassette: Cassette, existed: bool, config: &EngineConfig) -> Self {
        let matcher = Matcher::build(&cassette, config.replay.body_tie_break);
        let consumption = Consumption::new(cassette.len());
        Self {
            cassette,
            matcher,
            consumption,
            existed,
        }
    }

    fn append(&mut self, kind: InteractionKind, response_time_ms: Option<u64>) -> usize {
        let index = self.cassette.push(kind, response_time_ms);
        self.matcher.insert(index, &self.cassette.interactions[index]);
        index
    }
}

enum State {
    Idle,
    Recording(Active),
    Replaying(Active),
    ReplayingStrict(Active),
    ReplayingOnce(Active),
    Passthrough,
}

impl State {
    fn name(&self) -> ModeState {
        match self {
            Self::Idle => ModeState::Idle,
            Self::Recording(_) => ModeState::Recording,
            Self::Replaying(_) => ModeState::Replaying,
            Self::ReplayingStrict(_) => ModeState::ReplayingStrict,
            Self::ReplayingOnce(_) => ModeState::ReplayingOnce,
            Self::Passthrough => ModeState::Passthrough,
        }
    }

    fn active(&self) -> Option<&Active> {
        match self {
            Self::Recording(a)
            | Self::Replaying(a)
            | Self::ReplayingStrict(a)
            | Self::ReplayingOnce(a) => Some(a),
            Self::Idle | Self::Passthrough => None,
        }
    }
}

/// What to do with a request once the state lock is released
enum Plan {
    Respond {
        response: HttpResponse,
        delay: Option<Duration>,
    },
    Forward,
}

/// Per-cassette state machine.
///
/// Matching and appending happen under `state`; the upstream call does not.
/// Every transition takes `gate` for writing, so it waits until all
/// in-flight requests (which hold it for reading) have finished.
pub struct ModeController<U: Upstream> {
    config: EngineConfig,
    store: CassetteStore,
    filter: RecordingFilter,
    upstream: Arc<U>,
    state: Mutex<State>,
    gate: RwLock<()>,
}

impl<U: Upstream> ModeController<U> {
    /// Create an idle controller
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: EngineConfig, upstream: Arc<U>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: CassetteStore::new(config.cassette_dir.clone(), config.format),
            filter: RecordingFilter::from_config(&config),
            config,
            upstream,
            state: Mutex::new(State::Idle),
            gate: RwLock::new(()),
        })
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cassette store used by this controller
    #[must_use]
    pub fn store(&self) -> &CassetteStore {
        &self.store
    }

    /// Current state
    pub async fn state(&self) -> ModeState {
        self.state.lock().await.name()
    }

    /// Snapshot for diagnostics
    pub async fn status(&self) -> Status {
        let state = self.state.lock().await;
        let active = state.active();
        Status {
            state: state.name(),
            cassette: active.map(|a| a.cassette.name.clone()),
            interactions: active.map_or(0, |a| a.cassette.len()),
            consumed: active.map_or(0, |a| a.consumption.consumed_count()),
            stats: active.map_or_else(MatchStats::default, |a| a.matcher.stats()),
        }
    }

    /// Start recording into `name`
    ///
    /// # Errors
    ///
    /// Returns error if a session is already active or an existing cassette
    /// cannot be loaded
    pub async fn start_recording(&self, name: &str) -> Result<()> {
        self.start(Mode::Record, name).await
    }

    /// Replay `name`, falling back to the network on a miss if allowed
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the cassette does not exist
    pub async fn replay(&self, name: &str) -> Result<()> {
        self.start(Mode::Replay, name).await
    }

    /// Replay `name`; misses fail without touching the network
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the cassette does not exist
    pub async fn replay_strict(&self, name: &str) -> Result<()> {
        self.start(Mode::ReplayStrict, name).await
    }

    /// Strict replay of `name` where each interaction answers once
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the cassette does not exist
    pub async fn once(&self, name: &str) -> Result<()> {
        self.start(Mode::Once, name).await
    }

    /// Replay `name` if it exists, record it otherwise
    ///
    /// # Errors
    ///
    /// Returns error if the cassette exists but cannot be loaded
    pub async fn auto(&self, name: &str) -> Result<()> {
        self.start(Mode::Auto, name).await
    }

    /// Alias for [`ModeController::auto`]
    ///
    /// # Errors
    ///
    /// See [`ModeController::auto`]
    pub async fn hybrid(&self, name: &str) -> Result<()> {
        self.auto(name).await
    }

    /// Start a session in `mode` bound to `name`
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a cassette session is already active, plus
    /// any error from loading the cassette
    pub async fn start(&self, mode: Mode, name: &str) -> Result<()> {
        if mode == Mode::Passthrough {
            return self.passthrough().await;
        }

        let _gate = self.gate.write().await;
        let mut state = self.state.lock().await;

        if !matches!(*state, State::Idle | State::Passthrough) {
            return Err(ReelError::InvalidState(format!(
                "cannot start '{name}': already {}",
                state.name()
            )));
        }

        let next = self.open(mode, name)?;
        info!("Session '{}' started: {}", name, next.name());
        *state = next;
        Ok(())
    }

    fn open(&self, mode: Mode, name: &str) -> Result<State> {
        match mode {
            Mode::Record => {
                let existed = self.store.exists(name)?;
                let cassette = if existed && !self.config.recording.overwrite {
                    self.store.load(name)?
                } else {
                    Cassette::new(name)
                };
                Ok(State::Recording(Active::new(cassette, existed, &self.config)))
            }
            Mode::Replay => Ok(State::Replaying(self.load_active(name)?)),
            Mode::ReplayStrict => Ok(State::ReplayingStrict(self.load_active(name)?)),
            Mode::Once => Ok(State::ReplayingOnce(self.load_active(name)?)),
            Mode::Auto => {
                let resolved = if self.store.exists(name)? {
                    Mode::Replay
                } else {
                    Mode::Record
                };
                debug!("Auto mode for '{}' resolved to {:?}", name, resolved);
                self.open(resolved, name)
            }
            Mode::Passthrough => Ok(State::Passthrough),
        }
    }

    fn load_active(&self, name: &str) -> Result<Active> {
        let cassette = self.store.load(name)?;
        Ok(Active::new(cassette, true, &self.config))
    }

    /// Forward every request live, ending any cassette session first
    ///
    /// # Errors
    ///
    /// Returns error if ending a recording session fails to persist it; the
    /// controller then stays in its recording state
    pub async fn passthrough(&self) -> Result<()> {
        let _gate = self.gate.write().await;
        let mut state = self.state.lock().await;

        match *state {
            State::Passthrough => return Ok(()),
            State::Idle => {}
            _ => self.close(&mut state)?,
        }

        info!("Passthrough enabled");
        *state = State::Passthrough;
        Ok(())
    }

    /// End the session, persisting a recording, after in-flight requests drain
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when idle, or the storage error if persisting
    /// fails; on failure the session stays active so the caller can retry
    pub async fn stop(&self) -> Result<()> {
        let _gate = self.gate.write().await;
        let mut state = self.state.lock().await;
        self.close(&mut state)
    }

    fn close(&self, state: &mut State) -> Result<()> {
        match &*state {
            State::Idle => {
                return Err(ReelError::InvalidState(
                    "stop called with no active session".to_string(),
                ))
            }
            State::Recording(active) => {
                if active.existed || !active.cassette.is_empty() {
                    self.store.save(&active.cassette)?;
                } else {
                    debug!(
                        "Nothing recorded for '{}', not persisting",
                        active.cassette.name
                    );
                }
            }
            State::Replaying(active)
            | State::ReplayingStrict(active)
            | State::ReplayingOnce(active) => {
                let stats = active.matcher.stats();
                info!(
                    "Replay of '{}' finished: {} hits, {} misses",
                    active.cassette.name, stats.hits, stats.misses
                );
            }
            State::Passthrough => {}
        }

        *state = State::Idle;
        Ok(())
    }

    /// Return to idle without waiting for in-flight requests.
    ///
    /// A recording is discarded unless `best_effort_flush` is set. Requests
    /// still in flight complete against the network but are not recorded.
    ///
    /// # Errors
    ///
    /// Returns the storage error if a requested flush fails; the controller
    /// is idle either way
    pub async fn abort(&self, best_effort_flush: bool) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock().await, State::Idle);

        match previous {
            State::Recording(active) if best_effort_flush => {
                warn!(
                    "Aborting '{}', flushing {} interactions",
                    active.cassette.name,
                    active.cassette.len()
                );
                self.store.save(&active.cassette)
            }
            State::Idle => Ok(()),
            other => {
                if let Some(active) = other.active() {
                    warn!("Aborting '{}' without persisting", active.cassette.name);
                }
                Ok(())
            }
        }
    }

    /// Answer one intercepted HTTP request
    ///
    /// # Errors
    ///
    /// - `InvalidState` when idle
    /// - `DataTooLarge` if the body exceeds `limits.max_request_size`
    /// - `NoMatch`/`AlreadyConsumed` from the replay states
    /// - `Network` if forwarding fails
    pub async fn handle_request(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let _gate = self.gate.read().await;

        let limit = self.config.limits.max_request_size;
        if request.body_len() > limit {
            return Err(ReelError::DataTooLarge {
                size: request.body_len(),
                limit,
            });
        }

        let plan = {
            let mut state = self.state.lock().await;
            self.plan(&mut state, request)?
        };

        match plan {
            Plan::Respond { response, delay } => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(response)
            }
            Plan::Forward => {
                let started = Instant::now();
                let response = self.upstream.forward(request).await?;
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

                let mut state = self.state.lock().await;
                self.record_http(&mut state, request, &response, elapsed_ms);
                Ok(response)
            }
        }
    }

    fn plan(&self, state: &mut State, request: &HttpRequest) -> Result<Plan> {
        let lookup = self.filter.matchable(request);
        match state {
            State::Idle => Err(ReelError::InvalidState(format!(
                "no active session for {} {}",
                request.method, request.url
            ))),
            State::Recording(_) | State::Passthrough => Ok(Plan::Forward),
            State::Replaying(active) => match active.matcher.find(&active.cassette, &lookup) {
                Some(hit) => self.respond(hit, request),
                None if self.config.replay.allow_network_fallback => {
                    warn!(
                        "Replay miss {} {} ({}), falling back to network",
                        request.method,
                        request.url,
                        fingerprint::short_hex(&fingerprint::fingerprint_request(&lookup))
                    );
                    Ok(Plan::Forward)
                }
                None => Err(no_match(request)),
            },
            State::ReplayingStrict(active) => match active.matcher.find(&active.cassette, &lookup) {
                Some(hit) => self.respond(hit, request),
                None => Err(no_match(request)),
            },
            State::ReplayingOnce(active) => {
                match active.matcher.find_and_consume(
                    &active.cassette,
                    &lookup,
                    &mut active.consumption,
                ) {
                    MatchOutcome::Hit(index) => self.respond(
                        InteractionRef {
                            index,
                            interaction: &active.cassette.interactions[index],
                        },
                        request,
                    ),
                    MatchOutcome::Exhausted => {
                        debug!("All candidates consumed for {} {}", request.method, request.url);
                        Err(ReelError::AlreadyConsumed {
                            method: request.method.clone(),
                            url: request.url.clone(),
                        })
                    }
                    MatchOutcome::Miss => Err(no_match(request)),
                }
            }
        }
    }

    fn respond(&self, hit: InteractionRef<'_>, request: &HttpRequest) -> Result<Plan> {
        let response = hit.response().ok_or_else(|| no_match(request))?.clone();

        debug!(
            "Replay hit {} {} -> #{} ({})",
            request.method,
            request.url,
            hit.index,
            response.status
        );

        let delay = match self.config.replay.latency {
            LatencyMode::None => None,
            LatencyMode::Recorded => hit.interaction.response_time_ms.map(Duration::from_millis),
            LatencyMode::Fixed { ms } => Some(Duration::from_millis(ms)),
        }
        .filter(|d| !d.is_zero());

        Ok(Plan::Respond { response, delay })
    }

    fn record_http(
        &self,
        state: &mut State,
        request: &HttpRequest,
        response: &HttpResponse,
        elapsed_ms: u64,
    ) {
        let (active, capture_cookies) = match state {
            State::Recording(active) => (active, true),
            State::Replaying(active) => (active, false),
            _ => return,
        };

        if let Some(reason) = self.filter.skip_reason(response) {
            debug!(
                "Not recording {} {}: {:?}",
                request.method, request.url, reason
            );
            return;
        }

        let request = self.filter.redact_request(request);
        let response = self.filter.redact_response(response);

        if capture_cookies {
            capture_set_cookies(&mut active.cassette, &request.url, &response);
        }

        let index = active.append(InteractionKind::Http { request, response }, Some(elapsed_ms));
        debug!("Recorded interaction #{} in '{}'", index, active.cassette.name);
    }

    /// Append a finished WebSocket exchange to the recording
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless recording or passing through
    pub async fn record_websocket(&self, exchange: &WebSocketExchange) -> Result<()> {
        let _gate = self.gate.read().await;
        let mut state = self.state.lock().await;

        match &mut *state {
            State::Recording(active) => {
                let exchange = self.filter.redact_websocket(exchange);
                let index = active.append(InteractionKind::WebSocket(exchange), None);
                debug!("Recorded WebSocket exchange #{} in '{}'", index, active.cassette.name);
                Ok(())
            }
            State::Passthrough => Ok(()),
            other => Err(ReelError::InvalidState(format!(
                "cannot record a WebSocket exchange while {}",
                other.name()
            ))),
        }
    }

    /// Recorded WebSocket exchange for `url`
    ///
    /// # Errors
    ///
    /// Returns `NoMatch`/`AlreadyConsumed` on a miss, `InvalidState` outside
    /// the replay states
    pub async fn replay_websocket(&self, url: &str) -> Result<WebSocketExchange> {
        let _gate = self.gate.read().await;
        let mut state = self.state.lock().await;
        let recorded_url = self.filter.redact_url(url);
        let url = recorded_url.as_str();

        let index = match &mut *state {
            State::Replaying(active) | State::ReplayingStrict(active) => active
                .matcher
                .find_websocket(&active.cassette, url)
                .map(|hit| hit.index),
            State::ReplayingOnce(active) => {
                match active.matcher.find_websocket_and_consume(
                    &active.cassette,
                    url,
                    &mut active.consumption,
                ) {
                    MatchOutcome::Hit(index) => Some(index),
                    MatchOutcome::Exhausted => {
                        return Err(ReelError::AlreadyConsumed {
                            method: "GET".to_string(),
                            url: url.to_string(),
                        })
                    }
                    MatchOutcome::Miss => None,
                }
            }
            other => {
                return Err(ReelError::InvalidState(format!(
                    "cannot replay a WebSocket exchange while {}",
                    other.name()
                )))
            }
        };

        let exchange = index
            .and_then(|i| state.active().map(|a| &a.cassette.interactions[i].kind))
            .and_then(|kind| match kind {
                InteractionKind::WebSocket(ws) => Some(ws.clone()),
                InteractionKind::Http { .. } => None,
            });

        exchange.ok_or_else(|| ReelError::NoMatch {
            method: "GET".to_string(),
            url: url.to_string(),
        })
    }
}

fn no_match(request: &HttpRequest) -> ReelError {
    ReelError::NoMatch {
        method: request.method.clone(),
        url: request.url.clone(),
    }
}

fn capture_set_cookies(cassette: &mut Cassette, url: &str, response: &HttpResponse) {
    let host = host_of(url).unwrap_or_default();
    for value in response.headers.get_all("set-cookie") {
        match Cookie::parse(value, &host) {
            Ok(cookie) => cassette.upsert_cookie(cookie),
            Err(e) => warn!("Ignoring Set-Cookie from {url}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    use crate::cassette::{Direction, MessagePayload, WebSocketMessage};

    #[derive(Default)]
    struct MockUpstream {
        calls: AtomicUsize,
        set_cookie: Option<String>,
        status: Option<u16>,
        unreachable: bool,
    }

    impl MockUpstream {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Upstream for MockUpstream {
        fn forward(
            &self,
            request: &HttpRequest,
        ) -> impl Future<Output = Result<HttpResponse>> + Send {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut response = HttpResponse::new(self.status.unwrap_or(200))
                .with_header("X-Call", n.to_string())
                .with_body(format!("live {} {}", request.method, request.url).into_bytes());
            if let Some(cookie) = &self.set_cookie {
                response.headers.append("Set-Cookie", cookie.clone());
            }
            let result = if self.unreachable {
                Err(ReelError::Network("connection refused".to_string()))
            } else {
                Ok(response)
            };
            async move { result }
        }
    }

    fn setup(
        dir: &TempDir,
        upstream: MockUpstream,
    ) -> (ModeController<MockUpstream>, Arc<MockUpstream>) {
        setup_with(EngineConfig::new(dir.path()), upstream)
    }

    fn setup_with(
        config: EngineConfig,
        upstream: MockUpstream,
    ) -> (ModeController<MockUpstream>, Arc<MockUpstream>) {
        let upstream = Arc::new(upstream);
        let controller = ModeController::new(config, Arc::clone(&upstream)).unwrap();
        (controller, upstream)
    }

    fn get(url: &str) -> HttpRequest {
        HttpRequest::new("GET", url)
    }

    async fn record(dir: &TempDir, name: &str, urls: &[&str]) {
        let (controller, _) = setup(dir, MockUpstream::default());
        controller.start_recording(name).await.unwrap();
        for url in urls {
            controller.handle_request(&get(url)).await.unwrap();
        }
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_record_then_replay() {
        let dir = TempDir::new().unwrap();
        let (recorder, upstream) = setup(&dir, MockUpstream::default());

        recorder.start_recording("cycle").await.unwrap();
        assert_eq!(recorder.state().await, ModeState::Recording);
        let live = recorder.handle_request(&get("http://api.test/a")).await.unwrap();
        recorder.stop().await.unwrap();
        assert_eq!(upstream.calls(), 1);
        assert_eq!(recorder.state().await, ModeState::Idle);

        let (player, upstream) = setup(&dir, MockUpstream::default());
        player.replay_strict("cycle").await.unwrap();
        let replayed = player.handle_request(&get("http://api.test/a")).await.unwrap();

        assert_eq!(replayed, live);
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_idle_rejects_requests_and_stop() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir, MockUpstream::default());

        assert!(matches!(
            controller.handle_request(&get("http://api.test/")).await,
            Err(ReelError::InvalidState(_))
        ));
        assert!(matches!(
            controller.stop().await,
            Err(ReelError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_requires_cassette() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir, MockUpstream::default());

        assert!(matches!(
            controller.replay("missing").await,
            Err(ReelError::NotFound(_))
        ));
        assert_eq!(controller.state().await, ModeState::Idle);
    }

    #[tokio::test]
    async fn test_start_while_active_fails() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir, MockUpstream::default());

        controller.start_recording("one").await.unwrap();
        assert!(matches!(
            controller.start_recording("two").await,
            Err(ReelError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_strict_miss_never_forwards() {
        let dir = TempDir::new().unwrap();
        record(&dir, "strict", &["http://api.test/a"]).await;

        let (controller, upstream) = setup(&dir, MockUpstream::default());
        controller.replay_strict("strict").await.unwrap();

        assert!(matches!(
            controller.handle_request(&get("http://api.test/b")).await,
            Err(ReelError::NoMatch { .. })
        ));
        assert_eq!(upstream.calls(), 0);
        assert_eq!(controller.state().await, ModeState::ReplayingStrict);
    }

    #[tokio::test]
    async fn test_lenient_miss_forwards_once_and_never_persists() {
        let dir = TempDir::new().unwrap();
        record(&dir, "lenient", &["http://api.test/a"]).await;
        let before = std::fs::read(dir.path().join("lenient.json")).unwrap();

        let (controller, upstream) = setup(&dir, MockUpstream::default());
        controller.replay("lenient").await.unwrap();

        let first = controller.handle_request(&get("http://api.test/new")).await.unwrap();
        let second = controller.handle_request(&get("http://api.test/new")).await.unwrap();
        assert_eq!(upstream.calls(), 1);
        assert_eq!(first, second);

        controller.stop().await.unwrap();
        let after = std::fs::read(dir.path().join("lenient.json")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_lenient_without_fallback_is_no_match() {
        let dir = TempDir::new().unwrap();
        record(&dir, "nofallback", &["http://api.test/a"]).await;

        let mut config = EngineConfig::new(dir.path());
        config.replay.allow_network_fallback = false;
        let (controller, upstream) = setup_with(config, MockUpstream::default());
        controller.replay("nofallback").await.unwrap();

        assert!(matches!(
            controller.handle_request(&get("http://api.test/zzz")).await,
            Err(ReelError::NoMatch { .. })
        ));
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_once_exhaustion() {
        let dir = TempDir::new().unwrap();
        record(&dir, "once", &["http://api.test/x"]).await;

        let (controller, _) = setup(&dir, MockUpstream::default());
        controller.once("once").await.unwrap();

        controller.handle_request(&get("http://api.test/x")).await.unwrap();
        assert!(matches!(
            controller.handle_request(&get("http://api.test/x")).await,
            Err(ReelError::AlreadyConsumed { .. })
        ));
        assert!(matches!(
            controller.handle_request(&get("http://api.test/y")).await,
            Err(ReelError::NoMatch { .. })
        ));
        assert_eq!(controller.status().await.consumed, 1);
        assert_eq!(controller.state().await, ModeState::ReplayingOnce);
    }

    #[tokio::test]
    async fn test_auto_mode() {
        let dir = TempDir::new().unwrap();

        let (controller, upstream) = setup(&dir, MockUpstream::default());
        controller.auto("auto").await.unwrap();
        assert_eq!(controller.state().await, ModeState::Recording);
        controller.handle_request(&get("http://api.test/a")).await.unwrap();
        controller.stop().await.unwrap();
        assert_eq!(upstream.calls(), 1);

        let (controller, upstream) = setup(&dir, MockUpstream::default());
        controller.hybrid("auto").await.unwrap();
        assert_eq!(controller.state().await, ModeState::Replaying);
        controller.handle_request(&get("http://api.test/a")).await.unwrap();
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_recording_not_persisted() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir, MockUpstream::default());

        controller.start_recording("empty").await.unwrap();
        controller.stop().await.unwrap();

        assert!(!controller.store().exists("empty").unwrap());
    }

    #[tokio::test]
    async fn test_recording_appends_to_existing() {
        let dir = TempDir::new().unwrap();
        record(&dir, "append", &["http://api.test/1"]).await;
        record(&dir, "append", &["http://api.test/2"]).await;

        let (controller, _) = setup(&dir, MockUpstream::default());
        assert_eq!(controller.store().load("append").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_existing() {
        let dir = TempDir::new().unwrap();
        record(&dir, "fresh", &["http://api.test/1", "http://api.test/2"]).await;

        let mut config = EngineConfig::new(dir.path());
        config.recording.overwrite = true;
        let (controller, _) = setup_with(config, MockUpstream::default());
        controller.start_recording("fresh").await.unwrap();
        controller.handle_request(&get("http://api.test/3")).await.unwrap();
        controller.stop().await.unwrap();

        assert_eq!(controller.store().load("fresh").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cookies_captured_while_recording() {
        let dir = TempDir::new().unwrap();
        let upstream = MockUpstream {
            set_cookie: Some("JSESSIONID=abc123; Path=/; HttpOnly".to_string()),
            ..MockUpstream::default()
        };
        let (controller, _) = setup(&dir, upstream);

        controller.start_recording("cookies").await.unwrap();
        controller.handle_request(&get("http://Login.Example.com/login")).await.unwrap();
        controller.handle_request(&get("http://login.example.com/me")).await.unwrap();
        controller.stop().await.unwrap();

        let cassette = controller.store().load("cookies").unwrap();
        assert_eq!(cassette.cookies.len(), 1);
        let cookie = cassette.cookie("JSESSIONID").unwrap();
        assert_eq!(cookie.domain, "login.example.com");
        assert!(cookie.http_only);
    }

    #[tokio::test]
    async fn test_skipped_status_not_recorded() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.recording.skip_status_codes = vec![503];
        let upstream = MockUpstream {
            status: Some(503),
            ..MockUpstream::default()
        };
        let (controller, _) = setup_with(config, upstream);

        controller.start_recording("skip").await.unwrap();
        let response = controller.handle_request(&get("http://api.test/")).await.unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(controller.status().await.interactions, 0);
    }

    #[tokio::test]
    async fn test_redaction_applies_to_cassette_only() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.redaction.headers = vec!["Authorization".to_string()];
        let (controller, _) = setup_with(config, MockUpstream::default());

        controller.start_recording("redact").await.unwrap();
        let request = get("http://api.test/private").with_header("Authorization", "Bearer xyz");
        controller.handle_request(&request).await.unwrap();
        controller.stop().await.unwrap();

        let cassette = controller.store().load("redact").unwrap();
        match &cassette.interactions[0].kind {
            InteractionKind::Http { request, .. } => {
                assert_eq!(request.headers.get("authorization"), Some(crate::filter::REDACTED));
            }
            InteractionKind::WebSocket(_) => panic!("expected HTTP"),
        }
    }

    #[tokio::test]
    async fn test_secret_in_url_replays() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.redaction.secrets = vec!["tok123".to_string()];
        let request = get("http://api.test/data?key=tok123");

        let (recorder, _) = setup_with(config.clone(), MockUpstream::default());
        recorder.start_recording("secret").await.unwrap();
        recorder.handle_request(&request).await.unwrap();
        recorder.stop().await.unwrap();

        let cassette = recorder.store().load("secret").unwrap();
        match &cassette.interactions[0].kind {
            InteractionKind::Http { request, .. } => {
                assert_eq!(request.url, "http://api.test/data?key=[REDACTED]");
            }
            InteractionKind::WebSocket(_) => panic!("expected HTTP"),
        }

        let (player, upstream) = setup_with(config.clone(), MockUpstream::default());
        player.replay_strict("secret").await.unwrap();
        let replayed = player.handle_request(&request).await.unwrap();
        assert_eq!(
            replayed.body.as_deref(),
            Some(&b"live GET http://api.test/data?key=[REDACTED]"[..])
        );
        assert_eq!(upstream.calls(), 0);

        let (lenient, upstream) = setup_with(config, MockUpstream::default());
        lenient.replay("secret").await.unwrap();
        let miss = get("http://api.test/other?key=tok123");
        lenient.handle_request(&miss).await.unwrap();
        lenient.handle_request(&miss).await.unwrap();
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_not_recorded() {
        let dir = TempDir::new().unwrap();
        let upstream = MockUpstream {
            unreachable: true,
            ..MockUpstream::default()
        };
        let (controller, upstream) = setup(&dir, upstream);

        controller.start_recording("offline").await.unwrap();
        assert!(matches!(
            controller.handle_request(&get("http://api.test/")).await,
            Err(ReelError::Network(_))
        ));
        assert_eq!(upstream.calls(), 1);
        assert_eq!(controller.state().await, ModeState::Recording);
        assert_eq!(controller.status().await.interactions, 0);

        controller.stop().await.unwrap();
        assert!(!controller.store().exists("offline").unwrap());
    }

    #[tokio::test]
    async fn test_passthrough() {
        let dir = TempDir::new().unwrap();
        let (controller, upstream) = setup(&dir, MockUpstream::default());

        controller.start_recording("before").await.unwrap();
        controller.handle_request(&get("http://api.test/1")).await.unwrap();
        controller.passthrough().await.unwrap();

        assert_eq!(controller.state().await, ModeState::Passthrough);
        assert!(controller.store().exists("before").unwrap());

        controller.handle_request(&get("http://api.test/2")).await.unwrap();
        assert_eq!(upstream.calls(), 2);
        assert_eq!(controller.status().await.cassette, None);

        controller.stop().await.unwrap();
        assert_eq!(controller.state().await, ModeState::Idle);
    }

    #[tokio::test]
    async fn test_request_too_large() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.limits.max_request_size = 4;
        let (controller, upstream) = setup_with(config, MockUpstream::default());

        controller.start_recording("big").await.unwrap();
        let request = HttpRequest::new("POST", "http://api.test/").with_body(vec![0; 5]);
        assert!(matches!(
            controller.handle_request(&request).await,
            Err(ReelError::DataTooLarge { size: 5, limit: 4 })
        ));
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_session() {
        let dir = TempDir::new().unwrap();
        let cassette_dir = dir.path().join("cassettes");
        std::fs::create_dir(&cassette_dir).unwrap();
        let (controller, _) = setup_with(EngineConfig::new(&cassette_dir), MockUpstream::default());

        controller.start_recording("retry").await.unwrap();
        controller.handle_request(&get("http://api.test/")).await.unwrap();

        std::fs::remove_dir(&cassette_dir).unwrap();
        std::fs::write(&cassette_dir, b"not a directory").unwrap();

        let err = controller.stop().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(controller.state().await, ModeState::Recording);
        assert_eq!(controller.status().await.interactions, 1);

        std::fs::remove_file(&cassette_dir).unwrap();
        controller.stop().await.unwrap();
        assert!(controller.store().exists("retry").unwrap());
    }

    #[tokio::test]
    async fn test_abort_discards_unless_flushed() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir, MockUpstream::default());

        controller.start_recording("aborted").await.unwrap();
        controller.handle_request(&get("http://api.test/")).await.unwrap();
        controller.abort(false).await.unwrap();
        assert_eq!(controller.state().await, ModeState::Idle);
        assert!(!controller.store().exists("aborted").unwrap());

        controller.start_recording("flushed").await.unwrap();
        controller.handle_request(&get("http://api.test/")).await.unwrap();
        controller.abort(true).await.unwrap();
        assert!(controller.store().exists("flushed").unwrap());
    }

    #[tokio::test]
    async fn test_fixed_latency() {
        let dir = TempDir::new().unwrap();
        record(&dir, "slow", &["http://api.test/"]).await;

        let mut config = EngineConfig::new(dir.path());
        config.replay.latency = LatencyMode::Fixed { ms: 30 };
        let (controller, _) = setup_with(config, MockUpstream::default());
        controller.replay("slow").await.unwrap();

        let started = Instant::now();
        controller.handle_request(&get("http://api.test/")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_websocket_record_and_replay() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = setup(&dir, MockUpstream::default());

        let mut exchange = WebSocketExchange::new("ws://chat.test/room");
        exchange.messages.push(WebSocketMessage {
            direction: Direction::Received,
            timestamp_ms: 1,
            payload: MessagePayload::Text("welcome".to_string()),
        });

        controller.start_recording("ws").await.unwrap();
        controller.record_websocket(&exchange).await.unwrap();
        controller.stop().await.unwrap();

        controller.once("ws").await.unwrap();
        assert_eq!(
            controller.replay_websocket("ws://chat.test/room").await.unwrap(),
            exchange
        );
        assert!(matches!(
            controller.replay_websocket("ws://chat.test/room").await,
            Err(ReelError::AlreadyConsumed { .. })
        ));
        assert!(matches!(
            controller.handle_request(&get("ws://chat.test/room")).await,
            Err(ReelError::NoMatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_recording_drains_before_stop() {
        let dir = TempDir::new().unwrap();
        let (controller, upstream) = setup(&dir, MockUpstream::default());
        let controller = Arc::new(controller);

        controller.start_recording("concurrent").await.unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    controller
                        .handle_request(&get(&format!("http://api.test/{i}")))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        controller.stop().await.unwrap();

        assert_eq!(upstream.calls(), 16);
        assert_eq!(controller.store().load("concurrent").unwrap().len(), 16);
    }
}
