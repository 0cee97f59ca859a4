//! Interaction matching: picks the recorded interaction that answers a request

use std::collections::HashMap;

use tracing::debug;

use crate::cassette::{Cassette, HttpRequest, HttpResponse, Interaction, InteractionKind, Protocol};
use crate::config::BodyTieBreak;
use crate::fingerprint::{self, Fingerprint};

/// Borrowed view of a matched interaction
#[derive(Debug, Clone, Copy)]
pub struct InteractionRef<'a> {
    /// Position in `cassette.interactions`
    pub index: usize,
    /// The interaction itself
    pub interaction: &'a Interaction,
}

impl<'a> InteractionRef<'a> {
    /// Recorded HTTP response, `None` for non-HTTP interactions
    #[must_use]
    pub fn response(&self) -> Option<&'a HttpResponse> {
        match &self.interaction.kind {
            InteractionKind::Http { response, .. } => Some(response),
            InteractionKind::WebSocket(_) => None,
        }
    }
}

/// Result of a consuming lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Interaction at this index was selected and is now consumed
    Hit(usize),
    /// Candidates exist but every one was already consumed
    Exhausted,
    /// Nothing recorded matches
    Miss,
}

/// Per-session consumption bookkeeping, never persisted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Consumption {
    consumed: Vec<bool>,
}

impl Consumption {
    /// Nothing consumed yet
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            consumed: vec![false; len],
        }
    }

    /// Whether the interaction at `index` has been consumed
    #[must_use]
    pub fn is_consumed(&self, index: usize) -> bool {
        self.consumed.get(index).copied().unwrap_or(false)
    }

    /// Mark `index` consumed
    pub fn mark(&mut self, index: usize) {
        if index >= self.consumed.len() {
            self.consumed.resize(index + 1, false);
        }
        self.consumed[index] = true;
    }

    /// Number of consumed interactions
    #[must_use]
    pub fn consumed_count(&self) -> usize {
        self.consumed.iter().filter(|c| **c).count()
    }
}

/// Lookup statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchStats {
    /// Requests answered from the cassette
    pub hits: usize,
    /// Requests with no usable interaction
    pub misses: usize,
}

/// Fingerprint index over one cassette
#[derive(Debug, Clone)]
pub struct Matcher {
    /// Map of `(protocol, method, url)` fingerprint to recorded indices, ascending
    index: HashMap<Fingerprint, Vec<usize>>,
    tie_break: BodyTieBreak,
    stats: MatchStats,
}

impl Matcher {
    /// Index every interaction of `cassette`
    #[must_use]
    pub fn build(cassette: &Cassette, tie_break: BodyTieBreak) -> Self {
        let mut matcher = Self {
            index: HashMap::with_capacity(cassette.len()),
            tie_break,
            stats: MatchStats::default(),
        };
        for (i, interaction) in cassette.interactions.iter().enumerate() {
            matcher.insert(i, interaction);
        }
        matcher
    }

    /// Index an interaction appended at position `index`
    pub fn insert(&mut self, index: usize, interaction: &Interaction) {
        let key = fingerprint::fingerprint_interaction(&interaction.kind);
        self.index.entry(key).or_default().push(index);
    }

    /// Find the best recorded interaction for `request` without consuming it
    pub fn find<'a>(
        &mut self,
        cassette: &'a Cassette,
        request: &HttpRequest,
    ) -> Option<InteractionRef<'a>> {
        let selected = self.select(cassette, request, |_| true);
        self.count(selected.is_some());
        selected.map(|index| InteractionRef {
            index,
            interaction: &cassette.interactions[index],
        })
    }

    /// Find the best unconsumed interaction and consume it immediately
    pub fn find_and_consume(
        &mut self,
        cassette: &Cassette,
        request: &HttpRequest,
        consumption: &mut Consumption,
    ) -> MatchOutcome {
        let outcome = match self.select(cassette, request, |i| !consumption.is_consumed(i)) {
            Some(index) => {
                consumption.mark(index);
                MatchOutcome::Hit(index)
            }
            None if self.candidates(cassette, request).next().is_some() => MatchOutcome::Exhausted,
            None => MatchOutcome::Miss,
        };
        self.count(matches!(outcome, MatchOutcome::Hit(_)));
        outcome
    }

    /// Earliest recorded WebSocket exchange for `url`
    pub fn find_websocket<'a>(
        &mut self,
        cassette: &'a Cassette,
        url: &str,
    ) -> Option<InteractionRef<'a>> {
        let selected = self.websocket_candidates(cassette, url).next();
        self.count(selected.is_some());
        selected.map(|index| InteractionRef {
            index,
            interaction: &cassette.interactions[index],
        })
    }

    /// Earliest unconsumed WebSocket exchange for `url`, consumed immediately
    pub fn find_websocket_and_consume(
        &mut self,
        cassette: &Cassette,
        url: &str,
        consumption: &mut Consumption,
    ) -> MatchOutcome {
        let mut seen = false;
        let mut selected = None;
        for index in self.websocket_candidates(cassette, url) {
            seen = true;
            if !consumption.is_consumed(index) {
                selected = Some(index);
                break;
            }
        }

        let outcome = match selected {
            Some(index) => {
                consumption.mark(index);
                MatchOutcome::Hit(index)
            }
            None if seen => MatchOutcome::Exhausted,
            None => MatchOutcome::Miss,
        };
        self.count(matches!(outcome, MatchOutcome::Hit(_)));
        outcome
    }

    /// Lookup statistics so far
    #[must_use]
    pub fn stats(&self) -> MatchStats {
        self.stats
    }

    /// Method+URL candidates in recorded order, re-verified by value
    fn candidates<'c>(
        &'c self,
        cassette: &'c Cassette,
        request: &'c HttpRequest,
    ) -> impl Iterator<Item = usize> + 'c {
        let key = fingerprint::fingerprint_request(request);
        self.index
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(move |&i| match cassette.interactions.get(i).map(|x| &x.kind) {
                Some(InteractionKind::Http { request: recorded, .. }) => {
                    recorded.method.eq_ignore_ascii_case(&request.method)
                        && recorded.url == request.url
                }
                _ => false,
            })
    }

    fn websocket_candidates<'c>(
        &'c self,
        cassette: &'c Cassette,
        url: &'c str,
    ) -> impl Iterator<Item = usize> + 'c {
        let key = fingerprint::fingerprint(Protocol::WebSocket, "GET", url);
        self.index
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(move |&i| {
                matches!(
                    cassette.interactions.get(i).map(|x| &x.kind),
                    Some(InteractionKind::WebSocket(ws)) if ws.url == url
                )
            })
    }

    fn select(
        &self,
        cassette: &Cassette,
        request: &HttpRequest,
        available: impl Fn(usize) -> bool,
    ) -> Option<usize> {
        let mut first = None;
        for index in self.candidates(cassette, request).filter(|&i| available(i)) {
            if self.tie_break == BodyTieBreak::Ignore || request.body.is_none() {
                return Some(index);
            }
            if body_of(cassette, index) == request.body.as_deref() {
                debug!(index, "exact body match");
                return Some(index);
            }
            first.get_or_insert(index);
        }
        first
    }

    fn count(&mut self, hit: bool) {
        if hit {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
    }
}

fn body_of(cassette: &Cassette, index: usize) -> Option<&[u8]> {
    match &cassette.interactions[index].kind {
        InteractionKind::Http { request, .. } => request.body.as_deref(),
        InteractionKind::WebSocket(_) => None,
    }
}
