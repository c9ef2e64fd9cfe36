//! Correlation of pending HTTP responses with protocol identifiers.
//!
//! A [`Handle`] owns the sending half of a one-shot slot; the request that
//! created it keeps the [`PendingResponse`]. Handles are keyed either by nonce
//! (non-general messages, FIFO per key) or by request id (general messages,
//! unique). Resolution removes the handle, so a second resolution for the same
//! request is a [`CorrelationError::NoOpenHandle`].
//!
//! Every handle carries a generation stamp. Cleanup of a specific request uses
//! its stamp, so it never consumes a newer handle that shares the key.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::context::{BridgeResponse, RequestContext};
use crate::error::{CorrelationError, Error, Result};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// What a pending request eventually receives.
pub type ResponseResult = Result<BridgeResponse>;

/// Key a handle is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// Nonce of a handshake message.
    NonGeneral(String),
    /// Base64 request id of a general message.
    General(String),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::NonGeneral(key) => write!(f, "nonce {}", key),
            CorrelationKey::General(key) => write!(f, "request id {}", key),
        }
    }
}

/// A pending HTTP response awaiting the authentication engine.
pub struct Handle {
    context: RequestContext,
    responder: oneshot::Sender<ResponseResult>,
    generation: u64,
    created_at: Instant,
}

impl Handle {
    /// Create a handle and the receiving end kept by the request.
    pub fn new(context: RequestContext) -> (Handle, PendingResponse) {
        let (responder, receiver) = oneshot::channel();
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let handle = Handle {
            context,
            responder,
            generation,
            created_at: Instant::now(),
        };
        (handle, PendingResponse { receiver, generation })
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }

    /// Deliver the response. Returns false when the request already gave up.
    pub fn respond(self, result: ResponseResult) -> bool {
        self.responder.send(result).is_ok()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("request", &self.context.id)
            .field("path", &self.context.path)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Receiving half of a handle, held by the request that created it.
#[derive(Debug)]
pub struct PendingResponse {
    receiver: oneshot::Receiver<ResponseResult>,
    generation: u64,
}

impl PendingResponse {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The response, if the handle has been resolved.
    pub fn try_take(&mut self) -> Option<ResponseResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Internal(
                "pending handle dropped without a response".to_string(),
            ))),
        }
    }
}

/// Counts returned by a sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepCount {
    pub non_general: usize,
    pub general: usize,
}

impl SweepCount {
    pub fn total(&self) -> usize {
        self.non_general + self.general
    }
}

/// Thread-safe registry of pending handles.
pub struct HandleRegistry {
    non_general: DashMap<String, VecDeque<Handle>>,
    general: DashMap<String, Handle>,
    ttl: Duration,
}

impl HandleRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            non_general: DashMap::new(),
            general: DashMap::new(),
            ttl,
        }
    }

    /// Append to the FIFO list for `key`.
    pub fn register_non_general(&self, key: &str, handle: Handle) {
        debug!(key, generation = handle.generation, "registering non-general handle");
        self.non_general
            .entry(key.to_string())
            .or_default()
            .push_back(handle);
    }

    /// Insert under a request id that must not already be in flight.
    pub fn register_general(&self, key: &str, handle: Handle) -> Result<()> {
        match self.general.entry(key.to_string()) {
            Entry::Occupied(_) => {
                Err(CorrelationError::DuplicateCorrelationId(key.to_string()).into())
            }
            Entry::Vacant(entry) => {
                debug!(key, generation = handle.generation, "registering general handle");
                entry.insert(handle);
                Ok(())
            }
        }
    }

    /// Pop the oldest handle for `key`.
    pub fn resolve_non_general(&self, key: &str) -> Result<Handle> {
        let handle = match self.non_general.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let handle = entry.get_mut().pop_front();
                if entry.get().is_empty() {
                    entry.remove();
                }
                handle
            }
            Entry::Vacant(_) => None,
        };
        handle.ok_or_else(|| CorrelationError::NoOpenHandle(key.to_string()).into())
    }

    /// Remove the handle for a request id.
    pub fn resolve_general(&self, key: &str) -> Result<Handle> {
        self.general
            .remove(key)
            .map(|(_, handle)| handle)
            .ok_or_else(|| CorrelationError::NoOpenHandle(key.to_string()).into())
    }

    /// Remove one specific handle without resolving it through the engine.
    pub fn cancel(&self, key: &CorrelationKey, generation: u64) -> Option<Handle> {
        match key {
            CorrelationKey::General(key) => self
                .general
                .remove_if(key, |_, handle| handle.generation == generation)
                .map(|(_, handle)| handle),
            CorrelationKey::NonGeneral(key) => match self.non_general.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let queue = entry.get_mut();
                    let handle = queue
                        .iter()
                        .position(|handle| handle.generation == generation)
                        .and_then(|index| queue.remove(index));
                    if entry.get().is_empty() {
                        entry.remove();
                    }
                    handle
                }
                Entry::Vacant(_) => None,
            },
        }
    }

    /// Expire handles older than the TTL, answering each with a timeout.
    pub fn sweep_expired(&self, now: Instant) -> SweepCount {
        let mut expired = Vec::new();
        let mut count = SweepCount::default();

        let keys: Vec<String> = self.general.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self
                .general
                .remove_if(&key, |_, handle| handle.is_expired(now, self.ttl))
            {
                count.general += 1;
                expired.push((CorrelationKey::General(key), handle));
            }
        }

        let keys: Vec<String> = self.non_general.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Entry::Occupied(mut entry) = self.non_general.entry(key.clone()) {
                let queue = std::mem::take(entry.get_mut());
                let (stale, live): (VecDeque<Handle>, VecDeque<Handle>) = queue
                    .into_iter()
                    .partition(|handle| handle.is_expired(now, self.ttl));
                if live.is_empty() {
                    entry.remove();
                } else {
                    *entry.get_mut() = live;
                }
                count.non_general += stale.len();
                expired.extend(
                    stale
                        .into_iter()
                        .map(|handle| (CorrelationKey::NonGeneral(key.clone()), handle)),
                );
            }
        }

        for (key, handle) in expired {
            warn!(%key, request = %handle.context.id, "pending handle expired");
            let message = format!("no response for {} within {:?}", key, self.ttl);
            handle.respond(Err(Error::Timeout(message)));
        }
        count
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.general.len()
            + self
                .non_general
                .iter()
                .map(|entry| entry.value().len())
                .sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};

    fn handle(path: &str) -> (Handle, PendingResponse) {
        Handle::new(RequestContext::new(Method::POST, path))
    }

    fn response(status: StatusCode) -> BridgeResponse {
        let mut response = BridgeResponse::new(bytes::Bytes::new());
        *response.status_mut() = status;
        response
    }

    #[test]
    fn test_non_general_fifo() {
        let registry = HandleRegistry::new(Duration::from_secs(30));
        let paths = ["/first", "/second", "/third"];
        for path in paths {
            let (h, _pending) = handle(path);
            registry.register_non_general("nonce", h);
        }
        assert_eq!(registry.len(), 3);

        for path in paths {
            let resolved = registry.resolve_non_general("nonce").unwrap();
            assert_eq!(resolved.context().path, path);
        }
        assert!(matches!(
            registry.resolve_non_general("nonce"),
            Err(Error::Correlation(CorrelationError::NoOpenHandle(_)))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_general_resolves_once() {
        let registry = HandleRegistry::new(Duration::from_secs(30));
        let (h, mut pending) = handle("/api");
        registry.register_general("id", h).unwrap();

        let resolved = registry.resolve_general("id").unwrap();
        assert!(resolved.respond(Ok(response(StatusCode::OK))));
        assert_eq!(
            pending.try_take().unwrap().unwrap().status(),
            StatusCode::OK
        );

        assert!(matches!(
            registry.resolve_general("id"),
            Err(Error::Correlation(CorrelationError::NoOpenHandle(_)))
        ));
    }

    #[test]
    fn test_duplicate_general_key() {
        let registry = HandleRegistry::new(Duration::from_secs(30));
        let (h1, _p1) = handle("/a");
        let (h2, _p2) = handle("/b");
        registry.register_general("id", h1).unwrap();
        assert!(matches!(
            registry.register_general("id", h2),
            Err(Error::Correlation(CorrelationError::DuplicateCorrelationId(_)))
        ));
        assert_eq!(registry.resolve_general("id").unwrap().context().path, "/a");
    }

    #[test]
    fn test_cancel_only_removes_matching_generation() {
        let registry = HandleRegistry::new(Duration::from_secs(30));
        let (h1, p1) = handle("/old");
        let (h2, _p2) = handle("/new");
        registry.register_non_general("nonce", h1);
        registry.register_non_general("nonce", h2);

        let key = CorrelationKey::NonGeneral("nonce".to_string());
        let cancelled = registry.cancel(&key, p1.generation()).unwrap();
        assert_eq!(cancelled.context().path, "/old");
        assert!(registry.cancel(&key, p1.generation()).is_none());
        assert_eq!(registry.resolve_non_general("nonce").unwrap().context().path, "/new");

        let (h3, p3) = handle("/general");
        registry.register_general("id", h3).unwrap();
        let key = CorrelationKey::General("id".to_string());
        assert!(registry.cancel(&key, p3.generation() + 1).is_none());
        assert!(registry.cancel(&key, p3.generation()).is_some());
    }

    #[test]
    fn test_sweep_times_out_stale_handles() {
        let registry = HandleRegistry::new(Duration::from_secs(5));
        let (h1, mut p1) = handle("/handshake");
        let (h2, mut p2) = handle("/api");
        registry.register_non_general("nonce", h1);
        registry.register_general("id", h2).unwrap();

        assert_eq!(registry.sweep_expired(Instant::now()).total(), 0);
        assert!(p1.try_take().is_none());

        let later = Instant::now() + Duration::from_secs(6);
        let count = registry.sweep_expired(later);
        assert_eq!(count, SweepCount { non_general: 1, general: 1 });
        assert!(registry.is_empty());
        assert!(matches!(p1.try_take(), Some(Err(Error::Timeout(_)))));
        assert!(matches!(p2.try_take(), Some(Err(Error::Timeout(_)))));
    }

    #[test]
    fn test_dropped_handle_reports_closed() {
        let (h, mut pending) = handle("/x");
        assert!(pending.try_take().is_none());
        drop(h);
        assert!(matches!(pending.try_take(), Some(Err(Error::Internal(_)))));
    }

    #[test]
    fn test_concurrent_registration() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(HandleRegistry::new(Duration::from_secs(30)));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for j in 0..50 {
                        let (h, _p) = handle("/c");
                        registry.register_non_general("shared", h);
                        let (g, _p) = handle("/g");
                        registry
                            .register_general(&format!("{}-{}", i, j), g)
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(registry.len(), 800);
        for _ in 0..400 {
            registry.resolve_non_general("shared").unwrap();
        }
        assert!(registry.resolve_non_general("shared").is_err());
    }
}
