//! Request collapsing
//!
//! One registry per location tracks in-flight origin fetches by cache key
//! so that N concurrent misses for the same key produce one fetch. The
//! first caller to `start` a key becomes the leader and must fetch; later
//! callers become followers and `wait` for the leader's `stop` to
//! broadcast the result. `stop` must run on every leader exit path,
//! including fetch failure, so followers are never stranded.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Marker delivered to followers when the leader's fetch failed.
///
/// Distinct from a successful empty body: followers surface an upstream
/// error instead of serving zero bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchFailed;

/// What a leader hands to its followers
pub type Delivery = Result<Bytes, FetchFailed>;

#[derive(Debug)]
struct Target {
    active: bool,
    waiting: usize,
    tx: broadcast::Sender<Delivery>,
    /// Receivers subscribed at `start` time, claimed by `wait`. Subscribing
    /// under the registry lock is what makes start/stop race-free: a
    /// follower admitted before `stop` always observes the broadcast.
    pending: Vec<broadcast::Receiver<Delivery>>,
}

impl Target {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            active: false,
            waiting: 0,
            tx,
            pending: Vec::new(),
        }
    }
}

/// Per-location registry of in-flight fetches
#[derive(Debug)]
pub struct CollapseRegistry {
    targets: Mutex<HashMap<String, Target>>,
}

impl CollapseRegistry {
    pub fn new() -> Self {
        Self {
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Claim or join the in-flight fetch for `key`.
    ///
    /// Returns `true` when the caller becomes the leader (no fetch was in
    /// flight) and must fetch from the origin, then `stop`. Returns
    /// `false` when a fetch is already active; the caller is registered as
    /// a waiter and must `wait`.
    pub fn start(&self, key: &str) -> bool {
        let mut targets = self.targets.lock();
        let target = targets.entry(key.to_string()).or_insert_with(Target::new);
        if !target.active {
            target.active = true;
            return true;
        }
        target.waiting += 1;
        target.pending.push(target.tx.subscribe());
        false
    }

    /// Block until the leader for `key` delivers its result.
    ///
    /// Must follow a `start` that returned `false`; each such call
    /// receives exactly one delivery.
    pub async fn wait(&self, key: &str) -> Delivery {
        let rx = {
            let mut targets = self.targets.lock();
            targets.get_mut(key).and_then(|t| t.pending.pop())
        };
        match rx {
            Some(mut rx) => rx.recv().await.unwrap_or(Err(FetchFailed)),
            None => Err(FetchFailed),
        }
    }

    /// Release the key, delivering `delivery` to every follower registered
    /// so far. Unknown keys are ignored rather than treated as an error.
    pub fn stop(&self, key: &str, delivery: Delivery) {
        let mut targets = self.targets.lock();
        if let Some(target) = targets.get_mut(key) {
            target.active = false;
            if target.waiting > 0 {
                let _ = target.tx.send(delivery);
                target.waiting = 0;
            }
        }
    }

    /// Drop inactive targets with no waiters, returning the count removed.
    ///
    /// Targets are created lazily and kept after use; this bounds the map
    /// without changing collapse semantics, since a compacted key's next
    /// `start` recreates its target from scratch.
    pub fn compact(&self) -> usize {
        let mut targets = self.targets.lock();
        let before = targets.len();
        targets.retain(|_, t| t.active || t.waiting > 0);
        before - targets.len()
    }

    /// Number of tracked targets (active or idle)
    pub fn target_count(&self) -> usize {
        self.targets.lock().len()
    }

    /// Number of keys with a fetch currently in flight
    pub fn in_flight(&self) -> usize {
        self.targets.lock().values().filter(|t| t.active).count()
    }
}

impl Default for CollapseRegistry {
    fn default() -> Self {
        Self::new()
    }
}
