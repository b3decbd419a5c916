//! Signature & nonce guard.
//!
//! Every inbound directive passes through [`Guard::admit`] before it may
//! reach a node. Checks run cheapest first:
//!
//! 1. timestamp within the clock-skew window, payload within the size limit
//! 2. origin is registered and the signature verifies
//! 3. under the origin's lock: the counter is strictly greater than the last
//!    accepted one and the nonce is not inside the retention window
//! 4. the new counter is persisted, then the window is updated and the
//!    caller's acceptance closure runs, all before the lock is released
//!
//! Step 3 and 4 form one critical section per origin, so two directives
//! carrying the same counter can never both be accepted, and whatever the
//! acceptance closure enqueues is ordered exactly as counters were accepted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::directive::Directive;
use crate::error::{Error, Result};
use crate::registry::Registry;

/// Error type returned by counter stores.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Durable home for the highest accepted counter per origin.
pub trait CounterStore: Send + Sync {
    fn load_counters(&self) -> std::result::Result<Vec<(String, u64)>, StoreError>;
    fn store_counter(&self, origin: &str, counter: u64) -> std::result::Result<(), StoreError>;
}

/// Volatile counter store. Counters are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounterStore {
    fn load_counters(&self) -> std::result::Result<Vec<(String, u64)>, StoreError> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(counters.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }

    fn store_counter(&self, origin: &str, counter: u64) -> std::result::Result<(), StoreError> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(origin.to_string(), counter);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    /// Maximum distance between a directive timestamp and local time.
    pub clock_skew: Duration,
    /// How long a nonce stays in the replay window.
    pub nonce_retention: Duration,
    /// Cap on remembered nonces per origin; the oldest are evicted first.
    pub max_nonces_per_origin: usize,
    /// Maximum size of the compact JSON payload.
    pub max_payload_bytes: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            clock_skew: Duration::from_secs(30),
            nonce_retention: Duration::from_secs(600),
            max_nonces_per_origin: 4096,
            max_payload_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Default)]
struct ReplayWindow {
    last_counter: Option<u64>,
    /// Nonces in arrival order with the local time they were accepted.
    order: VecDeque<([u8; 16], u64)>,
    seen: HashSet<[u8; 16]>,
}

impl ReplayWindow {
    fn prune(&mut self, now: u64, retention_ms: u64) {
        while let Some(&(nonce, seen_at)) = self.order.front() {
            if seen_at.saturating_add(retention_ms) >= now {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&nonce);
        }
    }

    fn check(&self, directive: &Directive) -> Result<()> {
        let counter = directive.sequence_counter();
        if let Some(last) = self.last_counter {
            if counter <= last {
                return Err(Error::ReplayDetected(format!(
                    "sequence counter {counter} from {} is not above {last}",
                    directive.origin()
                )));
            }
        }
        if self.seen.contains(directive.nonce()) {
            return Err(Error::ReplayDetected(format!(
                "nonce {} from {} already seen",
                hex::encode(directive.nonce()),
                directive.origin()
            )));
        }
        Ok(())
    }

    fn record(&mut self, counter: u64, nonce: [u8; 16], now: u64, cap: usize) {
        self.last_counter = Some(counter);
        while self.order.len() >= cap.max(1) {
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back((nonce, now));
        self.seen.insert(nonce);
    }
}

pub struct Guard {
    registry: Arc<Registry>,
    config: GuardConfig,
    store: Arc<dyn CounterStore>,
    windows: HashMap<String, Mutex<ReplayWindow>>,
}

impl Guard {
    /// Build a guard for every origin in the registry, restoring the last
    /// accepted counters from `store`.
    pub fn new(
        registry: Arc<Registry>,
        config: GuardConfig,
        store: Arc<dyn CounterStore>,
    ) -> Result<Self> {
        let persisted: HashMap<String, u64> = store
            .load_counters()
            .map_err(|e| Error::StateUnavailable(format!("loading replay counters: {e}")))?
            .into_iter()
            .collect();

        let windows = registry
            .origins()
            .map(|origin| {
                let window = ReplayWindow {
                    last_counter: persisted.get(origin).copied(),
                    ..ReplayWindow::default()
                };
                (origin.to_string(), Mutex::new(window))
            })
            .collect::<HashMap<_, _>>();

        debug!(
            origins = windows.len(),
            restored = persisted.len(),
            "replay guard initialised"
        );

        Ok(Self {
            registry,
            config,
            store,
            windows,
        })
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Verify and accept a directive with no acceptance action.
    pub fn verify(&self, directive: &Directive) -> Result<()> {
        self.admit(directive, || ())
    }

    /// Verify a directive and, if accepted, run `on_accept` inside the
    /// origin's critical section.
    pub fn admit<R>(&self, directive: &Directive, on_accept: impl FnOnce() -> R) -> Result<R> {
        self.admit_at(directive, crate::now_millis(), on_accept)
    }

    fn admit_at<R>(
        &self,
        directive: &Directive,
        now: u64,
        on_accept: impl FnOnce() -> R,
    ) -> Result<R> {
        self.check_envelope(directive, now)?;

        let origin = directive.origin();
        let key = self.registry.origin_key(origin).ok_or_else(|| {
            warn!(origin, "directive from unknown origin");
            Error::AuthFailure(format!("unknown origin {origin}"))
        })?;
        if let Err(e) = directive.verify_signature(key) {
            warn!(origin, id = %directive.id(), "directive signature rejected");
            return Err(e);
        }

        let slot = self
            .windows
            .get(origin)
            .ok_or_else(|| Error::AuthFailure(format!("unknown origin {origin}")))?;
        let mut window = slot.lock().unwrap_or_else(PoisonError::into_inner);

        window.prune(now, duration_ms(self.config.nonce_retention));
        if let Err(e) = window.check(directive) {
            warn!(origin, id = %directive.id(), counter = directive.sequence_counter(), "replay rejected");
            return Err(e);
        }

        let counter = directive.sequence_counter();
        self.store.store_counter(origin, counter).map_err(|e| {
            warn!(origin, counter, error = %e, "failed to persist replay counter");
            Error::StateUnavailable(format!("persisting counter for {origin}: {e}"))
        })?;
        window.record(
            counter,
            *directive.nonce(),
            now,
            self.config.max_nonces_per_origin,
        );
        debug!(origin, counter, id = %directive.id(), "directive accepted");

        Ok(on_accept())
    }

    fn check_envelope(&self, directive: &Directive, now: u64) -> Result<()> {
        let skew = duration_ms(self.config.clock_skew);
        let ts = directive.timestamp();
        if ts.saturating_add(skew) < now {
            return Err(Error::MalformedEnvelope(format!(
                "stale timestamp: {}ms behind local clock",
                now - ts
            )));
        }
        if ts > now.saturating_add(skew) {
            return Err(Error::MalformedEnvelope(format!(
                "future-dated timestamp: {}ms ahead of local clock",
                ts - now
            )));
        }
        let size = directive.payload().to_string().len();
        if size > self.config.max_payload_bytes {
            return Err(Error::MalformedEnvelope(format!(
                "payload is {size} bytes, limit {}",
                self.config.max_payload_bytes
            )));
        }
        Ok(())
    }

    /// Highest accepted counter for an origin.
    pub fn last_counter(&self, origin: &str) -> Option<u64> {
        self.windows
            .get(origin)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_counter
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
