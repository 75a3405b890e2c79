//! Per-sandbox expiration timers (C3).
//!
//! Each live sandbox has exactly one scheduled timer. Renewal cancels the
//! previous timer and installs a new one atomically under a single mutex;
//! no runtime I/O happens while the mutex is held.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Callback invoked when a sandbox's timer fires: locate the runtime object
/// by id and forcibly terminate it.
pub type ExpireFn = Arc<dyn Fn(String) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

struct Tracked {
    expires_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Tracks one timer per sandbox id.
pub struct ExpirationTracker {
    timers: Mutex<HashMap<String, Tracked>>,
    on_expire: ExpireFn,
}

impl ExpirationTracker {
    pub fn new(on_expire: ExpireFn) -> Arc<Self> {
        Arc::new(Self {
            timers: Mutex::new(HashMap::new()),
            on_expire,
        })
    }

    /// Cancel any existing timer for `id` and install a new one that fires
    /// at `expires_at` (clamped to "now" if already past).
    pub fn schedule(self: &Arc<Self>, id: String, expires_at: DateTime<Utc>) {
        let delay = (expires_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        let this = Arc::clone(self);
        let fire_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire(fire_id).await;
        });

        let mut timers = self.timers.lock().expect("expiration tracker mutex poisoned");
        if let Some(previous) = timers.insert(id, Tracked { expires_at, handle }) {
            previous.handle.abort();
        }
    }

    async fn fire(self: Arc<Self>, id: String) {
        // `schedule` aborts the previous handle on replacement, so if this
        // task is still running it is the current timer for `id`.
        {
            let mut timers = self.timers.lock().expect("expiration tracker mutex poisoned");
            timers.remove(&id);
        }
        info!(sandbox = %id, "expiration timer fired, terminating sandbox");
        (self.on_expire)(id).await;
    }

    /// Cancel the timer for `id`, if any. Called on explicit delete so
    /// tracker entries never outlive the runtime object.
    pub fn cancel(&self, id: &str) {
        let mut timers = self.timers.lock().expect("expiration tracker mutex poisoned");
        if let Some(tracked) = timers.remove(id) {
            tracked.handle.abort();
        }
    }

    /// Currently scheduled deadline for `id`, if tracked.
    pub fn tracked_expiration(&self, id: &str) -> Option<DateTime<Utc>> {
        let timers = self.timers.lock().expect("expiration tracker mutex poisoned");
        timers.get(id).map(|t| t.expires_at)
    }

    /// Seed the tracker from a snapshot of existing runtime objects taken at
    /// startup. Already-expired deadlines are reaped inline (fire
    /// immediately); the rest are scheduled normally. Objects with no known
    /// deadline are skipped and logged, never implicitly expired.
    pub fn restore(self: &Arc<Self>, deadlines: Vec<(String, Option<DateTime<Utc>>)>) {
        let now = Utc::now();
        for (id, deadline) in deadlines {
            match deadline {
                Some(expires_at) => self.schedule(id, expires_at.max(now)),
                None => warn!(sandbox = %id, "no expiration label found on restore, skipping"),
            }
        }
    }
}
