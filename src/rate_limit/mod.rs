//! Per-client sliding-window admission control
//!
//! What this module provides
//! - `SlidingWindowLimiter::admit(client)`: at most `limit` admissions per client
//!   inside any trailing `window`
//!
//! Implementation strategy
//! - One `Mutex` over a map from client identity to the timestamps admitted
//!   inside the window (oldest first)
//! - Each admission check reads the clock, prunes, decides and records while
//!   holding the lock, so two callers at the limit cannot both get in and no
//!   caller sees a half-pruned window
//! - Denials only prune; nothing is recorded
//! - Clients whose window has emptied are dropped: by the owner's own checks,
//!   and by a sweep over all clients at most once per `window` during `admit`
//!
//! State is in-memory only and is lost on restart.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::clock::Clock;
use crate::config::RateLimitConfig;

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limit: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    windows: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let last_sweep = clock.now();
        Self {
            limit,
            window,
            clock,
            state: Mutex::new(State {
                windows: HashMap::new(),
                last_sweep,
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.limit, config.window, clock)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit one request for `client` if its window has room.
    pub fn admit(&self, client: &str) -> bool {
        if self.limit == 0 {
            debug!(client, "admission denied: limit is zero");
            return false;
        }

        let mut state = self.lock();
        // Read the time under the lock so each window stays ordered.
        let now = self.clock.now();
        if now.saturating_duration_since(state.last_sweep) >= self.window {
            sweep(&mut state.windows, now, self.window);
            state.last_sweep = now;
        }

        let allowed = match state.windows.get_mut(client) {
            Some(stamps) => {
                prune(stamps, now, self.window);
                if stamps.len() >= self.limit {
                    false
                } else {
                    stamps.push_back(now);
                    true
                }
            }
            None => {
                state
                    .windows
                    .insert(client.to_owned(), VecDeque::from([now]));
                true
            }
        };

        debug!(client, allowed, "admission decision");
        allowed
    }

    /// Admissions still available to `client` in its current window.
    pub fn remaining(&self, client: &str) -> usize {
        let mut state = self.lock();
        let now = self.clock.now();
        let used = match state.windows.get_mut(client) {
            Some(stamps) => {
                prune(stamps, now, self.window);
                stamps.len()
            }
            None => return self.limit,
        };
        if used == 0 {
            state.windows.remove(client);
        }
        self.limit.saturating_sub(used)
    }

    /// Number of client identities currently tracked.
    pub fn active_clients(&self) -> usize {
        self.lock().windows.len()
    }

    /// Drop every client whose window is empty after pruning.
    ///
    /// Returns how many entries were removed.
    pub fn purge_idle(&self) -> usize {
        let mut state = self.lock();
        let now = self.clock.now();
        let removed = sweep(&mut state.windows, now, self.window);
        state.last_sweep = now;
        if removed > 0 {
            debug!(removed, "purged idle client windows");
        }
        removed
    }

    /// Forget all clients.
    pub fn clear(&self) {
        self.lock().windows.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drop every client whose window is empty after pruning; returns how many.
fn sweep(
    windows: &mut HashMap<String, VecDeque<Instant>>,
    now: Instant,
    window: Duration,
) -> usize {
    let before = windows.len();
    windows.retain(|_, stamps| {
        prune(stamps, now, window);
        !stamps.is_empty()
    });
    before - windows.len()
}

/// Remove timestamps that are `window` or more in the past.
fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = stamps.front() {
        if now.saturating_duration_since(oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}
