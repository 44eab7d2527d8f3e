//! Sliding-window admission control over two independent keyspaces.
//!
//! Each key keeps the exact instants of its admitted events. A call prunes the
//! instants that fell out of the window, then admits only if fewer than
//! `limit` remain. Rejected calls are not recorded.

use crate::clock::{Clock, SystemClock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const PER_IP_LIMIT: usize = 10;
pub const PER_IP_WINDOW: Duration = Duration::from_secs(60);
pub const PER_ADDRESS_LIMIT: usize = 2;
pub const PER_ADDRESS_WINDOW: Duration = Duration::from_secs(60 * 60);
const MAX_TRACKED_KEYS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    Ip,
    Address,
}

impl Keyspace {
    pub fn label(self) -> &'static str {
        match self {
            Keyspace::Ip => "ip",
            Keyspace::Address => "address",
        }
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub limit: usize,
    pub window: Duration,
}

impl WindowLimit {
    pub const fn new(limit: usize, window: Duration) -> Self {
        Self { limit, window }
    }

    pub const fn per_ip() -> Self {
        Self::new(PER_IP_LIMIT, PER_IP_WINDOW)
    }

    pub const fn per_address() -> Self {
        Self::new(PER_ADDRESS_LIMIT, PER_ADDRESS_WINDOW)
    }
}

/// Result of the dual IP-then-address check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(Keyspace),
}

#[derive(Debug)]
struct SlidingWindow {
    limit: WindowLimit,
    hits: HashMap<String, VecDeque<Instant>>,
    /// Key count above which the next call sweeps the map. Doubles past the
    /// live key count after each sweep, so sweeps stay amortized.
    sweep_above: usize,
}

impl SlidingWindow {
    fn new(limit: WindowLimit) -> Self {
        Self {
            limit,
            hits: HashMap::new(),
            sweep_above: MAX_TRACKED_KEYS,
        }
    }

    fn allow(&mut self, key: &str, now: Instant) -> bool {
        if self.hits.len() > self.sweep_above {
            self.sweep(now);
        }
        let cutoff = now.checked_sub(self.limit.window);

        let Some(entry) = self.hits.get_mut(key) else {
            if self.limit.limit == 0 {
                return false;
            }
            self.hits.insert(key.to_string(), VecDeque::from([now]));
            return true;
        };

        prune(entry, cutoff);
        if entry.len() >= self.limit.limit {
            if entry.is_empty() {
                self.hits.remove(key);
            }
            return false;
        }
        entry.push_back(now);
        true
    }

    /// Drops every key whose instants have all left the window.
    fn sweep(&mut self, now: Instant) -> usize {
        let cutoff = now.checked_sub(self.limit.window);
        let before = self.hits.len();
        self.hits.retain(|_, instants| {
            prune(instants, cutoff);
            !instants.is_empty()
        });
        self.sweep_above = MAX_TRACKED_KEYS.max(2 * self.hits.len());
        before - self.hits.len()
    }
}

/// Keeps only instants strictly after `cutoff`. A `None` cutoff means the
/// window reaches back before the clock's origin, so nothing has expired.
fn prune(instants: &mut VecDeque<Instant>, cutoff: Option<Instant>) {
    let Some(cutoff) = cutoff else {
        return;
    };
    while instants.front().is_some_and(|t| *t <= cutoff) {
        instants.pop_front();
    }
}

#[derive(Debug)]
struct Keyspaces {
    ip: SlidingWindow,
    address: SlidingWindow,
}

impl Keyspaces {
    fn get_mut(&mut self, keyspace: Keyspace) -> &mut SlidingWindow {
        match keyspace {
            Keyspace::Ip => &mut self.ip,
            Keyspace::Address => &mut self.address,
        }
    }

    fn get(&self, keyspace: Keyspace) -> &SlidingWindow {
        match keyspace {
            Keyspace::Ip => &self.ip,
            Keyspace::Address => &self.address,
        }
    }
}

/// Admission controller shared by all request handlers.
///
/// One mutex covers both keyspaces, so each `allow` is a single atomic
/// prune-decide-append step.
pub struct AdmissionController {
    state: Mutex<Keyspaces>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    pub fn new(ip: WindowLimit, address: WindowLimit, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(Keyspaces {
                ip: SlidingWindow::new(ip),
                address: SlidingWindow::new(address),
            }),
            clock,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            WindowLimit::per_ip(),
            WindowLimit::per_address(),
            Arc::new(SystemClock),
        )
    }

    pub fn allow(&self, keyspace: Keyspace, key: &str) -> bool {
        let now = self.clock.now();
        self.lock().get_mut(keyspace).allow(key, now)
    }

    /// Checks the IP keyspace, then the address keyspace. An IP rejection
    /// leaves the address keyspace untouched.
    pub fn allow_both(&self, ip: &str, address: &str) -> Admission {
        if !self.allow(Keyspace::Ip, ip) {
            return Admission::Denied(Keyspace::Ip);
        }
        if !self.allow(Keyspace::Address, address) {
            return Admission::Denied(Keyspace::Address);
        }
        Admission::Allowed
    }

    /// Prunes every key in both keyspaces, returning how many keys were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.lock();
        guard.ip.sweep(now) + guard.address.sweep(now)
    }

    pub fn tracked_keys(&self, keyspace: Keyspace) -> usize {
        self.lock().get(keyspace).hits.len()
    }

    /// Instants currently stored for `key`, without pruning.
    pub fn recorded(&self, keyspace: Keyspace, key: &str) -> usize {
        self.lock()
            .get(keyspace)
            .hits
            .get(key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Keyspaces> {
        // The guarded maps stay consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::with_defaults()
    }
}
