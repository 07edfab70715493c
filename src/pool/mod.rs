//! Hot-swappable set of live upstream proxies.
//!
//! The pool owns failure accounting and selection; it never dials anything
//! itself. `update` replaces the whole entry set atomically, selection and
//! the mark operations are linearizable behind one read-write lock, and the
//! round-robin cursor is an atomic advanced exactly once per call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;
use tracing::info;

use crate::config::Strategy;

/// One live upstream held by a pool.
///
/// `id` is the selection-layer identity (`host:port` for directly dialed
/// upstreams, `n-<12hex>` for nodes routed through the tunnel adapter).
/// The data plane only ever reads `dial_addr` and the credentials.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: String,
    pub dial_addr: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub latency: Duration,
    pub last_checked_at: Option<SystemTime>,

    failures: u32,
    disabled_until: Option<Instant>,
}

impl Entry {
    pub fn new(id: impl Into<String>, dial_addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dial_addr: dial_addr.into(),
            username: None,
            password: None,
            latency: Duration::ZERO,
            last_checked_at: None,
            failures: 0,
            disabled_until: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration, checked_at: SystemTime) -> Self {
        self.latency = latency;
        self.last_checked_at = Some(checked_at);
        self
    }

    fn eligible(&self, now: Instant) -> bool {
        match self.disabled_until {
            None => true,
            Some(t) => now >= t,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub total: usize,
    pub disabled: usize,
    pub last_checked: Option<SystemTime>,
    pub has_any_active: bool,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

pub struct Pool {
    name: String,
    inner: RwLock<Inner>,
    rr: AtomicU64,
    updating: AtomicBool,
}

impl Pool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(Inner::default()),
            rr: AtomicU64::new(0),
            updating: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Single-flight admission for the refresh loop. Returns true when the
    /// caller won the slot and must later call `updating_clear`.
    pub fn updating_cas(&self) -> bool {
        self.updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn updating_clear(&self) {
        self.updating.store(false, Ordering::Release);
    }

    /// Atomically replace the entry set and reset the round-robin cursor.
    pub fn update(&self, entries: Vec<Entry>) {
        let mut inner = self.inner.write().unwrap();
        let old_count = inner.entries.len();
        inner.index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        inner.entries = entries;
        self.rr.store(0, Ordering::Release);
        info!(
            pool = %self.name,
            old = old_count,
            new = inner.entries.len(),
            "pool updated"
        );
    }

    /// Select an eligible entry under the given strategy, or None when no
    /// entry is currently usable.
    pub fn next(&self, strategy: Strategy, now: Instant) -> Option<Entry> {
        let inner = self.inner.read().unwrap();
        if inner.entries.is_empty() {
            return None;
        }

        match strategy {
            Strategy::Random => {
                let mut rng = rand::thread_rng();
                for _ in 0..inner.entries.len() {
                    let e = &inner.entries[rng.gen_range(0..inner.entries.len())];
                    if e.eligible(now) {
                        return Some(e.clone());
                    }
                }
                None
            }
            Strategy::RoundRobin => {
                let eligible: Vec<&Entry> =
                    inner.entries.iter().filter(|e| e.eligible(now)).collect();
                if eligible.is_empty() {
                    return None;
                }
                let c = self.rr.fetch_add(1, Ordering::AcqRel);
                Some(eligible[(c % eligible.len() as u64) as usize].clone())
            }
        }
    }

    /// Look up an entry by id, even if it is currently disabled. Callers
    /// pinning an explicit upstream own the eligibility decision.
    pub fn get(&self, id: &str, _now: Instant) -> Option<Entry> {
        let inner = self.inner.read().unwrap();
        inner
            .index
            .get(id)
            .map(|&i| inner.entries[i].clone())
    }

    /// Clone of every currently-eligible entry, for rendezvous ranking.
    pub fn snapshot_active(&self, now: Instant) -> Vec<Entry> {
        let inner = self.inner.read().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| e.eligible(now))
            .cloned()
            .collect()
    }

    pub fn mark_success(&self, id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(&i) = inner.index.get(id) {
            inner.entries[i].failures = 0;
            inner.entries[i].disabled_until = None;
        }
    }

    /// Record a failure: on the k-th consecutive failure the entry is
    /// disabled for min(base * 2^(k-1), max). Unknown ids are ignored, so a
    /// late failure report never resurrects a removed entry.
    pub fn mark_failure(&self, id: &str, now: Instant, base: Duration, max: Duration) {
        let mut inner = self.inner.write().unwrap();
        let i = match inner.index.get(id) {
            Some(&i) => i,
            None => return,
        };

        inner.entries[i].failures += 1;
        let failures = inner.entries[i].failures;

        let mut backoff = base;
        for _ in 1..failures {
            backoff *= 2;
            if backoff >= max {
                backoff = max;
                break;
            }
        }
        inner.entries[i].disabled_until = Some(now + backoff);
    }

    pub fn stats(&self, now: Instant) -> Stats {
        let inner = self.inner.read().unwrap();
        let mut disabled = 0;
        let mut active = 0;
        let mut last: Option<SystemTime> = None;
        for e in &inner.entries {
            if let Some(t) = e.last_checked_at {
                if last.map_or(true, |l| t > l) {
                    last = Some(t);
                }
            }
            if e.eligible(now) {
                active += 1;
            } else {
                disabled += 1;
            }
        }
        Stats {
            total: inner.entries.len(),
            disabled,
            last_checked: last,
            has_any_active: active > 0,
        }
    }
}

/// 64-bit FNV-1a over the session key and entry id, separated so that
/// ("ab","c") and ("a","bc") hash differently.
fn rendezvous_score(session_key: &str, id: &str) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut h = OFFSET;
    for &b in session_key.as_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h ^= 0xff;
    h = h.wrapping_mul(PRIME);
    for &b in id.as_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

/// Highest-random-weight pick over `candidates` for `session_key`, skipping
/// ids in `exclude`. Ties break toward the lexicographically smaller id so
/// the result is total-ordered and stable across processes.
pub fn pick_rendezvous<'a>(
    candidates: &'a [Entry],
    session_key: &str,
    exclude: Option<&HashSet<String>>,
) -> Option<&'a Entry> {
    let mut best: Option<(&Entry, u64)> = None;
    for e in candidates {
        if exclude.map_or(false, |x| x.contains(&e.id)) {
            continue;
        }
        let score = rendezvous_score(session_key, &e.id);
        best = match best {
            None => Some((e, score)),
            Some((b, bs)) => {
                if score > bs || (score == bs && e.id < b.id) {
                    Some((e, score))
                } else {
                    Some((b, bs))
                }
            }
        };
    }
    best.map(|(e, _)| e)
}
