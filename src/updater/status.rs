use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::xray::NodeHealth;

/// Aggregate detail of the most recent refresh, for the admin surface.
#[derive(Debug, Clone, Default)]
pub struct UpdateDetails {
    pub adapter: String,
    pub problems_count: usize,
    pub skipped_by_type: HashMap<String, usize>,
    pub strict_hash: String,
    pub relaxed_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub last_start: Option<SystemTime>,
    pub last_end: Option<SystemTime>,
    pub last_error: Option<String>,
    pub fetched: usize,
    pub strict: usize,
    pub relaxed: usize,
    pub details: UpdateDetails,
    pub relaxed_node_health_at: Option<SystemTime>,
    pub relaxed_node_health: HashMap<String, NodeHealth>,
}

/// Mutex-guarded copy-on-read refresh status. Read-only to everything but
/// the updater.
#[derive(Default)]
pub struct UpdaterStatus {
    inner: Mutex<StatusSnapshot>,
}

impl UpdaterStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_start(&self, t: SystemTime) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_start = Some(t);
    }

    pub fn set_end(
        &self,
        t: SystemTime,
        fetched: usize,
        strict: usize,
        relaxed: usize,
        error: Option<String>,
        details: UpdateDetails,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_end = Some(t);
        inner.fetched = fetched;
        inner.strict = strict;
        inner.relaxed = relaxed;
        inner.last_error = error;
        inner.details = details;
    }

    pub fn set_relaxed_node_health(&self, t: SystemTime, health: HashMap<String, NodeHealth>) {
        let mut inner = self.inner.lock().unwrap();
        inner.relaxed_node_health_at = Some(t);
        inner.relaxed_node_health = health;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.lock().unwrap().clone()
    }
}
