use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;
use metrics::counter;
use ulid::Ulid;

use crate::limits::MAX_CACHE_ENTRIES_PER_NAMESPACE;
use crate::model::Appointment;
use crate::observability;

// ── Cache Keys ───────────────────────────────────────────────────
//
// Keys are built from the semantic parameters of the read they stand
// for, so identical requests collide on the same entry regardless of
// call order. One namespace per establishment covers both day and
// month reads; a write invalidates the whole namespace.

pub fn appointments_namespace(establishment_id: Ulid) -> String {
    format!("appts:{establishment_id}")
}

fn staff_part(staff: Option<Ulid>) -> String {
    staff.map(|s| s.to_string()).unwrap_or_else(|| "all".into())
}

pub fn day_key(date: NaiveDate, staff: Option<Ulid>) -> String {
    format!("day:{date}:staff:{}", staff_part(staff))
}

pub fn month_key(year: i32, month: u32, staff: Option<Ulid>) -> String {
    format!("month:{year:04}-{month:02}:staff:{}", staff_part(staff))
}

// ── Cache Store ──────────────────────────────────────────────────

#[derive(Clone)]
struct CacheEntry {
    value: Vec<Appointment>,
    expires_at: Instant,
}

/// TTL cache over fetched appointment lists, shared process-wide.
/// Values are the normalized base rows; optimistic local state is
/// layered on top by the caller, never stored here.
pub struct CacheStore {
    entries: DashMap<(String, String), CacheEntry>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Fresh value or miss. Expired entries are misses and are dropped
    /// on the way out.
    pub fn get(&self, namespace: &str, key: &str) -> Option<Vec<Appointment>> {
        let lookup = (namespace.to_string(), key.to_string());
        if let Some(entry) = self.entries.get(&lookup) {
            if entry.expires_at > Instant::now() {
                counter!(observability::CACHE_HITS).increment(1);
                return Some(entry.value.clone());
            }
        } else {
            counter!(observability::CACHE_MISSES).increment(1);
            return None;
        }
        self.entries.remove(&lookup);
        counter!(observability::CACHE_MISSES).increment(1);
        None
    }

    pub fn set(&self, namespace: &str, key: &str, value: Vec<Appointment>, ttl: Duration) {
        let lookup = (namespace.to_string(), key.to_string());
        if !self.entries.contains_key(&lookup) {
            let ns_count = self.entries.iter().filter(|e| e.key().0 == namespace).count();
            if ns_count >= MAX_CACHE_ENTRIES_PER_NAMESPACE {
                self.evict_soonest(namespace);
            }
        }
        self.entries.insert(
            lookup,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop every entry in a namespace. Mutations call this after a
    /// write so the next read re-fetches instead of serving stale data.
    pub fn clear_namespace(&self, namespace: &str) {
        self.entries.retain(|k, _| k.0 != namespace);
    }

    /// Remove expired entries. Returns how many were dropped; the
    /// janitor task calls this periodically.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_soonest(&self, namespace: &str) {
        let victim = self
            .entries
            .iter()
            .filter(|e| e.key().0 == namespace)
            .min_by_key(|e| e.value().expires_at)
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            counter!(observability::CACHE_EVICTIONS).increment(1);
        }
    }
}
