use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::trace;
use tokio::task::JoinHandle;

use crate::backend::{format_number, parse_number, Backend, ZsetAdmission};
use crate::clock::Clock;
use crate::types::Result;

#[derive(Debug, Clone)]
enum Slot {
    Value(Vec<u8>),
    /// Sorted by score; ties keep insertion order
    Sorted(Vec<(f64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: f64,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

/// In-process backend: a hash map guarded by a mutex.
///
/// Sorted sets are score-ordered vectors maintained by binary search. A
/// background sweeper removes expired keys on a configurable cadence;
/// expiry is also enforced on every read, so the sweeper only bounds
/// memory growth.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: Entries,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBackend {
    /// Create a new memory backend. Must be called from within a tokio
    /// runtime when `check_frequency` is non-zero (the sweeper is a tokio
    /// task); a zero cadence disables the sweeper.
    #[must_use]
    pub fn new(check_frequency: Duration, clock: Arc<dyn Clock>) -> Self {
        let entries: Entries = Arc::new(Mutex::new(HashMap::new()));
        let sweeper = (!check_frequency.is_zero()).then(|| {
            let entries = Arc::downgrade(&entries);
            let clock = clock.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(check_frequency);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let Some(entries) = entries.upgrade() else {
                        break;
                    };
                    let now = clock.now();
                    let mut guard = entries.lock().unwrap();
                    let before = guard.len();
                    guard.retain(|_, entry| entry.expires_at > now);
                    let swept = before - guard.len();
                    if swept > 0 {
                        trace!("memory backend swept {swept} expired keys");
                    }
                }
            })
        });
        MemoryBackend {
            entries,
            clock,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Look up a live entry, dropping it if expired.
    /// Caller holds the lock via the closure.
    fn with_live_entry<T>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let now = self.clock.now();
        let mut guard = self.entries.lock().unwrap();
        if guard.get(key).is_some_and(|e| e.expires_at <= now) {
            guard.remove(key);
        }
        f(guard.get_mut(key))
    }

    fn expires(&self, ttl: Duration) -> f64 {
        self.clock.now() + ttl.as_secs_f64()
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.sweeper.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

fn sorted_insert(members: &mut Vec<(f64, String)>, score: f64, member: &str) {
    members.retain(|(_, m)| m != member);
    let at = members.partition_point(|(s, _)| *s <= score);
    members.insert(at, (score, member.to_string()));
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.with_live_entry(key, |entry| match entry {
            Some(Entry {
                slot: Slot::Value(bytes),
                ..
            }) => Some(bytes.clone()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let entry = Entry {
            slot: Slot::Value(value.to_vec()),
            expires_at: self.expires(ttl),
        };
        self.entries.lock().unwrap().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, delta: f64, ttl: Duration) -> Result<f64> {
        let now = self.clock.now();
        let mut guard = self.entries.lock().unwrap();
        if guard.get(key).is_some_and(|e| e.expires_at <= now) {
            guard.remove(key);
        }
        let value = match guard.get_mut(key) {
            Some(entry) => {
                let current = match &entry.slot {
                    Slot::Value(bytes) => parse_number(bytes),
                    Slot::Sorted(_) => 0.0,
                };
                let next = current + delta;
                entry.slot = Slot::Value(format_number(next).into_bytes());
                next
            }
            None => {
                guard.insert(
                    key.to_string(),
                    Entry {
                        slot: Slot::Value(format_number(delta).into_bytes()),
                        expires_at: now + ttl.as_secs_f64(),
                    },
                );
                delta
            }
        };
        Ok(value)
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let expires_at = self.expires(ttl);
        let now = self.clock.now();
        let mut guard = self.entries.lock().unwrap();
        let current = guard.get(key).and_then(|entry| {
            if entry.expires_at <= now {
                return None;
            }
            match &entry.slot {
                Slot::Value(bytes) => Some(bytes.as_slice()),
                Slot::Sorted(_) => None,
            }
        });
        if current != expected {
            return Ok(false);
        }
        guard.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(new.to_vec()),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.expires(ttl);
        let now = self.clock.now();
        let mut guard = self.entries.lock().unwrap();
        let entry = guard
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.expires_at <= now || !matches!(entry.slot, Slot::Sorted(_)) {
                    entry.slot = Slot::Sorted(Vec::new());
                }
                entry.expires_at = expires_at;
            })
            .or_insert_with(|| Entry {
                slot: Slot::Sorted(Vec::new()),
                expires_at,
            });
        if let Slot::Sorted(members) = &mut entry.slot {
            sorted_insert(members, score, member);
        }
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, lo: f64, hi: f64) -> Result<u64> {
        Ok(self.with_live_entry(key, |entry| {
            let Some(Entry {
                slot: Slot::Sorted(members),
                ..
            }) = entry
            else {
                return 0;
            };
            let before = members.len();
            members.retain(|(score, _)| *score < lo || *score > hi);
            (before - members.len()) as u64
        }))
    }

    async fn zcount(&self, key: &str, lo: f64, hi: f64) -> Result<u64> {
        Ok(self.with_live_entry(key, |entry| {
            let Some(Entry {
                slot: Slot::Sorted(members),
                ..
            }) = entry
            else {
                return 0;
            };
            members
                .iter()
                .filter(|(score, _)| *score >= lo && *score <= hi)
                .count() as u64
        }))
    }

    async fn zfirst(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.with_live_entry(key, |entry| {
            let Some(Entry {
                slot: Slot::Sorted(members),
                ..
            }) = entry
            else {
                return None;
            };
            members.first().map(|(score, _)| *score)
        }))
    }

    async fn zprunecard_insert(
        &self,
        key: &str,
        cutoff: f64,
        limit: u64,
        score: f64,
        member: &str,
        ttl: Duration,
    ) -> Result<ZsetAdmission> {
        let expires_at = self.expires(ttl);
        let now = self.clock.now();
        let mut guard = self.entries.lock().unwrap();
        let entry = guard
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.expires_at <= now || !matches!(entry.slot, Slot::Sorted(_)) {
                    entry.slot = Slot::Sorted(Vec::new());
                }
            })
            .or_insert_with(|| Entry {
                slot: Slot::Sorted(Vec::new()),
                expires_at,
            });
        let Slot::Sorted(members) = &mut entry.slot else {
            unreachable!("slot was reset to a sorted set above");
        };
        members.retain(|(s, _)| *s > cutoff);
        if (members.len() as u64) < limit {
            sorted_insert(members, score, member);
            entry.expires_at = expires_at;
            return Ok(ZsetAdmission::Inserted);
        }
        let oldest = members.first().map_or(score, |(s, _)| *s);
        Ok(ZsetAdmission::Full { oldest })
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ManualClock;

    fn backend() -> (MemoryBackend, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(100.0));
        (MemoryBackend::new(Duration::ZERO, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_zadd_updates_existing_member() {
        let (backend, clock) = backend();
        let now = clock.now();
        backend.zadd("z", now, "m", Duration::from_secs(10)).await.unwrap();
        backend
            .zadd("z", now + 5.0, "m", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            backend
                .zcount("z", f64::NEG_INFINITY, f64::INFINITY)
                .await
                .unwrap(),
            1
        );
        assert_eq!(backend.zfirst("z").await.unwrap(), Some(now + 5.0));
    }

    #[tokio::test]
    async fn test_expired_sorted_set_resets() {
        let (backend, clock) = backend();
        backend
            .zadd("z", 1.0, "stale", Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(5.0);
        backend
            .zadd("z", 2.0, "fresh", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            backend
                .zcount("z", f64::NEG_INFINITY, f64::INFINITY)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_keys() {
        let clock = Arc::new(ManualClock::new(100.0));
        let backend = MemoryBackend::new(Duration::from_secs(1), clock.clone());
        backend.set("k", b"v", Duration::from_secs(2)).await.unwrap();
        clock.advance(10.0);
        // let the sweeper fire
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(backend.entries.lock().unwrap().is_empty());
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_incr_keeps_existing_expiry() {
        let (backend, clock) = backend();
        backend.incr("n", 1.0, Duration::from_secs(5)).await.unwrap();
        clock.advance(3.0);
        // a later incr with a longer ttl must not extend the original
        backend.incr("n", 1.0, Duration::from_secs(60)).await.unwrap();
        clock.advance(3.0);
        assert_eq!(backend.get("n").await.unwrap(), None);
    }
}
