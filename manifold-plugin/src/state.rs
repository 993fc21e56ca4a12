//! The state manager.
//!
//! Owns the authoritative latest-readings table: device id → the
//! most recent batch that device produced. Batches replace wholesale
//! (a tick's readings fully supersede the previous tick's), readers
//! get copies, and each device id has its own lock so readers and
//! writers of distinct devices never contend.
//!
//! Readings also fan out through a broadcast channel for hot
//! streaming, and, when enabled, into a bounded time-windowed cache
//! that serves windowed queries.

use chrono::{DateTime, Utc};
use manifold_api::types::{ReadContext, Reading};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::warn;

const BROADCAST_CAPACITY: usize = 128;

// Upper bound on cached readings; the cache drops its oldest entries
// rather than ever blocking the read path.

const CACHE_CAPACITY: usize = 10_000;

// A time-ordered reading cache with TTL eviction. Insertion order is
// timestamp order because the scheduler stamps readings as it emits
// them.

struct ReadingCache {
    ttl: Duration,
    entries: Mutex<VecDeque<(Instant, Reading)>>,
}

impl ReadingCache {
    fn new(ttl: Duration) -> ReadingCache {
        ReadingCache {
            ttl,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn add(&self, reading: &Reading) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        while let Some((stamp, _)) = entries.front() {
            if *stamp + self.ttl <= now || entries.len() >= CACHE_CAPACITY {
                entries.pop_front();
            } else {
                break;
            }
        }
        entries.push_back((now, reading.clone()))
    }

    // Readings whose timestamps fall in the half-open window
    // [from, until). Either bound may be absent.

    fn filter_between(
        &self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<Reading> {
        let now = Instant::now();

        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(stamp, _)| *stamp + self.ttl > now)
            .map(|(_, reading)| reading)
            .filter(|reading| {
                from.map(|v| reading.timestamp >= v).unwrap_or(true)
                    && until.map(|v| reading.timestamp < v).unwrap_or(true)
            })
            .cloned()
            .collect()
    }
}

pub struct StateManager {
    readings: RwLock<HashMap<String, Arc<Mutex<Vec<Reading>>>>>,
    broadcast: broadcast::Sender<Reading>,
    cache: Option<ReadingCache>,
}

impl StateManager {
    /// Creates the state manager. `cache_ttl` enables the windowed
    /// reading cache.
    pub fn new(cache_ttl: Option<Duration>) -> StateManager {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);

        StateManager {
            readings: RwLock::new(HashMap::new()),
            broadcast,
            cache: cache_ttl.map(ReadingCache::new),
        }
    }

    // The per-device slot, created on the device's first batch.

    fn slot(&self, device: &str) -> Arc<Mutex<Vec<Reading>>> {
        if let Some(slot) = self.readings.read().unwrap().get(device) {
            return slot.clone();
        }

        self.readings
            .write()
            .unwrap()
            .entry(device.into())
            .or_default()
            .clone()
    }

    /// Applies one batch from the scheduler: replaces the device's
    /// current readings wholesale, feeds the hot stream, and appends
    /// to the windowed cache.
    pub fn add_read_context(&self, ctx: ReadContext) {
        for reading in &ctx.readings {
            if let Some(cache) = &self.cache {
                cache.add(reading)
            }

            // Send errors just mean nobody is streaming right now.

            let _ = self.broadcast.send(reading.clone());
        }

        let slot = self.slot(&ctx.device);

        *slot.lock().unwrap() = ctx.readings;
    }

    /// The device's most recent batch. Empty for a device that
    /// hasn't produced anything yet.
    pub fn get_readings(&self, device: &str) -> Vec<Reading> {
        if let Some(slot) = self.readings.read().unwrap().get(device) {
            slot.lock().unwrap().clone()
        } else {
            vec![]
        }
    }

    /// Every device's most recent batch.
    pub fn get_all_readings(&self) -> HashMap<String, Vec<Reading>> {
        self.readings
            .read()
            .unwrap()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.lock().unwrap().clone()))
            .collect()
    }

    /// Subscribes to readings as they arrive. The stream starts at
    /// the moment of subscription; it never replays.
    pub fn subscribe(&self) -> broadcast::Receiver<Reading> {
        self.broadcast.subscribe()
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Windowed query against the reading cache. `None` when the
    /// cache is disabled.
    pub fn cached_between(
        &self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Option<Vec<Reading>> {
        self.cache
            .as_ref()
            .map(|cache| cache.filter_between(from, until))
    }
}

/// Drains the scheduler's read channel into the state manager. Runs
/// for the life of the plugin; exits when the scheduler side closes.
pub async fn run_updater(
    state: Arc<StateManager>,
    mut rx: mpsc::Receiver<ReadContext>,
) {
    while let Some(ctx) = rx.recv().await {
        state.add_read_context(ctx)
    }
    warn!("read pipeline closed; state updater exiting")
}
