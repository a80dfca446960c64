use crate::error::IngestError;
use crate::geo::haversine_m;
use crate::model::{LatLng, SensorFacts, SensorFamily};
use crate::store::TsStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use xxhash_rust::xxh3::xxh3_64;

const SHARD_COUNT: usize = 16;
const CACHE_CAPACITY: usize = 50_000;
const REFRESH_AFTER: Duration = Duration::from_secs(60);
const DRIFT_THRESHOLD_M: f64 = 50.0;

/// Persistence seam for the registry; the production backend is the
/// time-series store, tests inject a fake.
#[async_trait]
pub trait RegistryBackend: Send + Sync + 'static {
    async fn upsert_sensor(&self, facts: &SensorFacts) -> Result<(), sqlx::Error>;
    async fn record_location(
        &self,
        id: &str,
        location: LatLng,
        observed_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error>;
}

#[async_trait]
impl RegistryBackend for TsStore {
    async fn upsert_sensor(&self, facts: &SensorFacts) -> Result<(), sqlx::Error> {
        TsStore::upsert_sensor(self, facts).await
    }

    async fn record_location(
        &self,
        id: &str,
        location: LatLng,
        observed_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        self.record_sensor_location(id, location, observed_at).await
    }
}

/// Published when a sensor moves beyond the drift threshold.
#[derive(Debug, Clone)]
pub struct LocationUpdate {
    pub sensor_id: String,
    pub family: SensorFamily,
    pub location: LatLng,
    pub observed_at: DateTime<Utc>,
}

struct CacheEntry {
    refreshed_at: Instant,
    location: Option<LatLng>,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashSet<String>,
}

/// First-sight registration and freshness upkeep for sensor rows. The only
/// component that mints `Sensor` registry state; decoders just derive ids.
pub struct SensorRegistry<B: RegistryBackend> {
    backend: Arc<B>,
    shards: Vec<Arc<Mutex<Shard>>>,
    location_tx: Option<mpsc::UnboundedSender<LocationUpdate>>,
}

impl<B: RegistryBackend> SensorRegistry<B> {
    pub fn new(backend: Arc<B>, location_tx: Option<mpsc::UnboundedSender<LocationUpdate>>) -> Self {
        Self {
            backend,
            shards: (0..SHARD_COUNT)
                .map(|_| Arc::new(Mutex::new(Shard::default())))
                .collect(),
            location_tx,
        }
    }

    fn shard_for(&self, id: &str) -> &Arc<Mutex<Shard>> {
        let index = (xxh3_64(id.as_bytes()) as usize) % SHARD_COUNT;
        &self.shards[index]
    }

    pub fn cached_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().expect("registry shard lock").entries.len())
            .sum()
    }

    /// Keeps the registry row fresh for one observation. First sight is
    /// registered synchronously (the reading must never become visible
    /// before its sensor row); later sightings refresh asynchronously,
    /// coalesced per key so a chatty sensor costs one upsert per minute.
    pub async fn observe(&self, facts: &SensorFacts) -> Result<(), IngestError> {
        enum Action {
            Register,
            Refresh,
            None,
        }

        let (action, known_location) = {
            let shard = self.shard_for(&facts.id);
            let mut shard = shard.lock().expect("registry shard lock");
            match shard.entries.get(&facts.id) {
                None => (Action::Register, None),
                Some(entry) => {
                    let location = entry.location;
                    if entry.refreshed_at.elapsed() > REFRESH_AFTER
                        && !shard.in_flight.contains(&facts.id)
                    {
                        shard.in_flight.insert(facts.id.clone());
                        (Action::Refresh, location)
                    } else {
                        (Action::None, location)
                    }
                }
            }
        };

        match action {
            Action::Register => {
                self.backend.upsert_sensor(facts).await?;
                self.insert_entry(facts);
            }
            Action::Refresh => {
                let backend = self.backend.clone();
                let shard = self.shard_for(&facts.id).clone();
                let facts_clone = facts.clone();
                tokio::spawn(async move {
                    if let Err(err) = backend.upsert_sensor(&facts_clone).await {
                        tracing::warn!(sensor_id = %facts_clone.id, error = %err, "registry refresh failed");
                    }
                    let mut shard = shard.lock().expect("registry shard lock");
                    shard.in_flight.remove(&facts_clone.id);
                    if let Some(entry) = shard.entries.get_mut(&facts_clone.id) {
                        entry.refreshed_at = Instant::now();
                    }
                });
            }
            Action::None => {}
        }

        self.check_drift(facts, known_location).await?;
        Ok(())
    }

    async fn check_drift(
        &self,
        facts: &SensorFacts,
        known_location: Option<LatLng>,
    ) -> Result<(), IngestError> {
        let Some(observed) = facts.location else {
            return Ok(());
        };
        let moved = match known_location {
            Some(known) => haversine_m(known, observed) > DRIFT_THRESHOLD_M,
            None => false,
        };
        if moved {
            self.backend
                .record_location(&facts.id, observed, facts.seen_at)
                .await?;
            if let Some(tx) = &self.location_tx {
                let _ = tx.send(LocationUpdate {
                    sensor_id: facts.id.clone(),
                    family: facts.family,
                    location: observed,
                    observed_at: facts.seen_at,
                });
            }
        }

        // Track the freshest coordinates either way.
        let shard = self.shard_for(&facts.id);
        let mut shard = shard.lock().expect("registry shard lock");
        if let Some(entry) = shard.entries.get_mut(&facts.id) {
            entry.location = Some(observed);
        }
        Ok(())
    }

    fn insert_entry(&self, facts: &SensorFacts) {
        let shard = self.shard_for(&facts.id);
        let mut shard = shard.lock().expect("registry shard lock");
        if shard.entries.len() >= CACHE_CAPACITY / SHARD_COUNT {
            let oldest = shard
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.refreshed_at)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                shard.entries.remove(&id);
            }
        }
        shard.entries.insert(
            facts.id.clone(),
            CacheEntry {
                refreshed_at: Instant::now(),
                location: facts.location,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeBackend {
        upserts: AtomicUsize,
        locations: Mutex<Vec<(String, LatLng)>>,
    }

    #[async_trait]
    impl RegistryBackend for FakeBackend {
        async fn upsert_sensor(&self, _facts: &SensorFacts) -> Result<(), sqlx::Error> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn record_location(
            &self,
            id: &str,
            location: LatLng,
            _observed_at: DateTime<Utc>,
        ) -> Result<(), sqlx::Error> {
            self.locations
                .lock()
                .expect("lock")
                .push((id.to_string(), location));
            Ok(())
        }
    }

    fn facts(id: &str, location: Option<LatLng>) -> SensorFacts {
        SensorFacts {
            id: id.to_string(),
            family: SensorFamily::WaterLevel,
            manufacturer: "RID-R".to_string(),
            seen_at: Utc::now(),
            location,
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn first_sight_registers_synchronously() {
        let backend = Arc::new(FakeBackend::default());
        let registry = SensorRegistry::new(backend.clone(), None);
        registry
            .observe(&facts("WL-1A2B3C4D5E6F", None))
            .await
            .unwrap();
        assert_eq!(backend.upserts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.cached_count(), 1);
    }

    #[tokio::test]
    async fn repeat_sightings_within_the_window_are_coalesced() {
        let backend = Arc::new(FakeBackend::default());
        let registry = SensorRegistry::new(backend.clone(), None);
        for _ in 0..5 {
            registry
                .observe(&facts("WL-1A2B3C4D5E6F", None))
                .await
                .unwrap();
        }
        assert_eq!(backend.upserts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn small_wobble_does_not_move_the_sensor() {
        let backend = Arc::new(FakeBackend::default());
        let registry = SensorRegistry::new(backend.clone(), None);
        let origin = LatLng {
            lat: 13.94551,
            lng: 100.73405,
        };
        registry
            .observe(&facts("MS-00003-00013", Some(origin)))
            .await
            .unwrap();
        // ~10 m away.
        let nearby = LatLng {
            lat: 13.94560,
            lng: 100.73405,
        };
        registry
            .observe(&facts("MS-00003-00013", Some(nearby)))
            .await
            .unwrap();
        assert!(backend.locations.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn drift_beyond_threshold_records_history_and_publishes() {
        let backend = Arc::new(FakeBackend::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = SensorRegistry::new(backend.clone(), Some(tx));
        let origin = LatLng {
            lat: 13.94551,
            lng: 100.73405,
        };
        registry
            .observe(&facts("MS-00003-00013", Some(origin)))
            .await
            .unwrap();
        // ~110 m north.
        let moved = LatLng {
            lat: 13.94650,
            lng: 100.73405,
        };
        registry
            .observe(&facts("MS-00003-00013", Some(moved)))
            .await
            .unwrap();

        let recorded = backend.locations.lock().expect("lock").clone();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "MS-00003-00013");

        let event = rx.try_recv().expect("location event");
        assert_eq!(event.sensor_id, "MS-00003-00013");
        assert!((event.location.lat - moved.lat).abs() < 1e-12);
    }

    #[tokio::test]
    async fn distinct_sensors_land_in_their_own_cache_slots() {
        let backend = Arc::new(FakeBackend::default());
        let registry = SensorRegistry::new(backend.clone(), None);
        for i in 0..100 {
            registry
                .observe(&facts(&format!("MS-00003-{i:05}"), None))
                .await
                .unwrap();
        }
        assert_eq!(registry.cached_count(), 100);
        assert_eq!(backend.upserts.load(Ordering::SeqCst), 100);
    }
}
