//! Shared buffer between the collector and the publisher.
//!
//! The collector merges each tick's readings under the lock; the publisher
//! swaps the whole map out. Neither side does I/O while holding the lock.

use std::{
    collections::HashMap,
    mem,
    sync::{Mutex, MutexGuard},
};

use tracing::trace;

use super::sensors::types::{Reading, SeriesKey, Values};

/// Samples buffered for one `(group, name)` since the last drain.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub topic: String,
    pub precision: u32,
    pub values: Values,
}

/// Contents handed to the publisher by [`LatestDataStore::drain`].
pub type Batch = HashMap<SeriesKey, Series>;

#[derive(Debug, Default)]
pub struct LatestDataStore {
    inner: Mutex<Batch>,
}

impl LatestDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one tick's readings under a single lock acquisition.
    ///
    /// A new key becomes a new series. For an existing key the values are
    /// unioned in; on a shared timestamp the incoming value wins, and the
    /// incoming topic and precision replace the stored ones.
    pub fn merge(&self, readings: Vec<Reading>) -> usize {
        let mut inner = self.lock();
        let mut merged = 0;

        for reading in readings {
            if reading.values.is_empty() {
                continue;
            }
            let key = reading.key();
            trace!(key = %key, samples = reading.values.len(), "Merging reading");
            merged += reading.values.len();

            match inner.get_mut(&key) {
                Some(series) => {
                    series.topic = reading.topic;
                    series.precision = reading.precision;
                    series.values.extend(reading.values);
                }
                None => {
                    inner.insert(
                        key,
                        Series {
                            topic: reading.topic,
                            precision: reading.precision,
                            values: reading.values,
                        },
                    );
                }
            }
        }

        merged
    }

    /// Takes everything buffered so far and leaves an empty buffer behind.
    pub fn drain(&self) -> Batch {
        mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic elsewhere cannot leave the map half-merged: every mutation
    // above completes before the guard drops.
    fn lock(&self) -> MutexGuard<'_, Batch> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn reading(name: &str, samples: &[(i64, f64)]) -> Reading {
        Reading {
            group: "air".into(),
            name: name.into(),
            unit: None,
            precision: 1,
            topic: format!("sensors/air/{}", name),
            values: samples.iter().copied().collect(),
        }
    }

    fn key(name: &str) -> SeriesKey {
        SeriesKey {
            group: "air".into(),
            name: name.into(),
        }
    }

    #[test]
    fn test_merge_disjoint_timestamps_is_union() {
        let store = LatestDataStore::new();
        store.merge(vec![reading("temp", &[(1, 20.0)])]);
        store.merge(vec![reading("temp", &[(2, 21.0)])]);

        let batch = store.drain();
        assert_eq!(batch[&key("temp")].values, Values::from([(1, 20.0), (2, 21.0)]));
    }

    #[test]
    fn test_merge_shared_timestamp_last_writer_wins() {
        let store = LatestDataStore::new();
        store.merge(vec![reading("temp", &[(1, 20.0)])]);
        store.merge(vec![reading("temp", &[(1, 25.0)])]);

        let batch = store.drain();
        assert_eq!(batch[&key("temp")].values, Values::from([(1, 25.0)]));
    }

    #[test]
    fn test_empty_readings_create_no_series() {
        let store = LatestDataStore::new();
        assert_eq!(store.merge(vec![reading("temp", &[])]), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_drain_leaves_store_empty() {
        let store = LatestDataStore::new();
        store.merge(vec![reading("temp", &[(1, 20.0)]), reading("hum", &[(1, 40.0)])]);
        assert_eq!(store.len(), 2);

        assert_eq!(store.drain().len(), 2);
        assert!(store.is_empty());
        assert!(store.drain().is_empty());
    }

    #[test]
    fn test_concurrent_merge_and_drain_lose_nothing() {
        let store = Arc::new(LatestDataStore::new());
        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for ts in 0..1000 {
                    store.merge(vec![reading("temp", &[(ts, ts as f64)])]);
                }
            })
        };

        let mut seen = Values::new();
        while !writer.is_finished() {
            for (_, series) in store.drain() {
                for (ts, value) in series.values {
                    assert!(seen.insert(ts, value).is_none(), "sample {ts} drained twice");
                }
            }
        }
        writer.join().unwrap();
        for (_, series) in store.drain() {
            for (ts, value) in series.values {
                assert!(seen.insert(ts, value).is_none(), "sample {ts} drained twice");
            }
        }

        assert_eq!(seen.len(), 1000);
    }
}
