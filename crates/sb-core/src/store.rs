//! Tiered per-attribute measurement history.
//!
//! Each sensor actor owns one `TieredStore`. Every attribute keeps two
//! bounded rings, newest at the front: `hot` is walked on every push and
//! must stay cheap; `warm` answers history requests without touching cold
//! storage. `hot ++ warm` is always a single newest-first sequence.

use crate::measurement::Measurement;
use std::collections::{HashMap, VecDeque};

/// One attribute's history: hot and warm rings plus the latest measurement.
#[derive(Debug, Default)]
struct AttributeSeries {
    hot: VecDeque<Measurement>,
    warm: VecDeque<Measurement>,
    last: Option<Measurement>,
}

/// Aggregate counters for one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub hot_entries: usize,
    pub warm_entries: usize,
    pub attributes: usize,
}

/// Bounded hot/warm history for one sensor.
#[derive(Debug)]
pub struct TieredStore {
    hot_capacity: usize,
    warm_capacity: usize,
    series: HashMap<String, AttributeSeries>,
}

impl TieredStore {
    pub fn new(hot_capacity: usize, warm_capacity: usize) -> Self {
        Self {
            hot_capacity: hot_capacity.max(1),
            warm_capacity,
            series: HashMap::new(),
        }
    }

    /// Insert a measurement at the head of the hot ring.
    ///
    /// Hot overflow displaces the oldest hot entries onto the front of warm;
    /// warm overflow evicts its oldest entries, which are returned so the
    /// caller can spool them to cold storage.
    pub fn put(&mut self, m: Measurement) -> Vec<Measurement> {
        let series = self.series.entry(m.attribute_id.clone()).or_default();
        series.last = Some(m.clone());
        series.hot.push_front(m);

        while series.hot.len() > self.hot_capacity {
            // The oldest hot entry is newer than everything in warm.
            let displaced = series.hot.pop_back().expect("hot ring is non-empty");
            series.warm.push_front(displaced);
        }
        let mut evicted = Vec::new();
        while series.warm.len() > self.warm_capacity {
            evicted.push(series.warm.pop_back().expect("warm ring is non-empty"));
        }
        evicted
    }

    /// Newest-first hot entries, truncated to `limit`.
    pub fn hot(&self, attribute_id: &str, limit: Option<usize>) -> Vec<Measurement> {
        let Some(series) = self.series.get(attribute_id) else {
            return Vec::new();
        };
        let take = limit.unwrap_or(usize::MAX);
        series.hot.iter().take(take).cloned().collect()
    }

    /// The newest-first prefix of `hot ++ warm` passing the time filter,
    /// truncated to `limit` (no truncation when absent).
    pub fn range(
        &self,
        attribute_id: &str,
        from: Option<i64>,
        to: Option<i64>,
        limit: Option<usize>,
    ) -> Vec<Measurement> {
        let Some(series) = self.series.get(attribute_id) else {
            return Vec::new();
        };
        let take = limit.unwrap_or(usize::MAX);
        series
            .hot
            .iter()
            .chain(series.warm.iter())
            .filter(|m| from.is_none_or(|f| m.timestamp_ms >= f))
            .filter(|m| to.is_none_or(|t| m.timestamp_ms <= t))
            .take(take)
            .cloned()
            .collect()
    }

    /// The most recent measurement for an attribute.
    pub fn last(&self, attribute_id: &str) -> Option<&Measurement> {
        self.series.get(attribute_id)?.last.as_ref()
    }

    /// Drop an attribute's history entirely. Returns whether it existed.
    pub fn remove_attribute(&mut self, attribute_id: &str) -> bool {
        self.series.remove(attribute_id).is_some()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hot_entries: self.series.values().map(|s| s.hot.len()).sum(),
            warm_entries: self.series.values().map(|s| s.warm.len()).sum(),
            attributes: self.series.len(),
        }
    }

    pub fn attribute_ids(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    /// Entries across both tiers for one attribute.
    pub fn series_len(&self, attribute_id: &str) -> usize {
        self.series
            .get(attribute_id)
            .map_or(0, |s| s.hot.len() + s.warm.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(ts: i64) -> Measurement {
        Measurement {
            attribute_id: "heartrate".to_owned(),
            payload: serde_json::json!(ts),
            timestamp_ms: ts,
            event: None,
        }
    }

    fn timestamps(ms: &[Measurement]) -> Vec<i64> {
        ms.iter().map(|m| m.timestamp_ms).collect()
    }

    #[test]
    fn overflow_cascades_hot_to_warm_to_evicted() {
        // HotCap=3, WarmCap=2, six inserts: hot [6,5,4], warm [3,2], ts=1 out.
        let mut store = TieredStore::new(3, 2);
        let mut evicted = Vec::new();
        for ts in 1..=6 {
            evicted.extend(store.put(m(ts)));
        }
        assert_eq!(timestamps(&store.hot("heartrate", None)), vec![6, 5, 4]);
        assert_eq!(
            timestamps(&store.range("heartrate", None, None, None)),
            vec![6, 5, 4, 3, 2]
        );
        assert_eq!(timestamps(&evicted), vec![1]);
    }

    #[test]
    fn capacity_bounds_hold_after_many_inserts() {
        let mut store = TieredStore::new(4, 6);
        for ts in 1..=100 {
            store.put(m(ts));
        }
        let stats = store.stats();
        assert_eq!(stats.hot_entries, 4);
        assert_eq!(stats.warm_entries, 6);
        assert_eq!(stats.attributes, 1);

        // Combined sequence is strictly newest-first.
        let all = store.range("heartrate", None, None, None);
        let ts = timestamps(&all);
        assert!(ts.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn range_applies_time_filter_then_limit() {
        let mut store = TieredStore::new(3, 10);
        for ts in 1..=8 {
            store.put(m(ts));
        }
        assert_eq!(
            timestamps(&store.range("heartrate", Some(3), Some(6), None)),
            vec![6, 5, 4, 3]
        );
        assert_eq!(
            timestamps(&store.range("heartrate", Some(3), Some(6), Some(2))),
            vec![6, 5]
        );
        assert_eq!(
            timestamps(&store.range("heartrate", None, None, Some(3))),
            vec![8, 7, 6]
        );
    }

    #[test]
    fn hot_respects_limit() {
        let mut store = TieredStore::new(5, 5);
        for ts in 1..=5 {
            store.put(m(ts));
        }
        assert_eq!(timestamps(&store.hot("heartrate", Some(2))), vec![5, 4]);
    }

    #[test]
    fn last_tracks_most_recent_insert() {
        let mut store = TieredStore::new(2, 2);
        store.put(m(10));
        store.put(m(11));
        assert_eq!(store.last("heartrate").unwrap().timestamp_ms, 11);
        assert_eq!(store.last("pressure"), None);
    }

    #[test]
    fn remove_attribute_drops_both_tiers() {
        let mut store = TieredStore::new(2, 2);
        for ts in 1..=4 {
            store.put(m(ts));
        }
        assert!(store.remove_attribute("heartrate"));
        assert!(!store.remove_attribute("heartrate"));
        assert_eq!(store.stats().attributes, 0);
        assert!(store.range("heartrate", None, None, None).is_empty());
    }

    #[test]
    fn attributes_are_tracked_independently() {
        let mut store = TieredStore::new(2, 2);
        store.put(m(1));
        store.put(Measurement {
            attribute_id: "pressure".to_owned(),
            payload: serde_json::json!(1013),
            timestamp_ms: 5,
            event: None,
        });
        assert_eq!(store.stats().attributes, 2);
        assert_eq!(store.series_len("heartrate"), 1);
        assert_eq!(store.series_len("pressure"), 1);
    }
}
