// =============================================================================
// Time-Series Manager (component H) — multi-granularity OHLCV aggregation
// =============================================================================
//
// Each series (one per stock) maintains all eight granularities in parallel.
// Ingestion is single-writer-per-series by construction: only the owning
// `Exchange`'s tick hook ever calls `ingest` for a given series id. Readers
// (queries, the push bus) only ever take a read lock.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use super::bucket::{Candle, Granularity};
use crate::errors::EngineError;
use crate::ids::ObjectId;

pub type SeriesId = ObjectId;

/// Default number of finalized candles retained per granularity before the
/// oldest is evicted.
pub const DEFAULT_RETENTION: usize = 5000;

/// Broadcast when a series finalizes or updates its in-progress bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesDelta {
    pub series_id: SeriesId,
    pub granularity: Granularity,
    pub candle: Candle,
}

struct GranularityState {
    history: VecDeque<Candle>,
    current: Option<Candle>,
}

impl GranularityState {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            current: None,
        }
    }
}

struct SeriesState {
    granularities: HashMap<Granularity, GranularityState>,
    last_ts: Option<DateTime<Utc>>,
}

impl SeriesState {
    fn new() -> Self {
        let mut granularities = HashMap::new();
        for g in Granularity::ALL {
            granularities.insert(g, GranularityState::new());
        }
        Self {
            granularities,
            last_ts: None,
        }
    }
}

/// Owns every time series in one market instance.
pub struct TimeSeriesManager {
    series: RwLock<HashMap<SeriesId, Arc<RwLock<SeriesState>>>>,
    retention: usize,
    events: broadcast::Sender<SeriesDelta>,
}

impl TimeSeriesManager {
    pub fn new(retention: usize) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            series: RwLock::new(HashMap::new()),
            retention,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SeriesDelta> {
        self.events.subscribe()
    }

    /// Declare a new series, seeding every granularity's current bucket with
    /// `price` at `ts`. Rejects a series id that already exists with
    /// `SeriesExists`, per spec §4.H.
    pub fn create_series(&self, series_id: SeriesId, price: f64, ts: DateTime<Utc>) -> Result<(), EngineError> {
        let mut series = self.series.write();
        if series.contains_key(&series_id) {
            return Err(EngineError::SeriesExists(format!("{series_id}")));
        }
        let mut state = SeriesState::new();
        for g in Granularity::ALL {
            state.granularities.get_mut(&g).unwrap().current = Some(Candle::open_at(g, ts, price, 0));
        }
        state.last_ts = Some(ts);
        series.insert(series_id, Arc::new(RwLock::new(state)));
        trace!(series_id = %series_id, "time series declared");
        Ok(())
    }

    /// Declare `series_id` if it does not already exist. Used by the
    /// `Exchange`'s activation hook, which calls this unconditionally every
    /// time it (re)activates — unlike `create_series`, a pre-existing series
    /// is not an error here.
    pub fn ensure_series(&self, series_id: SeriesId, price: f64, ts: DateTime<Utc>) {
        match self.create_series(series_id, price, ts) {
            Ok(()) | Err(EngineError::SeriesExists(_)) => {}
            Err(e) => warn!(series_id = %series_id, error = %e, "unexpected error ensuring series"),
        }
    }

    /// Ingest one raw price/volume event at `ts`, updating every
    /// granularity's bucket. Rejects `ts` that regresses before the series'
    /// last-seen timestamp.
    pub fn ingest(&self, series_id: SeriesId, ts: DateTime<Utc>, price: f64, volume: u64) -> Result<(), EngineError> {
        let arc = {
            let series = self.series.read();
            series.get(&series_id).cloned()
        };
        let Some(arc) = arc else {
            return Err(EngineError::SeriesNotFound(format!("{series_id}")));
        };

        let mut state = arc.write();
        if let Some(last) = state.last_ts {
            if ts < last {
                return Err(EngineError::TimestampRegression(format!(
                    "series {series_id}: ingest ts {ts} precedes last ts {last}"
                )));
            }
        }
        state.last_ts = Some(ts);

        let mut deltas = Vec::with_capacity(Granularity::ALL.len());
        for g in Granularity::ALL {
            let gstate = state.granularities.get_mut(&g).unwrap();
            match &mut gstate.current {
                None => {
                    gstate.current = Some(Candle::open_at(g, ts, price, volume));
                }
                Some(candle) if ts >= candle.close_time => {
                    let mut finished = *candle;
                    finished.is_final = true;
                    gstate.history.push_back(finished);
                    if gstate.history.len() > self.retention {
                        gstate.history.pop_front();
                    }
                    *candle = Candle::open_at(g, ts, price, volume);
                }
                Some(candle) => {
                    candle.apply(price, volume);
                }
            }
            deltas.push(SeriesDelta {
                series_id,
                granularity: g,
                candle: gstate.current.unwrap(),
            });
        }
        drop(state);

        for delta in deltas {
            if self.events.send(delta).is_err() {
                trace!(series_id = %series_id, "no subscribers for series delta");
            }
        }
        Ok(())
    }

    /// Up to `limit` most recent finalized candles for `series_id` at
    /// `granularity`, oldest first.
    pub fn history(&self, series_id: SeriesId, granularity: Granularity, limit: usize) -> Result<Vec<Candle>, EngineError> {
        let arc = {
            let series = self.series.read();
            series.get(&series_id).cloned()
        };
        let Some(arc) = arc else {
            return Err(EngineError::SeriesNotFound(format!("{series_id}")));
        };
        let state = arc.read();
        let gstate = state.granularities.get(&granularity).unwrap();
        let skip = gstate.history.len().saturating_sub(limit);
        Ok(gstate.history.iter().skip(skip).copied().collect())
    }

    /// `queryAggregated` per spec §4.H: buckets whose `open_time` falls in
    /// the half-open range `[start, end)`, ascending, capped at `limit`
    /// (default 500). The current (not-yet-final) bucket is included if its
    /// `open_time` falls in range.
    pub fn query_range(
        &self,
        series_id: SeriesId,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        let arc = {
            let series = self.series.read();
            series.get(&series_id).cloned()
        };
        let Some(arc) = arc else {
            return Err(EngineError::SeriesNotFound(format!("{series_id}")));
        };
        let state = arc.read();
        let gstate = state.granularities.get(&granularity).unwrap();

        let in_range = |c: &Candle| c.open_time >= start && c.open_time < end;
        let mut result: Vec<Candle> = gstate.history.iter().filter(|c| in_range(c)).copied().collect();
        if let Some(current) = gstate.current {
            if in_range(&current) {
                result.push(current);
            }
        }
        result.sort_by_key(|c| c.open_time);
        result.truncate(limit);
        Ok(result)
    }

    /// `getLatest` per spec §4.H: the single most recent bucket (current if
    /// present, otherwise the last finalized one).
    pub fn latest(&self, series_id: SeriesId, granularity: Granularity) -> Result<Option<Candle>, EngineError> {
        let arc = {
            let series = self.series.read();
            series.get(&series_id).cloned()
        };
        let Some(arc) = arc else {
            return Err(EngineError::SeriesNotFound(format!("{series_id}")));
        };
        let state = arc.read();
        let gstate = state.granularities.get(&granularity).unwrap();
        Ok(gstate.current.or_else(|| gstate.history.back().copied()))
    }

    /// The currently-accumulating (not-yet-final) bucket, if the series
    /// exists and has seen at least one ingest.
    pub fn current(&self, series_id: SeriesId, granularity: Granularity) -> Result<Option<Candle>, EngineError> {
        let arc = {
            let series = self.series.read();
            series.get(&series_id).cloned()
        };
        let Some(arc) = arc else {
            return Err(EngineError::SeriesNotFound(format!("{series_id}")));
        };
        let state = arc.read();
        Ok(state.granularities.get(&granularity).unwrap().current)
    }

    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    pub fn remove_series(&self, series_id: SeriesId) {
        self.series.write().remove(&series_id);
    }
}

/// Wraps a `broadcast::Receiver`, surfacing a lag as an [`EngineError`]
/// rather than silently skipping missed deltas.
pub struct LaggingSubscriber {
    inner: broadcast::Receiver<SeriesDelta>,
}

impl LaggingSubscriber {
    pub fn new(inner: broadcast::Receiver<SeriesDelta>) -> Self {
        Self { inner }
    }

    pub async fn recv(&mut self) -> Result<SeriesDelta, EngineError> {
        match self.inner.recv().await {
            Ok(delta) => Ok(delta),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "push subscriber lagged behind series deltas");
                Err(EngineError::LaggingSubscriber(format!("missed {skipped} deltas")))
            }
            Err(broadcast::error::RecvError::Closed) => Err(EngineError::Internal(anyhow::anyhow!("series delta channel closed"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs_from_epoch_minutes: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs_from_epoch_minutes * 60, 0).single().unwrap()
    }

    #[test]
    fn create_series_rejects_duplicate_declaration() {
        let mgr = TimeSeriesManager::new(DEFAULT_RETENTION);
        let id = ObjectId(1);
        mgr.create_series(id, 10.0, ts(0)).unwrap();
        let err = mgr.create_series(id, 11.0, ts(1)).unwrap_err();
        assert_eq!(err.code(), "SeriesExists");
    }

    #[test]
    fn ensure_series_is_idempotent() {
        let mgr = TimeSeriesManager::new(DEFAULT_RETENTION);
        let id = ObjectId(1);
        mgr.ensure_series(id, 10.0, ts(0));
        mgr.ensure_series(id, 999.0, ts(1));
        let current = mgr.current(id, Granularity::M1).unwrap().unwrap();
        assert_eq!(current.open, 10.0, "second ensure_series call must be a no-op");
    }

    #[test]
    fn ingest_updates_current_bucket_within_window() {
        let mgr = TimeSeriesManager::new(DEFAULT_RETENTION);
        let id = ObjectId(1);
        mgr.ensure_series(id, 10.0, ts(0));
        mgr.ingest(id, ts(0), 12.0, 5).unwrap();
        let current = mgr.current(id, Granularity::M1).unwrap().unwrap();
        assert_eq!(current.high, 12.0);
        assert_eq!(current.volume, 5);
        assert!(!current.is_final);
    }

    #[test]
    fn ingest_past_bucket_boundary_finalizes_and_opens_new_bucket() {
        let mgr = TimeSeriesManager::new(DEFAULT_RETENTION);
        let id = ObjectId(1);
        mgr.ensure_series(id, 10.0, ts(0));
        mgr.ingest(id, ts(2), 20.0, 1).unwrap();
        let history = mgr.history(id, Granularity::M1, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_final);
        assert_eq!(history[0].close, 10.0);
        let current = mgr.current(id, Granularity::M1).unwrap().unwrap();
        assert_eq!(current.open, 20.0);
    }

    #[test]
    fn ingest_rejects_timestamp_regression() {
        let mgr = TimeSeriesManager::new(DEFAULT_RETENTION);
        let id = ObjectId(1);
        mgr.ensure_series(id, 10.0, ts(5));
        let err = mgr.ingest(id, ts(0), 9.0, 1).unwrap_err();
        assert_eq!(err.code(), "TimestampRegression");
    }

    #[test]
    fn ingest_unknown_series_returns_not_found() {
        let mgr = TimeSeriesManager::new(DEFAULT_RETENTION);
        let err = mgr.ingest(ObjectId(42), ts(0), 1.0, 0).unwrap_err();
        assert_eq!(err.code(), "SeriesNotFound");
    }

    #[test]
    fn query_range_returns_finalized_and_current_buckets_in_range() {
        let mgr = TimeSeriesManager::new(DEFAULT_RETENTION);
        let id = ObjectId(1);
        // Scenario 4: points at t0, t0+20s, t0+40s, t0+70s with prices 10, 11, 10.5, 12.
        let t0 = ts(0);
        mgr.ensure_series(id, 10.0, t0);
        mgr.ingest(id, Utc.timestamp_opt(20, 0).single().unwrap(), 11.0, 1).unwrap();
        mgr.ingest(id, Utc.timestamp_opt(40, 0).single().unwrap(), 10.5, 1).unwrap();
        mgr.ingest(id, Utc.timestamp_opt(70, 0).single().unwrap(), 12.0, 1).unwrap();

        let start = t0;
        let end = Utc.timestamp_opt(120, 0).single().unwrap();
        let buckets = mgr.query_range(id, Granularity::M1, start, end, 500).unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].open, 10.0);
        assert_eq!(buckets[0].high, 11.0);
        assert_eq!(buckets[0].low, 10.0);
        assert_eq!(buckets[0].close, 10.5);
        assert_eq!(buckets[1].open, 12.0);
        assert_eq!(buckets[1].close, 12.0);
    }

    #[test]
    fn query_range_of_a_finalized_buckets_own_window_returns_exactly_that_bucket() {
        let mgr = TimeSeriesManager::new(DEFAULT_RETENTION);
        let id = ObjectId(1);
        mgr.ensure_series(id, 10.0, ts(0));
        mgr.ingest(id, ts(2), 20.0, 1).unwrap();
        let history = mgr.history(id, Granularity::M1, 10).unwrap();
        let b = history[0];

        let buckets = mgr.query_range(id, Granularity::M1, b.open_time, b.close_time, 500).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].close, b.close);
    }

    #[test]
    fn query_range_respects_limit_cap() {
        let mgr = TimeSeriesManager::new(DEFAULT_RETENTION);
        let id = ObjectId(1);
        mgr.ensure_series(id, 1.0, ts(0));
        for i in 1..=5 {
            mgr.ingest(id, ts(i), i as f64, 1).unwrap();
        }
        let buckets = mgr.query_range(id, Granularity::M1, ts(0), ts(100), 2).unwrap();
        assert_eq!(buckets.len(), 2);
    }

    #[test]
    fn latest_prefers_current_bucket_over_history() {
        let mgr = TimeSeriesManager::new(DEFAULT_RETENTION);
        let id = ObjectId(1);
        mgr.ensure_series(id, 1.0, ts(0));
        mgr.ingest(id, ts(2), 5.0, 1).unwrap();
        let latest = mgr.latest(id, Granularity::M1).unwrap().unwrap();
        assert_eq!(latest.open, 5.0);
    }

    #[test]
    fn retention_cap_evicts_oldest_finalized_candle() {
        let mgr = TimeSeriesManager::new(2);
        let id = ObjectId(1);
        mgr.ensure_series(id, 1.0, ts(0));
        for i in 1..=4 {
            mgr.ingest(id, ts(i), i as f64, 1).unwrap();
        }
        let history = mgr.history(id, Granularity::M1, 100).unwrap();
        assert_eq!(history.len(), 2);
    }
}
