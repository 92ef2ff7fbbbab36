// =============================================================================
// OHLCV candle buckets and the fixed granularity ladder
// =============================================================================

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of aggregation granularities every series maintains in
/// parallel. Ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    M1,
    M5,
    M15,
    M30,
    H1,
    D1,
    W1,
    Mo1,
}

impl Granularity {
    pub const ALL: [Granularity; 8] = [
        Granularity::M1,
        Granularity::M5,
        Granularity::M15,
        Granularity::M30,
        Granularity::H1,
        Granularity::D1,
        Granularity::W1,
        Granularity::Mo1,
    ];

    /// Bucket width in seconds. `Mo1` has no fixed width — calendar months
    /// vary in length — and is handled separately by [`Self::bucket_start`].
    pub fn seconds(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 5 * 60,
            Self::M15 => 15 * 60,
            Self::M30 => 30 * 60,
            Self::H1 => 60 * 60,
            Self::D1 => 24 * 60 * 60,
            Self::W1 => 7 * 24 * 60 * 60,
            Self::Mo1 => 0,
        }
    }

    /// Align `ts` down to the start of the bucket it falls in.
    pub fn bucket_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Mo1 => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(ts),
            Self::W1 => {
                // ISO week: align to the most recent Monday 00:00 UTC.
                let days_since_monday = ts.weekday().num_days_from_monday() as i64;
                let midnight = ts
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc();
                midnight - Duration::days(days_since_monday)
            }
            _ => {
                let secs = self.seconds();
                let epoch = ts.timestamp();
                let aligned = epoch - epoch.rem_euclid(secs);
                Utc.timestamp_opt(aligned, 0).single().unwrap_or(ts)
            }
        }
    }

    /// Start of the bucket immediately following the one containing `ts`.
    pub fn next_bucket_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.bucket_start(ts);
        match self {
            Self::Mo1 => {
                let (year, month) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single().unwrap_or(start)
            }
            _ => start + Duration::seconds(self.seconds()),
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        };
        write!(f, "{s}")
    }
}

/// A single OHLCV bucket. `is_final` is false while it is still the
/// currently-accumulating bucket for its series/granularity; it flips to
/// true, permanently, the instant a later ingest closes it out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub is_final: bool,
}

impl Candle {
    pub fn open_at(granularity: Granularity, ts: DateTime<Utc>, price: f64, volume: u64) -> Self {
        let open_time = granularity.bucket_start(ts);
        let close_time = granularity.next_bucket_start(ts);
        Self {
            open_time,
            close_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            is_final: false,
        }
    }

    pub fn apply(&mut self, price: f64, volume: u64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minute_bucket_aligns_to_minute_boundary() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 10, 30, 47).unwrap();
        let start = Granularity::M1.bucket_start(ts);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn five_minute_bucket_aligns_to_five_minute_boundary() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 10, 32, 10).unwrap();
        let start = Granularity::M5.bucket_start(ts);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn month_bucket_aligns_to_first_of_month() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        let start = Granularity::Mo1.bucket_start(ts);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn next_bucket_start_for_month_rolls_over_december() {
        let ts = Utc.with_ymd_and_hms(2026, 12, 10, 0, 0, 0).unwrap();
        let next = Granularity::Mo1.next_bucket_start(ts);
        assert_eq!(next, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn candle_apply_tracks_high_low_close_and_sums_volume() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut c = Candle::open_at(Granularity::M1, ts, 10.0, 5);
        c.apply(12.0, 3);
        c.apply(8.0, 2);
        c.apply(11.0, 1);
        assert_eq!(c.open, 10.0);
        assert_eq!(c.high, 12.0);
        assert_eq!(c.low, 8.0);
        assert_eq!(c.close, 11.0);
        assert_eq!(c.volume, 11);
    }
}
