//! Historical baselines built from the alert history.
//!
//! Two independent comparisons over the same immutable history slice:
//! a rolling window (default 7 days) and a day-of-week/hour-of-day window.
//! Either may be absent when there is not enough history. Deviations are
//! advisory and only ever raise warnings.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::Condition;
use crate::config::BaselineConfig;
use crate::round_to;
use crate::snapshot::MetricSnapshot;
use crate::storage::AlertRecord;

const COUNT_DECIMALS: u32 = 3;
const RATE_DECIMALS: u32 = 6;

/// Averages of the qualifying history and the current run's deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub avg_jobs: f64,
    pub avg_timeout: f64,
    pub avg_cancel: f64,
    /// Relative change in volume; absent when the average is zero.
    pub delta_jobs: Option<f64>,
    /// Absolute change in timeout rate.
    pub delta_timeout: f64,
    /// Absolute change in cancel rate.
    pub delta_cancel: f64,
}

/// One baseline: how many points qualified and, if enough, the comparison.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaselineStats {
    pub n: usize,
    pub comparison: Option<Comparison>,
}

/// Baseline values as stored on the alert record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineFields {
    pub baseline_n: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_avg_jobs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_avg_timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_avg_cancel: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_jobs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_cancel: Option<f64>,
    pub baseline_dow_n: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dow_avg_jobs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dow_avg_timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dow_avg_cancel: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dow_delta_jobs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dow_delta_timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dow_delta_cancel: Option<f64>,
}

/// Both baselines plus the warnings they produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaselineResult {
    pub rolling: BaselineStats,
    pub day_of_week: BaselineStats,
    pub warnings: Vec<Condition>,
}

impl BaselineResult {
    pub fn fields(&self) -> BaselineFields {
        let r = self.rolling.comparison.as_ref();
        let d = self.day_of_week.comparison.as_ref();
        BaselineFields {
            baseline_n: self.rolling.n,
            baseline_avg_jobs: r.map(|c| c.avg_jobs),
            baseline_avg_timeout: r.map(|c| c.avg_timeout),
            baseline_avg_cancel: r.map(|c| c.avg_cancel),
            delta_jobs: r.and_then(|c| c.delta_jobs),
            delta_timeout: r.map(|c| c.delta_timeout),
            delta_cancel: r.map(|c| c.delta_cancel),
            baseline_dow_n: self.day_of_week.n,
            dow_avg_jobs: d.map(|c| c.avg_jobs),
            dow_avg_timeout: d.map(|c| c.avg_timeout),
            dow_avg_cancel: d.map(|c| c.avg_cancel),
            dow_delta_jobs: d.and_then(|c| c.delta_jobs),
            dow_delta_timeout: d.map(|c| c.delta_timeout),
            dow_delta_cancel: d.map(|c| c.delta_cancel),
        }
    }
}

pub struct BaselineEngine {
    cfg: BaselineConfig,
}

impl BaselineEngine {
    pub fn new(cfg: BaselineConfig) -> Self {
        Self { cfg }
    }

    /// Compare `current` against both baselines and apply the deviation rules.
    pub fn evaluate(&self, current: &MetricSnapshot, now: DateTime<Utc>, history: &[AlertRecord]) -> BaselineResult {
        let rolling = rolling_baseline(&self.cfg, current, now, history);
        let day_of_week = day_of_week_baseline(&self.cfg, current, now, history);

        let mut warnings = Vec::new();

        if let Some(c) = &rolling.comparison {
            if let Some(delta) = c.delta_jobs {
                if c.avg_jobs >= self.cfg.volume_drop_min_avg && delta <= self.cfg.volume_drop_ratio {
                    warnings.push(
                        Condition::warning(
                            "BASELINE_VOLUME_DROP",
                            format!(
                                "total_jobs={} vs avg {:.1} ({:+.1}%, n={})",
                                current.total_jobs,
                                c.avg_jobs,
                                delta * 100.0,
                                rolling.n
                            ),
                        )
                        .with_qualifier("ROLLING"),
                    );
                }
            }
            spike_rules(
                &mut warnings,
                "ROLLING",
                c,
                rolling.n,
                self.cfg.timeout_spike,
                self.cfg.cancel_spike,
            );
        }

        if let Some(c) = &day_of_week.comparison {
            spike_rules(
                &mut warnings,
                "DOW",
                c,
                day_of_week.n,
                self.cfg.dow_timeout_spike,
                self.cfg.dow_cancel_spike,
            );
        }

        BaselineResult {
            rolling,
            day_of_week,
            warnings,
        }
    }
}

fn spike_rules(
    warnings: &mut Vec<Condition>,
    which: &str,
    c: &Comparison,
    n: usize,
    timeout_limit: f64,
    cancel_limit: f64,
) {
    if c.delta_timeout >= timeout_limit {
        warnings.push(
            Condition::warning(
                "BASELINE_TIMEOUT_SPIKE",
                format!(
                    "timeout_rate {:+.4} vs avg {:.4} (limit {:.2}, n={})",
                    c.delta_timeout, c.avg_timeout, timeout_limit, n
                ),
            )
            .with_qualifier(which),
        );
    }
    if c.delta_cancel >= cancel_limit {
        warnings.push(
            Condition::warning(
                "BASELINE_CANCEL_SPIKE",
                format!(
                    "cancel_rate {:+.4} vs avg {:.4} (limit {:.2}, n={})",
                    c.delta_cancel, c.avg_cancel, cancel_limit, n
                ),
            )
            .with_qualifier(which),
        );
    }
}

/// Rolling baseline: last `rolling_days`, same window, healthy records only.
pub fn rolling_baseline(
    cfg: &BaselineConfig,
    current: &MetricSnapshot,
    now: DateTime<Utc>,
    history: &[AlertRecord],
) -> BaselineStats {
    let since = now - Duration::days(cfg.rolling_days);
    let points: Vec<&AlertRecord> = history
        .iter()
        .filter(|r| r.is_baseline_candidate())
        .filter(|r| r.window_hours == current.window_hours)
        .filter(|r| r.timestamp >= since && r.timestamp <= now)
        .collect();

    stats(current, &points, cfg.rolling_min_points)
}

/// Day-of-week baseline: the rolling filter narrowed to the same local
/// weekday and to within `dow_hour_window` hours of the current hour.
///
/// `dow_lookback_days` widens the window past `rolling_days`, and
/// `dow_exclude_today` drops records from the current local date.
pub fn day_of_week_baseline(
    cfg: &BaselineConfig,
    current: &MetricSnapshot,
    now: DateTime<Utc>,
    history: &[AlertRecord],
) -> BaselineStats {
    let tz = FixedOffset::east_opt(cfg.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix());
    let local_now = now.with_timezone(&tz);
    let since = now - Duration::days(cfg.dow_lookback_days.unwrap_or(cfg.rolling_days));

    let points: Vec<&AlertRecord> = history
        .iter()
        .filter(|r| r.is_baseline_candidate())
        .filter(|r| r.window_hours == current.window_hours)
        .filter(|r| r.timestamp >= since && r.timestamp <= now)
        .filter(|r| {
            let local = r.timestamp.with_timezone(&tz);
            local.weekday() == local_now.weekday()
                && local.hour().abs_diff(local_now.hour()) <= cfg.dow_hour_window
                && !(cfg.dow_exclude_today && local.date_naive() == local_now.date_naive())
        })
        .collect();

    stats(current, &points, cfg.dow_min_points)
}

fn stats(current: &MetricSnapshot, points: &[&AlertRecord], min_points: usize) -> BaselineStats {
    let n = points.len();
    if n == 0 || n < min_points {
        return BaselineStats { n, comparison: None };
    }
    BaselineStats {
        n,
        comparison: Some(compare(current, points)),
    }
}

fn compare(current: &MetricSnapshot, points: &[&AlertRecord]) -> Comparison {
    let count = points.len() as f64;
    let avg_jobs = points.iter().map(|r| r.total_jobs as f64).sum::<f64>() / count;
    let avg_timeout = points.iter().map(|r| r.timeout_rate).sum::<f64>() / count;
    let avg_cancel = points.iter().map(|r| r.cancel_rate).sum::<f64>() / count;

    let delta_jobs = (avg_jobs > 0.0)
        .then(|| round_to((current.total_jobs as f64 - avg_jobs) / avg_jobs, RATE_DECIMALS));

    Comparison {
        avg_jobs: round_to(avg_jobs, COUNT_DECIMALS),
        avg_timeout: round_to(avg_timeout, RATE_DECIMALS),
        avg_cancel: round_to(avg_cancel, RATE_DECIMALS),
        delta_jobs,
        delta_timeout: round_to(current.timeout_rate - avg_timeout, RATE_DECIMALS),
        delta_cancel: round_to(current.cancel_rate - avg_cancel, RATE_DECIMALS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Severity;
    use crate::storage::history::tests::record;
    use chrono::TimeZone;

    // A Wednesday.
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 18, 14, 0, 0).unwrap()
    }

    fn current(total_jobs: u64, timeout_rate: f64, cancel_rate: f64) -> MetricSnapshot {
        MetricSnapshot {
            timestamp: now(),
            window_hours: 168,
            total_jobs,
            stuck: 0,
            timeout_rate,
            cancel_rate,
        }
    }

    fn with_rates(mut r: AlertRecord, timeout: f64, cancel: f64) -> AlertRecord {
        r.timeout_rate = timeout;
        r.cancel_rate = cancel;
        r
    }

    fn engine() -> BaselineEngine {
        BaselineEngine::new(BaselineConfig::default())
    }

    #[test]
    fn test_empty_history_no_warnings() {
        let result = engine().evaluate(&current(5, 0.9, 0.9), now(), &[]);
        assert!(result.warnings.is_empty());
        assert_eq!(result.rolling.n, 0);
        assert_eq!(result.fields().baseline_n, 0);
        assert_eq!(result.fields().baseline_dow_n, 0);
        assert!(result.fields().baseline_avg_jobs.is_none());
    }

    #[test]
    fn test_volume_drop_with_three_points() {
        let history: Vec<_> = (1..=3)
            .map(|d| record(now() - Duration::days(d), Severity::Success, 100))
            .collect();
        let result = engine().evaluate(&current(40, 0.0, 0.0), now(), &history);

        let cmp = result.rolling.comparison.as_ref().unwrap();
        assert_eq!(result.rolling.n, 3);
        assert_eq!(cmp.avg_jobs, 100.0);
        assert_eq!(cmp.delta_jobs, Some(-0.6));
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].signal(), "WARN BASELINE_VOLUME_DROP:ROLLING");
    }

    #[test]
    fn test_two_points_are_not_enough_for_rolling() {
        let history: Vec<_> = (1..=2)
            .map(|d| record(now() - Duration::days(d), Severity::Success, 100))
            .collect();
        let result = engine().evaluate(&current(10, 0.0, 0.0), now(), &history);
        assert_eq!(result.rolling.n, 2);
        assert!(result.rolling.comparison.is_none());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_volume_drop_needs_meaningful_average() {
        let history: Vec<_> = (1..=3)
            .map(|d| record(now() - Duration::hours(d), Severity::Success, 8))
            .collect();
        let result = engine().evaluate(&current(1, 0.0, 0.0), now(), &history);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_zero_average_has_no_jobs_delta() {
        let history: Vec<_> = (1..=3)
            .map(|d| record(now() - Duration::hours(d), Severity::Success, 0))
            .collect();
        let result = engine().evaluate(&current(50, 0.0, 0.0), now(), &history);
        let cmp = result.rolling.comparison.unwrap();
        assert_eq!(cmp.delta_jobs, None);
    }

    #[test]
    fn test_rolling_excludes_errors_duplicates_old_and_other_windows() {
        let mut history = vec![
            record(now() - Duration::days(8), Severity::Success, 100),
            record(now() - Duration::days(2), Severity::Error, 100),
        ];
        let mut dup = record(now() - Duration::days(2), Severity::Success, 100);
        dup.duplicate_snapshot = true;
        history.push(dup);
        let mut other_window = record(now() - Duration::days(1), Severity::Success, 100);
        other_window.window_hours = 24;
        history.push(other_window);
        history.push(record(now() - Duration::hours(3), Severity::Warning, 100));

        let stats = rolling_baseline(&BaselineConfig::default(), &current(40, 0.0, 0.0), now(), &history);
        assert_eq!(stats.n, 1);
        assert!(stats.comparison.is_none());
    }

    #[test]
    fn test_rolling_rate_spikes() {
        let history: Vec<_> = (1..=3)
            .map(|d| with_rates(record(now() - Duration::days(d), Severity::Success, 100), 0.05, 0.02))
            .collect();

        let calm = engine().evaluate(&current(100, 0.19, 0.09), now(), &history);
        assert!(calm.warnings.is_empty(), "{:?}", calm.warnings);

        let spiky = engine().evaluate(&current(100, 0.20, 0.10), now(), &history);
        let signals: Vec<_> = spiky.warnings.iter().map(Condition::signal).collect();
        assert_eq!(
            signals,
            vec!["WARN BASELINE_TIMEOUT_SPIKE:ROLLING", "WARN BASELINE_CANCEL_SPIKE:ROLLING"]
        );
        let cmp = spiky.rolling.comparison.unwrap();
        assert_eq!(cmp.delta_timeout, 0.15);
        assert_eq!(cmp.delta_cancel, 0.08);
    }

    #[test]
    fn test_day_of_week_matches_same_weekday_and_hours() {
        let history = vec![
            // Last Wednesday, on the edge of the rolling window.
            with_rates(record(now() - Duration::days(7), Severity::Success, 100), 0.05, 0.01),
            // Earlier today within +-2h.
            with_rates(record(now() - Duration::hours(1), Severity::Success, 100), 0.05, 0.01),
            with_rates(record(now() - Duration::hours(2), Severity::Success, 100), 0.05, 0.01),
            // Today but 3h away.
            with_rates(record(now() - Duration::hours(3), Severity::Success, 100), 0.05, 0.01),
            // Tuesday.
            with_rates(record(now() - Duration::days(1), Severity::Success, 100), 0.05, 0.01),
            // A Wednesday outside the rolling window.
            with_rates(record(now() - Duration::days(14), Severity::Success, 100), 0.05, 0.01),
        ];

        let stats = day_of_week_baseline(&BaselineConfig::default(), &current(100, 0.0, 0.0), now(), &history);
        assert_eq!(stats.n, 3);

        let result = engine().evaluate(&current(100, 0.17, 0.07), now(), &history);
        let signals: Vec<_> = result.warnings.iter().map(Condition::signal).collect();
        // Rolling has 5 points with the same averages; its limits are higher,
        // so only the day-of-week rules fire.
        assert_eq!(result.rolling.n, 5);
        assert_eq!(
            signals,
            vec!["WARN BASELINE_TIMEOUT_SPIKE:DOW", "WARN BASELINE_CANCEL_SPIKE:DOW"]
        );
        let fields = result.fields();
        assert_eq!(fields.baseline_dow_n, 3);
        assert_eq!(fields.dow_delta_timeout, Some(0.12));
        assert_eq!(fields.dow_delta_cancel, Some(0.06));
    }

    #[test]
    fn test_day_of_week_shares_rolling_exclusions() {
        let mut dup = record(now() - Duration::hours(1), Severity::Success, 100);
        dup.duplicate_snapshot = true;
        let mut other_window = record(now() - Duration::hours(1), Severity::Success, 100);
        other_window.window_hours = 24;
        let history = vec![
            dup,
            other_window,
            record(now() - Duration::hours(2), Severity::Error, 100),
            record(now() - Duration::hours(2), Severity::Warning, 100),
        ];
        let stats = day_of_week_baseline(&BaselineConfig::default(), &current(100, 0.0, 0.0), now(), &history);
        assert_eq!(stats.n, 1);
    }

    #[test]
    fn test_day_of_week_single_point_is_not_enough() {
        let history = vec![with_rates(
            record(now() - Duration::days(7), Severity::Success, 100),
            0.05,
            0.01,
        )];
        let result = engine().evaluate(&current(100, 0.50, 0.50), now(), &history);

        assert_eq!(result.day_of_week.n, 1);
        assert!(result.day_of_week.comparison.is_none());
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
        let fields = result.fields();
        assert_eq!(fields.baseline_dow_n, 1);
        assert!(fields.dow_avg_timeout.is_none());
        assert!(fields.dow_delta_timeout.is_none());
    }

    #[test]
    fn test_day_of_week_longer_lookback_without_today() {
        let cfg = BaselineConfig {
            dow_lookback_days: Some(28),
            dow_exclude_today: true,
            ..BaselineConfig::default()
        };
        let history = vec![
            record(now() - Duration::days(7), Severity::Success, 100),
            record(now() - Duration::days(14) + Duration::hours(2), Severity::Success, 100),
            record(now() - Duration::days(21) - Duration::hours(3), Severity::Success, 100),
            record(now() - Duration::days(35), Severity::Success, 100),
            record(now() - Duration::hours(1), Severity::Success, 100),
        ];
        let stats = day_of_week_baseline(&cfg, &current(100, 0.0, 0.0), now(), &history);
        assert_eq!(stats.n, 2);

        let default_stats =
            day_of_week_baseline(&BaselineConfig::default(), &current(100, 0.0, 0.0), now(), &history);
        assert_eq!(default_stats.n, 2);
    }

    #[test]
    fn test_utc_offset_shifts_weekday() {
        let cfg = BaselineConfig {
            utc_offset_hours: -5,
            ..BaselineConfig::default()
        };
        // 01:00 UTC on Wednesday is Tuesday 20:00 at UTC-5.
        let at = Utc.with_ymd_and_hms(2026, 3, 18, 1, 0, 0).unwrap();
        let history = vec![
            record(at - Duration::days(7), Severity::Success, 10),
            // Tuesday 23:00 UTC, Tuesday 18:00 local.
            record(at - Duration::hours(2), Severity::Success, 10),
        ];
        let mut cur = current(10, 0.0, 0.0);
        cur.timestamp = at;

        let stats = day_of_week_baseline(&cfg, &cur, at, &history);
        assert_eq!(stats.n, 2);
        assert!(stats.comparison.is_some());

        let utc = day_of_week_baseline(&BaselineConfig::default(), &cur, at, &history);
        assert_eq!(utc.n, 1);
    }

    #[test]
    fn test_averages_are_rounded() {
        let history = vec![
            record(now() - Duration::hours(1), Severity::Success, 10),
            record(now() - Duration::hours(2), Severity::Success, 10),
            record(now() - Duration::hours(3), Severity::Success, 11),
        ];
        let stats = rolling_baseline(&BaselineConfig::default(), &current(10, 0.0, 0.0), now(), &history);
        let cmp = stats.comparison.unwrap();
        assert_eq!(cmp.avg_jobs, 10.333);
        assert_eq!(cmp.delta_jobs, Some(-0.032258));
    }
}
