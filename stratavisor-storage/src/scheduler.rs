//! Scheduled snapshots and expiry pruning.
//!
//! Volumes opt in through `snapshots.schedule` (a five-field cron
//! expression or comma-separated aliases), `snapshots.pattern` (name
//! template, `%d` substituted with the next free index) and
//! `snapshots.expiry` (relative lifetime grammar, e.g. `2H 1d 1w`).
//! The scheduler is tick-driven: the caller decides the clock, which
//! keeps the behavior deterministic under test.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Months, Timelike, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::error::{Result, StorageError};
use crate::lifecycle::VolumeLifecycleManager;
use crate::types::VolumeKey;

/// One parsed cron field: either a wildcard or an explicit value set.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    Values(Vec<u32>),
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Values(values) => values.contains(&value),
        }
    }
}

/// A parsed snapshot schedule: `<minute> <hour> <dom> <month> <dow>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

fn parse_field(raw: &str, min: u32, max: u32) -> Result<Field> {
    if raw == "*" {
        return Ok(Field::Any);
    }

    let mut values = Vec::new();
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    StorageError::Config(format!("Invalid cron step {:?}", part))
                })?;
                if step == 0 {
                    return Err(StorageError::Config(format!("Invalid cron step {:?}", part)));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo: u32 = lo
                .parse()
                .map_err(|_| StorageError::Config(format!("Invalid cron range {:?}", part)))?;
            let hi: u32 = hi
                .parse()
                .map_err(|_| StorageError::Config(format!("Invalid cron range {:?}", part)))?;
            (lo, hi)
        } else {
            let v: u32 = range
                .parse()
                .map_err(|_| StorageError::Config(format!("Invalid cron value {:?}", part)))?;
            (v, v)
        };

        if lo < min || hi > max || lo > hi {
            return Err(StorageError::Config(format!(
                "Cron value {:?} out of range {}-{}",
                part, min, max
            )));
        }

        let mut v = lo;
        while v <= hi {
            if !values.contains(&v) {
                values.push(v);
            }
            v += step;
        }
    }

    Ok(Field::Values(values))
}

impl Schedule {
    /// Parse a five-field cron expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(StorageError::Config(format!(
                "Schedule {:?} must have 5 fields, found {}",
                expr,
                fields.len()
            )));
        }

        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_field(fields[4], 0, 7)?,
        })
    }

    /// Whether this schedule fires at the given instant (minute
    /// granularity).
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        // Day 7 is an alias for Sunday (0).
        let dow = at.weekday().num_days_from_sunday();
        let dow_matches = self.day_of_week.matches(dow)
            || (dow == 0 && self.day_of_week.matches(7));

        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day_of_month.matches(at.day())
            && self.month.matches(at.month())
            && dow_matches
    }
}

/// Parse a `snapshots.schedule` value: either one cron expression or a
/// comma-separated list of `@` aliases. `@never` (or empty) yields no
/// schedules.
pub fn parse_schedules(raw: &str) -> Result<Vec<Schedule>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    if !raw.starts_with('@') {
        return Ok(vec![Schedule::parse(raw)?]);
    }

    let mut schedules = Vec::new();
    for alias in raw.split(',').map(str::trim) {
        let expr = match alias {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@never" => continue,
            other => {
                return Err(StorageError::Config(format!(
                    "Unknown schedule alias {:?}",
                    other
                )))
            }
        };
        schedules.push(Schedule::parse(expr)?);
    }
    Ok(schedules)
}

/// Relative snapshot lifetime, summed from `<n><unit>` tokens where the
/// unit is one of `M` (minutes), `H` (hours), `d`, `w`, `m` (months) or
/// `y`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expiry {
    pub minutes: i64,
    pub hours: i64,
    pub days: i64,
    pub weeks: i64,
    pub months: u32,
    pub years: u32,
}

impl Expiry {
    /// When a snapshot taken at `from` expires.
    pub fn apply(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let shifted = from
            .checked_add_months(Months::new(self.months + 12 * self.years))
            .ok_or_else(|| StorageError::Config("Snapshot expiry overflows".to_string()))?;

        Ok(shifted
            + Duration::weeks(self.weeks)
            + Duration::days(self.days)
            + Duration::hours(self.hours)
            + Duration::minutes(self.minutes))
    }
}

/// Parse a `snapshots.expiry` value like `1M 2H 3d 4w 5m 6y`.
pub fn parse_expiry(raw: &str) -> Result<Expiry> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StorageError::Config("Empty snapshot expiry".to_string()));
    }

    let mut expiry = Expiry::default();
    for token in raw.split_whitespace() {
        // The unit may be any char, so split on its boundary rather than
        // assuming a one-byte suffix.
        let (unit_start, unit) = token
            .char_indices()
            .next_back()
            .ok_or_else(|| StorageError::Config(format!("Invalid expiry token {:?}", token)))?;
        let count: i64 = token[..unit_start].parse().map_err(|_| {
            StorageError::Config(format!("Invalid expiry token {:?}", token))
        })?;
        if count < 0 {
            return Err(StorageError::Config(format!(
                "Invalid expiry token {:?}",
                token
            )));
        }

        match unit {
            'M' => expiry.minutes += count,
            'H' => expiry.hours += count,
            'd' => expiry.days += count,
            'w' => expiry.weeks += count,
            'm' => expiry.months += count as u32,
            'y' => expiry.years += count as u32,
            _ => {
                return Err(StorageError::Config(format!(
                    "Invalid expiry token {:?}",
                    token
                )))
            }
        }
    }
    Ok(expiry)
}

/// Compute a snapshot's expiry instant from a volume's configuration.
/// Returns `None` when no expiry is configured.
pub fn snapshot_expiry(
    config: &HashMap<String, String>,
    created_at: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match config.get("snapshots.expiry") {
        Some(raw) if !raw.trim().is_empty() => {
            Ok(Some(parse_expiry(raw)?.apply(created_at)?))
        }
        _ => Ok(None),
    }
}

/// Expand a `snapshots.pattern` template against the names already in
/// use. `%d` becomes the smallest unused non-negative index.
pub fn expand_pattern(pattern: &str, existing: &[String]) -> String {
    if !pattern.contains("%d") {
        return pattern.to_string();
    }

    let mut index = 0u64;
    loop {
        let candidate = pattern.replace("%d", &index.to_string());
        if !existing.iter().any(|n| *n == candidate) {
            return candidate;
        }
        index += 1;
    }
}

/// Tick-driven scheduler for automatic snapshots and expiry pruning.
pub struct SnapshotScheduler {
    lifecycle: Arc<VolumeLifecycleManager>,
    /// Last minute a scheduled snapshot fired per volume, so one firing
    /// window never produces duplicates across ticks.
    last_fired: Mutex<HashMap<VolumeKey, DateTime<Utc>>>,
}

impl SnapshotScheduler {
    pub fn new(lifecycle: Arc<VolumeLifecycleManager>) -> Self {
        Self {
            lifecycle,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Run one scheduler pass at the given instant. Returns the spawned
    /// task handles so callers (and tests) can await completion. Failures
    /// inside a task are logged, never propagated: one broken volume must
    /// not stall the rest of the fleet.
    #[instrument(skip(self), fields(at = %now))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let store = self.lifecycle.store().clone();

        for pool in store.list_pools().await {
            if !pool.driver.capability().supports_snapshots {
                continue;
            }

            for volume in store.list_volumes(&pool.name).await {
                if self.due(&volume.key, &volume.config, now).await {
                    handles.push(self.spawn_snapshot(volume.key.clone(), now));
                }

                for snapshot in store.list_snapshots(&volume.key).await {
                    if snapshot.expires_at.is_some_and(|at| at <= now) {
                        handles.push(self.spawn_prune(volume.key.clone(), snapshot.name));
                    }
                }
            }
        }

        handles
    }

    /// Whether a scheduled snapshot of this volume is due now.
    async fn due(
        &self,
        key: &VolumeKey,
        config: &HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(raw) = config.get("snapshots.schedule") else {
            return false;
        };

        let schedules = match parse_schedules(raw) {
            Ok(schedules) => schedules,
            Err(err) => {
                warn!(volume = %key, %err, "Ignoring unparseable snapshot schedule");
                return false;
            }
        };
        if !schedules.iter().any(|s| s.matches(now)) {
            return false;
        }

        // Sub-minute ticks must not fire the same window twice.
        let window = now.with_second(0).and_then(|t| t.with_nanosecond(0));
        let mut last = self.last_fired.lock().await;
        if last.get(key).copied() == window {
            return false;
        }
        if let Some(window) = window {
            last.insert(key.clone(), window);
        }
        true
    }

    fn spawn_snapshot(&self, key: VolumeKey, now: DateTime<Utc>) -> JoinHandle<()> {
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            if let Err(err) = scheduled_snapshot(&lifecycle, &key).await {
                warn!(volume = %key, %err, at = %now, "Scheduled snapshot failed");
            }
        })
    }

    fn spawn_prune(&self, key: VolumeKey, snapshot: String) -> JoinHandle<()> {
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            match lifecycle.delete_snapshot(&key, &snapshot).await {
                Ok(()) => info!(volume = %key, %snapshot, "Pruned expired snapshot"),
                Err(err) => {
                    warn!(volume = %key, %snapshot, %err, "Expired snapshot prune failed")
                }
            }
        })
    }
}

async fn scheduled_snapshot(
    lifecycle: &VolumeLifecycleManager,
    key: &VolumeKey,
) -> Result<()> {
    let volume = lifecycle.get_volume(key).await?;
    let pattern = volume
        .config
        .get("snapshots.pattern")
        .map(String::as_str)
        .unwrap_or("snap%d");

    let existing: Vec<String> = lifecycle
        .list_snapshots(key)
        .await?
        .into_iter()
        .map(|s| s.name)
        .collect();
    let name = expand_pattern(pattern, &existing);

    lifecycle.snapshot_volume(key, &name).await?;
    info!(volume = %key, snapshot = %name, "Scheduled snapshot created");
    Ok(())
}
