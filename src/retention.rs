/// Snapshot retention: keep the directory under its size budget while
/// preserving an exponentially-spaced history.
///
/// For N kept snapshots the ideal age of the n-th (counting from the
/// newest, which is always age 0) is `n + r^n - 1` checkpoint intervals,
/// where r is chosen so the oldest ideal spans the observed history. Each
/// round deletes at most the one snapshot whose removal minimizes the sum
/// of absolute deviations from those ideals; the newest snapshot and the
/// configured minimum count are never touched.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Parse a snapshot filename (`2018-11-09T18.49.50.548Z.city`) back into
/// its timestamp. Colons were replaced by periods on the time-of-day part.
pub fn parse_snapshot_name(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(".city")?;
    let (date, time) = stem.split_once('T')?;
    let time = time.replacen('.', ":", 2);
    let iso = format!("{}T{}", date, time);
    let naive = NaiveDateTime::parse_from_str(iso.strip_suffix('Z')?, "%Y-%m-%dT%H:%M:%S%.3f").ok()?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// Pick the snapshot to discard, as an index into `times` (sorted oldest
/// first). `None` means nothing may be deleted.
pub fn choose_victim(
    times: &[DateTime<Utc>],
    interval_secs: f64,
    min_files: usize,
) -> Option<usize> {
    let n = times.len();
    let floor = min_files.max(1);
    if n <= floor {
        return None;
    }
    let newest = *times.last().expect("non-empty");
    let interval = if interval_secs > 0.0 { interval_secs } else { 600.0 };
    let age_of = |t: &DateTime<Utc>| {
        ((newest - *t).num_milliseconds() as f64 / 1000.0 / interval).max(0.0)
    };

    let mut best: Option<(usize, f64)> = None;
    // The newest snapshot (last index) is never a candidate.
    for victim in 0..n - 1 {
        let remaining: Vec<f64> = times
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != victim)
            .map(|(_, t)| age_of(t))
            .collect();
        let cost = spacing_cost(&remaining);
        match best {
            Some((_, c)) if c <= cost => {}
            _ => best = Some((victim, cost)),
        }
    }
    best.map(|(i, _)| i)
}

/// Sum of absolute deviations of the given ages (oldest first, in
/// checkpoint intervals) from the ideal exponential spacing.
fn spacing_cost(ages_oldest_first: &[f64]) -> f64 {
    let n = ages_oldest_first.len();
    if n < 2 {
        return 0.0;
    }
    // Ages newest-first for the ideal formula.
    let ages: Vec<f64> = ages_oldest_first.iter().rev().copied().collect();
    let span = ages[n - 1];
    // Solve r so the oldest ideal n + r^n - 1 reaches the span.
    let k = (n - 1) as f64;
    let target = (span - k + 1.0).max(1.0);
    let r = target.powf(1.0 / k).max(1.0);
    ages.iter()
        .enumerate()
        .map(|(i, age)| {
            let ideal = i as f64 + r.powi(i as i32) - 1.0;
            (age - ideal).abs()
        })
        .sum()
}

#[derive(Debug, Clone)]
struct SnapshotFile {
    path: PathBuf,
    time: DateTime<Utc>,
    size: u64,
}

fn scan(dir: &Path) -> io::Result<Vec<SnapshotFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(time) = parse_snapshot_name(&name) {
            files.push(SnapshotFile {
                path: entry.path(),
                time,
                size: entry.metadata()?.len(),
            });
        }
    }
    files.sort_by_key(|f| f.time);
    Ok(files)
}

/// Delete snapshots one at a time until the directory fits the budget or
/// the count reaches the floor. Returns the deleted paths.
pub fn enforce_budget(
    dir: &Path,
    max_bytes: u64,
    interval_secs: f64,
    min_files: usize,
) -> io::Result<Vec<PathBuf>> {
    let mut deleted = Vec::new();
    loop {
        let files = scan(dir)?;
        let total: u64 = files.iter().map(|f| f.size).sum();
        if total <= max_bytes {
            break;
        }
        let times: Vec<DateTime<Utc>> = files.iter().map(|f| f.time).collect();
        let victim = match choose_victim(&times, interval_secs, min_files) {
            Some(i) => i,
            None => break,
        };
        let path = files[victim].path.clone();
        fs::remove_file(&path)?;
        log::info!("retention deleted snapshot {}", path.display());
        deleted.push(path);
    }
    Ok(deleted)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_540_000_000 + minutes * 60, 0).single().expect("valid time")
    }

    #[test]
    fn filename_round_trip() {
        let time = Utc.timestamp_millis_opt(1541789390548).single().expect("valid");
        let name = crate::snapshot::snapshot_filename(time);
        assert_eq!(name, "2018-11-09T18.49.50.548Z.city");
        assert_eq!(parse_snapshot_name(&name), Some(time));
    }

    #[test]
    fn lexical_order_is_time_order() {
        let a = crate::snapshot::snapshot_filename(t(0));
        let b = crate::snapshot::snapshot_filename(t(1));
        assert!(a < b);
    }

    #[test]
    fn never_deletes_newest_or_below_floor() {
        let times: Vec<_> = (0..3).map(t).collect();
        assert_eq!(choose_victim(&times, 600.0, 3), None);
        for _ in 0..10 {
            if let Some(v) = choose_victim(&times, 600.0, 0) {
                assert!(v < times.len() - 1);
            }
        }
        assert_eq!(choose_victim(&times[..1], 600.0, 0), None);
    }

    #[test]
    fn dense_recent_history_drops_a_middle_snapshot() {
        // Snapshots every 10 minutes for 2 hours at a 10-minute interval:
        // the exponential ideal wants sparse old history, so a victim is
        // found and it is neither the newest nor (usually) the oldest.
        let times: Vec<_> = (0..12).map(|i| t(i * 10)).collect();
        let v = choose_victim(&times, 600.0, 2).expect("should pick a victim");
        assert!(v < times.len() - 1);
    }

    #[test]
    fn spacing_cost_prefers_exponential_layout() {
        // Ages laid out exactly on the ideal curve cost ~0.
        let n = 5usize;
        let r = 2.0f64;
        let ideal: Vec<f64> = (0..n).map(|i| i as f64 + r.powi(i as i32) - 1.0).collect();
        let span = ideal[n - 1];
        let oldest_first: Vec<f64> = ideal.iter().rev().copied().collect();
        assert!(spacing_cost(&oldest_first) < 1e-6);
        // A uniform layout over the same span costs more.
        let uniform: Vec<f64> = (0..n).rev().map(|i| span * i as f64 / (n - 1) as f64).collect();
        assert!(spacing_cost(&uniform) > spacing_cost(&oldest_first));
    }
}
