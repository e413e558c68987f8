/// Retention policy: the directory budget holds after every checkpoint, or
/// the snapshot count has hit its floor.
use chrono::{DateTime, TimeZone, Utc};
use cityvm::retention::{choose_victim, enforce_budget};
use cityvm::snapshot::snapshot_filename;
use proptest::prelude::*;

fn times_from_offsets(offsets: &[u32]) -> Vec<DateTime<Utc>> {
    let mut sorted: Vec<u32> = offsets.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
        .iter()
        .map(|m| {
            Utc.timestamp_opt(1_600_000_000 + *m as i64 * 60, 0)
                .single()
                .expect("valid time")
        })
        .collect()
}

proptest! {
    #[test]
    fn victim_never_newest_and_floor_is_respected(
        offsets in proptest::collection::vec(0u32..500_000, 1..24),
        min_files in 0usize..6,
        interval in 60.0f64..7200.0,
    ) {
        let times = times_from_offsets(&offsets);
        match choose_victim(&times, interval, min_files) {
            Some(v) => {
                prop_assert!(v < times.len() - 1, "newest must never be deleted");
                prop_assert!(times.len() - 1 >= min_files.max(1));
            }
            None => {
                prop_assert!(times.len() <= min_files.max(1));
            }
        }
    }

    #[test]
    fn repeated_deletion_terminates_at_the_floor(
        offsets in proptest::collection::vec(0u32..500_000, 1..24),
        min_files in 1usize..4,
    ) {
        let mut times = times_from_offsets(&offsets);
        let mut rounds = 0;
        while let Some(v) = choose_victim(&times, 600.0, min_files) {
            times.remove(v);
            rounds += 1;
            prop_assert!(rounds < 64, "deletion must terminate");
        }
        prop_assert!(times.len() <= min_files.max(1));
    }
}

#[test]
fn budget_is_enforced_after_checkpoints() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Ten 1 KiB snapshots, ten minutes apart.
    for i in 0..10 {
        let time = Utc
            .timestamp_opt(1_600_000_000 + i * 600, 0)
            .single()
            .expect("valid time");
        let name = snapshot_filename(time);
        std::fs::write(dir.path().join(name), vec![b'x'; 1024]).expect("write");
    }

    let max = 4 * 1024;
    let deleted = enforce_budget(dir.path(), max, 600.0, 2).expect("enforce");
    assert!(!deleted.is_empty());

    let remaining: Vec<String> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    let total: u64 = remaining.len() as u64 * 1024;
    assert!(total <= max || remaining.len() <= 2, "budget or floor must hold");
    // The newest snapshot always survives.
    let newest = snapshot_filename(
        Utc.timestamp_opt(1_600_000_000 + 9 * 600, 0).single().expect("valid time"),
    );
    assert!(remaining.contains(&newest));
}

#[test]
fn floor_beats_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    for i in 0..3 {
        let time = Utc
            .timestamp_opt(1_600_000_000 + i * 600, 0)
            .single()
            .expect("valid time");
        std::fs::write(dir.path().join(snapshot_filename(time)), vec![b'x'; 1024]).expect("write");
    }
    // Budget smaller than even one file, but the floor keeps all three.
    let deleted = enforce_budget(dir.path(), 100, 600.0, 3).expect("enforce");
    assert!(deleted.is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 3);
}
