use mm2::codec::SectorData;
use mm2::config::EngineConfig;
use mm2::disk::{DiskStore, RecordKind, MAGIC_NORMAL};
use mm2::journal::{Journal, JournalOp};
use mm2::{Engine, UploadSource};

fn config(spool_root: &std::path::Path, pool_capacity: u32) -> EngineConfig {
    EngineConfig {
        pool_capacity,
        spool_root: spool_root.to_path_buf(),
        spill_high_pct: 50,
        disk_acceptable_pct: 80,
        disk_quota_bytes: 0,
        shutdown_deadline_ms: 5_000,
        max_batch_tsd: 6,
        max_batch_evt: 3,
        emergency_enabled: true,
    }
}

#[test]
fn orphan_temp_file_from_interrupted_create_is_removed_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let spool_root = dir.path().to_path_buf();
    let can_dir = spool_root.join("can");
    std::fs::create_dir_all(&can_dir).unwrap();

    let temp_path = can_dir.join("sensor_001_20260101_000.dat.tmp");
    let final_path = can_dir.join("sensor_001_20260101_000.dat");
    std::fs::write(&temp_path, b"partial spool file, crash happened before rename").unwrap();

    {
        let mut journal = Journal::open(&spool_root.join("recovery.journal")).unwrap();
        journal
            .append(JournalOp::CreateFile {
                temp_path: temp_path.display().to_string(),
                final_path: final_path.display().to_string(),
            })
            .unwrap();
        // Dropped without `complete` — simulates a crash between the temp
        // write and the rename.
    }
    assert!(temp_path.exists());

    let engine = Engine::open(config(&spool_root, 8)).unwrap();
    assert!(!temp_path.exists(), "orphan temp file must be cleaned up during recovery");
    assert!(!final_path.exists());
    assert_eq!(engine.stats().disk_files, 0);
}

#[test]
fn interrupted_delete_is_finished_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let spool_root = dir.path().to_path_buf();
    let hosted_dir = spool_root.join("hosted");
    std::fs::create_dir_all(&hosted_dir).unwrap();

    let final_path = {
        let mut journal = Journal::open(&spool_root.join("recovery.journal")).unwrap();
        let mut store = DiskStore::open(&hosted_dir).unwrap();
        let mut data = SectorData::new_tsd(1000);
        for v in 0..6u32 {
            data.tsd_push(v).unwrap();
        }
        store.write_file(&mut journal, 42, RecordKind::Tsd, &[data], 1000, 1000, MAGIC_NORMAL).unwrap()
    };
    assert!(final_path.exists());

    {
        let mut journal = Journal::open(&spool_root.join("recovery.journal")).unwrap();
        journal.append(JournalOp::DeleteFile { final_path: final_path.display().to_string() }).unwrap();
        // Dropped without `complete` — the unlink never ran before the crash.
    }
    assert!(final_path.exists());

    let engine = Engine::open(config(&spool_root, 8)).unwrap();
    assert!(!final_path.exists(), "interrupted delete must be finished during recovery");
    assert_eq!(engine.stats().disk_files, 0);
}

#[test]
fn corrupt_spool_file_is_quarantined_and_excluded_from_recovered_stats() {
    let dir = tempfile::tempdir().unwrap();
    let spool_root = dir.path().to_path_buf();

    let corrupt_path = {
        let engine = Engine::open(config(&spool_root, 8)).unwrap();
        for i in 0..48u64 {
            engine.write_tsd(UploadSource::CanDevice, 1, 1000, i * 1000, i as u32).unwrap();
        }
        for t in 0..10u64 {
            engine.tick(t).unwrap();
        }
        assert!(engine.stats().disk_files > 0);
        let can_dir = spool_root.join(UploadSource::CanDevice.dir_name());
        std::fs::read_dir(&can_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().and_then(|e| e.to_str()) == Some("dat"))
            .expect("migration must have produced a .dat file")
    };

    let mut bytes = std::fs::read(&corrupt_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&corrupt_path, bytes).unwrap();

    let reopened = Engine::open(config(&spool_root, 8)).unwrap();
    assert_eq!(reopened.stats().disk_files, 0, "corrupt file must not be counted as recovered");
    let corrupted_dir = spool_root.join(UploadSource::CanDevice.dir_name()).join("corrupted");
    let quarantined = std::fs::read_dir(&corrupted_dir).unwrap().count();
    assert_eq!(quarantined, 1);
}

#[test]
fn recovery_preserves_fifo_order_across_multiple_spool_files() {
    let dir = tempfile::tempdir().unwrap();
    let spool_root = dir.path().to_path_buf();

    {
        let engine = Engine::open(config(&spool_root, 4)).unwrap();
        for i in 0..300u64 {
            engine.write_tsd(UploadSource::CanDevice, 7, 1000, i * 1000, i as u32).unwrap();
            engine.tick(i).unwrap();
        }
        // No graceful shutdown — the tail sector still being written is
        // expected to be lost, but everything already spooled must not be
        // reordered by the restart.
    }

    let reopened = Engine::open(config(&spool_root, 4)).unwrap();
    assert!(reopened.stats().disk_files > 1, "expected more than one spool file to have been produced");

    let recovered = reopened.total_count(UploadSource::CanDevice, 7).unwrap();
    assert!(recovered > 0);
    let batch = reopened.read_bulk(UploadSource::CanDevice, 7, recovered as u32).unwrap();
    assert_eq!(batch.len() as u64, recovered);
    for (idx, record) in batch.iter().enumerate() {
        assert_eq!(record.value, idx as u32, "FIFO chain order must survive a restart");
    }
}
