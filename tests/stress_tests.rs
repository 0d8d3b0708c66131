//! Stress tests: randomized trees and concurrent event producers.

mod common;

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use folder_integrity_monitor::integrity::checker::FolderIntegrityChecker;
use folder_integrity_monitor::watcher::events::{ChangeEvent, event_channel};

use common::{ScriptedProvider, enabled_checker, eventually, quiet_options, write_file};

const WAIT: Duration = Duration::from_secs(30);

fn random_tree(rng: &mut StdRng, root: &std::path::Path, files: usize) -> Vec<PathBuf> {
    (0..files)
        .map(|i| {
            let depth = rng.random_range(0..4);
            let mut rel = String::new();
            for _ in 0..depth {
                rel.push_str(&format!("d{}/", rng.random_range(0..3)));
            }
            rel.push_str(&format!("file-{i}.bin"));
            let mut contents = vec![0_u8; rng.random_range(0..2048)];
            rng.fill(&mut contents[..]);
            write_file(root, &rel, &contents)
        })
        .collect()
}

#[test]
fn stress_rebuild_then_detect_random_tampering() {
    let mut rng = StdRng::seed_from_u64(0x00F1_u64);
    let dir = tempfile::tempdir().unwrap();
    let checker = enabled_checker(dir.path(), quiet_options(ScriptedProvider::new()));
    let files = random_tree(&mut rng, checker.root(), 200);

    let report = checker.rebuild_database();
    assert_eq!(report.indexed, files.len());
    assert!(checker.verify_integrity(|_, _, _| {}, None).is_clean());

    let mut tampered = BTreeSet::new();
    for _ in 0..25 {
        let idx = rng.random_range(0..files.len());
        let mut contents = fs::read(&files[idx]).unwrap();
        contents.push(rng.random());
        fs::write(&files[idx], contents).unwrap();
        tampered.insert(files[idx].clone());
    }

    let mut reported = BTreeSet::new();
    let report = checker.verify_integrity(
        |path, expected, _| {
            assert!(expected.is_some());
            reported.insert(path.to_path_buf());
        },
        None,
    );
    assert_eq!(reported, tampered);
    assert_eq!(report.mismatches(), tampered.len());
    assert_eq!(report.checked, files.len());

    // Reopening from disk sees the same database.
    checker.save_database().unwrap();
    let db_path = checker.database_path().to_path_buf();
    checker.close().unwrap();
    let reopened =
        FolderIntegrityChecker::open(dir.path(), quiet_options(ScriptedProvider::new())).unwrap();
    assert_eq!(reopened.len(), files.len());
    assert!(db_path.exists());
}

#[test]
fn stress_concurrent_producers_converge() {
    let mut rng = StdRng::seed_from_u64(42);
    let dir = tempfile::tempdir().unwrap();
    let checker = enabled_checker(dir.path(), quiet_options(ScriptedProvider::new()));
    let files = Arc::new(random_tree(&mut rng, checker.root(), 120));

    let (tx, rx) = event_channel(64);
    checker.attach_events(rx).unwrap();

    let started = Instant::now();
    let producers: Vec<_> = (0..4)
        .map(|worker| {
            let tx = tx.clone();
            let files = Arc::clone(&files);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(worker);
                for _ in 0..300 {
                    let path = files[rng.random_range(0..files.len())].clone();
                    let event = if rng.random_bool(0.5) {
                        ChangeEvent::Created(path)
                    } else {
                        ChangeEvent::Changed(path)
                    };
                    // A full channel drops the event; the final sweep below
                    // covers every file regardless.
                    let _ = tx.send(event);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    // Announce every file once more so dropped events cannot leave gaps.
    for path in files.iter() {
        while !tx.send(ChangeEvent::Changed(path.clone())) {
            thread::sleep(Duration::from_millis(1));
        }
    }

    assert!(eventually(WAIT, || checker.len() == files.len()));
    assert!(checker.wait_for_idle(WAIT));
    let report = checker.verify_integrity(|_, _, _| {}, None);
    assert!(report.is_clean(), "{report:?}");
    assert!(started.elapsed() < WAIT * 2);
}
