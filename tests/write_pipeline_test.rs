mod common;

use quilldb::{
    AtomicWrite, Error, Journal, Ordering, PersistenceId, PersistentRepr, SequenceNr, TagMode,
};

use common::{single_write, test_config, temp_db};

fn group(pid: &str, payloads: &[(i64, &str)]) -> AtomicWrite {
    AtomicWrite::new(
        payloads
            .iter()
            .map(|(seq, payload)| {
                PersistentRepr::new(pid, SequenceNr::from_raw(*seq), payload.as_bytes().to_vec())
            })
            .collect(),
    )
}

#[tokio::test]
async fn atomic_group_is_fully_visible() {
    let (_dir, path) = temp_db("atomic.db");
    let journal = Journal::open(test_config(&path, TagMode::TagTable))
        .await
        .unwrap();

    let results = journal
        .write_messages(
            vec![group("a", &[(1, "e1"), (2, "e2"), (3, "e3")])],
            0,
        )
        .await
        .unwrap();
    assert!(results[0].is_ok());

    let mut stream = journal.read_journal().current_all_events(Ordering::ZERO);
    let envelopes = common::collect_current(&mut stream).await;
    assert_eq!(envelopes.len(), 3);
    let seqs: Vec<i64> = envelopes
        .iter()
        .map(|e| e.sequence_number.as_raw())
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn failed_group_is_fully_absent() {
    let (_dir, path) = temp_db("atomic_fail.db");
    let journal = Journal::open(test_config(&path, TagMode::TagTable))
        .await
        .unwrap();

    journal
        .write_messages(vec![single_write("a", 1, "original")], 0)
        .await
        .unwrap();

    // The group's first event is fine, the second collides with seq 1.
    // The whole group must vanish, not half of it.
    let outcome = journal
        .write_messages(vec![group("a", &[(2, "fresh"), (1, "dup")])], 0)
        .await;
    assert!(matches!(outcome, Err(Error::BatchFailed(_))));

    let mut stream = journal.read_journal().current_all_events(Ordering::ZERO);
    let envelopes = common::collect_current(&mut stream).await;
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].sequence_number.as_raw(), 1);
}

#[tokio::test]
async fn serialization_failures_are_positional() {
    let (_dir, path) = temp_db("positional.db");
    let journal = Journal::open(test_config(&path, TagMode::TagTable))
        .await
        .unwrap();

    // A tag carrying the CSV separator fails that write's serialization.
    let bad = AtomicWrite::single(
        PersistentRepr::new("b", SequenceNr::FIRST, b"x".to_vec())
            .with_tags([quilldb::Tag::new("se;parated")]),
    );

    let results = journal
        .write_messages(
            vec![single_write("a", 1, "ok"), bad, single_write("c", 1, "ok too")],
            0,
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(Error::Serialization { .. })));
    assert!(results[2].is_ok());

    // The siblings landed.
    let highest_a = journal
        .highest_sequence_nr(PersistenceId::new("a"), SequenceNr::ZERO)
        .await
        .unwrap();
    let highest_b = journal
        .highest_sequence_nr(PersistenceId::new("b"), SequenceNr::ZERO)
        .await
        .unwrap();
    assert_eq!(highest_a.as_raw(), 1);
    assert_eq!(highest_b.as_raw(), 0);
}

#[tokio::test]
async fn saturated_queue_drops_newest_with_queue_full() {
    let (_dir, path) = temp_db("backpressure.db");
    let mut config = test_config(&path, TagMode::TagTable);
    config.buffer_size = 2;
    config.batch_size = 1; // one entry per transaction
    config.parallelism = 1; // single flush at a time
    let journal = Journal::open(config).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..100 {
        let journal = journal.clone();
        tasks.push(tokio::spawn(async move {
            let pid = format!("pid-{i}");
            let result = journal
                .write_messages(vec![single_write(&pid, 1, "payload")], 0)
                .await;
            (pid, result)
        }));
    }

    let mut accepted = Vec::new();
    let mut dropped = Vec::new();
    for task in tasks {
        let (pid, result) = task.await.unwrap();
        match result {
            Ok(results) => {
                assert!(results[0].is_ok());
                accepted.push(pid);
            }
            Err(Error::QueueFull) => dropped.push(pid),
            Err(other) => panic!("unexpected failure: {other}"),
        }
    }

    assert!(
        !dropped.is_empty(),
        "a buffer of 2 cannot absorb 100 concurrent writes"
    );
    assert!(!accepted.is_empty(), "some writes must get through");

    // No partial writes either way: accepted ids have exactly their
    // event, dropped ids have nothing.
    for pid in &accepted {
        let highest = journal
            .highest_sequence_nr(PersistenceId::new(pid.as_str()), SequenceNr::ZERO)
            .await
            .unwrap();
        assert_eq!(highest.as_raw(), 1, "accepted write missing for {pid}");
    }
    for pid in &dropped {
        let highest = journal
            .highest_sequence_nr(PersistenceId::new(pid.as_str()), SequenceNr::ZERO)
            .await
            .unwrap();
        assert_eq!(highest.as_raw(), 0, "dropped write leaked for {pid}");
    }
}

#[tokio::test]
async fn concurrent_writers_never_corrupt_per_id_order() {
    let (_dir, path) = temp_db("concurrent.db");
    let journal = Journal::open(test_config(&path, TagMode::TagTable))
        .await
        .unwrap();

    // Ten writers, each the single writer for its own persistence id.
    let mut tasks = Vec::new();
    for w in 0..10 {
        let journal = journal.clone();
        tasks.push(tokio::spawn(async move {
            let pid = format!("writer-{w}");
            for seq in 1..=20 {
                journal
                    .write_messages(vec![single_write(&pid, seq, "event")], 0)
                    .await
                    .unwrap()
                    .remove(0)
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for w in 0..10 {
        let pid = format!("writer-{w}");
        let mut replay = journal.read_journal().messages(
            PersistenceId::new(pid.as_str()),
            SequenceNr::FIRST,
            SequenceNr::MAX,
            u64::MAX,
        );
        let mut expected = 1;
        while let Some(event) = replay.next().await {
            assert_eq!(event.unwrap().sequence_number.as_raw(), expected);
            expected += 1;
        }
        assert_eq!(expected, 21, "{pid} must replay 1..=20 gap-free");
    }
}
