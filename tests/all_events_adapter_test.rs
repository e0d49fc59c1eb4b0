mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use quilldb::{Journal, Ordering, TagMode};

use common::{single_write, tagger, temp_db, test_config, triple, AppleAdapter};

async fn write_sequence(journal: &Journal, writes: &[(&str, i64, &str)]) {
    for (pid, seq, payload) in writes {
        journal
            .write_messages(vec![single_write(pid, *seq, payload)], 0)
            .await
            .unwrap()
            .remove(0)
            .unwrap();
    }
}

#[tokio::test]
async fn suppressed_rows_vanish_but_the_stream_completes() {
    let (_dir, path) = temp_db("suppress.db");
    let journal = Journal::open_with_serializer(test_config(&path, TagMode::TagTable), tagger())
        .await
        .unwrap();

    write_sequence(
        &journal,
        &[
            ("a", 1, "hello"),
            ("b", 1, "a black car"),
            ("a", 2, "something else"),
            ("a", 3, "a green banana"),
            ("a", 4, "an invalid apple"),
            ("b", 2, "a green leaf"),
            ("b", 3, "a repeated green leaf"),
            ("b", 4, "a repeated green leaf"),
        ],
    )
    .await;

    let mut stream = journal
        .read_journal_with_adapter(Arc::new(AppleAdapter))
        .current_all_events(Ordering::ZERO);
    let triples: Vec<_> = common::collect_current(&mut stream)
        .await
        .iter()
        .map(triple)
        .collect();

    assert_eq!(
        triples,
        vec![
            ("a".to_string(), 1, "hello".to_string()),
            ("b".to_string(), 1, "a black car".to_string()),
            ("a".to_string(), 2, "something else".to_string()),
            ("a".to_string(), 3, "a green banana".to_string()),
            ("b".to_string(), 2, "a green leaf".to_string()),
            ("b".to_string(), 3, "a repeated green leaf".to_string()),
            ("b".to_string(), 4, "a repeated green leaf".to_string()),
        ]
    );
}

#[tokio::test]
async fn duplicated_rows_fan_out_in_place() {
    let (_dir, path) = temp_db("duplicate.db");
    let journal = Journal::open_with_serializer(test_config(&path, TagMode::TagTable), tagger())
        .await
        .unwrap();

    write_sequence(
        &journal,
        &[
            ("a", 1, "hello"),
            ("b", 1, "a black car"),
            ("a", 2, "something else"),
            ("a", 3, "a green banana"),
            ("a", 4, "a duplicated apple"),
            ("b", 2, "a green leaf"),
            ("b", 3, "a repeated green leaf"),
            ("b", 4, "a repeated green leaf"),
        ],
    )
    .await;

    let mut stream = journal
        .read_journal_with_adapter(Arc::new(AppleAdapter))
        .current_all_events(Ordering::ZERO);
    let triples: Vec<_> = common::collect_current(&mut stream)
        .await
        .iter()
        .map(triple)
        .collect();

    assert_eq!(
        triples,
        vec![
            ("a".to_string(), 1, "hello".to_string()),
            ("b".to_string(), 1, "a black car".to_string()),
            ("a".to_string(), 2, "something else".to_string()),
            ("a".to_string(), 3, "a green banana".to_string()),
            ("a".to_string(), 4, "a duplicated apple-1".to_string()),
            ("a".to_string(), 4, "a duplicated apple-2".to_string()),
            ("b".to_string(), 2, "a green leaf".to_string()),
            ("b".to_string(), 3, "a repeated green leaf".to_string()),
            ("b".to_string(), 4, "a repeated green leaf".to_string()),
        ]
    );
}

#[tokio::test]
async fn full_pages_of_suppressed_rows_still_terminate() {
    let (_dir, path) = temp_db("all_invalid.db");
    let mut config = test_config(&path, TagMode::TagTable);
    // Tiny pages: every fetched page adapts to zero envelopes, and the
    // cursor must still march to the horizon.
    config.max_buffer_size = 2;
    let journal = Journal::open(config).await.unwrap();

    write_sequence(
        &journal,
        &[
            ("a", 1, "an invalid apple"),
            ("a", 2, "an invalid apple"),
            ("a", 3, "an invalid apple"),
            ("a", 4, "an invalid apple"),
            ("a", 5, "an invalid apple"),
        ],
    )
    .await;

    let mut stream = journal
        .read_journal_with_adapter(Arc::new(AppleAdapter))
        .current_all_events(Ordering::ZERO);

    let outcome = tokio::time::timeout(Duration::from_secs(5), stream.next()).await;
    assert!(
        matches!(outcome, Ok(None)),
        "the stream must complete with zero envelopes, not hang"
    );
}

#[tokio::test]
async fn page_size_bounds_rows_not_envelopes() {
    let (_dir, path) = temp_db("fanout_pages.db");
    let mut config = test_config(&path, TagMode::TagTable);
    config.max_buffer_size = 2;
    let journal = Journal::open(config).await.unwrap();

    // Every row doubles: 4 rows, 8 envelopes, pages of 2 rows each.
    write_sequence(
        &journal,
        &[
            ("a", 1, "a duplicated w"),
            ("a", 2, "a duplicated x"),
            ("a", 3, "a duplicated y"),
            ("a", 4, "a duplicated z"),
        ],
    )
    .await;

    let stream = journal
        .read_journal_with_adapter(Arc::new(AppleAdapter))
        .current_all_events(Ordering::ZERO);
    let envelopes: Vec<_> = stream.into_stream().collect().await;

    assert_eq!(envelopes.len(), 8);
    let seqs: Vec<i64> = envelopes
        .iter()
        .map(|e| e.as_ref().unwrap().sequence_number.as_raw())
        .collect();
    assert_eq!(seqs, vec![1, 1, 2, 2, 3, 3, 4, 4]);
}

#[tokio::test]
async fn live_all_events_follows_the_log() {
    let (_dir, path) = temp_db("live_all.db");
    let journal = Journal::open(test_config(&path, TagMode::TagTable))
        .await
        .unwrap();

    write_sequence(&journal, &[("a", 1, "one"), ("b", 1, "two")]).await;

    let mut stream = journal.read_journal().live_all_events(Ordering::ZERO);
    for expected in 1..=2 {
        let envelope = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("catch-up envelope")
            .unwrap()
            .unwrap();
        assert_eq!(envelope.ordering.as_raw(), expected);
    }

    write_sequence(&journal, &[("a", 2, "three")]).await;
    let envelope = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("live envelope")
        .unwrap()
        .unwrap();
    assert_eq!(envelope.ordering.as_raw(), 3);
    assert_eq!(triple(&envelope), ("a".to_string(), 2, "three".to_string()));
}

#[tokio::test]
async fn current_persistence_ids_lists_each_id_once() {
    let (_dir, path) = temp_db("pids.db");
    let journal = Journal::open(test_config(&path, TagMode::TagTable))
        .await
        .unwrap();

    write_sequence(
        &journal,
        &[("beta", 1, "x"), ("alpha", 1, "x"), ("beta", 2, "x")],
    )
    .await;

    let mut stream = journal.read_journal().current_persistence_ids();
    let mut ids = Vec::new();
    while let Some(item) = stream.next().await {
        ids.push(item.unwrap().as_str().to_string());
    }
    assert_eq!(ids, vec!["alpha", "beta"]);
}

#[tokio::test]
async fn live_persistence_ids_announce_new_ids_only() {
    let (_dir, path) = temp_db("live_pids.db");
    let journal = Journal::open(test_config(&path, TagMode::TagTable))
        .await
        .unwrap();

    write_sequence(&journal, &[("a", 1, "x")]).await;

    let mut stream = journal.read_journal().live_persistence_ids();
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("first id")
        .unwrap()
        .unwrap();
    assert_eq!(first.as_str(), "a");

    write_sequence(&journal, &[("a", 2, "x"), ("b", 1, "x")]).await;
    let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("new id")
        .unwrap()
        .unwrap();
    assert_eq!(second.as_str(), "b");
}
