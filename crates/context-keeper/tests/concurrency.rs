mod common;

use common::*;
use context_keeper::{ContextError, MemoryDatabase};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_concurrent_appends_get_distinct_sequence_numbers() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MemoryDatabase::new(&dir.path().join("context.db")).unwrap());
    let manager = manager(db, ScriptedSummarizer::new(), test_config(1_000_000));
    let sid = manager.get_or_create_session(None, "u").unwrap().session_id;

    const WRITERS: usize = 4;
    const PER_WRITER: usize = 25;

    let mut seqs: Vec<i64> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let manager = &manager;
                let sid = &sid;
                scope.spawn(move || {
                    (0..PER_WRITER)
                        .map(|i| {
                            manager
                                .add_user_message(sid, &format!("writer {} message {}", w, i))
                                .unwrap()
                                .sequence_number
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    seqs.sort_unstable();
    let expected: Vec<i64> = (0..(WRITERS * PER_WRITER) as i64).collect();
    assert_eq!(seqs, expected);

    let session = manager.load_session(&sid).unwrap().unwrap();
    assert_eq!(session.message_count, (WRITERS * PER_WRITER) as i64);
    assert_eq!(session.total_token_count, (WRITERS * PER_WRITER * 4) as i64);
    assert_token_invariant(&manager, &sid);
}

#[tokio::test]
async fn test_second_compression_is_turned_away_while_appends_continue() {
    let summarizer = ScriptedSummarizer::new();
    summarizer.push(Reply::Hang(Duration::from_millis(300)));
    let manager = in_memory(summarizer.clone(), 100);
    let sid = manager.get_or_create_session(None, "u").unwrap().session_id;
    for _ in 0..3 {
        manager.add_user_message(&sid, &words(20)).unwrap();
        manager.add_assistant_message(&sid, &words(20)).unwrap();
    }

    let late_append = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.add_user_message(&sid, &words(7))
    };
    let (first, second, appended) = tokio::join!(
        manager.trigger_compression(&sid),
        manager.trigger_compression(&sid),
        late_append
    );

    let record = first.unwrap();
    assert!(matches!(second, Err(ContextError::CompressionInProgress(_))));
    assert!(appended.is_ok());
    assert_eq!(summarizer.calls(), 1);

    // The message that landed mid-round is kept and counted.
    let session = manager.load_session(&sid).unwrap().unwrap();
    assert_eq!(session.total_token_count, 120 + 7 - record.saved_tokens());
    assert_eq!(session.message_count, 7);
    assert_token_invariant(&manager, &sid);

    // Once the round is done the lock is free again.
    assert!(!matches!(
        manager.trigger_compression(&sid).await,
        Err(ContextError::CompressionInProgress(_))
    ));
}
