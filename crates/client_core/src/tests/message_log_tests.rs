use super::*;
use crate::test_support::{ids, message};
use std::sync::{Arc, Mutex};

fn seeded(snapshot_ids: &[i64]) -> MessageLog {
    let mut log = MessageLog::new();
    log.merge(snapshot_ids.iter().copied().map(message).collect())
        .expect("merge");
    log
}

fn assert_strictly_ascending(log: &MessageLog) {
    assert!(
        log.messages().windows(2).all(|w| w[0].id < w[1].id),
        "log out of order: {:?}",
        ids(log.messages())
    );
}

#[test]
fn append_of_known_id_leaves_log_unchanged() {
    let mut log = seeded(&[1, 2, 3]);
    let before = log.messages().to_vec();

    for id in [1, 2, 3] {
        assert_eq!(log.append(message(id)), AppendOutcome::Duplicate);
    }
    assert_eq!(log.messages(), before.as_slice());
}

#[test]
fn live_message_received_before_merge_lands_after_snapshot() {
    let mut log = MessageLog::new();
    assert_eq!(log.append(message(3)), AppendOutcome::Buffered);
    assert!(log.is_empty());
    assert_eq!(log.pending_len(), 1);

    log.merge(vec![message(1), message(2)]).expect("merge");
    assert_eq!(ids(log.messages()), vec![1, 2, 3]);
    assert_eq!(log.pending_len(), 0);
}

#[test]
fn buffered_messages_already_in_snapshot_are_dropped_on_replay() {
    let mut log = MessageLog::new();
    log.append(message(2));
    log.append(message(4));
    log.append(message(4));

    log.merge(vec![message(1), message(2), message(3)])
        .expect("merge");
    assert_eq!(ids(log.messages()), vec![1, 2, 3, 4]);
}

#[test]
fn duplicate_live_delivery_yields_single_entry() {
    let mut log = seeded(&[1, 2]);
    assert!(matches!(log.append(message(5)), AppendOutcome::Inserted { .. }));
    assert_eq!(log.append(message(5)), AppendOutcome::Duplicate);
    assert_eq!(
        log.messages().iter().filter(|m| m.id == MessageId(5)).count(),
        1
    );
}

#[test]
fn out_of_order_delivery_is_inserted_by_id() {
    let mut log = seeded(&[10, 20]);
    assert_eq!(log.append(message(30)), AppendOutcome::Inserted { index: 2 });
    assert_eq!(log.append(message(15)), AppendOutcome::Inserted { index: 1 });
    assert_eq!(log.append(message(5)), AppendOutcome::Inserted { index: 0 });
    assert_eq!(ids(log.messages()), vec![5, 10, 15, 20, 30]);
    assert_eq!(log.last_id(), Some(MessageId(30)));
}

#[test]
fn ordering_holds_after_mixed_sequence() {
    let mut log = MessageLog::new();
    for id in [17, 3, 9, 3] {
        log.append(message(id));
    }
    log.merge(vec![message(8), message(1), message(8), message(4)])
        .expect("merge");
    for id in [2, 17, 12, 1, 40, 39, 9] {
        log.append(message(id));
        assert_strictly_ascending(&log);
    }
    assert_eq!(
        ids(log.messages()),
        vec![1, 2, 3, 4, 8, 9, 12, 17, 39, 40]
    );
}

#[test]
fn second_merge_is_rejected() {
    let mut log = seeded(&[1]);
    assert_eq!(log.merge(vec![message(2)]), Err(LogError::AlreadySeeded));
    assert_eq!(ids(log.messages()), vec![1]);
}

#[test]
fn subscribers_see_every_mutation_in_order() {
    let seen: Arc<Mutex<Vec<(LogMutation, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut log = MessageLog::new();
    let sink = Arc::clone(&seen);
    log.subscribe(move |mutation, messages| {
        sink.lock().expect("lock").push((mutation, messages.len()));
    });

    log.append(message(3));
    log.merge(vec![message(1), message(2)]).expect("merge");
    log.append(message(3));
    log.append(message(4));
    log.clear();

    assert_eq!(
        *seen.lock().expect("lock"),
        vec![
            (LogMutation::Seeded { count: 2 }, 2),
            (
                LogMutation::Inserted {
                    id: MessageId(3),
                    index: 2
                },
                3
            ),
            (
                LogMutation::Inserted {
                    id: MessageId(4),
                    index: 3
                },
                4
            ),
            (LogMutation::Cleared, 0),
        ]
    );
}

#[test]
fn unsubscribed_callback_is_not_invoked() {
    let calls = Arc::new(Mutex::new(0usize));
    let mut log = MessageLog::new();
    let counter = Arc::clone(&calls);
    let id = log.subscribe(move |_, _| *counter.lock().expect("lock") += 1);

    log.merge(Vec::new()).expect("merge");
    assert!(log.unsubscribe(id));
    assert!(!log.unsubscribe(id));
    log.append(message(1));

    assert_eq!(*calls.lock().expect("lock"), 1);
}

#[test]
fn clear_resets_to_unseeded() {
    let mut log = seeded(&[1, 2]);
    log.clear();
    assert!(log.is_empty());
    assert!(!log.is_seeded());
    assert_eq!(log.append(message(3)), AppendOutcome::Buffered);
}
