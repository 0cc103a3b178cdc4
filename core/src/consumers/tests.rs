//! Consumer-group runtime tests

use super::group::CommitHook;
use super::*;
use crate::cluster::OffsetCommit;
use crate::protocol::{Message, NamespaceName};
use crate::MeshmqError;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

fn new_group(size: u32) -> Arc<ConsumerGroup> {
    Arc::new(ConsumerGroup::new(
        NamespaceName::new("default", "workers"),
        size,
        Arc::new(AtomicU64::new(0)),
    ))
}

fn message(body: &str) -> Message {
    Message {
        routing_key: "rk".to_string(),
        body: body.as_bytes().to_vec().into(),
        ..Default::default()
    }
}

async fn publish(group: &Arc<ConsumerGroup>, body: &str, offset: u64) {
    group
        .publish("t".to_string(), message(body), 1, offset)
        .await
        .unwrap();
}

#[tokio::test]
async fn subscribe_next_ack_roundtrip() {
    let group = new_group(16);
    let mut sub = group.subscribe(4);

    publish(&group, "hello", 0).await;

    let delivery = sub.next().await.unwrap();
    assert_eq!(delivery.message.body.as_ref(), b"hello");
    sub.ack(delivery.seq_no).unwrap();
}

#[tokio::test]
async fn round_robin_across_subscriptions() {
    let group = new_group(16);
    let mut first = group.subscribe(4);
    let mut second = group.subscribe(4);

    for i in 0..4 {
        publish(&group, &format!("m{}", i), i).await;
    }

    // two each, alternating
    let a = first.next().await.unwrap();
    let b = second.next().await.unwrap();
    let c = first.next().await.unwrap();
    let d = second.next().await.unwrap();
    assert_eq!(a.message.body.as_ref(), b"m0");
    assert_eq!(b.message.body.as_ref(), b"m1");
    assert_eq!(c.message.body.as_ref(), b"m2");
    assert_eq!(d.message.body.as_ref(), b"m3");
}

#[tokio::test]
async fn credit_gates_delivery_until_ack() {
    let group = new_group(16);
    let mut sub = group.subscribe(1);

    publish(&group, "first", 0).await;
    publish(&group, "second", 1).await;

    let first = sub.next().await.unwrap();

    // no credit left; the second message must not arrive yet
    let pending = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
    assert!(pending.is_err());

    sub.ack(first.seq_no).unwrap();
    let second = sub.next().await.unwrap();
    assert_eq!(second.message.body.as_ref(), b"second");
}

#[tokio::test]
async fn acked_message_never_reappears() {
    let group = new_group(16);
    let mut sub = group.subscribe(4);

    publish(&group, "only", 0).await;
    let delivery = sub.next().await.unwrap();
    sub.ack(delivery.seq_no).unwrap();

    let nothing = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn nack_with_requeue_redelivers() {
    let group = new_group(16);
    let mut sub = group.subscribe(4);

    publish(&group, "retry-me", 0).await;
    let first = sub.next().await.unwrap();
    sub.nack(first.seq_no, true).unwrap();

    let second = sub.next().await.unwrap();
    assert_eq!(second.message.body.as_ref(), b"retry-me");
    assert_eq!(second.seq_no, first.seq_no);
}

#[tokio::test]
async fn nack_without_requeue_acts_as_ack() {
    let group = new_group(16);
    let mut sub = group.subscribe(4);

    publish(&group, "drop-me", 0).await;
    let delivery = sub.next().await.unwrap();
    sub.nack(delivery.seq_no, false).unwrap();

    let nothing = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn close_releases_inflight_to_other_subscription() {
    let group = new_group(16);
    let mut doomed = group.subscribe(4);

    publish(&group, "orphan", 0).await;
    let delivery = doomed.next().await.unwrap();
    assert_eq!(delivery.message.body.as_ref(), b"orphan");

    let mut survivor = group.subscribe(4);
    doomed.close();

    let redelivered = survivor.next().await.unwrap();
    assert_eq!(redelivered.message.body.as_ref(), b"orphan");
}

#[tokio::test]
async fn closed_subscription_wakes_blocked_next() {
    let group = new_group(16);
    let mut sub = group.subscribe(4);
    let id = sub.id();

    let waiter = tokio::spawn(async move { sub.next().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    group.close_subscription(id);

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(MeshmqError::SubscriptionClosed)));
}

#[tokio::test]
async fn group_close_wakes_everyone() {
    let group = new_group(16);
    let mut sub = group.subscribe(4);

    let waiter = tokio::spawn(async move { sub.next().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    group.close();

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(MeshmqError::SubscriptionClosed)));
}

#[tokio::test]
async fn publish_blocks_on_full_queue() {
    let group = new_group(1);

    publish(&group, "fills-queue", 0).await;

    let blocked = {
        let group = Arc::clone(&group);
        tokio::spawn(async move {
            group
                .publish("t".to_string(), message("waits"), 1, 1)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!blocked.is_finished());

    // draining the queue unblocks the publisher
    let mut sub = group.subscribe(2);
    let first = sub.next().await.unwrap();
    sub.ack(first.seq_no).unwrap();

    blocked.await.unwrap().unwrap();
    let second = sub.next().await.unwrap();
    assert_eq!(second.message.body.as_ref(), b"waits");
}

#[tokio::test]
async fn ack_advances_offset_commit_in_order() {
    let group = new_group(16);
    let commits: Arc<Mutex<Vec<Vec<OffsetCommit>>>> = Arc::new(Mutex::new(Vec::new()));
    let hook: CommitHook = {
        let commits = Arc::clone(&commits);
        Arc::new(move |update| -> super::group::CommitFuture {
            let commits = Arc::clone(&commits);
            Box::pin(async move {
                commits.lock().push(update);
                Ok(())
            })
        })
    };
    tokio::spawn(Arc::clone(&group).run_commits(hook));

    let mut sub = group.subscribe(4);
    publish(&group, "a", 0).await;
    publish(&group, "b", 1).await;

    let first = sub.next().await.unwrap();
    let second = sub.next().await.unwrap();

    // acking out of order: the commit may only advance once the lowest
    // outstanding offset is acknowledged
    sub.ack(second.seq_no).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(commits.lock().is_empty());

    sub.ack(first.seq_no).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = commits.lock();
    let last = seen.last().expect("commit update expected");
    assert_eq!(
        last.as_slice(),
        &[OffsetCommit {
            segment_id: 1,
            offset: 2
        }]
    );
}

#[tokio::test]
async fn unbounded_subscription_needs_no_credit() {
    let group = new_group(16);
    let mut sub = group.subscribe(0);

    for i in 0..8 {
        publish(&group, &format!("m{}", i), i).await;
    }
    for i in 0..8 {
        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.message.body.as_ref(), format!("m{}", i).as_bytes());
        sub.ack(delivery.seq_no).unwrap();
    }
}
