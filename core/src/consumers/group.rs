use super::{SeqNo, SubscriptionId};
use crate::cluster::{OffsetCommit, SegmentId};
use crate::protocol::{Message, NamespaceName};
use crate::{MeshmqError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// A message handed to a subscription, carrying enough context to
/// acknowledge it and to advance the offset commit of its source segment.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub message: Message,
    pub segment_id: SegmentId,
    /// Record offset within the source segment.
    pub offset: u64,
    pub seq_no: SeqNo,
}

pub type CommitFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Called by the commit task with the group's current offset commits.
/// The broker wires this to a `ConsumerGroupOffsetCommitsUpdate` command.
pub type CommitHook = Arc<dyn Fn(Vec<OffsetCommit>) -> CommitFuture + Send + Sync>;

struct SubEntry {
    id: SubscriptionId,
    /// `None` means unbounded (the caller auto-acks).
    credit: Option<u32>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct SegmentProgress {
    /// Offsets enqueued or in flight, not yet acknowledged.
    outstanding: BTreeSet<u64>,
    /// One past the highest offset seen.
    end: u64,
    /// Everything below this offset is acknowledged.
    committed: u64,
}

#[derive(Default)]
struct GroupInner {
    queue: VecDeque<Delivery>,
    subscriptions: Vec<SubEntry>,
    rr_cursor: usize,
    inflight: HashMap<(SubscriptionId, SeqNo), Delivery>,
    next_seq_no: SeqNo,
    offsets: HashMap<SegmentId, SegmentProgress>,
    commit_dirty: bool,
}

/// Per-group in-memory delivery engine. See the module docs.
pub struct ConsumerGroup {
    name: NamespaceName,
    /// Bound on queued-undelivered messages.
    size: usize,
    inner: Mutex<GroupInner>,
    /// Wakes publishers blocked on a full work queue.
    space: Notify,
    /// Wakes the offset-commit task.
    commit_wake: Notify,
    ids: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl ConsumerGroup {
    /// `ids` is the node-wide subscription id counter, shared across groups.
    pub fn new(name: NamespaceName, size: u32, ids: Arc<AtomicU64>) -> Self {
        Self {
            name,
            size: size.max(1) as usize,
            inner: Mutex::new(GroupInner::default()),
            space: Notify::new(),
            commit_wake: Notify::new(),
            ids,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &NamespaceName {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Seed the committed offset of a source segment, e.g. from the group's
    /// catalog entry when the runtime starts.
    pub fn restore_offset(&self, segment_id: SegmentId, committed: u64) {
        let mut inner = self.inner.lock();
        let progress = inner.offsets.entry(segment_id).or_default();
        progress.committed = progress.committed.max(committed);
        progress.end = progress.end.max(committed);
    }

    /// Enqueue a message for delivery. Blocks while the work queue is at
    /// capacity; fails once the group is closed.
    pub async fn publish(
        &self,
        topic: String,
        message: Message,
        segment_id: SegmentId,
        offset: u64,
    ) -> Result<()> {
        loop {
            if self.is_closed() {
                return Err(MeshmqError::Shutdown);
            }
            {
                let mut inner = self.inner.lock();
                if inner.queue.len() < self.size {
                    let seq_no = inner.next_seq_no;
                    inner.next_seq_no += 1;
                    let progress = inner.offsets.entry(segment_id).or_default();
                    progress.outstanding.insert(offset);
                    progress.end = progress.end.max(offset + 1);
                    inner.queue.push_back(Delivery {
                        topic,
                        message,
                        segment_id,
                        offset,
                        seq_no,
                    });
                    self.dispatch(&mut inner);
                    return Ok(());
                }
            }
            self.space.notified().await;
        }
    }

    /// Create a subscription with initial credit `n`. Zero means unbounded
    /// credit, for callers that acknowledge immediately after sending.
    pub fn subscribe(self: &Arc<Self>, n: u32) -> Subscription {
        let id = self.ids.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock();
            inner.subscriptions.push(SubEntry {
                id,
                credit: if n == 0 { None } else { Some(n) },
                tx,
            });
            self.dispatch(&mut inner);
        }
        debug!("group {} subscription {} opened (credit {})", self.name, id, n);
        Subscription {
            id,
            group: Arc::clone(self),
            rx,
            closed: false,
        }
    }

    /// Acknowledge a delivery. Unknown (already-acked) entries are no-ops.
    pub fn ack(&self, subscription_id: SubscriptionId, seq_no: SeqNo) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(delivery) = inner.inflight.remove(&(subscription_id, seq_no)) else {
            return Ok(());
        };
        Self::restore_credit(&mut inner, subscription_id);
        self.complete_offset(&mut inner, delivery.segment_id, delivery.offset);
        self.dispatch(&mut inner);
        Ok(())
    }

    /// Negatively acknowledge a delivery. With `requeue` the message goes
    /// back onto the work queue at its original position; without, it is
    /// treated as acknowledged.
    pub fn nack(&self, subscription_id: SubscriptionId, seq_no: SeqNo, requeue: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(delivery) = inner.inflight.remove(&(subscription_id, seq_no)) else {
            return Ok(());
        };
        Self::restore_credit(&mut inner, subscription_id);
        if requeue {
            Self::requeue(&mut inner, delivery);
        } else {
            self.complete_offset(&mut inner, delivery.segment_id, delivery.offset);
        }
        self.dispatch(&mut inner);
        Ok(())
    }

    /// Replace a subscription's credit with an absolute value, as granted by
    /// AMQP 1.0 flow frames.
    pub fn set_credit(&self, subscription_id: SubscriptionId, credit: u32) {
        let mut inner = self.inner.lock();
        if let Some(sub) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
        {
            sub.credit = Some(credit);
        }
        self.dispatch(&mut inner);
    }

    /// Close one subscription: releases its in-flight deliveries back to the
    /// queue and wakes any blocked `next` call with subscription-closed.
    pub fn close_subscription(&self, subscription_id: SubscriptionId) {
        let mut inner = self.inner.lock();
        self.remove_subscription(&mut inner, subscription_id);
        self.dispatch(&mut inner);
    }

    /// Tear the whole group down. All subscriptions wake with
    /// subscription-closed; pending publishes fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.inflight.clear();
        inner.subscriptions.clear();
        drop(inner);
        self.space.notify_waiters();
        self.commit_wake.notify_waiters();
        debug!("group {} closed", self.name);
    }

    /// Offset-commit task. At most one hook call is in flight per group;
    /// changes accumulated while a call runs are merged into the next one.
    pub async fn run_commits(self: Arc<Self>, hook: CommitHook) {
        loop {
            self.commit_wake.notified().await;
            if self.is_closed() {
                return;
            }
            loop {
                let commits = {
                    let mut inner = self.inner.lock();
                    if !inner.commit_dirty {
                        break;
                    }
                    inner.commit_dirty = false;
                    Self::snapshot_commits(&inner)
                };
                if let Err(e) = hook(commits).await {
                    warn!("group {} offset commit failed: {}", self.name, e);
                    self.inner.lock().commit_dirty = true;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                if self.is_closed() {
                    return;
                }
            }
        }
    }

    fn snapshot_commits(inner: &GroupInner) -> Vec<OffsetCommit> {
        let mut commits: Vec<_> = inner
            .offsets
            .iter()
            .map(|(&segment_id, progress)| OffsetCommit {
                segment_id,
                offset: progress.committed,
            })
            .collect();
        commits.sort_by_key(|c| c.segment_id);
        commits
    }

    fn restore_credit(inner: &mut GroupInner, subscription_id: SubscriptionId) {
        if let Some(sub) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
        {
            if let Some(credit) = sub.credit.as_mut() {
                *credit += 1;
            }
        }
    }

    fn requeue(inner: &mut GroupInner, delivery: Delivery) {
        let pos = inner
            .queue
            .iter()
            .position(|d| d.seq_no > delivery.seq_no)
            .unwrap_or(inner.queue.len());
        inner.queue.insert(pos, delivery);
    }

    fn complete_offset(&self, inner: &mut GroupInner, segment_id: SegmentId, offset: u64) {
        let Some(progress) = inner.offsets.get_mut(&segment_id) else {
            return;
        };
        progress.outstanding.remove(&offset);
        let committed = progress
            .outstanding
            .iter()
            .next()
            .copied()
            .unwrap_or(progress.end)
            .max(progress.committed);
        if committed > progress.committed {
            progress.committed = committed;
            inner.commit_dirty = true;
            self.commit_wake.notify_one();
        }
    }

    fn remove_subscription(&self, inner: &mut GroupInner, subscription_id: SubscriptionId) {
        let Some(pos) = inner
            .subscriptions
            .iter()
            .position(|s| s.id == subscription_id)
        else {
            return;
        };
        // dropping the sender wakes blocked next() calls with closed
        inner.subscriptions.remove(pos);
        if inner.rr_cursor >= inner.subscriptions.len() {
            inner.rr_cursor = 0;
        }

        let keys: Vec<_> = inner
            .inflight
            .keys()
            .filter(|(sid, _)| *sid == subscription_id)
            .copied()
            .collect();
        let mut released: Vec<_> = keys
            .into_iter()
            .filter_map(|key| inner.inflight.remove(&key))
            .collect();
        released.sort_by_key(|d| d.seq_no);
        for delivery in released {
            Self::requeue(inner, delivery);
        }
        debug!("group {} subscription {} closed", self.name, subscription_id);
    }

    /// Hand queued messages to subscriptions with credit, round-robin.
    fn dispatch(&self, inner: &mut GroupInner) {
        loop {
            if inner.queue.is_empty() || inner.subscriptions.is_empty() {
                return;
            }
            let n = inner.subscriptions.len();
            let mut target = None;
            for step in 0..n {
                let idx = (inner.rr_cursor + step) % n;
                let sub = &inner.subscriptions[idx];
                if sub.credit.map_or(true, |c| c > 0) {
                    target = Some(idx);
                    break;
                }
            }
            let Some(idx) = target else {
                return; // everyone is out of credit
            };

            let delivery = inner.queue.pop_front().expect("queue checked non-empty");
            let (sub_id, sent) = {
                let sub = &mut inner.subscriptions[idx];
                let sent = sub.tx.send(delivery.clone()).is_ok();
                if sent {
                    if let Some(credit) = sub.credit.as_mut() {
                        *credit -= 1;
                    }
                }
                (sub.id, sent)
            };
            if !sent {
                // receiver dropped without closing; retire it and retry
                Self::requeue(inner, delivery);
                self.remove_subscription(inner, sub_id);
                continue;
            }
            inner.inflight.insert((sub_id, delivery.seq_no), delivery);
            inner.rr_cursor = (idx + 1) % n;
            self.space.notify_one();
        }
    }
}

/// Handle to one subscription. Dropping it closes the subscription and
/// releases any in-flight deliveries back to the group.
pub struct Subscription {
    id: SubscriptionId,
    group: Arc<ConsumerGroup>,
    rx: mpsc::UnboundedReceiver<Delivery>,
    closed: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn group(&self) -> &Arc<ConsumerGroup> {
        &self.group
    }

    /// Next delivered message. Fails with
    /// [`MeshmqError::SubscriptionClosed`] once the subscription is closed.
    pub async fn next(&mut self) -> Result<Delivery> {
        self.rx.recv().await.ok_or(MeshmqError::SubscriptionClosed)
    }

    pub fn ack(&self, seq_no: SeqNo) -> Result<()> {
        self.group.ack(self.id, seq_no)
    }

    pub fn nack(&self, seq_no: SeqNo, requeue: bool) -> Result<()> {
        self.group.nack(self.id, seq_no, requeue)
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.group.close_subscription(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
