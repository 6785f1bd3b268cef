//! Subscription Hub (§4.5): fans a session's output out to its subscribers and enforces
//! per-subscriber back-pressure. Publishing is always non-blocking from the producer's
//! point of view — a slow subscriber only ever costs its own queue, never the PTY reader
//! that called in here.
//!
//! The Hub does not own a `TerminalModel`; when a subscriber's queue overflows and it
//! wants a resync snapshot, the caller supplies the snapshot bytes lazily via a closure so
//! the (possibly expensive) encode only happens once per publish, not once per overflowed
//! subscriber.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::session::SessionId;
use crate::wsframe::{flags, Frame};

/// Identifies one WebSocket connection, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

enum Queued {
    Stdout(Frame),
    Snapshot(Frame),
    Event(Frame),
}

/// What happened as a result of a `push_stdout` call, so the caller knows whether a
/// resync (snapshot or overflow event) needs to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue overflowed this call; all pending STDOUT frames for this subscriber
    /// were dropped and the subscriber is marked needs-resync.
    Overflowed,
    /// The subscriber is still draining from a prior overflow; this chunk was dropped
    /// without re-triggering a resync.
    Suppressed,
}

/// Per-subscriber bounded outbound queue (§4.5 back-pressure policy).
pub struct OutboundQueue {
    frames: Mutex<VecDeque<Queued>>,
    stdout_bytes: AtomicU64,
    stdout_frames: AtomicU64,
    max_bytes: usize,
    max_frames: usize,
    suppressed: AtomicBool,
    needs_resync: AtomicBool,
    /// Set when an EVENT frame could not be enqueued because the queue was already at
    /// capacity; the connection's writer loop must observe this and close with a
    /// policy-violation code.
    policy_violation: AtomicBool,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(max_bytes: usize, max_frames: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            stdout_bytes: AtomicU64::new(0),
            stdout_frames: AtomicU64::new(0),
            max_bytes,
            max_frames,
            suppressed: AtomicBool::new(false),
            needs_resync: AtomicBool::new(false),
            policy_violation: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync.load(Ordering::Acquire)
    }

    pub fn policy_violation(&self) -> bool {
        self.policy_violation.load(Ordering::Acquire)
    }

    /// Waits until at least one frame is queued, then returns every queued frame in
    /// enqueue order. The caller (the connection's frame-writer task) is the only
    /// consumer of a given subscriber's queue.
    pub async fn wait_and_drain(&self) -> Vec<Frame> {
        loop {
            let drained = self.try_drain();
            if !drained.is_empty() {
                return drained;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_drain(&self) -> Vec<Frame> {
        let mut guard = self.frames.lock().expect("outbound queue mutex");
        let out: Vec<Frame> = guard
            .drain(..)
            .map(|q| match q {
                Queued::Stdout(f) | Queued::Snapshot(f) | Queued::Event(f) => f,
            })
            .collect();
        drop(guard);
        if !out.is_empty() {
            self.stdout_bytes.store(0, Ordering::Release);
            self.stdout_frames.store(0, Ordering::Release);
            self.suppressed.store(false, Ordering::Release);
        }
        out
    }

    pub fn push_stdout(&self, frame: Frame) -> PushOutcome {
        if self.suppressed.load(Ordering::Acquire) {
            return PushOutcome::Suppressed;
        }
        let len = frame.payload.len() as u64;
        let mut guard = self.frames.lock().expect("outbound queue mutex");
        let new_bytes = self.stdout_bytes.load(Ordering::Acquire) + len;
        let new_frames = self.stdout_frames.load(Ordering::Acquire) + 1;
        if new_bytes > self.max_bytes as u64 || new_frames > self.max_frames as u64 {
            guard.retain(|q| !matches!(q, Queued::Stdout(_)));
            self.stdout_bytes.store(0, Ordering::Release);
            self.stdout_frames.store(0, Ordering::Release);
            self.suppressed.store(true, Ordering::Release);
            self.needs_resync.store(true, Ordering::Release);
            drop(guard);
            self.notify.notify_one();
            return PushOutcome::Overflowed;
        }
        guard.push_back(Queued::Stdout(frame));
        self.stdout_bytes.store(new_bytes, Ordering::Release);
        self.stdout_frames.store(new_frames, Ordering::Release);
        drop(guard);
        self.notify.notify_one();
        PushOutcome::Queued
    }

    /// A newly queued snapshot replaces any snapshot already queued (§4.5 coalescing).
    pub fn push_snapshot(&self, frame: Frame) {
        let mut guard = self.frames.lock().expect("outbound queue mutex");
        guard.retain(|q| !matches!(q, Queued::Snapshot(_)));
        guard.push_back(Queued::Snapshot(frame));
        self.needs_resync.store(false, Ordering::Release);
        drop(guard);
        self.notify.notify_one();
    }

    /// Events are never dropped. If the queue is already at the frame cap this returns
    /// `false` and the caller must close the connection with a policy violation.
    pub fn push_event(&self, frame: Frame) -> bool {
        let mut guard = self.frames.lock().expect("outbound queue mutex");
        if guard.len() >= self.max_frames {
            self.policy_violation.store(true, Ordering::Release);
            return false;
        }
        guard.push_back(Queued::Event(frame));
        drop(guard);
        self.notify.notify_one();
        true
    }
}

/// A subscriber's declared interest and its outbound queue. Owned by the Hub for the
/// life of the (connection, session) pair; the connection holds an `Arc` clone so it can
/// drain the queue from its own writer task.
pub struct Subscriber {
    pub connection_id: ConnectionId,
    interest: AtomicU8,
    snapshot_min_ms: AtomicU32,
    snapshot_max_ms: AtomicU32,
    pub queue: OutboundQueue,
}

impl Subscriber {
    pub fn new(connection_id: ConnectionId, interest: u8, min_ms: u32, max_ms: u32, max_bytes: usize, max_frames: usize) -> Self {
        Self {
            connection_id,
            interest: AtomicU8::new(interest),
            snapshot_min_ms: AtomicU32::new(min_ms),
            snapshot_max_ms: AtomicU32::new(max_ms),
            queue: OutboundQueue::new(max_bytes, max_frames),
        }
    }

    pub fn interest(&self) -> u8 {
        self.interest.load(Ordering::Acquire)
    }

    pub fn wants_stdout(&self) -> bool {
        self.interest() & flags::STDOUT != 0
    }

    pub fn wants_snapshots(&self) -> bool {
        self.interest() & flags::SNAPSHOTS != 0
    }

    pub fn wants_events(&self) -> bool {
        self.interest() & flags::EVENTS != 0
    }

    pub fn snapshot_interval_hints(&self) -> (u32, u32) {
        (self.snapshot_min_ms.load(Ordering::Acquire), self.snapshot_max_ms.load(Ordering::Acquire))
    }

    fn update(&self, interest: u8, min_ms: u32, max_ms: u32) {
        self.interest.store(interest, Ordering::Release);
        self.snapshot_min_ms.store(min_ms, Ordering::Release);
        self.snapshot_max_ms.store(max_ms, Ordering::Release);
    }
}

#[derive(Default)]
struct SessionFanout {
    subscribers: DashMap<ConnectionId, std::sync::Arc<Subscriber>>,
}

/// The fan-out layer. One `Hub` instance is shared by the whole server; it has no
/// knowledge of PTYs or transcripts, only of subscribers and their queues.
pub struct Hub {
    sessions: DashMap<SessionId, SessionFanout>,
    max_bytes: usize,
    max_frames: usize,
}

impl Hub {
    pub fn new(max_bytes: usize, max_frames: usize) -> Self {
        Self { sessions: DashMap::new(), max_bytes, max_frames }
    }

    /// SUBSCRIBE (§4.6): idempotent per (connection, session). Returns the subscriber
    /// handle so the caller can immediately push the "always-on-subscribe" snapshot.
    pub fn subscribe(
        &self,
        session_id: SessionId,
        connection_id: ConnectionId,
        interest: u8,
        min_ms: u32,
        max_ms: u32,
    ) -> std::sync::Arc<Subscriber> {
        let fanout = self.sessions.entry(session_id).or_default();
        if let Some(existing) = fanout.subscribers.get(&connection_id) {
            existing.update(interest, min_ms, max_ms);
            return existing.clone();
        }
        let sub = std::sync::Arc::new(Subscriber::new(
            connection_id,
            interest,
            min_ms,
            max_ms,
            self.max_bytes,
            self.max_frames,
        ));
        fanout.subscribers.insert(connection_id, sub.clone());
        sub
    }

    /// UNSUBSCRIBE / connection close: removes all interest for this (connection, session).
    pub fn unsubscribe(&self, session_id: SessionId, connection_id: ConnectionId) {
        if let Some(fanout) = self.sessions.get(&session_id) {
            fanout.subscribers.remove(&connection_id);
        }
    }

    /// Removes every subscription this connection holds, across all sessions. Called on
    /// connection close.
    pub fn drop_connection(&self, connection_id: ConnectionId) {
        for entry in self.sessions.iter() {
            entry.value().subscribers.remove(&connection_id);
        }
    }

    pub fn subscriber_count(&self, session_id: SessionId) -> usize {
        self.sessions.get(&session_id).map(|f| f.subscribers.len()).unwrap_or(0)
    }

    pub fn has_snapshot_subscribers(&self, session_id: SessionId) -> bool {
        self.sessions
            .get(&session_id)
            .map(|f| f.subscribers.iter().any(|s| s.wants_snapshots()))
            .unwrap_or(false)
    }

    /// Fans a chunk of PTY output out to every Stdout-subscribed subscriber of
    /// `session_id`. `snapshot_fn` is invoked at most once, lazily, only if some
    /// overflowed subscriber also wants snapshots.
    pub fn publish_stdout(&self, session_id: SessionId, bytes: &Bytes, snapshot_fn: impl Fn() -> Vec<u8>) {
        let Some(fanout) = self.sessions.get(&session_id) else { return };
        let sid = session_id.to_string();
        let mut cached_snapshot: Option<Vec<u8>> = None;
        for entry in fanout.subscribers.iter() {
            let sub = entry.value();
            if !sub.wants_stdout() {
                continue;
            }
            let frame = Frame::stdout(&sid, bytes.clone());
            match sub.queue.push_stdout(frame) {
                PushOutcome::Queued | PushOutcome::Suppressed => {}
                PushOutcome::Overflowed => {
                    if sub.wants_snapshots() {
                        let snap = cached_snapshot.get_or_insert_with(&snapshot_fn);
                        sub.queue.push_snapshot(Frame::snapshot(&sid, snap.clone()));
                    } else {
                        let _ = sub.queue.push_event(Frame::event(&sid, serde_json::json!({"kind": "overflow"})));
                    }
                }
            }
        }
    }

    /// Pushes a snapshot to every Snapshots-subscribed subscriber of `session_id`,
    /// typically called by the session's cadence ticker.
    pub fn broadcast_snapshot(&self, session_id: SessionId, bytes: &[u8]) {
        let Some(fanout) = self.sessions.get(&session_id) else { return };
        let sid = session_id.to_string();
        for entry in fanout.subscribers.iter() {
            let sub = entry.value();
            if sub.wants_snapshots() {
                sub.queue.push_snapshot(Frame::snapshot(&sid, bytes.to_vec()));
            }
        }
    }

    /// Publishes an EVENT to every Events-subscribed subscriber of `session_id`. Events
    /// are never dropped; a subscriber whose queue is already full is marked for
    /// connection termination (§4.5).
    pub fn publish_event(&self, session_id: SessionId, payload: serde_json::Value) {
        let Some(fanout) = self.sessions.get(&session_id) else { return };
        let sid = session_id.to_string();
        for entry in fanout.subscribers.iter() {
            let sub = entry.value();
            if sub.wants_events() {
                let _ = sub.queue.push_event(Frame::event(&sid, payload.clone()));
            }
        }
    }

    /// Global EVENT (empty session id), e.g. `{kind:"going-away"}` on shutdown.
    pub fn publish_global_event(&self, payload: serde_json::Value) {
        for entry in self.sessions.iter() {
            for sub_entry in entry.value().subscribers.iter() {
                let sub = sub_entry.value();
                if sub.wants_events() {
                    let _ = sub.queue.push_event(Frame::global_event(payload.clone()));
                }
            }
        }
    }

    pub fn snapshot_interval_hints(&self, session_id: SessionId, connection_id: ConnectionId) -> Option<(u32, u32)> {
        self.sessions
            .get(&session_id)?
            .subscribers
            .get(&connection_id)
            .map(|s| s.snapshot_interval_hints())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::new()
    }

    #[test]
    fn subscribe_is_idempotent_and_updates_in_place() {
        let hub = Hub::new(4 * 1024 * 1024, 1024);
        let s = sid();
        let conn = ConnectionId(1);
        hub.subscribe(s, conn, flags::STDOUT, 100, 1000);
        hub.subscribe(s, conn, flags::EVENTS, 200, 900);
        assert_eq!(hub.subscriber_count(s), 1);
        let hints = hub.snapshot_interval_hints(s, conn).unwrap();
        assert_eq!(hints, (200, 900));
    }

    #[test]
    fn stdout_delivered_in_order_to_subscribed_connection() {
        let hub = Hub::new(4 * 1024 * 1024, 1024);
        let s = sid();
        let conn = ConnectionId(1);
        let sub = hub.subscribe(s, conn, flags::STDOUT, 100, 1000);
        hub.publish_stdout(s, &Bytes::from_static(b"a"), || vec![]);
        hub.publish_stdout(s, &Bytes::from_static(b"b"), || vec![]);
        let frames = sub.queue.try_drain();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].payload[..], b"a");
        assert_eq!(&frames[1].payload[..], b"b");
    }

    #[test]
    fn overflow_drops_pending_stdout_and_schedules_snapshot() {
        let hub = Hub::new(8, 1024); // tiny byte budget
        let s = sid();
        let conn = ConnectionId(1);
        let sub = hub.subscribe(s, conn, flags::STDOUT | flags::SNAPSHOTS, 100, 1000);
        hub.publish_stdout(s, &Bytes::from_static(b"01234567"), || vec![9, 9]);
        // Exceeds max_bytes(8): should overflow and enqueue a snapshot, not more stdout.
        hub.publish_stdout(s, &Bytes::from_static(b"x"), || vec![9, 9]);
        let frames = sub.queue.try_drain();
        assert_eq!(frames.len(), 2); // the first stdout frame, then a snapshot
        assert_eq!(frames[1].frame_type, crate::wsframe::FrameType::SnapshotVt);
    }

    #[test]
    fn overflow_without_snapshots_flag_emits_overflow_event() {
        let hub = Hub::new(4, 1024);
        let s = sid();
        let conn = ConnectionId(1);
        let sub = hub.subscribe(s, conn, flags::STDOUT, 100, 1000);
        hub.publish_stdout(s, &Bytes::from_static(b"abcd"), || vec![]);
        hub.publish_stdout(s, &Bytes::from_static(b"e"), || vec![]);
        let frames = sub.queue.try_drain();
        let last = frames.last().unwrap();
        assert_eq!(last.frame_type, crate::wsframe::FrameType::Event);
    }

    #[test]
    fn suppressed_after_overflow_until_drained() {
        let hub = Hub::new(4, 1024);
        let s = sid();
        let conn = ConnectionId(1);
        let sub = hub.subscribe(s, conn, flags::STDOUT, 100, 1000);
        hub.publish_stdout(s, &Bytes::from_static(b"abcd"), || vec![]);
        hub.publish_stdout(s, &Bytes::from_static(b"e"), || vec![]); // overflow -> suppressed
        hub.publish_stdout(s, &Bytes::from_static(b"f"), || vec![]); // should be dropped silently
        let frames = sub.queue.try_drain();
        // one stdout frame before overflow, one overflow event; the third push was suppressed
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn events_are_never_dropped_until_frame_cap() {
        let hub = Hub::new(4 * 1024 * 1024, 2);
        let s = sid();
        let conn = ConnectionId(1);
        let sub = hub.subscribe(s, conn, flags::EVENTS, 100, 1000);
        hub.publish_event(s, serde_json::json!({"kind": "start"}));
        hub.publish_event(s, serde_json::json!({"kind": "resize"}));
        assert!(!sub.queue.policy_violation());
        hub.publish_event(s, serde_json::json!({"kind": "exit"}));
        assert!(sub.queue.policy_violation());
    }

    #[test]
    fn unsubscribe_removes_interest() {
        let hub = Hub::new(4 * 1024 * 1024, 1024);
        let s = sid();
        let conn = ConnectionId(1);
        hub.subscribe(s, conn, flags::STDOUT, 100, 1000);
        assert_eq!(hub.subscriber_count(s), 1);
        hub.unsubscribe(s, conn);
        assert_eq!(hub.subscriber_count(s), 0);
    }
}
