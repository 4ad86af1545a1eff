// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The exchange registry: the one piece of shared state behind the
//! reliability layer.
//!
//! The registry tracks two kinds of exchanges. *Inbound* entries, keyed by
//! `(remote, message-id)`, drive duplicate suppression and hold the cached
//! response for idempotent replay. *Pending* records, keyed by
//! `(remote, message-id)` and `(remote, token)`, route acknowledgements,
//! resets, and responses back to the send future that is waiting for them.

use super::*;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

/// Trait implemented by anything waiting on a reply to an outbound message.
///
/// Returns true if the exchange is finished and its records should be
/// dropped from the registry.
pub(crate) trait HandleReply: Send {
    fn handle_reply(&mut self, message: &OwnedImmutableMessage) -> bool;
}

/// Phase of an inbound exchange, advanced by compare-and-set style
/// operations. The `Unconfirmed` to `Confirmed`/`Responded` transition is
/// the decision point between an empty acknowledgement and a piggy-backed
/// response: whichever side performs it first dictates the outcome.
#[derive(Debug, Clone)]
enum InboundPhase {
    /// Received, no acknowledgement sent yet.
    Unconfirmed,

    /// Empty acknowledgement sent; the response will be a separate exchange.
    Confirmed,

    /// Response produced and sent; the serialized bytes are kept for
    /// duplicate replay.
    Responded(Arc<Vec<u8>>),
}

#[derive(Debug)]
struct InboundEntry {
    phase: InboundPhase,
    epoch: u64,
    expires_at: Instant,
}

/// Outcome of recording an inbound message id.
#[derive(Debug)]
pub(crate) enum InsertOutcome {
    /// First observation. Carries the entry's epoch, which later phase
    /// transitions must present.
    Inserted(u64),

    /// Duplicate of an exchange whose response hasn't been produced yet.
    InFlight,

    /// Duplicate of an exchange that has been answered; re-emit these bytes
    /// verbatim.
    Replay(Arc<Vec<u8>>),
}

struct PendingRecord {
    handler: Weak<Mutex<dyn HandleReply>>,
    mid: MsgId,
    token: Option<MsgToken>,
}

struct ExpiryEntry<SA> {
    at: Instant,
    key: (SA, MsgId),
    epoch: u64,
}

impl<SA> PartialEq for ExpiryEntry<SA> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.epoch == other.epoch
    }
}

impl<SA> Eq for ExpiryEntry<SA> {}

impl<SA> PartialOrd for ExpiryEntry<SA> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<SA> Ord for ExpiryEntry<SA> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        // Reversed so that the binary heap pops the earliest deadline.
        (other.at, other.epoch).cmp(&(self.at, self.epoch))
    }
}

struct RegistryInner<SA> {
    inbound: HashMap<(SA, MsgId), InboundEntry>,
    expiries: BinaryHeap<ExpiryEntry<SA>>,
    pending_by_mid: HashMap<(SA, MsgId), PendingRecord>,
    pending_by_token: HashMap<(SA, MsgToken), PendingRecord>,
}

/// Concurrent store for all live exchange state of one local endpoint.
pub(crate) struct ExchangeRegistry<SA> {
    inner: Mutex<RegistryInner<SA>>,
    next_epoch: AtomicU64,
}

impl<SA> Debug for ExchangeRegistry<SA>
where
    SA: SocketAddrExt,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let inner = self.lock();
        f.debug_struct("ExchangeRegistry")
            .field("inbound", &inner.inbound.keys())
            .field("pending_by_mid", &inner.pending_by_mid.keys())
            .field("pending_by_token", &inner.pending_by_token.keys())
            .finish()
    }
}

impl<SA> ExchangeRegistry<SA>
where
    SA: SocketAddrExt,
{
    pub(crate) fn new() -> Self {
        ExchangeRegistry {
            inner: Mutex::new(RegistryInner {
                inbound: HashMap::new(),
                expiries: BinaryHeap::new(),
                pending_by_mid: HashMap::new(),
                pending_by_token: HashMap::new(),
            }),
            next_epoch: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner<SA>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                debug!("Recovering from mutex poisoning");
                poisoned.into_inner()
            }
        }
    }

    /// Records the first observation of `(src, mid)`, or classifies the
    /// message as a duplicate of a live entry.
    pub(crate) fn insert_if_absent(
        &self,
        src: SA,
        mid: MsgId,
        expires_at: Instant,
    ) -> InsertOutcome {
        let mut inner = self.lock();

        if let Some(entry) = inner.inbound.get(&(src, mid)) {
            return match &entry.phase {
                InboundPhase::Responded(bytes) => InsertOutcome::Replay(bytes.clone()),
                _ => InsertOutcome::InFlight,
            };
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        inner.inbound.insert(
            (src, mid),
            InboundEntry {
                phase: InboundPhase::Unconfirmed,
                epoch,
                expires_at,
            },
        );
        inner.expiries.push(ExpiryEntry {
            at: expires_at,
            key: (src, mid),
            epoch,
        });

        InsertOutcome::Inserted(epoch)
    }

    /// Transitions `(src, mid)` from `Unconfirmed` to `Confirmed`, claiming
    /// the right to send the empty acknowledgement. Returns false if the
    /// entry was already confirmed, already answered, or evicted (stale
    /// epoch).
    pub(crate) fn mark_confirmed(&self, src: SA, mid: MsgId, epoch: u64) -> bool {
        let mut inner = self.lock();

        match inner.inbound.get_mut(&(src, mid)) {
            Some(entry) if entry.epoch == epoch => match entry.phase {
                InboundPhase::Unconfirmed => {
                    entry.phase = InboundPhase::Confirmed;
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Transitions `(src, mid)` from `Unconfirmed` straight to `Responded`,
    /// claiming the right to answer with a piggy-backed acknowledgement.
    /// Returns false if the empty acknowledgement was already sent, or the
    /// entry is gone.
    pub(crate) fn claim_piggyback(&self, src: SA, mid: MsgId, epoch: u64, bytes: Vec<u8>) -> bool {
        let mut inner = self.lock();

        match inner.inbound.get_mut(&(src, mid)) {
            Some(entry) if entry.epoch == epoch => match entry.phase {
                InboundPhase::Unconfirmed => {
                    entry.phase = InboundPhase::Responded(Arc::new(bytes));
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Attaches the produced response to an exchange that was already
    /// confirmed, so later duplicates replay it. Returns false if the entry
    /// is gone (the response should then go out as NON with a fresh id).
    pub(crate) fn attach_response(&self, src: SA, mid: MsgId, epoch: u64, bytes: Vec<u8>) -> bool {
        let mut inner = self.lock();

        match inner.inbound.get_mut(&(src, mid)) {
            Some(entry) if entry.epoch == epoch => {
                entry.phase = InboundPhase::Responded(Arc::new(bytes));
                true
            }
            _ => false,
        }
    }

    /// Returns the earliest inbound-entry deadline, for arming the eviction
    /// timer. Stale heap entries are discarded on the way.
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        let mut inner = self.lock();

        loop {
            let (at, key, epoch) = match inner.expiries.peek() {
                Some(e) => (e.at, e.key, e.epoch),
                None => return None,
            };

            match inner.inbound.get(&key) {
                Some(entry) if entry.epoch == epoch => return Some(at),
                _ => {
                    inner.expiries.pop();
                }
            }
        }
    }

    /// Drops every inbound entry whose deadline has passed. Driven by the
    /// endpoint's eviction timer rather than by periodic scans.
    pub(crate) fn evict_expired(&self) -> usize {
        let mut inner = self.lock();
        let now = Instant::now();
        let mut evicted = 0;

        while let Some(head) = inner.expiries.peek() {
            if head.at > now {
                break;
            }
            let (key, epoch) = (head.key, head.epoch);
            inner.expiries.pop();

            if let Some(entry) = inner.inbound.get(&key) {
                if entry.epoch == epoch {
                    inner.inbound.remove(&key);
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            debug!("Evicted {} expired inbound exchanges", evicted);
        }
        evicted
    }

    /// Number of live inbound entries.
    #[cfg(test)]
    pub(crate) fn inbound_len(&self) -> usize {
        self.lock().inbound.len()
    }

    /// Registers a reply handler for an outbound message, keyed by message
    /// id and, when a response (rather than a bare acknowledgement) is
    /// expected, by token.
    pub(crate) fn add_pending(
        &self,
        dest: SA,
        mid: MsgId,
        token: Option<MsgToken>,
        handler: &Arc<Mutex<dyn HandleReply>>,
    ) {
        let mut inner = self.lock();

        info!("Adding reply handler: msg_id:{:04X}, token:{:?}", mid, token);

        inner.pending_by_mid.insert(
            (dest, mid),
            PendingRecord {
                handler: Arc::downgrade(handler),
                mid,
                token,
            },
        );

        if let Some(token) = token {
            inner.pending_by_token.insert(
                (dest, token),
                PendingRecord {
                    handler: Arc::downgrade(handler),
                    mid,
                    token: Some(token),
                },
            );
        }
    }

    /// Removes the records registered by
    /// [`add_pending`][ExchangeRegistry::add_pending].
    pub(crate) fn remove_pending(&self, dest: SA, mid: MsgId, token: Option<MsgToken>) {
        let mut inner = self.lock();

        inner.pending_by_mid.remove(&(dest, mid));
        if let Some(token) = token {
            inner.pending_by_token.remove(&(dest, token));
        }
    }

    /// Routes an acknowledgement, reset, or piggy-backed response to the
    /// pending handler registered under `(src, msg-id)`. Returns true if a
    /// handler consumed the message.
    ///
    /// The registry lock is not held across the handler call: the handler is
    /// an exchange future whose poll path takes its own lock first and this
    /// one second.
    pub(crate) fn deliver_by_mid(&self, src: SA, message: &OwnedImmutableMessage) -> bool {
        let record = match self.lock().pending_by_mid.remove(&(src, message.msg_id())) {
            Some(record) => record,
            None => return false,
        };

        debug!("Matched reply on msg_id {:04X}", message.msg_id());

        if let Some(mutex) = record.handler.upgrade() {
            let finished = {
                let mut handler = mutex.lock().expect("lock failure");
                handler.handle_reply(message)
            };

            let mut inner = self.lock();
            if finished {
                if let Some(token) = record.token {
                    inner.pending_by_token.remove(&(src, token));
                }
            } else {
                // The exchange is still open (separate response expected);
                // keep the message-id record so a duplicate acknowledgement
                // is still recognized as handled.
                inner.pending_by_mid.entry((src, record.mid)).or_insert(record);
            }
            true
        } else {
            false
        }
    }

    /// Routes a separate response to the pending handler registered under
    /// `(src, token)`. Returns true if a handler consumed the message.
    pub(crate) fn deliver_by_token(&self, src: SA, message: &OwnedImmutableMessage) -> bool {
        let (handler, mid) = {
            let inner = self.lock();
            match inner.pending_by_token.get(&(src, message.msg_token())) {
                Some(record) => (record.handler.clone(), record.mid),
                None => return false,
            }
        };

        debug!("Matched reply on token {}", message.msg_token());

        if let Some(mutex) = handler.upgrade() {
            let finished = {
                let mut handler = mutex.lock().expect("lock failure");
                handler.handle_reply(message)
            };
            if finished {
                let mut inner = self.lock();
                inner.pending_by_token.remove(&(src, message.msg_token()));
                inner.pending_by_mid.remove(&(src, mid));
            }
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::PairSocketAddr;
    use std::time::Duration;

    const SRC: PairSocketAddr = PairSocketAddr::North;

    #[test]
    fn duplicate_detection() {
        let registry = ExchangeRegistry::new();
        let deadline = Instant::now() + Duration::from_secs(247);

        let epoch = match registry.insert_if_absent(SRC, 0x1001, deadline) {
            InsertOutcome::Inserted(epoch) => epoch,
            other => panic!("unexpected outcome {:?}", other),
        };

        assert!(matches!(
            registry.insert_if_absent(SRC, 0x1001, deadline),
            InsertOutcome::InFlight
        ));

        assert!(registry.claim_piggyback(SRC, 0x1001, epoch, vec![1, 2, 3]));

        match registry.insert_if_absent(SRC, 0x1001, deadline) {
            InsertOutcome::Replay(bytes) => assert_eq!(*bytes, vec![1, 2, 3]),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn confirmation_race_is_won_once() {
        let registry = ExchangeRegistry::new();
        let deadline = Instant::now() + Duration::from_secs(247);

        let epoch = match registry.insert_if_absent(SRC, 7, deadline) {
            InsertOutcome::Inserted(epoch) => epoch,
            other => panic!("unexpected outcome {:?}", other),
        };

        // The empty-ACK timer fires first...
        assert!(registry.mark_confirmed(SRC, 7, epoch));
        // ...so the response may not be piggy-backed...
        assert!(!registry.claim_piggyback(SRC, 7, epoch, vec![]));
        // ...and a second timer arm is a no-op.
        assert!(!registry.mark_confirmed(SRC, 7, epoch));

        // The separate response is still cached for replay.
        assert!(registry.attach_response(SRC, 7, epoch, vec![9]));
        assert!(matches!(
            registry.insert_if_absent(SRC, 7, deadline),
            InsertOutcome::Replay(_)
        ));
    }

    #[test]
    fn stale_epoch_is_rejected() {
        let registry = ExchangeRegistry::new();

        let epoch = match registry.insert_if_absent(SRC, 1, Instant::now()) {
            InsertOutcome::Inserted(epoch) => epoch,
            other => panic!("unexpected outcome {:?}", other),
        };

        registry.evict_expired();
        assert_eq!(registry.inbound_len(), 0);

        // A timer that fires after eviction must not resurrect anything.
        assert!(!registry.mark_confirmed(SRC, 1, epoch));
        assert!(!registry.attach_response(SRC, 1, epoch, vec![]));

        // Same mid, new exchange: the old epoch stays dead.
        let epoch2 = match registry.insert_if_absent(SRC, 1, Instant::now() + Duration::from_secs(60))
        {
            InsertOutcome::Inserted(epoch2) => epoch2,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_ne!(epoch, epoch2);
        assert!(!registry.mark_confirmed(SRC, 1, epoch));
        assert!(registry.mark_confirmed(SRC, 1, epoch2));
    }

    #[test]
    fn eviction_is_deadline_ordered() {
        let registry = ExchangeRegistry::new();
        let now = Instant::now();

        registry.insert_if_absent(SRC, 1, now + Duration::from_millis(1));
        registry.insert_if_absent(SRC, 2, now + Duration::from_secs(3600));

        assert!(registry.next_expiry().unwrap() <= now + Duration::from_millis(1));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.evict_expired(), 1);
        assert_eq!(registry.inbound_len(), 1);
        assert!(registry.next_expiry().unwrap() > now + Duration::from_secs(1800));
    }

    struct RecordingHandler {
        replies: Vec<OwnedImmutableMessage>,
        finish: bool,
    }

    impl HandleReply for RecordingHandler {
        fn handle_reply(&mut self, message: &OwnedImmutableMessage) -> bool {
            self.replies.push(message.clone());
            self.finish
        }
    }

    fn empty_ack(mid: MsgId) -> OwnedImmutableMessage {
        OwnedImmutableMessage::new(vec![0x60, 0x00, (mid >> 8) as u8, mid as u8]).unwrap()
    }

    #[test]
    fn delivery_by_mid_and_cleanup() {
        let registry: ExchangeRegistry<PairSocketAddr> = ExchangeRegistry::new();
        let handler = Arc::new(Mutex::new(RecordingHandler {
            replies: vec![],
            finish: true,
        }));
        let dyn_handler: Arc<Mutex<dyn HandleReply>> = handler.clone();

        let token = MsgToken::new(b"tk");
        registry.add_pending(SRC, 0x2002, Some(token), &dyn_handler);

        assert!(registry.deliver_by_mid(SRC, &empty_ack(0x2002)));
        assert_eq!(handler.lock().unwrap().replies.len(), 1);

        // Finished handlers are deregistered from both indexes.
        assert!(!registry.deliver_by_mid(SRC, &empty_ack(0x2002)));
    }

    #[test]
    fn unfinished_handler_keeps_its_records() {
        let registry: ExchangeRegistry<PairSocketAddr> = ExchangeRegistry::new();
        let handler = Arc::new(Mutex::new(RecordingHandler {
            replies: vec![],
            finish: false,
        }));
        let dyn_handler: Arc<Mutex<dyn HandleReply>> = handler.clone();

        registry.add_pending(SRC, 0x2003, Some(MsgToken::new(b"t3")), &dyn_handler);

        // Empty ACK leaves the exchange open, awaiting the separate response.
        assert!(registry.deliver_by_mid(SRC, &empty_ack(0x2003)));
        assert!(registry.deliver_by_mid(SRC, &empty_ack(0x2003)));
        assert_eq!(handler.lock().unwrap().replies.len(), 2);
    }
}
