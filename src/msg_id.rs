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

use super::*;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Allocator for 16-bit message ids.
///
/// RFC 7252 §4.4 forbids reusing a message id toward a peer while the
/// previous exchange that used it may still be alive, so every allocation
/// reserves the id for `EXCHANGE_LIFETIME` (247 s by default). The counter
/// advances monotonically over the full 16-bit space, skipping ids that are
/// still reserved, and starts at a uniformly random value so that id
/// sequences are not predictable across restarts.
#[derive(Debug)]
pub struct MsgIdFactory {
    lifetime: Duration,
    inner: Mutex<MsgIdFactoryInner>,
}

#[derive(Debug)]
struct MsgIdFactoryInner {
    next: MsgId,

    /// Live reservations, id to expiry.
    reserved: HashMap<MsgId, Instant>,

    /// Reservation deadlines, earliest first. May contain entries for ids
    /// that have since been re-reserved; `reserved` is authoritative.
    deadlines: BinaryHeap<Reverse<(Instant, MsgId)>>,
}

impl Default for MsgIdFactory {
    fn default() -> Self {
        MsgIdFactory::new()
    }
}

impl MsgIdFactory {
    /// Creates a new factory with the RFC-default reservation lifetime of
    /// [`EXCHANGE_LIFETIME`](crate::TransParams::COAP_EXCHANGE_LIFETIME).
    pub fn new() -> MsgIdFactory {
        Self::with_lifetime(StandardCoapConstants::COAP_EXCHANGE_LIFETIME)
    }

    /// Creates a new factory with a specific reservation lifetime.
    ///
    /// Lifetimes shorter than `EXCHANGE_LIFETIME` are not compliant with
    /// RFC 7252 §4.8 and should only be used in tests.
    pub fn with_lifetime(lifetime: Duration) -> MsgIdFactory {
        MsgIdFactory {
            lifetime,
            inner: Mutex::new(MsgIdFactoryInner {
                next: rand::random::<u16>(),
                reserved: HashMap::new(),
                deadlines: BinaryHeap::new(),
            }),
        }
    }

    /// Returns the reservation lifetime of this factory.
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Allocates a message id that is not currently reserved, reserving it
    /// for this factory's lifetime.
    ///
    /// Fails with [`Error::NoFreeMsgIds`] if all 65 536 ids are reserved at
    /// once, which cannot happen at compliant message rates. The condition
    /// is transient: reservations expire on their own and the caller may
    /// simply retry later.
    pub fn allocate(&self) -> Result<MsgId, Error> {
        let mut inner = self.inner.lock().expect("Lock failed");

        inner.purge_expired(Instant::now());

        let expiry = Instant::now() + self.lifetime;
        for _ in 0..=u16::max_value() as u32 {
            let id = inner.next;
            inner.next = inner.next.wrapping_add(1);

            if !inner.reserved.contains_key(&id) {
                inner.reserved.insert(id, expiry);
                inner.deadlines.push(Reverse((expiry, id)));
                return Ok(id);
            }
        }

        warn!("All {} message ids are reserved", 1u32 << 16);
        Err(Error::NoFreeMsgIds)
    }

    /// Returns the number of ids currently reserved.
    pub fn reserved_count(&self) -> usize {
        let mut inner = self.inner.lock().expect("Lock failed");
        inner.purge_expired(Instant::now());
        inner.reserved.len()
    }
}

impl MsgIdFactoryInner {
    fn purge_expired(&mut self, now: Instant) {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();

            // Only retire the reservation if this deadline is still the
            // live one; the id may have been re-reserved since.
            if self.reserved.get(&id) == Some(&deadline) {
                self.reserved.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_unique_within_lifetime() {
        let factory = MsgIdFactory::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4096 {
            let id = factory.allocate().expect("allocation failed");
            assert!(seen.insert(id), "id {:04X} was returned twice", id);
        }
    }

    #[test]
    fn counter_starts_randomized() {
        // Sixteen factories all starting at the same id has probability
        // 2^-240; treat it as a failure.
        let first_ids: std::collections::HashSet<MsgId> = (0..16)
            .map(|_| MsgIdFactory::new().allocate().unwrap())
            .collect();
        assert!(first_ids.len() > 1);
    }

    #[test]
    fn expired_reservations_are_reusable() {
        let factory = MsgIdFactory::with_lifetime(Duration::from_millis(0));
        let a = factory.allocate().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        factory.allocate().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // Both reservations have expired; the table must not grow.
        assert!(factory.reserved_count() <= 1, "{}", factory.reserved_count());
        let _ = a;
    }

    #[test]
    fn exhaustion_reports_no_free_ids() {
        let factory = MsgIdFactory::with_lifetime(Duration::from_secs(600));
        for _ in 0..=u16::max_value() as u32 {
            factory.allocate().expect("allocation failed early");
        }
        assert_eq!(factory.allocate(), Err(Error::NoFreeMsgIds));
    }

    #[test]
    fn full_sixteen_bit_space_is_used() {
        let factory = MsgIdFactory::with_lifetime(Duration::from_secs(600));
        let mut above_twelve_bits = false;
        for _ in 0..8192 {
            if factory.allocate().unwrap() > 0x0FFF {
                above_twelve_bits = true;
                break;
            }
        }
        assert!(above_twelve_bits);
    }
}
