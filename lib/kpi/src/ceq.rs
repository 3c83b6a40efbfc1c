// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Layout of the coalescing event queue (CEQ).
//!
//! A CEQ has one entry per event type. Posting an event folds its payload
//! into the entry (OR or ADD) and, the first time the entry becomes pending,
//! pushes the event type into a small ring. When the ring is full the
//! producer only sets `ring_overflowed`; the consumer then recovers every
//! pending entry with a linear scan up to `max_event_ever`.
//!
//! The event array is sparse: storage for a chunk of entries is only
//! created the first time an entry in it is touched, so processes can use
//! large event-id spaces without paying for them up front.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::convert::TryFrom;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

use spin::Once;

/// Marks a ring slot that has been claimed but not filled.
pub const CEQ_EMPTY_SLOT: i32 = -1;

/// Largest event id space a CEQ can be set up with.
pub const CEQ_MAX_EVENTS: u32 = 1 << 16;

/// Entries that are populated together.
pub const CEQ_EVENTS_PER_CHUNK: usize = 64;

static_assertions::const_assert!(CEQ_EVENTS_PER_CHUNK.is_power_of_two());
// Event types travel as `EventMsg::ev_type`.
static_assertions::const_assert!(CEQ_MAX_EVENTS <= u16::MAX as u32 + 1);

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CeqError {
    /// The ring size has to be a non-zero power of two.
    RingNotPowerOfTwo,
    /// More event types than `CEQ_MAX_EVENTS`.
    TooManyEvents,
    /// Not a known coalescing operation.
    InvalidOperation,
}

/// How payloads of the same event type are combined.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
#[repr(u8)]
pub enum CeqOperation {
    Or = 1,
    Add = 2,
}

impl TryFrom<u8> for CeqOperation {
    type Error = CeqError;

    fn try_from(op: u8) -> Result<Self, Self::Error> {
        match op {
            1 => Ok(CeqOperation::Or),
            2 => Ok(CeqOperation::Add),
            _ => Err(CeqError::InvalidOperation),
        }
    }
}

#[derive(Debug, Default)]
pub struct CeqEvent {
    /// Combined payload since the last extraction.
    pub coalesce: AtomicU64,
    /// Last blob posted with this event.
    pub blob_data: AtomicU64,
    /// The event type is in the ring (or waits for recovery).
    pub idx_posted: AtomicBool,
    /// Free for the consumer to use.
    pub user_data: AtomicU64,
}

/// Sparse array of `CeqEvent`s, populated a chunk at a time.
pub struct CeqEvents {
    chunks: Box<[Once<Box<[CeqEvent]>>]>,
    nr_events: usize,
}

impl CeqEvents {
    fn new(nr_events: usize) -> Self {
        let nr_chunks = (nr_events + CEQ_EVENTS_PER_CHUNK - 1) / CEQ_EVENTS_PER_CHUNK;
        let chunks: Vec<Once<Box<[CeqEvent]>>> = (0..nr_chunks).map(|_| Once::new()).collect();
        CeqEvents {
            chunks: chunks.into_boxed_slice(),
            nr_events,
        }
    }

    pub fn len(&self) -> usize {
        self.nr_events
    }

    pub fn is_empty(&self) -> bool {
        self.nr_events == 0
    }

    /// Entry `idx`, populating its chunk on first touch.
    pub fn get(&self, idx: usize) -> Option<&CeqEvent> {
        if idx >= self.nr_events {
            return None;
        }
        let chunk = self.chunks.get(idx / CEQ_EVENTS_PER_CHUNK)?.call_once(|| {
            (0..CEQ_EVENTS_PER_CHUNK)
                .map(|_| CeqEvent::default())
                .collect::<Vec<CeqEvent>>()
                .into_boxed_slice()
        });
        chunk.get(idx % CEQ_EVENTS_PER_CHUNK)
    }

    /// Entry `idx` if its chunk was ever touched.
    pub fn get_if_populated(&self, idx: usize) -> Option<&CeqEvent> {
        if idx >= self.nr_events {
            return None;
        }
        self.chunks
            .get(idx / CEQ_EVENTS_PER_CHUNK)?
            .get()?
            .get(idx % CEQ_EVENTS_PER_CHUNK)
    }

    pub fn nr_populated_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.get().is_some()).count()
    }
}

pub struct Ceq {
    pub events: CeqEvents,
    /// Size of the event id space the consumer asked for.
    pub nr_events: AtomicU32,
    /// Recovery scan cursor.
    pub last_recovered: AtomicU32,
    /// Highest event type posted so far (bounds the recovery scan).
    pub max_event_ever: AtomicU32,
    pub ring: Box<[AtomicI32]>,
    pub ring_sz: AtomicU32,
    /// Raw `CeqOperation`.
    pub operation: AtomicU8,
    pub ring_overflowed: AtomicBool,
    pub overflow_recovery: AtomicBool,
    pub prod_idx: AtomicU32,
    pub cons_pub_idx: AtomicU32,
    pub cons_pvt_idx: AtomicU32,
    /// Serializes overflow recovery among consumers.
    pub u_lock: spin::Mutex<()>,
}

impl Ceq {
    pub fn new(op: CeqOperation, nr_events: u32, ring_sz: u32) -> Result<Self, CeqError> {
        if !ring_sz.is_power_of_two() {
            return Err(CeqError::RingNotPowerOfTwo);
        }
        if nr_events > CEQ_MAX_EVENTS {
            return Err(CeqError::TooManyEvents);
        }
        let ring: Vec<AtomicI32> = (0..ring_sz).map(|_| AtomicI32::new(CEQ_EMPTY_SLOT)).collect();
        Ok(Ceq {
            events: CeqEvents::new(nr_events as usize),
            nr_events: AtomicU32::new(nr_events),
            last_recovered: AtomicU32::new(0),
            max_event_ever: AtomicU32::new(0),
            ring: ring.into_boxed_slice(),
            ring_sz: AtomicU32::new(ring_sz),
            operation: AtomicU8::new(op as u8),
            ring_overflowed: AtomicBool::new(false),
            overflow_recovery: AtomicBool::new(false),
            prod_idx: AtomicU32::new(0),
            cons_pub_idx: AtomicU32::new(0),
            cons_pvt_idx: AtomicU32::new(0),
            u_lock: spin::Mutex::new(()),
        })
    }

    /// The ring slot for counter value `idx`, `None` if the (user-writable)
    /// ring size doesn't describe the ring we have.
    pub fn ring_slot(&self, idx: u32) -> Option<&AtomicI32> {
        let mask = self.ring_sz.load(Ordering::Relaxed).wrapping_sub(1);
        self.ring.get((idx & mask) as usize)
    }

    pub fn operation(&self) -> Result<CeqOperation, CeqError> {
        CeqOperation::try_from(self.operation.load(Ordering::Relaxed))
    }
}

/// Every slot of the ring is claimed by a producer and not yet published
/// back by consumers.
#[inline]
pub fn ceq_ring_full(ring_sz: u32, prod: u32, cons_pub: u32) -> bool {
    prod.wrapping_sub(cons_pub) >= ring_sz
}

#[inline]
pub fn ceq_ring_empty(prod: u32, cons_pvt: u32) -> bool {
    prod == cons_pvt
}

impl fmt::Debug for Ceq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ceq")
            .field("nr_events", &self.nr_events.load(Ordering::Relaxed))
            .field("ring_sz", &self.ring_sz.load(Ordering::Relaxed))
            .field("operation", &self.operation.load(Ordering::Relaxed))
            .field("prod_idx", &self.prod_idx.load(Ordering::Relaxed))
            .field("cons_pub_idx", &self.cons_pub_idx.load(Ordering::Relaxed))
            .field("cons_pvt_idx", &self.cons_pvt_idx.load(Ordering::Relaxed))
            .field("ring_overflowed", &self.ring_overflowed.load(Ordering::Relaxed))
            .field("overflow_recovery", &self.overflow_recovery.load(Ordering::Relaxed))
            .field("max_event_ever", &self.max_event_ever.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ring_must_be_pow2() {
        assert_eq!(
            Ceq::new(CeqOperation::Or, 16, 0).unwrap_err(),
            CeqError::RingNotPowerOfTwo
        );
        assert_eq!(
            Ceq::new(CeqOperation::Or, 16, 12).unwrap_err(),
            CeqError::RingNotPowerOfTwo
        );
        assert_eq!(
            Ceq::new(CeqOperation::Add, CEQ_MAX_EVENTS + 1, 8).unwrap_err(),
            CeqError::TooManyEvents
        );
        let ceq = Ceq::new(CeqOperation::Add, 16, 1).unwrap();
        assert_eq!(ceq.operation(), Ok(CeqOperation::Add));
        assert_eq!(ceq.ring[0].load(Ordering::Relaxed), CEQ_EMPTY_SLOT);
    }

    #[test]
    fn events_populate_lazily() {
        let ceq = Ceq::new(CeqOperation::Or, CEQ_MAX_EVENTS, 4).unwrap();
        assert_eq!(ceq.events.nr_populated_chunks(), 0);
        assert!(ceq.events.get_if_populated(60_000).is_none());

        let ev = ceq.events.get(60_000).unwrap();
        ev.coalesce.store(3, Ordering::Relaxed);
        assert_eq!(ceq.events.nr_populated_chunks(), 1);
        assert_eq!(
            ceq.events
                .get_if_populated(60_000)
                .unwrap()
                .coalesce
                .load(Ordering::Relaxed),
            3
        );
        assert!(ceq.events.get(CEQ_MAX_EVENTS as usize).is_none());
    }

    #[test]
    fn ring_slot_validation() {
        let ceq = Ceq::new(CeqOperation::Or, 4, 4).unwrap();
        assert!(ceq.ring_slot(5).is_some());
        ceq.ring_sz.store(1024, Ordering::Relaxed);
        assert!(ceq.ring_slot(5).is_none());
        ceq.ring_sz.store(0, Ordering::Relaxed);
        assert!(ceq.ring_slot(5).is_none());
    }

    #[test]
    fn ring_full_and_empty() {
        assert!(ceq_ring_empty(3, 3));
        assert!(!ceq_ring_empty(4, 3));
        assert!(ceq_ring_full(4, 6, 2));
        assert!(!ceq_ring_full(4, 5, 2));
        assert!(ceq_ring_full(4, 1, u32::MAX - 2));
    }
}
