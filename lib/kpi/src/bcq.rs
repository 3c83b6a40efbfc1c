// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A bounded, lock-free, multi-producer multi-consumer ring buffer (BCQ).
//!
//! The queue lives in memory shared between the kernel (producer) and
//! user-space (consumer). Producers claim slots by CAS on `prod_idx`.
//! Consumers claim by CAS on `cons_pvt_idx` and publish their progress in
//! order through `cons_pub_idx`, which is what producers use to decide
//! whether the ring is full.
//!
//! All indices are free-running `u32` counters; positions are taken modulo
//! the (power-of-two) capacity so wraparound is harmless.
//!
//! A consumer that gets preempted between claiming a slot and publishing
//! stalls the consumers behind it (they wait for `cons_pub_idx` to reach
//! their slot). Producers never wait on consumers.

use core::cell::UnsafeCell;
use core::fmt;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crossbeam_utils::Backoff;

/// Errors returned by BCQ operations.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum BcqError {
    /// The ring has no free slot.
    Busy,
    /// Gave up after too many failed claim attempts.
    Fail,
    /// Nothing to dequeue.
    Empty,
}

/// Free slots in a ring of `size` entries given the producer and
/// published-consumer counters.
#[inline]
pub fn bcq_free_slots(prod: u32, cons_pub: u32, size: u32) -> u32 {
    let outstanding = prod.wrapping_sub(cons_pub);
    // A corrupt consumer can make `outstanding` exceed the size, treat that as full.
    size.saturating_sub(outstanding)
}

/// Indices shared by producers and consumers.
#[derive(Debug, Default)]
pub struct BcqHeader {
    /// Next slot to be claimed by a producer.
    pub prod_idx: AtomicU32,
    /// Last slot handed back to producers + 1.
    pub cons_pub_idx: AtomicU32,
    /// Next slot to be claimed by a consumer.
    pub cons_pvt_idx: AtomicU32,
}

struct BcqSlot<T> {
    elem: UnsafeCell<T>,
    rdy_for_cons: AtomicBool,
}

pub struct Bcq<T, const N: usize> {
    pub hdr: BcqHeader,
    wraps: [BcqSlot<T>; N],
}

// Safety: access to an element is serialized by the claim protocol
// (a slot belongs to one producer, then to one consumer).
unsafe impl<T: Send, const N: usize> Sync for Bcq<T, N> {}

impl<T: Copy + Default, const N: usize> Bcq<T, N> {
    const CAPACITY_IS_POW2: () = assert!(N.is_power_of_two(), "BCQ size must be a power of two");

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_IS_POW2;
        Bcq {
            hdr: Default::default(),
            wraps: core::array::from_fn(|_| BcqSlot {
                elem: UnsafeCell::new(T::default()),
                rdy_for_cons: AtomicBool::new(false),
            }),
        }
    }

    /// How many elements the ring holds.
    pub fn capacity(&self) -> usize {
        N
    }

    pub fn free_slots(&self) -> u32 {
        bcq_free_slots(
            self.hdr.prod_idx.load(Ordering::Acquire),
            self.hdr.cons_pub_idx.load(Ordering::Acquire),
            N as u32,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.hdr.prod_idx.load(Ordering::Acquire) == self.hdr.cons_pvt_idx.load(Ordering::Acquire)
    }

    /// Append `elem`.
    ///
    /// Gives up with `BcqError::Fail` after `num_fail` lost races on the
    /// producer index (`0` retries forever). A full ring returns
    /// `BcqError::Busy` right away.
    pub fn enqueue(&self, elem: &T, num_fail: u32) -> Result<(), BcqError> {
        let mut failctr = 0;
        let my_idx = loop {
            let prod = self.hdr.prod_idx.load(Ordering::Acquire);
            let cons_pub = self.hdr.cons_pub_idx.load(Ordering::Acquire);
            if bcq_free_slots(prod, cons_pub, N as u32) == 0 {
                return Err(BcqError::Busy);
            }
            if self
                .hdr
                .prod_idx
                .compare_exchange(prod, prod.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break prod;
            }
            failctr += 1;
            if num_fail != 0 && failctr >= num_fail {
                return Err(BcqError::Fail);
            }
            spin_loop();
        };

        let slot = &self.wraps[my_idx as usize & (N - 1)];
        // Safety: we won the CAS for `my_idx`, the consumer that used this
        // slot before has published past it (otherwise the ring was full).
        unsafe {
            *slot.elem.get() = *elem;
        }
        slot.rdy_for_cons.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove the oldest element.
    pub fn dequeue(&self) -> Result<T, BcqError> {
        let my_idx = loop {
            let prod = self.hdr.prod_idx.load(Ordering::Acquire);
            let cons_pvt = self.hdr.cons_pvt_idx.load(Ordering::Acquire);
            if prod == cons_pvt {
                return Err(BcqError::Empty);
            }
            if self
                .hdr
                .cons_pvt_idx
                .compare_exchange(
                    cons_pvt,
                    cons_pvt.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break cons_pvt;
            }
            spin_loop();
        };

        let slot = &self.wraps[my_idx as usize & (N - 1)];
        let backoff = Backoff::new();
        // The producer may have claimed the slot without having filled it yet.
        while !slot.rdy_for_cons.load(Ordering::Acquire) {
            backoff.snooze();
        }
        // Safety: the ready flag hands the slot to us until we clear it.
        let elem = unsafe { *slot.elem.get() };
        slot.rdy_for_cons.store(false, Ordering::Release);

        // Publish in order: wait for whoever holds the slot before ours.
        while self.hdr.cons_pub_idx.load(Ordering::Acquire) != my_idx {
            backoff.snooze();
        }
        self.hdr
            .cons_pub_idx
            .store(my_idx.wrapping_add(1), Ordering::Release);
        Ok(elem)
    }
}

impl<T: Copy + Default, const N: usize> Default for Bcq<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> fmt::Debug for Bcq<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bcq")
            .field("size", &N)
            .field("hdr", &self.hdr)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::collections::VecDeque;
    use alloc::vec::Vec;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn enqueue_dequeue() {
        let _r = env_logger::try_init();
        let q: Bcq<u64, 4> = Bcq::new();
        assert!(q.is_empty());
        assert_eq!(q.dequeue(), Err(BcqError::Empty));

        q.enqueue(&1, 0).unwrap();
        q.enqueue(&2, 0).unwrap();
        assert_eq!(q.free_slots(), 2);
        assert_eq!(q.dequeue(), Ok(1));
        assert_eq!(q.dequeue(), Ok(2));
        assert!(q.is_empty());
        assert_eq!(q.free_slots(), 4);
    }

    #[test]
    fn full_ring_is_busy() {
        let q: Bcq<u64, 4> = Bcq::new();
        for i in 0..4 {
            q.enqueue(&i, 0).unwrap();
        }
        assert_eq!(q.enqueue(&99, 0), Err(BcqError::Busy));
        assert_eq!(q.dequeue(), Ok(0));
        q.enqueue(&4, 0).unwrap();
        let drained: Vec<u64> = (0..4).map(|_| q.dequeue().unwrap()).collect();
        assert_eq!(drained, [1, 2, 3, 4]);
    }

    #[test]
    fn indices_wrap_around() {
        let q: Bcq<u64, 8> = Bcq::new();
        let start = u32::MAX - 3;
        q.hdr.prod_idx.store(start, Ordering::Relaxed);
        q.hdr.cons_pub_idx.store(start, Ordering::Relaxed);
        q.hdr.cons_pvt_idx.store(start, Ordering::Relaxed);

        for i in 0..8 {
            q.enqueue(&i, 0).unwrap();
        }
        assert_eq!(q.enqueue(&8, 0), Err(BcqError::Busy));
        assert_eq!(q.hdr.prod_idx.load(Ordering::Relaxed), 4);
        for i in 0..8 {
            assert_eq!(q.dequeue(), Ok(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn free_slots_formula() {
        assert_eq!(bcq_free_slots(0, 0, 16), 16);
        assert_eq!(bcq_free_slots(16, 0, 16), 0);
        assert_eq!(bcq_free_slots(3, u32::MAX - 1, 16), 11);
        // corrupted consumer index
        assert_eq!(bcq_free_slots(40, 0, 16), 0);
    }

    #[test]
    fn mpmc_every_element_once() {
        let _r = env_logger::try_init();
        const PRODUCERS: u64 = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 2000;

        let q: Arc<Bcq<u64, 16>> = Arc::new(Bcq::new());
        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let q = q.clone();
            producers.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let v = (p << 32) | i;
                    while q.enqueue(&v, 0).is_err() {
                        spin_loop();
                    }
                }
            }));
        }

        let total = (PRODUCERS * PER_PRODUCER) as usize;
        let received = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut consumers = Vec::new();
        for _c in 0..CONSUMERS {
            let q = q.clone();
            let received = received.clone();
            consumers.push(thread::spawn(move || {
                let mut mine = Vec::new();
                while received.load(Ordering::SeqCst) < total {
                    if let Ok(v) = q.dequeue() {
                        received.fetch_add(1, Ordering::SeqCst);
                        mine.push(v);
                    }
                }
                mine
            }));
        }

        for p in producers {
            p.join().unwrap();
        }
        let mut seen = HashSet::new();
        for c in consumers {
            for v in c.join().unwrap() {
                assert!(seen.insert(v), "element {:#x} dequeued twice", v);
            }
        }
        assert_eq!(seen.len(), total);
        assert!(q.is_empty());
    }

    proptest! {
        /// The ring never holds more than its capacity and behaves like a
        /// FIFO when driven from a single thread.
        #[test]
        fn behaves_like_bounded_fifo(ops in proptest::collection::vec(any::<bool>(), 0..256)) {
            let q: Bcq<u64, 8> = Bcq::new();
            let mut model: VecDeque<u64> = VecDeque::new();
            let mut next = 0u64;
            for enq in ops {
                if enq {
                    let r = q.enqueue(&next, 0);
                    if model.len() == 8 {
                        prop_assert_eq!(r, Err(BcqError::Busy));
                    } else {
                        prop_assert_eq!(r, Ok(()));
                        model.push_back(next);
                    }
                    next += 1;
                } else {
                    match model.pop_front() {
                        Some(v) => prop_assert_eq!(q.dequeue(), Ok(v)),
                        None => prop_assert_eq!(q.dequeue(), Err(BcqError::Empty)),
                    }
                }
                prop_assert_eq!(q.free_slots() as usize, 8 - model.len());
            }
        }
    }
}
