// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Layout of the unbounded concurrent queue (UCQ).
//!
//! A UCQ is a chain of pages. Each page starts with a small header followed
//! by as many message containers as fit. `prod_idx` and `cons_idx` name a
//! (page, slot) pair; running off the end of a page (a slot index that is
//! not good) is how both sides learn that they have to move to the next
//! page. Producers add pages, the consumer retires them into a one-page
//! spare cache.
//!
//! Pages come from a [`UcqPagePool`], which stands in for the anonymous
//! memory a process maps for its queues. Page references stored inside the
//! queue are user-writable and have to be validated through
//! [`UcqPagePool::page`] before use.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::convert::TryFrom;
use core::fmt;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::event::EventMsg;
use crate::BASE_PAGE_SIZE;

/// Index of a page in its pool.
pub type PageId = u64;

/// Encoded "no page" in `cons_next_pg` and `spare_pg`.
pub const NO_PAGE: u64 = 0;

/// Initialization maps two pages, one in use and one spare.
pub const UCQ_MIN_PAGES: usize = 2;

#[inline]
pub fn page_ref(page: PageId) -> u64 {
    page + 1
}

#[inline]
pub fn page_deref(raw: u64) -> Option<PageId> {
    raw.checked_sub(1)
}

#[derive(Debug, Default)]
#[repr(C)]
pub struct UcqPageHeader {
    /// Next page in the chain (`page_ref` encoded), set by a producer.
    pub cons_next_pg: AtomicU64,
    /// Number of consumers that are done with a slot of this page.
    pub nr_cons: AtomicU32,
}

#[repr(C)]
pub struct MsgContainer {
    ev_msg: UnsafeCell<EventMsg>,
    pub ready: AtomicBool,
}

// Safety: a container belongs to whoever claimed its slot; the ready flag
// hands it from producer to consumer.
unsafe impl Sync for MsgContainer {}

impl MsgContainer {
    fn new() -> Self {
        MsgContainer {
            ev_msg: UnsafeCell::new(EventMsg::default()),
            ready: AtomicBool::new(false),
        }
    }

    /// Write the payload and hand it to the consumer.
    ///
    /// # Safety
    /// The caller has claimed this slot through `prod_idx`.
    pub unsafe fn publish(&self, msg: &EventMsg) {
        *self.ev_msg.get() = *msg;
        self.ready.store(true, Ordering::Release);
    }

    /// Read the payload once `ready` was observed and release the slot.
    ///
    /// # Safety
    /// The caller has claimed this slot through `cons_idx` and has seen
    /// `ready` set with acquire ordering.
    pub unsafe fn take(&self) -> EventMsg {
        let msg = *self.ev_msg.get();
        self.ready.store(false, Ordering::Release);
        msg
    }
}

/// Number of message containers in one page.
pub const NR_MSG_PER_PAGE: usize =
    (BASE_PAGE_SIZE - size_of::<UcqPageHeader>()) / size_of::<MsgContainer>();

#[repr(C)]
pub struct UcqPage {
    pub header: UcqPageHeader,
    pub msgs: [MsgContainer; NR_MSG_PER_PAGE],
}

static_assertions::const_assert!(size_of::<UcqPage>() <= BASE_PAGE_SIZE);
static_assertions::const_assert!(NR_MSG_PER_PAGE > 1);

impl UcqPage {
    fn new() -> Self {
        UcqPage {
            header: Default::default(),
            msgs: core::array::from_fn(|_| MsgContainer::new()),
        }
    }

    /// Clear the header so the page can start a new life in the chain.
    pub fn reset_header(&self) {
        self.header.cons_next_pg.store(NO_PAGE, Ordering::Relaxed);
        self.header.nr_cons.store(0, Ordering::Relaxed);
    }

    fn zero(&self) {
        self.reset_header();
        for m in self.msgs.iter() {
            m.ready.store(false, Ordering::Relaxed);
        }
    }
}

/// A (page, slot) position in the queue.
///
/// Stored raw in a single 64-bit word so it can be CASed and
/// fetch-and-added; the slot lives in the low half.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UcqIndex {
    pub page: u32,
    pub slot: u32,
}

impl UcqIndex {
    pub const fn new(page: u32, slot: u32) -> Self {
        UcqIndex { page, slot }
    }

    pub const fn from_raw(raw: u64) -> Self {
        UcqIndex {
            page: (raw >> 32) as u32,
            slot: raw as u32,
        }
    }

    pub const fn raw(&self) -> u64 {
        ((self.page as u64) << 32) | self.slot as u64
    }

    pub fn page_id(&self) -> PageId {
        self.page as PageId
    }

    /// The slot is inside its page.
    pub fn slot_is_good(&self) -> bool {
        (self.slot as usize) < NR_MSG_PER_PAGE
    }
}

/// The pages a process has mapped for one UCQ.
pub struct UcqPagePool {
    pages: Box<[UcqPage]>,
    mapped: Box<[AtomicBool]>,
    nr_mapped: AtomicUsize,
    nr_maps: AtomicUsize,
}

impl UcqPagePool {
    pub fn new(nr_pages: usize) -> Self {
        let pages: Vec<UcqPage> = (0..nr_pages).map(|_| UcqPage::new()).collect();
        let mapped: Vec<AtomicBool> = (0..nr_pages).map(|_| AtomicBool::new(false)).collect();
        UcqPagePool {
            pages: pages.into_boxed_slice(),
            mapped: mapped.into_boxed_slice(),
            nr_mapped: AtomicUsize::new(0),
            nr_maps: AtomicUsize::new(0),
        }
    }

    /// Map a fresh, zeroed page. `None` if the pool is exhausted.
    pub fn map_page(&self) -> Option<PageId> {
        for (id, m) in self.mapped.iter().enumerate() {
            if m.compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.pages[id].zero();
                self.nr_mapped.fetch_add(1, Ordering::Relaxed);
                self.nr_maps.fetch_add(1, Ordering::Relaxed);
                return Some(id as PageId);
            }
        }
        None
    }

    /// Give a page back. Returns false if it wasn't mapped.
    pub fn unmap_page(&self, id: PageId) -> bool {
        let unmapped = self
            .mapped
            .get(id as usize)
            .map(|m| m.swap(false, Ordering::AcqRel))
            .unwrap_or(false);
        if unmapped {
            self.nr_mapped.fetch_sub(1, Ordering::Relaxed);
        }
        unmapped
    }

    /// Resolve a page reference; fails for pages outside the pool or not mapped.
    pub fn page(&self, id: PageId) -> Option<&UcqPage> {
        let idx = usize::try_from(id).ok()?;
        if self.mapped.get(idx)?.load(Ordering::Acquire) {
            self.pages.get(idx)
        } else {
            None
        }
    }

    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    /// Pages currently mapped.
    pub fn nr_mapped(&self) -> usize {
        self.nr_mapped.load(Ordering::Relaxed)
    }

    /// Map operations performed since creation.
    pub fn nr_maps(&self) -> usize {
        self.nr_maps.load(Ordering::Relaxed)
    }
}

/// The UCQ header shared by kernel producers and user consumers.
pub struct Ucq {
    pub prod_idx: AtomicU64,
    /// Hint that the producer index ran past its page.
    pub prod_overflow: AtomicBool,
    /// Cached spare page (`page_ref` encoded).
    pub spare_pg: AtomicU64,
    /// Pages mapped beyond the initial two.
    pub nr_extra_pgs: AtomicU32,
    pub cons_idx: AtomicU64,
    pub ucq_ready: AtomicBool,
    /// Serializes consumers that move to the next page.
    pub u_lock: spin::Mutex<()>,
    pub pool: UcqPagePool,
}

impl Ucq {
    /// A ready UCQ whose pages come from a pool of `nr_pages` pages (at
    /// least [`UCQ_MIN_PAGES`]).
    pub fn new(nr_pages: usize) -> Self {
        let ucq = Ucq {
            prod_idx: AtomicU64::new(0),
            prod_overflow: AtomicBool::new(false),
            spare_pg: AtomicU64::new(NO_PAGE),
            nr_extra_pgs: AtomicU32::new(0),
            cons_idx: AtomicU64::new(0),
            ucq_ready: AtomicBool::new(false),
            u_lock: spin::Mutex::new(()),
            pool: UcqPagePool::new(core::cmp::max(nr_pages, UCQ_MIN_PAGES)),
        };
        let pg1 = ucq.pool.map_page();
        let pg2 = ucq.pool.map_page();
        if let (Some(pg1), Some(pg2)) = (pg1, pg2) {
            ucq.init_raw(pg1, pg2);
        }
        ucq
    }

    /// Initialize with two already mapped pages.
    pub fn init_raw(&self, pg1: PageId, pg2: PageId) {
        let start = UcqIndex::new(pg1 as u32, 0).raw();
        self.prod_idx.store(start, Ordering::Relaxed);
        self.prod_overflow.store(false, Ordering::Relaxed);
        self.cons_idx.store(start, Ordering::Relaxed);
        self.spare_pg.store(page_ref(pg2), Ordering::Relaxed);
        self.nr_extra_pgs.store(0, Ordering::Relaxed);
        self.ucq_ready.store(true, Ordering::Release);
    }

    pub fn prod(&self) -> UcqIndex {
        UcqIndex::from_raw(self.prod_idx.load(Ordering::Acquire))
    }

    pub fn cons(&self) -> UcqIndex {
        UcqIndex::from_raw(self.cons_idx.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.ucq_ready.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Ucq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ucq")
            .field("prod_idx", &self.prod())
            .field("cons_idx", &self.cons())
            .field("prod_overflow", &self.prod_overflow.load(Ordering::Relaxed))
            .field("spare_pg", &page_deref(self.spare_pg.load(Ordering::Relaxed)))
            .field("nr_extra_pgs", &self.nr_extra_pgs.load(Ordering::Relaxed))
            .field("ready", &self.is_ready())
            .finish()
    }
}
