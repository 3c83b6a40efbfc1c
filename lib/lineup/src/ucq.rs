// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Consumer side of the unbounded concurrent queue.
//!
//! Any number of consumers can pull from a UCQ at the same time. Slots are
//! claimed with a CAS on `cons_idx`; moving to the next page is done by
//! whoever finds the index off the end of its page, under `u_lock`.

use core::sync::atomic::Ordering;

use crossbeam_utils::Backoff;
use log::{error, trace};

use kpi::event::EventMsg;
use kpi::ucq::{page_deref, page_ref, Ucq, UcqIndex, NO_PAGE, NR_MSG_PER_PAGE};

/// Nothing left to consume (at the time of the call).
pub fn ucq_is_empty(ucq: &Ucq) -> bool {
    ucq.cons_idx.load(Ordering::Acquire) == ucq.prod_idx.load(Ordering::Acquire)
}

/// Dequeue the next message, `None` if the queue is empty.
pub fn get_ucq_msg(ucq: &Ucq) -> Option<EventMsg> {
    let backoff = Backoff::new();
    let my_idx = loop {
        let raw = ucq.cons_idx.load(Ordering::Acquire);
        if raw == ucq.prod_idx.load(Ordering::Acquire) {
            return None;
        }
        let my_idx = UcqIndex::from_raw(raw);
        if !my_idx.slot_is_good() {
            advance_page(ucq, raw)?;
            continue;
        }
        if ucq
            .cons_idx
            .compare_exchange(raw, raw.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            break my_idx;
        }
        backoff.spin();
    };

    let Some(page) = ucq.pool.page(my_idx.page_id()) else {
        error!("ucq: claimed slot {:?} on an unmapped page", my_idx);
        return None;
    };
    let container = &page.msgs[my_idx.slot as usize];
    // The producer may still be writing the message.
    while !container.ready.load(Ordering::Acquire) {
        backoff.snooze();
    }
    // Safety: we own the slot (CAS on cons_idx) and observed `ready`.
    let msg = unsafe { container.take() };
    page.header.nr_cons.fetch_add(1, Ordering::AcqRel);
    Some(msg)
}

/// Move `cons_idx` from the exhausted page `raw` names to the next page and
/// retire the old page into the spare slot.
///
/// Returns `None` if the chain is broken or if no page follows: a producer
/// that ran out of pages leaves the queue drained at the end of the page.
fn advance_page(ucq: &Ucq, raw: u64) -> Option<()> {
    let _guard = ucq.u_lock.lock();
    if ucq.cons_idx.load(Ordering::Acquire) != raw {
        // Someone else moved on while we waited for the lock.
        return Some(());
    }

    let old_idx = UcqIndex::from_raw(raw);
    let Some(old_page) = ucq.pool.page(old_idx.page_id()) else {
        error!("ucq: consumer index {:?} names an unmapped page", old_idx);
        return None;
    };

    let backoff = Backoff::new();
    // The producer that overflowed the page links the next one while
    // holding its lock and `prod_overflow` is set, it can't be long.
    let next = loop {
        if let Some(next) = page_deref(old_page.header.cons_next_pg.load(Ordering::Acquire)) {
            break next;
        }
        if !ucq.prod_overflow.load(Ordering::Acquire)
            && old_page.header.cons_next_pg.load(Ordering::Acquire) == NO_PAGE
        {
            trace!("ucq: nothing linked after page {}", old_idx.page);
            return None;
        }
        backoff.snooze();
    };
    ucq.cons_idx
        .store(UcqIndex::new(next as u32, 0).raw(), Ordering::Release);

    // Wait for the consumers still reading from the old page.
    while (old_page.header.nr_cons.load(Ordering::Acquire) as usize) < NR_MSG_PER_PAGE {
        backoff.snooze();
    }
    old_page.reset_header();

    let old_spare = ucq
        .spare_pg
        .swap(page_ref(old_idx.page_id()), Ordering::AcqRel);
    if let Some(spare) = page_deref(old_spare) {
        // Two spares is one too many.
        ucq.pool.unmap_page(spare);
        let _ = ucq
            .nr_extra_pgs
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| n.checked_sub(1));
    }
    trace!(
        "ucq: retired page {} (next {}, extra pages {})",
        old_idx.page,
        next,
        ucq.nr_extra_pgs.load(Ordering::Relaxed)
    );
    Some(())
}

/// Unmap every page of the queue. The queue is unusable afterwards.
pub fn ucq_free_pgs(ucq: &Ucq) {
    ucq.ucq_ready.store(false, Ordering::Release);
    let _guard = ucq.u_lock.lock();

    let mut cur = Some(ucq.cons().page_id());
    while let Some(id) = cur {
        cur = ucq
            .pool
            .page(id)
            .and_then(|pg| page_deref(pg.header.cons_next_pg.load(Ordering::Acquire)));
        ucq.pool.unmap_page(id);
    }
    if let Some(spare) = page_deref(ucq.spare_pg.swap(NO_PAGE, Ordering::AcqRel)) {
        ucq.pool.unmap_page(spare);
    }
}
