// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Consumer side of the coalescing event queue.

use core::sync::atomic::Ordering;

use crossbeam_utils::Backoff;
use log::trace;

use kpi::ceq::{ceq_ring_empty, Ceq, CEQ_EMPTY_SLOT};
use kpi::event::EventMsg;

/// Pop an event type from the ring (BCQ style), `None` if the ring is empty.
fn get_ring_idx(ceq: &Ceq) -> Option<i32> {
    let backoff = Backoff::new();
    let my_idx = loop {
        let prod = ceq.prod_idx.load(Ordering::Acquire);
        let cons_pvt = ceq.cons_pvt_idx.load(Ordering::Acquire);
        if ceq_ring_empty(prod, cons_pvt) {
            return None;
        }
        if ceq
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
        backoff.spin();
    };

    let slot = ceq.ring_slot(my_idx)?;
    // The producer claimed the slot and may not have written it yet.
    let ev_type = loop {
        let v = slot.load(Ordering::Acquire);
        if v != CEQ_EMPTY_SLOT {
            break v;
        }
        backoff.snooze();
    };
    slot.store(CEQ_EMPTY_SLOT, Ordering::Release);

    // Publish in order.
    while ceq.cons_pub_idx.load(Ordering::Acquire) != my_idx {
        backoff.snooze();
    }
    ceq.cons_pub_idx
        .store(my_idx.wrapping_add(1), Ordering::Release);
    Some(ev_type)
}

/// Take the pending state of event `idx`.
fn extract_ceq_msg(ceq: &Ceq, idx: usize) -> Option<EventMsg> {
    let ev = ceq.events.get_if_populated(idx)?;
    if !ev.idx_posted.load(Ordering::Acquire) {
        return None;
    }
    // Coalesces after this point post the index again.
    ev.idx_posted.store(false, Ordering::SeqCst);
    let coalesced = ev.coalesce.swap(0, Ordering::AcqRel);
    let blob = ev.blob_data.swap(0, Ordering::AcqRel);
    Some(EventMsg {
        ev_type: idx as u16,
        ev_arg2: coalesced as u32,
        ev_arg3: blob,
        ..Default::default()
    })
}

/// Next pending event, coalesced since its previous extraction.
///
/// An overflowed ring is recovered by scanning the event array. The scan
/// position is shared, so the recovery started by one consumer may be
/// finished by another.
pub fn get_ceq_msg(ceq: &Ceq) -> Option<EventMsg> {
    while let Some(idx) = get_ring_idx(ceq) {
        // A ring entry whose event was already taken by recovery is stale.
        if let Some(msg) = extract_ceq_msg(ceq, idx as usize) {
            return Some(msg);
        }
    }

    if !ceq.ring_overflowed.load(Ordering::Acquire) && !ceq.overflow_recovery.load(Ordering::Acquire)
    {
        return None;
    }

    let _guard = ceq.u_lock.lock();
    if !ceq.overflow_recovery.load(Ordering::Acquire) {
        // Set recovery before clearing the overflow flag.
        ceq.overflow_recovery.store(true, Ordering::SeqCst);
        ceq.ring_overflowed.store(false, Ordering::SeqCst);
        ceq.last_recovered.store(0, Ordering::SeqCst);
        trace!("ceq: starting overflow recovery");
    }
    loop {
        let i = ceq.last_recovered.load(Ordering::Acquire);
        if i > ceq.max_event_ever.load(Ordering::Acquire) {
            break;
        }
        ceq.last_recovered.store(i + 1, Ordering::Release);
        if let Some(msg) = extract_ceq_msg(ceq, i as usize) {
            return Some(msg);
        }
    }
    ceq.overflow_recovery.store(false, Ordering::Release);
    trace!("ceq: overflow recovery done");
    None
}

/// No events in the ring, no overflow to recover and nobody recovering.
pub fn ceq_is_empty(ceq: &Ceq) -> bool {
    ceq_ring_empty(
        ceq.prod_idx.load(Ordering::Acquire),
        ceq.cons_pvt_idx.load(Ordering::Acquire),
    ) && !ceq.ring_overflowed.load(Ordering::Acquire)
        && !ceq.u_lock.is_locked()
}
