// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Kernel (producer) side of the unbounded concurrent queue.
//!
//! The queue lives in memory the process can scribble on, so every page
//! reference read from it is checked against the page pool before use.

use core::sync::atomic::Ordering;

use log::{info, trace, warn};

use kpi::event::EventMsg;
use kpi::ucq::{page_deref, page_ref, Ucq, UcqIndex, NO_PAGE, NR_MSG_PER_PAGE};

use crate::error::{KError, KResult};
use crate::process::Process;

/// A slot counter this far past the end of its page means the process is
/// messing with the queue (or we have a bug).
const UCQ_SLOT_WARN: u32 = 3000;

/// Post `msg` into `ucq`, which belongs to `p`. Pages are added to the
/// queue as needed; `warn_thresh` extra pages are tolerated silently.
pub fn send_ucq_msg(ucq: &Ucq, p: &Process, msg: &EventMsg, warn_thresh: u32) -> KResult<()> {
    if !ucq.is_ready() {
        if p.is_mcp() {
            warn!("pid {}: ucq is not ready, dropping event {}", p.pid, msg.ev_type);
        }
        return Err(KError::QueueNotReady);
    }

    let mut my_slot = None;
    if !ucq.prod_overflow.load(Ordering::Acquire) {
        let idx = UcqIndex::from_raw(ucq.prod_idx.fetch_add(1, Ordering::AcqRel));
        if idx.slot_is_good() {
            my_slot = Some(idx);
        } else {
            // Everyone else goes straight to the slow path.
            ucq.prod_overflow.store(true, Ordering::Release);
            if idx.slot > UCQ_SLOT_WARN {
                warn!("pid {}: ucq slot counter is at {}", p.pid, idx.slot);
            }
        }
    }
    let my_slot = match my_slot {
        Some(idx) => idx,
        None => grow(ucq, p, warn_thresh)?,
    };

    let container = ucq
        .pool
        .page(my_slot.page_id())
        .and_then(|pg| pg.msgs.get(my_slot.slot as usize));
    let Some(container) = container else {
        warn!("pid {}: ucq slot {:?} is not mapped, dropping event", p.pid, my_slot);
        return Err(KError::BadAddress);
    };
    // Safety: the slot was claimed by our fetch-and-add on prod_idx.
    unsafe { container.publish(msg) };
    trace!("pid {}: ucq msg {} at {:?}", p.pid, msg.ev_type, my_slot);
    Ok(())
}

/// Slow path: the producer index ran off its page. Link a new page and
/// return its first slot, which is ours.
fn grow(ucq: &Ucq, p: &Process, warn_thresh: u32) -> KResult<UcqIndex> {
    let _guard = p.ucq_lock.lock();

    // Someone may have added a page while we waited.
    let old_raw = ucq.prod_idx.fetch_add(1, Ordering::AcqRel);
    let old_idx = UcqIndex::from_raw(old_raw);
    if old_idx.slot_is_good() {
        return Ok(old_idx);
    }

    let Some(old_page) = ucq.pool.page(old_idx.page_id()) else {
        warn!("pid {}: ucq prod_idx {:?} names a bad page", p.pid, old_idx);
        ucq.prod_overflow.store(false, Ordering::Release);
        return Err(KError::BadAddress);
    };

    let new_page = match page_deref(ucq.spare_pg.swap(NO_PAGE, Ordering::AcqRel)) {
        Some(spare) => {
            if ucq.pool.page(spare).is_none() {
                warn!("pid {}: ucq spare page {} is not mapped", p.pid, spare);
                ucq.prod_overflow.store(false, Ordering::Release);
                return Err(KError::BadAddress);
            }
            spare
        }
        None => {
            let extra = ucq.nr_extra_pgs.fetch_add(1, Ordering::AcqRel) + 1;
            if extra > warn_thresh {
                warn!("pid {}: ucq has {} extra pages", p.pid, extra);
            }
            match ucq.pool.map_page() {
                Some(id) => id,
                None => {
                    ucq.nr_extra_pgs.fetch_sub(1, Ordering::AcqRel);
                    // Park the index at the end of the page so consumers see
                    // a drained queue, the next send tries to grow again.
                    ucq.prod_idx.store(
                        UcqIndex::new(old_idx.page, NR_MSG_PER_PAGE as u32).raw(),
                        Ordering::Release,
                    );
                    ucq.prod_overflow.store(false, Ordering::Release);
                    warn!("pid {}: out of ucq pages, dropping event", p.pid);
                    return Err(KError::OutOfMemory);
                }
            }
        }
    };

    let Some(page) = ucq.pool.page(new_page) else {
        ucq.prod_overflow.store(false, Ordering::Release);
        return Err(KError::BadAddress);
    };
    page.reset_header();
    old_page
        .header
        .cons_next_pg
        .store(page_ref(new_page), Ordering::Release);
    // Slot 0 is for us.
    ucq.prod_idx
        .store(UcqIndex::new(new_page as u32, 1).raw(), Ordering::Release);
    ucq.prod_overflow.store(false, Ordering::Release);
    trace!("pid {}: ucq page {} -> {}", p.pid, old_idx.page, new_page);
    Ok(UcqIndex::new(new_page as u32, 0))
}

/// Dump the state of `ucq`.
pub fn print_ucq(ucq: &Ucq, p: &Process) {
    let prod = ucq.prod();
    let cons = ucq.cons();
    info!(
        "pid {} ucq: ready {}, prod {:?} (overflow {}), cons {:?}, spare {:?}, extra pages {}, mapped {}/{}",
        p.pid,
        ucq.is_ready(),
        prod,
        ucq.prod_overflow.load(Ordering::Relaxed),
        cons,
        page_deref(ucq.spare_pg.load(Ordering::Relaxed)),
        ucq.nr_extra_pgs.load(Ordering::Relaxed),
        ucq.pool.nr_mapped(),
        ucq.pool.capacity(),
    );
    let mut cur = Some(cons.page_id());
    while let Some(id) = cur {
        let Some(page) = ucq.pool.page(id) else {
            info!("    page {}: not mapped", id);
            break;
        };
        info!(
            "    page {}: nr_cons {}, next {:?}",
            id,
            page.header.nr_cons.load(Ordering::Relaxed),
            page_deref(page.header.cons_next_pg.load(Ordering::Relaxed))
        );
        if id == prod.page_id() {
            break;
        }
        cur = page_deref(page.header.cons_next_pg.load(Ordering::Relaxed));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cmdline::CommandLineArguments;
    use crate::Kernel;
    use kpi::event::EV_ALARM;

    #[test]
    fn fast_path_fills_first_page() {
        let _r = env_logger::try_init();
        let k = Kernel::new(CommandLineArguments::default()).unwrap();
        let p = k.proc_create(0).unwrap();
        let ucq = Ucq::new(3);
        for i in 0..NR_MSG_PER_PAGE as u32 {
            send_ucq_msg(&ucq, &p, &EventMsg::with_args(EV_ALARM, i, 0), 10).unwrap();
        }
        assert_eq!(ucq.prod(), UcqIndex::new(0, NR_MSG_PER_PAGE as u32));
        assert!(!ucq.prod_overflow.load(Ordering::Relaxed));

        // The next one takes the spare page.
        send_ucq_msg(&ucq, &p, &EventMsg::new(EV_ALARM), 10).unwrap();
        assert_eq!(ucq.prod(), UcqIndex::new(1, 1));
        assert_eq!(ucq.spare_pg.load(Ordering::Relaxed), NO_PAGE);
        let first = ucq.pool.page(0).unwrap();
        assert_eq!(page_deref(first.header.cons_next_pg.load(Ordering::Relaxed)), Some(1));

        // Then a fresh one is mapped.
        for _ in 1..NR_MSG_PER_PAGE {
            send_ucq_msg(&ucq, &p, &EventMsg::new(EV_ALARM), 10).unwrap();
        }
        send_ucq_msg(&ucq, &p, &EventMsg::new(EV_ALARM), 10).unwrap();
        assert_eq!(ucq.prod(), UcqIndex::new(2, 1));
        assert_eq!(ucq.nr_extra_pgs.load(Ordering::Relaxed), 1);
        assert_eq!(ucq.pool.nr_mapped(), 3);
        print_ucq(&ucq, &p);
    }

    #[test]
    fn pool_exhaustion() {
        let k = Kernel::new(CommandLineArguments::default()).unwrap();
        let p = k.proc_create(0).unwrap();
        let ucq = Ucq::new(2);
        for _ in 0..2 * NR_MSG_PER_PAGE {
            send_ucq_msg(&ucq, &p, &EventMsg::new(EV_ALARM), 10).unwrap();
        }
        assert_eq!(
            send_ucq_msg(&ucq, &p, &EventMsg::new(EV_ALARM), 10),
            Err(KError::OutOfMemory)
        );
        assert_eq!(ucq.nr_extra_pgs.load(Ordering::Relaxed), 0);
        assert!(!ucq.prod_overflow.load(Ordering::Relaxed));
        // Parked at the end of the last page.
        assert_eq!(ucq.prod(), UcqIndex::new(1, NR_MSG_PER_PAGE as u32));
    }

    #[test]
    fn not_ready() {
        let k = Kernel::new(CommandLineArguments::default()).unwrap();
        let p = k.proc_create(0).unwrap();
        let ucq = Ucq::new(2);
        ucq.ucq_ready.store(false, Ordering::Relaxed);
        assert_eq!(
            send_ucq_msg(&ucq, &p, &EventMsg::new(EV_ALARM), 10),
            Err(KError::QueueNotReady)
        );
    }

    #[test]
    fn scribbled_prod_idx() {
        let k = Kernel::new(CommandLineArguments::default()).unwrap();
        let p = k.proc_create(0).unwrap();
        let ucq = Ucq::new(2);
        ucq.prod_idx
            .store(UcqIndex::new(57, 3).raw(), Ordering::Relaxed);
        assert_eq!(
            send_ucq_msg(&ucq, &p, &EventMsg::new(EV_ALARM), 10),
            Err(KError::BadAddress)
        );
        ucq.prod_idx
            .store(UcqIndex::new(57, 5000).raw(), Ordering::Relaxed);
        assert_eq!(
            send_ucq_msg(&ucq, &p, &EventMsg::new(EV_ALARM), 10),
            Err(KError::BadAddress)
        );
        assert!(!ucq.prod_overflow.load(Ordering::Relaxed));
    }
}
