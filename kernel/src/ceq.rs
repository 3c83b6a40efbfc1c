// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Kernel (producer) side of the coalescing event queue.
//!
//! Every event type has one entry; posting an event folds its payload into
//! the entry and puts the type into the ring only if it isn't there yet.
//! When the ring is full the consumer finds the event by scanning the
//! entries instead.

use core::sync::atomic::Ordering;

use log::{info, trace, warn};

use kpi::ceq::{ceq_ring_full, Ceq, CeqOperation};
use kpi::event::EventMsg;

use crate::error::{KError, KResult};
use crate::process::Process;

/// Post `msg` into `ceq` (owned by `p`), trying at most `ring_tries` times
/// to claim a ring slot.
pub fn send_ceq_msg(ceq: &Ceq, p: &Process, msg: &EventMsg, ring_tries: usize) -> KResult<()> {
    let ev_type = msg.ev_type as u32;
    if ev_type >= ceq.nr_events.load(Ordering::Acquire) || ev_type as usize >= ceq.events.len() {
        warn!(
            "pid {}: ceq too small for event {} (nr_events {})",
            p.pid,
            ev_type,
            ceq.nr_events.load(Ordering::Relaxed)
        );
        return Err(KError::CeqTooSmall {
            ev_type: msg.ev_type,
        });
    }
    ceq.max_event_ever.fetch_max(ev_type, Ordering::AcqRel);

    let Some(ev) = ceq.events.get(ev_type as usize) else {
        return Err(KError::BadAddress);
    };
    ev.blob_data.store(msg.ev_arg3, Ordering::Release);
    match ceq.operation() {
        Ok(CeqOperation::Or) => {
            ev.coalesce.fetch_or(msg.ev_arg2 as u64, Ordering::AcqRel);
        }
        Ok(CeqOperation::Add) => {
            ev.coalesce.fetch_add(msg.ev_arg2 as u64, Ordering::AcqRel);
        }
        Err(_) => {
            warn!(
                "pid {}: ceq has bad operation {}, dropping event {}",
                p.pid,
                ceq.operation.load(Ordering::Relaxed),
                ev_type
            );
            return Err(KError::InvalidCeqOperation);
        }
    }

    // Already in the ring (or about to be found by recovery).
    if ev.idx_posted.swap(true, Ordering::AcqRel) {
        trace!("pid {}: ceq event {} coalesced", p.pid, ev_type);
        return Ok(());
    }

    let ring_sz = ceq.ring_sz.load(Ordering::Acquire);
    let mut tries = 0;
    let my_idx = loop {
        let prod = ceq.prod_idx.load(Ordering::Acquire);
        let cons_pub = ceq.cons_pub_idx.load(Ordering::Acquire);
        if ceq_ring_full(ring_sz, prod, cons_pub) || tries >= ring_tries {
            ceq.ring_overflowed.store(true, Ordering::SeqCst);
            trace!("pid {}: ceq ring overflowed on event {}", p.pid, ev_type);
            return Err(KError::RingOverflow);
        }
        if ceq
            .prod_idx
            .compare_exchange(prod, prod.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            break prod;
        }
        tries += 1;
    };

    let Some(slot) = ceq.ring_slot(my_idx) else {
        warn!(
            "pid {}: ceq ring size {} doesn't match the ring, dropping event {}",
            p.pid, ring_sz, ev_type
        );
        return Err(KError::BadAddress);
    };
    slot.store(ev_type as i32, Ordering::Release);
    trace!("pid {}: ceq event {} at ring index {}", p.pid, ev_type, my_idx);
    Ok(())
}

/// Dump the state of `ceq`.
pub fn ceq_dumper(ceq: &Ceq, p: &Process) {
    info!(
        "pid {} ceq: nr_events {}, max event {}, ring size {}, prod {}, cons pub {} pvt {}, overflowed {}, recovering {} (at {})",
        p.pid,
        ceq.nr_events.load(Ordering::Relaxed),
        ceq.max_event_ever.load(Ordering::Relaxed),
        ceq.ring_sz.load(Ordering::Relaxed),
        ceq.prod_idx.load(Ordering::Relaxed),
        ceq.cons_pub_idx.load(Ordering::Relaxed),
        ceq.cons_pvt_idx.load(Ordering::Relaxed),
        ceq.ring_overflowed.load(Ordering::Relaxed),
        ceq.overflow_recovery.load(Ordering::Relaxed),
        ceq.last_recovered.load(Ordering::Relaxed),
    );
    for idx in 0..=ceq.max_event_ever.load(Ordering::Relaxed) as usize {
        if let Some(ev) = ceq.events.get_if_populated(idx) {
            if ev.idx_posted.load(Ordering::Relaxed) {
                info!(
                    "    event {}: coalesce {:#x}, blob {:#x}",
                    idx,
                    ev.coalesce.load(Ordering::Relaxed),
                    ev.blob_data.load(Ordering::Relaxed)
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cmdline::CommandLineArguments;
    use crate::Kernel;

    fn proc() -> (Kernel, alloc::sync::Arc<Process>) {
        let _r = env_logger::try_init();
        let k = Kernel::new(CommandLineArguments::default()).unwrap();
        let p = k.proc_create(0).unwrap();
        (k, p)
    }

    #[test]
    fn coalesce_or() {
        let (_k, p) = proc();
        let ceq = Ceq::new(CeqOperation::Or, 128, 8).unwrap();
        for bit in 0..4 {
            send_ceq_msg(&ceq, &p, &EventMsg::with_args(70, 1 << bit, 0xb10b), 10).unwrap();
        }
        assert_eq!(ceq.prod_idx.load(Ordering::Relaxed), 1);
        assert_eq!(ceq.ring[0].load(Ordering::Relaxed), 70);
        let ev = ceq.events.get_if_populated(70).unwrap();
        assert_eq!(ev.coalesce.load(Ordering::Relaxed), 0b1111);
        assert_eq!(ev.blob_data.load(Ordering::Relaxed), 0xb10b);
        assert_eq!(ceq.max_event_ever.load(Ordering::Relaxed), 70);
        // Only the chunk of event 70 was touched.
        assert_eq!(ceq.events.nr_populated_chunks(), 1);
        ceq_dumper(&ceq, &p);
    }

    #[test]
    fn coalesce_add() {
        let (_k, p) = proc();
        let ceq = Ceq::new(CeqOperation::Add, 4, 2).unwrap();
        send_ceq_msg(&ceq, &p, &EventMsg::with_args(1, 5, 0), 10).unwrap();
        send_ceq_msg(&ceq, &p, &EventMsg::with_args(1, 7, 0), 10).unwrap();
        let ev = ceq.events.get_if_populated(1).unwrap();
        assert_eq!(ev.coalesce.load(Ordering::Relaxed), 12);
    }

    #[test]
    fn too_small() {
        let (_k, p) = proc();
        let ceq = Ceq::new(CeqOperation::Or, 4, 2).unwrap();
        assert_eq!(
            send_ceq_msg(&ceq, &p, &EventMsg::new(4), 10),
            Err(KError::CeqTooSmall { ev_type: 4 })
        );
        // A process claiming a larger array than it has is caught too.
        ceq.nr_events.store(1000, Ordering::Relaxed);
        assert_eq!(
            send_ceq_msg(&ceq, &p, &EventMsg::new(64), 10),
            Err(KError::CeqTooSmall { ev_type: 64 })
        );
    }

    #[test]
    fn ring_overflow_sets_flag() {
        let (_k, p) = proc();
        let ceq = Ceq::new(CeqOperation::Or, 8, 1).unwrap();
        send_ceq_msg(&ceq, &p, &EventMsg::with_args(2, 1, 0), 10).unwrap();
        assert_eq!(
            send_ceq_msg(&ceq, &p, &EventMsg::with_args(3, 1, 0), 10),
            Err(KError::RingOverflow)
        );
        assert!(ceq.ring_overflowed.load(Ordering::Relaxed));
        // Still marked posted: recovery will find it.
        assert!(ceq.events.get_if_populated(3).unwrap().idx_posted.load(Ordering::Relaxed));
        // Coalescing into an overflowed event doesn't touch the ring.
        send_ceq_msg(&ceq, &p, &EventMsg::with_args(3, 2, 0), 10).unwrap();
        assert_eq!(ceq.prod_idx.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn bad_operation_and_ring_size() {
        let (_k, p) = proc();
        let ceq = Ceq::new(CeqOperation::Or, 8, 4).unwrap();
        ceq.operation.store(9, Ordering::Relaxed);
        assert_eq!(
            send_ceq_msg(&ceq, &p, &EventMsg::new(1), 10),
            Err(KError::InvalidCeqOperation)
        );

        let ceq = Ceq::new(CeqOperation::Or, 8, 4).unwrap();
        ceq.ring_sz.store(64, Ordering::Relaxed);
        ceq.prod_idx.store(10, Ordering::Relaxed);
        ceq.cons_pub_idx.store(10, Ordering::Relaxed);
        assert_eq!(
            send_ceq_msg(&ceq, &p, &EventMsg::new(1), 10),
            Err(KError::BadAddress)
        );
    }
}
