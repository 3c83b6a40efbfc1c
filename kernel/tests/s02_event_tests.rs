// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Kernel producers and user consumers on the same event queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use kpi::ceq::{Ceq, CeqOperation};
use kpi::event::{
    EventFlags, EventMbox, EventMsg, EventQueue, EV_ALARM, EV_EVENT, EV_USER_IPI, NR_BCQ_EVENTS,
};
use kpi::ucq::{Ucq, NR_MSG_PER_PAGE};
use lineup::ceq::{ceq_is_empty, get_ceq_msg};
use lineup::event::{event_activity, register_kevent_q, EventHandlers};
use lineup::ucq::{get_ucq_msg, ucq_is_empty};
use mcpk::ceq::send_ceq_msg;
use mcpk::cmdline::CommandLineArguments;
use mcpk::error::KError;
use mcpk::process::Process;
use mcpk::ucq::send_ucq_msg;
use mcpk::Kernel;

fn boot() -> (Arc<Kernel>, Arc<Process>) {
    let _r = env_logger::try_init();
    let k = Arc::new(Kernel::new(CommandLineArguments::default()).unwrap());
    let p = k.proc_create(0).unwrap();
    (k, p)
}

#[test]
fn s02_ucq_fifo_over_pages() {
    let (_k, p) = boot();
    let ucq = Ucq::new(4);
    let n = 3 * NR_MSG_PER_PAGE as u32 + 5;
    for i in 0..n {
        send_ucq_msg(&ucq, &p, &EventMsg::with_args(EV_ALARM, i, 0), 1000).unwrap();
    }
    assert_eq!(ucq.pool.nr_mapped(), 4);
    assert_eq!(ucq.nr_extra_pgs.load(Ordering::Relaxed), 2);

    for i in 0..n {
        assert_eq!(get_ucq_msg(&ucq).map(|m| m.ev_arg2), Some(i));
    }
    assert!(ucq_is_empty(&ucq));
    assert_eq!(get_ucq_msg(&ucq), None);
    // Drained pages are given back, except for one spare.
    assert_eq!(ucq.pool.nr_mapped(), 2);
    assert_eq!(ucq.nr_extra_pgs.load(Ordering::Relaxed), 0);
}

/// A consumer that keeps up means the queue never maps more pages.
#[test]
fn s02_ucq_steady_state_recycles_pages() {
    let (_k, p) = boot();
    let ucq = Ucq::new(4);
    for i in 0..10 * NR_MSG_PER_PAGE as u32 {
        send_ucq_msg(&ucq, &p, &EventMsg::with_args(EV_ALARM, i, 0), 1000).unwrap();
        assert_eq!(get_ucq_msg(&ucq).map(|m| m.ev_arg2), Some(i));
    }
    assert_eq!(ucq.pool.nr_maps(), 2);
    assert_eq!(ucq.nr_extra_pgs.load(Ordering::Relaxed), 0);
}

/// Running out of pages drops the event but leaves the queue drainable.
#[test]
fn s02_ucq_out_of_pages_still_drains() {
    let (_k, p) = boot();
    let ucq = Arc::new(Ucq::new(2));
    let n = 2 * NR_MSG_PER_PAGE as u32;
    for i in 0..n {
        send_ucq_msg(&ucq, &p, &EventMsg::with_args(EV_ALARM, i, 0), 10).unwrap();
    }
    assert_eq!(
        send_ucq_msg(&ucq, &p, &EventMsg::with_args(EV_ALARM, n, 0), 10),
        Err(KError::OutOfMemory)
    );

    let consumer = ucq.clone();
    let got = thread::spawn(move || {
        let mut got = Vec::new();
        while let Some(m) = get_ucq_msg(&consumer) {
            got.push(m.ev_arg2);
        }
        got
    })
    .join()
    .unwrap();
    assert_eq!(got, (0..n).collect::<Vec<_>>());
    assert!(ucq_is_empty(&ucq));

    // The drained page is the spare now, so the queue can grow again.
    send_ucq_msg(&ucq, &p, &EventMsg::with_args(EV_ALARM, n + 1, 0), 10).unwrap();
    assert_eq!(get_ucq_msg(&ucq).map(|m| m.ev_arg2), Some(n + 1));
    assert_eq!(get_ucq_msg(&ucq), None);
    assert_eq!(ucq.pool.nr_mapped(), 2);
}

#[test]
fn s02_ucq_concurrent() {
    const PRODUCERS: u32 = 4;
    const CONSUMERS: usize = 2;
    const PER_PRODUCER: u64 = 2000;
    let total = PRODUCERS as usize * PER_PRODUCER as usize;

    let (_k, p) = boot();
    let ucq = Arc::new(Ucq::new(128));
    let consumed = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let ucq = ucq.clone();
            let p = p.clone();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    send_ucq_msg(&ucq, &p, &EventMsg::with_args(EV_ALARM, id, seq), 1000)
                        .unwrap();
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let ucq = ucq.clone();
            let consumed = consumed.clone();
            thread::spawn(move || {
                let mut got = Vec::new();
                while consumed.load(Ordering::Acquire) < total {
                    match get_ucq_msg(&ucq) {
                        Some(m) => {
                            got.push((m.ev_arg2, m.ev_arg3));
                            consumed.fetch_add(1, Ordering::AcqRel);
                        }
                        None => thread::yield_now(),
                    }
                }
                got
            })
        })
        .collect();

    for t in producers {
        t.join().unwrap();
    }
    let mut all = Vec::with_capacity(total);
    for t in consumers {
        let got = t.join().unwrap();
        // Every consumer sees a producer's messages in order.
        let mut last: HashMap<u32, u64> = HashMap::new();
        for &(id, seq) in got.iter() {
            if let Some(prev) = last.insert(id, seq) {
                assert!(prev < seq, "producer {}: {} after {}", id, seq, prev);
            }
        }
        all.extend(got);
    }

    all.sort_unstable();
    let expected: Vec<(u32, u64)> = (0..PRODUCERS)
        .flat_map(|id| (0..PER_PRODUCER).map(move |seq| (id, seq)))
        .collect();
    assert_eq!(all, expected);
    assert!(ucq_is_empty(&ucq));
}

#[test]
fn s02_ceq_coalesces_until_consumed() {
    let (_k, p) = boot();
    let ceq = Ceq::new(CeqOperation::Or, 32, 8).unwrap();
    send_ceq_msg(&ceq, &p, &EventMsg::with_args(7, 0b001, 1), 10).unwrap();
    send_ceq_msg(&ceq, &p, &EventMsg::with_args(3, 0b100, 2), 10).unwrap();
    send_ceq_msg(&ceq, &p, &EventMsg::with_args(7, 0b010, 3), 10).unwrap();

    let m = get_ceq_msg(&ceq).unwrap();
    assert_eq!((m.ev_type, m.ev_arg2, m.ev_arg3), (7, 0b011, 3));
    // Posted again after the extraction: goes back into the ring.
    send_ceq_msg(&ceq, &p, &EventMsg::with_args(7, 0b100, 4), 10).unwrap();
    let m = get_ceq_msg(&ceq).unwrap();
    assert_eq!((m.ev_type, m.ev_arg2), (3, 0b100));
    let m = get_ceq_msg(&ceq).unwrap();
    assert_eq!((m.ev_type, m.ev_arg2, m.ev_arg3), (7, 0b100, 4));
    assert_eq!(get_ceq_msg(&ceq), None);
    assert!(ceq_is_empty(&ceq));
}

#[test]
fn s02_ceq_overflow_recovery() {
    let (_k, p) = boot();
    let ceq = Ceq::new(CeqOperation::Or, 16, 1).unwrap();
    send_ceq_msg(&ceq, &p, &EventMsg::with_args(2, 1, 0), 10).unwrap();
    assert_eq!(
        send_ceq_msg(&ceq, &p, &EventMsg::with_args(5, 1, 0), 10),
        Err(KError::RingOverflow)
    );
    assert_eq!(
        send_ceq_msg(&ceq, &p, &EventMsg::with_args(7, 1, 0), 10),
        Err(KError::RingOverflow)
    );
    assert!(!ceq_is_empty(&ceq));

    let types: Vec<u16> = std::iter::from_fn(|| get_ceq_msg(&ceq))
        .map(|m| m.ev_type)
        .collect();
    assert_eq!(types, [2, 5, 7]);
    assert!(ceq_is_empty(&ceq));

    // The ring works again once recovery is done.
    send_ceq_msg(&ceq, &p, &EventMsg::with_args(5, 2, 0), 10).unwrap();
    assert!(!ceq.ring_overflowed.load(Ordering::Relaxed));
    assert_eq!(get_ceq_msg(&ceq).map(|m| (m.ev_type, m.ev_arg2)), Some((5, 2)));
}

/// Concurrent additions are never lost, however they coalesce.
#[test]
fn s02_ceq_concurrent_add() {
    const THREADS: usize = 4;
    const POSTS: usize = 1000;

    let (_k, p) = boot();
    let ceq = Arc::new(Ceq::new(CeqOperation::Add, 8, 8).unwrap());
    let done = Arc::new(AtomicBool::new(false));

    let consumer = {
        let ceq = ceq.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut sum = 0u64;
            loop {
                let finished = done.load(Ordering::Acquire);
                while let Some(m) = get_ceq_msg(&ceq) {
                    assert_eq!(m.ev_type, 3);
                    sum += m.ev_arg2 as u64;
                }
                if finished {
                    break sum;
                }
                thread::yield_now();
            }
        })
    };

    let producers: Vec<_> = (0..THREADS)
        .map(|_| {
            let ceq = ceq.clone();
            let p = p.clone();
            thread::spawn(move || {
                for _ in 0..POSTS {
                    // An overflowed post is still found by recovery.
                    match send_ceq_msg(&ceq, &p, &EventMsg::with_args(3, 1, 0), 10) {
                        Ok(()) | Err(KError::RingOverflow) => {}
                        Err(e) => panic!("ceq post failed: {}", e),
                    }
                }
            })
        })
        .collect();
    for t in producers {
        t.join().unwrap();
    }
    done.store(true, Ordering::Release);
    assert_eq!(consumer.join().unwrap(), (THREADS * POSTS) as u64);
}

/// Kernel events into a BCQ mailbox, with the vcore told where to look.
#[test]
fn s02_kernel_events_through_handlers() {
    let (k, p) = boot();
    let bcq = Arc::new(EventMbox::new_bcq());
    let ev_q = Arc::new(EventQueue::new(Some(bcq.clone()), EventFlags::IPI, 1));
    assert!(register_kevent_q(&p.procdata, ev_q, EV_ALARM).is_none());

    for i in 0..3 {
        k.send_kernel_event(&p, &EventMsg::with_args(EV_ALARM, i, 0), 0)
            .unwrap();
    }
    assert!(p.procdata.notif_pending(1));
    assert!(event_activity(&bcq));

    let alarms = Arc::new(AtomicU64::new(0));
    let indirections = Arc::new(Mutex::new(Vec::new()));
    let handlers = EventHandlers::new();
    let ind = indirections.clone();
    let mbox = bcq.clone();
    let h = Arc::new(EventHandlers::new());
    let inner = h.clone();
    handlers.register(
        EV_EVENT,
        Arc::new(move |m: &EventMsg| {
            ind.lock().unwrap().push(m.ev_arg2 as u16);
            inner.handle_mbox(&mbox);
        }),
    );
    // The first indirection drains the whole mailbox.
    let a = alarms.clone();
    h.register(
        EV_ALARM,
        Arc::new(move |m: &EventMsg| {
            a.fetch_add(1 << m.ev_arg2, Ordering::Relaxed);
        }),
    );

    assert_eq!(handlers.handle_events(&p.procdata, 1), 3);
    assert!(!p.procdata.notif_pending(1));
    assert_eq!(*indirections.lock().unwrap(), [EV_ALARM; 3]);
    assert_eq!(alarms.load(Ordering::Relaxed), 0b111);
    assert!(!event_activity(&bcq));
}

#[test]
fn s02_bcq_mailbox_overflow() {
    let (k, p) = boot();
    let bcq = Arc::new(EventMbox::new_bcq());
    let ev_q = Arc::new(EventQueue::new(Some(bcq.clone()), EventFlags::empty(), 0));
    register_kevent_q(&p.procdata, ev_q, EV_USER_IPI);

    let extra = 4;
    let mut dropped = 0;
    for _ in 0..NR_BCQ_EVENTS + extra {
        if let Err(e) = k.send_kernel_event(&p, &EventMsg::new(EV_USER_IPI), 0) {
            assert_eq!(e, KError::RingOverflow);
            dropped += 1;
        }
    }
    assert_eq!(dropped, extra);

    let handlers = EventHandlers::new();
    assert_eq!(handlers.handle_mbox(&bcq), NR_BCQ_EVENTS);
    assert!(!event_activity(&bcq));
    assert!(!p.procdata.notif_pending(0));
}
