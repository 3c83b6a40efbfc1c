// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! User-level event handling: draining mailboxes, dispatching messages to
//! handlers and telling the kernel where we want its events.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use log::{trace, warn};

use kpi::event::{EventFlags, EventMbox, EventMsg, EventQueue, MAX_NR_EVENT};
use kpi::procdata::ProcData;
use kpi::VcoreId;

use crate::ceq::{ceq_is_empty, get_ceq_msg};
use crate::ucq::{get_ucq_msg, ucq_is_empty};

/// Called for every message of the event type it is registered for.
pub type EventHandler = Arc<dyn Fn(&EventMsg) + Send + Sync>;

/// Dequeue one message from any kind of mailbox.
pub fn extract_one_mbox_msg(mbox: &EventMbox) -> Option<EventMsg> {
    match mbox {
        EventMbox::Ucq(ucq) => get_ucq_msg(ucq),
        EventMbox::Bcq(bcq) => bcq.bcq.dequeue().ok(),
        EventMbox::Ceq(ceq) => get_ceq_msg(ceq),
    }
}

/// There is something for us in the mailbox.
pub fn event_activity(mbox: &EventMbox) -> bool {
    match mbox {
        EventMbox::Ucq(ucq) => !ucq_is_empty(ucq),
        EventMbox::Bcq(bcq) => {
            !bcq.bcq.is_empty() || bcq.ev_overflows.load(Ordering::Relaxed) > 0
        }
        EventMbox::Ceq(ceq) => !ceq_is_empty(ceq),
    }
}

/// Reset the count of messages a BCQ mailbox dropped; returns the old count.
pub fn event_clear_overflows(mbox: &EventMbox) -> u32 {
    match mbox {
        EventMbox::Bcq(bcq) => bcq.ev_overflows.swap(0, Ordering::AcqRel),
        _ => 0,
    }
}

pub struct EventHandlers {
    handlers: [spin::RwLock<Option<EventHandler>>; MAX_NR_EVENT],
}

impl Default for EventHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        EventHandlers {
            handlers: core::array::from_fn(|_| spin::RwLock::new(None)),
        }
    }

    /// Install `handler` for `ev_type`, replacing the previous one.
    pub fn register(&self, ev_type: u16, handler: EventHandler) -> Option<EventHandler> {
        match self.handlers.get(ev_type as usize) {
            Some(h) => h.write().replace(handler),
            None => {
                warn!("Can't register handler for unknown event type {}", ev_type);
                None
            }
        }
    }

    pub fn deregister(&self, ev_type: u16) -> Option<EventHandler> {
        self.handlers.get(ev_type as usize)?.write().take()
    }

    fn dispatch(&self, msg: &EventMsg) {
        let handler = self
            .handlers
            .get(msg.ev_type as usize)
            .and_then(|h| h.read().clone());
        match handler {
            Some(h) => h(msg),
            None => trace!("No handler for event type {}", msg.ev_type),
        }
    }

    /// Drain `mbox`, running the handler of every message. Returns how many
    /// messages were handled.
    pub fn handle_mbox(&self, mbox: &EventMbox) -> usize {
        let mut handled = 0;
        while let Some(msg) = extract_one_mbox_msg(mbox) {
            self.dispatch(&msg);
            handled += 1;
        }
        let dropped = event_clear_overflows(mbox);
        if dropped > 0 {
            warn!("{} mbox dropped {} events", mbox.kind(), dropped);
        }
        handled
    }

    /// Process everything the kernel left for `vcoreid`.
    pub fn handle_events(&self, procdata: &ProcData, vcoreid: VcoreId) -> usize {
        let Some(vcpd) = procdata.vcpd(vcoreid) else {
            warn!("handle_events for invalid vcore {}", vcoreid);
            return 0;
        };
        // Clear before draining: anything posted from now on sets it again.
        vcpd.notif_pending.store(false, Ordering::SeqCst);
        self.handle_mbox(&vcpd.ev_mbox)
    }
}

/// Send kernel events of type `ev_type` to `ev_q`. Returns the queue that
/// was registered before.
pub fn register_kevent_q(
    procdata: &ProcData,
    ev_q: Arc<EventQueue>,
    ev_type: u16,
) -> Option<Arc<EventQueue>> {
    match procdata.kernel_evts.get(ev_type as usize) {
        Some(slot) => slot.lock().replace(ev_q),
        None => {
            warn!("Can't register for unknown kernel event {}", ev_type);
            None
        }
    }
}

/// Stop receiving kernel events of type `ev_type`.
pub fn clear_kevent_q(procdata: &ProcData, ev_type: u16) -> Option<Arc<EventQueue>> {
    procdata.kernel_evts.get(ev_type as usize)?.lock().take()
}

/// Have kernel events of type `ev_type` delivered to the mailbox of
/// `vcoreid` with `flags`.
pub fn enable_kevent(
    procdata: &ProcData,
    ev_type: u16,
    vcoreid: VcoreId,
    flags: EventFlags,
) -> Arc<EventQueue> {
    let ev_q = Arc::new(EventQueue::new(None, flags, vcoreid));
    register_kevent_q(procdata, ev_q.clone(), ev_type);
    ev_q
}

pub fn disable_kevent(procdata: &ProcData, ev_type: u16) -> Option<Arc<EventQueue>> {
    clear_kevent_q(procdata, ev_type)
}

/// Turn off notification IPIs for `vcoreid`.
pub fn disable_notifs(procdata: &ProcData, vcoreid: VcoreId) {
    if let Some(vcpd) = procdata.vcpd(vcoreid) {
        vcpd.notif_disabled.store(true, Ordering::SeqCst);
    }
}

/// Turn notification IPIs back on. Returns true if something was posted in
/// the meantime (we won't get an IPI for it, so the caller has to handle
/// events).
pub fn enable_notifs(procdata: &ProcData, vcoreid: VcoreId) -> bool {
    match procdata.vcpd(vcoreid) {
        Some(vcpd) => {
            vcpd.notif_disabled.store(false, Ordering::SeqCst);
            vcpd.notif_pending.load(Ordering::SeqCst)
        }
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::sync::atomic::AtomicUsize;
    use kpi::event::{EV_ALARM, EV_USER_IPI};

    #[test]
    fn dispatch_bcq_mbox() {
        let _r = env_logger::try_init();
        let handlers = EventHandlers::new();
        let alarms = Arc::new(AtomicUsize::new(0));
        let a = alarms.clone();
        handlers.register(
            EV_ALARM,
            Arc::new(move |msg: &EventMsg| {
                a.fetch_add(msg.ev_arg2 as usize, Ordering::Relaxed);
            }),
        );

        let mbox = EventMbox::new_bcq();
        if let EventMbox::Bcq(b) = &mbox {
            b.bcq.enqueue(&EventMsg::with_args(EV_ALARM, 2, 0), 4).unwrap();
            b.bcq.enqueue(&EventMsg::with_args(EV_USER_IPI, 1, 0), 4).unwrap();
            b.bcq.enqueue(&EventMsg::with_args(EV_ALARM, 3, 0), 4).unwrap();
            b.ev_overflows.store(2, Ordering::Relaxed);
        }
        assert!(event_activity(&mbox));
        assert_eq!(handlers.handle_mbox(&mbox), 3);
        assert_eq!(alarms.load(Ordering::Relaxed), 5);
        assert!(!event_activity(&mbox));
        assert_eq!(event_clear_overflows(&mbox), 0);
    }

    #[test]
    fn unknown_types_are_refused() {
        let handlers = EventHandlers::new();
        assert!(handlers
            .register(MAX_NR_EVENT as u16, Arc::new(|_m: &EventMsg| {}))
            .is_none());
        assert!(handlers.deregister(MAX_NR_EVENT as u16).is_none());
    }

    #[test]
    fn kevent_registration() {
        let pd = ProcData::new(2, 2);
        let q = enable_kevent(&pd, EV_ALARM, 1, EventFlags::IPI);
        assert!(Arc::ptr_eq(&pd.kernel_evq(EV_ALARM).unwrap(), &q));
        assert_eq!(q.vcore(), 1);
        assert!(disable_kevent(&pd, EV_ALARM).is_some());
        assert!(pd.kernel_evq(EV_ALARM).is_none());
        assert!(register_kevent_q(&pd, q, MAX_NR_EVENT as u16).is_none());
    }

    #[test]
    fn notif_toggle() {
        let pd = ProcData::new(1, 2);
        disable_notifs(&pd, 0);
        assert!(pd.vcpd(0).unwrap().notif_disabled.load(Ordering::Relaxed));
        pd.vcpd(0).unwrap().notif_pending.store(true, Ordering::Relaxed);
        assert!(enable_notifs(&pd, 0));
        assert!(!enable_notifs(&pd, 5));

        let handlers = EventHandlers::new();
        assert_eq!(handlers.handle_events(&pd, 0), 0);
        assert!(!pd.notif_pending(0));
    }
}
