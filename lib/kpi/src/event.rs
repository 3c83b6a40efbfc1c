// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Event messages, mailboxes and event queues.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::bcq::Bcq;
use crate::ceq::{Ceq, CeqError, CeqOperation};
use crate::ucq::Ucq;
use crate::VcoreId;

/// No event, never sent.
pub const EV_NONE: u16 = 0;
/// The kernel is about to take one of our cores.
pub const EV_PREEMPT_PENDING: u16 = 1;
/// A vcore was preempted (`ev_arg2` is the vcoreid).
pub const EV_VCORE_PREEMPT: u16 = 2;
/// IPI from another user-level core.
pub const EV_USER_IPI: u16 = 3;
pub const EV_PAGE_FAULT: u16 = 4;
pub const EV_ALARM: u16 = 5;
/// Indirection: a message has been posted to another mailbox
/// (`ev_arg2` is the type of the original message).
pub const EV_EVENT: u16 = 6;
pub const EV_SYSCALL: u16 = 7;
pub const EV_CHECK_MSGS: u16 = 8;
/// Number of kernel event types.
pub const MAX_NR_EVENT: usize = 9;

/// Capacity of a BCQ event mailbox.
pub const NR_BCQ_EVENTS: usize = 16;

static_assertions::const_assert!(NR_BCQ_EVENTS.is_power_of_two());
static_assertions::const_assert!((EV_CHECK_MSGS as usize) < MAX_NR_EVENT);

/// The payload the kernel delivers into user memory.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct EventMsg {
    pub ev_type: u16,
    pub ev_arg1: u16,
    pub ev_arg2: u32,
    /// Pointer-sized blob.
    pub ev_arg3: u64,
    pub ev_arg4: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<EventMsg>(), 24);

impl EventMsg {
    pub fn new(ev_type: u16) -> Self {
        EventMsg {
            ev_type,
            ..Default::default()
        }
    }

    pub fn with_args(ev_type: u16, ev_arg2: u32, ev_arg3: u64) -> Self {
        EventMsg {
            ev_type,
            ev_arg2,
            ev_arg3,
            ..Default::default()
        }
    }
}

bitflags! {
    /// Delivery options of an event queue.
    pub struct EventFlags: u32 {
        /// Notify (IPI) the target vcore after posting.
        const IPI = 0x01;
        /// Post to the mailbox of the vcore the kernel suggests.
        const VCORE_APPRO = 0x02;
        /// Spread messages across vcores, one after the other.
        const ROUNDROBIN = 0x04;
    }
}

/// BCQ mailbox: a bounded ring plus a count of messages it had to drop.
#[derive(Debug, Default)]
pub struct BcqMbox {
    pub bcq: Bcq<EventMsg, NR_BCQ_EVENTS>,
    pub ev_overflows: AtomicU32,
}

/// Where events get posted.
#[derive(Debug)]
pub enum EventMbox {
    Ucq(Ucq),
    Bcq(BcqMbox),
    Ceq(Ceq),
}

impl EventMbox {
    /// An unbounded mailbox backed by a pool of `nr_pages` pages.
    pub fn new_ucq(nr_pages: usize) -> Self {
        EventMbox::Ucq(Ucq::new(nr_pages))
    }

    pub fn new_bcq() -> Self {
        EventMbox::Bcq(Default::default())
    }

    pub fn new_ceq(op: CeqOperation, nr_events: u32, ring_sz: u32) -> Result<Self, CeqError> {
        Ok(EventMbox::Ceq(Ceq::new(op, nr_events, ring_sz)?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventMbox::Ucq(_) => "ucq",
            EventMbox::Bcq(_) => "bcq",
            EventMbox::Ceq(_) => "ceq",
        }
    }
}

/// Describes how a class of events reaches a process.
#[derive(Debug)]
pub struct EventQueue {
    /// Target mailbox; `None` posts to the chosen vcore's own mailbox.
    pub ev_mbox: Option<Arc<EventMbox>>,
    pub ev_flags: EventFlags,
    /// Vcore to notify (and the round-robin cursor).
    pub ev_vcore: AtomicUsize,
}

impl EventQueue {
    pub fn new(ev_mbox: Option<Arc<EventMbox>>, ev_flags: EventFlags, ev_vcore: VcoreId) -> Self {
        EventQueue {
            ev_mbox,
            ev_flags,
            ev_vcore: AtomicUsize::new(ev_vcore),
        }
    }

    pub fn vcore(&self) -> VcoreId {
        self.ev_vcore.load(Ordering::Relaxed)
    }
}
