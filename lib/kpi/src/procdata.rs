// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-process data shared read-write between kernel and user-space.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::event::{EventMbox, EventQueue, MAX_NR_EVENT};
use crate::VcoreId;

/// Pages backing each vcore's default mailbox.
pub const VCPD_UCQ_PAGES: usize = 4;

/// Vcore preempt data: what a vcore keeps in procdata.
#[derive(Debug)]
pub struct VcorePreemptData {
    /// The vcore's own mailbox.
    pub ev_mbox: Arc<EventMbox>,
    /// Set by the kernel when it posted something for this vcore.
    pub notif_pending: AtomicBool,
    /// The vcore doesn't want notification IPIs right now.
    pub notif_disabled: AtomicBool,
    /// Deadline of a pending preemption (0 for none).
    pub preempt_pending: AtomicU64,
    /// The vcore lost its core involuntarily.
    pub preempted: AtomicBool,
}

impl VcorePreemptData {
    fn new(ucq_pages: usize) -> Self {
        VcorePreemptData {
            ev_mbox: Arc::new(EventMbox::new_ucq(ucq_pages)),
            notif_pending: AtomicBool::new(false),
            notif_disabled: AtomicBool::new(false),
            preempt_pending: AtomicU64::new(0),
            preempted: AtomicBool::new(false),
        }
    }
}

#[derive(Debug)]
pub struct ProcData {
    pub vcore_preempt_data: Box<[VcorePreemptData]>,
    /// Where the kernel sends events of each type (`None` drops them).
    pub kernel_evts: [spin::Mutex<Option<Arc<EventQueue>>>; MAX_NR_EVENT],
}

impl ProcData {
    pub fn new(nr_vcores: usize, ucq_pages: usize) -> Self {
        let vcpd: Vec<VcorePreemptData> = (0..nr_vcores)
            .map(|_| VcorePreemptData::new(ucq_pages))
            .collect();
        ProcData {
            vcore_preempt_data: vcpd.into_boxed_slice(),
            kernel_evts: core::array::from_fn(|_| spin::Mutex::new(None)),
        }
    }

    pub fn vcpd(&self, vcoreid: VcoreId) -> Option<&VcorePreemptData> {
        self.vcore_preempt_data.get(vcoreid)
    }

    pub fn nr_vcores(&self) -> usize {
        self.vcore_preempt_data.len()
    }

    /// The event queue registered for `ev_type`.
    pub fn kernel_evq(&self, ev_type: u16) -> Option<Arc<EventQueue>> {
        self.kernel_evts.get(ev_type as usize)?.lock().clone()
    }

    pub fn notif_pending(&self, vcoreid: VcoreId) -> bool {
        self.vcpd(vcoreid)
            .map(|v| v.notif_pending.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}
