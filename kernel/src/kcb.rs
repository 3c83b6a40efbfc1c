// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! KCB is the local kernel control that stores all core local state.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use crossbeam_utils::CachePadded;

use kpi::{CoreId, Pid, VcoreId};

use crate::arch::{disable_irqsave, IrqGuard};
use crate::kmsg::{KernelMessage, MsgClass};
use crate::process::Process;

/// How many executed kernel messages a core remembers.
pub const KMSG_TRACE_LEN: usize = 32;

/// What a core is running.
pub struct CoreOwner {
    /// Holds one reference of the process.
    pub proc: Arc<Process>,
    pub vcoreid: VcoreId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KmsgTraceEntry {
    pub src: CoreId,
    pub cmd: &'static str,
}

/// The Kernel Control Block for a given core.
/// It contains all core-local state of the kernel.
pub struct Kcb {
    pub id: CoreId,

    /// Messages run from the IPI handler.
    immed_amsgs: spin::Mutex<VecDeque<KernelMessage>>,
    /// Messages run once the core reaches a safe point.
    routine_amsgs: spin::Mutex<VecDeque<KernelMessage>>,
    nr_immed: AtomicUsize,
    nr_routine: AtomicUsize,

    /// Simulated interrupt flag of the core.
    pub irqs_enabled: AtomicBool,

    pub owner: spin::Mutex<Option<CoreOwner>>,

    /// Notifications delivered to whatever ran on this core.
    pub notifications: AtomicUsize,

    trace: spin::Mutex<ArrayVec<KmsgTraceEntry, KMSG_TRACE_LEN>>,
    /// Messages executed since boot.
    executed: AtomicUsize,
}

impl Kcb {
    pub fn new(id: CoreId) -> Kcb {
        Kcb {
            id,
            immed_amsgs: spin::Mutex::new(VecDeque::new()),
            routine_amsgs: spin::Mutex::new(VecDeque::new()),
            nr_immed: AtomicUsize::new(0),
            nr_routine: AtomicUsize::new(0),
            irqs_enabled: AtomicBool::new(true),
            owner: spin::Mutex::new(None),
            notifications: AtomicUsize::new(0),
            trace: spin::Mutex::new(ArrayVec::new()),
            executed: AtomicUsize::new(0),
        }
    }

    fn list(&self, class: MsgClass) -> (&spin::Mutex<VecDeque<KernelMessage>>, &AtomicUsize) {
        match class {
            MsgClass::Immediate => (&self.immed_amsgs, &self.nr_immed),
            MsgClass::Routine => (&self.routine_amsgs, &self.nr_routine),
        }
    }

    pub(crate) fn enqueue(&self, msg: KernelMessage) {
        let (list, count) = self.list(msg.class);
        let mut list = list.lock();
        list.push_back(msg);
        count.store(list.len(), Ordering::Release);
    }

    pub(crate) fn dequeue(&self, class: MsgClass) -> Option<KernelMessage> {
        let (list, count) = self.list(class);
        if count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut list = list.lock();
        let msg = list.pop_front();
        count.store(list.len(), Ordering::Release);
        msg
    }

    /// Messages waiting in `class` (without taking the lock).
    pub fn pending(&self, class: MsgClass) -> usize {
        self.list(class).1.load(Ordering::Acquire)
    }

    /// Call `f` on every message waiting in `class`.
    pub(crate) fn for_each_pending<F: FnMut(&KernelMessage)>(&self, class: MsgClass, f: F) {
        self.list(class).0.lock().iter().for_each(f);
    }

    pub fn irqsave(&self) -> IrqGuard<'_> {
        disable_irqsave(&self.irqs_enabled)
    }

    pub fn irqs_enabled(&self) -> bool {
        self.irqs_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn record(&self, src: CoreId, cmd: &'static str) {
        let mut trace = self.trace.lock();
        if trace.is_full() {
            trace.remove(0);
        }
        trace.push(KmsgTraceEntry { src, cmd });
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    /// The last executed messages, oldest first.
    pub fn trace(&self) -> Vec<KmsgTraceEntry> {
        self.trace.lock().iter().copied().collect()
    }

    pub fn owner(&self) -> Option<(Pid, VcoreId)> {
        self.owner
            .lock()
            .as_ref()
            .map(|o| (o.proc.pid, o.vcoreid))
    }

    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::Acquire)
    }
}

/// All control blocks, indexed by core id.
pub struct CoreTable {
    cores: Box<[CachePadded<Kcb>]>,
}

impl CoreTable {
    pub fn new(nr_cores: usize) -> Self {
        let cores: Vec<CachePadded<Kcb>> =
            (0..nr_cores).map(|id| CachePadded::new(Kcb::new(id))).collect();
        CoreTable {
            cores: cores.into_boxed_slice(),
        }
    }

    pub fn get(&self, core: CoreId) -> Option<&Kcb> {
        self.cores.get(core).map(|k| &**k)
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Kcb> {
        self.cores.iter().map(|k| &**k)
    }
}
