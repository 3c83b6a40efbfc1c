// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Kernel messages: work one core asks another core to do.
//!
//! Every core has two lists. *Immediate* messages run from the IPI handler
//! as soon as the destination takes the interrupt, *routine* messages wait
//! until the destination reaches a safe point ([`Kernel::smp_idle`]).
//! Messages from one source to one destination run in the order they were
//! sent; nothing is promised across sources.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::Ordering;

use log::{debug, info, trace, warn};

use kpi::event::{EventMsg, EV_VCORE_PREEMPT};
use kpi::process::ProcessState;
use kpi::{CoreId, Pid, VcoreId};

use crate::arch::{IpiDriver, I_KERNEL_MSG};
use crate::kcb::{CoreOwner, Kcb};
use crate::process::Process;
use crate::Kernel;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MsgClass {
    Immediate,
    Routine,
}

pub enum KernelCommand {
    /// Run `vcoreid` of `proc`; the message owns one reference of `proc`.
    StartCore { proc: Arc<Process>, vcoreid: VcoreId },
    /// Take the core away from `vcoreid` and tell the process.
    Preempt { pid: Pid, vcoreid: VcoreId },
    /// Stop running `pid`.
    Death { pid: Pid },
    /// Let `vcoreid` know there are events for it.
    Notify { pid: Pid, vcoreid: VcoreId },
    Ping { token: u64 },
}

impl KernelCommand {
    pub fn name(&self) -> &'static str {
        match self {
            KernelCommand::StartCore { .. } => "startcore",
            KernelCommand::Preempt { .. } => "preempt",
            KernelCommand::Death { .. } => "death",
            KernelCommand::Notify { .. } => "notify",
            KernelCommand::Ping { .. } => "ping",
        }
    }
}

impl fmt::Debug for KernelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelCommand::StartCore { proc, vcoreid } => {
                write!(f, "StartCore(pid={}, vcore={})", proc.pid, vcoreid)
            }
            KernelCommand::Preempt { pid, vcoreid } => {
                write!(f, "Preempt(pid={}, vcore={})", pid, vcoreid)
            }
            KernelCommand::Death { pid } => write!(f, "Death(pid={})", pid),
            KernelCommand::Notify { pid, vcoreid } => {
                write!(f, "Notify(pid={}, vcore={})", pid, vcoreid)
            }
            KernelCommand::Ping { token } => write!(f, "Ping({})", token),
        }
    }
}

#[derive(Debug)]
pub struct KernelMessage {
    pub src: CoreId,
    pub dst: CoreId,
    pub cmd: KernelCommand,
    pub class: MsgClass,
}

impl<A: IpiDriver> Kernel<A> {
    /// Queue `cmd` for core `dst`.
    ///
    /// # Panics
    /// If `dst` isn't a core of this machine.
    pub fn send_kernel_message(
        &self,
        src: CoreId,
        dst: CoreId,
        cmd: KernelCommand,
        class: MsgClass,
    ) {
        let Some(dst_kcb) = self.cores.get(dst) else {
            panic!(
                "Kernel message {:?} from core {} to non-existent core {}",
                cmd, src, dst
            );
        };
        let _irq = self.cores.get(src).map(|k| k.irqsave());

        trace!("kmsg {} -> {}: {:?} ({:?})", src, dst, cmd, class);
        dst_kcb.enqueue(KernelMessage {
            src,
            dst,
            cmd,
            class,
        });

        // A routine message to ourselves is found at the next safe point.
        if dst != src || class == MsgClass::Immediate {
            self.apic.send_ipi(dst, I_KERNEL_MSG);
        }
    }

    /// Interrupt entry point of `core`.
    pub fn trap(&self, core: CoreId, vector: u8) {
        match vector {
            I_KERNEL_MSG => self.handle_kmsg_ipi(core),
            _ => warn!("core {}: unexpected interrupt vector {:#x}", core, vector),
        }
    }

    /// Run all immediate messages of `core`.
    pub fn handle_kmsg_ipi(&self, core: CoreId) {
        let Some(kcb) = self.cores.get(core) else {
            warn!("kmsg IPI on non-existent core {}", core);
            return;
        };
        // Popped one by one: a handler may send us more.
        while let Some(msg) = kcb.dequeue(MsgClass::Immediate) {
            self.run_kmsg(kcb, msg);
        }
    }

    /// Run all routine messages of `core`, returns how many ran.
    ///
    /// Only call this from a place where the core is allowed to give up
    /// what it is doing.
    pub fn process_routine_kmsg(&self, core: CoreId) -> usize {
        let Some(kcb) = self.cores.get(core) else {
            warn!("routine kmsgs requested for non-existent core {}", core);
            return 0;
        };
        let _irq = kcb.irqsave();
        let mut ran = 0;
        while let Some(msg) = kcb.dequeue(MsgClass::Routine) {
            assert_eq!(msg.dst, core, "kmsg {:?} ended up on the wrong core", msg);
            self.run_kmsg(kcb, msg);
            ran += 1;
        }
        ran
    }

    pub fn has_routine_kmsg(&self, core: CoreId) -> bool {
        self.cores
            .get(core)
            .map(|k| k.pending(MsgClass::Routine) > 0)
            .unwrap_or(false)
    }

    /// The safe point of `core`: runs everything that was waiting for one.
    pub fn smp_idle(&self, core: CoreId) -> usize {
        self.process_routine_kmsg(core)
    }

    /// Dump the pending messages of `core`.
    pub fn print_kmsgs(&self, core: CoreId) {
        let Some(kcb) = self.cores.get(core) else {
            return;
        };
        for class in [MsgClass::Immediate, MsgClass::Routine] {
            info!("core {} {:?} kmsgs:", core, class);
            kcb.for_each_pending(class, |msg| {
                info!("    from {}: {:?}", msg.src, msg.cmd);
            });
        }
    }

    /// Dump the queue lengths of all cores.
    pub fn kmsg_queue_stat(&self) {
        for kcb in self.cores.iter() {
            info!(
                "core {}: {} immediate, {} routine kmsgs pending, {} executed, irqs {}",
                kcb.id,
                kcb.pending(MsgClass::Immediate),
                kcb.pending(MsgClass::Routine),
                kcb.executed(),
                if kcb.irqs_enabled() { "on" } else { "off" }
            );
        }
    }

    fn run_kmsg(&self, kcb: &Kcb, msg: KernelMessage) {
        kcb.record(msg.src, msg.cmd.name());
        match msg.cmd {
            KernelCommand::StartCore { proc, vcoreid } => self.handle_startcore(kcb, proc, vcoreid),
            KernelCommand::Preempt { pid, vcoreid } => self.handle_preempt(kcb, pid, vcoreid),
            KernelCommand::Death { pid } => self.handle_death(kcb, pid),
            KernelCommand::Notify { pid, vcoreid } => self.handle_notify(kcb, pid, vcoreid),
            KernelCommand::Ping { token } => trace!("core {}: ping {}", kcb.id, token),
        }
    }

    fn handle_startcore(&self, kcb: &Kcb, proc: Arc<Process>, vcoreid: VcoreId) {
        let wanted = {
            let inner = proc.lock();
            match inner.state {
                ProcessState::RUNNING_S => inner.s_core == Some(kcb.id) && vcoreid == 0,
                ProcessState::RUNNING_M => inner.vcoremap.pcore_to_vcore(kcb.id) == Some(vcoreid),
                _ => false,
            }
        };
        if !wanted {
            // The process moved on (died, yielded, lost the core) before we
            // got here.
            debug!(
                "core {}: dropping stale startcore for pid {} vcore {} ({})",
                kcb.id,
                proc.pid,
                vcoreid,
                proc.state()
            );
            self.proc_decref(&proc);
            return;
        }

        let pid = proc.pid;
        let prev = kcb.owner.lock().replace(CoreOwner { proc, vcoreid });
        if let Some(prev) = prev {
            warn!(
                "core {}: pid {} vcore {} still owned the core, abandoning it",
                kcb.id, prev.proc.pid, prev.vcoreid
            );
            self.proc_decref(&prev.proc);
        }
        debug!("core {}: running pid {} vcore {}", kcb.id, pid, vcoreid);
    }

    fn handle_preempt(&self, kcb: &Kcb, pid: Pid, vcoreid: VcoreId) {
        let owner = {
            let mut owner = kcb.owner.lock();
            match &*owner {
                Some(o) if o.proc.pid == pid && o.vcoreid == vcoreid => owner.take(),
                _ => None,
            }
        };
        match owner {
            Some(owner) => {
                self.record_preemption(kcb, &owner.proc, vcoreid);
                self.proc_decref(&owner.proc);
            }
            None => {
                // Immediate messages overtake routine ones: the core may have
                // been taken before its StartCore ran. That StartCore is stale
                // now and gets dropped, the vcore still counts as preempted.
                let Ok(proc) = self.pid2proc(pid) else {
                    debug!("core {}: preempt for dead pid {}", kcb.id, pid);
                    return;
                };
                let unmapped = {
                    let inner = proc.lock();
                    inner.state.is_mcp() && inner.vcoremap.vcore_to_pcore(vcoreid).is_none()
                };
                if unmapped {
                    self.record_preemption(kcb, &proc, vcoreid);
                } else {
                    debug!(
                        "core {}: preempt for pid {} vcore {} which doesn't run here",
                        kcb.id, pid, vcoreid
                    );
                }
                self.proc_decref(&proc);
            }
        }
    }

    fn record_preemption(&self, kcb: &Kcb, proc: &Process, vcoreid: VcoreId) {
        if let Some(vcpd) = proc.procdata.vcpd(vcoreid) {
            vcpd.preempted.store(true, Ordering::SeqCst);
            vcpd.preempt_pending.store(0, Ordering::SeqCst);
        }
        debug!("core {}: preempted pid {} vcore {}", kcb.id, proc.pid, vcoreid);

        let msg = EventMsg::with_args(EV_VCORE_PREEMPT, vcoreid as u32, 0);
        if let Err(e) = self.send_kernel_event(proc, &msg, vcoreid) {
            warn!("pid {}: lost preemption event of vcore {}: {}", proc.pid, vcoreid, e);
        }
    }

    fn handle_death(&self, kcb: &Kcb, pid: Pid) {
        let owner = {
            let mut owner = kcb.owner.lock();
            match &*owner {
                Some(o) if o.proc.pid == pid => owner.take(),
                _ => None,
            }
        };
        if let Some(owner) = owner {
            debug!("core {}: pid {} vcore {} died", kcb.id, pid, owner.vcoreid);
            self.proc_decref(&owner.proc);
        }
    }

    fn handle_notify(&self, kcb: &Kcb, pid: Pid, vcoreid: VcoreId) {
        let owner = kcb.owner.lock();
        let Some(o) = owner.as_ref().filter(|o| o.proc.pid == pid && o.vcoreid == vcoreid) else {
            trace!("core {}: notify for pid {} vcore {} not running here", kcb.id, pid, vcoreid);
            return;
        };
        let disabled = o
            .proc
            .procdata
            .vcpd(vcoreid)
            .map(|v| v.notif_disabled.load(Ordering::SeqCst))
            .unwrap_or(true);
        if !disabled {
            kcb.notifications.fetch_add(1, Ordering::AcqRel);
            trace!("core {}: notified pid {} vcore {}", kcb.id, pid, vcoreid);
        }
    }

    /// Stop running whatever runs on `kcb`'s core.
    pub(crate) fn abandon_core(&self, kcb: &Kcb) -> Option<(Pid, VcoreId)> {
        let owner = kcb.owner.lock().take()?;
        let ret = (owner.proc.pid, owner.vcoreid);
        self.proc_decref(&owner.proc);
        Some(ret)
    }
}
