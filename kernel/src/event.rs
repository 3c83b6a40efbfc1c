// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Event delivery: the kernel posts messages into mailboxes and pokes the
//! vcores that should look at them.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use log::{trace, warn};

use kpi::event::{EventFlags, EventMbox, EventMsg, EventQueue, EV_EVENT};
use kpi::VcoreId;

use crate::arch::IpiDriver;
use crate::ceq::send_ceq_msg;
use crate::error::{KError, KResult};
use crate::process::Process;
use crate::ucq::send_ucq_msg;
use crate::Kernel;

/// BCQ mailboxes that dropped this many events get a warning.
const BCQ_OVERFLOW_WARN: u32 = 10_000;

impl<A: IpiDriver> Kernel<A> {
    /// Put `msg` into `mbox` of `p`.
    pub fn post_ev_msg(&self, p: &Process, mbox: &EventMbox, msg: &EventMsg) -> KResult<()> {
        match mbox {
            EventMbox::Ucq(ucq) => send_ucq_msg(ucq, p, msg, self.args.ucq_warn_thresh),
            EventMbox::Bcq(bcq) => {
                if let Err(e) = bcq.bcq.enqueue(msg, self.args.bcq_ev_loops) {
                    let dropped = bcq.ev_overflows.fetch_add(1, Ordering::AcqRel) + 1;
                    if dropped >= BCQ_OVERFLOW_WARN && dropped % BCQ_OVERFLOW_WARN == 0 {
                        warn!("pid {}: bcq mailbox dropped {} events", p.pid, dropped);
                    }
                    return Err(e.into());
                }
                Ok(())
            }
            EventMbox::Ceq(ceq) => send_ceq_msg(ceq, p, msg, self.args.ceq_ring_tries),
        }
    }

    /// Deliver `msg` the way `ev_q` asks for. `vcoreid` is where the caller
    /// would like it to go, used when the queue wants the appropriate vcore.
    pub fn send_event(
        &self,
        p: &Process,
        ev_q: &EventQueue,
        msg: &EventMsg,
        vcoreid: VcoreId,
    ) -> KResult<()> {
        let nr_vcores = p.procdata.nr_vcores();
        let vcoreid = if ev_q.ev_flags.contains(EventFlags::VCORE_APPRO) {
            vcoreid
        } else if ev_q.ev_flags.contains(EventFlags::ROUNDROBIN) && nr_vcores > 0 {
            let prev = ev_q
                .ev_vcore
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some((v + 1) % nr_vcores)
                })
                .unwrap_or(0);
            (prev + 1) % nr_vcores
        } else {
            ev_q.vcore()
        };
        let Some(vcpd) = p.procdata.vcpd(vcoreid) else {
            warn!(
                "pid {}: event {} for vcore {}, but it only has {}",
                p.pid, msg.ev_type, vcoreid, nr_vcores
            );
            return Err(KError::InvalidVcore { vcoreid });
        };

        let mbox = match &ev_q.ev_mbox {
            Some(mbox) if !ev_q.ev_flags.contains(EventFlags::VCORE_APPRO) => mbox,
            _ => &vcpd.ev_mbox,
        };
        if let Err(e) = self.post_ev_msg(p, mbox, msg) {
            warn!(
                "pid {}: dropped event {} ({} mbox): {}",
                p.pid,
                msg.ev_type,
                mbox.kind(),
                e
            );
            return Err(e);
        }
        trace!("pid {}: event {} -> vcore {}", p.pid, msg.ev_type, vcoreid);

        if ev_q.ev_flags.contains(EventFlags::IPI) {
            if !Arc::ptr_eq(mbox, &vcpd.ev_mbox) {
                // Tell the vcore where to look.
                let indir = EventMsg::with_args(EV_EVENT, msg.ev_type as u32, 0);
                if let Err(e) = self.post_ev_msg(p, &vcpd.ev_mbox, &indir) {
                    warn!("pid {}: lost event indirection for vcore {}: {}", p.pid, vcoreid, e);
                }
            }
            self.proc_notify(p, vcoreid)?;
        }
        Ok(())
    }

    /// Send a kernel generated event to wherever `p` registered for its type.
    /// Events nobody registered for are dropped.
    pub fn send_kernel_event(&self, p: &Process, msg: &EventMsg, vcoreid: VcoreId) -> KResult<()> {
        match p.procdata.kernel_evq(msg.ev_type) {
            Some(ev_q) => self.send_event(p, &ev_q, msg, vcoreid),
            None => {
                trace!("pid {}: nobody wants kernel event {}", p.pid, msg.ev_type);
                Ok(())
            }
        }
    }

    /// Post `msg` directly into the mailbox of `vcoreid`.
    pub fn post_vcore_event(
        &self,
        p: &Process,
        msg: &EventMsg,
        vcoreid: VcoreId,
        flags: EventFlags,
    ) -> KResult<()> {
        let vcpd = p
            .procdata
            .vcpd(vcoreid)
            .ok_or(KError::InvalidVcore { vcoreid })?;
        self.post_ev_msg(p, &vcpd.ev_mbox, msg)?;
        if flags.contains(EventFlags::IPI) {
            self.proc_notify(p, vcoreid)?;
        }
        Ok(())
    }
}
