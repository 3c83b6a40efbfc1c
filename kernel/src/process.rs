// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Processes, their state machine and the cores they run on.
//!
//! A process starts as a single-core process (`_S`) scheduled by the kernel
//! on one core, and may turn itself once into a many-core process (`_M`)
//! that is granted whole cores and schedules its own vcores on them.
//!
//! # Reference counting
//! A process is alive as long as its reference count is above zero. The pid
//! table holds one reference from creation until `proc_destroy` ("+1 for
//! existing"), every core running the process holds one, and so does every
//! `StartCore` message in flight. The last `proc_decref` gives the pid back.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use log::{debug, error, info, trace};

use kpi::event::{EventMsg, EV_PREEMPT_PENDING};
use kpi::procdata::ProcData;
use kpi::process::{ProcessInfo, ProcessState, MAX_CORES, MAX_VCORES, PID_MAX};
use kpi::{CoreId, Pid, VcoreId};

use crate::arch::{core_id, IpiDriver};
use crate::error::{KError, KResult};
use crate::kmsg::{KernelCommand, MsgClass};
use crate::vcoremap::VcoreMap;
use crate::Kernel;

/// The state guarded by the process lock.
#[derive(Debug)]
pub struct ProcessInner {
    pub state: ProcessState,
    pub vcoremap: VcoreMap,
    /// Core of a running `_S` process.
    pub s_core: Option<CoreId>,
    /// Changed to `_M` once already.
    pub was_mcp: bool,
    /// Cores the process asked for last.
    pub amt_wanted: usize,
}

pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    /// Lock-free copy of `inner.state`.
    state: AtomicU32,
    inner: spin::Mutex<ProcessInner>,
    refcnt: AtomicUsize,
    pub procdata: ProcData,
    /// Serializes kernel producers growing a UCQ of this process.
    pub(crate) ucq_lock: spin::Mutex<()>,
}

fn transition_allowed(from: ProcessState, to: ProcessState) -> bool {
    use ProcessState as S;
    let allowed = match from {
        S::CREATED => S::RUNNABLE_S | S::DYING,
        S::RUNNABLE_S => S::RUNNING_S | S::DYING,
        S::RUNNING_S => S::RUNNABLE_S | S::RUNNABLE_M | S::WAITING | S::DYING,
        S::WAITING => S::RUNNABLE_S | S::DYING,
        S::RUNNABLE_M => S::RUNNING_M | S::DYING,
        S::RUNNING_M => S::RUNNABLE_S | S::RUNNABLE_M | S::DYING,
        _ => S::empty(),
    };
    to.bits().count_ones() == 1 && allowed.contains(to)
}

fn refuse(pid: Pid, from: ProcessState, to: ProcessState) -> KError {
    error!("pid {}: refusing state transition {} -> {}", pid, from, to);
    KError::InvalidStateTransition { from, to }
}

impl Process {
    pub(crate) fn new(pid: Pid, ppid: Pid, procdata: ProcData) -> Self {
        Process {
            pid,
            ppid,
            state: AtomicU32::new(ProcessState::CREATED.bits()),
            inner: spin::Mutex::new(ProcessInner {
                state: ProcessState::CREATED,
                vcoremap: VcoreMap::default(),
                s_core: None,
                was_mcp: false,
                amt_wanted: 0,
            }),
            // +1 for existing
            refcnt: AtomicUsize::new(1),
            procdata,
            ucq_lock: spin::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ProcessState {
        ProcessState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub fn is_mcp(&self) -> bool {
        self.state().is_mcp()
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, ProcessInner> {
        self.inner.lock()
    }

    /// Move to `new`, if the state machine allows it.
    pub(crate) fn set_state(&self, inner: &mut ProcessInner, new: ProcessState) -> KResult<()> {
        if !transition_allowed(inner.state, new) {
            return Err(refuse(self.pid, inner.state, new));
        }
        trace!("pid {}: {} -> {}", self.pid, inner.state, new);
        inner.state = new;
        self.state.store(new.bits(), Ordering::Release);
        Ok(())
    }

    pub fn refcnt(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Vcoreids the process can use (bounded by its procdata).
    pub fn max_vcores(&self) -> usize {
        core::cmp::min(self.procdata.nr_vcores(), MAX_VCORES)
    }

    pub fn num_vcores(&self) -> usize {
        self.lock().vcoremap.num_vcores()
    }

    pub fn info(&self) -> ProcessInfo {
        let inner = self.lock();
        ProcessInfo {
            pid: self.pid,
            ppid: self.ppid,
            state: inner.state.bits(),
            num_vcores: inner.vcoremap.num_vcores(),
            max_vcoreid: inner.vcoremap.max_vcoreid(),
        }
    }
}

/// Hands out pids next-fit; pid 0 is never used.
pub struct PidAllocator {
    inner: spin::Mutex<PidBitmap>,
}

struct PidBitmap {
    words: Box<[u64]>,
    next: Pid,
}

impl PidBitmap {
    fn is_set(&self, pid: Pid) -> bool {
        self.words[pid / 64] & (1 << (pid % 64)) != 0
    }

    fn set(&mut self, pid: Pid, used: bool) {
        if used {
            self.words[pid / 64] |= 1 << (pid % 64);
        } else {
            self.words[pid / 64] &= !(1 << (pid % 64));
        }
    }
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PidAllocator {
    pub fn new() -> Self {
        let mut map = PidBitmap {
            words: vec![0u64; (PID_MAX + 1 + 63) / 64].into_boxed_slice(),
            next: 1,
        };
        map.set(0, true);
        PidAllocator {
            inner: spin::Mutex::new(map),
        }
    }

    pub fn alloc(&self) -> KResult<Pid> {
        let mut map = self.inner.lock();
        let start = map.next;
        let mut pid = start;
        loop {
            if !map.is_set(pid) {
                map.set(pid, true);
                map.next = if pid == PID_MAX { 1 } else { pid + 1 };
                return Ok(pid);
            }
            pid = if pid == PID_MAX { 1 } else { pid + 1 };
            if pid == start {
                return Err(KError::OutOfPids);
            }
        }
    }

    pub fn free(&self, pid: Pid) {
        if pid == 0 || pid > PID_MAX {
            return;
        }
        self.inner.lock().set(pid, false);
    }

    pub fn is_used(&self, pid: Pid) -> bool {
        pid <= PID_MAX && self.inner.lock().is_set(pid)
    }
}

impl<A: IpiDriver> Kernel<A> {
    /// Make a new process (in `CREATED`) with parent `ppid`.
    pub fn proc_create(&self, ppid: Pid) -> KResult<Arc<Process>> {
        let pid = self.pids.alloc()?;
        let p = Arc::new(Process::new(
            pid,
            ppid,
            ProcData::new(self.args.vcores, self.args.ucq_pages),
        ));
        self.procs.lock().insert(pid, p.clone());
        info!("Created process {} (parent {})", pid, ppid);
        Ok(p)
    }

    /// Look up `pid` and take a reference on it; give it back with
    /// [`Kernel::proc_decref`].
    pub fn pid2proc(&self, pid: Pid) -> KResult<Arc<Process>> {
        let p = self
            .procs
            .lock()
            .get(&pid)
            .cloned()
            .ok_or(KError::NoSuchProcess)?;
        self.proc_incref(&p)?;
        Ok(p)
    }

    pub fn proc_incref(&self, p: &Process) -> KResult<()> {
        p.refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .map(|_| ())
            .map_err(|_| KError::ProcessDying)
    }

    pub fn proc_decref(&self, p: &Process) {
        let old = p
            .refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match old {
            Ok(1) => {
                self.pids.free(p.pid);
                info!("Process {} freed", p.pid);
            }
            Ok(_) => {}
            Err(_) => error!("pid {}: decref of a freed process", p.pid),
        }
    }

    /// `CREATED` or `WAITING` -> `RUNNABLE_S`.
    pub fn proc_wakeup(&self, p: &Process) -> KResult<()> {
        let mut inner = p.lock();
        match inner.state {
            ProcessState::CREATED | ProcessState::WAITING => {
                p.set_state(&mut inner, ProcessState::RUNNABLE_S)
            }
            from => Err(refuse(p.pid, from, ProcessState::RUNNABLE_S)),
        }
    }

    /// Run a runnable process. `core` is the core of the caller, it becomes
    /// the core of an `_S` process at its next safe point.
    pub fn proc_run(&self, p: &Arc<Process>, core: CoreId) -> KResult<()> {
        let mut inner = p.lock();
        match inner.state {
            ProcessState::RUNNABLE_S => {
                if self.cores.get(core).is_none() {
                    return Err(KError::InvalidCore { core });
                }
                self.proc_incref(p)?;
                p.set_state(&mut inner, ProcessState::RUNNING_S)?;
                inner.s_core = Some(core);
                self.send_kernel_message(
                    core,
                    core,
                    KernelCommand::StartCore {
                        proc: p.clone(),
                        vcoreid: 0,
                    },
                    MsgClass::Routine,
                );
                Ok(())
            }
            ProcessState::RUNNABLE_M => {
                if inner.vcoremap.is_empty() {
                    return Err(KError::NoCoresGranted);
                }
                p.set_state(&mut inner, ProcessState::RUNNING_M)?;
                let mapped: ArrayVec<(VcoreId, CoreId), MAX_CORES> =
                    inner.vcoremap.iter_mapped().collect();
                for (vcoreid, pcore) in mapped {
                    self.start_vcore(p, core, pcore, vcoreid)?;
                }
                debug!("pid {}: running on {} cores", p.pid, inner.vcoremap.num_vcores());
                Ok(())
            }
            state => Err(KError::ProcessNotRunnable { state }),
        }
    }

    fn start_vcore(
        &self,
        p: &Arc<Process>,
        src: CoreId,
        pcore: CoreId,
        vcoreid: VcoreId,
    ) -> KResult<()> {
        self.proc_incref(p)?;
        if let Some(vcpd) = p.procdata.vcpd(vcoreid) {
            vcpd.preempted.store(false, Ordering::SeqCst);
        }
        self.send_kernel_message(
            src,
            pcore,
            KernelCommand::StartCore {
                proc: p.clone(),
                vcoreid,
            },
            MsgClass::Routine,
        );
        Ok(())
    }

    /// Stop running `p` on `core` if it does.
    fn release_core(&self, p: &Process, core: CoreId) {
        let Some(kcb) = self.cores.get(core) else {
            return;
        };
        if kcb.owner().map(|(pid, _)| pid) == Some(p.pid) {
            self.abandon_core(kcb);
        }
    }

    /// `RUNNING_S` -> `WAITING`, the process gives up `core`.
    pub fn proc_wait(&self, p: &Process, core: CoreId) -> KResult<()> {
        {
            let mut inner = p.lock();
            if inner.state != ProcessState::RUNNING_S {
                return Err(refuse(p.pid, inner.state, ProcessState::WAITING));
            }
            p.set_state(&mut inner, ProcessState::WAITING)?;
            inner.s_core = None;
        }
        self.release_core(p, core);
        Ok(())
    }

    /// The process turns itself into a many-core process. Only allowed once;
    /// the core it ran on is given up.
    pub fn proc_change_to_m(&self, p: &Process, core: CoreId) -> KResult<()> {
        {
            let mut inner = p.lock();
            if inner.was_mcp {
                debug!("pid {}: was already an MCP", p.pid);
                return Err(KError::AlreadyMcp);
            }
            if inner.state != ProcessState::RUNNING_S {
                return Err(refuse(p.pid, inner.state, ProcessState::RUNNABLE_M));
            }
            p.set_state(&mut inner, ProcessState::RUNNABLE_M)?;
            inner.was_mcp = true;
            inner.s_core = None;
        }
        self.release_core(p, core);
        info!("pid {} is now a many-core process", p.pid);
        Ok(())
    }

    /// Grant `corelist` (idle cores) to `p`.
    pub fn proc_give_cores(&self, p: &Arc<Process>, corelist: &[CoreId]) -> KResult<()> {
        let state = p.state();
        if state == ProcessState::DYING {
            return Err(KError::ProcessDying);
        }
        if !state.is_mcp() {
            return Err(KError::NotMcp { state });
        }
        if let Some(&core) = corelist.iter().find(|c| **c >= self.nr_cores()) {
            return Err(KError::InvalidCore { core });
        }
        self.idle_cores.claim(corelist)?;
        let r = self.map_cores(p, corelist);
        if r.is_err() {
            self.idle_cores.put_back(corelist);
        }
        r
    }

    /// Map cores already claimed from the idle map.
    pub(crate) fn map_cores(&self, p: &Arc<Process>, corelist: &[CoreId]) -> KResult<()> {
        let mut inner = p.lock();
        match inner.state {
            ProcessState::RUNNABLE_M | ProcessState::RUNNING_M => {}
            ProcessState::DYING => return Err(KError::ProcessDying),
            state => return Err(KError::NotMcp { state }),
        }
        if let Some(&core) = corelist
            .iter()
            .find(|c| inner.vcoremap.pcore_to_vcore(**c).is_some())
        {
            return Err(KError::CoreAlreadyAllocated { core });
        }
        if inner.vcoremap.nr_free_vcores(p.max_vcores()) < corelist.len() {
            return Err(KError::OutOfVcores);
        }

        let running = inner.state == ProcessState::RUNNING_M;
        for &pcore in corelist {
            let vcoreid = inner
                .vcoremap
                .get_free_vcoreid(p.max_vcores())
                .ok_or(KError::OutOfVcores)?;
            inner.vcoremap.map(vcoreid, pcore)?;
            debug!("pid {}: core {} -> vcore {}", p.pid, pcore, vcoreid);
            if running {
                self.start_vcore(p, core_id(), pcore, vcoreid)?;
            }
        }
        Ok(())
    }

    /// Take `corelist` (cores of `p`) back. A running process is told with
    /// a `Preempt` (`preempt`) or a `Death` message on every core.
    pub fn proc_take_corelist(
        &self,
        p: &Process,
        corelist: &[CoreId],
        preempt: bool,
    ) -> KResult<()> {
        let mut inner = p.lock();
        let state = inner.state;
        if !state.is_mcp() {
            return Err(KError::NotMcp { state });
        }
        if let Some(&core) = corelist
            .iter()
            .find(|c| inner.vcoremap.pcore_to_vcore(**c).is_none())
        {
            return Err(KError::CoreNotOwned { core });
        }

        let mut taken: ArrayVec<CoreId, MAX_CORES> = ArrayVec::new();
        for &pcore in corelist {
            // Duplicates were unmapped by their first occurrence.
            let Some(vcoreid) = inner.vcoremap.unmap_pcore(pcore) else {
                continue;
            };
            taken.push(pcore);
            if state == ProcessState::RUNNING_M {
                let cmd = if preempt {
                    KernelCommand::Preempt {
                        pid: p.pid,
                        vcoreid,
                    }
                } else {
                    KernelCommand::Death { pid: p.pid }
                };
                self.send_kernel_message(core_id(), pcore, cmd, MsgClass::Immediate);
            }
            debug!("pid {}: took core {} (vcore {})", p.pid, pcore, vcoreid);
        }
        self.idle_cores.put_back(&taken);

        if state == ProcessState::RUNNING_M && inner.vcoremap.is_empty() {
            p.set_state(&mut inner, ProcessState::RUNNABLE_M)?;
        }
        Ok(())
    }

    pub fn proc_take_allcores(&self, p: &Process, preempt: bool) -> KResult<()> {
        let cores: ArrayVec<CoreId, MAX_CORES> =
            p.lock().vcoremap.iter_mapped().map(|(_, pcore)| pcore).collect();
        self.proc_take_corelist(p, &cores, preempt)
    }

    /// The process gives up `core` voluntarily.
    pub fn proc_yield(&self, p: &Process, core: CoreId) -> KResult<()> {
        let mut inner = p.lock();
        match inner.state {
            ProcessState::RUNNING_S => {
                p.set_state(&mut inner, ProcessState::RUNNABLE_S)?;
                inner.s_core = None;
            }
            ProcessState::RUNNING_M => {
                let vcoreid = inner
                    .vcoremap
                    .unmap_pcore(core)
                    .ok_or(KError::CoreNotOwned { core })?;
                self.idle_cores.put_back(&[core]);
                debug!("pid {}: vcore {} yielded core {}", p.pid, vcoreid, core);
                if inner.vcoremap.is_empty() {
                    p.set_state(&mut inner, ProcessState::RUNNABLE_M)?;
                }
            }
            state => return Err(KError::ProcessNotRunning { state }),
        }
        drop(inner);
        self.release_core(p, core);
        Ok(())
    }

    /// Kill `p`: all its cores are taken with `Death` messages and the pid
    /// goes away once the last reference is gone.
    pub fn proc_destroy(&self, p: &Process) -> KResult<()> {
        {
            let mut inner = p.lock();
            let prev = inner.state;
            if prev == ProcessState::DYING {
                return Err(KError::ProcessDying);
            }
            p.set_state(&mut inner, ProcessState::DYING)?;

            match prev {
                ProcessState::RUNNING_S => {
                    if let Some(core) = inner.s_core.take() {
                        self.send_kernel_message(
                            core_id(),
                            core,
                            KernelCommand::Death { pid: p.pid },
                            MsgClass::Immediate,
                        );
                    }
                }
                ProcessState::RUNNABLE_M | ProcessState::RUNNING_M => {
                    let mapped: ArrayVec<(VcoreId, CoreId), MAX_CORES> =
                        inner.vcoremap.iter_mapped().collect();
                    let mut taken: ArrayVec<CoreId, MAX_CORES> = ArrayVec::new();
                    for (_vcoreid, pcore) in mapped {
                        inner.vcoremap.unmap_pcore(pcore);
                        taken.push(pcore);
                        if prev == ProcessState::RUNNING_M {
                            self.send_kernel_message(
                                core_id(),
                                pcore,
                                KernelCommand::Death { pid: p.pid },
                                MsgClass::Immediate,
                            );
                        }
                    }
                    self.idle_cores.put_back(&taken);
                }
                _ => {}
            }
        }

        if self.procs.lock().remove(&p.pid).is_some() {
            // The reference of the pid table.
            self.proc_decref(p);
        }
        info!("Destroyed process {}", p.pid);
        Ok(())
    }

    /// Tell `vcoreid` there is something for it. Sends an IPI only if the
    /// vcore runs and wants to be notified.
    pub fn proc_notify(&self, p: &Process, vcoreid: VcoreId) -> KResult<()> {
        let vcpd = p
            .procdata
            .vcpd(vcoreid)
            .ok_or(KError::InvalidVcore { vcoreid })?;
        vcpd.notif_pending.store(true, Ordering::SeqCst);
        if vcpd.notif_disabled.load(Ordering::SeqCst) {
            return Ok(());
        }

        let inner = p.lock();
        if inner.state != ProcessState::RUNNING_M {
            return Ok(());
        }
        if let Some(pcore) = inner.vcoremap.vcore_to_pcore(vcoreid) {
            self.send_kernel_message(
                core_id(),
                pcore,
                KernelCommand::Notify {
                    pid: p.pid,
                    vcoreid,
                },
                MsgClass::Immediate,
            );
        }
        Ok(())
    }

    /// Warn `vcoreid` that it will lose its core at `deadline`.
    pub fn proc_preempt_warn(&self, p: &Process, vcoreid: VcoreId, deadline: u64) -> KResult<()> {
        let vcpd = p
            .procdata
            .vcpd(vcoreid)
            .ok_or(KError::InvalidVcore { vcoreid })?;
        vcpd.preempt_pending.store(deadline, Ordering::SeqCst);
        let msg = EventMsg::with_args(EV_PREEMPT_PENDING, vcoreid as u32, deadline);
        self.send_kernel_event(p, &msg, vcoreid)
    }

    /// Warn the vcore on `pcore`, then take the core.
    pub fn proc_preempt_core(&self, p: &Process, pcore: CoreId, deadline: u64) -> KResult<()> {
        let vcoreid = p
            .lock()
            .vcoremap
            .pcore_to_vcore(pcore)
            .ok_or(KError::CoreNotOwned { core: pcore })?;
        if let Err(e) = self.proc_preempt_warn(p, vcoreid, deadline) {
            debug!("pid {}: preempt warning for vcore {} lost: {}", p.pid, vcoreid, e);
        }
        self.proc_take_corelist(p, &[pcore], true)
    }

    /// Warn every vcore, then take all cores.
    pub fn proc_preempt_all(&self, p: &Process, deadline: u64) -> KResult<()> {
        let vcores: ArrayVec<VcoreId, MAX_CORES> =
            p.lock().vcoremap.iter_mapped().map(|(v, _)| v).collect();
        for vcoreid in vcores {
            if let Err(e) = self.proc_preempt_warn(p, vcoreid, deadline) {
                debug!("pid {}: preempt warning for vcore {} lost: {}", p.pid, vcoreid, e);
            }
        }
        self.proc_take_allcores(p, true)
    }
}
