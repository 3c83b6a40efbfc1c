// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! First come, first served allocation of whole cores to many-core processes.

use alloc::sync::Arc;

use arrayvec::ArrayVec;
use log::{debug, warn};

use kpi::process::{ProcessState, MAX_CORES};
use kpi::CoreId;

use crate::arch::IpiDriver;
use crate::error::{KError, KResult};
use crate::process::Process;
use crate::Kernel;

/// Cores nobody runs on, in the order they became idle.
pub struct IdleCoreMap {
    cores: spin::Mutex<ArrayVec<CoreId, MAX_CORES>>,
}

impl IdleCoreMap {
    /// All cores but core 0, which runs the kernel.
    pub fn new(nr_cores: usize) -> Self {
        IdleCoreMap {
            cores: spin::Mutex::new((1..nr_cores.min(MAX_CORES)).collect()),
        }
    }

    pub fn nr_idle(&self) -> usize {
        self.cores.lock().len()
    }

    pub fn is_idle(&self, core: CoreId) -> bool {
        self.cores.lock().contains(&core)
    }

    /// Remove up to `n` cores, longest idle first.
    pub fn take(&self, n: usize) -> ArrayVec<CoreId, MAX_CORES> {
        let mut cores = self.cores.lock();
        let n = n.min(cores.len());
        cores.drain(..n).collect()
    }

    /// Remove exactly `list`, or nothing if one of them isn't idle.
    pub fn claim(&self, list: &[CoreId]) -> KResult<()> {
        let mut cores = self.cores.lock();
        for (i, core) in list.iter().enumerate() {
            if !cores.contains(core) || list[..i].contains(core) {
                return Err(KError::CoreAlreadyAllocated { core: *core });
            }
        }
        cores.retain(|c| !list.contains(c));
        Ok(())
    }

    pub fn put_back(&self, list: &[CoreId]) {
        let mut cores = self.cores.lock();
        for &core in list {
            if cores.contains(&core) {
                warn!("core {} is already idle", core);
                continue;
            }
            if cores.try_push(core).is_err() {
                warn!("idle core map is full, dropping core {}", core);
            }
        }
    }
}

impl<A: IpiDriver> Kernel<A> {
    /// `p` wants `amount` cores in total. Grants what is idle; returns the
    /// number of cores newly granted.
    pub fn proc_request_cores(&self, p: &Arc<Process>, amount: usize) -> KResult<usize> {
        let state = p.state();
        if state == ProcessState::DYING {
            return Err(KError::ProcessDying);
        }
        if !state.is_mcp() {
            return Err(KError::NotMcp { state });
        }
        let amount = amount.min(p.max_vcores());
        let have = {
            let mut inner = p.lock();
            inner.amt_wanted = amount;
            inner.vcoremap.num_vcores()
        };

        let granted = self.idle_cores.take(amount.saturating_sub(have));
        if granted.is_empty() {
            debug!("pid {}: wants {} cores, none idle", p.pid, amount);
            return Ok(0);
        }
        if let Err(e) = self.map_cores(p, &granted) {
            self.idle_cores.put_back(&granted);
            return Err(e);
        }
        debug!("pid {}: granted cores {:?}", p.pid, granted.as_slice());
        Ok(granted.len())
    }
}
