// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The kernel side of many-core processes.
//!
//! A [`Kernel`] owns one control block per physical core, the process table
//! and the pool of idle cores. Cores talk to each other exclusively with
//! kernel messages ([`kmsg`]); processes are told about kernel activity with
//! events posted into mailboxes they share with the kernel ([`event`]).
//!
//! Every physical core is driven by whoever calls into the kernel on its
//! behalf: on the hosted target that is a thread which polls the loopback
//! interrupt controller ([`Kernel::poll_interrupts`]) and enters the idle
//! loop ([`Kernel::smp_idle`]) at safe points.

extern crate alloc;

use alloc::sync::Arc;

use hashbrown::HashMap;
use log::info;

use kpi::process::MAX_CORES;
use kpi::{CoreId, Pid, VcoreId};

pub mod arch;
pub mod ceq;
pub mod cmdline;
pub mod corealloc;
pub mod error;
pub mod event;
pub mod kcb;
pub mod kmsg;
pub mod process;
pub mod ucq;
pub mod vcoremap;

use crate::arch::{IpiDriver, LoopbackApic};
use crate::cmdline::CommandLineArguments;
use crate::corealloc::IdleCoreMap;
use crate::error::{KError, KResult};
use crate::kcb::{CoreTable, Kcb};
use crate::process::{PidAllocator, Process};

pub struct Kernel<A: IpiDriver = LoopbackApic> {
    /// What we were booted with.
    pub args: CommandLineArguments,
    cores: CoreTable,
    apic: A,
    procs: spin::Mutex<HashMap<Pid, Arc<Process>>>,
    pids: PidAllocator,
    idle_cores: IdleCoreMap,
}

impl<A: IpiDriver> Kernel<A> {
    /// Bring up a kernel with `args.cores` cores that interrupts them with
    /// `apic`.
    pub fn with_driver(args: CommandLineArguments, apic: A) -> KResult<Self> {
        if args.cores == 0 || args.cores > MAX_CORES {
            log::error!(
                "Can't run with {} cores (supported 1..={})",
                args.cores,
                MAX_CORES
            );
            return Err(KError::InvalidCmdLineOptions);
        }

        let kernel = Kernel {
            args,
            cores: CoreTable::new(args.cores),
            apic,
            procs: spin::Mutex::new(HashMap::new()),
            pids: PidAllocator::new(),
            idle_cores: IdleCoreMap::new(args.cores),
        };
        info!(
            "Kernel up with {} cores ({} idle), {} vcores per process",
            args.cores,
            kernel.idle_cores.nr_idle(),
            args.vcores
        );
        Ok(kernel)
    }

    pub fn nr_cores(&self) -> usize {
        self.cores.len()
    }

    /// Control block of `core`.
    pub fn kcb(&self, core: CoreId) -> Option<&Kcb> {
        self.cores.get(core)
    }

    pub fn apic(&self) -> &A {
        &self.apic
    }

    pub fn idle_cores(&self) -> &IdleCoreMap {
        &self.idle_cores
    }

    /// The process and vcore `core` currently runs.
    pub fn core_owner(&self, core: CoreId) -> Option<(Pid, VcoreId)> {
        self.cores.get(core)?.owner()
    }

    /// Number of processes in the pid table.
    pub fn nr_procs(&self) -> usize {
        self.procs.lock().len()
    }
}

impl Kernel<LoopbackApic> {
    pub fn new(args: CommandLineArguments) -> KResult<Self> {
        let cores = args.cores;
        Kernel::with_driver(args, LoopbackApic::new(cores))
    }

    /// Parse `cmdline`, install the logger it asks for and boot.
    pub fn from_cmdline(cmdline: &'static str) -> KResult<Self> {
        let args = CommandLineArguments::from_str(cmdline)?;
        arch::unix::init_logging(args.log_filter);
        Kernel::new(args)
    }

    /// Take the interrupts latched for `core` and run their handlers.
    /// Returns the number of interrupts handled.
    pub fn poll_interrupts(&self, core: CoreId) -> usize {
        let vectors = self.apic.acknowledge(core);
        for vector in vectors.iter() {
            self.trap(core, *vector);
        }
        vectors.len()
    }
}
