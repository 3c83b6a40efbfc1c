// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{Pid, VcoreId};

/// Max number of physical cores supported by the kernel.
pub const MAX_CORES: usize = 64;

/// Max number of vcores a process can have (one per physical core).
pub const MAX_VCORES: usize = MAX_CORES;

/// Largest pid handed out by the kernel.
pub const PID_MAX: usize = 32767;

static_assertions::const_assert!(MAX_VCORES <= MAX_CORES);
static_assertions::const_assert!(PID_MAX < usize::MAX);

bitflags! {
    /// The state of a process.
    ///
    /// Exactly one bit is set at any time, which lets code test membership in
    /// a set of states with a single mask.
    pub struct ProcessState: u32 {
        const CREATED = 0x01;
        const RUNNABLE_S = 0x02;
        const RUNNING_S = 0x04;
        const WAITING = 0x08;
        const DYING = 0x10;
        const RUNNABLE_M = 0x20;
        const RUNNING_M = 0x40;
    }
}

impl ProcessState {
    /// The process is a many-core process (its vcores are scheduled by a
    /// user-level scheduler).
    pub fn is_mcp(&self) -> bool {
        self.intersects(ProcessState::RUNNABLE_M | ProcessState::RUNNING_M)
    }

    pub fn name(&self) -> &'static str {
        match *self {
            ProcessState::CREATED => "CREATED",
            ProcessState::RUNNABLE_S => "RUNNABLE_S",
            ProcessState::RUNNING_S => "RUNNING_S",
            ProcessState::WAITING => "WAITING",
            ProcessState::DYING => "DYING",
            ProcessState::RUNNABLE_M => "RUNNABLE_M",
            ProcessState::RUNNING_M => "RUNNING_M",
            _ => "INVALID",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of a process as exported to user-level schedulers.
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ProcessInfo {
    /// the process id
    pub pid: Pid,
    /// Parent process id (0 for none).
    pub ppid: Pid,
    /// Raw one-hot `ProcessState` bits.
    pub state: u32,
    /// Number of vcores that currently have a physical core.
    pub num_vcores: usize,
    /// Highest vcoreid that has a physical core (if any).
    pub max_vcoreid: Option<VcoreId>,
}

impl ProcessInfo {
    pub fn state(&self) -> Option<ProcessState> {
        ProcessState::from_bits(self.state)
    }
}
