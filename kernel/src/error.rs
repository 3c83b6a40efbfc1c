// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::convert::From;

use custom_error::custom_error;

use kpi::bcq::BcqError;
use kpi::ceq::CeqError;
use kpi::process::ProcessState;

custom_error! {
    #[derive(PartialEq, Clone)]
    pub KError
    NotSupported = "The requested operation is not supported/does not exist.",
    BadAddress = "User-space pointer is not valid.",
    OutOfMemory = "Ran out of memory while performing an allocation",
    OutOfPids = "Can't spawn more processes (out of Pids)",
    OutOfVcores = "Process has no free vcore left for the granted core.",
    NoSuchProcess = "No process with that pid exists.",
    ProcessDying = "The process is dying (or already freed).",
    InvalidStateTransition{from: ProcessState, to: ProcessState} = "Invalid process state transition {from} -> {to}",
    ProcessNotRunnable{state: ProcessState} = "Process in state {state} can't be run",
    ProcessNotRunning{state: ProcessState} = "Process in state {state} doesn't run on a core",
    NotMcp{state: ProcessState} = "Operation needs a many-core process (process is {state})",
    AlreadyMcp = "The process has already been a many-core process.",
    NoCoresGranted = "The process has no cores to run on.",
    CoreAlreadyAllocated{core: usize} = "Core {core} is already allocated to the process.",
    CoreNotOwned{core: usize} = "Core {core} isn't owned by the process.",
    InvalidCore{core: usize} = "Core {core} doesn't exist.",
    InvalidVcore{vcoreid: usize} = "Vcore {vcoreid} doesn't exist.",
    QueueNotReady = "The event queue hasn't been initialized.",
    RingOverflow = "The ring is full, the event will be found by overflow recovery.",
    RetryExhausted = "Gave up enqueuing after too many failed attempts.",
    CeqTooSmall{ev_type: u16} = "Event type {ev_type} is too large for the CEQ.",
    InvalidCeqOperation = "The CEQ has an unknown coalescing operation.",
    InvalidCeqConfig = "CEQ ring size must be a power of two.",
    InvalidCmdLineOptions = "Invalid command line arguments supplied.",
    MalformedCmdLine = "Unable to parse the command line.",
}

impl From<BcqError> for KError {
    fn from(e: BcqError) -> Self {
        match e {
            BcqError::Busy => KError::RingOverflow,
            BcqError::Fail => KError::RetryExhausted,
            BcqError::Empty => KError::NotSupported,
        }
    }
}

impl From<CeqError> for KError {
    fn from(e: CeqError) -> Self {
        match e {
            CeqError::InvalidOperation => KError::InvalidCeqOperation,
            CeqError::RingNotPowerOfTwo | CeqError::TooManyEvents => KError::InvalidCeqConfig,
        }
    }
}

impl Default for KError {
    fn default() -> KError {
        KError::NotSupported
    }
}

/// Result type used throughout the kernel.
pub type KResult<T> = Result<T, KError>;
