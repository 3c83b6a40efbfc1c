// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Architecture specific code.
//!
//! The kernel core only needs a way to interrupt another core; everything
//! else about the hardware stays behind this module.

use kpi::CoreId;

pub mod unix;

pub use unix::irq::{disable_irqsave, IrqGuard};
pub use unix::{core_id, set_core_id, LoopbackApic};

/// Interrupt vector used to signal pending kernel messages.
pub const I_KERNEL_MSG: u8 = 0xf1;

/// Sends inter-processor interrupts.
pub trait IpiDriver: Send + Sync {
    /// Raise interrupt `vector` on core `dst`.
    fn send_ipi(&self, dst: CoreId, vector: u8);
}
