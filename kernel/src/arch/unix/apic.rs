// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use log::trace;

use kpi::CoreId;

use crate::arch::{IpiDriver, I_KERNEL_MSG};

/// Vectors we can latch, starting at `VECTOR_BASE`.
const VECTOR_BASE: u8 = 0xc0;

static_assertions::const_assert!(I_KERNEL_MSG >= VECTOR_BASE && I_KERNEL_MSG - VECTOR_BASE < 64);

/// An interrupt controller that latches IPIs in per-core pending masks,
/// like an IRR, until the target core polls for them.
pub struct LoopbackApic {
    pending: Box<[CachePadded<AtomicU64>]>,
    sent: Box<[CachePadded<AtomicUsize>]>,
}

impl LoopbackApic {
    pub fn new(cores: usize) -> Self {
        let pending: Vec<CachePadded<AtomicU64>> =
            (0..cores).map(|_| CachePadded::new(AtomicU64::new(0))).collect();
        let sent: Vec<CachePadded<AtomicUsize>> =
            (0..cores).map(|_| CachePadded::new(AtomicUsize::new(0))).collect();
        LoopbackApic {
            pending: pending.into_boxed_slice(),
            sent: sent.into_boxed_slice(),
        }
    }

    /// Take the vectors pending on `core` (lowest first).
    pub fn acknowledge(&self, core: CoreId) -> Vec<u8> {
        let mask = match self.pending.get(core) {
            Some(p) => p.swap(0, Ordering::AcqRel),
            None => 0,
        };
        (0..64u8)
            .filter(|bit| mask & (1 << bit) != 0)
            .map(|bit| VECTOR_BASE + bit)
            .collect()
    }

    /// Number of IPIs ever sent to `core`.
    pub fn ipis_sent(&self, core: CoreId) -> usize {
        self.sent
            .get(core)
            .map(|s| s.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn has_pending(&self, core: CoreId) -> bool {
        self.pending
            .get(core)
            .map(|p| p.load(Ordering::Acquire) != 0)
            .unwrap_or(false)
    }
}

impl IpiDriver for LoopbackApic {
    fn send_ipi(&self, dst: CoreId, vector: u8) {
        debug_assert!(vector >= VECTOR_BASE && vector - VECTOR_BASE < 64);
        if let (Some(p), Some(s)) = (self.pending.get(dst), self.sent.get(dst)) {
            trace!("ipi {:#x} -> core {}", vector, dst);
            p.fetch_or(1 << (vector - VECTOR_BASE), Ordering::AcqRel);
            s.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::I_KERNEL_MSG;

    #[test]
    fn latch_and_acknowledge() {
        let apic = LoopbackApic::new(2);
        assert!(!apic.has_pending(1));
        apic.send_ipi(1, I_KERNEL_MSG);
        apic.send_ipi(1, I_KERNEL_MSG);
        assert!(apic.has_pending(1));
        assert_eq!(apic.ipis_sent(1), 2);
        assert_eq!(apic.acknowledge(1), [I_KERNEL_MSG]);
        assert!(apic.acknowledge(1).is_empty());
        assert_eq!(apic.ipis_sent(0), 0);
        // No such core.
        apic.send_ipi(7, I_KERNEL_MSG);
        assert!(apic.acknowledge(7).is_empty());
    }
}
