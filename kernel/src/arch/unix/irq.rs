// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::sync::atomic::{AtomicBool, Ordering};

/// Interrupts of a core stay disabled while this is alive; the previous
/// state is restored on drop.
pub struct IrqGuard<'a> {
    enabled: &'a AtomicBool,
    was_enabled: bool,
}

/// Disable the interrupts `enabled` describes and remember whether they
/// were on.
pub fn disable_irqsave(enabled: &AtomicBool) -> IrqGuard<'_> {
    let was_enabled = enabled.swap(false, Ordering::AcqRel);
    IrqGuard {
        enabled,
        was_enabled,
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.enabled.store(true, Ordering::Release);
        }
    }
}
