// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Hosted "architecture": every simulated core is a thread that polls for
//! the interrupts sent to it.

use core::cell::Cell;

use log::debug;

use kpi::CoreId;

pub mod apic;
pub mod irq;

pub use apic::LoopbackApic;

std::thread_local! {
    static CORE_ID: Cell<CoreId> = Cell::new(0);
}

/// Id of the core the calling thread acts as.
pub fn core_id() -> CoreId {
    CORE_ID.with(|c| c.get())
}

/// Make the calling thread act as core `id`.
pub fn set_core_id(id: CoreId) {
    CORE_ID.with(|c| c.set(id));
}

/// Install the logger with `filter` (`RUST_LOG` syntax, as given by the
/// `log=` command line argument).
pub fn init_logging(filter: &str) {
    let r = env_logger::Builder::new()
        .parse_filters(filter)
        .format_timestamp(None)
        .try_init();
    if r.is_err() {
        debug!("logger was already installed, ignoring log={}", filter);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn core_id_is_per_thread() {
        set_core_id(3);
        assert_eq!(core_id(), 3);
        let other = std::thread::spawn(core_id).join().unwrap();
        assert_eq!(other, 0);
        set_core_id(0);
    }
}
