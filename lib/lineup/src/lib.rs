// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! User-space side of the kernel event interface: consumers for the event
//! queues the kernel produces into, and the machinery that dispatches their
//! messages to a user-level scheduler.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod ceq;
pub mod event;
pub mod ucq;

pub use event::{EventHandler, EventHandlers};
