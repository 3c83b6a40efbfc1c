// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Defines the public kernel interface: the data-types and shared-memory
//! layouts that the kernel and user-space agree on.
//!
//! Everything in here lives in memory that user-space can write to. The
//! kernel side never trusts the contents and validates every location it
//! derives from these structures before touching it.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bcq;
pub mod ceq;
pub mod event;
pub mod procdata;
pub mod process;
pub mod ucq;

/// Size of a base page (the unit of memory the UCQ chains together).
pub const BASE_PAGE_SIZE: usize = 4096;

/// Identifier of a physical core.
pub type CoreId = usize;

/// Identifier of a virtual core within a process.
pub type VcoreId = usize;

/// Process identifier.
pub type Pid = usize;
