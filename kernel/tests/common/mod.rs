// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runs a kernel with one thread per physical core.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mcpk::arch::set_core_id;
use mcpk::cmdline::CommandLineArguments;
use mcpk::Kernel;

pub fn init_logging(args: &CommandLineArguments) {
    let _r = env_logger::Builder::new()
        .parse_filters(args.log_filter)
        .is_test(true)
        .try_init();
}

/// A kernel whose cores 1.. are driven by threads; core 0 is the test.
pub struct Machine {
    pub kernel: Arc<Kernel>,
    stop: Arc<AtomicBool>,
    cores: Vec<JoinHandle<()>>,
}

impl Machine {
    pub fn boot(cmdline: &'static str) -> Machine {
        let args = CommandLineArguments::from_str(cmdline).expect("Can't parse cmdline");
        init_logging(&args);
        let kernel = Arc::new(Kernel::new(args).expect("Can't boot kernel"));
        set_core_id(0);

        let stop = Arc::new(AtomicBool::new(false));
        let cores = (1..kernel.nr_cores())
            .map(|core| {
                let kernel = kernel.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    set_core_id(core);
                    while !stop.load(Ordering::Acquire) {
                        kernel.poll_interrupts(core);
                        kernel.smp_idle(core);
                        thread::yield_now();
                    }
                })
            })
            .collect();

        Machine {
            kernel,
            stop,
            cores,
        }
    }

    /// Spin until `cond` holds; fails the test after a few seconds.
    pub fn wait_for<F: Fn(&Kernel) -> bool>(&self, what: &str, cond: F) {
        let start = Instant::now();
        while !cond(&self.kernel) {
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "Timed out waiting for {}",
                what
            );
            thread::yield_now();
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for core in self.cores.drain(..) {
            let _ = core.join();
        }
    }
}
