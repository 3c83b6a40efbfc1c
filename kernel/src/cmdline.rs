// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Kernel command line parser.

use log::error;
use logos::Logos;

use crate::error::{KError, KResult};

/// Definition to parse the kernel command-line arguments.
#[derive(Logos, Debug, PartialEq, Clone, Copy)]
enum CmdToken {
    /// Kernel binary name
    #[regex("./[a-zA-Z]+")]
    KernelBinary,

    /// Kernel log filter
    #[token("log")]
    Log,

    /// Number of physical cores.
    #[token("cores")]
    Cores,

    /// Vcore slots in the procdata of every process.
    #[token("vcores")]
    Vcores,

    /// Pages in the pool of each vcore mailbox.
    #[token("ucqpages")]
    UcqPages,

    /// Extra UCQ pages before we start warning.
    #[token("ucqwarn")]
    UcqWarn,

    /// Attempts to enqueue into a BCQ mailbox.
    #[token("bcqloops")]
    BcqLoops,

    /// Attempts to claim a CEQ ring slot.
    #[token("ceqtries")]
    CeqTries,

    #[regex("[a-zA-Z0-9\\._-]*")]
    Ident,

    #[token("=", priority = 22)]
    KVSeparator,

    #[regex(r#"'([^'\\]|\\t|\\u|\\n|[0-9a-zA-Z:.,_=]*|\\')*'"#)]
    LiteralString,

    /// Anything not properly encoded
    #[error]
    #[regex(r"[ ]+", logos::skip)]
    Error,
}

impl CmdToken {
    fn is_key(&self) -> bool {
        matches!(
            self,
            CmdToken::Log
                | CmdToken::Cores
                | CmdToken::Vcores
                | CmdToken::UcqPages
                | CmdToken::UcqWarn
                | CmdToken::BcqLoops
                | CmdToken::CeqTries
        )
    }
}

/// Arguments parsed from the command line passed to the kernel.
#[derive(Copy, Clone, Debug)]
pub struct CommandLineArguments {
    pub log_filter: &'static str,
    pub cores: usize,
    pub vcores: usize,
    pub ucq_pages: usize,
    pub ucq_warn_thresh: u32,
    pub bcq_ev_loops: u32,
    pub ceq_ring_tries: usize,
}

impl Default for CommandLineArguments {
    fn default() -> Self {
        Self {
            log_filter: "info",
            cores: 4,
            vcores: 8,
            ucq_pages: kpi::procdata::VCPD_UCQ_PAGES,
            ucq_warn_thresh: 1000,
            bcq_ev_loops: 4,
            ceq_ring_tries: 10,
        }
    }
}

impl CommandLineArguments {
    fn set(&mut self, key: CmdToken, value: &'static str) -> bool {
        let d = CommandLineArguments::default();
        match key {
            CmdToken::Log => self.log_filter = value,
            CmdToken::Cores => self.cores = value.parse::<usize>().unwrap_or(d.cores),
            CmdToken::Vcores => self.vcores = value.parse::<usize>().unwrap_or(d.vcores),
            CmdToken::UcqPages => self.ucq_pages = value.parse::<usize>().unwrap_or(d.ucq_pages),
            CmdToken::UcqWarn => {
                self.ucq_warn_thresh = value.parse::<u32>().unwrap_or(d.ucq_warn_thresh)
            }
            CmdToken::BcqLoops => {
                self.bcq_ev_loops = value.parse::<u32>().unwrap_or(d.bcq_ev_loops)
            }
            CmdToken::CeqTries => {
                self.ceq_ring_tries = value.parse::<usize>().unwrap_or(d.ceq_ring_tries)
            }
            _ => return false,
        }
        true
    }

    /// Parse command line arguments.
    ///
    /// Example: If args is './kernel log=trace cores=8' -> sets log filter
    /// to trace and runs with 8 cores.
    pub fn from_str(args: &'static str) -> KResult<Self> {
        let mut parsed_args: CommandLineArguments = Default::default();
        let mut lexer = CmdToken::lexer(args);
        let mut prev = CmdToken::Error;
        let mut last = CmdToken::Error;
        while let Some(token) = lexer.next() {
            let slice = lexer.slice();

            match token {
                CmdToken::KernelBinary => {}
                key @ (CmdToken::Log
                | CmdToken::Cores
                | CmdToken::Vcores
                | CmdToken::UcqPages
                | CmdToken::UcqWarn
                | CmdToken::BcqLoops
                | CmdToken::CeqTries) => {
                    prev = key;
                }
                CmdToken::Ident => {
                    if !parsed_args.set(prev, slice) {
                        error!("Invalid cmd arguments: {} (skipped {})", args, slice);
                        return Err(KError::InvalidCmdLineOptions);
                    }
                    prev = CmdToken::Error;
                }
                CmdToken::KVSeparator => {
                    if !prev.is_key() || last == CmdToken::KVSeparator {
                        error!(
                            "Malformed args (unexpected equal sign) in `{}` previous token was {:?}",
                            args, prev
                        );
                        return Err(KError::MalformedCmdLine);
                    }
                }
                CmdToken::LiteralString => {
                    // We strip the quotes with 1..slice.len()-1
                    let slice_no_quote = &slice[1..slice.len() - 1];
                    if !parsed_args.set(prev, slice_no_quote) {
                        error!("Invalid cmd arguments: {} (skipped {})", args, slice);
                        continue;
                    }
                    prev = CmdToken::Error;
                }
                CmdToken::Error => {
                    error!(
                        "Malformed commandline! Encoutered '{}' while parsing cmd args: {}",
                        slice, args
                    );
                    return Err(KError::MalformedCmdLine);
                }
            }
            last = token;
        }

        Ok(parsed_args)
    }
}
