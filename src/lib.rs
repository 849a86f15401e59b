// Copyright 2018 the hostfw developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Hostfw is a transactional manager for the host's iptables chains.
//!
//! It batches chain rewrites and deletions into single atomic
//! `ip(6)tables-restore` transactions, tracks the dependencies between
//! chains so that jump targets never dangle (required-but-absent chains
//! are created as placeholder stubs that drop all traffic), retries
//! commit-time conflicts caused by concurrent writers, and periodically
//! reconciles its in-memory picture of the dataplane with the kernel's.
//!
//! The crate is organised around one [`TableUpdater`][updater] per
//! `(table, IP version)` pair, fed batches of messages through the
//! mailbox in the [`actor`][actor] module.
//!
//! [updater]: updater/struct.TableUpdater.html
//! [actor]: actor/index.html

#[macro_use]
extern crate failure;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate slog;

extern crate crossbeam_channel;
extern crate rand;
extern crate regex;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate toml;

#[cfg(test)]
#[macro_use]
extern crate maplit;

pub mod actor;
pub mod errors;
pub mod iptables;
pub mod rules;
pub mod txn;
pub mod types;
pub mod updater;
