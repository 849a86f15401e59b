// Copyright 2018 the hostfw developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Minimal mailbox runtime serving one
//! [`TableUpdater`](../updater/struct.TableUpdater.html).
//!
//! Messages queued through a [`Mailbox`](struct.Mailbox.html) are
//! drained greedily into combined batches, which the updater applies as
//! single atomic restores. Messages that need a private batch
//! (`ensure_rule_inserted`, `cleanup`) are never combined with others.
//! When the updater reports that a combined batch failed, the runtime
//! performs the binary chop that isolates the faulty message.

use crossbeam_channel::{self, Receiver, Sender};
use errors::*;
use std::collections::BTreeMap;
use std::mem;
use txn::ChainSet;
use updater::{BatchOutcome, CompletionCallback, Msg, TableUpdater};

/// Create a mailbox for one updater. The [`Mailbox`](struct.Mailbox.html)
/// half is cloneable; pass the receiver to [`run`](fn.run.html).
pub fn channel() -> (Mailbox, Receiver<Msg>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (Mailbox { tx }, rx)
}

/// Cloneable handle used to queue work for an updater.
#[derive(Clone)]
pub struct Mailbox {
    tx: Sender<Msg>,
}

impl Mailbox {
    /// Queue an atomic rewrite of a set of chains. Either every chain in
    /// the call is rewritten, or none is and `callback` receives the
    /// error.
    pub fn rewrite_chains(
        &self,
        updates: BTreeMap<String, Vec<String>>,
        dependencies: BTreeMap<String, ChainSet>,
        callback: Option<CompletionCallback>,
    ) -> Result<()> {
        self.send(Msg::Rewrite {
            updates,
            dependencies,
            callback,
        })
    }

    /// Queue the deletion of a set of chains.
    pub fn delete_chains(&self, chains: ChainSet, callback: Option<CompletionCallback>) -> Result<()> {
        self.send(Msg::Delete { chains, callback })
    }

    /// Queue the insertion of a rule into a pre-existing kernel chain.
    pub fn ensure_rule_inserted(&self, rule_fragment: &str) -> Result<()> {
        self.send(Msg::EnsureRuleInserted {
            rule_fragment: rule_fragment.to_owned(),
        })
    }

    /// Queue a garbage-collection pass.
    pub fn cleanup(&self) -> Result<()> {
        self.send(Msg::Cleanup)
    }

    fn send(&self, msg: Msg) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| format_err!("updater mailbox disconnected"))
    }
}

/// Serve an updater from the receive side of its mailbox until every
/// [`Mailbox`](struct.Mailbox.html) clone has been dropped.
pub fn run(updater: &mut TableUpdater, rx: &Receiver<Msg>) {
    loop {
        let first = match rx.recv() {
            Ok(msg) => msg,
            Err(_) => return,
        };
        let mut pending = vec![first];
        while let Ok(msg) = rx.try_recv() {
            pending.push(msg);
        }
        for batch in partition_batches(pending) {
            dispatch_batch(updater, batch);
        }
    }
}

/// Split a drained message queue into batches, giving each message that
/// needs its own batch a batch of exactly one.
fn partition_batches(msgs: Vec<Msg>) -> Vec<Vec<Msg>> {
    let mut batches: Vec<Vec<Msg>> = Vec::new();
    let mut current: Vec<Msg> = Vec::new();
    for msg in msgs {
        if msg.needs_own_batch() {
            if !current.is_empty() {
                batches.push(mem::replace(&mut current, Vec::new()));
            }
            batches.push(vec![msg]);
        } else {
            current.push(msg);
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Process a batch, splitting and retrying on request.
///
/// When the updater reports a non-retryable failure from a combined
/// batch it hands the messages back untouched; they are halved and each
/// half re-processed as an independent batch, first half first. A clean
/// half commits immediately, so repeated splitting commits every good
/// message and isolates a single faulty one with O(log n) extra restore
/// calls. Results are returned in message-arrival order.
pub fn dispatch_batch(updater: &mut TableUpdater, batch: Vec<Msg>) -> Vec<Result<()>> {
    match updater.process_batch(batch) {
        BatchOutcome::Done(results) => results,
        BatchOutcome::SplitAndRetry(mut batch) => {
            let second_half = batch.split_off(batch.len() / 2);
            let mut results = dispatch_batch(updater, batch);
            results.extend(dispatch_batch(updater, second_half));
            results
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use updater::Msg;

    fn rewrite() -> Msg {
        Msg::Rewrite {
            updates: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            callback: None,
        }
    }

    #[test]
    fn plain_messages_share_one_batch() {
        let batches = partition_batches(vec![rewrite(), rewrite(), rewrite()]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[test]
    fn own_batch_messages_are_isolated() {
        let batches = partition_batches(vec![
            rewrite(),
            Msg::Cleanup,
            rewrite(),
            rewrite(),
            Msg::Cleanup,
        ]);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1, 2, 1]);
        assert!(batches[1][0].needs_own_batch());
        assert!(batches[3][0].needs_own_batch());
    }
}
