// Copyright 2018 the hostfw developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The long-lived coordinator that owns one iptables table.

use errors::*;
use iptables::{self, IPVersion, IptablesBackend, IptablesProcess};
use rand::Rng;
use rules;
use slog::Logger;
use std::collections::{BTreeMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};
use txn::{ChainSet, DependencyIndex, Transaction};

/// Maximum number of times one restore input is submitted before the
/// retry loop gives up.
pub const MAX_RESTORE_RETRIES: u32 = 10;

const INITIAL_BACKOFF_SECS: f64 = 0.01;
const MAX_BACKOFF_SECS: f64 = 0.2;

/// Callback invoked once the message's batch commits or fails for good:
/// `None` on success, the error otherwise.
pub type CompletionCallback = Box<dyn FnMut(Option<&::failure::Error>) + Send>;

/// A unit of work processed by a [`TableUpdater`](struct.TableUpdater.html)
/// batch.
pub enum Msg {
    /// Atomically rewrite a set of chains and record their dependencies.
    Rewrite {
        /// Map from chain name to the rule fragments to program under
        /// it. A flush of the chain is prepended automatically.
        updates: BTreeMap<String, Vec<String>>,
        /// Map from chain name to the chains its body jumps to. Targets
        /// that do not exist are created as stubs.
        dependencies: BTreeMap<String, ChainSet>,
        /// Invoked when the rewrite finally commits or fails.
        callback: Option<CompletionCallback>,
    },
    /// Delete chains. A chain that is still referenced by a surviving
    /// chain is demoted to a stub instead of being removed.
    Delete {
        /// The chains to delete.
        chains: ChainSet,
        /// Invoked when the deletion finally commits or fails.
        callback: Option<CompletionCallback>,
    },
    /// Insert a rule at the top of a pre-existing kernel chain (not one
    /// of ours), moving it there if it is already present further down.
    EnsureRuleInserted {
        /// Rule fragment, e.g. `"INPUT --jump hostfw-input"`.
        rule_fragment: String,
    },
    /// Reconcile the index against the dataplane and delete orphaned
    /// chains. The first cleanup ends the graceful restart window.
    Cleanup,
}

impl Msg {
    /// Whether this message must not share a batch with any other.
    /// `EnsureRuleInserted` manipulates a chain we do not own and
    /// `Cleanup` must not race in-flight updates, so both take a private
    /// batch.
    pub fn needs_own_batch(&self) -> bool {
        match *self {
            Msg::EnsureRuleInserted { .. } | Msg::Cleanup => true,
            Msg::Rewrite { .. } | Msg::Delete { .. } => false,
        }
    }

    fn take_callback(&mut self) -> Option<CompletionCallback> {
        match *self {
            Msg::Rewrite { ref mut callback, .. } | Msg::Delete { ref mut callback, .. } => {
                callback.take()
            }
            Msg::EnsureRuleInserted { .. } | Msg::Cleanup => None,
        }
    }
}

/// Result of processing one batch.
pub enum BatchOutcome {
    /// Every message was handled; per-message results in arrival order.
    Done(Vec<Result<()>>),
    /// A combined batch failed non-retryably. The updater's state is
    /// unchanged and the messages are handed back; the runtime must
    /// split them in half and re-process each half (see
    /// [`actor::dispatch_batch`](../actor/fn.dispatch_batch.html)).
    SplitAndRetry(Vec<Msg>),
}

/// Owns and applies updates to a single iptables table.
///
/// The underlying iptables architecture does not allow concurrent access
/// to one table, so exactly one `TableUpdater` exists per `(table, IP
/// version)` pair. External processes may still write to the same table;
/// the kernel surfaces that as a failure on the COMMIT line, which the
/// updater absorbs by retrying with backoff.
///
/// Updates are applied in batches: every message in a batch is folded
/// into one [`Transaction`](../txn/struct.Transaction.html) and applied
/// as a single atomic restore, which is dramatically faster than issuing
/// individual requests. If a combined batch fails, the messages are
/// handed back to the runtime for a binary chop that pinpoints the
/// faulty message.
///
/// The updater tracks dependencies between chains. Callers declare which
/// chains each rewritten chain jumps to; any required-but-absent target
/// is created as a placeholder stub that drops all traffic. A stub is
/// replaced when the real chain is programmed, re-created if a
/// still-referenced chain is deleted, and cleaned up once nothing
/// references it.
pub struct TableUpdater {
    log: Logger,
    table: String,
    backend: Box<dyn IptablesBackend>,
    /// Owned chains we believe are in the dataplane right now. Loaded at
    /// start of day and kept in sync from then on.
    dataplane_chains: ChainSet,
    /// Chains the caller has explicitly programmed (not merely stubbed).
    explicit_chains: ChainSet,
    /// Chain -> the chains its body jumps to.
    required: DependencyIndex,
    /// Chain -> the chains whose bodies jump to it. Exact transpose of
    /// `required`.
    required_by: DependencyIndex,
    /// False until the first cleanup ends the graceful restart window.
    /// While false, pre-existing chains are reused rather than stubbed,
    /// giving a zero-disruption handover across process restarts.
    grace_done: bool,
}

impl TableUpdater {
    /// Create an updater backed by the real kernel commands, reading the
    /// current dataplane contents.
    pub fn new(table: &str, ip_version: IPVersion, log: &Logger) -> Result<TableUpdater> {
        TableUpdater::with_backend(
            table,
            ip_version,
            Box::new(IptablesProcess::new(ip_version)),
            log,
        )
    }

    /// Create an updater with a caller-supplied backend.
    pub fn with_backend(
        table: &str,
        ip_version: IPVersion,
        backend: Box<dyn IptablesBackend>,
        log: &Logger,
    ) -> Result<TableUpdater> {
        let log = log.new(o!(
            "table" => table.to_owned(),
            "ip_version" => ip_version.qualifier(),
        ));
        let mut updater = TableUpdater {
            log,
            table: table.to_owned(),
            backend,
            dataplane_chains: ChainSet::new(),
            explicit_chains: ChainSet::new(),
            required: DependencyIndex::new(),
            required_by: DependencyIndex::new(),
            grace_done: false,
        };
        updater.refresh_dataplane_chains()?;
        Ok(updater)
    }

    /// Owned chains believed to exist in the kernel now.
    pub fn dataplane_chains(&self) -> &ChainSet {
        &self.dataplane_chains
    }

    /// Chains the caller has explicitly programmed.
    pub fn explicit_chains(&self) -> &ChainSet {
        &self.explicit_chains
    }

    /// Forward dependency index.
    pub fn required(&self) -> &DependencyIndex {
        &self.required
    }

    /// Reverse dependency index.
    pub fn required_by(&self) -> &DependencyIndex {
        &self.required_by
    }

    /// Whether the graceful restart window has ended.
    pub fn grace_done(&self) -> bool {
        self.grace_done
    }

    /// Process one batch of messages.
    ///
    /// A message for which [`Msg::needs_own_batch`](enum.Msg.html) is
    /// true must arrive in a batch of exactly one; the mailbox runtime
    /// guarantees this.
    pub fn process_batch(&mut self, mut batch: Vec<Msg>) -> BatchOutcome {
        if batch.len() == 1 && batch[0].needs_own_batch() {
            let result = match batch.remove(0) {
                Msg::EnsureRuleInserted { rule_fragment } => {
                    self.ensure_rule_inserted(&rule_fragment)
                }
                Msg::Cleanup => self.cleanup(),
                msg => {
                    batch.push(msg);
                    return self.process_update_batch(batch);
                }
            };
            return BatchOutcome::Done(vec![result]);
        }
        self.process_update_batch(batch)
    }

    fn process_update_batch(&mut self, mut batch: Vec<Msg>) -> BatchOutcome {
        let start = Instant::now();

        // Fold every message into a fresh transaction; the dataplane is
        // not touched until the whole batch is recorded.
        let mut txn = Transaction::new(&self.explicit_chains, &self.required, &self.required_by);
        for msg in &batch {
            match *msg {
                Msg::Rewrite {
                    ref updates,
                    ref dependencies,
                    ..
                } => {
                    for (chain, fragments) in updates {
                        debug!(self.log, "recording chain rewrite"; "chain" => chain.as_str());
                        let mut body = Vec::with_capacity(fragments.len() + 1);
                        body.push(rules::flush_fragment(chain));
                        body.extend(fragments.iter().cloned());
                        let deps = dependencies
                            .get(chain)
                            .cloned()
                            .unwrap_or_else(ChainSet::new);
                        txn.store_rewrite(chain, body, deps);
                    }
                }
                Msg::Delete { ref chains, .. } => {
                    debug!(self.log, "recording chain deletions";
                           "chains" => format!("{:?}", chains));
                    for chain in chains {
                        txn.store_delete(chain);
                    }
                }
                Msg::EnsureRuleInserted { .. } | Msg::Cleanup => {
                    unreachable!("message requiring its own batch mixed into an update batch")
                }
            }
        }

        // Phase 1: create, rewrite and stub chains in one atomic
        // restore. Chains headed for deletion are stubbed here too, so
        // they are safe even if the later delete fails.
        let commit = match self.build_modify_input(&mut txn) {
            None => {
                debug!(self.log, "no dataplane updates in this batch");
                Ok(())
            }
            Some(input_lines) => match self.execute_restore(&input_lines, false) {
                Ok(()) => {
                    self.dataplane_chains.extend(txn.affected_chains());
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        match commit {
            Ok(()) => {
                let chains_to_delete = txn.chains_to_delete();
                let (explicit, required, required_by) = txn.into_indexes();
                self.explicit_chains = explicit;
                self.required = required;
                self.required_by = required_by;
                // Phase 2: best effort only. A failure here means some
                // chain outside our view still references the target;
                // the next cleanup will reconsider it.
                self.delete_best_effort(&chains_to_delete);
                let batch_len = batch.len();
                for msg in &mut batch {
                    if let Some(mut callback) = msg.take_callback() {
                        callback(None);
                    }
                }
                debug!(self.log, "batch committed";
                       "batch_size" => batch_len,
                       "elapsed_ms" => start.elapsed().as_millis() as u64);
                BatchOutcome::Done((0..batch_len).map(|_| Ok(())).collect())
            }
            Err(e) => {
                if batch.len() == 1 {
                    error!(self.log, "non-retryable failure applying batch";
                           "error" => format!("{}", e));
                    if let Some(mut callback) = batch[0].take_callback() {
                        callback(Some(&e));
                    }
                    BatchOutcome::Done(vec![Err(e)])
                } else {
                    warn!(self.log,
                          "non-retryable failure from a combined batch, \
                           splitting to narrow down the culprit";
                          "batch_size" => batch.len());
                    BatchOutcome::SplitAndRetry(batch)
                }
            }
        }
    }

    /// Insert `rule_fragment` at position 1 of a pre-existing kernel
    /// chain. Implemented as an atomic delete + insert so that a rule
    /// already present further down is moved to the top; if the delete
    /// half fails because the rule was absent, a plain insert follows.
    pub fn ensure_rule_inserted(&mut self, rule_fragment: &str) -> Result<()> {
        info!(self.log, "moving rule to top of chain if present";
              "rule" => rule_fragment);
        let delete_and_insert = vec![
            format!("*{}", self.table),
            format!("--delete {}", rule_fragment),
            format!("--insert {}", rule_fragment),
            "COMMIT".to_owned(),
        ];
        match self.execute_restore(&delete_and_insert, true) {
            Ok(()) => Ok(()),
            Err(_) => {
                info!(self.log, "rule was not present, inserting it";
                      "rule" => rule_fragment);
                let insert_only = vec![
                    format!("*{}", self.table),
                    format!("--insert {}", rule_fragment),
                    "COMMIT".to_owned(),
                ];
                self.execute_restore(&insert_only, false)
            }
        }
    }

    /// Reconcile the in-memory index with the dataplane: end the
    /// graceful restart window by stubbing required-but-unprogrammed
    /// chains, then delete unreferenced chains nobody needs until a
    /// fixed point is reached.
    ///
    /// Returns an
    /// [`InconsistentDataplane`](../errors/enum.HostfwError.html) error
    /// if a chain we believe must exist is missing afterwards.
    pub fn cleanup(&mut self) -> Result<()> {
        info!(self.log, "cleaning up left-over chains");
        self.refresh_dataplane_chains()?;

        let required_chains: ChainSet = self.required_by.keys().cloned().collect();
        if !self.grace_done {
            // During the graceful restart window we may have re-used old
            // chains; make sure everything required but not explicitly
            // programmed is a proper stub before we start deleting.
            let to_stub: ChainSet = required_chains
                .difference(&self.explicit_chains)
                .cloned()
                .collect();
            info!(self.log, "graceful restart window finished";
                  "stubbing" => format!("{:?}", to_stub));
            self.stub_out_chains(&to_stub)?;
            self.grace_done = true;
        }

        let mut attempted = ChainSet::new();
        let mut deleted = 0;
        loop {
            // Deleting one round of orphans can unreference another, so
            // loop until nothing new shows up.
            let unreferenced = self.read_unreferenced_chains()?;
            let orphans: ChainSet = unreferenced
                .iter()
                .filter(|chain| {
                    !self.explicit_chains.contains(*chain) && !required_chains.contains(*chain)
                })
                .cloned()
                .collect();
            if orphans.iter().all(|chain| attempted.contains(chain)) {
                info!(self.log, "cleanup finished";
                      "deleted" => deleted,
                      "not_deleted" => format!("{:?}", orphans));
                break;
            }
            info!(self.log, "cleanup found unreferenced chains";
                  "orphans" => format!("{:?}", orphans));
            attempted.extend(orphans.iter().cloned());
            deleted += self.delete_best_effort(&orphans);
        }

        let believed = self.dataplane_chains.clone();
        self.refresh_dataplane_chains()?;
        if believed != self.dataplane_chains {
            // Worth knowing about, but not fatal on its own.
            error!(self.log, "dataplane inconsistent with calculated index";
                   "unexpected" => format!("{:?}",
                       self.dataplane_chains.difference(&believed).collect::<Vec<_>>()),
                   "missing" => format!("{:?}",
                       believed.difference(&self.dataplane_chains).collect::<Vec<_>>()));
        }

        let missing: ChainSet = self
            .explicit_chains
            .union(&required_chains)
            .filter(|chain| !self.dataplane_chains.contains(*chain))
            .cloned()
            .collect();
        if !missing.is_empty() {
            error!(self.log, "owned chains disappeared from the dataplane";
                   "chains" => format!("{:?}", missing));
            return Err(HostfwError::InconsistentDataplane { chains: missing }.into());
        }
        Ok(())
    }

    /// Try to delete all the given chains, swallowing errors. Failing
    /// sub-batches are split in half and requeued, first half first, so
    /// a single stubborn chain only aborts its own deletion. Returns the
    /// number of chains actually deleted.
    fn delete_best_effort(&mut self, chains: &ChainSet) -> usize {
        if chains.is_empty() {
            return 0;
        }
        let mut deleted = 0;
        let mut pending: VecDeque<Vec<String>> = VecDeque::new();
        pending.push_back(chains.iter().cloned().collect());
        while let Some(sub_batch) = pending.pop_front() {
            debug!(self.log, "attempting to delete chains";
                   "chains" => format!("{:?}", sub_batch));
            match self.attempt_delete(&sub_batch) {
                Ok(()) => {
                    deleted += sub_batch.len();
                    debug!(self.log, "deleted chains";
                           "chains" => format!("{:?}", sub_batch),
                           "remaining_batches" => pending.len());
                }
                Err(e) => {
                    warn!(self.log, "failed to delete chains";
                          "chains" => format!("{:?}", sub_batch),
                          "error" => format!("{}", e));
                    if sub_batch.len() > 1 {
                        let mut first_half = sub_batch;
                        let second_half = first_half.split_off(first_half.len() / 2);
                        pending.push_front(second_half);
                        pending.push_front(first_half);
                    } else {
                        error!(self.log,
                               "failed to delete chain, giving up; \
                                maybe it is still referenced";
                               "chain" => sub_batch[0].as_str());
                    }
                }
            }
        }
        deleted
    }

    fn attempt_delete(&mut self, chains: &[String]) -> Result<()> {
        match self.build_delete_input(chains) {
            None => {
                debug!(self.log, "no chains to delete");
                Ok(())
            }
            Some(input_lines) => {
                self.execute_restore(&input_lines, true)?;
                for chain in chains {
                    self.dataplane_chains.remove(chain);
                }
                Ok(())
            }
        }
    }

    fn stub_out_chains(&mut self, chains: &ChainSet) -> Result<()> {
        match self.build_stub_input(chains) {
            None => Ok(()),
            Some(input_lines) => self.execute_restore(&input_lines, false),
        }
    }

    /// Build the phase-1 restore input: chain headers (create-or-flush),
    /// stub bodies, and the recorded rewrites. `None` if the batch needs
    /// no modify operations.
    fn build_modify_input(&self, txn: &mut Transaction) -> Option<Vec<String>> {
        let affected = txn.affected_chains();
        let to_stub = txn.chains_to_stub_out();
        let to_delete = txn.chains_to_delete();

        let mut input_lines = Vec::new();
        for chain in &affected {
            // During the graceful restart window, a chain that is
            // already in the dataplane and is only being stubbed is left
            // as-is.
            if self.grace_done
                || !self.dataplane_chains.contains(chain)
                || !to_stub.contains(chain)
            {
                input_lines.push(format!(":{} -", chain));
            }
        }
        for chain in &to_stub {
            if self.grace_done || !self.dataplane_chains.contains(chain) {
                input_lines.extend(rules::stub_fragments(chain));
            }
        }
        for chain in &to_delete {
            // Stub before deleting: if the delete later fails because
            // the chain is still referenced, the chain is at least safe
            // and no longer keeps other chains alive.
            input_lines.extend(rules::stub_fragments(chain));
        }
        for fragments in txn.updates().values() {
            input_lines.extend(fragments.iter().cloned());
        }
        if input_lines.is_empty() {
            return None;
        }

        let mut lines = Vec::with_capacity(input_lines.len() + 2);
        lines.push(format!("*{}", self.table));
        lines.extend(input_lines);
        lines.push("COMMIT".to_owned());
        Some(lines)
    }

    /// Build the phase-2 restore input that actually deletes chains.
    /// `None` if there is nothing to delete.
    fn build_delete_input(&self, chains: &[String]) -> Option<Vec<String>> {
        if chains.is_empty() {
            return None;
        }
        let mut lines = vec![format!("*{}", self.table)];
        for chain in chains {
            lines.push(format!(":{} -", chain));
            lines.push(format!("--delete-chain {}", chain));
        }
        lines.push("COMMIT".to_owned());
        Some(lines)
    }

    /// Build a restore input replacing each of the given chains with a
    /// stub. `None` if the set is empty.
    fn build_stub_input(&self, chains: &ChainSet) -> Option<Vec<String>> {
        if chains.is_empty() {
            return None;
        }
        let mut lines = vec![format!("*{}", self.table)];
        for chain in chains {
            lines.push(format!(":{} -", chain));
            lines.extend(rules::stub_fragments(chain));
        }
        lines.push("COMMIT".to_owned());
        Some(lines)
    }

    /// Submit one restore input, retrying commit conflicts with jittered
    /// exponential backoff. Structural failures and subprocess errors
    /// are returned immediately.
    fn execute_restore(&mut self, input_lines: &[String], fail_quietly: bool) -> Result<()> {
        let log = self.log.new(o!("correlator" => iptables::next_correlator()));
        let input = format!("{}\n", input_lines.join("\n"));
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut num_tries = 0;
        loop {
            debug!(log, "submitting restore input"; "input" => input.as_str());
            let output = self.backend.restore(&input)?;
            if output.success() {
                return Ok(());
            }
            let (retryable, detail) =
                iptables::classify_restore_error(input_lines, &output.stderr);
            num_tries += 1;
            if retryable && num_tries < MAX_RESTORE_RETRIES {
                info!(log, "restore hit a retryable error, backing off";
                      "detail" => detail.as_str(), "backoff_secs" => backoff);
                if backoff > MAX_BACKOFF_SECS {
                    backoff = MAX_BACKOFF_SECS;
                }
                thread::sleep(Duration::from_millis((backoff * 1000.0) as u64));
                backoff *= 1.5 + ::rand::thread_rng().gen::<f64>();
                continue;
            }
            if fail_quietly {
                debug!(log, "restore failed";
                       "detail" => detail.as_str(), "tries" => num_tries);
            } else {
                error!(log, "restore failed";
                       "detail" => detail.as_str(),
                       "tries" => num_tries,
                       "stdout" => output.stdout.as_str(),
                       "stderr" => output.stderr.as_str());
            }
            return output.into_result().map(|_| ());
        }
    }

    fn refresh_dataplane_chains(&mut self) -> Result<()> {
        let output = self.backend.save_table(&self.table)?.into_result()?;
        self.dataplane_chains = iptables::extract_owned_chains(&self.table, &output.stdout);
        Ok(())
    }

    fn read_unreferenced_chains(&mut self) -> Result<ChainSet> {
        let output = self.backend.list_table(&self.table)?.into_result()?;
        Ok(iptables::extract_unreferenced_chains(&output.stdout))
    }
}
