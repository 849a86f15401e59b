// Copyright 2018 the hostfw developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Per-batch transaction over the updater's dependency indexes.
//!
//! Keeping track of the changes a batch makes, while still being able to
//! roll them back, is fiddly; the updater therefore delegates it to a
//! short-lived [`Transaction`](struct.Transaction.html) that works on
//! copies of the indexes. If the kernel rejects the batch, the whole
//! value is simply dropped and the updater is untouched; on success the
//! copies are swapped in wholesale.
//!
//! `BTreeMap`/`BTreeSet` are used throughout so that the derived sets
//! iterate in a deterministic order, which keeps the generated restore
//! input byte-stable.

use std::collections::{BTreeMap, BTreeSet};

/// Set of chain names.
pub type ChainSet = BTreeSet<String>;

/// Map from chain name to a set of chain names.
pub type DependencyIndex = BTreeMap<String, ChainSet>;

/// Records one batch of rewrites and deletes against a copy of the
/// updater's indexes, and computes the dataplane deltas the batch
/// requires.
pub struct Transaction {
    /// Chains that existed only as stubs when the batch began.
    already_stubbed: ChainSet,
    /// Chain bodies recorded by rewrites in this batch.
    updates: BTreeMap<String, Vec<String>>,
    /// Chains the batch asks to remove.
    deletes: ChainSet,
    explicit_chains: ChainSet,
    required: DependencyIndex,
    required_by: DependencyIndex,
    /// Memoized derived sets; cleared by every store operation.
    deltas: Option<Deltas>,
}

struct Deltas {
    affected: ChainSet,
    to_stub: ChainSet,
    to_delete: ChainSet,
}

impl Transaction {
    /// Start a transaction from the updater's current indexes.
    pub fn new(
        explicit_chains: &ChainSet,
        required: &DependencyIndex,
        required_by: &DependencyIndex,
    ) -> Transaction {
        let already_stubbed = required_by
            .keys()
            .filter(|chain| !explicit_chains.contains(*chain))
            .cloned()
            .collect();
        Transaction {
            already_stubbed,
            updates: BTreeMap::new(),
            deletes: ChainSet::new(),
            explicit_chains: explicit_chains.clone(),
            required: required.clone(),
            required_by: required_by.clone(),
            deltas: None,
        }
    }

    /// Record the rewrite of `chain` with the given body and dependency
    /// set, superseding any deletion recorded earlier in the batch.
    pub fn store_rewrite(&mut self, chain: &str, body: Vec<String>, dependencies: ChainSet) {
        self.update_dependencies(chain, dependencies);
        self.deletes.remove(chain);
        self.updates.insert(chain.to_owned(), body);
        self.explicit_chains.insert(chain.to_owned());
        self.deltas = None;
    }

    /// Record the deletion of `chain`, superseding any rewrite recorded
    /// earlier in the batch.
    pub fn store_delete(&mut self, chain: &str) {
        self.update_dependencies(chain, ChainSet::new());
        self.deletes.insert(chain.to_owned());
        self.updates.remove(chain);
        self.explicit_chains.remove(chain);
        self.deltas = None;
    }

    /// Point `chain`'s forward index at `new_deps`, keeping the reverse
    /// index in lock-step. Reverse entries that become empty are pruned
    /// so `referenced_chains` is exactly the set of chains with inbound
    /// edges.
    fn update_dependencies(&mut self, chain: &str, new_deps: ChainSet) {
        if let Some(old_deps) = self.required.remove(chain) {
            for dep in old_deps {
                let now_empty = match self.required_by.get_mut(&dep) {
                    Some(requiring) => {
                        requiring.remove(chain);
                        requiring.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.required_by.remove(&dep);
                }
            }
        }
        for dep in &new_deps {
            self.required_by
                .entry(dep.clone())
                .or_insert_with(ChainSet::new)
                .insert(chain.to_owned());
        }
        if !new_deps.is_empty() {
            self.required.insert(chain.to_owned(), new_deps);
        }
    }

    /// The chains touched by this batch: rewritten, stubbed, or prepared
    /// for deletion. Each needs its header in the phase-1 restore input.
    pub fn affected_chains(&mut self) -> ChainSet {
        self.deltas().affected.clone()
    }

    /// Chains required by others but neither explicitly programmed nor
    /// already present as stubs.
    pub fn chains_to_stub_out(&mut self) -> ChainSet {
        self.deltas().to_stub.clone()
    }

    /// Chains nothing needs any more, to be removed in phase 2.
    pub fn chains_to_delete(&mut self) -> ChainSet {
        self.deltas().to_delete.clone()
    }

    /// Chains some other chain jumps to.
    pub fn referenced_chains(&self) -> ChainSet {
        self.required_by.keys().cloned().collect()
    }

    /// Bodies recorded by this batch, keyed by chain.
    pub fn updates(&self) -> &BTreeMap<String, Vec<String>> {
        &self.updates
    }

    /// Consume the transaction, yielding the post-batch
    /// `(explicit_chains, required, required_by)` indexes.
    pub fn into_indexes(self) -> (ChainSet, DependencyIndex, DependencyIndex) {
        (self.explicit_chains, self.required, self.required_by)
    }

    fn deltas(&mut self) -> &Deltas {
        if self.deltas.is_none() {
            let referenced = self.referenced_chains();
            let to_stub: ChainSet = referenced
                .difference(&self.explicit_chains)
                .filter(|chain| !self.already_stubbed.contains(*chain))
                .cloned()
                .collect();
            // Chains we would like to be rid of: explicit deletes, plus
            // stubs that may have lost their last referrer...
            let unwanted: ChainSet = self.deletes.union(&self.already_stubbed).cloned().collect();
            // ...minus anything still programmed or still referenced.
            let needed: ChainSet = self.explicit_chains.union(&referenced).cloned().collect();
            let to_delete: ChainSet = unwanted.difference(&needed).cloned().collect();
            let mut affected: ChainSet = self.updates.keys().cloned().collect();
            affected.extend(to_stub.iter().cloned());
            affected.extend(to_delete.iter().cloned());
            self.deltas = Some(Deltas {
                affected,
                to_stub,
                to_delete,
            });
        }
        self.deltas.as_ref().unwrap()
    }
}
