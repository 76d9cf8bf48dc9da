// LNP/BP Core Library implementing LNPBP specifications & standards
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Dispatches [`crate::interfaces::ChainAdapter`] events into the
//! resolution engine and lifecycle state machine, replaying them
//! idempotently by `(outpoint, confirmation_depth)` so the embedding
//! executor may redeliver an event after a crash without double-applying
//! it, and unwinding state on a reorg.
//!
//! Has no grounding-library counterpart (its `Extension` framework is
//! chain-agnostic by design); built from the corpus's chain-sync surveys,
//! generalized into an explicit idempotent replay log rather than the
//! examples' direct, non-replayable dispatch.

use std::collections::BTreeMap;

use bitcoin::{OutPoint, Txid};

use crate::interfaces::{DepthEvent, SpendEvent};
use crate::resolution::{classify, CloseClass, KnownTransactions};

/// Errors from chain-monitor event processing.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// received a spend event for outpoint {0:?}, which this monitor is not
    /// watching
    UntrackedOutpoint(OutPoint),

    /// received a depth event for txid {0}, which this monitor is not
    /// watching
    UntrackedTxid(Txid),
}

/// A transaction observed spending a watched outpoint, along with its
/// classification and the depth at which it was first seen, so a later
/// reorg can be told apart from a brand-new conflicting spend.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
struct ObservedSpend {
    txid: Txid,
    class: CloseClass,
    first_seen_height: Option<u32>,
}

/// Tracks confirmation depth and spend status of every outpoint and txid
/// the channel has asked the chain adapter to watch, dispatching
/// classified events exactly once per distinct observation.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Debug, Default, StrictEncode, StrictDecode)]
pub struct ChainMonitor {
    watched_outpoints: BTreeMap<OutPoint, Option<ObservedSpend>>,
    watched_txids: BTreeMap<Txid, u32>,
    known: KnownTransactions,
}

impl ChainMonitor {
    pub fn new(known: KnownTransactions) -> Self {
        ChainMonitor {
            watched_outpoints: BTreeMap::new(),
            watched_txids: BTreeMap::new(),
            known,
        }
    }

    pub fn watch_outpoint(&mut self, outpoint: OutPoint) {
        self.watched_outpoints.entry(outpoint).or_insert(None);
    }

    pub fn watch_txid(&mut self, txid: Txid) {
        self.watched_txids.entry(txid).or_insert(0);
    }

    pub fn known(&self) -> &KnownTransactions {
        &self.known
    }

    pub fn known_mut(&mut self) -> &mut KnownTransactions {
        &mut self.known
    }

    /// Handles a spend of a watched outpoint. Idempotent: redelivering the
    /// same `(outpoint, spending_tx)` pair is a no-op after the first call.
    /// Returns the classification on first delivery, `None` on replay.
    pub fn handle_spend(
        &mut self,
        event: SpendEvent,
    ) -> Result<Option<CloseClass>, Error> {
        let slot = self
            .watched_outpoints
            .get_mut(&event.outpoint)
            .ok_or(Error::UntrackedOutpoint(event.outpoint))?;

        let txid = event.spending_tx.txid();
        if let Some(existing) = slot {
            if existing.txid == txid {
                return Ok(None);
            }
            // A different transaction now spends this outpoint: a reorg
            // replaced the one we'd previously classified. Re-classify and
            // overwrite.
        }
        let class = classify(&event.spending_tx, &self.known);
        *slot = Some(ObservedSpend { txid, class, first_seen_height: event.height });
        Ok(Some(class))
    }

    /// Handles a confirmation-depth update for a watched txid. Idempotent:
    /// redelivering the same `(txid, depth)` pair returns `false`
    /// (nothing changed) rather than `true`.
    pub fn handle_depth(&mut self, event: DepthEvent) -> Result<bool, Error> {
        let slot = self
            .watched_txids
            .get_mut(&event.txid)
            .ok_or(Error::UntrackedTxid(event.txid))?;
        if *slot == event.depth {
            return Ok(false);
        }
        *slot = event.depth;
        Ok(true)
    }

    /// Handles a reorg that unconfirms a previously observed spend: resets
    /// the outpoint back to unspent so the next `handle_spend` delivery is
    /// treated as fresh rather than a replay.
    pub fn handle_reorg_unconfirm(&mut self, outpoint: OutPoint) {
        if let Some(slot) = self.watched_outpoints.get_mut(&outpoint) {
            *slot = None;
        }
    }

    pub fn depth(&self, txid: Txid) -> Option<u32> {
        self.watched_txids.get(&txid).copied()
    }

    pub fn spend_class(&self, outpoint: OutPoint) -> Option<CloseClass> {
        self.watched_outpoints
            .get(&outpoint)
            .and_then(|o| o.as_ref())
            .map(|o| o.class)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::{Transaction, TxIn, TxOut, Witness};

    use super::*;

    fn outpoint() -> OutPoint {
        OutPoint::new(
            Txid::from_str(
                "fd2105607605d2302994ffea703b09f66b6351816ee737a93e42a841ea20bbad",
            )
            .unwrap(),
            0,
        )
    }

    fn tx(seed: u8) -> Transaction {
        Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: Default::default(),
                sequence: 0,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: seed as u64, script_pubkey: Default::default() }],
        }
    }

    #[test]
    fn spend_event_replay_is_idempotent() {
        let mut monitor = ChainMonitor::new(KnownTransactions::default());
        monitor.watch_outpoint(outpoint());
        let spending_tx = tx(1);
        let event = SpendEvent { outpoint: outpoint(), spending_tx: spending_tx.clone(), height: Some(100) };

        let first = monitor.handle_spend(event.clone()).unwrap();
        assert!(first.is_some());
        let replay = monitor.handle_spend(event).unwrap();
        assert_eq!(replay, None);
    }

    #[test]
    fn reorg_reclassifies_a_new_spend() {
        let mut monitor = ChainMonitor::new(KnownTransactions::default());
        monitor.watch_outpoint(outpoint());
        monitor
            .handle_spend(SpendEvent { outpoint: outpoint(), spending_tx: tx(1), height: Some(100) })
            .unwrap();
        monitor.handle_reorg_unconfirm(outpoint());
        let result = monitor
            .handle_spend(SpendEvent { outpoint: outpoint(), spending_tx: tx(2), height: Some(101) })
            .unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn depth_event_replay_reports_no_change() {
        let mut monitor = ChainMonitor::new(KnownTransactions::default());
        let txid = tx(1).txid();
        monitor.watch_txid(txid);
        assert!(monitor.handle_depth(DepthEvent { txid, depth: 3 }).unwrap());
        assert!(!monitor.handle_depth(DepthEvent { txid, depth: 3 }).unwrap());
        assert!(monitor.handle_depth(DepthEvent { txid, depth: 6 }).unwrap());
    }

    #[test]
    fn untracked_outpoint_is_rejected() {
        let mut monitor = ChainMonitor::new(KnownTransactions::default());
        let result = monitor.handle_spend(SpendEvent {
            outpoint: outpoint(),
            spending_tx: tx(1),
            height: None,
        });
        assert!(matches!(result, Err(Error::UntrackedOutpoint(_))));
    }
}
