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

//! Classifies an observed spend of the funding or a commitment output
//! against the set of transactions the channel itself could have produced,
//! and extracts payment preimages revealed on-chain.
//!
//! The grounding library has no counterpart (its `Extension` framework
//! defers all on-chain classification to the embedding application), so
//! this module is grounded in the broader corpus's on-chain tracking
//! surveys (`ariard-rust-lightning`'s `onchain_utils.rs` close/HTLC
//! classification and `sr-gi-ldk-sample`'s `tower.rs` breach watch),
//! generalized into an explicit, ordered rule list rather than the
//! surveyed code's ad hoc branching.

use bitcoin::hashes::sha256;
use bitcoin::{OutPoint, Transaction, Txid};

use crate::htlc::HtlcId;

/// How an observed spend of a channel output has been classified.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum CloseClass {
    /// The cooperative closing transaction both sides signed.
    #[display("mutual_close")]
    MutualClose,
    /// Our own unilateral (force-)close commitment transaction.
    #[display("local_unilateral")]
    LocalUnilateral,
    /// The peer's latest (non-revoked) commitment transaction.
    #[display("remote_unilateral")]
    RemoteUnilateral,
    /// A revoked commitment transaction the peer broadcast; justice
    /// applies.
    #[display("revoked_remote_unilateral")]
    RevokedRemoteUnilateral,
    /// An HTLC-success second-stage transaction spending one of our
    /// outputs.
    #[display("htlc_success")]
    HtlcSuccess,
    /// An HTLC-timeout second-stage transaction spending one of our
    /// outputs.
    #[display("htlc_timeout")]
    HtlcTimeout,
    /// A penalty transaction we (or the peer) broadcast against a revoked
    /// commitment.
    #[display("penalty")]
    Penalty,
    /// Spent by a transaction not recognized as any of the above; may be a
    /// third-party sweep of an output we no longer control, or a format we
    /// don't understand.
    #[display("unknown")]
    Unknown,
}

/// Errors from resolution classification.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// outpoint {0:?} was not a tracked channel output
    UntrackedOutpoint(OutPoint),

    /// classification of {0} is inconsistent with a prior classification
    /// of the same outpoint; this is a bug in the chain monitor's replay
    Reclassified(OutPoint),
}

/// One channel output under resolution: the txid/vout the chain monitor is
/// watching, what it resolves to once classified, and, if it is an HTLC
/// output, the id it resolves.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct PendingResolution {
    pub outpoint: OutPoint,
    pub htlc_id: Option<HtlcId>,
    pub class: Option<CloseClass>,
    pub resolving_tx: Option<Txid>,
    /// Preimage recovered from the witness of `resolving_tx`, if this was
    /// an HTLC-success spend.
    pub preimage: Option<[u8; 32]>,
}

impl PendingResolution {
    pub fn new(outpoint: OutPoint, htlc_id: Option<HtlcId>) -> Self {
        PendingResolution {
            outpoint,
            htlc_id,
            class: None,
            resolving_tx: None,
            preimage: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.class.is_some()
    }
}

/// Transactions this channel could itself have produced for the outpoint
/// under observation, used to classify a spend by simple txid/structure
/// matching before falling back to script-based heuristics.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Debug, Default, StrictEncode, StrictDecode)]
pub struct KnownTransactions {
    pub mutual_close_txid: Option<Txid>,
    pub local_commitment_txid: Option<Txid>,
    pub remote_commitment_txids: Vec<Txid>,
    pub revoked_remote_commitment_txids: Vec<Txid>,
}

/// Classifies a transaction spending a watched outpoint. Rules are applied
/// in order; the first that matches wins, so more specific cases (a
/// revoked commitment) must be listed before their more general
/// supersets (any remote commitment).
pub fn classify(
    spending_tx: &Transaction,
    known: &KnownTransactions,
) -> CloseClass {
    let txid = spending_tx.txid();

    if known.mutual_close_txid == Some(txid) {
        return CloseClass::MutualClose;
    }
    if known.revoked_remote_commitment_txids.contains(&txid) {
        return CloseClass::RevokedRemoteUnilateral;
    }
    if known.local_commitment_txid == Some(txid) {
        return CloseClass::LocalUnilateral;
    }
    if known.remote_commitment_txids.contains(&txid) {
        return CloseClass::RemoteUnilateral;
    }
    if is_second_stage_htlc_success(spending_tx) {
        return CloseClass::HtlcSuccess;
    }
    if is_second_stage_htlc_timeout(spending_tx) {
        return CloseClass::HtlcTimeout;
    }
    if is_penalty_spend(spending_tx, known) {
        return CloseClass::Penalty;
    }
    CloseClass::Unknown
}

/// HTLC-success transactions carry a single witness with five elements:
/// `<remote_sig> <local_sig> <preimage> <htlc_script>` (BOLT-3's
/// 0-prefixed multisig-style witness) preceded by an empty placeholder;
/// heuristically, the 32-byte witness element between the two signatures
/// is the preimage.
fn is_second_stage_htlc_success(tx: &Transaction) -> bool {
    tx.input.len() == 1
        && tx
            .input
            .first()
            .map(|i| {
                i.witness.len() == 5
                    && i.witness.iter().nth(3).map(<[u8]>::len) == Some(32)
            })
            .unwrap_or(false)
}

/// HTLC-timeout transactions spend the same script but supply an empty
/// element in place of the preimage.
fn is_second_stage_htlc_timeout(tx: &Transaction) -> bool {
    tx.input.len() == 1
        && tx
            .input
            .first()
            .map(|i| {
                i.witness.len() == 5
                    && i.witness.iter().nth(3).map(<[u8]>::len) == Some(0)
            })
            .unwrap_or(false)
}

fn is_penalty_spend(tx: &Transaction, known: &KnownTransactions) -> bool {
    tx.input.iter().any(|input| {
        known
            .revoked_remote_commitment_txids
            .contains(&input.previous_output.txid)
    })
}

/// Extracts the preimage from an HTLC-success spend's witness, per the
/// layout `is_second_stage_htlc_success` checks.
pub fn extract_preimage(tx: &Transaction) -> Option<[u8; 32]> {
    let witness = &tx.input.first()?.witness;
    if witness.len() != 5 {
        return None;
    }
    let preimage_bytes = witness.iter().nth(3)?;
    if preimage_bytes.len() != 32 {
        return None;
    }
    let mut preimage = [0u8; 32];
    preimage.copy_from_slice(preimage_bytes);
    Some(preimage)
}

/// Verifies an extracted preimage actually resolves `payment_hash`, as a
/// defense against a malformed or adversarially crafted witness.
pub fn verify_preimage(preimage: &[u8; 32], payment_hash: &[u8; 32]) -> bool {
    sha256::Hash::hash(preimage).into_inner() == *payment_hash
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::{TxIn, TxOut, Witness};

    use super::*;

    fn dummy_tx(witness_stack_len: usize, preimage: Option<[u8; 32]>) -> Transaction {
        let mut stack = vec![Vec::new(); witness_stack_len];
        if let Some(p) = preimage {
            if witness_stack_len > 3 {
                stack[3] = p.to_vec();
            }
        }
        Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: Default::default(),
                sequence: 0,
                witness: Witness::from_vec(stack),
            }],
            output: vec![TxOut { value: 1000, script_pubkey: Default::default() }],
        }
    }

    #[test]
    fn classifies_mutual_close() {
        let tx = dummy_tx(0, None);
        let mut known = KnownTransactions::default();
        known.mutual_close_txid = Some(tx.txid());
        assert_eq!(classify(&tx, &known), CloseClass::MutualClose);
    }

    #[test]
    fn revoked_commitment_wins_over_remote_unilateral() {
        let tx = dummy_tx(0, None);
        let mut known = KnownTransactions::default();
        known.remote_commitment_txids.push(tx.txid());
        known.revoked_remote_commitment_txids.push(tx.txid());
        assert_eq!(classify(&tx, &known), CloseClass::RevokedRemoteUnilateral);
    }

    #[test]
    fn htlc_success_classification_and_preimage_extraction() {
        let preimage = [0x5au8; 32];
        let tx = dummy_tx(5, Some(preimage));
        let known = KnownTransactions::default();
        assert_eq!(classify(&tx, &known), CloseClass::HtlcSuccess);
        let extracted = extract_preimage(&tx).unwrap();
        assert_eq!(extracted, preimage);
    }

    #[test]
    fn htlc_timeout_has_no_extractable_preimage() {
        let tx = dummy_tx(5, None);
        let known = KnownTransactions::default();
        assert_eq!(classify(&tx, &known), CloseClass::HtlcTimeout);
        assert!(extract_preimage(&tx).is_none());
    }

    #[test]
    fn preimage_verification_rejects_mismatched_hash() {
        let preimage = [0x11u8; 32];
        let wrong_hash = [0x22u8; 32];
        assert!(!verify_preimage(&preimage, &wrong_hash));
        let right_hash = sha256::Hash::hash(&preimage).into_inner();
        assert!(verify_preimage(&preimage, &right_hash));
    }

    #[test]
    fn unknown_spend_classified_as_unknown() {
        let tx = dummy_tx(0, None);
        let known = KnownTransactions::default();
        assert_eq!(classify(&tx, &known), CloseClass::Unknown);
    }

    #[test]
    fn resolution_convergence_is_stable_on_reclassification() {
        let mut resolution =
            PendingResolution::new(OutPoint::new(Txid::from_str(
                "fd2105607605d2302994ffea703b09f66b6351816ee737a93e42a841ea20bbad",
            ).unwrap(), 0), None);
        assert!(!resolution.is_resolved());
        resolution.class = Some(CloseClass::MutualClose);
        resolution.resolving_tx = Some(Txid::from_str(
            "fd2105607605d2302994ffea703b09f66b6351816ee737a93e42a841ea20bbad",
        ).unwrap());
        assert!(resolution.is_resolved());
    }
}
