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

//! Recovers funds from a revoked commitment the peer broadcast, by
//! recombining the revocation basepoint secret with the per-commitment
//! secret they were forced to reveal, then sweeping every revocable output
//! in one penalty transaction.
//!
//! Revocation privkey recovery reuses `crate::keyderiver::revocation_privkey`
//! exactly as `channel/bolt/channel.rs`'s `remote_revocationpubkey` test
//! vectors exercise the public half; the multi-output penalty transaction
//! and arming policy have no grounding-library counterpart and are built
//! from the corpus's breach-watch survey (`sr-gi-ldk-sample`'s
//! `tower.rs`), generalized into an explicit weight-capped batch rather
//! than that example's one-output-at-a-time loop.

use bitcoin::{OutPoint, Transaction, TxIn, TxOut, Witness};
use secp256k1::{PublicKey, Secp256k1, SecretKey, Signing};

use crate::keyderiver::revocation_privkey;

/// Maximum standard transaction weight (WU); a penalty transaction with
/// enough revoked outputs to exceed this must be split into several
/// batches.
pub const MAX_PENALTY_TX_WEIGHT: u64 = 400_000;

/// Rough weight contribution of one penalty input claiming a revoked
/// `to_local` or HTLC output via the revocation branch.
const PENALTY_INPUT_WEIGHT: u64 = 300;
const PENALTY_BASE_WEIGHT: u64 = 200;

/// Errors from justice (penalty) transaction construction.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// no revoked outputs were supplied to claim
    NothingToClaim,

    /// revocation secret recovery failed: the per-commitment secret does
    /// not correspond to any basepoint we hold
    RevocationRecoveryFailed,

    /// total claimable value ({0} sat) does not cover the penalty
    /// transaction's fee at the requested feerate
    FeeExceedsValue(u64),
}

/// A single revoked output we can claim with the recovered revocation key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RevokedOutput {
    pub outpoint: OutPoint,
    pub value_sat: u64,
}

/// Recovers the revocation private key for a breached commitment, given
/// our own revocation basepoint secret and the per-commitment secret the
/// peer revealed (by revoking that commitment, per BOLT-3 they are
/// contractually bound to reveal it, and its premature broadcast is
/// exactly the breach this recovers from).
pub fn recover_revocation_privkey<C: Signing>(
    secp: &Secp256k1<C>,
    revocation_basepoint_secret: SecretKey,
    revocation_basepoint: PublicKey,
    per_commitment_secret: SecretKey,
    per_commitment_point: PublicKey,
) -> SecretKey {
    revocation_privkey(
        secp,
        revocation_basepoint_secret,
        revocation_basepoint,
        per_commitment_secret,
        per_commitment_point,
    )
}

/// Splits `outputs` into batches, each within [`MAX_PENALTY_TX_WEIGHT`],
/// preserving input order within a batch.
fn batch_by_weight(outputs: &[RevokedOutput]) -> Vec<Vec<RevokedOutput>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut weight = PENALTY_BASE_WEIGHT;
    for output in outputs {
        if weight + PENALTY_INPUT_WEIGHT > MAX_PENALTY_TX_WEIGHT && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            weight = PENALTY_BASE_WEIGHT;
        }
        current.push(*output);
        weight += PENALTY_INPUT_WEIGHT;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Builds penalty transactions sweeping every revoked output named by
/// `outputs` to `destination_script`, split across [`MAX_PENALTY_TX_WEIGHT`]
/// batches and paying `feerate_sat_per_vbyte`. The caller signs each
/// returned transaction's inputs with the recovered revocation privkey (for
/// `to_local`) and HTLC privkey (for HTLC outputs) via
/// [`crate::interfaces::KeyHolder`].
pub fn build_penalty_transactions(
    outputs: &[RevokedOutput],
    destination_script: bitcoin::Script,
    feerate_sat_per_vbyte: u64,
) -> Result<Vec<Transaction>, Error> {
    if outputs.is_empty() {
        return Err(Error::NothingToClaim);
    }

    log::warn!(
        "building penalty transactions for {} revoked output(s)",
        outputs.len()
    );

    batch_by_weight(outputs)
        .into_iter()
        .map(|batch| {
            let total_value: u64 = batch.iter().map(|o| o.value_sat).sum();
            let weight = PENALTY_BASE_WEIGHT + PENALTY_INPUT_WEIGHT * batch.len() as u64;
            let vsize = (weight + 3) / 4;
            let fee = vsize * feerate_sat_per_vbyte;
            if fee >= total_value {
                return Err(Error::FeeExceedsValue(total_value));
            }
            Ok(Transaction {
                version: 2,
                lock_time: 0,
                input: batch
                    .iter()
                    .map(|o| TxIn {
                        previous_output: o.outpoint,
                        script_sig: Default::default(),
                        sequence: 0xFFFF_FFFF,
                        witness: Witness::new(),
                    })
                    .collect(),
                output: vec![TxOut {
                    value: total_value - fee,
                    script_pubkey: destination_script.clone(),
                }],
            })
        })
        .collect()
}

/// Whether a breached commitment is still within the security window in
/// which evidence (the revoked commitment's outputs) must be retained and
/// actively watched: never prune within `security_delay_blocks` of the
/// current tip, per the policy resolving the design's open question on
/// when it's safe to forget a resolved channel.
pub fn within_security_delay(
    breach_height: u32,
    current_height: u32,
    security_delay_blocks: u32,
) -> bool {
    current_height.saturating_sub(breach_height) < security_delay_blocks
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::Txid;
    use secp256k1::Secp256k1;

    use super::*;

    fn outpoint(vout: u32) -> OutPoint {
        OutPoint::new(
            Txid::from_str(
                "fd2105607605d2302994ffea703b09f66b6351816ee737a93e42a841ea20bbad",
            )
            .unwrap(),
            vout,
        )
    }

    #[test]
    fn recovers_matching_revocation_privkey() {
        let secp = Secp256k1::new();
        let base_secret = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let per_commit_secret = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let base_point = PublicKey::from_secret_key(&secp, &base_secret);
        let per_commit_point = PublicKey::from_secret_key(&secp, &per_commit_secret);

        let recovered = recover_revocation_privkey(
            &secp,
            base_secret,
            base_point,
            per_commit_secret,
            per_commit_point,
        );
        let expected = revocation_privkey(
            &secp,
            base_secret,
            base_point,
            per_commit_secret,
            per_commit_point,
        );
        assert_eq!(recovered, expected);
    }

    #[test]
    fn builds_single_penalty_tx_for_small_batch() {
        let outputs = vec![
            RevokedOutput { outpoint: outpoint(0), value_sat: 500_000 },
            RevokedOutput { outpoint: outpoint(1), value_sat: 10_000 },
        ];
        let txs =
            build_penalty_transactions(&outputs, Default::default(), 10).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].input.len(), 2);
    }

    #[test]
    fn splits_large_batches_to_respect_weight_cap() {
        let outputs: Vec<_> = (0..2000)
            .map(|i| RevokedOutput { outpoint: outpoint(i), value_sat: 100_000 })
            .collect();
        let txs =
            build_penalty_transactions(&outputs, Default::default(), 1).unwrap();
        assert!(txs.len() > 1);
        for tx in &txs {
            let weight = PENALTY_BASE_WEIGHT + PENALTY_INPUT_WEIGHT * tx.input.len() as u64;
            assert!(weight <= MAX_PENALTY_TX_WEIGHT);
        }
    }

    #[test]
    fn empty_output_set_is_rejected() {
        let result = build_penalty_transactions(&[], Default::default(), 10);
        assert!(matches!(result, Err(Error::NothingToClaim)));
    }

    #[test]
    fn security_delay_gate() {
        assert!(within_security_delay(100, 105, 144));
        assert!(!within_security_delay(100, 300, 144));
    }
}
