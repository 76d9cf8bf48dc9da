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

//! Commitment transaction construction: given a channel snapshot
//! (balances, committed HTLCs, feerate, keys), produces the ordered,
//! dust-trimmed output list and the signable commitment transaction with
//! BOLT-3 obscured locktime/sequence.
//!
//! Grounded in `channel/bolt/channel.rs`'s `build_graph`/`commitment_fee`/
//! `obscured_commitment_number`, generalized to carry the exact BOLT-3
//! Appendix A weight table so dust trimming and fee computation happen in
//! one place instead of the grounding library's flat `724 *
//! feerate_per_kw / 1000` approximation that ignores HTLC weight and never
//! trims.

use bitcoin::blockdata::script::Script;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::{OutPoint, Transaction, TxIn, TxOut, Witness};
use secp256k1::PublicKey;
use wallet::scripts::PubkeyScript;

use crate::htlc::{HtlcDirection, HtlcId};
use crate::scriptbuilder::ScriptBuilder;

/// Base weight (WU) of a commitment transaction with no HTLC outputs,
/// legacy (non-anchor) to_remote. BOLT-3 Appendix A.
pub const BASE_COMMITMENT_WEIGHT: u64 = 724;
/// Base weight (WU) once anchors are negotiated: two extra 330-sat anchor
/// outputs and a P2WSH (rather than P2WPKH) to_remote.
pub const BASE_COMMITMENT_WEIGHT_ANCHORS: u64 = 1124;
/// Marginal weight (WU) contributed by each untrimmed HTLC output.
pub const WEIGHT_PER_HTLC: u64 = 172;
/// Weight (WU) of the second-stage HTLC-timeout transaction that reclaims
/// an offered HTLC; used only to compute the dust-trimming threshold.
pub const HTLC_TIMEOUT_WEIGHT: u64 = 663;
pub const HTLC_TIMEOUT_WEIGHT_ANCHORS: u64 = 666;
/// Weight (WU) of the second-stage HTLC-success transaction that claims a
/// received HTLC with the preimage; used only for the dust threshold.
pub const HTLC_SUCCESS_WEIGHT: u64 = 703;
pub const HTLC_SUCCESS_WEIGHT_ANCHORS: u64 = 707;
/// Fixed value of each anchor output.
pub const ANCHOR_OUTPUT_VALUE_SAT: u64 = 330;

/// Errors from commitment transaction construction.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// funder cannot cover the fee ({required_sat} sat) of the proposed
    /// commitment at feerate {feerate_per_kw} sat/kw after dust trimming
    /// (available {available_sat} sat)
    FeeInsufficient {
        required_sat: u64,
        available_sat: u64,
        feerate_per_kw: u32,
    },
}

/// Resolved per-commitment pubkeys needed to render the output scripts.
/// Callers derive these once per `(side, commitment_number)` via
/// [`crate::keyderiver`] and the per-commitment point negotiated for that
/// commitment.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CommitmentKeys {
    /// `to_local` revocation pubkey (tweaked with the *other* side's
    /// revocation basepoint, since it is the other side that can
    /// penalize this commitment if it is later revoked).
    pub revocationpubkey: PublicKey,
    /// `to_local` delayed pubkey of the owner of this commitment.
    pub local_delayedpubkey: PublicKey,
    /// `to_remote` pubkey of the counterparty.
    pub remote_pubkey: PublicKey,
    /// Local HTLC pubkey (owner of this commitment).
    pub local_htlcpubkey: PublicKey,
    /// Remote HTLC pubkey.
    pub remote_htlcpubkey: PublicKey,
    /// Funding pubkeys, used for anchor outputs.
    pub local_funding_pubkey: PublicKey,
    pub remote_funding_pubkey: PublicKey,
}

/// Which side's chain a [`CommitmentBuilder::build`] call renders.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Side {
    Local,
    Remote,
}

/// A single committed HTLC as input to the builder; ownership is relative
/// to the channel, not to the commitment being built (see
/// [`HtlcDirection`] for how that is resolved per side).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CommittedHtlc {
    pub htlc_id: HtlcId,
    pub direction: HtlcDirection,
    pub amount_msat: u64,
    pub payment_hash: [u8; 32],
    pub cltv_expiry: u32,
}

/// One output of a built commitment transaction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CommitmentOutput {
    pub value_sat: u64,
    pub script_pubkey: Script,
    /// `Some` for HTLC outputs, identifying which committed HTLC this
    /// output resolves.
    pub htlc_id: Option<HtlcId>,
    pub is_anchor: bool,
}

/// The constructed commitment: tx plus bookkeeping the resolver and sweep
/// planner need (the outputs in on-chain order, and which HTLCs were
/// trimmed as dust).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BuiltCommitment {
    pub tx: Transaction,
    pub outputs: Vec<CommitmentOutput>,
    pub trimmed_htlc_ids: Vec<HtlcId>,
    pub fee_sat: u64,
    pub commitment_number: u64,
}

/// Obscuring mask per BOLT-3: lower 48 bits of `SHA256(open_payment_basepoint
/// || accept_payment_basepoint)`, with the opener's basepoint always first
/// regardless of which side's commitment is being rendered.
pub fn obscuring_mask(
    opener_payment_basepoint: PublicKey,
    accepter_payment_basepoint: PublicKey,
) -> u64 {
    const LOWER_48_BITS: u64 = 0x0000_FFFF_FFFF_FFFF;
    let mut engine = sha256::Hash::engine();
    engine.input(&opener_payment_basepoint.serialize());
    engine.input(&accepter_payment_basepoint.serialize());
    let hash = sha256::Hash::from_engine(engine);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&hash[24..]);
    u64::from_be_bytes(buf) & LOWER_48_BITS
}

/// `(locktime, sequence)` pair encoding `commitment_number` obscured with
/// `mask`, per BOLT-3.
pub fn obscured_locktime_sequence(commitment_number: u64, mask: u64) -> (u32, u32) {
    const LOWER_48_BITS: u64 = 0x0000_FFFF_FFFF_FFFF;
    let obscured = (commitment_number & LOWER_48_BITS) ^ mask;
    let locktime = 0x2000_0000 | (obscured as u32 & 0x00FF_FFFF);
    let sequence = 0x8000_0000 | ((obscured >> 24) as u32);
    (locktime, sequence)
}

/// Recovers the commitment number from an on-chain transaction's
/// locktime/sequence given the obscuring mask, returning `None` if the
/// high bits don't match the BOLT-3 pattern (i.e. this isn't an obscured
/// commitment tx at all).
pub fn recover_commitment_number(
    locktime: u32,
    sequence: u32,
    mask: u64,
) -> Option<u64> {
    if locktime >> 24 != 0x20 || sequence >> 24 != 0x80 {
        return None;
    }
    let low = (locktime & 0x00FF_FFFF) as u64;
    let high = (sequence & 0x00FF_FFFF) as u64;
    let obscured = (high << 24) | low;
    Some(obscured ^ mask)
}

/// Builds commitment transactions for one channel side from a balance/HTLC
/// snapshot, applying BOLT-3 dust trimming and BIP-69+CLTV output
/// ordering.
pub struct CommitmentBuilder;

impl CommitmentBuilder {
    /// Builds the commitment transaction for `side` at `commitment_number`.
    ///
    /// `to_local_msat`/`to_remote_msat` are from the perspective of `side`
    /// (i.e. `to_local_msat` is what the owner of this commitment keeps).
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        funding_outpoint: OutPoint,
        side: Side,
        commitment_number: u64,
        obscuring_mask_value: u64,
        to_local_msat: u64,
        to_remote_msat: u64,
        htlcs: &[CommittedHtlc],
        feerate_per_kw: u32,
        dust_limit_sat: u64,
        anchors: bool,
        is_funder: bool,
        to_self_delay: u16,
        keys: &CommitmentKeys,
    ) -> Result<BuiltCommitment, Error> {
        let (locktime, sequence) =
            obscured_locktime_sequence(commitment_number, obscuring_mask_value);

        let mut outputs = Vec::new();
        let mut trimmed_htlc_ids = Vec::new();
        let mut untrimmed_htlc_value_msat = 0u64;
        let mut untrimmed_count = 0u64;

        for htlc in htlcs {
            let offered = match side {
                Side::Local => htlc.direction == HtlcDirection::Local,
                Side::Remote => htlc.direction == HtlcDirection::Remote,
            };
            let weight = if offered {
                if anchors {
                    HTLC_TIMEOUT_WEIGHT_ANCHORS
                } else {
                    HTLC_TIMEOUT_WEIGHT
                }
            } else if anchors {
                HTLC_SUCCESS_WEIGHT_ANCHORS
            } else {
                HTLC_SUCCESS_WEIGHT
            };
            let threshold_sat =
                dust_limit_sat + weight * feerate_per_kw as u64 / 1000;
            let amount_sat = htlc.amount_msat / 1000;
            if amount_sat < threshold_sat {
                trimmed_htlc_ids.push(htlc.htlc_id);
                continue;
            }
            untrimmed_count += 1;
            untrimmed_htlc_value_msat += htlc.amount_msat;

            let script = if offered {
                PubkeyScript::ln_offered_htlc(
                    keys.revocationpubkey,
                    keys.remote_htlcpubkey,
                    keys.local_htlcpubkey,
                    htlc.payment_hash,
                    anchors,
                )
            } else {
                PubkeyScript::ln_received_htlc(
                    keys.revocationpubkey,
                    keys.remote_htlcpubkey,
                    keys.local_htlcpubkey,
                    htlc.payment_hash,
                    htlc.cltv_expiry,
                    anchors,
                )
            };
            outputs.push((
                CommitmentOutput {
                    value_sat: amount_sat,
                    script_pubkey: script.into(),
                    htlc_id: Some(htlc.htlc_id),
                    is_anchor: false,
                },
                htlc.cltv_expiry,
            ));
        }

        let base_weight = if anchors {
            BASE_COMMITMENT_WEIGHT_ANCHORS
        } else {
            BASE_COMMITMENT_WEIGHT
        };
        let weight = base_weight + WEIGHT_PER_HTLC * untrimmed_count;
        let fee_sat = weight * feerate_per_kw as u64 / 1000;

        let to_local_after_trim_msat = to_local_msat;
        let to_remote_after_trim_msat = to_remote_msat
            + (htlcs
                .iter()
                .map(|h| h.amount_msat)
                .sum::<u64>()
                - untrimmed_htlc_value_msat);
        // Trimmed HTLC value, and the commitment fee itself, are both
        // charged to the funder.
        let (to_local_fee_sat, to_remote_fee_sat) = if is_funder {
            (fee_sat, 0)
        } else {
            (0, fee_sat)
        };

        let to_local_sat = to_local_after_trim_msat / 1000;
        let to_remote_sat = to_remote_after_trim_msat / 1000;

        if is_funder && to_local_sat < to_local_fee_sat {
            return Err(Error::FeeInsufficient {
                required_sat: fee_sat,
                available_sat: to_local_sat,
                feerate_per_kw,
            });
        }
        if !is_funder && to_remote_sat < to_remote_fee_sat {
            return Err(Error::FeeInsufficient {
                required_sat: fee_sat,
                available_sat: to_remote_sat,
                feerate_per_kw,
            });
        }

        if to_local_sat.saturating_sub(to_local_fee_sat) >= dust_limit_sat {
            let script = PubkeyScript::ln_to_local(
                keys.revocationpubkey,
                keys.local_delayedpubkey,
                to_self_delay,
            );
            outputs.push((
                CommitmentOutput {
                    value_sat: to_local_sat - to_local_fee_sat,
                    script_pubkey: script.into(),
                    htlc_id: None,
                    is_anchor: false,
                },
                0,
            ));
        }
        if to_remote_sat.saturating_sub(to_remote_fee_sat) >= dust_limit_sat {
            let script = if anchors {
                PubkeyScript::ln_to_remote_anchors(keys.remote_pubkey)
            } else {
                PubkeyScript::ln_to_remote_legacy(keys.remote_pubkey)
            };
            outputs.push((
                CommitmentOutput {
                    value_sat: to_remote_sat - to_remote_fee_sat,
                    script_pubkey: script.into(),
                    htlc_id: None,
                    is_anchor: false,
                },
                0,
            ));
        }

        if anchors {
            outputs.push((
                CommitmentOutput {
                    value_sat: ANCHOR_OUTPUT_VALUE_SAT,
                    script_pubkey: PubkeyScript::ln_anchor(
                        keys.local_funding_pubkey,
                    )
                    .into(),
                    htlc_id: None,
                    is_anchor: true,
                },
                0,
            ));
            outputs.push((
                CommitmentOutput {
                    value_sat: ANCHOR_OUTPUT_VALUE_SAT,
                    script_pubkey: PubkeyScript::ln_anchor(
                        keys.remote_funding_pubkey,
                    )
                    .into(),
                    htlc_id: None,
                    is_anchor: true,
                },
                0,
            ));
        }

        // BIP-69 (value ASC, script ASC) with a CLTV tiebreak for HTLCs.
        outputs.sort_by(|(a, cltv_a), (b, cltv_b)| {
            a.value_sat
                .cmp(&b.value_sat)
                .then_with(|| a.script_pubkey.cmp(&b.script_pubkey))
                .then_with(|| cltv_a.cmp(cltv_b))
        });
        let outputs: Vec<CommitmentOutput> =
            outputs.into_iter().map(|(o, _)| o).collect();

        let tx = Transaction {
            version: 2,
            lock_time: locktime,
            input: vec![TxIn {
                previous_output: funding_outpoint,
                script_sig: Script::new(),
                sequence,
                witness: Witness::new(),
            }],
            output: outputs
                .iter()
                .map(|o| TxOut {
                    value: o.value_sat,
                    script_pubkey: o.script_pubkey.clone(),
                })
                .collect(),
        };

        Ok(BuiltCommitment {
            tx,
            outputs,
            trimmed_htlc_ids,
            fee_sat,
            commitment_number,
        })
    }
}
