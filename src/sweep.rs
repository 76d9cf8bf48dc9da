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

//! Builds the second-stage transactions that claim funds out of a
//! confirmed commitment transaction: the delayed `to_local` sweep, HTLC
//! success/timeout claims, and anchor CPFP fee bumps, all honoring BIP-125
//! replace-by-fee so a stuck sweep can be rebroadcast at a higher fee.
//!
//! Grounded in the corpus's on-chain claim surveys (no counterpart exists
//! in the grounding library, whose `Extension` framework stops at
//! commitment signing): `ariard-rust-lightning`'s `onchain_utils.rs` models
//! the same claim/bump split this module generalizes into an explicit
//! planner with a pure fee-bump step, testable without a chain adapter.

use bitcoin::{OutPoint, Transaction, TxIn, TxOut, Witness};

use crate::htlc::HtlcId;

/// Minimum multiple of the anchor-bump fee a CPFP sweep must clear over
/// just paying the commitment's own feerate, so we never spend more on
/// fees than the anchor output is worth reclaiming (spec property: anchor
/// CPFP is only economical above this multiple).
pub const ANCHOR_CPFP_ECONOMIC_MULTIPLE: u64 = 10;

/// Errors from sweep transaction construction.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// sweeping outpoint {0:?} at feerate {1} sat/vbyte would leave nothing
    /// after fees
    FeeExceedsValue(OutPoint, u64),

    /// anchor CPFP at feerate {0} sat/vbyte is not economical: would cost
    /// more than {ANCHOR_CPFP_ECONOMIC_MULTIPLE}x the anchor's value
    AnchorCpfpUneconomical(u64),

    /// fee bump must strictly increase the feerate (old {old}, new {new}
    /// sat/vbyte)
    FeeBumpNotIncreasing { old: u64, new: u64 },
}

/// What a planned sweep claims.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SweepTarget {
    /// The revocable `to_local` output, spendable by us after
    /// `to_self_delay` blocks.
    ToLocalDelayed,
    /// An offered HTLC output we can reclaim after its CLTV expires.
    HtlcTimeout(HtlcId),
    /// A received HTLC output we can claim with its preimage.
    HtlcSuccess(HtlcId, [u8; 32]),
    /// An anchor output, CPFP-bumping its parent commitment.
    AnchorCpfp,
}

/// A planned (unsigned) sweep transaction, carrying enough context for the
/// caller to request the right signature from [`crate::interfaces::KeyHolder`]
/// and to re-plan at a higher feerate if it gets stuck.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PlannedSweep {
    pub target: SweepTarget,
    pub tx: Transaction,
    pub input_value_sat: u64,
    pub feerate_sat_per_vbyte: u64,
}

/// Plans second-stage sweep transactions from confirmed commitment
/// outputs.
pub struct SweepPlanner;

/// Rough virtual size (vbytes) of each claim transaction shape, used only
/// to size the fee; the exact witness varies by which branch of the HTLC
/// script is taken but stays within a few vbytes of these figures.
const TO_LOCAL_SWEEP_VSIZE: u64 = 120;
const HTLC_TIMEOUT_SWEEP_VSIZE: u64 = 140;
const HTLC_SUCCESS_SWEEP_VSIZE: u64 = 140;
const ANCHOR_CPFP_VSIZE: u64 = 110;

impl SweepPlanner {
    /// Plans a transaction spending `outpoint` (worth `value_sat`) per
    /// `target`, paying to `destination_script` at `feerate_sat_per_vbyte`.
    pub fn plan(
        target: SweepTarget,
        outpoint: OutPoint,
        value_sat: u64,
        destination_script: bitcoin::Script,
        feerate_sat_per_vbyte: u64,
        sequence: u32,
    ) -> Result<PlannedSweep, Error> {
        let vsize = match target {
            SweepTarget::ToLocalDelayed => TO_LOCAL_SWEEP_VSIZE,
            SweepTarget::HtlcTimeout(_) => HTLC_TIMEOUT_SWEEP_VSIZE,
            SweepTarget::HtlcSuccess(_, _) => HTLC_SUCCESS_SWEEP_VSIZE,
            SweepTarget::AnchorCpfp => ANCHOR_CPFP_VSIZE,
        };
        let fee_sat = vsize * feerate_sat_per_vbyte;

        if let SweepTarget::AnchorCpfp = target {
            if fee_sat > value_sat.saturating_mul(ANCHOR_CPFP_ECONOMIC_MULTIPLE) {
                return Err(Error::AnchorCpfpUneconomical(feerate_sat_per_vbyte));
            }
        }

        if fee_sat >= value_sat {
            return Err(Error::FeeExceedsValue(outpoint, feerate_sat_per_vbyte));
        }

        let tx = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: Default::default(),
                sequence,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: value_sat - fee_sat,
                script_pubkey: destination_script,
            }],
        };

        Ok(PlannedSweep {
            target,
            tx,
            input_value_sat: value_sat,
            feerate_sat_per_vbyte,
        })
    }

    /// Re-plans `stuck` at a strictly higher feerate, per BIP-125: the new
    /// transaction must pay a higher absolute fee *and* a higher feerate
    /// than every transaction it replaces.
    pub fn bump_fee(
        stuck: &PlannedSweep,
        new_feerate_sat_per_vbyte: u64,
        destination_script: bitcoin::Script,
    ) -> Result<PlannedSweep, Error> {
        if new_feerate_sat_per_vbyte <= stuck.feerate_sat_per_vbyte {
            return Err(Error::FeeBumpNotIncreasing {
                old: stuck.feerate_sat_per_vbyte,
                new: new_feerate_sat_per_vbyte,
            });
        }
        let outpoint = stuck.tx.input[0].previous_output;
        let sequence = stuck.tx.input[0].sequence;
        Self::plan(
            stuck.target,
            outpoint,
            stuck.input_value_sat,
            destination_script,
            new_feerate_sat_per_vbyte,
            sequence,
        )
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::Txid;

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

    #[test]
    fn plans_to_local_sweep_with_expected_fee() {
        let planned = SweepPlanner::plan(
            SweepTarget::ToLocalDelayed,
            outpoint(),
            1_000_000,
            Default::default(),
            10,
            144,
        )
        .unwrap();
        assert_eq!(
            planned.tx.output[0].value,
            1_000_000 - TO_LOCAL_SWEEP_VSIZE * 10
        );
    }

    #[test]
    fn fee_bump_requires_strictly_higher_feerate() {
        let planned = SweepPlanner::plan(
            SweepTarget::ToLocalDelayed,
            outpoint(),
            1_000_000,
            Default::default(),
            10,
            144,
        )
        .unwrap();
        let result = SweepPlanner::bump_fee(&planned, 10, Default::default());
        assert!(matches!(result, Err(Error::FeeBumpNotIncreasing { .. })));
        let bumped = SweepPlanner::bump_fee(&planned, 20, Default::default()).unwrap();
        assert!(bumped.feerate_sat_per_vbyte > planned.feerate_sat_per_vbyte);
    }

    #[test]
    fn anchor_cpfp_rejected_when_uneconomical() {
        let result = SweepPlanner::plan(
            SweepTarget::AnchorCpfp,
            outpoint(),
            330,
            Default::default(),
            1_000,
            0,
        );
        assert!(matches!(result, Err(Error::AnchorCpfpUneconomical(_))));
    }

    #[test]
    fn fee_exceeding_value_is_rejected() {
        let result = SweepPlanner::plan(
            SweepTarget::ToLocalDelayed,
            outpoint(),
            100,
            Default::default(),
            10,
            144,
        );
        assert!(matches!(result, Err(Error::FeeExceedsValue(_, _))));
    }
}
