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

//! In-flight HTLC bookkeeping: the six-state add/fulfill/fail machine per
//! HTLC, the `awaiting_revoke` turn-exclusivity flag that keeps the two
//! sides' commitment updates from racing each other, and the per-HTLC
//! local/remote commitment-chain membership that an HTLC passes through
//! independently on each side before it is "committed" on both.
//!
//! Grounded in `channel/bolt/channel.rs`'s HTLC-carrying fields and
//! `update_add_htlc`/`update_fulfill_htlc`/`update_fail_htlc` message
//! handling surveyed across the corpus's BOLT-2 implementations; no single
//! grounding file tracks per-HTLC state as its own machine the way this
//! module does, since the grounding library defers all HTLC lifecycle to
//! its generic `Extension` framework.

use bitcoin::hashes::sha256;

use crate::commitment::Side;

/// Identifies an HTLC within a channel; the side that sent `update_add_htlc`
/// assigns it, counting up from zero independently on each side (BOLT-2).
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, StrictEncode, StrictDecode)]
#[display("{0}")]
pub struct HtlcId(pub u64);

/// Which side originated an HTLC's `update_add_htlc`.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum HtlcDirection {
    /// We offered it (it debits our balance on our own commitment).
    #[display("local")]
    Local,
    /// The peer offered it.
    #[display("remote")]
    Remote,
}

/// Per-HTLC lifecycle state. An HTLC is only ever resolved
/// (`Fulfilled`/`Failed`) once it is no longer present on *either* party's
/// latest commitment; `Removed` marks that point.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum HtlcState {
    /// Proposed locally via `update_add_htlc`, not yet on any signed
    /// commitment.
    #[display("proposed_local")]
    ProposedLocal,
    /// Proposed by the peer, not yet on any signed commitment of ours.
    #[display("proposed_remote")]
    ProposedRemote,
    /// Present (irrevocably committed) on both parties' latest commitment.
    #[display("committed")]
    Committed,
    /// A `update_fulfill_htlc` has been sent or received but not yet
    /// reflected in a mutually signed commitment.
    #[display("fulfill_pending")]
    FulfillPending,
    /// A `update_fail_htlc`/`update_fail_malformed_htlc` has been sent or
    /// received but not yet reflected in a mutually signed commitment.
    #[display("fail_pending")]
    FailPending,
    /// Removed from both parties' latest commitment; safe to forget once
    /// no unrevoked commitment containing it remains reachable.
    #[display("removed")]
    Removed,
}

/// Errors from HTLC proposal and state-machine transitions.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// htlc {0} is unknown to this channel
    UnknownHtlc(HtlcId),

    /// htlc {0} is in state {1}, which does not permit this transition
    InvalidTransition(HtlcId, HtlcState),

    /// cannot propose a new update while awaiting the peer's revocation
    /// (BOLT-2 turn exclusivity)
    AwaitingRevoke,

    /// payment_hash does not match the preimage offered in fulfillment of
    /// htlc {0}
    PreimageMismatch(HtlcId),

    /// adding htlc {0} would exceed max_accepted_htlcs
    TooManyHtlcs,

    /// adding htlc {0} would exceed max_htlc_value_in_flight_msat
    ValueInFlightExceeded,

    /// htlc {0} amount {1} msat is below the peer's htlc_minimum_msat
    BelowMinimum(HtlcId, u64),

    /// htlc {0} would leave the proposer's commitment balance negative
    InsufficientBalance(HtlcId),
}

/// A single in-flight HTLC.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct Htlc {
    pub htlc_id: HtlcId,
    pub direction: HtlcDirection,
    pub amount_msat: u64,
    pub payment_hash: [u8; 32],
    pub cltv_expiry: u32,
    pub onion_routing_packet: Vec<u8>,
    pub state: HtlcState,
    /// Present on the local party's latest irrevocably committed
    /// commitment transaction.
    pub on_local_commitment: bool,
    /// Present on the remote party's latest irrevocably committed
    /// commitment transaction.
    pub on_remote_commitment: bool,
}

impl Htlc {
    /// Verifies `preimage` resolves this HTLC's `payment_hash`.
    pub fn preimage_matches(&self, preimage: &[u8; 32]) -> bool {
        sha256::Hash::hash(preimage).into_inner() == self.payment_hash
    }
}

/// Per-channel caps enforced when proposing a new HTLC; the peer's
/// advertised `accept_channel`/`open_channel` parameters.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct HtlcLimits {
    pub max_accepted_htlcs: u16,
    pub max_htlc_value_in_flight_msat: u64,
    pub htlc_minimum_msat: u64,
}

/// Tracks in-flight HTLCs and the BOLT-2 turn-exclusivity flags that gate
/// proposing new updates while a `commitment_signed`/`revoke_and_ack`
/// exchange is outstanding.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Debug, Default, StrictEncode, StrictDecode)]
pub struct HtlcManager {
    htlcs: Vec<Htlc>,
    next_local_id: u64,
    awaiting_revoke_local: bool,
    awaiting_revoke_remote: bool,
}

impl HtlcManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn htlcs(&self) -> &[Htlc] {
        &self.htlcs
    }

    /// HTLCs present on `side`'s latest irrevocably committed commitment,
    /// per BOLT-2's "each HTLC sits on 0, 1, or 2 commitment chains
    /// depending on which revocations have landed" turn protocol.
    pub fn committed(&self, side: Side) -> impl Iterator<Item = &Htlc> {
        self.htlcs.iter().filter(move |h| match side {
            Side::Local => h.on_local_commitment,
            Side::Remote => h.on_remote_commitment,
        })
    }

    fn find_mut(&mut self, id: HtlcId) -> Result<&mut Htlc, Error> {
        self.htlcs
            .iter_mut()
            .find(|h| h.htlc_id == id)
            .ok_or(Error::UnknownHtlc(id))
    }

    /// Proposes a new locally-originated HTLC, assigning it the next local
    /// id. Fails if we are still awaiting the peer's revocation for a prior
    /// batch of updates, or if any of `limits` would be violated.
    pub fn propose_local(
        &mut self,
        amount_msat: u64,
        payment_hash: [u8; 32],
        cltv_expiry: u32,
        onion_routing_packet: Vec<u8>,
        local_balance_msat: u64,
        limits: &HtlcLimits,
    ) -> Result<HtlcId, Error> {
        if self.awaiting_revoke_local {
            return Err(Error::AwaitingRevoke);
        }
        let id = HtlcId(self.next_local_id);
        if amount_msat < limits.htlc_minimum_msat {
            return Err(Error::BelowMinimum(id, amount_msat));
        }
        let in_flight: u64 = self
            .htlcs
            .iter()
            .filter(|h| {
                h.direction == HtlcDirection::Local && h.state != HtlcState::Removed
            })
            .map(|h| h.amount_msat)
            .sum();
        if in_flight + amount_msat > limits.max_htlc_value_in_flight_msat {
            return Err(Error::ValueInFlightExceeded);
        }
        let count = self
            .htlcs
            .iter()
            .filter(|h| {
                h.direction == HtlcDirection::Local && h.state != HtlcState::Removed
            })
            .count();
        if count as u16 >= limits.max_accepted_htlcs {
            return Err(Error::TooManyHtlcs);
        }
        if local_balance_msat < in_flight + amount_msat {
            return Err(Error::InsufficientBalance(id));
        }

        self.next_local_id += 1;
        self.htlcs.push(Htlc {
            htlc_id: id,
            direction: HtlcDirection::Local,
            amount_msat,
            payment_hash,
            cltv_expiry,
            onion_routing_packet,
            state: HtlcState::ProposedLocal,
            on_local_commitment: false,
            on_remote_commitment: false,
        });
        self.awaiting_revoke_local = true;
        Ok(id)
    }

    /// Records a peer-originated `update_add_htlc`.
    pub fn propose_remote(
        &mut self,
        htlc_id: HtlcId,
        amount_msat: u64,
        payment_hash: [u8; 32],
        cltv_expiry: u32,
        onion_routing_packet: Vec<u8>,
        limits: &HtlcLimits,
    ) -> Result<(), Error> {
        if amount_msat < limits.htlc_minimum_msat {
            return Err(Error::BelowMinimum(htlc_id, amount_msat));
        }
        self.htlcs.push(Htlc {
            htlc_id,
            direction: HtlcDirection::Remote,
            amount_msat,
            payment_hash,
            cltv_expiry,
            onion_routing_packet,
            state: HtlcState::ProposedRemote,
            on_local_commitment: false,
            on_remote_commitment: false,
        });
        self.awaiting_revoke_remote = true;
        Ok(())
    }

    /// Completes a `commitment_signed`/`revoke_and_ack` round for the
    /// local party's own commitment chain: pending proposals land on it,
    /// and HTLCs slated for removal drop off it. An HTLC only reaches
    /// `Committed` once it has landed on *both* chains, and only fully
    /// disappears once it has dropped off both.
    pub fn advance_local_round(&mut self) {
        self.advance_chain(Side::Local);
        self.awaiting_revoke_remote = false;
    }

    /// Completes a `commitment_signed`/`revoke_and_ack` round for the
    /// remote party's commitment chain. See [`Self::advance_local_round`].
    pub fn advance_remote_round(&mut self) {
        self.advance_chain(Side::Remote);
        self.awaiting_revoke_local = false;
    }

    fn advance_chain(&mut self, side: Side) {
        self.htlcs.retain_mut(|h| {
            let flag = match side {
                Side::Local => &mut h.on_local_commitment,
                Side::Remote => &mut h.on_remote_commitment,
            };
            match h.state {
                HtlcState::ProposedLocal | HtlcState::ProposedRemote => {
                    *flag = true;
                    if h.on_local_commitment && h.on_remote_commitment {
                        h.state = HtlcState::Committed;
                    }
                    true
                }
                HtlcState::FulfillPending | HtlcState::FailPending => {
                    *flag = false;
                    if !h.on_local_commitment && !h.on_remote_commitment {
                        h.state = HtlcState::Removed;
                        false
                    } else {
                        true
                    }
                }
                _ => true,
            }
        });
    }

    /// Resolves a committed HTLC with its preimage.
    pub fn fulfill(
        &mut self,
        htlc_id: HtlcId,
        preimage: [u8; 32],
    ) -> Result<(), Error> {
        let htlc = self.find_mut(htlc_id)?;
        if htlc.state != HtlcState::Committed {
            return Err(Error::InvalidTransition(htlc_id, htlc.state));
        }
        if !htlc.preimage_matches(&preimage) {
            return Err(Error::PreimageMismatch(htlc_id));
        }
        htlc.state = HtlcState::FulfillPending;
        Ok(())
    }

    /// Fails a committed HTLC (timeout, routing failure, malformed onion).
    pub fn fail(&mut self, htlc_id: HtlcId) -> Result<(), Error> {
        let htlc = self.find_mut(htlc_id)?;
        if htlc.state != HtlcState::Committed {
            return Err(Error::InvalidTransition(htlc_id, htlc.state));
        }
        htlc.state = HtlcState::FailPending;
        Ok(())
    }

    pub fn awaiting_revoke(&self) -> bool {
        self.awaiting_revoke_local || self.awaiting_revoke_remote
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn limits() -> HtlcLimits {
        HtlcLimits {
            max_accepted_htlcs: 30,
            max_htlc_value_in_flight_msat: 1_000_000_000,
            htlc_minimum_msat: 1,
        }
    }

    fn preimage_and_hash(b: u8) -> ([u8; 32], [u8; 32]) {
        let preimage = [b; 32];
        let hash = sha256::Hash::hash(&preimage).into_inner();
        (preimage, hash)
    }

    #[test]
    fn propose_fulfill_and_advance_round_conserves_balance() {
        let mut mgr = HtlcManager::new();
        let (preimage, hash) = preimage_and_hash(7);
        let id = mgr
            .propose_local(100_000, hash, 500_000, vec![], 1_000_000, &limits())
            .unwrap();
        assert!(mgr.awaiting_revoke());
        // A full round trip: our commitment_signed lands the htlc on the
        // remote chain first, then the peer's commitment_signed back lands
        // it on ours.
        mgr.advance_remote_round();
        assert_eq!(mgr.committed(Side::Remote).count(), 1);
        assert_eq!(mgr.committed(Side::Local).count(), 0);
        mgr.advance_local_round();
        assert!(!mgr.awaiting_revoke());
        assert_eq!(mgr.committed(Side::Local).count(), 1);
        assert_eq!(mgr.committed(Side::Remote).count(), 1);

        mgr.fulfill(id, preimage).unwrap();
        assert_eq!(
            mgr.htlcs().iter().find(|h| h.htlc_id == id).unwrap().state,
            HtlcState::FulfillPending
        );
        mgr.advance_remote_round();
        assert_eq!(mgr.committed(Side::Local).count(), 1);
        assert_eq!(mgr.committed(Side::Remote).count(), 0);
        mgr.advance_local_round();
        assert!(mgr.htlcs().iter().all(|h| h.htlc_id != id));
    }

    #[test]
    fn second_proposal_blocked_while_awaiting_revoke() {
        let mut mgr = HtlcManager::new();
        let (_, hash) = preimage_and_hash(1);
        mgr.propose_local(1_000, hash, 500_000, vec![], 1_000_000, &limits())
            .unwrap();
        let (_, hash2) = preimage_and_hash(2);
        let result =
            mgr.propose_local(1_000, hash2, 500_000, vec![], 1_000_000, &limits());
        assert!(matches!(result, Err(Error::AwaitingRevoke)));
    }

    #[test]
    fn fulfill_rejects_wrong_preimage() {
        let mut mgr = HtlcManager::new();
        let (_, hash) = preimage_and_hash(3);
        let id = mgr
            .propose_local(1_000, hash, 500_000, vec![], 1_000_000, &limits())
            .unwrap();
        mgr.advance_remote_round();
        mgr.advance_local_round();
        let result = mgr.fulfill(id, [0xffu8; 32]);
        assert!(matches!(result, Err(Error::PreimageMismatch(_))));
    }

    #[test]
    fn below_minimum_is_rejected() {
        let mut mgr = HtlcManager::new();
        let (_, hash) = preimage_and_hash(4);
        let mut lim = limits();
        lim.htlc_minimum_msat = 10_000;
        let result = mgr.propose_local(100, hash, 500_000, vec![], 1_000_000, &lim);
        assert!(matches!(result, Err(Error::BelowMinimum(_, 100))));
    }
}
