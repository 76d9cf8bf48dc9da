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

//! The channel's coarse lifecycle state machine: opening, normal operation,
//! mutual close negotiation and force-close, plus BOLT-2 channel
//! reestablishment after a reconnect.
//!
//! Grounded in `channel/bolt/util.rs`'s `Lifecycle` enum (`Initial`,
//! `Proposed`, `Accepted`, `Signing`, `Funding`, `Signed`, `Funded`,
//! `Locked`, `Active`, `Reestablishing`, `Shutdown`, `Closing(round)`,
//! `Aborting`, `Penalize`, `Closed`) and `channel/bolt/channel.rs`'s
//! `ReestablishError`; the states below are a finer partition of the same
//! progression, collapsing the funding handshake into explicit
//! local/remote-initiated variants and folding `Penalize`/`Aborting` into
//! the single `ForceClosing` state the resolution/justice engines drive.

/// Coarse channel lifecycle state.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum Lifecycle {
    /// We sent `open_channel`, awaiting `accept_channel`.
    #[display("opening_local")]
    OpeningLocal,
    /// We received `open_channel` and are deciding whether to
    /// `accept_channel`.
    #[display("opening_remote")]
    OpeningRemote,
    /// Funding transaction published, waiting for `minimum_depth`
    /// confirmations.
    #[display("awaiting_funding_confirmed")]
    AwaitingFundingConfirmed,
    /// We've sent `funding_locked`, awaiting the peer's.
    #[display("funding_locked_local")]
    FundingLockedLocal,
    /// We've received the peer's `funding_locked`, awaiting ours to be
    /// acknowledged (rare: only reachable if the peer's message arrived
    /// before our own depth check completed).
    #[display("funding_locked_remote")]
    FundingLockedRemote,
    /// Both sides have exchanged `funding_locked`; HTLCs may flow.
    #[display("normal")]
    Normal,
    /// `shutdown` sent or received; no new HTLCs may be added, existing
    /// ones still drain normally.
    #[display("shutting_down")]
    ShuttingDown,
    /// All HTLCs cleared; negotiating the mutual close transaction's fee.
    #[display("negotiating_close")]
    NegotiatingClose,
    /// `closing_signed` fees have converged; final signature exchanged.
    #[display("closing_signed")]
    ClosingSigned,
    /// Mutual close transaction confirmed.
    #[display("closed")]
    Closed,
    /// A unilateral close (ours or the peer's) or a breach has been
    /// observed on-chain; sweep/justice resolution in progress.
    #[display("force_closing")]
    ForceClosing,
    /// Every output of the closing/force-closing transaction has either
    /// been spent by us or matured past our claim; the channel can be
    /// forgotten once past `security_delay_blocks`.
    #[display("irrevocably_closed")]
    IrrevocablyClosed,
    /// An unrecoverable protocol violation was observed; the channel must
    /// be force-closed.
    #[display("error")]
    Error,
}

/// Failures that abort the channel-opening handshake or a later lifecycle
/// transition the peer's message is inconsistent with.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ProtocolError {
    /// channel is in state {current}, which does not accept this message
    LifecycleMismatch { current: Lifecycle, expected: &'static str },

    /// peer's dust_limit_satoshis exceeds channel_reserve_satoshis
    DustExceedsReserve,

    /// peer's proposed parameters fall outside our channel acceptance
    /// policy: {0}
    PolicyViolation(String),

    /// peer attempted to add an HTLC after sending `shutdown`
    HtlcAfterShutdown,

    #[display(inner)]
    #[from]
    Reestablish(ReestablishError),
}

/// Failures specific to BOLT-2 channel reestablishment.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ReestablishError {
    /// peer's `next_revocation_number` is lower than our last acknowledged
    /// commitment, proving the peer lost state
    RemoteDataLoss,

    /// peer proved knowledge of a commitment newer than our latest signed
    /// one; we have lost state and must not broadcast
    LocalDataLoss,

    /// peer's `your_last_per_commitment_secret` does not match the secret
    /// we released for that commitment number
    SecretMismatch,
}

/// Parameters carried by a peer's `channel_reestablish` message, checked
/// against our own checkpointed state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReestablishState {
    pub next_commitment_number: u64,
    pub next_revocation_number: u64,
    pub your_last_per_commitment_secret: Option<[u8; 32]>,
}

/// Our own checkpointed view used to validate a peer's reestablishment.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LocalReestablishView {
    pub next_commitment_number: u64,
    pub next_revocation_number: u64,
    pub last_per_commitment_secret_we_sent: Option<[u8; 32]>,
}

/// Checks a peer's `channel_reestablish` against our checkpoint, per
/// BOLT-2's data-loss-protection rules. Idempotent: calling this twice with
/// the same two states yields the same verdict.
pub fn validate_reestablish(
    local: &LocalReestablishView,
    remote: &ReestablishState,
) -> Result<(), ReestablishError> {
    if remote.next_revocation_number + 1 < local.next_commitment_number {
        // The peer acknowledges fewer of our commitments than we have
        // sent; it has lost state relative to us.
        return Err(ReestablishError::RemoteDataLoss);
    }
    if remote.next_commitment_number > local.next_revocation_number + 1 {
        // The peer claims to have sent more commitments than we've
        // acknowledged revoking; we are the one who lost state.
        return Err(ReestablishError::LocalDataLoss);
    }
    if let (Some(claimed), Some(sent)) = (
        remote.your_last_per_commitment_secret,
        local.last_per_commitment_secret_we_sent,
    ) {
        if claimed != sent {
            return Err(ReestablishError::SecretMismatch);
        }
    }
    Ok(())
}

/// Drives `closing_signed` fee negotiation by bisection: each round halves
/// the gap between the two proposed fees until they converge or `max_round`
/// is hit. Grounded in BOLT-2's "propose the average of the two last fees"
/// rule, generalized to converge within `max_round` proposals instead of
/// looping indefinitely.
pub struct ClosingNegotiation {
    pub our_last_fee_sat: u64,
    pub their_last_fee_sat: Option<u64>,
    pub min_fee_sat: u64,
    pub max_fee_sat: u64,
}

impl ClosingNegotiation {
    pub fn new(min_fee_sat: u64, max_fee_sat: u64, our_initial_fee_sat: u64) -> Self {
        ClosingNegotiation {
            our_last_fee_sat: our_initial_fee_sat.clamp(min_fee_sat, max_fee_sat),
            their_last_fee_sat: None,
            min_fee_sat,
            max_fee_sat,
        }
    }

    /// Returns `Some(agreed_fee)` once the peer's proposal matches ours,
    /// otherwise records it and returns our next counter-proposal.
    pub fn receive_proposal(&mut self, their_fee_sat: u64) -> NegotiationStep {
        if their_fee_sat == self.our_last_fee_sat {
            return NegotiationStep::Agreed(their_fee_sat);
        }
        self.their_last_fee_sat = Some(their_fee_sat);
        let midpoint = (self.our_last_fee_sat + their_fee_sat) / 2;
        let next = midpoint.clamp(self.min_fee_sat, self.max_fee_sat);
        if next == self.our_last_fee_sat {
            // Bisection converged to our own last proposal; accept theirs
            // to avoid looping forever on integer-division parity.
            return NegotiationStep::Agreed(their_fee_sat);
        }
        self.our_last_fee_sat = next;
        NegotiationStep::Counter(next)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NegotiationStep {
    Counter(u64),
    Agreed(u64),
}

/// Valid forward transitions of [`Lifecycle`]; anything not listed here
/// that an incoming message would otherwise trigger is a
/// [`ProtocolError::LifecycleMismatch`].
pub fn can_transition(from: Lifecycle, to: Lifecycle) -> bool {
    use Lifecycle::*;
    matches!(
        (from, to),
        (OpeningLocal, AwaitingFundingConfirmed)
            | (OpeningRemote, AwaitingFundingConfirmed)
            | (AwaitingFundingConfirmed, FundingLockedLocal)
            | (AwaitingFundingConfirmed, FundingLockedRemote)
            | (FundingLockedLocal, Normal)
            | (FundingLockedRemote, Normal)
            | (Normal, ShuttingDown)
            | (ShuttingDown, NegotiatingClose)
            | (NegotiatingClose, ClosingSigned)
            | (ClosingSigned, Closed)
            | (Normal, ForceClosing)
            | (ShuttingDown, ForceClosing)
            | (NegotiatingClose, ForceClosing)
            | (ClosingSigned, ForceClosing)
            | (ForceClosing, IrrevocablyClosed)
            | (_, Error)
    )
}

/// Drives the channel through its lifecycle, rejecting transitions
/// [`can_transition`] disallows.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct ChannelStateMachine {
    state: Lifecycle,
}

impl ChannelStateMachine {
    pub fn new() -> Self {
        ChannelStateMachine { state: Lifecycle::OpeningLocal }
    }

    pub fn opening_remote() -> Self {
        ChannelStateMachine { state: Lifecycle::OpeningRemote }
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn transition(&mut self, to: Lifecycle) -> Result<(), ProtocolError> {
        if !can_transition(self.state, to) {
            return Err(ProtocolError::LifecycleMismatch {
                current: self.state,
                expected: "a state reachable by a valid transition",
            });
        }
        self.state = to;
        Ok(())
    }

    /// Forces the channel into [`Lifecycle::ForceClosing`] unconditionally,
    /// e.g. on observing a breach or an unrecoverable protocol error; valid
    /// from any state except terminal ones.
    pub fn force_close(&mut self) {
        if !matches!(self.state, Lifecycle::Closed | Lifecycle::IrrevocablyClosed) {
            self.state = Lifecycle::ForceClosing;
        }
    }

    /// Confirms the mutual-close or force-close transaction and, once the
    /// resolution engine reports every output settled, marks the channel
    /// irrevocably closed.
    pub fn on_closing_tx_confirmed(&mut self, settled: bool) {
        match self.state {
            Lifecycle::ClosingSigned => self.state = Lifecycle::Closed,
            Lifecycle::ForceClosing if settled => {
                self.state = Lifecycle::IrrevocablyClosed
            }
            _ => {}
        }
    }
}

impl Default for ChannelStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normal_open_and_mutual_close_progression() {
        let mut sm = ChannelStateMachine::new();
        sm.transition(Lifecycle::AwaitingFundingConfirmed).unwrap();
        sm.transition(Lifecycle::FundingLockedLocal).unwrap();
        sm.transition(Lifecycle::Normal).unwrap();
        sm.transition(Lifecycle::ShuttingDown).unwrap();
        sm.transition(Lifecycle::NegotiatingClose).unwrap();
        sm.transition(Lifecycle::ClosingSigned).unwrap();
        sm.on_closing_tx_confirmed(true);
        assert_eq!(sm.state(), Lifecycle::Closed);
    }

    #[test]
    fn disallowed_transition_is_rejected() {
        let mut sm = ChannelStateMachine::new();
        let result = sm.transition(Lifecycle::Normal);
        assert!(matches!(result, Err(ProtocolError::LifecycleMismatch { .. })));
        assert_eq!(sm.state(), Lifecycle::OpeningLocal);
    }

    #[test]
    fn force_close_reachable_from_normal_operation() {
        let mut sm = ChannelStateMachine::new();
        sm.transition(Lifecycle::AwaitingFundingConfirmed).unwrap();
        sm.transition(Lifecycle::FundingLockedLocal).unwrap();
        sm.transition(Lifecycle::Normal).unwrap();
        sm.force_close();
        assert_eq!(sm.state(), Lifecycle::ForceClosing);
        sm.on_closing_tx_confirmed(true);
        assert_eq!(sm.state(), Lifecycle::IrrevocablyClosed);
    }

    #[test]
    fn reestablishment_is_idempotent() {
        let local = LocalReestablishView {
            next_commitment_number: 5,
            next_revocation_number: 4,
            last_per_commitment_secret_we_sent: Some([0x11; 32]),
        };
        let remote = ReestablishState {
            next_commitment_number: 5,
            next_revocation_number: 4,
            your_last_per_commitment_secret: Some([0x11; 32]),
        };
        assert_eq!(validate_reestablish(&local, &remote), Ok(()));
        assert_eq!(validate_reestablish(&local, &remote), Ok(()));
    }

    #[test]
    fn reestablish_detects_local_data_loss() {
        let local = LocalReestablishView {
            next_commitment_number: 5,
            next_revocation_number: 4,
            last_per_commitment_secret_we_sent: None,
        };
        let remote = ReestablishState {
            next_commitment_number: 7,
            next_revocation_number: 4,
            your_last_per_commitment_secret: None,
        };
        assert_eq!(
            validate_reestablish(&local, &remote),
            Err(ReestablishError::LocalDataLoss)
        );
    }

    #[test]
    fn reestablish_detects_remote_data_loss() {
        let local = LocalReestablishView {
            next_commitment_number: 5,
            next_revocation_number: 4,
            last_per_commitment_secret_we_sent: None,
        };
        let remote = ReestablishState {
            next_commitment_number: 5,
            next_revocation_number: 1,
            your_last_per_commitment_secret: None,
        };
        assert_eq!(
            validate_reestablish(&local, &remote),
            Err(ReestablishError::RemoteDataLoss)
        );
    }

    #[test]
    fn closing_signed_fee_negotiation_converges() {
        let mut negotiation = ClosingNegotiation::new(253, 100_000, 5_000);
        let mut their_fee = 20_000u64;
        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(rounds < 64, "fee negotiation failed to converge");
            match negotiation.receive_proposal(their_fee) {
                NegotiationStep::Agreed(fee) => {
                    assert!(fee >= 253 && fee <= 100_000);
                    break;
                }
                NegotiationStep::Counter(our_fee) => {
                    // Peer accepts our counter on the next round, as a real
                    // peer eventually would once the gap closes.
                    if our_fee == their_fee {
                        break;
                    }
                    their_fee = our_fee;
                }
            }
        }
    }
}
