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

//! The channel aggregate: owns the nine components by value and exposes
//! the operations a peer-message handler or chain-event dispatcher drives.
//!
//! Grounded in `channel/bolt/channel.rs`'s `Channel<Bolt3>` struct, which
//! carries the same funding outpoint / balances / HTLC list / keyset
//! fields this aggregate does, but reaches them through the grounding
//! library's generic `Extension`/`Nomenclature` trait-object framework
//! (`extensions: BTreeMap<ExtensionId, Box<dyn ChannelExtension>>`
//! dispatched by a `Bolt3` nomenclature enum). This aggregate replaces that
//! indirection with the nine components below held directly by value, and
//! replaces the framework's listener/subscribe calls with the explicit
//! methods below, matching the redesign this crate's expanded design notes
//! call for.

use bitcoin::{OutPoint, Script};
use secp256k1::PublicKey;

use crate::chainmonitor::ChainMonitor;
use crate::commitment::{
    BuiltCommitment, CommitmentBuilder, CommitmentKeys, CommittedHtlc, Side,
};
use crate::error::Error;
use crate::htlc::{HtlcId, HtlcLimits, HtlcManager};
use crate::interfaces::SpendEvent;
use crate::keyderiver::RevocationStore;
use crate::lifecycle::{ChannelStateMachine, Lifecycle};
use crate::resolution::CloseClass;

/// Channel parameters fixed at open time (or updated in-band via
/// `update_fee`), grounded in `channel/bolt/policy.rs`'s `CommonParams` /
/// `PeerParams` pair, flattened into the single set this crate's channel
/// needs to build commitments and gate HTLC proposals.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct ChannelConfig {
    pub dust_limit_sat: u64,
    pub anchors: bool,
    pub is_funder: bool,
    pub to_self_delay: u16,
    pub security_delay_blocks: u32,
    pub htlc_limits: HtlcLimits,
}

/// A single channel's full lifecycle state: lifecycle stage, balances,
/// in-flight HTLCs, the revocation store, chain observation, and current
/// feerate. The caller supplies per-commitment pubkeys (via
/// [`crate::interfaces::KeyHolder`]) at the point of building or revoking a
/// commitment; this aggregate never touches a raw basepoint secret.
///
/// This is the checkpoint the embedding application's
/// [`crate::interfaces::PersistenceStore`] carries across restarts,
/// corresponding to the grounding library's `IntegralState`-keyed
/// `ChannelState` (`channel.rs`'s `IntegralState<N> = BTreeMap<N, Box<dyn
/// State>>`): every field here round-trips through `StrictEncode`/
/// `StrictDecode`, so the store treats the encoded bytes as opaque and
/// single-writer rather than reaching into individual fields.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(StrictEncode, StrictDecode)]
pub struct Channel {
    pub funding_outpoint: OutPoint,
    pub obscuring_mask: u64,
    pub local_commitment_number: u64,
    pub remote_commitment_number: u64,
    pub to_local_msat: u64,
    pub to_remote_msat: u64,
    pub feerate_per_kw: u32,
    pub config: ChannelConfig,
    pub htlcs: HtlcManager,
    pub revocations: RevocationStore,
    /// Per-commitment points the peer has advertised for not-yet-revoked
    /// remote commitment numbers, keyed by commitment number; consumed by
    /// [`Self::revoke_remote_commitment`] to verify the secret the peer
    /// later reveals actually matches what it committed to.
    pub remote_per_commitment_points: std::collections::BTreeMap<u64, PublicKey>,
    pub lifecycle: ChannelStateMachine,
    pub chain_monitor: ChainMonitor,
}

impl Channel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        funding_outpoint: OutPoint,
        obscuring_mask: u64,
        to_local_msat: u64,
        to_remote_msat: u64,
        feerate_per_kw: u32,
        config: ChannelConfig,
        chain_monitor: ChainMonitor,
        opener: bool,
    ) -> Self {
        use crate::keyderiver::FIRST_COMMITMENT_NUMBER;
        Channel {
            funding_outpoint,
            obscuring_mask,
            local_commitment_number: FIRST_COMMITMENT_NUMBER,
            remote_commitment_number: FIRST_COMMITMENT_NUMBER,
            to_local_msat,
            to_remote_msat,
            feerate_per_kw,
            config,
            htlcs: HtlcManager::new(),
            revocations: RevocationStore::new(),
            remote_per_commitment_points: std::collections::BTreeMap::new(),
            lifecycle: if opener {
                ChannelStateMachine::new()
            } else {
                ChannelStateMachine::opening_remote()
            },
            chain_monitor,
        }
    }

    pub fn state(&self) -> Lifecycle {
        self.lifecycle.state()
    }

    /// Proposes a locally-originated HTLC, per BOLT-2 `update_add_htlc`.
    pub fn propose_htlc(
        &mut self,
        amount_msat: u64,
        payment_hash: [u8; 32],
        cltv_expiry: u32,
        onion_routing_packet: Vec<u8>,
    ) -> Result<HtlcId, Error> {
        let id = self
            .htlcs
            .propose_local(
                amount_msat,
                payment_hash,
                cltv_expiry,
                onion_routing_packet,
                self.to_local_msat,
                &self.config.htlc_limits,
            )
            .map_err(Error::from)?;
        log::debug!(
            "proposed htlc {} for {} msat, cltv_expiry {}",
            id,
            amount_msat,
            cltv_expiry
        );
        Ok(id)
    }

    /// HTLCs committed on `side`'s chain, as seen from that side: the two
    /// chains advance independently (see [`HtlcManager::advance_local_round`]/
    /// [`HtlcManager::advance_remote_round`]), so this genuinely differs
    /// between `Side::Local` and `Side::Remote` whenever a round is only
    /// half-complete.
    fn committed_htlcs(&self, side: Side) -> Vec<CommittedHtlc> {
        self.htlcs
            .committed(side)
            .map(|h| CommittedHtlc {
                htlc_id: h.htlc_id,
                direction: h.direction,
                amount_msat: h.amount_msat,
                payment_hash: h.payment_hash,
                cltv_expiry: h.cltv_expiry,
            })
            .collect()
    }

    /// Builds the next commitment transaction for `side`, applying BOLT-3
    /// dust trimming over the currently committed HTLC set.
    ///
    /// [`CommitmentBuilder::build`] takes `to_local_msat`/`is_funder` from
    /// the perspective of the commitment's own owner, so when rendering the
    /// peer's mirrored commitment (`Side::Remote`) the balances are swapped
    /// and the fee-payer flag is flipped; `self.config.is_funder` itself
    /// (which side funded the channel) never changes.
    pub fn build_commitment(
        &self,
        side: Side,
        keys: &CommitmentKeys,
    ) -> Result<BuiltCommitment, Error> {
        let commitment_number = match side {
            Side::Local => self.local_commitment_number,
            Side::Remote => self.remote_commitment_number,
        };
        let (to_local_msat, to_remote_msat, owner_is_funder) = match side {
            Side::Local => {
                (self.to_local_msat, self.to_remote_msat, self.config.is_funder)
            }
            Side::Remote => {
                (self.to_remote_msat, self.to_local_msat, !self.config.is_funder)
            }
        };
        CommitmentBuilder::build(
            self.funding_outpoint,
            side,
            commitment_number,
            self.obscuring_mask,
            to_local_msat,
            to_remote_msat,
            &self.committed_htlcs(side),
            self.feerate_per_kw,
            self.config.dust_limit_sat,
            self.config.anchors,
            owner_is_funder,
            self.config.to_self_delay,
            keys,
        )
        .map_err(Error::from)
    }

    /// Applies a mutually signed `commitment_signed`/`revoke_and_ack`
    /// round on our own commitment chain: advances the HTLC state machine
    /// and counts down the next local commitment number.
    pub fn advance_local_commitment(&mut self) {
        self.htlcs.advance_local_round();
        self.local_commitment_number -= 1;
    }

    /// Applies a mutually signed `commitment_signed`/`revoke_and_ack`
    /// round on the peer's commitment chain.
    pub fn advance_remote_commitment(&mut self) {
        self.htlcs.advance_remote_round();
        self.remote_commitment_number -= 1;
    }

    /// Records the per-commitment point the peer has advertised for
    /// `index`, establishing what [`Self::revoke_remote_commitment`] must
    /// later verify the revealed secret against.
    pub fn record_remote_per_commitment_point(&mut self, index: u64, point: PublicKey) {
        self.remote_per_commitment_points.insert(index, point);
    }

    /// Records the per-commitment secret the peer revealed in revoking
    /// their previous commitment, per BOLT-3's data-loss-protection
    /// contract. Rejects a secret that does not reproduce the
    /// per-commitment point previously advertised for `index` via
    /// [`Self::record_remote_per_commitment_point`] — a peer that releases
    /// a secret we never asked it to reveal, or the wrong one, is treated
    /// as a fatal protocol error rather than silently accepted.
    pub fn revoke_remote_commitment(
        &mut self,
        index: u64,
        secret: [u8; 32],
    ) -> Result<(), Error> {
        if let Some(&expected_point) = self.remote_per_commitment_points.get(&index) {
            let secret_key = secp256k1::SecretKey::from_slice(&secret)
                .map_err(|_| Error::SignatureInvalid)?;
            let derived_point =
                PublicKey::from_secret_key(secp256k1::SECP256K1, &secret_key);
            if derived_point != expected_point {
                return Err(Error::from(
                    crate::keyderiver::Error::PerCommitmentPointMismatch(index),
                ));
            }
        }
        self.revocations.insert(index, secret).map_err(Error::from)?;
        self.remote_per_commitment_points.remove(&index);
        Ok(())
    }

    /// Dispatches a chain-adapter spend event into the on-chain
    /// resolution classifier, transitioning the lifecycle to
    /// `ForceClosing` the first time a non-cooperative spend of the
    /// funding output is observed.
    pub fn handle_spend(
        &mut self,
        event: SpendEvent,
    ) -> Result<Option<CloseClass>, Error> {
        let is_funding_spend = event.outpoint == self.funding_outpoint;
        let class = self.chain_monitor.handle_spend(event).map_err(Error::from)?;
        if is_funding_spend {
            if let Some(class) = class {
                log::info!("funding output spent, classified as {}", class);
                match class {
                    CloseClass::MutualClose => {
                        let _ = self.lifecycle.transition(Lifecycle::NegotiatingClose);
                        let _ = self.lifecycle.transition(Lifecycle::ClosingSigned);
                    }
                    _ => {
                        log::warn!("non-cooperative funding spend, force-closing");
                        self.lifecycle.force_close();
                    }
                }
            }
        }
        Ok(class)
    }

    pub fn request_shutdown(&mut self) -> Result<(), Error> {
        self.lifecycle
            .transition(Lifecycle::ShuttingDown)
            .map_err(Error::from)
    }

    pub fn anchor_pubkeys(&self, local: PublicKey, remote: PublicKey) -> (Script, Script) {
        use crate::scriptbuilder::ScriptBuilder;
        use wallet::scripts::PubkeyScript;
        (
            PubkeyScript::ln_anchor(local).into(),
            PubkeyScript::ln_anchor(remote).into(),
        )
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::Txid;
    use secp256k1::{Secp256k1, SecretKey};

    use super::*;
    use crate::chainmonitor::ChainMonitor;
    use crate::resolution::KnownTransactions;

    fn sample_keys() -> CommitmentKeys {
        let secp = Secp256k1::new();
        let k = |b: u8| {
            let sk = SecretKey::from_slice(&[b; 32]).unwrap();
            PublicKey::from_secret_key(&secp, &sk)
        };
        CommitmentKeys {
            revocationpubkey: k(1),
            local_delayedpubkey: k(2),
            remote_pubkey: k(3),
            local_htlcpubkey: k(4),
            remote_htlcpubkey: k(5),
            local_funding_pubkey: k(6),
            remote_funding_pubkey: k(7),
        }
    }

    fn sample_channel() -> Channel {
        let funding_outpoint = OutPoint::new(
            Txid::from_str(
                "fd2105607605d2302994ffea703b09f66b6351816ee737a93e42a841ea20bbad",
            )
            .unwrap(),
            0,
        );
        let config = ChannelConfig {
            dust_limit_sat: 546,
            anchors: false,
            is_funder: true,
            to_self_delay: 144,
            security_delay_blocks: 144,
            htlc_limits: HtlcLimits {
                max_accepted_htlcs: 30,
                max_htlc_value_in_flight_msat: 1_000_000_000,
                htlc_minimum_msat: 1,
            },
        };
        let mut channel = Channel::new(
            funding_outpoint,
            0,
            700_000_000,
            300_000_000,
            15_000,
            config,
            ChainMonitor::new(KnownTransactions::default()),
            true,
        );
        channel.lifecycle.transition(Lifecycle::AwaitingFundingConfirmed).unwrap();
        channel.lifecycle.transition(Lifecycle::FundingLockedLocal).unwrap();
        channel.lifecycle.transition(Lifecycle::Normal).unwrap();
        channel
    }

    #[test]
    fn propose_build_and_advance_round_trip() {
        let mut channel = sample_channel();
        let keys = sample_keys();
        channel
            .propose_htlc(50_000_000, [9u8; 32], 600_000, vec![])
            .unwrap();
        channel.advance_local_commitment();
        let built = channel.build_commitment(Side::Local, &keys).unwrap();
        assert_eq!(built.commitment_number, channel.local_commitment_number);
        assert!(built
            .outputs
            .iter()
            .any(|o| o.htlc_id == Some(HtlcId(0))));
    }

    #[test]
    fn remote_commitment_swaps_balances_and_fee_payer() {
        use crate::scriptbuilder::ScriptBuilder;
        use wallet::scripts::PubkeyScript;

        // Remote funds the channel, so the fee always comes out of
        // `to_remote_msat` regardless of whose commitment is rendered.
        let mut channel = sample_channel();
        channel.config.is_funder = false;
        let keys = sample_keys();

        let to_local_script: Script =
            PubkeyScript::ln_to_local(keys.revocationpubkey, keys.local_delayedpubkey, 144)
                .into();
        let to_remote_script: Script =
            PubkeyScript::ln_to_remote_legacy(keys.remote_pubkey).into();

        let fee_sat = 724 * 15_000 / 1000;

        let local_built = channel.build_commitment(Side::Local, &keys).unwrap();
        let local_to_local = local_built
            .outputs
            .iter()
            .find(|o| o.script_pubkey == to_local_script)
            .unwrap();
        let local_to_remote = local_built
            .outputs
            .iter()
            .find(|o| o.script_pubkey == to_remote_script)
            .unwrap();
        assert_eq!(local_to_local.value_sat, 700_000); // local not funder
        assert_eq!(local_to_remote.value_sat, 300_000 - fee_sat);

        let remote_built = channel.build_commitment(Side::Remote, &keys).unwrap();
        let remote_to_local = remote_built
            .outputs
            .iter()
            .find(|o| o.script_pubkey == to_local_script)
            .unwrap();
        let remote_to_remote = remote_built
            .outputs
            .iter()
            .find(|o| o.script_pubkey == to_remote_script)
            .unwrap();
        // The owner of the remote commitment is the remote party, whose
        // real balance (to_remote_msat from our perspective) now sits in
        // the to_local slot and still carries the fee.
        assert_eq!(remote_to_local.value_sat, 300_000 - fee_sat);
        assert_eq!(remote_to_remote.value_sat, 700_000);
    }

    #[test]
    fn revoke_remote_commitment_rejects_mismatched_secret() {
        let mut channel = sample_channel();
        let secp = Secp256k1::new();
        let real_secret = SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        let real_point = PublicKey::from_secret_key(&secp, &real_secret);
        channel.record_remote_per_commitment_point(
            channel.remote_commitment_number,
            real_point,
        );
        let wrong_secret = [0x43u8; 32];
        let result = channel
            .revoke_remote_commitment(channel.remote_commitment_number, wrong_secret);
        assert!(matches!(result, Err(Error::RevocationMismatch(_))));
        assert!(channel.revocations.is_empty());
    }

    #[test]
    fn revoke_remote_commitment_accepts_matching_secret() {
        let mut channel = sample_channel();
        let secp = Secp256k1::new();
        let real_secret = SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        let real_point = PublicKey::from_secret_key(&secp, &real_secret);
        let index = channel.remote_commitment_number;
        channel.record_remote_per_commitment_point(index, real_point);
        channel
            .revoke_remote_commitment(index, real_secret.secret_bytes())
            .unwrap();
        assert!(!channel.remote_per_commitment_points.contains_key(&index));
    }

    #[test]
    fn force_close_on_unrecognized_funding_spend() {
        let mut channel = sample_channel();
        channel.chain_monitor.watch_outpoint(channel.funding_outpoint);
        let spending_tx = bitcoin::Transaction {
            version: 2,
            lock_time: 0,
            input: vec![],
            output: vec![],
        };
        channel
            .handle_spend(SpendEvent {
                outpoint: channel.funding_outpoint,
                spending_tx,
                height: Some(100),
            })
            .unwrap();
        assert_eq!(channel.state(), Lifecycle::ForceClosing);
    }
}
