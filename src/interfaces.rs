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

//! Trait boundaries to the engine's external collaborators: the peer
//! transport, the chain adapter, the key holder and the persistence store.
//! The core never implements these; it only consumes them, mirroring the
//! split between `RemoteKeyset` (public-only) and `LocalKeyset` (derived
//! locally) already present in `channel/bolt/keyset.rs` and the
//! `chain::keysinterface::KeysInterface`-style boundary surveyed from the
//! wider corpus.

use bitcoin::{OutPoint, Transaction, Txid};
use secp256k1::ecdsa::Signature;
use secp256k1::SecretKey;

use crate::htlc::HtlcId;
use crate::keyderiver::PublicBasepoints;

/// Channel index used to derive a channel's extended key, per LNPBP-46.
pub type ChannelIndex = u32;

/// An event reporting a spend of a watched outpoint.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SpendEvent {
    pub outpoint: OutPoint,
    pub spending_tx: Transaction,
    pub height: Option<u32>,
}

/// An event reporting a confirmation-depth update for a previously observed
/// transaction. `depth == 0` means the transaction is seen in the mempool
/// but unconfirmed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DepthEvent {
    pub txid: Txid,
    pub depth: u32,
}

/// Failure returned by [`ChainAdapter::broadcast`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum BroadcastError {
    /// chain adapter rejected the transaction transiently (mempool full,
    /// fee too low); retry with backoff
    Transient,
    /// chain adapter rejected the transaction as malformed; this is a bug
    Permanent,
}

/// The chain-observation and broadcast boundary consumed by
/// [`crate::chainmonitor::ChainMonitor`]. Object-safe: the embedding
/// executor adapts its concrete stream type to calls into
/// `ChainMonitor::handle_event` rather than the core polling a stream
/// itself.
pub trait ChainAdapter {
    /// Begin watching an outpoint for a spending transaction.
    fn watch_outpoint(&self, outpoint: OutPoint);

    /// Begin watching a txid for confirmation-depth updates.
    fn watch_confirmations(&self, txid: Txid);

    /// Current chain tip height, for CLTV triggers.
    fn current_height(&self) -> u32;

    /// Broadcast a fully-signed raw transaction.
    fn broadcast(&self, raw_tx: &Transaction) -> Result<Txid, BroadcastError>;
}

/// The signing and key-revelation boundary. The core never holds a raw
/// [`SecretKey`] for a basepoint, only ever a [`PublicKey`] plus the
/// capability to ask the key holder to sign or reveal — the key holder may
/// itself be remote (a hardware signer, a remote signing daemon).
pub trait KeyHolder {
    /// Public basepoints for a given channel index.
    fn basepoints(&self, channel_index: ChannelIndex) -> PublicBasepoints;

    /// Sign a commitment transaction digest for `commitment_number`.
    fn sign_commitment(
        &self,
        channel_index: ChannelIndex,
        commitment_number: u64,
        tx_digest: [u8; 32],
    ) -> Signature;

    /// Sign an HTLC transaction digest (HTLC-success / HTLC-timeout /
    /// second-stage sweep) identified by `htlc_id` at a given commitment.
    fn sign_htlc(
        &self,
        channel_index: ChannelIndex,
        commitment_number: u64,
        htlc_id: HtlcId,
        tx_digest: [u8; 32],
    ) -> Signature;

    /// Reveal the per-commitment secret for a commitment number we have
    /// already revoked.
    fn reveal_per_commitment_secret(
        &self,
        channel_index: ChannelIndex,
        commitment_number: u64,
    ) -> SecretKey;
}

/// Opaque checkpoint bytes the engine persists across restarts. The core
/// never inspects the bytes beyond `StrictEncode`/`StrictDecode`.
pub type Checkpoint = Vec<u8>;

/// The persistence boundary: atomic, single-writer, keyed by channel id.
pub trait PersistenceStore {
    type ChannelId;
    type Error: std::fmt::Debug;

    fn store(
        &self,
        channel_id: Self::ChannelId,
        checkpoint: Checkpoint,
    ) -> Result<(), Self::Error>;

    fn load(
        &self,
        channel_id: Self::ChannelId,
    ) -> Result<Option<Checkpoint>, Self::Error>;
}
