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

//! Crate-wide error taxonomy. Every module below defines its own `Error`
//! enum for the failures that are meaningful at that seam; this type
//! aggregates them with `#[from]` so a single `?`-propagating call tree
//! surfaces the right top-level kind without manual `match`-and-wrap
//! boilerplate.

use crate::chainmonitor;
use crate::commitment;
use crate::htlc;
use crate::justice;
use crate::keyderiver;
use crate::lifecycle;
use crate::resolution;
use crate::sweep;

/// Top-level error kind for the channel-lifecycle engine. §7 of the design
/// groups failures into validation (bounced to the peer), cryptographic or
/// accounting violations (escalate to on-chain resolution) and resource
/// errors (retried with backoff); the variants below carry that policy in
/// their names and doc comments.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// peer message is inconsistent with the current channel state: {0}
    #[from]
    ProtocolViolation(lifecycle::ProtocolError),

    /// commitment or HTLC signature failed verification
    SignatureInvalid,

    /// a revealed per-commitment secret does not match the previously
    /// committed per-commitment point
    #[from]
    RevocationMismatch(keyderiver::Error),

    /// local data loss detected during channel reestablishment; refusing to
    /// publish a stale commitment
    LocalDataLoss,

    /// funder cannot cover the fee of the proposed commitment update
    #[from]
    FeeInsufficient(commitment::Error),

    /// trimming would drop a locally important HTLC
    DustViolation,

    /// chain adapter rejected the transaction; will retry with backoff
    BroadcastTransient,

    /// chain adapter rejected the transaction as malformed
    BroadcastPermanent,

    /// HTLC manager error: {0}
    #[from]
    Htlc(htlc::Error),

    /// resolution engine error: {0}
    #[from]
    Resolution(resolution::Error),

    /// sweep planner error: {0}
    #[from]
    Sweep(sweep::Error),

    /// justice engine error: {0}
    #[from]
    Justice(justice::Error),

    /// chain monitor error: {0}
    #[from]
    ChainMonitor(chainmonitor::Error),
}
