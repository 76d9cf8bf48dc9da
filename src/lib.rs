// LNP/BP Core Library implementing LNPBP specifications & standards
// Written in 2019 by
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

//! Channel-lifecycle engine for non-custodial Lightning Network wallets:
//! BOLT-2/BOLT-3 key derivation, script and commitment construction, HTLC
//! and channel-state management, and on-chain resolution/sweep/justice
//! once a commitment confirms. The peer transport, routing and
//! persistence layers are out of scope; this crate consumes them through
//! the trait boundaries in [`interfaces`].

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate strict_encoding;

#[cfg(feature = "serde")]
#[macro_use]
extern crate serde_with;
#[cfg(feature = "serde")]
extern crate serde_crate as serde;

pub mod chainmonitor;
pub mod channel;
pub mod commitment;
pub mod error;
pub mod htlc;
pub mod interfaces;
pub mod justice;
pub mod keyderiver;
pub mod lifecycle;
pub mod resolution;
pub mod scriptbuilder;
pub mod sweep;

pub use channel::{Channel, ChannelConfig};
pub use error::Error;
