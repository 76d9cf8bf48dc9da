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

//! BOLT-3 witness scripts: funding, to_local, to_remote (legacy and
//! anchors variants), offered/received HTLC and anchor outputs.
//!
//! Grounded in `channel/bolt/channel.rs`'s `ScriptGenerators` trait, which
//! already produces `LockScript`/`WitnessScript`/`PubkeyScript` facets of
//! `ln_funding`/`ln_to_local`/`ln_to_remote_v1`/`ln_to_remote_v2` from a
//! single set of typed parameters — kept here because the commitment PSBT,
//! the rendered `TxOut` and a `bip32_derivation` map each need a different
//! facet of the same script and must never drift apart. This module
//! generalizes the trait with the two output kinds BOLT-3 adds beyond what
//! the grounding library covers: offered/received HTLC and anchor.

use bitcoin::blockdata::opcodes::all::*;
use bitcoin::blockdata::script::{self, Script};
use bitcoin::hashes::{hash160, ripemd160, Hash};
use bitcoin::PublicKey as BtcPublicKey;
use secp256k1::PublicKey;
use wallet::lex_order::LexOrder;
use wallet::scripts::{LockScript, PubkeyScript, WitnessScript};

/// Extends the grounding library's [`ScriptGenerators`]-style facets with
/// the output kinds BOLT-3 defines beyond funding/to_local/to_remote:
/// offered HTLC, received HTLC and anchor.
pub trait ScriptBuilder: Sized {
    fn ln_funding(local_pubkey: PublicKey, remote_pubkey: PublicKey) -> Self;

    fn ln_to_local(
        revocationpubkey: PublicKey,
        delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self;

    /// Legacy `to_remote`: a plain P2WPKH, no witness script.
    fn ln_to_remote_legacy(remote_pubkey: PublicKey) -> Self;

    /// Anchors-negotiated `to_remote`: P2WSH with a one-block CSV, so the
    /// output cannot be swept the same block it confirms (prevents
    /// pinning attacks on anchor-enabled channels).
    fn ln_to_remote_anchors(remote_pubkey: PublicKey) -> Self;

    fn ln_offered_htlc(
        revocationpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        payment_hash: [u8; 32],
        anchors: bool,
    ) -> Self;

    fn ln_received_htlc(
        revocationpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        payment_hash: [u8; 32],
        cltv_expiry: u32,
        anchors: bool,
    ) -> Self;

    fn ln_anchor(funding_pubkey: PublicKey) -> Self;
}

fn bpk(pk: PublicKey) -> BtcPublicKey {
    BtcPublicKey::new(pk)
}

fn funding_lock_script(local: PublicKey, remote: PublicKey) -> Script {
    let keys = vec![bpk(local), bpk(remote)].lex_ordered();
    script::Builder::new()
        .push_int(2)
        .push_key(&keys[0])
        .push_key(&keys[1])
        .push_int(2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

fn to_local_lock_script(
    revocationpubkey: PublicKey,
    delayedpubkey: PublicKey,
    to_self_delay: u16,
) -> Script {
    script::Builder::new()
        .push_opcode(OP_IF)
        .push_key(&bpk(revocationpubkey))
        .push_opcode(OP_ELSE)
        .push_int(to_self_delay as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_key(&bpk(delayedpubkey))
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

fn to_remote_anchors_lock_script(remote_pubkey: PublicKey) -> Script {
    script::Builder::new()
        .push_key(&bpk(remote_pubkey))
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_int(1)
        .push_opcode(OP_CSV)
        .into_script()
}

fn offered_htlc_lock_script(
    revocationpubkey: PublicKey,
    remote_htlcpubkey: PublicKey,
    local_htlcpubkey: PublicKey,
    payment_hash: [u8; 32],
    anchors: bool,
) -> Script {
    let revocation_hash = hash160::Hash::hash(&revocationpubkey.serialize());
    let payment_hash_ripemd = ripemd160::Hash::hash(&payment_hash);

    let mut builder = script::Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(revocation_hash.as_inner())
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE)
        .push_key(&bpk(remote_htlcpubkey))
        .push_opcode(OP_SWAP)
        .push_opcode(OP_SIZE)
        .push_int(32)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_NOTIF)
        .push_opcode(OP_DROP)
        .push_int(2)
        .push_opcode(OP_SWAP)
        .push_key(&bpk(local_htlcpubkey))
        .push_int(2)
        .push_opcode(OP_CHECKMULTISIG)
        .push_opcode(OP_ELSE)
        .push_opcode(OP_HASH160)
        .push_slice(payment_hash_ripemd.as_inner())
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF);
    if anchors {
        builder = builder
            .push_int(1)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP);
    }
    builder.push_opcode(OP_ENDIF).into_script()
}

fn received_htlc_lock_script(
    revocationpubkey: PublicKey,
    remote_htlcpubkey: PublicKey,
    local_htlcpubkey: PublicKey,
    payment_hash: [u8; 32],
    cltv_expiry: u32,
    anchors: bool,
) -> Script {
    let revocation_hash = hash160::Hash::hash(&revocationpubkey.serialize());
    let payment_hash_ripemd = ripemd160::Hash::hash(&payment_hash);

    let mut builder = script::Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(revocation_hash.as_inner())
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE)
        .push_key(&bpk(remote_htlcpubkey))
        .push_opcode(OP_SWAP)
        .push_opcode(OP_SIZE)
        .push_int(32)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_HASH160)
        .push_slice(payment_hash_ripemd.as_inner())
        .push_opcode(OP_EQUALVERIFY)
        .push_int(2)
        .push_opcode(OP_SWAP)
        .push_key(&bpk(local_htlcpubkey))
        .push_int(2)
        .push_opcode(OP_CHECKMULTISIG)
        .push_opcode(OP_ELSE)
        .push_opcode(OP_DROP)
        .push_int(cltv_expiry as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF);
    if anchors {
        builder = builder
            .push_int(1)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP);
    }
    builder.push_opcode(OP_ENDIF).into_script()
}

fn anchor_lock_script(funding_pubkey: PublicKey) -> Script {
    script::Builder::new()
        .push_key(&bpk(funding_pubkey))
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_IFDUP)
        .push_opcode(OP_NOTIF)
        .push_int(16)
        .push_opcode(OP_CSV)
        .push_opcode(OP_ENDIF)
        .into_script()
}

impl ScriptBuilder for LockScript {
    fn ln_funding(local_pubkey: PublicKey, remote_pubkey: PublicKey) -> Self {
        funding_lock_script(local_pubkey, remote_pubkey).into()
    }

    fn ln_to_local(
        revocationpubkey: PublicKey,
        delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        to_local_lock_script(revocationpubkey, delayedpubkey, to_self_delay)
            .into()
    }

    fn ln_to_remote_legacy(_: PublicKey) -> Self {
        unimplemented!("LockScript can't be generated for a bare P2WPKH output")
    }

    fn ln_to_remote_anchors(remote_pubkey: PublicKey) -> Self {
        to_remote_anchors_lock_script(remote_pubkey).into()
    }

    fn ln_offered_htlc(
        revocationpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        payment_hash: [u8; 32],
        anchors: bool,
    ) -> Self {
        offered_htlc_lock_script(
            revocationpubkey,
            remote_htlcpubkey,
            local_htlcpubkey,
            payment_hash,
            anchors,
        )
        .into()
    }

    fn ln_received_htlc(
        revocationpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        payment_hash: [u8; 32],
        cltv_expiry: u32,
        anchors: bool,
    ) -> Self {
        received_htlc_lock_script(
            revocationpubkey,
            remote_htlcpubkey,
            local_htlcpubkey,
            payment_hash,
            cltv_expiry,
            anchors,
        )
        .into()
    }

    fn ln_anchor(funding_pubkey: PublicKey) -> Self {
        anchor_lock_script(funding_pubkey).into()
    }
}

macro_rules! via_lock_script {
    ($ty:ty) => {
        impl ScriptBuilder for $ty {
            fn ln_funding(local_pubkey: PublicKey, remote_pubkey: PublicKey) -> Self {
                LockScript::ln_funding(local_pubkey, remote_pubkey).into()
            }

            fn ln_to_local(
                revocationpubkey: PublicKey,
                delayedpubkey: PublicKey,
                to_self_delay: u16,
            ) -> Self {
                LockScript::ln_to_local(
                    revocationpubkey,
                    delayedpubkey,
                    to_self_delay,
                )
                .into()
            }

            fn ln_to_remote_legacy(remote_pubkey: PublicKey) -> Self {
                <$ty>::from_pubkey_legacy(remote_pubkey)
            }

            fn ln_to_remote_anchors(remote_pubkey: PublicKey) -> Self {
                LockScript::ln_to_remote_anchors(remote_pubkey).into()
            }

            fn ln_offered_htlc(
                revocationpubkey: PublicKey,
                remote_htlcpubkey: PublicKey,
                local_htlcpubkey: PublicKey,
                payment_hash: [u8; 32],
                anchors: bool,
            ) -> Self {
                LockScript::ln_offered_htlc(
                    revocationpubkey,
                    remote_htlcpubkey,
                    local_htlcpubkey,
                    payment_hash,
                    anchors,
                )
                .into()
            }

            fn ln_received_htlc(
                revocationpubkey: PublicKey,
                remote_htlcpubkey: PublicKey,
                local_htlcpubkey: PublicKey,
                payment_hash: [u8; 32],
                cltv_expiry: u32,
                anchors: bool,
            ) -> Self {
                LockScript::ln_received_htlc(
                    revocationpubkey,
                    remote_htlcpubkey,
                    local_htlcpubkey,
                    payment_hash,
                    cltv_expiry,
                    anchors,
                )
                .into()
            }

            fn ln_anchor(funding_pubkey: PublicKey) -> Self {
                LockScript::ln_anchor(funding_pubkey).into()
            }
        }
    };
}

via_lock_script!(WitnessScript);

impl WitnessScript {
    fn from_pubkey_legacy(_: PublicKey) -> Self {
        unimplemented!(
            "WitnessScript can't be generated for a bare P2WPKH output"
        )
    }
}

impl ScriptBuilder for PubkeyScript {
    fn ln_funding(local_pubkey: PublicKey, remote_pubkey: PublicKey) -> Self {
        WitnessScript::ln_funding(local_pubkey, remote_pubkey).to_p2wsh()
    }

    fn ln_to_local(
        revocationpubkey: PublicKey,
        delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        WitnessScript::ln_to_local(
            revocationpubkey,
            delayedpubkey,
            to_self_delay,
        )
        .to_p2wsh()
    }

    fn ln_to_remote_legacy(remote_pubkey: PublicKey) -> Self {
        bpk(remote_pubkey)
            .wpubkey_hash()
            .expect("Lightning payment keys are always compressed")
            .into()
    }

    fn ln_to_remote_anchors(remote_pubkey: PublicKey) -> Self {
        WitnessScript::ln_to_remote_anchors(remote_pubkey).to_p2wsh()
    }

    fn ln_offered_htlc(
        revocationpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        payment_hash: [u8; 32],
        anchors: bool,
    ) -> Self {
        WitnessScript::ln_offered_htlc(
            revocationpubkey,
            remote_htlcpubkey,
            local_htlcpubkey,
            payment_hash,
            anchors,
        )
        .to_p2wsh()
    }

    fn ln_received_htlc(
        revocationpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        payment_hash: [u8; 32],
        cltv_expiry: u32,
        anchors: bool,
    ) -> Self {
        WitnessScript::ln_received_htlc(
            revocationpubkey,
            remote_htlcpubkey,
            local_htlcpubkey,
            payment_hash,
            cltv_expiry,
            anchors,
        )
        .to_p2wsh()
    }

    fn ln_anchor(funding_pubkey: PublicKey) -> Self {
        WitnessScript::ln_anchor(funding_pubkey).to_p2wsh()
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use amplify::hex::ToHex;

    use super::*;

    macro_rules! pk {
        ($hex:expr) => {
            PublicKey::from_str($hex).unwrap()
        };
    }

    #[test]
    fn bolt3_funding_witness_script() {
        let local_funding_pubkey = pk!("023da092f6980e58d2c037173180e9a465476026ee50f96695963e8efe436f54eb");
        let remote_funding_pubkey = pk!("030e9f7b623d2ccc7c9bd44d66d5ce21ce504c0acf6385a132cec6d3c39fa711c1");
        let witness_script =
            WitnessScript::ln_funding(local_funding_pubkey, remote_funding_pubkey);
        assert_eq!(
            witness_script.to_hex(),
            "5221023da092f6980e58d2c037173180e9a465476026ee50f96695963e8efe436f\
            54eb21030e9f7b623d2ccc7c9bd44d66d5ce21ce504c0acf6385a132cec6d3c39fa\
            711c152ae"
        );
    }

    #[test]
    fn offered_and_received_htlc_scripts_no_standardness_violation() {
        let secp = secp256k1::Secp256k1::new();
        let sk = |b: u8| secp256k1::SecretKey::from_slice(&[b; 32]).unwrap();
        let pk = |b: u8| PublicKey::from_secret_key(&secp, &sk(b));
        let script = WitnessScript::ln_offered_htlc(
            pk(1),
            pk(2),
            pk(3),
            [7u8; 32],
            false,
        );
        assert!(script.len() < 10_000);
        let script_anchors = WitnessScript::ln_received_htlc(
            pk(1),
            pk(2),
            pk(3),
            [7u8; 32],
            500_000,
            true,
        );
        assert!(script_anchors.len() < 10_000);
    }
}
