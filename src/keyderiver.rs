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

//! Deterministic derivation of channel basepoints and per-commitment
//! secrets/points (LNPBP-46 / BOLT-3), and the compact (Rusty-Russell)
//! per-commitment secret store.
//!
//! Basepoint derivation is grounded in `channel/bolt/keyset.rs`'s
//! `LocalKeyset::with`, which walks `ExtendedPrivKey::derive_priv` over
//! seven single-level hardened children of a channel extended key reached
//! via the LNPBP-46 path `m / 9735' / coin' / account' / change /
//! channel_index`. Revocation key derivation reuses the exact linear
//! combination exercised by `channel/bolt/channel.rs`'s
//! `remote_revocationpubkey` test vectors, generalized from the old
//! secp256k1 0.20-era `mul_assign`/`add_exp_assign` API to the current
//! `mul_tweak`/`add_tweak` API pinned in this crate's `Cargo.toml`.

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::util::bip32::{
    ChildNumber, DerivationPath, ExtendedPrivKey, Fingerprint, KeySource,
};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey, Signing};
use wallet::hd::HardenedIndex;

/// Number of bits in a commitment number (BOLT-3: 48-bit counter).
pub const COMMITMENT_NUMBER_BITS: u32 = 48;

/// The first (highest) commitment number; commitment numbers count down
/// from here towards zero.
pub const FIRST_COMMITMENT_NUMBER: u64 = (1u64 << COMMITMENT_NUMBER_BITS) - 1;

/// Per-channel public basepoints, as advertised to / received from the
/// remote peer in `open_channel`/`accept_channel`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct PublicBasepoints {
    pub funding: PublicKey,
    pub revocation: PublicKey,
    pub payment: PublicKey,
    pub delayed_payment: PublicKey,
    pub htlc: PublicKey,
}

/// Per-channel basepoint key pairs derived locally. The private halves
/// never leave the key holder in a real deployment; this crate's
/// [`KeyDeriver`] is itself meant to live behind the
/// [`crate::interfaces::KeyHolder`] boundary.
#[derive(Clone, Debug)]
pub struct LocalBasepoints {
    pub public: PublicBasepoints,
    pub funding_secret: SecretKey,
    pub revocation_secret: SecretKey,
    pub payment_secret: SecretKey,
    pub delayed_payment_secret: SecretKey,
    pub htlc_secret: SecretKey,
    /// 32-byte seed feeding [`per_commitment_secret`]; never leaves the
    /// node, chosen once per channel at creation time.
    pub per_commitment_seed: [u8; 32],
}

/// Errors arising from key derivation and revocation-store maintenance.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// incoming per-commitment secret for index {0} cannot regenerate a
    /// secret already stored at a higher commitment number; rejecting as a
    /// protocol error
    InvalidSecret(u64),

    /// commitment number {0} exceeds the 48-bit range BOLT-3 mandates
    CommitmentNumberOutOfRange(u64),

    /// revealed per-commitment secret for index {0} does not reproduce the
    /// per-commitment point previously advertised for that commitment;
    /// fatal per BOLT-2's `revoke_and_ack` handling
    PerCommitmentPointMismatch(u64),
}

/// Deterministically derives all per-channel Lightning keys from a wallet
/// master key, and generates per-commitment secrets along the BOLT-3 hash
/// tree.
#[derive(Debug)]
pub struct KeyDeriver<C: Signing> {
    secp: Secp256k1<C>,
}

impl<C: Signing> KeyDeriver<C> {
    pub fn new(secp: Secp256k1<C>) -> Self {
        KeyDeriver { secp }
    }

    /// Derives channel basepoints along `m / 9735' / coin' / account' /
    /// change / channel_index`, then seven single-level hardened children
    /// of the resulting channel extended key: indices `0..=6` map to
    /// `funding, payment, delayed_payment, revocation,
    /// first_per_commitment, htlc, _reserved`, matching the grounding
    /// library's concrete assignment (documented as an Open Question
    /// resolution in DESIGN.md).
    pub fn derive_channel_basepoints(
        &self,
        wallet_master: &ExtendedPrivKey,
        coin_type: HardenedIndex,
        account: HardenedIndex,
        change: ChildNumber,
        channel_index: HardenedIndex,
    ) -> LocalBasepoints {
        let lnpbp46_path = DerivationPath::from(vec![
            ChildNumber::from(HardenedIndex::from(9735u16)),
            ChildNumber::from(coin_type),
            ChildNumber::from(account),
            change,
            ChildNumber::from(channel_index),
        ]);
        let channel_xpriv = wallet_master
            .derive_priv(&self.secp, &lnpbp46_path)
            .expect("negligible probability of derivation failure");

        let child = |index: u16| -> SecretKey {
            let path = [ChildNumber::from(HardenedIndex::from(index))];
            channel_xpriv
                .derive_priv(&self.secp, &path)
                .expect("negligible probability of derivation failure")
                .private_key
        };

        let funding_secret = child(0);
        let payment_secret = child(1);
        let delayed_payment_secret = child(2);
        let revocation_secret = child(3);
        let first_per_commitment_secret = child(4);
        let htlc_secret = child(5);

        let pk = |sk: &SecretKey| PublicKey::from_secret_key(&self.secp, sk);

        LocalBasepoints {
            public: PublicBasepoints {
                funding: pk(&funding_secret),
                revocation: pk(&revocation_secret),
                payment: pk(&payment_secret),
                delayed_payment: pk(&delayed_payment_secret),
                htlc: pk(&htlc_secret),
            },
            funding_secret,
            revocation_secret,
            payment_secret,
            delayed_payment_secret,
            htlc_secret,
            per_commitment_seed: first_per_commitment_secret.secret_bytes(),
        }
    }

    /// `BIP32` [`KeySource`] helper for PSBT `bip32_derivation` maps.
    pub fn key_source(
        fingerprint: Fingerprint,
        coin_type: HardenedIndex,
        account: HardenedIndex,
        change: ChildNumber,
        channel_index: HardenedIndex,
        basepoint_index: u16,
    ) -> KeySource {
        let path = DerivationPath::from(vec![
            ChildNumber::from(HardenedIndex::from(9735u16)),
            ChildNumber::from(coin_type),
            ChildNumber::from(account),
            change,
            ChildNumber::from(channel_index),
            ChildNumber::from(HardenedIndex::from(basepoint_index)),
        ]);
        (fingerprint, path)
    }
}

/// Generates the per-commitment secret for commitment number `index` from
/// `seed`, per BOLT-3's hash tree: flip bit `b` of a 32-byte big-endian
/// buffer and hash, once per set bit of `index`, processing bits from 47
/// down to 0.
pub fn per_commitment_secret(seed: &[u8; 32], index: u64) -> [u8; 32] {
    generate_from_seed(seed, index)
}

fn generate_from_seed(seed: &[u8; 32], index: u64) -> [u8; 32] {
    let mut secret = *seed;
    for bitpos in (0..COMMITMENT_NUMBER_BITS).rev() {
        if (index >> bitpos) & 1 == 1 {
            let byte = (bitpos / 8) as usize;
            let shift = bitpos % 8;
            secret[byte] ^= 1 << shift;
            secret = sha256::Hash::hash(&secret).into_inner();
        }
    }
    secret
}

/// `regenerate(from_index, from_secret, to_index)`: regenerates the secret
/// for `to_index` from an earlier-stored `from_secret` at `from_index`,
/// valid only when `from_index` and `to_index` agree on every bit at or
/// above `from_index`'s lowest set bit `b` (the bits below `b` are exactly
/// the ones `from_index` never fixed, and `to_index` is free to set any of
/// them).
fn can_derive(from_index: u64, to_index: u64) -> bool {
    let lowest_set_bit = if from_index == 0 {
        COMMITMENT_NUMBER_BITS
    } else {
        from_index.trailing_zeros()
    };
    (from_index >> lowest_set_bit) == (to_index >> lowest_set_bit)
}

/// Continues the hash tree from `from_secret` (already folded in every bit
/// of `from_index` at or above its lowest set bit) down through the
/// remaining bits `to_index` sets below that point.
fn regenerate(from_index: u64, from_secret: &[u8; 32], to_index: u64) -> [u8; 32] {
    let lowest_set_bit = if from_index == 0 {
        COMMITMENT_NUMBER_BITS
    } else {
        from_index.trailing_zeros()
    };
    let mut secret = *from_secret;
    for bitpos in (0..lowest_set_bit).rev() {
        if (to_index >> bitpos) & 1 == 1 {
            let byte = (bitpos / 8) as usize;
            let shift = bitpos % 8;
            secret[byte] ^= 1 << shift;
            secret = sha256::Hash::hash(&secret).into_inner();
        }
    }
    secret
}

/// Compact per-peer store of per-commitment secrets released by the remote
/// side, indexed by commitment number counting down from
/// [`FIRST_COMMITMENT_NUMBER`]. At most 49 buckets: any earlier secret can
/// be regenerated from a later one via the hash-tree construction, so the
/// store keeps at most one bucket per distinct count of trailing zero
/// bits.
#[derive(Clone, Debug, Default, StrictEncode, StrictDecode)]
pub struct RevocationStore {
    /// Buckets keyed by the number of trailing zero bits in the stored
    /// index (0..=48), holding `(index, secret)`.
    buckets: std::collections::BTreeMap<u8, (u64, [u8; 32])>,
}

impl RevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_of(index: u64) -> u8 {
        if index == 0 {
            COMMITMENT_NUMBER_BITS as u8
        } else {
            index.trailing_zeros() as u8
        }
    }

    /// Inserts the per-commitment secret released for `index`. Fails with
    /// [`Error::InvalidSecret`] if it cannot regenerate every secret already
    /// stored in a bucket with fewer trailing-zero bits than `index`'s own
    /// (those buckets hold less derivability power than the incoming secret
    /// and must be its descendants in the hash tree). Idempotent:
    /// re-inserting an unchanged secret at the same index succeeds and
    /// mutates nothing.
    pub fn insert(&mut self, index: u64, secret: [u8; 32]) -> Result<(), Error> {
        if index > FIRST_COMMITMENT_NUMBER {
            return Err(Error::CommitmentNumberOutOfRange(index));
        }

        let bucket = Self::bucket_of(index);

        if let Some(&(existing_index, existing_secret)) = self.buckets.get(&bucket) {
            if existing_index == index {
                return if existing_secret == secret {
                    Ok(())
                } else {
                    Err(Error::InvalidSecret(index))
                };
            }
        }

        for (_, &(stored_index, stored_secret)) in self.buckets.range(..bucket) {
            if regenerate(index, &secret, stored_index) != stored_secret {
                // Incompatible: our candidate secret does not regenerate a
                // secret that was stored with less derivability power.
                return Err(Error::InvalidSecret(index));
            }
        }

        self.buckets.insert(bucket, (index, secret));
        Ok(())
    }

    /// Regenerates the secret for `index` from whichever stored bucket is
    /// an ancestor of it, or returns `None` if no stored secret can reach
    /// it (it was never revealed, or is in our own future).
    pub fn get(&self, index: u64) -> Option<[u8; 32]> {
        self.buckets
            .values()
            .find(|&&(stored_index, _)| {
                stored_index == index || can_derive(stored_index, index)
            })
            .map(|&(stored_index, stored_secret)| {
                if stored_index == index {
                    stored_secret
                } else {
                    regenerate(stored_index, &stored_secret, index)
                }
            })
    }

    /// Highest (oldest) commitment number whose secret is stored.
    pub fn min_index(&self) -> Option<u64> {
        self.buckets.values().map(|&(index, _)| index).min()
    }

    /// Number of occupied buckets (at most 49).
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

fn sha256_two(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(a);
    engine.input(b);
    sha256::Hash::from_engine(engine).into_inner()
}

/// `revocation_pubkey = base_point * H(base_point || per_commitment_point)
/// + per_commitment_point * H(per_commitment_point || base_point)`.
pub fn revocation_pubkey<C: secp256k1::Verification>(
    secp: &Secp256k1<C>,
    base_point: PublicKey,
    per_commitment_point: PublicKey,
) -> PublicKey {
    let h1 = sha256_two(
        &base_point.serialize(),
        &per_commitment_point.serialize(),
    );
    let h2 = sha256_two(
        &per_commitment_point.serialize(),
        &base_point.serialize(),
    );

    let term1 = base_point
        .mul_tweak(secp, &Scalar::from_be_bytes(h1).expect("sha256 output fits the field"))
        .expect("negligible probability");
    let term2 = per_commitment_point
        .mul_tweak(secp, &Scalar::from_be_bytes(h2).expect("sha256 output fits the field"))
        .expect("negligible probability");
    term1.combine(&term2).expect("negligible probability")
}

/// `revocation_privkey = base_secret * H(base_point || per_commitment_point)
/// + per_commitment_secret * H(per_commitment_point || base_point) mod n`.
pub fn revocation_privkey<C: Signing>(
    secp: &Secp256k1<C>,
    base_secret: SecretKey,
    base_point: PublicKey,
    per_commitment_secret: SecretKey,
    per_commitment_point: PublicKey,
) -> SecretKey {
    let h1 = sha256_two(
        &base_point.serialize(),
        &per_commitment_point.serialize(),
    );
    let h2 = sha256_two(
        &per_commitment_point.serialize(),
        &base_point.serialize(),
    );

    let term1 = base_secret
        .mul_tweak(&Scalar::from_be_bytes(h1).expect("sha256 output fits the field"))
        .expect("negligible probability");
    let term2 = per_commitment_secret
        .mul_tweak(&Scalar::from_be_bytes(h2).expect("sha256 output fits the field"))
        .expect("negligible probability");
    let _ = secp;
    term1
        .add_tweak(&Scalar::from(term2))
        .expect("negligible probability")
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use secp256k1::Secp256k1;

    use super::*;

    macro_rules! pk {
        ($hex:expr) => {
            PublicKey::from_str($hex).unwrap()
        };
    }

    #[test]
    fn bolt3_revocationkey_derivation() {
        let secp = Secp256k1::new();
        let base_point = pk!("036d6caac248af96f6afa7f904f550253a0f3ef3f5aa2fe6838a95b216691468e2");
        let per_commitment_point = pk!("025f7117a78150fe2ef97db7cfc83bd57b2e2c0d0dd25eaf467a4a1c2a45ce1486");
        assert_eq!(
            revocation_pubkey(&secp, base_point, per_commitment_point),
            pk!("02916e326636d19c33f13e8c0c3a03dd157f332f3e99c317c141dd865eb01f8ff0")
        );
    }

    #[test]
    fn key_derivation_round_trip() {
        let secp = Secp256k1::new();
        let base_secret = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let per_commit_secret = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let base_point = PublicKey::from_secret_key(&secp, &base_secret);
        let per_commit_point = PublicKey::from_secret_key(&secp, &per_commit_secret);

        let privkey = revocation_privkey(
            &secp,
            base_secret,
            base_point,
            per_commit_secret,
            per_commit_point,
        );
        let pubkey_from_priv = PublicKey::from_secret_key(&secp, &privkey);
        let pubkey_direct = revocation_pubkey(&secp, base_point, per_commit_point);
        assert_eq!(pubkey_from_priv, pubkey_direct);
    }

    #[test]
    fn revocation_soundness_sequence() {
        let seed = [0x42u8; 32];
        let mut store = RevocationStore::new();
        let indices: Vec<u64> = vec![
            FIRST_COMMITMENT_NUMBER,
            FIRST_COMMITMENT_NUMBER - 1,
            FIRST_COMMITMENT_NUMBER - 2,
            FIRST_COMMITMENT_NUMBER - 3,
        ];
        for &i in &indices {
            let secret = per_commitment_secret(&seed, i);
            store.insert(i, secret).unwrap();
        }
        for &i in &indices {
            let expected = per_commitment_secret(&seed, i);
            assert_eq!(store.get(i), Some(expected));
        }
        assert!(store.len() <= 49);
    }

    #[test]
    fn revocation_rejects_inconsistent_secret() {
        // 10 (0b1010) has 1 trailing zero bit; 8 (0b1000) has 3, so 8's
        // bucket sits strictly above 10's and must regenerate it on insert.
        let seed_a = [0xAAu8; 32];
        let seed_b = [0xBBu8; 32];
        let mut store = RevocationStore::new();
        store
            .insert(10, per_commitment_secret(&seed_a, 10))
            .unwrap();
        let before = store.clone();
        let bogus = per_commitment_secret(&seed_b, 8);
        let result = store.insert(8, bogus);
        assert!(matches!(result, Err(Error::InvalidSecret(8))));
        assert_eq!(store.len(), before.len());
        assert_eq!(store.get(10), before.get(10));
    }

    #[test]
    fn revocation_insert_idempotent() {
        let seed = [0x7u8; 32];
        let mut store = RevocationStore::new();
        let secret = per_commitment_secret(&seed, 100);
        store.insert(100, secret).unwrap();
        store.insert(100, secret).unwrap();
        assert_eq!(store.len(), 1);
    }
}
