use num_bigint::BigUint;
use num_traits::Num;
use rand::RngCore;

/// Length, in bytes, of a DH-768 public key or shared secret once padded.
pub const DH_LEN: usize = 96;

/// The 768-bit MSE prime, as specified by BEP 8 / the Azureus MSE wiki page.
const PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD",
    "129024E088A67CC74020BBEA63B139B22514A08798E3404",
    "DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C",
    "245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406",
    "B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE",
    "65381FFFFFFFFFFFFFFFFF",
);

/// The generator used with [`PRIME_HEX`]. Fixed at 2 by the MSE spec.
const GENERATOR: u64 = 2;

/// A Diffie-Hellman keypair used for a single handshake attempt.
///
/// The private exponent is generated fresh for every handshake and is
/// never reused; `DhKeyPair` has no `Clone` impl for this reason.
pub struct DhKeyPair {
    private: BigUint,
    prime: BigUint,
}

impl DhKeyPair {
    /// Generates a new private exponent and returns the keypair.
    pub fn generate() -> Self {
        let prime = BigUint::from_str_radix(PRIME_HEX, 16)
            .expect("MSE prime constant is valid hex");
        // A private exponent at least as wide as the prime avoids
        // small-subgroup style weaknesses; 160 bits of entropy is the
        // value historically used by MSE implementations, but using the
        // full width costs nothing and is simpler to reason about.
        let mut bytes = [0u8; 96];
        rand::thread_rng().fill_bytes(&mut bytes);
        let private = BigUint::from_bytes_be(&bytes) % &prime;
        Self { private, prime }
    }

    /// Returns our public key `g^x mod p`, left-padded with zero bytes to
    /// exactly [`DH_LEN`] (96) bytes.
    pub fn public_key(&self) -> [u8; DH_LEN] {
        let generator = BigUint::from(GENERATOR);
        let public = generator.modpow(&self.private, &self.prime);
        pad_96(&public.to_bytes_be())
    }

    /// Derives the shared secret `peer_public^x mod p` given the peer's
    /// 96-byte public key, left-padded with zero bytes to exactly
    /// [`DH_LEN`] (96) bytes.
    pub fn shared_secret(&self, peer_public: &[u8; DH_LEN]) -> [u8; DH_LEN] {
        let peer_public = BigUint::from_bytes_be(peer_public);
        let secret = peer_public.modpow(&self.private, &self.prime);
        pad_96(&secret.to_bytes_be())
    }
}

/// Left-pads `bytes` with zeros to exactly [`DH_LEN`] bytes. `bytes` must
/// not be longer than that, which holds for any value reduced modulo the
/// 768-bit (96-byte) MSE prime.
fn pad_96(bytes: &[u8]) -> [u8; DH_LEN] {
    debug_assert!(bytes.len() <= DH_LEN);
    let mut out = [0u8; DH_LEN];
    let start = DH_LEN - bytes.len();
    out[start..].copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_is_always_96_bytes() {
        for _ in 0..8 {
            let kp = DhKeyPair::generate();
            assert_eq!(kp.public_key().len(), DH_LEN);
        }
    }

    #[test]
    fn two_parties_agree_on_the_same_secret() {
        let alice = DhKeyPair::generate();
        let bob = DhKeyPair::generate();

        let alice_pub = alice.public_key();
        let bob_pub = bob.public_key();

        let alice_secret = alice.shared_secret(&bob_pub);
        let bob_secret = bob.shared_secret(&alice_pub);

        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn padding_is_high_order_zero_bytes() {
        // A shared secret that happens to be small still comes back as
        // exactly 96 bytes, left-padded with zeros.
        let short = pad_96(&[1, 2, 3]);
        assert_eq!(short.len(), DH_LEN);
        assert!(short[..DH_LEN - 3].iter().all(|&b| b == 0));
        assert_eq!(&short[DH_LEN - 3..], &[1, 2, 3]);
    }
}
