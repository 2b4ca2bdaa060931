//! Cryptographic primitives used by the Message Stream Encryption handshake:
//! chained SHA-1, RC4 keystreams and DH-768 key agreement.
//!
//! Nothing in this module is fallible on well-formed input; a malformed peer
//! public key simply produces a shared secret that fails verification
//! further up the handshake, rather than an error here.

mod dh;
mod rc4_stream;

pub use dh::DhKeyPair;
pub use rc4_stream::Rc4Stream;

use sha1::{Digest, Sha1};

/// Computes `SHA1(parts[0] || parts[1] || ... )`, i.e. chained/concatenative
/// SHA-1 over an arbitrary number of byte fragments.
///
/// This is used pervasively by the handshake for salted hashes such as
/// `SHA1("req1", S)` and `SHA1("keyA", S, info_hash)`.
pub fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// XORs two 20-byte hashes together, as used to derive/verify the
/// obfuscated info hash `SHA1("req2", info_hash) ^ SHA1("req3", S)`.
pub fn xor20(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_variadic_equals_concatenated() {
        let a = b"req1";
        let b = b"some-shared-secret-bytes";
        let got = sha1(&[a, b]);

        let mut concatenated = Vec::new();
        concatenated.extend_from_slice(a);
        concatenated.extend_from_slice(b);
        let want = sha1(&[&concatenated]);

        assert_eq!(got, want);
    }

    #[test]
    fn xor20_is_involution() {
        let a = sha1(&[b"a"]);
        let b = sha1(&[b"b"]);
        let x = xor20(&a, &b);
        assert_eq!(xor20(&x, &b), a);
    }
}
