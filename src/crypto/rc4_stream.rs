use rc4::{KeyInit, Rc4, StreamCipher};

/// An RC4 keystream, already advanced past the first 1024 bytes as required
/// by the MSE specification.
///
/// Each direction of an encrypted connection gets its own `Rc4Stream`: the
/// initiator's `enc_key` stream for its writes and `dec_key` stream for its
/// reads, and vice versa for the responder.
pub struct Rc4Stream {
    cipher: Rc4<rc4::consts::U20>,
}

impl Rc4Stream {
    /// Keys a new RC4 stream from an arbitrary-length key (in practice
    /// always a 20-byte SHA-1 digest) and discards the first 1024 output
    /// bytes, per the MSE spec.
    pub fn new(key: &[u8; 20]) -> Self {
        let mut cipher = Rc4::new(key.into());
        let mut discard = [0u8; 1024];
        cipher.apply_keystream(&mut discard);
        Self { cipher }
    }

    /// XORs `buf` in place with the next bytes of the keystream. Used both
    /// to encrypt (on write) and decrypt (on read), since RC4 is symmetric.
    pub fn apply_keystream(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_plaintext() {
        let key = [7u8; 20];
        let mut tx = Rc4Stream::new(&key);
        let mut rx = Rc4Stream::new(&key);

        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut buf = plaintext.clone();
        tx.apply_keystream(&mut buf);
        assert_ne!(buf, plaintext);
        rx.apply_keystream(&mut buf);
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn two_independent_streams_differ() {
        let mut a = Rc4Stream::new(&[1u8; 20]);
        let mut b = Rc4Stream::new(&[2u8; 20]);
        let mut buf_a = [0u8; 16];
        let mut buf_b = [0u8; 16];
        a.apply_keystream(&mut buf_a);
        b.apply_keystream(&mut buf_b);
        assert_ne!(buf_a, buf_b);
    }
}
