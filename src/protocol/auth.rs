//! Keyed message digests.
//!
//! The shared secret is stretched into a 32-byte key with blake3's key
//! derivation, and frames are authenticated with blake3 in keyed mode. Only
//! the first [`DIGEST_LEN`] bytes of the output travel on the wire.

use std::fmt;

/// Digest bytes appended to a signed frame.
pub const DIGEST_LEN: usize = 8;

const KEY_CONTEXT: &str = "peer-cache v1 message signing key";

/// Key derived from the peers' shared secret.
#[derive(Clone)]
pub struct SigningKey([u8; 32]);

impl SigningKey {
    pub fn derive(secret: &[u8]) -> Self {
        Self(blake3::derive_key(KEY_CONTEXT, secret))
    }

    /// Start a new running digest.
    pub fn digest(&self) -> MessageDigest {
        MessageDigest {
            hasher: blake3::Hasher::new_keyed(&self.0),
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

/// Running keyed hash over the signed region of one frame.
///
/// Reading the current digest does not reset the state, so per-chunk digests
/// each commit everything written since the command header.
#[derive(Clone)]
pub struct MessageDigest {
    hasher: blake3::Hasher,
}

impl MessageDigest {
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn current(&self) -> [u8; DIGEST_LEN] {
        let hash = self.hasher.finalize();
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&hash.as_bytes()[..DIGEST_LEN]);
        out
    }

    /// Compare `received` against the current digest without early exit.
    pub fn verify(&self, received: &[u8]) -> bool {
        if received.len() != DIGEST_LEN {
            return false;
        }
        self.current()
            .iter()
            .zip(received)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_secret_same_digest() {
        let mut a = SigningKey::derive(b"secret").digest();
        let mut b = SigningKey::derive(b"secret").digest();
        a.update(b"hello");
        b.update(b"hello");
        assert_eq!(a.current(), b.current());
        assert!(b.verify(&a.current()));
    }

    #[test]
    fn test_different_secret_differs() {
        let mut a = SigningKey::derive(b"one").digest();
        let mut b = SigningKey::derive(b"two").digest();
        a.update(b"payload");
        b.update(b"payload");
        assert!(!a.verify(&b.current()));
    }

    #[test]
    fn test_current_is_cumulative() {
        let key = SigningKey::derive(b"k");
        let mut running = key.digest();
        running.update(b"ab");
        let first = running.current();
        assert_eq!(first, running.current());
        running.update(b"cd");

        let mut whole = key.digest();
        whole.update(b"abcd");
        assert_eq!(running.current(), whole.current());
        assert_ne!(first, whole.current());
    }

    #[test]
    fn test_verify_rejects_wrong_length() {
        let digest = SigningKey::derive(b"k").digest();
        assert!(!digest.verify(&[0u8; 4]));
    }
}
