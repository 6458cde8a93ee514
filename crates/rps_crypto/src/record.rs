//! Record protection for the duplex channel.
//!
//! Uses ChaCha20-Poly1305 (96-bit nonce). Each direction has its own key and
//! a strictly monotonic 64-bit counter; the counter doubles as the nonce
//! (4 zero bytes || u64 BE) and travels in clear at the head of every record
//! so the receiver can detect regression before decrypting.
//!
//! Record wire format:
//!   [ counter (8 bytes BE) | ciphertext + tag ]

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

const COUNTER_LEN: usize = 8;
const TAG_LEN: usize = 16;

/// 32-byte direction key. Drop clears memory.
#[derive(ZeroizeOnDrop)]
pub struct RecordKey([u8; 32]);

impl RecordKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

fn nonce_for(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(bytes)
}

// ── Sending side ──────────────────────────────────────────────────────────────

/// Seals outbound records under one direction key. Counter starts at 0 and
/// never repeats; an exhausted counter closes the channel.
pub struct SealingKey {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl SealingKey {
    pub fn new(key: &RecordKey) -> Self {
        let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
            .expect("32-byte key is always a valid ChaCha20-Poly1305 key");
        Self { cipher, counter: 0 }
    }

    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.counter;
        if counter == u64::MAX {
            return Err(CryptoError::CounterExhausted);
        }
        let nonce = nonce_for(counter);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::RecordSeal)?;
        self.counter += 1;

        let mut out = Vec::with_capacity(COUNTER_LEN + ciphertext.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

// ── Receiving side ────────────────────────────────────────────────────────────

/// Opens inbound records. Rejects any counter at or below the last one seen.
pub struct OpeningKey {
    cipher: ChaCha20Poly1305,
    last: Option<u64>,
}

impl OpeningKey {
    pub fn new(key: &RecordKey) -> Self {
        let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
            .expect("32-byte key is always a valid ChaCha20-Poly1305 key");
        Self { cipher, last: None }
    }

    pub fn open(&mut self, record: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if record.len() < COUNTER_LEN + TAG_LEN {
            return Err(CryptoError::RecordTruncated(record.len()));
        }
        let (counter_bytes, ct) = record.split_at(COUNTER_LEN);
        let counter = u64::from_be_bytes(counter_bytes.try_into().expect("split is 8 bytes"));

        if let Some(last) = self.last {
            if counter <= last {
                return Err(CryptoError::CounterRegression { last, got: counter });
            }
        }

        let nonce = nonce_for(counter);
        let plaintext = self
            .cipher
            .decrypt(&nonce, Payload { msg: ct, aad })
            .map_err(|_| CryptoError::RecordOpen)?;

        // Only advance after authentication: a forged counter must not
        // poison the replay window.
        self.last = Some(counter);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> (SealingKey, OpeningKey) {
        let key = RecordKey::new([9u8; 32]);
        (SealingKey::new(&key), OpeningKey::new(&key))
    }

    #[test]
    fn seal_open_roundtrip() {
        let (mut seal, mut open) = keys();
        let record = seal.seal(b"hello", b"aad").unwrap();
        assert_eq!(open.open(&record, b"aad").unwrap(), b"hello");
    }

    #[test]
    fn replayed_record_is_rejected() {
        let (mut seal, mut open) = keys();
        let record = seal.seal(b"once", b"").unwrap();
        open.open(&record, b"").unwrap();
        let err = open.open(&record, b"").unwrap_err();
        assert!(matches!(err, CryptoError::CounterRegression { last: 0, got: 0 }));
    }

    #[test]
    fn counters_advance_per_record() {
        let (mut seal, mut open) = keys();
        for i in 0..5u8 {
            let record = seal.seal(&[i], b"").unwrap();
            assert_eq!(open.open(&record, b"").unwrap(), &[i]);
        }
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (mut seal, mut open) = keys();
        let mut record = seal.seal(b"payload", b"").unwrap();
        let end = record.len() - 1;
        record[end] ^= 0x01;
        assert!(matches!(open.open(&record, b"").unwrap_err(), CryptoError::RecordOpen));
    }

    #[test]
    fn tampered_counter_does_not_poison_window() {
        let (mut seal, mut open) = keys();
        let r0 = seal.seal(b"a", b"").unwrap();
        let r1 = seal.seal(b"b", b"").unwrap();

        // Forge a record claiming a huge counter: must fail auth and leave
        // the window untouched so the genuine records still open.
        let mut forged = r1.clone();
        forged[..8].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(open.open(&forged, b"").is_err());

        open.open(&r0, b"").unwrap();
        open.open(&r1, b"").unwrap();
    }

    #[test]
    fn wrong_aad_fails() {
        let (mut seal, mut open) = keys();
        let record = seal.seal(b"x", b"dir-a").unwrap();
        assert!(open.open(&record, b"dir-b").is_err());
    }
}
