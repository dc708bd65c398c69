//! WinZip-AES (AE-2) encryption for archive entries.
//!
//! Implemented against the [WinZip specification](https://www.winzip.com/win/en/aes_info.html),
//! strength 3 (AES-256) only. An encrypted entry's data stream is
//!
//! ```txt
//! 16-byte salt | 2-byte password verifier | ciphertext | 10-byte auth code
//! ```
//!
//! Keys come from PBKDF2-HMAC-SHA1 with 1000 iterations; 66 bytes of
//! derived material split into the AES-256 key, the HMAC-SHA1 key and the
//! verifier. The cipher is AES in CTR mode with a little-endian 128-bit
//! block counter starting at 1. AE-2 drops the CRC-32 field entirely; the
//! truncated HMAC over the ciphertext is the only integrity check.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::error::{ZipError, ZipResult};

/// Length of the salt for strength 3.
pub const SALT_LENGTH: usize = 16;
/// Length of the password verification value.
pub const VERIFIER_LENGTH: usize = 2;
/// Length of the truncated HMAC-SHA1 authentication code.
pub const AUTH_CODE_LENGTH: usize = 10;
/// Salt + verifier prefix preceding the ciphertext.
pub const PREAMBLE_LENGTH: usize = SALT_LENGTH + VERIFIER_LENGTH;
/// Bytes an encrypted stream adds around the ciphertext.
pub const OVERHEAD: u64 = (PREAMBLE_LENGTH + AUTH_CODE_LENGTH) as u64;
/// The only supported AES strength (AES-256).
pub const STRENGTH_AES_256: u8 = 3;

const ITERATION_COUNT: u32 = 1000;
const KEY_LENGTH: usize = 32;
const DERIVED_LENGTH: usize = 2 * KEY_LENGTH + VERIFIER_LENGTH;
const BLOCK_LENGTH: usize = 16;

type HmacSha1 = Hmac<Sha1>;

/// Derive the AES key, HMAC key and verifier from a password and salt.
fn derive(password: &[u8], salt: &[u8]) -> Zeroizing<[u8; DERIVED_LENGTH]> {
    let mut material = Zeroizing::new([0u8; DERIVED_LENGTH]);
    pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, ITERATION_COUNT, &mut *material);
    material
}

/// AES-256 CTR keystream with the WinZip counter layout.
///
/// The counter is 16 bytes little-endian, starts at 1, and increments with
/// a carry that stops at the first byte that does not overflow. Byte 15
/// wraps to zero without further effect; entries are bounded to 2^64
/// blocks so the wrap is unreachable in practice. Kept byte-exact with the
/// reference behavior rather than delegating to a CTR implementation.
struct Keystream {
    cipher: Aes256,
    counter: [u8; BLOCK_LENGTH],
    buffer: [u8; BLOCK_LENGTH],
    pos: usize,
}

impl Keystream {
    fn new(key: &[u8]) -> Self {
        let mut counter = [0u8; BLOCK_LENGTH];
        counter[0] = 1;
        Self {
            cipher: Aes256::new_from_slice(key).expect("AES-256 key is 32 bytes"),
            counter,
            buffer: [0u8; BLOCK_LENGTH],
            pos: BLOCK_LENGTH,
        }
    }

    /// XOR the keystream into `data`, encrypting or decrypting in place.
    fn crypt_in_place(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            if self.pos == BLOCK_LENGTH {
                let mut block = Block::clone_from_slice(&self.counter);
                self.cipher.encrypt_block(&mut block);
                self.buffer.copy_from_slice(&block);
                increment_counter(&mut self.counter);
                self.pos = 0;
            }
            *byte ^= self.buffer[self.pos];
            self.pos += 1;
        }
    }
}

fn increment_counter(counter: &mut [u8; BLOCK_LENGTH]) {
    for byte in counter.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// Streaming encryptor: plaintext in, `preamble | ciphertext | tag` out.
pub struct AesEncryptor {
    keystream: Keystream,
    hmac: HmacSha1,
    preamble: Option<Vec<u8>>,
    pending: Zeroizing<Vec<u8>>,
}

impl AesEncryptor {
    /// Create an encryptor with a fresh random salt.
    pub fn new(password: &str) -> ZipResult<Self> {
        let mut salt = [0u8; SALT_LENGTH];
        getrandom::getrandom(&mut salt).map_err(std::io::Error::from)?;
        Ok(Self::with_salt(password, salt))
    }

    fn with_salt(password: &str, salt: [u8; SALT_LENGTH]) -> Self {
        let material = derive(password.as_bytes(), &salt);

        let mut preamble = Vec::with_capacity(PREAMBLE_LENGTH);
        preamble.extend_from_slice(&salt);
        preamble.extend_from_slice(&material[2 * KEY_LENGTH..]);

        Self {
            keystream: Keystream::new(&material[..KEY_LENGTH]),
            hmac: <HmacSha1 as Mac>::new_from_slice(&material[KEY_LENGTH..2 * KEY_LENGTH])
                .expect("hmac accepts any key length"),
            preamble: Some(preamble),
            pending: Zeroizing::new(Vec::new()),
        }
    }

    /// Encrypt a chunk. Whole 16-byte blocks are emitted; a trailing
    /// remainder is held until the next call or [`flush`](Self::flush).
    pub fn append(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = self.preamble.take().unwrap_or_default();

        self.pending.extend_from_slice(input);
        let whole = self.pending.len() / BLOCK_LENGTH * BLOCK_LENGTH;
        if whole > 0 {
            let mut blocks: Vec<u8> = self.pending.drain(..whole).collect();
            self.keystream.crypt_in_place(&mut blocks);
            self.hmac.update(&blocks);
            out.extend_from_slice(&blocks);
        }
        out
    }

    /// Encrypt the final partial block and append the truncated HMAC tag.
    pub fn flush(&mut self) -> Vec<u8> {
        let mut out = self.preamble.take().unwrap_or_default();

        let mut tail: Vec<u8> = self.pending.drain(..).collect();
        self.keystream.crypt_in_place(&mut tail);
        self.hmac.update(&tail);
        out.extend_from_slice(&tail);

        let tag = self.hmac.clone().finalize().into_bytes();
        out.extend_from_slice(&tag[..AUTH_CODE_LENGTH]);
        out
    }
}

enum DecryptState {
    /// Collecting the 18-byte preamble; keys are not derived yet.
    AwaitingPreamble,
    Streaming { keystream: Keystream, hmac: HmacSha1 },
}

/// Streaming decryptor: `preamble | ciphertext | tag` in, plaintext out.
///
/// The trailing [`AUTH_CODE_LENGTH`] bytes of whatever has been received
/// are always held back, since until the stream ends they may be the
/// authentication tag.
pub struct AesDecryptor {
    password: Zeroizing<Vec<u8>>,
    state: DecryptState,
    pending: Vec<u8>,
}

impl AesDecryptor {
    pub fn new(password: &str) -> Self {
        Self {
            password: Zeroizing::new(password.as_bytes().to_vec()),
            state: DecryptState::AwaitingPreamble,
            pending: Vec::new(),
        }
    }

    /// Decrypt a chunk of the encrypted stream.
    ///
    /// Fails with [`ZipError::InvalidPassword`] as soon as the parsed
    /// verifier disagrees with the derived one.
    pub fn append(&mut self, input: &[u8]) -> ZipResult<Vec<u8>> {
        self.pending.extend_from_slice(input);

        if matches!(self.state, DecryptState::AwaitingPreamble) {
            if self.pending.len() < PREAMBLE_LENGTH {
                return Ok(Vec::new());
            }
            let preamble: Vec<u8> = self.pending.drain(..PREAMBLE_LENGTH).collect();
            let (salt, verifier) = preamble.split_at(SALT_LENGTH);

            let material = derive(&self.password, salt);
            if !constant_time_eq(verifier, &material[2 * KEY_LENGTH..]) {
                return Err(ZipError::InvalidPassword);
            }
            self.state = DecryptState::Streaming {
                keystream: Keystream::new(&material[..KEY_LENGTH]),
                hmac: <HmacSha1 as Mac>::new_from_slice(&material[KEY_LENGTH..2 * KEY_LENGTH])
                    .expect("hmac accepts any key length"),
            };
        }

        let DecryptState::Streaming { keystream, hmac } = &mut self.state else {
            unreachable!("preamble handled above");
        };

        // Process whole blocks ahead of the candidate tag.
        let available = self.pending.len().saturating_sub(AUTH_CODE_LENGTH);
        let whole = available / BLOCK_LENGTH * BLOCK_LENGTH;
        if whole == 0 {
            return Ok(Vec::new());
        }
        let mut blocks: Vec<u8> = self.pending.drain(..whole).collect();
        hmac.update(&blocks);
        keystream.crypt_in_place(&mut blocks);
        Ok(blocks)
    }

    /// Decrypt the final partial block and verify the authentication tag.
    pub fn flush(&mut self) -> ZipResult<Vec<u8>> {
        let DecryptState::Streaming { keystream, hmac } = &mut self.state else {
            return Err(ZipError::BadFormat("encrypted stream shorter than preamble"));
        };
        if self.pending.len() < AUTH_CODE_LENGTH {
            return Err(ZipError::BadFormat("encrypted stream missing auth code"));
        }

        let tag_start = self.pending.len() - AUTH_CODE_LENGTH;
        let mut tail: Vec<u8> = self.pending.drain(..tag_start).collect();
        hmac.update(&tail);
        keystream.crypt_in_place(&mut tail);

        let computed = hmac.clone().finalize().into_bytes();
        if !constant_time_eq(&computed[..AUTH_CODE_LENGTH], &self.pending) {
            return Err(ZipError::InvalidSignature);
        }
        self.pending.clear();
        Ok(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_stops_at_first_non_overflow() {
        let mut counter = [0u8; 16];
        counter[0] = 0xFF;
        counter[1] = 0x01;
        increment_counter(&mut counter);
        assert_eq!(counter[0], 0);
        assert_eq!(counter[1], 2);
        assert_eq!(counter[2], 0);

        let mut all_ff = [0xFFu8; 16];
        increment_counter(&mut all_ff);
        assert_eq!(all_ff, [0u8; 16]);
    }

    fn roundtrip_chunked(plaintext: &[u8], chunk: usize) {
        let mut enc = AesEncryptor::with_salt("hunter2", [7u8; SALT_LENGTH]);
        let mut stream = Vec::new();
        for part in plaintext.chunks(chunk.max(1)) {
            stream.extend(enc.append(part));
        }
        stream.extend(enc.flush());
        assert_eq!(stream.len() as u64, plaintext.len() as u64 + OVERHEAD);

        let mut dec = AesDecryptor::new("hunter2");
        let mut recovered = Vec::new();
        for part in stream.chunks(chunk.max(1)) {
            recovered.extend(dec.append(part).unwrap());
        }
        recovered.extend(dec.flush().unwrap());
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn roundtrip_various_sizes() {
        for len in [0usize, 1, 15, 16, 17, 31, 32, 1000] {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
            for chunk in [1, 7, 16, 64, 1024] {
                roundtrip_chunked(&plaintext, chunk);
            }
        }
    }

    #[test]
    fn wrong_password_detected_by_verifier() {
        let mut enc = AesEncryptor::with_salt("correct", [1u8; SALT_LENGTH]);
        let mut stream = enc.append(b"data");
        stream.extend(enc.flush());

        let mut dec = AesDecryptor::new("incorrect");
        assert!(matches!(
            dec.append(&stream),
            Err(ZipError::InvalidPassword)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_tag_check() {
        let plaintext = vec![0x42u8; 100];
        let mut enc = AesEncryptor::with_salt("pw", [9u8; SALT_LENGTH]);
        let mut stream = enc.append(&plaintext);
        stream.extend(enc.flush());

        // Flip one ciphertext byte past the preamble.
        stream[PREAMBLE_LENGTH + 10] ^= 0x01;

        let mut dec = AesDecryptor::new("pw");
        let result = dec.append(&stream).and_then(|_| dec.flush());
        assert!(matches!(result, Err(ZipError::InvalidSignature)));
    }

    #[test]
    fn tampered_tag_fails_tag_check() {
        let mut enc = AesEncryptor::with_salt("pw", [3u8; SALT_LENGTH]);
        let mut stream = enc.append(b"payload");
        stream.extend(enc.flush());
        let last = stream.len() - 1;
        stream[last] ^= 0x80;

        let mut dec = AesDecryptor::new("pw");
        let result = dec.append(&stream).and_then(|_| dec.flush());
        assert!(matches!(result, Err(ZipError::InvalidSignature)));
    }

    #[test]
    fn truncated_stream_is_bad_format() {
        let mut dec = AesDecryptor::new("pw");
        dec.append(&[0u8; 5]).unwrap();
        assert!(matches!(dec.flush(), Err(ZipError::BadFormat(_))));
    }
}
