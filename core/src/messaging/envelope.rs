/// Topics, symmetric keys and sealed envelopes
use crate::error::{BenchError, Result};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub const TOPIC_LENGTH: usize = 4;
const NONCE_LENGTH: usize = 12;
const KEY_DOMAIN: &[u8] = b"mailbench/symkey/v1";

/// Current wall clock in unix seconds
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Four-byte message classification tag
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Topic(pub [u8; TOPIC_LENGTH]);

impl Topic {
    pub const fn new(bytes: [u8; TOPIC_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOPIC_LENGTH] {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", u32::from_be_bytes(self.0))
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self)
    }
}

impl FromStr for Topic {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.len() != TOPIC_LENGTH * 2 {
            return Err(BenchError::Config(format!(
                "Topic {:?} must be {} hex digits",
                s,
                TOPIC_LENGTH * 2
            )));
        }
        let value = u32::from_str_radix(digits, 16)
            .map_err(|e| BenchError::Config(format!("Invalid topic {:?}: {}", s, e)))?;
        Ok(Self(value.to_be_bytes()))
    }
}

/// 256-bit symmetric key for envelope encryption
#[derive(Clone, PartialEq, Eq)]
pub struct SymKey([u8; 32]);

impl SymKey {
    /// Derive a key from a shared password; equal passwords give equal keys
    pub fn from_password(password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        hasher.update(password.as_bytes());
        Self(hasher.finalize().into())
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for SymKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymKey(..)")
    }
}

/// Content hash identifying an envelope
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvelopeHash(pub [u8; 32]);

impl fmt::Display for EnvelopeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for EnvelopeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvelopeHash({})", self)
    }
}

/// Encrypted message as it travels between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unix second after which the envelope is dropped
    pub expiry: u64,
    /// Lifetime in seconds; `expiry - ttl` is the send time
    pub ttl: u32,
    pub topic: Topic,
    pub nonce: Vec<u8>,
    /// AES-256-GCM ciphertext, topic as associated data
    pub data: Vec<u8>,
}

impl Envelope {
    /// Encrypt `payload` under `key`
    pub fn seal(key: &SymKey, topic: Topic, payload: &[u8], ttl: u32, now: u64) -> Result<Self> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let data = key
            .cipher()
            .encrypt(
                &nonce,
                Payload {
                    msg: payload,
                    aad: topic.as_bytes(),
                },
            )
            .map_err(|e| BenchError::Crypto(format!("AES encryption failed: {}", e)))?;

        Ok(Self {
            expiry: now + ttl as u64,
            ttl,
            topic,
            nonce: nonce.as_slice().to_vec(),
            data,
        })
    }

    /// Decrypt with `key`; `None` if the key does not fit or the data was tampered with
    pub fn open(&self, key: &SymKey) -> Option<Vec<u8>> {
        if self.nonce.len() != NONCE_LENGTH {
            return None;
        }
        let nonce = GenericArray::from_slice(&self.nonce);
        key.cipher()
            .decrypt(
                nonce,
                Payload {
                    msg: &self.data,
                    aad: self.topic.as_bytes(),
                },
            )
            .ok()
    }

    pub fn hash(&self) -> EnvelopeHash {
        let mut hasher = Sha256::new();
        hasher.update(self.expiry.to_be_bytes());
        hasher.update(self.ttl.to_be_bytes());
        hasher.update(self.topic.as_bytes());
        hasher.update(&self.nonce);
        hasher.update(&self.data);
        EnvelopeHash(hasher.finalize().into())
    }

    /// Unix second the envelope was sealed at
    pub fn sent(&self) -> u64 {
        self.expiry.saturating_sub(self.ttl as u64)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry < now
    }

    /// Approximate wire size, used for the message size limit
    pub fn size(&self) -> usize {
        20 + self.nonce.len() + self.data.len()
    }
}
