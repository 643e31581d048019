//! Transaction signing seam. Key custody is external to this service; the
//! pipeline only sees an opaque signer that turns an unsigned payload into
//! signed bytes plus the hash the chain will know the transaction by.

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("Signing failed: {0}")]
    Failed(String),
}

/// Unsigned transaction handed to the signer: codec output plus the
/// sequencing value it was encoded for.
#[derive(Debug, Clone)]
pub struct UnsignedTx {
    pub payload: Vec<u8>,
    pub sequencing: u64,
}

/// Signed bytes and the hash assigned at signing time.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub raw_tx: Vec<u8>,
    pub tx_hash: String,
}

#[async_trait]
pub trait TxSigner: Send + Sync {
    /// Signer's chain address.
    fn address(&self) -> &str;

    async fn sign(&self, unsigned: &UnsignedTx) -> Result<SignedTx, SignError>;
}

/// Ed25519 signer for the alternate chain. Raw transaction layout:
/// 64-byte signature followed by the message; the transaction id is the
/// hex-encoded signature prefix, matching how that chain derives tx ids.
pub struct Ed25519Signer {
    key: SigningKey,
    address: String,
}

impl Ed25519Signer {
    pub fn new(key: SigningKey) -> Self {
        let address = hex::encode(key.verifying_key().to_bytes());
        Self { key, address }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(seed))
    }
}

#[async_trait]
impl TxSigner for Ed25519Signer {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign(&self, unsigned: &UnsignedTx) -> Result<SignedTx, SignError> {
        let signature = self.key.sign(&unsigned.payload);
        let mut raw_tx = Vec::with_capacity(64 + unsigned.payload.len());
        raw_tx.extend_from_slice(&signature.to_bytes());
        raw_tx.extend_from_slice(&unsigned.payload);
        Ok(SignedTx {
            tx_hash: hex::encode(&signature.to_bytes()[..32]),
            raw_tx,
        })
    }
}

/// Deterministic signer for tests: "signature" is a checksum, so the same
/// payload+sequencing always produces the same hash.
pub struct MockSigner {
    address: String,
}

impl MockSigner {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl TxSigner for MockSigner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign(&self, unsigned: &UnsignedTx) -> Result<SignedTx, SignError> {
        // FNV-1a over payload and sequencing
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in unsigned
            .payload
            .iter()
            .chain(unsigned.sequencing.to_be_bytes().iter())
        {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        let mut raw_tx = unsigned.sequencing.to_be_bytes().to_vec();
        raw_tx.extend_from_slice(&unsigned.payload);
        Ok(SignedTx {
            tx_hash: format!("0x{:016x}", hash),
            raw_tx,
        })
    }
}
