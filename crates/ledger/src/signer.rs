use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::KeyError;
use crate::transaction::{SignedTransaction, UnsignedTransaction};

/// Ledger address of a verifying key: `0x` + the first 20 bytes of its sha256.
pub fn address_of(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    let hex: String = digest[..20].iter().map(|b| format!("{:02x}", b)).collect();
    format!("0x{}", hex)
}

/// The configured signing account.
pub struct AccountSigner {
    key: SigningKey,
    address: String,
}

impl std::fmt::Debug for AccountSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl AccountSigner {
    pub fn new(key: SigningKey) -> Self {
        let address = address_of(&key.verifying_key());
        AccountSigner { key, address }
    }

    /// Fresh random account, for local development and tests.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        AccountSigner::new(SigningKey::generate(&mut rng))
    }

    /// Read a key file holding a base64-encoded 32-byte Ed25519 seed.
    pub fn from_file(path: &Path) -> Result<Self, KeyError> {
        let contents = std::fs::read_to_string(path).map_err(|e| KeyError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_base64(&contents).map_err(|message| KeyError::Invalid {
            path: path.display().to_string(),
            message,
        })
    }

    pub fn from_base64(encoded: &str) -> Result<Self, String> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| format!("not base64: {}", e))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "expected 32 bytes".to_string())?;
        Ok(AccountSigner::new(SigningKey::from_bytes(&seed)))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Base64 seed, the on-disk key format.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key.to_bytes())
    }

    pub fn sign(&self, tx: UnsignedTransaction) -> Result<SignedTransaction, String> {
        let signature = self.key.sign(&tx.signing_bytes()?);
        Ok(SignedTransaction {
            tx,
            signature: BASE64.encode(signature.to_bytes()),
            public_key: BASE64.encode(self.key.verifying_key().to_bytes()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::ContractCall;

    fn unsigned(from: &str) -> UnsignedTransaction {
        UnsignedTransaction {
            from: from.to_string(),
            contract: "0xcontract".to_string(),
            nonce: 1,
            gas_limit: 200_000,
            gas_price: 1,
            call: ContractCall {
                method: "verifyProduct".to_string(),
                args: vec![serde_json::json!("P1")],
            },
            memo: "mark_verified:P1".to_string(),
        }
    }

    #[test]
    fn signed_transaction_verifies_and_round_trips() {
        let signer = AccountSigner::generate();
        let signed = signer.sign(unsigned(signer.address())).unwrap();
        signed.verify().unwrap();

        let raw = signed.encode().unwrap();
        let decoded = SignedTransaction::decode(&raw).unwrap();
        assert_eq!(decoded, signed);
        assert_eq!(decoded.tx_id().unwrap(), signed.tx_id().unwrap());
    }

    #[test]
    fn tampered_transaction_fails_verification() {
        let signer = AccountSigner::generate();
        let mut signed = signer.sign(unsigned(signer.address())).unwrap();
        signed.tx.nonce = 2;
        assert!(signed.verify().is_err());
    }

    #[test]
    fn foreign_sender_fails_verification() {
        let signer = AccountSigner::generate();
        let signed = signer.sign(unsigned("0xsomeoneelse")).unwrap();
        assert!(signed.verify().is_err());
    }

    #[test]
    fn key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.secret");
        let signer = AccountSigner::generate();
        std::fs::write(&path, signer.to_base64()).unwrap();
        let loaded = AccountSigner::from_file(&path).unwrap();
        assert_eq!(loaded.address(), signer.address());
    }

    #[test]
    fn short_key_is_invalid() {
        let err = AccountSigner::from_base64(&BASE64.encode([1u8; 16])).unwrap_err();
        assert!(err.contains("32 bytes"));
    }

    #[test]
    fn address_is_forty_hex_chars() {
        let signer = AccountSigner::generate();
        assert_eq!(signer.address().len(), 42);
        assert!(signer.address().starts_with("0x"));
    }
}
