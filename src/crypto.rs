use crate::types::{Hash, IdentityId};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SECRET_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
}

/// Ed25519 keypair. The secret never leaves this struct except through
/// [`Keypair::secret_bytes`] for persistence in the settings store.
#[derive(Clone)]
pub struct Keypair {
    pub public: [u8; PUBLIC_KEY_SIZE],
    secret: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = SigningKey::generate(&mut rand::rngs::OsRng);
        Self { public: secret.verifying_key().to_bytes(), secret }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; SECRET_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidSecretKey)?;
        let secret = SigningKey::from_bytes(&secret);
        Ok(Self { public: secret.verifying_key().to_bytes(), secret })
    }

    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.secret.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.secret.sign(message).to_bytes().to_vec()
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// SHA256 of the public key, the identity this keypair controls.
    pub fn identity_id(&self) -> IdentityId {
        identity_id(&self.public)
    }
}

pub fn verify(pubkey: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let pk_bytes: [u8; PUBLIC_KEY_SIZE] =
        pubkey.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
    let pk = VerifyingKey::from_bytes(&pk_bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    pk.verify(message, &sig).map_err(|_| CryptoError::InvalidSignature)
}

pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Identity id derivation: SHA256 of the raw Ed25519 public key.
pub fn identity_id(pubkey: &[u8]) -> IdentityId {
    sha256(pubkey)
}

pub fn base64url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

pub fn base64url_decode(data: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let keys = Keypair::generate();
        let msg = b"profile bytes";
        let sig = keys.sign(msg);
        assert!(verify(&keys.public, msg, &sig).is_ok());

        // Any flipped byte in the message breaks verification
        let mut bad = msg.to_vec();
        bad[0] ^= 1;
        assert!(verify(&keys.public, &bad, &sig).is_err());

        // Any flipped bit in the signature breaks verification
        let mut bad_sig = sig.clone();
        bad_sig[10] ^= 0x40;
        assert!(verify(&keys.public, msg, &bad_sig).is_err());
    }

    #[test]
    fn secret_roundtrip() {
        let keys = Keypair::generate();
        let restored = Keypair::from_secret_bytes(&keys.secret_bytes()).unwrap();
        assert_eq!(keys.public, restored.public);
        assert_eq!(keys.identity_id(), restored.identity_id());
    }

    #[test]
    fn base64url_roundtrip() {
        let data = [0xFFu8, 0x00, 0x7E, 0x3F];
        let enc = base64url_encode(&data);
        assert!(!enc.contains('+') && !enc.contains('/') && !enc.contains('='));
        assert_eq!(base64url_decode(&enc).unwrap(), data);
    }
}
