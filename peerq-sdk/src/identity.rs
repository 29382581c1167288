//! Client identity: an ECDSA P-256 keypair plus the server-assigned
//! registration state.
//!
//! The keypair signs registration material and can be exported for
//! durable storage and restored on a later run. The fingerprint is NOT
//! derived from the key — the server binds it at register time and it is
//! the stable identifier every peer reference uses afterwards.
//!
//! Identity keys are for sign/verify only. The E2E layer generates its
//! own ephemeral ECDH keys per room; the two must never be conflated.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// Exportable keypair form, suitable for a consumer's durable store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IdentityKeys {
    /// Raw P-256 scalar, base64 (32 bytes).
    pub private_key: String,
    /// Uncompressed SEC1 point, base64 (65 bytes).
    pub public_key: String,
}

/// The local client identity.
///
/// Created empty; populated by [`Identity::ensure_keys`] before
/// registration; the fingerprint and alias are set only from the
/// server's `registered` acknowledgement.
#[derive(Default)]
pub struct Identity {
    signing: Option<SigningKey>,
    fingerprint: Option<String>,
    alias: Option<String>,
}

impl Identity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a keypair, or restore one if `keys` is given.
    /// No-op when keys are already present.
    pub fn ensure_keys(&mut self, keys: Option<&IdentityKeys>) -> Result<(), IdentityError> {
        if self.signing.is_some() {
            return Ok(());
        }
        self.signing = Some(match keys {
            Some(keys) => {
                let raw = B64
                    .decode(&keys.private_key)
                    .map_err(|_| IdentityError::InvalidKey)?;
                SigningKey::from_slice(&raw).map_err(|_| IdentityError::InvalidKey)?
            }
            None => SigningKey::random(&mut OsRng),
        });
        Ok(())
    }

    /// Discard the current keypair and registration, then generate fresh keys.
    pub fn regenerate(&mut self) {
        self.signing = Some(SigningKey::random(&mut OsRng));
        self.fingerprint = None;
        self.alias = None;
    }

    pub fn has_keys(&self) -> bool {
        self.signing.is_some()
    }

    /// Base64 of the uncompressed public point, as sent in `register`.
    pub fn public_key_b64(&self) -> Option<String> {
        self.signing.as_ref().map(|key| {
            let point = key.verifying_key().to_encoded_point(false);
            B64.encode(point.as_bytes())
        })
    }

    /// Export both halves for durable storage.
    pub fn export(&self) -> Option<IdentityKeys> {
        let signing = self.signing.as_ref()?;
        let point = signing.verifying_key().to_encoded_point(false);
        Some(IdentityKeys {
            private_key: B64.encode(signing.to_bytes()),
            public_key: B64.encode(point.as_bytes()),
        })
    }

    /// Sign arbitrary bytes; returns the raw 64-byte signature, base64.
    pub fn sign(&self, message: &[u8]) -> Result<String, IdentityError> {
        let signing = self.signing.as_ref().ok_or(IdentityError::NoKeys)?;
        let signature: Signature = signing.sign(message);
        Ok(B64.encode(signature.to_bytes()))
    }

    /// Record the server's registration acknowledgement.
    pub fn set_registration(&mut self, fingerprint: String, alias: String) {
        self.fingerprint = Some(fingerprint);
        self.alias = Some(alias);
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn set_alias(&mut self, alias: String) {
        self.alias = Some(alias);
    }
}

/// Verify a base64 signature against a base64 SEC1 public key.
pub fn verify(
    public_key_b64: &str,
    message: &[u8],
    signature_b64: &str,
) -> Result<bool, IdentityError> {
    let point = B64
        .decode(public_key_b64)
        .map_err(|_| IdentityError::InvalidKey)?;
    let verifying = VerifyingKey::from_sec1_bytes(&point).map_err(|_| IdentityError::InvalidKey)?;
    let raw = B64
        .decode(signature_b64)
        .map_err(|_| IdentityError::InvalidSignature)?;
    let signature =
        Signature::from_slice(&raw).map_err(|_| IdentityError::InvalidSignature)?;
    Ok(verifying.verify(message, &signature).is_ok())
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("no identity keys present")]
    NoKeys,
    #[error("invalid key material")]
    InvalidKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_sign_verify() {
        let mut identity = Identity::new();
        identity.ensure_keys(None).unwrap();

        let public = identity.public_key_b64().unwrap();
        let sig = identity.sign(b"challenge").unwrap();
        assert!(verify(&public, b"challenge", &sig).unwrap());
        assert!(!verify(&public, b"tampered", &sig).unwrap());
    }

    #[test]
    fn export_restore_preserves_signing() {
        let mut original = Identity::new();
        original.ensure_keys(None).unwrap();
        let exported = original.export().unwrap();

        let mut restored = Identity::new();
        restored.ensure_keys(Some(&exported)).unwrap();

        assert_eq!(original.public_key_b64(), restored.public_key_b64());
        let sig = restored.sign(b"after restore").unwrap();
        assert!(verify(&exported.public_key, b"after restore", &sig).unwrap());
    }

    #[test]
    fn ensure_keys_is_idempotent() {
        let mut identity = Identity::new();
        identity.ensure_keys(None).unwrap();
        let first = identity.public_key_b64();
        identity.ensure_keys(None).unwrap();
        assert_eq!(first, identity.public_key_b64());
    }

    #[test]
    fn regenerate_clears_registration() {
        let mut identity = Identity::new();
        identity.ensure_keys(None).unwrap();
        identity.set_registration("fp-1".into(), "alice".into());
        let old_key = identity.public_key_b64();

        identity.regenerate();
        assert!(identity.fingerprint().is_none());
        assert_ne!(old_key, identity.public_key_b64());
    }
}
