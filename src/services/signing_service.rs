use chrono::{DateTime, Utc};
use rsa::pkcs8::EncodePublicKey;
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::adapters::DataValue;
use crate::errors::{OracleError, OracleResult};
use crate::validation::AggregatedValue;

const KEY_BITS: usize = 2048;

/// Canonical message a source signs over one data point.
pub fn canonical_source_message(
    source_id: &str,
    value: &DataValue,
    timestamp: &DateTime<Utc>,
) -> String {
    format!("{}:{}:{}", source_id, value, timestamp.to_rfc3339())
}

/// Canonical message the node signs over one aggregated value.
pub fn canonical_aggregated_message(aggregated: &AggregatedValue, timestamp: &DateTime<Utc>) -> String {
    format!("{}:{}", aggregated.value, timestamp.to_rfc3339())
}

/// An aggregated value with the node's detached signature, signed exactly
/// once before submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedValue {
    pub aggregated: AggregatedValue,
    pub signature: Vec<u8>,
    pub produced_at: DateTime<Utc>,
}

/// Node signer producing RSA-PSS/SHA-256 detached signatures.
///
/// The keypair is generated at node start; the public key can be exported
/// for publication through the registry.
pub struct SigningService {
    signing_key: SigningKey<Sha256>,
    public_key: RsaPublicKey,
}

impl SigningService {
    pub fn generate() -> OracleResult<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| OracleError::Configuration(format!("Key generation failed: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            signing_key: SigningKey::new(private_key),
            public_key,
        })
    }

    /// Sign an aggregated value with the node key.
    pub fn sign(&self, aggregated: &AggregatedValue, timestamp: DateTime<Utc>) -> SignedValue {
        let message = canonical_aggregated_message(aggregated, &timestamp);
        let mut rng = rand::thread_rng();
        let signature = self.signing_key.sign_with_rng(&mut rng, message.as_bytes());

        SignedValue {
            aggregated: aggregated.clone(),
            signature: signature.to_vec(),
            produced_at: timestamp,
        }
    }

    /// Verify a detached signature against this node's public key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        verify_signature(&self.public_key, message, signature)
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// DER-encoded public key for registry publication.
    pub fn public_key_der(&self) -> OracleResult<Vec<u8>> {
        self.public_key
            .to_public_key_der()
            .map(|der| der.as_bytes().to_vec())
            .map_err(|e| OracleError::Serialization(format!("Public key export failed: {}", e)))
    }
}

/// Verify an RSA-PSS/SHA-256 signature against an arbitrary public key.
pub fn verify_signature(public_key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    match Signature::try_from(signature) {
        Ok(signature) => verifying_key.verify(message, &signature).is_ok(),
        Err(_) => false,
    }
}
