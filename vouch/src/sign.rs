// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the `Sign` abstraction and its implementations for `ring` key pairs.

use crate::error::{self, Result};
use crate::schema::key::{EcdsaKey, EcdsaScheme, Ed25519Key, Ed25519Scheme, Key};
use async_trait::async_trait;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{EcdsaKeyPair, Ed25519KeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use serde::{Deserialize, Serialize};
use serde_plain::derive_display_from_serialize;
use snafu::{OptionExt, ResultExt};
use std::collections::HashMap;

const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";

/// This trait must be implemented for each type of key with which you will sign things.
#[async_trait]
pub trait Sign: Sync + Send {
    /// Returns the decoded key along with its scheme and other metadata.
    fn tuf_key(&self) -> Key;

    /// Signs the supplied message.
    async fn sign(
        &self,
        msg: &[u8],
        rng: &(dyn SecureRandom + Sync),
    ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync + 'static>>;
}

/// Implements the Sign trait for ED25519
#[async_trait]
impl Sign for Ed25519KeyPair {
    fn tuf_key(&self) -> Key {
        Key::Ed25519 {
            keyval: Ed25519Key {
                public: self.public_key().as_ref().to_vec().into(),
                _extra: HashMap::new(),
            },
            scheme: Ed25519Scheme::Ed25519,
            _extra: HashMap::new(),
        }
    }

    async fn sign(
        &self,
        msg: &[u8],
        _rng: &(dyn SecureRandom + Sync),
    ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let signature = self.sign(msg);
        Ok(signature.as_ref().to_vec())
    }
}

/// Implements the Sign trait for ECDSA keypairs
#[async_trait]
impl Sign for EcdsaKeyPair {
    fn tuf_key(&self) -> Key {
        Key::Ecdsa {
            keyval: EcdsaKey {
                public: self.public_key().as_ref().to_vec().into(),
                _extra: HashMap::new(),
            },
            scheme: EcdsaScheme::EcdsaSha2Nistp256,
            _extra: HashMap::new(),
        }
    }

    async fn sign(
        &self,
        msg: &[u8],
        rng: &(dyn SecureRandom + Sync),
    ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let signature = self.sign(rng, msg).context(error::SignSnafu)?;
        Ok(signature.as_ref().to_vec())
    }
}

/// The kinds of key pair this library can generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyKind {
    /// Ed25519.
    Ed25519,
    /// ECDSA over NIST P-256 with SHA-256.
    EcdsaP256,
}

derive_display_from_serialize!(KeyKind);

/// Generates a new key pair, returning it as a PKCS#8 PEM document.
pub fn generate_keypair(kind: KeyKind) -> Result<String> {
    let rng = SystemRandom::new();
    let pkcs8 = match kind {
        KeyKind::Ed25519 => Ed25519KeyPair::generate_pkcs8(&rng)
            .ok()
            .context(error::KeyGenerateSnafu { key_kind: kind })?,
        KeyKind::EcdsaP256 => EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .ok()
            .context(error::KeyGenerateSnafu { key_kind: kind })?,
    };
    Ok(pem::encode(&pem::Pem::new(
        PRIVATE_KEY_TAG,
        pkcs8.as_ref().to_vec(),
    )))
}

/// Parses a supplied keypair and if it is recognized, returns an object that
/// implements the Sign trait.
/// Accepted keys: ED25519 pkcs8, ECDSA P-256 pkcs8.
pub fn parse_keypair(key: &[u8]) -> Result<Box<dyn Sign>> {
    let pem = pem::parse(key).context(error::PemParseSnafu)?;
    if pem.tag() != PRIVATE_KEY_TAG {
        return error::KeyUnrecognizedSnafu.fail();
    }

    if let Ok(ed25519_key_pair) = Ed25519KeyPair::from_pkcs8_maybe_unchecked(pem.contents()) {
        return Ok(Box::new(ed25519_key_pair));
    }

    let rng = SystemRandom::new();
    let ecdsa_key_pair =
        EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pem.contents(), &rng)
            .context(error::KeyRejectedSnafu)?;
    Ok(Box::new(ecdsa_key_pair))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generated_keys_sign_and_verify() {
        let rng = SystemRandom::new();
        for kind in [KeyKind::Ed25519, KeyKind::EcdsaP256] {
            let pem = generate_keypair(kind).unwrap();
            let signer = parse_keypair(pem.as_bytes()).unwrap();
            let sig = signer.sign(b"snapshot", &rng).await.unwrap();
            assert!(signer.tuf_key().verify(b"snapshot", &sig), "{kind}");
            assert!(!signer.tuf_key().verify(b"snapshoT", &sig), "{kind}");
        }
    }

    #[test]
    fn rejects_non_private_key_pem() {
        let pem = pem::encode(&pem::Pem::new("CERTIFICATE", vec![0u8; 4]));
        assert!(parse_keypair(pem.as_bytes()).is_err());
    }
}
