// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handles cryptographic keys and their serialization in metadata.

use crate::error::{self, Result};
use crate::schema::decoded::{Decoded, Hex};
use olpc_cjson::CanonicalFormatter;
use ring::digest::{digest, SHA256};
use ring::signature::VerificationAlgorithm;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use std::collections::HashMap;
use std::fmt;

/// Serializes signing keys in the TUF metadata format. All keys have the format
///
/// ```json
///  { "keytype" : KEYTYPE,
///    "scheme" : SCHEME,
///    "keyval" : KEYVAL
///  }
/// ```
/// where:
/// * `KEYTYPE` is a string denoting a public key signature system, `ed25519` or `ecdsa`.
/// * `SCHEME` is a string denoting a corresponding signature scheme, `ed25519` or
///   `ecdsa-sha2-nistp256`.
/// * `KEYVAL` is a dictionary containing the public portion of the key, hex encoded in
///   `public`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "keytype")]
pub enum Key {
    /// An Ed25519 key.
    #[serde(rename = "ed25519")]
    Ed25519 {
        /// The Ed25519 key.
        keyval: Ed25519Key,
        /// Denotes the key's signature scheme.
        scheme: Ed25519Scheme,
        /// Any additional fields read during deserialization; will not be used.
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    },
    /// An ECDSA P-256 key.
    #[serde(rename = "ecdsa")]
    Ecdsa {
        /// The ECDSA key.
        keyval: EcdsaKey,
        /// Denotes the key's signature scheme.
        scheme: EcdsaScheme,
        /// Any additional fields read during deserialization; will not be used.
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    },
}

/// Used to identify the Ed25519 signature scheme.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum Ed25519Scheme {
    /// `ed25519`: PureEdDSA over Curve25519.
    #[serde(rename = "ed25519")]
    Ed25519,
}

/// Represents a public Ed25519 key.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Ed25519Key {
    /// The raw 32-byte public key, hex encoded.
    pub public: Decoded<Hex>,
    /// Any additional fields read during deserialization; will not be used.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

/// Used to identify the ECDSA signature scheme.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum EcdsaScheme {
    /// `ecdsa-sha2-nistp256`: ECDSA over P-256 with SHA-256, ASN.1 DER signatures.
    #[serde(rename = "ecdsa-sha2-nistp256")]
    EcdsaSha2Nistp256,
}

/// Represents a public ECDSA key.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct EcdsaKey {
    /// The uncompressed SEC1 point, hex encoded.
    pub public: Decoded<Hex>,
    /// Any additional fields read during deserialization; will not be used.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Key {
    /// Calculate the key ID for this key: the SHA-256 of its canonical JSON form.
    pub fn key_id(&self) -> Result<Decoded<Hex>> {
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
        self.serialize(&mut ser)
            .context(error::JsonSerializationSnafu { what: "key" })?;
        Ok(digest(&SHA256, &buf).as_ref().to_vec().into())
    }

    /// Verify a signature of an object made with this key.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> bool {
        let alg: &'static dyn VerificationAlgorithm = match self {
            Key::Ed25519 {
                scheme: Ed25519Scheme::Ed25519,
                ..
            } => &ring::signature::ED25519,
            Key::Ecdsa {
                scheme: EcdsaScheme::EcdsaSha2Nistp256,
                ..
            } => &ring::signature::ECDSA_P256_SHA256_ASN1,
        };

        ring::signature::UnparsedPublicKey::new(alg, self.public())
            .verify(msg, signature)
            .is_ok()
    }

    /// The raw public key bytes.
    pub fn public(&self) -> &[u8] {
        match self {
            Key::Ed25519 { keyval, .. } => &keyval.public,
            Key::Ecdsa { keyval, .. } => &keyval.public,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Ed25519 { keyval, .. } => write!(f, "ed25519:{}", keyval.public),
            Key::Ecdsa { keyval, .. } => write!(f, "ecdsa:{}", keyval.public),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    fn ed25519_key(pair: &Ed25519KeyPair) -> Key {
        Key::Ed25519 {
            keyval: Ed25519Key {
                public: pair.public_key().as_ref().into(),
                _extra: HashMap::new(),
            },
            scheme: Ed25519Scheme::Ed25519,
            _extra: HashMap::new(),
        }
    }

    #[test]
    fn key_id_is_sha256_of_canonical_json() {
        let key: Key = serde_json::from_str(
            r#"{"keytype":"ed25519","scheme":"ed25519","keyval":{"public":"00"}}"#,
        )
        .unwrap();
        let canonical = br#"{"keytype":"ed25519","keyval":{"public":"00"},"scheme":"ed25519"}"#;
        assert_eq!(
            key.key_id().unwrap().as_ref(),
            digest(&SHA256, canonical).as_ref()
        );
        assert_eq!(key.key_id().unwrap().original().len(), 64);
    }

    #[test]
    fn verify_ed25519() {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let key = ed25519_key(&pair);
        let sig = pair.sign(b"release 1.2.3");
        assert!(key.verify(b"release 1.2.3", sig.as_ref()));
        assert!(!key.verify(b"release 1.2.4", sig.as_ref()));
    }

    #[test]
    fn unknown_keytype_rejected() {
        assert!(serde_json::from_str::<Key>(
            r#"{"keytype":"rsa","scheme":"rsassa-pss-sha256","keyval":{"public":"00"}}"#
        )
        .is_err());
    }
}
