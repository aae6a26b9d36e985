// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signs metadata documents with keys from a [`KeyStore`] and checks signature thresholds.

use crate::error::Result;
use crate::keystore::KeyStore;
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use crate::schema::{Role, RoleKeys, Signature, Signed};
use log::{debug, warn};
use std::collections::HashMap;

/// Produces and checks signatures over the canonical form of metadata documents.
#[derive(Debug, Clone, Copy)]
pub struct MetadataSigner<'a> {
    keystore: &'a KeyStore,
}

impl<'a> MetadataSigner<'a> {
    /// A signer backed by `keystore`.
    pub fn new(keystore: &'a KeyStore) -> Self {
        Self { keystore }
    }

    /// Signs `signed` with each of `key_ids`, failing on the first key that cannot sign.
    pub async fn sign_document<T: Role>(
        &self,
        signed: T,
        key_ids: &[Decoded<Hex>],
    ) -> Result<Signed<T>> {
        let data = signed.canonical_form()?;
        let mut signatures = Vec::with_capacity(key_ids.len());
        for key_id in key_ids {
            let sig = self.keystore.sign(key_id, &data).await?;
            signatures.push(Signature {
                keyid: key_id.clone(),
                sig: sig.into(),
            });
        }
        Ok(Signed { signed, signatures })
    }

    /// Adds a signature from every key authorized by `role_keys` that the store holds and that
    /// has not signed yet. Keys that cannot sign right now are logged and skipped.
    ///
    /// Returns the number of distinct valid authorized signatures on the document afterwards.
    pub async fn add_signatures<T: Role>(
        &self,
        document: &mut Signed<T>,
        keys: &HashMap<Decoded<Hex>, Key>,
        role_keys: &RoleKeys,
    ) -> Result<u64> {
        let data = document.signed.canonical_form()?;
        for key_id in &role_keys.keyids {
            if document.is_signed_by(key_id) || !self.keystore.contains(key_id) {
                continue;
            }
            match self.keystore.sign(key_id, &data).await {
                Ok(sig) => {
                    debug!("{} signed by {}", T::TYPE, key_id);
                    document.signatures.push(Signature {
                        keyid: key_id.clone(),
                        sig: sig.into(),
                    });
                }
                Err(e) => warn!("{} signature by {} unavailable: {}", T::TYPE, key_id, e),
            }
        }
        document.valid_signatures(keys, role_keys)
    }

    /// Succeeds when `document` carries at least `role_keys.threshold` distinct valid
    /// signatures from keys authorized by `role_keys`.
    pub fn verify_document<T: Role>(
        document: &Signed<T>,
        keys: &HashMap<Decoded<Hex>, Key>,
        role_keys: &RoleKeys,
    ) -> Result<()> {
        document.verify_with(keys, role_keys)
    }

    /// The boolean form of [`MetadataSigner::verify_document`].
    pub fn is_valid<T: Role>(
        document: &Signed<T>,
        keys: &HashMap<Decoded<Hex>, Key>,
        role_keys: &RoleKeys,
    ) -> bool {
        Self::verify_document(document, keys, role_keys).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use crate::schema::Timestamp;
    use crate::sign::KeyKind;
    use std::num::NonZeroU64;
    use tempfile::TempDir;

    async fn store_with(count: usize) -> (TempDir, KeyStore, HashMap<Decoded<Hex>, Key>, RoleKeys) {
        let dir = TempDir::new().unwrap();
        let mut store = KeyStore::new(dir.path());
        let mut keys = HashMap::new();
        let mut keyids = Vec::new();
        for _ in 0..count {
            let (id, key) = store.generate(KeyKind::Ed25519).await.unwrap();
            keys.insert(id.clone(), key);
            keyids.push(id);
        }
        let role_keys = RoleKeys {
            keyids,
            threshold: NonZeroU64::new(2).unwrap(),
            _extra: HashMap::new(),
        };
        (dir, store, keys, role_keys)
    }

    fn timestamp() -> Timestamp {
        Timestamp::new(
            NonZeroU64::new(1).unwrap(),
            "2030-01-01T00:00:00Z".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn sign_then_verify() {
        let (_dir, store, keys, role_keys) = store_with(3).await;
        let signer = MetadataSigner::new(&store);
        let signed = signer
            .sign_document(timestamp(), &role_keys.keyids[..2])
            .await
            .unwrap();
        assert_eq!(signed.signatures.len(), 2);
        assert!(MetadataSigner::is_valid(&signed, &keys, &role_keys));
    }

    #[tokio::test]
    async fn sign_document_fails_on_missing_key() {
        let (_dir, store, _keys, _role_keys) = store_with(1).await;
        let err = MetadataSigner::new(&store)
            .sign_document(timestamp(), &[Decoded::from(vec![7u8; 32])])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyNotFound { .. }));
    }

    #[tokio::test]
    async fn add_signatures_skips_keys_not_held() {
        let (_dir, mut store, keys, role_keys) = store_with(3).await;
        store.remove(&role_keys.keyids[0]);
        store.remove(&role_keys.keyids[1]);

        let mut document = Signed::unsigned(timestamp());
        let signer = MetadataSigner::new(&store);
        let valid = signer
            .add_signatures(&mut document, &keys, &role_keys)
            .await
            .unwrap();
        assert_eq!(valid, 1);
        let err = MetadataSigner::verify_document(&document, &keys, &role_keys).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThresholdNotMet);

        // Signing again does not duplicate the existing signature.
        signer
            .add_signatures(&mut document, &keys, &role_keys)
            .await
            .unwrap();
        assert_eq!(document.signatures.len(), 1);
    }
}
