// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::{self, Result};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use crate::schema::{Role, RoleKeys, Root, Signed};
use log::trace;
use std::collections::{HashMap, HashSet};

impl Root {
    /// Checks `role` against the keys and threshold this root assigns to its role type.
    pub fn verify_role<T: Role>(&self, role: &Signed<T>) -> Result<()> {
        role.verify_with(&self.keys, self.role_keys(T::TYPE)?)
    }
}

struct Tally {
    valid: u64,
    failed: Option<String>,
}

impl<T: Role> Signed<T> {
    fn tally(&self, keys: &HashMap<Decoded<Hex>, Key>, role_keys: &RoleKeys) -> Result<Tally> {
        let data = self.signed.canonical_form()?;
        let mut valid_keys: HashSet<&Decoded<Hex>> = HashSet::new();
        let mut failed: Option<String> = None;

        for signature in &self.signatures {
            if !role_keys.authorizes(&signature.keyid) {
                trace!("ignoring {} signature by unauthorized key {}", T::TYPE, signature.keyid);
                continue;
            }
            if valid_keys.contains(&signature.keyid) {
                continue;
            }
            let Some(key) = keys.get(&signature.keyid) else {
                continue;
            };
            if key.verify(&data, &signature.sig) {
                valid_keys.insert(&signature.keyid);
            } else if failed.is_none() {
                failed = Some(signature.keyid.to_string());
            }
        }

        Ok(Tally {
            valid: valid_keys.len() as u64,
            failed,
        })
    }

    /// The number of distinct, valid signatures by keys authorized in `role_keys`.
    pub fn valid_signatures(
        &self,
        keys: &HashMap<Decoded<Hex>, Key>,
        role_keys: &RoleKeys,
    ) -> Result<u64> {
        Ok(self.tally(keys, role_keys)?.valid)
    }

    /// Counts distinct, valid signatures by keys authorized in `role_keys`.
    ///
    /// Signatures from key IDs outside `role_keys`, or repeating a key ID already counted, are
    /// ignored. Succeeds when the count reaches the threshold.
    pub fn verify_with(
        &self,
        keys: &HashMap<Decoded<Hex>, Key>,
        role_keys: &RoleKeys,
    ) -> Result<()> {
        let Tally { valid, failed } = self.tally(keys, role_keys)?;
        if valid >= role_keys.threshold.get() {
            return Ok(());
        }
        if let Some(key_id) = failed {
            return error::SignatureInvalidSnafu {
                role: T::TYPE,
                key_id,
            }
            .fail();
        }
        error::ThresholdNotMetSnafu {
            role: T::TYPE,
            valid,
            threshold: role_keys.threshold,
        }
        .fail()
    }

    /// Checks this document against the keys `root` assigns to its role type.
    pub fn verify(&self, root: &Root) -> Result<()> {
        root.verify_role(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schema::key::{Ed25519Key, Ed25519Scheme};
    use crate::schema::{Signature, Targets};
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};
    use std::num::NonZeroU64;

    struct Fixture {
        pairs: Vec<Ed25519KeyPair>,
        keys: HashMap<Decoded<Hex>, Key>,
        ids: Vec<Decoded<Hex>>,
    }

    fn fixture(count: usize) -> Fixture {
        let rng = SystemRandom::new();
        let mut pairs = Vec::new();
        let mut keys = HashMap::new();
        let mut ids = Vec::new();
        for _ in 0..count {
            let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
            let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
            let key = Key::Ed25519 {
                keyval: Ed25519Key {
                    public: pair.public_key().as_ref().into(),
                    _extra: HashMap::new(),
                },
                scheme: Ed25519Scheme::Ed25519,
                _extra: HashMap::new(),
            };
            let id = key.key_id().unwrap();
            keys.insert(id.clone(), key);
            ids.push(id);
            pairs.push(pair);
        }
        Fixture { pairs, keys, ids }
    }

    fn targets() -> Signed<Targets> {
        Signed::unsigned(Targets::new(
            NonZeroU64::new(1).unwrap(),
            "2030-01-01T00:00:00Z".parse().unwrap(),
        ))
    }

    fn sign(doc: &mut Signed<Targets>, fx: &Fixture, index: usize) {
        let data = doc.signed.canonical_form().unwrap();
        doc.signatures.push(Signature {
            keyid: fx.ids[index].clone(),
            sig: fx.pairs[index].sign(&data).as_ref().into(),
        });
    }

    fn role_keys(fx: &Fixture, threshold: u64) -> RoleKeys {
        RoleKeys {
            keyids: fx.ids.clone(),
            threshold: NonZeroU64::new(threshold).unwrap(),
            _extra: HashMap::new(),
        }
    }

    #[test]
    fn two_of_three() {
        let fx = fixture(3);
        let rk = role_keys(&fx, 2);

        let mut doc = targets();
        sign(&mut doc, &fx, 0);
        let err = doc.verify_with(&fx.keys, &rk).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThresholdNotMet);

        sign(&mut doc, &fx, 2);
        doc.verify_with(&fx.keys, &rk).unwrap();
    }

    #[test]
    fn repeated_key_counts_once() {
        let fx = fixture(3);
        let mut doc = targets();
        sign(&mut doc, &fx, 1);
        sign(&mut doc, &fx, 1);
        let err = doc.verify_with(&fx.keys, &role_keys(&fx, 2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThresholdNotMet);
    }

    #[test]
    fn unauthorized_key_ignored() {
        let fx = fixture(2);
        let mut doc = targets();
        sign(&mut doc, &fx, 1);
        let rk = RoleKeys {
            keyids: vec![fx.ids[0].clone()],
            threshold: NonZeroU64::new(1).unwrap(),
            _extra: HashMap::new(),
        };
        let err = doc.verify_with(&fx.keys, &rk).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ThresholdNotMet);
    }

    #[test]
    fn bit_flip_invalidates_every_signature() {
        let fx = fixture(2);
        let mut doc = targets();
        sign(&mut doc, &fx, 0);
        sign(&mut doc, &fx, 1);
        doc.verify_with(&fx.keys, &role_keys(&fx, 2)).unwrap();

        doc.signed.version = NonZeroU64::new(3).unwrap();
        let err = doc.verify_with(&fx.keys, &role_keys(&fx, 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid);
    }
}
