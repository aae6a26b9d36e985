// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Holds the signing keys of every role, indexed by key ID.

use crate::error::{self, Error, Result};
use crate::key_source::{KeySource, LocalKeySource};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use crate::sign::{generate_keypair, parse_keypair, KeyKind};
use log::{debug, info};
use ring::rand::SystemRandom;
use snafu::{IntoError, OptionExt, ResultExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

/// How long a single signature may take before it is reported as timed out.
pub const DEFAULT_SIGNING_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    key: Key,
    source: Box<dyn KeySource>,
}

/// A collection of key sources, each known by the ID of its public key.
///
/// Private key material never leaves its [`KeySource`]; the store only routes signing requests
/// and bounds how long each may take.
#[derive(Debug)]
pub struct KeyStore {
    dir: PathBuf,
    entries: HashMap<Decoded<Hex>, Entry>,
    timeout: Duration,
    rng: SystemRandom,
}

impl KeyStore {
    /// Creates an empty store. Generated keys are written to `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entries: HashMap::new(),
            timeout: DEFAULT_SIGNING_TIMEOUT,
            rng: SystemRandom::new(),
        }
    }

    /// Loads every `*.pem` file under `dir` as a local key.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self::new(dir);
        if !store.dir.exists() {
            return Ok(store);
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(&store.dir).follow_links(true) {
            let entry = entry.context(error::WalkDirSnafu {
                directory: &store.dir,
            })?;
            if entry.file_type().is_file()
                && entry.path().extension().and_then(|ext| ext.to_str()) == Some("pem")
            {
                paths.push(entry.into_path());
            }
        }

        for path in paths {
            let data = tokio::fs::read(&path)
                .await
                .context(error::FileReadSnafu { path: &path })?;
            let key = parse_keypair(&data)?.tuf_key();
            let key_id = store.add_offline(key, Box::new(LocalKeySource { path: path.clone() }))?;
            debug!("loaded key {} from {}", key_id, path.display());
        }
        Ok(store)
    }

    /// Sets how long a single signature may take.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The directory generated keys are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generates a new key pair and stores its private half as `<keyid>.pem`.
    pub async fn generate(&mut self, kind: KeyKind) -> Result<(Decoded<Hex>, Key)> {
        let pem = generate_keypair(kind)?;
        let key = parse_keypair(pem.as_bytes())?.tuf_key();
        let key_id = key.key_id()?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .context(error::DirCreateSnafu { path: &self.dir })?;
        let source = LocalKeySource {
            path: self.dir.join(format!("{key_id}.pem")),
        };
        source
            .write(&pem, key_id.original())
            .await
            .context(error::SigningUnavailableSnafu {
                key_id: key_id.to_string(),
            })?;

        info!("generated {} key {}", kind, key_id);
        self.entries.insert(
            key_id.clone(),
            Entry {
                key: key.clone(),
                source: Box::new(source),
            },
        );
        Ok((key_id, key))
    }

    /// Registers a source that can produce its signer now, learning the public key from it.
    pub async fn add_source(&mut self, source: Box<dyn KeySource>) -> Result<Decoded<Hex>> {
        let signer = source
            .as_sign()
            .await
            .map_err(|e| unavailable("<unregistered>", e))?;
        self.add_offline(signer.tuf_key(), source)
    }

    /// Registers a source whose public key is known out of band, such as an air-gapped signer.
    pub fn add_offline(&mut self, key: Key, source: Box<dyn KeySource>) -> Result<Decoded<Hex>> {
        let key_id = key.key_id()?;
        self.entries
            .insert(key_id.clone(), Entry { key, source });
        Ok(key_id)
    }

    /// Drops a retired key. Its key material is left where it is.
    pub fn remove(&mut self, key_id: &Decoded<Hex>) -> Option<Key> {
        self.entries.remove(key_id).map(|entry| entry.key)
    }

    /// The public key for `key_id`.
    pub fn public_key(&self, key_id: &Decoded<Hex>) -> Result<&Key> {
        self.entries
            .get(key_id)
            .map(|entry| &entry.key)
            .context(error::KeyNotFoundSnafu {
                key_id: key_id.to_string(),
            })
    }

    /// IDs of every key in the store.
    pub fn key_ids(&self) -> impl Iterator<Item = &Decoded<Hex>> {
        self.entries.keys()
    }

    /// Whether the store holds `key_id`.
    pub fn contains(&self, key_id: &Decoded<Hex>) -> bool {
        self.entries.contains_key(key_id)
    }

    /// Signs `msg` with `key_id`, waiting at most the configured timeout.
    pub async fn sign(&self, key_id: &Decoded<Hex>, msg: &[u8]) -> Result<Vec<u8>> {
        let entry = self.entries.get(key_id).context(error::KeyNotFoundSnafu {
            key_id: key_id.to_string(),
        })?;

        let signing = async {
            let signer = entry.source.as_sign().await?;
            signer.sign(msg, &self.rng).await
        };
        match tokio::time::timeout(self.timeout, signing).await {
            Ok(Ok(sig)) => Ok(sig),
            Ok(Err(e)) => Err(unavailable(key_id.original(), e)),
            Err(_) => error::SigningTimeoutSnafu {
                key_id: key_id.to_string(),
                timeout: self.timeout,
            }
            .fail(),
        }
    }
}

/// Keeps "pending" distinguishable from other signer failures.
fn unavailable(key_id: &str, e: Box<dyn std::error::Error + Send + Sync>) -> Error {
    match e.downcast::<Error>() {
        Ok(inner) if matches!(*inner, Error::SignaturePending { .. }) => *inner,
        Ok(inner) => error::SigningUnavailableSnafu { key_id }.into_error(inner),
        Err(source) => error::SigningUnavailableSnafu { key_id }.into_error(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sign::Sign;
    use async_trait::async_trait;
    use ring::rand::SecureRandom;
    use tempfile::TempDir;

    #[derive(Debug, Clone)]
    struct StuckSource(Key);

    struct StuckSigner(Key);

    #[async_trait]
    impl Sign for StuckSigner {
        fn tuf_key(&self) -> Key {
            self.0.clone()
        }

        async fn sign(
            &self,
            _msg: &[u8],
            _rng: &(dyn SecureRandom + Sync),
        ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync + 'static>>
        {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl KeySource for StuckSource {
        async fn as_sign(
            &self,
        ) -> std::result::Result<Box<dyn Sign>, Box<dyn std::error::Error + Send + Sync + 'static>>
        {
            Ok(Box::new(StuckSigner(self.0.clone())))
        }

        async fn write(
            &self,
            _value: &str,
            _key_id_hex: &str,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn generate_then_reopen() {
        let dir = TempDir::new().unwrap();
        let mut store = KeyStore::new(dir.path());
        let (ed_id, ed_key) = store.generate(KeyKind::Ed25519).await.unwrap();
        let (ec_id, _) = store.generate(KeyKind::EcdsaP256).await.unwrap();
        assert!(dir.path().join(format!("{ed_id}.pem")).is_file());

        let reopened = KeyStore::open(dir.path()).await.unwrap();
        assert!(reopened.contains(&ed_id));
        assert!(reopened.contains(&ec_id));
        assert_eq!(reopened.public_key(&ed_id).unwrap(), &ed_key);

        let sig = reopened.sign(&ec_id, b"targets").await.unwrap();
        assert!(reopened.public_key(&ec_id).unwrap().verify(b"targets", &sig));
    }

    #[tokio::test]
    async fn unknown_key() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path());
        let err = store
            .sign(&Decoded::from(vec![0u8; 32]), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::KeyUnavailable);
    }

    #[tokio::test]
    async fn removed_key_no_longer_signs() {
        let dir = TempDir::new().unwrap();
        let mut store = KeyStore::new(dir.path());
        let (key_id, key) = store.generate(KeyKind::Ed25519).await.unwrap();
        assert_eq!(store.remove(&key_id), Some(key));
        assert!(!store.contains(&key_id));
        assert!(store.sign(&key_id, b"x").await.is_err());
    }

    #[tokio::test]
    async fn slow_signer_times_out() {
        let dir = TempDir::new().unwrap();
        let mut store = KeyStore::new(dir.path()).with_timeout(Duration::from_millis(50));
        let (_, key) = store.generate(KeyKind::Ed25519).await.unwrap();
        let key_id = store
            .add_source(Box::new(StuckSource(key.clone())))
            .await
            .unwrap();
        let err = store.sign(&key_id, b"snapshot").await.unwrap_err();
        assert!(matches!(err, Error::SigningTimeout { .. }));
        assert_eq!(err.kind(), ErrorKind::KeyUnavailable);
    }
}
