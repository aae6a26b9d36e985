// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides an abstraction over the source of a signing key. This allows signing keys to be
//! obtained from local files or from a separate signing device.

use crate::error::{self, Result};
use crate::schema::key::Key;
use crate::sign::{parse_keypair, Sign};
use async_trait::async_trait;
use log::{debug, info};
use ring::digest::{digest, SHA256};
use ring::rand::SecureRandom;
use snafu::{ensure, ResultExt};
use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const REQUEST_EXTENSION: &str = "request";
const SIGNATURE_EXTENSION: &str = "sig";

/// This trait should be implemented for each source of signing keys.
#[async_trait]
pub trait KeySource: Debug + Send + Sync + KeySourceClone {
    /// Returns an object that implements the `Sign` trait.
    async fn as_sign(
        &self,
    ) -> std::result::Result<Box<dyn Sign>, Box<dyn std::error::Error + Send + Sync + 'static>>;

    /// Writes a key back to the `KeySource`.
    async fn write(
        &self,
        value: &str,
        key_id_hex: &str,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;
}

/// Trait to allow a `KeySource` to be clonable for passing around copies of a `Box<dyn KeySource>`.
pub trait KeySourceClone {
    /// Clones the `KeySource` into a new `Box<dyn KeySource>`.
    fn clone_keysource(&self) -> Box<dyn KeySource>;
}

impl<T> KeySourceClone for T
where
    T: KeySource + Clone + 'static,
{
    fn clone_keysource(&self) -> Box<dyn KeySource> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn KeySource> {
    fn clone(&self) -> Self {
        self.clone_keysource()
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Points to a local key using a filesystem path.
#[derive(Debug, Clone)]
pub struct LocalKeySource {
    /// The path to a local key file in PEM pkcs8 format.
    pub path: PathBuf,
}

/// Implements the `KeySource` trait for a `LocalKeySource` (file)
#[async_trait]
impl KeySource for LocalKeySource {
    async fn as_sign(
        &self,
    ) -> std::result::Result<Box<dyn Sign>, Box<dyn std::error::Error + Send + Sync + 'static>>
    {
        let data = tokio::fs::read(&self.path)
            .await
            .context(error::FileReadSnafu { path: &self.path })?;
        Ok(parse_keypair(&data)?)
    }

    async fn write(
        &self,
        value: &str,
        _key_id_hex: &str,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        Ok(tokio::fs::write(&self.path, value.as_bytes())
            .await
            .context(error::FileWriteSnafu { path: &self.path })?)
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// A key held by a separate signing device, reached through an exchange directory.
///
/// To sign, a request file `<keyid>.<request-id>.request` holding the hex-encoded message is
/// written to `exchange_dir`. The device answers with `<keyid>.<request-id>.sig` holding the
/// hex-encoded signature. Until that file appears, signing reports
/// [`Error::SignaturePending`](crate::error::Error::SignaturePending). The request ID is the
/// SHA-256 of the message, so retrying the same signing operation finds the same answer.
#[derive(Debug, Clone)]
pub struct ExternalKeySource {
    /// Directory shared with the signing device.
    pub exchange_dir: PathBuf,
    /// The device's public key, known out of band.
    pub key: Key,
}

#[async_trait]
impl KeySource for ExternalKeySource {
    async fn as_sign(
        &self,
    ) -> std::result::Result<Box<dyn Sign>, Box<dyn std::error::Error + Send + Sync + 'static>>
    {
        Ok(Box::new(ExternalSigner {
            exchange_dir: self.exchange_dir.clone(),
            key: self.key.clone(),
        }))
    }

    async fn write(
        &self,
        _value: &str,
        key_id_hex: &str,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        Err(format!("key {key_id_hex} lives on an external signer and cannot be written").into())
    }
}

#[derive(Debug)]
struct ExternalSigner {
    exchange_dir: PathBuf,
    key: Key,
}

impl ExternalSigner {
    async fn answer(&self, key_id: &str, request_id: &str, msg: &[u8]) -> Result<Vec<u8>> {
        let request_path = request_path(&self.exchange_dir, key_id, request_id);
        let sig_path = self
            .exchange_dir
            .join(format!("{key_id}.{request_id}.{SIGNATURE_EXTENSION}"));

        match tokio::fs::read_to_string(&sig_path).await {
            Ok(hex_sig) => {
                let sig = hex::decode(hex_sig.trim()).context(error::HexDecodeSnafu)?;
                ensure!(
                    self.key.verify(msg, &sig),
                    error::ExternalSignatureInvalidSnafu {
                        key_id,
                        path: &sig_path,
                    }
                );
                debug!("collected external signature {}", sig_path.display());
                Ok(sig)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.exchange_dir)
                    .await
                    .context(error::DirCreateSnafu {
                        path: &self.exchange_dir,
                    })?;
                tokio::fs::write(&request_path, hex::encode(msg))
                    .await
                    .context(error::FileWriteSnafu {
                        path: &request_path,
                    })?;
                info!(
                    "signature by key {} requested at {}",
                    key_id,
                    request_path.display()
                );
                error::SignaturePendingSnafu {
                    key_id,
                    request: request_path,
                }
                .fail()
            }
            Err(e) => Err(e).context(error::FileReadSnafu { path: sig_path }),
        }
    }
}

#[async_trait]
impl Sign for ExternalSigner {
    fn tuf_key(&self) -> Key {
        self.key.clone()
    }

    async fn sign(
        &self,
        msg: &[u8],
        _rng: &(dyn SecureRandom + Sync),
    ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let key_id = hex::encode(self.key.key_id()?);
        let request_id = hex::encode(digest(&SHA256, msg));
        Ok(self.answer(&key_id, &request_id, msg).await?)
    }
}

fn request_path(dir: &Path, key_id: &str, request_id: &str) -> PathBuf {
    dir.join(format!("{key_id}.{request_id}.{REQUEST_EXTENSION}"))
}

/// A signing request waiting in an exchange directory, as seen by the signing device.
#[derive(Debug, Clone)]
pub struct SignRequest {
    /// Hex key ID of the key asked to sign.
    pub key_id: String,
    /// The message to sign.
    pub message: Vec<u8>,
    path: PathBuf,
}

impl SignRequest {
    /// Lists unanswered requests in `exchange_dir`.
    pub async fn pending(exchange_dir: &Path) -> Result<Vec<SignRequest>> {
        let mut requests = Vec::new();
        let mut entries = match tokio::fs::read_dir(exchange_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(requests),
            Err(e) => return Err(e).context(error::FileReadSnafu { path: exchange_dir }),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(error::FileReadSnafu { path: exchange_dir })?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(REQUEST_EXTENSION) {
                continue;
            }
            if tokio::fs::metadata(path.with_extension(SIGNATURE_EXTENSION))
                .await
                .is_ok()
            {
                continue;
            }
            let Some(key_id) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.split('.').next())
            else {
                continue;
            };
            let key_id = key_id.to_string();
            let hex_msg = tokio::fs::read_to_string(&path)
                .await
                .context(error::FileReadSnafu { path: &path })?;
            let message = hex::decode(hex_msg.trim()).context(error::HexDecodeSnafu)?;
            requests.push(SignRequest {
                key_id,
                message,
                path,
            });
        }
        Ok(requests)
    }

    /// Answers the request with `signature`.
    pub async fn respond(&self, signature: &[u8]) -> Result<()> {
        let sig_path = self.path.with_extension(SIGNATURE_EXTENSION);
        tokio::fs::write(&sig_path, hex::encode(signature))
            .await
            .context(error::FileWriteSnafu { path: sig_path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sign::{generate_keypair, KeyKind};
    use ring::rand::SystemRandom;
    use tempfile::TempDir;

    #[tokio::test]
    async fn external_signer_round_trip() {
        let dir = TempDir::new().unwrap();
        let device = parse_keypair(generate_keypair(KeyKind::Ed25519).unwrap().as_bytes()).unwrap();
        let source = ExternalKeySource {
            exchange_dir: dir.path().join("exchange"),
            key: device.tuf_key(),
        };
        let rng = SystemRandom::new();
        let signer = source.as_sign().await.unwrap();

        let err = signer.sign(b"timestamp", &rng).await.unwrap_err();
        let err = err.downcast::<Error>().unwrap();
        assert!(matches!(*err, Error::SignaturePending { .. }));

        let requests = SignRequest::pending(&source.exchange_dir).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message, b"timestamp");
        let sig = device.sign(&requests[0].message, &rng).await.unwrap();
        requests[0].respond(&sig).await.unwrap();

        assert!(SignRequest::pending(&source.exchange_dir)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(signer.sign(b"timestamp", &rng).await.unwrap(), sig);
    }
}
