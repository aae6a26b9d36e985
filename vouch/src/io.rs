// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::{self, Result};
use crate::schema::{HashAlgorithm, Hashes};
use crate::transport::{TransportError, TransportErrorKind, TransportStream};
use futures::StreamExt;
use futures_core::Stream;
use ring::digest::Context;
use snafu::{ensure, ResultExt};
use std::io::Write;
use std::path::Path;
use std::{convert::TryInto, task::Poll};
use tempfile::NamedTempFile;
use url::Url;

/// Checks every digest in a [`Hashes`] once the wrapped stream ends.
pub(crate) struct DigestAdapter {
    url: Url,
    stream: TransportStream,
    expected: Vec<(HashAlgorithm, Vec<u8>, Context)>,
}

impl DigestAdapter {
    pub(crate) fn new(stream: TransportStream, hashes: &Hashes, url: Url) -> TransportStream {
        Self {
            url,
            stream,
            expected: hashes
                .iter()
                .map(|(algorithm, digest)| (algorithm, digest.to_vec(), algorithm.context()))
                .collect(),
        }
        .boxed()
    }
}

impl Stream for DigestAdapter {
    type Item = <TransportStream as Stream>::Item;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let poll = self.stream.as_mut().poll_next(cx);
        match &poll {
            Poll::Ready(Some(Ok(bytes))) => {
                for (_, _, context) in &mut self.expected {
                    context.update(bytes);
                }
            }
            Poll::Ready(None) => {
                for (algorithm, expected, context) in std::mem::take(&mut self.expected) {
                    let calculated = context.finish();
                    if calculated.as_ref() != expected.as_slice() {
                        let mismatch_err = error::HashMismatchSnafu {
                            context: format!("{} of {}", algorithm, self.url),
                            calculated: hex::encode(calculated),
                            expected: hex::encode(&expected),
                        }
                        .build();
                        return Poll::Ready(Some(Err(TransportError::new_with_cause(
                            TransportErrorKind::Other,
                            self.url.clone(),
                            mismatch_err,
                        ))));
                    }
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Pending => (),
        };

        poll
    }
}

/// Create a new stream from `stream`. The new stream returns an error for the item that exceeds the
/// total byte count of `max_size`.
/// * `stream` - The original stream.
/// * `max_size` - Size limit in bytes.
/// * `specifier` - Names the limit in the error message.
pub(crate) fn max_size_adapter(
    stream: TransportStream,
    url: Url,
    max_size: u64,
    specifier: &'static str,
) -> TransportStream {
    let mut size: u64 = 0;
    let stream = stream.map(move |chunk| {
        if let Ok(bytes) = &chunk {
            size = size.saturating_add(bytes.len().try_into().unwrap_or(u64::MAX));
        }
        if size > max_size {
            let size_err = error::MaxSizeExceededSnafu {
                max_size,
                specifier,
            }
            .build();
            return Err(TransportError::new_with_cause(
                TransportErrorKind::Other,
                url.clone(),
                size_err,
            ));
        }
        chunk
    });

    stream.boxed()
}

/// A synced temporary file holding `data`, in the directory `path` will be persisted to.
fn synced_temp(path: &Path, data: &[u8]) -> Result<NamedTempFile> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).context(error::DirCreateSnafu { path: dir })?;
    let mut tmp = NamedTempFile::new_in(dir).context(error::FileTempCreateSnafu { path: dir })?;
    tmp.write_all(data)
        .and_then(|()| tmp.as_file().sync_all())
        .context(error::FileWriteSnafu { path: tmp.path() })?;
    Ok(tmp)
}

/// Replaces `path` with `data` through a synced temporary file in the same directory, so readers
/// see the old contents or the new, never a mix.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    synced_temp(path, data)?
        .persist(path)
        .context(error::FilePersistSnafu { path })?;
    Ok(())
}

/// Creates `path` with `data`, refusing to replace an existing file. A file that already holds
/// exactly `data` is accepted, so an interrupted commit can be repeated.
pub(crate) fn write_new(path: &Path, data: &[u8]) -> Result<()> {
    match synced_temp(path, data)?.persist_noclobber(path) {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            let existing = std::fs::read(path).context(error::FileReadSnafu { path })?;
            ensure!(existing == data, error::MetadataExistsSnafu { path });
            Ok(())
        }
        Err(e) => Err(e).context(error::FilePersistSnafu { path }),
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{Error, ErrorKind};
    use crate::io::{max_size_adapter, DigestAdapter};
    use crate::schema::Hashes;
    use crate::transport::IntoVec;
    use bytes::Bytes;
    use futures::{stream, StreamExt};
    use hex_literal::hex;
    use std::collections::HashMap;
    use url::Url;

    fn hello() -> crate::transport::TransportStream {
        stream::iter("hello".as_bytes().chunks(2).map(Bytes::from).map(Ok)).boxed()
    }

    #[tokio::test]
    async fn test_max_size_adapter() {
        let url = Url::parse("file:///").unwrap();

        let stream = max_size_adapter(hello(), url.clone(), 5, "test");
        let buf = stream.into_vec().await.expect("consuming entire stream");
        assert_eq!(buf, b"hello");

        let stream = max_size_adapter(hello(), url, 4, "test");
        assert!(stream.into_vec().await.is_err());
    }

    #[tokio::test]
    async fn test_digest_adapter() {
        let url = Url::parse("file:///").unwrap();
        let stream = DigestAdapter::new(hello(), &Hashes::from_bytes(b"hello"), url.clone());
        let buf = stream.into_vec().await.expect("consuming entire stream");
        assert_eq!(buf, b"hello");

        let wrong = Hashes {
            sha256: hex!("0ebdc3317b75839f643387d783535adc360ca01f33c75f7c1e7373adcd675c0b")
                .to_vec()
                .into(),
            sha512: None,
            _extra: HashMap::new(),
        };
        let err = DigestAdapter::new(hello(), &wrong, url)
            .into_vec()
            .await
            .unwrap_err();
        let inner = err.cause().unwrap().downcast_ref::<Error>().unwrap();
        assert_eq!(inner.kind(), ErrorKind::ConsistencyMismatch);
    }

    #[test]
    fn atomic_write_replaces() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("trust.json");
        super::write_atomic(&path, b"one").unwrap();
        super::write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn versioned_write_never_replaces_different_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("2.targets.json");
        super::write_new(&path, b"first").unwrap();
        super::write_new(&path, b"first").unwrap();

        let err = super::write_new(&path, b"second").unwrap_err();
        assert!(matches!(err, Error::MetadataExists { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn every_digest_is_checked() {
        let mut hashes = Hashes::from_bytes(b"hello");
        hashes.sha512 = Some(Hashes::from_bytes(b"jello").sha512.unwrap());
        let stream = DigestAdapter::new(hello(), &hashes, Url::parse("file:///").unwrap());
        assert!(stream.into_vec().await.is_err());
    }
}
