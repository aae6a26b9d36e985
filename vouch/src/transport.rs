// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the `Transport` trait, which abstracts over how repository files are fetched, and
//! `FilesystemTransport` for repositories on local disk.

use crate::urlpath::SafeUrlPath;
use async_trait::async_trait;
use bytes::Bytes;
use dyn_clone::DynClone;
use futures::{StreamExt, TryStreamExt};
use futures_core::stream::BoxStream;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio_util::io::ReaderStream;
use url::Url;

/// A stream of file contents as returned by [`Transport::fetch`].
pub type TransportStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Fallible byte streams that collect into a `Vec<u8>`.
#[async_trait]
pub trait IntoVec<E> {
    /// Reads the whole stream into a `Vec<u8>`.
    async fn into_vec(self) -> Result<Vec<u8>, E>;
}

#[async_trait]
impl<S: futures_core::Stream<Item = Result<Bytes, E>> + Send, E: Send> IntoVec<E> for S {
    async fn into_vec(self) -> Result<Vec<u8>, E> {
        self.try_fold(Vec::new(), |mut acc, bytes| {
            acc.extend(bytes.as_ref());
            std::future::ready(Ok(acc))
        })
        .await
    }
}

/// A trait to abstract over the method/protocol by which repository files are obtained.
///
/// The client verifier never trusts the transport: everything fetched through it is checked
/// against signed metadata before use.
#[async_trait]
pub trait Transport: Debug + DynClone + Send + Sync {
    /// Opens a stream over the file specified by `url`.
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError>;
}

// Implement `Clone` for `Transport` trait objects.
dyn_clone::clone_trait_object!(Transport);

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The kind of error that the transport object experienced during `fetch`.
///
/// Walking the root chain needs to tell "version N+1 does not exist" apart from every other
/// failure, so a missing file is reported as `TransportErrorKind::FileNotFound`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportErrorKind {
    /// The trait does not handle the URL scheme, e.g. `file://` or `http://`.
    UnsupportedUrlScheme,
    /// The file cannot be found.
    FileNotFound,
    /// The transport failed for any other reason, e.g. IO error, broken pipe, etc.
    Other,
}

impl Display for TransportErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                TransportErrorKind::UnsupportedUrlScheme => "unsupported URL scheme",
                TransportErrorKind::FileNotFound => "file not found",
                TransportErrorKind::Other => "other",
            }
        )
    }
}

/// The error type that [`Transport::fetch`] returns.
#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    url: String,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(e) = self.source.as_ref() {
            write!(
                f,
                "Transport '{}' error fetching '{}': {}",
                self.kind, self.url, e
            )
        } else {
            write!(f, "Transport '{}' error fetching '{}'", self.kind, self.url)
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn Error))
    }
}

impl TransportError {
    /// Creates a new [`TransportError`]. Use this when there is no underlying error to wrap.
    pub fn new<S>(kind: TransportErrorKind, url: S) -> Self
    where
        S: AsRef<str>,
    {
        Self {
            kind,
            url: url.as_ref().into(),
            source: None,
        }
    }

    /// Creates a new [`TransportError`] that wraps an underlying error.
    pub fn new_with_cause<S, E>(kind: TransportErrorKind, url: S, source: E) -> Self
    where
        S: AsRef<str>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            kind,
            url: url.as_ref().into(),
            source: Some(source.into()),
        }
    }

    /// The type of [`TransportError`].
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// The URL that [`Transport::fetch`] was trying to fetch.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// The wrapped error, if any.
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Provides a [`Transport`] for local files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemTransport;

impl FilesystemTransport {
    async fn open(
        file_path: PathBuf,
    ) -> Result<impl futures_core::Stream<Item = std::io::Result<Bytes>> + Send, std::io::Error>
    {
        let f = tokio::fs::File::open(file_path).await?;
        Ok(ReaderStream::new(f))
    }
}

#[async_trait]
impl Transport for FilesystemTransport {
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError> {
        if url.scheme() != "file" {
            return Err(TransportError::new(
                TransportErrorKind::UnsupportedUrlScheme,
                url,
            ));
        }

        let file_path = url.safe_url_filepath();
        let stream = Self::open(file_path).await.map_err(|e| {
            let kind = match e.kind() {
                ErrorKind::NotFound => TransportErrorKind::FileNotFound,
                _ => TransportErrorKind::Other,
            };
            TransportError::new_with_cause(kind, url.as_str(), e)
        })?;

        let url = url.to_string();
        Ok(stream
            .map_err(move |e| TransportError::new_with_cause(TransportErrorKind::Other, &url, e))
            .boxed())
    }
}
