// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Vouch publishes and verifies signed update repositories.
//!
//! A repository is described by four signed metadata documents in the style of
//! [The Update Framework]: `root` names the trusted keys and thresholds, `targets` lists the
//! installable files, `snapshot` pins the current targets version, and `timestamp` points at
//! the current snapshot.
//!
//! * [`publisher::RepositoryPublisher`] builds, signs and writes bundles, and records each one
//!   in a [`transparency::TransparencyLog`].
//! * [`client::ClientVerifier`] checks a target against a repository before installation,
//!   resisting rollback, freeze and mix-and-match attacks.
//! * [`keystore::KeyStore`] holds signing keys, including keys held by external signers.
//!
//! Delegated targets roles are not supported.
//!
//! [The Update Framework]: https://theupdateframework.github.io/
//!
//! # Testing
//!
//! Unit tests are run in the usual manner: `cargo test`.

#![forbid(missing_debug_implementations, missing_copy_implementations)]
#![deny(rust_2018_idioms)]
// missing_docs is on its own line to make it easy to comment out when making changes.
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc
)]

pub mod client;
mod datastore;
pub mod error;
mod fetch;
mod io;
pub mod key_source;
pub mod keystore;
pub mod publisher;
pub mod schema;
pub mod sign;
pub mod signer;
pub mod transparency;
pub mod transport;
mod urlpath;

pub use crate::client::{
    ClientVerifier, ClientVerifierBuilder, Limits, Verdict, VerifiedTarget, Watermarks,
};
pub use crate::keystore::KeyStore;
pub use crate::publisher::{PublishPolicy, RepositoryPublisher, RootBuilder, TargetFile};
pub use crate::signer::MetadataSigner;
pub use crate::transparency::TransparencyLog;
pub use crate::transport::{
    FilesystemTransport, IntoVec, Transport, TransportError, TransportErrorKind,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Letters, digits and `_.-~` pass through unescaped; every other byte is percent-encoded.
const CHARACTERS_TO_ESCAPE: AsciiSet = NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~');

/// Percent encode a target name so it is a single, safe path component. Target files are stored
/// and fetched under this name, and verified targets are written under it.
pub fn encode_filename<S: AsRef<str>>(name: S) -> String {
    utf8_percent_encode(name.as_ref(), &CHARACTERS_TO_ESCAPE).to_string()
}
