// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contains the error type for this library.

#![allow(clippy::default_trait_access)]

use crate::schema::{HashAlgorithm, RoleType};
use crate::sign::KeyKind;
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_plain::derive_display_from_serialize;
use snafu::{Backtrace, Snafu};
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for this library.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum Error {
    /// The base URL of a repository was given without a trailing slash.
    #[snafu(display("Base URL {} is missing trailing slash", url))]
    BaseUrlMissingTrailingSlash { url: Url, backtrace: Backtrace },

    #[snafu(display("Failed to create datastore: {}", source))]
    DatastoreInit {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to open {} from datastore: {}", path.display(), source))]
    DatastoreOpen {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to serialize {} to JSON at {}: {}", what, path.display(), source))]
    DatastoreSerialize {
        what: String,
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    /// A signature returned by an external signer does not verify against its public key.
    #[snafu(display("External signature {} does not verify for key {}", path.display(), key_id))]
    ExternalSignatureInvalid {
        key_id: String,
        path: PathBuf,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
    DirCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// A target download did not finish within the configured timeout.
    #[snafu(display("Download of target '{}' timed out after {:?}", name, timeout))]
    DownloadTimeout {
        name: String,
        timeout: Duration,
        backtrace: Backtrace,
    },

    #[snafu(display("Key ID {} is listed more than once", keyid))]
    DuplicateKeyId { keyid: String, backtrace: Backtrace },

    /// A client observed a bundle that the transparency log never recorded.
    #[snafu(display(
        "Bundle {} for targets version {} does not appear in the transparency log",
        observed,
        targets_version
    ))]
    Equivocation {
        targets_version: u64,
        observed: String,
        backtrace: Backtrace,
    },

    /// Metadata is past its expiration time.
    #[snafu(display("{} metadata expired at {} (now {})", role, expires, now))]
    Expired {
        role: RoleType,
        expires: DateTime<Utc>,
        now: DateTime<Utc>,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to parse {}: {}", path.display(), source))]
    FileParseJson {
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to move file into place at {}: {}", path.display(), source.error))]
    FilePersist {
        path: PathBuf,
        source: tempfile::PersistError,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to remove {}: {}", path.display(), source))]
    FileRemove {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create temporary file in {}: {}", path.display(), source))]
    FileTempCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to write to {}: {}", path.display(), source))]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// Fetched metadata did not match the hash recorded by the role that references it.
    #[snafu(display(
        "Hash mismatch for {}: calculated {}, expected {}",
        context,
        calculated,
        expected,
    ))]
    HashMismatch {
        context: String,
        calculated: String,
        expected: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid hex string: {}", source))]
    HexDecode {
        source: hex::FromHexError,
        backtrace: Backtrace,
    },

    #[snafu(display("Key ID {} does not match calculated key ID {}", keyid, calculated))]
    InvalidKeyId {
        keyid: String,
        calculated: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Target name '{}' is not allowed: {}", name, reason))]
    InvalidTargetName {
        name: String,
        reason: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to serialize {} to JSON: {}", what, source))]
    JsonSerialization {
        what: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to join \"{}\" to URL \"{}\": {}", path, url, source))]
    JoinUrl {
        path: String,
        url: Url,
        source: url::ParseError,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to generate {:?} key pair", key_kind))]
    KeyGenerate {
        key_kind: KeyKind,
        backtrace: Backtrace,
    },

    /// The key store holds no key with this ID.
    #[snafu(display("Key {} not found in key store", key_id))]
    KeyNotFound { key_id: String, backtrace: Backtrace },

    #[snafu(display("Key rejected: {}", source))]
    KeyRejected {
        source: ring::error::KeyRejected,
        backtrace: Backtrace,
    },

    /// A role could not collect enough signatures to publish. Progress is saved at `pending`.
    #[snafu(display(
        "Only {} of {} required {} signatures available; publish saved at {}",
        valid,
        threshold,
        role,
        pending.display()
    ))]
    KeyUnavailable {
        role: RoleType,
        valid: u64,
        threshold: NonZeroU64,
        pending: PathBuf,
        backtrace: Backtrace,
    },

    #[snafu(display("Unable to recognize key format"))]
    KeyUnrecognized { backtrace: Backtrace },

    /// The transparency log chain does not verify.
    #[snafu(display("Transparency log chain broken at entry {}: {}", sequence_no, reason))]
    LogChainBroken {
        sequence_no: u64,
        reason: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to parse transparency log {} line {}: {}", path.display(), line, source))]
    LogParse {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Transparency log expected sequence number {}, got {}", expected, given))]
    LogSequence {
        expected: u64,
        given: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to append to transparency log {}: {}", path.display(), source))]
    LogWrite {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Maximum size {} (specified by {}) exceeded", max_size, specifier))]
    MaxSizeExceeded {
        max_size: u64,
        specifier: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Meta for {:?} missing from {} metadata", file, role))]
    MetaMissing {
        file: &'static str,
        role: RoleType,
        backtrace: Backtrace,
    },

    #[snafu(display("No pending publish found at {}", path.display()))]
    NoPendingPublish { path: PathBuf, backtrace: Backtrace },

    #[snafu(display("Repository at {} has not published any targets yet", path.display()))]
    NothingPublished { path: PathBuf, backtrace: Backtrace },

    #[snafu(display("Role {} is not defined in root metadata", role))]
    NoRoleKeysInRoot { role: RoleType, backtrace: Backtrace },

    #[snafu(display("Repository at {} has no root metadata; bootstrap it first", path.display()))]
    NotBootstrapped { path: PathBuf, backtrace: Backtrace },

    #[snafu(display("Repository at {} already has root metadata", path.display()))]
    AlreadyBootstrapped { path: PathBuf, backtrace: Backtrace },

    #[snafu(display("Failed to parse {} metadata: {}", role, source))]
    ParseMetadata {
        role: RoleType,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to parse trusted root metadata: {}", source))]
    ParseTrustedMetadata {
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to parse PEM: {}", source))]
    PemParse {
        source: pem::PemError,
        backtrace: Backtrace,
    },

    #[snafu(display("A publish is already awaiting signatures at {}", path.display()))]
    PublishPending { path: PathBuf, backtrace: Backtrace },

    /// Signed metadata is never replaced by different bytes under the same versioned name.
    #[snafu(display("{} already exists with different contents", path.display()))]
    MetadataExists { path: PathBuf, backtrace: Backtrace },

    /// A publish was prepared against a repository that has moved on since.
    #[snafu(display(
        "{} version {} does not follow published version {}; abandon and publish again",
        role,
        version,
        published
    ))]
    StalePublish {
        role: RoleType,
        version: NonZeroU64,
        published: u64,
        backtrace: Backtrace,
    },

    /// Walking the root chain forward failed.
    #[snafu(display("Root rotation to version {} failed: {}", version, source))]
    RootRotationFailed {
        version: u64,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("Exceeded maximum of {} root updates", max_root_updates))]
    RootUpdateLimit {
        max_root_updates: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("Expected root version {}, fetched {}", expected, fetched))]
    RootVersionSkip {
        expected: u64,
        fetched: NonZeroU64,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to sign message"))]
    Sign {
        source: ring::error::Unspecified,
        backtrace: Backtrace,
    },

    /// A signature from an authorized key did not validate and the threshold was not reached.
    #[snafu(display("Invalid {} signature from key {}", role, key_id))]
    SignatureInvalid {
        role: RoleType,
        key_id: String,
        backtrace: Backtrace,
    },

    /// An external signer has not produced the signature yet.
    #[snafu(display(
        "Signature by key {} is pending; request written to {}",
        key_id,
        request.display()
    ))]
    SignaturePending {
        key_id: String,
        request: PathBuf,
        backtrace: Backtrace,
    },

    /// The key's backing material could not sign right now.
    #[snafu(display("Signing with key {} is unavailable: {}", key_id, source))]
    SigningUnavailable {
        key_id: String,
        source: Box<dyn std::error::Error + Send + Sync>,
        backtrace: Backtrace,
    },

    #[snafu(display("Signing with key {} timed out after {:?}", key_id, timeout))]
    SigningTimeout {
        key_id: String,
        timeout: Duration,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "{} metadata has unsupported spec version {} (supported: {})",
        role,
        given,
        supported
    ))]
    SpecVersion {
        role: RoleType,
        given: String,
        supported: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "System time stepped backward: system time '{}', last known time '{}'",
        sys_time,
        latest_known_time,
    ))]
    SystemTimeSteppedBackward {
        sys_time: DateTime<Utc>,
        latest_known_time: DateTime<Utc>,
        backtrace: Backtrace,
    },

    /// A downloaded target's digest did not match the signed targets metadata.
    #[snafu(display(
        "Target '{}' {} mismatch: calculated {}, expected {}",
        name,
        algorithm,
        calculated,
        expected
    ))]
    TargetHashMismatch {
        name: String,
        algorithm: HashAlgorithm,
        calculated: String,
        expected: String,
        backtrace: Backtrace,
    },

    /// A downloaded target's length did not match the signed targets metadata.
    #[snafu(display(
        "Target '{}' length mismatch: measured {} bytes, expected {}",
        name,
        measured,
        expected
    ))]
    TargetLengthMismatch {
        name: String,
        measured: u64,
        expected: u64,
        backtrace: Backtrace,
    },

    /// Fewer distinct valid signatures than the role requires.
    #[snafu(display(
        "{} signature threshold not met: {} valid, {} required",
        role,
        valid,
        threshold
    ))]
    ThresholdNotMet {
        role: RoleType,
        valid: u64,
        threshold: NonZeroU64,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to fetch {}: {}", url, source))]
    Transport {
        url: Url,
        source: TransportError,
        backtrace: Backtrace,
    },

    /// The requested target is not listed in targets metadata.
    #[snafu(display("Target '{}' not found in targets metadata", name))]
    UnknownTarget { name: String, backtrace: Backtrace },

    #[snafu(display(
        "Role {} threshold {} cannot be met by its {} listed keys",
        role,
        threshold,
        keys
    ))]
    UnsatisfiableThreshold {
        role: RoleType,
        threshold: NonZeroU64,
        keys: usize,
        backtrace: Backtrace,
    },

    /// A document's version disagrees with the version its referencing role recorded.
    #[snafu(display(
        "{} version mismatch: fetched {}, expected {}",
        role,
        fetched,
        expected
    ))]
    VersionMismatch {
        role: RoleType,
        fetched: NonZeroU64,
        expected: NonZeroU64,
        backtrace: Backtrace,
    },

    #[snafu(display("{} version overflowed", role))]
    VersionOverflow { role: RoleType, backtrace: Backtrace },

    /// A fetched document is older than the newest version this client already accepted.
    #[snafu(display(
        "Found version {} of {} metadata when we had previously fetched version {}",
        fetched,
        role,
        trusted
    ))]
    VersionRollback {
        role: RoleType,
        trusted: u64,
        fetched: NonZeroU64,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to walk directory tree '{}': {}", directory.display(), source))]
    WalkDir {
        directory: PathBuf,
        source: walkdir::Error,
        backtrace: Backtrace,
    },
}

/// The failure taxonomy that callers act upon. Every [`Error`] maps onto exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// A signature from an authorized key failed to validate.
    SignatureInvalid,
    /// Too few distinct valid signatures.
    ThresholdNotMet,
    /// Metadata older than the client's watermark.
    VersionRollback,
    /// Metadata past its expiry.
    Expired,
    /// Timestamp/snapshot/targets versions or hashes disagree.
    ConsistencyMismatch,
    /// The requested target is not listed.
    UnknownTarget,
    /// A target's bytes do not match its signed length or hashes.
    TargetHashMismatch,
    /// Signing keys are unknown, offline, pending or timed out.
    KeyUnavailable,
    /// Walking the root chain forward failed.
    RootRotationFailed,
    /// The transparency log does not verify.
    LogChainBroken,
    /// I/O, parsing, transport and configuration failures.
    Other,
}

derive_display_from_serialize!(ErrorKind);

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SignatureInvalid { .. } | Error::ExternalSignatureInvalid { .. } => {
                ErrorKind::SignatureInvalid
            }
            Error::ThresholdNotMet { .. } => ErrorKind::ThresholdNotMet,
            Error::VersionRollback { .. } => ErrorKind::VersionRollback,
            Error::Expired { .. } => ErrorKind::Expired,
            Error::VersionMismatch { .. }
            | Error::HashMismatch { .. }
            | Error::MetaMissing { .. }
            | Error::Equivocation { .. } => ErrorKind::ConsistencyMismatch,
            Error::UnknownTarget { .. } => ErrorKind::UnknownTarget,
            Error::TargetHashMismatch { .. } | Error::TargetLengthMismatch { .. } => {
                ErrorKind::TargetHashMismatch
            }
            Error::KeyNotFound { .. }
            | Error::KeyUnavailable { .. }
            | Error::SignaturePending { .. }
            | Error::SigningUnavailable { .. }
            | Error::SigningTimeout { .. } => ErrorKind::KeyUnavailable,
            Error::RootRotationFailed { .. } | Error::RootUpdateLimit { .. } => {
                ErrorKind::RootRotationFailed
            }
            Error::LogChainBroken { .. } => ErrorKind::LogChainBroken,
            Error::Transport { source, .. } => source
                .cause()
                .and_then(|e| e.downcast_ref::<Error>())
                .map_or(ErrorKind::Other, Error::kind),
            _ => ErrorKind::Other,
        }
    }

    /// A short, stable rejection reason suitable for reporting to an installer.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::VersionMismatch {
                role: RoleType::Snapshot,
                ..
            } => "snapshot-timestamp-mismatch",
            Error::VersionMismatch {
                role: RoleType::Targets,
                ..
            } => "targets-snapshot-mismatch",
            _ => match self.kind() {
                ErrorKind::SignatureInvalid => "signature-invalid",
                ErrorKind::ThresholdNotMet => "threshold-not-met",
                ErrorKind::VersionRollback => "version-rollback",
                ErrorKind::Expired => "expired",
                ErrorKind::ConsistencyMismatch => "consistency-mismatch",
                ErrorKind::UnknownTarget => "unknown-target",
                ErrorKind::TargetHashMismatch => "target-hash-mismatch",
                ErrorKind::KeyUnavailable => "key-unavailable",
                ErrorKind::RootRotationFailed => "root-rotation-failed",
                ErrorKind::LogChainBroken => "log-chain-broken",
                ErrorKind::Other => "other",
            },
        }
    }
}
