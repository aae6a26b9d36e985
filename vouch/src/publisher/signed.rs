// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the `SignedRepository` object which represents a complete, signed bundle of
//! repository metadata, ready to be written to disk.

use crate::error::{self, Result};
use crate::io::{write_atomic, write_new};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::{
    Hashes, Role, Root, Signed, Snapshot, SnapshotMeta, Targets, Timestamp, TimestampMeta,
};
use crate::transparency::bundle_content_hash;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use std::collections::HashMap;
use std::path::Path;

/// A signed role, including its serialized form (`buffer`) which is meant to
/// be written to file. The `hashes` and `length` are calculated from this
/// buffer and included in metadata for other roles, which makes it
/// imperative that this buffer is what is written to disk.
#[derive(Debug, Clone)]
pub struct SignedRole<T> {
    pub(crate) signed: Signed<T>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) hashes: Hashes,
    pub(crate) length: u64,
}

impl<T> SignedRole<T>
where
    T: Role + DeserializeOwned,
{
    /// Creates a `SignedRole<Role>` from a `Signed<Role>`, serializing it pretty-printed with a
    /// trailing newline.
    pub fn from_signed(role: Signed<T>) -> Result<SignedRole<T>> {
        let mut buffer =
            serde_json::to_vec_pretty(&role).context(error::JsonSerializationSnafu {
                what: format!("signed {} role", T::TYPE),
            })?;
        buffer.push(b'\n');
        Ok(Self::with_buffer(role, buffer))
    }

    /// Parses a role that was written earlier, keeping its exact bytes so lengths and hashes
    /// recorded by other roles still match.
    pub fn from_buffer(buffer: Vec<u8>) -> Result<SignedRole<T>> {
        let role = serde_json::from_slice(&buffer)
            .context(error::ParseMetadataSnafu { role: T::TYPE })?;
        Ok(Self::with_buffer(role, buffer))
    }

    fn with_buffer(signed: Signed<T>, buffer: Vec<u8>) -> Self {
        SignedRole {
            signed,
            hashes: Hashes::from_bytes(&buffer),
            length: buffer.len() as u64,
            buffer,
        }
    }

    /// Provides access to the internal signed metadata object.
    pub fn signed(&self) -> &Signed<T> {
        &self.signed
    }

    /// Provides access to the internal buffer containing the serialized form of the signed role.
    /// This buffer should be used anywhere this role is written to file.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// The SHA-256 and SHA-512 digests of the buffer.
    pub fn hashes(&self) -> &Hashes {
        &self.hashes
    }

    /// Provides the length in bytes of the serialized representation of the signed role.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Write the current role's buffer to the given directory with the
    /// appropriate file name.
    ///
    /// A versioned name (`N.<role>.json`) is written once: different bytes already stored under
    /// it are an error rather than replaced.
    pub fn write<P>(&self, outdir: P, consistent_snapshot: bool) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let filename = self.signed.signed.filename(consistent_snapshot);
        let path = outdir.as_ref().join(&filename);
        if filename == self.signed.signed.filename(false) {
            write_atomic(&path, &self.buffer)
        } else {
            write_new(&path, &self.buffer)
        }
    }

    /// The entry a snapshot records for this role.
    pub(crate) fn snapshot_meta(&self) -> SnapshotMeta {
        SnapshotMeta {
            length: Some(self.length),
            hashes: Some(self.hashes.clone()),
            version: self.signed.signed.version(),
            _extra: HashMap::new(),
        }
    }

    /// The entry a timestamp records for this role.
    pub(crate) fn timestamp_meta(&self) -> TimestampMeta {
        TimestampMeta {
            length: self.length,
            hashes: self.hashes.clone(),
            version: self.signed.signed.version(),
            _extra: HashMap::new(),
        }
    }
}

impl SignedRole<Root> {
    /// Writes `N.root.json` and replaces `root.json`.
    pub(crate) fn write_root<P>(&self, outdir: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let outdir = outdir.as_ref();
        write_new(
            &outdir.join(self.signed.signed.filename(true)),
            &self.buffer,
        )?;
        write_atomic(&outdir.join("root.json"), &self.buffer)
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// A set of signed repository metadata: the root in force plus one targets, snapshot and
/// timestamp bundle.
///
/// Target files are not part of this value; the publisher writes them before any metadata.
#[derive(Debug, Clone)]
pub struct SignedRepository {
    pub(crate) root: SignedRole<Root>,
    pub(crate) targets: SignedRole<Targets>,
    pub(crate) snapshot: SignedRole<Snapshot>,
    pub(crate) timestamp: SignedRole<Timestamp>,
}

impl SignedRepository {
    /// Writes targets, then snapshot, then `timestamp.json` last. Root is written separately
    /// when it changes. Every file is replaced atomically, so until the timestamp is replaced
    /// clients keep seeing the previous bundle.
    pub fn write<P>(&self, outdir: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let consistent_snapshot = self.root.signed.signed.consistent_snapshot;
        self.targets.write(&outdir, consistent_snapshot)?;
        self.snapshot.write(&outdir, consistent_snapshot)?;
        self.timestamp.write(&outdir, consistent_snapshot)?;
        Ok(())
    }

    /// Binds the bundle: SHA-256 over the SHA-256 digests of the root, targets, snapshot and
    /// timestamp files, in that order.
    pub fn content_hash(&self) -> Decoded<Hex> {
        bundle_content_hash(&[
            self.root.buffer(),
            self.targets.buffer(),
            self.snapshot.buffer(),
            self.timestamp.buffer(),
        ])
    }

    /// The root in force when the bundle was signed.
    pub fn root(&self) -> &SignedRole<Root> {
        &self.root
    }

    /// The signed targets.
    pub fn targets(&self) -> &SignedRole<Targets> {
        &self.targets
    }

    /// The signed snapshot.
    pub fn snapshot(&self) -> &SignedRole<Snapshot> {
        &self.snapshot
    }

    /// The signed timestamp.
    pub fn timestamp(&self) -> &SignedRole<Timestamp> {
        &self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU64;
    use tempfile::TempDir;

    fn snapshot() -> Signed<Snapshot> {
        Signed::unsigned(Snapshot::new(
            NonZeroU64::new(3).unwrap(),
            "2030-01-01T00:00:00Z".parse().unwrap(),
        ))
    }

    #[test]
    fn buffer_is_pretty_with_newline() {
        let role = SignedRole::from_signed(snapshot()).unwrap();
        assert!(role.buffer().ends_with(b"}\n"));
        assert_eq!(role.length(), role.buffer().len() as u64);
        assert_eq!(role.hashes(), &Hashes::from_bytes(role.buffer()));
    }

    #[test]
    fn from_buffer_keeps_bytes() {
        let buffer = b"{\"signed\":{\"_type\":\"snapshot\",\"spec_version\":\"1.0.0\",\"version\":3,\
\"expires\":\"2030-01-01T00:00:00Z\",\"meta\":{}},\"signatures\":[]}"
            .to_vec();
        let role = SignedRole::<Snapshot>::from_buffer(buffer.clone()).unwrap();
        assert_eq!(role.buffer(), buffer.as_slice());
        assert_eq!(role.snapshot_meta().version.get(), 3);
    }

    #[test]
    fn write_uses_role_filename() {
        let dir = TempDir::new().unwrap();
        let role = SignedRole::from_signed(snapshot()).unwrap();
        role.write(dir.path(), true).unwrap();
        role.write(dir.path(), false).unwrap();
        assert!(dir.path().join("3.snapshot.json").is_file());
        assert!(dir.path().join("snapshot.json").is_file());
    }

    #[test]
    fn versioned_name_is_written_once() {
        let dir = TempDir::new().unwrap();
        let role = SignedRole::from_signed(snapshot()).unwrap();
        role.write(dir.path(), true).unwrap();

        let mut other = snapshot();
        other.signed.expires = "2031-01-01T00:00:00Z".parse().unwrap();
        let other = SignedRole::from_signed(other).unwrap();
        let err = other.write(dir.path(), true).unwrap_err();
        assert!(matches!(err, crate::error::Error::MetadataExists { .. }));
        assert_eq!(
            std::fs::read(dir.path().join("3.snapshot.json")).unwrap(),
            role.buffer()
        );

        other.write(dir.path(), false).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("snapshot.json")).unwrap(),
            other.buffer()
        );
    }
}
