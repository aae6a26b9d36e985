// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A publish that is waiting for signatures, saved under `<repo>/pending/` so that it can be
//! completed by a later process.
//!
//! Roles are saved as their exact serialized bytes. Once a role meets its threshold its bytes
//! never change, so the lengths and hashes later roles record for it stay valid across restarts.

use super::signed::SignedRole;
use crate::encode_filename;
use crate::error::{self, Result};
use crate::io::write_atomic;
use crate::schema::{Role, Snapshot, Targets, Timestamp};
use chrono::{DateTime, Utc};
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "state.json";
const TARGETS_DIR: &str = "targets";

/// When the publish started. Snapshot and timestamp documents not yet built when the publish was
/// saved get their versions and expiry times from the repository and clock at resume time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Plan {
    pub(crate) started: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingPublish {
    pub(crate) plan: Plan,
    pub(crate) files: BTreeMap<String, Vec<u8>>,
    pub(crate) targets: SignedRole<Targets>,
    pub(crate) snapshot: Option<SignedRole<Snapshot>>,
    pub(crate) timestamp: Option<SignedRole<Timestamp>>,
}

impl PendingPublish {
    /// Whether a publish is saved in `dir`.
    pub(crate) fn exists(dir: &Path) -> bool {
        dir.join(STATE_FILE).is_file()
    }

    /// Writes the staged target bytes and every role started so far, then the state file last.
    pub(crate) fn save(&self, dir: &Path) -> Result<()> {
        let targets_dir = dir.join(TARGETS_DIR);
        for (name, bytes) in &self.files {
            write_atomic(&targets_dir.join(encode_filename(name)), bytes)?;
        }
        write_role(dir, &self.targets)?;
        if let Some(snapshot) = &self.snapshot {
            write_role(dir, snapshot)?;
        }
        if let Some(timestamp) = &self.timestamp {
            write_role(dir, timestamp)?;
        }

        let path = dir.join(STATE_FILE);
        let state = serde_json::to_vec_pretty(&self.plan).context(error::JsonSerializationSnafu {
            what: "pending publish state",
        })?;
        write_atomic(&path, &state)?;
        debug!("pending publish saved to {}", dir.display());
        Ok(())
    }

    /// Loads the publish saved in `dir`.
    pub(crate) async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(STATE_FILE);
        ensure!(Self::exists(dir), error::NoPendingPublishSnafu { path: dir });
        let state = tokio::fs::read(&path)
            .await
            .context(error::FileReadSnafu { path: &path })?;
        let plan: Plan =
            serde_json::from_slice(&state).context(error::FileParseJsonSnafu { path: &path })?;

        let targets: SignedRole<Targets> = read_role(dir)
            .await?
            .context(error::NoPendingPublishSnafu { path: dir })?;
        let snapshot = read_role(dir).await?;
        let timestamp = read_role(dir).await?;

        let mut files = BTreeMap::new();
        let targets_dir = dir.join(TARGETS_DIR);
        for name in targets.signed.signed.targets.keys() {
            let path = targets_dir.join(encode_filename(name));
            let bytes = tokio::fs::read(&path)
                .await
                .context(error::FileReadSnafu { path: &path })?;
            files.insert(name.clone(), bytes);
        }

        Ok(Self {
            plan,
            files,
            targets,
            snapshot,
            timestamp,
        })
    }

    /// Deletes everything saved in `dir`.
    pub(crate) async fn discard(dir: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(error::FileRemoveSnafu { path: dir }),
        }
    }
}

fn role_path<T: Role>(dir: &Path) -> PathBuf {
    dir.join(format!("{}.json", T::TYPE))
}

fn write_role<T: Role + DeserializeOwned>(dir: &Path, role: &SignedRole<T>) -> Result<()> {
    write_atomic(&role_path::<T>(dir), role.buffer())
}

async fn read_role<T: Role + DeserializeOwned>(dir: &Path) -> Result<Option<SignedRole<T>>> {
    read(&role_path::<T>(dir))
        .await?
        .map(SignedRole::from_buffer)
        .transpose()
}

async fn read(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context(error::FileReadSnafu { path }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Signed, Target};
    use std::num::NonZeroU64;
    use tempfile::TempDir;

    fn pending() -> PendingPublish {
        let expires: DateTime<Utc> = "2030-01-01T00:00:00Z".parse().unwrap();
        let version = NonZeroU64::new(2).unwrap();
        let mut targets = Targets::new(version, expires);
        targets
            .targets
            .insert("fw/update 1.pkg".to_string(), Target::from_bytes(b"payload"));
        PendingPublish {
            plan: Plan { started: expires },
            files: BTreeMap::from([("fw/update 1.pkg".to_string(), b"payload".to_vec())]),
            targets: SignedRole::from_signed(Signed::unsigned(targets)).unwrap(),
            snapshot: None,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn saved_publish_reloads_byte_for_byte() {
        let dir = TempDir::new().unwrap();
        let pending_dir = dir.path().join("pending");
        let saved = pending();
        saved.save(&pending_dir).unwrap();
        assert!(PendingPublish::exists(&pending_dir));

        let loaded = PendingPublish::load(&pending_dir).await.unwrap();
        assert_eq!(loaded.targets.buffer(), saved.targets.buffer());
        assert_eq!(loaded.files, saved.files);
        assert!(loaded.snapshot.is_none());
        assert_eq!(loaded.plan.started, saved.plan.started);

        PendingPublish::discard(&pending_dir).await.unwrap();
        assert!(!PendingPublish::exists(&pending_dir));
        assert!(PendingPublish::load(&pending_dir).await.is_err());
    }
}
