// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::datastore::Datastore;
use crate::error::{self, Result};
use crate::schema::{Role, RoleType, Root, Signed};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};

/// The highest version of each role a client has ever accepted. Fetched metadata older than its
/// watermark is a rollback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Watermarks {
    /// Highest accepted timestamp version.
    pub timestamp: u64,
    /// Highest accepted snapshot version.
    pub snapshot: u64,
    /// Highest accepted targets version.
    pub targets: u64,
}

impl Watermarks {
    /// The watermark for `role`. Root versions are tracked by the trusted root itself.
    pub fn get(&self, role: RoleType) -> u64 {
        match role {
            RoleType::Root => 0,
            RoleType::Timestamp => self.timestamp,
            RoleType::Snapshot => self.snapshot,
            RoleType::Targets => self.targets,
        }
    }

    /// Fails with `VersionRollback` if `document` is older than its role's watermark.
    pub(crate) fn check<T: Role>(&self, document: &T) -> Result<()> {
        let trusted = self.get(T::TYPE);
        ensure!(
            document.version().get() >= trusted,
            error::VersionRollbackSnafu {
                role: T::TYPE,
                trusted,
                fetched: document.version(),
            }
        );
        Ok(())
    }

    /// Raises the watermark for `document`'s role to its version.
    pub(crate) fn advance<T: Role>(&mut self, document: &T) {
        let version = document.version().get();
        let mark = match T::TYPE {
            RoleType::Root => return,
            RoleType::Timestamp => &mut self.timestamp,
            RoleType::Snapshot => &mut self.snapshot,
            RoleType::Targets => &mut self.targets,
        };
        *mark = (*mark).max(version);
    }

    /// Forgets the timestamp and snapshot watermarks after their keys were rotated, so a
    /// repository recovering from a fast-forward attack can publish lower versions again.
    pub(crate) fn reset_fast_forward(&mut self) {
        self.timestamp = 0;
        self.snapshot = 0;
    }
}

/// Everything a client trusts between runs, persisted as one file so it is replaced atomically.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct TrustStore {
    pub(crate) root: Signed<Root>,
    pub(crate) watermarks: Watermarks,
}

impl TrustStore {
    const FILE: &'static str = "trust.json";

    pub(crate) async fn load(datastore: &Datastore) -> Result<Option<Self>> {
        datastore
            .bytes(Self::FILE)
            .await?
            .map(|bytes| {
                serde_json::from_slice(&bytes).context(error::ParseTrustedMetadataSnafu)
            })
            .transpose()
    }

    pub(crate) async fn save(&self, datastore: &Datastore) -> Result<()> {
        datastore.create(Self::FILE, self).await
    }
}
