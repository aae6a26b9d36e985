// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides `RootBuilder`, which assembles the root of trust for a new repository or for the
//! next root version.

use super::{default_root_lifetime, round_time};
use crate::error::{self, Result};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use crate::schema::{Root, RoleKeys, RoleType, SPEC_VERSION};
use chrono::{DateTime, Utc};
use snafu::ensure;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;

macro_rules! role_keys {
    ($threshold:expr) => {
        RoleKeys {
            keyids: Vec::new(),
            threshold: $threshold,
            _extra: HashMap::new(),
        }
    };

    () => {
        role_keys!(NonZeroU64::MIN)
    };
}

/// Assembles the root of trust for a bootstrap or a rotation.
///
/// Versions are not set here; the publisher assigns version 1 at bootstrap and the previous
/// version plus one at each rotation.
#[derive(Debug, Clone)]
pub struct RootBuilder {
    root: Root,
    expires: Option<DateTime<Utc>>,
}

impl Default for RootBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RootBuilder {
    /// Starts an empty root: consistent snapshots on, every role present with threshold 1
    /// and no keys.
    pub fn new() -> Self {
        Self {
            root: Root {
                spec_version: SPEC_VERSION.to_owned(),
                consistent_snapshot: true,
                version: NonZeroU64::MIN,
                expires: round_time(Utc::now()),
                keys: HashMap::new(),
                roles: RoleType::ALL
                    .iter()
                    .map(|role| (*role, role_keys!()))
                    .collect(),
                _extra: HashMap::new(),
            },
            expires: None,
        }
    }

    /// Starts from an existing root, typically the one in force, to prepare its successor.
    pub fn from_root(root: Root) -> Self {
        let expires = Some(root.expires);
        Self { root, expires }
    }

    /// Lists `key` and authorizes it for each of `roles`. Returns its key ID.
    pub fn add_key(&mut self, key: Key, roles: &[RoleType]) -> Result<Decoded<Hex>> {
        let key_id = key.key_id()?;
        self.root.keys.insert(key_id.clone(), key);
        for role in roles {
            let role_keys = self.root.roles.entry(*role).or_insert_with(|| role_keys!());
            if !role_keys.authorizes(&key_id) {
                role_keys.keyids.push(key_id.clone());
            }
        }
        Ok(key_id)
    }

    /// Revokes `key_id` from `role`, or from every role and the key list when `role` is `None`.
    pub fn remove_key(&mut self, key_id: &Decoded<Hex>, role: Option<RoleType>) -> &mut Self {
        if let Some(role) = role {
            if let Some(role_keys) = self.root.roles.get_mut(&role) {
                role_keys.keyids.retain(|k| k != key_id);
            }
        } else {
            for role_keys in self.root.roles.values_mut() {
                role_keys.keyids.retain(|k| k != key_id);
            }
            self.root.keys.remove(key_id);
        }
        self
    }

    /// Sets how many distinct signatures `role` requires.
    pub fn threshold(&mut self, role: RoleType, threshold: NonZeroU64) -> &mut Self {
        self.root
            .roles
            .entry(role)
            .and_modify(|rk| rk.threshold = threshold)
            .or_insert_with(|| role_keys!(threshold));
        self
    }

    /// Sets when the root expires. Without this, a new root lives for a year.
    pub fn expires(&mut self, expires: DateTime<Utc>) -> &mut Self {
        self.expires = Some(round_time(expires));
        self
    }

    /// Whether metadata and target file names carry version and digest prefixes.
    pub fn consistent_snapshot(&mut self, consistent_snapshot: bool) -> &mut Self {
        self.root.consistent_snapshot = consistent_snapshot;
        self
    }

    /// Checks that every role is present and can reach its threshold, then returns the root.
    pub fn build(&self) -> Result<Root> {
        let mut root = self.root.clone();
        root.expires = self
            .expires
            .unwrap_or_else(|| round_time(Utc::now() + default_root_lifetime()));
        check_roles(&root)?;
        Ok(root)
    }
}

/// Fails unless all four roles are defined and each threshold is at most the number of distinct
/// keys the root lists for that role.
pub(crate) fn check_roles(root: &Root) -> Result<()> {
    for role in RoleType::ALL {
        let role_keys = root.role_keys(role)?;
        let keys = role_keys
            .keyids
            .iter()
            .filter(|keyid| root.keys.contains_key(keyid))
            .collect::<HashSet<_>>()
            .len();
        ensure!(
            role_keys.threshold.get() <= keys as u64,
            error::UnsatisfiableThresholdSnafu {
                role,
                threshold: role_keys.threshold,
                keys,
            }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sign::{generate_keypair, parse_keypair, KeyKind};

    fn key() -> Key {
        let pem = generate_keypair(KeyKind::Ed25519).unwrap();
        parse_keypair(pem.as_bytes()).unwrap().tuf_key()
    }

    #[test]
    fn one_key_for_every_role() {
        let mut builder = RootBuilder::new();
        let key_id = builder.add_key(key(), &RoleType::ALL).unwrap();
        let root = builder.build().unwrap();
        for role in RoleType::ALL {
            assert_eq!(root.role_keys(role).unwrap().keyids, vec![key_id.clone()]);
        }
        assert!(root.expires > Utc::now());
    }

    #[test]
    fn threshold_above_key_count_is_rejected() {
        let mut builder = RootBuilder::new();
        builder.add_key(key(), &RoleType::ALL).unwrap();
        builder.threshold(RoleType::Targets, NonZeroU64::new(2).unwrap());
        let err = builder.build().unwrap_err();
        assert!(matches!(
            err,
            Error::UnsatisfiableThreshold {
                role: RoleType::Targets,
                keys: 1,
                ..
            }
        ));
    }

    #[test]
    fn removing_a_key_everywhere_drops_it() {
        let mut builder = RootBuilder::new();
        let first = builder.add_key(key(), &RoleType::ALL).unwrap();
        builder.add_key(key(), &RoleType::ALL).unwrap();
        builder.remove_key(&first, Some(RoleType::Timestamp));
        let root = builder.build().unwrap();
        assert!(!root.role_keys(RoleType::Timestamp).unwrap().authorizes(&first));
        assert!(root.role_keys(RoleType::Root).unwrap().authorizes(&first));

        builder.remove_key(&first, None);
        let root = builder.build().unwrap();
        assert!(!root.keys.contains_key(&first));
        assert!(!root.role_keys(RoleType::Root).unwrap().authorizes(&first));
    }

    #[test]
    fn repeated_key_id_counts_once() {
        let mut builder = RootBuilder::new();
        let key_id = builder.add_key(key(), &RoleType::ALL).unwrap();
        let mut root = builder.build().unwrap();
        let targets = root.roles.get_mut(&RoleType::Targets).unwrap();
        targets.keyids.push(key_id);
        targets.threshold = NonZeroU64::new(2).unwrap();

        let err = check_roles(&root).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsatisfiableThreshold {
                role: RoleType::Targets,
                keys: 1,
                ..
            }
        ));
    }

    #[test]
    fn empty_root_is_unsatisfiable() {
        assert!(RootBuilder::new().build().is_err());
    }
}
