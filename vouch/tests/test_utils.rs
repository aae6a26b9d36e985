// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use url::Url;
use vouch::publisher::SignedRole;
use vouch::schema::{Hashes, Role, Snapshot, SnapshotMeta, Timestamp, TimestampMeta};
use vouch::sign::KeyKind;
use vouch::{
    ClientVerifier, ClientVerifierBuilder, KeyStore, MetadataSigner, PublishPolicy,
    RepositoryPublisher, RootBuilder,
};

/// Utilities for tests. Not every test module uses every function, so we suppress unused warnings.

/// Converts a filepath into a URI formatted string
#[allow(unused)]
pub fn dir_url<P: AsRef<Path>>(path: P) -> Url {
    Url::from_directory_path(path).unwrap()
}

/// Bootstraps a repository under `dir/repo` with one Ed25519 key, stored in `dir/keys`, for
/// every role.
#[allow(unused)]
pub async fn bootstrap(dir: &Path, consistent_snapshot: bool) -> RepositoryPublisher {
    bootstrap_with(dir, consistent_snapshot, PublishPolicy::default()).await
}

#[allow(unused)]
pub async fn bootstrap_with(
    dir: &Path,
    consistent_snapshot: bool,
    policy: PublishPolicy,
) -> RepositoryPublisher {
    let mut keystore = KeyStore::new(dir.join("keys"));
    let (_, key) = keystore.generate(KeyKind::Ed25519).await.unwrap();
    let mut builder = RootBuilder::new();
    builder.add_key(key, &vouch::schema::RoleType::ALL).unwrap();
    builder.consistent_snapshot(consistent_snapshot);
    RepositoryPublisher::bootstrap(dir.join("repo"), keystore, builder.build().unwrap(), policy)
        .await
        .unwrap()
}

/// The bytes of `N.root.json`, as a device would have them pinned.
#[allow(unused)]
pub fn pinned_root(publisher: &RepositoryPublisher, version: u64) -> Vec<u8> {
    std::fs::read(publisher.metadata_dir().join(format!("{version}.root.json"))).unwrap()
}

/// A verifier pinned to root version 1 that keeps its trusted state in `datastore`.
#[allow(unused)]
pub fn verifier(publisher: &RepositoryPublisher, datastore: &Path) -> ClientVerifier {
    ClientVerifierBuilder::new(
        pinned_root(publisher, 1),
        dir_url(publisher.metadata_dir()),
        dir_url(publisher.targets_dir()),
    )
    .datastore(datastore)
    .build()
    .unwrap()
}

/// Signs `role` with every key the root in force assigns to its role type.
#[allow(unused)]
pub async fn sign_role<T>(publisher: &RepositoryPublisher, role: T) -> SignedRole<T>
where
    T: Role + DeserializeOwned,
{
    let root = publisher.root().await;
    let key_ids = root.signed.role_keys(T::TYPE).unwrap().keyids.clone();
    let signed = MetadataSigner::new(publisher.keystore())
        .sign_document(role, &key_ids)
        .await
        .unwrap();
    SignedRole::from_signed(signed).unwrap()
}

/// Writes a validly signed `snapshot.json` that lists `targets` (the exact bytes served as
/// `targets.json`) under `claimed_targets_version`. Returns the bytes written.
#[allow(unused)]
pub async fn serve_snapshot(
    publisher: &RepositoryPublisher,
    version: u64,
    targets: &[u8],
    claimed_targets_version: u64,
) -> Vec<u8> {
    let mut snapshot = Snapshot::new(
        NonZeroU64::new(version).unwrap(),
        chrono::Utc::now() + chrono::TimeDelta::days(1),
    );
    snapshot.meta.insert(
        Snapshot::TARGETS_META.to_string(),
        SnapshotMeta {
            length: Some(targets.len() as u64),
            hashes: Some(Hashes::from_bytes(targets)),
            version: NonZeroU64::new(claimed_targets_version).unwrap(),
            _extra: HashMap::new(),
        },
    );
    let snapshot = sign_role(publisher, snapshot).await;
    snapshot.write(publisher.metadata_dir(), false).unwrap();
    snapshot.buffer().to_vec()
}

/// Writes a validly signed `timestamp.json` that lists `snapshot` (the exact bytes served as
/// `snapshot.json`) under `claimed_snapshot_version`.
#[allow(unused)]
pub async fn serve_timestamp(
    publisher: &RepositoryPublisher,
    version: u64,
    snapshot: &[u8],
    claimed_snapshot_version: u64,
) {
    let mut timestamp = Timestamp::new(
        NonZeroU64::new(version).unwrap(),
        chrono::Utc::now() + chrono::TimeDelta::days(1),
    );
    timestamp.meta.insert(
        Timestamp::SNAPSHOT_META.to_string(),
        TimestampMeta {
            length: snapshot.len() as u64,
            hashes: Hashes::from_bytes(snapshot),
            version: NonZeroU64::new(claimed_snapshot_version).unwrap(),
            _extra: HashMap::new(),
        },
    );
    let timestamp = sign_role(publisher, timestamp).await;
    timestamp.write(publisher.metadata_dir(), false).unwrap();
}

/// Where a verified target lands in `outdir`.
#[allow(unused)]
pub fn output_path(outdir: &Path, name: &str) -> PathBuf {
    outdir.join(vouch::encode_filename(name))
}
