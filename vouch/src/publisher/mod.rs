// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides a `RepositoryPublisher` for creating a repository and publishing signed bundles of
//! targets, snapshot and timestamp metadata into it.
//!
//! A repository directory looks like this:
//!
//! ```text
//! <repo>/metadata/   N.root.json, root.json, [N.]targets.json, [N.]snapshot.json, timestamp.json
//! <repo>/targets/    [<sha256>.]<encoded target name>
//! <repo>/log.jsonl   the transparency log
//! <repo>/pending/    a publish waiting for signatures, if any
//! ```
//!
//! Every publish either completes, with `timestamp.json` replaced last, or changes nothing under
//! `metadata/` and `targets/`. A publish that cannot collect enough signatures is saved under
//! `pending/` and finished later with [`RepositoryPublisher::resume`].

mod pending;
pub mod root;
pub mod signed;

pub use root::RootBuilder;
pub use signed::{SignedRepository, SignedRole};

use crate::encode_filename;
use crate::error::{self, Error, Result};
use crate::io::write_atomic;
use crate::keystore::KeyStore;
use crate::publisher::pending::{PendingPublish, Plan};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::{
    versioned_filename, Role, RoleType, Root, Signed, Snapshot, Target, Targets, Timestamp,
};
use crate::signer::MetadataSigner;
use crate::transparency::{bundle_content_hash, EntryDraft, EntryKind, TransparencyLog};
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use walkdir::WalkDir;

const METADATA_DIR: &str = "metadata";
const TARGETS_DIR: &str = "targets";
const PENDING_DIR: &str = "pending";
const LOG_FILE: &str = "log.jsonl";
const ROOT_FILE: &str = "root.json";

/// Metadata times are whole seconds.
pub(crate) fn round_time(time: DateTime<Utc>) -> DateTime<Utc> {
    time.trunc_subsecs(0)
}

pub(crate) fn default_root_lifetime() -> TimeDelta {
    TimeDelta::days(365)
}

/// How long each role's metadata stays valid, and who the transparency log names as publisher.
#[derive(Debug, Clone)]
pub struct PublishPolicy {
    /// Lifetime of targets metadata. Default 30 days.
    pub targets_lifetime: TimeDelta,
    /// Lifetime of snapshot metadata. Default 7 days.
    pub snapshot_lifetime: TimeDelta,
    /// Lifetime of timestamp metadata. Default 12 hours.
    pub timestamp_lifetime: TimeDelta,
    /// Lifetime of a root prepared with [`RepositoryPublisher::root_builder`]. Default 365 days.
    pub root_lifetime: TimeDelta,
    /// Recorded in every transparency log entry.
    pub publisher_id: String,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            targets_lifetime: TimeDelta::days(30),
            snapshot_lifetime: TimeDelta::days(7),
            timestamp_lifetime: TimeDelta::hours(12),
            root_lifetime: default_root_lifetime(),
            publisher_id: "vouch".to_string(),
        }
    }
}

impl PublishPolicy {
    /// Sets the targets lifetime.
    #[must_use]
    pub fn with_targets_lifetime(mut self, lifetime: TimeDelta) -> Self {
        self.targets_lifetime = lifetime;
        self
    }

    /// Sets the snapshot lifetime.
    #[must_use]
    pub fn with_snapshot_lifetime(mut self, lifetime: TimeDelta) -> Self {
        self.snapshot_lifetime = lifetime;
        self
    }

    /// Sets the timestamp lifetime. A negative lifetime publishes an already-expired timestamp.
    #[must_use]
    pub fn with_timestamp_lifetime(mut self, lifetime: TimeDelta) -> Self {
        self.timestamp_lifetime = lifetime;
        self
    }

    /// Sets the root lifetime.
    #[must_use]
    pub fn with_root_lifetime(mut self, lifetime: TimeDelta) -> Self {
        self.root_lifetime = lifetime;
        self
    }

    /// Sets the publisher ID recorded in the transparency log.
    #[must_use]
    pub fn with_publisher_id(mut self, publisher_id: impl Into<String>) -> Self {
        self.publisher_id = publisher_id.into();
        self
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// One file to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetFile {
    /// The name clients ask for, e.g. `update-1.2.3.pkg`. May contain `/`.
    pub name: String,
    /// The file contents.
    pub bytes: Vec<u8>,
    /// Signed, opaque data for the installer.
    pub custom: HashMap<String, Value>,
}

impl TargetFile {
    /// A target with no custom data.
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            custom: HashMap::new(),
        }
    }

    /// Adds one custom field.
    #[must_use]
    pub fn with_custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }

    /// Reads every file under `dir`. Names are paths relative to `dir`, joined with `/`.
    pub fn from_dir<P>(dir: P) -> Result<Vec<TargetFile>>
    where
        P: AsRef<Path>,
    {
        let dir = dir.as_ref();
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
            let entry = entry.context(error::WalkDirSnafu { directory: dir })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let mut parts = Vec::new();
            for component in relative.components() {
                let part = component.as_os_str().to_str().context(
                    error::InvalidTargetNameSnafu {
                        name: relative.to_string_lossy(),
                        reason: "not valid UTF-8",
                    },
                )?;
                parts.push(part);
            }
            let bytes = std::fs::read(entry.path()).context(error::FileReadSnafu {
                path: entry.path(),
            })?;
            files.push(TargetFile::new(parts.join("/"), bytes));
        }
        Ok(files)
    }
}

fn check_target_name(name: &str) -> Result<()> {
    let reason = match name {
        "" => Some("empty"),
        "." | ".." => Some("refers to a directory"),
        _ => None,
    };
    match reason {
        Some(reason) => error::InvalidTargetNameSnafu { name, reason }.fail(),
        None => Ok(()),
    }
}

fn next_version(current: Option<NonZeroU64>, role: RoleType) -> Result<NonZeroU64> {
    match current {
        None => Ok(NonZeroU64::MIN),
        Some(version) => version
            .checked_add(1)
            .context(error::VersionOverflowSnafu { role }),
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// How many signatures a role has against how many it needs.
#[derive(Debug, Clone, Copy)]
struct Progress {
    valid: u64,
    threshold: NonZeroU64,
}

impl Progress {
    fn met(self) -> bool {
        self.valid >= self.threshold.get()
    }
}

#[derive(Debug, Clone)]
struct Published {
    targets: SignedRole<Targets>,
    snapshot: SignedRole<Snapshot>,
    timestamp: SignedRole<Timestamp>,
}

#[derive(Debug)]
struct State {
    root: SignedRole<Root>,
    published: Option<Published>,
    log: TransparencyLog,
}

impl State {
    fn repository(&self) -> Option<SignedRepository> {
        self.published.as_ref().map(|published| SignedRepository {
            root: self.root.clone(),
            targets: published.targets.clone(),
            snapshot: published.snapshot.clone(),
            timestamp: published.timestamp.clone(),
        })
    }

    fn targets_version(&self) -> u64 {
        self.published
            .as_ref()
            .map_or(0, |published| published.targets.signed.signed.version.get())
    }
}

/// The single writer for one repository directory.
///
/// Mutating operations take `&self` and queue on an internal lock, so concurrent publishes
/// through one publisher get consecutive versions.
#[derive(Debug)]
pub struct RepositoryPublisher {
    dir: PathBuf,
    keystore: KeyStore,
    policy: PublishPolicy,
    state: Mutex<State>,
}

impl RepositoryPublisher {
    /// Creates a repository in `dir` with `root` as version 1. The root must carry a threshold of
    /// signatures from its own root keys that `keystore` holds.
    pub async fn bootstrap(
        dir: impl Into<PathBuf>,
        keystore: KeyStore,
        mut root: Root,
        policy: PublishPolicy,
    ) -> Result<Self> {
        let dir = dir.into();
        let metadata_dir = dir.join(METADATA_DIR);
        ensure!(
            !metadata_dir.join(ROOT_FILE).exists(),
            error::AlreadyBootstrappedSnafu { path: &dir }
        );

        root.version = NonZeroU64::MIN;
        root::check_roles(&root)?;
        let role_keys = root.role_keys(RoleType::Root)?.clone();
        let keys = root.keys.clone();
        let mut signed = Signed::unsigned(root);
        let valid = MetadataSigner::new(&keystore)
            .add_signatures(&mut signed, &keys, &role_keys)
            .await?;
        ensure!(
            valid >= role_keys.threshold.get(),
            error::ThresholdNotMetSnafu {
                role: RoleType::Root,
                valid,
                threshold: role_keys.threshold,
            }
        );

        let log = TransparencyLog::open(dir.join(LOG_FILE)).await?;
        log.ensure_intact()?;
        let root = SignedRole::from_signed(signed)?;
        root.write_root(&metadata_dir)?;
        info!("bootstrapped repository at {}", dir.display());

        let content_hash = bundle_content_hash(&[root.buffer()]);
        let publisher = Self {
            dir,
            keystore,
            policy,
            state: Mutex::new(State {
                root,
                published: None,
                log,
            }),
        };
        {
            let mut state = publisher.state.lock().await;
            publisher
                .record(&mut state, EntryKind::Bootstrap, content_hash)
                .await?;
        }
        Ok(publisher)
    }

    /// Opens a repository created by [`RepositoryPublisher::bootstrap`], loading the root in force
    /// and the most recently published bundle.
    pub async fn open(
        dir: impl Into<PathBuf>,
        keystore: KeyStore,
        policy: PublishPolicy,
    ) -> Result<Self> {
        let dir = dir.into();
        let (root, published) = load_repository(&dir).await?;

        let log = TransparencyLog::open(dir.join(LOG_FILE)).await?;
        debug!(
            "opened repository at {} (root version {})",
            dir.display(),
            root.signed.signed.version
        );
        Ok(Self {
            dir,
            keystore,
            policy,
            state: Mutex::new(State {
                root,
                published,
                log,
            }),
        })
    }

    /// The repository directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The directory clients fetch metadata from.
    pub fn metadata_dir(&self) -> PathBuf {
        self.dir.join(METADATA_DIR)
    }

    /// The directory clients fetch target files from.
    pub fn targets_dir(&self) -> PathBuf {
        self.dir.join(TARGETS_DIR)
    }

    /// Where a publish waiting for signatures is saved.
    pub fn pending_dir(&self) -> PathBuf {
        self.dir.join(PENDING_DIR)
    }

    /// The transparency log file.
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// The signing keys.
    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    /// The signing keys, for adding or retiring keys between operations.
    pub fn keystore_mut(&mut self) -> &mut KeyStore {
        &mut self.keystore
    }

    /// The root in force.
    pub async fn root(&self) -> Signed<Root> {
        self.state.lock().await.root.signed.clone()
    }

    /// The most recently published bundle, if any.
    pub async fn current(&self) -> Option<SignedRepository> {
        self.state.lock().await.repository()
    }

    /// A builder for the next root, starting from the one in force with a fresh expiry.
    pub async fn root_builder(&self) -> RootBuilder {
        let root = self.state.lock().await.root.signed.signed.clone();
        let mut builder = RootBuilder::from_root(root);
        builder.expires(Utc::now() + self.policy.root_lifetime);
        builder
    }

    /// Publishes `files` as the complete new target set.
    ///
    /// Targets, snapshot and timestamp each get the next version and are signed in that order.
    /// If any of them cannot reach its threshold, the publish is saved under
    /// [`pending_dir`](Self::pending_dir) and this fails with `KeyUnavailable`.
    pub async fn publish(&self, files: Vec<TargetFile>) -> Result<SignedRepository> {
        let mut state = self.state.lock().await;
        self.check_writable(&mut state).await?;

        let now = round_time(Utc::now());
        let targets_version = next_version(
            state
                .published
                .as_ref()
                .map(|p| p.targets.signed.signed.version),
            RoleType::Targets,
        )?;
        let plan = Plan { started: now };

        let mut targets = Targets::new(targets_version, now + self.policy.targets_lifetime);
        let mut staged = BTreeMap::new();
        for file in files {
            check_target_name(&file.name)?;
            ensure!(
                !staged.contains_key(&file.name),
                error::InvalidTargetNameSnafu {
                    name: file.name,
                    reason: "listed more than once",
                }
            );
            let mut target = Target::from_bytes(&file.bytes);
            target.custom = file.custom;
            targets.targets.insert(file.name.clone(), target);
            staged.insert(file.name, file.bytes);
        }
        info!(
            "publishing targets version {} with {} files",
            targets_version,
            staged.len()
        );

        let work = PendingPublish {
            plan,
            files: staged,
            targets: SignedRole::from_signed(Signed::unsigned(targets))?,
            snapshot: None,
            timestamp: None,
        };
        self.finish(&mut state, work).await
    }

    /// Collects the signatures a saved publish is missing and completes it.
    pub async fn resume(&self) -> Result<SignedRepository> {
        let mut state = self.state.lock().await;
        self.reload(&mut state).await?;
        let work = PendingPublish::load(&self.pending_dir()).await?;
        info!(
            "resuming publish of targets version {} started {}",
            work.targets.signed.signed.version, work.plan.started
        );
        self.finish(&mut state, work).await
    }

    /// Discards a saved publish and its staged files.
    pub async fn abandon(&self) -> Result<()> {
        let _state = self.state.lock().await;
        let pending_dir = self.pending_dir();
        ensure!(
            PendingPublish::exists(&pending_dir),
            error::NoPendingPublishSnafu { path: &pending_dir }
        );
        PendingPublish::discard(&pending_dir).await?;
        info!("abandoned pending publish at {}", pending_dir.display());
        Ok(())
    }

    /// Re-signs only the timestamp, with the next version and a fresh expiry, pointing at the
    /// current snapshot.
    pub async fn refresh(&self) -> Result<SignedRepository> {
        let mut state = self.state.lock().await;
        self.check_writable(&mut state).await?;
        let published = state
            .published
            .as_ref()
            .context(error::NothingPublishedSnafu { path: &self.dir })?;

        let now = round_time(Utc::now());
        let version = next_version(
            Some(published.timestamp.signed.signed.version),
            RoleType::Timestamp,
        )?;
        let mut timestamp = Timestamp::new(version, now + self.policy.timestamp_lifetime);
        timestamp.meta.insert(
            Timestamp::SNAPSHOT_META.to_string(),
            published.snapshot.timestamp_meta(),
        );
        let mut timestamp = SignedRole::from_signed(Signed::unsigned(timestamp))?;

        let progress = self
            .collect(&mut timestamp, &state.root.signed.signed)
            .await?;
        ensure!(
            progress.met(),
            error::ThresholdNotMetSnafu {
                role: RoleType::Timestamp,
                valid: progress.valid,
                threshold: progress.threshold,
            }
        );

        let consistent_snapshot = state.root.signed.signed.consistent_snapshot;
        timestamp.write(self.metadata_dir(), consistent_snapshot)?;
        if let Some(published) = state.published.as_mut() {
            published.timestamp = timestamp;
        }
        let repository = state
            .repository()
            .context(error::NothingPublishedSnafu { path: &self.dir })?;
        info!("refreshed timestamp to version {}", version);
        self.record(&mut state, EntryKind::Refresh, repository.content_hash())
            .await?;
        Ok(repository)
    }

    /// Replaces the root with `new_root` as the next version.
    ///
    /// The new root must carry a threshold of signatures from the current root's root keys.
    /// Signatures from the new root's own root keys are added where the key store holds them.
    pub async fn rotate_root(&self, new_root: Root) -> Result<SignedRole<Root>> {
        let mut state = self.state.lock().await;
        self.check_writable(&mut state).await?;

        let current = &state.root.signed.signed;
        let mut root = new_root;
        root.version = next_version(Some(current.version), RoleType::Root)?;
        root::check_roles(&root)?;

        let signer = MetadataSigner::new(&self.keystore);
        let mut signed = Signed::unsigned(root);
        let old_role_keys = current.role_keys(RoleType::Root)?;
        let valid = signer
            .add_signatures(&mut signed, &current.keys, old_role_keys)
            .await?;
        ensure!(
            valid >= old_role_keys.threshold.get(),
            error::ThresholdNotMetSnafu {
                role: RoleType::Root,
                valid,
                threshold: old_role_keys.threshold,
            }
        );

        let new_role_keys = signed.signed.role_keys(RoleType::Root)?.clone();
        let new_keys = signed.signed.keys.clone();
        let new_valid = signer
            .add_signatures(&mut signed, &new_keys, &new_role_keys)
            .await?;
        if new_valid < new_role_keys.threshold.get() {
            warn!(
                "root version {} carries {} of {} signatures from its own root keys",
                signed.signed.version, new_valid, new_role_keys.threshold
            );
        }

        let root = SignedRole::from_signed(signed)?;
        root.write_root(self.metadata_dir())?;
        info!("rotated root to version {}", root.signed.signed.version);
        state.root = root.clone();
        self.record(
            &mut state,
            EntryKind::RootRotation,
            bundle_content_hash(&[root.buffer()]),
        )
        .await?;
        Ok(root)
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Re-reads the transparency log and the published metadata, so changes made on disk since
    /// the last operation are caught, including another publisher on the same directory. Fails if
    /// the log's chain is broken.
    async fn reload(&self, state: &mut State) -> Result<()> {
        state.log = TransparencyLog::open(self.log_path()).await?;
        state.log.ensure_intact()?;
        let (root, published) = load_repository(&self.dir).await?;
        if root.buffer() != state.root.buffer() {
            debug!(
                "root on disk is version {}, had version {}",
                root.signed.signed.version, state.root.signed.signed.version
            );
        }
        state.root = root;
        state.published = published;
        Ok(())
    }

    async fn check_writable(&self, state: &mut State) -> Result<()> {
        self.reload(state).await?;
        let pending_dir = self.pending_dir();
        ensure!(
            !PendingPublish::exists(&pending_dir),
            error::PublishPendingSnafu { path: pending_dir }
        );
        Ok(())
    }

    /// Adds the signatures the key store can make to `role` unless it already meets its
    /// threshold. A role that meets its threshold is left byte for byte as it is.
    async fn collect<T>(&self, role: &mut SignedRole<T>, root: &Root) -> Result<Progress>
    where
        T: Role + DeserializeOwned + Clone,
    {
        let role_keys = root.role_keys(T::TYPE)?;
        let threshold = role_keys.threshold;
        let valid = role.signed.valid_signatures(&root.keys, role_keys)?;
        if valid >= threshold.get() {
            return Ok(Progress { valid, threshold });
        }

        let mut signed = role.signed.clone();
        let valid = MetadataSigner::new(&self.keystore)
            .add_signatures(&mut signed, &root.keys, role_keys)
            .await?;
        *role = SignedRole::from_signed(signed)?;
        debug!("{} has {} of {} signatures", T::TYPE, valid, threshold);
        Ok(Progress { valid, threshold })
    }

    fn require(&self, role: RoleType, progress: Progress) -> Result<()> {
        ensure!(
            progress.met(),
            error::KeyUnavailableSnafu {
                role,
                valid: progress.valid,
                threshold: progress.threshold,
                pending: self.pending_dir(),
            }
        );
        Ok(())
    }

    /// Signs targets, then builds and signs snapshot, then timestamp.
    ///
    /// Every role must be exactly one version past `published`. A snapshot or timestamp not yet
    /// built takes its version from `published` and its expiry from the current time.
    async fn sign_bundle(
        &self,
        root: &SignedRole<Root>,
        published: Option<&Published>,
        work: &mut PendingPublish,
    ) -> Result<SignedRepository> {
        let root_doc = &root.signed.signed;
        let snapshot_version = published.map(|p| p.snapshot.signed.signed.version);
        let timestamp_version = published.map(|p| p.timestamp.signed.signed.version);
        check_follows(
            RoleType::Targets,
            work.targets.signed.signed.version,
            published.map(|p| p.targets.signed.signed.version),
        )?;

        let progress = self.collect(&mut work.targets, root_doc).await?;
        self.require(RoleType::Targets, progress)?;

        let snapshot = match work.snapshot.take() {
            Some(snapshot) => {
                check_follows(
                    RoleType::Snapshot,
                    snapshot.signed.signed.version,
                    snapshot_version,
                )?;
                snapshot
            }
            None => {
                let mut snapshot = Snapshot::new(
                    next_version(snapshot_version, RoleType::Snapshot)?,
                    round_time(Utc::now()) + self.policy.snapshot_lifetime,
                );
                snapshot.meta.insert(
                    Snapshot::TARGETS_META.to_string(),
                    work.targets.snapshot_meta(),
                );
                snapshot
                    .meta
                    .insert(Snapshot::ROOT_META.to_string(), root.snapshot_meta());
                SignedRole::from_signed(Signed::unsigned(snapshot))?
            }
        };
        let snapshot = work.snapshot.insert(snapshot);
        let progress = self.collect(snapshot, root_doc).await?;
        self.require(RoleType::Snapshot, progress)?;

        let timestamp = match work.timestamp.take() {
            Some(timestamp) => {
                check_follows(
                    RoleType::Timestamp,
                    timestamp.signed.signed.version,
                    timestamp_version,
                )?;
                timestamp
            }
            None => {
                let mut timestamp = Timestamp::new(
                    next_version(timestamp_version, RoleType::Timestamp)?,
                    round_time(Utc::now()) + self.policy.timestamp_lifetime,
                );
                timestamp.meta.insert(
                    Timestamp::SNAPSHOT_META.to_string(),
                    snapshot.timestamp_meta(),
                );
                SignedRole::from_signed(Signed::unsigned(timestamp))?
            }
        };
        let timestamp = work.timestamp.insert(timestamp);
        let progress = self.collect(timestamp, root_doc).await?;
        self.require(RoleType::Timestamp, progress)?;

        Ok(SignedRepository {
            root: root.clone(),
            targets: work.targets.clone(),
            snapshot: snapshot.clone(),
            timestamp: timestamp.clone(),
        })
    }

    /// Signs `work`, then commits it, or saves it as pending if a role is short of signatures.
    async fn finish(&self, state: &mut State, mut work: PendingPublish) -> Result<SignedRepository> {
        let repository = match self
            .sign_bundle(&state.root, state.published.as_ref(), &mut work)
            .await
        {
            Ok(repository) => repository,
            Err(e @ Error::KeyUnavailable { .. }) => {
                work.save(&self.pending_dir())?;
                warn!("{}", e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let consistent_snapshot = state.root.signed.signed.consistent_snapshot;
        let targets_dir = self.targets_dir();
        for (name, target) in &repository.targets.signed.signed.targets {
            if let Some(bytes) = work.files.get(name) {
                let stored = target.stored_name(&encode_filename(name), consistent_snapshot);
                write_atomic(&targets_dir.join(stored), bytes)?;
            }
        }
        repository.write(self.metadata_dir())?;
        PendingPublish::discard(&self.pending_dir()).await?;

        state.published = Some(Published {
            targets: repository.targets.clone(),
            snapshot: repository.snapshot.clone(),
            timestamp: repository.timestamp.clone(),
        });
        info!(
            "published targets version {} (snapshot {}, timestamp {})",
            repository.targets.signed.signed.version,
            repository.snapshot.signed.signed.version,
            repository.timestamp.signed.signed.version
        );
        self.record(state, EntryKind::Publish, repository.content_hash())
            .await?;
        Ok(repository)
    }

    async fn record(
        &self,
        state: &mut State,
        kind: EntryKind,
        content_hash: Decoded<Hex>,
    ) -> Result<()> {
        let draft = EntryDraft {
            sequence_no: state.log.next_sequence_no(),
            timestamp: round_time(Utc::now()),
            publisher_id: self.policy.publisher_id.clone(),
            kind,
            targets_version: state.targets_version(),
            content_hash,
            corrects: None,
        };
        state.log.append(draft).await?;
        Ok(())
    }
}

/// Reads the root in force and the bundle `timestamp.json` currently points at.
async fn load_repository(dir: &Path) -> Result<(SignedRole<Root>, Option<Published>)> {
    let metadata_dir = dir.join(METADATA_DIR);
    let root: SignedRole<Root> = read_role(&metadata_dir.join(ROOT_FILE))
        .await?
        .context(error::NotBootstrappedSnafu { path: dir })?;
    let consistent_snapshot = root.signed.signed.consistent_snapshot;

    let timestamp = match read_role::<Timestamp>(&metadata_dir.join("timestamp.json")).await? {
        Some(timestamp) => timestamp,
        None => return Ok((root, None)),
    };
    let meta = timestamp.signed.signed.snapshot_meta()?;
    let name = versioned_filename(Timestamp::SNAPSHOT_META, meta.version, consistent_snapshot);
    let snapshot: SignedRole<Snapshot> = read_role(&metadata_dir.join(&name))
        .await?
        .context(error::MetaMissingSnafu {
            file: Timestamp::SNAPSHOT_META,
            role: RoleType::Timestamp,
        })?;
    let meta = snapshot.signed.signed.targets_meta()?;
    let name = versioned_filename(Snapshot::TARGETS_META, meta.version, consistent_snapshot);
    let targets = read_role(&metadata_dir.join(&name))
        .await?
        .context(error::MetaMissingSnafu {
            file: Snapshot::TARGETS_META,
            role: RoleType::Snapshot,
        })?;
    Ok((
        root,
        Some(Published {
            targets,
            snapshot,
            timestamp,
        }),
    ))
}

/// Fails unless `version` is exactly one past what is published for `role`.
fn check_follows(
    role: RoleType,
    version: NonZeroU64,
    published: Option<NonZeroU64>,
) -> Result<()> {
    let published = published.map_or(0, NonZeroU64::get);
    ensure!(
        published.checked_add(1) == Some(version.get()),
        error::StalePublishSnafu {
            role,
            version,
            published,
        }
    );
    Ok(())
}

async fn read_role<T>(path: &Path) -> Result<Option<SignedRole<T>>>
where
    T: Role + DeserializeOwned,
{
    match tokio::fs::read(path).await {
        Ok(buffer) => SignedRole::from_buffer(buffer).map(Some),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context(error::FileReadSnafu { path }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind as VouchErrorKind;
    use crate::sign::KeyKind;
    use tempfile::TempDir;

    async fn bootstrapped(dir: &Path) -> RepositoryPublisher {
        let mut keystore = KeyStore::new(dir.join("keys"));
        let (_, key) = keystore.generate(KeyKind::Ed25519).await.unwrap();
        let mut builder = RootBuilder::new();
        builder.add_key(key, &RoleType::ALL).unwrap();
        RepositoryPublisher::bootstrap(
            dir.join("repo"),
            keystore,
            builder.build().unwrap(),
            PublishPolicy::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn publish_writes_consistent_names() {
        let dir = TempDir::new().unwrap();
        let publisher = bootstrapped(dir.path()).await;
        let repository = publisher
            .publish(vec![TargetFile::new("fw/update.pkg", b"payload".to_vec())])
            .await
            .unwrap();

        let metadata = publisher.metadata_dir();
        assert!(metadata.join("1.root.json").is_file());
        assert!(metadata.join("root.json").is_file());
        assert!(metadata.join("1.targets.json").is_file());
        assert!(metadata.join("1.snapshot.json").is_file());
        assert!(metadata.join("timestamp.json").is_file());

        let target = repository
            .targets()
            .signed()
            .signed
            .find_target("fw/update.pkg")
            .unwrap();
        let stored = format!("{}.fw%2Fupdate.pkg", hex::encode(&target.hashes.sha256));
        assert_eq!(
            std::fs::read(publisher.targets_dir().join(stored)).unwrap(),
            b"payload"
        );
        assert_eq!(
            std::fs::read(metadata.join("timestamp.json")).unwrap(),
            repository.timestamp().buffer()
        );
    }

    #[tokio::test]
    async fn reopened_publisher_continues_versions() {
        let dir = TempDir::new().unwrap();
        let publisher = bootstrapped(dir.path()).await;
        publisher
            .publish(vec![TargetFile::new("a", b"1".to_vec())])
            .await
            .unwrap();
        let keystore = KeyStore::open(dir.path().join("keys")).await.unwrap();
        drop(publisher);

        let publisher =
            RepositoryPublisher::open(dir.path().join("repo"), keystore, PublishPolicy::default())
                .await
                .unwrap();
        let repository = publisher
            .publish(vec![TargetFile::new("a", b"2".to_vec())])
            .await
            .unwrap();
        assert_eq!(repository.targets().signed().signed.version.get(), 2);
        assert_eq!(repository.snapshot().signed().signed.version.get(), 2);
        assert_eq!(repository.timestamp().signed().signed.version.get(), 2);
    }

    #[tokio::test]
    async fn refresh_bumps_only_timestamp() {
        let dir = TempDir::new().unwrap();
        let publisher = bootstrapped(dir.path()).await;
        let err = publisher.refresh().await.unwrap_err();
        assert!(matches!(err, Error::NothingPublished { .. }));

        let first = publisher
            .publish(vec![TargetFile::new("a", b"1".to_vec())])
            .await
            .unwrap();
        let refreshed = publisher.refresh().await.unwrap();
        assert_eq!(refreshed.timestamp().signed().signed.version.get(), 2);
        assert_eq!(
            refreshed.snapshot().buffer(),
            first.snapshot().buffer(),
        );
    }

    #[tokio::test]
    async fn bad_target_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let publisher = bootstrapped(dir.path()).await;
        for files in [
            vec![TargetFile::new("", b"x".to_vec())],
            vec![TargetFile::new("..", b"x".to_vec())],
            vec![
                TargetFile::new("a", b"x".to_vec()),
                TargetFile::new("a", b"y".to_vec()),
            ],
        ] {
            let err = publisher.publish(files).await.unwrap_err();
            assert!(matches!(err, Error::InvalidTargetName { .. }));
        }
        assert!(publisher.current().await.is_none());
    }

    #[tokio::test]
    async fn second_bootstrap_is_refused() {
        let dir = TempDir::new().unwrap();
        let publisher = bootstrapped(dir.path()).await;
        let root = publisher.root().await.signed;
        let err = RepositoryPublisher::bootstrap(
            publisher.dir(),
            KeyStore::new(dir.path().join("keys")),
            root,
            PublishPolicy::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::AlreadyBootstrapped { .. }));
    }

    #[tokio::test]
    async fn from_dir_names_use_forward_slashes() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("fw")).unwrap();
        std::fs::write(dir.path().join("fw").join("update.pkg"), b"1").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"2").unwrap();
        let files = TargetFile::from_dir(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["fw/update.pkg", "notes.txt"]);
    }

    #[tokio::test]
    async fn missing_keys_leave_repository_untouched() {
        let dir = TempDir::new().unwrap();
        let mut publisher = bootstrapped(dir.path()).await;
        let key_ids: Vec<_> = publisher.keystore().key_ids().cloned().collect();
        for key_id in &key_ids {
            publisher.keystore_mut().remove(key_id);
        }

        let err = publisher
            .publish(vec![TargetFile::new("a", b"1".to_vec())])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), VouchErrorKind::KeyUnavailable);
        assert!(!publisher.metadata_dir().join("timestamp.json").exists());
        assert!(!publisher.targets_dir().exists());
        assert!(PendingPublish::exists(&publisher.pending_dir()));

        let err = publisher
            .publish(vec![TargetFile::new("a", b"1".to_vec())])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PublishPending { .. }));
        publisher.abandon().await.unwrap();
        assert!(!publisher.pending_dir().exists());
    }

    #[test]
    fn pending_versions_must_follow_published() {
        let one = NonZeroU64::new(1).unwrap();
        let two = NonZeroU64::new(2).unwrap();
        check_follows(RoleType::Targets, one, None).unwrap();
        check_follows(RoleType::Snapshot, two, Some(one)).unwrap();
        let err = check_follows(RoleType::Timestamp, two, Some(two)).unwrap_err();
        assert!(matches!(
            err,
            Error::StalePublish {
                role: RoleType::Timestamp,
                published: 2,
                ..
            }
        ));
    }
}
