// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verifies a target against a repository before it is handed to an installer.
//!
//! Every call to [`ClientVerifier::verify_target`] runs the full sequence: walk the root chain
//! forward, then fetch and check timestamp, snapshot and targets, then download the target
//! and compare it with its signed length and hashes. Only when all of that succeeds is the
//! file moved into place and the new watermarks persisted.

mod trust;

pub use trust::Watermarks;

use crate::datastore::Datastore;
use crate::encode_filename;
use crate::error::{self, Error, ErrorKind, Result};
use crate::fetch::{fetch_hashed, fetch_max_size, read_all};
use crate::schema::{
    versioned_filename, Role, RoleType, Root, Signed, Snapshot, Target, Targets, Timestamp,
};
use crate::transport::{FilesystemTransport, Transport, TransportErrorKind};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use snafu::{ensure, ResultExt};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use trust::TrustStore;
use url::Url;

/// Limits used when fetching repository metadata.
///
/// These limits are implemented to prevent endless data attacks. Clients must ensure these values
/// are set higher than what would reasonably be expected by a repository, but not so high that the
/// amount of data could interfere with the system.
///
/// The [`Default`] implementation sets the following values:
/// * `max_root_size`: 1 MiB
/// * `max_targets_size`: 10 MiB
/// * `max_timestamp_size`: 1 MiB
/// * `max_root_updates`: 1024
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// The maximum allowable size in bytes for downloaded root.json files.
    pub max_root_size: u64,

    /// The maximum allowable size in bytes for the downloaded targets.json file **if** the size
    /// is not listed in snapshot.json.
    pub max_targets_size: u64,

    /// The maximum allowable size in bytes for the downloaded timestamp.json file.
    pub max_timestamp_size: u64,

    /// The maximum number of root versions walked in one verification.
    pub max_root_updates: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_root_size: 1024 * 1024,         // 1 MiB
            max_targets_size: 1024 * 1024 * 10, // 10 MiB
            max_timestamp_size: 1024 * 1024,    // 1 MiB
            max_root_updates: 1024,
        }
    }
}

/// How long a target download may take before it is abandoned.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Configures a [`ClientVerifier`].
///
/// ```no_run
/// # use vouch::client::ClientVerifierBuilder;
/// # use url::Url;
/// # fn example(root: Vec<u8>) -> vouch::error::Result<()> {
/// let verifier = ClientVerifierBuilder::new(
///     root,
///     Url::parse("file:///srv/repo/metadata/").unwrap(),
///     Url::parse("file:///srv/repo/targets/").unwrap(),
/// )
/// .datastore("/var/lib/updater")
/// .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientVerifierBuilder {
    root: Vec<u8>,
    metadata_base_url: Url,
    targets_base_url: Url,
    datastore: Option<PathBuf>,
    limits: Limits,
    transport: Option<Box<dyn Transport>>,
    download_timeout: Duration,
}

impl ClientVerifierBuilder {
    /// `root` is the pinned root, shipped with the device through a trusted channel. It is used
    /// only until a newer root has been accepted and stored in the datastore.
    pub fn new<R: Into<Vec<u8>>>(root: R, metadata_base_url: Url, targets_base_url: Url) -> Self {
        Self {
            root: root.into(),
            metadata_base_url,
            targets_base_url,
            datastore: None,
            limits: Limits::default(),
            transport: None,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    /// Where trusted state survives between runs. Without it a temporary directory is used and
    /// every verifier starts from the pinned root.
    #[must_use]
    pub fn datastore<P: Into<PathBuf>>(mut self, datastore: P) -> Self {
        self.datastore = Some(datastore.into());
        self
    }

    /// Overrides the default [`Limits`].
    #[must_use]
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Fetches repository files through `transport`. Defaults to [`FilesystemTransport`].
    #[must_use]
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Bounds each target download.
    #[must_use]
    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// Checks the configuration and parses the pinned root.
    pub fn build(self) -> Result<ClientVerifier> {
        let metadata_base_url = check_base_url(self.metadata_base_url)?;
        let targets_base_url = check_base_url(self.targets_base_url)?;
        let pinned_root: Signed<Root> =
            serde_json::from_slice(&self.root).context(error::ParseTrustedMetadataSnafu)?;

        Ok(ClientVerifier {
            transport: self
                .transport
                .unwrap_or_else(|| Box::new(FilesystemTransport)),
            datastore: Datastore::new(self.datastore)?,
            limits: self.limits,
            metadata_base_url,
            targets_base_url,
            download_timeout: self.download_timeout,
            pinned_root,
            trust: None,
        })
    }
}

/// A target that passed verification and now sits at `path`.
#[derive(Debug, Clone)]
pub struct VerifiedTarget {
    /// The name it is listed under in targets metadata.
    pub name: String,
    /// Where the verified file was written.
    pub path: PathBuf,
    /// The signed description the file matched.
    pub target: Target,
}

/// The installer-facing outcome of a verification.
#[derive(Debug)]
pub enum Verdict {
    /// Safe to install the file at `path`.
    Verified {
        /// Where the verified file was written.
        path: PathBuf,
    },
    /// Do not install.
    Rejected {
        /// Failure category.
        kind: ErrorKind,
        /// Short, stable reason such as `version-rollback`.
        reason: &'static str,
        /// Human-readable detail.
        message: String,
    },
}

impl Verdict {
    /// Whether the target may be installed.
    pub fn is_verified(&self) -> bool {
        matches!(self, Verdict::Verified { .. })
    }
}

impl From<Result<VerifiedTarget>> for Verdict {
    fn from(result: Result<VerifiedTarget>) -> Self {
        match result {
            Ok(verified) => Verdict::Verified {
                path: verified.path,
            },
            Err(err) => Verdict::Rejected {
                kind: err.kind(),
                reason: err.reason(),
                message: err.to_string(),
            },
        }
    }
}

/// Verifies targets served by one repository.
///
/// Each verifier owns its datastore; verifiers for different devices can run in parallel
/// against the same repository.
#[derive(Debug)]
pub struct ClientVerifier {
    transport: Box<dyn Transport>,
    datastore: Datastore,
    limits: Limits,
    metadata_base_url: Url,
    targets_base_url: Url,
    download_timeout: Duration,
    pinned_root: Signed<Root>,
    trust: Option<TrustStore>,
}

/// The metadata accepted for one verification, before anything is persisted.
struct Accepted {
    root: Signed<Root>,
    targets: Signed<Targets>,
    watermarks: Watermarks,
}

impl ClientVerifier {
    /// The root accepted by the last successful verification, or the pinned root before one.
    pub fn trusted_root(&self) -> &Signed<Root> {
        self.trust.as_ref().map_or(&self.pinned_root, |trust| &trust.root)
    }

    /// The watermarks accepted by the last successful verification.
    pub fn watermarks(&self) -> Watermarks {
        self.trust
            .as_ref()
            .map(|trust| trust.watermarks)
            .unwrap_or_default()
    }

    /// Verifies `name` and writes it to `outdir` under its percent-encoded name.
    ///
    /// On any failure nothing is written to `outdir` and the persisted trust state is left as it
    /// was.
    pub async fn verify_target<P>(&mut self, name: &str, outdir: P) -> Result<VerifiedTarget>
    where
        P: AsRef<Path>,
    {
        let outdir = outdir.as_ref();
        let now = self.datastore.system_time().await?;
        let stored = TrustStore::load(&self.datastore).await?;
        let accepted = self.update_metadata(stored, now).await?;

        let target = accepted.targets.signed.find_target(name)?.clone();
        let consistent_snapshot = accepted.root.signed.consistent_snapshot;
        let download = self
            .download_target(name, &target, consistent_snapshot, outdir)
            .await?;

        // The file goes into place before the watermarks move, and comes back out if they
        // cannot be saved.
        let path = outdir.join(encode_filename(name));
        download
            .persist(&path)
            .context(error::FilePersistSnafu { path: &path })?;
        let trust = TrustStore {
            root: accepted.root,
            watermarks: accepted.watermarks,
        };
        if let Err(e) = trust.save(&self.datastore).await {
            if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                warn!(
                    "failed to remove '{}' after trust state was not saved: {}",
                    path.display(),
                    remove_err
                );
            }
            return Err(e);
        }
        self.trust = Some(trust);

        info!(
            "verified target '{}' (targets version {})",
            name, accepted.watermarks.targets
        );
        Ok(VerifiedTarget {
            name: name.to_string(),
            path,
            target,
        })
    }

    async fn update_metadata(
        &self,
        stored: Option<TrustStore>,
        now: DateTime<Utc>,
    ) -> Result<Accepted> {
        let (root, mut watermarks) = self.starting_point(stored)?;
        let root = self.update_root(root, &mut watermarks, now).await?;
        let timestamp = self.load_timestamp(&root, &watermarks, now).await?;
        let snapshot = self
            .load_snapshot(&root, &timestamp, &watermarks, now)
            .await?;
        let targets = self
            .load_targets(&root, &snapshot, &watermarks, now)
            .await?;

        watermarks.advance(&timestamp.signed);
        watermarks.advance(&snapshot.signed);
        watermarks.advance(&targets.signed);
        Ok(Accepted {
            root,
            targets,
            watermarks,
        })
    }

    /// The stored root and watermarks, unless the pinned root is newer, in which case the pinned
    /// root must verify against itself.
    fn starting_point(&self, stored: Option<TrustStore>) -> Result<(Signed<Root>, Watermarks)> {
        match stored {
            Some(trust) if trust.root.signed.version >= self.pinned_root.signed.version => {
                Ok((trust.root, trust.watermarks))
            }
            stored => {
                self.pinned_root.signed.verify_role(&self.pinned_root)?;
                let watermarks = stored.map(|trust| trust.watermarks).unwrap_or_default();
                Ok((self.pinned_root.clone(), watermarks))
            }
        }
    }

    /// Walks `N+1.root.json` forward until the next version does not exist.
    async fn update_root(
        &self,
        mut root: Signed<Root>,
        watermarks: &mut Watermarks,
        now: DateTime<Utc>,
    ) -> Result<Signed<Root>> {
        let original = root.signed.clone();
        let mut updates = 0;
        loop {
            let version = root.signed.version.get() + 1;
            let path = format!("{version}.root.json");
            let url = join_url(&self.metadata_base_url, &path)?;
            let stream = match fetch_max_size(
                self.transport.as_ref(),
                url.clone(),
                self.limits.max_root_size,
                "max_root_size limit",
            )
            .await
            {
                Err(Error::Transport { source, .. })
                    if source.kind() == TransportErrorKind::FileNotFound =>
                {
                    break
                }
                other => other.context(error::RootRotationFailedSnafu { version })?,
            };

            ensure!(
                updates < self.limits.max_root_updates,
                error::RootUpdateLimitSnafu {
                    max_root_updates: self.limits.max_root_updates,
                }
            );
            updates += 1;

            let new_root = next_root(&root.signed, stream, &url, version)
                .await
                .context(error::RootRotationFailedSnafu { version })?;
            debug!("trusting root version {}", version);
            root = new_root;
        }

        check_expired(now, &root.signed)?;

        if original
            .keys(RoleType::Timestamp)
            .ne(root.signed.keys(RoleType::Timestamp))
            || original
                .keys(RoleType::Snapshot)
                .ne(root.signed.keys(RoleType::Snapshot))
        {
            warn!("timestamp or snapshot keys rotated; resetting their watermarks");
            watermarks.reset_fast_forward();
        }
        Ok(root)
    }

    async fn load_timestamp(
        &self,
        root: &Signed<Root>,
        watermarks: &Watermarks,
        now: DateTime<Utc>,
    ) -> Result<Signed<Timestamp>> {
        let url = join_url(&self.metadata_base_url, "timestamp.json")?;
        let stream = fetch_max_size(
            self.transport.as_ref(),
            url.clone(),
            self.limits.max_timestamp_size,
            "max_timestamp_size limit",
        )
        .await?;
        let timestamp: Signed<Timestamp> = parse_role(&read_all(stream, &url).await?)?;

        root.signed.verify_role(&timestamp)?;
        watermarks.check(&timestamp.signed)?;
        check_expired(now, &timestamp.signed)?;
        Ok(timestamp)
    }

    async fn load_snapshot(
        &self,
        root: &Signed<Root>,
        timestamp: &Signed<Timestamp>,
        watermarks: &Watermarks,
        now: DateTime<Utc>,
    ) -> Result<Signed<Snapshot>> {
        let meta = timestamp.signed.snapshot_meta()?;
        let path = versioned_filename(
            Timestamp::SNAPSHOT_META,
            meta.version,
            root.signed.consistent_snapshot,
        );
        let url = join_url(&self.metadata_base_url, &path)?;
        let stream = fetch_hashed(
            self.transport.as_ref(),
            url.clone(),
            meta.length,
            "timestamp.json",
            &meta.hashes,
        )
        .await?;
        let snapshot: Signed<Snapshot> = parse_role(&read_all(stream, &url).await?)?;

        root.signed.verify_role(&snapshot)?;
        watermarks.check(&snapshot.signed)?;
        ensure!(
            snapshot.signed.version == meta.version,
            error::VersionMismatchSnafu {
                role: RoleType::Snapshot,
                fetched: snapshot.signed.version,
                expected: meta.version,
            }
        );
        check_expired(now, &snapshot.signed)?;
        Ok(snapshot)
    }

    async fn load_targets(
        &self,
        root: &Signed<Root>,
        snapshot: &Signed<Snapshot>,
        watermarks: &Watermarks,
        now: DateTime<Utc>,
    ) -> Result<Signed<Targets>> {
        let meta = snapshot.signed.targets_meta()?;
        let path = versioned_filename(
            Snapshot::TARGETS_META,
            meta.version,
            root.signed.consistent_snapshot,
        );
        let url = join_url(&self.metadata_base_url, &path)?;
        let (max_size, specifier) = match meta.length {
            Some(length) => (length, "snapshot.json"),
            None => (self.limits.max_targets_size, "max_targets_size limit"),
        };
        let stream = match &meta.hashes {
            Some(hashes) => {
                fetch_hashed(
                    self.transport.as_ref(),
                    url.clone(),
                    max_size,
                    specifier,
                    hashes,
                )
                .await?
            }
            None => {
                fetch_max_size(self.transport.as_ref(), url.clone(), max_size, specifier).await?
            }
        };
        let targets: Signed<Targets> = parse_role(&read_all(stream, &url).await?)?;

        root.signed.verify_role(&targets)?;
        ensure!(
            targets.signed.version == meta.version,
            error::VersionMismatchSnafu {
                role: RoleType::Targets,
                fetched: targets.signed.version,
                expected: meta.version,
            }
        );
        watermarks.check(&targets.signed)?;
        check_expired(now, &targets.signed)?;
        Ok(targets)
    }

    /// Downloads `name` into a temporary file in `outdir`. The file is deleted when the returned
    /// handle is dropped, so a rejected download leaves nothing behind.
    async fn download_target(
        &self,
        name: &str,
        target: &Target,
        consistent_snapshot: bool,
        outdir: &Path,
    ) -> Result<NamedTempFile> {
        let stored_name = target.stored_name(&encode_filename(name), consistent_snapshot);
        let url = join_url(&self.targets_base_url, &stored_name)?;
        tokio::fs::create_dir_all(outdir)
            .await
            .context(error::DirCreateSnafu { path: outdir })?;
        let mut file =
            NamedTempFile::new_in(outdir).context(error::FileTempCreateSnafu { path: outdir })?;

        tokio::time::timeout(
            self.download_timeout,
            self.stream_target(name, target, url, &mut file),
        )
        .await
        .map_err(|_| {
            error::DownloadTimeoutSnafu {
                name,
                timeout: self.download_timeout,
            }
            .build()
        })??;
        Ok(file)
    }

    async fn stream_target(
        &self,
        name: &str,
        target: &Target,
        url: Url,
        file: &mut NamedTempFile,
    ) -> Result<()> {
        let mut stream = self
            .transport
            .fetch(url.clone())
            .await
            .with_context(|_| error::TransportSnafu { url: url.clone() })?;
        let mut digests: Vec<_> = target
            .hashes
            .iter()
            .map(|(algorithm, expected)| (algorithm, expected, algorithm.context()))
            .collect();
        let mut measured: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|_| error::TransportSnafu { url: url.clone() })?;
            measured = measured.saturating_add(chunk.len() as u64);
            ensure!(
                measured <= target.length,
                error::TargetLengthMismatchSnafu {
                    name,
                    measured,
                    expected: target.length,
                }
            );
            for (_, _, context) in &mut digests {
                context.update(&chunk);
            }
            file.write_all(&chunk)
                .context(error::FileWriteSnafu { path: file.path() })?;
        }
        ensure!(
            measured == target.length,
            error::TargetLengthMismatchSnafu {
                name,
                measured,
                expected: target.length,
            }
        );

        for (algorithm, expected, context) in digests {
            let calculated = context.finish();
            ensure!(
                calculated.as_ref() == expected,
                error::TargetHashMismatchSnafu {
                    name,
                    algorithm,
                    calculated: hex::encode(calculated),
                    expected: hex::encode(expected),
                }
            );
        }
        file.as_file()
            .sync_all()
            .context(error::FileWriteSnafu { path: file.path() })?;
        Ok(())
    }
}

/// Parses and checks one step of the root chain. `root` is the version currently trusted.
async fn next_root(
    root: &Root,
    stream: crate::transport::TransportStream,
    url: &Url,
    version: u64,
) -> Result<Signed<Root>> {
    let new_root: Signed<Root> = parse_role(&read_all(stream, url).await?)?;
    root.verify_role(&new_root)?;
    ensure!(
        new_root.signed.version.get() == version,
        error::RootVersionSkipSnafu {
            expected: version,
            fetched: new_root.signed.version,
        }
    );
    Ok(new_root)
}

fn parse_role<T: Role + DeserializeOwned>(bytes: &[u8]) -> Result<Signed<T>> {
    let role: Signed<T> =
        serde_json::from_slice(bytes).context(error::ParseMetadataSnafu { role: T::TYPE })?;
    role.signed.check_spec_version()?;
    Ok(role)
}

/// A document is valid strictly before its expiry.
fn check_expired<T: Role>(now: DateTime<Utc>, role: &T) -> Result<()> {
    ensure!(
        now < role.expires(),
        error::ExpiredSnafu {
            role: T::TYPE,
            expires: role.expires(),
            now,
        }
    );
    Ok(())
}

/// Base URLs name directories, so anything joined onto them must land inside.
fn check_base_url(url: Url) -> Result<Url> {
    ensure!(
        url.as_str().ends_with('/'),
        error::BaseUrlMissingTrailingSlashSnafu { url }
    );
    Ok(url)
}

fn join_url(base: &Url, path: &str) -> Result<Url> {
    base.join(path).context(error::JoinUrlSnafu {
        path,
        url: base.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::num::NonZeroU64;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn base_urls_need_trailing_slash() {
        let err = ClientVerifierBuilder::new(
            b"{}".to_vec(),
            url("file:///srv/repo/metadata"),
            url("file:///srv/repo/targets/"),
        )
        .build()
        .unwrap_err();
        assert!(matches!(err, Error::BaseUrlMissingTrailingSlash { .. }));
    }

    #[test]
    fn garbage_pinned_root_is_rejected() {
        let err = ClientVerifierBuilder::new(
            b"not json".to_vec(),
            url("file:///srv/repo/metadata/"),
            url("file:///srv/repo/targets/"),
        )
        .build()
        .unwrap_err();
        assert!(matches!(err, Error::ParseTrustedMetadata { .. }));
    }

    #[test]
    fn expiry_is_exclusive() {
        let expires: DateTime<Utc> = "2030-01-01T00:00:00Z".parse().unwrap();
        let timestamp = Timestamp::new(NonZeroU64::MIN, expires);
        assert!(check_expired(expires - TimeDelta::seconds(1), &timestamp).is_ok());
        let err = check_expired(expires, &timestamp).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Expired);
    }

    #[test]
    fn rejected_verdict_carries_reason() {
        let err = error::VersionMismatchSnafu {
            role: RoleType::Targets,
            fetched: NonZeroU64::new(3).unwrap(),
            expected: NonZeroU64::new(4).unwrap(),
        }
        .build();
        match Verdict::from(Err(err)) {
            Verdict::Rejected { kind, reason, .. } => {
                assert_eq!(kind, ErrorKind::ConsistencyMismatch);
                assert_eq!(reason, "targets-snapshot-mismatch");
            }
            Verdict::Verified { .. } => panic!("expected a rejection"),
        }
    }
}
