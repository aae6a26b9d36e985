// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! An append-only, hash-chained record of every change a publisher makes to a repository.
//!
//! Each entry stores the SHA-256 of the canonical JSON of the entry before it, so editing or
//! dropping any entry breaks every link after it. Auditors replay the chain with
//! [`TransparencyLog::audit`] and compare what clients observed with
//! [`TransparencyLog::check_observed`].

use crate::error::{self, Result};
use crate::schema::decoded::{Decoded, Hex};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use olpc_cjson::CanonicalFormatter;
use ring::digest::{digest, Context, SHA256};
use serde::{Deserialize, Serialize};
use serde_plain::derive_display_from_serialize;
use snafu::{ensure, ResultExt};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// The `previous_hash` of the first entry.
pub const GENESIS_HASH: [u8; 32] = [0; 32];

/// What a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    /// The repository's first root was written.
    Bootstrap,
    /// A new targets/snapshot/timestamp bundle was published.
    Publish,
    /// Only the timestamp was re-signed.
    Refresh,
    /// A new root version was written.
    RootRotation,
    /// Amends an earlier entry, named by `corrects`.
    Correction,
}

derive_display_from_serialize!(EntryKind);

/// One line of the log.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogEntry {
    /// Position in the log, starting at 1.
    pub sequence_no: u64,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Who made the change.
    pub publisher_id: String,
    /// What changed.
    pub kind: EntryKind,
    /// Targets version in force after this event; 0 before the first publish.
    pub targets_version: u64,
    /// See [`bundle_content_hash`].
    pub content_hash: Decoded<Hex>,
    /// SHA-256 of the previous entry's canonical JSON, or [`GENESIS_HASH`].
    pub previous_hash: Decoded<Hex>,
    /// For corrections, the sequence number of the entry being amended.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrects: Option<u64>,
}

impl LogEntry {
    fn canonical_form(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut data, CanonicalFormatter::new());
        self.serialize(&mut ser)
            .context(error::JsonSerializationSnafu {
                what: "transparency log entry",
            })?;
        Ok(data)
    }

    /// SHA-256 of this entry's canonical JSON; the next entry's `previous_hash`.
    pub fn digest(&self) -> Result<Vec<u8>> {
        Ok(digest(&SHA256, &self.canonical_form()?).as_ref().to_vec())
    }
}

/// An entry before the log links it into the chain. Fields mean the same as on [`LogEntry`].
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct EntryDraft {
    pub sequence_no: u64,
    pub timestamp: DateTime<Utc>,
    pub publisher_id: String,
    pub kind: EntryKind,
    pub targets_version: u64,
    pub content_hash: Decoded<Hex>,
    pub corrects: Option<u64>,
}

/// Where and how the chain fails to verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    /// Sequence number recorded in the offending entry.
    pub sequence_no: u64,
    /// What is wrong with it.
    pub reason: BreakReason,
}

/// Why a link in the chain does not verify.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BreakReason {
    /// The entry's sequence number is not its predecessor's plus one.
    SequenceGap { expected: u64 },
    /// The entry's `previous_hash` does not match its predecessor.
    PreviousHashMismatch { expected: String, recorded: String },
}

impl fmt::Display for BreakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakReason::SequenceGap { expected } => {
                write!(f, "expected sequence number {expected}")
            }
            BreakReason::PreviousHashMismatch { expected, recorded } => write!(
                f,
                "previous_hash is {recorded} but the preceding entry hashes to {expected}"
            ),
        }
    }
}

/// Binds a set of published files: SHA-256 over the concatenated SHA-256 digests of `files`.
///
/// Publishes and refreshes pass root, targets, snapshot and timestamp in that order; bootstrap
/// and root rotation pass the root alone.
pub fn bundle_content_hash(files: &[&[u8]]) -> Decoded<Hex> {
    let mut context = Context::new(&SHA256);
    for file in files {
        context.update(digest(&SHA256, file).as_ref());
    }
    context.finish().as_ref().to_vec().into()
}

/// A JSON-lines file of canonical log entries.
#[derive(Debug)]
pub struct TransparencyLog {
    path: PathBuf,
    entries: Vec<LogEntry>,
}

impl TransparencyLog {
    /// Loads the log at `path`. A missing file is an empty log.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).context(error::FileReadSnafu { path }),
        };

        let mut entries = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(line).context(error::LogParseSnafu {
                path: &path,
                line: index + 1,
            })?;
            entries.push(entry);
        }
        debug!("loaded {} log entries from {}", entries.len(), path.display());
        Ok(Self { path, entries })
    }

    /// The log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// The last entry, if any.
    pub fn tail(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    /// The sequence number the next entry must carry.
    pub fn next_sequence_no(&self) -> u64 {
        self.tail().map_or(1, |tail| tail.sequence_no + 1)
    }

    /// Links `draft` to the tail, writes it as one line and syncs the file.
    pub async fn append(&mut self, draft: EntryDraft) -> Result<&LogEntry> {
        let expected = self.next_sequence_no();
        ensure!(
            draft.sequence_no == expected,
            error::LogSequenceSnafu {
                expected,
                given: draft.sequence_no,
            }
        );
        let previous_hash = match self.tail() {
            Some(tail) => tail.digest()?,
            None => GENESIS_HASH.to_vec(),
        };

        let entry = LogEntry {
            sequence_no: draft.sequence_no,
            timestamp: draft.timestamp,
            publisher_id: draft.publisher_id,
            kind: draft.kind,
            targets_version: draft.targets_version,
            content_hash: draft.content_hash,
            previous_hash: previous_hash.into(),
            corrects: draft.corrects,
        };
        let mut line = entry.canonical_form()?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context(error::LogWriteSnafu { path: &self.path })?;
        file.write_all(&line)
            .await
            .context(error::LogWriteSnafu { path: &self.path })?;
        file.sync_all()
            .await
            .context(error::LogWriteSnafu { path: &self.path })?;

        debug!("log entry {} ({}) appended", entry.sequence_no, entry.kind);
        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    fn check_link(&self, position: usize) -> Result<Option<ChainBreak>> {
        let entry = &self.entries[position];
        let expected_sequence_no = position as u64 + 1;
        if entry.sequence_no != expected_sequence_no {
            return Ok(Some(ChainBreak {
                sequence_no: entry.sequence_no,
                reason: BreakReason::SequenceGap {
                    expected: expected_sequence_no,
                },
            }));
        }

        let expected_hash = match position.checked_sub(1) {
            Some(previous) => self.entries[previous].digest()?,
            None => GENESIS_HASH.to_vec(),
        };
        if entry.previous_hash.as_ref() != expected_hash.as_slice() {
            return Ok(Some(ChainBreak {
                sequence_no: entry.sequence_no,
                reason: BreakReason::PreviousHashMismatch {
                    expected: hex::encode(&expected_hash),
                    recorded: entry.previous_hash.to_string(),
                },
            }));
        }
        Ok(None)
    }

    /// Checks every link of entries `from..=to` (by position in the log) and returns the first
    /// broken one.
    pub fn verify_chain(&self, from: u64, to: u64) -> Result<Option<ChainBreak>> {
        let start = usize::try_from(from.max(1) - 1).unwrap_or(usize::MAX);
        let end = usize::try_from(to)
            .unwrap_or(usize::MAX)
            .min(self.entries.len());
        for position in start..end {
            if let Some(chain_break) = self.check_link(position)? {
                return Ok(Some(chain_break));
            }
        }
        Ok(None)
    }

    /// Fails with `LogChainBroken` on the first broken link anywhere in the log.
    pub fn ensure_intact(&self) -> Result<()> {
        match self.verify_chain(1, u64::MAX)? {
            None => Ok(()),
            Some(chain_break) => error::LogChainBrokenSnafu {
                sequence_no: chain_break.sequence_no,
                reason: chain_break.reason.to_string(),
            }
            .fail(),
        }
    }

    /// Replays the whole chain, warning about each broken link and carrying on past it.
    pub fn audit(&self) -> Result<Vec<ChainBreak>> {
        let mut breaks = Vec::new();
        for position in 0..self.entries.len() {
            if let Some(chain_break) = self.check_link(position)? {
                warn!(
                    "transparency log {} broken at entry {}: {}",
                    self.path.display(),
                    chain_break.sequence_no,
                    chain_break.reason
                );
                breaks.push(chain_break);
            }
        }
        Ok(breaks)
    }

    /// Fails with `Equivocation` unless the log recorded `content_hash` for `targets_version`.
    pub fn check_observed(&self, targets_version: u64, content_hash: &[u8]) -> Result<()> {
        let recorded = self.entries.iter().any(|entry| {
            entry.targets_version == targets_version && entry.content_hash.as_ref() == content_hash
        });
        ensure!(
            recorded,
            error::EquivocationSnafu {
                targets_version,
                observed: hex::encode(content_hash),
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use tempfile::TempDir;

    fn draft(log: &TransparencyLog, kind: EntryKind, targets_version: u64) -> EntryDraft {
        EntryDraft {
            sequence_no: log.next_sequence_no(),
            timestamp: "2026-10-19T08:00:00Z".parse().unwrap(),
            publisher_id: "release-bot".to_string(),
            kind,
            targets_version,
            content_hash: bundle_content_hash(&[format!("bundle {targets_version}").as_bytes()]),
            corrects: None,
        }
    }

    async fn log_with_three(dir: &TempDir) -> TransparencyLog {
        let mut log = TransparencyLog::open(dir.path().join("log.jsonl")).await.unwrap();
        log.append(draft(&log, EntryKind::Bootstrap, 0)).await.unwrap();
        log.append(draft(&log, EntryKind::Publish, 1)).await.unwrap();
        log.append(draft(&log, EntryKind::Publish, 2)).await.unwrap();
        log
    }

    #[tokio::test]
    async fn chain_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let log = log_with_three(&dir).await;
        assert_eq!(log.entries()[0].previous_hash.as_ref(), GENESIS_HASH);

        let reopened = TransparencyLog::open(log.path()).await.unwrap();
        assert_eq!(reopened.entries(), log.entries());
        assert_eq!(reopened.verify_chain(1, 3).unwrap(), None);
        reopened.ensure_intact().unwrap();
        assert!(reopened.audit().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tampered_entry_breaks_next_link() {
        let dir = TempDir::new().unwrap();
        let log = log_with_three(&dir).await;

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        let tampered = lines[1].replace("release-bot", "mallory");
        std::fs::write(
            log.path(),
            format!("{}\n{}\n{}\n", lines[0], tampered, lines[2]),
        )
        .unwrap();

        let reopened = TransparencyLog::open(log.path()).await.unwrap();
        assert_eq!(reopened.verify_chain(1, 2).unwrap(), None);
        let chain_break = reopened.verify_chain(1, 3).unwrap().unwrap();
        assert_eq!(chain_break.sequence_no, 3);
        assert!(matches!(
            chain_break.reason,
            BreakReason::PreviousHashMismatch { .. }
        ));
        let err = reopened.ensure_intact().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LogChainBroken);
        assert_eq!(reopened.audit().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_entry_is_a_gap() {
        let dir = TempDir::new().unwrap();
        let log = log_with_three(&dir).await;
        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        std::fs::write(log.path(), format!("{}\n{}\n", lines[0], lines[2])).unwrap();

        let reopened = TransparencyLog::open(log.path()).await.unwrap();
        let chain_break = reopened.verify_chain(1, 3).unwrap().unwrap();
        assert_eq!(
            chain_break,
            ChainBreak {
                sequence_no: 3,
                reason: BreakReason::SequenceGap { expected: 2 },
            }
        );
    }

    #[tokio::test]
    async fn sequence_enforced() {
        let dir = TempDir::new().unwrap();
        let mut log = log_with_three(&dir).await;
        let mut skipped = draft(&log, EntryKind::Publish, 3);
        skipped.sequence_no = 7;
        let err = log.append(skipped).await.unwrap_err();
        assert!(matches!(err, Error::LogSequence { expected: 4, given: 7, .. }));
        assert_eq!(log.entries().len(), 3);
    }

    #[tokio::test]
    async fn corrections_append() {
        let dir = TempDir::new().unwrap();
        let mut log = log_with_three(&dir).await;
        let mut correction = draft(&log, EntryKind::Correction, 2);
        correction.corrects = Some(2);
        let entry = log.append(correction).await.unwrap();
        assert_eq!(entry.corrects, Some(2));
        assert_eq!(entry.sequence_no, 4);
        log.ensure_intact().unwrap();
    }

    #[tokio::test]
    async fn equivocation_detected() {
        let dir = TempDir::new().unwrap();
        let log = log_with_three(&dir).await;
        let recorded = bundle_content_hash(&[b"bundle 2".as_slice()]);
        log.check_observed(2, &recorded).unwrap();

        let forged = bundle_content_hash(&[b"another bundle 2".as_slice()]);
        let err = log.check_observed(2, &forged).unwrap_err();
        assert!(matches!(err, Error::Equivocation { .. }));
    }
}
