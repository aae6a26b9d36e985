// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(clippy::used_underscore_binding)]

//! The signed metadata documents: root, targets, snapshot and timestamp.

mod de;
pub mod decoded;
pub mod key;
mod verify;

use crate::error::{self, Result};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use crate::sign::Sign;
use chrono::{DateTime, Utc};
use olpc_cjson::CanonicalFormatter;
use ring::digest::{Context, SHA256, SHA512};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_plain::{derive_display_from_serialize, derive_fromstr_from_deserialize};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::HashMap;
use std::num::NonZeroU64;

/// The metadata format version written into every document and accepted on read.
pub const SPEC_VERSION: &str = "1.0.0";

/// The type of metadata role.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum RoleType {
    /// Names the keys trusted for every role, including itself.
    Root,
    /// Lists the target files and their lengths and hashes.
    Targets,
    /// Pins the current version of targets metadata.
    Snapshot,
    /// Short-lived pointer at the current snapshot. Limits how long a stale bundle can be replayed.
    Timestamp,
}

derive_display_from_serialize!(RoleType);
derive_fromstr_from_deserialize!(RoleType);

impl RoleType {
    /// All roles, in the order clients verify them.
    pub const ALL: [RoleType; 4] = [
        RoleType::Root,
        RoleType::Timestamp,
        RoleType::Snapshot,
        RoleType::Targets,
    ];
}

/// Common trait implemented by all roles.
pub trait Role: Serialize {
    /// The type of role this object represents.
    const TYPE: RoleType;

    /// The instant after which clients refuse this document.
    fn expires(&self) -> DateTime<Utc>;

    /// Clients never replace a document with one of a lower version.
    fn version(&self) -> NonZeroU64;

    /// The metadata format version the document claims.
    fn spec_version(&self) -> &str;

    /// The filename the role metadata is written to.
    fn filename(&self, consistent_snapshot: bool) -> String;

    /// A deterministic JSON serialization. Every signature is computed over these bytes.
    /// [More info on canonical JSON](http://wiki.laptop.org/go/Canonical_JSON)
    fn canonical_form(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut data, CanonicalFormatter::new());
        self.serialize(&mut ser)
            .context(error::JsonSerializationSnafu {
                what: format!("{} role", Self::TYPE),
            })?;
        Ok(data)
    }

    /// Fails unless the document's major format version is one this library reads.
    fn check_spec_version(&self) -> Result<()> {
        let supported_major = SPEC_VERSION.split('.').next();
        ensure!(
            self.spec_version().split('.').next() == supported_major,
            error::SpecVersionSnafu {
                role: Self::TYPE,
                given: self.spec_version(),
                supported: SPEC_VERSION,
            }
        );
        Ok(())
    }
}

/// The name a metadata file is stored under: `N.<name>` with consistent snapshots, otherwise
/// `<name>` alone. Lets a reader derive a file name from a version recorded by another role.
pub(crate) fn versioned_filename(
    name: &str,
    version: NonZeroU64,
    consistent_snapshot: bool,
) -> String {
    if consistent_snapshot {
        format!("{version}.{name}")
    } else {
        name.to_string()
    }
}

/// A signed metadata object.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Signed<T> {
    /// The role that is signed.
    pub signed: T,
    /// A list of signatures and their key IDs.
    pub signatures: Vec<Signature>,
}

impl<T> Signed<T> {
    /// Wraps a document that nobody has signed yet.
    pub fn unsigned(signed: T) -> Self {
        Self {
            signed,
            signatures: Vec::new(),
        }
    }

    /// Whether `keyid` already has a signature on this document.
    pub fn is_signed_by(&self, keyid: &Decoded<Hex>) -> bool {
        self.signatures.iter().any(|sig| &sig.keyid == keyid)
    }
}

/// A signature and the key ID that made it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Signature {
    /// The key ID (listed in root.json) that made this signature.
    pub keyid: Decoded<Hex>,
    /// A hex-encoded signature of the canonical JSON form of a role.
    pub sig: Decoded<Hex>,
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The root of trust. Lists every public key the repository uses and which roles each key may
/// sign for. Replacing role keys, including root's own, means publishing a new root signed by a
/// threshold of the previous root's root keys.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "root")]
pub struct Root {
    /// The metadata format version, `1.0.0`.
    pub spec_version: String,

    /// When `true`, targets and snapshot metadata files and target files carry a version or
    /// digest prefix so a whole repository state can be served side by side with the next one.
    pub consistent_snapshot: bool,

    /// Starts at 1 and increases by exactly one per rotation.
    pub version: NonZeroU64,

    /// The instant after which clients refuse this root.
    pub expires: DateTime<Utc>,

    /// Public keys by key ID. Each key ID is checked against its key while deserializing, and
    /// repeated key IDs are rejected.
    #[serde(deserialize_with = "de::deserialize_keys")]
    pub keys: HashMap<Decoded<Hex>, Key>,

    /// The authorized keys and threshold of each role.
    pub roles: HashMap<RoleType, RoleKeys>,

    /// Extra arguments found during deserialization.
    ///
    /// We must store these to correctly verify signatures for this object.
    ///
    /// If you're instantiating this struct, you should make this `HashMap::new()`.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

/// The key IDs used for a role and the number of their signatures required to accept it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RoleKeys {
    /// The key IDs used for the role.
    pub keyids: Vec<Decoded<Hex>>,

    /// The threshold of signatures required to validate the role.
    pub threshold: NonZeroU64,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl RoleKeys {
    /// Whether `keyid` is authorized for this role.
    pub fn authorizes(&self, keyid: &Decoded<Hex>) -> bool {
        self.keyids.contains(keyid)
    }
}

impl Root {
    /// The key IDs and threshold for `role`.
    pub fn role_keys(&self, role: RoleType) -> Result<&RoleKeys> {
        self.roles
            .get(&role)
            .context(error::NoRoleKeysInRootSnafu { role })
    }

    /// An iterator over the keys for a given role. Key IDs that have no key listed are skipped.
    pub fn keys(&self, role: RoleType) -> impl Iterator<Item = &Key> {
        self.roles
            .get(&role)
            .map(|role_keys| role_keys.keyids.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|keyid| self.keys.get(keyid))
    }

    /// Given an object/key that impls Sign, return the corresponding key ID from Root.
    pub fn key_id(&self, key_pair: &dyn Sign) -> Option<Decoded<Hex>> {
        let key = key_pair.tuf_key();
        self.keys
            .iter()
            .find(|(_, listed)| **listed == key)
            .map(|(key_id, _)| key_id.clone())
    }
}

impl Role for Root {
    const TYPE: RoleType = RoleType::Root;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }

    fn spec_version(&self) -> &str {
        &self.spec_version
    }

    fn filename(&self, _consistent_snapshot: bool) -> String {
        format!("{}.root.json", self.version())
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// A digest algorithm that may appear in a [`Hashes`] object.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgorithm {
    /// SHA-256. Always present.
    Sha256,
    /// SHA-512. Optional; checked whenever present.
    Sha512,
}

derive_display_from_serialize!(HashAlgorithm);

impl HashAlgorithm {
    /// A streaming digest context for this algorithm.
    pub fn context(self) -> Context {
        match self {
            HashAlgorithm::Sha256 => Context::new(&SHA256),
            HashAlgorithm::Sha512 => Context::new(&SHA512),
        }
    }

    /// Digests `data` in one go.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut context = self.context();
        context.update(data);
        context.finish().as_ref().to_vec()
    }
}

/// The digests of a file. `sha256` is mandatory; every digest listed must match.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Hashes {
    /// The SHA-256 digest.
    pub sha256: Decoded<Hex>,

    /// The SHA-512 digest.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha512: Option<Decoded<Hex>>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Hashes {
    /// Computes SHA-256 and SHA-512 of `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            sha256: HashAlgorithm::Sha256.digest(data).into(),
            sha512: Some(HashAlgorithm::Sha512.digest(data).into()),
            _extra: HashMap::new(),
        }
    }

    /// Computes only the mandatory SHA-256 of `data`.
    pub fn sha256_only(data: &[u8]) -> Self {
        Self {
            sha256: HashAlgorithm::Sha256.digest(data).into(),
            sha512: None,
            _extra: HashMap::new(),
        }
    }

    /// Every digest listed, with its algorithm.
    pub fn iter(&self) -> impl Iterator<Item = (HashAlgorithm, &[u8])> {
        std::iter::once((HashAlgorithm::Sha256, self.sha256.as_ref())).chain(
            self.sha512
                .as_ref()
                .map(|sha512| (HashAlgorithm::Sha512, sha512.as_ref())),
        )
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Names the version of targets metadata (and the root) that make up the current repository
/// state. Signed by the snapshot role.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "snapshot")]
pub struct Snapshot {
    /// The metadata format version, `1.0.0`.
    pub spec_version: String,

    /// Starts at 1 and increases by exactly one per publish.
    pub version: NonZeroU64,

    /// The instant after which clients refuse this document.
    pub expires: DateTime<Utc>,

    /// Metadata file name (`targets.json`, `root.json`) to the version, length and hashes
    /// clients must see when they fetch it.
    pub meta: HashMap<String, SnapshotMeta>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

/// One metadata file listed in a snapshot.
///
/// ```json
///    "targets.json": {
///     "version": 4,
///     "length": 1089,
///     "hashes": {
///      "sha256": "f592d072e1193688a686267e8e10d7257b4ebfcf28133350dae88362d82a0c8a"
///     }
///    }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SnapshotMeta {
    /// Byte length of the file. When absent the client applies its own size limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    /// Digests of the file. When absent the version alone identifies the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Hashes>,

    /// The version the referenced document must carry.
    pub version: NonZeroU64,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Snapshot {
    /// Key under which targets metadata is listed in `meta`.
    pub const TARGETS_META: &'static str = "targets.json";
    /// Key under which the root in force at publish time is listed in `meta`.
    pub const ROOT_META: &'static str = "root.json";

    /// Create a new `Snapshot` object.
    pub fn new(version: NonZeroU64, expires: DateTime<Utc>) -> Self {
        Snapshot {
            spec_version: SPEC_VERSION.to_string(),
            version,
            expires,
            meta: HashMap::new(),
            _extra: HashMap::new(),
        }
    }

    /// The entry for targets metadata.
    pub fn targets_meta(&self) -> Result<&SnapshotMeta> {
        self.meta
            .get(Self::TARGETS_META)
            .context(error::MetaMissingSnafu {
                file: Self::TARGETS_META,
                role: RoleType::Snapshot,
            })
    }
}

impl Role for Snapshot {
    const TYPE: RoleType = RoleType::Snapshot;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }

    fn spec_version(&self) -> &str {
        &self.spec_version
    }

    fn filename(&self, consistent_snapshot: bool) -> String {
        versioned_filename(Timestamp::SNAPSHOT_META, self.version, consistent_snapshot)
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The list of installable files. Signed by the targets role.
///
/// ```text
/// { "_type" : "targets",
///   "spec_version" : SPEC_VERSION,
///   "version" : VERSION,
///   "expires" : EXPIRES,
///   "targets" : { NAME : { "length" : LENGTH, "hashes" : HASHES, ("custom" : { ... }) }, ... }
/// }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "targets")]
pub struct Targets {
    /// The metadata format version, `1.0.0`.
    pub spec_version: String,

    /// Starts at 1 and increases by exactly one per publish.
    pub version: NonZeroU64,

    /// The instant after which clients refuse this document.
    pub expires: DateTime<Utc>,

    /// Target name, relative to the targets base URL, to its description.
    pub targets: HashMap<String, Target>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

/// One installable file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Target {
    /// Exact byte length of the file.
    pub length: u64,

    /// Digests of the file.
    pub hashes: Hashes,

    /// Opaque, signed data for the installer, such as a version string or release notes.
    #[serde(default)]
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Target {
    /// Describes `data`, computing both digests.
    pub fn from_bytes(data: &[u8]) -> Self {
        Target {
            length: data.len() as u64,
            hashes: Hashes::from_bytes(data),
            custom: HashMap::new(),
            _extra: HashMap::new(),
        }
    }

    /// The name the file is stored under in the targets directory.
    pub fn stored_name(&self, name: &str, consistent_snapshot: bool) -> String {
        if consistent_snapshot {
            format!("{}.{}", hex::encode(&self.hashes.sha256), name)
        } else {
            name.to_string()
        }
    }
}

impl Targets {
    /// Create a new, empty `Targets` object.
    pub fn new(version: NonZeroU64, expires: DateTime<Utc>) -> Self {
        Targets {
            spec_version: SPEC_VERSION.to_string(),
            version,
            expires,
            targets: HashMap::new(),
            _extra: HashMap::new(),
        }
    }

    /// Looks up a target by name.
    pub fn find_target(&self, name: &str) -> Result<&Target> {
        self.targets
            .get(name)
            .context(error::UnknownTargetSnafu { name })
    }
}

impl Role for Targets {
    const TYPE: RoleType = RoleType::Targets;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }

    fn spec_version(&self) -> &str {
        &self.spec_version
    }

    fn filename(&self, consistent_snapshot: bool) -> String {
        versioned_filename(Snapshot::TARGETS_META, self.version, consistent_snapshot)
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Points at the current snapshot. Short-lived and re-signed often.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "timestamp")]
pub struct Timestamp {
    /// The metadata format version, `1.0.0`.
    pub spec_version: String,

    /// Starts at 1 and increases by exactly one per publish or refresh.
    pub version: NonZeroU64,

    /// The instant after which clients refuse this document.
    pub expires: DateTime<Utc>,

    /// Holds exactly one entry, `snapshot.json`.
    pub meta: HashMap<String, TimestampMeta>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

/// The snapshot a timestamp points at.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TimestampMeta {
    /// Byte length of the snapshot file.
    pub length: u64,

    /// Digests of the snapshot file.
    pub hashes: Hashes,

    /// The version the snapshot must carry.
    pub version: NonZeroU64,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Timestamp {
    /// Key under which the snapshot is listed in `meta`.
    pub const SNAPSHOT_META: &'static str = "snapshot.json";

    /// Creates a new `Timestamp` object.
    pub fn new(version: NonZeroU64, expires: DateTime<Utc>) -> Self {
        Timestamp {
            spec_version: SPEC_VERSION.to_string(),
            version,
            expires,
            meta: HashMap::new(),
            _extra: HashMap::new(),
        }
    }

    /// The entry for the snapshot.
    pub fn snapshot_meta(&self) -> Result<&TimestampMeta> {
        self.meta
            .get(Self::SNAPSHOT_META)
            .context(error::MetaMissingSnafu {
                file: Self::SNAPSHOT_META,
                role: RoleType::Timestamp,
            })
    }
}

impl Role for Timestamp {
    const TYPE: RoleType = RoleType::Timestamp;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }

    fn spec_version(&self) -> &str {
        &self.spec_version
    }

    fn filename(&self, _consistent_snapshot: bool) -> String {
        "timestamp.json".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use maplit::hashmap;

    #[test]
    fn role_type_plain_strings() {
        assert_eq!(RoleType::Timestamp.to_string(), "timestamp");
        assert_eq!("snapshot".parse::<RoleType>().unwrap(), RoleType::Snapshot);
    }

    #[test]
    fn hashes_iterate_every_digest() {
        let hashes = Hashes::from_bytes(b"hello");
        let algorithms: Vec<_> = hashes.iter().map(|(alg, _)| alg).collect();
        assert_eq!(
            algorithms,
            vec![HashAlgorithm::Sha256, HashAlgorithm::Sha512]
        );
        assert_eq!(
            hashes.sha256.as_ref(),
            hex!("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert_eq!(Hashes::sha256_only(b"hello").iter().count(), 1);
    }

    #[test]
    fn consistent_filenames() {
        let expires = "2030-01-01T00:00:00Z".parse().unwrap();
        let version = NonZeroU64::new(7).unwrap();
        assert_eq!(
            Targets::new(version, expires).filename(true),
            "7.targets.json"
        );
        assert_eq!(Targets::new(version, expires).filename(false), "targets.json");
        assert_eq!(Snapshot::new(version, expires).filename(true), "7.snapshot.json");
        assert_eq!(Timestamp::new(version, expires).filename(true), "timestamp.json");
    }

    #[test]
    fn consistent_target_name() {
        let target = Target::from_bytes(b"hello");
        assert_eq!(
            target.stored_name("update-1.2.3.pkg", true),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824.update-1.2.3.pkg"
        );
        assert_eq!(target.stored_name("update-1.2.3.pkg", false), "update-1.2.3.pkg");
    }

    #[test]
    fn custom_metadata_is_signed_in_key_order() {
        let expires = "2030-01-01T00:00:00Z".parse().unwrap();
        let mut targets = Targets::new(NonZeroU64::new(1).unwrap(), expires);
        let mut target = Target::from_bytes(b"hello");
        target.custom = hashmap! {
            "version".to_string() => Value::from("1.2.3"),
            "channel".to_string() => Value::from("stable"),
        };
        targets.targets = hashmap! { "hello.txt".to_string() => target };

        let canonical = String::from_utf8(targets.canonical_form().unwrap()).unwrap();
        assert!(canonical.contains(r#""custom":{"channel":"stable","version":"1.2.3"}"#));

        let parsed: Targets = serde_json::from_str(&canonical).unwrap();
        assert_eq!(parsed.find_target("hello.txt").unwrap().custom["version"], "1.2.3");
        assert_eq!(
            parsed.find_target("missing").unwrap_err().kind(),
            crate::error::ErrorKind::UnknownTarget
        );
    }

    #[test]
    fn unsupported_spec_version() {
        let expires = "2030-01-01T00:00:00Z".parse().unwrap();
        let mut targets = Targets::new(NonZeroU64::new(1).unwrap(), expires);
        assert!(targets.check_spec_version().is_ok());
        targets.spec_version = "2.0.0".to_string();
        assert!(targets.check_spec_version().is_err());
    }
}
