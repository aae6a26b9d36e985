// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Maps `file://` URLs to local paths without undoing percent-encoding.
use std::path::PathBuf;
use url::Url;

/// Converts a file URL into a file path.
///
/// `url.to_file_path()` decodes percent-encoding, which would turn an encoded target name such
/// as `a%2F..%2Fb` back into a traversal. Published target files are stored under their encoded
/// names, so the encoded path is the one to open.
pub(crate) trait SafeUrlPath {
    /// Returns the path component of a URL as a filesystem path.
    fn safe_url_filepath(&self) -> PathBuf;
}

#[cfg(windows)]
impl SafeUrlPath for Url {
    fn safe_url_filepath(&self) -> PathBuf {
        let url_path = self.path();

        // Windows paths written as `file://` URLs carry a leading `/` before the drive letter.
        PathBuf::from(url_path.strip_prefix('/').unwrap_or(url_path))
    }
}

#[cfg(unix)]
impl SafeUrlPath for Url {
    fn safe_url_filepath(&self) -> PathBuf {
        PathBuf::from(self.path())
    }
}
