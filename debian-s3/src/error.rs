// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use thiserror::Error;

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum DebS3Error {
    #[error("{0}")]
    AlreadyExists(String),

    #[error("control file parse error: {0}")]
    ControlParse(String),

    #[error("package version string does not match [epoch:]version[-iteration]: {0}")]
    VersionParse(String),

    #[error("required control field missing: {0}")]
    ControlRequiredFieldMissing(&'static str),

    #[error("{field} digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("package has no local file backing it: {0}")]
    PackageFileMissing(String),

    #[error("deb archive has no control archive member")]
    DebMissingControl,

    #[error("deb control archive has no control file")]
    DebControlFileMissing,

    #[error("unknown compression in deb archive member: {0}")]
    DebUnknownCompression(String),

    #[error("repository is locked by {0}")]
    LockHeld(String),

    #[error("repository lock is not held")]
    LockNotHeld,

    #[error("timed out waiting for repository lock held by {0}")]
    LockTimeout(String),

    #[error("release for {codename} does not reference {path}")]
    ReleaseIncomplete { codename: String, path: String },

    #[error("cannot add architecture 'all' packages when no other architectures exist")]
    ArchitectureAllWithoutManifests,

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("I/O error on path {0}: {1:?}")]
    RepositoryIoPath(String, std::io::Error),

    #[cfg(feature = "http")]
    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[cfg(feature = "http")]
    #[error("HTTP error: {0:?}")]
    Reqwest(#[from] reqwest::Error),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("integer parsing error: {0:?}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("{0}")]
    Other(String),
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, DebS3Error>;
