// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use thiserror::Error;

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum VirtualTreeError {
    #[error("please provide paths that are normalized (no \".\" or \"..\" segments); offending input \"{0}\"")]
    PathNotNormalized(String),

    #[error("invalid name for a path segment: {0:?}")]
    InvalidName(String),

    #[error("path already exists: {0}")]
    AlreadyExists(String),

    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("the root directory cannot be removed")]
    RemoveRoot,

    #[error("unsupported file type at {0}; only regular files, directories and symlinks are supported")]
    UnsupportedFileType(String),

    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),

    #[error("I/O error on {0}: {1}")]
    IoPath(String, std::io::Error),

    #[error("directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, VirtualTreeError>;
