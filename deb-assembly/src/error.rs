// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use {
    std::path::{Path, PathBuf},
    thiserror::Error,
    virtual_file_tree::VirtualTreeError,
};

const EIO: i32 = 5;
const ENOSPC: i32 = 28;
const EROFS: i32 = 30;

/// Render an I/O error, giving dedicated wording to out-of-space, read-only and device errors.
pub fn describe_io_error(err: &std::io::Error) -> String {
    match err.raw_os_error() {
        Some(ENOSPC) => "no space left on device (is the disk full?)".to_string(),
        Some(EROFS) => "the file system is read-only".to_string(),
        Some(EIO) => "the device reported an I/O error (possibly failing hardware)".to_string(),
        _ => err.to_string(),
    }
}

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum DebAssemblyError {
    #[error("virtual file tree error: {0}")]
    VirtualTree(#[from] VirtualTreeError),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("invalid value for {0}: {1:?}")]
    InvalidEnvironmentValue(&'static str, String),

    #[error("unknown compression: {0}")]
    UnknownCompression(String),

    #[error("unknown compression strategy: {0}")]
    UnknownCompressionStrategy(String),

    #[error("the compression {compression} does not support the strategy {strategy}")]
    UnsupportedCompressionStrategy {
        compression: &'static str,
        strategy: &'static str,
    },

    #[error("the compression {compression} does not accept level {level}")]
    InvalidCompressionLevel {
        compression: &'static str,
        level: u32,
    },

    #[error(
        "the pattern {pattern:?} ({definition_source}) uses brace expansion in {fragment:?}, which is \
         not supported; to match a literal brace, escape it like {suggestion:?}"
    )]
    BraceExpansionUnsupported {
        pattern: String,
        definition_source: String,
        fragment: String,
        suggestion: String,
    },

    #[error(
        "the pattern {pattern:?} ({definition_source}) uses \"**\" where it is not supported; \
         only a leading \"**/\" before a basename pattern can be used"
    )]
    RecursiveGlobUnsupported {
        pattern: String,
        definition_source: String,
    },

    #[error("the pattern {pattern:?} ({definition_source}) is not a valid glob: {message}")]
    InvalidGlob {
        pattern: String,
        definition_source: String,
        message: String,
    },

    #[error("invalid intermediate manifest: {0}")]
    InvalidManifest(String),

    #[error("hardlinks are not supported: {0}")]
    HardlinkUnsupported(String),

    #[error("{definition_source}: {message}")]
    NoMatchForInstallPattern {
        definition_source: String,
        message: String,
    },

    #[error(
        "{definition_source}: the path {path} was already installed into {packages} by another rule"
    )]
    PathAlreadyInstalled {
        path: String,
        packages: String,
        definition_source: String,
    },

    #[error("{definition_source}: the path {path} was excluded by an earlier discard rule")]
    PathExcluded {
        path: String,
        definition_source: String,
    },

    #[error(
        "{definition_source}: the pattern {pattern:?} must match exactly one path for {package}; \
         it matched {matches}"
    )]
    InstallAsMultipleMatches {
        pattern: String,
        package: String,
        matches: String,
        definition_source: String,
    },

    #[error(
        "{definition_source}: cannot install {source_path} as {destination} in {package}; \
         the destination is a directory"
    )]
    DestinationIsDirectory {
        source_path: String,
        destination: String,
        package: String,
        definition_source: String,
    },

    #[error("{definition_source}: invalid destination {destination:?}: {reason}")]
    InvalidDestination {
        destination: String,
        reason: String,
        definition_source: String,
    },

    #[error("{definition_source}: unknown binary package {package}")]
    UnknownPackage {
        package: String,
        definition_source: String,
    },

    #[error("{action} {}: {}", .path.display(), describe_io_error(.source))]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(
        "{member} is a {expected} in the manifest but its source {} is a {actual}",
        .fs_path.display()
    )]
    FsPathTypeMismatch {
        member: String,
        fs_path: PathBuf,
        expected: &'static str,
        actual: &'static str,
    },

    #[error(
        "the output directory {} already exists; remove it or request that it be discarded",
        .0.display()
    )]
    OutputExists(PathBuf),

    #[error(
        "the directory {} does not look like a package root dir (there is no control file)",
        .0.display()
    )]
    MissingControlFile(PathBuf),

    #[error(
        "changing the ownership of {} succeeded but stat reports different ownership; this is \
         most likely a fakeroot bug",
        .0.display()
    )]
    OwnershipNotApplied(PathBuf),

    #[error("could not execute `{command}`: {source}")]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` failed: {status}")]
    CommandFailed { command: String, status: String },

    #[error("{0}")]
    RootRequired(String),

    #[error(
        "DEB_RULES_REQUIRES_ROOT contains {0} but DEB_GAIN_ROOT_CMD is not set; the build \
         driver must provide a gain-root command"
    )]
    GainRootCommandMissing(&'static str),

    #[error("control file parse error: {0}")]
    ControlParse(String),

    #[error("required field missing in binary package control file: {0}")]
    ControlRequiredFieldMissing(&'static str),
}

impl DebAssemblyError {
    /// Construct a [DebAssemblyError::Filesystem] for a failed operation on a path.
    pub fn filesystem(action: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Filesystem {
            action,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, DebAssemblyError>;
