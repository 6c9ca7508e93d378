// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Path string normalization. */

use crate::error::{Result, VirtualTreeError};

/// Normalize a path relative to a tree root.
///
/// Leading and trailing `/` are stripped and repeated `/` collapse. The empty
/// string and `.` both denote the root, which normalizes to `.` regardless of
/// `with_prefix`. A single leading `./` is accepted so that normalizing an
/// already normalized path is a no-op. Any other `.` or `..` segment is an
/// error.
///
/// When `with_prefix` is true, non-root results start with `./`.
pub fn normalize_path(path: &str, with_prefix: bool) -> Result<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        return Ok(".".to_string());
    }

    let body = trimmed.strip_prefix("./").unwrap_or(trimmed);

    let mut segments = Vec::new();
    for segment in body.split('/') {
        match segment {
            "" => {}
            "." | ".." => return Err(VirtualTreeError::PathNotNormalized(path.to_string())),
            _ => segments.push(segment),
        }
    }

    if segments.is_empty() {
        return Ok(".".to_string());
    }

    let joined = segments.join("/");

    Ok(if with_prefix {
        format!("./{}", joined)
    } else {
        joined
    })
}

/// Split a normalized path into its directory and basename parts.
///
/// `./usr/bin/foo` becomes (`./usr/bin`, `foo`). A path without a `/` has the
/// directory `.`.
pub fn split_dirname_basename(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", basename)) => (".", basename),
        Some((dirname, basename)) => (dirname, basename),
        None => (".", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_root() -> Result<()> {
        for value in ["", ".", "/", "./", "//", ".//"] {
            assert_eq!(normalize_path(value, true)?, ".", "{:?}", value);
            assert_eq!(normalize_path(value, false)?, ".", "{:?}", value);
        }

        Ok(())
    }

    #[test]
    fn normalize_prefix() -> Result<()> {
        assert_eq!(normalize_path("usr/bin/foo", true)?, "./usr/bin/foo");
        assert_eq!(normalize_path("/usr/bin/foo/", true)?, "./usr/bin/foo");
        assert_eq!(normalize_path("./usr//bin", true)?, "./usr/bin");
        assert_eq!(normalize_path("./usr/bin", false)?, "usr/bin");
        assert_eq!(
            normalize_path(&normalize_path("a/b", true)?, true)?,
            "./a/b"
        );

        Ok(())
    }

    #[test]
    fn normalize_rejects_dots() {
        assert!(normalize_path("usr/../etc", true).is_err());
        assert!(normalize_path("usr/./bin", true).is_err());
        assert!(normalize_path("../etc", false).is_err());
    }

    #[test]
    fn split() {
        assert_eq!(split_dirname_basename("./usr/bin/foo"), ("./usr/bin", "foo"));
        assert_eq!(split_dirname_basename("./foo"), (".", "foo"));
        assert_eq!(split_dirname_basename("foo"), (".", "foo"));
        assert_eq!(split_dirname_basename("usr/foo"), ("usr", "foo"));
        assert_eq!(split_dirname_basename("/foo"), (".", "foo"));
    }
}
