// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compilation and evaluation of glob-like path patterns.
//!
//! Install rules name their sources with patterns such as `usr/bin/foo`,
//! `usr/lib/*.so` or `**/*.la`. A pattern compiles into a [MatchRule], and the
//! variant chosen determines how much of a [VirtualTree] has to be walked to
//! evaluate it:
//!
//! * [MatchRule::ExactFileSystemPath]: a single lookup.
//! * [MatchRule::DirectoryBasedMatch]: a listing of one directory, or a walk of
//!   one subtree.
//! * [MatchRule::BasenameGlobMatch]: a basename filter over one directory or the
//!   entire tree.
//! * [MatchRule::GenericGlob]: a segment-by-segment walk.
//! * [MatchRule::MatchAnything]: everything.
//!
//! Only `*`, `?` and `[...]` are glob syntax. `**` may only appear as a leading
//! `**/` in front of a basename pattern. Brace expansion is rejected.
//!
//! [VirtualTree]: virtual_file_tree::VirtualTree

use {
    crate::{
        error::{DebAssemblyError, Result},
        intermediate_manifest::PathType,
    },
    once_cell::sync::Lazy,
    regex::Regex,
    std::fmt::{Display, Formatter},
    virtual_file_tree::{normalize_path, split_dirname_basename, VirtualPath},
};

static BRACE_EXPANSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[{][^},.]*(?:,|[.][.])[^},.]*[}]").expect("static regex should compile")
});

static BRACKET_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]").expect("static regex should compile"));

/// Whether a string contains glob metacharacters.
pub fn has_glob_magic(value: &str) -> bool {
    value.contains(|c| matches!(c, '*' | '?' | '['))
}

/// Translate a glob into an anchored regular expression.
///
/// `*` and `?` match any character including `/` and a leading `.`. An unclosed
/// `[` is literal.
pub fn glob_to_regex(glob: &str) -> String {
    let chars = glob.chars().collect::<Vec<_>>();
    let mut out = String::from("^(?s:");
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        i += 1;

        match c {
            '*' => {
                while i < chars.len() && chars[i] == '*' {
                    i += 1;
                }
                out.push_str(".*");
            }
            '?' => out.push('.'),
            '[' => {
                let mut j = i;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }

                if j >= chars.len() {
                    out.push_str(r"\[");
                } else {
                    let mut class = &chars[i..j];
                    i = j + 1;

                    out.push('[');
                    if class.first() == Some(&'!') {
                        out.push('^');
                        class = &class[1..];
                    }
                    for ch in class {
                        if matches!(ch, '\\' | '[' | ']' | '&' | '~' | '^') {
                            out.push('\\');
                        }
                        out.push(*ch);
                    }
                    out.push(']');
                }
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }

    out.push_str(")$");
    out
}

/// A compiled basename pattern.
///
/// Simple forms avoid regular expressions entirely.
#[derive(Clone, Debug)]
pub enum BasenameMatcher {
    Literal(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    Regex(Regex),
}

impl PartialEq for BasenameMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Literal(a), Self::Literal(b))
            | (Self::Prefix(a), Self::Prefix(b))
            | (Self::Suffix(a), Self::Suffix(b))
            | (Self::Contains(a), Self::Contains(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl BasenameMatcher {
    /// Compile a glob without `/`.
    pub fn compile(glob: &str) -> std::result::Result<Self, regex::Error> {
        if !has_glob_magic(glob) {
            return Ok(Self::Literal(glob.to_string()));
        }

        if let Some(rest) = glob.strip_prefix('*') {
            if let Some(middle) = rest.strip_suffix('*') {
                if !has_glob_magic(middle) {
                    return Ok(Self::Contains(middle.to_string()));
                }
            } else if !has_glob_magic(rest) {
                return Ok(Self::Suffix(rest.to_string()));
            }
        } else if let Some(prefix) = glob.strip_suffix('*') {
            if !has_glob_magic(prefix) {
                return Ok(Self::Prefix(prefix.to_string()));
            }
        }

        Ok(Self::Regex(Regex::new(&glob_to_regex(glob))?))
    }

    pub fn is_match(&self, name: &str) -> bool {
        match self {
            Self::Literal(value) => name == value,
            Self::Prefix(value) => name.starts_with(value.as_str()),
            Self::Suffix(value) => name.ends_with(value.as_str()),
            Self::Contains(value) => name.contains(value.as_str()),
            Self::Regex(re) => re.is_match(name),
        }
    }
}

/// Which part of a directory a [MatchRule::DirectoryBasedMatch] covers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DirectoryScope {
    DirectChildren,
    AnythingBeneath,
}

/// One segment of a [MatchRule::GenericGlob].
#[derive(Clone, Debug, PartialEq)]
pub enum GlobSegment {
    Literal(String),
    Pattern(BasenameMatcher),
}

/// A compiled path pattern.
#[derive(Clone, Debug, PartialEq)]
pub enum MatchRule {
    /// Every path except the root.
    MatchAnything,

    /// A single path. `path` is normalized with a `./` prefix.
    ExactFileSystemPath { path: String },

    /// Children of a directory, or everything beneath it.
    DirectoryBasedMatch {
        directory: String,
        scope: DirectoryScope,
        path_type: Option<PathType>,
    },

    /// Paths whose basename matches a pattern.
    ///
    /// Without a directory the whole tree is searched. With one, `recursive`
    /// decides between its children and everything beneath it.
    BasenameGlobMatch {
        basename_glob: String,
        matcher: BasenameMatcher,
        directory: Option<String>,
        recursive: bool,
        path_type: Option<PathType>,
    },

    /// A pattern evaluated one path segment at a time.
    GenericGlob {
        glob: String,
        segments: Vec<GlobSegment>,
        path_type: Option<PathType>,
    },
}

impl MatchRule {
    /// Compile a user supplied pattern.
    ///
    /// `definition_source` describes where the pattern came from and is only
    /// used for diagnostics.
    pub fn compile(
        pattern: &str,
        definition_source: &str,
        path_type: Option<PathType>,
    ) -> Result<Self> {
        if matches!(pattern, "*" | "**/*" | "." | "/") {
            return Ok(match path_type {
                None => Self::MatchAnything,
                Some(path_type) => Self::recursive_beneath_directory(".", Some(path_type))?,
            });
        }

        check_brace_expansion(pattern, definition_source)?;

        let normalized = normalize_path(pattern, true)?;
        if !has_glob_magic(&normalized) {
            return Ok(Self::ExactFileSystemPath { path: normalized });
        }

        let (directory, basename) = split_dirname_basename(&normalized);

        if (directory.contains("**") && directory != "./**") || basename.contains("**") {
            return Err(DebAssemblyError::RecursiveGlobUnsupported {
                pattern: pattern.to_string(),
                definition_source: definition_source.to_string(),
            });
        }

        let invalid_glob = |e: regex::Error| DebAssemblyError::InvalidGlob {
            pattern: pattern.to_string(),
            definition_source: definition_source.to_string(),
            message: e.to_string(),
        };

        if basename == "*" && !has_glob_magic(directory) {
            return Ok(Self::DirectoryBasedMatch {
                directory: directory.to_string(),
                scope: DirectoryScope::DirectChildren,
                path_type,
            });
        }

        if directory == "./**" || !has_glob_magic(directory) {
            let matcher = BasenameMatcher::compile(basename).map_err(invalid_glob)?;
            let (directory, recursive) = if directory == "." || directory == "./**" {
                (None, true)
            } else {
                (Some(directory.to_string()), false)
            };

            return Ok(Self::BasenameGlobMatch {
                basename_glob: basename.to_string(),
                matcher,
                directory,
                recursive,
                path_type,
            });
        }

        let segments = normalized
            .trim_start_matches("./")
            .split('/')
            .map(|segment| {
                if has_glob_magic(segment) {
                    BasenameMatcher::compile(segment)
                        .map(GlobSegment::Pattern)
                        .map_err(invalid_glob)
                } else {
                    Ok(GlobSegment::Literal(segment.to_string()))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::GenericGlob {
            glob: normalized,
            segments,
            path_type,
        })
    }

    /// Match everything beneath a directory.
    pub fn recursive_beneath_directory(directory: &str, path_type: Option<PathType>) -> Result<Self> {
        Ok(Self::DirectoryBasedMatch {
            directory: normalize_path(directory, true)?,
            scope: DirectoryScope::AnythingBeneath,
            path_type,
        })
    }

    /// Match basenames within a directory, or the whole tree when `directory` is `None`.
    ///
    /// This allows the recursive form within a directory, which patterns
    /// cannot express.
    pub fn basename_glob(
        directory: Option<&str>,
        basename_glob: &str,
        recursive: bool,
        path_type: Option<PathType>,
        definition_source: &str,
    ) -> Result<Self> {
        let matcher =
            BasenameMatcher::compile(basename_glob).map_err(|e| DebAssemblyError::InvalidGlob {
                pattern: basename_glob.to_string(),
                definition_source: definition_source.to_string(),
                message: e.to_string(),
            })?;

        let directory = match directory {
            Some(directory) => match normalize_path(directory, true)? {
                root if root == "." => None,
                directory => Some(directory),
            },
            None => None,
        };

        Ok(Self::BasenameGlobMatch {
            basename_glob: basename_glob.to_string(),
            matcher,
            recursive: recursive || directory.is_none(),
            directory,
            path_type,
        })
    }

    /// Whether this rule names a single path without globbing.
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::ExactFileSystemPath { .. })
    }

    pub fn path_type(&self) -> Option<PathType> {
        match self {
            Self::MatchAnything | Self::ExactFileSystemPath { .. } => None,
            Self::DirectoryBasedMatch { path_type, .. }
            | Self::BasenameGlobMatch { path_type, .. }
            | Self::GenericGlob { path_type, .. } => *path_type,
        }
    }

    /// Evaluate the rule against the tree rooted at `root`.
    ///
    /// Paths for which `ignore` returns true are not returned. The root
    /// directory itself is never returned.
    pub fn find<'a>(
        &self,
        root: VirtualPath<'a>,
        ignore: Option<&dyn Fn(&VirtualPath<'a>) -> bool>,
    ) -> Vec<VirtualPath<'a>> {
        let candidates: Vec<VirtualPath<'a>> = match self {
            Self::MatchAnything => root.all_paths().into_iter().skip(1).collect(),
            Self::ExactFileSystemPath { path } => root.lookup(path).into_iter().collect(),
            Self::DirectoryBasedMatch {
                directory, scope, ..
            } => match root.lookup(directory) {
                Some(dir) if dir.is_dir() => match scope {
                    DirectoryScope::DirectChildren => dir.iterdir().collect(),
                    DirectoryScope::AnythingBeneath => {
                        dir.all_paths().into_iter().skip(1).collect()
                    }
                },
                _ => vec![],
            },
            Self::BasenameGlobMatch {
                matcher,
                directory,
                recursive,
                ..
            } => {
                let base = match directory {
                    Some(directory) => root.lookup(directory),
                    None => Some(root),
                };
                match base {
                    Some(base) if base.is_dir() => {
                        let paths: Vec<VirtualPath<'a>> = if *recursive {
                            base.all_paths().into_iter().skip(1).collect()
                        } else {
                            base.iterdir().collect()
                        };
                        paths
                            .into_iter()
                            .filter(|p| matcher.is_match(p.name()))
                            .collect()
                    }
                    _ => vec![],
                }
            }
            Self::GenericGlob { segments, .. } => {
                let mut current = vec![root];
                for segment in segments {
                    let mut next = vec![];
                    for dir in current.into_iter().filter(|p| p.is_dir()) {
                        match segment {
                            GlobSegment::Literal(name) => next.extend(dir.get(name)),
                            GlobSegment::Pattern(matcher) => {
                                next.extend(dir.iterdir().filter(|p| matcher.is_match(p.name())))
                            }
                        }
                    }
                    current = next;
                }
                current
            }
        };

        let path_type = self.path_type();

        candidates
            .into_iter()
            .filter(|p| !p.is_root())
            .filter(|p| path_type.map(|t| t.matches(p)).unwrap_or(true))
            .filter(|p| ignore.map(|f| !f(p)).unwrap_or(true))
            .collect()
    }

    /// A short human readable description.
    pub fn describe_match_short(&self) -> String {
        match self {
            Self::MatchAnything => "**/*".to_string(),
            Self::ExactFileSystemPath { path } => path.clone(),
            Self::DirectoryBasedMatch {
                directory, scope, ..
            } => match scope {
                DirectoryScope::DirectChildren => format!("{}/*", directory),
                DirectoryScope::AnythingBeneath => format!("{}/**/*", directory),
            },
            Self::BasenameGlobMatch {
                basename_glob,
                directory,
                recursive,
                ..
            } => match (directory, recursive) {
                (None, _) => format!("**/{}", basename_glob),
                (Some(directory), true) => format!("{}/**/{}", directory, basename_glob),
                (Some(directory), false) => format!("{}/{}", directory, basename_glob),
            },
            Self::GenericGlob { glob, .. } => glob.clone(),
        }
    }

    /// A description naming the match strategy and filters.
    pub fn describe_match_exact(&self) -> String {
        let type_filter = |path_type: &Option<PathType>| match path_type {
            Some(t) => format!(" (only {}s)", t),
            None => String::new(),
        };

        match self {
            Self::MatchAnything => "anything".to_string(),
            Self::ExactFileSystemPath { path } => format!("the path {}", path),
            Self::DirectoryBasedMatch {
                directory,
                scope,
                path_type,
            } => match scope {
                DirectoryScope::DirectChildren => format!(
                    "direct children of {}{}",
                    directory,
                    type_filter(path_type)
                ),
                DirectoryScope::AnythingBeneath => format!(
                    "anything beneath {}{}",
                    directory,
                    type_filter(path_type)
                ),
            },
            Self::BasenameGlobMatch {
                basename_glob,
                directory,
                recursive,
                path_type,
                ..
            } => {
                let scope = match (directory, recursive) {
                    (None, _) => "anywhere".to_string(),
                    (Some(directory), true) => format!("anywhere beneath {}", directory),
                    (Some(directory), false) => format!("directly in {}", directory),
                };
                format!(
                    "basename matching {} {}{}",
                    basename_glob,
                    scope,
                    type_filter(path_type)
                )
            }
            Self::GenericGlob {
                glob, path_type, ..
            } => format!("paths matching {}{}", glob, type_filter(path_type)),
        }
    }
}

impl Display for MatchRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe_match_short())
    }
}

fn check_brace_expansion(pattern: &str, definition_source: &str) -> Result<()> {
    // Braces inside a bracket class are literal.
    let without_classes = BRACKET_CLASS.replace_all(pattern, |caps: &regex::Captures| {
        "_".repeat(caps[0].len())
    });

    if let Some(m) = BRACE_EXPANSION.find(&without_classes) {
        let suggestion = format!("{}[{{]{}", &pattern[..m.start()], &pattern[m.start() + 1..]);
        return Err(DebAssemblyError::BraceExpansionUnsupported {
            pattern: pattern.to_string(),
            definition_source: definition_source.to_string(),
            fragment: pattern[m.start()..m.end()].to_string(),
            suggestion,
        });
    }

    Ok(())
}
