// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Built-in normalization of path modes.

After install rules are resolved, every path in a package tree gets a mode
from a fixed table of rules. Rules are tried in order and the first one that
selects a path decides its mode. Symlinks and paths with a mode set explicitly
by an install rule are left alone.
*/

use {
    crate::{
        error::{DebAssemblyError, Result},
        intermediate_manifest::PathType,
        path_matcher::MatchRule,
    },
    log::debug,
    once_cell::sync::Lazy,
    std::{
        collections::HashSet,
        fs::File,
        io::{ErrorKind, Read},
        path::Path,
    },
    virtual_file_tree::{NodeId, VirtualPath, VirtualTree},
};

static SHEBANG: Lazy<regex::bytes::Regex> = Lazy::new(|| {
    regex::bytes::Regex::new(r"^#!\s*/(?:usr/)?s?bin").expect("static regex should compile")
});

const FIXED_MODE_SUFFIXES: &[&str] = &[
    "*.so.*", "*.so", "*.la", "*.a", "*.js", "*.css", "*.scss", "*.sass", "*.jpeg", "*.jpg",
    "*.png", "*.gif", "*.cmxs", "*.node",
];

const NON_EXECUTABLE_TREES: &[&str] = &[
    "usr/share/man",
    "usr/include",
    "usr/share/applications",
    "usr/share/lintian/overrides",
];

const EXECUTABLE_DIRECTORIES: &[&str] = &[
    "usr/bin",
    "usr/bin/mh",
    "bin",
    "usr/sbin",
    "sbin",
    "usr/games",
    "usr/libexec",
    "etc/init.d",
];

/// How a rule changes the mode of the paths it selects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModeChange {
    /// Replace the mode.
    Fixed(u32),
    /// `a-w`
    RemoveWrite,
    /// `go=rX,u+rw,a-s`
    Standard,
}

impl ModeChange {
    pub fn apply(&self, mode: u32, is_directory: bool) -> u32 {
        match self {
            Self::Fixed(mode) => *mode,
            Self::RemoveWrite => mode & !0o222,
            Self::Standard => {
                let executable = is_directory || mode & 0o111 != 0;
                let mut mode = (mode & !0o7077) | 0o644;
                if executable {
                    mode |= 0o111;
                }
                mode
            }
        }
    }
}

#[derive(Clone, Debug)]
enum Selector {
    Pattern {
        rule: MatchRule,
        files_only: bool,
    },
    /// Files beneath `usr/share/doc`, except for `examples` directories of
    /// each documentation directory.
    DocumentationTrees,
    /// Regular files starting with a `#!` line for an interpreter in a `bin` directory.
    Shebang,
}

/// An entry in the built-in normalization table.
#[derive(Clone, Debug)]
pub struct ModeRule {
    selector: Selector,
    change: ModeChange,
}

impl ModeRule {
    fn pattern(rule: MatchRule, change: ModeChange) -> Self {
        Self {
            selector: Selector::Pattern {
                rule,
                files_only: false,
            },
            change,
        }
    }

    /// Like [Self::pattern] but never selects anything but regular files.
    fn files(rule: MatchRule, change: ModeChange) -> Self {
        Self {
            selector: Selector::Pattern {
                rule,
                files_only: true,
            },
            change,
        }
    }

    pub fn change(&self) -> ModeChange {
        self.change
    }

    /// Paths selected by this rule, skipping those in `handled`.
    fn select<'a>(&self, tree: &'a VirtualTree, handled: &HashSet<NodeId>) -> Result<Vec<VirtualPath<'a>>> {
        match &self.selector {
            Selector::Pattern { rule, files_only } => {
                let ignore = |p: &VirtualPath<'a>| {
                    handled.contains(&p.id()) || (*files_only && !p.is_file())
                };
                Ok(rule.find(tree.root(), Some(&ignore)))
            }
            Selector::DocumentationTrees => {
                let doc_root = match tree.lookup("usr/share/doc") {
                    Some(path) if path.is_dir() => path,
                    _ => return Ok(vec![]),
                };

                let mut selected = vec![];
                for child in doc_root.iterdir() {
                    if !child.is_dir() {
                        selected.push(child);
                        continue;
                    }
                    for entry in child.iterdir() {
                        if entry.is_dir() && entry.name() == "examples" {
                            continue;
                        }
                        selected.extend(entry.all_paths());
                    }
                }
                selected.retain(|p| p.is_file() && !handled.contains(&p.id()));

                Ok(selected)
            }
            Selector::Shebang => {
                let mut selected = vec![];
                for path in tree.root().all_paths() {
                    if !path.is_file() || handled.contains(&path.id()) {
                        continue;
                    }
                    if let Some(fs_path) = path.fs_path() {
                        if has_shebang(fs_path)? {
                            selected.push(path);
                        }
                    }
                }
                Ok(selected)
            }
        }
    }
}

/// Whether a file starts with a shebang for a `bin`/`sbin` interpreter.
///
/// Missing files are not scripts.
fn has_shebang(path: &Path) -> Result<bool> {
    let mut header = Vec::with_capacity(64);

    match File::open(path) {
        Ok(fh) => {
            fh.take(64)
                .read_to_end(&mut header)
                .map_err(|e| DebAssemblyError::filesystem("reading", path, e))?;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(DebAssemblyError::filesystem("opening", path, e)),
    }

    Ok(SHEBANG.is_match(&header))
}

/// The built-in rule table for a package.
///
/// The catch-all [ModeChange::Standard] is not part of the table; it applies
/// to whatever no rule selected.
pub fn builtin_mode_rules(package: &str) -> Result<Vec<ModeRule>> {
    const SOURCE: &str = "built-in mode normalization";

    let mut rules = vec![];

    for suffix in FIXED_MODE_SUFFIXES {
        rules.push(ModeRule::pattern(
            MatchRule::basename_glob(None, suffix, true, Some(PathType::File), SOURCE)?,
            ModeChange::Fixed(0o644),
        ));
    }

    for directory in NON_EXECUTABLE_TREES {
        rules.push(ModeRule::pattern(
            MatchRule::recursive_beneath_directory(directory, Some(PathType::File))?,
            ModeChange::Fixed(0o644),
        ));
    }

    for directory in EXECUTABLE_DIRECTORIES {
        rules.push(ModeRule::pattern(
            MatchRule::compile(&format!("{}/*", directory), SOURCE, Some(PathType::File))?,
            ModeChange::Fixed(0o755),
        ));
    }

    rules.push(ModeRule::pattern(
        MatchRule::compile("etc/sudoers.d/*", SOURCE, Some(PathType::File))?,
        ModeChange::Fixed(0o440),
    ));

    // reportbug: either a single script or a directory of presets with an
    // optional script.
    let bug_dir = format!("usr/share/bug/{}", package);
    rules.push(ModeRule::files(
        MatchRule::compile(&bug_dir, SOURCE, Some(PathType::File))?,
        ModeChange::Fixed(0o755),
    ));
    rules.push(ModeRule::files(
        MatchRule::compile(&format!("{}/script", bug_dir), SOURCE, Some(PathType::File))?,
        ModeChange::Fixed(0o755),
    ));
    rules.push(ModeRule::pattern(
        MatchRule::recursive_beneath_directory(&bug_dir, Some(PathType::File))?,
        ModeChange::Fixed(0o644),
    ));

    rules.push(ModeRule {
        selector: Selector::DocumentationTrees,
        change: ModeChange::Fixed(0o644),
    });

    rules.push(ModeRule::pattern(
        MatchRule::basename_glob(Some("usr/lib"), "*.ali", true, Some(PathType::File), SOURCE)?,
        ModeChange::RemoveWrite,
    ));

    rules.push(ModeRule {
        selector: Selector::Shebang,
        change: ModeChange::Fixed(0o755),
    });

    Ok(rules)
}

/// Apply built-in mode normalization to a package tree.
pub fn normalize_modes(tree: &mut VirtualTree, package: &str) -> Result<()> {
    let rules = builtin_mode_rules(package)?;

    let mut handled = tree
        .root()
        .all_paths()
        .into_iter()
        .filter(|p| p.is_symlink() || p.has_explicit_mode())
        .map(|p| p.id())
        .collect::<HashSet<_>>();

    let mut changes = vec![];

    for rule in &rules {
        for path in rule.select(tree, &handled)? {
            changes.push((path.id(), rule.change.apply(path.mode(), path.is_dir())));
        }
        handled.extend(changes.iter().map(|(id, _)| *id));
    }

    for path in tree.root().all_paths() {
        if !handled.contains(&path.id()) {
            changes.push((path.id(), ModeChange::Standard.apply(path.mode(), path.is_dir())));
        }
    }

    for (id, mode) in changes {
        let path = tree.path(id);
        if path.mode() != mode {
            debug!("{}: mode of {} {:o} -> {:o}", package, path.path(), path.mode(), mode);
            tree.set_mode(id, mode);
        }
    }

    Ok(())
}
