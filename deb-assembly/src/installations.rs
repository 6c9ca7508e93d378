// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Resolution of install rules into per-package trees.

Install rules are applied in order and the first rule to match a path wins:
once claimed, a path is invisible to later glob rules and an error for later
exact rules. A rule that claims nothing is an error unless none of the packages
it targets are being built.

Sources are looked up in one or more [SearchDir], each of which is visible to a
set of packages. A rule targeting several packages installs each match into
every package that can see it.
*/

use {
    crate::{
        error::{DebAssemblyError, Result},
        intermediate_manifest::IntermediateManifest,
        mode_normalization::normalize_modes,
        path_matcher::MatchRule,
    },
    log::debug,
    std::{
        collections::{BTreeMap, BTreeSet, HashMap, HashSet},
        path::{Path, PathBuf},
    },
    virtual_file_tree::{
        normalize_path, split_dirname_basename, EntryKind, NodeId, Ownership, VirtualPath,
        VirtualTree,
    },
};

/// A binary package that rules can install into.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinaryPackage {
    pub name: String,
    pub is_udeb: bool,
    /// Whether the package is built in this run.
    pub should_be_acted_on: bool,
}

impl BinaryPackage {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            is_udeb: false,
            should_be_acted_on: true,
        }
    }

    pub fn udeb(mut self, value: bool) -> Self {
        self.is_udeb = value;
        self
    }

    pub fn acted_on(mut self, value: bool) -> Self {
        self.should_be_acted_on = value;
        self
    }
}

/// A source tree and the packages that may install from it.
#[derive(Clone, Debug)]
pub struct SearchDir<'t> {
    tree: &'t VirtualTree,
    applies_to: BTreeSet<String>,
}

impl<'t> SearchDir<'t> {
    pub fn new<S: ToString>(tree: &'t VirtualTree, applies_to: impl IntoIterator<Item = S>) -> Self {
        Self {
            tree,
            applies_to: applies_to.into_iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A compiled source pattern, remembering how it was written.
#[derive(Clone, Debug, PartialEq)]
pub struct SourcePattern {
    raw: String,
    rule: MatchRule,
}

impl SourcePattern {
    pub fn compile(raw: &str, definition_source: &str) -> Result<Self> {
        Ok(Self {
            raw: raw.to_string(),
            rule: MatchRule::compile(raw, definition_source, None)?,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn rule(&self) -> &MatchRule {
        &self.rule
    }
}

/// Where a matched path is installed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Destination {
    /// A fixed path.
    Literal(String),
    /// A path with `{basename}`, `{dirname}` and `{package_name}` placeholders.
    Template(String),
}

/// Metadata a rule imposes on the paths it installs.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExplicitMetadata {
    pub mode: Option<u32>,
    pub ownership: Option<Ownership>,
}

#[derive(Clone, Debug, PartialEq)]
enum InstallRuleKind {
    Install {
        sources: Vec<SourcePattern>,
        destinations: Vec<Destination>,
        into: BTreeSet<String>,
        require_single_match: bool,
        metadata: ExplicitMetadata,
    },
    Discard {
        sources: Vec<SourcePattern>,
    },
}

/// A declarative install or discard rule.
#[derive(Clone, Debug, PartialEq)]
pub struct InstallRule {
    kind: InstallRuleKind,
    definition_source: String,
}

fn compile_sources(sources: &[&str], definition_source: &str) -> Result<Vec<SourcePattern>> {
    sources
        .iter()
        .map(|s| SourcePattern::compile(s, definition_source))
        .collect()
}

fn package_set<S: ToString>(into: impl IntoIterator<Item = S>) -> BTreeSet<String> {
    into.into_iter().map(|s| s.to_string()).collect()
}

impl InstallRule {
    fn install(
        sources: Vec<SourcePattern>,
        destinations: Vec<Destination>,
        into: BTreeSet<String>,
        require_single_match: bool,
        definition_source: &str,
    ) -> Self {
        Self {
            kind: InstallRuleKind::Install {
                sources,
                destinations,
                into,
                require_single_match,
                metadata: ExplicitMetadata::default(),
            },
            definition_source: definition_source.to_string(),
        }
    }

    /// Install one path under a new name. The source must match exactly one path.
    pub fn install_as<S: ToString>(
        source: &str,
        dest: &str,
        into: impl IntoIterator<Item = S>,
        definition_source: &str,
    ) -> Result<Self> {
        if dest.ends_with('/') {
            return Err(DebAssemblyError::InvalidDestination {
                destination: dest.to_string(),
                reason: "the destination of an install-as rule must not end with \"/\"".to_string(),
                definition_source: definition_source.to_string(),
            });
        }

        Ok(Self::install(
            compile_sources(&[source], definition_source)?,
            vec![Destination::Literal(dest.to_string())],
            package_set(into),
            true,
            definition_source,
        ))
    }

    /// Install paths into `dest_dir`, or at their source location when absent.
    pub fn install_dest<S: ToString>(
        sources: &[&str],
        dest_dir: Option<&str>,
        into: impl IntoIterator<Item = S>,
        definition_source: &str,
    ) -> Result<Self> {
        let template = match dest_dir {
            Some(dir) => format!("{}/{{basename}}", dir.trim_end_matches('/')),
            None => "{dirname}/{basename}".to_string(),
        };

        Ok(Self::install(
            compile_sources(sources, definition_source)?,
            vec![Destination::Template(template)],
            package_set(into),
            false,
            definition_source,
        ))
    }

    /// Install documentation into the package's doc directory.
    pub fn install_doc<S: ToString>(
        sources: &[&str],
        dest_dir: Option<&str>,
        into: impl IntoIterator<Item = S>,
        definition_source: &str,
    ) -> Result<Self> {
        let dest_dir = dest_dir.unwrap_or("usr/share/doc/{package_name}");
        Self::install_dest(sources, Some(dest_dir), into, definition_source)
    }

    /// Install examples into the package's doc directory.
    pub fn install_examples<S: ToString>(
        sources: &[&str],
        into: impl IntoIterator<Item = S>,
        definition_source: &str,
    ) -> Result<Self> {
        Self::install_dest(
            sources,
            Some("usr/share/doc/{package_name}/examples"),
            into,
            definition_source,
        )
    }

    /// Exclude paths from all later rules.
    pub fn discard(sources: &[&str], definition_source: &str) -> Result<Self> {
        Ok(Self {
            kind: InstallRuleKind::Discard {
                sources: compile_sources(sources, definition_source)?,
            },
            definition_source: definition_source.to_string(),
        })
    }

    /// Impose a mode and/or ownership on installed paths.
    ///
    /// Explicit modes are not changed by mode normalization. Has no effect on
    /// discard rules.
    pub fn with_metadata(mut self, explicit: ExplicitMetadata) -> Self {
        if let InstallRuleKind::Install { metadata, .. } = &mut self.kind {
            *metadata = explicit;
        }
        self
    }

    pub fn definition_source(&self) -> &str {
        &self.definition_source
    }
}

/// Render a destination for a matched path.
///
/// The result is normalized without a `./` prefix.
fn render_destination(
    destination: &Destination,
    source: &VirtualPath,
    package: &str,
    definition_source: &str,
) -> Result<String> {
    let rendered = match destination {
        Destination::Literal(path) => path.clone(),
        Destination::Template(template) => {
            let dirname = source
                .parent()
                .map(|p| p.relative_path())
                .unwrap_or_default();
            template
                .replace("{basename}", source.name())
                .replace("{dirname}", &dirname)
                .replace("{package_name}", package)
        }
    };

    let invalid = |reason: &str| DebAssemblyError::InvalidDestination {
        destination: rendered.clone(),
        reason: reason.to_string(),
        definition_source: definition_source.to_string(),
    };

    if rendered.ends_with('/') {
        return Err(invalid("destinations must not end with \"/\""));
    }

    let normalized = normalize_path(&rendered, false)?;
    if normalized == "." {
        return Err(invalid("cannot install as the root directory"));
    }

    Ok(normalized)
}

/// Identity of a source path for claim tracking.
///
/// Backed paths are identified by their location on disk so the same file seen
/// through two search directories is only claimed once.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum ClaimKey {
    FsPath(PathBuf),
    Virtual(usize, String),
}

fn claim_key(path: &VirtualPath, search_dir: usize) -> ClaimKey {
    match path.fs_path() {
        Some(p) => ClaimKey::FsPath(p.to_path_buf()),
        None => ClaimKey::Virtual(search_dir, path.path()),
    }
}

#[derive(Debug, Default)]
struct PathClaims {
    installed: HashMap<ClaimKey, BTreeSet<String>>,
    excluded: HashSet<ClaimKey>,
}

impl PathClaims {
    /// Whether the path or any of its parents was discarded.
    fn is_excluded(&self, path: &VirtualPath, search_dir: usize) -> bool {
        let mut current = Some(*path);
        while let Some(p) = current {
            if self.excluded.contains(&claim_key(&p, search_dir)) {
                return true;
            }
            current = p.parent();
        }
        false
    }

    fn is_claimed(&self, path: &VirtualPath, search_dir: usize) -> bool {
        self.installed.contains_key(&claim_key(path, search_dir)) || self.is_excluded(path, search_dir)
    }
}

struct PathMatch<'t> {
    path: VirtualPath<'t>,
    search_dir: usize,
    into: BTreeSet<String>,
}

/// Applies install rules to source trees, building one tree per package.
pub struct InstallationResolver<'t> {
    packages: BTreeMap<String, BinaryPackage>,
    search_dirs: Vec<SearchDir<'t>>,
    claims: PathClaims,
    package_trees: BTreeMap<String, VirtualTree>,
}

impl<'t> InstallationResolver<'t> {
    pub fn new(
        packages: impl IntoIterator<Item = BinaryPackage>,
        search_dirs: Vec<SearchDir<'t>>,
    ) -> Self {
        let packages = packages
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect::<BTreeMap<_, _>>();
        let package_trees = packages
            .keys()
            .map(|name| (name.clone(), VirtualTree::new()))
            .collect();

        Self {
            packages,
            search_dirs,
            claims: PathClaims::default(),
            package_trees,
        }
    }

    /// Apply rules in order.
    pub fn apply_rules(&mut self, rules: &[InstallRule]) -> Result<()> {
        for rule in rules {
            self.apply_rule(rule)?;
        }

        Ok(())
    }

    pub fn apply_rule(&mut self, rule: &InstallRule) -> Result<()> {
        let definition_source = rule.definition_source.as_str();

        match &rule.kind {
            InstallRuleKind::Discard { sources } => {
                for source in sources {
                    let matches = self.find_and_claim(source, None, definition_source)?;
                    debug!(
                        "{}: discarded {} paths matching {}",
                        definition_source,
                        matches.len(),
                        source.raw
                    );
                }
                Ok(())
            }
            InstallRuleKind::Install {
                sources,
                destinations,
                into,
                require_single_match,
                metadata,
            } => {
                for package in into {
                    if !self.packages.contains_key(package) {
                        return Err(DebAssemblyError::UnknownPackage {
                            package: package.clone(),
                            definition_source: definition_source.to_string(),
                        });
                    }
                }

                let mut matches = vec![];
                for source in sources {
                    let found = self.find_and_claim(source, Some(into), definition_source)?;
                    if *require_single_match {
                        check_single_match(source, &found, definition_source)?;
                    }
                    matches.extend(found);
                }

                self.install_matches(matches, destinations, metadata, definition_source)
            }
        }
    }

    fn any_active(&self, packages: &BTreeSet<String>) -> bool {
        packages
            .iter()
            .any(|p| self.packages.get(p).map(|p| p.should_be_acted_on).unwrap_or(false))
    }

    /// Evaluate a pattern against all visible search directories, claiming matches.
    ///
    /// `into` of `None` denotes a discard rule.
    fn find_and_claim(
        &mut self,
        source: &SourcePattern,
        into: Option<&BTreeSet<String>>,
        definition_source: &str,
    ) -> Result<Vec<PathMatch<'t>>> {
        let exact = source.rule.is_exact();
        let mut missing = into.cloned().unwrap_or_default();
        let mut results = vec![];
        let mut already_installed = 0;
        let mut already_excluded = 0;

        for (index, search_dir) in self.search_dirs.iter().enumerate() {
            let applicable = match into {
                Some(_) => {
                    let applicable = search_dir
                        .applies_to
                        .intersection(&missing)
                        .cloned()
                        .collect::<BTreeSet<_>>();
                    if applicable.is_empty() {
                        continue;
                    }
                    applicable
                }
                None => BTreeSet::new(),
            };

            let mut matched = false;

            for path in source.rule.find(search_dir.tree.root(), None) {
                let key = claim_key(&path, index);

                if let Some(packages) = self.claims.installed.get(&key) {
                    if exact {
                        return Err(DebAssemblyError::PathAlreadyInstalled {
                            path: path.path(),
                            packages: packages.iter().cloned().collect::<Vec<_>>().join(", "),
                            definition_source: definition_source.to_string(),
                        });
                    }
                    already_installed += 1;
                    continue;
                }

                if self.claims.is_excluded(&path, index) {
                    if exact && into.is_some() {
                        return Err(DebAssemblyError::PathExcluded {
                            path: path.path(),
                            definition_source: definition_source.to_string(),
                        });
                    }
                    already_excluded += 1;
                    continue;
                }

                if into.is_some() {
                    self.claims.installed.insert(key, applicable.clone());
                } else {
                    self.claims.excluded.insert(key);
                }

                matched = true;
                results.push(PathMatch {
                    path,
                    search_dir: index,
                    into: applicable.clone(),
                });
            }

            if matched && into.is_some() {
                missing = missing.difference(&applicable).cloned().collect();
                if missing.is_empty() {
                    break;
                }
            }
        }

        if let Some(into) = into {
            if results.is_empty() && self.any_active(into) {
                return Err(no_match_error(
                    source,
                    already_installed,
                    already_excluded,
                    definition_source,
                ));
            }
        }

        Ok(results)
    }

    fn install_matches(
        &mut self,
        matches: Vec<PathMatch<'t>>,
        destinations: &[Destination],
        metadata: &ExplicitMetadata,
        definition_source: &str,
    ) -> Result<()> {
        for m in matches {
            let active = m
                .into
                .iter()
                .filter(|p| self.packages.get(*p).map(|p| p.should_be_acted_on).unwrap_or(false))
                .cloned()
                .collect::<Vec<_>>();

            let mut targets = vec![];
            for package in &active {
                for destination in destinations {
                    targets.push((
                        package.clone(),
                        render_destination(destination, &m.path, package, definition_source)?,
                    ));
                }
            }

            // A backing file can only be moved if it ends up in one place.
            let allow_steal = targets.len() == 1;
            let mut directory_targets = vec![];

            for (package, destination) in targets {
                let tree = self.package_tree_mut(&package, definition_source)?;
                let (dirname, basename) = split_dirname_basename(&destination);
                let parent = tree.mkdirs(dirname)?;
                let id = place_entry(
                    tree,
                    parent,
                    basename,
                    &m.path,
                    allow_steal,
                    &package,
                    definition_source,
                )?;

                if let Some(mode) = metadata.mode {
                    tree.set_explicit_mode(id, mode);
                }
                if let Some(ownership) = &metadata.ownership {
                    tree.set_ownership(id, ownership.clone());
                }

                debug!(
                    "{}: installing {} as {} in {}",
                    definition_source,
                    m.path.path(),
                    destination,
                    package
                );

                if m.path.is_dir() {
                    directory_targets.push((package, id));
                }
            }

            if !directory_targets.is_empty() {
                self.install_directory_recursively(
                    &m,
                    directory_targets,
                    allow_steal,
                    definition_source,
                )?;
            }
        }

        Ok(())
    }

    /// Install the unclaimed contents of a matched directory, claiming them.
    fn install_directory_recursively(
        &mut self,
        m: &PathMatch<'t>,
        targets: Vec<(String, NodeId)>,
        allow_steal: bool,
        definition_source: &str,
    ) -> Result<()> {
        let mut stack = vec![(m.path, targets)];

        while let Some((source_dir, targets)) = stack.pop() {
            for child in source_dir.iterdir() {
                if self.claims.is_claimed(&child, m.search_dir) {
                    continue;
                }
                self.claims
                    .installed
                    .insert(claim_key(&child, m.search_dir), m.into.clone());

                let mut child_targets = vec![];
                for (package, parent) in &targets {
                    let tree = self.package_tree_mut(package, definition_source)?;
                    let id = place_entry(
                        tree,
                        *parent,
                        child.name(),
                        &child,
                        allow_steal,
                        package,
                        definition_source,
                    )?;
                    child_targets.push((package.clone(), id));
                }

                if child.is_dir() {
                    stack.push((child, child_targets));
                }
            }
        }

        Ok(())
    }

    fn package_tree_mut(&mut self, package: &str, definition_source: &str) -> Result<&mut VirtualTree> {
        self.package_trees
            .get_mut(package)
            .ok_or_else(|| DebAssemblyError::UnknownPackage {
                package: package.to_string(),
                definition_source: definition_source.to_string(),
            })
    }

    /// The tree built so far for a package.
    pub fn package_tree(&self, package: &str) -> Option<&VirtualTree> {
        self.package_trees.get(package)
    }

    /// Source paths that no rule installed or discarded.
    ///
    /// Directories are only reported when they are empty; a directory with
    /// content is represented by its unclaimed descendants.
    pub fn detect_missing(&self) -> Vec<VirtualPath<'t>> {
        let mut missing = vec![];

        for (index, search_dir) in self.search_dirs.iter().enumerate() {
            for path in search_dir.tree.root().all_paths().into_iter().skip(1) {
                if self.claims.is_claimed(&path, index) {
                    continue;
                }
                if path.is_dir() && path.iterdir().next().is_some() {
                    continue;
                }
                missing.push(path);
            }
        }

        missing
    }

    /// Consume the resolver, returning the tree of every package.
    pub fn into_package_trees(self) -> BTreeMap<String, VirtualTree> {
        self.package_trees
    }
}

fn no_match_error(
    source: &SourcePattern,
    already_installed: usize,
    already_excluded: usize,
    definition_source: &str,
) -> DebAssemblyError {
    let message = match (already_installed, already_excluded) {
        (0, 0) => format!(
            "there were no matches for {} (matching {})",
            source.raw,
            source.rule.describe_match_exact()
        ),
        (installed, 0) => format!(
            "all paths matched by {} ({} in total) were already installed by earlier rules",
            source.raw, installed
        ),
        (0, excluded) => format!(
            "all paths matched by {} ({} in total) were excluded by earlier discard rules",
            source.raw, excluded
        ),
        (installed, excluded) => format!(
            "all paths matched by {} were already claimed: {} installed by earlier rules and \
             {} excluded by discard rules",
            source.raw, installed, excluded
        ),
    };

    DebAssemblyError::NoMatchForInstallPattern {
        definition_source: definition_source.to_string(),
        message,
    }
}

fn check_single_match(
    source: &SourcePattern,
    matches: &[PathMatch],
    definition_source: &str,
) -> Result<()> {
    let mut per_package: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for m in matches {
        for package in &m.into {
            per_package
                .entry(package.as_str())
                .or_default()
                .push(m.path.path());
        }
    }

    for (package, paths) in per_package {
        if paths.len() > 1 {
            return Err(DebAssemblyError::InstallAsMultipleMatches {
                pattern: source.raw.clone(),
                package: package.to_string(),
                matches: paths.join(", "),
                definition_source: definition_source.to_string(),
            });
        }
    }

    Ok(())
}

/// Create a copy of `source` named `name` beneath `parent`.
///
/// An existing directory is reused when installing a directory. An existing
/// non-directory is replaced. Installing a non-directory over a directory is an
/// error.
fn place_entry(
    tree: &mut VirtualTree,
    parent: NodeId,
    name: &str,
    source: &VirtualPath,
    allow_steal: bool,
    package: &str,
    definition_source: &str,
) -> Result<NodeId> {
    let existing = tree
        .path(parent)
        .get(name)
        .map(|p| (p.id(), p.is_dir(), p.path()));

    match existing {
        Some((id, true, _)) if source.is_dir() => return Ok(id),
        Some((_, true, destination)) => {
            return Err(DebAssemblyError::DestinationIsDirectory {
                source_path: source.path(),
                destination,
                package: package.to_string(),
                definition_source: definition_source.to_string(),
            });
        }
        Some((id, false, _)) => tree.remove(id)?,
        None => {}
    }

    let metadata = source.metadata().clone();

    Ok(match source.kind() {
        EntryKind::Directory => tree.create_directory(parent, name, metadata)?,
        EntryKind::Symlink => tree.create_symlink(
            parent,
            name,
            source.link_target().unwrap_or_default().to_string(),
            metadata,
        )?,
        EntryKind::File => {
            let id = tree.create_file(
                parent,
                name,
                source.fs_path().map(Path::to_path_buf),
                metadata,
            )?;
            tree.set_may_steal(id, allow_steal && source.may_steal_fs_path());
            id
        }
    })
}

/// Resolve rules and produce the intermediate manifest of every package.
///
/// Built-in mode normalization runs on each package tree before the manifest
/// is generated. `clamp_mtime` is usually `SOURCE_DATE_EPOCH`.
pub fn resolve_intermediate_manifests(
    packages: &[BinaryPackage],
    search_dirs: Vec<SearchDir>,
    rules: &[InstallRule],
    clamp_mtime: u64,
) -> Result<BTreeMap<String, IntermediateManifest>> {
    let mut resolver = InstallationResolver::new(packages.iter().cloned(), search_dirs);
    resolver.apply_rules(rules)?;

    let mut manifests = BTreeMap::new();
    for (name, mut tree) in resolver.into_package_trees() {
        normalize_modes(&mut tree, &name)?;
        manifests.insert(name, IntermediateManifest::from_tree(&tree, clamp_mtime)?);
    }

    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use {super::*, virtual_file_tree::EntryMetadata};

    fn source_tree() -> Result<VirtualTree> {
        let mut tree = VirtualTree::with_fs_root("/build/tmp");
        tree.add_file("usr/bin/foo", EntryMetadata::file().with_mode(0o755).with_mtime(10))?;
        tree.add_file("usr/bin/bar", EntryMetadata::file().with_mtime(10))?;
        tree.add_file("usr/share/foo/data.txt", EntryMetadata::file().with_mtime(10))?;
        tree.add_file("usr/share/foo/sub/more.txt", EntryMetadata::file().with_mtime(10))?;
        tree.add_file("usr/lib/libfoo.la", EntryMetadata::file().with_mtime(10))?;
        tree.add_file("README.md", EntryMetadata::file().with_mtime(10))?;
        tree.add_symlink("usr/bin/baz", "foo", EntryMetadata::symlink())?;

        Ok(tree)
    }

    fn paths(tree: &VirtualTree) -> Vec<String> {
        tree.root().all_paths().into_iter().map(|p| p.path()).collect()
    }

    #[test]
    fn first_rule_wins() -> Result<()> {
        let tree = source_tree()?;
        let mut resolver = InstallationResolver::new(
            [BinaryPackage::new("a"), BinaryPackage::new("b")],
            vec![SearchDir::new(&tree, ["a", "b"])],
        );

        resolver.apply_rules(&[
            InstallRule::install_dest(&["usr/bin/foo"], None, ["a"], "rule 1")?,
            InstallRule::install_dest(&["usr/*"], None, ["b"], "rule 2")?,
        ])?;

        let a = resolver.package_tree("a").unwrap();
        assert_eq!(paths(a), vec![".", "./usr", "./usr/bin", "./usr/bin/foo"]);

        let b = resolver.package_tree("b").unwrap();
        let b_paths = paths(b);
        assert!(!b_paths.contains(&"./usr/bin/foo".to_string()));
        assert!(b_paths.contains(&"./usr/bin/bar".to_string()));
        assert!(b_paths.contains(&"./usr/bin/baz".to_string()));
        assert!(b_paths.contains(&"./usr/share/foo/sub/more.txt".to_string()));
        assert!(b_paths.contains(&"./usr/lib/libfoo.la".to_string()));

        Ok(())
    }

    #[test]
    fn install_as_and_templates() -> Result<()> {
        let tree = source_tree()?;
        let mut resolver = InstallationResolver::new(
            [BinaryPackage::new("foo")],
            vec![SearchDir::new(&tree, ["foo"])],
        );

        resolver.apply_rules(&[
            InstallRule::install_as("usr/bin/foo", "usr/libexec/foo/run", ["foo"], "rule 1")?,
            InstallRule::install_doc(&["README.md"], None, ["foo"], "rule 2")?,
        ])?;

        let pkg = resolver.package_tree("foo").unwrap();
        let run = pkg.lookup("usr/libexec/foo/run").unwrap();
        assert_eq!(run.fs_path(), Some(Path::new("/build/tmp/usr/bin/foo")));
        assert_eq!(run.mode(), 0o755);
        assert!(pkg.lookup("usr/share/doc/foo/README.md").is_some());
        // Synthesized directories have no real timestamp.
        assert_eq!(pkg.lookup("usr/libexec").unwrap().mtime(), None);

        Ok(())
    }

    #[test]
    fn install_as_requires_single_match() -> Result<()> {
        let tree = source_tree()?;
        let mut resolver =
            InstallationResolver::new([BinaryPackage::new("foo")], vec![SearchDir::new(&tree, ["foo"])]);

        let err = resolver
            .apply_rule(&InstallRule::install_as("usr/bin/*", "usr/bin/tool", ["foo"], "rule 1")?)
            .unwrap_err();
        assert!(matches!(err, DebAssemblyError::InstallAsMultipleMatches { .. }));

        assert!(matches!(
            InstallRule::install_as("usr/bin/foo", "usr/bin/", ["foo"], "rule 2"),
            Err(DebAssemblyError::InvalidDestination { .. })
        ));

        Ok(())
    }

    #[test]
    fn unmatched_rule_errors() -> Result<()> {
        let tree = source_tree()?;
        let mut resolver = InstallationResolver::new(
            [BinaryPackage::new("a"), BinaryPackage::new("b").acted_on(false)],
            vec![SearchDir::new(&tree, ["a", "b"])],
        );

        let err = resolver
            .apply_rule(&InstallRule::install_dest(&["opt/*"], None, ["a"], "debian/pkg.install:3")?)
            .unwrap_err();
        assert!(err.to_string().starts_with("debian/pkg.install:3: there were no matches"));

        // Packages not being built may come up empty.
        resolver.apply_rule(&InstallRule::install_dest(&["opt/*"], None, ["b"], "rule")?)?;

        Ok(())
    }

    #[test]
    fn already_claimed_diagnostics() -> Result<()> {
        let tree = source_tree()?;
        let mut resolver =
            InstallationResolver::new([BinaryPackage::new("foo")], vec![SearchDir::new(&tree, ["foo"])]);

        resolver.apply_rules(&[
            InstallRule::discard(&["usr/lib/*.la"], "discard")?,
            InstallRule::install_dest(&["usr/bin/*"], None, ["foo"], "rule 1")?,
        ])?;

        match resolver.apply_rule(&InstallRule::install_dest(&["usr/bin/*"], None, ["foo"], "rule 2")?) {
            Err(DebAssemblyError::NoMatchForInstallPattern { message, .. }) => {
                assert!(message.contains("(3 in total) were already installed"), "{}", message);
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }

        match resolver.apply_rule(&InstallRule::install_dest(&["**/*.la"], None, ["foo"], "rule 3")?) {
            Err(DebAssemblyError::NoMatchForInstallPattern { message, .. }) => {
                assert!(message.contains("excluded by earlier discard rules"), "{}", message);
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }

        assert!(matches!(
            resolver.apply_rule(&InstallRule::install_dest(&["usr/bin/foo"], None, ["foo"], "rule 4")?),
            Err(DebAssemblyError::PathAlreadyInstalled { .. })
        ));
        assert!(matches!(
            resolver.apply_rule(&InstallRule::install_dest(&["usr/lib/libfoo.la"], None, ["foo"], "rule 5")?),
            Err(DebAssemblyError::PathExcluded { .. })
        ));

        Ok(())
    }

    #[test]
    fn discard_applies_to_children() -> Result<()> {
        let tree = source_tree()?;
        let mut resolver =
            InstallationResolver::new([BinaryPackage::new("foo")], vec![SearchDir::new(&tree, ["foo"])]);

        resolver.apply_rules(&[
            InstallRule::discard(&["usr/share/foo"], "discard")?,
            InstallRule::install_dest(&["usr/share/*"], None, ["foo"], "rule")?,
        ])
        .unwrap_err();

        let missing = resolver
            .detect_missing()
            .into_iter()
            .map(|p| p.path())
            .collect::<Vec<_>>();
        assert_eq!(
            missing,
            vec!["./README.md", "./usr/bin/bar", "./usr/bin/baz", "./usr/bin/foo", "./usr/lib/libfoo.la"]
        );

        Ok(())
    }

    #[test]
    fn multiple_packages_share_a_rule() -> Result<()> {
        let mut tree = VirtualTree::with_fs_root("/build/tmp");
        tree.add_file("usr/share/common/file", EntryMetadata::file())?;
        let id = tree.lookup("usr/share/common/file").unwrap().id();
        tree.set_may_steal(id, true);

        let mut resolver = InstallationResolver::new(
            [BinaryPackage::new("a"), BinaryPackage::new("b")],
            vec![SearchDir::new(&tree, ["a", "b"])],
        );
        resolver.apply_rule(&InstallRule::install_dest(&["usr/share/common"], None, ["a", "b"], "rule")?)?;

        for package in ["a", "b"] {
            let file = resolver
                .package_tree(package)
                .unwrap()
                .lookup("usr/share/common/file")
                .unwrap();
            assert!(!file.may_steal_fs_path(), "{}", package);
        }

        Ok(())
    }

    #[test]
    fn search_dirs_are_scoped_to_packages() -> Result<()> {
        let mut only_b = VirtualTree::with_fs_root("/build/b");
        only_b.add_file("usr/bin/foo", EntryMetadata::file())?;
        let shared = source_tree()?;

        let mut resolver = InstallationResolver::new(
            [BinaryPackage::new("a"), BinaryPackage::new("b")],
            vec![SearchDir::new(&only_b, ["b"]), SearchDir::new(&shared, ["a", "b"])],
        );
        resolver.apply_rule(&InstallRule::install_dest(&["usr/bin/foo"], None, ["a", "b"], "rule")?)?;

        let a = resolver.package_tree("a").unwrap().lookup("usr/bin/foo").unwrap();
        let b = resolver.package_tree("b").unwrap().lookup("usr/bin/foo").unwrap();
        assert_eq!(a.fs_path(), Some(Path::new("/build/tmp/usr/bin/foo")));
        assert_eq!(b.fs_path(), Some(Path::new("/build/b/usr/bin/foo")));

        Ok(())
    }

    #[test]
    fn file_over_directory_is_an_error() -> Result<()> {
        let tree = source_tree()?;
        let mut resolver =
            InstallationResolver::new([BinaryPackage::new("foo")], vec![SearchDir::new(&tree, ["foo"])]);

        resolver.apply_rule(&InstallRule::install_dest(&["usr/share/foo"], None, ["foo"], "rule 1")?)?;
        assert!(matches!(
            resolver.apply_rule(&InstallRule::install_as("README.md", "usr/share/foo", ["foo"], "rule 2")?),
            Err(DebAssemblyError::DestinationIsDirectory { .. })
        ));

        Ok(())
    }

    #[test]
    fn explicit_metadata_survives_normalization() -> Result<()> {
        let tree = source_tree()?;
        let rules = [
            InstallRule::install_dest(&["usr/bin/bar"], None, ["foo"], "rule 1")?.with_metadata(
                ExplicitMetadata {
                    mode: Some(0o4750),
                    ownership: Some(Ownership {
                        owner: "root".to_string(),
                        uid: 0,
                        group: "games".to_string(),
                        gid: 60,
                    }),
                },
            ),
            InstallRule::install_dest(&["usr/bin/foo"], None, ["foo"], "rule 2")?,
        ];

        let manifests = resolve_intermediate_manifests(
            &[BinaryPackage::new("foo")],
            vec![SearchDir::new(&tree, ["foo"])],
            &rules,
            1000,
        )?;

        let manifest = &manifests["foo"];
        assert!(manifest.needs_root_ownership());

        let bar = manifest
            .iter()
            .find(|m| m.member_path == "./usr/bin/bar")
            .unwrap();
        assert_eq!(bar.mode, 0o4750);
        assert_eq!(bar.group, "games");
        assert_eq!(bar.mtime, 10);

        let usr = manifest.iter().find(|m| m.member_path == "./usr/").unwrap();
        assert_eq!(usr.mtime, 1000);

        Ok(())
    }
}
