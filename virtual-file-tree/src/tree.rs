// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Arena backed tree of filesystem entries. */

use {
    crate::{
        error::{Result, VirtualTreeError},
        path::{normalize_path, split_dirname_basename},
    },
    log::debug,
    std::{
        collections::BTreeMap,
        fmt::{Debug, Formatter},
        os::unix::fs::MetadataExt,
        path::{Path, PathBuf},
    },
};

/// Identifies a node within a [VirtualTree].
///
/// Identifiers are only meaningful for the tree that issued them.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(usize);

/// The type of a node.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// Owner and group of an entry, by name and by numeric id.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Ownership {
    pub owner: String,
    pub uid: u32,
    pub group: String,
    pub gid: u32,
}

impl Default for Ownership {
    fn default() -> Self {
        Self::root()
    }
}

impl Ownership {
    /// `root:root` with ids 0.
    pub fn root() -> Self {
        Self {
            owner: "root".to_string(),
            uid: 0,
            group: "root".to_string(),
            gid: 0,
        }
    }

    /// Whether both the owner and the group denote root.
    pub fn is_root(&self) -> bool {
        self.owner == "root" && self.group == "root" && self.uid == 0 && self.gid == 0
    }
}

/// Unix metadata attached to a node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryMetadata {
    /// Permission bits, including setuid/setgid/sticky.
    pub mode: u32,
    /// Modification time in seconds since the UNIX epoch.
    ///
    /// `None` for entries that do not exist on disk.
    pub mtime: Option<u64>,
    pub ownership: Ownership,
}

impl EntryMetadata {
    pub fn directory() -> Self {
        Self {
            mode: 0o755,
            mtime: None,
            ownership: Ownership::root(),
        }
    }

    pub fn file() -> Self {
        Self {
            mode: 0o644,
            mtime: None,
            ownership: Ownership::root(),
        }
    }

    pub fn symlink() -> Self {
        Self {
            mode: 0o777,
            mtime: None,
            ownership: Ownership::root(),
        }
    }

    /// Set the mode, consuming self.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Set the mtime, consuming self.
    pub fn with_mtime(mut self, mtime: u64) -> Self {
        self.mtime = Some(mtime);
        self
    }
}

#[derive(Clone, Debug)]
enum NodeContent {
    Directory(BTreeMap<String, NodeId>),
    File,
    Symlink(String),
}

#[derive(Clone, Debug)]
struct Node {
    name: String,
    parent: Option<NodeId>,
    content: NodeContent,
    fs_path: Option<PathBuf>,
    metadata: EntryMetadata,
    explicit_mode: bool,
    may_steal: bool,
}

/// An in-memory tree of directories, files and symlinks.
///
/// The root is always a directory. Nodes removed from the tree stay in the arena
/// but are no longer reachable from the root.
#[derive(Clone, Debug)]
pub struct VirtualTree {
    nodes: Vec<Node>,
}

impl Default for VirtualTree {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTree {
    /// Construct a tree with an empty root not backed by the filesystem.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                name: ".".to_string(),
                parent: None,
                content: NodeContent::Directory(BTreeMap::new()),
                fs_path: None,
                metadata: EntryMetadata::directory(),
                explicit_mode: false,
                may_steal: false,
            }],
        }
    }

    /// Construct a tree whose root corresponds to a directory on disk.
    ///
    /// Nodes created without an explicit filesystem path derive one from their
    /// parent. Nothing is read from disk.
    pub fn with_fs_root(path: impl AsRef<Path>) -> Self {
        let mut tree = Self::new();
        tree.nodes[0].fs_path = Some(path.as_ref().to_path_buf());
        tree
    }

    /// Populate a tree by scanning a directory on disk.
    ///
    /// Symlinks are not followed. Files are marked as stealable when `stealable`
    /// is set and they have a single hard link. Anything other than a regular file,
    /// a directory or a symlink is an error.
    pub fn from_directory(root: impl AsRef<Path>, stealable: bool) -> Result<Self> {
        let root = root.as_ref();
        let root_metadata = std::fs::symlink_metadata(root)
            .map_err(|e| VirtualTreeError::IoPath(root.display().to_string(), e))?;
        if !root_metadata.is_dir() {
            return Err(VirtualTreeError::NotADirectory(root.display().to_string()));
        }

        let mut tree = Self::with_fs_root(root);
        tree.nodes[0].metadata = metadata_from_disk(&root_metadata);

        for entry in walkdir::WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry?;
            let disk_path = entry.path();
            let rel_path = disk_path
                .strip_prefix(root)
                .ok()
                .and_then(|p| p.to_str())
                .ok_or_else(|| VirtualTreeError::NonUtf8Path(disk_path.display().to_string()))?;

            let (dirname, basename) = split_dirname_basename(rel_path);
            let parent = tree
                .lookup_id(dirname)
                .ok_or_else(|| VirtualTreeError::NotADirectory(dirname.to_string()))?;

            let disk_metadata = entry
                .metadata()
                .map_err(|e| VirtualTreeError::IoPath(disk_path.display().to_string(), e.into()))?;
            let metadata = metadata_from_disk(&disk_metadata);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                tree.create_directory(parent, basename, metadata)?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(disk_path)
                    .map_err(|e| VirtualTreeError::IoPath(disk_path.display().to_string(), e))?;
                let target = target
                    .to_str()
                    .ok_or_else(|| VirtualTreeError::NonUtf8Path(target.display().to_string()))?
                    .to_string();
                tree.create_symlink(parent, basename, target, metadata)?;
            } else if file_type.is_file() {
                let id = tree.create_file(
                    parent,
                    basename,
                    Some(disk_path.to_path_buf()),
                    metadata,
                )?;
                let may_steal = stealable && disk_metadata.nlink() == 1;
                if stealable && !may_steal {
                    debug!("{} has multiple hard links; it will be copied", disk_path.display());
                }
                tree.set_may_steal(id, may_steal);
            } else {
                return Err(VirtualTreeError::UnsupportedFileType(
                    disk_path.display().to_string(),
                ));
            }
        }

        Ok(tree)
    }

    /// Obtain the identifier of the root directory.
    pub fn root_id(&self) -> NodeId {
        NodeId(0)
    }

    /// Obtain a handle on the root directory.
    pub fn root(&self) -> VirtualPath<'_> {
        self.path(self.root_id())
    }

    /// Obtain a handle on a node.
    pub fn path(&self, id: NodeId) -> VirtualPath<'_> {
        VirtualPath { tree: self, id }
    }

    /// Resolve a path relative to the root.
    pub fn lookup(&self, path: &str) -> Option<VirtualPath<'_>> {
        self.lookup_id(path).map(|id| self.path(id))
    }

    fn lookup_id(&self, path: &str) -> Option<NodeId> {
        self.lookup_from(self.root_id(), path)
    }

    fn lookup_from(&self, start: NodeId, path: &str) -> Option<NodeId> {
        let normalized = normalize_path(path, false).ok()?;
        if normalized == "." {
            return Some(start);
        }

        let mut current = start;
        for segment in normalized.split('/') {
            current = self.child_id(current, segment)?;
        }

        Some(current)
    }

    fn child_id(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        match &self.nodes[parent.0].content {
            NodeContent::Directory(children) => children.get(name).copied(),
            _ => None,
        }
    }

    /// Ensure a directory and all its parents exist.
    ///
    /// Missing directories get default directory metadata. An existing
    /// non-directory along the way is an error.
    pub fn mkdirs(&mut self, path: &str) -> Result<NodeId> {
        let normalized = normalize_path(path, false)?;
        let mut current = self.root_id();
        if normalized == "." {
            return Ok(current);
        }

        for segment in normalized.split('/') {
            current = match self.child_id(current, segment) {
                Some(id) if self.path(id).is_dir() => id,
                Some(id) => {
                    return Err(VirtualTreeError::NotADirectory(self.path(id).path()));
                }
                None => self.create_directory(current, segment, EntryMetadata::directory())?,
            };
        }

        Ok(current)
    }

    /// Add a regular file at a path, creating parent directories as needed.
    ///
    /// The filesystem path is derived from the parent directory if it has one.
    pub fn add_file(&mut self, path: &str, metadata: EntryMetadata) -> Result<NodeId> {
        let (parent, name) = self.prepare_parent(path)?;
        self.create_file(parent, &name, None, metadata)
    }

    /// Add a regular file backed by a specific file on disk.
    pub fn add_file_from(
        &mut self,
        path: &str,
        fs_path: impl AsRef<Path>,
        metadata: EntryMetadata,
    ) -> Result<NodeId> {
        let (parent, name) = self.prepare_parent(path)?;
        self.create_file(parent, &name, Some(fs_path.as_ref().to_path_buf()), metadata)
    }

    /// Add a symlink at a path, creating parent directories as needed.
    pub fn add_symlink(
        &mut self,
        path: &str,
        target: impl ToString,
        metadata: EntryMetadata,
    ) -> Result<NodeId> {
        let (parent, name) = self.prepare_parent(path)?;
        self.create_symlink(parent, &name, target.to_string(), metadata)
    }

    fn prepare_parent(&mut self, path: &str) -> Result<(NodeId, String)> {
        let normalized = normalize_path(path, false)?;
        if normalized == "." {
            return Err(VirtualTreeError::AlreadyExists(".".to_string()));
        }
        let (dirname, basename) = split_dirname_basename(&normalized);
        let parent = self.mkdirs(dirname)?;

        Ok((parent, basename.to_string()))
    }

    /// Create a directory directly beneath `parent`.
    pub fn create_directory(
        &mut self,
        parent: NodeId,
        name: &str,
        metadata: EntryMetadata,
    ) -> Result<NodeId> {
        let fs_path = self.derived_fs_path(parent, name);
        self.insert_node(
            parent,
            name,
            NodeContent::Directory(BTreeMap::new()),
            fs_path,
            metadata,
        )
    }

    /// Create a regular file directly beneath `parent`.
    ///
    /// Without an explicit `fs_path`, one is derived from the parent directory.
    pub fn create_file(
        &mut self,
        parent: NodeId,
        name: &str,
        fs_path: Option<PathBuf>,
        metadata: EntryMetadata,
    ) -> Result<NodeId> {
        let fs_path = fs_path.or_else(|| self.derived_fs_path(parent, name));
        self.insert_node(parent, name, NodeContent::File, fs_path, metadata)
    }

    /// Create a symlink directly beneath `parent`.
    pub fn create_symlink(
        &mut self,
        parent: NodeId,
        name: &str,
        target: String,
        metadata: EntryMetadata,
    ) -> Result<NodeId> {
        let fs_path = self.derived_fs_path(parent, name);
        self.insert_node(parent, name, NodeContent::Symlink(target), fs_path, metadata)
    }

    fn derived_fs_path(&self, parent: NodeId, name: &str) -> Option<PathBuf> {
        self.nodes[parent.0].fs_path.as_ref().map(|p| p.join(name))
    }

    fn insert_node(
        &mut self,
        parent: NodeId,
        name: &str,
        content: NodeContent,
        fs_path: Option<PathBuf>,
        metadata: EntryMetadata,
    ) -> Result<NodeId> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(VirtualTreeError::InvalidName(name.to_string()));
        }

        let id = NodeId(self.nodes.len());
        let parent_path = self.path(parent).path();

        match &mut self.nodes[parent.0].content {
            NodeContent::Directory(children) => {
                if children.contains_key(name) {
                    return Err(VirtualTreeError::AlreadyExists(format!(
                        "{}/{}",
                        parent_path, name
                    )));
                }
                children.insert(name.to_string(), id);
            }
            _ => return Err(VirtualTreeError::NotADirectory(parent_path)),
        }

        self.nodes.push(Node {
            name: name.to_string(),
            parent: Some(parent),
            content,
            fs_path,
            metadata,
            explicit_mode: false,
            may_steal: false,
        });

        Ok(id)
    }

    /// Detach a node (and everything beneath it) from the tree.
    pub fn remove(&mut self, id: NodeId) -> Result<()> {
        let parent = self.nodes[id.0].parent.ok_or(VirtualTreeError::RemoveRoot)?;
        let name = self.nodes[id.0].name.clone();

        if let NodeContent::Directory(children) = &mut self.nodes[parent.0].content {
            children.remove(&name);
        }
        self.nodes[id.0].parent = None;

        Ok(())
    }

    /// Replace the metadata of a node.
    pub fn set_metadata(&mut self, id: NodeId, metadata: EntryMetadata) {
        self.nodes[id.0].metadata = metadata;
    }

    /// Set the mode of a node.
    pub fn set_mode(&mut self, id: NodeId, mode: u32) {
        self.nodes[id.0].metadata.mode = mode;
    }

    /// Set a mode that automatic normalization must leave alone.
    pub fn set_explicit_mode(&mut self, id: NodeId, mode: u32) {
        let node = &mut self.nodes[id.0];
        node.metadata.mode = mode;
        node.explicit_mode = true;
    }

    pub fn set_ownership(&mut self, id: NodeId, ownership: Ownership) {
        self.nodes[id.0].metadata.ownership = ownership;
    }

    /// Record whether the backing file may be consumed destructively.
    pub fn set_may_steal(&mut self, id: NodeId, value: bool) {
        self.nodes[id.0].may_steal = value;
    }
}

fn metadata_from_disk(metadata: &std::fs::Metadata) -> EntryMetadata {
    EntryMetadata {
        mode: metadata.mode() & 0o7777,
        mtime: Some(metadata.mtime().max(0) as u64),
        ownership: Ownership::root(),
    }
}

/// A handle on a node in a [VirtualTree].
#[derive(Clone, Copy)]
pub struct VirtualPath<'a> {
    tree: &'a VirtualTree,
    id: NodeId,
}

impl<'a> Debug for VirtualPath<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPath")
            .field("path", &self.path())
            .field("kind", &self.kind())
            .finish()
    }
}

impl<'a> PartialEq for VirtualPath<'a> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.tree, other.tree) && self.id == other.id
    }
}

impl<'a> Eq for VirtualPath<'a> {}

impl<'a> VirtualPath<'a> {
    fn node(&self) -> &'a Node {
        &self.tree.nodes[self.id.0]
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn tree(&self) -> &'a VirtualTree {
        self.tree
    }

    /// The basename of this node. The root is named `.`.
    pub fn name(&self) -> &'a str {
        &self.node().name
    }

    pub fn is_root(&self) -> bool {
        self.node().parent.is_none()
    }

    pub fn parent(&self) -> Option<VirtualPath<'a>> {
        self.node().parent.map(|id| self.tree.path(id))
    }

    /// The path of this node relative to the root, without a `./` prefix.
    ///
    /// The root is the empty string.
    pub fn relative_path(&self) -> String {
        let mut segments = vec![];
        let mut current = *self;
        while let Some(parent) = current.parent() {
            segments.push(current.name());
            current = parent;
        }
        segments.reverse();
        segments.join("/")
    }

    /// The normalized path of this node, e.g. `./usr/bin`. The root is `.`.
    pub fn path(&self) -> String {
        if self.is_root() {
            ".".to_string()
        } else {
            format!("./{}", self.relative_path())
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self.node().content {
            NodeContent::Directory(_) => EntryKind::Directory,
            NodeContent::File => EntryKind::File,
            NodeContent::Symlink(_) => EntryKind::Symlink,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind() == EntryKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind() == EntryKind::Symlink
    }

    /// The symlink target, for symlinks.
    pub fn link_target(&self) -> Option<&'a str> {
        match &self.node().content {
            NodeContent::Symlink(target) => Some(target.as_str()),
            _ => None,
        }
    }

    /// The real filesystem location backing this node, if any.
    pub fn fs_path(&self) -> Option<&'a Path> {
        self.node().fs_path.as_deref()
    }

    pub fn metadata(&self) -> &'a EntryMetadata {
        &self.node().metadata
    }

    pub fn mode(&self) -> u32 {
        self.node().metadata.mode
    }

    pub fn mtime(&self) -> Option<u64> {
        self.node().metadata.mtime
    }

    pub fn ownership(&self) -> &'a Ownership {
        &self.node().metadata.ownership
    }

    /// Whether the mode was set explicitly and must not be normalized.
    pub fn has_explicit_mode(&self) -> bool {
        self.node().explicit_mode
    }

    pub fn may_steal_fs_path(&self) -> bool {
        self.node().may_steal
    }

    /// Obtain a direct child by name.
    pub fn get(&self, name: &str) -> Option<VirtualPath<'a>> {
        self.tree.child_id(self.id, name).map(|id| self.tree.path(id))
    }

    /// Resolve a path relative to this node. Symlinks are not followed.
    pub fn lookup(&self, path: &str) -> Option<VirtualPath<'a>> {
        self.tree
            .lookup_from(self.id, path)
            .map(|id| self.tree.path(id))
    }

    /// Iterate over direct children, sorted by name.
    ///
    /// Non-directories have no children.
    pub fn iterdir(&self) -> impl Iterator<Item = VirtualPath<'a>> + 'a {
        let tree = self.tree;
        let children = match &self.node().content {
            NodeContent::Directory(children) => Some(children.values()),
            _ => None,
        };

        children
            .into_iter()
            .flatten()
            .map(move |id| tree.path(*id))
    }

    /// All nodes at or beneath this one, in pre-order with siblings sorted by name.
    ///
    /// The first element is always this node.
    pub fn all_paths(&self) -> Vec<VirtualPath<'a>> {
        let mut result = vec![];
        let mut stack = vec![*self];

        while let Some(path) = stack.pop() {
            result.push(path);
            let children = path.iterdir().collect::<Vec<_>>();
            stack.extend(children.into_iter().rev());
        }

        result
    }
}
