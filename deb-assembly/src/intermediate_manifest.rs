// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The intermediate manifest: entries destined for a binary package.

An [IntermediateManifest] is an ordered list of [TarMember]. It is produced by
installation resolution and consumed by materialization and packing. Since those
steps may run in a different (privileged) process, the manifest has a stable
JSON representation:

```json
[
  {"member-path": "./", "path-type": "directory", "mode": 493,
   "owner": "root", "uid": 0, "group": "root", "gid": 0, "mtime": 1700000000},
  {"member-path": "./usr/bin/foo", "path-type": "file", "fs-path": "/build/foo",
   "mode": 493, "owner": "root", "uid": 0, "group": "root", "gid": 0,
   "mtime": 1700000000, "may-steal-fs-path": true}
]
```

Members are unique by path and every directory precedes its descendants.
*/

use {
    crate::error::{DebAssemblyError, Result},
    serde::{Deserialize, Serialize},
    std::{
        collections::HashMap,
        io::{Read, Write},
        path::{Path, PathBuf},
    },
    virtual_file_tree::{EntryKind, Ownership, VirtualPath, VirtualTree},
};

/// The type of a filesystem entry.
///
/// Hardlinks are not supported.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    File,
    Directory,
    Symlink,
}

impl PathType {
    /// The key used in manifests and diagnostics.
    pub fn manifest_key(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Symlink => "symlink",
        }
    }

    /// Whether a virtual path is of this type.
    pub fn matches(&self, path: &VirtualPath) -> bool {
        Self::from(path.kind()) == *self
    }

    /// The tar entry type for members of this type.
    pub fn tar_entry_type(&self) -> tar::EntryType {
        match self {
            Self::File => tar::EntryType::Regular,
            Self::Directory => tar::EntryType::Directory,
            Self::Symlink => tar::EntryType::Symlink,
        }
    }
}

impl From<EntryKind> for PathType {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::Directory => Self::Directory,
            EntryKind::File => Self::File,
            EntryKind::Symlink => Self::Symlink,
        }
    }
}

impl std::fmt::Display for PathType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.manifest_key())
    }
}

fn is_false(value: &bool) -> bool {
    !value
}

/// A single entry in a binary package.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TarMember {
    /// Path in the package, starting with `./`. Directories end with `/`.
    pub member_path: String,
    pub path_type: PathType,
    /// Location of the content on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    pub mode: u32,
    pub owner: String,
    pub uid: u32,
    pub group: String,
    pub gid: u32,
    /// Seconds since the UNIX epoch.
    pub mtime: u64,
    /// Whether `fs_path` may be moved instead of copied.
    #[serde(default, skip_serializing_if = "is_false")]
    pub may_steal_fs_path: bool,
}

impl TarMember {
    /// The member path without the leading `./` and trailing `/`.
    ///
    /// The root directory is the empty string.
    pub fn relative_path(&self) -> &str {
        let path = self.member_path.strip_prefix("./").unwrap_or(&self.member_path);
        path.strip_suffix('/').unwrap_or(path)
    }

    /// The basename of the member path.
    pub fn basename(&self) -> &str {
        let rel = self.relative_path();
        rel.rsplit_once('/').map(|(_, b)| b).unwrap_or(rel)
    }

    pub fn ownership(&self) -> Ownership {
        Ownership {
            owner: self.owner.clone(),
            uid: self.uid,
            group: self.group.clone(),
            gid: self.gid,
        }
    }

    /// Whether installing this member requires ownership other than root.
    pub fn needs_root_ownership(&self) -> bool {
        !self.ownership().is_root()
    }

    fn validate(&self) -> Result<()> {
        let invalid =
            |message: &str| DebAssemblyError::InvalidManifest(format!("{}: {}", self.member_path, message));

        if !self.member_path.starts_with("./") {
            return Err(invalid("member paths must start with \"./\""));
        }

        match self.path_type {
            PathType::Directory => {
                if !self.member_path.ends_with('/') {
                    return Err(invalid("directory paths must end with \"/\""));
                }
            }
            _ => {
                if self.member_path.ends_with('/') {
                    return Err(invalid("only directory paths may end with \"/\""));
                }
            }
        }

        match (self.path_type, &self.link_target) {
            (PathType::Symlink, None) => return Err(invalid("symlinks must have a link target")),
            (PathType::Symlink, Some(target)) if target.is_empty() => {
                return Err(invalid("symlinks must have a link target"))
            }
            (PathType::Symlink, Some(_)) => {
                if self.mode != 0o777 {
                    return Err(invalid("symlinks must have mode 0777"));
                }
            }
            (PathType::File, Some(target)) => {
                return Err(DebAssemblyError::HardlinkUnsupported(format!(
                    "{} links to {}",
                    self.member_path, target
                )));
            }
            (PathType::Directory, Some(_)) => {
                return Err(invalid("only symlinks may have a link target"))
            }
            (_, None) => {}
        }

        if self.path_type == PathType::File && self.fs_path.is_none() {
            return Err(invalid("files must have an fs-path"));
        }

        Ok(())
    }
}

/// An ordered list of package members.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct IntermediateManifest {
    members: Vec<TarMember>,
}

impl IntermediateManifest {
    /// Construct an instance from members, validating them.
    pub fn from_members(members: Vec<TarMember>) -> Result<Self> {
        let manifest = Self { members };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_slice(data: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(data)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse and validate a JSON document from a reader.
    pub fn from_json_reader(reader: impl Read) -> Result<Self> {
        let manifest: Self = serde_json::from_reader(reader)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a manifest from a file, with `-` meaning stdin.
    pub fn from_path_or_stdin(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path == Path::new("-") {
            Self::from_json_reader(std::io::stdin().lock())
        } else {
            let fh = std::fs::File::open(path)
                .map_err(|e| DebAssemblyError::filesystem("opening", path, e))?;
            Self::from_json_reader(std::io::BufReader::new(fh))
        }
    }

    pub fn to_json_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn write_json(&self, writer: impl Write) -> Result<()> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn members(&self) -> &[TarMember] {
        &self.members
    }

    pub fn into_members(self) -> Vec<TarMember> {
        self.members
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TarMember> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether any member requires non-root ownership.
    pub fn needs_root_ownership(&self) -> bool {
        self.members.iter().any(|m| m.needs_root_ownership())
    }

    /// Verify structural invariants.
    ///
    /// The first member is the `./` directory, paths are unique, and every
    /// member's parent directory appears before it.
    pub fn validate(&self) -> Result<()> {
        let first = self.members.first().ok_or_else(|| {
            DebAssemblyError::InvalidManifest("the manifest has no members".to_string())
        })?;
        if first.member_path != "./" || first.path_type != PathType::Directory {
            return Err(DebAssemblyError::InvalidManifest(format!(
                "the first member must be the \"./\" directory; got {}",
                first.member_path
            )));
        }

        let mut seen: HashMap<&str, PathType> = HashMap::new();

        for member in &self.members {
            member.validate()?;

            if seen.contains_key(member.member_path.as_str()) {
                return Err(DebAssemblyError::InvalidManifest(format!(
                    "duplicate member {}",
                    member.member_path
                )));
            }

            if member.member_path != "./" {
                let rel = member.relative_path();
                let parent = match rel.rsplit_once('/') {
                    Some((dirname, _)) => format!("./{}/", dirname),
                    None => "./".to_string(),
                };

                match seen.get(parent.as_str()) {
                    Some(PathType::Directory) => {}
                    Some(_) => {
                        return Err(DebAssemblyError::InvalidManifest(format!(
                            "the parent of {} is not a directory",
                            member.member_path
                        )))
                    }
                    None => {
                        return Err(DebAssemblyError::InvalidManifest(format!(
                            "{} appears before its parent directory {}",
                            member.member_path, parent
                        )))
                    }
                }
            }

            seen.insert(member.member_path.as_str(), member.path_type);
        }

        Ok(())
    }

    /// Generate the manifest for a resolved package tree.
    ///
    /// Paths are emitted in pre-order with siblings sorted by name, except that
    /// symlinks are moved to the end, keeping their relative order. Entries
    /// without a real modification time get `clamp_mtime`; others get the
    /// smaller of the two. Symlink targets are normalized per Debian policy.
    pub fn from_tree(tree: &VirtualTree, clamp_mtime: u64) -> Result<Self> {
        let mut members = vec![];
        let mut symlinks = vec![];

        for path in tree.root().all_paths() {
            let member = tar_member_for_path(&path, clamp_mtime)?;
            if member.path_type == PathType::Symlink {
                symlinks.push(member);
            } else {
                members.push(member);
            }
        }

        members.extend(symlinks);

        Self::from_members(members)
    }
}

fn tar_member_for_path(path: &VirtualPath, clamp_mtime: u64) -> Result<TarMember> {
    let path_type = PathType::from(path.kind());
    let member_path = match path_type {
        PathType::Directory if path.is_root() => "./".to_string(),
        PathType::Directory => format!("{}/", path.path()),
        _ => path.path(),
    };

    let mtime = match path.mtime() {
        Some(mtime) => mtime.min(clamp_mtime),
        None => clamp_mtime,
    };

    let ownership = path.ownership();

    let (mode, fs_path, link_target, may_steal_fs_path) = match path_type {
        PathType::Symlink => {
            let target = path.link_target().unwrap_or_default();
            (
                0o777,
                None,
                Some(debian_policy_normalize_symlink_target(&path.path(), target)?),
                false,
            )
        }
        PathType::File => (
            path.mode(),
            path.fs_path().map(|p| p.to_path_buf()),
            None,
            path.may_steal_fs_path(),
        ),
        PathType::Directory => (path.mode(), None, None, false),
    };

    Ok(TarMember {
        member_path,
        path_type,
        fs_path,
        link_target,
        mode,
        owner: ownership.owner.clone(),
        uid: ownership.uid,
        group: ownership.group.clone(),
        gid: ownership.gid,
        mtime,
        may_steal_fs_path,
    })
}

/// Normalize a symlink target according to Debian policy.
///
/// Links within the same top-level directory must be relative and links across
/// top-level directories must be absolute. `link_path` is the normalized path of
/// the link itself (`./usr/lib/foo`).
pub fn debian_policy_normalize_symlink_target(link_path: &str, link_target: &str) -> Result<String> {
    let link_rel = link_path
        .strip_prefix("./")
        .ok_or_else(|| DebAssemblyError::InvalidManifest(format!("{} is not normalized", link_path)))?;
    let link_parts = link_rel.split('/').collect::<Vec<_>>();

    let absolute_target = if link_target.starts_with('/') {
        link_target.to_string()
    } else {
        let dirname = &link_parts[..link_parts.len() - 1];
        format!("/{}/{}", dirname.join("/"), link_target)
    };

    let mut target_parts: Vec<&str> = vec![];
    for segment in absolute_target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                target_parts.pop();
            }
            other => target_parts.push(other),
        }
    }

    if target_parts.is_empty() || link_parts[0] != target_parts[0] {
        return Ok(format!("/{}", target_parts.join("/")));
    }

    let mut common = 1;
    let shortest = target_parts.len().min(link_parts.len());
    while common < shortest && target_parts[common] == link_parts[common] {
        common += 1;
    }

    if common == shortest && link_parts.len() - 1 == target_parts.len() {
        return Ok(".".to_string());
    }

    let up = (link_parts.len() - 1).saturating_sub(common);
    let mut parts = vec![".."; up];
    parts.extend(&target_parts[common..]);

    Ok(parts.join("/"))
}
