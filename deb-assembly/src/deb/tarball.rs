// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Writing `control.tar` and `data.tar` streams from manifest members.

Member names are written verbatim, including the leading `./` and the
trailing `/` of directories, as `dpkg-deb` does. Names and link targets
that do not fit in the classic header fields are written with GNU
`././@LongLink` records.
*/

use {
    crate::{
        error::{DebAssemblyError, Result},
        intermediate_manifest::{PathType, TarMember},
    },
    std::{
        fs::Metadata,
        io::{Read, Write},
        path::Path,
    },
};

/// Control files that are executed by the package manager.
pub const MAINTAINER_SCRIPTS: &[&str] = &[
    "config",
    "isinstallable",
    "postinst",
    "postrm",
    "preinst",
    "prerm",
];

/// Describe the type of a filesystem entry for diagnostics.
pub fn describe_file_type(metadata: &Metadata) -> &'static str {
    let file_type = metadata.file_type();

    if file_type.is_dir() {
        "directory"
    } else if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_file() {
        "file"
    } else {
        "special file"
    }
}

fn new_tar_header(member: &TarMember) -> Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(member.path_type.tar_entry_type());
    header.set_mode(member.mode);
    header.set_uid(member.uid as u64);
    header.set_gid(member.gid as u64);
    header.set_username(&member.owner)?;
    header.set_groupname(&member.group)?;
    header.set_mtime(member.mtime);
    header.set_size(0);

    Ok(header)
}

/// Emit a GNU extension record carrying a value too long for a header field.
fn append_long_record(
    builder: &mut tar::Builder<impl Write>,
    kind: u8,
    value_bytes: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    let name = b"././@LongLink";
    header
        .as_gnu_mut()
        .ok_or_else(|| DebAssemblyError::Usage("expected a GNU tar header".to_string()))?
        .name[..name.len()]
        .clone_from_slice(&name[..]);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(value_bytes.len() as u64 + 1);
    header.set_entry_type(tar::EntryType::new(kind));
    header.set_cksum();

    let mut data = value_bytes.chain(std::io::repeat(0).take(1));
    builder.append(&header, &mut data)?;

    Ok(())
}

fn set_header_path(
    builder: &mut tar::Builder<impl Write>,
    header: &mut tar::Header,
    member_path: &str,
) -> Result<()> {
    // `Header::set_path()` would normalize away the leading `./`.
    let value_bytes = member_path.as_bytes();
    let name_buffer = &mut header.as_old_mut().name;

    if value_bytes.len() > name_buffer.len() {
        append_long_record(builder, b'L', value_bytes)?;
    }

    let length = value_bytes.len().min(name_buffer.len());
    name_buffer[0..length].copy_from_slice(&value_bytes[0..length]);

    Ok(())
}

fn set_header_link_target(
    builder: &mut tar::Builder<impl Write>,
    header: &mut tar::Header,
    link_target: &str,
) -> Result<()> {
    let value_bytes = link_target.as_bytes();
    let link_buffer = &mut header.as_old_mut().linkname;

    if value_bytes.len() > link_buffer.len() {
        append_long_record(builder, b'K', value_bytes)?;
    }

    let length = value_bytes.len().min(link_buffer.len());
    link_buffer[0..length].copy_from_slice(&value_bytes[0..length]);

    Ok(())
}

/// Append a manifest member to a tar archive.
///
/// File content is streamed from the member's `fs_path`, which must be a
/// regular file. Symbolic links in `fs_path` are followed.
pub fn append_member(builder: &mut tar::Builder<impl Write>, member: &TarMember) -> Result<()> {
    let mut header = new_tar_header(member)?;
    set_header_path(builder, &mut header, &member.member_path)?;

    match member.path_type {
        PathType::Directory => {
            header.set_cksum();
            builder.append(&header, std::io::empty())?;
        }
        PathType::Symlink => {
            let target = member.link_target.as_deref().ok_or_else(|| {
                DebAssemblyError::InvalidManifest(format!(
                    "{}: symlinks must have a link target",
                    member.member_path
                ))
            })?;
            set_header_link_target(builder, &mut header, target)?;
            header.set_cksum();
            builder.append(&header, std::io::empty())?;
        }
        PathType::File => {
            let fs_path = member.fs_path.as_deref().ok_or_else(|| {
                DebAssemblyError::InvalidManifest(format!(
                    "{}: files must have an fs-path",
                    member.member_path
                ))
            })?;

            let fh = std::fs::File::open(fs_path)
                .map_err(|e| DebAssemblyError::filesystem("opening", fs_path, e))?;
            let metadata = fh
                .metadata()
                .map_err(|e| DebAssemblyError::filesystem("reading metadata of", fs_path, e))?;
            if !metadata.is_file() {
                return Err(DebAssemblyError::FsPathTypeMismatch {
                    member: member.member_path.clone(),
                    fs_path: fs_path.to_path_buf(),
                    expected: "file",
                    actual: describe_file_type(&metadata),
                });
            }

            header.set_size(metadata.len());
            header.set_cksum();
            builder.append(&header, fh.take(metadata.len()))?;
        }
    }

    Ok(())
}

/// Write a tar archive containing the given members, in order.
pub fn write_tar<'a, W: Write>(
    writer: W,
    members: impl IntoIterator<Item = &'a TarMember>,
) -> Result<W> {
    let mut builder = tar::Builder::new(writer);

    for member in members {
        append_member(&mut builder, member)?;
    }

    Ok(builder.into_inner()?)
}

fn file_mtime(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Derive the members of a `control.tar` from a `DEBIAN` directory.
///
/// Entries are sorted by name and must be regular files. No timestamp is
/// raised above its real value by `mtime`.
pub fn control_members(debian_dir: &Path, mtime: u64) -> Result<Vec<TarMember>> {
    let dir_metadata = std::fs::metadata(debian_dir)
        .map_err(|e| DebAssemblyError::filesystem("reading metadata of", debian_dir, e))?;

    let mut members = vec![TarMember {
        member_path: "./".to_string(),
        path_type: PathType::Directory,
        fs_path: None,
        link_target: None,
        mode: 0o755,
        owner: "root".to_string(),
        uid: 0,
        group: "root".to_string(),
        gid: 0,
        mtime: mtime.min(file_mtime(&dir_metadata)),
        may_steal_fs_path: false,
    }];

    let mut entries = std::fs::read_dir(debian_dir)
        .map_err(|e| DebAssemblyError::filesystem("listing", debian_dir, e))?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| DebAssemblyError::filesystem("listing", debian_dir, e))?;
    entries.sort();

    for name in entries {
        let name = name.to_string_lossy().to_string();
        let path = debian_dir.join(&name);
        let member_path = format!("./{}", name);

        let metadata = std::fs::metadata(&path)
            .map_err(|e| DebAssemblyError::filesystem("reading metadata of", &path, e))?;
        if !metadata.is_file() {
            return Err(DebAssemblyError::FsPathTypeMismatch {
                member: member_path,
                fs_path: path,
                expected: "file",
                actual: describe_file_type(&metadata),
            });
        }

        let mode = if MAINTAINER_SCRIPTS.contains(&name.as_str()) {
            0o755
        } else {
            0o644
        };

        members.push(TarMember {
            member_path,
            path_type: PathType::File,
            fs_path: Some(path),
            link_target: None,
            mode,
            owner: "root".to_string(),
            uid: 0,
            group: "root".to_string(),
            gid: 0,
            mtime: mtime.min(file_mtime(&metadata)),
            may_steal_fs_path: false,
        });
    }

    Ok(members)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{io::Cursor, path::PathBuf},
    };

    fn member(path: &str, path_type: PathType, mode: u32) -> TarMember {
        TarMember {
            member_path: path.to_string(),
            path_type,
            fs_path: None,
            link_target: None,
            mode,
            owner: "root".to_string(),
            uid: 0,
            group: "root".to_string(),
            gid: 0,
            mtime: 42,
            may_steal_fs_path: false,
        }
    }

    #[test]
    fn data_tar_members() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("deb-assembly-test-")
            .tempdir()?;
        let source = td.path().join("hello");
        std::fs::write(&source, b"hello world")?;

        let long_dir = format!("./usr/share/{}/", "x".repeat(120));
        let long_target = format!("/opt/{}", "y".repeat(120));

        let mut file = member("./usr/bin/hello", PathType::File, 0o755);
        file.fs_path = Some(source);
        file.owner = "games".to_string();
        file.uid = 5;
        let mut link = member("./usr/bin/long", PathType::Symlink, 0o777);
        link.link_target = Some(long_target.clone());

        let members = vec![
            member("./", PathType::Directory, 0o755),
            member("./usr/", PathType::Directory, 0o755),
            member("./usr/bin/", PathType::Directory, 0o755),
            file,
            link,
            member(&long_dir, PathType::Directory, 0o755),
        ];

        let buffer = write_tar(vec![], &members)?;

        let mut archive = tar::Archive::new(Cursor::new(buffer));
        let entries = archive.entries()?.collect::<std::io::Result<Vec<_>>>()?;
        assert_eq!(entries.len(), 6);

        let raw_name = |i: usize| entries[i].header().as_old().name.to_vec();
        assert!(raw_name(0).starts_with(b"./\0"));
        assert!(raw_name(1).starts_with(b"./usr/\0"));

        let hello = &entries[3];
        assert_eq!(hello.path()?, PathBuf::from("./usr/bin/hello"));
        assert_eq!(hello.header().mode()?, 0o755);
        assert_eq!(hello.header().uid()?, 5);
        assert_eq!(hello.header().username().ok().flatten(), Some("games"));
        assert_eq!(hello.header().mtime()?, 42);
        assert_eq!(hello.header().size()?, 11);

        let link = &entries[4];
        assert_eq!(link.header().entry_type(), tar::EntryType::Symlink);
        assert_eq!(
            link.link_name()?.map(|p| p.to_path_buf()),
            Some(PathBuf::from(&long_target))
        );

        assert_eq!(entries[5].path()?, PathBuf::from(&long_dir));

        Ok(())
    }

    #[test]
    fn file_source_must_be_regular_file() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("deb-assembly-test-")
            .tempdir()?;

        let mut file = member("./etc/foo", PathType::File, 0o644);
        file.fs_path = Some(td.path().to_path_buf());

        assert!(matches!(
            write_tar(vec![], [&file]),
            Err(DebAssemblyError::FsPathTypeMismatch {
                actual: "directory",
                ..
            })
        ));

        Ok(())
    }

    #[test]
    fn control_members_sorted_with_script_modes() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("deb-assembly-test-")
            .tempdir()?;
        let debian = td.path();
        std::fs::write(debian.join("postinst"), "#!/bin/sh\n")?;
        std::fs::write(debian.join("control"), "Package: foo\n")?;
        std::fs::write(debian.join("conffiles"), "/etc/foo\n")?;

        let members = control_members(debian, 10)?;
        let summary = members
            .iter()
            .map(|m| (m.member_path.as_str(), m.mode, m.mtime))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                ("./", 0o755, 10),
                ("./conffiles", 0o644, 10),
                ("./control", 0o644, 10),
                ("./postinst", 0o755, 10),
            ]
        );

        std::fs::create_dir(debian.join("nested"))?;
        assert!(matches!(
            control_members(debian, 10),
            Err(DebAssemblyError::FsPathTypeMismatch { .. })
        ));

        Ok(())
    }
}
