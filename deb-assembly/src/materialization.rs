// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Materialization of package roots and their assembly into `.deb` files.

Materialization turns an [IntermediateManifest] into a real directory tree:

```text
<output>/
  deb-root/                                  the data.tar content
  deb-root/DEBIAN/                           the control.tar content
  deb-structure-intermediate-manifest.json   manifest pointing into deb-root/
  env-and-cli.json                           settings for a later assembly
```

Materialization never changes ownership. A materialized directory can then be
assembled by `dpkg-deb` (which takes ownership from the filesystem and may
therefore need root) or by the built-in packer (which takes ownership from the
manifest).
*/

use {
    crate::{
        command::{
            detect_fakeroot, running_as_root, xargs, ExternalCommand, MAX_COMMAND_LINE_BYTES,
        },
        control::compute_output_filename,
        deb::{
            packer::{pack, CompressionArguments},
            tarball::describe_file_type,
        },
        environment::{AssemblyEnvironment, EnvironmentOverlay, SOURCE_DATE_EPOCH},
        error::{DebAssemblyError, Result},
        intermediate_manifest::{IntermediateManifest, PathType, TarMember},
    },
    filetime::FileTime,
    log::info,
    serde::{Deserialize, Serialize},
    std::{
        collections::BTreeMap,
        ffi::OsStr,
        fmt::{Display, Formatter},
        fs::Permissions,
        os::unix::fs::{MetadataExt, PermissionsExt},
        path::{Path, PathBuf},
        str::FromStr,
        time::Instant,
    },
};

/// Directory holding the package content within a materialized directory.
pub const DEB_ROOT_DIR: &str = "deb-root";

/// File holding the rewritten manifest within a materialized directory.
pub const MATERIALIZED_MANIFEST_FILENAME: &str = "deb-structure-intermediate-manifest.json";

/// File holding recorded settings within a materialized directory.
pub const ENV_AND_CLI_FILENAME: &str = "env-and-cli.json";

/// `dpkg-deb` arguments implied by building a udeb.
pub const UDEB_DPKG_DEB_ARGS: [&str; 3] = ["-z6", "-Zxz", "-Sextreme"];

/// The tool that assembles a materialized package.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildMethod {
    /// The built-in packer.
    Debputy,
    /// `dpkg-deb --build`.
    DpkgDeb,
}

impl BuildMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Debputy => "debputy",
            Self::DpkgDeb => "dpkg-deb",
        }
    }
}

impl Display for BuildMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BuildMethod {
    type Err = DebAssemblyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debputy" => Ok(Self::Debputy),
            "dpkg-deb" => Ok(Self::DpkgDeb),
            _ => Err(DebAssemblyError::Usage(format!(
                "unknown build method {:?}; expected debputy or dpkg-deb",
                s
            ))),
        }
    }
}

/// Command line arguments recorded in `env-and-cli.json`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RecordedCli {
    #[serde(rename = "dpkg-deb", default)]
    pub dpkg_deb: Vec<String>,
}

/// The content of `env-and-cli.json`.
///
/// Environment variables recorded as `null` were unset at materialization
/// time and are unset again for assembly.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MaterializationRecord {
    #[serde(default)]
    pub env: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub cli: RecordedCli,
    #[serde(default)]
    pub udeb: bool,
}

impl MaterializationRecord {
    pub fn new(
        source_date_epoch: u64,
        environment: &AssemblyEnvironment,
        dpkg_deb_args: Vec<String>,
        is_udeb: bool,
    ) -> Self {
        let mut env = environment.dpkg_deb_variables();
        env.insert(
            SOURCE_DATE_EPOCH.to_string(),
            Some(source_date_epoch.to_string()),
        );

        Self {
            env,
            cli: RecordedCli {
                dpkg_deb: dpkg_deb_args,
            },
            udeb: is_udeb,
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let fh = std::fs::File::open(path)
            .map_err(|e| DebAssemblyError::filesystem("opening", path, e))?;
        Ok(serde_json::from_reader(std::io::BufReader::new(fh))?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let fh = std::fs::File::create(path)
            .map_err(|e| DebAssemblyError::filesystem("creating", path, e))?;
        serde_json::to_writer(fh, self)?;
        Ok(())
    }

    /// The recorded `SOURCE_DATE_EPOCH`.
    pub fn source_date_epoch(&self) -> Result<u64> {
        let value = self
            .env
            .get(SOURCE_DATE_EPOCH)
            .and_then(|v| v.as_deref())
            .ok_or_else(|| {
                DebAssemblyError::Usage(
                    "cannot reproduce the deb: no source date epoch was recorded in the \
                     materialized deb root"
                        .to_string(),
                )
            })?;

        value
            .parse::<u64>()
            .map_err(|_| DebAssemblyError::InvalidEnvironmentValue(SOURCE_DATE_EPOCH, value.to_string()))
    }

    /// The recorded variables as an overlay for child processes.
    pub fn overlay(&self) -> EnvironmentOverlay {
        self.env
            .iter()
            .fold(EnvironmentOverlay::new(), |overlay, (name, value)| match value {
                Some(value) => overlay.set(name, value),
                None => overlay.unset(name),
            })
    }

    /// The recorded variables as an environment for the built-in packer.
    pub fn environment(&self) -> AssemblyEnvironment {
        AssemblyEnvironment::from_vars(
            self.env
                .iter()
                .filter_map(|(name, value)| value.as_ref().map(|v| (name, v))),
        )
    }

    /// The `dpkg-deb` arguments, including those implied by a udeb.
    pub fn dpkg_deb_args(&self) -> Vec<String> {
        let mut args = vec![];
        if self.udeb {
            args.extend(UDEB_DPKG_DEB_ARGS.iter().map(|s| s.to_string()));
        }
        args.extend(self.cli.dpkg_deb.iter().cloned());
        args
    }
}

/// Settings for [materialize_deb].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MaterializeOptions {
    pub source_date_epoch: u64,
    /// Arguments for `dpkg-deb` recorded for the assembly step.
    pub dpkg_deb_args: Vec<String>,
    pub is_udeb: bool,
    /// Whether the control directory may be moved instead of copied.
    pub may_move_control_files: bool,
    /// Whether files marked as stealable may be moved instead of copied.
    pub may_move_data_files: bool,
    /// Whether an existing output directory is removed instead of being an error.
    pub discard_existing_output: bool,
}

fn materialization_path(deb_root: &Path, member: &TarMember) -> PathBuf {
    match member.relative_path() {
        "" => deb_root.to_path_buf(),
        rel => deb_root.join(rel),
    }
}

fn to_filetime(mtime: u64) -> FileTime {
    FileTime::from_unix_time(mtime as i64, 0)
}

fn check_fs_path_is_file(member: &TarMember, fs_path: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(fs_path)
        .map_err(|e| DebAssemblyError::filesystem("reading metadata of", fs_path, e))?;

    if metadata.is_file() {
        Ok(())
    } else {
        Err(DebAssemblyError::FsPathTypeMismatch {
            member: member.member_path.clone(),
            fs_path: fs_path.to_path_buf(),
            expected: "file",
            actual: describe_file_type(&metadata),
        })
    }
}

/// Apply the mode and modification time of a member to a materialized path.
///
/// With `apply_ownership`, uid and gid are applied as well. Symlinks are
/// never followed. Under fakeroot, ownership changes are verified.
pub fn apply_fs_metadata(
    path: &Path,
    member: &TarMember,
    apply_ownership: bool,
    is_using_fakeroot: bool,
) -> Result<()> {
    if apply_ownership {
        std::os::unix::fs::lchown(path, Some(member.uid), Some(member.gid))
            .map_err(|e| DebAssemblyError::filesystem("changing ownership of", path, e))?;
    }

    if member.path_type != PathType::Symlink {
        std::fs::set_permissions(path, Permissions::from_mode(member.mode))
            .map_err(|e| DebAssemblyError::filesystem("changing mode of", path, e))?;
    }

    let mtime = to_filetime(member.mtime);
    filetime::set_symlink_file_times(path, mtime, mtime)
        .map_err(|e| DebAssemblyError::filesystem("changing timestamps of", path, e))?;

    if is_using_fakeroot {
        let metadata = std::fs::symlink_metadata(path)
            .map_err(|e| DebAssemblyError::filesystem("reading metadata of", path, e))?;
        if metadata.uid() != member.uid || metadata.gid() != member.gid {
            return Err(DebAssemblyError::OwnershipNotApplied(path.to_path_buf()));
        }
    }

    Ok(())
}

/// Create the data part of a materialized package below `deb_root`.
///
/// Returns the materialized paths paired with the rewritten members.
fn materialize_data(
    deb_root: &Path,
    manifest: &IntermediateManifest,
    may_move_data_files: bool,
) -> Result<Vec<(PathBuf, TarMember)>> {
    let start = Instant::now();
    info!("materializing data.tar part of the deb");

    let mut directories = vec![];
    let mut symlinks = vec![];
    let mut bulk_copies: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    let mut copies = vec![];
    let mut renames = vec![];
    let mut replacements = vec![];

    for member in manifest.iter() {
        let path = materialization_path(deb_root, member);

        match member.path_type {
            PathType::Directory => directories.push(path.clone()),
            PathType::Symlink => {
                let target = member.link_target.clone().ok_or_else(|| {
                    DebAssemblyError::InvalidManifest(format!(
                        "{}: symlinks must have a link target",
                        member.member_path
                    ))
                })?;
                symlinks.push((target, path.clone()));
            }
            PathType::File => {
                let fs_path = member.fs_path.clone().ok_or_else(|| {
                    DebAssemblyError::InvalidManifest(format!(
                        "{}: files must have an fs-path",
                        member.member_path
                    ))
                })?;
                check_fs_path_is_file(member, &fs_path)?;

                if may_move_data_files && member.may_steal_fs_path {
                    renames.push((fs_path, path.clone()));
                } else if fs_path.file_name() == path.file_name() {
                    let parent = path.parent().unwrap_or(deb_root).to_path_buf();
                    bulk_copies.entry(parent).or_default().push(fs_path);
                } else {
                    copies.push((fs_path, path.clone()));
                }
            }
        }

        let mut replacement = member.clone();
        if replacement.fs_path.is_some() {
            replacement.fs_path = Some(match member.relative_path() {
                "" => PathBuf::from(DEB_ROOT_DIR),
                rel => Path::new(DEB_ROOT_DIR).join(rel),
            });
            replacement.may_steal_fs_path = false;
        }
        replacements.push((path, replacement));
    }

    for command in xargs(&["mkdir"], &directories, MAX_COMMAND_LINE_BYTES)? {
        command.run()?;
    }

    for (dest_dir, files) in &bulk_copies {
        let static_args = [
            OsStr::new("cp"),
            OsStr::new("--reflink=auto"),
            OsStr::new("-t"),
            dest_dir.as_os_str(),
        ];
        for command in xargs(&static_args, files, MAX_COMMAND_LINE_BYTES)? {
            command.run()?;
        }
    }

    for (source, dest) in &copies {
        ExternalCommand::new([
            OsStr::new("cp"),
            OsStr::new("--reflink=auto"),
            source.as_os_str(),
            dest.as_os_str(),
        ])
        .run()?;
    }

    for (source, dest) in &renames {
        info!("mv {} {}", source.display(), dest.display());
        std::fs::rename(source, dest)
            .map_err(|e| DebAssemblyError::filesystem("moving", source, e))?;
    }

    for (target, path) in &symlinks {
        info!("ln -s {} {}", target, path.display());
        std::os::unix::fs::symlink(target, path)
            .map_err(|e| DebAssemblyError::filesystem("creating symlink", path, e))?;
    }

    // Parents last, so writes into a directory do not disturb its timestamp.
    for (path, member) in replacements.iter().rev() {
        apply_fs_metadata(path, member, false, false)?;
    }

    info!(
        "materialization of data.tar finished, took {:?}",
        start.elapsed()
    );

    Ok(replacements)
}

fn materialize_control(control_root: &Path, deb_root: &Path, may_move: bool) -> Result<()> {
    let control_dir = deb_root.join("DEBIAN");

    if may_move {
        info!("mv {} {}", control_root.display(), control_dir.display());
        std::fs::rename(control_root, &control_dir)
            .map_err(|e| DebAssemblyError::filesystem("moving", control_root, e))?;
        return Ok(());
    }

    std::fs::create_dir(&control_dir)
        .map_err(|e| DebAssemblyError::filesystem("creating directory", &control_dir, e))?;

    let mut entries = std::fs::read_dir(control_root)
        .map_err(|e| DebAssemblyError::filesystem("listing", control_root, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| DebAssemblyError::filesystem("listing", control_root, e))?;
    entries.sort();

    let mut args = vec![OsStr::new("cp"), OsStr::new("-a")];
    args.extend(entries.iter().map(|p| p.as_os_str()));
    args.push(control_dir.as_os_str());

    ExternalCommand::new(args).run()
}

/// Materialize a package root from a control directory and a manifest.
///
/// Returns the rewritten manifest, whose `fs-path` values are relative to
/// `output_dir`.
pub fn materialize_deb(
    control_root: &Path,
    manifest: &IntermediateManifest,
    output_dir: &Path,
    options: &MaterializeOptions,
    environment: &AssemblyEnvironment,
) -> Result<IntermediateManifest> {
    if !control_root.join("control").is_file() {
        return Err(DebAssemblyError::MissingControlFile(
            control_root.to_path_buf(),
        ));
    }
    manifest.validate()?;

    if std::fs::symlink_metadata(output_dir).is_ok() {
        if !options.discard_existing_output {
            return Err(DebAssemblyError::OutputExists(output_dir.to_path_buf()));
        }

        info!(
            "removing existing path {} as requested by --discard-existing-output",
            output_dir.display()
        );
        let removal = if output_dir.is_dir() {
            std::fs::remove_dir_all(output_dir)
        } else {
            std::fs::remove_file(output_dir)
        };
        removal.map_err(|e| DebAssemblyError::filesystem("removing", output_dir, e))?;
    }

    std::fs::create_dir(output_dir)
        .map_err(|e| DebAssemblyError::filesystem("creating directory", output_dir, e))?;

    let deb_root = output_dir.join(DEB_ROOT_DIR);
    let replacements = materialize_data(&deb_root, manifest, options.may_move_data_files)?;
    materialize_control(control_root, &deb_root, options.may_move_control_files)?;

    // Creating DEBIAN/ touched the root directory.
    if let Some((path, member)) = replacements.first() {
        apply_fs_metadata(path, member, false, false)?;
    }

    let rewritten =
        IntermediateManifest::from_members(replacements.into_iter().map(|(_, m)| m).collect())?;

    let manifest_path = output_dir.join(MATERIALIZED_MANIFEST_FILENAME);
    let fh = std::fs::File::create(&manifest_path)
        .map_err(|e| DebAssemblyError::filesystem("creating", &manifest_path, e))?;
    rewritten.write_json(std::io::BufWriter::new(fh))?;

    MaterializationRecord::new(
        options.source_date_epoch,
        environment,
        options.dpkg_deb_args.clone(),
        options.is_udeb,
    )
    .write(&output_dir.join(ENV_AND_CLI_FILENAME))?;

    Ok(rewritten)
}

fn prepare_output_path(
    materialized_dir: &Path,
    deb_root: &Path,
    method: BuildMethod,
    output: Option<&Path>,
    is_udeb: bool,
) -> Result<PathBuf> {
    match output {
        None => {
            let output_dir = materialized_dir.join("output");
            if !output_dir.is_dir() {
                std::fs::create_dir(&output_dir).map_err(|e| {
                    DebAssemblyError::filesystem("creating directory", &output_dir, e)
                })?;
            }
            Ok(output_dir.join(format!(
                "{}.{}",
                method,
                if is_udeb { "udeb" } else { "deb" }
            )))
        }
        Some(path) if path.is_dir() => {
            Ok(path.join(compute_output_filename(deb_root.join("DEBIAN"), is_udeb)?))
        }
        Some(path) => Ok(path.to_path_buf()),
    }
}

/// Assemble a `.deb` from a directory produced by [materialize_deb].
///
/// `combined` indicates that materialization happened in the same invocation,
/// in which case the filesystem metadata is already correct unless ownership
/// must be applied. Returns the path of the assembled package.
pub fn build_materialized_deb(
    materialized_dir: &Path,
    method: BuildMethod,
    output: Option<&Path>,
    combined: bool,
    environment: &AssemblyEnvironment,
) -> Result<PathBuf> {
    let deb_root = materialized_dir.join(DEB_ROOT_DIR);
    let record = MaterializationRecord::read(&materialized_dir.join(ENV_AND_CLI_FILENAME))?;
    let source_date_epoch = record.source_date_epoch()?;

    info!("rebasing relative paths in the intermediate manifest");
    let manifest_path = materialized_dir.join(MATERIALIZED_MANIFEST_FILENAME);
    let mut members = IntermediateManifest::from_path_or_stdin(&manifest_path)?.into_members();
    for member in members.iter_mut() {
        if let Some(fs_path) = &member.fs_path {
            if fs_path.is_relative() {
                member.fs_path = Some(materialized_dir.join(fs_path));
            }
        }
    }
    let manifest = IntermediateManifest::from_members(members)?;

    let output = prepare_output_path(
        materialized_dir,
        &deb_root,
        method,
        output,
        record.udeb,
    )?;

    let start = Instant::now();

    match method {
        BuildMethod::DpkgDeb => {
            let needs_root = manifest.needs_root_ownership();

            let (mut args, is_using_fakeroot) = if needs_root {
                if !running_as_root()? {
                    return Err(DebAssemblyError::RootRequired(
                        "must be run as root or under fakeroot when using the build method \
                         dpkg-deb due to the ownership of the package contents"
                            .to_string(),
                    ));
                }
                let is_using_fakeroot = detect_fakeroot(environment)?;
                if is_using_fakeroot {
                    info!("running under fakeroot");
                }
                info!("applying ownership, mode and timestamps from the intermediate manifest");
                (vec!["dpkg-deb".to_string()], is_using_fakeroot)
            } else {
                info!("applying mode and timestamps from the intermediate manifest");
                (
                    vec!["dpkg-deb".to_string(), "--root-owner-group".to_string()],
                    false,
                )
            };

            if needs_root || !combined {
                for member in manifest.iter().rev() {
                    apply_fs_metadata(
                        &materialization_path(&deb_root, member),
                        member,
                        needs_root,
                        is_using_fakeroot,
                    )?;
                }
            }

            args.extend(record.dpkg_deb_args());
            args.push("--build".to_string());
            args.push(deb_root.to_string_lossy().to_string());
            args.push(output.to_string_lossy().to_string());

            ExternalCommand::new(args)
                .overlay(record.overlay())
                .run()?;
        }
        BuildMethod::Debputy => {
            let options = CompressionArguments::parse_dpkg_deb_args(&record.dpkg_deb_args())?
                .resolve(&record.environment(), source_date_epoch)?;
            pack(&deb_root, &manifest, &output, &options)?;
        }
    }

    info!("assembly took {:?}", start.elapsed());

    Ok(output)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::environment::{DPKG_DEB_COMPRESSOR_TYPE, DPKG_DEB_THREADS_MAX},
    };

    fn have_tools() -> bool {
        which::which("cp").is_ok() && which::which("mkdir").is_ok()
    }

    fn member(path: &str, path_type: PathType, mode: u32, mtime: u64) -> TarMember {
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
            mtime,
            may_steal_fs_path: false,
        }
    }

    struct Fixture {
        _td: tempfile::TempDir,
        control_root: PathBuf,
        source: PathBuf,
        output: PathBuf,
        manifest: IntermediateManifest,
    }

    fn fixture() -> Result<Fixture> {
        let td = tempfile::Builder::new()
            .prefix("deb-assembly-test-")
            .tempdir()?;

        let control_root = td.path().join("control");
        std::fs::create_dir(&control_root)?;
        std::fs::write(
            control_root.join("control"),
            "Package: foo\nVersion: 1.0\nArchitecture: all\n",
        )?;
        std::fs::write(control_root.join("postinst"), "#!/bin/sh\n")?;

        let source = td.path().join("source");
        std::fs::create_dir(&source)?;
        std::fs::write(source.join("foo"), "foo binary")?;
        std::fs::write(source.join("README"), "readme")?;
        std::fs::write(source.join("scratch-artifact"), "artifact")?;

        let mut foo = member("./usr/bin/foo", PathType::File, 0o755, 100);
        foo.fs_path = Some(source.join("foo"));
        let mut readme = member("./usr/share/doc/foo/README.txt", PathType::File, 0o644, 100);
        readme.fs_path = Some(source.join("README"));
        let mut stolen = member("./usr/share/foo/data", PathType::File, 0o644, 100);
        stolen.fs_path = Some(source.join("scratch-artifact"));
        stolen.may_steal_fs_path = true;
        let mut link = member("./usr/bin/bar", PathType::Symlink, 0o777, 100);
        link.link_target = Some("foo".to_string());

        let manifest = IntermediateManifest::from_members(vec![
            member("./", PathType::Directory, 0o755, 50),
            member("./usr/", PathType::Directory, 0o755, 50),
            member("./usr/bin/", PathType::Directory, 0o755, 50),
            foo,
            member("./usr/share/", PathType::Directory, 0o755, 50),
            member("./usr/share/doc/", PathType::Directory, 0o755, 50),
            member("./usr/share/doc/foo/", PathType::Directory, 0o755, 50),
            readme,
            member("./usr/share/foo/", PathType::Directory, 0o700, 50),
            stolen,
            link,
        ])?;

        let output = td.path().join("materialized");

        Ok(Fixture {
            _td: td,
            control_root,
            source,
            output,
            manifest,
        })
    }

    fn options() -> MaterializeOptions {
        MaterializeOptions {
            source_date_epoch: 100,
            may_move_data_files: true,
            ..Default::default()
        }
    }

    #[test]
    fn materialize_layout_and_metadata() -> Result<()> {
        if !have_tools() {
            return Ok(());
        }

        let fixture = fixture()?;
        let environment = AssemblyEnvironment::from_vars([("DPKG_DEB_COMPRESSOR_TYPE", "gzip")]);
        let rewritten = materialize_deb(
            &fixture.control_root,
            &fixture.manifest,
            &fixture.output,
            &options(),
            &environment,
        )?;

        let deb_root = fixture.output.join(DEB_ROOT_DIR);
        assert_eq!(std::fs::read(deb_root.join("usr/bin/foo"))?, b"foo binary");
        assert_eq!(
            std::fs::read(deb_root.join("usr/share/doc/foo/README.txt"))?,
            b"readme"
        );
        assert_eq!(
            std::fs::read_link(deb_root.join("usr/bin/bar"))?,
            PathBuf::from("foo")
        );
        assert!(deb_root.join("DEBIAN/control").is_file());
        assert!(deb_root.join("DEBIAN/postinst").is_file());

        // Stealable files are moved; others are copied.
        assert!(!fixture.source.join("scratch-artifact").exists());
        assert!(fixture.source.join("foo").exists());
        assert!(fixture.control_root.exists());

        let metadata = std::fs::metadata(deb_root.join("usr/share/foo"))?;
        assert_eq!(metadata.permissions().mode() & 0o7777, 0o700);
        assert_eq!(FileTime::from_last_modification_time(&metadata).unix_seconds(), 50);
        let metadata = std::fs::metadata(deb_root.join("usr/bin/foo"))?;
        assert_eq!(metadata.permissions().mode() & 0o7777, 0o755);
        assert_eq!(FileTime::from_last_modification_time(&metadata).unix_seconds(), 100);
        let metadata = std::fs::metadata(&deb_root)?;
        assert_eq!(FileTime::from_last_modification_time(&metadata).unix_seconds(), 50);

        let foo = rewritten
            .iter()
            .find(|m| m.member_path == "./usr/share/foo/data")
            .expect("member should be present");
        assert_eq!(foo.fs_path, Some(PathBuf::from("deb-root/usr/share/foo/data")));
        assert!(!foo.may_steal_fs_path);
        assert!(rewritten.members()[0].fs_path.is_none());

        let on_disk = IntermediateManifest::from_path_or_stdin(
            fixture.output.join(MATERIALIZED_MANIFEST_FILENAME),
        )?;
        assert_eq!(on_disk, rewritten);

        let record = MaterializationRecord::read(&fixture.output.join(ENV_AND_CLI_FILENAME))?;
        assert_eq!(record.source_date_epoch()?, 100);
        assert_eq!(
            record.env.get(DPKG_DEB_COMPRESSOR_TYPE),
            Some(&Some("gzip".to_string()))
        );
        assert_eq!(record.env.get(DPKG_DEB_THREADS_MAX), Some(&None));
        assert!(!record.udeb);

        Ok(())
    }

    #[test]
    fn existing_output() -> Result<()> {
        if !have_tools() {
            return Ok(());
        }

        let fixture = fixture()?;
        std::fs::create_dir(&fixture.output)?;
        std::fs::write(fixture.output.join("stale"), "stale")?;

        let environment = AssemblyEnvironment::default();
        let mut options = options();
        options.may_move_data_files = false;

        assert!(matches!(
            materialize_deb(
                &fixture.control_root,
                &fixture.manifest,
                &fixture.output,
                &options,
                &environment,
            ),
            Err(DebAssemblyError::OutputExists(_))
        ));

        options.discard_existing_output = true;
        materialize_deb(
            &fixture.control_root,
            &fixture.manifest,
            &fixture.output,
            &options,
            &environment,
        )?;
        assert!(!fixture.output.join("stale").exists());
        assert!(fixture.source.join("scratch-artifact").exists());

        Ok(())
    }

    #[test]
    fn control_file_required() -> Result<()> {
        let fixture = fixture()?;
        std::fs::remove_file(fixture.control_root.join("control"))?;

        assert!(matches!(
            materialize_deb(
                &fixture.control_root,
                &fixture.manifest,
                &fixture.output,
                &options(),
                &AssemblyEnvironment::default(),
            ),
            Err(DebAssemblyError::MissingControlFile(_))
        ));
        assert!(!fixture.output.exists());

        Ok(())
    }

    #[test]
    fn symlinked_fs_path_rejected() -> Result<()> {
        if !have_tools() {
            return Ok(());
        }

        let fixture = fixture()?;
        let artifact = fixture.source.join("scratch-artifact");
        std::fs::remove_file(&artifact)?;
        std::os::unix::fs::symlink("foo", &artifact)?;

        let res = materialize_deb(
            &fixture.control_root,
            &fixture.manifest,
            &fixture.output,
            &options(),
            &AssemblyEnvironment::default(),
        );
        assert!(matches!(
            res,
            Err(DebAssemblyError::FsPathTypeMismatch {
                expected: "file",
                actual: "symlink",
                ..
            })
        ));
        // The link target must not have been moved into the package.
        assert!(fixture.source.join("foo").is_file());
        assert!(std::fs::symlink_metadata(&artifact)?.file_type().is_symlink());

        Ok(())
    }

    #[test]
    fn build_with_builtin_packer() -> Result<()> {
        if !have_tools() {
            return Ok(());
        }

        let fixture = fixture()?;
        let mut options = options();
        options.dpkg_deb_args = vec!["-Znone".to_string(), "--root-owner-group".to_string()];
        options.may_move_control_files = true;
        materialize_deb(
            &fixture.control_root,
            &fixture.manifest,
            &fixture.output,
            &options,
            &AssemblyEnvironment::default(),
        )?;
        assert!(!fixture.control_root.exists());

        let deb = build_materialized_deb(
            &fixture.output,
            BuildMethod::Debputy,
            None,
            false,
            &AssemblyEnvironment::default(),
        )?;
        assert_eq!(deb, fixture.output.join("output").join("debputy.deb"));

        let data = std::fs::read(&deb)?;
        assert!(data.starts_with(b"!<arch>\ndebian-binary   100"));
        let data_tar_header = format!("{:<16}", "data.tar");
        assert!(data
            .windows(16)
            .any(|w| w == data_tar_header.as_bytes()));

        // An existing directory gets a name derived from the control file.
        let out_dir = fixture.output.join("elsewhere");
        std::fs::create_dir(&out_dir)?;
        let deb = build_materialized_deb(
            &fixture.output,
            BuildMethod::Debputy,
            Some(&out_dir),
            false,
            &AssemblyEnvironment::default(),
        )?;
        assert_eq!(deb, out_dir.join("foo_1.0_all.deb"));
        assert_eq!(std::fs::read(&deb)?, data);

        Ok(())
    }

    #[test]
    fn record_environment() -> Result<()> {
        let environment = AssemblyEnvironment::from_vars([
            ("DPKG_DEB_COMPRESSOR_LEVEL", "3"),
            ("DEB_BUILD_OPTIONS", "nocheck"),
        ]);
        let record = MaterializationRecord::new(42, &environment, vec!["-Zgzip".into()], true);

        let json = serde_json::to_value(&record)?;
        assert_eq!(
            json,
            serde_json::json!({
                "env": {
                    "DPKG_DEB_COMPRESSOR_LEVEL": "3",
                    "DPKG_DEB_COMPRESSOR_TYPE": null,
                    "DPKG_DEB_THREADS_MAX": null,
                    "SOURCE_DATE_EPOCH": "42",
                },
                "cli": {"dpkg-deb": ["-Zgzip"]},
                "udeb": true,
            })
        );

        assert_eq!(
            record.dpkg_deb_args(),
            vec!["-z6", "-Zxz", "-Sextreme", "-Zgzip"]
        );
        assert_eq!(
            record.environment().get("DPKG_DEB_COMPRESSOR_LEVEL"),
            Some("3")
        );
        assert_eq!(record.environment().get("DPKG_DEB_COMPRESSOR_TYPE"), None);

        let missing: MaterializationRecord = serde_json::from_str("{}")?;
        assert!(missing.source_date_epoch().is_err());

        assert_eq!("dpkg-deb".parse::<BuildMethod>()?, BuildMethod::DpkgDeb);
        assert!("tar".parse::<BuildMethod>().is_err());

        Ok(())
    }
}
