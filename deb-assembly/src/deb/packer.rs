// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Assembly of `.deb` files without `dpkg-deb`.

The packer writes an `ar` archive with the members `debian-binary`,
`control.tar<ext>` and `data.tar<ext>`. The tar streams are piped through an
external compressor whose output is written directly into the archive file.
Ownership comes from the intermediate manifest rather than from the
filesystem, so no privileges are needed.

The archive is written to a temporary file next to the destination and only
renamed into place once complete.
*/

use {
    crate::{
        command::render_command_line,
        control::compute_output_filename,
        deb::{
            ar::ArWriter,
            compression::{Compression, CompressionSettings, CompressionStrategy},
            tarball::{control_members, write_tar},
        },
        environment::AssemblyEnvironment,
        error::{DebAssemblyError, Result},
        intermediate_manifest::{IntermediateManifest, TarMember},
    },
    log::{info, warn},
    std::{
        fs::File,
        io::BufWriter,
        path::{Path, PathBuf},
        process::{Command, Stdio},
    },
};

/// Compression related options as accepted by `dpkg-deb --build`.
///
/// Values not given here fall back to the `DPKG_DEB_*` environment variables.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CompressionArguments {
    pub compression: Option<String>,
    pub level: Option<u32>,
    pub strategy: Option<String>,
    pub threads_max: Option<u32>,
    /// Compress `control.tar` with gzip defaults instead of the `data.tar` settings.
    pub non_uniform: bool,
}

fn parse_level(value: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|_| DebAssemblyError::Usage(format!("invalid compression level: {:?}", value)))
}

fn parse_threads(value: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|_| DebAssemblyError::Usage(format!("invalid thread count: {:?}", value)))
}

impl CompressionArguments {
    /// Parse `dpkg-deb` style arguments.
    ///
    /// `-Z`, `-z` and `-S` accept their value attached or as the next argument.
    /// Later occurrences override earlier ones. `--root-owner-group` and
    /// `-b/--build` are accepted and ignored.
    pub fn parse_dpkg_deb_args<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut result = Self::default();
        let mut iter = args.iter().map(|s| s.as_ref());

        while let Some(arg) = iter.next() {
            let mut take_value = |attached: &str, flag: &str| -> Result<String> {
                if !attached.is_empty() {
                    Ok(attached.to_string())
                } else {
                    iter.next().map(|v| v.to_string()).ok_or_else(|| {
                        DebAssemblyError::Usage(format!("{} requires a value", flag))
                    })
                }
            };

            match arg {
                "--uniform-compression" => result.non_uniform = false,
                "--no-uniform-compression" => result.non_uniform = true,
                "--root-owner-group" | "-b" | "--build" => {}
                _ if arg.starts_with("--threads-max") => {
                    let value = match arg.strip_prefix("--threads-max=") {
                        Some(value) => value.to_string(),
                        None if arg == "--threads-max" => take_value("", "--threads-max")?,
                        None => {
                            return Err(DebAssemblyError::Usage(format!(
                                "unsupported dpkg-deb option: {}",
                                arg
                            )))
                        }
                    };
                    result.threads_max = Some(parse_threads(&value)?);
                }
                _ if arg.starts_with("-Z") => {
                    result.compression = Some(take_value(&arg[2..], "-Z")?);
                }
                _ if arg.starts_with("-z") => {
                    result.level = Some(parse_level(&take_value(&arg[2..], "-z")?)?);
                }
                _ if arg.starts_with("-S") => {
                    result.strategy = Some(take_value(&arg[2..], "-S")?);
                }
                _ => {
                    return Err(DebAssemblyError::Usage(format!(
                        "unsupported dpkg-deb option: {}",
                        arg
                    )));
                }
            }
        }

        Ok(result)
    }

    /// Resolve into validated [PackOptions].
    pub fn resolve(&self, environment: &AssemblyEnvironment, mtime: u64) -> Result<PackOptions> {
        let compression = match &self.compression {
            Some(name) => Compression::from_name(name)?,
            None => match environment.compressor_type() {
                Some(name) => Compression::from_name(name)?,
                None => Compression::default(),
            },
        };
        let level = match self.level {
            Some(level) => Some(level),
            None => environment.compressor_level()?,
        };
        let strategy = self
            .strategy
            .as_deref()
            .map(CompressionStrategy::from_name)
            .transpose()?;
        let threads = match self.threads_max {
            Some(threads) => Some(threads),
            None => environment.threads_max()?,
        };

        let data = CompressionSettings::new(compression, level, strategy, threads)?;

        Ok(PackOptions::new(data, !self.non_uniform, mtime))
    }
}

/// Options for [pack].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackOptions {
    pub control: CompressionSettings,
    pub data: CompressionSettings,
    /// Timestamp of archive members and upper bound of control file timestamps.
    pub mtime: u64,
}

impl PackOptions {
    /// Construct an instance from `data.tar` settings.
    ///
    /// Without uniform compression, `control.tar` uses gzip at its default level.
    pub fn new(data: CompressionSettings, uniform_compression: bool, mtime: u64) -> Self {
        let control = if uniform_compression {
            data.clone()
        } else {
            CompressionSettings::defaults_for(Compression::Gzip)
        };

        Self {
            control,
            data,
            mtime,
        }
    }
}

/// Write a tar stream of `members` through the configured compressor into `output`.
///
/// The compressor writes to a duplicate of `output`'s file descriptor, so
/// the position of `output` reflects the compressed bytes once this returns.
pub fn write_compressed_tar<'a>(
    output: &mut File,
    members: impl IntoIterator<Item = &'a TarMember>,
    settings: &CompressionSettings,
) -> Result<()> {
    let args = match settings.command_line() {
        Some(args) => args,
        None => {
            write_tar(BufWriter::new(&mut *output), members)?
                .into_inner()
                .map_err(|e| e.into_error())?;
            return Ok(());
        }
    };

    let command_line = render_command_line(&args);
    let (program, program_args) = args
        .split_first()
        .ok_or_else(|| DebAssemblyError::Usage("empty compressor command".to_string()))?;

    let stdout = output.try_clone()?;
    let mut child = Command::new(program)
        .args(program_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(stdout))
        .spawn()
        .map_err(|source| DebAssemblyError::CommandSpawn {
            command: command_line.clone(),
            source,
        })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| DebAssemblyError::CommandFailed {
            command: command_line.clone(),
            status: "unable to open stdin".to_string(),
        })?;

    // Closing stdin on completion lets the compressor finish.
    let write_result = write_tar(BufWriter::new(stdin), members).and_then(|writer| {
        writer
            .into_inner()
            .map(drop)
            .map_err(|e| DebAssemblyError::from(e.into_error()))
    });

    let status = child
        .wait()
        .map_err(|source| DebAssemblyError::CommandSpawn {
            command: command_line.clone(),
            source,
        })?;

    // A dying compressor surfaces as a broken pipe while writing. Report
    // the compressor instead.
    if !status.success() {
        if let Err(err) = &write_result {
            warn!("error writing to compressor: {}", err);
        }
        return Err(DebAssemblyError::CommandFailed {
            command: command_line,
            status: status.to_string(),
        });
    }

    write_result
}

/// Resolve the path of the `.deb` to write.
///
/// An existing directory or a path ending in `/` gets a file name derived from
/// `<root>/DEBIAN/control`.
pub fn resolve_output_path(package_root: &Path, output: &Path) -> Result<PathBuf> {
    if output.to_string_lossy().ends_with('/') || output.is_dir() {
        Ok(output.join(compute_output_filename(
            package_root.join("DEBIAN"),
            false,
        )?))
    } else {
        Ok(output.to_path_buf())
    }
}

/// Assemble a `.deb` from a package root and its data manifest.
///
/// `package_root` must contain a `DEBIAN` directory holding the control files.
/// The content of `data.tar` comes entirely from `manifest`. Returns the path
/// of the written file.
pub fn pack(
    package_root: &Path,
    manifest: &IntermediateManifest,
    output: &Path,
    options: &PackOptions,
) -> Result<PathBuf> {
    let deb_path = resolve_output_path(package_root, output)?;
    let control = control_members(&package_root.join("DEBIAN"), options.mtime)?;

    let parent = match deb_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let temp = tempfile::Builder::new()
        .prefix(".deb-assembly-")
        .tempfile_in(&parent)
        .map_err(|e| DebAssemblyError::filesystem("creating a temporary file in", &parent, e))?;

    let file = temp
        .as_file()
        .try_clone()
        .map_err(|e| DebAssemblyError::filesystem("writing", temp.path(), e))?;

    let mut ar = ArWriter::new(file, options.mtime)?;
    ar.append_data("debian-binary", b"2.0\n")?;

    let control_name = format!("control.tar{}", options.control.compression().extension());
    let size = ar.append_streamed(&control_name, |fh| {
        write_compressed_tar(fh, &control, &options.control)
    })?;
    info!("wrote {} ({} bytes)", control_name, size);

    let data_name = format!("data.tar{}", options.data.compression().extension());
    let size = ar.append_streamed(&data_name, |fh| {
        write_compressed_tar(fh, manifest.iter(), &options.data)
    })?;
    info!("wrote {} ({} bytes)", data_name, size);

    ar.into_inner()
        .sync_all()
        .map_err(|e| DebAssemblyError::filesystem("writing", temp.path(), e))?;

    temp.persist(&deb_path)
        .map_err(|e| DebAssemblyError::filesystem("renaming into", &deb_path, e.error))?;

    info!("generated {}", deb_path.display());

    Ok(deb_path)
}
