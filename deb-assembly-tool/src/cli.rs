// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    deb_assembly::{
        assembly::AssemblyOrchestrator,
        deb::packer::{pack, CompressionArguments},
        environment::{resolve_source_date_epoch, AssemblyEnvironment},
        error::DebAssemblyError,
        intermediate_manifest::IntermediateManifest,
        materialization::{build_materialized_deb, materialize_deb, BuildMethod, MaterializeOptions},
    },
    log::{info, LevelFilter},
    std::path::Path,
    thiserror::Error,
};

const MATERIALIZE_DEB_ABOUT: &str = "\
Materialize a package root from an intermediate package manifest.

The control files in <control-root-dir> and the data files described by the
manifest are staged below <output-dir>, with the modes, ownership and
modification times the manifest requests. Ownership is only applied when
running as (fake)root.

<output-dir> receives the following entries:

deb-root/
   The package root. `deb-root/DEBIAN` holds the control files.

deb-structure-intermediate-manifest.json
   The manifest, with source paths rewritten to point into `deb-root`.

env-and-cli.json
   The environment and dpkg-deb arguments that apply when the materialized
   package is later assembled via `build-materialized-deb`.

With --build-method, the package is assembled immediately and written to
--assembled-deb-output.

Arguments after `--` are recorded as dpkg-deb arguments.
";

const BUILD_MATERIALIZED_DEB_ABOUT: &str = "\
Assemble a package previously staged by `materialize-deb`.

The `dpkg-deb` method requires running as (fake)root when the package contains
content not owned by root. The `debputy` method uses the built-in packer,
which never requires any privileges.
";

const PACK_ABOUT: &str = "\
Assemble a .deb file from a package root and an intermediate package manifest.

<package-root-dir> must contain a `DEBIAN` directory with the control files.
Data files are read from the source paths recorded in the manifest.

If <output-path> is a directory, the package is written there using the
canonical `<package>_<version>_<architecture>.deb` file name.

Compression settings not given on the command line are taken from the
DPKG_DEB_COMPRESSOR_TYPE, DPKG_DEB_COMPRESSOR_LEVEL and DPKG_DEB_THREADS_MAX
environment variables.
";

const ASSEMBLE_DEB_ABOUT: &str = "\
Materialize and assemble a single package.

How the package is assembled depends on the ownership of its content and on
DEB_RULES_REQUIRES_ROOT and DEB_GAIN_ROOT_CMD:

* Content owned by root is assembled by dpkg-deb without privileges.
* With `debputy/deb-assembly` in DEB_RULES_REQUIRES_ROOT, dpkg-deb runs via
  DEB_GAIN_ROOT_CMD.
* With DEB_RULES_REQUIRES_ROOT set to `no`, the built-in packer is used.

Materialization happens below --scratch-dir. Arguments after `--` are passed
to dpkg-deb.
";

#[derive(Debug, Error)]
pub enum DebAssemblerError {
    #[error("argument parsing error: {0:?}")]
    Clap(#[from] clap::Error),

    #[error("{0}")]
    Assembly(#[from] DebAssemblyError),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),

    #[error("invalid value for --{0}: {1}")]
    InvalidArgument(&'static str, String),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),
}

pub type Result<T> = std::result::Result<T, DebAssemblerError>;

fn required_path<'a>(args: &'a ArgMatches, name: &'static str) -> Result<&'a Path> {
    args.value_of_os(name)
        .map(Path::new)
        .ok_or(DebAssemblerError::MissingArgument(name))
}

fn optional_u64(args: &ArgMatches, name: &'static str) -> Result<Option<u64>> {
    args.value_of(name)
        .map(|v| {
            v.parse::<u64>()
                .map_err(|e| DebAssemblerError::InvalidArgument(name, format!("{}: {}", v, e)))
        })
        .transpose()
}

fn trailing_args(args: &ArgMatches) -> Vec<String> {
    args.values_of("upstream-args")
        .map(|values| values.map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

fn build_method(args: &ArgMatches, name: &'static str) -> Result<Option<BuildMethod>> {
    args.value_of(name)
        .map(|v| {
            v.parse::<BuildMethod>()
                .map_err(|e| DebAssemblerError::InvalidArgument(name, e.to_string()))
        })
        .transpose()
}

fn manifest_arg() -> Arg<'static> {
    Arg::new("intermediate-package-manifest")
        .long("intermediate-package-manifest")
        .takes_value(true)
        .required(true)
        .allow_invalid_utf8(true)
        .help("Path to the intermediate package manifest, or `-` to read it from stdin")
}

fn source_date_epoch_arg() -> Arg<'static> {
    Arg::new("source-date-epoch")
        .long("source-date-epoch")
        .takes_value(true)
        .help("Timestamp used to clamp modification times. Defaults to SOURCE_DATE_EPOCH")
}

fn upstream_args_arg() -> Arg<'static> {
    Arg::new("upstream-args")
        .multiple_values(true)
        .last(true)
        .allow_hyphen_values(true)
        .help("Arguments for dpkg-deb")
}

pub fn command() -> Command<'static> {
    let app = Command::new("Debian package assembler")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Materialize and assemble Debian binary packages")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        Command::new("materialize-deb")
            .about("Materialize a package root from an intermediate package manifest")
            .long_about(MATERIALIZE_DEB_ABOUT)
            .arg(manifest_arg())
            .arg(
                Arg::new("discard-existing-output")
                    .long("discard-existing-output")
                    .help("Remove <output-dir> if it already exists"),
            )
            .arg(source_date_epoch_arg())
            .arg(
                Arg::new("may-move-control-files")
                    .long("may-move-control-files")
                    .help("Move <control-root-dir> into place instead of copying it"),
            )
            .arg(
                Arg::new("may-move-data-files")
                    .long("may-move-data-files")
                    .help("Move data files the manifest marks as stealable instead of copying them"),
            )
            .arg(
                Arg::new("udeb")
                    .long("udeb")
                    .help("Materialize an installer package (udeb)"),
            )
            .arg(
                Arg::new("build-method")
                    .long("build-method")
                    .takes_value(true)
                    .possible_values(&["debputy", "dpkg-deb"])
                    .requires("assembled-deb-output")
                    .help("Assemble the package immediately using this method"),
            )
            .arg(
                Arg::new("assembled-deb-output")
                    .long("assembled-deb-output")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .requires("build-method")
                    .help("Where to write the assembled package"),
            )
            .arg(
                Arg::new("control-root-dir")
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("Directory holding the control files"),
            )
            .arg(
                Arg::new("output-dir")
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("Directory to materialize into"),
            )
            .arg(upstream_args_arg()),
    );

    let app = app.subcommand(
        Command::new("build-materialized-deb")
            .about("Assemble a package staged by materialize-deb")
            .long_about(BUILD_MATERIALIZED_DEB_ABOUT)
            .arg(
                Arg::new("output")
                    .long("output")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .help("Where to write the package. Defaults to a path within the materialized directory"),
            )
            .arg(
                Arg::new("materialized-dir")
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("Directory populated by materialize-deb"),
            )
            .arg(
                Arg::new("build-method")
                    .required(true)
                    .possible_values(&["debputy", "dpkg-deb"])
                    .help("Tool assembling the package"),
            ),
    );

    let app = app.subcommand(
        Command::new("pack")
            .about("Assemble a .deb file using the built-in packer")
            .long_about(PACK_ABOUT)
            .arg(manifest_arg())
            .arg(
                Arg::new("compression")
                    .short('Z')
                    .long("compression")
                    .takes_value(true)
                    .possible_values(&["xz", "gzip", "none"])
                    .help("Compression algorithm for the tar members"),
            )
            .arg(
                Arg::new("compression-level")
                    .short('z')
                    .long("compression-level")
                    .takes_value(true)
                    .help("Compression level"),
            )
            .arg(
                Arg::new("compression-strategy")
                    .short('S')
                    .long("compression-strategy")
                    .takes_value(true)
                    .help("Compression strategy; only `extreme` for xz is supported"),
            )
            .arg(
                Arg::new("uniform-compression")
                    .long("uniform-compression")
                    .overrides_with("no-uniform-compression")
                    .help("Compress control.tar and data.tar the same way (the default)"),
            )
            .arg(
                Arg::new("no-uniform-compression")
                    .long("no-uniform-compression")
                    .overrides_with("uniform-compression")
                    .help("Compress control.tar with gzip defaults"),
            )
            .arg(source_date_epoch_arg())
            .arg(
                Arg::new("package-root-dir")
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("Package root containing a DEBIAN directory"),
            )
            .arg(
                Arg::new("output-path")
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("File or directory to write the package to"),
            ),
    );

    app.subcommand(
        Command::new("assemble-deb")
            .about("Materialize and assemble a single package")
            .long_about(ASSEMBLE_DEB_ABOUT)
            .arg(manifest_arg())
            .arg(
                Arg::new("package")
                    .long("package")
                    .takes_value(true)
                    .required(true)
                    .help("Name of the binary package"),
            )
            .arg(
                Arg::new("scratch-dir")
                    .long("scratch-dir")
                    .takes_value(true)
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("Directory for intermediate files"),
            )
            .arg(
                Arg::new("udeb")
                    .long("udeb")
                    .help("Assemble an installer package (udeb)"),
            )
            .arg(source_date_epoch_arg())
            .arg(
                Arg::new("control-root-dir")
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("Directory holding the control files"),
            )
            .arg(
                Arg::new("output-path")
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("File or directory to write the package to"),
            )
            .arg(upstream_args_arg()),
    )
}

fn init_logging(matches: &ArgMatches) {
    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();
}

pub fn run_cli() -> Result<()> {
    let matches = command().get_matches();

    init_logging(&matches);

    let environment = AssemblyEnvironment::from_env();

    match matches.subcommand() {
        Some(("materialize-deb", args)) => command_materialize_deb(args, &environment),
        Some(("build-materialized-deb", args)) => {
            command_build_materialized_deb(args, &environment)
        }
        Some(("pack", args)) => command_pack(args, &environment),
        Some(("assemble-deb", args)) => command_assemble_deb(args, &environment),
        Some((command, _)) => Err(DebAssemblerError::InvalidSubCommand(command.to_string())),
        None => Err(DebAssemblerError::InvalidSubCommand(String::new())),
    }
}

fn materialize_options(
    args: &ArgMatches,
    environment: &AssemblyEnvironment,
) -> Result<MaterializeOptions> {
    Ok(MaterializeOptions {
        source_date_epoch: resolve_source_date_epoch(
            optional_u64(args, "source-date-epoch")?,
            environment,
        )?,
        dpkg_deb_args: trailing_args(args),
        is_udeb: args.is_present("udeb"),
        may_move_control_files: args.is_present("may-move-control-files"),
        may_move_data_files: args.is_present("may-move-data-files"),
        discard_existing_output: args.is_present("discard-existing-output"),
    })
}

fn command_materialize_deb(args: &ArgMatches, environment: &AssemblyEnvironment) -> Result<()> {
    let manifest = IntermediateManifest::from_path_or_stdin(required_path(
        args,
        "intermediate-package-manifest",
    )?)?;
    let control_root = required_path(args, "control-root-dir")?;
    let output_dir = required_path(args, "output-dir")?;
    let options = materialize_options(args, environment)?;

    materialize_deb(control_root, &manifest, output_dir, &options, environment)?;

    if let Some(method) = build_method(args, "build-method")? {
        let output = required_path(args, "assembled-deb-output")?;
        build_materialized_deb(output_dir, method, Some(output), true, environment)?;
    }

    Ok(())
}

fn command_build_materialized_deb(
    args: &ArgMatches,
    environment: &AssemblyEnvironment,
) -> Result<()> {
    let materialized_dir = required_path(args, "materialized-dir")?;
    let method = build_method(args, "build-method")?
        .ok_or(DebAssemblerError::MissingArgument("build-method"))?;
    let output = args.value_of_os("output").map(Path::new);

    build_materialized_deb(materialized_dir, method, output, false, environment)?;

    Ok(())
}

/// Collect the compression arguments of the `pack` command.
fn compression_arguments(args: &ArgMatches) -> Result<CompressionArguments> {
    Ok(CompressionArguments {
        compression: args.value_of("compression").map(|s| s.to_string()),
        level: args
            .value_of("compression-level")
            .map(|v| {
                v.parse::<u32>().map_err(|e| {
                    DebAssemblerError::InvalidArgument("compression-level", format!("{}: {}", v, e))
                })
            })
            .transpose()?,
        strategy: args.value_of("compression-strategy").map(|s| s.to_string()),
        threads_max: None,
        non_uniform: args.is_present("no-uniform-compression"),
    })
}

fn command_pack(args: &ArgMatches, environment: &AssemblyEnvironment) -> Result<()> {
    let manifest = IntermediateManifest::from_path_or_stdin(required_path(
        args,
        "intermediate-package-manifest",
    )?)?;
    let package_root = required_path(args, "package-root-dir")?;
    let output = required_path(args, "output-path")?;
    let source_date_epoch =
        resolve_source_date_epoch(optional_u64(args, "source-date-epoch")?, environment)?;

    let options = compression_arguments(args)?.resolve(environment, source_date_epoch)?;

    pack(package_root, &manifest, output, &options)?;

    Ok(())
}

fn command_assemble_deb(args: &ArgMatches, environment: &AssemblyEnvironment) -> Result<()> {
    let manifest = IntermediateManifest::from_path_or_stdin(required_path(
        args,
        "intermediate-package-manifest",
    )?)?;
    let package = args
        .value_of("package")
        .ok_or(DebAssemblerError::MissingArgument("package"))?;
    let scratch_dir = required_path(args, "scratch-dir")?;
    let control_root = required_path(args, "control-root-dir")?;
    let output = required_path(args, "output-path")?;
    let source_date_epoch =
        resolve_source_date_epoch(optional_u64(args, "source-date-epoch")?, environment)?;

    let current_exe = std::env::current_exe()?;
    let mut orchestrator = AssemblyOrchestrator::new(
        environment.clone(),
        [current_exe.as_os_str()],
        scratch_dir,
        source_date_epoch,
    )
    .with_upstream_args(trailing_args(args));

    let method = orchestrator.determine_assembly_method(package, &manifest)?;
    let deb_path = orchestrator.assemble_deb(
        package,
        &manifest,
        control_root,
        output,
        args.is_present("udeb"),
        &method,
    )?;

    info!("assembled {}", deb_path.display());

    Ok(())
}
