// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Orchestration of package assembly.

Each package is materialized and assembled by separate invocations of the
`deb-assembler` executable, with the intermediate manifest passed on stdin.

How a package is assembled depends on its ownership needs:

* Content owned entirely by root is materialized and assembled by `dpkg-deb`
  in a single unprivileged invocation.
* Content with other owners needs `chown`. With targeted promotion
  (`debputy/deb-assembly` in `DEB_RULES_REQUIRES_ROOT`), materialization runs
  unprivileged and assembly runs through `DEB_GAIN_ROOT_CMD`.
* With `Rules-Requires-Root: no`, the built-in packer assembles the package
  without any privileges.
* Otherwise assembly is not possible.
*/

use {
    crate::{
        command::ExternalCommand,
        control::compute_output_filename,
        environment::{AssemblyEnvironment, TARGETED_PROMOTION_KEYWORD},
        error::{DebAssemblyError, Result},
        installations::BinaryPackage,
        intermediate_manifest::{IntermediateManifest, PathType},
        materialization::BuildMethod,
    },
    log::{info, warn},
    std::{
        collections::BTreeSet,
        ffi::OsString,
        path::{Path, PathBuf},
    },
};

/// How a package is assembled.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AssemblyMethod {
    /// Whether the package contains content not owned by root.
    pub needs_root: bool,
    /// Whether the built-in packer stands in for `dpkg-deb`.
    pub use_fallback: bool,
    /// Command to gain root for assembly.
    pub gain_root_command: Vec<String>,
}

impl AssemblyMethod {
    pub fn build_method(&self) -> BuildMethod {
        if self.needs_root && self.use_fallback {
            BuildMethod::Debputy
        } else {
            BuildMethod::DpkgDeb
        }
    }

    /// Whether materialization and assembly happen in one invocation.
    pub fn is_combined(&self) -> bool {
        !self.needs_root
    }
}

/// The commands assembling one package.
#[derive(Clone, Debug)]
pub struct AssemblyCommands {
    /// Materializes the package, and assembles it when combined.
    pub materialize: ExternalCommand,
    /// Assembles the materialized package when not combined.
    pub build: Option<ExternalCommand>,
    /// Where the package is written.
    pub output: PathBuf,
}

/// Content of the automatic debug symbol package of a package.
#[derive(Clone, Debug)]
pub struct DbgsymContent {
    pub manifest: IntermediateManifest,
    /// Directory holding the control files of the dbgsym package.
    pub control_dir: PathBuf,
}

/// A resolved package ready for assembly.
#[derive(Clone, Debug)]
pub struct PackageAssembly {
    pub package: BinaryPackage,
    pub manifest: IntermediateManifest,
    /// Directory holding the control files, usually `debian/<pkg>/DEBIAN`.
    pub control_dir: PathBuf,
    pub dbgsym: Option<DbgsymContent>,
}

/// Drives materialization and assembly of packages.
#[derive(Clone, Debug)]
pub struct AssemblyOrchestrator {
    environment: AssemblyEnvironment,
    materializer: Vec<OsString>,
    scratch_dir: PathBuf,
    source_date_epoch: u64,
    upstream_args: Vec<String>,
    warned_about_fallback: bool,
}

impl AssemblyOrchestrator {
    /// Construct an instance.
    ///
    /// `materializer` is the command line invoking the `deb-assembler`
    /// executable. Materialization directories are created below
    /// `scratch_dir`.
    pub fn new<S: Into<OsString>>(
        environment: AssemblyEnvironment,
        materializer: impl IntoIterator<Item = S>,
        scratch_dir: impl AsRef<Path>,
        source_date_epoch: u64,
    ) -> Self {
        Self {
            environment,
            materializer: materializer.into_iter().map(|s| s.into()).collect(),
            scratch_dir: scratch_dir.as_ref().to_path_buf(),
            source_date_epoch,
            upstream_args: vec![],
            warned_about_fallback: false,
        }
    }

    /// Set arguments passed through to `dpkg-deb`.
    pub fn with_upstream_args(mut self, args: Vec<String>) -> Self {
        self.upstream_args = args;
        self
    }

    /// Choose how a package is assembled.
    pub fn determine_assembly_method(
        &mut self,
        package: &str,
        manifest: &IntermediateManifest,
    ) -> Result<AssemblyMethod> {
        let matched = match manifest.iter().find(|m| m.needs_root_ownership()) {
            Some(member) => member,
            None => return Ok(AssemblyMethod::default()),
        };

        if self.environment.targeted_promotion_requested() {
            let gain_root_command = self
                .environment
                .gain_root_command()
                .ok_or(DebAssemblyError::GainRootCommandMissing(
                    TARGETED_PROMOTION_KEYWORD,
                ))?;

            return Ok(AssemblyMethod {
                needs_root: true,
                use_fallback: false,
                gain_root_command,
            });
        }

        if self.environment.root_never_available() {
            if !self.warned_about_fallback {
                warn!(
                    "using the built-in assembly method because Rules-Requires-Root is \"no\" \
                     and dpkg-deb would require (fake)root for packages that need it"
                );
                self.warned_about_fallback = true;
            }

            return Ok(AssemblyMethod {
                needs_root: true,
                use_fallback: true,
                gain_root_command: vec![],
            });
        }

        Err(DebAssemblyError::RootRequired(format!(
            "due to the path {} in {}, the package assembly requires (fake)root; however, \
             this command is not run as root nor was a root command requested via \
             Rules-Requires-Root. Please consider adding \"{}\" to Rules-Requires-Root in \
             debian/control. Alternatively, set \"Rules-Requires-Root: no\" and the package will \
             be assembled without dpkg-deb; the output should be bit-for-bit identical to what \
             dpkg-deb would produce with (fake)root",
            matched.member_path, package, TARGETED_PROMOTION_KEYWORD
        )))
    }

    /// The materialization directory of a package.
    pub fn materialization_dir(&self, package: &str) -> PathBuf {
        self.scratch_dir.join("materialization-dirs").join(package)
    }

    /// Compute the commands assembling a package.
    pub fn assembly_commands(
        &self,
        package: &str,
        control_dir: &Path,
        output: &Path,
        is_udeb: bool,
        method: &AssemblyMethod,
    ) -> Result<AssemblyCommands> {
        let materialization_dir = self.materialization_dir(package);
        let build_method = method.build_method();

        let output = if is_udeb {
            output.join(compute_output_filename(control_dir, true)?)
        } else {
            output.to_path_buf()
        };

        let mut args = self.materializer.clone();
        args.extend(
            [
                "materialize-deb",
                "--intermediate-package-manifest",
                "-",
                "--may-move-control-files",
                "--may-move-data-files",
                "--source-date-epoch",
            ]
            .iter()
            .map(OsString::from),
        );
        args.push(self.source_date_epoch.to_string().into());
        args.push("--discard-existing-output".into());
        args.push(control_dir.as_os_str().to_os_string());
        args.push(materialization_dir.clone().into_os_string());
        if is_udeb {
            args.push("--udeb".into());
        }
        if method.is_combined() {
            args.push("--build-method".into());
            args.push(build_method.name().into());
            args.push("--assembled-deb-output".into());
            args.push(output.clone().into_os_string());
        }
        if !self.upstream_args.is_empty() {
            args.push("--".into());
            args.extend(self.upstream_args.iter().map(OsString::from));
        }

        let build = if method.is_combined() {
            None
        } else {
            let mut args = self.materializer.clone();
            args.push("build-materialized-deb".into());
            args.push(materialization_dir.into_os_string());
            args.push(build_method.name().into());
            args.push("--output".into());
            args.push(output.clone().into_os_string());

            Some(ExternalCommand::new(args).wrapped(&method.gain_root_command))
        };

        Ok(AssemblyCommands {
            materialize: ExternalCommand::new(args),
            build,
            output,
        })
    }

    /// Materialize and assemble a single package.
    pub fn assemble_deb(
        &self,
        package: &str,
        manifest: &IntermediateManifest,
        control_dir: &Path,
        output: &Path,
        is_udeb: bool,
        method: &AssemblyMethod,
    ) -> Result<PathBuf> {
        let commands = self.assembly_commands(package, control_dir, output, is_udeb, method)?;

        let parent = self.scratch_dir.join("materialization-dirs");
        std::fs::create_dir_all(&parent)
            .map_err(|e| DebAssemblyError::filesystem("creating directory", &parent, e))?;

        if method.is_combined() {
            info!(
                "materializing and assembling {} via: {}",
                package,
                commands.materialize.command_line()
            );
        } else {
            info!(
                "materializing {} via: {}",
                package,
                commands.materialize.command_line()
            );
        }
        commands
            .materialize
            .stdin_bytes(manifest.to_json_vec()?)
            .run()?;

        if let Some(build) = commands.build {
            info!("assembling {} via: {}", package, build.command_line());
            build.run()?;
        }

        Ok(commands.output)
    }

    /// Whether the dbgsym package of `package` is assembled.
    ///
    /// Never for udebs, not when a real package has the dbgsym package's
    /// name, not when disabled via `DEB_BUILD_OPTIONS` and not without files.
    pub fn should_build_dbgsym(
        &self,
        package: &BinaryPackage,
        dbgsym: &DbgsymContent,
        known_packages: &BTreeSet<&str>,
    ) -> bool {
        !package.is_udeb
            && !known_packages.contains(format!("{}-dbgsym", package.name).as_str())
            && !self.environment.build_option("noautodbgsym")
            && !self.environment.build_option("noddebs")
            && dbgsym
                .manifest
                .iter()
                .any(|m| m.path_type == PathType::File)
    }

    /// Assemble all packages that are acted on, including dbgsym packages.
    ///
    /// Returns the paths of the assembled packages.
    pub fn assemble_debs(
        &mut self,
        packages: &[PackageAssembly],
        output: &Path,
    ) -> Result<Vec<PathBuf>> {
        let known_packages = packages
            .iter()
            .map(|p| p.package.name.as_str())
            .collect::<BTreeSet<_>>();

        let mut assembled = vec![];

        for assembly in packages.iter().filter(|p| p.package.should_be_acted_on) {
            let package = &assembly.package;
            let method = self.determine_assembly_method(&package.name, &assembly.manifest)?;

            if let Some(dbgsym) = &assembly.dbgsym {
                if self.should_build_dbgsym(package, dbgsym, &known_packages) {
                    if !output.is_dir() {
                        return Err(DebAssemblyError::Usage(
                            "cannot produce a dbgsym package when the output path is not a \
                             directory"
                                .to_string(),
                        ));
                    }

                    assembled.push(self.assemble_deb(
                        &format!("{}-dbgsym", package.name),
                        &dbgsym.manifest,
                        &dbgsym.control_dir,
                        output,
                        false,
                        &AssemblyMethod::default(),
                    )?);
                }
            }

            assembled.push(self.assemble_deb(
                &package.name,
                &assembly.manifest,
                &assembly.control_dir,
                output,
                package.is_udeb,
                &method,
            )?);
        }

        Ok(assembled)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::intermediate_manifest::TarMember};

    fn manifest(owner: &str, uid: u32) -> Result<IntermediateManifest> {
        let root = TarMember {
            member_path: "./".to_string(),
            path_type: PathType::Directory,
            fs_path: None,
            link_target: None,
            mode: 0o755,
            owner: "root".to_string(),
            uid: 0,
            group: "root".to_string(),
            gid: 0,
            mtime: 0,
            may_steal_fs_path: false,
        };
        let mut file = root.clone();
        file.member_path = "./games/".to_string();
        file.owner = owner.to_string();
        file.uid = uid;

        IntermediateManifest::from_members(vec![root, file])
    }

    fn debug_manifest() -> Result<IntermediateManifest> {
        let mut members = manifest("root", 0)?.into_members();
        members.truncate(1);
        members.push(TarMember {
            member_path: "./debug".to_string(),
            path_type: PathType::File,
            fs_path: Some(PathBuf::from("/tmp/debug")),
            link_target: None,
            mode: 0o644,
            owner: "root".to_string(),
            uid: 0,
            group: "root".to_string(),
            gid: 0,
            mtime: 0,
            may_steal_fs_path: false,
        });

        IntermediateManifest::from_members(members)
    }

    fn orchestrator(vars: &[(&str, &str)]) -> AssemblyOrchestrator {
        AssemblyOrchestrator::new(
            AssemblyEnvironment::from_vars(vars.iter().copied()),
            ["deb-assembler"],
            "/scratch",
            1700000000,
        )
    }

    #[test]
    fn root_owned_content_needs_no_privileges() -> Result<()> {
        let mut orchestrator = orchestrator(&[]);
        let method = orchestrator.determine_assembly_method("foo", &manifest("root", 0)?)?;

        assert_eq!(method, AssemblyMethod::default());
        assert!(method.is_combined());
        assert_eq!(method.build_method(), BuildMethod::DpkgDeb);

        Ok(())
    }

    #[test]
    fn targeted_promotion() -> Result<()> {
        let manifest = manifest("games", 5)?;

        let mut promoted = orchestrator(&[
            ("DEB_RULES_REQUIRES_ROOT", "debputy/deb-assembly"),
            ("DEB_GAIN_ROOT_CMD", "fakeroot --"),
        ]);
        let method = promoted.determine_assembly_method("foo", &manifest)?;
        assert_eq!(
            method,
            AssemblyMethod {
                needs_root: true,
                use_fallback: false,
                gain_root_command: vec!["fakeroot".to_string(), "--".to_string()],
            }
        );
        assert_eq!(method.build_method(), BuildMethod::DpkgDeb);

        let mut missing = orchestrator(&[("DEB_RULES_REQUIRES_ROOT", "debputy/deb-assembly")]);
        assert!(matches!(
            missing.determine_assembly_method("foo", &manifest),
            Err(DebAssemblyError::GainRootCommandMissing(_))
        ));

        Ok(())
    }

    #[test]
    fn fallback_and_refusal() -> Result<()> {
        let manifest = manifest("games", 5)?;

        let mut fallback = orchestrator(&[("DEB_RULES_REQUIRES_ROOT", "no")]);
        let method = fallback.determine_assembly_method("foo", &manifest)?;
        assert!(method.use_fallback);
        assert_eq!(method.build_method(), BuildMethod::Debputy);
        assert!(!method.is_combined());
        assert!(fallback.warned_about_fallback);

        let mut refused = orchestrator(&[("DEB_RULES_REQUIRES_ROOT", "binary-targets")]);
        match refused.determine_assembly_method("foo", &manifest) {
            Err(DebAssemblyError::RootRequired(message)) => {
                assert!(message.contains("./games/"));
                assert!(message.contains("debputy/deb-assembly"));
                assert!(message.contains("Rules-Requires-Root: no"));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        Ok(())
    }

    #[test]
    fn combined_command_line() -> Result<()> {
        let orchestrator = orchestrator(&[]).with_upstream_args(vec!["-Zgzip".to_string()]);

        let commands = orchestrator.assembly_commands(
            "foo",
            Path::new("debian/foo/DEBIAN"),
            Path::new(".."),
            false,
            &AssemblyMethod::default(),
        )?;

        assert_eq!(
            commands.materialize.command_line(),
            "deb-assembler materialize-deb --intermediate-package-manifest - \
             --may-move-control-files --may-move-data-files --source-date-epoch 1700000000 \
             --discard-existing-output debian/foo/DEBIAN /scratch/materialization-dirs/foo \
             --build-method dpkg-deb --assembled-deb-output .. -- -Zgzip"
        );
        assert!(commands.build.is_none());
        assert_eq!(commands.output, PathBuf::from(".."));

        Ok(())
    }

    #[test]
    fn split_command_lines() -> Result<()> {
        let orchestrator = orchestrator(&[]);

        let method = AssemblyMethod {
            needs_root: true,
            use_fallback: false,
            gain_root_command: vec!["fakeroot".to_string()],
        };
        let commands = orchestrator.assembly_commands(
            "foo",
            Path::new("ctrl"),
            Path::new("out"),
            false,
            &method,
        )?;

        assert_eq!(
            commands.materialize.command_line(),
            "deb-assembler materialize-deb --intermediate-package-manifest - \
             --may-move-control-files --may-move-data-files --source-date-epoch 1700000000 \
             --discard-existing-output ctrl /scratch/materialization-dirs/foo"
        );
        assert_eq!(
            commands.build.map(|c| c.command_line()),
            Some(
                "fakeroot deb-assembler build-materialized-deb /scratch/materialization-dirs/foo \
                 dpkg-deb --output out"
                    .to_string()
            )
        );

        Ok(())
    }

    #[test]
    fn udeb_output_is_named_from_control() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("deb-assembly-test-")
            .tempdir()?;
        std::fs::write(
            td.path().join("control"),
            "Package: foo-udeb\nVersion: 1.0\nArchitecture: amd64\n",
        )?;

        let commands = orchestrator(&[]).assembly_commands(
            "foo-udeb",
            td.path(),
            Path::new("out"),
            true,
            &AssemblyMethod::default(),
        )?;
        assert_eq!(commands.output, PathBuf::from("out/foo-udeb_1.0_amd64.udeb"));
        assert!(commands
            .materialize
            .args()
            .contains(&OsString::from("--udeb")));

        Ok(())
    }

    #[test]
    fn dbgsym_selection() -> Result<()> {
        let with_files = DbgsymContent {
            manifest: debug_manifest()?,
            control_dir: PathBuf::from("dbgsym/DEBIAN"),
        };
        let without_files = DbgsymContent {
            manifest: manifest("root", 0)?,
            control_dir: PathBuf::from("dbgsym/DEBIAN"),
        };

        let package = BinaryPackage::new("foo");
        let known = ["foo"].into_iter().collect::<BTreeSet<_>>();

        let default = orchestrator(&[]);
        assert!(default.should_build_dbgsym(&package, &with_files, &known));
        assert!(!default.should_build_dbgsym(&package, &without_files, &known));
        assert!(!default.should_build_dbgsym(
            &BinaryPackage::new("foo").udeb(true),
            &with_files,
            &known
        ));

        let conflicting = ["foo", "foo-dbgsym"].into_iter().collect::<BTreeSet<_>>();
        assert!(!default.should_build_dbgsym(&package, &with_files, &conflicting));

        let disabled = orchestrator(&[("DEB_BUILD_OPTIONS", "nocheck noautodbgsym")]);
        assert!(!disabled.should_build_dbgsym(&package, &with_files, &known));

        Ok(())
    }

    /// A materializer that records its arguments and stdin instead of running.
    ///
    /// Each invocation appends `<GAINED_ROOT or 0> <args...>` to `invocations`.
    /// The manifest fed to `materialize-deb` is written to `stdin.json`.
    struct RecordingMaterializer {
        td: tempfile::TempDir,
    }

    impl RecordingMaterializer {
        fn new() -> Result<Option<Self>> {
            if which::which("sh").is_err() || which::which("env").is_err() {
                return Ok(None);
            }

            let td = tempfile::Builder::new()
                .prefix("deb-assembly-test-")
                .tempdir()?;
            std::fs::create_dir(td.path().join("out"))?;

            Ok(Some(Self { td }))
        }

        fn path(&self, name: &str) -> PathBuf {
            self.td.path().join(name)
        }

        fn orchestrator(&self, vars: &[(&str, &str)]) -> AssemblyOrchestrator {
            let script = "log=$1; shift; \
                 echo \"${GAINED_ROOT:-0} $*\" >> \"$log/invocations\"; \
                 case \"$1\" in materialize-deb) cat > \"$log/stdin.json\";; esac";

            AssemblyOrchestrator::new(
                AssemblyEnvironment::from_vars(vars.iter().copied()),
                [
                    OsString::from("sh"),
                    OsString::from("-c"),
                    OsString::from(script),
                    OsString::from("sh"),
                    self.td.path().as_os_str().to_os_string(),
                ],
                self.path("scratch"),
                1700000000,
            )
        }

        fn invocations(&self) -> Result<Vec<String>> {
            let path = self.path("invocations");
            if !path.exists() {
                return Ok(vec![]);
            }

            Ok(std::fs::read_to_string(path)?
                .lines()
                .map(|l| l.to_string())
                .collect())
        }

        fn combined_invocation(&self, package: &str, control_dir: &str) -> String {
            format!(
                "0 materialize-deb --intermediate-package-manifest - --may-move-control-files \
                 --may-move-data-files --source-date-epoch 1700000000 --discard-existing-output \
                 {} {} --build-method dpkg-deb --assembled-deb-output {}",
                control_dir,
                self.path("scratch")
                    .join("materialization-dirs")
                    .join(package)
                    .display(),
                self.path("out").display()
            )
        }
    }

    fn packages(with_dbgsym: bool) -> Result<Vec<PackageAssembly>> {
        let dbgsym = if with_dbgsym {
            Some(DbgsymContent {
                manifest: debug_manifest()?,
                control_dir: PathBuf::from("dbgsym/DEBIAN"),
            })
        } else {
            None
        };

        Ok(vec![
            PackageAssembly {
                package: BinaryPackage::new("foo"),
                manifest: manifest("root", 0)?,
                control_dir: PathBuf::from("debian/foo/DEBIAN"),
                dbgsym,
            },
            PackageAssembly {
                package: BinaryPackage::new("bar").acted_on(false),
                manifest: manifest("root", 0)?,
                control_dir: PathBuf::from("debian/bar/DEBIAN"),
                dbgsym: None,
            },
        ])
    }

    #[test]
    fn assemble_debs_builds_dbgsym_first() -> Result<()> {
        let recorder = match RecordingMaterializer::new()? {
            Some(recorder) => recorder,
            None => return Ok(()),
        };
        let out = recorder.path("out");

        let mut orchestrator = recorder.orchestrator(&[]);
        let assembled = orchestrator.assemble_debs(&packages(true)?, &out)?;

        assert_eq!(assembled, vec![out.clone(), out.clone()]);
        assert_eq!(
            recorder.invocations()?,
            vec![
                recorder.combined_invocation("foo-dbgsym", "dbgsym/DEBIAN"),
                recorder.combined_invocation("foo", "debian/foo/DEBIAN"),
            ]
        );
        assert!(recorder.path("scratch/materialization-dirs").is_dir());

        // The last manifest on stdin is the one of the main package.
        assert_eq!(
            IntermediateManifest::from_path_or_stdin(recorder.path("stdin.json"))?,
            manifest("root", 0)?
        );

        Ok(())
    }

    #[test]
    fn assemble_debs_without_dbgsym() -> Result<()> {
        let recorder = match RecordingMaterializer::new()? {
            Some(recorder) => recorder,
            None => return Ok(()),
        };
        let out = recorder.path("out");

        let mut disabled = recorder.orchestrator(&[("DEB_BUILD_OPTIONS", "noautodbgsym")]);
        disabled.assemble_debs(&packages(true)?, &out)?;
        assert_eq!(
            recorder.invocations()?,
            vec![recorder.combined_invocation("foo", "debian/foo/DEBIAN")]
        );

        std::fs::remove_file(recorder.path("invocations"))?;
        let mut packages = packages(true)?;
        packages[0].package = BinaryPackage::new("foo").udeb(true);
        packages.push(PackageAssembly {
            package: BinaryPackage::new("foo-dbgsym").acted_on(false),
            manifest: manifest("root", 0)?,
            control_dir: PathBuf::from("debian/foo-dbgsym/DEBIAN"),
            dbgsym: None,
        });
        std::fs::create_dir_all(recorder.path("debian/foo/DEBIAN"))?;
        std::fs::write(
            recorder.path("debian/foo/DEBIAN/control"),
            "Package: foo\nVersion: 1.0\nArchitecture: all\n",
        )?;
        packages[0].control_dir = recorder.path("debian/foo/DEBIAN");

        let assembled = recorder
            .orchestrator(&[])
            .assemble_debs(&packages, &out)?;
        assert_eq!(assembled, vec![out.join("foo_1.0_all.udeb")]);

        let invocations = recorder.invocations()?;
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].contains("materialization-dirs/foo --udeb"));

        Ok(())
    }

    #[test]
    fn dbgsym_requires_output_directory() -> Result<()> {
        let recorder = match RecordingMaterializer::new()? {
            Some(recorder) => recorder,
            None => return Ok(()),
        };
        let out = recorder.path("foo.deb");

        match recorder.orchestrator(&[]).assemble_debs(&packages(true)?, &out) {
            Err(DebAssemblyError::Usage(message)) => {
                assert!(message.contains("output path is not a directory"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(recorder.invocations()?.is_empty());

        // Without a dbgsym package, a file path is a valid output.
        let assembled = recorder
            .orchestrator(&[])
            .assemble_debs(&packages(false)?, &out)?;
        assert_eq!(assembled, vec![out]);

        Ok(())
    }

    #[test]
    fn split_assembly_gains_root_for_build() -> Result<()> {
        let recorder = match RecordingMaterializer::new()? {
            Some(recorder) => recorder,
            None => return Ok(()),
        };
        let out = recorder.path("out");
        let materialization_dir = recorder.path("scratch/materialization-dirs/foo");

        let mut orchestrator = recorder.orchestrator(&[
            ("DEB_RULES_REQUIRES_ROOT", "debputy/deb-assembly"),
            ("DEB_GAIN_ROOT_CMD", "env GAINED_ROOT=1"),
        ]);
        let manifest = manifest("games", 5)?;
        let method = orchestrator.determine_assembly_method("foo", &manifest)?;

        let output = orchestrator.assemble_deb(
            "foo",
            &manifest,
            Path::new("debian/foo/DEBIAN"),
            &out,
            false,
            &method,
        )?;

        assert_eq!(output, out);
        assert_eq!(
            recorder.invocations()?,
            vec![
                format!(
                    "0 materialize-deb --intermediate-package-manifest - \
                     --may-move-control-files --may-move-data-files --source-date-epoch \
                     1700000000 --discard-existing-output debian/foo/DEBIAN {}",
                    materialization_dir.display()
                ),
                format!(
                    "1 build-materialized-deb {} dpkg-deb --output {}",
                    materialization_dir.display(),
                    out.display()
                ),
            ]
        );
        assert_eq!(
            IntermediateManifest::from_path_or_stdin(recorder.path("stdin.json"))?,
            manifest
        );

        Ok(())
    }

    #[test]
    fn failed_materialization_stops_assembly() -> Result<()> {
        if which::which("sh").is_err() {
            return Ok(());
        }

        let td = tempfile::Builder::new()
            .prefix("deb-assembly-test-")
            .tempdir()?;
        let orchestrator = AssemblyOrchestrator::new(
            AssemblyEnvironment::default(),
            ["sh", "-c", "cat > /dev/null; exit 3", "sh"],
            td.path(),
            1700000000,
        );
        let method = AssemblyMethod {
            needs_root: true,
            use_fallback: true,
            gain_root_command: vec![],
        };

        assert!(matches!(
            orchestrator.assemble_deb(
                "foo",
                &manifest("games", 5)?,
                Path::new("debian/foo/DEBIAN"),
                Path::new("out"),
                false,
                &method,
            ),
            Err(DebAssemblyError::CommandFailed { .. })
        ));

        Ok(())
    }
}
