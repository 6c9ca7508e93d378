// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Configuration derived from environment variables.

Package assembly is influenced by a handful of environment variables set by
the build driver (`dpkg-buildpackage` and friends). They are captured once into
an [AssemblyEnvironment], which is then passed around explicitly. Nothing in
this crate reads the process environment after that point, and nothing mutates
it: external commands that need a modified environment receive an
[EnvironmentOverlay] applied to the child process only.
*/

use {
    crate::error::{DebAssemblyError, Result},
    std::{
        collections::{BTreeMap, BTreeSet},
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// Keyword in `DEB_RULES_REQUIRES_ROOT` requesting root for package assembly.
pub const TARGETED_PROMOTION_KEYWORD: &str = "debputy/deb-assembly";

pub const SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";
pub const DPKG_DEB_COMPRESSOR_TYPE: &str = "DPKG_DEB_COMPRESSOR_TYPE";
pub const DPKG_DEB_COMPRESSOR_LEVEL: &str = "DPKG_DEB_COMPRESSOR_LEVEL";
pub const DPKG_DEB_THREADS_MAX: &str = "DPKG_DEB_THREADS_MAX";
pub const DEB_RULES_REQUIRES_ROOT: &str = "DEB_RULES_REQUIRES_ROOT";
pub const DEB_GAIN_ROOT_CMD: &str = "DEB_GAIN_ROOT_CMD";
pub const DEB_BUILD_OPTIONS: &str = "DEB_BUILD_OPTIONS";
pub const LD_PRELOAD: &str = "LD_PRELOAD";

const DPKG_DEB_VARIABLES: [&str; 3] = [
    DPKG_DEB_COMPRESSOR_LEVEL,
    DPKG_DEB_COMPRESSOR_TYPE,
    DPKG_DEB_THREADS_MAX,
];

/// Environment variables relevant to package assembly.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AssemblyEnvironment {
    variables: BTreeMap<String, String>,
}

impl AssemblyEnvironment {
    /// Capture the relevant variables from the current process environment.
    pub fn from_env() -> Self {
        Self::from_vars(
            [
                SOURCE_DATE_EPOCH,
                DPKG_DEB_COMPRESSOR_TYPE,
                DPKG_DEB_COMPRESSOR_LEVEL,
                DPKG_DEB_THREADS_MAX,
                DEB_RULES_REQUIRES_ROOT,
                DEB_GAIN_ROOT_CMD,
                DEB_BUILD_OPTIONS,
                LD_PRELOAD,
            ]
            .iter()
            .filter_map(|name| {
                std::env::var_os(name).map(|value| (*name, value.to_string_lossy().to_string()))
            }),
        )
    }

    /// Construct an instance from explicit name/value pairs.
    pub fn from_vars<K: ToString, V: ToString>(vars: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            variables: vars
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Obtain the raw value of a variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(|s| s.as_str())
    }

    fn parse_number<T: std::str::FromStr>(&self, name: &'static str) -> Result<Option<T>> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| DebAssemblyError::InvalidEnvironmentValue(name, value.to_string())),
        }
    }

    /// `SOURCE_DATE_EPOCH`, if defined.
    ///
    /// A defined but empty or non-numeric value is an error.
    pub fn source_date_epoch(&self) -> Result<Option<u64>> {
        self.parse_number(SOURCE_DATE_EPOCH)
    }

    /// `DPKG_DEB_COMPRESSOR_TYPE`, if defined and non-empty.
    pub fn compressor_type(&self) -> Option<&str> {
        self.get(DPKG_DEB_COMPRESSOR_TYPE).filter(|v| !v.is_empty())
    }

    pub fn compressor_level(&self) -> Result<Option<u32>> {
        self.parse_number(DPKG_DEB_COMPRESSOR_LEVEL)
    }

    pub fn threads_max(&self) -> Result<Option<u32>> {
        self.parse_number(DPKG_DEB_THREADS_MAX)
    }

    /// Keywords in `DEB_RULES_REQUIRES_ROOT`.
    pub fn rules_requires_root(&self) -> BTreeSet<&str> {
        self.get(DEB_RULES_REQUIRES_ROOT)
            .map(|v| v.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// Whether targeted promotion for package assembly was requested.
    pub fn targeted_promotion_requested(&self) -> bool {
        self.rules_requires_root()
            .contains(TARGETED_PROMOTION_KEYWORD)
    }

    /// Whether the build declared that root will never be available.
    pub fn root_never_available(&self) -> bool {
        self.get(DEB_RULES_REQUIRES_ROOT).map(|v| v.trim()) == Some("no")
    }

    /// `DEB_GAIN_ROOT_CMD` split into arguments.
    pub fn gain_root_command(&self) -> Option<Vec<String>> {
        self.get(DEB_GAIN_ROOT_CMD)
            .map(|v| {
                v.split_whitespace()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|args| !args.is_empty())
    }

    /// Whether an option is present in `DEB_BUILD_OPTIONS`.
    pub fn build_option(&self, option: &str) -> bool {
        self.get(DEB_BUILD_OPTIONS)
            .map(|v| {
                v.split_whitespace()
                    .any(|word| word == option || word.starts_with(&format!("{}=", option)))
            })
            .unwrap_or(false)
    }

    /// Whether `LD_PRELOAD` is set to a non-empty value.
    pub fn has_ld_preload(&self) -> bool {
        self.get(LD_PRELOAD).map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// The `DPKG_DEB_*` variables, with `None` for those that are unset.
    ///
    /// These are recorded alongside a materialized package root so a later
    /// assembly step observes the same compressor settings.
    pub fn dpkg_deb_variables(&self) -> BTreeMap<String, Option<String>> {
        DPKG_DEB_VARIABLES
            .iter()
            .map(|name| (name.to_string(), self.get(name).map(|v| v.to_string())))
            .collect()
    }
}

/// Resolve the timestamp to use for reproducible output.
///
/// An explicit value wins. Otherwise `SOURCE_DATE_EPOCH` is used and, failing
/// that, the current time.
pub fn resolve_source_date_epoch(
    explicit: Option<u64>,
    environment: &AssemblyEnvironment,
) -> Result<u64> {
    if let Some(value) = explicit {
        return Ok(value);
    }

    if let Some(value) = environment.source_date_epoch()? {
        return Ok(value);
    }

    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0))
}

/// Environment modifications applied to a single child process.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EnvironmentOverlay {
    set: BTreeMap<String, String>,
    unset: BTreeSet<String>,
}

impl EnvironmentOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable in the child environment.
    pub fn set(mut self, name: impl ToString, value: impl ToString) -> Self {
        let name = name.to_string();
        self.unset.remove(&name);
        self.set.insert(name, value.to_string());
        self
    }

    /// Remove a variable from the child environment.
    pub fn unset(mut self, name: impl ToString) -> Self {
        let name = name.to_string();
        self.set.remove(&name);
        self.unset.insert(name);
        self
    }

    /// Apply the modifications to a command expression.
    pub fn apply(&self, mut expression: duct::Expression) -> duct::Expression {
        for (name, value) in &self.set {
            expression = expression.env(name, value);
        }
        for name in &self.unset {
            expression = expression.env_remove(name);
        }

        expression
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_date_epoch_resolution() -> Result<()> {
        let env = AssemblyEnvironment::from_vars([(SOURCE_DATE_EPOCH, "1700000000")]);
        assert_eq!(resolve_source_date_epoch(Some(5), &env)?, 5);
        assert_eq!(resolve_source_date_epoch(None, &env)?, 1700000000);

        let empty = AssemblyEnvironment::from_vars([(SOURCE_DATE_EPOCH, "")]);
        assert!(matches!(
            resolve_source_date_epoch(None, &empty),
            Err(DebAssemblyError::InvalidEnvironmentValue(SOURCE_DATE_EPOCH, _))
        ));

        let unset = AssemblyEnvironment::default();
        assert!(resolve_source_date_epoch(None, &unset)? > 1700000000);

        Ok(())
    }

    #[test]
    fn root_settings() {
        let env = AssemblyEnvironment::from_vars([
            (DEB_RULES_REQUIRES_ROOT, "binary-targets debputy/deb-assembly"),
            (DEB_GAIN_ROOT_CMD, "  fakeroot  --  "),
        ]);
        assert!(env.targeted_promotion_requested());
        assert!(!env.root_never_available());
        assert_eq!(
            env.gain_root_command(),
            Some(vec!["fakeroot".to_string(), "--".to_string()])
        );

        let env = AssemblyEnvironment::from_vars([(DEB_RULES_REQUIRES_ROOT, "no")]);
        assert!(!env.targeted_promotion_requested());
        assert!(env.root_never_available());
        assert_eq!(env.gain_root_command(), None);
    }

    #[test]
    fn build_options() {
        let env = AssemblyEnvironment::from_vars([(DEB_BUILD_OPTIONS, "nocheck parallel=4 noddebs")]);
        assert!(env.build_option("noddebs"));
        assert!(env.build_option("parallel"));
        assert!(!env.build_option("noautodbgsym"));
    }

    #[test]
    fn dpkg_deb_variables() -> Result<()> {
        let env = AssemblyEnvironment::from_vars([
            (DPKG_DEB_COMPRESSOR_LEVEL, "3"),
            (DEB_BUILD_OPTIONS, "nocheck"),
        ]);

        assert_eq!(env.compressor_level()?, Some(3));
        assert_eq!(env.threads_max()?, None);
        assert_eq!(
            env.dpkg_deb_variables().into_iter().collect::<Vec<_>>(),
            vec![
                (DPKG_DEB_COMPRESSOR_LEVEL.to_string(), Some("3".to_string())),
                (DPKG_DEB_COMPRESSOR_TYPE.to_string(), None),
                (DPKG_DEB_THREADS_MAX.to_string(), None),
            ]
        );

        Ok(())
    }

    #[test]
    fn overlay_tracks_last_operation() {
        let overlay = EnvironmentOverlay::new()
            .set("A", "1")
            .unset("B")
            .unset("A")
            .set("B", "2");

        assert_eq!(overlay.set.get("B").map(|s| s.as_str()), Some("2"));
        assert!(overlay.unset.contains("A"));
        assert!(!overlay.set.contains_key("A"));
        assert!(!overlay.unset.contains("B"));
    }
}
