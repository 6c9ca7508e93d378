// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Invocation of external commands. */

use {
    crate::{
        environment::{AssemblyEnvironment, EnvironmentOverlay, LD_PRELOAD},
        error::{DebAssemblyError, Result},
    },
    duct::cmd,
    log::{debug, info, warn},
    std::{
        ffi::{OsStr, OsString},
        io::{BufRead, BufReader},
    },
};

/// Render arguments as a shell-like command line for diagnostics.
pub fn render_command_line<S: AsRef<OsStr>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| {
            let arg = arg.as_ref().to_string_lossy();
            if !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=:+,@%".contains(c))
            {
                arg.to_string()
            } else {
                format!("'{}'", arg.replace('\'', "'\\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Upper bound on the combined length of the arguments of one command.
pub const MAX_COMMAND_LINE_BYTES: usize = 128 * 1024;

/// Spread arguments over as few invocations of a command as possible.
///
/// Each command consists of `static_args` followed by as many of `varargs` as
/// fit within `max_bytes`. No command is produced when `varargs` is empty.
pub fn xargs<S: AsRef<OsStr>, V: AsRef<OsStr>>(
    static_args: &[S],
    varargs: impl IntoIterator<Item = V>,
    max_bytes: usize,
) -> Result<Vec<ExternalCommand>> {
    let static_len = static_args
        .iter()
        .map(|a| a.as_ref().len() + 1)
        .sum::<usize>();
    let budget = max_bytes.saturating_sub(static_len);

    let mut batches = vec![];
    let mut pending: Vec<OsString> = vec![];
    let mut remaining = budget;

    for arg in varargs {
        let arg = arg.as_ref();
        let arg_len = arg.len() + 1;
        if arg_len > budget {
            return Err(DebAssemblyError::Usage(format!(
                "argument {} does not fit on a command line",
                arg.to_string_lossy()
            )));
        }

        if arg_len > remaining {
            batches.push(std::mem::take(&mut pending));
            remaining = budget;
        }

        pending.push(arg.to_os_string());
        remaining -= arg_len;
    }

    if !pending.is_empty() {
        batches.push(pending);
    }

    Ok(batches
        .into_iter()
        .map(|batch| {
            ExternalCommand::new(
                static_args
                    .iter()
                    .map(|a| a.as_ref().to_os_string())
                    .chain(batch),
            )
        })
        .collect())
}

/// A blocking invocation of an external program.
///
/// The combined stdout and stderr of the child is forwarded to the log. A
/// non-zero exit status is an error naming the full command line.
#[derive(Clone, Debug)]
pub struct ExternalCommand {
    args: Vec<OsString>,
    overlay: EnvironmentOverlay,
    stdin: Option<Vec<u8>>,
}

impl ExternalCommand {
    /// Construct an instance from a program and its arguments.
    ///
    /// `args` must not be empty.
    pub fn new<S: AsRef<OsStr>>(args: impl IntoIterator<Item = S>) -> Self {
        Self {
            args: args.into_iter().map(|s| s.as_ref().to_os_string()).collect(),
            overlay: EnvironmentOverlay::default(),
            stdin: None,
        }
    }

    /// Prefix the command with a wrapper, such as a gain-root command.
    pub fn wrapped<S: AsRef<OsStr>>(mut self, prefix: &[S]) -> Self {
        let mut args = prefix
            .iter()
            .map(|s| s.as_ref().to_os_string())
            .collect::<Vec<_>>();
        args.append(&mut self.args);
        self.args = args;
        self
    }

    pub fn overlay(mut self, overlay: EnvironmentOverlay) -> Self {
        self.overlay = overlay;
        self
    }

    /// Feed the given bytes to the child's stdin.
    pub fn stdin_bytes(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn command_line(&self) -> String {
        render_command_line(&self.args)
    }

    fn expression(&self) -> Result<duct::Expression> {
        let (program, args) = self
            .args
            .split_first()
            .ok_or_else(|| DebAssemblyError::Usage("empty command".to_string()))?;

        let mut expression = self.overlay.apply(cmd(program, args));
        if let Some(data) = &self.stdin {
            expression = expression.stdin_bytes(data.clone());
        }

        Ok(expression)
    }

    /// Run the command to completion.
    pub fn run(&self) -> Result<()> {
        let command_line = self.command_line();
        info!("running {}", command_line);

        let spawn_error = |source| DebAssemblyError::CommandSpawn {
            command: command_line.clone(),
            source,
        };

        let handle = self
            .expression()?
            .stderr_to_stdout()
            .unchecked()
            .reader()
            .map_err(spawn_error)?;

        let mut captured = vec![];
        {
            let reader = BufReader::new(&handle);
            for line in reader.lines() {
                let line = line.map_err(spawn_error)?;
                debug!("{}", line);
                captured.push(line);
            }
        }

        let output = handle
            .try_wait()
            .map_err(spawn_error)?
            .ok_or_else(|| DebAssemblyError::CommandFailed {
                command: command_line.clone(),
                status: "unable to wait on command".to_string(),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            for line in captured {
                warn!("{}", line);
            }
            Err(DebAssemblyError::CommandFailed {
                command: command_line,
                status: output.status.to_string(),
            })
        }
    }

    /// Run the command and return its trimmed stdout.
    pub fn read(&self) -> Result<String> {
        let command_line = self.command_line();

        let output = self
            .expression()?
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|source| DebAssemblyError::CommandSpawn {
                command: command_line.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(DebAssemblyError::CommandFailed {
                command: command_line,
                status: output.status.to_string(),
            })
        }
    }
}

/// The effective user id as reported by `id -u`.
///
/// Under fakeroot this is 0.
pub fn effective_uid(overlay: EnvironmentOverlay) -> Result<u32> {
    let value = ExternalCommand::new(["id", "-u"]).overlay(overlay).read()?;

    value
        .parse::<u32>()
        .map_err(|_| DebAssemblyError::Usage(format!("`id -u` printed an unexpected value: {:?}", value)))
}

/// Whether the current process runs as (possibly emulated) root.
pub fn running_as_root() -> Result<bool> {
    Ok(effective_uid(EnvironmentOverlay::new())? == 0)
}

/// Whether the current process appears to run under fakeroot.
///
/// Fakeroot works via `LD_PRELOAD`. If we appear to be root but a child
/// process without `LD_PRELOAD` is not, the root is emulated.
pub fn detect_fakeroot(environment: &AssemblyEnvironment) -> Result<bool> {
    if !running_as_root()? || !environment.has_ld_preload() {
        return Ok(false);
    }

    Ok(effective_uid(EnvironmentOverlay::new().unset(LD_PRELOAD))? != 0)
}
