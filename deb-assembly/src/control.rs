// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Minimal reading of `DEBIAN/control` files.

Only what is needed to name an assembled package is supported: the first
paragraph of the file, with field names compared case-insensitively.
*/

use {
    crate::error::{DebAssemblyError, Result},
    std::{
        io::{BufRead, BufReader, Read},
        path::Path,
    },
};

/// An ordered set of `Name: value` fields.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ControlParagraph {
    fields: Vec<(String, String)>,
}

impl ControlParagraph {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Obtain the value of a field, ignoring case of the field name.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn required_field_str(&self, name: &'static str) -> Result<&str> {
        self.field_str(name)
            .ok_or(DebAssemblyError::ControlRequiredFieldMissing(name))
    }

    pub fn package(&self) -> Result<&str> {
        self.required_field_str("Package")
    }

    pub fn version_str(&self) -> Result<&str> {
        self.required_field_str("Version")
    }

    /// The `Version` field without its epoch.
    pub fn version_without_epoch(&self) -> Result<&str> {
        let version = self.version_str()?;
        Ok(version
            .split_once(':')
            .map(|(_, rest)| rest)
            .unwrap_or(version))
    }

    pub fn architecture(&self) -> Result<&str> {
        self.required_field_str("Architecture")
    }

    /// The `Package-Type` field, if present and non-empty.
    pub fn package_type(&self) -> Option<&str> {
        self.field_str("Package-Type").filter(|v| !v.is_empty())
    }
}

/// Holds parsing state for control files.
///
/// Lines are fed in one at a time and completed paragraphs are emitted.
#[derive(Clone, Debug, Default)]
pub struct ControlFileParser {
    paragraph: ControlParagraph,
    field: Option<String>,
}

impl ControlFileParser {
    /// Write a line to the parser.
    ///
    /// If the line terminates an in-progress paragraph, that paragraph is returned.
    pub fn write_line(&mut self, line: &str) -> Result<Option<ControlParagraph>> {
        let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
        let is_empty_line = line.trim().is_empty();
        let is_continuation = line.starts_with(|c: char| c == ' ' || c == '\t');

        let current_field = self.field.take();

        if is_empty_line {
            if let Some(field) = current_field {
                self.flush_field(field)?;
            }

            return Ok(if self.paragraph.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.paragraph))
            });
        }

        // Comment lines.
        if line.starts_with('#') {
            self.field = current_field;
            return Ok(None);
        }

        self.field = Some(match (current_field, is_continuation) {
            (Some(v), true) => format!("{}\n{}", v, line),
            (Some(v), false) => {
                self.flush_field(v)?;
                line.to_string()
            }
            (None, true) => {
                return Err(DebAssemblyError::ControlParse(format!(
                    "continuation line without a field: {:?}",
                    line
                )));
            }
            (None, false) => line.to_string(),
        });

        Ok(None)
    }

    /// Finish parsing, returning a trailing paragraph if there is one.
    pub fn finish(mut self) -> Result<Option<ControlParagraph>> {
        if let Some(field) = self.field.take() {
            self.flush_field(field)?;
        }

        Ok(if self.paragraph.is_empty() {
            None
        } else {
            Some(self.paragraph)
        })
    }

    fn flush_field(&mut self, v: String) -> Result<()> {
        let (name, value) = v.split_once(':').ok_or_else(|| {
            DebAssemblyError::ControlParse(format!("error parsing line '{}'; missing colon", v))
        })?;

        self.paragraph
            .fields
            .push((name.trim().to_string(), value.trim().to_string()));

        Ok(())
    }
}

/// Parse the first paragraph of a control file.
pub fn read_first_paragraph(reader: impl Read) -> Result<ControlParagraph> {
    let mut parser = ControlFileParser::default();

    for line in BufReader::new(reader).lines() {
        if let Some(paragraph) = parser.write_line(&line?)? {
            return Ok(paragraph);
        }
    }

    parser
        .finish()?
        .ok_or_else(|| DebAssemblyError::ControlParse("control file has no paragraphs".to_string()))
}

/// Compute the file name of the package described by `<control_dir>/control`.
///
/// The name is `{Package}_{Version}_{Architecture}.{ext}`, with any epoch
/// removed from the version. The extension is `udeb` for udebs, else
/// `Package-Type` or `deb`.
pub fn compute_output_filename(control_dir: impl AsRef<Path>, is_udeb: bool) -> Result<String> {
    let path = control_dir.as_ref().join("control");
    let fh = std::fs::File::open(&path)
        .map_err(|e| DebAssemblyError::filesystem("opening", &path, e))?;
    let paragraph = read_first_paragraph(fh)?;

    let extension = if is_udeb {
        "udeb"
    } else {
        paragraph.package_type().unwrap_or("deb")
    };

    Ok(format!(
        "{}_{}_{}.{}",
        paragraph.package()?,
        paragraph.version_without_epoch()?,
        paragraph.architecture()?,
        extension
    ))
}
