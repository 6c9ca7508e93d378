// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Writing of `ar` archives as used by `.deb` files.

Members are written with owner and group 0, mode `100644` and a shared
modification time. Member bodies are not padded to an even length.

Members whose size is not known up front are streamed: a placeholder header is
written, the body is streamed after it and the header is then rewritten in
place. This requires a seekable writer but never buffers a member in memory.
*/

use {
    crate::error::{DebAssemblyError, Result},
    std::io::{Seek, SeekFrom, Write},
};

pub const AR_MAGIC: &[u8; 8] = b"!<arch>\n";

pub const AR_HEADER_LEN: usize = 60;

/// Render the header of an archive member.
pub fn ar_header(name: &str, mtime: u64, size: u64) -> Result<[u8; AR_HEADER_LEN]> {
    if !name.is_ascii() || name.len() > 16 {
        return Err(DebAssemblyError::Usage(format!(
            "ar member name {:?} must be ASCII and at most 16 bytes",
            name
        )));
    }

    let rendered = format!("{:<16}{:<12}0     0     100644  {:<10}`\n", name, mtime, size);

    rendered
        .as_bytes()
        .try_into()
        .map_err(|_| DebAssemblyError::Usage(format!("ar header for {} overflows", name)))
}

/// Writes an `ar` archive to a seekable writer.
pub struct ArWriter<W: Write + Seek> {
    writer: W,
    mtime: u64,
}

impl<W: Write + Seek> ArWriter<W> {
    /// Start a new archive, writing the global header.
    pub fn new(mut writer: W, mtime: u64) -> Result<Self> {
        writer.write_all(AR_MAGIC)?;

        Ok(Self { writer, mtime })
    }

    /// Append a member with content known up front.
    pub fn append_data(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(&ar_header(name, self.mtime, data.len() as u64)?)?;
        self.writer.write_all(data)?;

        Ok(())
    }

    /// Append a member whose body is produced by `write_body`.
    ///
    /// `write_body` must leave the writer positioned at the end of the body.
    /// Returns the size of the body.
    pub fn append_streamed<F>(&mut self, name: &str, write_body: F) -> Result<u64>
    where
        F: FnOnce(&mut W) -> Result<()>,
    {
        // Validates the name before anything is streamed.
        let placeholder = ar_header(name, self.mtime, 0)?;

        let header_offset = self.writer.stream_position()?;
        self.writer.write_all(&placeholder)?;

        write_body(&mut self.writer)?;

        let end_offset = self.writer.stream_position()?;
        let size = end_offset - header_offset - AR_HEADER_LEN as u64;

        self.writer.seek(SeekFrom::Start(header_offset))?;
        self.writer
            .write_all(&ar_header(name, self.mtime, size)?)?;
        self.writer.seek(SeekFrom::Start(end_offset))?;

        Ok(size)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
