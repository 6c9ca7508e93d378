// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Compression of `.deb` archive members.

Compression is performed by external `xz` and `gzip` processes, matching the
output `dpkg-deb` would produce.
*/

use {
    crate::error::{DebAssemblyError, Result},
    log::info,
    std::fmt::{Display, Formatter},
};

/// Number of compression threads used when not configured otherwise.
pub const DEFAULT_THREADS: u32 = 2;

/// Compression format for `.deb` archive members.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compression {
    Xz,
    Gzip,
    None,
}

impl Default for Compression {
    fn default() -> Self {
        Self::Xz
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Compression {
    /// Resolve a compression from its `dpkg-deb -Z` name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "xz" => Ok(Self::Xz),
            "gzip" => Ok(Self::Gzip),
            "none" => Ok(Self::None),
            _ => Err(DebAssemblyError::UnknownCompression(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Xz => "xz",
            Self::Gzip => "gzip",
            Self::None => "none",
        }
    }

    /// Filename extension for archive members, including the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Xz => ".xz",
            Self::Gzip => ".gz",
            Self::None => "",
        }
    }

    pub fn default_level(&self) -> u32 {
        match self {
            Self::Xz => 6,
            Self::Gzip => 9,
            Self::None => 0,
        }
    }

    fn allowed_strategies(&self) -> &'static [CompressionStrategy] {
        match self {
            Self::Xz => &[CompressionStrategy::None, CompressionStrategy::Extreme],
            // dpkg-deb knows the zlib strategies but the gzip CLI cannot express them.
            Self::Gzip => &[CompressionStrategy::None],
            Self::None => &[CompressionStrategy::None],
        }
    }
}

/// A `dpkg-deb -S` compression strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompressionStrategy {
    None,
    Extreme,
    Filtered,
    Huffman,
    Rle,
    Fixed,
}

impl CompressionStrategy {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(Self::None),
            "extreme" => Ok(Self::Extreme),
            "filtered" => Ok(Self::Filtered),
            "huffman" => Ok(Self::Huffman),
            "rle" => Ok(Self::Rle),
            "fixed" => Ok(Self::Fixed),
            _ => Err(DebAssemblyError::UnknownCompressionStrategy(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Extreme => "extreme",
            Self::Filtered => "filtered",
            Self::Huffman => "huffman",
            Self::Rle => "rle",
            Self::Fixed => "fixed",
        }
    }
}

/// A validated compression configuration for one archive member.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompressionSettings {
    compression: Compression,
    level: u32,
    strategy: CompressionStrategy,
    threads: u32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self::defaults_for(Compression::default())
    }
}

impl CompressionSettings {
    /// Settings using the default level of a compression.
    pub fn defaults_for(compression: Compression) -> Self {
        Self {
            compression,
            level: compression.default_level(),
            strategy: CompressionStrategy::None,
            threads: DEFAULT_THREADS,
        }
    }

    /// Construct validated settings.
    ///
    /// `gzip` at level 0 is mapped to no compression, as `dpkg-deb` does.
    pub fn new(
        compression: Compression,
        level: Option<u32>,
        strategy: Option<CompressionStrategy>,
        threads: Option<u32>,
    ) -> Result<Self> {
        let compression = if compression == Compression::Gzip && level == Some(0) {
            info!("mapping compression gzip at level 0 to none for compatibility with dpkg-deb");
            Compression::None
        } else {
            compression
        };

        let strategy = strategy.unwrap_or(CompressionStrategy::None);
        if !compression.allowed_strategies().contains(&strategy) {
            return Err(DebAssemblyError::UnsupportedCompressionStrategy {
                compression: compression.name(),
                strategy: strategy.name(),
            });
        }

        let level = match (compression, level) {
            (Compression::None, _) => 0,
            (_, Some(level)) if level > 9 => {
                return Err(DebAssemblyError::InvalidCompressionLevel {
                    compression: compression.name(),
                    level,
                });
            }
            (_, Some(level)) => level,
            (_, None) => compression.default_level(),
        };

        Ok(Self {
            compression,
            level,
            strategy,
            threads: threads.filter(|t| *t > 0).unwrap_or(DEFAULT_THREADS),
        })
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// The compressor command line, or `None` when content passes through unchanged.
    pub fn command_line(&self) -> Option<Vec<String>> {
        match self.compression {
            Compression::Xz => {
                let mut args = vec![
                    "xz".to_string(),
                    format!("-T{}", self.threads),
                    format!("-{}", self.level),
                ];
                if self.strategy == CompressionStrategy::Extreme {
                    args.push("--extreme".to_string());
                }
                args.push("--no-adjust".to_string());
                Some(args)
            }
            Compression::Gzip => Some(vec!["gzip".to_string(), format!("-n{}", self.level)]),
            Compression::None => None,
        }
    }
}
