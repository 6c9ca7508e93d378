// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Assembly of Debian binary packages.

This crate turns declarative install rules into reproducible Debian binary
packages (`.deb` and `.udeb` files).

# Pipeline

1. [path_matcher] compiles glob-like patterns into [path_matcher::MatchRule]
   values which are evaluated against a [virtual_file_tree::VirtualTree].
2. [installations] applies install rules in order, first rule wins, and
   yields a per-package tree of installed content.
3. [mode_normalization] applies Debian's permission conventions to the
   installed content.
4. [intermediate_manifest] describes the final content of a package as a
   list of tar members. The manifest is serialized to JSON so the remaining
   stages can run in a separate process.
5. [materialization] stages a manifest on disk and assembles it via
   `dpkg-deb` or the built-in packer in [deb].
6. [assembly] decides how each package is assembled given the ownership
   needs of its content and the privileges available.

# Determinism

Every timestamp is clamped to `SOURCE_DATE_EPOCH` and tar members are
emitted in manifest order. Given the same inputs, the built-in packer
produces byte-identical output.
*/

pub mod assembly;
pub mod command;
pub mod control;
pub mod deb;
pub mod environment;
pub mod error;
pub mod installations;
pub mod intermediate_manifest;
pub mod materialization;
pub mod mode_normalization;
pub mod path_matcher;
