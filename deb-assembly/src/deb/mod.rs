// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Writing `.deb` files.

A `.deb` file is an `ar` archive holding a `debian-binary` version marker
followed by the compressed `control.tar` and `data.tar` archives. The
primitives here are combined by [packer::pack].
*/

pub mod ar;
pub mod compression;
pub mod packer;
pub mod tarball;
