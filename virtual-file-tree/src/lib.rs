// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Virtual trees of filesystem entries.

A [VirtualTree] is an in-memory model of a directory hierarchy. Every node is a
directory, a regular file, or a symlink. Nodes carry the Unix metadata they
should have when installed ([EntryMetadata]) and optionally the location of a
real file on disk that provides their content.

Trees are stored as an arena of nodes addressed by [NodeId]. Read access goes
through [VirtualPath], a cheap copyable handle binding a tree and a node.
Directory children are kept sorted by name, so all iteration is deterministic.

Paths are always expressed relative to the tree root. See [normalize_path] for
the accepted syntax.
*/

pub mod error;
pub mod path;
pub mod tree;

pub use {
    error::{Result, VirtualTreeError},
    path::{normalize_path, split_dirname_basename},
    tree::{EntryKind, EntryMetadata, NodeId, Ownership, VirtualPath, VirtualTree},
};
