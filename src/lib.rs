// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Installable File System framework.
//!
//! `ifs` provides three layers that compose on top of a byte-addressable
//! [`partition::Partition`]:
//!
//! - `fwfs`: a read-only, content-addressed, object-graph filesystem
//!   reader (C3) for images produced by [`archive::ArchiveStream`].
//! - `hyfs`: a copy-on-write overlay (C5) pairing a read-only lower
//!   filesystem with a writable upper one.
//! - `archive`: streams a mounted filesystem into a new FWFS image.
//!
//! All three implement the [`capability::FileSystem`] trait (C4), so
//! callers write code once against a `dyn FileSystem` and can mount a
//! raw image, a COW overlay, or (with the `std` feature) a file-backed
//! test fixture interchangeably.
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod archive;
pub mod attribute;
pub mod capability;
mod descriptor;
pub mod error;
pub mod extent;
#[cfg(feature = "std")]
pub mod filedevice;
pub mod fwfs;
pub mod hyfs;
pub mod memfs;
pub mod object;
pub mod partition;

pub use attribute::{Acl, AttributeTag, Compression, CompressionType, FileAttributes, UserRole};
pub use capability::{DirEntry, FileSystem, OpenFlags, Stat, VolumeInfo};
pub use error::{Error, Result};
pub use extent::Extent;
pub use partition::{MemoryPartition, Partition};
