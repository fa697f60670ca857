// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `FileSystem` capability (C4, §4.1): a flat trait every backend
//! — FWFS, HYFS, and whatever the embedder plugs in at a mountpoint —
//! implements. Default methods return `NotSupported` rather than
//! forcing every backend to restate a no-op; concrete backends
//! override only what they actually do (§9 "inheritance collapse").

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::attribute::{Acl, Compression, FileAttributes};
use crate::error::{Error, Result};
use crate::extent::Extent;

bitflags! {
    /// Flags accepted by [`FileSystem::open`] (§6.2). A backend that
    /// does not recognize a flag it was given must fail `NotSupported`;
    /// a strictly read-only backend must fail any combination that
    /// includes `WRITE`, `CREATE`, `APPEND` or `TRUNCATE`.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct OpenFlags: u8 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const CREATE    = 1 << 2;
        const APPEND    = 1 << 3;
        const TRUNCATE  = 1 << 4;
        const NO_FOLLOW = 1 << 5;
    }
}

impl OpenFlags {
    /// Flags that require a writable backend.
    const WRITE_FLAGS: OpenFlags =
        OpenFlags::WRITE.union(OpenFlags::CREATE).union(OpenFlags::APPEND).union(OpenFlags::TRUNCATE);

    pub fn wants_write(self) -> bool {
        self.intersects(Self::WRITE_FLAGS)
    }
}

/// The kind of thing a `FileSystem` instance is, as reported by
/// `getinfo` (§4.1). Mostly informational; backends are free to report
/// whatever subtype name matches their partition (§6.6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileSystemType {
    Fwfs,
    Hyfs,
    Other,
}

/// `getinfo` output (§4.1).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeInfo {
    pub fs_type: FileSystemType,
    pub attr: FileAttributes,
    pub max_name_len: usize,
    pub max_path_len: usize,
    pub volume_size: u64,
    pub free_space: u64,
    pub volume_id: u32,
    pub name: String,
    pub creation_time: u32,
}

/// `stat`/`fstat` output (§4.1, §4.3 "attribute derivation").
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Stat {
    pub name: String,
    pub size: u64,
    pub id: u64,
    pub mtime: u32,
    pub attr: FileAttributes,
    pub acl: Acl,
    pub compression: Compression,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.attr.contains(FileAttributes::DIRECTORY)
    }

    pub fn is_mount_point(&self) -> bool {
        self.attr.contains(FileAttributes::MOUNT_POINT)
    }
}

/// A single `readdir` result (§4.1). `.` and `..` are never produced
/// (§8 invariant 10).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub stat: Stat,
}

/// Opaque handle returned by `open`/`opendir`. Backends are required to
/// adopt disjoint numeric ranges (§4.1, §9 "handle allocation") so a
/// composer such as HYFS can route a handle to the owning backend by
/// range alone, without tagging the handle's type at runtime.
pub type Handle = u32;

/// Control codes accepted by `fcontrol` (§6.5).
pub const CTRL_GET_MD5_HASH: u32 = 1;
pub const CTRL_SET_VOLUME_LABEL: u32 = 2;
pub const CTRL_USER_BASE: u32 = 0x8000;

/// The common capability every backend implements (C4, §4.1).
///
/// Every operation returns [`Error`] on failure without mutating
/// backend state (§4.1 "Failure policy"); partial reads return the
/// number of bytes actually transferred rather than erroring.
pub trait FileSystem {
    /// Verifies backend integrity and caches root metadata. Idempotent
    /// once it has succeeded once. Takes `&self`, not `&mut self`: every
    /// backend keeps its mutable state behind interior mutability
    /// (`spin::Mutex`, §5) so a mounted filesystem can be shared as
    /// `Arc<dyn FileSystem>` and installed at a HYFS/FWFS mountpoint
    /// slot without requiring unique ownership.
    fn mount(&self) -> Result<()>;

    fn getinfo(&self) -> Result<VolumeInfo>;

    fn stat(&self, path: &str) -> Result<Stat>;

    fn fstat(&self, handle: Handle) -> Result<Stat>;

    /// `path` may be empty or `"/"`  to mean the root directory; a
    /// trailing slash is insignificant (§8 invariant 2).
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Handle>;

    fn close(&self, handle: Handle) -> Result<()>;

    fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize>;

    fn write(&self, handle: Handle, buf: &[u8]) -> Result<usize> {
        let _ = (handle, buf);
        Err(Error::NotSupported)
    }

    fn lseek(&self, handle: Handle, pos: SeekFrom) -> Result<u64>;

    fn eof(&self, handle: Handle) -> Result<bool>;

    fn tell(&self, handle: Handle) -> Result<u64>;

    fn ftruncate(&self, handle: Handle, size: u64) -> Result<()> {
        let _ = (handle, size);
        Err(Error::NotSupported)
    }

    fn flush(&self, handle: Handle) -> Result<()> {
        let _ = handle;
        Ok(())
    }

    fn opendir(&self, path: &str) -> Result<Handle>;

    /// Returns `Err(NoMoreFiles)` once the directory is exhausted
    /// (§4.1).
    fn readdir(&self, handle: Handle) -> Result<DirEntry>;

    fn rewinddir(&self, handle: Handle) -> Result<()>;

    fn closedir(&self, handle: Handle) -> Result<()>;

    fn mkdir(&self, path: &str) -> Result<()> {
        let _ = path;
        Err(Error::NotSupported)
    }

    fn remove(&self, path: &str) -> Result<()> {
        let _ = path;
        Err(Error::NotSupported)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let _ = (from, to);
        Err(Error::NotSupported)
    }

    fn fremove(&self, handle: Handle) -> Result<()> {
        let _ = handle;
        Err(Error::NotSupported)
    }

    fn format(&self) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Returns a non-negative recoverable-error count on backends that
    /// support consistency checking (§7 "Recovery").
    fn check(&self) -> Result<u32> {
        Err(Error::NotSupported)
    }

    fn setxattr(&self, path: &str, tag: crate::attribute::AttributeTag, value: &[u8]) -> Result<()> {
        let _ = (path, tag, value);
        Err(Error::NotSupported)
    }

    fn getxattr(&self, path: &str, tag: crate::attribute::AttributeTag, buf: &mut [u8]) -> Result<usize> {
        let _ = (path, tag, buf);
        Err(Error::NotSupported)
    }

    fn fsetxattr(&self, handle: Handle, tag: crate::attribute::AttributeTag, value: &[u8]) -> Result<()> {
        let _ = (handle, tag, value);
        Err(Error::NotSupported)
    }

    fn fgetxattr(&self, handle: Handle, tag: crate::attribute::AttributeTag, buf: &mut [u8]) -> Result<usize> {
        let _ = (handle, tag, buf);
        Err(Error::NotSupported)
    }

    /// Enumerates every attribute tag currently set on `handle`, most
    /// useful to HYFS promotion (§4.4) and `ArchiveStream` (§4.5) which
    /// both need to copy "whatever is set" without a fixed tag list.
    fn fenumxattr(&self, handle: Handle) -> Result<Vec<crate::attribute::AttributeTag>> {
        let _ = handle;
        Err(Error::NotSupported)
    }

    fn fcontrol(&self, handle: Handle, code: u32, buf: &mut [u8]) -> Result<usize> {
        let _ = (handle, code, buf);
        Err(Error::NotSupported)
    }

    /// Reports `handle`'s on-media layout as a run list (§4.6). Returns
    /// the total number of extents describing the file, writing as
    /// many as fit in `out` (capacity-limited, like `readdir`).
    fn fgetextents(&self, handle: Handle, out: &mut Vec<Extent>) -> Result<usize> {
        let _ = (handle, out);
        Err(Error::NotSupported)
    }

    /// Installs a child filesystem at mountpoint slot `index` (§4.1).
    fn set_volume(&self, index: u8, fs: alloc::sync::Arc<dyn FileSystem + Send + Sync>) -> Result<()> {
        let _ = (index, fs);
        Err(Error::NotSupported)
    }

    /// Whether `handle` falls within the numeric range this backend
    /// allocates its own descriptors from (§9 "handle allocation"), not
    /// whether a descriptor is currently live there. A composer such as
    /// HYFS uses this to route a handle to the owning backend without
    /// storing a parent pointer or type tag in the handle value itself.
    /// Backends that never hand out handles (pure composers) leave this
    /// as `false`.
    fn owns_handle(&self, handle: Handle) -> bool {
        let _ = handle;
        false
    }
}

/// `lseek` origin, POSIX-style (§4.1 "standard POSIX semantics").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_detect_write_intent() {
        assert!(!OpenFlags::READ.wants_write());
        assert!(OpenFlags::WRITE.wants_write());
        assert!(OpenFlags::CREATE.wants_write());
        assert!((OpenFlags::READ | OpenFlags::APPEND).wants_write());
    }

    #[test]
    fn stat_reports_directory_and_mountpoint_bits() {
        let mut attr = FileAttributes::empty();
        attr.insert(FileAttributes::DIRECTORY);
        let stat = Stat {
            name: "d".into(),
            size: 0,
            id: 0,
            mtime: 0,
            attr,
            acl: Acl::default(),
            compression: Compression::default(),
        };
        assert!(stat.is_dir());
        assert!(!stat.is_mount_point());
    }
}
