// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! FWFS (C3, §4.3): the read-only, content-addressed object-graph
//! filesystem reader. `Fwfs<P>` wraps any [`Partition`] and implements
//! [`FileSystem`]; mounting, path resolution and attribute derivation
//! are pure functions in [`read`], kept separate from descriptor-table
//! bookkeeping here so the wire-format logic stays testable without a
//! mock filesystem.

extern crate alloc;

mod read;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, warn};
use spin::Mutex;

use crate::attribute::{Acl, AttributeTag, FileAttributes};
use crate::capability::{
    CTRL_GET_MD5_HASH, DirEntry, FileSystem, FileSystemType, Handle, OpenFlags, SeekFrom, Stat,
    VolumeInfo,
};
use crate::descriptor::{Pool, DEFAULT_POOL_CAPACITY};
use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::object::{self, ObjectHeader, ObjectType};
use crate::partition::Partition;

/// Upper bound on installed mountpoint slots (§3.2 `VolumeIndex`,
/// "mountpoint → volume slot (0…MAX_VOLUMES-1)").
pub const MAX_VOLUMES: usize = 8;

/// Base handle value for every FWFS file descriptor (§9 "Document the
/// base constant each backend must adopt"). HYFS reserves
/// `0..FWFS_HANDLE_MIN` for its writable upper layer.
pub const FWFS_HANDLE_MIN: Handle = 0x1000;

/// Base handle value for FWFS directory descriptors, kept disjoint
/// from [`FWFS_HANDLE_MIN`] (file descriptors) so a handle's numeric
/// value alone tells you which pool it came from.
const FWFS_DIR_HANDLE_MIN: Handle = FWFS_HANDLE_MIN + DEFAULT_POOL_CAPACITY as Handle;

enum FileDesc {
    Local { header: ObjectHeader, size: u64, cursor: u64 },
    Mounted { slot: u8, inner: Handle },
}

enum DirDesc {
    Local { table_offset: u64, table_end: u64, cursor: u64 },
    Mounted { slot: u8, inner: Handle },
}

struct State {
    mount: Option<read::MountInfo>,
    volumes: [Option<Arc<dyn FileSystem + Send + Sync>>; MAX_VOLUMES],
    files: Pool<FileDesc>,
    dirs: Pool<DirDesc>,
}

/// Read-only FWFS instance over a [`Partition`] (C3, §4.3).
pub struct Fwfs<P: Partition> {
    partition: P,
    state: Mutex<State>,
}

impl<P: Partition> Fwfs<P> {
    pub fn new(partition: P) -> Self {
        Fwfs {
            partition,
            state: Mutex::new(State {
                mount: None,
                volumes: Default::default(),
                files: Pool::new(FWFS_HANDLE_MIN, DEFAULT_POOL_CAPACITY),
                dirs: Pool::new(FWFS_DIR_HANDLE_MIN, DEFAULT_POOL_CAPACITY),
            }),
        }
    }

    fn with_mounted<R>(&self, f: impl FnOnce(&read::MountInfo, &State) -> Result<R>) -> Result<R> {
        let state = self.state.lock();
        let mount = state.mount.as_ref().ok_or(Error::NotMounted)?;
        f(mount, &state)
    }

    fn volume(&self, state: &State, slot: u8) -> Result<Arc<dyn FileSystem + Send + Sync>> {
        state.volumes.get(slot as usize).and_then(|v| v.clone()).ok_or(Error::NoFileSystem)
    }

    fn resolve(&self, mount: &read::MountInfo, path: &str, no_follow: bool) -> Result<read::Resolved> {
        read::resolve_path(&self.partition, mount.root_offset, path, no_follow)
    }
}

impl<P: Partition> FileSystem for Fwfs<P> {
    fn mount(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.mount.is_some() {
            return Ok(());
        }
        let info = read::mount(&self.partition).inspect_err(|e| {
            warn!("fwfs: mount failed: {e}");
        })?;
        debug!("fwfs: mounted volume {:#x} ({})", info.volume_id, info.volume_name);
        state.mount = Some(info);
        Ok(())
    }

    fn getinfo(&self) -> Result<VolumeInfo> {
        self.with_mounted(|mount, _| {
            Ok(VolumeInfo {
                fs_type: FileSystemType::Fwfs,
                attr: FileAttributes::READ_ONLY,
                max_name_len: 255,
                max_path_len: 4096,
                volume_size: self.partition.size(),
                free_space: 0,
                volume_id: mount.volume_id,
                name: mount.volume_name.clone(),
                creation_time: mount.root_mtime,
            })
        })
    }

    fn stat(&self, path: &str) -> Result<Stat> {
        self.with_mounted(|mount, state| match self.resolve(mount, path, false)? {
            read::Resolved::Object(header) => read::stat_of(&self.partition, &header, mount.root_acl),
            read::Resolved::Mount { slot, residual } => self.volume(state, slot)?.stat(&residual),
        })
    }

    fn fstat(&self, handle: Handle) -> Result<Stat> {
        let state = self.state.lock();
        let mount = state.mount.as_ref().ok_or(Error::NotMounted)?;
        match state.files.get(handle)? {
            FileDesc::Local { header, .. } => read::stat_of(&self.partition, header, mount.root_acl),
            FileDesc::Mounted { slot, inner } => {
                let (slot, inner) = (*slot, *inner);
                self.volume(&state, slot)?.fstat(inner)
            }
        }
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<Handle> {
        if flags.wants_write() {
            return Err(Error::ReadOnly);
        }
        let mut state = self.state.lock();
        let mount = state.mount.as_ref().ok_or(Error::NotMounted)?.root_offset;
        let resolved = read::resolve_path(&self.partition, mount, path, flags.contains(OpenFlags::NO_FOLLOW))?;
        match resolved {
            read::Resolved::Object(header) => {
                if header.object_type == ObjectType::Directory || header.object_type == ObjectType::Volume {
                    return Err(Error::BadParam);
                }
                let size = read::file_size(&self.partition, &header)?;
                state.files.alloc(FileDesc::Local { header, size, cursor: 0 })
            }
            read::Resolved::Mount { slot, residual } => {
                let inner_fs = self.volume(&state, slot)?;
                let inner = inner_fs.open(&residual, flags)?;
                state.files.alloc(FileDesc::Mounted { slot, inner })
            }
        }
    }

    fn close(&self, handle: Handle) -> Result<()> {
        let mut state = self.state.lock();
        match state.files.free(handle)? {
            FileDesc::Local { .. } => Ok(()),
            FileDesc::Mounted { slot, inner } => self.volume(&state, slot)?.close(inner),
        }
    }

    fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let local = match state.files.get(handle)? {
            FileDesc::Local { header, size, cursor } => Some((*header, *size, *cursor)),
            FileDesc::Mounted { .. } => None,
        };
        let Some((header, size, start)) = local else {
            let (slot, inner) = match state.files.get(handle)? {
                FileDesc::Mounted { slot, inner } => (*slot, *inner),
                FileDesc::Local { .. } => unreachable!(),
            };
            return self.volume(&state, slot)?.read(inner, buf);
        };
        if start >= size {
            return Ok(0);
        }
        let want = core::cmp::min(buf.len() as u64, size - start) as usize;
        let n = read_file_bytes(&self.partition, &header, start, &mut buf[..want])?;
        if let FileDesc::Local { cursor, .. } = state.files.get_mut(handle)? {
            *cursor += n as u64;
        }
        Ok(n)
    }

    fn lseek(&self, handle: Handle, pos: SeekFrom) -> Result<u64> {
        let mut state = self.state.lock();
        match state.files.get(handle)? {
            FileDesc::Local { size, cursor, .. } => {
                let (size, cursor) = (*size, *cursor);
                let new_pos = match pos {
                    SeekFrom::Start(o) => o as i64,
                    SeekFrom::Current(o) => cursor as i64 + o,
                    SeekFrom::End(o) => size as i64 + o,
                };
                if new_pos < 0 || new_pos as u64 > size {
                    return Err(Error::SeekBounds);
                }
                if let FileDesc::Local { cursor, .. } = state.files.get_mut(handle)? {
                    *cursor = new_pos as u64;
                }
                Ok(new_pos as u64)
            }
            FileDesc::Mounted { slot, inner } => {
                let (slot, inner) = (*slot, *inner);
                self.volume(&state, slot)?.lseek(inner, pos)
            }
        }
    }

    fn eof(&self, handle: Handle) -> Result<bool> {
        let state = self.state.lock();
        match state.files.get(handle)? {
            FileDesc::Local { size, cursor, .. } => Ok(*cursor >= *size),
            FileDesc::Mounted { slot, inner } => {
                let (slot, inner) = (*slot, *inner);
                self.volume(&state, slot)?.eof(inner)
            }
        }
    }

    fn tell(&self, handle: Handle) -> Result<u64> {
        let state = self.state.lock();
        match state.files.get(handle)? {
            FileDesc::Local { cursor, .. } => Ok(*cursor),
            FileDesc::Mounted { slot, inner } => {
                let (slot, inner) = (*slot, *inner);
                self.volume(&state, slot)?.tell(inner)
            }
        }
    }

    fn opendir(&self, path: &str) -> Result<Handle> {
        let mut state = self.state.lock();
        let root_offset = state.mount.as_ref().ok_or(Error::NotMounted)?.root_offset;
        let resolved = read::resolve_path(&self.partition, root_offset, path, false)?;
        match resolved {
            read::Resolved::Object(header) => {
                if !header.object_type.is_named() || header.object_type == ObjectType::File {
                    return Err(Error::BadParam);
                }
                let info = object::read_named_info(&self.partition, &header)?;
                state.dirs.alloc(DirDesc::Local {
                    table_offset: info.child_table_offset,
                    table_end: header.end_offset(),
                    cursor: info.child_table_offset,
                })
            }
            read::Resolved::Mount { slot, residual } => {
                let inner_fs = self.volume(&state, slot)?;
                let inner = inner_fs.opendir(&residual)?;
                state.dirs.alloc(DirDesc::Mounted { slot, inner })
            }
        }
    }

    fn readdir(&self, handle: Handle) -> Result<DirEntry> {
        let mut state = self.state.lock();
        let root_acl = state.mount.as_ref().ok_or(Error::NotMounted)?.root_acl;
        match state.dirs.get_mut(handle)? {
            DirDesc::Local { table_end, cursor, .. } => {
                let (table_end, mut pos) = (*table_end, *cursor);
                loop {
                    if pos >= table_end {
                        if let DirDesc::Local { cursor, .. } = state.dirs.get_mut(handle)? {
                            *cursor = pos;
                        }
                        return Err(Error::NoMoreFiles);
                    }
                    let header = object::read_header(&self.partition, pos)?;
                    pos = header.end_offset();
                    if !header.object_type.is_named() {
                        continue;
                    }
                    let resolved = object::resolve_reference(&self.partition, &header)?;
                    let stat = read::stat_of(&self.partition, &resolved, root_acl)?;
                    if let DirDesc::Local { cursor, .. } = state.dirs.get_mut(handle)? {
                        *cursor = pos;
                    }
                    return Ok(DirEntry { name: stat.name.clone(), stat });
                }
            }
            DirDesc::Mounted { slot, inner } => {
                let (slot, inner) = (*slot, *inner);
                self.volume(&state, slot)?.readdir(inner)
            }
        }
    }

    fn rewinddir(&self, handle: Handle) -> Result<()> {
        let mut state = self.state.lock();
        match state.dirs.get_mut(handle)? {
            DirDesc::Local { table_offset, cursor, .. } => {
                *cursor = *table_offset;
                Ok(())
            }
            DirDesc::Mounted { slot, inner } => {
                let (slot, inner) = (*slot, *inner);
                self.volume(&state, slot)?.rewinddir(inner)
            }
        }
    }

    fn closedir(&self, handle: Handle) -> Result<()> {
        let mut state = self.state.lock();
        match state.dirs.free(handle)? {
            DirDesc::Local { .. } => Ok(()),
            DirDesc::Mounted { slot, inner } => self.volume(&state, slot)?.closedir(inner),
        }
    }

    fn getxattr(&self, path: &str, tag: AttributeTag, buf: &mut [u8]) -> Result<usize> {
        self.with_mounted(|mount, state| match self.resolve(mount, path, false)? {
            read::Resolved::Object(header) => read::get_xattr(&self.partition, &header, tag, buf),
            read::Resolved::Mount { slot, residual } => self.volume(state, slot)?.getxattr(&residual, tag, buf),
        })
    }

    fn fgetxattr(&self, handle: Handle, tag: AttributeTag, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.lock();
        match state.files.get(handle)? {
            FileDesc::Local { header, .. } => read::get_xattr(&self.partition, header, tag, buf),
            FileDesc::Mounted { slot, inner } => {
                let (slot, inner) = (*slot, *inner);
                self.volume(&state, slot)?.fgetxattr(inner, tag, buf)
            }
        }
    }

    fn setxattr(&self, _path: &str, _tag: AttributeTag, _value: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn fsetxattr(&self, _handle: Handle, _tag: AttributeTag, _value: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn fenumxattr(&self, handle: Handle) -> Result<Vec<AttributeTag>> {
        let state = self.state.lock();
        match state.files.get(handle)? {
            FileDesc::Local { header, .. } => read::enum_xattrs(&self.partition, header),
            FileDesc::Mounted { slot, inner } => {
                let (slot, inner) = (*slot, *inner);
                self.volume(&state, slot)?.fenumxattr(inner)
            }
        }
    }

    fn fcontrol(&self, handle: Handle, code: u32, buf: &mut [u8]) -> Result<usize> {
        if code == CTRL_GET_MD5_HASH {
            let state = self.state.lock();
            return match state.files.get(handle)? {
                FileDesc::Local { header, .. } => {
                    if header.content_size == 0 {
                        return Err(Error::NotFound);
                    }
                    let hash = read::find_md5(&self.partition, header)?;
                    if buf.len() < 16 {
                        return Err(Error::BufferTooSmall);
                    }
                    buf[..16].copy_from_slice(&hash);
                    Ok(16)
                }
                FileDesc::Mounted { slot, inner } => {
                    let (slot, inner) = (*slot, *inner);
                    self.volume(&state, slot)?.fcontrol(inner, code, buf)
                }
            };
        }
        Err(Error::NotSupported)
    }

    fn fgetextents(&self, handle: Handle, out: &mut Vec<Extent>) -> Result<usize> {
        let state = self.state.lock();
        match state.files.get(handle)? {
            FileDesc::Local { header, .. } => {
                let children = read::data_children(&self.partition, header)?;
                let mut extents: Vec<Extent> = Vec::new();
                for child in children {
                    let candidate = Extent::contiguous(child.content_offset, child.content_size);
                    if let Some(last) = extents.last_mut() {
                        if last.try_merge(&candidate) {
                            continue;
                        }
                    }
                    extents.push(candidate);
                }
                let total = extents.len();
                out.extend(extents);
                Ok(total)
            }
            FileDesc::Mounted { slot, inner } => {
                let (slot, inner) = (*slot, *inner);
                self.volume(&state, slot)?.fgetextents(inner, out)
            }
        }
    }

    fn set_volume(&self, index: u8, fs: Arc<dyn FileSystem + Send + Sync>) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.volumes.get_mut(index as usize).ok_or(Error::BadParam)?;
        *slot = Some(fs);
        Ok(())
    }

    fn owns_handle(&self, handle: Handle) -> bool {
        let state = self.state.lock();
        state.files.owns(handle) || state.dirs.owns(handle)
    }
}

/// Reads `buf.len()` bytes of a file's data starting at `start`,
/// walking its data children in declaration order and skipping those
/// that end before `start` (§4.3 "File size and data read").
fn read_file_bytes(
    partition: &dyn Partition,
    header: &ObjectHeader,
    start: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let children = read::data_children(partition, header)?;
    let mut child_start = 0u64;
    let mut done = 0usize;
    for child in children {
        let child_end = child_start + child.content_size as u64;
        if child_end <= start + done as u64 {
            child_start = child_end;
            continue;
        }
        if done == buf.len() {
            break;
        }
        let want_start = (start + done as u64).max(child_start);
        let in_child_offset = want_start - child_start;
        let available = child.content_size as u64 - in_child_offset;
        let want = core::cmp::min(available, (buf.len() - done) as u64) as usize;
        partition
            .read(child.content_offset + in_child_offset, &mut buf[done..done + want])
            .map_err(|_| Error::ReadFailure)?;
        done += want;
        child_start = child_end;
        if done == buf.len() {
            break;
        }
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::MemoryPartition;

    #[test]
    fn smoke_mount_rejects_bad_marker() {
        let p = MemoryPartition::zeroed(16, 16);
        let fs = Fwfs::new(p);
        assert_eq!(fs.mount().err(), Some(Error::BadFileSystem));
    }

    #[test]
    fn not_mounted_rejects_stat() {
        let p = MemoryPartition::zeroed(16, 16);
        let fs = Fwfs::new(p);
        assert_eq!(fs.stat("/"), Err(Error::NotMounted));
    }
}
