// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A writable, in-memory `FileSystem` backend (§4.4 "writable upper").
//!
//! Production HYFS deployments pair FWFS with a real writable backend
//! (SPIFFS, LittleFS, a POSIX host filesystem) — those are out of scope
//! for this crate (§1 "Out of scope"). `MemFs` plays that role here: a
//! minimal tree keyed by path, enough to exercise promotion, hide-list
//! masking and directory merging end to end without a real flash
//! device, the same role `ramdisk`/`cpio` play for the teacher's own
//! miniroot.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use md5::Digest;
use spin::Mutex;

use crate::attribute::{Acl, AttributeTag, Compression, FileAttributes};
use crate::capability::{
    CTRL_GET_MD5_HASH, DirEntry, FileSystem, FileSystemType, Handle, OpenFlags, SeekFrom, Stat,
    VolumeInfo,
};
use crate::descriptor::{Pool, DEFAULT_POOL_CAPACITY};
use crate::error::{Error, Result};
use crate::extent::Extent;

/// Base handle value for `MemFs` file descriptors. Kept below
/// [`crate::fwfs::FWFS_HANDLE_MIN`] so HYFS can route by range alone
/// when pairing this backend underneath or above an `Fwfs` instance.
pub const MEMFS_HANDLE_MIN: Handle = 0x1;

const MEMFS_DIR_HANDLE_MIN: Handle = MEMFS_HANDLE_MIN + DEFAULT_POOL_CAPACITY as Handle;

fn normalize(path: &str) -> String {
    path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("/")
}

fn parent_of(path: &str) -> Option<String> {
    match path.rsplit_once('/') {
        Some((p, _)) => Some(p.to_string()),
        None if path.is_empty() => None,
        None => Some(String::new()),
    }
}

fn name_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or("").to_string()
}

#[derive(Clone)]
enum Node {
    Dir { mtime: u32 },
    File { data: Vec<u8>, mtime: u32, attr: FileAttributes, acl: Acl, compression: Compression, xattrs: BTreeMap<u8, Vec<u8>> },
}

impl Node {
    fn new_file(mtime: u32) -> Node {
        Node::File {
            data: Vec::new(),
            mtime,
            attr: FileAttributes::empty(),
            acl: Acl::default(),
            compression: Compression::default(),
            xattrs: BTreeMap::new(),
        }
    }
}

struct FileHandle {
    path: String,
    cursor: u64,
}

struct DirHandle {
    path: String,
    names: Vec<String>,
    cursor: usize,
}

struct State {
    nodes: BTreeMap<String, Node>,
    files: Pool<FileHandle>,
    dirs: Pool<DirHandle>,
}

/// A writable in-memory filesystem, rooted at `""`.
pub struct MemFs {
    state: Mutex<State>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::new(), Node::Dir { mtime: 0 });
        MemFs {
            state: Mutex::new(State {
                nodes,
                files: Pool::new(MEMFS_HANDLE_MIN, DEFAULT_POOL_CAPACITY),
                dirs: Pool::new(MEMFS_DIR_HANDLE_MIN, DEFAULT_POOL_CAPACITY),
            }),
        }
    }

    fn stat_node(path: &str, node: &Node) -> Stat {
        match node {
            Node::Dir { mtime } => Stat {
                name: name_of(path),
                size: 0,
                id: 0,
                mtime: *mtime,
                attr: FileAttributes::DIRECTORY,
                acl: Acl::default(),
                compression: Compression::default(),
            },
            Node::File { data, mtime, attr, acl, compression, .. } => Stat {
                name: name_of(path),
                size: data.len() as u64,
                id: 0,
                mtime: *mtime,
                attr: *attr,
                acl: *acl,
                compression: *compression,
            },
        }
    }
}

impl FileSystem for MemFs {
    fn mount(&self) -> Result<()> {
        Ok(())
    }

    fn getinfo(&self) -> Result<VolumeInfo> {
        Ok(VolumeInfo {
            fs_type: FileSystemType::Other,
            attr: FileAttributes::empty(),
            max_name_len: 255,
            max_path_len: 4096,
            volume_size: 0,
            free_space: u64::MAX,
            volume_id: 0,
            name: String::new(),
            creation_time: 0,
        })
    }

    fn stat(&self, path: &str) -> Result<Stat> {
        let state = self.state.lock();
        let path = normalize(path);
        let node = state.nodes.get(&path).ok_or(Error::NotFound)?;
        Ok(Self::stat_node(&path, node))
    }

    fn fstat(&self, handle: Handle) -> Result<Stat> {
        let state = self.state.lock();
        let fh = state.files.get(handle)?;
        let node = state.nodes.get(&fh.path).ok_or(Error::NotFound)?;
        Ok(Self::stat_node(&fh.path, node))
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<Handle> {
        let mut state = self.state.lock();
        let path = normalize(path);
        let exists = state.nodes.contains_key(&path);
        if !exists {
            if !flags.contains(OpenFlags::CREATE) {
                return Err(Error::NotFound);
            }
            let parent = parent_of(&path).unwrap_or_default();
            if !matches!(state.nodes.get(&parent), Some(Node::Dir { .. })) {
                return Err(Error::NotFound);
            }
            state.nodes.insert(path.clone(), Node::new_file(0));
        } else {
            match state.nodes.get(&path) {
                Some(Node::Dir { .. }) => return Err(Error::BadParam),
                Some(Node::File { attr, .. }) if attr.contains(FileAttributes::READ_ONLY) && flags.wants_write() => {
                    return Err(Error::ReadOnly);
                }
                _ => {}
            }
            if flags.contains(OpenFlags::TRUNCATE) {
                if let Some(Node::File { data, .. }) = state.nodes.get_mut(&path) {
                    data.clear();
                }
            }
        }
        let cursor = if flags.contains(OpenFlags::APPEND) {
            match state.nodes.get(&path) {
                Some(Node::File { data, .. }) => data.len() as u64,
                _ => 0,
            }
        } else {
            0
        };
        state.files.alloc(FileHandle { path, cursor })
    }

    fn close(&self, handle: Handle) -> Result<()> {
        self.state.lock().files.free(handle)?;
        Ok(())
    }

    fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let fh = state.files.get(handle)?;
        let (path, cursor) = (fh.path.clone(), fh.cursor);
        let data = match state.nodes.get(&path) {
            Some(Node::File { data, .. }) => data,
            _ => return Err(Error::NotFound),
        };
        let start = cursor as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len(), data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        state.files.get_mut(handle)?.cursor += n as u64;
        Ok(n)
    }

    fn write(&self, handle: Handle, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let fh = state.files.get(handle)?;
        let (path, cursor) = (fh.path.clone(), fh.cursor);
        let data = match state.nodes.get_mut(&path) {
            Some(Node::File { data, .. }) => data,
            _ => return Err(Error::NotFound),
        };
        let start = cursor as usize;
        if start + buf.len() > data.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        state.files.get_mut(handle)?.cursor += buf.len() as u64;
        Ok(buf.len())
    }

    fn lseek(&self, handle: Handle, pos: SeekFrom) -> Result<u64> {
        let mut state = self.state.lock();
        let fh = state.files.get(handle)?;
        let (path, cursor) = (fh.path.clone(), fh.cursor);
        let size = match state.nodes.get(&path) {
            Some(Node::File { data, .. }) => data.len() as u64,
            _ => return Err(Error::NotFound),
        };
        let new_pos = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::Current(o) => cursor as i64 + o,
            SeekFrom::End(o) => size as i64 + o,
        };
        if new_pos < 0 {
            return Err(Error::SeekBounds);
        }
        state.files.get_mut(handle)?.cursor = new_pos as u64;
        Ok(new_pos as u64)
    }

    fn eof(&self, handle: Handle) -> Result<bool> {
        let state = self.state.lock();
        let fh = state.files.get(handle)?;
        match state.nodes.get(&fh.path) {
            Some(Node::File { data, .. }) => Ok(fh.cursor >= data.len() as u64),
            _ => Err(Error::NotFound),
        }
    }

    fn tell(&self, handle: Handle) -> Result<u64> {
        Ok(self.state.lock().files.get(handle)?.cursor)
    }

    fn ftruncate(&self, handle: Handle, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        let path = state.files.get(handle)?.path.clone();
        match state.nodes.get_mut(&path) {
            Some(Node::File { data, .. }) => {
                data.resize(size as usize, 0);
                Ok(())
            }
            _ => Err(Error::NotFound),
        }
    }

    fn opendir(&self, path: &str) -> Result<Handle> {
        let mut state = self.state.lock();
        let path = normalize(path);
        if !matches!(state.nodes.get(&path), Some(Node::Dir { .. })) {
            return Err(Error::NotFound);
        }
        let prefix = if path.is_empty() { String::new() } else { alloc::format!("{path}/") };
        let mut names: Vec<String> = state
            .nodes
            .keys()
            .filter(|k| k.starts_with(&prefix) && !k.is_empty() && k[prefix.len()..].find('/').is_none())
            .cloned()
            .collect();
        names.sort();
        state.dirs.alloc(DirHandle { path, names, cursor: 0 })
    }

    fn readdir(&self, handle: Handle) -> Result<DirEntry> {
        let mut state = self.state.lock();
        let dh = state.dirs.get(handle)?;
        if dh.cursor >= dh.names.len() {
            return Err(Error::NoMoreFiles);
        }
        let child_path = dh.names[dh.cursor].clone();
        let node = state.nodes.get(&child_path).ok_or(Error::NotFound)?.clone();
        let stat = Self::stat_node(&child_path, &node);
        state.dirs.get_mut(handle)?.cursor += 1;
        Ok(DirEntry { name: stat.name.clone(), stat })
    }

    fn rewinddir(&self, handle: Handle) -> Result<()> {
        self.state.lock().dirs.get_mut(handle)?.cursor = 0;
        Ok(())
    }

    fn closedir(&self, handle: Handle) -> Result<()> {
        self.state.lock().dirs.free(handle)?;
        Ok(())
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        let path = normalize(path);
        if state.nodes.contains_key(&path) {
            return Err(Error::BadParam);
        }
        let parent = parent_of(&path).unwrap_or_default();
        if !matches!(state.nodes.get(&parent), Some(Node::Dir { .. })) {
            return Err(Error::NotFound);
        }
        state.nodes.insert(path, Node::Dir { mtime: 0 });
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        let path = normalize(path);
        match state.nodes.get(&path) {
            Some(Node::File { attr, .. }) if attr.contains(FileAttributes::READ_ONLY) => {
                return Err(Error::ReadOnly);
            }
            Some(_) => {}
            None => return Err(Error::NotFound),
        }
        state.nodes.remove(&path);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state.lock();
        let from = normalize(from);
        let to = normalize(to);
        if let Some(Node::File { attr, .. }) = state.nodes.get(&from) {
            if attr.contains(FileAttributes::READ_ONLY) {
                return Err(Error::ReadOnly);
            }
        }
        let node = state.nodes.remove(&from).ok_or(Error::NotFound)?;
        state.nodes.insert(to, node);
        Ok(())
    }

    fn format(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.nodes.clear();
        state.nodes.insert(String::new(), Node::Dir { mtime: 0 });
        Ok(())
    }

    fn setxattr(&self, path: &str, tag: AttributeTag, value: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let path = normalize(path);
        match state.nodes.get_mut(&path) {
            Some(Node::File { attr, acl, compression, mtime, xattrs, .. }) => {
                set_xattr(attr, acl, compression, mtime, xattrs, tag, value)
            }
            Some(Node::Dir { .. }) => Err(Error::NotSupported),
            None => Err(Error::NotFound),
        }
    }

    fn getxattr(&self, path: &str, tag: AttributeTag, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.lock();
        let path = normalize(path);
        match state.nodes.get(&path) {
            Some(Node::File { attr, acl, compression, mtime, xattrs, .. }) => {
                get_xattr(*attr, *acl, *compression, *mtime, xattrs, tag, buf)
            }
            _ => Err(Error::NotFound),
        }
    }

    fn fsetxattr(&self, handle: Handle, tag: AttributeTag, value: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let path = state.files.get(handle)?.path.clone();
        match state.nodes.get_mut(&path) {
            Some(Node::File { attr, acl, compression, mtime, xattrs, .. }) => {
                set_xattr(attr, acl, compression, mtime, xattrs, tag, value)
            }
            _ => Err(Error::NotFound),
        }
    }

    fn fgetxattr(&self, handle: Handle, tag: AttributeTag, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.lock();
        let path = state.files.get(handle)?.path.clone();
        match state.nodes.get(&path) {
            Some(Node::File { attr, acl, compression, mtime, xattrs, .. }) => {
                get_xattr(*attr, *acl, *compression, *mtime, xattrs, tag, buf)
            }
            _ => Err(Error::NotFound),
        }
    }

    fn fenumxattr(&self, handle: Handle) -> Result<Vec<AttributeTag>> {
        let state = self.state.lock();
        let path = state.files.get(handle)?.path.clone();
        match state.nodes.get(&path) {
            Some(Node::File { acl, compression, xattrs, .. }) => {
                let mut tags = alloc::vec![AttributeTag::ModifiedTime, AttributeTag::FileAttributes];
                if acl.read_role != Default::default() || acl.write_role != Default::default() {
                    tags.push(AttributeTag::ReadAce);
                    tags.push(AttributeTag::WriteAce);
                }
                if compression.kind != crate::attribute::CompressionType::None {
                    tags.push(AttributeTag::Compression);
                }
                tags.extend(xattrs.keys().map(|&v| AttributeTag::from_tag_value(v)));
                Ok(tags)
            }
            _ => Err(Error::NotFound),
        }
    }

    fn fcontrol(&self, handle: Handle, code: u32, buf: &mut [u8]) -> Result<usize> {
        if code == CTRL_GET_MD5_HASH {
            let state = self.state.lock();
            let path = state.files.get(handle)?.path.clone();
            return match state.nodes.get(&path) {
                Some(Node::File { data, .. }) => {
                    if data.is_empty() {
                        return Err(Error::NotFound);
                    }
                    let digest: [u8; 16] = md5::Md5::digest(data).into();
                    if buf.len() < 16 {
                        return Err(Error::BufferTooSmall);
                    }
                    buf[..16].copy_from_slice(&digest);
                    Ok(16)
                }
                _ => Err(Error::NotFound),
            };
        }
        Err(Error::NotSupported)
    }

    fn fgetextents(&self, handle: Handle, out: &mut Vec<Extent>) -> Result<usize> {
        let state = self.state.lock();
        let path = state.files.get(handle)?.path.clone();
        match state.nodes.get(&path) {
            Some(Node::File { data, .. }) => {
                if !data.is_empty() {
                    out.push(Extent::contiguous(0, data.len() as u32));
                    Ok(1)
                } else {
                    Ok(0)
                }
            }
            _ => Err(Error::NotFound),
        }
    }

    fn owns_handle(&self, handle: Handle) -> bool {
        let state = self.state.lock();
        state.files.owns(handle) || state.dirs.owns(handle)
    }
}

#[allow(clippy::too_many_arguments)]
fn set_xattr(
    attr: &mut FileAttributes,
    acl: &mut Acl,
    compression: &mut Compression,
    mtime: &mut u32,
    xattrs: &mut BTreeMap<u8, Vec<u8>>,
    tag: AttributeTag,
    value: &[u8],
) -> Result<()> {
    match tag {
        AttributeTag::ModifiedTime => {
            if value.len() != 4 {
                return Err(Error::BadParam);
            }
            *mtime = u32::from_le_bytes(value.try_into().unwrap());
        }
        AttributeTag::FileAttributes => {
            if value.len() != 1 {
                return Err(Error::BadParam);
            }
            *attr = FileAttributes::from_bits_truncate(value[0]);
        }
        AttributeTag::ReadAce => {
            if value.len() != 1 {
                return Err(Error::BadParam);
            }
            acl.read_role = crate::attribute::UserRole::from_u8(value[0]).ok_or(Error::BadParam)?;
        }
        AttributeTag::WriteAce => {
            if value.len() != 1 {
                return Err(Error::BadParam);
            }
            acl.write_role = crate::attribute::UserRole::from_u8(value[0]).ok_or(Error::BadParam)?;
        }
        AttributeTag::Compression => {
            if value.len() != 5 {
                return Err(Error::BadParam);
            }
            let kind = crate::attribute::CompressionType::from_u8(value[0])?;
            let original_size = u32::from_le_bytes([value[1], value[2], value[3], value[4]]);
            *compression = Compression { kind, original_size };
        }
        AttributeTag::Acl | AttributeTag::VolumeIndex | AttributeTag::Md5Hash => {
            return Err(Error::NotSupported);
        }
        AttributeTag::Comment | AttributeTag::User(_) => {
            xattrs.insert(tag.tag_value(), value.to_vec());
        }
    }
    Ok(())
}

fn get_xattr(
    attr: FileAttributes,
    acl: Acl,
    compression: Compression,
    mtime: u32,
    xattrs: &BTreeMap<u8, Vec<u8>>,
    tag: AttributeTag,
    buf: &mut [u8],
) -> Result<usize> {
    match tag {
        AttributeTag::ModifiedTime => {
            if buf.len() < 4 {
                return Err(Error::BufferTooSmall);
            }
            buf[..4].copy_from_slice(&mtime.to_le_bytes());
            Ok(4)
        }
        AttributeTag::FileAttributes => {
            if buf.is_empty() {
                return Err(Error::BufferTooSmall);
            }
            buf[0] = attr.bits();
            Ok(1)
        }
        AttributeTag::ReadAce => {
            if buf.is_empty() {
                return Err(Error::BufferTooSmall);
            }
            buf[0] = acl.read_role as u8;
            Ok(1)
        }
        AttributeTag::WriteAce => {
            if buf.is_empty() {
                return Err(Error::BufferTooSmall);
            }
            buf[0] = acl.write_role as u8;
            Ok(1)
        }
        AttributeTag::Compression => {
            if buf.len() < 5 {
                return Err(Error::BufferTooSmall);
            }
            buf[0] = compression.kind as u8;
            buf[1..5].copy_from_slice(&compression.original_size.to_le_bytes());
            Ok(5)
        }
        AttributeTag::Acl | AttributeTag::VolumeIndex | AttributeTag::Md5Hash => Err(Error::NotFound),
        AttributeTag::Comment | AttributeTag::User(_) => {
            let value = xattrs.get(&tag.tag_value()).ok_or(Error::NotFound)?;
            if buf.len() < value.len() {
                return Err(Error::BufferTooSmall);
            }
            buf[..value.len()].copy_from_slice(value);
            Ok(value.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let fs = MemFs::new();
        fs.mount().unwrap();
        let h = fs.open("a.txt", OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::READ).unwrap();
        fs.write(h, b"hello").unwrap();
        fs.lseek(h, SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(fs.read(h, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        fs.close(h).unwrap();
    }

    #[test]
    fn mkdir_and_readdir_list_children() {
        let fs = MemFs::new();
        fs.mkdir("dir").unwrap();
        fs.open("dir/f", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
        let dh = fs.opendir("dir").unwrap();
        let entry = fs.readdir(dh).unwrap();
        assert_eq!(entry.name, "f");
        assert_eq!(fs.readdir(dh).err(), Some(Error::NoMoreFiles));
    }

    #[test]
    fn read_only_file_rejects_write_open() {
        let fs = MemFs::new();
        let h = fs.open("ro.txt", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
        fs.close(h).unwrap();
        fs.fsetxattr(
            fs.open("ro.txt", OpenFlags::READ).unwrap(),
            AttributeTag::FileAttributes,
            &[FileAttributes::READ_ONLY.bits()],
        )
        .unwrap();
        assert_eq!(fs.open("ro.txt", OpenFlags::WRITE).err(), Some(Error::ReadOnly));
    }
}
