// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HYFS (C5, §4.4): a copy-on-write overlay pairing a read-only lower
//! filesystem (typically `Fwfs`) with a writable upper one. Reads try
//! the upper first, fall back to the lower; a write to a lower-only
//! path triggers promotion; deletes of lower-only paths are recorded in
//! an in-memory hide-list rather than mutating the lower image.

extern crate alloc;

use alloc::collections::BTreeSet;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::{debug, warn};
use spin::Mutex;

use crate::attribute::{AttributeTag, FileAttributes};
use crate::capability::{DirEntry, FileSystem, FileSystemType, Handle, OpenFlags, SeekFrom, Stat, VolumeInfo};
use crate::error::{Error, Result};
use crate::extent::Extent;

/// Copy buffer size used while streaming a promoted file's content
/// from the lower filesystem into the upper one.
const PROMOTE_BUF_SIZE: usize = 512;

/// Directory-enumeration state spanning both layers for one
/// `opendir`/`readdir`/`rewinddir`/`closedir` lifetime. Not addressed
/// by either backend's own handle pool — HYFS allocates its own
/// sequence number for it, disjoint from both (§9 "Backend routing").
struct DirCursor {
    path: String,
    upper: Option<Handle>,
    lower: Option<Handle>,
    /// Names already yielded from the upper layer this pass, so the
    /// lower layer's enumeration can skip shadowed entries without a
    /// second hide-list lookup.
    shadowed: BTreeSet<String>,
}

struct State {
    /// Lower-object ids whose path has been `remove`d while only
    /// present in the lower filesystem (§4.4 "Deletion / hiding").
    hide_list: BTreeSet<u64>,
    dirs: alloc::collections::BTreeMap<Handle, DirCursor>,
    next_dir_handle: Handle,
}

/// Base handle for HYFS's own directory-cursor sequence. Chosen well
/// below [`crate::fwfs::FWFS_HANDLE_MIN`] and [`crate::memfs::MEMFS_HANDLE_MIN`]'s
/// ranges so it never collides with a handle returned directly by
/// either backend.
const HYFS_DIR_HANDLE_MIN: Handle = 0x8000;

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        alloc::format!("{dir}/{name}")
    }
}

/// `Hyfs<L, U>`: `L` is the read-only lower filesystem, `U` the
/// writable upper one. Both must be mounted independently before use
/// (§4.4 "Composition").
pub struct Hyfs<L: FileSystem, U: FileSystem> {
    lower: L,
    upper: U,
    state: Mutex<State>,
}

impl<L: FileSystem, U: FileSystem> Hyfs<L, U> {
    pub fn new(lower: L, upper: U) -> Self {
        Hyfs {
            lower,
            upper,
            state: Mutex::new(State {
                hide_list: BTreeSet::new(),
                dirs: alloc::collections::BTreeMap::new(),
                next_dir_handle: HYFS_DIR_HANDLE_MIN,
            }),
        }
    }

    fn is_hidden(&self, state: &State, path: &str) -> bool {
        match self.lower.stat(path) {
            Ok(stat) => state.hide_list.contains(&stat.id),
            Err(_) => false,
        }
    }

    /// Routes a handle back to the backend that owns it (§9 "Backend
    /// routing in HYFS"): no parent pointer is stored in the handle
    /// itself, just a range check against each backend's own pool.
    fn route_file(&self, handle: Handle) -> RoutedTo {
        if self.upper.owns_handle(handle) {
            RoutedTo::Upper
        } else {
            RoutedTo::Lower
        }
    }

    /// Implements §4.4 "Promotion protocol" verbatim: open lower
    /// read-only, refuse if ReadOnly-attributed, create the path (and
    /// its parents) in the upper layer, copy every extended attribute,
    /// stream content unless the caller asked to truncate, then hand
    /// back the upper handle with the cursor positioned per the
    /// requested flags.
    fn promote(&self, path: &str, flags: OpenFlags) -> Result<Handle> {
        let lower_handle = self.lower.open(path, OpenFlags::READ)?;
        let lower_stat = self.lower.fstat(lower_handle).inspect_err(|_| {
            let _ = self.lower.close(lower_handle);
        })?;
        if lower_stat.attr.contains(FileAttributes::READ_ONLY) {
            let _ = self.lower.close(lower_handle);
            return Err(Error::ReadOnly);
        }

        if let Some(parent) = path.rsplit_once('/').map(|(p, _)| p) {
            mkdir_recursive(&self.upper, parent);
        }

        let create_flags = OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE | flags;
        let upper_handle = match self.upper.open(path, create_flags) {
            Ok(h) => h,
            Err(e) => {
                let _ = self.lower.close(lower_handle);
                return Err(e);
            }
        };

        if let Ok(tags) = self.lower.fenumxattr(lower_handle) {
            let mut buf = [0u8; 256];
            for tag in tags {
                match self.lower.fgetxattr(lower_handle, tag, &mut buf) {
                    Ok(n) => {
                        if let Err(e) = self.upper.fsetxattr(upper_handle, tag, &buf[..n]) {
                            warn!("hyfs: promotion of {path}: copying attribute {tag:?} failed: {e}");
                        }
                    }
                    Err(e) => warn!("hyfs: promotion of {path}: reading attribute {tag:?} failed: {e}"),
                }
            }
        }

        if !flags.contains(OpenFlags::TRUNCATE) {
            self.upper.lseek(upper_handle, SeekFrom::Start(0))?;
            let mut buf = [0u8; PROMOTE_BUF_SIZE];
            loop {
                let n = self.lower.read(lower_handle, &mut buf)?;
                if n == 0 {
                    break;
                }
                let mut done = 0;
                while done < n {
                    done += self.upper.write(upper_handle, &buf[done..n])?;
                }
            }
            if !flags.contains(OpenFlags::APPEND) {
                self.upper.lseek(upper_handle, SeekFrom::Start(0))?;
            }
        }

        self.lower.close(lower_handle)?;
        debug!("hyfs: promoted {path} to the writable layer");
        Ok(upper_handle)
    }
}

enum RoutedTo {
    Upper,
    Lower,
}

/// Creates `path` and every ancestor that doesn't already exist in
/// `fs`, ignoring `BadParam`/already-exists style failures (§4.4
/// "Create parent directories in upper (recursive mkdir)").
fn mkdir_recursive(fs: &impl FileSystem, path: &str) {
    if path.is_empty() {
        return;
    }
    let mut built = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        built = join(&built, segment);
        let _ = fs.mkdir(&built);
    }
}

impl<L: FileSystem, U: FileSystem> FileSystem for Hyfs<L, U> {
    fn mount(&self) -> Result<()> {
        self.lower.mount()?;
        self.upper.mount()?;
        Ok(())
    }

    fn getinfo(&self) -> Result<VolumeInfo> {
        let mut info = self.lower.getinfo()?;
        info.fs_type = FileSystemType::Hyfs;
        Ok(info)
    }

    fn stat(&self, path: &str) -> Result<Stat> {
        match self.upper.stat(path) {
            Ok(stat) => Ok(stat),
            Err(Error::NotFound) => {
                let state = self.state.lock();
                if self.is_hidden(&state, path) {
                    return Err(Error::NotFound);
                }
                self.lower.stat(path)
            }
            Err(e) => Err(e),
        }
    }

    fn fstat(&self, handle: Handle) -> Result<Stat> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.fstat(handle),
            RoutedTo::Lower => self.lower.fstat(handle),
        }
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<Handle> {
        match self.upper.stat(path) {
            Ok(_) => return self.upper.open(path, flags),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        let state = self.state.lock();
        if self.is_hidden(&state, path) {
            drop(state);
            return if flags.contains(OpenFlags::CREATE) {
                self.upper.open(path, flags)
            } else {
                Err(Error::NotFound)
            };
        }
        drop(state);

        if !flags.wants_write() {
            return self.lower.open(path, flags);
        }
        self.promote(path, flags)
    }

    fn close(&self, handle: Handle) -> Result<()> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.close(handle),
            RoutedTo::Lower => self.lower.close(handle),
        }
    }

    fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.read(handle, buf),
            RoutedTo::Lower => self.lower.read(handle, buf),
        }
    }

    fn write(&self, handle: Handle, buf: &[u8]) -> Result<usize> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.write(handle, buf),
            RoutedTo::Lower => Err(Error::ReadOnly),
        }
    }

    fn lseek(&self, handle: Handle, pos: SeekFrom) -> Result<u64> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.lseek(handle, pos),
            RoutedTo::Lower => self.lower.lseek(handle, pos),
        }
    }

    fn eof(&self, handle: Handle) -> Result<bool> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.eof(handle),
            RoutedTo::Lower => self.lower.eof(handle),
        }
    }

    fn tell(&self, handle: Handle) -> Result<u64> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.tell(handle),
            RoutedTo::Lower => self.lower.tell(handle),
        }
    }

    fn ftruncate(&self, handle: Handle, size: u64) -> Result<()> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.ftruncate(handle, size),
            RoutedTo::Lower => Err(Error::ReadOnly),
        }
    }

    fn flush(&self, handle: Handle) -> Result<()> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.flush(handle),
            RoutedTo::Lower => self.lower.flush(handle),
        }
    }

    fn opendir(&self, path: &str) -> Result<Handle> {
        let upper = self.upper.opendir(path).ok();
        let lower = self.lower.opendir(path).ok();
        if upper.is_none() && lower.is_none() {
            return Err(Error::NotFound);
        }
        let mut state = self.state.lock();
        let handle = state.next_dir_handle;
        state.next_dir_handle += 1;
        state.dirs.insert(
            handle,
            DirCursor { path: path.to_string(), upper, lower, shadowed: BTreeSet::new() },
        );
        Ok(handle)
    }

    /// First exhausts the upper layer's entries (recording each name so
    /// the lower pass can mask it), then the lower layer's, skipping
    /// any lower entry whose id is on the hide-list (§4.4 "Directory
    /// enumeration").
    fn readdir(&self, handle: Handle) -> Result<DirEntry> {
        let mut state = self.state.lock();
        let upper_handle = state.dirs.get(&handle).ok_or(Error::InvalidHandle)?.upper;

        if let Some(upper_handle) = upper_handle {
            match self.upper.readdir(upper_handle) {
                Ok(entry) => {
                    state.dirs.get_mut(&handle).ok_or(Error::InvalidHandle)?.shadowed.insert(entry.name.clone());
                    return Ok(entry);
                }
                Err(Error::NoMoreFiles) => {}
                Err(e) => return Err(e),
            }
        }

        let cursor_path = state.dirs.get(&handle).ok_or(Error::InvalidHandle)?.path.clone();
        let lower_handle = state.dirs.get(&handle).ok_or(Error::InvalidHandle)?.lower;
        let Some(lower_handle) = lower_handle else {
            return Err(Error::NoMoreFiles);
        };
        loop {
            let entry = self.lower.readdir(lower_handle)?;
            let already_shadowed =
                state.dirs.get(&handle).ok_or(Error::InvalidHandle)?.shadowed.contains(&entry.name);
            if already_shadowed {
                continue;
            }
            let child_path = join(&cursor_path, &entry.name);
            if self.is_hidden(&state, &child_path) {
                continue;
            }
            return Ok(entry);
        }
    }

    fn rewinddir(&self, handle: Handle) -> Result<()> {
        let mut state = self.state.lock();
        let cursor = state.dirs.get_mut(&handle).ok_or(Error::InvalidHandle)?;
        cursor.shadowed.clear();
        if let Some(h) = cursor.upper {
            self.upper.rewinddir(h)?;
        }
        if let Some(h) = cursor.lower {
            self.lower.rewinddir(h)?;
        }
        Ok(())
    }

    fn closedir(&self, handle: Handle) -> Result<()> {
        let cursor = self.state.lock().dirs.remove(&handle).ok_or(Error::InvalidHandle)?;
        if let Some(h) = cursor.upper {
            self.upper.closedir(h)?;
        }
        if let Some(h) = cursor.lower {
            self.lower.closedir(h)?;
        }
        Ok(())
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        self.upper.mkdir(path)
    }

    /// Removes `path` from the upper layer if present; if it also (or
    /// only) exists in the lower layer, records its lower object id in
    /// the hide-list instead of mutating the read-only image (§4.4
    /// "Deletion / hiding").
    fn remove(&self, path: &str) -> Result<()> {
        let upper_result = self.upper.remove(path);
        match self.lower.stat(path) {
            Ok(lower_stat) => {
                if lower_stat.attr.contains(FileAttributes::READ_ONLY) {
                    return Err(Error::ReadOnly);
                }
                self.state.lock().hide_list.insert(lower_stat.id);
                Ok(())
            }
            Err(Error::NotFound) => upper_result,
            Err(e) => Err(e),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        if self.upper.stat(from).is_ok() {
            return self.upper.rename(from, to);
        }
        let promoted = self.promote(from, OpenFlags::READ)?;
        self.upper.close(promoted)?;
        self.remove(from)?;
        self.upper.rename(from, to)
    }

    fn fremove(&self, handle: Handle) -> Result<()> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.fremove(handle),
            RoutedTo::Lower => Err(Error::ReadOnly),
        }
    }

    fn format(&self) -> Result<()> {
        self.upper.format()?;
        self.state.lock().hide_list.clear();
        Ok(())
    }

    fn check(&self) -> Result<u32> {
        let a = self.lower.check().unwrap_or(0);
        let b = self.upper.check().unwrap_or(0);
        Ok(a + b)
    }

    fn setxattr(&self, path: &str, tag: AttributeTag, value: &[u8]) -> Result<()> {
        if self.upper.stat(path).is_ok() {
            return self.upper.setxattr(path, tag, value);
        }
        let handle = self.promote(path, OpenFlags::READ | OpenFlags::WRITE)?;
        let result = self.upper.fsetxattr(handle, tag, value);
        self.upper.close(handle)?;
        result
    }

    fn getxattr(&self, path: &str, tag: AttributeTag, buf: &mut [u8]) -> Result<usize> {
        match self.upper.getxattr(path, tag, buf) {
            Ok(n) => Ok(n),
            Err(Error::NotFound) => self.lower.getxattr(path, tag, buf),
            Err(e) => Err(e),
        }
    }

    fn fsetxattr(&self, handle: Handle, tag: AttributeTag, value: &[u8]) -> Result<()> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.fsetxattr(handle, tag, value),
            RoutedTo::Lower => Err(Error::ReadOnly),
        }
    }

    fn fgetxattr(&self, handle: Handle, tag: AttributeTag, buf: &mut [u8]) -> Result<usize> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.fgetxattr(handle, tag, buf),
            RoutedTo::Lower => self.lower.fgetxattr(handle, tag, buf),
        }
    }

    fn fenumxattr(&self, handle: Handle) -> Result<Vec<AttributeTag>> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.fenumxattr(handle),
            RoutedTo::Lower => self.lower.fenumxattr(handle),
        }
    }

    fn fcontrol(&self, handle: Handle, code: u32, buf: &mut [u8]) -> Result<usize> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.fcontrol(handle, code, buf),
            RoutedTo::Lower => self.lower.fcontrol(handle, code, buf),
        }
    }

    fn fgetextents(&self, handle: Handle, out: &mut Vec<Extent>) -> Result<usize> {
        match self.route_file(handle) {
            RoutedTo::Upper => self.upper.fgetextents(handle, out),
            RoutedTo::Lower => self.lower.fgetextents(handle, out),
        }
    }

    fn set_volume(&self, index: u8, fs: alloc::sync::Arc<dyn FileSystem + Send + Sync>) -> Result<()> {
        self.lower.set_volume(index, fs)
    }

    fn owns_handle(&self, handle: Handle) -> bool {
        self.upper.owns_handle(handle) || self.lower.owns_handle(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::MemFs;
    use crate::object::{ObjectType, END_MARKER, START_MARKER};
    use crate::partition::MemoryPartition;

    /// Builds a single-file FWFS image: root "/" containing file
    /// `name` with `content` inline as one Data8 child.
    fn build_single_file_image(name: &[u8], content: &[u8], read_only: bool) -> MemoryPartition {
        let mut data = alloc::vec![0u8; 4];
        data[..4].copy_from_slice(&START_MARKER.to_le_bytes());

        let file_offset = data.len() as u64;
        data.push(ObjectType::File.code());
        let content_start = data.len() + 2;
        let attr_record_len = if read_only { 1 + 1 + 1 } else { 0 };
        let data_record_len = 1 + 1 + content.len();
        let file_content_len = 1 + 4 + name.len() + attr_record_len + data_record_len;
        data.extend_from_slice(&(file_content_len as u16).to_le_bytes());
        data.push(name.len() as u8);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(name);
        if read_only {
            data.push(ObjectType::ObjAttr.code());
            data.push(1);
            data.push(FileAttributes::READ_ONLY.bits());
        }
        data.push(ObjectType::Data8.code());
        data.push(content.len() as u8);
        data.extend_from_slice(content);
        assert_eq!(data.len(), content_start + file_content_len);

        let root_offset = data.len() as u64;
        data.push(ObjectType::Directory.code());
        let root_content_start = data.len() + 2;
        let fileref_len = 1 + 1 + 1;
        let root_content_len = 1 + 4 + fileref_len;
        data.extend_from_slice(&(root_content_len as u16).to_le_bytes());
        data.push(0u8);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(0x80 | ObjectType::File.code());
        data.push(1);
        assert!(file_offset <= 255);
        data.push(file_offset as u8);
        assert_eq!(data.len(), root_content_start + root_content_len);

        data.push(ObjectType::Volume.code());
        let vol_name = b"vol";
        let id32_len = 1 + 1 + 4;
        let dirref_len = 1 + 1 + 1;
        let vol_content_len = 1 + 4 + vol_name.len() + id32_len + dirref_len;
        data.extend_from_slice(&(vol_content_len as u16).to_le_bytes());
        data.push(vol_name.len() as u8);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(vol_name);
        data.push(ObjectType::Id32.code());
        data.push(4);
        data.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        data.push(0x80 | ObjectType::Directory.code());
        data.push(1);
        assert!(root_offset <= 255);
        data.push(root_offset as u8);

        data.push(ObjectType::End.code());
        data.push(4);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&END_MARKER.to_le_bytes());

        MemoryPartition::new(data, 4096)
    }

    fn mounted_hyfs(image: MemoryPartition) -> Hyfs<crate::fwfs::Fwfs<MemoryPartition>, MemFs> {
        let lower = crate::fwfs::Fwfs::new(image);
        let upper = MemFs::new();
        let hyfs = Hyfs::new(lower, upper);
        hyfs.mount().unwrap();
        hyfs
    }

    #[test]
    fn read_falls_back_to_lower_when_upper_is_empty() {
        let hyfs = mounted_hyfs(build_single_file_image(b"readme.md", b"hello", false));
        let h = hyfs.open("readme.md", OpenFlags::READ).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(hyfs.read(h, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_promotes_lower_only_file() {
        let hyfs = mounted_hyfs(build_single_file_image(b"readme.md", b"hello", false));
        let h = hyfs.open("readme.md", OpenFlags::WRITE | OpenFlags::APPEND).unwrap();
        hyfs.write(h, b"more\n").unwrap();
        hyfs.close(h).unwrap();

        let h2 = hyfs.open("readme.md", OpenFlags::READ).unwrap();
        let mut buf = [0u8; 32];
        let n = hyfs.read(h2, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hellomore\n");
    }

    #[test]
    fn write_to_read_only_lower_file_fails() {
        let hyfs = mounted_hyfs(build_single_file_image(b"locked.cfg", b"x", true));
        assert_eq!(hyfs.open("locked.cfg", OpenFlags::WRITE).err(), Some(Error::ReadOnly));
        assert_eq!(hyfs.remove("locked.cfg").err(), Some(Error::ReadOnly));
    }

    #[test]
    fn remove_hides_lower_only_entry() {
        let hyfs = mounted_hyfs(build_single_file_image(b"readme.md", b"hello", false));
        hyfs.remove("readme.md").unwrap();
        assert_eq!(hyfs.stat("readme.md").err(), Some(Error::NotFound));

        let dh = hyfs.opendir("").unwrap();
        let mut seen_readme = false;
        loop {
            match hyfs.readdir(dh) {
                Ok(entry) => seen_readme |= entry.name == "readme.md",
                Err(Error::NoMoreFiles) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(!seen_readme);
    }
}
