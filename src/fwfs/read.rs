// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pure, partition-level helpers for the FWFS reader (C3): mounting,
//! path resolution, child-table iteration and attribute derivation
//! (§4.3). Nothing in this module owns a handle or a descriptor table —
//! that bookkeeping lives in `fwfs::mod` and `fwfs::handle`.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::attribute::{Acl, AttributeTag, Compression, CompressionType, FileAttributes, UserRole};
use crate::error::{Error, Result};
use crate::object::{self, NamedInfo, ObjectHeader, ObjectType, END_MARKER, START_MARKER};
use crate::partition::Partition;

/// Everything `mount` (§4.3 "Mount") needs cached for the lifetime of
/// the filesystem.
pub(crate) struct MountInfo {
    pub root_offset: u64,
    pub volume_id: u32,
    pub volume_name: String,
    pub root_acl: Acl,
    pub root_mtime: u32,
}

fn read_u32_at(partition: &dyn Partition, offset: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    partition.read(offset, &mut buf).map_err(|_| Error::ReadFailure)?;
    Ok(u32::from_le_bytes(buf))
}

/// Implements §4.3 "Mount": walks every record between the start and
/// end markers, requires exactly one `Volume` whose child table
/// references the last `Directory` seen, and captures the root ACL.
pub(crate) fn mount(partition: &dyn Partition) -> Result<MountInfo> {
    if read_u32_at(partition, 0)? != START_MARKER {
        return Err(Error::BadFileSystem);
    }
    let mut pos = 4u64;
    let mut last_volume: Option<ObjectHeader> = None;
    let mut last_directory: Option<ObjectHeader> = None;
    let end_header = loop {
        let header = object::read_header(partition, pos).map_err(|_| Error::BadFileSystem)?;
        if !header.is_reference {
            match header.object_type {
                ObjectType::End => break header,
                ObjectType::Volume => last_volume = Some(header),
                ObjectType::Directory => last_directory = Some(header),
                _ => {}
            }
        }
        pos = header.end_offset();
    };

    if read_u32_at(partition, end_header.end_offset())? != END_MARKER {
        return Err(Error::BadFileSystem);
    }

    let volume = last_volume.ok_or(Error::BadFileSystem)?;
    let root = last_directory.ok_or(Error::BadFileSystem)?;

    let volume_info = object::read_named_info(partition, &volume).map_err(|_| Error::BadFileSystem)?;
    let mut name_buf = [0u8; 255];
    let name_len = volume_info.name_len as usize;
    object::read_name(partition, &volume_info, &mut name_buf[..name_len])
        .map_err(|_| Error::BadFileSystem)?;
    let volume_name = String::from_utf8_lossy(&name_buf[..name_len]).to_string();

    let mut volume_id = 0u32;
    let mut root_ref_ok = false;
    for child in ChildIter::new(partition, volume_info.child_table_offset, volume.end_offset()) {
        let child = child.map_err(|_| Error::BadFileSystem)?;
        if child.object_type == ObjectType::Id32 {
            let resolved = object::resolve_reference(partition, &child).map_err(|_| Error::BadFileSystem)?;
            volume_id = read_u32_at(partition, resolved.content_offset).map_err(|_| Error::BadFileSystem)?;
        } else if child.object_type == ObjectType::Directory {
            let resolved = object::resolve_reference(partition, &child).map_err(|_| Error::BadFileSystem)?;
            if resolved.id == root.id {
                root_ref_ok = true;
            }
        }
    }
    if !root_ref_ok {
        return Err(Error::BadFileSystem);
    }

    let root_acl = read_acl(partition, &root, Acl::default())?;
    let root_info = named_info(partition, &root).map_err(|_| Error::BadFileSystem)?;

    Ok(MountInfo {
        root_offset: root.id,
        volume_id,
        volume_name,
        root_acl,
        root_mtime: root_info.mtime,
    })
}

/// Iterates the whole-object entries of a child table, yielding each
/// entry's own header (a reference's header, not its resolved
/// referent — callers decide whether to resolve). Non-named records
/// (attributes, data, references to them) are yielded too; directory
/// enumeration filters those out itself (§4.3 "Child enumeration").
pub(crate) struct ChildIter<'a> {
    partition: &'a dyn Partition,
    pos: u64,
    end: u64,
}

impl<'a> ChildIter<'a> {
    pub(crate) fn new(partition: &'a dyn Partition, table_offset: u64, table_end: u64) -> Self {
        ChildIter { partition, pos: table_offset, end: table_end }
    }
}

impl Iterator for ChildIter<'_> {
    type Item = Result<ObjectHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        match object::read_header(self.partition, self.pos) {
            Ok(header) => {
                self.pos = header.end_offset();
                Some(Ok(header))
            }
            Err(e) => {
                self.pos = self.end;
                Some(Err(e))
            }
        }
    }
}

fn named_info(partition: &dyn Partition, header: &ObjectHeader) -> Result<NamedInfo> {
    object::read_named_info(partition, header)
}

fn child_iter<'a>(partition: &'a dyn Partition, header: &ObjectHeader, info: &NamedInfo) -> ChildIter<'a> {
    ChildIter::new(partition, info.child_table_offset, header.end_offset())
}

/// The outcome of resolving a path (§4.3 "Path resolution"): either a
/// local object, or a hand-off to a filesystem installed at a
/// mountpoint slot with the residual path still to resolve there.
pub(crate) enum Resolved {
    Object(ObjectHeader),
    Mount { slot: u8, residual: String },
}

/// Resolves `path` starting from `root_offset` (§4.3). First match
/// wins per segment; a `MountPoint` is followed unless `no_follow` is
/// set and it is the path's last segment.
pub(crate) fn resolve_path(
    partition: &dyn Partition,
    root_offset: u64,
    path: &str,
    no_follow: bool,
) -> Result<Resolved> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut current = object::read_header(partition, root_offset)?;
    if current.object_type != ObjectType::Directory {
        return Err(Error::BadFileSystem);
    }

    let mut i = 0;
    while i < segments.len() {
        let seg = segments[i].as_bytes();
        let info = named_info(partition, &current)?;
        let mut found = None;
        for child in child_iter(partition, &current, &info) {
            let child = child?;
            if !child.object_type.is_named() {
                continue;
            }
            let resolved = object::resolve_reference(partition, &child)?;
            let rinfo = named_info(partition, &resolved)?;
            let name_len = rinfo.name_len as usize;
            if name_len != seg.len() {
                continue;
            }
            let mut name_buf = [0u8; 255];
            object::read_name(partition, &rinfo, &mut name_buf[..name_len])?;
            if &name_buf[..name_len] == seg {
                found = Some(resolved);
                break;
            }
        }
        let child = found.ok_or(Error::NotFound)?;
        let is_last = i + 1 == segments.len();

        if child.object_type == ObjectType::MountPoint {
            let slot = read_volume_index(partition, &child)?;
            if !is_last || !no_follow {
                let residual = segments[i + 1..].join("/");
                return Ok(Resolved::Mount { slot, residual });
            }
            current = child;
            i += 1;
            continue;
        }

        current = child;
        i += 1;
    }

    Ok(Resolved::Object(current))
}

fn read_volume_index(partition: &dyn Partition, mountpoint: &ObjectHeader) -> Result<u8> {
    let info = named_info(partition, mountpoint)?;
    for child in child_iter(partition, mountpoint, &info) {
        let child = child?;
        let resolved = object::resolve_reference(partition, &child)?;
        if resolved.object_type == ObjectType::VolumeIndex {
            let mut buf = [0u8; 1];
            partition.read(resolved.content_offset, &mut buf).map_err(|_| Error::ReadFailure)?;
            return Ok(buf[0]);
        }
    }
    Err(Error::BadFileSystem)
}

/// Reads a one-byte `ReadACE`/`WriteACE` payload into a [`UserRole`].
fn read_role(partition: &dyn Partition, header: &ObjectHeader) -> Result<UserRole> {
    let mut buf = [0u8; 1];
    partition.read(header.content_offset, &mut buf).map_err(|_| Error::ReadFailure)?;
    UserRole::from_u8(buf[0]).ok_or(Error::BadObject)
}

/// Derives `acl` for `header` per §4.3: ACEs present on the object
/// itself take priority; absent ones inherit `default_acl` (the root
/// directory's ACL, captured once at mount time).
fn read_acl(partition: &dyn Partition, header: &ObjectHeader, default_acl: Acl) -> Result<Acl> {
    let info = named_info(partition, header)?;
    let mut acl = default_acl;
    for child in child_iter(partition, header, &info) {
        let child = child?;
        let resolved = object::resolve_reference(partition, &child)?;
        match resolved.object_type {
            ObjectType::ReadAce => acl.read_role = read_role(partition, &resolved)?,
            ObjectType::WriteAce => acl.write_role = read_role(partition, &resolved)?,
            _ => {}
        }
    }
    Ok(acl)
}

/// Full `Stat` derivation for a named object (§4.3 "Attribute
/// derivation for `stat`"). `root_acl` supplies the inherited default
/// when an object carries no ACE of its own.
pub(crate) fn stat_of(
    partition: &dyn Partition,
    header: &ObjectHeader,
    root_acl: Acl,
) -> Result<crate::capability::Stat> {
    let info = named_info(partition, header)?;
    let name_len = info.name_len as usize;
    let mut name_buf = [0u8; 255];
    object::read_name(partition, &info, &mut name_buf[..name_len])?;
    let name = String::from_utf8_lossy(&name_buf[..name_len]).to_string();

    let mut attr = FileAttributes::empty();
    let mut compression = Compression::default();
    let mut acl = root_acl;
    let mut read_ace_seen = false;
    let mut write_ace_seen = false;
    let mut size = 0u64;

    match header.object_type {
        ObjectType::Directory => attr.insert(FileAttributes::DIRECTORY),
        ObjectType::MountPoint => attr.insert(FileAttributes::DIRECTORY | FileAttributes::MOUNT_POINT),
        ObjectType::Volume => attr.insert(FileAttributes::DIRECTORY),
        _ => {}
    }

    for child in child_iter(partition, header, &info) {
        let child = child?;
        let resolved = object::resolve_reference(partition, &child)?;
        match resolved.object_type {
            ObjectType::ObjAttr => {
                let mut buf = [0u8; 1];
                partition.read(resolved.content_offset, &mut buf).map_err(|_| Error::ReadFailure)?;
                attr |= FileAttributes::from_bits_truncate(buf[0]);
            }
            ObjectType::Compression => {
                let mut buf = [0u8; 5];
                partition.read(resolved.content_offset, &mut buf).map_err(|_| Error::ReadFailure)?;
                let kind = CompressionType::from_u8(buf[0])?;
                let original_size = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
                if kind != CompressionType::None {
                    attr.insert(FileAttributes::COMPRESSED);
                }
                compression = Compression { kind, original_size };
            }
            ObjectType::ReadAce => {
                acl.read_role = read_role(partition, &resolved)?;
                read_ace_seen = true;
            }
            ObjectType::WriteAce => {
                acl.write_role = read_role(partition, &resolved)?;
                write_ace_seen = true;
            }
            t if t.is_data() => size += resolved.content_size as u64,
            _ => {}
        }
    }
    let _ = (read_ace_seen, write_ace_seen); // inheritance already applied via `root_acl` seed

    Ok(crate::capability::Stat { name, size, id: header.id, mtime: info.mtime, attr, acl, compression })
}

/// Collects a `File` object's data children, in declaration order,
/// resolving references (§4.3 "File size and data read").
pub(crate) fn data_children(partition: &dyn Partition, header: &ObjectHeader) -> Result<Vec<ObjectHeader>> {
    let info = named_info(partition, header)?;
    let mut out = Vec::new();
    for child in child_iter(partition, header, &info) {
        let child = child?;
        let resolved = object::resolve_reference(partition, &child)?;
        if resolved.object_type.is_data() {
            out.push(resolved);
        }
    }
    Ok(out)
}

/// Total size of a `File` object: the sum of its data children's
/// content sizes (§4.3).
pub(crate) fn file_size(partition: &dyn Partition, header: &ObjectHeader) -> Result<u64> {
    Ok(data_children(partition, header)?.iter().map(|h| h.content_size as u64).sum())
}

/// Finds the `Md5Hash` child of a `File` object, if present (§4.3,
/// `fcontrol` `GET_MD5_HASH`).
pub(crate) fn find_md5(partition: &dyn Partition, header: &ObjectHeader) -> Result<[u8; 16]> {
    let info = named_info(partition, header)?;
    for child in child_iter(partition, header, &info) {
        let child = child?;
        let resolved = object::resolve_reference(partition, &child)?;
        if resolved.object_type == ObjectType::Md5Hash {
            let mut buf = [0u8; 16];
            partition.read(resolved.content_offset, &mut buf).map_err(|_| Error::ReadFailure)?;
            return Ok(buf);
        }
    }
    Err(Error::NotFound)
}

/// Reads a single xattr (§4.1 `getxattr`/`fgetxattr`) out of a named
/// object's children (or, for `ModifiedTime`, the named-object prefix
/// itself) into `buf`. Returns the number of bytes written.
pub(crate) fn get_xattr(
    partition: &dyn Partition,
    header: &ObjectHeader,
    tag: AttributeTag,
    buf: &mut [u8],
) -> Result<usize> {
    let info = named_info(partition, header)?;

    fn copy(partition: &dyn Partition, offset: u64, len: usize, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < len {
            return Err(Error::BufferTooSmall);
        }
        partition.read(offset, &mut buf[..len]).map_err(|_| Error::ReadFailure)?;
        Ok(len)
    }

    match tag {
        AttributeTag::ModifiedTime => {
            if buf.len() < 4 {
                return Err(Error::BufferTooSmall);
            }
            buf[..4].copy_from_slice(&info.mtime.to_le_bytes());
            Ok(4)
        }
        AttributeTag::FileAttributes => {
            for child in child_iter(partition, header, &info) {
                let child = child?;
                let resolved = object::resolve_reference(partition, &child)?;
                if resolved.object_type == ObjectType::ObjAttr {
                    return copy(partition, resolved.content_offset, 1, buf);
                }
            }
            Err(Error::NotFound)
        }
        AttributeTag::Acl => {
            let mut read_role = 0u8;
            let mut write_role = 0u8;
            let mut found = false;
            for child in child_iter(partition, header, &info) {
                let child = child?;
                let resolved = object::resolve_reference(partition, &child)?;
                match resolved.object_type {
                    ObjectType::ReadAce => {
                        partition
                            .read(resolved.content_offset, core::slice::from_mut(&mut read_role))
                            .map_err(|_| Error::ReadFailure)?;
                        found = true;
                    }
                    ObjectType::WriteAce => {
                        partition
                            .read(resolved.content_offset, core::slice::from_mut(&mut write_role))
                            .map_err(|_| Error::ReadFailure)?;
                        found = true;
                    }
                    _ => {}
                }
            }
            if !found {
                return Err(Error::NotFound);
            }
            if buf.len() < 2 {
                return Err(Error::BufferTooSmall);
            }
            buf[0] = read_role;
            buf[1] = write_role;
            Ok(2)
        }
        AttributeTag::Compression => {
            for child in child_iter(partition, header, &info) {
                let child = child?;
                let resolved = object::resolve_reference(partition, &child)?;
                if resolved.object_type == ObjectType::Compression {
                    return copy(partition, resolved.content_offset, 5, buf);
                }
            }
            Err(Error::NotFound)
        }
        AttributeTag::ReadAce => {
            for child in child_iter(partition, header, &info) {
                let child = child?;
                let resolved = object::resolve_reference(partition, &child)?;
                if resolved.object_type == ObjectType::ReadAce {
                    return copy(partition, resolved.content_offset, 1, buf);
                }
            }
            Err(Error::NotFound)
        }
        AttributeTag::WriteAce => {
            for child in child_iter(partition, header, &info) {
                let child = child?;
                let resolved = object::resolve_reference(partition, &child)?;
                if resolved.object_type == ObjectType::WriteAce {
                    return copy(partition, resolved.content_offset, 1, buf);
                }
            }
            Err(Error::NotFound)
        }
        AttributeTag::VolumeIndex => {
            for child in child_iter(partition, header, &info) {
                let child = child?;
                let resolved = object::resolve_reference(partition, &child)?;
                if resolved.object_type == ObjectType::VolumeIndex {
                    return copy(partition, resolved.content_offset, 1, buf);
                }
            }
            Err(Error::NotFound)
        }
        AttributeTag::Md5Hash => {
            let hash = find_md5(partition, header)?;
            if buf.len() < 16 {
                return Err(Error::BufferTooSmall);
            }
            buf[..16].copy_from_slice(&hash);
            Ok(16)
        }
        AttributeTag::Comment | AttributeTag::User(_) => {
            let wanted = tag.tag_value();
            for child in child_iter(partition, header, &info) {
                let child = child?;
                let resolved = object::resolve_reference(partition, &child)?;
                if resolved.object_type != ObjectType::UserAttribute {
                    continue;
                }
                let mut tag_byte = [0u8; 1];
                partition
                    .read(resolved.content_offset, &mut tag_byte)
                    .map_err(|_| Error::ReadFailure)?;
                if tag_byte[0] != wanted {
                    continue;
                }
                let len = resolved.content_size as usize - 1;
                return copy(partition, resolved.content_offset + 1, len, buf);
            }
            Err(Error::NotFound)
        }
    }
}

/// Enumerates every attribute tag set on a named object (§4.1
/// `fenumxattr`): used by HYFS promotion and `ArchiveStream` to copy
/// "whatever is set" without a fixed tag list.
pub(crate) fn enum_xattrs(partition: &dyn Partition, header: &ObjectHeader) -> Result<Vec<AttributeTag>> {
    let info = named_info(partition, header)?;
    let mut tags = alloc::vec![AttributeTag::ModifiedTime];
    for child in child_iter(partition, header, &info) {
        let child = child?;
        let resolved = object::resolve_reference(partition, &child)?;
        match resolved.object_type {
            ObjectType::ObjAttr => tags.push(AttributeTag::FileAttributes),
            ObjectType::Compression => tags.push(AttributeTag::Compression),
            ObjectType::ReadAce => tags.push(AttributeTag::ReadAce),
            ObjectType::WriteAce => tags.push(AttributeTag::WriteAce),
            ObjectType::VolumeIndex => tags.push(AttributeTag::VolumeIndex),
            ObjectType::Md5Hash => tags.push(AttributeTag::Md5Hash),
            ObjectType::UserAttribute => {
                let mut tag_byte = [0u8; 1];
                partition
                    .read(resolved.content_offset, &mut tag_byte)
                    .map_err(|_| Error::ReadFailure)?;
                tags.push(AttributeTag::from_tag_value(tag_byte[0]));
            }
            _ => {}
        }
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::UserRole;
    use crate::partition::MemoryPartition;

    /// Hand-builds the minimal image from §8 scenario E1 (without the
    /// data content, just the graph shape) to exercise `mount` and
    /// `resolve_path` without going through `ArchiveStream`.
    fn build_minimal_image() -> MemoryPartition {
        let mut data = alloc::vec![0u8; 4];
        data[..4].copy_from_slice(&START_MARKER.to_le_bytes());

        // Directory "/" (root), empty child table, at offset 4.
        let root_offset = data.len() as u64;
        data.push(ObjectType::Directory.code());
        let content_start = data.len() + 2;
        let name = b"";
        let child_table_len = 0usize;
        let content_len = 1 + 4 + name.len() + child_table_len;
        data.extend_from_slice(&(content_len as u16).to_le_bytes());
        data.push(name.len() as u8);
        data.extend_from_slice(&0u32.to_le_bytes()); // mtime
        data.extend_from_slice(name);
        assert_eq!(data.len(), content_start + content_len);

        // Volume "vol" with ID32 child + Directory reference to root.
        data.push(ObjectType::Volume.code());
        let vol_name = b"vol";
        let id32_record_len = 1 + 1 + 4; // tag + size + 4 bytes
        let dirref_record_len = 1 + 1 + 1; // tag(ref) + size(1) + 1-byte offset payload
        let vol_content_len = 1 + 4 + vol_name.len() + id32_record_len + dirref_record_len;
        data.extend_from_slice(&(vol_content_len as u16).to_le_bytes());
        data.push(vol_name.len() as u8);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(vol_name);
        // ID32 child.
        data.push(ObjectType::Id32.code());
        data.push(4);
        data.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        // Directory reference child.
        data.push(0x80 | ObjectType::Directory.code());
        data.push(1);
        assert!(root_offset <= 255);
        data.push(root_offset as u8);

        // End + END_MARKER.
        data.push(ObjectType::End.code());
        data.push(4);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&END_MARKER.to_le_bytes());

        MemoryPartition::new(data, 4096)
    }

    #[test]
    fn mount_finds_volume_and_root() {
        let p = build_minimal_image();
        let info = mount(&p).unwrap();
        assert_eq!(info.volume_id, 0xdead_beef);
        assert_eq!(info.volume_name, "vol");
    }

    #[test]
    fn resolve_path_empty_is_root() {
        let p = build_minimal_image();
        let info = mount(&p).unwrap();
        match resolve_path(&p, info.root_offset, "", false).unwrap() {
            Resolved::Object(h) => assert_eq!(h.object_type, ObjectType::Directory),
            Resolved::Mount { .. } => panic!("expected object"),
        }
    }

    #[test]
    fn resolve_path_missing_segment_not_found() {
        let p = build_minimal_image();
        let info = mount(&p).unwrap();
        assert_eq!(
            resolve_path(&p, info.root_offset, "nope", false).err(),
            Some(Error::NotFound)
        );
    }

    #[test]
    fn acl_inherits_root_default_when_absent() {
        let p = build_minimal_image();
        let info = mount(&p).unwrap();
        let root = object::read_header(&p, info.root_offset).unwrap();
        let acl = read_acl(&p, &root, Acl { read_role: UserRole::Guest, write_role: UserRole::Admin }).unwrap();
        assert_eq!(acl.read_role, UserRole::Guest);
        assert_eq!(acl.write_role, UserRole::Admin);
    }
}
