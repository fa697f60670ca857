// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The FWFS on-wire object model (C2, §3.2-§3.3): the type tag, the
//! three size classes, and reference resolution. This module knows how
//! to read a single record header off a [`Partition`]; it knows
//! nothing about paths, directories or files — that's `fwfs::read`.

extern crate alloc;

use bitstruct::bitstruct;

use crate::error::{Error, Result};
use crate::partition::Partition;

pub const START_MARKER: u32 = 0x5346_5746; // "FWFS", little-endian on disk
pub const END_MARKER: u32 = 0x4657_4653; // "SFWF", little-endian on disk

/// Object type codes (§3.2). The discriminant is the wire value, bits
/// 0-6 of the tag byte.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectType {
    End = 0,
    Data8 = 1,
    Id32 = 2,
    ObjAttr = 3,
    Compression = 4,
    ReadAce = 5,
    WriteAce = 6,
    VolumeIndex = 7,
    Md5Hash = 8,
    UserAttribute = 9,
    Data16 = 32,
    Volume = 33,
    MountPoint = 34,
    Directory = 35,
    File = 36,
    Data24 = 64,
}

impl ObjectType {
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::End,
            1 => Self::Data8,
            2 => Self::Id32,
            3 => Self::ObjAttr,
            4 => Self::Compression,
            5 => Self::ReadAce,
            6 => Self::WriteAce,
            7 => Self::VolumeIndex,
            8 => Self::Md5Hash,
            9 => Self::UserAttribute,
            32 => Self::Data16,
            33 => Self::Volume,
            34 => Self::MountPoint,
            35 => Self::Directory,
            36 => Self::File,
            64 => Self::Data24,
            _ => return Err(Error::BadObject),
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Volume, MountPoint, Directory, File (§3.2, "named objects").
    pub fn is_named(self) -> bool {
        matches!(self, Self::Volume | Self::MountPoint | Self::Directory | Self::File)
    }

    /// Data8, Data16, Data24.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Data8 | Self::Data16 | Self::Data24)
    }

    /// Number of bytes used to encode the content-size field for a
    /// direct (non-reference) record of this type.
    pub(crate) fn size_class_len(self) -> usize {
        match self {
            Self::Data24 => 3,
            Self::Data16 | Self::Volume | Self::MountPoint | Self::Directory | Self::File => 2,
            _ => 1,
        }
    }
}

bitstruct! {
    /// The leading tag byte of every object record: bit 7 marks a
    /// reference, bits 0-6 are the type code (§3.2).
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Tag(u8) {
        pub type_code: u8 = 0..=6;
        pub is_reference: bool = 7;
    }
}

impl Tag {
    pub fn from_byte(byte: u8) -> Tag {
        Tag(byte)
    }

    pub fn to_byte(self) -> u8 {
        self.0
    }

    pub fn new(type_code: u8, is_reference: bool) -> Tag {
        Tag(0).with_type_code(type_code).with_is_reference(is_reference)
    }
}

/// A parsed, but not yet interpreted, object record.
///
/// `id` is the object's identifier (§3.3): its byte offset from the
/// first data byte of the image, i.e. the offset of the tag byte
/// itself, relative to the start of the image content (just past
/// `START_MARKER`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ObjectHeader {
    pub id: u64,
    pub object_type: ObjectType,
    pub is_reference: bool,
    /// Offset of the first content byte, absolute within the image.
    pub content_offset: u64,
    pub content_size: u32,
}

impl ObjectHeader {
    /// Total number of bytes this record occupies in the image,
    /// including the tag and size-class bytes.
    pub fn record_size(&self) -> u64 {
        (self.content_offset - self.id) + self.content_size as u64
    }

    /// Offset of the first byte following this record.
    pub fn end_offset(&self) -> u64 {
        self.content_offset + self.content_size as u64
    }
}

fn read_bytes(partition: &dyn Partition, offset: u64, buf: &mut [u8]) -> Result<()> {
    partition.read(offset, buf).map_err(|_| Error::ReadFailure)
}

fn read_u8(partition: &dyn Partition, offset: u64) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_bytes(partition, offset, &mut buf)?;
    Ok(buf[0])
}

fn read_u32(partition: &dyn Partition, offset: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_bytes(partition, offset, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Reads and parses the record header (tag + content-size field) at
/// `offset` (relative to the image start, i.e. an object id).
pub fn read_header(partition: &dyn Partition, offset: u64) -> Result<ObjectHeader> {
    let tag = Tag::from_byte(read_u8(partition, offset)?);
    let object_type = ObjectType::from_code(tag.type_code())?;
    let is_reference = tag.is_reference();
    let size_len = if is_reference { 1 } else { object_type.size_class_len() };

    let mut size_buf = [0u8; 3];
    read_bytes(partition, offset + 1, &mut size_buf[..size_len])?;
    let content_size = match size_len {
        1 => size_buf[0] as u32,
        2 => u16::from_le_bytes([size_buf[0], size_buf[1]]) as u32,
        3 => u32::from_le_bytes([size_buf[0], size_buf[1], size_buf[2], 0]),
        _ => unreachable!("size class is always 1, 2 or 3 bytes"),
    };

    Ok(ObjectHeader {
        id: offset,
        object_type,
        is_reference,
        content_offset: offset + 1 + size_len as u64,
        content_size,
    })
}

/// Reads the packed offset payload of a reference object and resolves
/// it to the header of its referent, verifying the referent's type tag
/// matches and that it is not itself a reference (no chains, §3.3).
pub fn resolve_reference(
    partition: &dyn Partition,
    header: &ObjectHeader,
) -> Result<ObjectHeader> {
    if !header.is_reference {
        return Ok(*header);
    }
    let len = header.content_size as usize;
    if len == 0 || len > 4 {
        return Err(Error::BadObject);
    }
    let mut buf = [0u8; 4];
    read_bytes(partition, header.content_offset, &mut buf[..len])?;
    let target = u32::from_le_bytes(buf) as u64;

    let referent = read_header(partition, target)?;
    if referent.is_reference || referent.object_type != header.object_type {
        return Err(Error::BadObject);
    }
    Ok(referent)
}

/// Metadata decoded from the content of a named object (Volume,
/// MountPoint, Directory, File — §3.2): name length & bytes,
/// modification time, and the bounds of the child table.
pub struct NamedInfo {
    pub mtime: u32,
    pub name_offset: u64,
    pub name_len: u8,
    pub child_table_offset: u64,
}

/// Parses the named-object prefix (namelen, mtime) that precedes the
/// name and child table of Volume/MountPoint/Directory/File records.
pub fn read_named_info(partition: &dyn Partition, header: &ObjectHeader) -> Result<NamedInfo> {
    if !header.object_type.is_named() {
        return Err(Error::BadObject);
    }
    let name_len = read_u8(partition, header.content_offset)?;
    let mtime = read_u32(partition, header.content_offset + 1)?;
    let name_offset = header.content_offset + 5;
    let child_table_offset = name_offset + name_len as u64;
    if child_table_offset > header.end_offset() {
        return Err(Error::BadObject);
    }
    Ok(NamedInfo { mtime, name_offset, name_len, child_table_offset })
}

pub fn read_name(
    partition: &dyn Partition,
    info: &NamedInfo,
    buf: &mut [u8],
) -> Result<()> {
    if buf.len() != info.name_len as usize {
        return Err(Error::BadParam);
    }
    read_bytes(partition, info.name_offset, buf)
}

static_assertions::const_assert_eq!(core::mem::size_of::<Tag>(), 1);
