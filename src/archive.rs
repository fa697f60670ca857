// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `ArchiveStream` (C6, §4.5): walks a mounted [`FileSystem`] and emits a
//! new FWFS image byte-for-byte compatible with `fwfs::read`.
//!
//! Objects are written in post-order: every child is fully appended to
//! the output before the directory or file record that references it,
//! so every reference in the image is a backward offset. Nesting depth
//! is bounded the same way `fwfs::read` bounds its own recursion — a
//! plain counter standing in for an explicit frame stack, since each
//! recursive call already holds exactly the "growable content buffer"
//! a directory frame needs.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::warn;

use crate::attribute::{AttributeTag, Compression, CompressionType};
use crate::capability::{FileSystem, Handle, OpenFlags, Stat};
use crate::error::{Error, Result};
use crate::object::{ObjectType, Tag, END_MARKER, START_MARKER};
use crate::partition::Partition;

/// Nested directories deeper than this fail `NameTooLong` (§9 "cap
/// nesting at 16 levels").
const MAX_DIR_DEPTH: usize = 16;

/// File content at or below this size is embedded directly in the
/// file's own record rather than written as a standalone, referenced
/// data object (§4.5 "small un-encoded files").
const INLINE_THRESHOLD: usize = 255;

/// What happens to bytes already appended when building the image fails
/// partway through (§9 Open Question: truncate vs. keep partial output).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OnError {
    /// Discard everything written so far. The default.
    Truncate,
    /// Keep whatever was appended before the failure.
    KeepPartial,
}

impl Default for OnError {
    fn default() -> Self {
        OnError::Truncate
    }
}

/// Output of [`IBlockEncoder::encode`]: the blocks to write in place of
/// the raw file content, and the compression attribute to stamp on the
/// owning file.
pub struct EncodedFile {
    pub blocks: Vec<Vec<u8>>,
    pub compression: Compression,
}

/// A pluggable per-file content transform (§4.5.1). An encoder that
/// does not want to touch a given file returns it unchanged with
/// `Compression::default()`.
pub trait IBlockEncoder {
    fn encode(&mut self, content: &[u8]) -> Result<EncodedFile>;
}

/// Copies file content through unchanged.
#[derive(Default)]
pub struct IdentityEncoder;

impl IBlockEncoder for IdentityEncoder {
    fn encode(&mut self, content: &[u8]) -> Result<EncodedFile> {
        Ok(EncodedFile { blocks: alloc::vec![content.to_vec()], compression: Compression::default() })
    }
}

/// Deflates with `miniz_oxide`, keeping the compressed form only when
/// it actually comes out smaller than the original (§4.5.1).
pub struct DeflateEncoder {
    pub level: u8,
}

impl Default for DeflateEncoder {
    fn default() -> Self {
        DeflateEncoder { level: 6 }
    }
}

impl IBlockEncoder for DeflateEncoder {
    fn encode(&mut self, content: &[u8]) -> Result<EncodedFile> {
        let compressed = miniz_oxide::deflate::compress_to_vec(content, self.level);
        if compressed.len() < content.len() {
            Ok(EncodedFile {
                blocks: alloc::vec![compressed],
                compression: Compression { kind: CompressionType::GZip, original_size: content.len() as u32 },
            })
        } else {
            Ok(EncodedFile { blocks: alloc::vec![content.to_vec()], compression: Compression::default() })
        }
    }
}

/// Configuration for a single [`ArchiveStream::write`] pass.
pub struct ArchiveOptions {
    pub volume_id: u32,
    pub volume_name: String,
    /// Descend into mountpoints and emit their contents inline instead
    /// of an opaque `MountPoint` record (§4.5 "Filtering and
    /// mountpoints").
    pub include_mount_points: bool,
    pub on_error: OnError,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            volume_id: 0,
            volume_name: String::new(),
            include_mount_points: false,
            on_error: OnError::default(),
        }
    }
}

/// Builds an FWFS image in memory from a mounted source filesystem.
pub struct ArchiveStream {
    options: ArchiveOptions,
    buf: Vec<u8>,
    depth: usize,
}

impl ArchiveStream {
    pub fn new(options: ArchiveOptions) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(&START_MARKER.to_le_bytes());
        ArchiveStream { options, buf, depth: 0 }
    }

    /// Walks `source` from its root and appends every object to the
    /// image, followed by the volume record and the end marker.
    /// `filter` drops an entry (and everything under it, if a
    /// directory) when it returns `false`; `encoder` transforms every
    /// file's content before it is written.
    pub fn write(
        &mut self,
        source: &dyn FileSystem,
        mut encoder: Option<&mut dyn IBlockEncoder>,
        filter: Option<&dyn Fn(&Stat) -> bool>,
    ) -> Result<()> {
        let result = self
            .emit_directory(source, "", filter, &mut encoder)
            .and_then(|root_offset| self.emit_volume(root_offset))
            .and_then(|()| self.emit_end());
        if result.is_err() && self.options.on_error == OnError::Truncate {
            self.buf.clear();
        }
        result
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Convenience one-shot build with no filter and no content encoder.
    pub fn build(source: &dyn FileSystem, options: ArchiveOptions) -> Result<Vec<u8>> {
        let mut stream = ArchiveStream::new(options);
        stream.write(source, None, None)?;
        Ok(stream.into_bytes())
    }

    fn emit_directory(
        &mut self,
        source: &dyn FileSystem,
        path: &str,
        filter: Option<&dyn Fn(&Stat) -> bool>,
        encoder: &mut Option<&mut dyn IBlockEncoder>,
    ) -> Result<u64> {
        if self.depth >= MAX_DIR_DEPTH {
            return Err(Error::NameTooLong);
        }
        self.depth += 1;

        let dh = source.opendir(path)?;
        let mut child_table = Vec::new();
        loop {
            let entry = match source.readdir(dh) {
                Ok(entry) => entry,
                Err(Error::NoMoreFiles) => break,
                Err(e) => {
                    let _ = source.closedir(dh);
                    self.depth -= 1;
                    return Err(e);
                }
            };
            if let Some(f) = filter {
                if !f(&entry.stat) {
                    continue;
                }
            }
            let child_path = join(path, &entry.name);
            let emitted = if entry.stat.is_mount_point() {
                if self.options.include_mount_points {
                    self.emit_directory(source, &child_path, filter, encoder)
                        .map(|off| (ObjectType::Directory, off))
                } else {
                    self.emit_opaque_mountpoint(&entry.name, entry.stat.mtime)
                        .map(|off| (ObjectType::MountPoint, off))
                }
            } else if entry.stat.is_dir() {
                self.emit_directory(source, &child_path, filter, encoder).map(|off| (ObjectType::Directory, off))
            } else {
                self.emit_file(source, &child_path, &entry.stat, encoder).map(|off| (ObjectType::File, off))
            };
            match emitted {
                Ok((object_type, offset)) => push_reference_into(&mut child_table, object_type, offset)?,
                Err(e) => {
                    let _ = source.closedir(dh);
                    self.depth -= 1;
                    return Err(e);
                }
            }
        }
        source.closedir(dh)?;

        let content = named_content(&name_of(path), 0, &child_table)?;
        self.depth -= 1;
        self.push_record(ObjectType::Directory, &content)
    }

    fn emit_opaque_mountpoint(&mut self, name: &str, mtime: u32) -> Result<u64> {
        let mut child_table = Vec::new();
        write_object_into(&mut child_table, ObjectType::VolumeIndex, false, &[0])?;
        let content = named_content(name, mtime, &child_table)?;
        self.push_record(ObjectType::MountPoint, &content)
    }

    fn emit_file(
        &mut self,
        source: &dyn FileSystem,
        path: &str,
        stat: &Stat,
        encoder: &mut Option<&mut dyn IBlockEncoder>,
    ) -> Result<u64> {
        let handle = source.open(path, OpenFlags::READ)?;
        let content = match read_all(source, handle) {
            Ok(c) => c,
            Err(e) => {
                let _ = source.close(handle);
                return Err(e);
            }
        };

        let mut child_table = Vec::new();
        if let Ok(tags) = source.fenumxattr(handle) {
            let mut buf = [0u8; 256];
            for tag in tags {
                if matches!(tag, AttributeTag::ModifiedTime | AttributeTag::Compression) {
                    continue;
                }
                match source.fgetxattr(handle, tag, &mut buf) {
                    Ok(n) => {
                        if let Err(e) = write_attribute(&mut child_table, tag, &buf[..n]) {
                            warn!("archive: skipping attribute {tag:?} on {path}: {e}");
                        }
                    }
                    Err(e) => warn!("archive: could not read attribute {tag:?} on {path}: {e}"),
                }
            }
        }

        let encoded = match encoder {
            Some(enc) => match enc.encode(&content) {
                Ok(e) => e,
                Err(e) => {
                    let _ = source.close(handle);
                    return Err(e);
                }
            },
            None => EncodedFile { blocks: alloc::vec![content.clone()], compression: Compression::default() },
        };

        if encoded.compression.kind != CompressionType::None {
            let mut buf = [0u8; 5];
            buf[0] = encoded.compression.kind as u8;
            buf[1..5].copy_from_slice(&encoded.compression.original_size.to_le_bytes());
            write_object_into(&mut child_table, ObjectType::Compression, false, &buf)?;
        }

        let write_result = if encoder.is_none() && content.len() <= INLINE_THRESHOLD {
            if content.is_empty() { Ok(()) } else { write_object_into(&mut child_table, ObjectType::Data8, false, &content) }
        } else {
            (|| {
                for block in &encoded.blocks {
                    for chunk in block.chunks(0xFF_FFFF) {
                        if chunk.is_empty() {
                            continue;
                        }
                        let variant = data_variant_for_len(chunk.len())?;
                        let offset = self.push_record(variant, chunk)?;
                        push_reference_into(&mut child_table, variant, offset)?;
                    }
                }
                Ok(())
            })()
        };

        source.close(handle)?;
        write_result?;

        let content = named_content(&name_of(path), stat.mtime, &child_table)?;
        self.push_record(ObjectType::File, &content)
    }

    fn emit_volume(&mut self, root_offset: u64) -> Result<()> {
        let mut child_table = Vec::new();
        write_object_into(&mut child_table, ObjectType::Id32, false, &self.options.volume_id.to_le_bytes())?;
        push_reference_into(&mut child_table, ObjectType::Directory, root_offset)?;
        let name = self.options.volume_name.clone();
        let content = named_content(&name, 0, &child_table)?;
        self.push_record(ObjectType::Volume, &content)?;
        Ok(())
    }

    fn emit_end(&mut self) -> Result<()> {
        self.push_record(ObjectType::End, &[])?;
        self.buf.extend_from_slice(&END_MARKER.to_le_bytes());
        Ok(())
    }

    fn push_record(&mut self, object_type: ObjectType, content: &[u8]) -> Result<u64> {
        let offset = self.buf.len() as u64;
        write_object_into(&mut self.buf, object_type, false, content)?;
        Ok(offset)
    }
}

fn write_object_into(buf: &mut Vec<u8>, object_type: ObjectType, is_reference: bool, content: &[u8]) -> Result<()> {
    let size_len = if is_reference { 1 } else { object_type.size_class_len() };
    let max = match size_len {
        1 => 0xFF,
        2 => 0xFFFF,
        3 => 0xFF_FFFF,
        _ => unreachable!("size class is always 1, 2 or 3 bytes"),
    };
    if content.len() > max {
        return Err(Error::NameTooLong);
    }
    buf.push(Tag::new(object_type.code(), is_reference).to_byte());
    match size_len {
        1 => buf.push(content.len() as u8),
        2 => buf.extend_from_slice(&(content.len() as u16).to_le_bytes()),
        3 => buf.extend_from_slice(&(content.len() as u32).to_le_bytes()[..3]),
        _ => unreachable!(),
    }
    buf.extend_from_slice(content);
    Ok(())
}

fn push_reference_into(buf: &mut Vec<u8>, object_type: ObjectType, target_offset: u64) -> Result<()> {
    let bytes = target_offset.to_le_bytes();
    let len = if target_offset < 0x100 {
        1
    } else if target_offset < 0x1_0000 {
        2
    } else if target_offset < 0x100_0000 {
        3
    } else {
        4
    };
    write_object_into(buf, object_type, true, &bytes[..len])
}

fn data_variant_for_len(len: usize) -> Result<ObjectType> {
    if len <= 0xFF {
        Ok(ObjectType::Data8)
    } else if len <= 0xFFFF {
        Ok(ObjectType::Data16)
    } else if len <= 0xFF_FFFF {
        Ok(ObjectType::Data24)
    } else {
        Err(Error::NameTooLong)
    }
}

fn named_content(name: &str, mtime: u32, child_table: &[u8]) -> Result<Vec<u8>> {
    if name.len() > 255 {
        return Err(Error::NameTooLong);
    }
    let mut v = Vec::with_capacity(1 + 4 + name.len() + child_table.len());
    v.push(name.len() as u8);
    v.extend_from_slice(&mtime.to_le_bytes());
    v.extend_from_slice(name.as_bytes());
    v.extend_from_slice(child_table);
    Ok(v)
}

fn write_attribute(buf: &mut Vec<u8>, tag: AttributeTag, value: &[u8]) -> Result<()> {
    match tag {
        AttributeTag::FileAttributes => write_object_into(buf, ObjectType::ObjAttr, false, value),
        AttributeTag::ReadAce => write_object_into(buf, ObjectType::ReadAce, false, value),
        AttributeTag::WriteAce => write_object_into(buf, ObjectType::WriteAce, false, value),
        AttributeTag::Md5Hash => write_object_into(buf, ObjectType::Md5Hash, false, value),
        AttributeTag::VolumeIndex => write_object_into(buf, ObjectType::VolumeIndex, false, value),
        AttributeTag::Comment | AttributeTag::User(_) => {
            let mut payload = alloc::vec![tag.tag_value()];
            payload.extend_from_slice(value);
            write_object_into(buf, ObjectType::UserAttribute, false, &payload)
        }
        AttributeTag::ModifiedTime | AttributeTag::Compression | AttributeTag::Acl => Err(Error::BadParam),
    }
}

fn read_all(source: &dyn FileSystem, handle: Handle) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = source.read(handle, &mut buf)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        alloc::format!("{dir}/{name}")
    }
}

fn name_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or("").to_string()
}

/// Writes a built image to a partition starting at offset 0.
pub fn write_to_partition(bytes: &[u8], partition: &mut dyn Partition) -> Result<()> {
    partition.check_extent(0, bytes.len() as u64)?;
    partition.write(0, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fwfs::Fwfs;
    use crate::memfs::MemFs;
    use crate::partition::MemoryPartition;

    fn mounted_memfs() -> MemFs {
        let fs = MemFs::new();
        fs.mount().unwrap();
        fs
    }

    fn read_back(bytes: Vec<u8>) -> Fwfs<MemoryPartition> {
        let size = bytes.len();
        let partition = MemoryPartition::new(bytes, 16.min(size.max(1)));
        let fs = Fwfs::new(partition);
        fs.mount().unwrap();
        fs
    }

    #[test]
    fn empty_tree_roundtrips() {
        let source = mounted_memfs();
        let bytes = ArchiveStream::build(
            &source,
            ArchiveOptions { volume_id: 7, volume_name: "vol".into(), ..Default::default() },
        )
        .unwrap();
        let fs = read_back(bytes);
        let info = fs.getinfo().unwrap();
        assert_eq!(info.volume_id, 7);
        assert_eq!(info.name, "vol");
        let stat = fs.stat("").unwrap();
        assert!(stat.is_dir());
    }

    #[test]
    fn small_file_is_inlined_and_reads_back() {
        let source = mounted_memfs();
        let h = source.open("hello.txt", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        source.write(h, b"hi there").unwrap();
        source.close(h).unwrap();

        let bytes =
            ArchiveStream::build(&source, ArchiveOptions { volume_name: "v".into(), ..Default::default() }).unwrap();
        let fs = read_back(bytes);
        let fh = fs.open("hello.txt", OpenFlags::READ).unwrap();
        let mut buf = [0u8; 8];
        let n = fs.read(fh, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi there");
    }

    #[test]
    fn nested_directories_roundtrip() {
        let source = mounted_memfs();
        source.mkdir("a").unwrap();
        source.mkdir("a/b").unwrap();
        let h = source.open("a/b/f.txt", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        source.write(h, b"nested").unwrap();
        source.close(h).unwrap();

        let bytes =
            ArchiveStream::build(&source, ArchiveOptions { volume_name: "v".into(), ..Default::default() }).unwrap();
        let fs = read_back(bytes);
        let stat = fs.stat("a/b").unwrap();
        assert!(stat.is_dir());
        let fh = fs.open("a/b/f.txt", OpenFlags::READ).unwrap();
        let mut buf = [0u8; 6];
        fs.read(fh, &mut buf).unwrap();
        assert_eq!(&buf, b"nested");
    }

    #[test]
    fn large_file_is_blocked_and_referenced() {
        let source = mounted_memfs();
        let h = source.open("big.bin", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        let content = alloc::vec![0xAB_u8; 4096];
        source.write(h, &content).unwrap();
        source.close(h).unwrap();

        let bytes =
            ArchiveStream::build(&source, ArchiveOptions { volume_name: "v".into(), ..Default::default() }).unwrap();
        let fs = read_back(bytes);
        let stat = fs.stat("big.bin").unwrap();
        assert_eq!(stat.size, 4096);
    }

    #[test]
    fn deflate_encoder_shrinks_repetitive_content() {
        let source = mounted_memfs();
        let h = source.open("rep.bin", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        let content = alloc::vec![0x41_u8; 8192];
        source.write(h, &content).unwrap();
        source.close(h).unwrap();

        let mut encoder = DeflateEncoder::default();
        let mut stream = ArchiveStream::new(ArchiveOptions { volume_name: "v".into(), ..Default::default() });
        stream.write(&source, Some(&mut encoder), None).unwrap();
        let bytes = stream.into_bytes();
        let fs = read_back(bytes);
        let stat = fs.stat("rep.bin").unwrap();
        assert_eq!(stat.compression.kind, CompressionType::GZip);
        assert_eq!(stat.compression.original_size, 8192);
        assert!(stat.size < 8192, "on-disk size should reflect the compressed bytes, not the original");
    }

    #[test]
    fn filter_drops_matching_entries() {
        let source = mounted_memfs();
        let h = source.open("keep.txt", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        source.write(h, b"keep").unwrap();
        source.close(h).unwrap();
        let h = source.open("skip.txt", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        source.write(h, b"skip").unwrap();
        source.close(h).unwrap();

        let filter = |stat: &Stat| stat.name != "skip.txt";
        let mut stream = ArchiveStream::new(ArchiveOptions { volume_name: "v".into(), ..Default::default() });
        stream.write(&source, None, Some(&filter)).unwrap();
        let bytes = stream.into_bytes();
        let fs = read_back(bytes);
        assert!(fs.stat("keep.txt").is_ok());
        assert_eq!(fs.stat("skip.txt"), Err(Error::NotFound));
    }

    #[test]
    fn on_error_truncate_discards_partial_output() {
        let source = mounted_memfs();
        let h = source.open("a.txt", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        source.write(h, b"a").unwrap();
        source.close(h).unwrap();

        let filter = |_: &Stat| -> bool { panic!("forced filter failure path not used here") };
        let _ = filter;

        let mut stream =
            ArchiveStream::new(ArchiveOptions { volume_name: "v".into(), on_error: OnError::Truncate, ..Default::default() });
        // `depth` is pushed past the cap by forcing deep recursion through a
        // directory chain, which is simpler to construct than a genuine I/O
        // failure and exercises the same truncate-on-error path.
        let mut path = String::new();
        for i in 0..(MAX_DIR_DEPTH + 1) {
            let name = alloc::format!("d{i}");
            source.mkdir(&join(&path, &name)).unwrap();
            path = join(&path, &name);
        }
        let result = stream.write(&source, None, None);
        assert!(result.is_err());
        assert!(stream.into_bytes().is_empty());
    }
}
