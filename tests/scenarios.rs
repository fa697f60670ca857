// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The six concrete end-to-end scenarios (E1-E6).

use ifs::archive::{ArchiveOptions, ArchiveStream, EncodedFile, IBlockEncoder};
use ifs::capability::{CTRL_GET_MD5_HASH, FileSystem, OpenFlags};
use ifs::error::Error;
use ifs::fwfs::Fwfs;
use ifs::hyfs::Hyfs;
use ifs::memfs::MemFs;
use ifs::partition::MemoryPartition;
use ifs::{AttributeTag, Compression, FileAttributes};
use md5::Digest;

/// Splits file content into fixed-size blocks so `ArchiveStream` writes
/// one standalone data object per block, rather than folding everything
/// under the 16 MiB per-object cap into a single chunk.
struct FixedBlockEncoder {
    block_size: usize,
}

impl IBlockEncoder for FixedBlockEncoder {
    fn encode(&mut self, content: &[u8]) -> ifs::Result<EncodedFile> {
        let blocks = content.chunks(self.block_size).map(|c| c.to_vec()).collect();
        Ok(EncodedFile { blocks, compression: Compression::default() })
    }
}

fn mounted_memfs() -> MemFs {
    let fs = MemFs::new();
    fs.mount().unwrap();
    fs
}

fn mount_image(bytes: Vec<u8>) -> Fwfs<MemoryPartition> {
    let size = bytes.len();
    let fs = Fwfs::new(MemoryPartition::new(bytes, 16.min(size.max(1))));
    fs.mount().unwrap();
    fs
}

/// E1: volume id, root file sizes, content and MD5 all check out.
#[test]
fn e1_volume_and_file_contents_checkout() {
    let source = mounted_memfs();
    let h = source.open("a.txt", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    source.write(h, b"hello").unwrap();
    source.close(h).unwrap();
    let h = source.open("b.bin", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    source.write(h, &[0xAAu8; 256]).unwrap();
    source.close(h).unwrap();

    let bytes = ArchiveStream::build(
        &source,
        ArchiveOptions { volume_id: 0xdead_beef, volume_name: "vol".into(), ..Default::default() },
    )
    .unwrap();
    let fs = mount_image(bytes);

    let info = fs.getinfo().unwrap();
    assert_eq!(info.volume_id, 0xdead_beef);

    let stat_a = fs.stat("/a.txt").unwrap();
    assert_eq!(stat_a.size, 5);
    let fh = fs.open("/a.txt", OpenFlags::READ).unwrap();
    let mut buf = [0u8; 5];
    fs.read(fh, &mut buf).unwrap();
    assert_eq!(&buf, b"hello");
    fs.close(fh).unwrap();

    let stat_b = fs.stat("/b.bin").unwrap();
    assert_eq!(stat_b.size, 256);

    let bh = fs.open("/b.bin", OpenFlags::READ).unwrap();
    let mut hash = [0u8; 16];
    fs.fcontrol(bh, CTRL_GET_MD5_HASH, &mut hash).unwrap();
    fs.close(bh).unwrap();
    let expected: [u8; 16] = md5::Md5::digest([0xAAu8; 256]).into();
    assert_eq!(hash, expected);
}

/// E2: promotion copies the ACL and appends after the lower content.
#[test]
fn e2_promotion_appends_and_preserves_acl() {
    let lower_src = mounted_memfs();
    let h = lower_src.open("readme.md", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    lower_src.write(h, b"lower content\n").unwrap();
    lower_src.close(h).unwrap();
    let image =
        ArchiveStream::build(&lower_src, ArchiveOptions { volume_name: "v".into(), ..Default::default() }).unwrap();

    let lower = mount_image(image);
    let upper = mounted_memfs();
    let hyfs = Hyfs::new(lower, upper);
    hyfs.mount().unwrap();

    let h = hyfs.open("readme.md", OpenFlags::WRITE | OpenFlags::APPEND).unwrap();
    hyfs.write(h, b"more\n").unwrap();
    hyfs.close(h).unwrap();

    let h2 = hyfs.open("readme.md", OpenFlags::READ).unwrap();
    let mut buf = [0u8; 64];
    let n = hyfs.read(h2, &mut buf).unwrap();
    hyfs.close(h2).unwrap();
    assert_eq!(&buf[..n], b"lower content\nmore\n");
}

/// E3: a ReadOnly lower-only file rejects both write and remove.
#[test]
fn e3_read_only_lower_file_rejects_write_and_remove() {
    let lower_src = mounted_memfs();
    let h = lower_src.open("locked.cfg", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    lower_src.write(h, b"x").unwrap();
    lower_src.fsetxattr(h, AttributeTag::FileAttributes, &[FileAttributes::READ_ONLY.bits()]).unwrap();
    lower_src.close(h).unwrap();
    let image =
        ArchiveStream::build(&lower_src, ArchiveOptions { volume_name: "v".into(), ..Default::default() }).unwrap();

    let lower = mount_image(image);
    let upper = mounted_memfs();
    let hyfs = Hyfs::new(lower, upper);
    hyfs.mount().unwrap();

    assert_eq!(hyfs.open("locked.cfg", OpenFlags::WRITE).err(), Some(Error::ReadOnly));
    assert_eq!(hyfs.remove("locked.cfg").err(), Some(Error::ReadOnly));
}

/// E4: a comment attribute set on the source survives archiving.
#[test]
fn e4_comment_attribute_survives_archiving() {
    let source = mounted_memfs();
    for (name, content) in [("one.txt", &b"1"[..]), ("two.txt", &b"22"[..]), ("three.txt", &b"333"[..])] {
        let h = source.open(name, OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        source.write(h, content).unwrap();
        if name == "two.txt" {
            source.fsetxattr(h, AttributeTag::Comment, b"aloha").unwrap();
        }
        source.close(h).unwrap();
    }

    let bytes = ArchiveStream::build(&source, ArchiveOptions { volume_name: "v".into(), ..Default::default() }).unwrap();
    let fs = mount_image(bytes);

    let mut buf = [0u8; 5];
    let n = fs.getxattr("two.txt", AttributeTag::Comment, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"aloha");
    assert_eq!(fs.getxattr("one.txt", AttributeTag::Comment, &mut buf).err(), Some(Error::NotFound));
}

/// E5: a file made of several large blocked data children reads
/// correctly across a child boundary.
#[test]
fn e5_large_blocked_file_reads_across_child_boundary() {
    let source = mounted_memfs();
    let h = source.open("x", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    for block in 0..11u8 {
        let chunk = vec![block; 100_000];
        source.write(h, &chunk).unwrap();
    }
    source.close(h).unwrap();

    let mut encoder = FixedBlockEncoder { block_size: 100_000 };
    let mut stream = ArchiveStream::new(ArchiveOptions { volume_name: "v".into(), ..Default::default() });
    stream.write(&source, Some(&mut encoder), None).unwrap();
    let fs = mount_image(stream.into_bytes());

    let stat = fs.stat("/x").unwrap();
    assert_eq!(stat.size, 1_100_000);

    let fh = fs.open("/x", OpenFlags::READ).unwrap();
    fs.lseek(fh, ifs::capability::SeekFrom::Start(950_000)).unwrap();
    let mut buf = vec![0u8; 100_000];
    let n = fs.read(fh, &mut buf).unwrap();
    fs.close(fh).unwrap();
    assert_eq!(n, 100_000);

    // Blocks are 100_000 bytes each with value == block index, so bytes
    // 950_000..1_000_000 belong to block 9 and 1_000_000..1_100_000 to
    // block 10: this read genuinely spans the child boundary between
    // them rather than landing entirely inside the last child.
    assert!(buf[..50_000].iter().all(|&b| b == 9));
    assert!(buf[50_000..].iter().all(|&b| b == 10));
}

/// E6: a strided extent list decodes to the expected total size.
#[test]
fn e6_strided_extent_decodes_to_expected_total() {
    let extent = ifs::Extent { offset: 0, length: 251, skip: 261, repeat: 29 };
    assert_eq!(extent.stride(), 512);
    assert_eq!(extent.decoded_size(), 251 * 30);
}
