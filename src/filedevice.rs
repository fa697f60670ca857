// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [`Partition`] backed by an open `std::fs::File` (C1, §4.7). Enables
//! filesystem-on-file composition — mounting FWFS against a disk image
//! on the host filesystem — and is the partition test fixtures reach
//! for when a raw `Vec<u8>` isn't a realistic enough backing store.

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::error::{Error, Result};
use crate::partition::Partition;

/// Wraps a file as a byte-addressable, fixed-size partition. Reads and
/// writes use positioned I/O (`pread`/`pwrite`) rather than seeking, so
/// `read` can take `&self` per the [`Partition`] contract without
/// interior mutability.
pub struct FileDevice {
    file: File,
    size: u64,
    block_size: usize,
}

impl FileDevice {
    /// Wraps `file`, whose current length becomes the partition's fixed
    /// size. Use `File::set_len` beforehand to size a freshly created
    /// image.
    pub fn open(file: File, block_size: usize) -> Result<Self> {
        let size = file.metadata().map_err(|_| Error::NoMedia)?.len();
        Ok(FileDevice { file, size, block_size })
    }
}

impl Partition for FileDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_extent(offset, buf.len() as u64)?;
        self.file.read_exact_at(buf, offset).map_err(|_| Error::ReadFailure)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_extent(offset, buf.len() as u64)?;
        self.file.write_all_at(buf, offset).map_err(|_| Error::WriteFailure)
    }

    /// Simulated as writing `0xFF` across the range (§4.7): a file has
    /// no real erase-block hardware to model.
    fn erase_range(&mut self, offset: u64, len: u64) -> Result<()> {
        self.check_extent(offset, len)?;
        let filler = vec![0xFFu8; len as usize];
        self.file.write_all_at(&filler, offset).map_err(|_| Error::EraseFailure)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(initial: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(initial).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn write_then_read_roundtrips() {
        let mut dev = FileDevice::open(temp_file(&[0u8; 64]), 16).unwrap();
        dev.write(4, b"hello").unwrap();
        let mut buf = [0u8; 5];
        dev.read(4, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn erase_range_fills_0xff() {
        let mut dev = FileDevice::open(temp_file(&[0u8; 16]), 16).unwrap();
        dev.erase_range(0, 16).unwrap();
        let mut buf = [0u8; 16];
        dev.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn out_of_range_access_fails() {
        let dev = FileDevice::open(temp_file(&[0u8; 16]), 16).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(dev.read(15, &mut buf), Err(Error::BadExtent));
    }

    #[test]
    fn size_reflects_file_length_at_open() {
        let dev = FileDevice::open(temp_file(&[0u8; 128]), 32).unwrap();
        assert_eq!(dev.size(), 128);
    }
}
