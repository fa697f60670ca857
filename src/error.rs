// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error codes shared by every filesystem backend.
//!
//! Negative values are errors; zero/positive values (from `check()`)
//! indicate success or a recoverable-count. `Error` itself only ever
//! represents the negative case; callers that need the raw integer
//! encoding go through [`Error::code`].

use core::fmt;

/// Every error a `FileSystem` implementation may return.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum Error {
    NotMounted,
    BadFileSystem,
    BadObject,
    ReadOnly,
    NotFound,
    NoMoreFiles,
    InvalidHandle,
    FileNotOpen,
    OutOfFileDescs,
    BadExtent,
    ReadFailure,
    WriteFailure,
    EraseFailure,
    NameTooLong,
    BufferTooSmall,
    NotSupported,
    NotImplemented,
    NoFileSystem,
    NoPartition,
    NoMedia,
    SeekBounds,
    /// Internal reader signal that an iterator has reached the end of
    /// the child table. Never escapes a public API.
    EndOfObjects,
    /// A precondition was violated (bad argument combination, wrong
    /// open-flag combination, etc.) that does not fit any other code.
    BadParam,
}

impl Error {
    /// The negative status code a caller would see from a C-style ABI.
    /// `eFSERR_*` in the original implementation; kept only so backends
    /// that need to expose a stable integer ABI can do so.
    pub fn code(self) -> i32 {
        -(self.ordinal() as i32)
    }

    fn ordinal(self) -> u32 {
        match self {
            Self::NotMounted => 1,
            Self::BadFileSystem => 2,
            Self::BadObject => 3,
            Self::ReadOnly => 4,
            Self::NotFound => 5,
            Self::NoMoreFiles => 6,
            Self::InvalidHandle => 7,
            Self::FileNotOpen => 8,
            Self::OutOfFileDescs => 9,
            Self::BadExtent => 10,
            Self::ReadFailure => 11,
            Self::WriteFailure => 12,
            Self::EraseFailure => 13,
            Self::NameTooLong => 14,
            Self::BufferTooSmall => 15,
            Self::NotSupported => 16,
            Self::NotImplemented => 17,
            Self::NoFileSystem => 18,
            Self::NoPartition => 19,
            Self::NoMedia => 20,
            Self::SeekBounds => 21,
            Self::EndOfObjects => 22,
            Self::BadParam => 23,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotMounted => "operation requires a mounted filesystem",
            Self::BadFileSystem => "filesystem image is corrupt or unrecognized",
            Self::BadObject => "object reference points to the wrong type, or chains",
            Self::ReadOnly => "write attempted on a read-only backend or file",
            Self::NotFound => "path or attribute not found",
            Self::NoMoreFiles => "no more directory entries",
            Self::InvalidHandle => "handle is outside the valid range",
            Self::FileNotOpen => "handle is valid but not currently open",
            Self::OutOfFileDescs => "descriptor pool exhausted",
            Self::BadExtent => "media extent out of range",
            Self::ReadFailure => "media read failed",
            Self::WriteFailure => "media write failed",
            Self::EraseFailure => "media erase failed",
            Self::NameTooLong => "name or path exceeds the backend's limit",
            Self::BufferTooSmall => "output does not fit the supplied buffer",
            Self::NotSupported => "flag or feature not supported by this backend",
            Self::NotImplemented => "method not yet implemented",
            Self::NoFileSystem => "no filesystem has been installed",
            Self::NoPartition => "no partition has been assigned",
            Self::NoMedia => "no underlying media object",
            Self::SeekBounds => "seek would produce an offset outside [0, size]",
            Self::EndOfObjects => "last object in the image has been read",
            Self::BadParam => "invalid argument or flag combination",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
