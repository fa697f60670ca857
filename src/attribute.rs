// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Metadata types shared by every backend: file attribute bits, access
//! control, compression descriptors and the `AttributeTag` namespace
//! used by `setxattr`/`getxattr` (§6.3).

use bitflags::bitflags;
use core::fmt;

use crate::error::{Error, Result};

bitflags! {
    /// Per-file attribute bits, derived at `stat` time (§4.3
    /// "Attribute derivation for `stat`"). `Directory`/`MountPoint` are
    /// set by the reader itself, not stored in an `ObjAttr` record.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FileAttributes: u8 {
        const READ_ONLY   = 1 << 0;
        const ARCHIVE     = 1 << 1;
        const ENCRYPTED   = 1 << 2;
        const COMPRESSED  = 1 << 3;
        const DIRECTORY   = 1 << 4;
        const MOUNT_POINT = 1 << 5;
    }
}

impl Default for FileAttributes {
    fn default() -> Self {
        Self::empty()
    }
}

/// Access level, closed set, ordered from least to most privileged
/// (§6.4). `requester_role >= entry_role` grants access.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum UserRole {
    None = 0,
    Guest = 1,
    User = 2,
    Manager = 3,
    Admin = 4,
}

impl UserRole {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Guest),
            2 => Some(Self::User),
            3 => Some(Self::Manager),
            4 => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn allows(self, requester: UserRole) -> bool {
        requester >= self
    }
}

impl Default for UserRole {
    fn default() -> Self {
        Self::None
    }
}

/// Minimum roles required for read and write access to an object.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Acl {
    pub read_role: UserRole,
    pub write_role: UserRole,
}

/// Compression applied to a file's data children.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompressionType {
    None = 0,
    GZip = 1,
}

impl CompressionType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::GZip),
            _ => Err(Error::BadObject),
        }
    }
}

/// `{type, original_size}` — §3.2 object code 4.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Compression {
    pub kind: CompressionType,
    pub original_size: u32,
}

impl Default for Compression {
    fn default() -> Self {
        Compression { kind: CompressionType::None, original_size: 0 }
    }
}

/// Lowest tag value reserved for caller-defined user attributes
/// (§6.3: "User(base value 16..: user tag = 16+n)").
pub const USER_ATTRIBUTE_BASE: u8 = 16;

/// Identifies a typed metadata slot on an object (§6.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttributeTag {
    ModifiedTime,
    FileAttributes,
    Acl,
    Compression,
    ReadAce,
    WriteAce,
    VolumeIndex,
    Md5Hash,
    Comment,
    /// `n` is the offset above `USER_ATTRIBUTE_BASE`; the wire tag
    /// value is `USER_ATTRIBUTE_BASE + n`.
    User(u8),
}

impl AttributeTag {
    /// Returns the well-known user attribute tag for `n`.
    pub fn user(n: u8) -> AttributeTag {
        AttributeTag::User(n)
    }

    pub fn tag_value(self) -> u8 {
        match self {
            AttributeTag::ModifiedTime => 0,
            AttributeTag::FileAttributes => 1,
            AttributeTag::Acl => 2,
            AttributeTag::Compression => 3,
            AttributeTag::ReadAce => 4,
            AttributeTag::WriteAce => 5,
            AttributeTag::VolumeIndex => 6,
            AttributeTag::Md5Hash => 7,
            AttributeTag::Comment => 8,
            AttributeTag::User(n) => USER_ATTRIBUTE_BASE + n,
        }
    }

    pub fn from_tag_value(v: u8) -> AttributeTag {
        match v {
            0 => AttributeTag::ModifiedTime,
            1 => AttributeTag::FileAttributes,
            2 => AttributeTag::Acl,
            3 => AttributeTag::Compression,
            4 => AttributeTag::ReadAce,
            5 => AttributeTag::WriteAce,
            6 => AttributeTag::VolumeIndex,
            7 => AttributeTag::Md5Hash,
            8 => AttributeTag::Comment,
            n => AttributeTag::User(n - USER_ATTRIBUTE_BASE),
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UserRole::None => "none",
            UserRole::Guest => "guest",
            UserRole::User => "user",
            UserRole::Manager => "manager",
            UserRole::Admin => "admin",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering_allows_equal_and_above() {
        assert!(UserRole::Admin.allows(UserRole::Admin));
        assert!(UserRole::Guest.allows(UserRole::Admin));
        assert!(!UserRole::Admin.allows(UserRole::Guest));
        assert!(UserRole::None.allows(UserRole::Guest));
    }

    #[test]
    fn user_attribute_tag_roundtrip() {
        let tag = AttributeTag::user(5);
        assert_eq!(tag.tag_value(), 21);
        assert_eq!(AttributeTag::from_tag_value(21), AttributeTag::User(5));
    }

    #[test]
    fn well_known_tag_roundtrip() {
        for tag in [
            AttributeTag::ModifiedTime,
            AttributeTag::FileAttributes,
            AttributeTag::Acl,
            AttributeTag::Compression,
            AttributeTag::ReadAce,
            AttributeTag::WriteAce,
            AttributeTag::VolumeIndex,
            AttributeTag::Md5Hash,
            AttributeTag::Comment,
        ] {
            assert_eq!(AttributeTag::from_tag_value(tag.tag_value()), tag);
        }
    }
}
