//! Access control lists.
//!
//! An ACL is a list of `(type, permission, id)` entries. Types follow the
//! POSIX ACL model: the three base entries (`USER_OBJ`, `GROUP_OBJ`,
//! `OTHER`), named `USER`/`GROUP` entries, and a `MASK` that caps the named
//! entries. Directory entries may additionally carry `DEFAULT`-flagged
//! copies, which are not evaluated for the directory itself but are
//! inherited by new children.
//!
//! The serialized form is the one persisted in the `acl` column: entries
//! sorted canonically, each rendered as a type letter (`A`..`F`, lower case
//! for defaults), one octal permission digit and a decimal id, joined by
//! commas. `A70,C50,F00` is a plain 0750-style ACL.

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::errors::{DmError, DmResult, ErrorCode};

/// One ACL entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AclEntry {
    /// Entry type, one of the `Acl*` constants, optionally OR'd with
    /// [`AclEntry::DEFAULT`].
    pub entry_type: u8,
    /// Permission triple (an octal digit, `rwx` bits).
    pub perm: u8,
    /// uid for `USER*` entries, gid for `GROUP*` entries, 0 otherwise.
    pub id: u32,
}

impl AclEntry {
    /// Owner base entry.
    pub const USER_OBJ: u8 = 1;
    /// Named user entry.
    pub const USER: u8 = 2;
    /// Owning-group base entry.
    pub const GROUP_OBJ: u8 = 3;
    /// Named group entry.
    pub const GROUP: u8 = 4;
    /// Mask capping named entries and the owning group.
    pub const MASK: u8 = 5;
    /// Everyone-else base entry.
    pub const OTHER: u8 = 6;
    /// Flag marking an entry as inheritable-only (directories).
    pub const DEFAULT: u8 = 0x20;

    /// Build an effective entry.
    pub fn new(entry_type: u8, perm: u8, id: u32) -> AclEntry {
        AclEntry {
            entry_type,
            perm: perm & 0o7,
            id,
        }
    }

    /// The type with the `DEFAULT` flag stripped.
    pub fn base_type(&self) -> u8 {
        self.entry_type & !AclEntry::DEFAULT
    }

    /// True for `DEFAULT`-flagged entries.
    pub fn is_default(&self) -> bool {
        self.entry_type & AclEntry::DEFAULT != 0
    }

    fn sort_key(&self) -> (u8, u8, u32) {
        (
            if self.is_default() { 1 } else { 0 },
            self.base_type(),
            self.id,
        )
    }
}

/// An access control list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Acl {
    entries: Vec<AclEntry>,
}

impl Acl {
    /// An empty ACL (mode bits alone govern access).
    pub fn new() -> Acl {
        Acl::default()
    }

    /// Build from entries, canonicalizing the order.
    pub fn from_entries(mut entries: Vec<AclEntry>) -> Acl {
        entries.sort_by_key(AclEntry::sort_key);
        Acl { entries }
    }

    /// The minimal ACL equivalent to plain mode bits.
    pub fn from_mode(uid: u32, gid: u32, mode: u32) -> Acl {
        Acl::from_entries(vec![
            AclEntry::new(AclEntry::USER_OBJ, (mode >> 6) as u8 & 0o7, uid),
            AclEntry::new(AclEntry::GROUP_OBJ, (mode >> 3) as u8 & 0o7, gid),
            AclEntry::new(AclEntry::OTHER, mode as u8 & 0o7, 0),
        ])
    }

    /// The entries, in canonical order.
    pub fn entries(&self) -> &[AclEntry] {
        &self.entries
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when named or mask entries exist, i.e. mode bits alone are not
    /// enough to evaluate access.
    pub fn is_extended(&self) -> bool {
        self.entries.iter().any(|e| {
            !e.is_default()
                && matches!(
                    e.base_type(),
                    AclEntry::USER | AclEntry::GROUP | AclEntry::MASK
                )
        })
    }

    /// Position of the first entry with exactly this type, `DEFAULT` flag
    /// included in the comparison.
    pub fn find(&self, entry_type: u8) -> Option<usize> {
        self.entries.iter().position(|e| e.entry_type == entry_type)
    }

    /// The first entry with exactly this type.
    pub fn entry(&self, entry_type: u8) -> Option<&AclEntry> {
        self.find(entry_type).map(|i| &self.entries[i])
    }

    /// Serialize to the canonical text form.
    pub fn serialize_text(&self) -> String {
        let mut sorted = self.entries.clone();
        sorted.sort_by_key(AclEntry::sort_key);
        let mut out = String::new();
        for e in &sorted {
            if !out.is_empty() {
                out.push(',');
            }
            let mut letter = (b'@' + e.base_type()) as char;
            if e.is_default() {
                letter = letter.to_ascii_lowercase();
            }
            out.push(letter);
            out.push(char::from(b'0' + (e.perm & 0o7)));
            out.push_str(&e.id.to_string());
        }
        out
    }

    /// Parse the serialized text form.
    pub fn parse_text(text: &str) -> DmResult<Acl> {
        let mut entries = Vec::new();
        for item in text.split(',').filter(|i| !i.is_empty()) {
            let bytes = item.as_bytes();
            if bytes.len() < 2 {
                return Err(malformed(item));
            }
            let letter = bytes[0];
            let base = match letter.to_ascii_uppercase() {
                b @ b'A'..=b'F' => b - b'@',
                _ => return Err(malformed(item)),
            };
            let entry_type = if letter.is_ascii_lowercase() {
                base | AclEntry::DEFAULT
            } else {
                base
            };
            let perm = match bytes[1] {
                p @ b'0'..=b'7' => p - b'0',
                _ => return Err(malformed(item)),
            };
            let id = if bytes.len() > 2 {
                item[2..].parse().map_err(|_| malformed(item))?
            } else {
                0
            };
            entries.push(AclEntry::new(entry_type, perm, id));
        }
        Ok(Acl::from_entries(entries))
    }

    /// Validate the structural rules:
    /// exactly one `USER_OBJ`, `GROUP_OBJ` and `OTHER`; a single `MASK`
    /// required as soon as named entries exist; and, when any `DEFAULT`
    /// entry is present, the same rules for the default set.
    pub fn validate(&self) -> DmResult<()> {
        self.validate_class(false)?;
        if self.entries.iter().any(AclEntry::is_default) {
            self.validate_class(true)?;
        }
        Ok(())
    }

    fn validate_class(&self, defaults: bool) -> DmResult<()> {
        let mut counts = [0usize; 7];
        for e in self.entries.iter().filter(|e| e.is_default() == defaults) {
            let base = e.base_type();
            if base == 0 || base > 6 {
                return Err(DmError::new(
                    ErrorCode::INVALID_ACL,
                    format!("unknown acl entry type {}", e.entry_type),
                ));
            }
            counts[base as usize] += 1;
        }
        let class = if defaults { "default" } else { "effective" };
        for (ty, name) in [
            (AclEntry::USER_OBJ, "USER_OBJ"),
            (AclEntry::GROUP_OBJ, "GROUP_OBJ"),
            (AclEntry::OTHER, "OTHER"),
        ] {
            if counts[ty as usize] != 1 {
                return Err(DmError::new(
                    ErrorCode::INVALID_ACL,
                    format!("exactly one {class} {name} entry is required"),
                ));
            }
        }
        let named = counts[AclEntry::USER as usize] + counts[AclEntry::GROUP as usize];
        if named > 0 && counts[AclEntry::MASK as usize] != 1 {
            return Err(DmError::new(
                ErrorCode::INVALID_ACL,
                format!("{class} named entries require exactly one MASK"),
            ));
        }
        if counts[AclEntry::MASK as usize] > 1 {
            return Err(DmError::new(
                ErrorCode::INVALID_ACL,
                format!("more than one {class} MASK entry"),
            ));
        }
        Ok(())
    }

    /// Re-derive the base (and mask) entries from new mode bits, leaving
    /// named entries alone. No effect on an empty ACL.
    pub fn update_from_mode(&mut self, mode: u32) {
        for e in &mut self.entries {
            if e.is_default() {
                continue;
            }
            match e.base_type() {
                AclEntry::USER_OBJ => e.perm = (mode >> 6) as u8 & 0o7,
                AclEntry::GROUP_OBJ | AclEntry::MASK => e.perm = (mode >> 3) as u8 & 0o7,
                AclEntry::OTHER => e.perm = mode as u8 & 0o7,
                _ => {}
            }
        }
    }

    /// Build the ACL of a new child under a directory carrying `DEFAULT`
    /// entries, POSIX style: the defaults become the child's effective
    /// entries, base permissions are capped by the creation mode, and ids of
    /// the base entries are coerced to the new owner. Directories inherit
    /// the `DEFAULT` entries themselves as well.
    ///
    /// Returns the child ACL and the adjusted file mode (permission bits
    /// re-derived from the base entries; the file-type bits of `cmode` are
    /// preserved). The caller is expected to skip its umask when defaults
    /// exist.
    pub fn inherit(parent: &Acl, uid: u32, gid: u32, cmode: u32) -> (Acl, u32) {
        let defaults: Vec<&AclEntry> =
            parent.entries.iter().filter(|e| e.is_default()).collect();
        debug_assert!(!defaults.is_empty());

        let is_dir = cmode & libc::S_IFMT == libc::S_IFDIR;
        let mut entries = Vec::new();
        let (mut user_perm, mut group_perm, mut other_perm) = (0u8, 0u8, 0u8);

        for d in &defaults {
            let mut e = AclEntry::new(d.base_type(), d.perm, d.id);
            match e.base_type() {
                AclEntry::USER_OBJ => {
                    e.perm &= (cmode >> 6) as u8 & 0o7;
                    e.id = uid;
                    user_perm = e.perm;
                }
                AclEntry::GROUP_OBJ => {
                    e.perm &= (cmode >> 3) as u8 & 0o7;
                    e.id = gid;
                    group_perm = e.perm;
                }
                AclEntry::OTHER => {
                    e.perm &= cmode as u8 & 0o7;
                    other_perm = e.perm;
                }
                AclEntry::MASK => e.perm &= (cmode >> 3) as u8 & 0o7,
                _ => {}
            }
            entries.push(e);
        }
        if is_dir {
            entries.extend(defaults.iter().map(|d| **d));
        }

        let mode = (cmode & libc::S_IFMT)
            | (u32::from(user_perm) << 6)
            | (u32::from(group_perm) << 3)
            | u32::from(other_perm);
        (Acl::from_entries(entries), mode)
    }
}

fn malformed(item: &str) -> DmError {
    DmError::new(
        ErrorCode::INVALID_ACL,
        format!("malformed acl entry '{item}'"),
    )
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize_text())
    }
}

impl Serialize for Acl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.serialize_text())
    }
}

impl<'de> Deserialize<'de> for Acl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AclTextVisitor;

        impl Visitor<'_> for AclTextVisitor {
            type Value = Acl;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a serialized acl")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Acl, E> {
                Acl::parse_text(v).map_err(|e| E::custom(e.to_string()))
            }
        }

        deserializer.deserialize_str(AclTextVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_round_trip() {
        let acl = Acl::from_entries(vec![
            AclEntry::new(AclEntry::OTHER, 0, 0),
            AclEntry::new(AclEntry::USER_OBJ, 7, 101),
            AclEntry::new(AclEntry::GROUP_OBJ, 5, 202),
            AclEntry::new(AclEntry::USER | AclEntry::DEFAULT, 6, 303),
        ]);
        let text = acl.serialize_text();
        assert_eq!(text, "A7101,C5202,F00,b6303");
        assert_eq!(Acl::parse_text(&text).unwrap(), acl);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Acl::parse_text("Z7").is_err());
        assert!(Acl::parse_text("A9").is_err());
        assert!(Acl::parse_text("Axy").is_err());
    }

    #[test]
    fn test_from_mode() {
        let acl = Acl::from_mode(101, 202, 0o750);
        assert_eq!(acl.entry(AclEntry::USER_OBJ).unwrap().perm, 0o7);
        assert_eq!(acl.entry(AclEntry::GROUP_OBJ).unwrap().perm, 0o5);
        assert_eq!(acl.entry(AclEntry::OTHER).unwrap().perm, 0);
        acl.validate().unwrap();
        assert!(!acl.is_extended());
    }

    #[test]
    fn test_validate_requires_mask_with_named_entries() {
        let acl = Acl::from_entries(vec![
            AclEntry::new(AclEntry::USER_OBJ, 7, 0),
            AclEntry::new(AclEntry::GROUP_OBJ, 5, 0),
            AclEntry::new(AclEntry::OTHER, 0, 0),
            AclEntry::new(AclEntry::USER, 6, 300),
        ]);
        assert_eq!(acl.validate().unwrap_err().code(), ErrorCode::INVALID_ACL);

        let mut entries = acl.entries().to_vec();
        entries.push(AclEntry::new(AclEntry::MASK, 7, 0));
        Acl::from_entries(entries).validate().unwrap();
    }

    #[test]
    fn test_validate_default_class() {
        // A default named user without the default base entries is invalid.
        let acl = Acl::from_entries(vec![
            AclEntry::new(AclEntry::USER_OBJ, 7, 0),
            AclEntry::new(AclEntry::GROUP_OBJ, 5, 0),
            AclEntry::new(AclEntry::OTHER, 0, 0),
            AclEntry::new(AclEntry::USER | AclEntry::DEFAULT, 6, 300),
        ]);
        assert_eq!(acl.validate().unwrap_err().code(), ErrorCode::INVALID_ACL);
    }

    #[test]
    fn test_inherit_masks_mode() {
        // Parent carries a full default set; child created with mode 0666.
        let parent = Acl::from_entries(vec![
            AclEntry::new(AclEntry::USER_OBJ, 7, 0),
            AclEntry::new(AclEntry::GROUP_OBJ, 5, 0),
            AclEntry::new(AclEntry::OTHER, 0, 0),
            AclEntry::new(AclEntry::USER_OBJ | AclEntry::DEFAULT, 7, 0),
            AclEntry::new(AclEntry::GROUP_OBJ | AclEntry::DEFAULT, 5, 0),
            AclEntry::new(AclEntry::OTHER | AclEntry::DEFAULT, 0, 0),
            AclEntry::new(AclEntry::USER | AclEntry::DEFAULT, 6, 300),
            AclEntry::new(AclEntry::MASK | AclEntry::DEFAULT, 7, 0),
        ]);
        let (acl, mode) = Acl::inherit(&parent, 101, 202, libc::S_IFREG | 0o666);
        assert_eq!(mode & 0o777, 0o640);
        assert_eq!(mode & libc::S_IFMT, libc::S_IFREG);
        let alice = acl.entry(AclEntry::USER).unwrap();
        assert_eq!((alice.perm, alice.id), (6, 300));
        assert_eq!(acl.entry(AclEntry::USER_OBJ).unwrap().id, 101);
        assert_eq!(acl.entry(AclEntry::GROUP_OBJ).unwrap().id, 202);
        // Plain files do not inherit the defaults themselves.
        assert!(!acl.entries().iter().any(AclEntry::is_default));
        acl.validate().unwrap();
    }

    #[test]
    fn test_inherit_directory_keeps_defaults() {
        let parent = Acl::from_entries(vec![
            AclEntry::new(AclEntry::USER_OBJ | AclEntry::DEFAULT, 7, 0),
            AclEntry::new(AclEntry::GROUP_OBJ | AclEntry::DEFAULT, 5, 0),
            AclEntry::new(AclEntry::OTHER | AclEntry::DEFAULT, 0, 0),
        ]);
        let (acl, mode) = Acl::inherit(&parent, 101, 202, libc::S_IFDIR | 0o775);
        assert_eq!(mode & 0o777, 0o750);
        assert!(acl.entries().iter().any(AclEntry::is_default));
    }

    #[test]
    fn test_update_from_mode() {
        let mut acl = Acl::from_entries(vec![
            AclEntry::new(AclEntry::USER_OBJ, 7, 0),
            AclEntry::new(AclEntry::GROUP_OBJ, 7, 0),
            AclEntry::new(AclEntry::MASK, 7, 0),
            AclEntry::new(AclEntry::OTHER, 7, 0),
            AclEntry::new(AclEntry::USER, 6, 300),
        ]);
        acl.update_from_mode(0o640);
        assert_eq!(acl.entry(AclEntry::USER_OBJ).unwrap().perm, 6);
        assert_eq!(acl.entry(AclEntry::GROUP_OBJ).unwrap().perm, 4);
        assert_eq!(acl.entry(AclEntry::MASK).unwrap().perm, 4);
        assert_eq!(acl.entry(AclEntry::OTHER).unwrap().perm, 0);
        assert_eq!(acl.entry(AclEntry::USER).unwrap().perm, 6);
    }
}
