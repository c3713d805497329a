//! Credentials, security contexts and the permission check.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::acl::{Acl, AclEntry};
use crate::errors::{DmError, DmResult, ErrorCode};
use crate::extensible::Extensible;
use crate::inode::ExtendedStat;

/// Read permission bit, as used by [`check_permissions`].
pub const PERM_READ: u32 = libc::S_IRUSR;
/// Write permission bit.
pub const PERM_WRITE: u32 = libc::S_IWUSR;
/// Execute/traverse permission bit.
pub const PERM_EXEC: u32 = libc::S_IXUSR;

/// What the client presented: mechanism, identity and attributes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityCredentials {
    /// Authentication mechanism (e.g. `GSI`).
    pub mech: String,
    /// Client name; a distinguished name for certificate mechanisms.
    pub client_name: String,
    /// Remote address the request came from.
    pub remote_address: String,
    /// Session identifier, if the front end tracks one.
    pub session_id: String,
    /// Fully qualified attribute names presented by the client.
    pub fqans: Vec<String>,
    /// Any further attributes.
    pub extra: Extensible,
}

impl SecurityCredentials {
    /// Credentials for a plain named client with no VO attributes.
    pub fn for_client(name: impl Into<String>) -> SecurityCredentials {
        SecurityCredentials {
            client_name: name.into(),
            ..Default::default()
        }
    }
}

/// A resolved user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Numeric id. 0 is root.
    pub uid: u32,
    /// User name (the DN for certificate users).
    pub name: String,
    /// Certificate authority that issued the identity, if any.
    pub ca: String,
    /// Banned users keep resolving but higher layers may refuse them.
    pub banned: bool,
    /// Any further attributes.
    pub extra: Extensible,
}

/// A resolved group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Numeric id.
    pub gid: u32,
    /// Group (VO) name.
    pub name: String,
    /// Banned flag, carried through for higher layers.
    pub banned: bool,
    /// Any further attributes.
    pub extra: Extensible,
}

/// Credentials plus their resolution: the user and the ordered group list
/// (primary group first).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SecurityContext {
    /// The raw credentials.
    pub credentials: SecurityCredentials,
    /// The resolved user.
    pub user: UserInfo,
    /// Resolved groups, primary first.
    pub groups: Vec<GroupInfo>,
}

impl SecurityContext {
    /// Assemble a context.
    pub fn new(
        credentials: SecurityCredentials,
        user: UserInfo,
        groups: Vec<GroupInfo>,
    ) -> SecurityContext {
        SecurityContext {
            credentials,
            user,
            groups,
        }
    }

    /// A synthetic root context, for administrative paths and tests.
    pub fn root() -> SecurityContext {
        SecurityContext {
            credentials: SecurityCredentials::for_client("root"),
            user: UserInfo {
                uid: 0,
                name: "root".to_string(),
                ..Default::default()
            },
            groups: vec![GroupInfo {
                gid: 0,
                name: "root".to_string(),
                ..Default::default()
            }],
        }
    }

    /// The primary gid (0 when no group was resolved).
    pub fn primary_gid(&self) -> u32 {
        self.groups.first().map(|g| g.gid).unwrap_or(0)
    }

    /// True when any of the context's groups has this gid.
    pub fn has_group(&self, gid: u32) -> bool {
        self.groups.iter().any(|g| g.gid == gid)
    }
}

/// Check whether the context may access an entry with the given permission
/// bits (`PERM_READ` | `PERM_WRITE` | `PERM_EXEC`, owner-class positions).
///
/// Root is always granted. When the ACL carries extended entries they are
/// evaluated in canonical order with first-matching-category-wins and the
/// `MASK` capping named entries and the owning group; otherwise the plain
/// mode triples decide. Group entries match against any group of the
/// context.
pub fn check_permissions(
    context: &SecurityContext,
    acl: &Acl,
    meta: &ExtendedStat,
    mode: u32,
) -> bool {
    if context.user.uid == 0 {
        return true;
    }
    let wanted = (mode >> 6) as u8 & 0o7;

    if acl.is_extended() {
        return check_acl(context, acl, meta, wanted);
    }

    let granted = if context.user.uid == meta.uid {
        (meta.mode >> 6) & 0o7
    } else if context.has_group(meta.gid) {
        (meta.mode >> 3) & 0o7
    } else {
        meta.mode & 0o7
    } as u8;
    granted & wanted == wanted
}

fn check_acl(context: &SecurityContext, acl: &Acl, meta: &ExtendedStat, wanted: u8) -> bool {
    let mask = acl
        .entry(AclEntry::MASK)
        .map(|e| e.perm)
        .unwrap_or(0o7);

    // user-obj
    if context.user.uid == meta.uid {
        let perm = acl
            .entry(AclEntry::USER_OBJ)
            .map(|e| e.perm)
            .unwrap_or((meta.mode >> 6) as u8 & 0o7);
        return perm & wanted == wanted;
    }
    // named user, capped by the mask
    for e in acl.entries() {
        if e.entry_type == AclEntry::USER && e.id == context.user.uid {
            return e.perm & mask & wanted == wanted;
        }
    }
    // group-obj or any matching named group; the first matching category
    // wins, but within the group class any grant suffices
    let mut group_matched = false;
    if let Some(e) = acl.entry(AclEntry::GROUP_OBJ) {
        if context.has_group(meta.gid) {
            group_matched = true;
            if e.perm & mask & wanted == wanted {
                return true;
            }
        }
    }
    for e in acl.entries() {
        if e.entry_type == AclEntry::GROUP && context.has_group(e.id) {
            group_matched = true;
            if e.perm & mask & wanted == wanted {
                return true;
            }
        }
    }
    if group_matched {
        return false;
    }
    // other
    let perm = acl
        .entry(AclEntry::OTHER)
        .map(|e| e.perm)
        .unwrap_or(meta.mode as u8 & 0o7);
    perm & wanted == wanted
}

/// [`check_permissions`] in result form, raising `FORBIDDEN`.
pub fn require_permissions(
    context: &SecurityContext,
    meta: &ExtendedStat,
    mode: u32,
    what: &str,
) -> DmResult<()> {
    if check_permissions(context, &meta.acl, meta, mode) {
        Ok(())
    } else {
        Err(DmError::new(
            ErrorCode::FORBIDDEN,
            format!("not enough permissions to {what}"),
        ))
    }
}

/// Resolve a VO name from a DN through a mapfile.
///
/// Mapfile lines have the form `"<dn>" <vo>`; the first line whose DN matches
/// wins. Lines starting with `#` are skipped.
pub fn vo_from_dn(mapfile: &Path, dn: &str) -> DmResult<String> {
    let content = fs::read_to_string(mapfile).map_err(|e| {
        DmError::new(
            ErrorCode::configuration(libc::ENOENT as u32),
            format!("can not read mapfile {}: {e}", mapfile.display()),
        )
    })?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (pattern, vo) = match line.strip_prefix('"') {
            Some(rest) => match rest.split_once('"') {
                Some((dn_part, vo_part)) => (dn_part, vo_part.trim()),
                None => continue,
            },
            None => match line.rsplit_once(char::is_whitespace) {
                Some((dn_part, vo_part)) => (dn_part.trim(), vo_part),
                None => continue,
            },
        };
        if pattern == dn && !vo.is_empty() {
            return Ok(vo_from_role(vo));
        }
    }
    Err(DmError::new(
        ErrorCode::NO_SUCH_USER,
        format!("no mapping for '{dn}' in {}", mapfile.display()),
    ))
}

/// Extract the VO name from an FQAN or role string: the leading slash and
/// any `/Role=...` qualifiers are dropped, so `/dteam/Role=production`
/// becomes `dteam`.
pub fn vo_from_role(role: &str) -> String {
    let trimmed = role.trim_start_matches('/');
    let vo = trimmed.split('/').next().unwrap_or(trimmed);
    vo.split_once("Role=").map(|(v, _)| v).unwrap_or(vo).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn stat_with(uid: u32, gid: u32, mode: u32) -> ExtendedStat {
        ExtendedStat {
            uid,
            gid,
            mode,
            ..Default::default()
        }
    }

    fn ctx(uid: u32, gids: &[u32]) -> SecurityContext {
        SecurityContext {
            user: UserInfo {
                uid,
                name: format!("user{uid}"),
                ..Default::default()
            },
            groups: gids
                .iter()
                .map(|g| GroupInfo {
                    gid: *g,
                    name: format!("group{g}"),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_root_always_granted() {
        let meta = stat_with(101, 202, 0o000);
        assert!(check_permissions(
            &ctx(0, &[0]),
            &Acl::new(),
            &meta,
            PERM_READ | PERM_WRITE | PERM_EXEC
        ));
    }

    #[test]
    fn test_posix_triples() {
        let meta = stat_with(101, 202, 0o640);
        assert!(check_permissions(&ctx(101, &[300]), &Acl::new(), &meta, PERM_WRITE));
        assert!(check_permissions(&ctx(500, &[202]), &Acl::new(), &meta, PERM_READ));
        assert!(!check_permissions(&ctx(500, &[202]), &Acl::new(), &meta, PERM_WRITE));
        assert!(!check_permissions(&ctx(500, &[500]), &Acl::new(), &meta, PERM_READ));
    }

    #[test]
    fn test_acl_named_user_capped_by_mask() {
        let meta = stat_with(101, 202, 0o640);
        let acl = Acl::from_entries(vec![
            AclEntry::new(AclEntry::USER_OBJ, 6, 101),
            AclEntry::new(AclEntry::GROUP_OBJ, 4, 202),
            AclEntry::new(AclEntry::OTHER, 0, 0),
            AclEntry::new(AclEntry::USER, 7, 300),
            AclEntry::new(AclEntry::MASK, 5, 0),
        ]);
        // rwx requested, but the mask drops the write bit.
        assert!(!check_permissions(&ctx(300, &[999]), &acl, &meta, PERM_WRITE));
        assert!(check_permissions(&ctx(300, &[999]), &acl, &meta, PERM_READ | PERM_EXEC));
    }

    #[test]
    fn test_acl_group_class_any_grant() {
        let meta = stat_with(101, 202, 0o640);
        let acl = Acl::from_entries(vec![
            AclEntry::new(AclEntry::USER_OBJ, 6, 101),
            AclEntry::new(AclEntry::GROUP_OBJ, 0, 202),
            AclEntry::new(AclEntry::OTHER, 0, 0),
            AclEntry::new(AclEntry::GROUP, 6, 777),
            AclEntry::new(AclEntry::MASK, 7, 0),
        ]);
        // Owning group denies, but a named group of the context grants.
        assert!(check_permissions(&ctx(500, &[202, 777]), &acl, &meta, PERM_READ));
        // Matched group class means OTHER is never consulted.
        let deny_all = Acl::from_entries(vec![
            AclEntry::new(AclEntry::USER_OBJ, 6, 101),
            AclEntry::new(AclEntry::GROUP_OBJ, 0, 202),
            AclEntry::new(AclEntry::OTHER, 7, 0),
            AclEntry::new(AclEntry::GROUP, 0, 777),
            AclEntry::new(AclEntry::MASK, 7, 0),
        ]);
        assert!(!check_permissions(&ctx(500, &[777]), &deny_all, &meta, PERM_READ));
    }

    #[test]
    fn test_permission_monotonicity() {
        // If a superset of bits is granted, every subset is granted too.
        let meta = stat_with(101, 202, 0o750);
        let combos = [
            PERM_READ | PERM_WRITE | PERM_EXEC,
            PERM_READ | PERM_EXEC,
            PERM_READ,
            PERM_EXEC,
        ];
        for caller in [ctx(101, &[202]), ctx(500, &[202]), ctx(500, &[999])] {
            for (i, superset) in combos.iter().enumerate() {
                if check_permissions(&caller, &Acl::new(), &meta, *superset) {
                    for subset in &combos[i..] {
                        if superset & subset == *subset {
                            assert!(check_permissions(&caller, &Acl::new(), &meta, *subset));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_vo_from_role() {
        assert_eq!(vo_from_role("/dteam/Role=production"), "dteam");
        assert_eq!(vo_from_role("/atlas"), "atlas");
        assert_eq!(vo_from_role("dteam"), "dteam");
    }

    #[test]
    fn test_vo_from_dn() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "\"/C=CH/O=CERN/CN=someone\" dteam").unwrap();
        file.flush().unwrap();

        let vo = vo_from_dn(file.path(), "/C=CH/O=CERN/CN=someone").unwrap();
        assert_eq!(vo, "dteam");
        let err = vo_from_dn(file.path(), "/C=CH/O=CERN/CN=unknown").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NO_SUCH_USER);
    }
}
