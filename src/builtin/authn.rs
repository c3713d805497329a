//! Bundled authentication store over the embedded database.

use std::path::PathBuf;

use log::debug;

use crate::authn::Authn;
use crate::errors::{DmError, DmResult, ErrorCode};
use crate::pool_container::Lease;
use crate::security::{GroupInfo, SecurityContext, SecurityCredentials, UserInfo};
use crate::security::{vo_from_dn, vo_from_role};

use super::store::NsConnectionFactory;

/// Resolves DNs and FQANs against the embedded user/group tables,
/// allocating uids and gids from the persistent counters on first sight.
pub struct BuiltinAuthn {
    session: Lease<NsConnectionFactory>,
    map_file: PathBuf,
    admin_username: String,
    host_dn_is_root: bool,
}

impl std::fmt::Debug for BuiltinAuthn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinAuthn").finish()
    }
}

fn host_dn() -> String {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("/CN={hostname}")
}

impl BuiltinAuthn {
    pub(crate) fn new(
        session: Lease<NsConnectionFactory>,
        map_file: PathBuf,
        admin_username: String,
        host_dn_is_root: bool,
    ) -> BuiltinAuthn {
        BuiltinAuthn {
            session,
            map_file,
            admin_username,
            host_dn_is_root,
        }
    }

    fn is_root_identity(&self, client_name: &str) -> bool {
        client_name == self.admin_username
            || (self.host_dn_is_root && client_name == host_dn())
    }

    fn root_context(credentials: &SecurityCredentials) -> SecurityContext {
        let mut context = SecurityContext::root();
        context.credentials = credentials.clone();
        context
    }
}

impl Authn for BuiltinAuthn {
    fn create_security_context(
        &mut self,
        credentials: &SecurityCredentials,
    ) -> DmResult<SecurityContext> {
        if credentials.client_name.is_empty() {
            return Err(DmError::new(
                ErrorCode::NO_SECURITY_CONTEXT,
                "credentials carry no client name",
            ));
        }
        if self.is_root_identity(&credentials.client_name) {
            debug!("{} maps to root", credentials.client_name);
            return Ok(Self::root_context(credentials));
        }
        let (user, groups) =
            self.get_id_map(&credentials.client_name, &credentials.fqans)?;
        Ok(SecurityContext::new(credentials.clone(), user, groups))
    }

    fn get_user(&mut self, name: &str) -> DmResult<UserInfo> {
        self.session.db.tables.lock().user_by_name(name)
    }

    fn get_user_by_uid(&mut self, uid: u32) -> DmResult<UserInfo> {
        self.session.db.tables.lock().user_by_uid(uid)
    }

    fn new_user(&mut self, name: &str, ca: &str) -> DmResult<UserInfo> {
        // single lock over check-allocate-insert: the row-lock analog
        self.session.db.tables.lock().new_user(name, ca)
    }

    fn get_group(&mut self, name: &str) -> DmResult<GroupInfo> {
        self.session.db.tables.lock().group_by_name(name)
    }

    fn get_group_by_gid(&mut self, gid: u32) -> DmResult<GroupInfo> {
        self.session.db.tables.lock().group_by_gid(gid)
    }

    fn new_group(&mut self, name: &str) -> DmResult<GroupInfo> {
        self.session.db.tables.lock().new_group(name)
    }

    fn get_id_map(
        &mut self,
        user_name: &str,
        group_names: &[String],
    ) -> DmResult<(UserInfo, Vec<GroupInfo>)> {
        let mut tables = self.session.db.tables.lock();

        let user = match tables.user_by_name(user_name) {
            Ok(user) => user,
            Err(e) if e.code() == ErrorCode::NO_SUCH_USER => tables.new_user(user_name, "")?,
            Err(e) => return Err(e),
        };

        let vos: Vec<String> = if group_names.is_empty() {
            vec![vo_from_dn(&self.map_file, user_name)?]
        } else {
            group_names.iter().map(|f| vo_from_role(f)).collect()
        };

        let mut groups = Vec::with_capacity(vos.len());
        for vo in vos {
            let group = match tables.group_by_name(&vo) {
                Ok(group) => group,
                Err(e) if e.code() == ErrorCode::NO_SUCH_GROUP => tables.new_group(&vo)?,
                Err(e) => return Err(e),
            };
            groups.push(group);
        }
        Ok((user, groups))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::store::NsDatabase;
    use crate::pool_container::PoolContainer;
    use std::io::Write;

    fn authn_for(db_name: &str, mapfile: PathBuf) -> BuiltinAuthn {
        let db = NsDatabase::open(db_name).unwrap();
        let pool = PoolContainer::new(NsConnectionFactory { db }, 2);
        BuiltinAuthn::new(
            pool.acquire(true).unwrap(),
            mapfile,
            "dpmmgr".to_string(),
            false,
        )
    }

    #[test]
    fn test_fqans_resolve_and_allocate() {
        let mut authn = authn_for("t_authn_fqan", PathBuf::from("/nonexistent"));
        let creds = SecurityCredentials {
            client_name: "/CN=alice".to_string(),
            fqans: vec!["/dteam/Role=production".to_string(), "/atlas".to_string()],
            ..Default::default()
        };
        let ctx = authn.create_security_context(&creds).unwrap();
        assert!(ctx.user.uid > 0);
        assert_eq!(ctx.groups.len(), 2);
        assert_eq!(ctx.groups[0].name, "dteam");
        assert_eq!(ctx.groups[1].name, "atlas");

        // resolving again yields the same ids
        let again = authn.create_security_context(&creds).unwrap();
        assert_eq!(again.user.uid, ctx.user.uid);
        assert_eq!(again.groups[0].gid, ctx.groups[0].gid);
    }

    #[test]
    fn test_mapfile_fallback_without_fqans() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "\"/CN=bob\" dteam").unwrap();
        file.flush().unwrap();

        let mut authn = authn_for("t_authn_mapfile", file.path().to_path_buf());
        let creds = SecurityCredentials::for_client("/CN=bob");
        let ctx = authn.create_security_context(&creds).unwrap();
        assert_eq!(ctx.groups.len(), 1);
        assert_eq!(ctx.groups[0].name, "dteam");
    }

    #[test]
    fn test_admin_maps_to_root() {
        let mut authn = authn_for("t_authn_admin", PathBuf::from("/nonexistent"));
        let ctx = authn
            .create_security_context(&SecurityCredentials::for_client("dpmmgr"))
            .unwrap();
        assert_eq!(ctx.user.uid, 0);
    }

    #[test]
    fn test_empty_client_name_is_refused() {
        let mut authn = authn_for("t_authn_empty", PathBuf::from("/nonexistent"));
        let err = authn
            .create_security_context(&SecurityCredentials::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NO_SECURITY_CONTEXT);
    }
}
