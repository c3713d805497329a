//! Authentication interface: identity resolution and id allocation.

use crate::errors::DmResult;
use crate::security::{GroupInfo, SecurityContext, SecurityCredentials, UserInfo};

/// Resolves credentials into users and groups, allocating ids on first
/// sight. The banned flags are carried through, not enforced here.
pub trait Authn: Send + std::fmt::Debug {
    /// Resolve credentials into a full security context.
    fn create_security_context(
        &mut self,
        credentials: &SecurityCredentials,
    ) -> DmResult<SecurityContext>;

    /// Look up a user by name (`NO_SUCH_USER` when absent).
    fn get_user(&mut self, name: &str) -> DmResult<UserInfo>;

    /// Look up a user by uid.
    fn get_user_by_uid(&mut self, uid: u32) -> DmResult<UserInfo>;

    /// Create a user, atomically allocating a fresh uid.
    fn new_user(&mut self, name: &str, ca: &str) -> DmResult<UserInfo>;

    /// Look up a group by name (`NO_SUCH_GROUP` when absent).
    fn get_group(&mut self, name: &str) -> DmResult<GroupInfo>;

    /// Look up a group by gid.
    fn get_group_by_gid(&mut self, gid: u32) -> DmResult<GroupInfo>;

    /// Create a group, atomically allocating a fresh gid.
    fn new_group(&mut self, name: &str) -> DmResult<GroupInfo>;

    /// Map `(client name, fqans)` to a user and its ordered group list,
    /// allocating both when first seen.
    fn get_id_map(
        &mut self,
        user_name: &str,
        group_names: &[String],
    ) -> DmResult<(UserInfo, Vec<GroupInfo>)>;
}
