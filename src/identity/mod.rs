//! Identity, sessions and role-based access for the portal.
//! Keep the public surface thin and split implementation across sub-modules.

mod role;
mod cache;
mod resolver;
mod session;
mod context;

pub use role::{Role, RoleSet, UnknownRole};
pub use cache::{CachedRoles, RoleCache};
pub use resolver::{RetryPolicy, RoleResolver, RoleSource};
pub use session::{Session, SessionError, SessionId, SessionManager, REFRESH_MARGIN_SECS};
pub use context::{decode_active_role, encode_active_role, AuthContext, SessionView};
