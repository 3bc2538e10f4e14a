use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Portal roles, lowest privilege first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Donor,
    Volunteer,
    Member,
    Admin,
}

impl Role {
    /// Highest precedence first.
    pub const PRECEDENCE: [Role; 5] = [Role::Admin, Role::Member, Role::Volunteer, Role::Donor, Role::Viewer];

    /// Position in the hierarchy: viewer 0 up to admin 4.
    pub fn rank(self) -> u8 {
        match self {
            Role::Viewer => 0,
            Role::Donor => 1,
            Role::Volunteer => 2,
            Role::Member => 3,
            Role::Admin => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Donor => "donor",
            Role::Volunteer => "volunteer",
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }

    /// True when this role ranks at or above `required`.
    pub fn satisfies(self, required: Role) -> bool {
        self.rank() >= required.rank()
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl Display for UnknownRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown role '{}'", self.0)
    }
}

impl std::error::Error for UnknownRole {}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "donor" => Ok(Role::Donor),
            "volunteer" => Ok(Role::Volunteer),
            "member" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// Role flags as returned by the `get_user_roles` RPC. Absent flags are false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet {
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_member: bool,
    #[serde(default)]
    pub is_volunteer: bool,
    #[serde(default)]
    pub is_donor: bool,
    #[serde(default)]
    pub is_viewer: bool,
}

impl RoleSet {
    /// Least-privileged set used when roles cannot be fetched.
    pub fn least_privileged() -> Self {
        RoleSet { is_viewer: true, ..Default::default() }
    }

    pub fn from_roles<I: IntoIterator<Item = Role>>(roles: I) -> Self {
        let mut set = RoleSet::default();
        for r in roles {
            match r {
                Role::Admin => set.is_admin = true,
                Role::Member => set.is_member = true,
                Role::Volunteer => set.is_volunteer = true,
                Role::Donor => set.is_donor = true,
                Role::Viewer => set.is_viewer = true,
            }
        }
        set
    }

    /// Viewer is held implicitly by every authenticated user.
    pub fn holds(&self, role: Role) -> bool {
        match role {
            Role::Admin => self.is_admin,
            Role::Member => self.is_member,
            Role::Volunteer => self.is_volunteer,
            Role::Donor => self.is_donor,
            Role::Viewer => true,
        }
    }

    /// Held roles, highest precedence first; always ends with viewer.
    pub fn held(&self) -> Vec<Role> {
        Role::PRECEDENCE.iter().copied().filter(|r| self.holds(*r)).collect()
    }

    pub fn highest(&self) -> Role {
        Role::PRECEDENCE.iter().copied().find(|r| self.holds(*r)).unwrap_or(Role::Viewer)
    }

    /// Admin always wins; otherwise a held override, otherwise the highest held role.
    pub fn effective_role(&self, active: Option<Role>) -> Role {
        if self.is_admin {
            return Role::Admin;
        }
        match active {
            Some(r) if self.holds(r) => r,
            _ => self.highest(),
        }
    }
}
