//! Role hierarchy and permission resolution.
//!
//! Flow Overview: roles are parsed once at the trust boundary (token decode,
//! store read) into a closed enum. Two disjoint hierarchies exist: staff
//! (platform operators) and tenant (scoped to one merchant). Each action names
//! the minimum role that may perform it; lower hierarchy index means more
//! authority.
//!
//! Staff override: any staff role may perform every tenant-scoped action. Platform
//! support must be able to act on a merchant's behalf, so this is intentional.
//! Destructive tenant actions (`WITHDRAW_FUNDS`) are still covered by the override.

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Staff hierarchy, highest authority first.
pub const STAFF_HIERARCHY: [Role; 3] = [
    Role::SuperAdmin,
    Role::PlatformManager,
    Role::PlatformSupport,
];

/// Tenant hierarchy, owner first.
pub const TENANT_HIERARCHY: [Role; 3] = [Role::Owner, Role::Admin, Role::Agent];

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    PlatformManager,
    PlatformSupport,
    Owner,
    Admin,
    Agent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Staff(usize),
    Tenant(usize),
}

impl Role {
    pub const ALL: [Self; 6] = [
        Self::SuperAdmin,
        Self::PlatformManager,
        Self::PlatformSupport,
        Self::Owner,
        Self::Admin,
        Self::Agent,
    ];

    /// Parse a raw role string, accepting any casing and `-` separators.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "super_admin" => Some(Self::SuperAdmin),
            "platform_manager" => Some(Self::PlatformManager),
            "platform_support" => Some(Self::PlatformSupport),
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::PlatformManager => "platform_manager",
            Self::PlatformSupport => "platform_support",
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Agent => "agent",
        }
    }

    /// Position of the role inside its hierarchy.
    #[must_use]
    pub const fn tier(self) -> Tier {
        match self {
            Self::SuperAdmin => Tier::Staff(0),
            Self::PlatformManager => Tier::Staff(1),
            Self::PlatformSupport => Tier::Staff(2),
            Self::Owner => Tier::Tenant(0),
            Self::Admin => Tier::Tenant(1),
            Self::Agent => Tier::Tenant(2),
        }
    }

    #[must_use]
    pub const fn is_staff(self) -> bool {
        matches!(self.tier(), Tier::Staff(_))
    }

    /// Whether this role may perform `action`.
    #[must_use]
    pub fn can(self, action: Action) -> bool {
        match (self.tier(), action.required_role().tier()) {
            (Tier::Staff(have), Tier::Staff(need)) | (Tier::Tenant(have), Tier::Tenant(need)) => {
                have <= need
            }
            (Tier::Staff(_), Tier::Tenant(_)) => true,
            (Tier::Tenant(_), Tier::Staff(_)) => false,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed action table. Serialized names match the wire codes used by clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    SystemConfig,
    ManageStaff,
    ManageMerchants,
    RevokeSessions,
    ViewPlatformAnalytics,
    ViewMerchants,
    HandleSupportTickets,
    WithdrawFunds,
    ManageTeam,
    ManageBilling,
    ManageSubscriptions,
    ManageServices,
    ManageCoupons,
    ViewDashboard,
    ViewCustomers,
    ReplyCustomers,
}

impl Action {
    pub const ALL: [Self; 16] = [
        Self::SystemConfig,
        Self::ManageStaff,
        Self::ManageMerchants,
        Self::RevokeSessions,
        Self::ViewPlatformAnalytics,
        Self::ViewMerchants,
        Self::HandleSupportTickets,
        Self::WithdrawFunds,
        Self::ManageTeam,
        Self::ManageBilling,
        Self::ManageSubscriptions,
        Self::ManageServices,
        Self::ManageCoupons,
        Self::ViewDashboard,
        Self::ViewCustomers,
        Self::ReplyCustomers,
    ];

    /// Minimum role required for the action.
    #[must_use]
    pub const fn required_role(self) -> Role {
        match self {
            Self::SystemConfig | Self::ManageStaff => Role::SuperAdmin,
            Self::ManageMerchants | Self::RevokeSessions | Self::ViewPlatformAnalytics => {
                Role::PlatformManager
            }
            Self::ViewMerchants | Self::HandleSupportTickets => Role::PlatformSupport,
            Self::WithdrawFunds | Self::ManageTeam | Self::ManageBilling => Role::Owner,
            Self::ManageSubscriptions | Self::ManageServices | Self::ManageCoupons => Role::Admin,
            Self::ViewDashboard | Self::ViewCustomers | Self::ReplyCustomers => Role::Agent,
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let code = raw.trim().to_ascii_uppercase();
        Self::ALL.into_iter().find(|action| action.code() == code)
    }

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::SystemConfig => "SYSTEM_CONFIG",
            Self::ManageStaff => "MANAGE_STAFF",
            Self::ManageMerchants => "MANAGE_MERCHANTS",
            Self::RevokeSessions => "REVOKE_SESSIONS",
            Self::ViewPlatformAnalytics => "VIEW_PLATFORM_ANALYTICS",
            Self::ViewMerchants => "VIEW_MERCHANTS",
            Self::HandleSupportTickets => "HANDLE_SUPPORT_TICKETS",
            Self::WithdrawFunds => "WITHDRAW_FUNDS",
            Self::ManageTeam => "MANAGE_TEAM",
            Self::ManageBilling => "MANAGE_BILLING",
            Self::ManageSubscriptions => "MANAGE_SUBSCRIPTIONS",
            Self::ManageServices => "MANAGE_SERVICES",
            Self::ManageCoupons => "MANAGE_COUPONS",
            Self::ViewDashboard => "VIEW_DASHBOARD",
            Self::ViewCustomers => "VIEW_CUSTOMERS",
            Self::ReplyCustomers => "REPLY_CUSTOMERS",
        }
    }
}

/// String-level permission check for raw inputs. Unknown roles or actions deny.
#[must_use]
pub fn has_permission(role: &str, action: &str) -> bool {
    match (Role::parse(role), Action::parse(action)) {
        (Some(role), Some(action)) => role.can(action),
        _ => false,
    }
}
