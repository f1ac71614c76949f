/// Invite grant and entitlement types
///
/// A grant is a single-use, time-boxed 6-digit code offering one email access to
/// one workflow. An entitlement is the durable access record left behind once a
/// grant is redeemed (or access is handed out administratively).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
    Pending,
    Accepted,
    Expired,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantStatus::Pending => "pending",
            GrantStatus::Accepted => "accepted",
            GrantStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(GrantStatus::Pending),
            "accepted" => Some(GrantStatus::Accepted),
            "expired" => Some(GrantStatus::Expired),
            _ => None,
        }
    }
}

/// Single-use invitation to one workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteGrant {
    /// Human-typeable 6-digit numeric code
    pub code: String,
    pub workflow_id: String,
    /// Lower-cased target email
    pub email: String,
    pub status: GrantStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Identity that redeemed the grant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_by: Option<String>,
}

impl InviteGrant {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementRole {
    Viewer,
    Participant,
}

impl EntitlementRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementRole::Viewer => "viewer",
            EntitlementRole::Participant => "participant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "viewer" => Some(EntitlementRole::Viewer),
            "participant" => Some(EntitlementRole::Participant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementStatus {
    Pending,
    Active,
}

impl EntitlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementStatus::Pending => "pending",
            EntitlementStatus::Active => "active",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EntitlementStatus::Pending),
            "active" => Some(EntitlementStatus::Active),
            _ => None,
        }
    }
}

/// Durable access record for one (workflow, identity) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEntitlement {
    pub workflow_id: String,
    pub identity: String,
    pub role: EntitlementRole,
    pub status: EntitlementStatus,
    /// Code of the grant this entitlement came from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<String>,
}

/// Product-level role carried by a verified identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserRole {
    Admin,
    Manager,
    NewHire,
}

impl UserRole {
    /// Admins and managers see every workflow without an entitlement
    pub fn bypasses_entitlements(&self) -> bool {
        matches!(self, UserRole::Admin | UserRole::Manager)
    }
}

/// Verified subject of a bearer credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub role: UserRole,
}

/// Lower-case and trim an email for comparisons and keys
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
