//! The user profile derived from a verified identity token

use serde::{Deserialize, Serialize};

use crate::IdentityClaims;

/// The tenant the user is currently signed into
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantInfo {
    /// Tenant ID
    pub id: String,
    /// Display name
    pub name: Option<String>,
    /// Preferred locale of the tenant
    pub locale: Option<String>,
    /// URL of the tenant's logo
    pub logo: Option<String>,
    /// Whether the tenant has completed onboarding
    pub onboarded: Option<bool>,
}

/// The signed-in user
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Profile {
    /// The user's ID, from the `sub` claim
    pub id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub full_name: Option<String>,
    pub family_name: Option<String>,
    pub given_name: Option<String>,
    pub locale: Option<String>,
    pub onboarded: Option<bool>,
    pub multi_tenant_access: Option<bool>,
    /// Present only when the token names a tenant
    pub tenant: Option<TenantInfo>,
}

impl Profile {
    /// Whether the user has completed onboarding, `false` when unknown
    pub fn is_onboarded(&self) -> bool {
        self.onboarded.unwrap_or(false)
    }

    /// Whether the user may switch tenants, `false` when unknown
    pub fn has_multi_tenant_access(&self) -> bool {
        self.multi_tenant_access.unwrap_or(false)
    }
}

impl From<IdentityClaims> for Profile {
    fn from(claims: IdentityClaims) -> Self {
        let tenant = claims.tenant_id.map(|id| TenantInfo {
            id,
            name: claims.tenant_name,
            locale: claims.tenant_locale,
            logo: claims.tenant_logo,
            onboarded: claims.tenant_onboarded,
        });

        Self {
            id: claims.sub.map(|s| s.take()).unwrap_or_default(),
            username: claims.preferred_username,
            email: claims.email,
            email_verified: claims.email_verified,
            full_name: claims.name,
            family_name: claims.family_name,
            given_name: claims.given_name,
            locale: claims.locale,
            onboarded: claims.onboarded,
            multi_tenant_access: claims.multi_tenant,
            tenant,
        }
    }
}
