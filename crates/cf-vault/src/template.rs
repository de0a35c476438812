//! Policy templates
//!
//! A template turns the partitioned catalog into exactly three policies:
//! account-wide, all zones in the account, and the caller's own user. The
//! result is stored in the profile when it is added and reused verbatim for
//! every session afterwards.

use cf_vault_core::Policy;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::api::{ApiError, CloudflareApi};
use crate::catalog::{self, Access, Buckets};

/// Resource pattern covering every account the caller belongs to
pub const ACCOUNT_RESOURCE: &str = "com.cloudflare.api.account.*";

/// Resource pattern covering every zone in those accounts
pub const ZONE_RESOURCE: &str = "com.cloudflare.api.account.zone.*";

/// Template errors
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("unable to generate policy for {0:?}, valid policy names: [read-only, write-everything]")]
    UnknownTemplate(String),

    #[error(
        "failed to fetch user ID from the Cloudflare API which is required to generate the \
         predefined short lived token policies. If you are using API tokens, please allow the \
         permission to access your user details and try again"
    )]
    UserLookup(#[source] ApiError),

    #[error("failed to fetch the permission group catalog: {0}")]
    Catalog(#[source] ApiError),
}

/// Named policy recipes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    ReadOnly,
    WriteEverything,
}

impl Template {
    pub const ALL: [Template; 2] = [Template::ReadOnly, Template::WriteEverything];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::WriteEverything => "write-everything",
        }
    }

    fn access(&self) -> Access {
        match self {
            Self::ReadOnly => Access::Read,
            Self::WriteEverything => Access::Write,
        }
    }
}

impl FromStr for Template {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PolicyError::UnknownTemplate(s.to_string()))
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource pattern for a single user's own resources
pub fn user_resource(user_id: &str) -> String {
    format!("com.cloudflare.api.user.{}", user_id)
}

/// Build the three policies for `template` from already partitioned buckets
pub fn synthesize(template: Template, buckets: &Buckets, user_id: &str) -> Vec<Policy> {
    let access = template.access();
    debug!("configuring a {} template", template);

    vec![
        Policy::allow(ACCOUNT_RESOURCE, buckets.account(access).iter().cloned()),
        Policy::allow(ZONE_RESOURCE, buckets.zone(access).iter().cloned()),
        Policy::allow(&user_resource(user_id), buckets.user(access).iter().cloned()),
    ]
}

/// Fetch the caller's identity and the live catalog, then synthesize
pub fn generate(api: &dyn CloudflareApi, template: Template) -> Result<Vec<Policy>, PolicyError> {
    let user_id = api.user_id().map_err(|e| {
        debug!("user lookup failed: {}", e);
        PolicyError::UserLookup(e)
    })?;
    let catalog = api.permission_groups().map_err(PolicyError::Catalog)?;

    let buckets = catalog::partition(&catalog);
    Ok(synthesize(template, &buckets, &user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CatalogEntry, TokenRequest};
    use crate::catalog::tests::{entry, sample_catalog};
    use crate::catalog::{ACCOUNT_SCOPE, TOKEN_MINTING_GROUP, ZONE_SCOPE};

    struct CatalogOnly {
        user: Result<String, ()>,
        catalog: Vec<CatalogEntry>,
    }

    impl CloudflareApi for CatalogOnly {
        fn user_id(&self) -> Result<String, ApiError> {
            self.user.clone().map_err(|_| ApiError::Rejected {
                status: 403,
                messages: vec![],
            })
        }

        fn permission_groups(&self) -> Result<Vec<CatalogEntry>, ApiError> {
            Ok(self.catalog.clone())
        }

        fn create_token(&self, _: &TokenRequest) -> Result<String, ApiError> {
            panic!("templates never mint tokens")
        }
    }

    #[test]
    fn test_parse_template() {
        assert_eq!("read-only".parse::<Template>().unwrap(), Template::ReadOnly);
        assert_eq!(
            "write-everything".parse::<Template>().unwrap(),
            Template::WriteEverything
        );

        let err = "admin".parse::<Template>().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("read-only"));
        assert!(message.contains("write-everything"));
    }

    #[test]
    fn test_policy_shape() {
        let buckets = catalog::partition(&sample_catalog());
        let policies = synthesize(Template::ReadOnly, &buckets, "u-123");

        assert_eq!(policies.len(), 3);
        assert!(policies[0].resources.contains_key(ACCOUNT_RESOURCE));
        assert!(policies[1].resources.contains_key(ZONE_RESOURCE));
        assert!(policies[2].resources.contains_key("com.cloudflare.api.user.u-123"));
        assert_eq!(policies[0].permission_groups, buckets.account_read);
        assert_eq!(policies[1].permission_groups, buckets.zone_read);
        assert_eq!(policies[2].permission_groups, buckets.user_read);
    }

    #[test]
    fn test_write_everything_is_subset_of_catalog() {
        let catalog = sample_catalog();
        let policies = synthesize(
            Template::WriteEverything,
            &catalog::partition(&catalog),
            "u-123",
        );

        for policy in &policies {
            for group in &policy.permission_groups {
                assert!(catalog.iter().any(|e| e.id == group.id));
                assert!(group.name.as_deref().is_some_and(|n| n.ends_with("Write")));
            }
        }
    }

    #[test]
    fn test_token_minting_group_never_granted() {
        let catalog = sample_catalog();
        let buckets = catalog::partition(&catalog);
        let minting_id = catalog
            .iter()
            .find(|e| e.name == TOKEN_MINTING_GROUP)
            .map(|e| e.id.clone())
            .unwrap();

        for template in Template::ALL {
            for policy in synthesize(template, &buckets, "u-123") {
                assert!(policy.permission_groups.iter().all(|g| g.id != minting_id));
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let buckets = catalog::partition(&sample_catalog());
        for template in Template::ALL {
            let first = serde_json::to_string(&synthesize(template, &buckets, "u-1")).unwrap();
            let second = serde_json::to_string(&synthesize(template, &buckets, "u-1")).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_generate_sparse_catalog() {
        let api = CatalogOnly {
            user: Ok("u-42".to_string()),
            catalog: vec![
                entry("acct-read", "Account Settings Read", &[ACCOUNT_SCOPE]),
                entry("zone-write", "DNS Write", &[ZONE_SCOPE]),
            ],
        };

        let policies = generate(&api, Template::ReadOnly).unwrap();
        assert_eq!(policies.len(), 3);
        assert_eq!(policies[0].permission_groups.len(), 1);
        assert_eq!(policies[0].permission_groups[0].id, "acct-read");
        assert!(policies[1].permission_groups.is_empty());
        assert!(policies[2].permission_groups.is_empty());
        assert!(policies[2].resources.contains_key("com.cloudflare.api.user.u-42"));
    }

    #[test]
    fn test_generate_user_lookup_failure() {
        let api = CatalogOnly {
            user: Err(()),
            catalog: sample_catalog(),
        };

        let result = generate(&api, Template::ReadOnly);
        assert!(matches!(result, Err(PolicyError::UserLookup(_))));
    }
}
