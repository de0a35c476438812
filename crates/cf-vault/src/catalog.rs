//! Permission catalog partitioning
//!
//! Splits the live permission group catalog into read/write buckets for
//! each of the three resource scopes a token policy can target. Effect is
//! derived from the group name ("... Read" / "... Write"), which is how the
//! upstream catalog names things; [`classify`] is the only place that
//! relies on it.

use cf_vault_core::PermissionGroup;
use tracing::debug;

use crate::api::CatalogEntry;

/// Group that would let a minted token mint further tokens. Never granted.
pub const TOKEN_MINTING_GROUP: &str = "API Tokens Write";

/// Scope marker for zone-level groups
pub const ZONE_SCOPE: &str = "com.cloudflare.api.account.zone";

/// Scope marker for account-level groups
pub const ACCOUNT_SCOPE: &str = "com.cloudflare.api.account";

/// Scope marker for user-level groups
pub const USER_SCOPE: &str = "com.cloudflare.api.user";

/// What a permission group lets a token do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Classify a catalog entry by effect. `None` means it is never granted.
pub fn classify(entry: &CatalogEntry) -> Option<Access> {
    if entry.name == TOKEN_MINTING_GROUP {
        return None;
    }

    if entry.name.ends_with("Read") {
        Some(Access::Read)
    } else if entry.name.ends_with("Write") {
        Some(Access::Write)
    } else {
        None
    }
}

/// Catalog split by effect and scope, each bucket in catalog order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Buckets {
    pub zone_read: Vec<PermissionGroup>,
    pub zone_write: Vec<PermissionGroup>,
    pub account_read: Vec<PermissionGroup>,
    pub account_write: Vec<PermissionGroup>,
    pub user_read: Vec<PermissionGroup>,
    pub user_write: Vec<PermissionGroup>,
}

impl Buckets {
    pub fn account(&self, access: Access) -> &[PermissionGroup] {
        match access {
            Access::Read => &self.account_read,
            Access::Write => &self.account_write,
        }
    }

    pub fn zone(&self, access: Access) -> &[PermissionGroup] {
        match access {
            Access::Read => &self.zone_read,
            Access::Write => &self.zone_write,
        }
    }

    pub fn user(&self, access: Access) -> &[PermissionGroup] {
        match access {
            Access::Read => &self.user_read,
            Access::Write => &self.user_write,
        }
    }
}

/// Partition a catalog into the six buckets.
///
/// Scope tests are independent: a group listing both the zone and the
/// account scope lands in both buckets.
pub fn partition(catalog: &[CatalogEntry]) -> Buckets {
    let mut buckets = Buckets::default();

    for entry in catalog {
        let Some(access) = classify(entry) else {
            continue;
        };

        let has_scope = |scope: &str| entry.scopes.iter().any(|s| s == scope);
        let group = PermissionGroup::new(&entry.id, &entry.name);

        if has_scope(ZONE_SCOPE) {
            match access {
                Access::Read => buckets.zone_read.push(group.clone()),
                Access::Write => buckets.zone_write.push(group.clone()),
            }
        }
        if has_scope(ACCOUNT_SCOPE) {
            match access {
                Access::Read => buckets.account_read.push(group.clone()),
                Access::Write => buckets.account_write.push(group.clone()),
            }
        }
        if has_scope(USER_SCOPE) {
            match access {
                Access::Read => buckets.user_read.push(group),
                Access::Write => buckets.user_write.push(group),
            }
        }
    }

    debug!(
        "partitioned {} groups: zone {}r/{}w, account {}r/{}w, user {}r/{}w",
        catalog.len(),
        buckets.zone_read.len(),
        buckets.zone_write.len(),
        buckets.account_read.len(),
        buckets.account_write.len(),
        buckets.user_read.len(),
        buckets.user_write.len(),
    );

    buckets
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn entry(id: &str, name: &str, scopes: &[&str]) -> CatalogEntry {
        CatalogEntry {
            id: id.to_string(),
            name: name.to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// A trimmed-down copy of the real catalog shape
    pub(crate) fn sample_catalog() -> Vec<CatalogEntry> {
        vec![
            entry("82e64a83", "DNS Read", &[ZONE_SCOPE]),
            entry("4755a26e", "DNS Write", &[ZONE_SCOPE]),
            entry("c8fed203", "Zone Read", &[ZONE_SCOPE, ACCOUNT_SCOPE]),
            entry("e6d26661", "Zone Write", &[ZONE_SCOPE, ACCOUNT_SCOPE]),
            entry("1a71c399", "Workers Scripts Read", &[ACCOUNT_SCOPE]),
            entry("e086da7e", "Workers Scripts Write", &[ACCOUNT_SCOPE]),
            entry("e17beae8", "Cache Purge", &[ZONE_SCOPE]),
            entry("0cc3a617", "API Tokens Read", &[USER_SCOPE]),
            entry("686d18d5", "API Tokens Write", &[USER_SCOPE]),
            entry("8acbe5bb", "User Details Read", &[USER_SCOPE]),
            entry("55a5e17c", "User Details Write", &[USER_SCOPE]),
            entry("0000orph", "Orphan Read", &[]),
        ]
    }

    fn ids(groups: &[PermissionGroup]) -> Vec<&str> {
        groups.iter().map(|g| g.id.as_str()).collect()
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&entry("1", "DNS Read", &[])), Some(Access::Read));
        assert_eq!(classify(&entry("2", "DNS Write", &[])), Some(Access::Write));
        assert_eq!(classify(&entry("3", "Cache Purge", &[])), None);
        assert_eq!(classify(&entry("4", TOKEN_MINTING_GROUP, &[])), None);
        // Suffix match only
        assert_eq!(classify(&entry("5", "Read Replicas Admin", &[])), None);
    }

    #[test]
    fn test_partition_buckets() {
        let buckets = partition(&sample_catalog());

        assert_eq!(ids(&buckets.zone_read), vec!["82e64a83", "c8fed203"]);
        assert_eq!(ids(&buckets.zone_write), vec!["4755a26e", "e6d26661"]);
        assert_eq!(ids(&buckets.account_read), vec!["c8fed203", "1a71c399"]);
        assert_eq!(ids(&buckets.account_write), vec!["e6d26661", "e086da7e"]);
        assert_eq!(ids(&buckets.user_read), vec!["0cc3a617", "8acbe5bb"]);
        assert_eq!(ids(&buckets.user_write), vec!["55a5e17c"]);
    }

    #[test]
    fn test_token_minting_group_excluded() {
        let buckets = partition(&sample_catalog());
        for access in [Access::Read, Access::Write] {
            for bucket in [buckets.account(access), buckets.zone(access), buckets.user(access)] {
                assert!(bucket
                    .iter()
                    .all(|g| g.name.as_deref() != Some(TOKEN_MINTING_GROUP)));
            }
        }
    }

    #[test]
    fn test_read_and_write_disjoint_per_scope() {
        let buckets = partition(&sample_catalog());
        let pairs = [
            (&buckets.zone_read, &buckets.zone_write),
            (&buckets.account_read, &buckets.account_write),
            (&buckets.user_read, &buckets.user_write),
        ];
        for (read, write) in pairs {
            for group in read.iter() {
                assert!(!write.iter().any(|w| w.id == group.id));
            }
        }
    }

    #[test]
    fn test_no_duplicates_within_bucket() {
        let buckets = partition(&sample_catalog());
        for bucket in [&buckets.zone_read, &buckets.account_read, &buckets.account_write] {
            let mut seen = ids(bucket);
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), bucket.len());
        }
    }

    #[test]
    fn test_empty_catalog() {
        assert_eq!(partition(&[]), Buckets::default());
    }
}
