//! Read authorization for stored files.
//!
//! Rules, first match wins: the owner may read, the administrative role may
//! read, a role granted one of the file's tags may read, everyone else is
//! denied. Rule lookups that fail deny.

use tracing::warn;

use crate::{
    models::{access::Principal, file::FileMetadata},
    repository::FileRepository,
};

/// Why a read was allowed, or that it was not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Owner,
    Admin,
    TagRule,
    Denied,
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        !matches!(self, AccessDecision::Denied)
    }
}

#[derive(Debug, Clone)]
pub struct AccessResolver {
    admin_role: String,
}

impl AccessResolver {
    pub fn new(admin_role: impl Into<String>) -> Self {
        Self {
            admin_role: admin_role.into(),
        }
    }

    /// Evaluate the rules against current metadata. Nothing is cached, so a
    /// rule change applies to the very next request.
    pub async fn check(
        &self,
        repo: &dyn FileRepository,
        file: &FileMetadata,
        principal: &Principal,
    ) -> AccessDecision {
        if file.owner_id.as_deref() == Some(principal.id.as_str()) {
            return AccessDecision::Owner;
        }
        if principal.role == self.admin_role {
            return AccessDecision::Admin;
        }
        if file.tags.is_empty() {
            return AccessDecision::Denied;
        }
        match repo.has_role_access(file.id, &principal.role).await {
            Ok(true) => AccessDecision::TagRule,
            Ok(false) => AccessDecision::Denied,
            Err(err) => {
                warn!(
                    file_id = %file.id,
                    role = %principal.role,
                    error = %err,
                    "access rule lookup failed; denying"
                );
                AccessDecision::Denied
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::file::normalize_tags, testing::MemoryFileRepository};
    use chrono::Utc;
    use uuid::Uuid;

    fn file(owner: Option<&str>, tags: &[&str]) -> FileMetadata {
        let id = Uuid::new_v4();
        FileMetadata {
            id,
            original_name: "report.pdf".into(),
            storage_key: format!("{}.pdf", id),
            mime_type: "application/pdf".into(),
            size_bytes: 10,
            owner_id: owner.map(str::to_string),
            tags: normalize_tags(tags.iter().copied()),
            created_at: Utc::now(),
        }
    }

    async fn setup(f: &FileMetadata) -> MemoryFileRepository {
        let repo = MemoryFileRepository::default();
        repo.insert(f.clone());
        repo.grant("invoice", "finance");
        repo
    }

    #[tokio::test]
    async fn owner_is_allowed_even_without_tags() {
        let f = file(Some("u1"), &[]);
        let repo = setup(&f).await;
        let decision = AccessResolver::new("admin")
            .check(&repo, &f, &Principal::new("u1", "user"))
            .await;
        assert_eq!(decision, AccessDecision::Owner);
    }

    #[tokio::test]
    async fn admin_is_allowed_on_any_file() {
        let f = file(Some("u1"), &["invoice"]);
        let repo = setup(&f).await;
        let decision = AccessResolver::new("admin")
            .check(&repo, &f, &Principal::new("root", "admin"))
            .await;
        assert_eq!(decision, AccessDecision::Admin);
    }

    #[tokio::test]
    async fn matching_tag_rule_allows() {
        let f = file(Some("u1"), &["invoice"]);
        let repo = setup(&f).await;
        let decision = AccessResolver::new("admin")
            .check(&repo, &f, &Principal::new("u2", "finance"))
            .await;
        assert_eq!(decision, AccessDecision::TagRule);
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn everyone_else_is_denied() {
        let tagged = file(Some("u1"), &["invoice"]);
        let repo = setup(&tagged).await;
        let resolver = AccessResolver::new("admin");
        assert_eq!(
            resolver
                .check(&repo, &tagged, &Principal::new("u2", "user"))
                .await,
            AccessDecision::Denied
        );

        // Untagged files never consult the rule table.
        let untagged = file(Some("u1"), &[]);
        repo.insert(untagged.clone());
        repo.fail_access_lookups(true);
        let lookups_before = repo.access_lookups();
        assert_eq!(
            resolver
                .check(&repo, &untagged, &Principal::new("u2", "finance"))
                .await,
            AccessDecision::Denied
        );
        assert_eq!(repo.access_lookups(), lookups_before);
    }

    #[tokio::test]
    async fn system_owned_file_is_not_readable_by_arbitrary_user() {
        let f = file(None, &[]);
        let repo = setup(&f).await;
        let decision = AccessResolver::new("admin")
            .check(&repo, &f, &Principal::new("", "user"))
            .await;
        assert_eq!(decision, AccessDecision::Denied);
    }

    #[tokio::test]
    async fn lookup_failure_fails_closed() {
        let f = file(Some("u1"), &["invoice"]);
        let repo = setup(&f).await;
        repo.fail_access_lookups(true);
        let decision = AccessResolver::new("admin")
            .check(&repo, &f, &Principal::new("u2", "finance"))
            .await;
        assert_eq!(decision, AccessDecision::Denied);
    }

    #[tokio::test]
    async fn rule_changes_apply_immediately() {
        let f = file(Some("u1"), &["hr"]);
        let repo = setup(&f).await;
        let resolver = AccessResolver::new("admin");
        let who = Principal::new("u3", "people-ops");
        assert_eq!(resolver.check(&repo, &f, &who).await, AccessDecision::Denied);
        repo.grant("hr", "people-ops");
        assert_eq!(resolver.check(&repo, &f, &who).await, AccessDecision::TagRule);
    }
}
