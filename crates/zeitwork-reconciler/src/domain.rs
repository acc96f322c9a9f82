use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::error::ResolveErrorKind;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use zeitwork_core::token;
use zeitwork_db::domains::DomainStore;
use zeitwork_db::notify;

use crate::kernel::Reconcile;

/// Cadence of TXT re-checks for a still-unverified domain. One lookup per
/// domain per reconcile tick.
const VERIFY_POLL: Duration = Duration::from_secs(60);

/// DNS TXT lookup seam, so verification logic is testable without the
/// network.
#[async_trait]
pub trait TxtResolver: Send + Sync + 'static {
    /// TXT record values at `name`. A missing record is an empty Vec, not
    /// an error; errors are transient resolver failures.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>>;
}

/// Production resolver using the system DNS configuration.
pub struct DnsTxtResolver {
    resolver: TokioAsyncResolver,
}

impl DnsTxtResolver {
    pub fn from_system() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .with_context(|| "Failed to initialize DNS resolver from system config")?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl TxtResolver for DnsTxtResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>> {
        match self.resolver.txt_lookup(name.to_string()).await {
            Ok(lookup) => Ok(lookup.iter().map(|txt| txt.to_string()).collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(vec![]),
            Err(e) => Err(e).with_context(|| format!("TXT lookup failed for {}", name)),
        }
    }
}

/// Whether any published TXT value matches the expected token.
pub fn txt_matches(records: &[String], expected: &str) -> bool {
    records.iter().any(|r| r.trim() == expected)
}

/// Verifies domain ownership via the per-domain TXT challenge and marks
/// platform subdomains verified outright.
pub struct DomainReconciler<R: TxtResolver> {
    pool: PgPool,
    domains: DomainStore,
    resolver: R,
    base_domain: String,
    platform_secret: String,
}

impl<R: TxtResolver> DomainReconciler<R> {
    pub fn new(pool: PgPool, resolver: R, base_domain: String, platform_secret: String) -> Self {
        Self {
            domains: DomainStore::new(pool.clone()),
            pool,
            resolver,
            base_domain,
            platform_secret,
        }
    }
}

impl<R: TxtResolver> Reconcile for DomainReconciler<R> {
    fn name(&self) -> &'static str {
        "domain"
    }

    async fn reconcile(&self, id: Uuid) -> Result<Option<Duration>> {
        let Some(domain) = self.domains.get(id).await? else {
            return Ok(None);
        };
        if domain.deleted_at.is_some() || domain.verified_at.is_some() {
            return Ok(None);
        }

        if domain.is_platform_subdomain(&self.base_domain) {
            if self.domains.mark_verified(id).await? {
                info!(domain = %domain.name, "Platform subdomain auto-verified");
                notify::publish(&self.pool, notify::ROUTES_CHANNEL).await?;
            }
            return Ok(None);
        }

        let record_name = token::verification_record_name(&domain.id, &domain.name);
        let expected = token::verification_token(&domain.id, &self.platform_secret);

        let records = self.resolver.lookup_txt(&record_name).await?;
        if txt_matches(&records, &expected) {
            if self.domains.mark_verified(id).await? {
                info!(domain = %domain.name, "Domain verified via TXT record");
                notify::publish(&self.pool, notify::ROUTES_CHANNEL).await?;
            }
            Ok(None)
        } else {
            debug!(
                domain = %domain.name,
                record = %record_name,
                found = records.len(),
                "TXT verification not yet satisfied"
            );
            Ok(Some(VERIFY_POLL))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txt_matches_exact_value() {
        let expected = "zeitwork-verify=abc123";
        assert!(txt_matches(&["zeitwork-verify=abc123".to_string()], expected));
        assert!(txt_matches(
            &["other".to_string(), " zeitwork-verify=abc123 ".to_string()],
            expected
        ));
        assert!(!txt_matches(&["zeitwork-verify=zzz".to_string()], expected));
        assert!(!txt_matches(&[], expected));
    }

    struct FakeResolver {
        records: Vec<String>,
    }

    #[async_trait]
    impl TxtResolver for FakeResolver {
        async fn lookup_txt(&self, _name: &str) -> Result<Vec<String>> {
            Ok(self.records.clone())
        }
    }

    #[tokio::test]
    async fn test_fake_resolver_plumbs_through() {
        let resolver = FakeResolver {
            records: vec!["a".to_string()],
        };
        let records = resolver.lookup_txt("x.example.com").await.unwrap();
        assert_eq!(records, vec!["a"]);
    }
}
