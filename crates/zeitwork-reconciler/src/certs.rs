use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeDelta, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use zeitwork_db::cert_store::{CertLockStore, CertStore};
use zeitwork_db::domains::DomainStore;
use zeitwork_db::notify;

/// Cadence of the renewal sweep.
const CHECK_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// TTL of the issuance lock; generously above any single issuance.
const ISSUANCE_LOCK_TTL_SECS: u32 = 120;

/// One issued certificate, PEM-encoded, ready for the store.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub expires_at: DateTime<Utc>,
}

/// Certificate issuance capability. `local` is the in-tree self-signed
/// runtime for development; production runtimes (ACME) implement the same
/// contract and serialize through the shared TTL lock.
#[async_trait]
pub trait Issuer: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn issue(&self, names: &[String]) -> Result<IssuedCert>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Self-signed issuance for development and single-node setups.
pub struct SelfSignedIssuer {
    pub validity_days: i64,
}

impl Default for SelfSignedIssuer {
    fn default() -> Self {
        Self { validity_days: 90 }
    }
}

#[async_trait]
impl Issuer for SelfSignedIssuer {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn issue(&self, names: &[String]) -> Result<IssuedCert> {
        let expires_at = Utc::now() + TimeDelta::days(self.validity_days);

        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(names.to_vec())?;
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            names.first().map(String::as_str).unwrap_or("zeitwork"),
        );
        dn.push(DnType::OrganizationName, "zeitwork");
        params.distinguished_name = dn;
        params.not_after = rcgen::date_time_ymd(
            expires_at.year(),
            expires_at.month() as u8,
            expires_at.day() as u8,
        );

        let cert = params.self_signed(&key)?;

        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            expires_at,
        })
    }
}

/// Store key of a certificate's PEM chain.
pub fn cert_key(slug: &str) -> String {
    format!("certs/{}/cert.pem", slug)
}

/// Store key of a certificate's private key PEM.
pub fn key_key(slug: &str) -> String {
    format!("certs/{}/key.pem", slug)
}

/// Store slug for a custom domain's certificate.
pub fn domain_slug(name: &str) -> String {
    format!("domains/{}", name)
}

/// Whether a stored certificate is due for renewal.
pub fn needs_renewal(
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    renew_before: TimeDelta,
) -> bool {
    match expires_at {
        Some(expiry) => expiry - now < renew_before,
        // No recorded expiry: leave it alone.
        None => false,
    }
}

/// Background worker keeping the wildcard and every verified custom-domain
/// certificate present and fresh in the store.
pub struct CertManager<I: Issuer> {
    pool: PgPool,
    certs: CertStore,
    locks: CertLockStore,
    domains: DomainStore,
    issuer: I,
    base_domain: String,
    renew_before: TimeDelta,
    /// Identity under which this replica takes issuance locks.
    holder: Uuid,
}

impl<I: Issuer> CertManager<I> {
    pub fn new(pool: PgPool, issuer: I, base_domain: String, renew_before_days: i64) -> Self {
        Self {
            certs: CertStore::new(pool.clone()),
            locks: CertLockStore::new(pool.clone()),
            domains: DomainStore::new(pool.clone()),
            pool,
            issuer,
            base_domain,
            renew_before: TimeDelta::days(renew_before_days),
            holder: zeitwork_core::ids::new_id(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => {
                    info!("Certificate manager stopping");
                    return;
                }
            }
            if let Err(e) = self.ensure_all().await {
                error!(error = %e, "Certificate sweep failed");
            }
        }
    }

    /// One sweep: wildcard first, then every verified custom domain not
    /// covered by it.
    pub async fn ensure_all(&self) -> Result<()> {
        let wildcard_names = vec![
            format!("*.{}", self.base_domain),
            self.base_domain.clone(),
        ];
        self.ensure_cert("wildcard", &wildcard_names).await?;

        for name in self.domains.verified_custom_names(&self.base_domain).await? {
            self.ensure_cert(&domain_slug(&name), std::slice::from_ref(&name))
                .await?;
        }
        Ok(())
    }

    async fn ensure_cert(&self, slug: &str, names: &[String]) -> Result<()> {
        let existing = self.certs.get(&cert_key(slug)).await?;
        let due = match &existing {
            None => true,
            Some(rec) => needs_renewal(rec.expires_at, Utc::now(), self.renew_before),
        };
        if !due {
            return Ok(());
        }

        // Serialize issuance across replicas; losing the lock means another
        // replica is already renewing this certificate.
        let lock_key = format!("issuance/{}", slug);
        if !self
            .locks
            .try_acquire(&lock_key, self.holder, ISSUANCE_LOCK_TTL_SECS)
            .await?
        {
            return Ok(());
        }

        let outcome = async {
            let issued = self
                .issuer
                .issue(names)
                .await
                .with_context(|| format!("Issuance failed for {:?}", names))?;

            self.certs
                .put(&cert_key(slug), issued.cert_pem.as_bytes(), Some(issued.expires_at))
                .await?;
            self.certs
                .put(&key_key(slug), issued.key_pem.as_bytes(), Some(issued.expires_at))
                .await?;

            info!(
                slug,
                issuer = self.issuer.name(),
                expires = %issued.expires_at,
                "Certificate issued"
            );
            notify::publish(&self.pool, notify::CERTS_CHANNEL).await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        self.locks.release(&lock_key, self.holder).await?;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_self_signed_issuer_produces_pem() {
        let issuer = SelfSignedIssuer { validity_days: 30 };
        let issued = issuer
            .issue(&["*.zeitwork.app".to_string(), "zeitwork.app".to_string()])
            .await
            .unwrap();

        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("PRIVATE KEY"));
        let days_left = (issued.expires_at - Utc::now()).num_days();
        assert!((28..=31).contains(&days_left), "got {} days", days_left);
    }

    #[test]
    fn test_needs_renewal_window() {
        let now = Utc::now();
        let renew_before = TimeDelta::days(30);
        assert!(!needs_renewal(Some(now + TimeDelta::days(60)), now, renew_before));
        assert!(needs_renewal(Some(now + TimeDelta::days(29)), now, renew_before));
        assert!(needs_renewal(Some(now - TimeDelta::days(1)), now, renew_before));
        assert!(!needs_renewal(None, now, renew_before));
    }

    #[test]
    fn test_store_key_layout() {
        assert_eq!(cert_key("wildcard"), "certs/wildcard/cert.pem");
        assert_eq!(key_key("wildcard"), "certs/wildcard/key.pem");
        assert_eq!(
            cert_key(&domain_slug("shop.example.com")),
            "certs/domains/shop.example.com/cert.pem"
        );
    }
}
