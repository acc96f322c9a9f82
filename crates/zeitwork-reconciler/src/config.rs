use anyhow::Result;

use zeitwork_core::env;

/// Control-plane daemon configuration, read once at startup. Missing
/// required variables abort the process with the variable name.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub database_url: String,
    /// Platform base domain; `*.<base_domain>` subdomains are auto-verified
    /// and covered by the wildcard certificate.
    pub base_domain: String,
    /// Secret mixed into the deterministic domain-verification tokens.
    pub platform_secret: String,
    /// Container registry new images are addressed under.
    pub registry: String,
    /// Days before expiry at which certificates are renewed.
    pub cert_renew_before_days: i64,
}

impl ReconcilerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::required("DATABASE_URL")?,
            base_domain: env::required("ZEITWORK_BASE_DOMAIN")?,
            platform_secret: env::required("ZEITWORK_PLATFORM_SECRET")?,
            registry: env::optional("ZEITWORK_REGISTRY", "registry.zeitwork.com"),
            cert_renew_before_days: env::optional_parsed("ZEITWORK_CERT_RENEW_BEFORE_DAYS", 30)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_requires_database_url() {
        // Run in a scrubbed scope: none of the vars set.
        unsafe {
            std::env::remove_var("DATABASE_URL");
        }
        let err = ReconcilerConfig::from_env().unwrap_err();
        assert!(format!("{}", err).contains("DATABASE_URL"));
    }
}
