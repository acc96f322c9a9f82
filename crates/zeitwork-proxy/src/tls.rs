use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};

use zeitwork_db::cert_store::CertStore;
use zeitwork_db::notify;

/// Fallback cache refresh cadence.
const REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// SNI resolver backed by the database cert store.
///
/// The TLS handshake is synchronous, so certificates are held in an
/// in-memory cache refreshed from the store on notification (or the slow
/// poll). Exact hostname match first, then the platform wildcard.
pub struct StoreCertResolver {
    base_domain: String,
    /// name → key; the wildcard is stored under `*.<base_domain>`.
    cache: RwLock<Arc<HashMap<String, Arc<CertifiedKey>>>>,
}

impl std::fmt::Debug for StoreCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCertResolver")
            .field("base_domain", &self.base_domain)
            .finish_non_exhaustive()
    }
}

impl StoreCertResolver {
    pub fn new(base_domain: String) -> Self {
        Self {
            base_domain,
            cache: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    fn wildcard_name(&self) -> String {
        format!("*.{}", self.base_domain)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().expect("cert cache poisoned").len()
    }

    fn swap(&self, cache: HashMap<String, Arc<CertifiedKey>>) {
        *self.cache.write().expect("cert cache poisoned") = Arc::new(cache);
    }

    /// Reload every certificate from the store.
    pub async fn refresh(&self, store: &CertStore) -> Result<()> {
        let mut cache = HashMap::new();

        if let Some(key) = load_certified_key(store, "wildcard").await? {
            cache.insert(self.wildcard_name(), Arc::new(key));
        }

        // Per-domain certificates live under certs/domains/<name>/.
        let records = store.list_prefix("certs/domains/").await?;
        let mut names: Vec<String> = records
            .iter()
            .filter_map(|r| {
                r.key
                    .strip_prefix("certs/domains/")
                    .and_then(|rest| rest.strip_suffix("/cert.pem"))
                    .map(str::to_string)
            })
            .collect();
        names.dedup();

        for name in names {
            match load_certified_key(store, &format!("domains/{}", name)).await {
                Ok(Some(key)) => {
                    cache.insert(name, Arc::new(key));
                }
                Ok(None) => {}
                Err(e) => warn!(domain = %name, error = %e, "Skipping unloadable certificate"),
            }
        }

        let count = cache.len();
        self.swap(cache);
        info!(certificates = count, "Certificate cache refreshed");
        Ok(())
    }
}

impl ResolvesServerCert for StoreCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        let cache = Arc::clone(&*self.cache.read().ok()?);

        if let Some(key) = cache.get(name) {
            return Some(Arc::clone(key));
        }

        // Any single-label subdomain of the base domain is covered by the
        // wildcard.
        if name
            .strip_suffix(&self.base_domain)
            .and_then(|p| p.strip_suffix('.'))
            .is_some_and(|label| !label.is_empty() && !label.contains('.'))
        {
            return cache.get(&self.wildcard_name()).map(Arc::clone);
        }

        None
    }
}

/// Load one certificate + key pair from the store into rustls form.
async fn load_certified_key(store: &CertStore, slug: &str) -> Result<Option<CertifiedKey>> {
    let cert_key = format!("certs/{}/cert.pem", slug);
    let key_key = format!("certs/{}/key.pem", slug);

    let (Some(cert_rec), Some(key_rec)) = (store.get(&cert_key).await?, store.get(&key_key).await?)
    else {
        return Ok(None);
    };

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_rec.pem.as_slice())
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("Bad certificate PEM under {}", cert_key))?;
    anyhow::ensure!(!certs.is_empty(), "No certificates in {}", cert_key);

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_rec.pem.as_slice())
        .with_context(|| format!("Bad key PEM under {}", key_key))?
        .with_context(|| format!("No private key in {}", key_key))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("Unsupported key type under {}: {}", key_key, e))?;

    Ok(Some(CertifiedKey::new(certs, signing_key)))
}

/// Build the TLS acceptor config around the store-backed resolver.
pub fn server_config(resolver: Arc<StoreCertResolver>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Keep the certificate cache fresh until shutdown.
pub async fn refresh_loop(
    pool: PgPool,
    resolver: Arc<StoreCertResolver>,
    mut shutdown: watch::Receiver<bool>,
) {
    let store = CertStore::new(pool.clone());
    let mut listener = match notify::subscribe(&pool, &[notify::CERTS_CHANNEL]).await {
        Ok(l) => Some(l),
        Err(e) => {
            warn!(error = %e, "Certificate notifications unavailable, polling only");
            None
        }
    };

    let mut tick = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            notification = async {
                match listener.as_mut() {
                    Some(l) => l.recv().await.map(|_| ()),
                    None => std::future::pending().await,
                }
            } => {
                if let Err(e) = notification {
                    warn!(error = %e, "Certificate notification stream broke");
                    listener = None;
                }
            }
            _ = shutdown.changed() => return,
        }

        if let Err(e) = resolver.refresh(&store).await {
            warn!(error = %e, "Certificate cache refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_starts_empty() {
        let resolver = StoreCertResolver::new("zeitwork.app".to_string());
        assert_eq!(resolver.cached_count(), 0);
    }

    #[test]
    fn test_wildcard_name() {
        let resolver = StoreCertResolver::new("zeitwork.app".to_string());
        assert_eq!(resolver.wildcard_name(), "*.zeitwork.app");
    }
}
