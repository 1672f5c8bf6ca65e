use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use lru::LruCache;
use parking_lot::Mutex;
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use tracing::trace;

use super::ca::MintedLeaf;

/// Bounded in-memory cache of minted leaf certificates, keyed by host.
pub struct CertificateCache {
    inner: Mutex<LruCache<String, CachedLeaf>>,
}

struct CachedLeaf {
    key: Arc<CertifiedKey>,
    expires_at: OffsetDateTime,
}

impl CertificateCache {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| anyhow!("certificate cache capacity must be greater than zero"))?;
        Ok(Self {
            inner: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Returns the cached leaf for `host`, minting a new one when it is
    /// missing or expired. Minting happens outside the lock.
    pub fn get_or_mint<F>(&self, host: &str, mint: F) -> Result<Arc<CertifiedKey>>
    where
        F: FnOnce() -> Result<MintedLeaf>,
    {
        let now = OffsetDateTime::now_utc();
        {
            let mut cache = self.inner.lock();
            let fresh = cache
                .get(host)
                .filter(|entry| entry.expires_at > now)
                .map(|entry| entry.key.clone());
            if let Some(key) = fresh {
                trace!(host, "leaf certificate cache hit");
                return Ok(key);
            }
            cache.pop(host);
        }

        trace!(host, "minting leaf certificate");
        let minted = mint()?;
        let key = minted.certified_key.clone();
        self.inner.lock().put(
            host.to_string(),
            CachedLeaf {
                key: minted.certified_key,
                expires_at: minted.expires_at,
            },
        );
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::ca::CertificateAuthority;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    #[test]
    fn second_lookup_reuses_minted_leaf() -> Result<()> {
        let dir = TempDir::new()?;
        let ca = CertificateAuthority::load_or_generate(dir.path())?;
        let cache = CertificateCache::new(4)?;
        let ttl = StdDuration::from_secs(3600);

        let first = cache.get_or_mint("registry.example", || ca.mint_leaf("registry.example", ttl))?;
        let second =
            cache.get_or_mint("registry.example", || panic!("leaf should come from cache"))?;
        assert!(Arc::ptr_eq(&first, &second));
        Ok(())
    }

    #[test]
    fn expired_leaf_is_replaced() -> Result<()> {
        let dir = TempDir::new()?;
        let ca = CertificateAuthority::load_or_generate(dir.path())?;
        let cache = CertificateCache::new(4)?;

        let stale = cache.get_or_mint("registry.example", || {
            let mut leaf = ca.mint_leaf("registry.example", StdDuration::from_secs(60))?;
            leaf.expires_at = OffsetDateTime::now_utc() - time::Duration::minutes(1);
            Ok(leaf)
        })?;
        let fresh = cache.get_or_mint("registry.example", || {
            ca.mint_leaf("registry.example", StdDuration::from_secs(3600))
        })?;
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[test]
    fn least_recently_used_host_is_evicted() -> Result<()> {
        let dir = TempDir::new()?;
        let ca = CertificateAuthority::load_or_generate(dir.path())?;
        let cache = CertificateCache::new(1)?;
        let ttl = StdDuration::from_secs(3600);

        cache.get_or_mint("a.example", || ca.mint_leaf("a.example", ttl))?;
        cache.get_or_mint("b.example", || ca.mint_leaf("b.example", ttl))?;
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(CertificateCache::new(0).is_err());
    }
}
