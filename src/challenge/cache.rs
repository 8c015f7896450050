//! Persistent cookie cache layered over the settings store, keyed by host
//! (optionally scoped by request fingerprint).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::settings::{SettingsStore, StoreError};

const COOKIE_PREFIX: &str = "anubis.cookie.";
const EXPIRES_SUFFIX: &str = ".expires";

/// Default validity window applied to freshly solved cookies.
pub const DEFAULT_COOKIE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

fn value_key(host: &str, fingerprint: Option<&str>) -> String {
    match fingerprint {
        Some(fp) => format!("{COOKIE_PREFIX}{host}.{fp}"),
        None => format!("{COOKIE_PREFIX}{host}"),
    }
}

fn expires_key(host: &str, fingerprint: Option<&str>) -> String {
    format!("{}{EXPIRES_SUFFIX}", value_key(host, fingerprint))
}

pub struct CookieCache {
    store: Arc<dyn SettingsStore>,
}

impl CookieCache {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    /// Returns the cached cookie for `host` (optionally fingerprint-scoped).
    /// Empty (not an error) when there is no record, the expiry can't be
    /// parsed, or the expiry is in the past — in the latter two cases both
    /// keys are best-effort deleted.
    pub fn get(&self, host: &str, fingerprint: Option<&str>) -> Result<String, StoreError> {
        let vkey = value_key(host, fingerprint);
        let ekey = expires_key(host, fingerprint);

        let value = match self.store.get(&vkey)? {
            Some(v) => v,
            None => return Ok(String::new()),
        };
        let expires_raw = match self.store.get(&ekey)? {
            Some(v) => v,
            None => return Ok(String::new()),
        };

        let expires = match DateTime::parse_from_rfc3339(&expires_raw) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(_) => {
                let _ = self.store.delete(&vkey);
                let _ = self.store.delete(&ekey);
                return Ok(String::new());
            }
        };

        if expires < Utc::now() {
            let _ = self.store.delete(&vkey);
            let _ = self.store.delete(&ekey);
            return Ok(String::new());
        }

        Ok(value)
    }

    /// Writes the cookie value and its expiry. Per the resolved Open
    /// Question in spec.md §9 (see DESIGN.md), the expiry is written first:
    /// if that write fails the value is never written, so a failure yields
    /// a cache miss rather than a false hit with a stale expiry.
    pub fn set(&self, host: &str, fingerprint: Option<&str>, cookie: &str, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        let vkey = value_key(host, fingerprint);
        let ekey = expires_key(host, fingerprint);

        self.store.set(&ekey, &expires_at.to_rfc3339())?;
        self.store.set(&vkey, cookie)?;
        Ok(())
    }

    /// Deletes both keys. The expiry-delete error dominates if both fail,
    /// matching spec.md §4.3.
    pub fn delete(&self, host: &str, fingerprint: Option<&str>) -> Result<(), StoreError> {
        let vkey = value_key(host, fingerprint);
        let ekey = expires_key(host, fingerprint);
        let value_result = self.store.delete(&vkey);
        let expires_result = self.store.delete(&ekey);
        expires_result?;
        value_result?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::InMemorySettingsStore;
    use chrono::Duration as ChronoDuration;

    fn cache() -> CookieCache {
        CookieCache::new(Arc::new(InMemorySettingsStore::default()))
    }

    #[test]
    fn miss_when_absent() {
        let cache = cache();
        assert_eq!(cache.get("example.com", None).unwrap(), "");
    }

    #[test]
    fn hit_after_set() {
        let cache = cache();
        let expires = Utc::now() + ChronoDuration::days(1);
        cache.set("example.com", None, "cookie=value", expires).unwrap();
        assert_eq!(cache.get("example.com", None).unwrap(), "cookie=value");
    }

    #[test]
    fn expired_cookie_is_a_miss_and_cleans_up() {
        let cache = cache();
        let expires = Utc::now() - ChronoDuration::days(1);
        cache.set("example.com", None, "cookie=value", expires).unwrap();
        assert_eq!(cache.get("example.com", None).unwrap(), "");
        assert_eq!(cache.store.get("anubis.cookie.example.com").unwrap(), None);
        assert_eq!(cache.store.get("anubis.cookie.example.com.expires").unwrap(), None);
    }

    #[test]
    fn unparseable_expiry_is_a_miss() {
        let cache = cache();
        cache.store.set("anubis.cookie.example.com", "cookie=value").unwrap();
        cache.store.set("anubis.cookie.example.com.expires", "not-a-date").unwrap();
        assert_eq!(cache.get("example.com", None).unwrap(), "");
    }

    #[test]
    fn fingerprint_scoped_keys_are_independent() {
        let cache = cache();
        let expires = Utc::now() + ChronoDuration::days(1);
        cache.set("example.com", Some("fp1"), "a=1", expires).unwrap();
        assert_eq!(cache.get("example.com", Some("fp1")).unwrap(), "a=1");
        assert_eq!(cache.get("example.com", None).unwrap(), "");
    }
}
