//! Header values for tenant resource responses

use std::time::Duration;

use crate::cache::{CachedResource, Freshness};

/// Strong entity tag for a resource version
pub fn etag(version: u64) -> String {
    format!("\"{}\"", version)
}

/// Whether an `If-None-Match` header value matches `version`.
///
/// Accepts lists, weak tags and `*`.
pub fn if_none_match(header: &str, version: u64) -> bool {
    let current = etag(version);
    header.split(',').map(str::trim).any(|tag| {
        tag == "*" || tag.strip_prefix("W/").unwrap_or(tag) == current
    })
}

/// `Cache-Control` for a served resource. Only fresh payloads get a
/// positive `max-age`.
pub fn cache_control(resource: &CachedResource, ttl: Duration, swr: Duration) -> String {
    let max_age = match (resource.freshness, resource.age) {
        (Freshness::Fresh, Some(age)) => ttl.saturating_sub(age).as_secs(),
        _ => 0,
    };
    format!(
        "max-age={}, stale-while-revalidate={}",
        max_age,
        swr.as_secs()
    )
}

/// Whole seconds, rounded up, for `Retry-After` style headers
pub fn ceil_secs(d: Duration) -> u64 {
    if d == Duration::MAX {
        return u64::MAX;
    }
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Payload;
    use std::sync::Arc;

    fn resource(freshness: Freshness, age: Option<Duration>) -> CachedResource {
        CachedResource {
            payload: Arc::new(Payload {
                body: serde_json::json!({}),
                version: 7,
            }),
            freshness,
            age,
        }
    }

    #[test]
    fn test_if_none_match() {
        assert!(if_none_match("\"7\"", 7));
        assert!(if_none_match("W/\"7\"", 7));
        assert!(if_none_match("\"3\", \"7\"", 7));
        assert!(if_none_match("*", 7));
        assert!(!if_none_match("\"6\"", 7));
        assert!(!if_none_match("7", 7));
    }

    #[test]
    fn test_cache_control() {
        let ttl = Duration::from_secs(30);
        let swr = Duration::from_secs(300);

        let fresh = resource(Freshness::Fresh, Some(Duration::from_secs(10)));
        assert_eq!(cache_control(&fresh, ttl, swr), "max-age=20, stale-while-revalidate=300");

        let stale = resource(Freshness::Stale, Some(Duration::from_secs(45)));
        assert_eq!(cache_control(&stale, ttl, swr), "max-age=0, stale-while-revalidate=300");

        let default = resource(Freshness::Default, None);
        assert_eq!(cache_control(&default, ttl, swr), "max-age=0, stale-while-revalidate=300");
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_millis(500)), 1);
        assert_eq!(ceil_secs(Duration::from_secs(2)), 2);
        assert_eq!(ceil_secs(Duration::from_millis(2001)), 3);
        assert_eq!(ceil_secs(Duration::ZERO), 0);
    }
}
