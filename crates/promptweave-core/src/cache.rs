//! Response cache seam and canonical cache keys.
//!
//! Cache keys are a SHA-256 over the canonical JSON of
//! `{provider, request, extras, run}` so that logically equal requests hash
//! equally regardless of how their JSON maps were assembled. The run count
//! enters the key only past the first iteration, so loop iterations of the
//! same step do not collide while single-shot steps keep stable keys.

use std::future::Future;
use std::pin::Pin;

use dashmap::DashMap;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// ModelCache seam
// ---------------------------------------------------------------------------

/// Trait for model response caches. A miss is `None`; storage failures are
/// the cache's own concern and must not fail the run.
pub trait ModelCache: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Option<Value>> + Send;

    fn put(&self, key: &str, value: Value) -> impl Future<Output = ()> + Send;
}

/// Object-safe version of [`ModelCache`] with boxed futures.
pub trait ModelCacheDyn: Send + Sync {
    fn get_boxed<'a>(&'a self, key: &'a str)
        -> Pin<Box<dyn Future<Output = Option<Value>> + Send + 'a>>;

    fn put_boxed<'a>(
        &'a self,
        key: &'a str,
        value: Value,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

impl<T: ModelCache> ModelCacheDyn for T {
    fn get_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<Value>> + Send + 'a>> {
        Box::pin(self.get(key))
    }

    fn put_boxed<'a>(
        &'a self,
        key: &'a str,
        value: Value,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.put(key, value))
    }
}

/// Type-erased model cache.
pub struct BoxModelCache {
    inner: Box<dyn ModelCacheDyn + Send + Sync>,
}

impl BoxModelCache {
    pub fn new<T: ModelCache + 'static>(cache: T) -> Self {
        Self {
            inner: Box::new(cache),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.get_boxed(key).await
    }

    pub async fn put(&self, key: &str, value: Value) {
        self.inner.put_boxed(key, value).await
    }
}

/// Sharing one cache across runners.
impl<T: ModelCache> ModelCache for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Option<Value> {
        self.as_ref().get(key).await
    }

    async fn put(&self, key: &str, value: Value) {
        self.as_ref().put(key, value).await
    }
}

/// In-memory cache, useful for tests and single-process runs.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Value>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ModelCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.clone())
    }

    async fn put(&self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }
}

// ---------------------------------------------------------------------------
// Cache keys
// ---------------------------------------------------------------------------

/// Compute the cache key for one invocation.
pub fn cache_key(
    provider: &str,
    request: &Value,
    extras: Option<&Value>,
    run_count: u32,
) -> String {
    let mut payload = json!({
        "provider": provider,
        "request": request,
    });
    if let Some(extras) = extras {
        payload["extras"] = extras.clone();
    }
    if run_count > 1 {
        payload["run"] = json!(run_count);
    }

    let mut hasher = Sha256::new();
    hasher.update(to_canonical_json(&payload).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Serialize a JSON value with object keys sorted recursively, so equal
/// values serialize equally regardless of map insertion order.
fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let items: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        to_canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_stable() {
        let request = json!({"model": "m", "messages": ["hi"]});
        let a = cache_key("anthropic", &request, None, 1);
        let b = cache_key("anthropic", &request, None, 1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_ignores_object_key_order() {
        let a = serde_json::from_str::<Value>(r#"{"a":1,"b":2}"#).unwrap();
        let b = serde_json::from_str::<Value>(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(cache_key("p", &a, None, 1), cache_key("p", &b, None, 1));
    }

    #[test]
    fn test_key_varies_by_provider_and_extras() {
        let request = json!({"q": "hello"});
        let base = cache_key("p1", &request, None, 1);
        assert_ne!(base, cache_key("p2", &request, None, 1));
        assert_ne!(
            base,
            cache_key("p1", &request, Some(&json!({"seed": 7})), 1)
        );
    }

    #[test]
    fn test_first_run_excluded_from_key() {
        let request = json!({"q": "loop"});
        let first = cache_key("p", &request, None, 1);
        let second = cache_key("p", &request, None, 2);
        let third = cache_key("p", &request, None, 3);
        assert_ne!(first, second);
        assert_ne!(second, third);
        // Run 1 is the unadorned key.
        assert_eq!(first, cache_key("p", &request, None, 0));
    }

    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let cache = BoxModelCache::new(MemoryCache::new());
        assert_eq!(cache.get("missing").await, None);
        cache.put("k", json!({"text": "cached"})).await;
        assert_eq!(cache.get("k").await, Some(json!({"text": "cached"})));
    }
}
