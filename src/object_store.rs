//! Object-store port and adapters.
//!
//! The pipeline sees a small blocking trait: list keys under a prefix
//! (optionally after a cursor or grouped by delimiter) and fetch an object
//! into a caller-provided sink. The production adapter wraps the AWS SDK
//! client, initialized once per process with anonymous credentials and
//! entered from the worker threads through the runtime handle; an in-memory
//! adapter backs the tests.

use std::collections::BTreeMap;
use std::time::Duration;

use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use parking_lot::Mutex;
use tracing::info;

use crate::error::{Error, Result};

/// The public NEXRAD Level II archive bucket.
pub const NEXRAD_BUCKET: &str = "unidata-nexrad-level2";

/// Region hosting the public archive, used when none is ambient.
const DEFAULT_REGION: &str = "us-east-1";

/// Connect/request timeout mandated for object-store calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocking object-store operations required by discovery and fetch.
pub trait ObjectStore: Send + Sync {
    /// List object keys under `prefix`, lexicographically ordered,
    /// optionally starting after `start_after`.
    fn list_keys(&self, bucket: &str, prefix: &str, start_after: Option<&str>)
        -> Result<Vec<String>>;

    /// List the common prefixes directly under `prefix` using `delimiter`.
    fn list_common_prefixes(&self, bucket: &str, prefix: &str, delimiter: &str)
        -> Result<Vec<String>>;

    /// Fetch an object into `sink`, replacing its contents. Returns the
    /// byte count received.
    fn get_object(&self, bucket: &str, key: &str, sink: &mut Vec<u8>) -> Result<usize>;
}

// =============================================================================
// S3 Adapter
// =============================================================================

/// AWS S3 adapter over the process-wide SDK client.
///
/// Holds the runtime handle it was constructed on; every call blocks the
/// calling worker thread on that runtime, which keeps the pipeline itself
/// free of async plumbing.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    runtime: tokio::runtime::Handle,
}

impl S3ObjectStore {
    /// Initialize the SDK once for the process. Credentials and region come
    /// from the ambient provider chain; the public archive needs neither,
    /// so lookups are disabled and the region falls back to the archive's.
    pub async fn connect() -> Self {
        let region = aws_config::meta::region::RegionProviderChain::default_provider()
            .or_else(DEFAULT_REGION);
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(region)
            .no_credentials()
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(REQUEST_TIMEOUT)
                    .read_timeout(REQUEST_TIMEOUT)
                    .build(),
            )
            .retry_config(RetryConfig::standard().with_max_attempts(2))
            .load()
            .await;
        let client = aws_sdk_s3::Client::new(&config);
        info!("S3 client initialized");
        S3ObjectStore {
            client,
            runtime: tokio::runtime::Handle::current(),
        }
    }
}

impl ObjectStore for S3ObjectStore {
    fn list_keys(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
    ) -> Result<Vec<String>> {
        self.runtime.block_on(async {
            let mut keys = Vec::new();
            let mut continuation: Option<String> = None;
            loop {
                let response = self
                    .client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(prefix)
                    .set_start_after(start_after.map(String::from))
                    .set_continuation_token(continuation.take())
                    .send()
                    .await
                    .map_err(|e| Error::ObjectStore(format!("list {}: {}", prefix, e)))?;

                for object in response.contents() {
                    if let Some(key) = object.key() {
                        keys.push(key.to_string());
                    }
                }
                match response.next_continuation_token() {
                    Some(token) => continuation = Some(token.to_string()),
                    None => break,
                }
            }
            keys.sort();
            Ok(keys)
        })
    }

    fn list_common_prefixes(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
    ) -> Result<Vec<String>> {
        self.runtime.block_on(async {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .delimiter(delimiter)
                .send()
                .await
                .map_err(|e| Error::ObjectStore(format!("list prefixes {}: {}", prefix, e)))?;

            Ok(response
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(String::from))
                .collect())
        })
    }

    fn get_object(&self, bucket: &str, key: &str, sink: &mut Vec<u8>) -> Result<usize> {
        sink.clear();
        self.runtime.block_on(async {
            let response = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Error::ObjectStore(format!("get {}: {}", key, e)))?;

            let body = response
                .body
                .collect()
                .await
                .map_err(|e| Error::ObjectStore(format!("read {}: {}", key, e)))?;
            sink.extend_from_slice(&body.into_bytes());
            Ok(sink.len())
        })
    }
}

// =============================================================================
// In-Memory Adapter
// =============================================================================

/// In-memory object store for tests: a sorted (bucket, key) -> bytes map.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, data: Vec<u8>) {
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), data);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn list_keys(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
    ) -> Result<Vec<String>> {
        let objects = self.objects.lock();
        Ok(objects
            .keys()
            .filter(|(b, key)| {
                b == bucket
                    && key.starts_with(prefix)
                    && start_after.map_or(true, |after| key.as_str() > after)
            })
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn list_common_prefixes(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
    ) -> Result<Vec<String>> {
        let objects = self.objects.lock();
        let mut prefixes: Vec<String> = Vec::new();
        for (b, key) in objects.keys() {
            if b != bucket || !key.starts_with(prefix) {
                continue;
            }
            if let Some(end) = key[prefix.len()..].find(delimiter) {
                let common = &key[..prefix.len() + end + delimiter.len()];
                if prefixes.last().map(String::as_str) != Some(common) {
                    prefixes.push(common.to_string());
                }
            }
        }
        prefixes.dedup();
        Ok(prefixes)
    }

    fn get_object(&self, bucket: &str, key: &str, sink: &mut Vec<u8>) -> Result<usize> {
        let objects = self.objects.lock();
        let data = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| Error::ObjectStore(format!("no such key {}", key)))?;
        sink.clear();
        sink.extend_from_slice(data);
        Ok(sink.len())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_list_with_cursor() {
        let store = MemoryObjectStore::new();
        store.put("bucket", "2024/01/01/KTLX/a", vec![1]);
        store.put("bucket", "2024/01/01/KTLX/b", vec![2]);
        store.put("bucket", "2024/01/01/KTLX/c", vec![3]);
        store.put("bucket", "2024/01/01/KEWX/a", vec![4]);

        let all = store.list_keys("bucket", "2024/01/01/KTLX/", None).unwrap();
        assert_eq!(all.len(), 3);

        let after = store
            .list_keys("bucket", "2024/01/01/KTLX/", Some("2024/01/01/KTLX/a"))
            .unwrap();
        assert_eq!(after, vec!["2024/01/01/KTLX/b", "2024/01/01/KTLX/c"]);
    }

    #[test]
    fn test_memory_common_prefixes() {
        let store = MemoryObjectStore::new();
        store.put("bucket", "2024/01/01/KTLX/file1", vec![]);
        store.put("bucket", "2024/01/01/KTLX/file2", vec![]);
        store.put("bucket", "2024/01/01/KEWX/file1", vec![]);

        let mut prefixes = store
            .list_common_prefixes("bucket", "2024/01/01/", "/")
            .unwrap();
        prefixes.sort();
        assert_eq!(prefixes, vec!["2024/01/01/KEWX/", "2024/01/01/KTLX/"]);
    }

    #[test]
    fn test_memory_get_object() {
        let store = MemoryObjectStore::new();
        store.put("bucket", "key", vec![1, 2, 3]);

        let mut sink = vec![9, 9];
        assert_eq!(store.get_object("bucket", "key", &mut sink).unwrap(), 3);
        assert_eq!(sink, vec![1, 2, 3]);

        assert!(store.get_object("bucket", "missing", &mut sink).is_err());
    }
}
