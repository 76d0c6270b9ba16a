//! In-memory object store used by the test suite.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{BatchDeleteOutcome, Bucket, KeyError, ListPage, ObjectInfo, ObjectStore, StorageClass};
use crate::url::S3Url;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    last_modified: chrono::DateTime<Utc>,
    class: StorageClass,
}

#[derive(Debug)]
struct BucketData {
    creation_date: chrono::DateTime<Utc>,
    objects: BTreeMap<String, StoredObject>,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: BTreeMap<String, BucketData>,
    // (bucket, key) pairs whose read/transfer operations fail
    broken: HashSet<(String, String)>,
    // (bucket, key) pairs whose delete operations fail
    broken_delete: HashSet<(String, String)>,
    // Some(n): the next n list_page calls succeed, later ones fail
    list_pages_before_failure: Option<usize>,
    delete_batch_sizes: Vec<usize>,
}

/// A bucket/key map behind a mutex. Listing is paged like a real store;
/// `fail_object` injects per-key errors and `set_transfer_delay` slows
/// downloads/uploads so cancellation races can be exercised.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    page_size: usize,
    transfer_delay: Mutex<Option<std::time::Duration>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            page_size: 1000,
            transfer_delay: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_bucket(&self, name: &str) {
        self.lock()
            .buckets
            .entry(name.to_string())
            .or_insert_with(|| BucketData {
                creation_date: Utc::now(),
                objects: BTreeMap::new(),
            });
    }

    pub fn put_object(&self, bucket: &str, key: &str, data: &[u8], class: StorageClass) {
        let mut inner = self.lock();
        let b = inner
            .buckets
            .entry(bucket.to_string())
            .or_insert_with(|| BucketData {
                creation_date: Utc::now(),
                objects: BTreeMap::new(),
            });
        b.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                last_modified: Utc::now(),
                class,
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.data.clone())
    }

    pub fn object_class(&self, bucket: &str, key: &str) -> Option<StorageClass> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.class)
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.object(bucket, key).is_some()
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.lock()
            .buckets
            .get(bucket)
            .map(|b| b.objects.len())
            .unwrap_or(0)
    }

    /// Makes read and transfer operations on this key fail.
    pub fn fail_object(&self, bucket: &str, key: &str) {
        self.lock()
            .broken
            .insert((bucket.to_string(), key.to_string()));
    }

    /// Makes delete operations on this key fail.
    pub fn fail_delete(&self, bucket: &str, key: &str) {
        self.lock()
            .broken_delete
            .insert((bucket.to_string(), key.to_string()));
    }

    /// Lets the next `pages` listing requests succeed and fails the ones
    /// after, so a listing can break partway through.
    pub fn fail_list_after_pages(&self, pages: usize) {
        self.lock().list_pages_before_failure = Some(pages);
    }

    /// Delays downloads and uploads, so tests can cancel them in flight.
    pub fn set_transfer_delay(&self, delay: std::time::Duration) {
        *self
            .transfer_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    /// Sizes of the multi-delete requests received, in order.
    pub fn delete_batch_sizes(&self) -> Vec<usize> {
        self.lock().delete_batch_sizes.clone()
    }

    fn is_broken(inner: &Inner, bucket: &str, key: &str) -> bool {
        inner
            .broken
            .contains(&(bucket.to_string(), key.to_string()))
    }

    async fn apply_transfer_delay(&self) {
        let delay = *self
            .transfer_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn get_object(&self, url: &S3Url) -> Result<StoredObject> {
        let inner = self.lock();
        if Self::is_broken(&inner, &url.bucket, &url.key) {
            return Err(anyhow!("access denied: {}", url));
        }
        inner
            .buckets
            .get(&url.bucket)
            .and_then(|b| b.objects.get(&url.key))
            .cloned()
            .ok_or_else(|| anyhow!("no such object: {}", url))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head_object(&self, url: &S3Url) -> Result<ObjectInfo> {
        let obj = self.get_object(url)?;
        Ok(ObjectInfo {
            key: url.key.clone(),
            size: obj.data.len() as u64,
            last_modified: obj.last_modified,
            class: obj.class,
        })
    }

    async fn copy_object(&self, src: &S3Url, dst: &S3Url, class: StorageClass) -> Result<()> {
        let obj = self.get_object(src)?;
        let mut inner = self.lock();
        let b = inner
            .buckets
            .get_mut(&dst.bucket)
            .ok_or_else(|| anyhow!("no such bucket: {}", dst.bucket))?;
        b.objects.insert(
            dst.key.clone(),
            StoredObject {
                data: obj.data,
                last_modified: Utc::now(),
                class,
            },
        );
        Ok(())
    }

    async fn delete_object(&self, url: &S3Url) -> Result<()> {
        let mut inner = self.lock();
        if inner
            .broken_delete
            .contains(&(url.bucket.clone(), url.key.clone()))
        {
            return Err(anyhow!("access denied: {}", url));
        }
        // deleting a missing key succeeds, as it does on a real store
        if let Some(b) = inner.buckets.get_mut(&url.bucket) {
            b.objects.remove(&url.key);
        }
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<BatchDeleteOutcome> {
        let mut inner = self.lock();
        inner.delete_batch_sizes.push(keys.len());
        let mut outcome = BatchDeleteOutcome::default();
        for key in keys {
            if inner
                .broken_delete
                .contains(&(bucket.to_string(), key.clone()))
            {
                outcome.errors.push(KeyError {
                    key: key.clone(),
                    message: "AccessDenied".to_string(),
                });
                continue;
            }
            if let Some(b) = inner.buckets.get_mut(bucket) {
                b.objects.remove(key);
            }
            outcome.deleted.push(key.clone());
        }
        Ok(outcome)
    }

    async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        Ok(self
            .lock()
            .buckets
            .iter()
            .map(|(name, b)| Bucket {
                name: name.clone(),
                creation_date: b.creation_date,
            })
            .collect())
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        token: Option<&str>,
    ) -> Result<ListPage> {
        let mut inner = self.lock();
        if let Some(pages) = inner.list_pages_before_failure.as_mut() {
            if *pages == 0 {
                return Err(anyhow!("listing failed for bucket {}", bucket));
            }
            *pages -= 1;
        }
        let b = inner
            .buckets
            .get(bucket)
            .ok_or_else(|| anyhow!("no such bucket: {}", bucket))?;
        let start = match token {
            Some(t) => Bound::Excluded(t.to_string()),
            None => Bound::Unbounded,
        };
        let mut page = ListPage::default();
        let mut entries = 0;
        let mut last_examined: Option<&str> = None;
        for (key, obj) in b.objects.range::<String, _>((start, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                if key.as_str() < prefix {
                    continue;
                }
                break;
            }
            // classify: grouped under a common prefix, or a plain object
            let group = delimiter.and_then(|d| {
                key[prefix.len()..]
                    .find(d)
                    .map(|i| &key[..prefix.len() + i + 1])
            });
            let is_new_entry = match group {
                Some(g) => page.common_prefixes.last().map(String::as_str) != Some(g),
                None => true,
            };
            if is_new_entry {
                if entries == self.page_size {
                    page.next_token = last_examined.map(str::to_string);
                    return Ok(page);
                }
                entries += 1;
                match group {
                    Some(g) => page.common_prefixes.push(g.to_string()),
                    None => page.objects.push(ObjectInfo {
                        key: key.clone(),
                        size: obj.data.len() as u64,
                        last_modified: obj.last_modified,
                        class: obj.class,
                    }),
                }
            }
            last_examined = Some(key);
        }
        Ok(page)
    }

    async fn download(&self, url: &S3Url, mut file: tokio::fs::File) -> Result<u64> {
        let obj = self.get_object(url)?;
        self.apply_transfer_delay().await;
        file.write_all(&obj.data)
            .await
            .with_context(|| format!("failed writing body of {}", url))?;
        file.flush().await?;
        Ok(obj.data.len() as u64)
    }

    async fn upload(
        &self,
        url: &S3Url,
        mut file: tokio::fs::File,
        size: u64,
        part_size: u64,
        class: StorageClass,
    ) -> Result<()> {
        if part_size == 0 {
            return Err(anyhow!("part size must be positive"));
        }
        {
            let inner = self.lock();
            if Self::is_broken(&inner, &url.bucket, &url.key) {
                return Err(anyhow!("access denied: {}", url));
            }
        }
        self.apply_transfer_delay().await;
        let mut data = Vec::with_capacity(size as usize);
        file.read_to_end(&mut data)
            .await
            .with_context(|| format!("failed reading upload body for {}", url))?;
        self.put_object(&url.bucket, &url.key, &data, class);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn head_copy_delete() -> Result<()> {
        let store = MemoryStore::new();
        store.put_object("b", "a.txt", b"hello", StorageClass::Standard);
        let src = S3Url::new("b", "a.txt");
        let dst = S3Url::new("b", "copy.txt");
        let info = store.head_object(&src).await?;
        assert_eq!(info.size, 5);
        store
            .copy_object(&src, &dst, StorageClass::ReducedRedundancy)
            .await?;
        assert_eq!(
            store.object_class("b", "copy.txt"),
            Some(StorageClass::ReducedRedundancy)
        );
        store.delete_object(&src).await?;
        assert!(!store.contains("b", "a.txt"));
        assert!(store.head_object(&src).await.is_err());
        // deleting again is not an error
        store.delete_object(&src).await?;
        Ok(())
    }

    #[tokio::test]
    async fn listing_groups_common_prefixes() -> Result<()> {
        let store = MemoryStore::new();
        for key in ["p/a.txt", "p/b.txt", "p/sub/c.txt", "p/sub/d.txt", "q/e.txt"] {
            store.put_object("b", key, b"x", StorageClass::Standard);
        }
        let page = store.list_page("b", "p/", Some('/'), None).await?;
        assert_eq!(page.next_token, None);
        let keys: Vec<&str> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["p/a.txt", "p/b.txt"]);
        assert_eq!(page.common_prefixes, ["p/sub/"]);
        Ok(())
    }

    #[tokio::test]
    async fn listing_paginates_without_splitting_groups() -> Result<()> {
        let store = MemoryStore::with_page_size(2);
        for key in ["p/a", "p/b", "p/c", "p/sub/x", "p/sub/y", "p/z"] {
            store.put_object("b", key, b"x", StorageClass::Standard);
        }
        let mut objects = vec![];
        let mut prefixes = vec![];
        let mut token: Option<String> = None;
        loop {
            let page = store
                .list_page("b", "p/", Some('/'), token.as_deref())
                .await?;
            objects.extend(page.objects.into_iter().map(|o| o.key));
            prefixes.extend(page.common_prefixes);
            match page.next_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        assert_eq!(objects, ["p/a", "p/b", "p/c", "p/z"]);
        assert_eq!(prefixes, ["p/sub/"]);
        Ok(())
    }

    #[tokio::test]
    async fn batch_delete_reports_per_key() -> Result<()> {
        let store = MemoryStore::new();
        store.put_object("b", "k1", b"x", StorageClass::Standard);
        store.put_object("b", "k2", b"x", StorageClass::Standard);
        store.fail_delete("b", "k2");
        let keys = vec!["k1".to_string(), "k2".to_string()];
        let outcome = store.delete_objects("b", &keys).await?;
        assert_eq!(outcome.deleted, ["k1"]);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].key, "k2");
        assert_eq!(store.delete_batch_sizes(), [2]);
        Ok(())
    }
}
