//! Remote listing with glob expansion.
//!
//! A key without glob metacharacters lists as a plain prefix; a glob key
//! lists from the fixed prefix up to the first metacharacter and filters
//! results with a matcher in which `*` and `?` do not cross `/`. Items are
//! streamed to the consumer; the end-of-stream sentinel is the caller's
//! concern.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::store::{ObjectStore, StorageClass};
use crate::url::S3Url;

/// One entry of a remote listing. `parsed_key` is the key relative to the
/// listing's fixed directory prefix and is what batch callbacks use for
/// destination naming.
#[derive(Debug, Clone)]
pub enum ListItem {
    /// A pseudo-directory derived from the delimiter; `parsed_key` keeps its
    /// trailing `/`.
    CommonPrefix { parsed_key: String },
    Object {
        key: String,
        parsed_key: String,
        size: u64,
        last_modified: DateTime<Utc>,
        class: StorageClass,
    },
}

fn key_matcher(pattern: &str) -> Result<globset::GlobMatcher> {
    Ok(globset::GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("bad key pattern: {}", pattern))?
        .compile_matcher())
}

/// Lists `url` (glob-aware) and sends every matching item on `tx`.
pub async fn s3_list(
    store: &dyn ObjectStore,
    url: &S3Url,
    tx: &mpsc::Sender<Option<ListItem>>,
) -> Result<()> {
    let matcher = if url.has_glob() {
        Some(key_matcher(&url.key)?)
    } else {
        None
    };
    let list_prefix = if url.has_glob() {
        url.glob_prefix()
    } else {
        &url.key
    };
    let dir_prefix = url.key_dir_prefix();

    let mut token: Option<String> = None;
    loop {
        let page = store
            .list_page(&url.bucket, list_prefix, Some('/'), token.as_deref())
            .await
            .with_context(|| format!("failed listing {}", url))?;
        for prefix in &page.common_prefixes {
            if let Some(matcher) = &matcher {
                // the trailing delimiter is not part of the pattern
                if !matcher.is_match(prefix.trim_end_matches('/')) {
                    continue;
                }
            }
            let parsed_key = prefix
                .strip_prefix(dir_prefix)
                .unwrap_or(prefix)
                .to_string();
            if tx.send(Some(ListItem::CommonPrefix { parsed_key })).await.is_err() {
                return Ok(());
            }
        }
        for obj in page.objects {
            if let Some(matcher) = &matcher {
                if !matcher.is_match(&obj.key) {
                    continue;
                }
            }
            let parsed_key = obj
                .key
                .strip_prefix(dir_prefix)
                .unwrap_or(&obj.key)
                .to_string();
            let item = ListItem::Object {
                key: obj.key,
                parsed_key,
                size: obj.size,
                last_modified: obj.last_modified,
                class: obj.class,
            };
            if tx.send(Some(item)).await.is_err() {
                return Ok(());
            }
        }
        match page.next_token {
            Some(next) => token = Some(next),
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn collect(store: &MemoryStore, url: &str) -> Result<Vec<ListItem>> {
        let url = S3Url::parse(url)?;
        // the buffer is larger than any listing these tests produce
        let (tx, mut rx) = mpsc::channel(64);
        s3_list(store, &url, &tx).await?;
        drop(tx);
        let mut items = vec![];
        while let Some(Some(item)) = rx.recv().await {
            items.push(item);
        }
        Ok(items)
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for key in [
            "logs/app.log",
            "logs/old/app.log",
            "pre/a.txt",
            "pre/b.dat",
            "pre/sub/c.txt",
        ] {
            store.put_object("b", key, b"xy", StorageClass::Standard);
        }
        store
    }

    #[test_log::test(tokio::test)]
    async fn plain_prefix_lists_children_and_dirs() -> Result<()> {
        let store = seeded();
        let items = collect(&store, "s3://b/pre/").await?;
        let mut objects = vec![];
        let mut dirs = vec![];
        for item in items {
            match item {
                ListItem::Object { parsed_key, .. } => objects.push(parsed_key),
                ListItem::CommonPrefix { parsed_key } => dirs.push(parsed_key),
            }
        }
        assert_eq!(dirs, ["sub/"]);
        assert_eq!(objects, ["a.txt", "b.dat"]);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn glob_filters_within_segment() -> Result<()> {
        let store = seeded();
        let items = collect(&store, "s3://b/pre/*.txt").await?;
        assert_eq!(items.len(), 1);
        match &items[0] {
            ListItem::Object { key, parsed_key, .. } => {
                assert_eq!(key, "pre/a.txt");
                assert_eq!(parsed_key, "a.txt");
            }
            other => panic!("expected an object, got {:?}", other),
        }
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn glob_star_matches_dirs_as_common_prefixes() -> Result<()> {
        let store = seeded();
        let items = collect(&store, "s3://b/pre/*").await?;
        let dirs: Vec<String> = items
            .iter()
            .filter_map(|i| match i {
                ListItem::CommonPrefix { parsed_key } => Some(parsed_key.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(dirs, ["sub/"]);
        let objects = items.len() - dirs.len();
        assert_eq!(objects, 2);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn empty_listing_yields_nothing() -> Result<()> {
        let store = seeded();
        let items = collect(&store, "s3://b/nothing/*").await?;
        assert!(items.is_empty());
        Ok(())
    }
}
