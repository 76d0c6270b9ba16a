//! The narrow interface the core expects from an object-store client.
//!
//! The production transport (an SDK-backed client) is an external
//! collaborator; the core only consumes the primitives below. The in-memory
//! [`MemoryStore`] implementation backs the test suite and doubles as a fake
//! for downstream tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::opt::{Opt, OptionList};
use crate::url::S3Url;

mod mem;

pub use mem::MemoryStore;

/// Remote durability/cost tier of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Standard,
    ReducedRedundancy,
    StandardIa,
    Glacier,
    Other,
}

impl StorageClass {
    /// The one-character column code used by listing output.
    pub fn code(self) -> &'static str {
        match self {
            StorageClass::Standard => "",
            StorageClass::ReducedRedundancy => "R",
            StorageClass::StandardIa => "I",
            StorageClass::Glacier => "G",
            StorageClass::Other => "?",
        }
    }

    pub fn as_param(self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::ReducedRedundancy => "REDUCED_REDUNDANCY",
            StorageClass::StandardIa => "STANDARD_IA",
            StorageClass::Glacier => "GLACIER",
            StorageClass::Other => "UNKNOWN",
        }
    }

    /// The class remote writes are tagged with for a given option set;
    /// `ReducedRedundancy` wins over `StandardIa` when both are set.
    pub fn from_opts(opts: &OptionList) -> Self {
        if opts.has(Opt::ReducedRedundancy) {
            StorageClass::ReducedRedundancy
        } else if opts.has(Opt::StandardIa) {
            StorageClass::StandardIa
        } else {
            StorageClass::Standard
        }
    }
}

impl std::fmt::Display for StorageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_param())
    }
}

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub class: StorageClass,
}

#[derive(Debug, Clone)]
pub struct Bucket {
    pub name: String,
    pub creation_date: DateTime<Utc>,
}

/// One page of a listing. `next_token` is `None` on the final page.
#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KeyError {
    pub key: String,
    pub message: String,
}

/// Per-key outcome of a multi-delete request.
#[derive(Debug, Default)]
pub struct BatchDeleteOutcome {
    pub deleted: Vec<String>,
    pub errors: Vec<KeyError>,
}

/// Primitives the job core needs from the remote store. Long transfers
/// (`download`/`upload`) are expected to be multipart under the hood; the
/// core runs them on detached tasks and races them against cancellation.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head_object(&self, url: &S3Url) -> Result<ObjectInfo>;

    async fn copy_object(&self, src: &S3Url, dst: &S3Url, class: StorageClass) -> Result<()>;

    async fn delete_object(&self, url: &S3Url) -> Result<()>;

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<BatchDeleteOutcome>;

    async fn list_buckets(&self) -> Result<Vec<Bucket>>;

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
        token: Option<&str>,
    ) -> Result<ListPage>;

    /// Streams the object into `file`; returns the byte count.
    async fn download(&self, url: &S3Url, file: tokio::fs::File) -> Result<u64>;

    /// Uploads `size` bytes from `file` in parts of `part_size`.
    async fn upload(
        &self,
        url: &S3Url,
        file: tokio::fs::File,
        size: u64,
        part_size: u64,
        class: StorageClass,
    ) -> Result<()>;
}
