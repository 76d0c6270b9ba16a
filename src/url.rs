//! Remote URL parsing: `s3://<bucket>/<key>`.
//!
//! Glob metacharacters in the key select listing rather than exact access;
//! the prefix helpers here feed the remote lister.

use anyhow::{anyhow, Result};

/// Shell glob metacharacters recognized in keys and local path arguments.
pub const GLOB_CHARACTERS: &str = "?*[";

/// Index of the first glob metacharacter in `s`, if any.
pub fn first_glob_index(s: &str) -> Option<usize> {
    s.find(|c| GLOB_CHARACTERS.contains(c))
}

/// True if `s` contains any glob metacharacter.
pub fn has_glob(s: &str) -> bool {
    first_glob_index(s).is_some()
}

/// A parsed remote object address. The key may carry glob metacharacters,
/// in which case operations treat it as a listing pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Url {
    pub bucket: String,
    pub key: String,
    pub version: Option<String>,
}

impl S3Url {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version: None,
        }
    }

    /// Parses `s3://bucket/key`, optionally suffixed with `?versionId=<v>`.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("s3://")
            .ok_or_else(|| anyhow!("not an S3 url: {}", s))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(anyhow!("missing bucket name in {}", s));
        }
        if has_glob(bucket) {
            return Err(anyhow!("bucket name cannot contain wildcards: {}", s));
        }
        let (key, version) = match key.split_once("?versionId=") {
            Some((k, v)) => (k, Some(v.to_string())),
            None => (key, None),
        };
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            version,
        })
    }

    /// `bucket/key`, the form server-side copy takes as its source.
    pub fn format(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    pub fn has_glob(&self) -> bool {
        has_glob(&self.key)
    }

    /// The key up to the first glob metacharacter; the whole key if none.
    pub fn glob_prefix(&self) -> &str {
        match first_glob_index(&self.key) {
            Some(idx) => &self.key[..idx],
            None => &self.key,
        }
    }

    /// The fixed directory portion of the key: everything up to and including
    /// the last `/` before the first glob metacharacter. Listed keys are
    /// reported relative to this.
    pub fn key_dir_prefix(&self) -> &str {
        let cut = self.glob_prefix();
        match cut.rfind('/') {
            Some(idx) => &cut[..=idx],
            None => "",
        }
    }
}

impl std::fmt::Display for S3Url {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.key.is_empty() {
            write!(f, "s3://{}", self.bucket)
        } else {
            write!(f, "s3://{}/{}", self.bucket, self.key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bucket_and_key() -> Result<()> {
        let url = S3Url::parse("s3://mybucket/some/key.txt")?;
        assert_eq!(url.bucket, "mybucket");
        assert_eq!(url.key, "some/key.txt");
        assert_eq!(url.version, None);
        assert_eq!(url.to_string(), "s3://mybucket/some/key.txt");
        assert_eq!(url.format(), "mybucket/some/key.txt");
        Ok(())
    }

    #[test]
    fn parse_bucket_only() -> Result<()> {
        let url = S3Url::parse("s3://mybucket")?;
        assert_eq!(url.bucket, "mybucket");
        assert_eq!(url.key, "");
        assert_eq!(url.to_string(), "s3://mybucket");
        Ok(())
    }

    #[test]
    fn parse_version() -> Result<()> {
        let url = S3Url::parse("s3://b/k?versionId=abc123")?;
        assert_eq!(url.key, "k");
        assert_eq!(url.version.as_deref(), Some("abc123"));
        Ok(())
    }

    #[test]
    fn parse_rejects_bad_urls() {
        assert!(S3Url::parse("/local/path").is_err());
        assert!(S3Url::parse("s3://").is_err());
        assert!(S3Url::parse("s3://bad*bucket/k").is_err());
    }

    #[test]
    fn glob_prefixes() -> Result<()> {
        let url = S3Url::parse("s3://b/prefix/x*.txt")?;
        assert!(url.has_glob());
        assert_eq!(url.glob_prefix(), "prefix/x");
        assert_eq!(url.key_dir_prefix(), "prefix/");

        let url = S3Url::parse("s3://b/prefix/")?;
        assert!(!url.has_glob());
        assert_eq!(url.glob_prefix(), "prefix/");
        assert_eq!(url.key_dir_prefix(), "prefix/");

        let url = S3Url::parse("s3://b/plain")?;
        assert_eq!(url.key_dir_prefix(), "");
        Ok(())
    }
}
