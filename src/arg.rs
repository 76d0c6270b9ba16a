//! Typed command arguments.
//!
//! An argument is a local path, a parsed remote URL, or an opaque string.
//! Appending a path fragment is aware of which side the argument lives on:
//! remote keys always use `/`, local paths use the host separator, and a
//! remote argument keeps its display text and its key in lock-step.

use crate::url::S3Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobArg {
    /// A path on the local filesystem, kept in its original textual form.
    Local(String),
    /// A remote object address; `text` mirrors `url` and is what the user sees.
    Remote { text: String, url: S3Url },
    /// An opaque string (shell-exec argv entries, exit codes, delete keys).
    Raw(String),
}

impl JobArg {
    pub fn local(path: impl Into<String>) -> Self {
        JobArg::Local(path.into())
    }

    pub fn remote(url: S3Url) -> Self {
        JobArg::Remote {
            text: url.to_string(),
            url,
        }
    }

    pub fn raw(s: impl Into<String>) -> Self {
        JobArg::Raw(s.into())
    }

    /// The verbatim text of the argument.
    pub fn text(&self) -> &str {
        match self {
            JobArg::Local(text) | JobArg::Raw(text) => text,
            JobArg::Remote { text, .. } => text,
        }
    }

    pub fn url(&self) -> Option<&S3Url> {
        match self {
            JobArg::Remote { url, .. } => Some(url),
            _ => None,
        }
    }

    /// Appends a path fragment, converting separators to the convention of
    /// this argument's side. `remote_fragment` says which convention the
    /// fragment arrived in. A remote argument extends its key alongside its
    /// text.
    pub fn append(&mut self, fragment: &str, remote_fragment: bool) -> &mut Self {
        let sep = std::path::MAIN_SEPARATOR;
        match self {
            JobArg::Remote { text, url } => {
                let fragment = if remote_fragment {
                    fragment.to_string()
                } else {
                    fragment.replace(sep, "/")
                };
                text.push_str(&fragment);
                url.key.push_str(&fragment);
            }
            JobArg::Local(text) | JobArg::Raw(text) => {
                let fragment = if remote_fragment {
                    fragment.replace('/', &sep.to_string())
                } else {
                    fragment.to_string()
                };
                text.push_str(&fragment);
            }
        }
        self
    }
}

impl std::fmt::Display for JobArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_is_disjoint() {
        let mut orig = JobArg::remote(S3Url::new("b", "p/"));
        let copy = orig.clone();
        orig.append("x", true);
        assert_eq!(orig.text(), "s3://b/p/x");
        assert_eq!(copy.text(), "s3://b/p/");
    }

    #[test]
    fn remote_append_keeps_key_in_step() {
        let mut arg = JobArg::remote(S3Url::new("b", "p/"));
        arg.append("sub/file.txt", false);
        assert_eq!(arg.text(), "s3://b/p/sub/file.txt");
        assert_eq!(arg.url().unwrap().key, "p/sub/file.txt");
    }

    #[test]
    fn local_append_converts_remote_fragment() {
        let sep = std::path::MAIN_SEPARATOR;
        let mut arg = JobArg::local("out/");
        arg.append("a/b/c.txt", true);
        assert_eq!(arg.text(), format!("out/a{sep}b{sep}c.txt"));
    }

    #[test]
    fn local_append_keeps_local_fragment() {
        let mut arg = JobArg::local("dir");
        arg.append("/file", false);
        assert_eq!(arg.text(), "dir/file");
        assert!(arg.url().is_none());
    }
}
