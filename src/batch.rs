//! Batch operations: one listing-shaped command fans out into sub-jobs.
//!
//! Local sources are expanded by shell glob (or walked when the argument is
//! a directory); remote sources go through the glob-aware remote listing.
//! Every produced sub-job inherits the parent's counters and carries a
//! sub-command name of the form `"cp -n --parents"` for human output.

use anyhow::{anyhow, Context, Result};
use async_recursion::async_recursion;
use tokio::sync::mpsc;

use crate::arg::JobArg;
use crate::dispatch::{base_name, record_wild, remote_arg};
use crate::error::JobError;
use crate::job::{Job, ShortCode};
use crate::list::ListItem;
use crate::op::Operation;
use crate::opt::{Opt, OptionList};
use crate::stats::StatCategory;
use crate::store::StorageClass;
use crate::url::{first_glob_index, S3Url};
use crate::wild::{s3_wild_operation, wild_operation};
use crate::worker::WorkerParams;

/// Keys buffered per multi-delete sub-job.
const MAX_BATCH_KEYS: usize = 1000;

/// The sub-command sub-jobs are named with: `cp` or `mv`, plus the
/// serialized option flags.
fn sub_command(opts: &OptionList) -> String {
    let base = if opts.has(Opt::DeleteSource) { "mv" } else { "cp" };
    format!("{}{}", base, opts.params())
}

/// Everything up to and including the last `/` of `s`; empty if none.
fn dir_prefix(s: &str) -> String {
    match s.rfind('/') {
        Some(idx) => s[..=idx].to_string(),
        None => String::new(),
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Best-effort creation of the directory that will contain `path`.
fn prepare_parent_dir(path: &str) {
    if let Some(dir) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(dir);
    }
}

/// Expands a shell glob against the filesystem. Matches are returned sorted,
/// each with its directory-ness; `*` and `?` do not cross `/`.
async fn expand_glob(pattern: &str) -> Result<Vec<(String, bool)>> {
    let matcher = globset::GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("bad glob pattern: {}", pattern))?
        .compile_matcher();
    let fixed = match first_glob_index(pattern) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    };
    let base = dir_prefix(fixed);
    let base_dir = if base.is_empty() { "." } else { base.as_str() };
    match tokio::fs::metadata(base_dir).await {
        Ok(metadata) if metadata.is_dir() => {}
        _ => return Ok(vec![]),
    }
    let mut matches = vec![];
    walk_match(&base, &matcher, &mut matches).await?;
    matches.sort();
    Ok(matches)
}

#[async_recursion]
async fn walk_match(
    dir: &str,
    matcher: &globset::GlobMatcher,
    out: &mut Vec<(String, bool)>,
) -> Result<()> {
    let read_dir = if dir.is_empty() { "." } else { dir };
    let mut entries = tokio::fs::read_dir(read_dir)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", read_dir))?;
    let mut names = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", read_dir))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    for name in names {
        let child = join_path(dir, &name);
        // no-follow, so symlink cycles cannot recurse forever
        let Ok(metadata) = tokio::fs::symlink_metadata(&child).await else {
            continue;
        };
        let is_dir = metadata.is_dir();
        if matcher.is_match(&child) {
            out.push((child.clone(), is_dir));
        }
        if is_dir {
            walk_match(&child, matcher, out).await?;
        }
    }
    Ok(())
}

/// Emits every file under `dir`, lexically ordered, recursively.
#[async_recursion]
async fn walk_files(dir: &str, tx: &mpsc::Sender<Option<String>>) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
    let mut names = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", dir))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    for name in names {
        let child = join_path(dir, &name);
        let metadata = tokio::fs::symlink_metadata(&child)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", child))?;
        if metadata.is_dir() {
            walk_files(&child, tx).await?;
        } else if tx.send(Some(child)).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}

/// Resolves the fixed prefix that `Parents` strips from sub-job sources, and
/// the glob the lister expands. `walk_mode` is set when the source argument
/// is an existing directory.
fn source_prefixes(src: &str, walk_mode: bool) -> Result<(String, String), JobError> {
    if walk_mode {
        let mut glob_start = src.to_string();
        if !glob_start.ends_with('/') {
            glob_start.push('/');
        }
        glob_start.push('*');
        return Ok((dir_prefix(src), glob_start));
    }
    let Some(idx) = first_glob_index(src) else {
        return Err(JobError::Other(anyhow!(
            "internal error, not a glob: {}",
            src
        )));
    };
    Ok((dir_prefix(&src[..idx]), src.to_string()))
}

pub(crate) async fn batch_local_copy(job: &Job, params: &WorkerParams) -> Result<(), JobError> {
    let sub_cmd = sub_command(job.opts());
    let src = job.args()[0].text().to_string();
    let walk_mode = tokio::fs::metadata(&src)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    let (trim_prefix, glob_start) = source_prefixes(&src, walk_mode)?;
    let recursive = job.opts().has(Opt::Recursive);

    let lister = |tx: mpsc::Sender<Option<String>>| async move {
        let result = async {
            let matches = expand_glob(&glob_start).await?;
            if matches.is_empty() {
                if walk_mode {
                    return Ok(()); // directory empty
                }
                return Err(anyhow!("could not find match for glob"));
            }
            for (path, is_dir) in matches {
                if !is_dir {
                    if tx.send(Some(path)).await.is_err() {
                        return Ok(());
                    }
                } else if recursive {
                    walk_files(&path, &tx).await?;
                }
            }
            Ok(())
        }
        .await;
        let _ = tx.send(None).await;
        result
    };

    let parent = job.clone();
    let opts = job.opts().clone();
    let callback = move |item: Option<String>| -> Option<Job> {
        let path = item?;
        let dst_name = if opts.has(Opt::Parents) {
            path.strip_prefix(&trim_prefix).unwrap_or(&path).to_string()
        } else {
            base_name(&path).to_string()
        };
        let src_arg = JobArg::local(path);
        let mut dst_arg = parent.args()[1].clone();
        dst_arg.append(&dst_name, false);
        prepare_parent_dir(dst_arg.text());
        Some(parent.make_sub_job(
            sub_cmd.clone(),
            Operation::LocalCopy,
            vec![src_arg, dst_arg],
            opts.clone(),
        ))
    };

    let result = wild_operation(params, lister, callback).await;
    record_wild(params, StatCategory::FileOp, result)
}

pub(crate) async fn batch_upload(job: &Job, params: &WorkerParams) -> Result<(), JobError> {
    let sub_cmd = sub_command(job.opts());
    let src = job.args()[0].text().to_string();
    let walk_mode = tokio::fs::metadata(&src)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    let (trim_prefix, _) = source_prefixes(&src, walk_mode)?;

    let lister = |tx: mpsc::Sender<Option<String>>| async move {
        let result = async {
            if walk_mode {
                return walk_files(&src, &tx).await;
            }
            let matches = expand_glob(&src).await?;
            if matches.is_empty() {
                return Err(anyhow!("could not find match for glob"));
            }
            for (path, is_dir) in matches {
                if !is_dir && tx.send(Some(path)).await.is_err() {
                    return Ok(());
                }
            }
            Ok(())
        }
        .await;
        let _ = tx.send(None).await;
        result
    };

    let parent = job.clone();
    let opts = job.opts().clone();
    let callback = move |item: Option<String>| -> Option<Job> {
        let path = item?;
        let dst_name = if opts.has(Opt::Parents) {
            path.strip_prefix(&trim_prefix).unwrap_or(&path).to_string()
        } else {
            base_name(&path).to_string()
        };
        let src_arg = JobArg::local(path);
        let mut dst_arg = parent.args()[1].clone();
        dst_arg.append(&dst_name, false);
        Some(parent.make_sub_job(
            sub_cmd.clone(),
            Operation::Upload,
            vec![src_arg, dst_arg],
            opts.clone(),
        ))
    };

    let result = wild_operation(params, lister, callback).await;
    record_wild(params, StatCategory::FileOp, result)
}

pub(crate) async fn batch_download(job: &Job, params: &WorkerParams) -> Result<(), JobError> {
    let sub_cmd = sub_command(job.opts());
    let url = remote_arg(job, 0)?.clone();
    let bucket = url.bucket.clone();
    let parent = job.clone();
    let opts = job.opts().clone();
    let dst_template = job.args()[1].clone();

    let callback = move |item: Option<ListItem>| -> Option<Job> {
        let ListItem::Object {
            key,
            parsed_key,
            class,
            ..
        } = item?
        else {
            return None;
        };
        let src_arg = JobArg::remote(S3Url::new(bucket.clone(), key));
        let dst_name = if opts.has(Opt::Parents) {
            parsed_key
        } else {
            base_name(&parsed_key).to_string()
        };
        let mut dst_arg = dst_template.clone();
        dst_arg.append(&dst_name, true);
        let sub_job = parent.make_sub_job(
            sub_cmd.clone(),
            Operation::Download,
            vec![src_arg, dst_arg],
            opts.clone(),
        );
        if class == StorageClass::Glacier {
            sub_job.out(
                ShortCode::Err,
                format!(
                    "\"{}\": Cannot download glacier object",
                    sub_job.args()[0].text()
                ),
            );
            return None;
        }
        prepare_parent_dir(sub_job.args()[1].text());
        Some(sub_job)
    };

    let result = s3_wild_operation(params, &url, callback).await;
    record_wild(params, StatCategory::S3Op, result)
}

pub(crate) async fn batch_delete(job: &Job, params: &WorkerParams) -> Result<(), JobError> {
    let url = remote_arg(job, 0)?.clone();
    let bucket_arg = JobArg::remote(S3Url::new(url.bucket.clone(), ""));
    let parent = job.clone();

    let mut keys: Vec<String> = Vec::with_capacity(MAX_BATCH_KEYS);
    let callback = move |item: Option<ListItem>| -> Option<Job> {
        let flush = |keys: &mut Vec<String>| {
            let mut args = Vec::with_capacity(keys.len() + 1);
            args.push(bucket_arg.clone());
            args.extend(keys.drain(..).map(JobArg::raw));
            parent.make_sub_job("batch-rm", Operation::BatchDeleteActual, args, OptionList::new())
        };
        match item {
            None => {
                if keys.is_empty() {
                    None
                } else {
                    Some(flush(&mut keys))
                }
            }
            Some(ListItem::CommonPrefix { .. }) => None,
            Some(ListItem::Object { key, .. }) => {
                keys.push(key);
                if keys.len() == MAX_BATCH_KEYS {
                    Some(flush(&mut keys))
                } else {
                    None
                }
            }
        }
    };

    let result = s3_wild_operation(params, &url, callback).await;
    record_wild(params, StatCategory::S3Op, result)
}
