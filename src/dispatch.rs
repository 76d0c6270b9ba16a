//! The operation dispatcher: a total function from a job and its worker
//! parameters to a result.

use anyhow::{anyhow, Context};

use crate::batch;
use crate::config::MAX_UPLOAD_PARTS;
use crate::error::{AcceptableError, JobError};
use crate::job::{Job, ShortCode};
use crate::op::Operation;
use crate::opt::Opt;
use crate::stats::StatCategory;
use crate::store::StorageClass;
use crate::url::S3Url;
use crate::worker::WorkerParams;

pub(crate) const DATE_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

const BYTES_IN_MB: u64 = 1024 * 1024;

/// Selects and runs the implementation for the job's operation code.
pub async fn run(job: &Job, params: &WorkerParams) -> Result<(), JobError> {
    match job.operation() {
        // local operations
        Operation::LocalDelete => {
            let path = job.args()[0].text();
            let result = remove_local(path).await;
            params
                .stats
                .record(StatCategory::FileOp, result)
                .map_err(JobError::from)
        }

        Operation::LocalCopy => {
            let src = job.args()[0].text();
            let dst = job.args()[1].text();
            if job.opts().has(Opt::IfNotExists) {
                ensure_local_absent(dst).await?;
            }
            let result = if job.opts().has(Opt::DeleteSource) {
                tokio::fs::rename(src, dst)
                    .await
                    .with_context(|| format!("failed renaming {:?} to {:?}", src, dst))
            } else {
                copy_local_file(src, dst).await
            };
            params
                .stats
                .record(StatCategory::FileOp, result)
                .map_err(JobError::from)
        }

        Operation::ShellExec => {
            let mut command = tokio::process::Command::new(job.args()[0].text());
            for arg in &job.args()[1..] {
                command.arg(arg.text());
            }
            command.kill_on_drop(true);
            let mut child = command
                .spawn()
                .with_context(|| format!("failed launching {:?}", job.args()[0].text()))?;
            let result = tokio::select! {
                _ = params.cancel.cancelled() => Err(JobError::Interrupted),
                status = child.wait() => match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(anyhow!("command exited with {}", status).into()),
                    Err(err) => Err(JobError::Other(
                        anyhow::Error::from(err).context("failed waiting for command"),
                    )),
                },
            };
            if result.is_ok() {
                params.stats.increment(StatCategory::ShellOp);
            }
            result
        }

        // single-target remote operations
        Operation::Delete => {
            let url = remote_arg(job, 0)?;
            let result = params.store.delete_object(url).await;
            params
                .stats
                .record(StatCategory::S3Op, result)
                .map_err(JobError::from)
        }

        Operation::Copy => {
            let src = remote_arg(job, 0)?;
            let dst = remote_arg(job, 1)?;
            if job.opts().has(Opt::IfNotExists) && params.store.head_object(dst).await.is_ok() {
                params.stats.increment(StatCategory::S3Op);
                return Err(AcceptableError::object_exists().into());
            }
            let class = StorageClass::from_opts(job.opts());
            let result = params.store.copy_object(src, dst, class).await;
            params.stats.record(StatCategory::S3Op, result)?;
            if job.opts().has(Opt::DeleteSource) {
                // rollback is deliberately not attempted when this fails;
                // the source delete error is surfaced as-is
                let result = params.store.delete_object(src).await;
                params.stats.record(StatCategory::S3Op, result)?;
            }
            Ok(())
        }

        Operation::Download => download(job, params).await,

        Operation::Upload => upload(job, params).await,

        // batch (fan-out) operations
        Operation::BatchLocalCopy => batch::batch_local_copy(job, params).await,
        Operation::BatchUpload => batch::batch_upload(job, params).await,
        Operation::BatchDownload => batch::batch_download(job, params).await,
        Operation::BatchDelete => batch::batch_delete(job, params).await,

        Operation::BatchDeleteActual => batch_delete_actual(job, params).await,

        // listing and introspection
        Operation::ListBuckets => {
            let buckets = params.store.list_buckets().await;
            let buckets = params.stats.record(StatCategory::S3Op, buckets)?;
            for bucket in buckets {
                job.out(
                    ShortCode::Ok,
                    format!(
                        "{}  s3://{}",
                        bucket.creation_date.format(DATE_FORMAT),
                        bucket.name
                    ),
                );
            }
            Ok(())
        }

        Operation::List => {
            let url = remote_arg(job, 0)?;
            let line_job = job.clone();
            let result = crate::wild::s3_wild_operation(params, url, move |item| {
                match item? {
                    crate::list::ListItem::CommonPrefix { parsed_key } => {
                        line_job.out(
                            ShortCode::Ok,
                            format!("{:>19} {:>1}  {:>12}  {}", "", "", "DIR", parsed_key),
                        );
                    }
                    crate::list::ListItem::Object {
                        parsed_key,
                        size,
                        last_modified,
                        class,
                        ..
                    } => {
                        line_job.out(
                            ShortCode::Ok,
                            format!(
                                "{} {:>1}  {:>12}  {}",
                                last_modified.format(DATE_FORMAT),
                                class.code(),
                                size,
                                parsed_key
                            ),
                        );
                    }
                }
                None
            })
            .await;
            record_wild(params, StatCategory::S3Op, result)
        }

        Operation::Size => {
            let url = remote_arg(job, 0)?;
            let totals = std::sync::Arc::new(std::sync::Mutex::new((0u64, 0u64)));
            let callback_totals = totals.clone();
            let result = crate::wild::s3_wild_operation(params, url, move |item| {
                if let Some(crate::list::ListItem::Object { size, .. }) = item {
                    let mut totals = callback_totals
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    totals.0 += size;
                    totals.1 += 1;
                }
                None
            })
            .await;
            if result.is_ok() {
                let (size, count) = *totals.lock().unwrap_or_else(|e| e.into_inner());
                job.out(
                    ShortCode::Ok,
                    format!("{} bytes in {} objects: {}", size, count, url),
                );
            }
            record_wild(params, StatCategory::S3Op, result)
        }

        Operation::Abort => {
            let exit_code = match job.args().first() {
                Some(arg) => match arg.text().parse::<i8>() {
                    Ok(code) => i32::from(code),
                    Err(_) => 255,
                },
                None => -1,
            };
            let exit_fn = params
                .exit_fn
                .as_ref()
                .ok_or_else(|| anyhow!("internal error: no exit function configured"))?;
            (**exit_fn)(exit_code);
            Ok(())
        }
    }
}

/// Pulls the parsed remote URL out of argument `index`; the parser
/// guarantees the side pattern, so a miss is an internal error.
pub(crate) fn remote_arg(job: &Job, index: usize) -> Result<&S3Url, JobError> {
    job.args()
        .get(index)
        .and_then(|arg| arg.url())
        .ok_or_else(|| {
            JobError::Other(anyhow!(
                "internal error: argument {} of \"{}\" is not a remote URL",
                index,
                job
            ))
        })
}

/// Success of a wild operation counts once toward `category`.
pub(crate) fn record_wild(
    params: &WorkerParams,
    category: StatCategory,
    result: Result<(), JobError>,
) -> Result<(), JobError> {
    if result.is_ok() {
        params.stats.increment(category);
    }
    result
}

/// Ok if `path` does not exist, an acceptable error if it does.
async fn ensure_local_absent(path: &str) -> Result<(), JobError> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Err(AcceptableError::file_exists().into()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(JobError::Other(
            anyhow::Error::from(err).context(format!("failed checking {:?}", path)),
        )),
    }
}

/// Unlinks a file or an empty directory.
async fn remove_local(path: &str) -> anyhow::Result<()> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", path))?;
    if metadata.is_dir() {
        tokio::fs::remove_dir(path)
            .await
            .with_context(|| format!("failed removing directory {:?}", path))
    } else {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("failed removing {:?}", path))
    }
}

/// Copies a regular file preserving its mode and timestamps.
async fn copy_local_file(src: &str, dst: &str) -> anyhow::Result<()> {
    let mut reader = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("cannot open {:?} for reading", src))?;
    let mut writer = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("cannot open {:?} for writing", dst))?;
    tokio::io::copy(&mut reader, &mut writer)
        .await
        .with_context(|| format!("failed copying data to {:?}", dst))?;
    let metadata = reader
        .metadata()
        .await
        .with_context(|| format!("failed reading metadata from {:?}", src))?;
    writer
        .set_permissions(metadata.permissions())
        .await
        .with_context(|| format!("cannot set permissions on {:?}", dst))?;
    drop(writer);
    copy_times(&metadata, dst).await?;
    Ok(())
}

#[cfg(unix)]
async fn copy_times(metadata: &std::fs::Metadata, dst: &str) -> anyhow::Result<()> {
    use std::os::unix::fs::MetadataExt;
    let atime = nix::sys::time::TimeSpec::new(metadata.atime(), metadata.atime_nsec());
    let mtime = nix::sys::time::TimeSpec::new(metadata.mtime(), metadata.mtime_nsec());
    let dst = std::path::PathBuf::from(dst);
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        nix::sys::stat::utimensat(
            None,
            &dst,
            &atime,
            &mtime,
            nix::sys::stat::UtimensatFlags::NoFollowSymlink,
        )
        .map_err(anyhow::Error::from)?;
        Ok(())
    })
    .await
    .context("failed setting timestamps")?
}

#[cfg(not(unix))]
async fn copy_times(_metadata: &std::fs::Metadata, _dst: &str) -> anyhow::Result<()> {
    Ok(())
}

/// The final path component of `s`, with `/` as the separator on both sides.
pub(crate) fn base_name(s: &str) -> &str {
    let trimmed = s.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// The chunk size (in whole megabytes) an upload of `file_size` bytes uses:
/// the configured size, recomputed upward when the file would need more
/// parts than the store allows.
pub(crate) fn upload_chunk_mb(file_size: u64, configured_chunk_bytes: u64) -> u64 {
    let configured = configured_chunk_bytes.max(1);
    let num_parts = file_size.div_ceil(configured);
    if num_parts > MAX_UPLOAD_PARTS {
        ((file_size as f64 / MAX_UPLOAD_PARTS as f64) / BYTES_IN_MB as f64).ceil() as u64
    } else {
        configured / BYTES_IN_MB
    }
}

async fn download(job: &Job, params: &WorkerParams) -> Result<(), JobError> {
    let src = remote_arg(job, 0)?;
    let src_name = base_name(job.args()[0].text()).to_string();
    let dst_path = job.args()[1].text().to_string();

    if job.opts().has(Opt::IfNotExists) {
        ensure_local_absent(&dst_path).await?;
    }
    let file = tokio::fs::File::create(&dst_path)
        .await
        .with_context(|| format!("cannot create {:?}", dst_path))?;

    job.out(ShortCode::Info, format!("Downloading {}...", src_name));

    let store = params.store.clone();
    let url = src.clone();
    let transfer = tokio::spawn(async move { store.download(&url, file).await });

    let result: Result<(), JobError> = tokio::select! {
        _ = params.cancel.cancelled() => Err(JobError::Interrupted),
        joined = transfer => match joined {
            Ok(Ok(_bytes)) => Ok(()),
            Ok(Err(err)) => Err(JobError::Other(err)),
            Err(join_err) => Err(JobError::Other(join_err.into())),
        },
    };

    if result.is_ok() {
        params.stats.increment(StatCategory::S3Op);
    } else {
        // remove the partly downloaded file
        let _ = tokio::fs::remove_file(&dst_path).await;
        return result;
    }

    if job.opts().has(Opt::DeleteSource) {
        let deleted = params.store.delete_object(src).await;
        params.stats.record(StatCategory::S3Op, deleted)?;
    }
    Ok(())
}

async fn upload(job: &Job, params: &WorkerParams) -> Result<(), JobError> {
    let src_path = job.args()[0].text().to_string();
    let src_name = base_name(&src_path).to_string();
    let dst = remote_arg(job, 1)?;

    let metadata = tokio::fs::metadata(&src_path)
        .await
        .with_context(|| format!("cannot stat {:?}", src_path))?;

    if job.opts().has(Opt::IfNotExists) && params.store.head_object(dst).await.is_ok() {
        params.stats.increment(StatCategory::S3Op);
        return Err(AcceptableError::object_exists().into());
    }

    let file = tokio::fs::File::open(&src_path)
        .await
        .with_context(|| format!("cannot open {:?} for reading", src_path))?;

    let file_size = metadata.len();
    let chunk_mb = upload_chunk_mb(file_size, params.chunk_size_bytes);
    if chunk_mb * BYTES_IN_MB != params.chunk_size_bytes {
        job.out(
            ShortCode::Info,
            format!(
                "Uploading {}... ({} bytes) (chunk size {} MB)",
                src_name, file_size, chunk_mb
            ),
        );
    } else {
        job.out(
            ShortCode::Info,
            format!("Uploading {}... ({} bytes)", src_name, file_size),
        );
    }

    let class = StorageClass::from_opts(job.opts());
    let store = params.store.clone();
    let url = dst.clone();
    let part_size = chunk_mb * BYTES_IN_MB;
    let transfer =
        tokio::spawn(async move { store.upload(&url, file, file_size, part_size, class).await });

    let result: Result<(), JobError> = tokio::select! {
        _ = params.cancel.cancelled() => Err(JobError::Interrupted),
        joined = transfer => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(JobError::Other(err)),
            Err(join_err) => Err(JobError::Other(join_err.into())),
        },
    };
    if result.is_err() {
        return result;
    }
    params.stats.increment(StatCategory::S3Op);

    if job.opts().has(Opt::DeleteSource) {
        let removed = tokio::fs::remove_file(&src_path)
            .await
            .with_context(|| format!("failed removing {:?}", src_path));
        params.stats.record(StatCategory::FileOp, removed)?;
    }
    Ok(())
}

/// Multi-deletes the buffered keys of one batch, printing a line per key.
/// The operation's own error is the last per-key error message, if any.
async fn batch_delete_actual(job: &Job, params: &WorkerParams) -> Result<(), JobError> {
    let bucket = remote_arg(job, 0)?.bucket.clone();
    let keys: Vec<String> = job.args()[1..]
        .iter()
        .map(|arg| arg.text().to_string())
        .collect();
    let outcome = params
        .store
        .delete_objects(&bucket, &keys)
        .await
        .with_context(|| format!("multi-delete failed for bucket {}", bucket))?;
    for key in &outcome.deleted {
        job.out(ShortCode::Ok, format!("Batch-delete s3://{}/{}", bucket, key));
    }
    let mut last_error: Option<String> = None;
    for err in &outcome.errors {
        job.out(
            ShortCode::Err,
            format!("Batch-delete s3://{}/{}: {}", bucket, err.key, err.message),
        );
        last_error = Some(err.message.clone());
    }
    let result = match last_error {
        Some(message) => Err(anyhow!(message)),
        None => Ok(()),
    };
    params
        .stats
        .record(StatCategory::S3Op, result)
        .map_err(JobError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_variants() {
        assert_eq!(base_name("a/b/c.txt"), "c.txt");
        assert_eq!(base_name("c.txt"), "c.txt");
        assert_eq!(base_name("s3://b/k/x.bin"), "x.bin");
        assert_eq!(base_name("dir/"), "dir");
    }

    #[test]
    fn chunk_size_stays_configured_within_bound() {
        let five_mb = 5 * BYTES_IN_MB;
        assert_eq!(upload_chunk_mb(0, five_mb), 5);
        assert_eq!(upload_chunk_mb(100 * BYTES_IN_MB, five_mb), 5);
        assert_eq!(upload_chunk_mb(MAX_UPLOAD_PARTS * five_mb, five_mb), 5);
    }

    #[test]
    fn chunk_size_recomputes_to_satisfy_part_bound() {
        let one_mb = BYTES_IN_MB;
        for file_size in [
            MAX_UPLOAD_PARTS * one_mb + 1,
            3 * MAX_UPLOAD_PARTS * one_mb,
            100 * MAX_UPLOAD_PARTS * one_mb + 12_345,
        ] {
            let chunk_mb = upload_chunk_mb(file_size, one_mb);
            let chunk_bytes = chunk_mb * BYTES_IN_MB;
            assert!(chunk_bytes >= one_mb);
            let parts = file_size.div_ceil(chunk_bytes);
            assert!(
                parts <= MAX_UPLOAD_PARTS,
                "{} bytes with {} MB chunks needs {} parts",
                file_size,
                chunk_mb,
                parts
            );
        }
    }
}
