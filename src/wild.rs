//! The fan-out engine coupling a listing producer to a per-item sub-job
//! factory.
//!
//! The lister emits items on a channel, followed by one end-of-stream
//! sentinel (`None`). A consumer task invokes the callback for every item in
//! emission order (sentinel included, so buffering callbacks can flush),
//! stamps produced sub-jobs with the operation's notifier, and submits them
//! to the worker pool. A tallier task counts completions off the notifier
//! channel; the caller waits until every issued sub-job has been accounted
//! for and reports an aggregate error when any of them failed.

use anyhow::anyhow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::JobError;
use crate::job::Job;
use crate::list::{s3_list, ListItem};
use crate::url::S3Url;
use crate::worker::WorkerParams;

const ITEM_CHANNEL_CAPACITY: usize = 64;
const NOTIFY_CHANNEL_CAPACITY: usize = 64;
const WAIT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

/// Runs `lister`, fans its items out through `callback`, and blocks until
/// every submitted sub-job has reported. A lister failure is returned after
/// the already-submitted sub-jobs have drained; otherwise the result is an
/// error iff not every sub-job succeeded.
pub async fn wild_operation<T, L, Fut, C>(
    params: &WorkerParams,
    lister: L,
    mut callback: C,
) -> Result<(), JobError>
where
    T: Send + 'static,
    L: FnOnce(mpsc::Sender<Option<T>>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
    C: FnMut(Option<T>) -> Option<Job> + Send + 'static,
{
    let (item_tx, mut item_rx) = mpsc::channel::<Option<T>>(ITEM_CHANNEL_CAPACITY);
    let (notify_tx, mut notify_rx) = mpsc::channel::<bool>(NOTIFY_CHANNEL_CAPACITY);
    let processed = Arc::new(AtomicU32::new(0));
    let successful = Arc::new(AtomicU32::new(0));

    // consumer: issue sub-jobs for every listed item, in order
    let queue = params.queue.clone();
    let sub_notify_tx = notify_tx.clone();
    let consumer = tokio::spawn(async move {
        let mut issued: u32 = 0;
        while let Some(item) = item_rx.recv().await {
            let end_of_stream = item.is_none();
            if let Some(mut sub_job) = callback(item) {
                sub_job.set_notifier(sub_notify_tx.clone());
                issued += 1;
                queue.submit(sub_job);
            }
            if end_of_stream {
                break;
            }
        }
        issued
    });

    // tallier: count completions; successful before processed, so a reader
    // that observes the processed count also observes the successes
    let tally_processed = processed.clone();
    let tally_successful = successful.clone();
    let tallier = tokio::spawn(async move {
        while let Some(result) = notify_rx.recv().await {
            if result {
                tally_successful.fetch_add(1, Ordering::Release);
            }
            tally_processed.fetch_add(1, Ordering::Release);
        }
    });

    let lister_result = lister(item_tx).await;

    // the lister dropped its sender; the consumer ends on the sentinel or on
    // the closed channel
    let issued = match consumer.await {
        Ok(issued) => issued,
        Err(join_err) => {
            drop(notify_tx);
            let _ = tallier.await;
            return Err(JobError::Other(join_err.into()));
        }
    };

    // wait for all issued sub-jobs to be accounted for
    while processed.load(Ordering::Acquire) < issued {
        if params.cancel.is_cancelled() {
            drop(notify_tx);
            let _ = tallier.await;
            return Err(JobError::Interrupted);
        }
        tokio::time::sleep(WAIT_BACKOFF).await;
    }
    drop(notify_tx);
    let _ = tallier.await;

    lister_result?;

    let successful = successful.load(Ordering::Acquire);
    if successful != issued {
        return Err(anyhow!(
            "not all jobs completed successfully: {}/{}",
            successful,
            issued
        )
        .into());
    }
    Ok(())
}

/// [`wild_operation`] over a remote listing: lists `url` glob-aware and
/// passes every [`ListItem`] to `callback`.
pub async fn s3_wild_operation<C>(
    params: &WorkerParams,
    url: &S3Url,
    callback: C,
) -> Result<(), JobError>
where
    C: FnMut(Option<ListItem>) -> Option<Job> + Send + 'static,
{
    let store = params.store.clone();
    let url = url.clone();
    wild_operation(
        params,
        move |tx| async move {
            let result = s3_list(store.as_ref(), &url, &tx).await;
            // no sentinel on a failed listing: the dropped sender closes the
            // channel and buffering callbacks must not flush
            if result.is_ok() {
                let _ = tx.send(None).await;
            }
            result
        },
        callback,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arg::JobArg;
    use crate::op::Operation;
    use crate::opt::OptionList;
    use crate::stats::Stats;
    use crate::store::{MemoryStore, StorageClass};
    use crate::worker::JobQueue;
    use tokio_util::sync::CancellationToken;

    /// Params plus a minimal single-task executor draining the queue.
    fn test_params(store: Arc<MemoryStore>) -> (WorkerParams, tokio::task::JoinHandle<()>) {
        let (queue, mut rx) = JobQueue::unbounded();
        let params = WorkerParams {
            cancel: CancellationToken::new(),
            store,
            stats: Arc::new(Stats::new()),
            chunk_size_bytes: bytesize::ByteSize::mib(5).0,
            queue,
            exit_fn: None,
        };
        let exec_params = params.clone();
        let executor = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                crate::worker::execute(job, &exec_params).await;
                exec_params.queue.done();
            }
        });
        (params, executor)
    }

    fn delete_sub_job(parent: &Job, key: &str) -> Job {
        parent.make_sub_job(
            "rm",
            Operation::Delete,
            vec![JobArg::remote(S3Url::new("b", key))],
            OptionList::new(),
        )
    }

    #[test_log::test(tokio::test)]
    async fn all_items_fan_out_and_succeed() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..10 {
            store.put_object("b", &format!("k{}", i), b"x", StorageClass::Standard);
        }
        let (params, _executor) = test_params(store.clone());
        let parent = Job::new(
            "rm s3://b/k*",
            "rm",
            Operation::BatchDelete,
            vec![],
            OptionList::new(),
        );
        let keys: Vec<String> = (0..10).map(|i| format!("k{}", i)).collect();
        let callback_parent = parent.clone();
        wild_operation(
            &params,
            |tx| async move {
                for key in keys {
                    if tx.send(Some(key)).await.is_err() {
                        break;
                    }
                }
                let _ = tx.send(None).await;
                Ok(())
            },
            move |item: Option<String>| item.map(|key| delete_sub_job(&callback_parent, &key)),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
        assert_eq!(store.object_count("b"), 0);
        // every sub-job reported exactly once
        assert_eq!(parent.counters().success(), 10);
        assert_eq!(parent.counters().fails(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn failed_sub_jobs_produce_an_aggregate_error() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        for key in ["a", "b", "c"] {
            store.put_object("b", key, b"x", StorageClass::Standard);
        }
        store.fail_delete("b", "b");
        let (params, _executor) = test_params(store.clone());
        let parent = Job::new(
            "rm s3://b/*",
            "rm",
            Operation::BatchDelete,
            vec![],
            OptionList::new(),
        );
        let callback_parent = parent.clone();
        let err = wild_operation(
            &params,
            |tx| async move {
                for key in ["a", "b", "c"] {
                    if tx.send(Some(key.to_string())).await.is_err() {
                        break;
                    }
                }
                let _ = tx.send(None).await;
                Ok(())
            },
            move |item: Option<String>| item.map(|key| delete_sub_job(&callback_parent, &key)),
        )
        .await
        .expect_err("one sub-job fails");
        assert!(err.to_string().contains("2/3"), "unexpected error: {}", err);
        assert_eq!(parent.counters().success(), 2);
        assert_eq!(parent.counters().fails(), 1);
        assert_eq!(
            parent.counters().success() + parent.counters().fails(),
            3,
            "counter conservation"
        );
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn lister_error_is_returned_after_drain() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.put_object("b", "early", b"x", StorageClass::Standard);
        let (params, _executor) = test_params(store.clone());
        let parent = Job::new(
            "rm s3://b/*",
            "rm",
            Operation::BatchDelete,
            vec![],
            OptionList::new(),
        );
        let callback_parent = parent.clone();
        let err = wild_operation(
            &params,
            |tx| async move {
                // one item goes out before the listing breaks; no sentinel
                let _ = tx.send(Some("early".to_string())).await;
                Err(anyhow::anyhow!("listing broke"))
            },
            move |item: Option<String>| item.map(|key| delete_sub_job(&callback_parent, &key)),
        )
        .await
        .expect_err("lister failed");
        assert!(err.to_string().contains("listing broke"));
        // the already-submitted sub-job was drained before returning
        assert!(!store.contains("b", "early"));
        assert_eq!(parent.counters().success(), 1);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn failed_listing_does_not_flush_buffered_deletes() -> anyhow::Result<()> {
        // page one of the listing succeeds, page two fails: the adapter must
        // withhold the EOF sentinel so the buffering batch-delete callback
        // never flushes a partial multi-delete
        let store = Arc::new(MemoryStore::with_page_size(2));
        for key in ["p/a", "p/b", "p/c", "p/d"] {
            store.put_object("b", key, b"x", StorageClass::Standard);
        }
        store.fail_list_after_pages(1);
        let (params, _executor) = test_params(store.clone());
        let job = Job::new(
            "rm s3://b/p/*",
            "rm",
            Operation::BatchDelete,
            vec![JobArg::remote(S3Url::parse("s3://b/p/*")?)],
            OptionList::new(),
        );
        let err = crate::batch::batch_delete(&job, &params)
            .await
            .expect_err("listing breaks on the second page");
        assert!(
            err.to_string().contains("failed listing"),
            "unexpected error: {}",
            err
        );
        // no multi-delete request went out and every object is still there
        assert!(store.delete_batch_sizes().is_empty());
        assert_eq!(store.object_count("b"), 4);
        assert_eq!(job.counters().success(), 0);
        assert_eq!(job.counters().fails(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn eof_sentinel_reaches_the_callback() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.put_object("b", "flushed", b"x", StorageClass::Standard);
        let (params, _executor) = test_params(store.clone());
        let parent = Job::new(
            "rm s3://b/*",
            "rm",
            Operation::BatchDelete,
            vec![],
            OptionList::new(),
        );
        let callback_parent = parent.clone();
        // the callback only produces its job on the sentinel, like the
        // buffering batch-delete callback does
        wild_operation(
            &params,
            |tx| async move {
                let _ = tx.send(None).await;
                Ok(())
            },
            move |item: Option<String>| match item {
                Some(_) => None,
                None => Some(delete_sub_job(&callback_parent, "flushed")),
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
        assert!(!store.contains("b", "flushed"));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn empty_listing_returns_ok() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let (params, _executor) = test_params(store);
        let result = wild_operation(
            &params,
            |tx| async move {
                let _ = tx.send(None).await;
                Ok(())
            },
            |_item: Option<String>| None,
        )
        .await;
        assert!(result.is_ok());
        Ok(())
    }
}
