//! The unit of execution and its result accounting.
//!
//! A root job owns a fresh [`Counters`] triple; sub-jobs alias their
//! parent's, so results roll up automatically. Per-item output goes to plain
//! stdout with a short-code prefix; root-job summaries go through the
//! logger.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::arg::JobArg;
use crate::error::{cleanup_error, AcceptableError, JobError};
use crate::op::Operation;
use crate::opt::OptionList;

/// Success / acceptable-failure / hard-failure counts shared across a job
/// tree. Only the words inside mutate; the handle itself is immutable.
#[derive(Debug, Default)]
pub struct Counters {
    success: AtomicU32,
    acceptable_fails: AtomicU32,
    fails: AtomicU32,
}

impl Counters {
    pub fn success(&self) -> u32 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn acceptable_fails(&self) -> u32 {
        self.acceptable_fails.load(Ordering::Relaxed)
    }

    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Relaxed)
    }
}

/// Short result codes prefixed to per-item output lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortCode {
    Ok,
    OkWithError,
    Err,
    Info,
}

impl ShortCode {
    fn token(self) -> &'static str {
        match self {
            ShortCode::Ok => "+OK",
            ShortCode::OkWithError => "+OK?",
            ShortCode::Err => "-ERR",
            ShortCode::Info => "#",
        }
    }
}

const NOTIFY_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Job {
    source_desc: String,
    command: String,
    operation: Operation,
    args: Vec<JobArg>,
    opts: OptionList,
    success_next: Option<Box<Job>>,
    fail_next: Option<Box<Job>>,
    notifier: Option<mpsc::Sender<bool>>,
    is_sub_job: bool,
    counters: Arc<Counters>,
}

impl Job {
    pub fn new(
        source_desc: impl Into<String>,
        command: impl Into<String>,
        operation: Operation,
        args: Vec<JobArg>,
        opts: OptionList,
    ) -> Self {
        Self {
            source_desc: source_desc.into(),
            command: command.into(),
            operation,
            args,
            opts,
            success_next: None,
            fail_next: None,
            notifier: None,
            is_sub_job: false,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Queue `next` if this job ends without (hard) error. Root jobs only.
    pub fn with_success_next(mut self, next: Job) -> Self {
        self.success_next = Some(Box::new(next));
        self
    }

    /// Queue `next` if this job ends with a hard error. Root jobs only.
    pub fn with_fail_next(mut self, next: Job) -> Self {
        self.fail_next = Some(Box::new(next));
        self
    }

    /// Creates a sub-job linked to this one: the source description is
    /// inherited and the counter handles alias this job's.
    pub fn make_sub_job(
        &self,
        command: impl Into<String>,
        operation: Operation,
        args: Vec<JobArg>,
        opts: OptionList,
    ) -> Self {
        Self {
            source_desc: self.source_desc.clone(),
            command: command.into(),
            operation,
            args,
            opts,
            success_next: None,
            fail_next: None,
            notifier: None,
            is_sub_job: true,
            counters: self.counters.clone(),
        }
    }

    pub fn source_desc(&self) -> &str {
        &self.source_desc
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn args(&self) -> &[JobArg] {
        &self.args
    }

    pub fn opts(&self) -> &OptionList {
        &self.opts
    }

    pub fn is_sub_job(&self) -> bool {
        self.is_sub_job
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub(crate) fn set_notifier(&mut self, notifier: mpsc::Sender<bool>) {
        self.notifier = Some(notifier);
    }

    pub(crate) fn take_next(&mut self, success: bool) -> Option<Box<Job>> {
        if success {
            self.success_next.take()
        } else {
            self.fail_next.take()
        }
    }

    /// Emits one per-item output line and bumps the matching counter.
    pub(crate) fn out(&self, code: ShortCode, message: impl std::fmt::Display) {
        println!("                    {} {}", code.token(), message);
        match code {
            ShortCode::Ok => {
                self.counters.success.fetch_add(1, Ordering::Relaxed);
            }
            ShortCode::OkWithError => {
                self.counters.acceptable_fails.fetch_add(1, Ordering::Relaxed);
            }
            ShortCode::Err => {
                self.counters.fails.fetch_add(1, Ordering::Relaxed);
            }
            ShortCode::Info => {}
        }
    }

    /// Reports a positive outcome; `err` carries the acceptable error when
    /// the job finished in the considered-successful state.
    pub(crate) fn report_ok(&self, err: Option<&AcceptableError>) {
        if self.operation.is_internal() {
            return;
        }
        if self.is_sub_job {
            match err {
                Some(err) => self.out(ShortCode::OkWithError, format!("\"{}\" ({})", self, err)),
                None => self.out(ShortCode::Ok, format!("\"{}\"", self)),
            }
            return;
        }

        let mut status = "OK";
        let err_str = match err {
            Some(err) => {
                status = "OK?";
                format!(" ({})", err)
            }
            None => String::new(),
        };

        // acceptable failures count toward the success total
        let acceptable = self.counters.acceptable_fails();
        let total_success = self.counters.success() + acceptable;
        if acceptable > 0 {
            status = "OK?";
        }
        let fails = self.counters.fails();

        if total_success > 0 {
            if fails > 0 {
                tracing::info!(
                    "+{} \"{}\"{} ({}, {} failed)",
                    status,
                    self,
                    err_str,
                    total_success,
                    fails
                );
            } else {
                tracing::info!("+{} \"{}\"{} ({})", status, self, err_str, total_success);
            }
        } else if fails > 0 {
            tracing::info!("+{} \"{}\"{} ({} failed)", status, self, err_str, fails);
        } else {
            tracing::info!("+{} \"{}\"{}", status, self, err_str);
        }
    }

    pub(crate) fn report_err(&self, err: &JobError) {
        if self.operation.is_internal() {
            return;
        }
        let err_str = cleanup_error(err);
        if self.is_sub_job {
            self.out(ShortCode::Err, format!("\"{}\": {}", self, err_str));
        } else {
            tracing::error!("-ERR \"{}\": {}", self, err_str);
        }
    }

    /// Writes the job's outcome to the notifier channel, if one is attached.
    /// A non-blocking send is attempted; while the channel is full the job
    /// backs off, re-checking the cancellation context. Cancellation aborts
    /// the notify.
    pub(crate) async fn notify(&self, cancel: &CancellationToken, success: bool) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        loop {
            match notifier.try_send(success) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Closed(_)) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
            if cancel.is_cancelled() {
                return;
            }
            self.out(ShortCode::Info, format!("Waiting to notify {}", self));
            tokio::time::sleep(NOTIFY_BACKOFF).await;
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.command)?;
        for arg in &self.args {
            write!(f, " {}", arg.text())?;
        }
        Ok(())
    }
}
