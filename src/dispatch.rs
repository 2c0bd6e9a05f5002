use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::sync::oneshot;

use crate::config;
use crate::data::RedditService;
use crate::reddit::{self, ApiSubError, RemoteError};

pub type ActionResult<T> = std::result::Result<T, ActionFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ApiError,
    NotAuthorAuthorized,
    NetworkError,
    Unknown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::ApiError => "api error",
            FailureKind::NotAuthorAuthorized => "not author",
            FailureKind::NetworkError => "network error",
            FailureKind::Unknown => "unknown error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ActionFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Provider sub-errors, when the API reported structured ones.
    pub details: Vec<ApiSubError>,
}

impl ActionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unknown, message)
    }
}

impl From<RemoteError> for ActionFailure {
    fn from(err: RemoteError) -> Self {
        let message = err.to_string();
        match err {
            RemoteError::ApiErrors(details) => Self {
                kind: FailureKind::ApiError,
                message,
                details,
            },
            RemoteError::Unauthorized
            | RemoteError::Forbidden
            | RemoteError::NotFound
            | RemoteError::RateLimited(_)
            | RemoteError::Api { .. }
            | RemoteError::Token(_) => Self::new(FailureKind::ApiError, message),
            RemoteError::Network(_) => Self::new(FailureKind::NetworkError, message),
            RemoteError::Decode { .. } | RemoteError::Url(_) | RemoteError::Invalid(_) => {
                Self::new(FailureKind::Unknown, message)
            }
        }
    }
}

type Operation = Box<dyn FnOnce(&dyn RedditService) + Send>;

struct Job {
    operation: Operation,
    submitted_at: Instant,
}

struct Inner {
    service: Arc<dyn RedditService>,
    jobs: Sender<Job>,
    stop: Sender<()>,
    queued: AtomicUsize,
}

/// Fixed pool of worker threads running blocking remote calls on behalf of
/// async callers. Each job resolves its own caller; no ordering between jobs.
pub struct ActionDispatcher {
    inner: Arc<Inner>,
    handles: Vec<thread::JoinHandle<()>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserComment {
    pub body: String,
    pub subreddit: String,
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Comment,
    Submission,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpvoteOutcome {
    pub kind: ItemKind,
    pub id: String,
    pub subreddit: String,
    pub result: ActionResult<()>,
}

impl ActionDispatcher {
    pub fn new(service: Arc<dyn RedditService>, workers: usize) -> Result<Self> {
        let workers = if workers == 0 {
            config::default_workers()
        } else {
            workers
        };

        let (job_tx, job_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();

        let inner = Arc::new(Inner {
            service,
            jobs: job_tx,
            stop: stop_tx,
            queued: AtomicUsize::new(0),
        });

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx_jobs = job_rx.clone();
            let rx_stop = stop_rx.clone();
            let worker_inner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("dispatch-{}", idx))
                .spawn(move || worker_inner.worker(rx_jobs, rx_stop))
                .context("dispatch: spawn worker")?;
            handles.push(handle);
        }
        tracing::debug!(workers, "action dispatcher started");

        Ok(Self { inner, handles })
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Jobs submitted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Runs `op` on a worker and awaits its outcome. Errors and panics raised
    /// by `op` come back as `ActionFailure`.
    pub async fn dispatch<T, F>(&self, op: F) -> ActionResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RedditService) -> ActionResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let operation: Operation = Box::new(move |service| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| op(service)))
                .unwrap_or_else(|payload| Err(ActionFailure::unknown(panic_message(payload))));
            let _ = tx.send(outcome);
        });
        let job = Job {
            operation,
            submitted_at: Instant::now(),
        };

        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        if self.inner.jobs.send(job).is_err() {
            self.inner.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(ActionFailure::unknown("dispatcher is not running"));
        }
        tracing::trace!(queued = self.queued(), "dispatch job submitted");

        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ActionFailure::unknown("job dropped before completion")),
        };
        if let Err(failure) = &outcome {
            tracing::warn!(kind = %failure.kind, error = %failure.message, "dispatched action failed");
        }
        outcome
    }

    pub async fn fetch_user_comments(
        &self,
        username: &str,
        limit: u32,
    ) -> ActionResult<Vec<UserComment>> {
        let username = username.to_string();
        self.dispatch(move |svc| {
            let comments = svc.user_comments(&username, limit)?;
            Ok(comments
                .into_iter()
                .map(|comment| UserComment {
                    created: timestamp(comment.created_utc),
                    body: comment.body,
                    subreddit: comment.subreddit,
                })
                .collect())
        })
        .await
    }

    pub async fn fetch_user_submissions(
        &self,
        username: &str,
        limit: u32,
    ) -> ActionResult<Vec<reddit::Post>> {
        let username = username.to_string();
        self.dispatch(move |svc| Ok(svc.user_submissions(&username, limit)?))
            .await
    }

    pub async fn fetch_post_comments(
        &self,
        subreddit: &str,
        post_id: &str,
    ) -> ActionResult<reddit::PostComments> {
        let subreddit = subreddit.to_string();
        let post_id = post_id.to_string();
        self.dispatch(move |svc| Ok(svc.post_comments(&subreddit, &post_id)?))
            .await
    }

    pub async fn upvote_comment(&self, comment_id: &str) -> ActionResult<()> {
        let fullname = reddit::fullname("t1", comment_id);
        self.dispatch(move |svc| Ok(svc.vote(&fullname, 1)?)).await
    }

    pub async fn upvote_submission(&self, submission_id: &str) -> ActionResult<()> {
        let fullname = reddit::fullname("t3", submission_id);
        self.dispatch(move |svc| Ok(svc.vote(&fullname, 1)?)).await
    }

    /// Posts `text` under the comment and returns the new reply.
    pub async fn reply_to_comment(
        &self,
        comment_id: &str,
        text: &str,
    ) -> ActionResult<reddit::Comment> {
        let parent = reddit::fullname("t1", comment_id);
        let text = text.to_string();
        self.dispatch(move |svc| {
            let reply = svc.reply(&parent, &text)?;
            tracing::info!(parent = %parent, reply = %reply.id, "reply posted");
            Ok(reply)
        })
        .await
    }

    /// Usernames behind the authenticated account's followed user profiles.
    pub async fn fetch_followed_users(&self) -> ActionResult<Vec<String>> {
        self.dispatch(|svc| {
            let subscriptions = svc.subscriptions()?;
            let followed: Vec<String> = subscriptions
                .into_iter()
                .filter(|sub| sub.subreddit_type == "user")
                .map(|sub| {
                    sub.display_name
                        .strip_prefix("u_")
                        .unwrap_or(&sub.display_name)
                        .to_string()
                })
                .collect();
            tracing::debug!(count = followed.len(), "followed users resolved");
            Ok(followed)
        })
        .await
    }

    /// Deletes the comment only when the authenticated identity wrote it.
    pub async fn delete_comment(&self, item_id: &str) -> ActionResult<()> {
        let item_id = item_id.to_string();
        self.dispatch(move |svc| {
            let item = svc.comment(&item_id)?;
            let me = svc.me()?;
            if !item.author.eq_ignore_ascii_case(&me.name) {
                return Err(ActionFailure::new(
                    FailureKind::NotAuthorAuthorized,
                    format!(
                        "{} is written by {}, not {}",
                        item_id, item.author, me.name
                    ),
                ));
            }
            svc.delete(&reddit::fullname("t1", &item.id))?;
            tracing::info!(item = %item_id, "comment deleted");
            Ok(())
        })
        .await
    }

    /// Upvotes the newest comments and submissions of `username`, one dispatch per item.
    pub async fn upvote_user_content(
        &self,
        username: &str,
        limit: u32,
    ) -> ActionResult<Vec<UpvoteOutcome>> {
        let name = username.to_string();
        let (comments, posts) = self
            .dispatch(move |svc| {
                let comments = svc.user_comments(&name, limit)?;
                let posts = svc.user_submissions(&name, limit)?;
                Ok((comments, posts))
            })
            .await?;

        let mut outcomes = Vec::with_capacity(comments.len() + posts.len());
        for comment in comments {
            let result = self.upvote_comment(&comment.id).await;
            outcomes.push(UpvoteOutcome {
                kind: ItemKind::Comment,
                id: comment.id,
                subreddit: comment.subreddit,
                result,
            });
        }
        for post in posts {
            let result = self.upvote_submission(&post.id).await;
            outcomes.push(UpvoteOutcome {
                kind: ItemKind::Submission,
                id: post.id,
                subreddit: post.subreddit,
                result,
            });
        }
        Ok(outcomes)
    }

    fn shutdown(&mut self) {
        for _ in &self.handles {
            let _ = self.inner.stop.send(());
        }
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

impl Drop for ActionDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn worker(&self, jobs: Receiver<Job>, stop: Receiver<()>) {
        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => break,
                recv(jobs) -> msg => {
                    match msg {
                        Ok(job) => self.process(job),
                        Err(_) => break,
                    }
                }
            }
        }
    }

    fn process(&self, job: Job) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(
            waited_ms = job.submitted_at.elapsed().as_millis() as u64,
            "dispatch job started"
        );
        (job.operation)(self.service.as_ref());
    }
}

fn timestamp(created_utc: f64) -> Option<DateTime<Utc>> {
    if created_utc <= 0.0 {
        return None;
    }
    Utc.timestamp_opt(created_utc.trunc() as i64, 0).single()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("action panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("action panicked: {}", msg)
    } else {
        "action panicked".to_string()
    }
}
