//! Background jobs polled by the control loop.
//!
//! A job runs its body on a dedicated thread. The owner never blocks on it:
//! it polls [`Job::finished`] on its own schedule and then reads either
//! [`Job::result`] or [`Job::exception`]. Jobs cannot be cancelled; dropping
//! the handle only stops observation.

use crate::error::{IronsealError, IronsealResult};
use log::{debug, warn};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    FinishedOk,
    FinishedError,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::FinishedOk | JobState::FinishedError)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Status text the body may update while the owner reads it.
#[derive(Debug, Clone, Default)]
pub struct Progress(Arc<Mutex<String>>);

impl Progress {
    pub fn set(&self, message: impl Into<String>) {
        *lock(&self.0) = message.into();
    }

    pub fn get(&self) -> String {
        lock(&self.0).clone()
    }
}

/// Failure observed by the poller. Errors returned by the body and failures
/// of the job machinery (panic, spawn error) both arrive in this shape.
#[derive(Debug, Clone)]
pub struct JobError {
    pub job: String,
    pub cause: Arc<IronsealError>,
}

impl JobError {
    fn new(job: &str, cause: IronsealError) -> Self {
        Self {
            job: job.to_string(),
            cause: Arc::new(cause),
        }
    }

    pub fn cause(&self) -> &IronsealError {
        &self.cause
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {} failed: {}", self.job, self.cause)
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "job body panicked".to_string())
}

type Body<T> = Box<dyn FnOnce(&Progress) -> IronsealResult<T> + Send + 'static>;

struct Outcome<T> {
    state: JobState,
    result: Option<T>,
    error: Option<JobError>,
}

impl<T> Outcome<T> {
    fn fail(&mut self, error: JobError) {
        self.error = Some(error);
        self.state = JobState::FinishedError;
    }
}

pub struct Job<T> {
    name: String,
    body: Option<Body<T>>,
    outcome: Arc<Mutex<Outcome<T>>>,
    progress: Progress,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Job<T> {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(&Progress) -> IronsealResult<T> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Some(Box::new(body)),
            outcome: Arc::new(Mutex::new(Outcome {
                state: JobState::Queued,
                result: None,
                error: None,
            })),
            progress: Progress::default(),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the body. A second call fails with `AlreadyStarted`.
    pub fn start(&mut self) -> IronsealResult<()> {
        let body = self.body.take().ok_or(IronsealError::AlreadyStarted)?;
        lock(&self.outcome).state = JobState::Running;

        let outcome = Arc::clone(&self.outcome);
        let progress = self.progress.clone();
        let name = self.name.clone();
        debug!("job {name} started");

        let spawned = thread::Builder::new()
            .name(format!("job-{}", self.name))
            .spawn(move || {
                let run = panic::catch_unwind(AssertUnwindSafe(|| body(&progress)));
                let mut guard = lock(&outcome);
                match run {
                    Ok(Ok(value)) => {
                        guard.result = Some(value);
                        guard.state = JobState::FinishedOk;
                        debug!("job {name} finished");
                    }
                    Ok(Err(err)) => {
                        debug!("job {name} failed: {err}");
                        guard.fail(JobError::new(&name, err));
                    }
                    Err(payload) => {
                        let detail = panic_detail(payload.as_ref());
                        warn!("job {name} panicked: {detail}");
                        guard.fail(JobError::new(
                            &name,
                            IronsealError::Job(format!("panicked: {detail}")),
                        ));
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                lock(&self.outcome).fail(JobError::new(
                    &self.name,
                    IronsealError::Job(format!("failed to spawn: {err}")),
                ));
                Err(IronsealError::Io(err))
            }
        }
    }

    pub fn state(&self) -> JobState {
        lock(&self.outcome).state
    }

    /// Non-blocking completion check.
    pub fn finished(&self) -> bool {
        self.state().is_finished()
    }

    pub fn exception(&self) -> Option<JobError> {
        let guard = lock(&self.outcome);
        match guard.state {
            JobState::FinishedError => guard.error.clone(),
            _ => None,
        }
    }

    pub fn progress(&self) -> String {
        self.progress.get()
    }

    /// Block until the body returns. Used by one-shot callers such as the CLI.
    pub fn wait(&mut self) -> JobState {
        let Some(handle) = self.handle.take() else {
            return self.state();
        };
        let joined = handle.join();
        let mut guard = lock(&self.outcome);
        if !guard.state.is_finished() {
            let detail = match joined {
                Ok(()) => "worker exited without a result".to_string(),
                Err(payload) => format!("worker thread died: {}", panic_detail(payload.as_ref())),
            };
            warn!("job {} {detail}", self.name);
            guard.fail(JobError::new(&self.name, IronsealError::Job(detail)));
        }
        guard.state
    }
}

impl<T: Clone + Send + 'static> Job<T> {
    /// Available once the job is `FinishedOk`.
    pub fn result(&self) -> Option<T> {
        let guard = lock(&self.outcome);
        match guard.state {
            JobState::FinishedOk => guard.result.clone(),
            _ => None,
        }
    }
}
