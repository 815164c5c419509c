//! Runtime control surface: unlock, password change and update orchestration.
//!
//! [`IronsealService`] is owned by a single control loop. Every request either
//! returns immediately or spawns a [`Job`]; outcomes are observed by calling
//! [`IronsealService::tick`] on a fixed interval and are reported as [`Event`]s
//! on the channel held by the [`RuntimeContext`].

use crate::config::RuntimeConfig;
use crate::crypto::{self, Credential};
use crate::error::{IronsealError, IronsealResult};
use crate::host::{HostControl, TerminationControl};
use crate::job::{Job, JobError};
use crate::unlock::{
    self, failure_message, Admission, FailureReason, UnlockMachine, UnlockOutcome, UnlockRequest,
    UnlockState,
};
use crate::update::{BuildVersion, ImageInstaller, Staging, UpdateAction, UpdateManager, UpdateSource};
use chrono::{DateTime, Utc};
use ironseal_provider::{DeviceBackend, MetadataState};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;
use zeroize::Zeroizing;

/// Notifications emitted by the control loop, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    UnlockDone,
    UnlockFailed {
        reason: FailureReason,
        message: String,
    },
    UpdateStatusChanged {
        action: UpdateAction,
        message: String,
    },
    PasswordChanged {
        success: bool,
        message: String,
    },
}

/// Everything the runtime needs, built once at process start.
pub struct RuntimeContext<B> {
    pub config: Arc<RuntimeConfig>,
    pub backend: Arc<B>,
    pub host: Arc<dyn HostControl>,
    pub update_source: Arc<dyn UpdateSource>,
    pub installer: Arc<dyn ImageInstaller>,
    pub termination: TerminationControl,
    pub events: Sender<Event>,
}

pub struct IronsealService<B> {
    context: RuntimeContext<B>,
    machine: UnlockMachine,
    unlock_job: Option<Job<UnlockOutcome>>,
    password_job: Option<Job<Vec<String>>>,
    updates: UpdateManager,
    next_update_check: Option<Instant>,
    /// Detected hypervisor, or why detection failed.
    virtualization: Result<Option<String>, String>,
}

impl<B> IronsealService<B>
where
    B: DeviceBackend + Send + Sync + 'static,
{
    /// Arms the failsafe and forces networking off until a successful unlock.
    pub fn new(context: RuntimeContext<B>, now: Instant) -> IronsealResult<Self> {
        let config = Arc::clone(&context.config);
        let running = BuildVersion::parse(&config.updates.running_version).ok_or_else(|| {
            IronsealError::InvalidConfig(format!(
                "updates.running_version `{}` is not dotted numeric",
                config.updates.running_version
            ))
        })?;
        let key = match (&config.updates.signing_public_key, config.updates.enabled) {
            (Some(hex_key), true) => Some(crypto::parse_public_key(hex_key)?),
            _ => None,
        };
        let mut updates = UpdateManager::new(
            Arc::clone(&context.update_source),
            Arc::clone(&context.installer),
            Staging::new(config.staging_dir()),
            running,
            key,
            context.termination.clone(),
        );
        if !config.updates.enabled {
            updates.disable("updates are disabled by configuration");
        }

        let virtualization = context.host.virtualization().map_err(|err| {
            warn!("virtualization detection failed; unlock will be refused: {err}");
            err.to_string()
        });

        let service = Self {
            machine: UnlockMachine::new(config.unlock.max_attempts, config.failsafe_delay(), now),
            context,
            unlock_job: None,
            password_job: None,
            updates,
            next_update_check: None,
            virtualization,
        };
        service.set_networking(false);
        info!(
            "ironseal runtime ready for {} (failsafe in {}s)",
            config.device.path, config.unlock.failsafe_secs
        );
        Ok(service)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.context.config
    }

    pub fn state(&self) -> UnlockState {
        self.machine.state()
    }

    pub fn is_unlocked(&self) -> bool {
        self.machine.is_unlocked()
    }

    /// Start a credential check. The outcome arrives as an event via `tick`.
    pub fn unlock(&mut self, credential: Credential, now: Instant) -> Admission {
        match self.machine.admit(now) {
            Admission::AlreadyUnlocked => {
                debug!("unlock requested while already unlocked");
                self.emit(Event::UnlockDone);
                return Admission::AlreadyUnlocked;
            }
            Admission::InProgress => return Admission::InProgress,
            Admission::Rejected(reason) => {
                self.report_failure(reason, None);
                return Admission::Rejected(reason);
            }
            Admission::Proceed => {}
        }

        if let Err(err) = self.precheck(Utc::now()) {
            warn!("unlock refused: {err}");
            let admission = self.machine.reject(FailureReason::Other, now);
            self.report_failure(FailureReason::Other, Some(&err));
            return admission;
        }

        let backend = Arc::clone(&self.context.backend);
        let request = UnlockRequest {
            device: self.context.config.device.path.clone(),
            mapping_prefix: self.context.config.device.mapping_prefix.clone(),
            trusted_signers: self.context.config.unlock.trusted_signers.clone(),
        };
        let mut job = Job::new("unlock", move |progress| {
            progress.set("verifying device metadata");
            unlock::unlock_device(backend.as_ref(), &request, &credential)
        });
        match job.start() {
            Ok(()) => {
                self.unlock_job = Some(job);
                Admission::Proceed
            }
            Err(err) => {
                let reason = self.machine.fail(FailureReason::Other, now);
                self.report_failure(reason, Some(&err));
                Admission::Rejected(reason)
            }
        }
    }

    /// Checks that need no credential: configured validity window and hypervisor.
    fn precheck(&self, now: DateTime<Utc>) -> IronsealResult<()> {
        let cfg = &self.context.config.unlock;
        if let Some(valid_to) = &cfg.valid_to {
            let end = unlock::parse_valid_to(valid_to).ok_or_else(|| {
                IronsealError::InvalidConfig(format!("unlock.valid_to `{valid_to}` is not a date"))
            })?;
            if now > end {
                return Err(IronsealError::Expired(valid_to.clone()));
            }
        }
        match &self.virtualization {
            Err(detail) => Err(IronsealError::VirtualizationUnknown(detail.clone())),
            Ok(Some(hypervisor)) if !cfg.allowed_virtualization.iter().any(|v| v == hypervisor) => {
                Err(IronsealError::Virtualized(hypervisor.clone()))
            }
            Ok(_) => Ok(()),
        }
    }

    /// Re-wrap every password keyslot `current` opens. Requires an unlocked device.
    pub fn change_password(
        &mut self,
        current: Zeroizing<String>,
        new: Zeroizing<String>,
    ) -> IronsealResult<()> {
        if !self.is_unlocked() {
            return Err(IronsealError::Locked);
        }
        if self.password_job.is_some() {
            return Err(IronsealError::Busy("password change".into()));
        }
        if new.trim().is_empty() {
            return Err(IronsealError::InvalidParameter {
                name: "new".into(),
                reason: "password must not be empty".into(),
            });
        }

        let backend = Arc::clone(&self.context.backend);
        let device = self.context.config.device.path.clone();
        let trusted = self.context.config.unlock.trusted_signers.clone();
        let iterations = self.context.config.crypto.pbkdf2_iterations;
        let mut job = Job::new("change-password", move |progress| {
            progress.set("re-wrapping password keyslots");
            let mut metadata = unlock::load_metadata(backend.as_ref(), &device)?;
            metadata.verify(&trusted)?;
            let changed = metadata.change_password(&current, &new, iterations)?;
            backend
                .write_metadata(&device, MetadataState::Sealed, &metadata.to_bytes()?)
                .map_err(IronsealError::provider)?;
            Ok(changed)
        });
        job.start()?;
        self.password_job = Some(job);
        Ok(())
    }

    /// Start a fetch job. Requires an unlocked device.
    pub fn get_updates(&mut self) -> IronsealResult<(UpdateAction, String)> {
        if !self.is_unlocked() {
            return Err(IronsealError::Locked);
        }
        let status = self.updates.start_fetch()?;
        self.emit_update_status(&status);
        Ok(status)
    }

    /// Start an apply job. Requires an unlocked device.
    pub fn apply_updates(&mut self) -> IronsealResult<(UpdateAction, String)> {
        if !self.is_unlocked() {
            return Err(IronsealError::Locked);
        }
        let status = self.updates.start_apply()?;
        self.emit_update_status(&status);
        Ok(status)
    }

    /// Last reported action; the message tracks job progress while one runs.
    pub fn get_updates_status(&self) -> (UpdateAction, String) {
        let (action, message) = self.updates.status();
        match self.updates.progress() {
            Some(progress) if !progress.is_empty() => (action, progress),
            _ => (action, message),
        }
    }

    /// Drive one iteration of the control loop.
    pub fn tick(&mut self, now: Instant) {
        self.poll_unlock(now);
        self.poll_password();

        if self.machine.failsafe_expired(now) {
            warn!("device still locked at failsafe deadline; powering off");
            if let Err(err) = self.context.host.power_off() {
                warn!("power-off failed: {err}");
            }
            self.machine.rearm_failsafe(now);
        }

        if let Some(status) = self.updates.poll() {
            self.emit_update_status(&status);
        }
        self.maybe_check_updates(now);
    }

    fn poll_unlock(&mut self, now: Instant) {
        let Some(job) = self.unlock_job.take() else {
            return;
        };
        if !job.finished() {
            self.unlock_job = Some(job);
            return;
        }

        match (job.result(), job.exception()) {
            (Some(outcome), _) => {
                self.machine.succeed();
                info!(
                    "device unlocked via `{}` ({} partition(s) opened)",
                    outcome.decryptor,
                    outcome.opened.len()
                );
                self.set_networking(true);
                self.emit(Event::UnlockDone);
                if self.context.config.updates.enabled {
                    self.next_update_check = Some(now);
                }
            }
            (None, err) => {
                let err = err
                    .map(|failure| failure.cause)
                    .unwrap_or_else(|| Arc::new(IronsealError::Job("unlock job lost".into())));
                let reason = self.machine.fail(FailureReason::classify(&err), now);
                warn!(
                    "unlock attempt {} failed: {reason:?}",
                    self.machine.attempts()
                );
                self.report_failure(reason, Some(&err));
            }
        }
    }

    fn poll_password(&mut self) {
        let Some(job) = self.password_job.take() else {
            return;
        };
        if !job.finished() {
            self.password_job = Some(job);
            return;
        }
        let event = match (job.result(), job.exception()) {
            (Some(changed), _) => {
                info!("password changed for decryptor(s): {}", changed.join(", "));
                Event::PasswordChanged {
                    success: true,
                    message: format!("updated {} decryptor(s)", changed.len()),
                }
            }
            (None, err) => {
                let message = match err.as_ref().map(JobError::cause) {
                    Some(IronsealError::InvalidCredential) | None => {
                        "current password is not accepted".to_string()
                    }
                    Some(other) => other.to_string(),
                };
                warn!("password change failed: {message}");
                Event::PasswordChanged {
                    success: false,
                    message,
                }
            }
        };
        self.emit(event);
    }

    fn maybe_check_updates(&mut self, now: Instant) {
        let Some(due) = self.next_update_check else {
            return;
        };
        if now < due || !self.is_unlocked() || self.updates.is_busy() {
            return;
        }
        self.next_update_check = Some(now + self.context.config.update_check_interval());
        match self.updates.start_fetch() {
            Ok(status) => self.emit_update_status(&status),
            Err(err) => warn!("scheduled update check skipped: {err}"),
        }
    }

    fn report_failure(&self, reason: FailureReason, err: Option<&IronsealError>) {
        self.set_networking(false);
        self.emit(Event::UnlockFailed {
            reason,
            message: failure_message(reason, err),
        });
    }

    fn set_networking(&self, enabled: bool) {
        if let Err(err) = self.context.host.set_networking(enabled) {
            warn!("could not turn networking {}: {err}", if enabled { "on" } else { "off" });
        }
    }

    fn emit_update_status(&self, (action, message): &(UpdateAction, String)) {
        self.emit(Event::UpdateStatusChanged {
            action: *action,
            message: message.clone(),
        });
    }

    fn emit(&self, event: Event) {
        if self.context.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}
