//! Staged system-image updates: fetch, verify, stage and apply.
//!
//! The staging directory holds `image`, `image.sig` and `VERSION`. A fetch
//! downloads into a temporary file inside the staging directory, verifies it,
//! and only then renames it to `image`, so a crash mid-download can never leave
//! an unverified file under the final name. Images are signed as ed25519 over
//! their SHA-256 digest.

use crate::crypto;
use crate::error::{IronsealError, IronsealResult};
use crate::host::TerminationControl;
use crate::job::{Job, JobError, Progress};
use ed25519_dalek::{SigningKey, VerifyingKey};
use ironseal_provider::CommandRunner;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

pub const MANIFEST_FILE: &str = "manifest.json";
const IMAGE_FILE: &str = "image";
const SIGNATURE_FILE: &str = "image.sig";
const VERSION_FILE: &str = "VERSION";

/// Dotted numeric build version; missing trailing components count as zero.
#[derive(Debug, Clone, Eq)]
pub struct BuildVersion(Vec<u64>);

impl BuildVersion {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim().trim_start_matches('v');
        if text.is_empty() {
            return None;
        }
        text.split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()
            .map(BuildVersion)
    }
}

impl PartialEq for BuildVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for BuildVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| {
                let a = self.0.get(i).copied().unwrap_or(0);
                let b = other.0.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for BuildVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// A build offered by an update source.
#[derive(Debug, Clone)]
pub struct UpdateCandidate {
    pub version: BuildVersion,
    pub image: String,
    pub signature: Vec<u8>,
}

/// Where new builds come from.
pub trait UpdateSource: Send + Sync {
    /// Newest build on offer, if any.
    fn latest(&self) -> IronsealResult<Option<UpdateCandidate>>;

    /// Stream the candidate image into `dest`, returning bytes written.
    fn download(&self, candidate: &UpdateCandidate, dest: &mut dyn Write) -> IronsealResult<u64>;
}

/// Writes an applied image to its final location.
pub trait ImageInstaller: Send + Sync {
    fn install(&self, image: &Path, version: &BuildVersion) -> IronsealResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: String,
    image: String,
    signature: String,
}

/// Local mirror directory containing `manifest.json` and the image it names,
/// optionally refreshed by an external sync command before each check.
pub struct DirectoryUpdateSource<R> {
    dir: PathBuf,
    sync_command: Option<Vec<String>>,
    runner: R,
}

impl<R> DirectoryUpdateSource<R>
where
    R: CommandRunner + Send + Sync,
{
    pub fn new(dir: impl Into<PathBuf>, sync_command: Option<Vec<String>>, runner: R) -> Self {
        Self {
            dir: dir.into(),
            sync_command,
            runner,
        }
    }

    fn sync(&self) -> IronsealResult<()> {
        let Some((program, args)) = self
            .sync_command
            .as_ref()
            .and_then(|argv| argv.split_first())
        else {
            return Ok(());
        };
        let output = self
            .runner
            .run(program, args, None)
            .map_err(IronsealError::provider)?;
        if !output.success() {
            return Err(IronsealError::Provider(format!(
                "update sync `{program}` exited with {}: {}",
                output.status,
                output.diagnostic()
            )));
        }
        debug!("update mirror synchronised via {program}");
        Ok(())
    }

    fn image_path(&self, candidate: &UpdateCandidate) -> IronsealResult<PathBuf> {
        let name = Path::new(&candidate.image);
        if name.is_absolute() || name.components().count() != 1 {
            return Err(IronsealError::InvalidConfig(format!(
                "manifest image `{}` must be a bare file name",
                candidate.image
            )));
        }
        Ok(self.dir.join(name))
    }
}

impl<R> UpdateSource for DirectoryUpdateSource<R>
where
    R: CommandRunner + Send + Sync,
{
    fn latest(&self) -> IronsealResult<Option<UpdateCandidate>> {
        self.sync()?;
        let manifest_path = self.dir.join(MANIFEST_FILE);
        let contents = match fs::read_to_string(&manifest_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let manifest: Manifest = serde_json::from_str(&contents)?;
        let version = BuildVersion::parse(&manifest.version).ok_or_else(|| {
            IronsealError::InvalidConfig(format!(
                "manifest version `{}` is not dotted numeric",
                manifest.version
            ))
        })?;
        let signature = hex::decode(manifest.signature.trim()).map_err(|err| {
            IronsealError::InvalidConfig(format!("manifest signature is not hex: {err}"))
        })?;
        Ok(Some(UpdateCandidate {
            version,
            image: manifest.image,
            signature,
        }))
    }

    fn download(&self, candidate: &UpdateCandidate, dest: &mut dyn Write) -> IronsealResult<u64> {
        let mut source = File::open(self.image_path(candidate)?)?;
        Ok(io::copy(&mut source, dest)?)
    }
}

/// Copies the image next to `target` and renames it into place.
pub struct FileImageInstaller {
    target: PathBuf,
}

impl FileImageInstaller {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl ImageInstaller for FileImageInstaller {
    fn install(&self, image: &Path, version: &BuildVersion) -> IronsealResult<()> {
        let parent = self
            .target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let mut temp = NamedTempFile::new_in(parent)?;
        io::copy(&mut File::open(image)?, temp.as_file_mut())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.target)
            .map_err(|err| IronsealError::Io(err.error))?;
        info!("installed build {version} to {}", self.target.display());
        Ok(())
    }
}

/// Result of a fetch job; `code()` is the exit code reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchOutcome {
    NoUpdate,
    Staged,
}

impl FetchOutcome {
    pub fn code(self) -> i32 {
        match self {
            FetchOutcome::NoUpdate => 0,
            FetchOutcome::Staged => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyOutcome {
    NothingToApply,
    /// Reboot required.
    Applied,
}

impl ApplyOutcome {
    pub fn code(self) -> i32 {
        match self {
            ApplyOutcome::NothingToApply => 0,
            ApplyOutcome::Applied => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagedImage {
    pub image: PathBuf,
    pub version: BuildVersion,
    pub signature: Vec<u8>,
}

/// The single staging directory shared by fetch (writer) and apply (consumer).
#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
}

impl Staging {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A staged image exists only when all three files are present.
    pub fn staged(&self) -> IronsealResult<Option<StagedImage>> {
        let image = self.dir.join(IMAGE_FILE);
        if !image.is_file() {
            return Ok(None);
        }
        let (signature, version) = match (
            fs::read(self.dir.join(SIGNATURE_FILE)),
            fs::read_to_string(self.dir.join(VERSION_FILE)),
        ) {
            (Ok(signature), Ok(version)) => (signature, version),
            _ => return Ok(None),
        };
        let Some(version) = BuildVersion::parse(&version) else {
            return Ok(None);
        };
        Ok(Some(StagedImage {
            image,
            version,
            signature,
        }))
    }

    /// Remove everything in the staging directory.
    pub fn clear(&self) -> IronsealResult<()> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn write_atomic(&self, name: &str, contents: &[u8]) -> IronsealResult<()> {
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(contents)?;
        temp.as_file().sync_all()?;
        temp.persist(self.dir.join(name))
            .map_err(|err| IronsealError::Io(err.error))?;
        Ok(())
    }
}

fn digest_file(path: &Path) -> IronsealResult<[u8; 32]> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hasher.finalize().into())
}

fn check_image(key: &VerifyingKey, path: &Path, signature: &[u8]) -> IronsealResult<()> {
    if crypto::verify(key, &digest_file(path)?, signature) {
        Ok(())
    } else {
        Err(IronsealError::DeviceIntegrity(
            "update image signature does not verify".to_string(),
        ))
    }
}

/// Copy `image` into `mirror`, sign it and point `manifest.json` at it.
///
/// The manifest is replaced last so a reader never sees it reference an image
/// that is not fully written.
pub fn publish_image(
    mirror: &Path,
    image: &Path,
    version: &BuildVersion,
    key: &SigningKey,
) -> IronsealResult<PathBuf> {
    fs::create_dir_all(mirror)?;
    let name = format!("image-{version}");
    let target = mirror.join(&name);
    let mut staged = NamedTempFile::new_in(mirror)?;
    io::copy(&mut File::open(image)?, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    staged.persist(&target).map_err(|err| IronsealError::Io(err.error))?;

    let manifest = Manifest {
        version: version.to_string(),
        image: name,
        signature: hex::encode(crypto::sign(key, &digest_file(&target)?)),
    };
    let mut manifest_file = NamedTempFile::new_in(mirror)?;
    manifest_file.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())?;
    manifest_file
        .persist(mirror.join(MANIFEST_FILE))
        .map_err(|err| IronsealError::Io(err.error))?;
    info!("published build {version} to {}", mirror.display());
    Ok(target)
}

/// Fetch job body. Leaves staging untouched unless a newer build exists.
pub fn fetch_update(
    source: &dyn UpdateSource,
    staging: &Staging,
    running: &BuildVersion,
    key: &VerifyingKey,
    progress: &Progress,
) -> IronsealResult<FetchOutcome> {
    progress.set("checking for updates");
    let Some(candidate) = source.latest()? else {
        progress.set("no update available");
        return Ok(FetchOutcome::NoUpdate);
    };
    if candidate.version <= *running {
        progress.set(format!("build {running} is current"));
        return Ok(FetchOutcome::NoUpdate);
    }

    if let Some(staged) = staging.staged()? {
        if staged.version == candidate.version
            && check_image(key, &staged.image, &staged.signature).is_ok()
        {
            progress.set(format!("build {} already staged", candidate.version));
            return Ok(FetchOutcome::Staged);
        }
    }

    fs::create_dir_all(staging.dir())?;
    staging.clear()?;

    progress.set(format!("downloading build {}", candidate.version));
    let mut temp = NamedTempFile::new_in(staging.dir())?;
    let bytes = source.download(&candidate, temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    debug!("downloaded {bytes} bytes for build {}", candidate.version);

    progress.set("verifying signature");
    check_image(key, temp.path(), &candidate.signature)?;

    staging.write_atomic(SIGNATURE_FILE, &candidate.signature)?;
    staging.write_atomic(VERSION_FILE, candidate.version.to_string().as_bytes())?;
    temp.persist(staging.dir().join(IMAGE_FILE))
        .map_err(|err| IronsealError::Io(err.error))?;

    info!("staged build {} for next boot", candidate.version);
    progress.set(format!("build {} staged", candidate.version));
    Ok(FetchOutcome::Staged)
}

/// Apply job body. Re-verifies the staged image before installing it.
pub fn apply_update(
    staging: &Staging,
    key: &VerifyingKey,
    installer: &dyn ImageInstaller,
    progress: &Progress,
) -> IronsealResult<ApplyOutcome> {
    let Some(staged) = staging.staged()? else {
        progress.set("nothing to apply");
        return Ok(ApplyOutcome::NothingToApply);
    };

    progress.set(format!("verifying build {}", staged.version));
    if let Err(err) = check_image(key, &staged.image, &staged.signature) {
        warn!("discarding staged build {}: {err}", staged.version);
        staging.clear()?;
        return Err(err);
    }

    progress.set(format!("installing build {}", staged.version));
    installer.install(&staged.image, &staged.version)?;
    staging.clear()?;
    progress.set(format!("build {} applied, reboot required", staged.version));
    Ok(ApplyOutcome::Applied)
}

/// Coarse update status reported through `get_updates_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateAction {
    Idle,
    Disabled,
    Fetching,
    UpToDate,
    Staged,
    Applying,
    NothingToApply,
    Applied,
    Failed,
}

/// Control-thread side of the update lifecycle. At most one fetch or apply job
/// is outstanding at a time.
pub struct UpdateManager {
    source: Arc<dyn UpdateSource>,
    installer: Arc<dyn ImageInstaller>,
    staging: Staging,
    running: BuildVersion,
    key: Option<VerifyingKey>,
    termination: TerminationControl,
    fetch: Option<Job<FetchOutcome>>,
    apply: Option<Job<ApplyOutcome>>,
    status: (UpdateAction, String),
}

impl UpdateManager {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        installer: Arc<dyn ImageInstaller>,
        staging: Staging,
        running: BuildVersion,
        key: Option<VerifyingKey>,
        termination: TerminationControl,
    ) -> Self {
        let status = match key {
            Some(_) => (UpdateAction::Idle, "no update check yet".to_string()),
            None => (
                UpdateAction::Disabled,
                "no update signing key configured".to_string(),
            ),
        };
        Self {
            source,
            installer,
            staging,
            running,
            key,
            termination,
            fetch: None,
            apply: None,
            status,
        }
    }

    pub fn status(&self) -> (UpdateAction, String) {
        self.status.clone()
    }

    /// Refuse every fetch and apply from now on.
    pub fn disable(&mut self, reason: &str) {
        self.key = None;
        self.status = (UpdateAction::Disabled, reason.to_string());
    }

    pub fn is_busy(&self) -> bool {
        self.fetch.is_some() || self.apply.is_some()
    }

    fn ensure_idle(&self, wanted: &str) -> IronsealResult<&VerifyingKey> {
        let running = self
            .fetch
            .as_ref()
            .map(Job::name)
            .or_else(|| self.apply.as_ref().map(Job::name));
        if let Some(name) = running {
            return Err(IronsealError::Busy(format!("{wanted}: {name} running")));
        }
        self.key
            .as_ref()
            .ok_or_else(|| IronsealError::InvalidConfig(self.status.1.clone()))
    }

    /// Start a fetch job. Returns the new status.
    pub fn start_fetch(&mut self) -> IronsealResult<(UpdateAction, String)> {
        let key = *self.ensure_idle("fetch")?;
        let source = Arc::clone(&self.source);
        let staging = self.staging.clone();
        let running = self.running.clone();
        let mut job = Job::new("update-fetch", move |progress| {
            fetch_update(source.as_ref(), &staging, &running, &key, progress)
        });
        job.start()?;
        self.fetch = Some(job);
        self.status = (UpdateAction::Fetching, "checking for updates".to_string());
        Ok(self.status())
    }

    /// Start an apply job. Termination requests are ignored until it ends.
    pub fn start_apply(&mut self) -> IronsealResult<(UpdateAction, String)> {
        let key = *self.ensure_idle("apply")?;
        let installer = Arc::clone(&self.installer);
        let staging = self.staging.clone();
        let guard = self.termination.ignore();
        let mut job = Job::new("update-apply", move |progress| {
            let _guard = guard;
            apply_update(&staging, &key, installer.as_ref(), progress)
        });
        job.start()?;
        self.apply = Some(job);
        self.status = (UpdateAction::Applying, "applying staged update".to_string());
        Ok(self.status())
    }

    /// Collect finished jobs. Returns the new status when it changed.
    pub fn poll(&mut self) -> Option<(UpdateAction, String)> {
        if let Some(job) = self.fetch.take_if_finished() {
            self.status = match (job.result(), job.exception()) {
                (Some(FetchOutcome::Staged), _) => {
                    (UpdateAction::Staged, "update staged for next boot".to_string())
                }
                (Some(FetchOutcome::NoUpdate), _) => {
                    (UpdateAction::UpToDate, "no update available".to_string())
                }
                (None, err) => failed_status("update fetch", err.as_ref().map(JobError::cause)),
            };
            return Some(self.status());
        }
        if let Some(job) = self.apply.take_if_finished() {
            self.status = match (job.result(), job.exception()) {
                (Some(ApplyOutcome::Applied), _) => (
                    UpdateAction::Applied,
                    "update applied, reboot required".to_string(),
                ),
                (Some(ApplyOutcome::NothingToApply), _) => {
                    (UpdateAction::NothingToApply, "nothing to apply".to_string())
                }
                (None, err) => failed_status("update apply", err.as_ref().map(JobError::cause)),
            };
            return Some(self.status());
        }
        None
    }

    /// Progress text of the running job, if any.
    pub fn progress(&self) -> Option<String> {
        self.fetch
            .as_ref()
            .map(Job::progress)
            .or_else(|| self.apply.as_ref().map(Job::progress))
    }
}

fn failed_status(what: &str, err: Option<&IronsealError>) -> (UpdateAction, String) {
    let message = match err {
        Some(err) => format!("{what} failed: {err}"),
        None => format!("{what} failed"),
    };
    warn!("{message}");
    (UpdateAction::Failed, message)
}

trait TakeIfFinished<T> {
    fn take_if_finished(&mut self) -> Option<Job<T>>;
}

impl<T: Send + 'static> TakeIfFinished<T> for Option<Job<T>> {
    fn take_if_finished(&mut self) -> Option<Job<T>> {
        if self.as_ref().is_some_and(Job::finished) {
            self.take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sign_image, update_signing_key as signing_key, MemorySource, RecordingInstaller};
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn versions_compare_numerically() {
        let v = |s| BuildVersion::parse(s).unwrap();
        assert!(v("1.10") > v("1.9"));
        assert_eq!(v("2.0.0"), v("2"));
        assert!(v("v3.1") > v("3.0.9"));
        assert_eq!(v("1.2.3").to_string(), "1.2.3");
        assert!(BuildVersion::parse("1.x").is_none());
        assert!(BuildVersion::parse("").is_none());
    }

    #[test]
    fn fetch_without_newer_build_leaves_staging_untouched() {
        let dir = tempdir().unwrap();
        let staging = Staging::new(dir.path());
        fs::write(dir.path().join("keep.txt"), b"operator file").unwrap();
        let key = signing_key().verifying_key();
        let progress = Progress::default();

        let empty = MemorySource::default();
        let running = BuildVersion::parse("1.0").unwrap();
        let outcome = fetch_update(&empty, &staging, &running, &key, &progress).unwrap();
        assert_eq!(outcome.code(), 0);

        let same = MemorySource::offering("1.0", b"image");
        let outcome = fetch_update(&same, &staging, &running, &key, &progress).unwrap();
        assert_eq!(outcome, FetchOutcome::NoUpdate);
        assert_eq!(*same.downloads.lock().unwrap(), 0);
        assert_eq!(listing(dir.path()), vec!["keep.txt".to_string()]);
    }

    #[test]
    fn fetch_stages_verified_image_once() {
        let dir = tempdir().unwrap();
        let staging = Staging::new(dir.path().join("staging"));
        let key = signing_key().verifying_key();
        let progress = Progress::default();
        let source = MemorySource::offering("1.1", b"new system image");
        let running = BuildVersion::parse("1.0").unwrap();

        let outcome = fetch_update(&source, &staging, &running, &key, &progress).unwrap();
        assert_eq!(outcome.code(), 1);
        let staged = staging.staged().unwrap().unwrap();
        assert_eq!(staged.version.to_string(), "1.1");
        assert_eq!(fs::read(&staged.image).unwrap(), b"new system image");
        assert_eq!(
            listing(staging.dir()),
            vec!["VERSION".to_string(), "image".into(), "image.sig".into()]
        );

        fetch_update(&source, &staging, &running, &key, &progress).unwrap();
        assert_eq!(*source.downloads.lock().unwrap(), 1);
    }

    #[test]
    fn fetch_rejects_bad_signature_without_staging_image() {
        let dir = tempdir().unwrap();
        let staging = Staging::new(dir.path());
        let key = signing_key().verifying_key();
        let mut source = MemorySource::offering("2.0", b"payload");
        if let Some((_, image, _)) = source.offer.as_mut() {
            image.push(0);
        }
        let running = BuildVersion::parse("1.0").unwrap();
        let err = fetch_update(&source, &staging, &running, &key, &Progress::default())
            .unwrap_err();
        assert!(matches!(err, IronsealError::DeviceIntegrity(_)));
        assert!(staging.staged().unwrap().is_none());
        assert!(listing(dir.path()).is_empty());
    }

    #[test]
    fn apply_on_empty_staging_returns_zero() {
        let dir = tempdir().unwrap();
        let staging = Staging::new(dir.path());
        let installer = RecordingInstaller::default();
        let outcome = apply_update(
            &staging,
            &signing_key().verifying_key(),
            &installer,
            &Progress::default(),
        )
        .unwrap();
        assert_eq!(outcome.code(), 0);
        assert!(installer.installed.lock().unwrap().is_empty());
    }

    #[test]
    fn apply_installs_and_clears_staging() {
        let dir = tempdir().unwrap();
        let staging = Staging::new(dir.path());
        let key = signing_key().verifying_key();
        let source = MemorySource::offering("1.5", b"bits");
        let running = BuildVersion::parse("1.0").unwrap();
        fetch_update(&source, &staging, &running, &key, &Progress::default()).unwrap();

        let installer = RecordingInstaller::default();
        let outcome = apply_update(&staging, &key, &installer, &Progress::default()).unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(
            installer.installed.lock().unwrap().as_slice(),
            &[(b"bits".to_vec(), "1.5".to_string())]
        );
        assert!(listing(dir.path()).is_empty());
    }

    #[test]
    fn apply_discards_tampered_image() {
        let dir = tempdir().unwrap();
        let staging = Staging::new(dir.path());
        let key = signing_key().verifying_key();
        let source = MemorySource::offering("1.5", b"bits");
        let running = BuildVersion::parse("1.0").unwrap();
        fetch_update(&source, &staging, &running, &key, &Progress::default()).unwrap();
        fs::write(dir.path().join("image"), b"evil").unwrap();

        let installer = RecordingInstaller::default();
        let err = apply_update(&staging, &key, &installer, &Progress::default()).unwrap_err();
        assert!(matches!(err, IronsealError::DeviceIntegrity(_)));
        assert!(installer.installed.lock().unwrap().is_empty());
        assert!(listing(dir.path()).is_empty());
    }

    struct EchoRunner;

    impl CommandRunner for EchoRunner {
        type Error = io::Error;

        fn run(
            &self,
            _: &str,
            _: &[String],
            _: Option<&[u8]>,
        ) -> Result<ironseal_provider::CommandOutput, io::Error> {
            Ok(ironseal_provider::CommandOutput::default())
        }
    }

    #[test]
    fn directory_source_reads_manifest() {
        let dir = tempdir().unwrap();
        let source = DirectoryUpdateSource::new(dir.path(), Some(vec!["true".into()]), EchoRunner);
        assert!(source.latest().unwrap().is_none());

        let signature = sign_image(b"mirror image");
        fs::write(dir.path().join("build.img"), b"mirror image").unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            format!(
                r#"{{"version":"4.2","image":"build.img","signature":"{}"}}"#,
                hex::encode(&signature)
            ),
        )
        .unwrap();

        let candidate = source.latest().unwrap().unwrap();
        assert_eq!(candidate.version.to_string(), "4.2");
        assert_eq!(candidate.signature, signature);
        let mut buffer = Vec::new();
        source.download(&candidate, &mut buffer).unwrap();
        assert_eq!(buffer, b"mirror image");

        let escape = UpdateCandidate {
            image: "../etc/passwd".into(),
            ..candidate
        };
        assert!(source.download(&escape, &mut Vec::new()).is_err());
    }

    #[test]
    fn published_mirror_is_fetchable() {
        let work = tempdir().unwrap();
        let image = work.path().join("build.img");
        fs::write(&image, b"published image").unwrap();
        let mirror = work.path().join("mirror");
        let version = BuildVersion::parse("5.1").unwrap();
        publish_image(&mirror, &image, &version, &signing_key()).unwrap();

        let source = DirectoryUpdateSource::new(&mirror, None, EchoRunner);
        let staging = Staging::new(work.path().join("staging"));
        let running = BuildVersion::parse("5.0").unwrap();
        let key = signing_key().verifying_key();
        let outcome = fetch_update(&source, &staging, &running, &key, &Progress::default()).unwrap();
        assert_eq!(outcome, FetchOutcome::Staged);
        assert_eq!(staging.staged().unwrap().unwrap().version, version);
    }

    #[test]
    fn file_installer_replaces_target() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("staged");
        fs::write(&image, b"fresh").unwrap();
        let target = dir.path().join("boot").join("system.img");
        let installer = FileImageInstaller::new(&target);
        installer
            .install(&image, &BuildVersion::parse("1").unwrap())
            .unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"fresh");
    }

    fn wait_for_status(manager: &mut UpdateManager) -> (UpdateAction, String) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(status) = manager.poll() {
                return status;
            }
            assert!(Instant::now() < deadline, "update job did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn manager_runs_one_job_at_a_time_and_guards_termination() {
        let dir = tempdir().unwrap();
        let termination = TerminationControl::default();
        let installer = Arc::new(RecordingInstaller::default());
        let mut manager = UpdateManager::new(
            Arc::new(MemorySource::offering("9.0", b"img")),
            installer.clone(),
            Staging::new(dir.path()),
            BuildVersion::parse("1.0").unwrap(),
            Some(signing_key().verifying_key()),
            termination.clone(),
        );
        assert_eq!(manager.status().0, UpdateAction::Idle);

        assert_eq!(manager.start_fetch().unwrap().0, UpdateAction::Fetching);
        assert!(matches!(manager.start_apply(), Err(IronsealError::Busy(_))));
        assert_eq!(wait_for_status(&mut manager).0, UpdateAction::Staged);

        manager.start_apply().unwrap();
        assert_eq!(wait_for_status(&mut manager).0, UpdateAction::Applied);
        assert!(!manager.is_busy());
        assert_eq!(termination.mode(), crate::host::TerminationMode::Handle);
        assert_eq!(installer.installed.lock().unwrap().len(), 1);
    }

    #[test]
    fn manager_without_key_is_disabled() {
        let dir = tempdir().unwrap();
        let mut manager = UpdateManager::new(
            Arc::new(MemorySource::default()),
            Arc::new(RecordingInstaller::default()),
            Staging::new(dir.path()),
            BuildVersion::parse("1.0").unwrap(),
            None,
            TerminationControl::default(),
        );
        assert_eq!(manager.status().0, UpdateAction::Disabled);
        assert!(matches!(
            manager.start_fetch(),
            Err(IronsealError::InvalidConfig(_))
        ));
    }
}
