//! Locked problem directories
//!
//! A problem directory holds one element per file. It is valid iff it
//! contains a `time` element, and every mutation happens while this process
//! holds the directory's `.lock` symlink.

use bitflags::bitflags;
use problemd_api::ReportInfo;
use problemd_util::ProblemError;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::element::{canonical_name, is_correct_element_name, names};
use crate::lock::{self, LOCK_FILE, LockAttempt};
use crate::reported_to::{append_reported_line, parse_reported_to};

/// Pause between attempts while another live process holds the lock
const WAIT_FOR_OTHER_PROCESS: Duration = Duration::from_millis(500);
/// Lock cadence used right after creating a directory
const CREATE_LOCK_RETRY: Duration = Duration::from_millis(10);
/// Attempts made while a locked directory has no `time` element
const NO_TIME_FILE_COUNT: u32 = 10;
const NO_TIME_FILE_RETRY: Duration = Duration::from_millis(50);
const RMDIR_FAIL_COUNT: u32 = 50;
const RMDIR_FAIL_RETRY: Duration = Duration::from_millis(10);

/// Suffix of problem directories still being written
pub const STAGING_SUFFIX: &str = ".new";

/// Account that owns problem directories created for other users
pub const SERVICE_ACCOUNT: &str = "abrt";

bitflags! {
    /// Flags of [`DumpDir::open`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Accept an unlocked, read-only directory when locking is not permitted
        const READ_ONLY = 0x1;
        const FAIL_QUIETLY_ENOENT = 0x2;
        const FAIL_QUIETLY_EACCES = 0x4;
        /// Fail with `LockBusy` instead of waiting for the holder
        const DONT_WAIT_FOR_LOCK = 0x8;
    }
}

bitflags! {
    /// Flags of [`DumpDir::load_text`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoadFlags: u32 {
        /// A missing element loads as the empty string
        const FAIL_QUIETLY_ENOENT = 0x1;
    }
}

/// Problem directory errors
#[derive(Debug, Error)]
pub enum DumpDirError {
    #[error("'{0}' does not exist")]
    NotFound(PathBuf),

    #[error("Can't access '{0}'")]
    AccessDenied(PathBuf),

    #[error("'{0}' is not a problem directory")]
    NotADumpDir(PathBuf),

    #[error("'{0}' is locked by another process")]
    LockBusy(PathBuf),

    #[error("Bad directory name '{0}'")]
    BadDirName(PathBuf),

    #[error("Invalid element name '{0}'")]
    InvalidElementName(String),

    #[error("Element '{0}' does not exist")]
    ElementNotFound(String),

    #[error("Element '{name}' has invalid value '{value}'")]
    InvalidValue { name: String, value: String },

    #[error("'{0}' is not locked")]
    NotLocked(PathBuf),

    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type DumpDirResult<T> = Result<T, DumpDirError>;

impl DumpDirError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Map an error of the directory itself onto a kind
    fn from_dir_error(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
                Self::NotFound(path.to_path_buf())
            }
            io::ErrorKind::PermissionDenied => Self::AccessDenied(path.to_path_buf()),
            _ => Self::io(path, source),
        }
    }
}

impl From<DumpDirError> for ProblemError {
    fn from(e: DumpDirError) -> Self {
        match e {
            DumpDirError::NotFound(_) | DumpDirError::ElementNotFound(_) => {
                ProblemError::NotFound(e.to_string())
            }
            DumpDirError::AccessDenied(_) => ProblemError::AccessDenied(e.to_string()),
            DumpDirError::NotADumpDir(_) => ProblemError::NotADumpDir(e.to_string()),
            DumpDirError::LockBusy(_) => ProblemError::WouldBlock(e.to_string()),
            DumpDirError::BadDirName(_)
            | DumpDirError::InvalidElementName(_)
            | DumpDirError::InvalidValue { .. } => ProblemError::InvalidArgs(e.to_string()),
            DumpDirError::NotLocked(_) => ProblemError::InvalidState(e.to_string()),
            DumpDirError::Io { .. } => ProblemError::Io(e.to_string()),
        }
    }
}

/// An opened problem directory
///
/// Dropping the value releases the lock.
#[derive(Debug)]
pub struct DumpDir {
    path: PathBuf,
    locked: bool,
    /// Mode of element files
    mode: u32,
    /// uid:gid forced onto element files, when running privileged
    owner: Option<(u32, u32)>,
}

impl DumpDir {
    /// Open and lock an existing problem directory
    ///
    /// Waits while another live process holds the lock unless
    /// `DONT_WAIT_FOR_LOCK` is given. A directory without a `time` element
    /// is retried a few times and then reported as `NotADumpDir`.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> DumpDirResult<Self> {
        let path = strip_trailing_slashes(path.as_ref());
        let mode = fs::metadata(&path)
            .map(|m| m.permissions().mode() & 0o666)
            .unwrap_or(0);

        let mut dd = Self {
            path,
            locked: false,
            mode,
            owner: None,
        };

        let wait = if flags.contains(OpenFlags::DONT_WAIT_FOR_LOCK) {
            None
        } else {
            Some(WAIT_FOR_OTHER_PROCESS)
        };

        if let Err(err) = dd.lock(wait, true) {
            if flags.contains(OpenFlags::READ_ONLY)
                && matches!(err, DumpDirError::AccessDenied(_))
                && is_readable_dir(&dd.path)
            {
                debug!(dir = %dd.path.display(), "Opened read-only without lock");
                return Ok(dd);
            }
            log_open_error(&err, flags);
            return Err(err);
        }

        if nix::unistd::geteuid().is_root() {
            let meta = fs::metadata(&dd.path).map_err(|e| DumpDirError::from_dir_error(&dd.path, e))?;
            if !meta.is_dir() {
                return Err(DumpDirError::NotFound(dd.path.clone()));
            }
            dd.owner = Some((meta.uid(), meta.gid()));
        }

        Ok(dd)
    }

    /// Create a fresh, empty, locked problem directory
    ///
    /// Missing parents are created with mode 0755. The directory gets `mode`
    /// plus search bits wherever `mode` grants read. With `uid` set, the
    /// directory is given to the service account and `uid`'s primary group.
    pub fn create(path: impl AsRef<Path>, uid: Option<u32>, mode: u32) -> DumpDirResult<Self> {
        let dir_mode = mode | ((mode & 0o444) >> 2);
        let path = strip_trailing_slashes(path.as_ref());

        let bad_name = {
            let text = path.to_string_lossy();
            matches!(text.rsplit('/').next(), None | Some("" | "." | ".."))
        };
        if bad_name {
            error!(dir = %path.display(), "Bad directory name");
            return Err(DumpDirError::BadDirName(path));
        }

        if let Err(e) = fs::DirBuilder::new().mode(dir_mode).create(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!(dir = %path.display(), error = %e, "Can't create directory");
                return Err(DumpDirError::io(&path, e));
            }
            if let Some(parent) = path.parent() {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(parent)
                    .map_err(|e| DumpDirError::io(parent, e))?;
            }
            fs::DirBuilder::new()
                .mode(dir_mode)
                .create(&path)
                .map_err(|e| DumpDirError::io(&path, e))?;
        }

        let mut dd = Self {
            path,
            locked: false,
            mode,
            owner: None,
        };

        dd.lock(Some(CREATE_LOCK_RETRY), false)?;

        fs::set_permissions(&dd.path, fs::Permissions::from_mode(dir_mode))
            .map_err(|e| DumpDirError::io(&dd.path, e))?;

        if let Some(uid) = uid {
            let dd_uid = match nix::unistd::User::from_name(SERVICE_ACCOUNT) {
                Ok(Some(user)) => user.uid.as_raw(),
                _ => {
                    warn!(user = SERVICE_ACCOUNT, "Service account does not exist, using uid 0");
                    0
                }
            };
            let dd_gid = match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
                Ok(Some(user)) => user.gid.as_raw(),
                _ => {
                    warn!(uid, "User does not exist, using gid 0");
                    0
                }
            };
            if let Err(e) = std::os::unix::fs::chown(&dd.path, Some(dd_uid), Some(dd_gid)) {
                error!(dir = %dd.path.display(), uid = dd_uid, gid = dd_gid, error = %e, "Can't change ownership");
            }
            dd.owner = Some((dd_uid, dd_gid));
        }

        Ok(dd)
    }

    fn lock(&mut self, wait: Option<Duration>, check_time: bool) -> DumpDirResult<()> {
        if self.locked {
            problemd_util::fatal_bug(format!("Locking bug on '{}'", self.path.display()));
        }

        let pid = lock::own_pid();
        let lock_path = self.path.join(LOCK_FILE);
        let mut no_time_tries = NO_TIME_FILE_COUNT;

        loop {
            loop {
                match lock::try_lock(&lock_path, &pid) {
                    Ok(LockAttempt::Acquired) => break,
                    Ok(LockAttempt::Busy) => match wait {
                        Some(pause) => std::thread::sleep(pause),
                        None => return Err(DumpDirError::LockBusy(self.path.clone())),
                    },
                    Err(e) => return Err(DumpDirError::from_dir_error(&self.path, e)),
                }
            }

            if check_time && !self.path.join(names::TIME).exists() {
                // Either just created by someone else or being deleted
                lock::unlock(&lock_path);
                no_time_tries -= 1;
                if no_time_tries == 0 {
                    return Err(DumpDirError::NotADumpDir(self.path.clone()));
                }
                std::thread::sleep(NO_TIME_FILE_RETRY);
                continue;
            }

            self.locked = true;
            return Ok(());
        }
    }

    fn unlock(&mut self) {
        if self.locked {
            self.locked = false;
            lock::unlock(&self.path.join(LOCK_FILE));
        }
    }

    fn require_lock(&self) -> DumpDirResult<()> {
        if self.locked {
            Ok(())
        } else {
            Err(DumpDirError::NotLocked(self.path.clone()))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last path component, used as the problem ID
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    fn element_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Whether an element (file or directory) exists
    pub fn exists(&self, name: &str) -> bool {
        match fs::metadata(self.element_path(canonical_name(name))) {
            Ok(meta) => meta.is_file() || meta.is_dir(),
            Err(_) => false,
        }
    }

    /// Metadata of a regular-file element
    pub fn element_stat(&self, name: &str) -> Option<fs::Metadata> {
        fs::symlink_metadata(self.element_path(name))
            .ok()
            .filter(|m| m.is_file())
    }

    /// Names of all regular-file elements, sorted
    pub fn list_elements(&self) -> DumpDirResult<Vec<String>> {
        let entries = fs::read_dir(&self.path).map_err(|e| DumpDirError::from_dir_error(&self.path, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| DumpDirError::io(&self.path, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_correct_element_name(&name) {
                continue;
            }
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Total size of all elements in bytes
    pub fn compute_size(&self) -> DumpDirResult<u64> {
        Ok(self
            .list_elements()?
            .iter()
            .filter_map(|n| self.element_stat(n))
            .map(|m| m.len())
            .sum())
    }

    pub fn items_count(&self) -> DumpDirResult<usize> {
        Ok(self.list_elements()?.len())
    }

    /// Load an element as normalized text
    ///
    /// NUL bytes become spaces and control bytes other than whitespace are
    /// dropped. A single trailing newline of a one-line value is removed;
    /// an unterminated multi-line value gets a final newline.
    pub fn load_text(&self, name: &str, flags: LoadFlags) -> DumpDirResult<String> {
        let name = canonical_name(name);
        match fs::read(self.element_path(name)) {
            Ok(raw) => Ok(normalize_text(&raw)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if flags.contains(LoadFlags::FAIL_QUIETLY_ENOENT) {
                    Ok(String::new())
                } else {
                    debug!(dir = %self.path.display(), element = name, "Element does not exist");
                    Err(DumpDirError::ElementNotFound(name.to_string()))
                }
            }
            Err(e) => Err(DumpDirError::io(self.element_path(name), e)),
        }
    }

    /// Load an element verbatim
    pub fn load_bytes(&self, name: &str) -> DumpDirResult<Vec<u8>> {
        let name = canonical_name(name);
        fs::read(self.element_path(name)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                DumpDirError::ElementNotFound(name.to_string())
            } else {
                DumpDirError::io(self.element_path(name), e)
            }
        })
    }

    pub fn load_u32(&self, name: &str) -> DumpDirResult<u32> {
        let text = self.load_text(name, LoadFlags::empty())?;
        text.trim().parse().map_err(|_| DumpDirError::InvalidValue {
            name: name.to_string(),
            value: text.clone(),
        })
    }

    /// Open an element file for writing, replacing any previous file
    fn create_element(&self, name: &str) -> DumpDirResult<fs::File> {
        self.require_lock()?;
        if !is_correct_element_name(name) {
            return Err(DumpDirError::InvalidElementName(name.to_string()));
        }

        let path = self.element_path(name);
        let _ = fs::remove_file(&path);
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.mode)
            .open(&path)
            .map_err(|e| {
                error!(file = %path.display(), error = %e, "Can't open file");
                DumpDirError::io(&path, e)
            })?;

        if let Some((uid, gid)) = self.owner
            && let Err(e) = std::os::unix::fs::fchown(&file, Some(uid), Some(gid))
        {
            error!(file = %path.display(), uid, gid, error = %e, "Can't change ownership");
        }

        Ok(file)
    }

    pub fn save_binary(&self, name: &str, data: &[u8]) -> DumpDirResult<()> {
        let mut file = self.create_element(name)?;
        file.write_all(data)
            .map_err(|e| DumpDirError::io(self.element_path(name), e))
    }

    pub fn save_text(&self, name: &str, data: &str) -> DumpDirResult<()> {
        self.save_binary(name, data.as_bytes())
    }

    pub fn save_u32(&self, name: &str, value: u32) -> DumpDirResult<()> {
        self.save_text(name, &value.to_string())
    }

    /// Copy at most `max_size` bytes from `src` into an element
    ///
    /// Returns the number of bytes copied; a result equal to `max_size`
    /// means the source may have been truncated.
    pub fn copy_fd(&self, name: &str, src: &mut impl Read, max_size: u64) -> DumpDirResult<u64> {
        let mut file = self.create_element(name)?;
        io::copy(&mut src.take(max_size), &mut file)
            .map_err(|e| DumpDirError::io(self.element_path(name), e))
    }

    pub fn delete_element(&self, name: &str) -> DumpDirResult<()> {
        self.require_lock()?;
        if !is_correct_element_name(name) {
            return Err(DumpDirError::InvalidElementName(name.to_string()));
        }
        match fs::remove_file(self.element_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DumpDirError::io(self.element_path(name), e)),
        }
    }

    /// Write `time`, `uid` and the host description elements
    pub fn create_basic_files(&self, uid: Option<u32>) -> DumpDirResult<()> {
        self.save_text(names::TIME, &problemd_util::epoch_secs().to_string())?;

        if let Some(uid) = uid {
            self.save_u32(names::UID, uid)?;
        }

        match nix::sys::utsname::uname() {
            Ok(uts) => {
                self.save_text(names::KERNEL, &uts.release().to_string_lossy())?;
                self.save_text(names::ARCHITECTURE, &uts.machine().to_string_lossy())?;
                self.save_text(names::HOSTNAME, &uts.nodename().to_string_lossy())?;
            }
            Err(e) => warn!(error = %e, "uname failed"),
        }

        let release = ["/etc/system-release", "/etc/redhat-release"]
            .iter()
            .find_map(|p| fs::read(p).ok())
            .map(|raw| normalize_text(&raw))
            .or_else(os_release_pretty_name)
            .unwrap_or_default();
        self.save_text(names::OS_RELEASE, &release)
    }

    /// Force mode and ownership of element files when running privileged
    pub fn sanitize_mode_and_owner(&self) -> DumpDirResult<()> {
        let Some((uid, gid)) = self.owner else {
            return Ok(());
        };
        self.require_lock()?;

        let Ok(entries) = fs::read_dir(&self.path) else {
            return Ok(());
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            let Ok(meta) = fs::symlink_metadata(&path) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            if meta.permissions().mode() & 0o777 != self.mode {
                let _ = fs::set_permissions(&path, fs::Permissions::from_mode(self.mode));
            }
            if (meta.uid() != uid || meta.gid() != gid)
                && let Err(e) = std::os::unix::fs::lchown(&path, Some(uid), Some(gid))
            {
                error!(file = %path.display(), uid, gid, error = %e, "Can't change ownership");
            }
        }
        Ok(())
    }

    /// Uid the problem belongs to
    ///
    /// Read from the `uid` element, falling back to the directory owner.
    pub fn owner(&self) -> DumpDirResult<u32> {
        if let Ok(uid) = self.load_u32(names::UID) {
            return Ok(uid);
        }
        fs::metadata(&self.path)
            .map(|m| m.uid())
            .map_err(|e| DumpDirError::from_dir_error(&self.path, e))
    }

    pub fn accessible_by_uid(&self, uid: u32) -> bool {
        uid == 0 || self.owner().map(|owner| owner == uid).unwrap_or(false)
    }

    /// Record a report line unless an identical one is present
    pub fn add_reported_to(&self, line: &str) -> DumpDirResult<()> {
        self.require_lock()?;
        let existing = fs::read(self.element_path(names::REPORTED_TO))
            .ok()
            .map(|raw| String::from_utf8_lossy(&raw).into_owned());
        match append_reported_line(existing.as_deref(), line) {
            Some(content) => self.save_text(names::REPORTED_TO, &content),
            None => Ok(()),
        }
    }

    pub fn reported_to(&self) -> Vec<ReportInfo> {
        self.load_text(names::REPORTED_TO, LoadFlags::FAIL_QUIETLY_ENOENT)
            .map(|content| parse_reported_to(&content))
            .unwrap_or_default()
    }

    /// Move the directory, keeping the lock
    pub fn rename(&mut self, new_path: impl AsRef<Path>) -> DumpDirResult<()> {
        self.require_lock()?;
        let new_path = strip_trailing_slashes(new_path.as_ref());
        fs::rename(&self.path, &new_path).map_err(|e| DumpDirError::io(&new_path, e))?;
        self.path = new_path;
        Ok(())
    }

    /// Recursively remove the directory
    ///
    /// Succeeds if the directory is already gone.
    pub fn delete(mut self) -> DumpDirResult<()> {
        let result = delete_file_dir(&self.path, true);
        // The lock went away with the directory
        self.locked = false;
        result.map_err(|e| DumpDirError::io(&self.path, e))
    }
}

impl Drop for DumpDir {
    fn drop(&mut self) {
        self.unlock();
    }
}

fn strip_trailing_slashes(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() && !s.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

fn is_readable_dir(path: &Path) -> bool {
    path.is_dir() && nix::unistd::access(path, nix::unistd::AccessFlags::R_OK).is_ok()
}

fn log_open_error(err: &DumpDirError, flags: OpenFlags) {
    match err {
        DumpDirError::NotADumpDir(dir) => {
            warn!(dir = %dir.display(), "Not a problem directory");
        }
        DumpDirError::NotFound(dir) => {
            if flags.contains(OpenFlags::FAIL_QUIETLY_ENOENT) {
                debug!(dir = %dir.display(), "Problem directory does not exist");
            } else {
                warn!(dir = %dir.display(), "Problem directory does not exist");
            }
        }
        DumpDirError::LockBusy(dir) => {
            debug!(dir = %dir.display(), "Problem directory is locked");
        }
        other => {
            if flags.contains(OpenFlags::FAIL_QUIETLY_EACCES) {
                debug!(error = %other, "Can't open problem directory");
            } else {
                warn!(error = %other, "Can't open problem directory");
            }
        }
    }
}

/// Normalize raw element content into text
pub fn normalize_text(raw: &[u8]) -> String {
    let mut newlines = 0usize;
    let mut out = Vec::with_capacity(raw.len());

    for &b in raw {
        if b == b'\n' {
            newlines += 1;
        }
        let b = if b == 0 { b' ' } else { b };
        if is_c_space(b) || b >= b' ' {
            out.push(b);
        }
    }

    if newlines > 0 {
        if out.last() == Some(&b'\n') {
            if newlines == 1 {
                out.pop();
            }
        } else {
            out.push(b'\n');
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn is_c_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

fn os_release_pretty_name() -> Option<String> {
    let content = fs::read_to_string("/etc/os-release").ok()?;
    content.lines().find_map(|line| {
        line.strip_prefix("PRETTY_NAME=")
            .map(|v| v.trim_matches('"').to_string())
    })
}

fn delete_file_dir(dir: &Path, skip_lock_file: bool) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let mut unlink_lock_file = false;
    for entry in entries {
        let entry = entry?;
        if skip_lock_file && entry.file_name() == LOCK_FILE {
            unlink_lock_file = true;
            continue;
        }

        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let result = if is_dir {
            delete_file_dir(&path, false)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                error!(file = %path.display(), error = %e, "Can't remove");
                return Err(e);
            }
        }
    }

    if unlink_lock_file {
        lock::unlock(&dir.join(LOCK_FILE));

        // A concurrent opener may briefly re-create the lock; it backs off
        // once it sees no `time` element.
        for _ in 0..RMDIR_FAIL_COUNT {
            if fs::remove_dir(dir).is_ok() {
                return Ok(());
            }
            std::thread::sleep(RMDIR_FAIL_RETRY);
        }
    }

    match fs::remove_dir(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            error!(dir = %dir.display(), error = %e, "Can't remove directory");
            Err(e)
        }
        _ => Ok(()),
    }
}

/// Directories below `location` that look like problem directories
pub fn list_problem_dirs(location: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(location)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name.ends_with(STAGING_SUFFIX) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() && path.join(names::TIME).is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn new_problem(root: &Path, name: &str) -> DumpDir {
        let dd = DumpDir::create(root.join(name), None, 0o640).unwrap();
        dd.create_basic_files(Some(1000)).unwrap();
        dd
    }

    #[test]
    fn create_then_open() {
        let root = tempdir().unwrap();
        let dd = new_problem(root.path(), "ccpp-1");
        assert!(dd.is_locked());
        assert!(root.path().join("ccpp-1/.lock").symlink_metadata().is_ok());
        drop(dd);
        assert!(root.path().join("ccpp-1/.lock").symlink_metadata().is_err());

        let dd = DumpDir::open(root.path().join("ccpp-1/"), OpenFlags::empty()).unwrap();
        assert_eq!(dd.name(), "ccpp-1");
        assert_eq!(dd.load_u32("uid").unwrap(), 1000);
        assert!(dd.exists("kernel"));
        assert_eq!(dd.mode(), 0o640);
    }

    #[test]
    fn create_makes_parents_and_refuses_dots() {
        let root = tempdir().unwrap();
        let dd = DumpDir::create(root.path().join("a/b/c"), None, 0o600).unwrap();
        let meta = fs::metadata(dd.path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);

        assert!(matches!(
            DumpDir::create(root.path().join("a/.."), None, 0o600),
            Err(DumpDirError::BadDirName(_))
        ));
        assert!(matches!(
            DumpDir::create(root.path().join("."), None, 0o600),
            Err(DumpDirError::BadDirName(_))
        ));
    }

    #[test]
    fn text_round_trip_rules() {
        let root = tempdir().unwrap();
        let dd = new_problem(root.path(), "p");

        dd.save_text("k", "v").unwrap();
        assert_eq!(dd.load_text("k", LoadFlags::empty()).unwrap(), "v");

        dd.save_text("k", "v\n").unwrap();
        assert_eq!(dd.load_text("k", LoadFlags::empty()).unwrap(), "v");

        dd.save_text("k", "v\n\n").unwrap();
        assert_eq!(dd.load_text("k", LoadFlags::empty()).unwrap(), "v\n\n");

        dd.save_text("k", "a\nb").unwrap();
        assert_eq!(dd.load_text("k", LoadFlags::empty()).unwrap(), "a\nb\n");

        dd.save_binary("k", b"a\0b\x01c").unwrap();
        assert_eq!(dd.load_text("k", LoadFlags::empty()).unwrap(), "a bc");
    }

    #[test]
    fn missing_elements() {
        let root = tempdir().unwrap();
        let dd = new_problem(root.path(), "p");

        assert!(matches!(
            dd.load_text("nope", LoadFlags::empty()),
            Err(DumpDirError::ElementNotFound(_))
        ));
        assert_eq!(dd.load_text("nope", LoadFlags::FAIL_QUIETLY_ENOENT).unwrap(), "");
    }

    #[test]
    fn release_alias_reads_os_release() {
        let root = tempdir().unwrap();
        let dd = new_problem(root.path(), "p");
        dd.save_text("os_release", "Fedora release 40").unwrap();
        assert_eq!(dd.load_text("release", LoadFlags::empty()).unwrap(), "Fedora release 40");
    }

    #[test]
    fn ordinary_directory_is_not_a_dump_dir() {
        let root = tempdir().unwrap();
        let plain = root.path().join("plain");
        fs::create_dir(&plain).unwrap();

        let err = DumpDir::open(&plain, OpenFlags::empty()).unwrap_err();
        assert!(matches!(err, DumpDirError::NotADumpDir(_)));
        // The lock was released on every retry
        assert!(plain.join(LOCK_FILE).symlink_metadata().is_err());
    }

    #[test]
    fn missing_time_is_retried_before_giving_up() {
        let root = tempdir().unwrap();
        let plain = root.path().join("plain");
        fs::create_dir(&plain).unwrap();

        let started = std::time::Instant::now();
        let err = DumpDir::open(&plain, OpenFlags::empty()).unwrap_err();
        assert!(matches!(err, DumpDirError::NotADumpDir(_)));
        assert!(started.elapsed() >= NO_TIME_FILE_RETRY * (NO_TIME_FILE_COUNT - 1));
    }

    #[test]
    fn time_written_during_retries_is_found() {
        let root = tempdir().unwrap();
        let dir = root.path().join("late");
        fs::create_dir(&dir).unwrap();

        let writer = {
            let dir = dir.clone();
            std::thread::spawn(move || {
                std::thread::sleep(NO_TIME_FILE_RETRY * 3);
                fs::write(dir.join(names::TIME), "1700000000").unwrap();
            })
        };

        let dd = DumpDir::open(&dir, OpenFlags::empty()).unwrap();
        assert!(dd.is_locked());
        writer.join().unwrap();
    }

    #[test]
    fn missing_directory_is_not_found() {
        let root = tempdir().unwrap();
        let err = DumpDir::open(root.path().join("gone"), OpenFlags::FAIL_QUIETLY_ENOENT)
            .unwrap_err();
        assert!(matches!(err, DumpDirError::NotFound(_)));
    }

    #[test]
    fn busy_lock_with_dont_wait() {
        let root = tempdir().unwrap();
        let dd = new_problem(root.path(), "p");

        let err = DumpDir::open(dd.path(), OpenFlags::DONT_WAIT_FOR_LOCK).unwrap_err();
        assert!(matches!(err, DumpDirError::LockBusy(_)));
        assert!(ProblemError::from(err).to_string().contains("would block"));
    }

    #[test]
    fn concurrent_opens_are_exclusive() {
        let root = tempdir().unwrap();
        let path = new_problem(root.path(), "p").path().to_path_buf();

        let holders = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let holders = holders.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let dd = DumpDir::open(&path, OpenFlags::empty()).unwrap();
                    assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                    std::thread::sleep(Duration::from_millis(20));
                    holders.fetch_sub(1, Ordering::SeqCst);
                    drop(dd);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn mutation_requires_lock() {
        let root = tempdir().unwrap();
        let mut dd = new_problem(root.path(), "p");
        dd.unlock();
        assert!(matches!(dd.save_text("x", "y"), Err(DumpDirError::NotLocked(_))));
        assert!(matches!(dd.delete_element("x"), Err(DumpDirError::NotLocked(_))));
    }

    #[test]
    fn invalid_element_names_are_rejected() {
        let root = tempdir().unwrap();
        let dd = new_problem(root.path(), "p");
        assert!(matches!(
            dd.save_text("../escape", "x"),
            Err(DumpDirError::InvalidElementName(_))
        ));
    }

    #[test]
    fn listing_size_and_count() {
        let root = tempdir().unwrap();
        let dd = DumpDir::create(root.path().join("p"), None, 0o640).unwrap();
        dd.save_text("time", "1").unwrap();
        dd.save_text("reason", "abc").unwrap();
        fs::create_dir(dd.path().join("subdir")).unwrap();

        assert_eq!(dd.list_elements().unwrap(), vec!["reason", "time"]);
        assert_eq!(dd.items_count().unwrap(), 2);
        assert_eq!(dd.compute_size().unwrap(), 4);
        assert!(dd.element_stat("subdir").is_none());
        assert!(dd.exists("subdir"));
    }

    #[test]
    fn copy_fd_truncates() {
        let root = tempdir().unwrap();
        let dd = new_problem(root.path(), "p");

        let mut src: &[u8] = b"0123456789";
        assert_eq!(dd.copy_fd("core", &mut src, 4).unwrap(), 4);
        assert_eq!(dd.load_bytes("core").unwrap(), b"0123");

        let mut src: &[u8] = b"01";
        assert_eq!(dd.copy_fd("core", &mut src, u64::MAX).unwrap(), 2);
    }

    #[test]
    fn owner_and_access() {
        let root = tempdir().unwrap();
        let dd = new_problem(root.path(), "p");
        assert_eq!(dd.owner().unwrap(), 1000);
        assert!(dd.accessible_by_uid(0));
        assert!(dd.accessible_by_uid(1000));
        assert!(!dd.accessible_by_uid(1001));
    }

    #[test]
    fn reported_to_is_deduplicated() {
        let root = tempdir().unwrap();
        let dd = new_problem(root.path(), "p");
        dd.add_reported_to("Bugzilla: URL=https://b/1").unwrap();
        dd.add_reported_to("Bugzilla: URL=https://b/1").unwrap();
        dd.add_reported_to("uReport: BTHASH=aa").unwrap();

        let reports = dd.reported_to();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].bthash.as_deref(), Some("aa"));
    }

    #[test]
    fn rename_keeps_lock() {
        let root = tempdir().unwrap();
        let mut dd = new_problem(root.path(), "p");
        dd.rename(root.path().join("q")).unwrap();
        assert!(dd.path().ends_with("q"));
        dd.save_text("reason", "moved").unwrap();
        drop(dd);
        assert!(root.path().join("q/.lock").symlink_metadata().is_err());
    }

    #[test]
    fn delete_removes_everything() {
        let root = tempdir().unwrap();
        let dd = new_problem(root.path(), "p");
        fs::create_dir(dd.path().join("nested")).unwrap();
        fs::write(dd.path().join("nested/file"), "x").unwrap();

        let path = dd.path().to_path_buf();
        dd.delete().unwrap();
        assert!(!path.exists());

        // Already gone is fine
        assert!(delete_file_dir(&path, true).is_ok());
    }

    #[test]
    fn problem_dirs_need_time() {
        let root = tempdir().unwrap();
        drop(new_problem(root.path(), "a"));
        drop(new_problem(root.path(), "b"));
        fs::create_dir(root.path().join("plain")).unwrap();
        // Left behind by a save that never finished
        drop(new_problem(root.path(), "c.new"));

        let dirs = list_problem_dirs(root.path()).unwrap();
        assert_eq!(dirs.len(), 2);
        assert!(dirs[0].ends_with("a"));
    }
}
