//! Problem entries: access-controlled views of problem directories

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use problemd_api::{
    ElementFlags, ElementInfo, ElementValue, EntryProperties, PackageInfo, ProblemInfo,
    ReadElementsFlags, SaveElementsFlags,
};
use problemd_store::{
    DumpDir, DumpDirError, LoadFlags, OpenFlags, canonical_name, classify, is_correct_element_name,
    names, normalize_text,
};
use problemd_util::{ProblemError, Result, parse_epoch_secs};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Computed element naming the problem directory
pub const DIRECTORY_ELEMENT: &str = "Directory";

/// Problem types only the system may create
const RESTRICTED_TYPES: &[&str] = &["CCpp", "Kerneloops", "vmcore", "xorg"];

/// Elements whose value decides problem type
const TYPE_ELEMENTS: &[&str] = &[names::ANALYZER, names::TYPE, names::BASENAME];

/// Elements `post-create` rules match on; they must arrive as inline text
const POST_CREATE_CONDITIONS: &[&str] = &[
    names::ANALYZER,
    names::TYPE,
    names::COMPONENT,
    names::EXECUTABLE,
    names::PACKAGE,
    names::PKG_NAME,
    names::REASON,
    names::UID,
    names::UUID,
    names::DUPHASH,
    names::CMDLINE,
];

/// Lifecycle of a problem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Written but not yet confirmed by post-processing
    New,
    /// Durable and visible
    Complete,
    Deleted,
}

/// Limits enforced while saving elements; 0 means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveLimits {
    pub elements: u32,
    pub data_size: u64,
}

/// Limits of one ReadElements answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    pub max_size: u64,
    pub max_fds: u32,
}

/// A registered problem directory
#[derive(Debug, Clone)]
pub struct ProblemEntry {
    dir: PathBuf,
    state: EntryState,
}

impl ProblemEntry {
    pub fn new(dir: impl Into<PathBuf>, state: EntryState) -> Self {
        Self {
            dir: dir.into(),
            state,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The problem ID, which is the directory path
    pub fn id(&self) -> String {
        self.dir.to_string_lossy().into_owned()
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn set_state(&mut self, state: EntryState) {
        self.state = state;
    }

    /// Uid the problem belongs to, read without taking the lock
    ///
    /// `None` when the directory cannot be read.
    pub fn owner(&self) -> Option<u32> {
        if let Ok(raw) = fs::read(self.dir.join(names::UID))
            && let Ok(uid) = normalize_text(&raw).trim().parse()
        {
            return Some(uid);
        }
        fs::metadata(&self.dir)
            .ok()
            .filter(|m| m.is_dir())
            .map(|m| m.uid())
    }

    pub fn accessible_by(&self, uid: u32) -> bool {
        match self.owner() {
            Some(owner) => uid == 0 || owner == uid,
            None => {
                debug!(dir = %self.dir.display(), "Can't open problem directory");
                false
            }
        }
    }

    fn open(&self, caller_uid: u32, flags: OpenFlags) -> Result<DumpDir> {
        if !self.accessible_by(caller_uid) {
            return Err(ProblemError::access_denied(
                "You are not authorized to access the problem",
            ));
        }
        DumpDir::open(&self.dir, flags | OpenFlags::FAIL_QUIETLY_ENOENT).map_err(reopen_error)
    }

    /// Remove the problem directory
    pub fn delete(&mut self, caller_uid: u32) -> Result<()> {
        if self.state == EntryState::Deleted {
            return Err(ProblemError::invalid_state("Problem entry is already deleted"));
        }
        if !self.accessible_by(caller_uid) {
            return Err(ProblemError::access_denied(
                "You are not authorized to delete the problem",
            ));
        }

        let dd = DumpDir::open(&self.dir, OpenFlags::DONT_WAIT_FOR_LOCK).map_err(reopen_error)?;
        dd.delete().map_err(|e| {
            error!(dir = %self.dir.display(), error = %e, "Failed to remove problem data");
            ProblemError::io("Failed to remove problem data. Check system logs.")
        })?;

        self.state = EntryState::Deleted;
        Ok(())
    }

    /// All elements with their type flags, sizes and contents
    ///
    /// Text elements carry their value; big text and binary elements carry
    /// the path of their file.
    pub fn problem_data(&self, caller_uid: u32) -> Result<BTreeMap<String, ElementInfo>> {
        let dd = self.open(caller_uid, OpenFlags::READ_ONLY)?;

        let mut data = BTreeMap::new();
        for name in dd.list_elements()? {
            let path = dd.path().join(&name);
            let (flags, size) = match (classify(&name, &path), dd.element_stat(&name)) {
                (Ok(flags), Some(meta)) => (flags, meta.len()),
                _ => {
                    debug!(element = %name, "Can't get stat of element");
                    continue;
                }
            };

            let content = if flags.contains(ElementFlags::TEXT) {
                dd.load_text(&name, LoadFlags::FAIL_QUIETLY_ENOENT)?
            } else {
                path.to_string_lossy().into_owned()
            };

            data.insert(
                name,
                ElementInfo {
                    flags: flags.bits(),
                    size,
                    content,
                },
            );
        }

        let dir = self.id();
        data.insert(
            DIRECTORY_ELEMENT.to_string(),
            ElementInfo {
                flags: (ElementFlags::TEXT | ElementFlags::NOT_EDITABLE).bits(),
                size: dir.len() as u64,
                content: dir,
            },
        );
        Ok(data)
    }

    /// Load the requested elements
    ///
    /// Missing and prohibited names are skipped. Returned handles index
    /// into the returned descriptors.
    pub fn read_elements(
        &self,
        caller_uid: u32,
        requested: &[String],
        flags: ReadElementsFlags,
        limits: ReadLimits,
    ) -> Result<(ProblemInfo, Vec<OwnedFd>)> {
        if flags.contains(ReadElementsFlags::ALL_FD | ReadElementsFlags::ALL_NO_FD) {
            return Err(ProblemError::invalid_args(
                "Invalid arguments 'ALL FD' ~ 'ALL NO FD'",
            ));
        }

        let dd = self.open(caller_uid, OpenFlags::READ_ONLY | OpenFlags::DONT_WAIT_FOR_LOCK)?;

        let mut values = ProblemInfo::new();
        let mut fds = Vec::new();
        let mut loaded_size = 0u64;

        for name in requested {
            if !is_correct_element_name(name) {
                error!(element = %name, "Attempt to read prohibited data");
                continue;
            }
            let file_name = canonical_name(name);
            if dd.element_stat(file_name).is_none() {
                debug!(element = %name, "Element does not exist");
                continue;
            }
            let path = dd.path().join(file_name);
            let elem_flags = match classify(name, &path) {
                Ok(f) => f,
                Err(e) => {
                    error!(element = %name, error = %e, "Failed to open element");
                    continue;
                }
            };

            if (flags.contains(ReadElementsFlags::ONLY_TEXT) && !elem_flags.contains(ElementFlags::TEXT))
                || (flags.contains(ReadElementsFlags::ONLY_BIG_TEXT)
                    && !elem_flags.contains(ElementFlags::BIG_TEXT))
                || (flags.contains(ReadElementsFlags::ONLY_BINARY)
                    && !elem_flags.contains(ElementFlags::BINARY))
            {
                debug!(element = %name, "Element is not of the requested type");
                continue;
            }

            let is_text = elem_flags.contains(ElementFlags::TEXT);
            if flags.contains(ReadElementsFlags::ALL_FD)
                || (!flags.contains(ReadElementsFlags::ALL_NO_FD) && !is_text)
            {
                if fds.len() as u32 >= limits.max_fds {
                    error!(limit = limits.max_fds, "Reached limit of file descriptors per message");
                    continue;
                }
                match File::open(&path) {
                    Ok(file) => {
                        values.insert(name.clone(), ElementValue::Handle(fds.len() as u32));
                        fds.push(OwnedFd::from(file));
                    }
                    Err(e) => error!(element = %name, error = %e, "Failed to open element"),
                }
                continue;
            }

            let value = if elem_flags.contains(ElementFlags::BINARY) {
                dd.load_bytes(name).map(ElementValue::Bytes)
            } else {
                dd.load_text(name, LoadFlags::empty()).map(ElementValue::Text)
            };
            let value = match value {
                Ok(v) => v,
                Err(e) => {
                    error!(element = %name, error = %e, "Failed to load element");
                    continue;
                }
            };

            let size = match &value {
                ElementValue::Bytes(b) => b.len() as u64,
                ElementValue::Text(t) => t.len() as u64,
                ElementValue::Handle(_) => 0,
            };
            if size > limits.max_size || loaded_size > limits.max_size - size {
                error!(element = %name, limit = limits.max_size, "Reached message data size limit");
                continue;
            }
            loaded_size += size;
            values.insert(name.clone(), value);
        }

        Ok((values, fds))
    }

    /// Store elements, honoring the caller's limits
    pub fn save_elements(
        &self,
        caller_uid: u32,
        elements: ProblemInfo,
        fds: Vec<OwnedFd>,
        flags: SaveElementsFlags,
        limits: SaveLimits,
    ) -> Result<()> {
        let dd = self.open(caller_uid, OpenFlags::DONT_WAIT_FOR_LOCK)?;
        save_elements_in_dump_dir(&dd, elements, fds, caller_uid, flags, limits)
    }

    /// Remove elements; prohibited names are skipped
    pub fn delete_elements(&self, caller_uid: u32, elements: &[String]) -> Result<()> {
        let dd = self.open(caller_uid, OpenFlags::DONT_WAIT_FOR_LOCK)?;
        for name in elements {
            debug!(element = %name, "Deleting element");
            match dd.delete_element(name) {
                Ok(()) => {}
                Err(DumpDirError::InvalidElementName(_)) => {
                    error!(element = %name, "Attempt to remove prohibited data");
                }
                Err(e) => warn!(element = %name, error = %e, "Failed to delete element"),
            }
        }
        Ok(())
    }

    pub fn properties(&self, caller_uid: u32) -> Result<EntryProperties> {
        let dd = self.open(caller_uid, OpenFlags::READ_ONLY | OpenFlags::DONT_WAIT_FOR_LOCK)?;
        let text = |name: &str| {
            dd.load_text(name, LoadFlags::FAIL_QUIETLY_ENOENT)
                .unwrap_or_default()
        };

        let first_occurrence = parse_epoch_secs(&text(names::TIME)).ok_or_else(|| {
            ProblemError::invalid_state("Invalid problem data: FirstOccurrence cannot be returned")
        })?;
        let last_occurrence = parse_epoch_secs(&text(names::LAST_OCCURRENCE)).unwrap_or(first_occurrence);

        Ok(EntryProperties {
            id: self.id(),
            user: text(names::USERNAME),
            hostname: text(names::HOSTNAME),
            problem_type: text(names::TYPE),
            executable: text(names::EXECUTABLE),
            command_line: text(names::CMDLINE),
            component: text(names::COMPONENT),
            uuid: text(names::UUID),
            duphash: text(names::DUPHASH),
            reason: text(names::REASON),
            technical_details: text(names::NOT_REPORTABLE),
            uid: dd.load_u32(names::UID).unwrap_or(0),
            count: dd.load_u32(names::COUNT).unwrap_or(1),
            first_occurrence,
            last_occurrence,
            package: PackageInfo {
                package: text(names::PACKAGE),
                epoch: text(names::PKG_EPOCH),
                name: text(names::PKG_NAME),
                version: text(names::PKG_VERSION),
                release: text(names::PKG_RELEASE),
            },
            reports: dd.reported_to(),
            elements: dd.list_elements()?,
            is_reported: dd.exists(names::REPORTED_TO),
            can_be_reported: !dd.exists(names::NOT_REPORTABLE),
            is_remote: dd.exists(names::REMOTE),
        })
    }
}

fn reopen_error(e: DumpDirError) -> ProblemError {
    match e {
        DumpDirError::LockBusy(_) => {
            ProblemError::would_block("Cannot lock the problem. Check system logs.")
        }
        other => {
            warn!(error = %other, "Failed to reopen problem directory");
            ProblemError::io("Failed to reopen problem directory")
        }
    }
}

/// Whether a non-root user may set `name` to `value`
///
/// Users can't impersonate problem types only the system creates.
pub fn allowed_new_user_problem_entry(uid: u32, name: &str, value: &str) -> bool {
    uid == 0 || !TYPE_ELEMENTS.contains(&name) || !RESTRICTED_TYPES.contains(&value)
}

pub fn is_post_create_condition(name: &str) -> bool {
    POST_CREATE_CONDITIONS.contains(&name)
}

/// Save `elements` into a locked directory
///
/// Limit violations skip the element unless the matching `*_FATAL` flag
/// turns them into errors. Descriptors are read non-blocking and copied up
/// to the remaining size allowance.
pub fn save_elements_in_dump_dir(
    dd: &DumpDir,
    elements: ProblemInfo,
    fds: Vec<OwnedFd>,
    caller_uid: u32,
    flags: SaveElementsFlags,
    limits: SaveLimits,
) -> Result<()> {
    let io_fatal = flags.contains(SaveElementsFlags::IO_ERROR_FATAL);
    let size_fatal = flags.contains(SaveElementsFlags::DATA_SIZE_LIMIT_FATAL);
    let mut fds: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();

    let mut dd_size = dd.compute_size().map_err(|e| {
        error!(error = %e, "Failed to get file system size of problem directory");
        ProblemError::io("Dump directory file system size")
    })?;
    let mut dd_items = dd.items_count().map_err(|e| {
        error!(error = %e, "Failed to get count of problem directory elements");
        ProblemError::io("Dump directory elements count")
    })? as u64;

    for (name, value) in elements {
        debug!(element = %name, "Saving element");
        if !is_correct_element_name(&name) {
            error!(element = %name, "Attempt to save prohibited data");
            return Err(ProblemError::access_denied("Not allowed problem element name"));
        }

        let item_size = match dd.element_stat(&name) {
            Some(meta) => meta.len(),
            None if dd.exists(&name) => {
                error!(element = %name, "Failed to get size of element");
                if io_fatal {
                    return Err(ProblemError::io("Failed to get size of underlying data"));
                }
                continue;
            }
            None => {
                if limits.elements != 0 && dd_items >= u64::from(limits.elements) {
                    error!(element = %name, limit = limits.elements, "Cannot create new element: reached the limit for elements");
                    if flags.contains(SaveElementsFlags::ELEMENTS_COUNT_LIMIT_FATAL) {
                        return Err(ProblemError::limits("Too many elements"));
                    }
                    continue;
                }
                dd_items += 1;
                0
            }
        };
        let base_size = dd_size.saturating_sub(item_size);

        match value {
            ElementValue::Text(_) | ElementValue::Bytes(_) => {
                let data: &[u8] = match &value {
                    ElementValue::Text(t) => t.as_bytes(),
                    ElementValue::Bytes(b) => b,
                    ElementValue::Handle(_) => &[],
                };
                let shown = String::from_utf8_lossy(data);
                if !allowed_new_user_problem_entry(caller_uid, &name, &shown) {
                    error!(uid = caller_uid, element = %name, value = %shown, "Not allowed for user");
                    return Err(ProblemError::invalid_args(format!(
                        "You are not allowed to create element '{}' containing '{}'",
                        name, shown
                    )));
                }

                let data_size = data.len() as u64;
                if limits.data_size != 0
                    && data_size > item_size
                    && base_size + data_size > limits.data_size
                {
                    error!(
                        element = %name,
                        limit = limits.data_size,
                        data_size,
                        item_size,
                        base_size,
                        "Cannot save element: problem data size limit"
                    );
                    if size_fatal {
                        return Err(ProblemError::limits("Problem data is too big"));
                    }
                    continue;
                }

                if let Err(e) = dd.save_binary(&name, data) {
                    error!(element = %name, error = %e, "Failed to save element");
                    if io_fatal {
                        return Err(ProblemError::io(format!("Failed to save element '{}'", name)));
                    }
                    continue;
                }
                dd_size = base_size + data_size;
            }
            ElementValue::Handle(index) => {
                if is_post_create_condition(&name) {
                    error!(element = %name, "post-create element as file descriptor");
                    return Err(ProblemError::invalid_args(format!(
                        "Element '{}' must be inline text",
                        name
                    )));
                }

                let Some(fd) = fds.get_mut(index as usize).and_then(Option::take) else {
                    error!(element = %name, index, "No file descriptor for element");
                    if io_fatal {
                        return Err(ProblemError::io("Failed to get passed file descriptor"));
                    }
                    continue;
                };

                // Never grow a directory that already exceeds the limit
                let max_size = if limits.data_size == 0 {
                    u64::MAX
                } else if base_size > limits.data_size {
                    item_size
                } else {
                    limits.data_size - base_size
                };

                if let Err(e) = fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
                    error!(element = %name, error = %e, "Failed to set file descriptor non-blocking");
                    if io_fatal {
                        return Err(ProblemError::io(format!(
                            "Failed to set file descriptor of the '{}' item non-blocking",
                            name
                        )));
                    }
                    continue;
                }

                let mut source = File::from(fd);
                match dd.copy_fd(&name, &mut source, max_size) {
                    Err(e) => {
                        error!(element = %name, error = %e, "Failed to save file descriptor");
                        if io_fatal {
                            return Err(ProblemError::io(
                                "Failed to save data of passed file descriptor",
                            ));
                        }
                    }
                    Ok(copied) if copied >= max_size => {
                        error!(element = %name, max_size, "File descriptor was truncated due to size limit");
                        if size_fatal {
                            return Err(ProblemError::limits("Problem data is too big"));
                        }
                        dd_size = base_size + max_size;
                    }
                    Ok(copied) => dd_size = base_size + copied,
                }
            }
        }
    }

    Ok(())
}
