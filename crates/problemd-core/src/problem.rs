//! Creation of new problem directories from client data

use problemd_api::{ElementValue, ProblemInfo, SaveElementsFlags};
use problemd_config::Settings;
use problemd_store::{DumpDir, STAGING_SUFFIX, names};
use problemd_util::{ProblemError, Result, format_dump_dir_time, now};
use sha2::{Digest, Sha256};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info};

use crate::{SaveLimits, save_elements_in_dump_dir};

/// Analyzer of problems reported without one
pub const DEFAULT_ANALYZER: &str = "libreport";

static PROBLEM_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fill in the elements every problem must have
///
/// `analyzer` defaults to libreport and `type` to the analyzer. Without a
/// `uuid` the duphash is used, or a hash of the inline text values. Only root
/// may choose the `uid`.
pub fn complete_problem_data(data: &mut ProblemInfo, caller_uid: u32) {
    let analyzer = data
        .get(names::ANALYZER)
        .and_then(ElementValue::as_text)
        .unwrap_or(DEFAULT_ANALYZER)
        .to_string();
    data.entry(names::TYPE.to_string())
        .or_insert_with(|| ElementValue::Text(analyzer.clone()));
    data.entry(names::ANALYZER.to_string())
        .or_insert(ElementValue::Text(analyzer));

    if !data.contains_key(names::UUID) {
        let uuid = match data.get(names::DUPHASH).and_then(ElementValue::as_text) {
            Some(duphash) => duphash.to_string(),
            None => text_values_hash(data),
        };
        data.insert(names::UUID.to_string(), ElementValue::Text(uuid));
    }

    if caller_uid != 0 || !data.contains_key(names::UID) {
        data.insert(names::UID.to_string(), ElementValue::Text(caller_uid.to_string()));
    }
}

/// SHA-256 of the inline text values in key order
fn text_values_hash(data: &ProblemInfo) -> String {
    let mut hasher = Sha256::new();
    for value in data.values().filter_map(ElementValue::as_text) {
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Directory name of a new problem of `problem_type`
fn problem_dir_name(problem_type: &str) -> String {
    format!(
        "{}-{}-{}-{}",
        problem_type.replace('/', "_"),
        format_dump_dir_time(&now()),
        std::process::id(),
        PROBLEM_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Write a new problem directory into the dump location
///
/// The directory is written under a temporary name and renamed once
/// complete, so readers never see it half-written. Returns the final path.
pub fn save_problem(
    settings: &Settings,
    mut data: ProblemInfo,
    fds: Vec<OwnedFd>,
    caller_uid: u32,
) -> Result<PathBuf> {
    complete_problem_data(&mut data, caller_uid);

    let problem_type = data
        .get(names::TYPE)
        .and_then(ElementValue::as_text)
        .unwrap_or(DEFAULT_ANALYZER)
        .to_string();
    let owner = data
        .get(names::UID)
        .and_then(ElementValue::as_text)
        .and_then(|uid| uid.trim().parse::<u32>().ok())
        .unwrap_or(caller_uid);

    let service = &settings.service;
    let name = problem_dir_name(&problem_type);
    let final_path = service.dump_location.join(&name);
    let temp_path = service.dump_location.join(format!("{}{}", name, STAGING_SUFFIX));

    let mut dd = DumpDir::create(
        &temp_path,
        service.privileged_owner.then_some(owner),
        service.dump_dir_mode,
    )
    .map_err(|e| {
        error!(dir = %temp_path.display(), error = %e, "Can't create problem directory");
        ProblemError::io(format!("Failed to create new problem directory: {}", e))
    })?;

    let limits = SaveLimits {
        elements: settings.limits.elements_for(caller_uid),
        data_size: settings.limits.data_size_for(caller_uid),
    };

    let written = write_problem(&mut dd, data, fds, caller_uid, owner, limits, &final_path);
    if let Err(e) = written {
        error!(dir = %dd.path().display(), error = %e, "Failed to write new problem");
        if let Err(cleanup) = dd.delete() {
            error!(error = %cleanup, "Failed to remove incomplete problem directory");
        }
        return Err(e);
    }

    info!(dir = %final_path.display(), uid = owner, problem_type = %problem_type, "New problem directory");
    Ok(final_path)
}

fn write_problem(
    dd: &mut DumpDir,
    data: ProblemInfo,
    fds: Vec<OwnedFd>,
    caller_uid: u32,
    owner: u32,
    limits: SaveLimits,
    final_path: &Path,
) -> Result<()> {
    dd.create_basic_files(Some(owner))?;
    save_elements_in_dump_dir(dd, data, fds, caller_uid, SaveElementsFlags::ALL_FATAL, limits)?;
    dd.sanitize_mode_and_owner()?;
    dd.rename(final_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use problemd_store::{LoadFlags, OpenFlags};
    use tempfile::tempdir;

    fn settings(root: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.service.dump_location = root.to_path_buf();
        settings
    }

    fn info(pairs: &[(&str, &str)]) -> ProblemInfo {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ElementValue::from(*v)))
            .collect()
    }

    #[test]
    fn defaults_are_filled_in() {
        let mut data = info(&[("reason", "crashed"), ("uid", "0")]);
        complete_problem_data(&mut data, 1000);

        assert_eq!(data["analyzer"], ElementValue::from("libreport"));
        assert_eq!(data["type"], ElementValue::from("libreport"));
        assert_eq!(data["uid"], ElementValue::from("1000"));
        assert_eq!(data["uuid"].as_text().map(str::len), Some(64));

        let mut data = info(&[("duphash", "abc"), ("analyzer", "Python"), ("uid", "42")]);
        complete_problem_data(&mut data, 0);
        assert_eq!(data["type"], ElementValue::from("Python"));
        assert_eq!(data["uuid"], ElementValue::from("abc"));
        assert_eq!(data["uid"], ElementValue::from("42"));
    }

    #[test]
    fn uuid_depends_on_values() {
        let mut a = info(&[("reason", "one")]);
        let mut b = info(&[("reason", "two")]);
        complete_problem_data(&mut a, 1000);
        complete_problem_data(&mut b, 1000);
        assert_ne!(a["uuid"], b["uuid"]);
    }

    #[test]
    fn saves_problem_directory() {
        let root = tempdir().unwrap();
        let settings = settings(root.path());

        let path = save_problem(
            &settings,
            info(&[("type", "bugs/gui"), ("reason", "it broke")]),
            Vec::new(),
            1000,
        )
        .unwrap();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("bugs_gui-"));
        assert!(!name.ends_with(STAGING_SUFFIX));

        let dd = DumpDir::open(&path, OpenFlags::READ_ONLY).unwrap();
        assert_eq!(dd.load_text("reason", LoadFlags::empty()).unwrap(), "it broke");
        assert_eq!(dd.load_u32("uid").unwrap(), 1000);
        assert_eq!(dd.load_text("analyzer", LoadFlags::empty()).unwrap(), "libreport");
        assert!(dd.exists("time"));
        assert!(dd.exists("hostname"));
    }

    #[test]
    fn rejected_data_leaves_nothing() {
        let root = tempdir().unwrap();
        let settings = settings(root.path());

        let err = save_problem(&settings, info(&[("type", "CCpp")]), Vec::new(), 1000).unwrap_err();
        assert!(matches!(err, ProblemError::InvalidArgs(_)));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn names_are_unique() {
        assert_ne!(problem_dir_name("a"), problem_dir_name("a"));
    }
}
