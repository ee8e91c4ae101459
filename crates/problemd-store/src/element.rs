//! Element names and content classification

use problemd_api::ElementFlags;
use std::io::Read;
use std::path::Path;

/// Well-known element names
pub mod names {
    pub const TIME: &str = "time";
    pub const LAST_OCCURRENCE: &str = "last_occurrence";
    pub const UID: &str = "uid";
    pub const USERNAME: &str = "username";
    pub const HOSTNAME: &str = "hostname";
    pub const KERNEL: &str = "kernel";
    pub const ARCHITECTURE: &str = "architecture";
    pub const OS_RELEASE: &str = "os_release";
    pub const ANALYZER: &str = "analyzer";
    pub const TYPE: &str = "type";
    pub const BASENAME: &str = "basename";
    pub const EXECUTABLE: &str = "executable";
    pub const CMDLINE: &str = "cmdline";
    pub const COMPONENT: &str = "component";
    pub const PACKAGE: &str = "package";
    pub const PKG_EPOCH: &str = "pkg_epoch";
    pub const PKG_NAME: &str = "pkg_name";
    pub const PKG_VERSION: &str = "pkg_version";
    pub const PKG_RELEASE: &str = "pkg_release";
    pub const UUID: &str = "uuid";
    pub const DUPHASH: &str = "duphash";
    pub const REASON: &str = "reason";
    pub const NOT_REPORTABLE: &str = "not-reportable";
    pub const COUNT: &str = "count";
    pub const REPORTED_TO: &str = "reported_to";
    pub const REMOTE: &str = "remote";
    pub const COMMENT: &str = "comment";
    pub const BACKTRACE: &str = "backtrace";
    /// Legacy alias of `os_release`
    pub const RELEASE: &str = "release";
}

/// Largest element still classified as plain text
pub const TEXT_MAX_SIZE: u64 = 8 * 1024;

/// Largest element classified as big text; anything larger is binary
pub const BIG_TEXT_MAX_SIZE: u64 = 20 * 1024 * 1024;

/// Bytes inspected by the text heuristic
const TEXT_SAMPLE_SIZE: usize = 64 * 1024;

const MAX_NAME_LEN: usize = 64;

/// Elements users may edit after the problem was created
const EDITABLE: &[&str] = &[names::COMMENT, names::BACKTRACE];

/// Elements that are text no matter what the heuristic says
const ALWAYS_TEXT: &[&str] = &[names::CMDLINE, names::BACKTRACE];

/// Elements holding one value per line
const LIST: &[&str] = &[
    names::UID,
    names::PACKAGE,
    names::EXECUTABLE,
    names::TIME,
    names::COUNT,
];

/// Whether `name` can be used as an element file name
///
/// Rejects empty names, names starting with `.`, names containing `/` or
/// control characters, and names longer than 64 bytes.
pub fn is_correct_element_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.starts_with('.') {
        return false;
    }
    !name.bytes().any(|b| b == b'/' || b < b' ' || b == 0x7f)
}

/// Legacy names are read from their current file
pub fn canonical_name(name: &str) -> &str {
    if name == names::RELEASE {
        names::OS_RELEASE
    } else {
        name
    }
}

pub fn is_editable(name: &str) -> bool {
    EDITABLE.contains(&name)
}

pub fn is_always_text(name: &str) -> bool {
    ALWAYS_TEXT.contains(&name)
}

/// Heuristic text detection
///
/// Data containing NUL is binary. Otherwise it is text unless more than
/// about 2% of the bytes are DEL/high bytes or non-whitespace control bytes.
pub fn is_text_data(data: &[u8]) -> bool {
    if data.contains(&0) {
        return false;
    }

    let mut bad = 1usize;
    for &b in data {
        if b >= 0x7f || (b < b' ' && !b.is_ascii_whitespace() && b != 0x0b) {
            bad += 1;
        }
    }

    (data.len() + 50) / bad >= 50
}

/// Classify the element stored at `path`
///
/// Returns the type flags (text, big text or binary) combined with the
/// editability and presentation flags derived from the name.
pub fn classify(name: &str, path: &Path) -> std::io::Result<ElementFlags> {
    let size = std::fs::metadata(path)?.len();

    let text = if is_always_text(name) {
        true
    } else if size > BIG_TEXT_MAX_SIZE {
        false
    } else {
        let mut sample = Vec::with_capacity(TEXT_SAMPLE_SIZE.min(size as usize));
        std::fs::File::open(path)?
            .take(TEXT_SAMPLE_SIZE as u64)
            .read_to_end(&mut sample)?;
        is_text_data(&sample)
    };

    let mut flags = if !text {
        ElementFlags::BINARY
    } else if size > TEXT_MAX_SIZE {
        ElementFlags::BIG_TEXT
    } else {
        ElementFlags::TEXT
    };

    flags |= if is_editable(name) {
        ElementFlags::EDITABLE
    } else {
        ElementFlags::NOT_EDITABLE
    };

    if LIST.contains(&name) {
        flags |= ElementFlags::LIST;
    }
    if name == names::TIME {
        flags |= ElementFlags::UNIX_TIME;
    }

    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn element_names() {
        assert!(is_correct_element_name("backtrace"));
        assert!(is_correct_element_name("core_backtrace"));
        assert!(!is_correct_element_name(""));
        assert!(!is_correct_element_name(".lock"));
        assert!(!is_correct_element_name("../etc/passwd"));
        assert!(!is_correct_element_name("a/b"));
        assert!(!is_correct_element_name("tab\there"));
        assert!(!is_correct_element_name(&"x".repeat(65)));
    }

    #[test]
    fn text_heuristic() {
        assert!(is_text_data(b"Segmentation fault\n"));
        assert!(is_text_data(b""));
        assert!(!is_text_data(b"ELF\0\x01\x02"));
        // One odd byte in a long line is still text
        let mut mostly_text = vec![b'a'; 200];
        mostly_text[10] = 0x1b;
        assert!(is_text_data(&mostly_text));
        assert!(!is_text_data(&[0x80; 10]));
    }

    #[test]
    fn classify_by_content_and_name() {
        let dir = tempdir().unwrap();

        let time = dir.path().join("time");
        std::fs::write(&time, "1700000000").unwrap();
        let flags = classify("time", &time).unwrap();
        assert!(flags.contains(ElementFlags::TEXT | ElementFlags::LIST | ElementFlags::UNIX_TIME));
        assert!(flags.contains(ElementFlags::NOT_EDITABLE));

        let core = dir.path().join("coredump");
        std::fs::write(&core, b"\x7fELF\0\0\0").unwrap();
        assert!(classify("coredump", &core).unwrap().contains(ElementFlags::BINARY));

        let bt = dir.path().join("backtrace");
        std::fs::write(&bt, "#0 main ()\n".repeat(1000)).unwrap();
        let flags = classify("backtrace", &bt).unwrap();
        assert!(flags.contains(ElementFlags::BIG_TEXT | ElementFlags::EDITABLE));
    }

    #[test]
    fn release_is_an_alias() {
        assert_eq!(canonical_name("release"), "os_release");
        assert_eq!(canonical_name("reason"), "reason");
    }
}
