//! Parsing of the `reported_to` element
//!
//! Each line records one report: `Label: URL=... BTHASH=... MSG=...`.
//! `MSG=` takes the rest of the line.

use problemd_api::ReportInfo;

/// Parse one `reported_to` line; returns `None` for lines without a label
pub fn parse_reported_line(line: &str) -> Option<ReportInfo> {
    let (label, rest) = match line.split_once(':') {
        Some((label, rest)) => (label.trim(), rest),
        None => (line.trim(), ""),
    };
    if label.is_empty() {
        return None;
    }

    let mut report = ReportInfo {
        label: label.to_string(),
        ..Default::default()
    };

    let mut rest = rest.trim_start();
    while !rest.is_empty() {
        if let Some(msg) = rest.strip_prefix("MSG=") {
            report.msg = Some(msg.to_string());
            break;
        }

        let (word, tail) = rest.split_once(' ').unwrap_or((rest, ""));
        if let Some(url) = word.strip_prefix("URL=") {
            report.url = Some(url.to_string());
        } else if let Some(bthash) = word.strip_prefix("BTHASH=") {
            report.bthash = Some(bthash.to_string());
        }
        rest = tail.trim_start();
    }

    Some(report)
}

/// Parse the whole `reported_to` content, skipping malformed lines
pub fn parse_reported_to(content: &str) -> Vec<ReportInfo> {
    content.lines().filter_map(parse_reported_line).collect()
}

/// Content with `line` appended, or `None` when an identical line exists
pub(crate) fn append_reported_line(existing: Option<&str>, line: &str) -> Option<String> {
    let Some(existing) = existing else {
        return Some(format!("{}\n", line));
    };

    if existing.lines().any(|l| l == line) {
        return None;
    }

    let mut content = existing.to_string();
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');
    Some(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_line() {
        let report = parse_reported_line(
            "Bugzilla: URL=https://bugzilla.example.org/show_bug.cgi?id=1 BTHASH=abc MSG=Thanks for the report",
        )
        .unwrap();

        assert_eq!(report.label, "Bugzilla");
        assert_eq!(report.url.as_deref(), Some("https://bugzilla.example.org/show_bug.cgi?id=1"));
        assert_eq!(report.bthash.as_deref(), Some("abc"));
        assert_eq!(report.msg.as_deref(), Some("Thanks for the report"));
    }

    #[test]
    fn label_only_and_garbage() {
        let reports = parse_reported_to("uReport: BTHASH=123\n\n: URL=x\nkerneloops\n");
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].label, "uReport");
        assert_eq!(reports[0].url, None);
        assert_eq!(reports[1].label, "kerneloops");
    }

    #[test]
    fn append_only_new_lines() {
        assert_eq!(append_reported_line(None, "A: URL=x").as_deref(), Some("A: URL=x\n"));
        assert_eq!(append_reported_line(Some("A: URL=x\n"), "A: URL=x"), None);
        assert_eq!(
            append_reported_line(Some("A: URL=x"), "B: URL=y").as_deref(),
            Some("A: URL=x\nB: URL=y\n")
        );
    }
}
