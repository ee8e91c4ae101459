//! Rule file parsing
//!
//! A rule is `[VAR=VALUE | VAR~=REGEX]... COMMAND`. A physical line starting
//! with a blank continues the previous one. `include GLOB` loads other rule
//! files in place, relative to the including file unless GLOB is absolute.

use std::path::Path;
use tracing::{debug, warn};

/// Includes nested deeper than this are ignored
pub const MAX_INCLUDE_DEPTH: u32 = 32;

/// One condition of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// `EVENT=name`, matched as a prefix
    Event(String),
    /// `VAR=value`, exact match against the element
    Equals { name: String, value: String },
    /// `VAR~=regex`, matched against every line of the element
    Matches { name: String, pattern: String },
}

impl Condition {
    /// Parse a word containing `=`
    pub fn parse(word: &str) -> Option<Self> {
        let (lhs, rhs) = word.split_once('=')?;
        if lhs == "EVENT" {
            return Some(Condition::Event(rhs.to_string()));
        }
        match lhs.strip_suffix('~') {
            Some(name) => Some(Condition::Matches {
                name: name.to_string(),
                pattern: rhs.to_string(),
            }),
            None => Some(Condition::Equals {
                name: lhs.to_string(),
                value: rhs.to_string(),
            }),
        }
    }
}

/// Conditions plus the shell command run when they all hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRule {
    pub conditions: Vec<Condition>,
    pub command: String,
}

impl EventRule {
    /// Parse one logical rule line
    ///
    /// Leading words containing `=` are conditions; the rest is the command.
    pub fn parse(line: &str) -> Self {
        let mut conditions = Vec::new();
        let mut rest = line.trim_start();

        loop {
            let word_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let word = &rest[..word_end];
            if word.is_empty() || !word.contains('=') {
                break;
            }
            if let Some(cond) = Condition::parse(word) {
                conditions.push(cond);
            }
            rest = rest[word_end..].trim_start();
        }

        Self {
            conditions,
            command: rest.to_string(),
        }
    }
}

/// Load every rule reachable from `path`
///
/// Unreadable files are logged and contribute no rules.
pub fn load_rule_list(path: &Path) -> Vec<EventRule> {
    let mut rules = Vec::new();
    load_rules_into(&mut rules, path, 0);
    rules
}

fn load_rules_into(rules: &mut Vec<EventRule>, path: &Path, depth: u32) {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Can't open rule file");
            return;
        }
    };

    for line in logical_lines(&content) {
        let p = line.trim_start();
        if p.is_empty() || p.starts_with('#') {
            continue;
        }

        if let Some(pattern) = include_pattern(p) {
            if depth < MAX_INCLUDE_DEPTH {
                for included in expand_include(path, pattern) {
                    debug!(file = %included.display(), depth = depth + 1, "Including rule file");
                    load_rules_into(rules, &included, depth + 1);
                }
                continue;
            }
            warn!(file = %path.display(), pattern, "Include nested too deep, ignoring");
            continue;
        }

        let rule = EventRule::parse(p);
        debug!(command = %rule.command, "Adding rule");
        rules.push(rule);
    }
}

/// Join continuation lines (starting with space or tab) with `\n`
fn logical_lines(content: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for physical in content.lines() {
        let continues = physical.starts_with([' ', '\t']);
        match lines.last_mut() {
            Some(last) if continues => {
                last.push('\n');
                last.push_str(physical);
            }
            _ => lines.push(physical.to_string()),
        }
    }
    lines
}

fn include_pattern(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("include")?;
    if rest.starts_with([' ', '\t']) {
        Some(rest.trim())
    } else {
        None
    }
}

fn expand_include(including: &Path, pattern: &str) -> Vec<std::path::PathBuf> {
    let full = if pattern.starts_with('/') {
        pattern.to_string()
    } else {
        let text = including.to_string_lossy();
        match text.rfind('/') {
            Some(slash) => format!("{}{}", &text[..=slash], pattern),
            None => pattern.to_string(),
        }
    };

    match glob::glob(&full) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            warn!(pattern = %full, error = %e, "Bad include pattern");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn conditions_then_command() {
        let rule = EventRule::parse("EVENT=post-create component~=^kernel analyzer=CCpp  abrt-action-analyze --flag=x");
        assert_eq!(
            rule.conditions,
            vec![
                Condition::Event("post-create".into()),
                Condition::Matches {
                    name: "component".into(),
                    pattern: "^kernel".into()
                },
                Condition::Equals {
                    name: "analyzer".into(),
                    value: "CCpp".into()
                },
            ]
        );
        assert_eq!(rule.command, "abrt-action-analyze --flag=x");
    }

    #[test]
    fn continuation_and_comments() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("report_event.conf");
        std::fs::write(
            &file,
            "# comment\n\nEVENT=post-create\n    echo one\n\techo two\nEVENT=report echo three\n",
        )
        .unwrap();

        let rules = load_rule_list(&file);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].command, "echo one\n\techo two");
        assert_eq!(rules[1].command, "echo three");
    }

    #[test]
    fn relative_include() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("events.d")).unwrap();
        std::fs::write(dir.path().join("events.d/a.conf"), "EVENT=a echo a\n").unwrap();
        std::fs::write(dir.path().join("events.d/b.conf"), "EVENT=b echo b\n").unwrap();
        let top = dir.path().join("report_event.conf");
        std::fs::write(&top, "EVENT=first echo 0\ninclude events.d/*.conf\nincludeNOT=x echo\n").unwrap();

        let rules = load_rule_list(&top);
        let commands: Vec<_> = rules.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["echo 0", "echo a", "echo b", "echo"]);
    }

    #[test]
    fn self_include_stops_at_depth_limit() {
        let dir = tempdir().unwrap();
        let top = dir.path().join("loop.conf");
        std::fs::write(&top, "EVENT=x echo x\ninclude loop.conf\n").unwrap();

        let rules = load_rule_list(&top);
        assert_eq!(rules.len(), MAX_INCLUDE_DEPTH as usize + 1);
    }

    #[test]
    fn missing_file_yields_nothing() {
        assert!(load_rule_list(Path::new("/nonexistent/report_event.conf")).is_empty());
    }
}
