//! Rule selection against a problem directory

use problemd_store::{DumpDir, LoadFlags, OpenFlags};
use regex::Regex;
use std::collections::VecDeque;
use std::path::Path;
use tracing::{error, trace};

use crate::{Condition, EventRule};

/// A rule whose conditions all held
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedCommand {
    pub command: String,
    /// Value of the rule's `EVENT=` condition, if it had one
    pub event: Option<String>,
}

/// Remove rules from the front of `rules` until one matches, and return it
///
/// `EVENT=` conditions match when their value starts with `event_prefix`.
/// Element conditions open the problem directory on first use and keep it
/// in `dd`; without a directory they are assumed to hold. If the directory
/// cannot be opened every remaining rule is dropped.
pub fn pop_next_command(
    rules: &mut VecDeque<EventRule>,
    event_prefix: &str,
    dd: &mut Option<DumpDir>,
    dir: Option<&Path>,
) -> Option<MatchedCommand> {
    pop_matching(rules, |name| name.starts_with(event_prefix), dd, dir)
}

/// Like [`pop_next_command`], but `EVENT=` must equal `event` exactly
pub fn pop_command_for_event(
    rules: &mut VecDeque<EventRule>,
    event: &str,
    dd: &mut Option<DumpDir>,
    dir: Option<&Path>,
) -> Option<MatchedCommand> {
    pop_matching(rules, |name| name == event, dd, dir)
}

fn pop_matching(
    rules: &mut VecDeque<EventRule>,
    event_matches: impl Fn(&str) -> bool,
    dd: &mut Option<DumpDir>,
    dir: Option<&Path>,
) -> Option<MatchedCommand> {
    while let Some(rule) = rules.pop_front() {
        let mut event = None;
        let mut matched = true;

        for condition in &rule.conditions {
            let holds = match condition {
                Condition::Event(name) => {
                    if event_matches(name) {
                        event = Some(name.clone());
                        true
                    } else {
                        false
                    }
                }
                Condition::Equals { name, value } => match element_text(dd, dir, name) {
                    Lookup::Assumed => true,
                    Lookup::Value(actual) => actual == *value,
                    Lookup::Failed => {
                        rules.clear();
                        return None;
                    }
                },
                Condition::Matches { name, pattern } => match element_text(dd, dir, name) {
                    Lookup::Assumed => true,
                    Lookup::Value(actual) => matches_any_line(&actual, pattern),
                    Lookup::Failed => {
                        rules.clear();
                        return None;
                    }
                },
            };

            if !holds {
                trace!(command = %rule.command, "Rule skipped");
                matched = false;
                break;
            }
        }

        if matched {
            return Some(MatchedCommand {
                command: rule.command,
                event,
            });
        }
    }

    None
}

enum Lookup {
    /// No directory to match against
    Assumed,
    Value(String),
    Failed,
}

fn element_text(dd: &mut Option<DumpDir>, dir: Option<&Path>, name: &str) -> Lookup {
    if dd.is_none() {
        let Some(dir) = dir else {
            return Lookup::Assumed;
        };
        match DumpDir::open(dir, OpenFlags::empty()) {
            Ok(opened) => *dd = Some(opened),
            Err(_) => return Lookup::Failed,
        }
    }

    match dd {
        Some(opened) => Lookup::Value(
            opened
                .load_text(name, LoadFlags::FAIL_QUIETLY_ENOENT)
                .unwrap_or_default(),
        ),
        None => Lookup::Failed,
    }
}

fn matches_any_line(content: &str, pattern: &str) -> bool {
    let regex = match Regex::new(pattern) {
        Ok(r) => r,
        Err(e) => {
            error!(pattern, error = %e, "Bad regexp");
            return false;
        }
    };
    content.split('\n').any(|line| regex.is_match(line))
}

/// Events whose name starts with `prefix` that have a matching rule
///
/// The result is deduplicated and keeps the order of first appearance.
pub fn list_possible_events(
    rules: Vec<EventRule>,
    dd: &mut Option<DumpDir>,
    dir: Option<&Path>,
    prefix: &str,
) -> Vec<String> {
    let mut rules: VecDeque<EventRule> = rules.into();
    let mut events: Vec<String> = Vec::new();

    while let Some(matched) = pop_next_command(&mut rules, prefix, dd, dir) {
        if let Some(event) = matched.event
            && !events.contains(&event)
        {
            events.push(event);
        }
    }

    events
}
