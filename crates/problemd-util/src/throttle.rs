//! Per-user accounting and the new-problem throttle

use std::collections::HashMap;
use tracing::{debug, error};

/// Accounting kept for every uid that ever talked to the service
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UserQuota {
    /// Currently open sessions
    pub sessions: u32,
    /// Registered problem entries owned by the user
    pub problems: u64,
    /// Remaining new-problem tokens
    pub new_problems: u32,
    /// Epoch seconds of the last granted token
    pub new_problem_last: u64,
}

/// Outcome of asking for a new-problem token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// A token was consumed; carries the budget before consumption
    Granted(u32),
    /// The bucket is empty, retry later
    TooMany,
    /// The user owns as many problems as allowed
    QuotaExceeded,
    /// The request cannot be evaluated (unknown user, clock skew)
    Error,
}

/// Leaky-bucket throttle over per-user quotas
///
/// A user may create `batch` problems in a row; afterwards one token is
/// added every `2^magnitude` seconds, never exceeding `batch`. Root is
/// exempt from all of it.
#[derive(Debug)]
pub struct UserQuotas {
    magnitude: u32,
    batch: u32,
    users: HashMap<u32, UserQuota>,
}

impl UserQuotas {
    /// Create the accounting table
    ///
    /// # Arguments
    /// * `magnitude` - tokens refill once per `2^magnitude` seconds
    /// * `batch` - maximum number of tokens a user can accumulate
    pub fn new(magnitude: u32, batch: u32) -> Self {
        Self {
            magnitude,
            batch,
            users: HashMap::new(),
        }
    }

    pub fn get(&self, uid: u32) -> Option<&UserQuota> {
        self.users.get(&uid)
    }

    /// Look up the user's record, creating an empty one if needed
    pub fn entry(&mut self, uid: u32) -> &mut UserQuota {
        self.users.entry(uid).or_default()
    }

    pub fn session_count(&self, uid: u32) -> u32 {
        self.users.get(&uid).map(|u| u.sessions).unwrap_or(0)
    }

    /// Decide whether `uid` may create a new problem at `now` (epoch seconds)
    ///
    /// `problems_limit` of 0 disables the hard limit.
    pub fn can_create_new_problem(
        &mut self,
        uid: u32,
        now: u64,
        problems_limit: u64,
    ) -> ThrottleDecision {
        if uid == 0 {
            return ThrottleDecision::Granted(1);
        }

        let magnitude = self.magnitude;
        let batch = self.batch;

        let Some(user) = self.users.get_mut(&uid) else {
            error!(uid, "User does not have a session");
            return ThrottleDecision::Error;
        };

        if problems_limit != 0 && user.problems >= problems_limit {
            return ThrottleDecision::QuotaExceeded;
        }

        if now < user.new_problem_last {
            error!(uid, "The last problem was created in the future");
            return ThrottleDecision::Error;
        }

        let off = now - user.new_problem_last;
        let incr = off.checked_shr(magnitude).unwrap_or(0);

        // The addition only happens when the increment alone fits the batch.
        if incr > u64::from(batch) {
            user.new_problems = batch;
        } else {
            user.new_problems += incr as u32;
            if user.new_problems > batch {
                user.new_problems = batch;
            }
        }

        debug!(
            uid,
            last = user.new_problem_last,
            current = now,
            increment = incr,
            remaining = user.new_problems,
            "New problem limit"
        );

        if user.new_problems == 0 {
            return ThrottleDecision::TooMany;
        }

        user.new_problem_last = now;
        let granted = user.new_problems;
        user.new_problems -= 1;
        ThrottleDecision::Granted(granted)
    }
}
