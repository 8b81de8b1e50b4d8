//! Notices: deduplicated, repeat-and-expire pub/sub records (spec §4.4).

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// The category of a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoticeKind {
    /// Recorded automatically whenever a change's status changes.
    Change,
    /// Recorded automatically for warnings (e.g. a service repeatedly
    /// failing its okay-delay window).
    Warning,
    /// Recorded by callers for anything else.
    Custom,
}

/// A deduplicated record of a repeated event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    /// This notice's id, unique for the lifetime of the state tree.
    pub id: u64,
    /// This notice's kind.
    pub kind: NoticeKind,
    /// This notice's key, unique within `kind`. At most 255 bytes.
    pub key: String,
    /// When this notice was first recorded.
    pub first_occurred: SystemTime,
    /// When this notice was most recently recorded (every occurrence,
    /// whether or not it triggered a repeat).
    pub last_occurred: SystemTime,
    /// When this notice was last actually repeated to waiters.
    pub last_repeated: SystemTime,
    /// Total number of times this notice has been recorded.
    pub occurrences: u64,
    /// The data attached to the most recent occurrence.
    pub last_data: HashMap<String, String>,
    /// Minimum interval between repeats.
    pub repeat_after: Duration,
    /// How long after `last_repeated` this notice is eligible for pruning.
    pub expire_after: Duration,
}

/// A filter over notices, used by both `notices()` and `wait_notices()`.
#[derive(Debug, Clone, Default)]
pub struct NoticeFilter {
    /// Restrict to this kind, if set.
    pub kind: Option<NoticeKind>,
    /// Restrict to this key, if set.
    pub key: Option<String>,
    /// Restrict to notices last repeated after this time, if set.
    pub after: Option<SystemTime>,
}

impl NoticeFilter {
    /// Returns whether `notice` satisfies this filter.
    pub fn matches(&self, notice: &Notice) -> bool {
        if let Some(kind) = self.kind {
            if notice.kind != kind {
                return false;
            }
        }
        if let Some(key) = &self.key {
            if &notice.key != key {
                return false;
            }
        }
        if let Some(after) = self.after {
            if notice.last_repeated <= after {
                return false;
            }
        }
        true
    }
}
