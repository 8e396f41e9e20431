//! Core identifier and status types for usenet-engine

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Create a new identifier
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            /// Get the inner u64 value
            pub fn get(&self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

id_type!(
    /// Unique identifier for a configured account
    AccountId
);
id_type!(
    /// Unique identifier for a download task
    TaskId
);
id_type!(
    /// Unique identifier for a batch of tasks
    BatchId
);
id_type!(
    /// Unique identifier for a live connection
    ConnectionId
);
id_type!(
    /// Identifier of a command list handed to a connection
    CmdListId
);

/// Accumulated error flags of a task
///
/// Flags only ever accumulate. A task with some flags set may still complete
/// and produce output; only a task where every article failed produces none.
///
/// # Examples
///
/// ```
/// use usenet_engine::types::TaskErrors;
///
/// let mut errors = TaskErrors::empty();
/// errors.insert(TaskErrors::UNAVAILABLE);
/// errors.insert(TaskErrors::DAMAGED);
/// assert!(errors.contains(TaskErrors::UNAVAILABLE));
/// assert!(!errors.contains(TaskErrors::DMCA));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskErrors(u8);

impl TaskErrors {
    /// Decoded content failed an integrity check
    pub const DAMAGED: Self = Self(1);
    /// One or more articles were not available on the server
    pub const UNAVAILABLE: Self = Self(1 << 1);
    /// One or more articles were taken down
    pub const DMCA: Self = Self(1 << 2);
    /// Processing failed for another reason (I/O, panic)
    pub const OTHER: Self = Self(1 << 3);

    /// No errors
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bit representation
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Rebuild from raw bits, dropping unknown bits
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0b1111)
    }

    /// True when no flag is set
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True when every flag in `other` is set
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Set every flag in `other`
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for TaskErrors {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for TaskErrors {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Display for TaskErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (Self::DAMAGED, "damaged"),
            (Self::UNAVAILABLE, "unavailable"),
            (Self::DMCA, "dmca"),
            (Self::OTHER, "other"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// Final outcome of a downloaded file, reported to the listener
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Every article was fetched and decoded
    Success,
    /// Some content is missing or failed to decode
    Damaged,
    /// None of the articles were available
    Unavailable,
    /// Content was removed by a takedown notice
    Dmca,
    /// Processing failed
    Error,
}

impl FileStatus {
    /// Derive the file outcome from a task's error flags
    ///
    /// `received_content` is false when not a single article body arrived.
    pub fn from_errors(errors: TaskErrors, received_content: bool) -> Self {
        if errors.contains(TaskErrors::OTHER) {
            FileStatus::Error
        } else if !received_content && errors.contains(TaskErrors::DMCA) {
            FileStatus::Dmca
        } else if !received_content {
            FileStatus::Unavailable
        } else if errors.is_empty() {
            FileStatus::Success
        } else {
            FileStatus::Damaged
        }
    }
}

/// Status of one article body as classified from the server reply
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    /// Body was received
    Success,
    /// Article does not exist (420/423/430/451 or no group carried it)
    Unavailable,
    /// Article was removed by a takedown notice
    Dmca,
}
