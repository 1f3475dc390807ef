//! Priority ladder and its mapping onto host scheduling values.
//!
//! The host backend expresses priority as a per-thread nice value
//! (`setpriority(PRIO_PROCESS, tid, nice)` on Linux), where lower numbers
//! mean more CPU. Raising a thread above nice 0 normally needs
//! `CAP_SYS_NICE`; unprivileged callers get `EACCES`.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Number of levels in the ladder.
pub const PRIORITY_LEVELS: usize = 5;

/// Nice value for [`ThreadPriority::Lowest`].
pub const NICE_LOWEST: i32 = 19;
/// Nice value for [`ThreadPriority::Low`].
pub const NICE_BELOW_NORMAL: i32 = 10;
/// Nice value for [`ThreadPriority::Normal`].
pub const NICE_NORMAL: i32 = 0;
/// Nice value for [`ThreadPriority::High`].
pub const NICE_ABOVE_NORMAL: i32 = -10;
/// Nice value for [`ThreadPriority::Highest`].
pub const NICE_HIGHEST: i32 = -20;

/// Coarse scheduling hint, ordered from least to most CPU.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum ThreadPriority {
    Lowest = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Highest = 4,
}

impl ThreadPriority {
    /// All levels, lowest first.
    pub const ALL: [Self; PRIORITY_LEVELS] = [
        Self::Lowest,
        Self::Low,
        Self::Normal,
        Self::High,
        Self::Highest,
    ];

    /// Exact conversion from the raw enum value used at the C boundary.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Lowest),
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Highest),
            _ => None,
        }
    }

    /// Lenient conversion: out-of-range values become `Normal` and a warning
    /// is logged. The caller proceeds with the coerced level.
    #[must_use]
    pub fn coerce(raw: i32) -> Self {
        Self::from_raw(raw).unwrap_or_else(|| {
            warn!(requested = raw, "thread priority out of range; using NORMAL");
            Self::Normal
        })
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Host value for each of the five levels.
///
/// Populated once from the runtime configuration and only read afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriorityMap {
    native: [i32; PRIORITY_LEVELS],
}

impl PriorityMap {
    /// Default ladder for the nice-value backend.
    pub const HOST: Self = Self {
        native: [
            NICE_LOWEST,
            NICE_BELOW_NORMAL,
            NICE_NORMAL,
            NICE_ABOVE_NORMAL,
            NICE_HIGHEST,
        ],
    };

    /// Custom ladder, indexed `Lowest..=Highest`.
    #[must_use]
    pub const fn new(native: [i32; PRIORITY_LEVELS]) -> Self {
        Self { native }
    }

    /// Host value for `prio`.
    #[must_use]
    pub const fn native(&self, prio: ThreadPriority) -> i32 {
        self.native[prio.index()]
    }
}

impl Default for PriorityMap {
    fn default() -> Self {
        Self::HOST
    }
}
