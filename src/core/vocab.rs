//! Closed value domains enforced on every call.
//!
//! Each domain is a plain enum with a stable lowercase wire name. Parsing an
//! unknown string is always a `ValidationError`; nothing is coerced.

use crate::core::error::MoltError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! vocabulary {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $($variant:ident => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl FromStr for $name {
            type Err = MoltError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(MoltError::ValidationError(format!(
                        "Invalid {} '{}'; must be one of: {}",
                        $label,
                        other,
                        [$($wire),+].join(", ")
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

vocabulary! {
    /// Lifecycle state of a context.
    Status, "status" {
        Active => "active",
        Paused => "paused",
        Completed => "completed",
        Abandoned => "abandoned",
    }
}

vocabulary! {
    SnapshotReason, "snapshot reason" {
        Auto => "auto",
        Manual => "manual",
        Handoff => "handoff",
        Milestone => "milestone",
    }
}

vocabulary! {
    ArchiveAction, "archive action" {
        Archive => "archive",
        Restore => "restore",
        Purge => "purge",
    }
}

vocabulary! {
    ExportFormat, "export format" {
        Json => "json",
        Markdown => "markdown",
        Text => "text",
    }
}

vocabulary! {
    CompressionLevel, "compression level" {
        None => "none",
        Low => "low",
        High => "high",
    }
}

vocabulary! {
    /// How `index sync` reconciles the search projection.
    SyncMode, "sync mode" {
        Incremental => "incremental",
        Full => "full",
    }
}

vocabulary! {
    QueryType, "query type" {
        Search => "search",
        Question => "question",
        Lookup => "lookup",
        Debug => "debug",
    }
}

vocabulary! {
    ApproachResult, "approach result" {
        Success => "success",
        Partial => "partial",
        Failure => "failure",
        Abandoned => "abandoned",
    }
}

vocabulary! {
    ActionType, "action type" {
        Edit => "edit",
        Build => "build",
        Test => "test",
        Run => "run",
        Search => "search",
        Review => "review",
        Deploy => "deploy",
        Other => "other",
    }
}

vocabulary! {
    ActionResult, "action result" {
        Success => "success",
        Failure => "failure",
        Partial => "partial",
    }
}

vocabulary! {
    /// Search breadth: top-level fields only, or nested history too.
    SearchScope, "search scope" {
        Top => "top",
        All => "all",
    }
}

vocabulary! {
    LimitPolicy, "limit policy" {
        Clamp => "clamp",
        Reject => "reject",
    }
}

impl Default for SearchScope {
    fn default() -> Self {
        SearchScope::Top
    }
}

impl Default for LimitPolicy {
    fn default() -> Self {
        LimitPolicy::Clamp
    }
}

impl CompressionLevel {
    /// zstd level for this setting; `None` means the bytes are left as-is.
    pub fn zstd_level(&self) -> Option<i32> {
        match self {
            CompressionLevel::None => None,
            CompressionLevel::Low => Some(3),
            CompressionLevel::High => Some(19),
        }
    }
}
