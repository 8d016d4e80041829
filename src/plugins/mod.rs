//! Context-store subsystems: repository, snapshots, search, patterns,
//! recommendations, archive/export and stats.

pub mod archive;
pub mod contexts;
pub mod patterns;
pub mod recommend;
pub mod search;
pub mod snapshot;
pub mod stats;
