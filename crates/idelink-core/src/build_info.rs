//! What was built, from where, for which target. Reported by
//! `idelink version` and logged when a daemon is spawned.

use std::fmt;

use serde::Serialize;

use crate::codec::MAX_FRAME_LEN;

/// Build metadata embedded by the build script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    /// Short commit hash, suffixed with `-dirty` for uncommitted changes.
    pub git_hash: &'static str,
    pub profile: &'static str,
    pub target: &'static str,
    /// Largest daemon frame this build accepts, in bytes.
    pub max_frame_len: usize,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("IDELINK_GIT_HASH"),
            profile: env!("IDELINK_BUILD_PROFILE"),
            target: env!("IDELINK_TARGET"),
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl fmt::Display for BuildInfo {
    /// `0.1.0 (abc1234, debug, x86_64-unknown-linux-gnu)`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}, {})",
            self.version, self.git_hash, self.profile, self.target
        )
    }
}
