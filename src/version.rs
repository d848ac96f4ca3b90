//! Build metadata embedded by `build.rs`

use std::fmt;

use crate::protocol::{MAX_FRAMES, MAX_FRAME_SIZE};

/// Build metadata for the running binary
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    /// Short commit hash, `unknown` outside a git checkout
    pub git_hash: &'static str,
    pub git_branch: &'static str,
    git_dirty: &'static str,
    pub build_timestamp: &'static str,
    pub target: &'static str,
    pub host: &'static str,
    pub profile: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("SWITCHYARD_GIT_HASH"),
            git_branch: env!("SWITCHYARD_GIT_BRANCH"),
            git_dirty: env!("SWITCHYARD_GIT_DIRTY"),
            build_timestamp: env!("SWITCHYARD_BUILD_TIMESTAMP"),
            target: env!("SWITCHYARD_TARGET"),
            host: env!("SWITCHYARD_HOST"),
            profile: env!("SWITCHYARD_PROFILE"),
            rustc_version: env!("SWITCHYARD_RUSTC_VERSION"),
        }
    }

    pub fn git_dirty(&self) -> bool {
        self.git_dirty == "true"
    }

    /// `0.1.0-abc1234`, with `-dirty` appended for modified trees
    pub fn full_version(&self) -> String {
        let dirty = if self.git_dirty() { "-dirty" } else { "" };
        format!("{}-{}{}", self.version, self.git_hash, dirty)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "Build:")?;
        writeln!(f, "  Commit:   {} ({})", self.git_hash, self.git_branch)?;
        writeln!(f, "  Built:    {}", self.build_timestamp)?;
        writeln!(f, "  Profile:  {}", self.profile)?;
        writeln!(f, "  Target:   {}", self.target)?;
        writeln!(f, "  Host:     {}", self.host)?;
        writeln!(f, "  Compiler: {}", self.rustc_version)?;
        writeln!(f)?;
        writeln!(f, "Wire:")?;
        writeln!(f, "  Framing:  u32 BE frame count, u32 BE length per frame")?;
        writeln!(
            f,
            "  Limits:   {} frames, {} MiB per frame",
            MAX_FRAMES,
            MAX_FRAME_SIZE / (1024 * 1024)
        )?;
        writeln!(f, "  Payloads: JSON")?;
        Ok(())
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

pub fn print_version() {
    print!("{}", build_info());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_version_carries_hash() {
        let info = build_info();
        let full = info.full_version();
        assert!(full.starts_with(info.version));
        assert!(full.contains(info.git_hash));
        assert_eq!(full.ends_with("-dirty"), info.git_dirty());
    }

    #[test]
    fn test_display_lists_wire_limits() {
        let display = build_info().to_string();
        assert!(display.starts_with("switchyard "));
        assert!(display.contains("Commit:"));
        assert!(display.contains("64 frames, 64 MiB per frame"));
    }
}
