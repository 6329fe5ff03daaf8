pub mod serial;
pub mod device;
pub mod commands;
pub mod update;
pub mod config;

use semver::Version;

pub use config::AgentConfig;
pub use device::DeviceManager;

pub const VERSION_MAJOR: u64 = 0;
pub const VERSION_MINOR: u64 = 1;
pub const VERSION_PATCH: u64 = 8;

/// Version reported to clients of the agent
pub fn agent_version() -> Version {
    Version::new(VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_version_matches_package() {
        assert_eq!(agent_version().to_string(), env!("CARGO_PKG_VERSION"));
    }
}
