// Build-time package identity, reported on /version and sent as the upstream User-Agent.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const NAME: &str = env!("CARGO_PKG_NAME");

/// `fleetwatch/<version>`.
pub fn user_agent() -> String {
    format!("{}/{}", NAME, VERSION)
}
