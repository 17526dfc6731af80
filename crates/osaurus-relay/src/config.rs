//! Relay configuration
//!
//! Everything comes from flags or the environment; the relay keeps no state
//! across restarts.

use clap::Parser;

/// Public relay for osaurus agent tunnels
#[derive(Parser, Debug, Clone)]
#[command(name = "osaurus-relay")]
#[command(about = "Relay inbound HTTP to agents over persistent tunnels")]
pub struct Config {
    /// Listen port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// DNS suffix under which per-address subdomains are served
    #[arg(long, env = "BASE_DOMAIN", default_value = "agent.osaurus.ai")]
    pub base_domain: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}
