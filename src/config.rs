//! Engine Configuration
//!
//! Every field can be set by flag or environment variable; the defaults
//! target a Docker deployment talking to plex.tv.

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// plex.tv API base
pub const DEFAULT_PROVIDER_URL: &str = "https://plex.tv";

/// Browser page that approves a PIN
pub const DEFAULT_AUTH_APP_URL: &str = "https://app.plex.tv/auth";

/// Hostname that reaches the Docker host from inside a container
pub const DEFAULT_BRIDGE_HOST: &str = "host.docker.internal";

/// Plex Media Server default port
pub const PLEX_DEFAULT_PORT: u16 = 32400;

/// Timeouts for a class of outbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub total: Duration,
}

/// plex.tv calls: 6s connect, 12s total
pub const PROVIDER_TIMEOUTS: Timeouts = Timeouts {
    connect: Duration::from_secs(6),
    total: Duration::from_secs(12),
};

/// Media server `/identity` probes: 4s connect, 8s total
pub const LIVENESS_TIMEOUTS: Timeouts = Timeouts {
    connect: Duration::from_secs(4),
    total: Duration::from_secs(8),
};

/// Runtime configuration for the resolution engine
#[derive(Debug, Clone, Args)]
pub struct EngineConfig {
    /// plex.tv API base URL
    #[arg(long, env = "PLEX_PROVIDER_URL", default_value = DEFAULT_PROVIDER_URL)]
    pub provider_url: String,

    /// PIN approval page
    #[arg(long, env = "PLEX_AUTH_APP_URL", default_value = DEFAULT_AUTH_APP_URL)]
    pub auth_app_url: String,

    /// .env file holding the resolved credential
    #[arg(long, env = "PLEX_ENV_FILE", default_value = ".env")]
    pub env_file: PathBuf,

    /// JSON-lines audit log
    #[arg(long, env = "PLEX_AUDIT_LOG", default_value = "logs/plex_auth.log")]
    pub audit_log: PathBuf,

    /// Host substituted for localhost when probing from a container
    #[arg(long, env = "PLEX_BRIDGE_HOST", default_value = DEFAULT_BRIDGE_HOST)]
    pub bridge_host: String,

    /// Product name announced to plex.tv
    #[arg(long, env = "PLEX_PRODUCT", default_value = "Plex Toolbox")]
    pub product: String,

    /// Idle session lifetime in seconds
    #[arg(long = "session-ttl", env = "PLEX_SESSION_TTL", default_value = "1800")]
    pub session_ttl_secs: u64,

    /// Directory holding the external collaborator scripts
    #[arg(long, env = "PLEX_SCRIPTS_DIR", default_value = "scripts")]
    pub scripts_dir: PathBuf,

    /// Interpreter used to run the scripts
    #[arg(long, env = "PYTHON_EXEC", default_value = "/usr/local/bin/python3")]
    pub interpreter: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_url: DEFAULT_PROVIDER_URL.to_string(),
            auth_app_url: DEFAULT_AUTH_APP_URL.to_string(),
            env_file: PathBuf::from(".env"),
            audit_log: PathBuf::from("logs/plex_auth.log"),
            bridge_host: DEFAULT_BRIDGE_HOST.to_string(),
            product: "Plex Toolbox".to_string(),
            session_ttl_secs: 1800,
            scripts_dir: PathBuf::from("scripts"),
            interpreter: PathBuf::from("/usr/local/bin/python3"),
        }
    }
}

impl EngineConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Client identity announced on every plex.tv call
    pub fn client_identity(&self) -> ClientIdentity {
        ClientIdentity {
            product: self.product.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            device: "Web".to_string(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Fixed `X-Plex-*` identity fields (the client id is per session)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub product: String,
    pub version: String,
    pub device: String,
    pub platform: String,
}
