//! Gateway configuration.
//!
//! Every setting is a command-line flag with a `DSMLGW_*` environment
//! fallback. [`GatewayArgs`] is flattened into the binary's arguments and
//! turned into a [`GatewayConfig`], which is validated before anything
//! connects.

use std::time::Duration;

use dsmlgw_core::{Constraints, GatewaySettings, PoolConfig};

use crate::error::ServerError;

/// Where and how to reach the directory.
#[derive(Clone, PartialEq, Eq)]
pub struct DirectoryConfig {
    /// Directory host name.
    pub host: String,
    /// Directory port.
    pub port: u16,
    /// Connect with `ldaps://`.
    pub use_tls: bool,
    /// Upgrade a plain connection with StartTLS.
    pub starttls: bool,
    /// Service identity bound on every new connection.
    pub bind_dn: Option<String>,
    /// Password of the service identity.
    pub bind_password: Option<String>,
    /// Bound on establishing a connection (and its service bind).
    pub connect_timeout: Duration,
    /// Bound on each directory operation.
    pub operation_timeout: Option<Duration>,
}

impl DirectoryConfig {
    /// Connection URL.
    pub fn url(&self) -> String {
        let scheme = if self.use_tls { "ldaps" } else { "ldap" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for DirectoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryConfig")
            .field("url", &self.url())
            .field("starttls", &self.starttls)
            .field("bind_dn", &self.bind_dn)
            .field(
                "bind_password",
                &self.bind_password.as_ref().map(|p| format!("<redacted {} bytes>", p.len())),
            )
            .field("connect_timeout", &self.connect_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 389,
            use_tls: false,
            starttls: false,
            bind_dn: None,
            bind_password: None,
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Directory endpoint.
    pub directory: DirectoryConfig,
    /// Pool running batch operations.
    pub operational_pool: PoolConfig,
    /// Pool checking caller credentials.
    pub login_pool: PoolConfig,
    /// Gateway behaviour.
    pub settings: GatewaySettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let directory = DirectoryConfig::default();
        let constraints = Constraints {
            operation_timeout: directory.operation_timeout,
            ..Constraints::default()
        };
        Self {
            operational_pool: PoolConfig {
                min: 2,
                max: 10,
                constraints: constraints.clone(),
                ..PoolConfig::default()
            },
            login_pool: PoolConfig { min: 1, max: 5, constraints, ..PoolConfig::default() },
            directory,
            settings: GatewaySettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), ServerError> {
        let dir = &self.directory;
        if dir.host.trim().is_empty() {
            return Err(ServerError::Config("directory host is empty".to_string()));
        }
        if dir.port == 0 {
            return Err(ServerError::Config("directory port must not be 0".to_string()));
        }
        if dir.use_tls && dir.starttls {
            return Err(ServerError::Config(
                "ldaps and StartTLS are mutually exclusive".to_string(),
            ));
        }
        if dir.bind_password.is_some() && dir.bind_dn.is_none() {
            return Err(ServerError::Config("bind password given without a bind DN".to_string()));
        }
        if dir.connect_timeout.is_zero() {
            return Err(ServerError::Config("connect timeout must be positive".to_string()));
        }

        validate_pool("operational", &self.operational_pool)?;
        validate_pool("login", &self.login_pool)?;

        let settings = &self.settings;
        if settings.user_search_base.as_deref().is_some_and(|b| b.trim().is_empty()) {
            return Err(ServerError::Config("user search base is empty".to_string()));
        }
        let attr = &settings.user_id_attribute;
        if attr.is_empty() || !attr.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ServerError::Config(format!("invalid user id attribute {attr:?}")));
        }
        Ok(())
    }
}

fn validate_pool(name: &str, pool: &PoolConfig) -> Result<(), ServerError> {
    if pool.max == 0 {
        return Err(ServerError::Config(format!("{name} pool max must be at least 1")));
    }
    if pool.min > pool.max {
        return Err(ServerError::Config(format!(
            "{name} pool min ({}) exceeds max ({})",
            pool.min, pool.max
        )));
    }
    if pool.acquire_timeout.is_zero() {
        return Err(ServerError::Config(format!("{name} pool acquire timeout must be positive")));
    }
    Ok(())
}

/// Configuration flags shared by every `dsmlgw` invocation.
#[derive(clap::Args, Debug, Clone)]
pub struct GatewayArgs {
    /// Directory host
    #[arg(long, env = "DSMLGW_LDAP_HOST", default_value = "localhost")]
    pub ldap_host: String,

    /// Directory port (default 389, or 636 with --ldaps)
    #[arg(long, env = "DSMLGW_LDAP_PORT")]
    pub ldap_port: Option<u16>,

    /// Connect with ldaps://
    #[arg(long, env = "DSMLGW_LDAPS")]
    pub ldaps: bool,

    /// Upgrade the connection with StartTLS
    #[arg(long, env = "DSMLGW_STARTTLS")]
    pub starttls: bool,

    /// Service identity bound on every pooled connection
    #[arg(long, env = "DSMLGW_BIND_DN")]
    pub bind_dn: Option<String>,

    /// Password of the service identity
    #[arg(long, env = "DSMLGW_BIND_PASSWORD", hide_env_values = true)]
    pub bind_password: Option<String>,

    /// Connect timeout in seconds
    #[arg(long, env = "DSMLGW_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// Per-operation timeout in seconds (0 disables it)
    #[arg(long, env = "DSMLGW_OPERATION_TIMEOUT", default_value = "30")]
    pub operation_timeout: u64,

    /// Connections opened up front on the operational pool
    #[arg(long, env = "DSMLGW_POOL_MIN", default_value = "2")]
    pub pool_min: usize,

    /// Upper bound on operational connections
    #[arg(long, env = "DSMLGW_POOL_MAX", default_value = "10")]
    pub pool_max: usize,

    /// Connections opened up front on the login pool
    #[arg(long, env = "DSMLGW_LOGIN_POOL_MIN", default_value = "1")]
    pub login_pool_min: usize,

    /// Upper bound on login connections
    #[arg(long, env = "DSMLGW_LOGIN_POOL_MAX", default_value = "5")]
    pub login_pool_max: usize,

    /// How long a request waits for a free connection, in milliseconds
    #[arg(long, env = "DSMLGW_ACQUIRE_TIMEOUT_MS", default_value = "5000")]
    pub acquire_timeout_ms: u64,

    /// Accept batches without credentials
    #[arg(long, env = "DSMLGW_ALLOW_ANONYMOUS")]
    pub allow_anonymous: bool,

    /// Assert the caller's identity with the proxied authorization control
    #[arg(long, env = "DSMLGW_PROXY_AUTHORIZATION")]
    pub proxy_authorization: bool,

    /// Base under which non-DN principals are looked up
    #[arg(long, env = "DSMLGW_USER_SEARCH_BASE")]
    pub user_search_base: Option<String>,

    /// Attribute holding user ids
    #[arg(long, env = "DSMLGW_USER_ID_ATTRIBUTE", default_value = "uid")]
    pub user_id_attribute: String,

    /// Size limit for searches that set none (0 = server default)
    #[arg(long, env = "DSMLGW_DEFAULT_SIZE_LIMIT", default_value = "0")]
    pub default_size_limit: u32,
}

impl GatewayArgs {
    /// Build the configuration these flags describe.
    pub fn into_config(self) -> GatewayConfig {
        let operation_timeout =
            (self.operation_timeout > 0).then(|| Duration::from_secs(self.operation_timeout));
        let constraints = Constraints {
            operation_timeout,
            default_size_limit: self.default_size_limit,
            proxied_authorization: None,
        };
        let acquire_timeout = Duration::from_millis(self.acquire_timeout_ms);

        GatewayConfig {
            directory: DirectoryConfig {
                host: self.ldap_host,
                port: self.ldap_port.unwrap_or(if self.ldaps { 636 } else { 389 }),
                use_tls: self.ldaps,
                starttls: self.starttls,
                bind_dn: self.bind_dn,
                bind_password: self.bind_password,
                connect_timeout: Duration::from_secs(self.connect_timeout),
                operation_timeout,
            },
            operational_pool: PoolConfig {
                min: self.pool_min,
                max: self.pool_max,
                acquire_timeout,
                constraints: constraints.clone(),
            },
            login_pool: PoolConfig {
                min: self.login_pool_min,
                max: self.login_pool_max,
                acquire_timeout,
                constraints,
            },
            settings: GatewaySettings {
                allow_anonymous: self.allow_anonymous,
                proxy_authorization: self.proxy_authorization,
                user_search_base: self.user_search_base,
                user_id_attribute: self.user_id_attribute,
                default_size_limit: self.default_size_limit,
            },
        }
    }
}
