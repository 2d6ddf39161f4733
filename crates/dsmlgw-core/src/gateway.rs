//! Batch gateway.
//!
//! ## Responsibilities
//!
//! - Preprocess the envelope; a malformed one is answered with a single
//!   `malformedRequest` error and no directory traffic.
//! - Authenticate the caller on the login pool; failure is answered with a
//!   single `authenticationFailed` error and no operations.
//! - Run the requests in order on the operational pool, assembling the
//!   responses under the batch's error policy.
//!
//! ## Design
//!
//! - Explicit construction: pools and settings are passed in, nothing is
//!   global. Clones of the pools may be shared by several gateways.
//! - Batches from different callers run concurrently; requests inside one
//!   batch never do.

use dsmlgw_proto::{
    BatchRequest, BatchResponse, DerefAliases, ErrorType, Flow, ResponseAssembler, ResultCode,
    Scope, SearchRequest,
    batch,
    filter::{Assertion, FilterNode},
};
use tracing::{error, info, instrument, warn};

use crate::{
    credentials::{AuthError, Credentials, Identity},
    directory::{Connector, Constraints, DirectoryConnection},
    dispatcher::{DispatchContext, Dispatcher},
    pool::{ConnectionPool, PoolError},
};

/// Gateway behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Accept batches without credentials.
    pub allow_anonymous: bool,
    /// Assert the caller's identity on operational connections with the
    /// proxied authorization control.
    pub proxy_authorization: bool,
    /// Where non-DN principals are looked up.
    pub user_search_base: Option<String>,
    /// Attribute holding the user id of non-DN principals.
    pub user_id_attribute: String,
    /// Size limit for searches that set none (0 = server default).
    pub default_size_limit: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            allow_anonymous: false,
            proxy_authorization: false,
            user_search_base: None,
            user_id_attribute: "uid".to_string(),
            default_size_limit: 0,
        }
    }
}

/// DSML batch gateway over an operational and a login pool.
pub struct Gateway<C: Connector> {
    dispatcher: Dispatcher<C>,
    op_pool: ConnectionPool<C>,
    login_pool: ConnectionPool<C>,
    settings: GatewaySettings,
}

impl<C: Connector> std::fmt::Debug for Gateway<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("op_pool", &self.op_pool)
            .field("login_pool", &self.login_pool)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Gateway<C> {
    /// Assemble a gateway.
    pub fn new(
        op_pool: ConnectionPool<C>,
        login_pool: ConnectionPool<C>,
        settings: GatewaySettings,
    ) -> Self {
        Self { dispatcher: Dispatcher::new(op_pool.clone()), op_pool, login_pool, settings }
    }

    /// Settings in force.
    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Pool used for batch operations and principal lookups.
    pub fn operational_pool(&self) -> &ConnectionPool<C> {
        &self.op_pool
    }

    /// Pool used for credential checks.
    pub fn login_pool(&self) -> &ConnectionPool<C> {
        &self.login_pool
    }

    /// Open the minimum connections of both pools.
    pub async fn warm_up(&self) -> Result<(), PoolError> {
        self.op_pool.warm_up().await?;
        self.login_pool.warm_up().await
    }

    /// Close both pools.
    pub async fn close(&self) {
        self.op_pool.close().await;
        self.login_pool.close().await;
    }

    /// Process one batch document end to end.
    #[instrument(skip_all, fields(bytes = document.len()))]
    pub async fn process(&self, document: &str, credentials: &Credentials) -> BatchResponse {
        match Self::parse(document) {
            Ok(batch) => self.respond(batch, credentials).await,
            Err(response) => response,
        }
    }

    /// Process a batch delivered with a raw `Authorization` header value.
    ///
    /// A header that cannot be decoded fails authentication like a wrong
    /// password does.
    #[instrument(skip_all, fields(bytes = document.len()))]
    pub async fn process_with_header(
        &self,
        document: &str,
        authorization: Option<&str>,
    ) -> BatchResponse {
        let batch = match Self::parse(document) {
            Ok(batch) => batch,
            Err(response) => return response,
        };
        match Credentials::from_basic_auth(authorization) {
            Ok(credentials) => self.respond(batch, &credentials).await,
            Err(e) => {
                warn!(error = %e, "caller not authenticated");
                BatchResponse::error(
                    batch.framing,
                    batch.request_id,
                    ErrorType::AuthenticationFailed,
                    e.to_string(),
                )
            },
        }
    }

    fn parse(document: &str) -> Result<BatchRequest, BatchResponse> {
        batch::parse_document(document).map_err(|e| {
            warn!(error = %e, "malformed batch");
            BatchResponse::error(e.framing(), None, ErrorType::MalformedRequest, e.to_string())
        })
    }

    async fn respond(&self, batch: BatchRequest, credentials: &Credentials) -> BatchResponse {
        let identity = match self.authenticate(credentials).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "caller not authenticated");
                let error_type = match e {
                    AuthError::Pool(_) | AuthError::Directory(_) => ErrorType::CouldNotConnect,
                    _ => ErrorType::AuthenticationFailed,
                };
                return BatchResponse::error(
                    batch.framing,
                    batch.request_id,
                    error_type,
                    e.to_string(),
                );
            },
        };

        self.run_batch(batch, &identity).await
    }

    /// Check credentials against the directory.
    #[instrument(skip_all)]
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        let (principal, password) = match credentials {
            Credentials::Anonymous if self.settings.allow_anonymous => {
                return Ok(Identity::Anonymous);
            },
            Credentials::Anonymous => return Err(AuthError::AnonymousNotAllowed),
            Credentials::Basic { principal, password } => (principal, password),
        };
        if password.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }

        let dn = self.resolve_principal(principal).await?;

        let mut conn = self.login_pool.borrow().await?;
        let result = match conn.bind(&dn, password).await {
            Ok(result) => result,
            Err(e) => {
                if e.is_connection_fatal() {
                    conn.mark_broken();
                }
                return Err(e.into());
            },
        };

        match result.code {
            ResultCode::SUCCESS => {
                info!(dn = %dn, "caller authenticated");
                Ok(Identity::User { dn })
            },
            ResultCode::INVALID_CREDENTIALS => Err(AuthError::InvalidCredentials),
            code => Err(AuthError::Rejected(result.error_message.unwrap_or_else(|| code.to_string()))),
        }
    }

    /// Map a principal to a DN: DNs pass through, user ids are looked up.
    async fn resolve_principal(&self, principal: &str) -> Result<String, AuthError> {
        if principal.contains('=') {
            return Ok(principal.trim().to_string());
        }
        let Some(base) = &self.settings.user_search_base else {
            return Err(AuthError::UnknownPrincipal(principal.to_string()));
        };

        let request = SearchRequest {
            dn: base.clone(),
            scope: Scope::Subtree,
            deref_aliases: DerefAliases::Never,
            size_limit: 2,
            time_limit: 0,
            types_only: true,
            filter: FilterNode::Equality(Assertion {
                attribute: self.settings.user_id_attribute.clone(),
                value: principal.as_bytes().to_vec(),
            }),
            attributes: vec!["1.1".to_string()],
        };

        let mut conn = self.op_pool.borrow().await?;
        let outcome = match conn.search(&request, &[]).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_connection_fatal() {
                    conn.mark_broken();
                }
                return Err(e.into());
            },
        };

        match outcome.entries.as_slice() {
            [entry] => Ok(entry.dn.clone()),
            [] => Err(AuthError::UnknownPrincipal(principal.to_string())),
            _ => Err(AuthError::AmbiguousPrincipal(principal.to_string())),
        }
    }

    /// Run a preprocessed batch for an authenticated caller.
    #[instrument(skip_all, fields(request_id = batch.request_id.as_deref().unwrap_or("")))]
    pub async fn run_batch(&self, batch: BatchRequest, identity: &Identity) -> BatchResponse {
        let defaults = &self.op_pool.config().constraints;
        let constraints = Constraints {
            operation_timeout: defaults.operation_timeout,
            default_size_limit: match self.settings.default_size_limit {
                0 => defaults.default_size_limit,
                n => n,
            },
            proxied_authorization: self.settings.proxy_authorization.then(|| identity.authz_id()),
        };

        let total = batch.requests.len();
        let mut assembler = ResponseAssembler::new(batch.on_error);
        for (index, node) in batch.requests.iter().enumerate() {
            let ctx = DispatchContext { constraints: constraints.clone(), is_first: index == 0 };
            let response = self.dispatcher.dispatch(node, &ctx).await;

            match assembler.append(index, response) {
                Ok(Flow::Continue) => {},
                Ok(Flow::Halt) => {
                    info!(index, skipped = total - index - 1, "batch stopped at first failure");
                    break;
                },
                Err(e) => {
                    error!(error = %e, "response out of order");
                    break;
                },
            }
        }

        let response = assembler.finish(batch.request_id, batch.framing);
        info!(requests = total, responses = response.responses.len(), "batch processed");
        response
    }
}
