//! Directory client seam.
//!
//! The gateway never talks to a directory server directly. It goes through
//! [`Connector`] (opens connections) and [`DirectoryConnection`] (runs one
//! operation at a time on an open connection). Production uses the `ldap3`
//! implementation in `dsmlgw-server`; tests and dry runs use
//! [`MemoryDirectory`](crate::memory::MemoryDirectory).
//!
//! # Result codes vs. errors
//!
//! A directory that answers, even with a failure code, yields `Ok` with an
//! [`OperationResult`]. `Err(DirectoryError)` is reserved for failures where
//! no answer arrived (transport, timeout, encoding), and
//! [`DirectoryError::is_connection_fatal`] decides whether the connection
//! can be reused.

use std::time::Duration;

use async_trait::async_trait;
use dsmlgw_proto::{
    AddRequest, CompareRequest, Control, DeleteRequest, ExtendedRequest, ModifyDnRequest,
    ModifyRequest, OperationResult, ResponseControl, ResultCode, SearchEntry, SearchRequest,
};

/// Per-connection operation constraints.
///
/// Connections go back to the pool's defaults whenever they are released.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Constraints {
    /// Upper bound on a single operation, enforced client side.
    pub operation_timeout: Option<Duration>,
    /// Size limit applied to searches that do not set their own.
    pub default_size_limit: u32,
    /// Authorization identity asserted with the proxied authorization
    /// control (`dn:<dn>`, or `dn:` for anonymous).
    pub proxied_authorization: Option<String>,
}

/// Errors where the directory did not produce an answer.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Could not open a connection.
    #[error("could not connect to directory: {0}")]
    Connect(String),

    /// The connection dropped mid-operation.
    #[error("directory connection closed: {0}")]
    ConnectionClosed(String),

    /// The operation did not complete within the configured timeout.
    #[error("directory operation timed out after {0:?}")]
    Timeout(Duration),

    /// A request could not be encoded for the wire.
    #[error("could not encode request: {0}")]
    Encoding(String),
}

impl DirectoryError {
    /// Whether the connection that produced this error must be discarded.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::Connect(_) | Self::ConnectionClosed(_) | Self::Timeout(_) => true,
            Self::Encoding(_) => false,
        }
    }

    /// Result code reported to the client.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Connect(_) | Self::ConnectionClosed(_) => ResultCode::UNAVAILABLE,
            Self::Timeout(_) => ResultCode::TIME_LIMIT_EXCEEDED,
            Self::Encoding(_) => ResultCode::PROTOCOL_ERROR,
        }
    }
}

/// Everything a search returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome {
    /// Entries in the order returned.
    pub entries: Vec<SearchEntry>,
    /// Continuation references.
    pub references: Vec<Vec<String>>,
    /// Final result.
    pub result: OperationResult,
    /// Controls attached to the final result.
    pub controls: Vec<ResponseControl>,
}

impl SearchOutcome {
    /// An outcome with no entries.
    pub fn empty(result: OperationResult) -> Self {
        Self { entries: Vec::new(), references: Vec::new(), result, controls: Vec::new() }
    }
}

/// Result of an extended operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedOutcome {
    /// Final result.
    pub result: OperationResult,
    /// Response OID.
    pub name: Option<String>,
    /// Response value.
    pub value: Option<Vec<u8>>,
}

/// Opens directory connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced.
    type Connection: DirectoryConnection;

    /// Open and authenticate a new connection.
    async fn connect(&self) -> Result<Self::Connection, DirectoryError>;
}

/// One open directory connection.
///
/// Every operation honours the current [`Constraints`].
#[async_trait]
pub trait DirectoryConnection: Send + 'static {
    /// Current constraints.
    fn constraints(&self) -> &Constraints;

    /// Replace the constraints.
    fn set_constraints(&mut self, constraints: Constraints);

    /// True once the connection is known to be unusable.
    fn is_broken(&self) -> bool;

    /// Simple bind.
    async fn bind(&mut self, dn: &str, password: &str) -> Result<OperationResult, DirectoryError>;

    /// Search with the request's own limits (or the default size limit).
    async fn search(
        &mut self,
        request: &SearchRequest,
        controls: &[Control],
    ) -> Result<SearchOutcome, DirectoryError>;

    /// Add an entry.
    async fn add(&mut self, request: &AddRequest) -> Result<OperationResult, DirectoryError>;

    /// Modify an entry.
    async fn modify(&mut self, request: &ModifyRequest) -> Result<OperationResult, DirectoryError>;

    /// Delete an entry.
    async fn delete(&mut self, request: &DeleteRequest) -> Result<OperationResult, DirectoryError>;

    /// Rename or move an entry.
    async fn rename(&mut self, request: &ModifyDnRequest)
    -> Result<OperationResult, DirectoryError>;

    /// Compare an attribute value.
    async fn compare(&mut self, request: &CompareRequest)
    -> Result<OperationResult, DirectoryError>;

    /// Run an extended operation.
    async fn extended(
        &mut self,
        request: &ExtendedRequest,
    ) -> Result<ExtendedOutcome, DirectoryError>;

    /// Close the connection politely.
    async fn unbind(&mut self) -> Result<(), DirectoryError>;
}
