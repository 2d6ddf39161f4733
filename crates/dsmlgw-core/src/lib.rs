//! DSML gateway core.
//!
//! Runs DSML batches against a directory through a pluggable client seam.
//!
//! ## Architecture
//!
//! ```text
//! dsmlgw-core
//!   ├─ Gateway          (envelope -> auth -> ordered dispatch -> batchResponse)
//!   ├─ Dispatcher       (one request, one borrowed connection)
//!   ├─ ConnectionPool   (bounded, RAII leases, operational + login instances)
//!   ├─ Connector        (directory client seam; ldap3 lives in dsmlgw-server)
//!   └─ MemoryDirectory  (in-memory Connector for tests and dry runs)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod credentials;
pub mod directory;
pub mod dispatcher;
pub mod gateway;
pub mod memory;
pub mod pool;

pub use credentials::{AuthError, Credentials, Identity};
pub use directory::{
    Connector, Constraints, DirectoryConnection, DirectoryError, ExtendedOutcome, SearchOutcome,
};
pub use dispatcher::{DispatchContext, Dispatcher};
pub use gateway::{Gateway, GatewaySettings};
pub use memory::{AuditRecord, Entry, MemoryConnection, MemoryConnector, MemoryDirectory};
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolStats, PooledConnection};
