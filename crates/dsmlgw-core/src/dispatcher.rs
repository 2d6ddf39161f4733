//! Per-request dispatch.
//!
//! ## Responsibilities
//!
//! - Classify a request node by tag and translate it into a typed request.
//! - Borrow exactly one connection for the operation, apply the batch's
//!   constraints, execute, and turn the outcome into a response.
//! - Never fail: every path produces an [`OperationResponse`].
//!
//! Parse failures and `authRequest` are answered without touching the pool.
//! The lease is dropped (released) on every path that borrowed one.

use dsmlgw_proto::{
    Element, ErrorType, OperationRequest, OperationResponse, OperationResult, Request,
    RequestKind, ResponseBody, ResultCode,
};
use tracing::{debug, warn};

use crate::{
    directory::{Connector, Constraints, DirectoryConnection, DirectoryError},
    pool::ConnectionPool,
};

/// Per-request context supplied by the batch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchContext {
    /// Constraints applied to the borrowed connection.
    pub constraints: Constraints,
    /// Whether this is the first request of the batch.
    pub is_first: bool,
}

/// Executes single requests against the operational pool.
pub struct Dispatcher<C: Connector> {
    pool: ConnectionPool<C>,
}

impl<C: Connector> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self { pool: self.pool.clone() }
    }
}

impl<C: Connector> std::fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("pool", &self.pool).finish()
    }
}

impl<C: Connector> Dispatcher<C> {
    /// Dispatch onto `pool`.
    pub fn new(pool: ConnectionPool<C>) -> Self {
        Self { pool }
    }

    /// Answer one request node.
    pub async fn dispatch(&self, node: &Element, ctx: &DispatchContext) -> OperationResponse {
        let request_id = node.attribute("requestID").map(str::to_string);

        let Some(kind) = RequestKind::from_tag(node.name()) else {
            warn!(tag = node.name(), "unsupported operation");
            return OperationResponse::error(
                ErrorType::NotAttempted,
                request_id,
                format!("unsupported operation <{}>", node.name()),
            );
        };

        let request = match Request::parse_as(kind, node) {
            Ok(request) => request,
            Err(e) => {
                debug!(request = kind.tag(), error = %e, "request rejected during translation");
                return failure(kind, request_id, OperationResult::error(e.result_code(), e.to_string()));
            },
        };

        if let OperationRequest::Auth(_) = request.operation {
            let result = if ctx.is_first {
                OperationResult::error(
                    ResultCode::AUTH_METHOD_NOT_SUPPORTED,
                    "authRequest is not supported; authenticate with the transport credentials",
                )
            } else {
                OperationResult::error(
                    ResultCode::OPERATIONS_ERROR,
                    "authRequest must be the first request in a batch",
                )
            };
            return OperationResponse::result(kind, request_id, result);
        }

        let mut conn = match self.pool.borrow().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(request = kind.tag(), error = %e, "no directory connection");
                return failure(kind, request_id, OperationResult::error(e.result_code(), e.to_string()));
            },
        };
        conn.set_constraints(ctx.constraints.clone());

        match execute(&mut *conn, &request).await {
            Ok(mut response) => {
                response.request_id = request_id;
                response
            },
            Err(e) => {
                if e.is_connection_fatal() {
                    conn.mark_broken();
                }
                warn!(request = kind.tag(), error = %e, "directory operation failed");
                failure(kind, request_id, OperationResult::error(e.result_code(), e.to_string()))
            },
        }
    }
}

async fn execute<D: DirectoryConnection>(
    conn: &mut D,
    request: &Request,
) -> Result<OperationResponse, DirectoryError> {
    let kind = request.operation.kind();
    let response = match &request.operation {
        OperationRequest::Search(search) => {
            debug!(
                base = %search.dn,
                filter = %search.filter,
                scope = ?search.scope,
                "search"
            );
            let outcome = conn.search(search, &request.controls).await?;
            OperationResponse {
                request_id: None,
                controls: outcome.controls,
                body: ResponseBody::Search {
                    entries: outcome.entries,
                    references: outcome.references,
                    done: outcome.result,
                },
            }
        },
        OperationRequest::Add(add) => {
            OperationResponse::result(kind, None, conn.add(add).await?)
        },
        OperationRequest::Modify(modify) => {
            OperationResponse::result(kind, None, conn.modify(modify).await?)
        },
        OperationRequest::Delete(delete) => {
            OperationResponse::result(kind, None, conn.delete(delete).await?)
        },
        OperationRequest::ModifyDn(rename) => {
            OperationResponse::result(kind, None, conn.rename(rename).await?)
        },
        OperationRequest::Compare(compare) => {
            OperationResponse::result(kind, None, conn.compare(compare).await?)
        },
        OperationRequest::Extended(extended) => {
            let outcome = conn.extended(extended).await?;
            OperationResponse {
                request_id: None,
                controls: Vec::new(),
                body: ResponseBody::Extended {
                    result: outcome.result,
                    name: outcome.name,
                    value: outcome.value,
                },
            }
        },
        // Answered before a connection is borrowed.
        OperationRequest::Auth(_) => OperationResponse::result(
            kind,
            None,
            OperationResult::new(ResultCode::AUTH_METHOD_NOT_SUPPORTED),
        ),
    };
    Ok(response)
}

/// A failure shaped like the response the request would normally get.
fn failure(kind: RequestKind, request_id: Option<String>, result: OperationResult) -> OperationResponse {
    let body = match kind {
        RequestKind::Search => {
            ResponseBody::Search { entries: Vec::new(), references: Vec::new(), done: result }
        },
        RequestKind::Extended => ResponseBody::Extended { result, name: None, value: None },
        RequestKind::Auth
        | RequestKind::Modify
        | RequestKind::Add
        | RequestKind::Delete
        | RequestKind::ModifyDn
        | RequestKind::Compare => ResponseBody::Result { kind, result },
    };
    OperationResponse { request_id, controls: Vec::new(), body }
}
