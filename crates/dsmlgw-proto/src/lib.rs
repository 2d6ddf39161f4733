//! DSMLv2 batch wire model.
//!
//! Everything here is pure translation with no I/O: XML in, typed requests
//! out, typed responses in, XML out. The directory side lives in
//! `dsmlgw-core`.
//!
//! ## Layout
//!
//! ```text
//! dsmlgw-proto
//!   ├─ xml        (namespace-stripped element tree)
//!   ├─ value      (text / base64 value codec)
//!   ├─ ber        (control value encoding)
//!   ├─ filter     (filter element -> FilterNode -> RFC 4515 string)
//!   ├─ control    (sort / VLV request and response controls)
//!   ├─ request    (typed OperationRequest per request element)
//!   ├─ batch      (envelope preprocessing, error policy)
//!   └─ response   (ResponseAssembler, batchResponse rendering)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod ber;
pub mod control;
pub mod filter;
pub mod request;
pub mod response;
pub mod value;
pub mod xml;

pub use batch::{BatchError, BatchRequest, ErrorPolicy, Framing, Processing, parse_document, preprocess};
pub use control::{Control, ControlError, ResponseControl, SortKey, VirtualListView, VlvTarget};
pub use filter::{FilterError, FilterNode};
pub use request::{
    AddRequest, AuthRequest, CompareRequest, DeleteRequest, DerefAliases, ExtendedRequest,
    Modification, ModifyDnRequest, ModifyOperation, ModifyRequest, OperationRequest,
    PartialAttribute, Request, RequestError, RequestKind, Scope, SearchRequest,
};
pub use response::{
    AssemblyError, BatchResponse, ErrorType, Flow, OperationResponse, OperationResult,
    ResponseAssembler, ResponseBody, ResultCode, SearchEntry,
};
pub use value::ValueError;
pub use xml::{Element, XmlError};
