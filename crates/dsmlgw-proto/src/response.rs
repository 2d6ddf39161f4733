//! Operation responses and the batch response document.
//!
//! [`ResponseAssembler`] collects per-operation responses strictly in
//! submission order and applies the batch error policy; [`BatchResponse`]
//! renders the collected responses as a DSMLv2 `batchResponse`.

use std::fmt::{self, Write as _};

use quick_xml::escape::escape;

use crate::{
    batch::{ErrorPolicy, Framing},
    control::ResponseControl,
    request::{PartialAttribute, RequestKind},
    value::{self, EncodedValue},
};

/// DSMLv2 core namespace.
pub const DSML_NAMESPACE: &str = "urn:oasis:names:tc:DSML:2:0:core";
/// SOAP 1.1 envelope namespace.
pub const SOAP_NAMESPACE: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// LDAP result code (RFC 4511).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultCode(pub u32);

macro_rules! result_codes {
    ($($name:ident = $code:literal => $descr:literal,)*) => {
        impl ResultCode {
            $(
                #[doc = concat!("`", $descr, "`")]
                pub const $name: Self = Self($code);
            )*

            /// DSML `descr` name; codes without one map to `other`.
            pub const fn descr(self) -> &'static str {
                match self.0 {
                    $($code => $descr,)*
                    _ => "other",
                }
            }
        }
    };
}

result_codes! {
    SUCCESS = 0 => "success",
    OPERATIONS_ERROR = 1 => "operationsError",
    PROTOCOL_ERROR = 2 => "protocolError",
    TIME_LIMIT_EXCEEDED = 3 => "timeLimitExceeded",
    SIZE_LIMIT_EXCEEDED = 4 => "sizeLimitExceeded",
    COMPARE_FALSE = 5 => "compareFalse",
    COMPARE_TRUE = 6 => "compareTrue",
    AUTH_METHOD_NOT_SUPPORTED = 7 => "authMethodNotSupported",
    STRONGER_AUTH_REQUIRED = 8 => "strongAuthRequired",
    REFERRAL = 10 => "referral",
    ADMIN_LIMIT_EXCEEDED = 11 => "adminLimitExceeded",
    UNAVAILABLE_CRITICAL_EXTENSION = 12 => "unavailableCriticalExtension",
    CONFIDENTIALITY_REQUIRED = 13 => "confidentialityRequired",
    SASL_BIND_IN_PROGRESS = 14 => "saslBindInProgress",
    NO_SUCH_ATTRIBUTE = 16 => "noSuchAttribute",
    UNDEFINED_ATTRIBUTE_TYPE = 17 => "undefinedAttributeType",
    INAPPROPRIATE_MATCHING = 18 => "inappropriateMatching",
    CONSTRAINT_VIOLATION = 19 => "constraintViolation",
    ATTRIBUTE_OR_VALUE_EXISTS = 20 => "attributeOrValueExists",
    INVALID_ATTRIBUTE_SYNTAX = 21 => "invalidAttributeSyntax",
    NO_SUCH_OBJECT = 32 => "noSuchObject",
    ALIAS_PROBLEM = 33 => "aliasProblem",
    INVALID_DN_SYNTAX = 34 => "invalidDNSyntax",
    ALIAS_DEREFERENCING_PROBLEM = 36 => "aliasDereferencingProblem",
    INAPPROPRIATE_AUTHENTICATION = 48 => "inappropriateAuthentication",
    INVALID_CREDENTIALS = 49 => "invalidCredentials",
    INSUFFICIENT_ACCESS_RIGHTS = 50 => "insufficientAccessRights",
    BUSY = 51 => "busy",
    UNAVAILABLE = 52 => "unavailable",
    UNWILLING_TO_PERFORM = 53 => "unwillingToPerform",
    LOOP_DETECT = 54 => "loopDetect",
    NAMING_VIOLATION = 64 => "namingViolation",
    OBJECT_CLASS_VIOLATION = 65 => "objectClassViolation",
    NOT_ALLOWED_ON_NON_LEAF = 66 => "notAllowedOnNonLeaf",
    NOT_ALLOWED_ON_RDN = 67 => "notAllowedOnRDN",
    ENTRY_ALREADY_EXISTS = 68 => "entryAlreadyExists",
    OBJECT_CLASS_MODS_PROHIBITED = 69 => "objectClassModsProhibited",
    AFFECTS_MULTIPLE_DSAS = 71 => "affectsMultipleDSAs",
    OTHER = 80 => "other",
}

impl ResultCode {
    /// True for `success`.
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.descr())
    }
}

/// The `LDAPResult` part of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    /// Result code.
    pub code: ResultCode,
    /// Matched DN reported by the directory.
    pub matched_dn: Option<String>,
    /// Diagnostic message.
    pub error_message: Option<String>,
    /// Referral URLs.
    pub referrals: Vec<String>,
}

impl OperationResult {
    /// A plain `success`.
    pub fn success() -> Self {
        Self::new(ResultCode::SUCCESS)
    }

    /// A result with only a code.
    pub fn new(code: ResultCode) -> Self {
        Self { code, matched_dn: None, error_message: None, referrals: Vec::new() }
    }

    /// A result with a code and diagnostic message.
    pub fn error(code: ResultCode, message: impl Into<String>) -> Self {
        Self { error_message: Some(message.into()), ..Self::new(code) }
    }
}

/// One `searchResultEntry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    /// Entry DN.
    pub dn: String,
    /// Returned attributes (values empty for `typesOnly`).
    pub attributes: Vec<PartialAttribute>,
}

/// `errorResponse` type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// The request was not attempted.
    NotAttempted,
    /// The gateway could not reach the directory.
    CouldNotConnect,
    /// The directory closed the connection.
    ConnectionClosed,
    /// The batch could not be understood.
    MalformedRequest,
    /// Internal gateway failure.
    GatewayInternalError,
    /// The caller's credentials were rejected.
    AuthenticationFailed,
    /// Any other failure.
    Other,
}

impl ErrorType {
    /// DSML `type` attribute value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotAttempted => "notAttempted",
            Self::CouldNotConnect => "couldNotConnect",
            Self::ConnectionClosed => "connectionClosed",
            Self::MalformedRequest => "malformedRequest",
            Self::GatewayInternalError => "gatewayInternalError",
            Self::AuthenticationFailed => "authenticationFailed",
            Self::Other => "other",
        }
    }
}

/// Payload of one operation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// A plain `LDAPResult` response (`addResponse`, `compareResponse`, ...).
    Result {
        /// Request kind this answers.
        kind: RequestKind,
        /// The result.
        result: OperationResult,
    },
    /// `searchResponse`
    Search {
        /// Entries in the order returned.
        entries: Vec<SearchEntry>,
        /// Continuation references, one URL list per reference.
        references: Vec<Vec<String>>,
        /// The `searchResultDone` result.
        done: OperationResult,
    },
    /// `extendedResponse`
    Extended {
        /// The result.
        result: OperationResult,
        /// Response OID.
        name: Option<String>,
        /// Response value.
        value: Option<Vec<u8>>,
    },
    /// `errorResponse`
    Error {
        /// Error category.
        error_type: ErrorType,
        /// Human-readable message.
        message: String,
    },
}

/// A response to one request of the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResponse {
    /// Echoed `requestID`.
    pub request_id: Option<String>,
    /// Response controls, written inside the `LDAPResult`.
    pub controls: Vec<ResponseControl>,
    /// Payload.
    pub body: ResponseBody,
}

impl OperationResponse {
    /// A plain result response.
    pub fn result(kind: RequestKind, request_id: Option<String>, result: OperationResult) -> Self {
        Self { request_id, controls: Vec::new(), body: ResponseBody::Result { kind, result } }
    }

    /// An `errorResponse`.
    pub fn error(
        error_type: ErrorType,
        request_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            controls: Vec::new(),
            body: ResponseBody::Error { error_type, message: message.into() },
        }
    }

    /// Response element tag.
    pub fn tag(&self) -> &'static str {
        match &self.body {
            ResponseBody::Result { kind, .. } => kind.response_tag(),
            ResponseBody::Search { .. } => RequestKind::Search.response_tag(),
            ResponseBody::Extended { .. } => RequestKind::Extended.response_tag(),
            ResponseBody::Error { .. } => "errorResponse",
        }
    }

    /// The `LDAPResult`, if this response carries one.
    pub fn ldap_result(&self) -> Option<&OperationResult> {
        match &self.body {
            ResponseBody::Result { result, .. } | ResponseBody::Extended { result, .. } => {
                Some(result)
            },
            ResponseBody::Search { done, .. } => Some(done),
            ResponseBody::Error { .. } => None,
        }
    }

    /// Whether this response counts as a failure for the `exit` policy.
    ///
    /// Authentication responses never halt a batch, and compare results
    /// `compareTrue`/`compareFalse` are outcomes rather than failures.
    pub fn is_failure(&self) -> bool {
        match &self.body {
            ResponseBody::Error { .. } => true,
            ResponseBody::Result { kind: RequestKind::Auth, .. } => false,
            ResponseBody::Result { kind: RequestKind::Compare, result } => !matches!(
                result.code,
                ResultCode::SUCCESS | ResultCode::COMPARE_TRUE | ResultCode::COMPARE_FALSE
            ),
            ResponseBody::Result { result, .. }
            | ResponseBody::Extended { result, .. }
            | ResponseBody::Search { done: result, .. } => !result.code.is_success(),
        }
    }
}

/// Whether the caller should keep dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Dispatch the next request.
    Continue,
    /// Stop; the batch is complete.
    Halt,
}

/// Errors produced by [`ResponseAssembler::append`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AssemblyError {
    /// A response arrived for the wrong position.
    #[error("response for request {got} appended out of order, expected {expected}")]
    OutOfOrder {
        /// Next position the assembler accepts.
        expected: usize,
        /// Position supplied.
        got: usize,
    },

    /// A response arrived after the batch halted.
    #[error("batch already halted")]
    Halted,
}

/// Ordered accumulator of operation responses.
#[derive(Debug)]
pub struct ResponseAssembler {
    policy: ErrorPolicy,
    responses: Vec<OperationResponse>,
    halted: bool,
}

impl ResponseAssembler {
    /// Start assembling under `policy`.
    pub fn new(policy: ErrorPolicy) -> Self {
        Self { policy, responses: Vec::new(), halted: false }
    }

    /// Append the response for request `index` (0-based).
    pub fn append(
        &mut self,
        index: usize,
        response: OperationResponse,
    ) -> Result<Flow, AssemblyError> {
        if self.halted {
            return Err(AssemblyError::Halted);
        }
        let expected = self.responses.len();
        if index != expected {
            return Err(AssemblyError::OutOfOrder { expected, got: index });
        }

        let halt = self.policy == ErrorPolicy::Exit && response.is_failure();
        self.responses.push(response);

        if halt {
            self.halted = true;
            Ok(Flow::Halt)
        } else {
            Ok(Flow::Continue)
        }
    }

    /// True once a failure has halted an `exit` batch.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Number of responses collected so far.
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    /// True when no response has been collected.
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    /// Finish the batch.
    pub fn finish(self, request_id: Option<String>, framing: Framing) -> BatchResponse {
        BatchResponse { request_id, framing, responses: self.responses }
    }
}

/// A complete batch response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResponse {
    /// Echoed batch `requestID`.
    pub request_id: Option<String>,
    /// Framing of the reply.
    pub framing: Framing,
    /// Responses in submission order.
    pub responses: Vec<OperationResponse>,
}

impl BatchResponse {
    /// A batch holding a single `errorResponse`.
    pub fn error(
        framing: Framing,
        request_id: Option<String>,
        error_type: ErrorType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            framing,
            responses: vec![OperationResponse::error(error_type, None, message)],
        }
    }

    /// Render the document.
    pub fn to_xml(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BatchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.framing == Framing::Soap {
            write!(f, r#"<soap-env:Envelope xmlns:soap-env="{SOAP_NAMESPACE}"><soap-env:Body>"#)?;
        }

        write!(
            f,
            r#"<batchResponse xmlns="{DSML_NAMESPACE}" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance""#
        )?;
        write_request_id(f, self.request_id.as_deref())?;
        f.write_char('>')?;

        for response in &self.responses {
            write_response(f, response)?;
        }

        f.write_str("</batchResponse>")?;
        if self.framing == Framing::Soap {
            f.write_str("</soap-env:Body></soap-env:Envelope>")?;
        }
        Ok(())
    }
}

fn write_request_id(f: &mut fmt::Formatter<'_>, request_id: Option<&str>) -> fmt::Result {
    match request_id {
        Some(id) => write!(f, r#" requestID="{}""#, escape(id)),
        None => Ok(()),
    }
}

fn write_response(f: &mut fmt::Formatter<'_>, response: &OperationResponse) -> fmt::Result {
    let tag = response.tag();
    let request_id = response.request_id.as_deref();

    match &response.body {
        ResponseBody::Result { result, .. } => {
            write_ldap_result(f, tag, request_id, result, &response.controls, |_| Ok(()))
        },
        ResponseBody::Extended { result, name, value } => {
            write_ldap_result(f, tag, request_id, result, &response.controls, |f| {
                if let Some(name) = name {
                    write!(f, "<responseName>{}</responseName>", escape(name.as_str()))?;
                }
                if let Some(value) = value {
                    write!(
                        f,
                        r#"<response xsi:type="xsd:base64Binary">{}</response>"#,
                        value::encode_base64(value)
                    )?;
                }
                Ok(())
            })
        },
        ResponseBody::Search { entries, references, done } => {
            write!(f, "<{tag}")?;
            write_request_id(f, request_id)?;
            f.write_char('>')?;
            for entry in entries {
                write!(f, r#"<searchResultEntry dn="{}">"#, escape(entry.dn.as_str()))?;
                for attr in &entry.attributes {
                    write!(f, r#"<attr name="{}">"#, escape(attr.name.as_str()))?;
                    for v in &attr.values {
                        write_value(f, "value", v)?;
                    }
                    f.write_str("</attr>")?;
                }
                f.write_str("</searchResultEntry>")?;
            }
            for urls in references {
                f.write_str("<searchResultReference>")?;
                for url in urls {
                    write!(f, "<ref>{}</ref>", escape(url.as_str()))?;
                }
                f.write_str("</searchResultReference>")?;
            }
            write_ldap_result(f, "searchResultDone", None, done, &response.controls, |_| Ok(()))?;
            write!(f, "</{tag}>")
        },
        ResponseBody::Error { error_type, message } => {
            write!(f, r#"<{tag} type="{}""#, error_type.as_str())?;
            write_request_id(f, request_id)?;
            write!(f, "><message>{}</message></{tag}>", escape(message.as_str()))
        },
    }
}

fn write_ldap_result(
    f: &mut fmt::Formatter<'_>,
    tag: &str,
    request_id: Option<&str>,
    result: &OperationResult,
    controls: &[ResponseControl],
    extra: impl FnOnce(&mut fmt::Formatter<'_>) -> fmt::Result,
) -> fmt::Result {
    write!(f, "<{tag}")?;
    write_request_id(f, request_id)?;
    if let Some(matched) = &result.matched_dn {
        write!(f, r#" matchedDN="{}""#, escape(matched.as_str()))?;
    }
    f.write_char('>')?;

    for control in controls {
        write!(
            f,
            r#"<control type="{}" criticality="{}">"#,
            escape(control.oid()),
            control.is_critical()
        )?;
        if let Some(bytes) = control.encode_value() {
            write!(
                f,
                r#"<controlValue xsi:type="xsd:base64Binary">{}</controlValue>"#,
                value::encode_base64(&bytes)
            )?;
        }
        f.write_str("</control>")?;
    }

    write!(f, r#"<resultCode code="{}" descr="{}"/>"#, result.code.0, result.code.descr())?;
    if let Some(message) = &result.error_message {
        write!(f, "<errorMessage>{}</errorMessage>", escape(message.as_str()))?;
    }
    for url in &result.referrals {
        write!(f, "<referral>{}</referral>", escape(url.as_str()))?;
    }
    extra(f)?;
    write!(f, "</{tag}>")
}

fn write_value(f: &mut fmt::Formatter<'_>, tag: &str, bytes: &[u8]) -> fmt::Result {
    match value::encode(bytes) {
        EncodedValue::Text(text) => write!(f, "<{tag}>{}</{tag}>", escape(text.as_str())),
        EncodedValue::Base64(b64) => {
            write!(f, r#"<{tag} xsi:type="xsd:base64Binary">{b64}</{tag}>"#)
        },
    }
}
