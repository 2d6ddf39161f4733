//! Batch envelope preprocessing.
//!
//! A batch arrives either as a bare `batchRequest` root or wrapped in a SOAP
//! `Envelope/Body`. [`preprocess`] unwraps it, reads the batch-level
//! attributes and hands back the request elements as opaque nodes in
//! document order; each node is translated later by the dispatcher.

use tracing::debug;

use crate::xml::{Element, XmlError};

/// What to do after a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Keep processing the remaining requests.
    Resume,
    /// Stop at the first failure.
    #[default]
    Exit,
}

impl ErrorPolicy {
    /// Interpret an `onError` attribute. Only `resume` selects [`Self::Resume`].
    pub fn from_dsml(text: Option<&str>) -> Self {
        match text.map(str::trim) {
            Some("resume") => Self::Resume,
            _ => Self::Exit,
        }
    }
}

/// Requested processing mode. Recorded only; requests always run in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Processing {
    /// One request after another.
    #[default]
    Sequential,
    /// Client allows concurrent execution.
    Parallel,
}

/// How the batch was framed, and therefore how the reply must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// `batchRequest` as the document root.
    #[default]
    Bare,
    /// `batchRequest` inside a SOAP envelope.
    Soap,
}

/// Errors produced while preprocessing a batch.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BatchError {
    /// The document is not well-formed.
    #[error(transparent)]
    Xml(#[from] XmlError),

    /// The document (or SOAP body) does not carry a `batchRequest`.
    #[error("expected <batchRequest>, found {found}")]
    NotABatch {
        /// What was found instead.
        found: String,
        /// Framing of the document, for the error reply.
        framing: Framing,
    },
}

impl BatchError {
    /// Framing to use for the error reply.
    pub fn framing(&self) -> Framing {
        match self {
            Self::Xml(_) => Framing::Bare,
            Self::NotABatch { framing, .. } => *framing,
        }
    }
}

/// A preprocessed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    /// Batch-level `requestID`.
    pub request_id: Option<String>,
    /// Failure policy.
    pub on_error: ErrorPolicy,
    /// Requested processing mode.
    pub processing: Processing,
    /// Request nodes in document order.
    pub requests: Vec<Element>,
    /// Framing of the incoming document.
    pub framing: Framing,
}

/// Parse and preprocess a batch document.
pub fn parse_document(xml: &str) -> Result<BatchRequest, BatchError> {
    preprocess(Element::parse(xml)?)
}

/// Unwrap the envelope and extract the ordered request nodes.
pub fn preprocess(root: Element) -> Result<BatchRequest, BatchError> {
    let (batch, framing) = match root.name() {
        "batchRequest" => (root, Framing::Bare),
        "Envelope" => (soap_body_batch(root)?, Framing::Soap),
        other => {
            return Err(BatchError::NotABatch { found: format!("<{other}>"), framing: Framing::Bare });
        },
    };

    let request_id = batch.attribute("requestID").map(str::to_string);
    let on_error = ErrorPolicy::from_dsml(batch.attribute("onError"));
    let processing = match batch.attribute("processing").map(str::trim) {
        Some("parallel") => Processing::Parallel,
        _ => Processing::Sequential,
    };
    let requests = batch.into_children();

    debug!(
        request_id = request_id.as_deref().unwrap_or(""),
        ?on_error,
        ?processing,
        ?framing,
        requests = requests.len(),
        "preprocessed batch"
    );

    Ok(BatchRequest { request_id, on_error, processing, requests, framing })
}

fn soap_body_batch(envelope: Element) -> Result<Element, BatchError> {
    let not_a_batch = |found: String| BatchError::NotABatch { found, framing: Framing::Soap };

    let body = envelope
        .into_children()
        .into_iter()
        .find(|c| c.name() == "Body")
        .ok_or_else(|| not_a_batch("SOAP envelope without a Body".to_string()))?;

    let mut children = body.into_children().into_iter();
    match (children.next(), children.next()) {
        (Some(batch), None) if batch.name() == "batchRequest" => Ok(batch),
        (Some(other), None) => Err(not_a_batch(format!("<{}>", other.name()))),
        (None, _) => Err(not_a_batch("an empty SOAP Body".to_string())),
        (Some(_), Some(_)) => Err(not_a_batch("more than one element in the SOAP Body".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_batch_keeps_request_order() {
        let batch = parse_document(
            r#"<batchRequest xmlns="urn:oasis:names:tc:DSML:2:0:core" requestID="b1" onError="resume">
                 <addRequest dn="cn=a"/><modifyRequest dn="cn=b"/><delRequest dn="cn=c"/>
               </batchRequest>"#,
        )
        .unwrap();

        assert_eq!(batch.framing, Framing::Bare);
        assert_eq!(batch.request_id.as_deref(), Some("b1"));
        assert_eq!(batch.on_error, ErrorPolicy::Resume);
        let tags: Vec<_> = batch.requests.iter().map(Element::name).collect();
        assert_eq!(tags, vec!["addRequest", "modifyRequest", "delRequest"]);
    }

    #[test]
    fn soap_envelope_is_unwrapped() {
        let batch = parse_document(
            r#"<soap-env:Envelope xmlns:soap-env="http://schemas.xmlsoap.org/soap/envelope/">
                 <soap-env:Header/>
                 <soap-env:Body>
                   <batchRequest processing="parallel"><delRequest dn="cn=a"/></batchRequest>
                 </soap-env:Body>
               </soap-env:Envelope>"#,
        )
        .unwrap();

        assert_eq!(batch.framing, Framing::Soap);
        assert_eq!(batch.processing, Processing::Parallel);
        assert_eq!(batch.on_error, ErrorPolicy::Exit);
        assert_eq!(batch.requests.len(), 1);
    }

    #[test]
    fn on_error_only_resume_resumes() {
        assert_eq!(ErrorPolicy::from_dsml(Some(" resume ")), ErrorPolicy::Resume);
        assert_eq!(ErrorPolicy::from_dsml(Some("exit")), ErrorPolicy::Exit);
        assert_eq!(ErrorPolicy::from_dsml(Some("RESUME")), ErrorPolicy::Exit);
        assert_eq!(ErrorPolicy::from_dsml(None), ErrorPolicy::Exit);
    }

    #[test]
    fn soap_body_without_batch_is_rejected() {
        let err = parse_document(
            r#"<Envelope><Body><searchRequest dn=""/></Body></Envelope>"#,
        )
        .unwrap_err();
        assert!(matches!(&err, BatchError::NotABatch { found, .. } if found == "<searchRequest>"));
        assert_eq!(err.framing(), Framing::Soap);
    }

    #[test]
    fn empty_soap_body_is_rejected() {
        let err = parse_document("<Envelope><Body/></Envelope>").unwrap_err();
        assert_eq!(err.framing(), Framing::Soap);
    }

    #[test]
    fn foreign_root_is_rejected() {
        let err = parse_document("<html/>").unwrap_err();
        assert_eq!(err, BatchError::NotABatch { found: "<html>".into(), framing: Framing::Bare });
    }

    #[test]
    fn malformed_document_is_an_xml_error() {
        let err = parse_document("<batchRequest><delRequest></batchRequest>").unwrap_err();
        assert!(matches!(err, BatchError::Xml(_)));
        assert_eq!(err.framing(), Framing::Bare);
    }
}
