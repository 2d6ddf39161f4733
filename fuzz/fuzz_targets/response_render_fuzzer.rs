//! Fuzz target for `batchResponse` rendering
//!
//! Whatever the directory returns, the rendered document must stay
//! well-formed and keep the responses in order
//!
//! # Strategy
//!
//! - Arbitrary DNs, messages, attribute names and binary values
//! - Arbitrary mix of result, search and error responses
//! - Bare and SOAP framing
//!
//! # Invariants
//!
//! - Rendered output always parses back as XML
//! - The response count survives rendering
//! - Binary values come back byte-for-byte through the value codec

#![no_main]

use arbitrary::Arbitrary;
use dsmlgw_proto::{
    BatchResponse, Element, ErrorType, Framing, OperationResponse, OperationResult,
    PartialAttribute, RequestKind, ResponseBody, ResultCode, SearchEntry, value,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum FuzzedResponse {
    Result { code: u8, matched: Option<String>, message: Option<String> },
    Search { dn: String, attribute: String, values: Vec<Vec<u8>>, code: u8 },
    Error { message: String },
}

#[derive(Debug, Arbitrary)]
struct FuzzedBatch {
    soap: bool,
    request_id: Option<String>,
    responses: Vec<FuzzedResponse>,
}

/// Names survive only when they are plausible attribute names.
fn attribute_name(raw: &str) -> String {
    let name: String = raw.chars().filter(|c| c.is_ascii_alphanumeric()).take(16).collect();
    if name.is_empty() { "cn".to_string() } else { name }
}

fn build(fuzzed: FuzzedResponse, index: usize) -> OperationResponse {
    let request_id = Some(index.to_string());
    match fuzzed {
        FuzzedResponse::Result { code, matched, message } => OperationResponse::result(
            RequestKind::Modify,
            request_id,
            OperationResult {
                code: ResultCode(u32::from(code)),
                matched_dn: matched,
                error_message: message,
                referrals: Vec::new(),
            },
        ),
        FuzzedResponse::Search { dn, attribute, values, code } => OperationResponse {
            request_id,
            controls: Vec::new(),
            body: ResponseBody::Search {
                entries: vec![SearchEntry {
                    dn,
                    attributes: vec![PartialAttribute { name: attribute_name(&attribute), values }],
                }],
                references: Vec::new(),
                done: OperationResult::new(ResultCode(u32::from(code))),
            },
        },
        FuzzedResponse::Error { message } => {
            OperationResponse::error(ErrorType::Other, request_id, message)
        },
    }
}

fuzz_target!(|input: FuzzedBatch| {
    let expected: Vec<Vec<Vec<u8>>> = input
        .responses
        .iter()
        .filter_map(|r| match r {
            FuzzedResponse::Search { values, .. } => Some(values.clone()),
            _ => None,
        })
        .collect();

    let count = input.responses.len();
    let response = BatchResponse {
        request_id: input.request_id,
        framing: if input.soap { Framing::Soap } else { Framing::Bare },
        responses: input.responses.into_iter().enumerate().map(|(i, r)| build(r, i)).collect(),
    };

    let xml = response.to_xml();
    let root = Element::parse(&xml).expect("rendered batch must be well-formed");
    let batch = if input.soap {
        root.child("Body").and_then(|b| b.child("batchResponse")).expect("SOAP body")
    } else {
        &root
    };
    assert_eq!(batch.children().len(), count);

    let decoded: Vec<Vec<Vec<u8>>> = batch
        .children()
        .iter()
        .filter(|c| c.name() == "searchResponse")
        .map(|search| {
            search
                .child("searchResultEntry")
                .and_then(|e| e.child("attr"))
                .map(|attr| {
                    attr.children()
                        .iter()
                        .map(|v| value::decode(v).expect("rendered value decodes"))
                        .collect()
                })
                .unwrap_or_default()
        })
        .collect();
    assert_eq!(decoded, expected);
});
