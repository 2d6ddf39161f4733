//! Fuzz target for batch preprocessing and request translation
//!
//! Hostile documents must be rejected with an error, never a panic
//!
//! # Strategy
//!
//! - Raw bytes: arbitrary input interpreted as UTF-8 text
//! - Every request node of an accepted batch goes through typed parsing
//!
//! # Invariants
//!
//! - `parse_document` never panics
//! - An accepted batch yields exactly one translation outcome per node
//! - A rejected request always maps to a non-success result code
//! - Rendering an error batch for any rejection produces parseable XML

#![no_main]

use dsmlgw_proto::{
    BatchResponse, Element, ErrorType, Request, RequestKind, parse_document,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let batch = match parse_document(text) {
        Ok(batch) => batch,
        Err(e) => {
            let response =
                BatchResponse::error(e.framing(), None, ErrorType::MalformedRequest, e.to_string());
            assert!(Element::parse(&response.to_xml()).is_ok(), "error batch must be well-formed");
            return;
        },
    };

    for node in &batch.requests {
        let Some(kind) = RequestKind::from_tag(node.name()) else {
            continue;
        };
        if let Err(e) = Request::parse_as(kind, node) {
            assert!(!e.result_code().is_success());
        }
    }
});
