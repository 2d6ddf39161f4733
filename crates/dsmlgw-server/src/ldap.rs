//! `ldap3`-backed directory connections.
//!
//! ## Responsibilities
//!
//! - Open connections (ldap, ldaps or StartTLS), spawn the `ldap3` driver
//!   task and bind the configured service identity.
//! - Translate typed requests into `ldap3` calls, applying the connection's
//!   constraints: operation timeout, default size limit and the proxied
//!   authorization control.
//! - Translate `ldap3` results back, decoding known response controls.
//!
//! A transport failure or timeout marks the connection broken so the pool
//! replaces it.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use dsmlgw_core::{
    Connector, Constraints, DirectoryConnection, DirectoryError, ExtendedOutcome, SearchOutcome,
};
use dsmlgw_proto::{
    AddRequest, CompareRequest, Control, DeleteRequest, DerefAliases, ExtendedRequest,
    ModifyDnRequest, ModifyOperation, ModifyRequest, OperationResult, PartialAttribute,
    ResponseControl, ResultCode, Scope, SearchEntry, SearchRequest,
};
use ldap3::{
    Ldap, LdapConnAsync, LdapConnSettings, Mod, SearchOptions,
    controls::{ProxyAuth, RawControl},
    exop::Exop,
    result::{ExopResult, LdapError, LdapResult, SearchResult},
};
use tracing::{debug, info, warn};

use crate::config::DirectoryConfig;

/// Opens `ldap3` connections to one directory.
#[derive(Debug, Clone)]
pub struct LdapConnector {
    config: Arc<DirectoryConfig>,
}

impl LdapConnector {
    /// Connector for `config`.
    pub fn new(config: DirectoryConfig) -> Self {
        Self { config: Arc::new(config) }
    }
}

#[async_trait]
impl Connector for LdapConnector {
    type Connection = LdapConnection;

    async fn connect(&self) -> Result<LdapConnection, DirectoryError> {
        let config = &self.config;
        let url = config.url();
        let settings = LdapConnSettings::new()
            .set_conn_timeout(config.connect_timeout)
            .set_starttls(config.starttls);

        debug!(url = %url, "connecting to directory");
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| DirectoryError::Connect(format!("{url}: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver stopped");
            }
        });

        if let Some(bind_dn) = &config.bind_dn {
            let result = ldap
                .with_timeout(config.connect_timeout)
                .simple_bind(bind_dn, config.bind_password.as_deref().unwrap_or(""))
                .await
                .map_err(|e| DirectoryError::Connect(format!("service bind as {bind_dn}: {e}")))?;
            if result.rc != 0 {
                return Err(DirectoryError::Connect(format!(
                    "service bind as {bind_dn} failed with code {}: {}",
                    result.rc, result.text
                )));
            }
        }

        info!(url = %url, "directory connection established");
        Ok(LdapConnection { ldap, constraints: Constraints::default(), broken: false })
    }
}

/// One `ldap3` connection.
pub struct LdapConnection {
    ldap: Ldap,
    constraints: Constraints,
    broken: bool,
}

impl std::fmt::Debug for LdapConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnection")
            .field("constraints", &self.constraints)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl LdapConnection {
    /// Arm the next operation with the timeout and controls in force.
    fn prepare(&mut self, mut controls: Vec<RawControl>) -> &mut Ldap {
        if let Some(authzid) = &self.constraints.proxied_authorization {
            controls.push(ProxyAuth { authzid: authzid.clone() }.into());
        }
        if let Some(timeout) = self.constraints.operation_timeout {
            self.ldap.with_timeout(timeout);
        }
        if !controls.is_empty() {
            self.ldap.with_controls(controls);
        }
        &mut self.ldap
    }

    fn fail(&mut self, error: LdapError) -> DirectoryError {
        let error = map_error(&error, self.constraints.operation_timeout);
        if error.is_connection_fatal() {
            self.broken = true;
        }
        error
    }
}

#[async_trait]
impl DirectoryConnection for LdapConnection {
    fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    fn set_constraints(&mut self, constraints: Constraints) {
        self.constraints = constraints;
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn bind(&mut self, dn: &str, password: &str) -> Result<OperationResult, DirectoryError> {
        if let Some(timeout) = self.constraints.operation_timeout {
            self.ldap.with_timeout(timeout);
        }
        let outcome = self.ldap.simple_bind(dn, password).await;
        outcome.map(operation_result).map_err(|e| self.fail(e))
    }

    async fn search(
        &mut self,
        request: &SearchRequest,
        controls: &[Control],
    ) -> Result<SearchOutcome, DirectoryError> {
        let size_limit = match request.size_limit {
            0 => self.constraints.default_size_limit,
            n => n,
        };
        let options = SearchOptions::new()
            .deref(deref_aliases(request.deref_aliases))
            .typesonly(request.types_only)
            .sizelimit(clamp_i32(size_limit))
            .timelimit(clamp_i32(request.time_limit));
        let filter = request.filter.to_string();

        let ldap = self.prepare(raw_controls(controls));
        ldap.with_search_options(options);
        let outcome =
            ldap.search(&request.dn, scope(request.scope), &filter, request.attributes.clone()).await;
        let SearchResult(results, result) = outcome.map_err(|e| self.fail(e))?;

        let mut entries = Vec::new();
        let mut references = Vec::new();
        for entry in results {
            if entry.is_ref() {
                references.push(ldap3::parse_refs(entry.0));
            } else if !entry.is_intermediate() {
                entries.push(search_entry(ldap3::SearchEntry::construct(entry)));
            }
        }

        let controls = response_controls(&result);
        Ok(SearchOutcome { entries, references, result: operation_result(result), controls })
    }

    async fn add(&mut self, request: &AddRequest) -> Result<OperationResult, DirectoryError> {
        let attributes: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = request
            .attributes
            .iter()
            .map(|a| (a.name.as_bytes().to_vec(), a.values.iter().cloned().collect()))
            .collect();

        let outcome = self.prepare(Vec::new()).add(&request.dn, attributes).await;
        outcome.map(operation_result).map_err(|e| self.fail(e))
    }

    async fn modify(&mut self, request: &ModifyRequest) -> Result<OperationResult, DirectoryError> {
        let mods: Vec<Mod<Vec<u8>>> = request
            .modifications
            .iter()
            .map(|m| {
                let name = m.attribute.name.as_bytes().to_vec();
                let values: HashSet<Vec<u8>> = m.attribute.values.iter().cloned().collect();
                match m.operation {
                    ModifyOperation::Add => Mod::Add(name, values),
                    ModifyOperation::Delete => Mod::Delete(name, values),
                    ModifyOperation::Replace => Mod::Replace(name, values),
                }
            })
            .collect();

        let outcome = self.prepare(Vec::new()).modify(&request.dn, mods).await;
        outcome.map(operation_result).map_err(|e| self.fail(e))
    }

    async fn delete(&mut self, request: &DeleteRequest) -> Result<OperationResult, DirectoryError> {
        let outcome = self.prepare(Vec::new()).delete(&request.dn).await;
        outcome.map(operation_result).map_err(|e| self.fail(e))
    }

    async fn rename(
        &mut self,
        request: &ModifyDnRequest,
    ) -> Result<OperationResult, DirectoryError> {
        let outcome = self
            .prepare(Vec::new())
            .modifydn(
                &request.dn,
                &request.new_rdn,
                request.delete_old_rdn,
                request.new_superior.as_deref(),
            )
            .await;
        outcome.map(operation_result).map_err(|e| self.fail(e))
    }

    async fn compare(
        &mut self,
        request: &CompareRequest,
    ) -> Result<OperationResult, DirectoryError> {
        let outcome = self
            .prepare(Vec::new())
            .compare(&request.dn, &request.attribute, request.value.as_slice())
            .await;
        outcome.map(|c| operation_result(c.0)).map_err(|e| self.fail(e))
    }

    async fn extended(
        &mut self,
        request: &ExtendedRequest,
    ) -> Result<ExtendedOutcome, DirectoryError> {
        let exop = Exop { name: Some(request.oid.clone()), val: request.value.clone() };
        let outcome = self.prepare(Vec::new()).extended(exop).await;
        let ExopResult(exop, result) = outcome.map_err(|e| self.fail(e))?;
        Ok(ExtendedOutcome { result: operation_result(result), name: exop.name, value: exop.val })
    }

    async fn unbind(&mut self) -> Result<(), DirectoryError> {
        self.broken = true;
        self.ldap.unbind().await.map_err(|e| map_error(&e, None))
    }
}

/// Classify an `ldap3` failure.
fn map_error(error: &LdapError, timeout: Option<Duration>) -> DirectoryError {
    match error {
        LdapError::Timeout { .. } => DirectoryError::Timeout(timeout.unwrap_or_default()),
        LdapError::Io { .. }
        | LdapError::EndOfStream { .. }
        | LdapError::OpSend { .. }
        | LdapError::ResultRecv { .. }
        | LdapError::IdScrubSend { .. } => DirectoryError::ConnectionClosed(error.to_string()),
        other => DirectoryError::Encoding(other.to_string()),
    }
}

fn operation_result(result: LdapResult) -> OperationResult {
    OperationResult {
        code: ResultCode(result.rc),
        matched_dn: Some(result.matched).filter(|m| !m.is_empty()),
        error_message: Some(result.text).filter(|t| !t.is_empty()),
        referrals: result.refs,
    }
}

fn response_controls(result: &LdapResult) -> Vec<ResponseControl> {
    result
        .ctrls
        .iter()
        .map(|ldap3::controls::Control(_, raw)| {
            ResponseControl::decode(&raw.ctype, raw.crit, raw.val.as_deref()).unwrap_or_else(|e| {
                debug!(oid = %raw.ctype, error = %e, "passing undecodable response control through");
                ResponseControl::Other {
                    oid: raw.ctype.clone(),
                    critical: raw.crit,
                    value: raw.val.clone(),
                }
            })
        })
        .collect()
}

/// Request controls on the wire. Unknown controls never get this far.
fn raw_controls(controls: &[Control]) -> Vec<RawControl> {
    controls
        .iter()
        .filter(|c| !matches!(c, Control::Unknown { .. }))
        .map(|c| RawControl {
            ctype: c.oid().to_string(),
            crit: c.is_critical(),
            val: c.encode_value(),
        })
        .collect()
}

/// Text and binary values of an entry, attributes sorted by name.
fn search_entry(entry: ldap3::SearchEntry) -> SearchEntry {
    let mut attributes: Vec<PartialAttribute> = entry
        .attrs
        .into_iter()
        .map(|(name, values)| PartialAttribute {
            name,
            values: values.into_iter().map(String::into_bytes).collect(),
        })
        .chain(
            entry
                .bin_attrs
                .into_iter()
                .map(|(name, values)| PartialAttribute { name, values }),
        )
        .collect();
    attributes.sort_by(|a, b| a.name.cmp(&b.name));
    SearchEntry { dn: entry.dn, attributes }
}

fn scope(scope: Scope) -> ldap3::Scope {
    match scope {
        Scope::Base => ldap3::Scope::Base,
        Scope::OneLevel => ldap3::Scope::OneLevel,
        Scope::Subtree => ldap3::Scope::Subtree,
    }
}

fn deref_aliases(deref: DerefAliases) -> ldap3::DerefAliases {
    match deref {
        DerefAliases::Never => ldap3::DerefAliases::Never,
        DerefAliases::InSearching => ldap3::DerefAliases::Searching,
        DerefAliases::FindingBaseObject => ldap3::DerefAliases::Finding,
        DerefAliases::Always => ldap3::DerefAliases::Always,
    }
}

fn clamp_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use dsmlgw_proto::SortKey;

    use super::*;

    #[test]
    fn empty_matched_and_text_are_dropped() {
        let result = LdapResult {
            rc: 32,
            matched: String::new(),
            text: "no such entry".into(),
            refs: Vec::new(),
            ctrls: Vec::new(),
        };
        let converted = operation_result(result);
        assert_eq!(converted.code, ResultCode::NO_SUCH_OBJECT);
        assert_eq!(converted.matched_dn, None);
        assert_eq!(converted.error_message.as_deref(), Some("no such entry"));
    }

    #[test]
    fn io_errors_break_the_connection() {
        let error = LdapError::Io {
            source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        };
        let mapped = map_error(&error, None);
        assert!(matches!(mapped, DirectoryError::ConnectionClosed(_)));
        assert!(mapped.is_connection_fatal());
        assert_eq!(mapped.result_code(), ResultCode::UNAVAILABLE);
    }

    #[test]
    fn end_of_stream_breaks_the_connection() {
        let mapped = map_error(&LdapError::EndOfStream, Some(Duration::from_secs(5)));
        assert!(matches!(mapped, DirectoryError::ConnectionClosed(_)));
        assert!(mapped.is_connection_fatal());
    }

    #[test]
    fn filter_errors_keep_the_connection() {
        let mapped = map_error(&LdapError::FilterParsing, None);
        assert!(!mapped.is_connection_fatal());
    }

    #[test]
    fn sort_control_goes_on_the_wire() {
        let controls = vec![
            Control::Sort {
                keys: vec![SortKey { attribute: "sn".into(), ordering_rule: None, reverse: false }],
                critical: true,
            },
            Control::Unknown { oid: "1.2.3".into(), critical: false },
        ];
        let raw = raw_controls(&controls);
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].ctype, dsmlgw_proto::control::SORT_REQUEST_OID);
        assert!(raw[0].crit);
        assert_eq!(raw[0].val, controls[0].encode_value());
    }

    #[test]
    fn entries_merge_text_and_binary_values() {
        let entry = ldap3::SearchEntry {
            dn: "uid=bo,dc=example,dc=com".into(),
            attrs: HashMap::from([("sn".to_string(), vec!["Jensen".to_string()])]),
            bin_attrs: HashMap::from([("jpegPhoto".to_string(), vec![vec![0xff, 0xd8]])]),
        };
        let converted = search_entry(entry);
        assert_eq!(converted.attributes, vec![
            PartialAttribute { name: "jpegPhoto".into(), values: vec![vec![0xff, 0xd8]] },
            PartialAttribute { name: "sn".into(), values: vec![b"Jensen".to_vec()] },
        ]);
    }

    #[test]
    fn unknown_response_controls_pass_through() {
        let result = LdapResult {
            rc: 0,
            matched: String::new(),
            text: String::new(),
            refs: Vec::new(),
            ctrls: vec![ldap3::controls::Control(None, RawControl {
                ctype: "1.2.3.4".into(),
                crit: false,
                val: Some(vec![1, 2]),
            })],
        };
        assert_eq!(response_controls(&result), vec![ResponseControl::Other {
            oid: "1.2.3.4".into(),
            critical: false,
            value: Some(vec![1, 2]),
        }]);
    }

    #[test]
    fn scope_and_limits_translate() {
        assert!(matches!(scope(Scope::OneLevel), ldap3::Scope::OneLevel));
        assert!(matches!(
            deref_aliases(DerefAliases::FindingBaseObject),
            ldap3::DerefAliases::Finding
        ));
        assert_eq!(clamp_i32(u32::MAX), i32::MAX);
    }
}
