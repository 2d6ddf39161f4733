//! In-memory directory.
//!
//! A small directory information tree with enough behaviour to stand in for
//! a real server: filter evaluation, search scopes, server-side sort and
//! virtual list view, simple bind against `userPassword`, and the usual
//! update result codes. Matching is ASCII case-insensitive throughout.
//!
//! It also injects faults for tests: failing connects, an unreachable
//! directory, connections that break under the pool, and forced result
//! codes for chosen entries.
//!
//! DNs are normalized by trimming and lowercasing each RDN; escaped commas
//! are not supported.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use dsmlgw_proto::{
    AddRequest, CompareRequest, Control, DeleteRequest, ExtendedRequest, FilterNode,
    ModifyDnRequest, ModifyOperation, ModifyRequest, OperationResult, PartialAttribute,
    ResponseControl, ResultCode, Scope, SearchEntry, SearchRequest, SortKey, VirtualListView,
    VlvTarget, filter::SubstringFragment,
};
use tracing::trace;

use crate::directory::{
    Connector, Constraints, DirectoryConnection, DirectoryError, ExtendedOutcome, SearchOutcome,
};

/// "Who am I?" extended operation (RFC 4532).
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// VLV result code for a missing sort control.
const VLV_SORT_CONTROL_MISSING: u32 = 60;

/// One stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// DN as it was added.
    pub dn: String,
    /// Attributes in insertion order.
    pub attributes: Vec<PartialAttribute>,
}

impl Entry {
    /// Attribute by case-insensitive name.
    pub fn attribute(&self, name: &str) -> Option<&PartialAttribute> {
        self.attributes.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// First value of an attribute.
    pub fn first_value(&self, name: &str) -> Option<&[u8]> {
        self.attribute(name).and_then(|a| a.values.first()).map(Vec::as_slice)
    }

    fn values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.attribute(name).into_iter().flat_map(|a| a.values.iter().map(Vec::as_slice))
    }

    fn attribute_mut(&mut self, name: &str) -> Option<&mut PartialAttribute> {
        self.attributes.iter_mut().find(|a| a.name.eq_ignore_ascii_case(name))
    }

    fn has_value(&self, name: &str, value: &[u8]) -> bool {
        self.values(name).any(|v| v.eq_ignore_ascii_case(value))
    }

    fn add_value(&mut self, name: &str, value: &[u8]) {
        match self.attribute_mut(name) {
            Some(attr) => attr.values.push(value.to_vec()),
            None => self
                .attributes
                .push(PartialAttribute { name: name.to_string(), values: vec![value.to_vec()] }),
        }
    }

    fn remove_value(&mut self, name: &str, value: &[u8]) {
        if let Some(attr) = self.attribute_mut(name) {
            attr.values.retain(|v| !v.eq_ignore_ascii_case(value));
        }
        self.attributes.retain(|a| !a.values.is_empty());
    }
}

/// An operation observed by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Operation name (`bind`, `search`, `add`, ...).
    pub operation: &'static str,
    /// Target DN or extended OID.
    pub target: String,
    /// Proxied authorization identity in force.
    pub authorization: Option<String>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    entries: BTreeMap<String, Entry>,
    generation: u64,
    failing_connects: usize,
    unavailable: bool,
    forced: HashMap<String, ResultCode>,
    connections_opened: u64,
    audit: Vec<AuditRecord>,
}

impl DirectoryState {
    fn record(&mut self, operation: &'static str, target: &str, constraints: &Constraints) {
        trace!(operation, target, "memory directory operation");
        self.audit.push(AuditRecord {
            operation,
            target: target.to_string(),
            authorization: constraints.proxied_authorization.clone(),
        });
    }

    fn forced(&self, key: &str) -> Option<OperationResult> {
        self.forced
            .get(key)
            .map(|&code| OperationResult::error(code, format!("forced {} for {key}", code.descr())))
    }

    fn has_children(&self, key: &str) -> bool {
        self.entries.keys().any(|k| parent(k) == Some(key))
    }

    /// `noSuchObject` carrying the deepest existing ancestor as matched DN.
    fn no_such_object(&self, key: &str) -> OperationResult {
        let mut matched = parent(key);
        while let Some(candidate) = matched {
            if let Some(entry) = self.entries.get(candidate) {
                return OperationResult {
                    matched_dn: Some(entry.dn.clone()),
                    ..OperationResult::error(ResultCode::NO_SUCH_OBJECT, "no such entry")
                };
            }
            matched = parent(candidate);
        }
        OperationResult::error(ResultCode::NO_SUCH_OBJECT, "no such entry")
    }
}

/// Shared in-memory directory. Clones share the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MemoryDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an entry, replacing any entry with the same DN. No parent or
    /// schema checks are made.
    pub fn insert(&self, dn: &str, attributes: &[(&str, &[&str])]) {
        let attributes = attributes
            .iter()
            .map(|(name, values)| PartialAttribute {
                name: (*name).to_string(),
                values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
            })
            .collect();
        self.insert_entry(Entry { dn: dn.to_string(), attributes });
    }

    /// Store a prepared entry.
    pub fn insert_entry(&self, entry: Entry) {
        let key = normalize_dn(&entry.dn);
        self.lock().entries.insert(key, entry);
    }

    /// Look an entry up by DN.
    pub fn entry(&self, dn: &str) -> Option<Entry> {
        self.lock().entries.get(&normalize_dn(dn)).cloned()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Connector opening connections to this directory.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { directory: self.clone() }
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    /// Refuse (or accept again) every connection attempt.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Break every connection opened so far.
    pub fn break_connections(&self) {
        self.lock().generation += 1;
    }

    /// Answer every operation on `dn` with `code`.
    pub fn force_result(&self, dn: &str, code: ResultCode) {
        self.lock().forced.insert(normalize_dn(dn), code);
    }

    /// Number of successful connects.
    pub fn connections_opened(&self) -> u64 {
        self.lock().connections_opened
    }

    /// Operations observed so far, in order.
    ///
    /// The log is unbounded; long-lived directories should call
    /// [`Self::clear_audit`] between checks.
    pub fn audit(&self) -> Vec<AuditRecord> {
        self.lock().audit.clone()
    }

    /// Forget every recorded operation.
    pub fn clear_audit(&self) {
        self.lock().audit.clear();
    }
}

/// [`Connector`] for a [`MemoryDirectory`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    directory: MemoryDirectory,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, DirectoryError> {
        let mut state = self.directory.lock();
        if state.unavailable {
            return Err(DirectoryError::Connect("memory directory is unavailable".to_string()));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(DirectoryError::Connect("injected connect failure".to_string()));
        }
        state.connections_opened += 1;

        Ok(MemoryConnection {
            directory: self.directory.clone(),
            generation: state.generation,
            constraints: Constraints::default(),
            bound_dn: None,
            closed: false,
        })
    }
}

/// Connection to a [`MemoryDirectory`].
#[derive(Debug)]
pub struct MemoryConnection {
    directory: MemoryDirectory,
    generation: u64,
    constraints: Constraints,
    bound_dn: Option<String>,
    closed: bool,
}

impl MemoryConnection {
    /// Lock the directory, failing if this connection has been broken.
    fn open_state(&self) -> Result<MutexGuard<'_, DirectoryState>, DirectoryError> {
        let state = self.directory.lock();
        if self.closed || self.generation < state.generation {
            return Err(DirectoryError::ConnectionClosed("connection reset".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl DirectoryConnection for MemoryConnection {
    fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    fn set_constraints(&mut self, constraints: Constraints) {
        self.constraints = constraints;
    }

    fn is_broken(&self) -> bool {
        self.closed || self.generation < self.directory.lock().generation
    }

    async fn bind(&mut self, dn: &str, password: &str) -> Result<OperationResult, DirectoryError> {
        let result = {
            let mut state = self.open_state()?;
            state.record("bind", dn, &self.constraints);
            let key = normalize_dn(dn);

            if let Some(forced) = state.forced(&key) {
                forced
            } else if key.is_empty() {
                OperationResult::success()
            } else if password.is_empty() {
                OperationResult::error(
                    ResultCode::UNWILLING_TO_PERFORM,
                    "unauthenticated bind is not allowed",
                )
            } else if state
                .entries
                .get(&key)
                .is_some_and(|e| e.values("userPassword").any(|v| v == password.as_bytes()))
            {
                OperationResult::success()
            } else {
                OperationResult::new(ResultCode::INVALID_CREDENTIALS)
            }
        };

        if result.code.is_success() {
            self.bound_dn = Some(dn.to_string()).filter(|d| !d.is_empty());
        }
        Ok(result)
    }

    async fn search(
        &mut self,
        request: &SearchRequest,
        controls: &[Control],
    ) -> Result<SearchOutcome, DirectoryError> {
        let mut state = self.open_state()?;
        state.record("search", &request.dn, &self.constraints);
        let base = normalize_dn(&request.dn);

        if let Some(forced) = state.forced(&base) {
            return Ok(SearchOutcome::empty(forced));
        }
        if !base.is_empty() && !state.entries.contains_key(&base) {
            return Ok(SearchOutcome::empty(state.no_such_object(&base)));
        }

        let mut matched: Vec<&Entry> = state
            .entries
            .iter()
            .filter(|(key, _)| in_scope(key, &base, request.scope))
            .filter(|(_, entry)| matches(&request.filter, entry))
            .map(|(_, entry)| entry)
            .collect();

        let sort_keys = controls.iter().find_map(|c| match c {
            Control::Sort { keys, .. } => Some(keys.as_slice()),
            _ => None,
        });
        let view = controls.iter().find_map(|c| match c {
            Control::VirtualListView { view, .. } => Some(view),
            _ => None,
        });

        let mut response_controls = Vec::new();
        if let Some(keys) = sort_keys {
            matched.sort_by(|a, b| compare_by_keys(a, b, keys));
            response_controls.push(ResponseControl::SortResult { result: 0, attribute: None });
        }

        if let Some(view) = view {
            let Some(keys) = sort_keys else {
                response_controls.push(ResponseControl::VirtualListView {
                    target_position: 0,
                    content_count: 0,
                    result: VLV_SORT_CONTROL_MISSING,
                    context_id: None,
                });
                return Ok(SearchOutcome {
                    controls: response_controls,
                    ..SearchOutcome::empty(OperationResult::error(
                        ResultCode::UNWILLING_TO_PERFORM,
                        "virtual list view requires a sort control",
                    ))
                });
            };
            let (window, target) = vlv_window(&matched, view, keys);
            response_controls.push(ResponseControl::VirtualListView {
                target_position: clamp_i32(target),
                content_count: clamp_i32(matched.len()),
                result: 0,
                context_id: view.context_id.clone(),
            });
            matched = window;
        }

        let limit = match request.size_limit {
            0 => self.constraints.default_size_limit,
            n => n,
        };
        let mut result = OperationResult::success();
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        if limit > 0 && matched.len() > limit {
            matched.truncate(limit);
            result = OperationResult::error(ResultCode::SIZE_LIMIT_EXCEEDED, "size limit exceeded");
        }

        let entries = matched.into_iter().map(|e| project(e, request)).collect();
        Ok(SearchOutcome { entries, references: Vec::new(), result, controls: response_controls })
    }

    async fn add(&mut self, request: &AddRequest) -> Result<OperationResult, DirectoryError> {
        let mut state = self.open_state()?;
        state.record("add", &request.dn, &self.constraints);
        let key = normalize_dn(&request.dn);

        if let Some(forced) = state.forced(&key) {
            return Ok(forced);
        }
        let Some((rdn_attr, rdn_value)) = key_rdn(&request.dn) else {
            return Ok(OperationResult::error(ResultCode::INVALID_DN_SYNTAX, "invalid DN"));
        };
        if state.entries.contains_key(&key) {
            return Ok(OperationResult::new(ResultCode::ENTRY_ALREADY_EXISTS));
        }
        if let Some(parent_key) = parent(&key) {
            if !state.entries.contains_key(parent_key) {
                return Ok(state.no_such_object(&key));
            }
        }

        let mut entry = Entry { dn: request.dn.trim().to_string(), attributes: Vec::new() };
        for attr in &request.attributes {
            for value in &attr.values {
                if !entry.has_value(&attr.name, value) {
                    entry.add_value(&attr.name, value);
                }
            }
        }
        if !entry.has_value(&rdn_attr, rdn_value.as_bytes()) {
            entry.add_value(&rdn_attr, rdn_value.as_bytes());
        }

        state.entries.insert(key, entry);
        Ok(OperationResult::success())
    }

    async fn modify(&mut self, request: &ModifyRequest) -> Result<OperationResult, DirectoryError> {
        let mut state = self.open_state()?;
        state.record("modify", &request.dn, &self.constraints);
        let key = normalize_dn(&request.dn);

        if let Some(forced) = state.forced(&key) {
            return Ok(forced);
        }
        let Some(current) = state.entries.get(&key) else {
            return Ok(state.no_such_object(&key));
        };

        // Applied to a copy so a failing modification leaves the entry as it was.
        let mut entry = current.clone();
        for modification in &request.modifications {
            let attr = &modification.attribute;
            match modification.operation {
                ModifyOperation::Add => {
                    for value in &attr.values {
                        if entry.has_value(&attr.name, value) {
                            return Ok(OperationResult::error(
                                ResultCode::ATTRIBUTE_OR_VALUE_EXISTS,
                                format!("{} already has that value", attr.name),
                            ));
                        }
                        entry.add_value(&attr.name, value);
                    }
                },
                ModifyOperation::Delete => {
                    if entry.attribute(&attr.name).is_none() {
                        return Ok(OperationResult::error(
                            ResultCode::NO_SUCH_ATTRIBUTE,
                            format!("no attribute {}", attr.name),
                        ));
                    }
                    if attr.values.is_empty() {
                        entry.attributes.retain(|a| !a.name.eq_ignore_ascii_case(&attr.name));
                    }
                    for value in &attr.values {
                        if !entry.has_value(&attr.name, value) {
                            return Ok(OperationResult::error(
                                ResultCode::NO_SUCH_ATTRIBUTE,
                                format!("{} does not have that value", attr.name),
                            ));
                        }
                        entry.remove_value(&attr.name, value);
                    }
                },
                ModifyOperation::Replace => {
                    entry.attributes.retain(|a| !a.name.eq_ignore_ascii_case(&attr.name));
                    if !attr.values.is_empty() {
                        entry.attributes.push(attr.clone());
                    }
                },
            }
        }

        if let Some((rdn_attr, rdn_value)) = key_rdn(&entry.dn) {
            if !entry.has_value(&rdn_attr, rdn_value.as_bytes()) {
                return Ok(OperationResult::error(
                    ResultCode::NOT_ALLOWED_ON_RDN,
                    "cannot remove the RDN value",
                ));
            }
        }

        state.entries.insert(key, entry);
        Ok(OperationResult::success())
    }

    async fn delete(&mut self, request: &DeleteRequest) -> Result<OperationResult, DirectoryError> {
        let mut state = self.open_state()?;
        state.record("delete", &request.dn, &self.constraints);
        let key = normalize_dn(&request.dn);

        if let Some(forced) = state.forced(&key) {
            return Ok(forced);
        }
        if !state.entries.contains_key(&key) {
            return Ok(state.no_such_object(&key));
        }
        if state.has_children(&key) {
            return Ok(OperationResult::new(ResultCode::NOT_ALLOWED_ON_NON_LEAF));
        }

        state.entries.remove(&key);
        Ok(OperationResult::success())
    }

    async fn rename(
        &mut self,
        request: &ModifyDnRequest,
    ) -> Result<OperationResult, DirectoryError> {
        let mut state = self.open_state()?;
        state.record("modDN", &request.dn, &self.constraints);
        let key = normalize_dn(&request.dn);

        if let Some(forced) = state.forced(&key) {
            return Ok(forced);
        }
        let Some(current) = state.entries.get(&key) else {
            return Ok(state.no_such_object(&key));
        };
        if state.has_children(&key) {
            return Ok(OperationResult::new(ResultCode::NOT_ALLOWED_ON_NON_LEAF));
        }
        let Some((new_attr, new_value)) = key_rdn(&request.new_rdn) else {
            return Ok(OperationResult::error(ResultCode::INVALID_DN_SYNTAX, "invalid new RDN"));
        };

        let parent_dn = match &request.new_superior {
            Some(superior) => Some(superior.trim().to_string()),
            None => current.dn.split_once(',').map(|(_, p)| p.trim().to_string()),
        };
        if let Some(parent_dn) = &parent_dn {
            if !state.entries.contains_key(&normalize_dn(parent_dn)) {
                return Ok(OperationResult::error(ResultCode::NO_SUCH_OBJECT, "no such superior"));
            }
        }

        let new_dn = match &parent_dn {
            Some(p) => format!("{},{p}", request.new_rdn.trim()),
            None => request.new_rdn.trim().to_string(),
        };
        let new_key = normalize_dn(&new_dn);
        if new_key != key && state.entries.contains_key(&new_key) {
            return Ok(OperationResult::new(ResultCode::ENTRY_ALREADY_EXISTS));
        }

        let mut entry = current.clone();
        if request.delete_old_rdn {
            if let Some((old_attr, old_value)) = key_rdn(&entry.dn) {
                entry.remove_value(&old_attr, old_value.as_bytes());
            }
        }
        if !entry.has_value(&new_attr, new_value.as_bytes()) {
            entry.add_value(&new_attr, new_value.as_bytes());
        }
        entry.dn = new_dn;

        state.entries.remove(&key);
        state.entries.insert(new_key, entry);
        Ok(OperationResult::success())
    }

    async fn compare(
        &mut self,
        request: &CompareRequest,
    ) -> Result<OperationResult, DirectoryError> {
        let mut state = self.open_state()?;
        state.record("compare", &request.dn, &self.constraints);
        let key = normalize_dn(&request.dn);

        if let Some(forced) = state.forced(&key) {
            return Ok(forced);
        }
        let Some(entry) = state.entries.get(&key) else {
            return Ok(state.no_such_object(&key));
        };

        Ok(match entry.attribute(&request.attribute) {
            None => OperationResult::new(ResultCode::NO_SUCH_ATTRIBUTE),
            Some(_) if entry.has_value(&request.attribute, &request.value) => {
                OperationResult::new(ResultCode::COMPARE_TRUE)
            },
            Some(_) => OperationResult::new(ResultCode::COMPARE_FALSE),
        })
    }

    async fn extended(
        &mut self,
        request: &ExtendedRequest,
    ) -> Result<ExtendedOutcome, DirectoryError> {
        let mut state = self.open_state()?;
        state.record("extended", &request.oid, &self.constraints);

        if request.oid != WHOAMI_OID {
            return Ok(ExtendedOutcome {
                result: OperationResult::error(
                    ResultCode::PROTOCOL_ERROR,
                    format!("unsupported extended operation {}", request.oid),
                ),
                name: None,
                value: None,
            });
        }

        let authz_id = match (&self.constraints.proxied_authorization, &self.bound_dn) {
            (Some(proxied), _) => proxied.clone(),
            (None, Some(dn)) => format!("dn:{dn}"),
            (None, None) => String::new(),
        };
        Ok(ExtendedOutcome {
            result: OperationResult::success(),
            name: None,
            value: Some(authz_id.into_bytes()),
        })
    }

    async fn unbind(&mut self) -> Result<(), DirectoryError> {
        self.closed = true;
        Ok(())
    }
}

/// Lowercase each RDN and trim whitespace around separators.
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(str::trim)
        .filter(|rdn| !rdn.is_empty())
        .map(|rdn| match rdn.split_once('=') {
            Some((attr, value)) => {
                format!("{}={}", attr.trim().to_ascii_lowercase(), value.trim().to_lowercase())
            },
            None => rdn.to_lowercase(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn parent(key: &str) -> Option<&str> {
    key.split_once(',').map(|(_, p)| p)
}

/// Attribute and value of the leftmost RDN of `dn`.
fn key_rdn(dn: &str) -> Option<(String, String)> {
    let rdn = dn.split(',').next()?.trim();
    let (attr, value) = rdn.split_once('=')?;
    let (attr, value) = (attr.trim(), value.trim());
    if attr.is_empty() || value.is_empty() {
        return None;
    }
    Some((attr.to_string(), value.to_string()))
}

fn in_scope(key: &str, base: &str, scope: Scope) -> bool {
    match scope {
        Scope::Base => key == base,
        Scope::OneLevel => parent(key).unwrap_or("") == base && key != base,
        Scope::Subtree => {
            base.is_empty()
                || key == base
                || key.strip_suffix(base).is_some_and(|prefix| prefix.ends_with(','))
        },
    }
}

fn matches(filter: &FilterNode, entry: &Entry) -> bool {
    match filter {
        FilterNode::And(parts) => parts.iter().all(|f| matches(f, entry)),
        FilterNode::Or(parts) => parts.iter().any(|f| matches(f, entry)),
        FilterNode::Not(inner) => !matches(inner, entry),
        FilterNode::Equality(a) => entry.has_value(&a.attribute, &a.value),
        FilterNode::ApproxMatch(a) => {
            let wanted = squash(&a.value);
            entry.values(&a.attribute).any(|v| squash(v) == wanted)
        },
        FilterNode::GreaterOrEqual(a) => {
            entry.values(&a.attribute).any(|v| compare_values(v, &a.value) != Ordering::Less)
        },
        FilterNode::LessOrEqual(a) => {
            entry.values(&a.attribute).any(|v| compare_values(v, &a.value) != Ordering::Greater)
        },
        FilterNode::Present(attribute) => {
            attribute.eq_ignore_ascii_case("objectClass") || entry.attribute(attribute).is_some()
        },
        FilterNode::Substrings { attribute, fragments } => {
            entry.values(attribute).any(|v| substrings_match(&v.to_ascii_lowercase(), fragments))
        },
        FilterNode::ExtensibleMatch { attribute, value, .. } => match attribute {
            Some(attribute) => entry.has_value(attribute, value),
            None => entry
                .attributes
                .iter()
                .any(|a| a.values.iter().any(|v| v.eq_ignore_ascii_case(value))),
        },
    }
}

fn substrings_match(value: &[u8], fragments: &[SubstringFragment]) -> bool {
    let mut rest = value;
    for fragment in fragments {
        match fragment {
            SubstringFragment::Initial(p) => {
                let p = p.to_ascii_lowercase();
                if !rest.starts_with(&p) {
                    return false;
                }
                rest = &rest[p.len()..];
            },
            SubstringFragment::Any(p) => {
                let p = p.to_ascii_lowercase();
                if p.is_empty() {
                    continue;
                }
                match rest.windows(p.len()).position(|w| w == p.as_slice()) {
                    Some(at) => rest = &rest[at + p.len()..],
                    None => return false,
                }
            },
            SubstringFragment::Final(p) => {
                if !rest.ends_with(&p.to_ascii_lowercase()) {
                    return false;
                }
            },
        }
    }
    true
}

fn squash(value: &[u8]) -> Vec<u8> {
    value.iter().filter(|b| !b.is_ascii_whitespace()).map(u8::to_ascii_lowercase).collect()
}

/// Numeric when both sides are integers, case-insensitive bytes otherwise.
fn compare_values(a: &[u8], b: &[u8]) -> Ordering {
    let number = |v: &[u8]| std::str::from_utf8(v).ok().and_then(|s| s.trim().parse::<i64>().ok());
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()),
    }
}

/// Entries without a key value sort last regardless of direction.
fn compare_by_keys(a: &Entry, b: &Entry, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let ordering = match (a.first_value(&key.attribute), b.first_value(&key.attribute)) {
            (Some(x), Some(y)) => {
                let ordering = compare_values(x, y);
                if key.reverse { ordering.reverse() } else { ordering }
            },
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Select the VLV window from sorted entries; returns it with the 1-based
/// target position.
fn vlv_window<'a>(
    sorted: &[&'a Entry],
    view: &VirtualListView,
    keys: &[SortKey],
) -> (Vec<&'a Entry>, usize) {
    let count = sorted.len();
    let before = usize::try_from(view.before).unwrap_or(0);
    let after = usize::try_from(view.after).unwrap_or(0);

    let target = match &view.target {
        VlvTarget::ByOffset { offset, content_count } => {
            let offset = usize::try_from(*offset).unwrap_or(0).max(1);
            let estimate = usize::try_from(*content_count).unwrap_or(0);
            let scaled = if estimate > 0 && estimate != count {
                (offset - 1) * count / estimate + 1
            } else {
                offset
            };
            scaled.min(count.max(1))
        },
        VlvTarget::GreaterOrEqual(value) => {
            let first_key = keys.first().map_or("", |k| k.attribute.as_str());
            sorted
                .iter()
                .position(|e| {
                    e.first_value(first_key)
                        .is_some_and(|v| compare_values(v, value) != Ordering::Less)
                })
                .map_or(count + 1, |i| i + 1)
        },
    };

    if count == 0 {
        return (Vec::new(), target);
    }
    let start = target.saturating_sub(before).max(1);
    let end = target.saturating_add(after).min(count);
    let window = if start <= end { sorted[start - 1..end].to_vec() } else { Vec::new() };
    (window, target)
}

fn clamp_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn project(entry: &Entry, request: &SearchRequest) -> SearchEntry {
    let wanted = &request.attributes;
    let all = wanted.is_empty() || wanted.iter().any(|a| a == "*");
    let attributes = entry
        .attributes
        .iter()
        .filter(|a| all || wanted.iter().any(|w| w.eq_ignore_ascii_case(&a.name)))
        .map(|a| PartialAttribute {
            name: a.name.clone(),
            values: if request.types_only { Vec::new() } else { a.values.clone() },
        })
        .collect();
    SearchEntry { dn: entry.dn.clone(), attributes }
}

#[cfg(test)]
mod tests {
    use dsmlgw_proto::{DerefAliases, Element, filter::Assertion};

    use super::*;

    fn seeded() -> MemoryDirectory {
        let dir = MemoryDirectory::new();
        dir.insert("dc=example,dc=com", &[("objectClass", &["domain"]), ("dc", &["example"])]);
        dir.insert("ou=people,dc=example,dc=com", &[("ou", &["people"])]);
        for (uid, cn, age) in [("alex", "Alexander", "41"), ("bo", "Bo", "29"), ("cy", "Cy", "35")] {
            dir.insert(&format!("uid={uid},ou=people,dc=example,dc=com"), &[
                ("uid", &[uid]),
                ("cn", &[cn]),
                ("age", &[age]),
                ("userPassword", &["secret"]),
            ]);
        }
        dir
    }

    fn search(filter: &str, scope: Scope) -> SearchRequest {
        let filter = Element::parse(&format!("<filter>{filter}</filter>")).unwrap();
        SearchRequest {
            dn: "ou=people,dc=example,dc=com".into(),
            scope,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: FilterNode::from_filter(&filter).unwrap(),
            attributes: Vec::new(),
        }
    }

    fn dns(outcome: &SearchOutcome) -> Vec<&str> {
        outcome.entries.iter().map(|e| e.dn.as_str()).collect()
    }

    #[test]
    fn normalize_dn_folds_case_and_space() {
        assert_eq!(normalize_dn("UID=Bo , OU=People,dc=Example"), "uid=bo,ou=people,dc=example");
        assert_eq!(normalize_dn(""), "");
    }

    #[test]
    fn scopes() {
        let base = "ou=people,dc=x";
        assert!(in_scope("ou=people,dc=x", base, Scope::Base));
        assert!(in_scope("uid=a,ou=people,dc=x", base, Scope::OneLevel));
        assert!(!in_scope("cn=b,uid=a,ou=people,dc=x", base, Scope::OneLevel));
        assert!(in_scope("cn=b,uid=a,ou=people,dc=x", base, Scope::Subtree));
        assert!(!in_scope("uid=a,xou=people,dc=x", base, Scope::Subtree));
    }

    #[test]
    fn substring_fragments_match_in_order() {
        let fragments = vec![
            SubstringFragment::Initial(b"Al".to_vec()),
            SubstringFragment::Any(b"ex".to_vec()),
            SubstringFragment::Final(b"er".to_vec()),
        ];
        assert!(substrings_match(b"alexander", &fragments));
        assert!(!substrings_match(b"alexandra", &fragments));
    }

    #[test]
    fn numeric_ordering() {
        assert_eq!(compare_values(b"9", b"10"), Ordering::Less);
        assert_eq!(compare_values(b"b", b"A"), Ordering::Greater);
    }

    #[tokio::test]
    async fn search_filters_and_projects() {
        let dir = seeded();
        let mut conn = dir.connector().connect().await.unwrap();
        let mut request = search(r#"<greaterOrEqual name="age"><value>30</value></greaterOrEqual>"#, Scope::OneLevel);
        request.attributes = vec!["CN".into()];

        let outcome = conn.search(&request, &[]).await.unwrap();
        assert_eq!(dns(&outcome), vec![
            "uid=alex,ou=people,dc=example,dc=com",
            "uid=cy,ou=people,dc=example,dc=com"
        ]);
        assert_eq!(outcome.entries[0].attributes.len(), 1);
        assert_eq!(outcome.entries[0].attributes[0].name, "cn");
    }

    #[tokio::test]
    async fn audit_records_until_cleared() {
        let dir = seeded();
        let mut conn = dir.connector().connect().await.unwrap();
        conn.search(&search("<present name=\"uid\"/>", Scope::OneLevel), &[]).await.unwrap();
        assert_eq!(dir.audit().len(), 1);
        assert_eq!(dir.audit()[0].operation, "search");

        dir.clear_audit();
        assert!(dir.audit().is_empty());

        conn.search(&search("<present name=\"cn\"/>", Scope::OneLevel), &[]).await.unwrap();
        assert_eq!(dir.audit().len(), 1);
    }

    #[tokio::test]
    async fn sort_and_vlv_window() {
        let dir = seeded();
        let mut conn = dir.connector().connect().await.unwrap();
        let request = search(r#"<present name="uid"/>"#, Scope::OneLevel);
        let controls = vec![
            Control::Sort {
                keys: vec![SortKey { attribute: "age".into(), ordering_rule: None, reverse: true }],
                critical: true,
            },
            Control::VirtualListView {
                view: VirtualListView {
                    before: 0,
                    after: 1,
                    target: VlvTarget::ByOffset { offset: 2, content_count: 0 },
                    context_id: None,
                },
                critical: false,
            },
        ];

        let outcome = conn.search(&request, &controls).await.unwrap();
        // Ages descending: 41 (alex), 35 (cy), 29 (bo); window starts at the second.
        assert_eq!(dns(&outcome), vec![
            "uid=cy,ou=people,dc=example,dc=com",
            "uid=bo,ou=people,dc=example,dc=com"
        ]);
        assert!(outcome.controls.contains(&ResponseControl::VirtualListView {
            target_position: 2,
            content_count: 3,
            result: 0,
            context_id: None,
        }));
    }

    #[tokio::test]
    async fn vlv_without_sort_is_refused() {
        let dir = seeded();
        let mut conn = dir.connector().connect().await.unwrap();
        let request = search(r#"<present name="uid"/>"#, Scope::OneLevel);
        let controls = vec![Control::VirtualListView {
            view: VirtualListView {
                before: 0,
                after: 0,
                target: VlvTarget::GreaterOrEqual(b"b".to_vec()),
                context_id: None,
            },
            critical: true,
        }];

        let outcome = conn.search(&request, &controls).await.unwrap();
        assert_eq!(outcome.result.code, ResultCode::UNWILLING_TO_PERFORM);
        assert!(outcome.entries.is_empty());
    }

    #[tokio::test]
    async fn size_limit_truncates() {
        let dir = seeded();
        let mut conn = dir.connector().connect().await.unwrap();
        let mut request = search(r#"<present name="uid"/>"#, Scope::Subtree);
        request.size_limit = 2;

        let outcome = conn.search(&request, &[]).await.unwrap();
        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.result.code, ResultCode::SIZE_LIMIT_EXCEEDED);
    }

    #[tokio::test]
    async fn missing_base_reports_matched_dn() {
        let dir = seeded();
        let mut conn = dir.connector().connect().await.unwrap();
        let mut request = search(r#"<present name="uid"/>"#, Scope::Subtree);
        request.dn = "ou=groups,dc=example,dc=com".into();

        let outcome = conn.search(&request, &[]).await.unwrap();
        assert_eq!(outcome.result.code, ResultCode::NO_SUCH_OBJECT);
        assert_eq!(outcome.result.matched_dn.as_deref(), Some("dc=example,dc=com"));
    }

    #[tokio::test]
    async fn update_result_codes() {
        let dir = seeded();
        let mut conn = dir.connector().connect().await.unwrap();

        let add = AddRequest { dn: "uid=bo,ou=people,dc=example,dc=com".into(), attributes: vec![] };
        assert_eq!(conn.add(&add).await.unwrap().code, ResultCode::ENTRY_ALREADY_EXISTS);

        let orphan = AddRequest { dn: "uid=x,ou=nowhere,dc=example,dc=com".into(), attributes: vec![] };
        assert_eq!(conn.add(&orphan).await.unwrap().code, ResultCode::NO_SUCH_OBJECT);

        let delete = DeleteRequest { dn: "ou=people,dc=example,dc=com".into() };
        assert_eq!(conn.delete(&delete).await.unwrap().code, ResultCode::NOT_ALLOWED_ON_NON_LEAF);

        let compare = CompareRequest {
            dn: "uid=bo,ou=people,dc=example,dc=com".into(),
            attribute: "cn".into(),
            value: b"BO".to_vec(),
        };
        assert_eq!(conn.compare(&compare).await.unwrap().code, ResultCode::COMPARE_TRUE);
    }

    #[tokio::test]
    async fn modify_is_all_or_nothing() {
        let dir = seeded();
        let mut conn = dir.connector().connect().await.unwrap();
        let dn = "uid=bo,ou=people,dc=example,dc=com";
        let request = ModifyRequest {
            dn: dn.into(),
            modifications: vec![
                dsmlgw_proto::Modification {
                    operation: ModifyOperation::Replace,
                    attribute: PartialAttribute { name: "cn".into(), values: vec![b"Robert".to_vec()] },
                },
                dsmlgw_proto::Modification {
                    operation: ModifyOperation::Delete,
                    attribute: PartialAttribute { name: "mail".into(), values: vec![] },
                },
            ],
        };

        assert_eq!(conn.modify(&request).await.unwrap().code, ResultCode::NO_SUCH_ATTRIBUTE);
        assert_eq!(dir.entry(dn).unwrap().first_value("cn"), Some(&b"Bo"[..]));
    }

    #[tokio::test]
    async fn rename_moves_rdn_value() {
        let dir = seeded();
        let mut conn = dir.connector().connect().await.unwrap();
        let request = ModifyDnRequest {
            dn: "uid=bo,ou=people,dc=example,dc=com".into(),
            new_rdn: "uid=robert".into(),
            delete_old_rdn: true,
            new_superior: None,
        };

        assert!(conn.rename(&request).await.unwrap().code.is_success());
        let entry = dir.entry("uid=robert,ou=people,dc=example,dc=com").unwrap();
        assert_eq!(entry.attribute("uid").unwrap().values, vec![b"robert".to_vec()]);
        assert!(dir.entry("uid=bo,ou=people,dc=example,dc=com").is_none());
    }

    #[tokio::test]
    async fn bind_checks_password() {
        let dir = seeded();
        let mut conn = dir.connector().connect().await.unwrap();
        let dn = "uid=cy,ou=people,dc=example,dc=com";
        assert!(conn.bind(dn, "secret").await.unwrap().code.is_success());
        assert_eq!(conn.bind(dn, "wrong").await.unwrap().code, ResultCode::INVALID_CREDENTIALS);
        assert_eq!(conn.bind(dn, "").await.unwrap().code, ResultCode::UNWILLING_TO_PERFORM);
    }

    #[tokio::test]
    async fn broken_connections_fail_operations() {
        let dir = seeded();
        let mut conn = dir.connector().connect().await.unwrap();
        dir.break_connections();

        assert!(conn.is_broken());
        let err = conn.delete(&DeleteRequest { dn: "uid=bo".into() }).await.unwrap_err();
        assert!(err.is_connection_fatal());
    }

    #[tokio::test]
    async fn injected_connect_failures() {
        let dir = seeded();
        dir.fail_next_connects(1);
        assert!(dir.connector().connect().await.is_err());
        assert!(dir.connector().connect().await.is_ok());
        assert_eq!(dir.connections_opened(), 1);
    }

    #[test]
    fn extensible_match_without_attribute_checks_all_values() {
        let entry = Entry {
            dn: "cn=a".into(),
            attributes: vec![PartialAttribute { name: "sn".into(), values: vec![b"Jensen".to_vec()] }],
        };
        let filter = FilterNode::ExtensibleMatch {
            attribute: None,
            matching_rule: Some("caseIgnoreMatch".into()),
            dn_attributes: false,
            value: b"jensen".to_vec(),
        };
        assert!(matches(&filter, &entry));
        assert!(!matches(
            &FilterNode::Equality(Assertion { attribute: "cn".into(), value: b"x".to_vec() }),
            &entry
        ));
    }
}
