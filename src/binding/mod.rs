//! Source bindings: directional downstream → upstream links.
//!
//! Bindings form a directed graph over streams. The graph must stay
//! acyclic; a stream sourcing from itself is the smallest cycle.

use std::collections::{HashMap, HashSet};
use std::fmt;

use uuid::Uuid;

use crate::account::AccountId;
use crate::bridge::{BridgeError, ExternalApiAddress};
use crate::config::SourceConfig;
use crate::error::ErrorKind;
use crate::registry::StreamError;
use crate::subject::{SubjectError, SubjectFilter};

/// Namespace for binding ids.
const BINDING_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x0e, 0x3c, 0x1d, 0x52, 0x8a, 0x4f, 0x11, 0x9d, 0x3e, 0x7a, 0x45, 0xc2, 0x10, 0x88, 0x6f,
]);

/// Source binding errors.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("Circular sourcing: {0}")]
    CircularSourcing(String),

    #[error("Upstream stream not found: {0}")]
    UpstreamNotFound(String),

    #[error("Incompatible retention on {stream}: {reason}")]
    IncompatibleRetention { stream: String, reason: String },

    #[error("Binding already exists: {0}")]
    DuplicateBinding(String),

    #[error("Downstream stream not found: {0}")]
    DownstreamNotFound(String),

    #[error("Binding not found: {0}")]
    NotFound(BindingId),

    #[error("Account {account} reached its limit of {max} source bindings")]
    LimitExceeded { account: String, max: u64 },

    #[error("Invalid source filter: {0}")]
    InvalidFilter(#[from] SubjectError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl BindingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BindingError::CircularSourcing(_)
            | BindingError::IncompatibleRetention { .. }
            | BindingError::DuplicateBinding(_) => ErrorKind::Configuration,
            BindingError::UpstreamNotFound(_)
            | BindingError::DownstreamNotFound(_)
            | BindingError::NotFound(_) => ErrorKind::NotFound,
            BindingError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            BindingError::InvalidFilter(_) => ErrorKind::InvalidRequest,
            BindingError::Bridge(e) => e.kind(),
            BindingError::Stream(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BindingError>;

/// A stream, named by its owning account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub account: AccountId,
    pub stream: String,
}

impl StreamKey {
    pub fn new(account: AccountId, stream: impl Into<String>) -> Self {
        Self {
            account,
            stream: stream.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.account, self.stream)
    }
}

/// Where a binding reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpstreamRef {
    /// A stream of the downstream's own account.
    Local { stream: String },
    /// A stream exported through another account's external API.
    External {
        address: ExternalApiAddress,
        stream: String,
    },
}

impl UpstreamRef {
    pub fn stream(&self) -> &str {
        match self {
            UpstreamRef::Local { stream } | UpstreamRef::External { stream, .. } => stream,
        }
    }

    /// Graph node of the upstream, given the downstream's account.
    pub fn key(&self, downstream_account: &AccountId) -> StreamKey {
        match self {
            UpstreamRef::Local { stream } => StreamKey::new(downstream_account.clone(), stream),
            UpstreamRef::External { address, stream } => StreamKey::new(address.account(), stream),
        }
    }
}

impl fmt::Display for UpstreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamRef::Local { stream } => f.write_str(stream),
            UpstreamRef::External { address, stream } => write!(f, "{address}/{stream}"),
        }
    }
}

/// Stable binding identity.
///
/// Derived from the downstream, the upstream and the filter, so a binding
/// recreated after a restart finds its cursor again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(Uuid);

impl BindingId {
    pub fn derive(downstream: &StreamKey, upstream: &UpstreamRef, filter: Option<&SubjectFilter>) -> Self {
        let name = format!(
            "{downstream}<-{upstream}|{}",
            filter.map(SubjectFilter::as_str).unwrap_or(">")
        );
        Self(Uuid::new_v5(&BINDING_NAMESPACE, name.as_bytes()))
    }

    /// Key used in the cursor store.
    pub fn cursor_key(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything needed to create a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub downstream: StreamKey,
    pub upstream: UpstreamRef,
    /// `None` admits everything.
    pub filter: Option<SubjectFilter>,
    /// Prefix the bridge delivers under; stripped again on ingest.
    pub deliver: Option<String>,
}

impl BindingSpec {
    pub fn new(downstream: StreamKey, upstream: UpstreamRef) -> Self {
        Self {
            downstream,
            upstream,
            filter: None,
            deliver: None,
        }
    }

    /// Narrow to `filter`. `>` is the same as no filter.
    pub fn with_filter(mut self, filter: &str) -> Result<Self> {
        let filter = SubjectFilter::new(filter)?;
        self.filter = (!filter.is_all()).then_some(filter);
        Ok(self)
    }

    pub fn with_deliver(mut self, deliver: impl Into<String>) -> Self {
        self.deliver = Some(deliver.into());
        self
    }

    /// Binding for one `sources` entry of a stream definition.
    pub fn from_source(downstream: StreamKey, source: &SourceConfig) -> Result<Self> {
        let upstream = match &source.external {
            Some(external) => UpstreamRef::External {
                address: ExternalApiAddress::parse(&external.api)?,
                stream: source.name.clone(),
            },
            None => UpstreamRef::Local {
                stream: source.name.clone(),
            },
        };
        let mut spec = Self::new(downstream, upstream);
        if let Some(filter) = &source.filter_subject {
            spec = spec.with_filter(filter)?;
        }
        if let Some(deliver) = source.external.as_ref().and_then(|e| e.deliver.clone()) {
            spec = spec.with_deliver(deliver);
        }
        Ok(spec)
    }

    pub fn id(&self) -> BindingId {
        BindingId::derive(&self.downstream, &self.upstream, self.filter.as_ref())
    }

    pub fn upstream_key(&self) -> StreamKey {
        self.upstream.key(&self.downstream.account)
    }
}

/// Downstream → upstream edges of every active binding.
#[derive(Debug, Default)]
pub struct BindingGraph {
    edges: HashMap<BindingId, (StreamKey, StreamKey)>,
}

impl BindingGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &BindingId) -> bool {
        self.edges.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// The path that adding `downstream → upstream` would close, if any.
    ///
    /// The returned path starts and ends at `downstream`.
    pub fn cycle_through(&self, downstream: &StreamKey, upstream: &StreamKey) -> Option<Vec<StreamKey>> {
        if downstream == upstream {
            return Some(vec![downstream.clone(), upstream.clone()]);
        }

        let mut adjacency: HashMap<&StreamKey, Vec<&StreamKey>> = HashMap::new();
        for (from, to) in self.edges.values() {
            adjacency.entry(from).or_default().push(to);
        }

        // Depth-first search from the new upstream back to the downstream.
        let mut visited = HashSet::new();
        let mut stack = vec![vec![upstream]];
        while let Some(path) = stack.pop() {
            let Some(&node) = path.last() else {
                continue;
            };
            if node == downstream {
                let mut cycle = vec![downstream.clone()];
                cycle.extend(path.into_iter().cloned());
                return Some(cycle);
            }
            if !visited.insert(node) {
                continue;
            }
            for &next in adjacency.get(node).into_iter().flatten() {
                let mut extended = path.clone();
                extended.push(next);
                stack.push(extended);
            }
        }
        None
    }

    /// Add an edge, refusing one that would close a cycle.
    pub fn insert(&mut self, id: BindingId, downstream: StreamKey, upstream: StreamKey) -> Result<()> {
        if let Some(cycle) = self.cycle_through(&downstream, &upstream) {
            let path: Vec<String> = cycle.iter().map(StreamKey::to_string).collect();
            return Err(BindingError::CircularSourcing(path.join(" -> ")));
        }
        if self.edges.contains_key(&id) {
            return Err(BindingError::DuplicateBinding(format!("{downstream} <- {upstream}")));
        }
        self.edges.insert(id, (downstream, upstream));
        Ok(())
    }

    pub fn remove(&mut self, id: &BindingId) -> bool {
        self.edges.remove(id).is_some()
    }

    /// Bindings into or out of `key`.
    pub fn touching(&self, key: &StreamKey) -> Vec<BindingId> {
        self.edges
            .iter()
            .filter(|(_, (from, to))| from == key || to == key)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Bindings whose downstream belongs to `account`.
    pub fn owned_by(&self, account: &AccountId) -> usize {
        self.edges
            .values()
            .filter(|(from, _)| &from.account == account)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;

    fn key(account: &str, stream: &str) -> StreamKey {
        StreamKey::new(AccountId::from(account), stream)
    }

    fn local(stream: &str) -> UpstreamRef {
        UpstreamRef::Local {
            stream: stream.to_string(),
        }
    }

    fn link(graph: &mut BindingGraph, down: StreamKey, up: StreamKey) -> Result<BindingId> {
        let id = BindingId::derive(&down, &local(&up.to_string()), None);
        graph.insert(id, down, up)?;
        Ok(id)
    }

    #[test]
    fn test_self_sourcing_is_a_cycle() {
        let mut graph = BindingGraph::new();
        let err = link(&mut graph, key("a", "s"), key("a", "s")).unwrap_err();
        assert!(matches!(err, BindingError::CircularSourcing(_)));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_two_stream_cycle_rejected() {
        let mut graph = BindingGraph::new();
        link(&mut graph, key("testB", "testB"), key("testA", "testA")).unwrap();

        let err = link(&mut graph, key("testA", "testA"), key("testB", "testB")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(
            err.to_string(),
            "Circular sourcing: testA.testA -> testB.testB -> testA.testA"
        );
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_long_cycle_rejected_and_diamond_allowed() {
        let mut graph = BindingGraph::new();
        link(&mut graph, key("x", "b"), key("x", "a")).unwrap();
        link(&mut graph, key("x", "c"), key("x", "a")).unwrap();
        link(&mut graph, key("x", "d"), key("x", "b")).unwrap();
        link(&mut graph, key("x", "d"), key("x", "c")).unwrap();

        assert!(link(&mut graph, key("x", "a"), key("x", "d")).is_err());
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_removed_edge_no_longer_blocks() {
        let mut graph = BindingGraph::new();
        let id = link(&mut graph, key("x", "b"), key("x", "a")).unwrap();
        assert!(graph.remove(&id));
        link(&mut graph, key("x", "a"), key("x", "b")).unwrap();
    }

    #[test]
    fn test_touching_and_owned_by() {
        let mut graph = BindingGraph::new();
        let ab = link(&mut graph, key("x", "b"), key("x", "a")).unwrap();
        let bc = link(&mut graph, key("y", "c"), key("x", "b")).unwrap();

        let mut touching = graph.touching(&key("x", "b"));
        touching.sort();
        let mut expected = vec![ab, bc];
        expected.sort();
        assert_eq!(touching, expected);
        assert_eq!(graph.owned_by(&AccountId::from("x")), 1);
    }

    #[test]
    fn test_binding_id_is_stable_and_filter_sensitive() {
        let down = key("testB", "testB");
        let up = local("testA");
        let all = BindingId::derive(&down, &up, None);
        assert_eq!(all, BindingId::derive(&down, &up, None));

        let filter = SubjectFilter::new("foo.b").unwrap();
        assert_ne!(all, BindingId::derive(&down, &up, Some(&filter)));
    }

    #[test]
    fn test_spec_from_external_source() {
        let source = SourceConfig::external("testA", "$JS.testA.API")
            .with_filter(">")
            .with_deliver("testB");
        let spec = BindingSpec::from_source(key("testB", "testB"), &source).unwrap();

        assert_eq!(spec.filter, None);
        assert_eq!(spec.deliver.as_deref(), Some("testB"));
        assert_eq!(spec.upstream_key(), key("testA", "testA"));
    }

    #[test]
    fn test_spec_rejects_bad_address_and_filter() {
        let bad_address = SourceConfig::external("testA", "testA.API");
        assert_eq!(
            BindingSpec::from_source(key("b", "b"), &bad_address)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidRequest
        );

        let bad_filter = SourceConfig::local("a").with_filter("foo.>.bar");
        assert!(matches!(
            BindingSpec::from_source(key("b", "b"), &bad_filter),
            Err(BindingError::InvalidFilter(_))
        ));
    }
}
