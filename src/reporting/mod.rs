//! Change-notification routing.
//!
//! The data layer reports "this remote state changed" by marking an
//! attribute path dirty. The router forwards each notification
//! synchronously to the external reporting engine's [`ReportSink`];
//! nothing is stored here (fire-and-forget).
//!
//! `mark_dirty` must be invoked only from the single
//! protocol-processing context: it triggers downstream
//! subscription-reporting bookkeeping that is not internally
//! synchronized.

use std::fmt;

use crate::error::{D2dError, Result};

/// Endpoint identifier within a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub u16);

/// Cluster identifier within an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterId(pub u32);

/// Attribute identifier within a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeId(pub u32);

/// An attribute path with optional wildcards.
///
/// `None` at any granularity means "every id at this level". A fully
/// concrete path names exactly one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributePath {
    /// Endpoint, or `None` for every endpoint
    pub endpoint: Option<EndpointId>,
    /// Cluster, or `None` for every cluster
    pub cluster: Option<ClusterId>,
    /// Attribute, or `None` for every attribute
    pub attribute: Option<AttributeId>,
}

impl AttributePath {
    /// Path naming exactly one attribute
    pub fn concrete(endpoint: EndpointId, cluster: ClusterId, attribute: AttributeId) -> Self {
        Self {
            endpoint: Some(endpoint),
            cluster: Some(cluster),
            attribute: Some(attribute),
        }
    }

    /// Path matching every attribute on the node
    pub fn wildcard() -> Self {
        Self {
            endpoint: None,
            cluster: None,
            attribute: None,
        }
    }

    /// Whether any component is wildcarded
    pub fn is_wildcard(&self) -> bool {
        self.endpoint.is_none() || self.cluster.is_none() || self.attribute.is_none()
    }

    /// Whether this path intersects `other`: at each granularity the
    /// ids are equal or at least one side is wildcarded.
    pub fn matches(&self, other: &AttributePath) -> bool {
        fn level<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(x), Some(y)) => x == y,
                _ => true,
            }
        }
        level(&self.endpoint, &other.endpoint)
            && level(&self.cluster, &other.cluster)
            && level(&self.attribute, &other.attribute)
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn part(f: &mut fmt::Formatter<'_>, value: Option<u32>) -> fmt::Result {
            match value {
                Some(v) => write!(f, "{v:#x}"),
                None => write!(f, "*"),
            }
        }
        part(f, self.endpoint.map(|e| u32::from(e.0)))?;
        write!(f, "/")?;
        part(f, self.cluster.map(|c| c.0))?;
        write!(f, "/")?;
        part(f, self.attribute.map(|a| a.0))
    }
}

/// External reporting engine consuming dirty-path notifications.
pub trait ReportSink {
    /// A (possibly wildcarded) attribute path changed and needs
    /// re-reporting to observers
    fn attribute_dirty(&mut self, path: &AttributePath) -> std::result::Result<(), String>;
}

/// Router forwarding dirty-path events to the reporting engine.
pub struct ChangeRouter {
    sink: Box<dyn ReportSink>,
    forwarded: u64,
}

impl ChangeRouter {
    /// Create a router forwarding into `sink`
    pub fn new(sink: Box<dyn ReportSink>) -> Self {
        Self { sink, forwarded: 0 }
    }

    /// Forward a dirty-path notification synchronously.
    pub fn mark_dirty(&mut self, path: AttributePath) -> Result<()> {
        tracing::trace!("Attribute path {} marked dirty", path);
        self.sink
            .attribute_dirty(&path)
            .map_err(D2dError::ReportSink)?;
        self.forwarded += 1;
        Ok(())
    }

    /// Notifications forwarded since startup
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

impl fmt::Debug for ChangeRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeRouter")
            .field("forwarded", &self.forwarded)
            .finish_non_exhaustive()
    }
}
