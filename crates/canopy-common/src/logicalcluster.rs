//! Logical cluster names and cluster-aware keys
//!
//! Every object lives in a logical cluster named by a colon-separated path
//! (`root:acme:team`). The name is carried in the
//! [`LOGICAL_CLUSTER_ANNOTATION`](crate::LOGICAL_CLUSTER_ANNOTATION); objects
//! without it belong to `root`.
//!
//! Caches and work queues address objects by a [`ClusterAwareKey`] of the form
//! `<logical-cluster>|<name>`.

use std::fmt;

use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, LOGICAL_CLUSTER_ANNOTATION};

/// Name of the root logical cluster
pub const ROOT: &str = "root";

const SEPARATOR: char = ':';
const KEY_SEPARATOR: char = '|';

/// A logical cluster path such as `root:acme`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalCluster(String);

impl LogicalCluster {
    /// Wrap a logical cluster path
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The root logical cluster
    pub fn root() -> Self {
        Self(ROOT.to_string())
    }

    /// Read the logical cluster of an object, defaulting to root
    pub fn from_object<K: ResourceExt>(obj: &K) -> Self {
        obj.annotations()
            .get(LOGICAL_CLUSTER_ANNOTATION)
            .filter(|v| !v.is_empty())
            .map(|v| Self(v.clone()))
            .unwrap_or_else(Self::root)
    }

    /// The path as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for `root`
    pub fn is_root(&self) -> bool {
        self.0 == ROOT
    }

    /// Parent path, `None` for a single-segment cluster
    ///
    /// ```
    /// use canopy_common::LogicalCluster;
    /// let lc = LogicalCluster::new("root:acme:team");
    /// assert_eq!(lc.parent(), Some(LogicalCluster::new("root:acme")));
    /// assert_eq!(LogicalCluster::root().parent(), None);
    /// ```
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rfind(SEPARATOR)
            .map(|idx| Self(self.0[..idx].to_string()))
    }

    /// Last path segment
    pub fn base(&self) -> &str {
        match self.0.rfind(SEPARATOR) {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Append a segment (e.g. a workspace name) to this path
    pub fn join(&self, segment: &str) -> Self {
        Self(format!("{}{}{}", self.0, SEPARATOR, segment))
    }

    /// The organization this cluster belongs to, if any
    ///
    /// `root:acme:team` belongs to `root:acme`; `root` itself has none.
    pub fn organization(&self) -> Option<Self> {
        let mut parts = self.0.splitn(3, SEPARATOR);
        match (parts.next(), parts.next()) {
            (Some(ROOT), Some(org)) => Some(Self::root().join(org)),
            _ => None,
        }
    }
}

impl fmt::Display for LogicalCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LogicalCluster {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Stable `<logical-cluster>|<name>` key used by caches and queues
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterAwareKey {
    /// Logical cluster the object belongs to
    pub cluster: LogicalCluster,
    /// Object name, `<namespace>/<name>` for namespaced kinds
    pub name: String,
}

impl ClusterAwareKey {
    /// Build a key from its parts
    pub fn new(cluster: LogicalCluster, name: impl Into<String>) -> Self {
        Self {
            cluster,
            name: name.into(),
        }
    }

    /// Derive the key of an object from its annotation, namespace and name
    pub fn from_object<K: ResourceExt>(obj: &K) -> Self {
        let name = match obj.namespace() {
            Some(ns) => format!("{ns}/{}", obj.name_any()),
            None => obj.name_any(),
        };
        Self::new(LogicalCluster::from_object(obj), name)
    }

    /// Decode a `<logical-cluster>|<name>` string
    ///
    /// ```
    /// use canopy_common::ClusterAwareKey;
    /// let key = ClusterAwareKey::parse("root:acme|ns-a").unwrap();
    /// assert_eq!(key.cluster.as_str(), "root:acme");
    /// assert_eq!(key.name, "ns-a");
    /// assert!(ClusterAwareKey::parse("ns-a").is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Self> {
        let (cluster, name) = raw
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| Error::malformed_key(raw, "missing '|' separator"))?;
        if cluster.is_empty() || name.is_empty() {
            return Err(Error::malformed_key(raw, "empty cluster or name"));
        }
        Ok(Self::new(LogicalCluster::new(cluster), name))
    }
}

impl fmt::Display for ClusterAwareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.cluster, KEY_SEPARATOR, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn namespace(name: &str, cluster: Option<&str>) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: cluster.map(|c| {
                    BTreeMap::from([(LOGICAL_CLUSTER_ANNOTATION.to_string(), c.to_string())])
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn objects_without_annotation_live_in_root() {
        let ns = namespace("default", None);
        assert!(LogicalCluster::from_object(&ns).is_root());
        assert_eq!(ClusterAwareKey::from_object(&ns).to_string(), "root|default");
    }

    #[test]
    fn annotated_objects_use_their_cluster() {
        let ns = namespace("ns-a", Some("root:acme"));
        let key = ClusterAwareKey::from_object(&ns);
        assert_eq!(key.cluster, LogicalCluster::new("root:acme"));
        assert_eq!(key.to_string(), "root:acme|ns-a");
    }

    #[test]
    fn path_helpers() {
        let lc = LogicalCluster::new("root:acme:team");
        assert_eq!(lc.base(), "team");
        assert_eq!(lc.parent().map(|p| p.to_string()), Some("root:acme".into()));
        assert_eq!(LogicalCluster::root().join("acme").as_str(), "root:acme");
        assert_eq!(LogicalCluster::root().base(), "root");
    }

    #[test]
    fn organization_of_nested_cluster() {
        assert_eq!(
            LogicalCluster::new("root:acme:team:x").organization(),
            Some(LogicalCluster::new("root:acme"))
        );
        assert_eq!(
            LogicalCluster::new("root:acme").organization(),
            Some(LogicalCluster::new("root:acme"))
        );
        assert_eq!(LogicalCluster::root().organization(), None);
    }

    #[test]
    fn parse_round_trips_display() {
        let key = ClusterAwareKey::new(LogicalCluster::new("root:acme"), "ws1");
        assert_eq!(ClusterAwareKey::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for raw in ["no-separator", "|name", "root|"] {
            let err = ClusterAwareKey::parse(raw).unwrap_err();
            assert!(matches!(err, Error::MalformedKey { .. }), "{raw}");
        }
    }
}
