//! Capability Resources
//!
//! Hierarchical paths (`/cluster/rd00`) used to match what a request requires
//! against what an actor provides. A resource is "more general" than another
//! when its segments are a prefix of the other's segments.

use crate::error::ResourceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An immutable capability path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resource {
    segments: Vec<String>,
}

impl Resource {
    pub fn new(path: &str) -> Result<Self, ResourceError> {
        if !path.starts_with('/') {
            return Err(ResourceError::Invalid(path.to_string()));
        }

        let segments = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// `self ≥ other`: every segment of `self` prefixes `other`.
    pub fn is_ancestor_of(&self, other: &Resource) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// `self ≤ other`.
    pub fn is_descendant_of(&self, other: &Resource) -> bool {
        other.is_ancestor_of(self)
    }
}

/// True iff every required resource is satisfied by at least one provided resource.
pub fn can_provide(required: &[Resource], provided: &[Resource]) -> bool {
    required
        .iter()
        .all(|req| provided.iter().any(|prov| req.is_ancestor_of(prov)))
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl FromStr for Resource {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::new(s)
    }
}

impl TryFrom<String> for Resource {
    type Error = ResourceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Resource::new(&value)
    }
}

impl From<Resource> for String {
    fn from(resource: Resource) -> Self {
        resource.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(path: &str) -> Resource {
        Resource::new(path).unwrap()
    }

    #[test]
    fn test_rejects_relative_path() {
        assert_eq!(
            Resource::new("cluster/rd00"),
            Err(ResourceError::Invalid("cluster/rd00".to_string()))
        );
    }

    #[test]
    fn test_display_roundtrip() {
        assert_eq!(res("/cluster/rd00").to_string(), "/cluster/rd00");
        assert_eq!("/node/1".parse::<Resource>().unwrap(), res("/node/1"));
    }

    #[test]
    fn test_prefix_ordering() {
        assert!(res("/cluster").is_ancestor_of(&res("/cluster/rd00")));
        assert!(!res("/bad").is_ancestor_of(&res("/cluster/rd00")));
        assert!(res("/cluster/rd00").is_descendant_of(&res("/cluster")));
        assert!(!res("/cluster/rd00").is_ancestor_of(&res("/cluster")));
        // Segment-wise, not string-wise.
        assert!(!res("/clu").is_ancestor_of(&res("/cluster")));
    }

    #[test]
    fn test_equal_resources_order_both_ways() {
        let a = res("/cluster/rd00");
        let b = res("/cluster/rd00");
        assert_eq!(a, b);
        assert!(a.is_ancestor_of(&b) && a.is_descendant_of(&b));
    }

    #[test]
    fn test_can_provide() {
        let provided = vec![res("/cluster/rd00"), res("/node/1")];

        assert!(can_provide(&[res("/cluster")], &provided));
        assert!(can_provide(&[res("/node")], &provided));
        assert!(!can_provide(&[res("/bad")], &[res("/cluster/rd00")]));
        assert!(!can_provide(&[res("/cluster"), res("/bad")], &provided));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&res("/a/b")).unwrap();
        assert_eq!(json, "\"/a/b\"");
        assert!(serde_json::from_str::<Resource>("\"a/b\"").is_err());
    }
}
