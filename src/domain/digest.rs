//! Request attributes used for classification.
//!
//! A `RequestDigest` is the read-only view of an inbound request that the
//! classifier matches against flow schemas. It never changes for the life
//! of a `handle` call.

use serde::{Deserialize, Serialize};

/// The identity that issued a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserInfo {
    /// Authenticated user name
    pub name: String,
    /// Groups the user belongs to
    #[serde(default)]
    pub groups: Vec<String>,
}

impl UserInfo {
    /// Create a user with the given name and groups.
    pub fn new(name: impl Into<String>, groups: &[&str]) -> Self {
        Self {
            name: name.into(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    /// Check group membership.
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Read-only attributes of an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDigest {
    /// Whether the request targets an API resource (as opposed to a raw path)
    pub is_resource_request: bool,
    /// Lowercase verb, e.g. `get`, `list`, `create`
    pub verb: String,
    /// API group, empty for the core group
    #[serde(default)]
    pub api_group: String,
    /// API version
    #[serde(default)]
    pub api_version: String,
    /// Resource name, e.g. `pods`
    #[serde(default)]
    pub resource: String,
    /// Subresource name, e.g. `status`
    #[serde(default)]
    pub subresource: String,
    /// Namespace, empty for cluster-scoped requests
    #[serde(default)]
    pub namespace: String,
    /// Object name, empty for collection requests
    #[serde(default)]
    pub name: String,
    /// Request path, used by non-resource rules
    #[serde(default)]
    pub path: String,
    /// Requesting identity
    pub user: UserInfo,
}

impl RequestDigest {
    /// Digest for a resource request.
    pub fn resource(
        verb: &str,
        api_group: &str,
        resource: &str,
        namespace: &str,
        user: UserInfo,
    ) -> Self {
        Self {
            is_resource_request: true,
            verb: verb.to_string(),
            api_group: api_group.to_string(),
            api_version: "v1".to_string(),
            resource: resource.to_string(),
            namespace: namespace.to_string(),
            user,
            ..Self::default()
        }
    }

    /// Digest for a non-resource request such as `/healthz`.
    pub fn non_resource(verb: &str, path: &str, user: UserInfo) -> Self {
        Self {
            is_resource_request: false,
            verb: verb.to_string(),
            path: path.to_string(),
            user,
            ..Self::default()
        }
    }

    /// Set the subresource.
    pub fn with_subresource(mut self, subresource: &str) -> Self {
        self.subresource = subresource.to_string();
        self
    }

    /// Set the object name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}
