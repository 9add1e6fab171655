//! RBAC policy evaluation
//!
//! [`PolicyEvaluator`] is the seam between the authorization cache and
//! whatever decides "may subject S do V on R". [`RbacEvaluator`] answers it
//! from ClusterRole and ClusterRoleBinding informer caches, per logical
//! cluster. Roles and RoleBindings are namespaced and never grant access to
//! cluster-scoped workspaces, so they are not consulted.

use std::collections::BTreeSet;
use std::sync::Arc;

use canopy_common::cache::ScopedCache;
use canopy_common::{ClusterAwareKey, LogicalCluster, TENANCY_GROUP};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Subject};

use crate::user::UserInfo;

#[cfg(test)]
use mockall::automock;

const WILDCARD: &str = "*";
const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// Verb granting visibility of a workspace
pub const ACCESS_VERB: &str = "access";
/// Verb granting access to the content of a Ready workspace
pub const MEMBER_VERB: &str = "member";
/// Verb granting an initializer its view
pub const INITIALIZE_VERB: &str = "initialize";

/// Request attributes checked against policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    /// Verb, e.g. `access`
    pub verb: String,
    /// API group
    pub api_group: String,
    /// Resource, e.g. `workspaces`
    pub resource: String,
    /// Subresource, e.g. `content`
    pub subresource: Option<String>,
    /// Object name, `None` for collection requests
    pub name: Option<String>,
}

impl Attributes {
    /// `<verb>` on `workspaces/content` of one workspace
    pub fn workspace_content(verb: &str, workspace: &str) -> Self {
        Self {
            verb: verb.to_string(),
            api_group: TENANCY_GROUP.to_string(),
            resource: "workspaces".to_string(),
            subresource: Some("content".to_string()),
            name: Some(workspace.to_string()),
        }
    }

    /// `initialize` on `workspaceinitializers/<token>`
    pub fn initializer(token: &str) -> Self {
        Self {
            verb: INITIALIZE_VERB.to_string(),
            api_group: TENANCY_GROUP.to_string(),
            resource: "workspaceinitializers".to_string(),
            subresource: None,
            name: Some(token.to_string()),
        }
    }

    /// Same attributes for another object name
    pub fn with_name(&self, name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..self.clone()
        }
    }

    /// `resource/subresource` as written in policy rules
    fn qualified_resource(&self) -> String {
        match &self.subresource {
            Some(sub) => format!("{}/{}", self.resource, sub),
            None => self.resource.clone(),
        }
    }
}

/// Users and groups granted some attributes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subjects {
    /// Granted user names
    pub users: BTreeSet<String>,
    /// Granted group names
    pub groups: BTreeSet<String>,
}

impl Subjects {
    /// True if nobody is granted
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.groups.is_empty()
    }

    /// True if `user` is granted directly or through a group
    pub fn includes(&self, user: &UserInfo) -> bool {
        self.users.contains(&user.name) || user.groups.iter().any(|g| self.groups.contains(g))
    }

    fn add(&mut self, subject: &Subject) {
        match subject.kind.as_str() {
            "User" => {
                self.users.insert(subject.name.clone());
            }
            "Group" => {
                self.groups.insert(subject.name.clone());
            }
            "ServiceAccount" => {
                let ns = subject.namespace.as_deref().unwrap_or_default();
                self.users
                    .insert(format!("{SERVICE_ACCOUNT_PREFIX}{ns}:{}", subject.name));
            }
            _ => {}
        }
    }
}

/// Decides which subjects hold which permissions
#[cfg_attr(test, automock)]
pub trait PolicyEvaluator: Send + Sync {
    /// True if `user` is granted `attrs` in `cluster`
    fn allows(&self, cluster: &LogicalCluster, user: &UserInfo, attrs: &Attributes) -> bool;

    /// Every user and group granted `attrs` in `cluster`
    fn subjects_for(&self, cluster: &LogicalCluster, attrs: &Attributes) -> Subjects;
}

/// RBAC evaluation over ClusterRoles and ClusterRoleBindings
pub struct RbacEvaluator {
    roles: Arc<ScopedCache<ClusterRole>>,
    bindings: Arc<ScopedCache<ClusterRoleBinding>>,
}

impl RbacEvaluator {
    /// Evaluate against the given informer caches
    pub fn new(
        roles: Arc<ScopedCache<ClusterRole>>,
        bindings: Arc<ScopedCache<ClusterRoleBinding>>,
    ) -> Self {
        Self { roles, bindings }
    }

    /// Roles of `cluster` bound to someone that grant `attrs`, with their bindings
    fn granting_bindings(
        &self,
        cluster: &LogicalCluster,
        attrs: &Attributes,
    ) -> Vec<Arc<ClusterRoleBinding>> {
        self.bindings
            .list_cluster(cluster)
            .into_iter()
            .filter(|binding| binding.role_ref.kind == "ClusterRole")
            .filter(|binding| {
                let key = ClusterAwareKey::new(cluster.clone(), binding.role_ref.name.as_str());
                self.roles
                    .get(&key)
                    .is_some_and(|role| role_grants(&role, attrs))
            })
            .collect()
    }
}

impl PolicyEvaluator for RbacEvaluator {
    fn allows(&self, cluster: &LogicalCluster, user: &UserInfo, attrs: &Attributes) -> bool {
        self.granting_bindings(cluster, attrs).iter().any(|binding| {
            binding
                .subjects
                .iter()
                .flatten()
                .any(|subject| subject_matches(subject, user))
        })
    }

    fn subjects_for(&self, cluster: &LogicalCluster, attrs: &Attributes) -> Subjects {
        let mut subjects = Subjects::default();
        for binding in self.granting_bindings(cluster, attrs) {
            for subject in binding.subjects.iter().flatten() {
                subjects.add(subject);
            }
        }
        subjects
    }
}

/// True if any rule of the role covers `attrs`
pub fn role_grants(role: &ClusterRole, attrs: &Attributes) -> bool {
    role.rules
        .iter()
        .flatten()
        .any(|rule| rule_matches(rule, attrs))
}

/// True if a single policy rule covers `attrs`
pub fn rule_matches(rule: &PolicyRule, attrs: &Attributes) -> bool {
    let covers = |values: Option<&Vec<String>>, wanted: &str| {
        values.is_some_and(|vs| vs.iter().any(|v| v == WILDCARD || v == wanted))
    };

    if !rule.verbs.iter().any(|v| v == WILDCARD || *v == attrs.verb) {
        return false;
    }
    if !covers(rule.api_groups.as_ref(), &attrs.api_group) {
        return false;
    }
    if !covers(rule.resources.as_ref(), &attrs.qualified_resource()) {
        return false;
    }
    match (&rule.resource_names, &attrs.name) {
        (Some(names), Some(name)) if !names.is_empty() => names.contains(name),
        (Some(names), None) if !names.is_empty() => false,
        _ => true,
    }
}

/// Names a rule restricts `resource` to within `group`
///
/// `Some(empty)` means the rule does not touch the resource; `None` means
/// it covers every name.
pub fn rule_resource_names(rule: &PolicyRule, group: &str, resource: &str) -> Option<Vec<String>> {
    let in_group = rule
        .api_groups
        .iter()
        .flatten()
        .any(|g| g == WILDCARD || g == group);
    let on_resource = rule.resources.iter().flatten().any(|r| {
        r == WILDCARD || r == resource || r.split_once('/').is_some_and(|(base, _)| base == resource)
    });
    if !in_group || !on_resource {
        return Some(Vec::new());
    }
    match &rule.resource_names {
        Some(names) if !names.is_empty() => Some(names.clone()),
        _ => None,
    }
}

fn subject_matches(subject: &Subject, user: &UserInfo) -> bool {
    match subject.kind.as_str() {
        "User" => subject.name == user.name,
        "Group" => user.in_group(&subject.name),
        "ServiceAccount" => {
            let ns = subject.namespace.as_deref().unwrap_or_default();
            user.name == format!("{SERVICE_ACCOUNT_PREFIX}{ns}:{}", subject.name)
        }
        _ => false,
    }
}
