//! Request scoping for the workspaces view
//!
//! Paths look like `<root>/<org>/<scope>[/<rest>]`, e.g.
//! `/services/workspaces/acme/personal/apis/tenancy.canopy.dev/v1alpha1/workspaces`.
//! The organization segment is either a full logical cluster name
//! (`root:acme`), `root`, or a bare organization name under root.

use std::fmt;
use std::str::FromStr;

use canopy_common::LogicalCluster;

use crate::error::{Error, Result};

/// Default prefix of the workspaces view
pub const DEFAULT_ROOT_PATH: &str = "/services/workspaces";

/// Visibility mode requested by the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Workspaces the caller may access
    Personal,
    /// Workspaces of an organization the caller belongs to
    All,
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "personal" => Ok(Scope::Personal),
            "all" => Ok(Scope::All),
            other => Err(Error::ScopeRequired(format!("unknown scope {other:?}"))),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Personal => "personal",
            Scope::All => "all",
        })
    }
}

/// How the `all` scope decides membership
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllScopePolicy {
    /// Access to the organization workspace in its parent grants the whole org
    #[default]
    OrgMembership,
    /// Same per-workspace check as `personal`
    PerWorkspaceAccess,
}

impl FromStr for AllScopePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "org-membership" => Ok(Self::OrgMembership),
            "per-workspace" => Ok(Self::PerWorkspaceAccess),
            other => Err(format!(
                "unknown all-scope policy {other:?} (expected org-membership or per-workspace)"
            )),
        }
    }
}

/// A parsed scoped request path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopedPath {
    /// Organization logical cluster
    pub org: LogicalCluster,
    /// Requested scope
    pub scope: Scope,
    /// Remainder after the scope segment, without leading slash
    pub rest: String,
}

/// Split `path` into organization, scope and remainder
pub fn parse_scoped_path(root: &str, path: &str) -> Result<ScopedPath> {
    let root = root.trim_end_matches('/');
    let tail = path
        .strip_prefix(root)
        .filter(|t| t.is_empty() || t.starts_with('/'))
        .ok_or_else(|| Error::ScopeRequired(path.to_string()))?;

    let mut segments = tail.trim_start_matches('/').splitn(3, '/');
    let org = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::ScopeRequired(path.to_string()))?;
    let scope = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::ScopeRequired(path.to_string()))?
        .parse()?;
    let rest = segments.next().unwrap_or_default().to_string();

    Ok(ScopedPath {
        org: org_cluster(org),
        scope,
        rest,
    })
}

fn org_cluster(segment: &str) -> LogicalCluster {
    if segment == canopy_common::logicalcluster::ROOT || segment.contains(':') {
        LogicalCluster::new(segment)
    } else {
        LogicalCluster::root().join(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::bare_org("/services/workspaces/acme/personal", "root:acme", Scope::Personal, "")]
    #[case::full_name("/services/workspaces/root:acme/all/apis/x", "root:acme", Scope::All, "apis/x")]
    #[case::root("/services/workspaces/root/all", "root", Scope::All, "")]
    fn parses_scoped_paths(
        #[case] path: &str,
        #[case] org: &str,
        #[case] scope: Scope,
        #[case] rest: &str,
    ) {
        let parsed = parse_scoped_path(DEFAULT_ROOT_PATH, path).unwrap();
        assert_eq!(parsed.org.as_str(), org);
        assert_eq!(parsed.scope, scope);
        assert_eq!(parsed.rest, rest);
    }

    #[rstest]
    #[case::no_scope("/services/workspaces/acme")]
    #[case::bad_scope("/services/workspaces/acme/everyone")]
    #[case::no_org("/services/workspaces")]
    #[case::wrong_root("/services/other/acme/personal")]
    #[case::prefix_only_match("/services/workspacesx/acme/personal")]
    fn unscoped_paths_require_scope(#[case] path: &str) {
        assert!(matches!(
            parse_scoped_path(DEFAULT_ROOT_PATH, path),
            Err(Error::ScopeRequired(_))
        ));
    }

    #[test]
    fn all_scope_policy_parses_cli_values() {
        assert_eq!("org-membership".parse(), Ok(AllScopePolicy::OrgMembership));
        assert_eq!("per-workspace".parse(), Ok(AllScopePolicy::PerWorkspaceAccess));
        assert!("anything".parse::<AllScopePolicy>().is_err());
    }
}
