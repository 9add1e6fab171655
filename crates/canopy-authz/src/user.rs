//! Caller identity
//!
//! The virtual workspace server sits behind the front proxy, which
//! authenticates the caller and passes the result on as request headers.

use axum::http::HeaderMap;

use crate::error::{Error, Result};

/// Header carrying the authenticated user name
pub const USER_HEADER: &str = "x-remote-user";
/// Header carrying one group per value
pub const GROUP_HEADER: &str = "x-remote-group";
/// Group every authenticated caller belongs to
pub const AUTHENTICATED_GROUP: &str = "system:authenticated";

/// Authenticated caller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserInfo {
    /// User name
    pub name: String,
    /// Group memberships, always including `system:authenticated`
    pub groups: Vec<String>,
}

impl UserInfo {
    /// Build a user; `system:authenticated` is appended when missing
    pub fn new(name: impl Into<String>, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut groups: Vec<String> = groups.into_iter().map(Into::into).collect();
        if !groups.iter().any(|g| g == AUTHENTICATED_GROUP) {
            groups.push(AUTHENTICATED_GROUP.to_string());
        }
        Self {
            name: name.into(),
            groups,
        }
    }

    /// Read the identity set by the front proxy
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let name = headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Unauthorized(format!("missing {USER_HEADER} header")))?;

        let groups = headers
            .get_all(GROUP_HEADER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();

        Ok(Self::new(name, groups))
    }

    /// True if the user is a member of `group`
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_carry_user_and_groups() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, "alice".parse().unwrap());
        headers.append(GROUP_HEADER, "team-a".parse().unwrap());
        headers.append(GROUP_HEADER, "team-b, team-c".parse().unwrap());

        let user = UserInfo::from_headers(&headers).unwrap();
        assert_eq!(user.name, "alice");
        assert!(user.in_group("team-a"));
        assert!(user.in_group("team-c"));
        assert!(user.in_group(AUTHENTICATED_GROUP));
    }

    #[test]
    fn missing_user_is_unauthorized() {
        let err = UserInfo::from_headers(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn authenticated_group_is_not_duplicated() {
        let user = UserInfo::new("bob", [AUTHENTICATED_GROUP]);
        assert_eq!(user.groups, vec![AUTHENTICATED_GROUP.to_string()]);
    }
}
