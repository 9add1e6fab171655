//! Per-organization authorization caches and the virtual workspace server
//!
//! Global informers feed an [`OrgRegistry`], which lazily builds one
//! [`AuthorizationCache`] and one [`WatchHub`] per organization. On top of
//! it sit the scoped workspaces view ([`ScopedAccess`]), the
//! initializing-workspaces view ([`InitializingView`]) and the workspace
//! content gate ([`ContentGate`]); [`server`] serves all three.

#![deny(missing_docs)]

pub mod access;
pub mod authorization_cache;
pub mod content;
pub mod error;
pub mod initializing;
pub mod org_listener;
pub mod rbac;
pub mod scope;
pub mod server;
pub mod user;
pub mod watch;

pub use access::ScopedAccess;
pub use authorization_cache::{AuthorizationCache, CacheWatcher};
pub use content::{ContentForwarder, ContentGate, ReqwestForwarder};
pub use error::{Error, Result};
pub use initializing::{InitializingView, WorkspaceStatusWriter, WorkspaceStatusWriterImpl};
pub use org_listener::{OrgCaches, OrgRegistry, SharedCaches};
pub use rbac::{PolicyEvaluator, RbacEvaluator};
pub use scope::{AllScopePolicy, Scope};
pub use server::{router, AppState};
pub use user::UserInfo;
pub use watch::WatchHub;
