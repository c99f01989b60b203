//! Authentication and topic authorization.
//!
//! An [`AuthProvider`] verifies a principal and returns the [`Authorizer`] that decides
//! what it may publish and subscribe to. [`StaticAuthProvider`] serves both from the
//! `acl` configuration section.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use edgemq_conf::{Acl, Permissions};

use crate::topic::{Level, Namespaces, Topic};

pub const PLACEHOLDER_USERNAME: &str = "${username}";
pub const PLACEHOLDER_COMMONNAME: &str = "${commonname}";

/// Who a session belongs to, kept with the session record so its subscriptions can be
/// re-checked after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    Account(String),
    Certificate(String),
    Anonymous,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Publish,
    Subscribe,
}

pub trait Authorizer: Send + Sync {
    /// `topic` is a topic name for publish and a topic filter for subscribe.
    fn authorize(&self, action: Action, topic: &str) -> bool;
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate_account(&self, username: &str, password: &[u8]) -> Option<Arc<dyn Authorizer>>;

    async fn authenticate_certificate(&self, common_name: &str) -> Option<Arc<dyn Authorizer>>;

    /// Authorizer for clients presenting no credentials, `None` if they are refused.
    async fn anonymous(&self) -> Option<Arc<dyn Authorizer>>;

    /// Current authorizer of an already authenticated principal, without re-checking credentials.
    async fn lookup(&self, principal: &Principal) -> Option<Arc<dyn Authorizer>>;
}

/// Grants everything, used for internal links.
pub struct AllowAll;

impl Authorizer for AllowAll {
    #[inline]
    fn authorize(&self, _action: Action, _topic: &str) -> bool {
        true
    }
}

/// Grants a topic when one of the configured patterns covers it.
///
/// A topic under a system namespace is only granted by patterns whose first level names
/// that namespace, so `#` never opens up system topics.
pub struct PermissionAuthorizer {
    superuser: bool,
    publish: Vec<Topic>,
    subscribe: Vec<Topic>,
    namespaces: Namespaces,
}

impl PermissionAuthorizer {
    pub fn new(perms: &Permissions, namespaces: Namespaces, vars: &[(&str, &str)]) -> Self {
        let parse = |patterns: &Vec<String>| {
            patterns
                .iter()
                .filter_map(|p| {
                    let p = vars.iter().fold(p.clone(), |p, (k, v)| p.replace(k, v));
                    match Topic::from_str(&p) {
                        Ok(t) => Some(t),
                        Err(e) => {
                            log::warn!("ignoring invalid acl pattern `{}`, {}", p, e);
                            None
                        }
                    }
                })
                .collect::<Vec<_>>()
        };
        Self {
            superuser: perms.superuser,
            publish: parse(&perms.publish),
            subscribe: parse(&perms.subscribe),
            namespaces,
        }
    }
}

impl Authorizer for PermissionAuthorizer {
    fn authorize(&self, action: Action, topic: &str) -> bool {
        if self.superuser {
            return true;
        }
        let t = match Topic::from_str(topic) {
            Ok(t) => t,
            Err(_) => return false,
        };
        let system = self.namespaces.split(topic).0;
        let patterns = match action {
            Action::Publish => &self.publish,
            Action::Subscribe => &self.subscribe,
        };
        patterns.iter().any(|p| {
            if let Some(prefix) = system {
                if p.levels().first().and_then(Level::value) != Some(prefix) {
                    return false;
                }
            }
            p.covers(&t)
        })
    }
}

pub struct StaticAuthProvider {
    acl: Acl,
    namespaces: Namespaces,
}

impl StaticAuthProvider {
    #[inline]
    pub fn new(acl: Acl, namespaces: Namespaces) -> Self {
        Self { acl, namespaces }
    }

    #[inline]
    fn account_authorizer(&self, username: &str, perms: &Permissions) -> Arc<dyn Authorizer> {
        Arc::new(PermissionAuthorizer::new(perms, self.namespaces.clone(), &[(PLACEHOLDER_USERNAME, username)]))
    }

    #[inline]
    fn certificate_authorizer(&self, cn: &str, perms: &Permissions) -> Arc<dyn Authorizer> {
        Arc::new(PermissionAuthorizer::new(perms, self.namespaces.clone(), &[(PLACEHOLDER_COMMONNAME, cn)]))
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn authenticate_account(&self, username: &str, password: &[u8]) -> Option<Arc<dyn Authorizer>> {
        self.acl
            .accounts
            .iter()
            .find(|a| a.username == username && a.password.as_bytes() == password)
            .map(|a| self.account_authorizer(username, &a.permissions))
    }

    async fn authenticate_certificate(&self, common_name: &str) -> Option<Arc<dyn Authorizer>> {
        self.acl
            .certificates
            .iter()
            .find(|c| c.common_name == common_name)
            .map(|c| self.certificate_authorizer(common_name, &c.permissions))
    }

    async fn anonymous(&self) -> Option<Arc<dyn Authorizer>> {
        if self.acl.allow_anonymous {
            Some(Arc::new(PermissionAuthorizer::new(&self.acl.anonymous, self.namespaces.clone(), &[])))
        } else {
            None
        }
    }

    async fn lookup(&self, principal: &Principal) -> Option<Arc<dyn Authorizer>> {
        match principal {
            Principal::Account(username) => self
                .acl
                .accounts
                .iter()
                .find(|a| &a.username == username)
                .map(|a| self.account_authorizer(username, &a.permissions)),
            Principal::Certificate(cn) => self
                .acl
                .certificates
                .iter()
                .find(|c| &c.common_name == cn)
                .map(|c| self.certificate_authorizer(cn, &c.permissions)),
            Principal::Anonymous => self.anonymous().await,
            Principal::Internal => Some(Arc::new(AllowAll)),
        }
    }
}
