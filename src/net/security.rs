use crate::domain::collaborators::UserDirectory;
use crate::messaging::topics::{has_wildcard, validate_topic_filter, validate_topic_name};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Namespace level used for sessions admitted without credentials.
pub const ANONYMOUS_NAMESPACE: &str = "anonymous";
/// Final topic level of server-to-device commands.
pub const COMMAND_SUFFIX: &str = "cmd";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("certificate subject {0:?} maps to no known owner")]
    IdentityUnresolved(String),
    #[error("anonymous connections are not permitted")]
    AnonymousRejected,
    #[error("identity {0:?} is not usable as a topic level")]
    InvalidIdentity(String),
}

impl AuthError {
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::IdentityUnresolved(_) => "identity_unresolved",
            AuthError::AnonymousRejected => "anonymous_rejected",
            AuthError::InvalidIdentity(_) => "invalid_identity",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{principal} is not authorized to {action} {topic}")]
pub struct NotAuthorized {
    pub principal: Principal,
    pub action: Action,
    pub topic: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Publish,
    Subscribe,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Publish => f.write_str("publish to"),
            Action::Subscribe => f.write_str("subscribe to"),
        }
    }
}

/// Who a session or publish acts as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    User(String),
    Anonymous,
    /// The broker itself, publishing commands on behalf of administrators.
    System,
}

impl Principal {
    /// Topic level this principal owns, if any.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Principal::User(identity) => Some(identity),
            Principal::Anonymous => Some(ANONYMOUS_NAMESPACE),
            Principal::System => None,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::User(identity) => f.write_str(identity),
            Principal::Anonymous => f.write_str(ANONYMOUS_NAMESPACE),
            Principal::System => f.write_str("system"),
        }
    }
}

/// Claims presented by a connecting client.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectClaims<'a> {
    /// Subject CN of a transport-verified client certificate.
    pub certificate_common_name: Option<&'a str>,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, claims: &ConnectClaims<'_>) -> Result<Principal, AuthError>;
}

pub trait Authorizer: Send + Sync {
    fn authorize_publish(&self, principal: &Principal, topic: &str) -> Result<(), NotAuthorized>;
    fn authorize_subscribe(&self, principal: &Principal, filter: &str) -> Result<(), NotAuthorized>;
}

/// Certificate-first authentication against the user directory.
///
/// A verified certificate decides the identity on its own; credentials are
/// only consulted when no certificate was presented.
pub struct GatewayAuthenticator {
    directory: Arc<dyn UserDirectory>,
    allow_anonymous: bool,
}

impl GatewayAuthenticator {
    pub fn new(directory: Arc<dyn UserDirectory>, allow_anonymous: bool) -> Self {
        Self {
            directory,
            allow_anonymous,
        }
    }
}

impl Authenticator for GatewayAuthenticator {
    fn authenticate(&self, claims: &ConnectClaims<'_>) -> Result<Principal, AuthError> {
        if let Some(cn) = claims.certificate_common_name {
            let identity = self
                .directory
                .resolve_owner(cn)
                .ok_or_else(|| AuthError::IdentityUnresolved(cn.to_string()))?;
            if let Some(username) = claims.username.filter(|u| *u != identity) {
                tracing::debug!(
                    certificate = cn,
                    username,
                    "ignoring username that differs from certificate owner"
                );
            }
            return user_principal(identity);
        }
        if let Some(username) = claims.username {
            let identity = self
                .directory
                .validate_credentials(username, claims.password.unwrap_or_default())
                .ok_or(AuthError::InvalidCredentials)?;
            return user_principal(identity);
        }
        if self.allow_anonymous {
            Ok(Principal::Anonymous)
        } else {
            Err(AuthError::AnonymousRejected)
        }
    }
}

fn user_principal(identity: String) -> Result<Principal, AuthError> {
    if crate::pki::validate_identity(&identity).is_err() || identity == ANONYMOUS_NAMESPACE {
        return Err(AuthError::InvalidIdentity(identity));
    }
    Ok(Principal::User(identity))
}

/// Confines every principal to `root/{identity}/...`.
#[derive(Debug, Clone)]
pub struct NamespaceAuthorizer {
    root: String,
}

impl NamespaceAuthorizer {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn deny(principal: &Principal, action: Action, topic: &str) -> NotAuthorized {
        NotAuthorized {
            principal: principal.clone(),
            action,
            topic: topic.to_string(),
        }
    }

    /// `root/{owner}/{device}/cmd` with literal, non-empty levels.
    fn is_command_topic(&self, topic: &str) -> bool {
        let levels: Vec<&str> = topic.split('/').collect();
        levels.len() == 4
            && levels[0] == self.root
            && levels[1..3].iter().all(|l| !l.is_empty())
            && levels[3] == COMMAND_SUFFIX
    }
}

impl Authorizer for NamespaceAuthorizer {
    fn authorize_publish(&self, principal: &Principal, topic: &str) -> Result<(), NotAuthorized> {
        if validate_topic_name(topic).is_err() {
            return Err(Self::deny(principal, Action::Publish, topic));
        }
        let allowed = match principal.namespace() {
            None => self.is_command_topic(topic),
            Some(owner) => {
                let levels: Vec<&str> = topic.split('/').collect();
                levels.len() >= 3
                    && levels[0] == self.root
                    && levels[1] == owner
                    && !levels[2].is_empty()
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(Self::deny(principal, Action::Publish, topic))
        }
    }

    fn authorize_subscribe(&self, principal: &Principal, filter: &str) -> Result<(), NotAuthorized> {
        let Some(owner) = principal.namespace() else {
            return Err(Self::deny(principal, Action::Subscribe, filter));
        };
        if validate_topic_filter(filter).is_err() {
            return Err(Self::deny(principal, Action::Subscribe, filter));
        }
        let levels: Vec<&str> = filter.split('/').collect();
        let allowed = levels.len() >= 2
            && levels[0] == self.root
            && levels[1] == owner
            && !has_wildcard(levels[1]);
        if allowed {
            Ok(())
        } else {
            Err(Self::deny(principal, Action::Subscribe, filter))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::collaborators::StaticUserDirectory;

    fn gateway(allow_anonymous: bool) -> GatewayAuthenticator {
        let mut dir =
            StaticUserDirectory::with_params(argon2::Params::new(1024, 1, 1, None).unwrap());
        dir.add_owner("alice", "alice");
        dir.add_owner("alice-tablet", "alice");
        dir.add_owner("broken", "bad/identity");
        dir.set_password("bob", b"hunter2").unwrap();
        GatewayAuthenticator::new(Arc::new(dir), allow_anonymous)
    }

    #[test]
    fn certificate_path_resolves_owner() {
        let gw = gateway(false);
        let claims = ConnectClaims {
            certificate_common_name: Some("alice-tablet"),
            username: Some("someone-else"),
            password: None,
        };
        assert_eq!(gw.authenticate(&claims), Ok(Principal::User("alice".into())));

        let orphan = ConnectClaims {
            certificate_common_name: Some("carol"),
            ..Default::default()
        };
        assert_eq!(
            gw.authenticate(&orphan),
            Err(AuthError::IdentityUnresolved("carol".into()))
        );

        let broken = ConnectClaims {
            certificate_common_name: Some("broken"),
            ..Default::default()
        };
        assert!(matches!(
            gw.authenticate(&broken),
            Err(AuthError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn credential_path_and_anonymous() {
        let gw = gateway(false);
        let good = ConnectClaims {
            username: Some("bob"),
            password: Some(b"hunter2"),
            ..Default::default()
        };
        assert_eq!(gw.authenticate(&good), Ok(Principal::User("bob".into())));
        let bad = ConnectClaims {
            username: Some("bob"),
            password: Some(b"nope"),
            ..Default::default()
        };
        assert_eq!(gw.authenticate(&bad), Err(AuthError::InvalidCredentials));
        assert_eq!(
            gw.authenticate(&ConnectClaims::default()),
            Err(AuthError::AnonymousRejected)
        );
        assert_eq!(
            gateway(true).authenticate(&ConnectClaims::default()),
            Ok(Principal::Anonymous)
        );
    }

    #[test]
    fn users_stay_in_their_namespace() {
        let authz = NamespaceAuthorizer::new("owntracks");
        let alice = Principal::User("alice".into());
        assert!(authz.authorize_publish(&alice, "owntracks/alice/phone").is_ok());
        assert!(authz
            .authorize_publish(&alice, "owntracks/alice/phone/event")
            .is_ok());
        let denied = authz
            .authorize_publish(&alice, "owntracks/bob/phone")
            .unwrap_err();
        assert_eq!(denied.action, Action::Publish);
        assert_eq!(denied.topic, "owntracks/bob/phone");
        assert!(authz.authorize_publish(&alice, "owntracks/alice").is_err());
        assert!(authz.authorize_publish(&alice, "other/alice/phone").is_err());
        assert!(authz.authorize_publish(&alice, "owntracks/alice/").is_err());

        assert!(authz.authorize_subscribe(&alice, "owntracks/alice/#").is_ok());
        assert!(authz.authorize_subscribe(&alice, "owntracks/alice/+/cmd").is_ok());
        assert!(authz.authorize_subscribe(&alice, "owntracks/+/#").is_err());
        assert!(authz.authorize_subscribe(&alice, "owntracks/#").is_err());
        assert!(authz.authorize_subscribe(&alice, "#").is_err());
        assert!(authz.authorize_subscribe(&alice, "owntracks/bob/#").is_err());
    }

    #[test]
    fn anonymous_namespace() {
        let authz = NamespaceAuthorizer::new("owntracks");
        let anon = Principal::Anonymous;
        assert!(authz
            .authorize_publish(&anon, "owntracks/anonymous/dev")
            .is_ok());
        assert!(authz.authorize_publish(&anon, "owntracks/alice/dev").is_err());
    }

    #[test]
    fn system_publishes_commands_only() {
        let authz = NamespaceAuthorizer::new("owntracks");
        let system = Principal::System;
        assert!(authz
            .authorize_publish(&system, "owntracks/alice/phone/cmd")
            .is_ok());
        assert!(authz.authorize_publish(&system, "owntracks/alice/phone").is_err());
        assert!(authz
            .authorize_publish(&system, "owntracks/alice/phone/event")
            .is_err());
        assert!(authz
            .authorize_subscribe(&system, "owntracks/alice/#")
            .is_err());
    }
}
