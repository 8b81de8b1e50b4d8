//! The identity a service's process runs under.
//!
//! Modeled as a tagged variant rather than a single struct so that storage
//! backends other than plain uid/gid (e.g. certificate-based identities
//! issued by an external identity service) have a type-level seat at the
//! table even though this crate doesn't implement them.

#[cfg(feature = "certs")]
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The identity a spawned service runs under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    /// A local OS user/group, named or numeric.
    Local {
        /// Numeric uid, if already resolved.
        #[serde(default)]
        uid: Option<u32>,
        /// Numeric gid, if already resolved.
        #[serde(default)]
        gid: Option<u32>,
        /// User name to resolve, if `uid` isn't set directly.
        #[serde(default)]
        user: Option<String>,
        /// Group name to resolve, if `gid` isn't set directly.
        #[serde(default)]
        group: Option<String>,
    },
    /// A username/password-hash pair, for identity backends that don't map
    /// to a local OS account. Not used to spawn processes directly.
    BasicPassword {
        /// The account name.
        username: String,
        /// A pre-hashed password, never the plaintext.
        password_hash: String,
    },
    /// A certificate-backed identity, only constructible when the `certs`
    /// feature is enabled.
    #[cfg(feature = "certs")]
    X509 {
        /// The certificate subject.
        subject: String,
        /// Path to the certificate on disk.
        cert_path: PathBuf,
    },
}

impl Default for Identity {
    fn default() -> Self {
        Identity::Local {
            uid: None,
            gid: None,
            user: None,
            group: None,
        }
    }
}

/// A resolved, ready-to-apply uid/gid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// The uid to set on the spawned process, if any.
    pub uid: Option<u32>,
    /// The gid to set on the spawned process, if any.
    pub gid: Option<u32>,
}

/// Looks up local users and groups by name. Abstracted behind a trait so
/// tests can substitute a fixed table instead of reading `/etc/passwd`.
pub trait UserLookup {
    /// Resolves a user name to a uid.
    fn uid_for_name(&self, name: &str) -> Option<u32>;
    /// Resolves a group name to a gid.
    fn gid_for_name(&self, name: &str) -> Option<u32>;
}

/// A `UserLookup` backed by the running system's actual user database,
/// via `nix::unistd`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUserLookup;

impl UserLookup for SystemUserLookup {
    fn uid_for_name(&self, name: &str) -> Option<u32> {
        nix::unistd::User::from_name(name)
            .ok()
            .flatten()
            .map(|u| u.uid.as_raw())
    }

    fn gid_for_name(&self, name: &str) -> Option<u32> {
        nix::unistd::Group::from_name(name)
            .ok()
            .flatten()
            .map(|g| g.gid.as_raw())
    }
}

/// Error resolving an [`Identity`] against a [`UserLookup`].
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The named user does not exist.
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    /// The named group does not exist.
    #[error("unknown group '{0}'")]
    UnknownGroup(String),
    /// This identity kind cannot spawn an OS process directly.
    #[error("identity kind cannot be used to spawn a process")]
    NotSpawnable,
}

impl Identity {
    /// Resolves this identity to a concrete uid/gid pair using `lookup`.
    pub fn resolve(&self, lookup: &dyn UserLookup) -> Result<ResolvedIdentity, ResolveError> {
        match self {
            Identity::Local {
                uid,
                gid,
                user,
                group,
            } => {
                let uid = match uid {
                    Some(u) => Some(*u),
                    None => match user {
                        Some(name) => Some(
                            lookup
                                .uid_for_name(name)
                                .ok_or_else(|| ResolveError::UnknownUser(name.clone()))?,
                        ),
                        None => None,
                    },
                };
                let gid = match gid {
                    Some(g) => Some(*g),
                    None => match group {
                        Some(name) => Some(
                            lookup
                                .gid_for_name(name)
                                .ok_or_else(|| ResolveError::UnknownGroup(name.clone()))?,
                        ),
                        None => None,
                    },
                };
                Ok(ResolvedIdentity { uid, gid })
            }
            Identity::BasicPassword { .. } => Err(ResolveError::NotSpawnable),
            #[cfg(feature = "certs")]
            Identity::X509 { .. } => Err(ResolveError::NotSpawnable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeLookup {
        users: HashMap<&'static str, u32>,
        groups: HashMap<&'static str, u32>,
    }

    impl UserLookup for FakeLookup {
        fn uid_for_name(&self, name: &str) -> Option<u32> {
            self.users.get(name).copied()
        }
        fn gid_for_name(&self, name: &str) -> Option<u32> {
            self.groups.get(name).copied()
        }
    }

    fn fake() -> FakeLookup {
        let mut users = HashMap::new();
        users.insert("svc", 1000);
        let mut groups = HashMap::new();
        groups.insert("svc", 1000);
        FakeLookup { users, groups }
    }

    #[test]
    fn numeric_uid_gid_passes_through() {
        let id = Identity::Local {
            uid: Some(42),
            gid: Some(43),
            user: None,
            group: None,
        };
        let resolved = id.resolve(&fake()).unwrap();
        assert_eq!(resolved.uid, Some(42));
        assert_eq!(resolved.gid, Some(43));
    }

    #[test]
    fn named_user_resolves() {
        let id = Identity::Local {
            uid: None,
            gid: None,
            user: Some("svc".into()),
            group: Some("svc".into()),
        };
        let resolved = id.resolve(&fake()).unwrap();
        assert_eq!(resolved.uid, Some(1000));
        assert_eq!(resolved.gid, Some(1000));
    }

    #[test]
    fn unknown_user_errors() {
        let id = Identity::Local {
            uid: None,
            gid: None,
            user: Some("nope".into()),
            group: None,
        };
        assert!(matches!(
            id.resolve(&fake()),
            Err(ResolveError::UnknownUser(_))
        ));
    }

    #[test]
    fn basic_password_is_not_spawnable() {
        let id = Identity::BasicPassword {
            username: "x".into(),
            password_hash: "y".into(),
        };
        assert!(matches!(id.resolve(&fake()), Err(ResolveError::NotSpawnable)));
    }
}
