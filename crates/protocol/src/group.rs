use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user entry in a permission set. An empty or missing username is a
/// wildcard that matches any participant presenting the set's password.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// On-disk description of a group, loaded from `<groups-dir>/<name>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GroupDescription {
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub auto_lock: bool,
    /// Zero means no limit.
    #[serde(default)]
    pub max_clients: usize,
    #[serde(default)]
    pub allow_recording: bool,
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub allow_subgroups: bool,
    /// Codec preferences, most preferred first (e.g. `["vp8", "opus"]`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codecs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub op: Vec<ClientCredentials>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presenter: Vec<ClientCredentials>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observer: Vec<ClientCredentials>,
    #[serde(rename = "authServer", default, skip_serializing_if = "Option::is_none")]
    pub auth_server: Option<String>,
    #[serde(rename = "authPortal", default, skip_serializing_if = "Option::is_none")]
    pub auth_portal: Option<String>,
    /// Top-level keys the schema does not know. A description naming a
    /// permission set other than `op`/`presenter`/`observer` lands
    /// here and must be refused at admission time.
    #[serde(flatten)]
    pub unknown: HashMap<String, Value>,
}

/// Effective permissions of an admitted client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    pub op: bool,
    pub present: bool,
    pub record: bool,
    pub message: bool,
    pub token: bool,
}

impl Permissions {
    /// Wire form: the list sent in `joined` and `user` messages.
    pub fn to_strings(self) -> Vec<String> {
        let mut v = Vec::new();
        if self.op {
            v.push("op".to_owned());
        }
        if self.present {
            v.push("present".to_owned());
        }
        if self.record {
            v.push("record".to_owned());
        }
        if self.message {
            v.push("message".to_owned());
        }
        if self.token {
            v.push("token".to_owned());
        }
        v
    }
}

/// Why an admission attempt was refused. `code()` is the stable
/// machine-readable string sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("not authorised")]
    NotAuthorised,
    #[error("anonymous users not allowed in this group")]
    AnonymousNotAllowed,
    #[error("this group is locked")]
    GroupLocked,
    #[error("this group is full")]
    GroupFull,
    #[error("this group does not exist")]
    UnknownGroup,
    #[error("unknown permission set in group description")]
    UnknownPermissionSet,
    #[error("duplicate client id")]
    DuplicateId,
    #[error("token authentication is not supported")]
    NotSupported,
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::NotAuthorised => "not-authorised",
            AdmissionError::AnonymousNotAllowed => "anonymous-not-allowed",
            AdmissionError::GroupLocked => "group-locked",
            AdmissionError::GroupFull => "group-full",
            AdmissionError::UnknownGroup => "unknown-group",
            AdmissionError::UnknownPermissionSet => "unknown-permission-set",
            AdmissionError::DuplicateId => "duplicate-id",
            AdmissionError::NotSupported => "not-supported",
        }
    }
}

impl GroupDescription {
    /// Refuse descriptions that name a permission set this server does
    /// not know; silently dropping one would grant nobody the rights
    /// the group's author intended.
    pub fn check_sets(&self) -> Result<(), AdmissionError> {
        if self.unknown.is_empty() {
            Ok(())
        } else {
            Err(AdmissionError::UnknownPermissionSet)
        }
    }

    /// Match a username/password pair against the three permission sets.
    ///
    /// An exact username match wins over a wildcard entry; a wildcard
    /// (empty username) is consulted only when no entry names the user.
    /// Recording rights attach to `op` iff the group allows recording.
    pub fn authorize(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Permissions, AdmissionError> {
        if username.is_none_or(str::is_empty) && !self.allow_anonymous {
            return Err(AdmissionError::AnonymousNotAllowed);
        }

        let sets: [(&[ClientCredentials], Permissions); 3] = [
            (
                self.op.as_slice(),
                Permissions {
                    op: true,
                    present: true,
                    record: self.allow_recording,
                    message: true,
                    token: false,
                },
            ),
            (
                self.presenter.as_slice(),
                Permissions {
                    present: true,
                    message: true,
                    ..Permissions::default()
                },
            ),
            (
                self.observer.as_slice(),
                Permissions {
                    message: true,
                    ..Permissions::default()
                },
            ),
        ];

        // First pass: exact username matches only.
        for (set, perms) in &sets {
            for cred in set.iter() {
                let exact = cred
                    .username
                    .as_deref()
                    .is_some_and(|u| !u.is_empty() && Some(u) == username);
                if exact && password_matches(cred, password) {
                    return Ok(*perms);
                }
            }
        }

        // Second pass: wildcard entries.
        for (set, perms) in &sets {
            for cred in set.iter() {
                let wildcard = cred.username.as_deref().is_none_or(str::is_empty);
                if wildcard && password_matches(cred, password) {
                    return Ok(*perms);
                }
            }
        }

        Err(AdmissionError::NotAuthorised)
    }
}

fn password_matches(cred: &ClientCredentials, password: Option<&str>) -> bool {
    match cred.password.as_deref() {
        None => true,
        Some(p) => Some(p) == password,
    }
}

/// Validate a hierarchical group name: `/`-separated components with no
/// empty, `.` or `..` segments, not starting or ending with `/`.
pub fn valid_group_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return false;
    }
    name.split('/').all(|c| !c.is_empty() && c != "." && c != "..")
}

/// Pre-connection status served at `{group-URL}.status` and aggregated
/// in `/public-groups.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatus {
    pub name: String,
    /// Base URL of the server.
    pub location: String,
    /// WebSocket endpoint for the signaling protocol.
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_portal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_count: Option<usize>,
}
