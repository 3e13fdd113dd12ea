//! Turns a repository URL plus the contents of its credential secret into
//! transport credentials.

use std::{collections::BTreeMap, fmt, fs, path::Path};

use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use url::Url;

use crate::known_hosts::{KnownHosts, KnownHostsError};

pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const IDENTITY_KEY: &str = "identity";
pub const KNOWN_HOSTS_KEY: &str = "known_hosts";

const DEFAULT_SSH_USER: &str = "git";

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("invalid '{}' secret data: required fields {}", secret, missing.join(", ")))]
    MissingFields { secret: String, missing: Vec<String> },

    #[snafu(display("invalid '{}' secret data: '{}' is not valid UTF-8", secret, field))]
    InvalidField { secret: String, field: String },

    #[snafu(display("cannot write known_hosts for '{}': {}", secret, source))]
    WriteKnownHosts {
        secret: String,
        source: std::io::Error,
    },

    #[snafu(display("invalid '{}' secret data: {}", secret, source))]
    InvalidKnownHosts {
        secret: String,
        source: KnownHostsError,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Contents of a credential secret, keyed by field name.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretData {
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl SecretData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    fn non_empty(&self, key: &str) -> Option<&[u8]> {
        self.data
            .get(key)
            .map(Vec::as_slice)
            .filter(|value| !value.is_empty())
    }

    fn utf8(&self, key: &str) -> Result<Option<String>> {
        self.non_empty(key)
            .map(|value| {
                String::from_utf8(value.to_vec()).map_err(|_| Error::InvalidField {
                    secret: self.name.clone(),
                    field: key.to_string(),
                })
            })
            .transpose()
    }
}

impl fmt::Debug for SecretData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretData")
            .field("name", &self.name)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    SshIdentity {
        username: String,
        private_key: String,
        known_hosts: KnownHosts,
    },
}

impl Credentials {
    pub fn is_none(&self) -> bool {
        matches!(self, Credentials::None)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::SshIdentity {
                username,
                known_hosts,
                ..
            } => f
                .debug_struct("SshIdentity")
                .field("username", username)
                .field("known_hosts", &known_hosts.len())
                .finish_non_exhaustive(),
        }
    }
}

/// Selects credentials for `url`.
///
/// Without a secret the clone runs anonymously. http(s) URLs need a username
/// and a password; ssh URLs need a private key and the known_hosts entries the
/// server key is validated against. The known_hosts content is written into
/// `scratch_dir`, which belongs to the caller. Any other scheme is anonymous.
pub fn negotiate(url: &str, secret: Option<&SecretData>, scratch_dir: &Path) -> Result<Credentials> {
    let Some(secret) = secret else {
        return Ok(Credentials::None);
    };
    let Ok(parsed) = Url::parse(url) else {
        return Ok(Credentials::None);
    };

    match parsed.scheme() {
        "http" | "https" => basic(secret),
        "ssh" => ssh_identity(&parsed, secret, scratch_dir),
        _ => Ok(Credentials::None),
    }
}

fn basic(secret: &SecretData) -> Result<Credentials> {
    let username = secret.utf8(USERNAME_KEY)?;
    let password = secret.utf8(PASSWORD_KEY)?;
    match (username, password) {
        (Some(username), Some(password)) => Ok(Credentials::Basic { username, password }),
        (username, password) => MissingFieldsSnafu {
            secret: &secret.name,
            missing: missing(&[
                (USERNAME_KEY, username.is_none()),
                (PASSWORD_KEY, password.is_none()),
            ]),
        }
        .fail(),
    }
}

fn ssh_identity(url: &Url, secret: &SecretData, scratch_dir: &Path) -> Result<Credentials> {
    let private_key = secret.utf8(IDENTITY_KEY)?;
    let known_hosts = secret.non_empty(KNOWN_HOSTS_KEY);
    let (Some(private_key), Some(known_hosts)) = (private_key, known_hosts) else {
        return MissingFieldsSnafu {
            secret: &secret.name,
            missing: missing(&[
                (IDENTITY_KEY, secret.non_empty(IDENTITY_KEY).is_none()),
                (KNOWN_HOSTS_KEY, known_hosts.is_none()),
            ]),
        }
        .fail();
    };

    let path = scratch_dir.join(KNOWN_HOSTS_KEY);
    fs::write(&path, known_hosts).context(WriteKnownHostsSnafu {
        secret: &secret.name,
    })?;
    let known_hosts = KnownHosts::from_file(&path).context(InvalidKnownHostsSnafu {
        secret: &secret.name,
    })?;

    let username = match url.username() {
        "" => DEFAULT_SSH_USER.to_string(),
        user => user.to_string(),
    };
    Ok(Credentials::SshIdentity {
        username,
        private_key,
        known_hosts,
    })
}

fn missing(fields: &[(&str, bool)]) -> Vec<String> {
    fields
        .iter()
        .filter(|(_, absent)| *absent)
        .map(|(name, _)| format!("'{name}'"))
        .collect()
}
