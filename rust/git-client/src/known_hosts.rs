//! Strict host key validation against an OpenSSH `known_hosts` file.
//!
//! Supported: plain host names, `[host]:port` entries, `*`/`?` wildcards,
//! `!` negated patterns and `@revoked` markers. Hashed host names (`|1|...`)
//! and `@cert-authority` lines are ignored.

use std::{fs, path::Path};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use snafu::{ensure, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::warn;

const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum KnownHostsError {
    #[snafu(display("Cannot read known_hosts {}: {}", path, source))]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("known_hosts contains no usable entries"))]
    NoEntries,

    #[snafu(display("host key for {} is unknown", host))]
    UnknownHost { host: String },

    #[snafu(display("host key for {} does not match known_hosts", host))]
    Mismatch { host: String },

    #[snafu(display("host key for {} has been revoked", host))]
    Revoked { host: String },
}

type Result<T, E = KnownHostsError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct HostPattern {
    pattern: String,
    negated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HostEntry {
    patterns: Vec<HostPattern>,
    fingerprint: Vec<u8>,
    revoked: bool,
}

impl HostEntry {
    fn matches(&self, host: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            if wildcard_match(&pattern.pattern, host) {
                if pattern.negated {
                    return false;
                }
                matched = true;
            }
        }
        matched
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownHosts {
    entries: Vec<HostEntry>,
}

impl KnownHosts {
    /// Parses known_hosts content. Malformed lines are skipped with a warning; a
    /// file without any usable entry is an error.
    pub fn parse(content: &str) -> Result<Self> {
        let entries: Vec<HostEntry> = content
            .lines()
            .enumerate()
            .filter_map(|(index, line)| parse_line(index + 1, line))
            .collect();
        ensure!(!entries.is_empty(), NoEntriesSnafu);
        Ok(Self { entries })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context(ReadSnafu {
            path: path.display().to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accepts the key only if a known entry for `host` (and `port`) carries a key
    /// with the given SHA-256 fingerprint. Unknown hosts are rejected.
    pub fn verify(&self, host: &str, port: Option<u16>, fingerprint: &[u8]) -> Result<()> {
        let host = host.to_lowercase();
        let candidate = match port {
            Some(port) if port != DEFAULT_SSH_PORT => format!("[{host}]:{port}"),
            _ => host,
        };

        let matching: Vec<&HostEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.matches(&candidate))
            .collect();

        ensure!(
            !matching
                .iter()
                .any(|entry| entry.revoked && entry.fingerprint == fingerprint),
            RevokedSnafu { host: &candidate }
        );
        ensure!(
            matching.iter().any(|entry| !entry.revoked),
            UnknownHostSnafu { host: &candidate }
        );
        ensure!(
            matching
                .iter()
                .any(|entry| !entry.revoked && entry.fingerprint == fingerprint),
            MismatchSnafu { host: candidate }
        );
        Ok(())
    }
}

fn parse_line(number: usize, line: &str) -> Option<HostEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut fields = line.split_whitespace().peekable();
    let revoked = match fields.peek() {
        Some(&"@revoked") => {
            fields.next();
            true
        }
        Some(marker) if marker.starts_with('@') => return None,
        _ => false,
    };

    let (Some(hosts), Some(_key_type), Some(key)) = (fields.next(), fields.next(), fields.next())
    else {
        warn!("Skipping malformed known_hosts line {}", number);
        return None;
    };
    if hosts.starts_with('|') {
        warn!("Skipping hashed known_hosts line {}", number);
        return None;
    }
    let Ok(blob) = STANDARD.decode(key) else {
        warn!("Skipping known_hosts line {} with invalid key encoding", number);
        return None;
    };

    let patterns = hosts
        .split(',')
        .filter(|p| !p.is_empty())
        .map(|p| match p.strip_prefix('!') {
            Some(pattern) => HostPattern {
                pattern: pattern.to_lowercase(),
                negated: true,
            },
            None => HostPattern {
                pattern: p.to_lowercase(),
                negated: false,
            },
        })
        .collect();

    Some(HostEntry {
        patterns,
        fingerprint: Sha256::digest(&blob).to_vec(),
        revoked,
    })
}

/// Glob match supporting `*` (any run) and `?` (any single character).
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
