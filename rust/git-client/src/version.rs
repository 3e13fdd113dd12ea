use std::cmp::Ordering;

use semver::{Version, VersionReq};

use crate::Tag;

/// Parses a tag as a semantic version, accepting the usual tag spellings:
/// a leading `v`, surrounding whitespace, leading zeros and short versions
/// such as `1.2` (padded to `1.2.0`). Returns `None` for anything else.
pub fn parse_tolerant(input: &str) -> Option<Version> {
    let input = input.trim();
    let input = input
        .strip_prefix('v')
        .or_else(|| input.strip_prefix('V'))
        .unwrap_or(input);

    let core_end = input.find(['-', '+']).unwrap_or(input.len());
    let (core, suffix) = input.split_at(core_end);

    let mut parts: Vec<String> = core
        .split('.')
        .map(|part| match part.trim_start_matches('0') {
            "" if !part.is_empty() => "0".to_string(),
            trimmed => trimmed.to_string(),
        })
        .collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    if parts.len() < 3 && !suffix.is_empty() {
        return None;
    }
    parts.resize(3, "0".to_string());

    Version::parse(&format!("{}{}", parts.join("."), suffix)).ok()
}

/// A version range predicate.
///
/// Comparators may be separated by commas or whitespace (`>=1.0.0 <2.0.0`) and
/// alternatives by `||`. Caret, tilde and wildcard forms are supported. A bare
/// version without an operator matches exactly that version, and `!=1.2.0`
/// (or `!1.2.0`) excludes one.
#[derive(Debug, Clone)]
pub struct VersionRange {
    alternatives: Vec<Alternative>,
}

/// Comparators joined by `||`: a requirement plus the versions it excludes.
#[derive(Debug, Clone)]
struct Alternative {
    req: VersionReq,
    excluded: Vec<Version>,
}

impl Alternative {
    fn parse(expr: &str) -> Result<Self, semver::Error> {
        let (comparators, excluded) = normalize(expr);
        let req = if comparators.is_empty() && !excluded.is_empty() {
            VersionReq::STAR
        } else {
            VersionReq::parse(&comparators.join(", "))?
        };
        let excluded = excluded
            .into_iter()
            .map(|version| Version::parse(strip_v(version)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { req, excluded })
    }

    fn matches(&self, version: &Version) -> bool {
        self.req.matches(version)
            && !self
                .excluded
                .iter()
                .any(|excluded| precedence(excluded, version).is_eq())
    }
}

impl VersionRange {
    pub fn parse(expr: &str) -> Result<Self, semver::Error> {
        let alternatives = expr
            .split("||")
            .map(Alternative::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { alternatives })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|alt| alt.matches(version))
    }

    /// Picks the tag with the highest matching version. Tags that do not parse
    /// as versions are skipped. Build metadata does not take part in ordering;
    /// tags whose versions tie are resolved in favour of the lexicographically
    /// smallest tag name, so the result never depends on the input order.
    pub fn latest<'a>(&self, tags: impl IntoIterator<Item = &'a Tag>) -> Option<&'a Tag> {
        tags.into_iter()
            .filter_map(|tag| parse_tolerant(&tag.name).map(|version| (version, tag)))
            .filter(|(version, _)| self.matches(version))
            .max_by(|(a, tag_a), (b, tag_b)| {
                precedence(a, b).then_with(|| tag_b.name.cmp(&tag_a.name))
            })
            .map(|(_, tag)| tag)
    }
}

fn precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch, &a.pre).cmp(&(b.major, b.minor, b.patch, &b.pre))
}

const OPERATORS: &[&str] = &["=", ">", ">=", "<", "<=", "~", "^"];
const EXCLUDE_OPERATORS: &[&str] = &["!=", "!"];

/// Splits one alternative into the comparators `VersionReq` understands and
/// the versions excluded with `!=`.
fn normalize(alternative: &str) -> (Vec<String>, Vec<&str>) {
    let mut comparators = Vec::new();
    let mut excluded = Vec::new();
    let mut pending: Option<&str> = None;

    for token in alternative
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
    {
        if OPERATORS.contains(&token) || EXCLUDE_OPERATORS.contains(&token) {
            pending = Some(token);
            continue;
        }
        match pending.take() {
            Some(op) if EXCLUDE_OPERATORS.contains(&op) => excluded.push(token),
            Some(op) => comparators.push(format!("{op}{}", strip_v(token))),
            None => match token
                .strip_prefix("!=")
                .or_else(|| token.strip_prefix('!'))
            {
                Some(version) => excluded.push(version),
                None => comparators.push(comparator(token)),
            },
        }
    }
    if let Some(op) = pending {
        comparators.push(op.to_string());
    }
    (comparators, excluded)
}

fn comparator(token: &str) -> String {
    let split = token
        .find(|c: char| !matches!(c, '=' | '>' | '<' | '~' | '^'))
        .unwrap_or(token.len());
    let (op, version) = token.split_at(split);
    let version = strip_v(version);
    let core = version.split(['-', '+']).next().unwrap_or(version);
    let wildcard = core.contains(['*', 'x', 'X']);
    if op.is_empty() && !wildcard {
        format!("={version}")
    } else {
        format!("{op}{version}")
    }
}

fn strip_v(version: &str) -> &str {
    version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version)
}
