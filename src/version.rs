// src/version.rs

//! Version comparison for PND packages
//!
//! Version strings are dot-joined components that are usually numeric
//! (`1.2.0.4`) but may carry text (`2.0.0.beta`, `unknown`). Ordering is
//! lexicographic over aligned components with one twist: a text component
//! always sorts below a numeric component *and* below a missing one, so a
//! placeholder version can never win against a real release.
//!
//! Per position the order is `Text < Missing < Numeric`. Comparison never
//! fails; malformed input simply degrades to text components.

use std::cmp::Ordering;
use std::fmt;

/// One token of a version string
#[derive(Debug, Clone)]
enum Component {
    /// Run of ASCII digits, stored without leading zeros
    Numeric(String),
    /// Any other run of characters
    Text(String),
}

impl Component {
    fn numeric(digits: &str) -> Self {
        let trimmed = digits.trim_start_matches('0');
        Component::Numeric(if trimmed.is_empty() { "0" } else { trimmed }.to_string())
    }

    fn is_text(&self) -> bool {
        matches!(self, Component::Text(_))
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            // Arbitrary precision: shorter digit string is the smaller number.
            (Component::Numeric(a), Component::Numeric(b)) => {
                a.len().cmp(&b.len()).then_with(|| a.cmp(b))
            }
            (Component::Text(a), Component::Text(b)) => a.cmp(b),
            (Component::Text(_), Component::Numeric(_)) => Ordering::Less,
            (Component::Numeric(_), Component::Text(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Component {}

/// A parsed package version, or the sentinel for "no version at all"
#[derive(Debug, Clone)]
pub struct Version {
    raw: Option<String>,
    components: Vec<Component>,
}

impl Version {
    /// Parse a version string
    ///
    /// Dots separate components; inside a component, digit runs and
    /// non-digit runs become separate tokens (`1a` is `1`, `a`).
    pub fn parse(s: &str) -> Self {
        let mut components = Vec::new();

        for segment in s.trim().split('.') {
            let mut current = String::new();
            let mut current_numeric = false;

            for c in segment.chars() {
                let numeric = c.is_ascii_digit();
                if !current.is_empty() && numeric != current_numeric {
                    components.push(Self::token(&current, current_numeric));
                    current.clear();
                }
                current_numeric = numeric;
                current.push(c);
            }

            if !current.is_empty() {
                components.push(Self::token(&current, current_numeric));
            }
        }

        Self {
            raw: Some(s.to_string()),
            components,
        }
    }

    /// The sentinel version, lower than every real version
    pub fn absent() -> Self {
        Self {
            raw: None,
            components: Vec::new(),
        }
    }

    pub fn is_absent(&self) -> bool {
        self.raw.is_none()
    }

    fn token(s: &str, numeric: bool) -> Component {
        if numeric {
            Component::numeric(s)
        } else {
            Component::Text(s.to_string())
        }
    }
}

/// Compare one aligned position where either side may be missing
fn compare_position(a: Option<&Component>, b: Option<&Component>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(a), None) => {
            if a.is_text() {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (None, Some(b)) => {
            if b.is_text() {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (None, None) => Ordering::Equal,
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_absent(), other.is_absent()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| compare_position(self.components.get(i), other.components.get(i)))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Version::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.raw {
            Some(raw) => write!(f, "{}", raw),
            None => write!(f, "(none)"),
        }
    }
}

/// Build a version string from structured fields
///
/// Missing components default to `0`; the release type defaults to
/// `release`, which is dropped because it carries no ordering information.
pub fn synthesize(
    major: Option<&str>,
    minor: Option<&str>,
    release: Option<&str>,
    build: Option<&str>,
    kind: Option<&str>,
) -> String {
    let mut parts: Vec<&str> = [major, minor, release, build]
        .iter()
        .map(|p| p.map(str::trim).filter(|p| !p.is_empty()).unwrap_or("0"))
        .collect();

    let kind = kind.map(str::trim).filter(|k| !k.is_empty()).unwrap_or("release");
    if kind != "release" {
        parts.push(kind);
    }

    parts.join(".")
}
