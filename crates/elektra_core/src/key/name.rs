//! Key names: namespaces, hierarchical paths, canonical ordering.
//!
//! A key name consists of a namespace and a sequence of unescaped path
//! segments. The escaped (displayed) syntax is `<namespace>:/<seg>/<seg>/...`
//! with `/` inside a segment written as `\/` and `\` as `\\`. Names starting
//! with a bare `/` are cascading and only used for lookups.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The top-level discriminator of a key name.
///
/// The declaration order defines the canonical namespace order used when
/// comparing key names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    /// Synthetic namespace for names starting with `/`; only used for lookups.
    Cascading,
    /// Metadata keys (metadata-on-metadata).
    Meta,
    /// Specification of the configuration.
    Spec,
    /// Process-local configuration.
    Proc,
    /// Directory-local configuration.
    Dir,
    /// Per-user configuration.
    User,
    /// System-wide configuration.
    System,
    /// Fallback values from specifications.
    Default,
}

impl Namespace {
    /// All concrete namespaces searched by a cascading lookup, in order.
    pub const CASCADING_ORDER: [Namespace; 6] = [
        Namespace::Proc,
        Namespace::Dir,
        Namespace::User,
        Namespace::System,
        Namespace::Spec,
        Namespace::Default,
    ];

    /// Returns the textual namespace name (without `:`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Cascading => "",
            Namespace::Meta => "meta",
            Namespace::Spec => "spec",
            Namespace::Proc => "proc",
            Namespace::Dir => "dir",
            Namespace::User => "user",
            Namespace::System => "system",
            Namespace::Default => "default",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Namespace> {
        match prefix {
            "meta" => Some(Namespace::Meta),
            "spec" => Some(Namespace::Spec),
            "proc" => Some(Namespace::Proc),
            "dir" => Some(Namespace::Dir),
            "user" => Some(Namespace::User),
            "system" => Some(Namespace::System),
            "default" => Some(Namespace::Default),
            _ => None,
        }
    }
}

/// Error produced when parsing an invalid key name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid key name '{name}': {reason}")]
pub struct KeyNameError {
    /// The offending name.
    pub name: String,
    /// Why it was rejected.
    pub reason: String,
}

impl KeyNameError {
    fn new(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// A hierarchical, namespaced key name.
///
/// Names are totally ordered: first by namespace, then by path segments
/// compared bytewise, with an ancestor ordered before its descendants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyName {
    namespace: Namespace,
    segments: Vec<String>,
}

impl KeyName {
    /// Creates the root name of a namespace (e.g. `system:/`).
    #[must_use]
    pub fn root(namespace: Namespace) -> Self {
        Self {
            namespace,
            segments: Vec::new(),
        }
    }

    /// Creates a name from a namespace and unescaped segments.
    #[must_use]
    pub fn from_parts<I, S>(namespace: Namespace, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespace,
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses an escaped key name.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown namespaces, empty segments, or a
    /// trailing escape character.
    pub fn parse(name: &str) -> Result<Self, KeyNameError> {
        let (namespace, path) = if let Some(rest) = name.strip_prefix('/') {
            (Namespace::Cascading, rest)
        } else if let Some(colon) = name.find(":/") {
            let ns = Namespace::from_prefix(&name[..colon])
                .ok_or_else(|| KeyNameError::new(name, "unknown namespace"))?;
            (ns, &name[colon + 2..])
        } else {
            return Err(KeyNameError::new(name, "missing namespace or leading '/'"));
        };

        if path.is_empty() {
            return Ok(Self::root(namespace));
        }

        let segments = split_segments(name, path)?;
        Ok(Self {
            namespace,
            segments,
        })
    }

    /// Returns the namespace.
    #[must_use]
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Returns a copy of this name in another namespace.
    #[must_use]
    pub fn with_namespace(&self, namespace: Namespace) -> Self {
        Self {
            namespace,
            segments: self.segments.clone(),
        }
    }

    /// Returns the unescaped path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns true if this is a namespace root (no segments).
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the last segment, if any.
    #[must_use]
    pub fn base_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Returns the parent name, or `None` for a namespace root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        let mut parent = self.clone();
        parent.segments.pop();
        Some(parent)
    }

    /// Appends one unescaped segment.
    pub fn push(&mut self, segment: impl Into<String>) {
        self.segments.push(segment.into());
    }

    /// Returns a copy with one unescaped segment appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut name = self.clone();
        name.push(segment);
        name
    }

    /// Returns true if `self` is strictly below `ancestor`.
    #[must_use]
    pub fn is_below(&self, ancestor: &KeyName) -> bool {
        self.namespace == ancestor.namespace
            && self.segments.len() > ancestor.segments.len()
            && self.segments[..ancestor.segments.len()] == ancestor.segments[..]
    }

    /// Returns true if `self` equals `ancestor` or is below it.
    #[must_use]
    pub fn is_below_or_same(&self, ancestor: &KeyName) -> bool {
        self == ancestor || self.is_below(ancestor)
    }

    /// Returns true if `self` is exactly one level below `parent`.
    #[must_use]
    pub fn is_directly_below(&self, parent: &KeyName) -> bool {
        self.namespace == parent.namespace
            && self.segments.len() == parent.segments.len() + 1
            && self.segments[..parent.segments.len()] == parent.segments[..]
    }

    /// Returns the segments of `self` below `ancestor`, if `self` is
    /// below-or-same.
    #[must_use]
    pub fn strip_prefix(&self, ancestor: &KeyName) -> Option<&[String]> {
        if self.is_below_or_same(ancestor) {
            Some(&self.segments[ancestor.segments.len()..])
        } else {
            None
        }
    }

    /// Rewrites the `old` prefix of this name to `new`.
    ///
    /// Returns `None` if `self` is not below-or-same as `old`.
    #[must_use]
    pub fn replace_prefix(&self, old: &KeyName, new: &KeyName) -> Option<Self> {
        let rest = self.strip_prefix(old)?;
        let mut name = new.clone();
        name.segments.extend(rest.iter().cloned());
        Some(name)
    }

    /// Builds an array-element segment for an index.
    ///
    /// The form is `#` followed by one underscore per extra digit, so that
    /// the lexicographic order of the segments matches the numeric order of
    /// the indices (`#0 .. #9, #_10 .. #_99, #__100 ...`).
    #[must_use]
    pub fn array_element(index: usize) -> String {
        let digits = index.to_string();
        let mut out = String::with_capacity(digits.len() * 2);
        out.push('#');
        for _ in 1..digits.len() {
            out.push('_');
        }
        out.push_str(&digits);
        out
    }

    /// Returns true if a segment has the array-element form.
    #[must_use]
    pub fn is_array_element(segment: &str) -> bool {
        let Some(rest) = segment.strip_prefix('#') else {
            return false;
        };
        let underscores = rest.chars().take_while(|&c| c == '_').count();
        let digits = &rest[underscores..];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        if digits.len() > 1 && digits.starts_with('0') {
            return false;
        }
        underscores == digits.len() - 1
    }
}

fn split_segments(name: &str, path: &str) -> Result<Vec<String>, KeyNameError> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for c in path.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '/' {
            if current.is_empty() {
                return Err(KeyNameError::new(name, "empty path segment"));
            }
            segments.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }

    if escaped {
        return Err(KeyNameError::new(name, "trailing escape character"));
    }
    if current.is_empty() {
        return Err(KeyNameError::new(name, "empty path segment"));
    }
    segments.push(current);

    Ok(segments)
}

fn escape_segment(segment: &str, out: &mut String) {
    for c in segment.chars() {
        match c {
            '/' => out.push_str("\\/"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
}

impl fmt::Display for KeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        if self.namespace != Namespace::Cascading {
            out.push_str(self.namespace.as_str());
            out.push(':');
        }
        if self.segments.is_empty() {
            out.push('/');
        } else {
            for segment in &self.segments {
                out.push('/');
                escape_segment(segment, &mut out);
            }
        }
        f.write_str(&out)
    }
}

impl FromStr for KeyName {
    type Err = KeyNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
