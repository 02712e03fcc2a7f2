//! Scoped path parsing.
//!
//! Paths address values across the state tiers with a leading scope prefix:
//! `inputs.x`, `state.x`, `computed.x`, `this.x`, `global.x`, `loop.item`.
//! `raw.` is a legacy alias for `inputs.`; a path with no recognized prefix
//! resolves at the `this` scope (reads follow precedence, writes land in the
//! mutable tier).

use super::StateError;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Which tier (or pseudo-tier) a path resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Inputs,
    State,
    Computed,
    /// Precedence read (`computed > inputs > state`); writes land in `state`.
    This,
    /// The root instance's `this` scope.
    Global,
    /// Innermost loop frame bindings.
    Loop,
}

impl Scope {
    /// Whether steps may write through this scope.
    pub fn is_writable(&self) -> bool {
        matches!(self, Scope::State | Scope::This)
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Scope::Inputs => "inputs",
            Scope::State => "state",
            Scope::Computed => "computed",
            Scope::This => "this",
            Scope::Global => "global",
            Scope::Loop => "loop",
        }
    }
}

// ---------------------------------------------------------------------------
// ScopedPath
// ---------------------------------------------------------------------------

/// A parsed path: scope plus dotted segments within the tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopedPath {
    pub scope: Scope,
    pub segments: Vec<String>,
    /// Parsed from a deprecated prefix (`raw.`).
    pub legacy: bool,
}

impl ScopedPath {
    /// Parse a dotted path string.
    pub fn parse(path: &str) -> Result<Self, StateError> {
        if path.is_empty() {
            return Err(StateError::InvalidPath {
                path: path.to_string(),
                reason: "empty path".to_string(),
            });
        }

        let mut parts = path.split('.');
        let head = parts.next().unwrap_or_default();
        let rest: Vec<String> = parts.map(str::to_string).collect();

        if rest.iter().any(String::is_empty) || head.is_empty() {
            return Err(StateError::InvalidPath {
                path: path.to_string(),
                reason: "empty path segment".to_string(),
            });
        }

        let (scope, segments, legacy) = match head {
            "inputs" => (Scope::Inputs, rest, false),
            "raw" => (Scope::Inputs, rest, true),
            "state" => (Scope::State, rest, false),
            "computed" => (Scope::Computed, rest, false),
            "this" => (Scope::This, rest, false),
            "global" => (Scope::Global, rest, false),
            "loop" => (Scope::Loop, rest, false),
            // No recognized prefix: the whole path resolves at `this`
            _ => {
                let mut segments = vec![head.to_string()];
                segments.extend(rest);
                (Scope::This, segments, false)
            }
        };

        if segments.is_empty() {
            return Err(StateError::InvalidPath {
                path: path.to_string(),
                reason: "scope prefix without a field".to_string(),
            });
        }

        Ok(Self {
            scope,
            segments,
            legacy,
        })
    }

    /// Render back to the canonical dotted form.
    pub fn display(&self) -> String {
        format!("{}.{}", self.scope.prefix(), self.segments.join("."))
    }

    /// Whether this path addresses `other` or a descendant/ancestor of it
    /// within a compatible scope. Used for computed-field dirty marking:
    /// a `this.` path matches any concrete tier with the same segments.
    pub fn overlaps(&self, other: &ScopedPath) -> bool {
        let scopes_compatible = self.scope == other.scope
            || self.scope == Scope::This
                && matches!(other.scope, Scope::Inputs | Scope::State | Scope::Computed)
            || other.scope == Scope::This
                && matches!(self.scope, Scope::Inputs | Scope::State | Scope::Computed);
        if !scopes_compatible {
            return false;
        }
        let n = self.segments.len().min(other.segments.len());
        self.segments[..n] == other.segments[..n]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scoped_prefixes() {
        let p = ScopedPath::parse("state.counter").unwrap();
        assert_eq!(p.scope, Scope::State);
        assert_eq!(p.segments, vec!["counter"]);
        assert!(!p.legacy);

        assert_eq!(ScopedPath::parse("inputs.name").unwrap().scope, Scope::Inputs);
        assert_eq!(
            ScopedPath::parse("computed.doubled").unwrap().scope,
            Scope::Computed
        );
        assert_eq!(ScopedPath::parse("this.x").unwrap().scope, Scope::This);
        assert_eq!(ScopedPath::parse("global.x").unwrap().scope, Scope::Global);
        assert_eq!(ScopedPath::parse("loop.item").unwrap().scope, Scope::Loop);
    }

    #[test]
    fn test_parse_legacy_raw_alias() {
        let p = ScopedPath::parse("raw.name").unwrap();
        assert_eq!(p.scope, Scope::Inputs);
        assert!(p.legacy);
    }

    #[test]
    fn test_parse_unprefixed_defaults_to_this() {
        let p = ScopedPath::parse("counter").unwrap();
        assert_eq!(p.scope, Scope::This);
        assert_eq!(p.segments, vec!["counter"]);

        let nested = ScopedPath::parse("results.total").unwrap();
        assert_eq!(nested.scope, Scope::This);
        assert_eq!(nested.segments, vec!["results", "total"]);
    }

    #[test]
    fn test_parse_nested_segments() {
        let p = ScopedPath::parse("state.review.findings").unwrap();
        assert_eq!(p.segments, vec!["review", "findings"]);
        assert_eq!(p.display(), "state.review.findings");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ScopedPath::parse("").is_err());
        assert!(ScopedPath::parse("state.").is_err());
        assert!(ScopedPath::parse("state..x").is_err());
        assert!(ScopedPath::parse("state").is_err());
    }

    #[test]
    fn test_writability() {
        assert!(Scope::State.is_writable());
        assert!(Scope::This.is_writable());
        assert!(!Scope::Inputs.is_writable());
        assert!(!Scope::Computed.is_writable());
        assert!(!Scope::Global.is_writable());
        assert!(!Scope::Loop.is_writable());
    }

    #[test]
    fn test_overlap_matching() {
        let written = ScopedPath::parse("state.counter").unwrap();
        assert!(written.overlaps(&ScopedPath::parse("state.counter").unwrap()));
        assert!(written.overlaps(&ScopedPath::parse("this.counter").unwrap()));
        assert!(written.overlaps(&ScopedPath::parse("state.counter.sub").unwrap()));
        assert!(!written.overlaps(&ScopedPath::parse("state.other").unwrap()));
        assert!(!written.overlaps(&ScopedPath::parse("inputs.counter").unwrap()));
    }
}
