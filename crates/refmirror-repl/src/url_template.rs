//! URL templates: mapping a project name onto a concrete remote location.
//!
//! A template carries a single `${name}` placeholder that is replaced by the
//! project name. Matching always happens on resolved locations, so two
//! spellings of the same path (templated or literal, with or without stray
//! slashes) are equivalent.

use crate::error::{ReplError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Placeholder substituted with the project name.
pub const NAME_PLACEHOLDER: &str = "${name}";

/// How a project name is rewritten before substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteNameStyle {
    /// `team/app` stays `team/app`.
    #[default]
    Slash,
    /// `team/app` becomes `team-app`.
    Dash,
    /// `team/app` becomes `team_app`.
    Underscore,
    /// `team/app` becomes `app`.
    BasenameOnly,
}

impl RemoteNameStyle {
    /// Rewrite a project name according to this style.
    pub fn apply<'a>(&self, project: &'a str) -> Cow<'a, str> {
        match self {
            RemoteNameStyle::Slash => Cow::Borrowed(project),
            RemoteNameStyle::Dash => Cow::Owned(project.replace('/', "-")),
            RemoteNameStyle::Underscore => Cow::Owned(project.replace('/', "_")),
            RemoteNameStyle::BasenameOnly => {
                Cow::Borrowed(project.rsplit('/').next().unwrap_or(project))
            }
        }
    }
}

/// Reject project names that would produce an empty path segment.
pub fn validate_project_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "empty name"
    } else if name.starts_with('/') {
        "leading slash"
    } else if name.ends_with('/') {
        "trailing slash"
    } else if name.contains("//") {
        "empty path segment"
    } else if name.split('/').any(|s| s == "." || s == "..") {
        "relative path segment"
    } else if name.contains(NAME_PLACEHOLDER) {
        "contains the name placeholder"
    } else {
        return Ok(());
    };
    Err(ReplError::InvalidProjectName {
        name: name.to_string(),
        reason,
    })
}

/// A remote URL, possibly containing the `${name}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    raw: String,
    placeholders: usize,
}

impl UrlTemplate {
    /// Wrap a raw URL or template.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let placeholders = raw.matches(NAME_PLACEHOLDER).count();
        Self { raw, placeholders }
    }

    /// The template as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of `${name}` occurrences.
    pub fn placeholder_count(&self) -> usize {
        self.placeholders
    }

    /// True when the template has exactly one placeholder.
    pub fn is_templated(&self) -> bool {
        self.placeholders == 1
    }

    /// Produce the concrete URL for `project`.
    ///
    /// A template without a placeholder resolves to itself. More than one
    /// placeholder never resolves.
    pub fn resolve(&self, project: &str, style: RemoteNameStyle) -> Result<String> {
        validate_project_name(project)?;
        match self.placeholders {
            0 => Ok(self.raw.clone()),
            1 => Ok(self
                .raw
                .replacen(NAME_PLACEHOLDER, &style.apply(project), 1)),
            _ => Err(ReplError::NoMatch {
                pattern: self.raw.clone(),
                project: project.to_string(),
            }),
        }
    }

    /// Does `url` (templated or literal) point at the location this template
    /// resolves to for `project`?
    pub fn matches(&self, url: &str, project: &str, style: RemoteNameStyle) -> bool {
        let Ok(mine) = self.resolve(project, style) else {
            return false;
        };
        match UrlTemplate::new(url).resolve(project, style) {
            Ok(theirs) => same_location(&mine, &theirs),
            Err(_) => false,
        }
    }
}

impl std::fmt::Display for UrlTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Canonical form of a concrete URL or path used for comparisons.
///
/// Drops duplicate slashes, `.` segments and trailing slashes after the
/// scheme; the scheme is lowercased.
pub fn normalize(url: &str) -> String {
    let (scheme, rest) = match url.find("://") {
        Some(idx) => (url[..idx + 3].to_ascii_lowercase(), &url[idx + 3..]),
        None => (String::new(), url),
    };

    let mut out = scheme;
    for (i, segment) in rest.split('/').enumerate() {
        if i == 0 {
            out.push_str(segment);
            continue;
        }
        if segment.is_empty() || segment == "." {
            continue;
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() && rest.starts_with('/') {
        out.push('/');
    }
    out
}

/// True when two concrete URLs name the same location.
pub fn same_location(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    mod resolve {
        use super::*;

        #[test]
        fn test_templated_resolves_project() {
            let t = UrlTemplate::new("/srv/git/${name}replica.git");
            assert_eq!(
                t.resolve("project", RemoteNameStyle::Slash).unwrap(),
                "/srv/git/projectreplica.git"
            );
        }

        #[test]
        fn test_literal_resolves_to_itself() {
            let t = UrlTemplate::new("ssh://mirror/only.git");
            assert!(!t.is_templated());
            assert_eq!(
                t.resolve("anything", RemoteNameStyle::Slash).unwrap(),
                "ssh://mirror/only.git"
            );
        }

        #[test]
        fn test_two_placeholders_never_resolve() {
            let t = UrlTemplate::new("/git/${name}/${name}.git");
            assert_eq!(t.placeholder_count(), 2);
            assert!(matches!(
                t.resolve("p", RemoteNameStyle::Slash),
                Err(ReplError::NoMatch { .. })
            ));
        }

        #[test]
        fn test_name_styles() {
            let t = UrlTemplate::new("/git/${name}.git");
            let cases = [
                (RemoteNameStyle::Slash, "/git/team/app.git"),
                (RemoteNameStyle::Dash, "/git/team-app.git"),
                (RemoteNameStyle::Underscore, "/git/team_app.git"),
                (RemoteNameStyle::BasenameOnly, "/git/app.git"),
            ];
            for (style, expected) in cases {
                assert_eq!(t.resolve("team/app", style).unwrap(), expected);
            }
        }

        #[test]
        fn test_invalid_project_names_rejected() {
            let t = UrlTemplate::new("/git/${name}.git");
            for bad in ["", "/abs", "trail/", "a//b", "../up", "a/./b"] {
                assert!(
                    matches!(
                        t.resolve(bad, RemoteNameStyle::Slash),
                        Err(ReplError::InvalidProjectName { .. })
                    ),
                    "{bad:?} should be rejected"
                );
            }
        }
    }

    mod matching {
        use super::*;

        #[test]
        fn test_templated_and_literal_are_equivalent() {
            let t = UrlTemplate::new("/srv/git/${name}replica.git");
            assert!(t.matches("/srv/git/${name}replica.git", "project", RemoteNameStyle::Slash));
            assert!(t.matches("/srv/git/projectreplica.git", "project", RemoteNameStyle::Slash));
        }

        #[test]
        fn test_different_spelling_same_path() {
            let t = UrlTemplate::new("/srv/git/${name}.git");
            assert!(t.matches("/srv//git/./p.git/", "p", RemoteNameStyle::Slash));
        }

        #[test]
        fn test_other_project_does_not_match() {
            let t = UrlTemplate::new("/srv/git/${name}.git");
            assert!(!t.matches("/srv/git/other.git", "p", RemoteNameStyle::Slash));
        }

        #[test]
        fn test_pattern_with_two_placeholders_fails() {
            let t = UrlTemplate::new("/srv/git/${name}.git");
            assert!(!t.matches("/srv/${name}/${name}.git", "p", RemoteNameStyle::Slash));
        }
    }

    mod normalization {
        use super::*;

        #[test]
        fn test_normalize_paths() {
            assert_eq!(normalize("/git//a/./b.git/"), "/git/a/b.git");
            assert_eq!(normalize("relative/x.git"), "relative/x.git");
            assert_eq!(normalize("/"), "/");
        }

        #[test]
        fn test_normalize_scheme() {
            assert_eq!(normalize("SSH://host:29418//a.git"), "ssh://host:29418/a.git");
            assert!(same_location("ssh://h/a.git", "ssh://h/a.git/"));
            assert!(!same_location("ssh://h/a.git", "ssh://g/a.git"));
        }
    }
}
