//! Destinations: validated, immutable replication targets.
//!
//! A [`ReplicationConfig`] is the snapshot built from one configuration load.
//! It is never mutated; a reload builds a new one and the controller swaps it in.

use crate::config::{GlobalSection, RawConfig, RemoteSection};
use crate::error::{ReplError, Result};
use crate::retry::{BackoffKind, ExponentialBackoff, RetryPolicy};
use crate::url_template::{RemoteNameStyle, UrlTemplate};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

/// Default seconds before the first push attempt.
pub const DEFAULT_REPLICATION_DELAY_SECS: u64 = 15;
/// Default minutes between push attempts.
pub const DEFAULT_REPLICATION_RETRY_MINUTES: u64 = 1;
/// Default cap on an exponentially growing retry interval, in minutes.
pub const DEFAULT_MAX_RETRY_INTERVAL_MINUTES: u64 = 60;
/// Longest delay or retry interval a destination may configure.
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// One entry of a destination's project allow-list.
#[derive(Debug, Clone)]
pub enum ProjectFilter {
    /// Exact project name.
    Exact(String),
    /// `prefix*`: every project starting with the prefix.
    Prefix(String),
    /// `^regex`: every project fully matching the expression.
    Pattern(Regex),
}

impl ProjectFilter {
    /// Parse an allow-list entry.
    pub fn parse(entry: &str) -> Result<Self> {
        if entry.starts_with('^') {
            let anchored = if entry.ends_with('$') {
                entry.to_string()
            } else {
                format!("{entry}$")
            };
            Regex::new(&anchored)
                .map(ProjectFilter::Pattern)
                .map_err(|e| ReplError::config(format!("invalid project pattern {entry}: {e}")))
        } else if let Some(prefix) = entry.strip_suffix('*') {
            Ok(ProjectFilter::Prefix(prefix.to_string()))
        } else {
            Ok(ProjectFilter::Exact(entry.to_string()))
        }
    }

    /// Does the project pass this filter?
    pub fn matches(&self, project: &str) -> bool {
        match self {
            ProjectFilter::Exact(name) => name == project,
            ProjectFilter::Prefix(prefix) => project.starts_with(prefix.as_str()),
            ProjectFilter::Pattern(re) => re.is_match(project),
        }
    }
}

/// A configured remote target.
#[derive(Debug, Clone)]
pub struct Destination {
    name: String,
    urls: Vec<UrlTemplate>,
    projects: Option<Vec<ProjectFilter>>,
    replication_delay: Duration,
    retry: RetryPolicy,
    replicate_project_deletions: bool,
    drain_queue_attempts: u32,
    threads: usize,
    name_style: RemoteNameStyle,
    mirror: bool,
    create_missing_repositories: bool,
}

fn non_negative(remote: &str, field: &str, value: Option<i64>, default: u64) -> Result<u64> {
    match value {
        None => Ok(default),
        Some(v) if v >= 0 => Ok(v as u64),
        Some(v) => Err(ReplError::config(format!(
            "remote.{remote}.{field} must be a non-negative integer, got {v}"
        ))),
    }
}

/// `value` counted in `unit_secs`, bounded by [`MAX_INTERVAL`].
fn interval(remote: &str, field: &str, value: u64, unit_secs: u64) -> Result<Duration> {
    match value.checked_mul(unit_secs).map(Duration::from_secs) {
        Some(d) if d <= MAX_INTERVAL => Ok(d),
        _ => Err(ReplError::config(format!(
            "remote.{remote}.{field} = {value} exceeds {} days",
            MAX_INTERVAL.as_secs() / 86_400
        ))),
    }
}

impl Destination {
    /// Destination with default policy for the given URL templates.
    pub fn new(name: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            name: name.into(),
            urls: urls.into_iter().map(UrlTemplate::new).collect(),
            projects: None,
            replication_delay: Duration::from_secs(DEFAULT_REPLICATION_DELAY_SECS),
            retry: RetryPolicy::fixed(
                Duration::from_secs(DEFAULT_REPLICATION_RETRY_MINUTES * 60),
                None,
            ),
            replicate_project_deletions: false,
            drain_queue_attempts: 0,
            threads: 1,
            name_style: RemoteNameStyle::Slash,
            mirror: false,
            create_missing_repositories: true,
        }
    }

    /// Build a destination from its configuration section.
    pub fn from_section(name: &str, section: &RemoteSection, global: &GlobalSection) -> Result<Self> {
        let urls = section.url.clone().map(|u| u.into_vec()).unwrap_or_default();
        if urls.is_empty() {
            return Err(ReplError::config(format!("remote.{name} has no url")));
        }

        let projects = match section.projects.clone().map(|p| p.into_vec()) {
            Some(entries) if !entries.is_empty() => Some(
                entries
                    .iter()
                    .map(|e| ProjectFilter::parse(e))
                    .collect::<Result<Vec<_>>>()?,
            ),
            _ => None,
        };

        let single_project = matches!(projects.as_deref(), Some([ProjectFilter::Exact(_)]));
        let urls: Vec<UrlTemplate> = urls.into_iter().map(UrlTemplate::new).collect();
        for url in &urls {
            match url.placeholder_count() {
                1 => {}
                0 if single_project => {}
                0 => {
                    return Err(ReplError::config(format!(
                        "remote.{name}.url {url} has no ${{name}} and is not limited to a single project"
                    )))
                }
                _ => {
                    return Err(ReplError::config(format!(
                        "remote.{name}.url {url} must contain exactly one ${{name}}"
                    )))
                }
            }
        }

        let delay = non_negative(
            name,
            "replicationDelay",
            section.replication_delay,
            DEFAULT_REPLICATION_DELAY_SECS,
        )?;
        let retry_minutes = non_negative(
            name,
            "replicationRetry",
            section.replication_retry,
            DEFAULT_REPLICATION_RETRY_MINUTES,
        )?;
        let global_max = non_negative(name, "maxRetries", global.max_retries, 0)?;
        let max_retries = non_negative(
            name,
            "replicationMaxRetries",
            section.replication_max_retries,
            global_max,
        )?;
        let max_interval = non_negative(
            name,
            "maxRetryInterval",
            section.max_retry_interval,
            DEFAULT_MAX_RETRY_INTERVAL_MINUTES,
        )?;
        let drain = non_negative(name, "drainQueueAttempts", section.drain_queue_attempts, 0)?;
        let threads = non_negative(name, "threads", section.threads, 1)?;
        if threads == 0 {
            return Err(ReplError::config(format!("remote.{name}.threads must be positive")));
        }

        let replication_delay = interval(name, "replicationDelay", delay, 1)?;
        let retry_interval = interval(name, "replicationRetry", retry_minutes, 60)?.max(Duration::from_secs(1));
        let max_retry_interval = interval(name, "maxRetryInterval", max_interval, 60)?;
        let mut retry = RetryPolicy::fixed(
            retry_interval,
            (max_retries > 0).then(|| max_retries.min(u32::MAX as u64) as u32),
        );
        if section.retry_backoff.unwrap_or_default() == BackoffKind::Exponential {
            retry.backoff = Arc::new(ExponentialBackoff {
                multiplier: 2.0,
                max_delay: max_retry_interval.max(retry_interval),
                jitter: true,
            });
        }

        Ok(Self {
            name: name.to_string(),
            urls,
            projects,
            replication_delay,
            retry,
            replicate_project_deletions: section.replicate_project_deletions.unwrap_or(false),
            drain_queue_attempts: drain.min(u32::MAX as u64) as u32,
            threads: threads as usize,
            name_style: section.remote_name_style.unwrap_or_default(),
            mirror: section.mirror.unwrap_or(false),
            create_missing_repositories: section.create_missing_repositories.unwrap_or(true),
        })
    }

    /// Set the delay before the first attempt, capped at [`MAX_INTERVAL`].
    pub fn with_replication_delay(mut self, delay: Duration) -> Self {
        self.replication_delay = delay.min(MAX_INTERVAL);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the number of concurrent pushes.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Set the drain budget used at shutdown.
    pub fn with_drain_queue_attempts(mut self, attempts: u32) -> Self {
        self.drain_queue_attempts = attempts;
        self
    }

    /// Enable or disable replication of project deletions.
    pub fn with_project_deletions(mut self, enabled: bool) -> Self {
        self.replicate_project_deletions = enabled;
        self
    }

    /// Restrict the destination to an allow-list.
    pub fn with_projects(mut self, filters: Vec<ProjectFilter>) -> Self {
        self.projects = Some(filters);
        self
    }

    /// Destination name (the section key).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// URL templates in configured order.
    pub fn urls(&self) -> &[UrlTemplate] {
        &self.urls
    }

    /// Delay before the first attempt.
    pub fn replication_delay(&self) -> Duration {
        self.replication_delay
    }

    /// Retry policy.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Whether project deletions are replicated.
    pub fn replicate_project_deletions(&self) -> bool {
        self.replicate_project_deletions
    }

    /// Drain budget used at shutdown.
    pub fn drain_queue_attempts(&self) -> u32 {
        self.drain_queue_attempts
    }

    /// Length of one drain attempt.
    pub fn drain_cycle(&self) -> Duration {
        self.replication_delay.max(Duration::from_secs(1))
    }

    /// Maximum concurrent pushes.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Project name rewriting.
    pub fn name_style(&self) -> RemoteNameStyle {
        self.name_style
    }

    /// Whether a full sync deletes remote refs missing on the source.
    pub fn mirror(&self) -> bool {
        self.mirror
    }

    /// Whether missing remote repositories are created.
    pub fn create_missing_repositories(&self) -> bool {
        self.create_missing_repositories
    }

    /// Does this destination replicate `project`?
    pub fn wants_project(&self, project: &str) -> bool {
        match &self.projects {
            None => true,
            Some(filters) => filters.iter().any(|f| f.matches(project)),
        }
    }

    /// Concrete URLs `project` is pushed to, in configured order.
    pub fn resolve_urls(&self, project: &str) -> Result<Vec<String>> {
        self.urls
            .iter()
            .map(|u| u.resolve(project, self.name_style))
            .collect()
    }

    /// Concrete URLs whose location matches `pattern` (templated or literal).
    pub fn resolve_matching(&self, project: &str, pattern: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for url in &self.urls {
            if url.matches(pattern, project, self.name_style) {
                out.push(url.resolve(project, self.name_style)?);
            }
        }
        Ok(out)
    }

    /// Is `url` still one of the locations `project` replicates to here?
    pub fn serves(&self, project: &str, url: &str) -> bool {
        self.wants_project(project)
            && self
                .urls
                .iter()
                .any(|u| u.matches(url, project, self.name_style))
    }
}

/// An immutable configuration snapshot.
#[derive(Debug, Clone, Default)]
pub struct ReplicationConfig {
    replicate_on_startup: bool,
    auto_reload: bool,
    destinations: Vec<Arc<Destination>>,
}

impl ReplicationConfig {
    /// Validate raw sections into destinations.
    pub fn load(raw: &RawConfig) -> Result<Self> {
        let destinations = raw
            .remotes
            .iter()
            .map(|(name, section)| Destination::from_section(name, section, &raw.global).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            replicate_on_startup: raw.global.replicate_on_startup.unwrap_or(false),
            auto_reload: raw.global.auto_reload.unwrap_or(false),
            destinations,
        })
    }

    /// Snapshot from already-built destinations.
    pub fn from_destinations(destinations: Vec<Destination>) -> Self {
        Self {
            destinations: destinations.into_iter().map(Arc::new).collect(),
            ..Default::default()
        }
    }

    /// Full-sync every project at startup.
    pub fn replicate_on_startup(&self) -> bool {
        self.replicate_on_startup
    }

    /// Reload automatically when the source changes.
    pub fn auto_reload(&self) -> bool {
        self.auto_reload
    }

    /// All destinations in configured order.
    pub fn destinations(&self) -> &[Arc<Destination>] {
        &self.destinations
    }

    /// Destination by name.
    pub fn destination(&self, name: &str) -> Option<&Arc<Destination>> {
        self.destinations.iter().find(|d| d.name() == name)
    }

    /// Destinations replicating `project`, in configured order.
    pub fn destinations_for(&self, project: &str) -> Vec<Arc<Destination>> {
        self.destinations
            .iter()
            .filter(|d| d.wants_project(project))
            .cloned()
            .collect()
    }

    /// Does `url_pattern` resolve to a location `project` replicates to?
    pub fn matches(&self, url_pattern: &str, project: &str) -> bool {
        self.resolve(url_pattern, project).is_ok()
    }

    /// Every (destination, concrete URL) pair `url_pattern` selects for `project`.
    ///
    /// `*` selects every URL of every destination replicating the project.
    pub fn resolve(&self, url_pattern: &str, project: &str) -> Result<Vec<(Arc<Destination>, String)>> {
        let mut targets = Vec::new();
        for dest in self.destinations_for(project) {
            let urls = if url_pattern == "*" {
                dest.resolve_urls(project)?
            } else {
                dest.resolve_matching(project, url_pattern)?
            };
            targets.extend(urls.into_iter().map(|u| (dest.clone(), u)));
        }
        if targets.is_empty() {
            return Err(ReplError::NoMatch {
                pattern: url_pattern.to_string(),
                project: project.to_string(),
            });
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str) -> Result<ReplicationConfig> {
        ReplicationConfig::load(&RawConfig::parse(text)?)
    }

    mod loading {
        use super::*;

        #[test]
        fn test_defaults() {
            let cfg = load("[remote.a]\nurl = \"/g/${name}.git\"\n").unwrap();
            let d = cfg.destination("a").unwrap();
            assert_eq!(d.replication_delay(), Duration::from_secs(15));
            assert_eq!(d.retry().interval, Duration::from_secs(60));
            assert_eq!(d.retry().max_retries, None);
            assert!(!d.replicate_project_deletions());
            assert_eq!(d.drain_queue_attempts(), 0);
            assert_eq!(d.threads(), 1);
            assert!(d.create_missing_repositories());
            assert!(!cfg.auto_reload());
        }

        #[test]
        fn test_missing_url_fails() {
            let err = load("[remote.a]\nreplicationDelay = 1\n").unwrap_err();
            assert!(err.to_string().contains("remote.a has no url"));
        }

        #[test]
        fn test_negative_numbers_fail() {
            for field in ["replicationDelay", "replicationRetry", "drainQueueAttempts"] {
                let text = format!("[remote.a]\nurl = \"/g/${{name}}\"\n{field} = -1\n");
                let err = load(&text).unwrap_err();
                assert!(err.to_string().contains(field), "{field}: {err}");
            }
        }

        #[test]
        fn test_oversized_intervals_fail() {
            for (field, value) in [
                ("replicationDelay", "9223372036854775807"),
                ("replicationDelay", "31536001"),
                ("replicationRetry", "9223372036854775807"),
                ("replicationRetry", "525601"),
                ("maxRetryInterval", "9223372036854775807"),
            ] {
                let text = format!("[remote.a]\nurl = \"/g/${{name}}\"\n{field} = {value}\n");
                let err = load(&text).unwrap_err();
                assert!(matches!(err, ReplError::Config { .. }), "{field}: {err}");
                assert!(err.to_string().contains(field), "{field}: {err}");
            }
            let cfg = load("[remote.a]\nurl = \"/g/${name}\"\nreplicationDelay = 31536000\n").unwrap();
            assert_eq!(cfg.destination("a").unwrap().replication_delay(), MAX_INTERVAL);
        }

        #[test]
        fn test_zero_threads_fail() {
            assert!(load("[remote.a]\nurl = \"/g/${name}\"\nthreads = 0\n").is_err());
        }

        #[test]
        fn test_template_without_placeholder_needs_single_project() {
            assert!(load("[remote.a]\nurl = \"/g/fixed.git\"\n").is_err());
            let cfg = load("[remote.a]\nurl = \"/g/fixed.git\"\nprojects = \"only\"\n").unwrap();
            assert_eq!(
                cfg.destination("a").unwrap().resolve_urls("only").unwrap(),
                vec!["/g/fixed.git".to_string()]
            );
        }

        #[test]
        fn test_double_placeholder_fails() {
            assert!(load("[remote.a]\nurl = \"/g/${name}/${name}\"\n").is_err());
        }

        #[test]
        fn test_bad_regex_fails() {
            assert!(load("[remote.a]\nurl = \"/g/${name}\"\nprojects = \"^(\"\n").is_err());
        }

        #[test]
        fn test_max_retries_fall_back_to_global() {
            let cfg = load("[replication]\nmaxRetries = 4\n[remote.a]\nurl = \"/g/${name}\"\n").unwrap();
            assert_eq!(cfg.destination("a").unwrap().retry().max_retries, Some(4));
        }

        #[test]
        fn test_exponential_backoff_selected() {
            let cfg = load(
                "[remote.a]\nurl = \"/g/${name}\"\nretryBackoff = \"exponential\"\nmaxRetryInterval = 2\n",
            )
            .unwrap();
            let retry = cfg.destination("a").unwrap().retry();
            assert!(retry.delay_after(5) <= Duration::from_secs(132));
            assert!(retry.delay_after(5) >= Duration::from_secs(120));
        }
    }

    mod lookup {
        use super::*;

        const TWO: &str = r#"
[remote.all]
url = "/g/${name}-all.git"

[remote.some]
url = ["/g/${name}-s1.git", "/g/${name}-s2.git"]
projects = ["exact", "team/*", "^lib-[0-9]+"]
"#;

        #[test]
        fn test_destinations_for_respects_allow_list() {
            let cfg = load(TWO).unwrap();
            let names = |p: &str| {
                cfg.destinations_for(p)
                    .iter()
                    .map(|d| d.name().to_string())
                    .collect::<Vec<_>>()
            };
            assert_eq!(names("other"), vec!["all"]);
            assert_eq!(names("exact"), vec!["all", "some"]);
            assert_eq!(names("team/app"), vec!["all", "some"]);
            assert_eq!(names("lib-42"), vec!["all", "some"]);
            assert_eq!(names("lib-42x"), vec!["all"]);
        }

        #[test]
        fn test_resolve_templated_and_literal() {
            let cfg = load(TWO).unwrap();
            let templated = cfg.resolve("/g/${name}-s2.git", "exact").unwrap();
            let literal = cfg.resolve("/g/exact-s2.git", "exact").unwrap();
            assert_eq!(templated.len(), 1);
            assert_eq!(templated[0].0.name(), "some");
            assert_eq!(templated[0].1, literal[0].1);
        }

        #[test]
        fn test_resolve_star_selects_everything() {
            let cfg = load(TWO).unwrap();
            assert_eq!(cfg.resolve("*", "exact").unwrap().len(), 3);
        }

        #[test]
        fn test_resolve_no_match() {
            let cfg = load(TWO).unwrap();
            assert!(!cfg.matches("/g/other-s1.git", "other"));
            assert!(matches!(
                cfg.resolve("/elsewhere/${name}.git", "exact"),
                Err(ReplError::NoMatch { .. })
            ));
        }

        #[test]
        fn test_serves() {
            let cfg = load(TWO).unwrap();
            let some = cfg.destination("some").unwrap();
            assert!(some.serves("exact", "/g/exact-s1.git"));
            assert!(!some.serves("other", "/g/other-s1.git"));
            assert!(!some.serves("exact", "/g/exact-s3.git"));
        }
    }
}
