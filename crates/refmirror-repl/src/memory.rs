//! In-process repositories and transport.
//!
//! [`MemoryRepos`] holds named repositories (refs plus a symbolic HEAD).
//! [`MemoryTransport`] pushes from a source set of repositories into remote
//! repositories keyed by normalized URL. Used by tests and by the CLI's
//! dry-run replay; failures can be injected per URL.

use crate::error::TransportError;
use crate::task::PushOp;
use crate::transport::{PushReport, PushRequest, PushTransport};
use crate::url_template::normalize;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Contents of one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoContents {
    /// Ref name to object id.
    #[serde(default)]
    pub refs: BTreeMap<String, String>,
    /// Target of the symbolic HEAD.
    #[serde(default)]
    pub head: Option<String>,
}

impl RepoContents {
    /// No refs.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// A shared set of named repositories.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepos {
    repos: Arc<RwLock<HashMap<String, RepoContents>>>,
}

impl MemoryRepos {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set populated from a map.
    pub fn from_map(repos: HashMap<String, RepoContents>) -> Self {
        Self {
            repos: Arc::new(RwLock::new(repos)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RepoContents>> {
        self.repos.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RepoContents>> {
        self.repos.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an empty repository; false if it already existed.
    pub fn create(&self, name: &str) -> bool {
        let mut repos = self.write();
        if repos.contains_key(name) {
            return false;
        }
        repos.insert(name.to_string(), RepoContents::default());
        true
    }

    /// Does the repository exist?
    pub fn exists(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Delete a repository.
    pub fn remove(&self, name: &str) -> Option<RepoContents> {
        self.write().remove(name)
    }

    /// Create or move a ref, creating the repository if needed.
    pub fn set_ref(&self, name: &str, ref_name: &str, oid: &str) {
        self.write()
            .entry(name.to_string())
            .or_default()
            .refs
            .insert(ref_name.to_string(), oid.to_string());
    }

    /// Remove a ref.
    pub fn delete_ref(&self, name: &str, ref_name: &str) -> bool {
        self.write()
            .get_mut(name)
            .map(|r| r.refs.remove(ref_name).is_some())
            .unwrap_or(false)
    }

    /// Point HEAD at a branch, creating the repository if needed.
    pub fn set_head(&self, name: &str, ref_name: &str) {
        self.write().entry(name.to_string()).or_default().head = Some(ref_name.to_string());
    }

    /// Object id of a ref.
    pub fn get_ref(&self, name: &str, ref_name: &str) -> Option<String> {
        self.read().get(name).and_then(|r| r.refs.get(ref_name).cloned())
    }

    /// Target of HEAD.
    pub fn head(&self, name: &str) -> Option<String> {
        self.read().get(name).and_then(|r| r.head.clone())
    }

    /// Copy of one repository.
    pub fn contents(&self, name: &str) -> Option<RepoContents> {
        self.read().get(name).cloned()
    }

    /// Copy of every repository, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, RepoContents> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Transport pushing between two [`MemoryRepos`].
#[derive(Debug, Default)]
pub struct MemoryTransport {
    source: MemoryRepos,
    remotes: MemoryRepos,
    failures: Mutex<HashMap<String, u32>>,
    log: Mutex<Vec<PushRequest>>,
}

impl MemoryTransport {
    /// Transport from `source` projects into `remotes` (keyed by normalized URL).
    pub fn new(source: MemoryRepos, remotes: MemoryRepos) -> Self {
        Self {
            source,
            remotes,
            failures: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Source repositories.
    pub fn source(&self) -> &MemoryRepos {
        &self.source
    }

    /// Remote repositories.
    pub fn remotes(&self) -> &MemoryRepos {
        &self.remotes
    }

    /// Fail the next `count` pushes to `url`; `u32::MAX` keeps it unreachable.
    pub fn fail_next(&self, url: &str, count: u32) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize(url), count);
    }

    /// Every attempted push, in order.
    pub fn push_log(&self) -> Vec<PushRequest> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Attempts against `url`.
    pub fn pushes_to(&self, url: &str) -> usize {
        let key = normalize(url);
        self.push_log()
            .iter()
            .filter(|r| normalize(&r.url) == key)
            .count()
    }

    fn injected_failure(&self, key: &str) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let Some(remaining) = failures.get_mut(key) else {
            return false;
        };
        match *remaining {
            0 => false,
            u32::MAX => true,
            _ => {
                *remaining -= 1;
                true
            }
        }
    }

    fn ensure_remote(&self, key: &str, request: &PushRequest) -> Result<bool, TransportError> {
        if self.remotes.exists(key) {
            return Ok(false);
        }
        if !request.create_missing {
            return Err(TransportError::RepositoryNotFound {
                url: request.url.clone(),
            });
        }
        Ok(self.remotes.create(key))
    }

    fn source_contents(&self, project: &str) -> Result<RepoContents, TransportError> {
        self.source
            .contents(project)
            .ok_or_else(|| TransportError::SourceMissing {
                project: project.to_string(),
            })
    }
}

#[async_trait]
impl PushTransport for MemoryTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushReport, TransportError> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let key = normalize(&request.url);
        if self.injected_failure(&key) {
            return Err(TransportError::Connection {
                url: request.url.clone(),
                msg: "injected failure".to_string(),
            });
        }

        let mut report = PushReport::default();
        match &request.op {
            PushOp::DeleteProject => {
                if let Some(removed) = self.remotes.remove(&key) {
                    report.deleted_refs = removed.refs.len();
                }
            }
            PushOp::Head(branch) => {
                report.created_repository = self.ensure_remote(&key, request)?;
                if self.remotes.get_ref(&key, branch).is_none() {
                    return Err(TransportError::MissingRef {
                        url: request.url.clone(),
                        ref_name: branch.clone(),
                    });
                }
                self.remotes.set_head(&key, branch);
                report.updated_refs = 1;
            }
            PushOp::Ref(ref_name) => {
                let source = self.source_contents(&request.project)?;
                report.created_repository = self.ensure_remote(&key, request)?;
                match source.refs.get(ref_name) {
                    Some(oid) => {
                        self.remotes.set_ref(&key, ref_name, oid);
                        report.updated_refs = 1;
                    }
                    None => {
                        if self.remotes.delete_ref(&key, ref_name) {
                            report.deleted_refs = 1;
                        }
                    }
                }
            }
            PushOp::FullSync => {
                let source = self.source_contents(&request.project)?;
                report.created_repository = self.ensure_remote(&key, request)?;
                let remote = self.remotes.contents(&key).unwrap_or_default();
                for (ref_name, oid) in &source.refs {
                    if remote.refs.get(ref_name) != Some(oid) {
                        self.remotes.set_ref(&key, ref_name, oid);
                        report.updated_refs += 1;
                    }
                }
                if request.mirror {
                    for ref_name in remote.refs.keys() {
                        if !source.refs.contains_key(ref_name) && self.remotes.delete_ref(&key, ref_name) {
                            report.deleted_refs += 1;
                        }
                    }
                }
                if let Some(head) = source.head.as_deref() {
                    if source.refs.contains_key(head) {
                        self.remotes.set_head(&key, head);
                    }
                }
            }
        }
        Ok(report)
    }
}
