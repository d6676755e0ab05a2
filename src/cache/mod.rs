// src/cache/mod.rs
// Advisory TTL cache for repository trees, file contents, and filename searches.
//
// One RepositoryCache is shared by every request in the process. A miss always
// falls through to a live fetch; an expired entry is never served, not even
// when the refetch fails. Concurrent misses on the same key may both fetch;
// the last writer wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::{PilotError, Result};
use crate::github::{FileContent, RepoBackend, RepoRef, RepoTree};

/// A cached value and when it was stored
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub timestamp: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            timestamp: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.timestamp.elapsed() < ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BranchKey {
    owner: String,
    repo: String,
    branch: String,
}

impl BranchKey {
    fn new(repo: &RepoRef, branch: &str) -> Self {
        Self {
            owner: repo.owner.clone(),
            repo: repo.repo.clone(),
            branch: branch.to_string(),
        }
    }
}

/// (owner, repo, branch, path-or-query)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ItemKey {
    branch: BranchKey,
    item: String,
}

enum Slot {
    Tree(BranchKey),
    File(ItemKey),
    Search(ItemKey),
}

/// Hit/miss counters, exposed on the status endpoint
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

pub struct RepositoryCache {
    config: CacheConfig,
    trees: Mutex<HashMap<BranchKey, CacheEntry<Arc<RepoTree>>>>,
    files: Mutex<HashMap<ItemKey, CacheEntry<Arc<FileContent>>>>,
    searches: Mutex<HashMap<ItemKey, CacheEntry<Arc<Vec<String>>>>>,
    pub stats: CacheStats,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RepositoryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            trees: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            searches: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Bind the cache to one repository/branch for the duration of a request.
    /// Every binding sweeps expired entries first.
    pub fn bind(
        self: &Arc<Self>,
        backend: Arc<dyn RepoBackend>,
        repo: RepoRef,
        branch: impl Into<String>,
    ) -> CachedRepo {
        self.sweep();
        CachedRepo {
            cache: Arc::clone(self),
            backend,
            repo,
            branch: branch.into(),
        }
    }

    /// Total entries across all maps
    pub fn len(&self) -> usize {
        lock(&self.trees).len() + lock(&self.files).len() + lock(&self.searches).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.trees).clear();
        lock(&self.files).clear();
        lock(&self.searches).clear();
    }

    /// Drop expired entries, then evict oldest-inserted until under `max_entries`.
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let mut trees = lock(&self.trees);
        let mut files = lock(&self.files);
        let mut searches = lock(&self.searches);
        let before = trees.len() + files.len() + searches.len();

        let (tree_ttl, file_ttl, search_ttl) = (
            self.config.tree_ttl(),
            self.config.file_ttl(),
            self.config.search_ttl(),
        );
        trees.retain(|_, e| e.is_fresh(tree_ttl));
        files.retain(|_, e| e.is_fresh(file_ttl));
        searches.retain(|_, e| e.is_fresh(search_ttl));

        let total = trees.len() + files.len() + searches.len();
        if total > self.config.max_entries {
            let mut slots: Vec<(Instant, Slot)> = Vec::with_capacity(total);
            slots.extend(trees.iter().map(|(k, e)| (e.timestamp, Slot::Tree(k.clone()))));
            slots.extend(files.iter().map(|(k, e)| (e.timestamp, Slot::File(k.clone()))));
            slots.extend(
                searches
                    .iter()
                    .map(|(k, e)| (e.timestamp, Slot::Search(k.clone()))),
            );
            slots.sort_by_key(|(ts, _)| *ts);

            for (_, slot) in slots.into_iter().take(total - self.config.max_entries) {
                match slot {
                    Slot::Tree(k) => {
                        trees.remove(&k);
                    }
                    Slot::File(k) => {
                        files.remove(&k);
                    }
                    Slot::Search(k) => {
                        searches.remove(&k);
                    }
                }
            }
        }

        let removed = before - (trees.len() + files.len() + searches.len());
        if removed > 0 {
            debug!(removed, "Swept repository cache");
        }
        removed
    }

    /// Forget a file so the next read observes the committed content
    pub fn invalidate_file(&self, repo: &RepoRef, branch: &str, path: &str) {
        let key = ItemKey {
            branch: BranchKey::new(repo, branch),
            item: path.to_string(),
        };
        lock(&self.files).remove(&key);
    }

    /// Forget the directory listing and every filename search derived from it
    pub fn invalidate_listing(&self, repo: &RepoRef, branch: &str) {
        let key = BranchKey::new(repo, branch);
        lock(&self.trees).remove(&key);
        lock(&self.searches).retain(|k, _| k.branch != key);
    }

    fn hit(&self) {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
    }
}

/// The cache bound to one repository and branch
#[derive(Clone)]
pub struct CachedRepo {
    cache: Arc<RepositoryCache>,
    backend: Arc<dyn RepoBackend>,
    repo: RepoRef,
    branch: String,
}

impl CachedRepo {
    pub fn repo(&self) -> &RepoRef {
        &self.repo
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn backend(&self) -> &Arc<dyn RepoBackend> {
        &self.backend
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.cache.config.max_file_bytes
    }

    /// Point subsequent reads and writes at another branch
    pub fn switch_branch(&mut self, branch: impl Into<String>) {
        self.branch = branch.into();
    }

    fn branch_key(&self) -> BranchKey {
        BranchKey::new(&self.repo, &self.branch)
    }

    fn item_key(&self, item: &str) -> ItemKey {
        ItemKey {
            branch: self.branch_key(),
            item: item.to_string(),
        }
    }

    pub async fn get_tree(&self) -> Result<Arc<RepoTree>> {
        let key = self.branch_key();
        let ttl = self.cache.config.tree_ttl();

        if let Some(entry) = lock(&self.cache.trees).get(&key)
            && entry.is_fresh(ttl)
        {
            self.cache.hit();
            debug!(repo = %self.repo, branch = %self.branch, "Tree cache hit");
            return Ok(Arc::clone(&entry.value));
        }

        self.cache.miss();
        let entries = self.backend.list_tree(&self.repo, &self.branch).await?;
        let tree = Arc::new(RepoTree::from_entries(entries));
        info!(
            repo = %self.repo,
            branch = %self.branch,
            files = tree.file_count(),
            "Cached repository tree"
        );
        lock(&self.cache.trees).insert(key, CacheEntry::new(Arc::clone(&tree)));
        Ok(tree)
    }

    /// Cached read. Files whose known size exceeds the ceiling are refused
    /// without being fetched.
    pub async fn get_file(&self, path: &str) -> Result<Arc<FileContent>> {
        let path = normalize_path(path);
        let key = self.item_key(&path);
        let ttl = self.cache.config.file_ttl();

        if let Some(entry) = lock(&self.cache.files).get(&key)
            && entry.is_fresh(ttl)
        {
            self.cache.hit();
            debug!(path = %path, "File cache hit");
            return Ok(Arc::clone(&entry.value));
        }

        self.check_known_size(&path)?;

        self.cache.miss();
        let file = Arc::new(
            self.backend
                .get_file(&self.repo, &self.branch, &path, self.max_file_bytes())
                .await?,
        );
        lock(&self.cache.files).insert(key, CacheEntry::new(Arc::clone(&file)));
        Ok(file)
    }

    /// Uncached read, used wherever a stale view would be unsafe
    pub async fn get_file_live(&self, path: &str) -> Result<FileContent> {
        let path = normalize_path(path);
        self.check_known_size(&path)?;
        self.backend
            .get_file(&self.repo, &self.branch, &path, self.max_file_bytes())
            .await
    }

    pub fn invalidate_file(&self, path: &str) {
        self.cache
            .invalidate_file(&self.repo, &self.branch, &normalize_path(path));
    }

    pub fn invalidate_tree(&self) {
        self.cache.invalidate_listing(&self.repo, &self.branch);
    }

    /// Case-insensitive substring match over file paths
    pub async fn search_by_name(&self, query: &str) -> Result<Arc<Vec<String>>> {
        let needle = query.trim().to_lowercase();
        let key = self.item_key(&needle);
        let ttl = self.cache.config.search_ttl();

        if let Some(entry) = lock(&self.cache.searches).get(&key)
            && entry.is_fresh(ttl)
        {
            self.cache.hit();
            return Ok(Arc::clone(&entry.value));
        }

        let tree = self.get_tree().await?;
        let matches: Arc<Vec<String>> = Arc::new(
            tree.files()
                .filter(|e| e.path.to_lowercase().contains(&needle))
                .map(|e| e.path.clone())
                .collect(),
        );
        lock(&self.cache.searches).insert(key, CacheEntry::new(Arc::clone(&matches)));
        Ok(matches)
    }

    // Only consults an already-cached tree; never fetches one just to check.
    fn check_known_size(&self, path: &str) -> Result<()> {
        let trees = lock(&self.cache.trees);
        let known = trees
            .get(&self.branch_key())
            .filter(|e| e.is_fresh(self.cache.config.tree_ttl()))
            .and_then(|e| e.value.get(path).and_then(|entry| entry.size));

        match known {
            Some(size) if size > self.max_file_bytes() => Err(PilotError::FileTooLarge {
                path: path.to_string(),
                size,
                limit: self.max_file_bytes(),
            }),
            _ => Ok(()),
        }
    }
}

/// Repository paths are relative and slash-separated
pub fn normalize_path(path: &str) -> String {
    path.trim().trim_start_matches("./").trim_matches('/').to_string()
}
