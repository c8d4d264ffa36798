//! Virtual session state: the fictitious filesystem and environment that
//! the model's structured calls establish and later read back.
//!
//! Everything here is pure data.  Paths are keyed by their normalized
//! absolute form (see [`normalize`]); there is no notion of "not found";
//! unknown paths simply have no node yet.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

// ── Nodes ────────────────────────────────────────────────────

/// What a path is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    File,
    #[serde(alias = "directory")]
    Dir,
    Symlink,
}

/// Metadata for one path in the virtual filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VirtualNode {
    pub path: String,
    pub kind: NodeKind,
    pub permissions: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub size: Option<String>,
    pub modified: Option<String>,
    pub language: Option<String>,
    pub link_target: Option<String>,
}

impl VirtualNode {
    /// Minimal node with only a path and a kind.
    pub fn new(path: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            ..Self::default()
        }
    }
}

/// One entry reported by a directory listing, relative to that directory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListingEntry {
    pub name: String,
    pub kind: NodeKind,
    pub permissions: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub size: Option<String>,
    pub modified: Option<String>,
    pub link_target: Option<String>,
}

// ── Mutation batches ─────────────────────────────────────────

/// A create/update descriptor inside a [`MutationBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeUpsert {
    pub path: String,
    pub kind: Option<NodeKind>,
    pub permissions: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub size: Option<String>,
    pub modified: Option<String>,
    pub language: Option<String>,
    pub link_target: Option<String>,
    pub content: Option<String>,
}

/// The single entry point for bulk state changes.
///
/// Applied in a fixed order: directory change, upserts, removals,
/// environment merges.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MutationBatch {
    pub directory: Option<String>,
    pub create: Vec<NodeUpsert>,
    pub remove: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

impl MutationBatch {
    pub fn is_empty(&self) -> bool {
        self.directory.is_none()
            && self.create.is_empty()
            && self.remove.is_empty()
            && self.environment.is_empty()
    }
}

// ── SessionState ─────────────────────────────────────────────

/// Per-session virtual machine state.  Owned by exactly one session.
#[derive(Debug, Clone)]
pub struct SessionState {
    cwd: String,
    nodes: HashMap<String, VirtualNode>,
    contents: HashMap<String, String>,
    env: BTreeMap<String, String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    /// Fresh state rooted at `/` with nothing explored yet.
    pub fn new() -> Self {
        Self {
            cwd: "/".to_string(),
            nodes: HashMap::new(),
            contents: HashMap::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn current_directory(&self) -> &str {
        &self.cwd
    }

    /// Resolve `raw` against the current directory.
    pub fn resolve(&self, raw: &str) -> String {
        resolve(raw, &self.cwd)
    }

    // -- writes ---------------------------------------------------------

    /// Change directory.  Existence is not checked: the filesystem is
    /// exploratory, so unknown directories are legal.
    pub fn set_current_directory(&mut self, path: &str) {
        self.cwd = self.resolve(path);
    }

    /// Record what a directory listing revealed.
    pub fn record_listing(&mut self, dir_path: &str, entries: &[ListingEntry]) {
        let dir = self.resolve(dir_path);
        self.nodes
            .entry(dir.clone())
            .or_insert_with(|| VirtualNode::new(dir.clone(), NodeKind::Dir));

        for entry in entries {
            let name = entry.name.trim_matches('/');
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            let path = resolve(name, &dir);
            self.nodes.insert(
                path.clone(),
                VirtualNode {
                    path,
                    kind: entry.kind,
                    permissions: entry.permissions.clone(),
                    owner: entry.owner.clone(),
                    group: entry.group.clone(),
                    size: entry.size.clone(),
                    modified: entry.modified.clone(),
                    language: None,
                    link_target: entry.link_target.clone(),
                },
            );
        }
    }

    /// Cache file content.  Creates a bare file node when none exists;
    /// an existing node keeps its metadata except for the language hint.
    pub fn record_content(&mut self, path: &str, text: &str, language: Option<&str>) {
        let path = self.resolve(path);
        let node = self
            .nodes
            .entry(path.clone())
            .or_insert_with(|| VirtualNode::new(path.clone(), NodeKind::File));
        if let Some(lang) = language {
            node.language = Some(lang.to_string());
        }
        self.contents.insert(path, text.to_string());
    }

    /// Apply a [`MutationBatch`].  Nothing in between steps is observable
    /// because the caller holds the only `&mut`.
    pub fn apply_mutations(&mut self, batch: &MutationBatch) {
        if let Some(dir) = batch.directory.as_deref() {
            if !dir.trim().is_empty() {
                self.set_current_directory(dir);
            }
        }

        for item in &batch.create {
            let path = self.resolve(&item.path);
            self.nodes.insert(
                path.clone(),
                VirtualNode {
                    path: path.clone(),
                    kind: item.kind.unwrap_or_default(),
                    permissions: item.permissions.clone(),
                    owner: item.owner.clone(),
                    group: item.group.clone(),
                    size: item.size.clone(),
                    modified: item.modified.clone(),
                    language: item.language.clone(),
                    link_target: item.link_target.clone(),
                },
            );
            if let Some(content) = &item.content {
                self.contents.insert(path, content.clone());
            }
        }

        for raw in &batch.remove {
            let target = self.resolve(raw);
            self.remove_tree(&target);
        }

        for (key, value) in &batch.environment {
            self.env.insert(key.clone(), value.clone());
        }
    }

    /// Remove `target` and everything beneath it, content included.
    fn remove_tree(&mut self, target: &str) {
        let prefix = if target == "/" {
            "/".to_string()
        } else {
            format!("{target}/")
        };
        let covered = |key: &str| key == target || key.starts_with(&prefix);
        self.nodes.retain(|key, _| !covered(key));
        self.contents.retain(|key, _| !covered(key));
    }

    // -- reads ----------------------------------------------------------

    pub fn node(&self, path: &str) -> Option<&VirtualNode> {
        self.nodes.get(&self.resolve(path))
    }

    pub fn has_content(&self, path: &str) -> bool {
        self.contents.contains_key(&self.resolve(path))
    }

    pub fn content(&self, path: &str) -> Option<&str> {
        self.contents.get(&self.resolve(path)).map(String::as_str)
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // -- serialization --------------------------------------------------

    /// Compact, path-sorted snapshot fed back to the model as context.
    ///
    /// Identical state always produces identical text.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "cwd: {}", self.cwd);

        if self.nodes.is_empty() {
            out.push_str("filesystem: unexplored\n");
        } else {
            out.push_str("known filesystem:\n");
            let mut paths: Vec<&String> = self.nodes.keys().collect();
            paths.sort();
            for path in paths {
                let node = &self.nodes[path];
                let suffix = if node.kind == NodeKind::Dir && path != "/" {
                    "/"
                } else {
                    ""
                };
                let _ = write!(out, "  {path}{suffix}");
                if node.kind == NodeKind::Symlink {
                    if let Some(target) = &node.link_target {
                        let _ = write!(out, " -> {target}");
                    }
                }
                if let Some(size) = &node.size {
                    let _ = write!(out, " ({size})");
                }
                if self.contents.contains_key(path) {
                    out.push_str(" [cached]");
                }
                out.push('\n');
            }
        }

        if !self.env.is_empty() {
            out.push_str("env:\n");
            for (key, value) in &self.env {
                let _ = writeln!(out, "  {key}={value}");
            }
        }

        if out.ends_with('\n') {
            out.pop();
        }
        out
    }
}

// ── Path helpers ─────────────────────────────────────────────

/// Resolve `raw` against `cwd` into a normalized absolute path.
///
/// * empty or `.` → `cwd`
/// * `~` (or `~/...`) → root-relative
/// * absolute → normalized
/// * relative → joined onto `cwd`, then normalized
pub fn resolve(raw: &str, cwd: &str) -> String {
    let path = raw.trim();
    if path.is_empty() || path == "." {
        return normalize(cwd);
    }
    if path == "~" {
        return "/".to_string();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return normalize(rest);
    }
    if path.starts_with('/') {
        return normalize(path);
    }
    normalize(&format!("{cwd}/{path}"))
}

/// Drop empty and `.` segments and pop one segment per `..`.
/// Popping past the root is a no-op.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}
