//! Substitution of machine specific root directories.
//!
//! Two machines building the same project rarely check it out at the same
//! path. Before paths and file contents are hashed into keys, every
//! registered root is replaced by a two byte token (`\x01` followed by
//! `b'A' + index`) so entries written on one machine hit on another.

use color_eyre::{Result, eyre::bail};
use derive_more::Debug;
use tracing::instrument;

/// Marks the start of a root token.
pub const ROOT_TOKEN_MARKER: u8 = 0x01;

const MAX_ROOTS: usize = 26;

/// Ordered list of registered roots.
///
/// Matching always picks the longest registered root, so nested roots (a
/// project inside a workspace, say) resolve to the most specific one.
/// Tokens are derived from registration order, which must therefore be the
/// same on every machine sharing a cache.
#[derive(Clone, Default, Debug)]
#[debug("RootPaths({:?})", self.roots)]
pub struct RootPaths {
    roots: Vec<String>,

    /// Indices into `roots`, longest root first.
    by_length: Vec<usize>,
}

impl RootPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a root directory. Trailing separators are ignored.
    #[instrument(name = "RootPaths::register", skip(self))]
    pub fn register(&mut self, root: impl AsRef<str> + std::fmt::Debug) -> Result<()> {
        let root = root.as_ref().trim_end_matches(['/', '\\']);
        if root.is_empty() {
            bail!("root path must not be empty");
        }
        if root.as_bytes().contains(&ROOT_TOKEN_MARKER) {
            bail!("root path must not contain the token marker");
        }
        if self.roots.iter().any(|existing| existing == root) {
            return Ok(());
        }
        if self.roots.len() >= MAX_ROOTS {
            bail!("at most {MAX_ROOTS} roots can be registered");
        }
        self.roots.push(root.to_string());
        self.by_length = (0..self.roots.len()).collect();
        self.by_length
            .sort_by(|a, b| self.roots[*b].len().cmp(&self.roots[*a].len()));
        Ok(())
    }

    /// Build from a list of roots, registered in order.
    pub fn from_roots(roots: impl IntoIterator<Item = impl AsRef<str>>) -> Result<Self> {
        let mut paths = Self::new();
        for root in roots {
            paths.register(root.as_ref())?;
        }
        Ok(paths)
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Replace the longest root that prefixes `path` with its token.
    ///
    /// Only whole directory names match: `/src/app` is not a prefix of
    /// `/src/application`.
    pub fn normalize_path(&self, path: &str) -> String {
        for &index in &self.by_length {
            let root = &self.roots[index];
            if let Some(rest) = path.strip_prefix(root.as_str()) {
                if rest.is_empty() || rest.starts_with(['/', '\\']) {
                    let mut normalized = String::with_capacity(rest.len() + 2);
                    normalized.push(char::from(ROOT_TOKEN_MARKER));
                    normalized.push(char::from(token(index)));
                    normalized.push_str(rest);
                    return normalized;
                }
            }
        }
        path.to_string()
    }

    /// Reverse of [`RootPaths::normalize_path`]. Paths without a token are
    /// returned unchanged.
    pub fn denormalize_path(&self, path: &str) -> Result<String> {
        let bytes = path.as_bytes();
        if bytes.first() != Some(&ROOT_TOKEN_MARKER) {
            return Ok(path.to_string());
        }
        let Some(root) = bytes.get(1).and_then(|token| self.root_for_token(*token)) else {
            bail!("path {path:?} references an unregistered root");
        };
        Ok(format!("{root}{}", &path[2..]))
    }

    /// Replace every occurrence of every root in `content` with its token.
    ///
    /// Returns `None` when nothing was replaced, so callers can keep the
    /// original buffer and its unflagged key. Content that already holds a
    /// marker byte is never normalized, since expanding it again would turn
    /// that byte into a root.
    pub fn normalize_content(&self, content: &[u8]) -> Option<Vec<u8>> {
        if self.roots.is_empty() || content.contains(&ROOT_TOKEN_MARKER) {
            return None;
        }
        let mut normalized = Vec::with_capacity(content.len());
        let mut replaced = false;
        let mut position = 0;
        'scan: while position < content.len() {
            for &index in &self.by_length {
                let root = self.roots[index].as_bytes();
                if content[position..].starts_with(root) {
                    normalized.push(ROOT_TOKEN_MARKER);
                    normalized.push(token(index));
                    position += root.len();
                    replaced = true;
                    continue 'scan;
                }
            }
            normalized.push(content[position]);
            position += 1;
        }
        replaced.then_some(normalized)
    }

    /// Expand every token in `content` back to the local root.
    pub fn denormalize_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let mut denormalized = Vec::with_capacity(content.len());
        let mut bytes = content.iter().copied();
        while let Some(byte) = bytes.next() {
            if byte != ROOT_TOKEN_MARKER {
                denormalized.push(byte);
                continue;
            }
            let Some(token) = bytes.next() else {
                bail!("content ends inside a root token");
            };
            let Some(root) = self.root_for_token(token) else {
                bail!("content references unregistered root token {token:#x}");
            };
            denormalized.extend_from_slice(root.as_bytes());
        }
        Ok(denormalized)
    }

    fn root_for_token(&self, token: u8) -> Option<&str> {
        let index = token.checked_sub(b'A')?;
        self.roots.get(usize::from(index)).map(String::as_str)
    }
}

fn token(index: usize) -> u8 {
    b'A' + index as u8
}
