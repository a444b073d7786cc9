//! Request signature cache
//!
//! Results are memoized in a tree keyed by the composite keys of a request
//! signature (`"field <==> value"`), one tree level per key. A lookup only
//! hits when it walks the exact full path of a stored signature and lands
//! on a leaf.
//!
//! The cache is constructed explicitly and shared by handle; concurrent
//! `store`/`fetch` calls are serialized by a single lock over the tree.
//! There is no eviction.

use crate::request::{RequestSignature, SignatureSchema};
use crate::{Error, Result};
use indexmap::IndexMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

mod inversion;

pub use inversion::route_from_keys;

type Children<V> = IndexMap<String, CacheNode<V>>;

/// One node of the key tree
#[derive(Debug, Clone, PartialEq)]
pub enum CacheNode<V> {
    /// Stored result
    Leaf(V),
    /// Branch keyed by composite key, children in insertion order
    Interior(Children<V>),
}

impl<V> CacheNode<V> {
    /// Turn this node into an interior node (dropping a leaf value) and
    /// return its children.
    fn make_interior(&mut self) -> &mut Children<V> {
        if let CacheNode::Leaf(_) = self {
            *self = CacheNode::Interior(IndexMap::new());
        }
        match self {
            CacheNode::Interior(children) => children,
            CacheNode::Leaf(_) => unreachable!("leaf replaced by interior node above"),
        }
    }
}

/// Memoizes results by request signature
pub struct SignatureCache<V> {
    schema: SignatureSchema,
    root: RwLock<Children<V>>,
}

impl<V: Clone> SignatureCache<V> {
    pub fn new(schema: SignatureSchema) -> Self {
        Self {
            schema,
            root: RwLock::new(IndexMap::new()),
        }
    }

    pub fn schema(&self) -> &SignatureSchema {
        &self.schema
    }

    /// Store `value` under the full key path of `signature`.
    ///
    /// A signature missing a base field leaves the tree untouched and returns
    /// [`Error::InvalidSignature`]. Leaves in the way of the path become
    /// interior nodes; the last writer for a signature wins.
    pub async fn store(&self, signature: &RequestSignature, value: V) -> Result<()> {
        let keys = self.schema.key_path(signature)?;
        let (last, prefix) = keys
            .split_last()
            .ok_or_else(|| Error::Internal("empty key path".to_string()))?;

        debug!("Adding data to cache @ key signature = {:?}", keys);

        let mut root = self.root.write().await;
        let mut children: &mut Children<V> = &mut root;
        for key in prefix {
            children = children
                .entry(key.clone())
                .or_insert_with(|| CacheNode::Interior(IndexMap::new()))
                .make_interior();
        }
        children.insert(last.clone(), CacheNode::Leaf(value));
        Ok(())
    }

    /// Store and log a rejected signature instead of returning it.
    ///
    /// Returns whether the value was stored. Caching failure never affects
    /// the caller's primary result.
    pub async fn store_or_log(&self, signature: &RequestSignature, value: V) -> bool {
        match self.store(signature, value).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Cannot cache result for {:?}: {}", signature, e);
                false
            }
        }
    }

    /// Fetch the value stored under the exact key path of `signature`.
    ///
    /// Returns `Ok(None)` when any segment is missing or the path ends on an
    /// interior node.
    pub async fn fetch(&self, signature: &RequestSignature) -> Result<Option<V>> {
        let keys = self.schema.key_path(signature)?;
        debug!("Attempting to pull cached data for {:?}", keys);

        let root = self.root.read().await;
        let mut children: &Children<V> = &root;
        let last_index = keys.len().saturating_sub(1);

        for (i, key) in keys.iter().enumerate() {
            match children.get(key) {
                Some(CacheNode::Leaf(value)) if i == last_index => return Ok(Some(value.clone())),
                Some(CacheNode::Interior(next)) if i < last_index => children = next,
                _ => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Stored key paths in insertion order, one per leaf
    pub async fn key_paths(&self) -> Vec<Vec<String>> {
        let root = self.root.read().await;
        let mut paths = Vec::new();
        let mut current = Vec::new();
        collect_paths(&root, &mut current, &mut paths);
        paths
    }

    /// Canonical routes of every stored entry
    pub async fn routes(&self, root: &str) -> Result<Vec<String>> {
        self.key_paths()
            .await
            .iter()
            .map(|keys| route_from_keys(&self.schema, keys, root))
            .collect()
    }

    /// Number of stored leaves
    pub async fn len(&self) -> usize {
        let root = self.root.read().await;
        count_leaves(&root)
    }

    pub async fn is_empty(&self) -> bool {
        self.root.read().await.is_empty()
    }

    /// Drop every entry
    pub async fn clear(&self) {
        self.root.write().await.clear();
    }
}

fn collect_paths<V>(children: &Children<V>, current: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    for (key, node) in children {
        current.push(key.clone());
        match node {
            CacheNode::Leaf(_) => out.push(current.clone()),
            CacheNode::Interior(next) => collect_paths(next, current, out),
        }
        current.pop();
    }
}

fn count_leaves<V>(children: &Children<V>) -> usize {
    children
        .values()
        .map(|node| match node {
            CacheNode::Leaf(_) => 1,
            CacheNode::Interior(next) => count_leaves(next),
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_interior_replaces_leaf() {
        let mut node = CacheNode::Leaf(5);
        node.make_interior().insert("a <==> 1".to_string(), CacheNode::Leaf(1));
        match node {
            CacheNode::Interior(children) => assert_eq!(children.len(), 1),
            CacheNode::Leaf(_) => panic!("expected interior node"),
        }
    }

    #[test]
    fn test_make_interior_keeps_existing_children() {
        let mut children = IndexMap::new();
        children.insert("a <==> 1".to_string(), CacheNode::Leaf(1));
        let mut node = CacheNode::Interior(children);
        assert_eq!(node.make_interior().len(), 1);
    }

    #[tokio::test]
    async fn test_len_counts_leaves_only() {
        let cache = SignatureCache::new(SignatureSchema::metrics_api());
        let base = RequestSignature::new()
            .with("cohort_expr", "1")
            .with("metric", "edit_count");
        cache.store(&base, 1).await.unwrap();
        cache.store(&base.clone().with("project", "enwiki"), 2).await.unwrap();
        cache.store(&base.clone().with("namespace", "0"), 3).await.unwrap();
        // The first leaf became an interior node on the second store
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.key_paths().await.len(), 2);
    }
}
