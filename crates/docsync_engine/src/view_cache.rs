//! Per-target pairing of server and event caches.

use crate::cache_node::{CacheNode, DocumentMap};

/// Cached data for one view.
///
/// `server_cache` holds server-acknowledged state only; `event_cache` is
/// the server state with pending local writes overlaid, and is what
/// listeners see. Every update returns a new value; replacing one cache
/// carries the other over unchanged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViewCache {
    event_cache: CacheNode,
    server_cache: CacheNode,
}

impl ViewCache {
    /// Creates a view cache.
    pub fn new(event_cache: CacheNode, server_cache: CacheNode) -> Self {
        Self {
            event_cache,
            server_cache,
        }
    }

    /// Creates a view cache with nothing known.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns a copy with a new server snapshot.
    pub fn update_server_snap(&self, documents: DocumentMap, complete: bool, filtered: bool) -> Self {
        self.with_server_cache(CacheNode::new(documents, complete, filtered))
    }

    /// Returns a copy with the given event cache.
    pub fn with_event_cache(&self, event_cache: CacheNode) -> Self {
        Self {
            event_cache,
            server_cache: self.server_cache.clone(),
        }
    }

    /// Returns a copy with the given server cache.
    pub fn with_server_cache(&self, server_cache: CacheNode) -> Self {
        Self {
            event_cache: self.event_cache.clone(),
            server_cache,
        }
    }

    /// The event cache.
    pub fn event_cache(&self) -> &CacheNode {
        &self.event_cache
    }

    /// The server cache.
    pub fn server_cache(&self) -> &CacheNode {
        &self.server_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{Document, Fields, Version};

    fn docs(keys: &[&str]) -> DocumentMap {
        keys.iter()
            .map(|k| {
                let doc = Document::new(*k, Version(1), Fields::new());
                (doc.key.clone(), doc)
            })
            .collect()
    }

    #[test]
    fn updating_one_side_keeps_the_other() {
        let view = ViewCache::empty().update_server_snap(docs(&["c/a"]), true, false);
        let next = view.with_event_cache(CacheNode::new(docs(&["c/a", "c/b"]), true, false));

        assert_eq!(next.server_cache(), view.server_cache());
        assert_eq!(next.event_cache().len(), 2);
        assert_eq!(view.event_cache().len(), 0);
    }

    #[test]
    fn server_snapshot_replaces_only_server_side() {
        let view = ViewCache::empty().with_event_cache(CacheNode::new(docs(&["c/a"]), false, false));
        let next = view.update_server_snap(docs(&["c/a", "c/b"]), true, true);

        assert_eq!(next.event_cache(), view.event_cache());
        assert!(next.server_cache().is_fully_initialized());
        assert!(next.server_cache().is_filtered());
        assert_eq!(next.server_cache().len(), 2);
    }
}
