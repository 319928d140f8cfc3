use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct CacheInner {
    validators: HashMap<String, String>,
    allowed_methods: HashMap<String, Vec<String>>,
}

/// Per-URI conditional-fetch state shared by every clone of a client.
///
/// Only the fetch client writes here, immediately after a request completes.
#[derive(Clone, Default)]
pub struct FetchCache {
    inner: Arc<RwLock<CacheInner>>,
}

impl FetchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validator(&self, uri: &str) -> Option<String> {
        self.inner.read().validators.get(uri).cloned()
    }

    pub fn allowed_methods(&self, uri: &str) -> Option<Vec<String>> {
        self.inner.read().allowed_methods.get(uri).cloned()
    }

    /// Records whatever the server sent back; absent headers leave the
    /// previous values in place.
    pub fn remember(&self, uri: &str, validator: Option<&str>, allow: Option<&str>) {
        let mut inner = self.inner.write();
        if let Some(tag) = validator {
            inner.validators.insert(uri.to_string(), tag.to_string());
        }
        if let Some(allow) = allow {
            inner
                .allowed_methods
                .insert(uri.to_string(), parse_allow(allow));
        }
    }

    /// After a mutation the stored validator no longer describes the
    /// resource, so it is replaced or dropped.
    pub fn replace_validator(&self, uri: &str, validator: Option<&str>) {
        let mut inner = self.inner.write();
        match validator {
            Some(tag) => {
                inner.validators.insert(uri.to_string(), tag.to_string());
            }
            None => {
                inner.validators.remove(uri);
            }
        }
    }

    pub fn remove(&self, uri: &str) {
        let mut inner = self.inner.write();
        inner.validators.remove(uri);
        inner.allowed_methods.remove(uri);
    }

    pub fn flush(&self) {
        let mut inner = self.inner.write();
        inner.validators.clear();
        inner.allowed_methods.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_allow(allow: &str) -> Vec<String> {
    allow
        .split(',')
        .map(|m| m.trim().to_ascii_uppercase())
        .filter(|m| !m.is_empty())
        .collect()
}
