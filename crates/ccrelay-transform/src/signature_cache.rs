//! Process-lifetime map from `tool_use_id | thinking_block_hash` to the last
//! signature observed for it, tagged with the model family that issued it
//! (SPEC_FULL.md §3, §4.B). Bounded by a simple size cap with LRU eviction;
//! thread-safe via an internal mutex since it's written once per response
//! and read concurrently by streaming handlers.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Claude,
    Gemini,
}

/// Derives the upstream wire family a client-facing model id targets. The
/// accepted catalog is all Claude ids or all Gemini ids (never mixed), so a
/// simple prefix check is sufficient.
pub fn model_family(model: &str) -> ModelFamily {
    if model.starts_with("claude") {
        ModelFamily::Claude
    } else {
        ModelFamily::Gemini
    }
}

#[cfg(test)]
mod model_family_tests {
    use super::*;

    #[test]
    fn claude_prefixed_ids_are_claude_family() {
        assert_eq!(model_family("claude-opus-4-1-20250805"), ModelFamily::Claude);
    }

    #[test]
    fn anything_else_is_gemini_family() {
        assert_eq!(model_family("gemini-2.5-pro"), ModelFamily::Gemini);
        assert_eq!(model_family("unknown-model"), ModelFamily::Gemini);
    }
}

#[derive(Debug, Clone)]
struct Entry {
    signature: String,
    family: ModelFamily,
    /// Monotonic insertion/touch counter used to find the LRU victim.
    last_touch: u64,
}

pub struct SignatureCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    clock: u64,
}

impl SignatureCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), inner: Mutex::new(Inner { entries: HashMap::new(), clock: 0 }) }
    }

    pub fn insert(&self, key: impl Into<String>, signature: impl Into<String>, family: ModelFamily) {
        let mut inner = self.inner.lock().expect("signature cache poisoned");
        inner.clock += 1;
        let clock = inner.clock;
        let key = key.into();
        let at_capacity = inner.entries.len() >= self.capacity;
        if at_capacity && !inner.entries.contains_key(&key) {
            if let Some(victim) = inner.entries.iter().min_by_key(|(_, e)| e.last_touch).map(|(k, _)| k.clone()) {
                inner.entries.remove(&victim);
            }
        }
        inner.entries.insert(key, Entry { signature: signature.into(), family, last_touch: clock });
    }

    pub fn get(&self, key: &str) -> Option<(String, ModelFamily)> {
        let mut inner = self.inner.lock().expect("signature cache poisoned");
        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner.entries.get_mut(key)?;
        entry.last_touch = clock;
        Some((entry.signature.clone(), entry.family))
    }

    pub fn contains_family(&self, family: ModelFamily) -> bool {
        let inner = self.inner.lock().expect("signature cache poisoned");
        inner.entries.values().any(|e| e.family == family)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("signature cache poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let cache = SignatureCache::new(8);
        cache.insert("toolu_1", "sig-abc", ModelFamily::Claude);
        let (sig, family) = cache.get("toolu_1").unwrap();
        assert_eq!(sig, "sig-abc");
        assert_eq!(family, ModelFamily::Claude);
    }

    #[test]
    fn evicts_least_recently_touched_when_full() {
        let cache = SignatureCache::new(2);
        cache.insert("a", "sig-a", ModelFamily::Claude);
        cache.insert("b", "sig-b", ModelFamily::Claude);
        cache.get("a");
        cache.insert("c", "sig-c", ModelFamily::Claude);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn contains_family_detects_cross_family_history() {
        let cache = SignatureCache::new(8);
        cache.insert("t1", "sig", ModelFamily::Gemini);
        assert!(cache.contains_family(ModelFamily::Gemini));
        assert!(!cache.contains_family(ModelFamily::Claude));
    }
}
