//! Compiled-expression cache
//!
//! Canonical text is compiled into an evalexpr operator tree once and reused
//! for every later execution with the same shape. The cache is bounded and
//! evicts the least recently used entry; a miss simply compiles again.

use crate::error::{FormulaError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Executable form of one canonical text
pub struct CompiledExpression {
    canonical: String,
    node: evalexpr::Node,
    identifiers: Vec<String>,
    executions: AtomicU64,
}

impl CompiledExpression {
    fn compile(canonical: &str) -> Result<Self> {
        let node = evalexpr::build_operator_tree(canonical)
            .map_err(|e| FormulaError::execution(canonical, format!("Failed to compile: {}", e)))?;
        let identifiers = node
            .iter_variable_identifiers()
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Ok(Self {
            canonical: canonical.to_string(),
            node,
            identifiers,
            executions: AtomicU64::new(0),
        })
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Variable identifiers the expression reads, sorted and deduplicated
    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    /// Execute against a fully populated evaluator context
    pub fn execute(&self, context: &evalexpr::HashMapContext) -> Result<evalexpr::Value> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.node
            .eval_with_context(context)
            .map_err(|e| FormulaError::execution(&self.canonical, e.to_string()))
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledExpression")
            .field("canonical", &self.canonical)
            .field("identifiers", &self.identifiers)
            .field("executions", &self.executions())
            .finish()
    }
}

/// Compiled cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompiledCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub compilations: u64,
    pub evictions: u64,
}

struct CacheEntry {
    compiled: Arc<CompiledExpression>,
    last_used: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

/// Bounded LRU cache keyed by canonical text
pub struct CompiledCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    hits: AtomicU64,
    compilations: AtomicU64,
    evictions: AtomicU64,
}

impl CompiledCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            compilations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Compiled form of `canonical`, compiling on a miss
    ///
    /// Compilation happens under the cache lock so a shape is compiled once
    /// even when many groups reach it concurrently.
    pub fn compile(&self, canonical: &str) -> Result<Arc<CompiledExpression>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(entry) = inner.entries.get_mut(canonical) {
            entry.last_used = tick;
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(canonical, "Compiled cache hit");
            return Ok(entry.compiled.clone());
        }

        let compiled = Arc::new(CompiledExpression::compile(canonical)?);
        self.compilations.fetch_add(1, Ordering::Relaxed);
        debug!(canonical, "Compiled expression");

        if inner.entries.len() >= self.capacity {
            Self::evict_lru(&mut inner);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        inner.entries.insert(
            canonical.to_string(),
            CacheEntry {
                compiled: compiled.clone(),
                last_used: tick,
            },
        );
        Ok(compiled)
    }

    fn evict_lru(inner: &mut CacheInner) {
        let lru_key = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(k, _)| k.clone());

        if let Some(key) = lru_key {
            trace!(canonical = %key, "Evicting compiled expression");
            inner.entries.remove(&key);
        }
    }

    pub fn contains(&self, canonical: &str) -> bool {
        self.inner.lock().entries.contains_key(canonical)
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn stats(&self) -> CompiledCacheStats {
        CompiledCacheStats {
            entries: self.inner.lock().entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use evalexpr::ContextWithMutableVariables;

    fn context_with(pairs: &[(&str, f64)]) -> evalexpr::HashMapContext {
        let mut ctx = evalexpr::HashMapContext::new();
        for (name, value) in pairs {
            ctx.set_value(name.to_string(), evalexpr::Value::Float(*value))
                .unwrap();
        }
        ctx
    }

    #[test]
    fn test_one_compilation_many_executions() {
        let cache = CompiledCache::new(8);
        let canonical = "(__ref0_integrate + 1.0)";

        let first = cache.compile(canonical).unwrap();
        let a = first
            .execute(&context_with(&[("__ref0_integrate", 1.0)]))
            .unwrap();
        let second = cache.compile(canonical).unwrap();
        let b = second
            .execute(&context_with(&[("__ref0_integrate", 41.0)]))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(a, evalexpr::Value::Float(2.0));
        assert_eq!(b, evalexpr::Value::Float(42.0));
        assert_eq!(cache.stats().compilations, 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(first.executions(), 2);
    }

    #[test]
    fn test_identifiers_are_deduplicated() {
        let cache = CompiledCache::new(8);
        let compiled = cache.compile("((b + a) * b)").unwrap();
        assert_eq!(compiled.identifiers(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_lru_eviction_keeps_recent_entries() {
        let cache = CompiledCache::new(2);
        cache.compile("(1.0 + 1.0)").unwrap();
        cache.compile("(2.0 + 2.0)").unwrap();
        // Touch the first entry so the second becomes least recently used
        cache.compile("(1.0 + 1.0)").unwrap();
        cache.compile("(3.0 + 3.0)").unwrap();

        assert!(cache.contains("(1.0 + 1.0)"));
        assert!(!cache.contains("(2.0 + 2.0)"));
        assert!(cache.contains("(3.0 + 3.0)"));
        assert_eq!(cache.stats().evictions, 1);

        // Eviction only costs a recompile
        let again = cache.compile("(2.0 + 2.0)").unwrap();
        assert_eq!(
            again.execute(&evalexpr::HashMapContext::new()).unwrap(),
            evalexpr::Value::Float(4.0)
        );
        assert_eq!(cache.stats().compilations, 4);
    }

    #[test]
    fn test_compile_error_is_not_cached() {
        let cache = CompiledCache::new(2);
        assert!(cache.compile("(1.0 +").is_err());
        assert_eq!(cache.stats().entries, 0);
    }
}
