use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde_json::{Value, json};

use crate::aggregator::Executor;
use crate::error::{Error, Result};
use crate::eval::Plan;
use crate::options::AggregateOptions;
use crate::query;
use crate::stage::{self, Stage};

/// In-memory reference engine. Holds named collections of JSON documents
/// and runs stage lists against them.
///
/// Thread-safe: a single `RwLock` guards the collection map, so concurrent
/// aggregations only take read locks.
#[derive(Debug, Default)]
pub struct MemoryDb {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty collection. Inserting into a missing collection also
    /// creates it.
    pub fn create_collection(&self, name: &str) -> Result<()> {
        let mut cols = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        if cols.contains_key(name) {
            return Err(Error::CollectionAlreadyExists(name.to_string()));
        }
        cols.insert(name.to_string(), Vec::new());
        Ok(())
    }

    /// List all collection names, sorted.
    pub fn list_collections(&self) -> Vec<String> {
        let cols = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = cols.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn drop_collection(&self, name: &str) {
        let mut cols = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        cols.remove(name);
    }

    pub fn insert(&self, collection: &str, doc: Value) -> Result<()> {
        self.insert_many(collection, vec![doc])
    }

    /// Insert documents in order. Nothing is written if any of them is not
    /// a JSON object.
    pub fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<()> {
        if docs.iter().any(|d| !d.is_object()) {
            return Err(Error::NotAnObject);
        }
        let mut cols = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        cols.entry(collection.to_string()).or_default().extend(docs);
        Ok(())
    }

    /// Documents of `collection` matching `query`, in insertion order. A
    /// missing collection reads as empty.
    pub fn find(&self, collection: &str, query: &Value) -> Result<Vec<Value>> {
        let parsed = query::parse_query(query)?;
        let cols = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cols
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| query::matches(&parsed, d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn count(&self, collection: &str, query: &Value) -> Result<usize> {
        Ok(self.find(collection, query)?.len())
    }

    /// Run `stages` against `collection`.
    pub fn aggregate(&self, collection: &str, stages: &[Stage], options: &AggregateOptions) -> Result<Vec<Value>> {
        let plan = Plan::parse(&stage::stages_to_value(stages))?;
        tracing::debug!(
            collection,
            steps = plan.len(),
            options = %options.to_json(),
            "running aggregation"
        );

        let initial_docs = self.find(collection, &json!({}))?;
        let lookup_fn = |foreign: &str, query: &Value| -> Result<Vec<Value>> { self.find(foreign, query) };

        let out = plan.execute(initial_docs, &lookup_fn)?;
        tracing::debug!(collection, results = out.len(), "aggregation finished");
        Ok(out)
    }

    /// Executor handle for one collection.
    pub fn collection(&self, name: impl Into<String>) -> CollectionRef<'_> {
        CollectionRef {
            db: self,
            name: name.into(),
        }
    }
}

/// A named collection of a [`MemoryDb`], usable as an aggregation target.
#[derive(Debug, Clone)]
pub struct CollectionRef<'a> {
    db: &'a MemoryDb,
    name: String,
}

impl CollectionRef<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Executor for CollectionRef<'_> {
    type Error = Error;

    fn aggregate(&self, stages: &[Stage], options: &AggregateOptions) -> Result<Vec<Value>> {
        self.db.aggregate(&self.name, stages, options)
    }
}
