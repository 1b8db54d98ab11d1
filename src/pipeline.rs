use std::sync::Arc;

use serde_json::{Map, Value};

use crate::date_range::DateRange;
use crate::error::{Error, Result};
use crate::merge::{self, MergeStrategy};
use crate::paginate::{self, PaginationOptions};
use crate::registry::MacroRegistry;
use crate::stage::{self, Stage};

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// Gate for [`Pipeline::when`]: a literal `bool` or a zero-argument predicate.
pub trait Condition {
    fn holds(self) -> bool;
}

impl Condition for bool {
    fn holds(self) -> bool {
        self
    }
}

impl<F: FnOnce() -> bool> Condition for F {
    fn holds(self) -> bool {
        self()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Ordered, append-only stage accumulator.
///
/// The only rewrite is the filter merge: appending a `$match` right after
/// another `$match` folds the new body into the last stage. Everything else,
/// including macro output, is appended as-is.
///
/// This is also the view handed to [`Pipeline::when`] callbacks, so it has
/// no way to run or snapshot the pipeline through a `&mut` borrow.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    strategy: MergeStrategy,
    registry: Arc<MacroRegistry>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// Empty pipeline resolving macros against [`MacroRegistry::global`].
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            strategy: MergeStrategy::default(),
            registry: MacroRegistry::global(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<MacroRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn merge_strategy(&self) -> MergeStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn last(&self) -> Option<&Stage> {
        self.stages.last()
    }

    pub(crate) fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn into_stages(self) -> Vec<Stage> {
        self.stages
    }

    /// Consume into the JSON array form, e.g. for a `$lookup` or `$facet`
    /// sub-pipeline.
    pub fn into_value(self) -> Value {
        stage::stages_to_value(&self.stages)
    }

    fn push(&mut self, stage: Stage) -> &mut Self {
        tracing::debug!(stage = stage.tag().unwrap_or("raw"), position = self.stages.len(), "appending stage");
        self.stages.push(stage);
        self
    }

    // -----------------------------------------------------------------------
    // Stage appends
    // -----------------------------------------------------------------------

    /// Append a `$match`, merging into the last stage if it is also a `$match`.
    pub fn filter(&mut self, body: impl Into<Value>) -> &mut Self {
        let body = body.into();
        if let Some(Stage::Match(existing)) = self.stages.last_mut() {
            let report = merge::merge_filters_report(std::mem::take(existing), body, self.strategy);
            for field in &report.clobbered {
                tracing::warn!(field = %field, "$match merge replaced an array constraint with a non-array value");
            }
            *existing = report.merged;
            tracing::debug!(position = self.stages.len() - 1, "merged $match into previous stage");
        } else {
            self.push(Stage::Match(body));
        }
        self
    }

    /// Append the range constraint through [`Pipeline::filter`]. A range
    /// with no bounds appends nothing.
    pub fn date_range(&mut self, range: DateRange) -> &mut Self {
        if let Some(body) = range.to_filter() {
            self.filter(body);
        }
        self
    }

    pub fn sort(&mut self, body: impl Into<Value>) -> &mut Self {
        self.push(Stage::Sort(body.into()))
    }

    pub fn project(&mut self, body: impl Into<Value>) -> &mut Self {
        self.push(Stage::Project(body.into()))
    }

    pub fn group(&mut self, body: impl Into<Value>) -> &mut Self {
        self.push(Stage::Group(body.into()))
    }

    /// Append a `$lookup`.
    pub fn join(&mut self, body: impl Into<Value>) -> &mut Self {
        self.push(Stage::Lookup(body.into()))
    }

    /// Append an `$unwind`. A bare path string becomes `{"path": ...}`.
    pub fn unwind(&mut self, path_or_body: impl Into<Value>) -> &mut Self {
        let body = match path_or_body.into() {
            Value::String(path) => {
                let mut map = Map::new();
                map.insert("path".to_string(), Value::String(path));
                Value::Object(map)
            }
            other => other,
        };
        self.push(Stage::Unwind(body))
    }

    pub fn limit(&mut self, n: u64) -> &mut Self {
        self.push(Stage::Limit(n))
    }

    pub fn skip(&mut self, n: u64) -> &mut Self {
        self.push(Stage::Skip(n))
    }

    pub fn set(&mut self, body: impl Into<Value>) -> &mut Self {
        self.push(Stage::Set(body.into()))
    }

    pub fn add_fields(&mut self, body: impl Into<Value>) -> &mut Self {
        self.push(Stage::AddFields(body.into()))
    }

    pub fn replace_root(&mut self, body: impl Into<Value>) -> &mut Self {
        self.push(Stage::ReplaceRoot(body.into()))
    }

    pub fn facet(&mut self, body: impl Into<Value>) -> &mut Self {
        self.push(Stage::Facet(body.into()))
    }

    /// Append a `$merge` output stage.
    pub fn merge_output(&mut self, body: impl Into<Value>) -> &mut Self {
        self.push(Stage::Merge(body.into()))
    }

    pub fn union_with(&mut self, body: impl Into<Value>) -> &mut Self {
        self.push(Stage::UnionWith(body.into()))
    }

    /// Append a complete stage object verbatim. Never merges.
    pub fn raw(&mut self, stage: impl Into<Value>) -> &mut Self {
        self.push(Stage::from_value(stage.into()))
    }

    /// Append the three-stage pagination tail.
    pub fn paginate(&mut self, opts: PaginationOptions) -> &mut Self {
        for stage in paginate::paginate(opts) {
            self.push(stage);
        }
        self
    }

    // -----------------------------------------------------------------------
    // Macros & conditionals
    // -----------------------------------------------------------------------

    /// Splice the output of the macro registered under `name`.
    ///
    /// Spliced stages are appended in order and never merged, even a
    /// `$match` landing right after another `$match`.
    pub fn use_macro(&mut self, name: &str, args: &[Value]) -> Result<&mut Self> {
        let mac = self
            .registry
            .get(name)
            .ok_or_else(|| Error::MacroNotFound(name.to_string()))?;
        let stages = mac.call(args).into_stages();
        tracing::debug!(name, count = stages.len(), "splicing macro output");
        self.stages.extend(stages);
        Ok(self)
    }

    /// Run `f` against this pipeline only if `condition` holds.
    pub fn when<C, F>(&mut self, condition: C, f: F) -> &mut Self
    where
        C: Condition,
        F: FnOnce(&mut Pipeline),
    {
        if condition.holds() {
            f(self);
        }
        self
    }

    /// Fallible form of [`Pipeline::when`], for branches that call
    /// [`Pipeline::use_macro`].
    pub fn try_when<C, F>(&mut self, condition: C, f: F) -> Result<&mut Self>
    where
        C: Condition,
        F: FnOnce(&mut Pipeline) -> Result<()>,
    {
        if condition.holds() {
            f(self)?;
        }
        Ok(self)
    }
}
