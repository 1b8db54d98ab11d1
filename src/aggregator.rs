use std::sync::Arc;

use serde_json::Value;

use crate::date_range::DateRange;
use crate::error::Result;
use crate::merge::MergeStrategy;
use crate::options::AggregateOptions;
use crate::paginate::PaginationOptions;
use crate::pipeline::{Condition, Pipeline};
use crate::registry::MacroRegistry;
use crate::stage::{self, Stage};

/// Anything that can run a finished stage list: a database collection, a
/// remote service, a test double.
///
/// Errors are the executor's own and come back from
/// [`Aggregator::exec`] unchanged.
pub trait Executor {
    type Error;

    fn aggregate(
        &self,
        stages: &[Stage],
        options: &AggregateOptions,
    ) -> std::result::Result<Vec<Value>, Self::Error>;
}

impl<E: Executor + ?Sized> Executor for &E {
    type Error = E::Error;

    fn aggregate(
        &self,
        stages: &[Stage],
        options: &AggregateOptions,
    ) -> std::result::Result<Vec<Value>, Self::Error> {
        (**self).aggregate(stages, options)
    }
}

/// Start a builder bound to `model`.
pub fn aggregator<M: Executor + ?Sized>(model: &M) -> Aggregator<'_, M> {
    Aggregator::new(model)
}

/// Start a builder bound to `model` with execution options.
pub fn aggregator_with_options<M: Executor + ?Sized>(
    model: &M,
    options: AggregateOptions,
) -> Aggregator<'_, M> {
    Aggregator::with_options(model, options)
}

/// Fluent pipeline builder bound to an executor.
///
/// Stage methods append to the underlying [`Pipeline`] and return the
/// builder for chaining. [`Aggregator::exec`] consumes it, so a pipeline
/// runs at most once.
pub struct Aggregator<'m, M: ?Sized> {
    model: &'m M,
    options: AggregateOptions,
    pipeline: Pipeline,
}

impl<'m, M: Executor + ?Sized> Aggregator<'m, M> {
    pub fn new(model: &'m M) -> Self {
        Self::with_options(model, AggregateOptions::default())
    }

    pub fn with_options(model: &'m M, options: AggregateOptions) -> Self {
        Self {
            model,
            options,
            pipeline: Pipeline::new(),
        }
    }

    /// Resolve macros against `registry` instead of the global one.
    pub fn with_registry(mut self, registry: Arc<MacroRegistry>) -> Self {
        self.pipeline = self.pipeline.with_registry(registry);
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.pipeline = self.pipeline.with_merge_strategy(strategy);
        self
    }

    pub fn options(&self) -> &AggregateOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.pipeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipeline.is_empty()
    }

    pub fn filter(&mut self, body: impl Into<Value>) -> &mut Self {
        self.pipeline.filter(body);
        self
    }

    pub fn date_range(&mut self, range: DateRange) -> &mut Self {
        self.pipeline.date_range(range);
        self
    }

    pub fn sort(&mut self, body: impl Into<Value>) -> &mut Self {
        self.pipeline.sort(body);
        self
    }

    pub fn project(&mut self, body: impl Into<Value>) -> &mut Self {
        self.pipeline.project(body);
        self
    }

    pub fn group(&mut self, body: impl Into<Value>) -> &mut Self {
        self.pipeline.group(body);
        self
    }

    pub fn join(&mut self, body: impl Into<Value>) -> &mut Self {
        self.pipeline.join(body);
        self
    }

    pub fn unwind(&mut self, path_or_body: impl Into<Value>) -> &mut Self {
        self.pipeline.unwind(path_or_body);
        self
    }

    pub fn limit(&mut self, n: u64) -> &mut Self {
        self.pipeline.limit(n);
        self
    }

    pub fn skip(&mut self, n: u64) -> &mut Self {
        self.pipeline.skip(n);
        self
    }

    pub fn set(&mut self, body: impl Into<Value>) -> &mut Self {
        self.pipeline.set(body);
        self
    }

    pub fn add_fields(&mut self, body: impl Into<Value>) -> &mut Self {
        self.pipeline.add_fields(body);
        self
    }

    pub fn replace_root(&mut self, body: impl Into<Value>) -> &mut Self {
        self.pipeline.replace_root(body);
        self
    }

    pub fn facet(&mut self, body: impl Into<Value>) -> &mut Self {
        self.pipeline.facet(body);
        self
    }

    pub fn merge_output(&mut self, body: impl Into<Value>) -> &mut Self {
        self.pipeline.merge_output(body);
        self
    }

    pub fn union_with(&mut self, body: impl Into<Value>) -> &mut Self {
        self.pipeline.union_with(body);
        self
    }

    pub fn raw(&mut self, stage: impl Into<Value>) -> &mut Self {
        self.pipeline.raw(stage);
        self
    }

    pub fn paginate(&mut self, opts: PaginationOptions) -> &mut Self {
        self.pipeline.paginate(opts);
        self
    }

    pub fn use_macro(&mut self, name: &str, args: &[Value]) -> Result<&mut Self> {
        self.pipeline.use_macro(name, args)?;
        Ok(self)
    }

    /// Apply `f` to the stage list only if `condition` holds. The callback
    /// sees the [`Pipeline`], not the aggregator, so it cannot execute.
    pub fn when<C, F>(&mut self, condition: C, f: F) -> &mut Self
    where
        C: Condition,
        F: FnOnce(&mut Pipeline),
    {
        self.pipeline.when(condition, f);
        self
    }

    pub fn try_when<C, F>(&mut self, condition: C, f: F) -> Result<&mut Self>
    where
        C: Condition,
        F: FnOnce(&mut Pipeline) -> Result<()>,
    {
        self.pipeline.try_when(condition, f)?;
        Ok(self)
    }

    pub fn stages(&self) -> &[Stage] {
        self.pipeline.stages()
    }

    /// Snapshot of the stages in their serialized form. Later appends do not
    /// affect a returned list.
    pub fn to_stage_list(&self) -> Vec<Value> {
        self.pipeline.stages().iter().map(Stage::to_value).collect()
    }

    pub fn to_json(&self) -> Value {
        stage::stages_to_value(self.pipeline.stages())
    }

    /// Hand the finished stage list and options to the executor.
    pub fn exec(self) -> std::result::Result<Vec<Value>, M::Error> {
        tracing::debug!(stages = self.pipeline.len(), "executing pipeline");
        self.model.aggregate(self.pipeline.stages(), &self.options)
    }
}
