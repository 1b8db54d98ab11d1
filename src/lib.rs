pub mod aggregator;
pub mod builders;
pub mod date_range;
pub mod engine;
pub mod error;
pub mod eval;
pub mod merge;
pub mod operators;
pub mod options;
pub mod paginate;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod stage;
pub mod value;

pub use aggregator::{Aggregator, Executor, aggregator, aggregator_with_options};
pub use builders::{
    FacetBuilder, GroupBuilder, LookupBuilder, ProjectBuilder, SortBuilder, UnionWithBuilder, UnwindBuilder,
};
pub use date_range::DateRange;
pub use engine::{CollectionRef, MemoryDb};
pub use error::{Error, Result};
pub use merge::{MergeReport, MergeStrategy, merge_filters};
pub use operators::{Cond, FilterExpr, MapExpr, Reduce, Switch};
pub use options::AggregateOptions;
pub use paginate::{PaginationOptions, paginate};
pub use pipeline::{Condition, Pipeline};
pub use registry::{Macro, MacroOutput, MacroRegistry};
pub use stage::Stage;
