use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::stage::Stage;

// ---------------------------------------------------------------------------
// Macro output
// ---------------------------------------------------------------------------

/// What a macro produces: one stage or an ordered run of stages.
#[derive(Debug, Clone, PartialEq)]
pub enum MacroOutput {
    One(Stage),
    Many(Vec<Stage>),
}

impl MacroOutput {
    pub fn into_stages(self) -> Vec<Stage> {
        match self {
            MacroOutput::One(stage) => vec![stage],
            MacroOutput::Many(stages) => stages,
        }
    }
}

/// A JSON array is a run of stages; any other value is a single stage.
impl From<Value> for MacroOutput {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => MacroOutput::Many(items.into_iter().map(Stage::from).collect()),
            other => MacroOutput::One(Stage::from(other)),
        }
    }
}

impl From<Vec<Value>> for MacroOutput {
    fn from(values: Vec<Value>) -> Self {
        MacroOutput::Many(values.into_iter().map(Stage::from).collect())
    }
}

impl From<Stage> for MacroOutput {
    fn from(stage: Stage) -> Self {
        MacroOutput::One(stage)
    }
}

impl From<Vec<Stage>> for MacroOutput {
    fn from(stages: Vec<Stage>) -> Self {
        MacroOutput::Many(stages)
    }
}

// ---------------------------------------------------------------------------
// Macro
// ---------------------------------------------------------------------------

type MacroFn = dyn Fn(&[Value]) -> MacroOutput + Send + Sync;

/// A registered pipeline fragment generator.
#[derive(Clone)]
pub struct Macro(Arc<MacroFn>);

impl Macro {
    pub fn new<F, O>(f: F) -> Self
    where
        F: Fn(&[Value]) -> O + Send + Sync + 'static,
        O: Into<MacroOutput>,
    {
        Macro(Arc::new(move |args: &[Value]| f(args).into()))
    }

    pub fn call(&self, args: &[Value]) -> MacroOutput {
        (self.0)(args)
    }
}

impl fmt::Debug for Macro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Macro(..)")
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Named macro store. Entries are immutable once registered.
///
/// Builders use [`MacroRegistry::global`] unless handed another registry,
/// so a test can run against a private instance without touching the
/// process-wide one.
#[derive(Debug, Default)]
pub struct MacroRegistry {
    macros: RwLock<HashMap<String, Macro>>,
}

static GLOBAL: OnceLock<Arc<MacroRegistry>> = OnceLock::new();

impl MacroRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<MacroRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MacroRegistry::new())))
    }

    /// Register `f` under `name`. Fails if the name is blank or taken; the
    /// existing entry is left untouched on a duplicate.
    pub fn register<F, O>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(&[Value]) -> O + Send + Sync + 'static,
        O: Into<MacroOutput>,
    {
        self.insert(name, Macro::new(f))
    }

    /// Register a macro that may be absent, as when the function comes from
    /// dynamic configuration.
    pub fn register_optional(&self, name: &str, f: Option<Macro>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::InvalidMacroName);
        }
        let f = f.ok_or_else(|| Error::MissingMacroFunction(name.to_string()))?;
        self.insert(name, f)
    }

    fn insert(&self, name: &str, f: Macro) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::InvalidMacroName);
        }
        let mut macros = self.macros.write().unwrap_or_else(PoisonError::into_inner);
        if macros.contains_key(name) {
            return Err(Error::DuplicateMacro(name.to_string()));
        }
        macros.insert(name.to_string(), f);
        tracing::debug!(name, "registered macro");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Macro> {
        let macros = self.macros.read().unwrap_or_else(PoisonError::into_inner);
        macros.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let macros = self.macros.read().unwrap_or_else(PoisonError::into_inner);
        macros.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let macros = self.macros.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = macros.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.macros.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration. Intended for test isolation.
    pub fn clear(&self) {
        self.macros.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
