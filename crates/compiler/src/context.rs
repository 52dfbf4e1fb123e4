//! Compiler context
//!
//! Holds everything that persists across compiles: the table of labels
//! registered by earlier successful compiles, and the cached name matchers
//! for the dynamic positions (`&name`, `$name`). The caches are keyed on
//! version counters and rebuilt only when a registration invalidated them.

use std::sync::Arc;

use cml_runtime::GlobalContext;
use cml_runtime::ir::{Program, SeqId};
use indexmap::IndexMap;
use tracing::debug;

use crate::error::Result;
use crate::parse::Compiler;

/// What a name after `&` resolved to, besides labels of the current source.
#[derive(Clone)]
pub(crate) enum RegisteredName {
    /// Label from an earlier compile.
    Label(Arc<Program>, SeqId),
    /// User command, by registry index.
    Command(usize),
}

struct CallCache {
    labels_version: u64,
    globals_version: u64,
    /// Longest-first, so a greedy scan finds the longest match.
    names: Vec<(String, RegisteredName)>,
}

struct AccessorCache {
    globals_version: u64,
    /// User accessor names, longest-first, with registry indices.
    names: Vec<(String, usize)>,
}

/// Persistent compile state. One context per script namespace.
#[derive(Default)]
pub struct CompilerContext {
    labels: IndexMap<String, (Arc<Program>, SeqId)>,
    labels_version: u64,
    call_cache: Option<CallCache>,
    accessor_cache: Option<AccessorCache>,
}

impl CompilerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile one source. On success every labeled sequence of the result
    /// is registered for later compiles; on failure nothing is.
    pub fn compile(&mut self, source: &str, globals: &GlobalContext) -> Result<Arc<Program>> {
        self.refresh_caches(globals);
        let program = Compiler::new(self, source).run()?;
        self.register_labels(&program);
        Ok(program)
    }

    /// Look up a label registered by an earlier compile.
    pub fn label(&self, name: &str) -> Option<(Arc<Program>, SeqId)> {
        self.labels.get(name).cloned()
    }

    pub(crate) fn registered_names(&self) -> &[(String, RegisteredName)] {
        match &self.call_cache {
            Some(cache) => &cache.names,
            None => &[],
        }
    }

    pub(crate) fn user_accessors(&self) -> &[(String, usize)] {
        match &self.accessor_cache {
            Some(cache) => &cache.names,
            None => &[],
        }
    }

    fn register_labels(&mut self, program: &Arc<Program>) {
        let mut added = 0usize;
        for (i, seq) in program.seqs.iter().enumerate() {
            if let Some(label) = &seq.label {
                self.labels
                    .insert(label.clone(), (Arc::clone(program), SeqId(i)));
                added += 1;
            }
        }
        if added > 0 {
            self.labels_version += 1;
            debug!(added, "registered labels");
        }
    }

    fn refresh_caches(&mut self, globals: &GlobalContext) {
        let stale = match &self.call_cache {
            Some(c) => {
                c.labels_version != self.labels_version || c.globals_version != globals.version()
            }
            None => true,
        };
        if stale {
            debug!("rebuilding call-name matcher");
            let mut names: Vec<(String, RegisteredName)> = self
                .labels
                .iter()
                .map(|(name, (p, id))| {
                    (name.clone(), RegisteredName::Label(Arc::clone(p), *id))
                })
                .collect();
            names.extend(
                globals
                    .command_names()
                    .enumerate()
                    .map(|(i, name)| (name.to_string(), RegisteredName::Command(i))),
            );
            names.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            self.call_cache = Some(CallCache {
                labels_version: self.labels_version,
                globals_version: globals.version(),
                names,
            });
        }

        let stale = match &self.accessor_cache {
            Some(c) => c.globals_version != globals.version(),
            None => true,
        };
        if stale {
            debug!("rebuilding accessor-name matcher");
            let mut names: Vec<(String, usize)> = globals
                .accessor_names()
                .enumerate()
                .map(|(i, name)| (name.to_string(), i))
                .collect();
            names.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            self.accessor_cache = Some(AccessorCache {
                globals_version: globals.version(),
                names,
            });
        }
    }
}
