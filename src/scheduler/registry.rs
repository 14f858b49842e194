//! Explicit registry of named work-unit types.
//!
//! Units that should be startable by name (from configuration, a console,
//! another unit) are registered once with a constructor. Spawning by name
//! then builds the unit from JSON arguments and binds it like any other.

use std::any::{type_name, TypeId};
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use serde::de::DeserializeOwned;

use super::agent::Agent;
use super::executor::{ParallelHandle, SpawnOptions};
use super::performer::AgentPerformer;
use crate::error::ParallelError;

/// Role a registered unit plays.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum PerformerKind {
    /// Feeds data into the platform (market data, fills).
    Provider,
    /// Consumes data and acts on it (strategies, risk).
    Performer,
}

impl fmt::Display for PerformerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerformerKind::Provider => f.write_str("provider"),
            PerformerKind::Performer => f.write_str("performer"),
        }
    }
}

pub(crate) type PerformerFactory =
    Arc<dyn Fn(&ParallelHandle, SpawnOptions, serde_json::Value) -> Result<Agent, ParallelError> + Send + Sync>;

struct Entry {
    kind: PerformerKind,
    factory: PerformerFactory,
}

/// Name -> constructor map, owned by one runtime.
#[derive(Default)]
pub struct PerformerRegistry {
    entries: AHashMap<String, Entry>,
    by_type: AHashMap<TypeId, String>,
}

impl PerformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `P`, constructed by deserializing the spawn arguments.
    pub fn register<P>(&mut self, name: &str, kind: PerformerKind) -> Result<(), ParallelError>
    where
        P: AgentPerformer + DeserializeOwned,
    {
        self.register_with::<P, _>(name, kind, |args| {
            serde_json::from_value::<P>(args).map_err(|e| e.to_string())
        })
    }

    /// Register `P` with a custom constructor.
    pub fn register_with<P, F>(&mut self, name: &str, kind: PerformerKind, ctor: F) -> Result<(), ParallelError>
    where
        P: AgentPerformer,
        F: Fn(serde_json::Value) -> Result<P, String> + Send + Sync + 'static,
    {
        if self.entries.contains_key(name) {
            return Err(ParallelError::DuplicatePerformer(name.to_string()));
        }
        let owned = name.to_string();
        let factory: PerformerFactory = Arc::new(move |rt, opts, args| {
            let performer = ctor(args).map_err(|reason| ParallelError::Construct {
                name: owned.clone(),
                reason,
            })?;
            rt.spawn_with(performer, opts)
        });
        self.entries.insert(name.to_string(), Entry { kind, factory });
        self.by_type.entry(TypeId::of::<P>()).or_insert_with(|| name.to_string());
        tracing::debug!(name, %kind, type_name = type_name::<P>(), "performer registered");
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn kind(&self, name: &str) -> Option<PerformerKind> {
        self.entries.get(name).map(|e| e.kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(name, kind)` pairs sorted by name.
    pub fn entries(&self) -> Vec<(String, PerformerKind)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .map(|(n, e)| (n.clone(), e.kind))
            .collect();
        out.sort();
        out
    }

    /// First name `P` was registered under.
    pub fn name_of<P: 'static>(&self) -> Option<String> {
        self.by_type.get(&TypeId::of::<P>()).cloned()
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<(PerformerKind, PerformerFactory)> {
        self.entries
            .get(name)
            .map(|e| (e.kind, Arc::clone(&e.factory)))
    }
}

impl fmt::Debug for PerformerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformerRegistry")
            .field("entries", &self.entries())
            .finish()
    }
}
