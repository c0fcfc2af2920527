// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable tier recovery chain.
//!
//! When the configured database cannot be opened, or fails mid-operation,
//! the durable tier walks down a fixed ladder of increasingly disposable
//! locations:
//!
//! ```text
//! Default ──► Clean ──► Temp ──► Memory ──► None
//!   file      delete     fresh     in-process   no-op
//!             + reopen   temp file  database
//! ```
//!
//! `Clean` deletes the configured file, so it is only attempted when no
//! other live instance sharing the same [`DatabaseRegistry`] holds that
//! path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

/// Where the durable tier currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpenStage {
    /// The configured file, opened as-is.
    Default,
    /// The configured file, deleted and recreated.
    Clean,
    /// A fresh file in the system temp directory.
    Temp,
    /// An in-process database; lost on shutdown.
    Memory,
    /// Nothing could be opened. Every operation is a silent no-op.
    None,
}

impl OpenStage {
    /// Stages tried in order, `None` excluded.
    pub const LADDER: [OpenStage; 4] = [Self::Default, Self::Clean, Self::Temp, Self::Memory];

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Default => "SQLite/Default",
            Self::Clean => "SQLite/Clean",
            Self::Temp => "SQLite/Temp",
            Self::Memory => "SQLite/Memory",
            Self::None => "SQLite/None",
        }
    }

    /// Stages from `self` to the end of the ladder.
    pub fn remaining(self) -> impl Iterator<Item = OpenStage> {
        Self::LADDER.into_iter().filter(move |stage| *stage >= self)
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn is_open(self) -> bool {
        self != Self::None
    }
}

impl std::fmt::Display for OpenStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Per-path count of live durable-tier instances.
///
/// Cloning shares the same counts. Only storages handed clones of one
/// registry see each other's holds, so instances that may open the same path
/// must be built with
/// [`SqlStorage::with_registry`](crate::SqlStorage::with_registry) from a
/// shared registry.
#[derive(Debug, Clone, Default)]
pub struct DatabaseRegistry {
    holders: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl DatabaseRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a holder for `path` until the returned lease drops.
    pub fn acquire(&self, path: &Path) -> DatabaseLease {
        *self.holders.lock().entry(path.to_path_buf()).or_insert(0) += 1;
        DatabaseLease {
            registry: self.clone(),
            path: path.to_path_buf(),
        }
    }

    #[must_use]
    pub fn holders(&self, path: &Path) -> usize {
        self.holders.lock().get(path).copied().unwrap_or(0)
    }

    fn release(&self, path: &Path) {
        let mut holders = self.holders.lock();
        if let Some(count) = holders.get_mut(path) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                holders.remove(path);
            }
        }
    }
}

/// Holder registration; dropping it unregisters.
#[derive(Debug)]
pub struct DatabaseLease {
    registry: DatabaseRegistry,
    path: PathBuf,
}

impl DatabaseLease {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DatabaseLease {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}
