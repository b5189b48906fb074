use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::error::FetchError;
use crate::tree::DendrogramNode;

/// Shared abort signal for an in-flight dendrogram request.
pub type CancelFlag = Arc<AtomicBool>;

pub fn is_cancelled(flag: &CancelFlag) -> bool {
    flag.load(Ordering::Acquire)
}

/// Identity of a dendrogram request; a new key means a new fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DendrogramKey {
    pub leaf_ids: Vec<String>,
    pub distance_column_id: String,
    pub algorithm_id: String,
}

/// External dendrogram provider. Implementations should poll `cancel` and
/// return [`FetchError::Cancelled`] once it is set.
pub trait DendrogramSource {
    fn fetch(&self, key: &DendrogramKey, cancel: &CancelFlag) -> Result<DendrogramNode, FetchError>;
}

/// Handle for one issued request.
#[derive(Debug, Clone)]
pub struct FetchTicket {
    pub generation: u64,
    pub key: DendrogramKey,
    pub cancel: CancelFlag,
}

/// Tracks the latest request so results of superseded ones are discarded.
#[derive(Debug, Default)]
pub struct TreeLoader {
    generation: u64,
    in_flight: Option<FetchTicket>,
}

impl TreeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a request for `key`, aborting whatever was still running.
    pub fn begin(&mut self, key: DendrogramKey) -> FetchTicket {
        self.cancel();
        self.generation += 1;
        let ticket = FetchTicket {
            generation: self.generation,
            key,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        debug!("dendrogram fetch #{} issued", ticket.generation);
        self.in_flight = Some(ticket.clone());
        ticket
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|ticket| ticket.generation == generation)
    }

    /// Accept the result of `generation` if it is still the latest request.
    pub fn complete(&mut self, generation: u64) -> bool {
        if self.is_current(generation) {
            self.in_flight = None;
            true
        } else {
            debug!("discarding stale dendrogram result #{generation}");
            false
        }
    }

    pub fn cancel(&mut self) {
        if let Some(ticket) = self.in_flight.take() {
            ticket.cancel.store(true, Ordering::Release);
            debug!("dendrogram fetch #{} cancelled", ticket.generation);
        }
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }
}

/// Reads a dendrogram from a Newick, Nexus or JSON file on disk.
///
/// The distance column and algorithm parts of the key are ignored; when the
/// key names leaves, every one of them must be present in the file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    tree_index: usize,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tree_index: 0,
        }
    }

    pub fn with_tree_index(mut self, index: usize) -> Self {
        self.tree_index = index;
        self
    }
}

impl DendrogramSource for FileSource {
    fn fetch(&self, key: &DendrogramKey, cancel: &CancelFlag) -> Result<DendrogramNode, FetchError> {
        if is_cancelled(cancel) {
            return Err(FetchError::Cancelled);
        }
        let bundle = super::load_trees(&self.path).map_err(|err| FetchError::Source(format!("{err:#}")))?;
        if is_cancelled(cancel) {
            return Err(FetchError::Cancelled);
        }
        let tree = bundle
            .trees
            .into_iter()
            .nth(self.tree_index)
            .ok_or_else(|| FetchError::Invalid(format!("no tree at index {}", self.tree_index)))?;

        if !key.leaf_ids.is_empty() {
            let present: HashSet<String> = tree.dendrogram.leaf_names().into_iter().collect();
            let missing = key.leaf_ids.iter().filter(|id| !present.contains(*id)).count();
            if missing > 0 {
                return Err(FetchError::Invalid(format!(
                    "{missing} requested leaf id(s) are not in {}",
                    self.path.display()
                )));
            }
        }
        info!(
            "fetched dendrogram with {} leaves from {}",
            tree.leaf_count(),
            self.path.display()
        );
        Ok(tree.dendrogram)
    }
}
