use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use log::{debug, warn};

/// Sort field name published on the list sort channel.
pub const SORT_BY_CASE_ID: &str = "case id";

/// Value of a cell that is filled in by an asynchronous lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellState<T> {
    Pending,
    Resolved(T),
    Rejected(String),
}

impl<T> CellState<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, CellState::Pending)
    }

    pub fn resolved(&self) -> Option<&T> {
        match self {
            CellState::Resolved(value) => Some(value),
            _ => None,
        }
    }
}

pub type EventResult = Result<Option<String>, String>;

/// "Which outbreak event is this case part of" lookup.
///
/// Requests are fire-and-forget; answers are collected with [`EventLookup::drain`]
/// on the UI thread and fed through [`LineList::absorb`].
pub trait EventLookup {
    fn request(&self, case_id: &str);
    fn drain(&self) -> Vec<(String, EventResult)>;
}

/// Answers lookups from a case → event table on a worker thread.
pub struct ThreadedEventLookup {
    requests: Sender<String>,
    answers: Receiver<(String, EventResult)>,
}

impl ThreadedEventLookup {
    pub fn spawn(table: Arc<HashMap<String, String>>) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<String>();
        let (answer_tx, answer_rx) = mpsc::channel();
        thread::spawn(move || {
            for case_id in request_rx {
                let answer = Ok(table.get(&case_id).cloned());
                if answer_tx.send((case_id, answer)).is_err() {
                    break;
                }
            }
            debug!("event lookup worker finished");
        });
        Self {
            requests: request_tx,
            answers: answer_rx,
        }
    }
}

impl EventLookup for ThreadedEventLookup {
    fn request(&self, case_id: &str) {
        if self.requests.send(case_id.to_string()).is_err() {
            warn!("event lookup worker is gone; {case_id} stays pending");
        }
    }

    fn drain(&self) -> Vec<(String, EventResult)> {
        self.answers.try_iter().collect()
    }
}

/// Read a two-column `case_id,event` file; blank lines and `#` comments are skipped.
pub fn load_event_table(path: &Path) -> Result<HashMap<String, String>> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut table = HashMap::new();
    for (number, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((case_id, event)) = line.split_once(',') else {
            bail!("{}:{}: expected `case_id,event`", path.display(), number + 1);
        };
        table.insert(case_id.trim().to_string(), event.trim().to_string());
    }
    Ok(table)
}

/// Rows of the demo line list: one per case of the active dataset, in tree
/// order unless a sort is active.
#[derive(Debug, Default)]
pub struct LineList {
    cases: Vec<String>,
    order: Vec<usize>,
    sort: Option<String>,
    events: HashMap<String, CellState<Option<String>>>,
}

impl LineList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rows; `cases` must be in dendrogram leaf order.
    pub fn set_cases(&mut self, cases: Vec<String>) {
        let keep: HashSet<&String> = cases.iter().collect();
        self.events.retain(|case_id, _| keep.contains(case_id));
        self.cases = cases;
        self.reorder();
    }

    pub fn sort(&self) -> Option<&str> {
        self.sort.as_deref()
    }

    pub fn set_sort(&mut self, sort: Option<String>) {
        if self.sort != sort {
            self.sort = sort;
            self.reorder();
        }
    }

    fn reorder(&mut self) {
        self.order = (0..self.cases.len()).collect();
        if self.sort.as_deref() == Some(SORT_BY_CASE_ID) {
            let cases = &self.cases;
            self.order.sort_by(|&a, &b| cases[a].cmp(&cases[b]));
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<&str> {
        self.order
            .get(index)
            .and_then(|&case| self.cases.get(case))
            .map(String::as_str)
    }

    /// Event cell for `case_id`; the first read issues the lookup.
    pub fn event_cell(&mut self, case_id: &str, lookup: &dyn EventLookup) -> CellState<Option<String>> {
        if let Some(state) = self.events.get(case_id) {
            return state.clone();
        }
        self.events.insert(case_id.to_string(), CellState::Pending);
        lookup.request(case_id);
        CellState::Pending
    }

    /// Fold finished lookups into the cells. Returns whether any cell changed.
    pub fn absorb(&mut self, answers: Vec<(String, EventResult)>) -> bool {
        let mut changed = false;
        for (case_id, answer) in answers {
            // Answers for cases no longer listed are dropped.
            let Some(cell) = self.events.get_mut(&case_id) else {
                continue;
            };
            *cell = match answer {
                Ok(event) => CellState::Resolved(event),
                Err(reason) => CellState::Rejected(reason),
            };
            changed = true;
        }
        changed
    }

    pub fn has_pending(&self) -> bool {
        self.events.values().any(CellState::is_pending)
    }

    /// Resolved event names by case id.
    pub fn resolved_events(&self) -> impl Iterator<Item = (&str, &str)> {
        self.events.iter().filter_map(|(case_id, state)| {
            state
                .resolved()
                .and_then(|event| event.as_deref())
                .map(|event| (case_id.as_str(), event))
        })
    }
}
