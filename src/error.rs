use thiserror::Error;

/// Reason the tree view shows its "unavailable" state instead of a dendrogram.
///
/// These are expected states, not programmer errors: the engine resolves them
/// locally and keeps interacting with the rest of the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Unavailable {
    #[error("too-few-leaves")]
    TooFewLeaves,
    #[error("zero-distance-range")]
    ZeroDistanceRange,
    #[error("fetch-failed")]
    FetchFailed,
    #[error("filter-mismatch")]
    FilterMismatch,
    #[error("zero-width-viewport")]
    ZeroWidthViewport,
}

impl Unavailable {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Unavailable::TooFewLeaves => "too-few-leaves",
            Unavailable::ZeroDistanceRange => "zero-distance-range",
            Unavailable::FetchFailed => "fetch-failed",
            Unavailable::FilterMismatch => "filter-mismatch",
            Unavailable::ZeroWidthViewport => "zero-width-viewport",
        }
    }
}

/// Failure of the external dendrogram fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("dendrogram request was cancelled")]
    Cancelled,
    #[error("dendrogram source failed: {0}")]
    Source(String),
    #[error("dendrogram is invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("node {0:?} is not part of the unfiltered tree")]
    UnknownNode(String),
    #[error("node {0:?} does not root a subtree with at least two leaves")]
    NotASubtree(String),
    #[error("node {0:?} is outside the current view")]
    OutsideView(String),
    #[error("no subtree filter is active")]
    NotFiltered,
    #[error("no unfiltered tree is loaded")]
    NoTree,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("nothing to export: {0}")]
    Unavailable(#[from] Unavailable),
    #[error("failed to allocate a {width}x{height} raster surface")]
    Surface { width: u32, height: u32 },
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("{0} is not an image format")]
    NotAnImage(String),
}

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("preference storage failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("preference record is malformed: {0}")]
    Format(#[from] serde_json::Error),
}
