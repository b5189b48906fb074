//! Dendrogram view for a case-browsing dashboard: assembly, raster
//! rendering, pointer interaction, subtree filtering and scroll linking with
//! a line list.

pub mod app;
pub mod error;
pub mod export;
pub mod gui;
pub mod io;
pub mod link;
pub mod tree;
pub mod ui;
