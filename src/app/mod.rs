use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use eframe::{egui, NativeOptions};
use log::{error, info, warn};

use crate::export::DownloadFormat;
use crate::gui::CaseTreeGui;
use crate::io::fetch::{DendrogramKey, FileSource};
use crate::io::JsonPreferenceStore;
use crate::link::{Highlighter, LinkChannels};
use crate::tree::viewer::{EngineConfig, TreeEngine};
use crate::ui;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "casetree",
    about = "Interactive dendrogram view linked to a case line list."
)]
pub struct AppConfig {
    /// Dendrogram file to load (Newick, Nexus or JSON).
    #[arg(value_name = "TREE_FILE")]
    pub tree_path: Option<PathBuf>,

    /// Write a download of the tree view to this path.
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = DownloadFormat::Png)]
    pub export_format: DownloadFormat,

    /// Which tree of a multi-tree file to show.
    #[arg(long, default_value_t = 0)]
    pub tree_index: usize,

    /// Only accept the file when it contains every one of these case ids.
    #[arg(long = "leaf", value_name = "CASE_ID")]
    pub leaf_ids: Vec<String>,

    /// Surface width in CSS pixels
    #[arg(long, default_value_t = 1100)]
    pub width: u32,

    /// Surface height in CSS pixels
    #[arg(long, default_value_t = 760)]
    pub height: u32,

    #[arg(long, default_value_t = 1.0)]
    pub device_pixel_ratio: f32,

    /// Label each leaf with its branch length.
    #[arg(long)]
    pub show_distances: bool,

    /// Two-column `case_id,event` file for the line list's event column.
    #[arg(long, value_name = "EVENTS_FILE")]
    pub events: Option<PathBuf>,

    /// JSON file holding the stored zoom and scroll position.
    #[arg(long, value_name = "PREFS_FILE")]
    pub prefs: Option<PathBuf>,

    /// Run without launching the GUI; print a summary to stdout instead.
    #[arg(long)]
    pub headless: bool,

    /// Force launch of the egui window even when a tree file is provided.
    #[arg(long)]
    pub gui: bool,

    /// Ignore display detection safeguards and attempt to launch the GUI anyway.
    #[arg(long)]
    pub force_gui: bool,
}

impl AppConfig {
    pub fn dendrogram_key(&self) -> DendrogramKey {
        DendrogramKey {
            leaf_ids: self.leaf_ids.clone(),
            ..DendrogramKey::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tree_configuration_id: self
                .tree_path
                .as_ref()
                .map(|path| format!("{}#{}", path.display(), self.tree_index)),
            ..EngineConfig::default()
        }
    }
}

pub struct CaseTreeApp;

impl CaseTreeApp {
    pub fn run(config: &AppConfig) -> Result<()> {
        let wants_gui = !config.headless || config.gui || config.force_gui;

        if !wants_gui {
            return Self::run_headless(config);
        }

        if !config.force_gui && !Self::display_available() {
            warn!("GUI requested but no display was detected; falling back to headless mode.");
            return Self::run_headless(config);
        }

        let mut native_options = NativeOptions::default();
        info!("Launching egui window ({}x{}).", config.width, config.height);
        native_options.viewport = egui::ViewportBuilder::default()
            .with_title("casetree")
            .with_inner_size(egui::vec2(config.width as f32, config.height as f32));

        let initial_config = config.clone();
        match eframe::run_native(
            "casetree",
            native_options,
            Box::new(move |cc| Ok(Box::new(CaseTreeGui::new(cc, initial_config)))),
        ) {
            Ok(result) => Ok(result),
            Err(err) => {
                error!("Failed to launch egui window: {}", err);
                if config.tree_path.is_some() {
                    warn!("Falling back to headless mode.");
                    Self::run_headless(config)
                } else {
                    Err(anyhow!(err.to_string()))
                }
            }
        }
    }

    fn display_available() -> bool {
        #[cfg(any(
            target_os = "linux",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "netbsd"
        ))]
        {
            std::env::var("DISPLAY").is_ok() || std::env::var("WAYLAND_DISPLAY").is_ok()
        }
        #[cfg(any(target_os = "windows", target_os = "macos"))]
        {
            true
        }
        #[cfg(not(any(
            target_os = "macos",
            target_os = "linux",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "netbsd",
            target_os = "windows"
        )))]
        {
            false
        }
    }

    /// Load the tree into an engine sized like the window would be.
    pub fn build_engine(config: &AppConfig) -> Result<TreeEngine> {
        let tree_path = config
            .tree_path
            .clone()
            .ok_or_else(|| anyhow!("headless mode requires a TREE_FILE argument"))?;

        let engine = TreeEngine::new(config.engine_config(), LinkChannels::new(), Highlighter::new());
        engine.resize(egui::vec2(config.width as f32, config.height as f32));
        engine.set_device_pixel_ratio(config.device_pixel_ratio);
        engine.set_show_distances(config.show_distances);
        if let Some(prefs) = &config.prefs {
            engine.set_preference_store(Box::new(JsonPreferenceStore::new(prefs)));
        }

        let source = FileSource::new(&tree_path).with_tree_index(config.tree_index);
        engine
            .load_with(&source, config.dendrogram_key())
            .with_context(|| format!("failed to load dendrogram from {}", tree_path.display()))?;
        Ok(engine)
    }

    fn run_headless(config: &AppConfig) -> Result<()> {
        let engine = Self::build_engine(config)?;
        ui::print_summary(&engine, config);

        if let Some(dest) = &config.output {
            ui::write_download(&engine, config.export_format, dest)?;
        }
        Ok(())
    }
}
