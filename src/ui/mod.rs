use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::info;

use crate::app::AppConfig;
use crate::export::DownloadFormat;
use crate::tree::scale::compute_tick_scale;
use crate::tree::viewer::{TreeEngine, TreeState};

pub fn print_summary(engine: &TreeEngine, config: &AppConfig) {
    let Some(assembly) = engine.assembly() else {
        match engine.state() {
            TreeState::Unavailable(reason) => println!("Tree unavailable ({}).", reason.reason_code()),
            _ => println!("No tree loaded."),
        }
        return;
    };

    println!(
        "Loaded dendrogram with {} leaves ({} nodes), max root-to-leaf distance {}.",
        assembly.leaf_count,
        assembly.nodes.len(),
        assembly.max_distance.normalize()
    );
    println!(
        "Surface {}x{} css px at {}x, {:.3} px per distance unit, content height {} px.",
        config.width,
        config.height,
        config.device_pixel_ratio,
        assembly.pixels_per_unit,
        assembly.content_height()
    );
    let viewport = engine.viewport();
    let usable = assembly.canvas_width - 2.0 * assembly.tokens.padding;
    if let Ok(ticks) = compute_tick_scale(
        usable,
        assembly.max_distance,
        engine.config().min_scale_unit,
        viewport.zoom_level,
    ) {
        println!(
            "Ruler unit {} ({:.1} px per tick) at zoom {}.",
            ticks.unit.normalize(),
            ticks.pixels_per_unit,
            viewport.zoom_level
        );
    }

    let leaves: Vec<&str> = assembly.leaves().map(|leaf| leaf.id.as_str()).collect();
    let preview = leaves.iter().take(8).copied().collect::<Vec<_>>().join(", ");
    if leaves.len() > 8 {
        println!("Leaves: {preview}, ... ({} more)", leaves.len() - 8);
    } else {
        println!("Leaves: {preview}");
    }
}

pub fn write_download(engine: &TreeEngine, format: DownloadFormat, output: &Path) -> Result<()> {
    let bytes = engine
        .download(format)
        .with_context(|| format!("failed to prepare {format} download"))?;
    fs::write(output, &bytes).with_context(|| format!("failed to write {}", output.display()))?;
    info!("wrote {} bytes to {}", bytes.len(), output.display());
    println!("Exported {format} to {}.", output.display());
    Ok(())
}
