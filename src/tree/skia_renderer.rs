use std::collections::{HashMap, HashSet};

use eframe::egui::{self, Align2, Color32, Pos2, Vec2};
use font_kit::family_name::FamilyName;
use font_kit::properties::Properties;
use font_kit::source::SystemSource;
use fontdue::layout::{CoordinateSystem, Layout, LayoutSettings, TextStyle};
use fontdue::{Font, FontSettings};
use log::warn;
use tiny_skia::{Color, LineCap, Paint, PathBuilder, Pixmap, Rect, Stroke, Transform};

use super::assembly::TreeAssembly;
use super::painter::{highlighted_nodes, subtree_colors, TreePainter};
use super::scale::TickScale;
use super::viewport::ViewportState;
use crate::error::ExportError;

/// Everything the body draw reads.
pub struct BodyScene<'a> {
    pub assembly: &'a TreeAssembly,
    pub viewport: &'a ViewportState,
    pub painter: &'a TreePainter,
    pub highlighted: &'a HashSet<String>,
    pub stratification: &'a HashMap<String, Color32>,
    pub show_distances: bool,
}

/// Everything the header draw reads.
pub struct HeaderScene<'a> {
    pub ticks: &'a TickScale,
    pub viewport: &'a ViewportState,
    pub painter: &'a TreePainter,
    /// Left padding of the assembly at zoom level 1.
    pub padding: f32,
    /// Ticks stop at the largest root-to-leaf distance in view.
    pub max_distance: rust_decimal::Decimal,
}

/// Rasterizes the header and body surfaces with tiny-skia; text goes through
/// fontdue when a system sans-serif face can be found.
pub struct SkiaTreeRenderer {
    text_font: Option<Font>,
}

impl Default for SkiaTreeRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl SkiaTreeRenderer {
    pub fn new() -> Self {
        let text_font = load_system_sans_font();
        if text_font.is_none() {
            warn!("no system sans-serif font found; tree labels will not be drawn");
        }
        Self { text_font }
    }

    /// Renderer that never draws text.
    pub fn without_text() -> Self {
        Self { text_font: None }
    }

    pub fn has_text(&self) -> bool {
        self.text_font.is_some()
    }

    pub fn draw_body(&self, pixmap: &mut Pixmap, scene: &BodyScene<'_>) {
        let painter = scene.painter;
        pixmap.fill(to_skia_color(painter.background_color));
        let assembly = scene.assembly;
        if assembly.is_empty() {
            return;
        }

        let viewport = scene.viewport;
        let dpr = viewport.device_pixel_ratio;
        let height = pixmap.height() as f32;
        let width = pixmap.width() as f32;
        let colors = subtree_colors(assembly, scene.stratification);
        let lit = highlighted_nodes(assembly, scene.highlighted);
        let row_px = assembly.tokens.row_height * viewport.zoom_level * dpr;
        let margin = painter.branch_highlight_stroke.width * dpr + row_px;

        // Highlighted paths go last so they sit on top.
        for pass in [false, true] {
            for (index, node) in assembly.nodes.iter().enumerate() {
                if lit[index] != pass {
                    continue;
                }
                let stroke = painter.stroke_for(colors[index], lit[index]);
                let at = viewport.to_physical(assembly.node_pos(node));

                if node.parent.is_some() && at.y >= -margin && at.y <= height + margin {
                    let from = viewport.to_physical(egui::pos2(assembly.parent_x(node), assembly.row_y(node.row)));
                    stroke_line(pixmap, from, at, stroke, dpr);
                }

                if let (Some(&first), Some(&last)) = (node.children.first(), node.children.last()) {
                    let top = viewport.to_physical(assembly.node_pos(&assembly.nodes[first]));
                    let bottom = viewport.to_physical(assembly.node_pos(&assembly.nodes[last]));
                    if bottom.y >= -margin && top.y <= height + margin {
                        stroke_line(pixmap, egui::pos2(at.x, top.y), egui::pos2(at.x, bottom.y), stroke, dpr);
                    }
                }
            }
        }

        let Some(font) = self.text_font.as_ref() else {
            return;
        };
        // Labels only once rows are tall enough to hold them.
        if row_px < painter.label_font_size * dpr * 0.8 {
            return;
        }
        for node in assembly.leaves() {
            let at = viewport.to_physical(assembly.node_pos(node));
            if at.y < -row_px || at.y > height + row_px || at.x > width {
                continue;
            }
            draw_text(
                pixmap,
                font,
                &node.id,
                egui::pos2(at.x + painter.label_gap * dpr, at.y),
                Align2::LEFT_CENTER,
                painter.label_font_size * dpr,
                painter.label_color,
            );
            if scene.show_distances {
                let from_x = viewport.to_physical(egui::pos2(assembly.parent_x(node), 0.0)).x;
                draw_text(
                    pixmap,
                    font,
                    &painter.branch_label_text(node.branch_length),
                    egui::pos2((from_x + at.x) / 2.0, at.y - painter.branch_label_font_size * 0.7 * dpr),
                    Align2::CENTER_CENTER,
                    painter.branch_label_font_size * dpr,
                    painter.branch_label_color,
                );
            }
        }
    }

    pub fn draw_header(&self, pixmap: &mut Pixmap, scene: &HeaderScene<'_>) {
        let painter = scene.painter;
        pixmap.fill(to_skia_color(painter.header_background_color));
        let viewport = scene.viewport;
        let dpr = viewport.device_pixel_ratio;
        let width = pixmap.width() as f32;
        let height = pixmap.height() as f32;
        let ticks = scene.ticks;

        let origin_x = scene.padding * viewport.zoom_level * dpr - viewport.horizontal_scroll_px;
        let step = ticks.pixels_per_unit * dpr;
        if step > 0.0 && step.is_finite() {
            let guide = egui::Stroke::new(1.0, painter.guide_color);
            let mut k: i64 = 0;
            loop {
                let x = origin_x + k as f32 * step;
                let reached = ticks
                    .unit
                    .checked_mul(rust_decimal::Decimal::from(k))
                    .map_or(true, |d| d > scene.max_distance);
                if x > width || reached {
                    break;
                }
                if x >= 0.0 {
                    // Snap to the pixel centre so 1px guides stay crisp.
                    let gx = x.floor() + 0.5;
                    stroke_line(pixmap, egui::pos2(gx, height * 0.45), egui::pos2(gx, height), guide, 1.0);
                    if let Some(font) = self.text_font.as_ref() {
                        draw_text(
                            pixmap,
                            font,
                            &ticks.label(k),
                            egui::pos2(x, height * 0.25),
                            Align2::CENTER_CENTER,
                            painter.tick_font_size * dpr,
                            painter.tick_label_color,
                        );
                    }
                }
                k += 1;
            }

            // Scale bar of one unit, pinned to the right edge.
            let bar_y = height * 0.7;
            let bar_end = width - 8.0 * dpr;
            let bar_start = (bar_end - step).max(0.0);
            let bar = egui::Stroke::new(painter.scale_bar_line_width, painter.label_color);
            stroke_line(pixmap, egui::pos2(bar_start, bar_y), egui::pos2(bar_end, bar_y), bar, dpr);
            if let Some(font) = self.text_font.as_ref() {
                draw_text(
                    pixmap,
                    font,
                    &ticks.unit.normalize().to_string(),
                    egui::pos2(bar_start - 4.0 * dpr, bar_y),
                    Align2::RIGHT_CENTER,
                    painter.tick_font_size * dpr,
                    painter.tick_label_color,
                );
            }
        }

        let divider = dpr.round().max(1.0);
        fill_rect(pixmap, 0.0, 0.0, width, divider, painter.divider_color);
        fill_rect(pixmap, 0.0, height - divider, width, divider, painter.divider_color);
    }

    /// Draw the "unavailable" placeholder with its reason code.
    pub fn draw_unavailable(&self, pixmap: &mut Pixmap, painter: &TreePainter, reason: &str, dpr: f32) {
        self.draw_message(pixmap, painter, &format!("Tree unavailable ({reason})"), dpr);
    }

    /// Header with no ruler: background and dividers only.
    pub fn draw_blank_header(&self, pixmap: &mut Pixmap, painter: &TreePainter, dpr: f32) {
        pixmap.fill(to_skia_color(painter.header_background_color));
        let width = pixmap.width() as f32;
        let height = pixmap.height() as f32;
        let divider = dpr.round().max(1.0);
        fill_rect(pixmap, 0.0, 0.0, width, divider, painter.divider_color);
        fill_rect(pixmap, 0.0, height - divider, width, divider, painter.divider_color);
    }

    pub fn draw_message(&self, pixmap: &mut Pixmap, painter: &TreePainter, message: &str, dpr: f32) {
        pixmap.fill(to_skia_color(painter.background_color));
        if let Some(font) = self.text_font.as_ref() {
            let center = egui::pos2(pixmap.width() as f32 / 2.0, pixmap.height() as f32 / 2.0);
            draw_text(
                pixmap,
                font,
                message,
                center,
                Align2::CENTER_CENTER,
                painter.label_font_size * dpr,
                painter.unavailable_color,
            );
        }
    }
}

/// Physical-pixel surface for a CSS size at the given device pixel ratio.
pub fn new_surface(css_size: Vec2, device_pixel_ratio: f32) -> Result<Pixmap, ExportError> {
    let width = (css_size.x * device_pixel_ratio).round().max(1.0) as u32;
    let height = (css_size.y * device_pixel_ratio).round().max(1.0) as u32;
    Pixmap::new(width, height).ok_or(ExportError::Surface { width, height })
}

pub fn to_color_image(pixmap: &Pixmap) -> egui::ColorImage {
    let rgba = premultiplied_rgba_to_unmultiplied(pixmap.data());
    egui::ColorImage::from_rgba_unmultiplied(
        [pixmap.width() as usize, pixmap.height() as usize],
        &rgba,
    )
}

fn load_system_sans_font() -> Option<Font> {
    let source = SystemSource::new();
    let handle = source
        .select_best_match(&[FamilyName::SansSerif], &Properties::new())
        .ok()?;
    let font = handle.load().ok()?;
    let font_data = font.copy_font_data()?;
    Font::from_bytes(font_data.as_ref().clone(), FontSettings::default()).ok()
}

fn stroke_line(pixmap: &mut Pixmap, from: Pos2, to: Pos2, style: egui::Stroke, dpr: f32) {
    let mut pb = PathBuilder::new();
    pb.move_to(from.x, from.y);
    pb.line_to(to.x, to.y);
    let Some(path) = pb.finish() else {
        return;
    };
    let mut paint = Paint::default();
    paint.set_color(to_skia_color(style.color));
    paint.anti_alias = true;

    let stroke = Stroke {
        width: (style.width * dpr).max(1.0),
        line_cap: LineCap::Square,
        ..Stroke::default()
    };
    pixmap.stroke_path(&path, &paint, &stroke, Transform::identity(), None);
}

fn fill_rect(pixmap: &mut Pixmap, x: f32, y: f32, w: f32, h: f32, color: Color32) {
    let Some(rect) = Rect::from_xywh(x, y, w.max(0.0), h.max(0.0)) else {
        return;
    };
    let mut paint = Paint::default();
    paint.set_color(to_skia_color(color));
    pixmap.fill_rect(rect, &paint, Transform::identity(), None);
}

fn to_skia_color(color: Color32) -> Color {
    Color::from_rgba8(color.r(), color.g(), color.b(), color.a())
}

/// Blend `text` at `anchor` (physical pixels) with the given alignment.
fn draw_text(
    pixmap: &mut Pixmap,
    font: &Font,
    text: &str,
    anchor: Pos2,
    align: Align2,
    px: f32,
    color: Color32,
) {
    if text.is_empty() {
        return;
    }
    let mut layout = Layout::new(CoordinateSystem::PositiveYDown);
    layout.reset(&LayoutSettings::default());
    layout.append(&[font], &TextStyle::new(text, px.max(6.0), 0));

    let mut min = Pos2::new(f32::INFINITY, f32::INFINITY);
    let mut max = Pos2::new(f32::NEG_INFINITY, f32::NEG_INFINITY);
    for g in layout.glyphs() {
        if g.width == 0 || g.height == 0 {
            continue;
        }
        min = min.min(Pos2::new(g.x, g.y));
        max = max.max(Pos2::new(g.x + g.width as f32, g.y + g.height as f32));
    }
    if !min.x.is_finite() || !max.x.is_finite() {
        return;
    }

    let size = max - min;
    let origin_x = match align.x() {
        egui::Align::Min => anchor.x,
        egui::Align::Center => anchor.x - size.x / 2.0,
        egui::Align::Max => anchor.x - size.x,
    };
    let origin_y = anchor.y - size.y / 2.0;
    let width = pixmap.width() as usize;
    let data = pixmap.data_mut();

    for g in layout.glyphs() {
        if g.width == 0 || g.height == 0 {
            continue;
        }
        let (metrics, bitmap) = font.rasterize_config(g.key);
        let left = (origin_x + g.x - min.x).round() as i32;
        let top = (origin_y + g.y - min.y).round() as i32;
        for y in 0..metrics.height {
            for x in 0..metrics.width {
                let coverage = bitmap[y * metrics.width + x] as f32 / 255.0;
                let alpha = coverage * color.a() as f32 / 255.0;
                blend_pixel_premultiplied(data, width, left + x as i32, top + y as i32, color, alpha);
            }
        }
    }
}

fn blend_pixel_premultiplied(
    data: &mut [u8],
    width: usize,
    x: i32,
    y: i32,
    color: Color32,
    src_a: f32,
) {
    if src_a <= 0.0 || x < 0 || y < 0 || width == 0 {
        return;
    }
    let (xu, yu) = (x as usize, y as usize);
    let height = data.len() / (width * 4);
    if xu >= width || yu >= height {
        return;
    }
    let idx = (yu * width + xu) * 4;
    let src = [color.r(), color.g(), color.b()];
    for channel in 0..3 {
        let dst = data[idx + channel] as f32 / 255.0;
        let out = src[channel] as f32 / 255.0 * src_a + dst * (1.0 - src_a);
        data[idx + channel] = (out.clamp(0.0, 1.0) * 255.0).round() as u8;
    }
    let dst_a = data[idx + 3] as f32 / 255.0;
    let out_a = src_a + dst_a * (1.0 - src_a);
    data[idx + 3] = (out_a.clamp(0.0, 1.0) * 255.0).round() as u8;
}

/// tiny-skia stores premultiplied RGBA; egui and the image encoders want straight alpha.
pub fn premultiplied_rgba_to_unmultiplied(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for rgba in data.chunks_exact(4) {
        let a = rgba[3] as u32;
        if a == 0 {
            out.extend_from_slice(&[0, 0, 0, 0]);
            continue;
        }
        for &channel in &rgba[..3] {
            out.push(((channel as u32 * 255 + a / 2) / a).min(255) as u8);
        }
        out.push(a as u8);
    }
    out
}
