use eframe::egui::{pos2, vec2, Pos2, Vec2};

pub const FIT_ZOOM: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomLimits {
    pub min: f32,
    pub max: f32,
}

impl Default for ZoomLimits {
    fn default() -> Self {
        Self {
            min: 0.1,
            max: 50.0,
        }
    }
}

impl ZoomLimits {
    pub fn clamp(&self, zoom: f32) -> f32 {
        if !zoom.is_finite() {
            return FIT_ZOOM.max(self.min).min(self.max);
        }
        zoom.max(self.min).min(self.max)
    }

    pub fn is_boundary(&self, zoom: f32) -> bool {
        zoom <= self.min || zoom >= self.max
    }
}

/// Outcome of a zoom request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomChange {
    pub changed: bool,
    pub zoom_level: f32,
    pub at_boundary: bool,
}

/// Scroll offset that keeps the content point under `cursor` fixed when the
/// zoom changes from `old_zoom` to `new_zoom`. All values share one pixel unit.
pub fn anchored_offset(cursor: f32, offset: f32, old_zoom: f32, new_zoom: f32) -> f32 {
    (cursor + offset) * new_zoom / old_zoom - cursor
}

/// Zoom and scroll state of the tree body surface.
///
/// Scroll offsets are physical pixels; sizes are CSS pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportState {
    pub zoom_level: f32,
    pub horizontal_scroll_px: f32,
    pub vertical_scroll_px: f32,
    pub device_pixel_ratio: f32,
    pub viewport_size: Vec2,
    /// Content size at zoom level 1.
    pub content_size: Vec2,
    pub limits: ZoomLimits,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self::new(ZoomLimits::default())
    }
}

impl ViewportState {
    pub fn new(limits: ZoomLimits) -> Self {
        Self {
            zoom_level: FIT_ZOOM,
            horizontal_scroll_px: 0.0,
            vertical_scroll_px: 0.0,
            device_pixel_ratio: 1.0,
            viewport_size: Vec2::ZERO,
            content_size: Vec2::ZERO,
            limits,
        }
    }

    pub fn is_fit(&self) -> bool {
        (self.zoom_level - FIT_ZOOM).abs() < 1e-6
    }

    pub fn physical_size(&self) -> (u32, u32) {
        let w = (self.viewport_size.x * self.device_pixel_ratio).round().max(0.0);
        let h = (self.viewport_size.y * self.device_pixel_ratio).round().max(0.0);
        (w as u32, h as u32)
    }

    pub fn max_scroll(&self) -> Vec2 {
        let dpr = self.device_pixel_ratio;
        vec2(
            ((self.content_size.x * self.zoom_level - self.viewport_size.x) * dpr).max(0.0),
            ((self.content_size.y * self.zoom_level - self.viewport_size.y) * dpr).max(0.0),
        )
    }

    pub fn clamp_scroll(&mut self) {
        let max = self.max_scroll();
        self.horizontal_scroll_px = clamp_offset(self.horizontal_scroll_px, max.x);
        self.vertical_scroll_px = clamp_offset(self.vertical_scroll_px, max.y);
    }

    pub fn set_viewport_size(&mut self, size: Vec2) {
        self.viewport_size = vec2(size.x.max(0.0), size.y.max(0.0));
        self.clamp_scroll();
    }

    pub fn set_content_size(&mut self, size: Vec2) {
        self.content_size = vec2(size.x.max(0.0), size.y.max(0.0));
        self.clamp_scroll();
    }

    /// Move to the given physical offsets (clamped). Returns whether anything moved.
    pub fn scroll_to(&mut self, horizontal: f32, vertical: f32) -> bool {
        let before = (self.horizontal_scroll_px, self.vertical_scroll_px);
        self.horizontal_scroll_px = horizontal;
        self.vertical_scroll_px = vertical;
        self.clamp_scroll();
        before != (self.horizontal_scroll_px, self.vertical_scroll_px)
    }

    pub fn scroll_by(&mut self, delta: Vec2) -> bool {
        self.scroll_to(
            self.horizontal_scroll_px + delta.x,
            self.vertical_scroll_px + delta.y,
        )
    }

    /// Zoom keeping the content point under `cursor` (CSS pixels, relative to
    /// the surface) in place.
    pub fn zoom_at(&mut self, cursor: Pos2, requested: f32) -> ZoomChange {
        let old_zoom = self.zoom_level;
        let new_zoom = self.limits.clamp(requested);
        let at_boundary = self.limits.is_boundary(new_zoom);
        if (new_zoom - old_zoom).abs() <= f32::EPSILON {
            return ZoomChange {
                changed: false,
                zoom_level: old_zoom,
                at_boundary,
            };
        }

        let dpr = self.device_pixel_ratio;
        let horizontal =
            anchored_offset(cursor.x * dpr, self.horizontal_scroll_px, old_zoom, new_zoom);
        let vertical = anchored_offset(cursor.y * dpr, self.vertical_scroll_px, old_zoom, new_zoom);
        self.zoom_level = new_zoom;
        self.horizontal_scroll_px = horizontal;
        self.vertical_scroll_px = vertical;
        self.clamp_scroll();

        ZoomChange {
            changed: true,
            zoom_level: new_zoom,
            at_boundary,
        }
    }

    /// Rescale in-flight offsets by `new/old` so the focal point stays put.
    pub fn set_device_pixel_ratio(&mut self, ratio: f32) -> bool {
        if !(ratio > 0.0) || (ratio - self.device_pixel_ratio).abs() <= f32::EPSILON {
            return false;
        }
        let factor = ratio / self.device_pixel_ratio;
        self.horizontal_scroll_px *= factor;
        self.vertical_scroll_px *= factor;
        self.device_pixel_ratio = ratio;
        self.clamp_scroll();
        true
    }

    /// Zoom 1, offsets (0, 0).
    pub fn reset(&mut self) {
        self.zoom_level = FIT_ZOOM;
        self.horizontal_scroll_px = 0.0;
        self.vertical_scroll_px = 0.0;
    }

    /// Surface CSS position → assembly coordinates (zoom 1, unscrolled).
    pub fn to_assembly(&self, cursor: Pos2) -> Pos2 {
        let dpr = self.device_pixel_ratio;
        pos2(
            (cursor.x + self.horizontal_scroll_px / dpr) / self.zoom_level,
            (cursor.y + self.vertical_scroll_px / dpr) / self.zoom_level,
        )
    }

    /// Assembly coordinates → physical surface pixels.
    pub fn to_physical(&self, point: Pos2) -> Pos2 {
        let dpr = self.device_pixel_ratio;
        pos2(
            point.x * self.zoom_level * dpr - self.horizontal_scroll_px,
            point.y * self.zoom_level * dpr - self.vertical_scroll_px,
        )
    }

    /// Scroll offset in CSS pixels, the unit the line list speaks.
    pub fn vertical_scroll_css(&self) -> f32 {
        self.vertical_scroll_px / self.device_pixel_ratio
    }

    /// Index of the first row at least partly visible.
    pub fn first_visible_row(&self, row_height: f32) -> usize {
        let row_px = row_height * self.zoom_level * self.device_pixel_ratio;
        if row_px <= 0.0 {
            return 0;
        }
        (self.vertical_scroll_px / row_px).floor().max(0.0) as usize
    }
}

fn clamp_offset(offset: f32, max: f32) -> f32 {
    if !offset.is_finite() {
        return 0.0;
    }
    offset.max(0.0).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewport() -> ViewportState {
        let mut viewport = ViewportState::default();
        viewport.set_viewport_size(vec2(400.0, 300.0));
        viewport.set_content_size(vec2(400.0, 2400.0));
        viewport
    }

    #[test]
    fn zoom_clamps_at_both_boundaries() {
        let mut viewport = viewport();
        let change = viewport.zoom_at(pos2(10.0, 10.0), 1_000.0);
        assert!(change.changed && change.at_boundary);
        assert_eq!(viewport.zoom_level, 50.0);

        let again = viewport.zoom_at(pos2(10.0, 10.0), 2_000.0);
        assert!(!again.changed);
        assert_eq!(viewport.zoom_level, 50.0);

        viewport.zoom_at(pos2(10.0, 10.0), 0.0001);
        assert_eq!(viewport.zoom_level, 0.1);
    }

    #[test]
    fn cursor_anchored_zoom_keeps_point_under_cursor() {
        let mut viewport = viewport();
        viewport.scroll_to(0.0, 600.0);
        let cursor = pos2(150.0, 120.0);
        let before = viewport.to_assembly(cursor);
        viewport.zoom_at(cursor, 2.5);
        let after = viewport.to_assembly(cursor);
        assert!((before - after).length() < 1.0, "{before:?} vs {after:?}");
    }

    #[test]
    fn scroll_is_clamped_to_content() {
        let mut viewport = viewport();
        viewport.scroll_to(-50.0, 99_999.0);
        assert_eq!(viewport.horizontal_scroll_px, 0.0);
        assert_eq!(viewport.vertical_scroll_px, 2100.0);
    }

    #[test]
    fn device_pixel_ratio_change_rescales_offsets() {
        let mut viewport = viewport();
        viewport.scroll_to(0.0, 300.0);
        let focal = viewport.to_assembly(pos2(0.0, 0.0));
        assert!(viewport.set_device_pixel_ratio(2.0));
        assert_eq!(viewport.vertical_scroll_px, 600.0);
        assert_eq!(viewport.to_assembly(pos2(0.0, 0.0)), focal);
        assert_eq!(viewport.physical_size(), (800, 600));
        assert!(!viewport.set_device_pixel_ratio(2.0));
    }

    #[test]
    fn first_visible_row_tracks_zoom() {
        let mut viewport = viewport();
        viewport.scroll_to(0.0, 240.0);
        assert_eq!(viewport.first_visible_row(24.0), 10);
        viewport.zoom_level = 2.0;
        assert_eq!(viewport.first_visible_row(24.0), 5);
    }
}
