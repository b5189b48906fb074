use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::viewport::{ViewportState, FIT_ZOOM};
use crate::error::PreferenceError;

/// Flat, host-persisted view record.
///
/// Scroll offsets are stored in CSS pixels so a record survives a change of
/// device pixel ratio between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewPreferences {
    pub zoom_level: f32,
    pub vertical_scroll_px: f32,
    pub horizontal_scroll_px: f32,
    #[serde(default)]
    pub tree_configuration_id: Option<String>,
}

impl Default for ViewPreferences {
    fn default() -> Self {
        Self {
            zoom_level: FIT_ZOOM,
            vertical_scroll_px: 0.0,
            horizontal_scroll_px: 0.0,
            tree_configuration_id: None,
        }
    }
}

impl ViewPreferences {
    pub fn capture(viewport: &ViewportState, tree_configuration_id: Option<String>) -> Self {
        Self {
            zoom_level: viewport.zoom_level,
            vertical_scroll_px: viewport.vertical_scroll_px / viewport.device_pixel_ratio,
            horizontal_scroll_px: viewport.horizontal_scroll_px / viewport.device_pixel_ratio,
            tree_configuration_id,
        }
    }

    /// Restore zoom and offsets; out-of-range values are clamped by the viewport.
    pub fn apply(&self, viewport: &mut ViewportState) {
        viewport.zoom_level = viewport.limits.clamp(self.zoom_level);
        let dpr = viewport.device_pixel_ratio;
        viewport.scroll_to(self.horizontal_scroll_px * dpr, self.vertical_scroll_px * dpr);
    }
}

/// Read on mount, written (debounced) whenever the viewport settles.
pub trait PreferenceStore {
    fn load(&self) -> Result<Option<ViewPreferences>, PreferenceError>;
    fn save(&self, prefs: &ViewPreferences) -> Result<(), PreferenceError>;
}

/// Store that keeps the record in memory only.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferenceStore {
    record: Rc<RefCell<Option<ViewPreferences>>>,
    writes: Rc<RefCell<usize>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> usize {
        *self.writes.borrow()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> Result<Option<ViewPreferences>, PreferenceError> {
        Ok(self.record.borrow().clone())
    }

    fn save(&self, prefs: &ViewPreferences) -> Result<(), PreferenceError> {
        *self.record.borrow_mut() = Some(prefs.clone());
        *self.writes.borrow_mut() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eframe::egui::vec2;

    #[test]
    fn serializes_as_flat_camel_case_record() {
        let prefs = ViewPreferences {
            zoom_level: 2.0,
            vertical_scroll_px: 48.0,
            horizontal_scroll_px: 0.0,
            tree_configuration_id: Some("cfg-1".into()),
        };
        let json = serde_json::to_value(&prefs).unwrap();
        assert_eq!(json["zoomLevel"], 2.0);
        assert_eq!(json["verticalScrollPx"], 48.0);
        assert_eq!(json["treeConfigurationId"], "cfg-1");
        let back: ViewPreferences = serde_json::from_value(json).unwrap();
        assert_eq!(back, prefs);
    }

    #[test]
    fn apply_clamps_to_viewport_limits() {
        let mut viewport = ViewportState::default();
        viewport.set_viewport_size(vec2(400.0, 100.0));
        viewport.set_content_size(vec2(400.0, 200.0));
        let prefs = ViewPreferences {
            zoom_level: 500.0,
            vertical_scroll_px: -10.0,
            horizontal_scroll_px: 30.0,
            tree_configuration_id: None,
        };
        prefs.apply(&mut viewport);
        assert_eq!(viewport.zoom_level, viewport.limits.max);
        assert_eq!(viewport.vertical_scroll_px, 0.0);
        assert_eq!(viewport.horizontal_scroll_px, 30.0);
    }

    #[test]
    fn record_survives_a_device_pixel_ratio_change() {
        let mut retina = ViewportState::default();
        retina.set_device_pixel_ratio(2.0);
        retina.set_viewport_size(vec2(400.0, 100.0));
        retina.set_content_size(vec2(400.0, 1000.0));
        retina.scroll_to(0.0, 200.0);
        let prefs = ViewPreferences::capture(&retina, None);
        assert_eq!(prefs.vertical_scroll_px, 100.0);

        let mut plain = ViewportState::default();
        plain.set_viewport_size(vec2(400.0, 100.0));
        plain.set_content_size(vec2(400.0, 1000.0));
        prefs.apply(&mut plain);
        assert_eq!(plain.vertical_scroll_css(), 100.0);
        assert_eq!(plain.vertical_scroll_px, 100.0);
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryPreferenceStore::new();
        assert_eq!(store.load().unwrap(), None);
        store.save(&ViewPreferences::default()).unwrap();
        assert_eq!(store.load().unwrap(), Some(ViewPreferences::default()));
        assert_eq!(store.writes(), 1);
    }
}
