use eframe::egui::{Modifiers, Pos2, Vec2};
use log::trace;
use rust_decimal::Decimal;

use super::assembly::{HitKind, TreeAssembly};
use super::hit_test::hit_test;
use super::viewport::ViewportState;
use super::NodeId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InteractionConfig {
    /// CSS pixels the pointer may travel before a press turns into a pan.
    pub dead_zone_px: f32,
    /// CSS-pixel band around each segment that still counts as a hit.
    pub hit_tolerance_px: f32,
    pub zoom_speed_base: f32,
    pub zoom_speed_min: f32,
    pub zoom_speed_max: f32,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            dead_zone_px: 4.0,
            hit_tolerance_px: 3.0,
            zoom_speed_base: 0.0008,
            zoom_speed_min: 0.001,
            zoom_speed_max: 0.01,
        }
    }
}

/// Pointer input on the body surface, positions in CSS pixels relative to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerEvent {
    Press { pos: Pos2 },
    Move { pos: Pos2 },
    Release { pos: Pos2 },
    Leave,
    /// `delta` follows the "positive scrolls down / right" convention.
    Wheel {
        pos: Pos2,
        delta: Vec2,
        modifiers: Modifiers,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStyle {
    Default,
    PointingHand,
    Move,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Redraw,
    /// Scroll offsets moved without a zoom change.
    Scrolled,
    ZoomChanged { zoom_level: f32, at_boundary: bool },
    Highlight(Vec<String>),
    Cursor(CursorStyle),
    ShowDetails { leaf: String },
    ContextMenu {
        leaf_names: Vec<String>,
        anchor: Pos2,
        /// Set when the clicked node may become a subtree filter root.
        subtree_offer: Option<NodeId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PointerState {
    Idle,
    Pressed {
        start: Pos2,
        start_offsets: Vec2,
        generation: Option<u64>,
    },
    Panning {
        start: Pos2,
        start_offsets: Vec2,
    },
}

/// Pointer and wheel state machine for the body surface.
///
/// Lives as long as the surface; each handler reads the viewport and the
/// current assembly by reference, mutates the viewport, and reports what
/// the owner has to do as a list of [`Effect`]s.
#[derive(Debug)]
pub struct InteractionController {
    config: InteractionConfig,
    state: PointerState,
    wheel_open: bool,
    cursor: CursorStyle,
    last_hover: Option<Vec<String>>,
}

impl InteractionController {
    pub fn new(config: InteractionConfig) -> Self {
        Self {
            config,
            state: PointerState::Idle,
            wheel_open: true,
            cursor: CursorStyle::Default,
            last_hover: None,
        }
    }

    pub fn config(&self) -> &InteractionConfig {
        &self.config
    }

    pub fn is_panning(&self) -> bool {
        matches!(self.state, PointerState::Panning { .. })
    }

    pub fn wheel_open(&self) -> bool {
        self.wheel_open
    }

    pub fn cursor(&self) -> CursorStyle {
        self.cursor
    }

    /// A redraw fired: reopen the wheel gate.
    pub fn on_frame(&mut self) {
        self.wheel_open = true;
    }

    /// Drop any gesture in progress (assembly rebuilt, view reset).
    pub fn reset(&mut self) {
        self.state = PointerState::Idle;
        self.wheel_open = true;
        self.last_hover = None;
    }

    pub fn handle(
        &mut self,
        event: PointerEvent,
        viewport: &mut ViewportState,
        assembly: Option<&TreeAssembly>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            PointerEvent::Press { pos } => {
                self.state = PointerState::Pressed {
                    start: pos,
                    start_offsets: Vec2::new(
                        viewport.horizontal_scroll_px,
                        viewport.vertical_scroll_px,
                    ),
                    generation: assembly.map(|a| a.generation),
                };
            }
            PointerEvent::Move { pos } => self.on_move(pos, viewport, assembly, &mut effects),
            PointerEvent::Release { pos } => {
                match std::mem::replace(&mut self.state, PointerState::Idle) {
                    PointerState::Pressed { generation, .. } => {
                        let current = assembly.filter(|a| Some(a.generation) == generation);
                        self.on_click(pos, viewport, current, &mut effects);
                    }
                    PointerState::Panning { .. } => {
                        trace!(
                            "pan finished at ({}, {})",
                            viewport.horizontal_scroll_px,
                            viewport.vertical_scroll_px
                        );
                        effects.push(Effect::Scrolled);
                    }
                    PointerState::Idle => {}
                }
                self.set_cursor(CursorStyle::Default, &mut effects);
            }
            PointerEvent::Leave => {
                self.last_hover = Some(Vec::new());
                effects.push(Effect::Highlight(Vec::new()));
                if matches!(self.state, PointerState::Idle) {
                    self.set_cursor(CursorStyle::Default, &mut effects);
                }
            }
            PointerEvent::Wheel {
                pos,
                delta,
                modifiers,
            } => self.on_wheel(pos, delta, modifiers, viewport, &mut effects),
        }
        effects
    }

    fn on_move(
        &mut self,
        pos: Pos2,
        viewport: &mut ViewportState,
        assembly: Option<&TreeAssembly>,
        effects: &mut Vec<Effect>,
    ) {
        match self.state {
            PointerState::Idle => self.on_hover(pos, viewport, assembly, effects),
            PointerState::Pressed {
                start,
                start_offsets,
                ..
            } => {
                let delta = pos - start;
                let dead_zone = self.config.dead_zone_px;
                if delta.x.abs() <= dead_zone && delta.y.abs() <= dead_zone {
                    return;
                }
                self.state = PointerState::Panning {
                    start,
                    start_offsets,
                };
                self.set_cursor(CursorStyle::Move, effects);
                self.pan(pos, start, start_offsets, viewport, effects);
            }
            PointerState::Panning {
                start,
                start_offsets,
            } => self.pan(pos, start, start_offsets, viewport, effects),
        }
    }

    fn pan(
        &self,
        pos: Pos2,
        start: Pos2,
        start_offsets: Vec2,
        viewport: &mut ViewportState,
        effects: &mut Vec<Effect>,
    ) {
        let mut delta = pos - start;
        // Keep the ruler from drifting when the whole tree width already fits.
        let left_aligned = start_offsets.x <= 0.0 && viewport.zoom_level <= 1.0;
        if left_aligned && delta.x.abs() <= self.config.dead_zone_px {
            delta.x = 0.0;
        }
        let dpr = viewport.device_pixel_ratio;
        let moved = viewport.scroll_to(
            start_offsets.x - delta.x * dpr,
            start_offsets.y - delta.y * dpr,
        );
        if moved {
            effects.push(Effect::Scrolled);
            effects.push(Effect::Redraw);
        }
    }

    fn on_hover(
        &mut self,
        pos: Pos2,
        viewport: &ViewportState,
        assembly: Option<&TreeAssembly>,
        effects: &mut Vec<Effect>,
    ) {
        let hit = assembly.and_then(|a| {
            hit_test(a, viewport, pos, self.config.hit_tolerance_px).map(|hit| (a, hit))
        });
        let leaves = hit
            .and_then(|(a, hit)| hit.resolve(a))
            .map(|node| node.subtree_leaf_names.clone())
            .unwrap_or_default();

        let cursor = if leaves.is_empty() {
            CursorStyle::Default
        } else {
            CursorStyle::PointingHand
        };
        self.set_cursor(cursor, effects);

        if self.last_hover.as_ref() != Some(&leaves) {
            self.last_hover = Some(leaves.clone());
            effects.push(Effect::Highlight(leaves));
        }
    }

    fn on_click(
        &mut self,
        pos: Pos2,
        viewport: &ViewportState,
        assembly: Option<&TreeAssembly>,
        effects: &mut Vec<Effect>,
    ) {
        let Some(assembly) = assembly else {
            return;
        };
        let Some(hit) = hit_test(assembly, viewport, pos, self.config.hit_tolerance_px) else {
            return;
        };
        let Some(node) = hit.resolve(assembly) else {
            return;
        };

        if node.is_leaf() {
            effects.push(Effect::ShowDetails {
                leaf: node.id.clone(),
            });
            effects.push(Effect::ContextMenu {
                leaf_names: vec![node.id.clone()],
                anchor: pos,
                subtree_offer: None,
            });
            return;
        }

        let offer = (hit.kind == HitKind::Node
            && !node.children.is_empty()
            && node.branch_length > Decimal::ZERO)
            .then(|| node.id.clone());
        effects.push(Effect::ContextMenu {
            leaf_names: node.subtree_leaf_names.clone(),
            anchor: pos,
            subtree_offer: offer,
        });
    }

    fn on_wheel(
        &mut self,
        pos: Pos2,
        delta: Vec2,
        modifiers: Modifiers,
        viewport: &mut ViewportState,
        effects: &mut Vec<Effect>,
    ) {
        if !self.wheel_open {
            return;
        }
        let amount = if delta.y != 0.0 { delta.y } else { delta.x };
        if amount == 0.0 {
            return;
        }
        let dpr = viewport.device_pixel_ratio;

        if modifiers.shift {
            if viewport.scroll_by(Vec2::new(amount * dpr, 0.0)) {
                effects.push(Effect::Scrolled);
                effects.push(Effect::Redraw);
            }
            return;
        }
        if modifiers.ctrl || modifiers.command || modifiers.mac_cmd {
            if viewport.scroll_by(Vec2::new(0.0, amount * dpr)) {
                effects.push(Effect::Scrolled);
                effects.push(Effect::Redraw);
            }
            return;
        }

        let speed = self.zoom_speed(viewport);
        let requested = viewport.zoom_level * (-amount * speed).exp();
        let change = viewport.zoom_at(pos, requested);
        if !change.changed {
            return;
        }
        if !change.at_boundary {
            self.wheel_open = false;
        }
        effects.push(Effect::ZoomChanged {
            zoom_level: change.zoom_level,
            at_boundary: change.at_boundary,
        });
        effects.push(Effect::Redraw);
    }

    /// Taller trees zoom faster so a full sweep takes a similar wheel travel.
    pub fn zoom_speed(&self, viewport: &ViewportState) -> f32 {
        let tree_height = viewport.content_size.y * viewport.zoom_level;
        let view_height = viewport.viewport_size.y;
        let ratio = if view_height > 0.0 {
            tree_height / view_height
        } else {
            1.0
        };
        (self.config.zoom_speed_base * ratio)
            .max(self.config.zoom_speed_min)
            .min(self.config.zoom_speed_max)
    }

    fn set_cursor(&mut self, cursor: CursorStyle, effects: &mut Vec<Effect>) {
        if self.cursor != cursor {
            self.cursor = cursor;
            effects.push(Effect::Cursor(cursor));
        }
    }
}
