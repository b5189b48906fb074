use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use eframe::egui::{vec2, Color32, Pos2, Vec2};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use tiny_skia::Pixmap;

use super::assembly::{assemble, assemble_subtree, fit_ratio, LayoutTokens, TreeAssembly};
use super::filter::{FilterState, SubtreeFilter};
use super::interaction::{CursorStyle, Effect, InteractionConfig, InteractionController, PointerEvent};
use super::painter::TreePainter;
use super::prefs::{PreferenceStore, ViewPreferences};
use super::scale::compute_tick_scale;
use super::skia_renderer::{new_surface, BodyScene, HeaderScene, SkiaTreeRenderer};
use super::viewport::{ViewportState, ZoomLimits, FIT_ZOOM};
use super::{DendrogramIndex, DendrogramNode, NodeId};
use crate::error::{ExportError, FetchError, FilterError, Unavailable};
use crate::export::{encode_frame, DownloadFormat};
use crate::io::fetch::{DendrogramKey, DendrogramSource, FetchTicket, TreeLoader};
use crate::link::{Debouncer, FrameScheduler, Highlighter, LinkChannels, Origin, Subscription, ViewSync};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tokens: LayoutTokens,
    pub limits: ZoomLimits,
    pub interaction: InteractionConfig,
    /// Delay before a tree scroll reaches the line list.
    pub link_debounce: Duration,
    pub prefs_debounce: Duration,
    pub min_scale_unit: Decimal,
    /// CSS height of the ruler surface.
    pub header_height: f32,
    /// Preferences saved under another configuration are not restored.
    pub tree_configuration_id: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tokens: LayoutTokens::default(),
            limits: ZoomLimits::default(),
            interaction: InteractionConfig::default(),
            link_debounce: Duration::from_millis(50),
            prefs_debounce: Duration::from_millis(500),
            min_scale_unit: Decimal::ZERO,
            header_height: 32.0,
            tree_configuration_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Loading,
    Ready,
    Unavailable(Unavailable),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextMenuRequest {
    pub leaf_names: Vec<String>,
    /// CSS position on the body surface.
    pub anchor: Pos2,
    pub subtree_offer: Option<NodeId>,
}

/// Host-side sinks for clicks on the tree.
pub trait TreeActions {
    fn show_leaf_details(&self, leaf: &str);
    fn show_context_menu(&self, request: &ContextMenuRequest);
}

/// Header and body rasters of one frame, in physical pixels.
pub struct RenderedFrame {
    pub header: Pixmap,
    pub body: Pixmap,
}

struct UnfilteredTree {
    root: DendrogramNode,
    index: DendrogramIndex,
}

struct TreeSurface {
    config: EngineConfig,
    painter: RefCell<TreePainter>,
    renderer: SkiaTreeRenderer,
    viewport: RefCell<ViewportState>,
    controller: RefCell<InteractionController>,
    tree: RefCell<Option<UnfilteredTree>>,
    filter: RefCell<SubtreeFilter>,
    assembly: RefCell<Option<Rc<TreeAssembly>>>,
    state: Cell<TreeState>,
    highlighted: RefCell<HashSet<String>>,
    stratification: RefCell<HashMap<String, Color32>>,
    show_distances: Cell<bool>,
    frames: FrameScheduler,
    sync: ViewSync,
    highlighter: Highlighter,
    prefs_store: RefCell<Option<Box<dyn PreferenceStore>>>,
    prefs_out: RefCell<Debouncer<ViewPreferences>>,
    pending_restore: RefCell<Option<ViewPreferences>>,
    actions: RefCell<Option<Rc<dyn TreeActions>>>,
    loader: RefCell<TreeLoader>,
}

impl TreeSurface {
    fn rebuild(&self) {
        if self.tree.borrow().is_none() {
            return;
        }
        match self.try_assemble() {
            Ok(assembly) => {
                debug!(
                    "assembled {} rows at {:.2} px per unit (generation {})",
                    assembly.leaf_count, assembly.pixels_per_unit, assembly.generation
                );
                let content_height = assembly.content_height();
                {
                    let mut viewport = self.viewport.borrow_mut();
                    let width = viewport.viewport_size.x;
                    viewport.set_content_size(vec2(width, content_height));
                }
                *self.assembly.borrow_mut() = Some(Rc::new(assembly));
                self.state.set(TreeState::Ready);
                self.controller.borrow_mut().reset();
                self.restore_preferences();
            }
            Err(reason) => {
                info!("tree view unavailable: {}", reason.reason_code());
                *self.assembly.borrow_mut() = None;
                self.state.set(TreeState::Unavailable(reason));
                self.controller.borrow_mut().reset();
            }
        }
        self.frames.request();
    }

    fn try_assemble(&self) -> Result<TreeAssembly, Unavailable> {
        let tree = self.tree.borrow();
        let tree = tree.as_ref().ok_or(Unavailable::FetchFailed)?;
        let filter = self.filter.borrow();
        filter.revalidate(&tree.index)?;

        let root_id = filter.state().root_id();
        let active = match root_id {
            Some(id) => tree
                .index
                .resolve(&tree.root, id)
                .ok_or(Unavailable::FilterMismatch)?,
            None => &tree.root,
        };
        if active.leaf_count() < 2 {
            return Err(Unavailable::TooFewLeaves);
        }
        let width = self.viewport.borrow().viewport_size.x;
        if !(width > 0.0) {
            return Err(Unavailable::ZeroWidthViewport);
        }
        let max_distance = active.max_leaf_distance();
        if max_distance <= Decimal::ZERO {
            return Err(Unavailable::ZeroDistanceRange);
        }
        let tokens = &self.config.tokens;
        let ratio = fit_ratio(width, tokens.padding, max_distance).ok_or(Unavailable::ZeroWidthViewport)?;

        match root_id {
            Some(id) => assemble_subtree(&tree.root, &tree.index, id, width, ratio, tokens)
                .ok_or(Unavailable::FilterMismatch),
            None => Ok(assemble(&tree.root, width, ratio, tokens)),
        }
    }

    /// Apply the stored view once, after the first successful assembly.
    fn restore_preferences(&self) {
        let Some(prefs) = self.pending_restore.borrow_mut().take() else {
            return;
        };
        if prefs.tree_configuration_id.is_some()
            && prefs.tree_configuration_id != self.config.tree_configuration_id
        {
            debug!("stored view belongs to another tree configuration; not restored");
            return;
        }
        let fit = {
            let mut viewport = self.viewport.borrow_mut();
            prefs.apply(&mut viewport);
            viewport.is_fit()
        };
        if !fit && self.sync.unlink() {
            info!("restored zoom level {}; view link broken", prefs.zoom_level);
        }
        debug!("restored stored view {prefs:?}");
    }

    fn apply(&self, effects: Vec<Effect>, now: Instant) {
        for effect in effects {
            match effect {
                Effect::Redraw => {
                    self.frames.request();
                }
                Effect::Scrolled | Effect::ZoomChanged { .. } => self.viewport_moved(now),
                Effect::Highlight(leaves) => {
                    *self.highlighted.borrow_mut() = leaves.iter().cloned().collect();
                    self.frames.request();
                    self.highlighter.publish(leaves, Origin::TREE);
                }
                Effect::Cursor(_) => {}
                Effect::ShowDetails { leaf } => {
                    if let Some(actions) = self.actions() {
                        actions.show_leaf_details(&leaf);
                    }
                }
                Effect::ContextMenu {
                    leaf_names,
                    anchor,
                    subtree_offer,
                } => {
                    if let Some(actions) = self.actions() {
                        actions.show_context_menu(&ContextMenuRequest {
                            leaf_names,
                            anchor,
                            subtree_offer,
                        });
                    }
                }
            }
        }
    }

    fn actions(&self) -> Option<Rc<dyn TreeActions>> {
        self.actions.borrow().clone()
    }

    fn viewport_moved(&self, now: Instant) {
        let (fit, position, prefs) = {
            let viewport = self.viewport.borrow();
            (
                viewport.is_fit(),
                viewport.vertical_scroll_css(),
                ViewPreferences::capture(&viewport, self.config.tree_configuration_id.clone()),
            )
        };
        if !fit && self.sync.unlink() {
            info!("zoom level {}; view link broken", prefs.zoom_level);
        }
        self.sync.queue(now, position);
        self.schedule_save(now, prefs);
    }

    /// Queue a save of the current view without touching the link.
    fn record_view(&self, now: Instant) {
        let prefs = ViewPreferences::capture(
            &self.viewport.borrow(),
            self.config.tree_configuration_id.clone(),
        );
        self.schedule_save(now, prefs);
    }

    fn schedule_save(&self, now: Instant, prefs: ViewPreferences) {
        if self.prefs_store.borrow().is_some() {
            self.prefs_out.borrow_mut().schedule(now, prefs);
        }
    }

    fn flush_preferences(&self, now: Instant) {
        let due = self.prefs_out.borrow_mut().poll(now);
        let Some(prefs) = due else {
            return;
        };
        if let Some(store) = self.prefs_store.borrow().as_ref() {
            match store.save(&prefs) {
                Ok(()) => debug!("saved view preferences"),
                Err(err) => warn!("failed to save view preferences: {err}"),
            }
        }
    }

    /// Incoming list scroll, already in CSS pixels.
    fn receive_scroll(&self, position_css: f32) {
        if !self.sync.is_linked() {
            return;
        }
        let Ok(mut viewport) = self.viewport.try_borrow_mut() else {
            return;
        };
        let dpr = viewport.device_pixel_ratio;
        let horizontal = viewport.horizontal_scroll_px;
        if viewport.scroll_to(horizontal, position_css * dpr) {
            self.frames.request();
        }
    }

    fn receive_highlight(&self, case_ids: &[String]) {
        if let Ok(mut highlighted) = self.highlighted.try_borrow_mut() {
            *highlighted = case_ids.iter().cloned().collect();
            self.frames.request();
        }
    }

    fn fail(&self, reason: Unavailable) {
        *self.tree.borrow_mut() = None;
        *self.assembly.borrow_mut() = None;
        self.state.set(TreeState::Unavailable(reason));
        self.controller.borrow_mut().reset();
        self.frames.request();
    }

    /// Every filter transition starts from the fitted, unscrolled view.
    fn after_filter_change(&self) {
        self.viewport.borrow_mut().reset();
        self.rebuild();
        if self.sync.is_linked() {
            self.sync.publish_now(0.0);
        }
        self.record_view(Instant::now());
    }
}

/// The dendrogram view: owns the viewport, the interaction state machine,
/// the subtree filter and the link to the line list, and rasterizes the
/// header and body surfaces on demand.
///
/// The host forwards pointer input through [`TreeEngine::handle_pointer`],
/// calls [`TreeEngine::tick`] once per animation frame and re-renders only
/// when it returns `true`.
pub struct TreeEngine {
    surface: Rc<TreeSurface>,
    subscriptions: Vec<Subscription>,
}

impl TreeEngine {
    pub fn new(config: EngineConfig, channels: LinkChannels, highlighter: Highlighter) -> Self {
        Self::with_renderer(config, channels, highlighter, SkiaTreeRenderer::new())
    }

    pub fn with_renderer(
        config: EngineConfig,
        channels: LinkChannels,
        highlighter: Highlighter,
        renderer: SkiaTreeRenderer,
    ) -> Self {
        let surface = Rc::new(TreeSurface {
            viewport: RefCell::new(ViewportState::new(config.limits)),
            controller: RefCell::new(InteractionController::new(config.interaction)),
            sync: ViewSync::new(channels.clone(), Origin::TREE, config.link_debounce),
            prefs_out: RefCell::new(Debouncer::new(config.prefs_debounce)),
            painter: RefCell::new(TreePainter::default()),
            renderer,
            tree: RefCell::new(None),
            filter: RefCell::new(SubtreeFilter::new()),
            assembly: RefCell::new(None),
            state: Cell::new(TreeState::Loading),
            highlighted: RefCell::new(HashSet::new()),
            stratification: RefCell::new(HashMap::new()),
            show_distances: Cell::new(false),
            frames: FrameScheduler::new(),
            highlighter: highlighter.clone(),
            prefs_store: RefCell::new(None),
            pending_restore: RefCell::new(None),
            actions: RefCell::new(None),
            loader: RefCell::new(TreeLoader::new()),
            config,
        });

        let weak: Weak<TreeSurface> = Rc::downgrade(&surface);
        let on_highlight = highlighter.subscribe(Origin::TREE, move |highlight| {
            if let Some(surface) = weak.upgrade() {
                surface.receive_highlight(&highlight.case_ids);
            }
        });
        let weak = Rc::downgrade(&surface);
        let on_scroll = channels.scroll.subscribe_as(Origin::TREE, move |update| {
            if let Some(surface) = weak.upgrade() {
                surface.receive_scroll(update.position);
            }
        });
        let weak = Rc::downgrade(&surface);
        let on_sort = channels.sort.subscribe(move |sort| {
            let Some(surface) = weak.upgrade() else {
                return;
            };
            if let Some(field) = sort {
                if surface.sync.unlink() {
                    info!("line list sorted by {field}; view link broken");
                }
            }
        });

        Self {
            surface,
            subscriptions: vec![on_highlight, on_scroll, on_sort],
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.surface.config
    }

    /// Attach the preference store and queue its record for restoration on
    /// the next successful assembly.
    pub fn set_preference_store(&self, store: Box<dyn PreferenceStore>) {
        match store.load() {
            Ok(Some(prefs)) => *self.surface.pending_restore.borrow_mut() = Some(prefs),
            Ok(None) => {}
            Err(err) => warn!("ignoring stored view preferences: {err}"),
        }
        *self.surface.prefs_store.borrow_mut() = Some(store);
        if self.surface.assembly.borrow().is_some() {
            self.surface.restore_preferences();
            self.surface.frames.request();
        }
    }

    pub fn set_actions(&self, actions: Rc<dyn TreeActions>) {
        *self.surface.actions.borrow_mut() = Some(actions);
    }

    pub fn state(&self) -> TreeState {
        self.surface.state.get()
    }

    pub fn assembly(&self) -> Option<Rc<TreeAssembly>> {
        self.surface.assembly.borrow().clone()
    }

    pub fn viewport(&self) -> ViewportState {
        self.surface.viewport.borrow().clone()
    }

    pub fn channels(&self) -> &LinkChannels {
        self.surface.sync.channels()
    }

    pub fn highlighter(&self) -> &Highlighter {
        &self.surface.highlighter
    }

    // Loading

    /// Replace the unfiltered dendrogram. An active filter is kept and
    /// revalidated against the new tree.
    pub fn set_dendrogram(&self, dendrogram: DendrogramNode) -> Result<(), FetchError> {
        // Fewer than two leaves is reported as too-few-leaves by the rebuild,
        // whatever the lone leaf is called.
        let checked = if dendrogram.leaf_count() < 2 {
            Ok(())
        } else {
            dendrogram.check_leaves()
        };
        if let Err(reason) = checked {
            warn!("rejecting dendrogram: {reason}");
            self.surface.fail(Unavailable::FetchFailed);
            return Err(FetchError::Invalid(reason));
        }
        let index = DendrogramIndex::build(&dendrogram);
        info!(
            "dendrogram loaded: {} leaves, {} nodes",
            dendrogram.leaf_count(),
            index.len()
        );
        *self.surface.tree.borrow_mut() = Some(UnfilteredTree {
            root: dendrogram,
            index,
        });
        self.surface.rebuild();
        Ok(())
    }

    /// Issue a new request, cancelling whatever was in flight.
    pub fn begin_fetch(&self, key: DendrogramKey) -> FetchTicket {
        let ticket = self.surface.loader.borrow_mut().begin(key);
        self.surface.state.set(TreeState::Loading);
        self.surface.frames.request();
        ticket
    }

    /// Deliver the result of a request. Returns `Ok(false)` when the result
    /// belongs to a superseded request and was dropped.
    pub fn finish_fetch(
        &self,
        generation: u64,
        result: Result<DendrogramNode, FetchError>,
    ) -> Result<bool, FetchError> {
        if !self.surface.loader.borrow_mut().complete(generation) {
            return Ok(false);
        }
        match result {
            Ok(dendrogram) => self.set_dendrogram(dendrogram).map(|()| true),
            Err(err) => {
                warn!("dendrogram fetch #{generation} failed: {err}");
                self.surface.fail(Unavailable::FetchFailed);
                Err(err)
            }
        }
    }

    /// Fetch synchronously from `source`.
    pub fn load_with(&self, source: &dyn DendrogramSource, key: DendrogramKey) -> Result<(), FetchError> {
        let ticket = self.begin_fetch(key);
        let result = source.fetch(&ticket.key, &ticket.cancel);
        self.finish_fetch(ticket.generation, result).map(|_| ())
    }

    pub fn cancel_fetch(&self) {
        self.surface.loader.borrow_mut().cancel();
    }

    pub fn is_loading(&self) -> bool {
        self.surface.loader.borrow().is_loading()
    }

    // Surface geometry

    /// New CSS size of the body surface. A width change re-fits the tree.
    pub fn resize(&self, css_size: Vec2) {
        let (width_changed, height_changed) = {
            let mut viewport = self.surface.viewport.borrow_mut();
            let before = viewport.viewport_size;
            viewport.set_viewport_size(css_size);
            let after = viewport.viewport_size;
            (
                (before.x - after.x).abs() > f32::EPSILON,
                (before.y - after.y).abs() > f32::EPSILON,
            )
        };
        if width_changed {
            self.surface.rebuild();
        } else if height_changed {
            self.surface.frames.request();
        }
    }

    pub fn set_device_pixel_ratio(&self, ratio: f32) {
        if self.surface.viewport.borrow_mut().set_device_pixel_ratio(ratio) {
            debug!("device pixel ratio is now {ratio}");
            self.surface.frames.request();
        }
    }

    pub fn content_height(&self) -> f32 {
        self.surface
            .assembly
            .borrow()
            .as_ref()
            .map_or(0.0, |assembly| assembly.content_height())
    }

    // Input and frames

    pub fn handle_pointer(&self, event: PointerEvent) {
        self.handle_pointer_at(event, Instant::now());
    }

    pub fn handle_pointer_at(&self, event: PointerEvent, now: Instant) {
        let assembly = self.assembly();
        let effects = {
            let mut viewport = self.surface.viewport.borrow_mut();
            self.surface
                .controller
                .borrow_mut()
                .handle(event, &mut viewport, assembly.as_deref())
        };
        self.surface.apply(effects, now);
    }

    pub fn cursor(&self) -> CursorStyle {
        self.surface.controller.borrow().cursor()
    }

    /// Run due debounced work and report whether a redraw is owed. A fired
    /// frame reopens the wheel gate.
    pub fn tick(&self, now: Instant) -> bool {
        self.surface.sync.poll(now);
        self.surface.flush_preferences(now);
        if self.surface.frames.take() {
            self.surface.controller.borrow_mut().on_frame();
            true
        } else {
            false
        }
    }

    /// Whether [`TreeEngine::tick`] still has something to do.
    pub fn has_pending_work(&self) -> bool {
        self.surface.frames.is_pending()
            || self.surface.sync.has_pending()
            || self.surface.prefs_out.borrow().is_pending()
    }

    pub fn request_redraw(&self) {
        self.surface.frames.request();
    }

    pub fn render(&self) -> Result<RenderedFrame, ExportError> {
        let surface = &self.surface;
        let viewport = surface.viewport.borrow();
        let painter = surface.painter.borrow();
        let dpr = viewport.device_pixel_ratio;
        let mut body = new_surface(viewport.viewport_size, dpr)?;
        let mut header = new_surface(vec2(viewport.viewport_size.x, surface.config.header_height), dpr)?;
        let assembly = surface.assembly.borrow().clone();

        match (surface.state.get(), assembly) {
            (TreeState::Ready, Some(assembly)) => {
                let highlighted = surface.highlighted.borrow();
                let stratification = surface.stratification.borrow();
                surface.renderer.draw_body(
                    &mut body,
                    &BodyScene {
                        assembly: &assembly,
                        viewport: &viewport,
                        painter: &painter,
                        highlighted: &highlighted,
                        stratification: &stratification,
                        show_distances: surface.show_distances.get(),
                    },
                );
                let padding = assembly.tokens.padding;
                match compute_tick_scale(
                    assembly.canvas_width - 2.0 * padding,
                    assembly.max_distance,
                    surface.config.min_scale_unit,
                    viewport.zoom_level,
                ) {
                    Ok(ticks) => surface.renderer.draw_header(
                        &mut header,
                        &HeaderScene {
                            ticks: &ticks,
                            viewport: &viewport,
                            painter: &painter,
                            padding,
                            max_distance: assembly.max_distance,
                        },
                    ),
                    Err(reason) => {
                        debug!("no ruler: {}", reason.reason_code());
                        surface.renderer.draw_blank_header(&mut header, &painter, dpr);
                    }
                }
            }
            (TreeState::Unavailable(reason), _) => {
                surface
                    .renderer
                    .draw_unavailable(&mut body, &painter, reason.reason_code(), dpr);
                surface.renderer.draw_blank_header(&mut header, &painter, dpr);
            }
            _ => {
                surface.renderer.draw_message(&mut body, &painter, "Loading tree", dpr);
                surface.renderer.draw_blank_header(&mut header, &painter, dpr);
            }
        }
        Ok(RenderedFrame { header, body })
    }

    // Link

    pub fn is_linked(&self) -> bool {
        self.surface.sync.is_linked()
    }

    pub fn unlink(&self) {
        if self.surface.sync.unlink() {
            info!("view link broken");
        }
    }

    /// Clear the list sort, return to zoom 1 keeping the first visible row
    /// at the top, and publish the resulting position to the list.
    pub fn link(&self) {
        let surface = &self.surface;
        let row_height = surface.config.tokens.row_height;
        let row = surface.viewport.borrow().first_visible_row(row_height);
        surface.sync.relink();
        let position = {
            let mut viewport = surface.viewport.borrow_mut();
            let horizontal = viewport.horizontal_scroll_px;
            let dpr = viewport.device_pixel_ratio;
            viewport.zoom_level = FIT_ZOOM;
            viewport.scroll_to(horizontal, row as f32 * row_height * dpr);
            viewport.vertical_scroll_css()
        };
        surface.sync.publish_now(position);
        surface.record_view(Instant::now());
        surface.frames.request();
        info!("view linked at row {row}");
    }

    // Subtree filter

    pub fn filter_state(&self) -> FilterState {
        self.surface.filter.borrow().state().clone()
    }

    pub fn step_in(&self, node_id: &str) -> Result<FilterState, FilterError> {
        let state = {
            let tree = self.surface.tree.borrow();
            let tree = tree.as_ref().ok_or(FilterError::NoTree)?;
            self.surface.filter.borrow_mut().step_in(&tree.index, node_id)?.clone()
        };
        info!("stepped into {node_id}");
        self.surface.after_filter_change();
        Ok(state)
    }

    pub fn step_out(&self) -> Result<FilterState, FilterError> {
        let state = {
            let tree = self.surface.tree.borrow();
            let tree = tree.as_ref().ok_or(FilterError::NoTree)?;
            self.surface.filter.borrow_mut().step_out(&tree.index)?.clone()
        };
        info!("stepped out to {state:?}");
        self.surface.after_filter_change();
        Ok(state)
    }

    pub fn clear_filter(&self) -> Result<FilterState, FilterError> {
        let state = self.surface.filter.borrow_mut().clear()?.clone();
        info!("subtree filter cleared");
        self.surface.after_filter_change();
        Ok(state)
    }

    /// Leaves of the filtered subtree, or `None` when the whole tree shows.
    pub fn active_leaf_names(&self) -> Option<Vec<String>> {
        let tree = self.surface.tree.borrow();
        let tree = tree.as_ref()?;
        self.surface.filter.borrow().active_leaf_names(&tree.index)
    }

    /// Newick text of the dendrogram currently on screen.
    pub fn active_newick(&self) -> Option<String> {
        let tree = self.surface.tree.borrow();
        let tree = tree.as_ref()?;
        match self.surface.filter.borrow().state().root_id() {
            Some(id) => tree.index.resolve(&tree.root, id).map(DendrogramNode::to_newick),
            None => Some(tree.root.to_newick()),
        }
    }

    // Appearance

    pub fn highlighted_leaves(&self) -> HashSet<String> {
        self.surface.highlighted.borrow().clone()
    }

    pub fn set_stratification(&self, groups: HashMap<String, Color32>) {
        *self.surface.stratification.borrow_mut() = groups;
        self.surface.frames.request();
    }

    pub fn show_distances(&self) -> bool {
        self.surface.show_distances.get()
    }

    pub fn set_show_distances(&self, show: bool) {
        if self.surface.show_distances.replace(show) != show {
            self.surface.frames.request();
        }
    }

    pub fn painter(&self) -> TreePainter {
        self.surface.painter.borrow().clone()
    }

    pub fn set_painter(&self, painter: TreePainter) {
        *self.surface.painter.borrow_mut() = painter;
        self.surface.frames.request();
    }

    // Download

    /// Encode the current view (PNG/JPEG) or the on-screen dendrogram (Newick).
    pub fn download(&self, format: DownloadFormat) -> Result<Vec<u8>, ExportError> {
        if let TreeState::Unavailable(reason) = self.state() {
            return Err(ExportError::Unavailable(reason));
        }
        let bytes = match format {
            DownloadFormat::Newick => self
                .active_newick()
                .map(String::into_bytes)
                .ok_or(ExportError::Unavailable(Unavailable::FetchFailed))?,
            DownloadFormat::Png | DownloadFormat::Jpeg => {
                if self.state() != TreeState::Ready {
                    return Err(ExportError::Unavailable(Unavailable::FetchFailed));
                }
                let frame = self.render()?;
                encode_frame(&frame.header, &frame.body, format)?
            }
        };
        info!("prepared {} download ({} bytes)", format.extension(), bytes.len());
        Ok(bytes)
    }
}

impl Drop for TreeEngine {
    fn drop(&mut self) {
        self.surface.sync.cancel();
        self.surface.prefs_out.borrow_mut().cancel();
        self.surface.loader.borrow_mut().cancel();
        self.surface.frames.cancel();
        self.subscriptions.clear();
        debug!("tree engine torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ListLink;
    use crate::tree::prefs::MemoryPreferenceStore;
    use crate::tree::sample_tree;
    use eframe::egui::{pos2, Modifiers};

    fn engine_with(channels: LinkChannels, highlighter: Highlighter) -> TreeEngine {
        let engine = TreeEngine::with_renderer(
            EngineConfig::default(),
            channels,
            highlighter,
            SkiaTreeRenderer::without_text(),
        );
        engine.resize(vec2(400.0, 60.0));
        engine
    }

    fn engine() -> TreeEngine {
        let engine = engine_with(LinkChannels::new(), Highlighter::new());
        engine.set_dendrogram(sample_tree()).unwrap();
        engine
    }

    fn zoom_in(engine: &TreeEngine, now: Instant) {
        engine.handle_pointer_at(
            PointerEvent::Wheel {
                pos: pos2(100.0, 30.0),
                delta: vec2(0.0, -100.0),
                modifiers: Modifiers::NONE,
            },
            now,
        );
    }

    #[derive(Default)]
    struct Recorder {
        details: RefCell<Vec<String>>,
        menus: RefCell<Vec<ContextMenuRequest>>,
    }

    impl TreeActions for Recorder {
        fn show_leaf_details(&self, leaf: &str) {
            self.details.borrow_mut().push(leaf.to_string());
        }

        fn show_context_menu(&self, request: &ContextMenuRequest) {
            self.menus.borrow_mut().push(request.clone());
        }
    }

    #[test]
    fn fits_the_worked_example() {
        let engine = engine();
        assert_eq!(engine.state(), TreeState::Ready);
        let assembly = engine.assembly().unwrap();
        assert_eq!(assembly.root().unwrap().pixel_x, 20.0);
        assert_eq!(assembly.node_by_id("A").unwrap().pixel_x, 260.0);
        assert_eq!(engine.viewport().content_size, vec2(400.0, 96.0));
    }

    #[test]
    fn missing_width_and_bad_trees_are_unavailable() {
        let engine = engine_with(LinkChannels::new(), Highlighter::new());
        engine.resize(vec2(0.0, 60.0));
        engine.set_dendrogram(sample_tree()).unwrap();
        assert_eq!(engine.state(), TreeState::Unavailable(Unavailable::ZeroWidthViewport));

        engine.resize(vec2(400.0, 60.0));
        assert_eq!(engine.state(), TreeState::Ready);

        let flat = DendrogramNode::internal(
            Decimal::ZERO,
            vec![
                DendrogramNode::leaf("A", Decimal::ZERO),
                DendrogramNode::leaf("B", Decimal::ZERO),
            ],
        );
        engine.set_dendrogram(flat).unwrap();
        assert_eq!(engine.state(), TreeState::Unavailable(Unavailable::ZeroDistanceRange));

        let single = DendrogramNode::internal(Decimal::ZERO, vec![DendrogramNode::leaf("A", Decimal::ONE)]);
        engine.set_dendrogram(single).unwrap();
        assert_eq!(engine.state(), TreeState::Unavailable(Unavailable::TooFewLeaves));
        assert!(engine.download(DownloadFormat::Png).is_err());
    }

    #[test]
    fn zoom_breaks_the_link_and_relink_resets_it() {
        let channels = LinkChannels::new();
        let list = ListLink::new(channels.clone());
        let engine = engine_with(channels, Highlighter::new());
        engine.set_dendrogram(sample_tree()).unwrap();
        assert!(engine.is_linked());

        let start = Instant::now();
        zoom_in(&engine, start);
        assert!(engine.viewport().zoom_level > 1.0);
        assert!(!engine.is_linked());
        engine.tick(start + Duration::from_millis(100));
        assert_eq!(list.take_incoming(), None);

        list.set_sort(Some("onset".into()));
        engine.link();
        assert!(engine.is_linked());
        assert_eq!(list.sort(), None);
        assert_eq!(engine.viewport().zoom_level, 1.0);
        assert!(list.take_incoming().is_some());
    }

    #[test]
    fn list_sort_unlinks_and_list_scroll_moves_tree_when_linked() {
        let channels = LinkChannels::new();
        let list = ListLink::new(channels.clone());
        let engine = engine_with(channels, Highlighter::new());
        engine.set_dendrogram(sample_tree()).unwrap();
        engine.set_device_pixel_ratio(2.0);

        list.publish_scroll(12.0);
        assert_eq!(engine.viewport().vertical_scroll_px, 24.0);

        list.set_sort(Some("age".into()));
        assert!(!engine.is_linked());
        list.publish_scroll(0.0);
        assert_eq!(engine.viewport().vertical_scroll_px, 24.0);
    }

    #[test]
    fn tree_scroll_reaches_list_after_debounce() {
        let channels = LinkChannels::new();
        let list = ListLink::new(channels.clone());
        let engine = engine_with(channels, Highlighter::new());
        engine.set_dendrogram(sample_tree()).unwrap();

        let start = Instant::now();
        engine.handle_pointer_at(
            PointerEvent::Wheel {
                pos: pos2(10.0, 10.0),
                delta: vec2(0.0, 20.0),
                modifiers: Modifiers::CTRL,
            },
            start,
        );
        engine.tick(start + Duration::from_millis(10));
        assert_eq!(list.take_incoming(), None);
        engine.tick(start + Duration::from_millis(60));
        assert_eq!(list.take_incoming(), Some(20.0));
    }

    #[test]
    fn step_in_narrows_and_step_out_restores() {
        let engine = engine();
        engine.handle_pointer(PointerEvent::Wheel {
            pos: pos2(10.0, 10.0),
            delta: vec2(0.0, 20.0),
            modifiers: Modifiers::CTRL,
        });
        assert!(engine.viewport().vertical_scroll_px > 0.0);

        let state = engine.step_in("node:root/0").unwrap();
        assert_eq!(state, FilterState::Filtered { root_id: "node:root/0".into() });
        assert_eq!(engine.active_leaf_names(), Some(vec!["A".to_string(), "B".to_string()]));
        assert_eq!(engine.viewport().vertical_scroll_px, 0.0);
        let assembly = engine.assembly().unwrap();
        assert_eq!(assembly.leaf_count, 2);
        assert_eq!(assembly.root().unwrap().id, "node:root/0");
        assert_eq!(engine.active_newick().as_deref(), Some("(A:1,B:2):1;"));

        assert_eq!(engine.step_out().unwrap(), FilterState::Unfiltered);
        assert_eq!(engine.active_leaf_names(), None);
        assert_eq!(engine.assembly().unwrap().leaf_count, 4);
        assert_eq!(engine.step_in("A"), Err(FilterError::NotASubtree("A".into())));
    }

    #[test]
    fn reload_without_filter_root_is_a_mismatch_until_cleared() {
        let engine = engine();
        engine.step_in("node:root/1").unwrap();
        let smaller = DendrogramNode::internal(
            Decimal::ZERO,
            vec![
                DendrogramNode::leaf("A", Decimal::ONE),
                DendrogramNode::leaf("B", Decimal::ONE),
            ],
        );
        engine.set_dendrogram(smaller).unwrap();
        assert_eq!(engine.state(), TreeState::Unavailable(Unavailable::FilterMismatch));
        engine.clear_filter().unwrap();
        assert_eq!(engine.state(), TreeState::Ready);
    }

    #[test]
    fn stale_fetch_results_are_dropped_and_failures_surface() {
        let engine = engine_with(LinkChannels::new(), Highlighter::new());
        let first = engine.begin_fetch(DendrogramKey::default());
        let second = engine.begin_fetch(DendrogramKey {
            algorithm_id: "nj".into(),
            ..DendrogramKey::default()
        });

        assert_eq!(engine.finish_fetch(first.generation, Ok(sample_tree())), Ok(false));
        assert_eq!(engine.state(), TreeState::Loading);

        let err = FetchError::Source("timeout".into());
        assert_eq!(engine.finish_fetch(second.generation, Err(err.clone())), Err(err));
        assert_eq!(engine.state(), TreeState::Unavailable(Unavailable::FetchFailed));
        assert!(engine.assembly().is_none());
    }

    #[test]
    fn map_highlight_reaches_tree_and_hover_reaches_map() {
        let highlighter = Highlighter::new();
        let engine = engine_with(LinkChannels::new(), highlighter.clone());
        engine.set_dendrogram(sample_tree()).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let _map = highlighter.subscribe(Origin::MAP, move |h| sink.borrow_mut().push(h.case_ids.clone()));

        engine.tick(Instant::now());
        highlighter.publish(vec!["A".into(), "C".into()], Origin::MAP);
        assert_eq!(engine.highlighted_leaves(), ["A".to_string(), "C".to_string()].into());
        assert!(seen.borrow().is_empty());
        assert!(engine.tick(Instant::now()));

        engine.handle_pointer(PointerEvent::Move { pos: pos2(200.0, 14.0) });
        assert_eq!(seen.borrow().last(), Some(&vec!["A".to_string()]));
        engine.handle_pointer(PointerEvent::Leave);
        assert_eq!(seen.borrow().last(), Some(&Vec::new()));
    }

    #[test]
    fn clicks_reach_the_host_actions() {
        let engine = engine();
        let recorder = Rc::new(Recorder::default());
        engine.set_actions(recorder.clone());

        let leaf = pos2(300.0, 84.0);
        engine.resize(vec2(400.0, 96.0));
        engine.handle_pointer(PointerEvent::Press { pos: leaf });
        engine.handle_pointer(PointerEvent::Release { pos: leaf });
        assert_eq!(*recorder.details.borrow(), vec!["D".to_string()]);
        assert_eq!(recorder.menus.borrow()[0].leaf_names, vec!["D".to_string()]);
    }

    #[test]
    fn wheel_gate_reopens_on_the_next_frame() {
        let engine = engine();
        let now = Instant::now();
        zoom_in(&engine, now);
        let zoom = engine.viewport().zoom_level;
        zoom_in(&engine, now);
        assert_eq!(engine.viewport().zoom_level, zoom);
        assert!(engine.tick(now));
        zoom_in(&engine, now);
        assert!(engine.viewport().zoom_level > zoom);
    }

    #[test]
    fn preferences_are_debounced_and_restored() {
        let store = MemoryPreferenceStore::new();
        let engine = engine();
        engine.set_preference_store(Box::new(store.clone()));

        let start = Instant::now();
        zoom_in(&engine, start);
        engine.tick(start + Duration::from_millis(100));
        assert_eq!(store.writes(), 0);
        engine.tick(start + Duration::from_millis(600));
        assert_eq!(store.writes(), 1);
        let zoom = engine.viewport().zoom_level;

        let restored = engine_with(LinkChannels::new(), Highlighter::new());
        restored.set_preference_store(Box::new(store.clone()));
        restored.set_dendrogram(sample_tree()).unwrap();
        assert_eq!(restored.viewport().zoom_level, zoom);
        assert!(!restored.is_linked());
    }

    #[test]
    fn relinking_and_filtering_store_the_fitted_view() {
        let store = MemoryPreferenceStore::new();
        let engine = engine();
        engine.set_preference_store(Box::new(store.clone()));
        let stored_zoom = || store.load().unwrap().map(|prefs| prefs.zoom_level);

        let start = Instant::now();
        zoom_in(&engine, start);
        engine.tick(start + Duration::from_secs(1));
        assert!(stored_zoom().unwrap() > 1.0);

        engine.link();
        engine.tick(start + Duration::from_secs(3));
        assert_eq!(stored_zoom(), Some(1.0));

        zoom_in(&engine, start + Duration::from_secs(4));
        engine.tick(start + Duration::from_secs(5));
        assert!(stored_zoom().unwrap() > 1.0);

        engine.step_in("node:root/0").unwrap();
        engine.tick(start + Duration::from_secs(7));
        assert_eq!(stored_zoom(), Some(1.0));
    }

    #[test]
    fn empty_dendrogram_has_too_few_leaves() {
        let engine = engine();
        engine
            .set_dendrogram(DendrogramNode::internal(Decimal::ZERO, vec![]))
            .unwrap();
        assert_eq!(engine.state(), TreeState::Unavailable(Unavailable::TooFewLeaves));

        let lone = DendrogramNode::internal(Decimal::ZERO, vec![DendrogramNode::leaf("", Decimal::ONE)]);
        engine.set_dendrogram(lone).unwrap();
        assert_eq!(engine.state(), TreeState::Unavailable(Unavailable::TooFewLeaves));
    }

    #[test]
    fn render_produces_physical_surfaces() {
        let engine = engine();
        engine.set_device_pixel_ratio(2.0);
        let frame = engine.render().unwrap();
        assert_eq!((frame.body.width(), frame.body.height()), (800, 120));
        assert_eq!((frame.header.width(), frame.header.height()), (800, 64));
        let newick = engine.download(DownloadFormat::Newick).unwrap();
        assert_eq!(String::from_utf8(newick).unwrap(), sample_tree().to_newick());
    }

    #[test]
    fn drop_cancels_pending_work_and_unsubscribes() {
        let channels = LinkChannels::new();
        let store = MemoryPreferenceStore::new();
        let engine = engine_with(channels.clone(), Highlighter::new());
        engine.set_dendrogram(sample_tree()).unwrap();
        engine.set_preference_store(Box::new(store.clone()));
        engine.handle_pointer(PointerEvent::Wheel {
            pos: pos2(10.0, 10.0),
            delta: vec2(0.0, 20.0),
            modifiers: Modifiers::CTRL,
        });
        assert!(engine.has_pending_work());
        assert_eq!(channels.scroll.subscriber_count(), 1);

        drop(engine);
        assert_eq!(channels.scroll.subscriber_count(), 0);
        assert_eq!(channels.sort.subscriber_count(), 0);
        assert_eq!(store.writes(), 0);
    }
}
