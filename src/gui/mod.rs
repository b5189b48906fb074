pub mod line_list;

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eframe::egui::{self, pos2, vec2, Color32, Pos2, Rect, Sense, TextureHandle, TextureOptions};
use log::{info, warn};
use rfd::FileDialog;
use tiny_skia::Pixmap;

use self::line_list::{
    load_event_table, CellState, EventLookup, LineList, ThreadedEventLookup, SORT_BY_CASE_ID,
};
use crate::app::AppConfig;
use crate::error::Unavailable;
use crate::export::DownloadFormat;
use crate::io::fetch::FileSource;
use crate::io::JsonPreferenceStore;
use crate::link::{Highlighter, LinkChannels, ListLink, Origin, Subscription};
use crate::tree::interaction::{CursorStyle, PointerEvent};
use crate::tree::skia_renderer::to_color_image;
use crate::tree::viewer::{ContextMenuRequest, TreeActions, TreeEngine, TreeState};

/// CSS pixels per wheel "line" step.
const WHEEL_LINE_HEIGHT: f32 = 40.0;
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

const EVENT_PALETTE: [Color32; 8] = [
    Color32::from_rgb(0xd6, 0x27, 0x28),
    Color32::from_rgb(0x1f, 0x77, 0xb4),
    Color32::from_rgb(0x2c, 0xa0, 0x2c),
    Color32::from_rgb(0xff, 0x7f, 0x0e),
    Color32::from_rgb(0x94, 0x67, 0xbd),
    Color32::from_rgb(0x8c, 0x56, 0x4b),
    Color32::from_rgb(0xe3, 0x77, 0xc2),
    Color32::from_rgb(0x17, 0xbe, 0xcf),
];

fn event_color(event: &str) -> Color32 {
    let mut hasher = DefaultHasher::new();
    event.hash(&mut hasher);
    EVENT_PALETTE[(hasher.finish() % EVENT_PALETTE.len() as u64) as usize]
}

/// Collects clicks the engine reports until the next frame picks them up.
#[derive(Default)]
struct HostActions {
    details: RefCell<Option<String>>,
    menu: RefCell<Option<ContextMenuRequest>>,
}

impl TreeActions for HostActions {
    fn show_leaf_details(&self, leaf: &str) {
        *self.details.borrow_mut() = Some(leaf.to_string());
    }

    fn show_context_menu(&self, request: &ContextMenuRequest) {
        *self.menu.borrow_mut() = Some(request.clone());
    }
}

pub struct CaseTreeGui {
    config: AppConfig,
    engine: TreeEngine,
    highlighter: Highlighter,
    actions: Rc<HostActions>,
    list_link: ListLink,
    list_highlight: Rc<RefCell<HashSet<String>>>,
    _list_highlight_sub: Subscription,
    line_list: LineList,
    lookup: ThreadedEventLookup,
    rows_generation: Option<u64>,
    list_offset: f32,
    list_hover: Option<String>,
    color_by_event: bool,
    header_texture: Option<TextureHandle>,
    body_texture: Option<TextureHandle>,
    body_rect: Option<Rect>,
    pointer_inside: bool,
    pointer_captured: bool,
    menu: Option<ContextMenuRequest>,
    menu_rect: Option<Rect>,
    details: Option<String>,
    status: String,
    last_error: Option<String>,
}

impl CaseTreeGui {
    pub fn new(_cc: &eframe::CreationContext<'_>, config: AppConfig) -> Self {
        let channels = LinkChannels::new();
        let highlighter = Highlighter::new();
        let engine = TreeEngine::new(config.engine_config(), channels.clone(), highlighter.clone());
        engine.set_show_distances(config.show_distances);
        if let Some(prefs) = &config.prefs {
            engine.set_preference_store(Box::new(JsonPreferenceStore::new(prefs)));
        }
        let actions = Rc::new(HostActions::default());
        engine.set_actions(actions.clone());

        let list_highlight = Rc::new(RefCell::new(HashSet::new()));
        let sink = Rc::clone(&list_highlight);
        let list_highlight_sub = highlighter.subscribe(Origin::LIST, move |highlight| {
            *sink.borrow_mut() = highlight.case_ids.iter().cloned().collect();
        });

        let mut last_error = None;
        let table = match &config.events {
            Some(path) => load_event_table(path).unwrap_or_else(|err| {
                warn!("event table not loaded: {err:#}");
                last_error = Some(format!("Events not loaded: {err:#}"));
                HashMap::new()
            }),
            None => HashMap::new(),
        };

        let mut gui = Self {
            list_link: ListLink::new(channels.clone()),
            config,
            engine,
            highlighter,
            actions,
            list_highlight,
            _list_highlight_sub: list_highlight_sub,
            line_list: LineList::new(),
            lookup: ThreadedEventLookup::spawn(Arc::new(table)),
            rows_generation: None,
            list_offset: 0.0,
            list_hover: None,
            color_by_event: false,
            header_texture: None,
            body_texture: None,
            body_rect: None,
            pointer_inside: false,
            pointer_captured: false,
            menu: None,
            menu_rect: None,
            details: None,
            status: "Open a tree file to begin.".to_string(),
            last_error,
        };

        if let Some(path) = gui.config.tree_path.clone() {
            gui.load_tree(&path);
        }
        gui
    }

    fn load_tree(&mut self, path: &Path) {
        let source = FileSource::new(path).with_tree_index(self.config.tree_index);
        match self.engine.load_with(&source, self.config.dendrogram_key()) {
            Ok(()) => {
                self.config.tree_path = Some(path.to_path_buf());
                self.status = format!("Loaded {}", path.display());
                self.last_error = None;
                self.menu = None;
                self.details = None;
            }
            Err(err) => {
                self.status = format!("Failed to load {}", path.display());
                self.last_error = Some(err.to_string());
            }
        }
    }

    fn open_dialog(&mut self) {
        if let Some(path) = FileDialog::new()
            .add_filter("Tree files", &["tre", "tree", "nwk", "newick", "nex", "nexus", "json"])
            .add_filter("All files", &["*"])
            .pick_file()
        {
            self.load_tree(&path);
        }
    }

    fn download_dialog(&mut self, format: DownloadFormat) {
        let stem = self
            .config
            .tree_path
            .as_deref()
            .and_then(Path::file_stem)
            .and_then(|stem| stem.to_str())
            .unwrap_or("tree");
        let Some(path) = FileDialog::new()
            .add_filter(format.filter_name(), format.filter_extensions())
            .set_file_name(format!("{stem}.{}", format.extension()))
            .save_file()
        else {
            return;
        };
        match self.save_download(format, &path) {
            Ok(bytes) => {
                info!("downloaded {bytes} bytes as {format} to {}", path.display());
                self.status = format!("Saved {}", path.display());
                self.last_error = None;
            }
            Err(err) => self.last_error = Some(format!("Download failed: {err:#}")),
        }
    }

    fn save_download(&self, format: DownloadFormat, path: &Path) -> anyhow::Result<usize> {
        let bytes = self.engine.download(format)?;
        std::fs::write(path, &bytes)?;
        Ok(bytes.len())
    }

    fn refresh_rows(&mut self) {
        let assembly = self.engine.assembly();
        let generation = assembly.as_ref().map(|assembly| assembly.generation);
        if generation == self.rows_generation {
            return;
        }
        self.rows_generation = generation;
        let cases = assembly
            .map(|assembly| assembly.leaves().map(|leaf| leaf.id.clone()).collect())
            .unwrap_or_default();
        self.line_list.set_cases(cases);
        self.apply_stratification();
    }

    fn apply_stratification(&self) {
        let groups = if self.color_by_event {
            self.line_list
                .resolved_events()
                .map(|(case_id, event)| (case_id.to_string(), event_color(event)))
                .collect()
        } else {
            HashMap::new()
        };
        self.engine.set_stratification(groups);
    }

    fn toolbar(&mut self, ctx: &egui::Context) {
        egui::TopBottomPanel::top("casetree_toolbar").show(ctx, |ui| {
            egui::MenuBar::new().ui(ui, |ui| {
                ui.menu_button("File", |ui| {
                    if ui.button("Open tree...").clicked() {
                        ui.close();
                        self.open_dialog();
                    }
                    let reload = self.config.tree_path.clone();
                    if ui.add_enabled(reload.is_some(), egui::Button::new("Reload")).clicked() {
                        ui.close();
                        if let Some(path) = reload {
                            self.load_tree(&path);
                        }
                    }
                    ui.separator();
                    ui.menu_button("Download", |ui| {
                        let ready = self.engine.state() == TreeState::Ready;
                        for format in [DownloadFormat::Png, DownloadFormat::Jpeg, DownloadFormat::Newick] {
                            let label = format!("{} (.{})", format.filter_name(), format.extension());
                            if ui.add_enabled(ready, egui::Button::new(label)).clicked() {
                                ui.close();
                                self.download_dialog(format);
                            }
                        }
                    });
                    ui.separator();
                    if ui.button("Quit").clicked() {
                        ctx.send_viewport_cmd(egui::ViewportCommand::Close);
                    }
                });

                ui.separator();
                let linked = self.engine.is_linked();
                let label = if linked { "Linked to list" } else { "Link to list" };
                if ui.selectable_label(linked, label).clicked() {
                    if linked {
                        self.engine.unlink();
                    } else {
                        self.engine.link();
                    }
                }

                ui.separator();
                let filtered = self.engine.filter_state().is_filtered();
                if ui.add_enabled(filtered, egui::Button::new("Step out")).clicked() {
                    if let Err(err) = self.engine.step_out() {
                        self.last_error = Some(err.to_string());
                    }
                }
                let mismatch = self.engine.state() == TreeState::Unavailable(Unavailable::FilterMismatch);
                if ui.add_enabled(filtered || mismatch, egui::Button::new("Show all")).clicked() {
                    if let Err(err) = self.engine.clear_filter() {
                        self.last_error = Some(err.to_string());
                    }
                }

                ui.separator();
                let mut show_distances = self.engine.show_distances();
                if ui.checkbox(&mut show_distances, "Distances").changed() {
                    self.engine.set_show_distances(show_distances);
                }
                if ui.checkbox(&mut self.color_by_event, "Color by event").changed() {
                    self.apply_stratification();
                }
            });
        });
    }

    fn status_bar(&self, ctx: &egui::Context) {
        egui::TopBottomPanel::bottom("casetree_status").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.label(&self.status);
                match self.engine.state() {
                    TreeState::Ready => {
                        if let Some(assembly) = self.engine.assembly() {
                            ui.separator();
                            ui.label(format!("{} cases", assembly.leaf_count));
                        }
                        if let Some(root) = self.engine.filter_state().root_id() {
                            ui.separator();
                            ui.label(format!("Subtree {root}"));
                        }
                        ui.separator();
                        ui.label(format!("Zoom {:.2}x", self.engine.viewport().zoom_level));
                    }
                    TreeState::Loading => {
                        ui.separator();
                        ui.spinner();
                    }
                    TreeState::Unavailable(reason) => {
                        ui.separator();
                        ui.label(format!("Tree unavailable: {}", reason.reason_code()));
                    }
                }
                if let Some(err) = &self.last_error {
                    ui.separator();
                    ui.colored_label(Color32::from_rgb(200, 40, 40), err);
                }
            });
        });
    }

    fn line_list_panel(&mut self, ctx: &egui::Context) {
        let row_height = self.engine.config().tokens.row_height;
        egui::SidePanel::right("casetree_line_list")
            .resizable(true)
            .default_width(280.0)
            .show(ctx, |ui| {
                ui.horizontal(|ui| {
                    ui.heading("Cases");
                    let sorted = self.line_list.sort().is_some();
                    if ui.selectable_label(sorted, "Sort by id").clicked() {
                        let sort = (!sorted).then(|| SORT_BY_CASE_ID.to_string());
                        // The tree reads a published sort as "unlink".
                        self.list_link.set_sort(sort.clone());
                        self.line_list.set_sort(sort);
                    }
                });
                ui.separator();

                ui.spacing_mut().item_spacing.y = 0.0;
                let incoming = self.list_link.take_incoming();
                let mut area = egui::ScrollArea::vertical()
                    .id_salt("casetree_line_list_rows")
                    .auto_shrink([false, false]);
                if let Some(offset) = incoming {
                    area = area.vertical_scroll_offset(offset);
                }

                let highlighted = self.list_highlight.borrow().clone();
                let mut hovered = None;
                let line_list = &mut self.line_list;
                let lookup = &self.lookup;
                let output = area.show_rows(ui, row_height, line_list.len(), |ui, rows| {
                    for index in rows {
                        let Some(case_id) = line_list.row(index).map(str::to_string) else {
                            continue;
                        };
                        let cell = line_list.event_cell(&case_id, lookup);
                        ui.horizontal(|ui| {
                            ui.set_height(row_height);
                            let response = ui.add_sized(
                                [120.0, row_height],
                                egui::Button::selectable(highlighted.contains(&case_id), case_id.as_str()),
                            );
                            if response.hovered() {
                                hovered = Some(case_id.clone());
                            }
                            match cell {
                                CellState::Pending => {
                                    ui.weak("…");
                                }
                                CellState::Resolved(Some(event)) => {
                                    ui.colored_label(event_color(&event), event);
                                }
                                CellState::Resolved(None) => {
                                    ui.weak("none");
                                }
                                CellState::Rejected(reason) => {
                                    ui.colored_label(Color32::from_rgb(200, 40, 40), "error")
                                        .on_hover_text(reason);
                                }
                            }
                        });
                    }
                });

                let offset = output.state.offset.y;
                if incoming.is_some() {
                    self.list_offset = offset;
                } else if (offset - self.list_offset).abs() > 0.5 {
                    self.list_offset = offset;
                    self.list_link.publish_scroll(offset);
                }

                if hovered != self.list_hover {
                    match &hovered {
                        Some(case_id) => self.highlighter.publish(vec![case_id.clone()], Origin::LIST),
                        None => self.highlighter.clear(Origin::LIST),
                    }
                    self.list_hover = hovered;
                }
            });

        if self.line_list.absorb(self.lookup.drain()) {
            if self.color_by_event {
                self.apply_stratification();
            }
            ctx.request_repaint();
        }
    }

    fn tree_panel(&mut self, ctx: &egui::Context) {
        egui::CentralPanel::default()
            .frame(egui::Frame::NONE.fill(ctx.style().visuals.panel_fill))
            .show(ctx, |ui| {
                let full = ui.available_rect_before_wrap();
                ui.allocate_rect(full, Sense::hover());
                let header_height = self.engine.config().header_height.min(full.height());
                let header_rect = Rect::from_min_size(full.min, vec2(full.width(), header_height));
                let body_rect = Rect::from_min_max(pos2(full.min.x, full.min.y + header_height), full.max);

                self.engine.set_device_pixel_ratio(ctx.pixels_per_point());
                self.engine.resize(body_rect.size());
                self.body_rect = Some(body_rect);
                self.forward_input(ctx, body_rect);

                if self.engine.tick(Instant::now()) || self.body_texture.is_none() {
                    self.refresh_textures(ctx);
                }

                let uv = Rect::from_min_max(Pos2::ZERO, pos2(1.0, 1.0));
                let painter = ui.painter_at(full);
                if let Some(texture) = &self.header_texture {
                    painter.image(texture.id(), header_rect, uv, Color32::WHITE);
                }
                if let Some(texture) = &self.body_texture {
                    painter.image(texture.id(), body_rect, uv, Color32::WHITE);
                }

                if self.pointer_inside || self.pointer_captured {
                    match self.engine.cursor() {
                        CursorStyle::Default => {}
                        CursorStyle::PointingHand => ctx.set_cursor_icon(egui::CursorIcon::PointingHand),
                        CursorStyle::Move => ctx.set_cursor_icon(egui::CursorIcon::Grabbing),
                    }
                }
            });
    }

    fn refresh_textures(&mut self, ctx: &egui::Context) {
        match self.engine.render() {
            Ok(frame) => {
                upload(ctx, "casetree_header", &frame.header, &mut self.header_texture);
                upload(ctx, "casetree_body", &frame.body, &mut self.body_texture);
            }
            Err(err) => self.last_error = Some(format!("Render failed: {err}")),
        }
    }

    /// Feed this frame's raw pointer events to the engine in body-local CSS pixels.
    fn forward_input(&mut self, ctx: &egui::Context, body: Rect) {
        let (events, hover) = ctx.input(|input| (input.events.clone(), input.pointer.hover_pos()));
        let local = |pos: Pos2| pos2(pos.x - body.min.x, pos.y - body.min.y);
        let menu_rect = self.menu_rect;
        let over_menu = |pos: Pos2| menu_rect.is_some_and(|rect| rect.contains(pos));

        for event in events {
            match event {
                egui::Event::PointerMoved(pos) => {
                    let inside = body.contains(pos) && !over_menu(pos);
                    if inside || self.pointer_captured {
                        self.engine.handle_pointer(PointerEvent::Move { pos: local(pos) });
                    } else if self.pointer_inside {
                        self.engine.handle_pointer(PointerEvent::Leave);
                    }
                    self.pointer_inside = inside;
                }
                egui::Event::PointerButton {
                    pos,
                    button: egui::PointerButton::Primary,
                    pressed,
                    ..
                } => {
                    if pressed && body.contains(pos) && !over_menu(pos) {
                        self.menu = None;
                        self.menu_rect = None;
                        self.pointer_captured = true;
                        self.engine.handle_pointer(PointerEvent::Press { pos: local(pos) });
                    } else if !pressed && self.pointer_captured {
                        self.pointer_captured = false;
                        self.engine.handle_pointer(PointerEvent::Release { pos: local(pos) });
                    }
                }
                egui::Event::PointerButton {
                    pos,
                    button: egui::PointerButton::Secondary,
                    pressed: false,
                    ..
                } if body.contains(pos) && !self.pointer_captured => {
                    // A right click acts as a click in place.
                    self.engine.handle_pointer(PointerEvent::Press { pos: local(pos) });
                    self.engine.handle_pointer(PointerEvent::Release { pos: local(pos) });
                }
                egui::Event::PointerGone => {
                    if self.pointer_inside && !self.pointer_captured {
                        self.engine.handle_pointer(PointerEvent::Leave);
                    }
                    self.pointer_inside = false;
                }
                egui::Event::MouseWheel {
                    unit,
                    delta,
                    modifiers,
                    ..
                } => {
                    let Some(pos) = hover.filter(|pos| body.contains(*pos) && !over_menu(*pos)) else {
                        continue;
                    };
                    let scale = match unit {
                        egui::MouseWheelUnit::Point => 1.0,
                        egui::MouseWheelUnit::Line => WHEEL_LINE_HEIGHT,
                        egui::MouseWheelUnit::Page => body.height(),
                    };
                    self.engine.handle_pointer(PointerEvent::Wheel {
                        pos: local(pos),
                        delta: -delta * scale,
                        modifiers,
                    });
                }
                _ => {}
            }
        }
    }

    fn collect_actions(&mut self) {
        if let Some(leaf) = self.actions.details.borrow_mut().take() {
            self.details = Some(leaf);
        }
        if let Some(request) = self.actions.menu.borrow_mut().take() {
            self.menu = Some(request);
            self.menu_rect = None;
        }
    }

    fn context_menu(&mut self, ctx: &egui::Context) {
        let (Some(request), Some(body)) = (self.menu.clone(), self.body_rect) else {
            return;
        };
        if ctx.input(|input| input.key_pressed(egui::Key::Escape)) {
            self.menu = None;
            self.menu_rect = None;
            return;
        }

        let mut close = false;
        let area = egui::Area::new(egui::Id::new("casetree_context_menu"))
            .fixed_pos(body.min + request.anchor.to_vec2())
            .order(egui::Order::Foreground)
            .show(ctx, |ui| {
                egui::Frame::popup(ui.style()).show(ui, |ui| {
                    ui.set_min_width(180.0);
                    let count = request.leaf_names.len();
                    match request.leaf_names.as_slice() {
                        [single] => ui.strong(single),
                        _ => ui.strong(format!("{count} cases")),
                    };
                    ui.separator();
                    if let [single] = request.leaf_names.as_slice() {
                        if ui.button("Show details").clicked() {
                            self.details = Some(single.clone());
                            close = true;
                        }
                    }
                    if ui.button("Highlight cases").clicked() {
                        self.highlighter
                            .publish(request.leaf_names.clone(), Origin::new("context menu"));
                        close = true;
                    }
                    if let Some(node_id) = &request.subtree_offer {
                        if ui.button("Show only this subtree").clicked() {
                            if let Err(err) = self.engine.step_in(node_id) {
                                self.last_error = Some(err.to_string());
                            }
                            close = true;
                        }
                    }
                    if ui.button("Copy case ids").clicked() {
                        ui.ctx().copy_text(request.leaf_names.join("\n"));
                        close = true;
                    }
                });
            });
        self.menu_rect = Some(area.response.rect);
        if close {
            self.menu = None;
            self.menu_rect = None;
        }
    }

    fn details_window(&mut self, ctx: &egui::Context) {
        let Some(case_id) = self.details.clone() else {
            return;
        };
        let mut open = true;
        let event = self.line_list.event_cell(&case_id, &self.lookup);
        let row = self
            .engine
            .assembly()
            .and_then(|assembly| assembly.node_by_id(&case_id).map(|leaf| (leaf.row_index, leaf.branch_length)));
        egui::Window::new("Case details")
            .id(egui::Id::new("casetree_case_details"))
            .open(&mut open)
            .collapsible(false)
            .resizable(false)
            .show(ctx, |ui| {
                egui::Grid::new("casetree_case_details_grid").num_columns(2).show(ui, |ui| {
                    ui.label("Case");
                    ui.strong(&case_id);
                    ui.end_row();
                    if let Some((row, branch_length)) = row {
                        if let Some(row) = row {
                            ui.label("Row");
                            ui.label((row + 1).to_string());
                            ui.end_row();
                        }
                        ui.label("Branch length");
                        ui.label(branch_length.normalize().to_string());
                        ui.end_row();
                    }
                    ui.label("Event");
                    match event {
                        CellState::Pending => ui.spinner(),
                        CellState::Resolved(Some(event)) => ui.label(event),
                        CellState::Resolved(None) => ui.weak("none"),
                        CellState::Rejected(reason) => ui.label(reason),
                    };
                    ui.end_row();
                });
            });
        if !open {
            self.details = None;
        }
    }
}

fn upload(ctx: &egui::Context, name: &str, pixmap: &Pixmap, slot: &mut Option<TextureHandle>) {
    let image = to_color_image(pixmap);
    match slot {
        Some(texture) => texture.set(image, TextureOptions::LINEAR),
        None => *slot = Some(ctx.load_texture(name, image, TextureOptions::LINEAR)),
    }
}

impl eframe::App for CaseTreeGui {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.refresh_rows();
        self.toolbar(ctx);
        self.status_bar(ctx);
        self.line_list_panel(ctx);
        self.tree_panel(ctx);
        self.collect_actions();
        self.context_menu(ctx);
        self.details_window(ctx);

        if self.engine.has_pending_work() || self.line_list.has_pending() {
            ctx.request_repaint_after(FRAME_INTERVAL);
        }
    }
}
