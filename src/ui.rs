use glam::Vec3;
use winit::event::WindowEvent;
use winit::event_loop::EventLoop;
use winit::window::Window;

use crate::render::GuiPrimitives;
use crate::settings::{
    MaterialSettings, INTENSITY_RANGE, INTENSITY_STEP, ROTATION_RANGE, ROTATION_STEP,
    SCALAR_RANGE, SCALAR_STEP,
};

/// What the loading overlay shows this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadStatus {
    Loading { fraction: f32, almost_done: bool },
    /// Load failed; the indicator stays on screen at its last fraction,
    /// indistinguishable from a load that never finishes.
    Failed { fraction: f32, almost_done: bool },
    Ready,
}

/// Edits made through the panel this frame. The caller owns the follow-up
/// scene mutations.
#[derive(Debug, Default, Clone, Copy)]
pub struct UiActions {
    pub materials_changed: bool,
    pub shadows_toggled: bool,
    pub env_light_toggled: bool,
    pub env_intensity_changed: bool,
    pub screenshot_requested: bool,
}

/// One frame of panel output: tessellated geometry plus the edits.
pub struct UiFrame {
    pub gui: GuiPrimitives,
    pub actions: UiActions,
}

/// The debug control panel, an egui layer over the scene.
pub struct ControlPanel {
    ctx: egui::Context,
    state: egui_winit::State,
}

impl ControlPanel {
    pub fn new(event_loop: &EventLoop<()>) -> Self {
        let ctx = egui::Context::default();
        let state = egui_winit::State::new(
            ctx.clone(),
            egui::ViewportId::ROOT,
            event_loop,
            None,
            None,
        );
        Self { ctx, state }
    }

    /// Forwards a window event to egui. The returned response tells the
    /// caller whether the panel consumed it.
    pub fn on_window_event(
        &mut self,
        window: &Window,
        event: &WindowEvent,
    ) -> egui_winit::EventResponse {
        self.state.on_window_event(window, event)
    }

    /// Runs the panel for one frame and returns the tessellated output.
    pub fn run(
        &mut self,
        window: &Window,
        settings: &mut MaterialSettings,
        helper_visible: &mut bool,
        status: LoadStatus,
        fps: f32,
    ) -> UiFrame {
        let mut actions = UiActions::default();
        let raw_input = self.state.take_egui_input(window);

        let output = self.ctx.run(raw_input, |ctx| {
            draw_panel(ctx, settings, helper_visible, &mut actions, fps);
            draw_loading_overlay(ctx, status);
        });

        self.state
            .handle_platform_output(window, output.platform_output);
        let primitives = self
            .ctx
            .tessellate(output.shapes, output.pixels_per_point);

        UiFrame {
            gui: GuiPrimitives {
                textures_delta: output.textures_delta,
                primitives,
                pixels_per_point: output.pixels_per_point,
            },
            actions,
        }
    }
}

fn draw_panel(
    ctx: &egui::Context,
    settings: &mut MaterialSettings,
    helper_visible: &mut bool,
    actions: &mut UiActions,
    fps: f32,
) {
    egui::Window::new("Car configurator")
        .anchor(egui::Align2::RIGHT_TOP, [-10.0, 10.0])
        .default_width(260.0)
        .resizable(false)
        .show(ctx, |ui| {
            egui::CollapsingHeader::new("Modify car materials")
                .default_open(true)
                .show(ui, |ui| {
                    actions.materials_changed |=
                        color_picker(ui, "Paint color", &mut settings.paint_color);
                    actions.materials_changed |=
                        color_picker(ui, "Caliper color", &mut settings.caliper_color);
                    actions.materials_changed |= scalar_slider(
                        ui,
                        "Metalness",
                        &mut settings.metalness,
                    );
                    actions.materials_changed |= scalar_slider(
                        ui,
                        "Roughness",
                        &mut settings.roughness,
                    );
                    actions.materials_changed |= scalar_slider(
                        ui,
                        "Clear coat",
                        &mut settings.clear_coat,
                    );
                    actions.materials_changed |= scalar_slider(
                        ui,
                        "Clear coat roughness",
                        &mut settings.clear_coat_roughness,
                    );
                });

            egui::CollapsingHeader::new("Change lighting")
                .default_open(true)
                .show(ui, |ui| {
                    if ui
                        .checkbox(&mut settings.shadows_enabled, "Shadows")
                        .changed()
                    {
                        actions.shadows_toggled = true;
                    }
                    if ui
                        .checkbox(&mut settings.env_light_enabled, "Environment light")
                        .changed()
                    {
                        actions.env_light_toggled = true;
                    }
                    if ui
                        .add(
                            egui::Slider::new(&mut settings.env_intensity, INTENSITY_RANGE)
                                .step_by(INTENSITY_STEP)
                                .text("Intensity"),
                        )
                        .changed()
                    {
                        actions.env_intensity_changed = true;
                    }
                    ui.checkbox(helper_visible, "Light helper");
                });

            // Read at startup only; moving it mid-session has no effect.
            ui.add(
                egui::Slider::new(&mut settings.rotation_speed, ROTATION_RANGE)
                    .step_by(ROTATION_STEP)
                    .text("Rotation speed"),
            );

            if ui.button("Download as Image").clicked() {
                actions.screenshot_requested = true;
            }

            ui.separator();
            ui.label(format!("{fps:.0} fps"));
        });
}

/// Progress bar fraction and label, or `None` once loading finished.
/// A failed load keeps showing the plain loading label; the failure itself
/// is only logged.
fn overlay_content(status: LoadStatus) -> Option<(f32, &'static str)> {
    match status {
        LoadStatus::Ready => None,
        LoadStatus::Loading {
            fraction,
            almost_done,
        }
        | LoadStatus::Failed {
            fraction,
            almost_done,
        } => Some((
            fraction,
            if almost_done {
                "Almost done..."
            } else {
                "Loading assets"
            },
        )),
    }
}

fn draw_loading_overlay(ctx: &egui::Context, status: LoadStatus) {
    let Some((fraction, text)) = overlay_content(status) else {
        return;
    };

    egui::Area::new(egui::Id::new("loading-overlay"))
        .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
        .show(ctx, |ui| {
            ui.set_width(280.0);
            ui.vertical_centered(|ui| {
                ui.label(text);
                ui.add(egui::ProgressBar::new(fraction).show_percentage());
            });
        });
}

fn color_picker(ui: &mut egui::Ui, label: &str, color: &mut Vec3) -> bool {
    let mut rgb = color.to_array();
    let changed = ui
        .horizontal(|ui| {
            let response = ui.color_edit_button_rgb(&mut rgb);
            ui.label(label);
            response.changed()
        })
        .inner;
    if changed {
        *color = Vec3::from_array(rgb);
    }
    changed
}

fn scalar_slider(ui: &mut egui::Ui, label: &str, value: &mut f32) -> bool {
    ui.add(
        egui::Slider::new(value, SCALAR_RANGE)
            .step_by(SCALAR_STEP)
            .text(label),
    )
    .changed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_default_to_no_edits() {
        let actions = UiActions::default();
        assert!(!actions.materials_changed);
        assert!(!actions.shadows_toggled);
        assert!(!actions.env_light_toggled);
        assert!(!actions.env_intensity_changed);
        assert!(!actions.screenshot_requested);
    }

    #[test]
    fn overlay_status_reports_progress() {
        let status = LoadStatus::Loading {
            fraction: 0.5,
            almost_done: false,
        };
        assert_eq!(overlay_content(status), Some((0.5, "Loading assets")));
        let late = LoadStatus::Loading {
            fraction: 0.5,
            almost_done: true,
        };
        assert_eq!(overlay_content(late), Some((0.5, "Almost done...")));
        assert_eq!(overlay_content(LoadStatus::Ready), None);
    }

    #[test]
    fn failed_load_keeps_the_plain_loading_indicator() {
        // No dedicated failure message; the frozen bar and the regular
        // loading label are all the user sees.
        let failed = LoadStatus::Failed {
            fraction: 0.5,
            almost_done: false,
        };
        assert_eq!(overlay_content(failed), Some((0.5, "Loading assets")));
        let failed_late = LoadStatus::Failed {
            fraction: 0.5,
            almost_done: true,
        };
        assert_eq!(overlay_content(failed_late), Some((0.5, "Almost done...")));
    }
}
