use std::env;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use glam::Vec3;
use log::info;
use pollster::block_on;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, Event, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowBuilder};

use showroom::{
    light_orbit_position, spawn_loader, AssetError, CameraFrame, ControlPanel, LoadProgress,
    LoadStatus, LoadedAssets, MaterialSettings, OrbitControls, PerspectiveCamera, Renderer,
    SceneState, UiActions,
};

const DEFAULT_MODEL: &str = "assets/compressed_car.glb";
const DEFAULT_ENVIRONMENT: &str = "assets/autumn_field_puresky_1k.hdr";
const SCREENSHOT_FILE: &str = "car-image.png";

const CAMERA_START: Vec3 = Vec3::new(3.5, 2.8, 5.0);
const ALMOST_DONE_DELAY: Duration = Duration::from_millis(1300);

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let options = CliOptions::parse()?;

    let event_loop = EventLoop::new().context("failed to create event loop")?;
    let window = Arc::new(
        WindowBuilder::new()
            .with_title("Car Showroom")
            .with_inner_size(LogicalSize::new(1280.0, 720.0))
            .build(&event_loop)
            .context("failed to create window")?,
    );

    let renderer = block_on(Renderer::new(Arc::clone(&window)))?;
    let panel = ControlPanel::new(&event_loop);

    let progress = Arc::new(LoadProgress::new());
    let assets = spawn_loader(options.model_path, options.env_path, Arc::clone(&progress));

    let settings = MaterialSettings::default();
    let size = window.inner_size();
    let camera = PerspectiveCamera::new(size.width as f32 / size.height.max(1) as f32);
    // Rotation speed is sampled once here; the panel widget edits the
    // settings value without rebuilding the controller.
    let controls = OrbitControls::new(CAMERA_START, Vec3::ZERO, settings.rotation_speed);

    let mut app = AppState {
        window: Arc::clone(&window),
        renderer,
        panel,
        scene: SceneState::new(),
        settings,
        camera,
        controls,
        progress,
        assets: Some(assets),
        load_failed: false,
        helper_visible: false,
        started: Instant::now(),
        last_frame: Instant::now(),
        fps: 0.0,
        last_error: None,
    };

    event_loop.run(|event, elwt| {
        elwt.set_control_flow(ControlFlow::Poll);
        if let Err(err) = app.process_event(event, elwt) {
            app.last_error = Some(err);
            elwt.exit();
        }
    })?;

    if let Some(err) = app.last_error.take() {
        return Err(err);
    }
    Ok(())
}

struct AppState {
    window: Arc<Window>,
    renderer: Renderer,
    panel: ControlPanel,
    scene: SceneState,
    settings: MaterialSettings,
    camera: PerspectiveCamera,
    controls: OrbitControls,
    progress: Arc<LoadProgress>,
    assets: Option<Receiver<Result<LoadedAssets, AssetError>>>,
    load_failed: bool,
    helper_visible: bool,
    started: Instant,
    last_frame: Instant,
    fps: f32,
    last_error: Option<anyhow::Error>,
}

impl AppState {
    fn process_event(&mut self, event: Event<()>, elwt: &EventLoopWindowTarget<()>) -> Result<()> {
        match event {
            Event::WindowEvent { window_id, event } if window_id == self.renderer.window_id() => {
                let response = self.panel.on_window_event(&self.window, &event);
                match event {
                    WindowEvent::CloseRequested => elwt.exit(),
                    WindowEvent::KeyboardInput {
                        event:
                            KeyEvent {
                                physical_key: PhysicalKey::Code(KeyCode::Escape),
                                state: ElementState::Pressed,
                                ..
                            },
                        ..
                    } => elwt.exit(),
                    WindowEvent::Resized(size) => {
                        self.renderer.resize(size);
                        self.camera.set_aspect(size.width, size.height);
                    }
                    WindowEvent::RedrawRequested => self.tick()?,
                    _ if response.consumed => {}
                    WindowEvent::MouseInput {
                        state,
                        button: MouseButton::Left,
                        ..
                    } => self.controls.set_dragging(state == ElementState::Pressed),
                    WindowEvent::CursorMoved { position, .. } => {
                        self.controls.cursor_moved(position.x, position.y);
                    }
                    WindowEvent::MouseWheel { delta, .. } => {
                        let steps = match delta {
                            MouseScrollDelta::LineDelta(_, y) => y,
                            MouseScrollDelta::PixelDelta(position) => position.y as f32 / 50.0,
                        };
                        self.controls.zoom(steps);
                    }
                    _ => {}
                }
            }
            Event::AboutToWait => self.window.request_redraw(),
            _ => {}
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        self.poll_assets();

        let now = Instant::now();
        let dt = (now - self.last_frame).as_secs_f32();
        self.last_frame = now;
        if dt > 0.0 {
            self.fps = self.fps * 0.95 + 0.05 / dt;
        }

        // The light orbits continuously from the first frame, driven by
        // wall-clock time; it does not wait for the assets.
        let elapsed = self.started.elapsed().as_secs_f32();
        self.scene.spot_light.position = light_orbit_position(elapsed);
        self.controls.update(dt);

        let status = self.load_status();
        let window = Arc::clone(&self.window);
        let frame = self.panel.run(
            &window,
            &mut self.settings,
            &mut self.helper_visible,
            status,
            self.fps,
        );
        self.dispatch(&frame.actions);
        self.scene.spot_light.helper_visible = self.helper_visible;

        let camera = self.camera_frame();
        self.renderer.update_globals(&self.scene, &camera);

        if frame.actions.screenshot_requested {
            if let Err(err) = self.save_screenshot() {
                log::error!("screenshot failed: {err:#}");
            }
        }

        if let Err(err) = self.renderer.render(&self.scene, Some(&frame.gui)) {
            match err {
                wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated => {
                    let size = self.window.inner_size();
                    self.renderer.resize(size);
                }
                wgpu::SurfaceError::OutOfMemory => {
                    return Err(anyhow!("GPU is out of memory"));
                }
                wgpu::SurfaceError::Timeout => {
                    info!("Surface timeout; retrying next frame");
                }
            }
        }
        Ok(())
    }

    fn poll_assets(&mut self) {
        let Some(receiver) = self.assets.as_ref() else {
            return;
        };
        match receiver.try_recv() {
            Ok(Ok(assets)) => {
                info!(
                    "Assets loaded: {} parts, {}x{} environment",
                    assets.model.parts.len(),
                    assets.environment.width,
                    assets.environment.height
                );
                self.scene.compose(assets, &self.settings);
                self.scene.set_shadows_enabled(self.settings.shadows_enabled);
                self.assets = None;
            }
            Ok(Err(err)) => {
                log::error!("asset load failed: {err:#}");
                self.load_failed = true;
                self.assets = None;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                self.load_failed = true;
                self.assets = None;
            }
        }
    }

    fn load_status(&self) -> LoadStatus {
        let almost_done = self.started.elapsed() >= ALMOST_DONE_DELAY;
        if self.load_failed {
            return LoadStatus::Failed {
                fraction: self.progress.fraction(),
                almost_done,
            };
        }
        if self.scene.model.is_some() {
            return LoadStatus::Ready;
        }
        LoadStatus::Loading {
            fraction: self.progress.fraction(),
            almost_done,
        }
    }

    fn dispatch(&mut self, actions: &UiActions) {
        if actions.materials_changed {
            self.scene.apply_material_settings(&self.settings);
        }
        if actions.shadows_toggled {
            self.scene.set_shadows_enabled(self.settings.shadows_enabled);
        }
        if actions.env_light_toggled {
            self.scene
                .set_env_light_enabled(self.settings.env_light_enabled);
        }
        if actions.env_intensity_changed {
            self.scene.set_env_intensity(self.settings.env_intensity);
        }
    }

    fn camera_frame(&self) -> CameraFrame {
        let view_proj = self.camera.projection() * self.controls.view_matrix();
        CameraFrame {
            view_proj,
            inv_view_proj: view_proj.inverse(),
            position: self.controls.position(),
        }
    }

    /// Renders the scene without the panel and writes it next to the binary.
    fn save_screenshot(&mut self) -> Result<()> {
        let shot = self.renderer.capture(&self.scene)?;
        image::save_buffer(
            SCREENSHOT_FILE,
            &shot.pixels,
            shot.width,
            shot.height,
            image::ColorType::Rgba8,
        )
        .with_context(|| format!("failed to write {SCREENSHOT_FILE}"))?;
        info!("Saved {SCREENSHOT_FILE}");
        Ok(())
    }
}

struct CliOptions {
    model_path: PathBuf,
    env_path: PathBuf,
}

impl CliOptions {
    fn parse() -> Result<Self> {
        let mut model_path = None;
        let mut env_path = None;
        for arg in env::args().skip(1) {
            if arg.starts_with('-') {
                return Err(anyhow!(
                    "Unknown argument: {arg}. Usage: showroom [model.glb] [environment.hdr]"
                ));
            }
            if model_path.is_none() {
                model_path = Some(arg);
            } else if env_path.is_none() {
                env_path = Some(arg);
            } else {
                return Err(anyhow!(
                    "Too many arguments. Usage: showroom [model.glb] [environment.hdr]"
                ));
            }
        }
        Ok(Self {
            model_path: PathBuf::from(model_path.unwrap_or_else(|| DEFAULT_MODEL.to_string())),
            env_path: PathBuf::from(env_path.unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())),
        })
    }
}
