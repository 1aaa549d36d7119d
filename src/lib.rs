//! Interactive car showroom viewer.
//!
//! Loads a glTF car model and an HDR environment in the background, composes
//! them into a lit scene with an orbiting spot light, and exposes the
//! material and lighting parameters through an on-screen control panel.

pub mod assets;
pub mod car;
pub mod controls;
pub mod render;
pub mod scene;
pub mod settings;
pub mod ui;

pub use assets::{spawn_loader, AssetError, LoadProgress, LoadedAssets};
pub use car::{CarModel, EnvironmentMap, Material, MeshPart, PartCategory};
pub use controls::{OrbitControls, PerspectiveCamera};
pub use render::{CameraFrame, GuiPrimitives, Renderer, Screenshot};
pub use scene::{light_orbit_position, SceneState};
pub use settings::MaterialSettings;
pub use ui::{ControlPanel, LoadStatus, UiActions, UiFrame};
