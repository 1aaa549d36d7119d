use std::sync::Arc;

use glam::Vec3;

use crate::assets::LoadedAssets;
use crate::car::{CarModel, EnvironmentMap, Material, PartCategory};
use crate::settings::MaterialSettings;

/// Background presentation of the environment map. Fixed presets, decoupled
/// from the per-material environment intensity.
pub const BACKGROUND_INTENSITY: f32 = 0.5;
pub const BACKGROUND_BLURRINESS: f32 = 0.2;

/// Horizontal orbit of the animated spot light.
pub const LIGHT_ORBIT_RADIUS: f32 = 1.5;
pub const LIGHT_HEIGHT: f32 = 4.0;

pub const GROUND_SIZE: f32 = 100.0;

/// Spot light aimed at the model, with a visual helper that can be toggled
/// from the control surface.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotLight {
    pub position: Vec3,
    pub target: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    /// Half-angle of the cone, radians.
    pub angle: f32,
    pub penumbra: f32,
    pub distance: f32,
    pub decay: f32,
    pub helper_visible: bool,
}

impl Default for SpotLight {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, LIGHT_HEIGHT, 0.0),
            target: Vec3::ZERO,
            color: Vec3::ONE,
            intensity: 10.0,
            angle: 1.04,
            penumbra: 1.0,
            distance: 10.0,
            decay: 2.0,
            helper_visible: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroundPlane {
    pub size: f32,
    pub color: Vec3,
    pub receive_shadow: bool,
}

impl Default for GroundPlane {
    fn default() -> Self {
        Self {
            size: GROUND_SIZE,
            color: Vec3::ONE,
            receive_shadow: true,
        }
    }
}

/// Scene background: the shared environment map with fixed presentation
/// presets. Its intensity never follows the per-material intensity control.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Background {
    pub env: Option<Arc<EnvironmentMap>>,
    pub intensity: f32,
    pub blurriness: f32,
}

/// The live scene graph: everything the render loop reads each frame.
///
/// Constructed once at startup; the model and environment arrive later when
/// the asset loader resolves. All mutation happens on the UI thread.
#[derive(Debug, Default)]
pub struct SceneState {
    pub background: Background,
    pub ground: GroundPlane,
    pub spot_light: SpotLight,
    pub model: Option<CarModel>,
    pub environment: Option<Arc<EnvironmentMap>>,
    pub shadow_map_enabled: bool,
}

impl SceneState {
    pub fn new() -> Self {
        Self {
            background: Background::default(),
            ground: GroundPlane::default(),
            spot_light: SpotLight::default(),
            model: None,
            environment: None,
            shadow_map_enabled: true,
        }
    }

    /// Installs the decoded assets into the scene: the environment becomes
    /// the visible background, every part references the shared map, the
    /// spot light aims at the model root, and one apply pass runs.
    pub fn compose(&mut self, assets: LoadedAssets, settings: &MaterialSettings) {
        let LoadedAssets {
            environment,
            mut model,
        } = assets;

        self.background = Background {
            env: Some(Arc::clone(&environment)),
            intensity: BACKGROUND_INTENSITY,
            blurriness: BACKGROUND_BLURRINESS,
        };
        for part in &mut model.parts {
            part.env_map = Some(Arc::clone(&environment));
            part.env_intensity = settings.env_intensity;
        }
        self.spot_light.target = model.root_position;
        self.environment = Some(environment);
        self.model = Some(model);
        self.apply_material_settings(settings);
    }

    /// Re-derives material state from the current parameters.
    ///
    /// Idempotent and total: repeated calls with unchanged parameters leave
    /// every part identical, and a missing model means nothing to do.
    pub fn apply_material_settings(&mut self, settings: &MaterialSettings) {
        let Some(model) = self.model.as_mut() else {
            return;
        };
        for part in &mut model.parts {
            part.cast_shadow = true;
            match part.category {
                PartCategory::Paint => match &mut part.material {
                    Material::Basic { color } => *color = settings.paint_color,
                    Material::Standard {
                        color,
                        metalness,
                        roughness,
                    } => {
                        *color = settings.paint_color;
                        *metalness = settings.metalness;
                        *roughness = settings.roughness;
                    }
                    Material::PhysicallyBased {
                        color,
                        metalness,
                        roughness,
                        clear_coat,
                        clear_coat_roughness,
                    } => {
                        *color = settings.paint_color;
                        *metalness = settings.metalness;
                        *roughness = settings.roughness;
                        *clear_coat = settings.clear_coat;
                        *clear_coat_roughness = settings.clear_coat_roughness;
                    }
                },
                PartCategory::Caliper => part.material.set_color(settings.caliper_color),
                PartCategory::Other => {}
            }
        }
    }

    /// Flips global shadow-map rendering and the ground's shadow-receiving
    /// flag together.
    pub fn set_shadows_enabled(&mut self, enabled: bool) {
        self.shadow_map_enabled = enabled;
        self.ground.receive_shadow = enabled;
    }

    /// Assigns or clears the shared environment-map reference on every part.
    /// Re-enabling restores the same shared instance, never a reload.
    pub fn set_env_light_enabled(&mut self, enabled: bool) {
        let Some(model) = self.model.as_mut() else {
            return;
        };
        let shared = self.environment.clone();
        for part in &mut model.parts {
            part.env_map = if enabled { shared.clone() } else { None };
        }
    }

    /// Adjusts the environment intensity on every part without touching the
    /// map reference or the background.
    pub fn set_env_intensity(&mut self, intensity: f32) {
        let Some(model) = self.model.as_mut() else {
            return;
        };
        for part in &mut model.parts {
            part.env_intensity = intensity;
        }
    }
}

/// Position of the spot light after `elapsed` seconds: a fixed-radius
/// circular orbit, a pure function of elapsed time rather than frame count.
pub fn light_orbit_position(elapsed: f32) -> Vec3 {
    Vec3::new(
        elapsed.sin() * LIGHT_ORBIT_RADIUS,
        LIGHT_HEIGHT,
        elapsed.cos() * LIGHT_ORBIT_RADIUS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::MeshPart;
    use glam::Mat4;

    fn part(name: &str, category: PartCategory, material: Material) -> MeshPart {
        MeshPart {
            name: name.to_string(),
            category,
            transform: Mat4::IDENTITY,
            vertices: vec![0.0; 6],
            indices: vec![0],
            material,
            cast_shadow: false,
            env_map: None,
            env_intensity: 0.0,
        }
    }

    fn physically_based() -> Material {
        Material::PhysicallyBased {
            color: Vec3::ONE,
            metalness: 0.0,
            roughness: 1.0,
            clear_coat: 0.0,
            clear_coat_roughness: 0.0,
        }
    }

    fn test_scene() -> SceneState {
        let environment = Arc::new(EnvironmentMap {
            width: 2,
            height: 1,
            pixels: vec![1.0; 6],
        });
        let model = CarModel {
            parts: vec![
                part("body_paint", PartCategory::Paint, physically_based()),
                part(
                    "hood_paint",
                    PartCategory::Paint,
                    Material::Standard {
                        color: Vec3::ONE,
                        metalness: 0.0,
                        roughness: 1.0,
                    },
                ),
                part(
                    "front_caliper",
                    PartCategory::Caliper,
                    Material::Standard {
                        color: Vec3::ONE,
                        metalness: 0.3,
                        roughness: 0.7,
                    },
                ),
                part(
                    "windshield",
                    PartCategory::Other,
                    Material::Standard {
                        color: Vec3::splat(0.4),
                        metalness: 0.3,
                        roughness: 0.7,
                    },
                ),
            ],
            root_position: Vec3::ZERO,
        };
        let mut scene = SceneState::new();
        scene.compose(
            LoadedAssets {
                environment,
                model,
            },
            &MaterialSettings::default(),
        );
        scene
    }

    #[test]
    fn apply_is_idempotent() {
        let mut scene = test_scene();
        let settings = MaterialSettings {
            metalness: 0.8,
            roughness: 0.2,
            ..MaterialSettings::default()
        };
        scene.apply_material_settings(&settings);
        let first: Vec<_> = scene.model.as_ref().unwrap().parts.clone();
        scene.apply_material_settings(&settings);
        assert_eq!(scene.model.as_ref().unwrap().parts, first);
    }

    #[test]
    fn paint_scenario_sets_all_parameters() {
        let mut scene = test_scene();
        let paint = Vec3::new(0.9, 0.1, 0.1);
        let settings = MaterialSettings {
            paint_color: paint,
            metalness: 0.8,
            roughness: 0.2,
            clear_coat: 1.0,
            ..MaterialSettings::default()
        };
        scene.apply_material_settings(&settings);

        let parts = &scene.model.as_ref().unwrap().parts;
        for part in parts.iter().filter(|p| p.category == PartCategory::Paint) {
            assert_eq!(part.material.color(), paint);
            let (metalness, roughness, clear_coat, _) = part.material.shading();
            assert_eq!(metalness, 0.8);
            assert_eq!(roughness, 0.2);
            match &part.material {
                // Capability present: clear coat applied.
                Material::PhysicallyBased { .. } => assert_eq!(clear_coat, 1.0),
                // Capability absent: silently skipped, not an error.
                _ => assert_eq!(clear_coat, 0.0),
            }
        }
    }

    #[test]
    fn caliper_gets_only_its_color() {
        let mut scene = test_scene();
        let settings = MaterialSettings {
            caliper_color: Vec3::new(0.0, 1.0, 0.0),
            metalness: 0.9,
            ..MaterialSettings::default()
        };
        scene.apply_material_settings(&settings);
        let caliper = &scene.model.as_ref().unwrap().parts[2];
        assert_eq!(caliper.material.color(), Vec3::new(0.0, 1.0, 0.0));
        // Metalness stays as loaded.
        assert_eq!(caliper.material.shading().0, 0.3);
    }

    #[test]
    fn unmatched_parts_keep_materials_but_cast_shadows() {
        let mut scene = test_scene();
        let before = scene.model.as_ref().unwrap().parts[3].material.clone();
        scene.apply_material_settings(&MaterialSettings {
            paint_color: Vec3::ZERO,
            metalness: 1.0,
            roughness: 0.0,
            ..MaterialSettings::default()
        });
        let other = &scene.model.as_ref().unwrap().parts[3];
        assert_eq!(other.material, before);
        assert!(other.cast_shadow);
    }

    #[test]
    fn env_toggle_restores_the_shared_instance() {
        let mut scene = test_scene();
        let original = scene.model.as_ref().unwrap().parts[0]
            .env_map
            .clone()
            .expect("compose attaches the environment");

        scene.set_env_light_enabled(false);
        assert!(scene
            .model
            .as_ref()
            .unwrap()
            .parts
            .iter()
            .all(|part| part.env_map.is_none()));

        scene.set_env_light_enabled(true);
        for part in &scene.model.as_ref().unwrap().parts {
            let restored = part.env_map.as_ref().expect("reference restored");
            assert!(Arc::ptr_eq(restored, &original));
        }
    }

    #[test]
    fn intensity_reaches_parts_but_never_the_background() {
        let mut scene = test_scene();
        scene.set_env_intensity(0.73);
        assert!(scene
            .model
            .as_ref()
            .unwrap()
            .parts
            .iter()
            .all(|part| part.env_intensity == 0.73));
        assert_eq!(scene.background.intensity, BACKGROUND_INTENSITY);
    }

    #[test]
    fn shadow_toggle_is_atomic() {
        let mut scene = test_scene();
        scene.set_shadows_enabled(false);
        assert!(!scene.shadow_map_enabled);
        assert!(!scene.ground.receive_shadow);
        scene.set_shadows_enabled(true);
        assert!(scene.shadow_map_enabled);
        assert!(scene.ground.receive_shadow);
    }

    #[test]
    fn operations_are_total_without_a_model() {
        let mut scene = SceneState::new();
        scene.apply_material_settings(&MaterialSettings::default());
        scene.set_env_light_enabled(false);
        scene.set_env_intensity(0.5);
        assert!(scene.model.is_none());
    }

    #[test]
    fn light_orbit_is_a_function_of_elapsed_time() {
        let a = light_orbit_position(1.25);
        let b = light_orbit_position(1.25);
        assert_eq!(a, b);
        assert!((a.x - 1.25f32.sin() * LIGHT_ORBIT_RADIUS).abs() < 1e-6);
        assert!((a.z - 1.25f32.cos() * LIGHT_ORBIT_RADIUS).abs() < 1e-6);
        assert_eq!(a.y, LIGHT_HEIGHT);
        // Radius stays fixed along the whole orbit.
        let p = light_orbit_position(4.7);
        assert!((Vec3::new(p.x, 0.0, p.z).length() - LIGHT_ORBIT_RADIUS).abs() < 1e-5);
    }

    #[test]
    fn light_orbits_before_any_model_arrives() {
        // The orbit is independent of asset state: already at t = 0 it
        // yields a position distinct from the light's resting default.
        let scene = SceneState::new();
        assert!(scene.model.is_none());
        let first = light_orbit_position(0.0);
        assert_ne!(first, scene.spot_light.position);
        assert_eq!(first, Vec3::new(0.0, LIGHT_HEIGHT, LIGHT_ORBIT_RADIUS));
    }

    #[test]
    fn failed_load_leaves_only_the_static_scene() {
        let scene = SceneState::new();
        assert!(scene.model.is_none());
        assert!(scene.background.env.is_none());
        assert!(scene.ground.receive_shadow);
        assert_eq!(scene.spot_light.position, Vec3::new(0.0, LIGHT_HEIGHT, 0.0));
    }
}
