use std::ops::RangeInclusive;

use glam::Vec3;

/// Widget range for metalness, roughness and the two clear coat parameters.
pub const SCALAR_RANGE: RangeInclusive<f32> = 0.0..=1.0;
pub const SCALAR_STEP: f64 = 0.1;

/// Widget range for the per-material environment intensity.
pub const INTENSITY_RANGE: RangeInclusive<f32> = 0.0..=1.0;
pub const INTENSITY_STEP: f64 = 0.01;

/// Widget range for the camera auto-rotation speed.
pub const ROTATION_RANGE: RangeInclusive<f32> = 0.0..=3.0;
pub const ROTATION_STEP: f64 = 0.1;

/// User-adjustable material and lighting parameters.
///
/// A single shared instance backs the whole control surface; edits mutate it
/// in place and trigger a full re-application pass over the model. There is
/// no history and no undo.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialSettings {
    pub paint_color: Vec3,
    pub caliper_color: Vec3,
    pub metalness: f32,
    pub roughness: f32,
    pub clear_coat: f32,
    pub clear_coat_roughness: f32,
    pub env_intensity: f32,
    pub shadows_enabled: bool,
    pub env_light_enabled: bool,
    pub rotation_speed: f32,
}

/// Converts an `0xrrggbb` color into unit-range RGB.
pub const fn hex_color(rgb: u32) -> Vec3 {
    Vec3::new(
        ((rgb >> 16) & 0xff) as f32 / 255.0,
        ((rgb >> 8) & 0xff) as f32 / 255.0,
        (rgb & 0xff) as f32 / 255.0,
    )
}

impl Default for MaterialSettings {
    fn default() -> Self {
        Self {
            paint_color: hex_color(0xcce8ef),
            caliper_color: Vec3::ONE,
            metalness: 0.5,
            roughness: 0.5,
            clear_coat: 0.2,
            clear_coat_roughness: 0.1,
            env_intensity: 0.1,
            shadows_enabled: true,
            env_light_enabled: true,
            rotation_speed: 0.8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let settings = MaterialSettings::default();
        assert_eq!(settings.metalness, 0.5);
        assert_eq!(settings.roughness, 0.5);
        assert_eq!(settings.clear_coat, 0.2);
        assert_eq!(settings.clear_coat_roughness, 0.1);
        assert_eq!(settings.env_intensity, 0.1);
        assert_eq!(settings.rotation_speed, 0.8);
        assert!(settings.shadows_enabled);
        assert!(settings.env_light_enabled);
        assert_eq!(settings.caliper_color, Vec3::ONE);
        assert!((settings.paint_color.x - 0.8).abs() < 0.01);
    }

    #[test]
    fn hex_colors_decode_channel_by_channel() {
        assert_eq!(hex_color(0xffffff), Vec3::ONE);
        assert_eq!(hex_color(0x000000), Vec3::ZERO);
        let paint = hex_color(0xcce8ef);
        assert!((paint.x - 204.0 / 255.0).abs() < 1e-6);
        assert!((paint.y - 232.0 / 255.0).abs() < 1e-6);
        assert!((paint.z - 239.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn widget_ranges_are_fixed() {
        assert_eq!(SCALAR_RANGE, 0.0..=1.0);
        assert_eq!(INTENSITY_RANGE, 0.0..=1.0);
        assert_eq!(ROTATION_RANGE, 0.0..=3.0);
    }
}
