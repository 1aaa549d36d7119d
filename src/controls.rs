use std::f32::consts::{FRAC_PI_2, TAU};

use glam::{Mat4, Vec3};

/// Smoothing applied to drag velocity each update.
pub const DAMPING_FACTOR: f32 = 0.01;
/// The camera never dips below the ground plane.
pub const MAX_POLAR_ANGLE: f32 = FRAC_PI_2 - 0.02;
const MIN_POLAR_ANGLE: f32 = 0.05;

const MIN_RADIUS: f32 = 1.0;
const MAX_RADIUS: f32 = 30.0;
const ROTATE_SPEED: f32 = 0.005;

/// One speed unit completes a full orbit in sixty seconds.
const AUTO_ROTATE_RATE: f32 = TAU / 60.0;

/// Perspective projection state. Aspect follows the window size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerspectiveCamera {
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl PerspectiveCamera {
    pub fn new(aspect: f32) -> Self {
        Self {
            fov_y: 45f32.to_radians(),
            aspect: aspect.max(0.01),
            near: 0.1,
            far: 100.0,
        }
    }

    pub fn set_aspect(&mut self, width: u32, height: u32) {
        if height == 0 {
            return;
        }
        self.aspect = width as f32 / height as f32;
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect.max(0.01), self.near, self.far)
    }
}

/// Damped spherical orbit around a fixed focus point.
///
/// Drag to rotate, scroll to zoom. Auto-rotation advances the azimuth at an
/// angular speed fixed at construction time: the rotation-speed widget in
/// the panel deliberately does not feed back into a live controller, which
/// mirrors the behaviour of the reference viewer.
#[derive(Debug, Clone, PartialEq)]
pub struct OrbitControls {
    pub target: Vec3,
    radius: f32,
    azimuth: f32,
    polar: f32,
    azimuth_velocity: f32,
    polar_velocity: f32,
    auto_rotate: bool,
    auto_rotate_speed: f32,
    dragging: bool,
    last_cursor: Option<(f64, f64)>,
}

impl OrbitControls {
    pub fn new(position: Vec3, target: Vec3, auto_rotate_speed: f32) -> Self {
        let offset = position - target;
        let radius = offset.length().clamp(MIN_RADIUS, MAX_RADIUS);
        let polar = (offset.y / radius).clamp(-1.0, 1.0).acos();
        Self {
            target,
            radius,
            azimuth: offset.x.atan2(offset.z),
            polar: polar.clamp(MIN_POLAR_ANGLE, MAX_POLAR_ANGLE),
            azimuth_velocity: 0.0,
            polar_velocity: 0.0,
            auto_rotate: true,
            auto_rotate_speed,
            dragging: false,
            last_cursor: None,
        }
    }

    pub fn set_dragging(&mut self, dragging: bool) {
        self.dragging = dragging;
        if !dragging {
            self.last_cursor = None;
        }
    }

    pub fn cursor_moved(&mut self, x: f64, y: f64) {
        if !self.dragging {
            self.last_cursor = Some((x, y));
            return;
        }
        if let Some((last_x, last_y)) = self.last_cursor {
            self.azimuth_velocity -= (x - last_x) as f32 * ROTATE_SPEED;
            self.polar_velocity -= (y - last_y) as f32 * ROTATE_SPEED;
        }
        self.last_cursor = Some((x, y));
    }

    pub fn zoom(&mut self, steps: f32) {
        self.radius = (self.radius * (1.0 - steps * 0.1)).clamp(MIN_RADIUS, MAX_RADIUS);
    }

    /// Advances auto-rotation and damping. Called once per rendered frame.
    pub fn update(&mut self, dt: f32) {
        if self.auto_rotate {
            self.azimuth += self.auto_rotate_speed * AUTO_ROTATE_RATE * dt;
        }
        self.azimuth += self.azimuth_velocity;
        self.polar =
            (self.polar + self.polar_velocity).clamp(MIN_POLAR_ANGLE, MAX_POLAR_ANGLE);

        let decay = 1.0 - DAMPING_FACTOR;
        self.azimuth_velocity *= decay;
        self.polar_velocity *= decay;
    }

    pub fn position(&self) -> Vec3 {
        let sin_polar = self.polar.sin();
        self.target
            + Vec3::new(
                self.radius * sin_polar * self.azimuth.sin(),
                self.radius * self.polar.cos(),
                self.radius * sin_polar * self.azimuth.cos(),
            )
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position(), self.target, Vec3::Y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controls(speed: f32) -> OrbitControls {
        OrbitControls::new(Vec3::new(3.5, 2.8, 5.0), Vec3::ZERO, speed)
    }

    #[test]
    fn resize_updates_the_aspect_ratio() {
        let mut camera = PerspectiveCamera::new(1920.0 / 1080.0);
        camera.set_aspect(800, 600);
        assert!((camera.aspect - 800.0 / 600.0).abs() < 1e-6);
        // A zero-height viewport never produces a degenerate projection.
        camera.set_aspect(800, 0);
        assert!((camera.aspect - 800.0 / 600.0).abs() < 1e-6);
    }

    #[test]
    fn auto_rotation_is_time_based() {
        let mut a = controls(2.0);
        let mut b = controls(2.0);
        // Sixty small steps cover the same arc as one large step.
        for _ in 0..60 {
            a.update(1.0 / 60.0);
        }
        b.update(1.0);
        let delta = (a.position() - b.position()).length();
        assert!(delta < 1e-3, "positions diverged by {delta}");
    }

    #[test]
    fn polar_angle_stays_above_the_ground() {
        let mut controls = controls(0.0);
        for _ in 0..200 {
            controls.set_dragging(true);
            controls.cursor_moved(0.0, 0.0);
            controls.cursor_moved(0.0, -400.0);
            controls.update(1.0 / 60.0);
        }
        assert!(controls.position().y >= 0.0);
    }

    #[test]
    fn orbit_preserves_the_radius() {
        let mut controls = controls(1.0);
        let before = (controls.position() - controls.target).length();
        for _ in 0..30 {
            controls.update(0.016);
        }
        let after = (controls.position() - controls.target).length();
        assert!((before - after).abs() < 1e-4);
    }

    #[test]
    fn zoom_is_clamped() {
        let mut controls = controls(0.0);
        for _ in 0..100 {
            controls.zoom(1.0);
        }
        assert!((controls.position() - controls.target).length() >= MIN_RADIUS - 1e-6);
        for _ in 0..200 {
            controls.zoom(-1.0);
        }
        assert!((controls.position() - controls.target).length() <= MAX_RADIUS + 1e-3);
    }
}
