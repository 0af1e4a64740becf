//! This module contains the estimator-facing flight parameters the control core
//! consumes: attitude, and the position/velocity state used by the navigation
//! controllers. The estimator (IMU fusion, GPS/baro/sonar blending) is an
//! external collaborator; it writes these, the core only reads them.

use lin_alg2::f32::Vec3;
use num_traits::float::Float;

use crate::{flight_ctrls::FlightAxis, util::centidegrees_to_radians};

/// Instantaneous attitude, as the inner loop consumes it. Roll/pitch tilt are in
/// decidegrees from level; yaw is heading in decidegrees, [0, 3600).
#[derive(Clone, Copy, Default)]
pub struct Attitude {
    pub roll: i32,
    pub pitch: i32,
    pub yaw: i32,
}

impl Attitude {
    pub fn tilt(&self, axis: FlightAxis) -> i32 {
        match axis {
            FlightAxis::Roll => self.roll,
            FlightAxis::Pitch => self.pitch,
            FlightAxis::Yaw => self.yaw,
        }
    }
}

/// Position/velocity state from the estimator. Positions are cm in the
/// north-east-up frame; velocities cm/s. `surface` is height above ground from a
/// range sensor, -1 when invalid.
#[derive(Clone)]
pub struct ActualState {
    pub pos: Vec3,
    pub vel: Vec3,
    /// Horizontal speed magnitude, cm/s.
    pub vel_xy: f32,
    /// Heading, centidegrees.
    pub yaw: f32,
    pub sin_yaw: f32,
    pub cos_yaw: f32,
    pub surface: f32,
    /// Lowest surface reading seen while armed; our ground reference.
    pub surface_min: f32,
    pub surface_vel: f32,
}

impl Default for ActualState {
    fn default() -> Self {
        Self {
            pos: Vec3::new(0., 0., 0.),
            vel: Vec3::new(0., 0., 0.),
            vel_xy: 0.,
            yaw: 0.,
            sin_yaw: 0.,
            cos_yaw: 1.,
            surface: -1.,
            surface_min: -1.,
            surface_vel: 0.,
        }
    }
}

impl ActualState {
    /// Refresh the cached yaw trig terms. Called whenever heading updates.
    pub fn set_yaw(&mut self, yaw_centideg: f32) {
        self.yaw = yaw_centideg;
        self.sin_yaw = centidegrees_to_radians(yaw_centideg).sin();
        self.cos_yaw = centidegrees_to_radians(yaw_centideg).cos();
    }
}

/// Setpoints the navigation controllers steer toward.
#[derive(Clone)]
pub struct DesiredState {
    pub pos: Vec3,
    pub vel: Vec3,
    /// Surface offset target for terrain following, cm. -1 means not set.
    pub surface: f32,
    /// Heading target, centidegrees.
    pub yaw: f32,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self {
            pos: Vec3::new(0., 0., 0.),
            vel: Vec3::new(0., 0., 0.),
            surface: -1.,
            yaw: 0.,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaw_trig_cache() {
        let mut state = ActualState::default();

        state.set_yaw(9_000.); // due east
        assert!((state.sin_yaw - 1.).abs() < 1e-6);
        assert!(state.cos_yaw.abs() < 1e-6);

        state.set_yaw(0.);
        assert!(state.sin_yaw.abs() < 1e-6);
        assert!((state.cos_yaw - 1.).abs() < 1e-6);
    }
}
