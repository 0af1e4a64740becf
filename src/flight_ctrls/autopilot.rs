//! This module contains the outer navigation controllers for multirotor
//! airframes: the altitude cascade (position -> climb rate -> throttle offset),
//! the horizontal position cascade (position -> velocity -> acceleration ->
//! tilt), surface tracking, the land detector, emergency descent, and the
//! dispatch that runs whichever of them the navigation state machine asks for.
//!
//! Setpoints produced here feed the inner rate/attitude loop through the shaped
//! command set; nothing below this layer knows navigation exists.

use lin_alg2::f32::Vec3;
use num_traits::float::Float;

use crate::{
    config::{CoreConfig, PidIndex, PidProfile, UserControlMode},
    control_interface::{RcCommands, ThrottleStatus},
    filters::Pt1Filter,
    flight_ctrls::{
        blackbox_i16,
        pid::{angle_to_rc_command, RateController},
        GRAVITY_CMSS,
    },
    params::{ActualState, DesiredState},
    state::NavStateFlags,
    util::{
        apply_deadband, centidegrees_to_degrees, centidegrees_to_radians, constrain, constrain_i32,
        degrees_to_decidegrees, hz_to_us, radians_to_decidegrees, us_to_s, wrap_18000,
    },
};

/// Below this update rate a position/altitude sample is stale; the affected
/// controller resets instead of integrating across the gap.
pub const MIN_POSITION_UPDATE_RATE_HZ: u32 = 5;

const NAV_THROTTLE_CUTOFF_FREQUENCY_HZ: f32 = 4.;
const NAV_ACCEL_CUTOFF_FREQUENCY_HZ: f32 = 2.;
const NAV_DTERM_CUT_HZ: f32 = 10.;

/// Horizontal acceleration cap, cm/s^2 (about 45 degrees of bank).
pub const NAV_ACCELERATION_XY_MAX: f32 = 980.;

pub const LAND_DETECTOR_TRIGGER_TIME_MS: u32 = 2000;

// Surface-tracking setpoint range, cm. The upper bound is where the range
// sensor stops being trustworthy.
const SURFACE_TARGET_MIN: f32 = 1.;
const SURFACE_TARGET_MAX: f32 = 40.;

// Surface PID output clamp, cm. Asymmetric: we better overshoot a little bit
// than undershoot.
const SURFACE_ERROR_MIN: f32 = -5.;
const SURFACE_ERROR_MAX: f32 = 35.;

/// Float PID with back-calculation I-term anti-windup.
/// Control System Design, Lecture Notes for ME 155A by Karl Johan Astrom (p.228)
/// http://www.cds.caltech.edu/~murray/courses/cds101/fa02/caltech/astrom-ch6.pdf
#[derive(Clone, Default)]
pub struct NavPid {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub kt: f32,

    pub integrator: f32,
    last_input: f32,
    dterm_filter: Pt1Filter,
}

impl NavPid {
    pub fn new(kp: f32, ki: f32, kd: f32) -> Self {
        // Tracking gain from the integral and derivative times. Without both P
        // and I the tracking term is meaningless, so back-calculation (and the
        // integrator itself) shut off.
        let (ki, kt) = if ki > 1e-6 && kp > 1e-6 {
            let ti = kp / ki;
            let td = kd / kp;
            (ki, 2. / (ti + td))
        } else {
            (0., 0.)
        };

        Self {
            kp,
            ki,
            kd,
            kt,
            integrator: 0.,
            last_input: 0.,
            dterm_filter: Pt1Filter::default(),
        }
    }

    /// One PID step with output limiting. The integrator is corrected by the
    /// difference between the raw and limited output, so it unwinds instead of
    /// accumulating against a saturated actuator.
    pub fn apply(
        &mut self,
        setpoint: f32,
        measurement: f32,
        dt: f32,
        out_min: f32,
        out_max: f32,
        dterm_error_tracking: bool,
    ) -> f32 {
        let error = setpoint - measurement;

        let new_proportional = error * self.kp;

        let new_derivative = if dterm_error_tracking {
            let d = (error - self.last_input) / dt;
            self.last_input = error;
            d
        } else {
            // Derivative on measurement; immune to setpoint steps.
            let d = -(measurement - self.last_input) / dt;
            self.last_input = measurement;
            d
        };

        let new_derivative = self.kd * self.dterm_filter.apply(new_derivative, NAV_DTERM_CUT_HZ, dt);

        let out_val = new_proportional + self.integrator + new_derivative;
        let out_val_constrained = constrain(out_val, out_min, out_max);

        self.integrator +=
            (error * self.ki * dt) + ((out_val_constrained - out_val) * self.kt * dt);

        out_val_constrained
    }

    pub fn reset(&mut self) {
        self.integrator = 0.;
        self.last_input = 0.;
        self.dterm_filter.reset(0.);
    }
}

/// Plain P controller for the position-to-velocity stages.
#[derive(Clone, Copy, Default)]
pub struct NavP {
    pub kp: f32,
}

#[derive(Default)]
struct NavPids {
    /// Horizontal position to velocity.
    pos_xy: NavP,
    /// Horizontal velocity to acceleration, per spatial axis.
    vel_xy: [NavPid; 2],
    /// Altitude to climb rate.
    pos_z: NavP,
    /// Climb rate to throttle offset.
    vel_z: NavPid,
    /// Surface offset to altitude correction.
    surface: NavPid,
}

/// How a climb-rate-driven altitude target treats the surface-tracking setpoint.
#[derive(Clone, Copy, PartialEq)]
pub enum ClimbRateMode {
    /// Move the surface target along with the commanded climb.
    UpdateSurfaceTarget,
    /// Leave the surface target where it is (e.g. descending to reacquire it).
    KeepSurfaceTarget,
    /// Drop surface tracking entirely.
    ResetSurfaceTarget,
}

/// Sensor-validity and freshness handshake, plus pilot-adjustment markers.
/// Producers (the estimator ingest methods) raise `*_data_new`; the controllers
/// raise `*_data_consumed` after reading; the dispatch clears both.
#[derive(Clone, Copy, Default)]
pub struct NavFlags {
    pub has_valid_position_sensor: bool,
    pub has_valid_altitude_sensor: bool,
    pub has_valid_surface_sensor: bool,

    pub horizontal_position_data_new: bool,
    pub horizontal_position_data_consumed: bool,
    pub vertical_position_data_new: bool,
    pub vertical_position_data_consumed: bool,
    pub surface_distance_data_new: bool,
    pub heading_data_new: bool,

    pub is_adjusting_position: bool,
    pub is_adjusting_altitude: bool,
    pub is_adjusting_heading: bool,

    pub is_terrain_follow_enabled: bool,
}

/// Outer-loop corrections handed to the inner loop. Roll/pitch in decidegrees,
/// throttle as an offset from hover.
#[derive(Clone, Copy, Default)]
pub struct RcAdjustment {
    pub roll: i32,
    pub pitch: i32,
    pub throttle: i32,
}

/// Instantaneous nav values for an external blackbox sink.
#[derive(Clone, Copy, Default)]
pub struct NavBlackbox {
    pub target_position_z: i16,
    pub target_surface: i16,
    pub desired_velocity: [i16; 3],
}

/// The outer navigation controller context: setpoints, sensor handshake, the
/// nav PID bank, and per-stage timing. Owned by the scheduler and shared with
/// no one; the navigation FSM talks to it through flags and fields.
pub struct NavController {
    pub actual: ActualState,
    pub desired: DesiredState,
    pub flags: NavFlags,
    pub rc_adjustment: RcAdjustment,
    pub blackbox: NavBlackbox,

    /// Cruise speed for the active leg, cm/s. Written by the navigation FSM;
    /// defaults to the manual speed limit.
    pub active_waypoint_speed: f32,

    pids: NavPids,
    /// Brake time for the predictive stopping point, seconds. From I8[POS].
    pos_deceleration_time: f32,
    /// Velocity expo near the target. From D8[POS].
    pos_response_expo: f32,

    // Altitude-stage timing.
    alt_previous_time_update_us: u32,
    alt_previous_time_position_update_us: u32,
    // Horizontal-stage timing.
    pos_previous_time_update_us: u32,
    pos_previous_time_position_update_us: u32,
    // Emergency-descent timing (its own lane; it may engage mid-flight).
    emerg_previous_time_update_us: u32,
    emerg_previous_time_position_update_us: u32,

    // Alt-hold pilot interface.
    alt_hold_throttle_rc_zero: i32,
    althold_throttle_filter: Pt1Filter,
    prepare_for_takeoff_on_reset: bool,
    /// Nav-corrected throttle from the last altitude update; the land detector
    /// polls from RC processing, where `rc_command` holds raw pilot input.
    rc_command_adjusted_throttle: i32,

    // Horizontal accel slew/filter state.
    last_accel_target_x: f32,
    last_accel_target_y: f32,
    acc_filter_x: Pt1Filter,
    acc_filter_y: Pt1Filter,

    // Land detector.
    landing_timer_us: u32,
    has_had_some_velocity: bool,

    emerg_engaged: bool,
}

impl Default for NavController {
    fn default() -> Self {
        Self {
            actual: ActualState::default(),
            desired: DesiredState::default(),
            flags: NavFlags::default(),
            rc_adjustment: RcAdjustment::default(),
            blackbox: NavBlackbox::default(),
            active_waypoint_speed: 0.,
            pids: NavPids::default(),
            pos_deceleration_time: 0.,
            pos_response_expo: 0.,
            alt_previous_time_update_us: 0,
            alt_previous_time_position_update_us: 0,
            pos_previous_time_update_us: 0,
            pos_previous_time_position_update_us: 0,
            emerg_previous_time_update_us: 0,
            emerg_previous_time_position_update_us: 0,
            alt_hold_throttle_rc_zero: 1500,
            althold_throttle_filter: Pt1Filter::default(),
            prepare_for_takeoff_on_reset: false,
            rc_command_adjusted_throttle: 0,
            last_accel_target_x: 0.,
            last_accel_target_y: 0.,
            acc_filter_x: Pt1Filter::default(),
            acc_filter_y: Pt1Filter::default(),
            landing_timer_us: 0,
            has_had_some_velocity: false,
            emerg_engaged: false,
        }
    }
}

impl NavController {
    pub fn new(cfg: &CoreConfig) -> Self {
        let mut result = Self::default();
        result.use_pids(&cfg.pid_profile);
        result.active_waypoint_speed = cfg.nav.max_manual_speed as f32;
        result
    }

    /// (Re)load the nav PID bank from a profile. Gains are stored as hundredths
    /// in the 8-bit banks; the surface PID is fixed tuning.
    pub fn use_pids(&mut self, profile: &PidProfile) {
        self.pos_deceleration_time = profile.i[PidIndex::Pos as usize] as f32 / 100.;
        self.pos_response_expo = constrain(profile.d[PidIndex::Pos as usize] as f32 / 100., 0., 1.);

        self.pids.pos_xy = NavP {
            kp: profile.p[PidIndex::Pos as usize] as f32 / 100.,
        };
        for pid in &mut self.pids.vel_xy {
            *pid = NavPid::new(
                profile.p[PidIndex::PosR as usize] as f32 / 100.,
                profile.i[PidIndex::PosR as usize] as f32 / 100.,
                profile.d[PidIndex::PosR as usize] as f32 / 100.,
            );
        }

        self.pids.pos_z = NavP {
            kp: profile.p[PidIndex::Alt as usize] as f32 / 100.,
        };
        self.pids.vel_z = NavPid::new(
            profile.p[PidIndex::Vel as usize] as f32 / 100.,
            profile.i[PidIndex::Vel as usize] as f32 / 100.,
            profile.d[PidIndex::Vel as usize] as f32 / 100.,
        );

        self.pids.surface = NavPid::new(2.0, 1.0, 0.0);
    }

    /* ---- Estimator ingest. The fusion layer calls these; each raises the
     * freshness handshake the control stages gate on. ---- */

    pub fn update_actual_horizontal_position_and_velocity(
        &mut self,
        has_valid_sensor: bool,
        x: f32,
        y: f32,
        vel_x: f32,
        vel_y: f32,
    ) {
        self.actual.pos.x = x;
        self.actual.pos.y = y;
        self.actual.vel.x = vel_x;
        self.actual.vel.y = vel_y;
        self.actual.vel_xy = (vel_x * vel_x + vel_y * vel_y).sqrt();

        self.flags.has_valid_position_sensor = has_valid_sensor;
        self.flags.horizontal_position_data_new = has_valid_sensor;
    }

    pub fn update_actual_altitude_and_climb_rate(
        &mut self,
        has_valid_sensor: bool,
        altitude: f32,
        climb_rate: f32,
    ) {
        self.actual.pos.z = altitude;
        self.actual.vel.z = climb_rate;

        self.flags.has_valid_altitude_sensor = has_valid_sensor;
        self.flags.vertical_position_data_new = has_valid_sensor;
    }

    pub fn update_actual_surface_distance(
        &mut self,
        armed: bool,
        has_valid_sensor: bool,
        surface: f32,
        surface_vel: f32,
    ) {
        self.actual.surface = surface;
        self.actual.surface_vel = surface_vel;

        // Track the lowest reading seen while armed as the ground reference.
        if armed {
            if surface > 0. {
                if self.actual.surface_min > 0. {
                    self.actual.surface_min = self.actual.surface_min.min(surface);
                } else {
                    self.actual.surface_min = surface;
                }
            }
        } else {
            self.actual.surface_min = -1.;
        }

        self.flags.has_valid_surface_sensor = has_valid_sensor;
        self.flags.surface_distance_data_new = has_valid_sensor;
    }

    pub fn update_actual_heading(&mut self, yaw_centideg: f32) {
        self.actual.set_yaw(yaw_centideg);
        self.flags.heading_data_new = true;
    }

    /* ---- Altitude cascade. ---- */

    /// Derive a new altitude target from a commanded climb rate, so the P stage
    /// yields that climb. Moves or drops the surface target per `mode`.
    pub fn update_altitude_target_from_climb_rate(&mut self, climb_rate: f32, mode: ClimbRateMode) {
        if mode == ClimbRateMode::ResetSurfaceTarget {
            self.desired.surface = -1.;
        } else if self.flags.is_terrain_follow_enabled {
            if self.actual.surface >= 0.
                && self.flags.has_valid_surface_sensor
                && mode == ClimbRateMode::UpdateSurfaceTarget
            {
                self.desired.surface = constrain(
                    self.actual.surface
                        + climb_rate / (self.pids.pos_z.kp * self.pids.surface.kp),
                    SURFACE_TARGET_MIN,
                    SURFACE_TARGET_MAX,
                );
            }
        } else {
            self.desired.surface = -1.;
        }

        self.desired.pos.z = self.actual.pos.z + climb_rate / self.pids.pos_z.kp;

        self.blackbox.target_position_z = blackbox_i16(self.desired.pos.z);
        self.blackbox.target_surface = blackbox_i16(self.desired.surface);
    }

    /// Recalculate the altitude target from the surface-offset target when
    /// terrain following. With no usable surface reading, descend slowly until
    /// the sensor reacquires.
    fn update_surface_tracking_altitude_setpoint(&mut self, delta_micros: u32) {
        if self.flags.is_terrain_follow_enabled && self.desired.surface >= 0. {
            if self.actual.surface >= 0. && self.flags.has_valid_surface_sensor {
                let target_altitude_error = self.pids.surface.apply(
                    self.desired.surface,
                    self.actual.surface,
                    us_to_s(delta_micros),
                    SURFACE_ERROR_MIN,
                    SURFACE_ERROR_MAX,
                    false,
                );
                self.desired.pos.z = self.actual.pos.z + target_altitude_error;
            } else {
                // Likely above the sensor's range; work back down into it.
                self.update_altitude_target_from_climb_rate(-20., ClimbRateMode::KeepSurfaceTarget);
            }
        }

        self.blackbox.target_position_z = blackbox_i16(self.desired.pos.z);
    }

    /// Altitude to climb rate: P only, with a hard velocity clamp and a
    /// 250 cm/s^2 slew on the resulting target.
    fn update_altitude_velocity_controller(&mut self, delta_micros: u32) {
        let altitude_error = self.desired.pos.z - self.actual.pos.z;
        let target_vel = constrain(altitude_error * self.pids.pos_z.kp, -2000., 2000.);

        let max_vel_difference = us_to_s(delta_micros) * 250.;
        self.desired.vel.z = constrain(
            target_vel,
            self.desired.vel.z - max_vel_difference,
            self.desired.vel.z + max_vel_difference,
        );

        self.blackbox.desired_velocity[2] = blackbox_i16(self.desired.vel.z);
    }

    /// Climb rate to throttle offset. Output bounds sit symmetric about hover so
    /// the integrator anti-windup has equal authority both ways.
    fn update_altitude_throttle_controller(&mut self, delta_micros: u32, cfg: &CoreConfig) {
        let thr_adjustment_min = cfg.esc_and_servo.minthrottle - cfg.nav.mc_hover_throttle;
        let thr_adjustment_max = cfg.esc_and_servo.maxthrottle - cfg.nav.mc_hover_throttle;

        let adjustment = self.pids.vel_z.apply(
            self.desired.vel.z,
            self.actual.vel.z,
            us_to_s(delta_micros),
            thr_adjustment_min as f32,
            thr_adjustment_max as f32,
            false,
        );

        let adjustment = self.althold_throttle_filter.apply(
            adjustment,
            NAV_THROTTLE_CUTOFF_FREQUENCY_HZ,
            us_to_s(delta_micros),
        );

        self.rc_adjustment.throttle =
            constrain_i32(adjustment as i32, thr_adjustment_min, thr_adjustment_max);
    }

    /// Interpret throttle deflection beyond the deadband as a climb-rate
    /// command. Returns whether the pilot is adjusting.
    pub fn adjust_altitude_from_rc_input(&mut self, rc_throttle: i32, cfg: &CoreConfig) -> bool {
        let rc_throttle_adjustment = rc_throttle - self.alt_hold_throttle_rc_zero;

        if rc_throttle_adjustment.abs() > cfg.rc_controls.alt_hold_deadband {
            // Scale so full stick reaches max_manual_climb_rate in both
            // directions, regardless of where the RC zero sits.
            let rc_climb_rate = if rc_throttle_adjustment > 0 {
                rc_throttle_adjustment as f32 * cfg.nav.max_manual_climb_rate as f32
                    / (cfg.esc_and_servo.maxthrottle - self.alt_hold_throttle_rc_zero) as f32
            } else {
                rc_throttle_adjustment as f32 * cfg.nav.max_manual_climb_rate as f32
                    / (self.alt_hold_throttle_rc_zero - cfg.esc_and_servo.minthrottle) as f32
            };

            self.update_altitude_target_from_climb_rate(
                rc_climb_rate,
                ClimbRateMode::UpdateSurfaceTarget,
            );
            self.flags.is_adjusting_altitude = true;

            true
        } else {
            // Adjusting finished - lock altitude exactly where the stick was
            // released.
            if self.flags.is_adjusting_altitude {
                self.update_altitude_target_from_climb_rate(
                    0.,
                    ClimbRateMode::UpdateSurfaceTarget,
                );
            }
            self.flags.is_adjusting_altitude = false;

            false
        }
    }

    /// Capture the throttle stick position that maps to zero climb rate, and
    /// arm the takeoff integrator guard when entering alt-hold at idle.
    pub fn setup_altitude_controller(
        &mut self,
        cfg: &CoreConfig,
        rc_command_throttle: i32,
        throttle_status: ThrottleStatus,
        throttle_mid: i32,
    ) {
        if cfg.nav.use_thr_mid_for_althold {
            self.alt_hold_throttle_rc_zero = throttle_mid;
        } else if throttle_status == ThrottleStatus::Low {
            // Can't capture an idle stick as the hover point; fall back to mid.
            self.alt_hold_throttle_rc_zero = throttle_mid;
        } else {
            self.alt_hold_throttle_rc_zero = rc_command_throttle;
        }

        // Keep the deadband satisfiable on both sides.
        self.alt_hold_throttle_rc_zero = constrain_i32(
            self.alt_hold_throttle_rc_zero,
            cfg.esc_and_servo.minthrottle + cfg.rc_controls.alt_hold_deadband + 10,
            cfg.esc_and_servo.maxthrottle - cfg.rc_controls.alt_hold_deadband - 10,
        );

        if throttle_status == ThrottleStatus::Low {
            self.prepare_for_takeoff_on_reset = true;
        }
    }

    pub fn reset_altitude_controller(&mut self) {
        self.pids.vel_z.reset();
        self.pids.surface.reset();
        self.althold_throttle_filter.reset(0.);
        // Gradually transition from the current climb.
        self.desired.vel.z = self.actual.vel.z;
        self.rc_adjustment.throttle = 0;

        // Entering alt-hold at idle throttle: seed the integrator low so the
        // craft doesn't jump on the first update.
        if self.prepare_for_takeoff_on_reset {
            self.pids.vel_z.integrator = -500.;
            self.prepare_for_takeoff_on_reset = false;
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("Altitude controller reset");
    }

    pub fn apply_altitude_controller(
        &mut self,
        rc: &mut RcCommands,
        cfg: &CoreConfig,
        current_time_us: u32,
    ) {
        let delta_micros = current_time_us.wrapping_sub(self.alt_previous_time_update_us);
        self.alt_previous_time_update_us = current_time_us;

        // If the last call was too long ago we are likely restarting the
        // controller; don't integrate across the gap.
        if delta_micros > hz_to_us(MIN_POSITION_UPDATE_RATE_HZ) {
            self.alt_previous_time_position_update_us = current_time_us;
            self.reset_altitude_controller();
            return;
        }

        if self.flags.vertical_position_data_new {
            let delta_micros_position_update =
                current_time_us.wrapping_sub(self.alt_previous_time_position_update_us);
            self.alt_previous_time_position_update_us = current_time_us;

            if delta_micros_position_update < hz_to_us(MIN_POSITION_UPDATE_RATE_HZ) {
                self.update_surface_tracking_altitude_setpoint(delta_micros_position_update);
                self.update_altitude_velocity_controller(delta_micros_position_update);
                self.update_altitude_throttle_controller(delta_micros_position_update, cfg);
            } else {
                self.reset_altitude_controller();
            }

            self.flags.vertical_position_data_consumed = true;
        }

        rc.throttle = constrain_i32(
            cfg.nav.mc_hover_throttle + self.rc_adjustment.throttle,
            cfg.esc_and_servo.minthrottle,
            cfg.esc_and_servo.maxthrottle,
        );

        // Saved for the land detector, which runs while rc_command holds raw
        // pilot input again.
        self.rc_command_adjusted_throttle = rc.throttle;
    }

    /* ---- Heading. ---- */

    /// Yaw stick beyond the deadband re-latches the heading target to wherever
    /// the craft is pointing.
    pub fn adjust_heading_from_rc_input(&mut self, rc_yaw: i32, cfg: &CoreConfig) -> bool {
        let adjusting = rc_yaw.abs() > cfg.rc_controls.pos_hold_deadband;
        if adjusting {
            self.desired.yaw = self.actual.yaw;
        }
        self.flags.is_adjusting_heading = adjusting;
        adjusting
    }

    pub fn reset_heading_controller(&mut self, rate_controller: &mut RateController) {
        rate_controller.set_mag_hold_heading(centidegrees_to_degrees(self.actual.yaw as i32));
    }

    fn apply_heading_controller(&mut self, rate_controller: &mut RateController) {
        rate_controller.set_mag_hold_heading(centidegrees_to_degrees(self.desired.yaw as i32));
    }

    /* ---- Horizontal position cascade. ---- */

    pub fn reset_position_controller(&mut self) {
        for pid in &mut self.pids.vel_xy {
            pid.reset();
        }
        self.rc_adjustment.roll = 0;
        self.rc_adjustment.pitch = 0;
        self.acc_filter_x.reset(0.);
        self.acc_filter_y.reset(0.);
        self.last_accel_target_x = 0.;
        self.last_accel_target_y = 0.;

        #[cfg(feature = "defmt")]
        defmt::debug!("Position controller reset");
    }

    /// Roll/pitch sticks beyond the deadband adjust the hold position. In
    /// cruise mode they command a body-frame velocity; in atti mode the
    /// position controller bypasses and the sticks reach the ANGLE loop
    /// directly. On release the target becomes the predicted stopping point.
    pub fn adjust_position_from_rc_input(
        &mut self,
        rc_pitch: i32,
        rc_roll: i32,
        cfg: &CoreConfig,
    ) -> bool {
        let rc_pitch_adjustment = apply_deadband(rc_pitch, cfg.rc_controls.pos_hold_deadband);
        let rc_roll_adjustment = apply_deadband(rc_roll, cfg.rc_controls.pos_hold_deadband);

        if rc_pitch_adjustment != 0 || rc_roll_adjustment != 0 {
            if cfg.nav.user_control_mode == UserControlMode::GpsCruise {
                let rc_vel_x =
                    rc_pitch_adjustment as f32 * cfg.nav.max_manual_speed as f32 / 500.;
                let rc_vel_y = rc_roll_adjustment as f32 * cfg.nav.max_manual_speed as f32 / 500.;

                // Rotate the commanded velocity from body to earth frame.
                let neu_vel_x = rc_vel_x * self.actual.cos_yaw - rc_vel_y * self.actual.sin_yaw;
                let neu_vel_y = rc_vel_x * self.actual.sin_yaw + rc_vel_y * self.actual.cos_yaw;

                // Place the target so the pos-to-vel P stage yields exactly the
                // commanded velocity.
                self.desired.pos.x = self.actual.pos.x + neu_vel_x / self.pids.pos_xy.kp;
                self.desired.pos.y = self.actual.pos.y + neu_vel_y / self.pids.pos_xy.kp;
            }

            self.flags.is_adjusting_position = true;
            true
        } else {
            if self.flags.is_adjusting_position {
                let stop = self.initial_hold_position();
                self.desired.pos.x = stop.x;
                self.desired.pos.y = stop.y;
            }
            self.flags.is_adjusting_position = false;
            false
        }
    }

    /// Predicted rest position assuming linear deceleration over the configured
    /// brake time. With zero velocity this is the current position exactly.
    pub fn initial_hold_position(&self) -> Vec3 {
        Vec3::new(
            self.actual.pos.x + self.actual.vel.x * self.pos_deceleration_time,
            self.actual.pos.y + self.actual.vel.y * self.pos_deceleration_time,
            self.actual.pos.z,
        )
    }

    /// In waypoint mode, scale velocity down while heading still disagrees with
    /// the bearing: turn first, accelerate later.
    fn velocity_heading_attenuation(&self, auto_wp: bool) -> f32 {
        if auto_wp {
            let heading_error = constrain_i32(
                wrap_18000((self.desired.yaw - self.actual.yaw) as i32),
                -9000,
                9000,
            );
            let vel_scaling = centidegrees_to_radians(heading_error as f32).cos();

            constrain(vel_scaling * vel_scaling, 0.05, 1.)
        } else {
            1.
        }
    }

    /// Expo on the velocity profile near the target; shapes how braking feels.
    fn velocity_expo_attenuation(&self, vel_total: f32, vel_max: f32) -> f32 {
        let vel_scale = constrain(vel_total / vel_max, 0.01, 1.);
        1. - self.pos_response_expo * (1. - vel_scale * vel_scale)
    }

    /// Position to velocity: P, capped at the active leg's speed, then shaped by
    /// the heading and expo attenuations.
    fn update_position_velocity_controller(&mut self, auto_wp: bool) {
        let pos_error_x = self.desired.pos.x - self.actual.pos.x;
        let pos_error_y = self.desired.pos.y - self.actual.pos.y;

        let mut new_vel_x = pos_error_x * self.pids.pos_xy.kp;
        let mut new_vel_y = pos_error_y * self.pids.pos_xy.kp;

        // Leg speed from the navigation FSM; never crawl slower than 0.5 m/s.
        let max_speed = self.active_waypoint_speed.max(50.);

        let mut new_vel_total = (new_vel_x * new_vel_x + new_vel_y * new_vel_y).sqrt();
        if new_vel_total > max_speed {
            new_vel_x = max_speed * (new_vel_x / new_vel_total);
            new_vel_y = max_speed * (new_vel_y / new_vel_total);
            new_vel_total = max_speed;
        }

        let vel_head_factor = self.velocity_heading_attenuation(auto_wp);
        let vel_expo_factor = self.velocity_expo_attenuation(new_vel_total, max_speed);

        self.desired.vel.x = new_vel_x * vel_head_factor * vel_expo_factor;
        self.desired.vel.y = new_vel_y * vel_head_factor * vel_expo_factor;

        self.blackbox.desired_velocity[0] = blackbox_i16(self.desired.vel.x);
        self.blackbox.desired_velocity[1] = blackbox_i16(self.desired.vel.y);
    }

    /// Velocity to acceleration to tilt: PID with an acceleration envelope
    /// pointed along the velocity error, a jerk limit, a smoothing LPF, then the
    /// inverse-gravity geometry into bank angles.
    fn update_position_accel_controller(
        &mut self,
        delta_micros: u32,
        max_accel_limit: f32,
        cfg: &CoreConfig,
    ) {
        let vel_error_x = self.desired.vel.x - self.actual.vel.x;
        let vel_error_y = self.desired.vel.y - self.actual.vel.y;

        // Point the per-axis acceleration envelope along the error vector so the
        // correction doesn't square off diagonally.
        let vel_error_magnitude = (vel_error_x * vel_error_x + vel_error_y * vel_error_y).sqrt();
        let (accel_limit_x, accel_limit_y) = if vel_error_magnitude > 0.1 {
            (
                max_accel_limit / vel_error_magnitude * vel_error_x.abs(),
                max_accel_limit / vel_error_magnitude * vel_error_y.abs(),
            )
        } else {
            let limit = max_accel_limit / 1.414213;
            (limit, limit)
        };

        // Jerk limit. Keeps the commanded tilt within what the LEVEL and RATE
        // loops can follow without saturating.
        let max_accel_change = us_to_s(delta_micros) * 1700.;
        let accel_limit_x_min = constrain(
            self.last_accel_target_x - max_accel_change,
            -accel_limit_x,
            accel_limit_x,
        );
        let accel_limit_x_max = constrain(
            self.last_accel_target_x + max_accel_change,
            -accel_limit_x,
            accel_limit_x,
        );
        let accel_limit_y_min = constrain(
            self.last_accel_target_y - max_accel_change,
            -accel_limit_y,
            accel_limit_y,
        );
        let accel_limit_y_max = constrain(
            self.last_accel_target_y + max_accel_change,
            -accel_limit_y,
            accel_limit_y,
        );

        // The pre-computed envelope plus the PID's own output limiting guarantee
        // the result stays within max_accel_limit.
        let new_accel_x = self.pids.vel_xy[0].apply(
            self.desired.vel.x,
            self.actual.vel.x,
            us_to_s(delta_micros),
            accel_limit_x_min,
            accel_limit_x_max,
            false,
        );
        let new_accel_y = self.pids.vel_xy[1].apply(
            self.desired.vel.y,
            self.actual.vel.y,
            us_to_s(delta_micros),
            accel_limit_y_min,
            accel_limit_y_max,
            false,
        );

        self.last_accel_target_x = new_accel_x;
        self.last_accel_target_y = new_accel_y;

        let accel_n = self.acc_filter_x.apply(
            new_accel_x,
            NAV_ACCEL_CUTOFF_FREQUENCY_HZ,
            us_to_s(delta_micros),
        );
        let accel_e = self.acc_filter_y.apply(
            new_accel_y,
            NAV_ACCEL_CUTOFF_FREQUENCY_HZ,
            us_to_s(delta_micros),
        );

        // Rotate the north/east acceleration target into the body frame.
        let accel_forward = accel_n * self.actual.cos_yaw + accel_e * self.actual.sin_yaw;
        let accel_right = -accel_n * self.actual.sin_yaw + accel_e * self.actual.cos_yaw;

        // Banking angles that produce those accelerations at 1 g of thrust.
        let desired_pitch = accel_forward.atan2(GRAVITY_CMSS);
        let desired_roll = (accel_right * desired_pitch.cos()).atan2(GRAVITY_CMSS);

        let max_bank_angle = degrees_to_decidegrees(cfg.nav.mc_max_bank_angle);
        self.rc_adjustment.roll = constrain_i32(
            radians_to_decidegrees(desired_roll) as i32,
            -max_bank_angle,
            max_bank_angle,
        );
        self.rc_adjustment.pitch = constrain_i32(
            radians_to_decidegrees(desired_pitch) as i32,
            -max_bank_angle,
            max_bank_angle,
        );
    }

    pub fn apply_position_controller(
        &mut self,
        rc: &mut RcCommands,
        cfg: &CoreConfig,
        current_time_us: u32,
        auto_wp: bool,
    ) {
        let delta_micros = current_time_us.wrapping_sub(self.pos_previous_time_update_us);
        self.pos_previous_time_update_us = current_time_us;

        // In atti mode the pilot's sticks pass through to the ANGLE loop while
        // adjusting; we keep running the freshness handshake underneath.
        let mut bypass_position_controller = cfg.nav.user_control_mode == UserControlMode::GpsAtti
            && self.flags.is_adjusting_position;

        if delta_micros > hz_to_us(MIN_POSITION_UPDATE_RATE_HZ) {
            self.pos_previous_time_position_update_us = current_time_us;
            self.reset_position_controller();
            return;
        }

        if self.flags.has_valid_position_sensor {
            if self.flags.horizontal_position_data_new {
                let delta_micros_position_update =
                    current_time_us.wrapping_sub(self.pos_previous_time_position_update_us);
                self.pos_previous_time_position_update_us = current_time_us;

                if !bypass_position_controller {
                    if delta_micros_position_update < hz_to_us(MIN_POSITION_UPDATE_RATE_HZ) {
                        self.update_position_velocity_controller(auto_wp);
                        self.update_position_accel_controller(
                            delta_micros_position_update,
                            NAV_ACCELERATION_XY_MAX,
                            cfg,
                        );
                    } else {
                        self.reset_position_controller();
                    }
                }

                self.flags.horizontal_position_data_consumed = true;
            }
        } else {
            // No position fix: zero our corrections and let the pilot's sticks
            // through; the inner ANGLE loop still stabilizes.
            self.rc_adjustment.pitch = 0;
            self.rc_adjustment.roll = 0;
            bypass_position_controller = true;
        }

        if !bypass_position_controller {
            rc.pitch = angle_to_rc_command(self.rc_adjustment.pitch as f32);
            rc.roll = angle_to_rc_command(self.rc_adjustment.roll as f32);
        }
    }

    /* ---- Land detector. ---- */

    /// Touchdown heuristic, polled at RC-processing rate. All of: the craft has
    /// actually descended at some point, no vertical or horizontal motion now,
    /// commanded throttle below the fly threshold, and (when a surface sensor
    /// works) reading near the ground reference - continuously for the trigger
    /// time.
    pub fn is_landing_detected(&mut self, current_time_us: u32, cfg: &CoreConfig) -> bool {
        // Descend-stage entry starts near zero velocity; require a real descent
        // before the rest of the checks mean anything.
        if !self.has_had_some_velocity && self.actual.vel.z < -25. {
            self.has_had_some_velocity = true;
        }

        let vertical_movement = self.actual.vel.z.abs() > 25.;
        let horizontal_movement = self.actual.vel_xy > 100.;
        let minimal_thrust = self.rc_command_adjusted_throttle < cfg.nav.mc_min_fly_throttle;

        let mut possible_landing = self.has_had_some_velocity
            && minimal_thrust
            && !vertical_movement
            && !horizontal_movement;

        // With a working surface sensor, require being within 5 cm of the lowest
        // reading seen this flight.
        if self.flags.has_valid_surface_sensor
            && self.actual.surface >= 0.
            && self.actual.surface_min >= 0.
        {
            possible_landing =
                possible_landing && self.actual.surface <= self.actual.surface_min + 5.;
        }

        if !possible_landing {
            self.landing_timer_us = current_time_us;
            false
        } else {
            current_time_us.wrapping_sub(self.landing_timer_us)
                > LAND_DETECTOR_TRIGGER_TIME_MS * 1000
        }
    }

    pub fn reset_landing_detector(&mut self, current_time_us: u32) {
        self.landing_timer_us = current_time_us;
        self.has_had_some_velocity = false;
    }

    /* ---- Emergency descent. ---- */

    /// Level the craft and descend open- or closed-loop depending on what
    /// sensors are left.
    fn apply_emergency_landing_controller(
        &mut self,
        rc: &mut RcCommands,
        cfg: &CoreConfig,
        current_time_us: u32,
        failsafe_throttle: Option<i32>,
    ) {
        let delta_micros = current_time_us.wrapping_sub(self.emerg_previous_time_update_us);
        self.emerg_previous_time_update_us = current_time_us;

        // Attempt to stabilise.
        rc.roll = 0;
        rc.pitch = 0;
        rc.yaw = 0;

        if self.flags.has_valid_altitude_sensor {
            // We have an altitude reference; run the normal vertical cascade at
            // a fixed descent rate.
            if delta_micros > hz_to_us(MIN_POSITION_UPDATE_RATE_HZ) {
                self.emerg_previous_time_position_update_us = current_time_us;
                self.reset_altitude_controller();
                return;
            }

            if self.flags.vertical_position_data_new {
                let delta_micros_position_update =
                    current_time_us.wrapping_sub(self.emerg_previous_time_position_update_us);
                self.emerg_previous_time_position_update_us = current_time_us;

                if delta_micros_position_update < hz_to_us(MIN_POSITION_UPDATE_RATE_HZ) {
                    self.update_altitude_target_from_climb_rate(
                        -(cfg.nav.emerg_descent_rate as f32),
                        ClimbRateMode::ResetSurfaceTarget,
                    );
                    self.update_altitude_velocity_controller(delta_micros_position_update);
                    self.update_altitude_throttle_controller(delta_micros_position_update, cfg);
                } else {
                    self.reset_altitude_controller();
                }

                self.flags.vertical_position_data_consumed = true;
            }

            rc.throttle = constrain_i32(
                cfg.nav.mc_hover_throttle + self.rc_adjustment.throttle,
                cfg.esc_and_servo.minthrottle,
                cfg.esc_and_servo.maxthrottle,
            );
        } else {
            // Sensors have gone haywire; attempt to land regardless on the
            // failsafe throttle.
            rc.throttle = failsafe_throttle.unwrap_or(cfg.esc_and_servo.minthrottle);
        }
    }

    /* ---- Dispatch. ---- */

    /// Run whichever controllers the navigation FSM's flag vector selects this
    /// tick. Emergency descent is exclusive; the others run independently.
    pub fn apply_navigation_controller(
        &mut self,
        nav_flags: NavStateFlags,
        rate_controller: &mut RateController,
        rc: &mut RcCommands,
        cfg: &CoreConfig,
        current_time_us: u32,
        failsafe_throttle: Option<i32>,
    ) {
        if nav_flags.ctl_emerg != self.emerg_engaged {
            self.emerg_engaged = nav_flags.ctl_emerg;
            #[cfg(feature = "defmt")]
            defmt::warn!("Emergency descent engaged: {}", self.emerg_engaged);
        }

        if nav_flags.ctl_emerg {
            self.apply_emergency_landing_controller(rc, cfg, current_time_us, failsafe_throttle);
        } else {
            if nav_flags.ctl_alt {
                self.apply_altitude_controller(rc, cfg, current_time_us);
            }

            if nav_flags.ctl_pos {
                self.apply_position_controller(rc, cfg, current_time_us, nav_flags.auto_wp);
            }

            if nav_flags.ctl_yaw {
                self.apply_heading_controller(rate_controller);
            }
        }

        // Complete the freshness handshake: consumed data is no longer new.
        if self.flags.vertical_position_data_consumed {
            self.flags.vertical_position_data_new = false;
            self.flags.vertical_position_data_consumed = false;
        }
        if self.flags.horizontal_position_data_consumed {
            self.flags.horizontal_position_data_new = false;
            self.flags.horizontal_position_data_consumed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;

    // 100 Hz position loop for the scenario tests.
    const TICK_US: u32 = 10_000;
    const TICK_S: f32 = 0.01;

    fn alt_flags() -> NavStateFlags {
        NavStateFlags {
            ctl_alt: true,
            ..Default::default()
        }
    }

    #[test]
    fn altitude_step_ramps_and_settles() {
        let mut cfg = CoreConfig::default();
        cfg.pid_profile.p[PidIndex::Alt as usize] = 100; // kP = 1.0

        let mut nav = NavController::new(&cfg);
        let mut rate = RateController::default();
        let mut rc = RcCommands::default();

        let mut now = TICK_US;
        let mut actual_z = 0.;
        let mut actual_vz = 0.;

        // Prime one tick so the stage timers line up, then command +100 cm.
        nav.update_actual_altitude_and_climb_rate(true, actual_z, actual_vz);
        nav.apply_navigation_controller(alt_flags(), &mut rate, &mut rc, &cfg, now, None);
        nav.desired.pos.z = 100.;

        let mut prev_vel = nav.desired.vel.z;
        for _ in 0..800 {
            now += TICK_US;
            nav.update_actual_altitude_and_climb_rate(true, actual_z, actual_vz);
            nav.apply_navigation_controller(alt_flags(), &mut rate, &mut rc, &cfg, now, None);

            let vel = nav.desired.vel.z;
            // Climb-rate target slews at no more than 250 cm/s^2...
            assert!((vel - prev_vel).abs() <= 250. * TICK_S + 1e-3);
            // ...and saturates at min(error * kP, 2000).
            assert!(vel <= 100. + 1e-3);
            prev_vel = vel;

            // Throttle command always stays inside the ESC range.
            assert!(rc.throttle >= cfg.esc_and_servo.minthrottle);
            assert!(rc.throttle <= cfg.esc_and_servo.maxthrottle);

            // Perfect plant: the craft follows the commanded climb exactly.
            actual_vz = vel;
            actual_z += actual_vz * TICK_S;
        }

        assert!((100. - actual_z).abs() < 1.);
    }

    #[test]
    fn stale_tick_resets_bumplessly() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);
        let mut rate = RateController::default();
        let mut rc = RcCommands::default();

        let mut now = TICK_US;
        nav.update_actual_altitude_and_climb_rate(true, 500., 37.);
        nav.apply_navigation_controller(alt_flags(), &mut rate, &mut rc, &cfg, now, None);

        // Half a second of silence, then a fresh sample: the controller must
        // seed the climb target from the measured climb, not spike a derivative.
        now += 500_000;
        nav.update_actual_altitude_and_climb_rate(true, 500., 37.);
        nav.apply_navigation_controller(alt_flags(), &mut rate, &mut rc, &cfg, now, None);

        assert_eq!(nav.desired.vel.z, 37.);
        assert_eq!(nav.rc_adjustment.throttle, 0);
    }

    #[test]
    fn takeoff_guard_seeds_integrator() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);

        nav.setup_altitude_controller(&cfg, 1020, ThrottleStatus::Low, 1500);
        // Idle stick can't be the hover reference; mid is used instead.
        assert_eq!(nav.alt_hold_throttle_rc_zero, 1500);
        assert!(nav.prepare_for_takeoff_on_reset);

        nav.reset_altitude_controller();
        assert_eq!(nav.pids.vel_z.integrator, -500.);
        assert!(!nav.prepare_for_takeoff_on_reset);

        // A second reset doesn't seed again.
        nav.reset_altitude_controller();
        assert_eq!(nav.pids.vel_z.integrator, 0.);
    }

    #[test]
    fn alt_hold_rc_zero_leaves_room_for_the_deadband() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);

        nav.setup_altitude_controller(&cfg, 1840, ThrottleStatus::High, 1500);
        assert_eq!(nav.alt_hold_throttle_rc_zero, 1850 - 50 - 10);

        nav.setup_altitude_controller(&cfg, 1160, ThrottleStatus::High, 1500);
        assert_eq!(nav.alt_hold_throttle_rc_zero, 1150 + 50 + 10);
    }

    #[test]
    fn manual_climb_scaling_is_asymmetric() {
        let cfg = CoreConfig::default(); // kP_posZ = 0.5, climb limit 200 cm/s
        let mut nav = NavController::new(&cfg);

        nav.actual.pos.z = 1000.;
        nav.setup_altitude_controller(&cfg, 1600, ThrottleStatus::High, 1500);
        assert_eq!(nav.alt_hold_throttle_rc_zero, 1600);

        // Full stick up: 250 µs of travel maps to the full 200 cm/s.
        assert!(nav.adjust_altitude_from_rc_input(1850, &cfg));
        assert!((nav.desired.pos.z - (1000. + 200. / 0.5)).abs() < 1e-3);
        assert!(nav.flags.is_adjusting_altitude);

        // Full stick down: 450 µs of travel maps to the same 200 cm/s.
        assert!(nav.adjust_altitude_from_rc_input(1150, &cfg));
        assert!((nav.desired.pos.z - (1000. - 200. / 0.5)).abs() < 1e-3);

        // Release into the deadband: lock the current altitude.
        assert!(!nav.adjust_altitude_from_rc_input(1610, &cfg));
        assert_eq!(nav.desired.pos.z, 1000.);
        assert!(!nav.flags.is_adjusting_altitude);
    }

    #[test]
    fn land_detector_requires_sustained_stillness() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);

        nav.rc_command_adjusted_throttle = 1100; // below mc_min_fly_throttle

        // Committed descent first; detector must stay quiet while moving.
        let mut now = 1_000_000;
        nav.actual.vel.z = -30.;
        for _ in 0..10 {
            assert!(!nav.is_landing_detected(now, &cfg));
            now += 100_000;
        }
        let touchdown = now;

        // Stationary now. Latch only after the full trigger time.
        nav.actual.vel.z = 0.;
        nav.actual.vel_xy = 0.;
        assert!(!nav.is_landing_detected(touchdown, &cfg));
        assert!(!nav.is_landing_detected(touchdown + 1_900_000, &cfg));
        assert!(nav.is_landing_detected(touchdown + 2_000_001, &cfg));

        // Any violation restarts the timer.
        nav.rc_command_adjusted_throttle = 1300;
        assert!(!nav.is_landing_detected(touchdown + 2_100_000, &cfg));
        nav.rc_command_adjusted_throttle = 1100;
        assert!(!nav.is_landing_detected(touchdown + 2_200_000, &cfg));
    }

    #[test]
    fn land_detector_without_descent_never_latches() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);

        nav.rc_command_adjusted_throttle = 1100;
        nav.actual.vel.z = 0.;
        nav.actual.vel_xy = 0.;

        assert!(!nav.is_landing_detected(0, &cfg));
        assert!(!nav.is_landing_detected(10_000_000, &cfg));
    }

    #[test]
    fn land_detector_surface_gate() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);

        nav.rc_command_adjusted_throttle = 1100;
        nav.has_had_some_velocity = true;
        nav.actual.vel.z = 0.;
        nav.actual.vel_xy = 0.;
        nav.flags.has_valid_surface_sensor = true;
        nav.actual.surface_min = 1.;

        // Hovering 10 cm above the ground reference: not landed.
        nav.actual.surface = 10.;
        assert!(!nav.is_landing_detected(1_000_000, &cfg));

        // Within 5 cm of the reference: timer runs.
        nav.actual.surface = 3.;
        assert!(!nav.is_landing_detected(1_100_000, &cfg));
        assert!(nav.is_landing_detected(3_100_001, &cfg));
    }

    #[test]
    fn stopping_point_is_current_position_at_rest() {
        let cfg = CoreConfig::default(); // I8[POS] = 120 -> 1.2 s brake time
        let mut nav = NavController::new(&cfg);

        nav.actual.pos = Vec3::new(10., 20., 30.);

        let hold = nav.initial_hold_position();
        assert_eq!(hold.x, 10.);
        assert_eq!(hold.y, 20.);

        nav.actual.vel.x = 100.;
        nav.actual.vel.y = -50.;
        let hold = nav.initial_hold_position();
        assert!((hold.x - (10. + 100. * 1.2)).abs() < 1e-4);
        assert!((hold.y - (20. - 50. * 1.2)).abs() < 1e-4);
    }

    #[test]
    fn wind_disturbance_tilts_against_drift() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);
        let mut rc = RcCommands::default();

        nav.update_actual_heading(0.);

        let mut now = 0;
        let mut prev_accel = nav.last_accel_target_x;
        for _ in 0..50 {
            now += 100_000; // 10 Hz position updates
            nav.update_actual_horizontal_position_and_velocity(true, 0., 0., 50., 0.);
            nav.apply_position_controller(&mut rc, &cfg, now, false);

            // Bank setpoints bounded by the configured max bank (decidegrees).
            assert!(nav.rc_adjustment.pitch.abs() <= cfg.nav.mc_max_bank_angle * 10);
            assert!(nav.rc_adjustment.roll.abs() <= cfg.nav.mc_max_bank_angle * 10);

            // Acceleration target is jerk-limited to 1700 cm/s^3.
            assert!((nav.last_accel_target_x - prev_accel).abs() <= 1700. * 0.1 + 1e-3);
            prev_accel = nav.last_accel_target_x;
        }

        // Drifting north at +50 cm/s with a fixed target: the controller pitches
        // to decelerate, i.e. a negative (nose-up-against-motion) setpoint.
        assert!(nav.rc_adjustment.pitch < 0);
        assert!(rc.pitch < 0);
    }

    #[test]
    fn position_fix_loss_bypasses_to_pilot() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);
        let mut rc = RcCommands {
            pitch: 77,
            roll: -33,
            ..Default::default()
        };

        nav.rc_adjustment.pitch = 150;
        nav.rc_adjustment.roll = 150;
        nav.update_actual_horizontal_position_and_velocity(false, 0., 0., 0., 0.);
        nav.apply_position_controller(&mut rc, &cfg, TICK_US, false);

        assert_eq!(nav.rc_adjustment.pitch, 0);
        assert_eq!(nav.rc_adjustment.roll, 0);
        // Pilot sticks untouched; the ANGLE loop consumes them directly.
        assert_eq!(rc.pitch, 77);
        assert_eq!(rc.roll, -33);
    }

    #[test]
    fn atti_mode_adjusting_bypasses_position_controller() {
        let cfg = CoreConfig::default(); // GpsAtti
        let mut nav = NavController::new(&cfg);
        let mut rc = RcCommands {
            pitch: 77,
            ..Default::default()
        };

        nav.update_actual_horizontal_position_and_velocity(true, 0., 0., 0., 0.);
        assert!(nav.adjust_position_from_rc_input(200, 0, &cfg));

        nav.apply_position_controller(&mut rc, &cfg, TICK_US, false);
        assert_eq!(rc.pitch, 77);
        // The freshness handshake still completes underneath the bypass.
        assert!(nav.flags.horizontal_position_data_consumed);
    }

    #[test]
    fn cruise_mode_sticks_command_velocity() {
        let mut cfg = CoreConfig::default();
        cfg.nav.user_control_mode = UserControlMode::GpsCruise;

        let mut nav = NavController::new(&cfg);
        nav.update_actual_heading(0.);

        // 270 µs of pitch is 250 past the deadband; full scale is 500 µs to
        // max_manual_speed, and the target leads by v / kP.
        assert!(nav.adjust_position_from_rc_input(270, 0, &cfg));
        let expected_vel = 250. * 500. / 500.;
        assert!((nav.desired.pos.x - expected_vel / 0.65).abs() < 1e-2);
        assert_eq!(nav.desired.pos.y, 0.);

        // Release while still moving: hold point leads by the stopping distance.
        nav.actual.vel.x = 100.;
        assert!(!nav.adjust_position_from_rc_input(0, 0, &cfg));
        assert!((nav.desired.pos.x - 100. * 1.2).abs() < 1e-4);
    }

    #[test]
    fn emergency_without_altitude_sensor_goes_open_loop() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);
        let mut rate = RateController::default();
        let mut rc = RcCommands {
            roll: 100,
            pitch: -100,
            yaw: 50,
            throttle: 1700,
        };

        let flags = NavStateFlags {
            ctl_emerg: true,
            ..Default::default()
        };

        nav.apply_navigation_controller(flags, &mut rate, &mut rc, &cfg, TICK_US, Some(1300));
        assert_eq!((rc.roll, rc.pitch, rc.yaw), (0, 0, 0));
        assert_eq!(rc.throttle, 1300);

        // No failsafe config either: idle the motors.
        nav.apply_navigation_controller(flags, &mut rate, &mut rc, &cfg, 2 * TICK_US, None);
        assert_eq!(rc.throttle, cfg.esc_and_servo.minthrottle);
    }

    #[test]
    fn emergency_descends_on_the_altitude_cascade() {
        let cfg = CoreConfig::default(); // kP_posZ = 0.5, descent 500 cm/s
        let mut nav = NavController::new(&cfg);
        let mut rate = RateController::default();
        let mut rc = RcCommands::default();

        nav.desired.surface = 15.;
        nav.update_actual_altitude_and_climb_rate(true, 1000., 0.);

        let flags = NavStateFlags {
            ctl_emerg: true,
            ..Default::default()
        };
        nav.apply_navigation_controller(flags, &mut rate, &mut rc, &cfg, TICK_US, None);

        // Altitude target leads by -descent_rate / kP; surface tracking drops.
        assert_eq!(nav.desired.pos.z, 1000. - 500. / 0.5);
        assert_eq!(nav.desired.surface, -1.);
        // Climb target is slew-limited from 0 on the first update.
        assert!((nav.desired.vel.z + 250. * TICK_S).abs() < 1e-3);
        assert!(rc.throttle >= cfg.esc_and_servo.minthrottle);
        assert!(rc.throttle <= cfg.esc_and_servo.maxthrottle);
    }

    #[test]
    fn surface_tracking_prefers_overshoot() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);

        nav.flags.is_terrain_follow_enabled = true;
        nav.update_actual_surface_distance(true, true, 25., 0.);
        nav.actual.pos.z = 100.;
        nav.desired.surface = 20.;

        // 5 cm too high: correction clamps at -5 on the low side.
        nav.update_surface_tracking_altitude_setpoint(100_000);
        assert_eq!(nav.desired.pos.z, 95.);

        // Far too low: correction clamps at +35 on the high side.
        nav.pids.surface.reset();
        nav.desired.surface = 40.;
        nav.update_actual_surface_distance(true, true, 2., 0.);
        nav.update_surface_tracking_altitude_setpoint(100_000);
        assert_eq!(nav.desired.pos.z, 135.);
    }

    #[test]
    fn surface_loss_forces_slow_descent() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);

        nav.flags.is_terrain_follow_enabled = true;
        nav.actual.pos.z = 100.;
        nav.desired.surface = 20.;
        nav.update_actual_surface_distance(true, false, -1., 0.);

        nav.update_surface_tracking_altitude_setpoint(100_000);

        // -20 cm/s through the climb-rate path: target drops by 20 / kP_posZ,
        // and the surface target survives for reacquisition.
        assert_eq!(nav.desired.pos.z, 100. - 20. / 0.5);
        assert_eq!(nav.desired.surface, 20.);
    }

    #[test]
    fn climb_rate_target_moves_surface_setpoint_within_range() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);

        nav.flags.is_terrain_follow_enabled = true;
        nav.update_actual_surface_distance(true, true, 30., 0.);
        nav.actual.pos.z = 100.;

        // kP_posZ * kP_surface = 1.0; a big climb saturates at the sensor's
        // trustworthy ceiling.
        nav.update_altitude_target_from_climb_rate(100., ClimbRateMode::UpdateSurfaceTarget);
        assert_eq!(nav.desired.surface, SURFACE_TARGET_MAX);

        nav.update_altitude_target_from_climb_rate(-100., ClimbRateMode::UpdateSurfaceTarget);
        assert_eq!(nav.desired.surface, SURFACE_TARGET_MIN);

        // Without terrain following the surface target stays dropped.
        nav.flags.is_terrain_follow_enabled = false;
        nav.update_altitude_target_from_climb_rate(50., ClimbRateMode::UpdateSurfaceTarget);
        assert_eq!(nav.desired.surface, -1.);
    }

    #[test]
    fn heading_dispatch_feeds_mag_hold_target() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);
        let mut rate = RateController::default();
        let mut rc = RcCommands::default();

        nav.desired.yaw = 9000.;
        let flags = NavStateFlags {
            ctl_yaw: true,
            ..Default::default()
        };
        nav.apply_navigation_controller(flags, &mut rate, &mut rc, &cfg, TICK_US, None);
        assert_eq!(rate.mag_hold_heading(), 90);

        nav.update_actual_heading(27_000.);
        nav.reset_heading_controller(&mut rate);
        assert_eq!(rate.mag_hold_heading(), 270);
    }

    #[test]
    fn yaw_stick_relatches_heading_target() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);

        nav.update_actual_heading(12_345.);
        nav.desired.yaw = 0.;

        assert!(nav.adjust_heading_from_rc_input(100, &cfg));
        assert_eq!(nav.desired.yaw, 12_345.);
        assert!(nav.flags.is_adjusting_heading);

        nav.desired.yaw = 0.;
        assert!(!nav.adjust_heading_from_rc_input(5, &cfg));
        assert_eq!(nav.desired.yaw, 0.);
    }

    #[test]
    fn waypoint_heading_error_attenuates_velocity() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);

        nav.update_actual_heading(0.);

        nav.desired.yaw = 0.;
        assert_eq!(nav.velocity_heading_attenuation(true), 1.);

        // 90 degrees off the bearing: floor of 0.05.
        nav.desired.yaw = 9000.;
        assert_eq!(nav.velocity_heading_attenuation(true), 0.05);

        // 45 degrees: cos^2 = 0.5.
        nav.desired.yaw = 4500.;
        assert!((nav.velocity_heading_attenuation(true) - 0.5).abs() < 1e-3);

        // Not flying a waypoint leg: no attenuation regardless of heading.
        assert_eq!(nav.velocity_heading_attenuation(false), 1.);
    }

    #[test]
    fn velocity_expo_shapes_the_slow_end() {
        let cfg = CoreConfig::default(); // D8[POS] = 10 -> expo 0.1
        let nav = NavController::new(&cfg);

        assert_eq!(nav.velocity_expo_attenuation(500., 500.), 1.);

        let crawling = nav.velocity_expo_attenuation(0., 500.);
        assert!(crawling > 0.89 && crawling < 0.91);
    }

    #[test]
    fn nav_blackbox_values_clamp_to_i16() {
        let cfg = CoreConfig::default();
        let mut nav = NavController::new(&cfg);

        nav.actual.pos.z = 50_000.;
        nav.update_altitude_target_from_climb_rate(0., ClimbRateMode::ResetSurfaceTarget);
        assert_eq!(nav.blackbox.target_position_z, 32_767);
    }

    #[test]
    fn nav_pid_disables_integrator_without_p() {
        let pid = NavPid::new(0., 5., 1.);
        assert_eq!(pid.ki, 0.);
        assert_eq!(pid.kt, 0.);

        let pid = NavPid::new(1.8, 0.15, 1.);
        // kT = 2 / (Ti + Td) with Ti = 12, Td = 0.556.
        assert!((pid.kt - 2. / (12. + 1. / 1.8)).abs() < 1e-5);
    }

    #[test]
    fn nav_pid_back_calculation_unwinds_saturation() {
        let mut pid = NavPid::new(1., 1., 0.);

        // Saturate hard for a while.
        for _ in 0..100 {
            pid.apply(100., 0., 0.01, -10., 10., false);
        }
        // Back-calculation keeps the integrator from running away.
        assert!(pid.integrator < 20.);

        // On reversal the output leaves the rail immediately-ish rather than
        // bleeding off a huge accumulated term.
        let out = pid.apply(-10., 0., 0.01, -10., 10., false);
        assert!(out < 10.);
    }
}
