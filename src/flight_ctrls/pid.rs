//! This module contains the inner attitude/rate control loop: a gyro-driven
//! three-axis cascaded PID with self-leveling (ANGLE), attenuated self-leveling
//! (HORIZON), a heading-lock integrator, the magnetometer heading-hold P
//! controller, throttle-based gain attenuation, and back-calculation anti-windup.
//!
//! Runs once per gyro period. The outer navigation loops feed it through
//! `RcCommands`; its output is the per-axis correction set handed to the mixer.

use num_traits::float::Float;

use crate::{
    config::{ControlRateConfig, CoreConfig, PidIndex, RxConfig},
    control_interface::{stick_deflection, RcCommands, RcData},
    filters::{FirFilter, Pt1Filter},
    flight_ctrls::{FlightAxis, FLIGHT_AXES, GYRO_SATURATION_LIMIT, PID_MAX_OUTPUT},
    params::Attitude,
    state::{FlightModes, NavHeadingControlState, StateFlags},
    util::{constrain, decidegrees_to_degrees, wrap_180},
};

const FP_PID_RATE_P_MULTIPLIER: f32 = 40.;
const FP_PID_RATE_I_MULTIPLIER: f32 = 10.;
const FP_PID_RATE_D_MULTIPLIER: f32 = 4000.;
const FP_PID_LEVEL_P_MULTIPLIER: f32 = 40.;
const FP_PID_YAWHOLD_P_MULTIPLIER: f32 = 80.;

// Below this fraction of the throttle range, kD is progressively reduced to calm
// the D term at low prop wash.
const KD_ATTENUATION_BREAK: f32 = 0.25;

const MAG_HOLD_ERROR_LPF_FREQ: f32 = 2.;

// 5-point noise-robust differentiator (one-sided), Pavel Holoborodko.
// http://www.holoborodko.com/pavel/numerical-methods/numerical-derivative/smooth-low-noise-differentiators/
const DTERM_BUF_COUNT: usize = 5;
const DTERM_COEFFS: [f32; DTERM_BUF_COUNT] = [5., 2., -8., -2., 3.];

/// Per-axis controller state. Gains are refreshed each tick from the profile
/// (TPA applies per-throttle), so they live here rather than in config.
#[derive(Default)]
struct PidState {
    kp: f32,
    ki: f32,
    kd: f32,
    /// Back-calculation gain; 0 disables tracking.
    kt: f32,

    gyro_rate: f32,
    rate_target: f32,

    dterm_buf: FirFilter<DTERM_BUF_COUNT>,

    // Rate integrator, and the envelope it is held to while motors saturate.
    error_gyro_i: f32,
    error_gyro_i_limit: f32,

    // Heading-lock accumulator; only meaningful on yaw.
    axis_lock_accum: f32,

    angle_filter: Pt1Filter,
    pterm_lpf: Pt1Filter,
    dterm_lpf: Pt1Filter,
}

/// The special-casing that distinguishes the axes, gathered into one record so a
/// single rate-PID routine serves all three.
#[derive(Clone, Copy, Default)]
struct AxisRateTraits {
    /// Clamp on the raw P contribution, if the mixer has enough motors to
    /// benefit from it.
    p_limit: Option<f32>,
    /// Extra P-term low-pass cutoff, Hz.
    pterm_lpf_hz: Option<f32>,
    /// D-term low-pass cutoff, Hz.
    dterm_lpf_hz: Option<f32>,
    /// False when the profile zeroes D for this axis.
    use_dterm: bool,
}

#[derive(Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MagHoldState {
    Disabled,
    /// Mag hold inactive; keep latching the current heading as the target.
    UpdateHeading,
    Enabled,
}

/// Magnetometer heading-hold P controller. Returns a yaw rate target for the
/// rate loop; decoupled from the manual yaw rate settings.
#[derive(Default)]
struct MagHold {
    /// Degrees.
    target_heading: i32,
    rate_filter: Pt1Filter,
}

/// Everything the inner loop reads this tick. All references point at state
/// owned by the scheduler; the loop holds nothing across calls except its own
/// controller state.
pub struct RateLoopInputs<'a> {
    pub rc_command: &'a RcCommands,
    pub rc_data: &'a RcData,
    pub attitude: &'a Attitude,
    /// Body rotation rates, dps, scaled from the gyro by the sensor driver.
    pub gyro_rate: [f32; 3],
    pub modes: FlightModes,
    pub flags: StateFlags,
    pub heading_control: NavHeadingControlState,
    pub has_mag: bool,
}

/// Diagnostic terms for an external blackbox sink; refreshed every tick.
#[derive(Clone, Copy, Default)]
pub struct RateLoopBlackbox {
    pub p: [i32; 3],
    pub i: [i32; 3],
    pub d: [i32; 3],
    pub setpoint: [i32; 3],
}

/// The inner-loop controller context. Owned by the scheduler; one `update` per
/// gyro tick.
#[derive(Default)]
pub struct RateController {
    state: [PidState; 3],
    mag_hold: MagHold,
    /// Mixer input, one correction per axis, within +/-[`PID_MAX_OUTPUT`].
    pub axis_pid: [i16; 3],
    pub blackbox: RateLoopBlackbox,
}

/// Stick-to-angle mapping for ANGLE/HORIZON: full deflection (500) commands
/// 1000 decidegrees before the inclination clamp.
pub fn rc_command_to_angle(stick: i32) -> f32 {
    stick as f32 * 2.
}

/// Inverse of [`rc_command_to_angle`]; used when navigation writes tilt
/// setpoints back into the command set.
pub fn angle_to_rc_command(angle_decidegrees: f32) -> i32 {
    (angle_decidegrees / 2.) as i32
}

/// Stick-to-rate mapping: full deflection spans 200 dps at rate setting 0 up to
/// 1200 dps at rate 100.
pub fn rc_command_to_rate(stick: i32, rate: u8) -> f32 {
    ((rate as i32 + 20) * stick) as f32 / 50.
}

pub fn rate_to_rc_command(rate_dps: f32, rate: u8) -> f32 {
    (rate_dps * 50.) / (rate as f32 + 20.)
}

/// TPA factor: 1.0 below the breakpoint, sliding down to `1 - dyn_thr_pid/100`
/// at 2000 µs and above.
fn thrust_pid_attenuation(control_rate: &ControlRateConfig, raw_throttle: i32) -> f32 {
    if control_rate.dyn_thr_pid == 0 || raw_throttle < control_rate.tpa_breakpoint as i32 {
        1.
    } else if raw_throttle < 2000 {
        (100
            - control_rate.dyn_thr_pid as i32 * (raw_throttle - control_rate.tpa_breakpoint as i32)
                / (2000 - control_rate.tpa_breakpoint as i32)) as f32
            / 100.
    } else {
        (100 - control_rate.dyn_thr_pid as i32) as f32 / 100.
    }
}

/// Additional throttle-based kD attenuation (kudos to RS2K & Raceflight).
fn kd_attenuation(rx: &RxConfig, raw_throttle: i32) -> f32 {
    let rel_throttle = constrain(
        (raw_throttle - rx.mincheck) as f32 / (rx.maxcheck - rx.mincheck) as f32,
        0.,
        1.,
    );

    if rel_throttle < KD_ATTENUATION_BREAK {
        constrain((rel_throttle / KD_ATTENUATION_BREAK) + 0.50, 0., 1.)
    } else {
        1.
    }
}

/// Progressively turn off self-leveling as the stick is banged over: 1 at center
/// stick, decaying to 0 by full deflection, with D8[LEVEL] setting how early the
/// transition completes.
fn horizon_level_strength(cfg: &CoreConfig, rc_data: &RcData) -> f32 {
    let stick_pos_ail = stick_deflection(rc_data.roll, cfg.rx.midrc);
    let stick_pos_ele = stick_deflection(rc_data.pitch, cfg.rx.midrc);
    let most_deflected = stick_pos_ail.max(stick_pos_ele);

    let horizon_level_strength = (500 - most_deflected) as f32 / 500.;

    let transition = cfg.pid_profile.d[PidIndex::Level as usize];
    if transition == 0 {
        0.
    } else {
        constrain(
            (horizon_level_strength - 1.) * (100. / transition as f32) + 1.,
            0.,
            1.,
        )
    }
}

impl RateController {
    /// Clear the rate integrators, their envelopes, and the heading-lock
    /// accumulator. Called on disarm and by nav-controller resets.
    pub fn reset_error_accumulators(&mut self) {
        for axis in &mut self.state {
            axis.error_gyro_i = 0.;
            axis.error_gyro_i_limit = 0.;
        }

        self.state[FlightAxis::Yaw as usize].axis_lock_accum = 0.;
    }

    /// Latch a new mag-hold target heading, degrees.
    pub fn set_mag_hold_heading(&mut self, heading: i32) {
        self.mag_hold.target_heading = heading;
    }

    pub fn mag_hold_heading(&self) -> i32 {
        self.mag_hold.target_heading
    }

    /// Refresh per-axis gains from the profile: base scaling, TPA and kD
    /// attenuation on roll/pitch, and the back-calculation gain. Runs every tick
    /// since TPA follows the raw throttle.
    pub fn update_coefficients(&mut self, cfg: &CoreConfig, rc_data: &RcData) {
        let tpa_factor = thrust_pid_attenuation(&cfg.control_rate, rc_data.throttle);
        let kd_attenuation_factor = kd_attenuation(&cfg.rx, rc_data.throttle);

        for axis in FLIGHT_AXES {
            let i = axis as usize;
            let state = &mut self.state[i];

            state.kp = cfg.pid_profile.p[i] as f32 / FP_PID_RATE_P_MULTIPLIER;
            state.ki = cfg.pid_profile.i[i] as f32 / FP_PID_RATE_I_MULTIPLIER;
            state.kd = cfg.pid_profile.d[i] as f32 / FP_PID_RATE_D_MULTIPLIER;

            // Yaw is exempt: prop wash doesn't couple into it the same way.
            if axis != FlightAxis::Yaw {
                state.kp *= tpa_factor;
                state.kd *= tpa_factor * kd_attenuation_factor;
            }

            if cfg.pid_profile.p[i] != 0 && cfg.pid_profile.i[i] != 0 {
                state.kt = 2. / ((state.kp / state.ki) + (state.kd / state.kp));
            } else {
                state.kt = 0.;
            }
        }
    }

    /// Run the inner loop once. `dt` is the gyro period in seconds, fixed by the
    /// gyro sync mechanism.
    pub fn update(&mut self, inputs: &RateLoopInputs, cfg: &CoreConfig, dt: f32) {
        self.update_coefficients(cfg, inputs.rc_data);

        let mag_hold_state = self.mag_hold_state(inputs);

        if mag_hold_state == MagHoldState::UpdateHeading {
            self.mag_hold.target_heading = decidegrees_to_degrees(inputs.attitude.yaw);
        }

        for axis in FLIGHT_AXES {
            let rate_target = if axis == FlightAxis::Yaw && mag_hold_state == MagHoldState::Enabled
            {
                self.mag_hold_rate(cfg, inputs.attitude, dt)
            } else {
                rc_command_to_rate(
                    inputs.rc_command.axis(axis),
                    cfg.control_rate.rates[axis as usize],
                )
            };

            let state = &mut self.state[axis as usize];
            state.gyro_rate = inputs.gyro_rate[axis as usize];

            // Limit desired rate to something the gyro can measure reliably.
            state.rate_target =
                constrain(rate_target, -GYRO_SATURATION_LIMIT, GYRO_SATURATION_LIMIT);
        }

        if inputs.modes.angle || inputs.modes.horizon {
            let strength = horizon_level_strength(cfg, inputs.rc_data);
            self.apply_level(FlightAxis::Roll, inputs, cfg, strength, dt);
            self.apply_level(FlightAxis::Pitch, inputs, cfg, strength, dt);
        }

        if inputs.modes.heading_lock && mag_hold_state != MagHoldState::Enabled {
            self.apply_heading_lock(inputs, cfg, dt);
        }

        for axis in FLIGHT_AXES {
            self.apply_rate_controller(axis, inputs, cfg, dt);
        }
    }

    fn mag_hold_state(&self, inputs: &RateLoopInputs) -> MagHoldState {
        if !inputs.has_mag || !inputs.flags.small_angle {
            return MagHoldState::Disabled;
        }

        match inputs.heading_control {
            // Navigation blocks MAG mode but may require heading control itself;
            // only its auto mode routes through mag hold.
            NavHeadingControlState::Auto => MagHoldState::Enabled,
            NavHeadingControlState::Manual => MagHoldState::UpdateHeading,
            NavHeadingControlState::None => {
                if inputs.rc_command.yaw.abs() < 15 && inputs.modes.mag {
                    MagHoldState::Enabled
                } else {
                    MagHoldState::UpdateHeading
                }
            }
        }
    }

    /// Heading-hold P controller: wrapped heading error to a rotation rate,
    /// capped at `mag_hold_rate_limit` and smoothed at 2 Hz. Small errors get a
    /// proportionally strong correction; large ones are capped soft.
    fn mag_hold_rate(&mut self, cfg: &CoreConfig, attitude: &Attitude, dt: f32) -> f32 {
        let error = wrap_180(decidegrees_to_degrees(attitude.yaw) - self.mag_hold.target_heading);

        let rate = error as f32 * cfg.pid_profile.p[PidIndex::Mag as usize] as f32 / 30.;
        let limit = cfg.pid_profile.mag_hold_rate_limit as f32;
        let rate = constrain(rate, -limit, limit);

        self.mag_hold
            .rate_filter
            .apply(rate, MAG_HOLD_ERROR_LPF_FREQ, dt)
    }

    /// ANGLE/HORIZON self-leveling for one of roll/pitch. P8[LEVEL] sets the
    /// leveling strength for both modes.
    fn apply_level(
        &mut self,
        axis: FlightAxis,
        inputs: &RateLoopInputs,
        cfg: &CoreConfig,
        horizon_strength: f32,
        dt: f32,
    ) {
        let max_inclination = cfg.pid_profile.max_angle_inclination[axis as usize] as f32;
        let angle_target = constrain(
            rc_command_to_angle(inputs.rc_command.axis(axis)),
            -max_inclination,
            max_inclination,
        );
        let angle_error = (angle_target - inputs.attitude.tilt(axis) as f32) / 10.;

        let level_gain =
            cfg.pid_profile.p[PidIndex::Level as usize] as f32 / FP_PID_LEVEL_P_MULTIPLIER;

        let state = &mut self.state[axis as usize];
        if inputs.modes.horizon {
            state.rate_target += angle_error * level_gain * horizon_strength;
        } else {
            state.rate_target = angle_error * level_gain;
        }

        // Attitude updates at gyro rate, so an unfiltered angle-derived target
        // chases every slight attitude change and effectively doubles the rate
        // error the D term then amplifies. A low-pass here smooths self-leveling
        // without lowering the LEVEL P gain.
        let cutoff = cfg.pid_profile.i[PidIndex::Level as usize];
        if cutoff != 0 {
            // Practical filtering frequencies are 5-10 Hz.
            state.rate_target = state.angle_filter.apply(state.rate_target, cutoff as f32, dt);
        }
    }

    /// Heading lock keeps yaw at its current value against external
    /// disturbances the rate PID alone can't null. The error is not integrated
    /// while stick input is significant or the machine is disarmed.
    fn apply_heading_lock(&mut self, inputs: &RateLoopInputs, cfg: &CoreConfig, dt: f32) {
        let state = &mut self.state[FlightAxis::Yaw as usize];

        if state.rate_target.abs() > 2. || !inputs.flags.armed {
            state.axis_lock_accum = 0.;
        } else {
            state.axis_lock_accum += (state.rate_target - state.gyro_rate) * dt;
            state.axis_lock_accum = constrain(state.axis_lock_accum, -45., 45.);
            state.rate_target = state.axis_lock_accum
                * (cfg.pid_profile.p[PidIndex::Mag as usize] as f32 / FP_PID_YAWHOLD_P_MULTIPLIER);
        }
    }

    fn axis_traits(&self, axis: FlightAxis, cfg: &CoreConfig, motor_count: u8) -> AxisRateTraits {
        let profile = &cfg.pid_profile;

        let mut traits = AxisRateTraits {
            p_limit: None,
            pterm_lpf_hz: None,
            dterm_lpf_hz: (profile.dterm_lpf_hz != 0).then(|| profile.dterm_lpf_hz as f32),
            use_dterm: profile.d[axis as usize] != 0,
        };

        if axis == FlightAxis::Yaw {
            // Servo-driven yaw has its own limits; only clamp P when enough
            // motors share the correction.
            if motor_count >= 4 && profile.yaw_p_limit != 0 {
                traits.p_limit = Some(profile.yaw_p_limit as f32);
            }
            if profile.yaw_lpf_hz != 0 {
                traits.pterm_lpf_hz = Some(profile.yaw_lpf_hz as f32);
            }
        }

        traits
    }

    fn apply_rate_controller(
        &mut self,
        axis: FlightAxis,
        inputs: &RateLoopInputs,
        cfg: &CoreConfig,
        dt: f32,
    ) {
        let traits = self.axis_traits(axis, cfg, inputs.flags.motor_count);
        let state = &mut self.state[axis as usize];

        let rate_error = state.rate_target - state.gyro_rate;

        let mut p_term = rate_error * state.kp;
        if let Some(limit) = traits.p_limit {
            p_term = constrain(p_term, -limit, limit);
        }
        if let Some(cutoff) = traits.pterm_lpf_hz {
            p_term = state.pterm_lpf.apply(p_term, cutoff, dt);
        }

        let d_term = if !traits.use_dterm {
            // Optimisation for a zeroed D gain, the usual case on yaw.
            0.
        } else {
            state.dterm_buf.update(state.gyro_rate);
            let mut d = state.dterm_buf.apply(&DTERM_COEFFS, -state.kd / (8. * dt));

            if let Some(cutoff) = traits.dterm_lpf_hz {
                d = state.dterm_lpf.apply(d, cutoff, dt);
            }
            d
        };

        // TODO: Get feedback from the mixer on available correction range per axis.
        let attenuation = if inputs.flags.pid_attenuate { 0.33 } else { 1. };
        let output = (p_term + d_term) * attenuation + state.error_gyro_i;
        let output_limited = constrain(output, -PID_MAX_OUTPUT, PID_MAX_OUTPUT);

        // Integrate only as far as back-calculation tracking allows.
        state.error_gyro_i +=
            (rate_error * state.ki * dt) + ((output_limited - output) * state.kt * dt);

        // Don't grow the I term while the motors are at their limit.
        if inputs.flags.anti_windup || inputs.flags.motor_limit_reached {
            state.error_gyro_i = constrain(
                state.error_gyro_i,
                -state.error_gyro_i_limit,
                state.error_gyro_i_limit,
            );
        } else {
            state.error_gyro_i_limit = state.error_gyro_i.abs();
        }

        let i_term = state.error_gyro_i;
        let setpoint = state.rate_target;

        self.axis_pid[axis as usize] = output_limited as i16;

        self.blackbox.p[axis as usize] = p_term as i32;
        self.blackbox.i[axis as usize] = i_term as i32;
        self.blackbox.d[axis as usize] = d_term as i32;
        self.blackbox.setpoint[axis as usize] = setpoint as i32;
    }
}
