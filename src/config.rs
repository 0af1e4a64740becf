//! User-configurable settings consumed by the control core. Persistence and the
//! tuning UI live elsewhere; these are the in-RAM records, with defaults that
//! match the stock multirotor tune.

/// Index into the 8-bit gain banks of [`PidProfile`]. The first three are the
/// flight axes; the rest select outer-loop controllers and the leveling/heading
/// gains.
#[derive(Clone, Copy, PartialEq)]
pub enum PidIndex {
    Roll = 0,
    Pitch = 1,
    Yaw = 2,
    /// Altitude-to-climb-rate P.
    Alt = 3,
    /// Position-to-velocity P; I doubles as the brake time, D as velocity expo.
    Pos = 4,
    /// Horizontal velocity-to-acceleration PID.
    PosR = 5,
    /// Fixed-wing navigation PID slot; unused on multirotor but kept so gain
    /// banks stay index-compatible with stored profiles.
    NavR = 6,
    /// Self-leveling: P is strength, I is the rate-target LPF cutoff in Hz, D is
    /// the horizon-mode transition divisor.
    Level = 7,
    /// Heading hold P (shared by mag-hold and heading lock).
    Mag = 8,
    /// Vertical velocity-to-throttle PID.
    Vel = 9,
}

pub const PID_ITEM_COUNT: usize = 10;

#[derive(Clone)]
pub struct PidProfile {
    pub p: [u8; PID_ITEM_COUNT],
    pub i: [u8; PID_ITEM_COUNT],
    pub d: [u8; PID_ITEM_COUNT],

    /// D-term low-pass cutoff, Hz. 0 disables.
    pub dterm_lpf_hz: u8,
    /// Extra P-term low-pass on yaw, Hz. 0 disables.
    pub yaw_lpf_hz: u8,
    /// Clamp on the yaw P contribution. 0 disables.
    pub yaw_p_limit: u16,
    /// Max commanded tilt in ANGLE/HORIZON, decidegrees, per roll/pitch.
    pub max_angle_inclination: [i32; 2],
    /// Max rotation rate the mag-hold controller may request, dps.
    pub mag_hold_rate_limit: u8,
}

impl Default for PidProfile {
    fn default() -> Self {
        Self {
            //    roll pitch yaw  alt  pos posr navr level mag vel
            p: [40, 40, 85, 50, 65, 180, 10, 20, 60, 100],
            i: [30, 30, 45, 0, 120, 15, 5, 10, 0, 50],
            d: [23, 23, 0, 0, 10, 100, 8, 75, 0, 10],

            dterm_lpf_hz: 40,
            yaw_lpf_hz: 30,
            yaw_p_limit: 300,
            max_angle_inclination: [300, 300],
            mag_hold_rate_limit: 90,
        }
    }
}

#[derive(Clone)]
pub struct ControlRateConfig {
    /// Per-axis rate settings; full stick commands `(rate + 20) * 10` dps.
    pub rates: [u8; 3],
    /// TPA strength, percent of P/D removed at full throttle. 0 disables.
    pub dyn_thr_pid: u8,
    /// Raw throttle µs where TPA starts to take effect.
    pub tpa_breakpoint: u16,
}

impl Default for ControlRateConfig {
    fn default() -> Self {
        Self {
            rates: [0, 0, 0],
            dyn_thr_pid: 0,
            tpa_breakpoint: 1500,
        }
    }
}

#[derive(Clone)]
pub struct RxConfig {
    pub midrc: i32,
    pub mincheck: i32,
    pub maxcheck: i32,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            midrc: 1500,
            mincheck: 1100,
            maxcheck: 1900,
        }
    }
}

#[derive(Clone)]
pub struct EscAndServoConfig {
    pub minthrottle: i32,
    pub maxthrottle: i32,
}

impl Default for EscAndServoConfig {
    fn default() -> Self {
        Self {
            minthrottle: 1150,
            maxthrottle: 1850,
        }
    }
}

#[derive(Clone)]
pub struct RcControlsConfig {
    /// Throttle deadband around the alt-hold zero, µs.
    pub alt_hold_deadband: i32,
    /// Roll/pitch/yaw deadband for position-hold adjustments, µs.
    pub pos_hold_deadband: i32,
    pub deadband3d_throttle: i32,
}

impl Default for RcControlsConfig {
    fn default() -> Self {
        Self {
            alt_hold_deadband: 50,
            pos_hold_deadband: 20,
            deadband3d_throttle: 50,
        }
    }
}

/// How the pilot's sticks interact with the position controller.
#[derive(Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UserControlMode {
    /// Sticks pass through to the ANGLE loop while adjusting; hold on release.
    GpsAtti,
    /// Sticks command a velocity; the position target moves with the craft.
    GpsCruise,
}

#[derive(Clone)]
pub struct NavConfig {
    /// Throttle producing unity thrust-to-weight; the vertical cascade works in
    /// offsets around this.
    pub mc_hover_throttle: i32,
    /// Below this commanded throttle the craft is assumed unable to fly; used by
    /// the land detector.
    pub mc_min_fly_throttle: i32,
    /// Max bank the position controller may command, degrees.
    pub mc_max_bank_angle: i32,
    /// Full-stick manual climb rate, cm/s.
    pub max_manual_climb_rate: i32,
    /// Full-stick manual horizontal speed, cm/s.
    pub max_manual_speed: i32,
    /// Emergency descent rate when position control has failed, cm/s.
    pub emerg_descent_rate: i32,
    pub use_thr_mid_for_althold: bool,
    pub user_control_mode: UserControlMode,
}

impl Default for NavConfig {
    fn default() -> Self {
        Self {
            mc_hover_throttle: 1500,
            mc_min_fly_throttle: 1200,
            mc_max_bank_angle: 30,
            max_manual_climb_rate: 200,
            max_manual_speed: 500,
            emerg_descent_rate: 500,
            use_thr_mid_for_althold: false,
            user_control_mode: UserControlMode::GpsAtti,
        }
    }
}

/// Everything above, gathered into the single record the scheduler owns and
/// hands to the controllers by reference.
#[derive(Clone, Default)]
pub struct CoreConfig {
    pub pid_profile: PidProfile,
    pub control_rate: ControlRateConfig,
    pub rx: RxConfig,
    pub esc_and_servo: EscAndServoConfig,
    pub rc_controls: RcControlsConfig,
    pub nav: NavConfig,
}
