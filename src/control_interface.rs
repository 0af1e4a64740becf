//! This module is the interface layer between the RC receiver/decoder and the
//! control core. Decoding, channel mapping and stick shaping happen upstream;
//! the core sees two views of the sticks: raw channel values, and the shaped
//! command set that navigation is allowed to rewrite.

use crate::{config::RxConfig, flight_ctrls::FlightAxis};

/// Shaped control commands. Roll/pitch/yaw are centered, roughly -500..+500;
/// throttle stays in receiver µs units. The outer navigation controller rewrites
/// roll/pitch/throttle here when it is active.
#[derive(Clone, Copy, Default)]
pub struct RcCommands {
    pub roll: i32,
    pub pitch: i32,
    pub yaw: i32,
    pub throttle: i32,
}

impl RcCommands {
    pub fn axis(&self, axis: FlightAxis) -> i32 {
        match axis {
            FlightAxis::Roll => self.roll,
            FlightAxis::Pitch => self.pitch,
            FlightAxis::Yaw => self.yaw,
        }
    }
}

/// Raw receiver channels, ~1000-2000 µs. TPA and the horizon-strength
/// calculation read these directly so navigation rewrites can't feed back into
/// gain scheduling.
#[derive(Clone, Copy)]
pub struct RcData {
    pub roll: i32,
    pub pitch: i32,
    pub yaw: i32,
    pub throttle: i32,
}

impl Default for RcData {
    fn default() -> Self {
        Self {
            roll: 1500,
            pitch: 1500,
            yaw: 1500,
            throttle: 1000,
        }
    }
}

impl RcData {
    pub fn channel(&self, axis: FlightAxis) -> i32 {
        match axis {
            FlightAxis::Roll => self.roll,
            FlightAxis::Pitch => self.pitch,
            FlightAxis::Yaw => self.yaw,
        }
    }
}

/// Absolute stick deflection from center, capped at full scale (500).
pub fn stick_deflection(raw: i32, midrc: i32) -> i32 {
    (raw - midrc).abs().min(500)
}

#[derive(Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThrottleStatus {
    Low,
    High,
}

/// Throttle position classification. Used by alt-hold setup to decide whether to
/// capture the current stick as the climb-rate zero, and to arm the takeoff
/// integrator guard.
pub fn calculate_throttle_status(rc_data: &RcData, rx_config: &RxConfig) -> ThrottleStatus {
    if rc_data.throttle < rx_config.mincheck {
        ThrottleStatus::Low
    } else {
        ThrottleStatus::High
    }
}
