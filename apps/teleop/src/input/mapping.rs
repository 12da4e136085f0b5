use super::{AnalogSample, DiscreteSample, HandSample, RawInput, Stick};
use crate::config::InputConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisThresholds {
    pub forward: f32,
    pub strafe: f32,
    pub turn: f32,
    pub deadzone: f32,
    pub grip_stop: f32,
}

impl From<&InputConfig> for AxisThresholds {
    fn from(config: &InputConfig) -> Self {
        Self {
            forward: config.forward_threshold,
            strafe: config.strafe_threshold,
            turn: config.turn_threshold,
            deadzone: config.deadzone,
            grip_stop: config.grip_stop_threshold,
        }
    }
}

impl Default for AxisThresholds {
    fn default() -> Self {
        Self::from(&InputConfig::default())
    }
}

/// The six directional booleans plus the explicit stop request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Directions {
    pub forward: bool,
    pub backward: bool,
    pub strafe_left: bool,
    pub strafe_right: bool,
    pub turn_left: bool,
    pub turn_right: bool,
    pub stop: bool,
}

impl Directions {
    pub fn is_idle(&self) -> bool {
        !(self.forward
            || self.backward
            || self.strafe_left
            || self.strafe_right
            || self.turn_left
            || self.turn_right)
    }
}

/// Remove the dead radius and rescale what is left to `[0, 1]`.
pub fn apply_deadzone(stick: Stick, deadzone: f32) -> Stick {
    let magnitude = stick.magnitude();
    if magnitude <= deadzone || magnitude == 0.0 {
        return Stick::ZERO;
    }
    let scaled = ((magnitude - deadzone) / (1.0 - deadzone)).clamp(0.0, 1.0);
    Stick {
        x: stick.x / magnitude * scaled,
        y: stick.y / magnitude * scaled,
    }
}

pub fn map_input(raw: &RawInput, thresholds: &AxisThresholds) -> Directions {
    match raw {
        RawInput::Discrete(sample) => map_discrete(sample),
        RawInput::Analog(sample) => map_analog(sample, thresholds),
    }
}

// Opposing keys held together resolve forward over backward and right over
// left, for strafing and turning alike.
fn map_discrete(sample: &DiscreteSample) -> Directions {
    Directions {
        forward: sample.forward,
        backward: sample.backward && !sample.forward,
        strafe_right: sample.strafe_right,
        strafe_left: sample.strafe_left && !sample.strafe_right,
        turn_right: sample.turn_right,
        turn_left: sample.turn_left && !sample.turn_right,
        stop: sample.stop,
    }
}

fn map_analog(sample: &AnalogSample, thresholds: &AxisThresholds) -> Directions {
    let mut out = Directions::default();

    if let Some(left) = sample.left {
        let stick = apply_deadzone(left.stick, thresholds.deadzone);
        out.forward = stick.y > thresholds.forward;
        out.backward = stick.y < -thresholds.forward && !out.forward;
        out.strafe_right = stick.x > thresholds.strafe;
        out.strafe_left = stick.x < -thresholds.strafe && !out.strafe_right;
        out.stop |= hand_requests_stop(&left, thresholds);
    }

    if let Some(right) = sample.right {
        let stick = apply_deadzone(right.stick, thresholds.deadzone);
        out.turn_right = stick.x > thresholds.turn;
        out.turn_left = stick.x < -thresholds.turn && !out.turn_right;
        out.stop |= hand_requests_stop(&right, thresholds);
    }

    out
}

fn hand_requests_stop(hand: &HandSample, thresholds: &AxisThresholds) -> bool {
    hand.grip > thresholds.grip_stop || hand.primary_button
}

#[cfg(test)]
mod tests {
    use super::*;

    fn left_stick(x: f32, y: f32) -> RawInput {
        RawInput::Analog(AnalogSample {
            left: Some(HandSample {
                stick: Stick::new(x, y),
                ..HandSample::default()
            }),
            right: None,
        })
    }

    #[test]
    fn stick_on_deadzone_boundary_yields_nothing() {
        let thresholds = AxisThresholds::default();
        assert_eq!(apply_deadzone(Stick::new(0.15, 0.0), 0.15), Stick::ZERO);
        assert_eq!(apply_deadzone(Stick::new(0.0, -0.15), 0.15), Stick::ZERO);
        assert_eq!(map_input(&left_stick(0.0, 0.15), &thresholds), Directions::default());
    }

    #[test]
    fn full_deflection_sets_only_the_crossed_axis() {
        let thresholds = AxisThresholds::default();
        let forward = map_input(&left_stick(0.2, 0.98), &thresholds);
        assert!(forward.forward && !forward.strafe_right && !forward.strafe_left);

        let right = map_input(&left_stick(0.98, -0.2), &thresholds);
        assert!(right.strafe_right && !right.backward && !right.forward);

        let back = map_input(&left_stick(0.0, -1.0), &thresholds);
        assert!(back.backward && !back.forward);
    }

    #[test]
    fn diagonal_stick_drives_both_axes() {
        let thresholds = AxisThresholds::default();
        let diagonal = map_input(&left_stick(0.7, 0.7), &thresholds);
        assert!(diagonal.forward && diagonal.strafe_right);
        assert!(!diagonal.backward && !diagonal.strafe_left);

        let shallow = map_input(&left_stick(-0.45, 0.45), &thresholds);
        assert!(shallow.forward && !shallow.strafe_left);
    }

    #[test]
    fn deadzone_rescales_remainder() {
        let stick = apply_deadzone(Stick::new(0.0, 1.0), 0.15);
        assert!((stick.y - 1.0).abs() < 1e-6);
        let stick = apply_deadzone(Stick::new(0.0, 0.575), 0.15);
        assert!((stick.y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn small_deflection_stays_under_threshold() {
        // 0.4 raw rescales to ~0.29, under the 0.3 forward threshold.
        let out = map_input(&left_stick(0.0, 0.4), &AxisThresholds::default());
        assert!(!out.forward);
    }

    #[test]
    fn opposing_keys_resolve_forward_and_right() {
        let raw = RawInput::Discrete(DiscreteSample {
            forward: true,
            backward: true,
            strafe_left: true,
            strafe_right: true,
            turn_left: true,
            turn_right: true,
            stop: false,
        });
        let out = map_input(&raw, &AxisThresholds::default());
        assert!(out.forward && !out.backward);
        assert!(out.strafe_right && !out.strafe_left);
        assert!(out.turn_right && !out.turn_left);
    }

    #[test]
    fn right_stick_turns_and_grip_stops() {
        let raw = RawInput::Analog(AnalogSample {
            left: None,
            right: Some(HandSample {
                stick: Stick::new(-0.9, 0.0),
                grip: 0.85,
                primary_button: false,
            }),
        });
        let out = map_input(&raw, &AxisThresholds::default());
        assert!(out.turn_left && !out.turn_right);
        assert!(out.stop);
        assert!(!out.is_idle());
    }

    #[test]
    fn primary_button_stops_and_light_grip_does_not() {
        let thresholds = AxisThresholds::default();
        let light = RawInput::Analog(AnalogSample {
            left: Some(HandSample {
                grip: 0.8,
                ..HandSample::default()
            }),
            right: None,
        });
        assert!(!map_input(&light, &thresholds).stop);

        let button = RawInput::Analog(AnalogSample {
            left: Some(HandSample {
                primary_button: true,
                ..HandSample::default()
            }),
            right: None,
        });
        assert!(map_input(&button, &thresholds).stop);
    }
}
