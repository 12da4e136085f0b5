//! Operator input sources and the policy that picks one each tick.

pub mod analog;
pub mod keyboard;
pub mod mapping;

pub use analog::AnalogInput;
pub use keyboard::{Key, KeyboardInput};
pub use mapping::{AxisThresholds, Directions, apply_deadzone, map_input};

use crate::config::InputConfig;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMethod {
    Keyboard,
    Controllers,
}

impl InputMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            InputMethod::Keyboard => "keyboard",
            InputMethod::Controllers => "controllers",
        }
    }
}

/// Held state of the discrete controls during one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscreteSample {
    pub forward: bool,
    pub backward: bool,
    pub strafe_left: bool,
    pub strafe_right: bool,
    pub turn_left: bool,
    pub turn_right: bool,
    pub stop: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stick {
    pub x: f32,
    pub y: f32,
}

impl Stick {
    pub const ZERO: Stick = Stick { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn magnitude(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HandSample {
    pub stick: Stick,
    /// Grip trigger travel, 0.0 to 1.0.
    pub grip: f32,
    pub primary_button: bool,
}

/// Left stick drives walking and strafing, right stick x drives turning.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AnalogSample {
    pub left: Option<HandSample>,
    pub right: Option<HandSample>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawInput {
    Discrete(DiscreteSample),
    Analog(AnalogSample),
}

pub trait InputDevice: Send + Sync {
    fn sample(&self) -> RawInput;

    fn is_present(&self) -> bool {
        true
    }

    fn haptic_pulse(&self, _intensity: f32, _duration: Duration) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub force_keyboard: bool,
    pub editor: bool,
    pub prefer_keyboard_in_editor: bool,
}

impl From<&InputConfig> for SelectionPolicy {
    fn from(config: &InputConfig) -> Self {
        Self {
            force_keyboard: config.force_keyboard,
            editor: config.editor,
            prefer_keyboard_in_editor: config.prefer_keyboard_in_editor,
        }
    }
}

/// Force flag, then editor preference, then analog presence; keyboard otherwise.
pub fn select_input_method(policy: SelectionPolicy, analog_present: bool) -> InputMethod {
    if policy.force_keyboard {
        return InputMethod::Keyboard;
    }
    if policy.editor && policy.prefer_keyboard_in_editor {
        return InputMethod::Keyboard;
    }
    if analog_present {
        InputMethod::Controllers
    } else {
        InputMethod::Keyboard
    }
}

/// Holds both sources and samples whichever the policy selects right now.
pub struct InputRouter {
    keyboard: Arc<dyn InputDevice>,
    analog: Option<Arc<dyn InputDevice>>,
    policy: SelectionPolicy,
}

impl InputRouter {
    pub fn new(
        keyboard: Arc<dyn InputDevice>,
        analog: Option<Arc<dyn InputDevice>>,
        policy: SelectionPolicy,
    ) -> Self {
        Self {
            keyboard,
            analog,
            policy,
        }
    }

    pub fn keyboard_only(keyboard: Arc<dyn InputDevice>) -> Self {
        Self::new(keyboard, None, SelectionPolicy::default())
    }

    pub fn active_method(&self) -> InputMethod {
        let analog_present = self
            .analog
            .as_ref()
            .map(|device| device.is_present())
            .unwrap_or(false);
        select_input_method(self.policy, analog_present)
    }

    pub fn sample(&self) -> (InputMethod, RawInput) {
        let method = self.active_method();
        let raw = match (method, self.analog.as_ref()) {
            (InputMethod::Controllers, Some(analog)) => analog.sample(),
            _ => self.keyboard.sample(),
        };
        (method, raw)
    }

    /// Pulse the analog device when one is connected.
    pub fn haptic_pulse(&self, intensity: f32, duration: Duration) {
        if let Some(analog) = self.analog.as_ref().filter(|device| device.is_present()) {
            analog.haptic_pulse(intensity, duration);
        }
    }
}
