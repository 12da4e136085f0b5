use super::{AnalogSample, HandSample, InputDevice, RawInput};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Latest analog state pushed in by whatever reads the physical controllers.
#[derive(Default)]
pub struct AnalogInput {
    present: AtomicBool,
    state: Mutex<AnalogSample>,
    pulses: Mutex<Vec<(f32, Duration)>>,
}

impl AnalogInput {
    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
        if !present {
            *self.state.lock() = AnalogSample::default();
        }
    }

    pub fn update(&self, left: Option<HandSample>, right: Option<HandSample>) {
        *self.state.lock() = AnalogSample { left, right };
    }

    /// Haptic pulses requested so far, oldest first.
    pub fn pulses(&self) -> Vec<(f32, Duration)> {
        self.pulses.lock().clone()
    }
}

impl InputDevice for AnalogInput {
    fn sample(&self) -> RawInput {
        RawInput::Analog(*self.state.lock())
    }

    fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    // Both hands get the same pulse.
    fn haptic_pulse(&self, intensity: f32, duration: Duration) {
        self.pulses.lock().push((intensity.clamp(0.0, 1.0), duration));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Stick;

    #[test]
    fn disconnect_clears_stale_state() {
        let analog = AnalogInput::default();
        analog.set_present(true);
        analog.update(
            Some(HandSample {
                stick: Stick::new(0.0, 1.0),
                ..HandSample::default()
            }),
            None,
        );
        assert!(matches!(analog.sample(), RawInput::Analog(s) if s.left.is_some()));

        analog.set_present(false);
        assert_eq!(analog.sample(), RawInput::Analog(AnalogSample::default()));
    }

    #[test]
    fn pulse_intensity_is_clamped() {
        let analog = AnalogInput::default();
        analog.haptic_pulse(1.7, Duration::from_millis(100));
        assert_eq!(analog.pulses(), vec![(1.0, Duration::from_millis(100))]);
    }
}
