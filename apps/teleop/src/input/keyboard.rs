use super::{DiscreteSample, InputDevice, RawInput};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// How long a tapped key stays held when the terminal reports no release.
/// Slightly longer than the typical autorepeat delay so a held key does not
/// flicker between repeats.
pub const DEFAULT_TAP_HOLD: Duration = Duration::from_millis(550);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Forward,
    Backward,
    StrafeLeft,
    StrafeRight,
    TurnLeft,
    TurnRight,
    Stop,
}

#[derive(Debug, Clone, Copy)]
enum Hold {
    UntilReleased,
    Until(Instant),
}

/// Discrete key source. `press`/`release` for hosts that report both edges,
/// `tap` for hosts that only report presses (and autorepeat).
pub struct KeyboardInput {
    held: Mutex<HashMap<Key, Hold>>,
    tap_hold: Duration,
}

impl Default for KeyboardInput {
    fn default() -> Self {
        Self::with_tap_hold(DEFAULT_TAP_HOLD)
    }
}

impl KeyboardInput {
    pub fn with_tap_hold(tap_hold: Duration) -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            tap_hold,
        }
    }

    pub fn press(&self, key: Key) {
        self.held.lock().insert(key, Hold::UntilReleased);
    }

    pub fn release(&self, key: Key) {
        self.held.lock().remove(&key);
    }

    pub fn tap(&self, key: Key) {
        let until = Instant::now() + self.tap_hold;
        let mut held = self.held.lock();
        match held.get(&key) {
            Some(Hold::UntilReleased) => {}
            _ => {
                held.insert(key, Hold::Until(until));
            }
        }
    }

    pub fn release_all(&self) {
        self.held.lock().clear();
    }

    pub fn is_held(&self, key: Key) -> bool {
        let now = Instant::now();
        let mut held = self.held.lock();
        match held.get(&key).copied() {
            Some(Hold::UntilReleased) => true,
            Some(Hold::Until(deadline)) if deadline > now => true,
            Some(Hold::Until(_)) => {
                held.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> DiscreteSample {
        DiscreteSample {
            forward: self.is_held(Key::Forward),
            backward: self.is_held(Key::Backward),
            strafe_left: self.is_held(Key::StrafeLeft),
            strafe_right: self.is_held(Key::StrafeRight),
            turn_left: self.is_held(Key::TurnLeft),
            turn_right: self.is_held(Key::TurnRight),
            stop: self.is_held(Key::Stop),
        }
    }
}

impl InputDevice for KeyboardInput {
    fn sample(&self) -> RawInput {
        RawInput::Discrete(self.snapshot())
    }
}
