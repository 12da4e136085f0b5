//! Terminal key handling for the `connect` command.
//!
//! Raw-mode terminals report presses but rarely releases, so drive keys are
//! fed to [`KeyboardInput::tap`], which holds the direction for a short
//! window and relies on key repeat to keep it held.

use crate::input::{Key, KeyboardInput};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::{self, IsTerminal};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Drive(Key),
    RestartVideo,
    Disconnect,
}

pub fn classify(key: &KeyEvent) -> Option<KeyAction> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char(c) if c.eq_ignore_ascii_case(&'c') => Some(KeyAction::Disconnect),
            _ => None,
        };
    }
    let drive = match key.code {
        KeyCode::Esc => return Some(KeyAction::Disconnect),
        KeyCode::Char(' ') => Key::Stop,
        KeyCode::Up => Key::Forward,
        KeyCode::Down => Key::Backward,
        KeyCode::Left => Key::TurnLeft,
        KeyCode::Right => Key::TurnRight,
        KeyCode::Char(c) => match c.to_ascii_lowercase() {
            'w' => Key::Forward,
            's' => Key::Backward,
            'a' => Key::StrafeLeft,
            'd' => Key::StrafeRight,
            'q' => Key::TurnLeft,
            'e' => Key::TurnRight,
            'v' => return Some(KeyAction::RestartVideo),
            _ => return None,
        },
        _ => return None,
    };
    Some(KeyAction::Drive(drive))
}

pub struct RawModeGuard(bool);

impl RawModeGuard {
    pub fn new() -> Self {
        if !io::stdin().is_terminal() {
            return Self(false);
        }
        match enable_raw_mode() {
            Ok(()) => Self(true),
            Err(err) => {
                warn!(target: "teleop::terminal", error = %err, "failed to enable raw mode");
                Self(false)
            }
        }
    }

    pub fn is_raw(&self) -> bool {
        self.0
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = disable_raw_mode();
        }
    }
}

/// Read terminal keys on a dedicated thread. Drive keys go straight to the
/// keyboard source; everything else is forwarded on `actions`.
pub fn spawn_key_listener(
    keyboard: Arc<KeyboardInput>,
    actions: UnboundedSender<KeyAction>,
    stop: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("teleop-keys".into())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match event::poll(POLL_INTERVAL) {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(err) => {
                        warn!(target: "teleop::terminal", error = %err, "terminal poll failed");
                        break;
                    }
                }
                let key = match event::read() {
                    Ok(Event::Key(key)) => key,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(target: "teleop::terminal", error = %err, "terminal read failed");
                        break;
                    }
                };
                match classify(&key) {
                    Some(KeyAction::Drive(drive)) => keyboard.tap(drive),
                    Some(action) => {
                        if actions.send(action).is_err() {
                            break;
                        }
                    }
                    None => debug!(target: "teleop::terminal", code = ?key.code, "ignored key"),
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn drive_keys_map_to_directions() {
        assert_eq!(
            classify(&press(KeyCode::Char('W'))),
            Some(KeyAction::Drive(Key::Forward))
        );
        assert_eq!(
            classify(&press(KeyCode::Char('a'))),
            Some(KeyAction::Drive(Key::StrafeLeft))
        );
        assert_eq!(
            classify(&press(KeyCode::Char('e'))),
            Some(KeyAction::Drive(Key::TurnRight))
        );
        assert_eq!(
            classify(&press(KeyCode::Char(' '))),
            Some(KeyAction::Drive(Key::Stop))
        );
        assert_eq!(classify(&press(KeyCode::Char('x'))), None);
    }

    #[test]
    fn escape_and_ctrl_c_disconnect() {
        assert_eq!(classify(&press(KeyCode::Esc)), Some(KeyAction::Disconnect));
        assert_eq!(
            classify(&KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(KeyAction::Disconnect)
        );
        assert_eq!(
            classify(&KeyEvent::new(KeyCode::Char('w'), KeyModifiers::CONTROL)),
            None
        );
    }

    #[test]
    fn releases_are_ignored() {
        let mut release = press(KeyCode::Char('w'));
        release.kind = KeyEventKind::Release;
        assert_eq!(classify(&release), None);
    }
}
