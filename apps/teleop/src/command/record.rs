use crate::input::{Directions, InputMethod};
use authority_proto::{CommandRecord, ConnectionStatus, ConnectionStatusRecord};

pub const OPERATOR_SOURCE: &str = "teleop_operator";
pub const DISCONNECT_SOURCE: &str = "disconnect_emergency_stop";
pub const PROBE_TAG: &str = "connection_check";

/// Per-session fields stamped on every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMeta {
    pub session_code: String,
    pub robot_id: String,
    pub operator_id: String,
    pub platform: String,
}

impl CommandMeta {
    pub fn command(
        &self,
        seq: u64,
        timestamp: u64,
        directions: &Directions,
        emergency_stop: bool,
        method: InputMethod,
    ) -> CommandRecord {
        CommandRecord {
            timestamp,
            seq,
            walk_forward: directions.forward,
            walk_backward: directions.backward,
            strafe_left: directions.strafe_left,
            strafe_right: directions.strafe_right,
            turn_left: directions.turn_left,
            turn_right: directions.turn_right,
            emergency_stop,
            source: OPERATOR_SOURCE.to_string(),
            robot_id: self.robot_id.clone(),
            session_code: self.session_code.clone(),
            operator_id: self.operator_id.clone(),
            input_method: method.as_str().to_string(),
            platform: Some(self.platform.clone()),
        }
    }

    /// Stop record written on close: no movement, stop set.
    pub fn final_stop(&self, seq: u64, timestamp: u64, method: InputMethod) -> CommandRecord {
        CommandRecord {
            source: DISCONNECT_SOURCE.to_string(),
            ..self.command(seq, timestamp, &Directions::default(), true, method)
        }
    }

    pub fn connected(&self, timestamp: u64) -> ConnectionStatusRecord {
        ConnectionStatusRecord {
            status: ConnectionStatus::Connected,
            timestamp,
            reason: None,
            platform: Some(self.platform.clone()),
            operator_id: Some(self.operator_id.clone()),
        }
    }

    pub fn disconnected(&self, timestamp: u64, reason: &str) -> ConnectionStatusRecord {
        ConnectionStatusRecord {
            status: ConnectionStatus::Disconnected,
            timestamp,
            reason: Some(reason.to_string()),
            platform: None,
            operator_id: None,
        }
    }
}

pub fn movement_summary(record: &CommandRecord) -> String {
    let mut parts = Vec::new();
    for (set, label) in [
        (record.walk_forward, "FWD"),
        (record.walk_backward, "BWD"),
        (record.strafe_left, "LEFT"),
        (record.strafe_right, "RIGHT"),
        (record.turn_left, "TURN-L"),
        (record.turn_right, "TURN-R"),
        (record.emergency_stop, "E-STOP"),
    ] {
        if set {
            parts.push(label);
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> CommandMeta {
        CommandMeta {
            session_code: "ABC123".into(),
            robot_id: "hexa-01".into(),
            operator_id: "anon-1".into(),
            platform: "linux".into(),
        }
    }

    #[test]
    fn final_stop_clears_movement() {
        let record = meta().final_stop(11, 5, InputMethod::Keyboard);
        assert!(record.emergency_stop);
        assert!(!record.is_moving());
        assert_eq!(record.seq, 11);
        assert_eq!(record.source, DISCONNECT_SOURCE);
        assert_eq!(record.session_code, "ABC123");
    }

    #[test]
    fn command_carries_session_metadata() {
        let directions = Directions {
            forward: true,
            turn_left: true,
            ..Directions::default()
        };
        let record = meta().command(3, 9, &directions, false, InputMethod::Controllers);
        assert_eq!(record.input_method, "controllers");
        assert_eq!(record.platform.as_deref(), Some("linux"));
        assert_eq!(movement_summary(&record), "FWD TURN-L");
    }
}
