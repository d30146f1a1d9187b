use serde::{Deserialize, Serialize};

/// Connection/recording state as reported by the daemon.
///
/// Exactly one value at a time, owned by the session controller. The wire
/// encoding is the lowercase name (`"idle"`, `"recording"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Recording,
}

/// Recording mode requested with `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    Toggle,
}

/// Messages sent to the daemon, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMsg {
    Start { mode: RecordingMode },
    Stop,
    Cancel,
}

/// Messages pushed by the daemon.
///
/// Lines with an unrecognized `type` decode to `Other` and are ignored;
/// lines that fail to parse at all are dropped by the channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DaemonMsg {
    Partial { text: String },
    Final { text: String },
    Status { state: ConnectionState },
    Error { message: String },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_wire_format() {
        let start = serde_json::to_string(&ClientMsg::Start {
            mode: RecordingMode::Toggle,
        })
        .unwrap();
        assert_eq!(start, r#"{"type":"start","mode":"toggle"}"#);

        assert_eq!(
            serde_json::to_string(&ClientMsg::Stop).unwrap(),
            r#"{"type":"stop"}"#
        );
        assert_eq!(
            serde_json::to_string(&ClientMsg::Cancel).unwrap(),
            r#"{"type":"cancel"}"#
        );
    }

    #[test]
    fn outbound_is_single_line() {
        for msg in [
            ClientMsg::Start {
                mode: RecordingMode::Toggle,
            },
            ClientMsg::Stop,
            ClientMsg::Cancel,
        ] {
            let line = serde_json::to_string(&msg).unwrap();
            assert!(!line.contains('\n'));
        }
    }

    #[test]
    fn outbound_fields_survive_reparse() {
        let line = serde_json::to_string(&ClientMsg::Start {
            mode: RecordingMode::Toggle,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "start");
        assert_eq!(value["mode"], "toggle");
    }

    #[test]
    fn inbound_parse() {
        let msg: DaemonMsg = serde_json::from_str(r#"{"type":"partial","text":"hel"}"#).unwrap();
        assert_eq!(msg, DaemonMsg::Partial { text: "hel".into() });

        let msg: DaemonMsg = serde_json::from_str(r#"{"type":"final","text":"hello"}"#).unwrap();
        assert_eq!(msg, DaemonMsg::Final { text: "hello".into() });

        let msg: DaemonMsg =
            serde_json::from_str(r#"{"type":"status","state":"recording"}"#).unwrap();
        assert_eq!(
            msg,
            DaemonMsg::Status {
                state: ConnectionState::Recording
            }
        );

        let msg: DaemonMsg = serde_json::from_str(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(msg, DaemonMsg::Error { message: "boom".into() });
    }

    #[test]
    fn unknown_type_is_ignored_variant() {
        let msg: DaemonMsg =
            serde_json::from_str(r#"{"type":"telemetry","uptime":42}"#).unwrap();
        assert_eq!(msg, DaemonMsg::Other);
    }

    #[test]
    fn relabeled_outbound_is_tolerated() {
        // An outbound line fed back through the inbound parser under an
        // unrecognized label must not error out, only be ignored.
        let line = serde_json::to_string(&ClientMsg::Stop).unwrap();
        let relabeled = line.replace(r#""stop""#, r#""halt""#);
        let msg: DaemonMsg = serde_json::from_str(&relabeled).unwrap();
        assert_eq!(msg, DaemonMsg::Other);
    }

    #[test]
    fn malformed_line_fails_to_parse() {
        assert!(serde_json::from_str::<DaemonMsg>("not json at all").is_err());
        assert!(serde_json::from_str::<DaemonMsg>(r#"{"type":"status","state":"weird"}"#).is_err());
    }

    #[test]
    fn state_round_trip() {
        for (state, wire) in [
            (ConnectionState::Idle, "\"idle\""),
            (ConnectionState::Connecting, "\"connecting\""),
            (ConnectionState::Connected, "\"connected\""),
            (ConnectionState::Recording, "\"recording\""),
        ] {
            assert_eq!(serde_json::to_string(&state).unwrap(), wire);
            assert_eq!(serde_json::from_str::<ConnectionState>(wire).unwrap(), state);
        }
    }
}
