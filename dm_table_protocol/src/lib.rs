// dm_table_protocol — wire protocol for the dm-table session relay.
//
// This crate defines the message vocabulary, framing, and serialization used
// by the relay (`dm_table_relay`) and its clients to communicate over TCP.
// It is shared between both sides and has no dependency on the relay itself.
//
// Module overview:
// - `types.rs`:    ID newtypes — `TableId`, `ClientId`, `Revision`.
// - `message.rs`:  Client-to-relay and relay-to-client message enums, plus
//                  the `TableSummary` rows returned by `list`.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream:
//                  4-byte big-endian length prefix, then JSON payload.
//
// Design decisions:
// - **Internally tagged JSON.** Every message is an object with a `type`
//   discriminant and camelCase fields, decoded once at the boundary into a
//   closed enum. Unknown discriminants land in `ClientMessage::Unknown`
//   instead of failing the decode.
// - **Payloads as opaque `serde_json::Value`.** The relay never interprets
//   table state beyond its embedded revision, so the protocol crate carries
//   no knowledge of what clients keep in a table.
// - **No async runtime.** Framing uses `std::io::Read`/`Write`, compatible
//   with blocking TCP streams and buffered wrappers.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{MAX_FRAME_SIZE, read_frame, write_frame};
pub use message::{ClientMessage, ServerMessage, TableSummary};
pub use types::{ClientId, Revision, TableId};

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn decode(raw: &str) -> ClientMessage {
        serde_json::from_str(raw).expect("decode ClientMessage")
    }

    #[test]
    fn join_decodes_with_both_fields() {
        let msg = decode(r#"{"type":"join","tableId":"t1","clientId":"alice"}"#);
        assert_eq!(
            msg,
            ClientMessage::Join {
                table_id: Some(TableId("t1".into())),
                client_id: Some(ClientId("alice".into())),
            }
        );
    }

    #[test]
    fn join_fields_are_optional() {
        let msg = decode(r#"{"type":"join"}"#);
        assert_eq!(
            msg,
            ClientMessage::Join {
                table_id: None,
                client_id: None,
            }
        );
    }

    #[test]
    fn list_is_a_bare_discriminant() {
        assert_eq!(decode(r#"{"type":"list"}"#), ClientMessage::List);
    }

    #[test]
    fn request_state_uses_snake_case_tag() {
        let msg = decode(r#"{"type":"request_state","tableId":"t1"}"#);
        assert_eq!(
            msg,
            ClientMessage::RequestState {
                table_id: TableId("t1".into()),
            }
        );
    }

    #[test]
    fn claim_requires_both_fields() {
        // tableId alone is malformed — the relay drops it, so the decode
        // must fail rather than fill in a default identity.
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"claim","tableId":"t1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn state_payload_null_decodes_as_absent() {
        let msg = decode(r#"{"type":"state","tableId":"t1","payload":null}"#);
        assert_eq!(
            msg,
            ClientMessage::State {
                table_id: Some(TableId("t1".into())),
                payload: None,
            }
        );
    }

    #[test]
    fn unknown_discriminant_is_captured_not_rejected() {
        assert_eq!(decode(r#"{"type":"frobnicate","x":1}"#), ClientMessage::Unknown);
    }

    #[test]
    fn non_object_body_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>("[1,2,3]").is_err());
        assert!(serde_json::from_str::<ClientMessage>("\"join\"").is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json at all").is_err());
    }

    #[test]
    fn joined_wire_shape() {
        let msg = ServerMessage::Joined {
            table_id: Some(TableId("t1".into())),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "joined", "tableId": "t1"})
        );

        // A join without a table still gets acknowledged, with a null echo.
        let msg = ServerMessage::Joined { table_id: None };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "joined", "tableId": null})
        );
    }

    #[test]
    fn leader_wire_shape() {
        let msg = ServerMessage::Leader {
            ok: false,
            leader_id: ClientId("alice".into()),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "leader", "ok": false, "leaderId": "alice"})
        );
    }

    #[test]
    fn list_wire_shape() {
        let msg = ServerMessage::List {
            items: vec![TableSummary {
                id: TableId("t1".into()),
                last_updated: 1_700_000_000_000,
                has_state: true,
            }],
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "list",
                "items": [{"id": "t1", "lastUpdated": 1_700_000_000_000_u64, "hasState": true}]
            })
        );
    }

    #[test]
    fn state_wire_shape() {
        let msg = ServerMessage::State {
            table_id: TableId("t1".into()),
            payload: json!({"table": {"rev": 2}, "cells": []}),
            sender: Some(ClientId("alice".into())),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "state",
                "tableId": "t1",
                "payload": {"table": {"rev": 2}, "cells": []},
                "sender": "alice"
            })
        );
    }

    #[test]
    fn broadcast_carries_null_payload() {
        let msg = ServerMessage::Broadcast {
            table_id: TableId("t1".into()),
            payload: None,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "broadcast", "tableId": "t1", "payload": null})
        );
    }

    #[test]
    fn framed_message_roundtrip() {
        let msg = ClientMessage::Claim {
            table_id: TableId("t1".into()),
            client_id: ClientId("alice".into()),
        };
        let json = serde_json::to_vec(&msg).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &json).unwrap();

        let mut cursor = std::io::Cursor::new(&wire);
        let recovered_json = read_frame(&mut cursor).unwrap();
        let recovered: ClientMessage = serde_json::from_slice(&recovered_json).unwrap();
        assert_eq!(recovered, msg);
    }
}
