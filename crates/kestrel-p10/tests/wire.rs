//! Wire-level conformance: round-trip laws and the frame shapes the
//! relay exchanges during burst and multiline fan-out.

use kestrel_p10::{Frame, MsgRef, OriginMode, Tag};

#[test]
fn burst_lines_parse_into_expected_shapes() {
    let frame = Frame::parse(
        "AB B #room 1700000000 +ntk sekrit ABAAB:o,ABAAC,ABAAD:v :%*!*@spam.example *!*@worse.example",
        OriginMode::Server,
    )
    .unwrap();
    assert_eq!(frame.origin.as_deref(), Some("AB"));
    assert_eq!(frame.token, "B");
    assert_eq!(frame.params[0], "#room");
    assert_eq!(frame.params[1], "1700000000");
    assert_eq!(frame.params[2], "+ntk");
    assert_eq!(frame.params[3], "sekrit");
    assert_eq!(frame.params[4], "ABAAB:o,ABAAC,ABAAD:v");
    assert_eq!(
        frame.trailing.as_deref(),
        Some("%*!*@spam.example *!*@worse.example")
    );
}

#[test]
fn multiline_markers_survive_roundtrip() {
    for marker in ["+ABAAB1700000000", "ABAAB1700000000", "cABAAB1700000000", "-ABAAB1700000000"] {
        let frame = Frame::new("ML")
            .with_origin("ABAAB")
            .with_param(marker)
            .with_param("#room")
            .with_trailing("first");
        let line = frame.serialize().unwrap();
        let parsed = Frame::parse(&line, OriginMode::Server).unwrap();
        assert_eq!(parsed, frame, "marker {marker}");
    }
}

#[test]
fn tagged_relay_roundtrip() {
    let frame = Frame::new("P")
        .with_origin("ABAAB")
        .with_param("#room")
        .with_trailing("hello world")
        .with_tag(Tag::new("time", "2026-01-01T00:00:00.000Z"))
        .with_tag(Tag::new("msgid", "AB-1700000000-42"))
        .with_tag(Tag::new("+typing", "active"));
    let line = frame.serialize().unwrap();
    assert!(line.starts_with('@'));
    let parsed = Frame::parse(&line, OriginMode::Server).unwrap();
    assert_eq!(parsed, frame);
}

#[test]
fn history_reference_disambiguation() {
    // Leading digit: timestamp. Leading numeric symbol: msgid. Star: none.
    assert_eq!(
        MsgRef::parse_wire("1700000000"),
        Some(MsgRef::Timestamp(1_700_000_000))
    );
    assert_eq!(
        MsgRef::parse_wire("AB-1700000000-7"),
        Some(MsgRef::MsgId("AB-1700000000-7".to_owned()))
    );
    assert_eq!(MsgRef::parse_wire("*"), Some(MsgRef::Any));
}

#[test]
fn handshake_lines_parse_without_origin() {
    let pass = Frame::parse("PASS :hunter2", OriginMode::Server).unwrap();
    assert_eq!(pass.token, "PASS");
    assert_eq!(pass.trailing.as_deref(), Some("hunter2"));

    let server = Frame::parse(
        "SERVER hub.example 1 1700000000 1700000100 J10 AB]]] +s :A test hub",
        OriginMode::Server,
    )
    .unwrap();
    assert_eq!(server.origin, None);
    assert_eq!(server.token, "SERVER");
    assert_eq!(server.params[5], "AB]]]");
    assert_eq!(server.params[6], "+s");
}
