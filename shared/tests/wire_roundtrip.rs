/// Round-trip coverage for the inter-server and session wire formats: every
/// message type must decode back to exactly the value that was encoded, and
/// malformed bodies must be rejected without panicking.
use loka_shared::{
    frame, Bounds, ConnectFields, ConnectKind, ConnectResponse, Datagram, FrameAssembler,
    MigrateRecord, Motion, ObjectId, OrientationSample, Point3, Quat, ServerId, ServerMessage,
    SessionMessage, Vec3, WireError,
};

fn oid(seed: u8) -> ObjectId {
    let mut raw = [0u8; 16];
    for (i, b) in raw.iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8);
    }
    ObjectId(raw)
}

fn sample_motion() -> Motion {
    Motion::new(
        77_000_001,
        Point3::new(1.5, -2.25, 1024.0),
        Vec3::new(0.0, 9.5, -0.125),
    )
}

fn sample_orientation() -> OrientationSample {
    OrientationSample::new(
        77_000_002,
        Quat { x: 0.0, y: 0.7, z: 0.0, w: 0.7 },
        Quat::IDENTITY,
    )
}

fn roundtrip_server(msg: ServerMessage) {
    let body = msg.encode();
    let decoded = ServerMessage::decode(&body).expect("decode");
    assert_eq!(decoded, msg);
}

fn roundtrip_session(msg: SessionMessage) {
    let body = msg.encode();
    let decoded = SessionMessage::decode(&body).expect("decode");
    assert_eq!(decoded, msg);
}

#[test]
fn object_datagram_roundtrip() {
    roundtrip_server(ServerMessage::ObjectDatagram(Datagram {
        src_server: ServerId(3),
        hops: 2,
        src_obj: oid(1),
        dst_obj: oid(9),
        src_port: 80,
        dst_port: 4000,
        payload: vec![0xde, 0xad, 0xbe, 0xef],
    }));
}

#[test]
fn object_datagram_empty_payload_roundtrip() {
    roundtrip_server(ServerMessage::ObjectDatagram(Datagram {
        src_server: ServerId(1),
        hops: 0,
        src_obj: oid(4),
        dst_obj: ObjectId::NULL,
        src_port: 1,
        dst_port: 1,
        payload: Vec::new(),
    }));
}

#[test]
fn migrate_payload_roundtrip() {
    roundtrip_server(ServerMessage::MigratePayload(MigrateRecord {
        src_server: ServerId(5),
        object: oid(32),
        motion: sample_motion(),
        orientation: sample_orientation(),
        bounds: Bounds::new(Point3::new(1.0, 1.0, 1.0), 5.0),
        mesh: "meerkat:///models/teapot.dae".to_string(),
        client_data: vec![
            ("prox".to_string(), vec![1, 2, 3]),
            ("phys".to_string(), Vec::new()),
        ],
    }));
}

#[test]
fn migration_ack_roundtrip() {
    roundtrip_server(ServerMessage::MigrationAck {
        from: ServerId(7),
        to: ServerId(3),
        object: oid(200),
    });
}

#[test]
fn directory_update_roundtrip() {
    roundtrip_server(ServerMessage::DirectoryUpdate { object: oid(12), owner: ServerId(6) });
    // tombstone
    roundtrip_server(ServerMessage::DirectoryUpdate { object: oid(12), owner: ServerId::NIL });
}

#[test]
fn kill_object_connection_roundtrip() {
    roundtrip_server(ServerMessage::KillObjectConnection { object: oid(88) });
}

#[test]
fn connect_roundtrip() {
    roundtrip_session(SessionMessage::Connect {
        object: oid(2),
        fields: ConnectFields {
            kind: ConnectKind::Fresh,
            loc: sample_motion(),
            orientation: sample_orientation(),
            bounds: Bounds::new(Point3::new(1.0, 1.0, 1.0), 5.0),
            mesh: String::new(),
            physics: vec![9, 9],
            query_radius: 100.0,
            auth: b"token".to_vec(),
            oh_name: "oh-west-1".to_string(),
        },
    });
}

#[test]
fn connect_response_roundtrip() {
    roundtrip_session(SessionMessage::ConnectResponse {
        object: oid(2),
        response: ConnectResponse::Success {
            loc: sample_motion(),
            orientation: sample_orientation(),
            bounds: Bounds::new(Point3::new(1.0, 1.0, 1.0), 5.0),
            mesh: "meerkat:///m.dae".to_string(),
        },
    });
    roundtrip_session(SessionMessage::ConnectResponse {
        object: oid(2),
        response: ConnectResponse::Redirect { server: ServerId(5) },
    });
    roundtrip_session(SessionMessage::ConnectResponse {
        object: oid(2),
        response: ConnectResponse::Error,
    });
}

#[test]
fn remaining_session_messages_roundtrip() {
    roundtrip_session(SessionMessage::ConnectAck { object: oid(3) });
    roundtrip_session(SessionMessage::Disconnect {
        object: oid(3),
        reason: "host shutdown".to_string(),
    });
    roundtrip_session(SessionMessage::InitMigration {
        object: oid(3),
        new_server: ServerId(9),
    });
}

#[test]
fn unknown_tag_is_rejected() {
    let err = ServerMessage::decode(&[0xff, 0, 0]).unwrap_err();
    assert_eq!(err, WireError::UnknownTag { tag: 0xff });
}

#[test]
fn truncated_body_is_rejected() {
    let full = ServerMessage::MigrationAck {
        from: ServerId(1),
        to: ServerId(2),
        object: oid(0),
    }
    .encode();
    for cut in 1..full.len() {
        let err = ServerMessage::decode(&full[..cut]).unwrap_err();
        assert!(
            matches!(err, WireError::Truncated { .. } | WireError::BadDiscriminant { .. }),
            "cut at {cut} produced {err:?}"
        );
    }
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut body = ServerMessage::KillObjectConnection { object: oid(1) }.encode();
    body.push(0);
    assert!(matches!(
        ServerMessage::decode(&body),
        Err(WireError::TrailingBytes { extra: 1 })
    ));
}

#[test]
fn framed_messages_survive_fragmented_transport() {
    let messages = vec![
        ServerMessage::MigrationAck { from: ServerId(1), to: ServerId(2), object: oid(5) },
        ServerMessage::DirectoryUpdate { object: oid(6), owner: ServerId(4) },
        ServerMessage::KillObjectConnection { object: oid(7) },
    ];
    let mut stream = Vec::new();
    for m in &messages {
        stream.extend_from_slice(&frame(&m.encode()));
    }

    // feed the byte stream one byte at a time
    let mut asm = FrameAssembler::new();
    let mut decoded = Vec::new();
    for b in stream {
        asm.push(&[b]);
        while let Some(body) = asm.next_frame().unwrap() {
            decoded.push(ServerMessage::decode(&body).unwrap());
        }
    }
    assert_eq!(decoded, messages);
}
