//! Wire protocol tests.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    AcceptMessage, ClientMessage, ExitMessage, Frame, InfoMessage, IoBuffer, IoStream,
    RejectMessage, ServerHello, ServerMessage, TimeSpec, WireError, LEN_PREFIX_SIZE,
    MESSAGE_SIZE_MAX,
};

#[test]
fn frame_roundtrip() {
    let frame = Frame::new(Bytes::from_static(b"hello, world!")).unwrap();
    let encoded = frame.encode_to_bytes();
    assert_eq!(encoded.len(), LEN_PREFIX_SIZE + 13);
    assert_eq!(&encoded[..4], &13u32.to_be_bytes());

    let mut buf = BytesMut::from(&encoded[..]);
    let decoded = Frame::decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded, frame);
    assert!(buf.is_empty());
}

#[test]
fn frame_incomplete_prefix() {
    let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
    assert!(Frame::decode(&mut buf).unwrap().is_none());
    assert_eq!(buf.len(), 3);
}

#[test]
fn frame_incomplete_payload_reserves_capacity() {
    let frame = Frame::new(Bytes::from_static(b"partial payload")).unwrap();
    let encoded = frame.encode_to_bytes();

    let mut buf = BytesMut::from(&encoded[..LEN_PREFIX_SIZE + 4]);
    assert!(Frame::decode(&mut buf).unwrap().is_none());
    // Nothing consumed, and there is room for the rest of the record.
    assert_eq!(buf.len(), LEN_PREFIX_SIZE + 4);
    assert!(buf.capacity() >= encoded.len());
}

#[test]
fn frame_oversize_prefix_is_fatal() {
    // 1 MiB announced, which is above the 512 KiB maximum.
    let mut buf = BytesMut::new();
    buf.put_u32(0x0010_0000);
    buf.put_slice(&[0u8; 64]);

    let err = Frame::decode(&mut buf).unwrap_err();
    assert!(matches!(
        err,
        WireError::ClientMessageTooLarge {
            size: 0x0010_0000,
            ..
        }
    ));
}

#[test]
fn frame_rejects_oversize_payload_on_encode() {
    let payload = Bytes::from(vec![0u8; MESSAGE_SIZE_MAX as usize + 1]);
    assert!(matches!(
        Frame::new(payload),
        Err(WireError::ServerMessageTooLarge { .. })
    ));
}

#[test]
fn two_frames_decode_in_order() {
    let first = ClientMessage::Hello(crate::ClientHello {
        client_id: "audit client 1.9".to_string(),
    });
    let second = ClientMessage::Stdout(IoBuffer {
        delay: TimeSpec::new(0, 250),
        data: b"output".to_vec(),
    });

    let mut buf = BytesMut::new();
    first.to_frame().unwrap().encode(&mut buf);
    second.to_frame().unwrap().encode(&mut buf);

    let f1 = Frame::decode(&mut buf).unwrap().unwrap();
    assert_eq!(ClientMessage::from_frame(&f1).unwrap(), first);
    let f2 = Frame::decode(&mut buf).unwrap().unwrap();
    assert_eq!(ClientMessage::from_frame(&f2).unwrap(), second);
    assert!(buf.is_empty());
}

#[test]
fn accept_message_roundtrip() {
    let msg = ClientMessage::Accept(AcceptMessage {
        submit_time: TimeSpec::new(1_700_000_000, 0),
        info: vec![
            InfoMessage::text("user", "alice"),
            InfoMessage::text("command", "/bin/ls"),
            InfoMessage::number("lines", 24),
        ],
        expect_iobufs: true,
    });

    let frame = msg.to_frame().unwrap();
    let decoded = ClientMessage::from_frame(&frame).unwrap();
    assert_eq!(decoded, msg);
    assert_eq!(decoded.name(), "AcceptMessage");
}

#[test]
fn reject_message_roundtrip() {
    let msg = ClientMessage::Reject(RejectMessage {
        submit_time: TimeSpec::new(1_700_000_000, 500),
        reason: "policy denied".to_string(),
        info: vec![InfoMessage::text("user", "mallory")],
    });

    let frame = msg.to_frame().unwrap();
    assert_eq!(ClientMessage::from_frame(&frame).unwrap(), msg);
}

#[test]
fn exit_message_with_signal() {
    let msg = ClientMessage::Exit(ExitMessage {
        exit_value: 0,
        signal: Some("TERM".to_string()),
        dumped_core: false,
        run_time: Some(TimeSpec::new(3, 0)),
    });

    let frame = msg.to_frame().unwrap();
    assert_eq!(ClientMessage::from_frame(&frame).unwrap(), msg);
}

#[test]
fn server_message_roundtrip() {
    let hello = ServerMessage::Hello(ServerHello {
        server_id: "LogVault Audit Server 0.3.1".to_string(),
    });
    let frame = hello.to_frame().unwrap();
    assert_eq!(ServerMessage::from_frame(&frame).unwrap(), hello);

    let commit = ServerMessage::CommitPoint(TimeSpec::new(3, 0));
    let frame = commit.to_frame().unwrap();
    assert_eq!(ServerMessage::from_frame(&frame).unwrap(), commit);
}

#[test]
fn io_buffer_helpers_cover_all_streams() {
    for stream in IoStream::ALL {
        let msg = ClientMessage::from_io_buffer(
            stream,
            IoBuffer {
                delay: TimeSpec::default(),
                data: vec![1, 2, 3],
            },
        );
        let (got, buf) = msg.io_buffer().expect("io buffer variant");
        assert_eq!(got, stream);
        assert_eq!(buf.data, vec![1, 2, 3]);
    }
    assert!(ClientMessage::Hello(crate::ClientHello {
        client_id: String::new(),
    })
    .io_buffer()
    .is_none());
}

#[test]
fn timespec_normalizes_and_orders() {
    let ts = TimeSpec::new(1, 1_500_000_000);
    assert_eq!(ts, TimeSpec::new(2, 500_000_000));

    let mut elapsed = TimeSpec::default();
    elapsed += TimeSpec::new(0, 600_000_000);
    elapsed += TimeSpec::new(0, 600_000_000);
    assert_eq!(elapsed, TimeSpec::new(1, 200_000_000));

    assert!(TimeSpec::new(3, 0) > TimeSpec::new(2, 999_999_999));
    assert_eq!(TimeSpec::new(0, 100_000_000).to_string(), "0.100000000");
}
