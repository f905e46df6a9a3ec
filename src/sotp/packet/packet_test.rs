use bytes::Bytes;

use super::*;
use crate::error::{Error, Result};

#[test]
fn test_packet_unmarshal_too_small() {
    let result = Packet::unmarshal(&Bytes::from_static(&[0x01, 0x00, 0x02]));
    assert_eq!(result, Err(Error::ErrPacketTooSmall));
}

#[test]
fn test_packet_unmarshal_plain_data() -> Result<()> {
    let raw = Bytes::from_static(&[
        0x2a, // session_id
        0x00, 0x07, // seq_number
        0x00, 0x06, // ack
        0x00, 0x03, // data_len
        0x02, // flags: PUSH
        0xde, 0xad, 0xbe, // content
    ]);
    let pkt = Packet::unmarshal(&raw)?;

    assert_eq!(pkt.session_id, 42);
    assert_eq!(pkt.seq_number, 7);
    assert_eq!(pkt.ack, 6);
    assert!(pkt.is_push());
    assert!(!pkt.is_sync());
    assert_eq!(pkt.sync_type, None);
    assert_eq!(pkt.content.as_ref(), &[0xde, 0xad, 0xbe]);
    Ok(())
}

#[test]
fn test_packet_unmarshal_sync_sub_header() -> Result<()> {
    let raw = Bytes::from_static(&[
        0x00, // session_id 0 (initial request)
        0x00, 0x01, // seq_number
        0x00, 0x00, // ack
        0x00, 0x02, // data_len (tag)
        0x01, // flags: SYNC
        0x00, // sync_type: RequestAuth
        0xab, 0x01, // tag
    ]);
    let pkt = Packet::unmarshal(&raw)?;

    assert!(pkt.is_sync_type(SyncType::RequestAuth));
    assert_eq!(pkt.content.as_ref(), &[0xab, 0x01]);
    Ok(())
}

#[test]
fn test_packet_unmarshal_sync_missing_sub_header() {
    let raw = Bytes::from_static(&[0x01, 0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x01]);
    let result = Packet::unmarshal(&raw);
    assert_eq!(result, Err(Error::ErrSyncWithoutSubHeader));
}

#[test]
fn test_packet_unmarshal_data_len_mismatch() {
    let raw = Bytes::from_static(&[
        0x01, 0x00, 0x02, 0x00, 0x01, 0x00, 0x05, 0x00, 0xaa, 0xbb,
    ]);
    let result = Packet::unmarshal(&raw);
    assert_eq!(
        result,
        Err(Error::ErrDataLenMismatch {
            data_len: 5,
            measured: 2
        })
    );
}

#[test]
fn test_packet_unmarshal_unknown_sync_type() {
    let raw = Bytes::from_static(&[0x01, 0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x01, 0x03]);
    let result = Packet::unmarshal(&raw);
    assert_eq!(result, Err(Error::ErrUnknownSyncType(3)));
}

#[test]
fn test_packet_roundtrip() -> Result<()> {
    let packets = vec![
        Packet {
            session_id: 0,
            seq_number: 1,
            ack: 0,
            flags: FLAG_SYNC,
            sync_type: Some(SyncType::RequestAuth),
            content: Bytes::from_static(&[0xab, 0x01]),
        },
        Packet {
            session_id: 9,
            seq_number: 1000,
            ack: 999,
            flags: FLAG_PUSH,
            sync_type: None,
            content: Bytes::from_static(b"last chunk"),
        },
        Packet {
            session_id: 9,
            seq_number: u16::MAX,
            ack: 12,
            flags: FLAG_SYNC,
            sync_type: Some(SyncType::Poll),
            content: Bytes::new(),
        },
        Packet {
            session_id: 200,
            seq_number: 3,
            ack: 2,
            flags: FLAG_NONE,
            sync_type: None,
            content: Bytes::new(),
        },
    ];

    for want in packets {
        let raw = want.marshal()?;
        let got = Packet::unmarshal(&raw)?;
        assert_eq!(got, want, "roundtrip mismatch for {want}");
    }
    Ok(())
}

#[test]
fn test_packet_marshal_sync_without_sub_header() {
    let pkt = Packet {
        flags: FLAG_SYNC,
        sync_type: None,
        ..Default::default()
    };
    assert_eq!(pkt.marshal(), Err(Error::ErrSyncWithoutSubHeader));
}

#[test]
fn test_peek_session_id() -> Result<()> {
    let pkt = Packet {
        session_id: 77,
        seq_number: 5,
        ack: 4,
        ..Default::default()
    };
    let raw = pkt.marshal()?;
    assert_eq!(Packet::peek_session_id(&raw)?, 77);
    assert_eq!(Packet::peek_session_id(&[]), Err(Error::ErrPacketTooSmall));
    Ok(())
}
