//! Stream framing tests: length cap, clean close vs truncation.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use tokio::io::AsyncWriteExt;

use crosswire_core::error::Error;
use crosswire_core::protocol::frame::{encode_frame, read_frame, write_frame, MAX_FRAME_BYTES};

#[tokio::test]
async fn frame_round_trip() {
    let (mut a, mut b) = tokio::io::duplex(64 * 1024);
    write_frame(&mut a, b"hello frame").await.expect("write");
    let got = read_frame(&mut b).await.expect("read");
    assert_eq!(&got[..], b"hello frame");
}

#[tokio::test]
async fn empty_frame_round_trip() {
    let (mut a, mut b) = tokio::io::duplex(64);
    write_frame(&mut a, b"").await.expect("write");
    let got = read_frame(&mut b).await.expect("read");
    assert!(got.is_empty());
}

#[tokio::test]
async fn oversize_length_rejected_before_body_read() {
    let (mut a, mut b) = tokio::io::duplex(64);
    // Declare 9 MiB but provide only the prefix plus a few bytes. If the
    // reader tried to read the declared body it would block forever on this
    // small duplex pipe; the oversize check must fire on the prefix alone.
    let declared = (MAX_FRAME_BYTES as u32) + 1;
    a.write_all(&declared.to_le_bytes()).await.unwrap();
    a.write_all(b"junk").await.unwrap();

    let err = read_frame(&mut b).await.expect_err("must reject");
    match err {
        Error::FrameOversize { len, max } => {
            assert_eq!(len, MAX_FRAME_BYTES + 1);
            assert_eq!(max, MAX_FRAME_BYTES);
        }
        other => panic!("expected FrameOversize, got {other}"),
    }
}

#[tokio::test]
async fn clean_close_at_boundary_is_peer_closed() {
    let (a, mut b) = tokio::io::duplex(64);
    drop(a);
    let err = read_frame(&mut b).await.expect_err("must fail");
    assert!(matches!(err, Error::PeerClosed), "got {err}");
}

#[tokio::test]
async fn close_mid_prefix_is_truncated() {
    let (mut a, mut b) = tokio::io::duplex(64);
    a.write_all(&[0x05, 0x00]).await.unwrap();
    drop(a);
    let err = read_frame(&mut b).await.expect_err("must fail");
    assert!(matches!(err, Error::Truncated("length prefix")), "got {err}");
}

#[tokio::test]
async fn close_mid_body_is_truncated() {
    let (mut a, mut b) = tokio::io::duplex(64);
    a.write_all(&8u32.to_le_bytes()).await.unwrap();
    a.write_all(b"abc").await.unwrap();
    drop(a);
    let err = read_frame(&mut b).await.expect_err("must fail");
    assert!(matches!(err, Error::Truncated("frame body")), "got {err}");
}

#[test]
fn encode_frame_rejects_oversize_payload() {
    let payload = vec![0u8; MAX_FRAME_BYTES + 1];
    assert!(matches!(
        encode_frame(&payload),
        Err(Error::FrameOversize { .. })
    ));
}

#[test]
fn encode_frame_prefix_is_little_endian() {
    let frame = encode_frame(b"abcd").expect("encode");
    assert_eq!(&frame[..4], &4u32.to_le_bytes());
    assert_eq!(&frame[4..], b"abcd");
}
