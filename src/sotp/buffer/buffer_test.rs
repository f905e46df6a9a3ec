use bytes::Bytes;

use super::*;

#[test]
fn test_index_split_exact_multiple() {
    let index = Index::split(Bytes::from_static(b"abcdef"), 2);
    assert_eq!(index.len(), 3);
}

#[test]
fn test_index_split_remainder() {
    let index = Index::split(Bytes::from_static(b"abcdefg"), 3);
    assert_eq!(index.len(), 3);
}

#[test]
fn test_index_split_smaller_than_max() {
    let index = Index::split(Bytes::from_static(b"ab"), 256);
    assert_eq!(index.len(), 1);
}

#[test]
fn test_index_split_empty_payload_keeps_one_chunk() {
    // An empty write still produces one (empty, PUSH) chunk so the
    // message boundary survives.
    let index = Index::split(Bytes::new(), 16);
    assert_eq!(index.len(), 1);
}

#[test]
fn test_overlay_buffer_push_on_last_chunk() {
    let mut buf = OverlayBuffer::new();
    buf.add_index(Index::split(Bytes::from_static(b"aabbcc"), 2));

    let (c1, push1) = buf.get_chunk().unwrap();
    let (c2, push2) = buf.get_chunk().unwrap();
    let (c3, push3) = buf.get_chunk().unwrap();

    assert_eq!((c1.as_ref(), push1), (&b"aa"[..], false));
    assert_eq!((c2.as_ref(), push2), (&b"bb"[..], false));
    assert_eq!((c3.as_ref(), push3), (&b"cc"[..], true));
    assert!(!buf.any_index());
}

#[test]
fn test_overlay_buffer_fifo_across_indices() {
    let mut buf = OverlayBuffer::new();
    buf.add_index(Index::split(Bytes::from_static(b"1122"), 2));
    buf.add_index(Index::split(Bytes::from_static(b"33"), 2));

    let (c1, push1) = buf.get_chunk().unwrap();
    assert_eq!((c1.as_ref(), push1), (&b"11"[..], false));

    // Queueing more data must not disturb the partially drained head.
    buf.add_index(Index::split(Bytes::from_static(b"44"), 2));

    let (c2, push2) = buf.get_chunk().unwrap();
    assert_eq!((c2.as_ref(), push2), (&b"22"[..], true));
    let (c3, push3) = buf.get_chunk().unwrap();
    assert_eq!((c3.as_ref(), push3), (&b"33"[..], true));
    let (c4, push4) = buf.get_chunk().unwrap();
    assert_eq!((c4.as_ref(), push4), (&b"44"[..], true));
}

#[test]
fn test_overlay_buffer_empty_error() {
    let mut buf = OverlayBuffer::new();
    assert_eq!(buf.get_chunk(), Err(Error::ErrOverlayBufferEmpty));
}

#[test]
fn test_wrapper_buffer_drain_concatenates_in_order() {
    let mut buf = WrapperBuffer::new();
    buf.add_chunk(Bytes::from_static(b"one"));
    buf.add_chunk(Bytes::from_static(b"two"));
    buf.add_chunk(Bytes::from_static(b"three"));

    assert_eq!(buf.drain().unwrap().as_ref(), b"onetwothree");
    // Drained: next drain has nothing.
    assert_eq!(buf.drain(), Err(Error::ErrWrapperBufferEmpty));
}
