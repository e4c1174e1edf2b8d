// Length-delimited message framing.
//
// Wire format: a 4-byte big-endian length prefix followed by a JSON-encoded
// message. Both helpers work on raw byte slices over any `Read`/`Write`
// stream — JSON encoding stays with the caller, so the framing layer never
// needs to know about message types.
//
// `MAX_FRAME_SIZE` caps allocation from hostile or corrupt length prefixes.
// Table state blobs are small (a battle map, some tokens, dice history);
// 1 MB is generous headroom.

use std::io::{self, Read, Write};

/// Maximum allowed frame size (1 MB). A length prefix beyond this is treated
/// as corrupt and the frame is refused before any allocation happens.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Write one frame: 4-byte big-endian length, then the payload, then flush.
pub fn write_frame<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let len = msg.len();
    if len > MAX_FRAME_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }
    #[expect(clippy::cast_possible_truncation)]
    let len_bytes = (len as u32).to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(msg)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame: 4-byte big-endian length, then the payload.
///
/// Returns `UnexpectedEof` if the stream closes before or during a frame and
/// `InvalidData` if the length prefix exceeds `MAX_FRAME_SIZE`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn roundtrip_one_frame() {
        let original = br#"{"type":"list"}"#;
        let mut buf = Vec::new();
        write_frame(&mut buf, original).unwrap();

        let mut cursor = Cursor::new(&buf);
        let recovered = read_frame(&mut cursor).unwrap();
        assert_eq!(recovered, original);
    }

    #[test]
    fn roundtrip_empty_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"").unwrap();

        let mut cursor = Cursor::new(&buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn frames_read_back_in_order() {
        let frames: Vec<&[u8]> = vec![b"first", b"second", b"third"];
        let mut buf = Vec::new();
        for frame in &frames {
            write_frame(&mut buf, frame).unwrap();
        }

        let mut cursor = Cursor::new(&buf);
        for expected in &frames {
            assert_eq!(read_frame(&mut cursor).unwrap(), *expected);
        }
    }

    #[test]
    fn refuses_oversized_write() {
        let big = vec![0u8; MAX_FRAME_SIZE as usize + 1];
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, &big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn refuses_oversized_length_prefix() {
        // A prefix claiming more than MAX_FRAME_SIZE must fail before any
        // payload read. An HTTP request line hitting the framed port looks
        // exactly like this ("GET " is ~1.2 GB as a big-endian length).
        let fake_len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(fake_len.to_vec());
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_prefix_is_eof() {
        let mut cursor = Cursor::new(vec![0u8, 1]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn truncated_payload_is_eof() {
        // Prefix promises 10 bytes, only 3 follow.
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
