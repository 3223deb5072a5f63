use std::io;

use byteorder::{BE, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::FRAME_HEADER_LEN;

/// Reads one length-prefixed frame into `buf` and returns the payload
/// (tag + fields). An oversized length is reported as InvalidData before
/// any payload byte is read, so a corrupt stream cannot force a huge
/// allocation. EOF on the length header surfaces as UnexpectedEof.
pub async fn read_frame<'a, R: AsyncRead + Unpin>(
    read: &mut R,
    buf: &'a mut Vec<u8>,
    max_len: usize,
) -> io::Result<&'a [u8]> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    read.read_exact(&mut header).await?;
    let len = BE::read_u32(&header) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds maximum of {max_len}"),
        ));
    }
    buf.resize(len, 0);
    read.read_exact(buf).await?;
    Ok(&buf[..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use freshet_core::file_info::{ArchivePath, FileId, FileInfo};
    use tokio::io::AsyncWriteExt;

    fn notice(path: &str) -> Message {
        let info = FileInfo::new(
            FileId::new(ArchivePath::new(path).unwrap()),
            10,
            8,
            600,
        )
        .unwrap();
        Message::FileNotice(info)
    }

    #[tokio::test]
    async fn test_read_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let first = notice("a");
        let second = notice("b");
        let mut wire = Vec::new();
        first.serialize(&mut wire).unwrap();
        second.serialize(&mut wire).unwrap();
        client.write_all(&wire).await.unwrap();
        drop(client);

        let mut buf = Vec::new();
        let payload = read_frame(&mut server, &mut buf, 1 << 16).await.unwrap();
        assert_eq!(Message::deserialize(payload).unwrap(), first);
        let payload = read_frame(&mut server, &mut buf, 1 << 16).await.unwrap();
        assert_eq!(Message::deserialize(payload).unwrap(), second);

        let err = read_frame(&mut server, &mut buf, 1 << 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_read() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let mut buf = Vec::new();
        let err = read_frame(&mut server, &mut buf, 1 << 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
