// Per-connection framing over a TCP stream.
//
// The decoder walks header -> body -> deliver; a body size past the
// configured cap or a bad magic word is a fault that disconnects the
// session.  Partial reads and writes are absorbed by the async read/write
// primitives, so each call here either completes a whole frame or fails.
use anyhow::{Context, Result};
use bytes::BytesMut;
use muscle_wire::{frame, FrameHeader, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Reads one framed message.  `Ok(None)` is a clean close at a frame
/// boundary; every other shortfall is an error.
pub async fn read_message(
    stream: &mut OwnedReadHalf,
    scratch: &mut BytesMut,
    max_body: usize,
) -> Result<Option<Message>> {
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match stream.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("read frame header"),
    }
    let header = FrameHeader::decode(&header_bytes).context("decode frame header")?;
    // Validate the declared size before allocating on the peer's behalf.
    let body_len = header.check_body_len(max_body).context("frame body size")?;
    scratch.clear();
    scratch.resize(body_len, 0);
    stream
        .read_exact(&mut scratch[..])
        .await
        .context("read frame body")?;
    let msg = Message::unflatten(scratch).context("decode message")?;
    metrics::counter!("reflectd_frames_in_total").increment(1);
    Ok(Some(msg))
}

pub async fn write_message(stream: &mut OwnedWriteHalf, msg: &Message) -> Result<()> {
    stream
        .write_all(&frame::encode_frame(msg))
        .await
        .context("write frame")?;
    metrics::counter!("reflectd_frames_out_total").increment(1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use muscle_wire::Field;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (client.expect("connect"), server.expect("accept").0)
    }

    #[tokio::test]
    async fn frames_cross_a_real_socket() {
        let (client, server) = pair().await;
        let (_client_read, mut client_write) = client.into_split();
        let (mut server_read, _server_write) = server.into_split();

        let mut msg = Message::new(5);
        msg.set_field("k", Field::String(vec!["v".into()]));
        write_message(&mut client_write, &msg).await.expect("write");

        let mut scratch = BytesMut::new();
        let received = read_message(&mut server_read, &mut scratch, 1 << 20)
            .await
            .expect("read")
            .expect("message");
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (client, server) = pair().await;
        drop(client);
        let (mut server_read, _keep) = server.into_split();
        let mut scratch = BytesMut::new();
        let got = read_message(&mut server_read, &mut scratch, 1 << 20)
            .await
            .expect("read");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn oversized_bodies_fault_the_decoder() {
        let (client, server) = pair().await;
        let (_client_read, mut client_write) = client.into_split();
        let (mut server_read, _server_write) = server.into_split();

        let mut msg = Message::new(5);
        msg.set_field("fill", Field::UInt8(vec![0u8; 4096]));
        write_message(&mut client_write, &msg).await.expect("write");

        let mut scratch = BytesMut::new();
        let err = read_message(&mut server_read, &mut scratch, 64)
            .await
            .expect_err("cap");
        assert!(err.to_string().contains("frame body size"));
    }

    #[tokio::test]
    async fn garbage_magic_faults_the_decoder() {
        let (client, server) = pair().await;
        let (_client_read, mut client_write) = client.into_split();
        let (mut server_read, _server_write) = server.into_split();

        client_write
            .write_all(&[0u8; FrameHeader::LEN])
            .await
            .expect("write");
        let mut scratch = BytesMut::new();
        let err = read_message(&mut server_read, &mut scratch, 1 << 20)
            .await
            .expect_err("magic");
        assert!(err.to_string().contains("frame header"));
    }
}
