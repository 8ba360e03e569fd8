use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Bytes requested per socket read
const READ_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Raw stream text exactly as it arrived, not split on lines or tags
    Chunk(String),
    Connected,
    Disconnected,
}

/// Turns arbitrary byte reads into UTF-8 text.
///
/// A multi-byte sequence cut by a read boundary is held until the next read.
/// Invalid bytes become U+FFFD rather than failing the stream.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.carry);
        input.extend_from_slice(bytes);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Bytes held back waiting for the rest of a sequence
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Emit whatever is still held, lossily (end of stream)
    pub fn finish(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&carry).into_owned()
    }
}

pub struct LichConnection;

impl LichConnection {
    pub async fn start(
        host: &str,
        port: u16,
        server_tx: mpsc::UnboundedSender<ServerMessage>,
        mut command_rx: mpsc::UnboundedReceiver<String>,
    ) -> Result<()> {
        info!("Connecting to Lich at {}:{}...", host, port);

        let stream = TcpStream::connect(format!("{}:{}", host, port))
            .await
            .context("Failed to connect to Lich")?;

        info!("Connected successfully");

        let (mut reader, mut writer) = tokio::io::split(stream);

        // Send frontend PID
        let pid = std::process::id();
        let msg = format!("SET_FRONTEND_PID:{}\n", pid);
        writer.write_all(msg.as_bytes()).await?;
        writer.flush().await?;
        debug!("Sent frontend PID: {}", pid);

        let _ = server_tx.send(ServerMessage::Connected);

        // Reader task: forward reads as-is, the parser copes with any split
        let server_tx_clone = server_tx.clone();
        let read_handle = tokio::spawn(async move {
            let mut decoder = Utf8Decoder::new();
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        info!("Connection closed by server");
                        let tail = decoder.finish();
                        if !tail.is_empty() {
                            warn!("Stream ended inside a UTF-8 sequence");
                            let _ = server_tx_clone.send(ServerMessage::Chunk(tail));
                        }
                        let _ = server_tx_clone.send(ServerMessage::Disconnected);
                        break;
                    }
                    Ok(n) => {
                        let chunk = decoder.decode(&buf[..n]);
                        if !chunk.is_empty() {
                            let _ = server_tx_clone.send(ServerMessage::Chunk(chunk));
                        }
                    }
                    Err(e) => {
                        error!("Error reading from server: {}", e);
                        let _ = server_tx_clone.send(ServerMessage::Disconnected);
                        break;
                    }
                }
            }
        });

        // Writer loop (runs in this function)
        while let Some(cmd) = command_rx.recv().await {
            debug!("Sending command: {}", cmd);
            if let Err(e) = writer.write_all(cmd.as_bytes()).await {
                error!("Failed to write command: {}", e);
                break;
            }
            if let Err(e) = writer.write_all(b"\n").await {
                error!("Failed to write newline: {}", e);
                break;
            }
            if let Err(e) = writer.flush().await {
                error!("Failed to flush: {}", e);
                break;
            }
        }

        // Wait for reader to finish
        let _ = read_handle.await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn test_decoder_passes_ascii_through() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"<prompt>&gt;</prompt>"), "<prompt>&gt;</prompt>");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_carries_split_sequence() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "caf\u{e9} \u{2603}".as_bytes();
        // Cut inside the three-byte snowman
        let cut = bytes.len() - 1;

        assert_eq!(decoder.decode(&bytes[..cut]), "caf\u{e9} ");
        assert_eq!(decoder.pending(), 2);
        assert_eq!(decoder.decode(&bytes[cut..]), "\u{2603}");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_finish_flushes_carry() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"x\xe2\x98"), "x");
        assert_eq!(decoder.finish(), "\u{fffd}");
        assert_eq!(decoder.pending(), 0);
    }

    #[tokio::test]
    async fn test_connection_handshake_and_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut handshake = String::new();
            socket.read_line(&mut handshake).await.unwrap();
            socket.get_mut().write_all(b"<prompt>&gt;</prompt>").await.unwrap();
            let mut command = String::new();
            socket.read_line(&mut command).await.unwrap();
            (handshake, command)
        });

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let client = tokio::spawn(async move {
            LichConnection::start("127.0.0.1", port, server_tx, command_rx).await
        });

        assert!(matches!(server_rx.recv().await, Some(ServerMessage::Connected)));
        let mut received = String::new();
        while received.len() < "<prompt>&gt;</prompt>".len() {
            match server_rx.recv().await {
                Some(ServerMessage::Chunk(chunk)) => received.push_str(&chunk),
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(received, "<prompt>&gt;</prompt>");

        command_tx.send("look".to_string()).unwrap();
        let (handshake, command) = server.await.unwrap();
        assert!(handshake.starts_with("SET_FRONTEND_PID:"));
        assert_eq!(command, "look\n");

        assert!(matches!(server_rx.recv().await, Some(ServerMessage::Disconnected)));
        drop(command_tx);
        client.await.unwrap().unwrap();
    }
}
