//! Codec layer: how RPC envelopes travel over an open connection.
//!
//! Three disciplines are supported, chosen by the listener from the way the
//! connection was opened (never negotiated):
//!
//! - **binary**: MessagePack envelopes, each prefixed with a 4-byte big-endian
//!   length. Used between kites.
//! - **json**: one JSON envelope per line. Handy with `nc` or a script.
//! - **websocket**: one JSON envelope per text frame, for browsers.
//!
//! A [`ServerCodec`] is split into a [`RequestReader`] and a
//! [`ResponseWriter`] so the serve loop can answer requests out of order.

use crate::error::WireError;
use crate::message::{Origin, RpcRequest, RpcResponse};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::sync::mpsc;

/// Maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Reads incoming requests off a connection.
#[async_trait]
pub trait RequestReader: Send {
    /// Next request, or `None` once the peer closed the connection cleanly.
    async fn read_request(&mut self) -> Result<Option<RpcRequest>, WireError>;
}

/// Writes responses back to the caller.
#[async_trait]
pub trait ResponseWriter: Send {
    async fn write_response(&mut self, response: &RpcResponse) -> Result<(), WireError>;
}

/// A connection wrapped in one of the three codecs.
pub struct ServerCodec {
    origin: Origin,
    reader: Box<dyn RequestReader>,
    writer: Box<dyn ResponseWriter>,
}

impl ServerCodec {
    /// Length-prefixed MessagePack, the kite-to-kite codec.
    pub fn binary<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            origin: Origin::Binary,
            reader: Box::new(BinaryReader { reader }),
            writer: Box::new(BinaryWriter { writer }),
        }
    }

    /// Newline-delimited JSON for generic RPC clients.
    pub fn json<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            origin: Origin::Json,
            reader: Box::new(JsonReader {
                reader: BufReader::new(reader),
                line: String::new(),
            }),
            writer: Box::new(JsonWriter { writer }),
        }
    }

    /// One JSON envelope per websocket message. Responses are queued on
    /// `outgoing`, which a separate task drains into the socket.
    pub fn websocket(
        incoming: SplitStream<WebSocket>,
        outgoing: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            origin: Origin::Websocket,
            reader: Box::new(WebSocketReader { incoming }),
            writer: Box::new(WebSocketWriter { outgoing }),
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn into_parts(self) -> (Origin, Box<dyn RequestReader>, Box<dyn ResponseWriter>) {
        (self.origin, self.reader, self.writer)
    }
}

/// Encode a value as a binary frame (4-byte big-endian length + MessagePack).
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, WireError> {
    let body = rmp_serde::to_vec_named(msg)?;
    if body.len() > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: body.len() as u32,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let len = body.len() as u32;
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Write one binary frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let bytes = encode_frame(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one binary frame. A clean EOF before the header is `ConnectionClosed`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(rmp_serde::from_slice(&body)?)
}

struct BinaryReader<S> {
    reader: ReadHalf<S>,
}

#[async_trait]
impl<S> RequestReader for BinaryReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_request(&mut self) -> Result<Option<RpcRequest>, WireError> {
        match read_frame(&mut self.reader).await {
            Ok(req) => Ok(Some(req)),
            Err(WireError::ConnectionClosed) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

struct BinaryWriter<S> {
    writer: WriteHalf<S>,
}

#[async_trait]
impl<S> ResponseWriter for BinaryWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write_response(&mut self, response: &RpcResponse) -> Result<(), WireError> {
        write_frame(&mut self.writer, response).await
    }
}

struct JsonReader<S> {
    reader: BufReader<ReadHalf<S>>,
    line: String,
}

#[async_trait]
impl<S> RequestReader for JsonReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_request(&mut self) -> Result<Option<RpcRequest>, WireError> {
        loop {
            self.line.clear();
            let n = (&mut self.reader)
                .take(MAX_MESSAGE_SIZE as u64 + 1)
                .read_line(&mut self.line)
                .await?;
            if n == 0 {
                return Ok(None);
            }
            if n > MAX_MESSAGE_SIZE as usize {
                return Err(WireError::MessageTooLarge {
                    size: n as u32,
                    max: MAX_MESSAGE_SIZE,
                });
            }
            if !self.line.ends_with('\n') {
                return Err(WireError::ConnectionClosed);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

struct JsonWriter<S> {
    writer: WriteHalf<S>,
}

#[async_trait]
impl<S> ResponseWriter for JsonWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write_response(&mut self, response: &RpcResponse) -> Result<(), WireError> {
        let mut bytes = serde_json::to_vec(response)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

struct WebSocketReader {
    incoming: SplitStream<WebSocket>,
}

#[async_trait]
impl RequestReader for WebSocketReader {
    async fn read_request(&mut self) -> Result<Option<RpcRequest>, WireError> {
        loop {
            let msg = match self.incoming.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => return Err(WireError::WebSocket(e.to_string())),
                None => return Ok(None),
            };
            match msg {
                Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
                Message::Binary(bytes) => return Ok(Some(serde_json::from_slice(&bytes)?)),
                Message::Close(_) => return Ok(None),
                // Ping/pong are answered by the websocket layer
                _ => continue,
            }
        }
    }
}

struct WebSocketWriter {
    outgoing: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl ResponseWriter for WebSocketWriter {
    async fn write_response(&mut self, response: &RpcResponse) -> Result<(), WireError> {
        let text = serde_json::to_string(response)?;
        self.outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| WireError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_length_prefix() {
        let req = RpcRequest {
            id: 1,
            method: "devrim/math.Square".to_string(),
            params: json!(4),
            caller: None,
        };
        let bytes = encode_frame(&req).unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded: RpcRequest = rmp_serde::from_slice(&bytes[4..]).unwrap();
        assert_eq!(decoded, req);
    }

    #[tokio::test]
    async fn test_binary_codec_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut reader, mut writer) = ServerCodec::binary(server).into_parts();
        let (mut client_rd, mut client_wr) = tokio::io::split(client);

        let req = RpcRequest {
            id: 9,
            method: "ns.Echo".to_string(),
            params: json!({"text": "hi"}),
            caller: None,
        };
        write_frame(&mut client_wr, &req).await.unwrap();
        let got = reader.read_request().await.unwrap().unwrap();
        assert_eq!(got, req);

        writer
            .write_response(&RpcResponse::ok(9, json!("hi")))
            .await
            .unwrap();
        let resp: RpcResponse = read_frame(&mut client_rd).await.unwrap();
        assert_eq!(resp.id, 9);
        assert_eq!(resp.result, json!("hi"));

        drop(client_wr);
        drop(client_rd);
        assert!(reader.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_codec_skips_blank_lines_and_rejects_garbage() {
        let (client, server) = tokio::io::duplex(1024);
        let (origin, mut reader, _writer) = ServerCodec::json(server).into_parts();
        assert_eq!(origin, Origin::Json);
        let (_client_rd, mut client_wr) = tokio::io::split(client);

        client_wr
            .write_all(b"\n{\"id\":1,\"method\":\"ns.Ping\"}\nnot json\n")
            .await
            .unwrap();
        let first = reader.read_request().await.unwrap().unwrap();
        assert_eq!(first.method, "ns.Ping");
        assert!(matches!(
            reader.read_request().await,
            Err(WireError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_json_line_without_newline_is_bounded() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_, mut reader, _) = ServerCodec::json(server).into_parts();
        let (_rd, mut wr) = tokio::io::split(client);

        let writer = tokio::spawn(async move {
            let chunk = vec![b'x'; 64 * 1024];
            let mut sent = 0usize;
            while sent <= MAX_MESSAGE_SIZE as usize {
                if wr.write_all(&chunk).await.is_err() {
                    break;
                }
                sent += chunk.len();
            }
            wr
        });
        assert!(matches!(
            reader.read_request().await,
            Err(WireError::MessageTooLarge { .. })
        ));
        drop(reader);
        let _ = writer.await;
    }

    #[tokio::test]
    async fn test_json_truncated_last_line_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut reader, _) = ServerCodec::json(server).into_parts();
        let (_rd, mut wr) = tokio::io::split(client);
        wr.write_all(b"{\"id\":1,\"method\":\"ns.Ping\"}").await.unwrap();
        wr.shutdown().await.unwrap();
        drop(wr);
        assert!(matches!(
            reader.read_request().await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (client, server) = tokio::io::duplex(64);
        let (_, mut reader, _) = ServerCodec::binary(server).into_parts();
        let (_rd, mut wr) = tokio::io::split(client);
        wr.write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            reader.read_request().await,
            Err(WireError::MessageTooLarge { .. })
        ));
    }
}
