//! Request/response delivery between the client and the server.
//!
//! The cache logic only needs ordered request/response exchanges with a
//! stable connection identity. Frames are:
//!
//! ```not_rust
//! request:  u8 MessageType, body
//! response: u8 status (0 = ok, 1 = error), body or utf-8 error message
//! ```
//!
//! Over TCP each frame is additionally prefixed with its length as a
//! big-endian `u32`; both sides use the same [`framed`] codec.

use std::{
    fmt::Debug as StdDebug,
    sync::{Mutex, PoisonError},
};

use color_eyre::{
    Result,
    eyre::{Context, OptionExt, bail},
};
use derive_more::{Debug, Display, From};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    runtime::Runtime,
};
use tokio_util::{
    bytes::Bytes,
    codec::{Framed, LengthDelimitedCodec},
};
use tracing::{instrument, trace};

use crate::message::{MessageType, WireMessage};

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// Identity of one client connection as seen by the server.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, From)]
#[display("conn#{_0}")]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Sends one request and waits for its response.
///
/// Implementations deliver requests from one client in order; callers that
/// need a multi-message sequence to be uninterrupted serialize themselves.
pub trait NetworkClient: StdDebug + Send + Sync {
    /// Send a request body and return the response body. A response with the
    /// error status is returned as an `Err`.
    fn send(&self, message: MessageType, body: &[u8]) -> Result<Vec<u8>>;
}

/// Typed requests on top of [`NetworkClient::send`].
pub trait NetworkClientExt: NetworkClient {
    fn request<Req: WireMessage, Res: WireMessage>(
        &self,
        message: MessageType,
        request: &Req,
    ) -> Result<Res> {
        let response = self
            .send(message, &request.to_bytes())
            .with_context(|| format!("send {message}"))?;
        Res::from_bytes(&response).with_context(|| format!("decode {message} response"))
    }
}

impl<T: NetworkClient + ?Sized> NetworkClientExt for T {}

/// Build a request frame.
pub fn encode_request(message: MessageType, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.push(message as u8);
    frame.extend_from_slice(body);
    frame
}

/// Split a request frame into its type and body.
pub fn decode_request(frame: &[u8]) -> Result<(MessageType, &[u8])> {
    let (&tag, body) = frame.split_first().ok_or_eyre("empty request frame")?;
    Ok((MessageType::from_u8(tag)?, body))
}

/// Build a response frame from a handler result.
pub fn encode_response(result: Result<Vec<u8>>) -> Vec<u8> {
    match result {
        Ok(body) => {
            let mut frame = Vec::with_capacity(body.len() + 1);
            frame.push(STATUS_OK);
            frame.extend_from_slice(&body);
            frame
        }
        Err(err) => {
            let message = format!("{err:#}");
            let mut frame = Vec::with_capacity(message.len() + 1);
            frame.push(STATUS_ERROR);
            frame.extend_from_slice(message.as_bytes());
            frame
        }
    }
}

/// Turn a response frame back into the handler's result.
pub fn decode_response(frame: &[u8]) -> Result<Vec<u8>> {
    match frame.split_first() {
        Some((&STATUS_OK, body)) => Ok(body.to_vec()),
        Some((&STATUS_ERROR, message)) => {
            bail!("server error: {}", String::from_utf8_lossy(message))
        }
        Some((status, _)) => bail!("invalid response status {status}"),
        None => bail!("empty response frame"),
    }
}

/// Wrap a byte stream in the length-delimited framing used over TCP.
pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_framed(io)
}

/// Blocking TCP transport to a `depot` server.
///
/// The connection is driven by a private current-thread runtime so callers
/// stay synchronous.
#[derive(Debug)]
#[debug("TcpClient({address})")]
pub struct TcpClient {
    address: String,
    framed: Mutex<Framed<TcpStream, LengthDelimitedCodec>>,
    runtime: Runtime,
}

impl TcpClient {
    #[instrument(name = "TcpClient::connect")]
    pub fn connect(address: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .context("build transport runtime")?;
        let stream = runtime
            .block_on(TcpStream::connect(address))
            .with_context(|| format!("connect to {address}"))?;
        stream.set_nodelay(true).context("set nodelay")?;
        Ok(Self {
            address: address.to_string(),
            framed: Mutex::new(framed(stream)),
            runtime,
        })
    }
}

impl NetworkClient for TcpClient {
    #[instrument(name = "TcpClient::send", skip(body), fields(len = body.len()))]
    fn send(&self, message: MessageType, body: &[u8]) -> Result<Vec<u8>> {
        let frame = Bytes::from(encode_request(message, body));
        let mut framed = self.framed.lock().unwrap_or_else(PoisonError::into_inner);
        let response = self.runtime.block_on(async {
            framed.send(frame).await.context("write request")?;
            framed
                .next()
                .await
                .ok_or_eyre("connection closed by server")?
                .context("read response")
        })?;
        trace!(len = response.len(), "received response");
        decode_response(&response)
    }
}
