// ABOUTME: Default client driving a codec service session over the transport
// ABOUTME: Issues commands, handles two-phase bulk uploads and pulls results

use crate::client::error::{ClientError, ClientResult};
use crate::codec::{Cmd, CmdResult, CmdType, InitInfo};
use crate::framing::{self, REPLY_TIMEOUT};
use crate::transport::Transport;
use tracing::debug;

/// Client handle for one codec service session.
///
/// All operations are strictly sequential: each command is answered
/// before the next one is sent. Pulling operations (`get_packet`,
/// `get_frame`) return `Ok(false)` when the service has nothing
/// buffered; that is how drain loops terminate.
///
/// ```rust,no_run
/// use avpipe::client::AvClient;
/// use avpipe::codec::InitInfo;
///
/// # async fn example() -> Result<(), avpipe::client::ClientError> {
/// let mut client = AvClient::connect("session-1").await?;
/// client.open_encoder(InitInfo {
///     bps: 5_000_000,
///     width: 1280,
///     height: 720,
///     fps: 30,
///     codec_name: "h264".into(),
/// }).await?;
///
/// let frame = vec![0u8; 1280 * 720 * 3 / 2];
/// client.encode(&frame).await?;
///
/// let mut packet = Vec::new();
/// while client.get_packet(&mut packet).await? {
///     // write the elementary-stream bytes somewhere
/// }
/// client.stop_service().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct AvClient {
    transport: Transport,
}

impl AvClient {
    /// Connect to a service already listening under `instance_id`.
    pub async fn connect(instance_id: &str) -> ClientResult<AvClient> {
        let transport = Transport::open(instance_id).await?;
        debug!(instance_id, "connected to codec service");
        Ok(AvClient { transport })
    }

    /// Wrap an already-open transport.
    pub fn from_transport(transport: Transport) -> AvClient {
        AvClient { transport }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// Drop the transport without stopping the service; its keep-alive
    /// watchdog will end the session.
    pub fn disconnect(&mut self) {
        self.transport.close();
    }

    /// Send `cmd` and insist on an Ack, returning the response size.
    async fn expect_ack(&mut self, cmd: &Cmd) -> ClientResult<u64> {
        let response = framing::send_cmd(&mut self.transport, cmd).await?;
        match response.result {
            CmdResult::Ack => Ok(response.size),
            CmdResult::Nack => Err(ClientError::Rejected),
        }
    }

    /// Reset the service's idle watchdog.
    pub async fn keep_alive(&mut self) -> ClientResult<()> {
        self.expect_ack(&Cmd::bare(CmdType::KeepAlive)).await.map(|_| ())
    }

    pub async fn encoder_count(&mut self) -> ClientResult<u64> {
        self.expect_ack(&Cmd::bare(CmdType::GetEncoderCount)).await
    }

    pub async fn decoder_count(&mut self) -> ClientResult<u64> {
        self.expect_ack(&Cmd::bare(CmdType::GetDecoderCount)).await
    }

    /// Name of the `index`-th enumerated encoder, in sorted order.
    pub async fn encoder_name(&mut self, index: u64) -> ClientResult<String> {
        self.fetch_name(CmdType::GetEncoderName, index).await
    }

    /// Name of the `index`-th enumerated decoder, in sorted order.
    pub async fn decoder_name(&mut self, index: u64) -> ClientResult<String> {
        self.fetch_name(CmdType::GetDecoderName, index).await
    }

    async fn fetch_name(&mut self, ty: CmdType, index: u64) -> ClientResult<String> {
        let len = self.expect_ack(&Cmd::sized(ty, index)).await?;
        if len == 0 {
            return Ok(String::new());
        }
        let mut buf = vec![0u8; len as usize];
        if self.transport.read(&mut buf, Some(REPLY_TIMEOUT)).await != buf.len() {
            return Err(self.stalled());
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Open an encoder, replacing any codec the session holds.
    pub async fn open_encoder(&mut self, init: InitInfo) -> ClientResult<()> {
        self.expect_ack(&Cmd::open_encoder(init)).await.map(|_| ())
    }

    /// Open a decoder, replacing any codec the session holds.
    pub async fn open_decoder(&mut self, init: InitInfo) -> ClientResult<()> {
        self.expect_ack(&Cmd::open_decoder(init)).await.map(|_| ())
    }

    /// Submit one raw YUV 4:2:0 frame for encoding.
    pub async fn encode(&mut self, frame: &[u8]) -> ClientResult<()> {
        self.upload(CmdType::Encode, frame).await
    }

    /// Submit a slice of compressed elementary-stream bytes for
    /// decoding.
    pub async fn decode(&mut self, packet: &[u8]) -> ClientResult<()> {
        self.upload(CmdType::Decode, packet).await
    }

    /// Two-phase bulk upload: the command declares the size, the first
    /// Ack authorizes the payload, the second result reports the codec
    /// outcome.
    async fn upload(&mut self, ty: CmdType, data: &[u8]) -> ClientResult<()> {
        self.expect_ack(&Cmd::sized(ty, data.len() as u64)).await?;
        if self.transport.write(data).await != data.len() {
            return Err(ClientError::Closed);
        }
        let response = framing::read_result(&mut self.transport).await?;
        match response.result {
            CmdResult::Ack => Ok(()),
            CmdResult::Nack => Err(ClientError::Rejected),
        }
    }

    /// Drain the open codec's internal pipeline.
    pub async fn flush(&mut self) -> ClientResult<()> {
        self.expect_ack(&Cmd::bare(CmdType::Flush)).await.map(|_| ())
    }

    /// Pull the packets buffered since the last pull. `Ok(false)` means
    /// nothing was buffered.
    pub async fn get_packet(&mut self, data: &mut Vec<u8>) -> ClientResult<bool> {
        framing::fetch_packet(&mut self.transport, data).await.map_err(ClientError::from)
    }

    /// Pull the oldest decoded frame. `Ok(false)` means the backlog was
    /// empty.
    pub async fn get_frame(&mut self, data: &mut Vec<u8>) -> ClientResult<bool> {
        framing::fetch_frame(&mut self.transport, data).await.map_err(ClientError::from)
    }

    /// Close the session's codec. Idempotent.
    pub async fn close_codec(&mut self) -> ClientResult<()> {
        self.expect_ack(&Cmd::bare(CmdType::Close)).await.map(|_| ())
    }

    /// Ask the service to exit its session loop.
    pub async fn stop_service(&mut self) -> ClientResult<()> {
        self.expect_ack(&Cmd::bare(CmdType::StopService)).await.map(|_| ())
    }

    fn stalled(&self) -> ClientError {
        if self.transport.is_open() { ClientError::Timeout } else { ClientError::Closed }
    }
}
