// ABOUTME: Service-side session loop owning the transport, codec handle and buffers
// ABOUTME: Single-task dispatch with a keep-alive watchdog and two-phase bulk transfers

use crate::av::{self, CodecHandle, VideoDecoder, VideoEncoder};
use crate::codec::{Cmd, CmdResult, CmdType, MAX_BULK_SIZE};
use crate::framing::{read_cmd, send_result};
use crate::transport::Transport;
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long one loop iteration waits for a command before re-checking
/// the watchdog.
const CMD_TICK: Duration = Duration::from_millis(200);

/// Idle time without a single successful command read after which the
/// session gives up on its client.
const KEEP_ALIVE_LIMIT: Duration = Duration::from_secs(10);

/// Fatal session outcomes. Per-command failures are answered with a
/// Nack and never end the session.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("could not create transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("no H.264/HEVC codecs available")]
    NoCodecs,
}

/// Run one complete service session under `instance_id`: create the
/// transport, wait for the single peer, dispatch commands until the
/// peer stops the service, goes away, or goes quiet.
pub async fn serve(instance_id: &str, buffer_bytes: usize) -> Result<(), ServeError> {
    info!(instance_id, "starting codec service session");

    if let Err(e) = av::init() {
        error!(error = %e, "codec backend failed to initialize");
        return Err(ServeError::NoCodecs);
    }

    let encoders = av::list_encoders();
    let decoders = av::list_decoders();
    if encoders.is_empty() && decoders.is_empty() {
        error!("no encoders and decoders available");
        return Err(ServeError::NoCodecs);
    }

    info!("available encoders:");
    for name in &encoders {
        info!("  {name}");
    }
    info!("available decoders:");
    for name in &decoders {
        info!("  {name}");
    }

    let transport = Transport::create(instance_id, buffer_bytes).await?;
    Session::new(transport, encoders, decoders).run().await;
    Ok(())
}

/// One client's session state.
///
/// The session exclusively owns everything here; a single task runs
/// [`Session::run`] and nothing else touches the state. `frame_data`
/// holds encoder input frames while an encoder is open and decoded
/// output frames (drained FIFO by `GetFrame`) while a decoder is open;
/// `packet_data` holds the packets produced since the last `GetPacket`.
pub struct Session {
    transport: Transport,
    encoders: BTreeSet<String>,
    decoders: BTreeSet<String>,
    codec: Option<CodecHandle>,
    width: u16,
    height: u16,
    packet_data: Vec<u8>,
    frame_data: VecDeque<Vec<u8>>,
    last_keep_alive: Instant,
}

impl Session {
    /// A session over an accepted transport, exposing the given codec
    /// name sets.
    pub fn new(
        transport: Transport,
        encoders: BTreeSet<String>,
        decoders: BTreeSet<String>,
    ) -> Session {
        Session {
            transport,
            encoders,
            decoders,
            codec: None,
            width: 0,
            height: 0,
            packet_data: Vec::new(),
            frame_data: VecDeque::new(),
            last_keep_alive: Instant::now(),
        }
    }

    /// Dispatch commands until the session ends.
    ///
    /// Exactly one response frame is written per command read, before
    /// the next command is read. The loop exits on `StopService`, on a
    /// closed transport, or when no command has arrived for
    /// [`KEEP_ALIVE_LIMIT`].
    pub async fn run(mut self) {
        loop {
            if !self.transport.is_open() {
                info!("transport closed, ending session");
                break;
            }
            if self.last_keep_alive.elapsed() > KEEP_ALIVE_LIMIT {
                info!("keep-alive expired, ending session");
                break;
            }

            let Some(cmd) = read_cmd(&mut self.transport, Some(CMD_TICK)).await else {
                continue;
            };
            self.last_keep_alive = Instant::now();

            if self.dispatch(cmd).await {
                break;
            }
        }
        debug!("session finished");
    }

    /// Handle one command. Returns true when the session should stop.
    async fn dispatch(&mut self, cmd: Cmd) -> bool {
        match cmd.ty {
            CmdType::KeepAlive => {
                debug!("KeepAlive");
                self.reply(CmdResult::Ack, 0).await;
            }
            CmdType::GetEncoderCount => {
                let count = self.encoders.len() as u64;
                debug!(count, "GetEncoderCount");
                self.reply(CmdResult::Ack, count).await;
            }
            CmdType::GetDecoderCount => {
                let count = self.decoders.len() as u64;
                debug!(count, "GetDecoderCount");
                self.reply(CmdResult::Ack, count).await;
            }
            CmdType::GetEncoderName => self.send_name(true, cmd.size()).await,
            CmdType::GetDecoderName => self.send_name(false, cmd.size()).await,
            CmdType::OpenEncoder | CmdType::OpenDecoder => self.open_codec(&cmd).await,
            CmdType::Close => {
                info!("closing codec");
                self.clear_codec();
                self.reply(CmdResult::Ack, 0).await;
            }
            CmdType::Encode => self.encode(cmd.size()).await,
            CmdType::Decode => self.decode(cmd.size()).await,
            CmdType::Flush => self.flush().await,
            CmdType::GetPacket => self.send_packet().await,
            CmdType::GetFrame => self.send_frame().await,
            CmdType::StopService => {
                info!("stopping service");
                self.clear_codec();
                self.reply(CmdResult::Ack, 0).await;
                return true;
            }
            CmdType::Unknown => {
                warn!("unknown command");
                self.reply(CmdResult::Nack, 0).await;
            }
        }
        false
    }

    async fn reply(&mut self, result: CmdResult, size: u64) {
        send_result(&mut self.transport, result, size).await;
    }

    /// Destroy the codec handle and every buffer tied to it.
    fn clear_codec(&mut self) {
        self.codec = None;
        self.width = 0;
        self.height = 0;
        self.packet_data = Vec::new();
        self.frame_data = VecDeque::new();
    }

    async fn send_name(&mut self, encoders: bool, index: u64) {
        let set = if encoders { &self.encoders } else { &self.decoders };
        match set.iter().nth(index as usize).cloned() {
            Some(name) => {
                debug!(index, name = %name, "codec name request");
                self.reply(CmdResult::Ack, name.len() as u64).await;
                self.transport.write(name.as_bytes()).await;
            }
            None => {
                debug!(index, "codec name index out of range");
                self.reply(CmdResult::Nack, 0).await;
            }
        }
    }

    async fn open_codec(&mut self, cmd: &Cmd) {
        let Some(init) = cmd.init().cloned() else {
            self.reply(CmdResult::Nack, 0).await;
            return;
        };
        let as_decoder = cmd.ty == CmdType::OpenDecoder;

        let set = if as_decoder { &self.decoders } else { &self.encoders };
        let candidates: Vec<String> = av::resolve_candidates(set, &init.codec_name)
            .into_iter()
            .map(String::from)
            .collect();

        let mut opened = None;
        for name in &candidates {
            let result = if as_decoder {
                VideoDecoder::open(name, init.width, init.height).map(CodecHandle::Decoder)
            } else {
                VideoEncoder::open(name, init.width, init.height, init.fps, init.bps)
                    .map(CodecHandle::Encoder)
            };
            match result {
                Ok(handle) => {
                    opened = Some(handle);
                    break;
                }
                Err(e) => debug!(candidate = %name, error = %e, "open attempt failed"),
            }
        }

        match opened {
            Some(handle) => {
                info!(
                    codec = handle.name(),
                    kind = if as_decoder { "decoder" } else { "encoder" },
                    width = init.width,
                    height = init.height,
                    fps = init.fps,
                    bps = init.bps,
                    "codec opened"
                );
                // Opening replaces whatever handle was there before.
                self.codec = Some(handle);
                self.width = init.width;
                self.height = init.height;
                self.reply(CmdResult::Ack, 0).await;
            }
            None => {
                warn!(
                    requested = %init.codec_name,
                    kind = if as_decoder { "decoder" } else { "encoder" },
                    "failed to open codec"
                );
                self.clear_codec();
                self.reply(CmdResult::Nack, 0).await;
            }
        }
    }

    /// Two-phase `Encode`: the first result authorizes the payload
    /// upload, the second reports the codec outcome. A rejection in the
    /// first phase consumes no payload bytes.
    async fn encode(&mut self, size: u64) {
        // The upload must be exactly one frame for the open geometry; a
        // mismatched buffer queued into `frame_data` would be re-checked
        // and Nacked on every later Encode, jamming the encoder.
        let frame_len = u64::from(self.width) * u64::from(self.height) * 3 / 2;
        if !matches!(self.codec, Some(CodecHandle::Encoder(_))) || size != frame_len {
            warn!(size, frame_len, "Encode rejected: no encoder open or wrong frame size");
            self.reply(CmdResult::Nack, 0).await;
            return;
        }
        self.reply(CmdResult::Ack, 0).await;

        let mut data = vec![0u8; size as usize];
        if self.transport.read(&mut data, None).await != data.len() {
            error!("failed to read frame payload");
            self.reply(CmdResult::Nack, 0).await;
            return;
        }

        self.frame_data.push_back(data);
        // GetPacket hands back only what this batch produces.
        self.packet_data.clear();

        let Some(CodecHandle::Encoder(encoder)) = self.codec.as_mut() else {
            return;
        };
        match encoder.process(Some(&mut self.frame_data), &mut self.packet_data) {
            Ok(()) => {
                debug!(
                    width = self.width,
                    height = self.height,
                    packet_bytes = self.packet_data.len(),
                    "frame encoded"
                );
                self.reply(CmdResult::Ack, 0).await;
            }
            Err(e) => {
                error!(error = %e, "encode failed");
                self.reply(CmdResult::Nack, 0).await;
            }
        }
    }

    /// Two-phase `Decode`, symmetric to [`Session::encode`].
    async fn decode(&mut self, size: u64) {
        if !matches!(self.codec, Some(CodecHandle::Decoder(_))) || size > MAX_BULK_SIZE {
            warn!(size, "Decode rejected: no decoder open or oversized payload");
            self.reply(CmdResult::Nack, 0).await;
            return;
        }
        self.reply(CmdResult::Ack, 0).await;

        self.packet_data.resize(size as usize, 0);
        if self.transport.read(&mut self.packet_data, None).await != size as usize {
            error!("failed to read packet payload");
            self.packet_data.clear();
            self.reply(CmdResult::Nack, 0).await;
            return;
        }

        let Some(CodecHandle::Decoder(decoder)) = self.codec.as_mut() else {
            return;
        };
        match decoder.process(&mut self.frame_data, Some(&mut self.packet_data)) {
            Ok(()) => {
                debug!(frames = self.frame_data.len(), "packet batch decoded");
                self.reply(CmdResult::Ack, 0).await;
            }
            Err(e) => {
                error!(error = %e, "decode failed");
                self.reply(CmdResult::Nack, 0).await;
            }
        }
    }

    async fn flush(&mut self) {
        debug!("Flush");
        let result = match self.codec.as_mut() {
            None => None,
            Some(CodecHandle::Encoder(encoder)) => {
                Some(encoder.process(None, &mut self.packet_data))
            }
            Some(CodecHandle::Decoder(decoder)) => {
                Some(decoder.process(&mut self.frame_data, None))
            }
        };
        match result {
            None => {
                warn!("Flush rejected: no codec open");
                self.reply(CmdResult::Nack, 0).await;
            }
            Some(Ok(())) => self.reply(CmdResult::Ack, 0).await,
            Some(Err(e)) => {
                error!(error = %e, "flush failed");
                self.reply(CmdResult::Nack, 0).await;
            }
        }
    }

    async fn send_packet(&mut self) {
        debug!(size = self.packet_data.len(), "GetPacket");
        if self.packet_data.is_empty() {
            self.reply(CmdResult::Nack, 0).await;
            return;
        }
        let data = std::mem::take(&mut self.packet_data);
        self.reply(CmdResult::Ack, data.len() as u64).await;
        self.transport.write(&data).await;
    }

    async fn send_frame(&mut self) {
        debug!(backlog = self.frame_data.len(), "GetFrame");
        match self.frame_data.pop_front() {
            Some(data) => {
                self.reply(CmdResult::Ack, data.len() as u64).await;
                self.transport.write(&data).await;
            }
            None => self.reply(CmdResult::Nack, 0).await,
        }
    }
}
