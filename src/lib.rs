//! Out-of-process H.264/HEVC codec service.
//!
//! A client process launches `avpipe-svc`, opens a local stream
//! transport by a shared instance name (a UNIX-domain socket, or a
//! named pipe on Windows), and drives an encoder or decoder through a
//! small fixed-layout binary command set. The service wraps libavcodec
//! and streams compressed packets or raw YUV 4:2:0 frames back across
//! the transport.
//!
//! ## Layers
//!
//! * [`transport`] — byte-stream carrier with bounded-time reads and a
//!   sticky close, created/opened by instance name.
//! * [`codec`] — the fixed-layout command record and response frame.
//! * [`framing`] — framed send/receive operations over the transport,
//!   including bulk payload transfer.
//! * [`av`] — the codec adapter: enumerate, open, feed, drain, flush.
//! * [`service`] — the single-task session loop with its keep-alive
//!   watchdog.
//! * [`client`] — the client handle, keep-alive timing and launch
//!   helpers.
//!
//! ## Protocol shape
//!
//! Every command is answered by exactly one `{result, size}` frame;
//! when `size > 0` that many bulk bytes follow. `Encode`/`Decode` use a
//! two-phase exchange: the first Ack authorizes the payload upload, the
//! second result reports the codec outcome. Sessions end on
//! `StopService`, transport loss, or 10 seconds without a command.

pub mod av;
pub mod client;
pub mod codec;
pub mod framing;
pub mod service;
pub mod transport;

pub use client::{AvClient, ClientError};
pub use codec::{Cmd, CmdResult, CmdType, InitInfo, Response};
pub use service::{serve, ServeError, Session};
pub use transport::Transport;
