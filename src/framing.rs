// Framed operations layered over the transport.
//
// The sender and receiver agree that command records and response
// frames are fixed-size byte blocks; bulk payloads follow the response
// that declares them. The protocol is strictly synchronous: one
// response frame per command, in order, before the next command.

use crate::codec::{Cmd, CmdResult, CmdType, Response};
use crate::transport::Transport;
use bytes::BytesMut;
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;

/// How long the client waits for a response frame or a declared bulk
/// payload.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-visible framing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("transport closed")]
    Closed,
}

fn stalled(transport: &Transport) -> FramingError {
    if transport.is_open() { FramingError::Timeout } else { FramingError::Closed }
}

/// Service side: read one command record, waiting up to `timeout`.
///
/// A short read returns `None`; with the transport still open that is
/// an ordinary idle tick.
pub async fn read_cmd(transport: &mut Transport, timeout: Option<Duration>) -> Option<Cmd> {
    let mut buf = [0u8; Cmd::WIRE_SIZE];
    if transport.read(&mut buf, timeout).await != buf.len() {
        return None;
    }
    Cmd::decode(&mut Cursor::new(&buf[..])).ok()
}

/// Service side: write one `{result, size}` response frame.
pub async fn send_result(transport: &mut Transport, result: CmdResult, size: u64) {
    let mut buf = BytesMut::with_capacity(Response::WIRE_SIZE);
    Response { result, size }.encode(&mut buf);
    transport.write(&buf).await;
}

/// Client side: read one response frame.
pub async fn read_result(transport: &mut Transport) -> Result<Response, FramingError> {
    let mut buf = [0u8; Response::WIRE_SIZE];
    if transport.read(&mut buf, Some(REPLY_TIMEOUT)).await != buf.len() {
        return Err(stalled(transport));
    }
    Response::decode(&mut Cursor::new(&buf[..])).map_err(|_| FramingError::Closed)
}

/// Client side: write one command record and read its response frame.
pub async fn send_cmd(transport: &mut Transport, cmd: &Cmd) -> Result<Response, FramingError> {
    let mut buf = BytesMut::with_capacity(Cmd::WIRE_SIZE);
    cmd.encode(&mut buf);
    if transport.write(&buf).await != buf.len() {
        return Err(FramingError::Closed);
    }
    read_result(transport).await
}

/// Client side: pull the buffered packet bytes out of the service.
/// `Ok(false)` means the service had nothing buffered.
pub async fn fetch_packet(
    transport: &mut Transport,
    data: &mut Vec<u8>,
) -> Result<bool, FramingError> {
    fetch_bulk(transport, CmdType::GetPacket, data).await
}

/// Client side: pull the oldest buffered frame out of the service.
/// `Ok(false)` means the backlog was empty.
pub async fn fetch_frame(
    transport: &mut Transport,
    data: &mut Vec<u8>,
) -> Result<bool, FramingError> {
    fetch_bulk(transport, CmdType::GetFrame, data).await
}

async fn fetch_bulk(
    transport: &mut Transport,
    ty: CmdType,
    data: &mut Vec<u8>,
) -> Result<bool, FramingError> {
    data.clear();

    let response = send_cmd(transport, &Cmd::bare(ty)).await?;
    if response.result != CmdResult::Ack || response.size == 0 {
        return Ok(false);
    }

    data.resize(response.size as usize, 0);
    if transport.read(data, Some(REPLY_TIMEOUT)).await != data.len() {
        data.clear();
        return Err(stalled(transport));
    }
    Ok(true)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("avpipe-framing-{tag}-{}", std::process::id())
    }

    async fn pair(tag: &str) -> (Transport, Transport) {
        let name = unique_name(tag);
        let (server, client) = tokio::join!(Transport::create(&name, 4096), async {
            Transport::open(&name).await
        });
        (server.unwrap(), client.unwrap())
    }

    #[tokio::test]
    async fn command_and_result_pair_up() {
        let (mut server, mut client) = pair("pairing").await;

        let (response, ()) = tokio::join!(
            async { send_cmd(&mut client, &Cmd::bare(CmdType::KeepAlive)).await },
            async {
                let cmd = read_cmd(&mut server, Some(Duration::from_secs(1))).await.unwrap();
                assert_eq!(cmd.ty, CmdType::KeepAlive);
                send_result(&mut server, CmdResult::Ack, 7).await;
            }
        );
        let response = response.unwrap();
        assert_eq!(response.result, CmdResult::Ack);
        assert_eq!(response.size, 7);
    }

    #[tokio::test]
    async fn idle_tick_reads_nothing() {
        let (mut server, _client) = pair("tick").await;
        assert!(read_cmd(&mut server, Some(Duration::from_millis(50))).await.is_none());
        assert!(server.is_open());
    }

    #[tokio::test]
    async fn fetch_reads_declared_bulk_payload() {
        let (mut server, mut client) = pair("bulk").await;

        let (fetched, ()) = tokio::join!(
            async {
                let mut data = Vec::new();
                let ok = fetch_packet(&mut client, &mut data).await;
                (ok, data)
            },
            async {
                let cmd = read_cmd(&mut server, Some(Duration::from_secs(1))).await.unwrap();
                assert_eq!(cmd.ty, CmdType::GetPacket);
                send_result(&mut server, CmdResult::Ack, 4).await;
                server.write(b"data").await;
            }
        );
        let (ok, data) = fetched;
        assert!(ok.unwrap());
        assert_eq!(data, b"data");
    }

    #[tokio::test]
    async fn fetch_on_nack_is_empty_and_ok() {
        let (mut server, mut client) = pair("nack").await;

        let (fetched, ()) = tokio::join!(
            async {
                let mut data = vec![1, 2, 3];
                let ok = fetch_frame(&mut client, &mut data).await;
                (ok, data)
            },
            async {
                read_cmd(&mut server, Some(Duration::from_secs(1))).await.unwrap();
                send_result(&mut server, CmdResult::Nack, 0).await;
            }
        );
        let (ok, data) = fetched;
        assert!(!ok.unwrap());
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn send_cmd_on_closed_transport_fails() {
        let (server, mut client) = pair("closed").await;
        drop(server);

        // The first write may still land in the socket buffer; the
        // reply read then observes the hangup.
        let err = send_cmd(&mut client, &Cmd::bare(CmdType::KeepAlive)).await.unwrap_err();
        assert_eq!(err, FramingError::Closed);
    }
}
