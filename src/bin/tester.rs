// ABOUTME: Synthetic encode/decode driver exercising a live service session
// ABOUTME: Generates gradient YUV frames, dumps an elementary stream and raw frames

use argh::FromArgs;
use avpipe::client;
use avpipe::codec::InitInfo;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Synthetic encode/decode test driver for the codec service.
#[derive(FromArgs)]
struct Args {
    /// run an encoder test
    #[argh(switch, short = 'e')]
    encode: bool,

    /// run a decoder test
    #[argh(switch, short = 'd')]
    decode: bool,

    /// elementary-stream file written by -e and read by -d
    #[argh(option, short = 'f')]
    file: Option<PathBuf>,

    /// test width, default 1920
    #[argh(option, default = "1920")]
    width: u16,

    /// test height, default 1080
    #[argh(option, default = "1080")]
    height: u16,

    /// use HEVC instead of H.264
    #[argh(switch)]
    hevc: bool,
}

/// Moving gradient pattern; every tick shifts all three planes so the
/// encoder has real motion to work on.
fn fill_frame(frame: &mut [u8], width: usize, height: usize, tick: usize) {
    let (luma, chroma) = frame.split_at_mut(width * height);
    let (cb, cr) = chroma.split_at_mut(width * height / 4);

    for y in 0..height {
        for x in 0..width {
            luma[y * width + x] = (x + y + tick * 3) as u8;
        }
    }
    for y in 0..height / 2 {
        for x in 0..width / 2 {
            cb[y * (width / 2) + x] = (128 + y + tick * 2) as u8;
            cr[y * (width / 2) + x] = (64 + x + tick * 5) as u8;
        }
    }
}

async fn run_encode_test(hevc: bool, width: u16, height: u16, file: &Path) -> bool {
    let Ok((mut client, service)) = client::open_service("test").await else {
        error!("failed to open service");
        return false;
    };

    let mut init = InitInfo {
        bps: 5_000_000,
        width,
        height,
        fps: 30,
        codec_name: if hevc { "hevc" } else { "h264" }.into(),
    };
    if client.open_encoder(init.clone()).await.is_err() {
        // HEVC unavailable: retry with H.264 before giving up.
        init.codec_name = "h264".into();
        if client.open_encoder(init).await.is_err() {
            error!("encoder init failed");
            let _ = client::close_service(&mut client, service).await;
            return false;
        }
    }

    let mut frame = vec![0u8; width as usize * height as usize * 3 / 2];
    let mut packet = Vec::new();
    let mut stream = Vec::new();

    for i in 0..120 {
        fill_frame(&mut frame, width as usize, height as usize, i);

        let start = Instant::now();
        if let Err(e) = client.encode(&frame).await {
            error!(frame = i, error = %e, "encode failed");
        }
        match client.get_packet(&mut packet).await {
            Ok(true) => {
                info!(
                    frame = i,
                    bytes = packet.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "packet received"
                );
                stream.extend_from_slice(&packet);
            }
            Ok(false) => {}
            Err(e) => error!(frame = i, error = %e, "packet fetch failed"),
        }
    }

    if let Err(e) = client.flush().await {
        error!(error = %e, "flush failed");
    }
    while let Ok(true) = client.get_packet(&mut packet).await {
        info!(bytes = packet.len(), "writing flush packet");
        stream.extend_from_slice(&packet);
    }

    if let Err(e) = fs::write(file, &stream) {
        error!(error = %e, "failed to write stream file");
        let _ = client::close_service(&mut client, service).await;
        return false;
    }
    info!(bytes = stream.len(), file = %file.display(), "elementary stream written");

    client::close_service(&mut client, service).await.is_ok()
}

async fn run_decode_test(hevc: bool, width: u16, height: u16, file: &Path) -> bool {
    let stream = match fs::read(file) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, file = %file.display(), "failed to read stream file");
            return false;
        }
    };

    let Ok((mut client, service)) = client::open_service("test").await else {
        error!("failed to open service");
        return false;
    };

    let init = InitInfo {
        bps: 0,
        width,
        height,
        fps: 0,
        codec_name: if hevc { "hevc" } else { "h264" }.into(),
    };
    if client.open_decoder(init).await.is_err() {
        error!("decoder init failed");
        let _ = client::close_service(&mut client, service).await;
        return false;
    }

    let mut frame = Vec::new();
    let mut frame_id = 0usize;
    let dump = |frame: &[u8], frame_id: usize| {
        let name = format!("frame{frame_id}.raw");
        if let Err(e) = fs::write(&name, frame) {
            error!(error = %e, name, "failed to write frame");
        }
    };

    for slice in stream.chunks(16 * 1024) {
        if let Err(e) = client.decode(slice).await {
            error!(error = %e, "decode failed");
        }
        while let Ok(true) = client.get_frame(&mut frame).await {
            info!(frame_id, "decoded frame");
            dump(&frame, frame_id);
            frame_id += 1;
        }
    }

    loop {
        let _ = client.flush().await;
        match client.get_frame(&mut frame).await {
            Ok(true) => {
                info!(frame_id, "decoded frame");
                dump(&frame, frame_id);
                frame_id += 1;
            }
            _ => break,
        }
    }

    info!(frames = frame_id, "decode finished");
    client::close_service(&mut client, service).await.is_ok()
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Args = argh::from_env();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    if !args.encode && !args.decode {
        error!("nothing to do: pass -e and/or -d (see --help)");
        return ExitCode::from(1);
    }
    let Some(file) = args.file.as_deref() else {
        error!("specify the test file name with -f (see --help)");
        return ExitCode::from(1);
    };

    if args.encode {
        info!("starting encode test");
        if !run_encode_test(args.hevc, args.width, args.height, file).await {
            error!("encode test failed");
            return ExitCode::from(2);
        }
        if args.decode {
            tokio::time::sleep(Duration::from_millis(1000)).await;
        }
    }

    if args.decode {
        info!("starting decode test");
        if !run_decode_test(args.hevc, args.width, args.height, file).await {
            error!("decode test failed");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}
