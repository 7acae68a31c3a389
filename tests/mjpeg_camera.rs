use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use attendance_kernel::config::CameraSettings;
use attendance_kernel::{
    AttendanceError, ConnectionState, Frame, FrameRead, PixelFormat, SharedDetectionState,
    VideoSource,
};

const MULTIPART_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nConnection: close\r\n\r\n";

/// Loopback HTTP camera; every connection is answered on its own thread.
struct Camera {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl Camera {
    fn serve<F>(respond: F) -> Result<Self>
    where
        F: Fn(&str, &mut TcpStream) -> std::io::Result<()> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        let respond = Arc::new(respond);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let respond = respond.clone();
                std::thread::spawn(move || {
                    if let Ok(path) = read_request_path(&mut stream) {
                        let _ = respond(&path, &mut stream);
                    }
                });
            }
        });
        Ok(Self { addr, connections })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn read_request_path(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte)? == 0 {
            break;
        }
        head.push(byte[0]);
    }
    let text = String::from_utf8_lossy(&head);
    Ok(text.split_whitespace().nth(1).unwrap_or("/").to_string())
}

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    Frame::new(
        vec![120u8; (width * height * 3) as usize],
        width,
        height,
        PixelFormat::Rgb24,
    )
    .and_then(|frame| frame.encode_jpeg(80))
    .expect("encode test jpeg")
}

/// JPEG whose APP1 segment carries a complete thumbnail JPEG.
fn jpeg_with_thumbnail(width: u32, height: u32) -> Vec<u8> {
    let main = jpeg(width, height);
    let mut payload = b"Exif\0\0".to_vec();
    payload.extend_from_slice(&jpeg(8, 8));
    let len = u16::try_from(payload.len() + 2).expect("thumbnail fits a segment");

    let mut out = vec![0xFF, 0xD8, 0xFF, 0xE1];
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&main[2..]);
    out
}

fn part(jpeg: &[u8]) -> Vec<u8> {
    let mut out = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
    out.extend_from_slice(jpeg);
    out.extend_from_slice(b"\r\n");
    out
}

fn snapshot_response(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    stream.write_all(body)
}

fn not_found(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
}

fn frame_size(read: Result<FrameRead, AttendanceError>) -> Result<(u32, u32)> {
    match read? {
        FrameRead::Frame(frame) => Ok((frame.width(), frame.height())),
        FrameRead::EndOfStream { reason } => Err(anyhow!("unexpected end of stream: {}", reason)),
    }
}

fn timeout() -> Duration {
    Duration::from_millis(500)
}

#[test]
fn multipart_camera_streams_frames_until_it_closes() -> Result<()> {
    let camera = Camera::serve(|_, stream| {
        stream.write_all(MULTIPART_HEAD)?;
        stream.write_all(&part(&jpeg(32, 24)))?;
        stream.write_all(&part(&jpeg_with_thumbnail(64, 48)))?;
        stream.flush()
    })?;

    let mut source = VideoSource::from_url(&camera.url("/video"), timeout())?;
    assert_eq!(source.connect(), ConnectionState::Streaming);
    assert_eq!(frame_size(source.read_frame())?, (32, 24));
    assert_eq!(frame_size(source.read_frame())?, (64, 48));

    assert!(matches!(
        source.read_frame(),
        Ok(FrameRead::EndOfStream { .. })
    ));
    assert_eq!(source.state(), ConnectionState::Failed);
    assert_eq!(source.stats().frames_captured, 2);
    Ok(())
}

#[test]
fn camera_dropping_mid_frame_ends_the_stream() -> Result<()> {
    let camera = Camera::serve(|_, stream| {
        let frame = jpeg(32, 24);
        stream.write_all(MULTIPART_HEAD)?;
        stream.write_all(&part(&frame)[..frame.len() / 2])?;
        stream.flush()
    })?;

    let mut source = VideoSource::from_url(&camera.url("/video"), timeout())?;
    assert_eq!(source.connect(), ConnectionState::Streaming);
    assert!(matches!(
        source.read_frame(),
        Ok(FrameRead::EndOfStream { .. })
    ));
    assert_eq!(source.state(), ConnectionState::Failed);

    source.release();
    assert_eq!(source.connect(), ConnectionState::Streaming);
    assert_eq!(camera.connections(), 2);
    Ok(())
}

#[test]
fn snapshot_camera_fetches_one_jpeg_per_read() -> Result<()> {
    let camera = Camera::serve(|_, stream| snapshot_response(stream, &jpeg(40, 30)))?;

    let mut source = VideoSource::from_url(&camera.url("/shot.jpg"), timeout())?;
    assert_eq!(source.connect(), ConnectionState::Streaming);
    assert_eq!(frame_size(source.read_frame())?, (40, 30));
    assert_eq!(frame_size(source.read_frame())?, (40, 30));
    assert_eq!(camera.connections(), 3);
    Ok(())
}

#[test]
fn undecodable_payloads_are_decode_failures() -> Result<()> {
    let snapshot = Camera::serve(|_, stream| snapshot_response(stream, b"definitely not a jpeg"))?;
    let mut source = VideoSource::from_url(&snapshot.url("/shot.jpg"), timeout())?;
    source.connect();
    assert!(matches!(
        source.read_frame(),
        Err(AttendanceError::DecodeFailure(_))
    ));

    let multipart = Camera::serve(|_, stream| {
        stream.write_all(MULTIPART_HEAD)?;
        stream.write_all(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n")?;
        stream.write_all(&[0xFF, 0xD8, 0x12, 0x34, 0x56])?;
        stream.write_all(&part(&jpeg(16, 16)))?;
        stream.flush()
    })?;
    let mut source = VideoSource::from_url(&multipart.url("/video"), timeout())?;
    source.connect();
    assert!(matches!(
        source.read_frame(),
        Err(AttendanceError::DecodeFailure(_))
    ));
    Ok(())
}

#[test]
fn stalled_camera_does_not_hold_shared_state() -> Result<()> {
    let camera = Camera::serve(|_, stream| {
        stream.write_all(MULTIPART_HEAD)?;
        let filler = [0x11u8; 8192];
        loop {
            stream.write_all(&filler)?;
        }
    })?;

    let source = VideoSource::from_url(&camera.url("/video"), timeout())?;
    let shared = Arc::new(SharedDetectionState::new(source));
    assert_eq!(
        shared.with_connection(|source| source.connect())?,
        ConnectionState::Streaming
    );

    let started = Instant::now();
    let reader = {
        let shared = shared.clone();
        std::thread::spawn(move || shared.with_connection(|source| source.read_frame()))
    };
    std::thread::sleep(Duration::from_millis(50));
    shared.read_snapshot()?;
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "snapshot waited {:?} behind a camera read",
        started.elapsed()
    );

    let read = reader
        .join()
        .map_err(|_| anyhow!("camera reader panicked"))??;
    assert!(matches!(
        read,
        Ok(FrameRead::EndOfStream { .. }) | Err(AttendanceError::DecodeFailure(_))
    ));
    Ok(())
}

#[test]
fn falls_back_to_alternate_stream_path() -> Result<()> {
    let camera = Camera::serve(|path, stream| match path {
        "/mjpeg" => {
            stream.write_all(MULTIPART_HEAD)?;
            stream.write_all(&part(&jpeg(24, 16)))?;
            stream.flush()
        }
        _ => not_found(stream),
    })?;

    let mut direct = VideoSource::from_url(&camera.url("/video"), timeout())?;
    assert_eq!(direct.connect(), ConnectionState::Failed);

    let mut source = VideoSource::from_camera(&CameraSettings {
        url: camera.url("/video"),
        read_timeout: timeout(),
        fallback_paths: vec!["/stream".to_string(), "/mjpeg".to_string()],
    })?;
    assert_eq!(source.connect(), ConnectionState::Streaming);
    assert_eq!(frame_size(source.read_frame())?, (24, 16));
    Ok(())
}
