//! A scripted HTTP/2 server over a real localhost socket.
//!
//! Each test drives the server side frame by frame from its own thread
//! while the client under test runs on the reactor.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http2::frame::{HeadersFrame, PushPromiseFrame, Setting};
use http2::{
    CONNECTION_PREFACE, Frame, FrameDecoder, FrameEncoder, HeaderField, HpackDecoder,
    HpackEncoder, SettingId, SettingsFrame, StreamId,
};
use io_driver::{CacheKey, ConnectOptions, NetConnection, Reactor, ReactorConfig, ThreadPool};
use tracing_subscriber::EnvFilter;

pub fn setup() -> (Reactor, TcpListener) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let pool = Arc::new(ThreadPool::new("h2-test", 4).unwrap());
    let reactor = Reactor::start(ReactorConfig::default(), pool).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    (reactor, listener)
}

pub fn connect(reactor: &Reactor, addr: SocketAddr) -> NetConnection {
    NetConnection::connect(
        CacheKey::new(false, addr, None),
        "localhost",
        true,
        &reactor.handle(),
        &ConnectOptions::default(),
    )
    .unwrap()
}

pub fn settings(values: &[(SettingId, u32)]) -> SettingsFrame {
    SettingsFrame {
        ack: false,
        settings: values
            .iter()
            .map(|&(id, value)| Setting { id, value })
            .collect(),
    }
}

pub struct Peer {
    stream: TcpStream,
    buf: BytesMut,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    hpack_in: HpackDecoder,
    hpack_out: HpackEncoder,
}

impl Peer {
    /// Accept one client and consume its connection preface.
    pub fn accept(listener: &TcpListener) -> Peer {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut preface = [0u8; 24];
        stream.read_exact(&mut preface).unwrap();
        assert_eq!(&preface[..], CONNECTION_PREFACE);
        Peer {
            stream,
            buf: BytesMut::new(),
            decoder: FrameDecoder::new(),
            encoder: FrameEncoder::new(),
            hpack_in: HpackDecoder::new(),
            hpack_out: HpackEncoder::new(),
        }
    }

    /// Read the client's SETTINGS, answer with `ours` and an ACK.
    pub fn handshake_with(&mut self, ours: SettingsFrame) -> SettingsFrame {
        let client = match self.read_frame() {
            Frame::Settings(f) => f,
            other => panic!("expected SETTINGS, got {}", other.name()),
        };
        assert!(!client.ack);
        self.send(&Frame::Settings(ours));
        self.send(&Frame::Settings(SettingsFrame::ack()));
        client
    }

    pub fn handshake(&mut self) -> SettingsFrame {
        self.handshake_with(SettingsFrame::default())
    }

    pub fn read_frame(&mut self) -> Frame {
        self.try_read_frame(Duration::from_secs(5))
            .expect("client sent nothing")
    }

    /// Next frame, or `None` if nothing arrives within `timeout` or the
    /// client closed the socket.
    pub fn try_read_frame(&mut self, timeout: Duration) -> Option<Frame> {
        self.stream.set_read_timeout(Some(timeout)).unwrap();
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                return Some(frame);
            }
            let mut chunk = [0u8; 16 * 1024];
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return None;
                }
                Err(_) => return None,
            }
        }
    }

    /// Skip frames until one matches.
    pub fn read_until(&mut self, mut matches: impl FnMut(&Frame) -> bool) -> Frame {
        loop {
            let frame = self.read_frame();
            if matches(&frame) {
                return frame;
            }
        }
    }

    /// The next request HEADERS, decoded.
    pub fn read_request(&mut self) -> (HeadersFrame, Vec<(String, String)>) {
        let frame = match self.read_until(|f| matches!(f, Frame::Headers(_))) {
            Frame::Headers(f) => f,
            _ => unreachable!(),
        };
        assert!(frame.end_headers);
        let fields = self.decode(&frame.header_block);
        (frame, fields)
    }

    /// Collect DATA for `stream_id` until END_STREAM.
    pub fn read_body(&mut self, stream_id: StreamId) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            if let Frame::Data(f) = self.read_until(|f| matches!(f, Frame::Data(_))) {
                assert_eq!(f.stream_id, stream_id);
                body.extend_from_slice(&f.data);
                if f.end_stream {
                    return body;
                }
            }
        }
    }

    pub fn decode(&mut self, block: &[u8]) -> Vec<(String, String)> {
        self.hpack_in
            .decode_block(block)
            .unwrap()
            .into_iter()
            .map(|f| {
                (
                    String::from_utf8(f.name).unwrap(),
                    String::from_utf8(f.value).unwrap(),
                )
            })
            .collect()
    }

    pub fn send(&mut self, frame: &Frame) {
        let mut buf = BytesMut::new();
        self.encoder.encode(frame, &mut buf);
        self.stream.write_all(&buf).unwrap();
    }

    fn block(&mut self, fields: &[(&str, &str)]) -> Bytes {
        let fields: Vec<HeaderField> = fields
            .iter()
            .map(|&(name, value)| HeaderField::new(name, value))
            .collect();
        let mut block = Vec::new();
        self.hpack_out.encode(&fields, &mut block);
        Bytes::from(block)
    }

    pub fn send_headers(&mut self, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) {
        let block = self.block(fields);
        let mut buf = BytesMut::new();
        self.encoder
            .encode_header_block(StreamId::new(stream_id), &block, end_stream, None, &mut buf);
        self.stream.write_all(&buf).unwrap();
    }

    pub fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) {
        self.send(&Frame::Data(http2::frame::DataFrame::new(
            StreamId::new(stream_id),
            Bytes::copy_from_slice(data),
            end_stream,
        )));
    }

    pub fn send_push_promise(&mut self, parent: u32, promised: u32, fields: &[(&str, &str)]) {
        let header_block = self.block(fields);
        self.send(&Frame::PushPromise(PushPromiseFrame {
            stream_id: StreamId::new(parent),
            end_headers: true,
            promised_stream_id: StreamId::new(promised),
            header_block,
        }));
    }

    pub fn send_window_update(&mut self, stream_id: u32, increment: u32) {
        let mut buf = BytesMut::new();
        self.encoder
            .write_window_update(StreamId::new(stream_id), increment, &mut buf);
        self.stream.write_all(&buf).unwrap();
    }
}

pub fn header<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}
