//! Client behaviour against a scripted prior-knowledge HTTP/2 server.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http2::frame::{DataFrame, HeadersFrame};
use http2::{
    CONNECTION_PREFACE, Error, Frame, FrameDecoder, FrameEncoder, HeaderField, HpackDecoder,
    HpackEncoder, SettingsFrame, StreamId,
};
use http2_client::{Client, ClientConfig, ClientError, Target};

struct Peer {
    stream: TcpStream,
    buf: BytesMut,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    hpack_in: HpackDecoder,
    hpack_out: HpackEncoder,
}

impl Peer {
    fn accept(listener: &TcpListener) -> Peer {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut preface = [0u8; 24];
        stream.read_exact(&mut preface).unwrap();
        assert_eq!(&preface[..], CONNECTION_PREFACE);
        let mut peer = Peer {
            stream,
            buf: BytesMut::new(),
            decoder: FrameDecoder::new(),
            encoder: FrameEncoder::new(),
            hpack_in: HpackDecoder::new(),
            hpack_out: HpackEncoder::new(),
        };
        match peer.read_frame() {
            Some(Frame::Settings(f)) => assert!(!f.ack),
            _ => panic!("expected SETTINGS"),
        }
        peer.send(&Frame::Settings(SettingsFrame::default()));
        peer.send(&Frame::Settings(SettingsFrame::ack()));
        peer
    }

    fn read_frame(&mut self) -> Option<Frame> {
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

    /// The next request HEADERS and its `:path`.
    fn read_request(&mut self) -> (HeadersFrame, String) {
        loop {
            match self.read_frame() {
                Some(Frame::Headers(frame)) => {
                    let path = self
                        .hpack_in
                        .decode_block(&frame.header_block)
                        .unwrap()
                        .into_iter()
                        .find(|f| f.name == b":path")
                        .map(|f| String::from_utf8(f.value).unwrap())
                        .unwrap();
                    return (frame, path);
                }
                Some(_) => continue,
                None => panic!("connection ended before a request"),
            }
        }
    }

    fn send(&mut self, frame: &Frame) {
        let mut buf = BytesMut::new();
        self.encoder.encode(frame, &mut buf);
        self.stream.write_all(&buf).unwrap();
    }

    fn respond(&mut self, stream_id: StreamId, status: &str, body: &[u8]) {
        let fields = [HeaderField::new(":status", status)];
        let mut block = Vec::new();
        self.hpack_out.encode(&fields, &mut block);
        let mut buf = BytesMut::new();
        self.encoder
            .encode_header_block(stream_id, &Bytes::from(block), false, None, &mut buf);
        self.stream.write_all(&buf).unwrap();
        self.send(&Frame::Data(DataFrame::new(
            stream_id,
            Bytes::copy_from_slice(body),
            true,
        )));
    }
}

fn setup() -> (TcpListener, SocketAddr, Client) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = ClientConfig::default();
    config.reactor.threads = 2;
    let client = Client::new(config).unwrap();
    (listener, addr, client)
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_requests_share_one_connection() {
    let (listener, addr, client) = setup();
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
    let server = thread::spawn(move || {
        let mut peer = Peer::accept(&listener);
        let mut ids = Vec::new();
        for _ in 0..2 {
            let (frame, path) = peer.read_request();
            peer.respond(frame.stream_id, "200", path.as_bytes());
            ids.push(frame.stream_id.value());
        }
        // Keep the socket open until the client has been inspected.
        let _ = done_rx.recv();
        ids
    });

    let target = Target::new(false, "127.0.0.1", addr.port());
    let first = client.get(&target, "/one").unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(&first.body.collect().unwrap()[..], b"/one");

    let second = client.get(&target, "/two").unwrap();
    assert_eq!(&second.body.collect().unwrap()[..], b"/two");

    assert_eq!(client.connection_count(), 1);
    done_tx.send(()).unwrap();
    assert_eq!(server.join().unwrap(), vec![1, 3]);
    client.shutdown();
}

#[test]
fn test_closed_connection_is_replaced() {
    let (listener, addr, client) = setup();
    let server = thread::spawn(move || {
        for path in ["/before", "/after"] {
            let mut peer = Peer::accept(&listener);
            let (frame, seen) = peer.read_request();
            assert_eq!(seen, path);
            assert_eq!(frame.stream_id.value(), 1);
            peer.respond(frame.stream_id, "204", b"");
            // Dropping the peer closes the socket.
        }
    });

    let target = Target::new(false, "127.0.0.1", addr.port());
    let response = client.get(&target, "/before").unwrap();
    assert_eq!(response.status, 204);

    assert!(wait_until(|| client.connection_count() == 0));

    let response = client.get(&target, "/after").unwrap();
    assert_eq!(response.status, 204);
    server.join().unwrap();
    client.shutdown();
}

#[test]
fn test_shutdown_fails_pending_requests() {
    let (listener, addr, client) = setup();
    let (seen_tx, seen_rx) = crossbeam_channel::bounded::<()>(1);
    let server = thread::spawn(move || {
        let mut peer = Peer::accept(&listener);
        peer.read_request();
        seen_tx.send(()).unwrap();
        // Never answer; expect GOAWAY or the socket closing.
        loop {
            match peer.read_frame() {
                Some(Frame::GoAway(_)) | None => return,
                Some(_) => continue,
            }
        }
    });

    let target = Target::new(false, "127.0.0.1", addr.port());
    let request = http2::Request::get("http", &target.authority(), "/slow");
    let handle = client.send(&target, request).unwrap();
    // The peer has finished its SETTINGS exchange once it sees the request.
    seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    client.shutdown();
    assert!(matches!(
        handle.response(),
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        client.get(&target, "/late"),
        Err(ClientError::Closed)
    ));
    server.join().unwrap();
}

#[test]
fn test_connect_refused() {
    let (listener, addr, client) = setup();
    drop(listener);

    let target = Target::new(false, "127.0.0.1", addr.port());
    assert!(matches!(client.connect(&target), Err(ClientError::Io(_))));
    assert_eq!(client.connection_count(), 0);
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = ClientConfig::default();
    config.tls.alpn.clear();
    assert!(matches!(Client::new(config), Err(ClientError::Config(_))));
}
