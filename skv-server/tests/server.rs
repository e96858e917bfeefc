use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use skv_common::{encode_frames, parse_frames};
use skv_server::ServerHandle;

fn connect(server: &ServerHandle) -> TcpStream {
    let stream = TcpStream::connect(server.addr()).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    stream
}

fn read_reply(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Vec<Bytes>> {
    let mut chunk = [0u8; 512];
    loop {
        if let Some(values) = parse_frames(buf).expect("well-formed reply") {
            return Some(values);
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn call(stream: &mut TcpStream, args: &[&[u8]]) -> Vec<Bytes> {
    let mut packet = Vec::new();
    encode_frames(args, &mut packet);
    stream.write_all(&packet).expect("write");
    read_reply(stream, &mut BytesMut::new()).expect("reply")
}

#[test]
fn serves_set_and_get() {
    let server = ServerHandle::spawn(None).expect("spawn");
    let mut stream = connect(&server);

    assert_eq!(call(&mut stream, &[b"set", b"key", b"value"])[0], "ok");
    let reply = call(&mut stream, &[b"get", b"key"]);
    assert_eq!(reply, vec![Bytes::from_static(b"ok"), Bytes::from_static(b"value")]);
    assert_eq!(call(&mut stream, &[b"get", b"missing"])[0], "not_found");
    assert_eq!(server.accepted(), 1);
    server.shutdown();
}

#[test]
fn handles_pipelined_and_split_packets() {
    let server = ServerHandle::spawn(None).expect("spawn");
    let mut stream = connect(&server);

    let mut packets = Vec::new();
    encode_frames(&[&b"set"[..], b"a", b"1"], &mut packets);
    encode_frames(&[&b"get"[..], b"a"], &mut packets);
    for piece in packets.chunks(4) {
        stream.write_all(piece).unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }

    let mut buf = BytesMut::new();
    assert_eq!(read_reply(&mut stream, &mut buf).unwrap()[0], "ok");
    assert_eq!(read_reply(&mut stream, &mut buf).unwrap()[1], "1");
}

#[test]
fn requires_auth_when_password_set() {
    let server = ServerHandle::spawn(Some("secret")).expect("spawn");
    let mut stream = connect(&server);

    assert_eq!(call(&mut stream, &[b"ping"])[0], "noauth");
    assert_eq!(call(&mut stream, &[b"auth", b"nope"])[0], "error");
    assert_eq!(call(&mut stream, &[b"auth", b"secret"])[0], "ok");
    assert_eq!(call(&mut stream, &[b"ping"])[0], "ok");
}

#[test]
fn drop_connections_closes_open_sockets() {
    let server = ServerHandle::spawn(None).expect("spawn");
    let mut stream = connect(&server);
    assert_eq!(call(&mut stream, &[b"ping"])[0], "ok");

    server.drop_connections();
    assert!(read_reply(&mut stream, &mut BytesMut::new()).is_none());

    let mut fresh = connect(&server);
    assert_eq!(call(&mut fresh, &[b"ping"])[0], "ok");
    assert_eq!(server.accepted(), 2);
}

#[test]
fn malformed_length_gets_error_and_close() {
    let server = ServerHandle::spawn(None).expect("spawn");
    let mut stream = connect(&server);
    stream.write_all(b"x\nping\n\n").unwrap();

    let mut buf = BytesMut::new();
    let reply = read_reply(&mut stream, &mut buf).expect("error reply");
    assert_eq!(reply[0], "error");
    assert!(read_reply(&mut stream, &mut buf).is_none());
}
