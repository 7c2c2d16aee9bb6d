//! Drives [`wire::server::handle_connection`] over a real loopback TCP
//! socket and checks that writes and reads round-trip through the
//! simplified wire framing, against a real socket rather than mocking
//! the transport.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use blockwright_lib::backend::types::OpFlags;
use blockwright_lib::plugins::memory::MemoryPlugin;
use blockwright_lib::wire::proto::{HELLO_MAGIC, REPLY_MAGIC, REQUEST_MAGIC};
use blockwright_lib::wire::server::handle_connection;
use blockwright_lib::Backend;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};

fn write_export_name(stream: &mut TcpStream, name: &str) {
    stream.write_u32::<BE>(name.len() as u32).unwrap();
    stream.write_all(name.as_bytes()).unwrap();
}

fn write_request(stream: &mut TcpStream, opcode: u16, flags: u16, handle: u64, offset: u64, length: u32) {
    stream.write_u32::<BE>(REQUEST_MAGIC).unwrap();
    stream.write_u16::<BE>(opcode).unwrap();
    stream.write_u16::<BE>(flags).unwrap();
    stream.write_u64::<BE>(handle).unwrap();
    stream.write_u64::<BE>(offset).unwrap();
    stream.write_u32::<BE>(length).unwrap();
}

struct Reply {
    handle: u64,
    errno: u32,
    payload_len: u32,
}

fn read_reply(stream: &mut TcpStream) -> Reply {
    let magic = stream.read_u32::<BE>().unwrap();
    assert_eq!(magic, REPLY_MAGIC);
    let handle = stream.read_u64::<BE>().unwrap();
    let errno = stream.read_u32::<BE>().unwrap();
    let payload_len = stream.read_u32::<BE>().unwrap();
    Reply { handle, errno, payload_len }
}

#[test]
fn write_then_read_round_trips_through_the_memory_plugin() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let backend = Backend::plugin(MemoryPlugin::new());
        handle_connection(&backend, stream, None, false, false, None).unwrap();
    });

    let mut client = TcpStream::connect(addr).unwrap();
    write_export_name(&mut client, "");

    let magic = client.read_u32::<BE>().unwrap();
    assert_eq!(magic, HELLO_MAGIC);
    let size = client.read_u64::<BE>().unwrap();
    assert!(size > 0);
    let _flags = client.read_u32::<BE>().unwrap();

    let payload = vec![0x42u8; 512];
    write_request(&mut client, 1 /* Write */, 0, 1, 0, payload.len() as u32);
    client.write_all(&payload).unwrap();
    let write_reply = read_reply(&mut client);
    assert_eq!(write_reply.handle, 1);
    assert_eq!(write_reply.errno, 0);

    write_request(&mut client, 0 /* Read */, 0, 2, 0, payload.len() as u32);
    let read_reply_header = read_reply(&mut client);
    assert_eq!(read_reply_header.handle, 2);
    assert_eq!(read_reply_header.errno, 0);
    assert_eq!(read_reply_header.payload_len, payload.len() as u32);
    let mut got = vec![0u8; payload.len()];
    client.read_exact(&mut got).unwrap();
    assert_eq!(got, payload);

    write_request(&mut client, 7 /* Disconnect */, 0, 3, 0, 0);
    let disconnect_reply = read_reply(&mut client);
    assert_eq!(disconnect_reply.handle, 3);
    assert_eq!(disconnect_reply.errno, 0);

    server.join().unwrap();
}

#[test]
fn an_out_of_range_write_comes_back_as_an_errno_reply_not_a_dropped_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let backend = Backend::plugin(MemoryPlugin::new());
        backend.config("size", "4096").unwrap();
        handle_connection(&backend, stream, None, false, false, None).unwrap();
    });

    let mut client = TcpStream::connect(addr).unwrap();
    write_export_name(&mut client, "");
    let _ = client.read_u32::<BE>().unwrap();
    let _ = client.read_u64::<BE>().unwrap();
    let _ = client.read_u32::<BE>().unwrap();

    // Offset well past the 4 KiB export: must be reported as an errno,
    // not silently succeed or kill the connection.
    write_request(&mut client, 0 /* Read */, 0, 1, 1_000_000, 512);
    let reply = read_reply(&mut client);
    assert_eq!(reply.handle, 1);
    assert_ne!(reply.errno, 0);

    write_request(&mut client, 7 /* Disconnect */, 0, 2, 0, 0);
    let disconnect_reply = read_reply(&mut client);
    assert_eq!(disconnect_reply.errno, 0);

    server.join().unwrap();
}

#[test]
fn flags_are_accepted_without_being_rejected_by_framing() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let backend = Backend::plugin(MemoryPlugin::new());
        handle_connection(&backend, stream, None, false, false, None).unwrap();
    });

    let mut client = TcpStream::connect(addr).unwrap();
    write_export_name(&mut client, "");
    let _ = client.read_u32::<BE>().unwrap();
    let _ = client.read_u64::<BE>().unwrap();
    let _ = client.read_u32::<BE>().unwrap();

    let payload = vec![0xffu8; 16];
    write_request(&mut client, 1, OpFlags::FUA.bits() as u16, 1, 0, payload.len() as u32);
    client.write_all(&payload).unwrap();
    let reply = read_reply(&mut client);
    assert_eq!(reply.errno, 0);

    write_request(&mut client, 7, 0, 2, 0, 0);
    read_reply(&mut client);
    server.join().unwrap();
}
