//! Proxy runtime demo — drives a [`Runtime`] against a scripted peer thread
//! on the other end of a socketpair.
//!
//! Run with:
//!   cargo run --example proxy-roundtrip

use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use objipc::client::{CALLBACK_INTERFACE, RUNTIME_INTERFACE};
use objipc::codec::Closure;
use objipc::wire::{Connection, WireError};
use objipc::{Argument, Interface, MessageDesc, ObjectId, Runtime};

static GREETER_REQUESTS: [MessageDesc; 1] = [MessageDesc {
    name: "greet",
    signature: "s",
    arg_interfaces: &[None],
}];

static GREETER_EVENTS: [MessageDesc; 1] = [MessageDesc {
    name: "greeting",
    signature: "us",
    arg_interfaces: &[None, None],
}];

static GREETER: Interface = Interface {
    name: "demo_greeter",
    version: 1,
    requests: &GREETER_REQUESTS,
    events: &GREETER_EVENTS,
};

/// Wait for one complete message and decode it.
fn read_message(conn: &mut Connection, desc: &'static MessageDesc) -> Closure {
    loop {
        if conn.pending_input() >= 8 {
            let mut hdr = [0u8; 8];
            conn.copy_incoming(&mut hdr);
            let word = u32::from_ne_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
            let size = (word >> 16) as usize;
            if conn.pending_input() >= size {
                return Closure::decode(conn, size, desc).expect("decode");
            }
        }
        match conn.read() {
            Ok(_) => {}
            Err(WireError::WouldBlock) => thread::sleep(Duration::from_millis(1)),
            Err(e) => panic!("peer read failed: {e}"),
        }
    }
}

fn send_event(
    conn: &mut Connection,
    sender: u32,
    opcode: u16,
    desc: &'static MessageDesc,
    args: Vec<Argument<ObjectId>>,
) {
    Closure::marshal(ObjectId::new(sender), opcode, desc, args)
        .expect("marshal")
        .send(conn)
        .expect("send");
    conn.flush().expect("flush");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (ours, theirs) = UnixStream::pair()?;
    let runtime = Runtime::connect_to_fd(OwnedFd::from(ours))?;

    // The scripted peer: answer one greet request, then one sync.
    let peer = thread::spawn(move || {
        let mut conn = Connection::new(OwnedFd::from(theirs));

        let greet = read_message(&mut conn, &GREETER.requests[0]);
        let name = match &greet.args[0] {
            Argument::Str(Some(s)) => s.to_string_lossy().into_owned(),
            _ => unreachable!("greet carries a string"),
        };
        eprintln!("[peer] greet({name:?}) on object {}", greet.sender);
        send_event(
            &mut conn,
            greet.sender.raw(),
            0,
            &GREETER.events[0],
            vec![
                Argument::Uint(1),
                Argument::Str(Some(CString::new(format!("hello, {name}")).unwrap())),
            ],
        );

        let sync = read_message(&mut conn, &RUNTIME_INTERFACE.requests[0]);
        let callback_id = match sync.args[0] {
            Argument::NewId(id) => id.raw(),
            _ => unreachable!("sync carries a new id"),
        };
        send_event(
            &mut conn,
            callback_id,
            0,
            &CALLBACK_INTERFACE.events[0],
            vec![Argument::Uint(1)],
        );
        send_event(
            &mut conn,
            1,
            1,
            &RUNTIME_INTERFACE.events[1],
            vec![Argument::Uint(callback_id)],
        );
    });

    let greeter = runtime.create_proxy(&runtime.runtime_proxy(), &GREETER)?;
    greeter.set_dispatcher(|_, _, _, args| {
        if let (Argument::Uint(serial), Argument::Str(Some(text))) = (&args[0], &args[1]) {
            eprintln!("[client] greeting #{serial}: {:?}", text.to_string_lossy());
        }
    })?;

    greeter.send_request(
        0,
        vec![Argument::Str(Some(CString::new("event loop")?))],
    )?;

    // The roundtrip drains the greeting event on the way to the sync ack.
    runtime.roundtrip()?;
    peer.join().expect("peer thread");
    Ok(())
}
