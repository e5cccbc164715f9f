//! Event loop demo — a repeating timer, an idle source, and a socket-backed
//! fd source sharing one loop.
//!
//! Run with:
//!   cargo run --example event-loop

use std::cell::Cell;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use objipc::{EventLoop, Readiness};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let event_loop = EventLoop::new()?;
    let (mut sender, receiver) = UnixStream::pair()?;
    receiver.set_nonblocking(true)?;

    event_loop.add_idle(|_| eprintln!("[idle] runs once, before the loop first blocks"));

    // The fd source drains whatever the timer callback wrote.
    let mut receiver_for_cb = receiver.try_clone()?;
    let fd_source = event_loop.add_fd(receiver.as_fd(), Readiness::READABLE, move |_, _, mask| {
        let mut buf = [0u8; 64];
        if let Ok(n) = receiver_for_cb.read(&mut buf) {
            eprintln!(
                "[fd] {:?} (readable={})",
                String::from_utf8_lossy(&buf[..n]),
                mask.contains(Readiness::READABLE)
            );
        }
        0
    })?;

    // Timers are one-shot; the callback re-arms itself three times.
    let ticks = Rc::new(Cell::new(0u32));
    let timer_holder: Rc<Cell<Option<objipc::Source>>> = Rc::new(Cell::new(None));
    let t = ticks.clone();
    let holder = timer_holder.clone();
    let timer = event_loop.add_timer(move |event_loop| {
        t.set(t.get() + 1);
        eprintln!("[timer] tick {}", t.get());
        let _ = sender.write_all(format!("tick {}", t.get()).as_bytes());
        if let Some(me) = holder.take() {
            if t.get() < 3 {
                event_loop.update_timer(&me, 100).expect("rearm");
            }
            holder.set(Some(me));
        }
        0
    })?;
    timer_holder.set(Some(timer.clone()));
    event_loop.update_timer(&timer, 100)?;

    while ticks.get() < 3 {
        event_loop.dispatch(1000)?;
    }
    // One more pass picks up the final tick's write.
    event_loop.dispatch(0)?;

    event_loop.remove(&fd_source)?;
    event_loop.remove(&timer)?;
    Ok(())
}
