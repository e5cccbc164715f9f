use std::ffi::CStr;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use objipc_wire::Connection;
use tracing::debug;

use crate::argument::{Argument, Fixed, ObjectId};
use crate::error::{CodecError, Result};
use crate::interface::MessageDesc;
use crate::signature::{iter_args, ArgKind};

/// Two words: sender id, then `size << 16 | opcode`.
pub const HEADER_SIZE: usize = 8;

/// Upper bound on an encoded message, dictated by the 16-bit size field.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// One instantiated message: target object, opcode, and the typed argument
/// array sized to the signature.
///
/// A closure exclusively owns any file descriptors it still holds; a slot is
/// cleared to `Fd(None)` the moment its descriptor is handed to the
/// connection's fd ring. Dropping a closure closes whatever it still owns.
#[derive(Debug)]
pub struct Closure {
    pub sender: ObjectId,
    pub opcode: u16,
    pub desc: &'static MessageDesc,
    pub args: Vec<Argument<ObjectId>>,
}

impl Closure {
    /// Build an outgoing closure, validating the arguments against the
    /// message signature (kind match, non-nullable null rejection, fd
    /// presence).
    pub fn marshal(
        sender: ObjectId,
        opcode: u16,
        desc: &'static MessageDesc,
        args: Vec<Argument<ObjectId>>,
    ) -> Result<Self> {
        if args.len() != desc.arg_count() {
            return Err(CodecError::InvalidArgument(format!(
                "{}({}) expects {} arguments, got {}",
                desc.name,
                desc.signature,
                desc.arg_count(),
                args.len()
            )));
        }

        for (i, (spec, arg)) in iter_args(desc.signature).zip(&args).enumerate() {
            if arg.kind() != spec.kind {
                return Err(CodecError::InvalidArgument(format!(
                    "{}: argument {} is {:?}, signature says {:?}",
                    desc.name,
                    i,
                    arg.kind(),
                    spec.kind
                )));
            }
            let null = match arg {
                Argument::Str(v) => v.is_none(),
                Argument::Object(v) => v.is_none(),
                Argument::Array(v) => v.is_none(),
                Argument::Fd(v) => v.is_none(),
                Argument::NewId(id) => id.is_null(),
                _ => false,
            };
            if null && !spec.nullable {
                return Err(CodecError::InvalidArgument(format!(
                    "{}: null argument {} where signature says non-nullable",
                    desc.name, i
                )));
            }
        }

        Ok(Self {
            sender,
            opcode,
            desc,
            args,
        })
    }

    /// Serialize to wire bytes. File descriptor arguments contribute no
    /// inline words.
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_ne(self.sender.raw());
        buf.put_u32_ne(0); // size|opcode patched once the size is known

        for arg in &self.args {
            match arg {
                Argument::Int(v) => buf.put_i32_ne(*v),
                Argument::Uint(v) => buf.put_u32_ne(*v),
                Argument::Fixed(v) => buf.put_i32_ne(v.to_raw()),
                Argument::Object(id) => buf.put_u32_ne(id.map_or(0, ObjectId::raw)),
                Argument::NewId(id) => buf.put_u32_ne(id.raw()),
                Argument::Str(None) => buf.put_u32_ne(0),
                Argument::Str(Some(s)) => {
                    let bytes = s.as_bytes_with_nul();
                    buf.put_u32_ne(bytes.len() as u32);
                    buf.put_slice(bytes);
                    pad_to_word(&mut buf);
                }
                Argument::Array(None) => buf.put_u32_ne(0),
                Argument::Array(Some(a)) => {
                    buf.put_u32_ne(a.len() as u32);
                    buf.put_slice(a);
                    pad_to_word(&mut buf);
                }
                Argument::Fd(_) => {}
            }
        }

        let size = buf.len();
        if size > MAX_MESSAGE_SIZE {
            return Err(CodecError::OutOfRange);
        }
        let word = (size as u32) << 16 | u32::from(self.opcode);
        buf[4..8].copy_from_slice(&word.to_ne_bytes());
        Ok(buf)
    }

    /// Encode onto the connection and request a flush.
    pub fn send(mut self, conn: &mut Connection) -> Result<()> {
        self.transfer_fds(conn)?;
        let buf = self.encode()?;
        conn.write(&buf)?;
        Ok(())
    }

    /// Encode onto the connection without requesting a flush.
    pub fn queue(mut self, conn: &mut Connection) -> Result<()> {
        self.transfer_fds(conn)?;
        let buf = self.encode()?;
        conn.queue(&buf)?;
        Ok(())
    }

    /// Move every fd argument into the connection's outgoing fd ring,
    /// clearing the closure's slot to the transferred placeholder.
    fn transfer_fds(&mut self, conn: &mut Connection) -> Result<()> {
        for arg in &mut self.args {
            if let Argument::Fd(slot) = arg {
                match slot.take() {
                    Some(fd) => conn.push_outgoing_fd(fd)?,
                    None => {
                        return Err(CodecError::InvalidArgument(format!(
                            "{}: file descriptor argument already taken",
                            self.desc.name
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// Decode one complete message of `size` bytes from the connection.
    ///
    /// Always consumes exactly `size` bytes of input, success or failure, so
    /// the stream stays framed; file descriptors already claimed for a
    /// failed message are closed before the error propagates.
    pub fn decode(conn: &mut Connection, size: usize, desc: &'static MessageDesc) -> Result<Self> {
        if size < HEADER_SIZE || conn.pending_input() < size {
            let n = size.min(conn.pending_input());
            conn.consume_incoming(n);
            return Err(CodecError::Truncated);
        }

        let mut raw = vec![0u8; size];
        conn.copy_incoming(&mut raw);
        conn.consume_incoming(size);
        let mut buf = Bytes::from(raw);

        let sender = ObjectId::new(buf.get_u32_ne());
        let word = buf.get_u32_ne();
        let opcode = (word & 0xffff) as u16;

        // `args` owns any fds claimed so far; every early return below drops
        // it, which closes them.
        let mut args = Vec::with_capacity(desc.arg_count());
        for spec in iter_args(desc.signature) {
            let arg = match spec.kind {
                ArgKind::Int => Argument::Int(next_word(&mut buf, sender, desc)? as i32),
                ArgKind::Uint => Argument::Uint(next_word(&mut buf, sender, desc)?),
                ArgKind::Fixed => {
                    Argument::Fixed(Fixed::from_raw(next_word(&mut buf, sender, desc)? as i32))
                }
                ArgKind::Object => {
                    let id = next_word(&mut buf, sender, desc)?;
                    if id == 0 && !spec.nullable {
                        return Err(protocol(sender, desc, "null object on non-nullable slot"));
                    }
                    Argument::Object((id != 0).then(|| ObjectId::new(id)))
                }
                ArgKind::NewId => {
                    let id = next_word(&mut buf, sender, desc)?;
                    if id == 0 && !spec.nullable {
                        return Err(protocol(sender, desc, "null new-id on non-nullable slot"));
                    }
                    Argument::NewId(ObjectId::new(id))
                }
                ArgKind::Str => {
                    let len = next_word(&mut buf, sender, desc)? as usize;
                    if len == 0 {
                        if !spec.nullable {
                            return Err(protocol(
                                sender,
                                desc,
                                "null string on non-nullable slot",
                            ));
                        }
                        Argument::Str(None)
                    } else {
                        let padded = word_aligned(len);
                        if buf.remaining() < padded {
                            return Err(protocol(sender, desc, "string exceeds message bounds"));
                        }
                        let data = buf.split_to(padded);
                        let cstr = CStr::from_bytes_with_nul(&data[..len]).map_err(|_| {
                            protocol(sender, desc, "string not NUL-terminated")
                        })?;
                        Argument::Str(Some(cstr.to_owned()))
                    }
                }
                ArgKind::Array => {
                    let len = next_word(&mut buf, sender, desc)? as usize;
                    let padded = word_aligned(len);
                    if buf.remaining() < padded {
                        return Err(protocol(sender, desc, "array exceeds message bounds"));
                    }
                    let data = buf.split_to(padded);
                    if len == 0 && spec.nullable {
                        Argument::Array(None)
                    } else {
                        Argument::Array(Some(data.slice(..len)))
                    }
                }
                ArgKind::Fd => match conn.pop_incoming_fd() {
                    Some(fd) => Argument::Fd(Some(fd)),
                    None => {
                        return Err(protocol(sender, desc, "file descriptor expected"));
                    }
                },
            };
            args.push(arg);
        }

        Ok(Self {
            sender,
            opcode,
            desc,
            args,
        })
    }

    /// Human-readable one-line rendering in the form
    /// `[   123.456] -> iface@id.msg(args)`, used for wire tracing.
    pub fn trace_line(&self, interface_name: &str, send: bool) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut line = format!(
            "[{:7}.{:03}] {}{}@{}.{}(",
            now.as_secs(),
            now.subsec_millis(),
            if send { " -> " } else { "" },
            interface_name,
            self.sender,
            self.desc.name
        );
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                line.push_str(", ");
            }
            match arg {
                Argument::Int(v) => {
                    let _ = write!(line, "{v}");
                }
                Argument::Uint(v) => {
                    let _ = write!(line, "{v}");
                }
                Argument::Fixed(v) => {
                    let _ = write!(line, "{v}");
                }
                Argument::Str(Some(s)) => {
                    let _ = write!(line, "{:?}", s.to_string_lossy());
                }
                Argument::Str(None) => line.push_str("nil"),
                Argument::Object(Some(id)) => {
                    let _ = write!(line, "object@{id}");
                }
                Argument::Object(None) => line.push_str("nil"),
                Argument::NewId(id) => {
                    let _ = write!(line, "new id {id}");
                }
                Argument::Array(Some(a)) => {
                    let _ = write!(line, "array[{}]", a.len());
                }
                Argument::Array(None) => line.push_str("nil"),
                Argument::Fd(Some(fd)) => {
                    use std::os::fd::AsRawFd;
                    let _ = write!(line, "fd {}", fd.as_raw_fd());
                }
                Argument::Fd(None) => line.push_str("fd (sent)"),
            }
        }
        line.push(')');
        line
    }
}

fn pad_to_word(buf: &mut BytesMut) {
    while buf.len() % 4 != 0 {
        buf.put_u8(0);
    }
}

fn word_aligned(len: usize) -> usize {
    len.div_ceil(4) * 4
}

fn next_word(buf: &mut Bytes, sender: ObjectId, desc: &MessageDesc) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(protocol(sender, desc, "message too short"));
    }
    Ok(buf.get_u32_ne())
}

fn protocol(sender: ObjectId, desc: &MessageDesc, what: &str) -> CodecError {
    debug!(
        sender = sender.raw(),
        message = desc.name,
        signature = desc.signature,
        "decode failed: {what}"
    );
    CodecError::Protocol(format!(
        "{what} (object {sender}, message {}({}))",
        desc.name, desc.signature
    ))
}
