// Raw ABI surface of the core engine library.
use std::os::raw::{c_char, c_int, c_void};

use crate::core::error::{Error, ErrorKind};

pub const SYM_START: &str = "start";
pub const SYM_STOP: &str = "stop";
pub const SYM_SET_ON_STREAM_DATA: &str = "setOnStreamData";
pub const SYM_CALL: &str = "call";
pub const SYM_GET_CORE_PAYLOAD: &str = "getCorePayload";

pub const REQUIRED_SYMBOLS: [&str; 5] = [
    SYM_START,
    SYM_STOP,
    SYM_SET_ON_STREAM_DATA,
    SYM_CALL,
    SYM_GET_CORE_PAYLOAD,
];

/// First two bytes of every request buffer: `(ctx, id)`.
pub const CALL_HEADER_LEN: usize = 2;

/// Ceiling for any engine-reported payload length. Sizes above this are
/// treated as protocol corruption, never allocated.
pub const MAX_PAYLOAD_ABS: usize = 256 * 1024 * 1024;

/// Address of a resolved entry point before it is given a typed signature.
pub type RawFn = *mut c_void;

/// Trampoline the engine invokes, from any of its threads, when a payload
/// becomes ready: `(ctx, id, size)`.
pub type RaiseFn = extern "C" fn(ctx: u8, id: u8, size: c_int);

pub type StartFn = unsafe extern "C" fn(root: *const c_char, build: *const c_char) -> u8;
pub type StopFn = unsafe extern "C" fn(ctx: u8);
pub type SetOnStreamDataFn = unsafe extern "C" fn(cb: RaiseFn);
pub type CallFn = unsafe extern "C" fn(buffer: *mut u8, length: c_int) -> c_int;
pub type GetCorePayloadFn = unsafe extern "C" fn(ctx: u8, kind: u8, id: u8, out: *mut u8);

/// Discriminator between a one-shot call response and a chunk of an ongoing
/// stream. Values are fixed by the engine ABI.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PayloadKind {
    Data = 1,
    Stream = 2,
}

impl PayloadKind {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(PayloadKind::Data),
            2 => Ok(PayloadKind::Stream),
            _ => Err(Error::new(ErrorKind::Protocol).with_message("invalid payload kind")),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
