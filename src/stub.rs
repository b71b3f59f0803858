//! Purpose: In-process reference engine implementing the core ABI.
//! Exports: `StubSource`, `core_lib`, `raise`, `context_root`, `context_build`, `reset`.
//! Role: Deterministic stand-in for a shipped core binary; backs the
//! test-suite and the probe's self-test mode.
//! Invariants: Responses are the byte-reversed request body.
//! Invariants: Payload slots are transient per `(ctx, kind, id)` and consumed
//! by the first fetch.
//! Invariants: State is process-global, like the dynamic library it stands in
//! for; concurrent users get disjoint handles from the shared allocator.

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::core::error::Error;
use crate::core::loader::{CoreLib, SymbolSource};
use crate::core::symbols::{
    CALL_HEADER_LEN, CallFn, GetCorePayloadFn, PayloadKind, RaiseFn, RawFn, SYM_CALL,
    SYM_GET_CORE_PAYLOAD, SYM_SET_ON_STREAM_DATA, SYM_START, SYM_STOP, SetOnStreamDataFn,
    StartFn, StopFn,
};

struct StubContext {
    root: String,
    build: String,
}

#[derive(Default)]
struct StubState {
    contexts: HashMap<u8, StubContext>,
    payloads: HashMap<(u8, u8, u8), Vec<u8>>,
    on_stream_data: Option<RaiseFn>,
}

fn state() -> MutexGuard<'static, StubState> {
    static STATE: OnceLock<Mutex<StubState>> = OnceLock::new();
    // Entry points are reached through C function pointers and must not
    // unwind; poisoning is recovered instead of escalated.
    STATE
        .get_or_init(|| Mutex::new(StubState::default()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

unsafe extern "C" fn stub_start(root: *const c_char, build: *const c_char) -> u8 {
    let root = unsafe { cstr_to_string(root) };
    let build = unsafe { cstr_to_string(build) };
    let mut state = state();
    // First-free allocation; handle exhaustion hands back 0, which the
    // bridge then rejects as a duplicate.
    let ctx = (0..=255u8)
        .find(|ctx| !state.contexts.contains_key(ctx))
        .unwrap_or(0);
    state.contexts.insert(ctx, StubContext { root, build });
    ctx
}

unsafe extern "C" fn stub_stop(ctx: u8) {
    let mut state = state();
    state.contexts.remove(&ctx);
    state.payloads.retain(|key, _| key.0 != ctx);
}

unsafe extern "C" fn stub_set_on_stream_data(cb: RaiseFn) {
    let mut state = state();
    state.on_stream_data = Some(cb);
}

unsafe extern "C" fn stub_call(buffer: *mut u8, length: c_int) -> c_int {
    if length < CALL_HEADER_LEN as c_int {
        return -1;
    }
    let request = unsafe { std::slice::from_raw_parts(buffer, length as usize) };
    let (ctx, id) = (request[0], request[1]);
    let mut state = state();
    if !state.contexts.contains_key(&ctx) {
        return -1;
    }
    let mut body = request[CALL_HEADER_LEN..].to_vec();
    body.reverse();
    let size = body.len() as c_int;
    state
        .payloads
        .insert((ctx, PayloadKind::Data.as_u8(), id), body);
    size
}

unsafe extern "C" fn stub_get_core_payload(ctx: u8, kind: u8, id: u8, out: *mut u8) {
    let mut state = state();
    // Never-computed or already-consumed triples leave `out` untouched.
    if let Some(bytes) = state.payloads.remove(&(ctx, kind, id)) {
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len()) };
    }
}

unsafe fn cstr_to_string(value: *const c_char) -> String {
    if value.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(value) }.to_string_lossy().into_owned()
}

/// Symbol source over the stub's entry points. `without` and `with_null`
/// produce deliberately broken tables for loader tests.
pub struct StubSource {
    missing: Option<&'static str>,
    nulled: Option<&'static str>,
}

impl StubSource {
    pub fn new() -> Self {
        Self {
            missing: None,
            nulled: None,
        }
    }

    pub fn without(mut self, name: &'static str) -> Self {
        self.missing = Some(name);
        self
    }

    pub fn with_null(mut self, name: &'static str) -> Self {
        self.nulled = Some(name);
        self
    }
}

impl Default for StubSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolSource for StubSource {
    fn resolve(&self, name: &str) -> Option<RawFn> {
        if self.missing == Some(name) {
            return None;
        }
        if self.nulled == Some(name) {
            return Some(ptr::null_mut());
        }
        match name {
            SYM_START => Some(stub_start as StartFn as RawFn),
            SYM_STOP => Some(stub_stop as StopFn as RawFn),
            SYM_SET_ON_STREAM_DATA => {
                Some(stub_set_on_stream_data as SetOnStreamDataFn as RawFn)
            }
            SYM_CALL => Some(stub_call as CallFn as RawFn),
            SYM_GET_CORE_PAYLOAD => Some(stub_get_core_payload as GetCorePayloadFn as RawFn),
            _ => None,
        }
    }
}

/// Resolved table over the stub engine.
pub fn core_lib() -> Result<CoreLib, Error> {
    CoreLib::resolve(Box::new(StubSource::new()))
}

/// Simulates an engine-side stream push: stores `chunk` in the transient
/// `(ctx, Stream, id)` slot, then announces it through the registered sink.
/// Returns false when no sink is registered. Call from any thread.
pub fn raise(ctx: u8, id: u8, chunk: &[u8]) -> bool {
    let cb = {
        let mut state = state();
        state
            .payloads
            .insert((ctx, PayloadKind::Stream.as_u8(), id), chunk.to_vec());
        state.on_stream_data
    };
    // Announced outside the lock: the sink's trampoline fetches the chunk
    // back through `getCorePayload` on this same thread.
    match cb {
        Some(cb) => {
            cb(ctx, id, chunk.len() as c_int);
            true
        }
        None => false,
    }
}

/// Root path the engine recorded for `ctx` at start, if the context is live.
pub fn context_root(ctx: u8) -> Option<String> {
    let state = state();
    state.contexts.get(&ctx).map(|context| context.root.clone())
}

/// Build path the engine recorded for `ctx` at start, if the context is live.
pub fn context_build(ctx: u8) -> Option<String> {
    let state = state();
    state.contexts.get(&ctx).map(|context| context.build.clone())
}

/// Clears all stub state. Only for tests that need a cold engine; concurrent
/// users of the shared allocator must not be running.
pub fn reset() {
    let mut state = state();
    state.contexts.clear();
    state.payloads.clear();
    state.on_stream_data = None;
}
