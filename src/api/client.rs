//! Purpose: Context lifecycle and synchronous calls over a resolved core table.
//! Exports: `Ctx`, `CoreClient`, and the two-phase call operations.
//! Role: Stable boundary for platform glue; the only synchronous path into the
//! engine.
//! Invariants: Operations are forwarded only for contexts between their start
//! and their stop; stale handles are rejected host-side.
//! Invariants: Every buffer crossing the boundary is host-owned; the engine
//! never allocates memory the host must free.
//! Invariants: Engine-reported sizes are validated before any allocation.

use std::ffi::CString;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::core::ctxset::CtxSet;
use crate::core::error::{Error, ErrorKind};
use crate::core::loader::CoreLib;
use crate::core::symbols::{CALL_HEADER_LEN, MAX_PAYLOAD_ABS, PayloadKind};

pub type ApiResult<T> = Result<T, Error>;

/// Opaque engine context handle. The byte value is chosen by the engine;
/// hosts must not invent one outside `CoreClient::start`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Ctx(u8);

impl Ctx {
    pub fn raw(self) -> u8 {
        self.0
    }

    /// Rebuilds a handle from its raw byte. Only meaningful for a value
    /// previously returned by `start` on this process's bridge.
    pub fn from_raw(raw: u8) -> Self {
        Self(raw)
    }
}

/// Host-side client over one resolved core library: starts and stops
/// contexts, issues synchronous calls, and fetches computed payloads.
///
/// Calls block the issuing thread for the duration of the foreign call; the
/// notification bridge is the only asynchronous path.
#[derive(Clone)]
pub struct CoreClient {
    lib: Arc<CoreLib>,
    ctxs: Arc<CtxSet>,
}

impl CoreClient {
    pub fn new(lib: Arc<CoreLib>) -> Self {
        Self {
            lib,
            ctxs: Arc::new(CtxSet::new()),
        }
    }

    pub(crate) fn lib_arc(&self) -> Arc<CoreLib> {
        self.lib.clone()
    }

    pub(crate) fn ctx_set(&self) -> Arc<CtxSet> {
        self.ctxs.clone()
    }

    /// Starts one engine instance rooted at `root`, with the build output
    /// location defaulting to the root.
    pub fn start(&self, root: &Path) -> ApiResult<Ctx> {
        self.start_with_build(root, root)
    }

    /// Starts one engine instance with distinct root and build locations.
    /// The returned handle is engine-chosen and treated as opaque; an engine
    /// handing back a handle that is already live is rejected rather than
    /// aliased onto the existing instance.
    pub fn start_with_build(&self, root: &Path, build: &Path) -> ApiResult<Ctx> {
        let root_c = path_cstring(root)?;
        let build_c = path_cstring(build)?;
        let ctx = unsafe { (self.lib.start)(root_c.as_ptr(), build_c.as_ptr()) };
        if !self.ctxs.mark(ctx) {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message("engine returned a context handle that is already live")
                .with_ctx(ctx));
        }
        debug!(ctx, live = self.ctxs.live_count(), root = %root.display(), "context started");
        Ok(Ctx(ctx))
    }

    /// Releases all engine-side state for `ctx`. Liveness is cleared before
    /// the forward, so a racing call or notification already sees the handle
    /// as dead.
    pub fn stop(&self, ctx: Ctx) -> ApiResult<()> {
        if !self.ctxs.clear(ctx.0) {
            return Err(stale_ctx(ctx.0));
        }
        unsafe { (self.lib.stop)(ctx.0) };
        debug!(ctx = ctx.0, live = self.ctxs.live_count(), "context stopped");
        Ok(())
    }

    pub fn is_live(&self, ctx: Ctx) -> bool {
        self.ctxs.is_live(ctx.0)
    }

    /// Phase one of the call protocol. `buffer[0..2]` is the `(ctx, id)`
    /// address; the rest is the opaque request body. Returns the byte length
    /// of the computed response, which stays in the engine's transient slot
    /// until fetched.
    pub fn call(&self, buffer: &mut [u8]) -> ApiResult<usize> {
        if buffer.len() < CALL_HEADER_LEN {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message("call buffer shorter than the (ctx, id) header"));
        }
        let (ctx, id) = (buffer[0], buffer[1]);
        if !self.ctxs.is_live(ctx) {
            return Err(stale_ctx(ctx));
        }
        let length = c_int::try_from(buffer.len()).map_err(|_| {
            Error::new(ErrorKind::Usage)
                .with_message("request exceeds the engine's length range")
                .with_ctx(ctx)
                .with_id(id)
        })?;
        let size = unsafe { (self.lib.call)(buffer.as_mut_ptr(), length) };
        if size < 0 {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message("engine reported a negative payload size")
                .with_ctx(ctx)
                .with_id(id));
        }
        let size = size as usize;
        if size > MAX_PAYLOAD_ABS {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message("engine reported an implausible payload size")
                .with_ctx(ctx)
                .with_id(id));
        }
        trace!(ctx, id, size, "call completed");
        Ok(size)
    }

    /// Phase two: copies the payload computed for `(ctx, kind, id)` into
    /// `out`. The engine writes raw bytes with no framing.
    ///
    /// # Safety
    ///
    /// `out` must be at least as long as the size previously reported for
    /// this triple (by `call` for `Data`, by the stream announcement for
    /// `Stream`); the engine writes exactly that many bytes. The triple must
    /// not have been consumed or reused since.
    pub unsafe fn fetch_payload(
        &self,
        ctx: Ctx,
        kind: PayloadKind,
        id: u8,
        out: &mut [u8],
    ) -> ApiResult<()> {
        if !self.ctxs.is_live(ctx.0) {
            return Err(stale_ctx(ctx.0));
        }
        unsafe { (self.lib.get_core_payload)(ctx.0, kind.as_u8(), id, out.as_mut_ptr()) };
        trace!(ctx = ctx.0, id, kind = kind.as_u8(), "payload fetched");
        Ok(())
    }

    /// Both phases in one step: composes the `(ctx, id)` header, issues the
    /// call, allocates exactly the reported size, and fetches the `Data`
    /// payload.
    pub fn invoke(&self, ctx: Ctx, id: u8, body: &[u8]) -> ApiResult<Vec<u8>> {
        let mut request = Vec::with_capacity(CALL_HEADER_LEN + body.len());
        request.push(ctx.0);
        request.push(id);
        request.extend_from_slice(body);
        let size = self.call(&mut request)?;
        let mut response = vec![0u8; size];
        unsafe { self.fetch_payload(ctx, PayloadKind::Data, id, &mut response)? };
        Ok(response)
    }
}

fn stale_ctx(ctx: u8) -> Error {
    Error::new(ErrorKind::Context)
        .with_message("operation on a context that is not live")
        .with_ctx(ctx)
}

fn path_cstring(path: &Path) -> ApiResult<CString> {
    CString::new(path.to_string_lossy().into_owned()).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("path contains an interior nul byte")
            .with_path(path)
            .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::{CoreClient, Ctx, ErrorKind, PayloadKind};
    use crate::stub;
    use std::path::Path;
    use std::sync::Arc;

    fn client() -> CoreClient {
        CoreClient::new(Arc::new(stub::core_lib().expect("core lib")))
    }

    #[test]
    fn start_records_paths_and_liveness() {
        let client = client();
        let ctx = client.start(Path::new("/tmp/project-a")).expect("start");
        assert!(client.is_live(ctx));
        assert_eq!(
            stub::context_root(ctx.raw()).expect("root"),
            "/tmp/project-a"
        );
        client.stop(ctx).expect("stop");
        assert!(!client.is_live(ctx));
        assert!(stub::context_root(ctx.raw()).is_none());
    }

    #[test]
    fn start_with_build_records_both_paths() {
        let client = client();
        let ctx = client
            .start_with_build(Path::new("/tmp/project-root"), Path::new("/tmp/project-build"))
            .expect("start");
        assert_eq!(
            stub::context_root(ctx.raw()).expect("root"),
            "/tmp/project-root"
        );
        assert_eq!(
            stub::context_build(ctx.raw()).expect("build"),
            "/tmp/project-build"
        );
        client.stop(ctx).expect("stop");
    }

    #[test]
    fn call_round_trip_reverses_body() {
        let client = client();
        let ctx = client.start(Path::new("/tmp/project-b")).expect("start");
        let response = client.invoke(ctx, 9, b"abcdef").expect("invoke");
        assert_eq!(response, b"fedcba");
        client.stop(ctx).expect("stop");
    }

    #[test]
    fn short_buffer_is_rejected_before_forwarding() {
        let client = client();
        let mut buffer = [0u8; 1];
        let err = client.call(&mut buffer).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn dead_context_is_rejected_host_side() {
        let client = client();
        let ctx = client.start(Path::new("/tmp/project-c")).expect("start");
        client.stop(ctx).expect("stop");

        let mut buffer = vec![ctx.raw(), 1, 0xAA];
        assert_eq!(
            client.call(&mut buffer).expect_err("call").kind(),
            ErrorKind::Context
        );
        assert_eq!(
            client.stop(ctx).expect_err("stop").kind(),
            ErrorKind::Context
        );
        let mut out = [0u8; 4];
        let err = unsafe {
            client
                .fetch_payload(ctx, PayloadKind::Data, 1, &mut out)
                .expect_err("fetch")
        };
        assert_eq!(err.kind(), ErrorKind::Context);
    }

    #[test]
    fn never_started_handle_is_rejected() {
        let client = client();
        // Handles live in another client's set are equally dead here.
        let err = client.stop(Ctx::from_raw(200)).expect_err("stop");
        assert_eq!(err.kind(), ErrorKind::Context);
    }

    #[test]
    fn distinct_ids_in_flight_do_not_alias() {
        let client = client();
        let ctx = client.start(Path::new("/tmp/project-d")).expect("start");

        let mut first = vec![ctx.raw(), 3];
        first.extend_from_slice(b"first-payload");
        let mut second = vec![ctx.raw(), 4];
        second.extend_from_slice(b"second");

        let first_size = client.call(&mut first).expect("call first");
        let second_size = client.call(&mut second).expect("call second");

        let mut out_second = vec![0u8; second_size];
        unsafe {
            client
                .fetch_payload(ctx, PayloadKind::Data, 4, &mut out_second)
                .expect("fetch second");
        }
        let mut out_first = vec![0u8; first_size];
        unsafe {
            client
                .fetch_payload(ctx, PayloadKind::Data, 3, &mut out_first)
                .expect("fetch first");
        }

        assert_eq!(out_first, b"daolyap-tsrif");
        assert_eq!(out_second, b"dnoces");
        client.stop(ctx).expect("stop");
    }

    #[test]
    fn empty_body_round_trips_to_empty_response() {
        let client = client();
        let ctx = client.start(Path::new("/tmp/project-e")).expect("start");
        let response = client.invoke(ctx, 0, b"").expect("invoke");
        assert!(response.is_empty());
        client.stop(ctx).expect("stop");
    }

    // Engine that hands out one fixed handle and misreports sizes; exercises
    // the rejection paths a well-behaved engine never reaches.
    mod misbehaving {
        use crate::core::loader::SymbolSource;
        use crate::core::symbols::{
            CallFn, GetCorePayloadFn, RaiseFn, RawFn, SetOnStreamDataFn, StartFn, StopFn,
            SYM_CALL, SYM_GET_CORE_PAYLOAD, SYM_SET_ON_STREAM_DATA, SYM_START, SYM_STOP,
        };
        use std::os::raw::{c_char, c_int};

        unsafe extern "C" fn fixed_start(_root: *const c_char, _build: *const c_char) -> u8 {
            7
        }
        unsafe extern "C" fn noop_stop(_ctx: u8) {}
        unsafe extern "C" fn noop_sink(_cb: RaiseFn) {}
        unsafe extern "C" fn negative_call(_buffer: *mut u8, _length: c_int) -> c_int {
            -5
        }
        unsafe extern "C" fn noop_fetch(_ctx: u8, _kind: u8, _id: u8, _out: *mut u8) {}

        pub struct MisbehavingSource;

        impl SymbolSource for MisbehavingSource {
            fn resolve(&self, name: &str) -> Option<RawFn> {
                match name {
                    SYM_START => Some(fixed_start as StartFn as RawFn),
                    SYM_STOP => Some(noop_stop as StopFn as RawFn),
                    SYM_SET_ON_STREAM_DATA => Some(noop_sink as SetOnStreamDataFn as RawFn),
                    SYM_CALL => Some(negative_call as CallFn as RawFn),
                    SYM_GET_CORE_PAYLOAD => Some(noop_fetch as GetCorePayloadFn as RawFn),
                    _ => None,
                }
            }
        }
    }

    fn misbehaving_client() -> CoreClient {
        let lib = crate::core::loader::CoreLib::resolve(Box::new(misbehaving::MisbehavingSource))
            .expect("resolve");
        CoreClient::new(Arc::new(lib))
    }

    #[test]
    fn engine_reusing_a_live_handle_is_rejected() {
        let client = misbehaving_client();
        let first = client.start(Path::new("/tmp/fixed")).expect("start");
        assert_eq!(first.raw(), 7);

        let err = client.start(Path::new("/tmp/fixed-again")).expect_err("dup");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.ctx().expect("ctx"), 7);
        // The first instance stays live and usable.
        assert!(client.is_live(first));
    }

    #[test]
    fn negative_reported_size_is_protocol_error() {
        let client = misbehaving_client();
        let ctx = client.start(Path::new("/tmp/negative")).expect("start");
        let mut buffer = vec![ctx.raw(), 1, 0x00];
        let err = client.call(&mut buffer).expect_err("call");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
