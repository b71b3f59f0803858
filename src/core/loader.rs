//! Purpose: Resolve the core engine's entry points into a fixed function table.
//! Exports: `SymbolSource`, `DylibSource`, `CoreLib`, library path resolution.
//! Role: The only module that opens modules or names symbols; everything else
//! works against the resolved table.
//! Invariants: A resolved `CoreLib` never holds a missing or null entry point.
//! Invariants: The symbol source outlives the table; pointers never dangle.

use std::mem;
use std::path::{Path, PathBuf};

use libloading::Library;
use tracing::info;

use crate::core::error::{Error, ErrorKind};
use crate::core::symbols::{
    CallFn, GetCorePayloadFn, RawFn, SYM_CALL, SYM_GET_CORE_PAYLOAD, SYM_SET_ON_STREAM_DATA,
    SYM_START, SYM_STOP, SetOnStreamDataFn, StartFn, StopFn,
};

/// Name-to-address resolution contract. One implementation per platform
/// loader; the stub engine provides an in-process implementation for tests.
pub trait SymbolSource: Send + Sync {
    fn resolve(&self, name: &str) -> Option<RawFn>;
}

/// Symbol source backed by a dynamically loaded module. `libloading` supplies
/// the POSIX (`dlopen`/`dlsym`) and Windows (`LoadLibrary`/`GetProcAddress`)
/// strategies behind the same contract.
#[derive(Debug)]
pub struct DylibSource {
    lib: Library,
}

impl DylibSource {
    pub fn open(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("cannot find core library")
                .with_path(path));
        }
        let lib = unsafe { Library::new(path) }.map_err(|err| {
            Error::new(ErrorKind::NotFound)
                .with_message("failed to open core library")
                .with_path(path)
                .with_source(err)
        })?;
        Ok(Self { lib })
    }
}

impl SymbolSource for DylibSource {
    fn resolve(&self, name: &str) -> Option<RawFn> {
        let symbol = unsafe { self.lib.get::<RawFn>(name.as_bytes()) }.ok()?;
        Some(*symbol)
    }
}

/// The resolved engine function table. Immutable after load; shared read-only
/// by every context. Owns its symbol source so the addresses stay valid for
/// the table's lifetime.
pub struct CoreLib {
    pub(crate) start: StartFn,
    pub(crate) stop: StopFn,
    pub(crate) set_on_stream_data: SetOnStreamDataFn,
    pub(crate) call: CallFn,
    pub(crate) get_core_payload: GetCorePayloadFn,
    _source: Box<dyn SymbolSource>,
}

impl std::fmt::Debug for CoreLib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreLib").finish_non_exhaustive()
    }
}

impl CoreLib {
    /// Opens the module at `path` and resolves every required entry point.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let lib = Self::resolve(Box::new(DylibSource::open(path)?))?;
        info!(path = %path.display(), "core library loaded");
        Ok(lib)
    }

    /// Builds the table from an already-open symbol source. Every required
    /// symbol is checked here; a missing or null entry fails naming the
    /// symbol, so no unresolved pointer is ever reachable by a later call.
    pub fn resolve(source: Box<dyn SymbolSource>) -> Result<Self, Error> {
        let start = resolve_fn::<StartFn>(source.as_ref(), SYM_START)?;
        let stop = resolve_fn::<StopFn>(source.as_ref(), SYM_STOP)?;
        let set_on_stream_data =
            resolve_fn::<SetOnStreamDataFn>(source.as_ref(), SYM_SET_ON_STREAM_DATA)?;
        let call = resolve_fn::<CallFn>(source.as_ref(), SYM_CALL)?;
        let get_core_payload =
            resolve_fn::<GetCorePayloadFn>(source.as_ref(), SYM_GET_CORE_PAYLOAD)?;
        Ok(Self {
            start,
            stop,
            set_on_stream_data,
            call,
            get_core_payload,
            _source: source,
        })
    }
}

fn resolve_fn<F: Copy>(source: &dyn SymbolSource, name: &'static str) -> Result<F, Error> {
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<RawFn>());
    let raw = source
        .resolve(name)
        .filter(|addr| !addr.is_null())
        .ok_or_else(|| {
            Error::new(ErrorKind::Symbol)
                .with_message("required entry point did not resolve")
                .with_symbol(name)
        })?;
    Ok(unsafe { mem::transmute_copy::<RawFn, F>(&raw) })
}

/// File name of the core binary for the running platform, using the naming
/// scheme the engine is shipped under: `{platform}-{arch}.{so|dll}`.
pub fn default_library_name() -> String {
    format!("{}-{}.{}", platform_tag(), arch_tag(), library_ext())
}

/// Locates the core binary inside `dir`, failing with the candidate path when
/// it is absent.
pub fn resolve_library_path(dir: &Path) -> Result<PathBuf, Error> {
    let candidate = dir.join(default_library_name());
    if !candidate.exists() {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message("cannot find core library")
            .with_path(candidate));
    }
    Ok(candidate)
}

fn platform_tag() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "darwin"
    }
    #[cfg(target_os = "windows")]
    {
        "win32"
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        std::env::consts::OS
    }
}

fn arch_tag() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn library_ext() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "dll"
    }
    #[cfg(not(target_os = "windows"))]
    {
        "so"
    }
}

#[cfg(test)]
mod tests {
    use super::{CoreLib, DylibSource, default_library_name, resolve_library_path};
    use crate::core::error::ErrorKind;
    use crate::stub::StubSource;

    #[test]
    fn missing_module_is_not_found_with_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("no-such-core.so");
        let err = DylibSource::open(&path).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.path().expect("path"), &path);
    }

    #[test]
    fn missing_symbol_is_named() {
        let source = StubSource::new().without("getCorePayload");
        let err = CoreLib::resolve(Box::new(source)).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Symbol);
        assert_eq!(err.symbol().expect("symbol"), "getCorePayload");
    }

    #[test]
    fn null_symbol_is_rejected_like_a_missing_one() {
        let source = StubSource::new().with_null("call");
        let err = CoreLib::resolve(Box::new(source)).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Symbol);
        assert_eq!(err.symbol().expect("symbol"), "call");
    }

    #[test]
    fn complete_source_resolves() {
        CoreLib::resolve(Box::new(StubSource::new())).expect("resolve");
    }

    #[test]
    fn library_name_matches_platform_scheme() {
        let name = default_library_name();
        assert!(name.contains('-'));
        #[cfg(target_os = "windows")]
        assert!(name.ends_with(".dll"));
        #[cfg(not(target_os = "windows"))]
        assert!(name.ends_with(".so"));
    }

    #[test]
    fn resolve_library_path_reports_candidate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = resolve_library_path(temp.path()).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let reported = err.path().expect("path");
        assert!(reported.starts_with(temp.path()));

        let present = temp.path().join(default_library_name());
        std::fs::write(&present, b"").expect("write");
        let found = resolve_library_path(temp.path()).expect("resolve");
        assert_eq!(found, present);
    }
}
