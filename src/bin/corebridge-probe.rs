//! Purpose: `corebridge-probe` validates a core library before the host
//! commits to it.
//! Role: Binary entry point; resolves the core binary, checks every required
//! symbol, and reports as JSON on stdout.
//! Invariants: The report is JSON-only on stdout; errors are JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: `--self-test` never touches a real library; it runs the
//! protocol against the in-process stub engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use corebridge::api::{
    CoreClient, CoreLib, Error, ErrorKind, NotificationBridge, resolve_library_path, to_exit_code,
};
use corebridge::core::symbols::REQUIRED_SYMBOLS;
use corebridge::stub;

#[derive(Parser)]
#[command(
    name = "corebridge-probe",
    about = "Validate a core engine library against the bridge protocol"
)]
struct Cli {
    /// Path to the core library binary. When omitted, the binary is resolved
    /// inside --lib-dir by platform naming.
    lib: Option<PathBuf>,

    /// Directory holding the platform-named core binary.
    #[arg(long, default_value = ".", conflicts_with = "lib")]
    lib_dir: PathBuf,

    /// Run the protocol round-trip against the in-process stub engine
    /// instead of loading a library.
    #[arg(long)]
    self_test: bool,
}

#[derive(Serialize)]
struct ProbeReport {
    library: Option<String>,
    symbols: Vec<&'static str>,
    self_test: Option<SelfTestReport>,
}

#[derive(Serialize)]
struct SelfTestReport {
    ctx: u8,
    request_bytes: usize,
    response_bytes: usize,
    notifications: usize,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        }
        Err(err) => {
            eprintln!("{}", json!({ "error": err.to_string() }));
            std::process::exit(to_exit_code(err.kind()));
        }
    }
}

fn run(cli: Cli) -> Result<ProbeReport, Error> {
    if cli.self_test {
        let outcome = self_test()?;
        return Ok(ProbeReport {
            library: None,
            symbols: REQUIRED_SYMBOLS.to_vec(),
            self_test: Some(outcome),
        });
    }

    let path = match cli.lib {
        Some(path) => path,
        None => resolve_library_path(&cli.lib_dir)?,
    };
    CoreLib::load(&path)?;
    Ok(ProbeReport {
        library: Some(path.display().to_string()),
        symbols: REQUIRED_SYMBOLS.to_vec(),
        self_test: None,
    })
}

fn self_test() -> Result<SelfTestReport, Error> {
    stub::reset();
    let client = CoreClient::new(Arc::new(stub::core_lib()?));
    let bridge = NotificationBridge::register(&client)?;

    let root = std::env::temp_dir().join("corebridge-probe");
    let ctx = client.start(&root)?;

    let request = b"probe-self-test";
    let response = client.invoke(ctx, 1, request)?;
    let mut expected = request.to_vec();
    expected.reverse();
    if response != expected {
        return Err(Error::new(ErrorKind::Internal)
            .with_message("stub round-trip produced unexpected bytes")
            .with_ctx(ctx.raw()));
    }

    stub::raise(ctx.raw(), 2, b"probe-chunk");
    let notifications = bridge.drain(|_| {});

    client.stop(ctx)?;
    bridge.release();

    Ok(SelfTestReport {
        ctx: ctx.raw(),
        request_bytes: request.len(),
        response_bytes: response.len(),
        notifications,
    })
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
