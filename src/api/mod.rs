//! Purpose: Define the stable public Rust API boundary for the bridge.
//! Exports: Client, notification bridge, and the error/loader types callers
//! need.
//! Role: Public surface consumed by the GUI windowing layer and other
//! platform glue; hides the raw ABI modules.
//! Invariants: This module is the only public path to the engine table.

mod client;
mod notify;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::loader::{
    CoreLib, DylibSource, SymbolSource, default_library_name, resolve_library_path,
};
pub use crate::core::symbols::{CALL_HEADER_LEN, MAX_PAYLOAD_ABS, PayloadKind};
pub use client::{ApiResult, CoreClient, Ctx};
pub use notify::{Notification, NotificationBridge};
