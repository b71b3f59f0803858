//! Purpose: Host-side bridge for driving a dynamically loaded core engine.
//! Exports: `api` (client + notification bridge), `core` (loader, ABI types,
//! errors), `stub` (in-process reference engine).
//! Role: The only layer that touches the engine ABI; GUI windowing and other
//! platform glue consume `api` and never name a symbol.
//! Invariants: No panic or unwinding crosses the dynamic-library boundary.
//! Invariants: Request and response buffers are host-owned on every path.
pub mod api;
pub mod core;
pub mod stub;
