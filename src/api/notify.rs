//! Purpose: Deliver engine-initiated payloads to the host's own execution
//! context.
//! Exports: `Notification`, `NotificationBridge`.
//! Role: The only asynchronous path in the bridge; engine threads produce,
//! exactly one host consumer drains in arrival order.
//! Invariants: Registration is global and single; a second live registration
//! is an error, never a silent replacement.
//! Invariants: The raising thread is never blocked; enqueue is non-blocking
//! and the payload copy is bounded by the announced size.
//! Invariants: After release, raises are dropped silently; nothing is queued
//! or delivered and no fault occurs.
//! Invariants: Entries for stopped contexts are dropped at enqueue and again
//! at drain.
//!
//! The handoff queue is unbounded. The engine's transient payload slots bound
//! its burst rate, and dropping stream chunks would corrupt reassembly
//! downstream, so the queue grows instead of shedding; hosts are expected to
//! drain on every scheduler turn.

use std::os::raw::c_int;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError, channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::api::client::{ApiResult, CoreClient, Ctx};
use crate::core::ctxset::CtxSet;
use crate::core::error::{Error, ErrorKind};
use crate::core::loader::CoreLib;
use crate::core::symbols::{MAX_PAYLOAD_ABS, PayloadKind};

/// One engine push, materialized on the raising thread and handed across to
/// the host consumer.
#[derive(Debug)]
pub struct Notification {
    pub ctx: Ctx,
    pub id: u8,
    pub payload: Vec<u8>,
}

struct SinkState {
    lib: Arc<CoreLib>,
    ctxs: Arc<CtxSet>,
    tx: Sender<Notification>,
}

// The engine ABI takes one bare trampoline with no user-data slot, so the
// producer half of the handoff has to live in process-global state. The slot
// is owned by exactly one `NotificationBridge` at a time.
static SINK: Mutex<Option<SinkState>> = Mutex::new(None);

extern "C" fn raise_trampoline(ctx: u8, id: u8, size: c_int) {
    // Runs on an engine thread. Must not panic and must not block beyond the
    // brief slot lock.
    let state = {
        let Ok(guard) = SINK.lock() else {
            return;
        };
        match guard.as_ref() {
            Some(state) => SinkState {
                lib: state.lib.clone(),
                ctxs: state.ctxs.clone(),
                tx: state.tx.clone(),
            },
            None => {
                trace!(ctx, id, "notification dropped after teardown");
                return;
            }
        }
    };
    if size <= 0 || size as usize > MAX_PAYLOAD_ABS {
        debug!(ctx, id, size, "notification dropped: implausible size");
        return;
    }
    if !state.ctxs.is_live(ctx) {
        debug!(ctx, id, "notification dropped: context not live");
        return;
    }
    let mut payload = vec![0u8; size as usize];
    unsafe {
        (state.lib.get_core_payload)(ctx, PayloadKind::Stream.as_u8(), id, payload.as_mut_ptr())
    };
    // Send can only fail during a concurrent release; the drop is the
    // documented outcome in that window.
    let _ = state.tx.send(Notification {
        ctx: Ctx::from_raw(ctx),
        id,
        payload,
    });
}

/// Consumer half of the notification handoff. Owns the process-wide sink
/// registration for its lifetime; dropping it releases the registration.
#[derive(Debug)]
pub struct NotificationBridge {
    rx: Receiver<Notification>,
    ctxs: Arc<CtxSet>,
    released: bool,
}

impl NotificationBridge {
    /// Installs the delivery trampoline and returns the consumer handle.
    /// Fails with `Usage` while another registration is live.
    pub fn register(client: &CoreClient) -> ApiResult<Self> {
        let lib = client.lib_arc();
        let ctxs = client.ctx_set();
        let (tx, rx) = channel();
        {
            let mut guard = SINK
                .lock()
                .map_err(|_| Error::new(ErrorKind::Internal).with_message("sink state poisoned"))?;
            if guard.is_some() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("notification sink is already registered"));
            }
            *guard = Some(SinkState {
                lib: lib.clone(),
                ctxs: ctxs.clone(),
                tx,
            });
        }
        unsafe { (lib.set_on_stream_data)(raise_trampoline) };
        info!("notification sink registered");
        Ok(Self {
            rx,
            ctxs,
            released: false,
        })
    }

    /// Blocks the consumer until a notification for a live context arrives.
    /// Returns None if the producer side has gone away.
    pub fn recv(&self) -> Option<Notification> {
        loop {
            match self.rx.recv() {
                Ok(notification) if self.deliverable(&notification) => return Some(notification),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Bounded wait for the next deliverable notification.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(notification) if self.deliverable(&notification) => return Some(notification),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None;
                }
            }
        }
    }

    /// Non-blocking poll for the next deliverable notification.
    pub fn try_recv(&self) -> Option<Notification> {
        loop {
            match self.rx.try_recv() {
                Ok(notification) if self.deliverable(&notification) => return Some(notification),
                Ok(_) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    /// Drains everything currently queued into `deliver`, in arrival order.
    /// Returns the number delivered.
    pub fn drain(&self, mut deliver: impl FnMut(Notification)) -> usize {
        let mut count = 0;
        while let Some(notification) = self.try_recv() {
            deliver(notification);
            count += 1;
        }
        count
    }

    /// Tears the handoff down. Raises the engine attempts afterwards find no
    /// sink and are dropped silently; the ABI offers no unregister call, so
    /// the trampoline stays installed but inert.
    pub fn release(mut self) {
        self.teardown();
    }

    fn deliverable(&self, notification: &Notification) -> bool {
        if self.ctxs.is_live(notification.ctx.raw()) {
            return true;
        }
        debug!(
            ctx = notification.ctx.raw(),
            id = notification.id,
            "queued notification dropped at drain: context not live"
        );
        false
    }

    fn teardown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Ok(mut guard) = SINK.lock() {
            *guard = None;
        }
        info!("notification sink released");
    }
}

impl Drop for NotificationBridge {
    fn drop(&mut self) {
        self.teardown();
    }
}
