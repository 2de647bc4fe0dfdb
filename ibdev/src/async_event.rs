//! Asynchronous hardware event registry.
//!
//! Callers register interest in an `(event type, resource id)` key, attach at
//! most one [`WaitContext`] at a time, and get their callback scheduled on the
//! context's [`CallbackQueue`] once the event fires. An event that fires
//! before anyone waits is remembered, so a later `wait` still delivers.
//!
//! Lock order is registry, then wait context. Callbacks never run under
//! either lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::callback::{CallbackId, CallbackQueue};
use crate::error::{IbError, Result};

/// Hardware asynchronous event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncEventType {
    CqErr,
    QpFatal,
    QpReqErr,
    QpAccessErr,
    CommEst,
    SqDrained,
    PathMig,
    PathMigErr,
    DeviceFatal,
    PortActive,
    PortErr,
    LidChange,
    PkeyChange,
    SmChange,
    SrqErr,
    SrqLimitReached,
    QpLastWqeReached,
    ClientReregister,
    GidChange,
    WqFatal,
    /// A value this crate does not know about.
    Other(u32),
}

impl AsyncEventType {
    /// Decode a raw `ibv_event_type` value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::CqErr,
            1 => Self::QpFatal,
            2 => Self::QpReqErr,
            3 => Self::QpAccessErr,
            4 => Self::CommEst,
            5 => Self::SqDrained,
            6 => Self::PathMig,
            7 => Self::PathMigErr,
            8 => Self::DeviceFatal,
            9 => Self::PortActive,
            10 => Self::PortErr,
            11 => Self::LidChange,
            12 => Self::PkeyChange,
            13 => Self::SmChange,
            14 => Self::SrqErr,
            15 => Self::SrqLimitReached,
            16 => Self::QpLastWqeReached,
            17 => Self::ClientReregister,
            18 => Self::GidChange,
            19 => Self::WqFatal,
            other => Self::Other(other),
        }
    }

    pub fn as_raw(&self) -> u32 {
        match self {
            Self::CqErr => 0,
            Self::QpFatal => 1,
            Self::QpReqErr => 2,
            Self::QpAccessErr => 3,
            Self::CommEst => 4,
            Self::SqDrained => 5,
            Self::PathMig => 6,
            Self::PathMigErr => 7,
            Self::DeviceFatal => 8,
            Self::PortActive => 9,
            Self::PortErr => 10,
            Self::LidChange => 11,
            Self::PkeyChange => 12,
            Self::SmChange => 13,
            Self::SrqErr => 14,
            Self::SrqLimitReached => 15,
            Self::QpLastWqeReached => 16,
            Self::ClientReregister => 17,
            Self::GidChange => 18,
            Self::WqFatal => 19,
            Self::Other(raw) => *raw,
        }
    }

    /// Same text as `ibv_event_type_str`.
    pub fn description(&self) -> &'static str {
        match self {
            Self::CqErr => "CQ error",
            Self::QpFatal => "local work queue catastrophic error",
            Self::QpReqErr => "invalid request local work queue error",
            Self::QpAccessErr => "local access violation work queue error",
            Self::CommEst => "communication established",
            Self::SqDrained => "send queue drained",
            Self::PathMig => "path migrated",
            Self::PathMigErr => "path migration request error",
            Self::DeviceFatal => "local catastrophic error",
            Self::PortActive => "port active",
            Self::PortErr => "port error",
            Self::LidChange => "LID change",
            Self::PkeyChange => "P_Key change",
            Self::SmChange => "SM change",
            Self::SrqErr => "SRQ catastrophic error",
            Self::SrqLimitReached => "SRQ limit reached",
            Self::QpLastWqeReached => "last WQE reached",
            Self::ClientReregister => "client reregistration",
            Self::GidChange => "GID table change",
            Self::WqFatal => "WQ fatal",
            Self::Other(_) => "unknown",
        }
    }

    /// How loudly an occurrence of this event should be reported.
    pub fn severity(&self) -> EventSeverity {
        match self {
            Self::CqErr
            | Self::QpFatal
            | Self::QpReqErr
            | Self::SqDrained
            | Self::PathMig
            | Self::PathMigErr
            | Self::SrqErr => EventSeverity::Error,
            Self::GidChange | Self::LidChange | Self::PkeyChange => EventSeverity::Warn,
            Self::CommEst
            | Self::QpAccessErr
            | Self::DeviceFatal
            | Self::PortActive
            | Self::PortErr
            | Self::SmChange
            | Self::ClientReregister => EventSeverity::Diag,
            Self::QpLastWqeReached | Self::SrqLimitReached => EventSeverity::Debug,
            Self::WqFatal | Self::Other(_) => EventSeverity::Info,
        }
    }
}

impl AsyncEventType {
    /// Which member of the `ibv_async_event` element union is valid.
    pub fn element_kind(&self) -> ElementKind {
        match self {
            Self::CqErr => ElementKind::Cq,
            Self::QpFatal
            | Self::QpReqErr
            | Self::QpAccessErr
            | Self::CommEst
            | Self::SqDrained
            | Self::PathMig
            | Self::PathMigErr
            | Self::QpLastWqeReached => ElementKind::Qp,
            Self::SrqErr | Self::SrqLimitReached => ElementKind::Srq,
            Self::DeviceFatal
            | Self::PortActive
            | Self::PortErr
            | Self::LidChange
            | Self::PkeyChange
            | Self::SmChange
            | Self::ClientReregister
            | Self::GidChange => ElementKind::Port,
            Self::WqFatal | Self::Other(_) => ElementKind::None,
        }
    }
}

impl fmt::Display for AsyncEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Error,
    Warn,
    Diag,
    Info,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Cq,
    Qp,
    Srq,
    Port,
    None,
}

/// The object an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventElement {
    /// Opaque completion queue address.
    Cq(u64),
    /// Queue pair number.
    Qp(u32),
    /// Opaque shared receive queue address.
    Srq(u64),
    Port(u8),
    None,
}

/// One decoded hardware notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwAsyncEvent {
    pub event_type: AsyncEventType,
    pub element: EventElement,
}

impl HwAsyncEvent {
    pub fn new(event_type: AsyncEventType, element: EventElement) -> Self {
        Self {
            event_type,
            element,
        }
    }

    /// Registry key for this event. Queue addresses are truncated to their
    /// low 32 bits.
    pub fn key(&self) -> AsyncEventKey {
        let resource_id = match self.element {
            EventElement::Qp(qpn) => qpn,
            EventElement::Port(port) => u32::from(port),
            EventElement::Cq(cookie) | EventElement::Srq(cookie) => cookie as u32,
            EventElement::None => 0,
        };
        AsyncEventKey::new(self.event_type, resource_id)
    }
}

impl fmt::Display for HwAsyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.event_type, self.element) {
            (AsyncEventType::QpLastWqeReached, EventElement::Qp(qpn)) => {
                write!(f, "SRQ-attached QP 0x{qpn:x} was flushed")
            }
            (t @ AsyncEventType::Other(raw), _) => write!(f, "{t} ({raw})"),
            (t, EventElement::Cq(cookie)) => write!(f, "{t} on CQ 0x{cookie:x}"),
            (t, EventElement::Qp(qpn)) => write!(f, "{t} on QPN 0x{qpn:x}"),
            (t, EventElement::Srq(cookie)) => write!(f, "{t} on SRQ 0x{cookie:x}"),
            (t, EventElement::Port(port)) => write!(f, "{t} on port {port}"),
            (t, EventElement::None) => write!(f, "{t} ({})", t.as_raw()),
        }
    }
}

/// Registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncEventKey {
    pub event_type: AsyncEventType,
    pub resource_id: u32,
}

impl AsyncEventKey {
    pub fn new(event_type: AsyncEventType, resource_id: u32) -> Self {
        Self {
            event_type,
            resource_id,
        }
    }
}

impl fmt::Display for AsyncEventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/0x{:x}", self.event_type, self.resource_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackState {
    /// Nothing scheduled.
    Unset,
    /// Scheduled and not yet delivered.
    Scheduled { ticket: u64, id: CallbackId },
    /// Cancelled by `unregister`; a stale delivery must be dropped.
    Cancelled,
}

/// Caller-owned waiter: a callback plus the queue it is delivered on.
pub struct WaitContext {
    callback: Box<dyn Fn() + Send + Sync>,
    queue: Arc<dyn CallbackQueue>,
    state: Mutex<CallbackState>,
    next_ticket: AtomicU64,
}

impl WaitContext {
    pub fn new<F>(queue: Arc<dyn CallbackQueue>, callback: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            callback: Box::new(callback),
            queue,
            state: Mutex::new(CallbackState::Unset),
            next_ticket: AtomicU64::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, CallbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while a delivery is scheduled but has not started.
    pub fn is_scheduled(&self) -> bool {
        matches!(*self.state(), CallbackState::Scheduled { .. })
    }

    fn reset(&self) {
        *self.state() = CallbackState::Unset;
    }

    fn schedule(self: &Arc<Self>) {
        let mut state = self.state();
        debug_assert!(
            !matches!(*state, CallbackState::Scheduled { .. }),
            "wait context already has a scheduled callback"
        );
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::clone(self);
        // The state lock is held across `schedule`, so a concurrent progress
        // thread cannot observe the callback before its ticket is recorded.
        let id = self.queue.schedule(Box::new(move || ctx.deliver(ticket)));
        *state = CallbackState::Scheduled { ticket, id };
    }

    fn deliver(&self, ticket: u64) {
        {
            let mut state = self.state();
            match *state {
                CallbackState::Scheduled { ticket: t, .. } if t == ticket => {
                    *state = CallbackState::Unset;
                }
                _ => return,
            }
        }
        (self.callback)();
    }

    fn cancel(&self) {
        let mut state = self.state();
        if let CallbackState::Scheduled { id, .. } = *state {
            self.queue.cancel(id);
        }
        *state = CallbackState::Cancelled;
    }
}

impl fmt::Debug for WaitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitContext")
            .field("state", &*self.state())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct AsyncEventEntry {
    fired: bool,
    waiter: Option<Arc<WaitContext>>,
}

impl AsyncEventEntry {
    fn in_progress(&self) -> bool {
        self.waiter.as_ref().is_some_and(|w| w.is_scheduled())
    }

    fn fire(&mut self) {
        self.fired = true;
        if let Some(waiter) = &self.waiter
            && !waiter.is_scheduled()
        {
            waiter.schedule();
        }
    }
}

/// Per-device registry of watched async events.
#[derive(Debug, Default)]
pub struct AsyncEventRegistry {
    entries: Mutex<HashMap<AsyncEventKey, AsyncEventEntry>>,
    failed: AtomicBool,
}

impl AsyncEventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<AsyncEventKey, AsyncEventEntry>> {
        // Entries are only mutated by infallible code under the lock.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `key`. The key must not already be registered.
    pub fn register(&self, key: AsyncEventKey) -> Result<()> {
        let mut entries = self.entries();
        entries
            .try_reserve(1)
            .map_err(|_| IbError::NoMemory("async event registry"))?;
        let prev = entries.insert(key, AsyncEventEntry::default());
        debug_assert!(prev.is_none(), "async event {key} registered twice");
        Ok(())
    }

    /// Attach `ctx` as the waiter for `key`.
    ///
    /// Fails with `Busy` if the current waiter still has an undelivered
    /// callback. If the event already fired the callback is scheduled
    /// immediately.
    pub fn wait(&self, key: AsyncEventKey, ctx: &Arc<WaitContext>) -> Result<()> {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&key) else {
            debug_assert!(false, "wait on unregistered async event {key}");
            return Err(IbError::invalid_param(format!(
                "async event {key} is not registered"
            )));
        };
        if entry.in_progress() {
            return Err(IbError::Busy(key.to_string()));
        }
        ctx.reset();
        entry.waiter = Some(Arc::clone(ctx));
        if entry.fired {
            ctx.schedule();
        }
        Ok(())
    }

    /// Stop tracking `key`, cancelling any undelivered callback first.
    pub fn unregister(&self, key: AsyncEventKey) {
        let mut entries = self.entries();
        match entries.remove(&key) {
            Some(entry) => {
                if let Some(waiter) = entry.waiter {
                    waiter.cancel();
                }
            }
            None => {
                debug_assert!(false, "unregister of unknown async event {key}");
                tracing::warn!(event = %key, "unregister of unknown async event");
            }
        }
    }

    /// Mark `key` as fired and schedule its waiter. Unknown keys are ignored.
    pub fn dispatch(&self, key: AsyncEventKey) {
        if let Some(entry) = self.entries().get_mut(&key) {
            entry.fire();
        }
    }

    /// Set the sticky failure flag and fire every registered key.
    pub fn dispatch_fatal(&self) {
        let mut entries = self.entries();
        self.failed.store(true, Ordering::Release);
        for entry in entries.values_mut() {
            entry.fire();
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn contains(&self, key: &AsyncEventKey) -> bool {
        self.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
