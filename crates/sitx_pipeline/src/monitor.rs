//! Outstanding-buffer accounting and rejection hooks.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Why a buffer flush was held back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionEvent {
    /// Destination of the buffer.
    pub partition: String,
    /// Flushes of the buffer in flight.
    pub in_flight: usize,
    /// Configured in-flight limit.
    pub limit: usize,
    /// Rows waiting to be flushed.
    pub pending_entries: usize,
}

type Listener = Arc<dyn Fn(&RejectionEvent) + Send + Sync>;

/// Shared by every buffer of a coordinator.
#[derive(Default)]
pub struct Monitor {
    outstanding: AtomicUsize,
    opened: AtomicU64,
    closed: AtomicU64,
    rejections: AtomicU64,
    listeners: RwLock<Vec<Listener>>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("snapshot", &self.snapshot())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl Monitor {
    /// Creates a monitor with no open buffers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook called on every rejection.
    pub fn add_rejection_listener<F>(&self, listener: F)
    where
        F: Fn(&RejectionEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Buffers created and not yet closed.
    #[must_use]
    pub fn outstanding_buffers(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn buffer_opened(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn buffer_closed(&self) {
        let previous = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous.is_err() {
            warn!("buffer close with no outstanding buffers");
            return;
        }
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reject(&self, event: &RejectionEvent) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        warn!(
            partition = %event.partition,
            in_flight = event.in_flight,
            limit = event.limit,
            pending = event.pending_entries,
            "flush limit reached"
        );
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(event);
        }
    }

    /// Takes a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            outstanding_buffers: self.outstanding_buffers(),
            opened_buffers: self.opened.load(Ordering::Relaxed),
            closed_buffers: self.closed.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a [`Monitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    /// Buffers created and not yet closed.
    pub outstanding_buffers: usize,
    /// Buffers ever created.
    pub opened_buffers: u64,
    /// Buffers ever closed.
    pub closed_buffers: u64,
    /// Flushes held back at the in-flight limit.
    pub rejections: u64,
}
