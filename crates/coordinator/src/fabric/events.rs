//! Wire events for the bidirectional client channel.
//!
//! Frames are JSON objects tagged with an `event` field, e.g.
//! `{"event":"report_threat","client_id":"...","ioc":{...}}`.

use serde::{Deserialize, Serialize};

use threatnet_core::{Ioc, IocId, IocPayload, IocStatus};

/// Events received from clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Session registration; must precede other events on a connection.
    Register {
        /// Self-asserted client identifier.
        client_id: String,
        /// Reported hostname.
        #[serde(default)]
        hostname: String,
        /// Reported agent version.
        #[serde(default)]
        version: String,
    },

    /// Liveness signal.
    Heartbeat {
        /// Client identifier.
        client_id: String,
        /// Client-side timestamp (unix seconds); server time when absent.
        #[serde(default)]
        at: Option<i64>,
    },

    /// One IOC submission.
    ReportThreat {
        /// Client identifier.
        client_id: String,
        /// The submitted IOC.
        ioc: IocPayload,
    },

    /// Pull request for verified intel since a cursor.
    SyncRequest {
        /// Client identifier.
        client_id: String,
        /// Last cursor the client holds (0 for everything).
        #[serde(default)]
        cursor: i64,
    },
}

/// Events sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// Registration confirmation.
    Registered {
        /// Echoed client identifier.
        client_id: String,
        /// The client's current trust.
        trust: f64,
    },

    /// Submission acknowledged.
    ReportAck {
        /// Fingerprint of the submitted IOC.
        ioc_id: IocId,
        /// Lifecycle state after the submission.
        status: IocStatus,
    },

    /// Submission failed; the client may retry (submissions are idempotent).
    ReportNack {
        /// Failure reason (`timeout`, `bad_request: ...`, `internal`).
        reason: String,
    },

    /// A pending IOC was promoted; fan-out to every subscriber.
    IocVerified {
        /// The verified IOC.
        ioc: Ioc,
    },

    /// A client's presence changed; fan-out on connect/disconnect.
    ClientStatus {
        /// The client whose presence changed.
        client_id: String,
        /// Whether the client is connected.
        online: bool,
        /// The client's current trust.
        trust: f64,
    },

    /// Response to a sync request or an initial snapshot.
    SyncResponse {
        /// Verified IOCs in `verified_at` order.
        iocs: Vec<Ioc>,
        /// Cursor for the next request.
        cursor: i64,
    },
}

impl OutboundEvent {
    /// Whether this event may be dropped under back-pressure.
    ///
    /// Presence updates are droppable; everything else is either unicast
    /// control flow or verified intel, which is never silently dropped.
    pub fn droppable(&self) -> bool {
        matches!(self, OutboundEvent::ClientStatus { .. })
    }
}
