use crate::detector::DetectionResult;
use serde::Serialize;
use std::time::{Duration, SystemTime};

/// Machine-readable bay state. Human-facing text is a projection via
/// [`BayStatus::as_str`], never a second source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BayStatus {
    Available,
    InUse,
    OutOfService,
    ConnectionError,
}

impl BayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BayStatus::Available => "available",
            BayStatus::InUse => "inUse",
            BayStatus::OutOfService => "outOfService",
            BayStatus::ConnectionError => "connectionError",
        }
    }
}

/// Complete, internally consistent projection of one bay, published to
/// the registry as a whole value. This is the exact shape the status API
/// and admin surfaces consume.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaySnapshot {
    pub bay_id: u32,
    pub status: BayStatus,
    pub last_updated: SystemTime,
    pub last_confidence: f32,
    pub is_connected: bool,
    pub consecutive_failures: u32,
}

impl BaySnapshot {
    /// State of a bay that has not produced a frame yet.
    pub fn initial(bay_id: u32) -> Self {
        Self {
            bay_id,
            status: BayStatus::ConnectionError,
            last_updated: SystemTime::now(),
            last_confidence: 0.0,
            is_connected: false,
            consecutive_failures: 0,
        }
    }
}

/// Debounced per-bay state machine. Frame-level detector verdicts are
/// noisy; a transition between Available and InUse requires `debounce_k`
/// net agreeing samples on the new value. A single disagreeing sample
/// decrements the agreement counter instead of resetting it, so isolated
/// noise is tolerated while a sustained change still lands within K plus
/// a few frames.
#[derive(Debug)]
pub struct StatusMachine {
    debounce_k: u32,
    visible: BayStatus,
    shadow_occupied: bool,
    agreement: u32,
    out_of_service: bool,
    connected: bool,
    last_updated: SystemTime,
    last_confidence: f32,
}

impl StatusMachine {
    pub fn new(debounce_k: u32) -> Self {
        Self {
            debounce_k,
            visible: BayStatus::ConnectionError,
            shadow_occupied: false,
            agreement: 0,
            out_of_service: false,
            connected: false,
            last_updated: SystemTime::now(),
            last_confidence: 0.0,
        }
    }

    pub fn status(&self) -> BayStatus {
        self.visible
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_out_of_service(&self) -> bool {
        self.out_of_service
    }

    // Published timestamps must strictly increase even when the clock
    // resolution collapses consecutive transitions.
    fn touch(&mut self) {
        let now = SystemTime::now();
        self.last_updated = if now > self.last_updated {
            now
        } else {
            self.last_updated + Duration::from_micros(1)
        };
    }

    fn occupancy_status(&self) -> BayStatus {
        if self.shadow_occupied {
            BayStatus::InUse
        } else {
            BayStatus::Available
        }
    }

    fn refresh_visible(&mut self) {
        let next = if !self.connected {
            BayStatus::ConnectionError
        } else if self.out_of_service {
            BayStatus::OutOfService
        } else {
            self.occupancy_status()
        };
        if next != self.visible {
            self.visible = next;
            self.touch();
        }
    }

    /// Feed one detector verdict. Returns the new visible status when the
    /// sample caused a transition.
    pub fn sample(&mut self, result: &DetectionResult) -> Option<BayStatus> {
        debug_assert!(self.connected, "sample fed while disconnected");
        self.last_confidence = result.confidence;

        if result.occupied == self.shadow_occupied {
            self.agreement = self.agreement.saturating_sub(1);
            return None;
        }

        self.agreement += 1;
        if self.agreement < self.debounce_k {
            return None;
        }

        self.shadow_occupied = result.occupied;
        self.agreement = 0;
        let before = self.visible;
        // The shadow state keeps accumulating under an OutOfService
        // override; only the visible status is pinned.
        self.refresh_visible();
        (self.visible != before).then_some(self.visible)
    }

    /// Stream fault: enters ConnectionError immediately, overriding any
    /// debounce in progress. Occupancy progress is discarded; the model
    /// relearns after reconnection.
    pub fn connection_lost(&mut self) {
        self.connected = false;
        self.shadow_occupied = false;
        self.agreement = 0;
        self.refresh_visible();
    }

    /// First successful frame after a fault. Occupancy defaults to
    /// Available until the background model is warm again.
    pub fn connection_restored(&mut self) {
        self.connected = true;
        self.refresh_visible();
    }

    /// Operator override. While set, detector-driven transitions are
    /// suppressed from the visible status; clearing exposes whatever
    /// state accumulated underneath.
    pub fn set_out_of_service(&mut self, out_of_service: bool) {
        self.out_of_service = out_of_service;
        self.refresh_visible();
    }

    /// One atomic unit for the registry: status, timestamps and
    /// confidence published together.
    pub fn snapshot(&self, bay_id: u32, consecutive_failures: u32) -> BaySnapshot {
        BaySnapshot {
            bay_id,
            status: self.visible,
            last_updated: self.last_updated,
            last_confidence: self.last_confidence,
            is_connected: self.connected,
            consecutive_failures,
        }
    }
}
