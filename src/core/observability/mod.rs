//! Process-wide handshake counters.
//!
//! Only counts and coarse size classes are kept. Addresses, ports, sequence
//! numbers, timings and key material never enter this module; `build.rs`
//! rejects the tokens that would bring them in.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservabilityLevel {
    /// Nothing is recorded.
    OBS_NONE,
    /// Counters only; size histograms read back as zero.
    OBS_SAFE,
    /// Counters and payload size histograms.
    OBS_DEV,
}

#[cfg(feature = "obs_none")]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_NONE;
#[cfg(all(feature = "obs_dev", not(feature = "obs_none")))]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_DEV;
#[cfg(not(any(feature = "obs_none", feature = "obs_dev")))]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_SAFE;

const fn recording() -> bool {
    !matches!(OBS_LEVEL, ObservabilityLevel::OBS_NONE)
}

const fn histograms() -> bool {
    matches!(OBS_LEVEL, ObservabilityLevel::OBS_DEV)
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorClass {
    TRANSPORT_IO = 0,
    PROTOCOL_VIOLATION = 1,
    CERTIFICATE_REJECTED = 2,
    CRYPTO_FAILURE = 3,
}

pub const ERROR_CLASSES: usize = 4;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthState {
    OK = 0,
    DEGRADED = 1,
    FAULTED = 2,
}

/// Payload sizes bucketed by floor(log2(len)), capped at the last bucket.
pub const SIZE_CLASSES: usize = 21;

struct SizeHistogram([AtomicU64; SIZE_CLASSES]);

impl SizeHistogram {
    const fn new() -> Self {
        Self([const { AtomicU64::new(0) }; SIZE_CLASSES])
    }

    fn record(&self, len: usize) {
        if len > 0 && histograms() {
            self.0[size_class(len)].fetch_add(1, Ordering::Relaxed);
        }
    }

    fn read(&self) -> [u64; SIZE_CLASSES] {
        self.0.each_ref().map(|bucket| bucket.load(Ordering::Relaxed))
    }
}

const fn size_class(len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let class = (usize::BITS - 1 - len.leading_zeros()) as usize;
    if class < SIZE_CLASSES {
        class
    } else {
        SIZE_CLASSES - 1
    }
}

struct Counters {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    segments_sent: AtomicU64,
    segments_received: AtomicU64,
    handshakes_completed: AtomicU64,
    sent_sizes: SizeHistogram,
    received_sizes: SizeHistogram,
    errors: [AtomicU64; ERROR_CLASSES],
    health: AtomicU8,
}

static COUNTERS: Counters = Counters {
    connections_opened: AtomicU64::new(0),
    connections_closed: AtomicU64::new(0),
    segments_sent: AtomicU64::new(0),
    segments_received: AtomicU64::new(0),
    handshakes_completed: AtomicU64::new(0),
    sent_sizes: SizeHistogram::new(),
    received_sizes: SizeHistogram::new(),
    errors: [const { AtomicU64::new(0) }; ERROR_CLASSES],
    health: AtomicU8::new(HealthState::OK as u8),
};

#[inline]
fn bump(counter: &AtomicU64) {
    if recording() {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Transport trouble degrades health; anything else means the peer or its
/// certificate cannot be used.
pub fn record_error(class: ErrorClass) {
    if !recording() {
        return;
    }
    bump(&COUNTERS.errors[class as usize]);
    set_health(match class {
        ErrorClass::TRANSPORT_IO => HealthState::DEGRADED,
        _ => HealthState::FAULTED,
    });
}

pub fn set_health(state: HealthState) {
    COUNTERS.health.store(state as u8, Ordering::Relaxed);
}

pub fn get_health() -> HealthState {
    match COUNTERS.health.load(Ordering::Relaxed) {
        0 => HealthState::OK,
        1 => HealthState::DEGRADED,
        _ => HealthState::FAULTED,
    }
}

#[inline]
pub fn record_connection_opened() {
    bump(&COUNTERS.connections_opened);
}

#[inline]
pub fn record_connection_closed() {
    bump(&COUNTERS.connections_closed);
}

#[inline]
pub fn record_segment_sent(payload_len: usize) {
    bump(&COUNTERS.segments_sent);
    COUNTERS.sent_sizes.record(payload_len);
}

#[inline]
pub fn record_segment_received(payload_len: usize) {
    bump(&COUNTERS.segments_received);
    COUNTERS.received_sizes.record(payload_len);
}

#[inline]
pub fn record_handshake_completed() {
    bump(&COUNTERS.handshakes_completed);
}

#[derive(Debug, Clone)]
pub struct ObservabilitySnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub segments_sent: u64,
    pub segments_received: u64,
    pub handshakes_completed: u64,
    pub sent_sizes: [u64; SIZE_CLASSES],
    pub received_sizes: [u64; SIZE_CLASSES],
    pub errors_by_class: [u64; ERROR_CLASSES],
    pub health: HealthState,
}

impl ObservabilitySnapshot {
    pub fn total_errors(&self) -> u64 {
        self.errors_by_class.iter().sum()
    }
}

pub fn snapshot() -> ObservabilitySnapshot {
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
    ObservabilitySnapshot {
        connections_opened: load(&COUNTERS.connections_opened),
        connections_closed: load(&COUNTERS.connections_closed),
        segments_sent: load(&COUNTERS.segments_sent),
        segments_received: load(&COUNTERS.segments_received),
        handshakes_completed: load(&COUNTERS.handshakes_completed),
        sent_sizes: COUNTERS.sent_sizes.read(),
        received_sizes: COUNTERS.received_sizes.read(),
        errors_by_class: COUNTERS.errors.each_ref().map(load),
        health: get_health(),
    }
}
