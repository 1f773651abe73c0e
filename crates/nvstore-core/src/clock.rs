//! Wall clock kept in retained memory
//!
//! Devices without a battery-backed RTC persist the last known time and its
//! sync state under a reserved retained id, so the clock survives deep sleep
//! and soft resets.

use std::fmt;

use log::debug;

use crate::backend::RetainedMemory;
use crate::retained::RetainedStore;

/// Retained id reserved for the clock record
pub const CLOCK_ID: u8 = 0x01;

const RECORD_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncStatus {
    No = 0,
    Yes = 1,
    Unknown = 2,
    NtpUpdate = 3,
}

impl SyncStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SyncStatus::No,
            1 => SyncStatus::Yes,
            3 => SyncStatus::NtpUpdate,
            _ => SyncStatus::Unknown,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStatus::Yes => "In sync",
            SyncStatus::No => "Out of sync",
            SyncStatus::NtpUpdate => "NTP update in progress",
            SyncStatus::Unknown => "Unknown",
        })
    }
}

/// Persisted clock record: seconds since the epoch and sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcTime {
    pub time: u32,
    pub status: SyncStatus,
}

impl Default for RtcTime {
    fn default() -> Self {
        Self { time: 0, status: SyncStatus::Unknown }
    }
}

impl RtcTime {
    fn to_bytes(self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.time.to_le_bytes());
        buf[4] = self.status as u8;
        buf
    }

    fn from_bytes(buf: &[u8; RECORD_SIZE]) -> Self {
        Self {
            time: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            status: SyncStatus::from_u8(buf[4]),
        }
    }
}

/// Clock view over a retained store
pub struct RetainedClock<'a, M: RetainedMemory> {
    store: &'a RetainedStore<M>,
}

impl<'a, M: RetainedMemory> RetainedClock<'a, M> {
    pub fn new(store: &'a RetainedStore<M>) -> Self {
        Self { store }
    }

    /// Stored record, or the default when missing or malformed
    pub fn read_time(&self) -> RtcTime {
        let mut buf = [0u8; RECORD_SIZE];
        if self.store.read(CLOCK_ID, &mut buf) == RECORD_SIZE {
            RtcTime::from_bytes(&buf)
        } else {
            debug!("no valid clock record");
            RtcTime::default()
        }
    }

    pub fn set_time(&self, time: u32, status: SyncStatus) -> bool {
        self.write(RtcTime { time, status })
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.read_time().status
    }

    /// Update the sync state; the region is not rewritten when unchanged.
    pub fn set_sync_status(&self, status: SyncStatus) -> bool {
        let mut rtc = self.read_time();
        if rtc.status == status {
            return true;
        }
        rtc.status = status;
        self.write(rtc)
    }

    /// Advance the stored time by whole seconds of `millis`, e.g. after deep sleep.
    pub fn update_time_offset(&self, millis: u32) -> bool {
        let secs = millis / 1000;
        if secs == 0 {
            return true;
        }
        let mut rtc = self.read_time();
        rtc.time = rtc.time.wrapping_add(secs);
        self.write(rtc)
    }

    /// Persist `now` keeping the current sync state
    pub fn store_time(&self, now: u32) -> bool {
        let mut rtc = self.read_time();
        rtc.time = now;
        self.write(rtc)
    }

    pub fn clear_time(&self) -> bool {
        self.store.remove(CLOCK_ID)
    }

    fn write(&self, rtc: RtcTime) -> bool {
        debug!("write time={} status={}", rtc.time, rtc.status);
        self.store.write(CLOCK_ID, &rtc.to_bytes())
    }
}
