//! Process-wide media clock.
//!
//! All presentation timestamps (`dts`) and send deadlines are expressed in
//! microseconds on a monotonic clock whose origin is the first call into
//! this module. Producers must stamp their blocks with [`mdate`] so that the
//! sender can schedule them.

use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Microseconds, the unit of every timestamp in the crate.
pub type Mtime = i64;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

static ORIGIN: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Current monotonic time in microseconds.
pub fn mdate() -> Mtime {
    ORIGIN.elapsed().as_micros() as Mtime
}

/// Block the calling thread until [`mdate`] reaches `deadline`.
pub fn wait_until(deadline: Mtime) {
    let now = mdate();
    if deadline > now {
        thread::sleep(Duration::from_micros((deadline - now) as u64));
    }
}

/// Current wall-clock time as a 64-bit NTP timestamp (32.32 fixed point).
pub fn ntp_now() -> u64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    ntp_from_unix(since_unix)
}

/// Convert a duration since the Unix epoch to NTP 32.32 fixed point.
pub fn ntp_from_unix(since_unix: Duration) -> u64 {
    let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
    let frac = (u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000;
    (secs << 32) | frac
}
