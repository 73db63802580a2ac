use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::{error, warn};

use super::error::Error;
use super::{Timespec, MINUS_10PPM, PLUS_10PPM, TS_CPS};

/// Rolling correspondence between the concentrator counter, UTC and native
/// GPS time, plus the measured crystal error of the concentrator clock.
///
/// The counter wraps every 2^32 microseconds (~71.6 minutes); all counter
/// arithmetic is modular, so conversions are only meaningful for counter
/// values reasonably close to the reference.
#[derive(Debug, Clone, Copy)]
pub struct TimeReference {
    pub systime: i64,  /* system time when time reference was last updated, 0 = uninitialized */
    pub count_us: u32, /* internal concentrator counter at that time */
    pub utc: Timespec, /* UTC time matching the counter value */
    pub gps: Timespec, /* GPS time matching the counter value (since 06.Jan.1980) */
    pub xtal_err: f64, /* concentrator rate vs GPS-disciplined rate, 1.0 is ideal */
    aber_min1: bool,   /* was the sync attempt N-1 aberrant ? */
    aber_min2: bool,   /* was the sync attempt N-2 aberrant ? */
}

impl Default for TimeReference {
    fn default() -> Self {
        Self {
            systime: 0,
            count_us: 0,
            utc: Timespec::default(),
            gps: Timespec::default(),
            xtal_err: 1.0,
            aber_min1: false,
            aber_min2: false,
        }
    }
}

impl TimeReference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a new (counter, UTC, GPS) sample into the reference.
    ///
    /// A sample whose implied crystal slope lies outside +/-10 ppm is
    /// aberrant and rejected, unless the two previous attempts were aberrant
    /// too: three disagreements in a row mean the anchor itself is wrong, so
    /// the reference is re-seated while a plausible `xtal_err` is kept.
    pub fn sync(&mut self, count_us: u32, utc: Timespec, gps_time: Timespec) -> Result<()> {
        /* unsigned subtraction on purpose: small deltas stay correct through
           the counter wrap */
        let cnt_diff = count_us.wrapping_sub(self.count_us) as f64 / TS_CPS;
        let utc_diff = utc.diff_secs(&self.utc);

        /* detect aberrant points by measuring if slope limits are exceeded */
        let mut slope = 0.0;
        let aber_n0 = if utc_diff != 0.0 {
            slope = cnt_diff / utc_diff;
            if self.systime == 0 {
                /* void reference: any finite slope seeds the calibration */
                false
            } else if slope > PLUS_10PPM || slope < MINUS_10PPM {
                warn!("Warning: correction range exceeded");
                true
            } else {
                false
            }
        } else {
            warn!("Warning: aberrant UTC value for synchronization");
            true
        };

        let result = if !aber_n0 {
            /* value not aberrant -> sync with the computed slope */
            self.commit(count_us, utc, gps_time);
            self.xtal_err = slope;
            Ok(())
        } else if self.aber_min1 && self.aber_min2 {
            /* 3 successive aberrant values -> sync reset (keep xtal_err) */
            self.commit(count_us, utc, gps_time);
            /* reset xtal_err only if the present value is out of range */
            if self.xtal_err > PLUS_10PPM || self.xtal_err < MINUS_10PPM {
                self.xtal_err = 1.0;
            }
            warn!("Warning: 3 successive aberrant sync attempts, sync reset");
            Ok(())
        } else {
            /* only 1 or 2 successive aberrant values -> ignore */
            Err(Error::LGW_GPS_ERROR.into())
        };

        self.aber_min2 = self.aber_min1;
        self.aber_min1 = aber_n0;

        result
    }

    fn commit(&mut self, count_us: u32, utc: Timespec, gps_time: Timespec) {
        self.systime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |t| t.as_secs() as i64);
        self.count_us = count_us;
        self.utc = utc;
        self.gps = gps_time;
    }

    fn check_calibrated(&self, direction: &str) -> Result<()> {
        if self.systime == 0 || self.xtal_err > PLUS_10PPM || self.xtal_err < MINUS_10PPM {
            error!("ERROR: INVALID REFERENCE FOR {} CONVERSION", direction);
            return Err(Error::LGW_GPS_ERROR.into());
        }
        Ok(())
    }

    /// Convert a concentrator counter value to UTC.
    pub fn cnt2utc(&self, count_us: u32) -> Result<Timespec> {
        self.check_calibrated("CNT -> UTC")?;

        /* delta in seconds between reference count_us and target count_us */
        let delta_sec = count_us.wrapping_sub(self.count_us) as f64 / (TS_CPS * self.xtal_err);

        Ok(add_delta(self.utc, delta_sec))
    }

    /// Convert UTC to a concentrator counter value.
    pub fn utc2cnt(&self, utc: Timespec) -> Result<u32> {
        self.check_calibrated("UTC -> CNT")?;

        /* delta in seconds between reference utc and target utc */
        let delta_sec = utc.diff_secs(&self.utc);

        /* convert to internal counter ticks, modulo 2^32 */
        Ok(self
            .count_us
            .wrapping_add((delta_sec * TS_CPS * self.xtal_err).round() as i64 as u32))
    }

    /// Convert a concentrator counter value to GPS time.
    pub fn cnt2gps(&self, count_us: u32) -> Result<Timespec> {
        self.check_calibrated("CNT -> GPS")?;

        let delta_sec = count_us.wrapping_sub(self.count_us) as f64 / (TS_CPS * self.xtal_err);

        Ok(add_delta(self.gps, delta_sec))
    }

    /// Convert GPS time to a concentrator counter value.
    pub fn gps2cnt(&self, gps_time: Timespec) -> Result<u32> {
        self.check_calibrated("GPS -> CNT")?;

        let delta_sec = gps_time.diff_secs(&self.gps);

        Ok(self
            .count_us
            .wrapping_add((delta_sec * TS_CPS * self.xtal_err).round() as i64 as u32))
    }
}

/// Add a fractional number of seconds to a timespec, carrying into the
/// seconds field when the nanosecond part overflows.
fn add_delta(base: Timespec, delta_sec: f64) -> Timespec {
    let intpart = delta_sec.trunc() as i64;
    let tmp = base.tv_nsec + (delta_sec.fract() * 1E9) as i64;
    if tmp < 1_000_000_000 {
        Timespec {
            tv_sec: base.tv_sec + intpart,
            tv_nsec: tmp,
        }
    } else {
        /* must carry one second */
        Timespec {
            tv_sec: base.tv_sec + intpart + 1,
            tv_nsec: tmp - 1_000_000_000,
        }
    }
}
