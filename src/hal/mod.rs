
pub mod error;
pub mod loragw_gps_com;
pub mod loragw_gps_parse;
pub mod loragw_gps_sync;

use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use self::error::Error;
use self::loragw_gps_com::GpsComPort;

/* concentrator counter / crystal discipline parameters */
pub const TS_CPS: f64 = 1E6; /* count-per-second of the timestamp counter */
pub const PLUS_10PPM: f64 = 1.00001;
pub const MINUS_10PPM: f64 = 0.99999;

/* minimum size of a frame the caller should accumulate before parsing */
pub const LGW_GPS_MIN_MSG_SIZE: usize = 8;

/* sync bytes the caller can use to realign the serial stream */
pub const LGW_GPS_UBX_SYNC_CHAR: u8 = 0xB5;
pub const LGW_GPS_NMEA_SYNC_CHAR: u8 = 0x24; /* '$' */

/// Classification of a frame handed to the parsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum GpsMsg {
    UNKNOWN,    /* message type not identified */
    IGNORED,    /* message type identified but not parsed */
    INVALID,    /* message format invalid, checksum failed */
    INCOMPLETE, /* message incomplete, wait for more bytes */
    NMEA_RMC,
    NMEA_GGA,
    UBX_NAV_TIMEGPS,
}

/// Seconds + nanoseconds, signed so differences are meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl Timespec {
    /// Difference `self - other` in seconds.
    pub fn diff_secs(&self, other: &Timespec) -> f64 {
        (self.tv_sec - other.tv_sec) as f64 + 1E-9 * (self.tv_nsec - other.tv_nsec) as f64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64, /* latitude in degrees (North is positive) */
    pub lon: f64, /* longitude in degrees (East is positive) */
    pub alt: i16, /* altitude in meters */
}

impl std::fmt::Display for Coordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lat {:.8}, lon {:.8}, alt {}", self.lat, self.lon, self.alt)
    }
}

/// Latest values extracted from the serial stream by the parsers. Numeric
/// fields may hold stale content after a failed parse; only the validity
/// flags say whether they can be consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    pub(crate) year: i16,     /* year (2 or 4 digits) */
    pub(crate) month: i16,    /* month (1-12) */
    pub(crate) day: i16,      /* day of the month (1-31) */
    pub(crate) hour: i16,     /* hours (0-23) */
    pub(crate) minute: i16,   /* minutes (0-59) */
    pub(crate) second: i16,   /* seconds (0-60)(60 is for leap second) */
    pub(crate) fraction: f32, /* fractions of seconds (<1) */
    pub(crate) time_ok: bool,
    pub(crate) week: i16, /* GPS week number of the navigation epoch */
    pub(crate) itow: u32, /* GPS time of week in milliseconds */
    pub(crate) ftow: i32, /* fractional part of iTOW (+/-500000) in nanosec */

    pub(crate) lat_deg: i16,  /* degrees of latitude */
    pub(crate) lat_min: f64,  /* minutes of latitude */
    pub(crate) lat_hem: char, /* orientation (N-S) of latitude */
    pub(crate) lon_deg: i16,  /* degrees of longitude */
    pub(crate) lon_min: f64,  /* minutes of longitude */
    pub(crate) lon_hem: char, /* orientation (E-W) of longitude */
    pub(crate) alt: i16,      /* altitude */
    pub(crate) pos_ok: bool,

    pub(crate) mode: char,   /* N no fix, A autonomous, D differential */
    pub(crate) num_sat: i16, /* number of satellites used for fix */
}

impl Default for GpsFix {
    fn default() -> Self {
        Self {
            year: 0,
            month: 0,
            day: 0,
            hour: 0,
            minute: 0,
            second: 0,
            fraction: 0.0,
            time_ok: false,
            week: 0,
            itow: 0,
            ftow: 0,
            lat_deg: 0,
            lat_min: 0.0,
            lat_hem: '\0',
            lon_deg: 0,
            lon_min: 0.0,
            lon_hem: '\0',
            alt: 0,
            pos_ok: false,
            mode: 'N',
            num_sat: 0,
        }
    }
}

/// Subset of the fix snapshot returned by [`LgwGps::lgw_gps_get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GpsData {
    pub utc: Option<Timespec>,
    pub gps: Option<Timespec>,
    pub loc: Option<Coordinates>,
    pub err: Option<Coordinates>,
}

#[derive(Debug)]
pub struct Gps {
    pub com: Option<GpsComPort>,
    pub(crate) fix: GpsFix,
}

impl Gps {
    pub fn new() -> Self {
        Self {
            com: None,
            fix: GpsFix::default(),
        }
    }
}

impl Default for Gps {
    fn default() -> Self {
        Self::new()
    }
}

pub trait LgwGps {
    fn lgw_gps_enable(&mut self, tty_path: &str, gps_family: Option<&str>, target_brate: u32) -> Result<()>;
    fn lgw_gps_disable(&mut self) -> Result<()>;
    fn lgw_gps_get(&self, want_utc: bool, want_gps: bool, want_loc: bool, want_err: bool) -> Result<GpsData>;
}

impl LgwGps for Gps {
    fn lgw_gps_enable(&mut self, tty_path: &str, gps_family: Option<&str>, target_brate: u32) -> Result<()> {
        if self.com.is_some() {
            error!("ERROR: GPS PORT IS ALREADY OPEN");
            return Err(Error::LGW_GPS_ERROR.into());
        }

        let com = GpsComPort::open(tty_path, gps_family, target_brate)?;
        self.com = Some(com);

        /* start from a clean fix state */
        self.fix.time_ok = false;
        self.fix.pos_ok = false;
        self.fix.mode = 'N';

        Ok(())
    }

    fn lgw_gps_disable(&mut self) -> Result<()> {
        match self.com.take() {
            Some(com) => com.close(),
            None => {
                error!("ERROR: GPS PORT IS NOT OPEN");
                Err(Error::LGW_GPS_ERROR.into())
            }
        }
    }

    fn lgw_gps_get(&self, want_utc: bool, want_gps: bool, want_loc: bool, want_err: bool) -> Result<GpsData> {
        let mut data = GpsData::default();

        if want_utc {
            if !self.fix.time_ok {
                error!("ERROR: NO VALID TIME TO RETURN");
                return Err(Error::LGW_GPS_ERROR.into());
            }
            data.utc = Some(self.utc_from_fix()?);
        }
        if want_gps {
            if !self.fix.time_ok {
                error!("ERROR: NO VALID TIME TO RETURN");
                return Err(Error::LGW_GPS_ERROR.into());
            }
            /* number of seconds since GPS epoch 06.Jan.1980 */
            let tow = self.fix.itow as f64 / 1E3 + self.fix.ftow as f64 / 1E9;
            data.gps = Some(Timespec {
                tv_sec: tow.trunc() as i64 + self.fix.week as i64 * 604800, /* day*hours*minutes*seconds: 7*24*60*60 */
                tv_nsec: (tow.fract() * 1E9) as i64,
            });
        }
        if want_loc {
            if !self.fix.pos_ok {
                error!("ERROR: NO VALID POSITION TO RETURN");
                return Err(Error::LGW_GPS_ERROR.into());
            }
            data.loc = Some(Coordinates {
                lat: (self.fix.lat_deg as f64 + self.fix.lat_min / 60.0)
                    * if self.fix.lat_hem == 'N' { 1.0 } else { -1.0 },
                lon: (self.fix.lon_deg as f64 + self.fix.lon_min / 60.0)
                    * if self.fix.lon_hem == 'E' { 1.0 } else { -1.0 },
                alt: self.fix.alt,
            });
        }
        if want_err {
            warn!("Warning: localization error processing not implemented yet");
            data.err = Some(Coordinates::default());
        }

        Ok(data)
    }
}

impl Gps {
    /// Assemble epoch UTC from the broken-down NMEA date/time.
    fn utc_from_fix(&self) -> Result<Timespec> {
        let year = if self.fix.year < 100 {
            2000 + self.fix.year as i32 /* 2-digits year, 20xx */
        } else {
            self.fix.year as i32 /* 4-digits year, Gregorian calendar */
        };

        /* the calendar arithmetic rejects second 60, fold the leap second in
           as an extra elapsed second */
        let (second, leap) = if self.fix.second == 60 {
            (59, 1)
        } else {
            (self.fix.second, 0)
        };

        let date = NaiveDate::from_ymd_opt(year, self.fix.month as u32, self.fix.day as u32)
            .and_then(|d| d.and_hms_opt(self.fix.hour as u32, self.fix.minute as u32, second as u32))
            .ok_or_else(|| {
                error!("ERROR: FAILED TO CONVERT BROKEN-DOWN TIME");
                Error::LGW_GPS_ERROR
            })?;

        Ok(Timespec {
            tv_sec: date.and_utc().timestamp() + leap,
            tv_nsec: (self.fix.fraction as f64 * 1E9) as i64,
        })
    }
}
