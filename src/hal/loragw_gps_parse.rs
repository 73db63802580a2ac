use tracing::{debug, trace, warn};

use super::{Gps, GpsMsg};

/* longest sentence the NMEA parser accepts */
const NMEA_MAX_LEN: usize = 255;

pub trait LoragwGpsParseTrait {
    /// Classify a candidate UBX frame and, for NAV-TIMEGPS, extract native
    /// GPS time into the fix snapshot. Returns the message kind and the
    /// frame size declared by the header (0 while the sync bytes or the
    /// length field have not been seen).
    fn lgw_parse_ubx(&mut self, serial_buff: &[u8]) -> (GpsMsg, usize);

    /// Classify a candidate NMEA sentence; RMC updates the date/time part
    /// of the fix snapshot, GGA the position part.
    fn lgw_parse_nmea(&mut self, serial_buff: &[u8]) -> GpsMsg;
}

impl LoragwGpsParseTrait for Gps {
    fn lgw_parse_ubx(&mut self, serial_buff: &[u8]) -> (GpsMsg, usize) {
        if serial_buff.len() < 8 {
            debug!("ERROR: TOO SHORT TO BE A VALID UBX MESSAGE");
            return (GpsMsg::IGNORED, 0);
        }

        trace!("Note: parsing UBX frame> {:02X?}", serial_buff);

        /* check for UBX sync chars 0xB5 0x62 */
        if serial_buff[0] != 0xB5 || serial_buff[1] != 0x62 {
            return (GpsMsg::IGNORED, 0);
        }

        /* get payload length to compute message size */
        let payload_length = u16::from_le_bytes([serial_buff[4], serial_buff[5]]) as usize;
        let msg_size = 6 + payload_length + 2; /* header + payload + checksum */

        /* check for complete message in buffer */
        if msg_size > serial_buff.len() {
            debug!("ERROR: UBX message incomplete");
            return (GpsMsg::INCOMPLETE, msg_size);
        }

        /* 8-bit Fletcher over class, id, length and payload */
        let (ck_a, ck_b) = ubx_checksum(&serial_buff[2..6 + payload_length]);
        if ck_a != serial_buff[msg_size - 2] || ck_b != serial_buff[msg_size - 1] {
            debug!("ERROR: UBX message is corrupted, checksum failed");
            return (GpsMsg::INVALID, msg_size);
        }

        match (serial_buff[2], serial_buff[3]) {
            /* Class 0x01 (NAV) and ID 0x20 (NAV-TIMEGPS) */
            (0x01, 0x20) => {
                /* towValid and weekValid must both be set; a payload too
                   short to carry the validity byte counts as not valid */
                if payload_length >= 12 && serial_buff[17] & 0x03 == 0x03 {
                    /* parse buffer to extract GPS time, Little Endian ordering */
                    self.fix.itow = (serial_buff[6] as u32)
                        | (serial_buff[7] as u32) << 8
                        | (serial_buff[8] as u32) << 16
                        | (serial_buff[9] as u32) << 24; /* GPS time of week, in ms */
                    self.fix.ftow = ((serial_buff[10] as u32)
                        | (serial_buff[11] as u32) << 8
                        | (serial_buff[12] as u32) << 16
                        | (serial_buff[13] as u32) << 24) as i32; /* fractional part of iTOW, in ns */
                    self.fix.week = ((serial_buff[14] as u16) | (serial_buff[15] as u16) << 8) as i16;
                    self.fix.time_ok = true;
                } else {
                    self.fix.time_ok = false;
                }
                (GpsMsg::UBX_NAV_TIMEGPS, msg_size)
            }
            (0x05, 0x00) => {
                debug!("NOTE: UBX ACK-NAK received");
                (GpsMsg::IGNORED, msg_size)
            }
            (0x05, 0x01) => {
                debug!("NOTE: UBX ACK-ACK received");
                (GpsMsg::IGNORED, msg_size)
            }
            (class, id) => {
                debug!("ERROR: UBX message is not supported ({:02x} {:02x})", class, id);
                (GpsMsg::IGNORED, msg_size)
            }
        }
    }

    fn lgw_parse_nmea(&mut self, serial_buff: &[u8]) -> GpsMsg {
        if serial_buff.len() > NMEA_MAX_LEN {
            debug!("Note: input string too big for parsing");
            return GpsMsg::INVALID;
        }
        if serial_buff.len() < 8 {
            debug!("ERROR: TOO SHORT TO BE A VALID NMEA SENTENCE");
            return GpsMsg::UNKNOWN;
        }
        if !validate_nmea_checksum(serial_buff) {
            warn!("Warning: invalid NMEA sentence (bad checksum)");
            return GpsMsg::INVALID;
        }

        if match_label(serial_buff, b"$G?RMC", b'?') {
            /*
            NMEA sentence format: $xxRMC,time,status,lat,NS,long,EW,spd,cog,date,mv,mvEW,posMode*cs<CR><LF>
            Valid fix: $GPRMC,083559.34,A,4717.11437,N,00833.91522,E,0.004,77.52,091202,,,A*50
            No fix: $GPRMC,,V,,,,,,,,,,N*53
            */
            let fields: Vec<&[u8]> = serial_buff.split(|&c| c == b',').collect();
            if fields.len() != 13 && fields.len() != 14 {
                warn!("Warning: invalid RMC sentence (number of fields)");
                return GpsMsg::IGNORED;
            }

            /* parse GPS status, first character only */
            let mode = fields[12].first().copied().unwrap_or(0) as char;
            self.fix.mode = if mode == 'A' || mode == 'D' { mode } else { 'N' };

            /* parse complete time */
            match (scan_time(fields[1]), scan_date(fields[9])) {
                (Some((hour, minute, second, fraction)), Some((day, month, year))) => {
                    self.fix.hour = hour;
                    self.fix.minute = minute;
                    self.fix.second = second;
                    self.fix.fraction = fraction;
                    self.fix.day = day;
                    self.fix.month = month;
                    self.fix.year = year;
                    if self.fix.mode == 'A' || self.fix.mode == 'D' {
                        self.fix.time_ok = true;
                        debug!(
                            "Note: Valid RMC sentence, GPS locked, date: 20{:02}-{:02}-{:02}T{:02}:{:02}:{:06.3}Z",
                            year, month, day, hour, minute, fraction + second as f32
                        );
                    } else {
                        self.fix.time_ok = false;
                        debug!("Note: Valid RMC sentence, no satellite fix");
                    }
                }
                _ => {
                    /* could not get a valid hour AND date */
                    self.fix.time_ok = false;
                    debug!("Note: Valid RMC sentence, mode {}, no date", self.fix.mode);
                }
            }
            GpsMsg::NMEA_RMC
        } else if match_label(serial_buff, b"$G?GGA", b'?') {
            /*
            NMEA sentence format: $xxGGA,time,lat,NS,long,EW,quality,numSV,HDOP,alt,M,sep,M,diffAge,diffStation*cs<CR><LF>
            Valid fix: $GPGGA,092725.00,4717.11399,N,00833.91590,E,1,08,1.01,499.6,M,48.0,M,,*5B
            */
            let fields: Vec<&[u8]> = serial_buff.split(|&c| c == b',').collect();
            if fields.len() != 15 {
                warn!("Warning: invalid GGA sentence (number of fields)");
                return GpsMsg::IGNORED;
            }

            /* parse number of satellites used for fix */
            if let Some(num_sat) = scan_i16(fields[7]) {
                self.fix.num_sat = num_sat;
            }

            /* parse 3D coordinates */
            let lat = scan_num(fields[2], 2)
                .and_then(|(deg, rest)| scan_f64(rest, 10).map(|(min, _)| (deg, min)));
            let lat_hem = fields[3].first().copied().unwrap_or(0) as char;
            let lon = scan_num(fields[4], 3)
                .and_then(|(deg, rest)| scan_f64(rest, 10).map(|(min, _)| (deg, min)));
            let lon_hem = fields[5].first().copied().unwrap_or(0) as char;
            let alt = scan_i16(fields[9]);

            match (lat, lon, alt) {
                (Some((lat_deg, lat_min)), Some((lon_deg, lon_min)), Some(alt))
                    if (lat_hem == 'N' || lat_hem == 'S') && (lon_hem == 'E' || lon_hem == 'W') =>
                {
                    self.fix.lat_deg = lat_deg;
                    self.fix.lat_min = lat_min;
                    self.fix.lat_hem = lat_hem;
                    self.fix.lon_deg = lon_deg;
                    self.fix.lon_min = lon_min;
                    self.fix.lon_hem = lon_hem;
                    self.fix.alt = alt;
                    self.fix.pos_ok = true;
                    debug!(
                        "Note: Valid GGA sentence, {} sat, lat {:02}deg {:06.3}min {}, lon {:03}deg {:06.3}min {}, alt {}",
                        self.fix.num_sat, lat_deg, lat_min, lat_hem, lon_deg, lon_min, lon_hem, alt
                    );
                }
                _ => {
                    /* could not get a valid latitude, longitude AND altitude */
                    self.fix.pos_ok = false;
                    debug!("Note: Valid GGA sentence, {} sat, no coordinates", self.fix.num_sat);
                }
            }
            GpsMsg::NMEA_GGA
        } else {
            debug!("Note: ignored NMEA sentence"); /* quite verbose */
            GpsMsg::IGNORED
        }
    }
}

/// 8-bit Fletcher checksum as used by the UBX protocol.
pub(crate) fn ubx_checksum(data: &[u8]) -> (u8, u8) {
    let mut ck_a: u8 = 0;
    let mut ck_b: u8 = 0;
    for &b in data {
        ck_a = ck_a.wrapping_add(b);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    (ck_a, ck_b)
}

fn nibble_to_hexchar(a: u8) -> u8 {
    if a < 10 {
        b'0' + a
    } else {
        b'A' + (a - 10)
    }
}

/// XOR the sentence between '$' and '*' and compare against the two
/// hexadecimal characters that follow the '*'.
fn validate_nmea_checksum(serial_buff: &[u8]) -> bool {
    let mut check_num: u8 = 0;

    /* skip the first '$' if necessary */
    let mut i = usize::from(serial_buff[0] == b'$');

    /* xor until '*' is reached */
    loop {
        if i >= serial_buff.len() {
            debug!("ERROR: IMPOSSIBLE TO PARSE NMEA SENTENCE");
            return false;
        }
        if serial_buff[i] == b'*' {
            break;
        }
        check_num ^= serial_buff[i];
        i += 1;
    }

    /* check if there are enough chars in the buffer to read the checksum */
    if i + 2 >= serial_buff.len() {
        debug!("ERROR: IMPOSSIBLE TO READ NMEA SENTENCE CHECKSUM");
        return false;
    }

    serial_buff[i + 1] == nibble_to_hexchar(check_num >> 4)
        && serial_buff[i + 2] == nibble_to_hexchar(check_num & 0x0F)
}

/// True if `label` (which may contain wildcard characters) matches the
/// beginning of `s`.
fn match_label(s: &[u8], label: &[u8], wildcard: u8) -> bool {
    if s.len() < label.len() {
        return false;
    }
    label.iter().zip(s.iter()).all(|(&l, &c)| l == wildcard || l == c)
}

/// Scan up to `width` leading decimal digits (at least one), returning the
/// value and the unconsumed remainder.
fn scan_num(s: &[u8], width: usize) -> Option<(i16, &[u8])> {
    let n = s.iter().take(width).take_while(|c| c.is_ascii_digit()).count();
    if n == 0 {
        return None;
    }
    let mut v: i16 = 0;
    for &c in &s[..n] {
        v = v * 10 + (c - b'0') as i16;
    }
    Some((v, &s[n..]))
}

/// Scan a signed integer prefix, stopping at the first non-digit.
fn scan_i16(s: &[u8]) -> Option<i16> {
    let (neg, digits) = match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let n = digits.iter().take(6).take_while(|c| c.is_ascii_digit()).count();
    if n == 0 {
        return None;
    }
    let mut v: i32 = 0;
    for &c in &digits[..n] {
        v = v * 10 + (c - b'0') as i32;
    }
    if neg {
        v = -v;
    }
    Some(v as i16)
}

/// Scan up to `width` characters of a decimal number prefix as f64.
fn scan_f64(s: &[u8], width: usize) -> Option<(f64, &[u8])> {
    let n = s
        .iter()
        .take(width)
        .take_while(|&&c| c.is_ascii_digit() || c == b'.')
        .count();
    let v = std::str::from_utf8(&s[..n]).ok()?.parse::<f64>().ok()?;
    Some((v, &s[n..]))
}

/// Scan up to `width` characters of a decimal number prefix as f32.
fn scan_f32(s: &[u8], width: usize) -> Option<(f32, &[u8])> {
    let n = s
        .iter()
        .take(width)
        .take_while(|&&c| c.is_ascii_digit() || c == b'.')
        .count();
    let v = std::str::from_utf8(&s[..n]).ok()?.parse::<f32>().ok()?;
    Some((v, &s[n..]))
}

/// `HHMMSS` plus up to 4 characters of fractional seconds.
fn scan_time(s: &[u8]) -> Option<(i16, i16, i16, f32)> {
    let (hour, s) = scan_num(s, 2)?;
    let (minute, s) = scan_num(s, 2)?;
    let (second, s) = scan_num(s, 2)?;
    let (fraction, _) = scan_f32(s, 4)?;
    Some((hour, minute, second, fraction))
}

/// `DDMMYY`.
fn scan_date(s: &[u8]) -> Option<(i16, i16, i16)> {
    let (day, s) = scan_num(s, 2)?;
    let (month, s) = scan_num(s, 2)?;
    let (year, _) = scan_num(s, 2)?;
    Some((day, month, year))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::GpsFix;

    const GGA_VALID: &[u8] = b"$GPGGA,092725.00,4717.11399,N,00833.91590,E,1,08,1.01,499.6,M,48.0,M,,*5B";
    const RMC_FIXED: &[u8] = b"$GPRMC,083559.34,A,4717.11437,N,00833.91522,E,0.004,77.52,091202,,,A*50";
    const RMC_NO_FIX: &[u8] = b"$GPRMC,,V,,,,,,,,,,N*53";

    /* NAV-TIMEGPS, iTOW = 0x0ABCDE00 ms, fTOW = 0, week = 2200, valid = 0x03 */
    const UBX_TIMEGPS: [u8; 24] = [
        0xB5, 0x62, 0x01, 0x20, 0x10, 0x00, 0x00, 0xDE, 0xBC, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x98,
        0x08, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x78, 0x67,
    ];

    fn nmea_frame(body: &str) -> Vec<u8> {
        let cs = body.bytes().fold(0u8, |acc, b| acc ^ b);
        format!("${}*{:02X}", body, cs).into_bytes()
    }

    fn ubx_frame(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xB5, 0x62, class, id];
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        let (ck_a, ck_b) = ubx_checksum(&frame[2..]);
        frame.push(ck_a);
        frame.push(ck_b);
        frame
    }

    #[test]
    fn gga_parses_position() {
        let mut gps = crate::hal::Gps::new();
        assert_eq!(gps.lgw_parse_nmea(GGA_VALID), GpsMsg::NMEA_GGA);
        assert!(gps.fix.pos_ok);
        assert_eq!(gps.fix.lat_deg, 47);
        assert!((gps.fix.lat_min - 17.11399).abs() < 1E-9);
        assert_eq!(gps.fix.lat_hem, 'N');
        assert_eq!(gps.fix.lon_deg, 8);
        assert!((gps.fix.lon_min - 33.91590).abs() < 1E-9);
        assert_eq!(gps.fix.lon_hem, 'E');
        assert_eq!(gps.fix.alt, 499);
        assert_eq!(gps.fix.num_sat, 8);
    }

    #[test]
    fn rmc_parses_time_and_date() {
        let mut gps = crate::hal::Gps::new();
        assert_eq!(gps.lgw_parse_nmea(RMC_FIXED), GpsMsg::NMEA_RMC);
        assert!(gps.fix.time_ok);
        assert_eq!(gps.fix.mode, 'A');
        assert_eq!(
            (gps.fix.year, gps.fix.month, gps.fix.day),
            (2, 12, 9)
        );
        assert_eq!(
            (gps.fix.hour, gps.fix.minute, gps.fix.second),
            (8, 35, 59)
        );
        assert!((gps.fix.fraction - 0.34).abs() < 1E-6);
    }

    #[test]
    fn rmc_without_fix_clears_time() {
        let mut gps = crate::hal::Gps::new();
        assert_eq!(gps.lgw_parse_nmea(RMC_NO_FIX), GpsMsg::NMEA_RMC);
        assert!(!gps.fix.time_ok);
        assert_eq!(gps.fix.mode, 'N');
    }

    #[test]
    fn rmc_reparse_is_idempotent() {
        let mut gps = crate::hal::Gps::new();
        gps.lgw_parse_nmea(RMC_FIXED);
        let snapshot = gps.fix.clone();
        gps.lgw_parse_nmea(RMC_FIXED);
        assert_eq!(gps.fix, snapshot);
    }

    #[test]
    fn nmea_single_bit_corruption_is_rejected() {
        for i in 0..GGA_VALID.len() {
            let mut corrupted = GGA_VALID.to_vec();
            corrupted[i] ^= 0x01;
            let mut gps = crate::hal::Gps::new();
            assert_eq!(
                gps.lgw_parse_nmea(&corrupted),
                GpsMsg::INVALID,
                "flip at byte {} went undetected",
                i
            );
            assert!(!gps.fix.pos_ok);
        }
    }

    #[test]
    fn nmea_wrong_field_count_is_ignored() {
        let mut gps = crate::hal::Gps::new();
        let short_rmc = nmea_frame("GPRMC,083559.34,A,4717.11437");
        assert_eq!(gps.lgw_parse_nmea(&short_rmc), GpsMsg::IGNORED);
        assert!(!gps.fix.time_ok);
    }

    #[test]
    fn nmea_foreign_sentence_is_ignored() {
        let mut gps = crate::hal::Gps::new();
        let gsv = nmea_frame("GPGSV,1,1,03,23,38,230,44,29,71,156,47,07,29,116,41");
        assert_eq!(gps.lgw_parse_nmea(&gsv), GpsMsg::IGNORED);
    }

    #[test]
    fn nmea_size_limits() {
        let mut gps = crate::hal::Gps::new();
        assert_eq!(gps.lgw_parse_nmea(b"$GP*00"), GpsMsg::UNKNOWN);
        assert_eq!(gps.lgw_parse_nmea(&vec![b'$'; 300]), GpsMsg::INVALID);
    }

    #[test]
    fn ubx_timegps_parses_native_time() {
        let mut gps = crate::hal::Gps::new();
        let (kind, size) = gps.lgw_parse_ubx(&UBX_TIMEGPS);
        assert_eq!(kind, GpsMsg::UBX_NAV_TIMEGPS);
        assert_eq!(size, UBX_TIMEGPS.len());
        assert!(gps.fix.time_ok);
        assert_eq!(gps.fix.itow, 0x0ABCDE00);
        assert_eq!(gps.fix.ftow, 0);
        assert_eq!(gps.fix.week, 2200);
    }

    #[test]
    fn ubx_timegps_without_valid_bits_clears_time() {
        let mut gps = crate::hal::Gps::new();
        gps.lgw_parse_ubx(&UBX_TIMEGPS);
        assert!(gps.fix.time_ok);

        let mut payload = UBX_TIMEGPS[6..22].to_vec();
        payload[11] = 0x01; /* towValid only */
        let frame = ubx_frame(0x01, 0x20, &payload);
        assert_eq!(gps.lgw_parse_ubx(&frame).0, GpsMsg::UBX_NAV_TIMEGPS);
        assert!(!gps.fix.time_ok);
    }

    #[test]
    fn ubx_timegps_with_short_payload_is_still_classified() {
        let mut gps = crate::hal::Gps::new();
        gps.lgw_parse_ubx(&UBX_TIMEGPS);
        assert!(gps.fix.time_ok);

        /* too short to carry the validity byte */
        let frame = ubx_frame(0x01, 0x20, &[0xAA; 8]);
        let (kind, size) = gps.lgw_parse_ubx(&frame);
        assert_eq!(kind, GpsMsg::UBX_NAV_TIMEGPS);
        assert_eq!(size, frame.len());
        assert!(!gps.fix.time_ok);
    }

    #[test]
    fn ubx_corrupted_checksum_is_invalid() {
        let mut gps = crate::hal::Gps::new();
        let mut corrupted = UBX_TIMEGPS;
        corrupted[23] ^= 0x01;
        assert_eq!(gps.lgw_parse_ubx(&corrupted).0, GpsMsg::INVALID);
        assert!(!gps.fix.time_ok);
    }

    #[test]
    fn ubx_truncated_reports_needed_size() {
        let mut gps = crate::hal::Gps::new();
        let (kind, size) = gps.lgw_parse_ubx(&UBX_TIMEGPS[..10]);
        assert_eq!(kind, GpsMsg::INCOMPLETE);
        assert_eq!(size, UBX_TIMEGPS.len());
    }

    #[test]
    fn ubx_foreign_class_leaves_fix_untouched() {
        let mut gps = crate::hal::Gps::new();
        let ack = ubx_frame(0x05, 0x01, &[0x06, 0x01]);
        assert_eq!(gps.lgw_parse_ubx(&ack).0, GpsMsg::IGNORED);
        let nav_sol = ubx_frame(0x01, 0x06, &[0u8; 52]);
        assert_eq!(gps.lgw_parse_ubx(&nav_sol).0, GpsMsg::IGNORED);
        assert_eq!(gps.fix, GpsFix::default());
    }

    #[test]
    fn ubx_no_sync_or_short_buffer_is_ignored() {
        let mut gps = crate::hal::Gps::new();
        assert_eq!(gps.lgw_parse_ubx(&[0xB5, 0x62, 0x01]), (GpsMsg::IGNORED, 0));
        assert_eq!(gps.lgw_parse_ubx(GGA_VALID), (GpsMsg::IGNORED, 0));
    }

    #[test]
    fn fletcher_checksum_reference_vector() {
        /* CFG-MSG enabling NAV-TIMEGPS, from the receiver documentation */
        let frame = ubx_frame(0x06, 0x01, &[0x01, 0x20, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(frame[frame.len() - 2], 0x32);
        assert_eq!(frame[frame.len() - 1], 0x94);
    }
}
