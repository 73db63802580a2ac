use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;

use anyhow::Result;
use nix::libc;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices, Termios,
};
use tracing::{error, trace, warn};

use super::error::Error;
use super::LGW_GPS_MIN_MSG_SIZE;

const DEFAULT_BAUDRATE: BaudRate = BaudRate::B115200;

const UBX_MSG_NAVTIMEGPS_LEN: usize = 16;

/* UBX CFG-MSG command telling the receiver to push NAV-TIMEGPS on the serial
   line, so that NATIVE GPS time (no leap seconds) is available */
const UBX_CMD_TIMEGPS: [u8; UBX_MSG_NAVTIMEGPS_LEN] = [
    0xB5, 0x62, /* UBX Sync Chars */
    0x06, 0x01, /* CFG-MSG Class/ID */
    0x08, 0x00, /* Payload length */
    0x01, 0x20, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00, /* Enable NAV-TIMEGPS output on serial */
    0x32, 0x94, /* Checksum */
];

/// Serial session to the GNSS receiver. The previous line discipline is
/// saved on open and restored verbatim on [`GpsComPort::close`].
#[derive(Debug)]
pub struct GpsComPort {
    tty: File,
    ttyopt_restore: Termios,
}

impl GpsComPort {
    pub fn open(tty_path: &str, gps_family: Option<&str>, target_brate: u32) -> Result<Self> {
        let tty = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(tty_path)
            .map_err(|e| {
                error!("ERROR: TTY PORT FAIL TO OPEN, CHECK PATH AND ACCESS RIGHTS ({})", e);
                Error::LGW_GPS_ERROR
            })?;

        /* only the UBX messages of a u-blox 7 generation receiver are handled */
        match gps_family {
            Some(family) if family.starts_with("ubx7") => {}
            _ => warn!("WARNING: this version of GPS module may not be supported"),
        }
        if target_brate != 0 {
            warn!("WARNING: target_brate parameter ignored for now"); // TODO: honour the requested line rate
        }

        let mut ttyopt = termios::tcgetattr(&tty).map_err(|e| {
            error!("ERROR: IMPOSSIBLE TO GET TTY PORT CONFIGURATION ({})", e);
            Error::LGW_GPS_ERROR
        })?;

        /* save current port configuration for restoring later */
        let ttyopt_restore = ttyopt.clone();

        /* update baudrates */
        termios::cfsetispeed(&mut ttyopt, DEFAULT_BAUDRATE).map_err(|e| {
            error!("ERROR: IMPOSSIBLE TO UPDATE TTY PORT CONFIGURATION ({})", e);
            Error::LGW_GPS_ERROR
        })?;
        termios::cfsetospeed(&mut ttyopt, DEFAULT_BAUDRATE).map_err(|e| {
            error!("ERROR: IMPOSSIBLE TO UPDATE TTY PORT CONFIGURATION ({})", e);
            Error::LGW_GPS_ERROR
        })?;

        /* The following configuration should allow to:
            - Get ASCII NMEA messages
            - Get UBX binary messages
            - Send UBX binary commands
           Note: as binary data have to be read/written, we need to disable
                 various character processing to avoid losing data */
        /* Control Modes */
        ttyopt.control_flags |= ControlFlags::CLOCAL; /* local connection, no modem control */
        ttyopt.control_flags |= ControlFlags::CREAD; /* enable receiving characters */
        ttyopt.control_flags &= !ControlFlags::CSIZE;
        ttyopt.control_flags |= ControlFlags::CS8; /* 8 bit frames */
        ttyopt.control_flags &= !ControlFlags::PARENB; /* no parity */
        ttyopt.control_flags &= !ControlFlags::CSTOPB; /* one stop bit */
        /* Input Modes */
        ttyopt.input_flags |= InputFlags::IGNPAR; /* ignore bytes with parity errors */
        ttyopt.input_flags &= !InputFlags::ICRNL; /* do not map CR to NL on input */
        ttyopt.input_flags &= !InputFlags::IGNCR; /* do not ignore carriage return on input */
        ttyopt.input_flags &= !InputFlags::IXON; /* disable Start/Stop output control */
        ttyopt.input_flags &= !InputFlags::IXOFF; /* do not send Start/Stop characters */
        /* Output Modes */
        ttyopt.output_flags = OutputFlags::empty(); /* disable everything on output as we only write binary */
        /* Local Modes */
        ttyopt.local_flags &= !LocalFlags::ICANON; /* disable canonical input, cannot use with binary input */
        ttyopt.local_flags &= !LocalFlags::ISIG; /* disable check for INTR, QUIT, SUSP special characters */
        ttyopt.local_flags &= !LocalFlags::IEXTEN; /* disable any special control character */
        ttyopt.local_flags &= !(LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ECHOK); /* no echo */

        /* non-canonical mode: read blocks until at least VMIN bytes arrived */
        ttyopt.control_chars[SpecialCharacterIndices::VMIN as usize] = LGW_GPS_MIN_MSG_SIZE as u8;
        ttyopt.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(&tty, SetArg::TCSANOW, &ttyopt).map_err(|e| {
            error!("ERROR: IMPOSSIBLE TO UPDATE TTY PORT CONFIGURATION ({})", e);
            Error::LGW_GPS_ERROR
        })?;
        termios::tcflush(&tty, FlushArg::TCIOFLUSH).map_err(|e| {
            error!("ERROR: IMPOSSIBLE TO FLUSH TTY PORT ({})", e);
            Error::LGW_GPS_ERROR
        })?;

        let mut port = Self { tty, ttyopt_restore };

        /* one-shot command; the receiver keeps its defaults on a failed
           write, so the error is logged and not retried */
        match port.write(&UBX_CMD_TIMEGPS) {
            Ok(n) if n != UBX_MSG_NAVTIMEGPS_LEN => {
                error!("ERROR: Failed to write on serial port (written={})", n);
            }
            Err(e) => {
                error!("ERROR: Failed to write on serial port ({})", e);
            }
            Ok(_) => {}
        }

        Ok(port)
    }

    /// Restore the saved line discipline and release the device. The file
    /// descriptor is closed even when restoring fails.
    pub fn close(self) -> Result<()> {
        termios::tcsetattr(&self.tty, SetArg::TCSANOW, &self.ttyopt_restore).map_err(|e| {
            error!("ERROR: IMPOSSIBLE TO RESTORE TTY PORT CONFIGURATION ({})", e);
            Error::LGW_GPS_ERROR
        })?;
        termios::tcflush(&self.tty, FlushArg::TCIOFLUSH).map_err(|e| {
            error!("ERROR: IMPOSSIBLE TO FLUSH TTY PORT ({})", e);
            Error::LGW_GPS_ERROR
        })?;
        Ok(())
    }

    pub fn read(&mut self, data: &mut [u8]) -> io::Result<usize> {
        self.tty.read(data)
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        trace!(size = %data.len(), "WR: {:02X?}", data);
        self.tty.write(data)
    }
}
