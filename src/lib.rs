//! GNSS module management for accurate timestamping of LoRa packets and
//! synchronisation of gateways. A limited set of receiver brands/models are
//! supported (u-blox 7 generation over a serial line).

pub mod hal;
