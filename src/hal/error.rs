#[derive(thiserror::Error, Debug)]
#[allow(non_camel_case_types)]
pub enum Error {
    #[error("LGW_GPS_ERROR")]
    LGW_GPS_ERROR,
}
