//! Protocol constants and standard property names
//!
//! The INDI standard property vocabulary shared by conforming drivers.
//! Using these constants instead of string literals keeps device-facing
//! code typo-proof.

/// Protocol version announced in `getProperties`.
pub const PROTOCOL_VERSION: &str = "1.7";

/// Connection control (switch vector, one-of-many)
pub const CONNECTION: &str = "CONNECTION";
pub const CONNECT: &str = "CONNECT";
pub const DISCONNECT: &str = "DISCONNECT";

/// Serial/TCP port the driver talks to (text vector)
pub const DEVICE_PORT: &str = "DEVICE_PORT";
pub const PORT: &str = "PORT";

/// Camera exposure (number vector, seconds)
pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
pub const CCD_EXPOSURE_VALUE: &str = "CCD_EXPOSURE_VALUE";

/// Primary camera image BLOB
pub const CCD1: &str = "CCD1";

/// Camera frame geometry (number vector)
pub const CCD_FRAME: &str = "CCD_FRAME";
pub const CCD_BINNING: &str = "CCD_BINNING";
pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
pub const CCD_TEMPERATURE_VALUE: &str = "CCD_TEMPERATURE_VALUE";

/// Filter wheel position and names
pub const FILTER_SLOT: &str = "FILTER_SLOT";
pub const FILTER_SLOT_VALUE: &str = "FILTER_SLOT_VALUE";
pub const FILTER_NAME: &str = "FILTER_NAME";

/// Focuser position (number vector, steps)
pub const ABS_FOCUS_POSITION: &str = "ABS_FOCUS_POSITION";
pub const FOCUS_ABSOLUTE_POSITION: &str = "FOCUS_ABSOLUTE_POSITION";

/// Mount pointing, equatorial coordinates of date (number vector)
pub const EQUATORIAL_EOD_COORD: &str = "EQUATORIAL_EOD_COORD";
pub const RA: &str = "RA";
pub const DEC: &str = "DEC";

/// Mount motion state
pub const TELESCOPE_PARK: &str = "TELESCOPE_PARK";
pub const TELESCOPE_ABORT_MOTION: &str = "TELESCOPE_ABORT_MOTION";
