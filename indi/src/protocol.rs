//! INDI protocol constants

/// INDI protocol version
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// Supported INDI protocol versions
pub const INDI_PROTOCOL_VERSIONS: &[&str] = &["1.7", "1.8", "1.9"];

/// Default INDI server port
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// Standard INDI property and member names the engine relies on
pub mod standard_properties {
    /// Connection control switch
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";
    pub const DISCONNECT: &str = "DISCONNECT";

    /// Driver identification text vector
    pub const DRIVER_INFO: &str = "DRIVER_INFO";
    pub const DRIVER_NAME: &str = "DRIVER_NAME";
    pub const DRIVER_EXEC: &str = "DRIVER_EXEC";
    pub const DRIVER_VERSION: &str = "DRIVER_VERSION";
    pub const DRIVER_INTERFACE: &str = "DRIVER_INTERFACE";

    /// Device port
    pub const DEVICE_PORT: &str = "DEVICE_PORT";
    pub const PORT: &str = "PORT";

    // Camera image stream
    pub const CCD1: &str = "CCD1";
    pub const CCD2: &str = "CCD2";
}

/// Interface bit mask published in `DRIVER_INFO.DRIVER_INTERFACE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverInterface(pub u32);

impl DriverInterface {
    pub const GENERAL: DriverInterface = DriverInterface(0);
    pub const TELESCOPE: DriverInterface = DriverInterface(1 << 0);
    pub const CCD: DriverInterface = DriverInterface(1 << 1);
    pub const GUIDER: DriverInterface = DriverInterface(1 << 2);
    pub const FOCUSER: DriverInterface = DriverInterface(1 << 3);
    pub const FILTER: DriverInterface = DriverInterface(1 << 4);
    pub const DOME: DriverInterface = DriverInterface(1 << 5);
    pub const GPS: DriverInterface = DriverInterface(1 << 6);
    pub const WEATHER: DriverInterface = DriverInterface(1 << 7);
    pub const AO: DriverInterface = DriverInterface(1 << 8);
    pub const DUSTCAP: DriverInterface = DriverInterface(1 << 9);
    pub const LIGHTBOX: DriverInterface = DriverInterface(1 << 10);
    pub const DETECTOR: DriverInterface = DriverInterface(1 << 11);
    pub const ROTATOR: DriverInterface = DriverInterface(1 << 12);
    pub const SPECTROGRAPH: DriverInterface = DriverInterface(1 << 13);
    pub const CORRELATOR: DriverInterface = DriverInterface(1 << 14);
    pub const AUX: DriverInterface = DriverInterface(1 << 15);

    /// True if every bit of `other` is set
    pub fn contains(self, other: DriverInterface) -> bool {
        self.0 & other.0 == other.0
    }
}
