use num_enum::{FromPrimitive, IntoPrimitive};

/// USB class codes as defined by USB-IF
/// https://www.usb.org/defined-class-codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BaseClass {
    /// Use class information in the Interface Descriptors
    UseInterface = 0x00,
    Audio = 0x01,
    /// Communications and CDC Control
    Communication = 0x02,
    Hid = 0x03,
    Physical = 0x05,
    /// Still Imaging
    Image = 0x06,
    Printer = 0x07,
    MassStorage = 0x08,
    Hub = 0x09,
    CdcData = 0x0A,
    SmartCard = 0x0B,
    ContentSecurity = 0x0D,
    Video = 0x0E,
    PersonalHealthcare = 0x0F,
    Diagnostic = 0xDC,
    /// Wireless Controller
    Wireless = 0xE0,
    Miscellaneous = 0xEF,
    #[num_enum(catch_all)]
    Other(u8),
    /// Application Specific
    Application = 0xFE,
    Vendor = 0xFF,
}

impl BaseClass {
    /// Classes the host stack accepts on an interface descriptor.
    pub fn supported_by_interface(self) -> bool {
        !matches!(self, BaseClass::UseInterface | BaseClass::Other(_))
    }

    /// Classes the host stack accepts on a device descriptor. `0x00` defers
    /// the decision to the interfaces.
    pub fn supported_by_device(self) -> bool {
        self == BaseClass::UseInterface || self.supported_by_interface()
    }
}
