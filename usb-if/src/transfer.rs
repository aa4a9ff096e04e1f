use num_enum::{FromPrimitive, IntoPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    const MASK: u8 = 0x80;

    /// Direction encoded in bit 7 of an endpoint address or `bmRequestType`.
    pub fn from_address(addr: u8) -> Self {
        if addr & Self::MASK == Self::MASK {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn to_address_bit(self) -> u8 {
        match self {
            Direction::Out => 0,
            Direction::In => Self::MASK,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Out => Direction::In,
            Direction::In => Direction::Out,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointType {
    /// Transfer type from the low two bits of `bmAttributes`.
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

/// Packet identifier a transfer is issued with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    Setup,
    In,
    Out,
}

impl From<Direction> for Token {
    fn from(value: Direction) -> Self {
        match value {
            Direction::In => Token::In,
            Direction::Out => Token::Out,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Speed {
    Low,
    Full,
    High,
    Super,
}

impl Speed {
    /// Max packet size the default pipe is opened with before the device
    /// descriptor has been read.
    pub fn default_max_packet_size(self) -> u16 {
        match self {
            Speed::Low => 8,
            _ => 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Request {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
    #[num_enum(catch_all)]
    Other(u8),
}

/// Feature selector of SET_FEATURE / CLEAR_FEATURE addressed to an endpoint.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;

#[derive(Debug, Clone)]
pub struct ControlSetup {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: Request,
    pub value: u16,
    pub index: u16,
}

/// The 8 byte packet sent during the SETUP stage of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const LEN: usize = 8;

    pub fn new(direction: Direction, setup: &ControlSetup, length: u16) -> Self {
        let request_type = direction.to_address_bit()
            | ((setup.request_type as u8) << 5)
            | setup.recipient as u8;
        Self {
            request_type,
            request: setup.request.into(),
            value: setup.value,
            index: setup.index,
            length,
        }
    }

    /// Direction of the DATA stage, taken from `bmRequestType` bit 7.
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.request_type)
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN {
            return None;
        }
        Some(Self {
            request_type: data[0],
            request: data[1],
            value: u16::from_le_bytes([data[2], data[3]]),
            index: u16::from_le_bytes([data[4], data[5]]),
            length: u16::from_le_bytes([data[6], data[7]]),
        })
    }
}
