//! Opcode tables for the legacy web client. Both directions are separate
//! byte namespaces; the values are fixed by the client and must not be
//! renumbered.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerOpcode {
    SendServerData = 0x01,
    LoginSuccess = 0x02,
    WorldTime = 0x03,
    WriteSpells = 0x04,
    PlayerStatistics = 0x05,
    WriteChunk = 0x06,
}

impl ServerOpcode {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientOpcode {
    RequestLogin = 0x01,
}

impl ClientOpcode {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ClientOpcode::RequestLogin),
            _ => None,
        }
    }
}
