// ISO 7816-4 command and response APDUs

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApduError {
    #[error("APDU too short: {0} bytes")]
    TooShort(usize),

    #[error("APDU length mismatch: Lc says {declared}, body has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("APDU data too long: {0} bytes")]
    DataTooLong(usize),
}

/// Two-byte trailer of a response APDU
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(0x9000);
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord(0x6985);
    pub const APPLET_SELECT_FAILED: StatusWord = StatusWord(0x6999);
    pub const FILE_NOT_FOUND: StatusWord = StatusWord(0x6A82);
    pub const UNKNOWN_ERROR: StatusWord = StatusWord(0x6F00);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SW({:04X})", self.0)
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<u16>,
}

impl CommandApdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_le(mut self, le: u16) -> Self {
        self.le = Some(le);
        self
    }

    /// Short form when everything fits one byte, extended form otherwise
    pub fn encode(&self) -> Result<Vec<u8>, ApduError> {
        if self.data.len() > 0xFFFF {
            return Err(ApduError::DataTooLong(self.data.len()));
        }
        let extended = self.data.len() > 0xFF || self.le.map_or(false, |le| le > 0x100);
        let mut out = Vec::with_capacity(4 + 3 + self.data.len() + 3);
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        if !self.data.is_empty() {
            if extended {
                out.push(0x00);
                out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
            } else {
                out.push(self.data.len() as u8);
            }
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            if extended {
                if self.data.is_empty() {
                    out.push(0x00);
                }
                out.extend_from_slice(&le.to_be_bytes());
            } else {
                // 256 is encoded as 0x00
                out.push(le as u8);
            }
        }
        Ok(out)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ApduError> {
        if bytes.len() < 4 {
            return Err(ApduError::TooShort(bytes.len()));
        }
        let mut apdu = Self::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let body = &bytes[4..];

        match body.len() {
            0 => {}
            1 => apdu.le = Some(le_short(body[0])),
            _ if body[0] == 0x00 && body.len() >= 3 => {
                // extended length
                let lc = u16::from_be_bytes([body[1], body[2]]) as usize;
                if body.len() == 3 {
                    apdu.le = Some(lc as u16);
                } else {
                    let rest = &body[3..];
                    match rest.len().checked_sub(lc) {
                        Some(0) => apdu.data = rest.to_vec(),
                        Some(2) => {
                            apdu.data = rest[..lc].to_vec();
                            apdu.le = Some(u16::from_be_bytes([rest[lc], rest[lc + 1]]));
                        }
                        _ => {
                            return Err(ApduError::LengthMismatch {
                                declared: lc,
                                actual: rest.len(),
                            })
                        }
                    }
                }
            }
            _ => {
                let lc = body[0] as usize;
                let rest = &body[1..];
                match rest.len().checked_sub(lc) {
                    Some(0) => apdu.data = rest.to_vec(),
                    Some(1) => {
                        apdu.data = rest[..lc].to_vec();
                        apdu.le = Some(le_short(rest[lc]));
                    }
                    _ => {
                        return Err(ApduError::LengthMismatch {
                            declared: lc,
                            actual: rest.len(),
                        })
                    }
                }
            }
        }
        Ok(apdu)
    }
}

fn le_short(raw: u8) -> u16 {
    if raw == 0 {
        0x100
    } else {
        raw as u16
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    pub data: Vec<u8>,
    pub sw: StatusWord,
}

impl ResponseApdu {
    pub fn new(data: impl Into<Vec<u8>>, sw: StatusWord) -> Self {
        Self {
            data: data.into(),
            sw,
        }
    }

    pub fn status_only(sw: StatusWord) -> Self {
        Self::new(Vec::new(), sw)
    }

    pub fn is_success(&self) -> bool {
        self.sw.is_success()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ApduError> {
        if bytes.len() < 2 {
            return Err(ApduError::TooShort(bytes.len()));
        }
        let split = bytes.len() - 2;
        Ok(Self {
            data: bytes[..split].to_vec(),
            sw: StatusWord(u16::from_be_bytes([bytes[split], bytes[split + 1]])),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        out.extend_from_slice(&self.sw.to_bytes());
        out
    }
}
