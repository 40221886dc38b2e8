//! OBD-II Protocol Definitions
//!
//! Each protocol variant carries a fixed framing table. Variants that share a
//! family (e.g. the four ISO 15765-4 bitrates) share frame bytes on the wire and
//! differ only in physical-layer parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported OBD-II protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolId {
    /// SAE J1850 PWM (41.6 kbaud)
    #[serde(rename = "SAE_J1850_PWM", alias = "J1850_PWM")]
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    #[serde(rename = "SAE_J1850_VPW", alias = "J1850_VPW")]
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    #[serde(rename = "ISO9141_2", alias = "ISO9141")]
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    #[serde(rename = "ISO14230_4_KWP", alias = "ISO14230")]
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    #[serde(rename = "ISO14230_4_KWP_FAST")]
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    #[serde(rename = "ISO15765_4_CAN_11_500", alias = "ISO15765")]
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    #[serde(rename = "ISO15765_4_CAN_29_500")]
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    #[serde(rename = "ISO15765_4_CAN_11_250")]
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    #[serde(rename = "ISO15765_4_CAN_29_250")]
    Iso15765_4Can29bit250,
}

/// Frame layout family shared by several protocol variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    /// SAE J1850 (PWM and VPW)
    J1850,
    /// ISO 9141-2 K-line
    Iso9141,
    /// ISO 14230-4 K-line (format byte carries the length)
    Iso14230,
    /// ISO 15765-4 with 11-bit identifiers
    Can11,
    /// ISO 15765-4 with 29-bit identifiers
    Can29,
}

/// Checksum appended to each frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// No checksum on the wire (CAN controller handles CRC)
    None,
    /// 8-bit additive sum of header and data
    Sum8,
    /// CRC-8 SAE J1850 (poly 0x1D, init 0xFF, xor-out 0xFF)
    Crc8SaeJ1850,
}

const J1850_CRC: crc::Crc<u8> = crc::Crc::<u8>::new(&crc::CRC_8_SAE_J1850);

impl ChecksumKind {
    /// Compute the checksum over `bytes`, if this kind has one
    pub fn compute(&self, bytes: &[u8]) -> Option<u8> {
        match self {
            ChecksumKind::None => None,
            ChecksumKind::Sum8 => Some(bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))),
            ChecksumKind::Crc8SaeJ1850 => Some(J1850_CRC.checksum(bytes)),
        }
    }

    /// Number of trailing checksum bytes in a frame
    pub fn width(&self) -> usize {
        match self {
            ChecksumKind::None => 0,
            _ => 1,
        }
    }
}

/// Fixed framing parameters of a protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Header bytes preceding the data
    pub header_len: usize,
    /// Trailing checksum
    pub checksum: ChecksumKind,
    /// Line terminator closing each frame on the link
    pub terminator: u8,
    /// Maximum diagnostic bytes (mode + pid + payload) in one request frame
    pub max_payload: usize,
}

/// Line terminator used by ELM327-style links
pub const FRAME_TERMINATOR: u8 = b'\r';

/// Prompt the adapter prints once a response is complete
pub const PROMPT: u8 = b'>';

const J1850_LAYOUT: FrameLayout = FrameLayout {
    header_len: 3,
    checksum: ChecksumKind::Crc8SaeJ1850,
    terminator: FRAME_TERMINATOR,
    max_payload: 7,
};

const ISO9141_LAYOUT: FrameLayout = FrameLayout {
    header_len: 3,
    checksum: ChecksumKind::Sum8,
    terminator: FRAME_TERMINATOR,
    max_payload: 7,
};

const ISO14230_LAYOUT: FrameLayout = FrameLayout {
    header_len: 3,
    checksum: ChecksumKind::Sum8,
    terminator: FRAME_TERMINATOR,
    max_payload: 7,
};

const CAN11_LAYOUT: FrameLayout = FrameLayout {
    header_len: 2,
    checksum: ChecksumKind::None,
    terminator: FRAME_TERMINATOR,
    max_payload: 7,
};

const CAN29_LAYOUT: FrameLayout = FrameLayout {
    header_len: 4,
    checksum: ChecksumKind::None,
    terminator: FRAME_TERMINATOR,
    max_payload: 7,
};

/// Tester (scan tool) address used in K-line and J1850 headers
pub const TESTER_ADDRESS: u8 = 0xF1;

/// Functional CAN request identifier, 11-bit
pub const CAN11_FUNCTIONAL_ID: u32 = 0x7DF;

/// Functional CAN request identifier, 29-bit
pub const CAN29_FUNCTIONAL_ID: u32 = 0x18DB_33F1;

impl ProtocolId {
    /// Probe order used when the caller asks for automatic detection
    pub const AUTO_ORDER: [ProtocolId; 9] = [
        ProtocolId::Iso15765_4Can11bit500,
        ProtocolId::Iso15765_4Can29bit500,
        ProtocolId::Iso15765_4Can11bit250,
        ProtocolId::Iso15765_4Can29bit250,
        ProtocolId::Iso14230_4KwpFast,
        ProtocolId::Iso14230_4Kwp,
        ProtocolId::Iso9141_2,
        ProtocolId::J1850Vpw,
        ProtocolId::J1850Pwm,
    ];

    /// ELM327 protocol number (as used by `ATSP n`)
    pub fn elm_number(&self) -> u8 {
        match self {
            ProtocolId::J1850Pwm => 1,
            ProtocolId::J1850Vpw => 2,
            ProtocolId::Iso9141_2 => 3,
            ProtocolId::Iso14230_4Kwp => 4,
            ProtocolId::Iso14230_4KwpFast => 5,
            ProtocolId::Iso15765_4Can11bit500 => 6,
            ProtocolId::Iso15765_4Can29bit500 => 7,
            ProtocolId::Iso15765_4Can11bit250 => 8,
            ProtocolId::Iso15765_4Can29bit250 => 9,
        }
    }

    /// Canonical configuration name
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolId::J1850Pwm => "SAE_J1850_PWM",
            ProtocolId::J1850Vpw => "SAE_J1850_VPW",
            ProtocolId::Iso9141_2 => "ISO9141_2",
            ProtocolId::Iso14230_4Kwp => "ISO14230_4_KWP",
            ProtocolId::Iso14230_4KwpFast => "ISO14230_4_KWP_FAST",
            ProtocolId::Iso15765_4Can11bit500 => "ISO15765_4_CAN_11_500",
            ProtocolId::Iso15765_4Can29bit500 => "ISO15765_4_CAN_29_500",
            ProtocolId::Iso15765_4Can11bit250 => "ISO15765_4_CAN_11_250",
            ProtocolId::Iso15765_4Can29bit250 => "ISO15765_4_CAN_29_250",
        }
    }

    /// Frame family of this protocol
    pub fn family(&self) -> ProtocolFamily {
        match self {
            ProtocolId::J1850Pwm | ProtocolId::J1850Vpw => ProtocolFamily::J1850,
            ProtocolId::Iso9141_2 => ProtocolFamily::Iso9141,
            ProtocolId::Iso14230_4Kwp | ProtocolId::Iso14230_4KwpFast => ProtocolFamily::Iso14230,
            ProtocolId::Iso15765_4Can11bit500 | ProtocolId::Iso15765_4Can11bit250 => {
                ProtocolFamily::Can11
            }
            ProtocolId::Iso15765_4Can29bit500 | ProtocolId::Iso15765_4Can29bit250 => {
                ProtocolFamily::Can29
            }
        }
    }

    /// Framing table entry for this protocol
    pub fn layout(&self) -> FrameLayout {
        match self.family() {
            ProtocolFamily::J1850 => J1850_LAYOUT,
            ProtocolFamily::Iso9141 => ISO9141_LAYOUT,
            ProtocolFamily::Iso14230 => ISO14230_LAYOUT,
            ProtocolFamily::Can11 => CAN11_LAYOUT,
            ProtocolFamily::Can29 => CAN29_LAYOUT,
        }
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(self.family(), ProtocolFamily::Can11 | ProtocolFamily::Can29)
    }

    /// Header for a functional request carrying `data_len` diagnostic bytes
    pub fn request_header(&self, data_len: usize) -> Vec<u8> {
        match self {
            ProtocolId::J1850Pwm => vec![0x61, 0x6A, TESTER_ADDRESS],
            ProtocolId::J1850Vpw | ProtocolId::Iso9141_2 => vec![0x68, 0x6A, TESTER_ADDRESS],
            ProtocolId::Iso14230_4Kwp | ProtocolId::Iso14230_4KwpFast => {
                vec![0xC0 | (data_len as u8 & 0x3F), 0x33, TESTER_ADDRESS]
            }
            ProtocolId::Iso15765_4Can11bit500 | ProtocolId::Iso15765_4Can11bit250 => {
                (CAN11_FUNCTIONAL_ID as u16).to_be_bytes().to_vec()
            }
            ProtocolId::Iso15765_4Can29bit500 | ProtocolId::Iso15765_4Can29bit250 => {
                CAN29_FUNCTIONAL_ID.to_be_bytes().to_vec()
            }
        }
    }

    /// Header an ECU at `ecu` uses when answering with `data_len` bytes
    pub fn response_header(&self, ecu: u8, data_len: usize) -> Vec<u8> {
        match self {
            ProtocolId::J1850Pwm => vec![0x41, 0x6B, ecu],
            ProtocolId::J1850Vpw | ProtocolId::Iso9141_2 => vec![0x48, 0x6B, ecu],
            ProtocolId::Iso14230_4Kwp | ProtocolId::Iso14230_4KwpFast => {
                vec![0x80 | (data_len as u8 & 0x3F), TESTER_ADDRESS, ecu]
            }
            ProtocolId::Iso15765_4Can11bit500 | ProtocolId::Iso15765_4Can11bit250 => {
                // ECU n answers on 0x7E8 + n
                (0x7E8u16 + (ecu as u16 & 0x07)).to_be_bytes().to_vec()
            }
            ProtocolId::Iso15765_4Can29bit500 | ProtocolId::Iso15765_4Can29bit250 => {
                vec![0x18, 0xDA, TESTER_ADDRESS, ecu]
            }
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();

        if let Ok(number) = wanted.parse::<u8>() {
            return ProtocolId::AUTO_ORDER
                .into_iter()
                .find(|p| p.elm_number() == number)
                .ok_or_else(|| format!("unknown protocol number {number}"));
        }

        let alias = match wanted.as_str() {
            "J1850PWM" => Some(ProtocolId::J1850Pwm),
            "J1850VPW" => Some(ProtocolId::J1850Vpw),
            "ISO9141" => Some(ProtocolId::Iso9141_2),
            "ISO14230" => Some(ProtocolId::Iso14230_4Kwp),
            "ISO15765" => Some(ProtocolId::Iso15765_4Can11bit500),
            _ => None,
        };

        alias
            .or_else(|| {
                ProtocolId::AUTO_ORDER.into_iter().find(|p| {
                    let canonical: String =
                        p.name().chars().filter(|c| c.is_ascii_alphanumeric()).collect();
                    canonical == wanted
                })
            })
            .ok_or_else(|| format!("unknown protocol `{s}`"))
    }
}

/// Which protocols to try, and in what order
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "PreferenceRepr", into = "PreferenceRepr")]
pub enum ProtocolPreference {
    /// Probe [`ProtocolId::AUTO_ORDER`]
    #[default]
    Auto,
    /// Probe the listed protocols, first entry first
    Ordered(Vec<ProtocolId>),
}

impl ProtocolPreference {
    /// Candidates in probe order, duplicates removed
    pub fn candidates(&self) -> Vec<ProtocolId> {
        match self {
            ProtocolPreference::Auto => ProtocolId::AUTO_ORDER.to_vec(),
            ProtocolPreference::Ordered(list) => {
                let mut seen = Vec::with_capacity(list.len());
                for p in list {
                    if !seen.contains(p) {
                        seen.push(*p);
                    }
                }
                seen
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PreferenceRepr {
    Keyword(String),
    List(Vec<ProtocolId>),
}

impl TryFrom<PreferenceRepr> for ProtocolPreference {
    type Error = String;

    fn try_from(repr: PreferenceRepr) -> Result<Self, Self::Error> {
        match repr {
            PreferenceRepr::Keyword(k) if k.eq_ignore_ascii_case("auto") => {
                Ok(ProtocolPreference::Auto)
            }
            PreferenceRepr::Keyword(k) => k
                .split(',')
                .map(|p| p.trim().parse::<ProtocolId>())
                .collect::<Result<Vec<_>, _>>()
                .map(ProtocolPreference::Ordered),
            PreferenceRepr::List(list) => Ok(ProtocolPreference::Ordered(list)),
        }
    }
}

impl From<ProtocolPreference> for PreferenceRepr {
    fn from(pref: ProtocolPreference) -> Self {
        match pref {
            ProtocolPreference::Auto => PreferenceRepr::Keyword("auto".to_string()),
            ProtocolPreference::Ordered(list) => PreferenceRepr::List(list),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum8_checksum() {
        // 68 6A F1 01 00 -> 0x68+0x6A+0xF1+0x01 = 0x1C4
        assert_eq!(ChecksumKind::Sum8.compute(&[0x68, 0x6A, 0xF1, 0x01, 0x00]), Some(0xC4));
    }

    #[test]
    fn test_j1850_crc_check_value() {
        // CRC-8/SAE-J1850 check value for "123456789"
        assert_eq!(ChecksumKind::Crc8SaeJ1850.compute(b"123456789"), Some(0x4B));
        assert_eq!(ChecksumKind::None.compute(b"123456789"), None);
    }

    #[test]
    fn test_request_headers() {
        assert_eq!(ProtocolId::Iso9141_2.request_header(2), vec![0x68, 0x6A, 0xF1]);
        assert_eq!(ProtocolId::Iso14230_4Kwp.request_header(2), vec![0xC2, 0x33, 0xF1]);
        assert_eq!(ProtocolId::Iso15765_4Can11bit500.request_header(2), vec![0x07, 0xDF]);
        assert_eq!(
            ProtocolId::Iso15765_4Can29bit250.request_header(2),
            vec![0x18, 0xDB, 0x33, 0xF1]
        );
    }

    #[test]
    fn test_layout_matches_header() {
        for p in ProtocolId::AUTO_ORDER {
            assert_eq!(p.request_header(2).len(), p.layout().header_len, "{p}");
            assert_eq!(p.response_header(0x10, 2).len(), p.layout().header_len, "{p}");
        }
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("ISO9141".parse::<ProtocolId>().unwrap(), ProtocolId::Iso9141_2);
        assert_eq!("iso15765".parse::<ProtocolId>().unwrap(), ProtocolId::Iso15765_4Can11bit500);
        assert_eq!("7".parse::<ProtocolId>().unwrap(), ProtocolId::Iso15765_4Can29bit500);
        assert_eq!(
            "ISO14230_4_KWP_FAST".parse::<ProtocolId>().unwrap(),
            ProtocolId::Iso14230_4KwpFast
        );
        assert!("ISO0000".parse::<ProtocolId>().is_err());
    }

    #[test]
    fn test_preference_candidates() {
        assert_eq!(ProtocolPreference::Auto.candidates().len(), 9);
        let pref = ProtocolPreference::Ordered(vec![
            ProtocolId::Iso15765_4Can11bit500,
            ProtocolId::Iso9141_2,
            ProtocolId::Iso15765_4Can11bit500,
        ]);
        assert_eq!(
            pref.candidates(),
            vec![ProtocolId::Iso15765_4Can11bit500, ProtocolId::Iso9141_2]
        );
    }

    #[test]
    fn test_preference_deserialize() {
        let auto: ProtocolPreference = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, ProtocolPreference::Auto);
        let list: ProtocolPreference =
            serde_json::from_str("[\"ISO15765\", \"ISO9141_2\"]").unwrap();
        assert_eq!(
            list,
            ProtocolPreference::Ordered(vec![
                ProtocolId::Iso15765_4Can11bit500,
                ProtocolId::Iso9141_2
            ])
        );
        let csv: ProtocolPreference = serde_json::from_str("\"ISO9141, 6\"").unwrap();
        assert_eq!(
            csv,
            ProtocolPreference::Ordered(vec![
                ProtocolId::Iso9141_2,
                ProtocolId::Iso15765_4Can11bit500
            ])
        );
    }
}
