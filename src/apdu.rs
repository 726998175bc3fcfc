//! ISO-7816 APDU byte-codec.
//!
//! Builds C-APDU byte arrays from `(cla, ins, p1, p2, data, le)`, classifies
//! the ISO-7816-3 §12.1 case 1..4, and extracts the 16-bit big-endian status
//! word from an R-APDU.

use byteorder::{BigEndian, ByteOrder};

/// A 16-bit status word, always read as big-endian.
pub type StatusWord = u16;

/// `0x9000`: the status word every command's status table implicitly maps
/// to `Success`.
pub const SW_SUCCESS: StatusWord = 0x9000;

/// ISO-7816-3 §12.1 APDU cases.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ApduCase {
    /// No command data, no response data.
    Case1,
    /// No command data, response data expected (Le present).
    Case2,
    /// Command data present, no response data expected.
    Case3,
    /// Command data present *and* response data expected (Lc and Le
    /// present). Rule CL-C4-MAC.1 treats this case specially in the MAC
    /// chain: the trailing Le byte is not part of the request bytes fed
    /// to the MAC.
    Case4,
}

/// A built command APDU, retaining enough structure to answer
/// [`Apdu::case`] and [`Apdu::strip_le_for_mac`] without re-parsing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Apdu {
    bytes: Vec<u8>,
    case: ApduCase,
}

impl Apdu {
    /// Build a C-APDU from its header fields.
    ///
    /// `le = Some(0)` requests "any length" (encoded as a trailing `0x00`);
    /// `le = None` means no response data is expected at all.
    pub fn build(cla: u8, ins: u8, p1: u8, p2: u8, data: Option<&[u8]>, le: Option<u8>) -> Self {
        let data = data.filter(|d| !d.is_empty());
        let case = match (data.is_some(), le.is_some()) {
            (false, false) => ApduCase::Case1,
            (false, true) => ApduCase::Case2,
            (true, false) => ApduCase::Case3,
            (true, true) => ApduCase::Case4,
        };

        let mut bytes = Vec::with_capacity(5 + data.map_or(0, <[u8]>::len) + 1);
        bytes.push(cla);
        bytes.push(ins);
        bytes.push(p1);
        bytes.push(p2);

        if let Some(data) = data {
            bytes.push(data.len() as u8);
            bytes.extend_from_slice(data);
        }

        if let Some(le) = le {
            bytes.push(le);
        }

        Self { bytes, case }
    }

    /// Wrap already-encoded bytes (e.g. a crypto-finalized APDU spliced
    /// together by a command descriptor) together with their case.
    pub fn from_bytes(bytes: Vec<u8>, case: ApduCase) -> Self {
        Self { bytes, case }
    }

    /// The raw bytes of this C-APDU.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume and return the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// The ISO-7816-3 case of this APDU.
    pub fn case(&self) -> ApduCase {
        self.case
    }

    /// Is this a case-4 APDU (data-in and data-out)?
    pub fn is_case4(&self) -> bool {
        self.case == ApduCase::Case4
    }

    /// The bytes of this request as they should be fed to the MAC chain:
    /// the trailing Le byte is dropped for case-4 APDUs (CL-C4-MAC.1),
    /// otherwise the full request is used.
    pub fn strip_le_for_mac(&self) -> &[u8] {
        if self.is_case4() {
            &self.bytes[..self.bytes.len() - 1]
        } else {
            &self.bytes
        }
    }
}

/// Extract the status word (last two bytes, big-endian) from an R-APDU.
///
/// Panics if `response` has fewer than 2 bytes; callers must have already
/// validated the response is non-empty (a reader returning an empty
/// response is a transport bug, not a status-word-extraction concern).
pub fn status_word(response: &[u8]) -> StatusWord {
    assert!(response.len() >= 2, "response too short to contain a SW");
    BigEndian::read_u16(&response[response.len() - 2..])
}

/// The data body of an R-APDU, i.e. everything but the trailing status
/// word.
pub fn response_data(response: &[u8]) -> &[u8] {
    assert!(response.len() >= 2, "response too short to contain a SW");
    &response[..response.len() - 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case1_no_data_no_le() {
        let apdu = Apdu::build(0x00, 0x84, 0x00, 0x00, None, None);
        assert_eq!(apdu.case(), ApduCase::Case1);
        assert_eq!(apdu.as_bytes(), &[0x00, 0x84, 0x00, 0x00]);
    }

    #[test]
    fn case2_le_only() {
        let apdu = Apdu::build(0x00, 0xB2, 0x01, 0x1C, None, Some(0x00));
        assert_eq!(apdu.case(), ApduCase::Case2);
        assert_eq!(apdu.as_bytes(), &[0x00, 0xB2, 0x01, 0x1C, 0x00]);
    }

    #[test]
    fn case3_data_only() {
        let apdu = Apdu::build(0x00, 0xDC, 0x01, 0x04, Some(&[0xAB; 16]), None);
        assert_eq!(apdu.case(), ApduCase::Case3);
        assert_eq!(apdu.as_bytes().len(), 4 + 1 + 16);
    }

    #[test]
    fn case4_strips_le_for_mac() {
        let apdu = Apdu::build(0x00, 0x8A, 0x03, 0xF7, Some(&[1, 2, 3]), Some(0x00));
        assert_eq!(apdu.case(), ApduCase::Case4);
        assert_eq!(apdu.strip_le_for_mac().len(), apdu.as_bytes().len() - 1);
        assert_eq!(
            apdu.strip_le_for_mac(),
            &apdu.as_bytes()[..apdu.as_bytes().len() - 1]
        );
    }

    #[test]
    fn non_case4_keeps_full_request_for_mac() {
        let apdu = Apdu::build(0x00, 0xDC, 0x01, 0x04, Some(&[0xAB; 4]), None);
        assert_eq!(apdu.strip_le_for_mac(), apdu.as_bytes());
    }

    #[test]
    fn status_word_is_big_endian_trailer() {
        let response = [0x01, 0x02, 0x90, 0x00];
        assert_eq!(status_word(&response), 0x9000);
        assert_eq!(response_data(&response), &[0x01, 0x02]);
    }
}
