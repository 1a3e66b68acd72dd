//! M-Bus wire details for the single-meter gateway.
//!
//! Only the pieces the gateway actually needs are modelled here: the REQ_UD2
//! short frame sent to one primary address, the serial baud rates a meter
//! may be configured for, and the decoder that extracts the BCD volume
//! record (DIF `0x0C`, VIF `0x13`) from whatever the meter answers.
use std::fmt;
use std::ops::Deref;

/// Errors raised while building requests or decoding responses.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// No `DIF=0x0C, VIF=0x13` record with four data bytes was found.
    #[error("Volume record (DIF 0x0C, VIF 0x13) not found in {0} byte frame")]
    MarkerNotFound(usize),
    /// A BCD nibble above 9 was found while decoding in strict mode.
    #[error("Invalid BCD digit 0x{digit:X} at frame offset {offset}")]
    InvalidBcdDigit { offset: usize, digit: u8 },
    /// The primary address is reserved or outside of the valid range.
    #[error("The primary address {0} is outside the valid range")]
    AddressOutOfRange(u8),
    /// The baud rate is not one an M-Bus meter supports.
    #[error("The baud rate {0} is not supported (300, 2400, 9600)")]
    BaudRateOutOfRange(u32),
}

/// Start byte of an M-Bus short frame.
pub const SHORT_FRAME_START: u8 = 0x10;
/// Stop byte of every M-Bus frame.
pub const FRAME_STOP: u8 = 0x16;
/// Control field of REQ_UD2 (request user data, class 2) with FCB set.
pub const CONTROL_REQ_UD2: u8 = 0x5B;

/// Data information field of the volume record: 8 digit BCD, instantaneous value.
pub const VOLUME_DIF: u8 = 0x0C;
/// Value information field of the volume record: volume in 10^-3 m³.
pub const VOLUME_VIF: u8 = 0x13;
/// Number of BCD encoded bytes following the DIF/VIF pair.
pub const VOLUME_DATA_LEN: usize = 4;
/// Divisor that turns the decoded integer into cubic meters.
pub const VOLUME_DIVISOR: f64 = 1000.0;

const VOLUME_RECORD_LEN: usize = 2 + VOLUME_DATA_LEN;

/// A validated M-Bus primary address.
///
/// Addresses `0..=250` select a single meter. `254` is the "broadcast with
/// reply" address, usable when exactly one meter hangs on the bus.
/// `251..=253` and `255` are reserved or reply-less and therefore rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(u8);

impl Address {
    /// Smallest primary address.
    pub const MIN: u8 = 0;
    /// Largest regular primary address.
    pub const MAX: u8 = 250;
    /// Broadcast address every meter answers to.
    pub const BROADCAST: Address = Address(0xFE);
}

impl Deref for Address {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for Address {
    /// Factory default primary address of most meters.
    fn default() -> Self {
        Self(0x00)
    }
}

impl TryFrom<u8> for Address {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) || value == *Self::BROADCAST {
            Ok(Self(value))
        } else {
            Err(Error::AddressOutOfRange(value))
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Serial speeds supported by M-Bus meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaudRate {
    B300,
    #[default]
    B2400,
    B9600,
}

impl From<BaudRate> for u32 {
    fn from(baud_rate: BaudRate) -> u32 {
        match baud_rate {
            BaudRate::B300 => 300,
            BaudRate::B2400 => 2400,
            BaudRate::B9600 => 9600,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            300 => Ok(BaudRate::B300),
            2400 => Ok(BaudRate::B2400),
            9600 => Ok(BaudRate::B9600),
            _ => Err(Error::BaudRateOutOfRange(value)),
        }
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

/// The REQ_UD2 short frame asking one meter for its user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame([u8; 5]);

impl RequestFrame {
    /// Builds the request for `address`: start, control, address, checksum, stop.
    pub fn req_ud2(address: Address) -> Self {
        let checksum = CONTROL_REQ_UD2.wrapping_add(*address);
        Self([
            SHORT_FRAME_START,
            CONTROL_REQ_UD2,
            *address,
            checksum,
            FRAME_STOP,
        ])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for RequestFrame {
    fn default() -> Self {
        Self::req_ud2(Address::default())
    }
}

/// How the decoder treats BCD nibbles above 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeMode {
    /// Out-of-range nibbles are weighted like any other digit, so a corrupted
    /// frame can yield a plausible looking but wrong volume.
    #[default]
    Lenient,
    /// Out-of-range nibbles reject the frame.
    Strict,
}

/// Scans `frame` for the volume record and returns the volume in m³.
///
/// The first `0x0C 0x13` pair followed by at least four bytes wins. The four
/// bytes are read as eight BCD digits, least significant byte first and low
/// nibble before high nibble, and the resulting integer is divided by 1000.
///
/// # Examples
///
/// ```
/// use gasmeter_lib::protocol::{decode_volume, DecodeMode};
///
/// let frame = [0x68, 0x0C, 0x13, 0x12, 0x34, 0x56, 0x07, 0x16];
/// assert_eq!(decode_volume(&frame, DecodeMode::Lenient), Ok(7563.412));
/// ```
pub fn decode_volume(frame: &[u8], mode: DecodeMode) -> Result<f64, Error> {
    let (offset, record) = frame
        .windows(VOLUME_RECORD_LEN)
        .enumerate()
        .find(|(_, window)| window[0] == VOLUME_DIF && window[1] == VOLUME_VIF)
        .ok_or(Error::MarkerNotFound(frame.len()))?;

    let mut value: u64 = 0;
    let mut factor: u64 = 1;
    for (index, byte) in record[2..].iter().enumerate() {
        for digit in [byte & 0x0F, (byte >> 4) & 0x0F] {
            if mode == DecodeMode::Strict && digit > 9 {
                return Err(Error::InvalidBcdDigit {
                    offset: offset + 2 + index,
                    digit,
                });
            }
            value += u64::from(digit) * factor;
            factor *= 10;
        }
    }
    Ok(value as f64 / VOLUME_DIVISOR)
}

/// Formats the leading bytes of a frame as `"0C 13 12"` for diagnostics.
pub fn hex_dump(frame: &[u8], limit: usize) -> String {
    frame
        .iter()
        .take(limit)
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn req_ud2_frame() {
        assert_eq!(
            RequestFrame::default().as_bytes(),
            &[0x10, 0x5B, 0x00, 0x5B, 0x16]
        );
        let address = Address::try_from(5).unwrap();
        assert_eq!(
            RequestFrame::req_ud2(address).as_bytes(),
            &[0x10, 0x5B, 0x05, 0x60, 0x16]
        );
        assert_eq!(
            RequestFrame::req_ud2(Address::BROADCAST).as_bytes(),
            &[0x10, 0x5B, 0xFE, 0x59, 0x16]
        );
    }

    #[test]
    fn address_range() {
        assert_matches!(Address::try_from(0), Ok(a) if *a == 0);
        assert_matches!(Address::try_from(250), Ok(a) if *a == 250);
        assert_matches!(Address::try_from(251), Err(Error::AddressOutOfRange(251)));
        assert_matches!(Address::try_from(253), Err(Error::AddressOutOfRange(253)));
        assert_matches!(Address::try_from(254), Ok(Address::BROADCAST));
        assert_matches!(Address::try_from(255), Err(Error::AddressOutOfRange(255)));
        assert_eq!(Address::BROADCAST.to_string(), "0xFE");
    }

    #[test]
    fn baud_rate_conversion() {
        assert_matches!(BaudRate::try_from(2400), Ok(BaudRate::B2400));
        assert_matches!(BaudRate::try_from(19200), Err(Error::BaudRateOutOfRange(19200)));
        assert_eq!(u32::from(BaudRate::B300), 300);
        assert_eq!(BaudRate::default().to_string(), "2400");
    }

    #[test]
    fn decode_traced_digits() {
        // 0x12 -> 2, 1 ; 0x34 -> 4, 3 ; 0x56 -> 6, 5 ; 0x07 -> 7, 0
        // 2 + 10 + 400 + 3_000 + 60_000 + 500_000 + 7_000_000 = 7_563_412
        let frame = [0x68, 0xAA, 0x0C, 0x13, 0x12, 0x34, 0x56, 0x07, 0x16];
        assert_eq!(decode_volume(&frame, DecodeMode::Lenient), Ok(7563.412));
        assert_eq!(decode_volume(&frame, DecodeMode::Strict), Ok(7563.412));
    }

    #[test]
    fn decode_small_value() {
        let frame = [0x0C, 0x13, 0x40, 0x23, 0x01, 0x00];
        assert_eq!(decode_volume(&frame, DecodeMode::Lenient), Ok(12.34));
    }

    #[test]
    fn decode_uses_first_match() {
        let frame = [
            0x0C, 0x13, 0x01, 0x00, 0x00, 0x00, 0x0C, 0x13, 0x99, 0x99, 0x99, 0x99,
        ];
        assert_eq!(decode_volume(&frame, DecodeMode::Lenient), Ok(0.001));
    }

    #[test]
    fn decode_marker_not_found() {
        assert_matches!(
            decode_volume(&[], DecodeMode::Lenient),
            Err(Error::MarkerNotFound(0))
        );
        assert_matches!(
            decode_volume(&[0x68, 0x13, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x16], DecodeMode::Lenient),
            Err(Error::MarkerNotFound(8))
        );
        // Marker present but fewer than four data bytes behind it.
        assert_matches!(
            decode_volume(&[0x00, 0x0C, 0x13, 0x12, 0x34, 0x56], DecodeMode::Lenient),
            Err(Error::MarkerNotFound(6))
        );
    }

    #[test]
    fn decode_no_marker_in_any_filler() {
        for fill in [0x00u8, 0x0C, 0x13, 0xFF] {
            let frame = vec![fill; 64];
            assert_matches!(
                decode_volume(&frame, DecodeMode::Lenient),
                Err(Error::MarkerNotFound(64))
            );
        }
    }

    proptest! {
        #[test]
        fn decode_without_marker_is_not_found(
            frame in prop::collection::vec(any::<u8>(), 0..300).prop_filter(
                "frame holds a volume marker",
                |frame| !frame.windows(2).any(|pair| pair[0] == VOLUME_DIF && pair[1] == VOLUME_VIF),
            ),
            strict in any::<bool>(),
        ) {
            let mode = if strict { DecodeMode::Strict } else { DecodeMode::Lenient };
            prop_assert_eq!(decode_volume(&frame, mode), Err(Error::MarkerNotFound(frame.len())));
        }
    }

    #[test]
    fn decode_invalid_nibbles() {
        // 0x0A is weighted as ten in lenient mode: 10 * 1 = 10 -> 0.01
        let frame = [0x0C, 0x13, 0x0A, 0x00, 0x00, 0x00];
        assert_eq!(decode_volume(&frame, DecodeMode::Lenient), Ok(0.01));
        assert_matches!(
            decode_volume(&frame, DecodeMode::Strict),
            Err(Error::InvalidBcdDigit { offset: 2, digit: 0x0A })
        );
        let frame = [0x00, 0x0C, 0x13, 0x00, 0xF0, 0x00, 0x00];
        assert_matches!(
            decode_volume(&frame, DecodeMode::Strict),
            Err(Error::InvalidBcdDigit { offset: 4, digit: 0x0F })
        );
    }

    #[test]
    fn hex_dump_limit() {
        assert_eq!(hex_dump(&[0x0C, 0x13, 0x12], 32), "0C 13 12");
        assert_eq!(hex_dump(&[0xAB; 40], 2), "AB AB");
        assert_eq!(hex_dump(&[], 32), "");
    }
}
