//! Certificate serial numbers.
//!
//! A [`Serial`] is the unsigned magnitude of an X.509 `CertificateSerialNumber`
//! in big-endian form without leading zero bytes. It renders and parses as a
//! decimal string, which is the form used in the revocation ledger and in
//! operation results.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use openssl::asn1::{Asn1Integer, Asn1IntegerRef};
use openssl::bn::{BigNum, BigNumRef, MsbOption};
use serde::{Serialize, Serializer};

use crate::error::{LifecycleError, Result};

/// Random bits drawn for a fresh serial. 159 bits keeps the DER encoding of
/// a positive value within the 20 octets allowed by RFC 5280.
pub const SERIAL_BITS: i32 = 159;

/// CA-scoped certificate serial number.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Serial {
    magnitude: Vec<u8>,
}

impl Serial {
    /// Draw a fresh non-zero random serial from the OpenSSL CSPRNG.
    pub fn random() -> Result<Self> {
        loop {
            let mut bn = BigNum::new()?;
            bn.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
            if bn.num_bits() > 0 {
                return Ok(Self::from_bignum(&bn));
            }
        }
    }

    pub fn from_bignum(bn: &BigNumRef) -> Self {
        let magnitude = bn.to_vec();
        Serial {
            magnitude: strip_leading_zeros(magnitude),
        }
    }

    pub fn from_asn1(int: &Asn1IntegerRef) -> Result<Self> {
        Ok(Self::from_bignum(&*int.to_bn()?))
    }

    pub fn to_bignum(&self) -> Result<BigNum> {
        Ok(BigNum::from_slice(&self.magnitude)?)
    }

    pub fn to_asn1(&self) -> Result<Asn1Integer> {
        Ok(self.to_bignum()?.to_asn1_integer()?)
    }

    /// Big-endian magnitude, empty for zero.
    pub fn as_bytes(&self) -> &[u8] {
        &self.magnitude
    }

    /// Two's-complement content octets of the DER INTEGER for this positive
    /// value (a 0x00 pad is prepended when the top bit is set).
    pub fn der_integer_bytes(&self) -> Vec<u8> {
        match self.magnitude.first() {
            None => vec![0],
            Some(b) if b & 0x80 != 0 => {
                let mut out = Vec::with_capacity(self.magnitude.len() + 1);
                out.push(0);
                out.extend_from_slice(&self.magnitude);
                out
            }
            Some(_) => self.magnitude.clone(),
        }
    }

    pub fn to_decimal(&self) -> Result<String> {
        Ok(self.to_bignum()?.to_dec_str()?.to_string())
    }
}

fn strip_leading_zeros(mut bytes: Vec<u8>) -> Vec<u8> {
    let first_nonzero = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes.drain(..first_nonzero);
    bytes
}

impl Ord for Serial {
    fn cmp(&self, other: &Self) -> Ordering {
        self.magnitude
            .len()
            .cmp(&other.magnitude.len())
            .then_with(|| self.magnitude.cmp(&other.magnitude))
    }
}

impl PartialOrd for Serial {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dec = self.to_decimal().map_err(|_| fmt::Error)?;
        f.write_str(&dec)
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({})", self)
    }
}

impl FromStr for Serial {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LifecycleError::Encoding(format!(
                "'{}' is not a decimal serial number",
                s
            )));
        }
        let bn = BigNum::from_dec_str(s)?;
        Ok(Self::from_bignum(&bn))
    }
}

impl Serialize for Serial {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_serial_fits_rfc5280_limit() {
        for _ in 0..32 {
            let serial = Serial::random().unwrap();
            assert!(!serial.as_bytes().is_empty());
            assert!(serial.der_integer_bytes().len() <= 20);
        }
    }

    #[test]
    fn test_decimal_parse_and_display() {
        let serial: Serial = "000123456789012345678901234567890".parse().unwrap();
        assert_eq!(serial.to_string(), "123456789012345678901234567890");
    }

    #[test]
    fn test_rejects_non_decimal() {
        assert!("".parse::<Serial>().is_err());
        assert!("-5".parse::<Serial>().is_err());
        assert!("12a".parse::<Serial>().is_err());
        assert!(" 12".parse::<Serial>().is_err());
    }

    #[test]
    fn test_numeric_ordering() {
        let small: Serial = "9".parse().unwrap();
        let big: Serial = "256".parse().unwrap();
        let bigger: Serial = "257".parse().unwrap();
        assert!(small < big);
        assert!(big < bigger);
    }

    #[test]
    fn test_der_integer_padding() {
        let serial: Serial = "128".parse().unwrap();
        assert_eq!(serial.der_integer_bytes(), vec![0x00, 0x80]);
        let serial: Serial = "127".parse().unwrap();
        assert_eq!(serial.der_integer_bytes(), vec![0x7f]);
    }

    #[test]
    fn test_asn1_conversion_preserves_value() {
        let serial = Serial::random().unwrap();
        let asn1 = serial.to_asn1().unwrap();
        assert_eq!(Serial::from_asn1(&asn1).unwrap(), serial);
    }
}
