//! Identity object decoding.
//!
//! The same device identity arrives in two shapes: inside a ListIdentity
//! item during discovery (with a socket address and device state prepended
//! by the encapsulation layer) and as the raw attribute dump returned by
//! Get_Attributes_All on the Identity object.

use std::net::Ipv4Addr;

use crate::error::{CipError, Result};

/// Decoded CIP Identity object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityObject {
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    /// Major and minor revision.
    pub revision: (u8, u8),
    pub status: u16,
    pub serial_number: u32,
    pub product_name: String,
    /// Device state; only present in ListIdentity replies.
    pub state: Option<u8>,
    /// Address the device reported; only present in ListIdentity replies.
    pub ip_address: Option<Ipv4Addr>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(CipError::response(format!(
                "identity data truncated at byte {}",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Short string: u8 length prefix, then that many bytes.
    fn short_string(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

impl IdentityObject {
    /// Decodes the common identity attributes shared by both shapes.
    fn decode_attributes(r: &mut Reader<'_>) -> Result<IdentityObject> {
        Ok(IdentityObject {
            vendor_id: r.u16_le()?,
            device_type: r.u16_le()?,
            product_code: r.u16_le()?,
            revision: (r.u8()?, r.u8()?),
            status: r.u16_le()?,
            serial_number: r.u32_le()?,
            product_name: r.short_string()?,
            state: None,
            ip_address: None,
        })
    }

    /// Decodes a ListIdentity item: encapsulation version, the big-endian
    /// socket address the device reports, the identity attributes, and the
    /// trailing device state byte.
    pub fn from_list_identity(data: &[u8]) -> Result<IdentityObject> {
        let mut r = Reader::new(data);
        let _encap_version = r.u16_le()?;

        // sockaddr_in, big-endian: family, port, address, 8 zero bytes.
        let _family = r.take(2)?;
        let _port = r.take(2)?;
        let addr = r.take(4)?;
        let ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
        let _zero = r.take(8)?;

        let mut identity = Self::decode_attributes(&mut r)?;
        identity.state = Some(r.u8()?);
        identity.ip_address = Some(ip);
        Ok(identity)
    }

    /// Decodes a Get_Attributes_All reply from the Identity object.
    pub fn from_attributes_all(data: &[u8]) -> Result<IdentityObject> {
        Self::decode_attributes(&mut Reader::new(data))
    }
}
