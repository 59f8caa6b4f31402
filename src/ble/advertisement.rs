//! Advertisement payload parsing
//!
//! Raw advertising data is a sequence of AD structures:
//! `[len][type][len - 1 bytes of data]`.

use log::warn;

use super::address::DeviceAddress;

const AD_SHORT_LOCAL_NAME: u8 = 0x08;
const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// A received advertisement report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Address of the advertising device.
    pub address: DeviceAddress,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
    /// Raw AD structures.
    pub data: Vec<u8>,
}

impl Advertisement {
    /// The advertised local name, preferring the complete over the short form.
    pub fn local_name(&self) -> Option<String> {
        let complete = find_record(&self.data, AD_COMPLETE_LOCAL_NAME);
        complete
            .or_else(|| find_record(&self.data, AD_SHORT_LOCAL_NAME))
            .filter(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned())
    }

    /// Manufacturer-specific data, company identifier included.
    pub fn manufacturer_data(&self) -> Option<&[u8]> {
        find_record(&self.data, AD_MANUFACTURER_DATA)
    }
}

/// Iterate over well-formed AD structures as `(type, data)` pairs.
///
/// Iteration stops at the first zero-length or truncated structure.
pub fn records(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut i = 0;
    std::iter::from_fn(move || {
        let len = *data.get(i)? as usize;
        if len == 0 || i + len >= data.len() {
            return None;
        }
        let ad_type = data[i + 1];
        let body = &data[i + 2..i + 1 + len];
        i += len + 1;
        Some((ad_type, body))
    })
}

fn find_record(data: &[u8], wanted: u8) -> Option<&[u8]> {
    records(data).find(|(ad_type, _)| *ad_type == wanted).map(|(_, body)| body)
}

/// Build raw AD data from a local name and optional manufacturer data.
///
/// A field too long for one AD structure is left out.
pub fn encode(local_name: Option<&str>, manufacturer_data: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(name) = local_name {
        push_record(&mut out, AD_COMPLETE_LOCAL_NAME, name.as_bytes());
    }
    if let Some(data) = manufacturer_data {
        push_record(&mut out, AD_MANUFACTURER_DATA, data);
    }
    out
}

fn push_record(out: &mut Vec<u8>, ad_type: u8, body: &[u8]) {
    let Ok(len) = u8::try_from(body.len() + 1) else {
        warn!(
            "Dropping AD type 0x{:02x}: {} bytes do not fit one structure",
            ad_type,
            body.len()
        );
        return;
    };
    out.push(len);
    out.push(ad_type);
    out.extend_from_slice(body);
}
