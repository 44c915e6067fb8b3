//! PMT (Program Map Table) section decoding.
//!
//! The CA stack only needs the program number, version/section bookkeeping and
//! the raw descriptor loops; descriptor loops are kept as raw bytes and walked
//! lazily so malformed lengths surface where they are used.

use crate::error::CaPmtError;
use crate::types::CA_DESCRIPTOR_TAG;

/// Table id of a program map section.
pub const PMT_TABLE_ID: u8 = 0x02;

/// A single elementary stream entry in the PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    /// Stream type.
    pub stream_type: u8,
    /// Elementary PID.
    pub elementary_pid: u16,
    /// ES info descriptors (raw loop).
    pub descriptors: Vec<u8>,
}

/// A decoded program map section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PmtSection {
    /// Program number (table_id_extension).
    pub program_number: u16,
    pub version_number: u8,
    pub current_next_indicator: bool,
    pub section_number: u8,
    pub last_section_number: u8,
    pub pcr_pid: u16,
    /// Program info descriptors (raw loop).
    pub program_info: Vec<u8>,
    pub streams: Vec<PmtStream>,
    /// Total section size in bytes, header and CRC included.
    pub section_size: usize,
}

/// One descriptor borrowed from a raw loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor<'a> {
    pub tag: u8,
    /// Descriptor payload without tag and length.
    pub data: &'a [u8],
    /// Offset of the tag within the loop.
    pub offset: usize,
}

impl<'a> Descriptor<'a> {
    /// Tag, length and payload as they appear on the wire.
    pub fn total_len(&self) -> usize {
        2 + self.data.len()
    }

    pub fn is_ca(&self) -> bool {
        self.tag == CA_DESCRIPTOR_TAG
    }
}

/// Iterator over a raw descriptor loop.
#[derive(Debug, Clone)]
pub struct Descriptors<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Descriptors<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = Result<Descriptor<'a>, CaPmtError>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.data.len().checked_sub(self.offset)?;
        if remaining == 0 {
            return None;
        }
        if remaining < 2 {
            let offset = self.offset;
            self.offset = self.data.len();
            return Some(Err(CaPmtError::MalformedDescriptor {
                offset,
                length: 2,
                available: remaining,
            }));
        }
        let tag = self.data[self.offset];
        let length = self.data[self.offset + 1] as usize;
        if remaining < 2 + length {
            let offset = self.offset;
            self.offset = self.data.len();
            return Some(Err(CaPmtError::MalformedDescriptor {
                offset,
                length,
                available: remaining - 2,
            }));
        }
        let start = self.offset + 2;
        let descriptor = Descriptor {
            tag,
            data: &self.data[start..start + length],
            offset: self.offset,
        };
        self.offset = start + length;
        Some(Ok(descriptor))
    }
}

/// Decoded CA descriptor (tag 0x09).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaDescriptor<'a> {
    pub ca_system_id: u16,
    /// 13-bit CA PID.
    pub ca_pid: u16,
    pub private_data: &'a [u8],
}

impl<'a> CaDescriptor<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, CaPmtError> {
        if data.len() < 4 {
            return Err(CaPmtError::ShortCaDescriptor(data.len()));
        }
        Ok(CaDescriptor {
            ca_system_id: u16::from_be_bytes([data[0], data[1]]),
            ca_pid: u16::from_be_bytes([data[2], data[3]]) & 0x1FFF,
            private_data: &data[4..],
        })
    }
}

impl PmtSection {
    /// Parse a complete PMT section starting at `table_id`.
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < 3 {
            return Err("Section too short for header");
        }
        if data[0] != PMT_TABLE_ID {
            return Err("Not a PMT section");
        }
        if data[1] & 0x80 == 0 {
            return Err("PMT requires section syntax indicator");
        }

        let section_length = ((data[1] as usize & 0x0F) << 8) | data[2] as usize;
        let total_length = 3 + section_length;
        // 5 bytes extended header, 4 bytes PMT header, 4 bytes CRC.
        if section_length < 13 {
            return Err("Section length too small");
        }
        if data.len() < total_length {
            return Err("Incomplete section data");
        }

        let crc_offset = total_length - 4;
        let crc32 = u32::from_be_bytes([
            data[crc_offset],
            data[crc_offset + 1],
            data[crc_offset + 2],
            data[crc_offset + 3],
        ]);
        if crc32_mpeg2(&data[..crc_offset]) != crc32 {
            return Err("CRC mismatch");
        }

        let body = &data[8..crc_offset];
        let pcr_pid = ((body[0] as u16 & 0x1F) << 8) | body[1] as u16;
        let program_info_length = ((body[2] as usize & 0x0F) << 8) | body[3] as usize;
        if body.len() < 4 + program_info_length {
            return Err("Invalid program info length");
        }

        let mut pmt = PmtSection {
            program_number: u16::from_be_bytes([data[3], data[4]]),
            version_number: (data[5] >> 1) & 0x1F,
            current_next_indicator: data[5] & 0x01 != 0,
            section_number: data[6],
            last_section_number: data[7],
            pcr_pid,
            program_info: body[4..4 + program_info_length].to_vec(),
            streams: Vec::new(),
            section_size: total_length,
        };

        // Elementary stream loop
        let mut offset = 4 + program_info_length;
        while offset + 5 <= body.len() {
            let stream_type = body[offset];
            let elementary_pid = ((body[offset + 1] as u16 & 0x1F) << 8) | body[offset + 2] as u16;
            let es_info_length = ((body[offset + 3] as usize & 0x0F) << 8) | body[offset + 4] as usize;

            offset += 5;

            if offset + es_info_length > body.len() {
                return Err("Invalid ES info length");
            }

            pmt.streams.push(PmtStream {
                stream_type,
                elementary_pid,
                descriptors: body[offset..offset + es_info_length].to_vec(),
            });
            offset += es_info_length;
        }

        Ok(pmt)
    }

    /// Serialize back into a complete section with a valid CRC.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(0xE0 | ((self.pcr_pid >> 8) as u8 & 0x1F));
        body.push(self.pcr_pid as u8);
        body.push(0xF0 | ((self.program_info.len() >> 8) as u8 & 0x0F));
        body.push(self.program_info.len() as u8);
        body.extend_from_slice(&self.program_info);
        for stream in &self.streams {
            body.push(stream.stream_type);
            body.push(0xE0 | ((stream.elementary_pid >> 8) as u8 & 0x1F));
            body.push(stream.elementary_pid as u8);
            body.push(0xF0 | ((stream.descriptors.len() >> 8) as u8 & 0x0F));
            body.push(stream.descriptors.len() as u8);
            body.extend_from_slice(&stream.descriptors);
        }

        let section_length = 5 + body.len() + 4;
        let mut out = Vec::with_capacity(3 + section_length);
        out.push(PMT_TABLE_ID);
        out.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
        out.push(section_length as u8);
        out.extend_from_slice(&self.program_number.to_be_bytes());
        out.push(0xC0 | ((self.version_number & 0x1F) << 1) | self.current_next_indicator as u8);
        out.push(self.section_number);
        out.push(self.last_section_number);
        out.extend_from_slice(&body);
        let crc = crc32_mpeg2(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    /// Program-level descriptors.
    pub fn descriptors(&self) -> Descriptors<'_> {
        Descriptors::new(&self.program_info)
    }

    /// CA system ids found anywhere in this section. Malformed loops are skipped.
    pub fn ca_system_ids(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(&self.program_info[..])
            .chain(self.streams.iter().map(|s| &s.descriptors[..]))
            .flat_map(|raw| Descriptors::new(raw).filter_map(Result::ok))
            .filter(|d| d.is_ca())
            .filter_map(|d| CaDescriptor::parse(d.data).ok())
            .map(|ca| ca.ca_system_id)
    }
}

impl PmtStream {
    pub fn descriptors(&self) -> Descriptors<'_> {
        Descriptors::new(&self.descriptors)
    }
}

/// Calculate CRC32 for MPEG-2 (polynomial 0x04C11DB7).
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    static CRC_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = (i as u32) << 24;
            let mut j = 0;
            while j < 8 {
                if crc & 0x80000000 != 0 {
                    crc = (crc << 1) ^ 0x04C11DB7;
                } else {
                    crc <<= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        let index = ((crc >> 24) ^ byte as u32) as usize;
        crc = (crc << 8) ^ CRC_TABLE[index];
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PmtSection {
        PmtSection {
            program_number: 0x0101,
            version_number: 3,
            current_next_indicator: true,
            section_number: 0,
            last_section_number: 0,
            pcr_pid: 0x0100,
            program_info: vec![0x09, 0x04, 0x01, 0x00, 0xE0, 0x20],
            streams: vec![
                PmtStream {
                    stream_type: 0x1B,
                    elementary_pid: 0x0100,
                    descriptors: vec![],
                },
                PmtStream {
                    stream_type: 0x0F,
                    elementary_pid: 0x0110,
                    descriptors: vec![0x09, 0x04, 0x05, 0x00, 0xE0, 0x30, 0x52, 0x01, 0x10],
                },
            ],
            section_size: 0,
        }
    }

    #[test]
    fn test_parse_serialized_section() {
        let mut pmt = sample();
        let bytes = pmt.to_bytes();
        pmt.section_size = bytes.len();

        let parsed = PmtSection::parse(&bytes).unwrap();
        assert_eq!(parsed, pmt);
        assert_eq!(parsed.version_number, 3);
        assert_eq!(parsed.streams[1].elementary_pid, 0x0110);
    }

    #[test]
    fn test_parse_rejects_bad_crc() {
        let mut bytes = sample().to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert_eq!(PmtSection::parse(&bytes), Err("CRC mismatch"));
    }

    #[test]
    fn test_parse_rejects_other_table() {
        let mut bytes = sample().to_bytes();
        bytes[0] = 0x00;
        assert_eq!(PmtSection::parse(&bytes), Err("Not a PMT section"));
    }

    #[test]
    fn test_ca_system_ids() {
        let ids: Vec<u16> = sample().ca_system_ids().collect();
        assert_eq!(ids, vec![0x0100, 0x0500]);
    }

    #[test]
    fn test_descriptor_iter_malformed() {
        let data = [0x52, 0x01, 0x10, 0x09, 0x08, 0x01];
        let mut it = Descriptors::new(&data);
        let first = it.next().unwrap().unwrap();
        assert_eq!(first.tag, 0x52);
        assert_eq!(first.total_len(), 3);
        assert!(matches!(
            it.next(),
            Some(Err(CaPmtError::MalformedDescriptor { offset: 3, length: 8, .. }))
        ));
        assert!(it.next().is_none());
    }

    #[test]
    fn test_ca_descriptor_masks_pid() {
        let ca = CaDescriptor::parse(&[0x01, 0x00, 0xE0, 0x20, 0xAA]).unwrap();
        assert_eq!(ca.ca_system_id, 0x0100);
        assert_eq!(ca.ca_pid, 0x0020);
        assert_eq!(ca.private_data, &[0xAA]);
        assert!(CaDescriptor::parse(&[0x01, 0x00]).is_err());
    }
}
