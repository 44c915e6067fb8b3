//! CA_PMT generation from a PMT section.
//!
//! Payload layout (everything big-endian):
//! ```text
//! +-----------+---------+------+-----------+-----------------------------+
//! | list_mgmt | program | 0xFF | info_len  | [cmd_id, CA descriptors...] |
//! |    1 B    |   2 B   | 1 B  |    2 B    |        info_len bytes       |
//! +-----------+---------+------+-----------+-----------------------------+
//! then per selected stream:
//! +-------------+-----+-------------+-----------------------------+
//! | stream_type | pid | es_info_len | [cmd_id, CA descriptors...] |
//! |     1 B     | 2 B |     2 B     |      es_info_len bytes      |
//! +-------------+-----+-------------+-----------------------------+
//! ```
//! The cmd_id byte only appears in a block that carries at least one CA
//! descriptor. PIDs are 13 bits and lengths 12 bits; reserved bits are
//! written as zero.

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::error::CaPmtError;
use crate::pmt::{CaDescriptor, Descriptors, PmtSection};
use crate::types::{CaPmtCmd, ListManagement, CA_DESCRIPTOR_TAG};

/// Fixed header: list management, program number, reserved, info length.
pub const CA_PMT_HEADER_SIZE: usize = 6;

/// Size of a per-stream entry header.
pub const CA_PMT_STREAM_HEADER_SIZE: usize = 5;

/// Default byte budget for [`CaPmtBuilder::build`].
pub const DEFAULT_CA_PMT_CAPACITY: usize = 4096;

const MAX_BLOCK_LENGTH: usize = 0x0FFF;

/// Bounds-checked cursor over the destination buffer.
struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl<'b> Writer<'b> {
    fn new(buf: &'b mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn ensure(&self, needed: usize) -> Result<(), CaPmtError> {
        if self.buf.len() - self.pos < needed {
            return Err(CaPmtError::BufferTooSmall {
                offset: self.pos,
                needed,
                capacity: self.buf.len(),
            });
        }
        Ok(())
    }

    fn put_u8(&mut self, v: u8) -> Result<(), CaPmtError> {
        self.ensure(1)?;
        self.buf[self.pos] = v;
        self.pos += 1;
        Ok(())
    }

    fn put_u16(&mut self, v: u16) -> Result<(), CaPmtError> {
        self.put_slice(&v.to_be_bytes())
    }

    fn put_slice(&mut self, data: &[u8]) -> Result<(), CaPmtError> {
        self.ensure(data.len())?;
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(())
    }

    /// Reserve a 2-byte length field and return its position.
    fn placeholder(&mut self) -> Result<usize, CaPmtError> {
        let at = self.pos;
        self.put_u16(0)?;
        Ok(at)
    }

    /// Backfill a placeholder with the number of bytes written after it.
    fn backfill(&mut self, at: usize) -> Result<(), CaPmtError> {
        let len = self.pos - at - 2;
        if len > MAX_BLOCK_LENGTH {
            return Err(CaPmtError::BlockTooLong(len));
        }
        self.buf[at..at + 2].copy_from_slice(&(len as u16).to_be_bytes());
        Ok(())
    }
}

/// Writes one descriptor block: `cmd_id` before the first descriptor, then
/// each CA descriptor with its PID's reserved bits cleared.
struct Block<'w, 'b> {
    writer: &'w mut Writer<'b>,
    cmd_id: CaPmtCmd,
    at: usize,
    started: bool,
}

impl<'w, 'b> Block<'w, 'b> {
    fn open(writer: &'w mut Writer<'b>, cmd_id: CaPmtCmd) -> Result<Self, CaPmtError> {
        let at = writer.placeholder()?;
        Ok(Self {
            writer,
            cmd_id,
            at,
            started: false,
        })
    }

    fn push(&mut self, data: &[u8]) -> Result<(), CaPmtError> {
        let ca = CaDescriptor::parse(data)?;
        if !self.started {
            self.writer.put_u8(self.cmd_id as u8)?;
            self.started = true;
        }
        self.writer.put_u8(CA_DESCRIPTOR_TAG)?;
        self.writer.put_u8(data.len() as u8)?;
        self.writer.put_u16(ca.ca_system_id)?;
        self.writer.put_u16(ca.ca_pid)?;
        self.writer.put_slice(ca.private_data)
    }

    fn close(self) -> Result<(), CaPmtError> {
        self.writer.backfill(self.at)
    }
}

/// Builds CA_PMT payloads.
#[derive(Debug, Clone)]
pub struct CaPmtBuilder<'a> {
    list_management: ListManagement,
    cmd_id: CaPmtCmd,
    move_ca_descriptors: bool,
    ca_system_ids: Option<&'a [u16]>,
    selected_pids: Option<&'a BTreeSet<u16>>,
}

impl<'a> CaPmtBuilder<'a> {
    /// All CA descriptors and all streams are included by default.
    pub fn new(list_management: ListManagement, cmd_id: CaPmtCmd) -> Self {
        Self {
            list_management,
            cmd_id,
            move_ca_descriptors: false,
            ca_system_ids: None,
            selected_pids: None,
        }
    }

    /// Hoist a stream's CA descriptor to program level when it is the only one.
    pub fn move_ca_descriptors(mut self, enable: bool) -> Self {
        self.move_ca_descriptors = enable;
        self
    }

    /// Only copy CA descriptors whose system id is in `ids`.
    pub fn ca_system_ids(mut self, ids: &'a [u16]) -> Self {
        self.ca_system_ids = Some(ids);
        self
    }

    /// Only emit streams whose PID is in `pids`.
    pub fn selected_pids(mut self, pids: &'a BTreeSet<u16>) -> Self {
        self.selected_pids = Some(pids);
        self
    }

    fn is_selected(&self, pid: u16) -> bool {
        self.selected_pids.map_or(true, |set| set.contains(&pid))
    }

    /// CA descriptors of a loop that pass the system id filter.
    fn matching_ca<'p>(&self, raw: &'p [u8]) -> Result<Vec<&'p [u8]>, CaPmtError> {
        let mut out = Vec::new();
        for descriptor in Descriptors::new(raw) {
            let descriptor = descriptor?;
            if !descriptor.is_ca() {
                continue;
            }
            let ca = CaDescriptor::parse(descriptor.data)?;
            if self
                .ca_system_ids
                .map_or(true, |ids| ids.contains(&ca.ca_system_id))
            {
                out.push(descriptor.data);
            }
        }
        Ok(out)
    }

    /// Build into `out`, returning the number of bytes written.
    ///
    /// Nothing in `out` is meaningful when this returns an error.
    pub fn build_into(&self, pmt: &PmtSection, out: &mut [u8]) -> Result<usize, CaPmtError> {
        let program_ca = self.matching_ca(&pmt.program_info)?;

        let mut streams = Vec::new();
        for stream in &pmt.streams {
            if !self.is_selected(stream.elementary_pid & 0x1FFF) {
                continue;
            }
            streams.push((stream, self.matching_ca(&stream.descriptors)?));
        }

        let mut hoisted: Vec<&[u8]> = Vec::new();
        if self.move_ca_descriptors {
            for (_, ca) in streams.iter_mut() {
                if ca.len() == 1 {
                    let descriptor = ca[0];
                    if !program_ca.contains(&descriptor) && !hoisted.contains(&descriptor) {
                        hoisted.push(descriptor);
                    }
                    ca.clear();
                }
            }
        }

        let mut w = Writer::new(out);
        w.put_u8(self.list_management as u8)?;
        w.put_u16(pmt.program_number)?;
        w.put_u8(0xFF)?;

        let mut block = Block::open(&mut w, self.cmd_id)?;
        for descriptor in program_ca.iter().chain(hoisted.iter()) {
            block.push(descriptor)?;
        }
        block.close()?;

        for (stream, ca) in &streams {
            w.put_u8(stream.stream_type)?;
            w.put_u16(stream.elementary_pid & 0x1FFF)?;
            let mut block = Block::open(&mut w, self.cmd_id)?;
            for descriptor in ca {
                block.push(descriptor)?;
            }
            block.close()?;
        }

        Ok(w.pos)
    }

    /// Build into a fresh buffer limited to `capacity` bytes.
    pub fn build(&self, pmt: &PmtSection, capacity: usize) -> Result<Bytes, CaPmtError> {
        let mut buf = vec![0u8; capacity];
        let len = self.build_into(pmt, &mut buf)?;
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }
}

/// One stream entry of a parsed CA_PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaPmtStream {
    pub stream_type: u8,
    pub pid: u16,
    pub cmd_id: Option<CaPmtCmd>,
    /// Raw CA descriptors including tag and length.
    pub descriptors: Vec<Vec<u8>>,
}

/// A parsed CA_PMT payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaPmt {
    pub list_management: ListManagement,
    pub program_number: u16,
    pub cmd_id: Option<CaPmtCmd>,
    /// Raw CA descriptors including tag and length.
    pub descriptors: Vec<Vec<u8>>,
    pub streams: Vec<CaPmtStream>,
}

fn read_u16(data: &[u8], at: usize, what: &'static str) -> Result<u16, CaPmtError> {
    data.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(CaPmtError::Truncated(what))
}

/// Parse a `[cmd_id, descriptors...]` block.
fn parse_block(block: &[u8]) -> Result<(Option<CaPmtCmd>, Vec<Vec<u8>>), CaPmtError> {
    let Some((cmd, rest)) = block.split_first() else {
        return Ok((None, Vec::new()));
    };
    let cmd = CaPmtCmd::try_from(*cmd).map_err(|v| CaPmtError::InvalidValue("ca_pmt_cmd_id", v))?;
    let descriptors = Descriptors::new(rest)
        .map(|d| {
            d.map(|d| {
                let mut raw = Vec::with_capacity(d.total_len());
                raw.push(d.tag);
                raw.push(d.data.len() as u8);
                raw.extend_from_slice(d.data);
                raw
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((Some(cmd), descriptors))
}

impl CaPmt {
    pub fn parse(data: &[u8]) -> Result<Self, CaPmtError> {
        if data.len() < CA_PMT_HEADER_SIZE {
            return Err(CaPmtError::Truncated("header"));
        }
        let list_management = ListManagement::try_from(data[0])
            .map_err(|v| CaPmtError::InvalidValue("ca_pmt_list_management", v))?;
        let program_number = read_u16(data, 1, "program_number")?;
        let info_len = (read_u16(data, 4, "program_info_length")? & 0x0FFF) as usize;

        let mut offset = CA_PMT_HEADER_SIZE;
        let block = data
            .get(offset..offset + info_len)
            .ok_or(CaPmtError::Truncated("program info"))?;
        let (cmd_id, descriptors) = parse_block(block)?;
        offset += info_len;

        let mut streams = Vec::new();
        while offset < data.len() {
            let stream_type = data[offset];
            let pid = read_u16(data, offset + 1, "elementary_pid")? & 0x1FFF;
            let es_len = (read_u16(data, offset + 3, "es_info_length")? & 0x0FFF) as usize;
            offset += CA_PMT_STREAM_HEADER_SIZE;
            let block = data
                .get(offset..offset + es_len)
                .ok_or(CaPmtError::Truncated("es info"))?;
            let (cmd_id, descriptors) = parse_block(block)?;
            offset += es_len;
            streams.push(CaPmtStream {
                stream_type,
                pid,
                cmd_id,
                descriptors,
            });
        }

        Ok(CaPmt {
            list_management,
            program_number,
            cmd_id,
            descriptors,
            streams,
        })
    }
}
