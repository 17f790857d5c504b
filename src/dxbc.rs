//! DXBC container, the outer wrapper of DXIL programs.
//!
//! Only the `DXIL` part is ever looked into, every other part (signatures,
//! `PSV0`, hashes, debug info, etc.) is carried through verbatim.

use bytemuck::{Pod, Zeroable};

#[derive(Debug, thiserror::Error)]
pub enum DxbcError {
    #[error("missing DXBC magic")]
    MissingMagic,
    #[error("truncated DXBC container (needed {needed} bytes, have {len})")]
    Truncated { needed: usize, len: usize },
    #[error("part {index} out of bounds")]
    PartOutOfBounds { index: usize },
    #[error("no DXIL program part")]
    MissingProgram,
    #[error("malformed DXIL program header")]
    MalformedProgramHeader,
}

pub const DXBC_MAGIC: [u8; 4] = *b"DXBC";

pub mod fourcc {
    pub const DXIL: [u8; 4] = *b"DXIL";
    pub const ILDB: [u8; 4] = *b"ILDB";
    pub const PSV0: [u8; 4] = *b"PSV0";
    pub const HASH: [u8; 4] = *b"HASH";
}

const DXIL_MAGIC: [u8; 4] = *b"DXIL";

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
struct ContainerHeader {
    magic: [u8; 4],
    digest: [u8; 16],
    major_version: u16,
    minor_version: u16,
    total_size: u32,
    part_count: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
struct PartHeader {
    fourcc: [u8; 4],
    size: u32,
}

/// Header in front of the bitcode, inside a `DXIL` (or `ILDB`) part.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ProgramHeader {
    /// Low 16 bits: shader model version, high 16 bits: shader kind.
    pub program_version: u32,

    /// Size of the whole part, in words.
    pub size_in_uint32: u32,

    pub dxil_magic: [u8; 4],
    pub dxil_version: u32,

    /// Offset of the bitcode, from `dxil_magic`.
    pub bitcode_offset: u32,
    pub bitcode_size: u32,
}

impl ProgramHeader {
    /// Bytes between the start of the header and `dxil_magic`.
    const BITCODE_OFFSET_BASE: usize = 8;

    pub fn shader_kind(&self) -> u16 {
        (self.program_version >> 16) as u16
    }

    pub fn shader_model(&self) -> (u8, u8) {
        (
            ((self.program_version >> 4) & 0xf) as u8,
            (self.program_version & 0xf) as u8,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub fourcc: [u8; 4],
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    pub digest: [u8; 16],
    pub version: (u16, u16),
    pub parts: Vec<Part>,
}

fn read_pod<T: Pod>(bytes: &[u8], offset: usize) -> Result<T, DxbcError> {
    let needed = offset + std::mem::size_of::<T>();
    let src = bytes.get(offset..needed).ok_or(DxbcError::Truncated {
        needed,
        len: bytes.len(),
    })?;
    Ok(bytemuck::pod_read_unaligned(src))
}

impl Container {
    pub fn is_container(bytes: &[u8]) -> bool {
        bytes.starts_with(&DXBC_MAGIC)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DxbcError> {
        let header: ContainerHeader = read_pod(bytes, 0)?;
        if header.magic != DXBC_MAGIC {
            return Err(DxbcError::MissingMagic);
        }

        let offsets_start = std::mem::size_of::<ContainerHeader>();
        let parts = (0..header.part_count as usize)
            .map(|index| {
                let offset: u32 = read_pod(bytes, offsets_start + index * 4)?;
                let offset = offset as usize;
                let part: PartHeader = read_pod(bytes, offset)?;
                let start = offset + std::mem::size_of::<PartHeader>();
                let data = bytes
                    .get(start..start + part.size as usize)
                    .ok_or(DxbcError::PartOutOfBounds { index })?;
                Ok(Part {
                    fourcc: part.fourcc,
                    data: data.to_vec(),
                })
            })
            .collect::<Result<_, DxbcError>>()?;

        Ok(Container {
            digest: header.digest,
            version: (header.major_version, header.minor_version),
            parts,
        })
    }

    fn program_part(&self) -> Option<&Part> {
        self.parts.iter().find(|p| p.fourcc == fourcc::DXIL)
    }

    /// The `DXIL` part's header and bitcode.
    pub fn program(&self) -> Result<(ProgramHeader, &[u8]), DxbcError> {
        let part = self.program_part().ok_or(DxbcError::MissingProgram)?;
        let header: ProgramHeader = read_pod(&part.data, 0)?;
        if header.dxil_magic != DXIL_MAGIC {
            return Err(DxbcError::MalformedProgramHeader);
        }
        let start = ProgramHeader::BITCODE_OFFSET_BASE + header.bitcode_offset as usize;
        let bitcode = part
            .data
            .get(start..start + header.bitcode_size as usize)
            .ok_or(DxbcError::MalformedProgramHeader)?;
        Ok((header, bitcode))
    }

    /// Replace the bitcode of the `DXIL` part, fixing up the program header.
    pub fn replace_program(&mut self, bitcode: &[u8]) -> Result<(), DxbcError> {
        let (mut header, _) = self.program()?;

        let start = ProgramHeader::BITCODE_OFFSET_BASE + header.bitcode_offset as usize;
        let total = start + bitcode.len();
        header.bitcode_size = bitcode.len() as u32;
        header.size_in_uint32 = total.div_ceil(4) as u32;

        let part = self
            .parts
            .iter_mut()
            .find(|p| p.fourcc == fourcc::DXIL)
            .ok_or(DxbcError::MissingProgram)?;

        // Anything between the header and the bitcode is kept as-is.
        let mut data = part.data[..start].to_vec();
        data[..std::mem::size_of::<ProgramHeader>()].copy_from_slice(bytemuck::bytes_of(&header));
        data.extend_from_slice(bitcode);
        data.resize(header.size_in_uint32 as usize * 4, 0);
        part.data = data;
        Ok(())
    }

    pub fn write(&self) -> Vec<u8> {
        let header_size = std::mem::size_of::<ContainerHeader>() + self.parts.len() * 4;
        let part_header_size = std::mem::size_of::<PartHeader>();

        let mut offsets = Vec::with_capacity(self.parts.len());
        let mut total = header_size;
        for part in &self.parts {
            offsets.push(total as u32);
            total += part_header_size + part.data.len();
        }

        let header = ContainerHeader {
            magic: DXBC_MAGIC,
            digest: self.digest,
            major_version: self.version.0,
            minor_version: self.version.1,
            total_size: total as u32,
            part_count: self.parts.len() as u32,
        };

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(bytemuck::bytes_of(&header));
        for offset in offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        for part in &self.parts {
            let part_header = PartHeader {
                fourcc: part.fourcc,
                size: part.data.len() as u32,
            };
            out.extend_from_slice(bytemuck::bytes_of(&part_header));
            out.extend_from_slice(&part.data);
        }
        out
    }
}

/// Build a minimal container around `bitcode` (used by tests and tools that
/// start from raw bitcode).
pub fn wrap_bitcode(program_version: u32, bitcode: &[u8]) -> Container {
    let header_size = std::mem::size_of::<ProgramHeader>();
    let header = ProgramHeader {
        program_version,
        size_in_uint32: ((header_size + bitcode.len()).div_ceil(4)) as u32,
        dxil_magic: DXIL_MAGIC,
        dxil_version: 0x100,
        bitcode_offset: (header_size - ProgramHeader::BITCODE_OFFSET_BASE) as u32,
        bitcode_size: bitcode.len() as u32,
    };
    let mut data = bytemuck::bytes_of(&header).to_vec();
    data.extend_from_slice(bitcode);
    data.resize(header.size_in_uint32 as usize * 4, 0);

    Container {
        digest: [0; 16],
        version: (1, 0),
        parts: vec![Part {
            fourcc: fourcc::DXIL,
            data,
        }],
    }
}
