//! PE32+ on-disk structures
//!
//! Layouts follow the Windows `IMAGE_*` headers. Fields are decoded one by one
//! from little-endian bytes instead of casting packed structs over the buffer,
//! so a truncated or hostile image can only produce an error.

use crate::error::{MapError, Result};

pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // "MZ"
pub const IMAGE_NT_SIGNATURE: u32 = 0x4550; // "PE\0\0"
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20B;
pub const IMAGE_SUBSYSTEM_NATIVE: u16 = 1;
pub const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x0001;

pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;
pub const IMAGE_DIRECTORY_ENTRY_LOAD_CONFIG: usize = 10;
pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
pub const IMAGE_REL_BASED_DIR64: u16 = 10;

pub const IMAGE_ORDINAL_FLAG64: u64 = 1 << 63;

pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

pub const DOS_HEADER_SIZE: usize = 0x40;
pub const FILE_HEADER_SIZE: usize = 20;
pub const SECTION_HEADER_SIZE: usize = 40;
pub const IMPORT_DESCRIPTOR_SIZE: usize = 20;
pub const EXPORT_DIRECTORY_SIZE: usize = 40;
pub const BASE_RELOCATION_SIZE: usize = 8;

/// Fixed part of `IMAGE_OPTIONAL_HEADER64` up to and including
/// `NumberOfRvaAndSizes`.
pub const OPTIONAL_HEADER64_FIXED_SIZE: usize = 112;

// ============================================================================
// Little-endian readers
// ============================================================================

fn field<'a>(bytes: &'a [u8], offset: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    offset
        .checked_add(len)
        .and_then(|end| bytes.get(offset..end))
        .ok_or_else(|| MapError::invalid(format!("{} at {:#x} is out of bounds", what, offset)))
}

pub fn read_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    let b = field(bytes, offset, 2, "u16")?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

pub fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let b = field(bytes, offset, 4, "u32")?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    let b = field(bytes, offset, 8, "u64")?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Ok(u64::from_le_bytes(raw))
}

/// Reads a NUL-terminated ASCII string starting at `offset`.
pub fn read_cstr(bytes: &[u8], offset: usize) -> Result<String> {
    let tail = bytes
        .get(offset..)
        .ok_or_else(|| MapError::invalid(format!("string at {:#x} is out of bounds", offset)))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| MapError::invalid(format!("unterminated string at {:#x}", offset)))?;
    Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
}

// ============================================================================
// Headers
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub struct DosHeader {
    pub e_magic: u16,
    pub e_lfanew: u32,
}

impl DosHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DOS_HEADER_SIZE {
            return Err(MapError::invalid("too small for a DOS header"));
        }
        Ok(Self {
            e_magic: read_u16(bytes, 0)?,
            e_lfanew: read_u32(bytes, 0x3C)?,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

impl FileHeader {
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self> {
        field(bytes, offset, FILE_HEADER_SIZE, "file header")?;
        Ok(Self {
            machine: read_u16(bytes, offset)?,
            number_of_sections: read_u16(bytes, offset + 2)?,
            time_date_stamp: read_u32(bytes, offset + 4)?,
            size_of_optional_header: read_u16(bytes, offset + 16)?,
            characteristics: read_u16(bytes, offset + 18)?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub address_of_entry_point: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub subsystem: u16,
    pub data_directory: [DataDirectory; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

impl OptionalHeader64 {
    pub fn decode(bytes: &[u8], offset: usize, declared_size: usize) -> Result<Self> {
        if declared_size < OPTIONAL_HEADER64_FIXED_SIZE {
            return Err(MapError::invalid("optional header is too small"));
        }
        field(bytes, offset, declared_size, "optional header")?;

        let magic = read_u16(bytes, offset)?;
        if magic != IMAGE_NT_OPTIONAL_HDR64_MAGIC {
            return Err(MapError::invalid(format!(
                "optional header magic {:#x} is not PE32+",
                magic
            )));
        }

        let count = read_u32(bytes, offset + 108)? as usize;
        let count = count.min(IMAGE_NUMBEROF_DIRECTORY_ENTRIES);
        if OPTIONAL_HEADER64_FIXED_SIZE + count * 8 > declared_size {
            return Err(MapError::invalid("data directories exceed the optional header"));
        }

        let mut data_directory = [DataDirectory::default(); IMAGE_NUMBEROF_DIRECTORY_ENTRIES];
        for (i, dir) in data_directory.iter_mut().enumerate().take(count) {
            let at = offset + OPTIONAL_HEADER64_FIXED_SIZE + i * 8;
            *dir = DataDirectory {
                virtual_address: read_u32(bytes, at)?,
                size: read_u32(bytes, at + 4)?,
            };
        }

        Ok(Self {
            magic,
            address_of_entry_point: read_u32(bytes, offset + 16)?,
            image_base: read_u64(bytes, offset + 24)?,
            section_alignment: read_u32(bytes, offset + 32)?,
            file_alignment: read_u32(bytes, offset + 36)?,
            size_of_image: read_u32(bytes, offset + 56)?,
            size_of_headers: read_u32(bytes, offset + 60)?,
            subsystem: read_u16(bytes, offset + 68)?,
            data_directory,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self> {
        let raw = field(bytes, offset, SECTION_HEADER_SIZE, "section header")?;
        let mut name = [0u8; 8];
        name.copy_from_slice(&raw[..8]);
        Ok(Self {
            name,
            virtual_size: read_u32(bytes, offset + 8)?,
            virtual_address: read_u32(bytes, offset + 12)?,
            size_of_raw_data: read_u32(bytes, offset + 16)?,
            pointer_to_raw_data: read_u32(bytes, offset + 20)?,
            characteristics: read_u32(bytes, offset + 36)?,
        })
    }

    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

/// Locations of the headers inside an image, shared by the file parser and the
/// in-kernel export reader.
#[derive(Clone, Copy, Debug)]
pub struct NtHeaders {
    pub file: FileHeader,
    pub optional: OptionalHeader64,
    pub section_table: usize,
}

impl NtHeaders {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let dos = DosHeader::decode(bytes)?;
        if dos.e_magic != IMAGE_DOS_SIGNATURE {
            return Err(MapError::invalid("invalid DOS signature"));
        }

        let nt_offset = dos.e_lfanew as usize;
        let signature = read_u32(bytes, nt_offset)
            .map_err(|_| MapError::invalid("NT headers lie outside the image"))?;
        if signature != IMAGE_NT_SIGNATURE {
            return Err(MapError::invalid("invalid PE signature"));
        }

        let file = FileHeader::decode(bytes, nt_offset + 4)?;
        if file.machine != IMAGE_FILE_MACHINE_AMD64 {
            return Err(MapError::invalid(format!(
                "machine {:#x} is not AMD64",
                file.machine
            )));
        }

        let optional_offset = nt_offset + 4 + FILE_HEADER_SIZE;
        let optional =
            OptionalHeader64::decode(bytes, optional_offset, file.size_of_optional_header as usize)?;

        Ok(Self {
            file,
            optional,
            section_table: optional_offset + file.size_of_optional_header as usize,
        })
    }

    pub fn sections(&self, bytes: &[u8]) -> Result<Vec<SectionHeader>> {
        (0..self.file.number_of_sections as usize)
            .map(|i| SectionHeader::decode(bytes, self.section_table + i * SECTION_HEADER_SIZE))
            .collect()
    }

    pub fn directory(&self, index: usize) -> DataDirectory {
        self.optional.data_directory[index]
    }
}
