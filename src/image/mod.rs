//! Image parser and validator
//!
//! Turns raw driver bytes into an [`ImageDescriptor`]: the immutable view of
//! headers, sections, imports and base relocations that the rest of the
//! mapper works from. Every offset is bounds-checked here so later stages can
//! index the staging buffer without re-validating.

pub mod pe;

#[cfg(test)]
pub(crate) mod testimage;

use bitflags::bitflags;

use crate::error::{MapError, Result};
use pe::{DataDirectory, NtHeaders, SectionHeader};

bitflags! {
    /// Page protection requested by a section.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SectionProtection: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

impl SectionProtection {
    pub fn from_characteristics(characteristics: u32) -> Self {
        let mut prot = SectionProtection::empty();
        if characteristics & pe::IMAGE_SCN_MEM_READ != 0 {
            prot |= SectionProtection::READ;
        }
        if characteristics & pe::IMAGE_SCN_MEM_WRITE != 0 {
            prot |= SectionProtection::WRITE;
        }
        if characteristics & pe::IMAGE_SCN_MEM_EXECUTE != 0 {
            prot |= SectionProtection::EXECUTE;
        }
        prot
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub file_offset: u32,
    pub virtual_address: u32,
    pub raw_size: u32,
    pub virtual_size: u32,
    pub protection: SectionProtection,
}

impl Section {
    /// Bytes the section occupies once mapped.
    pub fn mapped_size(&self) -> u32 {
        if self.virtual_size == 0 {
            self.raw_size
        } else {
            self.virtual_size
        }
    }

    /// Bytes copied from the file; the rest of the mapped range is demand-zero.
    pub fn copy_size(&self) -> u32 {
        self.raw_size.min(self.mapped_size())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImportName {
    Name(String),
    Ordinal(u16),
}

impl std::fmt::Display for ImportName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportName::Name(name) => f.write_str(name),
            ImportName::Ordinal(ordinal) => write!(f, "#{}", ordinal),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportedSymbol {
    pub module: String,
    pub symbol: ImportName,
    /// RVA of the 8-byte IAT slot that receives the resolved address.
    pub patch_rva: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocationKind {
    HighLow,
    Dir64,
}

impl RelocationKind {
    pub fn width(self) -> u32 {
        match self {
            RelocationKind::HighLow => 32,
            RelocationKind::Dir64 => 64,
        }
    }

    fn byte_len(self) -> u32 {
        self.width() / 8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relocation {
    pub rva: u32,
    pub kind: RelocationKind,
}

/// Parsed view over a driver image. Created once per mapping and never
/// mutated afterwards.
#[derive(Clone, Debug)]
pub struct ImageDescriptor {
    pub preferred_base: u64,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub entry_point: u32,
    pub sections: Vec<Section>,
    pub imports: Vec<ImportedSymbol>,
    pub relocations: Vec<Relocation>,
    pub relocatable: bool,
    pub load_config: Option<DataDirectory>,
}

impl ImageDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let nt = NtHeaders::decode(bytes)?;
        let opt = &nt.optional;

        if opt.subsystem != pe::IMAGE_SUBSYSTEM_NATIVE {
            return Err(MapError::invalid(format!(
                "subsystem {} is not a kernel-mode (native) image",
                opt.subsystem
            )));
        }
        if opt.size_of_image == 0 {
            return Err(MapError::invalid("image declares a zero virtual size"));
        }
        if opt.size_of_headers as usize > bytes.len() || opt.size_of_headers > opt.size_of_image {
            return Err(MapError::invalid(format!(
                "header size {:#x} exceeds the image",
                opt.size_of_headers
            )));
        }
        let table_end = nt.section_table + nt.file.number_of_sections as usize * pe::SECTION_HEADER_SIZE;
        if table_end > opt.size_of_headers as usize {
            return Err(MapError::invalid("section table extends past the headers"));
        }

        let sections = validate_sections(&nt.sections(bytes)?, bytes.len(), opt.size_of_headers, opt.size_of_image)?;

        if opt.address_of_entry_point == 0 || opt.address_of_entry_point >= opt.size_of_image {
            return Err(MapError::invalid(format!(
                "entry point {:#x} is outside the mapped range",
                opt.address_of_entry_point
            )));
        }

        let mut descriptor = Self {
            preferred_base: opt.image_base,
            size_of_image: opt.size_of_image,
            size_of_headers: opt.size_of_headers,
            entry_point: opt.address_of_entry_point,
            sections,
            imports: Vec::new(),
            relocations: Vec::new(),
            relocatable: false,
            load_config: None,
        };

        let reloc_dir = nt.directory(pe::IMAGE_DIRECTORY_ENTRY_BASERELOC);
        descriptor.relocatable = reloc_dir.is_present()
            && nt.file.characteristics & pe::IMAGE_FILE_RELOCS_STRIPPED == 0;
        if reloc_dir.is_present() {
            descriptor.relocations = descriptor.parse_relocations(bytes, reloc_dir)?;
        }

        let import_dir = nt.directory(pe::IMAGE_DIRECTORY_ENTRY_IMPORT);
        if import_dir.is_present() {
            descriptor.imports = descriptor.parse_imports(bytes, import_dir)?;
        }

        let load_config = nt.directory(pe::IMAGE_DIRECTORY_ENTRY_LOAD_CONFIG);
        if load_config.is_present() {
            descriptor.check_range(load_config.virtual_address, load_config.size, "load config directory")?;
            descriptor.load_config = Some(load_config);
        }

        log::debug!(
            "[Image] {} sections, {} imports, {} relocations, entry {:#x}",
            descriptor.sections.len(),
            descriptor.imports.len(),
            descriptor.relocations.len(),
            descriptor.entry_point
        );

        Ok(descriptor)
    }

    /// Fails with `NotRelocatable` when the image carries no relocations and
    /// the allocator cannot place it at its preferred base.
    pub fn ensure_relocatable(&self, guarantees_preferred_base: bool) -> Result<()> {
        if self.relocatable || guarantees_preferred_base {
            Ok(())
        } else {
            Err(MapError::NotRelocatable)
        }
    }

    /// Copies headers and sections into a zero-filled buffer laid out by
    /// virtual address.
    pub fn lay_out(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut staged = vec![0u8; self.size_of_image as usize];
        let headers = self.size_of_headers as usize;
        staged[..headers].copy_from_slice(&bytes[..headers]);

        for section in &self.sections {
            let len = section.copy_size() as usize;
            let src = section.file_offset as usize;
            let dst = section.virtual_address as usize;
            let data = bytes
                .get(src..src + len)
                .ok_or_else(|| MapError::invalid(format!("section {} raw data is truncated", section.name)))?;
            staged[dst..dst + len].copy_from_slice(data);
        }

        Ok(staged)
    }

    /// Translates an RVA into an offset in the raw file.
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        if rva < self.size_of_headers {
            return Some(rva as usize);
        }
        self.sections.iter().find_map(|s| {
            let start = s.virtual_address;
            (rva >= start && rva - start < s.copy_size()).then(|| (s.file_offset + (rva - start)) as usize)
        })
    }

    fn check_range(&self, rva: u32, len: u32, what: &str) -> Result<()> {
        match rva.checked_add(len) {
            Some(end) if end <= self.size_of_image => Ok(()),
            _ => Err(MapError::invalid(format!(
                "{} at rva {:#x} (+{:#x}) lies outside the image",
                what, rva, len
            ))),
        }
    }

    fn file_offset(&self, rva: u32, what: &str) -> Result<usize> {
        self.rva_to_offset(rva)
            .ok_or_else(|| MapError::invalid(format!("{} at rva {:#x} has no file backing", what, rva)))
    }

    /// File bytes backing `rva..rva + len`. The range must stay inside the raw
    /// data of the headers or of a single section.
    fn file_range<'a>(&self, bytes: &'a [u8], rva: u32, len: u32, what: &str) -> Result<&'a [u8]> {
        let backed = if rva < self.size_of_headers {
            Some((rva as usize, self.size_of_headers - rva))
        } else {
            self.sections.iter().find_map(|s| {
                let offset = rva.checked_sub(s.virtual_address)?;
                (offset < s.copy_size()).then(|| ((s.file_offset + offset) as usize, s.copy_size() - offset))
            })
        };
        match backed {
            Some((start, available)) if len <= available => bytes
                .get(start..start + len as usize)
                .ok_or_else(|| MapError::invalid(format!("{} at rva {:#x} is truncated", what, rva))),
            _ => Err(MapError::invalid(format!(
                "{} at rva {:#x} (+{:#x}) is not backed by one section's raw data",
                what, rva, len
            ))),
        }
    }

    /// Fails unless `rva..rva + len` lies in the mapped range of one section.
    fn check_in_section(&self, rva: u32, len: u32, what: &str) -> Result<()> {
        let end = u64::from(rva) + u64::from(len);
        let inside = rva >= self.size_of_headers
            && self.sections.iter().any(|s| {
                rva >= s.virtual_address && end <= u64::from(s.virtual_address) + u64::from(s.mapped_size())
            });
        if inside {
            Ok(())
        } else {
            Err(MapError::invalid(format!("{} at rva {:#x} is outside every section", what, rva)))
        }
    }

    fn parse_relocations(&self, bytes: &[u8], dir: DataDirectory) -> Result<Vec<Relocation>> {
        self.check_range(dir.virtual_address, dir.size, "relocation directory")?;
        let table = self.file_range(bytes, dir.virtual_address, dir.size, "relocation directory")?;

        let mut relocations = Vec::new();
        let mut cursor = 0usize;
        while cursor + pe::BASE_RELOCATION_SIZE <= table.len() {
            let page = pe::read_u32(table, cursor)?;
            let block_size = pe::read_u32(table, cursor + 4)? as usize;
            if block_size == 0 {
                break;
            }
            if block_size < pe::BASE_RELOCATION_SIZE || cursor + block_size > table.len() {
                return Err(MapError::invalid(format!(
                    "relocation block at {:#x} has bad size {:#x}",
                    cursor, block_size
                )));
            }

            let entries = (block_size - pe::BASE_RELOCATION_SIZE) / 2;
            for i in 0..entries {
                let entry = pe::read_u16(table, cursor + pe::BASE_RELOCATION_SIZE + i * 2)?;
                let kind = match entry >> 12 {
                    pe::IMAGE_REL_BASED_ABSOLUTE => continue,
                    pe::IMAGE_REL_BASED_HIGHLOW => RelocationKind::HighLow,
                    pe::IMAGE_REL_BASED_DIR64 => RelocationKind::Dir64,
                    other => {
                        return Err(MapError::invalid(format!("unsupported relocation type {}", other)))
                    }
                };
                let rva = page
                    .checked_add(u32::from(entry & 0x0FFF))
                    .ok_or_else(|| MapError::invalid("relocation rva overflows"))?;
                self.check_range(rva, kind.byte_len(), "relocation target")?;
                relocations.push(Relocation { rva, kind });
            }

            cursor += block_size;
        }

        Ok(relocations)
    }

    fn parse_imports(&self, bytes: &[u8], dir: DataDirectory) -> Result<Vec<ImportedSymbol>> {
        self.check_range(dir.virtual_address, dir.size, "import directory")?;
        let mut imports = Vec::new();
        let mut descriptor_rva = dir.virtual_address;

        loop {
            let at = self.file_offset(descriptor_rva, "import descriptor")?;
            let original_first_thunk = pe::read_u32(bytes, at)?;
            let name_rva = pe::read_u32(bytes, at + 12)?;
            let first_thunk = pe::read_u32(bytes, at + 16)?;
            if name_rva == 0 && first_thunk == 0 {
                break;
            }
            if name_rva == 0 || first_thunk == 0 {
                return Err(MapError::invalid(format!(
                    "import descriptor at rva {:#x} has a zero name or address table",
                    descriptor_rva
                )));
            }

            let module = pe::read_cstr(bytes, self.file_offset(name_rva, "import module name")?)?;
            let lookup_rva = if original_first_thunk != 0 { original_first_thunk } else { first_thunk };

            let mut index = 0u32;
            loop {
                let thunk_rva = lookup_rva + index * 8;
                let thunk = pe::read_u64(bytes, self.file_offset(thunk_rva, "import thunk")?)?;
                if thunk == 0 {
                    break;
                }

                let symbol = if thunk & pe::IMAGE_ORDINAL_FLAG64 != 0 {
                    ImportName::Ordinal((thunk & 0xFFFF) as u16)
                } else {
                    let hint_rva = u32::try_from(thunk)
                        .map_err(|_| MapError::invalid(format!("import thunk {:#x} is malformed", thunk)))?;
                    let hint_name = self.file_offset(hint_rva, "import by name")?;
                    ImportName::Name(pe::read_cstr(bytes, hint_name + 2)?)
                };

                let patch_rva = first_thunk
                    .checked_add(index * 8)
                    .ok_or_else(|| MapError::invalid("import address table overflows"))?;
                self.check_in_section(patch_rva, 8, "import address slot")?;
                imports.push(ImportedSymbol { module: module.clone(), symbol, patch_rva });
                index += 1;
            }

            descriptor_rva += pe::IMPORT_DESCRIPTOR_SIZE as u32;
        }

        Ok(imports)
    }
}

fn validate_sections(
    headers: &[SectionHeader],
    file_len: usize,
    size_of_headers: u32,
    size_of_image: u32,
) -> Result<Vec<Section>> {
    let mut sections: Vec<Section> = headers
        .iter()
        .map(|h| Section {
            name: h.name(),
            file_offset: h.pointer_to_raw_data,
            virtual_address: h.virtual_address,
            raw_size: h.size_of_raw_data,
            virtual_size: h.virtual_size,
            protection: SectionProtection::from_characteristics(h.characteristics),
        })
        .collect();

    for s in &sections {
        let raw_end = s.file_offset as u64 + s.raw_size as u64;
        if s.raw_size != 0 && raw_end > file_len as u64 {
            return Err(MapError::invalid(format!(
                "section {} raw range {:#x}..{:#x} exceeds the {:#x}-byte buffer",
                s.name, s.file_offset, raw_end, file_len
            )));
        }
        let virt_end = s.virtual_address as u64 + s.mapped_size() as u64;
        if s.virtual_address < size_of_headers || virt_end > size_of_image as u64 {
            return Err(MapError::invalid(format!(
                "section {} virtual range {:#x}..{:#x} is outside the image",
                s.name, s.virtual_address, virt_end
            )));
        }
    }

    sections.sort_by_key(|s| s.virtual_address);
    for pair in sections.windows(2) {
        if pair[0].virtual_address + pair[0].mapped_size() > pair[1].virtual_address {
            return Err(MapError::invalid(format!(
                "sections {} and {} overlap",
                pair[0].name, pair[1].name
            )));
        }
    }

    Ok(sections)
}
