//! Builder for small PE32+ native images used by the unit tests.
//!
//! Headers occupy the first 0x200 bytes; user sections follow at the virtual
//! addresses they ask for, and a generated `.rdata` section carries the
//! export, import, load-config and base-relocation tables.

use super::pe;
use super::ImportName;

const HEADERS: u32 = 0x200;
const ALIGN: u32 = 0x200;
const OPTIONAL_SIZE: u16 = 0xF0;

pub const DEFAULT_COOKIE: u64 = 0x2B99_2DDF_A232;

struct TestSection {
    name: &'static str,
    va: u32,
    data: Vec<u8>,
    vsize: u32,
    characteristics: u32,
}

pub struct TestImage {
    base: u64,
    entry: u32,
    size_of_image: u32,
    machine: u16,
    subsystem: u16,
    strip_relocs: bool,
    sections: Vec<TestSection>,
    relocs: Vec<(u32, u16)>,
    imports: Vec<(String, Vec<ImportName>)>,
    exports: Vec<(String, u32)>,
    forwarders: Vec<(String, String)>,
    cookie: bool,
}

fn align_up(v: u32, a: u32) -> u32 {
    (v + a - 1) & !(a - 1)
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Generated section contents, addressed by RVA.
struct Meta {
    va: u32,
    bytes: Vec<u8>,
}

impl Meta {
    fn rva(&self) -> u32 {
        self.va + self.bytes.len() as u32
    }

    fn align(&mut self, to: usize) {
        while self.bytes.len() % to != 0 {
            self.bytes.push(0);
        }
    }

    fn push(&mut self, data: &[u8]) -> u32 {
        let rva = self.rva();
        self.bytes.extend_from_slice(data);
        rva
    }

    fn push_zeroed(&mut self, len: usize) -> u32 {
        let rva = self.rva();
        self.bytes.resize(self.bytes.len() + len, 0);
        rva
    }

    fn cstr(&mut self, s: &str) -> u32 {
        let rva = self.push(s.as_bytes());
        self.bytes.push(0);
        rva
    }

    fn at(&self, rva: u32) -> usize {
        (rva - self.va) as usize
    }
}

impl TestImage {
    pub const BASE: u64 = 0xFFFF_F800_0010_0000;

    pub fn new() -> Self {
        Self {
            base: Self::BASE,
            entry: 0,
            size_of_image: 0,
            machine: pe::IMAGE_FILE_MACHINE_AMD64,
            subsystem: pe::IMAGE_SUBSYSTEM_NATIVE,
            strip_relocs: false,
            sections: Vec::new(),
            relocs: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            forwarders: Vec::new(),
            cookie: false,
        }
    }

    /// 0x1000-byte image: `.text` at 0x200 with a `ret` entry point and one
    /// DIR64 relocation at 0x210 holding `BASE + 0x300`.
    pub fn minimal() -> Self {
        let mut text = vec![0u8; 0x100];
        text[0] = 0xC3;
        put_u64(&mut text, 0x10, Self::BASE + 0x300);
        Self::new()
            .section(
                ".text",
                0x200,
                text,
                0x100,
                pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_EXECUTE,
            )
            .entry(0x200)
            .reloc(0x210, pe::IMAGE_REL_BASED_DIR64)
            .size_of_image(0x1000)
    }

    pub fn base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    pub fn entry(mut self, rva: u32) -> Self {
        self.entry = rva;
        self
    }

    pub fn size_of_image(mut self, size: u32) -> Self {
        self.size_of_image = size;
        self
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn subsystem(mut self, subsystem: u16) -> Self {
        self.subsystem = subsystem;
        self
    }

    pub fn without_relocations(mut self) -> Self {
        self.strip_relocs = true;
        self.relocs.clear();
        self
    }

    pub fn section(mut self, name: &'static str, va: u32, data: Vec<u8>, vsize: u32, characteristics: u32) -> Self {
        self.sections.push(TestSection { name, va, data, vsize, characteristics });
        self
    }

    pub fn reloc(mut self, rva: u32, kind: u16) -> Self {
        self.relocs.push((rva, kind));
        self
    }

    pub fn import(mut self, module: &str, symbols: &[ImportName]) -> Self {
        self.imports.push((module.to_string(), symbols.to_vec()));
        self
    }

    pub fn export(mut self, name: &str, rva: u32) -> Self {
        self.exports.push((name.to_string(), rva));
        self
    }

    pub fn forwarded_export(mut self, name: &str, target: &str) -> Self {
        self.forwarders.push((name.to_string(), target.to_string()));
        self
    }

    pub fn security_cookie(mut self) -> Self {
        self.cookie = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let user_end = self
            .sections
            .iter()
            .map(|s| s.va + s.vsize.max(s.data.len() as u32))
            .max()
            .unwrap_or(HEADERS);
        let mut meta = Meta { va: align_up(user_end, ALIGN), bytes: Vec::new() };
        let mut dirs = [(0u32, 0u32); pe::IMAGE_NUMBEROF_DIRECTORY_ENTRIES];
        let mut relocs = self.relocs.clone();

        if !self.exports.is_empty() || !self.forwarders.is_empty() {
            dirs[pe::IMAGE_DIRECTORY_ENTRY_EXPORT] = self.build_exports(&mut meta);
        }
        if !self.imports.is_empty() {
            dirs[pe::IMAGE_DIRECTORY_ENTRY_IMPORT] = self.build_imports(&mut meta);
        }
        if self.cookie {
            meta.align(8);
            let cookie_rva = meta.push(&DEFAULT_COOKIE.to_le_bytes());
            let lc = meta.push_zeroed(0x100);
            let at = meta.at(lc);
            put_u32(&mut meta.bytes, at, 0x100);
            put_u64(&mut meta.bytes, at + 0x58, self.base + cookie_rva as u64);
            relocs.push((lc + 0x58, pe::IMAGE_REL_BASED_DIR64));
            dirs[pe::IMAGE_DIRECTORY_ENTRY_LOAD_CONFIG] = (lc, 0x100);
        }
        if !self.strip_relocs && !relocs.is_empty() {
            dirs[pe::IMAGE_DIRECTORY_ENTRY_BASERELOC] = build_relocs(&mut meta, &relocs);
        }

        let has_meta = !meta.bytes.is_empty();
        let meta_end = align_up(meta.rva(), ALIGN);
        let size_of_image = self.size_of_image.max(if has_meta { meta_end } else { align_up(user_end, ALIGN) });

        // (name, va, raw, vsize, characteristics)
        let mut layout: Vec<(&str, u32, &[u8], u32, u32)> = self
            .sections
            .iter()
            .map(|s| (s.name, s.va, s.data.as_slice(), s.vsize, s.characteristics))
            .collect();
        if has_meta {
            layout.push((".rdata", meta.va, meta.bytes.as_slice(), meta.bytes.len() as u32, pe::IMAGE_SCN_MEM_READ));
        }

        let mut file = vec![0u8; HEADERS as usize];
        put_u16(&mut file, 0, pe::IMAGE_DOS_SIGNATURE);
        put_u32(&mut file, 0x3C, 0x40);
        put_u32(&mut file, 0x40, pe::IMAGE_NT_SIGNATURE);

        let fh = 0x44;
        put_u16(&mut file, fh, self.machine);
        put_u16(&mut file, fh + 2, layout.len() as u16);
        put_u16(&mut file, fh + 16, OPTIONAL_SIZE);
        let mut characteristics = 0x0022;
        if self.strip_relocs {
            characteristics |= pe::IMAGE_FILE_RELOCS_STRIPPED;
        }
        put_u16(&mut file, fh + 18, characteristics);

        let oh = fh + pe::FILE_HEADER_SIZE;
        put_u16(&mut file, oh, pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC);
        put_u32(&mut file, oh + 16, self.entry);
        put_u64(&mut file, oh + 24, self.base);
        put_u32(&mut file, oh + 32, ALIGN);
        put_u32(&mut file, oh + 36, ALIGN);
        put_u32(&mut file, oh + 56, size_of_image);
        put_u32(&mut file, oh + 60, HEADERS);
        put_u16(&mut file, oh + 68, self.subsystem);
        put_u32(&mut file, oh + 108, pe::IMAGE_NUMBEROF_DIRECTORY_ENTRIES as u32);
        for (i, (rva, size)) in dirs.iter().enumerate() {
            put_u32(&mut file, oh + 112 + i * 8, *rva);
            put_u32(&mut file, oh + 116 + i * 8, *size);
        }

        let table = oh + OPTIONAL_SIZE as usize;
        for (i, (name, va, data, vsize, flags)) in layout.iter().enumerate() {
            let raw_size = align_up(data.len() as u32, ALIGN);
            let raw_ptr = if raw_size == 0 { 0 } else { file.len() as u32 };
            let at = table + i * pe::SECTION_HEADER_SIZE;
            file[at..at + name.len()].copy_from_slice(name.as_bytes());
            put_u32(&mut file, at + 8, *vsize);
            put_u32(&mut file, at + 12, *va);
            put_u32(&mut file, at + 16, raw_size);
            put_u32(&mut file, at + 20, raw_ptr);
            put_u32(&mut file, at + 36, *flags);

            if raw_size != 0 {
                let start = file.len();
                file.extend_from_slice(data);
                file.resize(start + raw_size as usize, 0);
            }
        }

        file
    }

    fn build_exports(&self, meta: &mut Meta) -> (u32, u32) {
        meta.align(4);
        let start = meta.rva();
        let count = self.exports.len() + self.forwarders.len();

        let dir = meta.push_zeroed(pe::EXPORT_DIRECTORY_SIZE);
        let functions = meta.push_zeroed(count * 4);
        let names = meta.push_zeroed(count * 4);
        let ordinals = meta.push_zeroed(count * 2);
        let module = meta.cstr("testmod.sys");

        let all: Vec<(String, Option<u32>, Option<String>)> = self
            .exports
            .iter()
            .map(|(n, rva)| (n.clone(), Some(*rva), None))
            .chain(self.forwarders.iter().map(|(n, t)| (n.clone(), None, Some(t.clone()))))
            .collect();

        for (i, (name, rva, forward)) in all.iter().enumerate() {
            let name_rva = meta.cstr(name);
            let function_rva = match (rva, forward) {
                (Some(rva), _) => *rva,
                (None, Some(target)) => meta.cstr(target),
                _ => unreachable!(),
            };
            let f = meta.at(functions) + i * 4;
            put_u32(&mut meta.bytes, f, function_rva);
            let n = meta.at(names) + i * 4;
            put_u32(&mut meta.bytes, n, name_rva);
            let o = meta.at(ordinals) + i * 2;
            put_u16(&mut meta.bytes, o, i as u16);
        }

        let d = meta.at(dir);
        put_u32(&mut meta.bytes, d + 12, module);
        put_u32(&mut meta.bytes, d + 16, 1);
        put_u32(&mut meta.bytes, d + 20, count as u32);
        put_u32(&mut meta.bytes, d + 24, count as u32);
        put_u32(&mut meta.bytes, d + 28, functions);
        put_u32(&mut meta.bytes, d + 32, names);
        put_u32(&mut meta.bytes, d + 36, ordinals);

        (start, meta.rva() - start)
    }

    fn build_imports(&self, meta: &mut Meta) -> (u32, u32) {
        // (name rva, ilt rva, iat rva)
        let mut modules = Vec::new();
        for (module, symbols) in &self.imports {
            let name = meta.cstr(module);
            let mut thunks = Vec::new();
            for symbol in symbols {
                match symbol {
                    ImportName::Ordinal(o) => thunks.push(pe::IMAGE_ORDINAL_FLAG64 | *o as u64),
                    ImportName::Name(n) => {
                        meta.align(2);
                        let hint = meta.push(&[0, 0]);
                        meta.cstr(n);
                        thunks.push(hint as u64);
                    }
                }
            }
            thunks.push(0);

            meta.align(8);
            let raw: Vec<u8> = thunks.iter().flat_map(|t| t.to_le_bytes()).collect();
            let ilt = meta.push(&raw);
            let iat = meta.push(&raw);
            modules.push((name, ilt, iat));
        }

        meta.align(4);
        let start = meta.rva();
        for (name, ilt, iat) in &modules {
            let d = meta.push_zeroed(pe::IMPORT_DESCRIPTOR_SIZE);
            let at = meta.at(d);
            put_u32(&mut meta.bytes, at, *ilt);
            put_u32(&mut meta.bytes, at + 12, *name);
            put_u32(&mut meta.bytes, at + 16, *iat);
        }
        meta.push_zeroed(pe::IMPORT_DESCRIPTOR_SIZE);

        (start, meta.rva() - start)
    }
}

fn build_relocs(meta: &mut Meta, relocs: &[(u32, u16)]) -> (u32, u32) {
    meta.align(4);
    let start = meta.rva();

    let mut pages: Vec<u32> = relocs.iter().map(|(rva, _)| rva & !0xFFF).collect();
    pages.dedup();
    let mut seen = Vec::new();
    for page in pages {
        if seen.contains(&page) {
            continue;
        }
        seen.push(page);

        let mut entries: Vec<u16> = relocs
            .iter()
            .filter(|(rva, _)| rva & !0xFFF == page)
            .map(|(rva, kind)| (kind << 12) | (rva & 0xFFF) as u16)
            .collect();
        if entries.len() % 2 != 0 {
            entries.push(pe::IMAGE_REL_BASED_ABSOLUTE << 12);
        }

        let size = (pe::BASE_RELOCATION_SIZE + entries.len() * 2) as u32;
        meta.push(&page.to_le_bytes());
        meta.push(&size.to_le_bytes());
        for e in entries {
            meta.push(&e.to_le_bytes());
        }
    }

    (start, meta.rva() - start)
}
