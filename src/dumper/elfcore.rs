//! ELF64 core image layout and streaming writer.

use byteorder::{LittleEndian, WriteBytesExt};
use goblin::elf::header::{ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_X86_64, ET_CORE, EV_CURRENT};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD, PT_NOTE};
use std::io::{self, Cursor, Read, Write};

use crate::error::{CoreError, Result};
use crate::utils::{MemoryRegion, Perms, ProcessMemory};

/// Alignment of every segment body after the note segment.
pub const PAGE_SIZE: u64 = 0x1000;

pub const EHDR_SIZE: u64 = 64;
pub const PHDR_SIZE: u64 = 56;

/// `PN_XNUM`: an `e_phnum` of this value means "look in section 0".
const PN_XNUM: usize = 0xffff;

/// One program header entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramHeader {
    pub kind: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub align: u64,
}

impl ProgramHeader {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.kind)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_u64::<LittleEndian>(self.offset)?;
        w.write_u64::<LittleEndian>(self.vaddr)?;
        w.write_u64::<LittleEndian>(0)?; // p_paddr
        w.write_u64::<LittleEndian>(self.file_size)?;
        w.write_u64::<LittleEndian>(self.mem_size)?;
        w.write_u64::<LittleEndian>(self.align)
    }
}

/// A program header plus the reader its file bytes come from.
pub struct Segment<'a> {
    pub header: ProgramHeader,
    body: Option<Box<dyn Read + 'a>>,
}

impl<'a> Segment<'a> {
    pub fn note(notes: Vec<u8>) -> Self {
        Segment {
            header: ProgramHeader {
                kind: PT_NOTE,
                file_size: notes.len() as u64,
                ..Default::default()
            },
            body: Some(Box::new(Cursor::new(notes))),
        }
    }

    /// A LOAD entry for `region`. With a `body` its whole range is sampled,
    /// without one only the header is emitted.
    pub fn load(region: &MemoryRegion, body: Option<Box<dyn Read + 'a>>) -> Self {
        let mut flags = 0;
        if region.perms.contains(Perms::READ) {
            flags |= PF_R;
        }
        if region.perms.contains(Perms::WRITE) {
            flags |= PF_W;
        }
        if region.perms.contains(Perms::EXECUTE) {
            flags |= PF_X;
        }

        let mem_size = region.len();
        Segment {
            header: ProgramHeader {
                kind: PT_LOAD,
                flags,
                vaddr: region.start,
                file_size: if body.is_some() { mem_size } else { 0 },
                mem_size,
                align: PAGE_SIZE,
                ..Default::default()
            },
            body,
        }
    }
}

/// One LOAD segment per region, in region order. Only dumpable regions get a
/// body reading from `memory`; the rest are header-only.
pub fn load_segments<'a>(regions: &[MemoryRegion], memory: &'a ProcessMemory) -> Vec<Segment<'a>> {
    regions
        .iter()
        .map(|region| {
            let body = region
                .is_dumpable()
                .then(|| Box::new(memory.section(region.start, region.len())) as Box<dyn Read + 'a>);
            Segment::load(region, body)
        })
        .collect()
}

fn align_up(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A core file: ELF header, program header table, then segment bodies in
/// table order. The note segment is always entry 0.
pub struct CoreImage<'a> {
    segments: Vec<Segment<'a>>,
}

impl<'a> CoreImage<'a> {
    pub fn new(notes: Vec<u8>, loads: Vec<Segment<'a>>) -> Result<Self> {
        if loads.len() + 1 >= PN_XNUM {
            return Err(CoreError::TooManySegments(loads.len() + 1));
        }

        let mut segments = Vec::with_capacity(loads.len() + 1);
        segments.push(Segment::note(notes));
        segments.extend(loads);

        // The first body starts right after the table; each later one
        // starts at the previous end rounded up to a page.
        let mut base = EHDR_SIZE + segments.len() as u64 * PHDR_SIZE;
        for segment in &mut segments {
            segment.header.offset = base;
            base = align_up(base + segment.header.file_size);
        }

        Ok(CoreImage { segments })
    }

    pub fn headers(&self) -> impl Iterator<Item = &ProgramHeader> {
        self.segments.iter().map(|s| &s.header)
    }

    /// Total length of the image in bytes.
    pub fn size(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| &s.header)
            .filter(|h| h.file_size > 0)
            .map(|h| h.offset + h.file_size)
            .max()
            .unwrap_or(EHDR_SIZE + self.segments.len() as u64 * PHDR_SIZE)
    }

    fn write_file_header<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(ELFMAG);
        ident[4] = ELFCLASS64;
        ident[5] = ELFDATA2LSB;
        ident[6] = EV_CURRENT;
        w.write_all(&ident)?;
        w.write_u16::<LittleEndian>(ET_CORE)?;
        w.write_u16::<LittleEndian>(EM_X86_64)?;
        w.write_u32::<LittleEndian>(u32::from(EV_CURRENT))?;
        w.write_u64::<LittleEndian>(0)?; // e_entry
        w.write_u64::<LittleEndian>(EHDR_SIZE)?; // e_phoff
        w.write_u64::<LittleEndian>(0)?; // e_shoff
        w.write_u32::<LittleEndian>(0)?; // e_flags
        w.write_u16::<LittleEndian>(EHDR_SIZE as u16)?;
        w.write_u16::<LittleEndian>(PHDR_SIZE as u16)?;
        w.write_u16::<LittleEndian>(self.segments.len() as u16)?;
        w.write_u16::<LittleEndian>(0)?; // e_shentsize
        w.write_u16::<LittleEndian>(0)?; // e_shnum
        w.write_u16::<LittleEndian>(0) // e_shstrndx
    }

    /// Streams the image into `out` and returns the number of bytes written.
    pub fn write<W: Write>(self, out: &mut W) -> Result<u64> {
        self.write_file_header(out)?;
        for header in self.headers() {
            header.write(out)?;
        }
        let mut cursor = EHDR_SIZE + self.segments.len() as u64 * PHDR_SIZE;

        let zeros = [0u8; PAGE_SIZE as usize];
        for segment in self.segments {
            let header = segment.header;
            let Some(body) = segment.body else { continue };
            if header.file_size == 0 {
                continue;
            }

            while cursor < header.offset {
                let n = (header.offset - cursor).min(PAGE_SIZE);
                out.write_all(&zeros[..n as usize])?;
                cursor += n;
            }

            let written = io::copy(&mut body.take(header.file_size), out)?;
            cursor += written;
            if written != header.file_size {
                return Err(CoreError::ShortSegment {
                    vaddr: header.vaddr,
                    written,
                    expected: header.file_size,
                });
            }
            log::trace!("Wrote {:#x} bytes for segment at {:#x}", written, header.vaddr);
        }

        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use goblin::elf::Elf;
    use pretty_assertions::assert_eq;

    fn region(start: u64, end: u64, perms: &str) -> MemoryRegion {
        MemoryRegion {
            start,
            end,
            perms: Perms::from_column(perms),
            ..Default::default()
        }
    }

    fn render(image: CoreImage<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        let n = image.write(&mut out).unwrap();
        assert_eq!(n, out.len() as u64);
        out
    }

    #[test]
    fn no_regions_yields_single_note_entry() {
        let image = CoreImage::new(vec![0xaa; 20], Vec::new()).unwrap();
        assert_eq!(image.size(), EHDR_SIZE + PHDR_SIZE + 20);
        let bytes = render(image);

        let elf = Elf::parse(&bytes).unwrap();
        assert_eq!(elf.header.e_type, ET_CORE);
        assert_eq!(elf.header.e_machine, EM_X86_64);
        assert_eq!(elf.program_headers.len(), 1);

        let note = &elf.program_headers[0];
        assert_eq!(note.p_type, PT_NOTE);
        assert_eq!(note.p_offset, EHDR_SIZE + PHDR_SIZE);
        assert_eq!(note.p_filesz, 20);
        assert_eq!(note.p_vaddr, 0);
        assert_eq!(note.p_align, 0);
        assert_eq!(&bytes[120..], &[0xaa; 20][..]);
    }

    #[test]
    fn offsets_align_after_the_first_body() {
        let loads = vec![
            Segment::load(&region(0x10000, 0x12000, "r-xp"), Some(Box::new(Cursor::new(vec![1u8; 0x2000])))),
            Segment::load(&region(0x20000, 0x21000, "---p"), None),
            Segment::load(&region(0x30000, 0x31000, "rw-p"), Some(Box::new(Cursor::new(vec![2u8; 0x1000])))),
        ];
        let image = CoreImage::new(vec![0; 100], loads).unwrap();
        let headers: Vec<ProgramHeader> = image.headers().copied().collect();

        let table_end = EHDR_SIZE + 4 * PHDR_SIZE;
        assert_eq!(headers[0].offset, table_end);
        assert_eq!(headers[1].offset, 0x1000);
        assert_eq!(headers[2].offset, 0x3000);
        assert_eq!(headers[3].offset, 0x3000);
        assert_eq!(image.size(), 0x4000);

        assert_eq!(headers[1].flags, PF_R | PF_X);
        assert_eq!(headers[2].flags, 0);
        assert_eq!(headers[2].file_size, 0);
        assert_eq!(headers[2].mem_size, 0x1000);
        assert_eq!(headers[3].flags, PF_R | PF_W);

        let bytes = render(image);
        assert_eq!(bytes.len(), 0x4000);
        assert!(bytes[(table_end + 100) as usize..0x1000].iter().all(|&b| b == 0));
        assert!(bytes[0x1000..0x3000].iter().all(|&b| b == 1));
        assert!(bytes[0x3000..].iter().all(|&b| b == 2));

        let elf = Elf::parse(&bytes).unwrap();
        assert_eq!(elf.program_headers.len(), 4);
        assert_eq!(elf.program_headers[0].p_type, PT_NOTE);
        assert!(elf.program_headers[1..].iter().all(|p| p.p_type == PT_LOAD && p.p_align == PAGE_SIZE));
    }

    #[test]
    fn header_fields() {
        let bytes = render(CoreImage::new(Vec::new(), Vec::new()).unwrap());
        assert_eq!(&bytes[..4], b"\x7fELF");
        assert_eq!(bytes[4], 2);
        assert_eq!(bytes[5], 1);
        let mut c = Cursor::new(&bytes[52..]);
        assert_eq!(c.read_u16::<LittleEndian>().unwrap(), 64);
        assert_eq!(c.read_u16::<LittleEndian>().unwrap(), 56);
        assert_eq!(c.read_u16::<LittleEndian>().unwrap(), 1);
    }

    fn headers_only(count: usize) -> Vec<Segment<'static>> {
        let r = region(0x10000, 0x11000, "---p");
        (0..count).map(|_| Segment::load(&r, None)).collect()
    }

    #[test]
    fn program_header_count_must_fit_phnum() {
        let err = CoreImage::new(Vec::new(), headers_only(70_000)).err().unwrap();
        assert!(matches!(err, CoreError::TooManySegments(70_001)));

        let err = CoreImage::new(Vec::new(), headers_only(PN_XNUM - 1)).err().unwrap();
        assert!(matches!(err, CoreError::TooManySegments(n) if n == PN_XNUM));
    }

    #[test]
    fn largest_table_keeps_exact_phnum() {
        let bytes = render(CoreImage::new(Vec::new(), headers_only(PN_XNUM - 2)).unwrap());
        let mut c = Cursor::new(&bytes[56..58]);
        assert_eq!(c.read_u16::<LittleEndian>().unwrap() as usize, PN_XNUM - 1);
        assert_eq!(bytes.len() as u64, EHDR_SIZE + (PN_XNUM as u64 - 1) * PHDR_SIZE);
    }

    fn with_flags(mut region: MemoryRegion, vmflags: &str) -> MemoryRegion {
        region.attributes.insert("vmflags".into(), vmflags.into());
        region
    }

    #[test]
    fn load_segments_follow_dumpability() {
        let regions = vec![
            with_flags(region(0x400000, 0x402000, "r-xp"), "rd ex mr mw me"),
            with_flags(region(0x402000, 0x403000, "---p"), "mr mw me"),
            with_flags(region(0x500000, 0x504000, "rw-p"), "rd wr mr mw me dd"),
            with_flags(region(0x600000, 0x601000, "rw-s"), "rd wr sh mr mw me io pf"),
            with_flags(region(0x7ffd0000, 0x7ffd1000, "rw-p"), "rd wr mr mw me gd"),
            region(0xffffffffff600000, 0xffffffffff601000, "--xp"),
            region(0xffffffffff700000, 0xffffffffff701000, "r--p"),
        ];
        let memory = ProcessMemory::open(std::process::id() as i32).unwrap();
        let loads = load_segments(&regions, &memory);
        assert_eq!(loads.len(), regions.len());

        let sizes: Vec<(u64, u64)> = loads
            .iter()
            .map(|s| (s.header.file_size, s.header.mem_size))
            .collect();
        assert_eq!(
            sizes,
            vec![
                (0x2000, 0x2000),
                (0, 0x1000),
                (0, 0x4000),
                (0, 0x1000),
                (0x1000, 0x1000),
                (0, 0x1000),
                (0, 0x1000),
            ]
        );
        assert!(loads.iter().all(|s| s.header.kind == PT_LOAD));
        assert!(loads.iter().zip(&regions).all(|(s, r)| s.header.vaddr == r.start));

        let image = CoreImage::new(Vec::new(), loads).unwrap();
        let headers: Vec<ProgramHeader> = image.headers().copied().collect();
        assert_eq!(headers.len(), 1 + regions.len());
        assert_eq!(headers[0].kind, PT_NOTE);
    }

    #[test]
    fn short_body_is_an_error() {
        let loads = vec![Segment::load(
            &region(0x10000, 0x12000, "r--p"),
            Some(Box::new(Cursor::new(vec![0u8; 10]))),
        )];
        let err = CoreImage::new(Vec::new(), loads).unwrap().write(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            CoreError::ShortSegment { vaddr: 0x10000, written: 10, expected: 0x2000 }
        ));
    }
}
