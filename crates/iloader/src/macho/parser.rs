//! Mach-O layout inspection using goblin.
//!
//! Signing needs only a handful of facts about each slice: where the load
//! commands end, where the first section begins, and the positions of
//! `LC_CODE_SIGNATURE`, `__TEXT` and `__LINKEDIT`.

use goblin::mach::header::MH_EXECUTE;
use goblin::mach::load_command::CommandVariant;
use goblin::mach::{Mach, MachO};

use crate::{Error, Result};

/// An existing `LC_CODE_SIGNATURE` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSignatureCommand {
    /// Offset of the load command within the slice
    pub cmd_offset: usize,
    pub dataoff: u32,
    pub datasize: u32,
}

/// A segment load command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub cmd_offset: usize,
    pub fileoff: u64,
    pub filesize: u64,
    pub vmsize: u64,
}

/// Facts about one architecture slice needed to sign it.
#[derive(Debug, Clone)]
pub struct SliceLayout {
    pub is_64: bool,
    pub little_endian: bool,
    pub is_executable: bool,
    /// First byte after the last load command
    pub load_commands_end: usize,
    /// Lowest file offset of any section data; load commands may grow up to it
    pub first_section_offset: usize,
    pub code_signature: Option<CodeSignatureCommand>,
    pub text: Option<SegmentInfo>,
    pub linkedit: Option<SegmentInfo>,
    /// End of the furthest segment in the file
    pub segments_end: usize,
}

impl SliceLayout {
    /// Inspect a thin Mach-O image.
    pub fn inspect(data: &[u8]) -> Result<Self> {
        let macho = MachO::parse(data, 0)
            .map_err(|e| Error::MachO(format!("failed to parse slice: {e}")))?;
        Ok(Self::from_macho(&macho, data.len()))
    }

    fn from_macho(macho: &MachO, file_size: usize) -> Self {
        let mut code_signature = None;
        let mut text = None;
        let mut linkedit = None;
        let mut load_commands_end = 0usize;
        let mut segments_end = 0u64;
        let mut first_segment_offset = u64::MAX;

        for lc in &macho.load_commands {
            load_commands_end = load_commands_end.max(lc.offset + lc.command.cmdsize());

            let segment = match &lc.command {
                CommandVariant::CodeSignature(cs) => {
                    code_signature = Some(CodeSignatureCommand {
                        cmd_offset: lc.offset,
                        dataoff: cs.dataoff,
                        datasize: cs.datasize,
                    });
                    None
                }
                CommandVariant::Segment64(seg) => {
                    Some((seg.segname, seg.fileoff, seg.filesize, seg.vmsize))
                }
                CommandVariant::Segment32(seg) => Some((
                    seg.segname,
                    seg.fileoff as u64,
                    seg.filesize as u64,
                    seg.vmsize as u64,
                )),
                _ => None,
            };

            if let Some((name, fileoff, filesize, vmsize)) = segment {
                let info = SegmentInfo {
                    cmd_offset: lc.offset,
                    fileoff,
                    filesize,
                    vmsize,
                };
                if name.starts_with(b"__TEXT\0") {
                    text = Some(info);
                } else if name.starts_with(b"__LINKEDIT\0") {
                    linkedit = Some(info);
                }
                segments_end = segments_end.max(fileoff + filesize);
                if fileoff > 0 {
                    first_segment_offset = first_segment_offset.min(fileoff);
                }
            }
        }

        let mut first_section_offset = u64::MAX;
        for segment in macho.segments.iter() {
            if let Ok(sections) = segment.sections() {
                for (section, _) in sections {
                    if section.offset > 0 {
                        first_section_offset = first_section_offset.min(section.offset as u64);
                    }
                }
            }
        }
        if first_section_offset == u64::MAX {
            first_section_offset = first_segment_offset;
        }
        if first_section_offset == u64::MAX {
            first_section_offset = file_size as u64;
        }

        Self {
            is_64: macho.is_64,
            little_endian: macho.little_endian,
            is_executable: macho.header.filetype == MH_EXECUTE,
            load_commands_end,
            first_section_offset: first_section_offset as usize,
            code_signature,
            text,
            linkedit,
            segments_end: if segments_end == 0 {
                file_size
            } else {
                segments_end as usize
            },
        }
    }

    /// Offset where unsigned content ends and the signature begins.
    pub fn code_end(&self, file_size: usize) -> usize {
        self.code_signature
            .map(|cs| cs.dataoff as usize)
            .unwrap_or(self.segments_end)
            .min(file_size)
    }
}

/// One slice of a possibly universal binary.
#[derive(Debug, Clone)]
pub struct ArchSlice {
    pub offset: usize,
    pub size: usize,
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    /// Alignment as a power of two (universal binaries only)
    pub align: u32,
    pub layout: SliceLayout,
}

/// A parsed thin or universal Mach-O file.
#[derive(Debug)]
pub struct MachOFile {
    data: Vec<u8>,
    is_fat: bool,
    slices: Vec<ArchSlice>,
}

impl MachOFile {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let mach = Mach::parse(&data).map_err(|e| Error::MachO(format!("failed to parse: {e}")))?;

        let (is_fat, slices) = match mach {
            Mach::Binary(macho) => {
                let slice = ArchSlice {
                    offset: 0,
                    size: data.len(),
                    cpu_type: macho.header.cputype,
                    cpu_subtype: macho.header.cpusubtype,
                    align: 0,
                    layout: SliceLayout::from_macho(&macho, data.len()),
                };
                (false, vec![slice])
            }
            Mach::Fat(fat) => {
                let mut slices = Vec::new();
                for (i, arch) in fat.iter_arches().enumerate() {
                    let arch = arch.map_err(|e| Error::MachO(format!("fat arch {i}: {e}")))?;
                    let offset = arch.offset as usize;
                    let size = arch.size as usize;
                    let bytes = data
                        .get(offset..offset + size)
                        .ok_or_else(|| Error::MachO(format!("fat arch {i} out of bounds")))?;
                    slices.push(ArchSlice {
                        offset,
                        size,
                        cpu_type: arch.cputype,
                        cpu_subtype: arch.cpusubtype,
                        align: arch.align,
                        layout: SliceLayout::inspect(bytes)?,
                    });
                }
                (true, slices)
            }
        };

        Ok(Self {
            data,
            is_fat,
            slices,
        })
    }

    pub fn is_fat(&self) -> bool {
        self.is_fat
    }

    pub fn slices(&self) -> &[ArchSlice] {
        &self.slices
    }

    pub fn slice_bytes(&self, slice: &ArchSlice) -> &[u8] {
        &self.data[slice.offset..slice.offset + slice.size]
    }
}

/// True if `data` starts with a Mach-O or universal magic.
pub fn is_macho(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    let magic = [data[0], data[1], data[2], data[3]];
    matches!(
        u32::from_be_bytes(magic),
        0xfeedface | 0xfeedfacf | 0xcefaedfe | 0xcffaedfe | 0xcafebabe
    )
}
