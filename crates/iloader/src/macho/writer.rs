//! Header rewriting and universal binary reassembly.
//!
//! Signing a slice happens in two phases. [`prepare_slice`] first truncates
//! any old signature, reserves `reserve` bytes at a 16-byte aligned offset
//! and rewrites `LC_CODE_SIGNATURE` and `__LINKEDIT` to cover it. Only then
//! are the page hashes computed, so they cover the final load commands.
//! The signer fills the reservation afterwards.

use crate::codesign::constants::{
    FAT_MAGIC, LC_CODE_SIGNATURE, LINKEDIT_DATA_COMMAND_SIZE, SEGMENT_ALIGN, SIGNATURE_ALIGN,
};
use crate::{Error, Result};

use super::parser::{ArchSlice, SliceLayout};

// Header field offsets shared by 32- and 64-bit images
const NCMDS_OFFSET: usize = 16;
const SIZEOFCMDS_OFFSET: usize = 20;

/// A slice with its signature space reserved and headers updated.
#[derive(Debug)]
pub struct PreparedSlice {
    /// Slice bytes up to `sig_offset`; the input to page hashing
    pub code: Vec<u8>,
    pub sig_offset: usize,
    pub reserve: usize,
}

/// Reserve `reserve` bytes of signature space in a thin slice.
pub fn prepare_slice(data: &[u8], layout: &SliceLayout, reserve: usize) -> Result<PreparedSlice> {
    let code_end = layout.code_end(data.len());
    let sig_offset = align_to(code_end, SIGNATURE_ALIGN);
    let le = layout.little_endian;

    let mut code = data[..code_end].to_vec();
    code.resize(sig_offset, 0);

    let dataoff = u32::try_from(sig_offset).map_err(|_| Error::MachO("binary too large".into()))?;
    let datasize = u32::try_from(reserve).map_err(|_| Error::MachO("signature too large".into()))?;

    match layout.code_signature {
        Some(cs) => {
            write_u32(&mut code, cs.cmd_offset + 8, dataoff, le)?;
            write_u32(&mut code, cs.cmd_offset + 12, datasize, le)?;
        }
        None => add_code_signature_command(&mut code, layout, dataoff, datasize)?,
    }

    let linkedit = layout
        .linkedit
        .ok_or_else(|| Error::MachO("missing __LINKEDIT segment".into()))?;
    let new_filesize = (sig_offset + reserve) as u64 - linkedit.fileoff;
    let new_vmsize = align_to(new_filesize as usize, SEGMENT_ALIGN as usize) as u64;
    if layout.is_64 {
        // segment_command_64: vmsize at +32, filesize at +48
        write_u64(&mut code, linkedit.cmd_offset + 32, new_vmsize.max(linkedit.vmsize), le)?;
        write_u64(&mut code, linkedit.cmd_offset + 48, new_filesize, le)?;
    } else {
        // segment_command: vmsize at +28, filesize at +36
        let vmsize = new_vmsize.max(linkedit.vmsize) as u32;
        write_u32(&mut code, linkedit.cmd_offset + 28, vmsize, le)?;
        write_u32(&mut code, linkedit.cmd_offset + 36, new_filesize as u32, le)?;
    }

    Ok(PreparedSlice {
        code,
        sig_offset,
        reserve,
    })
}

/// Append a new `LC_CODE_SIGNATURE` after the existing load commands.
fn add_code_signature_command(
    data: &mut [u8],
    layout: &SliceLayout,
    dataoff: u32,
    datasize: u32,
) -> Result<()> {
    let at = layout.load_commands_end;
    let new_end = at + LINKEDIT_DATA_COMMAND_SIZE as usize;
    if new_end > layout.first_section_offset {
        return Err(Error::MachO(
            "no space for LC_CODE_SIGNATURE in load commands area".into(),
        ));
    }
    let le = layout.little_endian;

    write_u32(data, at, LC_CODE_SIGNATURE, le)?;
    write_u32(data, at + 4, LINKEDIT_DATA_COMMAND_SIZE, le)?;
    write_u32(data, at + 8, dataoff, le)?;
    write_u32(data, at + 12, datasize, le)?;

    let ncmds = read_u32(data, NCMDS_OFFSET, le)?;
    let sizeofcmds = read_u32(data, SIZEOFCMDS_OFFSET, le)?;
    write_u32(data, NCMDS_OFFSET, ncmds + 1, le)?;
    write_u32(data, SIZEOFCMDS_OFFSET, sizeofcmds + LINKEDIT_DATA_COMMAND_SIZE, le)?;
    Ok(())
}

/// Rebuild a universal binary from signed slices, in the original order.
pub fn assemble_fat(arches: &[ArchSlice], signed: &[Vec<u8>]) -> Result<Vec<u8>> {
    if arches.is_empty() || arches.len() != signed.len() {
        return Err(Error::MachO("slice count mismatch".into()));
    }

    // fat_header (8) + fat_arch (20) per slice
    let header_size = 8 + arches.len() * 20;
    let mut offset = align_to(header_size, SEGMENT_ALIGN as usize);
    let mut placements = Vec::with_capacity(arches.len());
    for (arch, bytes) in arches.iter().zip(signed) {
        offset = align_to(offset, 1usize << arch.align.min(15));
        placements.push(offset);
        offset += bytes.len();
    }

    let mut output = vec![0u8; offset];
    write_u32(&mut output, 0, FAT_MAGIC, false)?;
    write_u32(&mut output, 4, arches.len() as u32, false)?;
    for (i, ((arch, bytes), place)) in arches.iter().zip(signed).zip(&placements).enumerate() {
        let entry = 8 + i * 20;
        write_u32(&mut output, entry, arch.cpu_type, false)?;
        write_u32(&mut output, entry + 4, arch.cpu_subtype, false)?;
        write_u32(&mut output, entry + 8, *place as u32, false)?;
        write_u32(&mut output, entry + 12, bytes.len() as u32, false)?;
        write_u32(&mut output, entry + 16, arch.align, false)?;
        output[*place..*place + bytes.len()].copy_from_slice(bytes);
    }
    Ok(output)
}

pub(crate) fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

fn out_of_bounds(offset: usize) -> Error {
    Error::MachO(format!("header field at {offset:#x} out of bounds"))
}

fn read_u32(data: &[u8], offset: usize, little_endian: bool) -> Result<u32> {
    let bytes: [u8; 4] = data
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| out_of_bounds(offset))?;
    Ok(if little_endian {
        u32::from_le_bytes(bytes)
    } else {
        u32::from_be_bytes(bytes)
    })
}

fn write_u32(data: &mut [u8], offset: usize, value: u32, little_endian: bool) -> Result<()> {
    let bytes = if little_endian {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    };
    data.get_mut(offset..offset + 4)
        .ok_or_else(|| out_of_bounds(offset))?
        .copy_from_slice(&bytes);
    Ok(())
}

fn write_u64(data: &mut [u8], offset: usize, value: u64, little_endian: bool) -> Result<()> {
    let bytes = if little_endian {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    };
    data.get_mut(offset..offset + 8)
        .ok_or_else(|| out_of_bounds(offset))?
        .copy_from_slice(&bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::parser::MachOFile;
    use crate::macho::test_support::minimal_macho;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 16), 0);
        assert_eq!(align_to(17, 16), 32);
        assert_eq!(align_to(100, 0x4000), 0x4000);
    }

    #[test]
    fn test_read_write_u32() {
        let mut data = vec![0u8; 8];
        write_u32(&mut data, 0, 0x12345678, true).unwrap();
        assert_eq!(&data[0..4], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(read_u32(&data, 0, true).unwrap(), 0x12345678);
        assert!(write_u32(&mut data, 6, 1, true).is_err());
    }

    #[test]
    fn test_prepare_adds_code_signature_command() {
        let data = minimal_macho(true);
        let layout = MachOFile::parse(data.clone()).unwrap().slices()[0].layout.clone();
        let prepared = prepare_slice(&data, &layout, 0x800).unwrap();
        assert_eq!(prepared.sig_offset, data.len());

        // Re-parse with the reservation appended
        let mut signed = prepared.code.clone();
        signed.resize(prepared.sig_offset + prepared.reserve, 0);
        let reparsed = MachOFile::parse(signed).unwrap();
        let layout = &reparsed.slices()[0].layout;

        let cs = layout.code_signature.unwrap();
        assert_eq!(cs.dataoff as usize, prepared.sig_offset);
        assert_eq!(cs.datasize, 0x800);
        let linkedit = layout.linkedit.unwrap();
        assert_eq!(linkedit.fileoff + linkedit.filesize, (prepared.sig_offset + 0x800) as u64);
    }

    #[test]
    fn test_prepare_reuses_existing_command() {
        let data = minimal_macho(true);
        let layout = MachOFile::parse(data.clone()).unwrap().slices()[0].layout.clone();
        let first = prepare_slice(&data, &layout, 0x800).unwrap();
        let mut once = first.code.clone();
        once.resize(first.sig_offset + first.reserve, 0xee);

        let layout = MachOFile::parse(once.clone()).unwrap().slices()[0].layout.clone();
        let second = prepare_slice(&once, &layout, 0x1000).unwrap();
        // Old signature bytes are dropped and no second command is added
        assert_eq!(second.sig_offset, first.sig_offset);
        assert_eq!(read_u32(&second.code, NCMDS_OFFSET, true).unwrap(), 3);
    }

    #[test]
    fn test_assemble_fat_layout() {
        let thin = minimal_macho(false);
        let file = MachOFile::parse(thin.clone()).unwrap();
        let mut arch = file.slices()[0].clone();
        arch.align = 14;
        let fat = assemble_fat(&[arch.clone(), arch], &[thin.clone(), thin.clone()]).unwrap();

        let parsed = MachOFile::parse(fat).unwrap();
        assert!(parsed.is_fat());
        assert_eq!(parsed.slices().len(), 2);
        assert_eq!(parsed.slices()[0].offset, 0x4000);
        assert_eq!(parsed.slices()[1].offset % 0x4000, 0);
    }
}
