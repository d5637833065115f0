// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flash driver boundary and two drivers: RAM for tests and
//! simulations, and a flash image file for the host tool.

use log::trace;
use rollback_areas::BoardConfig;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::Path;

/// Raw erase/program access to the part holding the rollback banks.
///
/// Programming is only defined on erased bytes; drivers report
/// [`FlashError::NotErased`] rather than silently merging bits.
pub trait FlashDriver {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError>;
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;
}

impl<F: FlashDriver + ?Sized> FlashDriver for &mut F {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(offset, buf)
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        (**self).erase(offset, len)
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).program(offset, data)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("access of {len} bytes at {offset:#x} is outside the {size:#x} byte flash")]
    OutOfBounds { offset: u32, len: usize, size: u64 },

    #[error("byte at {offset:#x} is not erased (did you forget to erase?)")]
    NotErased { offset: u32 },

    #[error("flash reported a fault at {offset:#x}")]
    Fault { offset: u32 },

    #[error("flash image I/O error")]
    Io(#[from] std::io::Error),
}

fn checked_range(offset: u32, len: usize, size: u64) -> Result<Range<usize>, FlashError> {
    let start = u64::from(offset);
    match start.checked_add(len as u64) {
        Some(end) if end <= size => Ok(start as usize..end as usize),
        _ => Err(FlashError::OutOfBounds { offset, len, size }),
    }
}

/// Byte that would be overwritten by programming `new` over `current`.
fn first_unerased(current: &[u8], new: &[u8], erased_value: u8) -> Option<usize> {
    current
        .iter()
        .zip(new)
        .position(|(c, n)| *c != erased_value && c != n)
}

/// RAM-backed flash.
///
/// Faults can be scheduled to simulate power loss or a worn sector: the
/// next erase or program after `n` successful ones fails without touching
/// the contents. A scheduled fault fires once.
#[derive(Clone, Debug)]
pub struct MemFlash {
    data: Vec<u8>,
    erased_value: u8,
    program_fault: Option<usize>,
    erase_fault: Option<usize>,
}

impl MemFlash {
    pub fn new(size: usize, erased_value: u8) -> MemFlash {
        MemFlash {
            data: vec![erased_value; size],
            erased_value,
            program_fault: None,
            erase_fault: None,
        }
    }

    pub fn for_board(cfg: &BoardConfig) -> MemFlash {
        MemFlash::new(cfg.flash_size() as usize, cfg.erased_value)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Direct access for tests that need to corrupt a bank.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn fail_program_after(&mut self, successes: usize) {
        self.program_fault = Some(successes);
    }

    pub fn fail_erase_after(&mut self, successes: usize) {
        self.erase_fault = Some(successes);
    }

    fn fault_due(countdown: &mut Option<usize>) -> bool {
        match countdown {
            Some(0) => {
                *countdown = None;
                true
            }
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        }
    }
}

impl FlashDriver for MemFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = checked_range(offset, buf.len(), self.data.len() as u64)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        let range = checked_range(offset, len as usize, self.data.len() as u64)?;
        if MemFlash::fault_due(&mut self.erase_fault) {
            return Err(FlashError::Fault { offset });
        }
        self.data[range].fill(self.erased_value);
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let range = checked_range(offset, data.len(), self.data.len() as u64)?;
        if MemFlash::fault_due(&mut self.program_fault) {
            return Err(FlashError::Fault { offset });
        }
        if let Some(i) = first_unerased(&self.data[range.clone()], data, self.erased_value) {
            return Err(FlashError::NotErased {
                offset: offset + i as u32,
            });
        }
        self.data[range].copy_from_slice(data);
        Ok(())
    }
}

/// Flash backed by an image file, one byte of file per byte of flash.
pub struct FileFlash {
    file: File,
    size: u64,
    erased_value: u8,
}

impl FileFlash {
    /// Creates (or truncates) an image of `size` erased bytes.
    pub fn create(path: &Path, size: u64, erased_value: u8) -> Result<FileFlash, FlashError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(true)
            .create(true)
            .open(path)?;
        file.write_all(&vec![erased_value; size as usize])?;
        file.sync_all()?;

        Ok(FileFlash {
            file,
            size,
            erased_value,
        })
    }

    pub fn open(path: &Path, erased_value: u8) -> Result<FileFlash, FlashError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();

        Ok(FileFlash {
            file,
            size,
            erased_value,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, range: &Range<usize>) -> Result<Vec<u8>, FlashError> {
        let mut bytes = vec![0; range.len()];
        self.file.seek(SeekFrom::Start(range.start as u64))?;
        self.file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn write_at(&mut self, range: &Range<usize>, bytes: &[u8]) -> Result<(), FlashError> {
        self.file.seek(SeekFrom::Start(range.start as u64))?;
        self.file.write_all(bytes)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl FlashDriver for FileFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = checked_range(offset, buf.len(), self.size)?;
        self.file.seek(SeekFrom::Start(range.start as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        let range = checked_range(offset, len as usize, self.size)?;
        trace!("erase {:#x}..{:#x}", range.start, range.end);
        self.write_at(&range, &vec![self.erased_value; range.len()])
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let range = checked_range(offset, data.len(), self.size)?;
        let current = self.read_at(&range)?;
        if let Some(i) = first_unerased(&current, data, self.erased_value) {
            return Err(FlashError::NotErased {
                offset: offset + i as u32,
            });
        }
        trace!("program {:#x}..{:#x}", range.start, range.end);
        self.write_at(&range, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_requires_erase() {
        let mut flash = MemFlash::new(16, 0xff);
        flash.program(4, &[1, 2, 3]).unwrap();

        assert!(matches!(
            flash.program(5, &[9]),
            Err(FlashError::NotErased { offset: 5 })
        ));
        // Writing the same value again is harmless
        flash.program(4, &[1, 2]).unwrap();

        flash.erase(0, 16).unwrap();
        flash.program(5, &[9]).unwrap();
        assert_eq!(&flash.as_bytes()[4..7], &[0xff, 9, 0xff]);
    }

    #[test]
    fn accesses_past_the_end_fail() {
        let mut flash = MemFlash::new(16, 0xff);
        let mut buf = [0u8; 4];
        assert!(matches!(
            flash.read(14, &mut buf),
            Err(FlashError::OutOfBounds { offset: 14, len: 4, size: 16 })
        ));
        assert!(flash.erase(u32::MAX, 2).is_err());
    }

    #[test]
    fn scheduled_faults_fire_once() {
        let mut flash = MemFlash::new(16, 0xff);
        flash.fail_program_after(1);
        flash.program(0, &[1]).unwrap();
        assert!(matches!(
            flash.program(1, &[2]),
            Err(FlashError::Fault { offset: 1 })
        ));
        assert_eq!(flash.as_bytes()[1], 0xff);
        flash.program(1, &[2]).unwrap();

        flash.fail_erase_after(0);
        assert!(flash.erase(0, 16).is_err());
        assert_eq!(flash.as_bytes()[0], 1);
    }

    #[test]
    fn zero_erased_parts_are_supported() {
        let mut flash = MemFlash::new(8, 0x00);
        flash.program(0, &[0xff]).unwrap();
        assert!(flash.program(0, &[0x0f]).is_err());
    }

    #[test]
    fn file_image_behaves_like_flash() {
        let path = std::env::temp_dir().join(format!("rollback-flash-{}.bin", std::process::id()));
        let mut flash = FileFlash::create(&path, 32, 0xff).unwrap();
        assert_eq!(flash.size(), 32);

        flash.program(8, &[0xde, 0xad]).unwrap();
        assert!(flash.program(9, &[0x00]).is_err());

        let mut reopened = FileFlash::open(&path, 0xff).unwrap();
        let mut buf = [0u8; 3];
        reopened.read(8, &mut buf).unwrap();
        assert_eq!(buf, [0xde, 0xad, 0xff]);

        reopened.erase(0, 32).unwrap();
        reopened.read(8, &mut buf).unwrap();
        assert_eq!(buf, [0xff; 3]);

        std::fs::remove_file(&path).unwrap();
    }
}
