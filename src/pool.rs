use crate::data::{
    HANDLE, NPFS_DATA_ENTRY_POOL_TAG, NPFS_DATA_ENTRY_SIZE, POOL_HEADER_SIZES,
    SYSTEM_BIGPOOL_ENTRY,
};
use crate::error::R0akError;

/// Largest payload a placement supports.
pub const MAX_ALLOC_SIZE: u32 = 2048;

/// Unit the randomized placement size is scaled by.
const MAGIC_SIZE_UNIT: u32 = 0x5000;

/// Checks a requested payload size against the supported range.
pub fn validate_size(size: u32) -> Result<(), R0akError> {
    if size > MAX_ALLOC_SIZE {
        return Err(R0akError::OutOfRange);
    }
    Ok(())
}

/// Derives a placement size from a timestamp: a random multiple of 0x5000,
/// large enough to stand out among big-pool allocations and bounded so
/// repeated placements consume at most ~5 MB of non-paged pool.
pub fn magic_size(seed: u64) -> u32 {
    (((seed & 0xFF00_0000) >> 24) as u32) * MAGIC_SIZE_UNIT
}

#[cfg(windows)]
fn derive_magic_size() -> u32 {
    loop {
        let size = magic_size(crate::util::rdtsc());
        if size != 0 {
            return size;
        }
    }
}

/// Finds the kernel address of a committed placement in a big-pool
/// snapshot: the first pipe-tagged entry whose reported size is the
/// placement size plus one of the per-generation header overheads.
///
/// Returns the address of the payload itself, past the data-entry header
/// and with the non-paged flag bit cleared.
pub fn locate(entries: &[SYSTEM_BIGPOOL_ENTRY], magic_size: u32) -> Option<u64> {
    entries.iter().find_map(|entry| {
        if entry.TagUlong != NPFS_DATA_ENTRY_POOL_TAG {
            return None;
        }
        let matched = POOL_HEADER_SIZES
            .iter()
            .any(|&(_, header)| entry.SizeInBytes == magic_size as u64 + header);
        if !matched {
            return None;
        }
        Some((entry.VirtualAddress & !1) + NPFS_DATA_ENTRY_SIZE)
    })
}

/// A one-shot buffer that is writable from user mode and, once committed,
/// resident at a known kernel virtual address.
///
/// The kernel side is the data-queue entry of an anonymous pipe: writing
/// the local buffer through the pipe forces a same-sized non-paged-pool
/// allocation, which is then located by tag and size in the big-pool
/// table. Dropping the placement closes the pipe pair and releases the
/// kernel block, after which the kernel address is dangling.
pub struct KernelAlloc {
    pipes: [HANDLE; 2],
    buffer: Vec<u8>,
    magic_size: u32,
    size: u32,
    kernel_base: Option<u64>,
}

#[cfg(windows)]
impl KernelAlloc {
    /// Reserves a placement able to carry `size` payload bytes.
    pub fn new(size: u32) -> Result<Self, R0akError> {
        use winapi::um::errhandlingapi::GetLastError;
        use winapi::um::namedpipeapi::CreatePipe;

        validate_size(size)?;
        let magic_size = derive_magic_size();

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(magic_size as usize)
            .map_err(|_| R0akError::OutOfMemory)?;
        buffer.resize(magic_size as usize, 0);

        // The pipe's buffer quota is what sizes the kernel-side allocation
        let mut read = core::ptr::null_mut();
        let mut write = core::ptr::null_mut();
        let ok = unsafe { CreatePipe(&mut read, &mut write, core::ptr::null_mut(), magic_size) };
        if ok == 0 {
            println!("[-] Failed creating the pipe pair: {:#x}", unsafe { GetLastError() });
            return Err(R0akError::PipeCreationFailed);
        }

        Ok(Self {
            pipes: [read.cast(), write.cast()],
            buffer,
            magic_size,
            size,
            kernel_base: None,
        })
    }

    /// The payload window of the local buffer.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        let size = self.size as usize;
        &mut self.buffer[..size]
    }

    /// Pushes the local buffer into the kernel and resolves where it
    /// landed. Valid until the placement is dropped.
    pub fn commit(&mut self) -> Result<u64, R0akError> {
        use crate::data::{BIGPOOL_ENTRIES_OFFSET, POOL_SNAPSHOT_SIZE, SystemBigPoolInformation};
        use ntapi::ntexapi::NtQuerySystemInformation;
        use winapi::shared::ntdef::NT_SUCCESS;
        use winapi::um::fileapi::WriteFile;

        let mut written = 0u32;
        let ok = unsafe {
            WriteFile(
                self.pipes[1].cast(),
                self.buffer.as_ptr().cast(),
                self.magic_size,
                &mut written,
                core::ptr::null_mut(),
            )
        };
        if ok == 0 || written != self.magic_size {
            println!("[-] Failed writing kernel buffer");
            return Err(R0akError::PipeWriteFailed);
        }

        // Snapshot every tagged large allocation in the system. The u64
        // backing keeps the buffer suitably aligned for the entry array.
        let mut snapshot = Vec::<u64>::new();
        snapshot
            .try_reserve_exact(POOL_SNAPSHOT_SIZE / 8)
            .map_err(|_| R0akError::OutOfMemory)?;
        snapshot.resize(POOL_SNAPSHOT_SIZE / 8, 0);

        let mut result_length = 0u32;
        let status = unsafe {
            NtQuerySystemInformation(
                SystemBigPoolInformation,
                snapshot.as_mut_ptr().cast(),
                POOL_SNAPSHOT_SIZE as u32,
                &mut result_length,
            )
        };
        if !NT_SUCCESS(status) {
            println!("[-] Failed to dump pool allocations: {status:#x}");
            return Err(R0akError::PoolSnapshotFailed);
        }

        let count = snapshot[0] as u32 as usize;
        let capacity = (POOL_SNAPSHOT_SIZE - BIGPOOL_ENTRIES_OFFSET)
            / core::mem::size_of::<SYSTEM_BIGPOOL_ENTRY>();
        let entries = unsafe {
            core::slice::from_raw_parts(
                snapshot.as_ptr().cast::<u8>().add(BIGPOOL_ENTRIES_OFFSET)
                    as *const SYSTEM_BIGPOOL_ENTRY,
                count.min(capacity),
            )
        };

        match locate(entries, self.magic_size) {
            Some(address) => {
                self.kernel_base = Some(address);
                Ok(address)
            }
            None => {
                println!("[-] Kernel buffer not found!");
                Err(R0akError::PoolNotFound)
            }
        }
    }

    /// Kernel address of the payload, if committed.
    pub fn kernel_address(&self) -> Option<u64> {
        self.kernel_base
    }
}

#[cfg(windows)]
impl Drop for KernelAlloc {
    fn drop(&mut self) {
        use winapi::um::handleapi::CloseHandle;

        // Closing both ends releases the kernel-side data entry
        for pipe in self.pipes {
            if !pipe.is_null() {
                unsafe { CloseHandle(pipe.cast()) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: u64, size: u64, tag: u32) -> SYSTEM_BIGPOOL_ENTRY {
        SYSTEM_BIGPOOL_ENTRY {
            VirtualAddress: address,
            SizeInBytes: size,
            TagUlong: tag,
        }
    }

    #[test]
    fn size_cap_is_two_kilobytes() {
        assert!(validate_size(1).is_ok());
        assert!(validate_size(2048).is_ok());
        assert_eq!(validate_size(2049), Err(R0akError::OutOfRange));
    }

    #[test]
    fn magic_size_is_bounded_multiple_of_unit() {
        for seed in [0x0100_0000u64, 0xFF00_0000, 0xDEAD_BEEF_0000_0000 | 0x7700_0000] {
            let size = magic_size(seed);
            assert_eq!(size % 0x5000, 0);
            assert!(size <= 0xFF * 0x5000);
        }
        assert_eq!(magic_size(0x0000_FFFF), 0);
    }

    #[test]
    fn locate_accepts_both_allocator_generations() {
        let magic = 0x20 * 0x5000u32;
        let heap_backed = [entry(
            0xFFFF_9B80_1234_0001,
            magic as u64 + 0x30,
            NPFS_DATA_ENTRY_POOL_TAG,
        )];
        let large_pool = [entry(
            0xFFFF_9B80_5678_0000,
            magic as u64 + 0x1000,
            NPFS_DATA_ENTRY_POOL_TAG,
        )];
        // Non-paged bit masked, data-entry header skipped
        assert_eq!(locate(&heap_backed, magic), Some(0xFFFF_9B80_1234_0030));
        assert_eq!(locate(&large_pool, magic), Some(0xFFFF_9B80_5678_0030));
    }

    #[test]
    fn locate_is_deterministic_first_match() {
        let magic = 0x10 * 0x5000u32;
        let entries = [
            entry(0xFFFF_8000_0000_0000, 0x1234, NPFS_DATA_ENTRY_POOL_TAG),
            entry(0xFFFF_8000_0001_0001, magic as u64 + 0x30, NPFS_DATA_ENTRY_POOL_TAG),
            // Duplicate-sized entry must not displace the first match
            entry(0xFFFF_8000_0002_0001, magic as u64 + 0x30, NPFS_DATA_ENTRY_POOL_TAG),
        ];
        assert_eq!(locate(&entries, magic), Some(0xFFFF_8000_0001_0030));
        assert_eq!(locate(&entries, magic), locate(&entries, magic));
    }

    #[test]
    fn locate_ignores_foreign_tags_and_sizes() {
        let magic = 0x10 * 0x5000u32;
        let entries = [
            // Right size, wrong owner
            entry(0xFFFF_8000_0000_0001, magic as u64 + 0x30, u32::from_le_bytes(*b"Proc")),
            // Right owner, unrelated size
            entry(0xFFFF_8000_0001_0001, magic as u64 + 0x40, NPFS_DATA_ENTRY_POOL_TAG),
        ];
        assert_eq!(locate(&entries, magic), None);
        assert_eq!(locate(&[], magic), None);
    }
}
