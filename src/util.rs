#[cfg(windows)]
use crate::error::R0akError;

/// Reads the CPU timestamp counter, the entropy source for placement-size
/// randomization.
#[cfg(target_arch = "x86_64")]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn rdtsc() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

/// Converts a string into a NUL-terminated UTF-16 buffer for wide Win32 APIs.
pub fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(Some(0)).collect()
}

/// Formats a byte buffer as 16-byte hex+ASCII lines: two-digit uppercase hex
/// with a dash after the eighth byte, short lines padded, non-printables
/// shown as `.`.
pub fn hex_lines(data: &[u8]) -> Vec<String> {
    let mut lines = Vec::with_capacity(data.len().div_ceil(16));
    for chunk in data.chunks(16) {
        let mut line = String::with_capacity(49 + 16);
        for (i, byte) in chunk.iter().enumerate() {
            line.push_str(&format!("{byte:02X}"));
            line.push(if i == 7 { '-' } else { ' ' });
        }
        for _ in chunk.len()..16 {
            line.push_str("   ");
        }
        line.push(' ');
        for byte in chunk {
            line.push(if byte.is_ascii_graphic() || *byte == b' ' {
                *byte as char
            } else {
                '.'
            });
        }
        lines.push(line);
    }
    lines
}

/// Prints a buffer as a tab-indented hex dump.
pub fn dump_hex(data: &[u8]) {
    for line in hex_lines(data) {
        println!("\t{line}");
    }
}

/// Parks the process forever after a completion signal never arrived.
///
/// At this point a work item carrying pointers into this process's pipe
/// allocations may still be queued; exiting would free them under the
/// kernel. Staying alive keeps every referenced page valid.
#[cfg(windows)]
pub fn halt_indeterminate() -> ! {
    use winapi::um::synchapi::Sleep;
    use winapi::um::winbase::INFINITE;

    println!("[-] Kernel completion state is indeterminate; halting this process");
    println!("[-] Do not terminate it by hand, reboot to recover");
    loop {
        unsafe { Sleep(INFINITE) };
    }
}

/// Finds the load address of a driver inside the running kernel by matching
/// its base name against the loaded-driver list.
#[cfg(windows)]
pub fn driver_base_address(base_name: &str) -> Result<u64, R0akError> {
    use winapi::shared::minwindef::{DWORD, MAX_PATH};
    use winapi::um::psapi::{EnumDeviceDrivers, GetDeviceDriverBaseNameA};

    let mut bases = [core::ptr::null_mut(); 1024];
    let mut needed: DWORD = 0;
    let cb = core::mem::size_of_val(&bases) as DWORD;
    unsafe {
        if EnumDeviceDrivers(bases.as_mut_ptr(), cb, &mut needed) == 0 {
            println!("[-] Failed to enumerate driver base addresses");
            return Err(R0akError::DriverNotFound);
        }
    }

    let count = (needed as usize / core::mem::size_of::<usize>()).min(bases.len());
    for &base in &bases[..count] {
        let mut name = [0u8; MAX_PATH];
        let len = unsafe {
            GetDeviceDriverBaseNameA(base, name.as_mut_ptr().cast(), name.len() as DWORD)
        };
        if len == 0 {
            continue;
        }
        let name = core::str::from_utf8(&name[..len as usize]).unwrap_or_default();
        if name.eq_ignore_ascii_case(base_name) {
            return Ok(base as u64);
        }
    }

    Err(R0akError::DriverNotFound)
}

/// Impersonates `winlogon.exe`'s SYSTEM token on the calling thread.
///
/// Needed because the cross-session globals section grants no access to
/// ordinary administrators. Pair with `RevertToSelf` once the handle is
/// open.
#[cfg(windows)]
pub fn elevate_to_system() -> Result<(), R0akError> {
    use crate::data::SE_DEBUG_PRIVILEGE;
    use ntapi::ntrtl::RtlAdjustPrivilege;
    use winapi::shared::ntdef::NT_SUCCESS;
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::processthreadsapi::{OpenProcess, OpenProcessToken, SetThreadToken};
    use winapi::um::securitybaseapi::DuplicateToken;
    use winapi::um::tlhelp32::{
        CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW,
        TH32CS_SNAPPROCESS,
    };
    use winapi::um::winnt::{MAXIMUM_ALLOWED, SecurityImpersonation};

    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0);
        if snapshot == INVALID_HANDLE_VALUE {
            println!("[-] Failed to initialize toolhelp snapshot");
            return Err(R0akError::ElevationFailed);
        }

        // Scan the process list for winlogon
        let mut logon_pid = 0;
        let mut entry: PROCESSENTRY32W = core::mem::zeroed();
        entry.dwSize = core::mem::size_of::<PROCESSENTRY32W>() as u32;
        let mut more = Process32FirstW(snapshot, &mut entry);
        while more != 0 {
            let len = entry
                .szExeFile
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(entry.szExeFile.len());
            let name = String::from_utf16_lossy(&entry.szExeFile[..len]);
            if name.eq_ignore_ascii_case("winlogon.exe") {
                logon_pid = entry.th32ProcessID;
                break;
            }
            more = Process32NextW(snapshot, &mut entry);
        }
        CloseHandle(snapshot);

        if logon_pid == 0 {
            println!("[-] Couldn't find winlogon.exe");
            return Err(R0akError::ElevationFailed);
        }

        // Debug privilege lets us open winlogon at all
        let mut was_enabled = 0u8;
        let status = RtlAdjustPrivilege(SE_DEBUG_PRIVILEGE, 1, 0, &mut was_enabled);
        if !NT_SUCCESS(status) {
            println!("[-] Failed to acquire SeDebugPrivilege: {status:#x}");
            return Err(R0akError::ElevationFailed);
        }

        let process = OpenProcess(MAXIMUM_ALLOWED, 0, logon_pid);
        if process.is_null() {
            println!("[-] Failed to open handle to winlogon");
            return Err(R0akError::ElevationFailed);
        }

        let mut token = core::ptr::null_mut();
        if OpenProcessToken(process, MAXIMUM_ALLOWED, &mut token) == 0 {
            println!("[-] Failed to open winlogon token");
            CloseHandle(process);
            return Err(R0akError::ElevationFailed);
        }

        let mut impersonation = core::ptr::null_mut();
        if DuplicateToken(token, SecurityImpersonation, &mut impersonation) == 0 {
            println!("[-] Failed to duplicate winlogon token");
            CloseHandle(token);
            CloseHandle(process);
            return Err(R0akError::ElevationFailed);
        }

        let assigned = SetThreadToken(core::ptr::null_mut(), impersonation);
        CloseHandle(impersonation);
        CloseHandle(token);
        CloseHandle(process);
        if assigned == 0 {
            println!("[-] Failed to impersonate winlogon token");
            return Err(R0akError::ElevationFailed);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_line_has_dash_and_ascii_column() {
        let data: Vec<u8> = (0x41..0x51).collect();
        let lines = hex_lines(&data);
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            "41 42 43 44 45 46 47 48-49 4A 4B 4C 4D 4E 4F 50  ABCDEFGHIJKLMNOP"
        );
    }

    #[test]
    fn short_line_is_padded_to_the_ascii_column() {
        let lines = hex_lines(&[0x00, 0xFF, b'a']);
        assert_eq!(lines.len(), 1);
        // 3 bytes, 13 pads of 3 spaces, separator space, ascii
        assert_eq!(lines[0].len(), 3 * 3 + 13 * 3 + 1 + 3);
        assert!(lines[0].starts_with("00 FF 61 "));
        assert!(lines[0].ends_with(" ..a"));
    }

    #[test]
    fn sixteen_bytes_per_line() {
        let lines = hex_lines(&[0u8; 40]);
        assert_eq!(lines.len(), 3);
        // The final chunk holds 8 bytes, so the eighth byte carries the dash
        assert!(lines[2].starts_with("00 00 00 00 00 00 00 00-"));
    }

    #[test]
    fn wide_strings_are_nul_terminated() {
        let w = to_wide("ab");
        assert_eq!(w, vec![b'a' as u16, b'b' as u16, 0]);
    }
}
