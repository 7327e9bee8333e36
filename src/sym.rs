use crate::error::R0akError;

/// Splits a `module!symbol` target. Both halves must be non-empty.
pub fn split_symbol(target: &str) -> Result<(&str, &str), R0akError> {
    match target.split_once('!') {
        Some((module, symbol)) if !module.is_empty() && !symbol.is_empty() => Ok((module, symbol)),
        _ => Err(R0akError::MalformedSymbol),
    }
}

/// The kernel routines every primitive is built from, resolved once at
/// startup and handed to whoever needs them.
#[derive(Debug, Clone, Copy)]
pub struct KernelRoutines {
    /// `hal!XmMovOp`, the emulator helper that performs the 32-bit move.
    pub xm_mov_op: u64,

    /// `nt!SepHSTIResultsSize`, the redirected query's length field.
    pub hsti_buffer_size: u64,

    /// `nt!SepHSTIResultsBuffer`, the redirected query's source pointer.
    pub hsti_buffer_pointer: u64,

    /// `nt!PopFanIrpComplete`, the compare-routine trampoline that queues
    /// the work item it finds in its fake IRP.
    pub trampoline: u64,
}

#[cfg(windows)]
impl KernelRoutines {
    pub fn resolve(engine: &SymbolEngine) -> Result<Self, R0akError> {
        let xm_mov_op = engine.lookup("hal.dll", "XmMovOp").inspect_err(|_| {
            println!("[-] Failed to find hal!XmMovOp");
        })?;
        let hsti_buffer_size = engine
            .lookup("ntoskrnl.exe", "SepHSTIResultsSize")
            .inspect_err(|_| println!("[-] Failed to find nt!SepHSTIResultsSize"))?;
        let hsti_buffer_pointer = engine
            .lookup("ntoskrnl.exe", "SepHSTIResultsBuffer")
            .inspect_err(|_| println!("[-] Failed to find nt!SepHSTIResultsBuffer"))?;
        let trampoline = engine
            .lookup("ntoskrnl.exe", "PopFanIrpComplete")
            .inspect_err(|_| println!("[-] Failed to find nt!PopFanIrpComplete"))?;
        Ok(Self {
            xm_mov_op,
            hsti_buffer_size,
            hsti_buffer_pointer,
            trampoline,
        })
    }
}

#[cfg(windows)]
pub use windows::SymbolEngine;

#[cfg(windows)]
mod windows {
    use crate::data::{HANDLE, IMAGEHLP_SYMBOL64, PVOID};
    use crate::error::R0akError;
    use crate::util::{driver_base_address, to_wide};
    use std::ffi::CString;
    use winapi::shared::minwindef::HMODULE;
    use winapi::um::libloaderapi::GetProcAddress;

    const SYMOPT_DEFERRED_LOADS: u32 = 0x4;

    type SymSetOptionsFn = unsafe extern "system" fn(u32) -> u32;
    type SymInitializeWFn = unsafe extern "system" fn(HANDLE, *const u16, i32) -> i32;
    type SymLoadModuleExFn = unsafe extern "system" fn(
        HANDLE,
        HANDLE,
        *const i8,
        *const i8,
        u64,
        u32,
        PVOID,
        u32,
    ) -> u64;
    type SymGetSymFromName64Fn =
        unsafe extern "system" fn(HANDLE, *const i8, *mut IMAGEHLP_SYMBOL64) -> i32;
    type SymUnloadModule64Fn = unsafe extern "system" fn(HANDLE, u64) -> i32;

    /// Resolver for symbols the kernel does not export.
    ///
    /// The system's own `dbghelp.dll` predates symbol-server support, so
    /// the engine comes from an installed SDK/WDK's debugger directory and
    /// is bound dynamically.
    pub struct SymbolEngine {
        sym_load_module_ex: SymLoadModuleExFn,
        sym_get_sym_from_name: SymGetSymFromName64Fn,
        sym_unload_module: SymUnloadModule64Fn,
    }

    fn import<T: Copy>(module: HMODULE, name: &str) -> Result<T, R0akError> {
        let export = CString::new(name).map_err(|_| R0akError::SymbolEngineIncomplete)?;
        let address = unsafe { GetProcAddress(module, export.as_ptr()) };
        if address.is_null() {
            println!("[-] Failed to find {name}");
            return Err(R0akError::SymbolEngineIncomplete);
        }
        Ok(unsafe { core::mem::transmute_copy(&address) })
    }

    /// Reads the newest installed kit root from the registry, preferring
    /// Windows 10 and falling back to 8.1 then 8.
    fn kit_root() -> Result<String, R0akError> {
        use winapi::shared::minwindef::{HKEY, MAX_PATH};
        use winapi::um::winnt::KEY_READ;
        use winapi::um::winreg::{HKEY_LOCAL_MACHINE, RegCloseKey, RegOpenKeyExW, RegQueryValueExW};

        const ERROR_SUCCESS: i32 = 0;

        let subkey = to_wide("Software\\Microsoft\\Windows Kits\\Installed Roots");
        let mut key: HKEY = core::ptr::null_mut();
        let error =
            unsafe { RegOpenKeyExW(HKEY_LOCAL_MACHINE, subkey.as_ptr(), 0, KEY_READ, &mut key) };
        if error != ERROR_SUCCESS {
            println!("[-] No Windows SDK or WDK installed: {error:#x}");
            return Err(R0akError::SdkNotFound);
        }

        let mut root = None;
        for (value, fallback) in [
            ("KitsRoot10", "Win 10 SDK/WDK not found, falling back to 8.1"),
            ("KitsRoot81", "Win 8.1 SDK/WDK not found, falling back to 8"),
            ("KitsRoot8", "Win 8 SDK/WDK not found"),
        ] {
            let name = to_wide(value);
            let mut path = [0u16; MAX_PATH];
            let mut size = (path.len() * 2) as u32;
            let error = unsafe {
                RegQueryValueExW(
                    key,
                    name.as_ptr(),
                    core::ptr::null_mut(),
                    core::ptr::null_mut(),
                    path.as_mut_ptr().cast(),
                    &mut size,
                )
            };
            if error == ERROR_SUCCESS {
                let len = path.iter().position(|&c| c == 0).unwrap_or(path.len());
                root = Some(String::from_utf16_lossy(&path[..len]));
                break;
            }
            println!("[-] {fallback}: {error:#x}");
        }

        unsafe { RegCloseKey(key) };
        root.ok_or(R0akError::SdkNotFound)
    }

    impl SymbolEngine {
        /// Loads the SDK's `dbghelp.dll`, binds the entry points and
        /// initializes the engine with deferred loads.
        pub fn setup() -> Result<Self, R0akError> {
            use winapi::um::libloaderapi::LoadLibraryW;
            use winapi::um::processthreadsapi::GetCurrentProcess;

            let mut path = kit_root()?;
            path.push_str("debuggers\\x64\\dbghelp.dll");
            let module = unsafe { LoadLibraryW(to_wide(&path).as_ptr()) };
            if module.is_null() {
                println!("[-] Failed to load Debugging Tools Dbghelp.dll");
                return Err(R0akError::SdkNotFound);
            }

            let sym_set_options: SymSetOptionsFn = import(module, "SymSetOptions")?;
            let sym_initialize: SymInitializeWFn = import(module, "SymInitializeW")?;
            let engine = Self {
                sym_load_module_ex: import(module, "SymLoadModuleEx")?,
                sym_get_sym_from_name: import(module, "SymGetSymFromName64")?,
                sym_unload_module: import(module, "SymUnloadModule64")?,
            };

            unsafe {
                sym_set_options(SYMOPT_DEFERRED_LOADS);
                if sym_initialize(GetCurrentProcess().cast(), core::ptr::null(), 1) == 0 {
                    println!("[-] Failed to initialize symbol engine");
                    return Err(R0akError::SymbolEngineIncomplete);
                }
            }
            Ok(engine)
        }

        /// Resolves `module!symbol` to its address inside the running
        /// kernel: the symbol's offset in a user-mode mapping of the image,
        /// rebased onto the loaded driver.
        pub fn lookup(&self, module: &str, symbol: &str) -> Result<u64, R0akError> {
            use winapi::um::libloaderapi::{
                DONT_RESOLVE_DLL_REFERENCES, FreeLibrary, LoadLibraryExA,
            };
            use winapi::um::processthreadsapi::GetCurrentProcess;

            let kernel_base = driver_base_address(module).inspect_err(|_| {
                println!("[-] Couldn't find base address for {module}");
            })?;

            let image = CString::new(module).map_err(|_| R0akError::ModuleNotFound)?;
            let mapping = unsafe {
                LoadLibraryExA(
                    image.as_ptr(),
                    core::ptr::null_mut(),
                    DONT_RESOLVE_DLL_REFERENCES,
                )
            };
            if mapping.is_null() {
                println!("[-] Couldn't map {module}!");
                return Err(R0akError::ModuleNotFound);
            }
            let user_base = mapping as u64;

            unsafe {
                let process: HANDLE = GetCurrentProcess().cast();
                let loaded = (self.sym_load_module_ex)(
                    process,
                    core::ptr::null_mut(),
                    image.as_ptr(),
                    image.as_ptr(),
                    user_base,
                    0,
                    core::ptr::null_mut(),
                    0,
                );
                if loaded != user_base {
                    println!("[-] Couldn't load symbols for {module}");
                    FreeLibrary(mapping);
                    return Err(R0akError::ModuleNotFound);
                }

                let name = CString::new(format!("{module}!{symbol}"))
                    .map_err(|_| R0akError::MalformedSymbol)?;
                let mut info: IMAGEHLP_SYMBOL64 = core::mem::zeroed();
                info.SizeOfStruct = core::mem::size_of::<IMAGEHLP_SYMBOL64>() as u32;
                info.MaxNameLength = 1;
                let found = (self.sym_get_sym_from_name)(process, name.as_ptr(), &mut info);

                FreeLibrary(mapping);
                (self.sym_unload_module)(process, loaded);

                if found == 0 {
                    println!("[-] Couldn't find {module}!{symbol} symbol");
                    return Err(R0akError::SymbolNotFound);
                }
                Ok(kernel_base + (info.Address - user_base))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_targets_split_at_the_bang() {
        assert_eq!(split_symbol("nt!PsLoadedModuleList"), Ok(("nt", "PsLoadedModuleList")));
        assert_eq!(split_symbol("hal.dll!XmMovOp"), Ok(("hal.dll", "XmMovOp")));
    }

    #[test]
    fn malformed_targets_are_rejected() {
        assert_eq!(split_symbol("PsLoadedModuleList"), Err(R0akError::MalformedSymbol));
        assert_eq!(split_symbol("nt!"), Err(R0akError::MalformedSymbol));
        assert_eq!(split_symbol("!Symbol"), Err(R0akError::MalformedSymbol));
        assert_eq!(split_symbol(""), Err(R0akError::MalformedSymbol));
    }
}
