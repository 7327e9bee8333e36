use crate::data::{PERFINFO_LOG_TYPE_WORKER_THREAD_ITEM_END, TRACEHANDLE};
#[cfg(windows)]
use crate::data::EVENT_TRACE_PROPERTIES;
#[cfg(windows)]
use crate::error::R0akError;

/// Name of the real-time system-logger session.
pub const ETW_TRACE_NAME: &str = "r0ak-etw";

/// Decides whether a consumed trace record confirms the awaited work item:
/// a worker-thread item-end event whose routine is exactly the target.
pub fn matches_work_item_end(opcode: u8, routine: u64, awaited: u64) -> bool {
    opcode == (PERFINFO_LOG_TYPE_WORKER_THREAD_ITEM_END & 0xFF) as u8 && routine == awaited
}

#[cfg(windows)]
#[link(name = "advapi32")]
unsafe extern "system" {
    fn StartTraceW(
        SessionHandle: *mut TRACEHANDLE,
        InstanceName: *const u16,
        Properties: *mut EVENT_TRACE_PROPERTIES,
    ) -> u32;
    fn ControlTraceW(
        SessionHandle: TRACEHANDLE,
        InstanceName: *const u16,
        Properties: *mut EVENT_TRACE_PROPERTIES,
        ControlCode: u32,
    ) -> u32;
    fn OpenTraceW(Logfile: *mut crate::data::EVENT_TRACE_LOGFILEW) -> TRACEHANDLE;
    fn ProcessTrace(
        HandleArray: *mut TRACEHANDLE,
        HandleCount: u32,
        StartTime: *mut core::ffi::c_void,
        EndTime: *mut core::ffi::c_void,
    ) -> u32;
    fn CloseTrace(TraceHandle: TRACEHANDLE) -> u32;
    fn TraceSetInformation(
        SessionHandle: TRACEHANDLE,
        InformationClass: u32,
        TraceInformation: *mut core::ffi::c_void,
        InformationLength: u32,
    ) -> u32;
}

/// A worker-thread-scoped trace session confirming that a hijacked kernel
/// work item actually ran.
///
/// There is no synchronous return path from the hijacked dispatch; the
/// only trustworthy signal is the kernel's own item-end event carrying
/// the routine address. One session exists per execution attempt and is
/// torn down whether or not the event was seen.
pub struct EtwSession {
    session_handle: TRACEHANDLE,
    parser_handle: TRACEHANDLE,
    /// `EVENT_TRACE_PROPERTIES` plus the appended logger name, u64-backed
    /// to keep the descriptor aligned.
    properties: Vec<u64>,
    work_item_routine: u64,
}

#[cfg(windows)]
impl EtwSession {
    /// Creates the real-time session and attaches a consumer looking for
    /// `work_item_routine`. Boxed so the consumer callback can reach the
    /// session through a stable context pointer.
    pub fn start(work_item_routine: u64) -> Result<Box<Self>, R0akError> {
        use crate::data::{
            ERROR_SUCCESS, ETW_TRACE_GUID, EVENT_TRACE_LOGFILEW, EVENT_TRACE_REAL_TIME_MODE,
            EVENT_TRACE_SYSTEM_LOGGER_MODE, INVALID_PROCESSTRACE_HANDLE, PERF_WORKER_THREAD,
            PROCESS_TRACE_MODE_EVENT_RECORD, PROCESS_TRACE_MODE_REAL_TIME,
            TraceSystemTraceEnableFlagsInfo, WNODE_FLAG_TRACED_GUID,
        };
        use crate::util::to_wide;

        let mut name = to_wide(ETW_TRACE_NAME);
        let total = core::mem::size_of::<EVENT_TRACE_PROPERTIES>() + name.len() * 2;

        let mut session = Box::new(Self {
            session_handle: 0,
            parser_handle: INVALID_PROCESSTRACE_HANDLE,
            properties: vec![0u64; total.div_ceil(8)],
            work_item_routine,
        });

        unsafe {
            // A real-time session on the system logger, tracing nothing yet
            let properties = session.properties_ptr();
            (*properties).Wnode.BufferSize = total as u32;
            (*properties).Wnode.Guid = ETW_TRACE_GUID;
            (*properties).Wnode.ClientContext = 1;
            (*properties).Wnode.Flags = WNODE_FLAG_TRACED_GUID;
            (*properties).MinimumBuffers = 1;
            (*properties).LogFileMode =
                EVENT_TRACE_REAL_TIME_MODE | EVENT_TRACE_SYSTEM_LOGGER_MODE;
            (*properties).FlushTimer = 1;
            (*properties).LoggerNameOffset =
                core::mem::size_of::<EVENT_TRACE_PROPERTIES>() as u32;

            let error = StartTraceW(&mut session.session_handle, name.as_ptr(), properties);
            if error != ERROR_SUCCESS {
                println!("[-] Failed to create the event trace session: {error:#x}");
                return Err(R0akError::TraceSessionFailed);
            }

            // Attach the consumer before any flag is enabled
            let mut logfile = EVENT_TRACE_LOGFILEW::default();
            logfile.LoggerName = name.as_mut_ptr();
            logfile.ProcessTraceMode =
                PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
            logfile.EventRecordCallback = Some(record_callback);
            logfile.Context = (&mut *session as *mut Self).cast();
            session.parser_handle = OpenTraceW(&mut logfile);
            if session.parser_handle == INVALID_PROCESSTRACE_HANDLE {
                println!("[-] Failed to open a consumer handle for the trace session");
                session.stop_session();
                return Err(R0akError::TraceConsumerFailed);
            }

            // Worker-thread lifecycle events only
            let mut flags = [0u32; 8];
            flags[2] = PERF_WORKER_THREAD;
            let error = TraceSetInformation(
                session.session_handle,
                TraceSystemTraceEnableFlagsInfo,
                flags.as_mut_ptr().cast(),
                core::mem::size_of_val(&flags) as u32,
            );
            if error != ERROR_SUCCESS {
                println!("[-] Failed to set flags for event trace session: {error:#x}");
                session.stop_session();
                CloseTrace(session.parser_handle);
                return Err(R0akError::TraceSessionFailed);
            }
        }

        Ok(session)
    }

    /// Pumps trace events on the calling thread until the callback has seen
    /// the awaited routine and stopped the session, or the pump fails.
    /// Returns `true` only on a confirmed match.
    pub fn join(mut self: Box<Self>) -> bool {
        use crate::data::ERROR_SUCCESS;

        let error = unsafe {
            ProcessTrace(
                &mut self.parser_handle,
                1,
                core::ptr::null_mut(),
                core::ptr::null_mut(),
            )
        };
        if error != ERROR_SUCCESS {
            println!("[-] Failed to process trace: {error:#x}");
            self.stop_session();
        }
        unsafe { CloseTrace(self.parser_handle) };
        error == ERROR_SUCCESS
    }

    /// Tears the session down without pumping, for flows abandoned before
    /// the trigger fired.
    pub fn stop(mut self: Box<Self>) {
        self.stop_session();
        unsafe { CloseTrace(self.parser_handle) };
    }

    fn properties_ptr(&mut self) -> *mut EVENT_TRACE_PROPERTIES {
        self.properties.as_mut_ptr().cast()
    }

    fn stop_session(&mut self) {
        let properties = self.properties_ptr();
        unsafe {
            ControlTraceW(
                self.session_handle,
                core::ptr::null(),
                properties,
                crate::data::EVENT_TRACE_CONTROL_STOP,
            );
        }
    }
}

/// Consumer callback: stops the session once the item-end event for the
/// awaited routine shows up. May keep firing briefly after the stop
/// request; late and irrelevant records are ignored.
#[cfg(windows)]
unsafe extern "system" fn record_callback(record: *mut crate::data::EVENT_RECORD) {
    unsafe {
        let record = &*record;
        if record.UserContext.is_null()
            || record.UserData.is_null()
            || (record.UserDataLength as usize) < core::mem::size_of::<u64>()
        {
            return;
        }

        let session = &mut *record.UserContext.cast::<EtwSession>();
        let routine = record.UserData.cast::<u64>().read_unaligned();
        if matches_work_item_end(
            record.EventHeader.EventDescriptor.Opcode,
            routine,
            session.work_item_routine,
        ) {
            println!("[+] Kernel finished executing work item at 0x{routine:016X}");
            session.stop_session();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEM_END_OPCODE: u8 = 0x41;

    #[test]
    fn confirms_only_the_exact_routine() {
        let target = 0xFFFF_F800_1234_5678u64;
        assert!(matches_work_item_end(ITEM_END_OPCODE, target, target));
        assert!(!matches_work_item_end(ITEM_END_OPCODE, target + 8, target));
        assert!(!matches_work_item_end(ITEM_END_OPCODE, 0, target));
    }

    #[test]
    fn ignores_other_worker_thread_events() {
        let target = 0xFFFF_F800_1234_5678u64;
        // Item-start and thread lifecycle opcodes must not confirm
        assert!(!matches_work_item_end(0x40, target, target));
        assert!(!matches_work_item_end(0x01, target, target));
    }
}
