//! On-target smoke test. Run elevated on an x64 Windows machine with an
//! SDK/WDK installed; everything else is covered by the unit tests.

#[cfg(windows)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use r0ak::exec::KernelExecute;
    use r0ak::pool::KernelAlloc;
    use r0ak::read::read_kernel;
    use r0ak::sym::{KernelRoutines, SymbolEngine};
    use r0ak::write::write_kernel;

    // A committed placement must surface in the big-pool snapshot at a
    // kernel address. Kept alive: it doubles as scratch kernel memory.
    let mut alloc = KernelAlloc::new(0x100)?;
    alloc.buffer_mut().fill(0x41);
    let scratch = alloc.commit()?;
    assert!(scratch >= 0xFFFF_0000_0000_0000, "not a kernel address: {scratch:#x}");
    println!("[+] Pool placement landed at 0x{scratch:016X}");

    let engine = SymbolEngine::setup()?;
    let routines = KernelRoutines::resolve(&engine)?;
    let mut exec = KernelExecute::setup(routines.trampoline)?;

    // Reading the placement back must show the pattern we pushed in
    let data = read_kernel(&mut exec, &routines, scratch, 16)?;
    assert!(data.iter().all(|&b| b == 0x41), "pattern mismatch: {data:02X?}");

    // A 4-byte write to the placement must read back in native order
    let marker = 0xC0DE_1337u32;
    write_kernel(&mut exec, &routines, scratch, marker)?;
    let data = read_kernel(&mut exec, &routines, scratch, 4)?;
    assert_eq!(u32::from_ne_bytes(data[..4].try_into()?), marker);
    println!("[+] Write/read round trip confirmed");

    drop(alloc);
    Ok(())
}

#[cfg(not(windows))]
fn main() {
    println!("[-] Smoke test only runs on x64 Windows");
}
