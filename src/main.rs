use std::process::ExitCode;

use r0ak::R0akError;
use r0ak::sym::split_symbol;

fn banner() {
    println!("r0ak v1.0.0 -- Ring 0 Army Knife\n");
}

fn usage() {
    println!(
        "USAGE: r0ak.exe\n\
         \x20      [--execute <Address | module!function> <Argument>]\n\
         \x20      [--write   <Address | module!function> <Value>]\n\
         \x20      [--read    <Address | module!function> <Size>]"
    );
}

/// Parses a numeric literal: decimal, or `0x`/`0o`/`0b` prefixed.
fn parse_number(text: &str) -> Option<u64> {
    let (digits, radix) = match text.as_bytes() {
        [b'0', b'x' | b'X', ..] => (&text[2..], 16),
        [b'0', b'o' | b'O', ..] => (&text[2..], 8),
        [b'0', b'b' | b'B', ..] => (&text[2..], 2),
        _ => (text, 10),
    };
    u64::from_str_radix(digits, radix).ok()
}

/// A kernel location the operator named, before any resolution happened.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Address(u64),
    Symbol(String, String),
}

impl Target {
    /// Anything that is not a nonzero number must be `module!symbol`.
    fn parse(text: &str) -> Result<Self, R0akError> {
        match parse_number(text) {
            Some(address) if address != 0 => Ok(Self::Address(address)),
            _ => {
                let (module, symbol) = split_symbol(text).inspect_err(|_| {
                    println!("[-] Malformed symbol string: {text}");
                })?;
                Ok(Self::Symbol(module.to_string(), symbol.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Execute,
    Write,
    Read,
}

/// A fully validated command line. Building one touches no privileged
/// resource, so bad input fails before any kernel state is involved.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Request {
    command: Command,
    target: Target,
    value: u64,
}

impl Request {
    fn parse(arguments: &[String]) -> Result<Self, R0akError> {
        let [flag, target, value] = arguments else {
            return Err(R0akError::InvalidArgumentCount);
        };
        let command = match flag.as_str() {
            "--execute" => Command::Execute,
            "--write" => Command::Write,
            "--read" => Command::Read,
            _ => return Err(R0akError::InvalidArgumentCount),
        };
        let target = Target::parse(target)?;
        let value = parse_number(value).unwrap_or(0);

        // The move helper is 32-bit; sizes ride through the same writes
        match command {
            Command::Write if value > u32::MAX as u64 => {
                println!("[-] Invalid 64-bit value, r0ak only supports 32-bit");
                return Err(R0akError::OutOfRange);
            }
            Command::Read if value > u32::MAX as u64 => {
                println!("[-] Invalid size, r0ak can only read up to 4GB of data");
                return Err(R0akError::OutOfRange);
            }
            _ => {}
        }
        Ok(Self { command, target, value })
    }
}

#[cfg(windows)]
fn dispatch(request: &Request) -> anyhow::Result<()> {
    use anyhow::Context;
    use r0ak::exec::KernelExecute;
    use r0ak::read::read_kernel;
    use r0ak::run::execute_kernel;
    use r0ak::sym::{KernelRoutines, SymbolEngine};
    use r0ak::write::write_kernel;

    let engine = SymbolEngine::setup().context("failed to initialize symbol engine")?;
    let routines = KernelRoutines::resolve(&engine)?;

    let address = match &request.target {
        Target::Address(address) => *address,
        Target::Symbol(module, symbol) => engine
            .lookup(module, symbol)
            .with_context(|| format!("could not resolve {module}!{symbol}"))?,
    };

    let mut exec = KernelExecute::setup(routines.trampoline)
        .context("failed to setup ring 0 execution engine")?;

    match request.command {
        Command::Execute => {
            execute_kernel(&mut exec, &routines, address, request.value)
                .context("failed to execute function")?;
            println!("[+] Function executed successfully!");
        }
        Command::Write => {
            write_kernel(&mut exec, &routines, address, request.value as u32)
                .context("failed to write variable")?;
            println!("[+] Write executed successfully!");
        }
        Command::Read => {
            read_kernel(&mut exec, &routines, address, request.value as u32)
                .context("failed to read variable")?;
            println!("[+] Read executed successfully!");
        }
    }
    Ok(())
}

#[cfg(windows)]
fn main() -> ExitCode {
    banner();
    let arguments: Vec<String> = std::env::args().collect();
    let request = match Request::parse(&arguments[1..]) {
        Ok(request) => request,
        Err(R0akError::InvalidArgumentCount) => {
            usage();
            return ExitCode::FAILURE;
        }
        Err(_) => return ExitCode::FAILURE,
    };

    match dispatch(&request) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            println!("[-] {error:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(windows))]
fn main() -> ExitCode {
    banner();
    usage();
    println!("[-] This tool only runs on x64 Windows");
    ExitCode::FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn numbers_parse_in_every_radix() {
        assert_eq!(parse_number("0xFFFFF78000000000"), Some(0xFFFF_F780_0000_0000));
        assert_eq!(parse_number("0X10"), Some(16));
        assert_eq!(parse_number("0o755"), Some(0o755));
        assert_eq!(parse_number("0b1010"), Some(10));
        assert_eq!(parse_number("4096"), Some(4096));
        assert_eq!(parse_number("nt!NtImageInfo"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn targets_prefer_addresses_and_fall_back_to_symbols() {
        assert_eq!(
            Target::parse("0xFFFFF78000000800"),
            Ok(Target::Address(0xFFFF_F780_0000_0800))
        );
        assert_eq!(
            Target::parse("nt!KdDebuggerEnabled"),
            Ok(Target::Symbol("nt".into(), "KdDebuggerEnabled".into()))
        );
        // Zero is not a valid address, and not a symbol either
        assert_eq!(Target::parse("0"), Err(R0akError::MalformedSymbol));
        assert_eq!(Target::parse("ntoskrnl.exe"), Err(R0akError::MalformedSymbol));
    }

    #[test]
    fn requests_validate_before_any_work() {
        let parsed = Request::parse(&args(&["--write", "nt!KdDebuggerEnabled", "0x1"])).unwrap();
        assert_eq!(parsed.command, Command::Write);
        assert_eq!(parsed.value, 1);

        assert_eq!(
            Request::parse(&args(&["--write", "0x1000"])),
            Err(R0akError::InvalidArgumentCount)
        );
        assert_eq!(
            Request::parse(&args(&["--poke", "0x1000", "1"])),
            Err(R0akError::InvalidArgumentCount)
        );
        assert_eq!(
            Request::parse(&args(&["--write", "0x1000", "0x100000000"])),
            Err(R0akError::OutOfRange)
        );
        assert_eq!(
            Request::parse(&args(&["--read", "0x1000", "0x100000000"])),
            Err(R0akError::OutOfRange)
        );
        // Execute arguments stay full 64-bit
        let parsed =
            Request::parse(&args(&["--execute", "0x1000", "0xFFFFF78000000000"])).unwrap();
        assert_eq!(parsed.value, 0xFFFF_F780_0000_0000);
    }
}
