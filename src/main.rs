use std::env;
use std::error::Error;
use std::fs::{self, File};
use std::io::{self, BufRead, BufWriter};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use common::RAM_SIZE;
use sim::{Computer, NullScreen, Screen, TermScreen};

const TICK_CAP: u64 = 1 << 14;
const TICK_CAP_FAST: u64 = 1 << 20;

#[derive(Default)]
struct Modes {
    debug: bool,
    ram_dump: bool,
    mult: bool,
    fast: bool,
    manual: bool,
    tokens: bool,
    screen: bool,
}

impl Modes {
    /// Peel trailing single-letter flags off the argument list; they
    /// stack after the file name.
    fn take(args: &mut Vec<String>) -> Modes {
        let mut modes = Modes::default();
        while let Some(last) = args.last().map(|s| s.as_str()) {
            match last {
                "-d" => modes.debug = true,
                "-r" => modes.ram_dump = true,
                "-m" => modes.mult = true,
                "-f" => modes.fast = true,
                "-s" => modes.manual = true,
                "-t" => modes.tokens = true,
                "-v" => modes.screen = true,
                _ => break,
            }
            args.pop();
        }
        modes
    }
}

fn main() -> ExitCode {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let modes = Modes::take(&mut args);

    let result = match args.first().map(|s| s.as_str()) {
        Some("ucode") => emit_ucode(args.get(1).map(|s| s.as_str())),
        Some("assemble") => match args.get(1) {
            Some(path) => assemble_only(path, &modes),
            None => usage(),
        },
        Some("run") => match args.get(1) {
            Some(path) => run(path, &modes),
            None => usage(),
        },
        Some(path) => run(path, &modes),
        None => usage(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn usage() -> Result<(), Box<dyn Error>> {
    eprintln!("usage: sbb [run] <file.sbbasm> [-d] [-t] [-r] [-m] [-f] [-s] [-v]");
    eprintln!("       sbb assemble <file.sbbasm> [-t] [-r]");
    eprintln!("       sbb ucode [control_signals.rom]");
    Ok(())
}

fn emit_ucode(path: Option<&str>) -> Result<(), Box<dyn Error>> {
    let path = path.unwrap_or("control_signals.rom");
    let file = File::create(path)?;
    let mut file = BufWriter::new(file);
    ucode::write_rom(&mut file, &ucode::UCODE)?;
    println!("wrote {} entries to {}", ucode::ROM_WORDS, path);
    Ok(())
}

fn compile(path: &str, modes: &Modes) -> Result<assemble::Program, Box<dyn Error>> {
    let source = fs::read_to_string(path)?;
    let started = Instant::now();
    let program = assemble::assemble(&source)?;
    println!(
        "Compiled successfully ({:.2}ms)",
        started.elapsed().as_secs_f64() * 1000.0
    );
    println!(
        "Program size: {} bytes ({:.2}%)",
        program.size,
        program.size as f64 / RAM_SIZE as f64 * 100.0
    );
    if modes.tokens {
        for token in &program.tokens {
            println!("[asm] {}", token);
        }
    }
    if modes.debug {
        println!("[debug] line pointers:");
        for (i, addr) in program.line_addr.iter().enumerate() {
            if let Some(addr) = addr {
                println!("    line {} -> {}", i + 1, addr);
            }
        }
    }
    Ok(program)
}

fn assemble_only(path: &str, modes: &Modes) -> Result<(), Box<dyn Error>> {
    let program = compile(path, modes)?;
    if modes.ram_dump {
        let mut c = Computer::new();
        c.load(&program.ram);
        for token in &program.tokens {
            if token.bytes.is_empty() {
                continue;
            }
            println!("[asm] {}", token);
            let start = token.addr as usize;
            print!("{}", c.ram.dump(start, start + token.bytes.len() - 1));
        }
    }
    Ok(())
}

fn run(path: &str, modes: &Modes) -> Result<(), Box<dyn Error>> {
    let program = compile(path, modes)?;

    let mut computer = Computer::with_print(modes.debug);
    computer.load(&program.ram);

    let mut term_screen;
    let mut null_screen = NullScreen;
    let screen: &mut dyn Screen = if modes.screen {
        term_screen = TermScreen::new();
        &mut term_screen
    } else {
        &mut null_screen
    };

    if modes.manual {
        manual_loop(&mut computer, screen)?;
    } else if program.ends {
        // halting program: run it out and report the clock rate
        let started = Instant::now();
        let mut ticks = 0u64;
        while computer.step(screen) {
            ticks += 1;
        }
        let elapsed = started.elapsed().as_secs_f64();
        println!(
            "Program execution: {:.2}ms, {:.2}kHz",
            elapsed * 1000.0,
            ticks as f64 / elapsed / 1000.0
        );
    } else {
        // no halt anywhere in the source: pace it against a tick cap
        let cap = if modes.fast { TICK_CAP_FAST } else { TICK_CAP };
        let mut ticks = 0u64;
        while ticks < cap && computer.step(screen) {
            ticks += 1;
            if !modes.fast {
                thread::sleep(Duration::from_millis(30));
            }
        }
        println!("Stopped after {} ticks", ticks);
    }

    println!("OUT: {}", computer.out);

    if modes.ram_dump {
        print!("{}", computer.ram.dump(0x400, 0x41f));
    }
    if modes.mult {
        let result = (0..4).fold(0u32, |acc, i| {
            acc | (computer.ram.get(0x500 + i) as u32) << (i * 8)
        });
        println!("Result: {}", result);
    }
    Ok(())
}

fn manual_loop(computer: &mut Computer, screen: &mut dyn Screen) -> Result<(), Box<dyn Error>> {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        if line?.trim().eq_ignore_ascii_case("stop") {
            break;
        }
        if !computer.step(screen) {
            break;
        }
        println!("{:?}", computer);
    }
    Ok(())
}
