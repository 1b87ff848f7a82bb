use ujit_inspect::{*, error::*, util::*, log::*, settings::*, target::*, memory::*, value::*, stack::*, table::*, global_state::*, trace_locator::*};
use libc::pid_t;
use std::{process, str::FromStr, time::Duration, path::PathBuf};

const USAGE: &str = "usage: ujit-inspect (-p PID | -c CORE) [-e EXE] [--max-frames N] [--timeout SECS] [--plain-registers] [--symfile-dir DIR] [--verbose] COMMAND ARGS
commands:
  stack L [BASE [TOP]]           Lua stack of lua_State L, optionally only between BASE and TOP
  tv ADDR                        tagged value at ADDR
  str ADDR                       string object at ADDR
  tab ADDR                       table object at ADDR
  global-state L                 VM and GC state of lua_State L
  traces                         all traces registered for debuggers
  load-trace-dwarf [ADDR] [-o PATH]
                                 export the debug object of the trace containing ADDR (default: crash address)";

enum Source {
    Pid(pid_t),
    Core(String),
}

struct Args {
    source: Source,
    exe: Option<String>,
    verbose: bool,
    command: Vec<String>,
}

fn print_usage(msg: &str) {
    if !msg.is_empty() {
        eprintln!("error: {}", msg);
    }
    eprintln!("{}", USAGE);
}

fn usage_exit(msg: &str) -> ! {
    print_usage(msg);
    process::exit(2);
}

fn flag_value<'a>(args: &'a [String], i: usize) -> &'a str {
    match args.get(i + 1) {
        Some(v) => v,
        None => usage_exit(&format!("{} requires an argument", args[i])),
    }
}

fn parse_args(settings: &mut Settings) -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut source: Option<Source> = None;
    let mut exe: Option<String> = None;
    let mut verbose = false;
    let mut i = 1usize;
    while i < args.len() && args[i].starts_with("-") {
        match &args[i][..] {
            "-p" => {
                match pid_t::from_str(flag_value(&args, i)) {
                    Ok(p) if source.is_none() => source = Some(Source::Pid(p)),
                    Ok(_) => usage_exit("only one of -p and -c can be given"),
                    Err(e) => usage_exit(&format!("bad pid: {}", e)),
                }
                i += 2;
            }
            "-c" => {
                if source.is_some() {
                    usage_exit("only one of -p and -c can be given");
                }
                source = Some(Source::Core(flag_value(&args, i).to_string()));
                i += 2;
            }
            "-e" => {
                exe = Some(flag_value(&args, i).to_string());
                i += 2;
            }
            "--max-frames" => {
                settings.max_frames = match usize::from_str(flag_value(&args, i)) {
                    Ok(n) if n > 0 => n,
                    _ => usage_exit("--max-frames must be a positive integer"),
                };
                i += 2;
            }
            "--timeout" => {
                settings.time_budget = match f64::from_str(flag_value(&args, i)) {
                    Ok(s) if s > 0.0 && s.is_finite() => Some(Duration::from_secs_f64(s)),
                    _ => usage_exit("--timeout must be a positive number of seconds"),
                };
                i += 2;
            }
            "--plain-registers" => {
                settings.register_encoding = RegisterEncoding::Plain;
                i += 1;
            }
            "--symfile-dir" => {
                settings.symfile_dir = flag_value(&args, i).to_string();
                i += 2;
            }
            "--verbose" => {
                verbose = true;
                i += 1;
            }
            "-h" | "--help" => usage_exit(""),
            x => usage_exit(&format!("unrecognized argument: '{}'", x)),
        }
    }
    let source = match source {
        Some(s) => s,
        None => usage_exit("one of -p and -c is required"),
    };
    if i >= args.len() {
        usage_exit("no command");
    }
    Args {source, exe, verbose, command: args[i..].to_vec()}
}

fn main() {
    let mut settings = Settings::default();
    let args = parse_args(&mut settings);
    let code = inspect(&settings, &args);
    process::exit(code);
}

// Returns the exit code. Doesn't exit itself, so that the profile scope gets to report on every path.
fn inspect(settings: &Settings, args: &Args) -> i32 {
    let target = match args.source {
        Source::Pid(pid) => Target::attach(pid, args.exe.as_deref()),
        Source::Core(ref path) => Target::open_core(path, args.exe.as_deref()),
    };
    let target = match target {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };
    print_warnings(&target.warnings);

    let _profile = if args.verbose {ProfileScope::new(args.command[0].clone())} else {ProfileScope::disabled()};
    match run(settings, &target, &args.command) {
        Ok(()) => 0,
        Err(e) if e.is_usage() => {
            print_usage(&format!("{}", e));
            2
        }
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    }
}

fn print_warnings(warnings: &[String]) {
    for w in warnings {
        eprintln!("warning: {}", w);
    }
}

fn address_arg(command: &[String], idx: usize) -> Result<usize> {
    match command.get(idx) {
        Some(s) => parse_address(s),
        None => err!(Usage, "{} requires an address", command[0]),
    }
}

fn run(settings: &Settings, target: &Target, command: &[String]) -> Result<()> {
    let mem: &dyn MemoryView = target;
    match &command[0][..] {
        "stack" => {
            if command.len() > 4 {
                return err!(Usage, "too many arguments");
            }
            let l = address_arg(command, 1)?;
            let base = command.get(2).map(|s| parse_address(s)).transpose()?;
            let top = command.get(3).map(|s| parse_address(s)).transpose()?;
            let dump = reconstruct_stack(mem, settings, l, base, top)?;
            print!("{}", dump);
            print_warnings(&dump.warnings);
            if let Some(e) = &dump.truncated {
                eprintln!("warning: stack is truncated: {}", e);
            }
        }
        "tv" => {
            let a = address_arg(command, 1)?;
            println!("{}", decode_value(mem, settings, ValueSource::Address(a))?);
        }
        "str" => {
            let a = address_arg(command, 1)?;
            let s = ValueDecoder::new(mem, settings).read_string(a)?;
            println!("{}", s);
        }
        "tab" => {
            let a = address_arg(command, 1)?;
            let dump = dump_table(mem, settings, a)?;
            print!("{}", dump);
            print_warnings(&dump.warnings);
        }
        "global-state" => {
            let l = address_arg(command, 1)?;
            println!("{}", read_global_state(mem, &settings.layout, l)?);
        }
        "traces" => {
            let listing = list_traces(mem, settings)?;
            print!("{}", listing);
            // An aborted traversal is among the warnings.
            print_warnings(&listing.warnings);
        }
        "load-trace-dwarf" => load_trace_dwarf(settings, target, &command[1..])?,
        x => return err!(Usage, "unknown command: '{}'", x),
    }
    Ok(())
}

fn load_trace_dwarf(settings: &Settings, target: &Target, args: &[String]) -> Result<()> {
    let mut addr: Option<usize> = None;
    let mut out: Option<PathBuf> = None;
    let mut i = 0usize;
    while i < args.len() {
        if args[i] == "-o" {
            match args.get(i + 1) {
                Some(p) => out = Some(PathBuf::from(p)),
                None => return err!(Usage, "-o requires a path"),
            }
            i += 2;
        } else if addr.is_none() {
            addr = Some(parse_address(&args[i])?);
            i += 1;
        } else {
            return err!(Usage, "unexpected argument: '{}'", args[i]);
        }
    }
    let addr = match addr.or_else(|| target.default_address()) {
        Some(a) => a,
        None => return err!(Usage, "load-trace-dwarf needs an address (there's no crash address to default to)"),
    };

    let search = locate_trace_for_address(target, settings, addr as u64)?;
    print_warnings(&search.warnings);
    let m = match search.found() {
        Some(m) => m,
        None => {
            println!("{}", search);
            return Ok(());
        }
    };
    println!("{}", search);
    let path = match out {
        Some(p) => p,
        None => default_symfile_path(settings, m.entry.index),
    };
    export_trace_blob(m, &path)?;
    println!("{}", add_symbol_file_command(&path, m.low_pc()));
    Ok(())
}
