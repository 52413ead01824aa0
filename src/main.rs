#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("mallscope requires Linux (ptrace). This binary was built for a non-Linux target.");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    linux::run()
}

#[cfg(target_os = "linux")]
mod linux {
    use clap::{Parser, Subcommand};
    use colored::Colorize;
    use nix::unistd::Pid;

    use mallscope::config::{parse_addr, HeapConfig};
    use mallscope::heap::{Bin, Bins, Heap};
    use mallscope::inferior::Inferior;
    use mallscope::live::LiveProcess;
    use mallscope::sizes::BinType;
    use mallscope::types::{version_or_unknown, GlibcVersion};

    #[derive(Parser)]
    #[command(name = "mallscope", about = "Inspect the glibc malloc state of a running process")]
    struct Cli {
        /// Process to inspect
        #[arg(short = 'p', long = "pid")]
        pid: i32,

        /// Read memory without stopping the process (no thread-local state)
        #[arg(long)]
        no_attach: bool,

        /// Address override, e.g. `main_arena=0x7ffff7e19c80` (repeatable)
        #[arg(long = "set", value_name = "NAME=ADDR")]
        overrides: Vec<String>,

        /// Assume this glibc version, e.g. `2.35`
        #[arg(long = "glibc", value_name = "VERSION")]
        glibc: Option<GlibcVersion>,

        /// Force safe-linking decoding on or off
        #[arg(long, value_name = "BOOL")]
        safe_linking: Option<bool>,

        /// Maximum entries shown per free list
        #[arg(long, value_name = "N")]
        chain_limit: Option<usize>,

        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand)]
    enum Command {
        /// List arenas and their heap segments
        Arenas,
        /// Show fastbins
        Fastbins {
            #[arg(long, value_parser = parse_hex)]
            arena: Option<u64>,
        },
        /// Show the thread's tcache
        Tcache {
            #[arg(long, value_parser = parse_hex)]
            tcache: Option<u64>,
        },
        /// Show the unsorted bin
        Unsorted {
            #[arg(long, value_parser = parse_hex)]
            arena: Option<u64>,
        },
        /// Show small bins
        Smallbins {
            #[arg(long, value_parser = parse_hex)]
            arena: Option<u64>,
        },
        /// Show large bins
        Largebins {
            #[arg(long, value_parser = parse_hex)]
            arena: Option<u64>,
        },
        /// Show every bin of an arena and the thread's tcache
        Bins {
            #[arg(long, value_parser = parse_hex)]
            arena: Option<u64>,
        },
        /// Decode the chunk at an address
        Chunk {
            #[arg(value_parser = parse_hex)]
            addr: u64,
        },
        /// Walk the chunks of a heap segment
        Heap {
            /// First chunk (defaults to the main arena's heap)
            #[arg(value_parser = parse_hex)]
            start: Option<u64>,
        },
        /// Show the heap region holding an address (or the main heap)
        HeapBounds {
            #[arg(value_parser = parse_hex)]
            addr: Option<u64>,
        },
        /// Show malloc parameters (`mp_`)
        Mp,
    }

    fn parse_hex(s: &str) -> Result<u64, String> {
        parse_addr(s).map_err(|e| e.to_string())
    }

    pub fn run() -> anyhow::Result<()> {
        env_logger::builder()
            .parse_env(env_logger::Env::new().filter_or("MALLSCOPE_LOG", "warn"))
            .format_timestamp(None)
            .init();

        let cli = Cli::parse();

        let mut config = HeapConfig::default();
        for spec in &cli.overrides {
            config.set_override(spec)?;
        }
        config.glibc_version = cli.glibc;
        config.safe_linking = cli.safe_linking;
        if let Some(limit) = cli.chain_limit {
            config.chain_limit = limit;
        }

        let pid = Pid::from_raw(cli.pid);
        let process = if cli.no_attach {
            LiveProcess::open(pid)?
        } else {
            LiveProcess::attach(pid)?
        };
        let heap = Heap::new(process, config);
        println!(
            "{} process {} (glibc {}, {})",
            "mallscope".bold().cyan(),
            pid,
            version_or_unknown(heap.glibc_version()),
            heap.inferior().arch(),
        );

        match cli.command {
            Command::Arenas => cmd_arenas(&heap),
            Command::Fastbins { arena } => print_bins(&heap.fastbins(arena)?),
            Command::Tcache { tcache } => print_bins(&heap.tcachebins(tcache)?),
            Command::Unsorted { arena } => print_bins(&heap.unsortedbin(arena)?),
            Command::Smallbins { arena } => print_bins(&heap.smallbins(arena)?),
            Command::Largebins { arena } => print_bins(&heap.largebins(arena)?),
            Command::Bins { arena } => cmd_bins(&heap, arena),
            Command::Chunk { addr } => cmd_chunk(&heap, addr),
            Command::Heap { start } => cmd_heap(&heap, start),
            Command::HeapBounds { addr } => cmd_heap_bounds(&heap, addr),
            Command::Mp => cmd_mp(&heap),
        }
    }

    fn hex(v: u64) -> colored::ColoredString {
        format!("{:#x}", v).cyan()
    }

    fn cmd_arenas(heap: &Heap<LiveProcess>) -> anyhow::Result<()> {
        let current = heap.thread_arena().ok();
        for arena in heap.arenas()? {
            let mut line = format!(
                "  {} {}",
                if arena.is_main { "main_arena" } else { "arena" }.bold(),
                hex(arena.addr)
            );
            if current == Some(arena.addr) {
                line.push_str(&format!(" {}", "(current)".green()));
            }
            if arena.incomplete {
                line.push_str(&format!(" {}", "(incomplete)".yellow()));
            }
            println!("{}", line);
            for segment in &arena.heaps {
                println!(
                    "      heap {}  first chunk {}",
                    hex(segment.addr),
                    hex(segment.first_chunk)
                );
            }
        }
        Ok(())
    }

    fn cmd_bins(heap: &Heap<LiveProcess>, arena: Option<u64>) -> anyhow::Result<()> {
        match heap.tcachebins(None) {
            Ok(bins) => print_bins(&bins)?,
            Err(e) => println!("  {}: {}", "tcache".bold(), e.to_string().yellow()),
        }
        print_bins(&heap.fastbins(arena)?)?;
        print_bins(&heap.unsortedbin(arena)?)?;
        print_bins(&heap.smallbins(arena)?)?;
        print_bins(&heap.largebins(arena)?)
    }

    fn print_bins(bins: &Bins) -> anyhow::Result<()> {
        println!("{}", format!("{} bins", bins.kind).bold());
        let mut any = false;
        for (size, bin) in bins.non_empty() {
            any = true;
            print_bin(bins.kind, *size, bin);
        }
        if !any {
            println!("  {}", "empty".yellow());
        }
        Ok(())
    }

    fn print_bin(kind: BinType, size: u64, bin: &Bin) {
        let label = match (kind, bin.count) {
            (BinType::Unsorted, _) => "all".to_string(),
            (_, Some(count)) => format!("{:#x} [{:>3}]", size, count),
            _ => format!("{:#x}", size),
        };
        let mut links: Vec<String> = bin.chunks().iter().map(|&a| format!("{:#x}", a)).collect();
        if bin.fd.last() == Some(&0) {
            links.push("0x0".to_string());
        } else if bin.head.is_none() && !bin.fd.is_empty() {
            links.push("...".to_string());
        }
        print!("  {}: {}", label.bold(), links.join(" → ").cyan());
        if bin.corrupted {
            print!(" {}", "(corrupted)".red());
        }
        println!();
    }

    fn cmd_chunk(heap: &Heap<LiveProcess>, addr: u64) -> anyhow::Result<()> {
        let chunk = heap.chunk(addr)?;
        let show = |v: Option<u64>| v.map_or_else(|| "??".red(), hex);
        println!("  {}  {}", "chunk".bold(), hex(addr));
        println!("  prev_size  {}", show(chunk.prev_size()));
        println!("  size       {}", show(chunk.real_size()));
        match chunk.flags() {
            Some(flags) => println!(
                "  flags      PREV_INUSE={} IS_MMAPPED={} NON_MAIN_ARENA={}",
                flags.prev_inuse as u8, flags.is_mmapped as u8, flags.non_main_arena as u8
            ),
            None => println!("  flags      {}", "??".red()),
        }
        println!("  fd         {}", show(chunk.fd()));
        println!("  bk         {}", show(chunk.bk()));
        if let Ok(arena) = heap.arena_for_chunk(addr) {
            println!("  arena      {}", hex(arena));
        }
        Ok(())
    }

    fn cmd_heap(heap: &Heap<LiveProcess>, start: Option<u64>) -> anyhow::Result<()> {
        let arena = heap.arena_state(heap.main_arena()?)?;
        let start = match start {
            Some(addr) => addr,
            None => heap.heap_boundaries(None)?.start.addr(),
        };
        for addr in heap.walk_chunks(start, Some(arena.top))? {
            let chunk = heap.chunk(addr)?;
            let size = chunk.real_size().map_or_else(|| "??".red(), hex);
            let tag = if addr == arena.top { " (top)".green().to_string() } else { String::new() };
            println!("  {}  size {}{}", hex(addr), size, tag);
        }
        Ok(())
    }

    fn cmd_heap_bounds(heap: &Heap<LiveProcess>, addr: Option<u64>) -> anyhow::Result<()> {
        let region = heap.heap_boundaries(addr)?;
        println!(
            "  {}..{}  {}  {}",
            hex(region.start.addr()),
            hex(region.end.addr()),
            region.perms,
            region.label()
        );
        Ok(())
    }

    fn cmd_mp(heap: &Heap<LiveProcess>) -> anyhow::Result<()> {
        let params = heap.malloc_params()?;
        println!("  {} {}", "mp_".bold(), hex(params.addr));
        for (name, value) in &params.fields {
            println!("  {:>20}  {}", name.bold(), hex(*value));
        }
        match heap.global_max_fast() {
            Ok(v) => println!("  {:>20}  {}", "global_max_fast".bold(), hex(v)),
            Err(e) => println!("  {:>20}  {}", "global_max_fast".bold(), e.to_string().yellow()),
        }
        Ok(())
    }
}
