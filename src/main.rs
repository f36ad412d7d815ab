use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;

use canfork::probe;
use canfork::probe::DEFAULT_MULTIPLIERS;

#[derive(Parser)]
#[command(name = "canfork", about = "Guess whether a process can fork given free memory")]
struct Args {
    /// Process to inspect: a numeric PID or `self`
    pid: String,

    /// Directory holding `<pid>/smaps` and `meminfo`
    #[arg(long, default_value = "/proc")]
    proc_root: PathBuf,

    /// Comma-separated percentages of the largest accounted VMA to reserve
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_MULTIPLIERS)]
    multipliers: Vec<u32>,

    /// Skip the reservation probe
    #[arg(long)]
    no_probe: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(&args) {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => ExitCode::from(1),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}

/// Returns whether the fork is at risk.
fn run(args: &Args) -> Result<bool> {
    let smaps = args.proc_root.join(&args.pid).join("smaps");
    let vmas = canfork::read_memory_map_path(&smaps)
        .with_context(|| format!("reading {}", smaps.display()))?;

    let meminfo_path = args.proc_root.join("meminfo");
    let meminfo = canfork::read_meminfo_path(&meminfo_path)
        .with_context(|| format!("reading {}", meminfo_path.display()))?;

    let max_vma = canfork::max_accounted_vma_size(&vmas)
        .with_context(|| format!("sizing accounted VMAs of pid {}", args.pid))?;
    let mem_free = meminfo
        .mem_free()
        .ok_or(canfork::Error::MissingField { field: "MemFree" })
        .with_context(|| format!("reading {}", meminfo_path.display()))?;
    let at_risk = canfork::at_risk(max_vma, mem_free);

    println!("MaxVma:  {} kB", max_vma);
    println!("MemFree: {} kB", mem_free);

    if !args.no_probe {
        print_probe(max_vma, &args.multipliers);
    }

    println!("Status:  {}", u8::from(at_risk));
    Ok(at_risk)
}

/// Prints one line per multiplier. Zero-sized candidates are not attempted.
fn print_probe(max_vma: u64, multipliers: &[u32]) {
    let (empty, sized): (Vec<u32>, Vec<u32>) = multipliers
        .iter()
        .copied()
        .partition(|&multiplier| probe::candidate_kb(max_vma, multiplier) == Some(0));
    let mut outcomes = probe::probe_allocations(max_vma, &sized).into_iter();

    for &multiplier in multipliers {
        let line = if empty.contains(&multiplier) {
            "0 kB skipped".to_owned()
        } else {
            let reserved = outcomes.next().is_some_and(|outcome| outcome.reserved);
            let size = probe::candidate_kb(max_vma, multiplier)
                .map_or_else(|| "overflow".to_owned(), |kb| format!("{kb} kB"));
            let status = if reserved { "ok" } else { "failed" };
            format!("{size} {status}")
        };
        println!("Probe {:>3}%: {}", multiplier, line);
    }
}
