//! Small measurement target: allocate and touch memory, sleep, optionally print
//! its own peak counters, exit 0.

use std::time::Duration;
use wintime::format;

const USAGE: &str = "\
Usage: example-target <MiB alloc> [ms sleep] [stats]
  MiB alloc: MiB to allocate and touch
  ms sleep:  milliseconds to sleep after allocating
  stats:     any value; print own memory counters to compare with wintime";

fn parse(arg: Option<&String>) -> u64 {
    arg.and_then(|a| a.trim_start_matches('-').parse().ok())
        .unwrap_or(0)
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    eprintln!("Hello from the example target! Args given were: {}", args.join(" "));

    if args.len() == 1 {
        eprintln!("{}", USAGE);
    }

    let mut block = Vec::new();
    if args.len() >= 2 {
        let mib = parse(args.get(1));
        eprintln!("  -- Allocating {} MiB", mib);
        block = vec![0u8; (mib as usize) * 1024 * 1024];
        // Zeroed pages may be mapped lazily; write one byte per page.
        for byte in block.iter_mut().step_by(4096) {
            *byte = 1;
        }
        std::hint::black_box(&block);
    }

    if args.len() >= 3 {
        let ms = parse(args.get(2));
        eprintln!("  -- Sleeping {} milliseconds", ms);
        std::thread::sleep(Duration::from_millis(ms));
        eprintln!("  -- wake up!");
    }

    if args.len() >= 4 {
        match wintime::probe::own_counters() {
            Some(m) => {
                eprintln!("PageFaultCount: {}", m.page_faults);
                eprintln!("PeakWorkingSetSize: {}", format::bytes(m.peak_working_set));
                eprintln!("PeakPagefileUsage: {}", format::bytes(m.peak_pagefile));
            }
            None => eprintln!("memory counters unavailable"),
        }
    }

    drop(block);
    eprintln!("-- end of example target");
}
