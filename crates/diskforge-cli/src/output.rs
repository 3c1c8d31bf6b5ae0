//! Formatted output helpers for CLI commands.
//!
//! Results go to stdout; progress and diagnostics go to stderr so the
//! structured log stream stays separable.

use std::time::Duration;

use diskforge_runtime::BuildOutcome;

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[allow(clippy::print_stderr)]
pub fn print_header() {
    eprintln!();
    eprintln!("  {BOLD}diskforge{RESET} {DIM}v{}{RESET}", env!("CARGO_PKG_VERSION"));
    eprintln!();
}

/// Prints the artifacts of a finished build.
#[allow(clippy::print_stdout)]
pub fn print_outcome(outcome: &BuildOutcome, elapsed: Duration) {
    println!(
        "  {GREEN}{BOLD}Built{RESET} {} ({}) in {:.1}s",
        outcome.image.display(),
        format_bytes(outcome.size_bytes),
        elapsed.as_secs_f64()
    );
    if let Some(tarball) = &outcome.tarball {
        println!("  {DIM}tarball:{RESET} {}", tarball.display());
    }
    println!("  {DIM}log:{RESET}     {}", outcome.log.display());
    println!("  {DIM}build:{RESET}   {}", outcome.id);
}

/// Prints the diagnostic log lines attached to a failure.
#[allow(clippy::print_stderr)]
pub fn print_log_tail(tail: &[String]) {
    eprintln!();
    eprintln!("  {RED}{BOLD}Last log lines:{RESET}");
    for line in tail {
        eprintln!("    {DIM}{line}{RESET}");
    }
    eprintln!();
}

/// Prints a cache key, and whether the cache holds it when known.
#[allow(clippy::print_stdout)]
pub fn print_digest(hex: &str, cached: Option<bool>) {
    match cached {
        Some(true) => println!("{hex}  cached"),
        Some(false) => println!("{hex}  not cached"),
        None => println!("{hex}"),
    }
}

/// Prints one line per required tool.
#[allow(clippy::print_stdout)]
pub fn print_tool_check(tools: &[&str], missing: &[String]) {
    for tool in tools {
        if missing.iter().any(|m| m == tool) {
            println!("  {RED}✗{RESET} {tool}");
        } else {
            println!("  {GREEN}✓{RESET} {tool}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_displays_bytes() {
        assert_eq!(format_bytes(512), "512 B");
    }

    #[test]
    fn format_bytes_displays_kib() {
        assert_eq!(format_bytes(2048), "2.0 KiB");
    }

    #[test]
    fn format_bytes_displays_mib() {
        assert_eq!(format_bytes(104_857_600), "100.0 MiB");
    }

    #[test]
    fn format_bytes_displays_gib() {
        assert_eq!(format_bytes(2_147_483_648), "2.0 GiB");
    }
}
