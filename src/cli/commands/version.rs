//! Version command - show version information

/// Print version information
///
/// If verbose is false, prints a single line with name and version.
/// If verbose is true, prints detailed build and feature information.
pub fn print_version(verbose: bool) {
    println!("{} {}", crate::NAME, crate::VERSION);

    if verbose {
        println!();
        println!("Features:");
        println!("  - SSH proxy authenticated by public key");
        println!("  - Shell, exec, scp, port and agent forwarding relay");
        println!("  - Recordings with live review sessions");
        println!("  - JSONL event logging");
        println!();
        println!("Build info:");
        println!("  Target:    {}", std::env::consts::ARCH);
        println!("  OS:        {}", std::env::consts::OS);
        println!("  Rust:      {}", env!("RUSTC_VERSION"));
        if let Ok(exe) = std::env::current_exe() {
            println!("  Executable: {}", exe.display());
        }
    }
}
