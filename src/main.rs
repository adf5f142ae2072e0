fn main() {
    #[cfg(feature = "cli")]
    wdiff::cli::run();

    #[cfg(not(feature = "cli"))]
    {
        eprintln!("wdiff: CLI not enabled. Rebuild with `--features cli`.");
        std::process::exit(1);
    }
}
