fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Flags: --config=PATH, --report-json=PATH, --no-stdout-log.
    // Exit codes: 0 clean, 1 completed with failures, 2 aborted, 3 invalid settings.
    let code = attach_migrator::run_cli(&args);
    std::process::exit(code);
}
