pub fn setup_logging(verbose_level: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        // Use RUST_LOG if set
        tracing_subscriber::EnvFilter::from_default_env()
    } else {
        // Map verbosity count to filters
        let filter_str = match verbose_level {
            0 => "warn,pagechat=info,llm=info,web=info",
            1 => "info,pagechat=debug,llm=debug,web=debug",
            _ => "debug,pagechat=trace,llm=trace,web=trace",
        };
        tracing_subscriber::EnvFilter::new(filter_str)
    };

    // Write to stderr so streamed replies on stdout stay clean
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}
