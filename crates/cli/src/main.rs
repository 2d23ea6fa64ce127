use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut stdout = std::io::stdout().lock();
    let code = cli::main_with(std::env::args_os(), &mut stdout);
    std::process::exit(code);
}
