use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    let mut signals = operator_harness::ShutdownSignals::install();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = match operator_harness::parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(e) => std::process::exit(operator_harness::usage_exit(&e)),
    };

    let code = operator_harness::run(&args, &mut signals).await;
    std::process::exit(code);
}
