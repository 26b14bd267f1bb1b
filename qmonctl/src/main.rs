use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = qmonctl::Cli::parse();
    qmonctl::init_tracing(cli.verbose);
    if let Err(err) = qmonctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
