use clap::Parser;

fn main() {
    dotenvy::dotenv().ok();
    let cli = harvestctl::Cli::parse();
    harvestctl::init_tracing(cli.verbose);
    if let Err(err) = harvestctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
