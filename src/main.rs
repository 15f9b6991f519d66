use clap::Parser;

fn main() {
    let cli = keygate::cli::Cli::parse();
    if let Err(err) = keygate::app::run(cli) {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
