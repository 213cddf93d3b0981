use clap::Parser;

fn main() {
    let cli = enlistctl::Cli::parse();
    if let Err(err) = enlistctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
