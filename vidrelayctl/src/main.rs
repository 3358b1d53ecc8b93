use clap::Parser;

fn main() {
    let cli = vidrelayctl::Cli::parse();
    if let Err(err) = vidrelayctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
