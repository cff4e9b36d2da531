use kiln::{cli, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());
    telemetry::init(cli.verbose);

    if let Err(err) = cli::run(cli) {
        tracing::error!("error: {err}");
        eprintln!("kiln: {err}");
        std::process::exit(1);
    }
}
