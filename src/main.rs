use reply_relay::cli::{Args, Parser};

fn main() {
    let args = Args::parse();
    reply_relay::logging::init(args.verbose);

    if let Err(err) = reply_relay::run(args) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}
