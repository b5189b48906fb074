use casetree::app::{AppConfig, CaseTreeApp};
use clap::Parser;

fn main() {
    let _ = env_logger::builder().format_timestamp(None).try_init();

    let config = AppConfig::parse();
    if let Err(err) = CaseTreeApp::run(&config) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
