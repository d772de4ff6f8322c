use clap::error::ErrorKind;
use clap::Parser;
use convsweep::config::{Cli, Settings};
use convsweep::SetupError;

fn main() {
    convsweep::init_logger();
    if let Err(e) = run() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), SetupError> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => return Err(SetupError::Usage(e.render().to_string())),
    };
    let settings = Settings::from_cli(&cli, |name| std::env::var(name).ok())?;
    let mut driver = settings.driver()?;
    driver.run(&settings.plan);
    Ok(())
}
