mod session;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use session::{DEFAULT_DOWNLOAD_CAPACITY, Session};

/// Interactive fastboot session against a simulated Medfield device.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Write a timestamped transcript of the session to this file.
    #[arg(long)]
    transcript: Option<PathBuf>,
    /// Download buffer size in bytes.
    #[arg(long, default_value_t = DEFAULT_DOWNLOAD_CAPACITY)]
    capacity: usize,
}

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(cli.capacity, cli.transcript.as_deref())?;
    let mut line = String::new();

    writeln!(
        writer,
        "droidboot emulator ready. Type `help` for commands or `exit` to quit."
    )?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        let responses = session.handle_command(trimmed)?;
        for response in responses {
            writeln!(writer, "{response}")?;
        }
    }

    log::info!(
        "session ended after {} simulated device commands",
        session.platform().commands().len()
    );
    Ok(())
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}
