use std::env;
use std::io;
use std::path::{Path, PathBuf};

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::{DEFAULT_DOWNLOAD_CAPACITY, Session};

const DEFAULT_DIR: &str = "transcripts";

fn main() -> io::Result<()> {
    let dir = env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_DIR), PathBuf::from);
    record(&dir.join("provision.log"), record_provision)?;
    record(&dir.join("low-power.log"), record_low_power)?;
    Ok(())
}

fn record(path: &Path, script: fn(&mut Session) -> io::Result<()>) -> io::Result<()> {
    let mut session = Session::new(DEFAULT_DOWNLOAD_CAPACITY, Some(path))?;
    script(&mut session)?;
    println!(
        "{}: {} device commands, restarts {:?}",
        path.display(),
        session.platform().commands().len(),
        session.platform().power().restarts()
    );
    Ok(())
}

fn record_provision(session: &mut Session) -> io::Result<()> {
    session.handle_command("getvar:version")?;
    session.handle_command("getvar:product")?;
    session.handle_command("oem tarball_origin mount_point")?;
    session.handle_command("getvar:tarball_origin")?;
    session.handle_command("erase:cache")?;
    session.handle_command("oem system echo hello")?;
    session.handle_command("status")?;
    session.handle_command("reboot-bootloader")?;
    Ok(())
}

fn record_low_power(session: &mut Session) -> io::Result<()> {
    session.handle_command("power low")?;
    session.handle_command("getvar:version")?;
    session.handle_command("erase:data")?;
    session.handle_command("power ok")?;
    session.handle_command("erase:data")?;
    session.handle_command("status")?;
    Ok(())
}
