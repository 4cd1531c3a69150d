//! Renders `labwright.1` plus one `labwright-<subcommand>.1` page per
//! subcommand into `OUT_DIR` for packaging.

use std::env;
use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

fn main() -> Result<(), Box<dyn Error>> {
    let mut stdout = io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?;

    let command = cli::Cli::command();
    render(&command, &out_dir.join("labwright.1"))?;
    for subcommand in command.get_subcommands() {
        let name = format!("labwright-{}", subcommand.get_name());
        let page = subcommand.clone().name(name.clone());
        render(&page, &out_dir.join(format!("{name}.1")))?;
    }
    Ok(())
}

fn render(command: &Command, target: &Path) -> Result<(), Box<dyn Error>> {
    let mut buffer = Vec::new();
    Man::new(command.clone()).render(&mut buffer)?;
    fs::write(target, buffer)?;
    Ok(())
}
