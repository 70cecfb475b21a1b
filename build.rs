//! Build script for generating the `waystation` man pages.
//!
//! Packaging picks the pages up from the build output directory: one for the
//! top-level command and one per subcommand.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(man: Man, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    fs::write(path, buffer)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    let command = Cli::command();
    for sub in command.get_subcommands() {
        let name = format!("waystation-{}", sub.get_name());
        let man = Man::new(sub.clone()).title(name.to_uppercase());
        render(man, &out_dir.join(format!("{name}.1")))?;
    }
    render(Man::new(command), &out_dir.join("waystation.1"))
}
