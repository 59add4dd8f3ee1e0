use anyhow::Context;

use dsmap::cli::cli_main;

fn main() -> anyhow::Result<()> {
    cli_main().context("cli_main failed")?;
    logger::debug!("cli_main done");
    Ok(())
}
