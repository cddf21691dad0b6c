use anyhow::Result;

use qto_categorizer::io::configs::Resolvers;

fn main() -> Result<()> {
    qto_cli::run_with(std::env::args_os(), &Resolvers::default())?;
    Ok(())
}
