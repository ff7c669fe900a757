//! Manifest command - print the resolved manifest

use crate::cli::args::ManifestArgs;
use crate::error::BuildResult;
use crate::manifest::Manifest;

/// Execute the manifest command
pub async fn execute(args: ManifestArgs) -> BuildResult<()> {
    let manifest = Manifest::load(&args.manifest)?;

    match args.branch_key {
        Some(arch) => println!("{}", manifest.branch_key(&arch)),
        None => println!("{}", manifest.to_json_pretty()?),
    }

    Ok(())
}
