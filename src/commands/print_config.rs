use anyhow::Result;
use bustrack::relay_config::RelayConfig;

/// Print the effective configuration after file, env and CLI layering
pub fn handle_print_config(config: &RelayConfig) -> Result<()> {
    config.validate()?;
    print!("{}", config.to_toml()?);
    Ok(())
}
