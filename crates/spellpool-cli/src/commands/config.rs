use spellpool_core::PoolConfig;

pub fn print(config: &PoolConfig) -> anyhow::Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}
