use anyhow::Result;

fn main() -> Result<()> {
    molt::run()?;
    Ok(())
}
