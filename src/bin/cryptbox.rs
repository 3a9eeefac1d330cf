use anyhow::Result;

fn main() -> Result<()> {
    cryptbox::cli::run()
}
