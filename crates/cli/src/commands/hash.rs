// Control password generation

use anyhow::{Context, Result};
use serde::Serialize;
use torpool::credentials::{generate_password, random_password_length};
use torpool::{PasswordHasher, PoolConfig, TorPasswordHasher};

use crate::output::{print_field, OutputFormat};

#[derive(Serialize)]
struct HashOutput {
    password: String,
    hashed_password: String,
}

pub async fn run(config: &PoolConfig, password: Option<String>, format: OutputFormat) -> Result<()> {
    let password = password
        .unwrap_or_else(|| generate_password(random_password_length(config.password_length())));

    let hasher = TorPasswordHasher::new(config.tor_binary.clone(), config.hash_regex()?);
    let hashed_password = hasher
        .hash(&password)
        .await
        .context("Failed to hash control password")?;

    let output = HashOutput {
        password,
        hashed_password,
    };

    if !format.is_text() {
        return format.print_value(&output);
    }

    print_field("Password", &output.password);
    print_field("Hash", &output.hashed_password);
    Ok(())
}
