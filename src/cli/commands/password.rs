//! Password hashing for static user directory entries.

use crate::cli::args::HashPasswordArgs;
use crate::domain::hash_password;
use anyhow::{bail, Context, Result};
use std::io::BufRead;
use zeroize::Zeroizing;

pub fn run_hash_password(args: HashPasswordArgs) -> Result<()> {
    let password = match args.password {
        Some(password) => Zeroizing::new(password),
        None => {
            let mut line = Zeroizing::new(String::new());
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("read password from stdin")?;
            Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string())
        }
    };
    if password.is_empty() {
        bail!("password is empty");
    }
    let hash = hash_password(password.as_bytes(), argon2::Params::default())
        .map_err(|e| anyhow::anyhow!("hash password: {e}"))?;
    println!("{hash}");
    Ok(())
}
