#![forbid(unsafe_code)]

//! Process safety helpers for the mirror binary.

use anyhow::{Result, bail};
use nix::unistd::Uid;

const VISIBLE_SUFFIX: usize = 4;

/// Fails fast when the mirror is started as root. Downloads, staging and the
/// state database should belong to a regular user or service account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Masks a token or API key for log output, keeping the last few characters
/// so operators can tell credentials apart.
pub fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.trim().chars().collect();
    if chars.len() <= VISIBLE_SUFFIX * 2 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - VISIBLE_SUFFIX..].iter().collect();
    format!("****{tail}")
}
