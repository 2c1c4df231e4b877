use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

#[derive(Debug, Parser)]
#[command(author, version, long_about = "AI Code Review Patch Bot")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Analyze changed PR files and post one review comment per finding.
    Analyze {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        pr: u64,
        /// Lowest severity worth a comment (LOW, MEDIUM, HIGH, CRITICAL).
        #[arg(long, default_value = "LOW")]
        min_severity: String,
    },
    /// Gate an /apply-fix reply: only 'analyzed' parent comments may proceed.
    CheckTrigger {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        pr: u64,
        /// Comment that triggered the workflow (the reply).
        #[arg(long)]
        comment_id: u64,
        #[arg(long, default_value = "apply-trigger.json")]
        output_file: String,
    },
    /// Apply the patch embedded in an issue comment to the working tree.
    Apply {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        comment_id: Option<u64>,
        /// Trigger context JSON written by check-trigger; supplies the
        /// parent comment id (alternative to --comment-id).
        #[arg(long)]
        context_file: Option<String>,
    },
    /// Set a comment's lifecycle state (analyzed, applied, gc-integrated).
    SetState {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        comment_id: u64,
        #[arg(long)]
        state: String,
    },
    /// Refresh downstream patches on the same file after one was applied.
    Refresh {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        pr: u64,
        #[arg(long)]
        applied_comment_id: u64,
    },
}

pub fn append_with_newline(new_str: &str, buffer: &mut String) {
    buffer.push_str("\n");
    buffer.push_str(new_str);
}

/// SHA-256 of a file's bytes, as a lowercase hex digest.
pub fn sha256_hex(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Append a `key=value` pair to the file named by $GITHUB_OUTPUT.
/// No-op outside of GitHub Actions.
pub fn set_github_output(key: &str, value: &str) -> io::Result<()> {
    let Ok(path) = env::var("GITHUB_OUTPUT") else {
        return Ok(());
    };
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}={}", key, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn sha256_hex_of_known_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello\n").unwrap();
        let digest = sha256_hex(file.path()).unwrap();
        assert_eq!(
            digest,
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn sha256_hex_missing_file() {
        assert!(sha256_hex(Path::new("/nonexistent/patchbot-test")).is_err());
    }
}
