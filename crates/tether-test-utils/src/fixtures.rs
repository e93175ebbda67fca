use anyhow::Result;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch files fed to session subprocesses
pub struct TestFixtures {
    temp_dir: TempDir,
}

impl TestFixtures {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp_dir: TempDir::new()?,
        })
    }

    pub fn write_file(&self, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Write an executable script
    pub fn create_test_script(&self, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.write_file(name, content)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// Terminal output samples
pub mod data {
    /// Multi-byte characters that straddle small read buffers
    pub const UNICODE_TEST: &str = "🦀 Rust 日本語 العربية\n";

    pub const ANSI_COLORS: &str = "\x1b[31mRed\x1b[0m \x1b[32mGreen\x1b[0m \x1b[34mBlue\x1b[0m\n";

    pub fn generate_text_lines(count: usize) -> String {
        (0..count)
            .map(|i| format!("Line {i}: The quick brown fox jumps over the lazy dog"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Plain lines followed by Unicode and colored text, newline-terminated
    pub fn mixed_payload(lines: usize) -> String {
        let mut content = generate_text_lines(lines);
        content.push('\n');
        content.push_str(UNICODE_TEST);
        content.push_str(ANSI_COLORS);
        content
    }
}
