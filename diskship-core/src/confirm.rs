//! The optional yes/no gate in front of the destination.
use std::io::{BufRead, Write};

use indicatif::HumanBytes;

use crate::error::{Error, Result};
use crate::request::ObjectPath;

/// Asks whether an export may write to its destination.
pub trait Confirm {
    /// Show what is about to happen and return `true` to proceed.
    fn confirm(&mut self, destination: &ObjectPath, disk_size: u64) -> Result<bool>;
}

/// Whether an answer counts as a yes: `y` or `yes`, in any case.
pub fn is_affirmative(answer: &str) -> bool {
    let answer = answer.trim();
    answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
}

/// A plain line-based prompt over any reader and writer.
pub struct LinePrompt<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> LinePrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> Confirm for LinePrompt<R, W> {
    fn confirm(&mut self, destination: &ObjectPath, disk_size: u64) -> Result<bool> {
        write!(
            self.output,
            "Export {} ({disk_size} bytes) to {destination}? [y/N] ",
            HumanBytes(disk_size)
        )
        .and_then(|_| self.output.flush())
        .map_err(Error::Prompt)?;

        let mut answer = String::new();
        self.input.read_line(&mut answer).map_err(Error::Prompt)?;
        Ok(is_affirmative(&answer))
    }
}
