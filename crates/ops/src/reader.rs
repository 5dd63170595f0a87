//! The seam format readers plug into: stage a block of units, edges, and
//! features through the [`StagingBuffer`], commit at each block boundary,
//! abandon unusable blocks without giving up on the file.

use crate::{BlockError, Error, Result};
use corpus::StagingBuffer;
use std::collections::BTreeMap;
use std::io::BufRead;

/// An object-safe format reader. `location` names the input (usually the
/// file path) for error messages.
pub trait Reader {
    fn read(
        &mut self,
        input: &mut dyn BufRead,
        buffer: &mut StagingBuffer,
        location: &str,
    ) -> Result<()>;
}

/// A line-oriented format: blocks are runs of lines between boundaries
/// (blank lines by default). Implementations stage one line at a time and
/// [`read_lines`] drives the block loop.
pub trait LineFormat {
    fn is_boundary(&self, line: &str) -> bool {
        line.is_empty()
    }

    /// Whether boundary lines are also fed to `process_line`.
    fn include_boundaries(&self) -> bool {
        false
    }

    /// Primary parent assigned to staged units that name none.
    fn parent_if_missing(&self) -> Option<i64> {
        None
    }

    fn reset(&mut self);

    fn process_line(
        &mut self,
        line: &str,
        buffer: &mut StagingBuffer,
    ) -> std::result::Result<(), BlockError>;
}

/// Drive a [`LineFormat`] over an input stream. A block that fails —
/// whether while staging a line or while flushing — is logged with its
/// start position and discarded; reading resumes at the next boundary.
pub fn read_lines<F: LineFormat>(
    format: &mut F,
    input: &mut dyn BufRead,
    buffer: &mut StagingBuffer,
    location: &str,
) -> Result<()> {
    let mut block_error = false;
    let mut block_start = 1usize;
    format.reset();
    for (index, line) in input.lines().enumerate() {
        let number = index + 1;
        let line = line?;
        let line = line.trim();
        if format.is_boundary(line) {
            if !block_error {
                finish_block(format, buffer, location, block_start)?;
            }
            format.reset();
            block_error = false;
            block_start = number + 1;
            if !format.include_boundaries() {
                continue;
            }
        }
        if block_error {
            continue;
        }
        if let Err(err) = format.process_line(line, buffer) {
            match err {
                BlockError::Abandoned(message) => {
                    tracing::error!(
                        "{}, line {}: {}; abandoning the block starting at line {}",
                        location,
                        number,
                        message,
                        block_start
                    );
                    buffer.discard_block();
                    block_error = true;
                }
                BlockError::Fatal(err) => return Err(err),
            }
        }
    }
    if !block_error {
        finish_block(format, buffer, location, block_start)?;
    }
    Ok(())
}

fn finish_block<F: LineFormat>(
    format: &mut F,
    buffer: &mut StagingBuffer,
    location: &str,
    block_start: usize,
) -> Result<()> {
    match buffer.finish_block(format.parent_if_missing(), false) {
        Ok(()) => Ok(()),
        // Incomplete staging is fatal to the block, not the file.
        Err(err @ (corpus::Error::UntypedUnit(_) | corpus::Error::UnresolvedRef(_))) => {
            tracing::error!(
                "{}: unable to import the block starting at line {}: {}",
                location,
                block_start,
                err
            );
            buffer.discard_block();
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Adapter running any [`LineFormat`] as a [`Reader`].
pub struct LineReader<F>(pub F);

impl<F: LineFormat> Reader for LineReader<F> {
    fn read(
        &mut self,
        input: &mut dyn BufRead,
        buffer: &mut StagingBuffer,
        location: &str,
    ) -> Result<()> {
        read_lines(&mut self.0, input, buffer, location)
    }
}

/// Explicit reader registry, keyed by format identifier.
#[derive(Default)]
pub struct Readers {
    entries: BTreeMap<String, Box<dyn Fn() -> Box<dyn Reader>>>,
}

impl Readers {
    pub fn new() -> Readers {
        Readers::default()
    }

    pub fn register(
        &mut self,
        identifier: impl Into<String>,
        factory: impl Fn() -> Box<dyn Reader> + 'static,
    ) {
        self.entries.insert(identifier.into(), Box::new(factory));
    }

    pub fn create(&self, identifier: &str) -> Result<Box<dyn Reader>> {
        self.entries
            .get(identifier)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownFormat(identifier.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}
