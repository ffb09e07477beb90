//! Input filter chain
//!
//! Filters see every inbound block before it reaches the caller. Each one may
//! rewrite the buffer in place and shorten it, or reject the block outright.

use std::fmt;

/// A single stage of the input filter chain
pub trait InputFilter {
    /// Adjust `buffer[..length]` in place
    ///
    /// Returns the new length, or `None` to reject the block.
    fn filter(&self, endpoint: u8, buffer: &mut [u8], length: usize) -> Option<usize>;
}

impl<F> InputFilter for F
where
    F: Fn(u8, &mut [u8], usize) -> Option<usize>,
{
    fn filter(&self, endpoint: u8, buffer: &mut [u8], length: usize) -> Option<usize> {
        self(endpoint, buffer, length)
    }
}

/// Ordered list of input filters
#[derive(Default)]
pub struct InputFilters {
    filters: Vec<Box<dyn InputFilter>>,
}

impl InputFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F: InputFilter + 'static>(&mut self, filter: F) {
        self.filters.push(Box::new(filter));
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run every filter in order
    ///
    /// Stops at the first rejection. Lengths are clamped to the buffer.
    pub fn apply(&self, endpoint: u8, buffer: &mut [u8], length: usize) -> Option<usize> {
        let mut length = length.min(buffer.len());
        for filter in &self.filters {
            length = filter.filter(endpoint, buffer, length)?.min(buffer.len());
        }
        Some(length)
    }
}

impl fmt::Debug for InputFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputFilters")
            .field("count", &self.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chain_is_identity() {
        let filters = InputFilters::new();
        let mut buffer = [1, 2, 3];
        assert_eq!(filters.apply(0x81, &mut buffer, 3), Some(3));
        assert_eq!(buffer, [1, 2, 3]);
    }

    #[test]
    fn test_filters_run_in_order() {
        let mut filters = InputFilters::new();
        // strip a leading report id
        filters.push(|_endpoint: u8, buffer: &mut [u8], length: usize| -> Option<usize> {
            buffer.copy_within(1..length, 0);
            Some(length - 1)
        });
        filters.push(|_endpoint: u8, buffer: &mut [u8], length: usize| -> Option<usize> {
            buffer[..length].iter_mut().for_each(|b| *b ^= 0xff);
            Some(length)
        });

        let mut buffer = [0x01, 0x00, 0x0f];
        assert_eq!(filters.apply(0x81, &mut buffer, 3), Some(2));
        assert_eq!(&buffer[..2], &[0xff, 0xf0]);
    }

    #[test]
    fn test_rejection_stops_chain() {
        let mut filters = InputFilters::new();
        filters.push(|_: u8, _: &mut [u8], _: usize| -> Option<usize> { None });
        filters.push(|_: u8, buffer: &mut [u8], length: usize| -> Option<usize> {
            buffer[0] = 0xaa;
            Some(length)
        });

        let mut buffer = [0u8; 4];
        assert_eq!(filters.apply(0x82, &mut buffer, 4), None);
        assert_eq!(buffer[0], 0);
    }

    #[test]
    fn test_length_clamped_to_buffer() {
        let mut filters = InputFilters::new();
        filters.push(|_: u8, _: &mut [u8], _: usize| -> Option<usize> { Some(100) });
        let mut buffer = [0u8; 4];
        assert_eq!(filters.apply(0x81, &mut buffer, 4), Some(4));
    }
}
