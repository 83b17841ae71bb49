//! A rectangular `channels x samples` user buffer.
//!
//! Modeled as a single contiguous vector with row indexing rather than
//! a vector of vectors, per the design notes' "2-D accessors as vectors
//! of vectors -> contiguous buffer with bounds-checked per-channel
//! views" rework.

#[derive(Debug, Clone, PartialEq)]
pub struct Buffer<T> {
    data: Vec<T>,
    n_channels: usize,
    n_elements_per_channel: usize,
}

impl<T: Clone + Default> Buffer<T> {
    pub fn new(n_channels: usize, n_elements_per_channel: usize) -> Self {
        Buffer {
            data: vec![T::default(); n_channels * n_elements_per_channel],
            n_channels,
            n_elements_per_channel,
        }
    }
}

impl<T> Buffer<T> {
    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    pub fn n_elements_per_channel(&self) -> usize {
        self.n_elements_per_channel
    }

    pub fn channel(&self, index: usize) -> &[T] {
        let start = index * self.n_elements_per_channel;
        &self.data[start..start + self.n_elements_per_channel]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [T] {
        let start = index * self.n_elements_per_channel;
        let end = start + self.n_elements_per_channel;
        &mut self.data[start..end]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[T]> {
        (0..self.n_channels).map(move |i| self.channel(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_views_are_disjoint_slices() {
        let mut buf: Buffer<i32> = Buffer::new(2, 3);
        buf.channel_mut(0).copy_from_slice(&[1, 2, 3]);
        buf.channel_mut(1).copy_from_slice(&[4, 5, 6]);
        assert_eq!(buf.channel(0), [1, 2, 3]);
        assert_eq!(buf.channel(1), [4, 5, 6]);
    }
}
