//! Re-blocking of arbitrarily sized audio buffers into fixed blocks.

use std::collections::VecDeque;

use syncap_sample_model::{AudioBlock, Captured};

/// Collects interleaved S16LE buffers and cuts them into blocks of
/// `block_frames` frames, each stamped with the native time of its first
/// frame.
///
/// A buffer whose timestamp is off from where the pending bytes end by
/// more than half a block starts a new run: the bytes before it go out as
/// a short block and timing re-anchors on the new buffer.
#[cfg_attr(not(feature = "gstreamer"), allow(dead_code))]
#[derive(Debug)]
pub(crate) struct BlockAssembler {
    sample_rate: u32,
    channels: u16,
    block_frames: u32,
    pending: Vec<u8>,
    /// Native time of the first byte in `pending`.
    pending_start_ns: Option<u64>,
    ready: VecDeque<Captured<AudioBlock>>,
}

#[cfg_attr(not(feature = "gstreamer"), allow(dead_code))]
impl BlockAssembler {
    pub fn new(sample_rate: u32, channels: u16, block_frames: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            block_frames: block_frames.max(1),
            pending: Vec::new(),
            pending_start_ns: None,
            ready: VecDeque::new(),
        }
    }

    fn frame_bytes(&self) -> usize {
        self.channels as usize * 2
    }

    fn block_bytes(&self) -> usize {
        self.block_frames as usize * self.frame_bytes()
    }

    fn frames_to_ns(&self, frames: usize) -> u64 {
        frames as u64 * 1_000_000_000 / self.sample_rate as u64
    }

    /// Add one buffer captured at `pts_ns`.
    pub fn push(&mut self, pts_ns: u64, data: &[u8]) {
        if let Some(start) = self.pending_start_ns {
            let expected = start + self.frames_to_ns(self.pending.len() / self.frame_bytes());
            let tolerance = self.frames_to_ns(self.block_frames as usize) / 2;
            if pts_ns.abs_diff(expected) > tolerance {
                tracing::debug!(expected, pts_ns, "Audio timestamps jumped; re-anchoring");
                self.flush_partial();
            }
        }
        if self.pending.is_empty() {
            self.pending_start_ns = Some(pts_ns);
        }
        self.pending.extend_from_slice(data);
        self.cut_blocks();
    }

    /// Emit whatever whole frames are pending as a short block.
    pub fn flush_partial(&mut self) {
        let whole = self.pending.len() / self.frame_bytes() * self.frame_bytes();
        if let (Some(start), true) = (self.pending_start_ns, whole > 0) {
            let data: Vec<u8> = self.pending.drain(..whole).collect();
            let frames = (whole / self.frame_bytes()) as u32;
            self.ready.push_back(Captured::new(start, self.block(frames, data)));
        }
        self.pending.clear();
        self.pending_start_ns = None;
    }

    pub fn pop(&mut self) -> Option<Captured<AudioBlock>> {
        self.ready.pop_front()
    }

    /// Nothing left to hand out, complete or partial.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.pending.len() < self.frame_bytes()
    }

    fn cut_blocks(&mut self) {
        let block_bytes = self.block_bytes();
        while self.pending.len() >= block_bytes {
            let Some(start) = self.pending_start_ns else {
                return;
            };
            let data: Vec<u8> = self.pending.drain(..block_bytes).collect();
            let block = self.block(self.block_frames, data);
            self.ready.push_back(Captured::new(start, block));
            self.pending_start_ns = Some(start + self.frames_to_ns(self.block_frames as usize));
        }
        if self.pending.is_empty() {
            self.pending_start_ns = None;
        }
    }

    fn block(&self, frames: u32, data: Vec<u8>) -> AudioBlock {
        AudioBlock {
            sample_rate: self.sample_rate,
            channels: self.channels,
            frames,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1 kHz mono: one frame is 2 bytes and 1 ms.
    fn assembler() -> BlockAssembler {
        BlockAssembler::new(1_000, 1, 4)
    }

    #[test]
    fn test_blocks_are_cut_across_buffers() {
        let mut blocks = assembler();
        blocks.push(100_000_000, &[0; 6]);
        assert!(blocks.pop().is_none());
        blocks.push(103_000_000, &[1; 6]);

        let block = blocks.pop().unwrap();
        assert_eq!(block.native_ns, 100_000_000);
        assert_eq!(block.value.frames, 4);
        assert_eq!(block.value.data, [0, 0, 0, 0, 0, 0, 1, 1]);
        assert!(blocks.pop().is_none());
        assert!(!blocks.is_empty());
    }

    #[test]
    fn test_timestamp_jump_reanchors() {
        let mut blocks = assembler();
        blocks.push(0, &[0; 6]);
        // Three frames pending end at 3 ms; this buffer starts at 50 ms.
        blocks.push(50_000_000, &[1; 8]);

        let short = blocks.pop().unwrap();
        assert_eq!(short.native_ns, 0);
        assert_eq!(short.value.frames, 3);
        let next = blocks.pop().unwrap();
        assert_eq!(next.native_ns, 50_000_000);
        assert_eq!(next.value.frames, 4);
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_small_jitter_keeps_running_timing() {
        let mut blocks = assembler();
        blocks.push(0, &[0; 4]);
        blocks.push(2_001_000, &[0; 4]);
        assert_eq!(blocks.pop().unwrap().native_ns, 0);
        blocks.push(4_000_000, &[0; 8]);
        assert_eq!(blocks.pop().unwrap().native_ns, 4_000_000);
    }

    #[test]
    fn test_tail_is_flushed_as_a_short_block() {
        let mut blocks = assembler();
        blocks.push(7_000_000, &[2; 11]);
        assert_eq!(blocks.pop().unwrap().value.frames, 4);

        blocks.flush_partial();
        let tail = blocks.pop().unwrap();
        assert_eq!(tail.native_ns, 11_000_000);
        assert_eq!(tail.value.frames, 1);
        assert_eq!(tail.value.data.len(), 2);
        // The odd byte of a half frame is dropped.
        assert!(blocks.is_empty());
    }
}
