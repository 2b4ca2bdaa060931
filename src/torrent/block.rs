//! Per-block bookkeeping the refill scheduler and scarcity maintenance
//! operate on: whether we hold it, whether its piece is do-not-download,
//! its inherited priority, how many outstanding requests we've made for
//! it, and how many connected peers advertise its containing piece.

/// A piece's download priority, inherited by every block within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Block {
    pub have: bool,
    pub dnd: bool,
    pub priority: Priority,
    pub request_count: u8,
    pub scarcity: u8,
}

impl Block {
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    pub fn bump_request_count(&mut self) {
        self.request_count = self.request_count.saturating_add(1);
    }

    pub fn bump_scarcity(&mut self) {
        self.scarcity = self.scarcity.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_count_saturates_at_255() {
        let mut block = Block::new(Priority::Normal);
        for _ in 0..300 {
            block.bump_request_count();
        }
        assert_eq!(block.request_count, 255);
    }

    #[test]
    fn scarcity_saturates_at_255() {
        let mut block = Block::new(Priority::Normal);
        for _ in 0..300 {
            block.bump_scarcity();
        }
        assert_eq!(block.scarcity, 255);
    }
}
