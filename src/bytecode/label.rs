/// Deferred jump target.
///
/// A label has no address of its own. It is used as the operand of jump-class
/// instructions and placed exactly once in the stream as an `Op::Label`
/// marker; the serializer turns it into a concrete offset.
///
/// Labels are small integers handed out by a `LabelAllocator`, so two labels
/// are equal only if they came from the same allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(u32);

impl Label {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct LabelAllocator {
    next: u32,
}

impl LabelAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> Label {
        let label = Label(self.next);
        self.next += 1;
        label
    }

    /// Number of labels handed out so far.
    pub fn allocated(&self) -> usize {
        self.next as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_labels_are_distinct() {
        let mut labels = LabelAllocator::new();
        let a = labels.fresh();
        let b = labels.fresh();

        assert_ne!(a, b);
        assert_eq!(a, a);
        assert_eq!(labels.allocated(), 2);
    }

    #[test]
    fn test_display() {
        let mut labels = LabelAllocator::new();
        labels.fresh();
        assert_eq!(labels.fresh().to_string(), "L1");
    }
}
