/// Fixed-capacity FIFO ring.
pub struct Fifo<T: Copy + PartialEq, const N: usize> {
    items: [Option<T>; N],
    head: usize,
    len: usize,
}

impl<T: Copy + PartialEq, const N: usize> Fifo<T, N> {
    pub const fn new() -> Self {
        Self {
            items: [None; N],
            head: 0,
            len: 0,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append at the tail; hands the item back if the ring is full.
    pub fn push_back(&mut self, item: T) -> Result<(), T> {
        if self.len == N {
            return Err(item);
        }
        self.items[(self.head + self.len) % N] = Some(item);
        self.len += 1;
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.items[self.head].take();
        self.head = (self.head + 1) % N;
        self.len -= 1;
        item
    }

    /// Drop the first occurrence of `item`, keeping the order of the rest.
    pub fn remove(&mut self, item: T) -> bool {
        let Some(pos) = self.iter().position(|x| x == item) else {
            return false;
        };
        for i in pos..self.len - 1 {
            self.items[(self.head + i) % N] = self.items[(self.head + i + 1) % N];
        }
        self.items[(self.head + self.len - 1) % N] = None;
        self.len -= 1;
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).filter_map(move |i| self.items[(self.head + i) % N])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_around() {
        let mut q = Fifo::<u8, 3>::new();
        for round in 0..5 {
            assert_eq!(q.push_back(round), Ok(()));
            assert_eq!(q.push_back(round + 10), Ok(()));
            assert_eq!(q.pop_front(), Some(round));
            assert_eq!(q.pop_front(), Some(round + 10));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn full_ring_refuses() {
        let mut q = Fifo::<u8, 2>::new();
        q.push_back(1).unwrap();
        q.push_back(2).unwrap();
        assert_eq!(q.push_back(3), Err(3));
    }

    #[test]
    fn remove_keeps_order() {
        let mut q = Fifo::<u8, 4>::new();
        q.push_back(9).unwrap();
        q.pop_front();
        for x in [1, 2, 3, 4] {
            q.push_back(x).unwrap();
        }
        assert!(q.remove(2));
        assert!(!q.remove(7));
        assert_eq!(q.iter().collect::<Vec<_>>(), [1, 3, 4]);
        q.push_back(5).unwrap();
        assert_eq!(q.iter().collect::<Vec<_>>(), [1, 3, 4, 5]);
    }
}
