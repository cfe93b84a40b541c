//! Bounded FIFO read-ahead buffer shared by both backends

use std::collections::VecDeque;

use crate::job::Row;

#[derive(Debug)]
pub struct RowBuffer {
    rows: VecDeque<Row>,
    capacity: usize,
    high_water_mark: usize,
}

impl RowBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            rows: VecDeque::new(),
            capacity,
            high_water_mark: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Free slots left before the buffer is full
    pub fn remaining(&self) -> usize {
        self.capacity - self.rows.len()
    }

    /// Largest number of rows ever resident at once
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Move up to `limit` rows from the front of `source` into the buffer,
    /// never past capacity. Returns the number moved.
    pub fn drain_from(&mut self, source: &mut VecDeque<Row>, limit: usize) -> usize {
        let take = limit.min(self.remaining()).min(source.len());
        self.rows.extend(source.drain(..take));
        self.high_water_mark = self.high_water_mark.max(self.rows.len());
        take
    }

    pub fn pop(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FieldValue;

    fn rows(n: i64) -> VecDeque<Row> {
        (0..n).map(|i| Row::new(vec![FieldValue::Int64(i)])).collect()
    }

    #[test]
    fn test_drain_respects_capacity_and_limit() {
        let mut buffer = RowBuffer::new(4);
        let mut source = rows(10);

        assert_eq!(buffer.drain_from(&mut source, 3), 3);
        assert_eq!(buffer.drain_from(&mut source, 10), 1);
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.remaining(), 0);
        assert_eq!(source.len(), 6);
        assert_eq!(buffer.high_water_mark(), 4);
    }

    #[test]
    fn test_fifo_order() {
        let mut buffer = RowBuffer::new(10);
        let mut source = rows(3);
        buffer.drain_from(&mut source, 3);
        let first = buffer.pop().unwrap();
        assert_eq!(first.get(0), Some(&FieldValue::Int64(0)));
        assert_eq!(buffer.len(), 2);
    }
}
