//! Per-node sample history.
//!
//! Each expression node keeps `nsmpls` samples of `tspan` values. Sample 0 is
//! always the newest. [`RingBuffer::rotate`] recycles the oldest slot as the
//! new sample 0 by moving the head index, so no value data is copied.

use vigil_common::types::{RealTime, Sem, Truth};

#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Num(Vec<f64>),
    Truth(Vec<Truth>),
}

impl Values {
    fn missing(boolean: bool, n: usize) -> Self {
        if boolean {
            Values::Truth(vec![Truth::Unknown; n])
        } else {
            Values::Num(vec![f64::NAN; n])
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Values::Num(v) => v.len(),
            Values::Truth(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self) {
        match self {
            Values::Num(v) => v.fill(f64::NAN),
            Values::Truth(v) => v.fill(Truth::Unknown),
        }
    }

    fn resize(&mut self, n: usize) {
        match self {
            Values::Num(v) => v.resize(n, f64::NAN),
            Values::Truth(v) => v.resize(n, Truth::Unknown),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub stamp: RealTime,
    pub values: Values,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RingBuffer {
    slots: Vec<Sample>,
    head: usize,
    boolean: bool,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(Sem::Unknown, 0, 1)
    }
}

impl RingBuffer {
    /// Allocates `nsmpls` samples of `tspan` missing values. Boolean nodes
    /// store [`Truth`] values, everything else stores `f64`.
    pub fn new(sem: Sem, tspan: usize, nsmpls: usize) -> Self {
        let boolean = sem == Sem::Boolean;
        let slots = (0..nsmpls.max(1))
            .map(|_| Sample {
                stamp: 0.0,
                values: Values::missing(boolean, tspan),
            })
            .collect();
        Self {
            slots,
            head: 0,
            boolean,
        }
    }

    pub fn is_boolean(&self) -> bool {
        self.boolean
    }

    /// Number of samples held.
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn tspan(&self) -> usize {
        self.slots.first().map_or(0, |s| s.values.len())
    }

    /// Makes the oldest sample the new sample 0, ready to be overwritten.
    pub fn rotate(&mut self) {
        let n = self.slots.len();
        if n > 1 {
            self.head = (self.head + n - 1) % n;
        }
    }

    fn slot(&self, i: usize) -> usize {
        (self.head + i) % self.slots.len()
    }

    pub fn sample(&self, i: usize) -> &Sample {
        &self.slots[self.slot(i)]
    }

    pub fn sample_mut(&mut self, i: usize) -> &mut Sample {
        let idx = self.slot(i);
        &mut self.slots[idx]
    }

    pub fn stamp(&self, i: usize) -> RealTime {
        self.sample(i).stamp
    }

    /// Numeric values of sample `i`; empty for boolean buffers.
    pub fn num(&self, i: usize) -> &[f64] {
        match &self.sample(i).values {
            Values::Num(v) => v,
            Values::Truth(_) => &[],
        }
    }

    pub fn num_mut(&mut self, i: usize) -> &mut [f64] {
        match &mut self.sample_mut(i).values {
            Values::Num(v) => v,
            Values::Truth(_) => &mut [],
        }
    }

    /// Boolean values of sample `i`; empty for numeric buffers.
    pub fn truth(&self, i: usize) -> &[Truth] {
        match &self.sample(i).values {
            Values::Truth(v) => v,
            Values::Num(_) => &[],
        }
    }

    pub fn truth_mut(&mut self, i: usize) -> &mut [Truth] {
        match &mut self.sample_mut(i).values {
            Values::Truth(v) => v,
            Values::Num(_) => &mut [],
        }
    }

    /// Value `j` of sample `i` as a number, NaN when absent or unknown.
    pub fn get_f64(&self, i: usize, j: usize) -> f64 {
        match &self.sample(i).values {
            Values::Num(v) => v.get(j).copied().unwrap_or(f64::NAN),
            Values::Truth(v) => v.get(j).map_or(f64::NAN, |t| t.as_f64()),
        }
    }

    /// Value `j` of sample `i` as a truth value; numbers are true when
    /// non-zero.
    pub fn get_truth(&self, i: usize, j: usize) -> Truth {
        match &self.sample(i).values {
            Values::Truth(v) => v.get(j).copied().unwrap_or(Truth::Unknown),
            Values::Num(v) => match v.get(j) {
                Some(x) if !x.is_nan() => Truth::from_bool(*x != 0.0),
                _ => Truth::Unknown,
            },
        }
    }

    /// Marks every value of every sample as missing.
    pub fn clear(&mut self) {
        for s in &mut self.slots {
            s.values.clear();
        }
    }

    /// Marks sample `i` as missing.
    pub fn clear_sample(&mut self, i: usize) {
        self.sample_mut(i).values.clear();
    }

    /// Changes the number of values per sample. Values at positions that
    /// exist in both shapes are kept in place; new positions start missing.
    pub fn reshape(&mut self, tspan: usize) {
        for s in &mut self.slots {
            s.values.resize(tspan);
        }
    }

    /// Changes the number of samples held, discarding all history.
    pub fn resize(&mut self, nsmpls: usize) {
        let tspan = self.tspan();
        let sem = if self.boolean { Sem::Boolean } else { Sem::Unknown };
        *self = RingBuffer::new(sem, tspan, nsmpls);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_evicts_after_depth_writes() {
        let mut ring = RingBuffer::new(Sem::Instant, 1, 3);
        for k in 0..5 {
            ring.rotate();
            ring.num_mut(0)[0] = k as f64;
            ring.sample_mut(0).stamp = k as f64;
        }
        assert_eq!(ring.num(0), &[4.0]);
        assert_eq!(ring.num(1), &[3.0]);
        assert_eq!(ring.num(2), &[2.0]);
        // the sample written at cycle k is gone after depth more rotations
        assert!((0..3).all(|i| ring.num(i)[0] != 1.0));
    }

    #[test]
    fn boolean_buffers_hold_truth_values() {
        let mut ring = RingBuffer::new(Sem::Boolean, 2, 1);
        assert!(ring.is_boolean());
        assert_eq!(ring.truth(0), &[Truth::Unknown, Truth::Unknown]);
        ring.truth_mut(0)[1] = Truth::True;
        assert_eq!(ring.get_truth(0, 1), Truth::True);
        assert_eq!(ring.get_f64(0, 1), 1.0);
        assert!(ring.num(0).is_empty());
    }

    #[test]
    fn reshape_keeps_existing_positions() {
        let mut ring = RingBuffer::new(Sem::Instant, 2, 2);
        ring.num_mut(0).copy_from_slice(&[1.0, 2.0]);
        ring.rotate();
        ring.num_mut(0).copy_from_slice(&[3.0, 4.0]);

        ring.reshape(3);
        assert_eq!(ring.tspan(), 3);
        assert_eq!(&ring.num(0)[..2], &[3.0, 4.0]);
        assert_eq!(&ring.num(1)[..2], &[1.0, 2.0]);
        assert!(ring.num(1)[2].is_nan());

        ring.resize(4);
        assert_eq!(ring.depth(), 4);
        assert!(ring.num(0)[0].is_nan());
    }
}
