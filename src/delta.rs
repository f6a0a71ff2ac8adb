//! Running-sum codecs for the delta-encoded fields of PBF blocks.

/// Turns absolute values into deltas against the previous value.
#[derive(Debug, Default)]
pub struct DeltaEncode {
    last: i64,
}

impl DeltaEncode {
    pub fn update(&mut self, value: i64) -> i64 {
        let delta = value - self.last;
        self.last = value;
        delta
    }
}

/// Turns deltas back into absolute values by prefix summing.
#[derive(Debug, Default)]
pub struct DeltaDecode {
    sum: i64,
}

impl DeltaDecode {
    pub fn update(&mut self, delta: i64) -> i64 {
        self.sum += delta;
        self.sum
    }
}
