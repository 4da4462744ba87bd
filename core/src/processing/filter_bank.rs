use crate::prelude::{StreamError, StreamResult};
use crate::processing::biquad::{FilterDesign, FilterSpec, Section};
use ndarray::{Array2, ArrayView2, ArrayViewMut1, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an active filter, unique within one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterId(pub u64);

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "filter#{}", self.0)
    }
}

/// Delay line of one filter instance: `[x1, x2, y1, y2]` for every
/// section of every channel.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    sections: usize,
    delays: Vec<[f64; 4]>,
    primed: bool,
}

impl FilterState {
    pub fn new(channels: usize, sections: usize) -> Self {
        Self {
            sections,
            delays: vec![[0.0; 4]; channels * sections],
            primed: false,
        }
    }

    pub fn reset(&mut self) {
        self.delays.iter_mut().for_each(|d| *d = [0.0; 4]);
        self.primed = false;
    }

    pub fn delays(&self, channel: usize) -> &[[f64; 4]] {
        &self.delays[channel * self.sections..(channel + 1) * self.sections]
    }

    /// Loads the delay line as if `value` had been the input forever.
    fn prime_channel(&mut self, sections: &[Section], channel: usize, value: f64) {
        let mut input = value;
        for (delay, section) in self.delays[channel * self.sections..]
            .iter_mut()
            .zip(sections)
        {
            let output = input * section.dc_gain();
            *delay = [input, input, output, output];
            input = output;
        }
    }

    fn run_channel(&mut self, sections: &[Section], channel: usize, mut column: ArrayViewMut1<f64>) {
        let delays = &mut self.delays[channel * self.sections..(channel + 1) * self.sections];
        for value in column.iter_mut() {
            let mut x = *value;
            for (delay, section) in delays.iter_mut().zip(sections) {
                let [x1, x2, y1, y2] = *delay;
                let y = section.b[0] * x + section.b[1] * x1 + section.b[2] * x2
                    - section.a[0] * y1
                    - section.a[1] * y2;
                *delay = [x, x1, y, y1];
                x = y;
            }
            *value = x;
        }
    }
}

struct ActiveFilter {
    id: FilterId,
    design: FilterDesign,
    state: FilterState,
}

/// Ordered cascade of filters applied channel-independently to each chunk.
pub struct FilterBank {
    channels: usize,
    prime: bool,
    filters: Vec<ActiveFilter>,
}

impl FilterBank {
    pub fn new(channels: usize, prime: bool) -> Self {
        Self {
            channels,
            prime,
            filters: Vec::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Active filters in application order.
    pub fn active(&self) -> Vec<(FilterId, FilterSpec)> {
        self.filters
            .iter()
            .map(|filter| (filter.id, filter.design.spec().clone()))
            .collect()
    }

    pub fn state(&self, id: FilterId) -> Option<&FilterState> {
        self.filters
            .iter()
            .find(|filter| filter.id == id)
            .map(|filter| &filter.state)
    }

    /// Appends a filter to the end of the cascade with fresh state.
    pub fn add(&mut self, id: FilterId, design: FilterDesign) -> StreamResult<()> {
        if self.filters.iter().any(|filter| filter.id == id) {
            return Err(StreamError::InvalidFilter(format!("{} already active", id)));
        }
        let state = FilterState::new(self.channels, design.sections().len());
        self.filters.push(ActiveFilter { id, design, state });
        Ok(())
    }

    /// Drops a filter and its state.
    pub fn remove(&mut self, id: FilterId) -> Option<FilterDesign> {
        let position = self.filters.iter().position(|filter| filter.id == id)?;
        Some(self.filters.remove(position).design)
    }

    pub fn reset(&mut self) {
        self.filters
            .iter_mut()
            .for_each(|filter| filter.state.reset());
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    /// Runs one chunk through every filter in order.
    ///
    /// The chunk is validated before any state is touched, so a rejected
    /// chunk leaves every delay line exactly as it was.
    pub fn apply(&mut self, chunk: ArrayView2<f32>) -> StreamResult<Array2<f32>> {
        if chunk.ncols() != self.channels {
            return Err(StreamError::ChannelLayoutChanged {
                expected: self.channels,
                actual: chunk.ncols(),
            });
        }
        if chunk.nrows() == 0 {
            return Ok(Array2::zeros((0, self.channels)));
        }
        if let Some(((sample, channel), _)) =
            chunk.indexed_iter().find(|(_, value)| !value.is_finite())
        {
            return Err(StreamError::NonFiniteInput { sample, channel });
        }
        if self.filters.is_empty() {
            return Ok(chunk.to_owned());
        }

        let mut work = chunk.mapv(f64::from);
        for filter in &mut self.filters {
            let sections = filter.design.sections();
            if self.prime && !filter.state.primed {
                for channel in 0..self.channels {
                    filter
                        .state
                        .prime_channel(sections, channel, work[[0, channel]]);
                }
            }
            filter.state.primed = true;
            for (channel, column) in work.axis_iter_mut(Axis(1)).enumerate() {
                filter.state.run_channel(sections, channel, column);
            }
        }
        Ok(work.mapv(|value| value as f32))
    }
}
